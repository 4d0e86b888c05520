#![forbid(unsafe_code)]

//! Message-Router request/response framing.
//!
//! Request:  `service(1) | path_size_words(1) | path_bytes`
//! Response: `service|0x80 (1) | reserved(1) | general_status(1) |
//!            ext_status_size_words(1) | ext_status[..] | data[..]`

use bytes::BufMut;

use crate::codec::Reader;
use crate::error::{EipError, Result};

/// High bit of the service byte marks a response.
pub const RESPONSE_BIT: u8 = 0x80;

/// Append an MR request for `service` on an already-encoded path.
pub fn put_request(buf: &mut Vec<u8>, service: u8, path: &[u8]) {
    debug_assert_eq!(path.len() % 2, 0, "CIP paths have even byte length");
    buf.put_u8(service);
    buf.put_u8((path.len() / 2) as u8);
    buf.put_slice(path);
}

/// Bytes an MR request with this path and payload occupies.
pub fn request_size(path_len: usize, payload_len: usize) -> usize {
    2 + path_len + payload_len
}

/// A parsed MR response frame. `data` borrows from the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct MrResponse<'a> {
    pub service: u8,
    pub general_status: u8,
    pub ext_status: &'a [u8],
    pub data: &'a [u8],
}

impl<'a> MrResponse<'a> {
    pub fn parse(frame: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(frame);
        let service = r.get_u8()?;
        r.skip(1)?;
        let general_status = r.get_u8()?;
        let ext_words = r.get_u8()? as usize;
        // data starts at 4 + 2*ext; short ext region is a malformed frame,
        // missing data just means an empty payload
        let ext_status = r.take(2 * ext_words)?;
        Ok(Self { service, general_status, ext_status, data: r.rest() })
    }

    /// Verify this frame answers `request_service` and reports success.
    pub fn check(&self, request_service: u8) -> Result<()> {
        if self.service != request_service | RESPONSE_BIT {
            return Err(EipError::Protocol(format!(
                "service echo mismatch: sent 0x{request_service:02X}, got 0x{:02X}",
                self.service
            )));
        }
        if self.general_status != 0 {
            return Err(EipError::Protocol(format!(
                "target error: {}",
                status_text(self.general_status, self.ext_status)
            )));
        }
        Ok(())
    }

    pub fn is_ok(&self) -> bool {
        self.general_status == 0
    }

    /// First extended status word, if any.
    pub fn ext_status_word(&self) -> Option<u16> {
        self.ext_status
            .get(..2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
    }
}

/// Human-readable general status. An open enum: unknown codes render with
/// their hex value and are never success.
pub fn status_text(general: u8, ext_status: &[u8]) -> String {
    let ext = ext_status
        .get(..2)
        .map(|w| u16::from_le_bytes([w[0], w[1]]));
    match (general, ext) {
        (0x00, _) => "Ok".into(),
        (0x01, Some(0x0107)) => "connection not found".into(),
        (0x01, _) => "connection failure".into(),
        (0x02, _) => "resource unavailable".into(),
        (0x04, _) => "IOI syntax error".into(),
        (0x05, _) => "destination unknown (tag does not exist?)".into(),
        (0x06, _) => "partial transfer".into(),
        (0x08, _) => "service not supported".into(),
        (0x13, _) => "not enough data".into(),
        (0x1E, _) => "embedded service error".into(),
        (0x26, _) => "invalid parameter".into(),
        (0xFF, Some(0x2104)) => "access beyond end of object".into(),
        (0xFF, Some(0x2105)) => "array index out of range".into(),
        (0xFF, Some(0x2107)) => "data type mismatch".into(),
        (g, Some(e)) => format!("unknown status 0x{g:02X} (ext 0x{e:04X})"),
        (g, None) => format!("unknown status 0x{g:02X}"),
    }
}
