#![forbid(unsafe_code)]

//! ENIP encapsulation: the 24-byte framing header and the session commands
//! (ListServices, RegisterSession, UnRegisterSession, SendRRData).

use bytes::BufMut;

use crate::codec::Reader;
use crate::error::{EipError, Result};

/// Registered EtherNet/IP TCP port.
pub const DEFAULT_PORT: u16 = 0xAF12;

pub const HEADER_LEN: usize = 24;

/// Sender context is opaque to the target and echoed back.
pub const SENDER_CONTEXT: [u8; 8] = *b"AIRPLANE";

pub const CMD_NOP: u16 = 0x0000;
pub const CMD_LIST_SERVICES: u16 = 0x0004;
pub const CMD_LIST_INTERFACES: u16 = 0x0064;
pub const CMD_REGISTER_SESSION: u16 = 0x0065;
pub const CMD_UNREGISTER_SESSION: u16 = 0x0066;
pub const CMD_SEND_RR_DATA: u16 = 0x006F;
pub const CMD_SEND_UNIT_DATA: u16 = 0x0070;

/// ListServices capability flag: target encapsulates CIP PDUs over TCP.
pub const CAP_CIP_ENCAPSULATION: u16 = 1 << 5;

/// Encapsulation status values the target can return.
pub fn status_text(status: u32) -> String {
    match status {
        0x00 => "Ok".into(),
        0x01 => "invalid or unsupported command".into(),
        0x02 => "no memory on target".into(),
        0x03 => "malformed data in request".into(),
        0x64 => "invalid session id".into(),
        0x65 => "invalid data length".into(),
        0x69 => "unsupported protocol revision".into(),
        other => format!("unknown encapsulation status 0x{other:02X}"),
    }
}

/// The fixed header in front of every encapsulated message. `length`
/// counts the bytes that follow the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    pub length: u16,
    pub session: u32,
    pub status: u32,
    pub context: [u8; 8],
    pub options: u32,
}

impl Header {
    pub fn new(command: u16, session: u32, length: u16) -> Self {
        Self {
            command,
            length,
            session,
            status: 0,
            context: SENDER_CONTEXT,
            options: 0,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u16_le(self.command);
        buf.put_u16_le(self.length);
        buf.put_u32_le(self.session);
        buf.put_u32_le(self.status);
        buf.put_slice(&self.context);
        buf.put_u32_le(self.options);
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut r = Reader::new(frame);
        let command = r.get_u16()?;
        let length = r.get_u16()?;
        let session = r.get_u32()?;
        let status = r.get_u32()?;
        let mut context = [0u8; 8];
        context.copy_from_slice(r.take(8)?);
        let options = r.get_u32()?;
        Ok(Self { command, length, session, status, context, options })
    }

    /// Reject a reply that does not answer `command` with status 0.
    pub fn check(&self, command: u16) -> Result<()> {
        if self.command != command {
            return Err(EipError::Protocol(format!(
                "command echo mismatch: sent 0x{command:04X}, got 0x{:04X}",
                self.command
            )));
        }
        if self.status != 0 {
            return Err(EipError::Protocol(format!(
                "encapsulation status: {}",
                status_text(self.status)
            )));
        }
        Ok(())
    }
}

pub fn list_services_frame() -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    Header::new(CMD_LIST_SERVICES, 0, 0).encode(&mut buf);
    buf
}

/// RegisterSession: requested protocol version 1, options 0.
pub fn register_session_frame() -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 4);
    Header::new(CMD_REGISTER_SESSION, 0, 4).encode(&mut buf);
    buf.put_u16_le(1);
    buf.put_u16_le(0);
    buf
}

pub fn unregister_session_frame(session: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    Header::new(CMD_UNREGISTER_SESSION, session, 0).encode(&mut buf);
    buf
}

/// SendRRData around one unconnected MR frame: null address item plus one
/// unconnected-data item (type 0xB2).
pub fn send_rr_data_frame(session: u32, inner: &[u8]) -> Vec<u8> {
    let length = 16 + inner.len();
    let mut buf = Vec::with_capacity(HEADER_LEN + length);
    Header::new(CMD_SEND_RR_DATA, session, length as u16).encode(&mut buf);
    buf.put_u32_le(0); // interface handle
    buf.put_u16_le(0); // timeout, unused for unconnected
    buf.put_u16_le(2); // item count
    buf.put_u16_le(0); // null address item
    buf.put_u16_le(0);
    buf.put_u16_le(0x00B2); // unconnected data item
    buf.put_u16_le(inner.len() as u16);
    buf.put_slice(inner);
    buf
}

/// Pull the unconnected-data item out of a SendRRData reply body.
pub fn parse_send_rr_data(data: &[u8]) -> Result<&[u8]> {
    let mut r = Reader::new(data);
    r.skip(4)?; // interface handle
    r.skip(2)?; // timeout
    let items = r.get_u16()?;
    for _ in 0..items {
        let item_type = r.get_u16()?;
        let len = r.get_u16()? as usize;
        let body = r.take(len)?;
        if item_type == 0x00B2 {
            return Ok(body);
        }
    }
    Err(EipError::Protocol(
        "SendRRData reply carries no unconnected data item".into(),
    ))
}

/// One entry of a ListServices reply.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub service_type: u16,
    pub version: u16,
    pub flags: u16,
    pub name: String,
}

impl ServiceEntry {
    pub fn supports_cip_encapsulation(&self) -> bool {
        self.flags & CAP_CIP_ENCAPSULATION != 0
    }
}

/// Parse a ListServices reply body: count then per-service entries of
/// `{type(2), length(2), version(2), flags(2), name[16]}`.
pub fn parse_list_services(data: &[u8]) -> Result<Vec<ServiceEntry>> {
    let mut r = Reader::new(data);
    let count = r.get_u16()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let service_type = r.get_u16()?;
        let len = r.get_u16()? as usize;
        let mut body = Reader::new(r.take(len)?);
        let version = body.get_u16()?;
        let flags = body.get_u16()?;
        let raw_name = body.rest();
        let name = String::from_utf8_lossy(raw_name)
            .trim_end_matches('\0')
            .to_string();
        entries.push(ServiceEntry { service_type, version, flags, name });
    }
    Ok(entries)
}
