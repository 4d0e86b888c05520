#![forbid(unsafe_code)]

//! IOI path encoding.
//!
//! A CIP path is a sequence of two-byte words; sizes are counted in words
//! and the encoded byte length is always even. Segment formats:
//!
//! - port:       `port, link`                      (ports 1..=14 only)
//! - class:      `0x20, class`
//! - instance:   `0x24, instance`
//! - attribute:  `0x30, attribute`
//! - symbolic:   `0x91, len, bytes.., pad to even`
//! - element:    `0x28, idx` / `0x29, 0, idx16` / `0x2A, 0, idx32`

use bytes::BufMut;

use crate::error::{EipError, Result};
use crate::tag::{TagPath, TagSegment};

/// CIP class codes used by this driver.
pub const CLASS_IDENTITY: u8 = 0x01;
pub const CLASS_MESSAGE_ROUTER: u8 = 0x02;
pub const CLASS_CONNECTION_MANAGER: u8 = 0x06;

/// Backplane port of a ControlLogix chassis.
pub const PORT_BACKPLANE: u8 = 1;

/// Encode a one-word port segment. Extended ports (>= 15) need a different
/// segment format that no ControlLogix backplane route uses.
pub fn encode_port_path(port: u8, link: u8) -> Result<Vec<u8>> {
    if port == 0 || port > 14 {
        return Err(EipError::Parse(format!("unsupported CIP port {port}")));
    }
    Ok(vec![port, link])
}

/// Class/instance and optional attribute path. `attribute == 0` omits the
/// attribute segment.
pub fn encode_class_path(class: u8, instance: u8, attribute: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.put_u8(0x20);
    buf.put_u8(class);
    buf.put_u8(0x24);
    buf.put_u8(instance);
    if attribute != 0 {
        buf.put_u8(0x30);
        buf.put_u8(attribute);
    }
    buf
}

/// Words occupied by one parsed tag segment.
fn segment_words(seg: &TagSegment) -> Result<usize> {
    match seg {
        TagSegment::Name(n) => {
            if n.is_empty() || n.len() > u8::MAX as usize {
                return Err(EipError::Parse(format!(
                    "symbolic segment '{n}' does not fit a CIP path"
                )));
            }
            Ok((2 + n.len()).div_ceil(2))
        }
        TagSegment::Element(idx) => Ok(if *idx <= u32::from(u8::MAX) {
            1
        } else if *idx <= u32::from(u16::MAX) {
            2
        } else {
            3
        }),
    }
}

/// Path size of a parsed tag in words.
pub fn tag_path_words(tag: &TagPath) -> Result<usize> {
    tag.segments().iter().map(segment_words).sum()
}

/// Encode a parsed tag as symbolic + element segments.
pub fn encode_tag_path(tag: &TagPath) -> Result<Vec<u8>> {
    let words = tag_path_words(tag)?;
    let mut buf = Vec::with_capacity(words * 2);
    for seg in tag.segments() {
        match seg {
            TagSegment::Name(n) => {
                buf.put_u8(0x91);
                buf.put_u8(n.len() as u8);
                buf.put_slice(n.as_bytes());
                if n.len() % 2 != 0 {
                    buf.put_u8(0);
                }
            }
            TagSegment::Element(idx) => {
                if *idx <= u32::from(u8::MAX) {
                    buf.put_u8(0x28);
                    buf.put_u8(*idx as u8);
                } else if *idx <= u32::from(u16::MAX) {
                    buf.put_u8(0x29);
                    buf.put_u8(0);
                    buf.put_u16_le(*idx as u16);
                } else {
                    buf.put_u8(0x2A);
                    buf.put_u8(0);
                    buf.put_u32_le(*idx);
                }
            }
        }
    }
    debug_assert_eq!(buf.len(), words * 2);
    Ok(buf)
}
