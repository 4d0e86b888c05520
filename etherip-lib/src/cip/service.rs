#![forbid(unsafe_code)]

//! Explicit-messaging services: ReadData, WriteData, Get_Attribute_Single,
//! the Connection-Manager Unconnected_Send envelope, and multi-request
//! bundles.

use bytes::BufMut;

use crate::cip::mr;
use crate::cip::path::{
    encode_class_path, encode_port_path, CLASS_CONNECTION_MANAGER, CLASS_MESSAGE_ROUTER,
    PORT_BACKPLANE,
};
use crate::codec::Reader;
use crate::error::{EipError, Result};

pub const SVC_MULTI_REQUEST: u8 = 0x0A;
pub const SVC_GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
pub const SVC_READ_DATA: u8 = 0x4C;
pub const SVC_WRITE_DATA: u8 = 0x4D;
pub const SVC_UNCONNECTED_SEND: u8 = 0x52;

/// Fixed timeout requested for every unconnected transaction.
pub const UCMM_TIMEOUT_MS: u32 = 245_760;

/// Largest value the tick encoding can express: 255 << 15.
pub const UCMM_TIMEOUT_MAX_MS: u32 = 8_355_840;

/// `ReadData(tag, elements)` request.
pub fn read_request(path: &[u8], elements: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(read_request_size(path.len()));
    mr::put_request(&mut buf, SVC_READ_DATA, path);
    buf.put_u16_le(elements);
    buf
}

pub fn read_request_size(path_len: usize) -> usize {
    mr::request_size(path_len, 2)
}

/// `WriteData(tag, type, elements, value)` request.
pub fn write_request(path: &[u8], type_code: u16, elements: u16, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(write_request_size(path.len(), value.len()));
    mr::put_request(&mut buf, SVC_WRITE_DATA, path);
    buf.put_u16_le(type_code);
    buf.put_u16_le(elements);
    buf.put_slice(value);
    buf
}

pub fn write_request_size(path_len: usize, value_len: usize) -> usize {
    mr::request_size(path_len, 4 + value_len)
}

/// `Get_Attribute_Single` on class/instance/attribute.
pub fn get_attribute_single(class: u8, instance: u8, attribute: u8) -> Vec<u8> {
    let mut buf = Vec::new();
    mr::put_request(
        &mut buf,
        SVC_GET_ATTRIBUTE_SINGLE,
        &encode_class_path(class, instance, attribute),
    );
    buf
}

/// Encode a millisecond timeout as `(tick_time, ticks)`: the smallest shift
/// that brings the count under 256.
pub fn encode_timeout_ticks(ms: u32) -> Result<(u8, u8)> {
    if ms > UCMM_TIMEOUT_MAX_MS {
        return Err(EipError::Parse(format!(
            "timeout {ms} ms exceeds the {UCMM_TIMEOUT_MAX_MS} ms tick encoding"
        )));
    }
    let mut tick_time = 0u8;
    while (ms >> tick_time) > 0xFF {
        tick_time += 1;
    }
    Ok((tick_time, (ms >> tick_time) as u8))
}

/// Wrap an inner MR request in `Unconnected_Send`, routed over the
/// backplane to `slot`.
pub fn unconnected_send(inner: &[u8], slot: u8) -> Result<Vec<u8>> {
    let (tick_time, ticks) = encode_timeout_ticks(UCMM_TIMEOUT_MS)?;
    let port_path = encode_port_path(PORT_BACKPLANE, slot)?;
    let mut buf = Vec::with_capacity(unconnected_send_size(inner.len()));
    mr::put_request(
        &mut buf,
        SVC_UNCONNECTED_SEND,
        &encode_class_path(CLASS_CONNECTION_MANAGER, 1, 0),
    );
    buf.put_u8(tick_time);
    buf.put_u8(ticks);
    buf.put_u16_le(inner.len() as u16);
    buf.put_slice(inner);
    if inner.len() % 2 != 0 {
        buf.put_u8(0);
    }
    buf.put_u8((port_path.len() / 2) as u8);
    buf.put_u8(0);
    buf.put_slice(&port_path);
    Ok(buf)
}

/// Total bytes `unconnected_send` produces for an inner request of this size.
pub fn unconnected_send_size(inner_len: usize) -> usize {
    // MR header+path (6) + tick pair (2) + size word (2) + inner + pad
    // + port path size/reserved (2) + port path (2)
    6 + 2 + 2 + inner_len + inner_len % 2 + 2 + 2
}

/// Bundles several MR requests behind one `MultiRequest` addressed to the
/// Message Router. Items must be appended in order; each offset is patched
/// when its request is emitted.
#[derive(Debug)]
pub struct MultiRequestBuilder {
    buf: Vec<u8>,
    count: usize,
    pushed: usize,
    count_pos: usize,
}

impl MultiRequestBuilder {
    pub fn new(count: usize) -> Self {
        let mut buf = Vec::new();
        mr::put_request(
            &mut buf,
            SVC_MULTI_REQUEST,
            &encode_class_path(CLASS_MESSAGE_ROUTER, 1, 0),
        );
        let count_pos = buf.len();
        buf.put_u16_le(count as u16);
        buf.resize(buf.len() + 2 * count, 0);
        Self { buf, count, pushed: 0, count_pos }
    }

    /// Append the next item and record its offset from the count word.
    pub fn push(&mut self, request: &[u8]) {
        assert!(self.pushed < self.count, "more items than declared");
        let offset = (self.buf.len() - self.count_pos) as u16;
        let slot = self.count_pos + 2 + 2 * self.pushed;
        self.buf[slot..slot + 2].copy_from_slice(&offset.to_le_bytes());
        self.buf.extend_from_slice(request);
        self.pushed += 1;
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        if self.pushed != self.count {
            return Err(EipError::Protocol(format!(
                "multi-request declared {} items but only {} were added",
                self.count, self.pushed
            )));
        }
        Ok(self.buf)
    }
}

/// Request bytes a multi-request spends before any item: MR header and
/// path, count word, offset table.
pub fn multi_request_overhead(count: usize) -> usize {
    6 + 2 + 2 * count
}

/// Response bytes a multi-response spends before any item: MR response
/// header, count word, offset table.
pub fn multi_response_overhead(count: usize) -> usize {
    4 + 2 + 2 * count
}

/// Split a MultiResponse data region into its per-item response frames.
/// `expected` is the item count of the request being answered.
pub fn split_multi_response(data: &[u8], expected: usize) -> Result<Vec<&[u8]>> {
    let mut r = Reader::new(data);
    let count = r.get_u16()? as usize;
    if count != expected {
        return Err(EipError::Protocol(format!(
            "multi-response has {count} items, expected {expected}"
        )));
    }
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..count {
        offsets.push(r.get_u16()? as usize);
    }
    let mut items = Vec::with_capacity(count);
    for k in 0..count {
        let start = offsets[k];
        let end = if k + 1 < count { offsets[k + 1] } else { data.len() };
        if start < 2 + 2 * count || end < start || end > data.len() {
            return Err(EipError::Protocol(format!(
                "multi-response offset table corrupt at item {k}: {start}..{end}"
            )));
        }
        items.push(&data[start..end]);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_encoding_law() {
        for ms in [0u32, 1, 255, 256, 1000, 245_760, 4_000_000, UCMM_TIMEOUT_MAX_MS] {
            let (tick_time, ticks) = encode_timeout_ticks(ms).unwrap();
            let back = u32::from(ticks) << tick_time;
            assert!(back <= ms);
            assert!(ms - back < (1 << tick_time), "ms={ms}");
            if ms > 0 {
                // smallest shift: one less would overflow the tick byte
                assert!(tick_time == 0 || (ms >> (tick_time - 1)) > 0xFF);
            }
        }
        assert_eq!(encode_timeout_ticks(245_760).unwrap(), (10, 240));
        assert!(encode_timeout_ticks(UCMM_TIMEOUT_MAX_MS + 1).is_err());
    }

    #[test]
    fn unconnected_send_layout() {
        let inner = read_request(&[0x91, 0x03, b'a', b'r', b'r', 0x00], 1);
        assert_eq!(inner.len() % 2, 0);
        let frame = unconnected_send(&inner, 3).unwrap();
        assert_eq!(frame.len(), unconnected_send_size(inner.len()));
        assert_eq!(frame[0], SVC_UNCONNECTED_SEND);
        assert_eq!(&frame[1..6], &[0x02, 0x20, 0x06, 0x24, 0x01]);
        assert_eq!(frame[6], 10); // tick_time for 245760 ms
        assert_eq!(frame[7], 240);
        assert_eq!(
            u16::from_le_bytes([frame[8], frame[9]]) as usize,
            inner.len()
        );
        assert_eq!(&frame[10..10 + inner.len()], &inner[..]);
        // even inner: port path size/reserved follow immediately
        let tail = &frame[10 + inner.len()..];
        assert_eq!(tail, &[0x01, 0x00, 0x01, 0x03]);
    }

    #[test]
    fn odd_inner_padded() {
        let inner = [0xAA, 0xBB, 0xCC];
        let frame = unconnected_send(&inner, 0).unwrap();
        assert_eq!(frame.len() % 2, 0);
        assert_eq!(&frame[10..13], &inner[..]);
        assert_eq!(frame[13], 0);
    }

    #[test]
    fn multi_request_offsets() {
        let path = [0x91, 0x01, b'x', 0x00];
        let items: Vec<Vec<u8>> = (1..=3u16).map(|n| read_request(&path, n)).collect();
        let mut b = MultiRequestBuilder::new(3);
        for item in &items {
            b.push(item);
        }
        let buf = b.finish().unwrap();
        let data = &buf[6..];
        assert_eq!(u16::from_le_bytes([data[0], data[1]]), 3);
        let off = |k: usize| u16::from_le_bytes([data[2 + 2 * k], data[3 + 2 * k]]) as usize;
        assert_eq!(off(0), 2 + 2 * 3);
        assert_eq!(off(1), off(0) + items[0].len());
        assert_eq!(off(2), off(1) + items[1].len());
        assert_eq!(off(2) + items[2].len(), data.len());
        assert_eq!(&data[off(1)..off(2)], &items[1][..]);
    }

    #[test]
    fn incomplete_multi_request_rejected() {
        let mut b = MultiRequestBuilder::new(2);
        b.push(&[0x4C, 0x00]);
        assert!(b.finish().is_err());
    }

    #[test]
    fn multi_response_split() {
        // two items: 5 and 4 bytes
        let mut data = Vec::new();
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&6u16.to_le_bytes());
        data.extend_from_slice(&11u16.to_le_bytes());
        data.extend_from_slice(&[0xCC, 0, 0, 0, 0x01]);
        data.extend_from_slice(&[0xCD, 0, 0, 0]);
        let items = split_multi_response(&data, 2).unwrap();
        assert_eq!(items[0], &[0xCC, 0, 0, 0, 0x01]);
        assert_eq!(items[1], &[0xCD, 0, 0, 0]);

        assert!(split_multi_response(&data, 3).is_err());
    }

    #[test]
    fn corrupt_offsets_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&200u16.to_le_bytes()); // beyond frame
        assert!(split_multi_response(&data, 1).is_err());
    }
}
