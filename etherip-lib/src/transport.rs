#![forbid(unsafe_code)]

//! TCP session to one target: connect, encapsulation handshake, identity
//! probe and framed request/reply exchange.
//!
//! Every socket operation is bounded by the configured timeout. The receive
//! buffer is a [`BytesMut`] that grows on demand and keeps its contents
//! across growth.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cip::mr::MrResponse;
use crate::cip::path::CLASS_IDENTITY;
use crate::cip::service::{self, SVC_GET_ATTRIBUTE_SINGLE};
use crate::cip::types::{CipType, TypedData};
use crate::codec::Reader;
use crate::encap::{self, Header, HEADER_LEN};
use crate::error::{EipError, Result};
use crate::tag::TagPath;

const INITIAL_RECV_CAPACITY: usize = 1024;

/// Identity-object attributes of the target, read once after the handshake.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub vendor: u16,
    pub device_type: u16,
    pub revision: u16,
    pub serial: u32,
    pub name: String,
}

/// One registered ENIP session over TCP.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
    session: u32,
    buf: BytesMut,
    body_len: usize,
}

impl Session {
    /// Resolve, connect, and run the ListServices/RegisterSession
    /// handshake. Resolve failures, connect failures and connect timeouts
    /// are reported as distinct error kinds.
    pub async fn connect(host: &str, port: u16, io_timeout: Duration) -> Result<Self> {
        let addr = resolve(host, port).await?;
        let stream = match timeout(io_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(EipError::Connect(format!("{addr}: {e}"))),
            Err(_) => return Err(EipError::Connect(format!("{addr}: connect timed out"))),
        };
        let mut session = Self {
            stream,
            peer: addr,
            timeout: io_timeout,
            session: 0,
            buf: BytesMut::with_capacity(INITIAL_RECV_CAPACITY),
            body_len: 0,
        };
        session.handshake().await?;
        Ok(session)
    }

    /// Session handle granted by RegisterSession; non-zero once connected.
    pub fn handle(&self) -> u32 {
        self.session
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn handshake(&mut self) -> Result<()> {
        let body = self
            .roundtrip(&encap::list_services_frame(), encap::CMD_LIST_SERVICES)
            .await?;
        let services = encap::parse_list_services(&body)?;
        if !services.iter().any(|s| s.supports_cip_encapsulation()) {
            return Err(EipError::Handshake(format!(
                "{} does not announce CIP PDU encapsulation",
                self.peer
            )));
        }

        let _ = self
            .roundtrip(&encap::register_session_frame(), encap::CMD_REGISTER_SESSION)
            .await?;
        let header = Header::decode(&self.buf)?;
        if header.session == 0 {
            return Err(EipError::Handshake(format!(
                "{} granted a zero session handle",
                self.peer
            )));
        }
        self.session = header.session;
        debug!(peer = %self.peer, session = format_args!("0x{:08X}", self.session), "session registered");
        Ok(())
    }

    /// Read identity attributes 1, 2, 4, 6 and 7. Each is one
    /// Get_Attribute_Single transaction.
    pub async fn probe_identity(&mut self) -> Result<Identity> {
        let vendor = self.identity_attribute(1).await?.u16()?;
        let device_type = self.identity_attribute(2).await?.u16()?;
        let revision = self.identity_attribute(4).await?.u16()?;
        let serial = self.identity_attribute(6).await?.u32()?;
        let name = self.identity_attribute(7).await?.short_string()?;
        Ok(Identity { vendor, device_type, revision, serial, name })
    }

    async fn identity_attribute(&mut self, attribute: u8) -> Result<AttributeValue> {
        let request = service::get_attribute_single(CLASS_IDENTITY, 1, attribute);
        let reply = self.transact(&request).await?;
        let resp = MrResponse::parse(&reply)?;
        resp.check(SVC_GET_ATTRIBUTE_SINGLE)?;
        Ok(AttributeValue(resp.data.to_vec()))
    }

    /// Send one MR frame inside SendRRData and return the raw MR response.
    pub async fn transact(&mut self, mr_frame: &[u8]) -> Result<Vec<u8>> {
        let frame = encap::send_rr_data_frame(self.session, mr_frame);
        let body = self.roundtrip(&frame, encap::CMD_SEND_RR_DATA).await?;
        Ok(encap::parse_send_rr_data(&body)?.to_vec())
    }

    async fn roundtrip(&mut self, frame: &[u8], expect_command: u16) -> Result<Vec<u8>> {
        self.send_frame(frame).await?;
        let header = self.recv_frame().await?;
        header.check(expect_command)?;
        Ok(self.body().to_vec())
    }

    /// Write the whole frame; a short write surfaces as an error.
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        match timeout(self.timeout, self.stream.write_all(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EipError::Transport(format!("{}: send: {e}", self.peer))),
            Err(_) => Err(EipError::Transport(format!("{}: send timed out", self.peer))),
        }
    }

    /// Read one length-prefixed message: header first, then `length` more
    /// bytes, growing the buffer as needed. Partial frames are discarded on
    /// any failure.
    async fn recv_frame(&mut self) -> Result<Header> {
        self.buf.clear();
        self.body_len = 0;
        self.fill_to(HEADER_LEN).await?;
        let header = Header::decode(&self.buf)?;
        let total = HEADER_LEN + header.length as usize;
        self.fill_to(total).await?;
        self.body_len = header.length as usize;
        Ok(header)
    }

    async fn fill_to(&mut self, len: usize) -> Result<()> {
        while self.buf.len() < len {
            self.buf.reserve(len - self.buf.len());
            let n = match timeout(self.timeout, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    return Err(EipError::Transport(format!("{}: recv: {e}", self.peer)))
                }
                Err(_) => {
                    return Err(EipError::Transport(format!(
                        "{}: timed out waiting for a frame",
                        self.peer
                    )))
                }
            };
            if n == 0 {
                return Err(EipError::Transport(format!(
                    "{}: connection closed mid-frame",
                    self.peer
                )));
            }
        }
        Ok(())
    }

    fn body(&self) -> &[u8] {
        &self.buf[HEADER_LEN..HEADER_LEN + self.body_len]
    }

    /// Orderly teardown: UnRegisterSession is best-effort, the target may
    /// already be gone.
    pub async fn close(mut self) {
        let frame = encap::unregister_session_frame(self.session);
        if let Err(e) = self.send_frame(&frame).await {
            debug!(peer = %self.peer, error = %e, "unregister on close failed");
        }
        let _ = self.stream.shutdown().await;
    }
}

/// Raw attribute bytes from Get_Attribute_Single.
struct AttributeValue(Vec<u8>);

impl AttributeValue {
    fn u16(&self) -> Result<u16> {
        Reader::new(&self.0).get_u16()
    }

    fn u32(&self) -> Result<u32> {
        Reader::new(&self.0).get_u32()
    }

    fn short_string(&self) -> Result<String> {
        let mut r = Reader::new(&self.0);
        let len = r.get_u8()? as usize;
        let bytes = r.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|e| EipError::Resolve(format!("{host}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| EipError::Resolve(format!("no addresses found for {host}")))
}

/// One-shot tag read outside any scan list, for tests and the CLI. Returns
/// the typed payload (`abbreviated_type | value_bytes`).
pub async fn read_tag_adhoc(
    host: &str,
    port: u16,
    slot: u8,
    tag: &str,
    elements: u16,
    io_timeout: Duration,
) -> Result<Vec<u8>> {
    let path = crate::cip::path::encode_tag_path(&tag.parse::<TagPath>()?)?;
    let mut session = Session::connect(host, port, io_timeout).await?;
    let result = read_once(&mut session, &path, slot, elements).await;
    session.close().await;
    result
}

/// One-shot write: reads the tag first to learn its type, then writes the
/// coerced value and re-reads for confirmation.
pub async fn write_tag_adhoc(
    host: &str,
    port: u16,
    slot: u8,
    tag: &str,
    elements: u16,
    io_timeout: Duration,
    value: &str,
) -> Result<Vec<u8>> {
    let path = crate::cip::path::encode_tag_path(&tag.parse::<TagPath>()?)?;
    let mut session = Session::connect(host, port, io_timeout).await?;
    let result = async {
        let payload = read_once(&mut session, &path, slot, elements).await?;
        let ty = TypedData::parse(&payload)?.ty;
        let encoded = encode_repeated(ty, value, elements)?;
        let request = service::write_request(&path, ty.abbreviated(), elements, &encoded);
        let reply = session
            .transact(&service::unconnected_send(&request, slot)?)
            .await?;
        check_unconnected_reply(&reply, service::SVC_WRITE_DATA)?;
        read_once(&mut session, &path, slot, elements).await
    }
    .await;
    session.close().await;
    result
}

async fn read_once(
    session: &mut Session,
    path: &[u8],
    slot: u8,
    elements: u16,
) -> Result<Vec<u8>> {
    let request = service::read_request(path, elements);
    let reply = session
        .transact(&service::unconnected_send(&request, slot)?)
        .await?;
    check_unconnected_reply(&reply, service::SVC_READ_DATA)?;
    let resp = MrResponse::parse(&reply)?;
    Ok(resp.data.to_vec())
}

fn encode_repeated(ty: CipType, value: &str, elements: u16) -> Result<Vec<u8>> {
    let one = crate::cip::types::encode_value(ty, value)?;
    let mut out = Vec::with_capacity(one.len() * elements as usize);
    for _ in 0..elements {
        out.extend_from_slice(&one);
    }
    Ok(out)
}

/// Validate the MR frame answering an Unconnected_Send. The Connection
/// Manager echoes its own service byte only when routing failed; otherwise
/// the reply carries the embedded request's service.
pub fn check_unconnected_reply(reply: &[u8], inner_service: u8) -> Result<()> {
    let resp = MrResponse::parse(reply)?;
    if resp.service == service::SVC_UNCONNECTED_SEND | crate::cip::mr::RESPONSE_BIT
        && !resp.is_ok()
    {
        warn!(
            status = resp.general_status,
            "Connection Manager rejected the routed request"
        );
        return Err(EipError::Protocol(format!(
            "Connection Manager: {}",
            crate::cip::mr::status_text(resp.general_status, resp.ext_status)
        )));
    }
    resp.check(inner_service)
}
