//! End-to-end tests against a mock ENIP target: session handshake, scanned
//! reads with callbacks, the write handoff, bundle splitting and recovery
//! after a transport failure.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use etherip_lib::cip::path::encode_tag_path;
use etherip_lib::{read_tag_adhoc, write_tag_adhoc, CipValue, Driver, DriverConfig, TypedData};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const SESSION: u32 = 0x00A1B2C3;

#[derive(Default)]
struct MockState {
    /// encoded tag path -> (abbreviated type, element bytes)
    tags: Mutex<HashMap<Vec<u8>, (u16, Vec<u8>)>>,
    /// every WriteData seen: (path, type, value bytes)
    writes: Mutex<Vec<(Vec<u8>, u16, Vec<u8>)>>,
    drop_next: AtomicBool,
}

struct MockPlc {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockPlc {
    async fn start() -> MockPlc {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        let shared = state.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let state = shared.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });
        MockPlc { addr, state }
    }

    fn set_tag(&self, tag: &str, ty: u16, data: &[u8]) {
        self.state
            .tags
            .lock()
            .unwrap()
            .insert(path_of(tag), (ty, data.to_vec()));
    }

    fn writes(&self) -> Vec<(Vec<u8>, u16, Vec<u8>)> {
        self.state.writes.lock().unwrap().clone()
    }

    /// Close the connection instead of answering the next SendRRData.
    fn drop_next_transaction(&self) {
        self.state.drop_next.store(true, Ordering::SeqCst);
    }
}

fn path_of(tag: &str) -> Vec<u8> {
    encode_tag_path(&tag.parse().unwrap()).unwrap()
}

fn type_size(ty: u16) -> usize {
    match ty {
        0x00C1 | 0x00C2 => 1,
        0x00C3 => 2,
        _ => 4,
    }
}

async fn serve(mut stream: TcpStream, state: Arc<MockState>) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; 24];
        if stream.read_exact(&mut header).await.is_err() {
            return Ok(());
        }
        let command = u16::from_le_bytes([header[0], header[1]]);
        let length = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await?;

        match command {
            // ListServices: one entry announcing CIP encapsulation
            0x0004 => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&1u16.to_le_bytes());
                payload.extend_from_slice(&0x0100u16.to_le_bytes());
                payload.extend_from_slice(&20u16.to_le_bytes());
                payload.extend_from_slice(&1u16.to_le_bytes());
                payload.extend_from_slice(&0x0120u16.to_le_bytes());
                payload.extend_from_slice(b"Communications\0\0");
                reply(&mut stream, command, 0, &payload).await?;
            }
            // RegisterSession
            0x0065 => reply(&mut stream, command, SESSION, &[1, 0, 0, 0]).await?,
            // UnRegisterSession ends the conversation
            0x0066 => return Ok(()),
            // SendRRData
            0x006F => {
                if state.drop_next.swap(false, Ordering::SeqCst) {
                    return Ok(());
                }
                // interface handle(4) timeout(2) count(2) null item(4)
                // data item type(2) len(2) frame
                let frame_len = u16::from_le_bytes([body[14], body[15]]) as usize;
                let frame = &body[16..16 + frame_len];
                let response = handle_mr(&state, frame);
                let mut payload = Vec::new();
                payload.extend_from_slice(&0u32.to_le_bytes());
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(&2u16.to_le_bytes());
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(&0x00B2u16.to_le_bytes());
                payload.extend_from_slice(&(response.len() as u16).to_le_bytes());
                payload.extend_from_slice(&response);
                reply(&mut stream, command, SESSION, &payload).await?;
            }
            _ => reply_status(&mut stream, command, 1).await?,
        }
    }
}

async fn reply(
    stream: &mut TcpStream,
    command: u16,
    session: u32,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut out = Vec::with_capacity(24 + payload.len());
    out.extend_from_slice(&command.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&session.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(b"AIRPLANE");
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(payload);
    stream.write_all(&out).await
}

async fn reply_status(stream: &mut TcpStream, command: u16, status: u32) -> std::io::Result<()> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&command.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&status.to_le_bytes());
    out.extend_from_slice(b"AIRPLANE");
    out.extend_from_slice(&0u32.to_le_bytes());
    stream.write_all(&out).await
}

/// Answer one MR request frame, recursing through Unconnected_Send and
/// multi-request envelopes.
fn handle_mr(state: &MockState, frame: &[u8]) -> Vec<u8> {
    let service = frame[0];
    let path_len = 2 * frame[1] as usize;
    let path = &frame[2..2 + path_len];
    let data = &frame[2 + path_len..];
    match service {
        // Unconnected_Send: tick(1) ticks(1) size(2) inner
        0x52 => {
            let inner_len = u16::from_le_bytes([data[2], data[3]]) as usize;
            handle_mr(state, &data[4..4 + inner_len])
        }
        // multi request
        0x0A => {
            let count = u16::from_le_bytes([data[0], data[1]]) as usize;
            let offsets: Vec<usize> = (0..count)
                .map(|k| u16::from_le_bytes([data[2 + 2 * k], data[3 + 2 * k]]) as usize)
                .collect();
            let responses: Vec<Vec<u8>> = (0..count)
                .map(|k| {
                    let start = offsets[k];
                    let end = if k + 1 < count { offsets[k + 1] } else { data.len() };
                    handle_mr(state, &data[start..end])
                })
                .collect();
            let mut out = vec![0x8A, 0, 0, 0];
            out.extend_from_slice(&(count as u16).to_le_bytes());
            let mut offset = 2 + 2 * count;
            for r in &responses {
                out.extend_from_slice(&(offset as u16).to_le_bytes());
                offset += r.len();
            }
            for r in &responses {
                out.extend_from_slice(r);
            }
            out
        }
        // ReadData
        0x4C => {
            let count = u16::from_le_bytes([data[0], data[1]]) as usize;
            match state.tags.lock().unwrap().get(path) {
                Some((ty, bytes)) => {
                    let take = (count * type_size(*ty)).min(bytes.len());
                    let mut out = vec![0xCC, 0, 0, 0];
                    out.extend_from_slice(&ty.to_le_bytes());
                    out.extend_from_slice(&bytes[..take]);
                    out
                }
                // destination unknown
                None => vec![0xCC, 0, 0x05, 0],
            }
        }
        // WriteData
        0x4D => {
            let ty = u16::from_le_bytes([data[0], data[1]]);
            let value = data[4..].to_vec();
            state
                .writes
                .lock()
                .unwrap()
                .push((path.to_vec(), ty, value.clone()));
            state.tags.lock().unwrap().insert(path.to_vec(), (ty, value));
            vec![0xCD, 0, 0, 0]
        }
        // Get_Attribute_Single against the identity object
        0x0E => {
            let attribute = path[5];
            let mut out = vec![0x8E, 0, 0, 0];
            match attribute {
                1 => out.extend_from_slice(&1u16.to_le_bytes()),
                2 => out.extend_from_slice(&14u16.to_le_bytes()),
                4 => out.extend_from_slice(&0x1B02u16.to_le_bytes()),
                6 => out.extend_from_slice(&0xCAFE1234u32.to_le_bytes()),
                7 => {
                    out.push(7);
                    out.extend_from_slice(b"MockPLC");
                }
                _ => out[2] = 0x05,
            }
            out
        }
        // service not supported
        _ => vec![service | 0x80, 0, 0x08, 0],
    }
}

fn test_config() -> DriverConfig {
    DriverConfig {
        default_period_s: 1.0,
        timeout_ms: 500,
        transfer_buffer_limit: 500,
        plcs: Vec::new(),
    }
}

type Sample = (usize, Vec<u8>);

fn sampling_subscriber(tx: mpsc::UnboundedSender<Sample>) -> etherip_lib::Subscriber {
    Arc::new(move |_tag, state| {
        let _ = tx.send((state.valid_len, state.value[..state.valid_len].to_vec()));
    })
}

async fn next_sample(rx: &mut mpsc::UnboundedReceiver<Sample>) -> Sample {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a callback")
        .expect("subscriber channel closed")
}

#[tokio::test]
async fn test_adhoc_read_dint() {
    let mock = MockPlc::start().await;
    mock.set_tag("fred", 0x00C4, &42i32.to_le_bytes());

    let payload = read_tag_adhoc(
        "127.0.0.1",
        mock.addr.port(),
        0,
        "fred",
        1,
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    assert_eq!(payload, [0xC4, 0x00, 42, 0, 0, 0]);
    let typed = TypedData::parse(&payload).unwrap();
    assert_eq!(typed.element(0).unwrap(), CipValue::Dint(42));
}

#[tokio::test]
async fn test_adhoc_read_unknown_tag_fails() {
    let mock = MockPlc::start().await;
    let result = read_tag_adhoc(
        "127.0.0.1",
        mock.addr.port(),
        0,
        "nosuch",
        1,
        Duration::from_secs(2),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_adhoc_write_echoes_observed_type() {
    let mock = MockPlc::start().await;
    mock.set_tag("fred", 0x00C4, &1i32.to_le_bytes());

    let payload = write_tag_adhoc(
        "127.0.0.1",
        mock.addr.port(),
        0,
        "fred",
        1,
        Duration::from_secs(2),
        "7",
    )
    .await
    .unwrap();

    assert_eq!(payload, [0xC4, 0x00, 7, 0, 0, 0]);
    let writes = mock.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0], (path_of("fred"), 0x00C4, 7i32.to_le_bytes().to_vec()));
}

#[tokio::test]
async fn test_scan_reads_and_dispatches_callbacks() {
    let mock = MockPlc::start().await;
    mock.set_tag("fred", 0x00C4, &42i32.to_le_bytes());

    let driver = Driver::new(test_config());
    let plc = driver
        .define_plc("mock", "127.0.0.1", mock.addr.port(), 0)
        .await;
    let tag = driver
        .add_tag(&plc, Duration::from_millis(30), "fred", 1)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    driver.add_callback(&tag, sampling_subscriber(tx));
    driver.start();

    let (valid_len, value) = next_sample(&mut rx).await;
    assert_eq!(valid_len, 6);
    assert_eq!(value, [0xC4, 0x00, 42, 0, 0, 0]);

    // the scan picks up a value change on a later cycle
    mock.set_tag("fred", 0x00C4, &43i32.to_le_bytes());
    loop {
        let (_, value) = next_sample(&mut rx).await;
        if value == [0xC4, 0x00, 43, 0, 0, 0] {
            break;
        }
    }

    let snap = plc.snapshot().await;
    assert!(snap.connected);
    assert_eq!(snap.errors, 0);
    assert_eq!(snap.identity.as_ref().unwrap().name, "MockPLC");

    driver.shutdown().await;
}

#[tokio::test]
async fn test_write_handoff() {
    let mock = MockPlc::start().await;
    mock.set_tag("fred", 0x00C4, &1i32.to_le_bytes());

    let driver = Driver::new(test_config());
    let plc = driver
        .define_plc("mock", "127.0.0.1", mock.addr.port(), 0)
        .await;
    let tag = driver
        .add_tag(&plc, Duration::from_millis(30), "fred", 1)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    driver.add_callback(&tag, sampling_subscriber(tx));
    driver.start();

    // wait for the first read so the type is known
    let (_, value) = next_sample(&mut rx).await;
    assert_eq!(value, [0xC4, 0x00, 1, 0, 0, 0]);

    tag.write_value(&7i32.to_le_bytes()).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while mock.writes().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "write never sent");
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        mock.writes()[0],
        (path_of("fred"), 0x00C4, 7i32.to_le_bytes().to_vec())
    );

    // reads after the write observe the written value
    loop {
        let (_, value) = next_sample(&mut rx).await;
        if value == [0xC4, 0x00, 7, 0, 0, 0] {
            break;
        }
    }

    // a second write goes out on a later cycle
    tag.write_value(&8i32.to_le_bytes()).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while mock.writes().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "second write never sent");
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(mock.writes()[1].2, 8i32.to_le_bytes().to_vec());

    driver.shutdown().await;
}

#[tokio::test]
async fn test_bundles_split_at_buffer_limit() {
    let mock = MockPlc::start().await;
    let tags: Vec<String> = (0..20).map(|i| format!("t{i:02}")).collect();
    for (i, tag) in tags.iter().enumerate() {
        mock.set_tag(tag, 0x00C4, &(i as i32).to_le_bytes());
    }

    let mut cfg = test_config();
    // small enough to force several transfers per cycle
    cfg.transfer_buffer_limit = 100;
    let driver = Driver::new(cfg);
    let plc = driver
        .define_plc("mock", "127.0.0.1", mock.addr.port(), 0)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for tag in &tags {
        let info = driver
            .add_tag(&plc, Duration::from_millis(50), tag, 1)
            .await
            .unwrap();
        let tx = tx.clone();
        let name = tag.clone();
        driver.add_callback(
            &info,
            Arc::new(move |_tag, state| {
                let _ = tx.send((name.clone(), state.value[..state.valid_len].to_vec()));
            }),
        );
    }
    driver.start();

    let mut seen = std::collections::HashSet::new();
    while seen.len() < tags.len() {
        let (name, value) = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for samples")
            .unwrap();
        let idx: i32 = name[1..].parse().unwrap();
        assert_eq!(value[2..6], idx.to_le_bytes());
        seen.insert(name);
    }

    driver.shutdown().await;
}

#[tokio::test]
async fn test_bad_tag_does_not_disconnect_plc() {
    let mock = MockPlc::start().await;
    mock.set_tag("fred", 0x00C4, &5i32.to_le_bytes());

    let driver = Driver::new(test_config());
    let plc = driver
        .define_plc("mock", "127.0.0.1", mock.addr.port(), 0)
        .await;
    let good = driver
        .add_tag(&plc, Duration::from_millis(30), "fred", 1)
        .await
        .unwrap();
    // the mock has no such tag, so discovery for it fails forever
    let bad = driver
        .add_tag(&plc, Duration::from_millis(30), "nosuch", 1)
        .await
        .unwrap();

    let (good_tx, mut good_rx) = mpsc::unbounded_channel();
    driver.add_callback(&good, sampling_subscriber(good_tx));
    let (bad_tx, mut bad_rx) = mpsc::unbounded_channel();
    driver.add_callback(&bad, sampling_subscriber(bad_tx));
    driver.start();

    // the bad tag surfaces as "no valid data" instead of taking the
    // whole PLC down
    let (valid_len, value) = next_sample(&mut bad_rx).await;
    assert_eq!(valid_len, 0);
    assert!(value.is_empty());

    // the good tag keeps delivering across several cycles
    for _ in 0..5 {
        let (valid_len, value) = next_sample(&mut good_rx).await;
        assert_eq!(valid_len, 6);
        assert_eq!(value, [0xC4, 0x00, 5, 0, 0, 0]);
    }

    // and the bad tag keeps signalling every pass
    let (valid_len, _) = next_sample(&mut bad_rx).await;
    assert_eq!(valid_len, 0);

    let snap = plc.snapshot().await;
    assert!(snap.connected, "one bad tag must not disconnect the PLC");
    assert_eq!(snap.errors, 0);
    assert!(bad.typed_value().is_none());

    driver.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_after_transport_failure() {
    let mock = MockPlc::start().await;
    mock.set_tag("fred", 0x00C4, &5i32.to_le_bytes());

    let mut cfg = test_config();
    cfg.timeout_ms = 200;
    let driver = Driver::new(cfg);
    let plc = driver
        .define_plc("mock", "127.0.0.1", mock.addr.port(), 0)
        .await;
    let tag = driver
        .add_tag(&plc, Duration::from_millis(30), "fred", 1)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    driver.add_callback(&tag, sampling_subscriber(tx));
    driver.start();

    let _ = next_sample(&mut rx).await;
    let errors_before = plc.snapshot().await.errors;

    mock.drop_next_transaction();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snap = plc.snapshot().await;
        if snap.errors > errors_before {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "failure never counted");
        sleep(Duration::from_millis(10)).await;
    }

    // the worker reconnects and fresh samples flow again
    mock.set_tag("fred", 0x00C4, &6i32.to_le_bytes());
    loop {
        let (valid_len, value) = next_sample(&mut rx).await;
        if valid_len == 6 && value == [0xC4, 0x00, 6, 0, 0, 0] {
            break;
        }
    }
    assert!(plc.snapshot().await.connected);

    driver.shutdown().await;
}
