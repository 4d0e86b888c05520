#![forbid(unsafe_code)]

//! Per-PLC scan worker.
//!
//! Each worker owns its PLC for whole cycles: reconnect and size discovery,
//! then for every due scan list bundle reads and writes into one
//! multi-request per transfer, dispatch the per-tag results, and sleep to
//! the nearest deadline. Transport failures disconnect the PLC and
//! invalidate every cached value; the next cycle reconnects.
//!
//! The write handoff runs on two flags under the tag lock:
//! `write_pending` set by a subscriber, `writing_now` latched at bundling
//! when the engine commits the cycle to writing. `write_pending` clears
//! when the request bytes are captured, `writing_now` when the response
//! arrives, so a second subscriber write during the transfer waits for the
//! cycle after.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until};
use tracing::{debug, info, warn};

use crate::cip::mr::MrResponse;
use crate::cip::service::{self, MultiRequestBuilder, SVC_MULTI_REQUEST};
use crate::config::DriverConfig;
use crate::error::{EipError, Result};
use crate::registry::{Plc, PlcCore, TagInfo};
use crate::transport::{check_unconnected_reply, Session};

/// Sleep when a PLC has no scan lists yet.
const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub(crate) struct ScanConfig {
    pub timeout: Duration,
    pub buffer_limit: usize,
}

impl ScanConfig {
    pub(crate) fn from_driver(cfg: &DriverConfig) -> Self {
        Self {
            timeout: cfg.timeout(),
            buffer_limit: cfg.transfer_buffer_limit,
        }
    }
}

pub(crate) fn spawn_worker(
    plc: Arc<Plc>,
    cfg: ScanConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_worker(plc, cfg, shutdown))
}

/// How long the worker should wait before its next pass.
enum Pace {
    Until(Instant),
    For(Duration),
}

async fn run_worker(plc: Arc<Plc>, cfg: ScanConfig, mut shutdown: watch::Receiver<bool>) {
    info!(plc = plc.name(), "scan worker started");
    while !*shutdown.borrow() {
        match cycle(&plc, &cfg).await {
            Pace::Until(at) => {
                if at <= Instant::now() {
                    // already past the nearest deadline
                    plc.slow_scans.increment();
                    tokio::task::yield_now().await;
                } else {
                    tokio::select! {
                        _ = sleep_until(at.into()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
            Pace::For(duration) => {
                tokio::select! {
                    _ = sleep(duration) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    let mut core = plc.core.lock().await;
    if let Some(session) = core.session.take() {
        session.close().await;
    }
    drop(core);
    info!(plc = plc.name(), "scan worker stopped");
}

/// One pass over the PLC: connect if needed, discover sizes, run every due
/// list, and report when to come back.
async fn cycle(plc: &Plc, cfg: &ScanConfig) -> Pace {
    let mut core = plc.core.lock().await;

    if core.session.is_none() {
        match Session::connect(&core.host, core.port, cfg.timeout).await {
            Ok(mut session) => {
                match session.probe_identity().await {
                    Ok(identity) => {
                        info!(plc = plc.name(), peer = %session.peer(), device = %identity.name, "connected");
                        core.identity = Some(identity);
                    }
                    // identity is informational only
                    Err(e) => warn!(plc = plc.name(), error = %e, "identity probe failed"),
                }
                core.session = Some(session);
                if let Err(e) = discover(&mut core).await {
                    warn!(plc = plc.name(), error = %e, "discovery failed");
                    core.errors += 1;
                    fail_plc(&mut core);
                    return Pace::For(cfg.timeout);
                }
            }
            Err(e) => {
                warn!(plc = plc.name(), error = %e, "connect failed");
                return Pace::For(cfg.timeout);
            }
        }
    }

    let now = Instant::now();
    for li in 0..core.lists.len() {
        if !core.lists[li].enabled || now < core.lists[li].next_due {
            continue;
        }
        let started = Instant::now();
        match scan_list(&mut core, li, cfg).await {
            Ok(()) => {
                let period = core.lists[li].period;
                core.lists[li].stats.record(started.elapsed(), started);
                core.lists[li].next_due = now + period;
            }
            Err(e) => {
                warn!(plc = plc.name(), error = %e, "scan transfer failed");
                core.lists[li].stats.record_error();
                core.errors += 1;
                core.lists[li].next_due = Instant::now() + cfg.timeout;
                fail_plc(&mut core);
                break;
            }
        }
    }

    let next = core
        .lists
        .iter()
        .filter(|l| l.enabled)
        .map(|l| l.next_due)
        .min();
    drop(core);
    match next {
        Some(at) => Pace::Until(at),
        None => Pace::For(IDLE_WAIT),
    }
}

/// Drop the session and mark every cached value invalid. Subscribers see
/// `valid_len == 0` until a read succeeds after reconnect.
fn fail_plc(core: &mut PlcCore) {
    core.session = None;
    for list in &core.lists {
        for tag in &list.tags {
            let mut st = tag.lock();
            st.valid_len = 0;
            st.writing_now = false;
        }
    }
}

/// Learn request/response sizes for every tag that has none, one
/// standalone read each, run once per connection. Write sizes derive from
/// the read sizes; a response of only the MR header means the tag cannot
/// be written. A tag that fails discovery (bad name, index out of range)
/// only affects itself: subscribers see `valid_len == 0` and the PLC stays
/// up as long as any of its tags has sizes.
async fn discover(core: &mut PlcCore) -> Result<()> {
    let slot = core.slot;
    let tags: Vec<Arc<TagInfo>> = core
        .lists
        .iter()
        .flat_map(|l| l.tags.iter().cloned())
        .collect();
    let mut any_needed = false;
    for tag in tags {
        let (needed, elements) = {
            let st = tag.lock();
            (st.r_req == 0, st.element_count)
        };
        if !needed {
            continue;
        }
        any_needed = true;
        let request = service::read_request(tag.encoded_path(), elements);
        let frame = service::unconnected_send(&request, slot)?;
        let session = core
            .session
            .as_mut()
            .ok_or_else(|| EipError::Transport("not connected".into()))?;
        let reply = session.transact(&frame).await?;
        match check_unconnected_reply(&reply, service::SVC_READ_DATA) {
            Ok(()) => {
                let resp = MrResponse::parse(&reply)?;
                let data = resp.data;
                let mut st = tag.lock();
                st.r_req = service::read_request_size(tag.encoded_path().len());
                st.r_resp = 4 + data.len();
                if st.r_resp > 4 {
                    st.w_req = st.r_req + (st.r_resp - 4);
                    st.w_resp = 4;
                }
                if st.value.len() < data.len() {
                    st.value.resize(data.len(), 0);
                }
                st.value[..data.len()].copy_from_slice(data);
                st.valid_len = data.len();
                debug!(
                    tag = %tag.tag(),
                    r_req = st.r_req,
                    r_resp = st.r_resp,
                    "tag sizes discovered"
                );
            }
            Err(e) => {
                warn!(tag = %tag.tag(), error = %e, "tag discovery failed");
                let mut st = tag.lock();
                st.valid_len = 0;
                tag.dispatch_callbacks(&st);
            }
        }
    }
    if any_needed {
        let any_sized = core
            .lists
            .iter()
            .flat_map(|l| l.tags.iter())
            .any(|t| t.lock().r_req > 0);
        if !any_sized {
            return Err(EipError::Protocol("discovery failed for every tag".into()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Read { elements: u16 },
    Write,
}

struct BundleItem {
    tag: Arc<TagInfo>,
    action: Action,
}

/// Run one due list, splitting it into as many transfers as the buffer
/// limit requires. Tags keep list order across transfers.
async fn scan_list(core: &mut PlcCore, li: usize, cfg: &ScanConfig) -> Result<()> {
    let tags = core.lists[li].tags.clone();
    let mut start = 0;
    while start < tags.len() {
        let (consumed, items) = plan_bundle(&tags[start..], cfg.buffer_limit);
        if consumed == 0 {
            break;
        }
        start += consumed;
        if !items.is_empty() {
            transfer_bundle(core, &items).await?;
        }
    }
    Ok(())
}

/// Walk the unprocessed tail of a list and pick the tags of the next
/// transfer. Per tag the read/write choice is made under the tag lock and
/// latched into `writing_now`; the bundle closes as soon as the next tag
/// would push the request or the response past the buffer limit.
fn plan_bundle(tags: &[Arc<TagInfo>], limit: usize) -> (usize, Vec<BundleItem>) {
    let mut consumed = 0;
    let mut items: Vec<BundleItem> = Vec::new();
    let mut req_sum = 0usize;
    let mut resp_sum = 0usize;
    for tag in tags {
        let mut st = tag.lock();
        if st.r_req == 0 {
            // no sizes (bad tag name, or added after connect): nothing can
            // be sent for it, but subscribers still get the
            // `valid_len == 0` signal every pass
            tag.dispatch_callbacks(&st);
            consumed += 1;
            continue;
        }
        if st.write_pending && (st.w_req == 0 || st.valid_len < 2) {
            warn!(tag = %tag.tag(), "write requested but tag is not writable, dropping");
            st.write_pending = false;
        }
        let (action, req, resp) = if st.write_pending {
            (Action::Write, st.w_req, st.w_resp)
        } else {
            (Action::Read { elements: st.element_count }, st.r_req, st.r_resp)
        };
        let count = items.len() + 1;
        let req_total =
            service::unconnected_send_size(service::multi_request_overhead(count) + req_sum + req);
        let resp_total = service::multi_response_overhead(count) + resp_sum + resp;
        if (req_total > limit || resp_total > limit) && !items.is_empty() {
            break;
        }
        if matches!(action, Action::Write) {
            st.writing_now = true;
        }
        drop(st);
        req_sum += req;
        resp_sum += resp;
        items.push(BundleItem { tag: tag.clone(), action });
        consumed += 1;
    }
    (consumed, items)
}

/// Assemble one multi-request for the bundle, exchange it, and dispatch the
/// per-tag outcomes under each tag's lock.
async fn transfer_bundle(core: &mut PlcCore, items: &[BundleItem]) -> Result<()> {
    let slot = core.slot;
    let mut builder = MultiRequestBuilder::new(items.len());
    let mut actions = Vec::with_capacity(items.len());
    for item in items {
        let action = match item.action {
            Action::Read { elements } => {
                builder.push(&service::read_request(item.tag.encoded_path(), elements));
                Action::Read { elements }
            }
            Action::Write => {
                let mut st = item.tag.lock();
                if st.valid_len < 2 {
                    // value was invalidated after bundling; read instead
                    let elements = st.element_count;
                    st.write_pending = false;
                    st.writing_now = false;
                    drop(st);
                    builder.push(&service::read_request(item.tag.encoded_path(), elements));
                    Action::Read { elements }
                } else {
                    let type_code = u16::from_le_bytes([st.value[0], st.value[1]]);
                    let data = st.value[2..st.valid_len].to_vec();
                    let elements = st.element_count;
                    st.write_pending = false;
                    drop(st);
                    builder.push(&service::write_request(
                        item.tag.encoded_path(),
                        type_code,
                        elements,
                        &data,
                    ));
                    Action::Write
                }
            }
        };
        actions.push(action);
    }

    let frame = service::unconnected_send(&builder.finish()?, slot)?;
    let session = core
        .session
        .as_mut()
        .ok_or_else(|| EipError::Transport("not connected".into()))?;
    let reply = session.transact(&frame).await?;
    check_unconnected_reply(&reply, SVC_MULTI_REQUEST)?;
    let resp = MrResponse::parse(&reply)?;
    let responses = service::split_multi_response(resp.data, items.len())?;

    for (k, item) in items.iter().enumerate() {
        let sub = MrResponse::parse(responses[k])?;
        let mut st = item.tag.lock();
        match actions[k] {
            Action::Write => {
                if let Err(e) = sub.check(service::SVC_WRITE_DATA) {
                    // the value on the PLC is unchanged; drop the cache so
                    // the next read refreshes it
                    warn!(tag = %item.tag.tag(), error = %e, "write failed");
                    st.valid_len = 0;
                }
                st.writing_now = false;
            }
            Action::Read { .. } => {
                if st.write_pending {
                    // a write raced in during the transfer; this read is
                    // stale and the next cycle will write
                } else {
                    match sub.check(service::SVC_READ_DATA) {
                        Ok(()) => {
                            let data = sub.data;
                            if st.value.len() < data.len() {
                                st.value.resize(data.len(), 0);
                            }
                            st.value[..data.len()].copy_from_slice(data);
                            st.valid_len = data.len();
                        }
                        Err(e) => {
                            warn!(tag = %item.tag.tag(), error = %e, "read failed");
                            st.valid_len = 0;
                        }
                    }
                }
            }
        }
        item.tag.dispatch_callbacks(&st);
    }
    Ok(())
}
