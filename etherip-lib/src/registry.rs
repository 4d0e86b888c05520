#![forbid(unsafe_code)]

//! The PLC → scan list → tag data model and its structural operations.
//!
//! Three lock levels, always taken registry → PLC → tag and never in the
//! other direction. The registry lock is a short-held std mutex; the PLC
//! lock is a tokio mutex the worker holds for a whole cycle; the tag lock
//! is a short-held std mutex around flags, the value buffer and callback
//! dispatch.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cip::path::encode_tag_path;
use crate::cip::types::{CipType, TypedData};
use crate::config::DriverConfig;
use crate::error::{EipError, Result};
use crate::scan;
use crate::stats::{ScanStats, SlowScanCounter};
use crate::tag::TagPath;
use crate::transport::{Identity, Session};

/// Index of a scan list within its PLC. Lists are created on demand and
/// never destroyed, so the index is stable for the life of the process.
pub type ScanListId = usize;

/// A subscriber: called under the tag lock whenever a scan transfer for the
/// tag completes. Identity (for dedup and removal) is the `Arc` allocation,
/// so clone the same `Arc` to refer to the same subscription.
pub type Subscriber = Arc<dyn Fn(&TagInfo, &TagState) + Send + Sync>;

/// Mutable per-tag state, guarded by the tag lock.
pub struct TagState {
    pub(crate) list: ScanListId,
    /// Highest requested element index + 1; only ever grows.
    pub element_count: u16,
    /// CIP sizes learned at discovery; 0 while unknown.
    pub(crate) r_req: usize,
    pub(crate) r_resp: usize,
    pub(crate) w_req: usize,
    pub(crate) w_resp: usize,
    /// Raw typed payload: `abbreviated_type(2) | value_bytes`.
    pub value: Vec<u8>,
    /// Valid prefix of `value`; 0 means no valid data.
    pub valid_len: usize,
    /// A subscriber requested a write; picked up at the next bundling.
    pub write_pending: bool,
    /// The engine committed the current cycle to writing this tag.
    pub writing_now: bool,
    pub(crate) subscribers: Vec<Subscriber>,
}

/// One subscribed tag on one PLC.
pub struct TagInfo {
    tag: String,
    path: TagPath,
    encoded_path: Vec<u8>,
    state: StdMutex<TagState>,
}

impl TagInfo {
    fn new(tag: &str, list: ScanListId, elements: u16) -> Result<Arc<Self>> {
        let path: TagPath = tag.parse()?;
        let encoded_path = encode_tag_path(&path)?;
        Ok(Arc::new(Self {
            tag: tag.to_string(),
            path,
            encoded_path,
            state: StdMutex::new(TagState {
                list,
                element_count: elements,
                r_req: 0,
                r_resp: 0,
                w_req: 0,
                w_resp: 0,
                value: Vec::new(),
                valid_len: 0,
                write_pending: false,
                writing_now: false,
                subscribers: Vec::new(),
            }),
        }))
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn path(&self) -> &TagPath {
        &self.path
    }

    pub(crate) fn encoded_path(&self) -> &[u8] {
        &self.encoded_path
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TagState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Current typed payload, or `None` while no read has succeeded.
    pub fn typed_value(&self) -> Option<(CipType, Vec<u8>)> {
        let st = self.lock();
        if st.valid_len < 2 {
            return None;
        }
        let typed = TypedData::parse(&st.value[..st.valid_len]).ok()?;
        Some((typed.ty, typed.raw.to_vec()))
    }

    /// Queue a write of `value_bytes` (raw elements, without the type
    /// word). The type is echoed from the last read; writing before any
    /// successful read is refused because the element type is unknown.
    pub fn write_value(&self, value_bytes: &[u8]) -> Result<()> {
        let mut st = self.lock();
        if st.valid_len < 2 {
            return Err(EipError::NoData(self.tag.clone()));
        }
        let total = 2 + value_bytes.len();
        if st.value.len() < total {
            st.value.resize(total, 0);
        }
        st.value[2..total].copy_from_slice(value_bytes);
        st.valid_len = total;
        st.write_pending = true;
        Ok(())
    }

    /// Run every subscriber in registration order. The caller holds the
    /// tag lock and passes the guarded state through.
    pub(crate) fn dispatch_callbacks(&self, state: &TagState) {
        for subscriber in state.subscribers.clone() {
            subscriber(self, state);
        }
    }
}

impl std::fmt::Debug for TagInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagInfo").field("tag", &self.tag).finish()
    }
}

/// Tags sharing one scan period on one PLC.
pub struct ScanList {
    pub period: Duration,
    pub(crate) enabled: bool,
    pub(crate) next_due: Instant,
    pub(crate) tags: Vec<Arc<TagInfo>>,
    pub(crate) stats: ScanStats,
}

impl ScanList {
    fn new(period: Duration) -> Self {
        Self {
            period,
            enabled: true,
            next_due: Instant::now(),
            tags: Vec::new(),
            stats: ScanStats::default(),
        }
    }
}

/// Everything about a PLC that the worker owns for a whole cycle.
pub(crate) struct PlcCore {
    pub host: String,
    pub port: u16,
    pub slot: u8,
    pub session: Option<Session>,
    pub identity: Option<Identity>,
    pub lists: Vec<ScanList>,
    pub errors: u64,
}

/// One controller and its scan worker.
pub struct Plc {
    name: String,
    pub(crate) core: Mutex<PlcCore>,
    pub(crate) slow_scans: SlowScanCounter,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl Plc {
    fn new(name: &str, host: &str, port: u16, slot: u8) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            core: Mutex::new(PlcCore {
                host: host.to_string(),
                port,
                slot,
                session: None,
                identity: None,
                lists: Vec::new(),
                errors: 0,
            }),
            slow_scans: SlowScanCounter::default(),
            worker: StdMutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slow_scans(&self) -> u64 {
        self.slow_scans.get()
    }

    pub async fn snapshot(&self) -> PlcSnapshot {
        let core = self.core.lock().await;
        PlcSnapshot {
            name: self.name.clone(),
            host: core.host.clone(),
            port: core.port,
            slot: core.slot,
            connected: core.session.is_some(),
            identity: core.identity.clone(),
            errors: core.errors,
            slow_scans: self.slow_scans.get(),
            lists: core
                .lists
                .iter()
                .map(|l| ListSnapshot {
                    period: l.period,
                    enabled: l.enabled,
                    tag_count: l.tags.len(),
                    stats: l.stats,
                })
                .collect(),
        }
    }

    fn worker_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn set_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Point-in-time view of a scan list, for reporting.
#[derive(Debug, Clone)]
pub struct ListSnapshot {
    pub period: Duration,
    pub enabled: bool,
    pub tag_count: usize,
    pub stats: ScanStats,
}

/// Point-in-time view of a PLC, for reporting.
#[derive(Debug, Clone)]
pub struct PlcSnapshot {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub slot: u8,
    pub connected: bool,
    pub identity: Option<Identity>,
    pub errors: u64,
    pub slow_scans: u64,
    pub lists: Vec<ListSnapshot>,
}

/// The driver: a registry of PLCs plus their scan workers.
pub struct Driver {
    cfg: DriverConfig,
    plcs: StdMutex<Vec<Arc<Plc>>>,
    shutdown: watch::Sender<bool>,
}

impl Driver {
    pub fn new(cfg: DriverConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { cfg, plcs: StdMutex::new(Vec::new()), shutdown }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.cfg
    }

    fn plcs_snapshot(&self) -> Vec<Arc<Plc>> {
        self.plcs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Insert a PLC, or update host/port/slot of an existing one with the
    /// same name. An endpoint change drops the current session so the
    /// worker reconnects.
    pub async fn define_plc(&self, name: &str, host: &str, port: u16, slot: u8) -> Arc<Plc> {
        let existing = {
            let mut plcs = self.plcs.lock().unwrap_or_else(PoisonError::into_inner);
            match plcs.iter().find(|p| p.name == name) {
                Some(p) => p.clone(),
                None => {
                    let plc = Plc::new(name, host, port, slot);
                    plcs.push(plc.clone());
                    info!(plc = name, host, slot, "PLC defined");
                    return plc;
                }
            }
        };
        let mut core = existing.core.lock().await;
        if core.host != host || core.port != port || core.slot != slot {
            debug!(plc = name, host, slot, "PLC endpoint updated");
            core.host = host.to_string();
            core.port = port;
            core.slot = slot;
            if let Some(session) = core.session.take() {
                session.close().await;
            }
        }
        drop(core);
        existing
    }

    pub fn find_plc(&self, name: &str) -> Option<Arc<Plc>> {
        self.plcs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub async fn find_tag(&self, plc: &Plc, tag: &str) -> Option<Arc<TagInfo>> {
        let core = plc.core.lock().await;
        core.lists
            .iter()
            .flat_map(|l| l.tags.iter())
            .find(|t| t.tag() == tag)
            .cloned()
    }

    /// Subscribe `tag` at `period`. The tag string is parsed once; a tag
    /// already known on a slower list migrates to the faster one, and its
    /// element count only ever grows.
    pub async fn add_tag(
        &self,
        plc: &Plc,
        period: Duration,
        tag: &str,
        elements: u16,
    ) -> Result<Arc<TagInfo>> {
        let mut core = plc.core.lock().await;

        if let Some(existing) = core
            .lists
            .iter()
            .flat_map(|l| l.tags.iter())
            .find(|t| t.tag() == tag)
            .cloned()
        {
            let current_list = existing.lock().list;
            if period < core.lists[current_list].period {
                let target = find_or_create_list(&mut core.lists, period);
                core.lists[current_list]
                    .tags
                    .retain(|t| !Arc::ptr_eq(t, &existing));
                core.lists[target].tags.push(existing.clone());
                existing.lock().list = target;
                debug!(plc = plc.name(), tag, period = ?period, "tag migrated to faster list");
            }
            let mut st = existing.lock();
            st.element_count = st.element_count.max(elements);
            drop(st);
            return Ok(existing);
        }

        let target = find_or_create_list(&mut core.lists, period);
        let info = TagInfo::new(tag, target, elements)?;
        core.lists[target].tags.push(info.clone());
        debug!(plc = plc.name(), tag, period = ?period, elements, "tag added");
        Ok(info)
    }

    /// Register a subscriber; adding the same `Arc` twice is a no-op.
    pub fn add_callback(&self, tag: &TagInfo, subscriber: Subscriber) {
        let mut st = tag.lock();
        if !st.subscribers.iter().any(|s| Arc::ptr_eq(s, &subscriber)) {
            st.subscribers.push(subscriber);
        }
    }

    /// Remove a subscriber by identity.
    pub fn remove_callback(&self, tag: &TagInfo, subscriber: &Subscriber) {
        tag.lock().subscribers.retain(|s| !Arc::ptr_eq(s, subscriber));
    }

    /// Spawn workers for every PLC that does not have one running.
    pub fn start(&self) {
        for plc in self.plcs_snapshot() {
            if !plc.worker_running() {
                let handle = scan::spawn_worker(
                    plc.clone(),
                    scan::ScanConfig::from_driver(&self.cfg),
                    self.shutdown.subscribe(),
                );
                plc.set_worker(handle);
            }
        }
    }

    /// Disconnect every PLC and make sure its worker is running; the next
    /// cycle reconnects and rediscovers.
    pub async fn restart(&self) {
        for plc in self.plcs_snapshot() {
            let mut core = plc.core.lock().await;
            if let Some(session) = core.session.take() {
                session.close().await;
            }
            drop(core);
            info!(plc = plc.name(), "restart requested");
        }
        self.start();
    }

    /// Signal all workers to stop and wait for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for plc in self.plcs_snapshot() {
            if let Some(handle) = plc.take_worker() {
                let _ = handle.await;
            }
        }
    }

    pub async fn reset_statistics(&self) {
        for plc in self.plcs_snapshot() {
            let mut core = plc.core.lock().await;
            core.errors = 0;
            for list in &mut core.lists {
                list.stats.reset();
            }
            drop(core);
            plc.slow_scans.reset();
        }
    }

    /// Human-readable state. Levels are cumulative: 0 = PLCs, 1 = identity,
    /// 2 = scan lists, 3 = tags.
    pub async fn report(&self, level: u8) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for plc in self.plcs_snapshot() {
            let snap = plc.snapshot().await;
            let _ = writeln!(
                out,
                "PLC {} {}:{} slot {} {} errors {} slow scans {}",
                snap.name,
                snap.host,
                snap.port,
                snap.slot,
                if snap.connected { "connected" } else { "disconnected" },
                snap.errors,
                snap.slow_scans,
            );
            if level >= 1 {
                if let Some(id) = &snap.identity {
                    let _ = writeln!(
                        out,
                        "  identity: vendor {} device type {} revision {} serial 0x{:08X} '{}'",
                        id.vendor, id.device_type, id.revision, id.serial, id.name
                    );
                }
            }
            if level >= 2 {
                for list in &snap.lists {
                    let _ = writeln!(
                        out,
                        "  list @{:?} {} tags {} errors {} last {:?} min {:?} max {:?}",
                        list.period,
                        if list.enabled { "enabled" } else { "disabled" },
                        list.tag_count,
                        list.stats.errors,
                        list.stats.last,
                        list.stats.min,
                        list.stats.max,
                    );
                }
            }
            if level >= 3 {
                let core = plc.core.lock().await;
                for list in &core.lists {
                    for tag in &list.tags {
                        let st = tag.lock();
                        let _ = writeln!(
                            out,
                            "    tag {} elements {} r {}/{} w {}/{} valid {}",
                            tag.tag(),
                            st.element_count,
                            st.r_req,
                            st.r_resp,
                            st.w_req,
                            st.w_resp,
                            st.valid_len,
                        );
                    }
                }
            }
        }
        out
    }

    /// Hex dump of every tag's valid data.
    pub async fn dump(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for plc in self.plcs_snapshot() {
            let _ = writeln!(out, "PLC {}", plc.name());
            let core = plc.core.lock().await;
            for list in &core.lists {
                for tag in &list.tags {
                    let st = tag.lock();
                    let _ = write!(out, "  {} =", tag.tag());
                    if st.valid_len == 0 {
                        let _ = writeln!(out, " (no valid data)");
                    } else {
                        for byte in &st.value[..st.valid_len] {
                            let _ = write!(out, " {byte:02X}");
                        }
                        let _ = writeln!(out);
                    }
                }
            }
        }
        out
    }
}

fn find_or_create_list(lists: &mut Vec<ScanList>, period: Duration) -> ScanListId {
    if let Some(idx) = lists.iter().position(|l| l.period == period) {
        return idx;
    }
    lists.push(ScanList::new(period));
    lists.len() - 1
}
