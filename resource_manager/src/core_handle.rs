// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Physical core handles and the interface to the per-core command layer.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use log::debug;
use log::error;
use serde::Serialize;
use sync::create_promise_and_waitable;
use sync::Mutex;
use sync::Promise;
use sync::Waitable;

use crate::buffer::BufferQueues;
use crate::config::RmConfig;
use crate::hwlock::HwLock;
use crate::hwlock::HwLockGuard;
use crate::hwlock::LockOwner;
use crate::instance::Instance;
use crate::CoreId;
use crate::Error;
use crate::InstanceId;
use crate::Result;

/// Hardware lifecycle state of an instance on one core. Ordered as the lifecycle progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstState {
    Free,
    Init,
    GotInst,
    HeadParsed,
    DpbFlushing,
    Running,
    Finishing,
    Finished,
    MoveInst,
    ReturnInst,
    Error,
    Abort,
}

/// Comparator for [`InstState`] queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateQuery {
    Equal,
    Bigger,
    Smaller,
    EqualBigger,
    EqualSmaller,
    /// Satisfied when either core of a dual-core instance is in the state.
    EqualOr,
}

impl StateQuery {
    pub fn matches(self, actual: InstState, state: InstState) -> bool {
        match self {
            StateQuery::Equal | StateQuery::EqualOr => actual == state,
            StateQuery::Bigger => actual > state,
            StateQuery::Smaller => actual < state,
            StateQuery::EqualBigger => actual >= state,
            StateQuery::EqualSmaller => actual <= state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    /// Something may be ready; scan every context of the core.
    Butler,
    /// A specific instance got new work.
    Try,
}

/// Device addresses of a core's firmware and shared context memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareImage {
    pub fw_addr: u64,
    pub ctx_addr: u64,
    pub drm_fw_addr: u64,
    pub drm_ctx_addr: u64,
}

impl FirmwareImage {
    /// Firmware and context addresses for a normal or protected session.
    pub fn addrs(&self, is_drm: bool) -> (u64, u64) {
        if is_drm {
            (self.drm_fw_addr, self.drm_ctx_addr)
        } else {
            (self.fw_addr, self.ctx_addr)
        }
    }
}

/// Per-instance state on one core.
pub struct CoreContext {
    id: InstanceId,
    instance: Weak<Instance>,
    core: Mutex<CoreId>,
    state: Mutex<InstState>,
    inst_no: Mutex<Option<u32>>,
    seq_done: Mutex<Option<Promise>>,
}

impl CoreContext {
    fn new(core: CoreId, instance: &Arc<Instance>) -> CoreContext {
        CoreContext {
            id: instance.id(),
            instance: Arc::downgrade(instance),
            core: Mutex::new(core),
            state: Mutex::new(InstState::Init),
            inst_no: Mutex::new(None),
            seq_done: Mutex::new(None),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn instance(&self) -> Option<Arc<Instance>> {
        self.instance.upgrade()
    }

    pub fn core(&self) -> CoreId {
        *self.core.lock()
    }

    pub fn state(&self) -> InstState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: InstState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("{} on {}: {:?} -> {:?}", self.id, self.core(), *current, state);
            *current = state;
        }
    }

    /// Hardware instance number, valid while open on the core.
    pub fn inst_no(&self) -> Option<u32> {
        *self.inst_no.lock()
    }

    pub fn set_inst_no(&self, inst_no: Option<u32>) {
        *self.inst_no.lock() = inst_no;
    }

    /// Prepares a wait for the next header-parse completion on this context.
    pub fn arm_seq_done(&self) -> Waitable {
        let (promise, waitable) = create_promise_and_waitable();
        *self.seq_done.lock() = Some(promise);
        waitable
    }

    /// Reports header-parse completion to whoever armed the wait.
    pub fn signal_seq_done(&self) {
        if let Some(promise) = self.seq_done.lock().take() {
            promise.signal();
        }
    }
}

/// Operations of the per-core command layer.
///
/// Implementations own the command submission to the hardware. They are called without the
/// instance mode lock held; `request_work` may call back into [`Instance::src_issued`].
pub trait CoreOps: Send + Sync {
    fn load_firmware(&self, core: &Core) -> Result<FirmwareImage>;
    fn instance_init(&self, core: &Core, inst: &Instance) -> Result<()>;
    fn instance_open(&self, core: &Core, inst: &Instance) -> Result<()>;
    fn instance_deinit(&self, core: &Core, inst: &Instance) -> Result<()>;
    /// Prepares the destination core's context for an incoming instance without starting it.
    fn instance_move_to(&self, core: &Core, inst: &Instance) -> Result<()>;
    /// Completes the handoff and closes the origin core's hardware context.
    fn instance_move_from(&self, core: &Core, inst: &Instance) -> Result<()>;
    /// Points `core` at another core's firmware and shared context image.
    fn set_migration_addr(
        &self,
        core: &Core,
        inst: &Instance,
        fw_addr: u64,
        ctx_addr: u64,
    ) -> Result<()>;
    fn instance_cache_flush(&self, core: &Core, inst: &Instance) -> Result<()>;
    fn instance_dpb_flush(&self, core: &Core, inst: &Instance) -> Result<()>;
    fn instance_finishing(&self, core: &Core, inst: &Instance) -> Result<()>;
    fn instance_q_flush(&self, core: &Core, inst: &Instance) -> Result<()>;
    fn instance_csd_parsing(&self, core: &Core, inst: &Instance) -> Result<()>;
    fn instance_init_buf(&self, core: &Core, inst: &Instance) -> Result<()>;
    fn request_work(&self, core: &Core, kind: WorkKind, inst: Option<&Instance>) -> Result<()>;
    fn qos_on(&self, core: &Core, inst: &Instance);
    fn qos_off(&self, core: &Core, inst: &Instance);
    /// Returns true when the core's idle state changed and the QoS request must be refreshed.
    fn qos_idle_trigger(&self, _core: &Core, _inst: &Instance) -> bool {
        false
    }
}

/// One physical execution core.
pub struct Core {
    id: CoreId,
    ops: Arc<dyn CoreOps>,
    max_mb: Option<u64>,
    hwlock: HwLock,
    contexts: Mutex<BTreeMap<InstanceId, Arc<CoreContext>>>,
    work: Mutex<BTreeSet<InstanceId>>,
    total_mb: AtomicU64,
    sleeping: AtomicBool,
    firmware: Mutex<Option<FirmwareImage>>,
    qos: Mutex<BTreeSet<InstanceId>>,
    drm_active: AtomicBool,
}

impl Core {
    pub fn new(id: CoreId, ops: Arc<dyn CoreOps>, config: &RmConfig) -> Core {
        Core {
            id,
            ops,
            max_mb: config.max_mb_for(id),
            hwlock: HwLock::new(id, config.hwlock_timeout()),
            contexts: Mutex::new(BTreeMap::new()),
            work: Mutex::new(BTreeSet::new()),
            total_mb: AtomicU64::new(0),
            sleeping: AtomicBool::new(false),
            firmware: Mutex::new(None),
            qos: Mutex::new(BTreeSet::new()),
            drm_active: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn ops(&self) -> &dyn CoreOps {
        self.ops.as_ref()
    }

    pub fn max_mb(&self) -> Option<u64> {
        self.max_mb
    }

    pub fn hwlock(&self) -> &HwLock {
        &self.hwlock
    }

    /// Takes the hardware lock. Fails immediately while the core is suspended.
    pub fn lock_hw(&self, owner: LockOwner) -> Result<HwLockGuard> {
        if self.is_sleeping() {
            return Err(Error::CoreAsleep(self.id));
        }
        self.hwlock.acquire(owner)
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    pub fn suspend(&self) {
        self.sleeping.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.sleeping.store(false, Ordering::Release);
    }

    pub fn total_mb(&self) -> u64 {
        self.total_mb.load(Ordering::Relaxed)
    }

    pub(crate) fn set_total_mb(&self, mb: u64) {
        self.total_mb.store(mb, Ordering::Relaxed);
    }

    pub(crate) fn add_total_mb(&self, mb: u64) {
        self.total_mb.fetch_add(mb, Ordering::Relaxed);
    }

    /// Current load in percent of capacity, `None` without a usable capacity.
    pub fn load_percent(&self) -> Option<u64> {
        self.max_mb.map(|max| self.total_mb() * 100 / max)
    }

    pub fn context(&self, id: InstanceId) -> Option<Arc<CoreContext>> {
        self.contexts.lock().get(&id).cloned()
    }

    pub fn has_context(&self, id: InstanceId) -> bool {
        self.contexts.lock().contains_key(&id)
    }

    pub fn context_ids(&self) -> Vec<InstanceId> {
        self.contexts.lock().keys().copied().collect()
    }

    pub(crate) fn insert_context(&self, ctx: Arc<CoreContext>) {
        *ctx.core.lock() = self.id;
        self.contexts.lock().insert(ctx.id(), ctx);
    }

    pub(crate) fn remove_context(&self, id: InstanceId) -> Option<Arc<CoreContext>> {
        self.contexts.lock().remove(&id)
    }

    pub fn has_work(&self, id: InstanceId) -> bool {
        self.work.lock().contains(&id)
    }

    pub fn pending_work(&self) -> Vec<InstanceId> {
        self.work.lock().iter().copied().collect()
    }

    pub fn clear_work(&self, id: InstanceId) -> bool {
        self.work.lock().remove(&id)
    }

    /// Returns the cached firmware image, loading it on first use.
    pub fn ensure_firmware(&self) -> Result<FirmwareImage> {
        let mut firmware = self.firmware.lock();
        if let Some(image) = *firmware {
            return Ok(image);
        }
        let image = self.ops.load_firmware(self)?;
        debug!("{}: firmware loaded at {:#x}", self.id, image.fw_addr);
        *firmware = Some(image);
        Ok(image)
    }

    pub fn firmware(&self) -> Option<FirmwareImage> {
        *self.firmware.lock()
    }

    pub fn drm_active(&self) -> bool {
        self.drm_active.load(Ordering::Relaxed)
    }

    pub fn set_drm_active(&self, active: bool) {
        self.drm_active.store(active, Ordering::Relaxed);
    }

    /// Whether a context in `state` has something to run with the given queues.
    pub fn is_ready(&self, state: InstState, queues: &BufferQueues) -> bool {
        let has_src = queues.core_count(self.id) > 0;
        let has_dst = queues.dst_count() > 0;
        match state {
            InstState::GotInst => has_src,
            InstState::HeadParsed => has_dst,
            InstState::Running => has_src && has_dst,
            InstState::Finishing => has_dst,
            _ => false,
        }
    }

    /// Marks `inst` as having work on this core if its context is ready. Returns the readiness.
    pub fn ready_set_bit(&self, inst: &Instance) -> bool {
        let Some(ctx) = self.context(inst.id()) else {
            return false;
        };
        let ready = self.is_ready(ctx.state(), &inst.queues());
        if ready {
            self.work.lock().insert(inst.id());
        }
        ready
    }

    /// Creates the instance's context here and initializes it in the command layer.
    pub fn instance_init(&self, inst: &Arc<Instance>) -> Result<()> {
        self.insert_context(Arc::new(CoreContext::new(self.id, inst)));
        if let Err(e) = self.ops.instance_init(self, inst) {
            self.remove_context(inst.id());
            return Err(e);
        }
        Ok(())
    }

    pub fn instance_open(&self, inst: &Instance) -> Result<()> {
        if !self.has_context(inst.id()) {
            return Err(Error::NoContext {
                instance: inst.id(),
                core: self.id,
            });
        }
        self.ops.instance_open(self, inst)
    }

    /// Closes the instance here. The context is dropped even when the command layer fails.
    pub fn instance_deinit(&self, inst: &Instance) -> Result<()> {
        if !self.has_context(inst.id()) {
            return Err(Error::NoContext {
                instance: inst.id(),
                core: self.id,
            });
        }
        let result = self.ops.instance_deinit(self, inst);
        if let Err(e) = &result {
            error!("{}: deinit of {} failed: {}", self.id, inst.id(), e);
        }
        self.clear_work(inst.id());
        self.hwlock.remove_waiter(inst.id());
        self.qos_off(inst);
        self.remove_context(inst.id());
        result
    }

    pub fn request_work(&self, kind: WorkKind, inst: Option<&Instance>) -> Result<()> {
        self.ops.request_work(self, kind, inst)
    }

    pub fn qos_on(&self, inst: &Instance) {
        self.qos.lock().insert(inst.id());
        self.ops.qos_on(self, inst);
    }

    pub fn qos_off(&self, inst: &Instance) {
        if self.qos.lock().remove(&inst.id()) {
            self.ops.qos_off(self, inst);
        }
    }

    pub fn qos_holders(&self) -> Vec<InstanceId> {
        self.qos.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_queries() {
        assert!(StateQuery::EqualBigger.matches(InstState::MoveInst, InstState::Running));
        assert!(StateQuery::Smaller.matches(InstState::GotInst, InstState::Running));
        assert!(!StateQuery::Bigger.matches(InstState::Running, InstState::Running));
        assert!(StateQuery::EqualSmaller.matches(InstState::Running, InstState::Running));
    }

    #[test]
    fn readiness_rules() {
        let core = Core::new(
            CoreId(0),
            Arc::new(crate::fake::FakeCoreOps::new()),
            &RmConfig::default(),
        );
        let mut queues = BufferQueues::default();
        assert!(!core.is_ready(InstState::GotInst, &queues));
        queues.queue_src(0, false);
        assert!(!core.is_ready(InstState::GotInst, &queues));
        queues.move_ready_head_to_core(CoreId(0));
        assert!(core.is_ready(InstState::GotInst, &queues));
        assert!(!core.is_ready(InstState::Running, &queues));
        queues.queue_dst(0);
        assert!(core.is_ready(InstState::Running, &queues));
        assert!(core.is_ready(InstState::HeadParsed, &queues));
        assert!(!core.is_ready(InstState::MoveInst, &queues));
    }

    #[test]
    fn seq_done_wakes_armed_waiter() {
        let inst = Arc::new(Instance::new(
            InstanceId(0),
            crate::InstanceParams {
                kind: crate::InstanceKind::Decoder,
                codec: crate::Codec::Hevc,
                resolution: Default::default(),
                is_drm: false,
            },
        ));
        let ctx = CoreContext::new(CoreId(1), &inst);
        let waitable = ctx.arm_seq_done();
        ctx.signal_seq_done();
        assert!(waitable.is_signaled());
        // A second signal without an armed waiter is a no-op.
        ctx.signal_seq_done();
        assert_eq!(ctx.instance().map(|i| i.id()), Some(InstanceId(0)));
    }

    #[test]
    fn firmware_addresses_by_session_type() {
        let image = FirmwareImage {
            fw_addr: 1,
            ctx_addr: 2,
            drm_fw_addr: 3,
            drm_ctx_addr: 4,
        };
        assert_eq!(image.addrs(false), (1, 2));
        assert_eq!(image.addrs(true), (3, 4));
    }
}
