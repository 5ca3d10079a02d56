// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Moving instances between cores.
//!
//! Rebalance passes only queue instances; the moves run on a dedicated worker thread so the
//! command-submission path never blocks on a migration.

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use sync::Condvar;
use sync::Mutex;

use crate::core_handle::InstState;
use crate::core_handle::WorkKind;
use crate::device::Device;
use crate::hwlock::HwLock;
use crate::hwlock::LockOwner;
use crate::instance::Instance;
use crate::instance::OpCoreType;
use crate::instance::OpMode;
use crate::mode_switch::switch_to_multi;
use crate::CoreId;
use crate::Error;
use crate::Result;
use crate::DEC_DEFAULT_CORE;

/// Moves an instance that has not produced output yet: deinit on `from`, init on `to`.
pub(crate) fn move_core_open(
    dev: &Device,
    inst: &Arc<Instance>,
    to: CoreId,
    from: CoreId,
) -> Result<()> {
    info!("{}: open core changed {} -> {}", inst.id(), from, to);
    let from_core = dev.core(from)?;
    let to_core = dev.core(to)?;
    from_core.instance_deinit(inst)?;
    if !from_core.pending_work().is_empty() {
        if let Err(e) = from_core.request_work(WorkKind::Butler, None) {
            debug!("{}: {}", from, e);
        }
    }

    inst.mode().set_core_num(to);
    if let Err(e) = to_core.instance_init(inst) {
        error!("{}: init on {} failed: {}", inst.id(), to, e);
        inst.mode().op_core = [None, None];
        return Err(e);
    }
    Ok(())
}

/// Live-migrates a running single-core instance from `from` to `to`.
///
/// The destination is pointed at the origin core's firmware and context image, then the origin
/// hands the instance over. Any failure leaves the instance running on `from` exactly as before.
pub(crate) fn move_core_running(
    dev: &Device,
    inst: &Instance,
    to: CoreId,
    from: CoreId,
) -> Result<()> {
    let id = inst.id();
    let from_core = dev.core(from)?;
    let to_core = dev.core(to)?;
    let ctx = from_core.context(id).ok_or_else(|| {
        error!("{}: no context on {}", id, from);
        Error::NoContext {
            instance: id,
            core: from,
        }
    })?;
    if ctx.state() != InstState::Running {
        debug!("{}: not running ({:?})", id, ctx.state());
        return Err(Error::NotRunning(id));
    }

    let _migration = inst.migration();
    let mut mode = inst.mode();
    if mode.op_mode != OpMode::Single {
        error!("{}: {:?} must switch to single before migrating", id, mode.op_mode);
        return Err(Error::MultiCoreMode(id));
    }

    let from_guard = from_core.lock_hw(LockOwner::Manager)?;
    ctx.set_state(InstState::MoveInst);

    let to_guard = match to_core.lock_hw(LockOwner::Manager) {
        Ok(guard) => guard,
        Err(e) => {
            error!("{}: {} hwlock: {}", id, to, e);
            ctx.set_state(InstState::Running);
            return Err(e);
        }
    };

    let handoff = || -> Result<()> {
        if from_core.is_sleeping() {
            return Err(Error::CoreAsleep(from));
        }
        if to_core.is_sleeping() {
            return Err(Error::CoreAsleep(to));
        }
        to_core.ops().instance_move_to(to_core, inst)?;
        let (fw_addr, ctx_addr) = from_core.ensure_firmware()?.addrs(inst.params().is_drm);
        to_core
            .ops()
            .set_migration_addr(to_core, inst, fw_addr, ctx_addr)?;
        from_core.ops().instance_move_from(from_core, inst)
    };
    if let Err(e) = handoff() {
        error!("{}: migration {} -> {} failed: {}", id, from, to, e);
        ctx.set_state(InstState::Running);
        return Err(e);
    }

    from_core.remove_context(id);
    to_core.insert_context(Arc::clone(&ctx));
    mode.set_core_num(to);
    mode.move_to = None;
    from_core.clear_work(id);
    inst.queues().transfer_core_src(from, to);
    HwLock::transfer_waiter(from_core.hwlock(), to_core.hwlock(), id);
    drop(to_guard);
    drop(from_guard);

    ctx.set_state(InstState::Running);
    to_core.qos_on(inst);
    from_core.qos_off(inst);
    drop(mode);

    info!("{}: migrated {} -> {}", id, from, to);
    dev.request_butler(Some(inst));
    Ok(())
}

/// Moves every instance onto a single core chosen to satisfy all fixed-core instances. Returns
/// how many instances moved.
///
/// Does nothing while any instance is in a dual-core mode, while the fixed-core instances need
/// both cores, or while the migration worker has work. The moves run one at a time under the
/// device migration lock.
pub(crate) fn migrate_all_to_one_core(dev: &Device) -> Result<usize> {
    if dev.migration.is_busy() {
        debug!("migration already in flight");
        return Ok(0);
    }

    let mut moves = Vec::new();
    let target = {
        let list = dev.load_list.lock();
        if list.is_empty() {
            debug!("no instance to gather");
            return Ok(0);
        }
        let (mut fixed0, mut fixed1) = (0, 0);
        let (mut on_core0, mut on_core1) = (0, 0);
        for inst in list.iter() {
            let mode = inst.mode_snapshot();
            if mode.op_mode != OpMode::Single {
                info!("{} is in {:?}, cannot gather", inst.id(), mode.op_mode);
                return Ok(0);
            }
            match mode.op_core_type {
                OpCoreType::Fixed0 => fixed0 += 1,
                OpCoreType::Fixed1 => fixed1 += 1,
                OpCoreType::All | OpCoreType::NotFixed => {}
            }
            match mode.master() {
                Some(CoreId(0)) => on_core0 += 1,
                Some(CoreId(1)) => on_core1 += 1,
                _ => {}
            }
        }

        let target = match (fixed0 > 0, fixed1 > 0) {
            (true, true) => {
                info!("fixed-core instances need both cores");
                return Ok(0);
            }
            (false, false) if on_core0 == 0 || on_core1 == 0 => {
                debug!("all instances already on one core");
                return Ok(0);
            }
            (false, false) => DEC_DEFAULT_CORE,
            (true, false) => CoreId(0),
            (false, true) => CoreId(1),
        };
        let target_core = dev.core(target)?;

        for core in &dev.cores {
            core.set_total_mb(0);
        }
        for inst in list.iter() {
            target_core.add_total_mb(inst.weighted_mb());
            match inst.mode_snapshot().master() {
                Some(master) if master != target => moves.push((Arc::clone(inst), master)),
                _ => debug!("{}: keep {}", inst.id(), target),
            }
        }
        target
    };

    info!("gathering all instances on {}", target);
    let mut moved = 0;
    for (inst, from) in moves {
        let _migrate = dev.migrate_lock.lock();
        match move_core_running(dev, &inst, target, from) {
            Ok(()) => moved += 1,
            Err(e) => info!("{}: migration stopped: {}", inst.id(), e),
        }
    }
    Ok(moved)
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Arc<Instance>>,
    running: bool,
    shutdown: bool,
}

/// Instances waiting for the migration worker.
pub(crate) struct MigrationQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl MigrationQueue {
    pub(crate) fn new() -> MigrationQueue {
        MigrationQueue {
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
        }
    }

    /// True while instances are queued or a batch is being processed.
    pub(crate) fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.running || !state.pending.is_empty()
    }

    /// Queues a batch unless another one is queued or running.
    pub(crate) fn enqueue_if_idle(&self, batch: Vec<Arc<Instance>>) -> bool {
        let mut state = self.state.lock();
        if state.running || !state.pending.is_empty() || state.shutdown {
            return false;
        }
        state.pending = batch;
        self.changed.notify_all();
        true
    }

    fn take_batch(&self) -> Option<Vec<Arc<Instance>>> {
        let state = self.state.lock();
        let mut state = self
            .changed
            .wait_while(state, |s| s.pending.is_empty() && !s.shutdown);
        if state.shutdown {
            return None;
        }
        state.running = true;
        Some(std::mem::take(&mut state.pending))
    }

    fn finish_batch(&self) {
        self.state.lock().running = false;
        self.changed.notify_all();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.pending.clear();
        self.changed.notify_all();
    }

    /// Blocks until the queue is idle or `timeout` elapsed. Returns true when idle.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.state.lock();
        let (state, _) = self.changed.wait_timeout_while(state, timeout, |s| {
            (s.running || !s.pending.is_empty()) && !s.shutdown
        });
        !state.running && state.pending.is_empty()
    }
}

/// Runs one queued batch. Stops at the first failed instance and leaves the rest where they are.
fn run_migration_batch(dev: &Device, batch: &[Arc<Instance>]) -> Result<()> {
    let mut result = Ok(());
    for inst in batch {
        if result.is_err() {
            debug!("{}: skipped after an earlier failure", inst.id());
            continue;
        }
        if inst.mode().op_mode.is_switch_single() {
            if batch.len() > 1 {
                error!("{}: dual-core mode needs the device to itself", inst.id());
                result = Err(Error::MultiCoreMode(inst.id()));
            } else {
                info!("{}: returning to its dual-core mode", inst.id());
                result = switch_to_multi(dev, inst);
            }
            continue;
        }

        let _migrate = dev.migrate_lock.lock();
        let mode = inst.mode_snapshot();
        let (Some(from), Some(to)) = (mode.master(), mode.move_to) else {
            debug!("{}: nothing to move", inst.id());
            continue;
        };
        result = move_core_running(dev, inst, to, from);
        if let Err(e) = &result {
            info!("{}: migration stopped: {}", inst.id(), e);
        }
    }
    debug!("migration batch of {} finished", batch.len());
    dev.request_butler(None);
    result
}

/// Background thread that drains the migration queue. Stopped and joined on drop.
pub(crate) struct MigrationWorker {
    dev: Arc<Device>,
    handle: Option<JoinHandle<()>>,
}

impl MigrationWorker {
    pub(crate) fn start(dev: Arc<Device>) -> Result<MigrationWorker> {
        let thread_dev = Arc::clone(&dev);
        let handle = thread::Builder::new()
            .name("rm_migration".to_string())
            .spawn(move || {
                while let Some(batch) = thread_dev.migration.take_batch() {
                    if let Err(e) = run_migration_batch(&thread_dev, &batch) {
                        debug!("migration batch: {}", e);
                    }
                    thread_dev.migration.finish_batch();
                }
            })
            .map_err(|e| Error::SpawnWorker(e.to_string()))?;
        Ok(MigrationWorker {
            dev,
            handle: Some(handle),
        })
    }
}

impl Drop for MigrationWorker {
    fn drop(&mut self) {
        self.dev.migration.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("migration worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RmConfig;
    use crate::core_handle::CoreOps;
    use crate::fake::FakeCoreOps;
    use crate::Codec;
    use crate::InstanceKind;
    use crate::InstanceParams;

    fn device() -> (Arc<FakeCoreOps>, Device) {
        let fake = Arc::new(FakeCoreOps::new());
        let ops: Vec<Arc<dyn CoreOps>> = vec![fake.clone(), fake.clone()];
        let config = RmConfig {
            hwlock_timeout_ms: 20,
            ..Default::default()
        };
        (fake, Device::new(config, ops).unwrap())
    }

    fn running_on(dev: &Device, core: CoreId, codec: Codec) -> Arc<Instance> {
        let inst = dev
            .insert_instance(InstanceParams {
                kind: InstanceKind::Decoder,
                codec,
                resolution: Default::default(),
                is_drm: false,
            })
            .unwrap();
        let (op_core_type, _) = inst.params().core_class();
        dev.core(core).unwrap().instance_init(&inst).unwrap();
        dev.core(core)
            .unwrap()
            .context(inst.id())
            .unwrap()
            .set_state(InstState::Running);
        let mut mode = inst.mode();
        mode.op_core_type = op_core_type;
        mode.set_core_num(core);
        drop(mode);
        inst
    }

    #[test]
    fn move_running_rehomes_everything() {
        let (fake, dev) = device();
        let inst = running_on(&dev, CoreId(0), Codec::H264);
        {
            let mut q = inst.queues();
            q.queue_src(0, false);
            q.queue_src(1, false);
            q.move_all_ready_to_core(CoreId(0));
        }
        dev.cores[0].hwlock().add_waiter(inst.id());
        move_core_running(&dev, &inst, CoreId(1), CoreId(0)).unwrap();

        assert_eq!(inst.mode_snapshot().master(), Some(CoreId(1)));
        assert!(!dev.cores[0].has_context(inst.id()));
        let ctx = dev.cores[1].context(inst.id()).unwrap();
        assert_eq!(ctx.core(), CoreId(1));
        assert_eq!(ctx.state(), InstState::Running);
        assert_eq!(inst.queues().core_indices(CoreId(1)), vec![0, 1]);
        assert_eq!(dev.cores[1].hwlock().waiters(), vec![inst.id()]);
        assert_eq!(dev.cores[1].qos_holders(), vec![inst.id()]);
        let image = dev.cores[0].firmware().unwrap();
        assert_eq!(
            fake.migration_addrs(),
            vec![(CoreId(1), image.fw_addr, image.ctx_addr)]
        );
    }

    #[test]
    fn failed_move_from_rolls_back() {
        let (fake, dev) = device();
        let inst = running_on(&dev, CoreId(0), Codec::H264);
        fake.fail("instance_move_from", None);
        let before = inst.mode_snapshot();
        let err = move_core_running(&dev, &inst, CoreId(1), CoreId(0)).unwrap_err();
        assert!(matches!(err, Error::CoreOp { .. }));
        assert_eq!(inst.mode_snapshot(), before);
        let ctx = dev.cores[0].context(inst.id()).unwrap();
        assert_eq!(ctx.state(), InstState::Running);
        assert!(!dev.cores[1].has_context(inst.id()));
        assert_eq!(dev.cores[0].hwlock().owner(), None);
        assert_eq!(dev.cores[1].hwlock().owner(), None);
    }

    #[test]
    fn not_running_is_retryable() {
        let (_fake, dev) = device();
        let inst = running_on(&dev, CoreId(0), Codec::H264);
        dev.cores[0]
            .context(inst.id())
            .unwrap()
            .set_state(InstState::HeadParsed);
        let err = move_core_running(&dev, &inst, CoreId(1), CoreId(0)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn move_open_reinitializes() {
        let (fake, dev) = device();
        let inst = running_on(&dev, CoreId(0), Codec::H264);
        move_core_open(&dev, &inst, CoreId(1), CoreId(0)).unwrap();
        assert!(dev.cores[1].has_context(inst.id()));
        assert!(!dev.cores[0].has_context(inst.id()));
        assert_eq!(fake.count("instance_deinit"), 1);
        assert_eq!(fake.count("instance_init"), 2);
    }

    #[test]
    fn gather_follows_fixed_instances() {
        let (_fake, dev) = device();
        let av1 = running_on(&dev, CoreId(1), Codec::Av1);
        let free = running_on(&dev, CoreId(0), Codec::H264);
        av1.set_load(10, true);
        free.set_load(20, true);
        dev.load_list.lock().extend([free.clone(), av1.clone()]);
        assert_eq!(migrate_all_to_one_core(&dev).unwrap(), 1);
        assert_eq!(free.mode_snapshot().master(), Some(CoreId(1)));
        assert_eq!(dev.cores[1].total_mb(), 30);
        assert_eq!(dev.cores[0].total_mb(), 0);
    }

    #[test]
    fn gather_refuses_conflicting_fixed_cores() {
        let (_fake, dev) = device();
        let av1 = running_on(&dev, CoreId(1), Codec::Av1);
        let vp9 = running_on(&dev, CoreId(0), Codec::Vp9);
        dev.load_list.lock().extend([av1.clone(), vp9.clone()]);
        assert_eq!(migrate_all_to_one_core(&dev).unwrap(), 0);
        assert_eq!(av1.mode_snapshot().master(), Some(CoreId(1)));
        assert_eq!(vp9.mode_snapshot().master(), Some(CoreId(0)));
    }

    #[test]
    fn rejoin_needs_the_device_to_itself() {
        let (fake, dev) = device();
        let collapsed = running_on(&dev, CoreId(1), Codec::Hevc);
        {
            let mut mode = collapsed.mode();
            mode.stream_op_mode = OpMode::TwoMode2;
            mode.set_op_mode(OpMode::SwitchToSingle);
        }
        let free = running_on(&dev, CoreId(0), Codec::H264);
        free.mode().move_to = Some(CoreId(1));

        let err = run_migration_batch(&dev, &[collapsed.clone(), free.clone()]).unwrap_err();
        assert_eq!(err, Error::MultiCoreMode(collapsed.id()));
        assert_eq!(collapsed.mode_snapshot().op_mode, OpMode::SwitchToSingle);
        assert_eq!(collapsed.mode_snapshot().master(), Some(CoreId(1)));
        // The rest of the batch is skipped.
        assert_eq!(free.mode_snapshot().master(), Some(CoreId(0)));
        assert_eq!(fake.count("instance_move_to"), 0);
    }

    #[test]
    fn queue_accepts_one_batch_at_a_time() {
        let (_fake, dev) = device();
        let inst = running_on(&dev, CoreId(0), Codec::H264);
        assert!(!dev.migration.is_busy());
        assert!(dev.migration.enqueue_if_idle(vec![inst.clone()]));
        assert!(dev.migration.is_busy());
        assert!(!dev.migration.enqueue_if_idle(vec![inst]));
        assert!(!dev.migration.wait_idle(Duration::from_millis(10)));
    }
}
