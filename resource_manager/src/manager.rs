// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Entry points used by the device open/release, streaming and buffer-queueing paths.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;

use crate::config::RmConfig;
use crate::core_handle::Core;
use crate::core_handle::CoreOps;
use crate::core_handle::InstState;
use crate::core_handle::StateQuery;
use crate::core_handle::WorkKind;
use crate::device::Device;
use crate::hwlock::LockOwner;
use crate::instance::Instance;
use crate::instance::InstanceKind;
use crate::instance::InstanceParams;
use crate::instance::OpCoreType;
use crate::instance::OpMode;
use crate::load_balance;
use crate::load_balance::LoadChange;
use crate::migration;
use crate::migration::MigrationWorker;
use crate::mode_switch;
use crate::CoreId;
use crate::Error;
use crate::InstanceId;
use crate::Result;
use crate::DEC_DEFAULT_CORE;
use crate::ENC_DEFAULT_CORE;

/// Frequency request control for [`ResourceManager::qos_control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosControl {
    On,
    Off,
    /// Re-evaluate after an idle-state or rate change.
    Trigger,
}

/// Queue a stop request applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    /// Decoded pictures / encoded bitstream.
    Capture,
    /// Bitstream to decode / pictures to encode.
    Output,
}

/// The codec resource manager.
///
/// Owns the device state and the migration worker thread; dropping it stops the worker.
pub struct ResourceManager {
    dev: Arc<Device>,
    _worker: MigrationWorker,
}

impl ResourceManager {
    /// Creates a manager over one command layer per physical core.
    pub fn new(config: RmConfig, core_ops: Vec<Arc<dyn CoreOps>>) -> Result<ResourceManager> {
        let dev = Arc::new(Device::new(config, core_ops)?);
        let worker = MigrationWorker::start(Arc::clone(&dev))?;
        info!(
            "resource manager up: {} core(s), balance {}%",
            dev.num_core(),
            dev.core_balance()
        );
        Ok(ResourceManager {
            dev,
            _worker: worker,
        })
    }

    pub fn config(&self) -> &RmConfig {
        &self.dev.config
    }

    pub fn num_cores(&self) -> usize {
        self.dev.num_core()
    }

    pub fn core(&self, id: CoreId) -> Result<&Core> {
        self.dev.core(id)
    }

    pub fn instance(&self, id: InstanceId) -> Result<Arc<Instance>> {
        self.dev.instance(id)
    }

    /// Every open instance in slot order.
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.dev.instances()
    }

    /// Allocates an instance in the lowest free slot.
    pub fn create_instance(&self, params: InstanceParams) -> Result<Arc<Instance>> {
        let inst = self.dev.insert_instance(params)?;
        debug!("{}: created {:?} {:?}", inst.id(), params.kind, params.codec);
        Ok(inst)
    }

    /// Frees the slot of `id` and drops its load from the balance.
    pub fn release_instance(&self, id: InstanceId) -> Result<()> {
        let inst = self.dev.remove_instance(id)?;
        let _lifecycle = inst.lifecycle();
        load_balance::load_balance(&self.dev, &inst, LoadChange::Delete);
        self.dev.multi_core_insts.lock().remove(&id);
        for core in &self.dev.cores {
            if core.has_context(id) {
                error!("{}: released while still open on {}", id, core.id());
            }
            core.clear_work(id);
            core.hwlock().remove_waiter(id);
        }
        debug!("{}: released", id);
        Ok(())
    }

    /// Loads missing firmware images and creates the instance on its kind's default core.
    pub fn instance_init(&self, id: InstanceId) -> Result<()> {
        let inst = self.dev.instance(id)?;
        let _lifecycle = inst.lifecycle();
        for core in &self.dev.cores {
            core.ensure_firmware()?;
        }

        let master = {
            let mut mode = inst.mode();
            mode.set_op_mode(OpMode::Single);
            mode.op_core_type = OpCoreType::NotFixed;
            let master = match inst.params().kind {
                InstanceKind::Decoder => DEC_DEFAULT_CORE,
                InstanceKind::Encoder => ENC_DEFAULT_CORE,
            };
            mode.set_core_num(master);
            master
        };

        debug!("{}: init on {}", id, master);
        if let Err(e) = self.dev.core(master)?.instance_init(&inst) {
            error!("{}: init failed: {}", id, e);
            inst.mode().op_core = [None, None];
            return Err(e);
        }
        Ok(())
    }

    /// Opens the instance on the core its codec class and the current load select.
    pub fn instance_open(&self, id: InstanceId) -> Result<()> {
        let inst = self.dev.instance(id)?;
        let _lifecycle = inst.lifecycle();
        let mut master = inst.mode_snapshot().master().ok_or(Error::NoMasterCore(id))?;

        if self.dev.is_multi_core() {
            let selected = load_balance::get_core_num(&self.dev, &inst);
            if selected != master {
                migration::move_core_open(&self.dev, &inst, selected, master)?;
                master = inst.mode_snapshot().master().ok_or(Error::NoMasterCore(id))?;
            }
            // A dual-core instance gives its borrowed core back to the newcomer.
            let op_core_type = inst.mode_snapshot().op_core_type;
            if let Err(e) = mode_switch::check_multi_core_mode(&self.dev, op_core_type) {
                error!("{}: multi-core instance switching failed: {}", id, e);
                return Err(e);
            }
        }

        self.dev.core(master)?.instance_open(&inst).map_err(|e| {
            error!("{}: open on {} failed: {}", id, master, e);
            e
        })
    }

    /// Closes the instance on every core it is assigned to, slave first.
    pub fn instance_deinit(&self, id: InstanceId) -> Result<()> {
        let inst = self.dev.instance(id)?;
        let _lifecycle = inst.lifecycle();
        let cores: Vec<_> = {
            let mut mode = inst.mode();
            if mode.op_mode.is_switch_single() {
                mode.restore_stream_mode();
            }
            mode.cores().collect()
        };

        let mut result = Ok(());
        for core_id in cores.into_iter().rev() {
            let core = self.dev.core(core_id)?;
            if !core.has_context(id) {
                debug!("{}: nothing to close on {}", id, core_id);
                continue;
            }
            debug!("{}: deinit on {}", id, core_id);
            if let Err(e) = core.instance_deinit(&inst) {
                result = Err(e);
            }
        }

        self.dev.multi_core_insts.lock().remove(&id);
        let mut mode = inst.mode();
        mode.set_op_mode(OpMode::Single);
        mode.op_core_type = OpCoreType::NotFixed;
        result
    }

    /// Brings up the second core for a stream that asks for a dual-core mode.
    pub fn instance_setup(&self, id: InstanceId, op_mode: OpMode) -> Result<()> {
        let inst = self.dev.instance(id)?;
        let _lifecycle = inst.lifecycle();
        mode_switch::instance_setup(&self.dev, &inst, op_mode)
    }

    /// Reports that new work may be available.
    ///
    /// A butler request checks the cores of `id`, or every core without an instance. Any other
    /// request moves the instance's ready buffers to the core(s) that should run them.
    pub fn request_work(&self, kind: WorkKind, id: Option<InstanceId>) -> Result<()> {
        if kind == WorkKind::Butler {
            let inst = id.map(|id| self.dev.instance(id)).transpose()?;
            self.dev.request_butler(inst.as_deref());
            return Ok(());
        }
        let Some(id) = id else {
            error!("{:?} request needs an instance", kind);
            return Ok(());
        };
        let inst = self.dev.instance(id)?;

        let op_mode = inst.mode_snapshot().op_mode;
        match op_mode {
            OpMode::TwoMode2 => {
                self.move_buf_request_work(&inst, kind);
                return Ok(());
            }
            OpMode::Switching => {
                debug!("{}: switching, work deferred", id);
                return Ok(());
            }
            OpMode::TwoMode1
                if self
                    .dev
                    .query_state(&inst, StateQuery::Equal, InstState::HeadParsed) =>
            {
                mode_switch::guarantee_init_buf(&self.dev, &inst);
                return Ok(());
            }
            _ => {}
        }

        let _lifecycle = inst.lifecycle();
        let master = {
            let mode = inst.mode();
            if mode.op_mode == OpMode::TwoMode2 || mode.op_mode == OpMode::Switching {
                debug!("{}: mode changed to {:?}", id, mode.op_mode);
                return Ok(());
            }
            let master = self.dev.master_core(&inst, &mode)?;
            let moved = inst.queues().move_all_ready_to_core(master.id());
            if moved > 0 {
                debug!("{}: {} source buffers to {}", id, moved, master.id());
            }
            if mode.op_mode.is_multi()
                && !self.dev.query_state_locked(
                    &inst,
                    &mode,
                    StateQuery::EqualBigger,
                    InstState::Running,
                )
            {
                debug!("{}: {:?} set but not ready", id, mode.op_mode);
                return Ok(());
            }
            master
        };

        if master.ready_set_bit(&inst) {
            if let Err(e) = master.request_work(kind, Some(inst.as_ref())) {
                debug!("{}: request work failed: {}", master.id(), e);
            }
        }
        Ok(())
    }

    fn move_buf_request_work(&self, inst: &Arc<Instance>, kind: WorkKind) {
        if self
            .dev
            .query_state(inst, StateQuery::Equal, InstState::Running)
        {
            mode_switch::route_mode2(&self.dev, inst);
            return;
        }
        if self
            .dev
            .query_state(inst, StateQuery::Equal, InstState::HeadParsed)
        {
            mode_switch::guarantee_init_buf(&self.dev, inst);
            return;
        }
        // Until both halves run, each core works on its own.
        let mode = inst.mode_snapshot();
        for core_id in mode.cores() {
            let core = match self.dev.core(core_id) {
                Ok(core) => core,
                Err(e) => {
                    error!("{}: {}", inst.id(), e);
                    return;
                }
            };
            let Some(ctx) = core.context(inst.id()) else {
                continue;
            };
            if ctx.state() < InstState::GotInst {
                continue;
            }
            if core.ready_set_bit(inst) {
                if let Err(e) = core.request_work(kind, Some(inst.as_ref())) {
                    debug!("{}: request work failed: {}", core_id, e);
                }
            }
        }
    }

    /// Turns the frequency request of every core assigned to `id` on or off, or re-evaluates it.
    pub fn qos_control(&self, id: InstanceId, control: QosControl) -> Result<()> {
        let inst = self.dev.instance(id)?;
        let _lifecycle = inst.lifecycle();
        let mode = inst.mode_snapshot();
        let Some(master) = mode.master() else {
            debug!("{}: no master core for qos", id);
            return Ok(());
        };
        let mut cores = vec![self.dev.core(master)?];
        if mode.op_mode.is_multi() {
            cores.push(self.dev.slave_core(&inst, &mode)?);
        }

        match control {
            QosControl::On => {
                for core in cores {
                    core.qos_on(&inst);
                }
                if self.dev.is_multi_core() {
                    load_balance::load_balance(&self.dev, &inst, LoadChange::Add);
                }
            }
            QosControl::Off => {
                for core in cores {
                    core.qos_off(&inst);
                }
            }
            QosControl::Trigger => {
                let load = inst.load();
                for core in cores {
                    let idle_changed = core.ops().qos_idle_trigger(core, &inst);
                    if idle_changed || load.update_bitrate || load.update_framerate {
                        core.qos_on(&inst);
                    }
                }
                if self.dev.is_multi_core() && load.update_framerate {
                    load_balance::load_balance(&self.dev, &inst, LoadChange::Add);
                }
                inst.clear_load_updates();
            }
        }
        Ok(())
    }

    /// Whether the core context(s) of `id` satisfy `query` against `state`.
    pub fn query_state(&self, id: InstanceId, query: StateQuery, state: InstState) -> Result<bool> {
        let inst = self.dev.instance(id)?;
        Ok(self.dev.query_state(&inst, query, state))
    }

    /// Reports a load change of `id` and rebalances.
    pub fn load_balance(&self, id: InstanceId, change: LoadChange) -> Result<()> {
        let inst = self.dev.instance(id)?;
        load_balance::load_balance(&self.dev, &inst, change);
        Ok(())
    }

    /// Stops a decoder queue: DPB flush for capture, CSD parsing for output.
    pub fn instance_dec_stop(&self, id: InstanceId, queue: QueueType) -> Result<()> {
        let inst = self.dev.instance(id)?;
        let _lifecycle = inst.lifecycle();
        match queue {
            QueueType::Capture => self.dec_dst_stop(&inst),
            QueueType::Output => self.dec_src_stop(&inst),
        }
    }

    fn dec_dst_stop(&self, inst: &Instance) -> Result<()> {
        let mode = inst.mode_snapshot();
        let master = self.dev.master_core(inst, &mode)?;
        if mode.op_mode == OpMode::TwoMode2 || mode.op_mode.is_switch_single() {
            let slave = mode
                .partner_core()
                .ok_or(Error::NoSlaveCore(inst.id()))?;
            let slave = self.dev.core(slave)?;
            // Wait for the command in flight on the slave.
            drop(slave.lock_hw(LockOwner::Manager)?);
            master.ops().instance_dpb_flush(master, inst)?;
            slave.ops().instance_dpb_flush(slave, inst)
        } else {
            master.ops().instance_dpb_flush(master, inst)
        }
    }

    fn dec_src_stop(&self, inst: &Instance) -> Result<()> {
        let mode = inst.mode_snapshot();
        if mode.op_mode != OpMode::TwoMode2 {
            let master = self.dev.master_core(inst, &mode)?;
            return master.ops().instance_csd_parsing(master, inst);
        }

        let survivor = mode_switch::switch_to_single(&self.dev, inst, mode.op_core_type).map_err(|e| {
            error!("{}: switch to single for stop failed: {}", inst.id(), e);
            e
        })?;
        let survivor = self.dev.core(survivor)?;
        debug!("{}: CSD parsing on {}", inst.id(), survivor.id());
        survivor.ops().instance_csd_parsing(survivor, inst)?;

        let (master, slave) = {
            let mut mode = inst.mode();
            mode.restore_stream_mode();
            (
                self.dev.master_core(inst, &mode)?,
                self.dev.slave_core(inst, &mode)?,
            )
        };
        master.qos_on(inst);
        slave.qos_on(inst);
        Ok(())
    }

    /// Stops an encoder queue: queue flush for capture, finishing for output.
    pub fn instance_enc_stop(&self, id: InstanceId, queue: QueueType) -> Result<()> {
        let inst = self.dev.instance(id)?;
        let _lifecycle = inst.lifecycle();
        let master = self.dev.master_core(&inst, &inst.mode_snapshot())?;
        match queue {
            QueueType::Capture => master.ops().instance_q_flush(master, &inst),
            QueueType::Output => master.ops().instance_finishing(master, &inst),
        }
    }

    /// Overrides the configured balance threshold; `0` restores it.
    pub fn set_core_balance(&self, percent: u32) -> Result<()> {
        if percent > 100 {
            return Err(Error::InvalidConfig(format!(
                "core balance {}% is over 100%",
                percent
            )));
        }
        info!("core balance override {}%", percent);
        self.dev.set_core_balance_override(percent);
        Ok(())
    }

    pub fn core_balance(&self) -> u32 {
        self.dev.core_balance()
    }

    /// Gathers every instance on one core. Returns the number of instances moved.
    pub fn migrate_all_to_one_core(&self) -> Result<usize> {
        migration::migrate_all_to_one_core(&self.dev)
    }

    /// Collapses every dual-core instance whose setup completed.
    pub fn check_multi_core_mode(&self, reason: OpCoreType) -> Result<()> {
        mode_switch::check_multi_core_mode(&self.dev, reason)
    }

    /// Blocks until the migration worker is idle. Returns false on timeout.
    pub fn wait_for_migrations(&self, timeout: Duration) -> bool {
        self.dev.migration.wait_idle(timeout)
    }

    /// Instances that entered a dual-core mode since they were opened.
    pub fn multi_core_instances(&self) -> Vec<InstanceId> {
        self.dev.multi_core_insts.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeCoreOps;
    use crate::Codec;
    use crate::Resolution;

    fn manager(cores: usize) -> (Arc<FakeCoreOps>, ResourceManager) {
        let fake = Arc::new(FakeCoreOps::new());
        let ops: Vec<Arc<dyn CoreOps>> = (0..cores)
            .map(|_| Arc::clone(&fake) as Arc<dyn CoreOps>)
            .collect();
        (fake, ResourceManager::new(RmConfig::default(), ops).unwrap())
    }

    fn params(kind: InstanceKind, codec: Codec) -> InstanceParams {
        InstanceParams {
            kind,
            codec,
            resolution: Resolution {
                width: 1920,
                height: 1080,
            },
            is_drm: false,
        }
    }

    #[test]
    fn init_loads_firmware_once() {
        let (fake, rm) = manager(2);
        let a = rm
            .create_instance(params(InstanceKind::Decoder, Codec::H264))
            .unwrap();
        let b = rm
            .create_instance(params(InstanceKind::Encoder, Codec::H264))
            .unwrap();
        rm.instance_init(a.id()).unwrap();
        rm.instance_init(b.id()).unwrap();
        assert_eq!(fake.count("load_firmware"), 2);
        assert_eq!(a.mode_snapshot().master(), Some(DEC_DEFAULT_CORE));
        assert_eq!(b.mode_snapshot().master(), Some(ENC_DEFAULT_CORE));
    }

    #[test]
    fn failed_init_clears_master() {
        let (fake, rm) = manager(2);
        fake.fail("instance_init", None);
        let inst = rm
            .create_instance(params(InstanceKind::Decoder, Codec::H264))
            .unwrap();
        assert!(rm.instance_init(inst.id()).is_err());
        assert_eq!(inst.mode_snapshot().master(), None);
        assert!(!rm.core(CoreId(0)).unwrap().has_context(inst.id()));
    }

    #[test]
    fn av1_opens_on_core1() {
        let (fake, rm) = manager(2);
        let inst = rm
            .create_instance(params(InstanceKind::Decoder, Codec::Av1))
            .unwrap();
        rm.instance_init(inst.id()).unwrap();
        rm.instance_open(inst.id()).unwrap();
        let mode = inst.mode_snapshot();
        assert_eq!(mode.master(), Some(CoreId(1)));
        assert_eq!(mode.op_core_type, OpCoreType::Fixed1);
        assert!(rm.core(CoreId(1)).unwrap().has_context(inst.id()));
        assert!(!rm.core(CoreId(0)).unwrap().has_context(inst.id()));
        assert_eq!(fake.count("instance_deinit"), 1);
        assert!(rm
            .query_state(inst.id(), StateQuery::Equal, InstState::GotInst)
            .unwrap());
    }

    #[test]
    fn single_core_device_never_moves() {
        let (_fake, rm) = manager(1);
        let inst = rm
            .create_instance(params(InstanceKind::Decoder, Codec::Av1))
            .unwrap();
        rm.instance_init(inst.id()).unwrap();
        rm.instance_open(inst.id()).unwrap();
        assert_eq!(inst.mode_snapshot().master(), Some(CoreId(0)));
    }

    #[test]
    fn request_work_runs_on_master() {
        let (fake, rm) = manager(2);
        let inst = rm
            .create_instance(params(InstanceKind::Decoder, Codec::H264))
            .unwrap();
        rm.instance_init(inst.id()).unwrap();
        rm.instance_open(inst.id()).unwrap();
        {
            let mut q = inst.queues();
            q.queue_src(0, false);
            q.queue_src(1, false);
            q.queue_dst(0);
        }
        rm.request_work(WorkKind::Try, Some(inst.id())).unwrap();
        let issued: Vec<_> = fake
            .issued_for(inst.id())
            .iter()
            .map(|i| (i.core, i.index))
            .collect();
        assert_eq!(issued, vec![(CoreId(0), 0), (CoreId(0), 1)]);
    }

    #[test]
    fn switching_defers_work() {
        let (fake, rm) = manager(2);
        let inst = rm
            .create_instance(params(InstanceKind::Decoder, Codec::H264))
            .unwrap();
        rm.instance_init(inst.id()).unwrap();
        rm.instance_open(inst.id()).unwrap();
        inst.queues().queue_src(0, false);
        inst.mode().op_mode = OpMode::Switching;
        rm.request_work(WorkKind::Try, Some(inst.id())).unwrap();
        assert_eq!(inst.queues().ready_count(), 1);
        assert!(fake.issued().is_empty());
    }

    #[test]
    fn qos_follows_assignment() {
        let (_fake, rm) = manager(2);
        let inst = rm
            .create_instance(params(InstanceKind::Decoder, Codec::H264))
            .unwrap();
        rm.instance_init(inst.id()).unwrap();
        rm.qos_control(inst.id(), QosControl::On).unwrap();
        assert_eq!(rm.core(CoreId(0)).unwrap().qos_holders(), vec![inst.id()]);
        rm.qos_control(inst.id(), QosControl::Off).unwrap();
        assert!(rm.core(CoreId(0)).unwrap().qos_holders().is_empty());
    }

    #[test]
    fn trigger_clears_update_flags() {
        let (_fake, rm) = manager(2);
        let enc = rm
            .create_instance(params(InstanceKind::Encoder, Codec::H264))
            .unwrap();
        rm.instance_init(enc.id()).unwrap();
        enc.mark_bitrate_updated();
        enc.mark_framerate_updated();
        rm.qos_control(enc.id(), QosControl::Trigger).unwrap();
        let load = enc.load();
        assert!(!load.update_bitrate);
        assert!(!load.update_framerate);
        assert_eq!(rm.core(CoreId(0)).unwrap().qos_holders(), vec![enc.id()]);
    }

    #[test]
    fn enc_stop_commands() {
        let (fake, rm) = manager(2);
        let enc = rm
            .create_instance(params(InstanceKind::Encoder, Codec::Vp8))
            .unwrap();
        rm.instance_init(enc.id()).unwrap();
        rm.instance_enc_stop(enc.id(), QueueType::Capture).unwrap();
        rm.instance_enc_stop(enc.id(), QueueType::Output).unwrap();
        assert_eq!(fake.count("instance_q_flush"), 1);
        assert_eq!(fake.count("instance_finishing"), 1);
    }

    #[test]
    fn balance_override_is_bounded() {
        let (_fake, rm) = manager(2);
        assert!(matches!(
            rm.set_core_balance(101),
            Err(Error::InvalidConfig(_))
        ));
        rm.set_core_balance(50).unwrap();
        assert_eq!(rm.core_balance(), 50);
    }

    #[test]
    fn deinit_then_release() {
        let (fake, rm) = manager(2);
        let inst = rm
            .create_instance(params(InstanceKind::Decoder, Codec::Hevc))
            .unwrap();
        rm.instance_init(inst.id()).unwrap();
        rm.instance_open(inst.id()).unwrap();
        rm.instance_deinit(inst.id()).unwrap();
        rm.release_instance(inst.id()).unwrap();
        assert_eq!(fake.count("instance_deinit"), 1);
        assert_eq!(
            rm.instance(inst.id()).err(),
            Some(Error::UnknownInstance(inst.id()))
        );
        assert!(rm.instances().is_empty());
    }
}
