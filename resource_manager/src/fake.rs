// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory command layer.
//!
//! Runs the context state machine synchronously instead of talking to hardware, and records every
//! operation so callers can check what reached which core. Failures can be injected per operation
//! and per core, and a core can be held to model a busy hardware queue.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use log::debug;
use serde::Serialize;
use sync::Mutex;

use crate::core_handle::Core;
use crate::core_handle::CoreOps;
use crate::core_handle::FirmwareImage;
use crate::core_handle::InstState;
use crate::core_handle::WorkKind;
use crate::hwlock::LockOwner;
use crate::instance::Instance;
use crate::CoreId;
use crate::Error;
use crate::InstanceId;
use crate::Result;

/// One operation that reached the command layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Call {
    pub core: CoreId,
    pub op: &'static str,
    pub instance: Option<InstanceId>,
}

/// A source buffer handed to a core for decoding or encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Issued {
    pub core: CoreId,
    pub instance: InstanceId,
    pub index: u32,
    pub src_index: u32,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    issued: Vec<Issued>,
    failures: BTreeSet<(&'static str, Option<CoreId>)>,
    held: BTreeSet<CoreId>,
    next_inst_no: BTreeMap<CoreId, u32>,
    migration_addrs: Vec<(CoreId, u64, u64)>,
    moves_in_flight: usize,
    max_moves_in_flight: usize,
    move_delay: Duration,
}

#[derive(Default)]
pub struct FakeCoreOps {
    state: Mutex<FakeState>,
}

impl FakeCoreOps {
    pub fn new() -> FakeCoreOps {
        FakeCoreOps::default()
    }

    /// Makes `op` fail on `core`, or on every core when `core` is `None`.
    pub fn fail(&self, op: &'static str, core: Option<CoreId>) {
        self.state.lock().failures.insert((op, core));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Stops `core` from running anything until [`FakeCoreOps::release`].
    pub fn hold(&self, core: CoreId) {
        self.state.lock().held.insert(core);
    }

    pub fn release(&self, core: CoreId) {
        self.state.lock().held.remove(&core);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn issued(&self) -> Vec<Issued> {
        self.state.lock().issued.clone()
    }

    pub fn issued_for(&self, id: InstanceId) -> Vec<Issued> {
        self.state
            .lock()
            .issued
            .iter()
            .filter(|i| i.instance == id)
            .copied()
            .collect()
    }

    /// Firmware and context addresses handed to destination cores, in order.
    pub fn migration_addrs(&self) -> Vec<(CoreId, u64, u64)> {
        self.state.lock().migration_addrs.clone()
    }

    /// Highest number of migrations observed running at the same time.
    pub fn max_concurrent_moves(&self) -> usize {
        self.state.lock().max_moves_in_flight
    }

    /// Stretches every migration so overlapping ones become observable.
    pub fn set_move_delay(&self, delay: Duration) {
        self.state.lock().move_delay = delay;
    }

    fn record(&self, core: &Core, op: &'static str, inst: Option<&Instance>) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call {
            core: core.id(),
            op,
            instance: inst.map(Instance::id),
        });
        if state.failures.contains(&(op, Some(core.id()))) || state.failures.contains(&(op, None))
        {
            return Err(Error::CoreOp {
                core: core.id(),
                op,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn set_state(core: &Core, inst: &Instance, state: InstState) {
        if let Some(ctx) = core.context(inst.id()) {
            ctx.set_state(state);
        }
    }

    /// Runs one step of `inst` on `core`. Returns whether anything happened.
    fn run_one(&self, core: &Core, inst: &Instance) -> bool {
        let id = inst.id();
        let Some(ctx) = core.context(id) else {
            core.clear_work(id);
            return false;
        };
        let multi = inst.mode_snapshot().op_mode.is_multi();
        let Some(guard) = core.hwlock().try_acquire(LockOwner::Instance(id)) else {
            core.hwlock().add_waiter(id);
            return false;
        };
        core.hwlock().remove_waiter(id);

        let mut issued = None;
        {
            let mut queues = inst.queues();
            if !core.is_ready(ctx.state(), &queues) {
                core.clear_work(id);
                return false;
            }
            core.set_drm_active(inst.params().is_drm);
            match ctx.state() {
                InstState::GotInst => {
                    ctx.set_state(InstState::HeadParsed);
                    ctx.signal_seq_done();
                }
                // Dual-core instances get their init buffer from the resource manager.
                InstState::HeadParsed if multi => {
                    core.clear_work(id);
                    return false;
                }
                InstState::HeadParsed => ctx.set_state(InstState::Running),
                InstState::Running => {
                    let Some(src) = queues.pop_core_src(core.id()) else {
                        return false;
                    };
                    if src.last_frame {
                        ctx.set_state(InstState::Finishing);
                    }
                    issued = Some(Issued {
                        core: core.id(),
                        instance: id,
                        index: src.index,
                        src_index: src.src_index,
                    });
                }
                InstState::Finishing => ctx.set_state(InstState::Finished),
                _ => return false,
            }
        }
        drop(guard);

        if let Some(issued) = issued {
            debug!(
                "{}: {} runs src {}({})",
                core.id(),
                id,
                issued.index,
                issued.src_index
            );
            self.state.lock().issued.push(issued);
            inst.src_issued(core.id(), issued.src_index);
        }
        true
    }
}

impl CoreOps for FakeCoreOps {
    fn load_firmware(&self, core: &Core) -> Result<FirmwareImage> {
        self.record(core, "load_firmware", None)?;
        let base = 0x1000_0000 + core.id().0 as u64 * 0x0100_0000;
        Ok(FirmwareImage {
            fw_addr: base,
            ctx_addr: base + 0x0010_0000,
            drm_fw_addr: base + 0x0080_0000,
            drm_ctx_addr: base + 0x0090_0000,
        })
    }

    fn instance_init(&self, core: &Core, inst: &Instance) -> Result<()> {
        self.record(core, "instance_init", Some(inst))
    }

    fn instance_open(&self, core: &Core, inst: &Instance) -> Result<()> {
        self.record(core, "instance_open", Some(inst))?;
        let inst_no = {
            let mut state = self.state.lock();
            let next = state.next_inst_no.entry(core.id()).or_default();
            *next += 1;
            *next - 1
        };
        if let Some(ctx) = core.context(inst.id()) {
            ctx.set_inst_no(Some(inst_no));
            ctx.set_state(InstState::GotInst);
        }
        Ok(())
    }

    fn instance_deinit(&self, core: &Core, inst: &Instance) -> Result<()> {
        self.record(core, "instance_deinit", Some(inst))?;
        Self::set_state(core, inst, InstState::Free);
        Ok(())
    }

    fn instance_move_to(&self, core: &Core, inst: &Instance) -> Result<()> {
        self.record(core, "instance_move_to", Some(inst))?;
        let delay = {
            let mut state = self.state.lock();
            state.moves_in_flight += 1;
            state.max_moves_in_flight = state.max_moves_in_flight.max(state.moves_in_flight);
            state.move_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.state.lock().moves_in_flight -= 1;
        Ok(())
    }

    fn instance_move_from(&self, core: &Core, inst: &Instance) -> Result<()> {
        self.record(core, "instance_move_from", Some(inst))
    }

    fn set_migration_addr(
        &self,
        core: &Core,
        inst: &Instance,
        fw_addr: u64,
        ctx_addr: u64,
    ) -> Result<()> {
        self.record(core, "set_migration_addr", Some(inst))?;
        self.state
            .lock()
            .migration_addrs
            .push((core.id(), fw_addr, ctx_addr));
        Ok(())
    }

    fn instance_cache_flush(&self, core: &Core, inst: &Instance) -> Result<()> {
        self.record(core, "instance_cache_flush", Some(inst))?;
        core.set_drm_active(inst.params().is_drm);
        Ok(())
    }

    fn instance_dpb_flush(&self, core: &Core, inst: &Instance) -> Result<()> {
        self.record(core, "instance_dpb_flush", Some(inst))
    }

    fn instance_finishing(&self, core: &Core, inst: &Instance) -> Result<()> {
        self.record(core, "instance_finishing", Some(inst))?;
        Self::set_state(core, inst, InstState::Finishing);
        Ok(())
    }

    fn instance_q_flush(&self, core: &Core, inst: &Instance) -> Result<()> {
        self.record(core, "instance_q_flush", Some(inst))
    }

    fn instance_csd_parsing(&self, core: &Core, inst: &Instance) -> Result<()> {
        self.record(core, "instance_csd_parsing", Some(inst))
    }

    fn instance_init_buf(&self, core: &Core, inst: &Instance) -> Result<()> {
        self.record(core, "instance_init_buf", Some(inst))?;
        Self::set_state(core, inst, InstState::Running);
        Ok(())
    }

    fn request_work(&self, core: &Core, kind: WorkKind, inst: Option<&Instance>) -> Result<()> {
        self.record(core, "request_work", inst)?;
        if self.state.lock().held.contains(&core.id()) {
            debug!("{}: held, {:?} deferred", core.id(), kind);
            return Ok(());
        }

        let mut candidates: Vec<InstanceId> = inst.map(Instance::id).into_iter().collect();
        for id in core.pending_work().into_iter().chain(core.hwlock().waiters()) {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }
        loop {
            let mut progress = false;
            for id in &candidates {
                let Some(inst) = core.context(*id).and_then(|ctx| ctx.instance()) else {
                    continue;
                };
                while self.run_one(core, &inst) {
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        Ok(())
    }

    fn qos_on(&self, core: &Core, inst: &Instance) {
        let _ = self.record(core, "qos_on", Some(inst));
    }

    fn qos_off(&self, core: &Core, inst: &Instance) {
        let _ = self.record(core, "qos_off", Some(inst));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::RmConfig;
    use crate::Codec;
    use crate::InstanceKind;
    use crate::InstanceParams;

    fn open_on(core: &Core) -> Arc<Instance> {
        let inst = Arc::new(Instance::new(
            InstanceId(0),
            InstanceParams {
                kind: InstanceKind::Decoder,
                codec: Codec::H264,
                resolution: Default::default(),
                is_drm: false,
            },
        ));
        inst.mode().set_core_num(core.id());
        core.instance_init(&inst).unwrap();
        core.instance_open(&inst).unwrap();
        inst
    }

    #[test]
    fn runs_header_then_frames() {
        let fake = Arc::new(FakeCoreOps::new());
        let core = Core::new(CoreId(0), fake.clone(), &RmConfig::default());
        let inst = open_on(&core);
        {
            let mut q = inst.queues();
            q.queue_src(7, false);
            q.queue_src(8, true);
            q.queue_dst(0);
            q.move_all_ready_to_core(CoreId(0));
        }
        core.request_work(WorkKind::Try, Some(inst.as_ref())).unwrap();
        let issued: Vec<_> = fake.issued().iter().map(|i| i.index).collect();
        assert_eq!(issued, vec![7, 8]);
        assert_eq!(
            core.context(inst.id()).unwrap().state(),
            InstState::Finished
        );
        assert_eq!(inst.queues().curr_src_index(), Some(1));
    }

    #[test]
    fn busy_core_records_waiter() {
        let fake = Arc::new(FakeCoreOps::new());
        let core = Core::new(CoreId(1), fake.clone(), &RmConfig::default());
        let inst = open_on(&core);
        {
            let mut q = inst.queues();
            q.queue_src(0, false);
            q.move_all_ready_to_core(CoreId(1));
        }
        let guard = core.lock_hw(LockOwner::Manager).unwrap();
        core.request_work(WorkKind::Try, Some(inst.as_ref())).unwrap();
        assert_eq!(core.hwlock().waiters(), vec![inst.id()]);
        drop(guard);
        core.request_work(WorkKind::Butler, None).unwrap();
        assert!(core.hwlock().waiters().is_empty());
        assert_eq!(
            core.context(inst.id()).unwrap().state(),
            InstState::HeadParsed
        );
    }

    #[test]
    fn injected_failure_is_per_core() {
        let fake = Arc::new(FakeCoreOps::new());
        let core0 = Core::new(CoreId(0), fake.clone(), &RmConfig::default());
        let core1 = Core::new(CoreId(1), fake.clone(), &RmConfig::default());
        fake.fail("load_firmware", Some(CoreId(1)));
        assert!(core0.ensure_firmware().is_ok());
        assert!(matches!(
            core1.ensure_firmware(),
            Err(Error::CoreOp { op: "load_firmware", .. })
        ));
        fake.clear_failures();
        assert_eq!(core1.ensure_firmware().unwrap().fw_addr, 0x1100_0000);
        assert_eq!(fake.count("load_firmware"), 3);
    }
}
