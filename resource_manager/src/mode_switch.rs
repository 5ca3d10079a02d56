// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Transitions between single-core and dual-core operation.
//!
//! Every transition that re-homes buffers runs with the instance mode lock and the hardware locks
//! of both cores held, and puts core-local source buffers back into the ready queue before the
//! assignment changes so they are re-claimed in sequence order.

use std::sync::Arc;

use log::debug;
use log::error;
use log::info;

use crate::core_handle::InstState;
use crate::core_handle::StateQuery;
use crate::core_handle::WorkKind;
use crate::device::Device;
use crate::hwlock::HwLockSet;
use crate::hwlock::LockOwner;
use crate::instance::Instance;
use crate::instance::ModeState;
use crate::instance::OpCoreType;
use crate::instance::OpMode;
use crate::instance::Role;
use crate::load_balance::select_core_by_load;
use crate::migration;
use crate::CoreId;
use crate::Error;
use crate::Result;
use crate::DEC_DEFAULT_CORE;
use crate::SURPLUS_CORE;

pub(crate) fn switch_to_single(dev: &Device, inst: &Instance, reason: OpCoreType) -> Result<CoreId> {
    let mut mode = inst.mode();
    switch_to_single_locked(dev, inst, &mut mode, reason)
}

/// Collapses a dual-core instance onto one core and returns the surviving core.
///
/// `reason` is the policy class of the instance that forced the collapse: a class fixed to one
/// core makes this instance survive on the other one. Nothing changes when a hardware lock
/// cannot be taken.
pub(crate) fn switch_to_single_locked(
    dev: &Device,
    inst: &Instance,
    mode: &mut ModeState,
    reason: OpCoreType,
) -> Result<CoreId> {
    let id = inst.id();
    let master = dev.master_core(inst, mode)?;
    if !master.has_context(id) {
        error!("{}: no master context", id);
        return Err(Error::NoContext {
            instance: id,
            core: master.id(),
        });
    }
    let slave = match mode.slave().map(|s| dev.core(s)) {
        Some(Ok(slave)) if slave.has_context(id) => slave,
        _ => {
            info!("{}: no slave to leave, staying on {}", id, master.id());
            return Ok(master.id());
        }
    };

    let mut held = HwLockSet::default();
    held.push(master.lock_hw(LockOwner::Manager)?);
    held.push(slave.lock_hw(LockOwner::Manager)?);

    mode.set_op_mode(OpMode::Switching);
    let returned = inst
        .queues()
        .return_core_src_to_ready(&[master.id(), slave.id()]);
    debug!("{}: {} source buffers back to ready", id, returned);

    if let Some(ctx) = master.context(id) {
        if ctx.state() == InstState::Finishing {
            ctx.set_state(InstState::Running);
        }
    }

    let survivor = match reason {
        OpCoreType::Fixed1 => CoreId(0),
        OpCoreType::Fixed0 => CoreId(1),
        OpCoreType::All | OpCoreType::NotFixed => select_core_by_load(dev, inst, SURPLUS_CORE),
    };
    let abandoned = if survivor == master.id() {
        slave.id()
    } else {
        master.id()
    };
    mode.op_core = [Some(survivor), None];

    {
        let mut queues = inst.queues();
        if queues.core_count(survivor) == 0 {
            if let Some(src_index) = queues.move_ready_head_to_core(survivor) {
                debug!("{}: {} resumes with src {}", id, survivor, src_index);
            }
        }
        mode.set_op_mode(OpMode::SwitchToSingle);
        if mode.stream_op_mode == OpMode::TwoMode2 {
            if let Some(curr) = queues.curr_src_index() {
                let last_op_core = CoreId(curr as usize % dev.num_core());
                if last_op_core != survivor {
                    debug!(
                        "{}: last ran on {}, {} runs once more as mode 2",
                        id, last_op_core, survivor
                    );
                    mode.set_op_mode(OpMode::SwitchButMode2);
                }
            }
        }
    }
    drop(held);

    dev.core(abandoned)?.qos_off(inst);
    dev.core(survivor)?.qos_on(inst);
    info!("{}: switched to single on {} ({:?})", id, survivor, mode.op_mode);
    Ok(survivor)
}

/// Returns a switched-to-single instance to its dual-core stream mode.
pub(crate) fn switch_to_multi(dev: &Device, inst: &Instance) -> Result<()> {
    let id = inst.id();
    {
        let mut mode = inst.mode();
        let master = dev.master_core(inst, &mode)?;
        let partner = mode.partner_core().ok_or(Error::NoSlaveCore(id))?;
        let partner = dev.core(partner)?;
        if !partner.has_context(id) {
            return Err(Error::NoContext {
                instance: id,
                core: partner.id(),
            });
        }
        let (first, second) = if master.id() < partner.id() {
            (master, partner)
        } else {
            (partner, master)
        };

        let mut held = HwLockSet::default();
        held.push(first.lock_hw(LockOwner::Manager)?);
        held.push(second.lock_hw(LockOwner::Manager)?);

        if mode.op_mode == OpMode::SwitchButMode2 {
            debug!("{}: buffers already placed for mode 2", id);
        } else {
            mode.set_op_mode(OpMode::Switching);
            let mut queues = inst.queues();
            queues.return_core_src_to_ready(&[master.id(), partner.id()]);
            queues.renumber_ready();
            debug!("{}: ready queue renumbered {:?}", id, queues.ready_indices());
        }

        let stream_op_mode = mode.stream_op_mode;
        mode.set_op_mode(stream_op_mode);
        mode.set_core_num(DEC_DEFAULT_CORE);
        drop(held);
        info!("{}: back to {:?}", id, stream_op_mode);
    }

    let mode = inst.mode_snapshot();
    for core in mode.cores() {
        dev.core(core)?.qos_on(inst);
    }
    if mode.op_mode == OpMode::TwoMode2 {
        route_mode2(dev, inst);
    } else {
        dev.request_butler(Some(inst));
    }
    Ok(())
}

/// Collapses every dual-core instance that completed its setup on both cores, so the core it
/// borrowed is available to other instances.
pub(crate) fn check_multi_core_mode(dev: &Device, reason: OpCoreType) -> Result<()> {
    let ids: Vec<_> = dev.multi_core_insts.lock().iter().copied().collect();
    for id in ids {
        let inst = match dev.instance(id) {
            Ok(inst) => inst,
            Err(e) => {
                error!("multi-core set: {}", e);
                continue;
            }
        };
        let survivor = {
            let mut mode = inst.mode();
            if !mode.op_mode.is_multi() {
                debug!("{}: already single", id);
                continue;
            }
            if !dev.query_state_locked(&inst, &mode, StateQuery::Equal, InstState::Running) {
                debug!("{}: dual-core setup not done yet", id);
                continue;
            }
            switch_to_single_locked(dev, &inst, &mut mode, reason)?
        };
        info!("{}: collapsed to {} for another instance", id, survivor);
        let core = dev.core(survivor)?;
        if core.ready_set_bit(&inst) {
            if let Err(e) = core.request_work(WorkKind::Butler, Some(inst.as_ref())) {
                debug!("{}: {}", survivor, e);
            }
        }
    }
    Ok(())
}

/// Brings up the second core for an instance whose stream asks for a dual-core mode.
///
/// Runs after the master parsed the stream header. The header buffer is parsed again on the
/// slave; the call waits for that with a bound and falls back to single-core on any failure.
pub(crate) fn instance_setup(dev: &Device, inst: &Arc<Instance>, op_mode: OpMode) -> Result<()> {
    let id = inst.id();
    if !op_mode.is_multi() {
        info!("{}: no slave setup needed for {:?}", id, op_mode);
        return Ok(());
    }
    if !dev.is_multi_core() {
        info!("{}: single-core device, {:?} ignored", id, op_mode);
        return Ok(());
    }
    // A core-fixed class never runs on the other core.
    let op_core_type = inst.mode_snapshot().op_core_type;
    if op_core_type.fixed_core().is_some() {
        info!("{}: {:?} stays single, {:?} ignored", id, op_core_type, op_mode);
        return Ok(());
    }
    let master = {
        let mut mode = inst.mode();
        if mode.slave().is_some() {
            info!("{}: slave already set up", id);
            return Ok(());
        }
        let master = mode.master().ok_or(Error::NoMasterCore(id))?;
        mode.stream_op_mode = op_mode;
        mode.set_op_mode(op_mode);
        mode.set_core_num(master);
        master
    };
    dev.multi_core_insts.lock().insert(id);

    let slave = master.other();
    match setup_slave(dev, inst, master, slave) {
        Ok(()) => {
            info!("{}: {:?} set up on {} and {}", id, op_mode, master, slave);
            Ok(())
        }
        Err(e) => {
            error!("{}: slave setup on {} failed: {}", id, slave, e);
            inst.queues().return_core_src_to_ready(&[master, slave]);
            if let Ok(core) = dev.core(slave) {
                if core.has_context(id) {
                    if let Err(e) = core.instance_deinit(inst) {
                        error!("{}: {}", id, e);
                    }
                }
            }
            {
                let mut mode = inst.mode();
                mode.op_core[Role::Slave as usize] = None;
                mode.stream_op_mode = OpMode::Single;
                mode.set_op_mode(OpMode::Single);
                mode.slave_inst_no = None;
            }
            dev.multi_core_insts.lock().remove(&id);
            Err(e)
        }
    }
}

fn setup_slave(dev: &Device, inst: &Arc<Instance>, master: CoreId, slave: CoreId) -> Result<()> {
    let id = inst.id();
    let core = dev.core(slave)?;
    core.instance_init(inst)?;
    core.instance_open(inst)?;
    let ctx = core.context(id).ok_or(Error::NoContext {
        instance: id,
        core: slave,
    })?;

    {
        let mut queues = inst.queues();
        let header = queues
            .move_core_head_to_core(master, slave)
            .or_else(|| queues.move_ready_head_to_core(slave))
            .ok_or(Error::NoHeaderBuffer(id))?;
        debug!("{}: header src {} to {}", id, header, slave);
    }

    let seq_done = ctx.arm_seq_done();
    if core.ready_set_bit(inst) {
        core.request_work(WorkKind::Butler, Some(inst.as_ref()))?;
    }
    if !seq_done.wait(dev.config.seq_done_timeout()) {
        return Err(Error::HeaderParseTimeout(slave));
    }

    // The header buffer goes back in front of anything the master had claimed.
    inst.queues().return_core_src_to_ready(&[master, slave]);

    let mut mode = inst.mode();
    mode.set_core_num(DEC_DEFAULT_CORE);
    let slave_core = dev.slave_core(inst, &mode)?;
    mode.slave_inst_no = slave_core.context(id).and_then(|c| c.inst_no());
    debug!("{}: slave inst_no {:?}", id, mode.slave_inst_no);
    Ok(())
}

/// Mode 2 router: hands ready buffers to cores strictly in sequence order, round-robin by
/// sequence number, and collapses to single-core at end of stream.
pub(crate) fn route_mode2(dev: &Device, inst: &Instance) {
    loop {
        let routed = route_next(dev, inst);
        dev.request_butler(Some(inst));
        if !routed {
            break;
        }
    }
}

fn route_next(dev: &Device, inst: &Instance) -> bool {
    let id = inst.id();
    let mut mode = inst.mode();
    if mode.op_mode != OpMode::TwoMode2 {
        return false;
    }
    let mut queues = inst.queues();
    let Some(head) = queues.ready_head().cloned() else {
        debug!("{}: no source buffer", id);
        return false;
    };
    // Sequence number the next buffer must carry; -1 + 1 before anything ran.
    let next = queues.curr_src_index().map_or(0, |curr| curr.wrapping_add(1));

    if head.last_frame {
        queues.reset_serial();
        if next < head.src_index {
            debug!("{}: EOS src {} waits for src {}", id, head.src_index, next);
            return false;
        }
        drop(queues);
        let reason = mode.op_core_type;
        match switch_to_single_locked(dev, inst, &mut mode, reason) {
            Ok(core) => debug!("{}: EOS finishes on {}", id, core),
            Err(e) => error!("{}: switch to single for EOS failed: {}", id, e),
        }
        return false;
    }

    if head.src_index != next {
        debug!("{}: src {} waits for src {}", id, head.src_index, next);
        return false;
    }
    let target = CoreId(head.src_index as usize % dev.num_core());
    queues.move_ready_head_to_core(target);
    debug!("{}: src {}({}) to {}", id, head.index, head.src_index, target);
    true
}

/// Sends INIT_BUFFER to both cores of a header-parsed dual-core instance with both hardware locks
/// held, so no other command reaches either core in between.
pub(crate) fn guarantee_init_buf(dev: &Device, inst: &Instance) {
    let id = inst.id();
    if inst.queues().dst_count() == 0 {
        debug!("{}: not ready for init buffer", id);
        return;
    }
    let mode = inst.mode_snapshot();
    let (master, slave) = match (dev.master_core(inst, &mode), dev.slave_core(inst, &mode)) {
        (Ok(master), Ok(slave)) => (master, slave),
        (Err(e), _) | (_, Err(e)) => {
            error!("{}: {}", id, e);
            return;
        }
    };
    let (Some(master_ctx), Some(slave_ctx)) = (master.context(id), slave.context(id)) else {
        error!("{}: missing core context for init buffer", id);
        return;
    };

    {
        let mut held = HwLockSet::default();
        match master.lock_hw(LockOwner::Manager) {
            Ok(guard) => held.push(guard),
            Err(e) => {
                error!("{}: master hwlock: {}", id, e);
                return;
            }
        }
        match slave.lock_hw(LockOwner::Manager) {
            Ok(guard) => held.push(guard),
            Err(e) => {
                error!("{}: slave hwlock: {}", id, e);
                return;
            }
        }

        if !master.is_ready(master_ctx.state(), &inst.queues()) {
            return;
        }
        if mode.op_mode == OpMode::TwoMode2 && !slave.is_ready(slave_ctx.state(), &inst.queues()) {
            return;
        }
        if mode.op_mode == OpMode::TwoMode1 && slave.drm_active() != inst.params().is_drm {
            debug!("{}: slave needs a cache flush before mode 1", id);
            if let Err(e) = slave.ops().instance_cache_flush(slave, inst) {
                error!("{}: {}", id, e);
            }
        }

        if let Err(e) = master.ops().instance_init_buf(master, inst) {
            error!("{}: master init buffer failed: {}", id, e);
            return;
        }
        if mode.op_mode == OpMode::TwoMode2 {
            if let Err(e) = slave.ops().instance_init_buf(slave, inst) {
                error!("{}: slave init buffer failed: {}", id, e);
                return;
            }
        }
        // In mode 1 the slave runs without its own command.
        if mode.op_mode == OpMode::TwoMode1 {
            slave_ctx.set_state(InstState::Running);
        }
    }

    info!("{}: {:?} setup done", id, mode.op_mode);
    if dev.num_inst() > 1 {
        if inst.params().resolution.is_8k() && dev.num_inst() > 2 {
            if let Err(e) = migration::migrate_all_to_one_core(dev) {
                error!("migrate all to one core: {}", e);
            }
        }
        if let Err(e) = check_multi_core_mode(dev, mode.op_core_type) {
            error!("multi-core check: {}", e);
        }
        dev.request_butler(None);
    }
}
