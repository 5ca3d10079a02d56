// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device-wide state shared by the resource manager and its migration worker.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use log::error;
use sync::Mutex;

use crate::config::RmConfig;
use crate::core_handle::Core;
use crate::core_handle::CoreOps;
use crate::core_handle::InstState;
use crate::core_handle::StateQuery;
use crate::core_handle::WorkKind;
use crate::instance::Instance;
use crate::instance::InstanceParams;
use crate::instance::ModeState;
use crate::migration::MigrationQueue;
use crate::CoreId;
use crate::Error;
use crate::InstanceId;
use crate::Result;
use crate::MAX_CORES;

pub(crate) struct Device {
    pub(crate) config: RmConfig,
    pub(crate) cores: Vec<Core>,
    instances: Mutex<Vec<Option<Arc<Instance>>>>,
    /// Instances whose load is tracked, in descending `weighted_mb` order.
    pub(crate) load_list: Mutex<Vec<Arc<Instance>>>,
    /// Instances that entered a dual-core mode since they were opened.
    pub(crate) multi_core_insts: Mutex<BTreeSet<InstanceId>>,
    /// Held for the whole move of a running instance.
    pub(crate) migrate_lock: Mutex<()>,
    pub(crate) migration: MigrationQueue,
    core_balance_override: AtomicU32,
}

impl Device {
    pub(crate) fn new(config: RmConfig, core_ops: Vec<Arc<dyn CoreOps>>) -> Result<Device> {
        config.validate()?;
        if core_ops.is_empty() || core_ops.len() > MAX_CORES {
            return Err(Error::InvalidConfig(format!(
                "{} cores given, 1 to {} supported",
                core_ops.len(),
                MAX_CORES
            )));
        }
        let cores = core_ops
            .into_iter()
            .enumerate()
            .map(|(i, ops)| Core::new(CoreId(i), ops, &config))
            .collect();
        let slots = config.instance_slots();
        Ok(Device {
            config,
            cores,
            instances: Mutex::new(vec![None; slots]),
            load_list: Mutex::new(Vec::new()),
            multi_core_insts: Mutex::new(BTreeSet::new()),
            migrate_lock: Mutex::new(()),
            migration: MigrationQueue::new(),
            core_balance_override: AtomicU32::new(0),
        })
    }

    pub(crate) fn num_core(&self) -> usize {
        self.cores.len()
    }

    pub(crate) fn is_multi_core(&self) -> bool {
        self.cores.len() > 1
    }

    pub(crate) fn core(&self, id: CoreId) -> Result<&Core> {
        self.cores.get(id.0).ok_or(Error::InvalidCore(id))
    }

    pub(crate) fn instance(&self, id: InstanceId) -> Result<Arc<Instance>> {
        self.instances
            .lock()
            .get(id.0)
            .and_then(Clone::clone)
            .ok_or(Error::UnknownInstance(id))
    }

    pub(crate) fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances.lock().iter().flatten().cloned().collect()
    }

    pub(crate) fn num_inst(&self) -> usize {
        self.instances.lock().iter().flatten().count()
    }

    /// Places a new instance in the lowest free slot.
    pub(crate) fn insert_instance(&self, params: InstanceParams) -> Result<Arc<Instance>> {
        let mut instances = self.instances.lock();
        let slot = instances
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ArenaFull)?;
        let inst = Arc::new(Instance::new(InstanceId(slot), params));
        instances[slot] = Some(Arc::clone(&inst));
        Ok(inst)
    }

    pub(crate) fn remove_instance(&self, id: InstanceId) -> Result<Arc<Instance>> {
        self.instances
            .lock()
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(Error::UnknownInstance(id))
    }

    /// Balance threshold in percent, honoring the runtime override.
    pub(crate) fn core_balance(&self) -> u32 {
        match self.core_balance_override.load(Ordering::Relaxed) {
            0 => self.config.core_balance,
            percent => percent,
        }
    }

    pub(crate) fn set_core_balance_override(&self, percent: u32) {
        self.core_balance_override.store(percent, Ordering::Relaxed);
    }

    pub(crate) fn master_core(&self, inst: &Instance, mode: &ModeState) -> Result<&Core> {
        self.core(mode.master().ok_or(Error::NoMasterCore(inst.id()))?)
    }

    pub(crate) fn slave_core(&self, inst: &Instance, mode: &ModeState) -> Result<&Core> {
        self.core(mode.slave().ok_or(Error::NoSlaveCore(inst.id()))?)
    }

    /// Asks the command layer to look for work: on every core assigned to `inst`, or on every
    /// core of the device.
    ///
    /// Must be called without the instance mode lock held.
    pub(crate) fn request_butler(&self, inst: Option<&Instance>) {
        match inst {
            Some(inst) => {
                let mode = inst.mode_snapshot();
                for core_id in mode.cores() {
                    let core = match self.core(core_id) {
                        Ok(core) => core,
                        Err(e) => {
                            error!("{}: {}", inst.id(), e);
                            return;
                        }
                    };
                    if core.ready_set_bit(inst) {
                        if let Err(e) = core.request_work(WorkKind::Butler, Some(inst)) {
                            debug!("{}: butler request failed: {}", core_id, e);
                        }
                    }
                }
            }
            None => {
                for core in &self.cores {
                    if let Err(e) = core.request_work(WorkKind::Butler, None) {
                        debug!("{}: butler request failed: {}", core.id(), e);
                    }
                }
            }
        }
    }

    pub(crate) fn query_state(&self, inst: &Instance, query: StateQuery, state: InstState) -> bool {
        let mode = inst.mode_snapshot();
        self.query_state_locked(inst, &mode, query, state)
    }

    /// Compares the context state of every core the instance runs on. Both cores must satisfy
    /// `query` in a dual-core mode, except for [`StateQuery::EqualOr`] where either is enough.
    pub(crate) fn query_state_locked(
        &self,
        inst: &Instance,
        mode: &ModeState,
        query: StateQuery,
        state: InstState,
    ) -> bool {
        let context_state = |core: Option<CoreId>| {
            core.and_then(|c| self.core(c).ok())
                .and_then(|c| c.context(inst.id()))
                .map(|ctx| ctx.state())
        };
        let Some(master_state) = context_state(mode.master()) else {
            debug!("{}: no master context", inst.id());
            return false;
        };
        if !mode.op_mode.is_multi() {
            return query.matches(master_state, state);
        }
        let Some(slave_state) = context_state(mode.slave()) else {
            debug!("{}: no slave context", inst.id());
            return false;
        };
        let satisfied = if query == StateQuery::EqualOr {
            master_state == state || slave_state == state
        } else {
            query.matches(master_state, state) && query.matches(slave_state, state)
        };
        if !satisfied {
            debug!(
                "{}: master {:?}, slave {:?}",
                inst.id(),
                master_state,
                slave_state
            );
        }
        satisfied
    }
}
