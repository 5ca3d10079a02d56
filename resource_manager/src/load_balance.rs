// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Core selection by codec class and accumulated load.

use std::sync::Arc;

use log::debug;
use log::error;
use log::log_enabled;
use log::Level;

use crate::device::Device;
use crate::instance::Instance;
use crate::instance::OpCoreType;
use crate::CoreId;
use crate::DEC_DEFAULT_CORE;

/// Direction of a load change reported to [`load_balance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadChange {
    Add,
    Delete,
}

/// Picks the core for a free-assignment instance from the cores' current `total_mb`.
///
/// The default core is preferred while it stays under the balance threshold with this instance
/// added; once it is past the threshold the other core is used if it is not. Otherwise the less
/// loaded core wins, the default core on ties.
pub(crate) fn select_core_by_load(dev: &Device, inst: &Instance, default_core: CoreId) -> CoreId {
    let balance = u64::from(dev.core_balance());
    let surplus_core = default_core.other();
    if balance >= 100 || !dev.is_multi_core() {
        return default_core;
    }
    let (Ok(default), Ok(surplus)) = (dev.core(default_core), dev.core(surplus_core)) else {
        return default_core;
    };
    let (Some(default_load), Some(surplus_load), Some(default_max)) = (
        default.load_percent(),
        surplus.load_percent(),
        default.max_mb(),
    ) else {
        debug!("no core capacity configured, staying on {}", default_core);
        return default_core;
    };
    let weighted_mb = inst.weighted_mb();
    let curr_load = weighted_mb * 100 / default_max;

    let selected = if default_load < balance && default_load + curr_load <= balance {
        default_core
    } else if default_load >= balance && surplus_load < balance {
        surplus_core
    } else if default_load > surplus_load {
        surplus_core
    } else {
        default_core
    };
    debug!(
        "{}: load {}={}% {}={}% curr {}({}%) select {}",
        inst.id(),
        default_core,
        default_load,
        surplus_core,
        surplus_load,
        weighted_mb,
        curr_load,
        selected
    );
    selected
}

/// Resolves the policy class of the instance's codec and returns the core it should open on.
pub(crate) fn get_core_num(dev: &Device, inst: &Instance) -> CoreId {
    let (op_core_type, core) = inst.params().core_class();
    inst.mode().op_core_type = op_core_type;
    if dev.core_balance() == 100 {
        debug!("{}: load balancing disabled", inst.id());
        return core;
    }
    if op_core_type == OpCoreType::All {
        select_core_by_load(dev, inst, DEC_DEFAULT_CORE)
    } else {
        core
    }
}

/// Inserts `inst` into the load list, keeping the list in descending load order.
fn load_add(list: &mut Vec<Arc<Instance>>, inst: &Arc<Instance>) {
    list.retain(|i| i.id() != inst.id());
    let weighted_mb = inst.weighted_mb();
    let pos = list
        .iter()
        .rposition(|i| i.weighted_mb() > weighted_mb)
        .map_or(0, |p| p + 1);
    list.insert(pos, Arc::clone(inst));
}

fn load_delete(list: &mut Vec<Arc<Instance>>, inst: &Instance) -> bool {
    let before = list.len();
    list.retain(|i| i.id() != inst.id());
    list.len() != before
}

/// Updates the tracked load of `inst` and recomputes every core's `total_mb`.
///
/// Fixed-class instances count toward their fixed core, dual-core instances count half toward
/// each core and switched-to-single instances count fully toward their current core. Free
/// instances are re-evaluated with [`select_core_by_load`]; the ones whose selection differs from
/// their current core are handed to the migration worker. Migrations are only queued when a
/// stable load is added, more than one instance is open and no migration is pending. A
/// switched-to-single instance left alone on the device is queued to return to its dual-core
/// mode.
pub(crate) fn load_balance(dev: &Device, inst: &Arc<Instance>, change: LoadChange) {
    if dev.core_balance() == 100 || !dev.is_multi_core() {
        debug!("{}: load balancing disabled", inst.id());
        return;
    }

    let mut list = dev.load_list.lock();
    match change {
        LoadChange::Add => load_add(&mut list, inst),
        LoadChange::Delete => {
            if !load_delete(&mut list, inst) {
                return;
            }
        }
    }

    if change == LoadChange::Add && !inst.load().ts_is_full {
        debug!("{}: load is not yet stable", inst.id());
        return;
    }

    let num_inst = dev.num_inst();
    let migration_idle = !dev.migration.is_busy();
    let may_move = change == LoadChange::Add && num_inst > 1 && migration_idle;
    let may_rejoin = num_inst == 1 && migration_idle;

    for core in &dev.cores {
        core.set_total_mb(0);
    }
    for tmp in list.iter() {
        let op_core_type = tmp.mode().op_core_type;
        if let Some(core) = op_core_type.fixed_core() {
            match dev.core(core) {
                Ok(core) => core.add_total_mb(tmp.weighted_mb()),
                Err(e) => error!("{}: {}", tmp.id(), e),
            }
        }
    }

    let mut moves = Vec::new();
    for tmp in list.iter() {
        let mut mode = tmp.mode();
        if mode.op_core_type != OpCoreType::All {
            continue;
        }
        let weighted_mb = tmp.weighted_mb();
        let selected = select_core_by_load(dev, tmp, DEC_DEFAULT_CORE);
        if mode.op_mode.is_multi() {
            let (Some(master), Some(slave)) = (mode.master(), mode.slave()) else {
                error!("{}: dual-core mode without both cores", tmp.id());
                continue;
            };
            let share = weighted_mb / dev.num_core() as u64;
            for core in [master, slave] {
                if let Ok(core) = dev.core(core) {
                    core.add_total_mb(share);
                }
            }
            debug!("{}: load split over both cores", tmp.id());
            continue;
        }
        let Some(master) = mode.master() else {
            debug!("{}: not assigned to a core yet", tmp.id());
            continue;
        };
        if mode.op_mode.is_switch_single() {
            if may_rejoin {
                debug!("{}: can return to {:?}", tmp.id(), mode.stream_op_mode);
                moves.push(Arc::clone(tmp));
            }
            if let Ok(core) = dev.core(master) {
                core.add_total_mb(weighted_mb);
            }
            continue;
        }
        if let Ok(core) = dev.core(selected) {
            core.add_total_mb(weighted_mb);
        }
        if selected == master {
            debug!("{}: keep {}", tmp.id(), master);
        } else if may_move {
            debug!("{}: move {} -> {}", tmp.id(), master, selected);
            mode.move_to = Some(selected);
            moves.push(Arc::clone(tmp));
        }
    }

    if log_enabled!(Level::Debug) {
        for core in &dev.cores {
            debug!(
                "{}: total {} mb ({:?}%), balance {}%",
                core.id(),
                core.total_mb(),
                core.load_percent(),
                dev.core_balance()
            );
        }
    }
    drop(list);

    if !moves.is_empty() && !dev.migration.enqueue_if_idle(moves) {
        debug!("migration already pending, rebalance deferred");
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

    fn device(balance: u32, max_mb: Vec<u64>) -> Device {
        let fake = Arc::new(FakeCoreOps::new());
        let ops: Vec<Arc<dyn CoreOps>> = vec![fake.clone(), fake];
        let config = RmConfig {
            core_balance: balance,
            max_mb,
            ..Default::default()
        };
        Device::new(config, ops).unwrap()
    }

    fn open(dev: &Device, codec: Codec, mb: u64) -> Arc<Instance> {
        let inst = dev
            .insert_instance(InstanceParams {
                kind: InstanceKind::Decoder,
                codec,
                resolution: Default::default(),
                is_drm: false,
            })
            .unwrap();
        inst.set_load(mb, true);
        let core = get_core_num(dev, &inst);
        inst.mode().set_core_num(core);
        inst
    }

    #[test]
    fn default_core_until_threshold() {
        let dev = device(50, vec![100, 100]);
        let x = open(&dev, Codec::H264, 40);
        assert_eq!(select_core_by_load(&dev, &x, DEC_DEFAULT_CORE), CoreId(0));
        dev.cores[0].set_total_mb(40);
        let y = open(&dev, Codec::Hevc, 30);
        assert_eq!(y.mode().master(), Some(CoreId(1)));
    }

    #[test]
    fn past_threshold_on_both_picks_lower_load() {
        let dev = device(50, vec![100, 100]);
        let x = open(&dev, Codec::H264, 10);
        dev.cores[0].set_total_mb(60);
        dev.cores[1].set_total_mb(70);
        assert_eq!(select_core_by_load(&dev, &x, DEC_DEFAULT_CORE), CoreId(0));
        dev.cores[1].set_total_mb(60);
        assert_eq!(select_core_by_load(&dev, &x, DEC_DEFAULT_CORE), CoreId(0));
        dev.cores[1].set_total_mb(55);
        assert_eq!(select_core_by_load(&dev, &x, DEC_DEFAULT_CORE), CoreId(1));
    }

    #[test]
    fn missing_capacity_uses_default_core() {
        let dev = device(50, vec![100]);
        let x = open(&dev, Codec::H264, 10);
        dev.cores[0].set_total_mb(99);
        assert_eq!(select_core_by_load(&dev, &x, DEC_DEFAULT_CORE), CoreId(0));
    }

    #[test]
    fn balance_100_disables_selection() {
        let dev = device(100, vec![100, 100]);
        let x = open(&dev, Codec::H264, 10);
        dev.cores[0].set_total_mb(1000);
        assert_eq!(get_core_num(&dev, &x), CoreId(0));
    }

    #[test]
    fn fixed_classes_ignore_load() {
        let dev = device(50, vec![100, 100]);
        dev.cores[1].set_total_mb(100);
        let av1 = open(&dev, Codec::Av1, 10);
        assert_eq!(av1.mode().master(), Some(CoreId(1)));
        assert_eq!(av1.mode().op_core_type, OpCoreType::Fixed1);
        dev.cores[0].set_total_mb(100);
        let vp9 = open(&dev, Codec::Vp9, 10);
        assert_eq!(vp9.mode().master(), Some(CoreId(0)));
    }

    #[test]
    fn list_sorted_by_descending_load() {
        let dev = device(80, vec![100, 100]);
        let a = open(&dev, Codec::Vp9, 10);
        let b = open(&dev, Codec::Vp9, 30);
        let c = open(&dev, Codec::Vp9, 20);
        let mut list = Vec::new();
        load_add(&mut list, &a);
        load_add(&mut list, &b);
        load_add(&mut list, &c);
        let ids: Vec<_> = list.iter().map(|i| i.id().0).collect();
        assert_eq!(ids, vec![1, 2, 0]);

        a.set_load(50, true);
        load_add(&mut list, &a);
        let ids: Vec<_> = list.iter().map(|i| i.id().0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(load_delete(&mut list, &b));
        assert!(!load_delete(&mut list, &b));
    }

    #[test]
    fn totals_recomputed_per_class() {
        let dev = device(50, vec![100, 100]);
        let _fixed = open(&dev, Codec::Av1, 20);
        let dual = open(&dev, Codec::Hevc, 40);
        {
            let mut mode = dual.mode();
            mode.set_op_mode(crate::OpMode::TwoMode2);
            mode.set_core_num(CoreId(0));
        }
        for inst in dev.instances() {
            load_balance(&dev, &inst, LoadChange::Add);
        }
        assert_eq!(dev.cores[0].total_mb(), 20);
        assert_eq!(dev.cores[1].total_mb(), 40);
    }

    #[test]
    fn unstable_load_is_only_recorded() {
        let dev = device(50, vec![100, 100]);
        let x = open(&dev, Codec::H264, 40);
        x.set_load(40, false);
        load_balance(&dev, &x, LoadChange::Add);
        assert_eq!(dev.load_list.lock().len(), 1);
        assert_eq!(dev.cores[0].total_mb(), 0);
    }
}
