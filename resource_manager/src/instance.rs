// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An open decode or encode session and its core assignment.

use std::sync::MutexGuard;

use log::debug;
use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;

use crate::buffer::BufferQueues;
use crate::CoreId;
use crate::InstanceId;
use crate::DEC_DEFAULT_CORE;
use crate::ENC_DEFAULT_CORE;
use crate::SURPLUS_CORE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Decoder,
    Encoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    H264,
    H264Mvc,
    Hevc,
    Av1,
    Vp8,
    Vp9,
    Mpeg4,
    Jpeg,
}

/// Policy class deciding where an instance may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCoreType {
    Fixed0,
    Fixed1,
    All,
    NotFixed,
}

impl OpCoreType {
    /// The core a fixed class is pinned to.
    pub fn fixed_core(self) -> Option<CoreId> {
        match self {
            OpCoreType::Fixed0 => Some(CoreId(0)),
            OpCoreType::Fixed1 => Some(CoreId(1)),
            OpCoreType::All | OpCoreType::NotFixed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpMode {
    Single,
    /// Dual-core, the cores alternate by command type.
    TwoMode1,
    /// Dual-core, source buffers are split round-robin by sequence number.
    TwoMode2,
    Switching,
    SwitchToSingle,
    /// Switched to single, but the first buffer on the surviving core still runs as a mode 2
    /// frame.
    SwitchButMode2,
}

impl OpMode {
    pub fn is_multi(self) -> bool {
        matches!(self, OpMode::TwoMode1 | OpMode::TwoMode2)
    }

    pub fn is_switch_single(self) -> bool {
        matches!(self, OpMode::SwitchToSingle | OpMode::SwitchButMode2)
    }

    fn allows_slave(self) -> bool {
        self.is_multi() || self == OpMode::Switching
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master = 0,
    Slave = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn is_8k(&self) -> bool {
        u64::from(self.width) * u64::from(self.height) >= 7680 * 4320
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceParams {
    pub kind: InstanceKind,
    pub codec: Codec,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub is_drm: bool,
}

impl InstanceParams {
    /// Policy class of the codec and the core it starts on before any balancing.
    pub fn core_class(&self) -> (OpCoreType, CoreId) {
        match (self.kind, self.codec) {
            (InstanceKind::Decoder, Codec::Av1) => (OpCoreType::Fixed1, SURPLUS_CORE),
            (InstanceKind::Decoder, Codec::H264 | Codec::H264Mvc | Codec::Hevc) => {
                (OpCoreType::All, DEC_DEFAULT_CORE)
            }
            _ => (OpCoreType::Fixed0, CoreId(0)),
        }
    }

    /// Core the instance is initialized on.
    pub fn default_core(&self) -> CoreId {
        match self.kind {
            InstanceKind::Decoder => DEC_DEFAULT_CORE,
            InstanceKind::Encoder => ENC_DEFAULT_CORE,
        }
    }
}

/// Operating mode and core assignment, guarded by the instance mode lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeState {
    pub op_mode: OpMode,
    pub stream_op_mode: OpMode,
    pub op_core_type: OpCoreType,
    /// Indexed by [`Role`].
    pub op_core: [Option<CoreId>; 2],
    /// Destination chosen by a rebalance pass.
    pub move_to: Option<CoreId>,
    /// Hardware instance number on the slave core, needed by dual-core init buffer.
    pub slave_inst_no: Option<u32>,
}

impl Default for ModeState {
    fn default() -> Self {
        ModeState {
            op_mode: OpMode::Single,
            stream_op_mode: OpMode::Single,
            op_core_type: OpCoreType::NotFixed,
            op_core: [None, None],
            move_to: None,
            slave_inst_no: None,
        }
    }
}

impl ModeState {
    pub fn master(&self) -> Option<CoreId> {
        self.op_core[Role::Master as usize]
    }

    pub fn slave(&self) -> Option<CoreId> {
        self.op_core[Role::Slave as usize]
    }

    /// Assigned cores, master first.
    pub fn cores(&self) -> impl Iterator<Item = CoreId> + '_ {
        self.op_core.iter().map_while(|c| *c)
    }

    /// Sets the master core. The slave is the other core while a dual-core mode is active.
    pub fn set_core_num(&mut self, master: CoreId) {
        self.op_core[Role::Master as usize] = Some(master);
        self.op_core[Role::Slave as usize] = if self.op_mode.allows_slave() {
            Some(master.other())
        } else {
            None
        };
    }

    /// Changes the operating mode. Leaving a dual-core mode drops the slave.
    pub fn set_op_mode(&mut self, op_mode: OpMode) {
        self.op_mode = op_mode;
        if !op_mode.allows_slave() {
            self.op_core[Role::Slave as usize] = None;
        }
    }

    /// Puts a switched-to-single instance back to its stream mode without touching the hardware.
    pub fn restore_stream_mode(&mut self) {
        self.op_mode = self.stream_op_mode;
        self.set_core_num(DEC_DEFAULT_CORE);
    }

    /// The second core holding a context for this instance: the slave in a dual-core mode, or
    /// the core abandoned by a switch to single.
    pub fn partner_core(&self) -> Option<CoreId> {
        match self.slave() {
            Some(slave) => Some(slave),
            None if self.op_mode.is_switch_single() => self.master().map(CoreId::other),
            None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadInfo {
    pub weighted_mb: u64,
    /// The load measurement window is full and `weighted_mb` is trustworthy.
    pub ts_is_full: bool,
    pub update_framerate: bool,
    pub update_bitrate: bool,
}

pub struct Instance {
    id: InstanceId,
    params: InstanceParams,
    mode: Mutex<ModeState>,
    queues: Mutex<BufferQueues>,
    load: Mutex<LoadInfo>,
    // Serializes lifecycle and stop operations of this instance.
    lifecycle: Mutex<()>,
    migration: Mutex<()>,
}

impl Instance {
    pub fn new(id: InstanceId, params: InstanceParams) -> Instance {
        Instance {
            id,
            params,
            mode: Mutex::new(ModeState::default()),
            queues: Mutex::new(BufferQueues::default()),
            load: Mutex::new(LoadInfo::default()),
            lifecycle: Mutex::new(()),
            migration: Mutex::new(()),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn params(&self) -> &InstanceParams {
        &self.params
    }

    pub fn mode(&self) -> MutexGuard<ModeState> {
        self.mode.lock()
    }

    pub fn mode_snapshot(&self) -> ModeState {
        self.mode.lock().clone()
    }

    pub fn queues(&self) -> MutexGuard<BufferQueues> {
        self.queues.lock()
    }

    pub(crate) fn lifecycle(&self) -> MutexGuard<()> {
        self.lifecycle.lock()
    }

    pub(crate) fn migration(&self) -> MutexGuard<()> {
        self.migration.lock()
    }

    pub fn load(&self) -> LoadInfo {
        *self.load.lock()
    }

    pub fn weighted_mb(&self) -> u64 {
        self.load.lock().weighted_mb
    }

    /// Records a new load measurement. `stable` marks that the measurement window is full.
    pub fn set_load(&self, weighted_mb: u64, stable: bool) {
        let mut load = self.load.lock();
        load.weighted_mb = weighted_mb;
        load.ts_is_full = stable;
    }

    pub fn mark_framerate_updated(&self) {
        self.load.lock().update_framerate = true;
    }

    pub fn mark_bitrate_updated(&self) {
        self.load.lock().update_bitrate = true;
    }

    pub(crate) fn clear_load_updates(&self) {
        let mut load = self.load.lock();
        load.update_bitrate = false;
        if self.params.kind == InstanceKind::Encoder {
            load.update_framerate = false;
        }
    }

    /// Called by the core command layer when `core` starts executing source buffer `src_index`.
    ///
    /// Must not be called with a hardware lock held.
    pub fn src_issued(&self, core: CoreId, src_index: u32) {
        let mut mode = self.mode.lock();
        self.queues.lock().set_curr_src_index(src_index);
        if mode.op_mode == OpMode::SwitchButMode2 {
            debug!(
                "{}: last mode 2 frame {} ran on {}, now single",
                self.id, src_index, core
            );
            mode.set_op_mode(OpMode::SwitchToSingle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(codec: Codec) -> InstanceParams {
        InstanceParams {
            kind: InstanceKind::Decoder,
            codec,
            resolution: Resolution {
                width: 1920,
                height: 1080,
            },
            is_drm: false,
        }
    }

    #[test]
    fn codec_classes() {
        assert_eq!(decoder(Codec::Av1).core_class().0, OpCoreType::Fixed1);
        assert_eq!(decoder(Codec::Hevc).core_class().0, OpCoreType::All);
        assert_eq!(decoder(Codec::H264Mvc).core_class().0, OpCoreType::All);
        assert_eq!(decoder(Codec::Vp9).core_class(), (OpCoreType::Fixed0, CoreId(0)));
        let encoder = InstanceParams {
            kind: InstanceKind::Encoder,
            ..decoder(Codec::H264)
        };
        assert_eq!(encoder.core_class().0, OpCoreType::Fixed0);
    }

    #[test]
    fn slave_only_in_dual_modes() {
        let mut mode = ModeState::default();
        mode.set_core_num(CoreId(1));
        assert_eq!(mode.op_core, [Some(CoreId(1)), None]);

        mode.set_op_mode(OpMode::TwoMode2);
        mode.set_core_num(CoreId(0));
        assert_eq!(mode.slave(), Some(CoreId(1)));
        assert_eq!(mode.cores().collect::<Vec<_>>(), vec![CoreId(0), CoreId(1)]);

        mode.set_op_mode(OpMode::SwitchToSingle);
        assert_eq!(mode.slave(), None);
        assert_eq!(mode.partner_core(), Some(CoreId(1)));

        mode.set_op_mode(OpMode::Single);
        assert_eq!(mode.partner_core(), None);
    }

    #[test]
    fn restore_stream_mode_rehomes_to_default_core() {
        let mut mode = ModeState {
            op_mode: OpMode::SwitchToSingle,
            stream_op_mode: OpMode::TwoMode2,
            op_core: [Some(CoreId(1)), None],
            ..Default::default()
        };
        mode.restore_stream_mode();
        assert_eq!(mode.op_mode, OpMode::TwoMode2);
        assert_eq!(mode.op_core, [Some(CoreId(0)), Some(CoreId(1))]);
    }

    #[test]
    fn resolution_8k() {
        assert!(Resolution {
            width: 7680,
            height: 4320
        }
        .is_8k());
        assert!(!Resolution {
            width: 3840,
            height: 2160
        }
        .is_8k());
    }

    #[test]
    fn src_issued_finishes_switch_but_mode2() {
        let inst = Instance::new(InstanceId(0), decoder(Codec::Hevc));
        inst.mode().op_mode = OpMode::SwitchButMode2;
        inst.src_issued(CoreId(0), 7);
        assert_eq!(inst.mode().op_mode, OpMode::SwitchToSingle);
        assert_eq!(inst.queues().curr_src_index(), Some(7));
    }

    #[test]
    fn encoder_keeps_no_framerate_flag() {
        let params = InstanceParams {
            kind: InstanceKind::Encoder,
            ..decoder(Codec::H264)
        };
        let inst = Instance::new(InstanceId(1), params);
        inst.mark_framerate_updated();
        inst.mark_bitrate_updated();
        inst.clear_load_updates();
        assert!(!inst.load().update_framerate);
        assert!(!inst.load().update_bitrate);
    }
}
