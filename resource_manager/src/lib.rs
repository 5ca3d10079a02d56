// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Resource manager for a two-core hardware video codec.
//!
//! Decides which physical core executes every open decode/encode instance, rebalances that
//! assignment as the per-instance load changes, splits very high resolution streams across both
//! cores and moves running instances between cores without losing in-flight buffers.
//!
//! The per-core command layer is abstracted by [`CoreOps`]; [`ResourceManager`] is the entry point
//! used by the device open/release and buffer-queueing paths.
//!
//! Lock hierarchy, outermost first: device migration lock, instance mode lock, core hardware locks
//! (lower core id first when both are needed for a dual-core operation), instance buffer-queue
//! lock.

mod buffer;
mod config;
mod core_handle;
mod device;
pub mod fake;
mod hwlock;
mod instance;
mod load_balance;
mod manager;
mod migration;
mod mode_switch;

use std::fmt;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use crate::buffer::BufferQueues;
pub use crate::buffer::DstBuffer;
pub use crate::buffer::SrcBuffer;
pub use crate::config::RmConfig;
pub use crate::core_handle::Core;
pub use crate::core_handle::CoreContext;
pub use crate::core_handle::CoreOps;
pub use crate::core_handle::FirmwareImage;
pub use crate::core_handle::InstState;
pub use crate::core_handle::StateQuery;
pub use crate::core_handle::WorkKind;
pub use crate::hwlock::HwLock;
pub use crate::hwlock::HwLockGuard;
pub use crate::hwlock::HwLockSet;
pub use crate::hwlock::LockOwner;
pub use crate::instance::Codec;
pub use crate::instance::Instance;
pub use crate::instance::InstanceKind;
pub use crate::instance::InstanceParams;
pub use crate::instance::LoadInfo;
pub use crate::instance::ModeState;
pub use crate::instance::OpCoreType;
pub use crate::instance::OpMode;
pub use crate::instance::Resolution;
pub use crate::instance::Role;
pub use crate::load_balance::LoadChange;
pub use crate::manager::QosControl;
pub use crate::manager::QueueType;
pub use crate::manager::ResourceManager;

/// Number of physical cores the hardware can expose.
pub const MAX_CORES: usize = 2;
/// Upper bound of concurrently open instances.
pub const MAX_INSTANCES: usize = 32;

/// Core that hosts decoders whose codec is free to balance, and the master of dual-core modes.
pub const DEC_DEFAULT_CORE: CoreId = CoreId(0);
/// Core picked once the default core is loaded past the balance threshold.
pub const SURPLUS_CORE: CoreId = CoreId(1);
/// Core every encoder starts on.
pub const ENC_DEFAULT_CORE: CoreId = CoreId(0);

/// Index of a physical core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreId(pub usize);

impl CoreId {
    /// The other core of a two-core device.
    pub fn other(self) -> CoreId {
        CoreId(self.0 ^ 1)
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

/// Arena index of an open instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub usize);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "inst{}", self.0)
    }
}

#[sorted]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no free instance slot")]
    ArenaFull,
    #[error("{0} is asleep")]
    CoreAsleep(CoreId),
    #[error("{op} failed on {core}: {reason}")]
    CoreOp {
        core: CoreId,
        op: &'static str,
        reason: String,
    },
    #[error("header parsing on {0} did not complete in time")]
    HeaderParseTimeout(CoreId),
    #[error("hardware lock of {0} timed out")]
    HwLockTimeout(CoreId),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{0} does not exist")]
    InvalidCore(CoreId),
    #[error("a migration is already in flight")]
    MigrationBusy,
    #[error("{0} runs in a dual-core mode")]
    MultiCoreMode(InstanceId),
    #[error("{instance} has no context on {core}")]
    NoContext { instance: InstanceId, core: CoreId },
    #[error("{0} has no header buffer queued")]
    NoHeaderBuffer(InstanceId),
    #[error("{0} has no master core")]
    NoMasterCore(InstanceId),
    #[error("{0} has no slave core")]
    NoSlaveCore(InstanceId),
    #[error("{0} is not running")]
    NotRunning(InstanceId),
    #[error("failed to spawn worker thread: {0}")]
    SpawnWorker(String),
    #[error("{0} is not open")]
    UnknownInstance(InstanceId),
}

impl Error {
    /// True for conditions that resolve by themselves and are retried on the next request or
    /// rebalance pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CoreAsleep(_)
                | Error::HwLockTimeout(_)
                | Error::MigrationBusy
                | Error::MultiCoreMode(_)
                | Error::NotRunning(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_core() {
        assert_eq!(DEC_DEFAULT_CORE.other(), SURPLUS_CORE);
        assert_eq!(SURPLUS_CORE.other(), DEC_DEFAULT_CORE);
    }

    #[test]
    fn retryable_errors() {
        assert!(Error::HwLockTimeout(CoreId(1)).is_retryable());
        assert!(Error::CoreAsleep(CoreId(0)).is_retryable());
        assert!(!Error::CoreOp {
            core: CoreId(0),
            op: "instance_move_from",
            reason: "bad".to_string(),
        }
        .is_retryable());
        assert!(!Error::NoMasterCore(InstanceId(3)).is_retryable());
    }
}
