// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;
use resource_manager::fake::FakeCoreOps;
use resource_manager::Codec;
use resource_manager::CoreId;
use resource_manager::CoreOps;
use resource_manager::InstanceId;
use resource_manager::InstanceKind;
use resource_manager::InstanceParams;
use resource_manager::OpCoreType;
use resource_manager::OpMode;
use resource_manager::QosControl;
use resource_manager::Resolution;
use resource_manager::ResourceManager;
use resource_manager::RmConfig;
use resource_manager::WorkKind;
use serde::Deserialize;
use serde::Serialize;

const MIGRATION_WAIT: Duration = Duration::from_secs(5);

fn default_cores() -> usize {
    2
}

/// Instances to open, in order, and the cores to open them on.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workload {
    #[serde(default = "default_cores")]
    pub cores: usize,
    pub instances: Vec<WorkloadInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadInstance {
    pub kind: InstanceKind,
    pub codec: Codec,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub is_drm: bool,
    #[serde(default)]
    pub weighted_mb: u64,
    /// Frames queued after the header buffer; the last one carries end of stream.
    #[serde(default)]
    pub frames: u32,
    /// Dual-core mode the stream asks for after its header is parsed.
    #[serde(default)]
    pub op_mode: Option<OpMode>,
}

impl Workload {
    pub fn from_json_str(json: &str) -> Result<Workload> {
        let workload: Workload = serde_json::from_str(json).context("invalid workload")?;
        if workload.cores == 0 {
            bail!("a workload needs at least one core");
        }
        Ok(workload)
    }

    pub fn from_file(path: &Path) -> Result<Workload> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read workload {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("in {}", path.display()))
    }
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub cores: Vec<CoreReport>,
    pub instances: Vec<InstanceReport>,
}

#[derive(Debug, Serialize)]
pub struct CoreReport {
    pub core: CoreId,
    pub total_mb: u64,
    pub load_percent: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct InstanceReport {
    pub id: InstanceId,
    pub codec: Codec,
    pub core: Option<CoreId>,
    pub op_mode: OpMode,
    pub op_core_type: OpCoreType,
    /// (core, sequence number) of every submitted source buffer, in submission order.
    pub submissions: Vec<(CoreId, u32)>,
}

/// Opens every workload instance, streams its frames and reports the outcome.
pub fn run(config: RmConfig, workload: &Workload) -> Result<Report> {
    let fake = Arc::new(FakeCoreOps::new());
    let ops: Vec<Arc<dyn CoreOps>> = (0..workload.cores)
        .map(|_| Arc::clone(&fake) as Arc<dyn CoreOps>)
        .collect();
    let rm = ResourceManager::new(config, ops).context("failed to create the resource manager")?;

    let mut ids = Vec::new();
    for desc in &workload.instances {
        let id = open(&rm, desc)?;
        stream(&rm, &fake, id, desc)?;
        ids.push(id);
    }
    if !rm.wait_for_migrations(MIGRATION_WAIT) {
        warn!("migrations still pending after {:?}", MIGRATION_WAIT);
    }

    let mut instances = Vec::new();
    for id in ids {
        let inst = rm.instance(id)?;
        let mode = inst.mode_snapshot();
        instances.push(InstanceReport {
            id,
            codec: inst.params().codec,
            core: mode.master(),
            op_mode: mode.op_mode,
            op_core_type: mode.op_core_type,
            submissions: fake
                .issued_for(id)
                .iter()
                .map(|i| (i.core, i.src_index))
                .collect(),
        });
    }
    let cores = (0..rm.num_cores())
        .map(|n| rm.core(CoreId(n)))
        .map(|core| {
            core.map(|core| CoreReport {
                core: core.id(),
                total_mb: core.total_mb(),
                load_percent: core.load_percent(),
            })
        })
        .collect::<resource_manager::Result<_>>()?;
    Ok(Report { cores, instances })
}

fn open(rm: &ResourceManager, desc: &WorkloadInstance) -> Result<InstanceId> {
    let inst = rm.create_instance(InstanceParams {
        kind: desc.kind,
        codec: desc.codec,
        resolution: desc.resolution,
        is_drm: desc.is_drm,
    })?;
    let id = inst.id();
    rm.instance_init(id)
        .with_context(|| format!("failed to init {}", id))?;
    inst.set_load(desc.weighted_mb, true);
    rm.instance_open(id)
        .with_context(|| format!("failed to open {}", id))?;
    rm.qos_control(id, QosControl::On)?;
    info!(
        "{}: {:?} {:?} opened on {:?}",
        id,
        desc.kind,
        desc.codec,
        inst.mode_snapshot().master()
    );
    Ok(id)
}

fn stream(
    rm: &ResourceManager,
    fake: &FakeCoreOps,
    id: InstanceId,
    desc: &WorkloadInstance,
) -> Result<()> {
    let inst = rm.instance(id)?;
    inst.queues().queue_src(0, false);
    rm.request_work(WorkKind::Try, Some(id))?;

    if let Some(op_mode) = desc.op_mode {
        if let Err(e) = rm.instance_setup(id, op_mode) {
            warn!("{}: staying single-core: {}", id, e);
        }
    }

    {
        let mut queues = inst.queues();
        queues.queue_dst(0);
        for index in 1..=desc.frames {
            queues.queue_src(index, index == desc.frames);
        }
    }
    // Init buffer first, then the frames. A stalled stream stops after two idle requests.
    let mut submitted = fake.issued_for(id).len();
    let mut idle = 0;
    while idle < 2 {
        rm.request_work(WorkKind::Try, Some(id))?;
        let now = fake.issued_for(id).len();
        if now == submitted {
            idle += 1;
        } else {
            idle = 0;
            submitted = now;
        }
    }
    info!("{}: {} source buffers submitted", id, submitted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const TWO_STREAMS: &str = r#"{
        "instances": [
            { "kind": "decoder", "codec": "h264", "weighted_mb": 40, "frames": 3 },
            { "kind": "decoder", "codec": "av1", "weighted_mb": 30, "frames": 2 }
        ]
    }"#;

    fn small_cores() -> RmConfig {
        RmConfig {
            core_balance: 50,
            max_mb: vec![100, 100],
            ..Default::default()
        }
    }

    #[test]
    fn parses_with_defaults() {
        let workload = Workload::from_json_str(TWO_STREAMS).unwrap();
        assert_eq!(workload.cores, 2);
        assert_eq!(workload.instances[1].codec, Codec::Av1);
        assert_eq!(workload.instances[0].op_mode, None);
        assert!(!workload.instances[0].is_drm);
    }

    #[test]
    fn rejects_unknown_fields_and_zero_cores() {
        assert!(Workload::from_json_str(r#"{ "instances": [], "gpus": 1 }"#).is_err());
        assert!(Workload::from_json_str(r#"{ "cores": 0, "instances": [] }"#).is_err());
    }

    #[test]
    fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TWO_STREAMS.as_bytes()).unwrap();
        let workload = Workload::from_file(file.path()).unwrap();
        assert_eq!(workload.instances.len(), 2);
    }

    #[test]
    fn replays_every_frame_in_order() {
        let workload = Workload::from_json_str(TWO_STREAMS).unwrap();
        let report = run(small_cores(), &workload).unwrap();

        let h264 = &report.instances[0];
        assert_eq!(h264.core, Some(CoreId(0)));
        assert_eq!(
            h264.submissions,
            vec![(CoreId(0), 0), (CoreId(0), 1), (CoreId(0), 2), (CoreId(0), 3)]
        );
        let av1 = &report.instances[1];
        assert_eq!(av1.core, Some(CoreId(1)));
        assert_eq!(av1.op_core_type, OpCoreType::Fixed1);
        assert_eq!(av1.submissions.len(), 3);
        assert_eq!(report.cores[0].total_mb, 40);
        assert_eq!(report.cores[1].total_mb, 30);
    }

    #[test]
    fn dual_core_stream_alternates_cores() {
        let workload = Workload::from_json_str(
            r#"{ "instances": [
                { "kind": "decoder", "codec": "hevc", "frames": 3, "op_mode": "two_mode2",
                  "resolution": { "width": 7680, "height": 4320 } }
            ] }"#,
        )
        .unwrap();
        let report = run(RmConfig::default(), &workload).unwrap();
        let cores: Vec<_> = report.instances[0]
            .submissions
            .iter()
            .map(|(core, _)| *core)
            .collect();
        assert_eq!(cores[..3], [CoreId(0), CoreId(1), CoreId(0)]);
        assert_eq!(cores.len(), 4);
        assert_eq!(report.instances[0].op_mode, OpMode::SwitchToSingle);
    }
}
