// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dry-runs the codec resource manager against simulated cores and prints where every instance
//! ended up.

mod workload;

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use argh::FromArgs;
use log::info;
use log::LevelFilter;
use resource_manager::RmConfig;

use crate::workload::Workload;

#[derive(FromArgs)]
/// Replays a workload through the codec resource manager.
struct Args {
    /// resource manager configuration (JSON). Built-in defaults when omitted.
    #[argh(option)]
    config: Option<PathBuf>,
    /// workload description (JSON).
    #[argh(option)]
    workload: PathBuf,
    /// log level: off, error, warn, info, debug or trace. (default: info)
    #[argh(option, default = "LevelFilter::Info")]
    log_level: LevelFilter,
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .init();

    let config = match &args.config {
        Some(path) => RmConfig::from_file(path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?,
        None => RmConfig::default(),
    };
    let workload = Workload::from_file(&args.workload)?;
    info!(
        "replaying {} instance(s) on {} core(s)",
        workload.instances.len(),
        workload.cores
    );

    let report = workload::run(config, &workload)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to serialize the report")?
    );
    Ok(())
}
