//! Code for the etxtbsy binary.

pub mod config;
pub mod deps;
pub mod dispatcher;
pub mod log;
pub mod worker;

use anyhow::Result;
use config::Config;
use deps::LinuxDeps;
use dispatcher::FatalPolicy;
use slog::{info, Logger};
use std::{ops::Add, process};
use worker::WorkerStats;

/// Run the harness with the real syscalls. Fatal worker errors terminate the process.
pub fn main(config: Config, log: Logger) -> Result<()> {
    info!(log, "started"; "config" => ?config, "pid" => process::id());

    let stats = dispatcher::run(&config, &log, FatalPolicy::ExitProcess, |_| LinuxDeps)?;

    let total = stats.into_iter().fold(WorkerStats::default(), Add::add);
    info!(log, "{}/{} anomalous", total.anomalies, total.iterations);
    Ok(())
}
