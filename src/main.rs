//! The PDV tester binary.
//!
//! Binds an in-memory loopback test bed (the driver layer is external; a
//! production deployment wires its own queues behind the same traits) and
//! runs the configured measurement. Exit code 0 means a valid, finished
//! test; any fatal condition exits non-zero with the reason on stderr.

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use natperf::config::{Cli, Config, FileConfig};
use natperf::measure::{Measurement, TestBed};
use natperf::tsc;

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file = if cli.config.exists() {
        FileConfig::load(&cli.config)?
    } else {
        warn!(
            "{} not found, using the built-in loopback testbed configuration",
            cli.config.display()
        );
        FileConfig::loopback()
    };
    let cfg = Config::assemble(&cli, &file)?;

    let hz = tsc::tsc_hz();
    info!("TSC frequency: {hz} Hz");
    info!(
        "{} test, {} fps for {} s per direction",
        if cfg.stateful == 0 { "stateless" } else { "stateful" },
        cfg.frame_rate,
        cfg.duration
    );

    let bed = TestBed::loopback();
    Measurement::new(cfg, hz)
        .run(bed)
        .context("measurement failed")?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
