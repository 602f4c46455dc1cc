//! Stress test for concurrent tiled writes.
//!
//! Writes resolution 0 of a 5D array with jittered, overlapping tiles, consolidates it, then
//! builds the rest of the pyramid by downsampling. Configured by the TOML file named in
//! `TILESTORE_CONFIG`, logging by `RUST_LOG`.
//!
use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tilestore::StressConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = StressConfig::from_env().context("loading configuration")?;
    info!(
        root = %config.root.display(),
        extents = ?config.extents(),
        tile = ?[config.tile.y, config.tile.x],
        resolutions = config.resolutions,
        max_workers = config.max_workers,
        "starting stress run"
    );

    let report = tilestore::run(&config).await.context("stress run failed")?;
    for level in &report.levels {
        info!(
            resolution = level.resolution,
            uri = %level.uri,
            extents = ?level.extents,
            tasks = level.tasks,
            fragments = level.consolidation.fragments_after,
            "level summary"
        );
    }
    info!(
        stored_bytes = report.stored_bytes,
        elapsed = ?report.elapsed,
        "done"
    );

    Ok(())
}
