//! End-to-end stress run: write resolution 0 with jittered tiles, consolidate, build the pyramid.
//!
use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::fs;
use tracing::{info, info_span, Instrument};

use crate::{
    array::{ArrayStore, Mode},
    config::StressConfig,
    consolidate,
    errors::Result,
    filesystem::FsMapper,
    pyramid::{LevelReport, PyramidBuilder},
    resolver::Resolver,
    scheduler::{pattern, TaskExecutor, TileScheduler},
};

#[derive(Clone, Debug)]
pub struct RunReport {
    /// One report per resolution, starting at 0
    pub levels: Vec<LevelReport>,

    /// Bytes stored for every level once the run finished
    pub stored_bytes: u64,

    pub elapsed: Duration,
}

/// Run the stress test against a fresh directory at `config.root`.
///
pub async fn run(config: &StressConfig) -> Result<RunReport> {
    config.validate()?;

    match fs::remove_dir_all(&config.root).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
        _ => {}
    }
    fs::create_dir_all(&config.root).await?;
    info!(root = %config.root.display(), "recreated root");

    let mapper = FsMapper::new(&config.root);
    let resolver = Arc::new(Resolver::new(Box::new(mapper), config.cache_bytes));

    run_with_store(config, ArrayStore::new(resolver)).await
}

/// Run the stress test against an empty store.
///
pub async fn run_with_store(config: &StressConfig, store: ArrayStore) -> Result<RunReport> {
    let started = Instant::now();
    let executor = TaskExecutor::new(config.max_workers);
    let space = config.space();
    let tile = [config.tile.y, config.tile.x];

    let base = write_base(config, &store, &executor)
        .instrument(info_span!("level", resolution = 0))
        .await?;

    let pyramid = PyramidBuilder::new(
        store.clone(),
        executor,
        tile,
        config.consolidation.clone(),
    );
    let mut levels = vec![base];
    levels.extend(pyramid.build::<u16>(&space, config.resolutions).await?);

    let mut stored_bytes = 0;
    for level in &levels {
        for entry in store.resolver().ls(&level.uri).await? {
            stored_bytes += entry.size.unwrap_or(0);
        }
    }

    let report = RunReport {
        levels,
        stored_bytes,
        elapsed: started.elapsed(),
    };
    info!(
        levels = report.levels.len(),
        stored_bytes,
        elapsed = ?report.elapsed,
        "stress run finished"
    );

    Ok(report)
}

async fn write_base(
    config: &StressConfig,
    store: &ArrayStore,
    executor: &TaskExecutor,
) -> Result<LevelReport> {
    let tile = [config.tile.y, config.tile.x];
    let uri = store
        .create_array(0, &config.space(), tile[0], tile[1])
        .await?;

    let handle = Arc::new(store.open::<u16>(&uri, Mode::Write).await?);
    let schema = handle.schema().clone();
    let mut scheduler = TileScheduler::new(executor.clone(), tile, config.overlap, config.rng());
    let stats = scheduler.write_array(&handle, pattern::<u16>).await?;
    drop(handle);

    let consolidation =
        consolidate::consolidate_and_vacuum(store, &uri, &config.consolidation).await?;
    info!(
        uri = %uri,
        tasks = stats.tasks,
        before = consolidation.fragments_before,
        after = consolidation.fragments_after,
        "wrote resolution 0"
    );

    Ok(LevelReport {
        resolution: 0,
        uri,
        extents: schema.extents(),
        tiles: schema.tiles(),
        tasks: stats.tasks,
        consolidation,
    })
}
