//! Build the levels of an image pyramid above resolution 0 by downsampling the level below.
//!
use std::sync::Arc;

use tracing::{info, info_span, Instrument};

use crate::{
    array::{ArrayStore, Mode},
    cell::Cell,
    consolidate::{self, ConsolidationConfig, ConsolidationReport},
    downsample::{BoxFilter, Downsampler},
    errors::{Error, Result},
    geom::{TileCoord, C, T, X, Y, Z},
    scheduler::{TaskExecutor, TileGrid},
    schema::LogicalSpace,
};

/// What happened while writing one resolution level.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelReport {
    pub resolution: usize,
    pub uri: String,

    /// Declared extents of the level's array
    pub extents: [usize; 5],

    /// Declared tile extents of the level's array
    pub tiles: [usize; 5],

    /// Number of write tasks dispatched
    pub tasks: usize,

    pub consolidation: ConsolidationReport,
}

/// Writes pyramid levels 1 and up.
///
/// Level `r` has half the y and x extents of level `r - 1`, rounding down. Each destination tile
/// is computed from the source region at twice its coordinates, clipped to the source, and
/// written at its own coordinates in the destination.
///
pub struct PyramidBuilder<D: Downsampler = BoxFilter> {
    store: ArrayStore,
    executor: TaskExecutor,
    tile: [usize; 2],
    consolidation: ConsolidationConfig,
    downsampler: Arc<D>,
}

impl PyramidBuilder<BoxFilter> {
    pub fn new(
        store: ArrayStore,
        executor: TaskExecutor,
        tile: [usize; 2],
        consolidation: ConsolidationConfig,
    ) -> Self {
        Self::with_downsampler(store, executor, tile, consolidation, BoxFilter)
    }
}

impl<D: Downsampler + 'static> PyramidBuilder<D> {
    pub fn with_downsampler(
        store: ArrayStore,
        executor: TaskExecutor,
        tile: [usize; 2],
        consolidation: ConsolidationConfig,
        downsampler: D,
    ) -> Self {
        Self {
            store,
            executor,
            tile,
            consolidation,
            downsampler: Arc::new(downsampler),
        }
    }

    /// Build levels `1..resolutions` on top of an already written level 0 covering `base`.
    ///
    pub async fn build<N: Cell>(
        &self,
        base: &LogicalSpace,
        resolutions: usize,
    ) -> Result<Vec<LevelReport>> {
        let mut reports = vec![];
        let mut space = base.clone();
        for resolution in 1..resolutions {
            let span = info_span!("level", resolution);
            let report = self
                .build_level::<N>(resolution, &space)
                .instrument(span)
                .await?;
            space = space.halved();
            reports.push(report);
        }

        Ok(reports)
    }

    /// Build level `resolution` from level `resolution - 1`, which covers `source_space`.
    ///
    pub async fn build_level<N: Cell>(
        &self,
        resolution: usize,
        source_space: &LogicalSpace,
    ) -> Result<LevelReport> {
        if resolution == 0 {
            return Err(Error::Config(String::from(
                "resolution 0 has no level below it",
            )));
        }

        let space = source_space.halved();
        let uri = self
            .store
            .create_array(resolution, &space, self.tile[0], self.tile[1])
            .await?;

        let source_uri = ArrayStore::uri_for(resolution - 1);
        let source = Arc::new(self.store.open::<N>(&source_uri, Mode::Read).await?);
        let destination = Arc::new(self.store.open::<N>(&uri, Mode::Write).await?);

        let source_extents = source.schema().extents();
        let schema = destination.schema().clone();
        let extents = schema.extents();
        let grid = TileGrid::new([extents[Y], extents[X]], self.tile);
        let rects = grid.tiles();

        let mut tasks = 0;
        for t in 0..extents[T] {
            for c in 0..extents[C] {
                for z in 0..extents[Z] {
                    let plane: Vec<_> = rects
                        .iter()
                        .map(|rect| {
                            let rect = *rect;
                            let source = Arc::clone(&source);
                            let destination = Arc::clone(&destination);
                            let downsampler = Arc::clone(&self.downsampler);
                            async move {
                                let scaled =
                                    rect.scale(2, source_extents[Y], source_extents[X]);
                                let cells = source
                                    .read_tile(&TileCoord::new(t, c, z, scaled))
                                    .await?;
                                let cells = downsampler.downsample(cells.view(), rect.shape())?;

                                destination
                                    .write_tile(&TileCoord::new(t, c, z, rect), cells.view())
                                    .await
                            }
                        })
                        .collect();
                    tasks += self.executor.barrier(plane).await?.len();
                }
            }
        }
        drop(source);
        drop(destination);

        let consolidation =
            consolidate::consolidate_and_vacuum(&self.store, &uri, &self.consolidation).await?;
        info!(
            uri = %uri,
            extents = ?extents,
            tasks,
            fragments = consolidation.fragments_after,
            "built pyramid level"
        );

        Ok(LevelReport {
            resolution,
            uri,
            extents,
            tiles: schema.tiles(),
            tasks,
            consolidation,
        })
    }
}
