//! Partition planes into tiles and write them concurrently on a bounded pool of workers.
//!
use std::{future::Future, sync::Arc};

use ndarray::Array2;
use num_traits::NumCast;
use rand::{rngs::StdRng, Rng};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info};

use crate::{
    array::ArrayHandle,
    cell::Cell,
    errors::{Error, Result},
    fragment::FragmentId,
    geom::{Rect, TileCoord, C, T, X, Y, Z},
    helpers::tiles_along,
};

/// A grid of tiles covering a `rows` by `cols` plane.
///
/// Tiles are enumerated row major. Tiles in the last row and column are clipped to the plane.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileGrid {
    rows: usize,
    cols: usize,
    tile_rows: usize,
    tile_cols: usize,
}

impl TileGrid {
    pub fn new(plane: [usize; 2], tile: [usize; 2]) -> Self {
        Self {
            rows: plane[0],
            cols: plane[1],
            tile_rows: tile[0],
            tile_cols: tile[1],
        }
    }

    /// Number of tiles along each axis
    pub fn shape(&self) -> [usize; 2] {
        [
            tiles_along(self.rows, self.tile_rows),
            tiles_along(self.cols, self.tile_cols),
        ]
    }

    pub fn len(&self) -> usize {
        let [rows, cols] = self.shape();
        rows * cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upper left corner of each tile
    pub fn origins(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let [rows, cols] = self.shape();
        (0..rows).flat_map(move |row| {
            (0..cols).map(move |col| (row * self.tile_rows, col * self.tile_cols))
        })
    }

    pub fn tiles(&self) -> Vec<Rect> {
        self.origins()
            .map(|(top, left)| self.tile_at(top, left))
            .collect()
    }

    /// Tiles with each origin pushed down and right by an independent random amount in
    /// `[1, overlap]` per axis.
    ///
    /// Jittered tiles may overlap their neighbours or leave gaps between them. An origin pushed
    /// off the plane is clamped to the last row or column. An `overlap` of 0 means no jitter.
    ///
    pub fn jittered<R: Rng>(&self, rng: &mut R, overlap: usize) -> Vec<Rect> {
        if overlap == 0 {
            return self.tiles();
        }

        let origins: Vec<(usize, usize)> = self.origins().collect();
        origins
            .into_iter()
            .map(|(top, left)| {
                let top = (top + rng.gen_range(1..=overlap)).min(self.rows - 1);
                let left = (left + rng.gen_range(1..=overlap)).min(self.cols - 1);
                self.tile_at(top, left)
            })
            .collect()
    }

    fn tile_at(&self, top: usize, left: usize) -> Rect {
        Rect::new(
            top,
            (top + self.tile_rows).min(self.rows),
            left,
            (left + self.tile_cols).min(self.cols),
        )
    }
}

/// A bounded pool of workers on the tokio runtime.
///
/// At most `max_workers` tasks submitted through this executor run at the same time. Clones
/// share the same pool.
///
#[derive(Clone, Debug)]
pub struct TaskExecutor {
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl TaskExecutor {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run every task and wait for all of them to finish.
    ///
    /// Results are returned in the order the tasks were given. The first task to fail ends the
    /// wait: its error is returned and the remaining tasks are aborted. A task that panics fails
    /// with `Error::TaskFailed`.
    ///
    pub async fn barrier<T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let count = tasks.len();
        let mut running = JoinSet::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let permits = Arc::clone(&self.permits);
            running.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|err| Error::TaskFailed(err.to_string()))?;

                task.await.map(|result| (index, result))
            });
        }

        let mut results: Vec<Option<T>> = (0..count).map(|_| None).collect();
        while let Some(joined) = running.join_next().await {
            match joined? {
                Ok((index, result)) => results[index] = Some(result),
                Err(err) => {
                    running.abort_all();
                    return Err(err);
                }
            }
        }

        results
            .into_iter()
            .map(|result| result.ok_or_else(|| Error::TaskFailed(String::from("task vanished"))))
            .collect()
    }
}

/// Totals for a run of the scheduler.
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Number of (t, c, z) planes written
    pub planes: usize,

    /// Number of write tasks dispatched, one per tile
    pub tasks: usize,

    /// Fragments written, in dispatch order
    pub fragments: Vec<FragmentId>,
}

/// Writes whole arrays a tile at a time, one barrier per (t, c, z) plane.
///
pub struct TileScheduler {
    executor: TaskExecutor,
    tile: [usize; 2],
    overlap: usize,
    rng: StdRng,
}

impl TileScheduler {
    /// # Arguments
    ///
    /// * `executor` - The worker pool tile tasks run on.
    /// * `tile` - Tile size, rows by columns. May be larger than the plane.
    /// * `overlap` - Upper bound of the random jitter applied to tile origins. 0 for none.
    /// * `rng` - Source of jitter.
    ///
    pub fn new(executor: TaskExecutor, tile: [usize; 2], overlap: usize, rng: StdRng) -> Self {
        Self {
            executor,
            tile,
            overlap,
            rng,
        }
    }

    /// Write one (t, c, z) plane of `handle`, generating cell values with `source`.
    ///
    /// Returns the fragments written, in tile order.
    ///
    pub async fn write_plane<N, S>(
        &mut self,
        handle: &Arc<ArrayHandle<N>>,
        t: usize,
        c: usize,
        z: usize,
        source: S,
    ) -> Result<Vec<FragmentId>>
    where
        N: Cell,
        S: Fn([usize; 5]) -> N + Clone + Send + Sync + 'static,
    {
        let extents = handle.schema().extents();
        let grid = TileGrid::new([extents[Y], extents[X]], self.tile);
        let rects = grid.jittered(&mut self.rng, self.overlap);

        let tasks = rects
            .into_iter()
            .map(|rect| {
                let handle = Arc::clone(handle);
                let source = source.clone();
                async move {
                    let coord = TileCoord::new(t, c, z, rect);
                    let buffer = Array2::from_shape_fn((rect.rows(), rect.cols()), |(row, col)| {
                        source([t, c, z, rect.top + row, rect.left + col])
                    });

                    handle.write_tile(&coord, buffer.view()).await
                }
            })
            .collect();

        let fragments = self.executor.barrier(tasks).await?;
        debug!(uri = handle.uri(), t, c, z, tiles = fragments.len(), "wrote plane");

        Ok(fragments)
    }

    /// Write every (t, c, z) plane of `handle`.
    ///
    pub async fn write_array<N, S>(
        &mut self,
        handle: &Arc<ArrayHandle<N>>,
        source: S,
    ) -> Result<WriteStats>
    where
        N: Cell,
        S: Fn([usize; 5]) -> N + Clone + Send + Sync + 'static,
    {
        let extents = handle.schema().extents();
        let mut stats = WriteStats::default();
        for t in 0..extents[T] {
            for c in 0..extents[C] {
                for z in 0..extents[Z] {
                    let fragments = self.write_plane(handle, t, c, z, source.clone()).await?;
                    stats.planes += 1;
                    stats.tasks += fragments.len();
                    stats.fragments.extend(fragments);
                }
            }
        }
        info!(
            uri = handle.uri(),
            planes = stats.planes,
            tasks = stats.tasks,
            workers = self.executor.max_workers(),
            "wrote array"
        );

        Ok(stats)
    }
}

/// Deterministic cell values for generated data.
///
/// Values stay below 127 so that every cell type can hold them.
///
pub fn pattern<N: Cell>(point: [usize; 5]) -> N {
    let value = (point[Y] * 31 + point[X] * 17 + point[C] * 7 + point[Z] * 3 + point[T]) % 127;

    <N as NumCast>::from(value).unwrap_or_else(N::zero)
}
