//! Dense tiled arrays: creation, typed handles, tile writes and range reads.
//!
use std::{
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use ndarray::{Array2, ArrayView2};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    cell::{self, Cell},
    errors::{Error, Result},
    fragment::{self, FragmentId, FragmentMeta},
    geom::{self, TileCoord},
    resolver::Resolver,
    schema::{ArraySchema, LogicalSpace},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Mode::Read => "read",
            Mode::Write => "write",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Creates and opens dense arrays in a data store.
///
/// Cloning an `ArrayStore` is cheap and clones share the same resolver, handle count and
/// sequence counters.
///
/// Sequence numbers are allocated per array from one counter shared by every handle opened
/// through the store, so fragments written by concurrent writers never share a sequence number.
///
#[derive(Clone)]
pub struct ArrayStore {
    resolver: Arc<Resolver>,
    open_handles: Arc<AtomicUsize>,
    sequences: Arc<Mutex<HashMap<String, Arc<AtomicU64>>>>,
}

impl ArrayStore {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self {
            resolver,
            open_handles: Arc::new(AtomicUsize::new(0)),
            sequences: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// The URI of the array holding pyramid level `resolution`.
    ///
    pub fn uri_for(resolution: usize) -> String {
        resolution.to_string()
    }

    /// Create the array for a pyramid level.
    ///
    /// The array covers `space`, with tiles of `tile_y` by `tile_x` cells clamped to the plane.
    /// Returns the URI of the new array.
    ///
    pub async fn create_array(
        &self,
        resolution: usize,
        space: &LogicalSpace,
        tile_y: usize,
        tile_x: usize,
    ) -> Result<String> {
        let uri = Self::uri_for(resolution);
        let schema = space.schema(tile_y, tile_x)?;
        self.create_array_with_schema(&uri, &schema).await?;

        Ok(uri)
    }

    /// Create an array at `uri` with an explicit schema.
    ///
    pub async fn create_array_with_schema(&self, uri: &str, schema: &ArraySchema) -> Result<()> {
        schema.validate()?;
        if self.resolver.load_schema(uri).await?.is_some() {
            return Err(Error::AlreadyExists(uri.to_string()));
        }
        self.resolver.save_schema(uri, schema).await?;
        self.sequences.lock().remove(uri);
        info!(
            uri,
            extents = ?schema.extents(),
            tiles = ?schema.tiles(),
            dtype = %schema.attribute.dtype,
            "created array"
        );

        Ok(())
    }

    pub async fn schema(&self, uri: &str) -> Result<ArraySchema> {
        self.resolver
            .load_schema(uri)
            .await?
            .ok_or_else(|| Error::NotFound(uri.to_string()))
    }

    /// Open an array for reading or writing cells of type `N`.
    ///
    /// The handle is released when it is dropped, whether or not the work using it succeeded.
    ///
    pub async fn open<N: Cell>(&self, uri: &str, mode: Mode) -> Result<ArrayHandle<N>> {
        let schema = self.schema(uri).await?;
        if schema.attribute.dtype != N::DATA_TYPE {
            return Err(Error::TypeMismatch {
                stored: schema.attribute.dtype.name(),
                requested: N::DATA_TYPE.name(),
            });
        }

        let all = self.resolver.fragments(uri).await?;
        let sequence = self.sequence(uri, &all).await?;
        let fragments = match mode {
            Mode::Read => fragment::visible(&all),
            Mode::Write => vec![],
        };

        let open = self.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(uri, %mode, fragments = fragments.len(), open, "opened array");

        Ok(ArrayHandle {
            uri: uri.to_string(),
            mode,
            schema,
            resolver: Arc::clone(&self.resolver),
            fragments,
            sequence,
            written: AtomicUsize::new(0),
            _guard: HandleGuard {
                uri: uri.to_string(),
                open_handles: Arc::clone(&self.open_handles),
            },
            _phantom: PhantomData,
        })
    }

    /// Number of handles currently open on arrays in this store.
    ///
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Visible fragments of the array at `uri`, in read order.
    ///
    pub async fn fragments(&self, uri: &str) -> Result<Vec<FragmentMeta>> {
        self.schema(uri).await?;
        Ok(fragment::visible(&self.resolver.fragments(uri).await?))
    }

    /// Every published fragment of the array at `uri`, including superseded ones.
    ///
    pub async fn all_fragments(&self, uri: &str) -> Result<Vec<FragmentMeta>> {
        self.schema(uri).await?;
        self.resolver.fragments(uri).await
    }

    /// Ids of the consolidated metadata objects of the array at `uri`, oldest first.
    ///
    pub async fn consolidated_meta(&self, uri: &str) -> Result<Vec<FragmentId>> {
        self.schema(uri).await?;
        self.resolver.consolidated_ids(uri).await
    }

    /// Take the next sequence number of the array at `uri`.
    ///
    pub(crate) async fn allocate_sequence(&self, uri: &str) -> Result<u64> {
        let all = self.resolver.fragments(uri).await?;
        let sequence = self.sequence(uri, &all).await?;

        Ok(sequence.fetch_add(1, Ordering::SeqCst))
    }

    /// The sequence counter of the array at `uri`, seeded from what is stored on first use.
    ///
    async fn sequence(&self, uri: &str, fragments: &[FragmentMeta]) -> Result<Arc<AtomicU64>> {
        let existing = self.sequences.lock().get(uri).cloned();
        if let Some(sequence) = existing {
            return Ok(sequence);
        }

        let next = self.next_sequence(uri, fragments).await?;
        let mut sequences = self.sequences.lock();
        let sequence = sequences
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(next)));

        Ok(Arc::clone(sequence))
    }

    /// The first sequence number not used by any fragment or consolidated metadata object.
    ///
    async fn next_sequence(&self, uri: &str, fragments: &[FragmentMeta]) -> Result<u64> {
        let fragments = fragments.iter().map(|meta| meta.id.last).max();
        let consolidated = self
            .resolver
            .consolidated_ids(uri)
            .await?
            .iter()
            .map(|id| id.last)
            .max();

        Ok(fragments.max(consolidated).map_or(1, |last| last + 1))
    }
}

/// Decrements the store's open handle count when the owning handle goes away.
///
struct HandleGuard {
    uri: String,
    open_handles: Arc<AtomicUsize>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        let open = self.open_handles.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(uri = %self.uri, open, "closed array");
    }
}

/// An open array, typed by the cells it holds.
///
/// Handles are meant to be shared between the tasks of a barrier with an `Arc`. A read handle
/// sees the fragments that were published when it was opened. Every `write_tile` through a write
/// handle publishes one new fragment.
///
pub struct ArrayHandle<N: Cell> {
    uri: String,
    mode: Mode,
    schema: ArraySchema,
    resolver: Arc<Resolver>,
    fragments: Vec<FragmentMeta>,
    sequence: Arc<AtomicU64>,
    written: AtomicUsize,
    _guard: HandleGuard,
    _phantom: PhantomData<N>,
}

impl<N: Cell> ArrayHandle<N> {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn schema(&self) -> &ArraySchema {
        &self.schema
    }

    /// Fragments visible to this handle, in read order. Always empty for write handles.
    ///
    pub fn fragments(&self) -> &[FragmentMeta] {
        &self.fragments
    }

    /// Number of fragments written through this handle.
    ///
    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    /// Release the handle.
    pub fn close(self) {}

    fn check_mode(&self, mode: Mode) -> Result<()> {
        if self.mode != mode {
            return Err(Error::Mode {
                uri: self.uri.clone(),
                mode: self.mode.name(),
            });
        }

        Ok(())
    }

    fn check_range(&self, coord: &TileCoord) -> Result<()> {
        let region = coord.region();
        let domain = self.schema.domain();
        if region.is_empty() || !domain.contains(&region) {
            return Err(Error::Range { region, domain });
        }

        Ok(())
    }

    /// Write `buffer` into exactly the cells addressed by `coord`.
    ///
    /// # Errors
    ///
    /// * `Error::Mode` if this isn't a write handle.
    /// * `Error::Range` if `coord` addresses no cells or cells outside of the array.
    /// * `Error::ShapeMismatch` if `buffer`'s shape isn't the shape of `coord`'s rectangle.
    ///
    pub async fn write_tile(&self, coord: &TileCoord, buffer: ArrayView2<'_, N>) -> Result<FragmentId> {
        self.check_mode(Mode::Write)?;
        self.check_range(coord)?;

        let shape = coord.rect.shape();
        let actual = [buffer.nrows(), buffer.ncols()];
        if actual != shape {
            return Err(Error::ShapeMismatch {
                expected: shape,
                actual,
            });
        }

        let cells = cell::encode(buffer.iter());
        let id = FragmentId::new(self.sequence.fetch_add(1, Ordering::SeqCst));
        let meta = self
            .resolver
            .write_fragment(&self.uri, id, coord.region(), &self.schema.attribute, cells)
            .await?;
        self.written.fetch_add(1, Ordering::SeqCst);
        debug!(
            uri = %self.uri,
            fragment = %id,
            t = coord.t,
            c = coord.c,
            z = coord.z,
            rect = ?coord.rect.shape(),
            stored = meta.stored_bytes,
            "wrote tile"
        );

        Ok(id)
    }

    /// Read the cells addressed by `coord`.
    ///
    /// Cells that no visible fragment covers hold the fill value. Where fragments overlap, the
    /// most recently written wins.
    ///
    pub async fn read_tile(&self, coord: &TileCoord) -> Result<Array2<N>> {
        self.check_mode(Mode::Read)?;
        self.check_range(coord)?;

        let region = coord.region();
        let cell_size = N::DATA_TYPE.size();
        let mut cells = self.schema.filled(&region);
        for meta in &self.fragments {
            if let Some(window) = meta.region.intersect(&region) {
                let data = self.resolver.fragment_data(&self.uri, meta).await?;
                geom::copy_window(
                    &data.cells,
                    &meta.region,
                    &mut cells,
                    &region,
                    &window,
                    cell_size,
                );
            }
        }

        let shape = coord.rect.shape();
        let cells = cell::decode::<N>(&cells);
        let actual = [cells.len(), 1];
        Array2::from_shape_vec((shape[0], shape[1]), cells).map_err(|_| Error::ShapeMismatch {
            expected: shape,
            actual,
        })
    }
}
