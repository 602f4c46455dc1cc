use std::{io, sync::Arc};

use futures::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    FutureExt,
};

use crate::{
    cache::{Cache, Cacheable},
    errors::{Error, Result},
    extio::{ExtendedAsyncRead, ExtendedAsyncWrite},
    fragment::{ConsolidatedMeta, FragmentId, FragmentMeta},
    geom::Region,
    mapper::{self, Mapper},
    node::{self, Node},
    schema::{ArraySchema, Attribute},
};

const MAGIC_NUMBER: u16 = 0x7153;
const FORMAT_VERSION: u32 = 0;

const SCHEMA: &str = "__schema.json";
const FRAGMENTS: &str = "__fragments";
const FRAGMENT_META: &str = "__fragment_meta";
const META: &str = "__meta";
const DATA: &str = "data";
const META_SUFFIX: &str = ".meta";

/// The `Resolver` manages storage and retrieval of array objects from a data store.
///
/// To store and load objects, a Resolver must be provided with a concrete `Mapper` implementation.
/// Decoded fragment data is kept in RAM in an LRU cache up to a specified size limit, for fast
/// re-retrieval of recently read fragments.
///
pub struct Resolver {
    mapper: Box<dyn Mapper>,
    cache: Cache<FragmentId, FragmentData>,
}

/// The unfiltered cells of a fragment, in C order over the fragment's region.
///
pub(crate) struct FragmentData {
    pub cells: Vec<u8>,
}

impl Cacheable for FragmentData {
    fn size(&self) -> u64 {
        self.cells.len() as u64
    }
}

impl Resolver {
    pub(crate) const HEADER_SIZE: u64 = 2 + 4 + 1;

    /// Create a new `Resolver`
    ///
    /// # Arguments
    ///
    /// * `mapper` - A boxed implementation of `Mapper`, which handles writing to and reading from
    ///   the underlying data store.
    /// * `cache_bytes` - The size limit, in bytes, for the LRU cache used by the resolver to hold
    ///   recently read fragment data in RAM.
    ///
    pub fn new(mapper: Box<dyn Mapper>, cache_bytes: u64) -> Self {
        let cache = Cache::new(cache_bytes);
        Self { mapper, cache }
    }

    /// Persist the schema of the array at `uri`.
    ///
    pub async fn save_schema(&self, uri: &str, schema: &ArraySchema) -> Result<()> {
        let mut stream = self.mapper.store(&mapper::join(&[uri, SCHEMA])).await?;
        stream.write_all(&schema.to_json()?).await?;
        stream.finish().await?;

        Ok(())
    }

    /// Load the schema of the array at `uri`, or `None` if there is no array there.
    ///
    pub async fn load_schema(&self, uri: &str) -> Result<Option<ArraySchema>> {
        let path = mapper::join(&[uri, SCHEMA]);
        match self.mapper.load(&path).await? {
            None => Ok(None),
            Some(mut stream) => {
                let mut json = vec![];
                stream.read_to_end(&mut json).await?;
                let schema = ArraySchema::from_json(&json).map_err(|err| match err {
                    Error::Json(err) => Error::Format {
                        path,
                        reason: err.to_string(),
                    },
                    err => err,
                })?;

                Ok(Some(schema))
            }
        }
    }

    /// Store a node
    ///
    pub(crate) async fn save<O>(&self, path: &str, node: &O) -> Result<()>
    where
        O: Node + Sync,
    {
        let mut stream = self.mapper.store(path).await?;
        stream.write_u16(MAGIC_NUMBER).await?;
        stream.write_u32(FORMAT_VERSION).await?;
        stream.write_byte(O::NODE_TYPE).await?;

        node.save_to(&mut stream).await?;
        stream.finish().await?;

        Ok(())
    }

    /// Load a node, or `None` if nothing is stored at `path`.
    ///
    pub(crate) async fn load<O>(&self, path: &str) -> Result<Option<O>>
    where
        O: Node,
    {
        match self.mapper.load(path).await? {
            None => Ok(None),
            Some(mut stream) => {
                let node_type = self.read_header(path, &mut stream).await?;
                if node_type != O::NODE_TYPE {
                    return Err(Error::Format {
                        path: path.to_string(),
                        reason: format!(
                            "expected node type {}, found {node_type}",
                            O::NODE_TYPE
                        ),
                    });
                }

                let node = O::load_from(&mut stream).await.map_err(|err| match err {
                    Error::IO(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
                        ) =>
                    {
                        Error::Format {
                            path: path.to_string(),
                            reason: err.to_string(),
                        }
                    }
                    err => err,
                })?;

                Ok(Some(node))
            }
        }
    }

    async fn read_header(
        &self,
        path: &str,
        stream: &mut (impl AsyncRead + Unpin + Send),
    ) -> Result<u8> {
        let format_error = |reason: &str| Error::Format {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let magic_number = stream
            .read_u16()
            .await
            .map_err(|_| format_error("missing header"))?;
        if magic_number != MAGIC_NUMBER {
            return Err(format_error("not a tilestore object"));
        }

        let version = stream
            .read_u32()
            .await
            .map_err(|_| format_error("missing header"))?;
        if version != FORMAT_VERSION {
            return Err(format_error("unrecognized format version"));
        }

        stream
            .read_byte()
            .await
            .map_err(|_| format_error("missing header"))
    }

    /// Store the cells of a new fragment and publish it.
    ///
    /// Data is stored before metadata. A fragment without metadata is never listed, so a fragment
    /// becomes visible all at once when its metadata is finished.
    ///
    pub(crate) async fn write_fragment(
        &self,
        uri: &str,
        id: FragmentId,
        region: Region,
        attribute: &Attribute,
        cells: Vec<u8>,
    ) -> Result<FragmentMeta> {
        let name = id.name();
        let encoded = attribute.filter.encode(&cells)?;

        let mut stream = self.mapper.store(&mapper::join(&[uri, FRAGMENTS, &name, DATA])).await?;
        stream.write_all(&encoded).await?;
        stream.finish().await?;

        let meta = FragmentMeta {
            id,
            region,
            dtype: attribute.dtype,
            filter: attribute.filter,
            stored_bytes: encoded.len() as u64,
            raw_bytes: cells.len() as u64,
        };
        self.save(&mapper::join(&[uri, FRAGMENTS, &name, META]), &meta)
            .await?;

        Ok(meta)
    }

    /// Get the unfiltered cells of a fragment, from the cache if possible.
    ///
    pub(crate) async fn fragment_data(
        self: &Arc<Resolver>,
        uri: &str,
        meta: &FragmentMeta,
    ) -> Result<Arc<FragmentData>> {
        let resolver = Arc::clone(self);
        let uri = uri.to_string();
        let owned = meta.clone();
        let load =
            |_: FragmentId| async move { resolver.retrieve_data(&uri, &owned).await }.boxed();

        self.cache.get(&meta.id, load).await
    }

    async fn retrieve_data(&self, uri: &str, meta: &FragmentMeta) -> Result<FragmentData> {
        let path = mapper::join(&[uri, FRAGMENTS, &meta.id.name(), DATA]);
        let mut stream = self
            .mapper
            .load(&path)
            .await?
            .ok_or_else(|| Error::NotFound(path.clone()))?;
        let mut encoded = vec![];
        stream.read_to_end(&mut encoded).await?;

        let cells = meta.filter.decode(&encoded).map_err(|err| Error::Format {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        let expected = meta.cells() * meta.dtype.size();
        if cells.len() != expected || cells.len() as u64 != meta.raw_bytes {
            return Err(Error::Format {
                path,
                reason: format!("expected {expected} bytes of cells, found {}", cells.len()),
            });
        }

        Ok(FragmentData { cells })
    }

    /// Every published fragment of the array at `uri`, superseded or not, in read order.
    ///
    /// Metadata comes from the newest consolidated metadata object where possible, falling back
    /// to each fragment's own metadata object.
    ///
    pub(crate) async fn fragments(&self, uri: &str) -> Result<Vec<FragmentMeta>> {
        let consolidated = match self.consolidated_ids(uri).await?.last() {
            Some(id) => self.load_consolidated(uri, id).await?,
            None => None,
        };
        let consolidated = consolidated.map(|meta| meta.fragments).unwrap_or_default();

        let mut fragments = vec![];
        for name in self.mapper.list(&mapper::join(&[uri, FRAGMENTS])).await? {
            let id = match FragmentId::parse(&name) {
                Some(id) => id,
                None => continue,
            };
            match consolidated.iter().find(|meta| meta.id == id) {
                Some(meta) => fragments.push(meta.clone()),
                None => {
                    let path = mapper::join(&[uri, FRAGMENTS, &name, META]);

                    // No metadata yet means the fragment is still being written
                    if let Some(meta) = self.load::<FragmentMeta>(&path).await? {
                        fragments.push(meta);
                    }
                }
            }
        }
        fragments.sort_by_key(|meta| meta.id);

        Ok(fragments)
    }

    pub(crate) async fn remove_fragment(&self, uri: &str, id: &FragmentId) -> Result<()> {
        // Unpublish before removing data
        let dir = mapper::join(&[uri, FRAGMENTS, &id.name()]);
        self.mapper.remove(&mapper::join(&[&dir, META])).await?;
        self.mapper.remove(&dir).await?;

        Ok(())
    }

    /// Ids of the consolidated metadata objects of the array at `uri`, oldest first.
    ///
    pub(crate) async fn consolidated_ids(&self, uri: &str) -> Result<Vec<FragmentId>> {
        let mut ids: Vec<FragmentId> = self
            .mapper
            .list(&mapper::join(&[uri, FRAGMENT_META]))
            .await?
            .iter()
            .filter_map(|name| name.strip_suffix(META_SUFFIX))
            .filter_map(FragmentId::parse)
            .collect();
        ids.sort();

        Ok(ids)
    }

    pub(crate) async fn load_consolidated(
        &self,
        uri: &str,
        id: &FragmentId,
    ) -> Result<Option<ConsolidatedMeta>> {
        self.load(&Self::consolidated_path(uri, id)).await
    }

    pub(crate) async fn save_consolidated(
        &self,
        uri: &str,
        id: &FragmentId,
        meta: &ConsolidatedMeta,
    ) -> Result<()> {
        self.save(&Self::consolidated_path(uri, id), meta).await
    }

    pub(crate) async fn remove_consolidated(&self, uri: &str, id: &FragmentId) -> Result<()> {
        self.mapper
            .remove(&Self::consolidated_path(uri, id))
            .await?;

        Ok(())
    }

    fn consolidated_path(uri: &str, id: &FragmentId) -> String {
        mapper::join(&[uri, FRAGMENT_META, &format!("{}{META_SUFFIX}", id.name())])
    }

    /// Remove everything stored for the array at `uri`.
    ///
    pub async fn remove_array(&self, uri: &str) -> Result<()> {
        self.mapper.remove(uri).await?;

        Ok(())
    }

    /// List the objects stored for the array at `uri`, with their sizes.
    ///
    pub async fn ls(&self, uri: &str) -> Result<Vec<LsEntry>> {
        let mut ls = vec![];
        let path = mapper::join(&[uri, SCHEMA]);
        if let Some(size) = self.mapper.size_of(&path).await? {
            ls.push(LsEntry {
                name: path,
                node_type: Some("Schema"),
                size: Some(size),
            });
        }

        for id in self.consolidated_ids(uri).await? {
            let path = Self::consolidated_path(uri, &id);
            let node_type = self.node_type_of(&path).await?;
            let size = self.mapper.size_of(&path).await?;
            ls.push(LsEntry {
                name: path,
                node_type,
                size,
            });
        }

        let mut names = self.mapper.list(&mapper::join(&[uri, FRAGMENTS])).await?;
        names.sort();
        for name in names {
            for object in [META, DATA] {
                let path = mapper::join(&[uri, FRAGMENTS, &name, object]);
                let size = self.mapper.size_of(&path).await?;
                if size.is_none() {
                    continue;
                }
                let node_type = if object == META {
                    self.node_type_of(&path).await?
                } else {
                    Some("FragmentData")
                };
                ls.push(LsEntry {
                    name: path,
                    node_type,
                    size,
                });
            }
        }

        Ok(ls)
    }

    async fn node_type_of(&self, path: &str) -> Result<Option<&'static str>> {
        match self.mapper.load(path).await? {
            None => Ok(None),
            Some(mut stream) => {
                let code = self.read_header(path, &mut stream).await?;
                node::node_type_name(code).map(Some).ok_or_else(|| Error::Format {
                    path: path.to_string(),
                    reason: format!("unrecognized node type: {code}"),
                })
            }
        }
    }
}

pub struct LsEntry {
    pub name: String,
    pub node_type: Option<&'static str>,
    pub size: Option<u64>,
}

impl LsEntry {
    /// Size of the object, less the resolver's header for framed objects.
    ///
    pub fn payload_size(&self) -> Option<u64> {
        match (self.node_type, self.size) {
            (Some("FragmentMeta" | "ConsolidatedMeta"), Some(size)) => {
                Some(size.saturating_sub(Resolver::HEADER_SIZE))
            }
            (_, size) => size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{cell::DataType, schema::Filter, testing};

    fn attribute() -> Attribute {
        Attribute {
            name: String::from("intensity"),
            dtype: DataType::U16,
            fill: 0.0,
            filter: Filter::Zstd { level: 3 },
        }
    }

    fn region() -> Region {
        Region::new([0, 0, 0, 0, 0], [1, 1, 1, 4, 8])
    }

    fn cells() -> Vec<u8> {
        (0..64).collect()
    }

    #[tokio::test]
    async fn test_schema() -> Result<()> {
        let resolver = testing::resolver();
        assert_eq!(resolver.load_schema("0").await?, None);

        let schema = ArraySchema::new([1, 2, 1, 8, 8], [1, 1, 1, 4, 8], attribute())?;
        resolver.save_schema("0", &schema).await?;
        assert_eq!(resolver.load_schema("0").await?, Some(schema));
        assert_eq!(resolver.load_schema("1").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_write_and_read_fragment() -> Result<()> {
        let resolver = testing::resolver();
        let id = FragmentId::new(1);
        let meta = resolver
            .write_fragment("0", id, region(), &attribute(), cells())
            .await?;
        assert_eq!(meta.raw_bytes, 64);
        assert_eq!(meta.dtype, DataType::U16);

        let fragments = resolver.fragments("0").await?;
        assert_eq!(fragments, vec![meta.clone()]);

        let data = resolver.fragment_data("0", &meta).await?;
        assert_eq!(data.cells, cells());

        Ok(())
    }

    #[tokio::test]
    async fn test_fragments_in_read_order() -> Result<()> {
        let resolver = testing::resolver();
        for id in [
            FragmentId::new(3),
            FragmentId::new(1),
            FragmentId::spanning(1, 2),
            FragmentId::new(2),
        ] {
            resolver
                .write_fragment("0", id, region(), &attribute(), cells())
                .await?;
        }

        let order: Vec<(u64, u64)> = resolver
            .fragments("0")
            .await?
            .iter()
            .map(|meta| (meta.id.first, meta.id.last))
            .collect();
        assert_eq!(order, vec![(1, 1), (1, 2), (2, 2), (3, 3)]);

        Ok(())
    }

    #[tokio::test]
    async fn test_unpublished_fragment_is_invisible() -> Result<()> {
        let mapper = testing::MemoryMapper::new();
        let id = FragmentId::new(1);
        let path = mapper::join(&["0", FRAGMENTS, &id.name(), DATA]);
        let mut stream = mapper.store(&path).await?;
        stream.write_all(&cells()).await?;
        stream.finish().await?;

        let resolver = Resolver::new(Box::new(mapper), 0);
        assert!(resolver.fragments("0").await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_consolidated_metadata_is_used() -> Result<()> {
        let resolver = testing::resolver();
        let mut metas = vec![];
        for sequence in 1..=3 {
            let meta = resolver
                .write_fragment("0", FragmentId::new(sequence), region(), &attribute(), cells())
                .await?;
            metas.push(meta);
        }

        let id = FragmentId::spanning(1, 4);
        let consolidated = ConsolidatedMeta {
            fragments: metas.clone(),
        };
        resolver.save_consolidated("0", &id, &consolidated).await?;
        assert_eq!(resolver.consolidated_ids("0").await?, vec![id]);
        assert_eq!(
            resolver.load_consolidated("0", &id).await?,
            Some(consolidated)
        );

        // Individual metadata no longer needed
        for meta in &metas {
            let path = mapper::join(&["0", FRAGMENTS, &meta.id.name(), META]);
            resolver.mapper.remove(&path).await?;
        }
        assert_eq!(resolver.fragments("0").await?, metas);

        resolver.remove_consolidated("0", &id).await?;
        assert!(resolver.consolidated_ids("0").await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_remove_fragment() -> Result<()> {
        let resolver = testing::resolver();
        let keep = resolver
            .write_fragment("0", FragmentId::new(1), region(), &attribute(), cells())
            .await?;
        let gone = resolver
            .write_fragment("0", FragmentId::new(2), region(), &attribute(), cells())
            .await?;

        resolver.remove_fragment("0", &gone.id).await?;
        assert_eq!(resolver.fragments("0").await?, vec![keep]);

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_data() -> Result<()> {
        let resolver = testing::resolver();
        let meta = resolver
            .write_fragment("0", FragmentId::new(1), region(), &attribute(), cells())
            .await?;
        let path = mapper::join(&["0", FRAGMENTS, &meta.id.name(), DATA]);
        resolver.mapper.remove(&path).await?;

        let result = resolver.fragment_data("0", &meta).await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        Ok(())
    }

    #[tokio::test]
    async fn test_bad_header() -> Result<()> {
        let mapper = testing::MemoryMapper::new();
        let mut stream = mapper.store("0/__fragments/x/__meta").await?;
        stream.write_all(b"garbage!").await?;
        stream.finish().await?;

        let resolver = Resolver::new(Box::new(mapper), 0);
        let result = resolver
            .load::<FragmentMeta>("0/__fragments/x/__meta")
            .await;
        assert!(matches!(result, Err(Error::Format { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn test_ls() -> Result<()> {
        let resolver = testing::resolver();
        let schema = ArraySchema::new([1, 1, 1, 4, 8], [1, 1, 1, 4, 8], attribute())?;
        resolver.save_schema("0", &schema).await?;
        let meta = resolver
            .write_fragment("0", FragmentId::new(1), region(), &attribute(), cells())
            .await?;

        let ls = resolver.ls("0").await?;
        let types: Vec<Option<&str>> = ls.iter().map(|entry| entry.node_type).collect();
        assert_eq!(
            types,
            vec![Some("Schema"), Some("FragmentMeta"), Some("FragmentData")]
        );
        assert_eq!(ls[2].size, Some(meta.stored_bytes));
        assert_eq!(
            ls[1].payload_size(),
            ls[1].size.map(|size| size - Resolver::HEADER_SIZE)
        );

        Ok(())
    }
}
