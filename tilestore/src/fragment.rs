//! Fragments: the immutable record left behind by every write.
//!
use std::{cmp::Ordering, fmt, io};

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::{
    cell::DataType,
    errors::Result,
    extio::{ExtendedAsyncRead, ExtendedAsyncWrite},
    geom::Region,
    node::{self, Node},
    schema::Filter,
};

/// Identifies a fragment within an array.
///
/// A plain write covers a single sequence number, `first == last`. A consolidated fragment covers
/// the sequence range of the fragments it replaced. Ids order by `(last, first)`, which is the
/// order fragments are layered when reading, so later writes win. Of two ids with the same
/// `last`, the one with the wider range comes first.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FragmentId {
    pub first: u64,
    pub last: u64,
    pub uuid: Uuid,
}

impl FragmentId {
    pub fn new(sequence: u64) -> Self {
        Self::spanning(sequence, sequence)
    }

    pub fn spanning(first: u64, last: u64) -> Self {
        Self {
            first,
            last,
            uuid: Uuid::new_v4(),
        }
    }

    /// The name this fragment is stored under, `__<first>_<last>_<uuid>`.
    ///
    pub fn name(&self) -> String {
        format!("__{}_{}_{}", self.first, self.last, self.uuid.simple())
    }

    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.strip_prefix("__")?.splitn(3, '_');
        let first = parts.next()?.parse().ok()?;
        let last = parts.next()?.parse().ok()?;
        let uuid = Uuid::parse_str(parts.next()?).ok()?;
        if first > last {
            return None;
        }

        Some(Self { first, last, uuid })
    }

    /// Whether this fragment's sequence range strictly contains `other`'s.
    ///
    pub fn supersedes(&self, other: &FragmentId) -> bool {
        self.first <= other.first
            && other.last <= self.last
            && (self.first, self.last) != (other.first, other.last)
    }
}

impl Ord for FragmentId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.last, self.first, self.uuid).cmp(&(other.last, other.first, other.uuid))
    }
}

impl PartialOrd for FragmentId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Metadata describing a single fragment.
///
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentMeta {
    pub id: FragmentId,

    /// The cells covered by this fragment. Data is stored in C order over this region.
    pub region: Region,

    pub dtype: DataType,
    pub filter: Filter,

    /// Size of the data object after filtering
    pub stored_bytes: u64,

    /// Size of the cell data before filtering
    pub raw_bytes: u64,
}

impl FragmentMeta {
    pub fn cells(&self) -> usize {
        self.region.cells()
    }
}

/// Keep only fragments that no other fragment in `fragments` supersedes.
///
pub(crate) fn visible(fragments: &[FragmentMeta]) -> Vec<FragmentMeta> {
    fragments
        .iter()
        .filter(|fragment| {
            !fragments
                .iter()
                .any(|other| other.id.supersedes(&fragment.id))
        })
        .cloned()
        .collect()
}

fn invalid(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

#[async_trait]
impl Node for FragmentMeta {
    const NODE_TYPE: u8 = node::NODE_FRAGMENT_META;

    async fn save_to(&self, stream: &mut (impl AsyncWrite + Unpin + Send)) -> Result<()> {
        stream.write_bytes(self.id.uuid.as_bytes()).await?;
        stream.write_u64(self.id.first).await?;
        stream.write_u64(self.id.last).await?;
        for bound in self.region.start.iter().chain(self.region.end.iter()) {
            stream.write_varint(*bound as u64).await?;
        }
        stream.write_byte(self.dtype.code()).await?;
        stream.write_byte(self.filter.code()).await?;
        let level = match self.filter {
            Filter::None => 0,
            Filter::Zstd { level } => level,
        };
        stream.write_u32(level as u32).await?;
        stream.write_varint(self.stored_bytes).await?;
        stream.write_varint(self.raw_bytes).await?;

        Ok(())
    }

    async fn load_from(stream: &mut (impl AsyncRead + Unpin + Send)) -> Result<Self> {
        let uuid = Uuid::from_slice(&stream.read_bytes().await?)
            .map_err(|err| invalid(err.to_string()))?;
        let first = stream.read_u64().await?;
        let last = stream.read_u64().await?;

        let mut bounds = [0; 10];
        for bound in bounds.iter_mut() {
            *bound = stream.read_varint().await? as usize;
        }
        let mut start = [0; 5];
        let mut end = [0; 5];
        start.copy_from_slice(&bounds[..5]);
        end.copy_from_slice(&bounds[5..]);

        let code = stream.read_byte().await?;
        let dtype = DataType::from_code(code)
            .ok_or_else(|| invalid(format!("unknown data type {code}")))?;

        let code = stream.read_byte().await?;
        let level = stream.read_u32().await? as i32;
        let filter = match code {
            0 => Filter::None,
            1 => Filter::Zstd { level },
            _ => return Err(invalid(format!("unknown filter {code}")).into()),
        };

        let stored_bytes = stream.read_varint().await?;
        let raw_bytes = stream.read_varint().await?;

        Ok(Self {
            id: FragmentId { first, last, uuid },
            region: Region::new(start, end),
            dtype,
            filter,
            stored_bytes,
            raw_bytes,
        })
    }
}

/// The metadata of many fragments gathered into a single object, so that opening an array
/// doesn't need to load one metadata object per fragment.
///
#[derive(Clone, Debug, PartialEq)]
pub struct ConsolidatedMeta {
    pub fragments: Vec<FragmentMeta>,
}

impl ConsolidatedMeta {
    pub fn covers(&self) -> Vec<FragmentId> {
        let mut ids: Vec<FragmentId> = self.fragments.iter().map(|meta| meta.id).collect();
        ids.sort();

        ids
    }
}

#[async_trait]
impl Node for ConsolidatedMeta {
    const NODE_TYPE: u8 = node::NODE_CONSOLIDATED_META;

    async fn save_to(&self, stream: &mut (impl AsyncWrite + Unpin + Send)) -> Result<()> {
        stream.write_varint(self.fragments.len() as u64).await?;
        for meta in &self.fragments {
            meta.save_to(&mut *stream).await?;
        }

        Ok(())
    }

    async fn load_from(stream: &mut (impl AsyncRead + Unpin + Send)) -> Result<Self> {
        let count = stream.read_varint().await? as usize;
        let mut fragments = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            fragments.push(FragmentMeta::load_from(&mut *stream).await?);
        }

        Ok(Self { fragments })
    }
}
