//! Post-write maintenance: merge fragment metadata or fragments, then vacuum what they replace.
//!
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    array::ArrayStore,
    errors::{Error, Result},
    fragment::{self, ConsolidatedMeta, FragmentId, FragmentMeta},
    geom,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationMode {
    /// Gather every fragment's metadata into a single object.
    FragmentMeta,

    /// Merge visible fragments into one fragment covering their bounding region.
    Fragments,
}

impl ConsolidationMode {
    pub fn name(&self) -> &'static str {
        match self {
            ConsolidationMode::FragmentMeta => "fragment_meta",
            ConsolidationMode::Fragments => "fragments",
        }
    }
}

impl fmt::Display for ConsolidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConsolidationMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        match mode {
            "fragment_meta" => Ok(ConsolidationMode::FragmentMeta),
            "fragments" => Ok(ConsolidationMode::Fragments),
            _ => Err(Error::Config(format!("unknown consolidation mode {mode:?}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub enabled: bool,

    /// One of `fragment_meta` or `fragments`, checked by `validate`
    pub mode: String,

    /// Minimum number of fragments worth consolidating
    pub step_min_frags: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ConsolidationMode::FragmentMeta.to_string(),
            step_min_frags: 2,
        }
    }
}

impl ConsolidationConfig {
    pub fn mode(&self) -> Result<ConsolidationMode> {
        self.mode.parse()
    }

    pub fn validate(&self) -> Result<()> {
        self.mode()?;

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub uri: String,
    pub mode: ConsolidationMode,

    /// Nothing was done, because consolidation is disabled or there was nothing to consolidate
    pub skipped: bool,

    /// Visible fragments before consolidating
    pub fragments_before: usize,

    /// Visible fragments after consolidating and vacuuming
    pub fragments_after: usize,

    /// Fragment or consolidated metadata object written, if any
    pub written: Option<FragmentId>,

    /// Objects removed by vacuum
    pub vacuumed: usize,
}

/// Merge the fragments, or the fragment metadata, of the array at `uri`.
///
/// A no-op when consolidation is disabled or there is nothing new to consolidate, so calling it
/// again on an array it has already consolidated changes nothing.
///
pub async fn consolidate(
    store: &ArrayStore,
    uri: &str,
    config: &ConsolidationConfig,
) -> Result<ConsolidationReport> {
    let mode = config.mode()?;
    let all = store.all_fragments(uri).await?;
    let visible = fragment::visible(&all);
    let mut report = ConsolidationReport {
        uri: uri.to_string(),
        mode,
        skipped: true,
        fragments_before: visible.len(),
        fragments_after: visible.len(),
        written: None,
        vacuumed: 0,
    };

    if !config.enabled {
        return Ok(report);
    }

    let minimum = config.step_min_frags.max(1);
    report.written = match mode {
        ConsolidationMode::FragmentMeta => {
            consolidate_fragment_meta(store, uri, &all, minimum).await?
        }
        ConsolidationMode::Fragments => {
            consolidate_fragments(store, uri, &all, &visible, minimum.max(2)).await?
        }
    };
    report.skipped = report.written.is_none();
    report.fragments_after = store.fragments(uri).await?.len();

    Ok(report)
}

async fn consolidate_fragment_meta(
    store: &ArrayStore,
    uri: &str,
    all: &[FragmentMeta],
    minimum: usize,
) -> Result<Option<FragmentId>> {
    if all.len() < minimum {
        return Ok(None);
    }

    let resolver = store.resolver();
    let consolidated = ConsolidatedMeta {
        fragments: all.to_vec(),
    };
    if let Some(newest) = resolver.consolidated_ids(uri).await?.last() {
        if let Some(existing) = resolver.load_consolidated(uri, newest).await? {
            if existing.covers() == consolidated.covers() {
                return Ok(None);
            }
        }
    }

    let first = all.iter().map(|meta| meta.id.first).min().unwrap_or(1);
    let last = store.allocate_sequence(uri).await?;
    let id = FragmentId::spanning(first, last);
    resolver.save_consolidated(uri, &id, &consolidated).await?;
    info!(uri, fragments = all.len(), meta = %id, "consolidated fragment metadata");

    Ok(Some(id))
}

async fn consolidate_fragments(
    store: &ArrayStore,
    uri: &str,
    all: &[FragmentMeta],
    visible: &[FragmentMeta],
    minimum: usize,
) -> Result<Option<FragmentId>> {
    if visible.len() < minimum {
        return Ok(None);
    }

    let schema = store.schema(uri).await?;
    let resolver = store.resolver();
    let cell_size = schema.attribute.dtype.size();

    let mut bounds = visible[0].region;
    for meta in &visible[1..] {
        bounds = bounds.bounding(&meta.region);
    }

    // Layer in read order, same as a read of the bounding region would
    let mut cells = schema.filled(&bounds);
    for meta in visible {
        let data = resolver.fragment_data(uri, meta).await?;
        geom::copy_window(
            &data.cells,
            &meta.region,
            &mut cells,
            &bounds,
            &meta.region,
            cell_size,
        );
    }

    let first = all.iter().map(|meta| meta.id.first).min().unwrap_or(1);
    let last = all.iter().map(|meta| meta.id.last).max().unwrap_or(first);
    let id = FragmentId::spanning(first, last);
    let meta = resolver
        .write_fragment(uri, id, bounds, &schema.attribute, cells)
        .await?;
    info!(
        uri,
        fragments = visible.len(),
        fragment = %id,
        stored = meta.stored_bytes,
        "consolidated fragments"
    );

    Ok(Some(id))
}

/// Remove whatever consolidation has made redundant in the array at `uri`.
///
/// In `fragment_meta` mode that is every consolidated metadata object but the newest. In
/// `fragments` mode it is every superseded fragment. Returns the number of objects removed.
///
pub async fn vacuum(store: &ArrayStore, uri: &str, config: &ConsolidationConfig) -> Result<usize> {
    let mode = config.mode()?;
    if !config.enabled {
        return Ok(0);
    }

    let resolver = store.resolver();
    let mut removed = 0;
    match mode {
        ConsolidationMode::FragmentMeta => {
            let ids = resolver.consolidated_ids(uri).await?;
            for id in ids.iter().rev().skip(1) {
                resolver.remove_consolidated(uri, id).await?;
                removed += 1;
            }
        }
        ConsolidationMode::Fragments => {
            let all = store.all_fragments(uri).await?;
            let visible = fragment::visible(&all);
            for meta in all.iter().filter(|meta| !visible.contains(meta)) {
                resolver.remove_fragment(uri, &meta.id).await?;
                removed += 1;
            }
        }
    }
    if removed > 0 {
        info!(uri, %mode, removed, "vacuumed");
    }

    Ok(removed)
}

/// The consolidation stage run after an array's writes complete: consolidate, then vacuum.
///
pub async fn consolidate_and_vacuum(
    store: &ArrayStore,
    uri: &str,
    config: &ConsolidationConfig,
) -> Result<ConsolidationReport> {
    if !config.enabled {
        warn!(uri, "consolidation disabled, skipping");
    }

    let mut report = consolidate(store, uri, config).await?;
    report.vacuumed = vacuum(store, uri, config).await?;
    report.fragments_after = store.fragments(uri).await?.len();

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::{arr2, Array2};

    use crate::{
        array::Mode,
        geom::{Rect, TileCoord},
        testing,
    };

    fn config(mode: ConsolidationMode) -> ConsolidationConfig {
        ConsolidationConfig {
            enabled: true,
            mode: mode.to_string(),
            step_min_frags: 2,
        }
    }

    /// Write one fragment per channel, each a 2x2 tile offset by its channel, plus one fragment
    /// overwriting part of channel 0.
    async fn populate(store: &ArrayStore) -> Result<String> {
        let uri = store
            .create_array(0, &testing::space([1, 3, 1, 6, 6]), 2, 2)
            .await?;
        let writer = store.open::<u16>(&uri, Mode::Write).await?;
        for c in 0..3 {
            let rect = Rect::new(c, c + 2, c, c + 2);
            let data = Array2::from_elem((2, 2), c as u16 + 1);
            writer
                .write_tile(&TileCoord::new(0, c, 0, rect), data.view())
                .await?;
        }
        writer
            .write_tile(
                &TileCoord::new(0, 0, 0, Rect::new(1, 2, 0, 3)),
                arr2(&[[9, 9, 9]]).view(),
            )
            .await?;

        Ok(uri)
    }

    async fn read_corner(store: &ArrayStore, uri: &str) -> Result<Array2<u16>> {
        let reader = store.open::<u16>(uri, Mode::Read).await?;
        reader
            .read_tile(&TileCoord::new(0, 0, 0, Rect::new(0, 2, 0, 2)))
            .await
    }

    async fn read_all(store: &ArrayStore, uri: &str) -> Result<Vec<Array2<u16>>> {
        let reader = store.open::<u16>(uri, Mode::Read).await?;
        let mut planes = vec![];
        for c in 0..3 {
            let coord = TileCoord::new(0, c, 0, Rect::new(0, 6, 0, 6));
            planes.push(reader.read_tile(&coord).await?);
        }

        Ok(planes)
    }

    #[test]
    fn test_mode_from_str() -> Result<()> {
        assert_eq!(
            "fragment_meta".parse::<ConsolidationMode>()?,
            ConsolidationMode::FragmentMeta
        );
        assert_eq!(
            "fragments".parse::<ConsolidationMode>()?,
            ConsolidationMode::Fragments
        );
        assert!(matches!(
            "commits".parse::<ConsolidationMode>(),
            Err(Error::Config(_))
        ));
        assert_eq!(ConsolidationMode::Fragments.to_string(), "fragments");

        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_mode() -> Result<()> {
        let store = testing::store();
        let uri = populate(&store).await?;
        let config = ConsolidationConfig {
            mode: String::from("everything"),
            ..ConsolidationConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(matches!(
            consolidate(&store, &uri, &config).await,
            Err(Error::Config(_))
        ));
        assert!(matches!(
            vacuum(&store, &uri, &config).await,
            Err(Error::Config(_))
        ));
        assert_eq!(store.all_fragments(&uri).await?.len(), 4);

        Ok(())
    }

    #[tokio::test]
    async fn test_fragment_meta() -> Result<()> {
        testing::init_logging();
        let store = testing::store();
        let uri = populate(&store).await?;
        let before = read_all(&store, &uri).await?;

        let config = config(ConsolidationMode::FragmentMeta);
        let report = consolidate_and_vacuum(&store, &uri, &config).await?;
        assert!(!report.skipped);
        assert_eq!(report.fragments_before, 4);
        assert_eq!(report.fragments_after, 4);
        assert_eq!(report.vacuumed, 0);

        let ids = store.consolidated_meta(&uri).await?;
        assert_eq!(ids, vec![report.written.unwrap()]);
        assert_eq!(read_all(&store, &uri).await?, before);

        // Idempotent
        let again = consolidate_and_vacuum(&store, &uri, &config).await?;
        assert!(again.skipped);
        assert_eq!(store.consolidated_meta(&uri).await?, ids);

        Ok(())
    }

    #[tokio::test]
    async fn test_fragment_meta_vacuum() -> Result<()> {
        let store = testing::store();
        let uri = populate(&store).await?;
        let config = config(ConsolidationMode::FragmentMeta);
        let first = consolidate(&store, &uri, &config).await?;

        // New writes make the first consolidation stale
        let writer = store.open::<u16>(&uri, Mode::Write).await?;
        writer
            .write_tile(
                &TileCoord::new(0, 2, 0, Rect::new(5, 6, 5, 6)),
                arr2(&[[4]]).view(),
            )
            .await?;
        drop(writer);

        let second = consolidate(&store, &uri, &config).await?;
        assert!(!second.skipped);
        assert!(first.written.unwrap() < second.written.unwrap());
        assert_eq!(store.consolidated_meta(&uri).await?.len(), 2);

        assert_eq!(vacuum(&store, &uri, &config).await?, 1);
        assert_eq!(
            store.consolidated_meta(&uri).await?,
            vec![second.written.unwrap()]
        );
        assert_eq!(store.fragments(&uri).await?.len(), 5);

        Ok(())
    }

    #[tokio::test]
    async fn test_fragments() -> Result<()> {
        let store = testing::store();
        let uri = populate(&store).await?;
        let before = read_all(&store, &uri).await?;

        let config = config(ConsolidationMode::Fragments);
        let report = consolidate_and_vacuum(&store, &uri, &config).await?;
        assert!(!report.skipped);
        assert_eq!(report.fragments_before, 4);
        assert_eq!(report.fragments_after, 1);
        assert_eq!(report.vacuumed, 4);

        let all = store.all_fragments(&uri).await?;
        assert_eq!(all.len(), 1);
        assert_eq!((all[0].id.first, all[0].id.last), (1, 4));
        assert_eq!(read_all(&store, &uri).await?, before);
        assert_eq!(before[0][[1, 1]], 9);

        // Idempotent
        let again = consolidate_and_vacuum(&store, &uri, &config).await?;
        assert!(again.skipped);
        assert_eq!(store.all_fragments(&uri).await?, all);

        // Writes after consolidating still win
        let writer = store.open::<u16>(&uri, Mode::Write).await?;
        writer
            .write_tile(
                &TileCoord::new(0, 0, 0, Rect::new(1, 2, 1, 2)),
                arr2(&[[5]]).view(),
            )
            .await?;
        drop(writer);
        assert_eq!(read_all(&store, &uri).await?[0][[1, 1]], 5);

        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_and_too_few() -> Result<()> {
        let store = testing::store();
        let uri = populate(&store).await?;

        let mut config = config(ConsolidationMode::Fragments);
        config.enabled = false;
        let report = consolidate_and_vacuum(&store, &uri, &config).await?;
        assert!(report.skipped);
        assert_eq!(report.fragments_after, 4);
        assert_eq!(store.all_fragments(&uri).await?.len(), 4);

        config.enabled = true;
        config.step_min_frags = 5;
        let report = consolidate_and_vacuum(&store, &uri, &config).await?;
        assert!(report.skipped);
        assert_eq!(store.all_fragments(&uri).await?.len(), 4);

        config.mode = ConsolidationMode::FragmentMeta.to_string();
        let report = consolidate_and_vacuum(&store, &uri, &config).await?;
        assert!(report.skipped);
        assert!(store.consolidated_meta(&uri).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_interleaved_writers() -> Result<()> {
        let store = testing::store();
        let uri = store
            .create_array(0, &testing::space([1, 1, 1, 4, 4]), 2, 2)
            .await?;

        let first = store.open::<u16>(&uri, Mode::Write).await?;
        let second = store.open::<u16>(&uri, Mode::Write).await?;
        for (writer, value) in [(&first, 1), (&second, 2), (&first, 3), (&second, 4)] {
            writer
                .write_tile(
                    &TileCoord::new(0, 0, 0, Rect::new(0, 2, 0, 2)),
                    Array2::from_elem((2, 2), value).view(),
                )
                .await?;
        }
        drop(first);
        drop(second);

        let all = store.all_fragments(&uri).await?;
        let mut sequences: Vec<u64> = all.iter().map(|meta| meta.id.last).collect();
        sequences.sort();
        assert_eq!(sequences, vec![1, 2, 3, 4]);

        let config = config(ConsolidationMode::Fragments);
        let report = consolidate_and_vacuum(&store, &uri, &config).await?;
        assert!(!report.skipped);
        assert_eq!(report.fragments_after, 1);

        for _ in 0..2 {
            let again = consolidate_and_vacuum(&store, &uri, &config).await?;
            assert!(again.skipped);
            assert_eq!(again.fragments_after, 1);
        }
        assert_eq!(read_corner(&store, &uri).await?, Array2::from_elem((2, 2), 4));

        Ok(())
    }
}
