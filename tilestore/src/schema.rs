use std::io;

use serde::{Deserialize, Serialize};

use crate::{
    cell::DataType,
    errors::{Error, Result},
    geom::{self, Region},
};

/// The layout of a dense 5 dimensional array: dimension domains, tile extents, and the single
/// attribute stored in each cell.
///
/// Schemas are immutable once an array is created.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArraySchema {
    pub dimensions: Vec<Dimension>,
    pub attribute: Attribute,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,

    /// Number of cells along this dimension. The domain is `[0, extent)`.
    pub extent: usize,

    /// Number of cells along this dimension in a single space tile.
    pub tile: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub dtype: DataType,

    /// Value read back for cells that have never been written
    pub fill: f64,

    pub filter: Filter,
}

/// Lossless filter applied to fragment data before it is stored.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Filter {
    None,
    Zstd { level: i32 },
}

impl Filter {
    pub(crate) fn code(&self) -> u8 {
        match self {
            Filter::None => 0,
            Filter::Zstd { .. } => 1,
        }
    }

    pub(crate) fn encode(&self, bytes: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Filter::None => Ok(bytes.to_vec()),
            Filter::Zstd { level } => zstd::encode_all(bytes, *level),
        }
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Filter::None => Ok(bytes.to_vec()),
            Filter::Zstd { .. } => zstd::decode_all(bytes),
        }
    }
}

/// The extents of a level's `(t, c, z, y, x)` space and the attribute its array stores.
///
/// Tile extents aren't part of the space. They're chosen when an array is created, clamped to the
/// plane so that a level smaller than a tile still gets a valid schema.
///
#[derive(Clone, Debug, PartialEq)]
pub struct LogicalSpace {
    pub extents: [usize; 5],
    pub attribute: Attribute,
}

impl LogicalSpace {
    pub fn new(extents: [usize; 5], attribute: Attribute) -> Self {
        Self { extents, attribute }
    }

    /// The space of the next pyramid level: y and x halved, rounding down.
    ///
    pub fn halved(&self) -> Self {
        let mut extents = self.extents;
        extents[geom::Y] /= 2;
        extents[geom::X] /= 2;

        Self {
            extents,
            attribute: self.attribute.clone(),
        }
    }

    /// A schema for this space with single slice tiles of `tile_y` by `tile_x` cells.
    ///
    /// Tile extents larger than the plane are clamped to it.
    ///
    pub fn schema(&self, tile_y: usize, tile_x: usize) -> Result<ArraySchema> {
        let tiles = [
            1,
            1,
            1,
            tile_y.min(self.extents[geom::Y]),
            tile_x.min(self.extents[geom::X]),
        ];

        ArraySchema::new(self.extents, tiles, self.attribute.clone())
    }
}

impl ArraySchema {
    /// Define a schema over `(t, c, z, y, x)` with the given extents and tile extents.
    ///
    /// # Errors
    ///
    /// `Error::Schema` if any extent or tile extent is zero, a tile extent is larger than its
    /// dimension, the fill value can't be represented by `dtype`, or the filter is invalid.
    ///
    pub fn new(
        extents: [usize; 5],
        tiles: [usize; 5],
        attribute: Attribute,
    ) -> Result<Self> {
        let dimensions = (0..5)
            .map(|i| Dimension {
                name: geom::DIMENSION_NAMES[i].to_string(),
                extent: extents[i],
                tile: tiles[i],
            })
            .collect();
        let schema = Self {
            dimensions,
            attribute,
        };
        schema.validate()?;

        Ok(schema)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions.len() != 5 {
            return Err(Error::Schema(format!(
                "expected 5 dimensions, got {}",
                self.dimensions.len()
            )));
        }

        for dimension in &self.dimensions {
            if dimension.extent == 0 {
                return Err(Error::Schema(format!(
                    "dimension {} has zero extent",
                    dimension.name
                )));
            }
            if dimension.tile == 0 {
                return Err(Error::Schema(format!(
                    "dimension {} has zero tile extent",
                    dimension.name
                )));
            }
            if dimension.tile > dimension.extent {
                return Err(Error::Schema(format!(
                    "dimension {} has tile extent {} larger than its extent {}",
                    dimension.name, dimension.tile, dimension.extent
                )));
            }
        }

        let attribute = &self.attribute;
        if !attribute.fill.is_finite() {
            return Err(Error::Schema(format!(
                "fill value {} for {} is not finite",
                attribute.fill, attribute.name
            )));
        }
        if attribute.dtype.encode(attribute.fill).is_none() {
            return Err(Error::Schema(format!(
                "fill value {} can't be stored as {}",
                attribute.fill, attribute.dtype
            )));
        }
        if let Filter::Zstd { level } = attribute.filter {
            if !zstd::compression_level_range().contains(&level) {
                return Err(Error::Schema(format!("invalid zstd level {level}")));
            }
        }

        Ok(())
    }

    pub fn extents(&self) -> [usize; 5] {
        let mut extents = [0; 5];
        for (i, dimension) in self.dimensions.iter().enumerate().take(5) {
            extents[i] = dimension.extent;
        }

        extents
    }

    pub fn tiles(&self) -> [usize; 5] {
        let mut tiles = [0; 5];
        for (i, dimension) in self.dimensions.iter().enumerate().take(5) {
            tiles[i] = dimension.tile;
        }

        tiles
    }

    /// The region covering every cell in the array.
    ///
    pub fn domain(&self) -> Region {
        Region::from_shape(self.extents())
    }

    /// The fill value encoded as a single cell.
    ///
    pub(crate) fn fill_bytes(&self) -> Vec<u8> {
        // Representability is checked by `validate`
        self.attribute
            .dtype
            .encode(self.attribute.fill)
            .unwrap_or_else(|| vec![0; self.attribute.dtype.size()])
    }

    /// A buffer covering `region` with every cell set to the fill value.
    ///
    pub(crate) fn filled(&self, region: &Region) -> Vec<u8> {
        self.fill_bytes().repeat(region.cells())
    }

    pub(crate) fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub(crate) fn from_json(bytes: &[u8]) -> Result<Self> {
        let schema: Self = serde_json::from_slice(bytes)?;
        schema.validate()?;

        Ok(schema)
    }
}
