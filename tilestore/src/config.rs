//! Harness configuration, loaded from TOML.
//!
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    cell::DataType,
    consolidate::ConsolidationConfig,
    errors::{Error, Result},
    schema::{Attribute, Filter, LogicalSpace},
};

/// Environment variable naming a TOML configuration file.
pub const CONFIG_ENV: &str = "TILESTORE_CONFIG";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    /// Directory the arrays are written under. Removed and recreated on every run.
    pub root: PathBuf,

    pub dimensions: Dimensions,
    pub tile: TileSize,

    /// Number of pyramid levels, including resolution 0
    pub resolutions: usize,

    pub max_workers: usize,

    /// Upper bound of the random jitter added to tile origins at resolution 0. 0 for none.
    pub overlap: usize,

    /// Seed for the jitter. A random seed is used when absent.
    pub seed: Option<u64>,

    /// Size of the fragment cache, in bytes
    pub cache_bytes: u64,

    pub fill: f64,
    pub compression_level: i32,
    pub consolidation: ConsolidationConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dimensions {
    pub t: usize,
    pub c: usize,
    pub z: usize,
    pub y: usize,
    pub x: usize,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            t: 1,
            c: 20,
            z: 1,
            y: 1000,
            x: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileSize {
    pub y: usize,
    pub x: usize,
}

impl Default for TileSize {
    fn default() -> Self {
        Self { y: 22000, x: 13000 }
    }
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            root: env::temp_dir().join("tilestore-stress"),
            dimensions: Dimensions::default(),
            tile: TileSize::default(),
            resolutions: 2,
            max_workers: 4,
            overlap: 16,
            seed: None,
            cache_bytes: 256 * 1024 * 1024,
            fill: 0.0,
            compression_level: 3,
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl StressConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load from the file named by `TILESTORE_CONFIG`, or use the defaults if it isn't set.
    ///
    pub fn from_env() -> Result<Self> {
        match env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => {
                let config = Self::default();
                config.validate()?;

                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let dimensions = &self.dimensions;
        for (name, extent) in [
            ("t", dimensions.t),
            ("c", dimensions.c),
            ("z", dimensions.z),
            ("y", dimensions.y),
            ("x", dimensions.x),
        ] {
            if extent == 0 {
                return Err(Error::Config(format!("dimension {name} must not be empty")));
            }
        }
        if self.tile.y == 0 || self.tile.x == 0 {
            return Err(Error::Config(String::from("tile size must not be zero")));
        }
        if self.resolutions == 0 {
            return Err(Error::Config(String::from("need at least one resolution")));
        }
        if self.max_workers == 0 {
            return Err(Error::Config(String::from("need at least one worker")));
        }
        if !zstd::compression_level_range().contains(&self.compression_level) {
            return Err(Error::Config(format!(
                "invalid compression level {}",
                self.compression_level
            )));
        }
        self.consolidation.validate()?;

        Ok(())
    }

    pub fn extents(&self) -> [usize; 5] {
        let dimensions = &self.dimensions;
        [
            dimensions.t,
            dimensions.c,
            dimensions.z,
            dimensions.y,
            dimensions.x,
        ]
    }

    /// The space of resolution 0. Cells are u16.
    ///
    pub fn space(&self) -> LogicalSpace {
        let attribute = Attribute {
            name: String::from("intensity"),
            dtype: DataType::U16,
            fill: self.fill,
            filter: Filter::Zstd {
                level: self.compression_level,
            },
        };

        LogicalSpace::new(self.extents(), attribute)
    }

    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::Rng;

    use crate::consolidate::ConsolidationMode;

    #[test]
    fn test_defaults() -> Result<()> {
        let config = StressConfig::default();
        config.validate()?;
        assert_eq!(config.extents(), [1, 20, 1, 1000, 1000]);
        assert_eq!((config.tile.y, config.tile.x), (22000, 13000));
        assert_eq!(config.resolutions, 2);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.overlap, 16);
        assert!(config.consolidation.enabled);
        assert_eq!(config.consolidation.mode()?, ConsolidationMode::FragmentMeta);
        assert_eq!(config.consolidation.step_min_frags, 2);

        Ok(())
    }

    #[test]
    fn test_from_toml() -> Result<()> {
        let config = StressConfig::from_toml(
            r#"
            root = "/tmp/stress"
            resolutions = 4
            seed = 99

            [dimensions]
            c = 3
            y = 512

            [tile]
            x = 128

            [consolidation]
            mode = "fragments"
            step_min_frags = 8
            "#,
        )?;
        assert_eq!(config.root, PathBuf::from("/tmp/stress"));
        assert_eq!(config.extents(), [1, 3, 1, 512, 1000]);
        assert_eq!((config.tile.y, config.tile.x), (22000, 128));
        assert_eq!(config.resolutions, 4);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.consolidation.mode()?, ConsolidationMode::Fragments);
        assert_eq!(config.consolidation.step_min_frags, 8);
        assert!(config.consolidation.enabled);

        let mut one = config.rng();
        let mut two = config.rng();
        assert_eq!(one.gen::<u64>(), two.gen::<u64>());

        Ok(())
    }

    #[test]
    fn test_invalid() {
        let result = StressConfig::from_toml("max_workers = 0");
        assert!(matches!(result, Err(Error::Config(_))));

        let result = StressConfig::from_toml("[dimensions]\nz = 0");
        assert!(matches!(result, Err(Error::Config(_))));

        let result = StressConfig::from_toml("[tile]\ny = 0");
        assert!(matches!(result, Err(Error::Config(_))));

        let result = StressConfig::from_toml("resolutions = 0");
        assert!(matches!(result, Err(Error::Config(_))));

        let result = StressConfig::from_toml("[consolidation]\nmode = \"everything\"");
        assert!(matches!(result, Err(Error::Config(_))));

        let result = StressConfig::from_toml("resolutions = \"two\"");
        assert!(matches!(result, Err(Error::Toml(_))));
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stress.toml");
        fs::write(&path, "overlap = 0\ncompression_level = 9\n")?;

        let config = StressConfig::from_file(&path)?;
        assert_eq!(config.overlap, 0);
        assert_eq!(config.space().attribute.filter, Filter::Zstd { level: 9 });

        let missing = StressConfig::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(Error::IO(_))));

        Ok(())
    }
}
