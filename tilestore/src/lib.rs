mod array;
mod cache;
mod cell;
mod config;
mod consolidate;
mod downsample;
mod errors;
mod extio;
mod filesystem;
mod fragment;
mod geom;
mod harness;
mod helpers;
mod mapper;
mod node;
mod pyramid;
mod resolver;
mod scheduler;
mod schema;

#[cfg(test)]
mod testing;

pub use array::ArrayHandle;
pub use array::ArrayStore;
pub use array::Mode;

pub use cell::Cell;
pub use cell::DataType;

pub use config::Dimensions;
pub use config::StressConfig;
pub use config::TileSize;
pub use config::CONFIG_ENV;

pub use consolidate::consolidate;
pub use consolidate::consolidate_and_vacuum;
pub use consolidate::vacuum;
pub use consolidate::ConsolidationConfig;
pub use consolidate::ConsolidationMode;
pub use consolidate::ConsolidationReport;

pub use downsample::BoxFilter;
pub use downsample::Downsampler;

pub use errors::Error;
pub use errors::Result;

pub use filesystem::FsMapper;

pub use fragment::FragmentId;
pub use fragment::FragmentMeta;

pub use geom::Rect;
pub use geom::Region;
pub use geom::TileCoord;
pub use geom::{C, T, X, Y, Z};

pub use harness::run;
pub use harness::run_with_store;
pub use harness::RunReport;

pub use mapper::Mapper;
pub use mapper::StoreWrite;

pub use pyramid::LevelReport;
pub use pyramid::PyramidBuilder;

pub use resolver::LsEntry;
pub use resolver::Resolver;

pub use scheduler::pattern;
pub use scheduler::TaskExecutor;
pub use scheduler::TileGrid;
pub use scheduler::TileScheduler;
pub use scheduler::WriteStats;

pub use schema::ArraySchema;
pub use schema::Attribute;
pub use schema::Dimension;
pub use schema::Filter;
pub use schema::LogicalSpace;
