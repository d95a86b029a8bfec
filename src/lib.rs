pub mod config;
pub mod eval;
pub mod io;
pub mod ivf;
pub mod kmeans;
pub mod math;
pub mod page;
pub mod pool;

pub use config::{BuildParams, IndexConfig, SamplingMode, SearchParams};
pub use ivf::{Neighbour, PaseIvfFlat};
pub use kmeans::{run_kmeans, KMeansResult};
pub use math::DistanceBackend;
pub use page::{CentroidTuple, DataPage, Page, PageArena, PageId, PAGE_SIZE};
pub use pool::{TaskHandle, TaskPool};


/// Errors that can occur when building or querying an IVF-Flat index.
#[derive(thiserror::Error, Debug)]
pub enum PaseError {
    /// Returned when the dimension of an input vector does not match the index.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// Returned at construction when not even one vector fits on a page.
    #[error(
        "vector dimension {dimension} is too big: even one vector can not be stored on an 8 KB page (max {max})"
    )]
    DimensionTooLarge { dimension: usize, max: usize },
    /// Returned when a caller-provided cluster list disagrees with the index.
    #[error("inconsistent cluster count: expected {expected}, got {got}")]
    ClusterCountMismatch { expected: usize, got: usize },
    /// Returned when an invalid configuration is supplied.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Returned when the index is used before `train`.
    #[error("index has no centroids; call `train` first")]
    NotTrained,
    /// Returned when `train` is called on an index that already holds centroids.
    #[error("index is already trained")]
    AlreadyTrained,
    /// Returned when a page or centroid allocation fails.
    #[error("page allocation failed: {0}")]
    Allocation(#[from] std::collections::TryReserveError),
    /// Returned when the page arena runs out of addressable page ids.
    #[error("page arena exhausted the 32-bit page id space")]
    PageLimitExceeded,
    /// Returned when a submitted task failed before its batch was awaited.
    #[error("task failed: {0}")]
    TaskFailed(String),
    /// Returned when the worker pool cannot be started.
    #[error("failed to start worker pool: {0}")]
    ThreadPool(String),
    /// Returned when reading vector files fails.
    #[error("i/o error while reading vectors: {0}")]
    Io(#[from] std::io::Error),
    /// Returned when a settings file cannot be parsed.
    #[error("failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),
}
