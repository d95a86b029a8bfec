use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::PaseError;

/// How initial centroids are drawn from the training set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    /// Uniform sampling without replacement.
    Uniform,
    /// k-means++: draws weighted by squared distance to chosen centroids.
    #[default]
    PlusPlus,
}

/// Clustering parameters for `train` / `build_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildParams {
    pub cluster_count: usize,
    pub max_epochs: usize,
    /// Stop once the Frobenius norm of the centroid shift drops below this.
    pub tolerance: f32,
    pub sampling: SamplingMode,
    pub seed: u64,
}

impl BuildParams {
    pub fn new(cluster_count: usize) -> Self {
        Self {
            cluster_count,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingMode) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_max_epochs(mut self, max_epochs: usize) -> Self {
        self.max_epochs = max_epochs;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            cluster_count: 100,
            max_epochs: 100,
            tolerance: 1e-4,
            sampling: SamplingMode::PlusPlus,
            seed: 0x5eed,
        }
    }
}

/// Query parameters for `search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub neighbour_count: usize,
    pub cluster_count_to_select: usize,
}

impl SearchParams {
    pub fn new(neighbour_count: usize, cluster_count_to_select: usize) -> Self {
        Self {
            neighbour_count,
            cluster_count_to_select,
        }
    }

    /// Probe `fraction` of `cluster_count` clusters, at least one.
    pub fn with_cluster_fraction(
        neighbour_count: usize,
        cluster_count: usize,
        fraction: f32,
    ) -> Self {
        let selected = (cluster_count as f32 * fraction).round() as usize;
        Self::new(neighbour_count, selected.clamp(1, cluster_count.max(1)))
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        Self::new(100, 10)
    }
}

/// Settings file accepted by the benchmark binary.
///
/// ```toml
/// threads = 8
///
/// [build]
/// cluster_count = 1000
/// sampling = "uniform"
///
/// [search]
/// neighbour_count = 100
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Worker threads; `0` uses every available core.
    pub threads: usize,
    pub build: BuildParams,
    pub search: SearchParams,
}

impl IndexConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, PaseError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, PaseError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let params = BuildParams::default();
        assert_eq!(params.max_epochs, 100);
        assert_eq!(params.tolerance, 1e-4);
        assert_eq!(params.sampling, SamplingMode::PlusPlus);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = IndexConfig::from_toml_str(
            r#"
            threads = 3

            [build]
            cluster_count = 256
            sampling = "uniform"

            [search]
            cluster_count_to_select = 16
            "#,
        )
        .expect("parse config");

        assert_eq!(config.threads, 3);
        assert_eq!(config.build.cluster_count, 256);
        assert_eq!(config.build.sampling, SamplingMode::Uniform);
        assert_eq!(config.build.max_epochs, 100);
        assert_eq!(config.search.cluster_count_to_select, 16);
        assert_eq!(config.search.neighbour_count, 100);
    }

    #[test]
    fn malformed_toml_is_reported() {
        match IndexConfig::from_toml_str("[build]\ncluster_count = \"many\"") {
            Err(PaseError::Config(_)) => {}
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn cluster_fraction_is_clamped() {
        assert_eq!(
            SearchParams::with_cluster_fraction(10, 1000, 0.01).cluster_count_to_select,
            10
        );
        assert_eq!(
            SearchParams::with_cluster_fraction(10, 20, 0.01).cluster_count_to_select,
            1
        );
        assert_eq!(
            SearchParams::with_cluster_fraction(10, 20, 2.0).cluster_count_to_select,
            20
        );
    }
}
