use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::seq::index;
use rayon::prelude::*;

use crate::config::{BuildParams, SamplingMode};
use crate::math::l2_distance_sqr;
use crate::pool::TaskPool;
use crate::PaseError;

/// Initial weight of every point in k-means++ seeding.
const PLUS_PLUS_BASE_WEIGHT: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct KMeansResult {
    pub centroids: Vec<Vec<f32>>,
    /// Cluster of every input point.
    pub assignments: Vec<usize>,
    /// Point indices owned by each cluster, ascending.
    pub members: Vec<Vec<u32>>,
    /// Update rounds actually run.
    pub epochs: usize,
}

impl KMeansResult {
    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    /// Member vectors of cluster `cluster`, borrowed from `points`.
    pub fn cluster_vectors<'a>(
        &'a self,
        cluster: usize,
        points: &'a [Vec<f32>],
    ) -> impl Iterator<Item = &'a [f32]> + 'a {
        self.members[cluster]
            .iter()
            .map(move |&idx| points[idx as usize].as_slice())
    }
}

/// Partition `points` into `params.cluster_count` clusters.
///
/// Seeding follows `params.sampling`; assignment and the centroid update run
/// on `pool`. Iteration stops when the Frobenius norm of the centroid shift
/// falls below `params.tolerance` or after `params.max_epochs` rounds.
pub fn run_kmeans(
    points: &[Vec<f32>],
    params: &BuildParams,
    pool: &TaskPool,
) -> Result<KMeansResult, PaseError> {
    let k = params.cluster_count;
    validate(points, params)?;
    let dim = points[0].len();

    let mut rng = StdRng::seed_from_u64(params.seed);
    let seeds = match params.sampling {
        SamplingMode::Uniform => index::sample(&mut rng, points.len(), k).into_vec(),
        SamplingMode::PlusPlus => seed_plus_plus(points, k, &mut rng, pool)?,
    };
    let mut centroids: Vec<Vec<f32>> = seeds.iter().map(|&idx| points[idx].clone()).collect();

    let mut assignments = vec![0usize; points.len()];
    let mut epochs = 0usize;
    let mut shift = f32::INFINITY;

    while epochs < params.max_epochs {
        assign(points, &centroids, &mut assignments, pool);
        let updated = update_centroids(points, &assignments, k, dim, pool);
        shift = frobenius_shift(&centroids, &updated);
        centroids = updated;
        epochs += 1;
        tracing::trace!(epoch = epochs, shift, "k-means epoch");
        if shift < params.tolerance {
            break;
        }
    }

    // Final assignment so that memberships agree with the returned centroids.
    assign(points, &centroids, &mut assignments, pool);
    let mut members = vec![Vec::new(); k];
    for (idx, &cluster) in assignments.iter().enumerate() {
        members[cluster].push(idx as u32);
    }

    tracing::debug!(
        points = points.len(),
        clusters = k,
        epochs,
        shift,
        "k-means finished"
    );
    Ok(KMeansResult {
        centroids,
        assignments,
        members,
        epochs,
    })
}

fn validate(points: &[Vec<f32>], params: &BuildParams) -> Result<(), PaseError> {
    if points.is_empty() {
        return Err(PaseError::InvalidConfig("k-means requires at least one point"));
    }
    if params.cluster_count == 0 {
        return Err(PaseError::InvalidConfig("cluster_count must be positive"));
    }
    if params.cluster_count > points.len() {
        return Err(PaseError::InvalidConfig(
            "cluster_count cannot exceed the number of training points",
        ));
    }
    if u32::try_from(points.len()).is_err() {
        return Err(PaseError::InvalidConfig(
            "k-means supports at most u32::MAX training points",
        ));
    }
    if !params.tolerance.is_finite() || params.tolerance < 0.0 {
        return Err(PaseError::InvalidConfig(
            "tolerance must be finite and non-negative",
        ));
    }
    let dim = points[0].len();
    if dim == 0 {
        return Err(PaseError::InvalidConfig("dimension must be positive"));
    }
    if let Some(bad) = points.iter().find(|p| p.len() != dim) {
        return Err(PaseError::DimensionMismatch {
            expected: dim,
            got: bad.len(),
        });
    }
    Ok(())
}

/// k-means++ seeding over distinct point indices.
///
/// Every point starts with a small base weight and accumulates its squared
/// distance to each centroid chosen so far; chosen points drop out of the draw.
fn seed_plus_plus(
    points: &[Vec<f32>],
    k: usize,
    rng: &mut StdRng,
    pool: &TaskPool,
) -> Result<Vec<usize>, PaseError> {
    let mut weights = vec![PLUS_PLUS_BASE_WEIGHT; points.len()];
    let mut seeds = Vec::with_capacity(k);

    while seeds.len() < k {
        let sampler = WeightedIndex::new(&weights)
            .map_err(|_| PaseError::InvalidConfig("no candidate left for k-means++ seeding"))?;
        let picked = sampler.sample(rng);
        seeds.push(picked);
        weights[picked] = 0.0;
        if seeds.len() == k {
            break;
        }

        let centre = points[picked].as_slice();
        pool.install(|| {
            weights
                .par_iter_mut()
                .zip(points.par_iter())
                .filter(|(weight, _)| **weight > 0.0)
                .for_each(|(weight, point)| {
                    *weight += l2_distance_sqr(point, centre) as f64;
                });
        });
    }

    Ok(seeds)
}

/// Index and squared distance of the closest centroid; ties go to the lowest index.
pub(crate) fn nearest_centroid<C: AsRef<[f32]>>(vector: &[f32], centroids: &[C]) -> (usize, f32) {
    let mut best_cluster = 0usize;
    let mut best_distance = f32::MAX;
    for (cid, centroid) in centroids.iter().enumerate() {
        let dist = l2_distance_sqr(vector, centroid.as_ref());
        if dist < best_distance {
            best_distance = dist;
            best_cluster = cid;
        }
    }
    (best_cluster, best_distance)
}

fn assign(points: &[Vec<f32>], centroids: &[Vec<f32>], assignments: &mut [usize], pool: &TaskPool) {
    pool.install(|| {
        assignments
            .par_iter_mut()
            .zip(points.par_iter())
            .for_each(|(assignment, point)| {
                *assignment = nearest_centroid(point, centroids).0;
            });
    });
}

fn update_centroids(
    points: &[Vec<f32>],
    assignments: &[usize],
    k: usize,
    dim: usize,
    pool: &TaskPool,
) -> Vec<Vec<f32>> {
    let (sums, mut counts) = pool.install(|| {
        points
            .par_iter()
            .zip(assignments.par_iter())
            .fold(
                || (vec![vec![0.0f32; dim]; k], vec![0usize; k]),
                |mut acc, (vector, &cluster)| {
                    acc.1[cluster] += 1;
                    for (sum, value) in acc.0[cluster].iter_mut().zip(vector.iter()) {
                        *sum += *value;
                    }
                    acc
                },
            )
            .reduce(
                || (vec![vec![0.0f32; dim]; k], vec![0usize; k]),
                |mut left, (right_sums, right_counts)| {
                    for (dst, src) in left.0.iter_mut().zip(right_sums.iter()) {
                        for (dst_val, src_val) in dst.iter_mut().zip(src.iter()) {
                            *dst_val += *src_val;
                        }
                    }
                    for (dst_count, src_count) in left.1.iter_mut().zip(right_counts.iter()) {
                        *dst_count += *src_count;
                    }
                    left
                },
            )
    });

    let mut centroids = sums;
    let empty: Vec<usize> = (0..k).filter(|&cid| counts[cid] == 0).collect();
    for (centroid, &count) in centroids.iter_mut().zip(counts.iter()) {
        if count > 0 {
            let count = count as f32;
            centroid.iter_mut().for_each(|v| *v /= count);
        }
    }
    if !empty.is_empty() {
        reseed_empty(points, assignments, &mut counts, &empty, &mut centroids, pool);
    }
    centroids
}

/// Move each empty cluster onto the point farthest from its updated mean.
///
/// Only points whose cluster keeps at least one other member are eligible,
/// and a point is used for at most one empty cluster per epoch.
fn reseed_empty(
    points: &[Vec<f32>],
    assignments: &[usize],
    counts: &mut [usize],
    empty: &[usize],
    centroids: &mut [Vec<f32>],
    pool: &TaskPool,
) {
    let means: &[Vec<f32>] = centroids;
    let mut costs: Vec<f32> = pool.install(|| {
        points
            .par_iter()
            .zip(assignments.par_iter())
            .map(|(point, &cluster)| l2_distance_sqr(point, &means[cluster]))
            .collect()
    });

    for &cid in empty {
        let farthest = costs
            .iter()
            .enumerate()
            .filter(|&(idx, cost)| *cost != f32::NEG_INFINITY && counts[assignments[idx]] > 1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(idx, _)| idx);
        // K <= N keeps some cluster above one member while any cluster is empty.
        let Some(idx) = farthest else {
            break;
        };
        centroids[cid].copy_from_slice(&points[idx]);
        counts[assignments[idx]] -= 1;
        counts[cid] = 1;
        costs[idx] = f32::NEG_INFINITY;
    }
    tracing::debug!(clusters = empty.len(), "re-seeded empty clusters");
}

fn frobenius_shift(before: &[Vec<f32>], after: &[Vec<f32>]) -> f32 {
    before
        .iter()
        .zip(after.iter())
        .map(|(a, b)| l2_distance_sqr(a, b) as f64)
        .sum::<f64>()
        .sqrt() as f32
}
