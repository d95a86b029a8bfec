use std::mem;
use std::sync::Arc;

use rayon::prelude::*;

use crate::config::{BuildParams, SearchParams};
use crate::kmeans::{nearest_centroid, run_kmeans};
use crate::math::l2_distance_sqr;
use crate::page::{CentroidPage, CentroidTuple, DataPage, PageArena, PageId};
use crate::pool::TaskPool;
use crate::PaseError;

/// Result entry returned by [`PaseIvfFlat::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbour {
    pub vector: Vec<f32>,
    pub id: u32,
    /// Squared L2 distance to the query.
    pub distance: f32,
}

/// Member borrowed from a data page while a query is re-ranked.
#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    vector: &'a [f32],
    id: u32,
    distance: f32,
}

/// Inverted-file index with flat (unquantized) member storage.
///
/// Centroids live on a linked chain of centroid pages in cluster order. Each
/// centroid owns a chain of data pages holding copies of its members.
#[derive(Debug)]
pub struct PaseIvfFlat {
    dimension: usize,
    cluster_count: usize,
    centroid_pages: PageArena<CentroidPage>,
    centroid_head: Option<PageId>,
    centroid_tail: Option<PageId>,
    centroid_count: usize,
    data_pages: PageArena<DataPage>,
    len: usize,
    pool: Arc<TaskPool>,
}

impl PaseIvfFlat {
    /// Create an empty index for `dimension`-sized vectors and `cluster_count` clusters.
    pub fn new(
        dimension: usize,
        cluster_count: usize,
        pool: Arc<TaskPool>,
    ) -> Result<Self, PaseError> {
        if dimension == 0 {
            return Err(PaseError::InvalidConfig("dimension must be positive"));
        }
        if cluster_count == 0 {
            return Err(PaseError::InvalidConfig("cluster_count must be positive"));
        }
        if DataPage::vectors_per_page(dimension) == 0 {
            return Err(PaseError::DimensionTooLarge {
                dimension,
                max: crate::page::max_dimension(),
            });
        }

        tracing::debug!(
            dimension,
            cluster_count,
            vectors_per_page = DataPage::vectors_per_page(dimension),
            "created ivf-flat index"
        );
        Ok(Self {
            dimension,
            cluster_count,
            centroid_pages: PageArena::new(),
            centroid_head: None,
            centroid_tail: None,
            centroid_count: 0,
            data_pages: PageArena::new(),
            len: 0,
            pool,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_count
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn centroid_count(&self) -> usize {
        self.centroid_count
    }

    pub fn centroid_page_count(&self) -> usize {
        self.centroid_pages.len()
    }

    pub fn vectors_per_page(&self) -> usize {
        DataPage::vectors_per_page(self.dimension)
    }

    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    /// Centroid pages in chain order.
    pub fn centroid_pages(&self) -> impl Iterator<Item = &CentroidPage> + '_ {
        self.centroid_pages
            .chain(self.centroid_head)
            .map(|(_, page)| page)
    }

    /// Centroid vectors in cluster order.
    pub fn centroids(&self) -> impl Iterator<Item = &[f32]> + '_ {
        self.centroid_pages()
            .flat_map(|page| page.records().iter().map(|tuple| tuple.vector.as_slice()))
    }

    /// Catalog entry of cluster `cluster`.
    pub fn centroid(&self, cluster: usize) -> Option<&CentroidTuple> {
        let capacity = CentroidPage::capacity();
        self.centroid_pages()
            .nth(cluster / capacity)
            .and_then(|page| page.records().get(cluster % capacity))
    }

    /// Member count of every cluster, in cluster order.
    pub fn cluster_sizes(&self) -> Vec<usize> {
        self.centroid_pages()
            .flat_map(|page| page.records().iter().map(|tuple| tuple.vector_count))
            .collect()
    }

    /// Stored `(vector, id)` pairs of cluster `cluster` in insertion order.
    pub fn cluster_members(&self, cluster: usize) -> impl Iterator<Item = (&[f32], u32)> + '_ {
        let head = self.centroid(cluster).and_then(|tuple| tuple.first_data_page);
        self.data_pages
            .chain(head)
            .flat_map(|(_, page)| page.iter())
    }

    /// Length of cluster `cluster`'s data page chain.
    pub fn data_page_count(&self, cluster: usize) -> usize {
        let head = self.centroid(cluster).and_then(|tuple| tuple.first_data_page);
        self.data_pages.chain(head).count()
    }

    /// Append one centroid to the catalog together with its members.
    pub fn add_centroid<V: AsRef<[f32]>>(
        &mut self,
        centroid: Vec<f32>,
        members: &[V],
        ids: &[u32],
    ) -> Result<(), PaseError> {
        self.check_dimension(centroid.len())?;
        if members.len() != ids.len() {
            return Err(PaseError::InvalidConfig(
                "members and ids must have the same length",
            ));
        }
        for member in members {
            self.check_dimension(member.as_ref().len())?;
        }
        if self.centroid_count >= self.cluster_count {
            return Err(PaseError::ClusterCountMismatch {
                expected: self.cluster_count,
                got: self.centroid_count + 1,
            });
        }

        let (page_id, slot) = self.push_centroid(CentroidTuple::new(centroid))?;
        self.append_members(
            page_id,
            slot,
            members
                .iter()
                .map(|member| member.as_ref())
                .zip(ids.iter().copied()),
        )
    }

    /// Cluster `points` with k-means and store the resulting centroids.
    pub fn train(&mut self, points: &[Vec<f32>], params: &BuildParams) -> Result<(), PaseError> {
        if self.centroid_count > 0 {
            return Err(PaseError::AlreadyTrained);
        }
        if params.cluster_count != self.cluster_count {
            return Err(PaseError::ClusterCountMismatch {
                expected: self.cluster_count,
                got: params.cluster_count,
            });
        }
        if let Some(bad) = points.iter().find(|p| p.len() != self.dimension) {
            return Err(PaseError::DimensionMismatch {
                expected: self.dimension,
                got: bad.len(),
            });
        }

        let result = run_kmeans(points, params, &self.pool)?;
        self.train_with_centroids(result.centroids)
    }

    /// Store precomputed centroids, in order, with no members.
    pub fn train_with_centroids(&mut self, centroids: Vec<Vec<f32>>) -> Result<(), PaseError> {
        if self.centroid_count > 0 {
            return Err(PaseError::AlreadyTrained);
        }
        if centroids.len() != self.cluster_count {
            return Err(PaseError::ClusterCountMismatch {
                expected: self.cluster_count,
                got: centroids.len(),
            });
        }
        for centroid in &centroids {
            self.check_dimension(centroid.len())?;
        }

        for centroid in centroids {
            self.push_centroid(CentroidTuple::new(centroid))?;
        }
        tracing::debug!(
            clusters = self.centroid_count,
            pages = self.centroid_pages.len(),
            "centroid catalog written"
        );
        Ok(())
    }

    /// Assign every point to its nearest centroid and store a copy of it.
    pub fn add<V: AsRef<[f32]> + Sync>(
        &mut self,
        points: &[V],
        ids: &[u32],
    ) -> Result<(), PaseError> {
        self.ensure_trained()?;
        if points.len() != ids.len() {
            return Err(PaseError::InvalidConfig(
                "points and ids must have the same length",
            ));
        }
        for point in points {
            self.check_dimension(point.as_ref().len())?;
        }

        let assignments: Vec<usize> = {
            let centroids: Vec<&[f32]> = self.centroids().collect();
            self.pool.install(|| {
                points
                    .par_iter()
                    .map(|point| nearest_centroid(point.as_ref(), &centroids).0)
                    .collect()
            })
        };

        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); self.centroid_count];
        for (idx, &cluster) in assignments.iter().enumerate() {
            buckets[cluster].push(idx);
        }

        let capacity = CentroidPage::capacity();
        let page_ids: Vec<PageId> = self
            .centroid_pages
            .chain(self.centroid_head)
            .map(|(id, _)| id)
            .collect();
        for (cluster, bucket) in buckets.iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            self.append_members(
                page_ids[cluster / capacity],
                cluster % capacity,
                bucket.iter().map(|&idx| (points[idx].as_ref(), ids[idx])),
            )?;
        }

        tracing::debug!(added = points.len(), total = self.len, "vectors added");
        Ok(())
    }

    /// Train on `learn`, then add `base` with `ids`.
    pub fn build_index<V: AsRef<[f32]> + Sync>(
        &mut self,
        learn: &[Vec<f32>],
        base: &[V],
        ids: &[u32],
        params: &BuildParams,
    ) -> Result<(), PaseError> {
        self.train(learn, params)?;
        self.add(base, ids)
    }

    /// Approximate `neighbour_count` nearest neighbours of `query`, closest first.
    ///
    /// Only members of the `cluster_count_to_select` clusters whose centroids
    /// are closest to the query are considered.
    pub fn search(
        &self,
        query: &[f32],
        neighbour_count: usize,
        cluster_count_to_select: usize,
    ) -> Result<Vec<Neighbour>, PaseError> {
        self.ensure_trained()?;
        self.check_dimension(query.len())?;
        let selected_count = cluster_count_to_select.min(self.centroid_count);
        if neighbour_count == 0 || selected_count == 0 {
            return Ok(Vec::new());
        }

        let pages: Vec<&CentroidPage> = self.centroid_pages().collect();
        let ranked = self
            .pool
            .install(|| rank_clusters(query, &pages, self.centroid_count));

        let capacity = CentroidPage::capacity();
        let selected: Vec<&CentroidTuple> = ranked[..selected_count]
            .iter()
            .map(|&(_, cluster)| &pages[cluster / capacity].records()[cluster % capacity])
            .collect();
        let total: usize = selected.iter().map(|tuple| tuple.vector_count).sum();

        let mut candidates: Vec<Candidate<'_>> = Vec::new();
        candidates.try_reserve_exact(total)?;
        candidates.resize(
            total,
            Candidate {
                vector: &[],
                id: 0,
                distance: f32::INFINITY,
            },
        );

        self.pool.install(|| {
            self.gather_candidates(&selected, &mut candidates);
            candidates.par_iter_mut().for_each(|candidate| {
                candidate.distance = l2_distance_sqr(query, candidate.vector);
            });
            candidates.par_sort_unstable_by(|a, b| a.distance.total_cmp(&b.distance));
        });

        Ok(candidates
            .iter()
            .take(neighbour_count)
            .map(|candidate| Neighbour {
                vector: candidate.vector.to_vec(),
                id: candidate.id,
                distance: candidate.distance,
            })
            .collect())
    }

    pub fn search_with(
        &self,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<Neighbour>, PaseError> {
        self.search(query, params.neighbour_count, params.cluster_count_to_select)
    }

    pub fn find_nearest_vectors(
        &self,
        query: &[f32],
        neighbour_count: usize,
        cluster_count_to_select: usize,
    ) -> Result<Vec<Vec<f32>>, PaseError> {
        Ok(self
            .search(query, neighbour_count, cluster_count_to_select)?
            .into_iter()
            .map(|neighbour| neighbour.vector)
            .collect())
    }

    pub fn find_nearest_vector_ids(
        &self,
        query: &[f32],
        neighbour_count: usize,
        cluster_count_to_select: usize,
    ) -> Result<Vec<u32>, PaseError> {
        Ok(self
            .search(query, neighbour_count, cluster_count_to_select)?
            .into_iter()
            .map(|neighbour| neighbour.id)
            .collect())
    }

    fn ensure_trained(&self) -> Result<(), PaseError> {
        if self.centroid_count == 0 {
            return Err(PaseError::NotTrained);
        }
        Ok(())
    }

    fn check_dimension(&self, got: usize) -> Result<(), PaseError> {
        if got != self.dimension {
            return Err(PaseError::DimensionMismatch {
                expected: self.dimension,
                got,
            });
        }
        Ok(())
    }

    /// Append `tuple` to the catalog, growing the chain when the tail is full.
    fn push_centroid(&mut self, tuple: CentroidTuple) -> Result<(PageId, usize), PaseError> {
        let tail = match self.centroid_tail {
            Some(tail) if !self.centroid_pages.get(tail).is_full() => tail,
            previous => {
                let page = self.centroid_pages.allocate(CentroidPage::new()?)?;
                match previous {
                    Some(previous) => self.centroid_pages.link(previous, page),
                    None => self.centroid_head = Some(page),
                }
                self.centroid_tail = Some(page);
                page
            }
        };

        let page = self.centroid_pages.get_mut(tail);
        let slot = page.len();
        let pushed = page.push(tuple);
        debug_assert!(pushed.is_ok());
        self.centroid_count += 1;
        Ok((tail, slot))
    }

    /// Copy `members` onto the data page chain of the centroid at `(page_id, slot)`.
    fn append_members<'v, I>(
        &mut self,
        page_id: PageId,
        slot: usize,
        members: I,
    ) -> Result<(), PaseError>
    where
        I: Iterator<Item = (&'v [f32], u32)>,
    {
        let mut last = self.centroid_pages.get(page_id).records()[slot].last_data_page;
        let mut first = None;
        let mut appended = 0usize;

        for (vector, id) in members {
            let tail = match last {
                Some(tail) if !self.data_pages.get(tail).is_full() => tail,
                previous => {
                    let page = self.data_pages.allocate(DataPage::new(self.dimension)?)?;
                    match previous {
                        Some(previous) => self.data_pages.link(previous, page),
                        None => first = Some(page),
                    }
                    last = Some(page);
                    page
                }
            };
            let pushed = self.data_pages.get_mut(tail).push(vector, id);
            debug_assert!(pushed);
            appended += 1;
        }

        let tuple = &mut self.centroid_pages.get_mut(page_id).records_mut()[slot];
        if tuple.first_data_page.is_none() {
            tuple.first_data_page = first;
        }
        tuple.last_data_page = last;
        tuple.vector_count += appended;
        self.len += appended;
        Ok(())
    }

    /// Write borrowed views of every member of `selected` into `candidates`.
    ///
    /// Each cluster fills its own range, starting at the running sum of the
    /// preceding clusters' `vector_count`.
    fn gather_candidates<'a>(
        &'a self,
        selected: &[&'a CentroidTuple],
        candidates: &mut [Candidate<'a>],
    ) {
        let mut ranges = Vec::with_capacity(selected.len());
        let mut rest = candidates;
        for &tuple in selected {
            let (range, tail) = mem::take(&mut rest).split_at_mut(tuple.vector_count);
            ranges.push((range, tuple));
            rest = tail;
        }

        let data_pages = &self.data_pages;
        ranges.into_par_iter().for_each(|(range, tuple)| {
            let members = data_pages
                .chain(tuple.first_data_page)
                .flat_map(|(_, page)| page.iter());
            for (slot, (vector, id)) in range.iter_mut().zip(members) {
                slot.vector = vector;
                slot.id = id;
            }
        });
    }
}

/// Squared distance from `query` to every centroid, closest first.
///
/// One task per centroid page; every page but the tail is full, so page `p`
/// owns output range `p * capacity..`.
fn rank_clusters(
    query: &[f32],
    pages: &[&CentroidPage],
    centroid_count: usize,
) -> Vec<(f32, usize)> {
    let capacity = CentroidPage::capacity();
    let mut ranked = vec![(f32::INFINITY, 0usize); centroid_count];
    ranked
        .par_chunks_mut(capacity)
        .zip(pages.par_iter())
        .enumerate()
        .for_each(|(page_no, (out, page))| {
            for (slot, (dst, tuple)) in out.iter_mut().zip(page.records()).enumerate() {
                *dst = (
                    l2_distance_sqr(query, &tuple.vector),
                    page_no * capacity + slot,
                );
            }
        });
    ranked.par_sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(dimension: usize, clusters: usize) -> PaseIvfFlat {
        let pool = Arc::new(TaskPool::new(2).expect("pool"));
        PaseIvfFlat::new(dimension, clusters, pool).expect("index")
    }

    #[test]
    fn members_spill_onto_linked_data_pages() {
        let mut index = index(960, 1);
        let members: Vec<Vec<f32>> = (0..5).map(|i| vec![i as f32; 960]).collect();
        index
            .add_centroid(vec![0.0; 960], &members, &[10, 11, 12, 13, 14])
            .expect("add centroid");

        // Two 960-d vectors per page.
        assert_eq!(index.vectors_per_page(), 2);
        assert_eq!(index.data_page_count(0), 3);
        assert_eq!(index.cluster_sizes(), vec![5]);
        let ids: Vec<u32> = index.cluster_members(0).map(|(_, id)| id).collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14]);
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn add_centroid_beyond_cluster_count_is_rejected() {
        let mut index = index(2, 1);
        let none: &[Vec<f32>] = &[];
        index.add_centroid(vec![0.0, 0.0], none, &[]).expect("first");
        match index.add_centroid(vec![1.0, 1.0], none, &[]) {
            Err(PaseError::ClusterCountMismatch { expected: 1, got: 2 }) => {}
            other => panic!("expected ClusterCountMismatch, got {other:?}"),
        }
    }

    #[test]
    fn add_centroid_checks_member_shapes() {
        let mut index = index(2, 4);
        match index.add_centroid(vec![0.0, 0.0], &[vec![1.0f32, 2.0]], &[]) {
            Err(PaseError::InvalidConfig(_)) => {}
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
        match index.add_centroid(vec![0.0, 0.0], &[vec![1.0f32]], &[7]) {
            Err(PaseError::DimensionMismatch { expected: 2, got: 1 }) => {}
            other => panic!("expected DimensionMismatch, got {other:?}"),
        }
        assert_eq!(index.centroid_count(), 0);
    }

    #[test]
    fn zero_sized_configuration_is_rejected() {
        let pool = Arc::new(TaskPool::new(1).expect("pool"));
        assert!(matches!(
            PaseIvfFlat::new(0, 4, Arc::clone(&pool)),
            Err(PaseError::InvalidConfig(_))
        ));
        assert!(matches!(
            PaseIvfFlat::new(4, 0, pool),
            Err(PaseError::InvalidConfig(_))
        ));
    }

    #[test]
    fn search_with_zero_neighbours_is_empty() {
        let mut index = index(2, 1);
        index
            .add_centroid(vec![0.0, 0.0], &[vec![1.0f32, 1.0]], &[1])
            .expect("add centroid");
        assert!(index.search(&[0.0, 0.0], 0, 1).expect("search").is_empty());
        assert!(index.search(&[0.0, 0.0], 3, 0).expect("search").is_empty());
    }
}
