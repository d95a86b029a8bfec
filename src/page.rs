//! Fixed-size page storage.
//!
//! Pages live in a [`PageArena`] and are addressed by stable [`PageId`]s. A
//! page links forward to at most one successor, so every chain is a singly
//! linked, append-only list of blocks. The owners (the centroid catalog and
//! each centroid's member chain) decide when the tail is full and link a new
//! page before writing past capacity.

use std::mem::size_of;
use std::num::NonZeroU32;

use crate::PaseError;

/// Size of one page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Bytes reserved on every page for the forward link.
pub const LINK_SIZE: usize = size_of::<Option<PageId>>();

/// Number of `record_size`-byte records that fit on one page.
pub const fn page_capacity(record_size: usize) -> usize {
    (PAGE_SIZE - LINK_SIZE) / record_size
}

/// Stable handle of a page inside a [`PageArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(NonZeroU32);

impl PageId {
    fn from_index(index: usize) -> Result<Self, PaseError> {
        u32::try_from(index + 1)
            .ok()
            .and_then(NonZeroU32::new)
            .map(PageId)
            .ok_or(PaseError::PageLimitExceeded)
    }

    /// Position of the page inside its arena.
    pub fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// A page that carries a forward link.
pub trait LinkedPage {
    fn next_page(&self) -> Option<PageId>;
    fn set_next_page(&mut self, next: PageId);

    /// O(1) check for a successor.
    fn has_next_page(&self) -> bool {
        self.next_page().is_some()
    }
}

/// Fixed-capacity block of homogeneous records.
#[derive(Debug, Clone)]
pub struct Page<T> {
    records: Vec<T>,
    next: Option<PageId>,
}

impl<T> Page<T> {
    /// Records of type `T` per page.
    pub const fn capacity() -> usize {
        page_capacity(size_of::<T>())
    }

    /// Allocate an empty page with room for [`Page::capacity`] records.
    pub fn new() -> Result<Self, PaseError> {
        let mut records = Vec::new();
        records.try_reserve_exact(Self::capacity())?;
        Ok(Self {
            records,
            next: None,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= Self::capacity()
    }

    /// Store a record, handing it back when the page is full.
    pub fn push(&mut self, record: T) -> Result<(), T> {
        if self.is_full() {
            return Err(record);
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [T] {
        &mut self.records
    }
}

impl<T> LinkedPage for Page<T> {
    fn next_page(&self) -> Option<PageId> {
        self.next
    }

    fn set_next_page(&mut self, next: PageId) {
        self.next = Some(next);
    }
}

/// One cluster's entry in the centroid catalog.
#[derive(Debug, Clone)]
pub struct CentroidTuple {
    pub vector: Vec<f32>,
    pub first_data_page: Option<PageId>,
    pub last_data_page: Option<PageId>,
    pub vector_count: usize,
}

impl CentroidTuple {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            first_data_page: None,
            last_data_page: None,
            vector_count: 0,
        }
    }
}

pub type CentroidPage = Page<CentroidTuple>;

/// Page of member vectors with their external ids.
///
/// Components and ids are two parallel arrays sized by the same capacity:
/// vector `i` occupies `components[i * dim..(i + 1) * dim]` and its id is
/// `ids[i]`.
#[derive(Debug, Clone)]
pub struct DataPage {
    dim: usize,
    components: Vec<f32>,
    ids: Vec<u32>,
    next: Option<PageId>,
}

impl DataPage {
    /// Vectors of dimension `dim` (plus their ids) that fit on one page.
    ///
    /// Zero when a single vector is wider than a page.
    pub const fn vectors_per_page(dim: usize) -> usize {
        match dim.checked_mul(size_of::<f32>()) {
            Some(bytes) if bytes <= PAGE_SIZE => page_capacity(bytes + size_of::<u32>()),
            _ => 0,
        }
    }

    /// Allocate an empty data page for vectors of dimension `dim`.
    pub fn new(dim: usize) -> Result<Self, PaseError> {
        if dim == 0 {
            return Err(PaseError::InvalidConfig("dimension must be positive"));
        }
        let capacity = Self::vectors_per_page(dim);
        if capacity == 0 {
            return Err(PaseError::DimensionTooLarge {
                dimension: dim,
                max: max_dimension(),
            });
        }
        let mut components = Vec::new();
        components.try_reserve_exact(capacity * dim)?;
        let mut ids = Vec::new();
        ids.try_reserve_exact(capacity)?;
        Ok(Self {
            dim,
            components,
            ids,
            next: None,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn capacity(&self) -> usize {
        Self::vectors_per_page(self.dim)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Copy `vector` and its `id` into the next free slot.
    ///
    /// Returns `false` without writing when the page is full.
    pub fn push(&mut self, vector: &[f32], id: u32) -> bool {
        debug_assert_eq!(vector.len(), self.dim);
        if self.is_full() {
            return false;
        }
        self.components.extend_from_slice(vector);
        self.ids.push(id);
        true
    }

    pub fn vector(&self, slot: usize) -> &[f32] {
        let start = slot * self.dim;
        &self.components[start..start + self.dim]
    }

    pub fn id(&self, slot: usize) -> u32 {
        self.ids[slot]
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Stored `(vector, id)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&[f32], u32)> + '_ {
        self.components
            .chunks_exact(self.dim)
            .zip(self.ids.iter().copied())
    }
}

impl LinkedPage for DataPage {
    fn next_page(&self) -> Option<PageId> {
        self.next
    }

    fn set_next_page(&mut self, next: PageId) {
        self.next = Some(next);
    }
}

/// Largest dimension for which one vector and its id fit on a page.
pub const fn max_dimension() -> usize {
    (PAGE_SIZE - LINK_SIZE - size_of::<u32>()) / size_of::<f32>()
}

/// Owner of every page of one kind; pages are never freed individually.
#[derive(Debug, Clone)]
pub struct PageArena<P> {
    pages: Vec<P>,
}

impl<P> Default for PageArena<P> {
    fn default() -> Self {
        Self { pages: Vec::new() }
    }
}

impl<P: LinkedPage> PageArena<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `page` and return its id.
    pub fn allocate(&mut self, page: P) -> Result<PageId, PaseError> {
        let id = PageId::from_index(self.pages.len())?;
        self.pages.try_reserve(1)?;
        self.pages.push(page);
        Ok(id)
    }

    pub fn get(&self, id: PageId) -> &P {
        &self.pages[id.index()]
    }

    pub fn get_mut(&mut self, id: PageId) -> &mut P {
        &mut self.pages[id.index()]
    }

    /// Make `to` the successor of `from`.
    pub fn link(&mut self, from: PageId, to: PageId) {
        debug_assert!(!self.get(from).has_next_page());
        self.get_mut(from).set_next_page(to);
    }

    /// Walk the chain starting at `head`.
    pub fn chain(&self, head: Option<PageId>) -> ChainIter<'_, P> {
        ChainIter {
            arena: self,
            next: head,
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Forward-only iterator over a page chain.
pub struct ChainIter<'a, P> {
    arena: &'a PageArena<P>,
    next: Option<PageId>,
}

impl<'a, P: LinkedPage> Iterator for ChainIter<'a, P> {
    type Item = (PageId, &'a P);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let page = self.arena.get(id);
        self.next = page.next_page();
        Some((id, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_is_four_bytes() {
        assert_eq!(LINK_SIZE, 4);
        assert_eq!(page_capacity(4), (8192 - 4) / 4);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn centroid_page_holds_204_tuples() {
        assert_eq!(size_of::<CentroidTuple>(), 40);
        assert_eq!(CentroidPage::capacity(), 204);
    }

    #[test]
    fn data_page_capacity_for_sift_dimension() {
        // 128 floats plus one id is 516 bytes.
        assert_eq!(DataPage::vectors_per_page(128), 15);
        assert_eq!(DataPage::vectors_per_page(960), 2);
        assert_eq!(DataPage::vectors_per_page(max_dimension()), 1);
        assert_eq!(DataPage::vectors_per_page(max_dimension() + 1), 0);
        assert_eq!(DataPage::vectors_per_page(PAGE_SIZE), 0);
        assert_eq!(DataPage::vectors_per_page(usize::MAX / 2), 0);
        assert_eq!(DataPage::vectors_per_page(usize::MAX), 0);
    }

    #[test]
    fn oversized_data_page_is_rejected() {
        match DataPage::new(max_dimension() + 1) {
            Err(PaseError::DimensionTooLarge { dimension, max }) => {
                assert_eq!(dimension, max_dimension() + 1);
                assert_eq!(max, max_dimension());
            }
            other => panic!("expected DimensionTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn page_refuses_records_past_capacity() {
        let mut page: Page<u64> = Page::new().expect("page");
        for i in 0..Page::<u64>::capacity() {
            assert!(page.push(i as u64).is_ok());
        }
        assert!(page.is_full());
        assert_eq!(page.push(7), Err(7));
        assert_eq!(page.len(), Page::<u64>::capacity());
    }

    #[test]
    fn data_page_keeps_vectors_and_ids_in_parallel() {
        let mut page = DataPage::new(3).expect("page");
        assert!(page.push(&[1.0, 2.0, 3.0], 10));
        assert!(page.push(&[4.0, 5.0, 6.0], 20));
        assert_eq!(page.vector(1), &[4.0, 5.0, 6.0]);
        assert_eq!(page.id(0), 10);
        let collected: Vec<(Vec<f32>, u32)> =
            page.iter().map(|(v, id)| (v.to_vec(), id)).collect();
        assert_eq!(
            collected,
            vec![(vec![1.0, 2.0, 3.0], 10), (vec![4.0, 5.0, 6.0], 20)]
        );
    }

    #[test]
    fn chain_walks_forward_in_link_order() {
        let mut arena = PageArena::new();
        let first = arena.allocate(DataPage::new(2).expect("page")).expect("alloc");
        let second = arena.allocate(DataPage::new(2).expect("page")).expect("alloc");
        let third = arena.allocate(DataPage::new(2).expect("page")).expect("alloc");
        arena.link(first, third);
        arena.link(third, second);

        let order: Vec<PageId> = arena.chain(Some(first)).map(|(id, _)| id).collect();
        assert_eq!(order, vec![first, third, second]);
        assert!(!arena.get(second).has_next_page());
        assert_eq!(arena.chain(None).count(), 0);
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
    }
}
