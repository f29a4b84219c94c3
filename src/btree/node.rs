use std::cmp::Ordering;
use std::sync::{RwLockReadGuard, RwLockWriteGuard};

use bytes::{Buf, BufMut};

use crate::storage::page_id::{PageId, NULL_PAGE_ID};

use super::tuple::{Cell, KeyDescriptor, Tuple, TupleScheme, CELL_SIZE};

/// header: height u32 | n_entries u32 | right_sibling u64
pub const NODE_HEADER_SIZE: usize = 16;

/// Positioning discipline among equal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupSeek {
    /// Any equal entry; deterministic (the first one).
    Any,
    /// The first equal entry.
    Begin,
    /// The position after the last equal entry; may equal `n_entries`.
    End,
}

/// Per-tree constants needed to interpret a page as a node. Leaf entries
/// hold the full row; internal entries hold the projected key plus a child
/// page id.
#[derive(Debug, Clone)]
pub struct NodeLayout {
    pub page_size: usize,
    pub scheme: TupleScheme,
    pub key: KeyDescriptor,
}

impl NodeLayout {
    pub fn new(page_size: usize, scheme: TupleScheme, key: KeyDescriptor) -> Self {
        let layout = Self {
            page_size,
            scheme,
            key,
        };
        assert!(layout.leaf_capacity() >= 2, "page too small for two rows");
        assert!(layout.internal_capacity() >= 2);
        layout
    }

    pub fn leaf_entry_size(&self) -> usize {
        self.scheme.tuple_size()
    }

    pub fn internal_entry_size(&self) -> usize {
        self.key.key_size() + 8
    }

    pub fn leaf_capacity(&self) -> usize {
        (self.page_size - NODE_HEADER_SIZE) / self.leaf_entry_size()
    }

    pub fn internal_capacity(&self) -> usize {
        (self.page_size - NODE_HEADER_SIZE) / self.internal_entry_size()
    }
}

fn read_height(data: &[u8]) -> u32 {
    (&data[0..4]).get_u32_le()
}

fn read_n_entries(data: &[u8]) -> usize {
    (&data[4..8]).get_u32_le() as usize
}

fn read_right_sibling(data: &[u8]) -> PageId {
    PageId((&data[8..16]).get_u64_le())
}

fn entry_size(data: &[u8], layout: &NodeLayout) -> usize {
    if read_height(data) == 0 {
        layout.leaf_entry_size()
    } else {
        layout.internal_entry_size()
    }
}

fn entry_offset(data: &[u8], layout: &NodeLayout, i: usize) -> usize {
    NODE_HEADER_SIZE + i * entry_size(data, layout)
}

fn read_cell_at(data: &[u8], offset: usize) -> Cell {
    Cell((&data[offset..offset + CELL_SIZE]).get_i64_le())
}

/// Key cell `j` (comparison order) of entry `i`.
fn read_key_cell(data: &[u8], layout: &NodeLayout, i: usize, j: usize) -> Cell {
    let off = entry_offset(data, layout, i);
    if read_height(data) == 0 {
        let field = layout.key.projection()[j];
        read_cell_at(data, off + field * CELL_SIZE)
    } else {
        read_cell_at(data, off + j * CELL_SIZE)
    }
}

fn read_key_cells(data: &[u8], layout: &NodeLayout, i: usize) -> Vec<Cell> {
    (0..layout.key.width())
        .map(|j| read_key_cell(data, layout, i, j))
        .collect()
}

/// Ordering of the search key relative to entry `i`'s key. On the rightmost
/// internal node of a level, the final entry is an infinity upper bound: it
/// compares greater than every search key, whatever bytes it stores.
fn cmp_search_vs_entry(
    data: &[u8],
    layout: &NodeLayout,
    search_key: &[Cell],
    i: usize,
) -> Ordering {
    let height = read_height(data);
    if height > 0
        && read_right_sibling(data).is_null()
        && i + 1 == read_n_entries(data)
    {
        return Ordering::Less;
    }

    for (j, s) in search_key.iter().enumerate() {
        match s.cmp(&read_key_cell(data, layout, i, j)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Binary search over a node's sorted entries.
///
/// With `least_upper` true the result is the smallest index whose key is
/// `>= search_key`; with it false, the largest index whose key is
/// `<= search_key`. `DupSeek` resolves the position among equal keys; the
/// returned flag tells whether an exact match exists on this node.
fn binary_search(
    data: &[u8],
    layout: &NodeLayout,
    search_key: &[Cell],
    dup_seek: DupSeek,
    least_upper: bool,
) -> (usize, bool) {
    let n = read_n_entries(data);

    // lower: first entry >= key; upper: first entry > key
    let mut lo = 0;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if cmp_search_vs_entry(data, layout, search_key, mid) == Ordering::Greater {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let lower = lo;

    let mut lo = lower;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if cmp_search_vs_entry(data, layout, search_key, mid) == Ordering::Less {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    let upper = lo;

    let found = lower < upper;
    let i = if found {
        match dup_seek {
            DupSeek::Any | DupSeek::Begin => lower,
            DupSeek::End => upper,
        }
    } else if least_upper {
        lower
    } else {
        lower.saturating_sub(1)
    };
    (i, found)
}

/// Read-only interpretation of a locked page's bytes as a B-Tree node.
pub struct NodeView<'a> {
    data: RwLockReadGuard<'a, Vec<u8>>,
    layout: NodeLayout,
}

impl<'a> NodeView<'a> {
    pub fn new(data: RwLockReadGuard<'a, Vec<u8>>, layout: NodeLayout) -> Self {
        Self { data, layout }
    }

    pub fn height(&self) -> u32 {
        read_height(&self.data)
    }

    pub fn is_leaf(&self) -> bool {
        self.height() == 0
    }

    pub fn n_entries(&self) -> usize {
        read_n_entries(&self.data)
    }

    pub fn right_sibling(&self) -> PageId {
        read_right_sibling(&self.data)
    }

    pub fn capacity(&self) -> usize {
        if self.is_leaf() {
            self.layout.leaf_capacity()
        } else {
            self.layout.internal_capacity()
        }
    }

    pub fn binary_search(
        &self,
        search_key: &[Cell],
        dup_seek: DupSeek,
        least_upper: bool,
    ) -> (usize, bool) {
        binary_search(&self.data, &self.layout, search_key, dup_seek, least_upper)
    }

    /// Sign of the search key compared against entry 0.
    pub fn compare_first_key(&self, search_key: &[Cell]) -> Ordering {
        assert!(self.n_entries() > 0);
        cmp_search_vs_entry(&self.data, &self.layout, search_key, 0)
    }

    pub fn key_cells(&self, i: usize) -> Vec<Cell> {
        assert!(i < self.n_entries());
        read_key_cells(&self.data, &self.layout, i)
    }

    /// Materialize leaf entry `i` as a row.
    pub fn tuple(&self, i: usize) -> Tuple {
        assert!(self.is_leaf());
        assert!(i < self.n_entries());
        let off = entry_offset(&self.data, &self.layout, i);
        Tuple::decode(
            &self.data[off..off + self.layout.leaf_entry_size()],
            self.layout.scheme.n_fields,
        )
    }

    pub fn child(&self, i: usize) -> PageId {
        assert!(!self.is_leaf());
        assert!(i < self.n_entries());
        let off = entry_offset(&self.data, &self.layout, i) + self.layout.key.key_size();
        PageId((&self.data[off..off + 8]).get_u64_le())
    }

    pub fn find_child(&self, pid: PageId) -> Option<usize> {
        (0..self.n_entries()).find(|&i| self.child(i) == pid)
    }

    /// Raw bytes of entries `[from, to)`, for staging a split image.
    pub fn entries_bytes(&self, from: usize, to: usize) -> &[u8] {
        assert!(from <= to && to <= self.n_entries());
        let esz = entry_size(&self.data, &self.layout);
        let start = NODE_HEADER_SIZE + from * esz;
        let end = NODE_HEADER_SIZE + to * esz;
        &self.data[start..end]
    }
}

/// Mutable interpretation; requires the page latched EXCLUSIVE.
pub struct NodeViewMut<'a> {
    data: RwLockWriteGuard<'a, Vec<u8>>,
    layout: NodeLayout,
}

impl<'a> NodeViewMut<'a> {
    pub fn new(data: RwLockWriteGuard<'a, Vec<u8>>, layout: NodeLayout) -> Self {
        Self { data, layout }
    }

    pub fn height(&self) -> u32 {
        read_height(&self.data)
    }

    pub fn is_leaf(&self) -> bool {
        self.height() == 0
    }

    pub fn n_entries(&self) -> usize {
        read_n_entries(&self.data)
    }

    pub fn right_sibling(&self) -> PageId {
        read_right_sibling(&self.data)
    }

    pub fn capacity(&self) -> usize {
        if self.is_leaf() {
            self.layout.leaf_capacity()
        } else {
            self.layout.internal_capacity()
        }
    }

    pub fn key_cells(&self, i: usize) -> Vec<Cell> {
        assert!(i < self.n_entries());
        read_key_cells(&self.data, &self.layout, i)
    }

    /// Format the page as a fresh, empty node of the given height.
    pub fn init(&mut self, height: u32) {
        for b in self.data.iter_mut() {
            *b = 0;
        }
        self.set_height(height);
        self.set_right_sibling(NULL_PAGE_ID);
    }

    pub fn set_height(&mut self, height: u32) {
        (&mut self.data[0..4]).put_u32_le(height);
    }

    fn set_n_entries(&mut self, n: usize) {
        (&mut self.data[4..8]).put_u32_le(n as u32);
    }

    pub fn set_right_sibling(&mut self, pid: PageId) {
        (&mut self.data[8..16]).put_u64_le(pid.0);
    }

    fn shift_right_from(&mut self, i: usize) {
        let esz = entry_size(&self.data, &self.layout);
        let n = self.n_entries();
        let start = NODE_HEADER_SIZE + i * esz;
        let end = NODE_HEADER_SIZE + n * esz;
        self.data.copy_within(start..end, start + esz);
    }

    pub fn insert_leaf_entry(&mut self, i: usize, tuple: &Tuple) {
        assert!(self.is_leaf());
        let n = self.n_entries();
        assert!(i <= n && n < self.capacity());
        assert_eq!(tuple.n_cells(), self.layout.scheme.n_fields);

        self.shift_right_from(i);
        let off = entry_offset(&self.data, &self.layout, i);
        let esz = self.layout.leaf_entry_size();
        tuple.encode(&mut self.data[off..off + esz]);
        self.set_n_entries(n + 1);
    }

    pub fn insert_internal_entry(&mut self, i: usize, key_cells: &[Cell], child: PageId) {
        assert!(!self.is_leaf());
        let n = self.n_entries();
        assert!(i <= n && n < self.capacity());
        assert_eq!(key_cells.len(), self.layout.key.width());

        self.shift_right_from(i);
        let off = entry_offset(&self.data, &self.layout, i);
        {
            let mut buf = &mut self.data[off..off + self.layout.internal_entry_size()];
            for cell in key_cells {
                buf.put_i64_le(cell.0);
            }
            buf.put_u64_le(child.0);
        }
        self.set_n_entries(n + 1);
    }

    pub fn set_child(&mut self, i: usize, pid: PageId) {
        assert!(!self.is_leaf());
        assert!(i < self.n_entries());
        let off = entry_offset(&self.data, &self.layout, i) + self.layout.key.key_size();
        (&mut self.data[off..off + 8]).put_u64_le(pid.0);
    }

    pub fn update_tuple(&mut self, i: usize, tuple: &Tuple) {
        assert!(self.is_leaf());
        assert!(i < self.n_entries());
        let off = entry_offset(&self.data, &self.layout, i);
        let esz = self.layout.leaf_entry_size();
        tuple.encode(&mut self.data[off..off + esz]);
    }

    pub fn remove_entry(&mut self, i: usize) {
        let n = self.n_entries();
        assert!(i < n);
        let esz = entry_size(&self.data, &self.layout);
        let start = NODE_HEADER_SIZE + (i + 1) * esz;
        let end = NODE_HEADER_SIZE + n * esz;
        self.data.copy_within(start..end, start - esz);
        self.set_n_entries(n - 1);
    }

    /// Keep entries `[0, n)`, drop the rest.
    pub fn truncate(&mut self, n: usize) {
        assert!(n <= self.n_entries());
        self.set_n_entries(n);
    }

    /// Raw bytes of entries `[from, to)`, for staging a split image.
    pub fn entries_bytes(&self, from: usize, to: usize) -> &[u8] {
        assert!(from <= to && to <= self.n_entries());
        let esz = entry_size(&self.data, &self.layout);
        let start = NODE_HEADER_SIZE + from * esz;
        let end = NODE_HEADER_SIZE + to * esz;
        &self.data[start..end]
    }

    /// Replace the whole page with a staged image.
    pub fn load_image(&mut self, image: &[u8]) {
        assert_eq!(image.len(), self.data.len());
        self.data.copy_from_slice(image);
    }
}

/// Build a complete node image in a scratch frame: header plus a run of
/// already-encoded entries.
pub fn stage_node_image(
    buf: &mut [u8],
    height: u32,
    right_sibling: PageId,
    n_entries: usize,
    entries_bytes: &[u8],
) {
    for b in buf.iter_mut() {
        *b = 0;
    }
    {
        let mut header = &mut buf[0..NODE_HEADER_SIZE];
        header.put_u32_le(height);
        header.put_u32_le(n_entries as u32);
        header.put_u64_le(right_sibling.0);
    }
    buf[NODE_HEADER_SIZE..NODE_HEADER_SIZE + entries_bytes.len()].copy_from_slice(entries_bytes);
}
