use core::fmt;
use std::cmp::Ordering;

use bytes::{Buf, BufMut};

pub const CELL_SIZE: usize = 8;

/// A single fixed-width field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cell(pub i64);

impl Cell {
    pub fn new(v: i64) -> Self {
        Cell(v)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shape of the rows stored in a tree. All fields are fixed-width integers,
/// so the on-page entry size is a constant per tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleScheme {
    pub n_fields: usize,
}

impl TupleScheme {
    pub fn new(n_fields: usize) -> Self {
        assert!(n_fields > 0);
        Self { n_fields }
    }

    pub fn tuple_size(&self) -> usize {
        self.n_fields * CELL_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    cells: Vec<Cell>,
}

impl Tuple {
    pub fn new(cells: Vec<Cell>) -> Self {
        assert!(!cells.is_empty());
        Self { cells }
    }

    /// Row of `n_fields` cells, every field set to `value`. Handy for tests
    /// and single-column trees.
    pub fn new_int_tuple(value: i64, n_fields: usize) -> Self {
        Self::new(vec![Cell(value); n_fields])
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn get_cell(&self, i: usize) -> Cell {
        self.cells[i]
    }

    pub fn set_cell(&mut self, i: usize, cell: Cell) {
        self.cells[i] = cell;
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn encode(&self, mut buf: &mut [u8]) {
        assert!(buf.len() >= self.cells.len() * CELL_SIZE);
        for cell in &self.cells {
            buf.put_i64_le(cell.0);
        }
    }

    pub fn decode(mut buf: &[u8], n_fields: usize) -> Self {
        let mut cells = Vec::with_capacity(n_fields);
        for _ in 0..n_fields {
            cells.push(Cell(buf.get_i64_le()));
        }
        Self { cells }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (i, cell) in self.cells.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", cell)?;
        }
        write!(f, ")")
    }
}

/// Total order over the key fields of a tree. The projection lists the
/// tuple fields that make up the key, in comparison order. A search key may
/// be a prefix of the full key shape (partial-key search).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    projection: Vec<usize>,
}

impl KeyDescriptor {
    pub fn new(projection: Vec<usize>) -> Self {
        assert!(!projection.is_empty());
        Self { projection }
    }

    pub fn width(&self) -> usize {
        self.projection.len()
    }

    pub fn projection(&self) -> &[usize] {
        &self.projection
    }

    pub fn key_size(&self) -> usize {
        self.projection.len() * CELL_SIZE
    }

    /// Key cells of a stored row, in comparison order.
    pub fn project(&self, tuple: &Tuple) -> Vec<Cell> {
        self.projection.iter().map(|&i| tuple.get_cell(i)).collect()
    }

    /// Compare a (possibly partial) search key against full key cells.
    /// A search key that matches on every one of its fields compares equal.
    pub fn compare(&self, search_key: &[Cell], key_cells: &[Cell]) -> Ordering {
        assert!(search_key.len() <= self.width());
        assert_eq!(key_cells.len(), self.width());
        for (s, k) in search_key.iter().zip(key_cells.iter()) {
            match s.cmp(k) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    pub fn is_partial(&self, search_key: &[Cell]) -> bool {
        search_key.len() < self.width()
    }
}
