use crate::error::{Error, Result};
use crate::measurement::CellValue;
use crate::protocol::FrameDecodeError;

/// Cells per battery module, one matrix row per cell.
pub const CELLS_PER_MODULE: usize = 12;
/// Battery modules, one matrix column per module.
pub const MODULES: usize = 8;

// Cell ids are a single byte on the wire
const MAX_CELLS: usize = u8::MAX as usize + 1;

/// Dimensions of the cell matrix. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    rows: usize,
    columns: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            rows: CELLS_PER_MODULE,
            columns: MODULES,
        }
    }
}

impl Geometry {
    pub fn new(rows: usize, columns: usize) -> Result<Self> {
        if rows == 0 || columns == 0 || rows * columns > MAX_CELLS {
            return Err(Error::InvalidGeometry { rows, columns });
        }
        Ok(Self { rows, columns })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn capacity(&self) -> usize {
        self.rows * self.columns
    }

    /// Maps a cell id to its position: the row is the cell within its module,
    /// the column is the module.
    pub fn locate(&self, cell_id: u8) -> std::result::Result<CellCoordinate, FrameDecodeError> {
        let id = usize::from(cell_id);
        if id >= self.capacity() {
            return Err(FrameDecodeError::CellIdOutOfRange {
                cell_id,
                capacity: self.capacity(),
            });
        }
        Ok(CellCoordinate {
            row: id % self.rows,
            column: id / self.rows,
        })
    }

    /// Column headings, "Module 1" to "Module N".
    pub fn column_labels(&self) -> Vec<String> {
        (1..=self.columns).map(|i| format!("Module {i}")).collect()
    }

    fn index(&self, coord: CellCoordinate) -> usize {
        assert!(
            coord.row < self.rows && coord.column < self.columns,
            "cell {coord:?} outside of {}x{} matrix",
            self.rows,
            self.columns
        );
        coord.row * self.columns + coord.column
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellCoordinate {
    pub row: usize,
    pub column: usize,
}

/// Last known value of every cell, stored row-major.
#[derive(Debug, Clone)]
pub struct CellMatrix {
    geometry: Geometry,
    cells: Vec<CellValue>,
}

impl CellMatrix {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            cells: vec![CellValue::Unknown; geometry.capacity()],
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn reset(&mut self) {
        self.cells.fill(CellValue::Unknown);
    }

    /// Stores `value` and returns whether it differs from the previous one.
    ///
    /// Panics if `coord` lies outside the matrix.
    pub fn set(&mut self, coord: CellCoordinate, value: CellValue) -> bool {
        let cell = &mut self.cells[self.geometry.index(coord)];
        if *cell == value {
            return false;
        }
        *cell = value;
        true
    }

    pub fn get(&self, coord: CellCoordinate) -> CellValue {
        self.cells[self.geometry.index(coord)]
    }

    /// Values of `row`, or `None` past the last row.
    pub fn row(&self, row: usize) -> Option<&[CellValue]> {
        let columns = self.geometry.columns;
        self.cells.get(row * columns..(row + 1) * columns)
    }

    /// Coordinates of all cells holding a reading.
    pub fn known(&self) -> Vec<CellCoordinate> {
        let columns = self.geometry.columns;
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, value)| value.is_known())
            .map(|(i, _)| CellCoordinate {
                row: i / columns,
                column: i % columns,
            })
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            geometry: self.geometry,
            cells: self.cells.clone(),
        }
    }
}

/// Immutable copy of a [`CellMatrix`] taken at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    geometry: Geometry,
    cells: Vec<CellValue>,
}

impl Snapshot {
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn get(&self, coord: CellCoordinate) -> CellValue {
        self.cells[self.geometry.index(coord)]
    }

    /// Values of `row`, or `None` past the last row.
    pub fn row(&self, row: usize) -> Option<&[CellValue]> {
        let columns = self.geometry.columns;
        self.cells.get(row * columns..(row + 1) * columns)
    }

    /// Rows in order, each holding one value per module.
    pub fn rows(&self) -> impl Iterator<Item = &[CellValue]> {
        self.cells.chunks(self.geometry.columns)
    }

    /// All values, row-major.
    pub fn values(&self) -> &[CellValue] {
        &self.cells
    }
}
