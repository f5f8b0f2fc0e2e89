use std::fs::File;
use std::io::{BufRead, BufReader, Read};

use camino::Utf8Path;

use crate::error::KiraError;

/// Read-only point lookup into a single-band raster.
pub trait Raster: Send + Sync {
    /// Cell value at map coordinates `(x, y)`, or `None` outside the covered extent.
    fn sample(&self, x: f64, y: f64) -> Option<i32>;
}

/// North-up grid held in memory, row 0 at the top edge.
#[derive(Debug, Clone, PartialEq)]
pub struct GridRaster {
    origin_x: f64,
    origin_y: f64,
    cell_size: f64,
    rows: usize,
    cols: usize,
    values: Vec<i32>,
}

impl GridRaster {
    /// `origin_x`/`origin_y` are the map coordinates of the top-left corner.
    pub fn new(
        origin_x: f64,
        origin_y: f64,
        cell_size: f64,
        rows: usize,
        cols: usize,
        values: Vec<i32>,
    ) -> Result<Self, KiraError> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(KiraError::Raster(format!("invalid cell size {cell_size}")));
        }
        let cells = rows
            .checked_mul(cols)
            .ok_or_else(|| KiraError::Raster(format!("grid {rows}x{cols} is too large")))?;
        if values.len() != cells {
            return Err(KiraError::Raster(format!(
                "expected {cells} cells for {rows}x{cols}, got {}",
                values.len()
            )));
        }
        Ok(Self {
            origin_x,
            origin_y,
            cell_size,
            rows,
            cols,
            values,
        })
    }

    pub fn open(path: &Utf8Path) -> Result<Self, KiraError> {
        let file = File::open(path.as_std_path())
            .map_err(|err| KiraError::Raster(format!("open {path}: {err}")))?;
        Self::from_ascii_grid(BufReader::new(file))
    }

    /// Parses an ESRI ASCII grid. The file's NODATA value is mapped to 0.
    pub fn from_ascii_grid<R: Read>(reader: BufReader<R>) -> Result<Self, KiraError> {
        let mut ncols = None;
        let mut nrows = None;
        let mut xll = None;
        let mut yll = None;
        let mut centered = false;
        let mut cell_size = None;
        let mut nodata: Option<f64> = None;
        let mut values = Vec::new();

        for line in reader.lines() {
            let line = line.map_err(|err| KiraError::Raster(err.to_string()))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let first = trimmed.split_whitespace().next().unwrap_or("");
            if first.starts_with(|ch: char| ch.is_ascii_alphabetic()) {
                let value = trimmed
                    .split_whitespace()
                    .nth(1)
                    .ok_or_else(|| KiraError::Raster(format!("header without value: {trimmed}")))?;
                let number: f64 = value
                    .parse()
                    .map_err(|_| KiraError::Raster(format!("invalid header value: {trimmed}")))?;
                match first.to_ascii_lowercase().as_str() {
                    "ncols" => ncols = Some(grid_count(number, trimmed)?),
                    "nrows" => nrows = Some(grid_count(number, trimmed)?),
                    "xllcorner" => xll = Some(number),
                    "yllcorner" => yll = Some(number),
                    "xllcenter" => {
                        xll = Some(number);
                        centered = true;
                    }
                    "yllcenter" => {
                        yll = Some(number);
                        centered = true;
                    }
                    "cellsize" => cell_size = Some(number),
                    "nodata_value" => nodata = Some(number),
                    other => {
                        return Err(KiraError::Raster(format!("unknown header key: {other}")));
                    }
                }
                continue;
            }
            for token in trimmed.split_whitespace() {
                let number: f64 = token
                    .parse()
                    .map_err(|_| KiraError::Raster(format!("invalid cell value: {token}")))?;
                let cell = if nodata == Some(number) { 0 } else { number as i32 };
                values.push(cell);
            }
        }

        let missing = |name: &str| KiraError::Raster(format!("missing header {name}"));
        let cols = ncols.ok_or_else(|| missing("ncols"))?;
        let rows = nrows.ok_or_else(|| missing("nrows"))?;
        let cell_size = cell_size.ok_or_else(|| missing("cellsize"))?;
        let mut origin_x = xll.ok_or_else(|| missing("xllcorner"))?;
        let mut bottom_y = yll.ok_or_else(|| missing("yllcorner"))?;
        if centered {
            origin_x -= cell_size / 2.0;
            bottom_y -= cell_size / 2.0;
        }
        let origin_y = bottom_y + rows as f64 * cell_size;
        Self::new(origin_x, origin_y, cell_size, rows, cols, values)
    }

    /// `(row, col)` of the cell containing `(x, y)`.
    pub fn index(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !(x.is_finite() && y.is_finite()) {
            return None;
        }
        let col = ((x - self.origin_x) / self.cell_size).floor();
        let row = ((self.origin_y - y) / self.cell_size).floor();
        if col < 0.0 || row < 0.0 || col >= self.cols as f64 || row >= self.rows as f64 {
            return None;
        }
        Some((row as usize, col as usize))
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }
}

/// Row or column count from a header line; must be a whole number that fits in memory.
fn grid_count(number: f64, line: &str) -> Result<usize, KiraError> {
    if !(number.is_finite() && number >= 0.0 && number.fract() == 0.0 && number <= u32::MAX as f64) {
        return Err(KiraError::Raster(format!("invalid grid size: {line}")));
    }
    Ok(number as usize)
}

impl Raster for GridRaster {
    fn sample(&self, x: f64, y: f64) -> Option<i32> {
        let (row, col) = self.index(x, y)?;
        self.values.get(row * self.cols + col).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRID: &str = "ncols 3
nrows 2
xllcorner 0
yllcorner 0
cellsize 10
NODATA_value -9999
11 12 -9999
14 15 16
";

    #[test]
    fn parses_ascii_grid() {
        let raster = GridRaster::from_ascii_grid(BufReader::new(GRID.as_bytes())).unwrap();
        assert_eq!(raster.shape(), (2, 3));
        assert_eq!(raster.sample(5.0, 15.0), Some(11));
        assert_eq!(raster.sample(25.0, 15.0), Some(0));
        assert_eq!(raster.sample(25.0, 5.0), Some(16));
    }

    #[test]
    fn outside_extent_is_none() {
        let raster = GridRaster::from_ascii_grid(BufReader::new(GRID.as_bytes())).unwrap();
        assert_eq!(raster.sample(-0.1, 5.0), None);
        assert_eq!(raster.sample(30.0, 5.0), None);
        assert_eq!(raster.sample(5.0, 20.0), None);
        assert_eq!(raster.sample(5.0, -1.0), None);
        assert_eq!(raster.sample(f64::NAN, 5.0), None);
    }

    #[test]
    fn rejects_bad_grid_sizes() {
        let huge = "ncols 1e30\nnrows 1e30\nxllcorner 0\nyllcorner 0\ncellsize 1\n1\n";
        let err = GridRaster::from_ascii_grid(BufReader::new(huge.as_bytes())).unwrap_err();
        assert!(err.to_string().contains("invalid grid size"));

        for header in ["ncols -2", "ncols 2.5"] {
            let grid = format!("{header}\nnrows 1\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2\n");
            let err = GridRaster::from_ascii_grid(BufReader::new(grid.as_bytes())).unwrap_err();
            assert!(err.to_string().contains("invalid grid size"), "{header}");
        }

        let err = GridRaster::new(0.0, 0.0, 1.0, usize::MAX, 2, Vec::new()).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn rejects_wrong_cell_count() {
        let err = GridRaster::new(0.0, 0.0, 1.0, 2, 2, vec![1, 2, 3]).unwrap_err();
        assert!(err.to_string().contains("expected 4 cells"));
    }
}
