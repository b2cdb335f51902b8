//! Dense row-major matrices and their binary files.
//!
//! # File Format
//!
//! ```text
//! [ROWS u32][COLS u32][ELEMENTS rows * cols, little-endian, row-major]
//! ```
//!
//! The element type is carried by the file extension: `.fbin` f32, `.dbin`
//! f64, `.hbin` f16, `.ibin` i32, `.bbin` u8.

use crate::error::{Result, ShardexError};
use half::f16;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Types that can be stored in a matrix file.
pub trait MatrixElement: Copy + Default + Send + Sync + 'static {
    /// Bytes per element.
    const SIZE: usize;
    /// File extension, without the dot.
    const EXTENSION: &'static str;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! matrix_element {
    ($ty:ty, $size:expr, $ext:expr) => {
        impl MatrixElement for $ty {
            const SIZE: usize = $size;
            const EXTENSION: &'static str = $ext;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; $size];
                raw.copy_from_slice(&bytes[..$size]);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

matrix_element!(f32, 4, "fbin");
matrix_element!(f64, 8, "dbin");
matrix_element!(f16, 2, "hbin");
matrix_element!(i32, 4, "ibin");
matrix_element!(u8, 1, "bbin");

/// Row-major dense matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy> Matrix<T> {
    /// Wrap `data` as a `rows x cols` matrix.
    ///
    /// # Errors
    /// `DimensionMismatch` if `data.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(ShardexError::dimension_mismatch(rows * cols, data.len()));
        }
        Ok(Self { rows, cols, data })
    }

    /// Caller guarantees `data.len() == rows * cols`.
    pub(crate) fn from_parts(rows: usize, cols: usize, data: Vec<T>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }

    /// Stack equally long rows.
    ///
    /// # Errors
    /// `DimensionMismatch` if the rows differ in length.
    pub fn from_rows(rows: &[Vec<T>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(ShardexError::dimension_mismatch(cols, row.len()));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Row `i`.
    ///
    /// # Panics
    /// Panics if `i >= rows()`.
    #[inline]
    pub fn row(&self, i: usize) -> &[T] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[T]> + '_ {
        (0..self.rows).map(move |i| self.row(i))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

fn check_extension<T: MatrixElement>(path: &Path) -> Result<()> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if extension != T::EXTENSION {
        return Err(ShardexError::invalid_parameter(format!(
            "'{}' does not carry the .{} extension of this element type",
            path.display(),
            T::EXTENSION
        )));
    }
    Ok(())
}

/// Write `matrix` to `path`.
///
/// # Errors
/// `InvalidParameter` if the extension does not match `T`, `Io` on write
/// failure.
pub fn save_matrix<T: MatrixElement>(path: impl AsRef<Path>, matrix: &Matrix<T>) -> Result<()> {
    let path = path.as_ref();
    check_extension::<T>(path)?;
    let rows = u32::try_from(matrix.rows)
        .map_err(|_| ShardexError::invalid_parameter("row count exceeds u32"))?;
    let cols = u32::try_from(matrix.cols)
        .map_err(|_| ShardexError::invalid_parameter("column count exceeds u32"))?;

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&rows.to_le_bytes())?;
    writer.write_all(&cols.to_le_bytes())?;
    let mut buf = Vec::with_capacity(matrix.cols * T::SIZE);
    for row in matrix.iter_rows() {
        buf.clear();
        for &value in row {
            value.write_le(&mut buf);
        }
        writer.write_all(&buf)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a matrix of `T` from `path`.
///
/// # Errors
/// `InvalidParameter` if the extension does not match `T`, `InvalidFormat`
/// if the payload length disagrees with the header, `Io` on read failure.
pub fn load_matrix<T: MatrixElement>(path: impl AsRef<Path>) -> Result<Matrix<T>> {
    let path = path.as_ref();
    check_extension::<T>(path)?;

    let mut reader = BufReader::new(File::open(path)?);
    let mut header = [0u8; 8];
    reader.read_exact(&mut header)?;
    let rows = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let cols = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let mut payload = Vec::new();
    reader.read_to_end(&mut payload)?;
    let expected = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(T::SIZE))
        .ok_or_else(|| ShardexError::invalid_format("matrix dimensions overflow"))?;
    if payload.len() != expected {
        return Err(ShardexError::invalid_format(format!(
            "matrix {rows}x{cols} needs {expected} bytes, file holds {}",
            payload.len()
        )));
    }

    let data = payload.chunks_exact(T::SIZE).map(T::read_le).collect();
    Matrix::new(rows, cols, data)
}
