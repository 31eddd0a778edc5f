//! Tensor implementation
//!
//! This module provides the core `Tensor` type: a 2-D, row-major buffer of
//! `f32` that either owns its storage or views a buffer owned elsewhere
//! (typically the memory-mapped checkpoint).
//!
//! Views carry the lifetime of the buffer they alias, so the borrow checker
//! guarantees a view can never outlive its backing storage, and nothing is
//! ever freed through a view.

use std::fmt;

use rayon::prelude::*;

use crate::error::{InferError, Result};

/// Output cells computed per rayon task in [`Tensor::matmul`]
const MATMUL_MIN_CELLS_PER_TASK: usize = 64;

/// Backing storage of a [`Tensor`]
pub enum Storage<'a> {
    /// Exclusively held buffer, freed when the tensor is dropped
    Owned(Vec<f32>),
    /// Read-only alias of a buffer owned elsewhere
    View(&'a [f32]),
}

/// 2-D tensor of `f32` with owned or borrowed storage
///
/// # Examples
///
/// ```
/// use tinyinfer::Tensor;
///
/// // Create a 2×3 tensor
/// let t = Tensor::from_vec(2, 3, vec![
///     1.0, 2.0, 3.0,
///     4.0, 5.0, 6.0,
/// ]).unwrap();
///
/// assert_eq!(t.shape(), (2, 3));
/// assert_eq!(t.len(), 6);
/// assert!(!t.is_view());
/// ```
pub struct Tensor<'a> {
    storage: Storage<'a>,
    rows: usize,
    cols: usize,
}

impl<'a> Tensor<'a> {
    /// Create a zero-copy view over `buffer`
    ///
    /// The view covers the first `rows * cols` elements of `buffer`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `buffer` holds fewer than `rows * cols`
    /// elements or the product overflows.
    ///
    /// # Examples
    ///
    /// ```
    /// use tinyinfer::Tensor;
    ///
    /// let weights = vec![1.0, 2.0, 3.0, 4.0, 5.0];
    /// let t = Tensor::view(&weights, 2, 2).unwrap();
    /// assert!(t.is_view());
    /// assert_eq!(t.data(), &[1.0, 2.0, 3.0, 4.0]);
    /// ```
    pub fn view(buffer: &'a [f32], rows: usize, cols: usize) -> Result<Self> {
        let size = element_count(rows, cols)?;
        if buffer.len() < size {
            return Err(InferError::InvalidShape {
                reason: format!(
                    "View of {rows}x{cols} needs {size} elements, buffer has {}",
                    buffer.len()
                ),
            });
        }

        Ok(Self {
            storage: Storage::View(&buffer[..size]),
            rows,
            cols,
        })
    }

    /// Create an owned tensor from a vector
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `data.len() != rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(InferError::InvalidShape {
                reason: format!(
                    "Data size {} doesn't match shape {rows}x{cols}",
                    data.len()
                ),
            });
        }

        Ok(Self {
            storage: Storage::Owned(data),
            rows,
            cols,
        })
    }

    /// Create an owned tensor filled with `value`
    #[must_use]
    pub fn filled(rows: usize, cols: usize, value: f32) -> Self {
        Self {
            storage: Storage::Owned(vec![value; rows * cols]),
            rows,
            cols,
        }
    }

    /// Create an owned tensor of zeros
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    /// Shape as `(rows, cols)`
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of rows
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (row length)
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// True if the tensor has no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the tensor aliases storage owned elsewhere
    #[must_use]
    pub fn is_view(&self) -> bool {
        matches!(self.storage, Storage::View(_))
    }

    /// Elements in row-major order
    #[must_use]
    pub fn data(&self) -> &[f32] {
        match &self.storage {
            Storage::Owned(data) => data,
            Storage::View(data) => data,
        }
    }

    /// Mutable elements in row-major order
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` for views; only owned tensors are
    /// writable.
    pub fn data_mut(&mut self) -> Result<&mut [f32]> {
        match &mut self.storage {
            Storage::Owned(data) => Ok(data),
            Storage::View(_) => Err(InferError::UnsupportedOperation {
                operation: "data_mut".to_string(),
                reason: "tensor is a read-only view".to_string(),
            }),
        }
    }

    fn flat_index(&self, row: usize, col: usize) -> Result<usize> {
        if row >= self.rows {
            return Err(InferError::IndexOutOfBounds {
                index: row,
                len: self.rows,
            });
        }
        if col >= self.cols {
            return Err(InferError::IndexOutOfBounds {
                index: col,
                len: self.cols,
            });
        }
        Ok(row * self.cols + col)
    }

    /// Element at `(row, col)`
    ///
    /// # Errors
    ///
    /// Returns `IndexOutOfBounds` if either index is outside the shape.
    pub fn get(&self, row: usize, col: usize) -> Result<f32> {
        let idx = self.flat_index(row, col)?;
        Ok(self.data()[idx])
    }

    /// Set the element at `(row, col)`
    ///
    /// # Errors
    ///
    /// Returns `IndexOutOfBounds` for a bad index and `UnsupportedOperation`
    /// for views.
    pub fn set(&mut self, row: usize, col: usize, value: f32) -> Result<()> {
        let idx = self.flat_index(row, col)?;
        self.data_mut()?[idx] = value;
        Ok(())
    }

    /// Reinterpret the elements with a new shape
    ///
    /// Element count and order are unchanged; only the index mapping moves.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `rows * cols` differs from the current
    /// element count.
    ///
    /// # Examples
    ///
    /// ```
    /// use tinyinfer::Tensor;
    ///
    /// let mut t = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    /// t.reshape(2, 2).unwrap();
    /// assert_eq!(t.get(1, 0).unwrap(), 3.0);
    /// assert!(t.reshape(3, 1).is_err());
    /// ```
    pub fn reshape(&mut self, rows: usize, cols: usize) -> Result<()> {
        if rows.checked_mul(cols) != Some(self.len()) {
            return Err(InferError::InvalidShape {
                reason: format!(
                    "Cannot reshape {}x{} into {rows}x{cols}",
                    self.rows, self.cols
                ),
            });
        }
        self.rows = rows;
        self.cols = cols;
        Ok(())
    }

    /// Zero-copy `(1, cols)` view of row `index`
    ///
    /// # Errors
    ///
    /// Returns `IndexOutOfBounds` if `index >= rows`.
    pub fn row(&self, index: usize) -> Result<Tensor<'_>> {
        if index >= self.rows {
            return Err(InferError::IndexOutOfBounds {
                index,
                len: self.rows,
            });
        }
        let start = index * self.cols;
        Tensor::view(&self.data()[start..start + self.cols], 1, self.cols)
    }

    /// Mutable slice of row `index`
    ///
    /// # Errors
    ///
    /// Returns `IndexOutOfBounds` for a bad index and `UnsupportedOperation`
    /// for views.
    pub fn row_mut(&mut self, index: usize) -> Result<&mut [f32]> {
        if index >= self.rows {
            return Err(InferError::IndexOutOfBounds {
                index,
                len: self.rows,
            });
        }
        let cols = self.cols;
        let start = index * cols;
        Ok(&mut self.data_mut()?[start..start + cols])
    }

    /// Zero-copy view of `rows * cols` contiguous elements starting at the
    /// flat element `offset`
    ///
    /// # Errors
    ///
    /// Returns `IndexOutOfBounds` if the run extends past the end and
    /// `InvalidShape` if `rows * cols` overflows.
    pub fn slice(&self, offset: usize, rows: usize, cols: usize) -> Result<Tensor<'_>> {
        let end = element_count(rows, cols)?
            .checked_add(offset)
            .filter(|&end| end <= self.len())
            .ok_or(InferError::IndexOutOfBounds {
                index: offset,
                len: self.len(),
            })?;
        Tensor::view(&self.data()[offset..end], rows, cols)
    }

    /// Deep copy into owned storage
    #[must_use]
    pub fn copy(&self) -> Tensor<'static> {
        Tensor {
            storage: Storage::Owned(self.data().to_vec()),
            rows: self.rows,
            cols: self.cols,
        }
    }

    /// Convert into an owned tensor, copying only if this is a view
    #[must_use]
    pub fn into_owned(self) -> Tensor<'static> {
        let data = match self.storage {
            Storage::Owned(data) => data,
            Storage::View(data) => data.to_vec(),
        };
        Tensor {
            storage: Storage::Owned(data),
            rows: self.rows,
            cols: self.cols,
        }
    }

    /// Apply `f` to every element
    #[must_use]
    pub fn map<F>(&self, f: F) -> Tensor<'static>
    where
        F: Fn(f32) -> f32,
    {
        Tensor {
            storage: Storage::Owned(self.data().iter().map(|&x| f(x)).collect()),
            rows: self.rows,
            cols: self.cols,
        }
    }

    fn zip_with<F>(&self, other: &Tensor<'_>, op: &str, f: F) -> Result<Tensor<'static>>
    where
        F: Fn(f32, f32) -> f32,
    {
        if self.shape() != other.shape() {
            return Err(InferError::InvalidShape {
                reason: format!(
                    "{op} requires equal shapes, got {}x{} and {}x{}",
                    self.rows, self.cols, other.rows, other.cols
                ),
            });
        }

        let data = self
            .data()
            .iter()
            .zip(other.data())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(Tensor {
            storage: Storage::Owned(data),
            rows: self.rows,
            cols: self.cols,
        })
    }

    /// Elementwise sum
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` unless both shapes are equal.
    pub fn add(&self, other: &Tensor<'_>) -> Result<Tensor<'static>> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    /// Elementwise (Hadamard) product
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` unless both shapes are equal.
    pub fn mul(&self, other: &Tensor<'_>) -> Result<Tensor<'static>> {
        self.zip_with(other, "mul", |a, b| a * b)
    }

    /// Multiply every element by `factor`
    #[must_use]
    pub fn scale(&self, factor: f32) -> Tensor<'static> {
        self.map(|x| x * factor)
    }

    /// Row-dot-row matrix product: `self · otherᵗ`
    ///
    /// For `self` of shape `(m, k)` and `other` of shape `(n, k)` the result
    /// has shape `(m, n)` with `out[i][j] = Σ self[i][p] * other[j][p]`.
    /// Weight matrices are stored `(out_features, in_features)`, so
    /// `x.matmul(&w)` is the usual linear projection.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the row lengths differ.
    ///
    /// # Examples
    ///
    /// ```
    /// use tinyinfer::Tensor;
    ///
    /// let x = Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap();
    /// let w = Tensor::from_vec(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
    /// let y = x.matmul(&w).unwrap();
    /// assert_eq!(y.shape(), (1, 3));
    /// assert_eq!(y.data(), &[1.0, 2.0, 3.0]);
    /// ```
    pub fn matmul(&self, other: &Tensor<'_>) -> Result<Tensor<'static>> {
        if self.cols != other.cols {
            return Err(InferError::InvalidShape {
                reason: format!(
                    "matmul row lengths differ: {}x{} vs {}x{}",
                    self.rows, self.cols, other.rows, other.cols
                ),
            });
        }

        let (m, k, n) = (self.rows, self.cols, other.rows);
        let a = self.data();
        let b = other.data();
        let mut output = vec![0.0; m * n];

        output
            .par_iter_mut()
            .enumerate()
            .with_min_len(MATMUL_MIN_CELLS_PER_TASK)
            .for_each(|(cell, out)| {
                let i = cell / n;
                let j = cell % n;
                *out = dot(&a[i * k..(i + 1) * k], &b[j * k..(j + 1) * k]);
            });

        Ok(Tensor {
            storage: Storage::Owned(output),
            rows: m,
            cols: n,
        })
    }
}

/// `rows * cols`, or `InvalidShape` if it overflows
fn element_count(rows: usize, cols: usize) -> Result<usize> {
    rows.checked_mul(cols).ok_or_else(|| InferError::InvalidShape {
        reason: format!("Shape {rows}x{cols} overflows the address space"),
    })
}

/// Dot product of two equal-length slices
#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl Clone for Tensor<'_> {
    /// Deep copy; the clone always owns its storage
    fn clone(&self) -> Self {
        Self {
            storage: Storage::Owned(self.data().to_vec()),
            rows: self.rows,
            cols: self.cols,
        }
    }
}

impl fmt::Debug for Tensor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &(self.rows, self.cols))
            .field("view", &self.is_view())
            .finish()
    }
}

impl fmt::Display for Tensor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={}x{}, data=[", self.rows, self.cols)?;
        for (i, val) in self.data().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{val}")?;
        }
        write!(f, "])")
    }
}
