//! Array-view shapes, mask layouts and the dispatch descriptor.
//!
//! A dropout operand is a logical `row_count x row_width` matrix stored row
//! major with a leading dimension (stride) per buffer. The packed mask has
//! its own leading dimension derived from the row width and chunk width,
//! never from the data strides.

use crate::error::{KernelError, Result};
use crate::math::ceil_div;
use crate::types::{DEFAULT_CHUNK_WIDTH, DataType, MAX_CHUNK_WIDTH, MaskMode, Pass};
use serde::{Deserialize, Serialize};

/// Logical extent and strides of the input and output buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DropoutShape {
    /// Logical elements per row (`M`).
    pub row_width: usize,
    /// Number of rows (`N`).
    pub row_count: usize,
    /// Leading dimension of the input buffer, in elements.
    pub input_stride: usize,
    /// Leading dimension of the output buffer, in elements.
    pub output_stride: usize,
}

impl DropoutShape {
    pub fn new(row_width: usize, row_count: usize, input_stride: usize, output_stride: usize) -> Self {
        Self { row_width, row_count, input_stride, output_stride }
    }

    /// Shape whose strides equal the row width.
    pub fn dense(row_width: usize, row_count: usize) -> Self {
        Self::new(row_width, row_count, row_width, row_width)
    }

    pub fn validate(&self) -> Result<()> {
        if self.row_width > self.input_stride {
            return Err(KernelError::precondition(format!(
                "row_width {} exceeds input_stride {}",
                self.row_width, self.input_stride
            ))
            .into());
        }
        if self.row_width > self.output_stride {
            return Err(KernelError::precondition(format!(
                "row_width {} exceeds output_stride {}",
                self.row_width, self.output_stride
            ))
            .into());
        }
        if checked_required_len(self.row_width, self.row_count, self.input_stride).is_none()
            || checked_required_len(self.row_width, self.row_count, self.output_stride).is_none()
        {
            return Err(KernelError::precondition(format!(
                "{} rows with strides {}/{} overflow the address space",
                self.row_count, self.input_stride, self.output_stride
            ))
            .into());
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.row_width == 0 || self.row_count == 0
    }

    /// Minimum number of input elements the view touches.
    pub fn required_input_len(&self) -> usize {
        required_len(self.row_width, self.row_count, self.input_stride)
    }

    /// Minimum number of output elements the view touches.
    pub fn required_output_len(&self) -> usize {
        required_len(self.row_width, self.row_count, self.output_stride)
    }
}

/// `(rows - 1) * stride + width`, or `None` when that overflows `usize`.
fn checked_required_len(row_width: usize, row_count: usize, stride: usize) -> Option<usize> {
    if row_width == 0 || row_count == 0 {
        return Some(0);
    }
    (row_count - 1).checked_mul(stride)?.checked_add(row_width)
}

/// Saturates at `usize::MAX`, which no buffer can satisfy.
fn required_len(row_width: usize, row_count: usize, stride: usize) -> usize {
    checked_required_len(row_width, row_count, stride).unwrap_or(usize::MAX)
}

/// Physical layout of a mask row for a given row width and chunk width.
///
/// Packed chunks take `ceil(chunk_width / 8)` little-endian bytes with lane
/// `i` at bit `i`. Explicit masks keep one element per lane and are padded
/// to whole chunks so both passes agree on the row pitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaskLayout {
    pub row_width: usize,
    pub chunk_width: usize,
    pub chunks_per_row: usize,
    pub chunk_bytes: usize,
}

impl MaskLayout {
    /// `chunk_width` must be non-zero.
    pub fn new(row_width: usize, chunk_width: usize) -> Self {
        Self {
            row_width,
            chunk_width,
            chunks_per_row: ceil_div(row_width, chunk_width),
            chunk_bytes: ceil_div(chunk_width, 8),
        }
    }

    /// Leading dimension of a packed mask, in bytes.
    pub fn bitmask_stride_bytes(&self) -> usize {
        self.chunks_per_row.saturating_mul(self.chunk_bytes)
    }

    /// Leading dimension of an explicit mask, in elements.
    pub fn explicit_stride(&self) -> usize {
        self.chunks_per_row.saturating_mul(self.chunk_width)
    }

    pub fn bitmask_len(&self, row_count: usize) -> usize {
        self.mask_len(MaskMode::Bitmask, row_count).unwrap_or(usize::MAX)
    }

    pub fn explicit_len(&self, row_count: usize) -> usize {
        self.mask_len(MaskMode::Explicit, row_count).unwrap_or(usize::MAX)
    }

    /// Mask entries (bytes for a packed mask, elements for an explicit one)
    /// `row_count` rows need, or `None` when the extent overflows `usize`.
    pub fn mask_len(&self, mode: MaskMode, row_count: usize) -> Option<usize> {
        if !mode.writes_mask() {
            return Some(0);
        }
        match mode {
            MaskMode::Bitmask => {
                self.chunks_per_row.checked_mul(self.chunk_bytes)?.checked_mul(row_count)
            }
            _ => {
                let stride = self.chunks_per_row.checked_mul(self.chunk_width)?;
                checked_required_len(self.row_width, row_count, stride)
            }
        }
    }

    /// Lanes of chunk `chunk` that fall inside the row.
    pub fn valid_lanes(&self, chunk: usize) -> usize {
        let start = chunk * self.chunk_width;
        self.row_width.saturating_sub(start).min(self.chunk_width)
    }

    /// Uniform draws a forward pass consumes per row: full chunks, tail included.
    pub fn draws_per_row(&self) -> usize {
        self.chunks_per_row * self.chunk_width
    }
}

/// Everything a dispatcher needs to pick and configure a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DropoutDescriptor {
    pub shape: DropoutShape,
    pub input_type: DataType,
    pub compute_type: DataType,
    pub output_type: DataType,
    pub mask_mode: MaskMode,
    pub pass: Pass,
    pub chunk_width: usize,
}

impl DropoutDescriptor {
    pub fn forward(
        shape: DropoutShape,
        input_type: DataType,
        output_type: DataType,
        mask_mode: MaskMode,
    ) -> Self {
        Self {
            shape,
            input_type,
            compute_type: DataType::F32,
            output_type,
            mask_mode,
            pass: Pass::Forward,
            chunk_width: DEFAULT_CHUNK_WIDTH,
        }
    }

    pub fn backward(
        shape: DropoutShape,
        input_type: DataType,
        output_type: DataType,
        mask_mode: MaskMode,
    ) -> Self {
        Self { pass: Pass::Backward, ..Self::forward(shape, input_type, output_type, mask_mode) }
    }

    pub fn with_chunk_width(mut self, chunk_width: usize) -> Self {
        self.chunk_width = chunk_width;
        self
    }

    pub fn with_compute_type(mut self, compute_type: DataType) -> Self {
        self.compute_type = compute_type;
        self
    }

    /// Descriptor of the matching backward pass over the same shape.
    pub fn to_backward(self) -> Self {
        Self { pass: Pass::Backward, ..self }
    }

    pub fn mask_layout(&self) -> MaskLayout {
        MaskLayout::new(self.shape.row_width, self.chunk_width)
    }

    /// Reject configurations no kernel implements, then shapes that break
    /// the stride contract.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_width == 0 || self.chunk_width > MAX_CHUNK_WIDTH {
            return Err(KernelError::unsupported(format!(
                "chunk_width must be in 1..={MAX_CHUNK_WIDTH}, got {}",
                self.chunk_width
            ))
            .into());
        }
        if self.compute_type != DataType::F32 {
            return Err(KernelError::unsupported(format!(
                "compute type {} is not supported, dropout computes in f32",
                self.compute_type
            ))
            .into());
        }
        if self.pass == Pass::Backward && self.mask_mode == MaskMode::None {
            return Err(KernelError::unsupported("backward pass requires a recorded mask").into());
        }
        self.shape.validate()?;
        if self.mask_layout().mask_len(self.mask_mode, self.shape.row_count).is_none() {
            return Err(KernelError::precondition(format!(
                "{} mask for {} rows of width {} overflows the address space",
                self.mask_mode, self.shape.row_count, self.shape.row_width
            ))
            .into());
        }
        Ok(())
    }
}
