//! Tensor types for inference input/output.

use ndarray::{Array3, Array4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::InferenceError;
use crate::model_info::LayerInfo;
use crate::Result;

/// Supported tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorType {
    Float32,
    Int32,
    Int64,
}

impl TensorType {
    /// Size of one element in bytes.
    pub fn byte_width(self) -> usize {
        match self {
            TensorType::Float32 => std::mem::size_of::<f32>(),
            TensorType::Int32 => std::mem::size_of::<i32>(),
            TensorType::Int64 => std::mem::size_of::<i64>(),
        }
    }

    /// Reinterpret a native-endian byte buffer as elements of this type.
    ///
    /// Trailing bytes that do not form a whole element are ignored.
    pub fn decode(self, bytes: &[u8]) -> Vec<TensorElement> {
        match self {
            TensorType::Float32 => bytes
                .chunks_exact(4)
                .map(|b| TensorElement::Float32(f32::from_ne_bytes([b[0], b[1], b[2], b[3]])))
                .collect(),
            TensorType::Int32 => bytes
                .chunks_exact(4)
                .map(|b| TensorElement::Int32(i32::from_ne_bytes([b[0], b[1], b[2], b[3]])))
                .collect(),
            TensorType::Int64 => bytes
                .chunks_exact(8)
                .map(|b| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(b);
                    TensorElement::Int64(i64::from_ne_bytes(raw))
                })
                .collect(),
        }
    }
}

/// One scalar output element, tagged with the element type it came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TensorElement {
    Float32(f32),
    Int32(i32),
    Int64(i64),
}

impl TensorElement {
    /// Get the data type of the element.
    pub fn dtype(&self) -> TensorType {
        match self {
            TensorElement::Float32(_) => TensorType::Float32,
            TensorElement::Int32(_) => TensorType::Int32,
            TensorElement::Int64(_) => TensorType::Int64,
        }
    }

    /// Try to get the value as f32.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            TensorElement::Float32(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get the value as i32.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            TensorElement::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get the value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TensorElement::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f32> for TensorElement {
    fn from(v: f32) -> Self {
        TensorElement::Float32(v)
    }
}

impl From<i32> for TensorElement {
    fn from(v: i32) -> Self {
        TensorElement::Int32(v)
    }
}

impl From<i64> for TensorElement {
    fn from(v: i64) -> Self {
        TensorElement::Int64(v)
    }
}

/// Wrap a typed slice into tagged elements.
pub fn tag_elements<T>(data: &[T]) -> Vec<TensorElement>
where
    T: Copy + Into<TensorElement>,
{
    data.iter().map(|&v| v.into()).collect()
}

/// One batch of output tensors with their shapes, aligned index for index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceOutput {
    /// Flattened output tensors, one per declared output layer.
    pub tensors: Vec<Vec<TensorElement>>,
    /// Shape of each tensor as reported by the backend, batch first.
    pub shapes: Vec<Vec<i64>>,
}

impl InferenceOutput {
    /// Create an empty output with room for `n` tensors.
    pub fn with_capacity(n: usize) -> Self {
        Self {
            tensors: Vec::with_capacity(n),
            shapes: Vec::with_capacity(n),
        }
    }

    /// Append one tensor with its shape.
    pub fn push(&mut self, tensor: Vec<TensorElement>, shape: Vec<i64>) {
        self.tensors.push(tensor);
        self.shapes.push(shape);
    }

    /// Number of output tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Split into (tensors, shapes).
    pub fn into_parts(self) -> (Vec<Vec<TensorElement>>, Vec<Vec<i64>>) {
        (self.tensors, self.shapes)
    }
}

/// A caller-normalized image in height x width x channels layout.
///
/// The inference layer only converts layout. Resizing belongs to the
/// caller; the `image` constructors scale 8-bit samples to [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Array3<f32>,
}

impl ImageTensor {
    /// Wrap an HWC array.
    pub fn new(data: Array3<f32>) -> Self {
        Self { data }
    }

    /// Create an image from raw interleaved HWC data.
    pub fn from_hwc(data: Vec<f32>, height: usize, width: usize, channels: usize) -> Result<Self> {
        let arr = Array3::from_shape_vec((height, width, channels), data)
            .map_err(|e| InferenceError::InvalidInput(e.to_string()))?;
        Ok(Self { data: arr })
    }

    /// Convert an 8-bit RGB image, scaling samples to [0, 1].
    pub fn from_rgb_image(img: &image::RgbImage) -> Self {
        Self::from_samples(img.as_raw(), img.height(), img.width(), 3)
    }

    /// Convert an 8-bit grayscale image, scaling samples to [0, 1].
    pub fn from_luma_image(img: &image::GrayImage) -> Self {
        Self::from_samples(img.as_raw(), img.height(), img.width(), 1)
    }

    fn from_samples(raw: &[u8], height: u32, width: u32, channels: usize) -> Self {
        let shape = (height as usize, width as usize, channels);
        Self {
            data: Array3::from_shape_fn(shape, |(y, x, c)| {
                raw[(y * shape.1 + x) * channels + c] as f32 / 255.0
            }),
        }
    }

    /// Create a zero-filled image.
    pub fn zeros(height: usize, width: usize, channels: usize) -> Self {
        Self {
            data: Array3::zeros((height, width, channels)),
        }
    }

    pub fn height(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[2]
    }

    /// Shape in channel-first order (C, H, W).
    pub fn chw_shape(&self) -> [usize; 3] {
        [self.channels(), self.height(), self.width()]
    }

    /// Underlying HWC array.
    pub fn as_array(&self) -> &Array3<f32> {
        &self.data
    }

    /// Encode as a single-image NCHW blob.
    pub fn to_nchw(&self) -> Array4<f32> {
        self.data
            .view()
            .permuted_axes([2, 0, 1])
            .as_standard_layout()
            .into_owned()
            .insert_axis(Axis(0))
    }

    /// Encode as a single-image NHWC blob.
    pub fn to_nhwc(&self) -> Array4<f32> {
        self.data.clone().insert_axis(Axis(0))
    }

    /// Trailing two dimensions of the NCHW blob, i.e. (height, width).
    pub fn target_size(&self) -> [i64; 2] {
        [self.height() as i64, self.width() as i64]
    }

    /// Check the image against a channel-first input descriptor.
    ///
    /// Dynamic (non-positive) dimensions in the descriptor match anything.
    pub fn validate_against(&self, input: &LayerInfo) -> Result<()> {
        let expected = &input.shape;
        if expected.len() != 3 {
            // Non-image inputs (e.g. flat vectors) cannot be checked spatially.
            return Ok(());
        }

        let actual = self.chw_shape();
        for (axis, (&want, &have)) in expected.iter().zip(actual.iter()).enumerate() {
            if want > 0 && want as usize != have {
                return Err(InferenceError::InvalidInput(format!(
                    "image shape {:?} (CHW) does not match input '{}' shape {:?} at axis {}",
                    actual, input.name, expected, axis
                )));
            }
        }

        Ok(())
    }
}
