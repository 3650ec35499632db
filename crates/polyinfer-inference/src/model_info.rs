//! Static input/output metadata of a loaded model.

use serde::{Deserialize, Serialize};

/// Name and shape of one input or output layer.
///
/// `shape` excludes the batch dimension and is channel-first for image
/// inputs. Dynamic dimensions are reported as `-1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub name: String,
    pub shape: Vec<i64>,
    pub batch_size: usize,
}

impl LayerInfo {
    pub fn new(name: impl Into<String>, shape: Vec<i64>, batch_size: usize) -> Self {
        Self {
            name: name.into(),
            shape,
            batch_size,
        }
    }

    /// Number of elements per batch item, or `None` if any dimension is dynamic.
    pub fn element_count(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &d| (d > 0).then(|| acc * d as usize))
    }
}

/// Model inputs and outputs, populated once when a backend is constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    inputs: Vec<LayerInfo>,
    outputs: Vec<LayerInfo>,
}

impl ModelInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: impl Into<String>, shape: Vec<i64>, batch_size: usize) {
        self.inputs.push(LayerInfo::new(name, shape, batch_size));
    }

    pub fn add_output(&mut self, name: impl Into<String>, shape: Vec<i64>, batch_size: usize) {
        self.outputs.push(LayerInfo::new(name, shape, batch_size));
    }

    pub fn inputs(&self) -> &[LayerInfo] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[LayerInfo] {
        &self.outputs
    }

    /// The first declared input, which receives the image.
    pub fn primary_input(&self) -> Option<&LayerInfo> {
        self.inputs.first()
    }
}

/// Drop the leading batch dimension of a full tensor shape.
pub fn strip_batch(dims: &[i64]) -> Vec<i64> {
    dims.iter().skip(1).copied().collect()
}

/// Reinterpret a rank-4 NHWC shape as CHW, dropping the batch.
///
/// Shapes of any other rank are returned with only the batch stripped.
pub fn nhwc_to_chw(dims: &[i64]) -> Vec<i64> {
    match dims {
        [_, h, w, c] => vec![*c, *h, *w],
        _ => strip_batch(dims),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_nhwc_to_chw() {
        assert_eq!(nhwc_to_chw(&[1, 320, 320, 3]), vec![3, 320, 320]);
        assert_eq!(nhwc_to_chw(&[-1, -1, -1, 3]), vec![3, -1, -1]);
        assert_eq!(nhwc_to_chw(&[1, 1000]), vec![1000]);
    }

    #[test]
    fn test_strip_batch() {
        assert_eq!(strip_batch(&[8, 3, 640, 640]), vec![3, 640, 640]);
        assert!(strip_batch(&[]).is_empty());
    }

    #[test]
    fn test_model_info_order() {
        let mut info = ModelInfo::new();
        info.add_input("images", vec![3, 640, 640], 1);
        info.add_input("orig_target_sizes", vec![2], 1);
        info.add_output("labels", vec![300], 1);

        assert_eq!(info.primary_input().map(|l| l.name.as_str()), Some("images"));
        assert_eq!(info.inputs()[1].name, "orig_target_sizes");
        assert_eq!(info.outputs().len(), 1);
    }

    #[test]
    fn test_element_count() {
        assert_eq!(LayerInfo::new("x", vec![3, 224, 224], 1).element_count(), Some(150_528));
        assert_eq!(LayerInfo::new("x", vec![3, -1, 224], 1).element_count(), None);
    }
}
