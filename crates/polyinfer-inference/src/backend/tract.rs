//! Shared plumbing for the tract-based backends.

use ndarray::Array4;
use tract_onnx::prelude::*;

use crate::error::InferenceError;
use crate::tensor::{tag_elements, TensorElement};
use crate::Result;

/// An optimized, runnable tract plan.
pub(crate) type TractPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Copy an encoded image blob into a tract value.
pub(crate) fn blob_to_tvalue(blob: &Array4<f32>) -> Result<TValue> {
    let shape: TVec<usize> = blob.shape().iter().cloned().collect();
    let data: Vec<f32> = blob.iter().cloned().collect();
    let tract_tensor = tract_ndarray::ArrayD::from_shape_vec(tract_ndarray::IxDyn(shape.as_slice()), data)
        .map_err(|e| InferenceError::InvalidInput(e.to_string()))?;
    Ok(tract_tensor.into_tvalue())
}

/// Copy a typed host buffer into a tract value of the given shape.
pub(crate) fn slice_to_tvalue<T: Datum + Copy>(shape: &[usize], data: &[T]) -> Result<TValue> {
    let tract_tensor = tract_ndarray::ArrayD::from_shape_vec(tract_ndarray::IxDyn(shape), data.to_vec())
        .map_err(|e| InferenceError::InvalidInput(e.to_string()))?;
    Ok(tract_tensor.into_tvalue())
}

/// Convert a tract output into tagged elements plus its shape.
///
/// Dispatches on the element type tract reports for the tensor.
pub(crate) fn convert_output(output: &Tensor) -> Result<(Vec<TensorElement>, Vec<i64>)> {
    let shape: Vec<i64> = output.shape().iter().map(|&d| d as i64).collect();

    let tensor = match output.datum_type() {
        DatumType::F32 => tag_elements(
            output
                .as_slice::<f32>()
                .map_err(|e| InferenceError::OutputExtraction(e.to_string()))?,
        ),
        DatumType::I32 => tag_elements(
            output
                .as_slice::<i32>()
                .map_err(|e| InferenceError::OutputExtraction(e.to_string()))?,
        ),
        DatumType::I64 => tag_elements(
            output
                .as_slice::<i64>()
                .map_err(|e| InferenceError::OutputExtraction(e.to_string()))?,
        ),
        // Shape arithmetic stays symbolic inside tract; concrete dims fit in i64.
        DatumType::TDim => {
            let longs = output
                .cast_to::<i64>()
                .map_err(|e| InferenceError::OutputExtraction(e.to_string()))?;
            tag_elements(
                longs
                    .as_slice::<i64>()
                    .map_err(|e| InferenceError::OutputExtraction(e.to_string()))?,
            )
        }
        other => return Err(InferenceError::unsupported_output(other)),
    };

    Ok((tensor, shape))
}

/// Names of the model's outputs, captured before typing renames nodes.
///
/// Prefers the outlet label the loader recorded (the graph's declared output
/// name) and falls back to the producing node's name.
pub(crate) fn output_labels(model: &InferenceModel) -> Result<Vec<String>> {
    let outlets = model
        .output_outlets()
        .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;
    Ok(outlets
        .iter()
        .map(|&outlet| {
            model
                .outlet_label(outlet)
                .map(str::to_string)
                .unwrap_or_else(|| model.node(outlet.node).name.clone())
        })
        .collect())
}

/// Read a symbolic shape as integers, with `-1` for unresolved dimensions.
pub(crate) fn fact_dims(fact: &TypedFact) -> Vec<i64> {
    fact.shape.iter().map(|d| d.to_i64().unwrap_or(-1)).collect()
}
