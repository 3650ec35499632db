//! Inference backend implementations.

#[cfg(feature = "onnxruntime")]
pub mod ort;

#[cfg(feature = "tract")]
pub mod dnn;

#[cfg(feature = "tract")]
pub mod tensorflow;

#[cfg(feature = "tract")]
pub(crate) mod tract;

pub mod engine;
pub mod mock;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{ImageTensor, InferenceOutput, ModelInfo, Result};

/// Trait for inference backends.
///
/// Each implementation owns its native session or engine exclusively and is
/// meant for sequential use: one inference completes before the next starts.
/// Callers needing concurrent throughput create several backends.
pub trait InferenceBackend: Send {
    /// Run inference on one caller-normalized image.
    ///
    /// # Returns
    /// One tensor per declared output layer, with the shape the backend
    /// reported for this call (batch first).
    fn infer(&mut self, image: &ImageTensor) -> Result<InferenceOutput>;

    /// Metadata captured when the model was loaded.
    fn model_info(&self) -> &ModelInfo;

    /// Timing counters for this backend instance.
    fn stats(&self) -> InferenceStats;

    /// Memory held by the backend outside its runtime's own accounting, in MiB.
    fn memory_usage_mb(&self) -> usize {
        0
    }

    /// Release caches the backend may hold between calls.
    fn clear_cache(&mut self) {}
}

/// Counters reported by [`InferenceBackend::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceStats {
    /// Wall time of the most recent inference in milliseconds.
    pub last_inference_ms: f64,
    /// Number of completed inferences.
    pub total_inferences: u64,
}

/// Measures inference calls for [`InferenceStats`].
#[derive(Debug, Default)]
pub struct InferenceTimer {
    stats: InferenceStats,
    started: Option<Instant>,
}

impl InferenceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Stop the running measurement and count one inference.
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.record(started.elapsed());
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.stats.last_inference_ms = elapsed.as_secs_f64() * 1000.0;
        self.stats.total_inferences += 1;
    }

    pub fn stats(&self) -> InferenceStats {
        self.stats
    }
}

/// Where a backend executes after applying the accelerator policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accelerator {
    /// General-purpose CPU execution.
    Cpu,
    /// A GPU-capable provider, by name.
    Gpu(String),
}

/// Pick an execution target from the providers a runtime reports.
///
/// Acceleration is a best-effort hint: if no GPU-capable provider is
/// available the backend runs on the CPU instead of failing.
pub fn select_accelerator(requested: bool, available: &[&str]) -> Accelerator {
    if !requested {
        info!("Using CPU");
        return Accelerator::Cpu;
    }

    info!("Available providers: {:?}", available);

    match available.iter().find(|p| is_gpu_provider(p)) {
        Some(provider) => {
            info!("Using GPU provider {}", provider);
            Accelerator::Gpu(provider.to_string())
        }
        None => {
            warn!("No GPU provider available, falling back to CPU");
            Accelerator::Cpu
        }
    }
}

fn is_gpu_provider(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    ["cuda", "tensorrt", "rocm", "directml", "coreml"]
        .iter()
        .any(|gpu| name.contains(gpu))
}
