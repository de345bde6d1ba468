use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::capabilities::{AnalyzerFactory, CapabilityRegistry, PluginConfiguration};
use crate::image_fetcher::{self, FrameSource, SnapshotFetcher};
use crate::model::{Device, Verdict};

/// The only prototype label that does not mean failure.
pub const SUCCESS_LABEL: &str = "success";

/// Distance at which confidence drops to zero.
const CONFIDENCE_DISTANCE_SCALE: f64 = 10.0;

/// Per-frame print failure analysis used by job sentinels.
///
/// An analyzer is bound to one device by [`FailureAnalyzer::start`] and then
/// sampled repeatedly. Any scoring method can sit behind this trait; the
/// prototype-distance method below is the default.
#[async_trait]
pub trait FailureAnalyzer: Send + Sync {
    /// Prepare the analyzer for a device, e.g. open its camera.
    async fn start(&self, device: &Device) -> Result<()>;

    /// Analyze the next frame.
    ///
    /// # Returns
    ///
    /// `None` when no frame was available this time.
    async fn analyze(&self) -> Result<Option<Verdict>>;

    async fn stop(&self);
}

/// Maps a preprocessed frame tensor to an embedding vector.
///
/// Inference is opaque to the host; plugins can register a real model and
/// the built-in [`PooledEmbedding`] is used otherwise.
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, tensor: &[f32]) -> Result<Vec<f32>>;
}

/// Built-in embedding: mean of each channel over a square grid of cells.
#[derive(Debug, Clone, Copy)]
pub struct PooledEmbedding {
    grid: usize,
}

impl PooledEmbedding {
    /// # Arguments
    ///
    /// * `grid` - Cells per side; the embedding has `3 * grid * grid` values
    pub fn new(grid: usize) -> Self {
        Self {
            grid: grid.clamp(1, image_fetcher::CROP_SIZE as usize),
        }
    }

    pub fn dimensions(&self) -> usize {
        3 * self.grid * self.grid
    }
}

impl Default for PooledEmbedding {
    fn default() -> Self {
        Self::new(8)
    }
}

impl EmbeddingModel for PooledEmbedding {
    fn embed(&self, tensor: &[f32]) -> Result<Vec<f32>> {
        if tensor.len() != image_fetcher::TENSOR_LEN {
            anyhow::bail!(
                "expected a tensor of {} values, got {}",
                image_fetcher::TENSOR_LEN,
                tensor.len()
            );
        }

        let side = image_fetcher::CROP_SIZE as usize;
        let plane = side * side;
        let mut sums = vec![0.0f32; self.dimensions()];
        let mut counts = vec![0u32; self.dimensions()];

        for channel in 0..3 {
            for y in 0..side {
                let cell_y = y * self.grid / side;
                for x in 0..side {
                    let cell_x = x * self.grid / side;
                    let slot = (channel * self.grid + cell_y) * self.grid + cell_x;
                    sums[slot] += tensor[channel * plane + y * side + x];
                    counts[slot] += 1;
                }
            }
        }

        Ok(sums
            .into_iter()
            .zip(counts)
            .map(|(sum, count)| if count == 0 { 0.0 } else { sum / count as f32 })
            .collect())
    }
}

/// A labeled reference embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prototype {
    pub label: String,
    pub embedding: Vec<f32>,
}

/// Load prototypes from a JSON object mapping label to embedding.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not a label→vector
/// object, or contains no prototypes.
pub fn load_prototypes(path: &Path) -> Result<Vec<Prototype>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading prototypes from {}", path.display()))?;
    let table: BTreeMap<String, Vec<f32>> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing prototypes in {}", path.display()))?;
    if table.is_empty() {
        anyhow::bail!("{} contains no prototypes", path.display());
    }

    let prototypes: Vec<Prototype> = table
        .into_iter()
        .map(|(label, embedding)| Prototype { label, embedding })
        .collect();
    info!(
        "Loaded {} prototype(s) from {}: {}",
        prototypes.len(),
        path.display(),
        prototypes
            .iter()
            .map(|p| p.label.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(prototypes)
}

/// Euclidean distance between two vectors of equal length.
///
/// # Errors
///
/// Returns an error if the lengths differ.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        anyhow::bail!("cannot compare vectors of length {} and {}", a.len(), b.len());
    }
    Ok(a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum::<f64>()
        .sqrt())
}

/// Classify an embedding against the prototypes.
///
/// The nearest prototype wins. Only the `success` label (any case) yields a
/// non-failure verdict. Confidence falls linearly from 1 at distance 0 to 0
/// at distance 10.
pub fn classify(embedding: &[f32], prototypes: &[Prototype]) -> Result<Verdict> {
    let mut nearest: Option<(&Prototype, f64)> = None;
    for prototype in prototypes {
        let distance = euclidean_distance(embedding, &prototype.embedding)
            .with_context(|| format!("comparing with prototype '{}'", prototype.label))?;
        if nearest.is_none_or(|(_, best)| distance < best) {
            nearest = Some((prototype, distance));
        }
    }

    let (prototype, distance) =
        nearest.ok_or_else(|| anyhow::anyhow!("no prototypes to compare against"))?;
    let confidence = (1.0 - distance / CONFIDENCE_DISTANCE_SCALE).clamp(0.0, 1.0);

    let mut verdict = if prototype.label.eq_ignore_ascii_case(SUCCESS_LABEL) {
        Verdict::success(confidence)
    } else {
        Verdict::failure(prototype.label.clone(), confidence)
    };
    verdict.details = format!("nearest prototype '{}' at distance {:.3}", prototype.label, distance);
    Ok(verdict)
}

/// Default analyzer: embeds each frame and picks the nearest labeled prototype.
pub struct PrototypeAnalyzer {
    frames: Box<dyn FrameSource>,
    model: Arc<dyn EmbeddingModel>,
    prototypes: Arc<Vec<Prototype>>,
}

impl PrototypeAnalyzer {
    pub fn new(
        frames: impl FrameSource + 'static,
        model: Arc<dyn EmbeddingModel>,
        prototypes: Arc<Vec<Prototype>>,
    ) -> Self {
        Self {
            frames: Box::new(frames),
            model,
            prototypes,
        }
    }
}

#[async_trait]
impl FailureAnalyzer for PrototypeAnalyzer {
    async fn start(&self, device: &Device) -> Result<()> {
        self.frames.start(device).await
    }

    async fn analyze(&self) -> Result<Option<Verdict>> {
        let Some(frame) = self.frames.next_frame().await? else {
            return Ok(None);
        };

        let model = Arc::clone(&self.model);
        let prototypes = Arc::clone(&self.prototypes);
        // Preprocessing and inference are CPU bound.
        let verdict = tokio::task::spawn_blocking(move || -> Result<Verdict> {
            let tensor = image_fetcher::preprocess_frame(&frame)?;
            let embedding = model.embed(&tensor)?;
            classify(&embedding, &prototypes)
        })
        .await
        .context("analysis task panicked")??;

        debug!(
            "Frame verdict: {} ({:.2} confidence, {})",
            verdict.reason, verdict.confidence, verdict.details
        );
        Ok(Some(verdict))
    }

    async fn stop(&self) {
        self.frames.stop().await;
    }
}

/// Builds a [`PrototypeAnalyzer`] reading frames from the device camera.
pub struct PrototypeAnalyzerFactory {
    prototypes: Arc<Vec<Prototype>>,
}

impl PrototypeAnalyzerFactory {
    pub fn new(prototypes: Vec<Prototype>) -> Self {
        Self {
            prototypes: Arc::new(prototypes),
        }
    }
}

impl AnalyzerFactory for PrototypeAnalyzerFactory {
    fn create(&self, capabilities: &CapabilityRegistry) -> Result<Arc<dyn FailureAnalyzer>> {
        let model = capabilities
            .default_embedding_model()
            .unwrap_or_else(|| Arc::new(PooledEmbedding::default()));
        Ok(Arc::new(PrototypeAnalyzer::new(
            SnapshotFetcher::default(),
            model,
            Arc::clone(&self.prototypes),
        )))
    }
}

/// Compiled-in plugin providing the default analyzer and embedding model.
pub struct PrototypeAnalysisPlugin {
    prototypes: Option<Vec<Prototype>>,
}

impl PrototypeAnalysisPlugin {
    /// # Arguments
    ///
    /// * `prototypes` - Reference embeddings; without them only the
    ///   embedding model is registered.
    pub fn new(prototypes: Option<Vec<Prototype>>) -> Self {
        Self { prototypes }
    }
}

impl PluginConfiguration for PrototypeAnalysisPlugin {
    fn name(&self) -> &str {
        "Prototype Analysis"
    }

    fn configure(&self, registry: &mut CapabilityRegistry) {
        registry.register_embedding_model("pooled", PooledEmbedding::default());
        if let Some(prototypes) = &self.prototypes {
            registry.register_analyzer("prototype", PrototypeAnalyzerFactory::new(prototypes.clone()));
        }
    }
}
