//! CLIP dual encoder backed by fastembed.
//!
//! - Both halves are loaded together and probed for their dimensions
//! - Model files are downloaded on first use into the configured cache
//! - Loading is bounded by a download timeout

use fastembed::{
    ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions, TextEmbedding,
};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::library::PreprocessedImage;
use crate::semantic::encoder::{
    EncoderError, EncoderLoader, Encoders, ImageEncoder, ModelFingerprint, TextEncoder,
};

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Side length of the blank image used to probe the image encoder
const PROBE_IMAGE_SIZE: u32 = 32;

/// Supported dual-encoder models: text and vision halves of one CLIP checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClipVariant {
    VitB32,
}

impl ClipVariant {
    fn text_model(self) -> fastembed::EmbeddingModel {
        match self {
            ClipVariant::VitB32 => fastembed::EmbeddingModel::ClipVitB32,
        }
    }

    fn image_model(self) -> ImageEmbeddingModel {
        match self {
            ClipVariant::VitB32 => ImageEmbeddingModel::ClipVitB32,
        }
    }
}

/// Image half of the CLIP model.
/// Uses a Mutex because fastembed's embed calls require &mut self.
pub struct ClipImageEncoder {
    model: Mutex<ImageEmbedding>,
}

/// Text half of the CLIP model.
pub struct ClipTextEncoder {
    model: Mutex<TextEmbedding>,
}

impl ImageEncoder for ClipImageEncoder {
    fn encode_image(&self, image: &PreprocessedImage) -> Result<Vec<f32>, EncoderError> {
        let png = image
            .to_png()
            .map_err(|e| EncoderError::EncodingFailed(format!("Failed to encode input: {e}")))?;

        let mut model = self.model.lock().map_err(|e| {
            EncoderError::EncodingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed_bytes(&[png.as_slice()], None)
            .map_err(|e| EncoderError::EncodingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EncoderError::EncodingFailed("No embedding returned".to_string()))
    }
}

impl TextEncoder for ClipTextEncoder {
    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncoderError> {
        let mut model = self.model.lock().map_err(|e| {
            EncoderError::EncodingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EncoderError::EncodingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EncoderError::EncodingFailed("No embedding returned".to_string()))
    }
}

/// Loads both CLIP encoders from the fastembed model cache.
pub struct ClipLoader {
    model_name: String,
    cache_dir: PathBuf,
    download_timeout: Duration,
}

impl ClipLoader {
    /// # Arguments
    /// * `model_name` - Name of the model (e.g., "clip-vit-b-32")
    /// * `cache_dir` - Directory holding downloaded model files
    /// * `download_timeout` - Optional bound on loading, including the first download
    pub fn new(model_name: &str, cache_dir: PathBuf, download_timeout: Option<Duration>) -> Self {
        Self {
            model_name: model_name.to_string(),
            cache_dir,
            download_timeout: download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT),
        }
    }

    /// Parse model name string to a supported CLIP variant.
    fn parse_model_name(name: &str) -> Result<ClipVariant, EncoderError> {
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "clipvitb32" => Ok(ClipVariant::VitB32),
            _ => Err(EncoderError::InvalidModel(format!(
                "Unknown model: {}. Supported models: clip-vit-b-32",
                name
            ))),
        }
    }

    fn load_image_half(
        variant: ClipVariant,
        models_dir: PathBuf,
    ) -> Result<(ImageEmbedding, usize), EncoderError> {
        let options = ImageInitOptions::new(variant.image_model())
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model = ImageEmbedding::try_new(options)
            .map_err(|e| EncoderError::InitFailed(e.to_string()))?;

        let probe = PreprocessedImage::new(image::RgbImage::new(PROBE_IMAGE_SIZE, PROBE_IMAGE_SIZE))
            .to_png()
            .map_err(|e| EncoderError::InitFailed(format!("Failed to build probe image: {e}")))?;
        let dimensions = model
            .embed_bytes(&[probe.as_slice()], None)
            .map_err(|e| EncoderError::InitFailed(format!("Failed to probe dimensions: {}", e)))?
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EncoderError::InitFailed("Model returned no embedding".to_string()))?;

        Ok((model, dimensions))
    }

    fn load_text_half(
        variant: ClipVariant,
        models_dir: PathBuf,
    ) -> Result<(TextEmbedding, usize), EncoderError> {
        let options = InitOptions::new(variant.text_model())
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EncoderError::InitFailed(e.to_string()))?;

        let dimensions = model
            .embed(vec!["test"], None)
            .map_err(|e| EncoderError::InitFailed(format!("Failed to probe dimensions: {}", e)))?
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EncoderError::InitFailed("Model returned no embedding".to_string()))?;

        Ok((model, dimensions))
    }
}

impl EncoderLoader for ClipLoader {
    fn load(&self) -> Result<Encoders, EncoderError> {
        let variant = Self::parse_model_name(&self.model_name)?;

        // Ensure cache directory exists
        let models_dir = self.cache_dir.clone();
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EncoderError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let (tx, rx) = mpsc::sync_channel(1);
        std::thread::spawn(move || {
            let loaded = rayon::join(
                || Self::load_image_half(variant, models_dir.clone()),
                || Self::load_text_half(variant, models_dir.clone()),
            );
            let _ = tx.send(loaded);
        });

        let (image, text) = match rx.recv_timeout(self.download_timeout) {
            Ok(loaded) => loaded,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(EncoderError::InitFailed(format!(
                    "Model loading timed out after {} seconds",
                    self.download_timeout.as_secs()
                )))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(EncoderError::InitFailed(
                    "Model loader exited unexpectedly".to_string(),
                ))
            }
        };
        let (image_model, image_dims) = image?;
        let (text_model, text_dims) = text?;

        if image_dims != text_dims {
            return Err(EncoderError::InitFailed(format!(
                "Image encoder produces {} dimensions but text encoder produces {}",
                image_dims, text_dims
            )));
        }

        log::info!(
            "Loaded CLIP model '{}' ({} dimensions)",
            self.model_name,
            image_dims
        );

        Ok(Encoders {
            image: Arc::new(ClipImageEncoder {
                model: Mutex::new(image_model),
            }),
            text: Arc::new(ClipTextEncoder {
                model: Mutex::new(text_model),
            }),
            fingerprint: ModelFingerprint::new(self.model_name.to_lowercase(), image_dims),
        })
    }
}
