//! Encoder gateway contract.
//!
//! The core treats both halves of the dual encoder as opaque, slow and
//! fallible functions into one shared embedding space:
//! - `ImageEncoder`: preprocessed photo -> embedding
//! - `TextEncoder`: keyword -> embedding (tokenization is the encoder's job)
//!
//! `EncoderLoader` is the explicit initialization step: it either yields both
//! encoders or fails, so nothing can run against a half-loaded model.

use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::library::PreprocessedImage;

/// Error type for encoder operations
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Encoding did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Encoder returned {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

pub trait ImageEncoder: Send + Sync {
    fn encode_image(&self, image: &PreprocessedImage) -> Result<Vec<f32>, EncoderError>;
}

pub trait TextEncoder: Send + Sync {
    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncoderError>;
}

/// Identity of the model that produced a set of embeddings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFingerprint {
    pub name: String,
    pub dimensions: usize,
}

impl ModelFingerprint {
    pub fn new(name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            name: name.into(),
            dimensions,
        }
    }

    /// SHA256 of the model name, used to tag persisted embeddings.
    pub fn model_id_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.finalize().into()
    }

    pub fn model_id_hex(&self) -> String {
        self.model_id_hash()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Both loaded encoders plus the fingerprint of the model behind them.
#[derive(Clone)]
pub struct Encoders {
    pub image: Arc<dyn ImageEncoder>,
    pub text: Arc<dyn TextEncoder>,
    pub fingerprint: ModelFingerprint,
}

pub trait EncoderLoader: Send + Sync {
    fn load(&self) -> Result<Encoders, EncoderError>;
}

/// Caps the number of image encoder calls running at once.
///
/// A call abandoned after its deadline keeps its slot until the encoder
/// actually returns, so timed-out work can't pile up behind the caller.
pub struct EncodeSlots {
    free: Mutex<usize>,
    returned: Condvar,
}

impl EncodeSlots {
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(slots.max(1)),
            returned: Condvar::new(),
        })
    }

    /// Take a slot, waiting at most `timeout` when one is given.
    fn acquire(self: &Arc<Self>, timeout: Option<Duration>) -> Option<EncodeSlot> {
        let free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        let mut free = match timeout {
            Some(timeout) => {
                self.returned
                    .wait_timeout_while(free, timeout, |free| *free == 0)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .returned
                .wait_while(free, |free| *free == 0)
                .unwrap_or_else(PoisonError::into_inner),
        };

        if *free == 0 {
            return None;
        }
        *free -= 1;
        Some(EncodeSlot(self.clone()))
    }
}

/// A taken slot, handed back on drop.
struct EncodeSlot(Arc<EncodeSlots>);

impl Drop for EncodeSlot {
    fn drop(&mut self) {
        *self.0.free.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.0.returned.notify_one();
    }
}

/// Run the image encoder, giving up after `deadline`.
///
/// The deadline covers waiting for a free slot and the encode itself. With a
/// deadline the call runs on a helper thread; when it overruns, the result is
/// dropped and the item counts as an encoder failure.
pub fn encode_image_within(
    encoder: &Arc<dyn ImageEncoder>,
    image: PreprocessedImage,
    deadline: Option<Duration>,
    slots: &Arc<EncodeSlots>,
) -> Result<Vec<f32>, EncoderError> {
    let started = Instant::now();

    let Some(deadline) = deadline else {
        let _slot = slots.acquire(None);
        return encoder.encode_image(&image);
    };

    let slot = slots
        .acquire(Some(deadline))
        .ok_or(EncoderError::Timeout(deadline))?;

    let (tx, rx) = mpsc::sync_channel(1);
    let encoder = encoder.clone();
    std::thread::spawn(move || {
        let result = encoder.encode_image(&image);
        drop(slot);
        // receiver may be gone after a timeout
        let _ = tx.send(result);
    });

    match rx.recv_timeout(deadline.saturating_sub(started.elapsed())) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(EncoderError::Timeout(deadline)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(EncoderError::EncodingFailed(
            "encoder thread exited without a result".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowEncoder(Duration);

    impl ImageEncoder for SlowEncoder {
        fn encode_image(&self, _image: &PreprocessedImage) -> Result<Vec<f32>, EncoderError> {
            std::thread::sleep(self.0);
            Ok(vec![1.0, 0.0])
        }
    }

    struct PanickingEncoder;

    impl ImageEncoder for PanickingEncoder {
        fn encode_image(&self, _image: &PreprocessedImage) -> Result<Vec<f32>, EncoderError> {
            panic!("runtime blew up");
        }
    }

    fn blank() -> PreprocessedImage {
        PreprocessedImage::new(RgbImage::new(2, 2))
    }

    #[test]
    fn test_no_deadline_runs_inline() {
        let encoder: Arc<dyn ImageEncoder> = Arc::new(SlowEncoder(Duration::ZERO));
        assert_eq!(encode_image_within(&encoder, blank(), None, &EncodeSlots::new(1)).unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_within_deadline() {
        let encoder: Arc<dyn ImageEncoder> = Arc::new(SlowEncoder(Duration::from_millis(5)));
        let result = encode_image_within(&encoder, blank(), Some(Duration::from_secs(5)), &EncodeSlots::new(1));
        assert!(result.is_ok());
    }

    #[test]
    fn test_deadline_exceeded() {
        let encoder: Arc<dyn ImageEncoder> = Arc::new(SlowEncoder(Duration::from_millis(500)));
        let result = encode_image_within(&encoder, blank(), Some(Duration::from_millis(10)), &EncodeSlots::new(1));
        assert!(matches!(result, Err(EncoderError::Timeout(_))));
    }

    #[test]
    fn test_panicking_encoder_is_a_failure() {
        let encoder: Arc<dyn ImageEncoder> = Arc::new(PanickingEncoder);
        let result = encode_image_within(&encoder, blank(), Some(Duration::from_secs(5)), &EncodeSlots::new(1));
        assert!(matches!(result, Err(EncoderError::EncodingFailed(_))));
    }

    /// Counts concurrent calls and remembers the highest count.
    #[derive(Default)]
    struct TrackingEncoder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ImageEncoder for TrackingEncoder {
        fn encode_image(&self, _image: &PreprocessedImage) -> Result<Vec<f32>, EncoderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![1.0, 0.0])
        }
    }

    #[test]
    fn test_abandoned_calls_keep_their_slot() {
        let tracking = Arc::new(TrackingEncoder::default());
        let encoder: Arc<dyn ImageEncoder> = tracking.clone();
        let slots = EncodeSlots::new(2);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let encoder = encoder.clone();
                let slots = slots.clone();
                std::thread::spawn(move || {
                    encode_image_within(&encoder, blank(), Some(Duration::from_millis(10)), &slots)
                })
            })
            .collect();

        for handle in handles {
            let result = handle.join().unwrap();
            assert!(matches!(result, Err(EncoderError::Timeout(_))));
        }

        // abandoned calls drain, then the slots are free again
        std::thread::sleep(Duration::from_millis(300));
        assert!(tracking.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(tracking.in_flight.load(Ordering::SeqCst), 0);
        let result = encode_image_within(&encoder, blank(), Some(Duration::from_secs(5)), &slots);
        assert!(result.is_ok());
    }

    #[test]
    fn test_model_id_hash_consistency() {
        let a = ModelFingerprint::new("clip-vit-b-32", 512);
        let b = ModelFingerprint::new("clip-vit-b-32", 512);
        let c = ModelFingerprint::new("other", 512);

        assert_eq!(a.model_id_hash(), b.model_id_hash());
        assert_ne!(a.model_id_hash(), c.model_id_hash());
        assert_eq!(a.model_id_hex().len(), 64);
    }
}
