//! In-process stand-ins for the photo library, the encoders and the store.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgb, RgbImage};

use crate::library::{Authorization, PhotoId, PhotoSource, PreprocessedImage, SourceError};
use crate::semantic::{
    EmbeddingStore, EncoderError, EncoderLoader, Encoders, ImageEncoder, LoadedRecords,
    ModelFingerprint, StoreError, TextEncoder,
};

pub const DIMENSIONS: usize = 3;
pub const MODEL_NAME: &str = "fake-rgb";

static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn test_dir() -> tempfile::TempDir {
    let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    tempfile::Builder::new()
        .prefix(&format!("photo-search-scenario-{counter}-"))
        .tempdir()
        .unwrap()
}

pub fn id(raw: &str) -> PhotoId {
    raw.parse().unwrap()
}

pub fn ids(raw: &[&str]) -> BTreeSet<PhotoId> {
    raw.iter().map(|r| id(r)).collect()
}

/// The embedding the fake image encoder produces for a photo of `color`.
pub fn embedding_for(color: [u8; 3]) -> Vec<f32> {
    color.iter().map(|c| *c as f32 / 255.0).collect()
}

/// Two-way rendezvous used to park a collaborator mid-call.
pub struct Gate {
    entered_tx: Sender<()>,
    release_rx: Mutex<Receiver<()>>,
}

pub struct GateHandle {
    entered_rx: Receiver<()>,
    release_tx: Sender<()>,
}

impl Gate {
    pub fn new() -> (Gate, GateHandle) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        (
            Gate {
                entered_tx,
                release_rx: Mutex::new(release_rx),
            },
            GateHandle {
                entered_rx,
                release_tx,
            },
        )
    }

    fn pass(&self) {
        let _ = self.entered_tx.send(());
        let _ = self.release_rx.lock().unwrap().recv();
    }
}

impl GateHandle {
    pub fn wait_entered(&self) {
        self.entered_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("collaborator never reached the gate");
    }

    pub fn release(&self) {
        let _ = self.release_tx.send(());
    }
}

/// A photo library held in memory. Every photo is a flat color.
pub struct MemorySource {
    pub authorization: Authorization,
    pub photos: Mutex<BTreeMap<PhotoId, [u8; 3]>>,
    pub fail_enumeration: bool,
    pub fail_fetch: HashSet<PhotoId>,
    pub fetches: AtomicUsize,
    pub list_gate: Option<Gate>,
}

impl MemorySource {
    pub fn new(photos: &[(&str, [u8; 3])]) -> Self {
        Self {
            authorization: Authorization::Authorized,
            photos: Mutex::new(photos.iter().map(|(raw, color)| (id(raw), *color)).collect()),
            fail_enumeration: false,
            fail_fetch: HashSet::new(),
            fetches: AtomicUsize::new(0),
            list_gate: None,
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl PhotoSource for MemorySource {
    fn authorization(&self) -> Authorization {
        self.authorization
    }

    fn list_identifiers(&self) -> Result<BTreeSet<PhotoId>, SourceError> {
        if let Some(gate) = &self.list_gate {
            gate.pass();
        }
        if self.fail_enumeration {
            return Err(SourceError::Enumeration("library went away".to_string()));
        }
        Ok(self.photos.lock().unwrap().keys().cloned().collect())
    }

    fn fetch_image(&self, id: &PhotoId, target_size: u32) -> Result<PreprocessedImage, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if self.fail_fetch.contains(id) {
            return Err(SourceError::Decode {
                id: id.clone(),
                message: "truncated file".to_string(),
            });
        }

        let color = *self
            .photos
            .lock()
            .unwrap()
            .get(id)
            .ok_or_else(|| SourceError::NotFound(id.clone()))?;
        Ok(PreprocessedImage::new(RgbImage::from_pixel(
            target_size,
            target_size,
            Rgb(color),
        )))
    }

    fn locate(&self, id: &PhotoId) -> Option<PathBuf> {
        Some(PathBuf::from("/memory").join(id.key()))
    }
}

/// Maps the top-left pixel to a normalized RGB vector.
#[derive(Default)]
pub struct RgbImageEncoder {
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    /// Highest number of calls seen running at once
    pub peak: AtomicUsize,
    pub delay: Option<Duration>,
    /// Pixel colors the encoder refuses to handle
    pub reject: Vec<[u8; 3]>,
}

impl ImageEncoder for RgbImageEncoder {
    fn encode_image(&self, image: &PreprocessedImage) -> Result<Vec<f32>, EncoderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let color = image.pixels().get_pixel(0, 0).0;
        if self.reject.contains(&color) {
            return Err(EncoderError::EncodingFailed("unsupported image".to_string()));
        }
        Ok(embedding_for(color))
    }
}

/// Looks keywords up in a fixed vocabulary.
#[derive(Default)]
pub struct VocabularyTextEncoder {
    pub vocabulary: HashMap<String, Vec<f32>>,
    pub calls: AtomicUsize,
    pub queries: Mutex<Vec<String>>,
    pub gate: Option<Gate>,
}

impl VocabularyTextEncoder {
    pub fn new(words: &[(&str, [u8; 3])]) -> Self {
        Self {
            vocabulary: words
                .iter()
                .map(|(word, color)| (word.to_string(), embedding_for(*color)))
                .collect(),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextEncoder for VocabularyTextEncoder {
    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncoderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(text.to_string());

        if let Some(gate) = &self.gate {
            gate.pass();
        }

        self.vocabulary
            .get(text)
            .cloned()
            .ok_or_else(|| EncoderError::EncodingFailed(format!("unknown word {text:?}")))
    }
}

/// Hands out the same encoder pair every time, or fails.
pub struct FakeLoader {
    pub image: Arc<RgbImageEncoder>,
    pub text: Arc<VocabularyTextEncoder>,
    pub fail: bool,
    pub loads: AtomicUsize,
}

impl FakeLoader {
    pub fn new(image: Arc<RgbImageEncoder>, text: Arc<VocabularyTextEncoder>) -> Self {
        Self {
            image,
            text,
            fail: false,
            loads: AtomicUsize::new(0),
        }
    }
}

impl EncoderLoader for FakeLoader {
    fn load(&self) -> Result<Encoders, EncoderError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EncoderError::InitFailed("model file missing".to_string()));
        }
        Ok(Encoders {
            image: self.image.clone(),
            text: self.text.clone(),
            fingerprint: ModelFingerprint::new(MODEL_NAME, DIMENSIONS),
        })
    }
}

/// Store kept in memory that remembers every write.
#[derive(Default)]
pub struct MemoryStore {
    pub records: Mutex<HashMap<PhotoId, Vec<f32>>>,
    pub corrupt: Mutex<Vec<String>>,
    pub puts: Mutex<Vec<PhotoId>>,
    pub deletes: Mutex<Vec<PhotoId>>,
    pub fail_put: HashSet<PhotoId>,
    pub fail_delete: bool,
}

impl MemoryStore {
    pub fn with_records(records: &[(&str, [u8; 3])]) -> Self {
        Self {
            records: Mutex::new(
                records
                    .iter()
                    .map(|(raw, color)| (id(raw), embedding_for(*color)))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    pub fn stored_ids(&self) -> BTreeSet<PhotoId> {
        self.records.lock().unwrap().keys().cloned().collect()
    }

    pub fn put_ids(&self) -> Vec<PhotoId> {
        self.puts.lock().unwrap().clone()
    }

    pub fn delete_ids(&self) -> Vec<PhotoId> {
        self.deletes.lock().unwrap().clone()
    }
}

impl EmbeddingStore for MemoryStore {
    fn load_all(&self) -> Result<LoadedRecords, StoreError> {
        Ok(LoadedRecords {
            records: self.records.lock().unwrap().clone(),
            corrupt: self
                .corrupt
                .lock()
                .unwrap()
                .iter()
                .map(|identifier| {
                    (
                        identifier.clone(),
                        StoreError::CorruptRecord {
                            identifier: identifier.clone(),
                            reason: "checksum mismatch".to_string(),
                        },
                    )
                })
                .collect(),
        })
    }

    fn put(&self, id: &PhotoId, embedding: &[f32]) -> Result<(), StoreError> {
        if self.fail_put.contains(id) {
            return Err(StoreError::Poisoned);
        }
        self.puts.lock().unwrap().push(id.clone());
        self.corrupt.lock().unwrap().retain(|raw| raw != id.as_str());
        self.records
            .lock()
            .unwrap()
            .insert(id.clone(), embedding.to_vec());
        Ok(())
    }

    fn delete(&self, id: &PhotoId) -> Result<(), StoreError> {
        self.deletes.lock().unwrap().push(id.clone());
        if self.fail_delete {
            return Err(StoreError::Poisoned);
        }
        self.corrupt.lock().unwrap().retain(|raw| raw != id.as_str());
        self.records.lock().unwrap().remove(id);
        Ok(())
    }

    fn purge(&self, identifier: &str) -> Result<(), StoreError> {
        match identifier.parse::<PhotoId>() {
            Ok(id) => self.delete(&id),
            Err(_) => {
                self.corrupt.lock().unwrap().retain(|raw| raw != identifier);
                Ok(())
            }
        }
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.records.lock().unwrap().len())
    }
}
