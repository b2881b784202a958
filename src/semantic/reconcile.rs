//! Library reconciliation.
//!
//! Brings the embedding table in line with the live library with as little
//! re-encoding as possible:
//! 1. Load every stored embedding (the working table)
//! 2. Enumerate the live library
//! 3. Diff the two key sets once: new photos are extracted, vanished ones evicted
//! 4. Extract in parallel on a bounded pool; failures only skip that photo
//! 5. Evict from the store and the table
//!
//! Nothing is ever evicted unless the library was enumerated successfully
//! while authorized.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::Serialize;

use crate::library::{Authorization, PhotoId, PhotoSource, DEFAULT_TARGET_SIZE};
use crate::semantic::encoder::{encode_image_within, EncodeSlots, EncoderError, ImageEncoder};
use crate::semantic::index::EmbeddingTable;
use crate::semantic::storage::{EmbeddingStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to build extraction pool: {0}")]
    Pool(String),
}

/// Work derived from one snapshot of the store and the library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// In the library but without an embedding.
    pub to_extract: BTreeSet<PhotoId>,
    /// Embedded but gone from the library.
    pub to_evict: BTreeSet<PhotoId>,
}

impl ReconcilePlan {
    pub fn compute(stored: &HashSet<PhotoId>, live: &BTreeSet<PhotoId>) -> Self {
        Self {
            to_extract: live
                .iter()
                .filter(|id| !stored.contains(*id))
                .cloned()
                .collect(),
            to_evict: stored
                .iter()
                .filter(|id| !live.contains(*id))
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_extract.is_empty() && self.to_evict.is_empty()
    }
}

/// Summary of one reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResult {
    /// Records read back from the store.
    pub loaded: usize,
    /// Stored records that could not be decoded.
    pub corrupt: usize,
    pub extracted: usize,
    /// Photos that could not be embedded this time, with the reason.
    pub failed: Vec<(PhotoId, String)>,
    pub evicted: usize,
    /// Photos skipped because the scan was cancelled.
    pub cancelled: usize,
    pub authorization: Authorization,
    /// The library could not be enumerated; the table is the stored one.
    pub library_unavailable: bool,
}

impl ReconcileResult {
    fn new(loaded: usize, corrupt: usize, authorization: Authorization) -> Self {
        Self {
            loaded,
            corrupt,
            extracted: 0,
            failed: Vec::new(),
            evicted: 0,
            cancelled: 0,
            authorization,
            library_unavailable: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Extraction workers.
    pub parallelism: usize,
    /// Side length of the square encoder input.
    pub target_size: u32,
    /// Deadline for a single image encode.
    pub encode_timeout: Option<Duration>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            target_size: DEFAULT_TARGET_SIZE,
            encode_timeout: None,
        }
    }
}

enum Extraction {
    Done(Vec<f32>),
    Failed(String),
    Cancelled,
}

pub struct Reconciler<'a> {
    store: &'a dyn EmbeddingStore,
    source: &'a dyn PhotoSource,
    encoder: Arc<dyn ImageEncoder>,
    dimensions: usize,
    options: ReconcileOptions,
    cancel: Arc<AtomicBool>,
    progress: ProgressBar,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        store: &'a dyn EmbeddingStore,
        source: &'a dyn PhotoSource,
        encoder: Arc<dyn ImageEncoder>,
        dimensions: usize,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            store,
            source,
            encoder,
            dimensions,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: ProgressBar::hidden(),
        }
    }

    /// Share a cancellation flag; once raised, pending photos are skipped.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Run a full reconciliation and return the resulting table.
    pub fn run(&self) -> Result<(EmbeddingTable, ReconcileResult), ReconcileError> {
        let started = Instant::now();

        let loaded = self.store.load_all()?;
        for (identifier, err) in &loaded.corrupt {
            log::warn!("skipping stored embedding for {identifier}: {err}");
        }

        let corrupt: Vec<PhotoId> = loaded.corrupt_ids().collect();
        let malformed: Vec<String> = loaded
            .malformed_identifiers()
            .map(str::to_string)
            .collect();
        let mut table = EmbeddingTable::with_capacity(self.dimensions, loaded.records.len());
        for (id, embedding) in loaded.records {
            if let Err(err) = table.insert(id.clone(), embedding) {
                // the store only hands out vectors of its own dimension
                log::warn!("skipping stored embedding for {id}: {err}");
            }
        }
        let stored: HashSet<PhotoId> = table.ids().cloned().collect();
        log::info!(
            "Loaded {} embeddings from storage in {:?}",
            table.len(),
            started.elapsed()
        );

        let authorization = self.source.authorization();
        let mut result = ReconcileResult::new(table.len(), loaded.corrupt.len(), authorization);

        if !authorization.is_authorized() {
            log::warn!("photo library access is {authorization:?}, no photos available");
            return Ok((EmbeddingTable::new(self.dimensions), result));
        }

        let live = match self.source.list_identifiers() {
            Ok(live) => live,
            Err(err) => {
                log::error!("library enumeration failed, keeping stored embeddings: {err}");
                result.library_unavailable = true;
                return Ok((table, result));
            }
        };

        let mut plan = ReconcilePlan::compute(&stored, &live);
        // corrupt rows of live photos get rewritten by extraction, the rest go
        plan.to_evict
            .extend(corrupt.into_iter().filter(|id| !live.contains(id)));
        log::info!(
            "{} photos in library, {} to extract, {} to evict",
            live.len(),
            plan.to_extract.len(),
            plan.to_evict.len()
        );

        self.extract(&plan.to_extract, &mut table, &mut result)?;
        if self.cancel.load(Ordering::Relaxed) {
            log::info!(
                "scan cancelled, leaving {} stale records for the next scan",
                plan.to_evict.len()
            );
        } else {
            self.evict(&plan.to_evict, &mut table, &mut result);
            self.purge(&malformed, &mut result);
        }

        log::info!(
            "Reconciled in {:?}: {} extracted, {} failed, {} evicted",
            started.elapsed(),
            result.extracted,
            result.failed.len(),
            result.evicted
        );

        Ok((table, result))
    }

    fn extract(
        &self,
        ids: &BTreeSet<PhotoId>,
        table: &mut EmbeddingTable,
        result: &mut ReconcileResult,
    ) -> Result<(), ReconcileError> {
        if ids.is_empty() {
            return Ok(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.parallelism.max(1))
            .thread_name(|i| format!("extract-{i}"))
            .build()
            .map_err(|e| ReconcileError::Pool(e.to_string()))?;

        self.progress.set_length(ids.len() as u64);

        // abandoned encodes count against the pool size until they return
        let slots = EncodeSlots::new(self.options.parallelism);

        let ids: Vec<&PhotoId> = ids.iter().collect();
        let outcomes: Vec<(&PhotoId, Extraction)> = pool.install(|| {
            ids.par_iter()
                .map(|id| {
                    let outcome = self.extract_one(id, &slots);
                    self.progress.inc(1);
                    (*id, outcome)
                })
                .collect()
        });
        self.progress.finish_and_clear();

        for (id, outcome) in outcomes {
            match outcome {
                Extraction::Done(embedding) => match table.insert(id.clone(), embedding) {
                    Ok(()) => result.extracted += 1,
                    Err(err) => result.failed.push((id.clone(), err.to_string())),
                },
                Extraction::Failed(reason) => {
                    log::warn!("failed to embed {id}: {reason}");
                    result.failed.push((id.clone(), reason));
                }
                Extraction::Cancelled => result.cancelled += 1,
            }
        }

        if result.cancelled > 0 {
            log::warn!("scan cancelled, {} photos left for the next scan", result.cancelled);
        }

        Ok(())
    }

    /// Fetch, encode and persist one photo.
    fn extract_one(&self, id: &PhotoId, slots: &Arc<EncodeSlots>) -> Extraction {
        if self.cancel.load(Ordering::Relaxed) {
            return Extraction::Cancelled;
        }

        let image = match self.source.fetch_image(id, self.options.target_size) {
            Ok(image) => image,
            Err(err) => return Extraction::Failed(err.to_string()),
        };

        let embedding = match encode_image_within(
            &self.encoder,
            image,
            self.options.encode_timeout,
            slots,
        ) {
            Ok(embedding) => embedding,
            Err(err) => return Extraction::Failed(err.to_string()),
        };

        if embedding.len() != self.dimensions {
            let err = EncoderError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            };
            return Extraction::Failed(err.to_string());
        }

        // abandoned work is simply not persisted
        if self.cancel.load(Ordering::Relaxed) {
            return Extraction::Cancelled;
        }

        match self.store.put(id, &embedding) {
            Ok(()) => {
                log::debug!("embedded {id}");
                Extraction::Done(embedding)
            }
            Err(err) => Extraction::Failed(err.to_string()),
        }
    }

    /// Drop rows whose identifier no photo can ever have.
    fn purge(&self, identifiers: &[String], result: &mut ReconcileResult) {
        for identifier in identifiers {
            match self.store.purge(identifier) {
                Ok(()) => result.evicted += 1,
                Err(err) => log::warn!("failed to purge {identifier:?}, retrying next scan: {err}"),
            }
        }
    }

    fn evict(&self, ids: &BTreeSet<PhotoId>, table: &mut EmbeddingTable, result: &mut ReconcileResult) {
        for id in ids {
            match self.store.delete(id) {
                Ok(()) => result.evicted += 1,
                Err(err) => log::warn!("failed to evict {id}, retrying next scan: {err}"),
            }
            // the photo is gone either way
            table.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<PhotoId> {
        ids.iter().map(|s| PhotoId::file(s)).collect()
    }

    #[test]
    fn test_plan_diffs_both_ways() {
        let stored: HashSet<PhotoId> = set(&["a", "b", "c"]).into_iter().collect();
        let live = set(&["b", "c", "d"]);

        let plan = ReconcilePlan::compute(&stored, &live);
        assert_eq!(plan.to_extract, set(&["d"]));
        assert_eq!(plan.to_evict, set(&["a"]));
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_plan_in_sync() {
        let stored: HashSet<PhotoId> = set(&["a", "b"]).into_iter().collect();
        let plan = ReconcilePlan::compute(&stored, &set(&["a", "b"]));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_empty_store() {
        let plan = ReconcilePlan::compute(&HashSet::new(), &set(&["x", "y"]));
        assert_eq!(plan.to_extract, set(&["x", "y"]));
        assert!(plan.to_evict.is_empty());
    }

    #[test]
    fn test_default_options() {
        let options = ReconcileOptions::default();
        assert!(options.parallelism >= 1);
        assert_eq!(options.target_size, DEFAULT_TARGET_SIZE);
        assert!(options.encode_timeout.is_none());
    }
}
