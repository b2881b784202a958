//! Search session: the `scan` / `search` state machine.
//!
//! ```text
//! Idle -> ScanningModels -> ScanningLibrary -> Ready <-> Searching
//! ```
//!
//! The session owns everything a search needs. The embedding table is built by
//! the scan and published exactly once; afterwards searches only read it, so
//! the phase mutex is the only lock on the hot path.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use indicatif::ProgressBar;

use crate::library::PhotoSource;
use crate::semantic::encoder::{EncoderError, EncoderLoader, Encoders};
use crate::semantic::index::{EmbeddingTable, IndexError, SearchHit};
use crate::semantic::reconcile::{ReconcileError, ReconcileOptions, ReconcileResult, Reconciler};
use crate::semantic::storage::{EmbeddingStore, SqliteEmbeddingStore, StoreError};

/// Errors that can occur during session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is not ready, run a scan first")]
    NotReady,

    #[error("A search is already in progress")]
    SearchInProgress,

    #[error("Failed to initialize encoders: {0}")]
    Encoder(EncoderError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Search failed: {0}")]
    SearchFailed(EncoderError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    ScanningModels,
    ScanningLibrary,
    Ready,
    Searching,
}

#[derive(Debug)]
pub enum ScanOutcome {
    Completed(ReconcileResult),
    /// Another scan is running; this call did nothing.
    AlreadyScanning,
    /// The session already scanned; this call did nothing.
    AlreadyReady,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// Nothing was typed, nothing was searched.
    NoQuery,
    Results(Vec<SearchHit>),
}

impl SearchOutcome {
    pub fn hits(&self) -> &[SearchHit] {
        match self {
            SearchOutcome::NoQuery => &[],
            SearchOutcome::Results(hits) => hits,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Embedding database file.
    pub store_path: PathBuf,
    /// Number of results per search.
    pub limit: usize,
    pub reconcile: ReconcileOptions,
}

/// Everything published by a successful scan.
struct ReadyState {
    encoders: Encoders,
    table: EmbeddingTable,
}

/// Moves the session to `to` when dropped, whatever happened in between.
struct PhaseReset<'a> {
    phase: &'a Mutex<Phase>,
    to: Phase,
}

impl<'a> PhaseReset<'a> {
    fn new(phase: &'a Mutex<Phase>, to: Phase) -> Self {
        Self { phase, to }
    }

    fn finish(mut self, to: Phase) {
        self.to = to;
    }
}

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        *phase = self.to;
    }
}

pub struct SearchSession {
    source: Arc<dyn PhotoSource>,
    loader: Box<dyn EncoderLoader>,
    settings: SessionSettings,
    phase: Mutex<Phase>,
    ready: OnceLock<ReadyState>,
    results: Mutex<Vec<SearchHit>>,
    cancel: Arc<AtomicBool>,
    progress: ProgressBar,
}

impl SearchSession {
    pub fn new(
        source: Arc<dyn PhotoSource>,
        loader: Box<dyn EncoderLoader>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            source,
            loader,
            settings,
            phase: Mutex::new(Phase::Idle),
            ready: OnceLock::new(),
            results: Mutex::new(Vec::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            progress: ProgressBar::hidden(),
        }
    }

    /// Report extraction progress on `progress`.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn phase(&self) -> Phase {
        *self.lock_phase()
    }

    pub fn is_model_ready(&self) -> bool {
        matches!(self.phase(), Phase::Ready | Phase::Searching)
    }

    pub fn is_searching(&self) -> bool {
        self.phase() == Phase::Searching
    }

    /// Results of the last completed search.
    pub fn last_results(&self) -> Vec<SearchHit> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of photos searchable right now.
    pub fn indexed_count(&self) -> usize {
        self.ready.get().map(|state| state.table.len()).unwrap_or(0)
    }

    /// Flag that makes a running scan skip its remaining photos.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Load the encoders, reconcile the library and become ready to search.
    ///
    /// Only the first successful scan does anything; later calls (or calls
    /// racing with a running scan) are no-ops. A failed scan returns to `Idle`.
    pub fn scan(&self) -> Result<ScanOutcome, SessionError> {
        {
            let mut phase = self.lock_phase();
            match *phase {
                Phase::Idle => *phase = Phase::ScanningModels,
                Phase::ScanningModels | Phase::ScanningLibrary => {
                    return Ok(ScanOutcome::AlreadyScanning)
                }
                Phase::Ready | Phase::Searching => return Ok(ScanOutcome::AlreadyReady),
            }
        }
        let reset = PhaseReset::new(&self.phase, Phase::Idle);

        let (state, result) = self.run_scan()?;
        if self.ready.set(state).is_err() {
            log::warn!("scan finished after the session was already populated");
        }

        reset.finish(Phase::Ready);
        Ok(ScanOutcome::Completed(result))
    }

    fn run_scan(&self) -> Result<(ReadyState, ReconcileResult), SessionError> {
        let started = Instant::now();

        let encoders = self.loader.load().map_err(SessionError::Encoder)?;
        log::info!("Initialized encoders in {:?}", started.elapsed());

        let store = SqliteEmbeddingStore::open(&self.settings.store_path, &encoders.fingerprint)?;
        log::debug!("opened embedding store at {}", store.path().display());

        self.set_phase(Phase::ScanningLibrary);

        let (table, result) = Reconciler::new(
            &store,
            self.source.as_ref(),
            encoders.image.clone(),
            encoders.fingerprint.dimensions,
            self.settings.reconcile.clone(),
        )
        .with_cancel(self.cancel.clone())
        .with_progress(self.progress.clone())
        .run()?;

        log::info!(
            "Scan finished in {:?}: {} photos searchable, {} stored",
            started.elapsed(),
            table.len(),
            store.len()?
        );

        Ok((ReadyState { encoders, table }, result))
    }

    /// Search the scanned photos for `keyword`.
    ///
    /// A blank keyword short-circuits to [`SearchOutcome::NoQuery`] without
    /// touching the text encoder.
    pub fn search(&self, keyword: &str) -> Result<SearchOutcome, SessionError> {
        let keyword = keyword.trim();

        let reset = {
            let mut phase = self.lock_phase();
            match *phase {
                Phase::Ready => {}
                Phase::Searching => return Err(SessionError::SearchInProgress),
                _ => return Err(SessionError::NotReady),
            }

            if keyword.is_empty() {
                return Ok(SearchOutcome::NoQuery);
            }

            *phase = Phase::Searching;
            PhaseReset::new(&self.phase, Phase::Ready)
        };

        let state = self.ready.get().ok_or(SessionError::NotReady)?;
        let started = Instant::now();

        let query = state
            .encoders
            .text
            .encode_text(&keyword.to_lowercase())
            .map_err(SessionError::SearchFailed)?;
        let hits = state.table.rank(&query, self.settings.limit)?;

        log::info!(
            "Searched {} photos for {:?} in {:?}",
            state.table.len(),
            keyword,
            started.elapsed()
        );

        *self.results.lock().unwrap_or_else(PoisonError::into_inner) = hits.clone();
        drop(reset);

        Ok(SearchOutcome::Results(hits))
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        // Phase is a plain value, always consistent even after a panic
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, to: Phase) {
        *self.lock_phase() = to;
    }
}
