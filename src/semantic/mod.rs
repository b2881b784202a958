//! Semantic photo search.
//!
//! Photos and keywords are mapped into the same CLIP embedding space; a search
//! ranks every scanned photo by cosine similarity to the keyword.
//!
//! # Architecture
//!
//! - `encoder`: Image/text encoder contracts and deadline handling
//! - `clip`: fastembed-backed CLIP encoders
//! - `storage`: SQLite persistence for photo embeddings
//! - `index`: In-memory embedding table with top-k cosine ranking
//! - `reconcile`: Brings the store in line with the photo library
//! - `session`: The scan/search state machine

pub mod clip;
pub mod encoder;
mod index;
mod reconcile;
mod session;
mod storage;

pub use clip::ClipLoader;
pub use encoder::{
    encode_image_within, EncoderError, EncoderLoader, Encoders, ImageEncoder, ModelFingerprint,
    TextEncoder,
};
pub use index::{cosine_similarity, EmbeddingTable, IndexError, SearchHit};
pub use reconcile::{
    ReconcileError, ReconcileOptions, ReconcilePlan, ReconcileResult, Reconciler,
};
pub use session::{
    Phase, ScanOutcome, SearchOutcome, SearchSession, SessionError, SessionSettings,
};
pub use storage::{
    decode_embedding, encode_embedding, CodecError, EmbeddingStore, LoadedRecords,
    SqliteEmbeddingStore, StoreError,
};

/// Default encoder pair
pub const DEFAULT_MODEL: &str = "clip-vit-b-32";
