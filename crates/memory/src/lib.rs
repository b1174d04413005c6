pub mod continuity;
pub mod convergence;
pub mod error;
pub mod manager;
pub mod profile;
pub mod realms;
pub mod schema;
pub mod store;

pub use continuity::{NoteDraft, NoteReferences};
pub use error::{MemoryError, Result};
pub use manager::{
    ContinuityRecall, ConvergenceQuery, DuplicatePair, KeepPolicy, MemoryManager, MemoryStats,
    RecallQuery, SearchHit,
};
pub use schema::{
    AgentId, AgentProfile, ConvergenceCluster, ConvergenceTier, KnowledgeRecord, NoteKind,
    NotePriority, Realm, RecordId, WriteRequest,
};
pub use store::{InMemoryStore, VectorStore};
