//! Session handoff: leaving and recalling continuity notes.
//!
//! The write path is strict (an empty summary is a validation error).  The
//! recall path never fails: a broken memory subsystem must not block a
//! session from starting, so internal errors are logged and returned as a
//! degraded, all-empty result.

use std::collections::{BTreeMap, HashSet};

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::continuity::{self, NoteDraft, NoteReferences};
use crate::error::{MemoryError, Result};
use crate::realms::RealmRouter;
use crate::schema::{
    AgentId, CONTINUITY_CATEGORY, KnowledgeRecord, NoteFields, NoteKind, NotePriority, Realm,
    RecordId, WriteRequest,
};
use crate::store::GetRequest;

use super::{MemoryManager, parse_docs_lossy};

/// Recall parameters.  `None` fields fall back to the `[continuity]` config
/// section; filters default to off.
#[derive(Debug, Clone, Default)]
pub struct RecallQuery {
    pub lookback: Option<Duration>,
    pub priority: Option<NotePriority>,
    pub kind: Option<NoteKind>,
    pub limit: Option<usize>,
}

impl RecallQuery {
    pub fn last_hours(hours: i64) -> Self {
        Self { lookback: Some(Duration::hours(hours)), ..Default::default() }
    }
}

/// Everything a fresh session needs to reorient: the recent notes, the most
/// recent one, aggregated open tasks and references, and tallies.
#[derive(Debug, Clone)]
pub struct ContinuityRecall {
    pub success: bool,
    pub notes: Vec<KnowledgeRecord>,
    pub latest: Option<KnowledgeRecord>,
    pub open_tasks: Vec<String>,
    pub references: NoteReferences,
    pub by_priority: BTreeMap<NotePriority, usize>,
    pub by_kind: BTreeMap<NoteKind, usize>,
    pub error: Option<String>,
}

impl ContinuityRecall {
    fn empty() -> Self {
        Self {
            success: true,
            notes: Vec::new(),
            latest: None,
            open_tasks: Vec::new(),
            references: NoteReferences::default(),
            by_priority: BTreeMap::new(),
            by_kind: BTreeMap::new(),
            error: None,
        }
    }

    fn degraded(error: String) -> Self {
        Self { success: false, error: Some(error), ..Self::empty() }
    }
}

impl MemoryManager {
    /// Leave a note for a future instance of `author`.
    ///
    /// The note is persisted as a private knowledge record with typed
    /// priority/kind/task fields; the rendered body is a human-readable view
    /// of the same data.  Only a missing summary fails.
    pub async fn leave_continuity_note(
        &self,
        draft: NoteDraft,
        author: &AgentId,
    ) -> Result<RecordId> {
        if draft.summary.trim().is_empty() {
            return Err(MemoryError::Validation(
                "a continuity note needs a summary".to_string(),
            ));
        }

        let now = Utc::now();
        let session = continuity::session_id(author, now);
        let body = continuity::render_note(author, &session, now, &draft);

        let mut record = KnowledgeRecord::new(
            body,
            Realm::private(author.clone()),
            author,
            WriteRequest {
                category: CONTINUITY_CATEGORY.to_string(),
                confidence: 1.0,
                thread_id: draft.thread_id.clone(),
                ..Default::default()
            },
            now,
        )?;
        record.note = Some(NoteFields {
            session_id: session.clone(),
            priority: draft.priority,
            kind: draft.kind,
            open_tasks: draft
                .open_tasks
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            references: draft.references.clone(),
        });

        let id = self.persist(record).await?;
        info!(author = %author, session = %session, priority = draft.priority.label(), "continuity note left");
        Ok(id)
    }

    /// Recall `author`'s recent notes.  Never returns an error: failures
    /// degrade to `success = false` with empty collections.
    pub async fn get_continuity_notes(
        &self,
        author: &AgentId,
        query: RecallQuery,
    ) -> ContinuityRecall {
        match self.recall_notes(author, query).await {
            Ok(recall) => recall,
            Err(err) => {
                warn!(author = %author, %err, "continuity recall degraded to empty result");
                ContinuityRecall::degraded(err.to_string())
            }
        }
    }

    async fn recall_notes(&self, author: &AgentId, query: RecallQuery) -> Result<ContinuityRecall> {
        let cfg = &self.config().continuity;
        let lookback = query
            .lookback
            .unwrap_or_else(|| Duration::hours(cfg.default_lookback_hours as i64));
        let limit = query.limit.unwrap_or(cfg.default_limit);
        let now = Utc::now();
        let realm = Realm::private(author.clone());

        let mut filter = RealmRouter::realm_filter(&realm);
        filter.insert("category".to_string(), json!(CONTINUITY_CATEGORY));
        let docs = self
            .store()
            .get(self.router().collection_for(&realm), GetRequest {
                ids: None,
                filter: Some(filter),
                limit: Some(cfg.fetch_ceiling),
            })
            .await
            .map_err(MemoryError::backend)?;

        let window_start = now - lookback;
        let mut notes: Vec<KnowledgeRecord> = parse_docs_lossy(docs)
            .into_iter()
            .filter(|r| r.owner == *author && r.category == CONTINUITY_CATEGORY)
            .filter(|r| !r.is_tombstoned())
            .filter(|r| r.created_at > window_start && r.created_at <= now)
            .filter(|r| {
                query
                    .priority
                    .map_or(true, |p| r.note.as_ref().is_some_and(|n| n.priority == p))
            })
            .filter(|r| {
                query.kind.map_or(true, |k| r.note.as_ref().is_some_and(|n| n.kind == k))
            })
            .collect();

        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        notes.truncate(limit);

        let mut open_tasks = Vec::new();
        let mut seen_tasks = HashSet::new();
        let mut references = NoteReferences::default();
        let mut by_priority = BTreeMap::new();
        let mut by_kind = BTreeMap::new();

        for note in &notes {
            if let Some(fields) = &note.note {
                *by_priority.entry(fields.priority).or_insert(0) += 1;
                *by_kind.entry(fields.kind).or_insert(0) += 1;
            }

            // The typed field is the source of truth; the structural body
            // scan covers notes that predate it.
            let tasks = match &note.note {
                Some(fields) if !fields.open_tasks.is_empty() => fields.open_tasks.clone(),
                _ => continuity::extract_open_tasks(&note.content),
            };
            for task in tasks {
                if seen_tasks.insert(task.clone()) {
                    open_tasks.push(task);
                }
            }

            references.merge(continuity::extract_references(&note.content));
            if let Some(thread) = &note.thread_id {
                references.merge(NoteReferences {
                    record_ids: Vec::new(),
                    thread_ids: vec![thread.clone()],
                });
            }
        }

        let ids: Vec<RecordId> = notes.iter().map(|n| n.id.clone()).collect();
        self.touch_quietly(&ids).await;

        Ok(ContinuityRecall {
            success: true,
            latest: notes.first().cloned(),
            notes,
            open_tasks,
            references,
            by_priority,
            by_kind,
            error: None,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
