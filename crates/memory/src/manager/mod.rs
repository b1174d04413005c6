//! The memory manager: the surface the orchestration layer talks to.
//!
//! Every operation takes an explicit `actor` — there is no ambient "current
//! agent".  Realm scoping is enforced here on both the write and read paths,
//! on top of whatever filtering the backing store applies.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use village_config::AppConfig;

use crate::error::{MemoryError, Result};
use crate::profile::{AgentRoster, render_profile};
use crate::realms::RealmRouter;
use crate::schema::{
    AgentId, AgentProfile, KnowledgeRecord, PROFILE_CATEGORY, Realm, RecordId, WriteRequest,
};
use crate::store::{
    GetRequest, MetadataFilter, QueryRequest, StoredDoc, VectorStore, similarity_from_distance,
};

mod continuity;
mod convergence;
mod curation;

pub use continuity::{ContinuityRecall, RecallQuery};
pub use convergence::ConvergenceQuery;
pub use curation::{DuplicatePair, KeepPolicy};

/// A scored retrieval result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: KnowledgeRecord,
    pub similarity: f32,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub total: usize,
    pub private: usize,
    pub village: usize,
    pub bridges: usize,
    pub tombstoned: usize,
    pub registered_agents: usize,
    pub active_agents: usize,
}

pub struct MemoryManager {
    store: Arc<dyn VectorStore>,
    router: RealmRouter,
    config: AppConfig,
    roster: AgentRoster,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn VectorStore>, config: AppConfig) -> Self {
        let router = RealmRouter::new(&config.store);
        Self { store, router, config, roster: AgentRoster::new() }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn VectorStore {
        self.store.as_ref()
    }

    pub(crate) fn router(&self) -> &RealmRouter {
        &self.router
    }

    pub(crate) fn roster(&self) -> &AgentRoster {
        &self.roster
    }

    // ── Writing ────────────────────────────────────────────────────────────

    /// Validate the realm for `actor`, assign an id, and persist.
    pub async fn write(
        &self,
        content: &str,
        realm: Realm,
        request: WriteRequest,
        actor: &AgentId,
    ) -> Result<RecordId> {
        realm.validate_for_write(actor)?;
        let record = KnowledgeRecord::new(content, realm, actor, request, Utc::now())?;
        self.persist(record).await
    }

    pub(crate) async fn persist(&self, record: KnowledgeRecord) -> Result<RecordId> {
        let collection = self.router.collection_for(&record.realm);
        let vector = self.store.embed(&record.content).await.map_err(MemoryError::backend)?;
        self.store
            .upsert(collection, record.id.as_str(), vector, &record.content, record.to_metadata())
            .await
            .map_err(MemoryError::backend)?;
        debug!(
            id = %record.id,
            realm = record.realm.slug(),
            category = %record.category,
            owner = %record.owner,
            "record written"
        );
        Ok(record.id)
    }

    // ── Reading ────────────────────────────────────────────────────────────

    /// Semantic search over everything `actor` may read, or over one explicit
    /// realm.  Results are filtered against the actor's read scope even
    /// though the store-side filter already scopes them, then access-tracked.
    pub async fn search(
        &self,
        query: &str,
        realm_filter: Option<Realm>,
        actor: &AgentId,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let top_k = top_k.min(self.config.store.max_top_k);
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let targets = self.router.targets_for(actor, realm_filter.as_ref())?;
        let fetch_k = top_k.saturating_mul(self.config.store.query_overfetch);

        let mut hits = Vec::new();
        for target in targets {
            let found = self
                .store
                .query(&target.collection, QueryRequest {
                    text: Some(query.to_string()),
                    vector: None,
                    filter: target.filter,
                    top_k: fetch_k,
                })
                .await
                .map_err(MemoryError::backend)?;
            for hit in found {
                let Some(record) = parse_doc_lossy(&hit.id, &hit.text, &hit.metadata) else {
                    continue;
                };
                if !record.realm.readable_by(actor) || record.is_tombstoned() {
                    continue;
                }
                hits.push(SearchHit {
                    similarity: similarity_from_distance(hit.distance),
                    record,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        hits.truncate(top_k);

        let ids: Vec<RecordId> = hits.iter().map(|hit| hit.record.id.clone()).collect();
        self.touch_quietly(&ids).await;
        Ok(hits)
    }

    /// Fetch one record by id, enforcing the actor's read scope.
    pub async fn get_record(&self, id: &RecordId, actor: &AgentId) -> Result<KnowledgeRecord> {
        let (_, record) = self
            .locate(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("record {id}")))?;
        if !record.realm.readable_by(actor) {
            return Err(MemoryError::AccessDenied(format!("{actor} may not read record {id}")));
        }
        self.touch_quietly(std::slice::from_ref(id)).await;
        Ok(record)
    }

    /// Follow tombstone pointers until a surviving record is reached, so a
    /// stale reference to a consolidated-away record still resolves.
    pub async fn resolve(&self, id: &RecordId, actor: &AgentId) -> Result<KnowledgeRecord> {
        let mut current = id.clone();
        let mut seen = BTreeSet::new();
        loop {
            if !seen.insert(current.clone()) {
                return Err(MemoryError::Validation(format!("tombstone cycle at record {current}")));
            }
            let (_, record) = self
                .locate(&current)
                .await?
                .ok_or_else(|| MemoryError::NotFound(format!("record {current}")))?;
            if !record.realm.readable_by(actor) {
                return Err(MemoryError::AccessDenied(format!(
                    "{actor} may not read record {current}"
                )));
            }
            match &record.tombstoned_into {
                Some(next) => current = next.clone(),
                None => {
                    self.touch_quietly(std::slice::from_ref(&record.id)).await;
                    return Ok(record);
                }
            }
        }
    }

    // ── Access tracking ────────────────────────────────────────────────────

    /// Bump `access_count` by exactly 1 and refresh `last_accessed_at` for
    /// every *distinct* id supplied; repeated ids in one call count once.
    /// Unknown ids are skipped.  Returns how many records were touched.
    pub async fn touch(&self, ids: &[RecordId]) -> Result<usize> {
        let distinct: BTreeSet<&RecordId> = ids.iter().collect();
        let now = Utc::now();
        let mut touched = 0;
        for id in distinct {
            match self.locate(id).await? {
                Some((collection, mut record)) => {
                    record.access_count += 1;
                    record.last_accessed_at = now;
                    self.store
                        .update_metadata(&collection, id.as_str(), record.to_metadata())
                        .await
                        .map_err(MemoryError::backend)?;
                    touched += 1;
                }
                None => debug!(%id, "touch skipped unknown record"),
            }
        }
        Ok(touched)
    }

    /// Best-effort touch used by read paths: a tracking failure must never
    /// break retrieval.
    pub(crate) async fn touch_quietly(&self, ids: &[RecordId]) {
        if ids.is_empty() {
            return;
        }
        if let Err(err) = self.touch(ids).await {
            warn!(%err, "access tracking failed; continuing");
        }
    }

    // ── Agents ─────────────────────────────────────────────────────────────

    /// Register a new persona and persist its profile into the Village realm
    /// so other agents can discover it.  Identity fields are immutable; a
    /// duplicate id is a validation error.
    pub async fn register_agent(&mut self, profile: AgentProfile) -> Result<RecordId> {
        if self.roster.get(&profile.id).is_some() {
            return Err(MemoryError::Validation(format!(
                "agent {} is already registered",
                profile.id
            )));
        }

        let mut record = KnowledgeRecord::new(
            render_profile(&profile),
            Realm::Village,
            &profile.id,
            WriteRequest { category: PROFILE_CATEGORY.to_string(), ..Default::default() },
            profile.created_at,
        )?;
        record.profile = Some(profile.clone());
        let record_id = self.persist(record).await?;

        self.roster.register(profile.clone())?;
        info!(agent = %profile.id, generation = profile.generation, "agent registered");
        Ok(record_id)
    }

    /// All registered profiles, active and inactive, ordered by id.
    pub fn list_agents(&self) -> Vec<AgentProfile> {
        self.roster.list()
    }

    pub fn get_agent(&self, id: &AgentId) -> Option<&AgentProfile> {
        self.roster.get(id)
    }

    /// Deactivate a persona.  The profile is kept — never deleted — and the
    /// flag is mirrored onto the persisted Village profile record.
    pub async fn deactivate_agent(&mut self, id: &AgentId) -> Result<()> {
        self.roster.deactivate(id)?;

        let collection = self.router.collection_for(&Realm::Village);
        let docs = self
            .store
            .get(collection, GetRequest::by_filter(profile_filter()))
            .await
            .map_err(MemoryError::backend)?;
        for mut record in parse_docs_lossy(docs) {
            let matches = record.profile.as_ref().is_some_and(|p| &p.id == id);
            if !matches {
                continue;
            }
            if let Some(profile) = record.profile.as_mut() {
                profile.active = false;
            }
            // The in-process roster stays authoritative if this mirror fails.
            if let Err(err) = self
                .store
                .update_metadata(collection, record.id.as_str(), record.to_metadata())
                .await
            {
                warn!(agent = %id, %err, "failed to mirror deactivation onto profile record");
            }
        }
        info!(agent = %id, "agent deactivated");
        Ok(())
    }

    /// First Village post of a freshly registered persona.
    pub async fn introduce_agent(
        &self,
        agent: &AgentId,
        greeting: &str,
        thread: Option<String>,
    ) -> Result<RecordId> {
        let profile = self
            .roster
            .get(agent)
            .ok_or_else(|| MemoryError::NotFound(format!("agent {agent}")))?;
        if !profile.active {
            return Err(MemoryError::AccessDenied(format!("agent {agent} is deactivated")));
        }
        let thread =
            thread.unwrap_or_else(|| format!("introduction_{agent}_{}", Utc::now().format("%Y%m%d")));
        let request = WriteRequest {
            category: "cultural".to_string(),
            thread_id: Some(thread),
            ..Default::default()
        };
        self.write(greeting, Realm::Village, request, agent).await
    }

    /// Rebuild the roster from persisted Village profile records.  Ids that
    /// are already registered are left untouched; returns how many profiles
    /// were restored.
    pub async fn load_agents(&mut self) -> Result<usize> {
        let collection = self.router.collection_for(&Realm::Village);
        let docs = self
            .store
            .get(collection, GetRequest::by_filter(profile_filter()))
            .await
            .map_err(MemoryError::backend)?;

        let mut records = parse_docs_lossy(docs);
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut restored = 0;
        for record in records {
            if let Some(profile) = record.profile {
                if self.roster.restore(profile) {
                    restored += 1;
                }
            }
        }
        if restored > 0 {
            info!(restored, "agent roster loaded from village profiles");
        }
        Ok(restored)
    }

    // ── Stats ──────────────────────────────────────────────────────────────

    pub async fn stats(&self) -> Result<MemoryStats> {
        let [private, village, bridges] = self.router.all_collections();
        let (private_total, private_dead) = self.collection_census(private).await?;
        let (village_total, village_dead) = self.collection_census(village).await?;
        let (bridge_total, bridge_dead) = self.collection_census(bridges).await?;

        Ok(MemoryStats {
            total: private_total + village_total + bridge_total,
            private: private_total,
            village: village_total,
            bridges: bridge_total,
            tombstoned: private_dead + village_dead + bridge_dead,
            registered_agents: self.roster.len(),
            active_agents: self.roster.active_count(),
        })
    }

    async fn collection_census(&self, collection: &str) -> Result<(usize, usize)> {
        let docs = self
            .store
            .get(collection, GetRequest::default())
            .await
            .map_err(MemoryError::backend)?;
        let records = parse_docs_lossy(docs);
        let tombstoned = records.iter().filter(|r| r.is_tombstoned()).count();
        Ok((records.len(), tombstoned))
    }

    // ── Internal helpers ───────────────────────────────────────────────────

    /// Find a record by id across the realm collections, without any access
    /// check or tracking.
    pub(crate) async fn locate(&self, id: &RecordId) -> Result<Option<(String, KnowledgeRecord)>> {
        for collection in self.router.all_collections() {
            let docs = self
                .store
                .get(collection, GetRequest::by_ids([id.as_str()]))
                .await
                .map_err(MemoryError::backend)?;
            if let Some(doc) = docs.into_iter().next() {
                return match KnowledgeRecord::from_parts(&doc.id, &doc.text, &doc.metadata) {
                    Ok(record) => Ok(Some((collection.to_string(), record))),
                    Err(err) => {
                        warn!(%id, %err, "skipping malformed record");
                        Ok(None)
                    }
                };
            }
        }
        Ok(None)
    }

    /// All records of one realm, scope-checked for `actor`.
    pub(crate) async fn fetch_realm_records(
        &self,
        realm: &Realm,
        actor: &AgentId,
        limit: Option<usize>,
    ) -> Result<Vec<KnowledgeRecord>> {
        if !realm.readable_by(actor) {
            return Err(MemoryError::AccessDenied(format!(
                "{actor} may not read the {} realm",
                realm.label().to_ascii_lowercase()
            )));
        }
        let collection = self.router.collection_for(realm);
        let docs = self
            .store
            .get(collection, GetRequest {
                ids: None,
                filter: Some(RealmRouter::realm_filter(realm)),
                limit,
            })
            .await
            .map_err(MemoryError::backend)?;
        Ok(parse_docs_lossy(docs))
    }
}

fn profile_filter() -> MetadataFilter {
    let mut filter = MetadataFilter::new();
    filter.insert("category".to_string(), json!(PROFILE_CATEGORY));
    filter
}

pub(crate) fn parse_doc_lossy(
    id: &str,
    text: &str,
    metadata: &serde_json::Value,
) -> Option<KnowledgeRecord> {
    match KnowledgeRecord::from_parts(id, text, metadata) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(id, %err, "skipping malformed record");
            None
        }
    }
}

pub(crate) fn parse_docs_lossy(docs: Vec<StoredDoc>) -> Vec<KnowledgeRecord> {
    docs.into_iter()
        .filter_map(|doc| parse_doc_lossy(&doc.id, &doc.text, &doc.metadata))
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
