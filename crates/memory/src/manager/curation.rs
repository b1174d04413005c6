//! Memory health: staleness scans, near-duplicate detection, consolidation.
//!
//! Curation reads never bump access counts — that would erase the staleness
//! signal they measure.  Consolidation tombstones the losing record instead
//! of deleting it, so stale references keep resolving.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use tracing::info;

use crate::error::{MemoryError, Result};
use crate::realms::RealmRouter;
use crate::schema::{AgentId, KnowledgeRecord, Realm, RecordId};
use crate::store::{QueryRequest, similarity_from_distance};

use super::MemoryManager;

/// Which of a near-duplicate pair survives consolidation.  Ties under the
/// comparing policies break toward the lower record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepPolicy {
    HigherAccess,
    HigherConfidence,
    PreferFirst,
    PreferSecond,
}

/// A near-duplicate candidate pair, ordered so `first.id < second.id`.
#[derive(Debug, Clone)]
pub struct DuplicatePair {
    pub first: KnowledgeRecord,
    pub second: KnowledgeRecord,
    pub similarity: f32,
}

impl MemoryManager {
    /// Records in `realm` idle for at least `idle`, stalest first.
    pub async fn find_stale(
        &self,
        realm: &Realm,
        idle: Duration,
        actor: &AgentId,
    ) -> Result<Vec<KnowledgeRecord>> {
        let now = Utc::now();
        let scan_limit = self.config().curator.scan_limit;
        let mut stale: Vec<KnowledgeRecord> = self
            .fetch_realm_records(realm, actor, Some(scan_limit))
            .await?
            .into_iter()
            .filter(|r| !r.is_tombstoned() && r.staleness(now) >= idle)
            .collect();

        stale.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(stale)
    }

    /// Cross-record pairs in `realm` whose content similarity is at least
    /// `threshold`.  Self-pairs, tombstoned records, and order-duplicates are
    /// excluded; byte-identical contents short-circuit to similarity 1.0.
    pub async fn find_duplicates(
        &self,
        realm: &Realm,
        threshold: f32,
        actor: &AgentId,
    ) -> Result<Vec<DuplicatePair>> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(MemoryError::Validation(format!(
                "duplicate threshold must be within [0, 1], got {threshold}"
            )));
        }

        let curator = &self.config().curator;
        let records = self
            .fetch_realm_records(realm, actor, Some(curator.scan_limit))
            .await?;
        let live: BTreeMap<RecordId, KnowledgeRecord> = records
            .into_iter()
            .filter(|r| !r.is_tombstoned())
            .map(|r| (r.id.clone(), r))
            .collect();

        let collection = self.router().collection_for(realm);
        let mut pairs: BTreeMap<(RecordId, RecordId), f32> = BTreeMap::new();

        for record in live.values() {
            let hits = self
                .store()
                .query(collection, QueryRequest {
                    text: Some(record.content.clone()),
                    vector: None,
                    filter: Some(RealmRouter::realm_filter(realm)),
                    top_k: curator.duplicate_probe_k + 1,
                })
                .await
                .map_err(MemoryError::backend)?;

            for hit in hits {
                if hit.id == record.id.as_str() {
                    continue;
                }
                let Some(other) = live.get(&RecordId::new(hit.id.as_str())) else {
                    continue;
                };
                let similarity = if record.content_hash == other.content_hash {
                    1.0
                } else {
                    similarity_from_distance(hit.distance)
                };
                if similarity < threshold {
                    continue;
                }
                let key = if record.id < other.id {
                    (record.id.clone(), other.id.clone())
                } else {
                    (other.id.clone(), record.id.clone())
                };
                pairs.entry(key).or_insert(similarity);
            }
        }

        let mut result: Vec<DuplicatePair> = pairs
            .into_iter()
            .map(|((a, b), similarity)| DuplicatePair {
                first: live[&a].clone(),
                second: live[&b].clone(),
                similarity,
            })
            .collect();
        result.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.first.id.cmp(&b.first.id))
                .then_with(|| a.second.id.cmp(&b.second.id))
        });
        Ok(result)
    }

    /// Merge a near-duplicate pair into one survivor.
    ///
    /// The survivor absorbs the loser's access count, keeps the higher
    /// confidence and the most recent access time, and keeps **its own**
    /// content (the loser's content is intentionally not merged).  The loser
    /// stays in the store, tombstoned toward the survivor.  A repeated
    /// consolidate of the same pair fails with `AlreadyConsolidated` — this
    /// is also the guard against two concurrent merges double-counting.
    pub async fn consolidate(
        &self,
        first: &RecordId,
        second: &RecordId,
        keep: KeepPolicy,
        actor: &AgentId,
    ) -> Result<KnowledgeRecord> {
        if first == second {
            return Err(MemoryError::SameRecord(first.clone()));
        }

        let (first_collection, a) = self
            .locate(first)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("record {first}")))?;
        let (second_collection, b) = self
            .locate(second)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("record {second}")))?;

        for record in [&a, &b] {
            if !record.realm.readable_by(actor) {
                return Err(MemoryError::AccessDenied(format!(
                    "{actor} may not consolidate record {}",
                    record.id
                )));
            }
        }
        if a.is_tombstoned() {
            return Err(MemoryError::AlreadyConsolidated(a.id));
        }
        if b.is_tombstoned() {
            return Err(MemoryError::AlreadyConsolidated(b.id));
        }

        let keep_first = match keep {
            KeepPolicy::HigherAccess => match a.access_count.cmp(&b.access_count) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => a.id < b.id,
            },
            KeepPolicy::HigherConfidence => {
                if a.confidence != b.confidence {
                    a.confidence > b.confidence
                } else {
                    a.id < b.id
                }
            }
            KeepPolicy::PreferFirst => true,
            KeepPolicy::PreferSecond => false,
        };
        let (survivor_collection, mut survivor, loser_collection, mut loser) = if keep_first {
            (first_collection, a, second_collection, b)
        } else {
            (second_collection, b, first_collection, a)
        };

        survivor.access_count += loser.access_count;
        survivor.confidence = survivor.confidence.max(loser.confidence);
        survivor.last_accessed_at = survivor.last_accessed_at.max(loser.last_accessed_at);
        loser.tombstoned_into = Some(survivor.id.clone());

        self.store()
            .update_metadata(&survivor_collection, survivor.id.as_str(), survivor.to_metadata())
            .await
            .map_err(MemoryError::backend)?;
        self.store()
            .update_metadata(&loser_collection, loser.id.as_str(), loser.to_metadata())
            .await
            .map_err(MemoryError::backend)?;

        info!(
            survivor = %survivor.id,
            tombstoned = %loser.id,
            policy = ?keep,
            access_count = survivor.access_count,
            "records consolidated"
        );
        Ok(survivor)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
