//! Convergence detection over a realm's recent records.
//!
//! Read-and-derive only: no writes and no access tracking, so running the
//! detector never disturbs the staleness signal the curator relies on.

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::convergence;
use crate::error::{MemoryError, Result};
use crate::schema::{AgentId, ConvergenceCluster, PROFILE_CATEGORY, Realm};

use super::MemoryManager;

/// Detection parameters.  `None` fields fall back to the `[convergence]`
/// config section; the realm defaults to the Village.
#[derive(Debug, Clone)]
pub struct ConvergenceQuery {
    pub window: Option<Duration>,
    pub realm: Realm,
    pub resonance_threshold: Option<f32>,
    pub consensus_threshold: Option<f32>,
}

impl Default for ConvergenceQuery {
    fn default() -> Self {
        Self {
            window: None,
            realm: Realm::Village,
            resonance_threshold: None,
            consensus_threshold: None,
        }
    }
}

impl MemoryManager {
    /// Group independently posted, semantically similar statements from
    /// distinct agents into ranked agreement clusters.
    pub async fn detect_convergence(
        &self,
        query: ConvergenceQuery,
        actor: &AgentId,
    ) -> Result<Vec<ConvergenceCluster>> {
        let cfg = &self.config().convergence;
        let window = query.window.unwrap_or_else(|| Duration::hours(cfg.window_hours as i64));
        let resonance = query.resonance_threshold.unwrap_or(cfg.resonance_threshold);
        let consensus = query.consensus_threshold.unwrap_or(cfg.consensus_threshold).max(resonance);
        for (name, value) in [("resonance", resonance), ("consensus", consensus)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::Validation(format!(
                    "{name} threshold must be within [0, 1], got {value}"
                )));
            }
        }

        let now = Utc::now();
        let window_start = now - window;
        let records = self.fetch_realm_records(&query.realm, actor, None).await?;

        let mut items = Vec::new();
        for record in records {
            // Profile records are registration artifacts, not statements.
            if record.is_tombstoned()
                || record.category == PROFILE_CATEGORY
                || record.created_at < window_start
                || record.created_at > now
            {
                continue;
            }
            match self.store().embed(&record.content).await {
                Ok(vector) => items.push((record, vector)),
                Err(err) => {
                    warn!(id = %record.id, %err, "skipping record whose embedding failed")
                }
            }
        }

        let clusters =
            convergence::cluster(&items, resonance, consensus, self.roster().active_count());
        debug!(
            analysed = items.len(),
            clusters = clusters.len(),
            realm = query.realm.slug(),
            "convergence detection complete"
        );
        Ok(clusters)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
