use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

// ── Store config ──────────────────────────────────────────────────────────────

/// Physical layout of the backing vector store.
///
/// The three realm collections mirror the canonical deployment: one
/// collection per realm kind, with per-record metadata carrying the exact
/// realm.  Realm enforcement always happens in the partition layer,
/// independent of this layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub private_collection: String,
    pub village_collection: String,
    pub bridge_collection: String,
    /// Over-fetch multiplier applied when a scoped query must be
    /// post-filtered before truncating to the caller's `top_k`.
    pub query_overfetch: usize,
    /// Hard ceiling on any single query's `top_k`.
    pub max_top_k: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            private_collection: "knowledge_private".to_string(),
            village_collection: "knowledge_village".to_string(),
            bridge_collection: "knowledge_bridges".to_string(),
            query_overfetch: 4,
            max_top_k: 50,
        }
    }
}

// ── Continuity config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuityConfig {
    /// Default recall window in hours when the caller does not supply one.
    pub default_lookback_hours: u64,
    /// Default maximum notes returned per recall.
    pub default_limit: usize,
    /// Upper bound on notes fetched from the store before filtering.
    pub fetch_ceiling: usize,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            default_lookback_hours: 24,
            default_limit: 5,
            fetch_ceiling: 200,
        }
    }
}

// ── Convergence config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Default detection window in hours.
    pub window_hours: u64,
    /// Minimum pairwise similarity for two statements to connect at all.
    pub resonance_threshold: f32,
    /// Minimum *cluster-wide* pairwise similarity for the Consensus tier.
    pub consensus_threshold: f32,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            resonance_threshold: 0.70,
            consensus_threshold: 0.85,
        }
    }
}

// ── Curator config ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratorConfig {
    /// A record idle for at least this many days counts as stale.
    pub stale_after_days: u64,
    /// Minimum content similarity for a near-duplicate pair.
    pub duplicate_threshold: f32,
    /// Nearest-neighbour probe width used per record during duplicate scans.
    pub duplicate_probe_k: usize,
    /// Maximum records examined in one curation scan.
    pub scan_limit: usize,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            stale_after_days: 30,
            duplicate_threshold: 0.95,
            duplicate_probe_k: 5,
            scan_limit: 500,
        }
    }
}

// ── Telemetry config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// ── AppConfig ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub continuity: ContinuityConfig,
    pub convergence: ConvergenceConfig,
    pub curator: CuratorConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        // Log level env override (takes precedence over config file).
        if let Ok(level) = env::var("VILLAGE_LOG_LEVEL") {
            if !level.is_empty() {
                config.telemetry.log_level = level;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Reject configurations that would silently disable realm scoping,
    /// convergence tiering, or curation.
    pub fn validate(&self) -> Result<()> {
        if self.store.query_overfetch == 0 || self.store.max_top_k == 0 {
            bail!("store.query_overfetch and store.max_top_k must be positive");
        }
        if self.continuity.default_limit == 0 || self.continuity.fetch_ceiling == 0 {
            bail!("continuity.default_limit and continuity.fetch_ceiling must be positive");
        }
        for (name, value) in [
            ("convergence.resonance_threshold", self.convergence.resonance_threshold),
            ("convergence.consensus_threshold", self.convergence.consensus_threshold),
            ("curator.duplicate_threshold", self.curator.duplicate_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be within [0, 1], got {value}");
            }
        }
        if self.convergence.consensus_threshold < self.convergence.resonance_threshold {
            bail!(
                "convergence.consensus_threshold ({}) must be at least resonance_threshold ({})",
                self.convergence.consensus_threshold,
                self.convergence.resonance_threshold
            );
        }
        if self.curator.duplicate_probe_k == 0 || self.curator.scan_limit == 0 {
            bail!("curator.duplicate_probe_k and curator.scan_limit must be positive");
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
