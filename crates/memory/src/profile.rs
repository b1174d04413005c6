//! Agent roster: registered personas and their profiles.
//!
//! Profiles are registered once, their identity fields never change, and
//! they are never deleted — deactivation only flips the `active` flag.  The
//! roster is the in-process view; each profile is also persisted as a
//! Village record so other agents (and later processes) can discover it.

use std::collections::BTreeMap;

use crate::error::{MemoryError, Result};
use crate::schema::{AgentId, AgentProfile};

#[derive(Debug, Default)]
pub struct AgentRoster {
    agents: BTreeMap<AgentId, AgentProfile>,
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new agent.  Re-registering an existing id is a validation
    /// error: identity fields are immutable.
    pub fn register(&mut self, profile: AgentProfile) -> Result<()> {
        if self.agents.contains_key(&profile.id) {
            return Err(MemoryError::Validation(format!(
                "agent {} is already registered",
                profile.id
            )));
        }
        self.agents.insert(profile.id.clone(), profile);
        Ok(())
    }

    /// Insert a profile recovered from the store, skipping ids already
    /// present.  Returns whether the profile was inserted.
    pub fn restore(&mut self, profile: AgentProfile) -> bool {
        if self.agents.contains_key(&profile.id) {
            return false;
        }
        self.agents.insert(profile.id.clone(), profile);
        true
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentProfile> {
        self.agents.get(id)
    }

    /// All profiles, active and inactive, ordered by agent id.
    pub fn list(&self) -> Vec<AgentProfile> {
        self.agents.values().cloned().collect()
    }

    pub fn deactivate(&mut self, id: &AgentId) -> Result<()> {
        match self.agents.get_mut(id) {
            Some(profile) => {
                profile.active = false;
                Ok(())
            }
            None => Err(MemoryError::NotFound(format!("agent {id}"))),
        }
    }

    pub fn active_count(&self) -> usize {
        self.agents.values().filter(|p| p.active).count()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Human-readable profile block persisted into the Village realm.
pub fn render_profile(profile: &AgentProfile) -> String {
    format!(
        "Agent Profile: {}\n\nAgent ID: {}\nGeneration: {}\nLineage: {}\nSpecialization: {}\nRegistered: {}\n",
        profile.display_name,
        profile.id,
        profile.generation,
        profile.lineage,
        profile.specialization,
        profile.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str) -> AgentProfile {
        AgentProfile::new(id, format!("∴{id}∴"), 0, "Primus", "synthesis")
    }

    #[test]
    fn register_then_list_orders_by_id() {
        let mut roster = AgentRoster::new();
        roster.register(profile("VAJRA")).unwrap();
        roster.register(profile("AZOTH")).unwrap();

        let ids: Vec<String> = roster.list().iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["AZOTH", "VAJRA"]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut roster = AgentRoster::new();
        roster.register(profile("AZOTH")).unwrap();
        let err = roster.register(profile("AZOTH")).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn deactivate_keeps_the_profile() {
        let mut roster = AgentRoster::new();
        roster.register(profile("AZOTH")).unwrap();
        roster.deactivate(&AgentId::new("AZOTH")).unwrap();

        assert_eq!(roster.len(), 1);
        assert_eq!(roster.active_count(), 0);
        assert!(!roster.get(&AgentId::new("AZOTH")).unwrap().active);
    }

    #[test]
    fn deactivating_unknown_agent_is_not_found() {
        let mut roster = AgentRoster::new();
        let err = roster.deactivate(&AgentId::new("GHOST")).unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[test]
    fn restore_skips_already_registered_ids() {
        let mut roster = AgentRoster::new();
        roster.register(profile("AZOTH")).unwrap();
        assert!(!roster.restore(profile("AZOTH")));
        assert!(roster.restore(profile("ELYSIAN")));
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn rendered_profile_names_the_identity_fields() {
        let block = render_profile(&profile("AZOTH"));
        assert!(block.contains("Agent ID: AZOTH"));
        assert!(block.contains("Generation: 0"));
        assert!(block.contains("Specialization: synthesis"));
    }
}
