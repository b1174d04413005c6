//! Realm partitioning: collection routing and read-scope computation.
//!
//! The physical layout is one collection per realm kind, with the exact
//! realm carried in each record's metadata.  Enforcement never relies on the
//! layout alone: every read path re-filters results against the actor's
//! allowed-realm predicate even though the store-side filter already scopes
//! them (defense in depth).

use serde_json::json;
use village_config::StoreConfig;

use crate::error::{MemoryError, Result};
use crate::schema::{AgentId, Realm};
use crate::store::MetadataFilter;

/// One collection to query plus the store-side filter to apply there.
#[derive(Debug, Clone)]
pub struct SearchTarget {
    pub collection: String,
    pub filter: Option<MetadataFilter>,
}

#[derive(Debug, Clone)]
pub struct RealmRouter {
    private: String,
    village: String,
    bridges: String,
}

impl RealmRouter {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            private: config.private_collection.clone(),
            village: config.village_collection.clone(),
            bridges: config.bridge_collection.clone(),
        }
    }

    pub fn collection_for(&self, realm: &Realm) -> &str {
        match realm {
            Realm::Private { .. } => &self.private,
            Realm::Village => &self.village,
            Realm::Bridge { .. } => &self.bridges,
        }
    }

    pub fn all_collections(&self) -> [&str; 3] {
        [&self.private, &self.village, &self.bridges]
    }

    /// Store-side filter matching exactly one realm.
    pub fn realm_filter(realm: &Realm) -> MetadataFilter {
        let mut filter = MetadataFilter::new();
        filter.insert("realm".to_string(), json!(realm));
        filter
    }

    /// The collections (and filters) to consult for `actor`.
    ///
    /// With no explicit realm the scope is everything the actor may read:
    /// their own private records, the whole village, and any bridge they are
    /// party to.  Bridge membership cannot be expressed as an exact-match
    /// store filter, so that collection is fetched unfiltered and results are
    /// post-filtered via [`Realm::readable_by`].
    pub fn targets_for(&self, actor: &AgentId, realm: Option<&Realm>) -> Result<Vec<SearchTarget>> {
        match realm {
            Some(realm) => {
                if !realm.readable_by(actor) {
                    return Err(MemoryError::AccessDenied(format!(
                        "{actor} may not read the {} realm",
                        realm.label().to_ascii_lowercase()
                    )));
                }
                Ok(vec![SearchTarget {
                    collection: self.collection_for(realm).to_string(),
                    filter: Some(Self::realm_filter(realm)),
                }])
            }
            None => Ok(vec![
                SearchTarget {
                    collection: self.private.clone(),
                    filter: Some(Self::realm_filter(&Realm::private(actor.clone()))),
                },
                SearchTarget { collection: self.village.clone(), filter: None },
                SearchTarget { collection: self.bridges.clone(), filter: None },
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> RealmRouter {
        RealmRouter::new(&StoreConfig::default())
    }

    #[test]
    fn routes_each_realm_to_its_collection() {
        let router = router();
        assert_eq!(router.collection_for(&Realm::private("AZOTH")), "knowledge_private");
        assert_eq!(router.collection_for(&Realm::Village), "knowledge_village");
        assert_eq!(
            router.collection_for(&Realm::bridge("AZOTH", "VAJRA")),
            "knowledge_bridges"
        );
    }

    #[test]
    fn unscoped_targets_cover_private_village_and_bridges() {
        let actor = AgentId::new("AZOTH");
        let targets = router().targets_for(&actor, None).unwrap();
        let collections: Vec<&str> = targets.iter().map(|t| t.collection.as_str()).collect();
        assert_eq!(
            collections,
            vec!["knowledge_private", "knowledge_village", "knowledge_bridges"]
        );
        // The private target is pinned to the actor's own realm.
        assert!(targets[0].filter.is_some());
    }

    #[test]
    fn explicit_unreadable_realm_is_denied() {
        let actor = AgentId::new("KETHER");
        let foreign = Realm::private("AZOTH");
        let err = router().targets_for(&actor, Some(&foreign)).unwrap_err();
        assert!(matches!(err, MemoryError::AccessDenied(_)));

        let bridge = Realm::bridge("AZOTH", "VAJRA");
        assert!(router().targets_for(&actor, Some(&bridge)).is_err());
    }

    #[test]
    fn explicit_bridge_target_filters_on_the_exact_realm() {
        let actor = AgentId::new("AZOTH");
        let bridge = Realm::bridge("AZOTH", "VAJRA");
        let targets = router().targets_for(&actor, Some(&bridge)).unwrap();
        assert_eq!(targets.len(), 1);
        let filter = targets[0].filter.as_ref().unwrap();
        assert_eq!(filter["realm"]["kind"], "bridge");
    }
}
