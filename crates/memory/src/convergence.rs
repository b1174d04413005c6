//! Cross-agent semantic-convergence clustering.
//!
//! Pure derivation: given Village records and their embeddings, build a
//! similarity graph over **cross-agent** pairs (records from the same agent
//! never connect), take connected components, and tier them.  Output order is
//! fully deterministic regardless of store iteration order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::schema::{ConvergenceCluster, ConvergenceTier, KnowledgeRecord};
use crate::store::cosine_similarity;

/// Cluster `records` (each paired with its embedding) into convergence
/// clusters.
///
/// * an edge connects two records of *different* agents with pairwise
///   similarity ≥ `resonance_threshold`;
/// * a connected component spanning ≥ 2 distinct agents is a Resonance
///   cluster;
/// * it is upgraded to Consensus when its minimum cross-agent pairwise
///   similarity ≥ `consensus_threshold` and it spans ≥ 3 distinct agents —
///   or every currently active agent (`active_agents`, 0 when unknown).
pub fn cluster(
    records: &[(KnowledgeRecord, Vec<f32>)],
    resonance_threshold: f32,
    consensus_threshold: f32,
    active_agents: usize,
) -> Vec<ConvergenceCluster> {
    let n = records.len();
    let mut dsu = DisjointSet::new(n);
    let mut pair_sims: HashMap<(usize, usize), f32> = HashMap::new();

    for i in 0..n {
        for j in (i + 1)..n {
            if records[i].0.owner == records[j].0.owner {
                continue;
            }
            let sim = cosine_similarity(&records[i].1, &records[j].1);
            pair_sims.insert((i, j), sim);
            if sim >= resonance_threshold {
                dsu.union(i, j);
            }
        }
    }

    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        components.entry(dsu.find(i)).or_default().push(i);
    }

    let mut clusters = Vec::new();
    for members in components.into_values() {
        let agents: BTreeSet<_> = members.iter().map(|&i| records[i].0.owner.clone()).collect();
        if members.len() < 2 || agents.len() < 2 {
            continue;
        }

        // Minimum similarity across the cluster's cross-agent pairs, not just
        // the edges that formed it — transitively joined members count too.
        let mut min_similarity = f32::INFINITY;
        for (a, &i) in members.iter().enumerate() {
            for &j in members.iter().skip(a + 1) {
                if records[i].0.owner == records[j].0.owner {
                    continue;
                }
                let key = if i < j { (i, j) } else { (j, i) };
                if let Some(&sim) = pair_sims.get(&key) {
                    min_similarity = min_similarity.min(sim);
                }
            }
        }
        if !min_similarity.is_finite() {
            continue;
        }

        let quorum = agents.len() >= 3 || (active_agents > 0 && agents.len() >= active_agents);
        let tier = if min_similarity >= consensus_threshold && quorum {
            ConvergenceTier::Consensus
        } else {
            ConvergenceTier::Resonance
        };

        let mut record_ids: Vec<_> = members.iter().map(|&i| records[i].0.id.clone()).collect();
        record_ids.sort();
        let earliest = members
            .iter()
            .map(|&i| records[i].0.created_at)
            .min()
            .expect("cluster has at least two members");

        clusters.push(ConvergenceCluster {
            tier,
            record_ids,
            agent_ids: agents.into_iter().collect(),
            min_similarity,
            earliest,
        });
    }

    clusters.sort_by(|a, b| {
        b.tier
            .cmp(&a.tier)
            .then_with(|| b.record_ids.len().cmp(&a.record_ids.len()))
            .then_with(|| a.earliest.cmp(&b.earliest))
            .then_with(|| a.agent_ids.cmp(&b.agent_ids))
    });
    clusters
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Attach the larger root under the smaller so roots are stable
            // under input permutation.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::schema::{AgentId, KnowledgeRecord, Realm, WriteRequest};

    use super::*;

    fn record(owner: &str, content: &str, age_minutes: i64) -> KnowledgeRecord {
        let actor = AgentId::new(owner);
        let now = Utc::now() - Duration::minutes(age_minutes);
        KnowledgeRecord::new(content, Realm::Village, &actor, WriteRequest::default(), now)
            .unwrap()
    }

    #[test]
    fn three_agents_above_consensus_threshold_form_one_consensus_cluster() {
        let items = vec![
            (record("AZOTH", "the glass sings at dawn", 3), vec![1.0, 0.0, 0.0]),
            (record("VAJRA", "the glass sings at sunrise", 2), vec![0.98, 0.2, 0.0]),
            (record("KETHER", "glass singing as day breaks", 1), vec![0.97, 0.0, 0.2]),
        ];

        let clusters = cluster(&items, 0.70, 0.85, 0);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].tier, ConvergenceTier::Consensus);
        assert_eq!(clusters[0].agent_ids.len(), 3);
        assert_eq!(clusters[0].record_ids.len(), 3);
    }

    #[test]
    fn two_agents_alone_reach_resonance_not_consensus() {
        let items = vec![
            (record("AZOTH", "the glass sings at dawn", 2), vec![1.0, 0.0, 0.0]),
            (record("VAJRA", "the glass sings at sunrise", 1), vec![0.98, 0.2, 0.0]),
        ];

        let clusters = cluster(&items, 0.70, 0.85, 0);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].tier, ConvergenceTier::Resonance);
    }

    #[test]
    fn two_agents_spanning_all_active_agents_reach_consensus() {
        let items = vec![
            (record("AZOTH", "the glass sings at dawn", 2), vec![1.0, 0.0, 0.0]),
            (record("VAJRA", "the glass sings at sunrise", 1), vec![0.98, 0.2, 0.0]),
        ];

        // Only two agents are active in the whole village, and both converge.
        let clusters = cluster(&items, 0.70, 0.85, 2);
        assert_eq!(clusters[0].tier, ConvergenceTier::Consensus);
    }

    #[test]
    fn same_agent_records_never_connect() {
        let items = vec![
            (record("AZOTH", "repeated idea", 2), vec![1.0, 0.0, 0.0]),
            (record("AZOTH", "repeated idea again", 1), vec![1.0, 0.0, 0.0]),
        ];

        assert!(cluster(&items, 0.70, 0.85, 0).is_empty());
    }

    #[test]
    fn dissimilar_statements_do_not_cluster() {
        let items = vec![
            (record("AZOTH", "the glass sings", 2), vec![1.0, 0.0, 0.0]),
            (record("VAJRA", "the market opened late", 1), vec![0.0, 1.0, 0.0]),
        ];

        assert!(cluster(&items, 0.70, 0.85, 0).is_empty());
    }

    #[test]
    fn high_edges_with_a_weak_transitive_pair_stay_resonance() {
        // A-B and B-C are strong, but A and C barely relate: the component's
        // minimum pairwise similarity drags it below the consensus bar.
        let items = vec![
            (record("AZOTH", "alpha", 3), vec![1.0, 0.0, 0.0]),
            (record("VAJRA", "between", 2), vec![0.7, 0.7, 0.0]),
            (record("KETHER", "gamma", 1), vec![0.0, 1.0, 0.0]),
        ];

        let clusters = cluster(&items, 0.70, 0.85, 0);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].agent_ids.len(), 3);
        assert_eq!(clusters[0].tier, ConvergenceTier::Resonance);
    }

    #[test]
    fn output_order_is_deterministic_under_input_permutation() {
        let a = (record("AZOTH", "first topic", 5), vec![1.0, 0.0, 0.0]);
        let b = (record("VAJRA", "first topic too", 4), vec![0.99, 0.1, 0.0]);
        let c = (record("KETHER", "second topic", 3), vec![0.0, 1.0, 0.0]);
        let d = (record("ELYSIAN", "second topic too", 2), vec![0.0, 0.99, 0.1]);

        let forward = cluster(&[a.clone(), b.clone(), c.clone(), d.clone()], 0.70, 0.85, 0);
        let reversed = cluster(&[d, c, b, a], 0.70, 0.85, 0);

        let ids = |cs: &[ConvergenceCluster]| {
            cs.iter().map(|c| c.record_ids.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&forward), ids(&reversed));
        assert_eq!(forward.len(), 2);
    }

    #[test]
    fn consensus_sorts_before_resonance() {
        let items = vec![
            // Consensus trio (later timestamps).
            (record("AZOTH", "t1", 1), vec![1.0, 0.0, 0.0]),
            (record("VAJRA", "t1b", 1), vec![0.99, 0.1, 0.0]),
            (record("KETHER", "t1c", 1), vec![0.99, 0.0, 0.1]),
            // Resonance pair (earlier timestamps).
            (record("AZOTH", "t2", 500), vec![0.0, 1.0, 0.0]),
            (record("VAJRA", "t2b", 500), vec![0.0, 0.95, 0.3]),
        ];

        let clusters = cluster(&items, 0.70, 0.95, 0);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].tier, ConvergenceTier::Consensus);
        assert_eq!(clusters[1].tier, ConvergenceTier::Resonance);
    }
}
