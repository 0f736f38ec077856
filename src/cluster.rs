//! Cluster formation over the pairwise match graph.
//!
//! The clusterer converts above-threshold matches into maximal connected
//! components with an arena-indexed disjoint set: record ids are mapped to
//! dense integer indices and union-find runs over flat parent/rank vectors.
//! No pointer graph, no ownership cycles.
//!
//! Matching is transitive by construction: A~B and B~C place A, B, and C in
//! one cluster even when A and C were never compared. That chaining is a
//! deliberate recall-over-precision tradeoff and is preserved exactly.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::matcher::MatchResult;

/// Arena-indexed disjoint set with path compression and union by rank.
#[derive(Debug)]
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            // Path halving keeps the tree flat without recursion.
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// One entity cluster: the record ids of a maximal connected component.
///
/// Members are sorted lexicographically; every record id of a batch belongs
/// to exactly one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Sorted member record ids.
    pub members: Vec<String>,
}

impl Cluster {
    /// Number of member records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True for a single-record cluster.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// True when the cluster absorbed more than one source record.
    #[must_use]
    pub fn is_merged(&self) -> bool {
        self.members.len() > 1
    }
}

/// Partitions a batch's record ids into entity clusters.
///
/// Every id in `record_ids` lands in exactly one cluster; ids that appear
/// in no match stay singletons. The result is the unique partition into
/// maximal connected components of the match graph, so it does not depend
/// on match ordering. Clusters are sorted by their smallest member id;
/// internal union-find representatives are not exposed.
///
/// Match endpoints that are not present in `record_ids` are ignored: the
/// partition covers the batch, not stray edges.
#[must_use]
pub fn cluster_matches(record_ids: &[String], matches: &[MatchResult]) -> Vec<Cluster> {
    let mut ids: Vec<&String> = record_ids.iter().collect();
    ids.sort_unstable();
    ids.dedup();

    let index_of = |id: &String| ids.binary_search(&id).ok();

    let mut uf = UnionFind::new(ids.len());
    for m in matches {
        let (Some(a), Some(b)) = (index_of(&m.record_a), index_of(&m.record_b)) else {
            continue;
        };
        uf.union(a, b);
    }

    let mut by_root: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for i in 0..ids.len() {
        let root = uf.find(i);
        by_root[root].push(i);
    }

    let mut clusters: Vec<Cluster> = by_root
        .into_iter()
        .filter(|members| !members.is_empty())
        .map(|members| Cluster {
            // Indices were assigned from the sorted id list, so member
            // order is already lexicographic.
            members: members.iter().map(|&i| ids[i].clone()).collect(),
        })
        .collect();
    clusters.sort_by(|a, b| a.members[0].cmp(&b.members[0]));

    debug!(
        records = ids.len(),
        matches = matches.len(),
        clusters = clusters.len(),
        "clustering complete"
    );

    clusters
}
