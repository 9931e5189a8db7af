//! Foreign-key dependency ordering
//!
//! Inserts go parents first; deletes go children first. Both are a
//! topological sort over "references" edges that releases ready nodes in
//! attach order, so the same session state always yields the same batch.

use std::collections::{BTreeSet, HashMap};

use crate::errors::{KeelError, Result};
use crate::model::Identity;

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) identity: Identity,
    pub(crate) seq: u64,
    /// Identities this row's foreign keys point at
    pub(crate) references: Vec<Identity>,
}

/// Order so every referenced node precedes its referrers
pub(crate) fn order_inserts(nodes: &[Node]) -> Result<Vec<Identity>> {
    topological(nodes, |referrer, referenced| (referenced, referrer))
}

/// Order so every referrer precedes the nodes it references
pub(crate) fn order_deletes(nodes: &[Node]) -> Result<Vec<Identity>> {
    topological(nodes, |referrer, referenced| (referrer, referenced))
}

/// Kahn's algorithm; `edge` maps (referrer, referenced) to (before, after)
fn topological(
    nodes: &[Node],
    edge: impl Fn(usize, usize) -> (usize, usize),
) -> Result<Vec<Identity>> {
    let index: HashMap<&Identity, usize> = nodes
        .iter()
        .enumerate()
        .map(|(position, node)| (&node.identity, position))
        .collect();

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut pending = vec![0usize; nodes.len()];
    for (referrer, node) in nodes.iter().enumerate() {
        for target in &node.references {
            // References outside the set are already in storage.
            let Some(&referenced) = index.get(target) else {
                continue;
            };
            if referenced == referrer {
                continue;
            }
            let (before, after) = edge(referrer, referenced);
            successors[before].push(after);
            pending[after] += 1;
        }
    }

    let mut ready: BTreeSet<(u64, usize)> = nodes
        .iter()
        .enumerate()
        .filter(|(position, _)| pending[*position] == 0)
        .map(|(position, node)| (node.seq, position))
        .collect();

    let mut ordered = Vec::with_capacity(nodes.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        let (_, position) = next;
        ordered.push(nodes[position].identity.clone());
        for &after in &successors[position] {
            pending[after] -= 1;
            if pending[after] == 0 {
                ready.insert((nodes[after].seq, after));
            }
        }
    }

    if ordered.len() < nodes.len() {
        let identities = nodes
            .iter()
            .enumerate()
            .filter(|(position, _)| pending[*position] > 0)
            .map(|(_, node)| node.identity.to_string())
            .collect();
        return Err(KeelError::DependencyCycle { identities });
    }
    Ok(ordered)
}
