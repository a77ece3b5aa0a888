// ============================================================================
// Commit Order Resolution
// ============================================================================
//
// Orders entity types so that the target of every foreign key is written
// before the rows referencing it. Nodes live in an arena indexed by
// EntityTypeId; edges are indices into a flat edge list.
//
// Cycle handling:
// - two-type cycles drop the direction with the lower weight
//   (non-nullable = 1, nullable = 0); on equal weight the type registered
//   first keeps its dependency
// - a back-edge met during the walk closes a longer cycle; the lightest
//   edge on that cycle is dropped (the back-edge on a tie) and the walk
//   starts over until no cycle is left
//
// Dropped ("deferred") edges and self-relations are resolved at commit time
// by the write passes in `store::commit`.
//
// ============================================================================

use super::{EntityType, EntityTypeId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unvisited,
    Visiting,
    Visited,
}

#[derive(Debug, Clone)]
struct Edge {
    from: usize,
    to: usize,
    weight: u8,
    relation: String,
}

/// Total order over entity types, memoized by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOrder {
    order: Vec<EntityTypeId>,
    positions: Vec<usize>,
    deferred: Vec<(EntityTypeId, String)>,
}

impl CommitOrder {
    pub fn as_slice(&self) -> &[EntityTypeId] {
        &self.order
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = EntityTypeId> + '_ {
        self.order.iter().copied()
    }

    pub fn position(&self, id: EntityTypeId) -> usize {
        self.positions[id.index()]
    }

    /// Relations dropped from the ordering graph to break cycles.
    pub fn deferred_relations(&self) -> &[(EntityTypeId, String)] {
        &self.deferred
    }

    pub fn is_deferred(&self, id: EntityTypeId, relation: &str) -> bool {
        self.deferred
            .iter()
            .any(|(ty, rel)| *ty == id && rel == relation)
    }
}

pub(crate) fn resolve_commit_order(types: &[EntityType]) -> CommitOrder {
    let n = types.len();
    let mut edges: Vec<Edge> = Vec::new();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];

    for ty in types {
        for rel in ty.owning_relations() {
            if rel.target == ty.id {
                continue;
            }
            adjacency[ty.id.0].push(edges.len());
            edges.push(Edge {
                from: ty.id.0,
                to: rel.target.0,
                weight: if rel.nullable { 0 } else { 1 },
                relation: rel.name.clone(),
            });
        }
    }

    let mut deferred = vec![false; edges.len()];
    break_two_type_cycles(&edges, &mut deferred);

    let order = loop {
        match walk(n, &adjacency, &edges, &deferred) {
            Walk::Ordered(order) => break order,
            Walk::Cycle(cycle) => {
                let lightest = lightest_edge(&edges, &cycle);
                deferred[lightest] = true;
            }
        }
    };

    let mut positions = vec![0; n];
    for (pos, id) in order.iter().enumerate() {
        positions[id.0] = pos;
    }

    let deferred = edges
        .iter()
        .zip(deferred)
        .filter(|(_, d)| *d)
        .map(|(e, _)| (EntityTypeId(e.from), e.relation.clone()))
        .collect();

    CommitOrder {
        order,
        positions,
        deferred,
    }
}

enum Walk {
    Ordered(Vec<EntityTypeId>),
    /// Edges of the first cycle met, the closing back-edge last.
    Cycle(Vec<usize>),
}

/// Post-order DFS over the edges that are still live.
fn walk(n: usize, adjacency: &[Vec<usize>], edges: &[Edge], deferred: &[bool]) -> Walk {
    let mut state = vec![Visit::Unvisited; n];
    let mut order = Vec::with_capacity(n);
    // (node, next adjacency slot, edge that led here)
    let mut stack: Vec<(usize, usize, Option<usize>)> = Vec::new();

    for root in 0..n {
        if state[root] != Visit::Unvisited {
            continue;
        }
        state[root] = Visit::Visiting;
        stack.push((root, 0, None));

        while let Some(top) = stack.last_mut() {
            let (node, cursor, _) = *top;
            if cursor < adjacency[node].len() {
                top.1 += 1;
                let edge = adjacency[node][cursor];
                if deferred[edge] {
                    continue;
                }
                let target = edges[edge].to;
                match state[target] {
                    Visit::Unvisited => {
                        state[target] = Visit::Visiting;
                        stack.push((target, 0, Some(edge)));
                    }
                    Visit::Visiting => {
                        let start = stack
                            .iter()
                            .rposition(|(frame, _, _)| *frame == target)
                            .unwrap_or(0);
                        let mut cycle: Vec<usize> =
                            stack[start + 1..].iter().filter_map(|f| f.2).collect();
                        cycle.push(edge);
                        return Walk::Cycle(cycle);
                    }
                    Visit::Visited => {}
                }
            } else {
                state[node] = Visit::Visited;
                order.push(EntityTypeId(node));
                stack.pop();
            }
        }
    }

    Walk::Ordered(order)
}

fn lightest_edge(edges: &[Edge], cycle: &[usize]) -> usize {
    // scanning from the back-edge keeps it on a tie
    let mut lightest = cycle[cycle.len() - 1];
    for &edge in cycle.iter().rev() {
        if edges[edge].weight < edges[lightest].weight {
            lightest = edge;
        }
    }
    lightest
}

fn break_two_type_cycles(edges: &[Edge], deferred: &mut [bool]) {
    // heaviest edge per direction
    let mut weights: HashMap<(usize, usize), u8> = HashMap::new();
    for edge in edges {
        let w = weights.entry((edge.from, edge.to)).or_insert(0);
        *w = (*w).max(edge.weight);
    }

    for (i, edge) in edges.iter().enumerate() {
        let Some(&reverse) = weights.get(&(edge.to, edge.from)) else {
            continue;
        };
        let forward = weights[&(edge.from, edge.to)];
        let drop = match forward.cmp(&reverse) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => edge.from > edge.to,
        };
        if drop {
            deferred[i] = true;
        }
    }
}
