use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// A buffered operation waiting for the next flush
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// `op_<n>`, unique per scheduler
    pub id: String,
    pub command: String,
    pub params: Value,
    /// Higher runs earlier
    pub priority: i32,
    /// Ids that must run before this one
    pub depends_on: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Insertion order, breaks priority ties
    pub sequence: u64,
}

/// Whether buffering `id` with `depends_on` next to `buffered` would close a
/// dependency cycle. Ids outside `buffered` end the walk.
pub fn closes_cycle(buffered: &[Operation], id: &str, depends_on: &[String]) -> bool {
    let by_id: HashMap<&str, &Operation> =
        buffered.iter().map(|op| (op.id.as_str(), op)).collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = depends_on.iter().map(String::as_str).collect();
    while let Some(next) = stack.pop() {
        if next == id {
            return true;
        }
        if !seen.insert(next) {
            continue;
        }
        if let Some(op) = by_id.get(next) {
            stack.extend(op.depends_on.iter().map(String::as_str));
        }
    }
    false
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// Order operations so every dependency precedes its dependents.
///
/// Roots are visited by descending priority, ties by insertion order, and
/// each node's dependencies are visited in that same rank before the node
/// itself. Dependencies on ids outside `operations` count as satisfied. A
/// cycle fails with a `ValidationError` naming an operation on the cycle.
pub fn order_operations(operations: Vec<Operation>) -> Result<Vec<Operation>, ValidationError> {
    let count = operations.len();

    let mut ranked: Vec<usize> = (0..count).collect();
    ranked.sort_by_key(|&i| (-(operations[i].priority as i64), operations[i].sequence));

    let mut rank = vec![0usize; count];
    for (position, &index) in ranked.iter().enumerate() {
        rank[index] = position;
    }

    let index_of: HashMap<&str, usize> = operations
        .iter()
        .enumerate()
        .map(|(i, op)| (op.id.as_str(), i))
        .collect();

    let edges: Vec<Vec<usize>> = operations
        .iter()
        .map(|op| {
            let mut deps: Vec<usize> = op
                .depends_on
                .iter()
                .filter_map(|dep| index_of.get(dep.as_str()).copied())
                .collect();
            deps.sort_by_key(|&d| rank[d]);
            deps.dedup();
            deps
        })
        .collect();

    let mut marks = vec![Mark::White; count];
    let mut order = Vec::with_capacity(count);

    for &root in &ranked {
        if marks[root] != Mark::White {
            continue;
        }

        // (node, index of the next dependency to visit)
        let mut stack = vec![(root, 0usize)];
        marks[root] = Mark::Grey;

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            match edges[node].get(next) {
                Some(&dep) => {
                    frame.1 += 1;
                    match marks[dep] {
                        Mark::White => {
                            marks[dep] = Mark::Grey;
                            stack.push((dep, 0));
                        }
                        Mark::Grey => {
                            let id = &operations[dep].id;
                            return Err(ValidationError::new(
                                id,
                                format!("dependency cycle detected at operation {}", id),
                            ));
                        }
                        Mark::Black => {}
                    }
                }
                None => {
                    stack.pop();
                    marks[node] = Mark::Black;
                    order.push(node);
                }
            }
        }
    }

    let mut slots: Vec<Option<Operation>> = operations.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}
