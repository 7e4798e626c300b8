use std::collections::{HashMap, HashSet, VecDeque};

use super::error::QueryError;
use super::types::DerivedQuery;

/// Static view of the batch's reference graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyPlan {
    /// Query ids in an order where every in-batch reference precedes its dependent.
    pub order: Vec<String>,
    /// Per query, referenced ids that are not part of the batch.
    pub missing: HashMap<String, Vec<String>>,
}

/// Orders the batch by Arithmetic references and rejects cycles (including a query that
/// references itself). Missing references are collected, not rejected: they fail only the
/// query that names them.
pub fn plan_dependencies(queries: &[DerivedQuery]) -> Result<DependencyPlan, QueryError> {
    let ids: HashSet<&str> = queries.iter().map(|q| q.id.as_str()).collect();

    let mut indegree: HashMap<&str, usize> = queries.iter().map(|q| (q.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut missing: HashMap<String, Vec<String>> = HashMap::new();

    for query in queries {
        for reference in query.references() {
            if ids.contains(reference.as_str()) {
                *indegree.entry(query.id.as_str()).or_insert(0) += 1;
                dependents
                    .entry(reference.as_str())
                    .or_default()
                    .push(query.id.as_str());
            } else {
                missing
                    .entry(query.id.clone())
                    .or_default()
                    .push(reference.clone());
            }
        }
    }

    // Seed in batch order so the plan is deterministic.
    let mut ready: VecDeque<&str> = queries
        .iter()
        .map(|q| q.id.as_str())
        .filter(|id| indegree.get(id).copied() == Some(0))
        .collect();

    let mut order: Vec<String> = Vec::with_capacity(queries.len());
    while let Some(id) = ready.pop_front() {
        order.push(id.to_string());
        if let Some(list) = dependents.get(id) {
            for dep in list {
                if let Some(entry) = indegree.get_mut(dep) {
                    *entry = entry.saturating_sub(1);
                    if *entry == 0 {
                        ready.push_back(*dep);
                    }
                }
            }
        }
    }

    if order.len() != queries.len() {
        let unresolved: HashSet<&str> = indegree
            .iter()
            .filter_map(|(id, deg)| if *deg > 0 { Some(*id) } else { None })
            .collect();
        let cycle = find_cycle(queries, &unresolved);
        let query_id = cycle
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        return Err(QueryError::DependencyCycle { query_id, cycle });
    }

    Ok(DependencyPlan { order, missing })
}

/// Walks references among unresolved queries until one repeats. Every unresolved query
/// references at least one other unresolved query, so the walk always closes.
fn find_cycle(queries: &[DerivedQuery], unresolved: &HashSet<&str>) -> Vec<String> {
    let by_id: HashMap<&str, &DerivedQuery> =
        queries.iter().map(|q| (q.id.as_str(), q)).collect();

    let Some(start) = queries
        .iter()
        .map(|q| q.id.as_str())
        .find(|id| unresolved.contains(id))
    else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|id| *id == current) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|id| id.to_string()).collect();
            cycle.push(current.to_string());
            return cycle;
        }
        path.push(current);
        let next = by_id.get(current).and_then(|query| {
            query
                .references()
                .iter()
                .map(String::as_str)
                .find(|reference| unresolved.contains(reference))
        });
        match next {
            Some(next) => current = next,
            None => return path.iter().map(|id| id.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::federation::types::{validate_batch, QuerySpec};

    fn arithmetic(id: &str, expression: &str) -> QuerySpec {
        QuerySpec {
            ref_id: id.to_string(),
            query_type: Some("Arithmetic".to_string()),
            expression: Some(expression.to_string()),
            ..Default::default()
        }
    }

    fn time_shift(id: &str) -> QuerySpec {
        QuerySpec {
            ref_id: id.to_string(),
            query: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn forward_references_are_ordered_after_their_inputs() {
        let queries = validate_batch(&[
            arithmetic("C", "A + B"),
            time_shift("A"),
            time_shift("B"),
        ])
        .expect("valid");
        let plan = plan_dependencies(&queries).expect("plan");
        let pos = |id: &str| plan.order.iter().position(|o| o == id).expect("present");
        assert!(pos("A") < pos("C"));
        assert!(pos("B") < pos("C"));
        assert!(plan.missing.is_empty());
    }

    #[test]
    fn mutual_references_are_a_cycle() {
        let queries =
            validate_batch(&[arithmetic("X", "Y + 1"), arithmetic("Y", "X + 1")]).expect("valid");
        let err = plan_dependencies(&queries).unwrap_err();
        match err {
            QueryError::DependencyCycle { query_id, cycle } => {
                assert_eq!(query_id, "X");
                assert_eq!(cycle, vec!["X", "Y", "X"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let queries = validate_batch(&[time_shift("A"), arithmetic("B", "B * 2 + A")])
            .expect("valid");
        let err = plan_dependencies(&queries).unwrap_err();
        assert_eq!(err.code(), "dependency_cycle");
        assert!(err.to_string().contains("B -> B"));
    }

    #[test]
    fn longer_cycles_are_found_across_the_batch() {
        let queries = validate_batch(&[
            arithmetic("P", "Q"),
            arithmetic("Q", "R"),
            arithmetic("R", "P"),
            time_shift("A"),
        ])
        .expect("valid");
        let err = plan_dependencies(&queries).unwrap_err();
        assert!(err.to_string().contains("P -> Q -> R -> P"));
    }

    #[test]
    fn missing_references_are_collected_per_query() {
        let queries = validate_batch(&[time_shift("A"), arithmetic("D", "A / C")]).expect("valid");
        let plan = plan_dependencies(&queries).expect("plan");
        assert_eq!(plan.missing.get("D"), Some(&vec!["C".to_string()]));
        assert_eq!(plan.order.len(), 2);
    }
}
