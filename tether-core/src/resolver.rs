//! Stage resolver
//!
//! Turns a job's `needs` graph into a linear execution plan. At every step the
//! earliest-declared stage whose prerequisites are all placed is chosen next,
//! so plans are reproducible across runs and follow the document where the
//! graph allows it.

use std::collections::HashMap;

use thiserror::Error;

use crate::domain::detail::StageDetail;
use crate::domain::job::Stages;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("stage `{stage}` needs unknown stage `{dependency}`")]
    MissingDependency { stage: String, dependency: String },

    #[error("dependency cycle between stages: {}", .stages.join(", "))]
    Cycle { stages: Vec<String> },
}

/// Resolves stages into execution order
///
/// Fails without a partial order if any `needs` entry is dangling or the
/// graph has a cycle.
pub fn resolve(stages: &Stages) -> Result<Vec<StageDetail>, ResolveError> {
    let entries: Vec<_> = stages.iter().collect();
    let index: HashMap<&str, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.as_str(), i))
        .collect();

    // Dangling references first so the error names the real problem
    let mut needs: Vec<Vec<usize>> = Vec::with_capacity(entries.len());
    for (name, stage) in &entries {
        let mut deps = Vec::with_capacity(stage.needs.len());
        for dependency in &stage.needs {
            let &i = index
                .get(dependency.as_str())
                .ok_or_else(|| ResolveError::MissingDependency {
                    stage: (*name).clone(),
                    dependency: dependency.clone(),
                })?;
            deps.push(i);
        }
        needs.push(deps);
    }

    let mut placed = vec![false; entries.len()];
    let mut order = Vec::with_capacity(entries.len());

    while order.len() < entries.len() {
        let next = (0..entries.len())
            .find(|&i| !placed[i] && needs[i].iter().all(|&dep| placed[dep]));

        match next {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => {
                let stages = (0..entries.len())
                    .filter(|&i| !placed[i])
                    .map(|i| entries[i].0.clone())
                    .collect();
                return Err(ResolveError::Cycle { stages });
            }
        }
    }

    Ok(order
        .into_iter()
        .map(|i| StageDetail::new(entries[i].0, entries[i].1))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::Stage;

    fn stage(needs: &[&str]) -> Stage {
        Stage {
            needs: needs.iter().map(|s| s.to_string()).collect(),
            steps: Vec::new(),
        }
    }

    fn graph(edges: &[(&str, &[&str])]) -> Stages {
        edges.iter()
            .map(|(name, needs)| (name.to_string(), stage(needs)))
            .collect()
    }

    fn names(plan: &[StageDetail]) -> Vec<&str> {
        plan.iter().map(|s| s.name.as_str()).collect()
    }

    fn assert_dependencies_first(stages: &Stages, plan: &[StageDetail]) {
        let position: HashMap<&str, usize> = plan
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        assert_eq!(position.len(), stages.len());
        for (name, stage) in stages.iter() {
            for dep in &stage.needs {
                assert!(
                    position[dep.as_str()] < position[name.as_str()],
                    "{dep} must run before {name}"
                );
            }
        }
    }

    #[test]
    fn test_linear_chain() {
        let stages = graph(&[("A", &[]), ("B", &["A"])]);
        assert_eq!(names(&resolve(&stages).unwrap()), vec!["A", "B"]);
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let stages = graph(&[("deploy", &["build"]), ("build", &[]), ("lint", &[])]);
        let plan = resolve(&stages).unwrap();
        assert_eq!(names(&plan), vec!["build", "deploy", "lint"]);
    }

    #[test]
    fn test_dependencies_always_precede_dependents() {
        let graphs = [
            graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]),
            graph(&[("d", &["b", "c"]), ("c", &["a"]), ("b", &["a"]), ("a", &[])]),
            graph(&[("x", &[]), ("y", &[]), ("z", &["y", "x"]), ("w", &["z", "z"])]),
            graph(&[("solo", &[])]),
        ];

        for stages in &graphs {
            let plan = resolve(stages).unwrap();
            assert_dependencies_first(stages, &plan);
        }
    }

    #[test]
    fn test_plan_is_deterministic() {
        let stages = graph(&[("c", &[]), ("b", &[]), ("a", &["c"])]);
        let first = names(&resolve(&stages).unwrap())
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        for _ in 0..10 {
            let again: Vec<String> = resolve(&stages)
                .unwrap()
                .into_iter()
                .map(|s| s.name)
                .collect();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_missing_dependency() {
        let stages = graph(&[("A", &[]), ("B", &["ghost"])]);
        assert_eq!(
            resolve(&stages),
            Err(ResolveError::MissingDependency {
                stage: "B".into(),
                dependency: "ghost".into()
            })
        );
    }

    #[test]
    fn test_cycle_reports_unplaced_stages() {
        let stages = graph(&[("root", &[]), ("a", &["b"]), ("b", &["a"])]);
        assert_eq!(
            resolve(&stages),
            Err(ResolveError::Cycle {
                stages: vec!["a".into(), "b".into()]
            })
        );

        let self_loop = graph(&[("a", &["a"])]);
        assert!(matches!(resolve(&self_loop), Err(ResolveError::Cycle { .. })));
    }
}
