//! Step dependency graph

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::ConclaveError;
use crate::types::{Step, StepId};

/// Node in the step graph
#[derive(Debug, Clone)]
struct GraphNode {
    dependencies: Vec<StepId>,
    dependents: Vec<StepId>,
    fallback_for: Option<StepId>,
    fallback: Option<StepId>,
}

/// Validated DAG over the steps of one plan.
///
/// A fallback step is ordered after the step it stands in for.
#[derive(Debug, Clone)]
pub struct StepGraph {
    /// All nodes by step ID
    nodes: HashMap<StepId, GraphNode>,
    /// Plan order, used to keep every traversal deterministic
    order: Vec<StepId>,
    /// Topological order
    topo: Vec<StepId>,
}

impl StepGraph {
    /// Build and validate the graph for `steps`.
    ///
    /// Fails with `InvalidPlan` on duplicate ids, dangling references,
    /// misused fallbacks or cycles.
    pub fn build(steps: &[Step]) -> Result<Self, ConclaveError> {
        let mut nodes: HashMap<StepId, GraphNode> = HashMap::with_capacity(steps.len());
        let mut order = Vec::with_capacity(steps.len());

        for step in steps {
            if step.step_id.as_str().is_empty() {
                return Err(ConclaveError::InvalidPlan("empty step id".into()));
            }
            let node = GraphNode {
                dependencies: step.dependencies.iter().cloned().collect(),
                dependents: Vec::new(),
                fallback_for: step.fallback_for.clone(),
                fallback: None,
            };
            if nodes.insert(step.step_id.clone(), node).is_some() {
                return Err(ConclaveError::InvalidPlan(format!(
                    "duplicate step id '{}'",
                    step.step_id
                )));
            }
            order.push(step.step_id.clone());
        }

        for step in steps {
            for dep in &step.dependencies {
                if dep == &step.step_id {
                    return Err(ConclaveError::InvalidPlan(format!(
                        "step '{}' depends on itself",
                        step.step_id
                    )));
                }
                let target = nodes.get_mut(dep).ok_or_else(|| {
                    ConclaveError::InvalidPlan(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.step_id, dep
                    ))
                })?;
                if target.fallback_for.is_some() {
                    return Err(ConclaveError::InvalidPlan(format!(
                        "step '{}' depends on fallback step '{}'",
                        step.step_id, dep
                    )));
                }
                target.dependents.push(step.step_id.clone());
            }

            if let Some(primary) = &step.fallback_for {
                let target = nodes.get_mut(primary).ok_or_else(|| {
                    ConclaveError::InvalidPlan(format!(
                        "step '{}' is a fallback for unknown step '{}'",
                        step.step_id, primary
                    ))
                })?;
                if primary == &step.step_id || target.fallback_for.is_some() {
                    return Err(ConclaveError::InvalidPlan(format!(
                        "step '{}' cannot be a fallback for '{}'",
                        step.step_id, primary
                    )));
                }
                if let Some(existing) = &target.fallback {
                    return Err(ConclaveError::InvalidPlan(format!(
                        "step '{}' already has fallback '{}'",
                        primary, existing
                    )));
                }
                target.fallback = Some(step.step_id.clone());
            }
        }

        let mut graph = Self {
            nodes,
            order,
            topo: Vec::new(),
        };
        graph.topo = graph.topological_sort()?;
        Ok(graph)
    }

    /// Kahn's algorithm, seeded and drained in plan order
    fn topological_sort(&self) -> Result<Vec<StepId>, ConclaveError> {
        let mut in_degree: HashMap<&StepId, usize> = self
            .order
            .iter()
            .map(|id| (id, self.predecessors(id).count()))
            .collect();

        let mut queue: VecDeque<&StepId> = self
            .order
            .iter()
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            sorted.push(id.clone());
            for next in self.successors(id) {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if sorted.len() != self.order.len() {
            let placed: HashSet<&StepId> = sorted.iter().collect();
            let stuck: Vec<String> = self
                .order
                .iter()
                .filter(|id| !placed.contains(id))
                .map(|id| id.to_string())
                .collect();
            return Err(ConclaveError::InvalidPlan(format!(
                "dependency cycle among steps [{}]",
                stuck.join(", ")
            )));
        }

        Ok(sorted)
    }

    /// Dependencies plus the primary step for fallbacks
    fn predecessors<'a>(&'a self, id: &StepId) -> impl Iterator<Item = &'a StepId> + 'a {
        let node = self.nodes.get(id);
        node.into_iter()
            .flat_map(|n| n.dependencies.iter().chain(n.fallback_for.iter()))
    }

    /// Dependents plus the fallback step
    fn successors<'a>(&'a self, id: &StepId) -> impl Iterator<Item = &'a StepId> + 'a {
        let node = self.nodes.get(id);
        node.into_iter()
            .flat_map(|n| n.dependents.iter().chain(n.fallback.iter()))
    }

    /// Steps in an order where every step follows its predecessors
    pub fn topological_order(&self) -> &[StepId] {
        &self.topo
    }

    /// Direct dependencies
    pub fn dependencies(&self, id: &StepId) -> Vec<StepId> {
        self.nodes
            .get(id)
            .map(|n| n.dependencies.clone())
            .unwrap_or_default()
    }

    /// Fallback declared for `id`
    pub fn fallback_of(&self, id: &StepId) -> Option<&StepId> {
        self.nodes.get(id).and_then(|n| n.fallback.as_ref())
    }

    /// Step that `id` stands in for, if `id` is a fallback
    pub fn primary_of(&self, id: &StepId) -> Option<&StepId> {
        self.nodes.get(id).and_then(|n| n.fallback_for.as_ref())
    }

    /// Transitive dependencies
    pub fn ancestors(&self, id: &StepId) -> HashSet<StepId> {
        self.walk(id, |node| &node.dependencies)
    }

    /// Transitive dependents
    pub fn descendants(&self, id: &StepId) -> HashSet<StepId> {
        self.walk(id, |node| &node.dependents)
    }

    fn walk<F>(&self, start: &StepId, edges: F) -> HashSet<StepId>
    where
        F: Fn(&GraphNode) -> &Vec<StepId>,
    {
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(id) {
                for next in edges(node) {
                    if seen.insert(next.clone()) {
                        stack.push(next);
                    }
                }
            }
        }
        seen
    }

    /// Steps without dependencies (fallbacks excluded)
    pub fn roots(&self) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .map(|n| n.dependencies.is_empty() && n.fallback_for.is_none())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Critical path: non-fallback steps nothing depends on.
    ///
    /// These feed the final result.
    pub fn critical_path(&self) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .map(|n| n.dependents.is_empty() && n.fallback_for.is_none())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Get total step count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        deps.iter()
            .fold(Step::new(id, "generic", "x"), |s, d| s.depends_on(*d))
    }

    fn ids(list: &[&str]) -> Vec<StepId> {
        list.iter().map(|s| StepId::from(*s)).collect()
    }

    // === Construction Tests ===

    #[test]
    fn test_empty_graph() {
        let graph = StepGraph::build(&[]).unwrap();
        assert!(graph.is_empty());
        assert!(graph.critical_path().is_empty());
    }

    #[test]
    fn test_single_step() {
        let graph = StepGraph::build(&[step("a", &[])]).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.roots(), ids(&["a"]));
        assert_eq!(graph.critical_path(), ids(&["a"]));
    }

    #[test]
    fn test_fan_in() {
        let steps = vec![
            step("f1", &[]),
            step("f2", &[]),
            step("f3", &[]),
            step("sum", &["f1", "f2", "f3"]),
        ];
        let graph = StepGraph::build(&steps).unwrap();

        assert_eq!(graph.roots(), ids(&["f1", "f2", "f3"]));
        assert_eq!(graph.critical_path(), ids(&["sum"]));
        assert_eq!(graph.descendants(&"f2".into()), HashSet::from([StepId::from("sum")]));
        assert_eq!(graph.topological_order().last(), Some(&StepId::from("sum")));
    }

    // === Validation Tests ===

    #[test]
    fn test_duplicate_id_rejected() {
        let err = StepGraph::build(&[step("a", &[]), step("a", &[])]).unwrap_err();
        assert!(matches!(err, ConclaveError::InvalidPlan(m) if m.contains("duplicate")));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let err = StepGraph::build(&[step("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, ConclaveError::InvalidPlan(m) if m.contains("ghost")));
    }

    #[test]
    fn test_self_dependency_rejected() {
        assert!(StepGraph::build(&[step("a", &["a"])]).is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"]), step("d", &[])];
        let err = StepGraph::build(&steps).unwrap_err();
        match err {
            ConclaveError::InvalidPlan(msg) => {
                assert!(msg.contains("cycle"));
                assert!(msg.contains("[a, b, c]"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // === Fallback Tests ===

    #[test]
    fn test_fallback_ordering() {
        let steps = vec![
            step("primary", &[]),
            step("backup", &[]).fallback_for("primary"),
            step("final", &["primary"]),
        ];
        let graph = StepGraph::build(&steps).unwrap();

        assert_eq!(graph.fallback_of(&"primary".into()), Some(&StepId::from("backup")));
        assert_eq!(graph.primary_of(&"backup".into()), Some(&StepId::from("primary")));
        assert_eq!(graph.roots(), ids(&["primary"]));
        assert_eq!(graph.critical_path(), ids(&["final"]));

        let topo = graph.topological_order();
        let pos = |id: &str| topo.iter().position(|s| s.as_str() == id).unwrap();
        assert!(pos("primary") < pos("backup"));
    }

    #[test]
    fn test_depending_on_fallback_rejected() {
        let steps = vec![
            step("primary", &[]),
            step("backup", &[]).fallback_for("primary"),
            step("final", &["backup"]),
        ];
        assert!(StepGraph::build(&steps).is_err());
    }

    #[test]
    fn test_second_fallback_rejected() {
        let steps = vec![
            step("primary", &[]),
            step("b1", &[]).fallback_for("primary"),
            step("b2", &[]).fallback_for("primary"),
        ];
        assert!(StepGraph::build(&steps).is_err());
    }

    #[test]
    fn test_fallback_may_share_dependencies() {
        let steps = vec![
            step("source", &[]),
            step("primary", &["source"]),
            step("backup", &["source"]).fallback_for("primary"),
        ];
        let graph = StepGraph::build(&steps).unwrap();
        assert_eq!(graph.topological_order().first(), Some(&StepId::from("source")));
        assert_eq!(graph.critical_path(), ids(&["primary"]));
    }

    #[test]
    fn test_fallback_for_itself_rejected() {
        let steps = vec![step("a", &[]).fallback_for("a")];
        assert!(StepGraph::build(&steps).is_err());
    }

    // === Ancestry Tests ===

    #[test]
    fn test_ancestors_and_descendants() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &[]),
        ];
        let graph = StepGraph::build(&steps).unwrap();

        let ancestors = graph.ancestors(&"c".into());
        assert_eq!(ancestors.len(), 2);
        assert!(ancestors.contains(&StepId::from("a")));

        let descendants = graph.descendants(&"a".into());
        assert!(descendants.contains(&StepId::from("c")));
        assert!(!descendants.contains(&StepId::from("d")));
    }

    #[test]
    fn test_unknown_step_has_no_edges() {
        let graph = StepGraph::build(&[step("a", &[])]).unwrap();
        assert!(graph.dependencies(&"ghost".into()).is_empty());
        assert!(graph.descendants(&"ghost".into()).is_empty());
    }
}
