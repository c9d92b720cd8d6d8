//! Trigger graph.
//!
//! Nodes are triggers; an edge `A -> B` exists when `A` writes a relation
//! that `B` reads. The graph must be acyclic: a cycle would let a cascade
//! run forever, so it is rejected when the catalog is built.

use std::collections::{HashMap, VecDeque};

use crate::error::RegistrationError;

#[derive(Debug, Clone)]
struct GraphNode {
    name: String,
    input: String,
    outputs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Directed graph of triggers.
#[derive(Debug, Clone, Default)]
pub struct TriggerGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    /// Outgoing edges per node, in insertion order.
    edges: Vec<Vec<usize>>,
}

impl TriggerGraph {
    /// Empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a trigger and infers its edges from the relations it reads and writes.
    pub fn add_trigger(
        &mut self,
        name: &str,
        input: &str,
        outputs: &[String],
    ) -> Result<(), RegistrationError> {
        if self.index.contains_key(name) {
            return Err(RegistrationError::DuplicateTrigger {
                trigger: name.to_string(),
            });
        }
        let id = self.nodes.len();
        self.nodes.push(GraphNode {
            name: name.to_string(),
            input: input.to_string(),
            outputs: outputs.to_vec(),
        });
        self.index.insert(name.to_string(), id);
        self.edges.push(Vec::new());

        for other in 0..self.nodes.len() {
            if self.nodes[id].outputs.contains(&self.nodes[other].input) {
                self.link(id, other);
            }
            if other != id && self.nodes[other].outputs.contains(&self.nodes[id].input) {
                self.link(other, id);
            }
        }
        Ok(())
    }

    /// Adds an explicit edge between two registered triggers.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), RegistrationError> {
        let from = self.id(from)?;
        let to = self.id(to)?;
        self.link(from, to);
        Ok(())
    }

    fn link(&mut self, from: usize, to: usize) {
        if !self.edges[from].contains(&to) {
            self.edges[from].push(to);
        }
    }

    fn id(&self, name: &str) -> Result<usize, RegistrationError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| RegistrationError::UnknownTrigger {
                trigger: name.to_string(),
            })
    }

    /// Number of triggers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no trigger is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True if `name` is a registered trigger.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Triggers fed directly by `name`'s outputs.
    pub fn downstream(&self, name: &str) -> Result<Vec<&str>, RegistrationError> {
        let id = self.id(name)?;
        Ok(self.edges[id]
            .iter()
            .map(|&to| self.nodes[to].name.as_str())
            .collect())
    }

    /// Triggers whose outputs feed `name`.
    pub fn upstream(&self, name: &str) -> Result<Vec<&str>, RegistrationError> {
        let id = self.id(name)?;
        Ok(self
            .edges
            .iter()
            .enumerate()
            .filter(|(_, out)| out.contains(&id))
            .map(|(from, _)| self.nodes[from].name.as_str())
            .collect())
    }

    /// Fails with `CycleDetected` naming the first cycle found.
    ///
    /// The cycle lists trigger names and repeats the first at the end,
    /// e.g. `["A", "B", "A"]`.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack = Vec::new();
        for start in 0..self.nodes.len() {
            if marks[start] == Mark::Unvisited {
                if let Some(cycle) = self.visit(start, &mut marks, &mut stack) {
                    return Err(RegistrationError::CycleDetected { cycle });
                }
            }
        }
        Ok(())
    }

    fn visit(&self, node: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<String>> {
        marks[node] = Mark::OnStack;
        stack.push(node);
        for &next in &self.edges[node] {
            match marks[next] {
                Mark::OnStack => {
                    let pos = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[pos..].iter().map(|&n| self.nodes[n].name.clone()).collect();
                    cycle.push(self.nodes[next].name.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(next, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    /// Trigger names in dependency order; ties keep registration order.
    pub fn topological_order(&self) -> Result<Vec<&str>, RegistrationError> {
        self.validate()?;
        let mut in_degree = vec![0usize; self.nodes.len()];
        for out in &self.edges {
            for &to in out {
                in_degree[to] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..self.nodes.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut sorted = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            sorted.push(self.nodes[node].name.as_str());
            for &to in &self.edges[node] {
                in_degree[to] -= 1;
                if in_degree[to] == 0 {
                    queue.push_back(to);
                }
            }
        }
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outs(rels: &[&str]) -> Vec<String> {
        rels.iter().map(|r| (*r).to_string()).collect()
    }

    #[test]
    fn test_edges_inferred_from_relations() {
        let mut graph = TriggerGraph::new();
        graph.add_trigger("split", "raw", &outs(&["words"])).unwrap();
        graph.add_trigger("count", "words", &outs(&["counts"])).unwrap();
        graph.add_trigger("audit", "raw", &[]).unwrap();

        assert_eq!(graph.downstream("split").unwrap(), vec!["count"]);
        assert_eq!(graph.upstream("count").unwrap(), vec!["split"]);
        assert!(graph.downstream("audit").unwrap().is_empty());
        graph.validate().unwrap();
    }

    #[test]
    fn test_edge_inferred_when_reader_registered_first() {
        let mut graph = TriggerGraph::new();
        graph.add_trigger("count", "words", &[]).unwrap();
        graph.add_trigger("split", "raw", &outs(&["words"])).unwrap();
        assert_eq!(graph.downstream("split").unwrap(), vec!["count"]);
        assert_eq!(graph.topological_order().unwrap(), vec!["split", "count"]);
    }

    #[test]
    fn test_two_trigger_cycle_detected() {
        let mut graph = TriggerGraph::new();
        graph.add_trigger("A", "relationY", &outs(&["relationX"])).unwrap();
        graph.add_trigger("B", "relationX", &outs(&["relationY"])).unwrap();
        let err = graph.validate().unwrap_err();
        assert_eq!(
            err,
            RegistrationError::CycleDetected {
                cycle: outs(&["A", "B", "A"])
            }
        );
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_self_loop_detected() {
        let mut graph = TriggerGraph::new();
        graph.add_trigger("echo", "raw", &outs(&["raw"])).unwrap();
        let err = graph.validate().unwrap_err();
        assert_eq!(
            err,
            RegistrationError::CycleDetected {
                cycle: outs(&["echo", "echo"])
            }
        );
    }

    #[test]
    fn test_cycle_reported_without_acyclic_prefix() {
        let mut graph = TriggerGraph::new();
        graph.add_trigger("entry", "raw", &outs(&["a"])).unwrap();
        graph.add_trigger("B", "a", &outs(&["b"])).unwrap();
        graph.add_trigger("C", "b", &outs(&["a"])).unwrap();
        let err = graph.validate().unwrap_err();
        assert_eq!(
            err,
            RegistrationError::CycleDetected {
                cycle: outs(&["B", "C", "B"])
            }
        );
    }

    #[test]
    fn test_diamond_topological_order() {
        let mut graph = TriggerGraph::new();
        graph.add_trigger("src", "raw", &outs(&["l", "r"])).unwrap();
        graph.add_trigger("left", "l", &outs(&["j"])).unwrap();
        graph.add_trigger("right", "r", &outs(&["j"])).unwrap();
        graph.add_trigger("join", "j", &[]).unwrap();
        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec!["src", "left", "right", "join"]);
    }

    #[test]
    fn test_explicit_edge_and_duplicates() {
        let mut graph = TriggerGraph::new();
        graph.add_trigger("a", "x", &[]).unwrap();
        graph.add_trigger("b", "y", &[]).unwrap();
        graph.add_edge("a", "b").unwrap();
        assert_eq!(graph.downstream("a").unwrap(), vec!["b"]);
        assert!(graph.add_edge("a", "missing").is_err());
        assert!(matches!(
            graph.add_trigger("a", "x", &[]),
            Err(RegistrationError::DuplicateTrigger { .. })
        ));
    }
}
