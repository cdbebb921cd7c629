//! Phase dependency graph construction and validation.
//!
//! Project task definitions supply the ordered phase list, per-phase scope
//! globs, and the dependency graph at run-creation time. The builder
//! validates the graph before the run is accepted: every dependency must
//! reference an existing phase, every scope must be non-empty, and no
//! cycles are allowed (Kahn's algorithm).

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};

use crate::run::Phase;

/// Index into the phase list.
pub type PhaseIndex = usize;

/// A validated directed acyclic graph of phases.
#[derive(Debug)]
pub struct PhaseGraph {
    phases: Vec<Phase>,
    index_map: HashMap<String, PhaseIndex>,
    /// index -> phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// index -> phases it depends on
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl PhaseGraph {
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get_phase(&self, index: PhaseIndex) -> Option<&Phase> {
        self.phases.get(index)
    }

    pub fn get_phase_mut(&mut self, index: PhaseIndex) -> Option<&mut Phase> {
        self.phases.get_mut(index)
    }

    pub fn get_index(&self, id: &str) -> Option<PhaseIndex> {
        self.index_map.get(id).copied()
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Phases that depend on the given phase.
    pub fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phases the given phase depends on.
    pub fn dependencies(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Whether every dependency of a phase is in the completed set.
    pub fn dependencies_satisfied(&self, index: PhaseIndex, completed: &HashSet<PhaseIndex>) -> bool {
        self.dependencies(index).iter().all(|dep| completed.contains(dep))
    }

    /// Transitive dependents of a phase, used to decide which phases are
    /// stranded when one fails.
    pub fn transitive_dependents(&self, index: PhaseIndex) -> HashSet<PhaseIndex> {
        let mut out = HashSet::new();
        let mut stack = vec![index];
        while let Some(node) = stack.pop() {
            for &dep in self.dependents(node) {
                if out.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        out
    }
}

/// Builder validating task definitions into a `PhaseGraph`.
pub struct GraphBuilder {
    phases: Vec<Phase>,
}

impl GraphBuilder {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    /// Validate and build. Positions are assigned from declared order.
    pub fn build(mut self) -> Result<PhaseGraph> {
        for (i, phase) in self.phases.iter_mut().enumerate() {
            phase.position = i;
        }

        let mut index_map = HashMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if phase.scope.is_empty() {
                bail!("Phase '{}' declares an empty file scope", phase.id);
            }
            if index_map.insert(phase.id.clone(), i).is_some() {
                bail!("Duplicate phase id: {}", phase.id);
            }
        }

        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];

        for (to_idx, phase) in self.phases.iter().enumerate() {
            for dep in &phase.depends_on {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Unknown dependency '{}' in phase '{}': no phase with that id exists",
                        dep,
                        phase.id
                    )
                })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = PhaseGraph {
            phases: self.phases,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;
        Ok(graph)
    }

    /// Cycle check via Kahn's algorithm.
    fn validate_no_cycles(graph: &PhaseGraph) -> Result<()> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(Vec::len).collect();
        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let cycle_phases: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.get_phase(i).map(|p| p.id.as_str()))
                .collect();
            bail!("Cycle detected in phase dependencies. Involved phases: {:?}", cycle_phases);
        }
        Ok(())
    }
}
