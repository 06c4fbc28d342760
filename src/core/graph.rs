//! Residual co-occurrence graph and independent-set orderings.
//!
//! Nodes are parameter blocks; an edge joins two distinct blocks that appear together in at
//! least one residual block. An *independent set* of this graph is a set of blocks no two of
//! which share a residual, which is exactly the structure a Schur-complement solver needs in
//! its eliminated group (the eliminated part of `JᵀJ` is then block diagonal) and the
//! structure that lets inner iterations update every block of a group independently.
//!
//! Orderings are computed on demand from an explicit graph; nothing here is cached on the
//! problem.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::{
    ordering::ParameterBlockOrdering,
    problem::{ParameterBlockId, Problem, ResidualBlockId},
};

/// A residual that references two blocks of a set that must be independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndependenceViolation {
    pub residual: ResidualBlockId,
    pub first: ParameterBlockId,
    pub second: ParameterBlockId,
}

/// Undirected co-occurrence graph over a subset of parameter blocks.
#[derive(Debug, Clone, Default)]
pub struct CooccurrenceGraph {
    adjacency: BTreeMap<ParameterBlockId, BTreeSet<ParameterBlockId>>,
}

impl CooccurrenceGraph {
    /// Build the graph over `vertices` using the given residual blocks.
    ///
    /// Blocks referenced by a residual but not listed in `vertices` (constant blocks, for
    /// example) are ignored, as are residual ids unknown to the problem.
    pub fn build(
        problem: &Problem,
        vertices: &[ParameterBlockId],
        residuals: &[ResidualBlockId],
    ) -> Self {
        let mut adjacency: BTreeMap<ParameterBlockId, BTreeSet<ParameterBlockId>> = vertices
            .iter()
            .map(|&v| (v, BTreeSet::new()))
            .collect();

        for &residual_id in residuals {
            let Ok(residual) = problem.residual_block(residual_id) else {
                continue;
            };
            let members: Vec<ParameterBlockId> = residual
                .distinct_parameter_blocks()
                .into_iter()
                .filter(|id| adjacency.contains_key(id))
                .collect();

            for (i, &u) in members.iter().enumerate() {
                for &v in &members[i + 1..] {
                    if let Some(neighbors) = adjacency.get_mut(&u) {
                        neighbors.insert(v);
                    }
                    if let Some(neighbors) = adjacency.get_mut(&v) {
                        neighbors.insert(u);
                    }
                }
            }
        }

        Self { adjacency }
    }

    pub fn num_vertices(&self) -> usize {
        self.adjacency.len()
    }

    pub fn num_edges(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    pub fn vertices(&self) -> impl Iterator<Item = ParameterBlockId> + '_ {
        self.adjacency.keys().copied()
    }

    pub fn neighbors(&self, vertex: ParameterBlockId) -> Option<&BTreeSet<ParameterBlockId>> {
        self.adjacency.get(&vertex)
    }

    pub fn degree(&self, vertex: ParameterBlockId) -> usize {
        self.adjacency.get(&vertex).map_or(0, BTreeSet::len)
    }

    pub fn contains_edge(&self, u: ParameterBlockId, v: ParameterBlockId) -> bool {
        self.adjacency
            .get(&u)
            .is_some_and(|neighbors| neighbors.contains(&v))
    }

    /// Greedy maximal independent set, visiting vertices by increasing degree.
    ///
    /// Low-degree blocks (points in bundle adjustment) are picked first, which tends to give
    /// large eliminated groups. Ties are broken by block id so the result is deterministic.
    pub fn independent_set(&self) -> BTreeSet<ParameterBlockId> {
        let mut order: Vec<ParameterBlockId> = self.vertices().collect();
        order.sort_by_key(|&v| (self.degree(v), v));

        let mut selected = BTreeSet::new();
        let mut excluded = BTreeSet::new();
        for vertex in order {
            if excluded.contains(&vertex) {
                continue;
            }
            selected.insert(vertex);
            if let Some(neighbors) = self.adjacency.get(&vertex) {
                excluded.extend(neighbors.iter().copied());
            }
        }
        selected
    }

    /// Two-group ordering: a maximal independent set in group 0, everything else in group 1.
    pub fn schur_ordering(&self) -> ParameterBlockOrdering {
        let eliminated = self.independent_set();
        let mut ordering = ParameterBlockOrdering::new();
        for vertex in self.vertices() {
            let group = if eliminated.contains(&vertex) { 0 } else { 1 };
            ordering.add_element_to_group(vertex, group);
        }
        ordering
    }

    /// Recursive independent-set ordering.
    ///
    /// Group `k` is a maximal independent set of the graph left after removing groups
    /// `0..k`, so every group is independent in the full graph.
    pub fn recursive_independent_set_ordering(&self) -> ParameterBlockOrdering {
        let mut ordering = ParameterBlockOrdering::new();
        let mut remaining = self.clone();
        let mut group = 0;
        while remaining.num_vertices() > 0 {
            let set = remaining.independent_set();
            for &vertex in &set {
                ordering.add_element_to_group(vertex, group);
            }
            remaining.remove_vertices(&set);
            group += 1;
        }
        ordering
    }

    fn remove_vertices(&mut self, vertices: &BTreeSet<ParameterBlockId>) {
        for vertex in vertices {
            self.adjacency.remove(vertex);
        }
        for neighbors in self.adjacency.values_mut() {
            neighbors.retain(|v| !vertices.contains(v));
        }
    }
}

/// Find a residual that references two distinct members of `set`.
///
/// All residual blocks of the problem are inspected, whether or not their parameters are
/// constant. A residual that references the same block twice does not violate independence.
pub fn find_independence_violation(
    problem: &Problem,
    set: &BTreeSet<ParameterBlockId>,
) -> Option<IndependenceViolation> {
    problem.residual_blocks().find_map(|(residual_id, residual)| {
        let mut members = residual
            .distinct_parameter_blocks()
            .into_iter()
            .filter(|id| set.contains(id));
        match (members.next(), members.next()) {
            (Some(first), Some(second)) => Some(IndependenceViolation {
                residual: residual_id,
                first,
                second,
            }),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::BetweenFactor;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Star: hub `h` shares a residual with each of `n` leaves.
    fn create_star_problem(
        n: usize,
    ) -> Result<(Problem, ParameterBlockId, Vec<ParameterBlockId>), Box<dyn std::error::Error>>
    {
        let mut problem = Problem::new();
        let hub = problem.add_parameter_block(dvector![0.0]);
        let mut leaves = Vec::new();
        for i in 0..n {
            let leaf = problem.add_parameter_block(dvector![i as f64]);
            problem.add_residual_block(&[hub, leaf], Box::new(BetweenFactor::new(dvector![1.0])))?;
            leaves.push(leaf);
        }
        Ok((problem, hub, leaves))
    }

    fn all_residuals(problem: &Problem) -> Vec<ResidualBlockId> {
        problem.residual_blocks().map(|(id, _)| id).collect()
    }

    fn all_parameters(problem: &Problem) -> Vec<ParameterBlockId> {
        problem.parameter_blocks().map(|(id, _)| id).collect()
    }

    #[test]
    fn test_star_graph_structure() -> TestResult {
        let (problem, hub, leaves) = create_star_problem(4)?;
        let graph =
            CooccurrenceGraph::build(&problem, &all_parameters(&problem), &all_residuals(&problem));

        assert_eq!(graph.num_vertices(), 5);
        assert_eq!(graph.num_edges(), 4);
        assert_eq!(graph.degree(hub), 4);
        assert!(graph.contains_edge(leaves[0], hub));
        assert!(!graph.contains_edge(leaves[0], leaves[1]));
        Ok(())
    }

    #[test]
    fn test_independent_set_prefers_low_degree() -> TestResult {
        let (problem, hub, leaves) = create_star_problem(3)?;
        let graph =
            CooccurrenceGraph::build(&problem, &all_parameters(&problem), &all_residuals(&problem));

        let set = graph.independent_set();
        assert_eq!(set, leaves.iter().copied().collect());
        assert!(!set.contains(&hub));
        assert!(find_independence_violation(&problem, &set).is_none());
        Ok(())
    }

    #[test]
    fn test_schur_ordering_on_chain() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(dvector![0.0]);
        let b = problem.add_parameter_block(dvector![0.0]);
        let c = problem.add_parameter_block(dvector![0.0]);
        problem.add_residual_block(&[a, b], Box::new(BetweenFactor::new(dvector![0.0])))?;
        problem.add_residual_block(&[b, c], Box::new(BetweenFactor::new(dvector![0.0])))?;

        let graph =
            CooccurrenceGraph::build(&problem, &all_parameters(&problem), &all_residuals(&problem));
        let ordering = graph.schur_ordering();
        assert_eq!(ordering.group_id(a), Some(0));
        assert_eq!(ordering.group_id(c), Some(0));
        assert_eq!(ordering.group_id(b), Some(1));
        Ok(())
    }

    #[test]
    fn test_recursive_ordering_groups_are_independent() -> TestResult {
        // Triangle a - b - c - a needs three groups
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(dvector![0.0]);
        let b = problem.add_parameter_block(dvector![0.0]);
        let c = problem.add_parameter_block(dvector![0.0]);
        for (u, v) in [(a, b), (b, c), (c, a)] {
            problem.add_residual_block(&[u, v], Box::new(BetweenFactor::new(dvector![0.0])))?;
        }

        let graph =
            CooccurrenceGraph::build(&problem, &all_parameters(&problem), &all_residuals(&problem));
        let ordering = graph.recursive_independent_set_ordering();
        assert_eq!(ordering.num_groups(), 3);
        assert_eq!(ordering.num_elements(), 3);
        for (_, group) in ordering.groups() {
            assert!(find_independence_violation(&problem, group).is_none());
        }
        Ok(())
    }

    #[test]
    fn test_vertices_outside_subset_are_ignored() -> TestResult {
        let (problem, hub, leaves) = create_star_problem(2)?;
        let graph = CooccurrenceGraph::build(&problem, &leaves, &all_residuals(&problem));
        assert_eq!(graph.num_vertices(), 2);
        assert_eq!(graph.num_edges(), 0);
        assert_eq!(graph.degree(hub), 0);
        Ok(())
    }

    #[test]
    fn test_violation_reports_residual_and_blocks() -> TestResult {
        let (problem, hub, leaves) = create_star_problem(2)?;
        let set: BTreeSet<_> = [hub, leaves[1]].into_iter().collect();
        let violation = find_independence_violation(&problem, &set);
        assert_eq!(
            violation,
            Some(IndependenceViolation {
                residual: ResidualBlockId(1),
                first: hub,
                second: leaves[1],
            })
        );
        Ok(())
    }
}
