//! Graph - Dependency graphs over resource instances and plan steps
//!
//! Edges point from a dependency to its dependent: an edge `a -> b` means `b`
//! must wait for `a`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::ResourceAddress;
use crate::error::ConfigError;
use crate::resource::ResourceDeclaration;
use crate::snapshot::StateSnapshot;

/// Directed graph with forward and reverse adjacency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    into = "GraphRepr<N>",
    from = "GraphRepr<N>",
    bound(
        serialize = "N: Serialize + Ord + Clone",
        deserialize = "N: Deserialize<'de> + Ord + Clone"
    )
)]
pub struct DependencyGraph<N: Ord + Clone> {
    nodes: BTreeSet<N>,
    /// Node -> nodes it depends on
    dependencies: BTreeMap<N, BTreeSet<N>>,
    /// Node -> nodes that depend on it
    dependents: BTreeMap<N, BTreeSet<N>>,
}

/// Serialized form: node list plus `(dependency, dependent)` pairs
#[derive(Serialize, Deserialize)]
struct GraphRepr<N> {
    nodes: Vec<N>,
    edges: Vec<(N, N)>,
}

impl<N: Ord + Clone> From<DependencyGraph<N>> for GraphRepr<N> {
    fn from(graph: DependencyGraph<N>) -> Self {
        let edges = graph
            .edges()
            .map(|(a, b)| (a.clone(), b.clone()))
            .collect();
        Self {
            nodes: graph.nodes.into_iter().collect(),
            edges,
        }
    }
}

impl<N: Ord + Clone> From<GraphRepr<N>> for DependencyGraph<N> {
    fn from(repr: GraphRepr<N>) -> Self {
        let mut graph = DependencyGraph::new();
        for node in repr.nodes {
            graph.add_node(node);
        }
        for (dependency, dependent) in repr.edges {
            graph.add_edge(dependency, dependent);
        }
        graph
    }
}

impl<N: Ord + Clone> Default for DependencyGraph<N> {
    fn default() -> Self {
        Self {
            nodes: BTreeSet::new(),
            dependencies: BTreeMap::new(),
            dependents: BTreeMap::new(),
        }
    }
}

impl<N: Ord + Clone> DependencyGraph<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: N) {
        self.nodes.insert(node);
    }

    /// Record that `dependent` must come after `dependency`
    pub fn add_edge(&mut self, dependency: N, dependent: N) {
        self.nodes.insert(dependency.clone());
        self.nodes.insert(dependent.clone());
        self.dependencies
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());
        self.dependents.entry(dependency).or_default().insert(dependent);
    }

    pub fn contains(&self, node: &N) -> bool {
        self.nodes.contains(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All edges as `(dependency, dependent)` pairs
    pub fn edges(&self) -> impl Iterator<Item = (&N, &N)> {
        self.dependents
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (from, to)))
    }

    /// Direct dependencies of a node
    pub fn dependencies_of(&self, node: &N) -> impl Iterator<Item = &N> {
        self.dependencies.get(node).into_iter().flatten()
    }

    /// Nodes that directly depend on this node
    pub fn dependents_of(&self, node: &N) -> impl Iterator<Item = &N> {
        self.dependents.get(node).into_iter().flatten()
    }

    /// Every node reachable through dependent edges, excluding `node` itself
    pub fn transitive_dependents(&self, node: &N) -> BTreeSet<N> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&N> = self.dependents_of(node).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents_of(next));
            }
        }
        seen
    }

    /// The same graph with every edge flipped
    pub fn reversed(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            dependencies: self.dependents.clone(),
            dependents: self.dependencies.clone(),
        }
    }

    /// Find a cycle, returned as a path whose first and last nodes are equal
    pub fn find_cycle(&self) -> Option<Vec<N>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();
        let mut on_path = BTreeSet::new();

        for node in &self.nodes {
            if let Some(cycle) = self.find_cycle_from(node, &mut visited, &mut path, &mut on_path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn find_cycle_from(
        &self,
        node: &N,
        visited: &mut BTreeSet<N>,
        path: &mut Vec<N>,
        on_path: &mut BTreeSet<N>,
    ) -> Option<Vec<N>> {
        if on_path.contains(node) {
            let start = path.iter().position(|n| n == node).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(node.clone());
            return Some(cycle);
        }
        if visited.contains(node) {
            return None;
        }

        visited.insert(node.clone());
        on_path.insert(node.clone());
        path.push(node.clone());

        for next in self.dependents_of(node) {
            if let Some(cycle) = self.find_cycle_from(next, visited, path, on_path) {
                return Some(cycle);
            }
        }

        path.pop();
        on_path.remove(node);
        None
    }

    /// Nodes ordered so every dependency precedes its dependents
    ///
    /// Ties are broken by node order, so the result is deterministic. Returns
    /// the cycle if the graph has one.
    pub fn topological_order(&self) -> Result<Vec<N>, Vec<N>> {
        let mut in_degree: BTreeMap<&N, usize> = self
            .nodes
            .iter()
            .map(|n| (n, self.dependencies_of(n).count()))
            .collect();

        let mut ready: BTreeSet<&N> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_first() {
            order.push(node.clone());
            for dependent in self.dependents_of(node) {
                if let Some(d) = in_degree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(self.find_cycle().unwrap_or_default())
        }
    }
}

/// Render a cycle as `a -> b -> a`
pub fn format_cycle<N: fmt::Display>(cycle: &[N]) -> String {
    cycle
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Build the dependency graph of a configuration
///
/// Declared instances get edges from their references and `depends_on`.
/// Instances only present in `prior` are added with the dependencies
/// recorded when they were last applied, so their deletion can be ordered.
pub fn build_graph(
    declarations: &[ResourceDeclaration],
    prior: &StateSnapshot,
) -> Result<DependencyGraph<ResourceAddress>, ConfigError> {
    let mut graph = DependencyGraph::new();

    for decl in declarations {
        if graph.contains(&decl.address) {
            return Err(ConfigError::DuplicateAddress(decl.address.clone()));
        }
        graph.add_node(decl.address.clone());
    }

    for decl in declarations {
        for reference in decl.references() {
            if !graph.contains(&reference.address) {
                return Err(ConfigError::UnknownReference {
                    address: decl.address.clone(),
                    reference: reference.to_string(),
                });
            }
            graph.add_edge(reference.address.clone(), decl.address.clone());
        }

        for target in &decl.depends_on {
            let matched: Vec<ResourceAddress> = declarations
                .iter()
                .filter(|d| target.matches(&d.address))
                .map(|d| d.address.clone())
                .collect();
            if matched.is_empty() {
                return Err(ConfigError::UnknownDependency {
                    address: decl.address.clone(),
                    dependency: target.clone(),
                });
            }
            for dependency in matched {
                graph.add_edge(dependency, decl.address.clone());
            }
        }
    }

    let declared: BTreeSet<&ResourceAddress> = declarations.iter().map(|d| &d.address).collect();
    for (address, instance) in &prior.resources {
        if declared.contains(address) {
            continue;
        }
        graph.add_node(address.clone());
        for dependency in &instance.dependencies {
            if prior.contains(dependency) || declared.contains(dependency) {
                graph.add_edge(dependency.clone(), address.clone());
            }
        }
    }

    if let Some(cycle) = graph.find_cycle() {
        return Err(ConfigError::Cycle {
            path: format_cycle(&cycle),
        });
    }

    log::debug!(
        "built dependency graph with {} nodes and {} edges",
        graph.len(),
        graph.edges().count()
    );

    Ok(graph)
}
