//! Dependency-aware service startup and shutdown.
//!
//! The supervisor owns every service handle, validates the declared
//! dependency graph at registration time, and connects services strictly
//! in topological order at startup (reverse order at shutdown). A cycle
//! fails at registration with [`DependencyCycleError`], never as a silent
//! deadlock at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ConnectionError, DependencyCycleError};
use crate::service::Service;

/// Name-keyed dependency edges between services.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// node -> upstream nodes it waits on
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str) {
        self.edges.entry(name.to_string()).or_default();
    }

    /// Declare that `from` waits on `to`. Fails if the edge closes a cycle.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), DependencyCycleError> {
        self.add_node(from);
        self.add_node(to);

        // Walk upstream from `to`; reaching `from` again means a cycle.
        if let Some(mut path) = self.find_path(to, from) {
            path.insert(0, from.to_string());
            return Err(DependencyCycleError { path });
        }

        self.edges.get_mut(from).expect("node added above").push(to.to_string());
        Ok(())
    }

    /// Upstream path from `start` to `target`, if one exists.
    fn find_path(&self, start: &str, target: &str) -> Option<Vec<String>> {
        if start == target {
            return Some(vec![start.to_string()]);
        }
        let upstreams = self.edges.get(start)?;
        for up in upstreams {
            if let Some(mut path) = self.find_path(up, target) {
                path.insert(0, start.to_string());
                return Some(path);
            }
        }
        None
    }

    /// All nodes in an order where every upstream precedes its dependents.
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .edges
            .iter()
            .map(|(n, upstreams)| (n.as_str(), upstreams.len()))
            .collect();

        // Kahn's algorithm over the "waits on" direction: a node is ready
        // once all its upstreams are emitted.
        let mut order = Vec::with_capacity(self.edges.len());
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        ready.sort_unstable(); // deterministic among independent services

        while let Some(node) = ready.pop() {
            order.push(node.to_string());
            let mut newly_ready = Vec::new();
            for (dependent, upstreams) in &self.edges {
                if upstreams.iter().any(|u| u == node) {
                    let d = in_degree.get_mut(dependent.as_str()).expect("known node");
                    *d -= 1;
                    if *d == 0 {
                        newly_ready.push(dependent.as_str());
                    }
                }
            }
            newly_ready.sort_unstable();
            ready.extend(newly_ready);
            ready.sort_unstable();
        }

        order
    }
}

/// Owns service handles and drives them through startup/shutdown.
pub struct Supervisor {
    services: HashMap<String, Arc<dyn Service>>,
    graph: DependencyGraph,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
            graph: DependencyGraph::new(),
        }
    }

    /// Register a service. Its declared dependencies are inserted as graph
    /// edges; unknown upstreams and cycles are registration-time errors.
    pub fn register(&mut self, service: Arc<dyn Service>) -> Result<(), DependencyCycleError> {
        let name = service.name().to_string();
        self.graph.add_node(&name);
        for dep in service.dependencies() {
            self.graph.add_edge(&name, dep.name())?;
        }
        self.services.insert(name, service);
        Ok(())
    }

    /// Connect every service strictly in topological order.
    pub async fn start_all(&self) -> Result<(), ConnectionError> {
        for name in self.graph.topological_order() {
            if let Some(service) = self.services.get(&name) {
                service.connect().await?;
                service.wait_for_connection().await;
            }
        }
        Ok(())
    }

    /// Disconnect every service in reverse topological order.
    pub async fn shutdown(&self) {
        for name in self.graph.topological_order().into_iter().rev() {
            if let Some(service) = self.services.get(&name) {
                service.disconnect().await;
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
