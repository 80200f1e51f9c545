//! Job dependency graph.
//!
//! Edges point from a consumer to the job it waits for. The run topology
//! is a two-level fan-in (the publish job depends on every build job), but
//! cycle detection works for any graph.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::registry::JobRegistry;
use crate::{SchedulerError, SchedulerResult};

/// Name of the publish job.
pub const PUBLISH_JOB: &str = "publish";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DependencyEdge {
    /// The waiting job.
    pub from: String,
    /// The job waited for.
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyGraph {
    needs: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The publish job depending on every job in `registry`.
    pub fn fan_in(registry: &JobRegistry) -> SchedulerResult<Self> {
        let mut graph = Self::new();
        graph.add_node(PUBLISH_JOB);
        for name in registry.names() {
            graph.add_node(name);
            graph.add_edge(PUBLISH_JOB, name)?;
        }
        graph.verify_fan_in(registry)?;
        Ok(graph)
    }

    pub fn add_node(&mut self, name: &str) {
        self.needs.entry(name.to_string()).or_default();
    }

    /// Add `from -> to`. Both nodes must exist and the edge must not
    /// close a cycle; a rejected edge leaves the graph unchanged.
    pub fn add_edge(&mut self, from: &str, to: &str) -> SchedulerResult<()> {
        for node in [from, to] {
            if !self.needs.contains_key(node) {
                return Err(SchedulerError::UnknownJob(node.to_string()));
            }
        }

        let inserted = self
            .needs
            .get_mut(from)
            .map(|deps| deps.insert(to.to_string()))
            .unwrap_or(false);
        if let Err(e) = self.detect_cycle() {
            if inserted {
                if let Some(deps) = self.needs.get_mut(from) {
                    deps.remove(to);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.needs
            .get(name)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.needs
            .iter()
            .flat_map(|(from, deps)| {
                deps.iter().map(move |to| DependencyEdge {
                    from: from.clone(),
                    to: to.clone(),
                })
            })
            .collect()
    }

    /// The publish job must wait for exactly the registered build jobs.
    pub fn verify_fan_in(&self, registry: &JobRegistry) -> SchedulerResult<()> {
        let deps: BTreeSet<&str> = self.dependencies_of(PUBLISH_JOB).collect();
        let missing: Vec<String> = registry
            .names()
            .filter(|name| !deps.contains(name))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(SchedulerError::IncompleteFanIn(missing));
        }
        if let Some(extra) = deps.iter().find(|d| registry.get(d).is_none()) {
            return Err(SchedulerError::UnknownJob(extra.to_string()));
        }
        Ok(())
    }

    /// Depth-first search for a back edge.
    pub fn detect_cycle(&self) -> SchedulerResult<()> {
        let mut visited = HashMap::new();
        let mut rec_stack = HashMap::new();

        for node in self.needs.keys() {
            if !visited.contains_key(node.as_str()) {
                if let Some(cycle) = self.dfs_detect_cycle(node, &mut visited, &mut rec_stack) {
                    return Err(SchedulerError::CycleDetected(cycle));
                }
            }
        }
        Ok(())
    }

    fn dfs_detect_cycle<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashMap<&'a str, bool>,
        rec_stack: &mut HashMap<&'a str, bool>,
    ) -> Option<String> {
        visited.insert(node, true);
        rec_stack.insert(node, true);

        for dep in self.dependencies_of(node) {
            if !visited.contains_key(dep) {
                if let Some(cycle) = self.dfs_detect_cycle(dep, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }

        rec_stack.insert(node, false);
        None
    }
}
