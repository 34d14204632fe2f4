//! The DAG of installables.
//!
//! Nodes are kapps; an edge `A → B` means B depends on A. Edges come from
//! declared `requires` plus an implicit edge between successive kapps in
//! the same manifest. Marking selects the kapps the user asked for;
//! processability closes the marked set over its dependencies in the walk
//! direction so outputs are available without processing unrelated
//! subtrees.
//!
//! The walk itself is channel-driven: ready nodes are pushed to the
//! worker pool until the queue fills, and each completion unlocks the
//! successors whose predecessors have all finished. That completion
//! happens-before the successor's dispatch, which is the ordering
//! guarantee everything else leans on.

pub mod executor;

use crate::errors::Error;
use crate::installable::Installable;
use crate::manifest::{self, Manifest, NAMESPACE_SEPARATOR, WILDCARD};
use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

pub use executor::{DagAction, ExecuteOptions};

/// Which way a walk flows through the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkDirection {
    /// Dependencies first (install order)
    Down,
    /// Dependents first (delete order)
    Up,
}

impl WalkDirection {
    /// Edge direction pointing at a node's predecessors for this walk
    pub(crate) fn predecessors(self) -> Direction {
        match self {
            Self::Down => Direction::Incoming,
            Self::Up => Direction::Outgoing,
        }
    }

    pub(crate) fn successors(self) -> Direction {
        match self {
            Self::Down => Direction::Outgoing,
            Self::Up => Direction::Incoming,
        }
    }
}

/// A node in the DAG
#[derive(Debug)]
pub struct DagNode {
    pub installable: Arc<RwLock<Installable>>,

    /// Selected for processing by the user's include/exclude sets
    pub marked: bool,

    /// Will be dispatched to a worker in the active walk direction
    pub processable: bool,
}

#[derive(Debug)]
pub struct Dag {
    graph: DiGraph<DagNode, ()>,
    indices: HashMap<String, NodeIndex>,
}

/// Create installables from every kapp of every manifest, in manifest
/// order
pub fn installables_from_manifests(manifests: &[Manifest]) -> Result<Vec<Installable>> {
    let mut installables = Vec::new();
    let mut seen = HashSet::new();

    for manifest in manifests {
        for (kapp_id, raw_descriptor) in &manifest.kapps {
            let installable =
                Installable::new(&manifest.id, kapp_id, vec![raw_descriptor.clone()])?;
            if !seen.insert(installable.fully_qualified_id()) {
                return Err(Error::ConfigInvalid(format!(
                    "kapp '{}' is defined more than once",
                    installable.fully_qualified_id()
                ))
                .into());
            }
            installables.push(installable);
        }
    }

    Ok(installables)
}

impl Dag {
    /// Build the graph from prepared installables. `requires` edges are
    /// resolved against fully-qualified ids; successive kapps within one
    /// manifest get an implicit ordering edge.
    pub fn build(installables: Vec<Installable>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        let mut previous_in_manifest: HashMap<String, NodeIndex> = HashMap::new();
        let mut intra_manifest_edges = Vec::new();

        for installable in installables {
            let fq_id = installable.fully_qualified_id();
            let manifest_id = installable.manifest_id().to_string();
            let index = graph.add_node(DagNode {
                installable: Arc::new(RwLock::new(installable)),
                marked: false,
                processable: false,
            });
            indices.insert(fq_id, index);

            if let Some(previous) = previous_in_manifest.insert(manifest_id, index) {
                intra_manifest_edges.push((previous, index));
            }
        }

        let mut dag = Self { graph, indices };

        // explicit requires edges
        let mut requires_edges = Vec::new();
        for (fq_id, &index) in &dag.indices {
            let installable = dag.graph[index]
                .installable
                .read()
                .expect("installable lock");
            for required in installable.requires() {
                let (required_manifest, required_kapp) =
                    manifest::split_fully_qualified_id(required)?;
                let required_fq_id =
                    format!("{}{}{}", required_manifest, NAMESPACE_SEPARATOR, required_kapp);
                let &parent = dag.indices.get(&required_fq_id).ok_or_else(|| {
                    Error::ConfigInvalid(format!(
                        "kapp '{}' requires unknown kapp '{}'",
                        fq_id, required
                    ))
                })?;
                if parent != index {
                    requires_edges.push((parent, index));
                }
            }
        }
        for (parent, child) in requires_edges {
            dag.graph.update_edge(parent, child, ());
        }
        for (parent, child) in intra_manifest_edges {
            dag.graph.update_edge(parent, child, ());
        }

        if is_cyclic_directed(&dag.graph) {
            let ids: Vec<String> = dag.sorted_ids();
            return Err(Error::CyclicDependency(ids.join(", ")).into());
        }

        debug!(
            "Built DAG with {} node(s) and {} edge(s)",
            dag.graph.node_count(),
            dag.graph.edge_count()
        );
        Ok(dag)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Shared handle to a kapp by fully-qualified id
    pub fn installable(&self, fq_id: &str) -> Option<Arc<RwLock<Installable>>> {
        self.indices
            .get(fq_id)
            .map(|&index| Arc::clone(&self.graph[index].installable))
    }

    /// Mark the nodes selected by `include`/`exclude` (empty include means
    /// everything). With `include_parents`, ancestors of marked nodes are
    /// marked too.
    pub fn mark(
        &mut self,
        include: &[String],
        exclude: &[String],
        include_parents: bool,
    ) -> Result<()> {
        validate_selectors(include)?;
        validate_selectors(exclude)?;

        for index in self.graph.node_indices() {
            let (fq_id, manifest_id) = {
                let installable = self.graph[index].installable.read().expect("installable lock");
                (
                    installable.fully_qualified_id(),
                    installable.manifest_id().to_string(),
                )
            };
            let included =
                include.is_empty() || matches_any(&fq_id, &manifest_id, include);
            let excluded = matches_any(&fq_id, &manifest_id, exclude);
            self.graph[index].marked = included && !excluded;
        }

        if include_parents {
            let marked: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|&i| self.graph[i].marked)
                .collect();
            for index in self.closure(&marked, Direction::Incoming) {
                self.graph[index].marked = true;
            }
        }

        debug!(
            "Marked {} of {} node(s) for processing",
            self.graph.node_indices().filter(|&i| self.graph[i].marked).count(),
            self.graph.node_count()
        );
        Ok(())
    }

    /// Compute the processable set for a walk direction: the marked nodes
    /// plus everything they depend on in that direction
    pub fn set_processable(&mut self, direction: WalkDirection) {
        let marked: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&i| self.graph[i].marked)
            .collect();
        let dependencies = self.closure(&marked, direction.predecessors());

        for index in self.graph.node_indices() {
            self.graph[index].processable =
                self.graph[index].marked || dependencies.contains(&index);
        }
    }

    /// All nodes reachable from `start` following `direction` edges,
    /// excluding the start nodes themselves
    fn closure(&self, start: &[NodeIndex], direction: Direction) -> HashSet<NodeIndex> {
        let mut reached = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = start.iter().copied().collect();
        while let Some(index) = queue.pop_front() {
            for neighbor in self.graph.neighbors_directed(index, direction) {
                if reached.insert(neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }
        reached
    }

    pub fn marked_ids(&self) -> Vec<String> {
        self.ids_where(|node| node.marked)
    }

    pub fn processable_ids(&self) -> Vec<String> {
        self.ids_where(|node| node.processable)
    }

    fn ids_where<F: Fn(&DagNode) -> bool>(&self, predicate: F) -> Vec<String> {
        let mut ids: Vec<String> = self
            .graph
            .node_indices()
            .filter(|&i| predicate(&self.graph[i]))
            .map(|i| {
                self.graph[i]
                    .installable
                    .read()
                    .expect("installable lock")
                    .fully_qualified_id()
            })
            .collect();
        ids.sort();
        ids
    }

    fn sorted_ids(&self) -> Vec<String> {
        self.ids_where(|_| true)
    }

    pub(crate) fn node(&self, index: NodeIndex) -> &DagNode {
        &self.graph[index]
    }

    pub(crate) fn neighbors(
        &self,
        index: NodeIndex,
        direction: Direction,
    ) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, direction)
    }

    /// Drive one walk over the processable nodes. Ready nodes are sent on
    /// `process_tx` until it fills; every node received on `done_rx`
    /// unlocks the successors whose predecessor counters reach zero. A
    /// single `true` is sent on `finished_tx` once every processable node
    /// has reported done. Dropping `cancel_rx`'s sender aborts the walk.
    pub(crate) fn walk(
        &self,
        direction: WalkDirection,
        process_tx: Sender<NodeIndex>,
        done_rx: Receiver<NodeIndex>,
        finished_tx: Sender<bool>,
        cancel_rx: Receiver<()>,
    ) {
        let predecessor_dir = direction.predecessors();
        let successor_dir = direction.successors();

        // unfinished predecessor counters, processable nodes only
        let mut pending: HashMap<NodeIndex, usize> = HashMap::new();
        for index in self.graph.node_indices() {
            if !self.graph[index].processable {
                continue;
            }
            let unfinished = self
                .graph
                .neighbors_directed(index, predecessor_dir)
                .filter(|&p| self.graph[p].processable)
                .count();
            pending.insert(index, unfinished);
        }

        let total = pending.len();
        let mut ready: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| pending.get(i) == Some(&0))
            .collect();
        let mut finished = 0usize;

        if total == 0 {
            let _ = finished_tx.send(true);
            return;
        }

        loop {
            // push ready nodes until the queue blocks
            while let Some(&index) = ready.front() {
                match process_tx.try_send(index) {
                    Ok(()) => {
                        trace!("Dispatched node {:?}", index);
                        ready.pop_front();
                    }
                    Err(TrySendError::Full(_)) => break,
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }

            crossbeam_channel::select! {
                recv(done_rx) -> msg => {
                    let Ok(index) = msg else { return };
                    finished += 1;
                    trace!("Node {:?} done ({}/{})", index, finished, total);
                    if finished == total {
                        let _ = finished_tx.send(true);
                        return;
                    }
                    for successor in self.graph.neighbors_directed(index, successor_dir) {
                        if let Some(count) = pending.get_mut(&successor) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                ready.push_back(successor);
                            }
                        }
                    }
                }
                recv(cancel_rx) -> _ => {
                    debug!("Walk cancelled");
                    return;
                }
            }
        }
    }
}

fn validate_selectors(selectors: &[String]) -> Result<()> {
    for selector in selectors {
        manifest::split_fully_qualified_id(selector)?;
    }
    Ok(())
}

fn matches_any(fq_id: &str, manifest_id: &str, selectors: &[String]) -> bool {
    selectors.iter().any(|selector| {
        if let Some((selector_manifest, selector_kapp)) =
            selector.split_once(NAMESPACE_SEPARATOR)
        {
            if selector_kapp == WILDCARD {
                return selector_manifest == manifest_id;
            }
        }
        selector == fq_id
    })
}
