use petgraph::Direction::{Incoming, Outgoing};
use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graphmap::DiGraphMap;

use crate::engine::scheduler::TaskKey;

/// Who waits on whom. An edge `a -> b` means task `a` is blocked until `b`
/// finishes.
#[derive(Default)]
pub(crate) struct WaitGraph {
    graph: DiGraphMap<TaskKey, ()>,
}

impl WaitGraph {
    /// Adds a wait edge. When the edge closes a cycle, returns every task
    /// caught in it, the waiter included.
    pub(crate) fn add(&mut self, waiter: TaskKey, target: TaskKey) -> Option<Vec<TaskKey>> {
        let closes = has_path_connecting(&self.graph, target, waiter, None);
        self.graph.add_edge(waiter, target, ());

        if !closes {
            return None;
        }

        tarjan_scc(&self.graph)
            .into_iter()
            .find(|component| component.contains(&waiter))
            .map(|mut component| {
                component.sort();
                component
            })
    }

    pub(crate) fn remove(&mut self, waiter: TaskKey, target: TaskKey) {
        self.graph.remove_edge(waiter, target);
        for node in [waiter, target] {
            let isolated = self.graph.contains_node(node)
                && self.graph.neighbors_directed(node, Incoming).next().is_none()
                && self.graph.neighbors_directed(node, Outgoing).next().is_none();
            if isolated {
                self.graph.remove_node(node);
            }
        }
    }
}
