//! Worker contexts, their sockets, and how tasks are placed on them.
//!
//! One context is reserved as the coordinator: it launches workers, waits
//! for them and aggregates their reports. Every other allowed core is a
//! worker context. A run asking for exactly one task more than there are
//! worker contexts puts that last task on the coordinator; asking for more
//! than that is a placement error.

use std::collections::HashMap;

use core_affinity::CoreId;
use tracing::{debug, info};

use crate::config::RuntimeArgs;
use crate::error::{BenchError, Result};
use crate::numa;

/// One pinned execution unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkerContext {
    pub core: usize,
    pub socket: usize,
}

/// Where one task of an invocation runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    Worker(WorkerContext),
    Coordinator(WorkerContext),
}

impl Slot {
    pub fn context(&self) -> WorkerContext {
        match *self {
            Slot::Worker(ctx) | Slot::Coordinator(ctx) => ctx,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, Slot::Coordinator(_))
    }
}

/// Task ordinal `i` runs on `slots()[i]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    slots: Vec<Slot>,
}

impl Placement {
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn uses_coordinator(&self) -> bool {
        self.slots.iter().any(Slot::is_coordinator)
    }
}

#[derive(Clone, Debug)]
pub struct Topology {
    coordinator: WorkerContext,
    workers: Vec<WorkerContext>,
    pin: bool,
}

impl Topology {
    /// Enumerates the cores this process may run on.
    ///
    /// `--lcores` restricts the set, `--main-lcore` picks the coordinator
    /// (default: the first allowed core).
    pub fn discover(args: &RuntimeArgs) -> Result<Self> {
        let allowed: Vec<usize> = core_affinity::get_core_ids()
            .ok_or_else(|| BenchError::Topology("cannot enumerate allowed cores".into()))?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut cores = match &args.lcores {
            Some(list) => {
                let wanted = numa::parse_cpu_list(list)?;
                if let Some(missing) = wanted.iter().find(|c| !allowed.contains(c)) {
                    return Err(BenchError::Topology(format!(
                        "core {missing} is not in the allowed set {allowed:?}"
                    )));
                }
                wanted
            }
            None => allowed,
        };
        cores.dedup();
        if cores.is_empty() {
            return Err(BenchError::Topology("no usable cores".into()));
        }

        let main = args.main_lcore.unwrap_or(cores[0]);
        let Some(main_pos) = cores.iter().position(|&c| c == main) else {
            return Err(BenchError::Topology(format!(
                "main core {main} is not in the core set {cores:?}"
            )));
        };

        let nodes = numa::cpu_to_node();
        let node_count = numa::node_count();
        let coordinator = context_of(cores.remove(main_pos), &nodes, node_count)?;
        let workers = cores
            .into_iter()
            .map(|core| context_of(core, &nodes, node_count))
            .collect::<Result<Vec<_>>>()?;
        info!(
            coordinator = coordinator.core,
            workers = workers.len(),
            sockets = numa::node_count(),
            pin = !args.no_pin,
            "topology discovered"
        );

        Ok(Self {
            coordinator,
            workers,
            pin: !args.no_pin,
        })
    }

    /// An unpinned topology on socket 0 with `workers` worker contexts.
    pub fn synthetic(workers: usize) -> Self {
        Self {
            coordinator: WorkerContext { core: 0, socket: 0 },
            workers: (1..=workers)
                .map(|core| WorkerContext { core, socket: 0 })
                .collect(),
            pin: false,
        }
    }

    pub fn enumerate_worker_contexts(&self) -> &[WorkerContext] {
        &self.workers
    }

    pub fn coordinator(&self) -> WorkerContext {
        self.coordinator
    }

    pub fn socket_of(&self, core: usize) -> Option<usize> {
        std::iter::once(&self.coordinator)
            .chain(&self.workers)
            .find(|ctx| ctx.core == core)
            .map(|ctx| ctx.socket)
    }

    pub fn pins(&self) -> bool {
        self.pin
    }

    /// Places `core_count` tasks: worker contexts first, in order, then the
    /// coordinator if and only if exactly one task is left over.
    pub fn place(&self, core_count: usize) -> Result<Placement> {
        let available = self.workers.len();
        if core_count > available + 1 {
            return Err(BenchError::NotEnoughCores {
                requested: core_count,
                available,
            });
        }

        let mut slots: Vec<Slot> = self
            .workers
            .iter()
            .take(core_count)
            .copied()
            .map(Slot::Worker)
            .collect();
        if core_count == available + 1 {
            slots.push(Slot::Coordinator(self.coordinator));
        }
        Ok(Placement { slots })
    }

    /// Pins the calling thread (the coordinator) to its core.
    pub fn pin_coordinator(&self) -> Result<()> {
        if !self.pin {
            return Ok(());
        }
        if !pin_current(self.coordinator) {
            return Err(BenchError::Topology(format!(
                "failed to pin the coordinator to core {}",
                self.coordinator.core
            )));
        }
        debug!(core = self.coordinator.core, "coordinator pinned");
        Ok(())
    }
}

/// Locates `core` on its node. With a single node every core is on node 0;
/// with several, a core missing from the node map is an error.
fn context_of(core: usize, nodes: &HashMap<usize, usize>, node_count: usize) -> Result<WorkerContext> {
    let socket = match nodes.get(&core) {
        Some(&node) => node,
        None if node_count <= 1 => 0,
        None => {
            return Err(BenchError::Topology(format!(
                "core {core} is not listed under any of the {node_count} NUMA nodes"
            )));
        }
    };
    Ok(WorkerContext { core, socket })
}

/// Pins the calling thread to `ctx`. Returns false if the OS refused.
pub fn pin_current(ctx: WorkerContext) -> bool {
    core_affinity::set_for_current(CoreId { id: ctx.core })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_prefers_workers() {
        let topo = Topology::synthetic(3);
        let placement = topo.place(2).unwrap();
        assert_eq!(placement.len(), 2);
        assert!(!placement.uses_coordinator());
        let cores: Vec<_> = placement.slots().iter().map(|s| s.context().core).collect();
        assert_eq!(cores, vec![1, 2]);
    }

    #[test]
    fn placement_exhausting_workers_leaves_coordinator_idle() {
        let topo = Topology::synthetic(3);
        let placement = topo.place(3).unwrap();
        assert!(!placement.uses_coordinator());
    }

    #[test]
    fn placement_short_by_one_uses_coordinator_for_last_task() {
        let topo = Topology::synthetic(3);
        let placement = topo.place(4).unwrap();
        assert_eq!(placement.len(), 4);
        assert_eq!(
            placement.slots()[3],
            Slot::Coordinator(WorkerContext { core: 0, socket: 0 })
        );
        assert_eq!(
            placement.slots().iter().filter(|s| s.is_coordinator()).count(),
            1
        );
    }

    #[test]
    fn placement_short_by_two_fails() {
        let topo = Topology::synthetic(3);
        match topo.place(5) {
            Err(BenchError::NotEnoughCores {
                requested: 5,
                available: 3,
            }) => {}
            other => panic!("unexpected placement {other:?}"),
        }
    }

    #[test]
    fn coordinator_only() {
        let topo = Topology::synthetic(0);
        let placement = topo.place(1).unwrap();
        assert!(placement.slots()[0].is_coordinator());
        assert!(topo.place(0).unwrap().is_empty());
    }

    #[test]
    fn socket_lookup() {
        let topo = Topology::synthetic(2);
        assert_eq!(topo.socket_of(0), Some(0));
        assert_eq!(topo.socket_of(2), Some(0));
        assert_eq!(topo.socket_of(9), None);
        assert!(!topo.pins());
        topo.pin_coordinator().unwrap();
    }

    #[test]
    fn unmapped_core_is_an_error_with_several_nodes() {
        let nodes = HashMap::from([(0, 0), (1, 1)]);
        assert_eq!(
            context_of(1, &nodes, 2).unwrap(),
            WorkerContext { core: 1, socket: 1 }
        );
        assert!(matches!(context_of(7, &nodes, 2), Err(BenchError::Topology(_))));
        // Without node information everything is on node 0.
        assert_eq!(
            context_of(7, &HashMap::new(), 1).unwrap(),
            WorkerContext { core: 7, socket: 0 }
        );
    }

    #[test]
    fn discover_rejects_unknown_main_core() {
        let args = RuntimeArgs {
            lcores: None,
            main_lcore: Some(usize::MAX),
            no_pin: true,
        };
        assert!(Topology::discover(&args).is_err());
    }

    #[test]
    fn discover_splits_coordinator_from_workers() {
        let args = RuntimeArgs {
            lcores: None,
            main_lcore: None,
            no_pin: true,
        };
        let Ok(topo) = Topology::discover(&args) else {
            // No affinity support on this host.
            return;
        };
        let coordinator = topo.coordinator().core;
        assert!(
            topo.enumerate_worker_contexts()
                .iter()
                .all(|w| w.core != coordinator)
        );
    }
}
