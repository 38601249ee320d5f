//! Fan-out of one operation to every worker of a run.
//!
//! The dispatcher builds one [`TaskDescriptor`] per worker ordinal, launches
//! a pinned thread per worker context, opens the [`StartGate`] once every
//! thread exists, runs the coordinator's task (if the placement gives it one)
//! and joins everything before aggregating. Any failure fails the whole
//! invocation and no row is produced.

use std::any::Any;
use std::hint::black_box;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;

use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::error::{BenchError, Result};
use crate::key::Key;
use crate::ops::Operation;
use crate::stats::{self, BenchDescriptor, ResultRow, TaskReport};
use crate::table::HashTable;
use crate::topology::{self, Slot, Topology, WorkerContext};
use crate::workload::{KeySet, PatternSet};

// ===========================================================================
// Start gate
// ===========================================================================

/// One-shot start signal shared by the workers of an invocation.
pub struct StartGate {
    state: AtomicU8,
}

impl StartGate {
    const CLOSED: u8 = 0;
    const OPEN: u8 = 1;
    const ABORTED: u8 = 2;

    /// Spins before falling back to yielding the core.
    const SPINS: u32 = 1 << 10;

    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::CLOSED),
        }
    }

    pub fn open(&self) {
        self.state.store(Self::OPEN, Ordering::Release);
    }

    pub fn abort(&self) {
        self.state.store(Self::ABORTED, Ordering::Release);
    }

    /// Blocks until the gate opens (true) or is aborted (false).
    pub fn wait(&self) -> bool {
        let mut spins = 0u32;
        self.wait_with(|| {
            if spins < Self::SPINS {
                spins += 1;
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        })
    }

    /// Like [`wait`](Self::wait), calling `backoff` between polls.
    pub fn wait_with(&self, mut backoff: impl FnMut()) -> bool {
        loop {
            match self.state.load(Ordering::Acquire) {
                Self::OPEN => return true,
                Self::ABORTED => return false,
                _ => backoff(),
            }
        }
    }
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tasks
// ===========================================================================

/// The inputs of one invocation, indexed by worker ordinal.
pub struct Invocation<'a> {
    pub op: Operation,
    pub keys: &'a [KeySet],
    /// Empty for operations that take no patterns.
    pub patterns: &'a [PatternSet],
    pub key_count: usize,
    pub op_count: u64,
}

/// Everything one worker needs for one invocation, and where its metrics go.
pub struct TaskDescriptor<'a> {
    pub ordinal: usize,
    pub slot: Slot,
    pub op: Operation,
    pub keys: &'a [Key],
    pub key_count: usize,
    pub patterns: &'a [Key],
    pub table: &'a mut dyn HashTable,
    pub op_count: u64,
    pub report: &'a mut TaskReport,
}

impl TaskDescriptor<'_> {
    /// Runs the operation, timing only the operation itself.
    pub fn execute(self, clock: Clock) -> Result<()> {
        let start = Clock::now();
        let outcome = self.op.run(
            self.table,
            self.keys,
            self.key_count,
            self.patterns,
            self.op_count,
        )?;
        let cycles = Clock::now().wrapping_sub(start);

        if outcome.failures > 0 {
            warn!(
                worker = self.ordinal,
                failures = outcome.failures,
                inserted = outcome.ops - outcome.failures,
                "inserts rejected by a full table"
            );
        }
        *self.report = TaskReport::from_measurement(
            outcome.ops,
            cycles,
            clock.hz(),
            outcome.success_rate,
            outcome.sink,
        );
        Ok(())
    }

    fn run_on_worker(self, gate: &StartGate, clock: Clock, pin: bool) -> Result<()> {
        let ordinal = self.ordinal;
        let ctx = self.slot.context();
        if pin && !topology::pin_current(ctx) {
            return Err(BenchError::WorkerFailed {
                worker: ordinal,
                reason: format!("cannot pin to core {}", ctx.core),
            });
        }
        if !gate.wait() {
            return Err(BenchError::WorkerFailed {
                worker: ordinal,
                reason: "start aborted".into(),
            });
        }
        self.execute(clock)
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".into()
    }
}

// ===========================================================================
// Dispatcher
// ===========================================================================

pub struct Dispatcher {
    topology: Topology,
    /// One report per worker ordinal, sized once and reused.
    reports: Vec<TaskReport>,
    sink: u64,
}

impl Dispatcher {
    pub fn new(topology: Topology, max_workers: usize) -> Self {
        Self {
            topology,
            reports: vec![TaskReport::default(); max_workers],
            sink: 0,
        }
    }

    /// Builds one table per task of a `core_count` run. Each is made on a
    /// thread pinned to the core of the worker that will use it (the
    /// coordinator's on the calling thread), so its pages are first touched
    /// on that worker's socket.
    pub fn build_tables<F>(&self, core_count: usize, make: F) -> Result<Vec<Box<dyn HashTable>>>
    where
        F: Fn(WorkerContext) -> Result<Box<dyn HashTable>> + Sync,
    {
        let placement = self.topology.place(core_count)?;
        let pin = self.topology.pins();
        let make = &make;
        let build = move |ordinal: usize, slot: Slot| -> Result<Box<dyn HashTable>> {
            let ctx = slot.context();
            if pin && !slot.is_coordinator() && !topology::pin_current(ctx) {
                return Err(BenchError::WorkerFailed {
                    worker: ordinal,
                    reason: format!("cannot pin to core {}", ctx.core),
                });
            }
            make(ctx).map_err(|e| BenchError::TableCreate {
                worker: ordinal,
                socket: ctx.socket,
                source: Box::new(e),
            })
        };
        let build = &build;

        let (workers, coordinator) = match placement.slots().split_last() {
            Some((last, rest)) if last.is_coordinator() => (rest, Some(*last)),
            _ => (placement.slots(), None),
        };

        let built: Vec<Result<Box<dyn HashTable>>> = thread::scope(|s| {
            let mut handles = Vec::with_capacity(workers.len());
            let mut built = Vec::with_capacity(placement.len());
            for (ordinal, &slot) in workers.iter().enumerate() {
                let spawned = thread::Builder::new()
                    .name(format!("builder-{ordinal}"))
                    .spawn_scoped(s, move || build(ordinal, slot));
                match spawned {
                    Ok(handle) => handles.push((ordinal, handle)),
                    Err(e) => {
                        built.push(Err(BenchError::WorkerFailed {
                            worker: ordinal,
                            reason: format!("cannot launch: {e}"),
                        }));
                        break;
                    }
                }
            }
            let own = coordinator.map(|slot| build(workers.len(), slot));

            let mut joined: Vec<_> = handles
                .into_iter()
                .map(|(ordinal, handle)| {
                    handle.join().unwrap_or_else(|p| {
                        Err(BenchError::WorkerFailed {
                            worker: ordinal,
                            reason: panic_reason(p),
                        })
                    })
                })
                .collect();
            joined.append(&mut built);
            joined.extend(own);
            joined
        });

        let tables = built.into_iter().collect::<Result<Vec<_>>>()?;
        debug!(tables = tables.len(), "tables built");
        Ok(tables)
    }

    /// Combined hash sinks of every task run so far.
    pub fn sink(&self) -> u64 {
        self.sink
    }

    /// Runs `inv` on `core_count` workers and aggregates their reports.
    ///
    /// Worker `i` uses `inv.keys[i]`, `inv.patterns[i]` and `tables[i]`.
    pub fn run(
        &mut self,
        inv: &Invocation<'_>,
        tables: &mut [Box<dyn HashTable>],
        desc: &BenchDescriptor,
        core_count: usize,
    ) -> Result<ResultRow> {
        let placement = self.topology.place(core_count)?;
        if core_count > self.reports.len() {
            return Err(BenchError::Invocation(format!(
                "{core_count} workers requested, dispatcher sized for {}",
                self.reports.len()
            )));
        }
        if inv.keys.len() < core_count || tables.len() < core_count {
            return Err(BenchError::Invocation(format!(
                "{core_count} workers but {} key sets and {} tables",
                inv.keys.len(),
                tables.len()
            )));
        }
        if !inv.patterns.is_empty() && inv.patterns.len() < core_count {
            return Err(BenchError::Invocation(format!(
                "{core_count} workers but {} pattern sets",
                inv.patterns.len()
            )));
        }

        let clock = Clock::global();
        let pin = self.topology.pins();
        let gate = StartGate::new();

        let mut tasks: Vec<TaskDescriptor<'_>> = placement
            .slots()
            .iter()
            .zip(tables.iter_mut())
            .zip(self.reports.iter_mut())
            .enumerate()
            .map(|(ordinal, ((slot, table), report))| TaskDescriptor {
                ordinal,
                slot: *slot,
                op: inv.op,
                keys: &inv.keys[ordinal],
                key_count: inv.key_count,
                patterns: inv.patterns.get(ordinal).map_or(&[][..], |p| &p[..]),
                table: table.as_mut(),
                op_count: inv.op_count,
                report,
            })
            .collect();
        // The coordinator, when used, always takes the last ordinal.
        let coordinator_task = if placement.uses_coordinator() {
            tasks.pop()
        } else {
            None
        };

        debug!(
            operation = %inv.op,
            workers = tasks.len(),
            coordinator = coordinator_task.is_some(),
            "dispatching"
        );

        let mut failures: Vec<BenchError> = Vec::new();
        thread::scope(|s| {
            let mut handles = Vec::with_capacity(tasks.len());
            for task in tasks {
                let ordinal = task.ordinal;
                let gate = &gate;
                let spawned = thread::Builder::new()
                    .name(format!("worker-{ordinal}"))
                    .spawn_scoped(s, move || task.run_on_worker(gate, clock, pin));
                match spawned {
                    Ok(handle) => handles.push((ordinal, handle)),
                    Err(e) => {
                        gate.abort();
                        failures.push(BenchError::WorkerFailed {
                            worker: ordinal,
                            reason: format!("cannot launch: {e}"),
                        });
                        break;
                    }
                }
            }

            if failures.is_empty() {
                gate.open();
                if let Some(task) = coordinator_task {
                    let ordinal = task.ordinal;
                    match panic::catch_unwind(AssertUnwindSafe(|| task.execute(clock))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => failures.push(e),
                        Err(p) => failures.push(BenchError::WorkerFailed {
                            worker: ordinal,
                            reason: panic_reason(p),
                        }),
                    }
                }
            }

            for (ordinal, handle) in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failures.push(e),
                    Err(p) => failures.push(BenchError::WorkerFailed {
                        worker: ordinal,
                        reason: panic_reason(p),
                    }),
                }
            }
        });

        if !failures.is_empty() {
            for e in &failures {
                error!(operation = %inv.op, error = %e, "task failed");
            }
            return Err(failures.swap_remove(0));
        }

        let reports = &self.reports[..core_count];
        for report in reports {
            self.sink = self.sink.wrapping_add(black_box(report.sink));
        }
        Ok(stats::aggregate(desc, reports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Payload;
    use crate::table::{InsertStatus, IntegrityError, TableStats, Variant};
    use crate::workload::{self, seeded};

    // -- Start gate tests ---------------------------------------------------

    #[test]
    fn gate_opens() {
        let gate = StartGate::new();
        gate.open();
        assert!(gate.wait());
    }

    #[test]
    fn gate_aborts() {
        let gate = StartGate::new();
        gate.abort();
        assert!(!gate.wait());
    }

    #[test]
    fn shuttle_gate_releases_every_waiter() {
        use shuttle::thread;
        use std::sync::Arc;

        shuttle::check_random(
            || {
                let gate = Arc::new(StartGate::new());
                let started = Arc::new(std::sync::atomic::AtomicUsize::new(0));
                let handles: Vec<_> = (0..3)
                    .map(|_| {
                        let gate = gate.clone();
                        let started = started.clone();
                        thread::spawn(move || {
                            assert!(gate.wait_with(thread::yield_now));
                            started.fetch_add(1, Ordering::SeqCst);
                        })
                    })
                    .collect();
                assert_eq!(started.load(Ordering::SeqCst), 0);
                gate.open();
                for h in handles {
                    h.join().unwrap();
                }
                assert_eq!(started.load(Ordering::SeqCst), 3);
            },
            200,
        );
    }

    #[test]
    fn shuttle_gate_abort_releases_without_running() {
        use shuttle::thread;
        use std::sync::Arc;

        shuttle::check_random(
            || {
                let gate = Arc::new(StartGate::new());
                let handles: Vec<_> = (0..2)
                    .map(|_| {
                        let gate = gate.clone();
                        thread::spawn(move || gate.wait_with(thread::yield_now))
                    })
                    .collect();
                gate.abort();
                for h in handles {
                    assert!(!h.join().unwrap());
                }
            },
            200,
        );
    }

    // -- Dispatcher tests ---------------------------------------------------

    struct Fixture {
        keys: Vec<KeySet>,
        patterns: Vec<PatternSet>,
        tables: Vec<Box<dyn HashTable>>,
    }

    const KEYS: usize = 500;

    fn filled_table(keys: &[Key]) -> Box<dyn HashTable> {
        let mut t = Variant::Bloom4.create(KEYS * 2, 0).unwrap();
        for key in keys {
            t.add_key_with_data(*key, Payload::splat(1));
        }
        t
    }

    fn copy_of(src: &KeySet) -> KeySet {
        let mut dst = KeySet::new(src.len(), 0, Key::ZERO).unwrap();
        dst.copy_from_slice(src);
        dst
    }

    fn fixture(workers: usize, miss_rate: f64) -> Fixture {
        let mut rng = seeded(31);
        let keys: Vec<_> = (0..workers)
            .map(|_| workload::generate(KEYS, 1.0, 0, &mut rng).unwrap())
            .collect();
        let patterns = (0..workers)
            .map(|_| workload::generate_patterns(miss_rate, 0, &mut rng).unwrap())
            .collect();
        let tables = keys.iter().map(|k| filled_table(k)).collect();
        Fixture {
            keys,
            patterns,
            tables,
        }
    }

    /// Every worker gets the same keys, patterns and table contents.
    fn uniform_fixture(workers: usize, miss_rate: f64) -> Fixture {
        let mut rng = seeded(32);
        let keys = workload::generate(KEYS, 1.0, 0, &mut rng).unwrap();
        let patterns = workload::generate_patterns(miss_rate, 0, &mut rng).unwrap();
        Fixture {
            keys: (0..workers).map(|_| copy_of(&keys)).collect(),
            patterns: (0..workers).map(|_| copy_of(&patterns)).collect(),
            tables: (0..workers).map(|_| filled_table(&keys)).collect(),
        }
    }

    fn desc(op: Operation) -> BenchDescriptor {
        BenchDescriptor {
            implementation: "bloom4".into(),
            operation: op.name(),
            capacity: KEYS * 2,
            load_factor: 0.5,
        }
    }

    fn lookup<'a>(keys: &'a [KeySet], patterns: &'a [PatternSet]) -> Invocation<'a> {
        Invocation {
            op: Operation::Lookup,
            keys,
            patterns,
            key_count: KEYS,
            op_count: 2_000,
        }
    }

    #[test]
    fn identical_workers_match_single_worker() {
        let mut f = uniform_fixture(4, 0.5);
        let mut d = Dispatcher::new(Topology::synthetic(4), 4);
        let inv = lookup(&f.keys, &f.patterns);
        let single = d.run(&inv, &mut f.tables, &desc(Operation::Lookup), 1).unwrap();
        let many = d.run(&inv, &mut f.tables, &desc(Operation::Lookup), 4).unwrap();
        assert_eq!(single.core_count, 1);
        assert_eq!(many.core_count, 4);
        assert!(single.success_rate > 0.3 && single.success_rate < 0.7);
        assert_eq!(single.success_rate, many.success_rate);
        assert!(single.op_cycles > 0.0 && many.op_rate > 0.0);
    }

    #[test]
    fn coordinator_runs_the_last_task() {
        let mut f = fixture(3, 0.0);
        let mut d = Dispatcher::new(Topology::synthetic(2), 3);
        assert!(Topology::synthetic(2).place(3).unwrap().uses_coordinator());
        let row = d
            .run(&lookup(&f.keys, &f.patterns), &mut f.tables, &desc(Operation::Lookup), 3)
            .unwrap();
        assert_eq!(row.core_count, 3);
        assert_eq!(row.success_rate, 1.0);
    }

    #[test]
    fn hash_sink_is_collected() {
        let mut f = fixture(2, 0.0);
        let mut d = Dispatcher::new(Topology::synthetic(2), 2);
        let inv = Invocation {
            op: Operation::Hash,
            keys: &f.keys,
            patterns: &[],
            key_count: KEYS,
            op_count: 1_000,
        };
        d.run(&inv, &mut f.tables, &desc(Operation::Hash), 2).unwrap();
        assert_ne!(d.sink(), 0);
    }

    #[test]
    fn too_many_cores_is_rejected_before_launch() {
        let mut f = fixture(2, 0.0);
        let mut d = Dispatcher::new(Topology::synthetic(1), 4);
        let err = d
            .run(&lookup(&f.keys, &f.patterns), &mut f.tables, &desc(Operation::Lookup), 3)
            .unwrap_err();
        assert!(matches!(err, BenchError::NotEnoughCores { .. }));
    }

    #[test]
    fn tables_are_built_on_their_workers() {
        let d = Dispatcher::new(Topology::synthetic(2), 3);
        let caller = thread::current().id();
        let seen = std::sync::Mutex::new(Vec::new());
        let tables = d
            .build_tables(3, |ctx| {
                let me = thread::current();
                let on_caller = me.id() == caller;
                seen.lock().unwrap().push((ctx.core, on_caller, me.name().map(str::to_owned)));
                Variant::Swiss.create(ctx.core + 10, ctx.socket)
            })
            .unwrap();

        // Ordinal order: the workers on cores 1 and 2, then the coordinator.
        let caps: Vec<_> = tables.iter().map(|t| t.stats().capacity).collect();
        assert_eq!(caps, [11, 12, 10]);

        let mut seen = seen.into_inner().unwrap();
        seen.sort_by_key(|(core, _, _)| *core);
        assert!(seen[0].1, "coordinator table built by the caller");
        assert_eq!((seen[1].1, seen[1].2.as_deref()), (false, Some("builder-0")));
        assert_eq!((seen[2].1, seen[2].2.as_deref()), (false, Some("builder-1")));
    }

    #[test]
    fn table_build_failure_names_the_worker() {
        let d = Dispatcher::new(Topology::synthetic(2), 2);
        let result = d.build_tables(2, |ctx| {
            if ctx.core == 2 {
                return Err(BenchError::Alloc {
                    bytes: 64,
                    socket: ctx.socket,
                });
            }
            Variant::Std.create(8, ctx.socket)
        });
        match result {
            Err(BenchError::TableCreate { worker: 1, socket: 0, source }) => {
                assert!(matches!(*source, BenchError::Alloc { bytes: 64, .. }));
            }
            other => panic!("unexpected result {:?}", other.map(|t| t.len())),
        }
    }

    struct PanicTable;

    impl HashTable for PanicTable {
        fn name(&self) -> &'static str {
            "panic"
        }
        fn add_key_with_data(&mut self, _: Key, _: Payload) -> InsertStatus {
            InsertStatus::Inserted
        }
        fn lookup(&self, _: &Key) -> Option<Payload> {
            panic!("table exploded")
        }
        fn reset(&mut self) {}
        fn check_integrity(&self) -> std::result::Result<(), IntegrityError> {
            Ok(())
        }
        fn stats(&self) -> TableStats {
            TableStats::default()
        }
    }

    #[test]
    fn failing_worker_produces_no_row() {
        let mut f = fixture(2, 0.0);
        f.tables[1] = Box::new(PanicTable);
        let mut d = Dispatcher::new(Topology::synthetic(2), 2);
        match d.run(&lookup(&f.keys, &f.patterns), &mut f.tables, &desc(Operation::Lookup), 2) {
            Err(BenchError::WorkerFailed { worker: 1, reason }) => {
                assert!(reason.contains("table exploded"), "{reason}");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn failing_coordinator_task_produces_no_row() {
        let mut f = fixture(2, 0.0);
        f.tables[1] = Box::new(PanicTable);
        let mut d = Dispatcher::new(Topology::synthetic(1), 2);
        let err = d
            .run(&lookup(&f.keys, &f.patterns), &mut f.tables, &desc(Operation::Lookup), 2)
            .unwrap_err();
        assert!(matches!(err, BenchError::WorkerFailed { worker: 1, .. }));
    }
}
