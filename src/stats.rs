//! Aggregation of per-worker reports and row output.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::Result;

pub const HEADER: [&str; 8] = [
    "implementation",
    "operation",
    "capacity",
    "load_factor",
    "core_count",
    "success_rate",
    "op_cycles",
    "op_rate",
];

/// Names one measurement; the core count is attached when a row is made.
#[derive(Clone, Debug, PartialEq)]
pub struct BenchDescriptor {
    pub implementation: String,
    pub operation: String,
    pub capacity: usize,
    pub load_factor: f64,
}

/// Per-worker metrics of one invocation.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct TaskReport {
    pub op_cycles: f64,
    pub op_rate: f64,
    pub success_rate: f64,
    pub sink: u64,
}

impl TaskReport {
    /// Metrics for `ops` operations that took `cycles` on a counter running
    /// at `hz`.
    pub fn from_measurement(ops: u64, cycles: u64, hz: f64, success_rate: f64, sink: u64) -> Self {
        let (op_cycles, op_rate) = if ops == 0 || cycles == 0 {
            (0.0, 0.0)
        } else {
            (
                cycles as f64 / ops as f64,
                ops as f64 / (cycles as f64 / hz),
            )
        };
        Self {
            op_cycles,
            op_rate,
            success_rate,
            sink,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultRow {
    pub implementation: String,
    pub operation: String,
    pub capacity: usize,
    pub load_factor: f64,
    pub core_count: usize,
    pub success_rate: f64,
    pub op_cycles: f64,
    pub op_rate: f64,
}

/// Arithmetic mean of every metric over `reports`.
pub fn aggregate(desc: &BenchDescriptor, reports: &[TaskReport]) -> ResultRow {
    let n = reports.len().max(1) as f64;
    let mean = |f: fn(&TaskReport) -> f64| reports.iter().map(f).sum::<f64>() / n;
    ResultRow {
        implementation: desc.implementation.clone(),
        operation: desc.operation.clone(),
        capacity: desc.capacity,
        load_factor: desc.load_factor,
        core_count: reports.len(),
        success_rate: mean(|r| r.success_rate),
        op_cycles: mean(|r| r.op_cycles),
        op_rate: mean(|r| r.op_rate),
    }
}

/// Where result rows go. Written by the coordinator only.
pub trait RowSink {
    fn emit(&mut self, row: &ResultRow) -> Result<()>;
}

impl RowSink for Vec<ResultRow> {
    fn emit(&mut self, row: &ResultRow) -> Result<()> {
        self.push(row.clone());
        Ok(())
    }
}

/// CSV output: the header up front, then one flushed record per row.
pub struct ResultSink<W: Write> {
    writer: csv::Writer<W>,
}

impl ResultSink<Box<dyn Write>> {
    /// Opens `-` (stdout) or a file path.
    pub fn open(dest: Option<&Path>) -> Result<Self> {
        let out: Box<dyn Write> = match dest {
            None => Box::new(io::stdout()),
            Some(p) if p.as_os_str() == "-" => Box::new(io::stdout()),
            Some(p) => Box::new(File::create(p)?),
        };
        ResultSink::new(out)
    }
}

impl<W: Write> ResultSink<W> {
    pub fn new(out: W) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(out);
        writer.write_record(HEADER)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    /// Flushes and hands back the writer.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| crate::error::BenchError::Io(e.into_error()))
    }
}

impl<W: Write> RowSink for ResultSink<W> {
    fn emit(&mut self, row: &ResultRow) -> Result<()> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> BenchDescriptor {
        BenchDescriptor {
            implementation: "bloom4".into(),
            operation: "lookup".into(),
            capacity: 1000,
            load_factor: 0.5,
        }
    }

    #[test]
    fn identical_workers_aggregate_to_one() {
        let one = TaskReport {
            op_cycles: 40.0,
            op_rate: 5e7,
            success_rate: 0.75,
            sink: 0,
        };
        let single = aggregate(&desc(), &[one]);
        let many = aggregate(&desc(), &[one; 6]);
        assert_eq!(single.success_rate, many.success_rate);
        assert_eq!(single.op_cycles, many.op_cycles);
        assert_eq!(many.core_count, 6);
    }

    #[test]
    fn mean_of_mixed_reports() {
        let reports = [
            TaskReport {
                op_cycles: 10.0,
                op_rate: 100.0,
                success_rate: 1.0,
                sink: 1,
            },
            TaskReport {
                op_cycles: 30.0,
                op_rate: 300.0,
                success_rate: 0.0,
                sink: 2,
            },
        ];
        let row = aggregate(&desc(), &reports);
        assert_eq!(row.op_cycles, 20.0);
        assert_eq!(row.op_rate, 200.0);
        assert_eq!(row.success_rate, 0.5);
    }

    #[test]
    fn measurement_metrics() {
        let r = TaskReport::from_measurement(1_000, 50_000, 1e9, 1.0, 0);
        assert_eq!(r.op_cycles, 50.0);
        assert_eq!(r.op_rate, 2e7);
        let idle = TaskReport::from_measurement(0, 50_000, 1e9, 0.0, 0);
        assert_eq!(idle.op_cycles, 0.0);
    }

    #[test]
    fn csv_output() {
        let mut sink = ResultSink::new(Vec::new()).unwrap();
        let mut row = aggregate(
            &desc(),
            &[TaskReport {
                op_cycles: 12.5,
                op_rate: 1e6,
                success_rate: 1.0,
                sink: 0,
            }],
        );
        sink.emit(&row).unwrap();
        row.operation = "lookup_batch_32".into();
        sink.emit(&row).unwrap();

        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines[0],
            "implementation,operation,capacity,load_factor,core_count,success_rate,op_cycles,op_rate"
        );
        assert_eq!(lines[1], "bloom4,lookup,1000,0.5,1,1.0,12.5,1000000.0");
        assert!(lines[2].starts_with("bloom4,lookup_batch_32,"));
        assert_eq!(lines.len(), 3);
    }
}
