//! History streams: per-stream aggregation flushed on each stream's own
//! cadence, one JSON-lines file per stream and worker.
//!
//! File names carry the start of the first timestep written, so a
//! restarted run opens new files next to the ones already flushed.

use anyhow::{Context, bail};
use chrono::{Datelike, NaiveDateTime, Timelike};
use serde_json::{Map, Value, json};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::{Aggregation, GlobalParameters, OutputFrequency, StreamConfig};
use crate::domain::LocalDomain;
use crate::model::{CellState, OutputStreamer};
use crate::time::TimeRecord;

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    sum: f64,
    min: f64,
    max: f64,
    first: f64,
    last: f64,
}

impl Accumulator {
    fn start(v: f64) -> Self {
        Self {
            sum: v,
            min: v,
            max: v,
            first: v,
            last: v,
        }
    }

    fn push(&mut self, v: f64) {
        self.sum += v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.last = v;
    }

    fn value(&self, aggregation: Aggregation, steps: usize) -> f64 {
        match aggregation {
            Aggregation::Avg => self.sum / steps as f64,
            Aggregation::Sum => self.sum,
            Aggregation::Min => self.min,
            Aggregation::Max => self.max,
            Aggregation::Beg => self.first,
            Aggregation::End => self.last,
        }
    }
}

struct Stream {
    config: StreamConfig,
    slots: Vec<usize>,
    window_start: Option<NaiveDateTime>,
    window_end: Option<NaiveDateTime>,
    steps: usize,
    /// `acc[cell][var]`
    acc: Vec<Vec<Accumulator>>,
    writer: Option<BufWriter<File>>,
}

impl Stream {
    fn accumulate(&mut self, record: &TimeRecord, state: &[CellState]) {
        if self.steps == 0 {
            self.window_start = Some(record.start);
            self.acc = state
                .iter()
                .map(|c| self.slots.iter().map(|&s| Accumulator::start(c.values[s])).collect())
                .collect();
        } else {
            for (acc, cell) in self.acc.iter_mut().zip(state) {
                for (a, &s) in acc.iter_mut().zip(&self.slots) {
                    a.push(cell.values[s]);
                }
            }
        }
        self.window_end = Some(record.end());
        self.steps += 1;
    }

    /// Whether the window closes once `record` has been accumulated.
    fn alarm(&self, record: &TimeRecord) -> bool {
        let Some(start) = self.window_start else {
            return false;
        };
        let end = record.end();
        let midnight = end.num_seconds_from_midnight() == 0;
        match self.config.frequency {
            OutputFrequency::Steps { every } => self.steps >= every,
            OutputFrequency::Days { every } => {
                midnight && (end.date() - start.date()).num_days() >= every as i64
            }
            OutputFrequency::Months { every } => {
                let months = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32;
                midnight && end.day() == 1 && months >= every as i32
            }
            OutputFrequency::Years { every } => {
                midnight && end.ordinal() == 1 && end.year() - start.year() >= every as i32
            }
            OutputFrequency::End => false,
        }
    }

    fn flush(&mut self, rank: usize, cells: &[usize]) -> anyhow::Result<()> {
        if self.steps == 0 {
            return Ok(());
        }
        let rows: Vec<Value> = cells
            .iter()
            .zip(&self.acc)
            .map(|(&cell, acc)| {
                let mut row = Map::new();
                row.insert("cell".to_string(), json!(cell));
                for (var, a) in self.config.variables.iter().zip(acc) {
                    row.insert(var.name.clone(), json!(a.value(var.aggregation, self.steps)));
                }
                Value::Object(row)
            })
            .collect();
        let line = json!({
            "stream": self.config.name,
            "rank": rank,
            "start": self.window_start,
            "end": self.window_end,
            "steps": self.steps,
            "cells": rows,
        });

        let Some(writer) = self.writer.as_mut() else {
            bail!("output stream `{}` is not open", self.config.name);
        };
        serde_json::to_writer(&mut *writer, &line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        self.steps = 0;
        self.window_start = None;
        self.window_end = None;
        Ok(())
    }
}

/// Reference [`OutputStreamer`] writing
/// `<dir>/<stream>.<YYYYMMDD_sssss>.rank<NNNN>.jsonl`.
pub struct HistoryStreamer {
    rank: usize,
    directory: PathBuf,
    state_variables: Vec<String>,
    cells: Vec<usize>,
    streams: Vec<Stream>,
}

impl HistoryStreamer {
    pub fn new(rank: usize, params: &GlobalParameters) -> Self {
        Self {
            rank,
            directory: params.output.directory.clone(),
            state_variables: params.state_variable_names(),
            cells: Vec::new(),
            streams: params
                .output
                .streams
                .iter()
                .map(|config| Stream {
                    config: config.clone(),
                    slots: Vec::new(),
                    window_start: None,
                    window_end: None,
                    steps: 0,
                    acc: Vec::new(),
                    writer: None,
                })
                .collect(),
        }
    }

    /// History file for `stream` when output opens at `first`.
    pub fn file_path(&self, stream: &str, first: &TimeRecord) -> PathBuf {
        self.directory.join(format!(
            "{}.{}.rank{:04}.jsonl",
            stream,
            first.start_stamp(),
            self.rank
        ))
    }
}

impl OutputStreamer for HistoryStreamer {
    fn open(&mut self, first: &TimeRecord, local: &LocalDomain) -> anyhow::Result<()> {
        self.cells = local.cells.clone();
        if self.streams.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.directory)
            .with_context(|| format!("creating output directory {}", self.directory.display()))?;

        let paths: Vec<PathBuf> = self
            .streams
            .iter()
            .map(|s| self.file_path(&s.config.name, first))
            .collect();
        let names = &self.state_variables;
        for (stream, path) in self.streams.iter_mut().zip(paths) {
            stream.slots = stream
                .config
                .variables
                .iter()
                .map(|v| {
                    names
                        .iter()
                        .position(|n| *n == v.name)
                        .with_context(|| format!("unknown output variable `{}`", v.name))
                })
                .collect::<anyhow::Result<_>>()?;
            let file = File::create(&path)
                .with_context(|| format!("creating history file {}", path.display()))?;
            stream.writer = Some(BufWriter::new(file));
            debug!("opened stream `{}` at {} -> {}", stream.config.name, first, path.display());
        }
        Ok(())
    }

    fn record(&mut self, record: &TimeRecord, state: &[CellState]) -> anyhow::Result<()> {
        for stream in &mut self.streams {
            stream.accumulate(record, state);
            if stream.alarm(record) {
                stream.flush(self.rank, &self.cells)?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        for stream in &mut self.streams {
            stream.flush(self.rank, &self.cells)?;
            if let Some(mut writer) = stream.writer.take() {
                writer.flush()?;
            }
        }
        if self.rank == 0 && !self.streams.is_empty() {
            info!("closed {} history stream(s) in {}", self.streams.len(), self.directory.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::config::OutputVariable;
    use crate::domain::{Decomposition, GlobalDomain};

    fn lines(path: &std::path::Path) -> Vec<Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn drive(params: &GlobalParameters) -> (HistoryStreamer, TimeRecord) {
        let domain = GlobalDomain::from_config(&params.domain).unwrap();
        let d = Decomposition::compute(&domain, 1, params.domain.decomposition).unwrap();
        let local = d.local_domain(&domain, 0);
        let records = params.time_records();

        let mut out = HistoryStreamer::new(0, params);
        out.open(&records[0], &local).unwrap();
        for record in &records {
            let state: Vec<CellState> = local
                .cells
                .iter()
                .map(|&cell| CellState {
                    cell,
                    values: vec![cell as f64, record.index as f64 + 1.0],
                })
                .collect();
            out.record(record, &state).unwrap();
        }
        out.close().unwrap();
        (out, records[0])
    }

    #[test]
    fn test_daily_sum_flushes_at_midnight() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = sample();
        params.output.directory = dir.path().to_path_buf();

        let (out, first) = drive(&params);
        let written = lines(&out.file_path("daily", &first));
        // 8 six-hour steps: two full days
        assert_eq!(written.len(), 2);
        assert_eq!(written[0]["steps"], 4);
        assert_eq!(written[0]["cells"][0]["runoff"], 1.0 + 2.0 + 3.0 + 4.0);
        assert_eq!(written[1]["cells"][0]["runoff"], 5.0 + 6.0 + 7.0 + 8.0);
    }

    #[test]
    fn test_end_stream_and_aggregations() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = sample();
        params.output.directory = dir.path().to_path_buf();
        params.output.streams = vec![StreamConfig {
            name: "summary".to_string(),
            frequency: OutputFrequency::End,
            variables: vec![
                OutputVariable { name: "runoff".to_string(), aggregation: Aggregation::Avg },
                OutputVariable { name: "storage".to_string(), aggregation: Aggregation::End },
            ],
        }];

        let (out, first) = drive(&params);
        let written = lines(&out.file_path("summary", &first));
        assert_eq!(written.len(), 1);
        assert_eq!(written[0]["steps"], 8);
        assert_eq!(written[0]["cells"][1]["cell"], 1);
        assert_eq!(written[0]["cells"][1]["runoff"], 4.5);
        assert_eq!(written[0]["cells"][1]["storage"], 1.0);
    }

    #[test]
    fn test_step_cadence_flushes_partial_window_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = sample();
        params.output.directory = dir.path().to_path_buf();
        params.output.streams[0].frequency = OutputFrequency::Steps { every: 3 };

        let (out, first) = drive(&params);
        let written = lines(&out.file_path("daily", &first));
        let steps: Vec<u64> = written.iter().map(|l| l["steps"].as_u64().unwrap()).collect();
        assert_eq!(steps, vec![3, 3, 2]);
    }
}
