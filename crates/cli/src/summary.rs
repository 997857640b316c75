//! Offline digest of an event log.

use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use watcher::EventRecord;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct VariableSummary {
    pub mutations: u64,
    pub deltas: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub events: u64,
    pub deltas: u64,
    /// Keyed by variable name.
    pub variables: BTreeMap<String, VariableSummary>,
}

impl Summary {
    pub fn add(&mut self, record: &EventRecord) {
        let deltas = record.deltas.len() as u64;
        self.events += 1;
        self.deltas += deltas;
        let variable = self
            .variables
            .entry(record.variable_name.clone())
            .or_default();
        variable.mutations += 1;
        variable.deltas += deltas;
    }

    /// Blank lines are skipped; any other unparsable line is an error.
    pub fn from_reader(reader: impl BufRead) -> anyhow::Result<Self> {
        let mut summary = Self::default();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: EventRecord = serde_json::from_str(&line)
                .with_context(|| format!("malformed record on line {}", index + 1))?;
            summary.add(&record);
        }
        Ok(summary)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
    }
}
