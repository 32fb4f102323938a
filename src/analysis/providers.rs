//! Typed, queryable state built up by analyzers.
//!
//! Providers are owned by the analysis session and mutated only inside
//! the per-event edit scope; readers take the session's read lock and
//! never observe a half-applied event. The definition table sits outside
//! the provider lock: definitions are interned once, never mutated, and
//! looked up concurrently, so it uses the same lock-free map + handle
//! shape as the rest of the id interners in this codebase.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

/// Session-wide table of interned, immutable definitions.
///
/// A definition is created once from a definition event and referenced
/// by its numeric id by every later event. Values are reference-counted;
/// repeated lookups hand out clones of the same allocation.
#[derive(Debug, Default)]
pub struct DefinitionTable {
    strings: DashMap<u64, Arc<str>>,
}

impl DefinitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string definition. The first insert for an id wins;
    /// re-defining an id returns the existing value unchanged.
    pub fn insert_string(&self, id: u64, value: &str) -> Arc<str> {
        self.strings
            .entry(id)
            .or_insert_with(|| Arc::from(value))
            .clone()
    }

    pub fn string(&self, id: u64) -> Option<Arc<str>> {
        self.strings.get(&id).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// One counter's timeline: samples in dispatch order.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSeries {
    pub id: u32,
    pub name: String,
    pub points: Vec<(u64, f64)>,
}

impl CounterSeries {
    pub fn last_value(&self) -> Option<f64> {
        self.points.last().map(|(_, v)| *v)
    }
}

/// Timelines keyed by counter id.
#[derive(Debug, Default)]
pub struct CounterProvider {
    counters: BTreeMap<u32, CounterSeries>,
}

impl CounterProvider {
    /// Register (or re-register) a counter. Samples that arrived before
    /// the announcement are kept; the announcement just names them.
    pub fn announce(&mut self, id: u32, name: &str) {
        self.counters
            .entry(id)
            .or_insert_with(|| CounterSeries {
                id,
                name: String::new(),
                points: Vec::new(),
            })
            .name = name.to_string();
    }

    pub fn sample(&mut self, id: u32, ts: u64, value: f64) {
        self.counters
            .entry(id)
            .or_insert_with(|| CounterSeries {
                id,
                name: String::new(),
                points: Vec::new(),
            })
            .points
            .push((ts, value));
    }

    pub fn series(&self, id: u32) -> Option<&CounterSeries> {
        self.counters.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CounterSeries> {
        self.counters.values()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// One decoded log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub ts: u64,
    pub level: u8,
    pub message: String,
}

/// Log records in dispatch order.
#[derive(Debug, Default)]
pub struct LogProvider {
    entries: Vec<LogEntry>,
}

impl LogProvider {
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything the built-in analyzers populate, behind the session lock.
#[derive(Debug, Default)]
pub struct ProviderSet {
    pub counters: CounterProvider,
    pub log: LogProvider,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definitions_intern_once() {
        let defs = DefinitionTable::new();
        let first = defs.insert_string(1, "alpha");
        let again = defs.insert_string(1, "ignored");
        assert_eq!(&*again, "alpha");
        assert!(Arc::ptr_eq(&first, &again));
        assert!(Arc::ptr_eq(&first, &defs.string(1).unwrap()));
        assert!(defs.string(2).is_none());
    }

    #[test]
    fn test_counter_samples_before_announce_kept() {
        let mut counters = CounterProvider::default();
        counters.sample(3, 10, 1.5);
        counters.announce(3, "frame_time");
        counters.sample(3, 20, 2.5);

        let series = counters.series(3).unwrap();
        assert_eq!(series.name, "frame_time");
        assert_eq!(series.points, vec![(10, 1.5), (20, 2.5)]);
        assert_eq!(series.last_value(), Some(2.5));
    }
}
