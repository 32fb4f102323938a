//! Built-in analyzers.
//!
//! These cover the well-known loggers every producer emits: string
//! definitions, counters, and log messages. Anything beyond that is the
//! business of external analyzers plugged into the session the same way.

use tracing::warn;

use crate::analysis::{Analyzer, EventContext, RouteId, RouteRegistrar, SessionEdit};
use crate::analysis::providers::LogEntry;

/// Interns `strings.define` events into the session definition table.
///
/// String definitions are the special case everything else leans on:
/// later events reference text by id and the table hands back the one
/// interned copy.
#[derive(Default)]
pub struct StringsAnalyzer {
    define_route: Option<RouteId>,
}

impl StringsAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Analyzer for StringsAnalyzer {
    fn name(&self) -> &'static str {
        "strings"
    }

    fn on_analysis_begin(&mut self, routes: &mut RouteRegistrar<'_>) {
        self.define_route = Some(routes.route("strings", "define"));
    }

    fn on_event(&mut self, _route: RouteId, event: &EventContext<'_>, edit: &mut SessionEdit<'_>) {
        let id = event.u32("id") as u64;
        let text = event.str_field("text");
        edit.defs.insert_string(id, text);
    }
}

/// Builds per-counter timelines from `counters.announce` and
/// `counters.sample`.
#[derive(Default)]
pub struct CounterAnalyzer {
    announce_route: Option<RouteId>,
    sample_route: Option<RouteId>,
}

impl CounterAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Analyzer for CounterAnalyzer {
    fn name(&self) -> &'static str {
        "counters"
    }

    fn on_analysis_begin(&mut self, routes: &mut RouteRegistrar<'_>) {
        self.announce_route = Some(routes.route("counters", "announce"));
        self.sample_route = Some(routes.route("counters", "sample"));
    }

    fn on_event(&mut self, route: RouteId, event: &EventContext<'_>, edit: &mut SessionEdit<'_>) {
        if Some(route) == self.announce_route {
            let id = event.u32("id");
            let name_id = event.u32("name_id") as u64;
            let name = match edit.defs.string(name_id) {
                Some(name) => name,
                None => {
                    // Announcement referencing a string the producer
                    // never defined; keep the series usable under a
                    // synthetic name.
                    warn!("counter {id} announced with unknown name id {name_id}");
                    std::sync::Arc::from(format!("counter-{id}").as_str())
                }
            };
            edit.providers.counters.announce(id, &name);
        } else if Some(route) == self.sample_route {
            let id = event.u32("id");
            let value = event.f64("value");
            edit.providers.counters.sample(id, event.time(), value);
        }
    }
}

/// Collects `log.message` events, resolving message text through the
/// definition table.
#[derive(Default)]
pub struct LogAnalyzer {
    message_route: Option<RouteId>,
    dropped: u64,
}

impl LogAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Analyzer for LogAnalyzer {
    fn name(&self) -> &'static str {
        "log"
    }

    fn on_analysis_begin(&mut self, routes: &mut RouteRegistrar<'_>) {
        self.message_route = Some(routes.route("log", "message"));
    }

    fn on_event(&mut self, _route: RouteId, event: &EventContext<'_>, edit: &mut SessionEdit<'_>) {
        let text_id = event.u32("text_id") as u64;
        let level = event.u8("level");
        let Some(message) = edit.defs.string(text_id) else {
            self.dropped += 1;
            return;
        };
        edit.providers.log.push(LogEntry {
            ts: event.time(),
            level,
            message: message.to_string(),
        });
    }

    fn on_analysis_end(&mut self, _edit: &mut SessionEdit<'_>) {
        if self.dropped > 0 {
            warn!("{} log messages referenced undefined strings", self.dropped);
        }
    }
}

/// The analyzer set the `analyze` command runs with.
pub fn standard_analyzers() -> Vec<Box<dyn Analyzer>> {
    vec![
        Box::new(StringsAnalyzer::new()),
        Box::new(CounterAnalyzer::new()),
        Box::new(LogAnalyzer::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisSession;
    use crate::stream::BufferReader;
    use crate::trace::schema::{EventSpec, FieldType};
    use crate::trace::writer::{FieldValue, TraceWriter};
    use crate::transport::Transport;

    fn define_spec() -> EventSpec {
        EventSpec::new(
            1,
            "strings",
            "define",
            &[("id", FieldType::U32, false), ("text", FieldType::U8, true)],
        )
    }

    fn announce_spec() -> EventSpec {
        EventSpec::new(
            2,
            "counters",
            "announce",
            &[("id", FieldType::U32, false), ("name_id", FieldType::U32, false)],
        )
    }

    fn sample_spec() -> EventSpec {
        EventSpec::new(
            3,
            "counters",
            "sample",
            &[("id", FieldType::U32, false), ("value", FieldType::F64, false)],
        )
    }

    fn message_spec() -> EventSpec {
        EventSpec::new(
            4,
            "log",
            "message",
            &[("text_id", FieldType::U32, false), ("level", FieldType::U8, false)],
        )
    }

    fn run_session(wire: Vec<u8>) -> AnalysisSession {
        let mut session = AnalysisSession::new();
        for analyzer in standard_analyzers() {
            session.add_analyzer(analyzer);
        }
        let mut transport = Transport::new(Box::new(BufferReader::new(wire)));
        session.process(&mut transport).unwrap();
        session
    }

    #[test]
    fn test_definitions_resolve_counters_and_logs() {
        let define = define_spec();
        let announce = announce_spec();
        let sample = sample_spec();
        let message = message_spec();

        let mut writer = TraceWriter::new();
        writer.declare(&define);
        writer.declare(&announce);
        writer.declare(&sample);
        writer.declare(&message);

        writer
            .write_event(0, &define, 0, &[FieldValue::U32(1), FieldValue::Bytes(b"frame_ms")])
            .unwrap();
        writer
            .write_event(0, &define, 0, &[FieldValue::U32(2), FieldValue::Bytes(b"engine up")])
            .unwrap();
        writer
            .write_event(7, &announce, 5, &[FieldValue::U32(100), FieldValue::U32(1)])
            .unwrap();
        writer
            .write_event(7, &sample, 10, &[FieldValue::U32(100), FieldValue::F64(16.6)])
            .unwrap();
        writer
            .write_event(7, &sample, 20, &[FieldValue::U32(100), FieldValue::F64(33.2)])
            .unwrap();
        writer
            .write_event(8, &message, 15, &[FieldValue::U32(2), FieldValue::U8(1)])
            .unwrap();

        let session = run_session(writer.into_bytes().to_vec());

        assert_eq!(session.definitions().len(), 2);
        session.read(|providers| {
            let series = providers.counters.series(100).unwrap();
            assert_eq!(series.name, "frame_ms");
            assert_eq!(series.points, vec![(10, 16.6), (20, 33.2)]);

            assert_eq!(providers.log.len(), 1);
            assert_eq!(providers.log.entries()[0].message, "engine up");
            assert_eq!(providers.log.entries()[0].level, 1);
        });
    }

    #[test]
    fn test_unknown_name_id_gets_synthetic_name() {
        let announce = announce_spec();
        let mut writer = TraceWriter::new();
        writer.declare(&announce);
        writer
            .write_event(1, &announce, 0, &[FieldValue::U32(7), FieldValue::U32(999)])
            .unwrap();

        let session = run_session(writer.into_bytes().to_vec());
        session.read(|providers| {
            assert_eq!(providers.counters.series(7).unwrap().name, "counter-7");
        });
    }

    #[test]
    fn test_log_without_definition_dropped() {
        let message = message_spec();
        let mut writer = TraceWriter::new();
        writer.declare(&message);
        writer
            .write_event(1, &message, 0, &[FieldValue::U32(42), FieldValue::U8(0)])
            .unwrap();

        let session = run_session(writer.into_bytes().to_vec());
        session.read(|providers| assert!(providers.log.is_empty()));
    }
}
