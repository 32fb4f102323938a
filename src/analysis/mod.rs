//! Event analysis framework.
//!
//! An analysis session owns a set of pluggable analyzers, the schema
//! registry for the trace being decoded, the definition table, and the
//! providers the analyzers populate. Analyzers declare interest in
//! (logger, event) pairs at session start; each pair gets a dense route
//! id that is stable for the session's lifetime and is used for
//! dispatch.
//!
//! Decode discipline: events for one session are dispatched strictly in
//! the order they are decoded, one at a time; all provider mutation for
//! one event happens inside a single scoped edit (one write-lock
//! acquisition), so concurrent readers never see a half-applied event.
//! A schema mismatch between producer and analyzer is a programming
//! error, not a runtime condition: typed field access on a mismatched
//! layout panics, and an undeclared event uid aborts the pump.

pub mod analyzers;
pub mod providers;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::debug;

use crate::trace::constants::{CONTROL_THREAD_ID, EVENT_HEADER_SIZE, NEW_EVENT_UID};
use crate::trace::schema::{EventSpec, FieldSpec, FieldType, SchemaRegistry};
use crate::transport::{ThreadStream, Transport};
use providers::{DefinitionTable, ProviderSet};

/// Dense dispatch id for one registered (logger, event) pair.
pub type RouteId = usize;

/// A decoded event handed to an analyzer: typed access to the fields of
/// one occurrence, plus its timestamp.
pub struct EventContext<'a> {
    spec: &'a EventSpec,
    payload: &'a [u8],
    ts: u64,

    // Per array field (in declaration order): data offset and element
    // count, resolved once when the context is built.
    arrays: Vec<(usize, usize)>,
}

impl<'a> EventContext<'a> {
    /// Validate `payload` against `spec` and resolve the array section.
    /// A payload that does not match the declared layout is a schema
    /// mismatch and fails here.
    pub fn new(spec: &'a EventSpec, payload: &'a [u8], ts: u64) -> Result<Self> {
        if payload.len() < spec.fixed_size {
            bail!(
                "{}.{}: payload {} bytes, fixed section needs {}",
                spec.logger,
                spec.name,
                payload.len(),
                spec.fixed_size
            );
        }
        let mut arrays = Vec::new();
        let mut off = spec.fixed_size;
        for field in spec.fields.iter().filter(|f| f.array) {
            if off + 2 > payload.len() {
                bail!("{}.{}: truncated array header", spec.logger, spec.name);
            }
            let count = u16::from_le_bytes([payload[off], payload[off + 1]]) as usize;
            let data_off = off + 2;
            let data_len = count * field.ty.width();
            if data_off + data_len > payload.len() {
                bail!("{}.{}: truncated array field {}", spec.logger, spec.name, field.name);
            }
            arrays.push((data_off, count));
            off = data_off + data_len;
        }
        if off != payload.len() {
            bail!(
                "{}.{}: {} trailing bytes after declared fields",
                spec.logger,
                spec.name,
                payload.len() - off
            );
        }
        Ok(EventContext {
            spec,
            payload,
            ts,
            arrays,
        })
    }

    pub fn logger(&self) -> &str {
        &self.spec.logger
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Monotonic event time.
    pub fn time(&self) -> u64 {
        self.ts
    }

    fn fixed_field(&self, name: &str, ty: FieldType) -> Option<&FieldSpec> {
        let field = self.spec.field(name)?;
        if field.array || field.ty != ty {
            return None;
        }
        Some(field)
    }

    // Schema lockstep: a missing or differently-typed field means the
    // analyzer was built against another producer version. That is not
    // recoverable; fail loudly.
    fn mismatch(&self, name: &str) -> ! {
        panic!(
            "schema mismatch: {}.{} has no field {name:?} of the requested shape",
            self.spec.logger, self.spec.name
        );
    }

    pub fn try_u8(&self, name: &str) -> Option<u8> {
        let f = self.fixed_field(name, FieldType::U8)?;
        Some(self.payload[f.offset])
    }

    pub fn try_u16(&self, name: &str) -> Option<u16> {
        let f = self.fixed_field(name, FieldType::U16)?;
        Some(u16::from_le_bytes(
            self.payload[f.offset..f.offset + 2].try_into().unwrap(),
        ))
    }

    pub fn try_u32(&self, name: &str) -> Option<u32> {
        let f = self.fixed_field(name, FieldType::U32)?;
        Some(u32::from_le_bytes(
            self.payload[f.offset..f.offset + 4].try_into().unwrap(),
        ))
    }

    pub fn try_u64(&self, name: &str) -> Option<u64> {
        let f = self.fixed_field(name, FieldType::U64)?;
        Some(u64::from_le_bytes(
            self.payload[f.offset..f.offset + 8].try_into().unwrap(),
        ))
    }

    pub fn try_f32(&self, name: &str) -> Option<f32> {
        let f = self.fixed_field(name, FieldType::F32)?;
        Some(f32::from_le_bytes(
            self.payload[f.offset..f.offset + 4].try_into().unwrap(),
        ))
    }

    pub fn try_f64(&self, name: &str) -> Option<f64> {
        let f = self.fixed_field(name, FieldType::F64)?;
        Some(f64::from_le_bytes(
            self.payload[f.offset..f.offset + 8].try_into().unwrap(),
        ))
    }

    pub fn u8(&self, name: &str) -> u8 {
        self.try_u8(name).unwrap_or_else(|| self.mismatch(name))
    }

    pub fn u16(&self, name: &str) -> u16 {
        self.try_u16(name).unwrap_or_else(|| self.mismatch(name))
    }

    pub fn u32(&self, name: &str) -> u32 {
        self.try_u32(name).unwrap_or_else(|| self.mismatch(name))
    }

    pub fn u64(&self, name: &str) -> u64 {
        self.try_u64(name).unwrap_or_else(|| self.mismatch(name))
    }

    pub fn f32(&self, name: &str) -> f32 {
        self.try_f32(name).unwrap_or_else(|| self.mismatch(name))
    }

    pub fn f64(&self, name: &str) -> f64 {
        self.try_f64(name).unwrap_or_else(|| self.mismatch(name))
    }

    /// Any unsigned fixed field, widened.
    pub fn value_u64(&self, name: &str) -> u64 {
        self.try_u8(name)
            .map(u64::from)
            .or_else(|| self.try_u16(name).map(u64::from))
            .or_else(|| self.try_u32(name).map(u64::from))
            .or_else(|| self.try_u64(name))
            .unwrap_or_else(|| self.mismatch(name))
    }

    /// Any float fixed field, widened.
    pub fn value_f64(&self, name: &str) -> f64 {
        self.try_f32(name)
            .map(f64::from)
            .or_else(|| self.try_f64(name))
            .unwrap_or_else(|| self.mismatch(name))
    }

    fn array_field(&self, name: &str) -> (&FieldSpec, usize, usize) {
        let Some(field) = self.spec.field(name) else {
            self.mismatch(name)
        };
        if !field.array {
            self.mismatch(name)
        }
        let (off, count) = self.arrays[field.array_index];
        (field, off, count)
    }

    /// Element count of an array field.
    pub fn array_len(&self, name: &str) -> usize {
        self.array_field(name).2
    }

    /// Raw packed bytes of an array field.
    pub fn array_bytes(&self, name: &str) -> &[u8] {
        let (field, off, count) = self.array_field(name);
        &self.payload[off..off + count * field.ty.width()]
    }

    /// A u32 array field, decoded.
    pub fn array_u32(&self, name: &str) -> Vec<u32> {
        let (field, off, count) = self.array_field(name);
        if field.ty != FieldType::U32 {
            self.mismatch(name)
        }
        (0..count)
            .map(|i| {
                u32::from_le_bytes(
                    self.payload[off + i * 4..off + i * 4 + 4].try_into().unwrap(),
                )
            })
            .collect()
    }

    /// A u8 array field viewed as utf-8 text.
    pub fn str_field(&self, name: &str) -> &str {
        let (field, off, count) = self.array_field(name);
        if field.ty != FieldType::U8 {
            self.mismatch(name)
        }
        match std::str::from_utf8(&self.payload[off..off + count]) {
            Ok(s) => s,
            Err(_) => self.mismatch(name),
        }
    }
}

/// The scoped edit an analyzer mutates providers through while handling
/// one event. Holding this means holding the session write lock.
pub struct SessionEdit<'a> {
    pub providers: &'a mut ProviderSet,
    pub defs: &'a DefinitionTable,
}

/// Route registration surface handed to analyzers at session start.
pub struct RouteRegistrar<'a> {
    table: &'a mut RouteTable,
    analyzer: usize,
}

impl RouteRegistrar<'_> {
    /// Subscribe the registering analyzer to (logger, event). The same
    /// pair always yields the same route id, no matter who asks or in
    /// what order.
    pub fn route(&mut self, logger: &str, event: &str) -> RouteId {
        let key = (logger.to_string(), event.to_string());
        let id = match self.table.ids.get(&key) {
            Some(id) => *id,
            None => {
                let id = self.table.subscribers.len();
                self.table.ids.insert(key, id);
                self.table.subscribers.push(Vec::new());
                id
            }
        };
        let subs = &mut self.table.subscribers[id];
        if !subs.contains(&self.analyzer) {
            subs.push(self.analyzer);
        }
        id
    }
}

#[derive(Default)]
struct RouteTable {
    ids: HashMap<(String, String), RouteId>,
    subscribers: Vec<Vec<usize>>,
}

impl RouteTable {
    fn route_for(&self, logger: &str, event: &str) -> Option<RouteId> {
        self.ids.get(&(logger.to_string(), event.to_string())).copied()
    }
}

/// A pluggable event consumer.
pub trait Analyzer: Send {
    fn name(&self) -> &'static str;

    /// Declare event routes. Called once, before any event is dispatched.
    fn on_analysis_begin(&mut self, routes: &mut RouteRegistrar<'_>);

    /// Handle one event on a route this analyzer subscribed to.
    fn on_event(&mut self, route: RouteId, event: &EventContext<'_>, edit: &mut SessionEdit<'_>);

    /// Called once after the source is exhausted.
    fn on_analysis_end(&mut self, _edit: &mut SessionEdit<'_>) {}
}

/// Summary of one processed trace.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisStats {
    pub events: u64,
    pub declarations: usize,
    pub definitions: usize,
}

/// Cloneable read handle over a session's providers and definitions,
/// safe to use from other threads while the session dispatches.
#[derive(Clone)]
pub struct SessionHandle {
    providers: Arc<RwLock<ProviderSet>>,
    defs: Arc<DefinitionTable>,
}

impl SessionHandle {
    /// Run `f` under the session read lock.
    pub fn read<R>(&self, f: impl FnOnce(&ProviderSet) -> R) -> R {
        let guard = self.providers.read().unwrap();
        f(&guard)
    }

    pub fn definitions(&self) -> &DefinitionTable {
        &self.defs
    }
}

/// The scope owning analyzers, routes, schemas, definitions, and
/// providers for one trace being decoded.
pub struct AnalysisSession {
    analyzers: Vec<Box<dyn Analyzer>>,
    routes: RouteTable,
    schemas: SchemaRegistry,

    // uid -> route id resolved at declaration time; None if no analyzer
    // subscribed to that (logger, event).
    uid_routes: HashMap<u16, Option<RouteId>>,

    defs: Arc<DefinitionTable>,
    providers: Arc<RwLock<ProviderSet>>,
    started: bool,
    events: u64,
}

impl AnalysisSession {
    pub fn new() -> Self {
        AnalysisSession {
            analyzers: Vec::new(),
            routes: RouteTable::default(),
            schemas: SchemaRegistry::new(),
            uid_routes: HashMap::new(),
            defs: Arc::new(DefinitionTable::new()),
            providers: Arc::new(RwLock::new(ProviderSet::default())),
            started: false,
            events: 0,
        }
    }

    /// Hand an analyzer to the session. Must happen before processing
    /// starts; route ids are assigned at start and never change after.
    pub fn add_analyzer(&mut self, analyzer: Box<dyn Analyzer>) {
        assert!(!self.started, "analyzers must be added before processing");
        self.analyzers.push(analyzer);
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            providers: Arc::clone(&self.providers),
            defs: Arc::clone(&self.defs),
        }
    }

    pub fn definitions(&self) -> &DefinitionTable {
        &self.defs
    }

    /// Run `f` under the session read lock.
    pub fn read<R>(&self, f: impl FnOnce(&ProviderSet) -> R) -> R {
        let guard = self.providers.read().unwrap();
        f(&guard)
    }

    fn begin(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        for (idx, analyzer) in self.analyzers.iter_mut().enumerate() {
            let mut registrar = RouteRegistrar {
                table: &mut self.routes,
                analyzer: idx,
            };
            analyzer.on_analysis_begin(&mut registrar);
            debug!("analyzer {} registered", analyzer.name());
        }
    }

    /// Pump the transport to exhaustion, dispatching every decoded event.
    pub fn process(&mut self, transport: &mut Transport) -> Result<AnalysisStats> {
        self.begin();
        loop {
            let more = transport.update();
            self.drain(transport)?;
            if !more {
                break;
            }
        }

        let providers = Arc::clone(&self.providers);
        let mut guard = providers.write().unwrap();
        let mut edit = SessionEdit {
            providers: &mut *guard,
            defs: &self.defs,
        };
        for analyzer in &mut self.analyzers {
            analyzer.on_analysis_end(&mut edit);
        }
        drop(guard);

        Ok(self.stats())
    }

    /// Consume one pump's worth of newly available events, without
    /// waiting for the source to finish. Used by live-follow callers.
    pub fn process_available(&mut self, transport: &mut Transport) -> Result<bool> {
        self.begin();
        let more = transport.update();
        self.drain(transport)?;
        Ok(more)
    }

    pub fn stats(&self) -> AnalysisStats {
        AnalysisStats {
            events: self.events,
            declarations: self.schemas.len(),
            definitions: self.defs.len(),
        }
    }

    /// Drain complete events from every thread stream. The control
    /// thread goes first so declarations land before any event that
    /// needs them.
    fn drain(&mut self, transport: &mut Transport) -> Result<()> {
        if let Some(stream) = transport.stream_mut(CONTROL_THREAD_ID) {
            self.drain_stream(stream)?;
        }
        for tid in transport.thread_ids() {
            if tid == CONTROL_THREAD_ID {
                continue;
            }
            if let Some(stream) = transport.stream_mut(tid) {
                self.drain_stream(stream)?;
            }
        }
        Ok(())
    }

    fn drain_stream(&mut self, stream: &mut ThreadStream) -> Result<()> {
        loop {
            let buf = stream.as_slice();
            if buf.len() < EVENT_HEADER_SIZE {
                return Ok(());
            }
            let uid = u16::from_le_bytes([buf[0], buf[1]]);
            let size = u16::from_le_bytes([buf[2], buf[3]]) as usize;
            let ts = u64::from_le_bytes(buf[4..12].try_into().unwrap());
            let total = EVENT_HEADER_SIZE + size;
            if buf.len() < total {
                // Partial event; wait for the rest.
                return Ok(());
            }
            let payload = &buf[EVENT_HEADER_SIZE..total];

            if uid == NEW_EVENT_UID {
                let spec = EventSpec::from_declaration(payload)?;
                let route = self.routes.route_for(&spec.logger, &spec.name);
                debug!(
                    "declared {}.{} as uid {} (routed: {})",
                    spec.logger,
                    spec.name,
                    spec.uid,
                    route.is_some()
                );
                self.uid_routes.insert(spec.uid, route);
                self.schemas.declare(spec)?;
                stream.advance(total);
                continue;
            }

            let Some(spec) = self.schemas.get(uid).cloned() else {
                // Producer and analyzer schema out of sync; not a
                // recoverable runtime condition.
                panic!("event uid {uid} used before declaration");
            };
            if let Some(route) = self.uid_routes.get(&uid).copied().flatten() {
                let ctx = EventContext::new(&spec, payload, ts)?;
                self.dispatch(route, &ctx);
            }
            self.events += 1;
            stream.advance(total);
        }
    }

    /// Dispatch one event to every subscriber of its route, inside a
    /// single scoped edit.
    fn dispatch(&mut self, route: RouteId, ctx: &EventContext<'_>) {
        let subscribers = self.routes.subscribers[route].clone();
        let mut guard = self.providers.write().unwrap();
        let mut edit = SessionEdit {
            providers: &mut *guard,
            defs: &self.defs,
        };
        for idx in subscribers {
            self.analyzers[idx].on_event(route, ctx, &mut edit);
        }
    }
}

impl Default for AnalysisSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BufferReader;
    use crate::trace::writer::{FieldValue, TraceWriter};

    struct CountingAnalyzer {
        route: Option<RouteId>,
        seen: Vec<u64>,
    }

    impl CountingAnalyzer {
        fn new() -> Self {
            CountingAnalyzer {
                route: None,
                seen: Vec::new(),
            }
        }
    }

    impl Analyzer for CountingAnalyzer {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn on_analysis_begin(&mut self, routes: &mut RouteRegistrar<'_>) {
            // Registering the same pair twice must hand back one id.
            let a = routes.route("demo", "tick");
            let b = routes.route("demo", "tick");
            assert_eq!(a, b);
            self.route = Some(a);
        }

        fn on_event(&mut self, route: RouteId, event: &EventContext<'_>, _edit: &mut SessionEdit<'_>) {
            assert_eq!(Some(route), self.route);
            self.seen.push(event.time());
        }
    }

    fn tick_spec() -> EventSpec {
        EventSpec::new(1, "demo", "tick", &[("seq", FieldType::U32, false)])
    }

    fn transport_over(bytes: Vec<u8>, chunk: usize) -> Transport {
        Transport::new(Box::new(BufferReader::with_chunk(bytes, chunk)))
    }

    #[test]
    fn test_events_dispatched_in_stream_order() {
        let spec = tick_spec();
        let mut writer = TraceWriter::new();
        writer.declare(&spec);
        for seq in 0..5u32 {
            writer
                .write_event(3, &spec, 100 + seq as u64, &[FieldValue::U32(seq)])
                .unwrap();
        }

        let mut session = AnalysisSession::new();
        session.add_analyzer(Box::new(CountingAnalyzer::new()));
        let mut transport = transport_over(writer.into_bytes().to_vec(), 1);
        let stats = session.process(&mut transport).unwrap();

        assert_eq!(stats.events, 5);
        assert_eq!(stats.declarations, 1);
    }

    #[test]
    fn test_declaration_on_control_thread_precedes_use() {
        // The tick events travel on thread 9; the declaration travels on
        // the control thread and lands inside the same pump. Processing
        // must still resolve it first.
        let spec = tick_spec();
        let mut writer = TraceWriter::new();
        writer.declare(&spec);
        writer
            .write_event(9, &spec, 1, &[FieldValue::U32(0)])
            .unwrap();

        let mut session = AnalysisSession::new();
        session.add_analyzer(Box::new(CountingAnalyzer::new()));
        let mut transport = transport_over(writer.into_bytes().to_vec(), usize::MAX);
        let stats = session.process(&mut transport).unwrap();
        assert_eq!(stats.events, 1);
    }

    #[test]
    fn test_unrouted_events_are_counted_but_not_dispatched() {
        let spec = EventSpec::new(2, "demo", "ignored", &[]);
        let mut writer = TraceWriter::new();
        writer.declare(&spec);
        writer.write_event(4, &spec, 7, &[]).unwrap();

        let mut session = AnalysisSession::new();
        session.add_analyzer(Box::new(CountingAnalyzer::new()));
        let mut transport = transport_over(writer.into_bytes().to_vec(), usize::MAX);
        let stats = session.process(&mut transport).unwrap();
        assert_eq!(stats.events, 1);
    }

    #[test]
    #[should_panic(expected = "used before declaration")]
    fn test_undeclared_uid_is_fatal() {
        // Hand-built event on a non-control thread with no declaration.
        let mut wire = Vec::new();
        let mut event = Vec::new();
        event.extend_from_slice(&42u16.to_le_bytes());
        event.extend_from_slice(&0u16.to_le_bytes());
        event.extend_from_slice(&0u64.to_le_bytes());
        wire.extend_from_slice(&5u16.to_le_bytes());
        wire.extend_from_slice(&(event.len() as u16).to_le_bytes());
        wire.extend_from_slice(&event);

        let mut session = AnalysisSession::new();
        let mut transport = transport_over(wire, usize::MAX);
        let _ = session.process(&mut transport);
    }

    #[test]
    fn test_context_rejects_truncated_payload() {
        let spec = tick_spec();
        assert!(EventContext::new(&spec, &[1, 2], 0).is_err());
        assert!(EventContext::new(&spec, &[1, 2, 3, 4, 5], 0).is_err());
        assert!(EventContext::new(&spec, &[1, 2, 3, 4], 0).is_ok());
    }

    #[test]
    #[should_panic(expected = "schema mismatch")]
    fn test_wrong_typed_access_panics() {
        let spec = tick_spec();
        let payload = 5u32.to_le_bytes();
        let ctx = EventContext::new(&spec, &payload, 0).unwrap();
        let _ = ctx.u64("seq");
    }

    #[test]
    fn test_array_views() {
        let spec = EventSpec::new(
            3,
            "demo",
            "blob",
            &[
                ("kind", FieldType::U8, false),
                ("data", FieldType::U8, true),
                ("ids", FieldType::U32, true),
            ],
        );
        let mut writer = TraceWriter::new();
        writer.declare(&spec);
        writer
            .write_event(
                2,
                &spec,
                9,
                &[
                    FieldValue::U8(1),
                    FieldValue::Bytes(b"hello"),
                    FieldValue::U32s(&[10, 20]),
                ],
            )
            .unwrap();

        struct BlobAnalyzer;
        impl Analyzer for BlobAnalyzer {
            fn name(&self) -> &'static str {
                "blob"
            }
            fn on_analysis_begin(&mut self, routes: &mut RouteRegistrar<'_>) {
                routes.route("demo", "blob");
            }
            fn on_event(
                &mut self,
                _route: RouteId,
                event: &EventContext<'_>,
                _edit: &mut SessionEdit<'_>,
            ) {
                assert_eq!(event.u8("kind"), 1);
                assert_eq!(event.str_field("data"), "hello");
                assert_eq!(event.array_len("data"), 5);
                assert_eq!(event.array_u32("ids"), vec![10, 20]);
                assert_eq!(event.time(), 9);
            }
        }

        let mut session = AnalysisSession::new();
        session.add_analyzer(Box::new(BlobAnalyzer));
        let mut transport = transport_over(writer.into_bytes().to_vec(), 3);
        let stats = session.process(&mut transport).unwrap();
        assert_eq!(stats.events, 1);
    }
}
