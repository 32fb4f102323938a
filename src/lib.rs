//! Tracehub library - trace transport, recording, and analysis.
//!
//! This library provides the pieces the `tracehub` binary composes: a
//! wire transport that demultiplexes packet-framed trace streams, a
//! network recorder that captures producer connections to a trace store,
//! a control-plane server over that store, and an analysis framework
//! that decodes recorded event streams into queryable providers.
//!
//! # Modules
//!
//! - [`codec`] - LZ4 block compression for trace payloads
//! - [`stream`] - byte sources (tail-following file reader, buffers)
//! - [`transport`] - tid-keyed packet demultiplexer
//! - [`store`] - on-disk trace catalog
//! - [`recorder`] - async network recorder
//! - [`server`] - control-plane TCP service
//! - [`trace`] - shared wire protocol types
//! - [`analysis`] - analyzer framework and built-in providers
//!
//! # Example
//!
//! ```no_run
//! use tracehub::analysis::{analyzers::standard_analyzers, AnalysisSession};
//! use tracehub::stream::FileStreamReader;
//! use tracehub::transport::Transport;
//!
//! let reader = FileStreamReader::open("./traces/live.trace");
//! let mut transport = Transport::new(Box::new(reader));
//! let mut session = AnalysisSession::new();
//! for analyzer in standard_analyzers() {
//!     session.add_analyzer(analyzer);
//! }
//! let stats = session.process(&mut transport).expect("decode failed");
//! println!("{} events", stats.events);
//! ```

pub mod analysis;
pub mod codec;
pub mod recorder;
pub mod server;
pub mod store;
pub mod stream;
pub mod trace;
pub mod transport;

// Re-export for convenience
pub use analysis::{AnalysisSession, Analyzer, EventContext, RouteId, SessionHandle};
pub use recorder::{Recorder, RecorderStatus};
pub use server::StoreService;
pub use store::{StoreError, TraceEntry, TraceStore};
pub use transport::Transport;
