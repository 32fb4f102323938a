//! Shared constants for the trace wire protocol.
//!
//! These are protocol-level values; changing any of them breaks
//! compatibility with already-recorded traces.

/// Maximum payload size of a single packet on the wire. A header carrying
/// a larger (or zero) size is malformed framing and stalls the stream.
pub const MAX_PACKET_PAYLOAD: usize = 8192;

/// Size of a packet header on the wire: u16 thread id + u16 payload size.
pub const PACKET_HEADER_SIZE: usize = 4;

/// Thread id reserved for control traffic. Event declarations travel on
/// this thread and are processed before any other thread's events.
pub const CONTROL_THREAD_ID: u16 = 0;

/// Event uid reserved for new-event declarations.
pub const NEW_EVENT_UID: u16 = 0;

/// Size of an event header within a thread stream:
/// u16 uid + u16 payload size + u64 timestamp.
pub const EVENT_HEADER_SIZE: usize = 12;

/// Size of the intermediate buffer used by a recorder relay for its
/// socket-to-file copy.
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Interval between recorder housekeeping ticks, reaping closed relays.
pub const RECORDER_TICK_MS: u64 = 500;

/// File extension for recorded traces in a store directory.
pub const TRACE_FILE_EXT: &str = "trace";
