//! Tid-keyed packet transport.
//!
//! One physical connection carries packets for many logical threads,
//! interleaved. The transport reassembles them: each `update()` pump
//! consumes every complete `{thread id, payload size, payload}` frame
//! currently available and appends the payload to that thread's stream.
//! A frame whose header or payload has not fully arrived is left
//! untouched until a later pump; downstream consumers never see a
//! partial frame.

use std::collections::BTreeMap;

use tracing::warn;

use crate::stream::StreamReader;
use crate::trace::constants::{MAX_PACKET_PAYLOAD, PACKET_HEADER_SIZE};

/// One demultiplexed logical byte channel within a transport connection.
///
/// Bytes are appended in wire arrival order and consumed front-to-back;
/// consumed bytes are never re-delivered. The backing buffer is
/// compacted once the consumed prefix dominates it.
#[derive(Default)]
pub struct ThreadStream {
    data: Vec<u8>,
    consumed: usize,
}

// Compact when at least this much has been consumed and the consumed
// prefix is more than half the buffer.
const COMPACT_THRESHOLD: usize = 4096;

impl ThreadStream {
    fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Unconsumed bytes currently buffered.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.consumed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `n` bytes consumed. Consumption is monotonic; `n` must not
    /// exceed what `as_slice` exposes.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len(), "advance past end of thread stream");
        self.consumed += n;
        if self.consumed >= COMPACT_THRESHOLD && self.consumed * 2 >= self.data.len() {
            self.data.drain(..self.consumed);
            self.consumed = 0;
        }
    }
}

/// Demultiplexes a single packet-framed byte stream into per-thread
/// streams.
pub struct Transport {
    reader: Box<dyn StreamReader>,

    // Raw wire bytes not yet parsed into complete frames.
    pending: Vec<u8>,

    // Thread registry. A drained thread stays here so later packets for
    // the same id land in the same logical channel.
    threads: BTreeMap<u16, ThreadStream>,

    exhausted: bool,
    stalled: bool,
}

// Scratch size for one pull from the underlying reader.
const READ_CHUNK: usize = 4096;

impl Transport {
    pub fn new(reader: Box<dyn StreamReader>) -> Self {
        Transport {
            reader,
            pending: Vec::new(),
            threads: BTreeMap::new(),
            exhausted: false,
            stalled: false,
        }
    }

    /// Pump the transport: pull whatever the source has, then demux every
    /// complete frame. Returns true while the source may still produce
    /// more (call again later); false once it is exhausted or the stream
    /// is stalled on malformed framing.
    pub fn update(&mut self) -> bool {
        if self.stalled {
            return false;
        }
        if !self.exhausted {
            let mut scratch = [0u8; READ_CHUNK];
            loop {
                let n = self.reader.read(&mut scratch);
                if n == 0 {
                    self.exhausted = true;
                    break;
                }
                self.pending.extend_from_slice(&scratch[..n]);
                if n < scratch.len() {
                    break;
                }
            }
        }
        self.demux();
        !self.exhausted && !self.stalled
    }

    /// Consume complete frames from the pending buffer.
    fn demux(&mut self) {
        let mut pos = 0;
        while self.pending.len() - pos >= PACKET_HEADER_SIZE {
            let header = &self.pending[pos..pos + PACKET_HEADER_SIZE];
            let thread_id = u16::from_le_bytes([header[0], header[1]]);
            let size = u16::from_le_bytes([header[2], header[3]]) as usize;

            if size == 0 || size > MAX_PACKET_PAYLOAD {
                // Malformed framing. Nothing downstream of this point can
                // be trusted, so stop consuming; the stream simply never
                // completes another frame (external liveness checks catch
                // this, we do not).
                warn!("malformed packet header for thread {thread_id}: size {size}");
                self.stalled = true;
                break;
            }
            if self.pending.len() - pos < PACKET_HEADER_SIZE + size {
                // Partial frame; held back in full until the rest arrives.
                break;
            }
            let payload = &self.pending[pos + PACKET_HEADER_SIZE..pos + PACKET_HEADER_SIZE + size];
            self.threads.entry(thread_id).or_default().append(payload);
            pos += PACKET_HEADER_SIZE + size;
        }
        if pos > 0 {
            self.pending.drain(..pos);
        }
    }

    /// Thread ids that currently have unconsumed bytes, in ascending
    /// order.
    pub fn thread_ids(&self) -> Vec<u16> {
        self.threads
            .iter()
            .filter(|(_, s)| !s.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn stream_mut(&mut self, thread_id: u16) -> Option<&mut ThreadStream> {
        self.threads.get_mut(&thread_id)
    }

    /// True once the source reported exhaustion. Buffered bytes may still
    /// be pending consumption.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// True if malformed framing permanently stalled this stream.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BufferReader;

    fn packet(thread_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        out.extend_from_slice(&thread_id.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn drain_all(transport: &mut Transport) -> BTreeMap<u16, Vec<u8>> {
        while transport.update() {}
        let mut out = BTreeMap::new();
        for id in transport.thread_ids() {
            let stream = transport.stream_mut(id).unwrap();
            let bytes = stream.as_slice().to_vec();
            stream.advance(bytes.len());
            out.insert(id, bytes);
        }
        out
    }

    fn interleaved_wire() -> Vec<u8> {
        let mut wire = Vec::new();
        wire.extend(packet(1, b"aa"));
        wire.extend(packet(2, b"BBB"));
        wire.extend(packet(1, b"ccc"));
        wire.extend(packet(3, b"d"));
        wire.extend(packet(2, b"EE"));
        wire
    }

    #[test]
    fn test_demux_preserves_per_thread_order() {
        let reader = BufferReader::new(interleaved_wire());
        let mut transport = Transport::new(Box::new(reader));
        let streams = drain_all(&mut transport);

        assert_eq!(streams[&1], b"aaccc");
        assert_eq!(streams[&2], b"BBBEE");
        assert_eq!(streams[&3], b"d");
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let wire = interleaved_wire();
        let mut whole = Transport::new(Box::new(BufferReader::new(wire.clone())));
        let mut byte_at_a_time =
            Transport::new(Box::new(BufferReader::with_chunk(wire, 1)));

        assert_eq!(drain_all(&mut whole), drain_all(&mut byte_at_a_time));
    }

    #[test]
    fn test_partial_frame_held_back() {
        let wire = packet(4, b"abcdef");
        // 7 bytes per pump: first pump sees the header plus 3 payload
        // bytes. Nothing may surface until the rest arrives.
        let mut transport =
            Transport::new(Box::new(BufferReader::with_chunk(wire, 7)));

        transport.update();
        assert!(transport.thread_ids().is_empty());

        while transport.update() {}
        assert_eq!(transport.stream_mut(4).unwrap().as_slice(), b"abcdef");
    }

    #[test]
    fn test_drained_thread_keeps_receiving() {
        let mut transport =
            Transport::new(Box::new(BufferReader::with_chunk(interleaved_wire(), 6)));

        // Drain thread 1 as soon as it has bytes, then keep pumping.
        let mut seen = Vec::new();
        loop {
            let more = transport.update();
            if let Some(stream) = transport.stream_mut(1) {
                let bytes = stream.as_slice().to_vec();
                stream.advance(bytes.len());
                seen.extend(bytes);
            }
            if !more {
                break;
            }
        }
        assert_eq!(seen, b"aaccc");
    }

    #[test]
    fn test_malformed_size_stalls_stream() {
        let mut wire = Vec::new();
        wire.extend(packet(1, b"ok"));
        // Hand-built header with a zero payload size.
        wire.extend_from_slice(&1u16.to_le_bytes());
        wire.extend_from_slice(&0u16.to_le_bytes());
        wire.extend(packet(1, b"never delivered"));

        let mut transport = Transport::new(Box::new(BufferReader::new(wire)));
        while transport.update() {}

        assert!(transport.is_stalled());
        assert_eq!(transport.stream_mut(1).unwrap().as_slice(), b"ok");
    }

    #[test]
    fn test_oversized_payload_stalls_stream() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&9u16.to_le_bytes());
        wire.extend_from_slice(&((MAX_PACKET_PAYLOAD as u16) + 1).to_le_bytes());
        wire.extend_from_slice(&[0u8; 32]);

        let mut transport = Transport::new(Box::new(BufferReader::new(wire)));
        while transport.update() {}
        assert!(transport.is_stalled());
        assert!(transport.thread_ids().is_empty());
    }

    #[test]
    fn test_thread_stream_compaction_keeps_cursor_honest() {
        let mut stream = ThreadStream::default();
        let blob = vec![0xAAu8; COMPACT_THRESHOLD];
        stream.append(&blob);
        stream.advance(COMPACT_THRESHOLD - 1);
        stream.append(b"xyz");
        stream.advance(1);
        assert_eq!(stream.as_slice(), b"xyz");
    }
}
