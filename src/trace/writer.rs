//! Producer-side trace encoding.
//!
//! `TraceWriter` turns event declarations and event records into the
//! packet stream a transport connection carries. The recorder never uses
//! this (it copies bytes verbatim); it exists for tooling that has to
//! synthesize traces and for tests that need to drive the decode path
//! with known input.

use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};

use crate::trace::constants::{
    CONTROL_THREAD_ID, EVENT_HEADER_SIZE, MAX_PACKET_PAYLOAD, NEW_EVENT_UID,
};
use crate::trace::schema::{EventSpec, FieldType};

/// A value for one declared field, matched against the spec at encode
/// time.
#[derive(Clone, Copy, Debug)]
pub enum FieldValue<'a> {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bytes(&'a [u8]),
    U32s(&'a [u32]),
}

impl FieldValue<'_> {
    fn matches(&self, ty: FieldType, array: bool) -> bool {
        match self {
            FieldValue::U8(_) => ty == FieldType::U8 && !array,
            FieldValue::U16(_) => ty == FieldType::U16 && !array,
            FieldValue::U32(_) => ty == FieldType::U32 && !array,
            FieldValue::U64(_) => ty == FieldType::U64 && !array,
            FieldValue::F32(_) => ty == FieldType::F32 && !array,
            FieldValue::F64(_) => ty == FieldType::F64 && !array,
            FieldValue::Bytes(_) => ty == FieldType::U8 && array,
            FieldValue::U32s(_) => ty == FieldType::U32 && array,
        }
    }
}

/// Encodes declarations and events into a framed packet stream.
pub struct TraceWriter {
    out: BytesMut,
    max_payload: usize,
}

impl TraceWriter {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PACKET_PAYLOAD)
    }

    /// A writer that caps packet payloads below the protocol maximum.
    /// Small caps force events to span packets, which is exactly what the
    /// framing tests need.
    pub fn with_max_payload(max_payload: usize) -> Self {
        TraceWriter {
            out: BytesMut::new(),
            max_payload: max_payload.clamp(1, MAX_PACKET_PAYLOAD),
        }
    }

    /// Emit the declaration event for `spec` on the control thread.
    pub fn declare(&mut self, spec: &EventSpec) {
        let payload = spec.declaration_payload();
        self.emit_event(CONTROL_THREAD_ID, NEW_EVENT_UID, 0, &payload);
    }

    /// Emit one event on `thread`, checking `values` against the spec.
    pub fn write_event(
        &mut self,
        thread: u16,
        spec: &EventSpec,
        ts: u64,
        values: &[FieldValue<'_>],
    ) -> Result<()> {
        if values.len() != spec.fields.len() {
            bail!(
                "{}.{} takes {} fields, got {}",
                spec.logger,
                spec.name,
                spec.fields.len(),
                values.len()
            );
        }

        let mut payload = Vec::with_capacity(spec.fixed_size + 16);
        // Fixed section first, then arrays, both in declaration order.
        for (field, value) in spec.fields.iter().zip(values) {
            if !value.matches(field.ty, field.array) {
                bail!(
                    "field {} of {}.{} given a mismatched value",
                    field.name,
                    spec.logger,
                    spec.name
                );
            }
            match value {
                FieldValue::U8(v) => payload.push(*v),
                FieldValue::U16(v) => payload.extend_from_slice(&v.to_le_bytes()),
                FieldValue::U32(v) => payload.extend_from_slice(&v.to_le_bytes()),
                FieldValue::U64(v) => payload.extend_from_slice(&v.to_le_bytes()),
                FieldValue::F32(v) => payload.extend_from_slice(&v.to_le_bytes()),
                FieldValue::F64(v) => payload.extend_from_slice(&v.to_le_bytes()),
                FieldValue::Bytes(_) | FieldValue::U32s(_) => {}
            }
        }
        for (field, value) in spec.fields.iter().zip(values) {
            match value {
                FieldValue::Bytes(data) => {
                    if data.len() > u16::MAX as usize {
                        bail!("array field {} too large", field.name);
                    }
                    payload.extend_from_slice(&(data.len() as u16).to_le_bytes());
                    payload.extend_from_slice(data);
                }
                FieldValue::U32s(data) => {
                    if data.len() > u16::MAX as usize {
                        bail!("array field {} too large", field.name);
                    }
                    payload.extend_from_slice(&(data.len() as u16).to_le_bytes());
                    for v in *data {
                        payload.extend_from_slice(&v.to_le_bytes());
                    }
                }
                _ => {}
            }
        }

        if payload.len() > u16::MAX as usize {
            bail!("event {}.{} payload too large", spec.logger, spec.name);
        }
        self.emit_event(thread, spec.uid, ts, &payload);
        Ok(())
    }

    /// Frame one event (header + payload) and chunk it into packets for
    /// `thread`. Events are allowed to span packet boundaries.
    fn emit_event(&mut self, thread: u16, uid: u16, ts: u64, payload: &[u8]) {
        let mut event = Vec::with_capacity(EVENT_HEADER_SIZE + payload.len());
        event.extend_from_slice(&uid.to_le_bytes());
        event.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        event.extend_from_slice(&ts.to_le_bytes());
        event.extend_from_slice(payload);

        for chunk in event.chunks(self.max_payload) {
            self.out.put_u16_le(thread);
            self.out.put_u16_le(chunk.len() as u16);
            self.out.put_slice(chunk);
        }
    }

    /// The framed packet stream written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.out
    }

    pub fn into_bytes(self) -> Bytes {
        self.out.freeze()
    }
}

impl Default for TraceWriter {
    fn default() -> Self {
        Self::new()
    }
}
