//! Event schema definitions shared between the producer-side writer and
//! the analysis decoder.
//!
//! An event type is declared once on the wire (logger name, event name,
//! field list) and referenced by a compact uid afterwards. Fixed-width
//! fields are packed in declaration order at the head of an event
//! payload; array fields follow as `u16 element_count` plus packed
//! elements, also in declaration order.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::trace::constants::NEW_EVENT_UID;

/// Scalar element types carried by event fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

/// High bit of a wire type code marks an array of the element type.
const ARRAY_FLAG: u8 = 0x80;

impl FieldType {
    /// Width in bytes of one element of this type.
    pub fn width(self) -> usize {
        match self {
            FieldType::U8 => 1,
            FieldType::U16 => 2,
            FieldType::U32 => 4,
            FieldType::U64 => 8,
            FieldType::F32 => 4,
            FieldType::F64 => 8,
        }
    }

    fn code(self) -> u8 {
        match self {
            FieldType::U8 => 1,
            FieldType::U16 => 2,
            FieldType::U32 => 3,
            FieldType::U64 => 4,
            FieldType::F32 => 5,
            FieldType::F64 => 6,
        }
    }

    fn from_code(code: u8) -> Option<FieldType> {
        match code {
            1 => Some(FieldType::U8),
            2 => Some(FieldType::U16),
            3 => Some(FieldType::U32),
            4 => Some(FieldType::U64),
            5 => Some(FieldType::F32),
            6 => Some(FieldType::F64),
            _ => None,
        }
    }
}

/// One declared field of an event type.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub array: bool,

    // Byte offset inside the fixed section (fixed fields only).
    pub offset: usize,

    // Ordinal among this event's array fields (array fields only).
    pub array_index: usize,
}

/// A declared event type: (logger, name) plus its field layout.
#[derive(Clone, Debug)]
pub struct EventSpec {
    pub uid: u16,
    pub logger: String,
    pub name: String,
    pub fields: Vec<FieldSpec>,

    // Total width of the fixed section, precomputed at declaration time.
    pub fixed_size: usize,
}

impl EventSpec {
    /// Build a spec from a field list, assigning fixed offsets and array
    /// ordinals in declaration order.
    pub fn new(uid: u16, logger: &str, name: &str, fields: &[(&str, FieldType, bool)]) -> Self {
        let mut specs = Vec::with_capacity(fields.len());
        let mut offset = 0usize;
        let mut array_index = 0usize;
        for (fname, ty, array) in fields {
            let mut spec = FieldSpec {
                name: (*fname).to_string(),
                ty: *ty,
                array: *array,
                offset: 0,
                array_index: 0,
            };
            if *array {
                spec.array_index = array_index;
                array_index += 1;
            } else {
                spec.offset = offset;
                offset += ty.width();
            }
            specs.push(spec);
        }
        EventSpec {
            uid,
            logger: logger.to_string(),
            name: name.to_string(),
            fields: specs,
            fixed_size: offset,
        }
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Encode this spec as the payload of a declaration event.
    pub fn declaration_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.push(self.logger.len() as u8);
        out.push(self.name.len() as u8);
        out.push(self.fields.len() as u8);
        out.extend_from_slice(self.logger.as_bytes());
        out.extend_from_slice(self.name.as_bytes());
        for field in &self.fields {
            out.push(field.name.len() as u8);
            let mut code = field.ty.code();
            if field.array {
                code |= ARRAY_FLAG;
            }
            out.push(code);
            out.extend_from_slice(field.name.as_bytes());
        }
        out
    }

    /// Decode a declaration payload back into a spec.
    pub fn from_declaration(payload: &[u8]) -> Result<EventSpec> {
        if payload.len() < 5 {
            bail!("truncated event declaration ({} bytes)", payload.len());
        }
        let uid = u16::from_le_bytes([payload[0], payload[1]]);
        if uid == NEW_EVENT_UID {
            bail!("event declaration redeclares the reserved uid");
        }
        let logger_len = payload[2] as usize;
        let name_len = payload[3] as usize;
        let field_count = payload[4] as usize;
        let mut pos = 5;

        let logger = take_str(payload, &mut pos, logger_len)?;
        let name = take_str(payload, &mut pos, name_len)?;

        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            if pos + 2 > payload.len() {
                bail!("truncated field header in declaration of {logger}.{name}");
            }
            let fname_len = payload[pos] as usize;
            let code = payload[pos + 1];
            pos += 2;
            let fname = take_str(payload, &mut pos, fname_len)?;
            let Some(ty) = FieldType::from_code(code & !ARRAY_FLAG) else {
                bail!("unknown field type code {code:#x} in declaration of {logger}.{name}");
            };
            fields.push((fname, ty, code & ARRAY_FLAG != 0));
        }

        let field_refs: Vec<(&str, FieldType, bool)> = fields
            .iter()
            .map(|(n, t, a)| (n.as_str(), *t, *a))
            .collect();
        Ok(EventSpec::new(uid, &logger, &name, &field_refs))
    }
}

fn take_str(payload: &[u8], pos: &mut usize, len: usize) -> Result<String> {
    if *pos + len > payload.len() {
        bail!("truncated string in event declaration");
    }
    let s = std::str::from_utf8(&payload[*pos..*pos + len])?.to_string();
    *pos += len;
    Ok(s)
}

/// Session-wide registry of declared event types, keyed by uid.
#[derive(Default)]
pub struct SchemaRegistry {
    specs: HashMap<u16, Arc<EventSpec>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a declaration. Redeclaring a uid with a different
    /// (logger, name) pair is a producer bug; an identical redeclaration
    /// is ignored.
    pub fn declare(&mut self, spec: EventSpec) -> Result<()> {
        if let Some(existing) = self.specs.get(&spec.uid) {
            if existing.logger != spec.logger || existing.name != spec.name {
                bail!(
                    "event uid {} redeclared as {}.{} (was {}.{})",
                    spec.uid,
                    spec.logger,
                    spec.name,
                    existing.logger,
                    existing.name
                );
            }
            return Ok(());
        }
        self.specs.insert(spec.uid, Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, uid: u16) -> Option<&Arc<EventSpec>> {
        self.specs.get(&uid)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> EventSpec {
        EventSpec::new(
            7,
            "counters",
            "sample",
            &[
                ("id", FieldType::U32, false),
                ("value", FieldType::F64, false),
                ("tags", FieldType::U8, true),
            ],
        )
    }

    #[test]
    fn test_fixed_offsets_in_declaration_order() {
        let spec = sample_spec();
        assert_eq!(spec.field("id").unwrap().offset, 0);
        assert_eq!(spec.field("value").unwrap().offset, 4);
        assert_eq!(spec.fixed_size, 12);
        assert_eq!(spec.field("tags").unwrap().array_index, 0);
    }

    #[test]
    fn test_declaration_round_trip() {
        let spec = sample_spec();
        let decoded = EventSpec::from_declaration(&spec.declaration_payload()).unwrap();
        assert_eq!(decoded.uid, 7);
        assert_eq!(decoded.logger, "counters");
        assert_eq!(decoded.name, "sample");
        assert_eq!(decoded.fields.len(), 3);
        assert_eq!(decoded.fixed_size, spec.fixed_size);
        assert!(decoded.field("tags").unwrap().array);
    }

    #[test]
    fn test_truncated_declaration_rejected() {
        let spec = sample_spec();
        let payload = spec.declaration_payload();
        for cut in [0, 3, payload.len() - 1] {
            assert!(EventSpec::from_declaration(&payload[..cut]).is_err());
        }
    }

    #[test]
    fn test_registry_rejects_conflicting_redeclaration() {
        let mut registry = SchemaRegistry::new();
        registry.declare(sample_spec()).unwrap();
        // Identical redeclaration is fine.
        registry.declare(sample_spec()).unwrap();

        let other = EventSpec::new(7, "log", "message", &[]);
        assert!(registry.declare(other).is_err());
        assert_eq!(registry.len(), 1);
    }
}
