//! Metadata table: per-stream schema definitions for event kinds.
//!
//! A metadata record names a provider, a task, a numeric event id, an
//! ordered parameter schema, and an open tag list of optional
//! attributes.  Records, parameter descriptors, and tags all carry
//! their own byte length; the parser consumes the declared length even
//! when it recognises only a prefix, which is how files written by
//! newer producers stay readable.
//!
//! A given id may be defined at most once.  The id-space can be reset
//! wholesale by a sequence point, after which ids may be reused.
//!
//! The oldest revision keys records by (provider GUID, event id)
//! instead of a numeric id; this table synthesizes stream-local ids for
//! those so every generation shares one lookup path.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

use crate::codec::SliceCursor;
use crate::error::{Result, TraceError};
use crate::header::FormatGeneration;
use crate::payload::MetadataType;

// Optional-metadata tag codes.
const TAG_OPCODE: u8 = 1;
const TAG_KEYWORDS: u8 = 2;
const TAG_LEVEL: u8 = 3;
const TAG_VERSION: u8 = 4;
const TAG_MESSAGE_TEMPLATE: u8 = 5;
const TAG_DESCRIPTION: u8 = 6;
const TAG_PROVIDER_GUID: u8 = 7;
const TAG_ATTRIBUTE: u8 = 8;

/// One named, typed event parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventParameter {
    pub name: String,
    pub ty: MetadataType,
}

/// The schema definition for one event kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventMetadata {
    pub id: u32,
    pub provider_name: String,
    /// Base event name; the effective name is derived from this and the
    /// effective opcode (see [`derive_event_name`]).
    pub task_name: String,
    pub event_id: u64,
    pub parameters: Vec<EventParameter>,
    pub opcode: u8,
    pub keywords: u64,
    pub level: u8,
    pub version: u8,
    pub provider_guid: Option<Uuid>,
    pub message_template: Option<String>,
    pub description: Option<String>,
    pub attributes: Vec<(String, String)>,
}

/// Conventional opcode names used in event-name derivation.
pub fn opcode_name(opcode: u8) -> String {
    match opcode {
        1 => "Start".into(),
        2 => "Stop".into(),
        7 => "Resume".into(),
        8 => "Suspend".into(),
        9 => "Send".into(),
        other => format!("Opcode{other}"),
    }
}

/// Derive the displayed event name from a task name and an effective
/// opcode.
///
/// Opcode 0 suppresses the suffix entirely.  A task name that already
/// ends with the opcode's conventional name is not re-suffixed, so a
/// task "RequestStop" with the Stop opcode stays "RequestStop" rather
/// than becoming "RequestStop/Stop".
pub fn derive_event_name(task_name: &str, opcode: u8) -> String {
    if opcode == 0 {
        return task_name.to_owned();
    }
    let suffix = opcode_name(opcode);
    if task_name.ends_with(&suffix) {
        task_name.to_owned()
    } else {
        format!("{task_name}/{suffix}")
    }
}

/// Per-stream metadata id table.
#[derive(Debug, Default)]
pub struct MetadataTable {
    entries: HashMap<u32, Arc<EventMetadata>>,
    /// (provider GUID, event id) → synthetic id, legacy generation only.
    legacy_ids: HashMap<(Uuid, u64), u32>,
    next_legacy_id: u32,
}

impl MetadataTable {
    pub fn new() -> Self {
        Self { entries: HashMap::new(), legacy_ids: HashMap::new(), next_legacy_id: 1 }
    }

    /// Insert a definition.  Redefining an id that is currently defined
    /// is a protocol error unless the id-space was reset in between.
    pub fn define(&mut self, meta: EventMetadata) -> Result<()> {
        let id = meta.id;
        if self.entries.contains_key(&id) {
            return Err(TraceError::protocol(format!(
                "metadata id {id} redefined without a reset"
            )));
        }
        self.entries.insert(id, Arc::new(meta));
        Ok(())
    }

    /// Bulk-invalidate the id-space (requested by a sequence point).
    pub fn reset(&mut self) {
        trace!(entries = self.entries.len(), "metadata id-space reset");
        self.entries.clear();
        self.legacy_ids.clear();
    }

    pub fn resolve(&self, id: u32) -> Result<&Arc<EventMetadata>> {
        self.entries.get(&id).ok_or_else(|| {
            TraceError::protocol(format!("event references undefined metadata id {id}"))
        })
    }

    /// Resolve a legacy (provider GUID, event id) event reference.
    pub fn resolve_legacy(&self, guid: Uuid, event_id: u64) -> Result<&Arc<EventMetadata>> {
        let id = self.legacy_ids.get(&(guid, event_id)).ok_or_else(|| {
            TraceError::protocol(format!(
                "event references undefined metadata ({guid}, {event_id})"
            ))
        })?;
        self.resolve(*id)
    }

    /// Parse a metadata block body: length-prefixed records until the
    /// body is exhausted.
    pub fn process_block(&mut self, body: &[u8], generation: FormatGeneration) -> Result<()> {
        let mut cur = SliceCursor::new(body);
        while !cur.is_empty() {
            let record_len = cur.u32()? as usize;
            let record_end = cur
                .pos()
                .checked_add(record_len)
                .ok_or_else(|| TraceError::corrupt("metadata record length overflows"))?;

            let meta = self.parse_record(&mut cur, record_end, generation)?;
            self.define(meta)?;

            // Trailing record bytes belong to a newer writer.
            cur.seek_to(record_end)?;
        }
        Ok(())
    }

    fn parse_record(
        &mut self,
        cur: &mut SliceCursor<'_>,
        record_end: usize,
        generation: FormatGeneration,
    ) -> Result<EventMetadata> {
        let (id, legacy_key, event_id_pre) = if generation.guid_keyed_metadata() {
            let guid = cur.guid()?;
            let event_id = cur.varuint()?;
            let key = (guid, event_id);
            if self.legacy_ids.contains_key(&key) {
                return Err(TraceError::protocol(format!(
                    "metadata ({guid}, {event_id}) redefined without a reset"
                )));
            }
            let id = self.next_legacy_id;
            self.next_legacy_id += 1;
            (id, Some(key), Some(event_id))
        } else {
            let id = cur.varuint()?;
            let id = u32::try_from(id)
                .map_err(|_| TraceError::corrupt("metadata id exceeds u32"))?;
            (id, None, None)
        };

        let provider_name = cur.utf16_string()?;
        let task_name = cur.utf16_string()?;
        let event_id = match event_id_pre {
            Some(e) => e,
            None => cur.varuint()?,
        };

        let param_count = cur.varuint()? as usize;
        let mut parameters = Vec::with_capacity(param_count.min(256));
        for _ in 0..param_count {
            let desc_len = cur.u32()? as usize;
            let desc_end = cur
                .pos()
                .checked_add(desc_len)
                .ok_or_else(|| TraceError::corrupt("parameter length overflows"))?;
            let name = cur.utf16_string()?;
            let ty = MetadataType::parse(cur)?;
            parameters.push(EventParameter { name, ty });
            cur.seek_to(desc_end)?;
        }

        let mut meta = EventMetadata {
            id,
            provider_name,
            task_name,
            event_id,
            parameters,
            opcode: 0,
            keywords: 0,
            level: 0,
            version: 0,
            provider_guid: legacy_key.map(|(g, _)| g),
            message_template: None,
            description: None,
            attributes: Vec::new(),
        };

        // Optional-metadata tag list runs to the record's declared end.
        while cur.pos() < record_end {
            let tag_len = cur.u32()? as usize;
            let tag_end = cur
                .pos()
                .checked_add(tag_len)
                .ok_or_else(|| TraceError::corrupt("metadata tag length overflows"))?;
            if tag_end > record_end {
                return Err(TraceError::corrupt(
                    "metadata tag extends past its record",
                ));
            }
            let tag = cur.u8()?;
            match tag {
                TAG_OPCODE => meta.opcode = cur.u8()?,
                TAG_KEYWORDS => meta.keywords = cur.u64()?,
                TAG_LEVEL => meta.level = cur.u8()?,
                TAG_VERSION => meta.version = cur.u8()?,
                TAG_MESSAGE_TEMPLATE => meta.message_template = Some(cur.utf16_string()?),
                TAG_DESCRIPTION => meta.description = Some(cur.utf16_string()?),
                TAG_PROVIDER_GUID => meta.provider_guid = Some(cur.guid()?),
                TAG_ATTRIBUTE => {
                    let key = cur.utf16_string()?;
                    let value = cur.utf16_string()?;
                    meta.attributes.push((key, value));
                }
                unknown => {
                    trace!(tag = unknown, len = tag_len, "skipping unknown metadata tag");
                }
            }
            cur.seek_to(tag_end)?;
        }

        if let Some(key) = legacy_key {
            self.legacy_ids.insert(key, id);
        }
        Ok(meta)
    }
}
