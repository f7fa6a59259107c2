//! Label lists: per-event metadata overrides (newer revisions only).
//!
//! A label list is a flyweight — defined once, attached by id to any
//! number of events — that overrides correlation ids or selected
//! metadata fields (opcode, keywords, level, version) for a single
//! occurrence without mutating the shared metadata record.
//!
//! On the wire a list is an ordered run of tagged labels; the high bit
//! of the tag byte marks the final label, so no count is stored.  An
//! unknown tag has no self-describing length, so the parser keeps the
//! labels read so far and skips to the record's declared end — the
//! per-record analogue of unknown-block skipping.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

use crate::codec::SliceCursor;
use crate::error::{Result, TraceError};

const LABEL_ACTIVITY_ID: u8 = 1;
const LABEL_RELATED_ACTIVITY_ID: u8 = 2;
const LABEL_TRACE_ID: u8 = 3;
const LABEL_SPAN_ID: u8 = 4;
const LABEL_NAME_VALUE_STRING: u8 = 5;
const LABEL_NAME_VALUE_VARINT: u8 = 6;
const LABEL_OPCODE: u8 = 7;
const LABEL_KEYWORDS: u8 = 8;
const LABEL_LEVEL: u8 = 9;
const LABEL_VERSION: u8 = 10;

/// Marks the final label in a list.
const LABEL_LAST: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Label {
    ActivityId(Uuid),
    RelatedActivityId(Uuid),
    TraceId([u8; 16]),
    SpanId(u64),
    NameValueString(String, String),
    NameValueVarInt(String, i64),
    OpCode(u8),
    Keywords(u64),
    Level(u8),
    Version(u8),
}

/// An ordered label list, addressed by a per-stream id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelList {
    pub id: u32,
    pub labels: Vec<Label>,
}

/// Per-stream label list table.  Id 0 is reserved to mean "no list".
#[derive(Debug, Default)]
pub struct LabelTable {
    lists: HashMap<u32, Arc<LabelList>>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` for id 0; a protocol error for any other id not defined
    /// in the stream.
    pub fn resolve(&self, id: u32) -> Result<Option<&Arc<LabelList>>> {
        if id == 0 {
            return Ok(None);
        }
        self.lists
            .get(&id)
            .map(Some)
            .ok_or_else(|| {
                TraceError::protocol(format!("event references undefined label list {id}"))
            })
    }

    /// Parse a label list block body.  A new list with an existing id
    /// replaces the old list wholesale.
    pub fn process_block(&mut self, body: &[u8]) -> Result<()> {
        let mut cur = SliceCursor::new(body);
        while !cur.is_empty() {
            let record_len = cur.u32()? as usize;
            let record_end = cur
                .pos()
                .checked_add(record_len)
                .ok_or_else(|| TraceError::corrupt("label record length overflows"))?;

            let id = cur.varuint()?;
            let id = u32::try_from(id)
                .map_err(|_| TraceError::corrupt("label list id exceeds u32"))?;
            if id == 0 {
                return Err(TraceError::corrupt("label list id 0 is reserved"));
            }

            let labels = parse_labels(&mut cur, record_end)?;
            self.lists.insert(id, Arc::new(LabelList { id, labels }));
            cur.seek_to(record_end)?;
        }
        Ok(())
    }
}

fn parse_labels(cur: &mut SliceCursor<'_>, record_end: usize) -> Result<Vec<Label>> {
    let mut labels = Vec::new();
    loop {
        if cur.pos() >= record_end {
            return Err(TraceError::corrupt("label list not terminated"));
        }
        let tag = cur.u8()?;
        let last = tag & LABEL_LAST != 0;
        let label = match tag & !LABEL_LAST {
            LABEL_ACTIVITY_ID => Label::ActivityId(cur.guid()?),
            LABEL_RELATED_ACTIVITY_ID => Label::RelatedActivityId(cur.guid()?),
            LABEL_TRACE_ID => Label::TraceId(cur.bytes(16)?.try_into().unwrap()),
            LABEL_SPAN_ID => Label::SpanId(cur.u64()?),
            LABEL_NAME_VALUE_STRING => {
                let name = cur.utf16_string()?;
                let value = cur.utf16_string()?;
                Label::NameValueString(name, value)
            }
            LABEL_NAME_VALUE_VARINT => {
                let name = cur.utf16_string()?;
                let value = cur.varint()?;
                Label::NameValueVarInt(name, value)
            }
            LABEL_OPCODE => Label::OpCode(cur.u8()?),
            LABEL_KEYWORDS => Label::Keywords(cur.u64()?),
            LABEL_LEVEL => Label::Level(cur.u8()?),
            LABEL_VERSION => Label::Version(cur.u8()?),
            unknown => {
                // No per-label length to follow; keep the prefix we
                // understood and let the record length carry us past
                // whatever a newer writer appended.
                trace!(tag = unknown, "unknown label tag, keeping parsed prefix");
                return Ok(labels);
            }
        };
        labels.push(label);
        if last {
            return Ok(labels);
        }
    }
}
