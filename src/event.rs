//! Event block decoding: per-event headers and the decoded event type.
//!
//! An event block holds a run of events.  Each event's header is either
//! written in full (uncompressed) or delta-encoded against the previous
//! event in the same block (compressed).  The rolling prior state is an
//! explicit [`EventHeaderState`] value threaded through the block fold
//! rather than shared mutable state, so a single event decode is
//! testable in isolation.
//!
//! Compressed deltas deliberately use wrapping arithmetic: a sequence
//! number reset still decodes correctly via modular arithmetic, and a
//! timestamp can never decode to garbage just because the counter
//! wrapped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::codec::SliceCursor;
use crate::error::{Result, TraceError};
use crate::header::FormatGeneration;
use crate::labels::{Label, LabelList};
use crate::metadata::{derive_event_name, EventMetadata};
use crate::payload::{decode_value, Value};

// Compressed header flag bits.
const FLAG_METADATA_ID: u8 = 0x01;
const FLAG_SEQUENCE: u8 = 0x02;
const FLAG_THREAD: u8 = 0x04;
const FLAG_CAPTURE_THREAD: u8 = 0x08;
const FLAG_PROCESSOR: u8 = 0x10;
const FLAG_STACK_ID: u8 = 0x20;
const FLAG_LABEL_LIST: u8 = 0x40;
const FLAG_PAYLOAD_LEN: u8 = 0x80;

/// How an event names its schema: a numeric metadata id, or — in the
/// oldest revision — a provider GUID plus raw event id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetadataRef {
    Id(u32),
    Legacy(Uuid, u64),
}

/// One event's fully resolved header fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EventHeader {
    pub metadata: MetadataRef,
    pub sequence: u32,
    pub thread_index: u64,
    pub capture_index: u64,
    pub processor: u32,
    pub stack_id: u32,
    pub timestamp_ticks: u64,
    pub label_list_id: u32,
    pub payload_len: u32,
}

/// The previous event's effective header values within one block.
/// Starts zeroed at each block boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventHeaderState {
    pub metadata_id: u32,
    pub sequence: u32,
    pub thread_index: u64,
    pub capture_index: u64,
    pub processor: u32,
    pub stack_id: u32,
    pub timestamp_ticks: u64,
    pub label_list_id: u32,
    pub payload_len: u32,
}

impl EventHeaderState {
    fn after(header: &EventHeader) -> Self {
        Self {
            metadata_id: match header.metadata {
                MetadataRef::Id(id) => id,
                MetadataRef::Legacy(..) => 0,
            },
            sequence: header.sequence,
            thread_index: header.thread_index,
            capture_index: header.capture_index,
            processor: header.processor,
            stack_id: header.stack_id,
            timestamp_ticks: header.timestamp_ticks,
            label_list_id: header.label_list_id,
            payload_len: header.payload_len,
        }
    }
}

/// Decode an uncompressed event header: every field written in full.
pub fn decode_uncompressed(
    cur: &mut SliceCursor<'_>,
    generation: FormatGeneration,
) -> Result<(EventHeader, EventHeaderState)> {
    let metadata = if generation.guid_keyed_metadata() {
        let guid = cur.guid()?;
        let event_id = cur.u32()? as u64;
        MetadataRef::Legacy(guid, event_id)
    } else {
        MetadataRef::Id(cur.u32()?)
    };

    let sequence = cur.u32()?;
    let thread_index = cur.u64()?;
    let capture_index = cur.u64()?;
    let processor = cur.u32()?;
    let stack_id = cur.u32()?;
    let timestamp_ticks = cur.u64()?;
    let label_list_id = if generation.supports_label_lists() {
        cur.u32()?
    } else {
        0
    };
    let payload_len = cur.u32()?;

    let header = EventHeader {
        metadata,
        sequence,
        thread_index,
        capture_index,
        processor,
        stack_id,
        timestamp_ticks,
        label_list_id,
        payload_len,
    };
    let state = EventHeaderState::after(&header);
    Ok((header, state))
}

// A 32-bit field whose varuint needs more than 32 bits is corruption,
// never silently truncated: a payload length reduced mod 2^32 would
// desynchronize every event after it.
fn narrow(value: u64, field: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| TraceError::corrupt(format!("{field} exceeds u32")))
}

/// Decode a compressed event header: a flag byte names the fields that
/// differ from `prev`; absent fields inherit unchanged.  The sequence
/// delta is `actual − previous − 1`, the timestamp delta is
/// `actual − previous`, both wrapping.
pub fn decode_compressed(
    cur: &mut SliceCursor<'_>,
    prev: &EventHeaderState,
    generation: FormatGeneration,
) -> Result<(EventHeader, EventHeaderState)> {
    let flags = cur.u8()?;

    let metadata_id = if flags & FLAG_METADATA_ID != 0 {
        narrow(cur.varuint()?, "metadata id")?
    } else {
        prev.metadata_id
    };

    let sequence = if flags & FLAG_SEQUENCE != 0 {
        // Sequence arithmetic is modular; the delta is reduced mod 2^32
        // rather than range-checked, matching the wrapping add below.
        let delta = cur.varuint()? as u32;
        prev.sequence.wrapping_add(delta).wrapping_add(1)
    } else {
        prev.sequence.wrapping_add(1)
    };

    let thread_index = if flags & FLAG_THREAD != 0 {
        cur.varuint()?
    } else {
        prev.thread_index
    };
    let capture_index = if flags & FLAG_CAPTURE_THREAD != 0 {
        cur.varuint()?
    } else {
        prev.capture_index
    };
    let processor = if flags & FLAG_PROCESSOR != 0 {
        narrow(cur.varuint()?, "processor index")?
    } else {
        prev.processor
    };
    let stack_id = if flags & FLAG_STACK_ID != 0 {
        narrow(cur.varuint()?, "stack id")?
    } else {
        prev.stack_id
    };

    let label_list_id = if flags & FLAG_LABEL_LIST != 0 {
        if !generation.supports_label_lists() {
            return Err(TraceError::corrupt(
                "label list reference in a revision without label lists",
            ));
        }
        narrow(cur.varuint()?, "label list id")?
    } else {
        prev.label_list_id
    };

    let payload_len = if flags & FLAG_PAYLOAD_LEN != 0 {
        narrow(cur.varuint()?, "payload length")?
    } else {
        prev.payload_len
    };

    let timestamp_ticks = prev.timestamp_ticks.wrapping_add(cur.varuint()?);

    let header = EventHeader {
        metadata: MetadataRef::Id(metadata_id),
        sequence,
        thread_index,
        capture_index,
        processor,
        stack_id,
        timestamp_ticks,
        label_list_id,
        payload_len,
    };
    let state = EventHeaderState::after(&header);
    Ok((header, state))
}

/// Effective per-event values after label overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveValues {
    pub opcode: u8,
    pub keywords: u64,
    pub level: u8,
    pub version: u8,
    pub activity_id: Option<Uuid>,
    pub related_activity_id: Option<Uuid>,
    pub trace_id: Option<[u8; 16]>,
    pub span_id: Option<u64>,
}

/// Compute the effective values for one occurrence: base values from
/// the shared metadata record, each field overridden by an attached
/// label if present.
pub fn apply_labels(meta: &EventMetadata, list: Option<&LabelList>) -> EffectiveValues {
    let mut eff = EffectiveValues {
        opcode: meta.opcode,
        keywords: meta.keywords,
        level: meta.level,
        version: meta.version,
        ..Default::default()
    };
    if let Some(list) = list {
        for label in &list.labels {
            match label {
                Label::ActivityId(guid) => eff.activity_id = Some(*guid),
                Label::RelatedActivityId(guid) => eff.related_activity_id = Some(*guid),
                Label::TraceId(raw) => eff.trace_id = Some(*raw),
                Label::SpanId(id) => eff.span_id = Some(*id),
                Label::OpCode(op) => eff.opcode = *op,
                Label::Keywords(kw) => eff.keywords = *kw,
                Label::Level(level) => eff.level = *level,
                Label::Version(version) => eff.version = *version,
                Label::NameValueString(..) | Label::NameValueVarInt(..) => {}
            }
        }
    }
    eff
}

/// Decode a payload against its schema into ordered (name, value)
/// pairs.  Trailing payload bytes beyond the schema are tolerated (a
/// newer writer may append fields).
pub fn decode_payload(
    meta: &EventMetadata,
    payload: &[u8],
) -> Result<Vec<(String, Value)>> {
    let mut cur = SliceCursor::new(payload);
    let mut values = Vec::with_capacity(meta.parameters.len());
    for param in &meta.parameters {
        let value = decode_value(&mut cur, &param.ty)?;
        values.push((param.name.clone(), value));
    }
    Ok(values)
}

/// The externally visible unit: one fully decoded event occurrence.
/// Constructed per event; the decoder retains nothing after handing it
/// to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedEvent {
    pub metadata: Arc<EventMetadata>,
    /// Derived from the task name and the *effective* opcode.
    pub event_name: String,
    pub opcode: u8,
    pub keywords: u64,
    pub level: u8,
    pub version: u8,
    pub thread_id: u64,
    pub process_id: u64,
    pub thread_index: u64,
    pub processor: u32,
    pub stack_id: u32,
    pub sequence: u32,
    pub timestamp: DateTime<Utc>,
    pub timestamp_ticks: u64,
    pub activity_id: Option<Uuid>,
    pub related_activity_id: Option<Uuid>,
    pub trace_id: Option<[u8; 16]>,
    pub span_id: Option<u64>,
    /// The attached label list, if any (name/value pairs live here).
    pub label_list: Option<Arc<LabelList>>,
    /// Decoded parameter values in schema order.
    pub payload: Vec<(String, Value)>,
}

impl DecodedEvent {
    /// Distributed-trace id rendered as lowercase hex, if present.
    pub fn trace_id_hex(&self) -> Option<String> {
        self.trace_id.map(hex::encode)
    }
}

pub(crate) fn build_event(
    meta: &Arc<EventMetadata>,
    header: &EventHeader,
    eff: EffectiveValues,
    label_list: Option<Arc<LabelList>>,
    thread_id: u64,
    process_id: u64,
    timestamp: DateTime<Utc>,
    payload: Vec<(String, Value)>,
) -> DecodedEvent {
    DecodedEvent {
        metadata: Arc::clone(meta),
        event_name: derive_event_name(&meta.task_name, eff.opcode),
        opcode: eff.opcode,
        keywords: eff.keywords,
        level: eff.level,
        version: eff.version,
        thread_id,
        process_id,
        thread_index: header.thread_index,
        processor: header.processor,
        stack_id: header.stack_id,
        sequence: header.sequence,
        timestamp,
        timestamp_ticks: header.timestamp_ticks,
        activity_id: eff.activity_id,
        related_activity_id: eff.related_activity_id,
        trace_id: eff.trace_id,
        span_id: eff.span_id,
        label_list,
        payload,
    }
}
