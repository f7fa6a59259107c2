//! Test-only stream encoder: builds syntactically valid trace streams
//! for every supported major revision so the conformance tests can
//! exercise the decoder end to end.

#![allow(dead_code)]

use evtrace::codec::{write_varint, write_varuint};
use uuid::Uuid;

pub const KIND_END_OF_STREAM: u8 = 0;
pub const KIND_METADATA: u8 = 1;
pub const KIND_EVENT: u8 = 2;
pub const KIND_SEQUENCE_POINT: u8 = 3;
pub const KIND_THREAD: u8 = 4;
pub const KIND_REMOVE_THREAD: u8 = 5;
pub const KIND_LABEL_LIST: u8 = 6;

fn block_name(kind: u8) -> &'static str {
    match kind {
        KIND_METADATA => "MetadataBlock",
        KIND_EVENT => "EventBlock",
        KIND_SEQUENCE_POINT => "SequencePointBlock",
        KIND_THREAD => "ThreadBlock",
        KIND_REMOVE_THREAD => "RemoveThreadBlock",
        _ => panic!("no envelope name for kind {kind}"),
    }
}

pub fn utf16(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut out = Vec::new();
    write_varuint(&mut out, units.len() as u64);
    for u in units {
        out.extend_from_slice(&u.to_le_bytes());
    }
    out
}

fn length_prefixed(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(content.len() as u32).to_le_bytes());
    out.extend_from_slice(content);
    out
}

/// Builds one stream: header, blocks in push order, terminator.  The
/// framing (tagged vs named envelopes) follows the chosen major.
pub struct StreamBuilder {
    major: u32,
    sync_time_ns: i64,
    sync_ticks: u64,
    tick_frequency: u64,
    attributes: Vec<(String, String)>,
    /// (kind, optional envelope-name override, body)
    blocks: Vec<(u8, Option<String>, Vec<u8>)>,
}

impl StreamBuilder {
    pub fn new(major: u32) -> Self {
        Self {
            major,
            sync_time_ns: 1_700_000_000_000_000_000, // 2023-11-14T22:13:20Z
            sync_ticks: 0,
            tick_frequency: 1_000_000_000, // 1 tick = 1 ns
            attributes: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn sync(mut self, time_ns: i64, ticks: u64, frequency: u64) -> Self {
        self.sync_time_ns = time_ns;
        self.sync_ticks = ticks;
        self.tick_frequency = frequency;
        self
    }

    pub fn attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn block(mut self, kind: u8, body: Vec<u8>) -> Self {
        self.blocks.push((kind, None, body));
        self
    }

    /// A block with an unrecognised kind/name, for skip tests.
    pub fn unknown_block(mut self, tag: u8, name: &str, body: Vec<u8>) -> Self {
        self.blocks.push((tag, Some(name.into()), body));
        self
    }

    pub fn finish(self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&8u32.to_le_bytes()); // pointer size
        body.extend_from_slice(&4321u32.to_le_bytes()); // process id
        body.extend_from_slice(&8u32.to_le_bytes()); // cpu count
        body.extend_from_slice(&self.sync_time_ns.to_le_bytes());
        body.extend_from_slice(&self.sync_ticks.to_le_bytes());
        body.extend_from_slice(&self.tick_frequency.to_le_bytes());
        if self.major >= 6 {
            write_varuint(&mut body, self.attributes.len() as u64);
            for (key, value) in &self.attributes {
                body.extend_from_slice(&utf16(key));
                body.extend_from_slice(&utf16(value));
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"EVTRACE\0");
        out.extend_from_slice(&0u32.to_le_bytes()); // reserved
        out.extend_from_slice(&self.major.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // minor
        out.extend_from_slice(&length_prefixed(&body));

        let tagged = self.major >= 6;
        for (kind, name, body) in &self.blocks {
            if tagged {
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.push(*kind);
                out.extend_from_slice(body);
            } else {
                let name = match name {
                    Some(n) => n.clone(),
                    None => block_name(*kind).to_string(),
                };
                out.push(0x05); // BeginObject
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(&length_prefixed(body));
                out.push(0x06); // EndObject
            }
        }
        if tagged {
            out.extend_from_slice(&0u32.to_le_bytes());
            out.push(KIND_END_OF_STREAM);
        } else {
            out.push(0x01); // NullReference
        }
        out
    }

    /// The stream without its terminator, for truncation tests.
    pub fn finish_without_terminator(self) -> Vec<u8> {
        let tagged = self.major >= 6;
        let mut out = self.finish();
        let cut = if tagged { 5 } else { 1 };
        out.truncate(out.len() - cut);
        out
    }
}

// ── Metadata encoding ────────────────────────────────────────────────────────

/// One optional-metadata tag: `tag_len u32` covering the tag byte and
/// its body.
pub fn meta_tag(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut content = vec![tag];
    content.extend_from_slice(body);
    length_prefixed(&content)
}

pub fn meta_tag_opcode(opcode: u8) -> Vec<u8> {
    meta_tag(1, &[opcode])
}

pub fn meta_tag_keywords(keywords: u64) -> Vec<u8> {
    meta_tag(2, &keywords.to_le_bytes())
}

pub fn meta_tag_level(level: u8) -> Vec<u8> {
    meta_tag(3, &[level])
}

pub fn meta_tag_version(version: u8) -> Vec<u8> {
    meta_tag(4, &[version])
}

/// Parameter descriptor: `desc_len u32`, utf16 name, type encoding.
pub fn param(name: &str, type_bytes: &[u8]) -> Vec<u8> {
    let mut content = utf16(name);
    content.extend_from_slice(type_bytes);
    length_prefixed(&content)
}

// Wire type codes, mirrored from the crate for test encoding.
pub const TY_OBJECT: u8 = 1;
pub const TY_BOOLEAN: u8 = 3;
pub const TY_UTF16_CHAR: u8 = 4;
pub const TY_INT32: u8 = 9;
pub const TY_UINT64: u8 = 12;
pub const TY_GUID: u8 = 17;
pub const TY_ARRAY: u8 = 19;
pub const TY_REL_LOC: u8 = 21;
pub const TY_DATA_LOC: u8 = 22;
pub const TY_VARINT: u8 = 32;
pub const TY_VARUINT: u8 = 33;

/// Metadata record for majors >= 4 (numeric id).
pub fn metadata_record(
    id: u32,
    provider: &str,
    task: &str,
    event_id: u64,
    params: &[Vec<u8>],
    tags: &[Vec<u8>],
) -> Vec<u8> {
    let mut content = Vec::new();
    write_varuint(&mut content, id as u64);
    content.extend_from_slice(&utf16(provider));
    content.extend_from_slice(&utf16(task));
    write_varuint(&mut content, event_id);
    write_varuint(&mut content, params.len() as u64);
    for p in params {
        content.extend_from_slice(p);
    }
    for t in tags {
        content.extend_from_slice(t);
    }
    length_prefixed(&content)
}

/// Metadata record for major 3 (GUID + event id key).
pub fn metadata_record_legacy(
    guid: Uuid,
    event_id: u64,
    provider: &str,
    task: &str,
    params: &[Vec<u8>],
    tags: &[Vec<u8>],
) -> Vec<u8> {
    let mut content = Vec::new();
    content.extend_from_slice(&guid.to_bytes_le());
    write_varuint(&mut content, event_id);
    content.extend_from_slice(&utf16(provider));
    content.extend_from_slice(&utf16(task));
    write_varuint(&mut content, params.len() as u64);
    for p in params {
        content.extend_from_slice(p);
    }
    for t in tags {
        content.extend_from_slice(t);
    }
    length_prefixed(&content)
}

pub fn metadata_block(records: &[Vec<u8>]) -> Vec<u8> {
    records.concat()
}

// ── Thread encoding ──────────────────────────────────────────────────────────

pub fn thread_record(index: u64, thread_id: u64, process_id: u64, name: &str) -> Vec<u8> {
    let mut content = Vec::new();
    write_varuint(&mut content, index);
    write_varuint(&mut content, thread_id);
    write_varuint(&mut content, process_id);
    content.extend_from_slice(&utf16(name));
    write_varuint(&mut content, 0); // no attributes
    length_prefixed(&content)
}

pub fn remove_thread_record(index: u64, last_sequence: u32) -> Vec<u8> {
    let mut content = Vec::new();
    write_varuint(&mut content, index);
    write_varuint(&mut content, last_sequence as u64);
    length_prefixed(&content)
}

// ── Sequence point encoding ──────────────────────────────────────────────────

pub const SP_CLEAR_THREADS: u32 = 0x1;
pub const SP_RESET_METADATA: u32 = 0x2;

pub fn sequence_point(flags: u32, pairs: &[(u64, u32)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&flags.to_le_bytes());
    write_varuint(&mut body, pairs.len() as u64);
    for (index, sequence) in pairs {
        write_varuint(&mut body, *index);
        write_varuint(&mut body, *sequence as u64);
    }
    body
}

// ── Label list encoding ──────────────────────────────────────────────────────

pub fn label_record(id: u32, labels: &[Vec<u8>]) -> Vec<u8> {
    assert!(!labels.is_empty());
    let mut content = Vec::new();
    write_varuint(&mut content, id as u64);
    for (i, label) in labels.iter().enumerate() {
        let mut label = label.clone();
        if i == labels.len() - 1 {
            label[0] |= 0x80; // last-label marker
        }
        content.extend_from_slice(&label);
    }
    length_prefixed(&content)
}

pub fn label_activity_id(guid: Uuid) -> Vec<u8> {
    let mut out = vec![1];
    out.extend_from_slice(&guid.to_bytes_le());
    out
}

pub fn label_trace_id(raw: [u8; 16]) -> Vec<u8> {
    let mut out = vec![3];
    out.extend_from_slice(&raw);
    out
}

pub fn label_span_id(id: u64) -> Vec<u8> {
    let mut out = vec![4];
    out.extend_from_slice(&id.to_le_bytes());
    out
}

pub fn label_name_value_varint(name: &str, value: i64) -> Vec<u8> {
    let mut out = vec![6];
    out.extend_from_slice(&utf16(name));
    write_varint(&mut out, value);
    out
}

pub fn label_opcode(opcode: u8) -> Vec<u8> {
    vec![7, opcode]
}

pub fn label_level(level: u8) -> Vec<u8> {
    vec![9, level]
}

// ── Event encoding ───────────────────────────────────────────────────────────

/// How an event names its metadata on the wire.
pub enum MetaKey {
    Id(u32),
    Legacy(Uuid, u32),
}

pub struct EventSpec {
    pub meta: MetaKey,
    pub sequence: u32,
    pub thread_index: u64,
    pub capture_index: u64,
    pub processor: u32,
    pub stack_id: u32,
    pub timestamp: u64,
    pub label_list_id: u32,
    pub payload: Vec<u8>,
}

impl EventSpec {
    pub fn new(metadata_id: u32, sequence: u32, thread_index: u64) -> Self {
        Self {
            meta: MetaKey::Id(metadata_id),
            sequence,
            thread_index,
            capture_index: thread_index,
            processor: 0,
            stack_id: 0,
            timestamp: 0,
            label_list_id: 0,
            payload: Vec::new(),
        }
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn timestamp(mut self, ticks: u64) -> Self {
        self.timestamp = ticks;
        self
    }

    pub fn labels(mut self, label_list_id: u32) -> Self {
        self.label_list_id = label_list_id;
        self
    }

    fn encode_uncompressed(&self, major: u32, out: &mut Vec<u8>) {
        match &self.meta {
            MetaKey::Id(id) => out.extend_from_slice(&id.to_le_bytes()),
            MetaKey::Legacy(guid, event_id) => {
                out.extend_from_slice(&guid.to_bytes_le());
                out.extend_from_slice(&event_id.to_le_bytes());
            }
        }
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.thread_index.to_le_bytes());
        out.extend_from_slice(&self.capture_index.to_le_bytes());
        out.extend_from_slice(&self.processor.to_le_bytes());
        out.extend_from_slice(&self.stack_id.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        if major >= 6 {
            out.extend_from_slice(&self.label_list_id.to_le_bytes());
        }
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
    }

    /// Delta-encode against `prev`, emitting only changed fields.
    fn encode_compressed(&self, prev: &EventSpec, out: &mut Vec<u8>) {
        let meta_id = match self.meta {
            MetaKey::Id(id) => id,
            MetaKey::Legacy(..) => panic!("legacy keys are never compressed"),
        };
        let prev_id = match prev.meta {
            MetaKey::Id(id) => id,
            MetaKey::Legacy(..) => 0,
        };

        let mut flags = 0u8;
        let mut fields = Vec::new();
        if meta_id != prev_id {
            flags |= 0x01;
            write_varuint(&mut fields, meta_id as u64);
        }
        if self.sequence != prev.sequence.wrapping_add(1) {
            flags |= 0x02;
            let delta = self.sequence.wrapping_sub(prev.sequence).wrapping_sub(1);
            write_varuint(&mut fields, delta as u64);
        }
        if self.thread_index != prev.thread_index {
            flags |= 0x04;
            write_varuint(&mut fields, self.thread_index);
        }
        if self.capture_index != prev.capture_index {
            flags |= 0x08;
            write_varuint(&mut fields, self.capture_index);
        }
        if self.processor != prev.processor {
            flags |= 0x10;
            write_varuint(&mut fields, self.processor as u64);
        }
        if self.stack_id != prev.stack_id {
            flags |= 0x20;
            write_varuint(&mut fields, self.stack_id as u64);
        }
        if self.label_list_id != prev.label_list_id {
            flags |= 0x40;
            write_varuint(&mut fields, self.label_list_id as u64);
        }
        if self.payload.len() != prev.payload.len() {
            flags |= 0x80;
            write_varuint(&mut fields, self.payload.len() as u64);
        }

        out.push(flags);
        out.extend_from_slice(&fields);
        write_varuint(out, self.timestamp.wrapping_sub(prev.timestamp));
        out.extend_from_slice(&self.payload);
    }
}

/// An event block with uncompressed headers.
pub fn event_block(major: u32, events: &[EventSpec]) -> Vec<u8> {
    let mut body = vec![0u8]; // flags: not compressed
    for ev in events {
        ev.encode_uncompressed(major, &mut body);
    }
    body
}

/// An event block with compressed headers; the rolling state starts
/// zeroed, matching the decoder.
pub fn compressed_event_block(events: &[EventSpec]) -> Vec<u8> {
    let mut body = vec![0x01u8]; // flags: compressed
    let zero = EventSpec {
        meta: MetaKey::Id(0),
        // The implicit previous sequence is such that "absent" means
        // prev + 1; the zero state has sequence 0.
        sequence: 0,
        thread_index: 0,
        capture_index: 0,
        processor: 0,
        stack_id: 0,
        timestamp: 0,
        label_list_id: 0,
        payload: Vec::new(),
    };
    let mut prev = &zero;
    for ev in events {
        ev.encode_compressed(prev, &mut body);
        prev = ev;
    }
    body
}

// ── Payload encoding helpers ─────────────────────────────────────────────────

pub fn payload_i32(v: i32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn payload_utf16_array(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut out = Vec::new();
    out.extend_from_slice(&(units.len() as u16).to_le_bytes());
    for u in units {
        out.extend_from_slice(&u.to_le_bytes());
    }
    out
}
