//! Block framework: the top-level unit of the trace container.
//!
//! A stream is a header followed by blocks until an explicit
//! terminator.  How a block announces its kind depends on the format
//! generation:
//!
//! - **Tagged** (major 6): `len u32`, `kind u8`, then `len` body bytes.
//!   The terminator is kind 0 with an empty body.
//! - **Named** (majors 3–5): an object envelope — BeginObject tag
//!   (0x05), `name_len u8`, ASCII name, `body_len u32`, body, EndObject
//!   tag (0x06).  The terminator is a single NullReference tag (0x01).
//!
//! Unknown kinds and unknown names are skipped by consuming exactly the
//! declared body length.  That skip is the format's entire
//! backward-compatibility story: a decoder built before a block kind
//! existed reads right past it.
//!
//! Reaching end-of-file where a block is expected is corruption, not a
//! clean end: only the terminator ends a stream.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Read};
use tracing::debug;

use crate::error::{Result, TraceError};
use crate::header::FormatGeneration;

// Tagged-generation block kind codes.
pub const KIND_END_OF_STREAM: u8 = 0;
pub const KIND_METADATA: u8 = 1;
pub const KIND_EVENT: u8 = 2;
pub const KIND_SEQUENCE_POINT: u8 = 3;
pub const KIND_THREAD: u8 = 4;
pub const KIND_REMOVE_THREAD: u8 = 5;
pub const KIND_LABEL_LIST: u8 = 6;

// Named-generation object envelope tags.
pub const TAG_NULL_REFERENCE: u8 = 0x01;
pub const TAG_BEGIN_OBJECT: u8 = 0x05;
pub const TAG_END_OBJECT: u8 = 0x06;

/// Block kinds the decoder understands.  Anything else is skipped
/// inside [`BlockReader::next_block`] and never surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Metadata,
    Event,
    SequencePoint,
    Thread,
    RemoveThread,
    LabelList,
}

impl BlockKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            KIND_METADATA => Some(BlockKind::Metadata),
            KIND_EVENT => Some(BlockKind::Event),
            KIND_SEQUENCE_POINT => Some(BlockKind::SequencePoint),
            KIND_THREAD => Some(BlockKind::Thread),
            KIND_REMOVE_THREAD => Some(BlockKind::RemoveThread),
            KIND_LABEL_LIST => Some(BlockKind::LabelList),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "MetadataBlock" => Some(BlockKind::Metadata),
            "EventBlock" => Some(BlockKind::Event),
            "SequencePointBlock" => Some(BlockKind::SequencePoint),
            "ThreadBlock" => Some(BlockKind::Thread),
            "RemoveThreadBlock" => Some(BlockKind::RemoveThread),
            _ => None,
        }
    }
}

/// One recognised block: its kind and its complete body.
///
/// The body is the only buffering the decoder does — one in-flight
/// block, decoded before the next is read.
#[derive(Debug)]
pub struct Block {
    pub kind: BlockKind,
    pub body: Vec<u8>,
}

/// Reads length-prefixed, kind-tagged blocks from a forward-only byte
/// source, dispatching on whichever framing the negotiated generation
/// uses.
#[derive(Debug)]
pub struct BlockReader<R: Read> {
    reader: R,
    generation: FormatGeneration,
}

impl<R: Read> BlockReader<R> {
    pub fn new(reader: R, generation: FormatGeneration) -> Self {
        Self { reader, generation }
    }

    /// The next recognised block, or `None` once the stream terminator
    /// has been consumed.  Unknown kinds are skipped here.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        loop {
            let parsed = if self.generation.uses_tagged_blocks() {
                self.next_tagged()?
            } else {
                self.next_named()?
            };
            match parsed {
                Framed::End => return Ok(None),
                Framed::Known(block) => return Ok(Some(block)),
                Framed::Skipped => continue,
            }
        }
    }

    fn next_tagged(&mut self) -> Result<Framed> {
        let len = match self.read_u32_or_truncated()? {
            Some(len) => len as usize,
            None => return Err(TraceError::corrupt("stream ended without terminator")),
        };
        let tag = self.reader.read_u8().map_err(truncated)?;
        if tag == KIND_END_OF_STREAM {
            // Terminator carries no body; a declared length here is a
            // writer bug we refuse to guess around.
            if len != 0 {
                return Err(TraceError::corrupt("end-of-stream block with a body"));
            }
            return Ok(Framed::End);
        }
        let body = self.read_body(len)?;
        match BlockKind::from_tag(tag) {
            Some(kind) => Ok(Framed::Known(Block { kind, body })),
            None => {
                debug!(tag, len, "skipping unknown block kind");
                Ok(Framed::Skipped)
            }
        }
    }

    fn next_named(&mut self) -> Result<Framed> {
        let tag = match self.read_u8_or_truncated()? {
            Some(tag) => tag,
            None => return Err(TraceError::corrupt("stream ended without terminator")),
        };
        match tag {
            TAG_NULL_REFERENCE => return Ok(Framed::End),
            TAG_BEGIN_OBJECT => {}
            other => {
                return Err(TraceError::corrupt(format!(
                    "expected object envelope, got tag 0x{other:02x}"
                )))
            }
        }

        let name_len = self.reader.read_u8().map_err(truncated)? as usize;
        let mut name_buf = vec![0u8; name_len];
        self.reader.read_exact(&mut name_buf).map_err(truncated)?;
        let name = String::from_utf8_lossy(&name_buf).into_owned();

        let body_len = self.reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let body = self.read_body(body_len)?;

        let end = self.reader.read_u8().map_err(truncated)?;
        if end != TAG_END_OBJECT {
            return Err(TraceError::corrupt(format!(
                "block {name:?} not closed (tag 0x{end:02x})"
            )));
        }

        match BlockKind::from_name(&name) {
            Some(kind) => Ok(Framed::Known(Block { kind, body })),
            None => {
                debug!(name = %name, len = body_len, "skipping unknown block");
                Ok(Framed::Skipped)
            }
        }
    }

    fn read_body(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).map_err(|_| {
            TraceError::corrupt(format!("block declares {len} bytes, stream is shorter"))
        })?;
        Ok(body)
    }

    // EOF exactly at a block boundary is distinguishable from EOF in
    // the middle of a field; both are corruption, but the boundary case
    // gets the "missing terminator" message.
    fn read_u32_or_truncated(&mut self) -> Result<Option<u32>> {
        match self.reader.read_u32::<LittleEndian>() {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_u8_or_truncated(&mut self) -> Result<Option<u8>> {
        match self.reader.read_u8() {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

enum Framed {
    Known(Block),
    Skipped,
    End,
}

fn truncated(_: io::Error) -> TraceError {
    TraceError::corrupt("truncated block header")
}
