//! The pull loop: one call, one event.
//!
//! [`TraceDecoder`] owns the block reader and the three per-stream
//! tables (metadata, threads, label lists).  `next_event` pumps
//! side-effect blocks — metadata, thread, remove-thread, label list,
//! sequence point — silently until an event block yields an event or
//! the stream terminator is reached.  At most one block body is
//! buffered at a time.
//!
//! Errors are sticky: after the first `Err`, every later call reports
//! the same classification.  A byte source that has desynchronized
//! once cannot be trusted to resynchronize.

use std::io::{self, Read};
use std::sync::Arc;
use tracing::debug;

use crate::block::{Block, BlockKind, BlockReader};
use crate::codec::SliceCursor;
use crate::error::{Result, TraceError};
use crate::event::{
    apply_labels, build_event, decode_compressed, decode_payload, decode_uncompressed,
    DecodedEvent, EventHeaderState, MetadataRef,
};
use crate::header::TraceHeader;
use crate::labels::LabelTable;
use crate::metadata::MetadataTable;
use crate::thread::ThreadTable;

// Sequence point flag bits.
const SP_CLEAR_THREADS: u32 = 0x1;
const SP_RESET_METADATA: u32 = 0x2;

// Event block flag bits.
const EB_COMPRESSED: u8 = 0x1;

/// The event block currently being drained, with its rolling
/// compressed-header state.
#[derive(Debug)]
struct EventBlockState {
    body: Vec<u8>,
    pos: usize,
    compressed: bool,
    prev: EventHeaderState,
}

/// Remembers the first error so later calls can re-report it without
/// touching the source again.
#[derive(Debug)]
enum Sticky {
    UnsupportedVersion { requested: u32, min: u32, max: u32 },
    Corrupt(String),
    Protocol(String),
    Io(String),
}

impl Sticky {
    fn capture(err: &TraceError) -> Self {
        match err {
            TraceError::UnsupportedVersion {
                requested,
                min_supported,
                max_supported,
            } => Sticky::UnsupportedVersion {
                requested: *requested,
                min: *min_supported,
                max: *max_supported,
            },
            TraceError::Corrupt(msg) => Sticky::Corrupt(msg.clone()),
            TraceError::Protocol(msg) => Sticky::Protocol(msg.clone()),
            TraceError::Io(e) => Sticky::Io(e.to_string()),
        }
    }

    fn replay(&self) -> TraceError {
        match self {
            Sticky::UnsupportedVersion { requested, min, max } => {
                TraceError::UnsupportedVersion {
                    requested: *requested,
                    min_supported: *min,
                    max_supported: *max,
                }
            }
            Sticky::Corrupt(msg) => TraceError::Corrupt(msg.clone()),
            Sticky::Protocol(msg) => TraceError::Protocol(msg.clone()),
            Sticky::Io(msg) => {
                TraceError::Io(io::Error::new(io::ErrorKind::Other, msg.clone()))
            }
        }
    }
}

/// Streaming decoder over any forward-only byte source.
///
/// Memory use is bounded by the largest single block plus the tables;
/// it does not grow with stream length (the tables grow only with the
/// number of distinct schemas, threads, and label lists).
#[derive(Debug)]
pub struct TraceDecoder<R: Read> {
    header: TraceHeader,
    blocks: BlockReader<R>,
    metadata: MetadataTable,
    threads: ThreadTable,
    labels: LabelTable,
    current: Option<EventBlockState>,
    dropped: u64,
    finished: bool,
    sticky: Option<Sticky>,
}

impl<R: Read> TraceDecoder<R> {
    /// Read and validate the stream header; fails before producing any
    /// event if the major version is outside the supported range.
    pub fn new(mut reader: R) -> Result<Self> {
        let header = TraceHeader::read(&mut reader)?;
        let blocks = BlockReader::new(reader, header.generation);
        Ok(Self {
            header,
            blocks,
            metadata: MetadataTable::new(),
            threads: ThreadTable::new(),
            labels: LabelTable::new(),
            current: None,
            dropped: 0,
            finished: false,
            sticky: None,
        })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    /// Events the producer declared but this decoder never saw,
    /// accumulated from sequence points.  Advisory; monotonic.
    pub fn dropped_events(&self) -> u64 {
        self.dropped
    }

    /// The next event, or `None` after the stream terminator.
    pub fn next_event(&mut self) -> Result<Option<DecodedEvent>> {
        if let Some(sticky) = &self.sticky {
            return Err(sticky.replay());
        }
        if self.finished {
            return Ok(None);
        }
        match self.pump() {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(err) => {
                self.sticky = Some(Sticky::capture(&err));
                Err(err)
            }
        }
    }

    fn pump(&mut self) -> Result<Option<DecodedEvent>> {
        loop {
            if let Some(state) = &self.current {
                if state.pos < state.body.len() {
                    return self.decode_one().map(Some);
                }
                self.current = None;
            }

            let block = match self.blocks.next_block()? {
                Some(block) => block,
                None => return Ok(None),
            };
            match block.kind {
                BlockKind::Metadata => {
                    self.metadata
                        .process_block(&block.body, self.header.generation)?;
                }
                BlockKind::Thread => self.threads.process_block(&block.body)?,
                BlockKind::RemoveThread => {
                    self.threads.process_remove_block(&block.body)?
                }
                BlockKind::LabelList => self.labels.process_block(&block.body)?,
                BlockKind::SequencePoint => self.process_sequence_point(&block.body)?,
                BlockKind::Event => self.begin_event_block(block)?,
            }
        }
    }

    fn begin_event_block(&mut self, block: Block) -> Result<()> {
        let Block { body, .. } = block;
        if body.is_empty() {
            return Ok(());
        }
        let flags = body[0];
        let compressed = flags & EB_COMPRESSED != 0;
        if compressed && !self.header.generation.supports_compressed_headers() {
            return Err(TraceError::corrupt(
                "compressed event headers in a revision without them",
            ));
        }
        self.current = Some(EventBlockState {
            body,
            pos: 1,
            compressed,
            prev: EventHeaderState::default(),
        });
        Ok(())
    }

    // Decode the next event out of the in-flight block.  Destructured
    // so the block body can be read while the tables are updated.
    fn decode_one(&mut self) -> Result<DecodedEvent> {
        let Self {
            header,
            metadata,
            threads,
            labels,
            current,
            ..
        } = self;
        let state = match current {
            Some(state) => state,
            None => return Err(TraceError::corrupt("no event block in flight")),
        };

        let mut cur = SliceCursor::new(&state.body);
        cur.seek_to(state.pos)?;

        let (ev, next_prev) = if state.compressed {
            decode_compressed(&mut cur, &state.prev, header.generation)?
        } else {
            decode_uncompressed(&mut cur, header.generation)?
        };
        let payload_bytes = cur.bytes(ev.payload_len as usize)?;

        let meta = match ev.metadata {
            MetadataRef::Id(id) => metadata.resolve(id)?,
            MetadataRef::Legacy(guid, event_id) => {
                metadata.resolve_legacy(guid, event_id)?
            }
        };
        let meta = Arc::clone(meta);

        let label_list = if ev.label_list_id != 0 {
            labels.resolve(ev.label_list_id)?.map(Arc::clone)
        } else {
            None
        };

        let entry = threads.resolve(ev.thread_index)?;
        let thread_id = entry.thread_id;
        let process_id = entry.process_id;
        threads.resolve(ev.capture_index)?;

        let eff = apply_labels(&meta, label_list.as_deref());
        let payload = decode_payload(&meta, payload_bytes)?;
        let timestamp = header.timestamp(ev.timestamp_ticks);

        // Commit only once the whole event decoded cleanly.
        threads.record_dispatch(ev.capture_index, ev.sequence)?;
        state.pos = cur.pos();
        state.prev = next_prev;

        Ok(build_event(
            &meta, &ev, eff, label_list, thread_id, process_id, timestamp, payload,
        ))
    }

    /// Loss accounting, then the requested table resets.  Never fatal.
    fn process_sequence_point(&mut self, body: &[u8]) -> Result<()> {
        let mut cur = SliceCursor::new(body);
        let flags = cur.u32()?;
        let count = cur.varuint()?;
        for _ in 0..count {
            let index = cur.varuint()?;
            let declared = cur.varuint()?;
            let declared = u32::try_from(declared)
                .map_err(|_| TraceError::corrupt("sequence point value exceeds u32"))?;
            let last = self.threads.last_sequence(index).unwrap_or(0);
            let gap = declared.saturating_sub(last) as u64;
            if gap > 0 {
                debug!(
                    thread_index = index,
                    declared, last, gap, "sequence point reports dropped events"
                );
                self.dropped += gap;
            }
            self.threads.advance_sequence(index, declared);
        }

        if flags & SP_CLEAR_THREADS != 0 {
            self.threads.clear();
        }
        if flags & SP_RESET_METADATA != 0 {
            self.metadata.reset();
        }
        Ok(())
    }
}

impl<R: Read> Iterator for TraceDecoder<R> {
    type Item = std::result::Result<DecodedEvent, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}
