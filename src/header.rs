//! Stream header: magic, version negotiation, and the synchronization
//! point used to convert raw counter ticks to wall-clock time.
//!
//! The header is the only structure read before the block loop starts.
//! Its body is length-prefixed like every other record, so newer writers
//! can append fields that older decoders skip.
//!
//! # Format generations
//!
//! Four incompatible major revisions are supported by one decoder.  The
//! branch over revisions is taken exactly once, here, by resolving the
//! negotiated major into a [`FormatGeneration`]; the rest of the crate
//! asks the generation for capabilities instead of comparing version
//! numbers.
//!
//! | capability                  | 3 | 4 | 5 | 6 |
//! |-----------------------------|---|---|---|---|
//! | name-string block envelopes | x | x | x |   |
//! | numeric block kind tags     |   |   |   | x |
//! | GUID-keyed metadata         | x |   |   |   |
//! | compressed event headers    |   |   | x | x |
//! | label lists                 |   |   |   | x |
//! | header key/value attributes |   |   |   | x |

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Duration, Utc};
use std::io::Read;

use crate::codec::SliceCursor;
use crate::error::{Result, TraceError};

pub const MAGIC: &[u8; 8] = b"EVTRACE\0";
pub const MIN_SUPPORTED_MAJOR: u32 = 3;
pub const MAX_SUPPORTED_MAJOR: u32 = 6;

/// The closed set of wire-format revisions, resolved once at header
/// parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatGeneration {
    /// Major 3: named block envelopes, metadata keyed by provider GUID
    /// plus raw event id, uncompressed event headers only.
    Legacy,
    /// Major 4: named block envelopes, numeric metadata ids.
    Named,
    /// Major 5: as `Named`, plus compressed event headers.
    NamedCompressed,
    /// Major 6: numeric block kind tags, label lists, open header
    /// attributes.
    Tagged,
}

impl FormatGeneration {
    pub fn from_major(major: u32) -> Option<Self> {
        match major {
            3 => Some(FormatGeneration::Legacy),
            4 => Some(FormatGeneration::Named),
            5 => Some(FormatGeneration::NamedCompressed),
            6 => Some(FormatGeneration::Tagged),
            _ => None,
        }
    }

    pub fn uses_tagged_blocks(self) -> bool {
        matches!(self, FormatGeneration::Tagged)
    }

    pub fn guid_keyed_metadata(self) -> bool {
        matches!(self, FormatGeneration::Legacy)
    }

    pub fn supports_compressed_headers(self) -> bool {
        matches!(
            self,
            FormatGeneration::NamedCompressed | FormatGeneration::Tagged
        )
    }

    pub fn supports_label_lists(self) -> bool {
        matches!(self, FormatGeneration::Tagged)
    }

    pub fn supports_header_attributes(self) -> bool {
        matches!(self, FormatGeneration::Tagged)
    }
}

/// Parsed stream header.  Immutable once read; created exactly once at
/// stream start.
#[derive(Debug, Clone)]
pub struct TraceHeader {
    pub major: u32,
    pub minor: u32,
    pub generation: FormatGeneration,
    pub pointer_size: u32,
    pub process_id: u32,
    pub cpu_count: u32,
    /// Wall-clock time at the synchronization point.
    pub sync_time: DateTime<Utc>,
    /// High-resolution counter value at the synchronization point.
    pub sync_ticks: u64,
    /// Counter ticks per second.
    pub tick_frequency: u64,
    /// Free-form key/value attributes (newer revisions only).
    pub attributes: Vec<(String, String)>,
}

impl TraceHeader {
    /// Read and validate the stream header.
    ///
    /// An unknown major version is reported as
    /// [`TraceError::UnsupportedVersion`] carrying the supported range;
    /// the stream must not be processed further.
    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(TraceError::corrupt("bad stream magic"));
        }

        let _reserved = reader.read_u32::<LittleEndian>()?;
        let major = reader.read_u32::<LittleEndian>()?;
        let minor = reader.read_u32::<LittleEndian>()?;

        let generation =
            FormatGeneration::from_major(major).ok_or(TraceError::UnsupportedVersion {
                requested: major,
                min_supported: MIN_SUPPORTED_MAJOR,
                max_supported: MAX_SUPPORTED_MAJOR,
            })?;

        let body_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut body = vec![0u8; body_len];
        reader
            .read_exact(&mut body)
            .map_err(|_| TraceError::corrupt("truncated header body"))?;
        let mut cur = SliceCursor::new(&body);

        let pointer_size = cur.u32()?;
        let process_id = cur.u32()?;
        let cpu_count = cur.u32()?;
        let sync_time_ns = cur.i64()?;
        let sync_ticks = cur.u64()?;
        let tick_frequency = cur.u64()?;
        if tick_frequency == 0 {
            return Err(TraceError::corrupt("tick frequency is zero"));
        }

        let mut attributes = Vec::new();
        if generation.supports_header_attributes() {
            let count = cur.varuint()?;
            for _ in 0..count {
                let key = cur.utf16_string()?;
                let value = cur.utf16_string()?;
                attributes.push((key, value));
            }
        }
        // Trailing header bytes belong to a newer minor revision.

        let sync_time = DateTime::from_timestamp(
            sync_time_ns.div_euclid(1_000_000_000),
            sync_time_ns.rem_euclid(1_000_000_000) as u32,
        )
        .ok_or_else(|| TraceError::corrupt("sync time out of range"))?;

        Ok(Self {
            major,
            minor,
            generation,
            pointer_size,
            process_id,
            cpu_count,
            sync_time,
            sync_ticks,
            tick_frequency,
            attributes,
        })
    }

    /// Convert a raw counter value to wall-clock time via the
    /// synchronization point.  Ticks before the sync point resolve to
    /// times before it; the counter is allowed to wrap.
    pub fn timestamp(&self, ticks: u64) -> DateTime<Utc> {
        let delta_ticks = ticks.wrapping_sub(self.sync_ticks) as i64;
        let nanos =
            (delta_ticks as i128 * 1_000_000_000) / self.tick_frequency as i128;
        self.sync_time + Duration::nanoseconds(nanos as i64)
    }
}
