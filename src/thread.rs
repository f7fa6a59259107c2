//! Thread table: stream-local thread indices → OS thread identity.
//!
//! A thread index is not an OS thread id; it is a small integer the
//! producer assigns, with an explicit creation/removal lifecycle.
//! Removed entries are kept as sentinels rather than deleted, so a
//! reference to a removed index reports exactly that instead of
//! looking like an undefined one.  Index reuse requires a sequence
//! point that clears the namespace.

use serde::Serialize;
use std::collections::HashMap;

use crate::codec::SliceCursor;
use crate::error::{Result, TraceError};

/// One live thread identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadEntry {
    pub index: u64,
    pub thread_id: u64,
    pub process_id: u64,
    pub name: Option<String>,
    pub attributes: Vec<(String, String)>,
    /// Sequence number of the last event dispatched on this index;
    /// a removal must cite this exact value.
    pub last_sequence: u32,
}

#[derive(Debug)]
enum Slot {
    Live(ThreadEntry),
    Removed,
}

/// Per-stream thread index table.
#[derive(Debug, Default)]
pub struct ThreadTable {
    slots: HashMap<u64, Slot>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a thread index.  Both a live and a removed occupant make
    /// this a protocol error; reuse needs an explicit namespace clear.
    pub fn define(&mut self, entry: ThreadEntry) -> Result<()> {
        match self.slots.get(&entry.index) {
            None => {
                self.slots.insert(entry.index, Slot::Live(entry));
                Ok(())
            }
            Some(Slot::Live(_)) => Err(TraceError::protocol(format!(
                "thread index {} redefined while live",
                entry.index
            ))),
            Some(Slot::Removed) => Err(TraceError::protocol(format!(
                "thread index {} reused after removal without a namespace clear",
                entry.index
            ))),
        }
    }

    /// Remove a thread index.  `last_sequence` must match the sequence
    /// number actually last dispatched on the index; a mismatch means
    /// the writer removed the thread before flushing its events.
    pub fn remove(&mut self, index: u64, last_sequence: u32) -> Result<()> {
        match self.slots.get_mut(&index) {
            Some(Slot::Live(entry)) => {
                if entry.last_sequence != last_sequence {
                    return Err(TraceError::protocol(format!(
                        "thread index {index} removed citing sequence {last_sequence}, \
                         but {} was last dispatched",
                        entry.last_sequence
                    )));
                }
                self.slots.insert(index, Slot::Removed);
                Ok(())
            }
            Some(Slot::Removed) => Err(TraceError::protocol(format!(
                "thread index {index} removed twice"
            ))),
            None => Err(TraceError::protocol(format!(
                "remove of undefined thread index {index}"
            ))),
        }
    }

    pub fn resolve(&self, index: u64) -> Result<&ThreadEntry> {
        match self.slots.get(&index) {
            Some(Slot::Live(entry)) => Ok(entry),
            Some(Slot::Removed) => Err(TraceError::protocol(format!(
                "event references removed thread index {index}"
            ))),
            None => Err(TraceError::protocol(format!(
                "event references undefined thread index {index}"
            ))),
        }
    }

    /// Record that `sequence` was dispatched on `index`.
    pub fn record_dispatch(&mut self, index: u64, sequence: u32) -> Result<()> {
        match self.slots.get_mut(&index) {
            Some(Slot::Live(entry)) => {
                entry.last_sequence = sequence;
                Ok(())
            }
            _ => self.resolve(index).map(|_| ()),
        }
    }

    /// The sequence last dispatched on a live index, if any.
    pub fn last_sequence(&self, index: u64) -> Option<u32> {
        match self.slots.get(&index) {
            Some(Slot::Live(entry)) => Some(entry.last_sequence),
            _ => None,
        }
    }

    /// Advance a live index's running sequence without dispatching
    /// (sequence-point bookkeeping).
    pub fn advance_sequence(&mut self, index: u64, sequence: u32) {
        if let Some(Slot::Live(entry)) = self.slots.get_mut(&index) {
            entry.last_sequence = sequence;
        }
    }

    /// Clear the whole namespace, permitting index reuse.  Only a
    /// sequence point with the explicit flag may do this.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Parse a thread block body: length-prefixed records.
    pub fn process_block(&mut self, body: &[u8]) -> Result<()> {
        let mut cur = SliceCursor::new(body);
        while !cur.is_empty() {
            let record_len = cur.u32()? as usize;
            let record_end = cur
                .pos()
                .checked_add(record_len)
                .ok_or_else(|| TraceError::corrupt("thread record length overflows"))?;

            let index = cur.varuint()?;
            let thread_id = cur.varuint()?;
            let process_id = cur.varuint()?;
            let name = match cur.utf16_string()? {
                s if s.is_empty() => None,
                s => Some(s),
            };
            let attr_count = cur.varuint()?;
            let mut attributes = Vec::new();
            for _ in 0..attr_count {
                let key = cur.utf16_string()?;
                let value = cur.utf16_string()?;
                attributes.push((key, value));
            }

            self.define(ThreadEntry {
                index,
                thread_id,
                process_id,
                name,
                attributes,
                last_sequence: 0,
            })?;
            cur.seek_to(record_end)?;
        }
        Ok(())
    }

    /// Parse a remove-thread block body.
    pub fn process_remove_block(&mut self, body: &[u8]) -> Result<()> {
        let mut cur = SliceCursor::new(body);
        while !cur.is_empty() {
            let record_len = cur.u32()? as usize;
            let record_end = cur
                .pos()
                .checked_add(record_len)
                .ok_or_else(|| TraceError::corrupt("remove record length overflows"))?;
            let index = cur.varuint()?;
            let last_sequence = cur.varuint()?;
            let last_sequence = u32::try_from(last_sequence)
                .map_err(|_| TraceError::corrupt("removal sequence exceeds u32"))?;
            self.remove(index, last_sequence)?;
            cur.seek_to(record_end)?;
        }
        Ok(())
    }
}
