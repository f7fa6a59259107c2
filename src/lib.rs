//! Streaming decoder for the self-describing binary trace container.
//!
//! A trace is a header followed by kind-tagged blocks: schema
//! definitions, thread identities, label lists, sequence points, and
//! the event blocks they describe.  [`TraceDecoder`] pulls one decoded
//! event per call from any forward-only [`std::io::Read`] source,
//! buffering at most one block at a time.
//!
//! ```no_run
//! use evtrace::TraceDecoder;
//!
//! # fn main() -> Result<(), evtrace::TraceError> {
//! let file = std::fs::File::open("app.evtrace")?;
//! let mut decoder = TraceDecoder::new(std::io::BufReader::new(file))?;
//! while let Some(event) = decoder.next_event()? {
//!     println!("{} @ {}", event.event_name, event.timestamp);
//! }
//! println!("dropped: {}", decoder.dropped_events());
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod codec;
pub mod decoder;
pub mod error;
pub mod event;
pub mod header;
pub mod labels;
pub mod metadata;
pub mod payload;
pub mod thread;

pub use decoder::TraceDecoder;
pub use error::{Result, TraceError};
pub use event::DecodedEvent;
pub use header::{FormatGeneration, TraceHeader};
pub use labels::{Label, LabelList};
pub use metadata::{EventMetadata, EventParameter};
pub use payload::{MetadataType, PrimitiveKind, Value};
pub use thread::ThreadEntry;
