//! # prism-io — The Storage of PRISM
//!
//! Two primitives with no knowledge of queries:
//!
//! - [`ring::Ring`]: a fixed-capacity ring that keeps the most recent
//!   entries, driven by a start/len [`cursor::Cursor`].
//! - [`journal::TraceJournal`]: an append-only, line-oriented file where
//!   every entry carries a CRC32 so replay can detect torn or edited lines.

pub mod cursor;
pub mod journal;
pub mod ring;

pub use cursor::Cursor;
pub use journal::{JournalError, ReplayReport, TraceJournal};
pub use ring::Ring;
