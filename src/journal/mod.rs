//! Write-ahead journal of successful mutating commands.
//!
//! A command is appended only after it has been applied in memory, and
//! before the next command runs. Appends are buffered; the node flushes them
//! on every schedule tick and at shutdown. At startup the records are
//! replayed in order through the command registry to rebuild state. A record
//! that fails to decode or apply aborts startup.

mod record;
mod store;

pub use record::JournalRecord;
pub use store::{FileJournal, JournalStore, MemoryJournal};
