//! Session lifecycle tracking on top of the store client.

mod directory;
mod dispatch;
mod event;
pub mod keys;
mod processor;
mod record;

pub use directory::SessionDirectory;
pub use dispatch::{Dispatcher, Tally};
pub use event::{counter64, AccountingEvent, EventKind, SessionTarget};
pub use processor::{Outcome, SessionTracker};
pub use record::SessionRecord;
