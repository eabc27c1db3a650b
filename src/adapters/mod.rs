//! Adapters to the outside world
//!
//! - `imap/`: mailbox session, search compilation and fetching
//! - `sqlite/`: read side of the subject-pattern store

pub mod imap;
pub mod sqlite;
