pub mod connection;
pub mod fetch;
pub mod search;
pub mod session;

pub use search::SearchQuery;
pub use session::{ImapTransport, Mailbox, MailboxSession, SessionState, Transport};
