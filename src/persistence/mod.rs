//! Durable state: the cursor store, the deduplicating transaction table,
//! registrations and gap markers.

pub mod error;
pub mod sqlite;
pub mod traits;

pub use error::PersistenceError;
pub use sqlite::SqliteLedgerRepository;
pub use traits::LedgerRepository;
