//! This module contains the data models for the ledgersync application.

pub mod cursor;
pub mod registration;
pub mod transaction;
pub mod units;

pub use cursor::Cursor;
pub use registration::Registration;
pub use transaction::{Provider, Transaction, TransactionDefaults, TransactionType};
