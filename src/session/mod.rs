//! Session identity and persistence.
//!
//! A session is the unit of conversation state the worker process resumes:
//! every Discord thread maps to exactly one session record, and the record
//! survives gateway restarts.

pub mod identity;
pub mod store;

pub use store::{SessionRecord, SessionStatus, SessionStore, StoreCorrupt};
