//! # docqueue
//!
//! Priority work queue whose state lives in a document store.
//!
//! Messages are claimed with a single atomic find-and-modify, released
//! after a visibility timeout if never acknowledged, and ordered by
//! priority then creation time. Stores plug in through
//! [`store::DocumentStore`]; an in-process store and a PostgreSQL `jsonb`
//! store are included.

pub mod clock;
pub mod config;
pub mod error;
pub mod index;
pub mod model;
pub mod query;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
pub use model::{GetOptions, Message, MessageId, NewMessage, Release};
pub use queue::Queue;
