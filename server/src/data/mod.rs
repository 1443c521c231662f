//! Data storage layer
//!
//! - `backlog` — pluggable message backlog stores (memory, Redis, PostgreSQL)
//!   and the ordered firehose over them

pub mod backlog;

pub use backlog::{
    BacklogBackend, BacklogError, Firehose, Message, MessagePayload, PublishOpts,
};
