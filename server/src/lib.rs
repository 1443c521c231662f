//! fanline — reliable pub/sub message bus over HTTP long polling
//!
//! Publishers append messages to named, site-scoped channels backed by a
//! bounded backlog (memory, Redis or PostgreSQL); connected consumers catch
//! up from the backlog and then long-poll — optionally streaming multiple
//! batches over one chunked response — while a single firehose subscription
//! fans incoming messages out to every permitted connection.

pub mod api;
mod app;
pub mod core;
pub mod data;
pub mod domain;
