//! Domain logic

pub mod bus;

pub use bus::{
    BusError, BusHooks, BusMessage, ConnectionManager, MessageBus, PollClient, PollRequest,
    PublishArgs,
};
