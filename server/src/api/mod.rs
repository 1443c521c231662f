//! API server and routes

pub mod routes;
mod server;
pub mod types;

pub use routes::BusApiState;
pub use server::ApiServer;
pub use types::ApiError;
