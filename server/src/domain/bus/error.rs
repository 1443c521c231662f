//! Bus error types

use thiserror::Error;

use crate::data::backlog::BacklogError;

#[derive(Error, Debug)]
pub enum BusError {
    /// Invalid publish target: `/global/` channel with user/group restriction,
    /// channel containing the site separator, or an empty-but-set target list
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Any operation after `destroy`
    #[error("Bus has been destroyed")]
    Destroyed,

    #[error(transparent)]
    Backend(#[from] BacklogError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_message_display() {
        let err = BusError::InvalidMessage("empty user_ids".to_string());
        assert_eq!(err.to_string(), "Invalid message: empty user_ids");
    }

    #[test]
    fn test_backend_error_passes_through() {
        let err = BusError::from(BacklogError::Closed);
        assert_eq!(err.to_string(), "Subscription closed");
    }
}
