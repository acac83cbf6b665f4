//! Error types for adcomm

use thiserror::Error;

/// Result type for communication operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for communication operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid rank specified
    #[error("Invalid rank: {0}")]
    InvalidRank(i32),

    /// Invalid buffer provided (wrong length for the operation)
    #[error("Invalid buffer")]
    InvalidBuffer,

    /// Invalid count specified
    #[error("Invalid count: {0}")]
    InvalidCount(i64),

    /// Invalid or mismatched request handle
    #[error("Invalid request handle")]
    InvalidRequest,

    /// Incoming message larger than the posted receive buffer
    #[error("Message truncated: {received} elements into a buffer of {expected}")]
    Truncated {
        /// Number of elements the sender transmitted.
        received: usize,
        /// Capacity of the posted receive buffer.
        expected: usize,
    },

    /// Operation not supported by the underlying substrate
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Numeric error code surfaced by a substrate whose underlying library
    /// reports return codes (an MPI binding, for instance). Produced through
    /// [`Error::from_code`]; the in-process substrate never emits it.
    #[error("Substrate error (code {0})")]
    Substrate(i32),
}

impl Error {
    /// Create an error from a substrate error code.
    ///
    /// For [`Substrate`](crate::Substrate) implementations binding a library
    /// that reports numeric return codes; nothing in this crate produces
    /// codes of its own. Must not be called with a success code (0).
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => panic!("from_code called with success code"),
            _ => Error::Substrate(code),
        }
    }

    /// Check a substrate return code, returning Ok(()) for success.
    pub fn check(code: i32) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(Error::from_code(code))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_passes_success_codes() {
        assert!(Error::check(0).is_ok());
        assert!(matches!(Error::check(13), Err(Error::Substrate(13))));
    }

    #[test]
    fn messages_carry_the_relevant_numbers() {
        assert_eq!(Error::InvalidRank(-3).to_string(), "Invalid rank: -3");
        assert_eq!(
            Error::Truncated {
                received: 8,
                expected: 4
            }
            .to_string(),
            "Message truncated: 8 elements into a buffer of 4"
        );
        assert_eq!(Error::InvalidCount(-1).to_string(), "Invalid count: -1");
    }
}
