//! Error types for Hivequota.

use thiserror::Error;

/// Main error type for Hivequota operations.
///
/// A denied verdict is never represented here; it is an ordinary `false`
/// returned from the limiter.
#[derive(Error, Debug)]
pub enum HivequotaError {
    /// Invalid policy parameters or configuration, detected before any store call
    #[error("Configuration error: {0}")]
    Config(String),

    /// The atomic routine could not run against the shared store
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A routine could not be installed in the store at startup
    #[error("Failed to register routine {routine}: {reason}")]
    Registration {
        routine: &'static str,
        reason: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HivequotaError {
    /// Whether the error means no verdict could be reached, as opposed to
    /// the caller having supplied a bad policy.
    pub fn is_undecidable(&self) -> bool {
        matches!(
            self,
            HivequotaError::StoreUnavailable(_) | HivequotaError::Registration { .. }
        )
    }
}

/// Result type alias for Hivequota operations.
pub type Result<T> = std::result::Result<T, HivequotaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undecidable_classification() {
        assert!(HivequotaError::StoreUnavailable("down".into()).is_undecidable());
        assert!(HivequotaError::Registration {
            routine: "sliding_window",
            reason: "refused".into(),
        }
        .is_undecidable());
        assert!(!HivequotaError::Config("period must be positive".into()).is_undecidable());
    }

    #[test]
    fn test_error_display() {
        let err = HivequotaError::Registration {
            routine: "funnel_leak",
            reason: "NOSCRIPT".into(),
        };
        assert_eq!(err.to_string(), "Failed to register routine funnel_leak: NOSCRIPT");
    }
}
