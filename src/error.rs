//! Error types for the load engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the load engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Provider errors
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider timeout after {0}ms")]
    ProviderTimeout(u64),

    // Nonce management errors
    #[error("Nonce initialization failed for wallet {wallet} on {chain}: {reason}")]
    NonceInit {
        wallet: u32,
        chain: String,
        reason: String,
    },

    // Circuit breaker errors
    #[error("Circuit breaker open, retry in {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    // Retry errors
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    // Wallet farm errors
    #[error("Wallet not found: index {0}")]
    WalletNotFound(u32),

    // Behavior errors
    #[error("Unknown archetype: {0}")]
    UnknownArchetype(String),

    #[error("Invalid archetype profile: {0}")]
    InvalidArchetype(String),

    #[error("Unknown timing profile: {0}")]
    UnknownTimingProfile(String),

    #[error("Invalid timing range: min {min_ms}ms > max {max_ms}ms")]
    InvalidTimingRange { min_ms: u64, max_ms: u64 },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Classification bucket driving retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Transient failure, worth retrying
    Retriable,
    /// Retrying cannot help (bad input, insufficient funds, revert)
    Terminal,
    /// Unclassified, retried only when explicitly permitted
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Retriable => write!(f, "retriable"),
            ErrorClass::Terminal => write!(f, "terminal"),
            ErrorClass::Unknown => write!(f, "unknown"),
        }
    }
}

const TERMINAL_MARKERS: &[&str] = &[
    "insufficient funds",
    "insufficient balance",
    "execution reverted",
    "revert",
    "invalid argument",
    "invalid parameter",
    "unauthorized",
    "authorization failed",
    "authentication failed",
    "out of gas",
    "contract not found",
    "function not found",
    "method not found",
];

const RETRIABLE_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "econnreset",
    "econnrefused",
    "rate limit",
    "too many requests",
    "429",
    "nonce too low",
    "replacement transaction underpriced",
    "replacement underpriced",
    "service unavailable",
    "503",
    "temporarily unavailable",
    "server error",
];

/// Classify an error message into a retry bucket.
///
/// Pure function on the message text: the same input always yields the same
/// classification. Terminal markers win over retriable ones.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if TERMINAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::Terminal;
    }
    if RETRIABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::Retriable;
    }
    ErrorClass::Unknown
}

/// Check whether a provider message describes a nonce conflict
pub fn is_nonce_related(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("nonce") || (lower.contains("replacement") && lower.contains("underpriced"))
}

impl Error {
    /// Classify this error into a retry bucket
    pub fn classify(&self) -> ErrorClass {
        match self {
            Error::Provider(msg) => classify_message(msg),
            Error::ProviderTimeout(_) => ErrorClass::Retriable,
            Error::CircuitOpen { .. } => ErrorClass::Retriable,
            Error::NonceInit { reason, .. } => classify_message(reason),
            Error::RetriesExhausted { source, .. } => source.classify(),
            Error::Config(_)
            | Error::MissingEnvVar(_)
            | Error::WalletNotFound(_)
            | Error::UnknownArchetype(_)
            | Error::InvalidArchetype(_)
            | Error::UnknownTimingProfile(_)
            | Error::InvalidTimingRange { .. } => ErrorClass::Terminal,
            _ => ErrorClass::Unknown,
        }
    }

    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Retriable
    }

    /// Build the user-facing failure structure surfaced at the UI boundary
    pub fn failure_report(&self) -> FailureReport {
        let class = self.classify();
        let (reason, message, suggested_action) = match self {
            Error::CircuitOpen { retry_after_ms } => (
                "circuit-open",
                "Too many recent failures, submissions are paused".to_string(),
                format!("Wait ~{}ms for the circuit to probe recovery", retry_after_ms),
            ),
            Error::ProviderTimeout(ms) => (
                "timeout",
                format!("The network did not respond within {}ms", ms),
                "Check RPC endpoint health, then retry".to_string(),
            ),
            Error::NonceInit { wallet, chain, .. } => (
                "nonce-init",
                format!("Could not read the starting nonce for wallet {wallet} on {chain}"),
                "Verify the chain provider is reachable".to_string(),
            ),
            Error::RetriesExhausted { attempts, .. } => (
                "retries-exhausted",
                format!("The operation failed {} times in a row", attempts),
                "Inspect the underlying error before resubmitting".to_string(),
            ),
            _ => match class {
                ErrorClass::Terminal => (
                    "terminal",
                    "This transaction cannot succeed as submitted".to_string(),
                    "Fix the transaction parameters or fund the wallet".to_string(),
                ),
                ErrorClass::Retriable => (
                    "transient",
                    "A temporary failure occurred".to_string(),
                    "Retry shortly".to_string(),
                ),
                ErrorClass::Unknown => (
                    "unknown",
                    "An unclassified failure occurred".to_string(),
                    "Inspect the technical detail".to_string(),
                ),
            },
        };

        FailureReport {
            reason: reason.to_string(),
            message,
            detail: self.to_string(),
            suggested_action,
            can_retry: class == ErrorClass::Retriable,
        }
    }
}

/// User-visible failure structure (rendering is the UI layer's job)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub reason: String,
    pub message: String,
    pub detail: String,
    pub suggested_action: String,
    pub can_retry: bool,
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_is_pure() {
        let msg = "connection reset by peer";
        assert_eq!(classify_message(msg), classify_message(msg));
        assert_eq!(classify_message(msg), ErrorClass::Retriable);
    }

    #[test]
    fn test_insufficient_funds_always_terminal() {
        assert_eq!(
            classify_message("insufficient funds for gas * price + value"),
            ErrorClass::Terminal
        );
        assert_eq!(
            classify_message("Error: INSUFFICIENT FUNDS"),
            ErrorClass::Terminal
        );
    }

    #[test]
    fn test_timeout_always_retriable() {
        assert_eq!(classify_message("request timeout"), ErrorClass::Retriable);
        assert_eq!(
            classify_message("operation timed out after 30s"),
            ErrorClass::Retriable
        );
    }

    #[test]
    fn test_unknown_fallthrough() {
        assert_eq!(
            classify_message("something inexplicable happened"),
            ErrorClass::Unknown
        );
    }

    #[test]
    fn test_nonce_detection() {
        assert!(is_nonce_related("nonce too low"));
        assert!(is_nonce_related("replacement transaction underpriced"));
        assert!(!is_nonce_related("insufficient funds"));
    }

    #[test]
    fn test_failure_report_preserves_retryability() {
        let err = Error::Provider("insufficient funds".to_string());
        let report = err.failure_report();
        assert!(!report.can_retry);
        assert!(report.detail.contains("insufficient funds"));

        let err = Error::ProviderTimeout(5000);
        assert!(err.failure_report().can_retry);
    }

    #[test]
    fn test_retries_exhausted_inherits_class() {
        let err = Error::RetriesExhausted {
            attempts: 4,
            source: Box::new(Error::Provider("network unreachable".to_string())),
        };
        assert_eq!(err.classify(), ErrorClass::Retriable);
    }
}
