use std::io;

use log::debug;
use openssl::error::ErrorStack;
use thiserror::Error;

/// Errors surfaced by secure sessions.
///
/// Every failure from the underlying crypto engine or transport is collapsed
/// into exactly one of these kinds at the public boundary. Engine detail is
/// logged at the point of failure and not reported twice.
#[derive(Debug, Error)]
pub enum Error {
    /// Allocation or capacity failure.
    #[error("out of resources: {0}")]
    Resource(String),

    /// Hard failure on the underlying transport.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Non-fatal retry signal. Produced only when the caller requested
    /// non-blocking semantics for the call.
    #[error("operation would block")]
    WouldBlock,

    /// Malformed PEM or certificate input.
    #[error("malformed input: {0}")]
    Format(String),

    /// Key/certificate generation or export failure in the crypto engine.
    #[error("crypto engine failure: {0}")]
    Crypto(String),

    /// Handshake rejection or verification failure.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// Invalid or missing option.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is the non-fatal retry signal.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}

/// Log every entry on an engine error stack and return a one-line summary.
///
/// The engine queues errors in ambient per-thread state. Callers invoke this
/// at their own failure point so no stale entries remain visible to a later,
/// unrelated call.
pub(crate) fn describe_engine_errors(context: &str, stack: &ErrorStack) -> String {
    let errors = stack.errors();
    if errors.is_empty() {
        return format!("{context}: unknown engine error");
    }
    let mut summary = String::from(context);
    for e in errors {
        debug!("{context}: {e}");
        summary.push_str(": ");
        summary.push_str(&e.to_string());
    }
    summary
}

/// Drain and log any errors left on the engine's per-thread queue.
pub(crate) fn drain_engine_errors(context: &str) {
    let stack = ErrorStack::get();
    for e in stack.errors() {
        debug!("{context}: {e}");
    }
}

/// Collapse an engine error stack into [`Error::Crypto`], logging the detail.
pub(crate) fn crypto_error(context: &str, stack: ErrorStack) -> Error {
    Error::Crypto(describe_engine_errors(context, &stack))
}
