//! Error types for the weft runtime.

/// Result type alias for weft operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the weft runtime.
///
/// Failures are values: they travel through result cells and cancellation
/// groups, so the type is `Clone`. Fatal contract violations (double
/// fulfillment, joining inside a guarded section, submitting after
/// shutdown) are not represented here; they panic at the call site.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The task's group was cancelled while it was queued, running, or
    /// being waited on.
    #[error("interrupted")]
    Interrupted,

    /// A join observed a cancellation that collected several causes.
    #[error("{} failures collected", .0.len())]
    Aggregate(Vec<Error>),

    /// A timed access gave up at its deadline.
    #[error("unavailable: deadline passed")]
    Unavailable,

    /// A user closure panicked; the payload is captured as text.
    #[error("task panicked: {0}")]
    Panic(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Runtime not initialized
    #[error("runtime not initialized - call weft::init() first")]
    NotInitialized,

    /// Runtime already initialized
    #[error("runtime already initialized")]
    AlreadyInitialized,
}

impl Error {
    /// Create a config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Turn a `catch_unwind` payload into a failure value.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        Error::Panic(message)
    }

    /// True for a pure interrupt (as opposed to a collected failure).
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::Interrupted.to_string(), "interrupted");
        assert_eq!(
            Error::Aggregate(vec![Error::Interrupted, Error::Unavailable]).to_string(),
            "2 failures collected"
        );
        assert_eq!(
            Error::config("bad tick").to_string(),
            "configuration error: bad tick"
        );
    }

    #[test]
    fn test_from_panic_payloads() {
        let e = Error::from_panic(Box::new("boom"));
        assert!(matches!(e, Error::Panic(ref m) if m == "boom"));

        let e = Error::from_panic(Box::new(String::from("kaput")));
        assert!(matches!(e, Error::Panic(ref m) if m == "kaput"));

        let e = Error::from_panic(Box::new(17u8));
        assert!(matches!(e, Error::Panic(_)));
    }
}
