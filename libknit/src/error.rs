pub use anyhow::Context;
pub use anyhow::Error;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// The kinds of failure that linking can produce. These sit at the root of an `anyhow::Error`
/// chain, so callers that care about the kind can use `error.downcast_ref::<LinkError>()`, while
/// context about which source and line we were processing is layered on top.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Duplicate or missing class declaration, or a malformed declaration / signature.
    #[error("{0}")]
    Declaration(String),

    /// A reference couldn't be bound to a declared member.
    #[error("{0}")]
    Resolution(String),

    /// Two sources in the same job declared the same class.
    #[error("class `{class}` is declared by both `{first}` and `{second}`")]
    DuplicateClass {
        class: String,
        first: String,
        second: String,
    },

    /// A source's streams were used in a way that its state machine doesn't allow.
    #[error("{0}")]
    StreamState(String),

    /// A worker thread panicked outside of normal task completion.
    #[error("worker fault: {0}")]
    WorkerFault(String),
}

/// Identifies the source and line that an error occurred on. Attached as context by the pass
/// driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub source: String,
    pub line: u32,
}

/// An error indicating that we attempted to initialise global state that can only be initialised
/// once.
#[derive(Debug, Clone, Copy)]
pub struct AlreadyInitialised;

/// Returns early with a `LinkError::Declaration`.
#[macro_export]
macro_rules! declaration_bail {
    ($($rest:tt)*) => {
        return Err($crate::error::LinkError::Declaration(format!($($rest)*)).into())
    };
}

/// Returns early with a `LinkError::Resolution`.
#[macro_export]
macro_rules! resolution_bail {
    ($($rest:tt)*) => {
        return Err($crate::error::LinkError::Resolution(format!($($rest)*)).into())
    };
}

impl LinkError {
    /// Returns the link error at the root of `error`, if any.
    pub fn of(error: &Error) -> Option<&LinkError> {
        error.downcast_ref::<LinkError>()
    }
}

/// Attaches `location` to `error` unless a location was already attached further down.
pub(crate) fn with_location(error: Error, location: impl FnOnce() -> SourceLocation) -> Error {
    if error.downcast_ref::<SourceLocation>().is_some() {
        error
    } else {
        error.context(location())
    }
}

/// Prints a warning. By using our own function for this, it'll be easier to find places that
/// issue warnings if we want to say have a flag to suppress them.
pub(crate) fn warning(message: &str) {
    tracing::warn!("{message}");
    eprintln!("WARNING: knit: {message}");
}

/// Prints `error` together with its chain of causes and exits with a failure status.
pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("knit: error: {error:?}");
    std::process::exit(1);
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.line)
    }
}

impl Display for AlreadyInitialised {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Attempted to initialise global state more than once")
    }
}

impl core::error::Error for AlreadyInitialised {}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(line: u32) -> SourceLocation {
        SourceLocation {
            source: "A.j".to_owned(),
            line,
        }
    }

    #[test]
    fn location_is_attached_once() {
        let error: Error = LinkError::Resolution("unable to resolve public member f()V".into()).into();
        let error = with_location(error, || location(3));
        let error = with_location(error, || location(9));
        assert_eq!(error.downcast_ref::<SourceLocation>(), Some(&location(3)));
        assert!(matches!(LinkError::of(&error), Some(LinkError::Resolution(_))));
        assert_eq!(
            format!("{error:#}"),
            "A.j:3: unable to resolve public member f()V"
        );
    }
}
