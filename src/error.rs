//! The `Error` and `Result` types used throughout this crate.

use thiserror::Error;

/// The result type returned by fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by a change stream.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// The specific condition that produced this error.
    pub kind: ErrorKind,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind }
    }

    /// Shorthand for constructing a [`Wire`](ErrorKind::Wire) error out of an opaque transport
    /// failure reported by a [`WireCursor`](crate::cursor::WireCursor) implementation.
    pub fn wire(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Wire {
            message: message.into(),
            resumable_hint: None,
        })
    }

    /// Like [`Error::wire`], but tags the error with an explicit resumability hint that a
    /// [`ResumableErrorClassifier`](crate::error::ResumableErrorClassifier) may consult instead of
    /// guessing from the message.
    pub fn wire_with_hint(message: impl Into<String>, resumable: bool) -> Self {
        Self::new(ErrorKind::Wire {
            message: message.into(),
            resumable_hint: Some(resumable),
        })
    }

    /// Returns the wire-level resumability hint attached to this error, if any.
    pub fn resumable_hint(&self) -> Option<bool> {
        match &self.kind {
            ErrorKind::Wire { resumable_hint, .. } => *resumable_hint,
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<bson::de::Error> for Error {
    fn from(e: bson::de::Error) -> Self {
        ErrorKind::Internal {
            message: format!("failed to deserialize change event: {e}"),
        }
        .into()
    }
}

/// The specific condition an [`Error`] represents.
///
/// Exactly one variant exists per row of the error table; `Wire` and `Internal` are
/// implementation-only additions for transport-layer failures and invariant violations
/// respectively.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A cursor error was classified as not resumable; the stream has been closed. Wraps the
    /// originating error's message so the specific [`WireCursor`](crate::cursor::WireCursor) error
    /// kind is preserved in the text, while still giving callers one stable kind to match on for
    /// "any other cursor error" (spec.md §7, `UnresumableError`) instead of the original, variable
    /// kind the collaborator happened to surface.
    #[error("unresumable cursor error: {message}")]
    Unresumable {
        /// A human-readable description of the underlying condition.
        message: String,
    },

    /// A change event arrived without a `_id` (resume token) field, which violates the server
    /// change-stream protocol. The stream has been closed.
    #[error("change event is missing its resume token (`_id`)")]
    MissingResumeToken,

    /// An operation was attempted on a stream that has already been closed, whether by an
    /// explicit [`close`](crate::ChangeStream::close) call, an unresumable error, or an implicit
    /// close (a `null` sentinel from the underlying cursor).
    #[error("change stream is closed")]
    ClosedStream,

    /// [`ChangeStream::into_emitter`](crate::ChangeStream::into_emitter) was called without an
    /// active cursor (the stream was already closed).
    #[error("no active cursor to attach a stream adapter to")]
    NoCursor,

    /// The stream was already committed to the other consumption mode (iterator vs. emitter).
    #[error("change stream is already in {current} mode, cannot switch to {attempted}")]
    ModeConflict {
        /// The mode the stream was already committed to.
        current: crate::controller::Mode,
        /// The mode the caller attempted to switch to.
        attempted: crate::controller::Mode,
    },

    /// The topology did not report itself connected within the resume deadline.
    #[error("topology did not reconnect within {waited_ms}ms")]
    TopologyTimeout {
        /// How long the core waited before giving up, in milliseconds.
        waited_ms: u64,
    },

    /// The parent scope a change stream was constructed against is not a valid collection,
    /// database, or cluster target.
    #[error("invalid change stream target: {message}")]
    InvalidParent {
        /// A human-readable description of what was wrong with the target.
        message: String,
    },

    /// An option bag passed by the caller was internally inconsistent, independent of any
    /// particular target (e.g. more than one resume anchor set at once).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// A human-readable description of what was wrong with the arguments.
        message: String,
    },

    /// An opaque error surfaced by a [`WireCursor`](crate::cursor::WireCursor) implementation.
    /// Whether this is resumable is for a
    /// [`ResumableErrorClassifier`](crate::error::ResumableErrorClassifier) to decide; callers can
    /// attach a hint via [`Error::wire_with_hint`] so a custom classifier doesn't have to rely on
    /// string matching.
    #[error("wire error: {message}")]
    Wire {
        /// A human-readable description of the underlying transport condition.
        message: String,
        /// An optional resumability hint attached by the collaborator that produced this error.
        resumable_hint: Option<bool>,
    },

    /// An invariant the core relies on was violated, almost always indicating a bug in a
    /// collaborator implementation rather than a runtime condition (e.g. a `WireCursor` yielding a
    /// batch after reporting itself exhausted).
    #[error("internal change stream error: {message}")]
    Internal {
        /// A human-readable description of the violated invariant.
        message: String,
    },
}

/// Classifies whether an error observed while reading from a cursor should trigger an automatic
/// resume, standing in for the driver's `isResumableError(err, wireVersion)`.
///
/// This is an external collaborator per the specification: the wire protocol's error taxonomy is
/// out of this crate's scope. [`DefaultClassifier`] ships a reasonable implementation grounded on
/// the reference driver's resumability rules so the crate is usable out of the box; callers with
/// richer error information can supply their own.
pub trait ResumableErrorClassifier: Send + Sync {
    /// Returns whether `err`, observed against a server of the given `wire_version` (if known),
    /// should trigger a resume rather than closing the stream.
    fn is_resumable(&self, err: &Error, wire_version: Option<i32>) -> bool;
}

/// The classifier used when none is supplied explicitly.
///
/// Grounded on the reference driver's `Error::is_resumable`: non-server errors (network errors,
/// connection-pool-cleared errors) are always resumable; server errors are resumable if they
/// carry the `ResumableChangeStreamError` label on wire version 9+, or one of a fixed set of
/// legacy error codes on older wire versions, or code 43 (`CursorNotFound`) unconditionally.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultClassifier;

const LEGACY_RESUMABLE_CODES: [i32; 17] = [
    6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436, 63, 150, 13388, 234, 133,
];

const CURSOR_NOT_FOUND: i32 = 43;

impl ResumableErrorClassifier for DefaultClassifier {
    fn is_resumable(&self, err: &Error, wire_version: Option<i32>) -> bool {
        match &err.kind {
            ErrorKind::Wire {
                resumable_hint: Some(hint),
                ..
            } => *hint,
            ErrorKind::Wire { message, .. } => {
                if let Some(code) = extract_code(message) {
                    if code == CURSOR_NOT_FOUND {
                        return true;
                    }
                    match wire_version {
                        Some(v) if v >= 9 => message.contains("ResumableChangeStreamError"),
                        Some(_) => LEGACY_RESUMABLE_CODES.contains(&code),
                        None => LEGACY_RESUMABLE_CODES.contains(&code),
                    }
                } else {
                    // No server code at all: treat as a bare network-level failure, which the
                    // reference driver always considers resumable.
                    true
                }
            }
            _ => false,
        }
    }
}

/// Best-effort extraction of a `code: <n>` marker from a synthetic wire-error message, used only
/// by [`DefaultClassifier`] when no explicit hint was attached. Real collaborators should prefer
/// [`Error::wire_with_hint`] over relying on this.
fn extract_code(message: &str) -> Option<i32> {
    let idx = message.find("code:")?;
    let rest = &message[idx + "code:".len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_style_errors_are_resumable() {
        let err = Error::wire("connection reset");
        assert!(DefaultClassifier.is_resumable(&err, Some(17)));
    }

    #[test]
    fn cursor_not_found_is_always_resumable() {
        let err = Error::wire("code: 43 cursor not found");
        assert!(DefaultClassifier.is_resumable(&err, Some(4)));
        assert!(DefaultClassifier.is_resumable(&err, Some(17)));
    }

    #[test]
    fn legacy_code_gates_on_wire_version() {
        let err = Error::wire("code: 91 shutting down");
        assert!(DefaultClassifier.is_resumable(&err, Some(8)));
    }

    #[test]
    fn unrecognized_code_on_new_wire_version_requires_label() {
        let err = Error::wire("code: 999 some other failure");
        assert!(!DefaultClassifier.is_resumable(&err, Some(9)));
        let labeled = Error::wire("code: 999 ResumableChangeStreamError present");
        assert!(DefaultClassifier.is_resumable(&labeled, Some(9)));
    }

    #[test]
    fn explicit_hint_overrides_heuristics() {
        let err = Error::wire_with_hint("code: 999 some other failure", true);
        assert!(DefaultClassifier.is_resumable(&err, Some(20)));
    }
}
