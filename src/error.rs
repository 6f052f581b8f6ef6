use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use static_assertions::assert_impl_all;

pub(crate) type PanicPayload = Box<dyn Any + Send + 'static>;

/// Outcome of reading a tasklet or worker-thread result.
///
/// Failures are shared: one panic inside a coroutine body reaches the
/// `failed` signal and every reader of the value, so the payload lives
/// behind a shared cell and the error clones cheaply.
pub struct TaskError {
    kind: Kind,
}

enum Kind {
    NotFinished,
    Consumed,
    Panicked { message: Option<Arc<str>>, payload: Arc<Mutex<Option<PanicPayload>>> },
}

assert_impl_all!(TaskError: Send, Sync);

impl TaskError {
    pub(crate) fn not_finished() -> TaskError {
        TaskError { kind: Kind::NotFinished }
    }

    pub(crate) fn consumed() -> TaskError {
        TaskError { kind: Kind::Consumed }
    }

    pub(crate) fn panicked(payload: PanicPayload) -> TaskError {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            Some(Arc::<str>::from(*s))
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Some(Arc::<str>::from(s.as_str()))
        } else {
            None
        };
        TaskError { kind: Kind::Panicked { message, payload: Arc::new(Mutex::new(Some(payload))) } }
    }

    /// Returns true if this error carries a captured panic.
    pub fn is_panic(&self) -> bool {
        matches!(self.kind, Kind::Panicked { .. })
    }

    /// Returns true if the tasklet had not finished when it was read.
    pub fn is_not_finished(&self) -> bool {
        matches!(self.kind, Kind::NotFinished)
    }

    /// Returns true if the value was already taken by an earlier read.
    pub fn is_consumed(&self) -> bool {
        matches!(self.kind, Kind::Consumed)
    }

    /// Panic message, when the payload was a string.
    pub fn message(&self) -> Option<&str> {
        match &self.kind {
            Kind::Panicked { message, .. } => message.as_deref(),
            _ => None,
        }
    }

    /// Surrenders the captured panic payload, for [std::panic::resume_unwind].
    ///
    /// Returns `None` if this error is not a panic or a sibling clone already
    /// took the payload.
    pub fn into_panic(self) -> Option<PanicPayload> {
        match self.kind {
            Kind::Panicked { payload, .. } => payload.lock().unwrap().take(),
            _ => None,
        }
    }
}

impl Clone for TaskError {
    fn clone(&self) -> TaskError {
        let kind = match &self.kind {
            Kind::NotFinished => Kind::NotFinished,
            Kind::Consumed => Kind::Consumed,
            Kind::Panicked { message, payload } => {
                Kind::Panicked { message: message.clone(), payload: payload.clone() }
            },
        };
        TaskError { kind }
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::NotFinished => f.write_str("TaskError::NotFinished"),
            Kind::Consumed => f.write_str("TaskError::Consumed"),
            Kind::Panicked { message, .. } => {
                write!(f, "TaskError::Panicked({:?})", message.as_deref().unwrap_or(".."))
            },
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::NotFinished => f.write_str("not finished yet"),
            Kind::Consumed => f.write_str("result already taken"),
            Kind::Panicked { message, .. } => {
                write!(f, "panic({:?})", message.as_deref().unwrap_or(".."))
            },
        }
    }
}

impl std::error::Error for TaskError {}

#[cfg(test)]
mod tests {
    use std::panic;

    use pretty_assertions::assert_eq;

    use super::*;

    fn capture(f: impl FnOnce() + panic::UnwindSafe) -> TaskError {
        TaskError::panicked(panic::catch_unwind(f).unwrap_err())
    }

    #[test]
    fn panic_str_message() {
        let err = capture(|| panic!("boom"));
        assert!(err.is_panic());
        assert_eq!(err.message(), Some("boom"));
        assert_eq!(err.to_string(), r#"panic("boom")"#);
    }

    #[test]
    fn panic_string_message() {
        let err = capture(|| panic!("count: {}", 3));
        assert_eq!(err.message(), Some("count: 3"));
    }

    #[test]
    fn clone_shares_payload() {
        let err = capture(|| panic!("once"));
        let sibling = err.clone();
        assert!(err.into_panic().is_some());
        assert!(sibling.into_panic().is_none());
    }

    #[test]
    fn misuse_kinds() {
        assert!(TaskError::not_finished().is_not_finished());
        assert!(TaskError::consumed().is_consumed());
        assert!(!TaskError::consumed().is_panic());
        assert!(TaskError::not_finished().into_panic().is_none());
    }
}
