//! Error router: republishes native error callbacks to subscribers.
//!
//! The native collaborator reports three kinds of failure asynchronously and
//! from any thread: context/internal errors (code, function, description),
//! shader compile errors and program run errors (description only). The
//! router decodes them into [`NativeError`] values and hands each one to the
//! subscribers registered at publish time. Nothing is buffered: with zero
//! subscribers a publish only logs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Category of an asynchronous native error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Internal,
    ShaderCompile,
    ProgramRun,
}

/// A decoded native error notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub kind: ErrorKind,
    /// Rendered message. Internal errors render as `<code> @ '<function>': <description>`.
    pub message: String,
    /// Native error identifier (internal errors only).
    pub code: Option<String>,
    /// Native function that raised the error (internal errors only).
    pub function: Option<String>,
}

impl NativeError {
    pub fn internal(code: &str, function: &str, description: &str) -> Self {
        NativeError {
            kind: ErrorKind::Internal,
            message: format!("{} @ '{}': {}", code, function, description),
            code: Some(code.to_string()),
            function: Some(function.to_string()),
        }
    }

    pub fn shader_compile(description: &str) -> Self {
        NativeError {
            kind: ErrorKind::ShaderCompile,
            message: description.to_string(),
            code: None,
            function: None,
        }
    }

    pub fn program_run(description: &str) -> Self {
        NativeError {
            kind: ErrorKind::ProgramRun,
            message: description.to_string(),
            code: None,
            function: None,
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

/// Handle returned by [`ErrorRouter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&NativeError) + Send + Sync>;

/// Multi-subscriber notification channel for native errors.
pub struct ErrorRouter {
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl Default for ErrorRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorRouter {
    pub fn new() -> Self {
        ErrorRouter {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register an observer. It receives every error published after this call.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&NativeError) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver `error` to the current subscribers, in subscription order.
    pub fn publish(&self, error: NativeError) {
        log::warn!("native error: {}", error);

        // Snapshot so observers may (un)subscribe from inside the callback.
        let observers: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        for observer in observers {
            observer(&error);
        }
    }

    pub fn publish_internal(&self, code: &str, function: &str, description: &str) {
        self.publish(NativeError::internal(code, function, description));
    }

    pub fn publish_compile(&self, description: &str) {
        self.publish(NativeError::shader_compile(description));
    }

    pub fn publish_run(&self, description: &str) {
        self.publish(NativeError::program_run(description));
    }
}

// ---------------------------------------------------------------------------
// Process-wide sink for C callbacks
// ---------------------------------------------------------------------------

// C callbacks carry no user data, so they route through this slot.
static PROCESS_SINK: RwLock<Option<Arc<ErrorRouter>>> = parking_lot::const_rwlock(None);

/// Point the process-wide native callbacks at `router`.
pub(crate) fn install_process_sink(router: Arc<ErrorRouter>) {
    *PROCESS_SINK.write() = Some(router);
}

pub(crate) fn process_sink() -> Option<Arc<ErrorRouter>> {
    PROCESS_SINK.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_internal_message_format() {
        let err = NativeError::internal("65544", "glfwInit", "no display");
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.message, "65544 @ 'glfwInit': no display");
        assert_eq!(err.function.as_deref(), Some("glfwInit"));
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let router = ErrorRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = Arc::clone(&seen);
        router.subscribe(move |e| a.lock().push(("a", e.kind)));
        let b = Arc::clone(&seen);
        router.subscribe(move |e| b.lock().push(("b", e.kind)));

        router.publish_compile("syntax error");
        router.publish_run("device lost");

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                ("a", ErrorKind::ShaderCompile),
                ("b", ErrorKind::ShaderCompile),
                ("a", ErrorKind::ProgramRun),
                ("b", ErrorKind::ProgramRun),
            ]
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let router = ErrorRouter::new();
        router.publish_internal("1", "f", "nobody listening");
        assert_eq!(router.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let router = ErrorRouter::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let id = router.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        router.publish_run("first");
        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));
        router.publish_run("second");

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscriber_may_unsubscribe_itself() {
        let router = Arc::new(ErrorRouter::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let r = Arc::clone(&router);
        let s = Arc::clone(&slot);
        let id = router.subscribe(move |_| {
            if let Some(id) = s.lock().take() {
                r.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        router.publish_compile("once");
        assert_eq!(router.subscriber_count(), 0);
    }
}
