//! Optional audit hooks.
//!
//! Every hook is best effort: an `Err` or a panic from a hook is logged and
//! swallowed, so hooks can never change the outcome of the operation that
//! fired them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Result returned by a hook.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Identity-level event (registration, login).
#[derive(Debug, Clone, Copy)]
pub struct UserEvent<'a> {
    /// Username concerned
    pub username: &'a str,
}

/// End of a connection, authenticated or not.
#[derive(Debug, Clone, Copy)]
pub struct DisconnectEvent<'a> {
    /// Username if the connection authenticated
    pub username: Option<&'a str>,
}

/// A failed operation.
#[derive(Debug, Clone, Copy)]
pub struct ErrorEvent<'a> {
    /// Username if known
    pub username: Option<&'a str>,
    /// Operation that failed, e.g. `CLOSE`
    pub operation: &'a str,
    /// Rendered error
    pub message: &'a str,
}

/// A completed object operation.
#[derive(Debug, Clone, Copy)]
pub struct ObjectEvent<'a> {
    /// Username that performed the operation
    pub username: &'a str,
    /// Path as requested by the client
    pub path: &'a str,
    /// Storage key touched
    pub key: &'a str,
}

/// Observer for user and object lifecycle events.
///
/// All methods default to doing nothing; implement only the ones you need.
pub trait Callbacks: Send + Sync {
    /// An identity was registered.
    fn on_add_user(&self, _event: &UserEvent<'_>) -> CallbackResult {
        Ok(())
    }

    /// A connection completed authentication.
    fn on_login(&self, _event: &UserEvent<'_>) -> CallbackResult {
        Ok(())
    }

    /// A connection ended.
    fn on_disconnect(&self, _event: &DisconnectEvent<'_>) -> CallbackResult {
        Ok(())
    }

    /// An operation failed.
    fn on_error(&self, _event: &ErrorEvent<'_>) -> CallbackResult {
        Ok(())
    }

    /// An upload finished and is durable.
    fn on_put(&self, _event: &ObjectEvent<'_>) -> CallbackResult {
        Ok(())
    }

    /// A download served its final byte range.
    fn on_get(&self, _event: &ObjectEvent<'_>) -> CallbackResult {
        Ok(())
    }

    /// A directory marker was created.
    fn on_mkdir(&self, _event: &ObjectEvent<'_>) -> CallbackResult {
        Ok(())
    }

    /// A directory marker was removed.
    fn on_rmdir(&self, _event: &ObjectEvent<'_>) -> CallbackResult {
        Ok(())
    }
}

/// Fault-isolating dispatcher around an optional [`Callbacks`] implementation.
#[derive(Clone, Default)]
pub struct Hooks {
    callbacks: Option<Arc<dyn Callbacks>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("installed", &self.callbacks.is_some())
            .finish()
    }
}

impl Hooks {
    /// Dispatcher with no callbacks installed.
    pub fn none() -> Self {
        Self::default()
    }

    /// Dispatcher for `callbacks`.
    pub fn new(callbacks: Arc<dyn Callbacks>) -> Self {
        Self {
            callbacks: Some(callbacks),
        }
    }

    fn fire<F>(&self, hook: &'static str, call: F)
    where
        F: FnOnce(&dyn Callbacks) -> CallbackResult,
    {
        let Some(ref callbacks) = self.callbacks else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| call(callbacks.as_ref()))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(hook, error = %e, "callback failed"),
            Err(_) => tracing::error!(hook, "callback panicked"),
        }
    }

    pub(crate) fn add_user(&self, username: &str) {
        self.fire("on_add_user", |c| c.on_add_user(&UserEvent { username }));
    }

    pub(crate) fn login(&self, username: &str) {
        self.fire("on_login", |c| c.on_login(&UserEvent { username }));
    }

    pub(crate) fn disconnect(&self, username: Option<&str>) {
        self.fire("on_disconnect", |c| {
            c.on_disconnect(&DisconnectEvent { username })
        });
    }

    pub(crate) fn error(&self, username: Option<&str>, operation: &str, message: &str) {
        self.fire("on_error", |c| {
            c.on_error(&ErrorEvent {
                username,
                operation,
                message,
            })
        });
    }

    pub(crate) fn put(&self, event: ObjectEvent<'_>) {
        self.fire("on_put", |c| c.on_put(&event));
    }

    pub(crate) fn get(&self, event: ObjectEvent<'_>) {
        self.fire("on_get", |c| c.on_get(&event));
    }

    pub(crate) fn mkdir(&self, event: ObjectEvent<'_>) {
        self.fire("on_mkdir", |c| c.on_mkdir(&event));
    }

    pub(crate) fn rmdir(&self, event: ObjectEvent<'_>) {
        self.fire("on_rmdir", |c| c.on_rmdir(&event));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Callbacks for Recorder {
        fn on_login(&self, event: &UserEvent<'_>) -> CallbackResult {
            self.seen.lock().unwrap().push(format!("login {}", event.username));
            Ok(())
        }

        fn on_put(&self, _event: &ObjectEvent<'_>) -> CallbackResult {
            Err("audit sink unavailable".into())
        }

        fn on_get(&self, _event: &ObjectEvent<'_>) -> CallbackResult {
            panic!("hook exploded");
        }
    }

    #[test]
    fn test_hooks_dispatch() {
        let recorder = Arc::new(Recorder::default());
        let hooks = Hooks::new(recorder.clone());
        hooks.login("alice");
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["login alice"]);
    }

    #[test]
    fn test_failing_hooks_are_isolated() {
        let hooks = Hooks::new(Arc::new(Recorder::default()));
        let event = ObjectEvent {
            username: "alice",
            path: "/a",
            key: "alice/a",
        };
        hooks.put(event);
        hooks.get(event);
        hooks.disconnect(None);
    }

    #[test]
    fn test_no_callbacks_installed() {
        let hooks = Hooks::none();
        hooks.add_user("alice");
        hooks.error(Some("alice"), "READ", "boom");
    }
}
