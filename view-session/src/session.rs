//! Session and session factory abstractions.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use view_common::{Error, Result};

use crate::resources::{ResourceContext, ResourceKey};

/// When a session writes staged changes back to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Flush before queries and on close.
    #[default]
    Auto,
    /// Flush on close only.
    Commit,
    /// Flush only when `flush()` is called explicitly.
    Manual,
}

/// A unit-of-work handle to a data backend.
///
/// Sessions are not shareable between threads; they may be moved.
pub trait Session: Send {
    fn id(&self) -> &str;

    fn flush_mode(&self) -> FlushMode;

    fn set_flush_mode(&mut self, mode: FlushMode);

    fn is_open(&self) -> bool;

    /// Write staged changes back.
    fn flush(&mut self) -> Result<()>;

    /// Release the session. Closing twice is an error.
    fn close(&mut self) -> Result<()>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Produces sessions.
pub trait SessionFactory: Send + Sync {
    fn name(&self) -> &str;

    fn open_session(&self) -> Result<Box<dyn Session>>;
}

/// Shared handle to a session factory plus the key its sessions are bound under.
#[derive(Clone)]
pub struct SessionFactoryHandle {
    key: ResourceKey,
    factory: Arc<dyn SessionFactory>,
}

impl SessionFactoryHandle {
    pub fn new(factory: impl SessionFactory + 'static) -> Self {
        Self::from_arc(Arc::new(factory))
    }

    pub fn from_arc(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            key: ResourceKey::new(factory.name().to_string()),
            factory,
        }
    }

    /// Key under which this factory's sessions are bound.
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        self.factory.name()
    }

    pub fn factory(&self) -> &Arc<dyn SessionFactory> {
        &self.factory
    }

    pub fn open_session(&self) -> Result<Box<dyn Session>> {
        self.factory.open_session()
    }
}

impl fmt::Debug for SessionFactoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactoryHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Wrapper bound into a [`ResourceContext`] around one live session.
pub struct SessionHolder {
    session: Box<dyn Session>,
    opened_at: DateTime<Utc>,
}

impl SessionHolder {
    pub fn new(session: Box<dyn Session>) -> Self {
        Self {
            session,
            opened_at: Utc::now(),
        }
    }

    pub fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> &mut dyn Session {
        self.session.as_mut()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn into_session(self) -> Box<dyn Session> {
        self.session
    }
}

impl fmt::Debug for SessionHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHolder")
            .field("session", &self.session.id())
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

/// Run `f` against the session bound for `factory` in the ambient context.
pub fn with_current_session<R>(
    factory: &SessionFactoryHandle,
    f: impl FnOnce(&mut dyn Session) -> R,
) -> Result<R> {
    let context = ResourceContext::current().ok_or_else(|| {
        Error::ResourceNotBound(format!(
            "no resource context is active for {}",
            factory.key()
        ))
    })?;
    context.with_resource::<SessionHolder, _>(factory.key(), |holder| f(holder.session_mut()))
}

/// Like [`with_current_session`], downcasting the session to its concrete type.
pub fn with_current_session_as<S: Session + 'static, R>(
    factory: &SessionFactoryHandle,
    f: impl FnOnce(&mut S) -> R,
) -> Result<R> {
    with_current_session(factory, |session| {
        session.as_any_mut().downcast_mut::<S>().map(f)
    })?
    .ok_or_else(|| Error::Session(format!("bound session is not a {}", type_name::<S>())))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSession {
        mode: FlushMode,
        open: bool,
    }

    impl Session for NullSession {
        fn id(&self) -> &str {
            "null"
        }
        fn flush_mode(&self) -> FlushMode {
            self.mode
        }
        fn set_flush_mode(&mut self, mode: FlushMode) {
            self.mode = mode;
        }
        fn is_open(&self) -> bool {
            self.open
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            self.open = false;
            Ok(())
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct NullFactory;

    impl SessionFactory for NullFactory {
        fn name(&self) -> &str {
            "null"
        }
        fn open_session(&self) -> Result<Box<dyn Session>> {
            Ok(Box::new(NullSession {
                mode: FlushMode::Auto,
                open: true,
            }))
        }
    }

    #[test]
    fn test_handles_share_key_when_cloned() {
        let handle = SessionFactoryHandle::new(NullFactory);
        let clone = handle.clone();
        assert_eq!(handle.key(), clone.key());
        assert_eq!(handle.key().label(), "null");

        let other = SessionFactoryHandle::new(NullFactory);
        assert_ne!(handle.key(), other.key());
    }

    #[test]
    fn test_with_current_session_outside_scope() {
        let handle = SessionFactoryHandle::new(NullFactory);
        let err = with_current_session(&handle, |_| ()).unwrap_err();
        assert!(err.is_not_bound());
    }

    #[test]
    fn test_with_current_session_as_downcasts() {
        let handle = SessionFactoryHandle::new(NullFactory);
        let ctx = ResourceContext::new();
        let session = handle.open_session().unwrap();
        ctx.bind_resource(handle.key(), SessionHolder::new(session))
            .unwrap();

        let mode = ctx.sync_scope(|| {
            with_current_session_as::<NullSession, _>(&handle, |s| {
                s.set_flush_mode(FlushMode::Manual);
                s.mode
            })
        });
        assert_eq!(mode.unwrap(), FlushMode::Manual);
    }

    #[test]
    fn test_flush_mode_serde() {
        let json = serde_json::to_string(&FlushMode::Manual).unwrap();
        assert_eq!(json, "\"manual\"");
    }
}
