//! Scoped session acquisition.
//!
//! [`SessionScope::enter`] either opens and binds a session (owner) or finds
//! one already bound and participates. Dropping the scope releases what it
//! acquired: the owner unbinds and closes, a participant does nothing. Drop
//! runs on normal exit, on error returns, while unwinding from a panic, and
//! when an enclosing future is cancelled.

use view_common::Result;

use crate::resources::{ResourceContext, ResourceKey};
use crate::session::{FlushMode, SessionFactoryHandle, SessionHolder};

/// How a scope relates to the session bound for its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participation {
    /// Opened and bound the session; closes it on exit.
    Owner,
    /// Found a session already bound; leaves it alone.
    Participant,
}

/// Guard that keeps a session bound for as long as it lives.
#[must_use = "the session is released as soon as the scope is dropped"]
#[derive(Debug)]
pub struct SessionScope {
    context: ResourceContext,
    key: ResourceKey,
    factory: String,
    participation: Participation,
}

impl SessionScope {
    /// Ensure a session for `factory` is bound in `context`.
    ///
    /// New sessions are switched to [`FlushMode::Manual`]: nothing is written
    /// back unless the code using the session flushes explicitly.
    pub fn enter(factory: &SessionFactoryHandle, context: &ResourceContext) -> Result<Self> {
        let key = factory.key().clone();

        let owner = context.bind_resource_if_absent(&key, || {
            let mut session = factory.open_session()?;
            session.set_flush_mode(FlushMode::Manual);
            tracing::debug!(
                factory = %factory.name(),
                session = %session.id(),
                "Opening session in view"
            );
            Ok(SessionHolder::new(session))
        })?;

        let participation = if owner {
            Participation::Owner
        } else {
            tracing::trace!(factory = %factory.name(), "Participating in existing session");
            Participation::Participant
        };

        Ok(Self {
            context: context.clone(),
            key,
            factory: factory.name().to_string(),
            participation,
        })
    }

    pub fn participation(&self) -> Participation {
        self.participation
    }

    pub fn is_owner(&self) -> bool {
        self.participation == Participation::Owner
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn context(&self) -> &ResourceContext {
        &self.context
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        if self.participation != Participation::Owner {
            return;
        }

        match self.context.unbind_resource::<SessionHolder>(&self.key) {
            Ok(holder) => {
                let mut session = holder.into_session();
                tracing::debug!(
                    factory = %self.factory,
                    session = %session.id(),
                    "Closing session in view"
                );
                if let Err(e) = session.close() {
                    tracing::warn!(
                        factory = %self.factory,
                        session = %session.id(),
                        error = %e,
                        "Failed to close session"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    factory = %self.factory,
                    error = %e,
                    "Session was unbound before its scope ended"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteSessionFactory;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn handle(dir: &TempDir) -> (SessionFactoryHandle, Arc<SqliteSessionFactory>) {
        let factory = Arc::new(
            SqliteSessionFactory::open(dir.path().join("scope.db"), "SELECT 1;").unwrap(),
        );
        (SessionFactoryHandle::from_arc(factory.clone()), factory)
    }

    #[test]
    fn test_owner_binds_then_releases() {
        let dir = TempDir::new().unwrap();
        let (handle, factory) = handle(&dir);
        let ctx = ResourceContext::new();

        {
            let scope = SessionScope::enter(&handle, &ctx).unwrap();
            assert!(scope.is_owner());
            assert!(ctx.has_resource(handle.key()));
            let mode = ctx
                .with_resource::<SessionHolder, _>(handle.key(), |h| h.session().flush_mode())
                .unwrap();
            assert_eq!(mode, FlushMode::Manual);
            assert_eq!(factory.live_sessions(), 1);
        }

        assert!(ctx.is_empty());
        assert_eq!(factory.live_sessions(), 0);
    }

    #[test]
    fn test_nested_scope_participates() {
        let dir = TempDir::new().unwrap();
        let (handle, factory) = handle(&dir);
        let ctx = ResourceContext::new();

        let outer = SessionScope::enter(&handle, &ctx).unwrap();
        {
            let inner = SessionScope::enter(&handle, &ctx).unwrap();
            assert_eq!(inner.participation(), Participation::Participant);
        }
        assert!(ctx.has_resource(handle.key()));
        assert_eq!(factory.sessions_opened(), 1);

        drop(outer);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_concurrent_entry_on_shared_context() {
        use std::sync::Barrier;

        const THREADS: usize = 8;
        let dir = TempDir::new().unwrap();
        let (handle, factory) = handle(&dir);
        let ctx = ResourceContext::new();
        let entered = Barrier::new(THREADS);
        let release = Barrier::new(THREADS);

        let owners = std::thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        entered.wait();
                        let scope = SessionScope::enter(&handle, &ctx).unwrap();
                        let owner = scope.is_owner();
                        release.wait();
                        owner
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap())
                .filter(|owner| *owner)
                .count()
        });

        assert_eq!(owners, 1);
        assert_eq!(factory.sessions_opened(), 1);
        assert_eq!(factory.live_sessions(), 0);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_release_on_panic() {
        let dir = TempDir::new().unwrap();
        let (handle, factory) = handle(&dir);
        let ctx = ResourceContext::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = SessionScope::enter(&handle, &ctx).unwrap();
            panic!("handler blew up");
        }));

        assert!(result.is_err());
        assert!(ctx.is_empty());
        assert_eq!(factory.live_sessions(), 0);
    }
}
