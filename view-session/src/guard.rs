//! The request-scoped session guard.

use std::future::Future;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use view_common::Result;

use crate::registry::AppRegistry;
use crate::resources::ResourceContext;
use crate::scope::SessionScope;
use crate::session::SessionFactoryHandle;

/// Keeps a session bound for the whole of a unit of work.
///
/// The session factory is resolved from the registry on first use and cached.
/// Concurrent first uses wait for the one resolution in flight, so every
/// caller observes the same handle.
#[derive(Debug)]
pub struct OpenSessionInView {
    registry: Arc<AppRegistry>,
    factory: OnceCell<SessionFactoryHandle>,
}

impl OpenSessionInView {
    pub fn new(registry: Arc<AppRegistry>) -> Self {
        Self {
            registry,
            factory: OnceCell::new(),
        }
    }

    /// Resolve (once) the session factory this guard binds sessions for.
    ///
    /// Fails with a configuration error when the registry has no
    /// [`SessionFactoryHandle`]. A failed resolution is retried on the next call.
    pub fn session_factory(&self) -> Result<&SessionFactoryHandle> {
        self.factory.get_or_try_init(|| {
            let handle = self.registry.require::<SessionFactoryHandle>()?;
            tracing::debug!(factory = %handle.name(), key = %handle.key(), "Resolved session factory");
            Ok((*handle).clone())
        })
    }

    /// Bind a session in `context` for as long as the returned scope lives.
    pub fn enter(&self, context: &ResourceContext) -> Result<SessionScope> {
        let factory = self.session_factory()?;
        SessionScope::enter(factory, context)
    }

    /// Run `next` with a session bound in the ambient context.
    ///
    /// Reuses the ambient context when one is active, so an outer owner's
    /// session is joined rather than replaced. The output of `next` is
    /// returned untouched; errors from this method are configuration or
    /// session-opening failures raised before `next` starts.
    pub async fn process<F: Future>(&self, next: F) -> Result<F::Output> {
        let factory = self.session_factory()?.clone();
        let context = ResourceContext::current_or_new();

        context
            .clone()
            .scope(async move {
                let _scope = SessionScope::enter(&factory, &context)?;
                Ok::<_, view_common::Error>(next.await)
            })
            .await
    }

    /// Blocking counterpart of [`process`](Self::process).
    pub fn process_sync<R>(&self, next: impl FnOnce() -> R) -> Result<R> {
        let factory = self.session_factory()?;
        let context = ResourceContext::current_or_new();

        context.clone().sync_scope(|| {
            let _scope = SessionScope::enter(factory, &context)?;
            Ok::<_, view_common::Error>(next())
        })
    }
}
