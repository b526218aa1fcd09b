//! Ambient resource context.
//!
//! A [`ResourceContext`] maps resource keys to bound resources for one
//! request. It is an explicit object: the session guard attaches it to the
//! request extensions, and makes it ambient for the dispatch segment through a
//! tokio task-local, so handlers several calls deep can reach it without
//! threading it through every signature.
//!
//! Task-local state travels with the task when the runtime moves it to another
//! worker thread, and is never visible from a different task. Each dispatch of
//! a request therefore sees exactly the bindings made within its own scope.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::futures::TaskLocalFuture;
use uuid::Uuid;
use view_common::{Error, Result};

tokio::task_local! {
    static AMBIENT: ResourceContext;
}

/// Identifies one kind of resource in a [`ResourceContext`].
///
/// Keys compare by identity: two keys created with the same label are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    id: Uuid,
    label: Arc<str>,
}

impl ResourceKey {
    /// Create a new unique key.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: Arc::from(label.into()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id.simple().to_string();
        write!(f, "{}#{}", self.label, &id[..8])
    }
}

type Resources = HashMap<ResourceKey, Box<dyn Any + Send>>;

/// Per-request mapping from resource key to bound resource.
///
/// Cloning is cheap and yields a handle to the same bindings. At most one
/// resource is bound per key.
#[derive(Clone, Default)]
pub struct ResourceContext {
    inner: Arc<Mutex<Resources>>,
}

impl ResourceContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// The context made ambient by an enclosing [`scope`](Self::scope), if any.
    pub fn current() -> Option<Self> {
        AMBIENT.try_with(Clone::clone).ok()
    }

    /// The ambient context, or a fresh one when none is active.
    pub fn current_or_new() -> Self {
        Self::current().unwrap_or_default()
    }

    /// Make this context ambient while `fut` runs.
    pub fn scope<F: Future>(self, fut: F) -> TaskLocalFuture<ResourceContext, F> {
        AMBIENT.scope(self, fut)
    }

    /// Make this context ambient while `f` runs on the current thread.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        AMBIENT.sync_scope(self, f)
    }

    // A panic inside `with_resource` poisons the mutex; bindings must still be
    // released afterwards, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Resources> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a resource is bound for `key`.
    pub fn has_resource(&self, key: &ResourceKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Bind `value` for `key`. Fails if something is already bound; the
    /// existing binding is left untouched and `value` is dropped.
    pub fn bind_resource<T: Any + Send>(&self, key: &ResourceKey, value: T) -> Result<()> {
        let mut resources = self.lock();
        if resources.contains_key(key) {
            return Err(Error::ResourceBound(format!(
                "{key} is already bound in this context"
            )));
        }
        resources.insert(key.clone(), Box::new(value));
        tracing::trace!(key = %key, "Bound resource");
        Ok(())
    }

    /// Bind the value built by `init` unless `key` is already bound.
    ///
    /// Returns `true` when `init` ran and its value was bound. The check and
    /// the bind happen under one lock, so of several callers sharing this
    /// context exactly one binds. `init` must not use this context.
    pub fn bind_resource_if_absent<T: Any + Send>(
        &self,
        key: &ResourceKey,
        init: impl FnOnce() -> Result<T>,
    ) -> Result<bool> {
        let mut resources = self.lock();
        if resources.contains_key(key) {
            return Ok(false);
        }
        resources.insert(key.clone(), Box::new(init()?));
        tracing::trace!(key = %key, "Bound resource");
        Ok(true)
    }

    /// Remove and return the resource bound for `key`.
    pub fn unbind_resource<T: Any + Send>(&self, key: &ResourceKey) -> Result<T> {
        let mut resources = self.lock();
        let boxed = resources
            .remove(key)
            .ok_or_else(|| Error::ResourceNotBound(format!("{key} is not bound in this context")))?;

        match boxed.downcast::<T>() {
            Ok(value) => {
                tracing::trace!(key = %key, "Unbound resource");
                Ok(*value)
            }
            Err(boxed) => {
                resources.insert(key.clone(), boxed);
                Err(type_mismatch::<T>(key))
            }
        }
    }

    /// Like [`unbind_resource`](Self::unbind_resource), but returns `None`
    /// instead of failing when nothing (or something of another type) is bound.
    pub fn unbind_resource_if_possible<T: Any + Send>(&self, key: &ResourceKey) -> Option<T> {
        self.unbind_resource(key).ok()
    }

    /// Run `f` against the resource bound for `key`.
    ///
    /// The context is locked while `f` runs; `f` must not call back into the
    /// same context.
    pub fn with_resource<T: Any + Send, R>(
        &self,
        key: &ResourceKey,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        let mut resources = self.lock();
        let boxed = resources
            .get_mut(key)
            .ok_or_else(|| Error::ResourceNotBound(format!("{key} is not bound in this context")))?;
        let value = boxed
            .downcast_mut::<T>()
            .ok_or_else(|| type_mismatch::<T>(key))?;
        Ok(f(value))
    }

    /// Keys currently bound.
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn type_mismatch<T>(key: &ResourceKey) -> Error {
    Error::Internal(format!(
        "resource bound for {key} is not a {}",
        type_name::<T>()
    ))
}

impl fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.keys().iter().map(ToString::to_string).collect();
        f.debug_struct("ResourceContext").field("bound", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_unbind() {
        let ctx = ResourceContext::new();
        let key = ResourceKey::new("db");

        assert!(!ctx.has_resource(&key));
        ctx.bind_resource(&key, 42u32).unwrap();
        assert!(ctx.has_resource(&key));
        assert_eq!(ctx.len(), 1);

        let value: u32 = ctx.unbind_resource(&key).unwrap();
        assert_eq!(value, 42);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_bind_if_absent_runs_init_once() {
        let ctx = ResourceContext::new();
        let key = ResourceKey::new("db");

        assert!(ctx.bind_resource_if_absent(&key, || Ok(1u32)).unwrap());
        let mut ran = false;
        let bound = ctx
            .bind_resource_if_absent(&key, || {
                ran = true;
                Ok(2u32)
            })
            .unwrap();

        assert!(!bound);
        assert!(!ran);
        assert_eq!(ctx.unbind_resource::<u32>(&key).unwrap(), 1);
    }

    #[test]
    fn test_bind_if_absent_failed_init_binds_nothing() {
        let ctx = ResourceContext::new();
        let key = ResourceKey::new("db");

        let err = ctx
            .bind_resource_if_absent::<u32>(&key, || Err(Error::Session("refused".into())))
            .unwrap_err();
        assert!(matches!(err, Error::Session(_)));
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_double_bind_keeps_first() {
        let ctx = ResourceContext::new();
        let key = ResourceKey::new("db");

        ctx.bind_resource(&key, "first").unwrap();
        let err = ctx.bind_resource(&key, "second").unwrap_err();
        assert!(matches!(err, Error::ResourceBound(_)));

        let value: &str = ctx.unbind_resource(&key).unwrap();
        assert_eq!(value, "first");
    }

    #[test]
    fn test_unbind_missing() {
        let ctx = ResourceContext::new();
        let key = ResourceKey::new("db");

        let err = ctx.unbind_resource::<u32>(&key).unwrap_err();
        assert!(err.is_not_bound());
        assert!(ctx.unbind_resource_if_possible::<u32>(&key).is_none());
    }

    #[test]
    fn test_unbind_wrong_type_leaves_binding() {
        let ctx = ResourceContext::new();
        let key = ResourceKey::new("db");
        ctx.bind_resource(&key, 7u8).unwrap();

        assert!(ctx.unbind_resource::<String>(&key).is_err());
        assert!(ctx.has_resource(&key));
    }

    #[test]
    fn test_keys_are_identity_based() {
        let ctx = ResourceContext::new();
        let a = ResourceKey::new("db");
        let b = ResourceKey::new("db");
        assert_ne!(a, b);

        ctx.bind_resource(&a, 1u32).unwrap();
        assert!(!ctx.has_resource(&b));
    }

    #[test]
    fn test_with_resource_mutates_in_place() {
        let ctx = ResourceContext::new();
        let key = ResourceKey::new("counter");
        ctx.bind_resource(&key, 0u32).unwrap();

        ctx.with_resource::<u32, _>(&key, |n| *n += 5).unwrap();
        let total = ctx.with_resource::<u32, _>(&key, |n| *n).unwrap();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_clones_share_bindings() {
        let ctx = ResourceContext::new();
        let other = ctx.clone();
        let key = ResourceKey::new("db");

        ctx.bind_resource(&key, 1u32).unwrap();
        assert!(other.has_resource(&key));
    }

    #[test]
    fn test_sync_scope_sets_current() {
        assert!(ResourceContext::current().is_none());

        let ctx = ResourceContext::new();
        let key = ResourceKey::new("db");
        ctx.bind_resource(&key, 1u32).unwrap();

        let seen = ctx.sync_scope(|| {
            ResourceContext::current()
                .map(|c| c.has_resource(&key))
                .unwrap_or(false)
        });
        assert!(seen);
        assert!(ResourceContext::current().is_none());
    }

    #[tokio::test]
    async fn test_scope_is_task_local() {
        let ctx = ResourceContext::new();
        let key = ResourceKey::new("db");
        ctx.bind_resource(&key, 1u32).unwrap();

        let lookup = key.clone();
        let inside = ctx
            .scope(async move {
                let here = ResourceContext::current().map(|c| c.has_resource(&lookup));
                let elsewhere = tokio::spawn(async { ResourceContext::current().is_none() })
                    .await
                    .unwrap();
                (here, elsewhere)
            })
            .await;

        assert_eq!(inside, (Some(true), true));
    }

    #[test]
    fn test_display_includes_label() {
        let key = ResourceKey::new("notes");
        assert!(key.to_string().starts_with("notes#"));
    }
}
