//! Application-wide registry of shared components, looked up by type.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use view_common::{Error, Result};

type Entry = Arc<dyn Any + Send + Sync>;

/// Type-keyed registry populated at startup and read by request-time components.
#[derive(Default)]
pub struct AppRegistry {
    entries: RwLock<HashMap<TypeId, Entry>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value`, replacing any previous value of the same type.
    pub fn register<T: Any + Send + Sync>(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), value.clone());
        tracing::debug!(component = type_name::<T>(), "Registered component");
        value
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())
            .cloned()?;
        entry.downcast::<T>().ok()
    }

    /// Look up `T`, failing with a configuration error if it was never registered.
    pub fn require<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        self.get::<T>().ok_or_else(|| {
            Error::Config(format!(
                "no {} registered in the application registry",
                type_name::<T>()
            ))
        })
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<T>())
    }
}

impl std::fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("AppRegistry").field("entries", &len).finish()
    }
}
