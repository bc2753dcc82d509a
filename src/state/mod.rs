//! Typed blackboard shared by the steps of a single build.
//!
//! Steps communicate exclusively through a [`StateBag`]. Each entry is
//! addressed by a [`StateKey`], a string name paired with the value type at
//! compile time, so a consumer cannot read a key back as the wrong type
//! without the mismatch surfacing as a [`StateError`]. Well-known keys live
//! in [`keys`]; builders declare their own with [`StateKey::new`].
//!
//! The two reserved flags, cancelled and halted, are monotonic: once set
//! they stay set for the lifetime of the bag.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

pub mod keys;

type Entry = Arc<dyn Any + Send + Sync>;

/// Name of a state bag entry together with the type stored under it.
pub struct StateKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    /// Declares a key. Two keys with the same name address the same entry.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Returns the key's string name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateKey").field(&self.name).finish()
    }
}

/// Errors raised by [`StateBag::get_ok`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StateError {
    /// Nothing has been stored under the key.
    #[error("state key `{key}` is not set")]
    Missing {
        /// Name of the missing key.
        key: &'static str,
    },
    /// A value is stored but has a different type than the key declares.
    #[error("state key `{key}` holds a value of an unexpected type")]
    TypeMismatch {
        /// Name of the mismatched key.
        key: &'static str,
    },
}

#[derive(Default)]
struct Inner {
    values: RwLock<HashMap<&'static str, Entry>>,
    cancelled: AtomicBool,
    halted: AtomicBool,
}

/// Concurrent key/value store carrying per-build scratch state.
///
/// Cloning a bag yields another handle to the same storage.
#[derive(Clone, Default)]
pub struct StateBag {
    inner: Arc<Inner>,
}

impl StateBag {
    /// Creates an empty bag with both flags cleared.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put<T: Any + Send + Sync>(&self, key: StateKey<T>, value: T) {
        self.put_arc(key, Arc::new(value));
    }

    /// Stores an already shared value under `key`.
    pub fn put_arc<T: Any + Send + Sync>(&self, key: StateKey<T>, value: Arc<T>) {
        self.inner
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.name, value);
    }

    /// Returns the value stored under `key`, or `None` when it is absent or
    /// was stored with a different type.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: StateKey<T>) -> Option<Arc<T>> {
        self.get_ok(key).ok()
    }

    /// Returns the value stored under `key`, distinguishing an absent key
    /// from a type mismatch.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Missing`] when nothing is stored and
    /// [`StateError::TypeMismatch`] when the stored value has another type.
    pub fn get_ok<T: Any + Send + Sync>(&self, key: StateKey<T>) -> Result<Arc<T>, StateError> {
        let entry = self
            .inner
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key.name)
            .cloned()
            .ok_or(StateError::Missing { key: key.name })?;
        entry
            .downcast::<T>()
            .map_err(|_| StateError::TypeMismatch { key: key.name })
    }

    /// Returns a clone of the value stored under `key`.
    #[must_use]
    pub fn get_cloned<T: Any + Send + Sync + Clone>(&self, key: StateKey<T>) -> Option<T> {
        self.get(key).map(|value| (*value).clone())
    }

    /// Returns `true` when any value is stored under `key`'s name.
    #[must_use]
    pub fn contains<T>(&self, key: StateKey<T>) -> bool {
        self.inner
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key.name)
    }

    /// Removes the entry stored under `key`, returning whether one existed.
    pub fn remove<T>(&self, key: StateKey<T>) -> bool {
        self.inner
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key.name)
            .is_some()
    }

    /// Returns the sorted names of every stored entry.
    #[must_use]
    pub fn keys(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .inner
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        names.sort_unstable();
        names
    }

    /// Sets the cancelled flag.
    pub fn mark_cancelled(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once cancellation has been recorded.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sets the halted flag.
    pub fn mark_halted(&self) {
        self.inner.halted.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once a step has halted the build.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for StateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBag")
            .field("keys", &self.keys())
            .field("cancelled", &self.is_cancelled())
            .field("halted", &self.is_halted())
            .finish()
    }
}
