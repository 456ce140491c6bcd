// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Locks used by the dataplane.
//!
//! These wrap the std primitives. Poisoning is ignored and the
//! guarded data is handed back as-is.

use core::ops::Deref;
use core::ops::DerefMut;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::TryLockError;

#[derive(Debug)]
pub struct NfMutex<T> {
    inner: Mutex<T>,
}

pub struct NfMutexGuard<'a, T: 'a> {
    guard: std::sync::MutexGuard<'a, T>,
}

/// Returned by [`NfMutex::try_lock()`] when another thread holds the
/// lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LockTaken;

impl<T> Deref for NfMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for NfMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> NfMutex<T> {
    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn new(val: T) -> Self {
        NfMutex { inner: Mutex::new(val) }
    }

    pub fn lock(&self) -> NfMutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        NfMutexGuard { guard }
    }

    pub fn try_lock(&self) -> Result<NfMutexGuard<'_, T>, LockTaken> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(NfMutexGuard { guard }),
            Err(TryLockError::Poisoned(p)) => {
                Ok(NfMutexGuard { guard: p.into_inner() })
            }
            Err(TryLockError::WouldBlock) => Err(LockTaken),
        }
    }
}

#[derive(Debug)]
pub struct NfRwLock<T> {
    inner: RwLock<T>,
}

pub struct NfRwLockReadGuard<'a, T: 'a> {
    guard: std::sync::RwLockReadGuard<'a, T>,
}

pub struct NfRwLockWriteGuard<'a, T: 'a> {
    guard: std::sync::RwLockWriteGuard<'a, T>,
}

impl<T> Deref for NfRwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> Deref for NfRwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for NfRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> NfRwLock<T> {
    pub fn new(val: T) -> Self {
        NfRwLock { inner: RwLock::new(val) }
    }

    pub fn read(&self) -> NfRwLockReadGuard<'_, T> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        NfRwLockReadGuard { guard }
    }

    pub fn write(&self) -> NfRwLockWriteGuard<'_, T> {
        let guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        NfRwLockWriteGuard { guard }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn survives_poison() {
        let m = Arc::new(NfMutex::new(7u32));
        let m2 = m.clone();
        let _ = std::thread::spawn(move || {
            let _g = m2.lock();
            panic!("poison the lock");
        })
        .join();

        assert_eq!(*m.lock(), 7);
    }

    #[test]
    fn try_lock_taken() {
        let m = NfMutex::new(());
        let _g = m.lock();
        assert_eq!(m.try_lock().err(), Some(LockTaken));
    }

    #[test]
    fn debug_shows_guarded_data() {
        let m = NfMutex::new(7u32);
        assert!(format!("{m:?}").contains('7'));
        let rw = NfRwLock::new("ready");
        assert!(format!("{rw:?}").contains("ready"));
    }
}
