use std::sync::{Mutex, MutexGuard, PoisonError};

// Critical sections never leave shared state half-written, so a poisoned lock
// is still safe to read.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
