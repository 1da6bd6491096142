//! Synchronization primitives.
//!
//! - [`SpinLock`]: a busy-waiting mutual exclusion lock. Critical sections
//!   guarded by it must stay short; it protects the frame table, each page's
//!   state and the file-system serialization lock.
//! - [`Semaphore`]: a counting semaphore combined with the resource it
//!   protects. It blocks by spinning with exponential backoff, so it is safe
//!   to use from any thread that the embedding scheduler preempts.
//!
//! A semaphore created with zero permits serves as a one-shot event: one
//! thread [`signal`]s, another [`wait`]s. The fork and exit handshakes are
//! built this way.
//!
//! [`signal`]: Semaphore::signal
//! [`wait`]: Semaphore::wait

use core::ops::Deref;
use crossbeam_utils::Backoff;

pub use spin::{Mutex as SpinLock, MutexGuard as SpinLockGuard};

/// Counting semaphore.
///
/// A semaphore maintains a set of permits and resource. Permits are used to
/// synchronize access to a shared resource. A semaphore differs from a mutex in
/// that it can allow more than one concurrent caller to access the shared
/// resource at a time.
pub struct Semaphore<T> {
    resource: T,
    permits: SpinLock<usize>,
}

impl<T> Semaphore<T> {
    /// Creates a new semaphore initialized with a specified number of permits.
    ///
    /// # Arguments
    ///
    /// * `permits` - The initial number of available permits.
    /// * `resource` - A resource combined with this semaphore.
    pub const fn new(permits: usize, resource: T) -> Self {
        Self {
            resource,
            permits: SpinLock::new(permits),
        }
    }

    /// Waits until a permit becomes available and then acquires it.
    ///
    /// This method returns a [`SemaphorePermits`] RAII guard. When the guard is
    /// dropped, it will automatically release the acquired permit.
    pub fn wait(&self) -> SemaphorePermits<'_, T> {
        let backoff = Backoff::new();
        loop {
            {
                let mut permits = self.permits.lock();
                if *permits > 0 {
                    *permits -= 1;
                    return SemaphorePermits { sema: self };
                }
            }
            backoff.snooze();
        }
    }

    /// Acquires a permit without releasing it on drop.
    ///
    /// Used to consume a one-shot event.
    pub fn take(&self) {
        core::mem::forget(self.wait());
    }

    /// Releases a permit back to the semaphore.
    pub fn signal(&self) {
        *self.permits.lock() += 1;
    }
}

/// An RAII implementation of a "scoped semaphore". When this structure
/// is dropped (falls out of scope), the semaphore will be signaled.
///
/// This structure is created by the [`wait`] method on [`Semaphore`].
///
/// [`wait`]: Semaphore::wait
pub struct SemaphorePermits<'a, T> {
    sema: &'a Semaphore<T>,
}

impl<T> Deref for SemaphorePermits<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.sema.resource
    }
}

impl<T> Drop for SemaphorePermits<'_, T> {
    fn drop(&mut self) {
        self.sema.signal()
    }
}
