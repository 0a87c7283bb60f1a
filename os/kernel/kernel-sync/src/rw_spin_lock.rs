use core::{
    cell::UnsafeCell,
    fmt,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

/// Set while a writer holds the lock.
const WRITER: u32 = 1 << 31;
/// Set while a writer waits; new readers back off.
const WRITER_WAITING: u32 = 1 << 30;
/// Remaining bits count active readers.
const READER_MASK: u32 = WRITER_WAITING - 1;

/// Reader/writer spin lock.
///
/// Any number of readers may hold the lock at once; a writer excludes
/// everyone. Once a writer starts waiting, readers that have not yet entered
/// spin until the writer is done, so a steady stream of readers cannot starve
/// structural updates.
pub struct RwSpinLock<T> {
    state: AtomicU32,
    inner: UnsafeCell<T>,
}

// Safety: readers share &T across threads (T: Sync), a writer may move the
// value's ownership effects across threads (T: Send).
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}
unsafe impl<T: Send> Send for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try to enter as a reader without waiting.
    pub fn try_read(&self) -> Option<RwSpinReadGuard<'_, T>> {
        let s = self.state.load(Ordering::Relaxed);
        if s & (WRITER | WRITER_WAITING) != 0 || s & READER_MASK == READER_MASK {
            return None;
        }
        self.state
            .compare_exchange(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinReadGuard { lock: self })
    }

    /// Spin until shared access is granted.
    pub fn read(&self) -> RwSpinReadGuard<'_, T> {
        loop {
            if let Some(g) = self.try_read() {
                return g;
            }
            spin_loop();
        }
    }

    /// Try to enter as the writer without waiting.
    pub fn try_write(&self) -> Option<RwSpinWriteGuard<'_, T>> {
        let s = self.state.load(Ordering::Relaxed);
        if s & (WRITER | READER_MASK) != 0 {
            return None;
        }
        // A pending WRITER_WAITING bit may belong to another writer; taking the
        // lock clears it, and that writer re-announces itself on its next spin.
        self.state
            .compare_exchange(s, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinWriteGuard { lock: self })
    }

    /// Spin until exclusive access is granted.
    pub fn write(&self) -> RwSpinWriteGuard<'_, T> {
        loop {
            if let Some(g) = self.try_write() {
                return g;
            }
            self.state.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            spin_loop();
        }
    }

    /// Number of readers currently inside; diagnostics only.
    #[must_use]
    pub fn reader_count(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & READER_MASK
    }

    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

impl<T: Default> Default for RwSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for RwSpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwSpinLock")
            .field("readers", &self.reader_count())
            .field("writer", &self.is_write_locked())
            .finish_non_exhaustive()
    }
}

pub struct RwSpinReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: no writer can be active while a read guard exists.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct RwSpinWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the write guard is exclusive.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for RwSpinWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the write guard is exclusive.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}
