//! # Kernel synchronization primitives
//!
//! Busy-waiting locks usable from thread and interrupt context. None of the
//! primitives here ever sleep; critical sections are expected to be short.
//!
//! * [`SpinLock`]: a fair ticket lock with RAII guards, plus
//!   [`SpinLock::try_lock`] for paths that must not wait (atomic allocations).
//! * [`RwSpinLock`]: many readers or one writer; a waiting writer blocks new
//!   readers so structural updates cannot starve.
//! * [`SyncOnceCell`]: write-once slot for hooks registered after bring-up.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod rw_spin_lock;
mod spin_lock;
mod sync_once_cell;

pub use rw_spin_lock::{RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
