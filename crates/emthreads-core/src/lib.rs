//! # emthreads-core
//!
//! POSIX threading semantics implemented in safe Rust on top of the
//! primitive operation set of [`emthreads_osal`]: mutexes with the three
//! POSIX kinds, condition variables with broadcast generations, cooperative
//! thread cancellation with cleanup handlers, thread-specific data with exit
//! destructors, thread lifecycle with joinable/detached state, and barriers.
//!
//! All process-wide state lives in a [`Runtime`] value with an explicit
//! construction and teardown lifecycle; there are no global registries.
//! Synchronization objects are addressed by generation-checked slot handles,
//! so a handle outliving its object is detected (`EINVAL`/`ESRCH`) instead
//! of aliasing whatever reused the slot.
//!
//! Every entry point reports failure as a POSIX errno-style code from
//! [`errno`]; nothing panics on a library path and nothing is thrown.

#![deny(unsafe_code)]

pub mod barrier;
pub mod cancel;
pub mod cleanup;
pub mod cond;
pub mod errno;
pub mod mutex;
pub mod registry;
pub mod runtime;
pub mod thread;
pub mod tsd;

mod timeutil;

pub use barrier::{BARRIER_SERIAL_THREAD, BarrierId};
pub use cancel::{
    CANCEL_ASYNCHRONOUS, CANCEL_DEFERRED, CANCEL_DISABLE, CANCEL_ENABLE, CANCELED,
};
pub use cond::CondId;
pub use mutex::{
    MUTEX_DEFAULT, MUTEX_ERRORCHECK, MUTEX_NORMAL, MUTEX_RECURSIVE, MutexAttr, MutexId,
};
pub use registry::Handle;
pub use runtime::Runtime;
pub use thread::{ThreadAttr, ThreadId};
pub use tsd::KeyId;
