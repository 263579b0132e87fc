//! Per-thread cleanup-handler stacks.
//!
//! Frames are pushed and popped in strict LIFO order by the owning thread.
//! When a thread is cancelled or exits through [`Runtime::thread_exit`],
//! every frame still on the stack runs newest-first before TSD destructors.
//! Popping with `execute = false` discards the top frame unrun.

use crate::runtime::Runtime;
use crate::thread::ThreadRec;

/// A deferred finalizer and its captured state.
pub(crate) type CleanupFrame = Box<dyn FnOnce() + Send + 'static>;

impl Runtime {
    /// Pushes a cleanup frame on the calling thread's stack.
    pub fn cleanup_push<F>(&self, frame: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (_, rec) = self.current();
        rec.cleanup.lock().push(Box::new(frame));
    }

    /// Pops the calling thread's newest cleanup frame, running it when
    /// `execute` is true. Popping an empty stack does nothing.
    pub fn cleanup_pop(&self, execute: bool) {
        let (_, rec) = self.current();
        let frame = rec.cleanup.lock().pop();
        if let Some(frame) = frame {
            if execute {
                frame();
            }
        }
    }
}

/// Runs every remaining frame, newest first. The stack lock is released
/// around each call so a frame may itself push or pop.
pub(crate) fn run_cleanup_stack(rec: &ThreadRec) {
    loop {
        let frame = rec.cleanup.lock().pop();
        match frame {
            Some(frame) => frame(),
            None => break,
        }
    }
}
