pub mod correlator;
pub mod retry;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub use crate::correlator::Correlator;
pub use crate::retry::{Attempts, RetryPolicy, Verdict};

/// Atomic counter that generates non-zero u8 IDs, wrapping from 255 back to 1.
///
/// Zero is reserved on the wire to mean "no ID", so it is never handed out.
#[derive(Clone, Default)]
pub struct NonZeroId(Arc<AtomicU8>);

impl NonZeroId {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn next(&self) -> u8 {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            let next = match current.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}
