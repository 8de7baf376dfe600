//! Total-store-order barriers (x86 and x86_64).
//!
//! TSO never reorders loads with loads or stores with stores, so only the
//! compiler has to be kept in line. A full barrier still needs `mfence`
//! because a later load may pass an earlier store.

use std::sync::atomic::{compiler_fence, Ordering};

use super::Barrier;

/// Barriers for strongly-ordered (TSO) architectures.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrongOrdered;

impl Barrier for StrongOrdered {
    const NAME: &'static str = "strong";

    #[inline]
    fn rmb(&self) {
        compiler_fence(Ordering::SeqCst);
    }

    #[inline]
    fn wmb(&self) {
        compiler_fence(Ordering::SeqCst);
    }

    #[inline]
    fn mb(&self) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::asm!("mfence", options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "x86_64"))]
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    #[inline]
    fn acquire(&self) {
        compiler_fence(Ordering::SeqCst);
    }

    #[inline]
    fn release(&self) {
        compiler_fence(Ordering::SeqCst);
    }
}
