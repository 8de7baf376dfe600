//! Weakly-ordered barriers with dedicated instructions per direction (Arm).
//!
//! Inner-shareable `dmb` variants are enough: guest vCPUs and host threads
//! run on cores of the same inner shareable domain.

use super::Barrier;

#[cfg(not(target_arch = "aarch64"))]
use std::sync::atomic::{fence, Ordering};

/// Barriers for Arm-style weakly ordered architectures.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeakOrdered;

impl Barrier for WeakOrdered {
    const NAME: &'static str = "weak";

    #[inline]
    fn rmb(&self) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dmb ishld", options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "aarch64"))]
        fence(Ordering::Acquire);
    }

    #[inline]
    fn wmb(&self) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dmb ishst", options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "aarch64"))]
        fence(Ordering::Release);
    }

    #[inline]
    fn mb(&self) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dmb ish", options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "aarch64"))]
        fence(Ordering::SeqCst);
    }

    // `dmb ishld` orders an earlier load against later loads and stores.
    #[inline]
    fn acquire(&self) {
        self.rmb();
    }
}
