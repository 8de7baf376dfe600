//! Barriers built from the parameterized RISC-V `fence pred, succ`.

use super::Barrier;

#[cfg(not(target_arch = "riscv64"))]
use std::sync::atomic::{fence, Ordering};

/// Barriers for architectures with a direction-parameterized fence.
#[derive(Debug, Clone, Copy, Default)]
pub struct FenceOrdered;

macro_rules! riscv_fence {
    ($insn:literal, $fallback:expr) => {{
        #[cfg(target_arch = "riscv64")]
        unsafe {
            std::arch::asm!($insn, options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "riscv64"))]
        fence($fallback);
    }};
}

impl Barrier for FenceOrdered {
    const NAME: &'static str = "fence";

    #[inline]
    fn rmb(&self) {
        riscv_fence!("fence r, r", Ordering::Acquire);
    }

    #[inline]
    fn wmb(&self) {
        riscv_fence!("fence w, w", Ordering::Release);
    }

    #[inline]
    fn mb(&self) {
        riscv_fence!("fence rw, rw", Ordering::SeqCst);
    }

    #[inline]
    fn acquire(&self) {
        riscv_fence!("fence r, rw", Ordering::Acquire);
    }

    #[inline]
    fn release(&self) {
        riscv_fence!("fence rw, w", Ordering::Release);
    }
}
