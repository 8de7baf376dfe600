//! Per-architecture memory ordering for shared virtqueue rings.
//!
//! The guest vCPU and the host device thread touch the same ring memory
//! without a common lock. Each side is the single writer of its fields, so
//! ordering is all that is needed: the host reads the guest's publish index
//! with acquire semantics and publishes its own index with release semantics.
//!
//! [`Barrier`] is implemented once per instruction-set family and
//! [`HostBarrier`] picks the one matching the build target. Code that walks
//! rings is generic over the capability and never tests `target_arch` itself.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU16, Ordering};

mod aarch64;
mod riscv64;
mod x86_64;

pub use aarch64::WeakOrdered;
pub use riscv64::FenceOrdered;
pub use x86_64::StrongOrdered;

/// Memory barrier capability.
///
/// None of these operations can fail, and none of them provide mutual
/// exclusion: two writers racing on the same ring slot still race.
pub trait Barrier: Copy + Default + Debug + Send + Sync + 'static {
    /// Human readable name of the ordering model.
    const NAME: &'static str;

    /// Orders earlier loads before later loads.
    fn rmb(&self);

    /// Orders earlier stores before later stores.
    fn wmb(&self);

    /// Orders all earlier accesses before all later accesses.
    fn mb(&self);

    /// Issued after a load: no later access may be observed before it.
    fn acquire(&self) {
        self.mb();
    }

    /// Issued before a store: no earlier access may be observed after it.
    fn release(&self) {
        self.mb();
    }
}

/// Barrier implementation for the architecture this crate is built for.
#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
pub type HostBarrier = StrongOrdered;

/// Barrier implementation for the architecture this crate is built for.
#[cfg(target_arch = "aarch64")]
pub type HostBarrier = WeakOrdered;

/// Barrier implementation for the architecture this crate is built for.
#[cfg(target_arch = "riscv64")]
pub type HostBarrier = FenceOrdered;

/// Barrier implementation for the architecture this crate is built for.
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "riscv64"
)))]
pub type HostBarrier = WeakOrdered;

/// Load a ring index published by the other side.
///
/// The value is read first and the acquire barrier follows, so every read the
/// caller issues afterwards observes the writes that preceded the publish.
#[inline]
pub fn load_acquire<B: Barrier>(barrier: &B, cell: &AtomicU16) -> u16 {
    let value = cell.load(Ordering::Relaxed);
    barrier.acquire();
    value
}

/// Publish a ring index to the other side.
#[inline]
pub fn store_release<B: Barrier>(barrier: &B, cell: &AtomicU16, value: u16) {
    barrier.release();
    cell.store(value, Ordering::Relaxed);
}

/// Full two-way barrier.
#[inline]
pub fn full_barrier<B: Barrier>(barrier: &B) {
    barrier.mb();
}
