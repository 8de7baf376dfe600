//! Virtio queue (virtqueue) implementation.
//!
//! This implements the device side of the split virtqueue layout:
//!
//! ```text
//! descriptor table: { addr: u64, len: u32, flags: u16, next: u16 } x size
//! available ring:   { flags: u16, idx: u16, ring: [u16; size], used_event: u16 }
//! used ring:        { flags: u16, idx: u16, ring: [{ id: u32, len: u32 }; size], avail_event: u16 }
//! ```
//!
//! The guest is the only writer of the available ring and the host the only
//! writer of the used ring, so the queue needs no lock around ring memory:
//! the available index is read with acquire ordering before any descriptor
//! it covers, and the used index is published with release ordering after
//! the element it covers.

use std::num::Wrapping;

use super::chain::{ChainWalker, DescriptorChain, DESCRIPTOR_SIZE};
use super::feature;
use crate::arch::{Barrier, HostBarrier};
use crate::debug_queue;
use crate::error::{ChainFault, Error, Result};
use crate::memory::{Access, GuestMemory};

/// Largest queue size the split ring layout allows.
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Default maximum queue size offered to drivers.
pub const DEFAULT_QUEUE_SIZE: u16 = 256;

/// Available ring flag: the driver does not want used-buffer interrupts.
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Used ring flag: the device does not want available-buffer kicks.
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;

const RING_HEADER_SIZE: u64 = 4;
const AVAIL_ELEMENT_SIZE: u64 = 2;
const USED_ELEMENT_SIZE: u64 = 8;

/// Round down to a power of two. `n` must be non-zero.
fn round_down_pow2(n: u32) -> u32 {
    1 << (31 - n.leading_zeros())
}

/// Counters kept per queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Chains handed to the backend.
    pub chains: u64,
    /// Used-ring entries published.
    pub completions: u64,
    /// Chains or index updates rejected as protocol violations.
    pub malformed: u64,
    /// Interrupts withheld at the guest's request.
    pub suppressed: u64,
}

/// Host side of one virtqueue.
#[derive(Debug)]
pub struct VirtQueue<B: Barrier = HostBarrier> {
    /// Queue number within the device.
    index: u16,
    /// Maximum size the device offers.
    max_size: u16,
    /// Negotiated size (power of two).
    size: u16,
    /// Whether the queue is ready.
    ready: bool,
    /// Descriptor table guest physical address.
    desc_table: u64,
    /// Available ring guest physical address.
    avail_ring: u64,
    /// Used ring guest physical address.
    used_ring: u64,
    /// Next available ring position to consume.
    last_avail_idx: Wrapping<u16>,
    /// Next used ring position to fill.
    next_used_idx: Wrapping<u16>,
    /// Used index at the last interrupt that was not suppressed.
    signalled_used: Wrapping<u16>,
    /// `VIRTIO_RING_F_EVENT_IDX` negotiated.
    event_idx: bool,
    /// `VIRTIO_RING_F_INDIRECT_DESC` negotiated.
    indirect: bool,
    /// Heads handed out and not yet completed, keyed by descriptor index.
    in_flight: Vec<bool>,
    outstanding: usize,
    stats: QueueStats,
    barrier: B,
}

impl<B: Barrier> VirtQueue<B> {
    /// Create a queue that offers at most `max_size` entries.
    ///
    /// `max_size` is clamped to the ring limit and rounded down to a power
    /// of two.
    pub fn new(index: u16, max_size: u16) -> Self {
        let max_size = round_down_pow2(u32::from(max_size.clamp(1, MAX_QUEUE_SIZE))) as u16;
        Self {
            index,
            max_size,
            size: max_size,
            ready: false,
            desc_table: 0,
            avail_ring: 0,
            used_ring: 0,
            last_avail_idx: Wrapping(0),
            next_used_idx: Wrapping(0),
            signalled_used: Wrapping(0),
            event_idx: false,
            indirect: false,
            in_flight: vec![false; usize::from(max_size)],
            outstanding: 0,
            stats: QueueStats::default(),
            barrier: B::default(),
        }
    }

    /// Queue number within the device.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Maximum size offered to the driver.
    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    /// Negotiated size.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Whether the queue is ready.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Descriptor table guest physical address.
    pub fn desc_table(&self) -> u64 {
        self.desc_table
    }

    /// Available ring guest physical address.
    pub fn avail_ring(&self) -> u64 {
        self.avail_ring
    }

    /// Used ring guest physical address.
    pub fn used_ring(&self) -> u64 {
        self.used_ring
    }

    /// Next available ring position the host will consume.
    pub fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx.0
    }

    /// Next used ring position the host will fill.
    pub fn next_used_idx(&self) -> u16 {
        self.next_used_idx.0
    }

    /// Chains handed out and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Whether `head` was handed out and not yet completed.
    pub fn is_outstanding(&self, head: u16) -> bool {
        self.in_flight
            .get(usize::from(head))
            .copied()
            .unwrap_or(false)
    }

    /// Queue counters.
    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Negotiate the queue size.
    ///
    /// The request is clamped to the maximum and rounded down (not to the
    /// nearest) power of two, so the host never indexes past the ring memory
    /// the guest sized for its request: 100 yields 64, not 128.
    pub fn negotiate(&mut self, requested: u32) -> Result<u16> {
        if requested == 0 {
            return Err(Error::UnsupportedSize(requested));
        }
        let actual = round_down_pow2(requested.min(u32::from(self.max_size))) as u16;
        self.size = actual;
        self.in_flight = vec![false; usize::from(actual)];
        self.outstanding = 0;
        debug_queue!(queue = self.index, requested, actual, "negotiated queue size");
        Ok(actual)
    }

    /// Set the descriptor table address.
    pub fn set_desc_table(&mut self, addr: u64) {
        self.desc_table = addr;
    }

    /// Set the available ring address.
    pub fn set_avail_ring(&mut self, addr: u64) {
        self.avail_ring = addr;
    }

    /// Set the used ring address.
    pub fn set_used_ring(&mut self, addr: u64) {
        self.used_ring = addr;
    }

    /// Apply the ring-level bits of the negotiated feature set.
    pub fn set_ring_features(&mut self, features: u64) {
        self.event_idx = features & feature::VIRTIO_RING_F_EVENT_IDX != 0;
        self.indirect = features & feature::VIRTIO_RING_F_INDIRECT_DESC != 0;
    }

    /// Whether the event-index suppression scheme is in use.
    pub fn event_idx(&self) -> bool {
        self.event_idx
    }

    fn avail_ring_size(&self) -> u64 {
        RING_HEADER_SIZE + AVAIL_ELEMENT_SIZE * u64::from(self.size) + 2
    }

    fn used_ring_size(&self) -> u64 {
        RING_HEADER_SIZE + USED_ELEMENT_SIZE * u64::from(self.size) + 2
    }

    fn avail_idx_addr(&self) -> u64 {
        self.avail_ring + 2
    }

    fn avail_slot_addr(&self, position: u16) -> u64 {
        self.avail_ring + RING_HEADER_SIZE + AVAIL_ELEMENT_SIZE * u64::from(position % self.size)
    }

    fn used_event_addr(&self) -> u64 {
        self.avail_ring + RING_HEADER_SIZE + AVAIL_ELEMENT_SIZE * u64::from(self.size)
    }

    fn used_idx_addr(&self) -> u64 {
        self.used_ring + 2
    }

    fn used_slot_addr(&self, position: u16) -> u64 {
        self.used_ring + RING_HEADER_SIZE + USED_ELEMENT_SIZE * u64::from(position % self.size)
    }

    fn avail_event_addr(&self) -> u64 {
        self.used_ring + RING_HEADER_SIZE + USED_ELEMENT_SIZE * u64::from(self.size)
    }

    /// Validate the ring addresses against guest memory and mark the queue
    /// ready.
    pub fn activate(&mut self, mem: &GuestMemory) -> Result<()> {
        let checks = [
            (self.desc_table, 16, DESCRIPTOR_SIZE * u64::from(self.size), Access::Read),
            (self.avail_ring, 2, self.avail_ring_size(), Access::Read),
            (self.used_ring, 4, self.used_ring_size(), Access::Write),
        ];
        for (addr, align, len, access) in checks {
            if addr % align != 0 {
                return Err(Error::Misaligned { addr, align });
            }
            mem.check_range(addr, len, access)?;
        }

        self.ready = true;
        debug_queue!(
            queue = self.index,
            desc = self.desc_table,
            avail = self.avail_ring,
            used = self.used_ring,
            size = self.size,
            "queue ready"
        );
        Ok(())
    }

    /// Forget all progress: both ring positions go back to zero and nothing
    /// is outstanding. Ring addresses and size are kept, so the next poll
    /// starts over from whatever the guest has published.
    pub fn reset(&mut self) {
        self.last_avail_idx = Wrapping(0);
        self.next_used_idx = Wrapping(0);
        self.signalled_used = Wrapping(0);
        self.in_flight.iter_mut().for_each(|f| *f = false);
        self.outstanding = 0;
    }

    /// Reset and also drop the ring configuration (device status reset).
    pub fn deactivate(&mut self) {
        self.reset();
        self.ready = false;
        self.desc_table = 0;
        self.avail_ring = 0;
        self.used_ring = 0;
        self.size = self.max_size;
        self.in_flight = vec![false; usize::from(self.max_size)];
        self.event_idx = false;
        self.indirect = false;
    }

    /// Read the guest's published available index.
    fn avail_idx(&self, mem: &GuestMemory) -> Result<Wrapping<u16>> {
        mem.load_acquire_u16(&self.barrier, self.avail_idx_addr())
            .map(Wrapping)
    }

    /// Check if there are available descriptors to process.
    pub fn has_available(&self, mem: &GuestMemory) -> Result<bool> {
        if !self.ready {
            return Ok(false);
        }
        Ok(self.avail_idx(mem)? != self.last_avail_idx)
    }

    /// Start draining newly published chains.
    ///
    /// The returned iterator yields one item per available ring entry between
    /// the last consumed position and the index read here. Each yielded item
    /// consumes its entry; a malformed chain is yielded as an error and
    /// skipped, and iteration continues with the next entry. A chain whose
    /// descriptors lie outside guest memory is also yielded as an error, after
    /// its head has been completed with zero bytes. The queue is
    /// borrowed until the iterator is dropped.
    pub fn poll_available<'a>(&'a mut self, mem: &'a GuestMemory) -> Result<AvailIter<'a, B>> {
        if !self.ready {
            return Err(Error::QueueNotReady(self.index));
        }

        let avail = self.avail_idx(mem)?;
        let pending = avail - self.last_avail_idx;
        if pending.0 > self.size {
            self.stats.malformed += 1;
            tracing::warn!(
                queue = self.index,
                avail = avail.0,
                last = self.last_avail_idx.0,
                "guest moved the available index past the ring size"
            );
            return Err(Error::InvalidAvailIndex {
                avail: avail.0,
                last: self.last_avail_idx.0,
                size: self.size,
            });
        }

        Ok(AvailIter {
            queue: self,
            mem,
            end: avail,
        })
    }

    /// Consume at most one available chain.
    pub fn pop_available(&mut self, mem: &GuestMemory) -> Result<Option<DescriptorChain>> {
        self.poll_available(mem)?.next().transpose()
    }

    /// Consume the next well-formed chain. Malformed chains on the way are
    /// skipped (they are already counted and logged); errors that did not
    /// consume an entry are returned.
    pub fn next_chain(&mut self, mem: &GuestMemory) -> Result<Option<DescriptorChain>> {
        loop {
            let before = self.last_avail_idx;
            match self.pop_available(mem) {
                Err(err) if err.is_guest_fault() && self.last_avail_idx != before => continue,
                other => return other,
            }
        }
    }

    fn take_chain(&mut self, mem: &GuestMemory, head: u16) -> Result<DescriptorChain> {
        let result = if self.is_outstanding(head) {
            Err(Error::MalformedChain {
                head,
                fault: ChainFault::HeadInFlight,
            })
        } else {
            ChainWalker {
                mem,
                desc_table: self.desc_table,
                queue_size: self.size,
                indirect: self.indirect,
            }
            .walk(head)
        };

        match result {
            Ok(chain) => {
                self.in_flight[usize::from(head)] = true;
                self.outstanding += 1;
                self.stats.chains += 1;
                debug_queue!(queue = self.index, head, buffers = chain.len(), "chain available");
                Ok(chain)
            }
            Err(err) => {
                if err.is_guest_fault() {
                    self.stats.malformed += 1;
                    tracing::warn!(queue = self.index, head, "skipping descriptor chain: {err}");
                }
                if is_address_fault(&err) {
                    self.complete_faulted(mem, head)?;
                }
                Err(err)
            }
        }
    }

    // The head is valid but its descriptors point outside guest memory: hand
    // the head back to the guest as a zero-length completion.
    fn complete_faulted(&mut self, mem: &GuestMemory, head: u16) -> Result<()> {
        self.in_flight[usize::from(head)] = true;
        self.outstanding += 1;
        let result = self.complete(mem, head, 0);
        if result.is_err() {
            self.in_flight[usize::from(head)] = false;
            self.outstanding -= 1;
        }
        result
    }

    /// Publish a completion for `head`.
    ///
    /// The used element is written first and the used index is then stored
    /// with release ordering, so the guest never sees the index before the
    /// element.
    pub fn complete(&mut self, mem: &GuestMemory, head: u16, bytes_written: u32) -> Result<()> {
        if !self.ready {
            return Err(Error::QueueNotReady(self.index));
        }
        if !self.is_outstanding(head) {
            return Err(Error::UnknownChain(head));
        }

        let slot = self.used_slot_addr(self.next_used_idx.0);
        mem.store_u32(slot, u32::from(head))?;
        mem.store_u32(slot + 4, bytes_written)?;

        let next_used = self.next_used_idx + Wrapping(1);
        mem.store_release_u16(&self.barrier, self.used_idx_addr(), next_used.0)?;
        self.next_used_idx = next_used;

        self.in_flight[usize::from(head)] = false;
        self.outstanding -= 1;
        self.stats.completions += 1;
        debug_queue!(
            queue = self.index,
            head,
            bytes_written,
            used = self.next_used_idx.0,
            "chain completed"
        );
        Ok(())
    }

    /// Decide whether the completions published since the last interrupt
    /// warrant a new one.
    ///
    /// Without `VIRTIO_RING_F_EVENT_IDX` this honours the guest's
    /// no-interrupt flag; completions withheld that way are signalled by the
    /// next call that finds the flag clear. With it, the guest's `used_event`
    /// index decides.
    pub fn notify_needed(&mut self, mem: &GuestMemory) -> Result<bool> {
        let used = self.next_used_idx;
        // Used ring writes must be visible before the guest's flags are read.
        self.barrier.mb();

        let old = self.signalled_used;
        if used == old {
            return Ok(false);
        }

        let needed = if self.event_idx {
            let used_event = Wrapping(mem.load_u16(self.used_event_addr())?);
            self.signalled_used = used;
            (used - used_event - Wrapping(1)) < (used - old)
        } else {
            let flags = mem.load_u16(self.avail_ring)?;
            let needed = flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0;
            if needed {
                self.signalled_used = used;
            }
            needed
        };

        if !needed {
            self.stats.suppressed += 1;
        }
        Ok(needed)
    }

    /// Ask the guest not to kick this queue.
    pub fn disable_notification(&mut self, mem: &GuestMemory) -> Result<()> {
        if self.event_idx {
            // With event indices kicks stop on their own until avail_event
            // is moved forward again.
            return Ok(());
        }
        mem.store_u16(self.used_ring, VIRTQ_USED_F_NO_NOTIFY)
    }

    /// Ask the guest to kick this queue again.
    ///
    /// Returns `true` if entries were published while kicks were disabled,
    /// in which case the caller must poll again instead of waiting.
    pub fn enable_notification(&mut self, mem: &GuestMemory) -> Result<bool> {
        if self.event_idx {
            mem.store_u16(self.avail_event_addr(), self.last_avail_idx.0)?;
        } else {
            mem.store_u16(self.used_ring, 0)?;
        }
        // The flag store must not pass the index load below.
        self.barrier.mb();
        Ok(self.avail_idx(mem)? != self.last_avail_idx)
    }
}

fn is_address_fault(err: &Error) -> bool {
    matches!(
        err,
        Error::OutOfRange { .. } | Error::Unmapped(_) | Error::ReadOnly(_) | Error::Misaligned { .. }
    )
}

/// Iterator over newly published chains, see [`VirtQueue::poll_available`].
pub struct AvailIter<'a, B: Barrier> {
    queue: &'a mut VirtQueue<B>,
    mem: &'a GuestMemory,
    end: Wrapping<u16>,
}

impl<'a, B: Barrier> AvailIter<'a, B> {
    /// Entries left in this batch.
    pub fn remaining(&self) -> u16 {
        (self.end - self.queue.last_avail_idx).0
    }
}

impl<'a, B: Barrier> Iterator for AvailIter<'a, B> {
    type Item = Result<DescriptorChain>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.queue.last_avail_idx == self.end {
            return None;
        }

        let slot = self.queue.avail_slot_addr(self.queue.last_avail_idx.0);
        let head = match self.mem.load_u16(slot) {
            Ok(head) => head,
            Err(err) => {
                // Memory changed under us; stop here and let the caller
                // decide. The entry stays unconsumed.
                self.end = self.queue.last_avail_idx;
                return Some(Err(err));
            }
        };
        self.queue.last_avail_idx += Wrapping(1);
        Some(self.queue.take_chain(self.mem, head))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::from(self.remaining());
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{FenceOrdered, StrongOrdered, WeakOrdered};
    use crate::device::virtio::chain::desc_flags::{INDIRECT, NEXT, WRITE};
    use crate::memory::layout;
    use crate::testing::{GuestDriver, DATA_BASE, DRIVER_RAM_SIZE};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn setup(size: u16) -> (GuestDriver, VirtQueue) {
        let driver = GuestDriver::new(size);
        let mut queue = VirtQueue::new(0, MAX_QUEUE_SIZE);
        driver.configure(&mut queue);
        (driver, queue)
    }

    #[test]
    fn test_negotiate_size() {
        let mut queue: VirtQueue = VirtQueue::new(0, 256);
        assert!(matches!(queue.negotiate(0), Err(Error::UnsupportedSize(0))));
        assert_eq!(queue.negotiate(4096).unwrap(), 256);
        assert_eq!(queue.negotiate(100).unwrap(), 64);
        assert_eq!(queue.negotiate(1).unwrap(), 1);
        assert_eq!(queue.negotiate(u32::MAX).unwrap(), 256);
        assert_eq!(queue.size(), 256);
    }

    #[test]
    fn test_new_clamps_max() {
        let queue: VirtQueue = VirtQueue::new(1, 300);
        assert_eq!(queue.max_size(), 256);
        let queue: VirtQueue = VirtQueue::new(1, 0);
        assert_eq!(queue.max_size(), 1);
    }

    #[test]
    fn test_poll_requires_ready() {
        let driver = GuestDriver::new(8);
        let mut queue: VirtQueue = VirtQueue::new(2, 8);
        assert!(matches!(
            queue.poll_available(driver.memory()),
            Err(Error::QueueNotReady(2))
        ));
        assert!(!queue.has_available(driver.memory()).unwrap());
    }

    #[test]
    fn test_activate_validates_rings() {
        let driver = GuestDriver::new(8);
        let mut queue: VirtQueue = VirtQueue::new(0, 8);
        queue.set_desc_table(driver.desc_table() + 8);
        queue.set_avail_ring(driver.avail_ring());
        queue.set_used_ring(driver.used_ring());
        assert!(matches!(
            queue.activate(driver.memory()),
            Err(Error::Misaligned { align: 16, .. })
        ));

        queue.set_desc_table(0x10);
        assert!(matches!(
            queue.activate(driver.memory()),
            Err(Error::OutOfRange { .. })
        ));
        assert!(!queue.is_ready());
    }

    #[test]
    fn test_two_buffer_chain_roundtrip() {
        let (mut driver, mut queue) = setup(16);
        driver.write_desc(3, DATA_BASE, 64, NEXT, 9);
        driver.write_desc(9, DATA_BASE + 0x100, 128, WRITE, 0);
        driver.publish(3);

        let chains: Vec<_> = queue
            .poll_available(driver.memory())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chains.len(), 1);
        let chain = &chains[0];
        assert_eq!(chain.head(), 3);
        assert_eq!(chain.descriptors()[0].len, 64);
        assert!(!chain.descriptors()[0].is_write_only());
        assert_eq!(chain.descriptors()[1].len, 128);
        assert!(chain.descriptors()[1].is_write_only());

        driver.memory().write(DATA_BASE + 0x100, &[0x5A; 100]).unwrap();
        queue.complete(driver.memory(), 3, 100).unwrap();

        assert_eq!(driver.used_idx(), 1);
        assert_eq!(driver.used_elem(0), (3, 100));
        assert!(queue.notify_needed(driver.memory()).unwrap());
    }

    #[test]
    fn test_complete_unknown_chain() {
        let (mut driver, mut queue) = setup(8);
        assert!(matches!(
            queue.complete(driver.memory(), 1, 0),
            Err(Error::UnknownChain(1))
        ));

        driver.write_desc(1, DATA_BASE, 8, 0, 0);
        driver.publish(1);
        let chain = queue.pop_available(driver.memory()).unwrap().unwrap();
        queue.complete(driver.memory(), chain.head(), 0).unwrap();
        // Completing twice in the same generation is refused.
        assert!(matches!(
            queue.complete(driver.memory(), 1, 0),
            Err(Error::UnknownChain(1))
        ));
        assert!(matches!(
            queue.complete(driver.memory(), 500, 0),
            Err(Error::UnknownChain(500))
        ));
        assert_eq!(driver.used_idx(), 1);
    }

    #[test]
    fn test_cycle_does_not_block_ring() {
        let (mut driver, mut queue) = setup(8);
        driver.write_desc(0, DATA_BASE, 8, NEXT, 1);
        driver.write_desc(1, DATA_BASE, 8, NEXT, 0);
        driver.write_desc(2, DATA_BASE, 8, 0, 0);
        driver.publish(0);
        driver.publish(2);

        let results: Vec<_> = queue.poll_available(driver.memory()).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(Error::MalformedChain { head: 0, fault: ChainFault::Cycle })
        ));
        assert_eq!(results[1].as_ref().unwrap().head(), 2);
        assert_eq!(queue.stats().malformed, 1);
        assert_eq!(queue.outstanding(), 1);
        assert!(!queue.is_outstanding(0));
    }

    #[test]
    fn test_head_in_flight_rejected() {
        let (mut driver, mut queue) = setup(8);
        driver.write_desc(4, DATA_BASE, 8, 0, 0);
        driver.publish(4);
        driver.publish(4);

        let results: Vec<_> = queue.poll_available(driver.memory()).unwrap().collect();
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(Error::MalformedChain { head: 4, fault: ChainFault::HeadInFlight })
        ));
    }

    #[test]
    fn test_avail_index_overrun() {
        let (driver, mut queue) = setup(8);
        driver.set_avail_idx(9);
        assert!(matches!(
            queue.poll_available(driver.memory()),
            Err(Error::InvalidAvailIndex { avail: 9, last: 0, size: 8 })
        ));
        assert_eq!(queue.stats().malformed, 1);
    }

    #[test]
    fn test_poll_is_bounded_by_snapshot() {
        let (mut driver, mut queue) = setup(8);
        driver.write_desc(0, DATA_BASE, 8, 0, 0);
        driver.write_desc(1, DATA_BASE, 8, 0, 0);
        driver.publish(0);

        let mem = driver.memory_arc();
        let mut iter = queue.poll_available(&mem).unwrap();
        assert_eq!(iter.remaining(), 1);
        // Published after the poll started: not part of this batch.
        driver.publish(1);
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().is_none());
        drop(iter);

        assert!(queue.has_available(&mem).unwrap());
        assert_eq!(queue.pop_available(&mem).unwrap().unwrap().head(), 1);
        assert!(queue.pop_available(&mem).unwrap().is_none());
    }

    #[test]
    fn test_reset_replays_published_entries() {
        let (mut driver, mut queue) = setup(8);
        for head in 0..3 {
            driver.write_desc(head, DATA_BASE, 8, 0, 0);
            driver.publish(head);
        }
        let n = queue.poll_available(driver.memory()).unwrap().count();
        assert_eq!(n, 3);
        queue.complete(driver.memory(), 0, 0).unwrap();

        queue.reset();
        assert_eq!(queue.last_avail_idx(), 0);
        assert_eq!(queue.next_used_idx(), 0);
        assert_eq!(queue.outstanding(), 0);
        assert!(queue.is_ready());

        let heads: Vec<u16> = queue
            .poll_available(driver.memory())
            .unwrap()
            .map(|c| c.unwrap().head())
            .collect();
        assert_eq!(heads, vec![0, 1, 2]);
    }

    #[test]
    fn test_deactivate_drops_config() {
        let (_driver, mut queue) = setup(8);
        queue.deactivate();
        assert!(!queue.is_ready());
        assert_eq!(queue.size(), queue.max_size());
        assert_eq!(queue.desc_table(), 0);
    }

    #[test]
    fn test_no_interrupt_flag() {
        let (mut driver, mut queue) = setup(8);
        driver.set_no_interrupt(true);
        for head in 0..4 {
            driver.write_desc(head, DATA_BASE, 8, 0, 0);
            driver.publish(head);
        }
        let chains: Vec<_> = queue.poll_available(driver.memory()).unwrap().collect();
        for chain in chains {
            queue.complete(driver.memory(), chain.unwrap().head(), 0).unwrap();
            assert!(!queue.notify_needed(driver.memory()).unwrap());
        }
        assert_eq!(queue.stats().suppressed, 4);

        driver.set_no_interrupt(false);
        assert!(queue.notify_needed(driver.memory()).unwrap());
        // Nothing new since the last interrupt.
        assert!(!queue.notify_needed(driver.memory()).unwrap());
    }

    #[test]
    fn test_event_idx_suppression() {
        let (mut driver, mut queue) = setup(8);
        queue.set_ring_features(feature::VIRTIO_RING_F_EVENT_IDX);
        // Interrupt only once the used index passes 2.
        driver.set_used_event(2);
        for head in 0..4 {
            driver.write_desc(head, DATA_BASE, 8, 0, 0);
            driver.publish(head);
        }
        let heads: Vec<u16> = queue
            .poll_available(driver.memory())
            .unwrap()
            .map(|c| c.unwrap().head())
            .collect();

        let mut fired = Vec::new();
        for head in heads {
            queue.complete(driver.memory(), head, 0).unwrap();
            fired.push(queue.notify_needed(driver.memory()).unwrap());
        }
        assert_eq!(fired, vec![false, false, true, false]);
    }

    #[test]
    fn test_kick_suppression() {
        let (mut driver, mut queue) = setup(8);
        queue.disable_notification(driver.memory()).unwrap();
        assert_eq!(driver.used_flags(), VIRTQ_USED_F_NO_NOTIFY);
        assert!(!queue.enable_notification(driver.memory()).unwrap());
        assert_eq!(driver.used_flags(), 0);

        driver.write_desc(0, DATA_BASE, 8, 0, 0);
        driver.publish(0);
        assert!(queue.enable_notification(driver.memory()).unwrap());

        queue.set_ring_features(feature::VIRTIO_RING_F_EVENT_IDX);
        queue.pop_available(driver.memory()).unwrap().unwrap();
        assert!(!queue.enable_notification(driver.memory()).unwrap());
        assert_eq!(driver.avail_event(), 1);
    }

    #[test]
    fn test_completion_fails_outside_memory() {
        let (mut driver, mut queue) = setup(8);
        driver.write_desc(0, DATA_BASE, 8, 0, 0);
        driver.publish(0);
        queue.pop_available(driver.memory()).unwrap().unwrap();

        // Move the used ring outside guest memory behind the queue's back.
        queue.set_used_ring(0x10);
        assert!(matches!(
            queue.complete(driver.memory(), 0, 0),
            Err(Error::OutOfRange { .. })
        ));
        assert!(queue.is_outstanding(0));
    }

    #[test]
    fn test_chain_outside_memory_completes_empty() {
        let (mut driver, mut queue) = setup(8);
        queue.set_ring_features(feature::VIRTIO_RING_F_INDIRECT_DESC);
        driver.write_desc(2, 0x10, 16, INDIRECT, 0);
        driver.write_desc(3, DATA_BASE, 8, 0, 0);
        driver.publish(2);
        driver.publish(3);

        let results: Vec<_> = queue.poll_available(driver.memory()).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(Error::OutOfRange { addr: 0x10, .. })));
        assert_eq!(results[1].as_ref().unwrap().head(), 3);

        // The faulting head went straight back to the guest.
        assert_eq!(driver.used_idx(), 1);
        assert_eq!(driver.used_elem(0), (2, 0));
        assert!(!queue.is_outstanding(2));
        assert_eq!(queue.outstanding(), 1);
        assert_eq!(queue.stats().malformed, 1);
        assert!(matches!(
            queue.complete(driver.memory(), 2, 0),
            Err(Error::UnknownChain(2))
        ));
        assert!(queue.notify_needed(driver.memory()).unwrap());

        queue.complete(driver.memory(), 3, 8).unwrap();
        assert_eq!(driver.used_idx(), 2);
        assert_eq!(driver.used_elem(1), (3, 8));
    }

    #[test]
    fn test_failed_publish_keeps_used_index() {
        let mut mem = GuestMemory::with_ram(layout::RAM_BASE, DRIVER_RAM_SIZE).unwrap();
        mem.add_readonly(layout::RAM_BASE - 8, &[0; 8]).unwrap();
        let mut driver = GuestDriver::with_memory(Arc::new(mem), layout::RAM_BASE, 8);
        let mut queue: VirtQueue = VirtQueue::new(0, 8);
        driver.configure(&mut queue);
        driver.write_desc(0, DATA_BASE, 8, 0, 0);
        driver.publish(0);
        queue.pop_available(driver.memory()).unwrap().unwrap();

        // Used index in ROM, elements in RAM: the element store succeeds and
        // the index store fails.
        queue.set_used_ring(layout::RAM_BASE - 4);
        assert!(matches!(
            queue.complete(driver.memory(), 0, 8),
            Err(Error::ReadOnly(_))
        ));
        assert_eq!(queue.next_used_idx(), 0);
        assert!(queue.is_outstanding(0));

        queue.set_used_ring(driver.used_ring());
        queue.complete(driver.memory(), 0, 8).unwrap();
        assert_eq!(queue.next_used_idx(), 1);
        assert_eq!(driver.used_idx(), 1);
        assert_eq!(driver.used_elem(0), (0, 8));
    }

    fn run_batches<B: Barrier>(size: u16, total: usize) {
        let driver_size = size;
        let mut driver = GuestDriver::new(driver_size);
        let mut queue: VirtQueue<B> = VirtQueue::new(0, MAX_QUEUE_SIZE);
        driver.configure(&mut queue);

        let mut published = 0usize;
        let mut seen = Vec::with_capacity(total);
        while published < total {
            let batch = (total - published).min(usize::from(size));
            for i in 0..batch {
                let head = ((published + i) % usize::from(size)) as u16;
                driver.write_desc(head, DATA_BASE, (published + i) as u32, 0, 0);
                driver.publish(head);
            }
            published += batch;

            let mem = driver.memory_arc();
            let chains: Vec<_> = queue.poll_available(&mem).unwrap().collect();
            for chain in chains {
                let chain = chain.unwrap();
                seen.push(chain.descriptors()[0].len as usize);
                queue.complete(&mem, chain.head(), chain.descriptors()[0].len).unwrap();
            }
        }

        assert_eq!(seen, (0..total).collect::<Vec<_>>());
        assert_eq!(usize::from(driver.used_idx()), total % 65536);
    }

    #[test]
    fn test_every_barrier_drives_queue() {
        run_batches::<StrongOrdered>(4, 20);
        run_batches::<WeakOrdered>(4, 20);
        run_batches::<FenceOrdered>(4, 20);
    }

    #[test]
    fn test_index_wraparound() {
        // Enough entries to wrap the 16-bit ring indices.
        run_batches::<HostBarrier>(256, 65536 + 300);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_no_loss_no_duplication(exp in 1u32..=15, total in 0usize..300) {
            run_batches::<HostBarrier>(1 << exp, total);
        }

        #[test]
        fn prop_suppressed_batch_fires_once(n in 1u16..64) {
            let (mut driver, mut queue) = setup(64);
            driver.set_no_interrupt(true);
            for head in 0..n {
                driver.write_desc(head, DATA_BASE, 8, 0, 0);
                driver.publish(head);
            }
            let heads: Vec<u16> = queue
                .poll_available(driver.memory())
                .unwrap()
                .map(|c| c.unwrap().head())
                .collect();
            for head in heads {
                queue.complete(driver.memory(), head, 0).unwrap();
                prop_assert!(!queue.notify_needed(driver.memory()).unwrap());
            }

            driver.set_no_interrupt(false);
            driver.write_desc(n, DATA_BASE, 8, 0, 0);
            driver.publish(n);
            let chain = queue.pop_available(driver.memory()).unwrap().unwrap();
            queue.complete(driver.memory(), chain.head(), 0).unwrap();
            prop_assert!(queue.notify_needed(driver.memory()).unwrap());
            prop_assert!(!queue.notify_needed(driver.memory()).unwrap());
        }
    }

    #[test]
    fn test_concurrent_guest_and_host() {
        const SIZE: u16 = 32;
        const TOTAL: u32 = 5000;

        let driver = GuestDriver::new(SIZE);
        let mut queue: VirtQueue = VirtQueue::new(0, SIZE);
        driver.configure(&mut queue);
        let mem: Arc<GuestMemory> = driver.memory_arc();

        let guest = std::thread::spawn(move || {
            let mut driver = driver;
            for i in 0..TOTAL {
                // Wait until the head we are about to reuse came back.
                while u32::from(driver.avail_idx().wrapping_sub(driver.used_idx()))
                    >= u32::from(SIZE)
                {
                    std::hint::spin_loop();
                }
                let head = (i % u32::from(SIZE)) as u16;
                driver.write_desc(head, DATA_BASE + u64::from(head) * 8, i, 0, 0);
                driver.publish(head);
            }
        });

        let mut expected = 0u32;
        while expected < TOTAL {
            let chains: Vec<_> = queue.poll_available(&mem).unwrap().collect();
            for chain in chains {
                let chain = chain.unwrap();
                assert_eq!(chain.descriptors()[0].len, expected);
                queue.complete(&mem, chain.head(), 0).unwrap();
                expected += 1;
            }
            std::hint::spin_loop();
        }
        guest.join().unwrap();
        assert_eq!(queue.stats().completions, u64::from(TOTAL));
    }
}
