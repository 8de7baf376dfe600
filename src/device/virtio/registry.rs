//! Virtio device registry.
//!
//! The registry is the single owner of every virtio device of a VM: identity,
//! feature bits, status, configuration space and queues all live in one
//! [`VirtioDevice`] per handle. Structural changes (feature negotiation,
//! reset, unregister) take the device write lock; data movement only takes
//! the read lock plus the mutex of the one queue being drained.
//!
//! Backends traverse queues through a [`TraversalGuard`]. A reset or
//! unregister while a guard is alive fails with `Busy`; owners first call
//! [`DeviceRegistry::request_drain`] so no new traversal starts, wait for
//! [`DeviceRegistry::wait_idle`], reset, then [`DeviceRegistry::resume`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{Duration, Instant};

use super::kick::QueueKick;
use super::queue::{QueueStats, VirtQueue};
use super::{feature, interrupt};
use crate::arch::{Barrier, HostBarrier};
use crate::error::{Error, Result};
use crate::irq::LineId;

/// Stable identifier of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub u32);

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime state of one virtio device.
#[derive(Debug)]
pub struct VirtioDevice<B: Barrier = HostBarrier> {
    handle: DeviceHandle,
    device_type: u32,
    offered_features: u64,
    acked_features: u64,
    status: u8,
    config: Vec<u8>,
    config_generation: u32,
    interrupt_status: AtomicU32,
    queues: Vec<Mutex<VirtQueue<B>>>,
    kicks: Vec<Arc<QueueKick>>,
    line: LineId,
}

impl<B: Barrier> VirtioDevice<B> {
    /// Create a device with `num_queues` queues of at most `max_queue_size`
    /// entries. Ring-level features are always offered on top of
    /// `device_features`.
    pub fn new(
        device_type: u32,
        device_features: u64,
        config: Vec<u8>,
        num_queues: u16,
        max_queue_size: u16,
        line: LineId,
    ) -> Self {
        Self {
            handle: DeviceHandle(u32::MAX),
            device_type,
            offered_features: device_features | feature::RING_FEATURES,
            acked_features: 0,
            status: 0,
            config,
            config_generation: 0,
            interrupt_status: AtomicU32::new(0),
            queues: (0..num_queues)
                .map(|i| Mutex::new(VirtQueue::new(i, max_queue_size)))
                .collect(),
            kicks: (0..num_queues).map(|_| Arc::new(QueueKick::new())).collect(),
            line,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn device_type(&self) -> u32 {
        self.device_type
    }

    pub fn offered_features(&self) -> u64 {
        self.offered_features
    }

    pub fn acked_features(&self) -> u64 {
        self.acked_features
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn set_status(&mut self, status: u8) {
        self.status = status;
    }

    pub fn line(&self) -> LineId {
        self.line
    }

    pub fn num_queues(&self) -> u16 {
        self.queues.len() as u16
    }

    /// Lock queue `index`.
    pub fn queue(&self, index: u16) -> Result<MutexGuard<'_, VirtQueue<B>>> {
        let queue = self.queues.get(usize::from(index)).ok_or(Error::UnknownQueue {
            device: self.handle,
            queue: index,
        })?;
        Ok(queue.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Kick signal of queue `index`.
    pub fn kick(&self, index: u16) -> Result<Arc<QueueKick>> {
        self.kicks
            .get(usize::from(index))
            .cloned()
            .ok_or(Error::UnknownQueue {
                device: self.handle,
                queue: index,
            })
    }

    /// Configuration space image.
    pub fn config(&self) -> &[u8] {
        &self.config
    }

    pub fn config_generation(&self) -> u32 {
        self.config_generation
    }

    /// Read configuration space; bytes past the end read as zero.
    pub fn read_config(&self, offset: u64, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = usize::try_from(offset)
                .ok()
                .and_then(|o| o.checked_add(i))
                .and_then(|o| self.config.get(o))
                .copied()
                .unwrap_or(0);
        }
    }

    /// Guest write to configuration space; bytes past the end are dropped.
    pub fn write_config(&mut self, offset: u64, data: &[u8]) {
        let Ok(offset) = usize::try_from(offset) else {
            return;
        };
        for (i, &byte) in data.iter().enumerate() {
            if let Some(slot) = offset.checked_add(i).and_then(|o| self.config.get_mut(o)) {
                *slot = byte;
            }
        }
    }

    /// Host-initiated configuration change. Bumps the generation and flags a
    /// configuration interrupt; the caller raises the line.
    pub fn update_config(&mut self, offset: u64, data: &[u8]) {
        self.write_config(offset, data);
        self.config_generation = self.config_generation.wrapping_add(1);
        self.set_interrupt_status(interrupt::CONFIG_CHANGE);
    }

    pub fn interrupt_status(&self) -> u32 {
        self.interrupt_status.load(Ordering::SeqCst)
    }

    /// Set bits in the interrupt status register.
    pub fn set_interrupt_status(&self, bits: u32) {
        self.interrupt_status.fetch_or(bits, Ordering::SeqCst);
    }

    /// Clear bits and return what is left.
    pub fn clear_interrupt_status(&self, bits: u32) -> u32 {
        self.interrupt_status.fetch_and(!bits, Ordering::SeqCst) & !bits
    }

    /// Per-queue counters.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        self.queues
            .iter()
            .map(|q| q.lock().unwrap_or_else(PoisonError::into_inner).stats())
            .collect()
    }

    fn reset_state(&mut self, unconfigure: bool) {
        self.status = 0;
        self.acked_features = 0;
        self.interrupt_status.store(0, Ordering::SeqCst);
        for queue in &self.queues {
            let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
            if unconfigure {
                queue.deactivate();
            } else {
                queue.reset();
            }
        }
    }
}

#[derive(Debug)]
struct DeviceSlot<B: Barrier> {
    device: RwLock<VirtioDevice<B>>,
    active: AtomicUsize,
    draining: AtomicBool,
    idle: Mutex<()>,
    idle_cond: Condvar,
}

/// Shared reference to a registered device.
#[derive(Debug)]
pub struct DeviceRef<B: Barrier = HostBarrier> {
    handle: DeviceHandle,
    slot: Arc<DeviceSlot<B>>,
}

impl<B: Barrier> DeviceRef<B> {
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Read access to the device.
    pub fn read(&self) -> RwLockReadGuard<'_, VirtioDevice<B>> {
        self.slot
            .device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access for configuration-path changes (status, config space).
    pub fn write(&self) -> RwLockWriteGuard<'_, VirtioDevice<B>> {
        self.slot
            .device
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_draining(&self) -> bool {
        self.slot.draining.load(Ordering::SeqCst)
    }

    /// Number of traversals in progress.
    pub fn active_traversals(&self) -> usize {
        self.slot.active.load(Ordering::SeqCst)
    }
}

/// Proof that a backend is traversing a device's queues.
///
/// Holding one makes `reset` and `unregister` fail with `Busy`.
#[derive(Debug)]
pub struct TraversalGuard<B: Barrier = HostBarrier> {
    handle: DeviceHandle,
    slot: Arc<DeviceSlot<B>>,
}

impl<B: Barrier> TraversalGuard<B> {
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Read access to the device being traversed.
    pub fn device(&self) -> RwLockReadGuard<'_, VirtioDevice<B>> {
        self.slot
            .device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: Barrier> Drop for TraversalGuard<B> {
    fn drop(&mut self) {
        if self.slot.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _idle = self.slot.idle.lock().unwrap_or_else(PoisonError::into_inner);
            self.slot.idle_cond.notify_all();
        }
    }
}

/// Owner of all virtio devices of one VM.
#[derive(Debug)]
pub struct DeviceRegistry<B: Barrier = HostBarrier> {
    slots: RwLock<Vec<Option<Arc<DeviceSlot<B>>>>>,
}

impl<B: Barrier> Default for DeviceRegistry<B> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }
}

impl<B: Barrier> DeviceRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. Handles are never reused.
    pub fn register(&self, mut device: VirtioDevice<B>) -> DeviceHandle {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let handle = DeviceHandle(slots.len() as u32);
        device.handle = handle;
        tracing::debug!(
            device = handle.0,
            device_type = device.device_type,
            queues = device.queues.len(),
            "device registered"
        );
        slots.push(Some(Arc::new(DeviceSlot {
            device: RwLock::new(device),
            active: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            idle: Mutex::new(()),
            idle_cond: Condvar::new(),
        })));
        handle
    }

    fn slot(&self, handle: DeviceHandle) -> Result<Arc<DeviceSlot<B>>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(handle.0 as usize)
            .and_then(Option::clone)
            .ok_or(Error::UnknownDevice(handle))
    }

    /// Look up a registered device.
    pub fn lookup(&self, handle: DeviceHandle) -> Result<DeviceRef<B>> {
        Ok(DeviceRef {
            handle,
            slot: self.slot(handle)?,
        })
    }

    /// Handles of all registered devices.
    pub fn handles(&self) -> Vec<DeviceHandle> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| DeviceHandle(i as u32))
            .collect()
    }

    /// Agree on features: the intersection of what the device offers and what
    /// the guest asks for. The ring-level part is pushed into every queue.
    pub fn negotiate_features(&self, handle: DeviceHandle, guest_bits: u64) -> Result<u64> {
        let slot = self.slot(handle)?;
        let mut device = slot.device.write().unwrap_or_else(PoisonError::into_inner);
        let agreed = device.offered_features & guest_bits;
        device.acked_features = agreed;
        for queue in &device.queues {
            queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .set_ring_features(agreed);
        }
        tracing::debug!(
            device = handle.0,
            offered = format_args!("{:#x}", device.offered_features),
            requested = format_args!("{:#x}", guest_bits),
            agreed = format_args!("{:#x}", agreed),
            "features negotiated"
        );
        Ok(agreed)
    }

    /// Start a queue traversal.
    pub fn begin_traversal(&self, handle: DeviceHandle) -> Result<TraversalGuard<B>> {
        let slot = self.slot(handle)?;
        if slot.draining.load(Ordering::SeqCst) {
            return Err(Error::Draining(handle));
        }
        slot.active.fetch_add(1, Ordering::SeqCst);
        let guard = TraversalGuard { handle, slot };
        // A drain requested between the check and the increment wins.
        if guard.slot.draining.load(Ordering::SeqCst) {
            return Err(Error::Draining(handle));
        }
        Ok(guard)
    }

    /// Refuse new traversals and wake workers sleeping on the device's kicks
    /// so they notice.
    pub fn request_drain(&self, handle: DeviceHandle) -> Result<()> {
        let slot = self.slot(handle)?;
        slot.draining.store(true, Ordering::SeqCst);
        let device = slot.device.read().unwrap_or_else(PoisonError::into_inner);
        for kick in &device.kicks {
            kick.kick();
        }
        tracing::debug!(device = handle.0, "drain requested");
        Ok(())
    }

    /// Wait until no traversal is in progress. Fails with `Busy` on timeout.
    pub fn wait_idle(&self, handle: DeviceHandle, timeout: Duration) -> Result<()> {
        let slot = self.slot(handle)?;
        let deadline = Instant::now() + timeout;
        let mut idle = slot.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while slot.active.load(Ordering::SeqCst) != 0 {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Busy(handle));
            }
            idle = slot
                .idle_cond
                .wait_timeout(idle, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(())
    }

    /// Allow traversals again after a drain.
    pub fn resume(&self, handle: DeviceHandle) -> Result<()> {
        let slot = self.slot(handle)?;
        slot.draining.store(false, Ordering::SeqCst);
        tracing::debug!(device = handle.0, "device resumed");
        Ok(())
    }

    fn reset_inner(&self, handle: DeviceHandle, unconfigure: bool) -> Result<()> {
        let slot = self.slot(handle)?;
        if slot.active.load(Ordering::SeqCst) != 0 {
            return Err(Error::Busy(handle));
        }
        let mut device = slot.device.write().unwrap_or_else(PoisonError::into_inner);
        // A traversal that started before the write lock was taken has
        // finished by now; one that started after it sees the reset state.
        device.reset_state(unconfigure);
        tracing::debug!(device = handle.0, unconfigure, "device reset");
        Ok(())
    }

    /// Reset the device: status and features cleared, every queue's indices
    /// zeroed. Ring addresses are kept.
    pub fn reset(&self, handle: DeviceHandle) -> Result<()> {
        self.reset_inner(handle, false)
    }

    /// Reset and also drop every queue's ring configuration (guest writes
    /// status 0).
    pub fn deactivate(&self, handle: DeviceHandle) -> Result<()> {
        self.reset_inner(handle, true)
    }

    /// Remove a device. Its queue kicks are stopped so workers exit.
    pub fn unregister(&self, handle: DeviceHandle) -> Result<()> {
        let slot = self.slot(handle)?;
        if slot.active.load(Ordering::SeqCst) != 0 {
            return Err(Error::Busy(handle));
        }
        slot.draining.store(true, Ordering::SeqCst);
        {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = slots.get_mut(handle.0 as usize) {
                *entry = None;
            }
        }
        let device = slot.device.read().unwrap_or_else(PoisonError::into_inner);
        for kick in &device.kicks {
            kick.stop();
        }
        tracing::debug!(device = handle.0, "device unregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::device_type;
    use crate::device::virtio::kick::KickWait;
    use crate::testing::{GuestDriver, DATA_BASE};

    fn console_device(queues: u16) -> VirtioDevice {
        VirtioDevice::new(
            device_type::CONSOLE,
            1 << 0,
            vec![0x50, 0, 0x19, 0, 1, 0, 0, 0],
            queues,
            256,
            LineId(3),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let registry: DeviceRegistry = DeviceRegistry::new();
        let a = registry.register(console_device(2));
        let b = registry.register(console_device(1));
        assert_ne!(a, b);
        assert_eq!(registry.handles(), vec![a, b]);

        let device = registry.lookup(a).unwrap();
        let device = device.read();
        assert_eq!(device.handle(), a);
        assert_eq!(device.device_type(), device_type::CONSOLE);
        assert_eq!(device.num_queues(), 2);
        assert!(matches!(
            device.queue(2),
            Err(Error::UnknownQueue { queue: 2, .. })
        ));
        assert!(matches!(
            registry.lookup(DeviceHandle(7)),
            Err(Error::UnknownDevice(DeviceHandle(7)))
        ));
    }

    #[test]
    fn test_negotiate_features_never_grants_unoffered() {
        let registry: DeviceRegistry = DeviceRegistry::new();
        let handle = registry.register(console_device(2));
        let agreed = registry
            .negotiate_features(handle, (1 << 0) | (1 << 5) | feature::VIRTIO_RING_F_EVENT_IDX)
            .unwrap();
        assert_eq!(agreed, (1 << 0) | feature::VIRTIO_RING_F_EVENT_IDX);

        let device = registry.lookup(handle).unwrap();
        let device = device.read();
        assert_eq!(device.acked_features(), agreed);
        assert!(device.queue(1).unwrap().event_idx());
    }

    #[test]
    fn test_config_space() {
        let mut device = console_device(1);
        let mut buf = [0u8; 4];
        device.read_config(6, &mut buf);
        assert_eq!(buf, [0, 0, 0, 0]);
        device.read_config(0, &mut buf);
        assert_eq!(buf, [0x50, 0, 0x19, 0]);

        device.update_config(0, &[0x78]);
        assert_eq!(device.config()[0], 0x78);
        assert_eq!(device.config_generation(), 1);
        assert_eq!(device.interrupt_status(), interrupt::CONFIG_CHANGE);
        assert_eq!(device.clear_interrupt_status(interrupt::CONFIG_CHANGE), 0);

        device.write_config(u64::MAX, &[1, 2]);
        assert_eq!(device.config().len(), 8);
    }

    #[test]
    fn test_reset_refused_while_traversing() {
        let registry: DeviceRegistry = DeviceRegistry::new();
        let handle = registry.register(console_device(2));

        let guard = registry.begin_traversal(handle).unwrap();
        assert!(matches!(registry.reset(handle), Err(Error::Busy(h)) if h == handle));
        assert!(matches!(registry.unregister(handle), Err(Error::Busy(_))));

        registry.request_drain(handle).unwrap();
        assert!(matches!(
            registry.begin_traversal(handle),
            Err(Error::Draining(_))
        ));
        assert!(matches!(
            registry.wait_idle(handle, Duration::from_millis(5)),
            Err(Error::Busy(_))
        ));

        drop(guard);
        registry.wait_idle(handle, Duration::from_secs(1)).unwrap();
        registry.reset(handle).unwrap();
        registry.resume(handle).unwrap();
        assert!(registry.begin_traversal(handle).is_ok());
    }

    #[test]
    fn test_reset_cascades_to_queues() {
        let registry: DeviceRegistry = DeviceRegistry::new();
        let handle = registry.register(console_device(1));
        let mut driver = GuestDriver::new(8);
        let device = registry.lookup(handle).unwrap();

        {
            let device = device.read();
            let mut queue = device.queue(0).unwrap();
            driver.configure(&mut *queue);
            driver.write_desc(0, DATA_BASE, 8, 0, 0);
            driver.publish(0);
            let chain = queue.pop_available(driver.memory()).unwrap().unwrap();
            queue.complete(driver.memory(), chain.head(), 0).unwrap();
        }
        device.write().set_status(0x0F);

        registry.reset(handle).unwrap();
        {
            let device = device.read();
            assert_eq!(device.status(), 0);
            let queue = device.queue(0).unwrap();
            assert_eq!(queue.last_avail_idx(), 0);
            assert_eq!(queue.next_used_idx(), 0);
            assert!(queue.is_ready());
        }

        registry.deactivate(handle).unwrap();
        assert!(!device.read().queue(0).unwrap().is_ready());
    }

    #[test]
    fn test_unregister_stops_workers() {
        let registry: DeviceRegistry = DeviceRegistry::new();
        let handle = registry.register(console_device(1));
        let kick = registry.lookup(handle).unwrap().read().kick(0).unwrap();

        registry.unregister(handle).unwrap();
        assert_eq!(kick.wait(None), KickWait::Stopped);
        assert!(matches!(
            registry.lookup(handle),
            Err(Error::UnknownDevice(_))
        ));
        // Handles are not reused.
        assert_eq!(registry.register(console_device(1)), DeviceHandle(1));
    }
}
