//! Queue workers.
//!
//! A [`QueueWorker`] serves one queue of one device on a dedicated thread: it
//! sleeps on the queue's kick, drains the queue through the device backend
//! and raises the device's interrupt line for the completions it published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::kick::{KickWait, QueueKick};
use super::queue::VirtQueue;
use super::registry::{DeviceHandle, DeviceRegistry};
use super::{interrupt, status};
use crate::arch::{Barrier, HostBarrier};
use crate::device::DeviceBackend;
use crate::error::{Error, Result};
use crate::irq::{InterruptInjector, SourceId};
use crate::memory::{GuestMemory, GuestMemoryCell};

/// How a worker waits for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Sleep until kicked; poll anyway every `timeout` to pick up entries
    /// published while kicks were suppressed.
    Blocking { timeout: Duration },
    /// Poll continuously, yielding between passes.
    LowLatency,
}

impl Default for PollMode {
    fn default() -> Self {
        PollMode::Blocking {
            timeout: Duration::from_millis(100),
        }
    }
}

/// Shared handles a queue pass needs.
#[derive(Debug)]
pub struct QueueContext<B: Barrier = HostBarrier> {
    pub registry: Arc<DeviceRegistry<B>>,
    pub injector: Arc<InterruptInjector>,
    pub memory: Arc<GuestMemoryCell>,
}

impl<B: Barrier> Clone for QueueContext<B> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            injector: Arc::clone(&self.injector),
            memory: Arc::clone(&self.memory),
        }
    }
}

impl<B: Barrier> QueueContext<B> {
    /// Run one pass over queue `queue_index` of `handle`: drain it through
    /// `backend` until no new entries race in, then raise the device line if
    /// anything was completed. Returns the number of completions.
    pub fn service_queue(
        &self,
        handle: DeviceHandle,
        queue_index: u16,
        backend: &dyn DeviceBackend<B>,
    ) -> Result<usize> {
        let guard = self.registry.begin_traversal(handle)?;
        let mem = self.memory.current();
        let (result, line) = {
            let device = guard.device();
            let mut queue = device.queue(queue_index)?;
            if !queue.is_ready() {
                return Ok(0);
            }

            let start = queue.next_used_idx();
            let result = drain(backend, queue_index, &mut queue, &mem);
            if queue.next_used_idx() != start {
                device.set_interrupt_status(interrupt::USED_BUFFER);
                self.injector
                    .raise(device.line(), SourceId::queue(queue_index)?, &mut queue, &mem)?;
            }
            (result, device.line())
        };

        // The backend lost track of its own chains; the ring state can no
        // longer be trusted.
        if let Err(Error::UnknownChain(head)) = &result {
            tracing::error!(device = handle.0, queue = queue_index, head, "device needs reset");
            let device = self.registry.lookup(handle)?;
            let mut device = device.write();
            let needs_reset = device.status() | status::DEVICE_NEEDS_RESET;
            device.set_status(needs_reset);
            device.set_interrupt_status(interrupt::CONFIG_CHANGE);
            drop(device);
            self.injector.assert_line(line, SourceId::CONFIG)?;
        }
        result
    }
}

fn drain<B: Barrier>(
    backend: &dyn DeviceBackend<B>,
    queue_index: u16,
    queue: &mut VirtQueue<B>,
    mem: &GuestMemory,
) -> Result<usize> {
    let mut total = 0;
    loop {
        queue.disable_notification(mem)?;
        let processed = backend.process_queue(queue_index, queue, mem);
        // Kicks come back on whether or not the backend failed.
        let raced = queue.enable_notification(mem);
        let completed = processed?;
        total += completed;
        let raced = raced?;
        // A backend that made no progress (e.g. receive queue without input)
        // leaves entries available; don't spin on them.
        if completed == 0 || !raced {
            return Ok(total);
        }
    }
}

/// Counters of a finished worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub passes: u64,
    pub completions: u64,
    pub errors: u64,
}

/// Thread serving one queue.
#[derive(Debug)]
pub struct QueueWorker {
    device: DeviceHandle,
    queue: u16,
    running: Arc<AtomicBool>,
    kick: Arc<QueueKick>,
    handle: Option<JoinHandle<WorkerStats>>,
}

impl QueueWorker {
    /// Start serving queue `queue` of `device` with `backend`.
    pub fn spawn<B: Barrier>(
        ctx: QueueContext<B>,
        device: DeviceHandle,
        queue: u16,
        backend: Arc<dyn DeviceBackend<B>>,
        mode: PollMode,
    ) -> Result<Self> {
        let kick = ctx.registry.lookup(device)?.read().kick(queue)?;
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = Arc::clone(&running);
            let kick = Arc::clone(&kick);
            std::thread::Builder::new()
                .name(format!("vmio-dev{device}-q{queue}"))
                .spawn(move || run(ctx, device, queue, backend.as_ref(), mode, &running, &kick))?
        };

        tracing::debug!(device = device.0, queue, ?mode, "queue worker started");
        Ok(Self {
            device,
            queue,
            running,
            kick,
            handle: Some(handle),
        })
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn queue(&self) -> u16 {
        self.queue
    }

    /// Check if the worker thread is still serving.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the worker to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.kick.kick();
    }

    /// Stop the worker and wait for it.
    pub fn join(mut self) -> WorkerStats {
        self.stop();
        self.handle
            .take()
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop();
            let _ = handle.join();
        }
    }
}

fn run<B: Barrier>(
    ctx: QueueContext<B>,
    device: DeviceHandle,
    queue: u16,
    backend: &dyn DeviceBackend<B>,
    mode: PollMode,
    running: &AtomicBool,
    kick: &QueueKick,
) -> WorkerStats {
    let mut stats = WorkerStats::default();

    while running.load(Ordering::SeqCst) {
        let wait = match mode {
            PollMode::Blocking { timeout } => kick.wait(Some(timeout)),
            PollMode::LowLatency => {
                if kick.is_stopped() {
                    KickWait::Stopped
                } else {
                    kick.take();
                    std::thread::yield_now();
                    KickWait::Kicked
                }
            }
        };
        if wait == KickWait::Stopped || !running.load(Ordering::SeqCst) {
            break;
        }

        stats.passes += 1;
        match ctx.service_queue(device, queue, backend) {
            Ok(n) => stats.completions += n as u64,
            Err(Error::Draining(_)) => {}
            Err(Error::UnknownDevice(_)) => break,
            Err(err) => {
                stats.errors += 1;
                tracing::warn!(device = device.0, queue, "queue pass failed: {err}");
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    tracing::debug!(device = device.0, queue, ?stats, "queue worker exited");
    stats
}
