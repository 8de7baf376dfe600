//! Virtio console device.
//!
//! Single-port console: queue 0 carries host input to the guest, queue 1
//! carries guest output to a host writer.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::chain::DescriptorChain;
use super::kick::QueueKick;
use super::queue::VirtQueue;
use crate::arch::Barrier;
use crate::debug_queue;
use crate::device::{device_type, DeviceBackend};
use crate::error::Result;
use crate::memory::{Access, GuestMemory};

/// Receive queue (host to guest).
pub const RX_QUEUE: u16 = 0;
/// Transmit queue (guest to host).
pub const TX_QUEUE: u16 = 1;

/// Console size is reported in configuration space.
pub const VIRTIO_CONSOLE_F_SIZE: u64 = 1 << 0;
/// Emergency write register is supported.
pub const VIRTIO_CONSOLE_F_EMERG_WRITE: u64 = 1 << 2;

/// Configuration space layout.
mod config {
    pub const COLS: usize = 0;
    pub const ROWS: usize = 2;
    pub const MAX_NR_PORTS: usize = 4;
    pub const EMERG_WR: u64 = 8;
    pub const SIZE: usize = 12;
}

/// Virtio console device.
pub struct VirtioConsole {
    cols: u16,
    rows: u16,
    /// Input buffer (data from host to guest)
    input: Mutex<VecDeque<u8>>,
    /// Output writer
    output: Mutex<Box<dyn Write + Send>>,
    /// Kick of the receive queue, set once the device is registered.
    rx_kick: Mutex<Option<Arc<QueueKick>>>,
}

impl std::fmt::Debug for VirtioConsole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtioConsole")
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("buffered_input", &self.buffered_input())
            .finish_non_exhaustive()
    }
}

impl VirtioConsole {
    /// Create a new virtio-console device that writes to stdout.
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Create a new virtio-console device with a custom output writer.
    pub fn with_output(output: Box<dyn Write + Send>) -> Self {
        Self {
            cols: 80,
            rows: 25,
            input: Mutex::new(VecDeque::new()),
            output: Mutex::new(output),
            rx_kick: Mutex::new(None),
        }
    }

    /// Set the console size reported to the guest.
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Configuration space image for a console of `cols` x `rows`.
    pub fn size_config(cols: u16, rows: u16) -> [u8; 4] {
        let mut raw = [0u8; 4];
        raw[..2].copy_from_slice(&cols.to_le_bytes());
        raw[2..].copy_from_slice(&rows.to_le_bytes());
        raw
    }

    /// Wake the receive queue's worker when input arrives.
    pub fn attach_rx_kick(&self, kick: Arc<QueueKick>) {
        *self.rx_kick.lock().unwrap_or_else(PoisonError::into_inner) = Some(kick);
    }

    /// Queue input data (from host to guest).
    pub fn queue_input(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.lock_input().extend(data);
        if let Some(kick) = &*self.rx_kick.lock().unwrap_or_else(PoisonError::into_inner) {
            kick.kick();
        }
    }

    /// Bytes waiting for a receive buffer.
    pub fn buffered_input(&self) -> usize {
        self.lock_input().len()
    }

    fn lock_input(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_output(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy buffered input into the writable buffers of `chain`. Returns the
    /// number of bytes written, or 0 if a buffer lies outside guest memory.
    fn fill_rx(&self, chain: &DescriptorChain, mem: &GuestMemory) -> u32 {
        let mut input = self.lock_input();
        let mut slices = Vec::new();
        for desc in chain.writable() {
            match mem.translate(desc.addr, u64::from(desc.len), Access::Write) {
                Ok(slice) => slices.push(slice),
                Err(err) => {
                    tracing::warn!(head = chain.head(), "console receive buffer rejected: {err}");
                    return 0;
                }
            }
        }

        let mut written = 0usize;
        for slice in slices {
            let n = slice.len().min(input.len());
            if n == 0 {
                break;
            }
            let bytes: Vec<u8> = input.drain(..n).collect();
            if slice.write_at(0, &bytes).is_err() {
                break;
            }
            written += n;
        }
        written as u32
    }

    /// Gather the readable buffers of `chain`, or `None` if one lies outside
    /// guest memory.
    fn gather_tx(chain: &DescriptorChain, mem: &GuestMemory) -> Option<Vec<u8>> {
        let mut data = Vec::new();
        for desc in chain.readable() {
            match mem.translate(desc.addr, u64::from(desc.len), Access::Read) {
                Ok(slice) => data.extend_from_slice(&slice.to_vec()),
                Err(err) => {
                    tracing::warn!(head = chain.head(), "console transmit buffer rejected: {err}");
                    return None;
                }
            }
        }
        Some(data)
    }

    fn process_rx<B: Barrier>(&self, queue: &mut VirtQueue<B>, mem: &GuestMemory) -> Result<usize> {
        let mut completed = 0;
        while self.buffered_input() > 0 {
            let Some(chain) = queue.next_chain(mem)? else {
                break;
            };
            let written = self.fill_rx(&chain, mem);
            queue.complete(mem, chain.head(), written)?;
            completed += 1;
        }
        Ok(completed)
    }

    fn process_tx<B: Barrier>(&self, queue: &mut VirtQueue<B>, mem: &GuestMemory) -> Result<usize> {
        let mut completed = 0;
        let mut failure = None;
        while let Some(chain) = queue.next_chain(mem)? {
            if let Some(data) = Self::gather_tx(&chain, mem) {
                let mut output = self.lock_output();
                if let Err(err) = output.write_all(&data).and_then(|_| output.flush()) {
                    failure.get_or_insert(err);
                }
                debug_queue!(head = chain.head(), bytes = data.len(), "console output");
            }
            queue.complete(mem, chain.head(), 0)?;
            completed += 1;
        }
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(completed),
        }
    }
}

impl Default for VirtioConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Barrier> DeviceBackend<B> for VirtioConsole {
    fn device_type(&self) -> u32 {
        device_type::CONSOLE
    }

    fn features(&self) -> u64 {
        VIRTIO_CONSOLE_F_SIZE | VIRTIO_CONSOLE_F_EMERG_WRITE
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn config_space(&self) -> Vec<u8> {
        let mut raw = vec![0u8; config::SIZE];
        raw[config::COLS..config::ROWS + 2].copy_from_slice(&Self::size_config(self.cols, self.rows));
        raw[config::MAX_NR_PORTS..config::MAX_NR_PORTS + 4].copy_from_slice(&1u32.to_le_bytes());
        raw
    }

    fn process_queue(
        &self,
        queue_index: u16,
        queue: &mut VirtQueue<B>,
        mem: &GuestMemory,
    ) -> Result<usize> {
        match queue_index {
            RX_QUEUE => self.process_rx(queue, mem),
            TX_QUEUE => self.process_tx(queue, mem),
            _ => Ok(0),
        }
    }

    fn config_write(&self, offset: u64, data: &[u8]) {
        if offset == config::EMERG_WR {
            if let Some(&byte) = data.first() {
                let mut output = self.lock_output();
                if let Err(err) = output.write_all(&[byte]).and_then(|_| output.flush()) {
                    tracing::warn!("console emergency write failed: {err}");
                }
            }
        }
    }

    fn reset(&self) {
        self.lock_input().clear();
    }
}
