//! Device memory ownership for the compiled-engine backend.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{trace, warn};

use crate::error::InferenceError;
use crate::Result;

/// Raw memory on an accelerator.
///
/// Pointers are plain handles; ownership is tracked by [`DeviceBuffer`].
pub trait Device: Send + Sync {
    type Ptr: Copy + fmt::Debug + Send + Sync;

    /// Allocate `bytes` bytes of device memory.
    fn alloc(&self, bytes: usize) -> Result<Self::Ptr>;

    /// Release memory returned by [`Device::alloc`]. Called once per pointer.
    fn free(&self, ptr: Self::Ptr);

    /// Copy host bytes to the start of a device allocation.
    fn copy_to_device(&self, dst: Self::Ptr, src: &[u8]) -> Result<()>;

    /// Copy the first `dst.len()` bytes of a device allocation to the host.
    fn copy_to_host(&self, dst: &mut [u8], src: Self::Ptr) -> Result<()>;
}

/// A device allocation released when dropped.
pub struct DeviceBuffer<D: Device> {
    device: Arc<D>,
    ptr: D::Ptr,
    bytes: usize,
}

impl<D: Device> DeviceBuffer<D> {
    pub fn new(device: Arc<D>, bytes: usize) -> Result<Self> {
        let ptr = device.alloc(bytes)?;
        trace!("Allocated {} device bytes at {:?}", bytes, ptr);
        Ok(Self { device, ptr, bytes })
    }

    pub fn ptr(&self) -> D::Ptr {
        self.ptr
    }

    /// Size of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Host-to-device copy of at most the buffer's size.
    pub fn upload(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.bytes {
            return Err(InferenceError::DeviceMemory(format!(
                "upload of {} bytes exceeds buffer of {} bytes",
                data.len(),
                self.bytes
            )));
        }
        self.device.copy_to_device(self.ptr, data)
    }

    /// Device-to-host copy into a freshly allocated buffer of `bytes` bytes.
    pub fn download(&self, bytes: usize) -> Result<Vec<u8>> {
        if bytes > self.bytes {
            return Err(InferenceError::DeviceMemory(format!(
                "download of {} bytes exceeds buffer of {} bytes",
                bytes, self.bytes
            )));
        }
        let mut host = vec![0u8; bytes];
        self.device.copy_to_host(&mut host, self.ptr)?;
        Ok(host)
    }
}

impl<D: Device> Drop for DeviceBuffer<D> {
    fn drop(&mut self) {
        trace!("Freeing {} device bytes at {:?}", self.bytes, self.ptr);
        self.device.free(self.ptr);
    }
}

impl<D: Device> fmt::Debug for DeviceBuffer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Fixed-size device allocations indexed by binding position.
pub struct DeviceArena<D: Device> {
    device: Arc<D>,
    buffers: Vec<DeviceBuffer<D>>,
}

impl<D: Device> DeviceArena<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            buffers: Vec::new(),
        }
    }

    /// Allocate the next buffer and return its index.
    pub fn allocate(&mut self, bytes: usize) -> Result<usize> {
        let buffer = DeviceBuffer::new(Arc::clone(&self.device), bytes)?;
        self.buffers.push(buffer);
        Ok(self.buffers.len() - 1)
    }

    pub fn get(&self, index: usize) -> Option<&DeviceBuffer<D>> {
        self.buffers.get(index)
    }

    /// Raw pointers in binding order, as handed to the execution context.
    pub fn ptrs(&self) -> Vec<D::Ptr> {
        self.buffers.iter().map(DeviceBuffer::ptr).collect()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.buffers.iter().map(DeviceBuffer::len).sum()
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

/// Handle to a [`HostDevice`] allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPtr(u64);

/// Allocation counters of a [`HostDevice`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostDeviceStats {
    pub allocations: usize,
    pub frees: usize,
    pub live_bytes: usize,
    /// Size of every allocation made, in allocation order.
    pub allocation_sizes: Vec<usize>,
}

#[derive(Default)]
struct HostHeap {
    next: u64,
    blocks: HashMap<u64, Vec<u8>>,
    stats: HostDeviceStats,
}

/// Host memory standing in for accelerator memory.
///
/// Used when no accelerator is present; keeps allocation accounting so
/// ownership bugs surface as unbalanced counters.
#[derive(Default)]
pub struct HostDevice {
    heap: Mutex<HostHeap>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> HostDeviceStats {
        self.lock().stats.clone()
    }

    fn lock(&self) -> MutexGuard<'_, HostHeap> {
        // A poisoned heap is still structurally valid.
        self.heap.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Device for HostDevice {
    type Ptr = HostPtr;

    fn alloc(&self, bytes: usize) -> Result<HostPtr> {
        let mut heap = self.lock();
        let id = heap.next;
        heap.next += 1;
        heap.blocks.insert(id, vec![0u8; bytes]);
        heap.stats.allocations += 1;
        heap.stats.live_bytes += bytes;
        heap.stats.allocation_sizes.push(bytes);
        Ok(HostPtr(id))
    }

    fn free(&self, ptr: HostPtr) {
        let mut heap = self.lock();
        let removed = heap.blocks.remove(&ptr.0);
        match removed {
            Some(block) => {
                heap.stats.frees += 1;
                heap.stats.live_bytes -= block.len();
            }
            None => warn!("Free of unknown device pointer {:?}", ptr),
        }
    }

    fn copy_to_device(&self, dst: HostPtr, src: &[u8]) -> Result<()> {
        let mut heap = self.lock();
        let block = heap
            .blocks
            .get_mut(&dst.0)
            .ok_or_else(|| InferenceError::DeviceMemory(format!("invalid device pointer {:?}", dst)))?;
        if src.len() > block.len() {
            return Err(InferenceError::DeviceMemory(format!(
                "copy of {} bytes into {} byte allocation",
                src.len(),
                block.len()
            )));
        }
        block[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn copy_to_host(&self, dst: &mut [u8], src: HostPtr) -> Result<()> {
        let heap = self.lock();
        let block = heap
            .blocks
            .get(&src.0)
            .ok_or_else(|| InferenceError::DeviceMemory(format!("invalid device pointer {:?}", src)))?;
        if dst.len() > block.len() {
            return Err(InferenceError::DeviceMemory(format!(
                "copy of {} bytes out of {} byte allocation",
                dst.len(),
                block.len()
            )));
        }
        dst.copy_from_slice(&block[..dst.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_buffer_freed_on_drop() {
        let device = Arc::new(HostDevice::new());
        {
            let buffer = DeviceBuffer::new(Arc::clone(&device), 64).unwrap();
            assert_eq!(buffer.len(), 64);
            assert_eq!(device.stats().live_bytes, 64);
        }

        let stats = device.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn test_upload_download() {
        let device = Arc::new(HostDevice::new());
        let buffer = DeviceBuffer::new(Arc::clone(&device), 8).unwrap();

        buffer.upload(&[1, 2, 3]).unwrap();
        assert_eq!(buffer.download(4).unwrap(), vec![1, 2, 3, 0]);

        assert!(buffer.upload(&[0u8; 9]).is_err());
        assert!(buffer.download(9).is_err());
    }

    #[test]
    fn test_arena_releases_everything() {
        let device = Arc::new(HostDevice::new());
        let mut arena = DeviceArena::new(Arc::clone(&device));
        assert_eq!(arena.allocate(16).unwrap(), 0);
        assert_eq!(arena.allocate(32).unwrap(), 1);
        assert_eq!(arena.total_bytes(), 48);
        assert_eq!(arena.ptrs().len(), 2);

        drop(arena);

        let stats = device.stats();
        assert_eq!(stats.allocation_sizes, vec![16, 32]);
        assert_eq!(stats.frees, 2);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn test_invalid_pointer_copy_fails() {
        let device = HostDevice::new();
        let ptr = device.alloc(4).unwrap();
        device.free(ptr);

        assert!(device.copy_to_device(ptr, &[1]).is_err());
        let mut host = [0u8; 1];
        assert!(device.copy_to_host(&mut host, ptr).is_err());
    }
}
