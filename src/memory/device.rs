//! Software accelerator runtime.
//!
//! Devices keep an allocation table and a byte budget, streams keep a queue
//! of issued work. Work issued on a [Stream] executes eagerly on the host, the
//! queue only tracks what a caller would still have to wait for, so every
//! "asynchronous" primitive here keeps the ordering contract of a real vendor
//! runtime: nothing issued is observable as complete until [Stream::synchronize].

use std::fmt::Display;
use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use slotmap::{new_key_type, SlotMap};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::memory::{MemType, Scalar};

new_key_type! {
    /// Handle of one live device allocation
    pub struct AllocKey;
}

/// Abort on a driver-level failure.
///
/// There is no safe way to resume after a failed transfer or launch, so this
/// logs the failing primitive and panics instead of returning an [Error].
#[track_caller]
pub fn fault(primitive: &str, msg: impl Display) -> ! {
    log::error!("{primitive}: {msg}");
    panic!("accelerator fault in {primitive}: {msg}")
}

#[derive(Debug, Clone, Copy)]
struct AllocInfo {
    bytes: usize,
    unified: bool,
}

#[derive(Debug)]
pub struct Device {
    id: usize,
    capacity: usize,
    allocs: Mutex<SlotMap<AllocKey, AllocInfo>>,
}

impl Device {
    pub fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            allocs: Mutex::new(SlotMap::with_key()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn table(&self) -> MutexGuard<'_, SlotMap<AllocKey, AllocInfo>> {
        self.allocs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `len` zeroed elements. `CudaManaged` allocations are unified,
    /// i.e. addressable from both sides.
    pub fn alloc<T: Scalar>(self: &Arc<Self>, len: usize, mem: MemType) -> Result<DeviceBuffer<T>> {
        let bytes = len
            .checked_mul(size_of::<T>())
            .ok_or(Error::Alloc { bytes: usize::MAX, mem })?;

        let mut table = self.table();
        let used: usize = table.values().map(|a| a.bytes).sum();
        if used.saturating_add(bytes) > self.capacity {
            log::debug!("device {}: {bytes} bytes requested, {used}/{} in use", self.id, self.capacity);
            return Err(Error::Alloc { bytes, mem });
        }

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| Error::Alloc { bytes, mem })?;
        data.resize(len, T::default());

        let unified = mem == MemType::CudaManaged;
        let key = table.insert(AllocInfo { bytes, unified });
        log::debug!("device {}: alloc {key:?} {bytes} bytes (unified={unified})", self.id);

        Ok(DeviceBuffer {
            data,
            key,
            unified,
            device: self.clone(),
        })
    }

    fn free(&self, key: AllocKey) {
        match self.table().remove(key) {
            Some(info) => log::debug!("device {}: free {key:?} {} bytes", self.id, info.bytes),
            None => fault("free", format_args!("{key:?} is not a live allocation on device {}", self.id)),
        }
    }

    pub fn is_live(&self, key: AllocKey) -> bool {
        self.table().contains_key(key)
    }

    pub fn live_allocations(&self) -> usize {
        self.table().len()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.table().values().map(|a| a.bytes).sum()
    }

    pub fn unified_allocations(&self) -> usize {
        self.table().values().filter(|a| a.unified).count()
    }
}

/// Owned device allocation, released exactly once on drop.
#[derive(Debug)]
pub struct DeviceBuffer<T: Scalar> {
    data: Vec<T>,
    key: AllocKey,
    unified: bool,
    device: Arc<Device>,
}

impl<T: Scalar> DeviceBuffer<T> {
    pub fn key(&self) -> AllocKey {
        self.key
    }

    pub fn is_unified(&self) -> bool {
        self.unified
    }
}

impl<T: Scalar> Deref for DeviceBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<T: Scalar> DerefMut for DeviceBuffer<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl<T: Scalar> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.device.free(self.key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

static STREAM_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct Stream {
    id: u64,
    pending: AtomicUsize,
    issued: AtomicU64,
}

impl Default for Stream {
    fn default() -> Self {
        Self {
            id: STREAM_IDS.fetch_add(1, Ordering::Relaxed),
            pending: AtomicUsize::new(0),
            issued: AtomicU64::new(0),
        }
    }
}

impl Stream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn enqueue(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn memcpy_async<T: Scalar>(&self, dst: &mut [T], src: &[T], kind: CopyKind) {
        if dst.len() != src.len() {
            fault(
                "memcpy_async",
                format_args!("{kind:?} of {} elements into {}", src.len(), dst.len()),
            );
        }
        dst.copy_from_slice(src);
        self.enqueue();
    }

    pub fn memset_async<T: Scalar>(&self, dst: &mut [T]) {
        dst.fill(T::default());
        self.enqueue();
    }

    /// Issue a kernel on this stream
    pub fn launch<R>(&self, name: &str, kernel: impl FnOnce() -> R) -> R {
        log::trace!("stream {}: launch {name}", self.id);
        let ret = kernel();
        self.enqueue();
        ret
    }

    pub fn synchronize(&self) {
        let drained = self.pending.swap(0, Ordering::AcqRel);
        if drained > 0 {
            log::trace!("stream {}: synchronized {drained} ops", self.id);
        }
    }

    /// Work issued since the last [Stream::synchronize]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct Runtime {
    devices: Vec<Arc<Device>>,
    device_memory: usize,
}

impl Runtime {
    pub fn new(num_devices: usize, device_memory: usize) -> Self {
        Self {
            devices: (0..num_devices)
                .map(|id| Arc::new(Device::new(id, device_memory)))
                .collect(),
            device_memory,
        }
    }

    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        log::debug!("runtime: {} devices, {} bytes each", cfg.num_devices, cfg.device_memory);
        Self::new(cfg.num_devices, cfg.device_memory)
    }

    pub fn config(&self) -> RuntimeConfig {
        RuntimeConfig {
            num_devices: self.devices.len(),
            device_memory: self.device_memory,
        }
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, id: usize) -> Result<&Arc<Device>> {
        self.devices.get(id).ok_or(Error::InvalidDevice {
            id,
            available: self.devices.len(),
        })
    }
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Process-wide runtime, sized from [RuntimeConfig::from_env] unless
/// [init] ran first.
pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| Runtime::from_config(&RuntimeConfig::from_env()))
}

/// Create the process-wide runtime with an explicit size.
///
/// Fails with [Error::InvalidConfig] once a runtime of a different size
/// exists, it cannot be resized.
pub fn init(cfg: &RuntimeConfig) -> Result<&'static Runtime> {
    let rt = RUNTIME.get_or_init(|| Runtime::from_config(cfg));
    let live = rt.config();
    if live != *cfg {
        return Err(Error::InvalidConfig(format!(
            "runtime already has {} devices of {} bytes, requested {} of {}",
            live.num_devices, live.device_memory, cfg.num_devices, cfg.device_memory
        )));
    }
    Ok(rt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_released_on_drop() {
        let dev = Arc::new(Device::new(0, 1024));
        let buf = dev.alloc::<f32>(16, MemType::Device).unwrap();
        let key = buf.key();
        assert!(dev.is_live(key));
        assert_eq!(dev.bytes_in_use(), 64);
        drop(buf);
        assert!(!dev.is_live(key));
        assert_eq!(dev.live_allocations(), 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let dev = Arc::new(Device::new(0, 100));
        let _a = dev.alloc::<u8>(60, MemType::Device).unwrap();
        let err = dev.alloc::<u8>(60, MemType::Device).unwrap_err();
        assert_eq!(err, Error::Alloc { bytes: 60, mem: MemType::Device });
    }

    #[test]
    fn unified_flag() {
        let dev = Arc::new(Device::new(0, 1024));
        let a = dev.alloc::<i32>(4, MemType::CudaManaged).unwrap();
        let _b = dev.alloc::<i32>(4, MemType::Device).unwrap();
        assert!(a.is_unified());
        assert_eq!(dev.unified_allocations(), 1);
    }

    #[test]
    fn stream_tracks_pending_work() {
        let s = Stream::new();
        let mut dst = [0u32; 3];
        s.memcpy_async(&mut dst, &[1, 2, 3], CopyKind::HostToDevice);
        s.launch("noop", || ());
        assert_eq!(s.pending(), 2);
        s.synchronize();
        assert_eq!(s.pending(), 0);
        assert_eq!(s.issued(), 2);
        assert_eq!(dst, [1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "memcpy_async")]
    fn mismatched_transfer_faults() {
        let s = Stream::new();
        let mut dst = [0u8; 2];
        s.memcpy_async(&mut dst, &[1, 2, 3], CopyKind::DeviceToDevice);
    }

    #[test]
    fn invalid_device_id() {
        let rt = Runtime::new(2, 1024);
        assert!(rt.device(1).is_ok());
        assert_eq!(
            rt.device(2).unwrap_err(),
            Error::InvalidDevice { id: 2, available: 2 }
        );
    }

    #[test]
    fn init_rejects_a_different_size() {
        let live = runtime().config();
        assert!(init(&live).is_ok());

        let bigger = RuntimeConfig {
            num_devices: live.num_devices + 1,
            ..live.clone()
        };
        assert!(matches!(init(&bigger), Err(Error::InvalidConfig(_))));
        assert_eq!(runtime().config(), live);
    }
}
