pub mod device;

use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};
use device::{runtime, CopyKind, DeviceBuffer, Stream};

/// Element bound for anything stored in a [MemoryManager]
pub trait Scalar: Copy + Default + Send + Sync + Debug + 'static {}

impl<T: Copy + Default + Send + Sync + Debug + 'static> Scalar for T {}

/// Which memory space(s) back a buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemType {
    #[default]
    Host,
    Device,
    /// Separate host and device buffers, reconciled only by [MemoryManager::sync]
    Managed,
    /// One allocation addressable from both sides, coherence owned by the runtime
    CudaManaged,
}

impl MemType {
    pub const ALL: [MemType; 4] = [
        MemType::Host,
        MemType::Device,
        MemType::Managed,
        MemType::CudaManaged,
    ];

    pub fn needs_device(self) -> bool {
        self != MemType::Host
    }
}

impl Display for MemType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MemType::Host => "host",
            MemType::Device => "device",
            MemType::Managed => "managed",
            MemType::CudaManaged => "cuda_managed",
        })
    }
}

impl FromStr for MemType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(MemType::Host),
            "device" => Ok(MemType::Device),
            "managed" => Ok(MemType::Managed),
            "cuda_managed" | "cudamanaged" => Ok(MemType::CudaManaged),
            o => Err(Error::InvalidConfig(format!("unknown memory type {o:?}"))),
        }
    }
}

#[derive(Debug)]
enum Storage<T: Scalar> {
    Host(Vec<T>),
    Device(DeviceBuffer<T>),
    Managed { host: Vec<T>, device: DeviceBuffer<T> },
    Unified(DeviceBuffer<T>),
}

/// Where the readable side of a copy source lives
#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Host,
    Device,
    Unified,
}

fn host_alloc<T: Scalar>(len: usize, mem: MemType) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::Alloc {
        bytes: len.saturating_mul(std::mem::size_of::<T>()),
        mem,
    })?;
    v.resize(len, T::default());
    Ok(v)
}

/// One logical buffer of `size` elements under a fixed residency policy.
///
/// The buffers implied by the policy are allocated in [MemoryManager::new] and
/// released when the manager is dropped.
///
/// `Managed` storage has two copies. [MemoryManager::get] and [MemoryManager::set]
/// only touch the host copy and never sync; callers that need the device copy to
/// observe scalar writes call [MemoryManager::sync] with `false` themselves.
/// Batched writers rely on this to defer the transfer.
#[derive(Debug)]
pub struct MemoryManager<T: Scalar> {
    size: usize,
    mem_type: MemType,
    device_id: usize,
    storage: Storage<T>,
    stream: Arc<Stream>,
}

impl<T: Scalar> MemoryManager<T> {
    pub fn new(size: usize, mem_type: MemType, device_id: usize) -> Result<Self> {
        let storage = match mem_type {
            MemType::Host => Storage::Host(host_alloc(size, mem_type)?),
            _ => {
                let dev = runtime().device(device_id)?;
                match mem_type {
                    MemType::Device => Storage::Device(dev.alloc(size, mem_type)?),
                    MemType::Managed => Storage::Managed {
                        host: host_alloc(size, mem_type)?,
                        device: dev.alloc(size, mem_type)?,
                    },
                    _ => Storage::Unified(dev.alloc(size, mem_type)?),
                }
            }
        };

        Ok(Self {
            size,
            mem_type,
            device_id,
            storage,
            stream: Stream::new(),
        })
    }

    /// Host manager taking ownership of `data`
    pub fn from_vec(data: Vec<T>) -> Self {
        Self {
            size: data.len(),
            mem_type: MemType::Host,
            device_id: 0,
            storage: Storage::Host(data),
            stream: Stream::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    pub fn set_stream(&mut self, stream: Arc<Stream>) {
        self.stream = stream;
    }

    /// Copy `copy_size` elements of `src`, starting at `begin_idx`, to the start of `self`.
    ///
    /// Synchronous for the caller: transfers touching device memory are issued on
    /// this manager's stream and waited for before returning.
    pub fn copy_from(&mut self, src: &MemoryManager<T>, begin_idx: usize, copy_size: usize) -> Result<()> {
        let end = begin_idx.checked_add(copy_size);
        if copy_size > self.size || end.map_or(true, |e| e > src.size) {
            return Err(Error::Range {
                begin: begin_idx,
                len: copy_size,
                src: src.size,
                dst: self.size,
            });
        }
        if copy_size == 0 {
            return Ok(());
        }

        let range = begin_idx..begin_idx + copy_size;
        let dst_is_device = self.mem_type == MemType::Device;
        let (from, side) = match &src.storage {
            Storage::Host(h) => (&h[range], Side::Host),
            Storage::Device(d) => (&d[range], Side::Device),
            // device-only destinations pull from the device copy
            Storage::Managed { device, .. } if dst_is_device => (&device[range], Side::Device),
            Storage::Managed { host, .. } => (&host[range], Side::Host),
            Storage::Unified(u) => (&u[range], Side::Unified),
        };

        let stream = self.stream.clone();
        let post_sync = match &mut self.storage {
            Storage::Host(h) => {
                if side == Side::Device {
                    stream.memcpy_async(&mut h[..copy_size], from, CopyKind::DeviceToHost);
                    stream.synchronize();
                } else {
                    h[..copy_size].copy_from_slice(from);
                }
                None
            }
            Storage::Device(d) => {
                let kind = match side {
                    Side::Host => CopyKind::HostToDevice,
                    _ => CopyKind::DeviceToDevice,
                };
                stream.memcpy_async(&mut d[..copy_size], from, kind);
                stream.synchronize();
                None
            }
            Storage::Managed { device, .. } if side == Side::Device => {
                stream.memcpy_async(&mut device[..copy_size], from, CopyKind::DeviceToDevice);
                Some(true)
            }
            Storage::Managed { host, .. } => {
                host[..copy_size].copy_from_slice(from);
                Some(false)
            }
            Storage::Unified(u) => {
                if side == Side::Device {
                    stream.memcpy_async(&mut u[..copy_size], from, CopyKind::DeviceToDevice);
                    Some(true)
                } else {
                    u[..copy_size].copy_from_slice(from);
                    Some(false)
                }
            }
        };

        match post_sync {
            Some(gpu_was_modified) => self.sync(gpu_was_modified),
            None => Ok(()),
        }
    }

    /// Copy all of `self.size()` elements from the start of `src`
    pub fn copy_from_all(&mut self, src: &MemoryManager<T>) -> Result<()> {
        self.copy_from(src, 0, self.size)
    }

    /// Independent manager with the same policy, device and contents
    pub fn try_clone(&self) -> Result<Self> {
        let mut out = Self::new(self.size, self.mem_type, self.device_id)?;
        out.copy_from_all(self)?;
        Ok(out)
    }

    /// Reconcile the two sides of `Managed` storage. `gpu_was_modified` picks the
    /// direction (device to host when true). `CudaManaged` only waits on the stream.
    pub fn sync(&mut self, gpu_was_modified: bool) -> Result<()> {
        match &mut self.storage {
            Storage::Managed { host, device } => {
                if gpu_was_modified {
                    self.stream.memcpy_async(host, device, CopyKind::DeviceToHost);
                } else {
                    self.stream.memcpy_async(device, host, CopyKind::HostToDevice);
                }
                self.stream.synchronize();
            }
            Storage::Unified(_) => self.stream.synchronize(),
            Storage::Host(_) | Storage::Device(_) => {}
        }
        Ok(())
    }

    fn check(&self, idx: usize) -> Result<()> {
        if idx < self.size {
            Ok(())
        } else {
            Err(Error::IndexOutOfBounds {
                index: idx,
                size: self.size,
            })
        }
    }

    pub fn get(&self, idx: usize) -> Result<T> {
        self.check(idx)?;
        Ok(match &self.storage {
            Storage::Host(h) | Storage::Managed { host: h, .. } => h[idx],
            Storage::Device(d) => {
                let mut res = [T::default()];
                self.stream
                    .memcpy_async(&mut res, &d[idx..idx + 1], CopyKind::DeviceToHost);
                self.stream.synchronize();
                res[0]
            }
            Storage::Unified(u) => u[idx],
        })
    }

    pub fn set(&mut self, idx: usize, val: T) -> Result<()> {
        self.check(idx)?;
        match &mut self.storage {
            Storage::Host(h) | Storage::Managed { host: h, .. } => h[idx] = val,
            Storage::Device(d) => {
                self.stream
                    .memcpy_async(&mut d[idx..idx + 1], &[val], CopyKind::HostToDevice);
                self.stream.synchronize();
            }
            Storage::Unified(u) => u[idx] = val,
        }
        Ok(())
    }

    /// Clear every owned buffer, waiting for device work before returning
    pub fn zero(&mut self) -> Result<()> {
        match &mut self.storage {
            Storage::Host(h) => h.fill(T::default()),
            Storage::Device(d) | Storage::Unified(d) => {
                self.stream.memset_async(d);
                self.stream.synchronize();
            }
            Storage::Managed { host, device } => {
                host.fill(T::default());
                self.stream.memset_async(device);
                self.stream.synchronize();
            }
        }
        Ok(())
    }

    /// The buffer kernels operate on: the device copy for `Device` and `Managed`,
    /// the shared allocation for `CudaManaged`.
    pub fn get_ptr(&self) -> &[T] {
        match &self.storage {
            Storage::Host(h) => &h[..],
            Storage::Device(d) | Storage::Managed { device: d, .. } | Storage::Unified(d) => &d[..],
        }
    }

    pub fn get_ptr_mut(&mut self) -> &mut [T] {
        match &mut self.storage {
            Storage::Host(h) => &mut h[..],
            Storage::Device(d) | Storage::Managed { device: d, .. } | Storage::Unified(d) => &mut d[..],
        }
    }

    /// Host-addressable view, if the policy has one
    pub fn host_slice(&self) -> Option<&[T]> {
        match &self.storage {
            Storage::Host(h) | Storage::Managed { host: h, .. } => Some(&h[..]),
            Storage::Unified(u) => Some(&u[..]),
            Storage::Device(_) => None,
        }
    }

    pub fn host_slice_mut(&mut self) -> Option<&mut [T]> {
        match &mut self.storage {
            Storage::Host(h) | Storage::Managed { host: h, .. } => Some(&mut h[..]),
            Storage::Unified(u) => Some(&mut u[..]),
            Storage::Device(_) => None,
        }
    }

    /// Keys of the device allocations this manager owns
    pub fn device_allocations(&self) -> Vec<device::AllocKey> {
        match &self.storage {
            Storage::Host(_) => vec![],
            Storage::Device(d) | Storage::Managed { device: d, .. } | Storage::Unified(d) => {
                vec![d.key()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(mem: MemType, data: &[f64]) -> MemoryManager<f64> {
        let mut m = MemoryManager::new(data.len(), mem, 0).unwrap();
        m.copy_from_all(&MemoryManager::from_vec(data.to_vec())).unwrap();
        m
    }

    #[test]
    fn host_get_set() {
        let mut m = MemoryManager::<i32>::new(4, MemType::Host, 0).unwrap();
        m.set(2, 7).unwrap();
        assert_eq!(m.get(2).unwrap(), 7);
        assert_eq!(m.get(0).unwrap(), 0);
    }

    #[test]
    fn out_of_bounds_is_trapped() {
        for mem in MemType::ALL {
            let mut m = MemoryManager::<f32>::new(3, mem, 0).unwrap();
            assert_eq!(m.get(3), Err(Error::IndexOutOfBounds { index: 3, size: 3 }));
            assert!(m.set(10, 1.0).is_err());
        }
    }

    #[test]
    fn partial_copy() {
        let src = MemoryManager::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        for mem in MemType::ALL {
            let mut dst = MemoryManager::<f64>::new(3, mem, 0).unwrap();
            dst.copy_from(&src, 2, 3).unwrap();
            let got: Vec<_> = (0..3).map(|i| dst.get(i).unwrap()).collect();
            assert_eq!(got, vec![3.0, 4.0, 5.0], "{mem}");
        }
    }

    #[test]
    fn bad_ranges_copy_nothing() {
        let src = filled(MemType::Host, &[1.0, 2.0, 3.0]);
        let mut dst = filled(MemType::Host, &[9.0, 9.0]);

        let err = dst.copy_from(&src, 0, 3).unwrap_err();
        assert_eq!(err.code(), 3);
        assert!(dst.copy_from(&src, 2, 2).is_err());
        assert!(dst.copy_from(&src, usize::MAX, 1).is_err());
        assert_eq!(dst.host_slice().unwrap(), &[9.0, 9.0]);
    }

    #[test]
    fn zero_sized_copy_is_noop() {
        let src = MemoryManager::<f32>::new(0, MemType::Device, 0).unwrap();
        let mut dst = MemoryManager::<f32>::new(0, MemType::Managed, 0).unwrap();
        let issued = dst.stream().issued();
        dst.copy_from(&src, 0, 0).unwrap();
        assert_eq!(dst.stream().issued(), issued);
    }

    #[test]
    fn device_copies_are_synchronous() {
        let src = filled(MemType::Host, &[1.0, 2.0]);
        let mut dst = MemoryManager::<f64>::new(2, MemType::Device, 0).unwrap();
        dst.copy_from_all(&src).unwrap();
        assert!(dst.stream().issued() > 0);
        assert_eq!(dst.stream().pending(), 0);
        assert_eq!(dst.get_ptr(), &[1.0, 2.0]);
        assert!(dst.host_slice().is_none());
    }

    #[test]
    fn managed_scalar_writes_stay_on_host_until_sync() {
        let mut m = MemoryManager::<f32>::new(2, MemType::Managed, 0).unwrap();
        m.set(1, 5.0).unwrap();
        assert_eq!(m.get(1).unwrap(), 5.0);
        assert_eq!(m.get_ptr()[1], 0.0);

        m.sync(false).unwrap();
        assert_eq!(m.get_ptr()[1], 5.0);

        m.get_ptr_mut()[0] = 3.0;
        assert_eq!(m.get(0).unwrap(), 0.0);
        m.sync(true).unwrap();
        assert_eq!(m.get(0).unwrap(), 3.0);
    }

    #[test]
    fn managed_copy_pushes_to_device() {
        let m = filled(MemType::Managed, &[4.0, 5.0]);
        assert_eq!(m.get_ptr(), &[4.0, 5.0]);
        assert_eq!(m.host_slice().unwrap(), &[4.0, 5.0]);
    }

    #[test]
    fn zero_clears_both_sides() {
        let mut m = filled(MemType::Managed, &[1.0, 2.0, 3.0]);
        m.zero().unwrap();
        assert_eq!(m.host_slice().unwrap(), &[0.0; 3]);
        assert_eq!(m.get_ptr(), &[0.0; 3]);
        assert_eq!(m.stream().pending(), 0);
    }

    #[test]
    fn clone_is_independent() {
        let a = filled(MemType::CudaManaged, &[1.0, 2.0]);
        let mut b = a.try_clone().unwrap();
        b.set(0, 10.0).unwrap();
        assert_eq!(a.get(0).unwrap(), 1.0);
        assert_eq!(b.mem_type(), MemType::CudaManaged);
    }

    #[test]
    fn invalid_device_is_rejected_only_when_needed() {
        let bad = 1 << 20;
        assert!(MemoryManager::<f32>::new(4, MemType::Host, bad).is_ok());
        for mem in [MemType::Device, MemType::Managed, MemType::CudaManaged] {
            let err = MemoryManager::<f32>::new(4, mem, bad).unwrap_err();
            assert!(matches!(err, Error::InvalidDevice { id, .. } if id == bad));
        }
    }

    #[test]
    fn parses_mem_type() {
        for mem in MemType::ALL {
            assert_eq!(mem.to_string().parse::<MemType>().unwrap(), mem);
        }
        assert!("vram".parse::<MemType>().is_err());
    }
}
