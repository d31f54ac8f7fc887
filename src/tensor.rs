use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memory::device::Stream;
use crate::memory::{MemType, MemoryManager, Scalar};
use crate::{prod, Element, Shape};

pub(crate) fn check_shape(sh: &[usize]) -> Result<()> {
    if sh.is_empty() || sh.contains(&0) {
        return Err(Error::ShapeMismatch(format!(
            "dimensions must be positive, got {sh:?}"
        )));
    }
    Ok(())
}

/// Shaped view over exactly one [MemoryManager], which it owns.
#[derive(Debug)]
pub struct Tensor<T: Scalar> {
    sh: Shape,
    mem: MemoryManager<T>,
}

impl<T: Scalar> Tensor<T> {
    /// Zero-filled tensor
    pub fn new(shape: &[usize], mem: MemType, device: usize) -> Result<Self> {
        check_shape(shape)?;
        Ok(Self {
            sh: crate::shape(shape),
            mem: MemoryManager::new(prod(shape), mem, device)?,
        })
    }

    pub fn from_slice(shape: &[usize], data: &[T], mem: MemType, device: usize) -> Result<Self> {
        let mut t = Self::new(shape, mem, device)?;
        t.write(data)?;
        Ok(t)
    }

    pub fn filled(shape: &[usize], value: T, mem: MemType, device: usize) -> Result<Self> {
        Self::from_slice(shape, &vec![value; prod(shape)], mem, device)
    }

    /// Overwrite the whole tensor from host data
    pub fn write(&mut self, data: &[T]) -> Result<()> {
        if data.len() != self.size() {
            return Err(Error::ShapeMismatch(format!(
                "{} values for a tensor of shape {:?}",
                data.len(),
                self.sh
            )));
        }
        self.mem.copy_from_all(&MemoryManager::from_vec(data.to_vec()))
    }

    pub fn shape(&self) -> &Shape {
        &self.sh
    }

    pub fn get_shape(&self, axis: usize) -> Result<usize> {
        self.sh.get(axis).copied().ok_or(Error::AxisOutOfRange {
            axis,
            rank: self.rank(),
        })
    }

    pub fn rank(&self) -> usize {
        self.sh.len()
    }

    pub fn size(&self) -> usize {
        self.mem.size()
    }

    pub fn mem_type(&self) -> MemType {
        self.mem.mem_type()
    }

    pub fn device_id(&self) -> usize {
        self.mem.device_id()
    }

    pub fn memory(&self) -> &MemoryManager<T> {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut MemoryManager<T> {
        &mut self.mem
    }

    pub fn stream(&self) -> &Arc<Stream> {
        self.mem.stream()
    }

    pub fn get(&self, idx: usize) -> Result<T> {
        self.mem.get(idx)
    }

    pub fn set(&mut self, idx: usize, val: T) -> Result<()> {
        self.mem.set(idx, val)
    }

    /// Row-major multi-index access
    pub fn get_at(&self, idx: &[usize]) -> Result<T> {
        if idx.len() != self.rank() {
            return Err(Error::ShapeMismatch(format!(
                "index {idx:?} for shape {:?}",
                self.sh
            )));
        }
        let mut flat = 0;
        for (&x, &d) in idx.iter().zip(self.sh.iter()) {
            if x >= d {
                return Err(Error::IndexOutOfBounds { index: x, size: d });
            }
            flat = flat * d + x;
        }
        self.get(flat)
    }

    /// Buffer handed to kernels, see [MemoryManager::get_ptr]
    pub fn data(&self) -> &[T] {
        self.mem.get_ptr()
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        self.mem.get_ptr_mut()
    }

    /// Coherent host copy of the contents
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut host = MemoryManager::new(self.size(), MemType::Host, 0)?;
        host.copy_from_all(&self.mem)?;
        Ok(host.host_slice().unwrap_or_default().to_vec())
    }

    pub fn copy_from(&mut self, src: &Tensor<T>) -> Result<()> {
        if src.sh != self.sh {
            return Err(Error::ShapeMismatch(format!(
                "copy {:?} into {:?}",
                src.sh, self.sh
            )));
        }
        self.mem.copy_from_all(&src.mem)
    }

    pub fn zero(&mut self) -> Result<()> {
        self.mem.zero()
    }

    pub fn sync(&mut self, gpu_was_modified: bool) -> Result<()> {
        self.mem.sync(gpu_was_modified)
    }

    /// Block on the stream, then refresh a `Managed` host copy from the
    /// device copy kernels wrote to.
    pub fn wait(&mut self) -> Result<()> {
        if self.mem_type() == MemType::Host {
            return Ok(());
        }
        self.stream().synchronize();
        if self.mem_type() == MemType::Managed {
            self.mem.sync(true)?;
        }
        Ok(())
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            sh: self.sh.clone(),
            mem: self.mem.try_clone()?,
        })
    }
}

impl<T: Element> Tensor<T> {
    /// `self += alpha * x`
    pub fn axpy(&mut self, alpha: T, x: &Tensor<T>) -> Result<()> {
        if x.sh != self.sh {
            return Err(Error::ShapeMismatch(format!(
                "axpy {:?} into {:?}",
                x.sh, self.sh
            )));
        }
        let (mem, dev) = (self.mem_type(), self.device_id());
        if (x.mem_type(), x.device_id()) != (mem, dev) {
            return Err(Error::ResidencyMismatch(mem, dev, x.mem_type(), x.device_id()));
        }

        let stream = self.stream().clone();
        let dst = self.mem.get_ptr_mut();
        let src = x.data();
        let mut kernel = || {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = *d + alpha * *s;
            }
        };

        if mem == MemType::Host {
            kernel();
            return Ok(());
        }
        stream.launch("axpy", kernel);
        self.wait()
    }

    pub fn add_assign(&mut self, x: &Tensor<T>) -> Result<()> {
        self.axpy(T::one(), x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_queries() {
        let t = Tensor::<f32>::new(&[2, 3, 4], MemType::Host, 0).unwrap();
        assert_eq!(t.size(), 24);
        assert_eq!(t.get_shape(1).unwrap(), 3);
        assert_eq!(
            t.get_shape(3),
            Err(Error::AxisOutOfRange { axis: 3, rank: 3 })
        );
        assert!(Tensor::<f32>::new(&[2, 0], MemType::Host, 0).is_err());
        assert!(Tensor::<f32>::new(&[], MemType::Host, 0).is_err());
    }

    #[test]
    fn multi_index() {
        let t = Tensor::from_slice(&[2, 3], &[0., 1., 2., 3., 4., 5.], MemType::Device, 0).unwrap();
        assert_eq!(t.get_at(&[1, 2]).unwrap(), 5.0);
        assert_eq!(t.get_at(&[0, 1]).unwrap(), 1.0);
        assert!(t.get_at(&[2, 0]).is_err());
        assert!(t.get_at(&[0]).is_err());
    }

    #[test]
    fn wait_refreshes_managed_host_copy() {
        let mut t = Tensor::<f32>::new(&[3], MemType::Managed, 0).unwrap();
        let stream = t.stream().clone();
        let dst = t.data_mut();
        stream.launch("fill", || dst.fill(4.0));
        assert_eq!(t.memory().host_slice().unwrap(), &[0.0, 0.0, 0.0]);

        t.wait().unwrap();
        assert_eq!(t.stream().pending(), 0);
        assert_eq!(t.to_vec().unwrap(), vec![4.0, 4.0, 4.0]);
    }

    #[test]
    fn axpy_across_residencies() {
        for mem in MemType::ALL {
            let mut a = Tensor::from_slice(&[3], &[1.0, 2.0, 3.0], mem, 0).unwrap();
            let b = Tensor::from_slice(&[3], &[1.0, 1.0, 1.0], mem, 0).unwrap();
            a.axpy(-2.0, &b).unwrap();
            assert_eq!(a.to_vec().unwrap(), vec![-1.0, 0.0, 1.0], "{mem}");
        }
    }

    #[test]
    fn axpy_rejects_mixed_residency() {
        let mut a = Tensor::<f64>::new(&[2], MemType::Host, 0).unwrap();
        let b = Tensor::<f64>::new(&[2], MemType::Device, 0).unwrap();
        assert!(matches!(a.add_assign(&b), Err(Error::ResidencyMismatch(..))));
    }

    #[test]
    fn write_checks_length() {
        let mut t = Tensor::<i32>::new(&[2, 2], MemType::Managed, 0).unwrap();
        assert!(t.write(&[1, 2, 3]).is_err());
        t.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(t.data(), &[1, 2, 3, 4]);
    }
}
