use crate::error::{Error, Result};
use crate::eval::{kernels, operands, Backend};
use crate::memory::MemType;
use crate::tensor::Tensor;
use crate::{Element, OpKind};

/// Sequential loops over host buffers.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl HostBackend {
    fn check(op: &OpKind, tensors: &[&Tensor<impl Element>]) -> Result<()> {
        match tensors.iter().find(|t| t.mem_type() != MemType::Host) {
            Some(t) => Err(Error::UnsupportedResidency {
                op: op.name(),
                mem: t.mem_type(),
            }),
            None => Ok(()),
        }
    }
}

impl<T: Element> Backend<T> for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn supports(&self, _op: &OpKind, mem: MemType) -> bool {
        mem == MemType::Host
    }

    fn forward(&self, op: &OpKind, inputs: &[&Tensor<T>], out: &mut Tensor<T>, _is_async: bool) -> Result<()> {
        Self::check(op, inputs)?;
        Self::check(op, &[&*out])?;

        let sh = out.shape().clone();
        kernels::forward(op, &operands(inputs), out.data_mut(), &sh, false);
        Ok(())
    }

    fn backward(
        &self,
        op: &OpKind,
        slot: usize,
        inputs: &[&Tensor<T>],
        output: &Tensor<T>,
        upstream: &Tensor<T>,
        grad: &mut Tensor<T>,
        _is_async: bool,
    ) -> Result<()> {
        Self::check(op, inputs)?;
        Self::check(op, &[output, upstream, &*grad])?;

        kernels::backward(
            op,
            slot,
            &operands(inputs),
            output.data(),
            output.shape(),
            upstream.data(),
            grad.data_mut(),
            false,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_device_tensors() {
        let a = Tensor::<f32>::new(&[2], MemType::Device, 0).unwrap();
        let mut out = Tensor::<f32>::new(&[2], MemType::Host, 0).unwrap();
        let err = HostBackend.forward(&OpKind::Neg, &[&a], &mut out, false).unwrap_err();
        assert_eq!(
            err,
            Error::UnsupportedResidency {
                op: "neg",
                mem: MemType::Device
            }
        );
    }

    #[test]
    fn elementwise() {
        let a = Tensor::from_slice(&[3], &[1.0, -2.0, 3.0], MemType::Host, 0).unwrap();
        let b = Tensor::from_slice(&[3], &[2.0, 2.0, 2.0], MemType::Host, 0).unwrap();
        let mut out = Tensor::new(&[3], MemType::Host, 0).unwrap();

        HostBackend.forward(&OpKind::Mul, &[&a, &b], &mut out, false).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![2.0, -4.0, 6.0]);

        HostBackend.forward(&OpKind::Relu, &[&a], &mut out, false).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![1.0, 0.0, 3.0]);
    }
}
