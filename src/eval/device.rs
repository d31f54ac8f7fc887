use crate::error::{Error, Result};
use crate::eval::{kernels, operands, Backend};
use crate::memory::MemType;
use crate::tensor::Tensor;
use crate::{Element, OpKind};

/// Data-parallel kernels issued on the destination tensor's stream.
///
/// Synchronous launches wait for the stream and push `Managed` results back
/// to the host copy, asynchronous ones leave both to the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceBackend;

fn finish<T: Element>(dst: &mut Tensor<T>, is_async: bool) -> Result<()> {
    if is_async {
        return Ok(());
    }
    dst.wait()
}

fn check<T: Element>(op: &OpKind, tensors: &[&Tensor<T>]) -> Result<()> {
    match tensors.iter().find(|t| !t.mem_type().needs_device()) {
        Some(t) => Err(Error::UnsupportedResidency {
            op: op.name(),
            mem: t.mem_type(),
        }),
        None => Ok(()),
    }
}

impl<T: Element> Backend<T> for DeviceBackend {
    fn name(&self) -> &'static str {
        "device"
    }

    fn supports(&self, _op: &OpKind, mem: MemType) -> bool {
        mem.needs_device()
    }

    fn forward(&self, op: &OpKind, inputs: &[&Tensor<T>], out: &mut Tensor<T>, is_async: bool) -> Result<()> {
        check(op, inputs)?;
        check(op, &[&*out])?;

        let sh = out.shape().clone();
        let ops = operands(inputs);
        let stream = out.stream().clone();
        stream.launch(op.name(), || kernels::forward(op, &ops, out.data_mut(), &sh, true));
        finish(out, is_async)
    }

    fn backward(
        &self,
        op: &OpKind,
        slot: usize,
        inputs: &[&Tensor<T>],
        output: &Tensor<T>,
        upstream: &Tensor<T>,
        grad: &mut Tensor<T>,
        is_async: bool,
    ) -> Result<()> {
        check(op, inputs)?;
        check(op, &[output, upstream, &*grad])?;

        let ops = operands(inputs);
        let stream = grad.stream().clone();
        stream.launch(op.name(), || {
            kernels::backward(
                op,
                slot,
                &ops,
                output.data(),
                output.shape(),
                upstream.data(),
                grad.data_mut(),
                true,
            )
        });
        finish(grad, is_async)
    }
}
