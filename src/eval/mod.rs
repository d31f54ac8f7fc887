mod cpu;
mod device;
pub mod kernels;

use std::fmt::Debug;
use std::sync::Arc;

pub use cpu::HostBackend;
pub use device::DeviceBackend;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::memory::MemType;
use crate::tensor::Tensor;
use crate::{Element, OpKind};
use kernels::Operand;

/// Core trait for performing actual computation.
///
/// A backend is picked for every operation node when the node is built, and
/// is then handed the node's operand tensors on each `eval`/`grad`. It must
/// not resize `out`, and must leave it fully defined on success.
pub trait Backend<T: Element>: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Can this backend run `op` on tensors with residency `mem`
    fn supports(&self, op: &OpKind, mem: MemType) -> bool;

    /// Compute `out = op(inputs)`. With `is_async` set the backend may return
    /// before the work has completed on the output's stream.
    fn forward(&self, op: &OpKind, inputs: &[&Tensor<T>], out: &mut Tensor<T>, is_async: bool) -> Result<()>;

    /// Accumulate the gradient of operand `slot` into `grad`, given the
    /// forward `output` and the `upstream` gradient of the node.
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        op: &OpKind,
        slot: usize,
        inputs: &[&Tensor<T>],
        output: &Tensor<T>,
        upstream: &Tensor<T>,
        grad: &mut Tensor<T>,
        is_async: bool,
    ) -> Result<()>;
}

pub(crate) fn operands<'a, T: Element>(inputs: &[&'a Tensor<T>]) -> SmallVec<Operand<'a, T>, 2> {
    inputs
        .iter()
        .map(|t| Operand {
            data: t.data(),
            shape: t.shape(),
        })
        .collect()
}

/// Backends available to a graph, one per side.
#[derive(Debug, Clone)]
pub struct Backends<T: Element> {
    host: Arc<dyn Backend<T>>,
    device: Option<Arc<dyn Backend<T>>>,
}

impl<T: Element> Default for Backends<T> {
    fn default() -> Self {
        Self::new(Arc::new(HostBackend), Some(Arc::new(DeviceBackend)))
    }
}

impl<T: Element> Backends<T> {
    pub fn new(host: Arc<dyn Backend<T>>, device: Option<Arc<dyn Backend<T>>>) -> Self {
        Self { host, device }
    }

    /// Registry without accelerator support
    pub fn host_only() -> Self {
        Self::new(Arc::new(HostBackend), None)
    }

    pub fn resolve(&self, op: &OpKind, mem: MemType) -> Result<Arc<dyn Backend<T>>> {
        let candidate = if mem.needs_device() {
            self.device.as_ref()
        } else {
            Some(&self.host)
        };

        match candidate {
            Some(b) if b.supports(op, mem) => {
                log::debug!("{} on {mem}: {}", op.name(), b.name());
                Ok(b.clone())
            }
            _ => Err(Error::UnsupportedResidency { op: op.name(), mem }),
        }
    }
}
