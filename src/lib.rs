pub mod config;
pub mod error;
pub mod eval;
pub mod graph;
pub mod memory;
pub mod optim;
pub mod tensor;

use std::iter::Sum;

use num_traits::{Float, FromPrimitive};
use smallvec::SmallVec;

use eval::kernels::Gemm;

pub use config::{Config, RuntimeConfig};
pub use error::{status, Error, Result};
pub use graph::{BackwardPass, Gradients, Graph};
pub use memory::{MemType, MemoryManager, Scalar};
pub use tensor::Tensor;

/// Ordered dimension sizes, all positive
pub type Shape = SmallVec<usize, 4>;

pub fn prod(s: &[usize]) -> usize {
    s.iter().product()
}

pub fn shape(dims: &[usize]) -> Shape {
    dims.iter().copied().collect()
}

/// Element type for graph arithmetic
pub trait Element: Scalar + Float + FromPrimitive + Sum + Gemm {}

impl<T: Scalar + Float + FromPrimitive + Sum + Gemm> Element for T {}

slotmap::new_key_type! {
    /// Handle of an operation node inside a [Graph]
    pub struct Node;
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum VKind {
    /// Caller-provided data, no gradient
    Input,
    /// Trainable, gradients are reported for it
    Param,
    /// Filled with a constant
    Const(f64),
}

/// Convolution geometry. A dilation of 0 means a dense kernel.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Conv2dParams {
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    /// When false the kernel is flipped (true convolution)
    pub cross_correlation: bool,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            pad_h: 0,
            pad_w: 0,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 0,
            dilation_w: 0,
            cross_correlation: true,
        }
    }
}

/// `O = 1 + (I - K_eff + 2P) / S` with `K_eff = 1 + (K - 1)(D + 1)`.
///
/// `None` if the stride is zero or the dilated kernel does not fit the padded input.
pub fn conv_output_extent(input: usize, kernel: usize, pad: usize, stride: usize, dilation: usize) -> Option<usize> {
    if stride == 0 || kernel == 0 {
        return None;
    }
    let k_eff = 1 + (kernel - 1) * (dilation + 1);
    let padded = input + 2 * pad;
    padded.checked_sub(k_eff).map(|d| 1 + d / stride)
}

impl Conv2dParams {
    /// NCHW output shape of convolving `input` (NCHW) with `filter` (KCHW)
    pub fn output_shape(&self, input: &[usize], filter: &[usize]) -> Result<Shape> {
        let [n, c, h, w] = four(input)?;
        let [k, fc, kh, kw] = four(filter)?;
        if c != fc {
            return Err(Error::ShapeMismatch(format!(
                "conv2d: input has {c} channels, filter expects {fc}"
            )));
        }
        let oh = conv_output_extent(h, kh, self.pad_h, self.stride_h, self.dilation_h);
        let ow = conv_output_extent(w, kw, self.pad_w, self.stride_w, self.dilation_w);
        match (oh, ow) {
            (Some(oh), Some(ow)) => Ok(shape(&[n, k, oh, ow])),
            _ => Err(Error::ShapeMismatch(format!(
                "conv2d: filter {filter:?} with {self:?} does not fit input {input:?}"
            ))),
        }
    }
}

fn four(s: &[usize]) -> Result<[usize; 4]> {
    s.try_into()
        .map_err(|_| Error::ShapeMismatch(format!("expected a rank-4 shape, got {s:?}")))
}

#[derive(Debug, PartialEq, Clone)]
pub enum OpKind {
    Value(VKind),
    /// y = -x
    Neg,
    /// Element-wise addition
    Add,
    /// Element-wise multiplication
    Mul,
    /// y = x^power
    Pow { power: i32 },
    /// y = alpha * x
    Scale { alpha: f64 },
    /// Sum over `axis`, or over everything into a `[1]` tensor
    ReduceSum { axis: Option<usize> },
    /// Rank-2 product `[m, k] x [k, n]`
    MatMul,
    /// 1st operand is the NCHW image, 2nd the KCHW filter
    Conv2d(Conv2dParams),
    /// y = max(0, x)
    Relu,
    Sigmoid,
    /// Per sample (dim 0) over all remaining elements
    Softmax,
    /// `-(1/N) sum(gt * ln(pred))`, operands are `[pred, gt]`
    CrossEntropy,
}

impl OpKind {
    pub fn is_leaf(&self) -> bool {
        matches!(self, OpKind::Value(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Value(_) => "value",
            OpKind::Neg => "neg",
            OpKind::Add => "add",
            OpKind::Mul => "mul",
            OpKind::Pow { .. } => "pow",
            OpKind::Scale { .. } => "scale",
            OpKind::ReduceSum { .. } => "reduce_sum",
            OpKind::MatMul => "matmul",
            OpKind::Conv2d(_) => "conv2d",
            OpKind::Relu => "relu",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Softmax => "softmax",
            OpKind::CrossEntropy => "cross_entropy",
        }
    }
}
