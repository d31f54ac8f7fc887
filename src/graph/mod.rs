mod autograd;

pub use autograd::{BackwardPass, Gradients};

use std::collections::BTreeMap;
use std::ops::Index;
use std::sync::Arc;

use rand::distributions::{Distribution, Uniform};
use slotmap::{SecondaryMap, SlotMap};
use smallvec::{smallvec, SmallVec};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::eval::{Backend, Backends};
use crate::memory::MemType;
use crate::tensor::{check_shape, Tensor};
use crate::{prod, shape, Conv2dParams, Element, Node, OpKind, Shape, VKind};

/// Metadata of one node. Residency and shape are fixed when the node is built.
#[derive(Debug)]
pub struct NodeData<T: Element> {
    pub nm: Option<Arc<str>>,
    pub op: OpKind,
    pub src: SmallVec<Node, 2>,
    pub sh: Shape,
    pub mem: MemType,
    pub device: usize,
    /// Some parameter is reachable through this node
    pub want_grad: bool,
    /// Skip the stream synchronize after this node's kernels
    pub is_async: bool,
    // live consumers
    refs: usize,
    // `None` for leaves
    backend: Option<Arc<dyn Backend<T>>>,
}

/// Core struct for recording and running the computation graph.
///
/// Leaves own their tensors from construction on, operation nodes allocate
/// their output lazily on the first [Graph::eval] and keep it until removed.
#[derive(Debug)]
pub struct Graph<T: Element> {
    cfg: Config,
    backends: Backends<T>,
    // Current scope
    scp: String,
    nodes: SlotMap<Node, NodeData<T>>,
    // Output tensors
    out: SecondaryMap<Node, Tensor<T>>,
    // Node names
    nme: BTreeMap<Arc<str>, Node>,
}

impl<T: Element> Index<Node> for Graph<T> {
    type Output = NodeData<T>;

    fn index(&self, index: Node) -> &Self::Output {
        &self.nodes[index]
    }
}

impl<T: Element> Default for Graph<T> {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl<T: Element> Graph<T> {
    pub fn new(cfg: Config) -> Self {
        Self::with_backends(cfg, Backends::default())
    }

    pub fn with_backends(cfg: Config, backends: Backends<T>) -> Self {
        Self {
            cfg,
            backends,
            scp: String::new(),
            nodes: SlotMap::with_key(),
            out: SecondaryMap::new(),
            nme: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn node(&self, n: Node) -> Result<&NodeData<T>> {
        self.nodes.get(n).ok_or(Error::UnknownNode(n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn shape(&self, n: Node) -> Result<&Shape> {
        Ok(&self.node(n)?.sh)
    }

    pub fn mem_type(&self, n: Node) -> Result<MemType> {
        Ok(self.node(n)?.mem)
    }

    /// All trainable leaves
    pub fn params(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|(_, d)| d.op == OpKind::Value(VKind::Param))
            .map(|(n, _)| n)
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<Node> {
        self.nme.get(name).copied()
    }

    /// Run `fun` with `name.` prepended to every name given inside it
    pub fn scope<R>(&mut self, name: &str, fun: impl FnOnce(&mut Self) -> R) -> R {
        let plen = self.scp.len();
        self.scp.push_str(name);
        self.scp.push('.');

        let ret = fun(self);

        self.scp.truncate(plen);
        ret
    }

    pub fn named(&mut self, name: &str, n: Node) -> Result<Node> {
        self.node(n)?;
        let nm: Arc<str> = Arc::from(format!("{}{name}", self.scp));
        if self.nme.contains_key(&nm) {
            return Err(Error::DuplicateName(nm.to_string()));
        }

        if let Some(old) = self.nodes[n].nm.replace(nm.clone()) {
            self.nme.remove(&old);
        }
        self.nme.insert(nm, n);
        Ok(n)
    }

    pub fn set_async(&mut self, n: Node, is_async: bool) -> Result<()> {
        self.nodes
            .get_mut(n)
            .ok_or(Error::UnknownNode(n))?
            .is_async = is_async;
        Ok(())
    }

    fn leaf(&mut self, kind: VKind, sh: &[usize], mem: MemType, device: usize, data: Option<&[T]>) -> Result<Node> {
        check_shape(sh)?;
        let ten = match (kind, data) {
            (_, Some(data)) => Tensor::from_slice(sh, data, mem, device)?,
            (VKind::Input, None) => Tensor::new(sh, mem, device)?,
            (VKind::Param, None) => {
                let dist = Uniform::new(-1.0f64, 1.0);
                let mut rng = rand::thread_rng();
                let init: Vec<T> = (0..prod(sh))
                    .map(|_| T::from_f64(dist.sample(&mut rng)).unwrap_or_else(T::zero))
                    .collect();
                Tensor::from_slice(sh, &init, mem, device)?
            }
            (VKind::Const(v), None) => Tensor::filled(sh, T::from_f64(v).unwrap_or_else(T::nan), mem, device)?,
        };

        let n = self.nodes.insert(NodeData {
            nm: None,
            op: OpKind::Value(kind),
            src: SmallVec::new(),
            sh: shape(sh),
            mem,
            device,
            want_grad: kind == VKind::Param,
            is_async: self.cfg.async_exec,
            refs: 0,
            backend: None,
        });
        self.out.insert(n, ten);
        log::debug!("leaf {n:?} {kind:?} {sh:?} on {mem}/{device}");
        Ok(n)
    }

    // a leaf that cannot be named is dropped again
    fn named_leaf(&mut self, name: &str, n: Node) -> Result<Node> {
        match self.named(name, n) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.remove(n)?;
                Err(e)
            }
        }
    }

    /// Zero-filled input on the configured residency
    pub fn input(&mut self, sh: &[usize]) -> Result<Node> {
        self.input_on(sh, self.cfg.mem_type, self.cfg.device_id)
    }

    pub fn input_on(&mut self, sh: &[usize], mem: MemType, device: usize) -> Result<Node> {
        self.leaf(VKind::Input, sh, mem, device, None)
    }

    /// Input with the shape and residency of `like`
    pub fn input_like(&mut self, like: Node) -> Result<Node> {
        let d = self.node(like)?;
        let (sh, mem, device) = (d.sh.clone(), d.mem, d.device);
        self.input_on(&sh, mem, device)
    }

    /// Named input holding `data`
    pub fn variable(&mut self, name: &str, sh: &[usize], data: &[T]) -> Result<Node> {
        self.variable_on(name, sh, data, self.cfg.mem_type, self.cfg.device_id)
    }

    pub fn variable_on(&mut self, name: &str, sh: &[usize], data: &[T], mem: MemType, device: usize) -> Result<Node> {
        let n = self.leaf(VKind::Input, sh, mem, device, Some(data))?;
        self.named_leaf(name, n)
    }

    /// Trainable leaf, initialized uniformly in `[-1, 1)`
    pub fn param(&mut self, name: &str, sh: &[usize]) -> Result<Node> {
        self.param_on(name, sh, self.cfg.mem_type, self.cfg.device_id)
    }

    pub fn param_on(&mut self, name: &str, sh: &[usize], mem: MemType, device: usize) -> Result<Node> {
        let n = self.leaf(VKind::Param, sh, mem, device, None)?;
        self.named_leaf(name, n)
    }

    pub fn constant(&mut self, value: f64, sh: &[usize]) -> Result<Node> {
        self.constant_on(value, sh, self.cfg.mem_type, self.cfg.device_id)
    }

    pub fn constant_on(&mut self, value: f64, sh: &[usize], mem: MemType, device: usize) -> Result<Node> {
        self.leaf(VKind::Const(value), sh, mem, device, None)
    }

    fn push(&mut self, op: OpKind, src: &[Node], sh: Shape) -> Result<Node> {
        let first = self.node(src[0])?;
        let (mem, device) = (first.mem, first.device);
        let mut want_grad = false;
        for &s in src {
            let d = self.node(s)?;
            if (d.mem, d.device) != (mem, device) {
                return Err(Error::ResidencyMismatch(mem, device, d.mem, d.device));
            }
            want_grad |= d.want_grad;
        }
        let backend = self.backends.resolve(&op, mem)?;

        for &s in src {
            self.nodes[s].refs += 1;
        }
        let n = self.nodes.insert(NodeData {
            nm: None,
            op,
            src: src.iter().copied().collect(),
            sh,
            mem,
            device,
            want_grad,
            is_async: self.cfg.async_exec,
            refs: 0,
            backend: Some(backend),
        });
        log::trace!("{n:?} = {}{src:?}", self.nodes[n].op.name());
        Ok(n)
    }

    fn _unop(&mut self, op: OpKind, t: Node) -> Result<Node> {
        let sh = self.node(t)?.sh.clone();
        self.push(op, &[t], sh)
    }

    fn _same_binop(&mut self, op: OpKind, t1: Node, t2: Node) -> Result<Node> {
        let (s1, s2) = (&self.node(t1)?.sh, &self.node(t2)?.sh);
        if s1 != s2 {
            return Err(Error::ShapeMismatch(format!("{}: {s1:?} vs {s2:?}", op.name())));
        }
        let sh = s1.clone();
        self.push(op, &[t1, t2], sh)
    }

    pub fn neg(&mut self, t: Node) -> Result<Node> {
        self._unop(OpKind::Neg, t)
    }

    pub fn add(&mut self, t1: Node, t2: Node) -> Result<Node> {
        self._same_binop(OpKind::Add, t1, t2)
    }

    pub fn sub(&mut self, t1: Node, t2: Node) -> Result<Node> {
        let t2 = self.neg(t2)?;
        self.add(t1, t2)
    }

    pub fn mul(&mut self, t1: Node, t2: Node) -> Result<Node> {
        self._same_binop(OpKind::Mul, t1, t2)
    }

    pub fn pow(&mut self, t: Node, power: i32) -> Result<Node> {
        self._unop(OpKind::Pow { power }, t)
    }

    pub fn scale(&mut self, alpha: f64, t: Node) -> Result<Node> {
        self._unop(OpKind::Scale { alpha }, t)
    }

    /// Sum along `axis`, dropping it, or over everything when `None`
    pub fn reduce_sum(&mut self, axis: Option<usize>, t: Node) -> Result<Node> {
        let src = &self.node(t)?.sh;
        let sh = match axis {
            None => smallvec![1],
            Some(a) if a >= src.len() => {
                return Err(Error::AxisOutOfRange {
                    axis: a,
                    rank: src.len(),
                })
            }
            Some(_) if src.len() == 1 => smallvec![1],
            Some(a) => src.iter().enumerate().filter(|(i, _)| *i != a).map(|(_, d)| *d).collect(),
        };
        self.push(OpKind::ReduceSum { axis }, &[t], sh)
    }

    pub fn mean(&mut self, t: Node) -> Result<Node> {
        let n = prod(&self.node(t)?.sh);
        let sum = self.reduce_sum(None, t)?;
        self.scale(1.0 / n as f64, sum)
    }

    pub fn matmul(&mut self, a: Node, b: Node) -> Result<Node> {
        let (sa, sb) = (self.node(a)?.sh.clone(), self.node(b)?.sh.clone());
        match (sa.as_slice(), sb.as_slice()) {
            (&[m, k1], &[k2, n]) if k1 == k2 => self.push(OpKind::MatMul, &[a, b], smallvec![m, n]),
            _ => Err(Error::ShapeMismatch(format!("matmul: {sa:?} x {sb:?}"))),
        }
    }

    pub fn conv2d(&mut self, x: Node, w: Node, params: Conv2dParams) -> Result<Node> {
        let sh = params.output_shape(&self.node(x)?.sh, &self.node(w)?.sh)?;
        self.push(OpKind::Conv2d(params), &[x, w], sh)
    }

    pub fn relu(&mut self, t: Node) -> Result<Node> {
        self._unop(OpKind::Relu, t)
    }

    pub fn sigmoid(&mut self, t: Node) -> Result<Node> {
        self._unop(OpKind::Sigmoid, t)
    }

    pub fn softmax(&mut self, t: Node) -> Result<Node> {
        self._unop(OpKind::Softmax, t)
    }

    /// `pred` holds probabilities, `gt` the target distribution
    pub fn cross_entropy(&mut self, pred: Node, gt: Node) -> Result<Node> {
        let (sp, sg) = (&self.node(pred)?.sh, &self.node(gt)?.sh);
        if sp != sg {
            return Err(Error::ShapeMismatch(format!("cross_entropy: {sp:?} vs {sg:?}")));
        }
        self.push(OpKind::CrossEntropy, &[pred, gt], smallvec![1])
    }

    /// `sum((gt - pred)^2) / gt.shape[0]`
    pub fn mse(&mut self, gt: Node, pred: Node) -> Result<Node> {
        let n = self.node(gt)?.sh[0];
        let diff = self.sub(gt, pred)?;
        let sq = self.pow(diff, 2)?;
        let sum = self.reduce_sum(None, sq)?;
        self.scale(1.0 / n as f64, sum)
    }

    /// Evaluate `n` and return its output.
    ///
    /// Cached outputs are returned as-is unless `recompute` is set, in which case
    /// the whole subtree is evaluated again.
    pub fn eval(&mut self, n: Node, recompute: bool) -> Result<&Tensor<T>> {
        self.eval_inner(n, recompute)?;
        Ok(&self.out[n])
    }

    pub(crate) fn eval_inner(&mut self, n: Node, recompute: bool) -> Result<()> {
        let d = self.node(n)?;
        let Some(backend) = d.backend.clone() else {
            // leaves are always current
            return Ok(());
        };
        if !recompute && self.out.contains_key(n) {
            return Ok(());
        }

        let src = d.src.clone();
        for &s in &src {
            self.eval_inner(s, recompute)?;
        }

        // a failed recompute leaves no output behind, the buffer may be half written
        let d = &self.nodes[n];
        let mut out = match self.out.remove(n) {
            Some(t) => t,
            None => Tensor::new(&d.sh, d.mem, d.device)?,
        };
        let inputs: SmallVec<&Tensor<T>, 2> = src.iter().map(|s| &self.out[*s]).collect();
        log::trace!("eval {n:?} {} on {}", d.op.name(), backend.name());
        if let Err(e) = backend.forward(&d.op, &inputs, &mut out, d.is_async) {
            log::debug!("eval {n:?} {} failed: {e}", d.op.name());
            return Err(e);
        }
        drop(inputs);
        self.out.insert(n, out);
        Ok(())
    }

    /// Cached output, `None` before the first evaluation
    pub fn output(&self, n: Node) -> Option<&Tensor<T>> {
        self.out.get(n)
    }

    fn leaf_mut(&mut self, n: Node) -> Result<&mut Tensor<T>> {
        if !self.node(n)?.op.is_leaf() {
            return Err(Error::NotALeaf(n));
        }
        Ok(&mut self.out[n])
    }

    /// Overwrite the data of a leaf. Consumers see it after `eval(.., true)`.
    pub fn write(&mut self, n: Node, data: &[T]) -> Result<()> {
        self.leaf_mut(n)?.write(data)
    }

    pub fn tensor_mut(&mut self, n: Node) -> Result<&mut Tensor<T>> {
        self.leaf_mut(n)
    }

    /// Drop `root` and every node only reachable through it.
    ///
    /// Returns the number of removed nodes.
    pub fn remove(&mut self, root: Node) -> Result<usize> {
        let Some(d) = self.nodes.get(root) else {
            log::warn!("remove: {root:?} is not part of this graph");
            return Ok(0);
        };
        if d.refs > 0 {
            return Err(Error::InUse(root));
        }

        let mut removed = 0;
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            let Some(d) = self.nodes.remove(n) else {
                continue;
            };
            self.out.remove(n);
            if let Some(nm) = &d.nm {
                self.nme.remove(nm);
            }
            removed += 1;

            for s in d.src {
                let c = &mut self.nodes[s];
                c.refs -= 1;
                if c.refs == 0 {
                    stack.push(s);
                }
            }
        }
        log::debug!("removed {removed} nodes under {root:?}");
        Ok(removed)
    }
}
