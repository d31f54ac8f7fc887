//! Reverse mode differentiation over a [Graph].
//!
//! Gradients are memoized per `(node, variable)` inside a [BackwardPass]. The
//! pass owns that cache, so starting a new pass is the only way to reset it.

use std::collections::HashMap;

use slotmap::SecondaryMap;
use smallvec::SmallVec;

use super::Graph;
use crate::error::{Error, Result};
use crate::memory::Scalar;
use crate::tensor::Tensor;
use crate::{Element, Node, OpKind, VKind};

/// Gradient cache of one backward pass
#[derive(Debug)]
pub struct BackwardPass<T: Scalar> {
    cache: HashMap<(Node, Node), Tensor<T>>,
    computed: usize,
    hits: usize,
}

impl<T: Scalar> Default for BackwardPass<T> {
    fn default() -> Self {
        Self {
            cache: HashMap::new(),
            computed: 0,
            hits: 0,
        }
    }
}

impl<T: Scalar> BackwardPass<T> {
    /// Gradients computed by a backward kernel
    pub fn computed(&self) -> usize {
        self.computed
    }

    /// Requests answered from the cache
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Cached gradient with outstanding kernel work finished, so either copy
    /// of a `Managed` tensor holds the result.
    fn settled(&mut self, node: Node, var: Node) -> Result<&Tensor<T>> {
        let g = self
            .cache
            .get_mut(&(node, var))
            .ok_or(Error::UnknownVariable { node, var })?;
        g.wait()?;
        Ok(g)
    }
}

/// Result of [Graph::backward]
#[derive(Debug)]
pub struct Gradients<T: Scalar> {
    grads: SecondaryMap<Node, Tensor<T>>,
    computed: usize,
}

impl<T: Scalar> Gradients<T> {
    pub fn get(&self, n: Node) -> Option<&Tensor<T>> {
        self.grads.get(n)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Node, &Tensor<T>)> {
        self.grads.iter()
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Backward kernels run to produce these gradients
    pub fn computed(&self) -> usize {
        self.computed
    }
}

impl<T: Element> Graph<T> {
    pub fn begin_backward(&self) -> BackwardPass<T> {
        BackwardPass::default()
    }

    /// Gradient of `node`'s output with respect to its operand `var`, given the
    /// gradient `upstream` of the loss with respect to `node`.
    ///
    /// `consumer`, when known, is the node `upstream` was propagated from and
    /// must itself consume `node`. The result is cached in `pass` by
    /// `(node, var)`, later requests within the same pass return it unchanged.
    pub fn grad<'p>(
        &mut self,
        pass: &'p mut BackwardPass<T>,
        consumer: Option<Node>,
        node: Node,
        var: Node,
        upstream: &Tensor<T>,
    ) -> Result<&'p Tensor<T>> {
        let d = self.node(node)?;
        if !d.src.contains(&var) {
            return Err(Error::UnknownVariable { node, var });
        }
        if let Some(c) = consumer {
            if !self.node(c)?.src.contains(&node) {
                return Err(Error::UnknownVariable { node: c, var: node });
            }
        }

        let key = (node, var);
        if pass.cache.contains_key(&key) {
            pass.hits += 1;
            return Ok(&pass.cache[&key]);
        }

        if upstream.shape() != &d.sh {
            return Err(Error::ShapeMismatch(format!(
                "upstream gradient {:?} for node of shape {:?}",
                upstream.shape(),
                d.sh
            )));
        }
        if (upstream.mem_type(), upstream.device_id()) != (d.mem, d.device) {
            return Err(Error::ResidencyMismatch(
                d.mem,
                d.device,
                upstream.mem_type(),
                upstream.device_id(),
            ));
        }

        // forward values of the operands
        self.eval_inner(node, false)?;

        let d = &self.nodes[node];
        let Some(backend) = &d.backend else {
            return Err(Error::UnknownVariable { node, var });
        };
        let v = &self.nodes[var];
        let mut grad = Tensor::new(&v.sh, v.mem, v.device)?;

        let inputs: SmallVec<&Tensor<T>, 2> = d.src.iter().map(|s| &self.out[*s]).collect();
        let output = &self.out[node];
        for (slot, _) in d.src.iter().enumerate().filter(|(_, s)| **s == var) {
            log::trace!("grad {node:?} d/d{var:?} slot {slot} {}", d.op.name());
            backend.backward(&d.op, slot, &inputs, output, upstream, &mut grad, d.is_async)?;
        }

        pass.computed += 1;
        Ok(pass.cache.entry(key).or_insert(grad))
    }

    /// Children first, `root` last
    fn topo(&self, root: Node) -> Result<Vec<Node>> {
        self.node(root)?;
        let mut vis = SecondaryMap::new();
        let mut order = Vec::new();
        let mut stack = vec![(root, false)];

        while let Some((n, expanded)) = stack.pop() {
            if expanded {
                order.push(n);
                continue;
            }
            if vis.insert(n, ()).is_some() {
                continue;
            }
            stack.push((n, true));
            for &s in &self.nodes[n].src {
                if !vis.contains_key(s) {
                    stack.push((s, false));
                }
            }
        }
        Ok(order)
    }

    /// Full reverse pass from `loss`, seeded with ones.
    ///
    /// Returns the gradient of every parameter `loss` depends on.
    pub fn backward(&mut self, loss: Node) -> Result<Gradients<T>> {
        self.eval_inner(loss, false)?;
        let order = self.topo(loss)?;

        let mut pass = self.begin_backward();
        let mut upstream: SecondaryMap<Node, Tensor<T>> = SecondaryMap::new();
        let mut grads = SecondaryMap::new();

        let l = &self.nodes[loss];
        if l.want_grad {
            upstream.insert(loss, Tensor::filled(&l.sh, T::one(), l.mem, l.device)?);
        }

        for &n in order.iter().rev() {
            let Some(up) = upstream.remove(n) else {
                continue;
            };
            let d = &self.nodes[n];
            if d.op == OpKind::Value(VKind::Param) {
                grads.insert(n, up);
                continue;
            }

            let is_async = d.is_async;
            let mut seen: SmallVec<Node, 2> = SmallVec::new();
            for s in d.src.clone() {
                if seen.contains(&s) || !self.nodes[s].want_grad {
                    continue;
                }
                seen.push(s);

                let g = if is_async {
                    self.grad(&mut pass, None, n, s, &up)?;
                    pass.settled(n, s)?
                } else {
                    self.grad(&mut pass, None, n, s, &up)?
                };
                match upstream.get_mut(s) {
                    Some(acc) => acc.add_assign(g)?,
                    None => {
                        upstream.insert(s, g.try_clone()?);
                    }
                }
            }
        }

        log::debug!(
            "backward from {loss:?}: {} params, {} kernels",
            grads.len(),
            pass.computed()
        );
        Ok(Gradients {
            grads,
            computed: pass.computed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[test]
    fn topo_order_puts_children_first() {
        let mut g = Graph::<f32>::new(Config::default());
        let a = g.input(&[2]).unwrap();
        let b = g.neg(a).unwrap();
        let c = g.add(a, b).unwrap();
        let order = g.topo(c).unwrap();
        assert_eq!(order.len(), 3);
        let pos = |n| order.iter().position(|x| *x == n).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn repeated_operand_sums_slots() {
        let mut g = Graph::<f64>::new(Config::default());
        let x = g.variable("x", &[3], &[1.0, 2.0, 3.0]).unwrap();
        let y = g.mul(x, x).unwrap();
        g.eval(y, false).unwrap();

        let up = Tensor::filled(&[3], 1.0, g[y].mem, 0).unwrap();
        let mut pass = g.begin_backward();
        let dx = g.grad(&mut pass, None, y, x, &up).unwrap();
        assert_eq!(dx.to_vec().unwrap(), vec![2.0, 4.0, 6.0]);
        assert_eq!(pass.computed(), 1);
    }
}
