use crate::error::{Error, Result};
use crate::graph::{Gradients, Graph};
use crate::optim::Optimizer;
use crate::{Element, Node};

/// Plain gradient descent, `P[i+1] = P[i] - lr * G[i]`
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f64,
    steps: usize,
}

impl SGD {
    pub fn new(lr: f64) -> Self {
        Self { lr, steps: 0 }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

impl<T: Element> Optimizer<T> for SGD {
    fn optimize(&mut self, g: &mut Graph<T>, grads: &Gradients<T>, parameters: &[Node]) -> Result<()> {
        let alpha = T::from_f64(-self.lr)
            .ok_or_else(|| Error::InvalidConfig(format!("learning rate {} not representable", self.lr)))?;

        for &param in parameters {
            if !g.node(param)?.op.is_leaf() {
                return Err(Error::NotALeaf(param));
            }
            let Some(grad) = grads.get(param) else {
                log::trace!("sgd: no gradient for {param:?}");
                continue;
            };
            g.tensor_mut(param)?.axpy(alpha, grad)?;
        }
        self.steps += 1;
        Ok(())
    }
}
