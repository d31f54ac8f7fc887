mod sgd;
pub use sgd::SGD;

use crate::error::Result;
use crate::graph::{Gradients, Graph};
use crate::{Element, Node};

pub trait Optimizer<T: Element> {
    /// Apply one update to `parameters` from the gradients of a backward pass.
    /// Consumers of the parameters see the new values after `eval(.., true)`.
    fn optimize(&mut self, g: &mut Graph<T>, grads: &Gradients<T>, parameters: &[Node]) -> Result<()>;
}
