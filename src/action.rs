mod command;
mod func;

use std::any::Any;

pub use command::Command;
pub use func::{FnAction, from_fn};

use crate::AnyHandle;

/// A unit of work with declared inputs and outputs.
///
/// An action must be idempotent and must fully (re)write every declared
/// output on each execution. It may read only its declared inputs; anything
/// else it touches is invisible to the dispatcher and will not trigger a
/// re-run when it changes.
///
/// Input and output lists are ordered. Reordering them changes the stored
/// fingerprint and causes one spurious re-run, nothing more.
pub trait Action: 'static {
    fn inputs(&self) -> Vec<AnyHandle>;

    fn outputs(&self) -> Vec<AnyHandle>;

    fn execute(&self) -> anyhow::Result<()>;
}

/// Object safe view of [`Action`] as stored by the dispatcher. It keeps the
/// concrete type reachable for [`Dispatcher::registered`].
///
/// [`Dispatcher::registered`]: crate::Dispatcher::registered
pub(crate) trait ErasedAction {
    fn inputs(&self) -> Vec<AnyHandle>;

    fn outputs(&self) -> Vec<AnyHandle>;

    fn execute(&self) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;
}

// Type erasure happens here.
impl<A> ErasedAction for A
where
    A: Action,
{
    fn inputs(&self) -> Vec<AnyHandle> {
        A::inputs(self)
    }

    fn outputs(&self) -> Vec<AnyHandle> {
        A::outputs(self)
    }

    fn execute(&self) -> anyhow::Result<()> {
        A::execute(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
