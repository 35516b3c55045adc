use crate::action::Action;
use crate::handle::{AnyHandle, Handle, erase_all};

/// An action backed by a closure. See [`from_fn`].
pub struct FnAction<F> {
    inputs: Vec<AnyHandle>,
    outputs: Vec<AnyHandle>,
    body: F,
}

/// Builds an action out of a closure and the handles it reads and writes.
///
/// The closure usually captures clones of the same handles so it can resolve
/// their paths when it runs.
///
/// ```ignore
/// let out = dispatcher.output_file("greeting.txt");
/// let action = from_fn(&[], &[&out], {
///     let out = out.clone();
///     move || Ok(out.write("hello")?)
/// });
/// dispatcher.register("greet", action)?;
/// ```
pub fn from_fn<F>(inputs: &[&dyn Handle], outputs: &[&dyn Handle], body: F) -> FnAction<F>
where
    F: Fn() -> anyhow::Result<()> + 'static,
{
    FnAction {
        inputs: erase_all(inputs),
        outputs: erase_all(outputs),
        body,
    }
}

impl<F> Action for FnAction<F>
where
    F: Fn() -> anyhow::Result<()> + 'static,
{
    fn inputs(&self) -> Vec<AnyHandle> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<AnyHandle> {
        self.outputs.clone()
    }

    fn execute(&self) -> anyhow::Result<()> {
        (self.body)()
    }
}
