//! External program actions.

use std::collections::BTreeMap;
use std::process;

use anyhow::{Context, bail};
use camino::Utf8PathBuf;
use tracing::debug;

use crate::action::Action;
use crate::handle::{AnyHandle, Handle};

/// How many trailing lines of stderr end up in the error message.
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone)]
enum Arg {
    Literal(String),
    Path(AnyHandle),
}

/// Runs an external program synchronously.
///
/// Arguments can be literal strings or paths of handles. Passing a handle
/// through [`Command::input_path`] or [`Command::output_path`] also declares
/// it, so the command line and the declared graph can't drift apart.
///
/// ```ignore
/// let patched = dispatcher.output_dir("patched");
/// let action = Command::new("git")
///     .arg("apply")
///     .arg("--directory")
///     .output_path(&patched)
///     .input_path(&patches);
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    program: String,
    args: Vec<Arg>,
    inputs: Vec<AnyHandle>,
    outputs: Vec<AnyHandle>,
    cwd: Option<Utf8PathBuf>,
    env: BTreeMap<String, String>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Literal(arg.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|arg| Arg::Literal(arg.into())));
        self
    }

    /// Passes the path of `handle` as an argument and declares it as an input.
    pub fn input_path(mut self, handle: &dyn Handle) -> Self {
        let handle = handle.erase();
        self.args.push(Arg::Path(handle.clone()));
        self.inputs.push(handle);
        self
    }

    /// Passes the path of `handle` as an argument and declares it as an output.
    pub fn output_path(mut self, handle: &dyn Handle) -> Self {
        let handle = handle.erase();
        self.args.push(Arg::Path(handle.clone()));
        self.outputs.push(handle);
        self
    }

    /// Declares an input the program finds on its own.
    pub fn input(mut self, handle: &dyn Handle) -> Self {
        self.inputs.push(handle.erase());
        self
    }

    /// Declares an output the program writes on its own.
    pub fn output(mut self, handle: &dyn Handle) -> Self {
        self.outputs.push(handle.erase());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn resolve_args(&self) -> anyhow::Result<Vec<String>> {
        self.args
            .iter()
            .map(|arg| match arg {
                Arg::Literal(value) => Ok(value.clone()),
                Arg::Path(handle) => handle
                    .path()
                    .map(|path| path.to_string())
                    .with_context(|| format!("{handle} has no path")),
            })
            .collect()
    }

    /// The command line as it would run now, for logs and error messages.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            match arg {
                Arg::Literal(value) => line.push_str(value),
                Arg::Path(handle) => match handle.path() {
                    Some(path) => line.push_str(path.as_str()),
                    None => line.push_str(&handle.describe()),
                },
            }
        }
        line
    }
}

impl Action for Command {
    fn inputs(&self) -> Vec<AnyHandle> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<AnyHandle> {
        self.outputs.clone()
    }

    fn execute(&self) -> anyhow::Result<()> {
        let args = self.resolve_args()?;

        let mut command = process::Command::new(&self.program);
        command.args(&args).envs(&self.env);

        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        debug!(cmd = %self.display(), "spawning process");

        let output = command
            .output()
            .with_context(|| format!("Couldn't start `{}`", self.program))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(stdout = %stdout.trim(), "command stdout");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n");

            let code = match output.status.code() {
                Some(code) => format!("exit code {code}"),
                None => "a signal".to_string(),
            };

            bail!("`{}` was terminated by {code}\n{tail}", self.display());
        }

        Ok(())
    }
}
