//! The registry of actions and the `dispatch` walk over it.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::fs;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::action::{Action, ErasedAction};
use crate::cache::{self, CleanReport, Maintenance, MaintenancePolicy};
use crate::config::Config;
use crate::error::{ActionError, DispatchError};
use crate::fingerprint::{Entry, Fingerprint, Terminal, action_dir_name};
use crate::graph::{self, ActionGraph, Plan};
use crate::handle::{
    AnyHandle, DirHandle, FileHandle, GlobHandle, Handle, HandleId, HandleKind, Source,
    ValueHandle, check_output_name, erase_all,
};
use crate::hash::{Digestible, Hash32};
use crate::lock::WorkLock;
use crate::report::{self, ActionState, Report};
use crate::utils::{STYLE_ACTION, STYLE_DISPATCH, as_overhead};

/// An action as stored in the registry. Declarations are read once at
/// registration, so the graph never changes behind the dispatcher's back.
pub(crate) struct Registration {
    pub name: String,
    pub dir: Utf8PathBuf,
    pub action: Box<dyn ErasedAction>,
    pub inputs: Vec<AnyHandle>,
    pub outputs: Vec<AnyHandle>,
}

impl Registration {
    pub fn new(name: String, dir: Utf8PathBuf, action: Box<dyn ErasedAction>) -> Self {
        let inputs = action.inputs();
        let outputs = action.outputs();

        Self {
            name,
            dir,
            action,
            inputs,
            outputs,
        }
    }
}

/// Returned by [`Dispatcher::register`], gives access to the now bound
/// outputs of the action.
#[derive(Debug, Clone)]
pub struct Registered {
    name: String,
    dir: Utf8PathBuf,
    outputs: Vec<AnyHandle>,
}

impl Registered {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the outputs and the fingerprint of the action.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn outputs(&self) -> &[AnyHandle] {
        &self.outputs
    }
}

/// Runs registered actions in dependency order, skipping the ones whose
/// inputs and outputs are unchanged since they last ran.
///
/// A dispatcher is scoped to one working directory. Every action gets its own
/// subdirectory there, holding its outputs and a fingerprint of its last
/// successful execution.
pub struct Dispatcher {
    work: Utf8PathBuf,
    salt: Option<Hash32>,
    locking: bool,
    terminal: Option<Hash32>,
    actions: Vec<Registration>,
    names: HashMap<String, usize>,
    producers: HashMap<HandleId, usize>,
}

impl Dispatcher {
    pub fn new(work: impl Into<Utf8PathBuf>) -> Self {
        Config::new(work).finish()
    }

    pub fn config(work: impl Into<Utf8PathBuf>) -> Config {
        Config::new(work)
    }

    pub(crate) fn from_parts(work: Utf8PathBuf, salt: Option<Hash32>, locking: bool) -> Self {
        Self {
            work,
            salt,
            locking,
            terminal: None,
            actions: Vec::new(),
            names: HashMap::new(),
            producers: HashMap::new(),
        }
    }

    pub fn work(&self) -> &Utf8Path {
        &self.work
    }

    pub fn salt(&self) -> Option<Hash32> {
        self.salt
    }

    /// Declares that `hash` covers every input the dispatch targets
    /// transitively depend on, e.g. the digest of a bundle they are all
    /// derived from. While the producers of the targets are up to date under
    /// this hash, a dispatch checks only them and skips the rest of the graph.
    pub fn override_terminal_input_hash(&mut self, hash: Hash32) {
        self.terminal = Some(hash);
    }

    fn output_slot(&mut self, kind: HandleKind, name: String) -> AnyHandle {
        let source = Source::Output {
            name,
            bound: Default::default(),
        };

        AnyHandle::new(HandleId::next(), kind, source)
    }

    /// Reserves an output file. Its path is fixed once an action declaring it
    /// as an output is registered.
    pub fn output_file(&mut self, name: impl Into<String>) -> FileHandle {
        FileHandle::new(self.output_slot(HandleKind::File, name.into()))
    }

    /// Reserves an output directory.
    pub fn output_dir(&mut self, name: impl Into<String>) -> DirHandle {
        DirHandle::new(self.output_slot(HandleKind::Directory, name.into()))
    }

    /// A literal value. Its digest is computed right away.
    pub fn provided<T>(&mut self, value: T) -> ValueHandle<T>
    where
        T: Digestible + 'static,
    {
        ValueHandle::new(HandleId::next(), value)
    }

    /// An existing file maintained outside of the dispatcher.
    pub fn provided_file(&mut self, path: impl Into<Utf8PathBuf>) -> FileHandle {
        let raw = AnyHandle::new(HandleId::next(), HandleKind::File, Source::Path(path.into()));
        FileHandle::new(raw)
    }

    /// An existing directory maintained outside of the dispatcher.
    pub fn provided_dir(&mut self, path: impl Into<Utf8PathBuf>) -> DirHandle {
        let raw = AnyHandle::new(
            HandleId::next(),
            HandleKind::Directory,
            Source::Path(path.into()),
        );
        DirHandle::new(raw)
    }

    /// Every file matching `pattern` at the time of the dispatch.
    pub fn provided_glob(&mut self, pattern: impl Into<String>) -> GlobHandle {
        GlobHandle::new(HandleId::next(), pattern.into())
    }

    /// Adds an action under a unique name, binding its outputs to the action
    /// directory. Nothing is modified when this fails.
    pub fn register<A>(&mut self, name: impl Into<String>, action: A) -> Result<Registered, DispatchError>
    where
        A: Action,
    {
        let name = name.into();

        if self.names.contains_key(&name) {
            return Err(DispatchError::DuplicateActionName(name));
        }

        let dir = self.work.join(action_dir_name(&name));
        let registration = Registration::new(name, dir, Box::new(action));
        let name = &registration.name;

        let mut seen = HashSet::new();
        for output in &registration.outputs {
            if output.is_provided() {
                return Err(DispatchError::ProvidedAsOutput(
                    output.describe(),
                    name.clone(),
                ));
            }

            if let Some(output_name) = output.output_name()
                && let Err(reason) = check_output_name(output_name)
            {
                return Err(DispatchError::InvalidOutputName {
                    name: output_name.to_string(),
                    action: name.clone(),
                    reason,
                });
            }

            let owner = match output.owner() {
                Some(owner) => Some(owner.to_string()),
                None if !seen.insert(output.id()) => Some(name.clone()),
                None => None,
            };

            if let Some(owner) = owner {
                return Err(DispatchError::MultipleProducers {
                    handle: output.describe(),
                    owner,
                });
            }
        }

        let index = self.actions.len();
        for output in &registration.outputs {
            // Checked above, binding can't fail anymore.
            let _ = output.bind(name, &registration.dir);
            self.producers.insert(output.id(), index);
        }

        tracing::debug!(
            action = %name,
            inputs = registration.inputs.len(),
            outputs = registration.outputs.len(),
            "registered"
        );

        let registered = Registered {
            name: name.clone(),
            dir: registration.dir.clone(),
            outputs: registration.outputs.clone(),
        };

        self.names.insert(name.clone(), index);
        self.actions.push(registration);

        Ok(registered)
    }

    /// The action registered under `name`, if it has type `A`.
    pub fn registered<A>(&self, name: &str) -> Option<&A>
    where
        A: Action,
    {
        let index = *self.names.get(name)?;
        self.actions[index].action.as_any().downcast_ref::<A>()
    }

    /// Brings every target up to date. See [`Dispatcher::dispatch_with`].
    pub fn dispatch(&self, targets: &[&dyn Handle]) -> Result<Report, DispatchError> {
        self.dispatch_with(targets, |_| {})
    }

    /// Brings every target up to date, running only the stale actions they
    /// transitively depend on, producers before consumers. `progress` is
    /// called with the name of each action as it is checked.
    ///
    /// Stops at the first failure. Actions that completed before it keep
    /// their fingerprints, the failed one has none and runs again next time.
    pub fn dispatch_with<F>(&self, targets: &[&dyn Handle], mut progress: F) -> Result<Report, DispatchError>
    where
        F: FnMut(&str),
    {
        let start = Instant::now();
        let targets = erase_all(targets);
        let plan = graph::plan(&self.actions, &self.producers, &targets)?;
        let roots = self.roots(&targets);

        fs::create_dir_all(&self.work).map_err(DispatchError::WorkDir)?;

        let _lock = match self.locking {
            true => Some(WorkLock::acquire(&self.work)?),
            false => None,
        };

        let root_span = tracing::info_span!("dispatch");
        root_span.pb_set_style(&STYLE_DISPATCH);
        root_span.pb_set_length(plan.order.len() as u64);
        root_span.pb_set_message("Dispatching actions...");
        let _enter = root_span.enter();

        let mut digests = Digests::default();

        if let Some(hash) = self.terminal
            && let Some(mut report) = self.check_terminal(&plan, &roots, hash, &mut digests, &mut progress)?
        {
            report.total = start.elapsed();
            info!(
                "Dispatch complete, {} terminal actions up to date {}",
                report.entries.len(),
                as_overhead(start)
            );
            return Ok(report);
        }

        let mut report = Report::default();

        for &index in &plan.order {
            let registration = &self.actions[index];
            progress(&registration.name);

            let s = Instant::now();
            let terminal = self.terminal_for(&plan, &roots, index);
            let state = self
                .check_and_run(registration, &mut digests, terminal)
                .map_err(|err| DispatchError::ActionFailed(registration.name.clone(), err))?;

            report.push(index, &registration.name, state, s.elapsed());
            root_span.pb_inc(1);
        }

        report.total = start.elapsed();
        info!(
            "Dispatch complete, executed {} of {} actions {}",
            report.executed().len(),
            report.entries.len(),
            as_overhead(start)
        );

        Ok(report)
    }

    /// Reports what [`Dispatcher::dispatch`] would do for `targets` without
    /// running or touching anything. An action is [`ActionState::Stale`] when
    /// its fingerprint doesn't match, or when it depends on a stale action
    /// whose outputs are about to change.
    pub fn status(&self, targets: &[&dyn Handle]) -> Result<Report, DispatchError> {
        let start = Instant::now();
        let targets = erase_all(targets);
        let plan = graph::plan(&self.actions, &self.producers, &targets)?;
        let roots = self.roots(&targets);

        let mut digests = Digests::default();
        let mut stale = HashSet::new();
        let mut report = Report::default();

        for &index in &plan.order {
            let registration = &self.actions[index];
            let s = Instant::now();

            let upstream_stale = registration
                .inputs
                .iter()
                .filter_map(|input| self.producers.get(&input.id()))
                .any(|producer| stale.contains(producer));

            let up_to_date = !upstream_stale && {
                let terminal = self.terminal_for(&plan, &roots, index);
                let current = self
                    .current_fingerprint(registration, &mut digests, terminal)
                    .map_err(|err| DispatchError::ActionFailed(registration.name.clone(), err))?;

                matches!(Fingerprint::read(&registration.dir), Ok(Some(stored)) if stored.same_state(&current))
            };

            let state = match up_to_date {
                true => ActionState::UpToDate,
                false => {
                    stale.insert(index);
                    ActionState::Stale
                }
            };

            report.push(index, &registration.name, state, s.elapsed());
        }

        report.total = start.elapsed();
        Ok(report)
    }

    /// Producers of the dispatch targets.
    fn roots(&self, targets: &[AnyHandle]) -> HashSet<usize> {
        targets
            .iter()
            .filter_map(|target| self.producers.get(&target.id()).copied())
            .collect()
    }

    /// Terminal record for `index` when it produces a target and a terminal
    /// hash is set.
    fn terminal_for(&self, plan: &Plan, roots: &HashSet<usize>, index: usize) -> Option<Terminal> {
        let hash = self.terminal?;
        if !roots.contains(&index) {
            return None;
        }

        let protects = plan
            .dependencies(index)
            .into_iter()
            .filter_map(|dep| self.actions[dep].dir.file_name())
            .map(str::to_string)
            .collect();

        Some(Terminal { hash, protects })
    }

    /// Early check against the terminal hash. Returns a report when every
    /// producer of a target is up to date under `hash`, in which case nothing
    /// behind them is looked at.
    fn check_terminal<F>(
        &self,
        plan: &Plan,
        roots: &HashSet<usize>,
        hash: Hash32,
        digests: &mut Digests,
        progress: &mut F,
    ) -> Result<Option<Report>, DispatchError>
    where
        F: FnMut(&str),
    {
        let mut matched = Vec::new();

        for &index in plan.order.iter().filter(|index| roots.contains(*index)) {
            let registration = &self.actions[index];
            let s = Instant::now();

            let outputs = digests
                .entries(&registration.outputs)
                .map_err(|err| DispatchError::ActionFailed(registration.name.clone(), err))?;
            let current = Fingerprint::new(&registration.name, self.salt, Vec::new(), outputs);

            match Fingerprint::read(&registration.dir) {
                Ok(Some(stored)) if stored.matches_terminal(hash, &current) => {
                    matched.push((index, stored, s.elapsed()));
                }
                _ => {
                    tracing::debug!(action = %registration.name, "terminal hash doesn't match");
                    return Ok(None);
                }
            }
        }

        let mut report = Report::default();

        for (index, mut stored, duration) in matched {
            let registration = &self.actions[index];
            progress(&registration.name);
            info!("Skipping {} (up-to-date)", registration.name);

            stored.touch();
            if let Err(err) = stored.write(&registration.dir) {
                warn!("Couldn't refresh the fingerprint of {}: {err}", registration.name);
            }

            report.push(index, &registration.name, ActionState::UpToDate, duration);
        }

        Ok(Some(report))
    }

    fn current_fingerprint(
        &self,
        registration: &Registration,
        digests: &mut Digests,
        terminal: Option<Terminal>,
    ) -> Result<Fingerprint, ActionError> {
        let inputs = digests.entries(&registration.inputs)?;
        let outputs = digests.entries(&registration.outputs)?;

        Ok(Fingerprint::new(&registration.name, self.salt, inputs, outputs).with_terminal(terminal))
    }

    fn check_and_run(
        &self,
        registration: &Registration,
        digests: &mut Digests,
        terminal: Option<Terminal>,
    ) -> Result<ActionState, ActionError> {
        let name = &registration.name;
        let dir = &registration.dir;

        let span = tracing::info_span!("action", name = %name);
        span.pb_set_style(&STYLE_ACTION);
        span.pb_set_message(&format!("Checking {name}"));
        let _enter = span.enter();

        let current = self.current_fingerprint(registration, digests, terminal)?;

        match Fingerprint::read(dir) {
            Ok(Some(mut stored)) if stored.same_state(&current) => {
                info!("Skipping {name} (up-to-date)");

                stored.touch();
                if let Err(err) = stored.write(dir) {
                    warn!("Couldn't refresh the fingerprint of {name}: {err}");
                }

                return Ok(ActionState::UpToDate);
            }
            Ok(_) => {}
            Err(err) => warn!("Discarding unreadable fingerprint of {name}: {err}"),
        }

        info!("Executing {name}...");
        span.pb_set_message(&format!("Running {name}"));
        let s = Instant::now();

        // The old fingerprint must not survive a failed run.
        Fingerprint::remove(dir).map_err(ActionError::Prepare)?;
        fs::create_dir_all(dir).map_err(ActionError::Prepare)?;

        // Whatever the action leaves behind is checked right below, so a panic
        // can't leave the dispatcher itself in a broken state.
        match catch_unwind(AssertUnwindSafe(|| registration.action.execute())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(ActionError::Execute(err)),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };

                return Err(ActionError::Panic(msg));
            }
        }

        digests.forget(&registration.outputs);
        let outputs = digests.entries(&registration.outputs)?;

        if let Some(missing) = outputs.iter().find(|entry| entry.digest.is_none()) {
            return Err(ActionError::MissingOutput(missing.handle.clone()));
        }

        Fingerprint::new(name, self.salt, current.inputs, outputs)
            .with_terminal(current.terminal)
            .write(dir)
            .map_err(ActionError::Persist)?;

        info!("Finished {name} {}", as_overhead(s));
        Ok(ActionState::Executed)
    }

    /// Deletes action directories under the working directory that haven't
    /// been used for `max_age`, keeping the ones of registered actions.
    /// Returns `None` when the directory is locked by a running dispatch.
    pub fn clean_expired(&self, max_age: Duration) -> io::Result<Option<CleanReport>> {
        cache::clean_expired(&self.work, max_age, &self.action_dirs())
    }

    /// Scheduled variant of [`Dispatcher::clean_expired`], see
    /// [`cache::perform_maintenance`].
    pub fn perform_maintenance(&self, policy: &MaintenancePolicy) -> io::Result<Maintenance> {
        cache::perform_maintenance(&self.work, policy, &self.action_dirs())
    }

    fn action_dirs(&self) -> HashSet<String> {
        self.actions
            .iter()
            .filter_map(|registration| registration.dir.file_name())
            .map(str::to_string)
            .collect()
    }

    pub(crate) fn full_graph(&self) -> ActionGraph {
        graph::build(&self.actions, &self.producers, 0..self.actions.len())
    }

    pub(crate) fn action_name(&self, index: usize) -> &str {
        &self.actions[index].name
    }
}

impl Display for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&report::render_mermaid(self, None))
    }
}

/// Digests computed during one dispatch. Inputs are hashed at most once,
/// outputs are forgotten after their producer runs.
#[derive(Default)]
struct Digests {
    known: HashMap<HandleId, Option<Hash32>>,
}

impl Digests {
    fn get(&mut self, handle: &AnyHandle) -> Result<Option<Hash32>, ActionError> {
        if let Some(digest) = self.known.get(&handle.id()) {
            return Ok(*digest);
        }

        let digest = handle.digest().map_err(|source| ActionError::Hash {
            handle: handle.describe(),
            source,
        })?;

        self.known.insert(handle.id(), digest);
        Ok(digest)
    }

    fn entries(&mut self, handles: &[AnyHandle]) -> Result<Vec<Entry>, ActionError> {
        handles
            .iter()
            .map(|handle| {
                Ok(Entry {
                    handle: handle.describe(),
                    digest: self.get(handle)?,
                })
            })
            .collect()
    }

    fn forget(&mut self, handles: &[AnyHandle]) {
        for handle in handles {
            self.known.remove(&handle.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::from_fn;

    fn work() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("work")).unwrap();
        (temp, path)
    }

    #[test]
    fn test_outputs_bound_under_action_dir() {
        let (_temp, work) = work();
        let mut dispatcher = Dispatcher::new(&work);

        let out = dispatcher.output_file("out.txt");
        let registered = dispatcher
            .register("write", from_fn(&[], &[&out], || Ok(())))
            .unwrap();

        assert_eq!(registered.dir(), work.join("write"));
        assert_eq!(registered.outputs(), [out.erase()]);
        assert_eq!(out.path().unwrap(), work.join("write").join("out.txt"));
    }

    #[test]
    fn test_failed_registration_changes_nothing() {
        let (_temp, work) = work();
        let mut dispatcher = Dispatcher::new(&work);

        let input = dispatcher.provided("x".to_string());
        let out = dispatcher.output_file("out.txt");

        let err = dispatcher
            .register("bad", from_fn(&[], &[&out, &input], || Ok(())))
            .unwrap_err();
        assert!(matches!(err, DispatchError::ProvidedAsOutput(_, action) if action == "bad"));

        assert!(out.path().is_err());
        dispatcher
            .register("bad", from_fn(&[], &[&out], || Ok(())))
            .unwrap();
    }

    #[test]
    fn test_invalid_output_names() {
        let (_temp, work) = work();
        let mut dispatcher = Dispatcher::new(&work);

        for name in ["/tmp/outside.txt", "../../escape.txt", ".fingerprint.json", ".fingerprint.json.tmp", ""] {
            let out = dispatcher.output_file(name);
            let err = dispatcher
                .register("bad", from_fn(&[], &[&out], || Ok(())))
                .unwrap_err();

            assert!(
                matches!(&err, DispatchError::InvalidOutputName { name: n, action, .. } if n == name && action == "bad"),
                "{name}: {err}"
            );
            assert!(out.path().is_err());
        }

        let nested = dispatcher.output_file("sub/out.txt");
        dispatcher
            .register("bad", from_fn(&[], &[&nested], || Ok(())))
            .unwrap();
        assert_eq!(nested.path().unwrap(), work.join("bad/sub/out.txt"));
    }

    #[test]
    fn test_same_output_twice_in_one_action() {
        let (_temp, work) = work();
        let mut dispatcher = Dispatcher::new(&work);

        let out = dispatcher.output_file("out.txt");
        let err = dispatcher
            .register("twice", from_fn(&[], &[&out, &out], || Ok(())))
            .unwrap_err();

        assert!(matches!(err, DispatchError::MultipleProducers { owner, .. } if owner == "twice"));
    }

    #[test]
    fn test_registered_downcast() {
        let (_temp, work) = work();
        let mut dispatcher = Dispatcher::new(&work);

        let cmd = crate::Command::new("true");
        dispatcher.register("cmd", cmd).unwrap();

        assert!(dispatcher.registered::<crate::Command>("cmd").is_some());
        assert!(dispatcher.registered::<crate::Command>("missing").is_none());
    }

    #[test]
    fn test_mermaid() {
        let (_temp, work) = work();
        let mut dispatcher = Dispatcher::new(&work);

        let a = dispatcher.output_file("a");
        let b = dispatcher.output_file("b");
        dispatcher
            .register("first", from_fn(&[], &[&a], || Ok(())))
            .unwrap();
        dispatcher
            .register("second", from_fn(&[&a], &[&b], || Ok(())))
            .unwrap();

        let mermaid = dispatcher.to_string();
        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("n0[\"first\"]"));
        assert!(mermaid.contains("n0 -->|\"file:first/a\"| n1"));
    }
}
