use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::time::Duration;

use console::style;

use crate::Dispatcher;
use crate::utils::as_duration;

/// What happened to an action during one dispatch. `Stale` only shows up in
/// [`Dispatcher::status`](crate::Dispatcher::status), a real dispatch runs
/// stale actions and reports them as executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    NotRun,
    Stale,
    UpToDate,
    Executed,
}

#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub name: String,
    pub state: ActionState,
    /// Time spent checking and, if stale, executing the action.
    pub duration: Duration,
    pub(crate) index: usize,
}

/// Outcome of a successful dispatch, in execution order.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub entries: Vec<ReportEntry>,
    pub total: Duration,
}

impl Report {
    pub(crate) fn push(&mut self, index: usize, name: &str, state: ActionState, duration: Duration) {
        self.entries.push(ReportEntry {
            name: name.to_string(),
            state,
            duration,
            index,
        });
    }

    fn names_in(&self, state: ActionState) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.state == state)
            .map(|entry| entry.name.as_str())
            .collect()
    }

    /// Names of executed actions, in execution order.
    pub fn executed(&self) -> Vec<&str> {
        self.names_in(ActionState::Executed)
    }

    pub fn up_to_date(&self) -> Vec<&str> {
        self.names_in(ActionState::UpToDate)
    }

    /// Names of actions that would run, see [`Dispatcher::status`].
    pub fn stale(&self) -> Vec<&str> {
        self.names_in(ActionState::Stale)
    }

    /// True when nothing had to run.
    pub fn is_noop(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| entry.state == ActionState::UpToDate)
    }

    pub fn state(&self, name: &str) -> ActionState {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.state)
            .unwrap_or(ActionState::NotRun)
    }

    /// Renders the registered graph as a Mermaid diagram, colored by what
    /// happened in this dispatch.
    ///
    /// * **Green**: executed
    /// * **Blue**: up to date
    /// * **Yellow**: stale
    /// * **Grey**: not required by the targets
    pub fn render_mermaid(&self, dispatcher: &Dispatcher) -> String {
        let states: HashMap<usize, &ReportEntry> = self
            .entries
            .iter()
            .map(|entry| (entry.index, entry))
            .collect();

        render_mermaid(dispatcher, Some(&states))
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let executed = self.executed().len();
        let up_to_date = self.up_to_date().len();

        writeln!(
            f,
            "Executed {executed} of {} actions, {up_to_date} up to date {}",
            self.entries.len(),
            as_duration(self.total)
        )?;

        for entry in &self.entries {
            let state = match entry.state {
                ActionState::Executed => style("executed").green(),
                ActionState::UpToDate => style("up-to-date").blue(),
                ActionState::Stale => style("stale").yellow(),
                ActionState::NotRun => style("not run").dim(),
            };

            writeln!(f, "  {state:<10} {} {}", entry.name, as_duration(entry.duration))?;
        }

        Ok(())
    }
}

pub(crate) fn render_mermaid(
    dispatcher: &Dispatcher,
    states: Option<&HashMap<usize, &ReportEntry>>,
) -> String {
    let mut f = String::new();
    let graph = dispatcher.full_graph();

    // Writing into a `String` can't fail.
    let _ = writeln!(f, "graph LR");

    for node in graph.node_indices() {
        let index = graph[node];
        let name = dispatcher.action_name(index).replace('"', "#quot;");

        let label = match states.and_then(|states| states.get(&index)) {
            Some(entry) => format!("{name}<br/>{:.2?}", entry.duration),
            None => name,
        };

        let _ = writeln!(f, "    n{index}[\"{label}\"]");
    }

    for edge in graph.raw_edges() {
        let source = graph[edge.source()];
        let target = graph[edge.target()];
        let label = edge.weight.describe().replace('"', "#quot;");

        let _ = writeln!(f, "    n{source} -->|\"{label}\"| n{target}");
    }

    if let Some(states) = states {
        let _ = writeln!(f, "    classDef executed fill:#bbf7d0,stroke:#16a34a");
        let _ = writeln!(f, "    classDef uptodate fill:#bfdbfe,stroke:#2563eb");
        let _ = writeln!(f, "    classDef stale fill:#fef08a,stroke:#ca8a04");
        let _ = writeln!(f, "    classDef notrun fill:#e5e7eb,stroke:#9ca3af");

        for node in graph.node_indices() {
            let index = graph[node];
            let class = match states.get(&index).map(|entry| entry.state) {
                Some(ActionState::Executed) => "executed",
                Some(ActionState::UpToDate) => "uptodate",
                Some(ActionState::Stale) => "stale",
                _ => "notrun",
            };

            let _ = writeln!(f, "    class n{index} {class}");
        }
    }

    f
}
