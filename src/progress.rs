//! Progress reporter.
//!
//! Aggregates the state of N task units and renders them as a single
//! terminal bar of per-unit glyphs plus a counter. Units sort pending-first
//! so the running bar pushes through the field. In verbose mode every state
//! transition also emits an annotated line above the bar.

use crate::workspace::{Module, Workspace};
use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Stopped,
    Skipped,
    UpToDate,
    Failed,
    Done,
}

impl UnitState {
    pub fn glyph(self) -> char {
        match self {
            UnitState::Pending => ' ',
            UnitState::Running => '>',
            UnitState::Stopped => '/',
            UnitState::Skipped => '.',
            UnitState::UpToDate => '=',
            UnitState::Failed => '!',
            UnitState::Done => '-',
        }
    }

    fn label(self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::Running => "running",
            UnitState::Stopped => "stopped",
            UnitState::Skipped => "skipped",
            UnitState::UpToDate => "up-to-date",
            UnitState::Failed => "failed",
            UnitState::Done => "done",
        }
    }

    fn is_terminal(self) -> bool {
        !matches!(self, UnitState::Pending | UnitState::Running)
    }
}

struct UnitSlot {
    name: String,
    state: UnitState,
}

#[derive(Default)]
struct ProgressState {
    units: Vec<UnitSlot>,
    bar: Option<ProgressBar>,
}

/// The progress reporter module.
pub struct Progress {
    verbose: bool,
    state: Mutex<ProgressState>,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Progress {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Add a pending unit and return its handle.
    pub fn register(self: &Arc<Self>) -> ProgressUnit {
        let mut state = self.state.lock().expect("progress state poisoned");
        state.units.push(UnitSlot {
            name: String::new(),
            state: UnitState::Pending,
        });
        let index = state.units.len() - 1;
        if let Some(bar) = &state.bar {
            bar.inc_length(1);
        }
        Self::redraw(&state);
        ProgressUnit {
            progress: self.clone(),
            index,
        }
    }

    /// Print a line above the bar, falling back to stderr when the bar is
    /// absent or hidden (non-terminal output).
    pub fn println(&self, line: impl AsRef<str>) {
        let state = self.state.lock().expect("progress state poisoned");
        Self::print_above(&state, line.as_ref());
    }

    fn print_above(state: &ProgressState, line: &str) {
        match &state.bar {
            Some(bar) if !bar.is_hidden() => bar.println(line),
            _ => eprintln!("{line}"),
        }
    }

    fn set_name(&self, index: usize, name: String) {
        let mut state = self.state.lock().expect("progress state poisoned");
        if let Some(slot) = state.units.get_mut(index) {
            slot.name = name;
        }
    }

    fn transition(&self, index: usize, to: UnitState) {
        let mut state = self.state.lock().expect("progress state poisoned");
        let line = match state.units.get_mut(index) {
            Some(slot) => {
                slot.state = to;
                format!("{} {}", styled_glyph(to), slot.name)
            }
            None => return,
        };
        if self.verbose {
            Self::print_above(&state, &line);
        }
        Self::redraw(&state);
    }

    fn current_state(&self, index: usize) -> Option<UnitState> {
        let state = self.state.lock().expect("progress state poisoned");
        state.units.get(index).map(|slot| slot.state)
    }

    fn redraw(state: &ProgressState) {
        let Some(bar) = &state.bar else { return };
        let mut order: Vec<&UnitSlot> = state.units.iter().collect();
        order.sort_by_key(|slot| u8::from(slot.state != UnitState::Pending));
        let field: String = order.iter().map(|slot| slot.state.glyph()).collect();
        let settled = state
            .units
            .iter()
            .filter(|slot| slot.state.is_terminal())
            .count();
        bar.set_message(field);
        bar.set_position(settled as u64);
    }

    /// Per-state counts for the final statistics line.
    pub fn statistics(&self) -> Vec<(UnitState, usize)> {
        let state = self.state.lock().expect("progress state poisoned");
        let all = [
            UnitState::Done,
            UnitState::UpToDate,
            UnitState::Skipped,
            UnitState::Failed,
            UnitState::Stopped,
            UnitState::Pending,
            UnitState::Running,
        ];
        all.into_iter()
            .map(|s| (s, state.units.iter().filter(|u| u.state == s).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

fn styled_glyph(state: UnitState) -> console::StyledObject<char> {
    let glyph = style(state.glyph());
    match state {
        UnitState::Failed => glyph.red().bold(),
        UnitState::Done => glyph.green(),
        UnitState::UpToDate => glyph.cyan(),
        UnitState::Stopped => glyph.yellow(),
        _ => glyph.dim(),
    }
}

/// Handle for one unit of work. Dropping a unit that never settled marks it
/// stopped, which is how interrupted steps surface in the bar.
pub struct ProgressUnit {
    progress: Arc<Progress>,
    index: usize,
}

impl ProgressUnit {
    pub fn set_name(&self, name: impl Into<String>) {
        self.progress.set_name(self.index, name.into());
    }

    pub fn set_running(&self) {
        self.progress.transition(self.index, UnitState::Running);
    }

    pub fn set_done(&self) {
        self.progress.transition(self.index, UnitState::Done);
    }

    pub fn set_failed(&self) {
        self.progress.transition(self.index, UnitState::Failed);
    }

    pub fn set_skipped(&self) {
        self.progress.transition(self.index, UnitState::Skipped);
    }

    pub fn set_up_to_date(&self) {
        self.progress.transition(self.index, UnitState::UpToDate);
    }

    pub fn set_stopped(&self) {
        self.progress.transition(self.index, UnitState::Stopped);
    }

    pub fn state(&self) -> Option<UnitState> {
        self.progress.current_state(self.index)
    }
}

impl Drop for ProgressUnit {
    fn drop(&mut self) {
        if let Some(state) = self.progress.current_state(self.index)
            && !state.is_terminal()
        {
            self.progress.transition(self.index, UnitState::Stopped);
        }
    }
}

impl Module for Progress {
    fn tag(&self) -> &'static str {
        "progress"
    }

    fn start(&self, _ws: &Workspace) -> Result<()> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(" [{msg}] {pos}/{len}")
                .expect("static progress template"),
        );
        self.state.lock().expect("progress state poisoned").bar = Some(bar);
        Ok(())
    }

    fn finish(&self, _ws: &Workspace) -> Result<()> {
        let bar = self.state.lock().expect("progress state poisoned").bar.take();
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        let stats = self.statistics();
        if !stats.is_empty() {
            let summary: Vec<String> = stats
                .iter()
                .map(|(state, count)| format!("{count} {}", state.label()))
                .collect();
            eprintln!("{}", style(summary.join(", ")).dim());
        }
        Ok(())
    }
}
