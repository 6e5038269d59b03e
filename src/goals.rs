//! Goal tracker.
//!
//! Modules define the output names they can produce; the driver activates
//! the names the user asked for. `define_then_query` lets a module gate its
//! own work on activation without duplicating the bookkeeping. After the
//! run, activated-but-never-defined goals warn, and if nothing matched at
//! all the full defined set is dumped for discoverability.

use crate::errors::BuildError;
use crate::progress::Progress;
use crate::workspace::{Module, Workspace};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

#[derive(Default)]
struct GoalState {
    defined: BTreeSet<String>,
    /// Activated goals; the flag records whether the goal was ever queried
    /// positively.
    activated: BTreeMap<String, bool>,
}

#[derive(Default)]
pub struct GoalTracker {
    state: Mutex<GoalState>,
}

impl GoalTracker {
    /// Mark a goal as requested by the user.
    pub fn activate(&self, goal: impl Into<String>) {
        let mut state = self.state.lock().expect("goal state poisoned");
        state.activated.insert(goal.into(), false);
    }

    /// Claim that this run can produce `goal`. Duplicate claims error.
    pub fn define(&self, goal: &str) -> Result<(), BuildError> {
        let mut state = self.state.lock().expect("goal state poisoned");
        if !state.defined.insert(goal.to_string()) {
            return Err(BuildError::DuplicateGoal(goal.to_string()));
        }
        Ok(())
    }

    /// True iff the defined goal was activated.
    pub fn query(&self, goal: &str) -> Result<bool, BuildError> {
        let mut state = self.state.lock().expect("goal state poisoned");
        if !state.defined.contains(goal) {
            return Err(BuildError::UndefinedGoal(goal.to_string()));
        }
        match state.activated.get_mut(goal) {
            Some(hit) => {
                *hit = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Register and test activation in one step.
    pub fn define_then_query(&self, goal: &str) -> Result<bool, BuildError> {
        self.define(goal)?;
        self.query(goal)
    }

    fn report(&self, progress: Option<&Progress>) {
        let state = self.state.lock().expect("goal state poisoned");
        let print = |line: String| match progress {
            Some(progress) => progress.println(&line),
            None => eprintln!("{line}"),
        };
        for (goal, hit) in &state.activated {
            if !hit {
                print(format!("WARNING: unused goal: {goal}"));
            }
        }
        if !state.activated.values().any(|hit| *hit) {
            print("no goal matched; defined goals are:".to_string());
            for goal in &state.defined {
                print(format!("  {goal}"));
            }
        }
    }
}

impl Module for GoalTracker {
    fn tag(&self) -> &'static str {
        "goals"
    }

    fn finish(&self, ws: &Workspace) -> Result<()> {
        let progress = ws.get::<Progress>().ok();
        self.report(progress.as_deref());
        Ok(())
    }
}
