use serde::Serialize;

use super::step::{MigrationStep, StepSet};
use crate::error::{KeelError, Result};

/// Which action of a step a plan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// A step scheduled in a plan, with the ledger transition it makes.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    pub step: MigrationStep,
    pub direction: Direction,
    /// Ledger version expected before the step.
    pub from_version: Option<String>,
    /// Ledger version recorded after the step; `None` means unmigrated.
    pub to_version: Option<String>,
}

impl PlannedStep {
    /// SQL of the action this step runs.
    pub fn action(&self) -> Result<&str> {
        match self.direction {
            Direction::Up => Ok(&self.step.up),
            Direction::Down => self.step.down.as_deref().ok_or_else(|| {
                KeelError::UnsupportedOperation(format!(
                    "migration step '{}' has no down action",
                    self.step.id
                ))
            }),
        }
    }
}

/// An ordered list of steps computed against an observed ledger version.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub schema: String,
    pub direction: Direction,
    /// Ledger version read while planning.
    pub observed: Option<String>,
    pub steps: Vec<PlannedStep>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Ledger version once the whole plan is applied.
    pub fn target_version(&self) -> Option<&str> {
        match self.steps.last() {
            Some(last) => last.to_version.as_deref(),
            None => self.observed.as_deref(),
        }
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|p| p.step.id.as_str()).collect()
    }
}

/// Steps strictly after `current` up to `target` (latest when `None`).
///
/// A `current` version that no step produces means the database and the
/// step list disagree, which is a [`KeelError::DivergentHistory`].
pub fn plan_upgrade(
    steps: &StepSet,
    schema: &str,
    current: Option<&str>,
    target: Option<&str>,
) -> Result<MigrationPlan> {
    let start = match current {
        None => 0,
        Some(version) => position_or_divergent(steps, schema, version)? + 1,
    };
    let end = match target {
        None => steps.len(),
        Some(t) => {
            steps
                .position_of(t)
                .ok_or_else(|| KeelError::Validation(format!("unknown migration target '{}'", t)))?
                + 1
        }
    };
    if end < start {
        return Err(KeelError::Validation(format!(
            "target '{}' is behind the current version '{}'; request a downgrade instead",
            target.unwrap_or_default(),
            current.unwrap_or_default()
        )));
    }

    let mut from = current.map(str::to_string);
    let mut planned = Vec::with_capacity(end - start);
    for step in &steps.steps()[start..end] {
        planned.push(PlannedStep {
            step: step.clone(),
            direction: Direction::Up,
            from_version: from.clone(),
            to_version: Some(step.version.clone()),
        });
        from = Some(step.version.clone());
    }

    Ok(MigrationPlan {
        schema: schema.to_string(),
        direction: Direction::Up,
        observed: current.map(str::to_string),
        steps: planned,
    })
}

/// The last `count` applied steps, newest first.
///
/// Fails with [`KeelError::UnsupportedOperation`] when any of them lacks a
/// down action, before anything is executed.
pub fn plan_downgrade(
    steps: &StepSet,
    schema: &str,
    current: Option<&str>,
    count: usize,
) -> Result<MigrationPlan> {
    let mut planned = Vec::new();
    if let Some(version) = current {
        let pos = position_or_divergent(steps, schema, version)?;
        let applied = &steps.steps()[..=pos];
        for (idx, step) in applied.iter().enumerate().rev().take(count) {
            if !step.has_down() {
                return Err(KeelError::UnsupportedOperation(format!(
                    "migration step '{}' has no down action",
                    step.id
                )));
            }
            planned.push(PlannedStep {
                step: step.clone(),
                direction: Direction::Down,
                from_version: Some(step.version.clone()),
                to_version: idx
                    .checked_sub(1)
                    .and_then(|prev| steps.get(prev))
                    .map(|prev| prev.version.clone()),
            });
        }
    }

    Ok(MigrationPlan {
        schema: schema.to_string(),
        direction: Direction::Down,
        observed: current.map(str::to_string),
        steps: planned,
    })
}

fn position_or_divergent(steps: &StepSet, schema: &str, version: &str) -> Result<usize> {
    steps
        .position_of_version(version)
        .ok_or_else(|| KeelError::DivergentHistory {
            schema: schema.to_string(),
            version: version.to_string(),
        })
}
