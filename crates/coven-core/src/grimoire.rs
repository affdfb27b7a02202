//! Grimoire definition: a named, declarative workflow of steps.
//!
//! See spec Section 3 (Data Model) and Section 6.6 (loader precedence).
//! Grimoires are immutable once loaded; the Interpreter (covend) only ever
//! reads through shared references into the grimoire tree, addressing
//! position with the step-path stack (Section 4.3) rather than back-pointers.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::{OnFail, OnMaxIterations, OnSuccess};

#[derive(Debug, Error)]
pub enum GrimoireError {
    #[error("failed to read grimoire file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse grimoire {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("grimoire not found: {0}")]
    NotFound(String),
    #[error("duplicate step name {name:?} within the same container")]
    DuplicateStepName { name: String },
    #[error("step {step:?} declares on_fail: exit_loop outside of a loop body")]
    ExitLoopOutsideLoop { step: String },
}

/// A duration expressed in the grimoire source, e.g. `"30s"`, `"5m"`, `"1h"`.
///
/// Deserializes from a human string to keep grimoire YAML readable; stored
/// internally as a `Duration` so the rest of the engine never re-parses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrimoireDuration(pub Duration);

impl<'de> Deserialize<'de> for GrimoireDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw)
            .map(GrimoireDuration)
            .map_err(serde::de::Error::custom)
    }
}

impl Serialize for GrimoireDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format_duration(self.0))
    }
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (num, unit) = raw.split_at(
        raw.find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("duration {raw:?} has no unit (use s/m/h)"))?,
    );
    let value: f64 = num
        .parse()
        .map_err(|_| format!("duration {raw:?} has a non-numeric magnitude"))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("duration {raw:?} has unknown unit {other:?}")),
    };
    Ok(Duration::from_secs_f64(seconds))
}

fn format_duration(d: Duration) -> String {
    format!("{}s", d.as_secs_f64())
}

/// A named, declarative workflow definition (spec Section 3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Grimoire {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Workflow-wide deadline.
    pub timeout: GrimoireDuration,
    pub steps: Vec<Step>,
}

impl Grimoire {
    pub fn parse(name: &str, yaml: &str) -> Result<Self, GrimoireError> {
        let grimoire: Grimoire =
            serde_yaml::from_str(yaml).map_err(|source| GrimoireError::Parse {
                name: name.to_string(),
                source,
            })?;
        validate_steps(&grimoire.steps, false)?;
        Ok(grimoire)
    }
}

fn validate_steps(steps: &[Step], inside_loop: bool) -> Result<(), GrimoireError> {
    let mut seen = std::collections::HashSet::new();
    for step in steps {
        if !seen.insert(step.name.clone()) {
            return Err(GrimoireError::DuplicateStepName {
                name: step.name.clone(),
            });
        }
        match &step.kind {
            StepKind::Script(s) => {
                if s.on_fail == OnFail::ExitLoop && !inside_loop {
                    return Err(GrimoireError::ExitLoopOutsideLoop {
                        step: step.name.clone(),
                    });
                }
            }
            StepKind::Agent(a) => {
                if a.on_fail == OnFail::ExitLoop && !inside_loop {
                    return Err(GrimoireError::ExitLoopOutsideLoop {
                        step: step.name.clone(),
                    });
                }
            }
            StepKind::Loop(l) => {
                validate_steps(&l.steps, true)?;
            }
            StepKind::Merge(_) => {}
        }
    }
    Ok(())
}

/// A single step within a grimoire or loop body (spec Section 3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Step {
    /// Unique within its immediate container (grimoire top level or one
    /// loop body); duplicate names are rejected at load time.
    pub name: String,
    #[serde(default)]
    pub timeout: Option<GrimoireDuration>,
    /// Template producing a truthy/falsy string (spec Section 4.1); when
    /// absent the step always runs.
    #[serde(default)]
    pub when: Option<String>,
    /// Name under which this step's result is stored in Context outputs;
    /// defaults to the step's own name.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn output_name(&self) -> &str {
        self.output.as_deref().unwrap_or(&self.name)
    }
}

/// The kind-specific fields of a step (spec Section 3 step-kinds table).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Script(ScriptStep),
    Agent(AgentStep),
    Loop(LoopStep),
    Merge(MergeStep),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptStep {
    /// Templated shell command.
    pub command: String,
    #[serde(default)]
    pub on_fail: OnFail,
    #[serde(default)]
    pub on_success: OnSuccess,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentStep {
    /// Spell name, or an inline template (detected by embedded newlines,
    /// spec Section 6.6).
    pub spell: String,
    #[serde(default)]
    pub on_fail: OnFail,
    #[serde(default)]
    pub on_success: OnSuccess,
}

impl AgentStep {
    /// Inline spells are used verbatim, skipping the loader (spec Section 6.6).
    pub fn is_inline(&self) -> bool {
        self.spell.contains('\n')
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoopStep {
    pub max_iterations: u32,
    pub on_max_iterations: OnMaxIterations,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MergeStep {
    #[serde(default)]
    pub require_review: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"
name: implement-bead
description: default implementation loop
timeout: "30m"
steps:
  - name: implement
    type: agent
    spell: implement
  - name: verify
    type: script
    command: "cargo test"
    on_fail: continue
  - name: merge
    type: merge
    require_review: true
"#;

    #[test]
    fn parses_basic_grimoire() {
        let g = Grimoire::parse("implement-bead", SIMPLE).unwrap();
        assert_eq!(g.name, "implement-bead");
        assert_eq!(g.steps.len(), 3);
        assert_eq!(g.timeout.0, Duration::from_secs(1800));
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let yaml = r#"
name: bad
timeout: "1m"
steps:
  - name: a
    type: script
    command: "true"
  - name: a
    type: script
    command: "true"
"#;
        let err = Grimoire::parse("bad", yaml).unwrap_err();
        assert!(matches!(err, GrimoireError::DuplicateStepName { .. }));
    }

    #[test]
    fn rejects_exit_loop_outside_loop() {
        let yaml = r#"
name: bad
timeout: "1m"
steps:
  - name: a
    type: script
    command: "true"
    on_fail: exit_loop
"#;
        let err = Grimoire::parse("bad", yaml).unwrap_err();
        assert!(matches!(err, GrimoireError::ExitLoopOutsideLoop { .. }));
    }

    #[test]
    fn allows_exit_loop_inside_loop() {
        let yaml = r#"
name: ok
timeout: "1m"
steps:
  - name: body
    type: loop
    max_iterations: 3
    on_max_iterations: exit
    steps:
      - name: inner
        type: script
        command: "true"
        on_fail: exit_loop
"#;
        let g = Grimoire::parse("ok", yaml).unwrap();
        assert_eq!(g.steps.len(), 1);
    }

    #[test]
    fn loop_step_nests_steps() {
        let yaml = r#"
name: loopy
timeout: "5m"
steps:
  - name: retry-loop
    type: loop
    max_iterations: 5
    on_max_iterations: block
    steps:
      - name: attempt
        type: script
        command: "echo hi"
"#;
        let g = Grimoire::parse("loopy", yaml).unwrap();
        match &g.steps[0].kind {
            StepKind::Loop(l) => {
                assert_eq!(l.max_iterations, 5);
                assert!(matches!(l.on_max_iterations, OnMaxIterations::Block));
                assert_eq!(l.steps.len(), 1);
            }
            _ => panic!("expected loop step"),
        }
    }

    #[test]
    fn output_name_defaults_to_step_name() {
        let yaml = r#"
name: g
timeout: "1m"
steps:
  - name: step-one
    type: script
    command: "true"
"#;
        let g = Grimoire::parse("g", yaml).unwrap();
        assert_eq!(g.steps[0].output_name(), "step-one");
    }

    #[test]
    fn agent_step_detects_inline_spell() {
        let step = AgentStep {
            spell: "line one\nline two".to_string(),
            on_fail: OnFail::Abort,
            on_success: OnSuccess::Continue,
        };
        assert!(step.is_inline());

        let named = AgentStep {
            spell: "implement".to_string(),
            on_fail: OnFail::Abort,
            on_success: OnSuccess::Continue,
        };
        assert!(!named.is_inline());
    }

    #[test]
    fn parse_duration_accepts_seconds_minutes_hours() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("30x").is_err());
        assert!(parse_duration("abc").is_err());
    }
}
