//! Statechart definitions.
//!
//! Statecharts are written in YAML (JSON is accepted too):
//!
//! ```yaml
//! name: purchase order
//! initial: draft
//! states:
//!   - name: draft
//!     transitions:
//!       - event: button_confirm
//!         target: confirmed
//!         guard: "o.amount_total > 0"
//!         actions: [{kind: dispatch}]
//!   - name: confirmed
//!     initial: to_approve
//!     entry: [{kind: call, method: notify_manager}]
//!     states:
//!       - name: to_approve
//!         transitions:
//!           - {event: approve, target: approved, actions: [{kind: dispatch}]}
//!       - name: approved
//! ```
//!
//! States nest under an implicit root. A state with children is compound and
//! must name its `initial` child. State names are unique across the chart.

use crate::configuration::Configuration;
use crate::error::{ConfigurationError, DefinitionError};
use crate::guard::GuardExpr;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

/// An action executed on entry, on exit, or while taking a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Invoke a method on the bound record.
    Call {
        method: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        kwargs: Map<String, Value>,
    },
    /// Invoke the method carried by the triggering event and capture its
    /// return value. Only valid on transitions.
    Dispatch,
}

/// Raw transition as written in the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionRaw {
    pub event: String,

    /// Target state. Absent for internal transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

/// Raw state as written in the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateRaw {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateRaw>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exit: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionRaw>,
}

/// Raw statechart as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatechartRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Initial top-level state.
    pub initial: String,

    pub states: Vec<StateRaw>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// A validated transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub event: String,
    pub source: String,
    pub target: Option<String>,
    pub guard: Option<GuardExpr>,
    pub actions: Vec<Action>,
}

impl Transition {
    /// Returns true for transitions that run actions without changing state.
    pub fn is_internal(&self) -> bool {
        self.target.is_none()
    }
}

/// A validated state.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub name: String,
    /// Parent state; `None` for top-level states.
    pub parent: Option<String>,
    pub initial: Option<String>,
    pub children: Vec<String>,
    pub entry: Vec<Action>,
    pub exit: Vec<Action>,
    pub transitions: Vec<Transition>,
}

impl StateNode {
    pub fn is_compound(&self) -> bool {
        !self.children.is_empty()
    }
}

/// Validated and indexed statechart.
#[derive(Debug, Clone)]
pub struct Definition {
    pub name: Option<String>,

    /// Initial top-level state.
    pub initial: String,

    top_level: Vec<String>,
    states: HashMap<String, StateNode>,

    /// Original raw definition.
    pub raw: StatechartRaw,

    /// Checksum of the normalised definition.
    pub checksum: String,
}

impl Definition {
    /// Parses and validates a statechart from its YAML source.
    pub fn from_yaml(source: &str) -> Result<Self, DefinitionError> {
        let raw: StatechartRaw = serde_yaml::from_str(source)?;
        Self::from_raw(raw)
    }

    /// Validates a raw statechart and indexes it.
    pub fn from_raw(raw: StatechartRaw) -> Result<Self, DefinitionError> {
        if raw.states.is_empty() {
            return Err(invalid("statechart has no states"));
        }

        let mut states = HashMap::new();
        let mut top_level = Vec::with_capacity(raw.states.len());
        for state in &raw.states {
            top_level.push(state.name.clone());
            index_state(state, None, &mut states)?;
        }

        if !top_level.contains(&raw.initial) {
            return Err(invalid(format!(
                "initial state '{}' is not a top-level state",
                raw.initial
            )));
        }

        for node in states.values() {
            for t in &node.transitions {
                if let Some(target) = &t.target {
                    if !states.contains_key(target) {
                        return Err(invalid(format!(
                            "transition from '{}' on '{}' targets unknown state '{}'",
                            node.name, t.event, target
                        )));
                    }
                }
            }
        }

        let normalised = serde_json::to_vec(&raw).map_err(|e| invalid(e.to_string()))?;
        let checksum = format!("{:08x}", crc32c::crc32c(&normalised));

        Ok(Self {
            name: raw.name.clone(),
            initial: raw.initial.clone(),
            top_level,
            states,
            raw,
            checksum,
        })
    }

    /// Looks up a state.
    pub fn state(&self, name: &str) -> Option<&StateNode> {
        self.states.get(name)
    }

    /// Returns true if the given state exists.
    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    /// Returns all state names, sorted.
    pub fn state_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.states.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns the top-level states in source order.
    pub fn top_level(&self) -> &[String] {
        &self.top_level
    }

    /// Returns every event name the chart reacts to, sorted and deduplicated.
    pub fn events(&self) -> Vec<&str> {
        let events: BTreeSet<&str> = self
            .states
            .values()
            .flat_map(|s| s.transitions.iter().map(|t| t.event.as_str()))
            .collect();
        events.into_iter().collect()
    }

    /// Returns `name` followed by its ancestors, innermost first.
    pub fn ancestry(&self, name: &str) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = self.states.get(name);
        while let Some(node) = current {
            chain.push(node.name.as_str());
            current = node.parent.as_deref().and_then(|p| self.states.get(p));
        }
        chain
    }

    /// Returns the states entered by descending initial children from
    /// `name`, starting with `name` itself.
    pub fn initial_descent(&self, name: &str) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = self.states.get(name);
        while let Some(node) = current {
            chain.push(node.name.as_str());
            current = node.initial.as_deref().and_then(|i| self.states.get(i));
        }
        chain
    }

    /// Returns the configuration reached by the initial transition.
    pub fn initial_configuration(&self) -> Configuration {
        Configuration::from_iter(self.initial_descent(&self.initial))
    }

    /// Checks that every state in `configuration` exists in this chart.
    pub fn check_known(&self, configuration: &Configuration) -> Result<(), ConfigurationError> {
        match configuration.iter().find(|s| !self.has_state(s)) {
            Some(state) => Err(ConfigurationError::UnknownState {
                state: state.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Checks that `configuration` is one this chart can be in: exactly one
    /// active top-level state, every active state's parent active, and exactly
    /// one active child under each active compound state.
    pub fn check_consistent(
        &self,
        configuration: &Configuration,
    ) -> Result<(), ConfigurationError> {
        self.check_known(configuration)?;

        let active_top = self
            .top_level
            .iter()
            .filter(|s| configuration.contains(s))
            .count();
        if active_top != 1 {
            return Err(inconsistent(format!(
                "expected one active top-level state, found {}",
                active_top
            )));
        }

        for name in configuration.iter() {
            let node = &self.states[name];
            if let Some(parent) = &node.parent {
                if !configuration.contains(parent) {
                    return Err(inconsistent(format!(
                        "state '{}' is active but its parent '{}' is not",
                        name, parent
                    )));
                }
            }
            if node.is_compound() {
                let active_children = node
                    .children
                    .iter()
                    .filter(|c| configuration.contains(c))
                    .count();
                if active_children != 1 {
                    return Err(inconsistent(format!(
                        "compound state '{}' has {} active children",
                        name, active_children
                    )));
                }
            }
        }

        Ok(())
    }

    /// Returns the raw definition as YAML.
    pub fn to_yaml(&self) -> Result<String, DefinitionError> {
        Ok(serde_yaml::to_string(&self.raw)?)
    }
}

fn index_state(
    raw: &StateRaw,
    parent: Option<&str>,
    states: &mut HashMap<String, StateNode>,
) -> Result<(), DefinitionError> {
    if raw.name.trim().is_empty() {
        return Err(invalid("state with empty name"));
    }
    if states.contains_key(&raw.name) {
        return Err(invalid(format!("duplicate state '{}'", raw.name)));
    }

    let children: Vec<String> = raw.states.iter().map(|s| s.name.clone()).collect();
    match (&raw.initial, children.is_empty()) {
        (Some(initial), false) if !children.contains(initial) => {
            return Err(invalid(format!(
                "initial state '{}' of '{}' is not one of its children",
                initial, raw.name
            )));
        }
        (None, false) => {
            return Err(invalid(format!(
                "compound state '{}' has no initial state",
                raw.name
            )));
        }
        (Some(_), true) => {
            return Err(invalid(format!(
                "atomic state '{}' declares an initial state",
                raw.name
            )));
        }
        _ => {}
    }

    for action in raw.entry.iter().chain(&raw.exit) {
        if *action == Action::Dispatch {
            return Err(invalid(format!(
                "state '{}' dispatches outside of a transition",
                raw.name
            )));
        }
    }

    let mut transitions = Vec::with_capacity(raw.transitions.len());
    for t in &raw.transitions {
        if t.event.trim().is_empty() {
            return Err(invalid(format!(
                "transition from '{}' has an empty event",
                raw.name
            )));
        }
        let guard = t.guard.as_deref().map(GuardExpr::parse).transpose()?;
        transitions.push(Transition {
            event: t.event.clone(),
            source: raw.name.clone(),
            target: t.target.clone(),
            guard,
            actions: t.actions.clone(),
        });
    }

    states.insert(
        raw.name.clone(),
        StateNode {
            name: raw.name.clone(),
            parent: parent.map(str::to_string),
            initial: raw.initial.clone(),
            children,
            entry: raw.entry.clone(),
            exit: raw.exit.clone(),
            transitions,
        },
    );

    for child in &raw.states {
        index_state(child, Some(&raw.name), states)?;
    }

    Ok(())
}

fn invalid(reason: impl Into<String>) -> DefinitionError {
    DefinitionError::Invalid {
        reason: reason.into(),
    }
}

fn inconsistent(reason: String) -> ConfigurationError {
    ConfigurationError::Inconsistent { reason }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const PURCHASE: &str = r#"
name: purchase order
initial: draft
states:
  - name: draft
    entry: [{kind: call, method: on_draft}]
    exit: [{kind: call, method: leave_draft}]
    transitions:
      - event: button_confirm
        target: confirmed
        guard: "o.amount_total > 0"
        actions: [{kind: dispatch}]
      - event: button_cancel
        target: cancel
  - name: confirmed
    initial: to_approve
    entry: [{kind: call, method: on_confirmed}]
    states:
      - name: to_approve
        entry: [{kind: call, method: on_to_approve}]
        transitions:
          - event: approve
            target: approved
            actions: [{kind: dispatch}]
          - event: note
            actions: [{kind: call, method: log_note, args: ["internal"]}]
      - name: approved
    transitions:
      - event: button_cancel
        target: cancel
  - name: cancel
    transitions:
      - event: button_draft
        target: draft
"#;

    #[test]
    fn test_parse_definition() {
        let def = Definition::from_yaml(PURCHASE).unwrap();

        assert_eq!(def.name.as_deref(), Some("purchase order"));
        assert_eq!(def.initial, "draft");
        assert_eq!(
            def.state_names(),
            vec!["approved", "cancel", "confirmed", "draft", "to_approve"]
        );
        assert_eq!(def.top_level(), ["draft", "confirmed", "cancel"]);
        assert_eq!(
            def.events(),
            vec!["approve", "button_cancel", "button_confirm", "button_draft", "note"]
        );
        assert_eq!(def.checksum.len(), 8);
    }

    #[test]
    fn test_hierarchy_helpers() {
        let def = Definition::from_yaml(PURCHASE).unwrap();

        assert_eq!(def.ancestry("to_approve"), vec!["to_approve", "confirmed"]);
        assert_eq!(def.initial_descent("confirmed"), vec!["confirmed", "to_approve"]);
        assert_eq!(
            def.initial_configuration(),
            Configuration::from_iter(["draft"])
        );

        let node = def.state("to_approve").unwrap();
        assert_eq!(node.parent.as_deref(), Some("confirmed"));
        assert!(node.transitions.iter().any(Transition::is_internal));
    }

    #[test]
    fn test_checksum_is_stable() {
        let a = Definition::from_yaml(PURCHASE).unwrap();
        let b = Definition::from_yaml(PURCHASE).unwrap();
        assert_eq!(a.checksum, b.checksum);

        let changed = PURCHASE.replace("o.amount_total > 0", "o.amount_total > 10");
        let c = Definition::from_yaml(&changed).unwrap();
        assert_ne!(a.checksum, c.checksum);
    }

    #[test]
    fn test_json_source_accepted() {
        let json = r#"{"initial": "a", "states": [{"name": "a"}, {"name": "b"}]}"#;
        let def = Definition::from_yaml(json).unwrap();
        assert!(def.has_state("b"));
    }

    #[test]
    fn test_consistency_checks() {
        let def = Definition::from_yaml(PURCHASE).unwrap();

        let ok = Configuration::from_iter(["confirmed", "approved"]);
        assert!(def.check_consistent(&ok).is_ok());

        let unknown = Configuration::from_iter(["S9"]);
        assert!(matches!(
            def.check_consistent(&unknown),
            Err(ConfigurationError::UnknownState { .. })
        ));

        let orphan = Configuration::from_iter(["approved"]);
        assert!(matches!(
            def.check_consistent(&orphan),
            Err(ConfigurationError::Inconsistent { .. })
        ));

        let no_child = Configuration::from_iter(["confirmed"]);
        assert!(matches!(
            def.check_consistent(&no_child),
            Err(ConfigurationError::Inconsistent { .. })
        ));

        let two_top = Configuration::from_iter(["draft", "cancel"]);
        assert!(matches!(
            def.check_consistent(&two_top),
            Err(ConfigurationError::Inconsistent { .. })
        ));

        assert!(def.check_consistent(&Configuration::default()).is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        let result = Definition::from_yaml("states: [unterminated");
        assert!(matches!(result, Err(DefinitionError::Syntax(_))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "initial: a\nstates: [{name: a, colour: red}]";
        assert!(matches!(
            Definition::from_yaml(yaml),
            Err(DefinitionError::Syntax(_))
        ));
    }

    #[test]
    fn test_invalid_initial_state() {
        let yaml = "initial: c\nstates: [{name: a}, {name: b}]";
        assert!(matches!(
            Definition::from_yaml(yaml),
            Err(DefinitionError::Invalid { .. })
        ));
    }

    #[test]
    fn test_invalid_transition_target() {
        let yaml = r#"
initial: a
states:
  - name: a
    transitions: [{event: go, target: c}]
"#;
        assert!(matches!(
            Definition::from_yaml(yaml),
            Err(DefinitionError::Invalid { .. })
        ));
    }

    #[test]
    fn test_duplicate_state() {
        let yaml = r#"
initial: a
states:
  - name: a
    initial: a
    states: [{name: a}]
"#;
        assert!(matches!(
            Definition::from_yaml(yaml),
            Err(DefinitionError::Invalid { .. })
        ));
    }

    #[test]
    fn test_compound_without_initial() {
        let yaml = "initial: a\nstates: [{name: a, states: [{name: b}]}]";
        assert!(matches!(
            Definition::from_yaml(yaml),
            Err(DefinitionError::Invalid { .. })
        ));
    }

    #[test]
    fn test_atomic_with_initial() {
        let yaml = "initial: a\nstates: [{name: a, initial: b}]";
        assert!(matches!(
            Definition::from_yaml(yaml),
            Err(DefinitionError::Invalid { .. })
        ));
    }

    #[test]
    fn test_dispatch_in_entry_rejected() {
        let yaml = "initial: a\nstates: [{name: a, entry: [{kind: dispatch}]}]";
        assert!(matches!(
            Definition::from_yaml(yaml),
            Err(DefinitionError::Invalid { .. })
        ));
    }

    #[test]
    fn test_invalid_guard() {
        let yaml = r#"
initial: a
states:
  - name: a
    transitions: [{event: go, target: a, guard: "ctx.x > 1"}]
"#;
        assert!(matches!(
            Definition::from_yaml(yaml),
            Err(DefinitionError::InvalidGuard { .. })
        ));
    }
}
