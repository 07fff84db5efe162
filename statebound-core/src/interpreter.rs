//! Interpreter engine contract and the bundled reference interpreter.
//!
//! The cache only relies on [`InterpreterEngine`]; any engine that can be
//! built from a [`Definition`] and an [`ExecutionContext`] through an
//! [`EngineFactory`] can be plugged in.

use crate::configuration::Configuration;
use crate::definition::{Action, Definition, Transition};
use crate::error::{ActionError, EngineError};
use crate::event::{DispatchOutcome, EventEnvelope, MacroStep};
use crate::guard::GuardExpr;
use crate::record::ExecutionContext;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// Runtime executing a statechart against a bound record.
pub trait InterpreterEngine: Send {
    /// On a fresh interpreter, runs the initial transition including entry
    /// actions. Afterwards, processes at most one queued envelope. Returns
    /// `None` when there was nothing to do.
    fn execute_once(&mut self) -> Result<Option<MacroStep>, EngineError>;

    /// Queues an envelope for a later `execute_once`.
    fn queue(&mut self, envelope: EventEnvelope);

    /// Delivers an envelope now and reports the outcome.
    fn send(&mut self, envelope: EventEnvelope) -> Result<DispatchOutcome, EngineError>;

    /// Returns the active states.
    fn configuration(&self) -> Configuration;

    /// Installs a previously persisted configuration without running any
    /// entry action. Only valid before the interpreter has started.
    fn restore(&mut self, configuration: Configuration) -> Result<(), EngineError>;

    /// Returns true once the initial transition ran or a configuration was
    /// restored.
    fn is_started(&self) -> bool;
}

/// Builds interpreters for the cache.
pub trait EngineFactory: Send + Sync {
    fn build(
        &self,
        definition: Arc<Definition>,
        context: ExecutionContext,
    ) -> Box<dyn InterpreterEngine>;
}

/// Factory for the bundled [`Interpreter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEngineFactory;

impl EngineFactory for DefaultEngineFactory {
    fn build(
        &self,
        definition: Arc<Definition>,
        context: ExecutionContext,
    ) -> Box<dyn InterpreterEngine> {
        Box::new(Interpreter::new(definition, context))
    }
}

/// Reference statechart interpreter.
///
/// Steps are atomic with respect to the configuration: if an action fails,
/// the configuration stays what it was before the step.
#[derive(Debug)]
pub struct Interpreter {
    definition: Arc<Definition>,
    context: ExecutionContext,
    configuration: Configuration,
    started: bool,
    pending: VecDeque<EventEnvelope>,
}

/// Transition selected for an event, with what it will exit and enter.
struct Plan<'d> {
    transition: &'d Transition,
    exited: Vec<String>,
    entered: Vec<String>,
}

impl Interpreter {
    pub fn new(definition: Arc<Definition>, context: ExecutionContext) -> Self {
        Self {
            definition,
            context,
            configuration: Configuration::new(),
            started: false,
            pending: VecDeque::new(),
        }
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.definition
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Returns the number of queued envelopes.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn start(&mut self) -> Result<MacroStep, EngineError> {
        let definition = Arc::clone(&self.definition);
        let entered: Vec<String> = definition
            .initial_descent(&definition.initial)
            .into_iter()
            .map(str::to_string)
            .collect();

        for node in entered.iter().filter_map(|s| definition.state(s)) {
            self.run_actions(&node.entry, None)?;
        }

        self.configuration = Configuration::from_iter(entered.iter().cloned());
        self.started = true;
        tracing::debug!(
            "started interpreter for {} in {}",
            self.context.key(),
            self.configuration
        );
        Ok(MacroStep::Initial { entered })
    }

    /// Returns the innermost active state.
    fn active_leaf(&self) -> Option<&str> {
        self.configuration
            .iter()
            .max_by_key(|s| self.definition.ancestry(s).len())
    }

    fn select(&self, event: &str) -> Result<Plan<'_>, EngineError> {
        let definition = &*self.definition;
        let leaf = self.active_leaf().ok_or(EngineError::NotStarted)?;

        let mut rejected = false;
        for node in definition
            .ancestry(leaf)
            .into_iter()
            .filter_map(|s| definition.state(s))
        {
            for transition in node.transitions.iter().filter(|t| t.event == event) {
                if guard_allows(transition.guard.as_ref(), &self.context) {
                    return Ok(self.plan(transition));
                }
                rejected = true;
            }
        }

        if rejected {
            Err(EngineError::GuardRejected {
                event: event.to_string(),
                configuration: self.configuration.to_string(),
            })
        } else {
            Err(EngineError::EventNotHandled {
                event: event.to_string(),
                configuration: self.configuration.to_string(),
            })
        }
    }

    fn plan<'d>(&'d self, transition: &'d Transition) -> Plan<'d> {
        let Some(target) = transition.target.as_deref() else {
            return Plan {
                transition,
                exited: Vec::new(),
                entered: Vec::new(),
            };
        };

        let definition = &*self.definition;
        let source_up = definition.ancestry(&transition.source);
        let target_up = definition.ancestry(target);

        // Deepest state that is a proper ancestor of both ends; `None` is
        // the implicit root.
        let domain = source_up
            .iter()
            .skip(1)
            .find(|s| target_up.iter().skip(1).any(|t| t == *s))
            .copied();

        let mut exited: Vec<&str> = self
            .configuration
            .iter()
            .filter(|s| match domain {
                Some(d) => *s != d && definition.ancestry(s).contains(&d),
                None => true,
            })
            .collect();
        exited.sort_by_key(|s| std::cmp::Reverse(definition.ancestry(s).len()));

        let mut entered: Vec<&str> = target_up
            .iter()
            .take_while(|s| Some(**s) != domain)
            .copied()
            .collect();
        entered.reverse();
        entered.extend(definition.initial_descent(target).into_iter().skip(1));

        Plan {
            transition,
            exited: exited.into_iter().map(str::to_string).collect(),
            entered: entered.into_iter().map(str::to_string).collect(),
        }
    }

    fn process(&mut self, envelope: EventEnvelope) -> Result<DispatchOutcome, EngineError> {
        if !self.started {
            return Err(EngineError::NotStarted);
        }

        let definition = Arc::clone(&self.definition);
        let (transition, exited, entered) = {
            let plan = self.select(envelope.name())?;
            (plan.transition.clone(), plan.exited, plan.entered)
        };

        for node in exited.iter().filter_map(|s| definition.state(s)) {
            self.run_actions(&node.exit, None)?;
        }
        let return_value = self.run_actions(&transition.actions, Some(&envelope))?;
        for node in entered.iter().filter_map(|s| definition.state(s)) {
            self.run_actions(&node.entry, None)?;
        }

        let mut configuration = self.configuration.clone();
        for state in &exited {
            configuration.remove(state);
        }
        for state in &entered {
            configuration.insert(state.as_str());
        }
        self.configuration = configuration;

        tracing::debug!(
            "{} handled '{}' from '{}', now in {}",
            self.context.key(),
            envelope.name(),
            transition.source,
            self.configuration
        );

        Ok(DispatchOutcome {
            event: envelope.name().to_string(),
            source: transition.source,
            target: transition.target,
            return_value,
            exited,
            entered,
            configuration: self.configuration.clone(),
        })
    }

    /// Runs actions in order, returning the value of the last dispatch.
    fn run_actions(
        &self,
        actions: &[Action],
        envelope: Option<&EventEnvelope>,
    ) -> Result<Option<Value>, ActionError> {
        let mut returned = None;
        for action in actions {
            match action {
                Action::Call {
                    method,
                    args,
                    kwargs,
                } => {
                    self.context.invoke(method, args, kwargs)?;
                }
                Action::Dispatch => match envelope {
                    Some(env) => {
                        let value = self.context.invoke(env.method(), env.args(), env.kwargs())?;
                        returned = Some(value);
                    }
                    None => {
                        tracing::warn!("dispatch action without an event, skipped");
                    }
                },
            }
        }
        Ok(returned)
    }
}

fn guard_allows(guard: Option<&GuardExpr>, ctx: &ExecutionContext) -> bool {
    guard.map(|g| g.evaluate(ctx)).unwrap_or(true)
}

impl InterpreterEngine for Interpreter {
    fn execute_once(&mut self) -> Result<Option<MacroStep>, EngineError> {
        if !self.started {
            return self.start().map(Some);
        }
        match self.pending.pop_front() {
            Some(envelope) => self.process(envelope).map(|o| Some(MacroStep::Event(o))),
            None => Ok(None),
        }
    }

    fn queue(&mut self, envelope: EventEnvelope) {
        self.pending.push_back(envelope);
    }

    fn send(&mut self, envelope: EventEnvelope) -> Result<DispatchOutcome, EngineError> {
        self.process(envelope)
    }

    fn configuration(&self) -> Configuration {
        self.configuration.clone()
    }

    fn restore(&mut self, configuration: Configuration) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }
        self.definition.check_consistent(&configuration)?;
        self.configuration = configuration;
        self.started = true;
        tracing::debug!(
            "restored interpreter for {} in {}",
            self.context.key(),
            self.configuration
        );
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::tests::PURCHASE;
    use crate::error::ConfigurationError;
    use crate::record::testing::MemoryRecord;
    use serde_json::json;

    fn interpreter(record: &Arc<MemoryRecord>) -> Interpreter {
        let definition = Arc::new(Definition::from_yaml(PURCHASE).unwrap());
        Interpreter::new(definition, ExecutionContext::new(record.clone()))
    }

    fn started(record: &Arc<MemoryRecord>) -> Interpreter {
        let mut interp = interpreter(record);
        interp.execute_once().unwrap();
        interp
    }

    #[test]
    fn test_initial_execution_runs_entry_actions() {
        let record = MemoryRecord::new("purchase.order", "1");
        let mut interp = interpreter(&record);

        assert!(!interp.is_started());
        let step = interp.execute_once().unwrap().unwrap();
        assert_eq!(
            step,
            MacroStep::Initial {
                entered: vec!["draft".to_string()]
            }
        );
        assert_eq!(interp.configuration(), Configuration::from_iter(["draft"]));
        assert_eq!(record.calls(), vec!["on_draft"]);

        // Nothing queued.
        assert!(interp.execute_once().unwrap().is_none());
    }

    #[test]
    fn test_send_before_start() {
        let record = MemoryRecord::new("purchase.order", "1");
        let mut interp = interpreter(&record);
        let result = interp.send(EventEnvelope::call("button_cancel"));
        assert!(matches!(result, Err(EngineError::NotStarted)));
    }

    #[test]
    fn test_dispatch_captures_return_value() {
        let record = MemoryRecord::new("purchase.order", "1");
        record.set("amount_total", json!(120));
        let mut interp = started(&record);

        let outcome = interp
            .send(EventEnvelope::new("button_confirm", "approve"))
            .unwrap();

        assert_eq!(outcome.return_value, Some(json!(true)));
        assert_eq!(outcome.source, "draft");
        assert_eq!(outcome.exited, vec!["draft"]);
        assert_eq!(outcome.entered, vec!["confirmed", "to_approve"]);
        assert_eq!(
            interp.configuration(),
            Configuration::from_iter(["confirmed", "to_approve"])
        );
        assert_eq!(
            record.calls(),
            vec!["on_draft", "leave_draft", "approve", "on_confirmed", "on_to_approve"]
        );
    }

    #[test]
    fn test_guard_rejected() {
        let record = MemoryRecord::new("purchase.order", "1");
        record.set("amount_total", json!(0));
        let mut interp = started(&record);

        let result = interp.send(EventEnvelope::call("button_confirm"));
        assert!(matches!(result, Err(EngineError::GuardRejected { .. })));
        assert_eq!(interp.configuration(), Configuration::from_iter(["draft"]));
    }

    #[test]
    fn test_event_not_handled() {
        let record = MemoryRecord::new("purchase.order", "1");
        let mut interp = started(&record);

        let result = interp.send(EventEnvelope::call("approve"));
        assert!(matches!(result, Err(EngineError::EventNotHandled { .. })));
    }

    #[test]
    fn test_ancestor_transition_exits_nested_states() {
        let record = MemoryRecord::with_configuration("purchase.order", "1", "");
        let mut interp = interpreter(&record);
        interp
            .restore(Configuration::from_iter(["confirmed", "to_approve"]))
            .unwrap();

        let outcome = interp.send(EventEnvelope::call("button_cancel")).unwrap();
        assert_eq!(outcome.source, "confirmed");
        assert_eq!(outcome.exited, vec!["to_approve", "confirmed"]);
        assert_eq!(outcome.entered, vec!["cancel"]);
        assert_eq!(interp.configuration(), Configuration::from_iter(["cancel"]));
        assert_eq!(outcome.return_value, None);
    }

    #[test]
    fn test_internal_transition_keeps_configuration() {
        let record = MemoryRecord::new("purchase.order", "1");
        let mut interp = interpreter(&record);
        interp
            .restore(Configuration::from_iter(["confirmed", "to_approve"]))
            .unwrap();

        let outcome = interp.send(EventEnvelope::call("note")).unwrap();
        assert!(!outcome.changed_configuration());
        assert_eq!(outcome.target, None);
        assert_eq!(record.calls(), vec!["log_note"]);
    }

    #[test]
    fn test_restore_skips_entry_actions() {
        let record = MemoryRecord::new("purchase.order", "1");
        let mut interp = interpreter(&record);
        interp
            .restore(Configuration::from_iter(["confirmed", "approved"]))
            .unwrap();

        assert!(interp.is_started());
        assert!(record.calls().is_empty());
        assert!(matches!(
            interp.restore(Configuration::from_iter(["draft"])),
            Err(EngineError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_restore_rejects_inconsistent_configuration() {
        let record = MemoryRecord::new("purchase.order", "1");
        let mut interp = interpreter(&record);
        let result = interp.restore(Configuration::from_iter(["approved"]));
        assert!(matches!(
            result,
            Err(EngineError::Configuration(ConfigurationError::Inconsistent { .. }))
        ));
        assert!(!interp.is_started());
    }

    #[test]
    fn test_failed_action_leaves_configuration() {
        let record = MemoryRecord::new("purchase.order", "1");
        record.set("amount_total", json!(10));
        let mut interp = started(&record);

        let result = interp.send(EventEnvelope::new("button_confirm", "fail"));
        assert!(matches!(result, Err(EngineError::Action(_))));
        assert_eq!(interp.configuration(), Configuration::from_iter(["draft"]));
    }

    #[test]
    fn test_queued_envelopes_processed_in_order() {
        let record = MemoryRecord::new("purchase.order", "1");
        let mut interp = started(&record);

        interp.queue(EventEnvelope::call("button_cancel"));
        interp.queue(EventEnvelope::call("button_draft"));
        assert_eq!(interp.pending(), 2);

        match interp.execute_once().unwrap() {
            Some(MacroStep::Event(outcome)) => assert_eq!(outcome.entered, vec!["cancel"]),
            other => panic!("unexpected step: {:?}", other),
        }
        match interp.execute_once().unwrap() {
            Some(MacroStep::Event(outcome)) => assert_eq!(outcome.entered, vec!["draft"]),
            other => panic!("unexpected step: {:?}", other),
        }
        assert!(interp.execute_once().unwrap().is_none());
    }

    #[test]
    fn test_self_transition_reenters_state() {
        let yaml = r#"
initial: idle
states:
  - name: idle
    entry: [{kind: call, method: enter_idle}]
    exit: [{kind: call, method: exit_idle}]
    transitions: [{event: reset, target: idle}]
"#;
        let record = MemoryRecord::new("job", "1");
        let definition = Arc::new(Definition::from_yaml(yaml).unwrap());
        let mut interp = Interpreter::new(definition, ExecutionContext::new(record.clone()));
        interp.execute_once().unwrap();

        let outcome = interp.send(EventEnvelope::call("reset")).unwrap();
        assert_eq!(outcome.exited, vec!["idle"]);
        assert_eq!(outcome.entered, vec!["idle"]);
        assert_eq!(record.calls(), vec!["enter_idle", "exit_idle", "enter_idle"]);
    }
}
