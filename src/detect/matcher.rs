// src/detect/matcher.rs
//!
//! Stateless rule engine: compile every enabled rule once, evaluate each
//! event against all of them in input order.

use crate::detect::expr::{self, EvalError, Expr};
use crate::error::{Result, SentryError};
use crate::model::{Alert, Rule, RuntimeEvent};

#[derive(Debug)]
struct CompiledRule {
    rule: Rule,
    program: Expr,
}

/// Compiled rule set. Immutable after construction; a reload builds a fresh
/// engine and the caller swaps it in.
#[derive(Debug)]
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
}

impl RuleEngine {
    /// Compiles all enabled rules. One malformed predicate fails the whole
    /// build; a partially compiled rule set never serves.
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let mut compiled = Vec::new();
        for rule in rules.into_iter().filter(|r| r.enabled) {
            let program =
                expr::compile(&rule.condition).map_err(|diagnostic| SentryError::Compile {
                    rule_id: rule.id.clone(),
                    diagnostic,
                })?;
            compiled.push(CompiledRule { rule, program });
        }
        Ok(Self { rules: compiled })
    }

    /// Evaluate one event against every rule, in rule input order.
    ///
    /// Pure: two calls with the same event produce structurally equal alert
    /// lists. An evaluation error in one rule is logged and skips only that
    /// rule.
    pub fn evaluate(&self, event: &RuntimeEvent) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for compiled in &self.rules {
            match expr::evaluate(&compiled.program, event) {
                Ok(true) => alerts.push(Alert::candidate(&compiled.rule, event)),
                Ok(false) => {}
                Err(EvalError::AbsentDocument(doc)) => {
                    log::debug!(
                        "rule {} skipped for event {}: absent sub-document '{}'",
                        compiled.rule.name,
                        event.event_id,
                        doc
                    );
                }
                Err(e) => {
                    log::warn!(
                        "rule {} evaluation error on event {}: {}",
                        compiled.rule.name,
                        event.event_id,
                        e
                    );
                }
            }
        }
        alerts
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerInfo, ProcessInfo, Severity};
    use chrono::Utc;

    fn rule(id: &str, condition: &str) -> Rule {
        Rule {
            id: id.to_string(),
            name: format!("Rule {}", id),
            description: String::new(),
            severity: Severity::High,
            condition: condition.to_string(),
            response: String::new(),
            enabled: true,
        }
    }

    fn prod_shell_event() -> RuntimeEvent {
        RuntimeEvent {
            timestamp: Utc::now(),
            cluster_id: "c1".to_string(),
            node_id: "n1".to_string(),
            event_type: "process_exec".to_string(),
            event_id: "e1".to_string(),
            process: Some(ProcessInfo {
                exe: "/bin/bash".to_string(),
                ..Default::default()
            }),
            container: Some(ContainerInfo {
                namespace: "prod".to_string(),
                pod: "p1".to_string(),
                ..Default::default()
            }),
            network: None,
        }
    }

    #[test]
    fn matching_rules_fire_in_input_order() {
        let engine = RuleEngine::new(vec![
            rule("r1", "event.container.namespace == 'prod'"),
            rule("r2", "event.event_type == 'file_open'"),
            rule("r3", "event.process.exe == '/bin/bash'"),
        ])
        .unwrap();

        let alerts = engine.evaluate(&prod_shell_event());
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].rule_name, "Rule r1");
        assert_eq!(alerts[1].rule_name, "Rule r3");
    }

    #[test]
    fn disabled_rules_are_not_compiled() {
        let mut disabled = rule("r1", "this is not a predicate");
        disabled.enabled = false;
        let engine = RuleEngine::new(vec![disabled, rule("r2", "true")]).unwrap();
        assert_eq!(engine.rule_count(), 1);
    }

    #[test]
    fn one_bad_rule_fails_the_build() {
        let err = RuleEngine::new(vec![rule("good", "true"), rule("bad", "event.process.")])
            .unwrap_err();
        match err {
            SentryError::Compile { rule_id, .. } => assert_eq!(rule_id, "bad"),
            other => panic!("expected compile error, got {:?}", other),
        }
    }

    #[test]
    fn rule_errors_do_not_affect_siblings() {
        let engine = RuleEngine::new(vec![
            rule("needs-network", "event.network.dst_ip == '8.8.8.8'"),
            rule("matches", "event.process.exe == '/bin/bash'"),
        ])
        .unwrap();

        let alerts = engine.evaluate(&prod_shell_event());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_name, "Rule matches");
    }

    #[test]
    fn evaluation_is_pure() {
        let engine = RuleEngine::new(vec![rule("r1", "event.process.exe == '/bin/bash'")]).unwrap();
        let event = prod_shell_event();
        assert_eq!(engine.evaluate(&event), engine.evaluate(&event));
    }
}
