// src/detect/rules.rs
//!
//! Rule loading: a built-in default set plus optional YAML files.
//!
//! A rule file holds one `RuleSet` document; stateless rules, threshold
//! rules and sequence rules can be mixed freely. Files merge over the
//! built-ins in directory walk order. A malformed file is fatal at startup;
//! a malformed predicate inside an otherwise valid file surfaces later as a
//! compile error with the offending rule id.

use std::path::Path;

use crate::detect::correlator::{SequenceRule, ThresholdRule};
use crate::error::{Result, SentryError};
use crate::model::{Rule, Severity};

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdRule>,
    #[serde(default)]
    pub sequences: Vec<SequenceRule>,
}

impl RuleSet {
    pub fn merge(&mut self, other: RuleSet) {
        self.rules.extend(other.rules);
        self.thresholds.extend(other.thresholds);
        self.sequences.extend(other.sequences);
    }
}

fn rule(
    id: &str,
    name: &str,
    description: &str,
    severity: Severity,
    condition: &str,
    response: &str,
) -> Rule {
    Rule {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        severity,
        condition: condition.to_string(),
        response: response.to_string(),
        enabled: true,
    }
}

/// Default detection content shipped with the binary.
pub fn builtin_rules() -> RuleSet {
    RuleSet {
        rules: vec![
            rule(
                "rule-shell-spawn",
                "Shell Spawn in Prod",
                "Bash or sh spawned in production namespace",
                Severity::High,
                "event.process.exe in ['/bin/bash', '/bin/sh', '/usr/bin/bash'] && event.container.namespace == 'prod'",
                "kill_pod",
            ),
            rule(
                "rule-token-read",
                "Service Account Token Read",
                "Process reading service account token",
                Severity::High,
                "event.event_type == 'file_open' && event.process.cmdline.contains('/var/run/secrets/kubernetes.io/serviceaccount/token')",
                "quarantine_namespace",
            ),
            rule(
                "rule-reverse-shell",
                "Reverse Shell",
                "Network connection to external IP with shell process",
                Severity::Critical,
                "event.event_type == 'network_connect' && (event.process.exe.endsWith('bash') || event.process.exe.endsWith('sh')) && event.network.dst_ip != '' && !event.network.dst_ip.startsWith('10.') && !event.network.dst_ip.startsWith('192.168.') && !event.network.dst_ip.startsWith('172.')",
                "kill_pod",
            ),
            rule(
                "rule-priv-escalation",
                "Privilege Escalation",
                "Container added sensitive capabilities",
                Severity::Critical,
                "event.process.capabilities_added.exists(c, c == 'SYS_ADMIN' || c == 'NET_ADMIN')",
                "isolate_node",
            ),
            rule(
                "rule-package-manager",
                "Package Manager in Prod",
                "apt or apk executed in prod",
                Severity::Medium,
                "event.process.exe in ['/usr/bin/apt', '/sbin/apk', '/usr/bin/yum'] && event.container.namespace == 'prod'",
                "",
            ),
        ],
        thresholds: vec![ThresholdRule {
            id: "th-exec-burst".to_string(),
            name: "Process Execution Burst".to_string(),
            description: "Five or more process executions in one container inside a minute"
                .to_string(),
            condition: "event.event_type == 'process_exec'".to_string(),
            count: 5,
            window_secs: 60,
            group_by: "container.container_id".to_string(),
            severity: Severity::Medium,
            response: String::new(),
            enabled: true,
        }],
        sequences: vec![SequenceRule {
            id: "seq-token-exfil".to_string(),
            name: "Token Read then External Connect".to_string(),
            description: "Service account token read followed by a connection outside RFC1918 space"
                .to_string(),
            steps: vec![
                "event.event_type == 'file_open' && event.process.cmdline.contains('/var/run/secrets/kubernetes.io/serviceaccount/token')".to_string(),
                "event.event_type == 'network_connect' && event.network.dst_ip != '' && !event.network.dst_ip.startsWith('10.') && !event.network.dst_ip.startsWith('192.168.') && !event.network.dst_ip.startsWith('172.')".to_string(),
            ],
            window_secs: 300,
            group_by: "container.container_id".to_string(),
            severity: Severity::Critical,
            response: "quarantine_namespace".to_string(),
            enabled: true,
        }],
    }
}

/// Load every `.yaml`/`.yml` under `dir` and merge onto the built-ins.
pub fn load_rules(dir: Option<&Path>) -> Result<RuleSet> {
    let mut set = builtin_rules();
    let Some(dir) = dir else {
        return Ok(set);
    };
    if !dir.exists() {
        return Err(SentryError::Config(format!(
            "rules directory does not exist: {}",
            dir.display()
        )));
    }

    let mut loaded = 0usize;
    for entry in walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if !is_yaml {
            continue;
        }
        let content = std::fs::read_to_string(path)?;
        let file_set: RuleSet = serde_yaml::from_str(&content).map_err(|e| {
            SentryError::Config(format!("rule file {}: {}", path.display(), e))
        })?;
        set.merge(file_set);
        loaded += 1;
    }
    log::info!("loaded {} rule files from {}", loaded, dir.display());
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::matcher::RuleEngine;

    #[test]
    fn builtins_compile() {
        let set = builtin_rules();
        RuleEngine::new(set.rules).expect("builtin rules compile");
        crate::detect::correlator::Correlator::new(
            std::sync::Arc::new(crate::store::MemoryCorrelationStore::new()),
            set.thresholds,
            set.sequences,
        )
        .expect("builtin correlation rules compile");
    }

    #[test]
    fn ruleset_yaml_round_trip() {
        let yaml = r#"
rules:
  - id: custom-1
    name: Custom
    severity: low
    condition: "event.event_type == 'file_open'"
thresholds:
  - id: custom-th
    name: Burst
    condition: "true"
    count: 3
    window_secs: 30
    group_by: container.container_id
    severity: medium
"#;
        let set: RuleSet = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(set.rules.len(), 1);
        assert!(set.rules[0].enabled);
        assert_eq!(set.thresholds.len(), 1);
        assert_eq!(set.thresholds[0].count, 3);
        assert!(set.sequences.is_empty());
    }
}
