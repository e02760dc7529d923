//! Capability routing: capability tag -> executor identity.
//!
//! The table is data (loaded from config), not code, so adding an executor
//! never touches the scheduler.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::ExecutorId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub capability: String,
    pub executor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Executor for capabilities no rule mentions.
    pub default_executor: String,
    pub rules: Vec<RoutingRule>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_executor: "general".to_string(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    default_executor: ExecutorId,
    table: HashMap<String, ExecutorId>,
}

impl CapabilityRegistry {
    /// Later rules override earlier ones for the same capability.
    pub fn from_config(config: &RoutingConfig) -> Self {
        let table = config
            .rules
            .iter()
            .map(|r| (normalize(&r.capability), ExecutorId::new(r.executor.clone())))
            .collect();
        Self {
            default_executor: ExecutorId::new(config.default_executor.clone()),
            table,
        }
    }

    pub fn resolve(&self, capability: &str) -> ExecutorId {
        self.table
            .get(&normalize(capability))
            .cloned()
            .unwrap_or_else(|| self.default_executor.clone())
    }

    pub fn executors(&self) -> Vec<ExecutorId> {
        let mut all: Vec<ExecutorId> = self.table.values().cloned().collect();
        all.push(self.default_executor.clone());
        all.sort();
        all.dedup();
        all
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::from_config(&RoutingConfig::default())
    }
}

fn normalize(capability: &str) -> String {
    capability.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::from_config(&RoutingConfig {
            default_executor: "generalist".into(),
            rules: vec![
                RoutingRule {
                    capability: "code".into(),
                    executor: "coder".into(),
                },
                RoutingRule {
                    capability: "Research".into(),
                    executor: "researcher".into(),
                },
            ],
        })
    }

    #[rstest]
    #[case::exact("code", "coder")]
    #[case::case_insensitive("RESEARCH", "researcher")]
    #[case::padded(" code ", "coder")]
    #[case::fallback("poetry", "generalist")]
    fn resolves_capabilities(#[case] capability: &str, #[case] executor: &str) {
        assert_eq!(registry().resolve(capability), ExecutorId::new(executor));
    }

    #[test]
    fn later_rule_wins() {
        let registry = CapabilityRegistry::from_config(&RoutingConfig {
            default_executor: "d".into(),
            rules: vec![
                RoutingRule {
                    capability: "code".into(),
                    executor: "old".into(),
                },
                RoutingRule {
                    capability: "code".into(),
                    executor: "new".into(),
                },
            ],
        });
        assert_eq!(registry.resolve("code"), ExecutorId::new("new"));
    }

    #[test]
    fn executors_lists_each_once() {
        let names: Vec<String> = registry()
            .executors()
            .into_iter()
            .map(|e| e.to_string())
            .collect();
        assert_eq!(names, vec!["coder", "generalist", "researcher"]);
    }
}
