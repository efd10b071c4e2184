//! Read access to persisted routing rules

use anonroute_common::{Result, RouterError, RoutingRule};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Settings key holding the rule list
pub const RULES_KEY: &str = "proxyRules";

/// Source of routing rules; the routing engine never writes rules back
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn load_rules(&self) -> Result<Vec<RoutingRule>>;
}

/// Settings document on disk
#[derive(Debug, Clone)]
pub struct JsonRuleStore {
    path: PathBuf,
}

impl JsonRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RuleStore for JsonRuleStore {
    async fn load_rules(&self) -> Result<Vec<RoutingRule>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No settings file, starting without rules");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let rules = parse_rules_document(&contents)?;
        info!(path = %self.path.display(), rules = rules.len(), "Loaded routing rules");
        Ok(rules)
    }
}

/// Rules held in memory
#[derive(Debug, Clone, Default)]
pub struct StaticRuleStore {
    rules: Vec<RoutingRule>,
}

impl StaticRuleStore {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl RuleStore for StaticRuleStore {
    async fn load_rules(&self) -> Result<Vec<RoutingRule>> {
        Ok(self.rules.clone())
    }
}

/// Extract valid rules from a settings document
///
/// A missing key yields no rules. Entries that do not deserialize or
/// fail validation are skipped.
pub fn parse_rules_document(json: &str) -> Result<Vec<RoutingRule>> {
    let document: Value = serde_json::from_str(json)
        .map_err(|e| RouterError::config(format!("settings document is not valid JSON: {}", e)))?;

    let entries = match document.get(RULES_KEY) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            return Err(RouterError::config(format!("{} must be an array", RULES_KEY)));
        }
    };

    let mut rules = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let rule: RoutingRule = match serde_json::from_value(entry.clone()) {
            Ok(rule) => rule,
            Err(e) => {
                warn!(index, "Skipping unreadable rule: {}", e);
                continue;
            }
        };

        if let Err(e) = rule.validate() {
            warn!(index, title = %rule.title, "Skipping invalid rule: {}", e);
            continue;
        }

        debug!(title = %rule.title, destinations = rule.destinations.len(), "Rule accepted");
        rules.push(rule);
    }

    Ok(rules)
}
