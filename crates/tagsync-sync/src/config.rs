use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tagsync_core::{BucketClass, Record, LABEL_CARRIED_PREFIX};
use tagsync_storage::{HttpClientConfig, HttpStoreConfig, RecordFilter};

pub const CONSOLIDATION_FILE: &str = "consolidation.yaml";

const DEFAULT_DECAY_WINDOW_DAYS: i64 = 180;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub perform_as: Option<String>,
    pub webhook_urls: Vec<String>,
    pub full_webhook_urls: Vec<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub include_archived: bool,
    pub workspace_root: PathBuf,
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("TAGSYNC_API_URL")
                .unwrap_or_else(|_| "https://api.lever.co/v1/".to_string()),
            api_key: std::env::var("TAGSYNC_API_KEY").ok().filter(|k| !k.is_empty()),
            perform_as: std::env::var("TAGSYNC_PERFORM_AS").ok().filter(|u| !u.is_empty()),
            webhook_urls: env_list("TAGSYNC_WEBHOOK_URLS"),
            full_webhook_urls: env_list("TAGSYNC_FULL_WEBHOOK_URLS"),
            scheduler_enabled: env_flag("TAGSYNC_SCHEDULER_ENABLED"),
            sync_cron: std::env::var("TAGSYNC_SYNC_CRON")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            user_agent: std::env::var("TAGSYNC_USER_AGENT")
                .unwrap_or_else(|_| "tagsync-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("TAGSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            include_archived: env_flag("TAGSYNC_INCLUDE_ARCHIVED"),
            workspace_root: std::env::var("TAGSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn record_filter(&self) -> RecordFilter {
        if self.include_archived {
            RecordFilter::default()
        } else {
            RecordFilter::active()
        }
    }

    pub fn http_store_config(&self) -> Result<HttpStoreConfig> {
        let Some(api_key) = self.api_key.clone() else {
            bail!("TAGSYNC_API_KEY is not set");
        };
        Ok(HttpStoreConfig {
            base_url: self.api_url.clone(),
            api_key,
            perform_as: self.perform_as.clone(),
            client: HttpClientConfig {
                timeout: Duration::from_secs(self.http_timeout_secs),
                user_agent: Some(self.user_agent.clone()),
                ..Default::default()
            },
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketEntry {
    pub key: String,
    pub name: String,
}

/// One carry-forward rule: an exact label or a label prefix.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CarryForwardRule {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

impl CarryForwardRule {
    pub fn matches(&self, label: &str) -> bool {
        if label.starts_with(LABEL_CARRIED_PREFIX) {
            return false;
        }
        match (&self.label, &self.prefix) {
            (Some(exact), _) => label == exact,
            (None, Some(prefix)) => label.starts_with(prefix.as_str()),
            (None, None) => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsolidationConfig {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    pub buckets: Vec<BucketEntry>,
    #[serde(default = "default_decay_window_days")]
    pub decay_window_days: i64,
    #[serde(default)]
    pub source_label_prefix: Option<String>,
    #[serde(default)]
    pub carry_forward: Vec<CarryForwardRule>,
}

fn default_decay_window_days() -> i64 {
    DEFAULT_DECAY_WINDOW_DAYS
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            version: 1,
            buckets: Vec::new(),
            decay_window_days: DEFAULT_DECAY_WINDOW_DAYS,
            source_label_prefix: None,
            carry_forward: Vec::new(),
        }
    }
}

impl ConsolidationConfig {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join(CONSOLIDATION_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.decay_window_days <= 0 {
            bail!("decay_window_days must be positive, got {}", self.decay_window_days);
        }
        for (i, rule) in self.carry_forward.iter().enumerate() {
            if rule.label.is_some() == rule.prefix.is_some() {
                bail!("carry_forward[{i}] needs exactly one of `label` or `prefix`");
            }
        }
        let mut seen = HashMap::new();
        for bucket in &self.buckets {
            if let Some(previous) = seen.insert(bucket.key.as_str(), bucket.name.as_str()) {
                bail!(
                    "bucket key {} listed twice ({previous}, {})",
                    bucket.key,
                    bucket.name
                );
            }
        }
        Ok(())
    }

    pub fn decay_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.decay_window_days)
    }

    pub fn qualifies_for_carry_forward(&self, label: &str) -> bool {
        self.carry_forward.iter().any(|rule| rule.matches(label))
    }

    pub fn catalog(&self) -> BucketCatalog {
        BucketCatalog {
            names: self
                .buckets
                .iter()
                .map(|b| (b.key.clone(), b.name.clone()))
                .collect(),
        }
    }
}

/// Maps raw bucket keys to configured bucket names.
#[derive(Debug, Clone, Default)]
pub struct BucketCatalog {
    names: HashMap<String, String>,
}

impl BucketCatalog {
    pub fn classify(&self, record: &Record) -> BucketClass {
        match &record.bucket {
            None => BucketClass::Unassigned,
            Some(key) => match self.names.get(key) {
                Some(name) => BucketClass::Recognized(name.clone()),
                None => BucketClass::OutOfScope,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const CONFIG: &str = r#"
version: 1
buckets:
  - { key: posting-a, name: LD15 }
  - { key: posting-b, name: BE6 }
source_label_prefix: "🤖 self-reported source: "
carry_forward:
  - label: Do not contact
  - prefix: "Flag: "
"#;

    fn record(bucket: Option<&str>) -> Record {
        let mut r = Record::new("r", "e", Utc.timestamp_opt(0, 0).single().unwrap());
        r.bucket = bucket.map(str::to_string);
        r
    }

    #[test]
    fn buckets_classify_records() {
        let config = ConsolidationConfig::from_yaml_str(CONFIG).unwrap();
        let catalog = config.catalog();
        assert_eq!(catalog.classify(&record(None)), BucketClass::Unassigned);
        assert_eq!(
            catalog.classify(&record(Some("posting-b"))),
            BucketClass::Recognized("BE6".to_string())
        );
        assert_eq!(catalog.classify(&record(Some("other"))), BucketClass::OutOfScope);
        assert_eq!(config.decay_window(), chrono::Duration::days(180));
    }

    #[test]
    fn carry_forward_rules_match_exact_and_prefix() {
        let config = ConsolidationConfig::from_yaml_str(CONFIG).unwrap();
        assert!(config.qualifies_for_carry_forward("Do not contact"));
        assert!(config.qualifies_for_carry_forward("Flag: visa"));
        assert!(!config.qualifies_for_carry_forward("Do not contact again"));
        assert!(!config.qualifies_for_carry_forward("🤖 [Carried] Flag: visa"));
    }

    #[test]
    fn ambiguous_carry_forward_rule_is_rejected() {
        let broken = CONFIG.replace("  - label: Do not contact\n", "  - {}\n");
        assert!(ConsolidationConfig::from_yaml_str(&broken).is_err());
    }

    #[test]
    fn duplicate_bucket_keys_are_rejected() {
        let broken = CONFIG.replace("posting-b", "posting-a");
        let err = ConsolidationConfig::from_yaml_str(&broken).unwrap_err();
        assert!(err.to_string().contains("posting-a"));
    }

    #[test]
    fn shipped_consolidation_file_loads() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let config = ConsolidationConfig::from_workspace_root(&root).unwrap();
        assert!(!config.buckets.is_empty());
    }
}
