//! Daemon configuration: TOML rule file.
//!
//! ```toml
//! timeout = 30            # seconds, <= 0 disables the idle timeout
//!
//! [[rules]]
//! name = "web"            # optional, informational
//! listen = 9000
//! forward = "127.0.0.1:9100"
//! simultaneous = 1        # optional, 0 = unlimited
//! ```
//!
//! Keys are also accepted in PascalCase (`Timeout`, `Rules`, `Listen`, ...).

use portfwd_core::{ForwardError, ForwardResult, IdleTimeout, Rule, RuleTable};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "rules.toml";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default, alias = "Timeout")]
    pub timeout: i64,
    #[serde(default, alias = "Rules")]
    pub rules: Vec<RuleSection>,
}

/// One `[[rules]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSection {
    #[serde(default, alias = "Name")]
    pub name: Option<String>,
    #[serde(default, alias = "Listen")]
    pub listen: u16,
    #[serde(default, alias = "Forward")]
    pub forward: String,
    #[serde(default, alias = "Simultaneous")]
    pub simultaneous: usize,
}

impl From<RuleSection> for Rule {
    fn from(section: RuleSection) -> Self {
        let rule = Rule::new(section.listen, section.forward).with_limit(section.simultaneous);
        match section.name {
            Some(name) => rule.with_name(name),
            None => rule,
        }
    }
}

/// Validated configuration handed to the forwarding engine.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub rules: RuleTable,
    pub idle_timeout: IdleTimeout,
}

impl DaemonConfig {
    /// Read and validate the config file at `path`.
    pub fn load(path: &Path) -> ForwardResult<Self> {
        info!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path).map_err(|e| {
            ForwardError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate TOML config text.
    pub fn parse(content: &str) -> ForwardResult<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| ForwardError::Config(format!("config parse error: {e}")))?;
        file.resolve()
    }
}

impl ConfigFile {
    /// Validate the rules and resolve the timeout.
    pub fn resolve(self) -> ForwardResult<DaemonConfig> {
        let rules = RuleTable::new(self.rules.into_iter().map(Rule::from).collect())?;
        Ok(DaemonConfig {
            rules,
            idle_timeout: IdleTimeout::from_secs(self.timeout),
        })
    }
}
