use daycare_core::{ProviderSettings, RlmLimits};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration, mapped from `daycare.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaycareConfig {
    pub agent: AgentConfig,
    /// Model providers in priority order.
    pub providers: Vec<ProviderSettings>,
    pub rlm: RlmConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
}

// ── Agent ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// System prompt injected at the start of every conversation.
    pub system_prompt: Option<String>,
    /// Maximum inference iterations per turn before forcing a stop.
    pub max_iterations: usize,
    /// Source label attached to tool executions started by the agent itself.
    pub source: String,
    /// Capacity of the agent event bus.
    pub event_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_iterations: 500,
            source: "daycare".into(),
            event_capacity: 1024,
        }
    }
}

// ── Script workers ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RlmConfig {
    /// Program hosting the interpreter; speaks JSON lines on stdin/stdout.
    pub worker_command: String,
    pub worker_args: Vec<String>,
    /// Seconds to wait for one worker reply.
    pub request_timeout_secs: u64,
    /// Grace period between asking a worker to stop and killing it.
    pub stop_grace_ms: u64,
    pub limits: RlmLimits,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            worker_command: "daycare-monty-worker".into(),
            worker_args: vec![],
            request_timeout_secs: 60,
            stop_grace_ms: 1000,
            limits: RlmLimits::default(),
        }
    }
}

// ── History ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// SQLite database path (None = `~/.daycare/history.db`).
    pub path: Option<PathBuf>,
}

impl HistoryConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".daycare")
                .join("history.db")
        })
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "❌",
            WarningSeverity::Warning => "⚠️ ",
            WarningSeverity::Info => "💡",
        };
        write!(f, "{} {}: {}", icon, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl DaycareConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Providers ───
        if self.providers.is_empty() {
            warnings.push(ConfigWarning {
                field: "providers".into(),
                message: "no providers configured — every turn will fail".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Add a [[providers]] entry with `id` and `model`".into()),
            });
        }
        for (i, p) in self.providers.iter().enumerate() {
            if p.id.trim().is_empty() {
                warnings.push(ConfigWarning {
                    field: format!("providers[{}].id", i),
                    message: "provider id is empty".into(),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
            if p.model.trim().is_empty() {
                warnings.push(ConfigWarning {
                    field: format!("providers[{}].model", i),
                    message: format!("provider '{}' has no model", p.id),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
        }

        // ── Agent loop ───
        if self.agent.max_iterations == 0 {
            warnings.push(ConfigWarning {
                field: "agent.max_iterations".into(),
                message: "max_iterations is 0 — agent can never call the model".into(),
                severity: WarningSeverity::Error,
                hint: Some("Default is 500".into()),
            });
        }

        // ── Workers ───
        if self.rlm.worker_command.trim().is_empty() {
            warnings.push(ConfigWarning {
                field: "rlm.worker_command".into(),
                message: "no worker command — scripts cannot run".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }
        if self.rlm.request_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "rlm.request_timeout_secs".into(),
                message: "request timeout is 0 — every worker call would time out".into(),
                severity: WarningSeverity::Error,
                hint: Some("Default is 60".into()),
            });
        }
        if self.rlm.limits.max_duration_secs <= 0.0 {
            warnings.push(ConfigWarning {
                field: "rlm.limits.max_duration_secs".into(),
                message: format!(
                    "duration limit {} is not positive",
                    self.rlm.limits.max_duration_secs
                ),
                severity: WarningSeverity::Error,
                hint: Some("Default is 30.0".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
