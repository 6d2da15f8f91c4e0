use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "wiggum.toml";

pub const KNOWN_BACKENDS: &[&str] = &["claude", "codex"];

#[derive(Default, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WiggumConfig {
    pub project: ProjectConfig,
    pub workers: WorkersConfig,
    pub backend: BackendConfig,
    pub scoring: ScoringConfig,
    pub retry: RetryConfig,
    pub merge: MergeConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    pub kanban_path: String,
    /// Holds `state.json`, the run lock and per-worker capture logs.
    pub runtime_dir: String,
    pub worktree_dir: String,
    pub trunk: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WorkersConfig {
    pub limit: u32,
    pub timeout_secs: u64,
    pub max_turns: u32,
    pub shutdown_grace_secs: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub name: String,
    /// Overrides the executable looked up on PATH. Empty means the backend name.
    pub binary: String,
    pub model: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    /// Points per second a task has waited since creation.
    pub aging_factor: f64,
    pub sibling_wip_penalty: f64,
    pub plan_bonus: f64,
    /// Per satisfied dependency.
    pub dependency_bonus: f64,
    /// Applied only on the first retry.
    pub resume_initial_bonus: f64,
    /// Per prior failed attempt.
    pub resume_fail_penalty: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_skip_retries: u32,
    pub min_retry_interval_secs: u64,
    pub rate_limit_cooldown_secs: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    pub enabled: bool,
    /// Shell command run at the project root after each merge. Empty disables validation.
    pub validate_command: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            kanban_path: ".ralph/kanban.yaml".to_string(),
            runtime_dir: ".ralph/orchestrator".to_string(),
            worktree_dir: ".ralph/workers".to_string(),
            trunk: "main".to_string(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            limit: 2,
            timeout_secs: 3600,
            max_turns: 50,
            shutdown_grace_secs: 30,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "claude".to_string(),
            binary: String::new(),
            model: String::new(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            aging_factor: 0.01,
            sibling_wip_penalty: 20.0,
            plan_bonus: 15.0,
            dependency_bonus: 5.0,
            resume_initial_bonus: 25.0,
            resume_fail_penalty: 10.0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_skip_retries: 3,
            min_retry_interval_secs: 300,
            rate_limit_cooldown_secs: 600,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            validate_command: String::new(),
        }
    }
}

impl WiggumConfig {
    pub fn kanban_path(&self, root: &Path) -> PathBuf {
        root.join(&self.project.kanban_path)
    }

    pub fn runtime_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.project.runtime_dir)
    }

    pub fn worktree_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.project.worktree_dir)
    }

    pub fn state_path(&self, root: &Path) -> PathBuf {
        self.runtime_dir(root).join("state.json")
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.workers.timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.workers.shutdown_grace_secs)
    }

    pub fn min_retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry.min_retry_interval_secs)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry.rate_limit_cooldown_secs)
    }

    /// Executable to launch for the configured backend.
    pub fn backend_binary(&self) -> String {
        if self.backend.binary.trim().is_empty() {
            self.backend.name.clone()
        } else {
            self.backend.binary.clone()
        }
    }

    pub fn backend_model(&self) -> Option<String> {
        let model = self.backend.model.trim();
        if model.is_empty() {
            None
        } else {
            Some(model.to_string())
        }
    }
}

pub fn validate(config: &WiggumConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.workers.limit < 1 {
        errors.push("workers.limit must be >= 1".to_string());
    }

    if config.workers.timeout_secs < 1 {
        errors.push("workers.timeout_secs must be >= 1".to_string());
    }

    if config.workers.max_turns < 1 {
        errors.push("workers.max_turns must be >= 1".to_string());
    }

    if config.retry.max_skip_retries < 1 {
        errors.push("retry.max_skip_retries must be >= 1".to_string());
    }

    if !KNOWN_BACKENDS.contains(&config.backend.name.as_str()) {
        errors.push(format!(
            "backend.name '{}' is not supported (expected one of: {})",
            config.backend.name,
            KNOWN_BACKENDS.join(", ")
        ));
    }

    if config.project.trunk.trim().is_empty() {
        errors.push("project.trunk must not be empty".to_string());
    }

    let weights = [
        ("aging_factor", config.scoring.aging_factor),
        ("sibling_wip_penalty", config.scoring.sibling_wip_penalty),
        ("plan_bonus", config.scoring.plan_bonus),
        ("dependency_bonus", config.scoring.dependency_bonus),
        ("resume_initial_bonus", config.scoring.resume_initial_bonus),
        ("resume_fail_penalty", config.scoring.resume_fail_penalty),
    ];
    for (name, value) in weights {
        if !value.is_finite() || value < 0.0 {
            errors.push(format!("scoring.{} must be a non-negative number", name));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn format_validation_errors(errors: &[String]) -> String {
    format!(
        "Config validation failed:\n{}",
        errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

/// Load `wiggum.toml` from the project root. A missing file yields defaults.
pub fn load_config(project_root: &Path) -> Result<WiggumConfig, String> {
    load_config_from(&project_root.join(CONFIG_FILE_NAME))
}

pub fn load_config_from(config_path: &Path) -> Result<WiggumConfig, String> {
    if !config_path.exists() {
        return Ok(WiggumConfig::default());
    }

    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;

    let config: WiggumConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", config_path.display(), e))?;

    validate(&config).map_err(|errors| format_validation_errors(&errors))?;

    Ok(config)
}

/// Re-validate after CLI overrides have been applied on top of the file.
pub fn revalidate(config: &WiggumConfig) -> Result<(), String> {
    validate(config).map_err(|errors| format_validation_errors(&errors))
}

/// Rendered defaults written by `wiggum init`.
pub fn default_config_toml() -> Result<String, String> {
    toml::to_string_pretty(&WiggumConfig::default())
        .map_err(|e| format!("Failed to render default config: {}", e))
}
