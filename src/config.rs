//! Environment-driven configuration
//!
//! Every knob has a default; malformed values are logged and ignored.

use crate::llm::LlmConfig;
use crate::runtime::Timeouts;
use crate::state_machine::state::{BudgetMode, ValidatorWindow};
use crate::state_machine::TurnSettings;
use crate::telemetry::LogFormat;
use crate::tools::ToolKind;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Calendar provider credentials and endpoints
#[derive(Debug, Clone, Default)]
pub struct CalendarConfig {
    pub token: Option<String>,
    pub api_base: Option<String>,
    pub people_base: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub log_format: LogFormat,
    pub turn: TurnSettings,
    pub timeouts: Timeouts,
    pub llm: LlmConfig,
    pub calendar: CalendarConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let db_path = var("CALAGENT_DB_PATH").map_or_else(
            || {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".calendar-agent").join("conversations.db")
            },
            PathBuf::from,
        );

        let mut turn = TurnSettings::default();
        if let Some(enabled) = parse_var(&var, "CALAGENT_VALIDATOR", parse_bool) {
            turn.validator_enabled = enabled;
        }
        if let Some(budget) = parse_var(&var, "CALAGENT_TOOL_BUDGET", |v| v.parse::<u32>().ok()) {
            turn.tool_budget = budget;
        }
        if let Some(mode) = parse_var(&var, "CALAGENT_BUDGET_MODE", parse_budget_mode) {
            turn.budget_mode = mode;
        }
        if let Some(window) = parse_var(&var, "CALAGENT_VALIDATOR_HISTORY", parse_window) {
            turn.validator_window = window;
        }
        if let Some(enabled) = parse_var(&var, "CALAGENT_CONTACT_DISAMBIGUATION", parse_bool) {
            turn.contact_disambiguation = enabled;
        }
        if let Some(attempts) = parse_var(&var, "CALAGENT_LLM_MAX_ATTEMPTS", |v| {
            v.parse::<u32>().ok().filter(|n| *n >= 1)
        }) {
            turn.max_attempts = attempts;
        }
        if let Some(ms) = parse_var(&var, "CALAGENT_RETRY_BASE_MS", |v| v.parse::<u64>().ok()) {
            turn.retry_base = Duration::from_millis(ms);
        }
        if let Some(tools) = parse_var(&var, "CALAGENT_TOOLS", |v| ToolKind::parse_list(v).ok()) {
            turn.tools = tools;
        }
        turn.timezone = var("CALAGENT_TIMEZONE")
            .or_else(|| var("TZ"))
            .unwrap_or_else(|| chrono::Local::now().offset().to_string());

        let mut timeouts = Timeouts::default();
        if let Some(secs) = parse_var(&var, "CALAGENT_LLM_TIMEOUT_SECS", parse_positive) {
            timeouts.llm = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&var, "CALAGENT_TOOL_TIMEOUT_SECS", parse_positive) {
            timeouts.tool = Duration::from_secs(secs);
        }

        Self {
            db_path,
            port: parse_var(&var, "CALAGENT_PORT", |v| v.parse::<u16>().ok()).unwrap_or(8000),
            log_format: parse_var(&var, "CALAGENT_LOG_FORMAT", LogFormat::parse).unwrap_or_default(),
            turn,
            timeouts,
            llm: LlmConfig {
                openai_api_key: var("OPENAI_API_KEY"),
                gateway: var("LLM_GATEWAY"),
                default_model: var("LLM_MODEL"),
            },
            calendar: CalendarConfig {
                token: var("GOOGLE_CALENDAR_TOKEN"),
                api_base: var("GOOGLE_API_BASE"),
                people_base: var("GOOGLE_PEOPLE_API_BASE"),
            },
        }
    }
}

/// Read and parse one variable. Unparseable values are reported and dropped.
fn parse_var<T>(
    var: impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = var(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
    }
    parsed
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_positive<T: FromStr + PartialOrd + Default>(raw: &str) -> Option<T> {
    raw.parse().ok().filter(|v| *v > T::default())
}

fn parse_budget_mode(raw: &str) -> Option<BudgetMode> {
    match raw.to_ascii_lowercase().as_str() {
        "per_batch" => Some(BudgetMode::PerBatch),
        "per_call" => Some(BudgetMode::PerCall),
        _ => None,
    }
}

fn parse_window(raw: &str) -> Option<ValidatorWindow> {
    if raw.eq_ignore_ascii_case("full") {
        return Some(ValidatorWindow::Full);
    }
    raw.parse().ok().map(ValidatorWindow::LastExchanges)
}
