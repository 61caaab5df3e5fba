use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Variable lookup used while reading configuration; the process
/// environment in production, a map in tests.
pub trait Vars {
    fn get(&self, key: &str) -> Option<String>;
}

struct ProcessEnv;

impl Vars for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl Vars for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log: LogConfig,
    pub sqlite: SqliteConfig,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(&ProcessEnv)
    }

    pub fn from_vars(vars: &dyn Vars) -> Self {
        Self {
            log: LogConfig::from_vars(vars),
            sqlite: SqliteConfig::from_vars(vars),
            engine: EngineConfig::from_vars(vars),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl LogRotation {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `danci_course_engine=debug`.
    pub filter: String,
    /// Directory of the rolling log file; `None` logs to stdout only.
    pub file_dir: Option<PathBuf>,
    pub file_prefix: String,
    pub rotation: LogRotation,
}

impl LogConfig {
    fn from_vars(vars: &dyn Vars) -> Self {
        let file_enabled = vars
            .get("ENABLE_FILE_LOGS")
            .is_some_and(|v| v == "true" || v == "1");
        let file_dir = file_enabled.then(|| {
            resolve_path(&vars.get("LOG_DIR").unwrap_or_else(|| "./logs".to_string()))
        });

        Self {
            filter: vars.get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            file_dir,
            file_prefix: vars
                .get("LOG_FILE_PREFIX")
                .unwrap_or_else(|| "course-engine.log".to_string()),
            rotation: vars
                .get("LOG_ROTATION")
                .as_deref()
                .and_then(LogRotation::parse)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub path: PathBuf,
    pub busy_timeout: Duration,
    pub max_connections: u32,
}

impl SqliteConfig {
    fn from_vars(vars: &dyn Vars) -> Self {
        let raw_path = vars
            .get("ENGINE_DATABASE_PATH")
            .unwrap_or_else(|| "./data/course-engine.db".to_string());

        Self {
            path: resolve_path(&raw_path),
            busy_timeout: Duration::from_millis(parse_or(vars, "SQLITE_BUSY_TIMEOUT_MS", 5000)),
            max_connections: parse_or(vars, "SQLITE_MAX_CONNECTIONS", 5u32).max(1),
        }
    }
}

/// Tuning for every engine component. Defaults are the production values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub mastery: MasteryConfig,
    pub scheduler: SchedulerConfig,
    pub navigation: NavigationConfig,
    pub remediation: RemediationConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_vars(&ProcessEnv)
    }

    /// Defaults overridden by whichever variables are set. Out-of-range values
    /// are clamped back into the range the engine's invariants need.
    pub fn from_vars(vars: &dyn Vars) -> Self {
        let d = Self::default();

        let mastery = MasteryConfig {
            initial_mastery: unit(vars, "MASTERY_INITIAL", d.mastery.initial_mastery),
            initial_confidence: unit(
                vars,
                "MASTERY_INITIAL_CONFIDENCE",
                d.mastery.initial_confidence,
            ),
            confidence_step: unit(vars, "MASTERY_CONFIDENCE_STEP", d.mastery.confidence_step),
            confidence_cap: unit(vars, "MASTERY_CONFIDENCE_CAP", d.mastery.confidence_cap),
            min_learning_rate: unit(
                vars,
                "MASTERY_MIN_LEARNING_RATE",
                d.mastery.min_learning_rate,
            ),
            forgetting_rate: f64_or(vars, "MASTERY_FORGETTING_RATE", d.mastery.forgetting_rate)
                .max(0.0),
            trend_window: parse_or(vars, "MASTERY_TREND_WINDOW", d.mastery.trend_window).max(1),
            trend_min_attempts: parse_or(
                vars,
                "MASTERY_TREND_MIN_ATTEMPTS",
                d.mastery.trend_min_attempts,
            ),
            trend_margin_binary: unit(
                vars,
                "MASTERY_TREND_MARGIN_BINARY",
                d.mastery.trend_margin_binary,
            ),
            trend_margin_partial: unit(
                vars,
                "MASTERY_TREND_MARGIN_PARTIAL",
                d.mastery.trend_margin_partial,
            ),
            speed_bonus_max: unit(vars, "MASTERY_SPEED_BONUS_MAX", d.mastery.speed_bonus_max),
        };

        let min_easiness =
            f64_or(vars, "REVIEW_MIN_EASINESS", d.scheduler.min_easiness).max(1.0);
        let max_easiness =
            f64_or(vars, "REVIEW_MAX_EASINESS", d.scheduler.max_easiness).max(min_easiness);
        let mastery_low = unit(vars, "REVIEW_MASTERY_LOW", d.scheduler.mastery_low);
        let scheduler = SchedulerConfig {
            initial_easiness: f64_or(vars, "REVIEW_INITIAL_EASINESS", d.scheduler.initial_easiness)
                .clamp(min_easiness, max_easiness),
            min_easiness,
            max_easiness,
            graduation_interval_days: parse_or(
                vars,
                "REVIEW_GRADUATION_INTERVAL_DAYS",
                d.scheduler.graduation_interval_days,
            )
            .max(1),
            mastery_high: unit(vars, "REVIEW_MASTERY_HIGH", d.scheduler.mastery_high)
                .max(mastery_low),
            mastery_low,
            mastery_high_floor_days: parse_or(
                vars,
                "REVIEW_MASTERY_HIGH_FLOOR_DAYS",
                d.scheduler.mastery_high_floor_days,
            )
            .max(1),
            due_limit: parse_or(vars, "REVIEW_DUE_LIMIT", d.scheduler.due_limit).max(1),
        };

        let navigation = NavigationConfig {
            default_mastery_threshold: unit(
                vars,
                "NAV_DEFAULT_MASTERY_THRESHOLD",
                d.navigation.default_mastery_threshold,
            ),
            mastery_gate_subject: vars
                .get("NAV_MASTERY_GATE_SUBJECT")
                .as_deref()
                .and_then(MasteryGateSubject::parse)
                .unwrap_or(d.navigation.mastery_gate_subject),
            optional_multiplier: f64_or(
                vars,
                "NAV_OPTIONAL_MULTIPLIER",
                d.navigation.optional_multiplier,
            )
            .max(0.0),
        };

        let remediation = RemediationConfig {
            max_remediation_hops: parse_or(
                vars,
                "MAX_REMEDIATION_HOPS",
                d.remediation.max_remediation_hops,
            ),
        };

        Self {
            mastery,
            scheduler,
            navigation,
            remediation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasteryConfig {
    pub initial_mastery: f64,
    pub initial_confidence: f64,
    pub confidence_step: f64,
    pub confidence_cap: f64,
    pub min_learning_rate: f64,
    /// Decay per day applied by skill readiness only.
    pub forgetting_rate: f64,
    pub trend_window: usize,
    pub trend_min_attempts: u32,
    pub trend_margin_binary: f64,
    pub trend_margin_partial: f64,
    pub speed_bonus_max: f64,
}

impl Default for MasteryConfig {
    fn default() -> Self {
        Self {
            initial_mastery: 0.0,
            initial_confidence: 0.3,
            confidence_step: 0.05,
            confidence_cap: 0.95,
            min_learning_rate: 0.1,
            forgetting_rate: 0.05,
            trend_window: 5,
            trend_min_attempts: 3,
            trend_margin_binary: 0.1,
            trend_margin_partial: 0.05,
            speed_bonus_max: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub initial_easiness: f64,
    pub min_easiness: f64,
    pub max_easiness: f64,
    pub graduation_interval_days: i64,
    pub mastery_high: f64,
    pub mastery_low: f64,
    pub mastery_high_floor_days: i64,
    pub due_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_easiness: 2.5,
            min_easiness: 1.3,
            max_easiness: 2.5,
            graduation_interval_days: 30,
            mastery_high: 0.8,
            mastery_low: 0.3,
            mastery_high_floor_days: 14,
            due_limit: 20,
        }
    }
}

/// Which node's concept a mastery-gated edge consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryGateSubject {
    #[default]
    Target,
    Source,
}

impl MasteryGateSubject {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "target" => Some(Self::Target),
            "source" => Some(Self::Source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationConfig {
    pub default_mastery_threshold: f64,
    pub mastery_gate_subject: MasteryGateSubject,
    pub optional_multiplier: f64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            default_mastery_threshold: 0.7,
            mastery_gate_subject: MasteryGateSubject::Target,
            optional_multiplier: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationConfig {
    pub max_remediation_hops: u32,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            max_remediation_hops: 2,
        }
    }
}

fn parse_or<T: FromStr>(vars: &dyn Vars, key: &str, default: T) -> T {
    match vars.get(key) {
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable setting, using default");
            default
        }),
        None => default,
    }
}

fn f64_or(vars: &dyn Vars, key: &str, default: f64) -> f64 {
    let value = parse_or(vars, key, default);
    if value.is_finite() {
        value
    } else {
        default
    }
}

fn unit(vars: &dyn Vars, key: &str, default: f64) -> f64 {
    f64_or(vars, key, default).clamp(0.0, 1.0)
}

fn resolve_path(value: &str) -> PathBuf {
    let raw = Path::new(value);
    if raw.is_absolute() {
        return raw.to_path_buf();
    }
    std::env::current_dir()
        .map(|dir| dir.join(raw))
        .unwrap_or_else(|_| raw.to_path_buf())
}
