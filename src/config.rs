use std::path::PathBuf;
use std::time::Duration;

/* ============================= DEFAULTS ============================= */

const DEFAULT_API_HOSTNAME: &str = "0.0.0.0";
const DEFAULT_API_PORT: u16 = 8000;
const DEFAULT_PROXY_PORT: u16 = 16443;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RETRY_TOTAL: u32 = 3;
const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 0.5;
const DEFAULT_LOGS_DIR: &str = "logs";
const DEFAULT_JUDGE_MODEL: &str = "gpt-4o";

/* ============================= TYPES ============================= */

/// Settings for the optional LLM-as-a-judge oracle backend.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
}

impl JudgeConfig {
    pub fn is_configured(&self) -> bool {
        self.api_url.is_some()
    }
}

/// Harness configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_hostname: String,
    pub api_port: u16,
    pub proxy_port: u16,
    pub request_timeout: Duration,
    pub retry_total: u32,
    pub retry_backoff_factor: f64,
    pub use_wandb: bool,
    pub logs_dir: PathBuf,
    pub judge: JudgeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_hostname: DEFAULT_API_HOSTNAME.to_string(),
            api_port: DEFAULT_API_PORT,
            proxy_port: DEFAULT_PROXY_PORT,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry_total: DEFAULT_RETRY_TOTAL,
            retry_backoff_factor: DEFAULT_RETRY_BACKOFF_FACTOR,
            use_wandb: false,
            logs_dir: PathBuf::from(DEFAULT_LOGS_DIR),
            judge: JudgeConfig {
                api_url: None,
                api_key: None,
                model: DEFAULT_JUDGE_MODEL.to_string(),
            },
        }
    }
}

/* ============================= LOADING ============================= */

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env_var(name).map(|v| v.parse::<T>()) {
        Some(Ok(parsed)) => parsed,
        Some(Err(_)) => {
            tracing::warn!(var = name, "config_parse_failed_using_default");
            default
        }
        None => default,
    }
}

impl Config {
    /// Read configuration from the process environment. Missing or malformed
    /// values fall back to defaults with a warning.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Self {
            api_hostname: env_var("API_HOSTNAME").unwrap_or(defaults.api_hostname),
            api_port: parse_or("API_PORT", defaults.api_port),
            proxy_port: parse_or("PROXY_PORT", defaults.proxy_port),
            request_timeout: Duration::from_secs(parse_or(
                "REQUEST_TIMEOUT",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            retry_total: parse_or("RETRY_TOTAL", defaults.retry_total),
            retry_backoff_factor: parse_or("RETRY_BACKOFF_FACTOR", defaults.retry_backoff_factor),
            use_wandb: env_var("USE_WANDB")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            logs_dir: env_var("FAULTBENCH_LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.logs_dir),
            judge: JudgeConfig {
                api_url: env_var("JUDGE_API_URL"),
                api_key: env_var("JUDGE_API_KEY"),
                model: env_var("JUDGE_MODEL").unwrap_or(defaults.judge.model),
            },
        }
    }

    /// Backoff delay before read-retry `attempt` (zero-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let secs = self.retry_backoff_factor * f64::from(1u32 << attempt.min(16));
        Duration::from_secs_f64(secs)
    }
}

/* ============================= TESTS ============================= */
