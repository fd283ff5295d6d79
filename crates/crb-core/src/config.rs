use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

pub const DEFAULT_PISTON_URL: &str = "https://emkc.org/api/v2/piston";

/// Which backend runs submitted code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Piston,
    Local,
}

impl BackendKind {
    fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "piston" | "remote" => Ok(BackendKind::Piston),
            "local" | "sandbox" => Ok(BackendKind::Local),
            other => Err(Error::Config(format!(
                "EXECUTION_BACKEND must be `piston` or `local`, got `{other}`"
            ))),
        }
    }
}

/// Limits for the reply formatter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatLimits {
    /// Transport maximum, in characters.
    pub max_len: usize,
    pub max_lines: usize,
}

impl Default for FormatLimits {
    fn default() -> Self {
        Self {
            max_len: 2000,
            max_lines: 10,
        }
    }
}

/// Remote execution service settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub base_url: String,
    pub api_key: Option<String>,
    pub run_timeout: Duration,
    pub http_timeout: Duration,
    pub rate_limit_retries: u32,
    pub rate_limit_backoff: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PISTON_URL.to_string(),
            api_key: None,
            run_timeout: Duration::from_millis(1000),
            http_timeout: Duration::from_secs(15),
            rate_limit_retries: 5,
            rate_limit_backoff: Duration::from_secs(10),
        }
    }
}

/// Local interpreter settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxLimits {
    pub python_path: PathBuf,
    pub read_timeout: Duration,
    pub output_max: usize,
    pub input_timeout: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            read_timeout: Duration::from_secs(10),
            output_max: 1_000_000,
            input_timeout: Duration::from_secs(30),
        }
    }
}

/// Typed configuration, loaded from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    pub telegram_allowed_users: Vec<i64>,
    pub owner_id: Option<i64>,
    pub enable_eval: bool,
    pub backend: BackendKind,
    /// Delete the REPL transcript when a session is torn down.
    pub repl_cleanup: bool,

    pub execution: ExecutionLimits,
    pub sandbox: SandboxLimits,
    pub format: FormatLimits,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        let telegram_allowed_users = parse_csv_i64(env_str("TELEGRAM_ALLOWED_USERS"));
        let owner_id = env_str("BOT_OWNER_ID").and_then(|s| s.trim().parse::<i64>().ok());
        let enable_eval = env_bool("ENABLE_EVAL").unwrap_or(true);
        let backend = match env_str("EXECUTION_BACKEND").and_then(non_empty) {
            Some(s) => BackendKind::parse(&s)?,
            None => BackendKind::Piston,
        };

        let repl_cleanup = env_bool("REPL_CLEANUP").unwrap_or(false);

        let execution = Self::load_execution();
        let sandbox = Self::load_sandbox();
        let format = Self::load_format()?;

        Ok(Self {
            telegram_bot_token,
            telegram_allowed_users,
            owner_id,
            enable_eval,
            backend,
            repl_cleanup,
            execution,
            sandbox,
            format,
        })
    }

    fn load_execution() -> ExecutionLimits {
        let defaults = ExecutionLimits::default();
        ExecutionLimits {
            base_url: env_str("PISTON_URL")
                .and_then(non_empty)
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            api_key: env_str("PISTON_API_KEY").and_then(non_empty),
            run_timeout: env_millis("RUN_TIMEOUT_MS").unwrap_or(defaults.run_timeout),
            http_timeout: env_millis("HTTP_TIMEOUT_MS").unwrap_or(defaults.http_timeout),
            rate_limit_retries: env_u32("RATE_LIMIT_RETRIES")
                .unwrap_or(defaults.rate_limit_retries),
            rate_limit_backoff: env_millis("RATE_LIMIT_BACKOFF_MS")
                .unwrap_or(defaults.rate_limit_backoff),
        }
    }

    fn load_sandbox() -> SandboxLimits {
        let defaults = SandboxLimits::default();
        SandboxLimits {
            python_path: env_path("PYTHON_PATH")
                .or_else(|| which_in_path("python3"))
                .or_else(|| which_in_path("python"))
                .unwrap_or(defaults.python_path),
            read_timeout: env_millis("SANDBOX_READ_TIMEOUT_MS").unwrap_or(defaults.read_timeout),
            output_max: env_usize("SANDBOX_OUTPUT_MAX").unwrap_or(defaults.output_max),
            input_timeout: env_millis("REPL_INPUT_TIMEOUT_MS").unwrap_or(defaults.input_timeout),
        }
    }

    fn load_format() -> Result<FormatLimits> {
        let defaults = FormatLimits::default();
        let limits = FormatLimits {
            max_len: env_usize("MAX_REPLY_LEN").unwrap_or(defaults.max_len),
            max_lines: env_usize("MAX_OUTPUT_LINES").unwrap_or(defaults.max_lines),
        };
        // Room for the mention, status line and fence overhead.
        if limits.max_len < 200 {
            return Err(Error::Config(format!(
                "MAX_REPLY_LEN must be at least 200, got {}",
                limits.max_len
            )));
        }
        if limits.max_lines == 0 {
            return Err(Error::Config(
                "MAX_OUTPUT_LINES must be at least 1".to_string(),
            ));
        }
        Ok(limits)
    }

    /// Anyone may run code when no allow-list is configured.
    pub fn is_allowed(&self, user_id: i64) -> bool {
        self.telegram_allowed_users.is_empty() || self.telegram_allowed_users.contains(&user_id)
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        self.owner_id == Some(user_id)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_u64(key).map(Duration::from_millis)
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

/// Locate an interpreter on `PATH` (used by tests and the local backend).
pub fn find_interpreter(name: &str) -> Option<PathBuf> {
    which_in_path(name)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_kind() {
        assert_eq!(BackendKind::parse("Piston").unwrap(), BackendKind::Piston);
        assert_eq!(BackendKind::parse(" local ").unwrap(), BackendKind::Local);
        assert!(BackendKind::parse("docker").is_err());
    }

    #[test]
    fn parses_bools_and_csv() {
        assert!(parse_bool("Yes"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("off"));
        assert_eq!(
            parse_csv_i64(Some("1, 2,,x,3".to_string())),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn default_limits_match_transport() {
        let f = FormatLimits::default();
        assert_eq!((f.max_len, f.max_lines), (2000, 10));
        let e = ExecutionLimits::default();
        assert_eq!(e.rate_limit_retries, 5);
        assert_eq!(e.rate_limit_backoff, Duration::from_secs(10));
        let s = SandboxLimits::default();
        assert_eq!(s.output_max, 1_000_000);
        assert_eq!(s.input_timeout, Duration::from_secs(30));
    }

    #[test]
    fn empty_allow_list_admits_everyone() {
        let cfg = Config {
            telegram_bot_token: "t".to_string(),
            telegram_allowed_users: Vec::new(),
            owner_id: Some(7),
            enable_eval: true,
            backend: BackendKind::Piston,
            repl_cleanup: false,
            execution: ExecutionLimits::default(),
            sandbox: SandboxLimits::default(),
            format: FormatLimits::default(),
        };
        assert!(cfg.is_allowed(42));
        assert!(cfg.is_owner(7));
        assert!(!cfg.is_owner(42));

        let cfg = Config {
            telegram_allowed_users: vec![1],
            ..cfg
        };
        assert!(!cfg.is_allowed(42));
    }
}
