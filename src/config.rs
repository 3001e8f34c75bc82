use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub upload_dir: PathBuf,
    pub converted_dir: PathBuf,
    pub inbox_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub rld_converter_command: Option<String>,
    pub rld_file_filter: String,
    pub monitor_interval_secs: u64,
    pub monitor_batch_size: usize,
    pub monitor_stop_timeout_secs: u64,
    pub monitor_autostart: bool,
    pub notifier_send_timeout_ms: u64,
    pub notifier_channel_capacity: usize,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Config {
            database_url: var_or("DATABASE_URL", "sqlite://datasense.db?mode=rwc")?,
            server_host: var_or("SERVER_HOST", "0.0.0.0")?,
            server_port: parse_or("SERVER_PORT", 5000)?,
            upload_dir: var_or("UPLOAD_DIR", "uploads")?.into(),
            converted_dir: var_or("CONVERTED_DIR", "converted")?.into(),
            inbox_dir: var_or("INBOX_DIR", "inbox")?.into(),
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            rld_converter_command: optional_var("RLD_CONVERTER_COMMAND")?
                .filter(|c| !c.trim().is_empty()),
            rld_file_filter: var_or("RLD_FILE_FILTER", "000110")?,
            monitor_interval_secs: parse_or("MONITOR_INTERVAL_SECS", 300)?,
            monitor_batch_size: parse_or("MONITOR_BATCH_SIZE", 10)?,
            monitor_stop_timeout_secs: parse_or("MONITOR_STOP_TIMEOUT_SECS", 5)?,
            monitor_autostart: parse_or("MONITOR_AUTOSTART", false)?,
            notifier_send_timeout_ms: parse_or("NOTIFIER_SEND_TIMEOUT_MS", 500)?,
            notifier_channel_capacity: parse_or("NOTIFIER_CHANNEL_CAPACITY", 64)?,
            cors_origins: var_or("CORS_ORIGINS", "*")?
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn monitor_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor_stop_timeout_secs)
    }

    pub fn notifier_send_timeout(&self) -> Duration {
        Duration::from_millis(self.notifier_send_timeout_ms)
    }

    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == "*")
    }
}

/// Unset means `None`; only a non-unicode value is an error
fn optional_var(key: &str) -> Result<Option<String>, env::VarError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e),
    }
}

fn var_or(key: &str, default: &str) -> Result<String, env::VarError> {
    Ok(optional_var(key)?.unwrap_or_else(|| default.to_string()))
}

/// Unset or unparsable values fall back to the default
fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, env::VarError> {
    Ok(optional_var(key)?
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default))
}
