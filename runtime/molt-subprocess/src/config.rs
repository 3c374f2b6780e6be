use std::env;
use std::time::Duration;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(5000);

const DEFAULT_COMSPEC: &str = r"C:\Windows\System32\cmd.exe";

/// Settings handed to the worker once, at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Command interpreter used to run `.bat` and `.cmd` files.
    pub comspec: String,
    /// Longest the first wait of a polling session may block.
    pub poll_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            comspec: DEFAULT_COMSPEC.to_string(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by `COMSPEC` and `MOLT_SUBPROCESS_POLL_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(comspec) = lookup("COMSPEC").filter(|val| !val.trim().is_empty()) {
            config.comspec = comspec;
        }
        if let Some(ms) = lookup("MOLT_SUBPROCESS_POLL_TIMEOUT_MS")
            .and_then(|val| val.trim().parse::<u64>().ok())
        {
            config.poll_timeout = Duration::from_millis(ms);
        }
        config
    }
}
