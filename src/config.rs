use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ListenAddr {
    /// `host:port`
    Tcp(String),
    /// Filesystem socket, written as `unix:/path` or a bare absolute path.
    Unix(PathBuf),
}

impl From<String> for ListenAddr {
    fn from(s: String) -> Self {
        if let Some(path) = s.strip_prefix("unix:") {
            ListenAddr::Unix(PathBuf::from(path))
        } else if s.starts_with('/') {
            ListenAddr::Unix(PathBuf::from(s))
        } else {
            ListenAddr::Tcp(s)
        }
    }
}

impl From<&str> for ListenAddr {
    fn from(s: &str) -> Self {
        ListenAddr::from(s.to_string())
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => f.write_str(addr),
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeepAlive {
    pub enabled: bool,
    /// Idle time allowed between requests on a reused connection.
    pub timeout_secs: u64,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenAddr,
    pub backlog: u32,
    /// Open connections allowed at once; accepting pauses at the limit.
    pub max_connections: usize,
    /// Largest request body accepted, in bytes.
    pub max_content_length: u64,
    /// Bodies larger than this are spooled to a temporary file.
    pub client_body_buffer_size: u64,
    pub keepalive: KeepAlive,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub task_stack_size: usize,
    /// Value of the `Server` response header.
    pub server_name: String,
    pub access_log: bool,
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenAddr::Tcp("127.0.0.1:8000".to_string()),
            backlog: 4096,
            max_connections: 4096,
            max_content_length: 16 * 1024 * 1024,
            client_body_buffer_size: 500 * 1024,
            keepalive: KeepAlive::default(),
            read_timeout_secs: 30,
            write_timeout_secs: 300,
            task_stack_size: 256 * 1024,
            server_name: "hearth".to_string(),
            access_log: true,
            shutdown_grace_secs: 10,
        }
    }
}

impl Config {
    /// Loads the file named by `HEARTH_CONFIG`, if any, then applies the
    /// `LISTEN` override.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os("HEARTH_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Ok(listen) = std::env::var("LISTEN") {
            config.listen = ListenAddr::from(listen);
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        if self.task_stack_size < 16 * 1024 {
            anyhow::bail!("task_stack_size must be at least 16384 bytes");
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive.timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
