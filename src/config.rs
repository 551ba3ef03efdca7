//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Args;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub transcript: TranscriptConfig,
    pub alert: AlertConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub host_key: PathBuf,
    /// Identification string sent before the handshake
    pub ssh_banner: String,
    /// Max concurrent sessions (0 = unbounded)
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub channel_timeout_secs: u64,
    pub shell_timeout_secs: u64,
    pub max_line_bytes: usize,
}

impl SessionConfig {
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Who gets notified of new connections. Empty disables delivery.
    pub recipient: String,
    pub credentials_file: PathBuf,
}

const DEFAULT_CONFIG_PATH: &str = "config.toml";

impl Config {
    /// Defaults, then the config file, then `HONEYPOT__*` env vars, then CLI flags.
    pub fn load(args: &Args) -> Result<Self> {
        Self::from_sources(args, Some(Self::environment()))
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("HONEYPOT")
            .separator("__")
            .try_parsing(true)
    }

    fn from_sources(args: &Args, environment: Option<config::Environment>) -> Result<Self> {
        let config_path = args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        // An explicitly named file has to exist
        let required = args.config.is_some();

        let mut builder = Self::defaults()?
            .add_source(config::File::from(config_path.as_path()).required(required));
        if let Some(environment) = environment {
            builder = builder.add_source(environment);
        }

        let settings = builder
            .set_override_option("server.host", args.bind.clone())?
            .set_override_option("server.port", args.port.map(i64::from))?
            .set_override_option("alert.recipient", args.mail.clone())?
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 22)?
            .set_default("server.host_key", "keys/host_ed25519.key")?
            .set_default("server.ssh_banner", "SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.1")?
            .set_default("server.max_sessions", 0)?
            .set_default("session.channel_timeout_secs", 20)?
            .set_default("session.shell_timeout_secs", 10)?
            .set_default("session.max_line_bytes", 65536)?
            .set_default("transcript.path", "logs/transcript.log")?
            .set_default("alert.recipient", "")?
            .set_default("alert.credentials_file", "email.json")?)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }
        if !self.server.ssh_banner.starts_with("SSH-2.0-") {
            anyhow::bail!(
                "Invalid ssh_banner '{}': must start with 'SSH-2.0-'",
                self.server.ssh_banner
            );
        }

        if self.session.channel_timeout_secs == 0 || self.session.shell_timeout_secs == 0 {
            anyhow::bail!("Handshake timeouts must be greater than zero");
        }
        if self.session.max_line_bytes == 0 {
            anyhow::bail!("max_line_bytes must be at least 1");
        }

        if self.transcript.path.as_os_str().is_empty() {
            anyhow::bail!("Transcript path cannot be empty");
        }

        Ok(())
    }
}
