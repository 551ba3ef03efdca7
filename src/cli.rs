//! Command-line interface

use std::ffi::OsString;
use std::path::PathBuf;

/// Command-line arguments. Every value is optional and overrides the
/// configuration file when present.
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub port: Option<u16>,
    pub bind: Option<String>,
    /// Alert recipient
    pub mail: Option<String>,
    pub config: Option<PathBuf>,
    pub version: bool,
    pub help: bool,
}

pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => result.help = true,
            Short('V') | Long("version") => result.version = true,
            Short('p') | Long("port") => {
                let value: String = parser.value()?.parse()?;
                result.port = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("port", value))?,
                );
            }
            Short('b') | Long("bind") => {
                let value: String = parser.value()?.parse()?;
                // Empty means all interfaces, which is already the default
                result.bind = Some(value).filter(|v| !v.is_empty());
            }
            Short('m') | Long("mail") => {
                let value: String = parser.value()?.parse()?;
                result.mail = Some(value);
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Value(val) => {
                return Err(ArgsError::UnexpectedArgument(val.to_string_lossy().into()));
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"ssh-honeypot {version}
Low-interaction SSH honeypot with a scripted fake shell

USAGE:
    ssh-honeypot [OPTIONS]

OPTIONS:
    -p, --port <PORT>        Port to bind the SSH server to [default: 22]
    -b, --bind <ADDR>        Address to bind to [default: all interfaces]
    -m, --mail <RECIPIENT>   Where to send new-connection alerts
    -c, --config <FILE>      Configuration file [default: config.toml]
    -h, --help               Print help
    -V, --version            Print version

ENVIRONMENT VARIABLES:
    HONEYPOT__SERVER__PORT   Any config key, `__` separates sections
    RUST_LOG                 Log filter [default: ssh_honeypot=info]
    LOG_FORMAT=gcp           Emit Cloud Logging JSON
"#
    );
}

pub fn print_version() {
    println!("ssh-honeypot {}", env!("CARGO_PKG_VERSION"));
}

#[derive(Debug)]
pub enum ArgsError {
    Lexopt(lexopt::Error),
    InvalidValue(&'static str, String),
    UnexpectedArgument(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::UnexpectedArgument(arg) => write!(f, "unexpected argument: '{}'", arg),
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}
