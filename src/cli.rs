//! Command-line interface for remote-exec.
//!
//! Uses lexopt for minimal binary size overhead.

use std::ffi::OsString;
use std::path::PathBuf;

/// What the binary should do.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Run a command and mirror its output and exit code.
    Run { command: String },
    /// Upload a local file.
    Put { local: PathBuf, remote: String },
    /// Download a remote file.
    Get { remote: String, local: PathBuf },
}

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Remote host.
    pub host: Option<String>,
    /// Remote port.
    pub port: Option<u16>,
    /// Login name.
    pub user: Option<String>,
    /// Private key file.
    pub identity: Option<PathBuf>,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Duration cap for `run`, in seconds.
    pub duration: Option<f64>,
    /// Allow elevated fallbacks for transfers.
    pub sudo: bool,
    /// Skip permission bit preservation for transfers.
    pub no_preserve_mode: bool,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
    /// Subcommand.
    pub action: Option<Action>,
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
///
/// Everything after `run` is the remote command, options included.
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut positional: Vec<String> = Vec::new();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('H') | Long("host") => {
                result.host = Some(parser.value()?.parse()?);
            }
            Short('p') | Long("port") => {
                let value: String = parser.value()?.parse()?;
                result.port = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("port", value))?,
                );
            }
            Short('u') | Long("user") => {
                result.user = Some(parser.value()?.parse()?);
            }
            Short('i') | Long("identity") => {
                result.identity = Some(parser.value()?.parse()?);
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('d') | Long("duration") => {
                let value: String = parser.value()?.parse()?;
                let secs: f64 = value
                    .parse()
                    .map_err(|_| ArgsError::InvalidValue("duration", value.clone()))?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(ArgsError::InvalidValue("duration", value));
                }
                result.duration = Some(secs);
            }
            Short('s') | Long("sudo") => {
                result.sudo = true;
            }
            Long("no-preserve-mode") => {
                result.no_preserve_mode = true;
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Value(val) => {
                let word = val.string()?;
                if positional.is_empty() && word == "run" {
                    let words: Vec<String> = parser
                        .raw_args()?
                        .map(|w| w.to_string_lossy().into_owned())
                        .skip_while(|w| w == "--")
                        .collect();
                    if words.is_empty() {
                        return Err(ArgsError::MissingArgument("run", "COMMAND"));
                    }
                    result.action = Some(Action::Run {
                        command: words.join(" "),
                    });
                    return Ok(result);
                }
                positional.push(word);
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    result.action = parse_action(positional)?;
    Ok(result)
}

fn parse_action(positional: Vec<String>) -> Result<Option<Action>, ArgsError> {
    let mut words = positional.into_iter();
    let Some(name) = words.next() else {
        return Ok(None);
    };
    let first = words.next();
    let second = words.next();
    if let Some(extra) = words.next() {
        return Err(ArgsError::UnexpectedArgument(extra));
    }

    match name.as_str() {
        "put" => {
            let local = first.ok_or(ArgsError::MissingArgument("put", "LOCAL"))?;
            let remote = second.ok_or(ArgsError::MissingArgument("put", "REMOTE"))?;
            Ok(Some(Action::Put {
                local: PathBuf::from(local),
                remote,
            }))
        }
        "get" => {
            let remote = first.ok_or(ArgsError::MissingArgument("get", "REMOTE"))?;
            let local = second.ok_or(ArgsError::MissingArgument("get", "LOCAL"))?;
            Ok(Some(Action::Get {
                remote,
                local: PathBuf::from(local),
            }))
        }
        _ => Err(ArgsError::UnknownCommand(name)),
    }
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"remote-exec {version}
Run commands and transfer files over SSH with a sudo fallback

USAGE:
    remote-exec [OPTIONS] run <COMMAND>...
    remote-exec [OPTIONS] put <LOCAL> <REMOTE>
    remote-exec [OPTIONS] get <REMOTE> <LOCAL>

OPTIONS:
    -H, --host <HOST>       Remote host
    -p, --port <PORT>       Remote port [default: 22]
    -u, --user <USER>       Login name [default: $USER]
    -i, --identity <FILE>   Private key file
    -c, --config <FILE>     Path to configuration file (JSON)
    -d, --duration <SECS>   Terminate the remote command after SECS seconds
    -s, --sudo              Fall back to sudo when a transfer is refused
        --no-preserve-mode  Do not copy permission bits on transfer
    -l, --log-level <LVL>   Log level (error, warn, info, debug, trace)
    -h, --help              Print help
    -V, --version           Print version

ENVIRONMENT VARIABLES:
    REMOTE_EXEC_HOST        Remote host (overrides config)
    REMOTE_EXEC_PORT        Remote port (overrides config)
    REMOTE_EXEC_USER        Login name (overrides config)
    REMOTE_EXEC_PASSWORD    Password (overrides config)
    REMOTE_EXEC_KEY         Private key file (overrides config)
    REMOTE_EXEC_LOG_LEVEL   Log level (overrides config)
    RUST_LOG                Alternative log level setting

EXAMPLES:
    # Run a command, capped at 30 seconds
    remote-exec -H db1 -u deploy -d 30 run df -h

    # Upload into a root-owned directory
    remote-exec -H db1 -s put ./app.conf /etc/app/

    # Download without keeping the remote mode
    remote-exec -H db1 --no-preserve-mode get /var/log/syslog ./syslog
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("remote-exec {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// Unexpected positional argument.
    UnexpectedArgument(String),
    /// A subcommand is missing an operand.
    MissingArgument(&'static str, &'static str),
    /// Unknown subcommand.
    UnknownCommand(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::UnexpectedArgument(arg) => {
                write!(f, "unexpected argument: '{}'", arg)
            }
            Self::MissingArgument(command, operand) => {
                write!(f, "'{}' requires <{}>", command, operand)
            }
            Self::UnknownCommand(name) => {
                write!(f, "unknown command: '{}' (expected run, put or get)", name)
            }
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}
