//! remote-exec binary entry point.

use std::io::Write;
use std::process::ExitCode;

use remote_exec::cli::{self, Action};
use remote_exec::config::Config;
use remote_exec::execution::CommandInvocation;
use remote_exec::transfer::TransferOptions;
use remote_exec::transport::SshConnection;
use remote_exec::{logging, AsyncSession, RemoteExecError, Session};
use tracing::{debug, info};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("remote-exec: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<i32, BoxError> {
    let args = cli::parse_args()?;
    if args.help {
        cli::print_help();
        return Ok(0);
    }
    if args.version {
        cli::print_version();
        return Ok(0);
    }
    let Some(action) = args.action.clone() else {
        cli::print_help();
        return Ok(2);
    };

    let config = Config::load(&args)?;
    logging::try_init_with(config.log_filter()).ok();
    info!("remote-exec v{}", env!("CARGO_PKG_VERSION"));

    let session_config = config.to_session_config()?;
    let ssh_config = config.to_ssh_config()?;
    debug!(host = %ssh_config.host, port = ssh_config.port, "connecting");

    let connection = tokio::task::spawn_blocking(move || SshConnection::connect(&ssh_config))
        .await
        .map_err(|e| RemoteExecError::TaskFailed(e.to_string()))??;
    let session = AsyncSession::new(
        Session::new(connection, session_config)?.with_escalation(config.escalation()),
    );

    let options = TransferOptions::default()
        .preserve_mode(!args.no_preserve_mode)
        .use_privilege_escalation(args.sudo);

    let code = match action {
        Action::Run { command } => {
            let result = session.execute(CommandInvocation::new(command)).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(result.stdout().as_bytes())?;
            stdout.flush()?;
            let mut stderr = std::io::stderr().lock();
            stderr.write_all(result.stderr().as_bytes())?;
            result.exit_code()
        }
        Action::Put { local, remote } => {
            session.put(local, remote, options).await?;
            0
        }
        Action::Get { remote, local } => {
            session.get(remote, local, options).await?;
            0
        }
    };

    session.close().await?;
    Ok(code)
}
