//! Command execution end to end, on real `sh` subprocesses.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing_subscriber::fmt::MakeWriter;

use remote_exec::execution::{CommandInvocation, TIMEOUT_EXIT_CODE};
use remote_exec::{LocalConnection, RemoteExecError, Session, SessionConfig};

fn session() -> Session {
    Session::new(LocalConnection::new(), SessionConfig::default()).unwrap()
}

/// Shared buffer a scoped subscriber writes into.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn capture_warnings<T>(f: impl FnOnce() -> T) -> (T, String) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(captured.clone())
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    (value, captured.contents())
}

// ============================================================================
// Exit status
// ============================================================================

#[test]
fn test_true_and_false() {
    let session = session();
    assert_eq!(session.run("true").unwrap().exit_code(), 0);
    assert_ne!(session.run("false").unwrap().exit_code(), 0);
}

#[test]
fn test_streams_kept_apart() {
    let result = session().run("echo out; echo err >&2; exit 3").unwrap();
    assert_eq!(result.exit_code(), 3);
    assert_eq!(result.stdout(), "out\n");
    assert_eq!(result.stderr(), "err\n");
}

#[test]
fn test_missing_file_reports_stderr() {
    let result = session().run("ls /definitely/not/here").unwrap();
    assert_ne!(result.exit_code(), 0);
    assert!(result.stdout().is_empty());
    assert!(!result.stderr().is_empty());
}

#[test]
fn test_fast_command_output_not_lost() {
    let session = session();
    for _ in 0..20 {
        assert_eq!(session.run("printf done").unwrap().stdout(), "done");
    }
}

// ============================================================================
// Large output
// ============================================================================

#[test]
fn test_megabytes_of_stdout() {
    let lines = 200_000;
    let result = session()
        .run(&format!(
            "awk 'BEGIN {{ for (i = 0; i < {lines}; i++) print \"line \" i }}'"
        ))
        .unwrap();

    let expected: String = (0..lines).map(|i| format!("line {i}\n")).collect();
    assert!(expected.len() > 1_000_000);
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.stdout().len(), expected.len());
    assert!(result.stdout() == expected);
}

#[test]
fn test_interleaved_large_stdout_and_stderr() {
    let lines = 50_000;
    let result = session()
        .run(&format!(
            "awk 'BEGIN {{ for (i = 0; i < {lines}; i++) {{ print \"o\" i; print \"e\" i > \"/dev/stderr\" }} }}'"
        ))
        .unwrap();

    let out: String = (0..lines).map(|i| format!("o{i}\n")).collect();
    let err: String = (0..lines).map(|i| format!("e{i}\n")).collect();
    assert!(result.stdout() == out);
    assert!(result.stderr() == err);
}

// ============================================================================
// Duration cap
// ============================================================================

#[test]
fn test_duration_cap_yields_timeout_code() {
    let invocation = CommandInvocation::new("sleep 5").duration_secs(0.5).unwrap();
    let result = session().execute(&invocation).unwrap();
    assert_eq!(result.exit_code(), TIMEOUT_EXIT_CODE);
    assert!(result.timed_out());
    assert!(result.duration() < Duration::from_secs(5));
}

#[test]
fn test_session_default_duration() {
    let config = SessionConfig::default().duration_secs(0.3).unwrap();
    let session = Session::new(LocalConnection::new(), config).unwrap();
    assert_eq!(session.run("sleep 3").unwrap().exit_code(), TIMEOUT_EXIT_CODE);
    assert_eq!(session.run("echo quick").unwrap().stdout(), "quick\n");
}

#[test]
fn test_invalid_duration_rejected() {
    for secs in [0.0, -2.0, f64::NAN, f64::INFINITY] {
        assert!(matches!(
            CommandInvocation::new("true").duration_secs(secs),
            Err(RemoteExecError::InvalidArgument(_))
        ));
    }
}

#[test]
fn test_local_deadline_when_duration_not_enforced() {
    // A `timeout` on PATH that ignores its cap.
    let dir = tempfile::tempdir().unwrap();
    let fake = dir.path().join("timeout");
    fs::write(&fake, "#!/bin/sh\nshift\nexec \"$@\"\n").unwrap();
    fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();
    let path = format!(
        "{}:{}",
        dir.path().display(),
        std::env::var("PATH").unwrap_or_default()
    );

    let config = SessionConfig::default().wait_budget(Duration::from_millis(100));
    let session = Session::new(LocalConnection::new(), config).unwrap();
    let invocation = CommandInvocation::new("sleep 5")
        .duration_secs(0.2)
        .unwrap()
        .env("PATH", path);

    let start = Instant::now();
    let result = session.execute(&invocation);
    assert!(matches!(result, Err(RemoteExecError::Timeout(_))));
    assert!(start.elapsed() < Duration::from_secs(5));
}

// ============================================================================
// Environment and decoding
// ============================================================================

#[test]
fn test_lang_injected() {
    let result = session().run("printf %s \"$LANG\"").unwrap();
    assert_eq!(result.stdout(), "en_US.UTF-8");
}

#[test]
fn test_caller_lang_kept() {
    let invocation = CommandInvocation::new("printf %s \"$LANG\"").env("LANG", "C");
    assert_eq!(session().execute(&invocation).unwrap().stdout(), "C");
}

#[test]
fn test_invalid_utf8_substituted() {
    let result = session().run("printf '\\377ok'").unwrap();
    assert_eq!(result.stdout(), "\u{FFFD}ok");
}

// ============================================================================
// Pipe advisory
// ============================================================================

#[test]
fn test_pipe_advisory_logged() {
    let session = session();
    let (result, logs) = capture_warnings(|| session.run("echo abc | wc -c"));
    let result = result.unwrap();
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.stdout().trim(), "4");
    assert!(logs.contains("pipe in command"), "logs: {logs}");
}

#[test]
fn test_no_advisory_without_pipe() {
    let session = session();
    let (result, logs) = capture_warnings(|| session.run("echo a && echo b"));
    assert!(result.unwrap().success());
    assert!(!logs.contains("pipe in command"));
}
