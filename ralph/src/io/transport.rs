//! Agent transports: plain pipes or a pseudo-terminal.
//!
//! Interactive agent CLIs behave more like they do for a human when they see a
//! terminal, so the pty transport is preferred when the platform can open one.
//! Each transport has its own timeout exit-code convention; [`TransportKind::classify`]
//! turns an exit code back into "timed out or not".

use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::TransportChoice;
use crate::io::command::shell_quote;
use crate::io::process::{
    self, OutputSink, PIPE_TIMEOUT_EXIT, SharedSink, ShellOutput, ShellRequest, drain_sink,
    kill_group, pump, register_group, unregister_group,
};

/// Exit code reported when the pty transport kills a child on timeout.
pub const PTY_TIMEOUT_EXIT: i32 = 137;

const PTY_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for trailing pty output after the child exits.
const PTY_DRAIN_GRACE: Duration = Duration::from_secs(2);
const PTY_SIZE: PtySize = PtySize {
    rows: 50,
    cols: 200,
    pixel_width: 0,
    pixel_height: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Pipe,
    Pty,
}

/// Exit classification under a transport's conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    Failed,
    TimedOut,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pipe => "pipe",
            Self::Pty => "pty",
        }
    }

    pub fn timeout_exit_code(self) -> i32 {
        match self {
            Self::Pipe => PIPE_TIMEOUT_EXIT,
            Self::Pty => PTY_TIMEOUT_EXIT,
        }
    }

    pub fn classify(self, exit_code: i32) -> ExitClass {
        if exit_code == 0 {
            ExitClass::Success
        } else if exit_code == self.timeout_exit_code() {
            ExitClass::TimedOut
        } else {
            ExitClass::Failed
        }
    }
}

/// One agent run.
#[derive(Debug, Clone)]
pub struct TransportRequest<'a> {
    pub command: &'a str,
    pub workdir: &'a Path,
    /// File fed to the child's stdin; `None` means no input.
    pub stdin_file: Option<&'a Path>,
    pub timeout: Option<Duration>,
    pub log_path: &'a Path,
    pub echo: bool,
}

pub trait Transport {
    fn kind(&self) -> TransportKind;
    fn run(&self, request: &TransportRequest<'_>) -> Result<ShellOutput>;
}

pub struct PipeTransport;

impl Transport for PipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    fn run(&self, request: &TransportRequest<'_>) -> Result<ShellOutput> {
        let stdin = match request.stdin_file {
            Some(path) => Some(
                std::fs::read(path).with_context(|| format!("read stdin {}", path.display()))?,
            ),
            None => None,
        };
        process::run_shell(&ShellRequest {
            command: request.command,
            workdir: request.workdir,
            stdin,
            timeout: request.timeout,
            log_path: request.log_path,
            append_log: false,
            preamble: Some(preamble(TransportKind::Pipe, request.timeout)),
            echo: request.echo,
            output_limit_bytes: process::DEFAULT_OUTPUT_LIMIT_BYTES,
        })
    }
}

pub struct PtyTransport;

impl Transport for PtyTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pty
    }

    #[instrument(skip_all, fields(timeout_secs = request.timeout.map(|t| t.as_secs())))]
    fn run(&self, request: &TransportRequest<'_>) -> Result<ShellOutput> {
        let sink: SharedSink = Arc::new(Mutex::new(OutputSink::create(
            request.log_path,
            false,
            Some(&preamble(TransportKind::Pty, request.timeout)),
            process::DEFAULT_OUTPUT_LIMIT_BYTES,
            request.echo,
        )?));

        let command = pty_script(request.command, request.stdin_file);

        let pair = native_pty_system()
            .openpty(PTY_SIZE)
            .context("open pty")?;
        let mut builder = CommandBuilder::new("sh");
        builder.arg("-c");
        builder.arg(&command);
        builder.cwd(request.workdir);
        debug!(command = %command, "spawning child in pty");
        let mut child = pair
            .slave
            .spawn_command(builder)
            .with_context(|| format!("spawn sh -c {command} in pty"))?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().context("clone pty reader")?;
        let (done_tx, done_rx) = mpsc::channel();
        let reader_sink = Arc::clone(&sink);
        thread::spawn(move || {
            pump(reader, &reader_sink);
            let _ = done_tx.send(());
        });

        let pid = child.process_id();
        if let Some(pid) = pid {
            register_group(pid);
        }

        let deadline = request.timeout.map(|timeout| Instant::now() + timeout);
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait().context("poll pty child")? {
                break status;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("pty child timed out, killing");
                timed_out = true;
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                let _ = child.kill();
                break child.wait().context("wait pty child after kill")?;
            }
            thread::sleep(PTY_POLL_INTERVAL);
        };
        if let Some(pid) = pid {
            unregister_group(pid);
        }

        drop(pair.master);
        if done_rx.recv_timeout(PTY_DRAIN_GRACE).is_err() {
            warn!("pty output still open after child exit; continuing without it");
        }

        let exit_code = if timed_out {
            PTY_TIMEOUT_EXIT
        } else {
            i32::try_from(status.exit_code()).unwrap_or(1)
        };
        if timed_out {
            let mut guard = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let secs = request.timeout.map(|t| t.as_secs()).unwrap_or_default();
            guard.append_note(&format!("\n[ralph] killed after {secs}s timeout\n"));
        }
        let (output, truncated) = drain_sink(&sink);
        debug!(exit_code, timed_out, "pty command finished");
        Ok(ShellOutput {
            exit_code,
            output,
            truncated,
            timed_out,
        })
    }
}

/// Shell script that gives the whole command line `stdin_file` as stdin.
///
/// The redirect is applied by `exec` before the command runs, so every stage
/// of a pipeline or list reads the file instead of the terminal.
fn pty_script(command: &str, stdin_file: Option<&Path>) -> String {
    let source = match stdin_file {
        Some(path) => shell_quote(&path.to_string_lossy()),
        None => "/dev/null".to_string(),
    };
    format!("exec < {source}\n{command}")
}

/// True when a pseudo-terminal can be opened here.
pub fn pty_available() -> bool {
    match native_pty_system().openpty(PtySize {
        rows: 1,
        cols: 1,
        pixel_width: 0,
        pixel_height: 0,
    }) {
        Ok(_) => true,
        Err(err) => {
            debug!(err = %err, "pty probe failed");
            false
        }
    }
}

/// Pick the transport once for the whole run.
///
/// `auto` prefers the pty when the probe succeeds. An explicit `pty` on a host
/// without one falls back to pipes with a warning.
pub fn select_transport(choice: TransportChoice) -> Box<dyn Transport> {
    let kind = match choice {
        TransportChoice::Pipe => TransportKind::Pipe,
        TransportChoice::Auto => {
            if pty_available() {
                TransportKind::Pty
            } else {
                TransportKind::Pipe
            }
        }
        TransportChoice::Pty => {
            if pty_available() {
                TransportKind::Pty
            } else {
                warn!("pty transport requested but no pty is available; using pipes");
                TransportKind::Pipe
            }
        }
    };
    info!(choice = choice.as_str(), transport = kind.as_str(), "agent transport selected");
    transport_for(kind)
}

pub fn transport_for(kind: TransportKind) -> Box<dyn Transport> {
    match kind {
        TransportKind::Pipe => Box::new(PipeTransport),
        TransportKind::Pty => Box::new(PtyTransport),
    }
}

fn preamble(kind: TransportKind, timeout: Option<Duration>) -> String {
    let mut line = format!("[ralph] transport={}", kind.as_str());
    if let Some(timeout) = timeout {
        line.push_str(&format!(" timeout={}s", timeout.as_secs()));
    }
    line.push('\n');
    line
}
