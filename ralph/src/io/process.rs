//! Helpers for running shell commands with timeouts and combined output capture.
//!
//! Children run as `sh -c <command>` in their own process group so a timeout
//! (or an operator interrupt) can take down everything they spawned.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Exit code reported when the pipe transport kills a child on timeout.
pub const PIPE_TIMEOUT_EXIT: i32 = 124;

/// Default bound on output kept in memory. The log file always gets everything.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 2_000_000;

static ACTIVE_GROUPS: Mutex<BTreeSet<u32>> = Mutex::new(BTreeSet::new());

/// A shell command to run once.
#[derive(Debug, Clone)]
pub struct ShellRequest<'a> {
    pub command: &'a str,
    pub workdir: &'a Path,
    /// Bytes written to the child's stdin; `None` attaches `/dev/null`.
    pub stdin: Option<Vec<u8>>,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    /// Combined stdout/stderr is written here as it arrives.
    pub log_path: &'a Path,
    /// Append to an existing log instead of truncating it.
    pub append_log: bool,
    /// Written to the log before any child output.
    pub preamble: Option<String>,
    /// Mirror child output to our stdout.
    pub echo: bool,
    pub output_limit_bytes: usize,
}

/// Captured result of a finished child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// Child exit code; `128 + signal` when killed by a signal; the transport's
    /// timeout code when we killed it.
    pub exit_code: i32,
    /// Combined stdout and stderr in arrival order, bounded by the output limit.
    pub output: Vec<u8>,
    pub truncated: usize,
    pub timed_out: bool,
}

impl ShellOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Shared destination for both output streams.
pub(crate) struct OutputSink {
    log: BufWriter<File>,
    collected: Vec<u8>,
    truncated: usize,
    limit: usize,
    echo: bool,
}

impl OutputSink {
    pub(crate) fn create(
        log_path: &Path,
        append: bool,
        preamble: Option<&str>,
        limit: usize,
        echo: bool,
    ) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(log_path)
            .with_context(|| format!("open log {}", log_path.display()))?;
        let mut log = BufWriter::new(file);
        if let Some(preamble) = preamble {
            log.write_all(preamble.as_bytes())
                .and_then(|()| log.flush())
                .with_context(|| format!("write log {}", log_path.display()))?;
        }
        Ok(Self {
            log,
            collected: Vec::new(),
            truncated: 0,
            limit,
            echo,
        })
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        if let Err(err) = self.log.write_all(chunk).and_then(|()| self.log.flush()) {
            warn!(err = %err, "failed to write to log");
        }
        if self.echo {
            let mut stdout = std::io::stdout().lock();
            if let Err(err) = stdout.write_all(chunk).and_then(|()| stdout.flush()) {
                debug!(err = %err, "failed to echo child output");
            }
        }
        let remaining = self.limit.saturating_sub(self.collected.len());
        let keep = chunk.len().min(remaining);
        self.collected.extend_from_slice(&chunk[..keep]);
        self.truncated += chunk.len() - keep;
    }

    pub(crate) fn append_note(&mut self, note: &str) {
        if let Err(err) = self.log.write_all(note.as_bytes()).and_then(|()| self.log.flush()) {
            warn!(err = %err, "failed to write to log");
        }
    }

    fn take_collected(&mut self) -> (Vec<u8>, usize) {
        (
            std::mem::take(&mut self.collected),
            std::mem::take(&mut self.truncated),
        )
    }
}

pub(crate) type SharedSink = Arc<Mutex<OutputSink>>;

/// Copy a reader into the sink until EOF or a read error.
pub(crate) fn pump<R: Read>(mut reader: R, sink: &SharedSink) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => match sink.lock() {
                Ok(mut sink) => sink.push(&chunk[..n]),
                Err(poisoned) => poisoned.into_inner().push(&chunk[..n]),
            },
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            // A pty master reports EIO once the child side closes.
            Err(_) => break,
        }
    }
}

/// Take what the sink has collected so far. Later pushes still reach the log.
pub(crate) fn drain_sink(sink: &SharedSink) -> (Vec<u8>, usize) {
    let mut sink = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    sink.take_collected()
}

/// Run `sh -c <command>` through plain pipes.
///
/// Both output streams are read concurrently into one buffer while the child
/// runs. On timeout the whole process group is killed and the exit code is
/// [`PIPE_TIMEOUT_EXIT`].
#[instrument(
    skip_all,
    fields(timeout_secs = request.timeout.map(|t| t.as_secs()), echo = request.echo)
)]
pub fn run_shell(request: &ShellRequest<'_>) -> Result<ShellOutput> {
    let sink: SharedSink = Arc::new(Mutex::new(OutputSink::create(
        request.log_path,
        request.append_log,
        request.preamble.as_deref(),
        request.output_limit_bytes,
        request.echo,
    )?));

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(request.command)
        .current_dir(request.workdir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if request.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(command = request.command, "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Err(err).with_context(|| format!("spawn sh -c {}", request.command));
        }
    };
    register_group(child.id());

    let result = supervise(&mut child, request, &sink);
    unregister_group(child.id());
    let (status, timed_out) = result?;

    let (output, truncated) = drain_sink(&sink);
    if truncated > 0 {
        warn!(truncated, "output truncated in memory");
    }
    let exit_code = if timed_out {
        PIPE_TIMEOUT_EXIT
    } else {
        exit_code_of(status)
    };
    debug!(exit_code, timed_out, "command finished");
    Ok(ShellOutput {
        exit_code,
        output,
        truncated,
        timed_out,
    })
}

fn supervise(
    child: &mut Child,
    request: &ShellRequest<'_>,
    sink: &SharedSink,
) -> Result<(ExitStatus, bool)> {
    let stdin_handle = match (request.stdin.clone(), child.stdin.take()) {
        (Some(bytes), Some(mut stdin)) => Some(thread::spawn(move || {
            // The child may exit without reading; a broken pipe is not our error.
            let _ = stdin.write_all(&bytes);
        })),
        _ => None,
    };
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let out_sink = Arc::clone(sink);
    let err_sink = Arc::clone(sink);
    let stdout_handle = thread::spawn(move || pump(stdout, &out_sink));
    let stderr_handle = thread::spawn(move || pump(stderr, &err_sink));

    let mut timed_out = false;
    let status = match request.timeout {
        Some(timeout) => match child.wait_timeout(timeout).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
                timed_out = true;
                kill_group(child.id());
                let _ = child.kill();
                child.wait().context("wait command after kill")?
            }
        },
        None => child.wait().context("wait for command")?,
    };

    for handle in [stdout_handle, stderr_handle] {
        handle
            .join()
            .map_err(|_| anyhow!("output reader thread panicked"))?;
    }
    if let Some(handle) = stdin_handle {
        let _ = handle.join();
    }
    if timed_out && let Ok(mut sink) = sink.lock() {
        let secs = request.timeout.map(|t| t.as_secs()).unwrap_or_default();
        sink.append_note(&format!("\n[ralph] killed after {secs}s timeout\n"));
    }
    Ok((status, timed_out))
}

/// Exit code of a finished child, mapping signal deaths to `128 + signal`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

pub(crate) fn register_group(pid: u32) {
    let mut groups = ACTIVE_GROUPS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    groups.insert(pid);
}

pub(crate) fn unregister_group(pid: u32) {
    let mut groups = ACTIVE_GROUPS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    groups.remove(&pid);
}

/// Kill every child process group still running. Used on operator interrupt.
pub fn terminate_active_children() {
    let groups: Vec<u32> = ACTIVE_GROUPS
        .lock()
        .map(|groups| groups.iter().copied().collect())
        .unwrap_or_default();
    for pid in groups {
        kill_group(pid);
    }
}

#[cfg(unix)]
pub(crate) fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, err = %err, "killpg failed");
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request<'a>(command: &'a str, dir: &'a Path, log: &'a Path) -> ShellRequest<'a> {
        ShellRequest {
            command,
            workdir: dir,
            stdin: None,
            timeout: Some(Duration::from_secs(10)),
            log_path: log,
            append_log: false,
            preamble: None,
            echo: false,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    #[test]
    fn captures_combined_output_and_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("out.log");
        let out = run_shell(&request("echo out; echo err >&2; exit 3", temp.path(), &log))
            .expect("run");
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
        let text = out.text();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
        let logged = fs::read_to_string(&log).expect("read log");
        assert!(logged.contains("out\n") && logged.contains("err\n"));
    }

    #[test]
    fn stdin_bytes_reach_the_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("out.log");
        let mut req = request("cat", temp.path(), &log);
        req.stdin = Some(b"hello from stdin\n".to_vec());
        let out = run_shell(&req).expect("run");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.text(), "hello from stdin\n");
    }

    /// Grandchildren are killed with the group, so the readers see EOF.
    #[test]
    fn timeout_kills_the_group_and_reports_124() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("out.log");
        let mut req = request("echo started; sleep 30 & wait", temp.path(), &log);
        req.timeout = Some(Duration::from_secs(1));
        req.preamble = Some("[ralph] transport=pipe\n".to_string());
        let out = run_shell(&req).expect("run");
        assert!(out.timed_out);
        assert_eq!(out.exit_code, PIPE_TIMEOUT_EXIT);
        let logged = fs::read_to_string(&log).expect("read log");
        assert!(logged.starts_with("[ralph] transport=pipe\nstarted\n"));
        assert!(logged.contains("killed after 1s timeout"));
    }

    #[test]
    fn in_memory_output_is_bounded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("out.log");
        let mut req = request("printf 'abcdefghij'", temp.path(), &log);
        req.output_limit_bytes = 4;
        let out = run_shell(&req).expect("run");
        assert_eq!(out.output, b"abcd");
        assert_eq!(out.truncated, 6);
        assert_eq!(fs::read_to_string(&log).expect("log"), "abcdefghij");
    }
}
