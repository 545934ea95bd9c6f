//! Agent invocation.
//!
//! The [`Agent`] trait decouples the loop from how the agent is started. The
//! real implementation runs the configured command through the transport picked
//! at startup; tests use scripted agents that write canned transcripts.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::markers::AgentTranscript;
use crate::core::stream::demux;
use crate::core::types::OutputMode;
use crate::io::command::{ExternalCommand, PROMPT_FILE_PLACEHOLDER};
use crate::io::transport::{ExitClass, Transport, TransportKind, TransportRequest};

/// Files for one agent run.
#[derive(Debug, Clone)]
pub struct AgentRequest<'a> {
    pub workdir: &'a Path,
    pub prompt_path: &'a Path,
    /// Combined transcript, written whatever the outcome.
    pub log_path: &'a Path,
    pub assistant_path: &'a Path,
    pub result_path: &'a Path,
    pub timeout: Option<Duration>,
}

/// How the agent run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    pub exit_code: i32,
    pub timed_out: bool,
    pub transport: TransportKind,
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Run the agent once. The full transcript must end up at `request.log_path`.
    ///
    /// A non-zero exit is reported in [`AgentExit`]; `Err` is reserved for
    /// failures to start or record the run.
    fn invoke(&self, request: &AgentRequest<'_>) -> Result<AgentExit>;
}

/// Agent that runs a shell command template.
pub struct CommandAgent {
    command: ExternalCommand,
    transport: Box<dyn Transport>,
    echo: bool,
}

impl CommandAgent {
    pub fn new(command: ExternalCommand, transport: Box<dyn Transport>, echo: bool) -> Self {
        Self {
            command,
            transport,
            echo,
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport.kind()
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(transport = self.transport.kind().as_str()))]
    fn invoke(&self, request: &AgentRequest<'_>) -> Result<AgentExit> {
        // With a `{prompt_file}` placeholder the path goes on the command line;
        // otherwise the prompt is piped in.
        let (command, stdin_file) = if self.command.has_placeholder(PROMPT_FILE_PLACEHOLDER) {
            let prompt = request.prompt_path.to_string_lossy();
            let rendered = self
                .command
                .render(&[(PROMPT_FILE_PLACEHOLDER, prompt.as_ref())]);
            (rendered, None)
        } else {
            (self.command.template().to_string(), Some(request.prompt_path))
        };
        info!(command = %command, stdin = stdin_file.is_some(), "invoking agent");

        let output = self
            .transport
            .run(&TransportRequest {
                command: &command,
                workdir: request.workdir,
                stdin_file,
                timeout: request.timeout,
                log_path: request.log_path,
                echo: self.echo,
            })
            .context("run agent")?;

        let kind = self.transport.kind();
        let classified =
            request.timeout.is_some() && kind.classify(output.exit_code) == ExitClass::TimedOut;
        let timed_out = output.timed_out || classified;
        if timed_out {
            warn!(exit_code = output.exit_code, "agent timed out");
        } else if output.exit_code != 0 {
            warn!(exit_code = output.exit_code, "agent exited non-zero");
        }
        Ok(AgentExit {
            exit_code: output.exit_code,
            timed_out,
            transport: kind,
        })
    }
}

/// Read the transcript back from disk.
///
/// In stream-json mode the raw log is split into the assistant-text and
/// final-result artifacts, which are always written (possibly empty).
pub fn read_transcript(request: &AgentRequest<'_>, mode: OutputMode) -> Result<AgentTranscript> {
    let raw_log = match fs::read(request.log_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %request.log_path.display(), "agent log missing");
            String::new()
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read agent log {}", request.log_path.display()));
        }
    };
    if mode != OutputMode::StreamJson {
        return Ok(AgentTranscript {
            raw_log,
            ..AgentTranscript::default()
        });
    }

    let extract = demux(&raw_log);
    fs::write(request.assistant_path, &extract.assistant_text).with_context(|| {
        format!("write assistant text {}", request.assistant_path.display())
    })?;
    fs::write(request.result_path, &extract.final_result)
        .with_context(|| format!("write final result {}", request.result_path.display()))?;
    debug!(
        assistant_bytes = extract.assistant_text.len(),
        result_bytes = extract.final_result.len(),
        "stream transcript extracted"
    );
    Ok(AgentTranscript {
        raw_log,
        assistant_text: extract.assistant_text,
        final_result: extract.final_result,
        usage: extract.usage,
    })
}
