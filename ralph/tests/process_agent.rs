//! Agent invocation against real `sh` children.
//!
//! Covers timeout classification, prompt delivery on stdin versus the
//! `{prompt_file}` placeholder, and stream-json extraction, under both the
//! pipe and the pseudo-terminal transports.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use ralph::core::markers::Markers;
use ralph::core::memory::MemoryTier;
use ralph::core::types::{OutputMode, ReasonCode};
use ralph::cycle::LoopEvent;
use ralph::io::agent::{Agent, AgentRequest, CommandAgent, read_transcript};
use ralph::io::command::ExternalCommand;
use ralph::io::config::LoopConfig;
use ralph::io::transport::{PipeTransport, PtyTransport, TransportKind, pty_available};
use ralph::io::validation::CommandValidator;
use ralph::looping::{LoopStop, run_loop};
use ralph::test_support::TestWorkspace;

struct Files {
    temp: tempfile::TempDir,
    prompt: PathBuf,
    log: PathBuf,
    assistant: PathBuf,
    result: PathBuf,
}

impl Files {
    fn new(prompt: &str) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().to_path_buf();
        let files = Self {
            prompt: dir.join("prompt.md"),
            log: dir.join("agent.log"),
            assistant: dir.join("agent.assistant.txt"),
            result: dir.join("agent.result.txt"),
            temp,
        };
        fs::write(&files.prompt, prompt).expect("write prompt");
        files
    }

    fn request(&self, timeout: Option<Duration>) -> AgentRequest<'_> {
        AgentRequest {
            workdir: self.temp.path(),
            prompt_path: &self.prompt,
            log_path: &self.log,
            assistant_path: &self.assistant,
            result_path: &self.result,
            timeout,
        }
    }

    fn log(&self) -> String {
        fs::read_to_string(&self.log).expect("read log")
    }
}

fn pipe_agent(command: &str) -> CommandAgent {
    CommandAgent::new(ExternalCommand::new(command), Box::new(PipeTransport), false)
}

fn pty_agent(command: &str) -> CommandAgent {
    CommandAgent::new(ExternalCommand::new(command), Box::new(PtyTransport), false)
}

#[test]
fn prompt_goes_to_stdin_without_placeholder() {
    let files = Files::new("hello from the prompt\n");
    let exit = pipe_agent("cat")
        .invoke(&files.request(None))
        .expect("invoke");
    assert_eq!(exit.exit_code, 0);
    assert!(!exit.timed_out);
    assert_eq!(exit.transport, TransportKind::Pipe);
    assert!(files.log().ends_with("hello from the prompt\n"));
}

#[test]
fn placeholder_receives_prompt_path() {
    let files = Files::new("read me by path\n");
    let exit = pipe_agent("cat {prompt_file}; exit 3")
        .invoke(&files.request(None))
        .expect("invoke");
    assert_eq!(exit.exit_code, 3);
    assert!(!exit.timed_out);
    assert!(files.log().contains("read me by path"));
}

#[test]
fn slow_agent_is_killed_and_classified_as_timeout() {
    let files = Files::new("prompt\n");
    let started = Instant::now();
    let exit = pipe_agent("echo started; sleep 30")
        .invoke(&files.request(Some(Duration::from_secs(2))))
        .expect("invoke");
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(exit.timed_out);
    assert_eq!(exit.exit_code, TransportKind::Pipe.timeout_exit_code());
    assert!(files.log().contains("started"));
}

/// Exit 124 from the agent itself counts as a timeout only when a timeout is set.
#[test]
fn conventional_timeout_code_needs_a_configured_timeout() {
    let files = Files::new("prompt\n");
    let exit = pipe_agent("exit 124")
        .invoke(&files.request(None))
        .expect("invoke");
    assert_eq!(exit.exit_code, 124);
    assert!(!exit.timed_out);
}

#[test]
fn stream_json_result_is_extracted() {
    let files = Files::new("prompt\n");
    let script = concat!(
        "echo booting; ",
        r#"echo '{"type":"system","subtype":"init"}'; "#,
        "echo 'not json {'; ",
        r#"echo '{"type":"result","result":"<promise>ABORT</promise>"}'"#,
    );
    pipe_agent(script)
        .invoke(&files.request(None))
        .expect("invoke");

    let transcript =
        read_transcript(&files.request(None), OutputMode::StreamJson).expect("transcript");

    assert_eq!(transcript.final_result, "<promise>ABORT</promise>");
    assert_eq!(
        fs::read_to_string(&files.result).expect("result"),
        "<promise>ABORT</promise>"
    );
    assert_eq!(fs::read_to_string(&files.assistant).expect("assistant"), "");
}

/// A real sleeping agent past a 2 second timeout leaves an `agent_timeout` guardrail.
#[test]
fn loop_records_agent_timeout_in_guardrails() {
    let ws = TestWorkspace::new(r#"{"items":[{"id":"A","passes":false}]}"#);
    let config = LoopConfig {
        max_iterations: 1,
        agent_timeout_seconds: 2,
        ..ws.config()
    };
    let agent = pipe_agent("sleep 30");
    let validator = CommandValidator::new(Some("true".to_string()));
    let mut timeout_fallback = false;

    let outcome = run_loop(ws.root(), &config, &agent, &validator, |event| {
        if let LoopEvent::FallbackAppended {
            tier: MemoryTier::Guardrails,
            reason: ReasonCode::AgentTimeout,
            ..
        } = event
        {
            timeout_fallback = true;
        }
    })
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::MaxIterationsReached);
    assert!(timeout_fallback);
    assert!(
        ws.read(".agent/GUARDRAILS.md")
            .contains("- Reason: agent_timeout")
    );
}

#[test]
fn pty_slow_agent_is_killed_with_the_pty_timeout_code() {
    if !pty_available() {
        return;
    }
    let files = Files::new("prompt\n");
    let started = Instant::now();
    let exit = pty_agent("echo started; sleep 30")
        .invoke(&files.request(Some(Duration::from_secs(2))))
        .expect("invoke");
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(exit.timed_out);
    assert_eq!(exit.transport, TransportKind::Pty);
    assert_eq!(exit.exit_code, 137);
    assert!(files.log().contains("started"));
}

/// Every stage of a pipeline reads the prompt, not the terminal.
#[test]
fn pty_pipeline_agent_reads_the_prompt() {
    if !pty_available() {
        return;
    }
    let files = Files::new("hello prompt\n");
    let started = Instant::now();
    let exit = pty_agent("cat | tr a-z A-Z")
        .invoke(&files.request(Some(Duration::from_secs(10))))
        .expect("invoke");
    assert!(!exit.timed_out);
    assert_eq!(exit.exit_code, 0);
    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(files.log().contains("HELLO PROMPT"));
}

/// Terminal output (`\r\n` line endings) still matches a whole-line marker.
#[test]
fn pty_completion_marker_line_is_recognised() {
    if !pty_available() {
        return;
    }
    let files = Files::new("prompt\n");
    let exit = pty_agent("echo working; echo '<promise>COMPLETE</promise>'")
        .invoke(&files.request(Some(Duration::from_secs(10))))
        .expect("invoke");
    assert_eq!(exit.exit_code, 0);

    let transcript = read_transcript(&files.request(None), OutputMode::Plain).expect("transcript");
    assert!(transcript.raw_log.contains("<promise>COMPLETE</promise>"));
    let scan = Markers::default().classify(&transcript, OutputMode::Plain);
    assert!(scan.completed);
    assert!(!scan.aborted);
}
