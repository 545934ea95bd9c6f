//! `ralph`: run a coding agent in a loop against a JSON backlog until the
//! backlog passes and validation is green.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};

use ralph::check::check_from_root;
use ralph::cycle::LoopEvent;
use ralph::exit_codes;
use ralph::io::agent::CommandAgent;
use ralph::io::command::ExternalCommand;
use ralph::io::config::{ConfigOverrides, DEFAULT_CONFIG_PATH, LoopConfig, load_config};
use ralph::io::lock::{LockHeldError, release_registered};
use ralph::io::process::terminate_active_children;
use ralph::io::transport::select_transport;
use ralph::io::validation::CommandValidator;
use ralph::logging;
use ralph::looping::run_loop;
use ralph::select::{SelectOutcome, select_from_root};

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Supervise an autonomous coding agent through a backlog"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run agent iterations until the backlog is done or the budget is spent.
    Run(LoopArgs),
    /// Print the id of the next backlog item to work on.
    Select(LoopArgs),
    /// Check configuration, backlog, scope and prompt template without running anything.
    Check(LoopArgs),
}

/// Flags shared by every subcommand; each overrides the config file.
#[derive(Args, Debug, Default)]
struct LoopArgs {
    /// TOML config file (default: .ralph/config.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Agent command. `{prompt_file}` is replaced by the prompt path, otherwise
    /// the prompt goes to stdin.
    #[arg(long)]
    agent_cmd: Option<String>,
    #[arg(long)]
    validate_cmd: Option<String>,
    /// plain | stream-json
    #[arg(long)]
    agent_output_mode: Option<String>,
    /// auto | pty | pipe
    #[arg(long)]
    agent_transport: Option<String>,
    /// 0 disables the timeout.
    #[arg(long)]
    agent_timeout_seconds: Option<u64>,
    #[arg(long)]
    prd_file: Option<PathBuf>,
    /// Comma-separated backlog ids to restrict the loop to.
    #[arg(long)]
    prd_ids: Option<String>,
    #[arg(long)]
    progress_file: Option<PathBuf>,
    #[arg(long)]
    prompt_template: Option<PathBuf>,
    #[arg(long)]
    max_iterations: Option<u32>,
    #[arg(long)]
    sleep_seconds: Option<u64>,
    #[arg(long)]
    complete_marker: Option<String>,
    #[arg(long)]
    alternate_complete_marker: Option<String>,
    #[arg(long)]
    abort_marker: Option<String>,
    #[arg(long)]
    commit_feed_count: Option<usize>,
    #[arg(long)]
    commit_tag: Option<String>,
    #[arg(long)]
    progress_tail_lines: Option<usize>,
    #[arg(long)]
    memory_tail_lines: Option<usize>,
    #[arg(long)]
    memory_dir: Option<PathBuf>,
    #[arg(long)]
    guardrails_file: Option<PathBuf>,
    #[arg(long)]
    style_file: Option<PathBuf>,
    #[arg(long)]
    recent_file: Option<PathBuf>,
    #[arg(long)]
    rules_file: Option<PathBuf>,
    /// Empty string disables compaction.
    #[arg(long)]
    compact_cmd: Option<String>,
    /// always | on-failure | off
    #[arg(long)]
    compact_mode: Option<String>,
    #[arg(long)]
    pre_iteration_cmd: Option<String>,
    /// Run at exit with `{iteration}`, `{status}` and `{reason}` substituted.
    #[arg(long)]
    notify_cmd: Option<String>,
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
    #[arg(long)]
    lock_file: Option<PathBuf>,
    /// Embed up to N remaining items in the prompt; 0 embeds only the selected item.
    #[arg(long)]
    prompt_prd_top_n: Option<usize>,
    /// Mirror agent output to the console.
    #[arg(long)]
    echo: bool,
    /// Stop once the agent-reported cost (stream-json only) reaches this many dollars.
    #[arg(long)]
    cost_budget_usd: Option<f64>,
}

impl LoopArgs {
    fn overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            agent_cmd: self.agent_cmd,
            validate_cmd: self.validate_cmd,
            agent_output_mode: self.agent_output_mode,
            agent_transport: self.agent_transport,
            agent_timeout_seconds: self.agent_timeout_seconds,
            prd_file: self.prd_file,
            prd_ids: self.prd_ids,
            progress_file: self.progress_file,
            prompt_template: self.prompt_template,
            max_iterations: self.max_iterations,
            sleep_seconds: self.sleep_seconds,
            complete_marker: self.complete_marker,
            alternate_complete_marker: self.alternate_complete_marker,
            abort_marker: self.abort_marker,
            commit_feed_count: self.commit_feed_count,
            commit_tag: self.commit_tag,
            progress_tail_lines: self.progress_tail_lines,
            memory_tail_lines: self.memory_tail_lines,
            memory_dir: self.memory_dir,
            guardrails_file: self.guardrails_file,
            style_file: self.style_file,
            recent_file: self.recent_file,
            rules_file: self.rules_file,
            compact_cmd: self.compact_cmd,
            compact_mode: self.compact_mode,
            pre_iteration_cmd: self.pre_iteration_cmd,
            notify_cmd: self.notify_cmd,
            runtime_dir: self.runtime_dir,
            lock_file: self.lock_file,
            prompt_prd_top_n: self.prompt_prd_top_n,
            echo: self.echo,
            cost_budget_usd: self.cost_budget_usd,
        }
    }

    /// Config file, then flags.
    fn resolve(mut self, root: &Path) -> Result<LoopConfig> {
        let mut config = match self.config.take() {
            Some(path) => load_config(&root.join(path), true)?,
            None => load_config(&root.join(DEFAULT_CONFIG_PATH), false)?,
        };
        config.apply(self.overrides())?;
        Ok(config)
    }
}

fn main() {
    logging::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::OK,
                _ => exit_codes::INVALID,
            };
            let _ = err.print();
            process::exit(code);
        }
    };
    if let Err(err) = ctrlc::set_handler(|| {
        terminate_active_children();
        release_registered();
        process::exit(exit_codes::INTERRUPTED);
    }) {
        eprintln!("warning: cannot install interrupt handler: {err}");
    }
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = std::env::current_dir().context("resolve working directory")?;
    match cli.command {
        Command::Run(args) => cmd_run(&root, args.resolve(&root)?),
        Command::Select(args) => cmd_select(&root, &args.resolve(&root)?),
        Command::Check(args) => cmd_check(&root, &args.resolve(&root)?),
    }
}

fn cmd_run(root: &Path, config: LoopConfig) -> Result<i32> {
    config.validate()?;
    let transport = select_transport(config.agent_transport);
    let agent = CommandAgent::new(
        ExternalCommand::new(config.agent_cmd.clone()),
        transport,
        config.echo,
    );
    println!("[ralph] transport: {}", agent.transport().as_str());
    let validator = CommandValidator::new(config.validate_cmd.clone());
    let outcome = run_loop(root, &config, &agent, &validator, print_event)?;
    println!(
        "[ralph] {} after {} iteration(s) (run {})",
        outcome.stop.as_str(),
        outcome.iterations,
        outcome.run_id
    );
    Ok(outcome.stop.exit_code())
}

fn cmd_select(root: &Path, config: &LoopConfig) -> Result<i32> {
    match select_from_root(root, config)? {
        SelectOutcome::Open(item) => {
            println!("{}", item.id);
            Ok(exit_codes::OK)
        }
        SelectOutcome::Exhausted => {
            eprintln!("no remaining backlog items in scope");
            Ok(exit_codes::EXHAUSTED)
        }
    }
}

fn cmd_check(root: &Path, config: &LoopConfig) -> Result<i32> {
    let report = check_from_root(root, config)?;
    println!(
        "ok: {} item(s), {} remaining{}",
        report.items,
        report.remaining,
        if report.scoped { " in scope" } else { "" }
    );
    for name in &report.unavailable {
        println!("warning: {name} command not found; it will be skipped");
    }
    Ok(exit_codes::OK)
}

fn print_event(event: &LoopEvent<'_>) {
    match event {
        LoopEvent::PreflightValidation { exit_code } => {
            let verdict = if *exit_code == 0 { "green" } else { "red" };
            println!("[ralph] backlog already done; validation {verdict} (exit {exit_code})");
        }
        LoopEvent::CycleStarted {
            iteration,
            max_iterations,
            item_id,
            work_mode,
        } => println!(
            "[ralph] iteration {iteration}/{max_iterations}: {item_id} ({})",
            work_mode.as_str()
        ),
        LoopEvent::AgentFinished {
            iteration,
            exit_code,
            timed_out,
            aborted,
        } => {
            let mut line = format!("[ralph] iteration {iteration}: agent exit {exit_code}");
            if *timed_out {
                line.push_str(" (timed out)");
            }
            if *aborted {
                line.push_str(" (abort marker)");
            }
            println!("{line}");
        }
        LoopEvent::ValidationFinished {
            iteration,
            exit_code,
        } => {
            let verdict = if *exit_code == 0 { "pass" } else { "fail" };
            println!("[ralph] iteration {iteration}: validation {verdict} (exit {exit_code})");
        }
        LoopEvent::ValidationSkipped { iteration } => {
            println!("[ralph] iteration {iteration}: validation skipped after abort");
        }
        LoopEvent::FallbackAppended {
            iteration,
            tier,
            reason,
        } => println!(
            "[ralph] iteration {iteration}: fallback entry for {} ({reason})",
            tier.as_str()
        ),
        LoopEvent::Warning { iteration, message } => {
            eprintln!("[ralph] iteration {iteration}: warning: {message}");
        }
        LoopEvent::CycleFinished {
            iteration,
            decision,
        } => println!("[ralph] iteration {iteration}: {}", decision.as_str()),
        LoopEvent::Sleeping { seconds } => println!("[ralph] sleeping {seconds}s"),
        LoopEvent::CostBudgetReached {
            spent_usd,
            budget_usd,
        } => eprintln!("[ralph] cost budget reached: ${spent_usd:.2} of ${budget_usd:.2}"),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<LockHeldError>().is_some() {
        exit_codes::LOCKED
    } else {
        exit_codes::INVALID
    }
}
