//! Orchestration for a single loop cycle.
//!
//! One cycle selects an item, builds the prompt, runs the agent, validates,
//! enforces the memory invariant, runs the best-effort commands and decides
//! whether the loop stops. Everything the cycle needs from earlier cycles lives
//! in [`LoopState`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::decision::{CycleDecision, CycleFacts, decide};
use crate::core::failure::condense_failure;
use crate::core::memory::{FallbackContext, MemoryTier, ReasonInputs, choose_reason};
use crate::core::selector::{
    ScopeFilter, all_done, next_item, remaining_count, remaining_items, stabilization_item,
};
use crate::core::text::tail_lines;
use crate::core::types::{MarkerScan, ReasonCode, WorkItem, WorkMode};
use crate::io::agent::{Agent, AgentExit, AgentRequest, read_transcript};
use crate::io::backlog::{Backlog, load_backlog};
use crate::io::config::{LoopConfig, LoopPaths};
use crate::io::git::Git;
use crate::io::hooks::{OptionalHook, run_all};
use crate::io::iteration_log::{
    IterationMeta, IterationPaths, timestamp_now, write_meta, write_text,
};
use crate::io::lock::LoopLock;
use crate::io::memory::MemoryFiles;
use crate::io::prompt::{PromptFiles, PromptInputs, build_prompt, read_optional};
use crate::io::validation::{ValidationRequest, Validator};

/// Lines kept from a red validation for guardrail entries.
const FAILURE_EXCERPT_LINES: usize = 6;

/// State carried from one cycle to the next.
#[derive(Debug, Default)]
pub struct LoopState {
    /// Index of the last cycle started (1-based; 0 before the first).
    pub iteration: u32,
    /// `None` until validation has run once.
    pub last_validation_exit: Option<i32>,
    /// Full output of the last red validation; cleared by a green one.
    pub last_failure_text: String,
    pub last_failure_excerpt: Vec<String>,
    /// Last backlog that loaded cleanly.
    pub backlog: Option<Backlog>,
    pub lock: Option<LoopLock>,
    /// Sum of the cost the agent reported across cycles.
    pub spent_usd: f64,
}

impl LoopState {
    pub fn record_validation(&mut self, exit_code: i32, output: &str) {
        self.last_validation_exit = Some(exit_code);
        if exit_code == 0 {
            self.last_failure_text.clear();
            self.last_failure_excerpt.clear();
        } else {
            self.last_failure_text = output.to_string();
            self.last_failure_excerpt = condense_failure(output, FAILURE_EXCERPT_LINES);
        }
    }

    /// Reload the backlog, falling back to the last good copy when the
    /// document is temporarily broken.
    pub fn reload_backlog(&mut self, path: &Path) -> Result<(Backlog, Option<String>)> {
        match load_backlog(path) {
            Ok(backlog) => {
                self.backlog = Some(backlog.clone());
                Ok((backlog, None))
            }
            Err(err) => match &self.backlog {
                Some(previous) => {
                    let message = format!("backlog unreadable, using last good copy: {err:#}");
                    warn!(err = %format!("{err:#}"), "backlog unreadable, reusing last snapshot");
                    Ok((previous.clone(), Some(message)))
                }
                None => Err(err),
            },
        }
    }
}

/// Run-wide settings shared by every cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleContext<'a> {
    pub config: &'a LoopConfig,
    pub paths: &'a LoopPaths,
    pub run_id: &'a str,
}

/// Operator-facing progress, reported as it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent<'a> {
    PreflightValidation {
        exit_code: i32,
    },
    CycleStarted {
        iteration: u32,
        max_iterations: u32,
        item_id: &'a str,
        work_mode: WorkMode,
    },
    AgentFinished {
        iteration: u32,
        exit_code: i32,
        timed_out: bool,
        aborted: bool,
    },
    ValidationFinished {
        iteration: u32,
        exit_code: i32,
    },
    ValidationSkipped {
        iteration: u32,
    },
    FallbackAppended {
        iteration: u32,
        tier: MemoryTier,
        reason: ReasonCode,
    },
    Warning {
        iteration: u32,
        message: &'a str,
    },
    CycleFinished {
        iteration: u32,
        decision: CycleDecision,
    },
    Sleeping {
        seconds: u64,
    },
    CostBudgetReached {
        spent_usd: f64,
        budget_usd: f64,
    },
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub iteration: u32,
    pub item_id: String,
    pub work_mode: WorkMode,
    pub agent: AgentExit,
    /// `None` when the agent aborted and validation was skipped.
    pub validation_exit: Option<i32>,
    pub scan: MarkerScan,
    pub reason: ReasonCode,
    pub fallback: Vec<MemoryTier>,
    pub decision: CycleDecision,
    /// Cost the agent reported for this cycle, if any.
    pub cost_usd: Option<f64>,
    pub artifacts: IterationPaths,
}

/// Execute one cycle.
///
/// Recoverable failures (agent non-zero or timed out, red validation, failing
/// hooks) are part of the outcome. `Err` means the loop itself cannot go on.
#[instrument(skip_all, fields(iteration = state.iteration + 1))]
pub fn run_cycle<A: Agent, V: Validator>(
    ctx: CycleContext<'_>,
    state: &mut LoopState,
    agent: &A,
    validator: &V,
    on_event: &mut dyn FnMut(&LoopEvent<'_>),
) -> Result<CycleOutcome> {
    let started = Instant::now();
    let started_at = timestamp_now();
    let config = ctx.config;
    let paths = ctx.paths;
    state.iteration += 1;
    let iteration = state.iteration;
    let scope = config.scope();
    let mut warnings: Vec<String> = Vec::new();

    let (backlog, reload_warning) = state.reload_backlog(&paths.prd_file)?;
    warnings.extend(reload_warning);
    let (selected, work_mode) = match next_item(&backlog.items, &scope) {
        Some(item) => (item.clone(), WorkMode::Feature),
        None => (stabilization_item(), WorkMode::Stabilize),
    };
    on_event(&LoopEvent::CycleStarted {
        iteration,
        max_iterations: config.max_iterations,
        item_id: &selected.id,
        work_mode,
    });

    let artifacts = IterationPaths::new(&paths.runtime_dir, ctx.run_id, iteration);
    artifacts.create()?;
    let memory = MemoryFiles::from_paths(paths);
    let pre_hashes = memory.snapshot()?;

    let prompt = render_prompt(ctx, state, &backlog, &scope, &selected, work_mode, &memory)?;
    write_text(&artifacts.prompt_path, &prompt)?;

    let iteration_arg = iteration.to_string();
    let hook_args = [
        ("iteration", iteration_arg.as_str()),
        ("item_id", selected.id.as_str()),
    ];
    if let Some(cmd) = config.pre_iteration_cmd.as_deref() {
        let outcome = OptionalHook::new("pre-iteration", cmd).run(
            &paths.root,
            &hook_args,
            &artifacts.pre_iteration_log_path,
        );
        warnings.extend(outcome.warning("pre-iteration command"));
    }

    let agent_request = AgentRequest {
        workdir: &paths.root,
        prompt_path: &artifacts.prompt_path,
        log_path: &artifacts.agent_log_path,
        assistant_path: &artifacts.assistant_path,
        result_path: &artifacts.result_path,
        timeout: (config.agent_timeout_seconds > 0)
            .then(|| Duration::from_secs(config.agent_timeout_seconds)),
    };
    let agent_exit = agent
        .invoke(&agent_request)
        .with_context(|| format!("iteration {iteration}: agent invocation"))?;
    let transcript = read_transcript(&agent_request, config.agent_output_mode)?;
    if let Some(cost) = transcript.usage.cost_usd {
        state.spent_usd += cost;
        debug!(cost_usd = cost, spent_usd = state.spent_usd, "agent reported cost");
    }
    let aborted = config
        .markers
        .is_aborted(&transcript, config.agent_output_mode);
    on_event(&LoopEvent::AgentFinished {
        iteration,
        exit_code: agent_exit.exit_code,
        timed_out: agent_exit.timed_out,
        aborted,
    });
    let post_agent = memory.snapshot()?;
    debug!(
        changed = ?pre_hashes.changed(&post_agent),
        "memory files touched by the agent"
    );

    // An abort short-circuits the gate; memory is still enforced below.
    let validation_exit = if aborted {
        on_event(&LoopEvent::ValidationSkipped { iteration });
        None
    } else {
        let result = validator
            .validate(&ValidationRequest {
                workdir: &paths.root,
                log_path: &artifacts.validate_log_path,
            })
            .with_context(|| format!("iteration {iteration}: validation"))?;
        state.record_validation(result.exit_code, &result.output);
        on_event(&LoopEvent::ValidationFinished {
            iteration,
            exit_code: result.exit_code,
        });
        Some(result.exit_code)
    };
    let scan = config
        .markers
        .classify(&transcript, config.agent_output_mode);

    let reason = choose_reason(ReasonInputs {
        timed_out: agent_exit.timed_out,
        aborted,
        validation_exit,
        work_mode,
    });
    let timestamp = timestamp_now();
    let artifact_dir = artifacts.dir.display().to_string();
    let excerpt: &[String] = if validation_exit.is_some_and(|code| code != 0) {
        &state.last_failure_excerpt
    } else {
        &[]
    };
    let fallback = memory.enforce(
        &pre_hashes,
        &FallbackContext {
            timestamp: &timestamp,
            iteration,
            item_id: &selected.id,
            item_title: &selected.title,
            work_mode,
            agent_exit: agent_exit.exit_code,
            validation_exit,
            reason,
            validation_cmd: config.validate_cmd.as_deref(),
            failure_excerpt: excerpt,
            artifact_dir: &artifact_dir,
        },
    )?;
    for tier in &fallback {
        on_event(&LoopEvent::FallbackAppended {
            iteration,
            tier: *tier,
            reason,
        });
    }

    let validation_code = validation_exit.unwrap_or(0);
    let mut compact_exit_code = None;
    if config.compact_mode.should_run(validation_code, aborted)
        && let Some(cmd) = config.compact_cmd.as_deref()
    {
        let outcome = OptionalHook::new("compact", cmd).run(
            &paths.root,
            &hook_args,
            &artifacts.compact_log_path,
        );
        compact_exit_code = outcome.exit_code();
        warnings.extend(outcome.warning("compaction"));
    }
    let hooks: Vec<OptionalHook> = config.hooks.iter().map(OptionalHook::from_config).collect();
    for (name, outcome) in run_all(&hooks, &paths.root, &hook_args, &artifacts.hooks_log_path) {
        warnings.extend(outcome.warning(&format!("hook {name}")));
    }

    // The agent may have marked items done; judge against the current document.
    let (backlog_after, reload_warning) = state.reload_backlog(&paths.prd_file)?;
    warnings.extend(reload_warning);
    let decision = decide(CycleFacts {
        aborted,
        completed: scan.completed,
        backlog_done: all_done(&backlog_after.items, &scope),
        validation_green: validation_exit == Some(0),
    });

    for message in &warnings {
        on_event(&LoopEvent::Warning {
            iteration,
            message,
        });
    }

    write_meta(
        &artifacts,
        &IterationMeta {
            run_id: ctx.run_id.to_string(),
            iteration,
            item_id: selected.id.clone(),
            work_mode,
            transport: Some(agent_exit.transport),
            agent_exit_code: Some(agent_exit.exit_code),
            timed_out: agent_exit.timed_out,
            validation_exit_code: validation_exit,
            aborted,
            completed: scan.completed,
            fallback: fallback.iter().map(|tier| (*tier, reason)).collect::<BTreeMap<_, _>>(),
            compact_exit_code,
            decision: Some(decision),
            token_usage: transcript.usage.tokens,
            token_model: transcript.usage.model.clone(),
            cost_usd: transcript.usage.cost_usd,
            started_at,
            ended_at: timestamp_now(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        },
    )?;
    on_event(&LoopEvent::CycleFinished {
        iteration,
        decision,
    });

    Ok(CycleOutcome {
        iteration,
        item_id: selected.id,
        work_mode,
        agent: agent_exit,
        validation_exit,
        scan,
        reason,
        fallback,
        decision,
        cost_usd: transcript.usage.cost_usd,
        artifacts,
    })
}

fn render_prompt(
    ctx: CycleContext<'_>,
    state: &LoopState,
    backlog: &Backlog,
    scope: &ScopeFilter,
    selected: &WorkItem,
    work_mode: WorkMode,
    memory: &MemoryFiles,
) -> Result<String> {
    let config = ctx.config;
    let paths = ctx.paths;
    let template = read_optional(&paths.prompt_template)?.with_context(|| {
        format!("prompt template missing: {}", paths.prompt_template.display())
    })?;
    let progress = read_optional(&paths.progress_file)?.unwrap_or_default();
    let progress_tail = tail_lines(&progress, config.progress_tail_lines);
    let tails = memory.tails(config.memory_tail_lines)?;
    let rules = read_optional(&paths.rules)?;
    let commits =
        Git::new(&paths.root).commits_matching(&config.commit_tag, config.commit_feed_count);

    let in_scope: Vec<&WorkItem> = backlog
        .items
        .iter()
        .filter(|item| scope.contains(&item.id))
        .collect();
    let remaining: Vec<&WorkItem> = if work_mode == WorkMode::Feature {
        remaining_items(&backlog.items, scope)
            .into_iter()
            .take(config.prompt_prd_top_n)
            .collect()
    } else {
        Vec::new()
    };

    let display = |path: &Path| -> String {
        path.strip_prefix(&paths.root)
            .unwrap_or(path)
            .display()
            .to_string()
    };
    let prd_file = display(&paths.prd_file);
    let progress_file = display(&paths.progress_file);
    let guardrails_file = display(memory.path(MemoryTier::Guardrails));
    let style_file = display(memory.path(MemoryTier::Style));
    let recent_file = display(memory.path(MemoryTier::Recent));

    build_prompt(&PromptInputs {
        template: &template,
        run_id: ctx.run_id,
        iteration: state.iteration,
        max_iterations: config.max_iterations,
        work_mode,
        project: backlog.project.as_deref(),
        backlog: &in_scope,
        selected,
        remaining: &remaining,
        remaining_count: remaining_count(&backlog.items, scope),
        progress_tail: &progress_tail,
        progress_tail_lines: config.progress_tail_lines,
        memory: &tails,
        rules: rules.as_deref(),
        commits: &commits,
        commit_tag: &config.commit_tag,
        validation_cmd: config.validate_cmd.as_deref(),
        last_failure: &state.last_failure_text,
        markers: &config.markers,
        files: PromptFiles {
            prd_file: &prd_file,
            progress_file: &progress_file,
            guardrails_file: &guardrails_file,
            style_file: &style_file,
            recent_file: &recent_file,
        },
    })
}
