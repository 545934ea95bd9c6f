//! Loop controller for `ralph run`.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::decision::CycleDecision;
use crate::core::failure::{failure_reason, validation_hint};
use crate::core::selector::{STABILIZE_ID, all_done};
use crate::core::types::WorkMode;
use crate::cycle::{CycleContext, LoopEvent, LoopState, run_cycle};
use crate::exit_codes;
use crate::io::agent::Agent;
use crate::io::backlog::{check_scope, load_backlog};
use crate::io::config::{LoopConfig, LoopPaths};
use crate::io::hooks::OptionalHook;
use crate::io::iteration_log::{
    IterationMeta, IterationPaths, new_run_id, timestamp_now, write_meta,
};
use crate::io::lock::LoopLock;
use crate::io::memory::MemoryFiles;
use crate::io::validation::{ValidationRequest, Validator};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// Scoped backlog done and validation green, or a confirmed completion marker.
    Complete,
    /// The agent printed the abort marker.
    Aborted,
    MaxIterationsReached,
    /// Reported agent cost reached the configured budget.
    CostBudgetReached,
}

impl LoopStop {
    /// Value of `{status}` in the exit notification.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Aborted => "aborted",
            Self::MaxIterationsReached => "max_iterations",
            Self::CostBudgetReached => "cost_budget",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Self::Complete => exit_codes::OK,
            Self::Aborted => exit_codes::ABORTED,
            Self::MaxIterationsReached | Self::CostBudgetReached => exit_codes::EXHAUSTED,
        }
    }

    fn from_decision(decision: CycleDecision) -> Option<Self> {
        match decision {
            CycleDecision::Abort => Some(Self::Aborted),
            CycleDecision::BacklogComplete | CycleDecision::MarkerComplete => Some(Self::Complete),
            CycleDecision::SelfFix | CycleDecision::MarkerRejected | CycleDecision::Continue => {
                None
            }
        }
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    /// Cycles executed; 0 when the pre-loop validation was enough.
    pub iterations: u32,
    pub last_decision: Option<CycleDecision>,
    pub stop: LoopStop,
}

/// Run cycles until a stop decision or the iteration budget is spent.
///
/// Configuration problems surface as `ConfigError` and a live lock holder as
/// `LockHeldError`, both before any cycle runs. The lock is released on every
/// return path.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_loop<A: Agent, V: Validator, F: FnMut(&LoopEvent<'_>)>(
    root: &Path,
    config: &LoopConfig,
    agent: &A,
    validator: &V,
    mut on_event: F,
) -> Result<LoopOutcome> {
    config.validate_files(root)?;
    let paths = config.paths(root);
    let scope = config.scope();
    let backlog = load_backlog(&paths.prd_file)?;
    check_scope(&backlog, &scope)?;

    let run_id = new_run_id();
    let lock = LoopLock::acquire(&paths.lock_file, &run_id)?;
    debug!(pid = lock.metadata().pid, host = %lock.metadata().host, "lock acquired");
    let created = MemoryFiles::from_paths(&paths).ensure_headers()?;
    if !created.is_empty() {
        info!(?created, "memory files initialized");
    }
    info!(run_id = %run_id, max_iterations = config.max_iterations, "loop starting");

    let backlog_done = all_done(&backlog.items, &scope);
    let mut state = LoopState {
        backlog: Some(backlog),
        lock: Some(lock),
        ..LoopState::default()
    };

    if backlog_done
        && preflight_validation(&paths, &run_id, &mut state, validator, &mut on_event)?
    {
        let outcome = LoopOutcome {
            run_id,
            iterations: 0,
            last_decision: None,
            stop: LoopStop::Complete,
        };
        notify(config, &paths, &outcome, &state);
        return Ok(outcome);
    }

    let ctx = CycleContext {
        config,
        paths: &paths,
        run_id: &run_id,
    };
    let mut last_decision = None;
    let mut stop = LoopStop::MaxIterationsReached;
    while state.iteration < config.max_iterations {
        let outcome = run_cycle(ctx, &mut state, agent, validator, &mut on_event)?;
        last_decision = Some(outcome.decision);
        if let Some(reached) = LoopStop::from_decision(outcome.decision) {
            stop = reached;
            break;
        }
        if let Some(budget) = config.cost_budget_usd
            && state.spent_usd >= budget
        {
            warn!(spent_usd = state.spent_usd, budget_usd = budget, "cost budget reached");
            on_event(&LoopEvent::CostBudgetReached {
                spent_usd: state.spent_usd,
                budget_usd: budget,
            });
            stop = LoopStop::CostBudgetReached;
            break;
        }
        if state.iteration < config.max_iterations && config.sleep_seconds > 0 {
            on_event(&LoopEvent::Sleeping {
                seconds: config.sleep_seconds,
            });
            thread::sleep(Duration::from_secs(config.sleep_seconds));
        }
    }
    if stop == LoopStop::MaxIterationsReached {
        warn!(
            max_iterations = config.max_iterations,
            "iteration budget exhausted"
        );
    }

    let outcome = LoopOutcome {
        run_id,
        iterations: state.iteration,
        last_decision,
        stop,
    };
    notify(config, &paths, &outcome, &state);
    Ok(outcome)
}

/// Validation run before the first cycle when the scoped backlog is already done.
///
/// Recorded as iteration 0. Returns true when validation is green.
fn preflight_validation<V: Validator>(
    paths: &LoopPaths,
    run_id: &str,
    state: &mut LoopState,
    validator: &V,
    on_event: &mut dyn FnMut(&LoopEvent<'_>),
) -> Result<bool> {
    let started = Instant::now();
    let started_at = timestamp_now();
    let artifacts = IterationPaths::new(&paths.runtime_dir, run_id, 0);
    artifacts.create()?;
    let result = validator.validate(&ValidationRequest {
        workdir: &paths.root,
        log_path: &artifacts.validate_log_path,
    })?;
    state.record_validation(result.exit_code, &result.output);
    on_event(&LoopEvent::PreflightValidation {
        exit_code: result.exit_code,
    });
    write_meta(
        &artifacts,
        &IterationMeta {
            run_id: run_id.to_string(),
            iteration: 0,
            item_id: STABILIZE_ID.to_string(),
            work_mode: WorkMode::Stabilize,
            transport: None,
            agent_exit_code: None,
            timed_out: false,
            validation_exit_code: Some(result.exit_code),
            aborted: false,
            completed: false,
            fallback: Default::default(),
            compact_exit_code: None,
            decision: result.passed().then_some(CycleDecision::BacklogComplete),
            token_usage: None,
            token_model: None,
            cost_usd: None,
            started_at,
            ended_at: timestamp_now(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        },
    )?;
    Ok(result.passed())
}

/// Best-effort exit notification; `{iteration}`, `{status}` and `{reason}` are substituted.
fn notify(config: &LoopConfig, paths: &LoopPaths, outcome: &LoopOutcome, state: &LoopState) {
    let Some(cmd) = config.notify_cmd.as_deref() else {
        return;
    };
    let iteration = outcome.iterations.to_string();
    let reason = failure_reason(&state.last_failure_text)
        .or_else(|| validation_hint(&state.last_failure_text))
        .unwrap_or_default();
    let log_path = paths
        .runtime_dir
        .join("iterations")
        .join(&outcome.run_id)
        .join("notify.log");
    if let Some(parent) = log_path.parent()
        && let Err(err) = std::fs::create_dir_all(parent)
    {
        warn!(err = %err, "cannot create notification log dir");
        return;
    }
    let result = OptionalHook::new("notify", cmd).run(
        &paths.root,
        &[
            ("iteration", iteration.as_str()),
            ("status", outcome.stop.as_str()),
            ("reason", reason.as_str()),
        ],
        &log_path,
    );
    if let Some(message) = result.warning("exit notification") {
        warn!("{message}");
    }
}
