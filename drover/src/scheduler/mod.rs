//! The scheduler: drains the event queue, routes invocations, admits them
//! through the lock registry, spawns invoker subprocesses, and processes
//! their lifecycle.
//!
//! The control loop is single-threaded; each spawned invocation gets a
//! monitor thread that waits on the child and folds the result back through
//! the filesystem (journal, audit, locks, continuations, re-queues), so the
//! main loop never blocks on a subprocess.

pub mod failures;
pub mod protocol;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::audit::{AuditJournal, AuditRecord};
use crate::backends::stderr::interpret_reset_token;
use crate::backends::{resolve_complexity, BackendRegistry, Route, TokenState};
use crate::config::Config;
use crate::continuation::ContinuationStore;
use crate::invoker::{stderr_log_file, stderr_excerpt};
use crate::locks::{Acquire, LockRegistry};
use crate::logging::ComponentLog;
use crate::notify::{self, Priority};
use crate::process::terminate_with_grace;
use crate::queue::{EventKind, EventQueue, QueueEvent};
use crate::sessions::SessionStore;
use crate::turn::{self, TurnKind};
use crate::validation::sanitize_for_flat_name;

use failures::FailureSentinels;
use protocol::parse_protocol;

/// Exit code recorded for interrupted invocations.
const INTERRUPT_EXIT_CODE: i32 = 130;
/// Grace period before an invoker is force-killed on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Wait after SIGKILL before the final liveness check.
const STOP_POST_KILL: Duration = Duration::from_secs(1);
/// How much backend stderr lands in audit records.
const EXCERPT_BYTES: usize = 2048;

/// Bookkeeping for one spawned invocation. Whoever removes the entry from
/// the map owns lifecycle cleanup: normally the monitor thread, or the stop
/// handler when it preempts.
#[derive(Debug, Clone)]
struct InFlight {
    backend: String,
    pid: u32,
    input: String,
    output: String,
}

pub struct Scheduler {
    config: Config,
    queue: EventQueue,
    locks: LockRegistry,
    registry: BackendRegistry,
    tokens: TokenState,
    sessions: SessionStore,
    continuations: ContinuationStore,
    failures: FailureSentinels,
    audit: AuditJournal,
    log: Arc<ComponentLog>,
    retry: VecDeque<QueueEvent>,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    monitors: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Reset deadlines already announced, to notify once per exhaustion
    /// window.
    exhaustion_notified: HashMap<String, DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(config: Config, log: ComponentLog) -> Self {
        let queue = EventQueue::new(config.events_file(), config.events_lock());
        let locks = LockRegistry::new(config.locks_dir());
        let registry = BackendRegistry::from_config(&config);
        let tokens = TokenState::new(config.token_state_file());
        let sessions = SessionStore::new(config.sessions_dir());
        let continuations = ContinuationStore::new(config.continuations_dir());
        let failures = FailureSentinels::new(config.failures_dir());
        let audit = AuditJournal::new(
            config.journal_file(),
            config.audit_dir(),
            config.usage_dir(),
        );
        Self {
            config,
            queue,
            locks,
            registry,
            tokens,
            sessions,
            continuations,
            failures,
            audit,
            log: Arc::new(log),
            retry: VecDeque::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            monitors: Arc::new(Mutex::new(Vec::new())),
            exhaustion_notified: HashMap::new(),
        }
    }

    /// Run until `shutdown` flips, then terminate in-flight invokers and
    /// drain the monitor threads.
    pub fn run(&mut self, shutdown: &Arc<AtomicBool>) -> Result<()> {
        self.tokens.init()?;

        while !shutdown.load(Ordering::Relaxed) {
            self.cycle();

            let deadline = Instant::now() + self.config.scheduler_cycle;
            while Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(100));
            }
        }

        self.shutdown_in_flight();
        self.join_monitors(Duration::from_secs(30));
        Ok(())
    }

    /// One scheduler cycle: drain, dispatch, retry, reap.
    pub fn cycle(&mut self) {
        let events = match self.queue.drain() {
            Ok(events) => events,
            Err(e) => {
                self.log.warn(&format!("Queue drain failed: {e:#}"));
                Vec::new()
            }
        };

        for event in events {
            match event.kind {
                EventKind::FileReady => self.handle_file_ready(event),
                EventKind::StopSignal => self.handle_stop(event),
                other => self.log.info(&format!(
                    "Dropping unhandled event kind {other} for '{}'",
                    event.task
                )),
            }
        }

        // Retry queue holds file_ready events that could not be admitted
        // yet (no capable backend, or failure backoff still running).
        let pending = std::mem::take(&mut self.retry);
        for event in pending {
            self.handle_file_ready(event);
        }

        let reaped = self.locks.reap_stale();
        if reaped > 0 {
            self.log.info(&format!("Reaped {reaped} stale locks"));
        }

        self.reap_finished_monitors();
    }

    fn handle_file_ready(&mut self, event: QueueEvent) {
        let task = event.task.clone();
        let input = event.file.clone();
        let task_dir = self.config.vault_dir.join(&task);
        let input_path = task_dir.join(&input);

        if !input_path.is_file() {
            self.log
                .warn(&format!("Input vanished, dropping: {task}/{input}"));
            return;
        }

        let resume = event
            .metadata
            .strip_prefix("continuation:")
            .map(str::to_string);

        let complexity = resolve_complexity(&self.config, &task, &input_path);
        let backend = match self.registry.route(complexity, &self.locks, &self.tokens) {
            Route::To(backend) => backend,
            Route::Queued => {
                self.notify_if_exhausted(complexity);
                self.push_retry(event);
                return;
            }
        };

        if self.locks.check(&backend, &task) {
            self.log
                .info(&format!("Lock held on ({backend}, {task}), skipping {input}"));
            return;
        }
        if self.failures.is_blocking(&task, &input) {
            self.log.info(&format!(
                "Failure backoff active for {task}/{input}, deferring"
            ));
            self.push_retry(event);
            return;
        }

        match self.locks.acquire(&backend, &task, std::process::id()) {
            Ok(Acquire::Ok) => {}
            Ok(Acquire::Busy) => {
                self.log
                    .info(&format!("Lost lock race on ({backend}, {task})"));
                return;
            }
            Err(e) => {
                self.log.warn(&format!("Lock acquire failed: {e:#}"));
                return;
            }
        }

        let output = match turn::next_filename(&input, &task) {
            Ok(output) => output,
            Err(e) => {
                self.log.warn(&format!("Cannot name successor: {e:#}"));
                let _ = self.locks.release(&backend, &task);
                return;
            }
        };

        if self.config.dry_run {
            self.log.info(&format!(
                "DRY-RUN: would invoke {backend} on {task}/{input} -> {output}\
                 {} (complexity {complexity})",
                resume
                    .as_deref()
                    .map(|s| format!(" resuming {s}"))
                    .unwrap_or_default(),
            ));
            let _ = self.locks.release(&backend, &task);
            return;
        }

        let child = match self.spawn_invoker(&backend, &task, &task_dir, &input, &output, complexity, resume.as_deref())
        {
            Ok(child) => child,
            Err(e) => {
                self.log.warn(&format!("Spawn failed for {task}: {e:#}"));
                let _ = self.locks.release(&backend, &task);
                let _ = self.failures.record(&task, &input);
                self.push_retry(event);
                return;
            }
        };
        let pid = child.id();

        // The lock body becomes the worker PID so external observers (and
        // the stop handler) can find the invoker.
        if let Err(e) = self.locks.rewrite(&backend, &task, pid) {
            self.log.warn(&format!("Lock rewrite failed: {e:#}"));
        }
        if let Err(e) =
            self.audit
                .journal_start(&task, &input, &backend, pid, resume.as_deref())
        {
            self.log.warn(&format!("journal_start failed: {e:#}"));
        }

        self.in_flight.lock().unwrap().insert(
            task.clone(),
            InFlight {
                backend: backend.clone(),
                pid,
                input: input.clone(),
                output: output.clone(),
            },
        );
        self.log.info(&format!(
            "Invoking {backend} on {task}/{input} -> {output} (pid {pid})"
        ));

        let ctx = MonitorCtx {
            config: self.config.clone(),
            queue: self.queue.clone(),
            locks: self.locks.clone(),
            tokens: self.tokens.clone(),
            continuations: self.continuations.clone(),
            failures: self.failures.clone(),
            audit: self.audit.clone(),
            log: Arc::clone(&self.log),
            in_flight: Arc::clone(&self.in_flight),
            event,
            backend,
            output,
            pid,
        };
        let handle = std::thread::Builder::new()
            .name(format!("monitor-{task}"))
            .spawn(move || monitor_invocation(ctx, child))
            .expect("failed to spawn monitor thread");
        self.monitors.lock().unwrap().push(handle);
    }

    fn spawn_invoker(
        &self,
        backend: &str,
        task: &str,
        task_dir: &std::path::Path,
        input: &str,
        output: &str,
        complexity: u8,
        resume: Option<&str>,
    ) -> Result<std::process::Child> {
        let backend_cfg = self
            .registry
            .get(backend)
            .with_context(|| format!("Unknown backend: {backend}"))?;
        let invoker = match &backend_cfg.invoker {
            Some(path) => path.clone(),
            None => std::env::current_exe().context("Cannot locate own executable")?,
        };

        let mut command = Command::new(invoker);
        command
            .arg("invoke")
            .arg("--backend")
            .arg(backend)
            .arg("--task")
            .arg(task)
            .arg("--task-dir")
            .arg(task_dir)
            .arg("--input")
            .arg(input)
            .arg("--output")
            .arg(output)
            .env("COMPLEXITY", complexity.to_string())
            .env("DEFAULT_MAX_TURNS", self.config.default_max_turns.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(sid) = resume {
            command.arg("--resume").arg(sid);
        }

        command
            .spawn()
            .with_context(|| format!("Failed to spawn invoker for backend {backend}"))
    }

    /// Stop-signal processing: preempt the in-flight invocation for the
    /// task, rescue partial output, invalidate the session, and audit the
    /// interruption.
    fn handle_stop(&mut self, event: QueueEvent) {
        let task = event.task.clone();
        self.log.info(&format!("Stop signal for '{task}'"));

        // Prefer our own bookkeeping; fall back to scanning lock dirs for
        // an invocation inherited from a previous scheduler run.
        let owned = self.in_flight.lock().unwrap().remove(&task);
        let flight = owned.or_else(|| self.find_lock_holder(&task));

        let Some(flight) = flight else {
            // Nothing running: stop still invalidates the session and ends
            // any continuation chain.
            let _ = self.sessions.invalidate(&task);
            let _ = self.continuations.clear(&task);
            self.log
                .info(&format!("No active invocation for '{task}' on stop"));
            return;
        };

        let outcome = terminate_with_grace(flight.pid, STOP_GRACE, STOP_POST_KILL);
        self.log.info(&format!(
            "Terminated invoker pid {} for '{task}': {outcome:?}",
            flight.pid
        ));

        self.rescue_partial(&task, &flight);

        if let Err(e) = self.sessions.invalidate(&task) {
            self.log.warn(&format!("Session invalidate failed: {e:#}"));
        }
        let _ = self.continuations.clear(&task);

        if let Err(e) = self.audit.journal_end(
            &task,
            &flight.input,
            &flight.backend,
            flight.pid,
            INTERRUPT_EXIT_CODE,
            None,
        ) {
            self.log.warn(&format!("journal_end failed: {e:#}"));
        }
        let record = AuditRecord {
            task: task.clone(),
            file: flight.input.clone(),
            backend: flight.backend.clone(),
            session_id: None,
            turns: None,
            exit_code: INTERRUPT_EXIT_CODE,
            interrupted: true,
            timestamp: Utc::now(),
            stderr_excerpt: stderr_excerpt(
                &stderr_log_file(&self.config, &task, &flight.output),
                EXCERPT_BYTES,
            ),
        };
        if let Err(e) = self.audit.write_record(&record) {
            self.log.warn(&format!("Interrupt record failed: {e:#}"));
        }

        if let Err(e) = self.locks.release(&flight.backend, &task) {
            self.log.warn(&format!("Lock release failed: {e:#}"));
        }

        notify::send(
            &format!("drover: stopped '{task}'"),
            "Conversation interrupted by stop signal",
            Priority::High,
        );
    }

    /// Copy the possibly-partial response into
    /// `<state>/partial/<task>_<file>_<ts>.md`.
    fn rescue_partial(&self, task: &str, flight: &InFlight) {
        let task_dir = self.config.vault_dir.join(task);
        // The invoker writes its output atomically, so a partial response is
        // usually the stop-carrying file itself; prefer the output when it
        // made it to disk.
        let candidate = [&flight.output, &flight.input]
            .into_iter()
            .map(|f| (f, task_dir.join(f)))
            .find(|(_, p)| p.is_file());
        let Some((name, path)) = candidate else {
            return;
        };

        let rescued = self.config.partial_dir().join(format!(
            "{}_{}_{}.md",
            sanitize_for_flat_name(task),
            sanitize_for_flat_name(name),
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        if let Err(e) = fs::create_dir_all(self.config.partial_dir())
            .map_err(anyhow::Error::from)
            .and_then(|()| fs::copy(&path, &rescued).map_err(anyhow::Error::from))
        {
            self.log.warn(&format!("Partial rescue failed: {e:#}"));
        } else {
            self.log
                .info(&format!("Rescued partial response to {}", rescued.display()));
        }
    }

    fn find_lock_holder(&self, task: &str) -> Option<InFlight> {
        for backend in self.registry.list() {
            if let Some(pid) = self.locks.pid_of(backend, task) {
                // Best-effort: input/output unknown for inherited locks.
                let latest = turn::latest_file(&self.config.vault_dir.join(task))
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                return Some(InFlight {
                    backend: backend.to_string(),
                    pid,
                    input: latest.clone(),
                    output: latest,
                });
            }
        }
        None
    }

    /// Priority notification when complexity-3 work is parked behind an
    /// exhausted hosted backend, once per exhaustion window.
    fn notify_if_exhausted(&mut self, complexity: u8) {
        if complexity != 3 {
            return;
        }
        let Some(hosted) = self.registry.hosted() else {
            return;
        };
        let name = hosted.name.clone();
        if !self.tokens.is_exhausted(&name) {
            return;
        }
        let Some(reset_at) = self.tokens.reset_at(&name) else {
            return;
        };
        if self.exhaustion_notified.get(&name) == Some(&reset_at) {
            return;
        }
        self.exhaustion_notified.insert(name.clone(), reset_at);
        notify::send(
            &format!("drover: {name} rate-limited"),
            &format!("Complexity-3 tasks queued until {reset_at}"),
            Priority::High,
        );
    }

    fn push_retry(&mut self, event: QueueEvent) {
        let duplicate = self
            .retry
            .iter()
            .any(|e| e.task == event.task && e.file == event.file);
        if !duplicate {
            self.retry.push_back(event);
        }
    }

    fn reap_finished_monitors(&self) {
        let mut monitors = self.monitors.lock().unwrap();
        let mut remaining = Vec::new();
        for handle in monitors.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                remaining.push(handle);
            }
        }
        *monitors = remaining;
    }

    fn shutdown_in_flight(&self) {
        let flights: Vec<(String, InFlight)> = self
            .in_flight
            .lock()
            .unwrap()
            .iter()
            .map(|(task, flight)| (task.clone(), flight.clone()))
            .collect();
        for (task, flight) in flights {
            self.log
                .info(&format!("Shutdown: terminating invoker for '{task}'"));
            terminate_with_grace(flight.pid, STOP_GRACE, STOP_POST_KILL);
        }
    }

    /// Join monitor threads, abandoning stragglers after `timeout`
    /// (the process is exiting anyway).
    pub fn join_monitors(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            self.reap_finished_monitors();
            let outstanding = self.monitors.lock().unwrap().len();
            if outstanding == 0 {
                return;
            }
            if Instant::now() >= deadline {
                self.log.warn(&format!(
                    "{outstanding} monitor threads did not finish within timeout"
                ));
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[cfg(test)]
    fn queue_handle(&self) -> &EventQueue {
        &self.queue
    }
}

/// Everything a monitor thread needs; all handles are cheap clones that
/// coordinate through the filesystem.
struct MonitorCtx {
    config: Config,
    queue: EventQueue,
    locks: LockRegistry,
    tokens: TokenState,
    continuations: ContinuationStore,
    failures: FailureSentinels,
    audit: AuditJournal,
    log: Arc<ComponentLog>,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    event: QueueEvent,
    backend: String,
    output: String,
    pid: u32,
}

/// Wait on one invoker child and process its lifecycle.
fn monitor_invocation(ctx: MonitorCtx, child: std::process::Child) {
    let task = ctx.event.task.clone();
    let input = ctx.event.file.clone();

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(e) => {
            ctx.log.warn(&format!("Wait failed for '{task}': {e}"));
            ctx.in_flight.lock().unwrap().remove(&task);
            let _ = ctx.locks.release(&ctx.backend, &task);
            return;
        }
    };

    // The stop handler may have taken ownership while we waited; if our
    // entry is gone, cleanup already happened.
    let owned = {
        let mut in_flight = ctx.in_flight.lock().unwrap();
        match in_flight.get(&task) {
            Some(flight) if flight.pid == ctx.pid => in_flight.remove(&task),
            _ => None,
        }
    };
    if owned.is_none() {
        return;
    }

    let exit_code = output.status.code().unwrap_or(INTERRUPT_EXIT_CODE);
    let report = parse_protocol(&String::from_utf8_lossy(&output.stdout));
    let invoker_stderr = String::from_utf8_lossy(&output.stderr);
    if !invoker_stderr.trim().is_empty() {
        ctx.log
            .info(&format!("Invoker stderr for '{task}': {}", invoker_stderr.trim()));
    }

    if let Err(e) = ctx.audit.journal_end(
        &task,
        &input,
        &ctx.backend,
        ctx.pid,
        exit_code,
        report.turns_used,
    ) {
        ctx.log.warn(&format!("journal_end failed: {e:#}"));
    }

    let record = AuditRecord {
        task: task.clone(),
        file: input.clone(),
        backend: ctx.backend.clone(),
        session_id: report.session_id.clone(),
        turns: report.turns_used,
        exit_code,
        interrupted: false,
        timestamp: Utc::now(),
        stderr_excerpt: stderr_excerpt(
            &stderr_log_file(&ctx.config, &task, &ctx.output),
            EXCERPT_BYTES,
        ),
    };
    if let Err(e) = ctx.audit.write_record(&record) {
        ctx.log.warn(&format!("Audit record failed: {e:#}"));
    }

    match exit_code {
        0 => {
            if let Err(e) =
                ctx.audit
                    .update_usage(&ctx.backend, report.turns_used.unwrap_or(0), &task)
            {
                ctx.log.warn(&format!("Usage update failed: {e:#}"));
            }
            let _ = ctx.failures.clear(&task, &input);
            let _ = ctx.locks.release(&ctx.backend, &task);
            notify::send(
                &format!("drover: '{task}' responded"),
                &format!("{} written by {}", ctx.output, ctx.backend),
                Priority::Normal,
            );
            decide_continuation(&ctx, &task, &report);
        }
        10 => {
            let raw = report
                .token_exhausted
                .as_deref()
                .unwrap_or("60")
                .to_string();
            let now = Utc::now();
            let (reset_at, how) = interpret_reset_token(&raw, now);
            ctx.log.info(&format!(
                "Rate limit on {}: token '{raw}' read as {how:?}, reset at {reset_at}",
                ctx.backend
            ));
            if let Err(e) = ctx.tokens.mark_exhausted(&ctx.backend, reset_at) {
                ctx.log.warn(&format!("Token state update failed: {e:#}"));
            }
            let _ = ctx.locks.release(&ctx.backend, &task);
            notify::send(
                &format!("drover: {} rate-limited", ctx.backend),
                &format!("Reset at {reset_at}; work re-queued"),
                Priority::High,
            );
            // Put the event back; routing will hold it until the reset.
            if let Err(e) = ctx.queue.write(
                EventKind::FileReady,
                &task,
                &input,
                &ctx.event.metadata,
            ) {
                ctx.log.warn(&format!("Re-queue after rate limit failed: {e:#}"));
            }
        }
        code => {
            let count = ctx.failures.record(&task, &input).unwrap_or(0);
            let _ = ctx.locks.release(&ctx.backend, &task);
            ctx.log.warn(&format!(
                "Invocation failed for '{task}' (exit {code}, failure #{count})"
            ));
            notify::send(
                &format!("drover: '{task}' failed"),
                &format!("{} exited with {code}", ctx.backend),
                Priority::Normal,
            );
            // Back on the queue; the failure sentinel paces re-admission.
            if let Err(e) =
                ctx.queue
                    .write(EventKind::FileReady, &task, &input, &ctx.event.metadata)
            {
                ctx.log.warn(&format!("Re-queue after failure failed: {e:#}"));
            }
        }
    }
}

/// Max-turn continuation decision, per the response file's state.
fn decide_continuation(ctx: &MonitorCtx, task: &str, report: &protocol::ProtocolReport) {
    let max_turns = ctx.config.default_max_turns;
    if report.turns_used != Some(max_turns) {
        // Conversation ended under budget; any continuation chain is done.
        let _ = ctx.continuations.clear(task);
        return;
    }

    let task_dir = ctx.config.vault_dir.join(task);
    let response = &ctx.output;

    let classified = turn::classify(&task_dir, response);
    let stopped = turn::detect_stop(&task_dir, response).unwrap_or(false);

    match classified {
        Ok(TurnKind::Edited) | Ok(TurnKind::User) => {
            // The user already replied inside the response file: new turn.
            let _ = ctx.continuations.clear(task);
            if let Err(e) = ctx.queue.write(EventKind::FileReady, task, response, "") {
                ctx.log.warn(&format!("Re-queue of edited response failed: {e:#}"));
            }
        }
        _ if stopped => {
            let _ = ctx.continuations.clear(task);
        }
        Ok(TurnKind::Backend) => {
            if !ctx.continuations.should_continue(task) {
                ctx.log.warn(&format!(
                    "Continuation limit reached for '{task}', waiting for the user"
                ));
                let _ = ctx.continuations.clear(task);
                return;
            }
            let Some(session) = report.session_id.clone() else {
                ctx.log.warn(&format!(
                    "Max turns hit for '{task}' but no session id; cannot continue"
                ));
                return;
            };
            match ctx
                .continuations
                .mark(task, &session, max_turns, max_turns, response)
            {
                Ok(record) => {
                    ctx.log.info(&format!(
                        "Continuation {} for '{task}' on session {session}",
                        record.continuation_count
                    ));
                    if let Err(e) = ctx.queue.write(
                        EventKind::FileReady,
                        task,
                        response,
                        &format!("continuation:{session}"),
                    ) {
                        ctx.log.warn(&format!("Continuation re-queue failed: {e:#}"));
                    }
                }
                Err(e) => ctx.log.warn(&format!("Continuation mark failed: {e:#}")),
            }
        }
        Err(e) => {
            ctx.log
                .warn(&format!("Cannot re-classify response for '{task}': {e:#}"));
        }
    }
}
