//! The supervisor: owns the watcher and scheduler lifecycles.
//!
//! Both components run as supervised threads in this process; a dead
//! component is restarted unless it has died too often inside the restart
//! window, in which case a priority notification goes out and the component
//! stays down. Shutdown (SIGTERM/SIGINT) is graceful with a bounded wait,
//! ending in a final stale-lock sweep.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::locks::LockRegistry;
use crate::logging::ComponentLog;
use crate::notify::{self, Priority};
use crate::queue::EventQueue;
use crate::scheduler::Scheduler;
use crate::sessions::SessionStore;
use crate::watcher::Watcher;

/// How often the supervisor checks its children.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
/// A component that dies this many times inside the window stays down.
const MAX_RESTARTS: usize = 5;
/// The restart-counting window.
const RESTART_WINDOW: Duration = Duration::from_secs(300);
/// Grace budget for children on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_termination(_signal: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install SIGTERM/SIGINT handlers that flip the shared shutdown flag.
fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    let handler = SigHandler::Handler(handle_termination);
    unsafe {
        signal(Signal::SIGTERM, handler).context("Failed to install SIGTERM handler")?;
        signal(Signal::SIGINT, handler).context("Failed to install SIGINT handler")?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Component {
    Watcher,
    Scheduler,
}

impl Component {
    fn name(self) -> &'static str {
        match self {
            Component::Watcher => "watcher",
            Component::Scheduler => "scheduler",
        }
    }
}

/// One supervised child thread plus its restart history.
struct Supervised {
    component: Component,
    handle: Option<JoinHandle<()>>,
    deaths: VecDeque<Instant>,
    abandoned: bool,
}

impl Supervised {
    fn new(component: Component) -> Self {
        Self {
            component,
            handle: None,
            deaths: VecDeque::new(),
            abandoned: false,
        }
    }

    /// Count a death and report whether the restart budget is spent.
    fn record_death(&mut self) -> bool {
        let now = Instant::now();
        self.deaths.push_back(now);
        while let Some(&front) = self.deaths.front() {
            if now.duration_since(front) > RESTART_WINDOW {
                self.deaths.pop_front();
            } else {
                break;
            }
        }
        self.deaths.len() > MAX_RESTARTS
    }
}

pub struct Supervisor {
    config: Config,
    log: ComponentLog,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let log = ComponentLog::open(&config.logs_dir(), "supervisor");
        Self {
            config,
            log,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the daemon: bootstrap state, start children, monitor, restart,
    /// and shut down cleanly on a termination signal.
    pub fn run(&mut self) -> Result<()> {
        self.bootstrap()?;
        install_signal_handlers()?;

        let mut children = vec![
            Supervised::new(Component::Watcher),
            Supervised::new(Component::Scheduler),
        ];
        for child in &mut children {
            child.handle = Some(self.spawn(child.component));
        }
        self.log.info("Supervisor started");

        loop {
            if SHUTDOWN.load(Ordering::SeqCst) {
                break;
            }

            for child in &mut children {
                if child.abandoned {
                    continue;
                }
                let finished = child
                    .handle
                    .as_ref()
                    .map(|h| h.is_finished())
                    .unwrap_or(true);
                if !finished {
                    continue;
                }
                if let Some(handle) = child.handle.take() {
                    let _ = handle.join();
                }
                let name = child.component.name();
                if child.record_death() {
                    child.abandoned = true;
                    self.log.error(&format!(
                        "{name} died {MAX_RESTARTS}+ times within the window, leaving it down"
                    ));
                    notify::send(
                        &format!("drover: {name} kept crashing"),
                        &format!("{name} restarted {MAX_RESTARTS} times in 5 minutes and is now down"),
                        Priority::High,
                    );
                    continue;
                }
                self.log.warn(&format!("{name} died, restarting"));
                child.handle = Some(self.spawn(child.component));
            }

            let deadline = Instant::now() + MONITOR_INTERVAL;
            while Instant::now() < deadline && !SHUTDOWN.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(100));
            }
        }

        self.shutdown(children);
        Ok(())
    }

    /// Create state subdirectories and surface what the last run left
    /// behind: unmatched journal STARTs, expired sessions, stale locks.
    fn bootstrap(&self) -> Result<()> {
        for dir in self.config.state_subdirs() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }
        fs::create_dir_all(&self.config.vault_dir).with_context(|| {
            format!(
                "Failed to create vault directory: {}",
                self.config.vault_dir.display()
            )
        })?;

        let audit = crate::audit::AuditJournal::new(
            self.config.journal_file(),
            self.config.audit_dir(),
            self.config.usage_dir(),
        );
        match audit.check_incomplete() {
            Ok(incomplete) if !incomplete.is_empty() => {
                self.log.warn(&format!(
                    "Incomplete invocations from a previous run: {}",
                    incomplete.join(", ")
                ));
            }
            Ok(_) => {}
            Err(e) => self.log.warn(&format!("Journal check failed: {e:#}")),
        }

        let purged = SessionStore::new(self.config.sessions_dir()).purge_expired();
        if purged > 0 {
            self.log.info(&format!("Purged {purged} expired sessions"));
        }

        let reaped = LockRegistry::new(self.config.locks_dir()).reap_stale();
        if reaped > 0 {
            self.log.info(&format!("Reaped {reaped} stale locks at startup"));
        }

        Ok(())
    }

    fn spawn(&self, component: Component) -> JoinHandle<()> {
        let config = self.config.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let name = component.name();

        thread::Builder::new()
            .name(format!("drover-{name}"))
            .spawn(move || {
                let log = ComponentLog::open(&config.logs_dir(), name);
                let result = match component {
                    Component::Watcher => {
                        let queue = EventQueue::new(config.events_file(), config.events_lock());
                        Watcher::new(config, queue, log).run(&shutdown)
                    }
                    Component::Scheduler => Scheduler::new(config, log).run(&shutdown),
                };
                if let Err(e) = result {
                    eprintln!("{name} exited with error: {e:#}");
                }
            })
            .expect("failed to spawn component thread")
    }

    fn shutdown(&self, children: Vec<Supervised>) {
        self.log.info("Shutting down");
        self.shutdown.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        for mut child in children {
            let name = child.component.name();
            let Some(handle) = child.handle.take() else {
                continue;
            };
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                self.log
                    .warn(&format!("{name} did not stop within timeout, abandoning"));
            }
        }

        let reaped = LockRegistry::new(self.config.locks_dir()).reap_stale();
        if reaped > 0 {
            self.log.info(&format!("Final sweep reaped {reaped} locks"));
        }
        self.log.info("Supervisor stopped");
    }
}

/// Timestamp helper for the status command.
pub fn format_instant(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
