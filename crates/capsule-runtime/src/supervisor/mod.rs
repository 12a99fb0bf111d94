//! Task supervision
//!
//! A [`Supervisor`] takes a code bundle through the task lifecycle:
//!
//! ```text
//! Submitted -> Confining -> Running -> (Polling <-> TimedOut) -> Terminating -> Released
//! ```
//!
//! Configuration problems are reported synchronously before any thread
//! starts. After that the only engine-level failure is a containment
//! failure: some thread of the task refused to stop. That poisons the
//! supervisor, and every later submission is rejected.

pub mod executor;
mod terminate;

use crate::hooks;
use crate::loader::{CodeBundle, HostClasspath, HostEnvironment, TaskLoader};
use crate::natives::{NativeUnit, Natives};
use crate::params::{Entry, ExecutionParams, ParamsError};
use crate::plugin::{check_native_namespace, FinishInfo, Plugin, PluginError, PluginOutput};
use crate::result::TaskResult;
use crate::rewrite::Rewriter;
use crate::security::audit::{AuditEvent, AuditLogger, NullAuditLogger};
use crate::security::policy::PolicyError;
use crate::task::group::{GroupId, ThreadControl, ThreadGroup};
use crate::task::{ConfinedTask, TaskEvent, TaskLimits, TaskSetup, WorkerOutcome};
use crate::value::{Fault, Value};
use crate::vm::Interpreter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

pub use executor::Executor;

/// Engine-level failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid execution parameters: {0}")]
    Params(#[from] ParamsError),

    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("unit '{name}' was rejected: {reason}")]
    InvalidUnit { name: String, reason: String },

    #[error("bundle '{bundle}' is already executing")]
    BundleBusy { bundle: String },

    #[error("entry point {unit}::{method} does not exist")]
    UnknownEntry { unit: String, method: String },

    #[error("entry point {entry} takes {expected} argument(s), got {got}")]
    EntryArity {
        entry: String,
        expected: u8,
        got: usize,
    },

    #[error("supervisor is poisoned by an earlier containment failure")]
    Poisoned,

    #[error("containment failure: {task} still has {remaining} live thread(s)")]
    Containment { task: GroupId, remaining: usize },

    #[error("failed to start worker thread: {0}")]
    Spawn(String),

    #[error("executor is closed")]
    ExecutorClosed,

    #[error("execution task failed: {0}")]
    Join(String),
}

/// Runs confined tasks
pub struct Supervisor {
    classpath: HostClasspath,
    natives: Natives,
    host: OnceLock<Arc<HostEnvironment>>,
    audit: Arc<dyn AuditLogger>,
    poisoned: Arc<AtomicBool>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        hooks::install();
        Self {
            classpath: HostClasspath::new(),
            natives: Natives::host(),
            host: OnceLock::new(),
            audit: Arc::new(NullAuditLogger::new()),
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Host units reachable by delegation and reloading
    pub fn with_host_classpath(mut self, classpath: HostClasspath) -> Self {
        self.classpath = classpath;
        self
    }

    /// Replace the host native units
    pub fn with_natives(mut self, natives: Natives) -> Self {
        self.natives = natives;
        self
    }

    /// Add one host native unit
    pub fn with_native(mut self, unit: NativeUnit) -> Self {
        self.natives.register(unit);
        self
    }

    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn host(&self) -> Arc<HostEnvironment> {
        self.host
            .get_or_init(|| Arc::new(HostEnvironment::new(self.classpath.clone(), self.natives.clone())))
            .clone()
    }

    /// Run `entry` from `bundle` to completion
    pub fn run(
        &self,
        bundle: &Arc<CodeBundle>,
        entry: Entry,
        params: ExecutionParams,
    ) -> Result<TaskResult, EngineError> {
        self.start(bundle, entry, params)?.wait()
    }

    /// Confine and start `entry`; the returned handle collects the result
    pub fn start(
        &self,
        bundle: &Arc<CodeBundle>,
        entry: Entry,
        params: ExecutionParams,
    ) -> Result<RunningTask, EngineError> {
        let submitted = Instant::now();
        if self.is_poisoned() {
            return Err(EngineError::Poisoned);
        }
        params.validate()?;

        let lease = bundle.occupy().ok_or_else(|| EngineError::BundleBusy {
            bundle: bundle.name().to_string(),
        })?;

        // Plugins: natives, then per-task data
        let mut plugin_natives = Vec::new();
        let mut plugin_data = Vec::new();
        for spec in &params.plugins {
            if let Some(natives) = spec.plugin.natives() {
                check_native_namespace(spec.id(), natives.name())?;
                plugin_natives.push(natives);
            }
            plugin_data.push((spec.id().to_string(), spec.plugin.create_data(&spec.args)?));
        }
        let plugins: Vec<Arc<dyn Plugin>> = params.plugins.iter().map(|s| s.plugin.clone()).collect();

        let rewriter = Arc::new(Rewriter::new(params.policy.clone(), plugins));
        let rewritten = bundle
            .rewritten(&rewriter)
            .map_err(|(name, e)| EngineError::InvalidUnit {
                name,
                reason: e.to_string(),
            })?;

        let entry_unit = rewritten
            .code(&entry.unit)
            .ok_or_else(|| EngineError::UnknownEntry {
                unit: entry.unit.clone(),
                method: entry.method.clone(),
            })?;
        let entry_method = entry_unit
            .unit()
            .method(&entry.method)
            .ok_or_else(|| EngineError::UnknownEntry {
                unit: entry.unit.clone(),
                method: entry.method.clone(),
            })?;
        if entry_method.arity as usize != entry.args.len() {
            return Err(EngineError::EntryArity {
                entry: entry.to_string(),
                expected: entry_method.arity,
                got: entry.args.len(),
            });
        }

        let group = ThreadGroup::new(format!("capsule-{}", bundle.name()));
        let (events, receiver) = mpsc::channel();
        let loader = TaskLoader::new(rewritten, self.host(), plugin_natives, rewriter);
        let task = ConfinedTask::new(TaskSetup {
            entry: entry.to_string(),
            group: group.clone(),
            policy: params.policy.clone(),
            loader,
            limits: TaskLimits {
                wall_timeout: params.wall_timeout,
                cpu_timeout: params.cpu_budget(),
                max_extra_threads: params.max_extra_threads,
                max_output_lines: params.max_output_lines,
                max_io_bytes: params.max_io_bytes,
            },
            input: params.input.clone(),
            plugin_data,
            properties: hooks::property_snapshot(),
            audit: self.audit.clone(),
            events,
        });

        hooks::register(task.clone());
        self.audit.log(AuditEvent::TaskCreated {
            task: task.id().as_u64(),
            entry: entry.to_string(),
        });
        tracing::info!(task = %task.id(), entry = %entry, bundle = bundle.name(), "task confined");

        let worker_task = task.clone();
        let Entry { unit, method, args } = entry;
        let worker_started = Instant::now();
        task.sample_cpu();
        let worker = group
            .spawn("worker", move |control| {
                let mut interpreter = Interpreter::new(worker_task.clone(), control);
                let outcome = WorkerOutcome::from(interpreter.invoke(&unit, &method, args));
                worker_task.notify(TaskEvent::Finished(outcome));
            })
            .map_err(|e| {
                hooks::unregister(task.id());
                group.destroy();
                EngineError::Spawn(e.to_string())
            })?;

        Ok(RunningTask {
            task,
            worker,
            receiver,
            params,
            submitted,
            worker_started,
            audit: self.audit.clone(),
            poisoned: self.poisoned.clone(),
            _lease: lease,
        })
    }
}

/// Adjusts a running task from outside
///
/// Holds the task weakly; every operation is a no-op returning `false`
/// once the task has been released.
#[derive(Clone)]
pub struct TaskControl {
    task: Weak<ConfinedTask>,
}

impl TaskControl {
    fn with<R>(&self, f: impl FnOnce(&ConfinedTask) -> R) -> Option<R> {
        self.task.upgrade().map(|task| f(&task))
    }

    /// Push the wall deadline back by `by`
    ///
    /// A deadline beyond what `Instant` can represent is cleared.
    pub fn extend_wall(&self, by: Duration) -> bool {
        self.with(|task| {
            task.update_deadlines(|d| d.wall = d.wall.and_then(|w| w.checked_add(by)));
        })
        .is_some()
    }

    /// Bring the wall deadline forward by `by`
    pub fn shorten_wall(&self, by: Duration) -> bool {
        self.with(|task| {
            task.update_deadlines(|d| {
                d.wall = d.wall.map(|w| w.checked_sub(by).unwrap_or_else(Instant::now));
            });
        })
        .is_some()
    }

    /// Set the wall deadline to `from_now` from now
    pub fn set_wall(&self, from_now: Duration) -> bool {
        self.with(|task| {
            task.update_deadlines(|d| d.wall = Instant::now().checked_add(from_now));
        })
        .is_some()
    }

    /// Remove the wall deadline
    pub fn clear_wall(&self) -> bool {
        self.with(|task| task.update_deadlines(|d| d.wall = None)).is_some()
    }

    pub fn extend_cpu(&self, by: Duration) -> bool {
        self.with(|task| {
            task.update_deadlines(|d| d.cpu = d.cpu.map(|c| c.saturating_add(by)));
        })
        .is_some()
    }

    pub fn shorten_cpu(&self, by: Duration) -> bool {
        self.with(|task| {
            task.update_deadlines(|d| d.cpu = d.cpu.map(|c| c.saturating_sub(by)));
        })
        .is_some()
    }

    /// Set the total CPU budget
    pub fn set_cpu(&self, budget: Duration) -> bool {
        self.with(|task| task.update_deadlines(|d| d.cpu = Some(budget)))
            .is_some()
    }

    pub fn clear_cpu(&self) -> bool {
        self.with(|task| task.update_deadlines(|d| d.cpu = None)).is_some()
    }

    /// Kill the task; only the first reason is kept
    pub fn kill(&self, reason: impl Into<String>) -> bool {
        self.with(|task| task.kill(reason)).unwrap_or(false)
    }

    pub fn is_alive(&self) -> bool {
        self.task.strong_count() > 0
    }
}

enum Ending {
    Finished(WorkerOutcome),
    TimedOut { cpu: bool },
    Killed,
}

/// A confined task whose worker has started
pub struct RunningTask {
    task: Arc<ConfinedTask>,
    worker: Arc<ThreadControl>,
    receiver: Receiver<TaskEvent>,
    params: ExecutionParams,
    submitted: Instant,
    worker_started: Instant,
    audit: Arc<dyn AuditLogger>,
    poisoned: Arc<AtomicBool>,
    _lease: crate::loader::BundleLease,
}

impl RunningTask {
    pub fn id(&self) -> GroupId {
        self.task.id()
    }

    pub fn control(&self) -> TaskControl {
        TaskControl {
            task: Arc::downgrade(&self.task),
        }
    }

    /// Supervise the task until it is released
    pub fn wait(self) -> Result<TaskResult, EngineError> {
        let ending = self.poll();

        let mut returned = None;
        let mut threw = None;
        let (timed_out, cpu_timed_out) = match ending {
            Ending::Finished(WorkerOutcome::Returned(value)) => {
                returned = Some(value);
                (false, false)
            }
            Ending::Finished(WorkerOutcome::Threw(fault)) => {
                threw = Some(fault);
                (false, false)
            }
            Ending::Finished(WorkerOutcome::Stopped) | Ending::Killed => {
                returned = self.await_late_result();
                (false, false)
            }
            Ending::TimedOut { cpu } => {
                self.audit.log(AuditEvent::TaskTimedOut {
                    task: self.task.id().as_u64(),
                    cpu,
                });
                tracing::info!(task = %self.task.id(), cpu, "task timed out");
                returned = self.await_late_result();
                (true, cpu)
            }
        };
        let execution = self.worker_started.elapsed();

        self.terminate()?;
        Ok(self.release(returned, threw, timed_out, cpu_timed_out, execution))
    }

    /// Polling state: wait for an event, a deadline, or the CPU budget
    fn poll(&self) -> Ending {
        loop {
            let deadlines = self.task.deadlines();
            let now = Instant::now();

            if deadlines.wall.is_some_and(|wall| now >= wall) {
                return Ending::TimedOut { cpu: false };
            }
            if let Some(budget) = deadlines.cpu {
                if self.task.sample_cpu() >= budget {
                    return Ending::TimedOut { cpu: true };
                }
            }

            let remaining = deadlines.wall.map(|wall| wall - now);
            let poll = Some(self.params.poll_interval).filter(|p| !p.is_zero());
            let wait = match (remaining, poll) {
                (Some(r), Some(p)) => Some(r.min(p)),
                (r, p) => r.or(p),
            };

            let event = match wait {
                Some(wait) => self.receiver.recv_timeout(wait),
                None => self.receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match event {
                Ok(TaskEvent::Finished(outcome)) => return Ending::Finished(outcome),
                Ok(TaskEvent::Killed) => return Ending::Killed,
                Ok(TaskEvent::DeadlinesChanged) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Ending::Finished(WorkerOutcome::Stopped)
                }
            }
        }
    }

    /// TimedOut state: interrupt the worker and give it the grace period
    ///
    /// A value returned within the grace period is kept; a fault is not.
    fn await_late_result(&self) -> Option<Value> {
        self.worker.interrupt();
        let deadline = Instant::now().checked_add(self.params.return_grace);
        loop {
            let left = deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
            match self.receiver.recv_timeout(left) {
                Ok(TaskEvent::Finished(WorkerOutcome::Returned(value))) => return Some(value),
                Ok(TaskEvent::Finished(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Terminating state
    fn terminate(&self) -> Result<(), EngineError> {
        let group = self.task.group();

        if self.params.wait_for_shutdown && self.task.kill_reason().is_none() {
            let left = match self.task.deadlines().wall {
                Some(wall) => wall.saturating_duration_since(Instant::now()),
                None => self.params.wall_timeout,
            };
            if !left.is_zero() && group.join_all(left) {
                tracing::debug!(task = %self.task.id(), "group quiesced");
            }
        }

        self.task.begin_shutdown();
        if let Err(remaining) = terminate::escalate(group, &self.params.termination) {
            self.poisoned.store(true, Ordering::SeqCst);
            self.audit.log(AuditEvent::ContainmentFailure {
                task: self.task.id().as_u64(),
                remaining,
            });
            tracing::error!(task = %self.task.id(), remaining, "containment failure");
            return Err(EngineError::Containment {
                task: self.task.id(),
                remaining,
            });
        }
        Ok(())
    }

    /// Released state: tear down and assemble the result
    fn release(
        self,
        returned: Option<Value>,
        threw: Option<Fault>,
        timed_out: bool,
        cpu_timed_out: bool,
        execution: Duration,
    ) -> TaskResult {
        let task = &self.task;
        task.group().destroy();
        hooks::unregister(task.id());
        let cpu_time = task.sample_cpu();

        let (output, input, truncated_output_lines, truncated_input_lines, dropped_io_bytes) = {
            let mut console = task.console();
            console.flush();
            let truncated = console.truncated();
            let input_truncated = console.input_truncated();
            let dropped = console.dropped_bytes();
            let (output, input) = console.take();
            (output, input, truncated, input_truncated, dropped)
        };

        let kill_reason = task.kill_reason();
        let info = FinishInfo {
            task: task.id().as_u64(),
            timed_out,
            killed: kill_reason.is_some(),
            threw: threw.as_ref().map(|f| f.kind.clone()),
            execution,
            cpu_time,
        };
        let plugin_data: Vec<(String, PluginOutput)> = task
            .take_plugin_data()
            .into_iter()
            .filter_map(|(id, mut data)| {
                let spec = self.params.plugins.iter().find(|s| s.id() == id)?;
                spec.plugin.on_finish(&mut *data, &info);
                Some((id, spec.plugin.finalize(data)))
            })
            .collect();

        self.audit.log(AuditEvent::TaskReleased {
            task: task.id().as_u64(),
        });
        tracing::info!(
            task = %task.id(),
            timed_out,
            killed = kill_reason.is_some(),
            threw = ?threw.as_ref().map(|f| f.kind.as_str()),
            execution_ms = execution.as_millis() as u64,
            cpu_ms = cpu_time.as_millis() as u64,
            "task released"
        );

        TaskResult {
            returned,
            threw,
            timed_out,
            cpu_timed_out,
            kill_reason,
            output,
            input,
            truncated_output_lines,
            truncated_input_lines,
            dropped_io_bytes,
            permissions: task.permission_records(),
            submitted_to_completed: self.submitted.elapsed(),
            execution,
            cpu_time,
            started_at: task.started_at(),
            plugin_data,
        }
    }
}
