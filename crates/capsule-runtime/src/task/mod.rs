//! Confined tasks
//!
//! A [`ConfinedTask`] is the live state of one execution: its thread
//! group, captured consoles, permission records, CPU accounting, plugin
//! working data and deadlines. Exactly one task owns a thread group, and a
//! released task is never looked up again.

pub mod console;
pub mod cpu;
pub mod group;

use crate::loader::{LoadError, Resolved, TaskLoader};
use crate::plugin::PluginData;
use crate::result::PermissionRecord;
use crate::security::audit::{AuditEvent, AuditLogger};
use crate::security::permissions::Permission;
use crate::security::policy::PermissionPolicy;
use crate::value::{kinds, Fault, Value};
use crate::vm::monitor::MonitorTable;
use crate::vm::{wake_error, Interpreter, VmError};
use chrono::{DateTime, Utc};
use console::Console;
use group::{GroupId, ThreadControl, ThreadGroup};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const JOIN_SLICE: Duration = Duration::from_millis(5);

/// How the worker's entry call ended
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Returned(Value),
    Threw(Fault),
    Stopped,
}

impl From<Result<Value, VmError>> for WorkerOutcome {
    fn from(result: Result<Value, VmError>) -> Self {
        match result {
            Ok(value) => WorkerOutcome::Returned(value),
            Err(VmError::Thrown(fault)) => WorkerOutcome::Threw(fault),
            Err(VmError::Stopped) => WorkerOutcome::Stopped,
        }
    }
}

/// Messages from a task to its supervisor
#[derive(Debug)]
pub enum TaskEvent {
    Finished(WorkerOutcome),
    Killed,
    DeadlinesChanged,
}

/// Active deadlines; `None` means unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub wall: Option<Instant>,
    pub cpu: Option<Duration>,
}

/// Limits copied from the execution parameters
#[derive(Debug, Clone)]
pub struct TaskLimits {
    pub wall_timeout: Duration,
    pub cpu_timeout: Option<Duration>,
    pub max_extra_threads: usize,
    pub max_output_lines: usize,
    pub max_io_bytes: Option<usize>,
}

/// Everything needed to build a task
pub struct TaskSetup {
    pub entry: String,
    pub group: Arc<ThreadGroup>,
    pub policy: Arc<PermissionPolicy>,
    pub loader: TaskLoader,
    pub limits: TaskLimits,
    pub input: Option<String>,
    pub plugin_data: Vec<(String, PluginData)>,
    pub properties: BTreeMap<String, String>,
    pub audit: Arc<dyn AuditLogger>,
    pub events: Sender<TaskEvent>,
}

struct ExtraThread {
    control: Arc<ThreadControl>,
    result: Arc<Mutex<Option<Value>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ConfinedTask {
    group: Arc<ThreadGroup>,
    entry: String,
    started_at: DateTime<Utc>,
    started: Instant,
    cpu_nanos: AtomicU64,
    console: Mutex<Console>,
    permissions: Mutex<BTreeMap<(Permission, bool), u64>>,
    max_extra_threads: usize,
    extra_created: AtomicUsize,
    extras: Mutex<HashMap<u64, ExtraThread>>,
    shutting_down: AtomicBool,
    kill_reason: Mutex<Option<String>>,
    plugin_data: Vec<(String, Mutex<Option<PluginData>>)>,
    policy: Arc<PermissionPolicy>,
    loader: TaskLoader,
    properties: Mutex<BTreeMap<String, String>>,
    monitors: MonitorTable,
    deadlines: Mutex<Deadlines>,
    events: Mutex<Sender<TaskEvent>>,
    audit: Arc<dyn AuditLogger>,
}

impl ConfinedTask {
    pub fn new(setup: TaskSetup) -> Arc<Self> {
        let started = Instant::now();
        let mut console = Console::new(setup.limits.max_output_lines, setup.limits.max_io_bytes);
        if let Some(input) = &setup.input {
            console = console.with_input(input);
        }

        Arc::new(Self {
            group: setup.group,
            entry: setup.entry,
            started_at: Utc::now(),
            started,
            cpu_nanos: AtomicU64::new(0),
            console: Mutex::new(console),
            permissions: Mutex::new(BTreeMap::new()),
            max_extra_threads: setup.limits.max_extra_threads,
            extra_created: AtomicUsize::new(0),
            extras: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            kill_reason: Mutex::new(None),
            plugin_data: setup
                .plugin_data
                .into_iter()
                .map(|(id, data)| (id, Mutex::new(Some(data))))
                .collect(),
            policy: setup.policy,
            loader: setup.loader,
            properties: Mutex::new(setup.properties),
            monitors: MonitorTable::new(),
            deadlines: Mutex::new(Deadlines {
                wall: started.checked_add(setup.limits.wall_timeout),
                cpu: setup.limits.cpu_timeout,
            }),
            events: Mutex::new(setup.events),
            audit: setup.audit,
        })
    }

    pub fn id(&self) -> GroupId {
        self.group.id()
    }

    pub fn group(&self) -> &Arc<ThreadGroup> {
        &self.group
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn policy(&self) -> &Arc<PermissionPolicy> {
        &self.policy
    }

    pub fn audit(&self) -> &Arc<dyn AuditLogger> {
        &self.audit
    }

    pub fn console(&self) -> MutexGuard<'_, Console> {
        lock(&self.console)
    }

    pub fn monitors(&self) -> &MonitorTable {
        &self.monitors
    }

    // ========================================================================
    // CPU accounting
    // ========================================================================

    /// Last sampled CPU time
    pub fn cpu_time(&self) -> Duration {
        Duration::from_nanos(self.cpu_nanos.load(Ordering::SeqCst))
    }

    /// Sample the group's CPU clocks; the counter never decreases
    pub fn sample_cpu(&self) -> Duration {
        let nanos = u64::try_from(self.group.cpu_time().as_nanos()).unwrap_or(u64::MAX);
        let previous = self.cpu_nanos.fetch_max(nanos, Ordering::SeqCst);
        Duration::from_nanos(previous.max(nanos))
    }

    // ========================================================================
    // Permissions
    // ========================================================================

    pub fn record_permission(&self, permission: Permission, granted: bool) {
        *lock(&self.permissions)
            .entry((permission, granted))
            .or_insert(0) += 1;
    }

    /// Record and audit a call to a forbidden target, returning the fault to raise
    pub fn deny_forbidden_call(&self, target: &str) -> Fault {
        self.record_permission(
            Permission::ForbiddenCall {
                target: target.to_string(),
            },
            false,
        );
        self.audit.log(AuditEvent::ForbiddenCall {
            task: self.id().as_u64(),
            target: target.to_string(),
        });
        tracing::debug!(task = %self.id(), %target, "forbidden call trapped");
        Fault::security(format!("call to {} is forbidden", target))
    }

    pub fn permission_records(&self) -> Vec<PermissionRecord> {
        lock(&self.permissions)
            .iter()
            .map(|((permission, granted), count)| PermissionRecord {
                permission: permission.clone(),
                granted: *granted,
                count: *count,
            })
            .collect()
    }

    /// Resolve a unit for code running in this task
    ///
    /// A policy denial is recorded and surfaces as "not found", never as a
    /// security fault.
    pub fn resolve_unit(&self, name: &str) -> Result<Resolved, Fault> {
        match self.loader.resolve(name) {
            Ok(resolved) => Ok(resolved),
            Err(LoadError::Denied { name }) => {
                self.record_permission(Permission::LoadUnit { name: name.clone() }, false);
                self.audit.log(AuditEvent::UnitDenied {
                    task: self.id().as_u64(),
                    name: name.clone(),
                });
                tracing::debug!(task = %self.id(), unit = %name, "unit load denied");
                Err(Fault::new(kinds::UNIT_NOT_FOUND, name))
            }
            Err(LoadError::NotFound { name }) => Err(Fault::new(kinds::UNIT_NOT_FOUND, name)),
            Err(e @ LoadError::Invalid { .. }) => Err(Fault::new(kinds::LINKAGE, e.to_string())),
        }
    }

    // ========================================================================
    // Extra threads
    // ========================================================================

    /// Reserve one extra thread; `Err` carries the ceiling
    pub fn reserve_extra(&self) -> Result<(), usize> {
        let max = self.max_extra_threads;
        self.extra_created
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| max)
    }

    /// Extra threads created so far
    pub fn extra_created(&self) -> usize {
        self.extra_created.load(Ordering::SeqCst)
    }

    /// Start `target` on a new thread of this task's group
    pub fn spawn_extra(self: &Arc<Self>, target: String, args: Vec<Value>) -> Result<u64, Fault> {
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        let task = Arc::clone(self);
        let name = format!("extra-{}", self.extra_created());

        let control = self
            .group
            .spawn(&name, move |control| {
                let id = task.id();
                let mut interpreter = Interpreter::new(task, control);
                match interpreter.invoke_target(&target, args) {
                    Ok(value) => *lock(&slot) = Some(value),
                    Err(VmError::Thrown(fault)) => {
                        tracing::debug!(task = %id, %target, %fault, "extra thread threw")
                    }
                    Err(VmError::Stopped) => {}
                }
            })
            .map_err(|e| Fault::new(kinds::ILLEGAL_STATE, e.to_string()))?;

        let id = control.id();
        lock(&self.extras).insert(id, ExtraThread { control, result });
        Ok(id)
    }

    /// Wait for an extra thread and take its return value
    pub fn join_extra(&self, id: u64, waiter: &ThreadControl) -> Result<Value, VmError> {
        let (control, result) = match lock(&self.extras).get(&id) {
            Some(extra) => (extra.control.clone(), extra.result.clone()),
            None => {
                return Err(Fault::new(kinds::ILLEGAL_STATE, format!("no thread {}", id)).into())
            }
        };
        while !control.is_finished() {
            waiter.sleep(JOIN_SLICE).map_err(wake_error)?;
        }
        let value = lock(&result).take();
        Ok(value.unwrap_or(Value::Null))
    }

    // ========================================================================
    // Shutdown and kill
    // ========================================================================

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Kill with `reason`; the first reason wins. Returns whether this
    /// call set the reason.
    pub fn kill(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let first = {
            let mut slot = lock(&self.kill_reason);
            if slot.is_none() {
                *slot = Some(reason.clone());
                true
            } else {
                false
            }
        };
        self.begin_shutdown();
        if first {
            self.audit.log(AuditEvent::TaskKilled {
                task: self.id().as_u64(),
                reason: reason.clone(),
            });
            tracing::info!(task = %self.id(), %reason, "task killed");
            self.notify(TaskEvent::Killed);
        }
        first
    }

    pub fn kill_reason(&self) -> Option<String> {
        lock(&self.kill_reason).clone()
    }

    pub fn notify(&self, event: TaskEvent) {
        // The supervisor may already have stopped listening
        let _ = lock(&self.events).send(event);
    }

    // ========================================================================
    // Deadlines
    // ========================================================================

    pub fn deadlines(&self) -> Deadlines {
        *lock(&self.deadlines)
    }

    pub fn update_deadlines(&self, update: impl FnOnce(&mut Deadlines)) {
        update(&mut lock(&self.deadlines));
        self.notify(TaskEvent::DeadlinesChanged);
    }

    // ========================================================================
    // Plugin data and properties
    // ========================================================================

    /// Run `f` on a plugin's working data, serialised per plugin
    pub fn with_plugin_data<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut (dyn Any + Send)) -> R,
    ) -> Option<R> {
        let (_, slot) = self.plugin_data.iter().find(|(plugin, _)| plugin == id)?;
        let mut data = lock(slot);
        data.as_mut().map(|data| f(data.as_mut()))
    }

    /// Move all plugin working data out of the task
    pub fn take_plugin_data(&self) -> Vec<(String, PluginData)> {
        self.plugin_data
            .iter()
            .filter_map(|(id, slot)| lock(slot).take().map(|data| (id.clone(), data)))
            .collect()
    }

    pub fn property(&self, key: &str) -> Option<String> {
        lock(&self.properties).get(key).cloned()
    }

    /// Set a property in this task's private copy; returns the old value
    pub fn set_property(&self, key: &str, value: &str) -> Option<String> {
        lock(&self.properties).insert(key.to_string(), value.to_string())
    }
}
