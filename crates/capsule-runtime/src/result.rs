//! Execution results

use crate::plugin::PluginOutput;
use crate::security::permissions::Permission;
use crate::task::console::{OutputLine, Stream};
use crate::value::{Fault, Value};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// How often one permission was requested with one outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRecord {
    pub permission: Permission,
    pub granted: bool,
    pub count: u64,
}

/// Everything observed about one finished execution
///
/// A timed-out or killed task reports neither a return value nor a thrown
/// fault.
pub struct TaskResult {
    pub returned: Option<Value>,
    pub threw: Option<Fault>,
    pub timed_out: bool,
    /// The CPU budget, not the wall deadline, ran out
    pub cpu_timed_out: bool,
    pub kill_reason: Option<String>,
    pub output: Vec<OutputLine>,
    pub input: Vec<String>,
    pub truncated_output_lines: usize,
    pub truncated_input_lines: usize,
    pub dropped_io_bytes: usize,
    pub permissions: Vec<PermissionRecord>,
    /// From submission until the result was assembled
    pub submitted_to_completed: Duration,
    /// From worker start until the supervisor stopped waiting for it
    pub execution: Duration,
    pub cpu_time: Duration,
    pub started_at: DateTime<Utc>,
    pub plugin_data: Vec<(String, PluginOutput)>,
}

impl TaskResult {
    pub fn was_killed(&self) -> bool {
        self.kill_reason.is_some()
    }

    /// Stdout and stderr interleaved in write order, one line per entry
    pub fn combined_output(&self) -> String {
        join_lines(self.output.iter())
    }

    pub fn stdout(&self) -> String {
        join_lines(self.output.iter().filter(|l| l.stream == Stream::Stdout))
    }

    pub fn stderr(&self) -> String {
        join_lines(self.output.iter().filter(|l| l.stream == Stream::Stderr))
    }

    pub fn any_denied(&self) -> bool {
        self.permissions.iter().any(|r| !r.granted)
    }

    pub fn denied(&self) -> impl Iterator<Item = &PermissionRecord> {
        self.permissions.iter().filter(|r| !r.granted)
    }

    /// Same as `execution`
    pub fn duration(&self) -> Duration {
        self.execution
    }

    /// Finalized output of plugin `id`, if it has type `T`
    pub fn plugin_data<T: 'static>(&self, id: &str) -> Option<&T> {
        self.plugin_data
            .iter()
            .find(|(plugin, _)| plugin == id)
            .and_then(|(_, data)| data.downcast_ref::<T>())
    }
}

fn join_lines<'a>(lines: impl Iterator<Item = &'a OutputLine>) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line.text);
        out.push('\n');
    }
    out
}

impl fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plugins: Vec<&str> = self.plugin_data.iter().map(|(id, _)| id.as_str()).collect();
        f.debug_struct("TaskResult")
            .field("returned", &self.returned)
            .field("threw", &self.threw)
            .field("timed_out", &self.timed_out)
            .field("cpu_timed_out", &self.cpu_timed_out)
            .field("kill_reason", &self.kill_reason)
            .field("output_lines", &self.output.len())
            .field("truncated_output_lines", &self.truncated_output_lines)
            .field("input_lines", &self.input.len())
            .field("truncated_input_lines", &self.truncated_input_lines)
            .field("dropped_io_bytes", &self.dropped_io_bytes)
            .field("permissions", &self.permissions)
            .field("execution", &self.execution)
            .field("cpu_time", &self.cpu_time)
            .field("plugins", &plugins)
            .finish()
    }
}
