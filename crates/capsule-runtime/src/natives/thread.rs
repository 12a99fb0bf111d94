use super::{NativeCall, NativeUnit};
use crate::security::permissions::Permission;
use crate::value::{Fault, Value};
use crate::vm::{wake_error, VmError};
use std::time::Duration;

fn spawn(call: &mut NativeCall<'_>) -> Result<Value, VmError> {
    let target = call.str(0)?.to_string();
    let args = match call.arg(1) {
        Value::List(items) => items.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        Value::Null => Vec::new(),
        other => return Err(Fault::type_error("list", other).into()),
    };
    if call.task.policy().is_forbidden_call(&target) {
        return Err(call.task.deny_forbidden_call(&target).into());
    }
    if !call.check(Permission::ThreadCreate)? {
        // Denied without a fault while the task shuts down
        return Ok(Value::Null);
    }
    let id = call.task.spawn_extra(target, args)?;
    Ok(Value::Int(id as i64))
}

pub(super) fn thread_unit() -> NativeUnit {
    NativeUnit::new("host.thread")
        .method("spawn", 2, spawn)
        .method("join", 1, |call| {
            let id = call.int(0)?;
            call.task.join_extra(id as u64, call.control)
        })
        .method("sleep", 1, |call| {
            let millis = call.int(0)?.max(0) as u64;
            call.control
                .sleep(Duration::from_millis(millis))
                .map_err(wake_error)?;
            Ok(Value::Null)
        })
        .method("yield", 0, |call| {
            std::thread::yield_now();
            call.control.checkpoint().map_err(wake_error)?;
            Ok(Value::Null)
        })
}

pub(super) fn task_unit() -> NativeUnit {
    NativeUnit::new("host.task")
        .method("kill", 1, |call| {
            let reason = call.arg(0).to_string();
            call.task.kill(reason);
            Err(VmError::Stopped)
        })
        .method("elapsed_ms", 0, |call| {
            Ok(Value::Int(call.task.elapsed().as_millis() as i64))
        })
        .method("is_shutting_down", 0, |call| {
            Ok(Value::Bool(call.task.is_shutting_down()))
        })
        .method("interrupted", 0, |call| {
            Ok(Value::Bool(call.control.take_interrupt()))
        })
}
