use super::{NativeCall, NativeUnit};
use crate::hooks;
use crate::security::permissions::{canonicalize_path_safe, Permission};
use crate::value::{kinds, Fault, Value};
use crate::vm::VmError;
use std::path::Path;

pub(super) fn system_unit() -> NativeUnit {
    NativeUnit::new("host.system")
        .method("get_property", 1, |call| {
            let key = call.str(0)?.to_string();
            call.check(Permission::PropertyRead { key: key.clone() })?;
            Ok(hooks::property(&key).map(Value::from).unwrap_or(Value::Null))
        })
        .method("set_property", 2, |call| {
            let key = call.str(0)?.to_string();
            let value = call.arg(1).to_string();
            call.check(Permission::PropertyWrite { key: key.clone() })?;
            Ok(hooks::set_property(&key, &value)
                .map(Value::from)
                .unwrap_or(Value::Null))
        })
        .method("env", 1, |call| {
            let var = call.str(0)?.to_string();
            call.check(Permission::Environment { var: var.clone() })?;
            Ok(std::env::var(&var).map(Value::from).unwrap_or(Value::Null))
        })
        .method("exit", 1, exit)
}

/// Exiting the process is never allowed; a permitted exit ends the task
fn exit(call: &mut NativeCall<'_>) -> Result<Value, VmError> {
    let code = call.int(0)?;
    call.check(Permission::Exit)?;
    call.task.kill(format!("exit({})", code));
    Err(VmError::Stopped)
}

fn io_fault(path: &Path, error: std::io::Error) -> VmError {
    Fault::new(kinds::IO, format!("{}: {}", path.display(), error)).into()
}

pub(super) fn fs_unit() -> NativeUnit {
    NativeUnit::new("host.fs")
        .method("read", 1, |call| {
            let path = canonicalize_path_safe(Path::new(call.str(0)?));
            call.check(Permission::FileRead {
                path: path.clone(),
                recursive: false,
            })?;
            std::fs::read_to_string(&path)
                .map(Value::from)
                .map_err(|e| io_fault(&path, e))
        })
        .method("write", 2, |call| {
            let path = canonicalize_path_safe(Path::new(call.str(0)?));
            let contents = call.arg(1).to_string();
            call.check(Permission::FileWrite {
                path: path.clone(),
                recursive: false,
            })?;
            std::fs::write(&path, contents).map_err(|e| io_fault(&path, e))?;
            Ok(Value::Null)
        })
}
