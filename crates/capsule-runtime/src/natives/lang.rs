use super::{NativeCall, NativeUnit};
use crate::loader::Resolved;
use crate::value::{kinds, Fault, Value};
use crate::vm::VmError;

fn fault_arg<'a>(call: &'a NativeCall<'_>) -> Result<&'a Fault, VmError> {
    match call.arg(0) {
        Value::Fault(fault) => Ok(fault),
        other => Err(Fault::type_error("fault", other).into()),
    }
}

pub(super) fn lang_unit() -> NativeUnit {
    NativeUnit::new("host.lang")
        .method("to_str", 1, |call| Ok(Value::from(call.arg(0).to_string())))
        .method("len", 1, |call| match call.arg(0) {
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(items) => Ok(Value::Int(
                items.lock().unwrap_or_else(|e| e.into_inner()).len() as i64,
            )),
            other => Err(Fault::type_error("string or list", other).into()),
        })
        .method("kind", 1, |call| Ok(Value::from(fault_arg(call)?.kind.as_str())))
        .method("message", 1, |call| {
            Ok(Value::from(fault_arg(call)?.message.as_str()))
        })
        .method("type_of", 1, |call| Ok(Value::from(call.arg(0).type_name())))
}

pub(super) fn reflect_unit() -> NativeUnit {
    NativeUnit::new("host.reflect")
        .method("exists", 1, |call| {
            let name = call.str(0)?.to_string();
            Ok(Value::Bool(call.task.resolve_unit(&name).is_ok()))
        })
        .method("resource", 1, |call| {
            let name = call.str(0)?.to_string();
            match call.task.resolve_unit(&name)? {
                Resolved::Data(bytes) => Ok(Value::from(String::from_utf8_lossy(&bytes).into_owned())),
                _ => Err(Fault::new(
                    kinds::UNIT_NOT_FOUND,
                    format!("'{}' is not a resource", name),
                )
                .into()),
            }
        })
}
