use super::{console_fault, NativeCall, NativeUnit};
use crate::hooks;
use crate::task::console::Stream;
use crate::value::{kinds, Fault, Value};
use crate::vm::VmError;

fn emit(call: &NativeCall<'_>, stream: Stream, newline: bool) -> Result<Value, VmError> {
    let mut text = call.arg(0).to_string();
    if newline {
        text.push('\n');
    }
    hooks::write_output(stream, text.as_bytes()).map_err(console_fault)?;
    Ok(Value::Null)
}

pub(super) fn unit() -> NativeUnit {
    NativeUnit::new("host.io")
        .method("print", 1, |call| emit(call, Stream::Stdout, false))
        .method("println", 1, |call| emit(call, Stream::Stdout, true))
        .method("eprint", 1, |call| emit(call, Stream::Stderr, false))
        .method("eprintln", 1, |call| emit(call, Stream::Stderr, true))
        .method("read_line", 0, |_| {
            Ok(hooks::read_line().map(Value::from).unwrap_or(Value::Null))
        })
        .method("capture_begin", 0, |call| {
            call.task
                .console()
                .begin_redirect()
                .map_err(console_fault)?;
            Ok(Value::Null)
        })
        .method("capture_end", 0, |call| {
            let captured = call.task.console().end_redirect().map_err(console_fault)?;
            Ok(Value::from(captured))
        })
        .method("limit_begin", 1, |call| {
            let limit = call.int(0)?;
            let limit = usize::try_from(limit).map_err(|_| {
                VmError::from(Fault::new(
                    kinds::ILLEGAL_STATE,
                    format!("output limit must not be negative, got {}", limit),
                ))
            })?;
            call.task
                .console()
                .begin_limit(limit)
                .map_err(console_fault)?;
            Ok(Value::Null)
        })
        .method("limit_end", 0, |call| {
            call.task.console().end_limit();
            Ok(Value::Null)
        })
}
