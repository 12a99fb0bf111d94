//! Shared helpers for capsule integration tests
//!
//! Units are assembled with `UnitBuilder`, wrapped into a single-use bundle
//! and run through a fresh `Supervisor`.

#![allow(dead_code)]

use capsule_runtime::bytecode::assembler::{MethodBuilder, UnitBuilder};
use capsule_runtime::{
    CodeBundle, CodeUnit, EngineError, Entry, ExecutionParams, Supervisor, TaskResult, Value,
};
use std::sync::Arc;
use std::time::Duration;

// Re-export testing utilities
pub use pretty_assertions::{assert_eq, assert_ne};

/// Unit with one method
pub fn unit(
    name: &str,
    method: &str,
    arity: u8,
    locals: u16,
    build: impl FnOnce(&mut MethodBuilder<'_>),
) -> CodeUnit {
    UnitBuilder::new(name)
        .method(method, arity, locals, build)
        .build_code_unit()
        .expect("test unit should assemble")
}

pub fn bundle(units: Vec<CodeUnit>) -> Arc<CodeBundle> {
    let bundle = units
        .into_iter()
        .fold(CodeBundle::new("test"), |bundle, unit| bundle.with_unit(unit));
    Arc::new(bundle)
}

/// Defaults with a wall timeout short enough for tests
pub fn params() -> ExecutionParams {
    ExecutionParams::new().with_wall_timeout(Duration::from_secs(5))
}

pub fn run_with(
    supervisor: &Supervisor,
    units: Vec<CodeUnit>,
    entry: &str,
    params: ExecutionParams,
) -> Result<TaskResult, EngineError> {
    let (unit, method) = entry.split_once("::").expect("entry is unit::method");
    supervisor.run(&bundle(units), Entry::new(unit, method), params)
}

/// Run `entry` with default parameters; containment must succeed
pub fn run(units: Vec<CodeUnit>, entry: &str) -> TaskResult {
    run_with(&Supervisor::new(), units, entry, params()).expect("task should be contained")
}

/// Run a unit whose `main` is built by `build`
pub fn run_main(build: impl FnOnce(&mut MethodBuilder<'_>)) -> TaskResult {
    run(vec![unit("app", "main", 0, 4, build)], "app::main")
}

pub fn assert_returned(result: &TaskResult, expected: Value) {
    match &result.returned {
        Some(value) => assert_eq!(value, &expected),
        None => panic!("expected a return value, got {:?}", result),
    }
}

pub fn assert_threw(result: &TaskResult, kind: &str) {
    match &result.threw {
        Some(fault) => assert_eq!(fault.kind, kind, "unexpected fault {}", fault),
        None => panic!("expected a {} fault, got {:?}", kind, result),
    }
}
