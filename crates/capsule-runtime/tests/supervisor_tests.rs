//! Supervision lifecycle: deadlines, kills, output limits, rejected
//! submissions and containment failure

mod common;

use capsule_runtime::hooks;
use capsule_runtime::{
    AuditEvent, CodeUnit, EngineError, Entry, ExecutionParams, Insn, MemoryAuditLogger, NativeUnit,
    ParamsError, Supervisor, Value,
};
use common::*;
use common::assert_eq;
use rstest::rstest;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn spin(m: &mut capsule_runtime::bytecode::assembler::MethodBuilder<'_>) {
    let top = m.label();
    m.mark(top).jump(top);
}

// ============================================================================
// Deadlines
// ============================================================================

#[test]
fn test_infinite_loop_times_out() {
    let wall = Duration::from_millis(100);
    let poll = Duration::from_millis(10);
    let result = run_with(
        &Supervisor::new(),
        vec![unit("app", "main", 0, 0, spin)],
        "app::main",
        params().with_wall_timeout(wall).with_poll_interval(poll),
    )
    .unwrap();

    assert!(result.timed_out);
    assert!(!result.cpu_timed_out);
    assert!(result.returned.is_none());
    assert!(result.threw.is_none());
    assert!(result.execution >= wall);
    // One poll interval late at most, plus scheduling slack
    assert!(
        result.execution < wall + poll + Duration::from_millis(150),
        "execution took {:?}",
        result.execution
    );
}

#[test]
fn test_catch_all_cannot_outlive_timeout() {
    // A loop inside a catch-all that jumps straight back into the loop
    let app = unit("app", "main", 0, 0, |m| {
        let start = m.label();
        let end = m.label();
        m.mark(start).jump(start);
        m.mark(end).op(Insn::Pop).jump(start);
        m.try_region(start, end, end, None);
    });
    let result = run_with(
        &Supervisor::new(),
        vec![app],
        "app::main",
        params().with_wall_timeout(Duration::from_millis(100)),
    )
    .unwrap();
    assert!(result.timed_out);
}

#[test]
fn test_cpu_budget_times_out() {
    let result = run_with(
        &Supervisor::new(),
        vec![unit("app", "main", 0, 0, spin)],
        "app::main",
        params()
            .with_wall_timeout(Duration::from_secs(10))
            .with_cpu_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(5)),
    )
    .unwrap();

    assert!(result.timed_out);
    assert!(result.cpu_timed_out);
    assert!(result.execution < Duration::from_secs(10));
}

#[test]
fn test_wall_deadline_can_be_extended() {
    let app = unit("app", "main", 0, 0, |m| {
        m.int(300).invoke("host.thread::sleep", 1).op(Insn::Pop);
        m.int(1).op(Insn::Return);
    });
    let supervisor = Supervisor::new();
    let running = supervisor
        .start(
            &bundle(vec![app]),
            Entry::new("app", "main"),
            params().with_wall_timeout(Duration::from_millis(100)),
        )
        .unwrap();
    assert!(running.control().extend_wall(Duration::from_secs(5)));

    let result = running.wait().unwrap();
    assert!(!result.timed_out);
    assert_returned(&result, Value::Int(1));
}

#[rstest]
#[case::extend(true)]
#[case::set(false)]
fn test_unrepresentable_wall_deadline_is_cleared(#[case] extend: bool) {
    let app = unit("app", "main", 0, 0, |m| {
        m.int(200).invoke("host.thread::sleep", 1).op(Insn::Pop);
        m.int(1).op(Insn::Return);
    });
    let supervisor = Supervisor::new();
    let running = supervisor
        .start(
            &bundle(vec![app]),
            Entry::new("app", "main"),
            params().with_wall_timeout(Duration::from_millis(100)),
        )
        .unwrap();
    let control = running.control();
    if extend {
        assert!(control.extend_wall(Duration::MAX));
    } else {
        assert!(control.set_wall(Duration::MAX));
    }
    assert!(control.extend_cpu(Duration::MAX));

    let result = running.wait().unwrap();
    assert!(!result.timed_out);
    assert_returned(&result, Value::Int(1));
}

#[test]
fn test_huge_sleep_is_interrupted_by_timeout() {
    let app = unit("app", "main", 0, 0, |m| {
        m.int(i64::MAX).invoke("host.thread::sleep", 1).op(Insn::Return);
    });
    let result = run_with(
        &Supervisor::new(),
        vec![app],
        "app::main",
        params().with_wall_timeout(Duration::from_millis(100)),
    )
    .unwrap();
    assert!(result.timed_out);
}

#[test]
fn test_wall_deadline_can_be_brought_forward() {
    let supervisor = Supervisor::new();
    let running = supervisor
        .start(
            &bundle(vec![unit("app", "main", 0, 0, spin)]),
            Entry::new("app", "main"),
            params().with_wall_timeout(Duration::from_secs(30)),
        )
        .unwrap();
    assert!(running.control().set_wall(Duration::from_millis(50)));

    let result = running.wait().unwrap();
    assert!(result.timed_out);
    assert!(result.execution < Duration::from_secs(30));
}

#[test]
fn test_control_is_inert_after_release() {
    let supervisor = Supervisor::new();
    let running = supervisor
        .start(
            &bundle(vec![unit("app", "main", 0, 0, |m| {
                m.op(Insn::Null).op(Insn::Return);
            })]),
            Entry::new("app", "main"),
            params(),
        )
        .unwrap();
    let control = running.control();
    assert!(control.is_alive());

    running.wait().unwrap();
    assert!(!control.is_alive());
    assert!(!control.extend_wall(Duration::from_secs(1)));
    assert!(!control.kill("late"));
}

// ============================================================================
// Kills
// ============================================================================

#[test]
fn test_kill_from_outside() {
    let supervisor = Supervisor::new();
    let running = supervisor
        .start(
            &bundle(vec![unit("app", "main", 0, 0, spin)]),
            Entry::new("app", "main"),
            params(),
        )
        .unwrap();
    let control = running.control();
    assert!(control.kill("operator"));
    assert!(!control.kill("second"));

    let result = running.wait().unwrap();
    assert!(result.was_killed());
    assert_eq!(result.kill_reason.as_deref(), Some("operator"));
    assert!(!result.timed_out);
    assert!(result.returned.is_none());
    assert!(result.threw.is_none());
}

#[test]
fn test_task_kills_itself() {
    let result = run_main(|m| {
        m.str("done early").invoke("host.task::kill", 1).op(Insn::Pop);
        m.int(1).op(Insn::Return);
    });
    assert_eq!(result.kill_reason.as_deref(), Some("done early"));
    assert!(result.returned.is_none());
    assert!(result.threw.is_none());
}

// ============================================================================
// Outcomes
// ============================================================================

#[test]
fn test_domain_fault_is_reported() {
    let result = run_main(|m| {
        m.str("boom").throw("app.failure");
    });
    assert_threw(&result, "app.failure");
    assert!(!result.timed_out);
    assert!(result.kill_reason.is_none());
}

#[test]
fn test_entry_arguments_are_passed() {
    let app = unit("app", "add", 2, 2, |m| {
        m.load(0).load(1).op(Insn::Add).op(Insn::Return);
    });
    let result = Supervisor::new()
        .run(
            &bundle(vec![app]),
            Entry::new("app", "add").with_args(vec![Value::Int(2), Value::Int(3)]),
            params(),
        )
        .unwrap();
    assert_returned(&result, Value::Int(5));
}

#[test]
fn test_output_is_truncated_at_line_limit() {
    let result = run_with(
        &Supervisor::new(),
        vec![unit("app", "main", 0, 1, |m| {
            let top = m.label();
            let done = m.label();
            m.int(0).store(0);
            m.mark(top).load(0).int(5).op(Insn::Lt).jump_if_false(done);
            m.load(0).invoke("host.io::println", 1).op(Insn::Pop);
            m.load(0).int(1).op(Insn::Add).store(0).jump(top);
            m.mark(done).op(Insn::Null).op(Insn::Return);
        })],
        "app::main",
        params().with_max_output_lines(2),
    )
    .unwrap();

    assert_eq!(result.stdout(), "0\n1\n");
    assert_eq!(result.truncated_output_lines, 3);
}

#[test]
fn test_input_is_served_line_by_line() {
    let result = run_with(
        &Supervisor::new(),
        vec![unit("app", "main", 0, 0, |m| {
            m.invoke("host.io::read_line", 0);
            m.invoke("host.io::read_line", 0).op(Insn::Concat);
            m.invoke("host.io::read_line", 0).op(Insn::Concat);
            m.op(Insn::Return);
        })],
        "app::main",
        params().with_input("a\nb\n"),
    )
    .unwrap();

    // Exhausted input reads as null
    assert_returned(&result, Value::str("abnull"));
    assert_eq!(result.input, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn test_audit_trail_covers_lifecycle() {
    let audit = Arc::new(MemoryAuditLogger::new());
    let supervisor = Supervisor::new().with_audit_logger(audit.clone());
    run_with(
        &supervisor,
        vec![unit("app", "main", 0, 0, |m| {
            m.op(Insn::Null).op(Insn::Return);
        })],
        "app::main",
        params(),
    )
    .unwrap();

    let events: Vec<AuditEvent> = audit
        .recent(Duration::from_secs(60))
        .into_iter()
        .map(|entry| entry.event)
        .collect();
    assert!(matches!(events.first(), Some(AuditEvent::TaskCreated { .. })));
    assert!(matches!(events.last(), Some(AuditEvent::TaskReleased { .. })));
}

// ============================================================================
// Rejected submissions
// ============================================================================

#[test]
fn test_busy_bundle_is_rejected() {
    let supervisor = Supervisor::new();
    let shared = bundle(vec![unit("app", "main", 0, 0, spin)]);
    let first = supervisor
        .start(&shared, Entry::new("app", "main"), params())
        .unwrap();

    let second = supervisor.start(&shared, Entry::new("app", "main"), params());
    assert!(matches!(second, Err(EngineError::BundleBusy { .. })));

    first.control().kill("cleanup");
    first.wait().unwrap();
    assert!(!shared.is_occupied());
}

#[rstest]
#[case("lib.absent", "main")]
#[case("app", "absent")]
fn test_unknown_entry_is_rejected(#[case] unit_name: &str, #[case] method: &str) {
    let result = Supervisor::new().run(
        &bundle(vec![unit("app", "main", 0, 0, |m| {
            m.op(Insn::Return);
        })]),
        Entry::new(unit_name, method),
        params(),
    );
    assert_eq!(
        result.unwrap_err(),
        EngineError::UnknownEntry {
            unit: unit_name.to_string(),
            method: method.to_string(),
        }
    );
}

#[test]
fn test_entry_arity_is_checked() {
    let result = Supervisor::new().run(
        &bundle(vec![unit("app", "main", 1, 1, |m| {
            m.load(0).op(Insn::Return);
        })]),
        Entry::new("app", "main"),
        params(),
    );
    assert!(matches!(
        result,
        Err(EngineError::EntryArity {
            expected: 1,
            got: 0,
            ..
        })
    ));
}

#[test]
fn test_invalid_params_are_rejected() {
    let result = Supervisor::new().run(
        &bundle(vec![unit("app", "main", 0, 0, spin)]),
        Entry::new("app", "main"),
        ExecutionParams::new().with_wall_timeout(Duration::ZERO),
    );
    assert_eq!(
        result.unwrap_err(),
        EngineError::Params(ParamsError::ZeroWallTimeout)
    );
}

#[test]
fn test_malformed_unit_is_rejected() {
    let forged = capsule_runtime::bytecode::assembler::UnitBuilder::new("app")
        .method("main", 0, 0, |m| {
            m.op(Insn::EnterCheck).op(Insn::Null).op(Insn::Return);
        })
        .build_unchecked()
        .unwrap();
    let result = Supervisor::new().run(
        &bundle(vec![CodeUnit::executable(&forged).unwrap()]),
        Entry::new("app", "main"),
        params(),
    );
    assert!(matches!(result, Err(EngineError::InvalidUnit { .. })));
}

// ============================================================================
// Containment failure
// ============================================================================

static STUBBORN_RELEASE: AtomicBool = AtomicBool::new(false);

#[test]
fn test_containment_failure_poisons_supervisor() {
    // A host native that ignores every stop request
    let stubborn = NativeUnit::new("host.stubborn").method("spin", 0, |_| {
        while !STUBBORN_RELEASE.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(Value::Null)
    });
    let supervisor = Supervisor::new().with_native(stubborn);

    let result = run_with(
        &supervisor,
        vec![unit("app", "main", 0, 0, |m| {
            m.invoke("host.stubborn::spin", 0).op(Insn::Return);
        })],
        "app::main",
        params()
            .with_wall_timeout(Duration::from_millis(50))
            .with_return_grace(Duration::from_millis(10))
            .with_termination(2, Duration::from_millis(10)),
    );

    let task = match result {
        Err(EngineError::Containment { task, remaining }) => {
            assert_eq!(remaining, 1);
            task
        }
        other => panic!("expected a containment failure, got {:?}", other.map(|_| ())),
    };
    assert!(supervisor.is_poisoned());
    assert!(hooks::is_registered(task));

    let next = run_with(
        &supervisor,
        vec![unit("app", "main", 0, 0, |m| {
            m.op(Insn::Return);
        })],
        "app::main",
        params(),
    );
    assert_eq!(next.unwrap_err(), EngineError::Poisoned);

    STUBBORN_RELEASE.store(true, Ordering::SeqCst);
}
