//! Enforcement: permission checks, forbidden calls, fatal faults, thread
//! ceilings and isolation between tasks

mod common;

use capsule_runtime::hooks;
use capsule_runtime::vm::monitor::{MonitorKey, MonitorTable};
use capsule_runtime::{
    kinds, Entry, Insn, Permission, PermissionPolicy, PolicyBuilder, Supervisor, TaskResult, Value,
};
use common::*;
use common::assert_eq;
use serial_test::serial;
use std::time::Duration;

fn run_policy(
    policy: PermissionPolicy,
    build: impl FnOnce(&mut capsule_runtime::bytecode::assembler::MethodBuilder<'_>),
) -> TaskResult {
    run_with(
        &Supervisor::new(),
        vec![unit("app", "main", 0, 4, build)],
        "app::main",
        params().with_policy(policy),
    )
    .expect("task should be contained")
}

// ============================================================================
// Permission checks
// ============================================================================

#[test]
fn test_denied_file_read_is_recorded_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("secret.txt");
    std::fs::write(&path, "hidden").unwrap();
    let path = path.to_string_lossy().into_owned();

    let policy = PolicyBuilder::allow_list().allow_unit("host.").build().unwrap();
    let result = run_policy(policy, |m| {
        m.str(&path).invoke("host.fs::read", 1).op(Insn::Return);
    });

    assert_threw(&result, kinds::SECURITY);
    assert_eq!(result.permissions.len(), 1);
    let record = &result.permissions[0];
    assert!(matches!(record.permission, Permission::FileRead { .. }));
    assert!(!record.granted);
    assert_eq!(record.count, 1);
}

#[test]
fn test_permitted_file_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("open.txt");
    std::fs::write(&path, "visible").unwrap();
    let path = path.to_string_lossy().into_owned();

    let result = run_policy(PermissionPolicy::permissive(), |m| {
        m.str(&path).invoke("host.fs::read", 1).op(Insn::Return);
    });

    assert_returned(&result, Value::str("visible"));
    assert!(!result.any_denied());
    assert_eq!(result.permissions[0].count, 1);
    assert!(result.permissions[0].granted);
}

#[test]
fn test_repeated_checks_are_counted() {
    let policy = PolicyBuilder::deny_list()
        .deny(Permission::Environment {
            var: "HOME".to_string(),
        })
        .build()
        .unwrap();
    let result = run_policy(policy, |m| {
        let start = m.label();
        let end = m.label();
        let second = m.label();
        let done = m.label();
        m.mark(start).str("HOME").invoke("host.system::env", 1).op(Insn::Return);
        m.mark(end).op(Insn::Pop);
        m.mark(second).str("HOME").invoke("host.system::env", 1).op(Insn::Return);
        m.mark(done).op(Insn::Pop).op(Insn::Null).op(Insn::Return);
        m.try_region(start, end, end, Some(kinds::SECURITY));
        m.try_region(second, done, done, Some(kinds::SECURITY));
    });

    assert_returned(&result, Value::Null);
    let denied: Vec<_> = result.denied().collect();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].count, 2);
}

#[test]
fn test_denied_unit_reads_as_missing() {
    let policy = PolicyBuilder::deny_list().deny_unit("host.fs").build().unwrap();
    let result = run_policy(policy, |m| {
        m.str("host.fs").invoke("host.reflect::exists", 1).store(0);
        m.str("host.fs").invoke("host.reflect::exists", 1).op(Insn::Pop);
        m.str("host.io").invoke("host.reflect::exists", 1).load(0).op(Insn::Ne);
        m.op(Insn::Return);
    });

    // exists(host.io) != exists(host.fs)
    assert_returned(&result, Value::Bool(true));
    let denied: Vec<_> = result.denied().collect();
    assert_eq!(denied.len(), 1);
    assert_eq!(
        denied[0].permission,
        Permission::LoadUnit {
            name: "host.fs".to_string()
        }
    );
    assert_eq!(denied[0].count, 2);
}

#[test]
fn test_invoking_denied_unit_faults() {
    let result = run_policy(PermissionPolicy::restrictive(), |m| {
        m.str("x").invoke("host.io::println", 1).op(Insn::Return);
    });
    assert_threw(&result, kinds::UNIT_NOT_FOUND);
    assert!(result.output.is_empty());
}

#[test]
fn test_bridge_units_survive_restrictive_policy() {
    let result = run_policy(PermissionPolicy::restrictive(), |m| {
        m.int(3).invoke("host.lang::type_of", 1).op(Insn::Return);
    });
    assert_returned(&result, Value::str("int"));
}

// ============================================================================
// Forbidden calls
// ============================================================================

#[test]
fn test_forbidden_exit_is_trapped() {
    let result = run_main(|m| {
        m.int(3).invoke("host.system::exit", 1).op(Insn::Return);
    });

    assert_threw(&result, kinds::SECURITY);
    assert!(result.kill_reason.is_none());
    assert_eq!(result.permissions.len(), 1);
    assert_eq!(
        result.permissions[0].permission,
        Permission::ForbiddenCall {
            target: "host.system::exit".to_string()
        }
    );
    assert!(!result.permissions[0].granted);
}

#[test]
fn test_permitted_exit_ends_only_the_task() {
    let policy = PolicyBuilder::deny_list()
        .forbidden_calls(Vec::new())
        .build()
        .unwrap();
    let result = run_policy(policy, |m| {
        m.int(3).invoke("host.system::exit", 1).op(Insn::Return);
    });
    assert_eq!(result.kill_reason.as_deref(), Some("exit(3)"));
    assert!(result.threw.is_none());
}

#[test]
fn test_custom_forbidden_prefix() {
    let policy = PolicyBuilder::deny_list()
        .forbid_call("host.fs")
        .build()
        .unwrap();
    let result = run_policy(policy, |m| {
        m.str("/tmp/x").str("data").invoke("host.fs::write", 2).op(Insn::Return);
    });
    assert_threw(&result, kinds::SECURITY);
    assert!(matches!(
        result.permissions[0].permission,
        Permission::ForbiddenCall { .. }
    ));
}

#[test]
fn test_spawned_target_cannot_reach_forbidden_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("written.txt");
    let target = path.to_string_lossy().into_owned();

    let policy = PolicyBuilder::deny_list()
        .forbid_call("host.fs")
        .build()
        .unwrap();
    let result = run_policy(policy, |m| {
        m.str("host.fs::write").str(&target).str("data").op(Insn::NewList(2));
        m.invoke("host.thread::spawn", 2).store(0);
        m.load(0).invoke("host.thread::join", 1).op(Insn::Return);
    });

    assert_threw(&result, kinds::SECURITY);
    assert!(!path.exists());
    assert_eq!(result.permissions.len(), 1);
    assert_eq!(
        result.permissions[0].permission,
        Permission::ForbiddenCall {
            target: "host.fs::write".to_string()
        }
    );
    assert!(!result.permissions[0].granted);
}

#[test]
fn test_spawned_exit_is_trapped() {
    let result = run_main(|m| {
        m.str("host.system::exit").int(7).op(Insn::NewList(1));
        m.invoke("host.thread::spawn", 2).op(Insn::Return);
    });

    assert_threw(&result, kinds::SECURITY);
    assert!(result.kill_reason.is_none());
    assert!(!result
        .permissions
        .iter()
        .any(|r| matches!(r.permission, Permission::Exit | Permission::ThreadCreate)));
}

// ============================================================================
// Fatal faults
// ============================================================================

fn catch_all_around(
    kind: &'static str,
) -> impl FnOnce(&mut capsule_runtime::bytecode::assembler::MethodBuilder<'_>) {
    move |m| {
        let start = m.label();
        let end = m.label();
        m.mark(start).str("thrown").throw(kind);
        m.mark(end).op(Insn::Pop).str("swallowed").op(Insn::Return);
        m.try_region(start, end, end, None);
    }
}

#[test]
fn test_catch_all_cannot_swallow_fatal_fault() {
    let result = run_main(catch_all_around("fault.error.custom"));
    assert_threw(&result, "fault.error.custom");
}

#[test]
fn test_catch_all_swallows_ordinary_fault() {
    let result = run_main(catch_all_around("app.failure"));
    assert_returned(&result, Value::str("swallowed"));
}

#[test]
fn test_stack_overflow_cannot_be_swallowed() {
    let app = capsule_runtime::bytecode::assembler::UnitBuilder::new("app")
        .method("rec", 0, 0, |m| {
            m.invoke("app::rec", 0).op(Insn::Return);
        })
        .method("main", 0, 0, |m| {
            let start = m.label();
            let end = m.label();
            m.mark(start).invoke("app::rec", 0).op(Insn::Return);
            m.mark(end).op(Insn::Pop).str("swallowed").op(Insn::Return);
            m.try_region(start, end, end, Some(kinds::ERROR));
        })
        .build_code_unit()
        .unwrap();
    let result = run(vec![app], "app::main");
    assert_threw(&result, kinds::STACK_OVERFLOW);
}

#[test]
fn test_safe_fault_may_be_caught() {
    let policy = PolicyBuilder::deny_list()
        .safe_fault("fault.error.custom")
        .build()
        .unwrap();
    let result = run_policy(policy, catch_all_around("fault.error.custom"));
    assert_returned(&result, Value::str("swallowed"));
}

#[test]
fn test_extra_fatal_kind() {
    let policy = PolicyBuilder::deny_list()
        .fatal_fault("app.critical")
        .build()
        .unwrap();
    let result = run_policy(policy, catch_all_around("app.critical.disk"));
    assert_threw(&result, "app.critical.disk");
}

// ============================================================================
// Consoles
// ============================================================================

#[test]
fn test_capture_scope_diverts_stdout() {
    let result = run_main(|m| {
        m.invoke("host.io::capture_begin", 0).op(Insn::Pop);
        m.str("inner").invoke("host.io::print", 1).op(Insn::Pop);
        m.str("err").invoke("host.io::eprintln", 1).op(Insn::Pop);
        m.invoke("host.io::capture_end", 0).store(0);
        m.str("outer").invoke("host.io::println", 1).op(Insn::Pop);
        m.load(0).op(Insn::Return);
    });

    assert_returned(&result, Value::str("inner"));
    assert_eq!(result.stdout(), "outer\n");
    assert_eq!(result.stderr(), "err\n");
}

#[test]
fn test_nested_capture_is_illegal() {
    let result = run_main(|m| {
        m.invoke("host.io::capture_begin", 0).op(Insn::Pop);
        m.invoke("host.io::capture_begin", 0).op(Insn::Return);
    });
    assert_threw(&result, kinds::ILLEGAL_STATE);
}

#[test]
fn test_byte_limit_raises_output_limit() {
    let result = run_main(|m| {
        m.int(4).invoke("host.io::limit_begin", 1).op(Insn::Pop);
        m.str("12").invoke("host.io::print", 1).op(Insn::Pop);
        m.str("345").invoke("host.io::print", 1).op(Insn::Return);
    });
    assert_threw(&result, kinds::OUTPUT_LIMIT);
    assert_eq!(result.stdout(), "12\n");
}

#[test]
fn test_output_limit_can_be_declared_safe() {
    let policy = PolicyBuilder::deny_list()
        .safe_fault(kinds::OUTPUT_LIMIT)
        .build()
        .unwrap();
    let result = run_policy(policy, |m| {
        let start = m.label();
        let end = m.label();
        m.mark(start).int(1).invoke("host.io::limit_begin", 1).op(Insn::Pop);
        m.str("too long").invoke("host.io::print", 1).op(Insn::Return);
        m.mark(end).op(Insn::Pop);
        m.invoke("host.io::limit_end", 0).op(Insn::Pop);
        m.str("limited").op(Insn::Return);
        m.try_region(start, end, end, None);
    });
    assert_returned(&result, Value::str("limited"));
}

#[test]
fn test_concurrent_tasks_keep_their_own_output() {
    fn chatty(tag: &'static str) -> TaskResult {
        run_main(move |m| {
            let top = m.label();
            let done = m.label();
            m.int(0).store(0);
            m.mark(top).load(0).int(50).op(Insn::Lt).jump_if_false(done);
            m.str(tag).invoke("host.io::println", 1).op(Insn::Pop);
            m.int(0).invoke("host.thread::sleep", 1).op(Insn::Pop);
            m.load(0).int(1).op(Insn::Add).store(0).jump(top);
            m.mark(done).op(Insn::Null).op(Insn::Return);
        })
    }

    let (left, right) = std::thread::scope(|s| {
        let left = s.spawn(|| chatty("left"));
        let right = s.spawn(|| chatty("right"));
        (left.join().unwrap(), right.join().unwrap())
    });

    assert_eq!(left.output.len(), 50);
    assert!(left.output.iter().all(|line| line.text == "left"));
    assert_eq!(right.output.len(), 50);
    assert!(right.output.iter().all(|line| line.text == "right"));
}

// ============================================================================
// Threads
// ============================================================================

#[test]
fn test_extra_thread_ceiling() {
    let app = capsule_runtime::bytecode::assembler::UnitBuilder::new("app")
        .method("idle", 0, 0, |m| {
            m.op(Insn::Null).op(Insn::Return);
        })
        .method("main", 0, 2, |m| {
            m.str("app::idle").op(Insn::Null).invoke("host.thread::spawn", 2).store(0);
            m.load(0).invoke("host.thread::join", 1).op(Insn::Pop);
            m.str("app::idle").op(Insn::Null).invoke("host.thread::spawn", 2).op(Insn::Return);
        })
        .build_code_unit()
        .unwrap();
    let result = run_with(
        &Supervisor::new(),
        vec![app],
        "app::main",
        params().with_max_extra_threads(1),
    )
    .unwrap();

    assert_threw(&result, kinds::SECURITY);
    let threads: Vec<_> = result
        .permissions
        .iter()
        .filter(|r| r.permission == Permission::ThreadCreate)
        .map(|r| (r.granted, r.count))
        .collect();
    assert_eq!(threads, vec![(false, 1), (true, 1)]);
}

#[test]
fn test_extra_thread_result_is_joined() {
    let app = capsule_runtime::bytecode::assembler::UnitBuilder::new("app")
        .method("square", 1, 1, |m| {
            m.load(0).load(0).op(Insn::Mul).op(Insn::Return);
        })
        .method("main", 0, 1, |m| {
            m.str("app::square").int(9).op(Insn::NewList(1));
            m.invoke("host.thread::spawn", 2).store(0);
            m.load(0).invoke("host.thread::join", 1).op(Insn::Return);
        })
        .build_code_unit()
        .unwrap();
    let result = run(vec![app], "app::main");
    assert_returned(&result, Value::Int(81));
}

#[test]
fn test_runaway_extra_thread_is_stopped() {
    let app = capsule_runtime::bytecode::assembler::UnitBuilder::new("app")
        .method("spin", 0, 0, |m| {
            let top = m.label();
            m.mark(top).jump(top);
        })
        .method("main", 0, 0, |m| {
            m.str("app::spin").op(Insn::Null).invoke("host.thread::spawn", 2).op(Insn::Pop);
            m.int(1).op(Insn::Return);
        })
        .build_code_unit()
        .unwrap();
    let result = run(vec![app], "app::main");
    assert_returned(&result, Value::Int(1));
}

// ============================================================================
// Monitors and properties
// ============================================================================

#[test]
fn test_task_monitors_are_private() {
    let holder = unit("app", "main", 0, 0, |m| {
        m.str("lock").op(Insn::MonitorEnter);
        m.int(300).invoke("host.thread::sleep", 1).op(Insn::Pop);
        m.str("lock").op(Insn::MonitorExit);
        m.op(Insn::Null).op(Insn::Return);
    });
    let supervisor = Supervisor::new();
    let running = supervisor
        .start(&bundle(vec![holder]), Entry::new("app", "main"), params())
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(MonitorTable::global().holder(&MonitorKey::Str("lock".into())), None);

    // A second task takes the same lock while the first still holds it
    let contender = run_main(|m| {
        m.str("lock").op(Insn::MonitorEnter);
        m.str("lock").op(Insn::MonitorExit);
        m.int(1).op(Insn::Return);
    });
    assert_returned(&contender, Value::Int(1));
    assert!(contender.execution < Duration::from_millis(250));

    let first = running.wait().unwrap();
    assert_returned(&first, Value::Null);
}

#[test]
fn test_unbalanced_monitor_exit_faults() {
    let result = run_main(|m| {
        m.str("lock").op(Insn::MonitorExit).op(Insn::Null).op(Insn::Return);
    });
    assert_threw(&result, kinds::ILLEGAL_MONITOR_STATE);
}

#[test]
fn test_synchronized_method_releases_on_fault() {
    let app = capsule_runtime::bytecode::assembler::UnitBuilder::new("app")
        .method("locked", 0, 0, |m| {
            m.synchronized();
            m.str("inside").throw("app.failure");
        })
        .method("main", 0, 0, |m| {
            let start = m.label();
            let end = m.label();
            m.mark(start).invoke("app::locked", 0).op(Insn::Return);
            m.mark(end).op(Insn::Pop).invoke("app::locked", 0).op(Insn::Return);
            m.try_region(start, end, end, Some("app"));
        })
        .build_code_unit()
        .unwrap();

    // The second call would block forever if the first leaked its lock
    let result = run(vec![app], "app::main");
    assert_threw(&result, "app.failure");
    assert!(!result.timed_out);
}

#[test]
#[serial]
fn test_property_writes_stay_in_task() {
    hooks::set_property("capsule.test.mode", "host");
    let result = run_main(|m| {
        m.str("capsule.test.mode").str("task").invoke("host.system::set_property", 2).op(Insn::Pop);
        m.str("capsule.test.mode").invoke("host.system::get_property", 1).op(Insn::Return);
    });

    assert_returned(&result, Value::str("task"));
    assert_eq!(hooks::property("capsule.test.mode").as_deref(), Some("host"));
}

#[test]
#[serial]
fn test_task_sees_host_properties() {
    let result = run_main(|m| {
        m.str("os.name").invoke("host.system::get_property", 1).op(Insn::Return);
    });
    assert_returned(&result, Value::str(std::env::consts::OS));
}
