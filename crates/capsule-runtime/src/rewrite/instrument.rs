//! Per-method instrumentation
//!
//! Each method gets:
//! - `EnterCheck` as its very first instruction
//! - `ValidateCaught` at the target of every handler whose catch kind could
//!   swallow a fatal fault
//! - task-local monitors in place of `MonitorEnter`/`MonitorExit`, and for
//!   synchronized methods an explicit acquire, release-before-return and a
//!   catch-all release-and-rethrow handler
//! - a `Trap` before every forbidden call (untrusted code only)
//!
//! Instructions are re-laid out as groups, one group per original
//! instruction, so every original offset maps to the start of its group
//! and jumps and handlers can be patched with a single lookup.

use super::{RewriteContext, RewriteStats};
use crate::bytecode::{decode_all, encode_all, DecodeError, Handler, Insn, Method, Unit};
use crate::security::policy::PermissionPolicy;
use crate::value::kinds;
use std::collections::{BTreeSet, HashMap};

fn encoded_len(insns: &[Insn]) -> u32 {
    insns.iter().map(|i| i.encoded_len() as u32).sum()
}

/// Instrument `method` in place
///
/// `self_ref` is the constant naming the unit itself; it must be present
/// when the method is synchronized.
pub fn instrument_method(
    unit: &Unit,
    method: &mut Method,
    policy: &PermissionPolicy,
    context: RewriteContext,
    self_ref: Option<u16>,
) -> Result<RewriteStats, DecodeError> {
    let mut stats = RewriteStats::default();
    let body = decode_all(&method.code)?;
    let code_len = method.code.len() as u32;
    let sync_ref = if method.is_synchronized() {
        self_ref
    } else {
        None
    };

    let mut handlers = Vec::with_capacity(method.handlers.len());
    for handler in &method.handlers {
        if handler.start == handler.target {
            stats.handlers_dropped += 1;
            continue;
        }
        let mut handler = *handler;
        if handler.start < handler.target && handler.target < handler.end {
            handler.end = handler.target;
            stats.handlers_narrowed += 1;
        }
        handlers.push(handler);
    }

    let mut validated = BTreeSet::new();
    for handler in &handlers {
        let catch = handler
            .catch
            .and_then(|c| unit.str_constant(c))
            .unwrap_or(kinds::FAULT);
        if policy.needs_validation(catch) {
            validated.insert(handler.target);
            stats.handlers_validated += 1;
        }
    }

    let mut prologue = vec![Insn::EnterCheck];
    if let Some(self_ref) = sync_ref {
        prologue.extend([Insn::UnitRef(self_ref), Insn::TaskMonitorEnter]);
    }
    let prologue_len = encoded_len(&prologue);

    let mut groups: Vec<Vec<Insn>> = Vec::with_capacity(body.len());
    for (offset, insn) in &body {
        let mut group = Vec::with_capacity(1);
        if validated.contains(offset) {
            group.push(Insn::ValidateCaught);
        }
        match *insn {
            Insn::MonitorEnter => {
                group.push(Insn::TaskMonitorEnter);
                stats.monitors_redirected += 1;
            }
            Insn::MonitorExit => {
                group.push(Insn::TaskMonitorExit);
                stats.monitors_redirected += 1;
            }
            Insn::Invoke { target, .. }
                if context == RewriteContext::Untrusted
                    && unit
                        .str_constant(target)
                        .is_some_and(|t| policy.is_forbidden_call(t)) =>
            {
                group.push(Insn::Trap(target));
                group.push(*insn);
                stats.traps_inserted += 1;
            }
            Insn::Return => {
                if let Some(self_ref) = sync_ref {
                    group.extend([Insn::UnitRef(self_ref), Insn::TaskMonitorExit]);
                }
                group.push(Insn::Return);
            }
            other => group.push(other),
        }
        groups.push(group);
    }

    let mut offsets = HashMap::with_capacity(body.len() + 1);
    let mut at = prologue_len;
    for ((old, _), group) in body.iter().zip(&groups) {
        offsets.insert(*old, at);
        at += encoded_len(group);
    }
    let body_end = at;
    offsets.insert(code_len, body_end);
    // Offsets of validated input are instruction boundaries or the code end
    let remap = |old: u32| offsets.get(&old).copied().unwrap_or(old);

    let mut code = encode_all(&prologue);
    for insn in groups.iter().flatten() {
        let insn = match insn.jump_target() {
            Some(target) => insn.with_jump_target(remap(target)),
            None => *insn,
        };
        insn.encode(&mut code);
    }

    let mut handlers: Vec<Handler> = handlers
        .into_iter()
        .map(|h| Handler {
            start: remap(h.start),
            end: remap(h.end),
            target: remap(h.target),
            catch: h.catch,
        })
        .collect();

    if let Some(self_ref) = sync_ref {
        handlers.push(Handler {
            start: prologue_len,
            end: body_end,
            target: body_end,
            catch: None,
        });
        for insn in [Insn::UnitRef(self_ref), Insn::TaskMonitorExit, Insn::Rethrow] {
            insn.encode(&mut code);
        }
        method.flags &= !Method::SYNCHRONIZED;
        stats.synchronized_methods += 1;
    }

    method.code = code;
    method.handlers = handlers;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::assembler::UnitBuilder;
    use crate::bytecode::Constant;

    fn instrument(unit: &Unit, context: RewriteContext) -> (Method, RewriteStats) {
        let policy = PermissionPolicy::permissive();
        let mut method = unit.methods[0].clone();
        let self_ref = unit
            .constants
            .iter()
            .position(|c| *c == Constant::Str(unit.name.clone()))
            .map(|i| i as u16);
        let stats = instrument_method(unit, &mut method, &policy, context, self_ref).unwrap();
        (method, stats)
    }

    #[test]
    fn test_jumps_are_remapped_past_inserted_code() {
        let unit = UnitBuilder::new("app")
            .method("main", 0, 0, |m| {
                let top = m.label();
                m.mark(top).op(Insn::MonitorEnter).jump(top);
            })
            .build()
            .unwrap();

        let (method, stats) = instrument(&unit, RewriteContext::Untrusted);
        let decoded = decode_all(&method.code).unwrap();
        assert_eq!(
            decoded,
            vec![
                (0, Insn::EnterCheck),
                (1, Insn::TaskMonitorEnter),
                (2, Insn::Jump(1)),
            ]
        );
        assert_eq!(stats.monitors_redirected, 1);
    }

    #[test]
    fn test_forbidden_call_trapped_only_for_untrusted() {
        let unit = UnitBuilder::new("app")
            .method("main", 0, 0, |m| {
                m.int(0).invoke("host.system::exit", 1).op(Insn::Return);
            })
            .build()
            .unwrap();

        let (method, stats) = instrument(&unit, RewriteContext::Untrusted);
        assert_eq!(stats.traps_inserted, 1);
        let decoded = decode_all(&method.code).unwrap();
        assert!(matches!(decoded[2].1, Insn::Trap(_)));

        let (_, stats) = instrument(&unit, RewriteContext::Reloaded);
        assert_eq!(stats.traps_inserted, 0);
    }

    #[test]
    fn test_handler_starting_at_target_is_dropped() {
        let unit = UnitBuilder::new("app")
            .method("main", 0, 0, |m| {
                let (start, end) = (m.label(), m.label());
                m.mark(start).op(Insn::Null).op(Insn::Pop);
                m.mark(end).op(Insn::Null).op(Insn::Return);
                m.try_region(start, end, start, None);
            })
            .build()
            .unwrap();

        let (method, stats) = instrument(&unit, RewriteContext::Untrusted);
        assert_eq!(stats.handlers_dropped, 1);
        assert!(method.handlers.is_empty());
    }
}
