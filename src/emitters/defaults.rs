use anyhow::Result;

use crate::classfile::code::{default_value, Block, Insn};
use crate::descriptor::{is_constructor, slot_size, split_method_descriptor};
use crate::emitters::{EmitterContext, Site, FAIL, FROM_DJVM, TO_DJVM};
use crate::header::{OBJECT, SANDBOX_OBJECT};
use crate::instruction::InstructionView;
use crate::opcodes;
use crate::rules::instruction_rules::non_deterministic_reason;

const STRING_DESCRIPTOR: &str = "Ljava/lang/String;";

pub(super) fn ignore_monitors(site: &Site<'_>, block: &mut Block) -> Result<()> {
    if matches!(site.view, InstructionView::MonitorEnter | InstructionView::MonitorExit) {
        // The monitor object is still on the stack.
        block.body = vec![Insn::Simple(opcodes::POP)];
    }
    Ok(())
}

pub(super) fn ignore_breakpoint(site: &Site<'_>, block: &mut Block) -> Result<()> {
    if matches!(site.view, InstructionView::Breakpoint) {
        block.body.clear();
    }
    Ok(())
}

/// Constructors of classes moved under the sandboxed object call its
/// constructor instead of `java/lang/Object.<init>`. Calls that initialize
/// a plain `new java/lang/Object` are left alone.
pub(super) fn inherit_from_sandboxed_object(
    context: &mut EmitterContext<'_>,
    site: &Site<'_>,
    block: &mut Block,
) -> Result<()> {
    match site.view {
        InstructionView::Type {
            opcode: opcodes::NEW,
            class_name,
        } if class_name == OBJECT => {
            context.pending_object_news += 1;
        }
        InstructionView::Invoke {
            opcode: opcodes::INVOKESPECIAL,
            member,
        } if member.owner == OBJECT && is_constructor(&member.name) => {
            if context.pending_object_news > 0 {
                context.pending_object_news -= 1;
                return Ok(());
            }
            if is_constructor(&context.member.member_name)
                && context.class.super_name.as_deref() == Some(SANDBOX_OBJECT)
            {
                let index = context
                    .pool
                    .add_method_ref(SANDBOX_OBJECT, &member.name, &member.descriptor, false)?;
                block.body = vec![Insn::Indexed {
                    opcode: opcodes::INVOKESPECIAL,
                    index,
                }];
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace a call that would make execution depend on the host with a call
/// to the runtime's failure hook. The arguments and receiver are popped and
/// a default result is pushed, so the stack shape matches the original call
/// for the verifier even though the hook never returns normally.
pub(super) fn redirect_non_deterministic(
    context: &mut EmitterContext<'_>,
    site: &Site<'_>,
    block: &mut Block,
) -> Result<()> {
    let InstructionView::Invoke { opcode, member } = site.view else {
        return Ok(());
    };
    if non_deterministic_reason(&member.owner, &member.name, &member.descriptor).is_none() {
        return Ok(());
    }
    let (arguments, return_type) = split_method_descriptor(&member.descriptor)?;
    let mut replacement = Vec::with_capacity(arguments.len() + 5);
    for argument in arguments.iter().rev() {
        replacement.push(Insn::Simple(if slot_size(argument) == 2 {
            opcodes::POP2
        } else {
            opcodes::POP
        }));
    }
    if *opcode != opcodes::INVOKESTATIC {
        replacement.push(Insn::Simple(opcodes::POP));
    }
    let message = format!(
        "Disallowed reference to API; {}.{}{}",
        member.owner.replace('/', "."),
        member.name,
        member.descriptor
    );
    replacement.push(context.load_string(&message)?);
    replacement.push(context.call(FAIL)?);
    replacement.push(Insn::Simple(opcodes::POP));
    if return_type != "V" {
        replacement.push(default_value(return_type));
    }
    block.body = replacement;
    context.require_stack(2);
    Ok(())
}

pub(super) fn wrap_string_constant(
    context: &mut EmitterContext<'_>,
    site: &Site<'_>,
    block: &mut Block,
) -> Result<()> {
    if matches!(site.view, InstructionView::LoadString(_)) && context.strings_are_sandboxed() {
        let wrap = context.call(TO_DJVM)?;
        block.after.push(wrap);
    }
    Ok(())
}

/// Calls into whitelisted classes receive host strings: unwrap a trailing
/// string argument before the call.
pub(super) fn unwrap_arguments(
    context: &mut EmitterContext<'_>,
    site: &Site<'_>,
    block: &mut Block,
) -> Result<()> {
    let Some(member) = whitelisted_call(context, site.view) else {
        return Ok(());
    };
    let (arguments, _) = split_method_descriptor(&member.descriptor)?;
    if arguments.last() == Some(&STRING_DESCRIPTOR) {
        let unwrap = context.call(FROM_DJVM)?;
        block.before.push(unwrap);
    }
    Ok(())
}

pub(super) fn wrap_return_value(
    context: &mut EmitterContext<'_>,
    site: &Site<'_>,
    block: &mut Block,
) -> Result<()> {
    let Some(member) = whitelisted_call(context, site.view) else {
        return Ok(());
    };
    let (_, return_type) = split_method_descriptor(&member.descriptor)?;
    if return_type == STRING_DESCRIPTOR {
        let wrap = context.call(TO_DJVM)?;
        block.after.push(wrap);
    }
    Ok(())
}

fn whitelisted_call<'v>(
    context: &EmitterContext<'_>,
    view: &'v InstructionView,
) -> Option<&'v crate::classfile::MemberRef> {
    let InstructionView::Invoke { member, .. } = view else {
        return None;
    };
    if !context.strings_are_sandboxed() {
        return None;
    }
    let resolver = &context.configuration.class_resolver;
    if member.owner.starts_with('[') || !resolver.is_whitelisted(&member.owner) {
        return None;
    }
    Some(member)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::classfile::builder::ClassBuilder;
    use crate::classfile::code::Insn;
    use crate::classfile::{ACC_PUBLIC, ACC_STATIC};
    use crate::emitters::test_support::{emit, invoked};
    use crate::emitters::Emitter;
    use crate::opcodes;

    #[test]
    fn monitors_become_pops_and_breakpoints_vanish() {
        let builder = ClassBuilder::new("com/example/Task").method(ACC_PUBLIC, "run", "()V", |code| {
            code.load(opcodes::ALOAD, 0)
                .op(opcodes::MONITORENTER)
                .load(opcodes::ALOAD, 0)
                .op(opcodes::MONITOREXIT)
                .op(opcodes::BREAKPOINT)
                .op_return()
        });

        let emitted = emit(
            builder,
            ("run", "()V"),
            &[Emitter::IgnoreSynchronizedBlocks, Emitter::IgnoreBreakpoints],
            HashMap::new(),
        );

        assert_eq!(emitted.blocks[1].body, vec![Insn::Simple(opcodes::POP)]);
        assert_eq!(emitted.blocks[3].body, vec![Insn::Simple(opcodes::POP)]);
        assert!(emitted.blocks[4].body.is_empty());
    }

    #[test]
    fn constructors_call_the_sandboxed_object_constructor() {
        let builder = ClassBuilder::new("com/example/Task").method(ACC_PUBLIC, "<init>", "()V", |code| {
            code.call_object_init()
                .new_object("java/lang/Object")
                .op(opcodes::DUP)
                .invoke_special("java/lang/Object", "<init>", "()V")
                .op(opcodes::POP)
                .op_return()
        });

        let emitted = emit(
            builder,
            ("<init>", "()V"),
            &[Emitter::AlwaysInheritFromSandboxedObject],
            HashMap::new(),
        );

        assert_eq!(
            invoked(&emitted.pool, &emitted.blocks[1].body),
            vec!["sandbox/java/lang/Object.<init>"]
        );
        assert_eq!(
            invoked(&emitted.pool, &emitted.blocks[4].body),
            vec!["java/lang/Object.<init>"]
        );
    }

    #[test]
    fn non_deterministic_calls_fail_at_runtime_with_a_balanced_stack() {
        let builder = ClassBuilder::new("com/example/Task").method(
            ACC_PUBLIC | ACC_STATIC,
            "now",
            "()J",
            |code| {
                code.invoke_static("java/lang/System", "currentTimeMillis", "()J")
                    .op(opcodes::LRETURN)
            },
        );

        let emitted = emit(
            builder,
            ("now", "()J"),
            &[Emitter::DisallowNonDeterministicMethods],
            HashMap::new(),
        );
        let body = &emitted.blocks[0].body;

        assert!(matches!(body[0], Insn::Ldc(_)));
        assert_eq!(invoked(&emitted.pool, body), vec!["sandbox/java/lang/DJVM.fail"]);
        assert_eq!(body[2], Insn::Simple(opcodes::POP));
        assert_eq!(body[3], Insn::Simple(opcodes::LCONST_0));
        let Insn::Ldc(index) = body[0] else {
            unreachable!()
        };
        assert_eq!(
            emitted.pool.string_literal(index).expect("literal"),
            Some("Disallowed reference to API; java.lang.System.currentTimeMillis()J")
        );
    }

    #[test]
    fn string_constants_are_wrapped_after_loading() {
        let builder = ClassBuilder::new("com/example/Task").method(
            ACC_PUBLIC | ACC_STATIC,
            "greeting",
            "()Ljava/lang/String;",
            |code| code.ldc_string("hello").op(opcodes::ARETURN),
        );

        let emitted = emit(
            builder,
            ("greeting", "()Ljava/lang/String;"),
            &[Emitter::StringConstantWrapper],
            HashMap::new(),
        );

        assert_eq!(
            invoked(&emitted.pool, &emitted.blocks[0].after),
            vec!["sandbox/java/lang/DJVM.toDJVM"]
        );
    }

    #[test]
    fn whitelisted_calls_unwrap_arguments_and_wrap_results() {
        let builder = ClassBuilder::new("com/example/Task").method(
            ACC_PUBLIC,
            "describe",
            "(Ljava/lang/Object;)Ljava/lang/String;",
            |code| {
                code.load(opcodes::ALOAD, 1)
                    .invoke_virtual("java/lang/Object", "toString", "()Ljava/lang/String;")
                    .op(opcodes::ARETURN)
            },
        );

        let emitted = emit(
            builder,
            ("describe", "(Ljava/lang/Object;)Ljava/lang/String;"),
            &[Emitter::ArgumentUnwrapper, Emitter::ReturnTypeWrapper],
            HashMap::new(),
        );

        assert!(emitted.blocks[1].before.is_empty());
        assert_eq!(
            invoked(&emitted.pool, &emitted.blocks[1].after),
            vec!["sandbox/java/lang/DJVM.toDJVM"]
        );
    }
}
