use anyhow::Result;

use crate::classfile::code::{Block, Insn};
use crate::emitters::{EmitterContext, Site, CHECK_CATCH};
use crate::opcodes;
use crate::rules::instruction_rules::BLACKLISTED_EXCEPTIONS;

/// At the entry of a handler that could intercept a sandbox termination
/// error, hand the caught value to the runtime so it can rethrow it. The
/// injected `dup; invokestatic` leaves the stack as it was.
pub(super) fn unwrap_at_handler(
    context: &mut EmitterContext<'_>,
    site: &Site<'_>,
    block: &mut Block,
) -> Result<()> {
    let Some(catch_types) = context.handlers.get(&site.offset) else {
        return Ok(());
    };
    let mut intercepts = false;
    for catch_type in catch_types {
        let Some(catch_type) = catch_type else {
            intercepts = true;
            break;
        };
        for blacklisted in BLACKLISTED_EXCEPTIONS {
            if context
                .configuration
                .hierarchy
                .is_assignable_from(catch_type, blacklisted)?
            {
                intercepts = true;
                break;
            }
        }
        if intercepts {
            break;
        }
    }
    if intercepts {
        block.before.insert(0, context.call(CHECK_CATCH)?);
        block.before.insert(0, Insn::Simple(opcodes::DUP));
        context.require_stack(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::classfile::builder::ClassBuilder;
    use crate::classfile::code::Insn;
    use crate::classfile::ACC_PUBLIC;
    use crate::emitters::test_support::{emit, invoked};
    use crate::emitters::Emitter;
    use crate::opcodes;

    fn guarded() -> ClassBuilder {
        // try { helper(); } catch (...) { return; }
        ClassBuilder::new("com/example/Task").method(ACC_PUBLIC, "run", "()V", |code| {
            code.label(0)
                .invoke_static("com/example/Task", "helper", "()V")
                .label(1)
                .op_return()
                .label(2)
                .op(opcodes::POP)
                .op_return()
        })
    }

    fn run_with(catch_type: Option<&str>) -> Vec<Vec<Insn>> {
        // handler is the `pop` at offset 4
        let handlers = HashMap::from([(4u32, vec![catch_type.map(|name| name.to_string())])]);
        emit(
            guarded(),
            ("run", "()V"),
            &[Emitter::HandleExceptionUnwrapper],
            handlers,
        )
        .blocks
        .into_iter()
        .map(|block| block.before)
        .collect()
    }

    #[test]
    fn broad_handlers_check_the_caught_value() {
        for catch_type in [Some("java/lang/Throwable"), Some("java/lang/Error"), None] {
            let emitted = emit(
                guarded(),
                ("run", "()V"),
                &[Emitter::HandleExceptionUnwrapper],
                HashMap::from([(4u32, vec![catch_type.map(|name| name.to_string())])]),
            );
            let handler = &emitted.blocks[2];
            assert_eq!(handler.before[0], Insn::Simple(opcodes::DUP));
            assert_eq!(
                invoked(&emitted.pool, &handler.before),
                vec!["sandbox/java/lang/DJVM.checkCatch"]
            );
            assert_eq!(emitted.extra_stack, 1);
        }
    }

    #[test]
    fn narrow_handlers_are_left_alone() {
        let prefixes = run_with(Some("java/lang/RuntimeException"));

        assert!(prefixes.iter().all(|before| before.is_empty()));
    }
}
