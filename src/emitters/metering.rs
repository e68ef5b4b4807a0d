//! Cost-accounting instrumentation.

use anyhow::Result;

use crate::classfile::code::{Block, Insn};
use crate::costing::{allocation_size, primitive_width};
use crate::emitters::{
    EmitterContext, Site, RECORD_ALLOCATION, RECORD_ARRAY_ALLOCATION, RECORD_INVOCATION,
    RECORD_JUMP, RECORD_THROW,
};
use crate::instruction::InstructionView;
use crate::opcodes;

pub(super) fn trace_invocation(
    context: &mut EmitterContext<'_>,
    site: &Site<'_>,
    block: &mut Block,
) -> Result<()> {
    if matches!(site.view, InstructionView::Invoke { .. } | InstructionView::InvokeDynamic { .. }) {
        block.before.push(context.call(RECORD_INVOCATION)?);
    }
    Ok(())
}

pub(super) fn trace_jump(
    context: &mut EmitterContext<'_>,
    site: &Site<'_>,
    block: &mut Block,
) -> Result<()> {
    if matches!(site.view, InstructionView::Jump { .. } | InstructionView::Switch) {
        block.before.push(context.call(RECORD_JUMP)?);
    }
    Ok(())
}

pub(super) fn trace_throw(
    context: &mut EmitterContext<'_>,
    site: &Site<'_>,
    block: &mut Block,
) -> Result<()> {
    if matches!(site.view, InstructionView::Throw) {
        block.before.push(context.call(RECORD_THROW)?);
    }
    Ok(())
}

pub(super) fn trace_allocation(
    context: &mut EmitterContext<'_>,
    site: &Site<'_>,
    block: &mut Block,
) -> Result<()> {
    match site.view {
        InstructionView::Type {
            opcode: opcodes::NEW,
            class_name,
        } => {
            // ldc name; invokestatic recordAllocation
            block.before.push(context.load_string(class_name)?);
            block.before.push(context.call(RECORD_ALLOCATION)?);
            context.require_stack(1);
        }
        InstructionView::Type {
            opcode: opcodes::ANEWARRAY,
            class_name,
        } => {
            record_array(context, block, allocation_size(class_name))?;
        }
        InstructionView::NewArray { atype } => {
            record_array(context, block, primitive_width(*atype))?;
        }
        InstructionView::MultiANewArray { descriptor, .. } => {
            block.before.push(context.load_string(descriptor)?);
            block.before.push(context.call(RECORD_ALLOCATION)?);
            context.require_stack(1);
        }
        _ => {}
    }
    Ok(())
}

/// The array length is already on the stack: duplicate it and pass it on
/// together with the element size.
fn record_array(context: &mut EmitterContext<'_>, block: &mut Block, element_size: i32) -> Result<()> {
    block.before.push(Insn::Simple(opcodes::DUP));
    block.before.push(context.push_int(element_size)?);
    block.before.push(context.call(RECORD_ARRAY_ALLOCATION)?);
    context.require_stack(2);
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

    const TRACING: [Emitter; 4] = [
        Emitter::TraceInvocations,
        Emitter::TraceJumps,
        Emitter::TraceThrows,
        Emitter::TraceAllocations,
    ];

    #[test]
    fn calls_jumps_and_throws_are_recorded_before_the_instruction() {
        let builder = ClassBuilder::new("com/example/Task").method(ACC_PUBLIC, "run", "(I)V", |code| {
            code.load(opcodes::ILOAD, 1)
                .jump(opcodes::IFEQ, 1)
                .invoke_static("com/example/Task", "helper", "()V")
                .new_object("java/lang/RuntimeException")
                .op(opcodes::DUP)
                .invoke_special("java/lang/RuntimeException", "<init>", "()V")
                .op(opcodes::ATHROW)
                .label(1)
                .op_return()
        });

        let emitted = emit(builder, ("run", "(I)V"), &TRACING, HashMap::new());
        let hooks: Vec<String> = emitted
            .blocks
            .iter()
            .flat_map(|block| invoked(&emitted.pool, &block.before))
            .collect();

        assert_eq!(
            hooks,
            vec![
                "sandbox/RuntimeCostAccounter.recordJump",
                "sandbox/RuntimeCostAccounter.recordInvocation",
                "sandbox/RuntimeCostAccounter.recordAllocation",
                "sandbox/RuntimeCostAccounter.recordInvocation",
                "sandbox/RuntimeCostAccounter.recordThrow",
            ]
        );
        assert_eq!(emitted.extra_stack, 1);
    }

    #[test]
    fn primitive_arrays_record_length_and_element_width() {
        let builder = ClassBuilder::new("com/example/Task").method(ACC_PUBLIC, "run", "()[J", |code| {
            code.bipush(10).new_array(opcodes::T_LONG).op(opcodes::ARETURN)
        });

        let emitted = emit(builder, ("run", "()[J"), &TRACING, HashMap::new());
        let allocation = &emitted.blocks[1];

        assert_eq!(allocation.before[0], Insn::Simple(opcodes::DUP));
        assert_eq!(allocation.before[1], Insn::Bipush(8));
        assert_eq!(
            invoked(&emitted.pool, &allocation.before),
            vec!["sandbox/RuntimeCostAccounter.recordArrayAllocation"]
        );
        assert_eq!(allocation.body, vec![Insn::NewArray(opcodes::T_LONG)]);
        assert_eq!(emitted.extra_stack, 2);
    }
}
