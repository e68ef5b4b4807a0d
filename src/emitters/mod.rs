//! Instruction emitters.
//!
//! Every original instruction becomes a [`Block`]; emitters run over it in
//! priority order and may inject code before or after the instruction,
//! replace it, or suppress it. Tracing runs first so that a recorded jump
//! or call is counted before any later emitter rewrites it.

use std::collections::HashMap;

use anyhow::Result;

use crate::analysis::configuration::AnalysisConfiguration;
use crate::classfile::code::{Block, Insn};
use crate::classfile::ConstantPool;
use crate::instruction::InstructionView;
use crate::ir::{ClassRepresentation, Member};
use crate::opcodes;

mod defaults;
mod exceptions;
mod metering;

pub const PRIORITY_TRACING: u8 = 0;
pub const PRIORITY_EXCEPTIONS: u8 = 1;
pub const PRIORITY_DEFAULT: u8 = 2;
pub const PRIORITY_AFTER_INVOKE: u8 = 3;

/// Static method on one of the runtime support classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RuntimeHook {
    pub(crate) owner: &'static str,
    pub(crate) name: &'static str,
    pub(crate) descriptor: &'static str,
}

pub(crate) const RUNTIME_COST_ACCOUNTER: &str = "sandbox/RuntimeCostAccounter";
pub(crate) const DJVM: &str = "sandbox/java/lang/DJVM";

pub(crate) const RECORD_ALLOCATION: RuntimeHook = RuntimeHook {
    owner: RUNTIME_COST_ACCOUNTER,
    name: "recordAllocation",
    descriptor: "(Ljava/lang/String;)V",
};
pub(crate) const RECORD_ARRAY_ALLOCATION: RuntimeHook = RuntimeHook {
    owner: RUNTIME_COST_ACCOUNTER,
    name: "recordArrayAllocation",
    descriptor: "(II)V",
};
pub(crate) const RECORD_INVOCATION: RuntimeHook = RuntimeHook {
    owner: RUNTIME_COST_ACCOUNTER,
    name: "recordInvocation",
    descriptor: "()V",
};
pub(crate) const RECORD_JUMP: RuntimeHook = RuntimeHook {
    owner: RUNTIME_COST_ACCOUNTER,
    name: "recordJump",
    descriptor: "()V",
};
pub(crate) const RECORD_THROW: RuntimeHook = RuntimeHook {
    owner: RUNTIME_COST_ACCOUNTER,
    name: "recordThrow",
    descriptor: "()V",
};
pub(crate) const CHECK_CATCH: RuntimeHook = RuntimeHook {
    owner: DJVM,
    name: "checkCatch",
    descriptor: "(Ljava/lang/Object;)V",
};
pub(crate) const FAIL: RuntimeHook = RuntimeHook {
    owner: DJVM,
    name: "fail",
    descriptor: "(Ljava/lang/String;)Ljava/lang/Error;",
};
pub(crate) const TO_DJVM: RuntimeHook = RuntimeHook {
    owner: DJVM,
    name: "toDJVM",
    descriptor: "(Ljava/lang/String;)Lsandbox/java/lang/String;",
};
pub(crate) const FROM_DJVM: RuntimeHook = RuntimeHook {
    owner: DJVM,
    name: "fromDJVM",
    descriptor: "(Lsandbox/java/lang/String;)Ljava/lang/String;",
};
pub(crate) const REGISTER_RESET: RuntimeHook = RuntimeHook {
    owner: DJVM,
    name: "registerReset",
    descriptor: "(Ljava/lang/String;)V",
};

/// Closed set of instruction emitters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Emitter {
    TraceInvocations,
    TraceJumps,
    TraceThrows,
    TraceAllocations,
    HandleExceptionUnwrapper,
    IgnoreSynchronizedBlocks,
    IgnoreBreakpoints,
    AlwaysInheritFromSandboxedObject,
    DisallowNonDeterministicMethods,
    StringConstantWrapper,
    ArgumentUnwrapper,
    ReturnTypeWrapper,
}

impl Emitter {
    pub fn name(&self) -> &'static str {
        match self {
            Emitter::TraceInvocations => "TraceInvocations",
            Emitter::TraceJumps => "TraceJumps",
            Emitter::TraceThrows => "TraceThrows",
            Emitter::TraceAllocations => "TraceAllocations",
            Emitter::HandleExceptionUnwrapper => "HandleExceptionUnwrapper",
            Emitter::IgnoreSynchronizedBlocks => "IgnoreSynchronizedBlocks",
            Emitter::IgnoreBreakpoints => "IgnoreBreakpoints",
            Emitter::AlwaysInheritFromSandboxedObject => "AlwaysInheritFromSandboxedObject",
            Emitter::DisallowNonDeterministicMethods => "DisallowNonDeterministicMethods",
            Emitter::StringConstantWrapper => "StringConstantWrapper",
            Emitter::ArgumentUnwrapper => "ArgumentUnwrapper",
            Emitter::ReturnTypeWrapper => "ReturnTypeWrapper",
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Emitter::TraceInvocations
            | Emitter::TraceJumps
            | Emitter::TraceThrows
            | Emitter::TraceAllocations => PRIORITY_TRACING,
            Emitter::HandleExceptionUnwrapper => PRIORITY_EXCEPTIONS,
            Emitter::ReturnTypeWrapper => PRIORITY_AFTER_INVOKE,
            _ => PRIORITY_DEFAULT,
        }
    }

    pub fn is_tracing(&self) -> bool {
        self.priority() == PRIORITY_TRACING
    }

    pub(crate) fn emit(
        &self,
        context: &mut EmitterContext<'_>,
        site: &Site<'_>,
        block: &mut Block,
    ) -> Result<()> {
        match self {
            Emitter::TraceInvocations => metering::trace_invocation(context, site, block),
            Emitter::TraceJumps => metering::trace_jump(context, site, block),
            Emitter::TraceThrows => metering::trace_throw(context, site, block),
            Emitter::TraceAllocations => metering::trace_allocation(context, site, block),
            Emitter::HandleExceptionUnwrapper => exceptions::unwrap_at_handler(context, site, block),
            Emitter::IgnoreSynchronizedBlocks => defaults::ignore_monitors(site, block),
            Emitter::IgnoreBreakpoints => defaults::ignore_breakpoint(site, block),
            Emitter::AlwaysInheritFromSandboxedObject => {
                defaults::inherit_from_sandboxed_object(context, site, block)
            }
            Emitter::DisallowNonDeterministicMethods => {
                defaults::redirect_non_deterministic(context, site, block)
            }
            Emitter::StringConstantWrapper => defaults::wrap_string_constant(context, site, block),
            Emitter::ArgumentUnwrapper => defaults::unwrap_arguments(context, site, block),
            Emitter::ReturnTypeWrapper => defaults::wrap_return_value(context, site, block),
        }
    }
}

/// Emitters in priority order. Tracing emitters are left out when
/// instrumentation is disabled.
pub fn default_emitters(tracing: bool) -> Vec<Emitter> {
    let mut emitters = Vec::new();
    if tracing {
        emitters.extend([
            Emitter::TraceInvocations,
            Emitter::TraceJumps,
            Emitter::TraceThrows,
            Emitter::TraceAllocations,
        ]);
    }
    emitters.extend([
        Emitter::HandleExceptionUnwrapper,
        Emitter::IgnoreSynchronizedBlocks,
        Emitter::IgnoreBreakpoints,
        Emitter::AlwaysInheritFromSandboxedObject,
        Emitter::DisallowNonDeterministicMethods,
        Emitter::StringConstantWrapper,
        Emitter::ArgumentUnwrapper,
        Emitter::ReturnTypeWrapper,
    ]);
    emitters
}

/// Stable sort by priority; emitters sharing a priority keep their order.
pub(crate) fn by_priority(emitters: &[Emitter]) -> Vec<Emitter> {
    let mut sorted = emitters.to_vec();
    sorted.sort_by_key(Emitter::priority);
    sorted
}

/// Instruction an emitter is looking at.
pub(crate) struct Site<'a> {
    pub(crate) offset: u32,
    pub(crate) view: &'a InstructionView,
}

/// Per-method state shared by the emitters.
pub(crate) struct EmitterContext<'a> {
    pub(crate) configuration: &'a AnalysisConfiguration,
    /// Class after definition providers ran.
    pub(crate) class: &'a ClassRepresentation,
    pub(crate) member: &'a Member,
    /// Pool receiving the constants injected code refers to.
    pub(crate) pool: &'a mut ConstantPool,
    /// Handler offset to the catch types of every exception table entry
    /// jumping there; `None` catches anything.
    pub(crate) handlers: &'a HashMap<u32, Vec<Option<String>>>,
    /// `new java/lang/Object` seen but not yet initialized.
    pub(crate) pending_object_news: usize,
    /// Largest operand stack growth any injection needs.
    pub(crate) extra_stack: u16,
}

impl<'a> EmitterContext<'a> {
    pub(crate) fn new(
        configuration: &'a AnalysisConfiguration,
        class: &'a ClassRepresentation,
        member: &'a Member,
        pool: &'a mut ConstantPool,
        handlers: &'a HashMap<u32, Vec<Option<String>>>,
    ) -> Self {
        Self {
            configuration,
            class,
            member,
            pool,
            handlers,
            pending_object_news: 0,
            extra_stack: 0,
        }
    }

    pub(crate) fn require_stack(&mut self, slots: u16) {
        self.extra_stack = self.extra_stack.max(slots);
    }

    pub(crate) fn call(&mut self, hook: RuntimeHook) -> Result<Insn> {
        let index = self
            .pool
            .add_method_ref(hook.owner, hook.name, hook.descriptor, false)?;
        Ok(Insn::invoke_static(index))
    }

    pub(crate) fn load_string(&mut self, value: &str) -> Result<Insn> {
        Ok(Insn::Ldc(self.pool.add_string(value)?))
    }

    pub(crate) fn push_int(&mut self, value: i32) -> Result<Insn> {
        Ok(match value {
            -1..=5 => Insn::Simple((opcodes::ICONST_0 as i32 + value) as u8),
            value if i8::try_from(value).is_ok() => Insn::Bipush(value as i8),
            value if i16::try_from(value).is_ok() => Insn::Sipush(value as i16),
            value => Insn::Ldc(self.pool.add_integer(value)?),
        })
    }

    /// Whether `java/lang/String` values inside the sandbox are shadow objects.
    pub(crate) fn strings_are_sandboxed(&self) -> bool {
        self.configuration.class_resolver.is_mapped("java/lang/String")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use super::*;
    use crate::classfile::builder::ClassBuilder;
    use crate::classfile::code::{decode, Block};
    use crate::classfile::attributes::{self, CodeAttribute, parse_bootstrap_methods};
    use crate::rules::test_support::configuration;

    /// Blocks and stack growth after running emitters over the code of one
    /// method, plus the pool the injections went into.
    pub(crate) struct Emitted {
        pub(crate) blocks: Vec<Block>,
        pub(crate) pool: ConstantPool,
        pub(crate) extra_stack: u16,
    }

    pub(crate) fn emit(
        builder: ClassBuilder,
        method: (&str, &str),
        emitters: &[Emitter],
        handlers: HashMap<u32, Vec<Option<String>>>,
    ) -> Emitted {
        let configuration = configuration();
        let class_file = builder.build_class_file();
        let class = ClassRepresentation::from_class_file(&class_file).expect("representation");
        let class = crate::providers::apply_providers(
            &configuration,
            &crate::providers::default_class_providers(),
            &[],
            &class,
        );
        let member = class.member(method.0, method.1).expect("member").clone();
        let info = class_file
            .methods
            .iter()
            .find(|info| info.name(&class_file.constant_pool).ok() == Some(method.0))
            .expect("method");
        let code_attribute = class_file
            .find_attribute(&info.attributes, attributes::CODE)
            .expect("code");
        let code = CodeAttribute::parse(&code_attribute.info).expect("parse code");
        let bootstrap_methods = match class_file
            .find_attribute(&class_file.attributes, attributes::BOOTSTRAP_METHODS)
        {
            Some(attribute) => parse_bootstrap_methods(&attribute.info).expect("bootstrap"),
            None => Vec::new(),
        };
        let original = class_file.constant_pool.clone();
        let mut pool = original.clone();
        let mut blocks = Vec::new();
        let extra_stack;
        {
            let mut context = EmitterContext::new(&configuration, &class, &member, &mut pool, &handlers);
            for instruction in decode(&code.code).expect("decode") {
                let view = InstructionView::resolve(&instruction.insn, &original, &bootstrap_methods)
                    .expect("view");
                let site = Site {
                    offset: instruction.offset,
                    view: &view,
                };
                let mut block = Block::original(&instruction);
                for emitter in by_priority(emitters) {
                    emitter.emit(&mut context, &site, &mut block).expect("emit");
                }
                blocks.push(block);
            }
            extra_stack = context.extra_stack;
        }
        Emitted {
            blocks,
            pool,
            extra_stack,
        }
    }

    /// Names of static methods invoked by injected instructions.
    pub(crate) fn invoked(pool: &ConstantPool, insns: &[Insn]) -> Vec<String> {
        insns
            .iter()
            .filter_map(|insn| match insn {
                Insn::Indexed { opcode, index } if crate::opcodes::is_invoke(*opcode) => {
                    pool.member_ref(*index)
                        .ok()
                        .map(|member| format!("{}.{}", member.owner, member.name))
                }
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitters_are_ordered_by_priority() {
        let sorted = by_priority(&[
            Emitter::ReturnTypeWrapper,
            Emitter::IgnoreBreakpoints,
            Emitter::TraceJumps,
            Emitter::HandleExceptionUnwrapper,
        ]);

        assert_eq!(
            sorted,
            vec![
                Emitter::TraceJumps,
                Emitter::HandleExceptionUnwrapper,
                Emitter::IgnoreBreakpoints,
                Emitter::ReturnTypeWrapper,
            ]
        );
    }

    #[test]
    fn tracing_can_be_left_out() {
        assert!(default_emitters(false).iter().all(|emitter| !emitter.is_tracing()));
        assert_eq!(
            default_emitters(true).iter().filter(|emitter| emitter.is_tracing()).count(),
            4
        );
    }
}
