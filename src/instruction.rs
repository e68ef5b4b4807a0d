//! Resolved view of one instruction, shared by the rules and the emitters.

use anyhow::{Context, Result};

use crate::classfile::attributes::BootstrapMethod;
use crate::classfile::code::Insn;
use crate::classfile::{Constant, ConstantPool, MemberRef};
use crate::opcodes;

/// Method handle constant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handle {
    pub(crate) kind: u8,
    pub(crate) member: MemberRef,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum InstructionView {
    Invoke {
        opcode: u8,
        member: MemberRef,
    },
    Field {
        opcode: u8,
        member: MemberRef,
    },
    /// `new`, `anewarray`, `checkcast` or `instanceof`.
    Type {
        opcode: u8,
        class_name: String,
    },
    NewArray {
        atype: u8,
    },
    MultiANewArray {
        descriptor: String,
        dimensions: u8,
    },
    InvokeDynamic {
        bootstrap: Handle,
        name: String,
        descriptor: String,
    },
    LoadString(String),
    LoadConstant,
    Jump {
        opcode: u8,
    },
    Switch,
    Throw,
    MonitorEnter,
    MonitorExit,
    Breakpoint,
    Return {
        opcode: u8,
    },
    Other {
        opcode: u8,
    },
    /// Exception table entry; `None` catches anything.
    TryCatch {
        catch_type: Option<String>,
    },
}

impl InstructionView {
    pub(crate) fn resolve(
        insn: &Insn,
        pool: &ConstantPool,
        bootstrap_methods: &[BootstrapMethod],
    ) -> Result<Self> {
        Ok(match insn {
            Insn::Indexed { opcode, index } => match *opcode {
                opcodes::GETSTATIC | opcodes::PUTSTATIC | opcodes::GETFIELD | opcodes::PUTFIELD => {
                    InstructionView::Field {
                        opcode: *opcode,
                        member: pool.member_ref(*index)?,
                    }
                }
                opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => {
                    InstructionView::Invoke {
                        opcode: *opcode,
                        member: pool.member_ref(*index)?,
                    }
                }
                _ => InstructionView::Type {
                    opcode: *opcode,
                    class_name: pool.class_name(*index)?.to_string(),
                },
            },
            Insn::InvokeInterface { index, .. } => InstructionView::Invoke {
                opcode: opcodes::INVOKEINTERFACE,
                member: pool.member_ref(*index)?,
            },
            Insn::InvokeDynamic(index) => {
                let (bootstrap_index, name_and_type_index) = match pool.get(*index)? {
                    Constant::InvokeDynamic {
                        bootstrap_method_attr_index,
                        name_and_type_index,
                    } => (*bootstrap_method_attr_index, *name_and_type_index),
                    other => anyhow::bail!("invokedynamic refers to {:?}", other),
                };
                let bootstrap = bootstrap_methods
                    .get(bootstrap_index as usize)
                    .with_context(|| format!("missing bootstrap method {}", bootstrap_index))?;
                let (name, descriptor) = pool.name_and_type(name_and_type_index)?;
                InstructionView::InvokeDynamic {
                    bootstrap: resolve_handle(pool, bootstrap.method_ref)?,
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                }
            }
            Insn::NewArray(atype) => InstructionView::NewArray { atype: *atype },
            Insn::MultiANewArray { index, dimensions } => InstructionView::MultiANewArray {
                descriptor: pool.class_name(*index)?.to_string(),
                dimensions: *dimensions,
            },
            Insn::Ldc(index) => match pool.string_literal(*index)? {
                Some(value) => InstructionView::LoadString(value.to_string()),
                None => InstructionView::LoadConstant,
            },
            Insn::Ldc2(_) => InstructionView::LoadConstant,
            Insn::Jump { opcode, .. } => InstructionView::Jump { opcode: *opcode },
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => InstructionView::Switch,
            other => match other.opcode() {
                opcodes::ATHROW => InstructionView::Throw,
                opcodes::MONITORENTER => InstructionView::MonitorEnter,
                opcodes::MONITOREXIT => InstructionView::MonitorExit,
                opcodes::BREAKPOINT => InstructionView::Breakpoint,
                opcode if opcodes::is_return(opcode) => InstructionView::Return { opcode },
                opcode => InstructionView::Other { opcode },
            },
        })
    }
}

pub(crate) fn resolve_handle(pool: &ConstantPool, index: u16) -> Result<Handle> {
    match pool.get(index)? {
        Constant::MethodHandle {
            reference_kind,
            reference_index,
        } => Ok(Handle {
            kind: *reference_kind,
            member: pool.member_ref(*reference_index)?,
        }),
        other => anyhow::bail!("expected a method handle at {} but found {:?}", index, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_member_and_string_operands() {
        let mut pool = ConstantPool::new();
        let nano_time = pool
            .add_method_ref("java/lang/System", "nanoTime", "()J", false)
            .expect("method ref");
        let greeting = pool.add_string("hello").expect("string");

        let call = InstructionView::resolve(&Insn::invoke_static(nano_time), &pool, &[]).expect("view");
        let load = InstructionView::resolve(&Insn::Ldc(greeting), &pool, &[]).expect("view");
        let throw = InstructionView::resolve(&Insn::Simple(opcodes::ATHROW), &pool, &[]).expect("view");

        let InstructionView::Invoke { member, .. } = &call else {
            panic!("expected an invocation, got {:?}", call);
        };
        assert_eq!(member.name, "nanoTime");
        assert_eq!(load, InstructionView::LoadString("hello".to_string()));
        assert_eq!(throw, InstructionView::Throw);
    }
}
