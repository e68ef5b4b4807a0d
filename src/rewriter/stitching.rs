//! Host interfaces that sandboxed classes keep implementing, so the host can
//! hold and call instances directly. Where the sandboxed method signature
//! drifted from the host one, a bridge converts back.

use anyhow::Result;

use crate::classfile::code::{load_opcode, return_opcode, Insn};
use crate::classfile::{ConstantPool, MemberInfo, ACC_BRIDGE, ACC_PUBLIC, ACC_SYNTHETIC};
use crate::descriptor::{slot_size, split_method_descriptor};
use crate::emitters::{FROM_DJVM, TO_DJVM};
use crate::ir::ClassRepresentation;
use crate::opcodes;
use crate::remapper::ClassResolver;

use super::reset::code_attribute;

const HOST_STRING: &str = "Ljava/lang/String;";

struct StitchedInterface {
    host: &'static str,
    /// Methods needing a bridge, by name and host descriptor.
    bridges: &'static [(&'static str, &'static str)],
}

const STITCHED_INTERFACES: [StitchedInterface; 4] = [
    StitchedInterface {
        host: "java/lang/Comparable",
        bridges: &[],
    },
    StitchedInterface {
        host: "java/lang/Runnable",
        bridges: &[],
    },
    StitchedInterface {
        host: "java/util/function/Function",
        bridges: &[],
    },
    StitchedInterface {
        host: "java/lang/CharSequence",
        bridges: &[
            ("toString", "()Ljava/lang/String;"),
            ("subSequence", "(II)Ljava/lang/CharSequence;"),
        ],
    },
];

pub(super) struct StitchScope<'a> {
    pub(super) resolver: &'a ClassResolver,
    pub(super) class: &'a ClassRepresentation,
    pub(super) sandbox_name: &'a str,
}

/// Add stitched host interfaces and their bridges. Returns whether the
/// class changed.
pub(super) fn stitch(
    scope: &StitchScope<'_>,
    pool: &mut ConstantPool,
    interfaces: &mut Vec<u16>,
    methods: &mut Vec<MemberInfo>,
) -> Result<bool> {
    let mut changed = false;
    for stitched in &STITCHED_INTERFACES {
        if !scope.class.interfaces.iter().any(|name| name == stitched.host)
            || !scope.resolver.is_mapped(stitched.host)
        {
            continue;
        }
        let host = pool.add_class(stitched.host)?;
        if !interfaces.contains(&host) {
            interfaces.push(host);
            changed = true;
        }
        if scope.class.is_interface() {
            continue;
        }
        for (name, host_descriptor) in stitched.bridges {
            let mapped = scope.resolver.resolve_descriptor(host_descriptor);
            if mapped == *host_descriptor || scope.class.member(name, host_descriptor).is_none() {
                continue;
            }
            methods.push(bridge(scope, pool, name, host_descriptor, &mapped)?);
            changed = true;
        }
    }
    Ok(changed)
}

fn bridge(
    scope: &StitchScope<'_>,
    pool: &mut ConstantPool,
    name: &str,
    host_descriptor: &str,
    mapped_descriptor: &str,
) -> Result<MemberInfo> {
    let (arguments, host_return) = split_method_descriptor(host_descriptor)?;
    let mut insns = vec![Insn::Local {
        opcode: opcodes::ALOAD,
        index: 0,
    }];
    let mut slot = 1u16;
    for argument in &arguments {
        insns.push(Insn::Local {
            opcode: load_opcode(argument),
            index: slot,
        });
        if *argument == HOST_STRING {
            insns.push(call(pool, TO_DJVM.owner, TO_DJVM.name, TO_DJVM.descriptor)?);
        }
        slot += slot_size(argument);
    }
    insns.push(Insn::Indexed {
        opcode: opcodes::INVOKEVIRTUAL,
        index: pool.add_method_ref(scope.sandbox_name, name, mapped_descriptor, false)?,
    });
    if host_return == HOST_STRING {
        insns.push(call(pool, FROM_DJVM.owner, FROM_DJVM.name, FROM_DJVM.descriptor)?);
    } else if let Some(class_name) = host_return
        .strip_prefix('L')
        .and_then(|value| value.strip_suffix(';'))
    {
        if scope.resolver.is_mapped(class_name) {
            insns.push(Insn::Indexed {
                opcode: opcodes::CHECKCAST,
                index: pool.add_class(class_name)?,
            });
        }
    }
    insns.push(Insn::Simple(return_opcode(host_return)));

    Ok(MemberInfo {
        access_flags: ACC_PUBLIC | ACC_SYNTHETIC | ACC_BRIDGE,
        name_index: pool.add_utf8(name)?,
        descriptor_index: pool.add_utf8(host_descriptor)?,
        attributes: vec![code_attribute(
            pool,
            insns,
            slot.max(slot_size(host_return)),
            slot,
        )?],
    })
}

fn call(pool: &mut ConstantPool, owner: &str, name: &str, descriptor: &str) -> Result<Insn> {
    Ok(Insn::invoke_static(pool.add_method_ref(owner, name, descriptor, false)?))
}
