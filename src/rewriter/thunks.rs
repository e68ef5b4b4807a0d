//! Method handles passed to bootstrap methods that target whitelisted
//! host methods with `java/lang/String` in their signature. The call site
//! sees sandboxed strings, so each such handle is redirected to a static
//! thunk on the class that converts values at the boundary.

use std::collections::HashMap;

use anyhow::Result;
use tracing::debug;

use crate::classfile::attributes::BootstrapMethod;
use crate::classfile::code::{load_opcode, return_opcode, Insn};
use crate::classfile::{
    Constant, ConstantPool, MemberInfo, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC, ACC_SYNTHETIC,
};
use crate::descriptor::{slot_size, split_method_descriptor};
use crate::emitters::{FROM_DJVM, TO_DJVM};
use crate::opcodes;
use crate::remapper::ClassResolver;

use super::reset::code_attribute;

const THUNK_PREFIX: &str = "djvm$thunk$";
const HOST_STRING: &str = "Ljava/lang/String;";

pub(super) struct ThunkScope<'a> {
    pub(super) resolver: &'a ClassResolver,
    pub(super) sandbox_name: &'a str,
    pub(super) is_interface: bool,
}

/// Redirect bootstrap handle arguments through thunks. Returns whether any
/// argument changed.
pub(super) fn generate_thunks(
    scope: &ThunkScope<'_>,
    pool: &mut ConstantPool,
    bootstrap_methods: &mut [BootstrapMethod],
    methods: &mut Vec<MemberInfo>,
) -> Result<bool> {
    let mut replacements: HashMap<u16, u16> = HashMap::new();
    let mut changed = false;
    for bootstrap in bootstrap_methods.iter_mut() {
        for argument in &mut bootstrap.arguments {
            if let Some(replacement) = replacements.get(argument) {
                *argument = *replacement;
                changed = true;
                continue;
            }
            let (kind, reference_index) = match pool.get(*argument)? {
                Constant::MethodHandle {
                    reference_kind,
                    reference_index,
                } => (*reference_kind, *reference_index),
                _ => continue,
            };
            let Some(thunk) = plan(scope, pool, kind, reference_index)? else {
                continue;
            };
            let name = format!("{}{}", THUNK_PREFIX, replacements.len());
            methods.push(build(scope, pool, &name, &thunk)?);
            let target =
                pool.add_method_ref(scope.sandbox_name, &name, &thunk.descriptor, scope.is_interface)?;
            let handle = pool.add(Constant::MethodHandle {
                reference_kind: opcodes::REF_INVOKE_STATIC,
                reference_index: target,
            })?;
            debug!(
                class = scope.sandbox_name,
                thunk = %name,
                target = %thunk.target,
                "redirected bootstrap handle through thunk"
            );
            replacements.insert(*argument, handle);
            *argument = handle;
            changed = true;
        }
    }
    Ok(changed)
}

struct Thunk {
    kind: u8,
    reference_index: u16,
    target: String,
    /// Host descriptors of the receiver (if any) followed by the arguments.
    parameters: Vec<String>,
    host_return: String,
    descriptor: String,
}

fn plan(
    scope: &ThunkScope<'_>,
    pool: &ConstantPool,
    kind: u8,
    reference_index: u16,
) -> Result<Option<Thunk>> {
    if !matches!(
        kind,
        opcodes::REF_INVOKE_VIRTUAL | opcodes::REF_INVOKE_STATIC | opcodes::REF_INVOKE_INTERFACE
    ) {
        return Ok(None);
    }
    let member = pool.member_ref(reference_index)?;
    if !scope.resolver.is_whitelisted(&member.owner) {
        return Ok(None);
    }
    let mapped = scope.resolver.resolve_descriptor(&member.descriptor);
    if mapped == member.descriptor {
        return Ok(None);
    }
    let (arguments, host_return) = split_method_descriptor(&member.descriptor)?;
    // Only strings have a conversion; anything else is left to validation.
    let convertible = arguments
        .iter()
        .chain(std::iter::once(&host_return))
        .all(|descriptor| {
            *descriptor == HOST_STRING || scope.resolver.resolve_descriptor(descriptor) == *descriptor
        });
    if !convertible {
        return Ok(None);
    }

    let mut parameters = Vec::with_capacity(arguments.len() + 1);
    if kind != opcodes::REF_INVOKE_STATIC {
        parameters.push(if member.owner.starts_with('[') {
            member.owner.clone()
        } else {
            format!("L{};", member.owner)
        });
    }
    parameters.extend(arguments.iter().map(|argument| argument.to_string()));
    let descriptor = format!(
        "({}){}",
        parameters
            .iter()
            .map(|parameter| scope.resolver.resolve_descriptor(parameter))
            .collect::<String>(),
        scope.resolver.resolve_descriptor(host_return)
    );
    Ok(Some(Thunk {
        kind,
        reference_index,
        target: format!("{}.{}{}", member.owner, member.name, member.descriptor),
        parameters,
        host_return: host_return.to_string(),
        descriptor,
    }))
}

fn build(
    scope: &ThunkScope<'_>,
    pool: &mut ConstantPool,
    name: &str,
    thunk: &Thunk,
) -> Result<MemberInfo> {
    let mut insns = Vec::new();
    let mut slot = 0u16;
    for parameter in &thunk.parameters {
        insns.push(Insn::Local {
            opcode: load_opcode(parameter),
            index: slot,
        });
        if parameter == HOST_STRING {
            insns.push(call(pool, FROM_DJVM.owner, FROM_DJVM.name, FROM_DJVM.descriptor)?);
        }
        slot += slot_size(parameter);
    }
    insns.push(match thunk.kind {
        opcodes::REF_INVOKE_VIRTUAL => Insn::Indexed {
            opcode: opcodes::INVOKEVIRTUAL,
            index: thunk.reference_index,
        },
        opcodes::REF_INVOKE_INTERFACE => Insn::InvokeInterface {
            index: thunk.reference_index,
            count: u8::try_from(slot)?,
        },
        _ => Insn::invoke_static(thunk.reference_index),
    });
    if thunk.host_return == HOST_STRING {
        insns.push(call(pool, TO_DJVM.owner, TO_DJVM.name, TO_DJVM.descriptor)?);
    }
    insns.push(Insn::Simple(return_opcode(&thunk.host_return)));

    let access = if scope.is_interface {
        ACC_PUBLIC | ACC_STATIC | ACC_SYNTHETIC
    } else {
        ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC
    };
    Ok(MemberInfo {
        access_flags: access,
        name_index: pool.add_utf8(name)?,
        descriptor_index: pool.add_utf8(&thunk.descriptor)?,
        attributes: vec![code_attribute(
            pool,
            insns,
            slot.max(slot_size(&thunk.host_return)).max(1),
            slot,
        )?],
    })
}

fn call(pool: &mut ConstantPool, owner: &str, name: &str, descriptor: &str) -> Result<Insn> {
    Ok(Insn::invoke_static(pool.add_method_ref(owner, name, descriptor, false)?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::analysis::whitelist::Whitelist;
    use crate::classfile::attributes::{self, parse_bootstrap_methods, CodeAttribute};
    use crate::classfile::builder::{BootstrapArg, ClassBuilder};
    use crate::classfile::code::decode;
    use crate::classfile::parse_class_bytes;
    use crate::instruction::resolve_handle;
    use crate::remapper::remap_constant_pool;

    const METAFACTORY: (&str, &str, &str) = (
        "java/lang/invoke/LambdaMetafactory",
        "metafactory",
        "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodHandle;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;",
    );

    fn lambda_class(target: BootstrapArg) -> ClassBuilder {
        ClassBuilder::new("com/example/Lambdas").method(
            ACC_PUBLIC | ACC_STATIC,
            "describer",
            "()Ljava/util/function/Function;",
            |code| {
                code.invoke_dynamic(
                    METAFACTORY,
                    "apply",
                    "()Ljava/util/function/Function;",
                    vec![
                        BootstrapArg::MethodType("(Ljava/lang/Object;)Ljava/lang/Object;".to_string()),
                        target,
                        BootstrapArg::MethodType(
                            "(Ljava/lang/Object;)Ljava/lang/String;".to_string(),
                        ),
                    ],
                )
                .op(opcodes::ARETURN)
            },
        )
    }

    fn redirect(builder: ClassBuilder) -> (ConstantPool, Vec<BootstrapMethod>, Vec<MemberInfo>, bool) {
        let class_file = parse_class_bytes(&builder.build()).expect("parse");
        let attribute = class_file
            .find_attribute(&class_file.attributes, attributes::BOOTSTRAP_METHODS)
            .expect("bootstrap methods");
        let mut bootstrap_methods = parse_bootstrap_methods(&attribute.info).expect("parse bootstraps");
        let resolver = ClassResolver::new(Arc::new(Whitelist::minimal()));
        let mut pool = class_file.constant_pool.clone();
        remap_constant_pool(&mut pool, &resolver).expect("remap");
        let mut methods = class_file.methods.clone();
        let scope = ThunkScope {
            resolver: &resolver,
            sandbox_name: "sandbox/com/example/Lambdas",
            is_interface: false,
        };
        let changed =
            generate_thunks(&scope, &mut pool, &mut bootstrap_methods, &mut methods).expect("thunks");
        (pool, bootstrap_methods, methods, changed)
    }

    #[test]
    fn whitelisted_string_methods_are_called_through_a_thunk() {
        let (pool, bootstrap_methods, methods, changed) = redirect(lambda_class(BootstrapArg::Handle {
            kind: opcodes::REF_INVOKE_VIRTUAL,
            owner: "java/lang/Object".to_string(),
            name: "toString".to_string(),
            descriptor: "()Ljava/lang/String;".to_string(),
            is_interface: false,
        }));

        assert!(changed);
        let handle = resolve_handle(&pool, bootstrap_methods[0].arguments[1]).expect("handle");
        assert_eq!(handle.kind, opcodes::REF_INVOKE_STATIC);
        assert_eq!(handle.member.owner, "sandbox/com/example/Lambdas");
        assert_eq!(handle.member.name, "djvm$thunk$0");
        assert_eq!(
            handle.member.descriptor,
            "(Ljava/lang/Object;)Lsandbox/java/lang/String;"
        );

        let thunk = methods.last().expect("thunk");
        assert_eq!(thunk.access_flags, ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC);
        let code = CodeAttribute::parse(&thunk.attributes[0].info).expect("code");
        let insns: Vec<Insn> = decode(&code.code)
            .expect("decode")
            .into_iter()
            .map(|instruction| instruction.insn)
            .collect();
        assert_eq!(
            insns.first(),
            Some(&Insn::Local {
                opcode: opcodes::ALOAD,
                index: 0
            })
        );
        assert_eq!(insns.last(), Some(&Insn::Simple(opcodes::ARETURN)));
        assert_eq!(code.max_locals, 1);
    }

    #[test]
    fn handles_to_sandboxed_owners_are_left_alone() {
        let (_, _, methods, changed) = redirect(lambda_class(BootstrapArg::Handle {
            kind: opcodes::REF_INVOKE_STATIC,
            owner: "com/example/Lambdas".to_string(),
            name: "describe".to_string(),
            descriptor: "(Ljava/lang/Object;)Ljava/lang/String;".to_string(),
            is_interface: false,
        }));

        assert!(!changed);
        assert_eq!(methods.len(), 1);
    }
}
