//! Static state handling: `<clinit>` becomes a resettable `djvm$reset`
//! so a fresh runtime context can re-run it, and sandboxed string
//! constants are initialised explicitly.

use anyhow::{Context, Result};

use crate::analysis::configuration::AnalysisConfiguration;
use crate::classfile::attributes::{self, CodeAttribute};
use crate::classfile::code::{assemble, decode, default_value, Block, Insn};
use crate::classfile::{
    Attribute, Constant, ConstantPool, MemberInfo, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC,
    ACC_SYNTHETIC,
};
use crate::descriptor::{is_class_initializer, CLASS_INITIALIZER_NAME};
use crate::emitters::{RuntimeHook, REGISTER_RESET, TO_DJVM};
use crate::ir::{ClassRepresentation, ConstantValue, Member};
use crate::opcodes;

use super::method::lay_out;

pub(crate) const RESET_METHOD: &str = "djvm$reset";
pub(crate) const ORIGINAL_INITIALIZER: &str = "djvm$clinit";

pub(super) struct ResetScope<'a> {
    pub(super) configuration: &'a AnalysisConfiguration,
    pub(super) class: &'a ClassRepresentation,
    pub(super) sandbox_name: &'a str,
    pub(super) strings_are_sandboxed: bool,
}

/// Install static initialisation. Returns whether methods were added or
/// changed.
pub(super) fn install(
    scope: &ResetScope<'_>,
    pool: &mut ConstantPool,
    methods: &mut Vec<MemberInfo>,
) -> Result<bool> {
    let statics: Vec<&Member> = scope
        .class
        .members
        .values()
        .filter(|member| member.is_field() && member.is_static())
        .collect();
    let initializer = find_initializer(pool, methods)?;
    let resettable = !scope.class.is_interface()
        && !scope.configuration.is_immutable(&scope.class.name)
        && statics.iter().all(|field| !field.is_final())
        && (!statics.is_empty() || initializer.is_some());

    if resettable {
        install_reset(scope, pool, methods, &statics, initializer)?;
        return Ok(true);
    }

    if !scope.strings_are_sandboxed {
        return Ok(false);
    }
    let mut prefix = Vec::new();
    for field in &statics {
        if let Some(ConstantValue::String(value)) = &field.value {
            prefix.extend(store_string(scope, pool, field, value)?);
        }
    }
    if prefix.is_empty() {
        return Ok(false);
    }
    match initializer {
        Some(index) => prefix_initializer(pool, &mut methods[index], prefix)?,
        None => {
            prefix.push(Insn::Simple(opcodes::RETURN));
            methods.push(synthetic_method(
                pool,
                ACC_STATIC,
                CLASS_INITIALIZER_NAME,
                prefix,
                1,
            )?);
        }
    }
    Ok(true)
}

fn find_initializer(pool: &ConstantPool, methods: &[MemberInfo]) -> Result<Option<usize>> {
    for (index, method) in methods.iter().enumerate() {
        if is_class_initializer(method.name(pool)?) {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

fn install_reset(
    scope: &ResetScope<'_>,
    pool: &mut ConstantPool,
    methods: &mut Vec<MemberInfo>,
    statics: &[&Member],
    initializer: Option<usize>,
) -> Result<()> {
    let mut reset = Vec::new();
    for field in statics {
        match &field.value {
            Some(ConstantValue::String(value)) => {
                reset.extend(store_string(scope, pool, field, value)?);
                continue;
            }
            Some(value) => reset.push(load_constant(pool, value)?),
            None => reset.push(default_value(&field.descriptor)),
        }
        reset.push(put_static(scope, pool, field)?);
    }
    if let Some(index) = initializer {
        let method = &mut methods[index];
        method.name_index = pool.add_utf8(ORIGINAL_INITIALIZER)?;
        method.access_flags = ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC;
        reset.push(invoke_own(pool, scope.sandbox_name, ORIGINAL_INITIALIZER)?);
    }
    reset.push(Insn::Simple(opcodes::RETURN));
    methods.push(synthetic_method(
        pool,
        ACC_PUBLIC | ACC_STATIC | ACC_SYNTHETIC,
        RESET_METHOD,
        reset,
        2,
    )?);

    let clinit = vec![
        Insn::Ldc(pool.add_string(scope.sandbox_name)?),
        call(pool, REGISTER_RESET)?,
        invoke_own(pool, scope.sandbox_name, RESET_METHOD)?,
        Insn::Simple(opcodes::RETURN),
    ];
    methods.push(synthetic_method(pool, ACC_STATIC, CLASS_INITIALIZER_NAME, clinit, 1)?);
    Ok(())
}

/// `ldc value; [toDJVM;] putstatic field`
fn store_string(
    scope: &ResetScope<'_>,
    pool: &mut ConstantPool,
    field: &Member,
    value: &str,
) -> Result<Vec<Insn>> {
    let mut insns = vec![Insn::Ldc(pool.add_string(value)?)];
    if scope.strings_are_sandboxed {
        insns.push(call(pool, TO_DJVM)?);
    }
    insns.push(put_static(scope, pool, field)?);
    Ok(insns)
}

fn load_constant(pool: &mut ConstantPool, value: &ConstantValue) -> Result<Insn> {
    Ok(match value {
        ConstantValue::Integer(value) => match *value {
            -1..=5 => Insn::Simple((opcodes::ICONST_0 as i32 + value) as u8),
            value if i8::try_from(value).is_ok() => Insn::Bipush(value as i8),
            value if i16::try_from(value).is_ok() => Insn::Sipush(value as i16),
            value => Insn::Ldc(pool.add_integer(value)?),
        },
        ConstantValue::Float(bits) => Insn::Ldc(pool.add(Constant::Float(*bits))?),
        ConstantValue::Long(value) => Insn::Ldc2(pool.add(Constant::Long(*value))?),
        ConstantValue::Double(bits) => Insn::Ldc2(pool.add(Constant::Double(*bits))?),
        ConstantValue::String(value) => Insn::Ldc(pool.add_string(value)?),
    })
}

fn put_static(scope: &ResetScope<'_>, pool: &mut ConstantPool, field: &Member) -> Result<Insn> {
    let descriptor = scope
        .configuration
        .class_resolver
        .resolve_descriptor(&field.descriptor);
    Ok(Insn::Indexed {
        opcode: opcodes::PUTSTATIC,
        index: pool.add_field_ref(scope.sandbox_name, &field.member_name, &descriptor)?,
    })
}

fn invoke_own(pool: &mut ConstantPool, owner: &str, name: &str) -> Result<Insn> {
    Ok(Insn::invoke_static(pool.add_method_ref(owner, name, "()V", false)?))
}

fn call(pool: &mut ConstantPool, hook: RuntimeHook) -> Result<Insn> {
    Ok(Insn::invoke_static(pool.add_method_ref(
        hook.owner,
        hook.name,
        hook.descriptor,
        false,
    )?))
}

/// Straight-line static method with no locals.
pub(super) fn synthetic_method(
    pool: &mut ConstantPool,
    access: u16,
    name: &str,
    insns: Vec<Insn>,
    max_stack: u16,
) -> Result<MemberInfo> {
    Ok(MemberInfo {
        access_flags: access,
        name_index: pool.add_utf8(name)?,
        descriptor_index: pool.add_utf8("()V")?,
        attributes: vec![code_attribute(pool, insns, max_stack, 0)?],
    })
}

/// `Code` attribute for branch-free instructions.
pub(super) fn code_attribute(
    pool: &mut ConstantPool,
    insns: Vec<Insn>,
    max_stack: u16,
    max_locals: u16,
) -> Result<Attribute> {
    let block = Block {
        label: 0,
        body: insns,
        ..Block::default()
    };
    let assembled = assemble(&[block], 1)?;
    let info = CodeAttribute {
        max_stack,
        max_locals,
        code: assembled.code,
        exception_table: Vec::new(),
        attributes: Vec::new(),
    }
    .encode()?;
    Ok(Attribute {
        name_index: pool.add_utf8(attributes::CODE)?,
        info,
    })
}

/// Run `prefix` before the existing initializer body. The prefix gets a
/// label past the end of the original code, so branches back to offset 0
/// do not repeat it.
fn prefix_initializer(
    pool: &mut ConstantPool,
    method: &mut MemberInfo,
    prefix: Vec<Insn>,
) -> Result<()> {
    let mut code_index = None;
    for (index, attribute) in method.attributes.iter().enumerate() {
        if pool.utf8(attribute.name_index)? == attributes::CODE {
            code_index = Some(index);
            break;
        }
    }
    let code_index = code_index.context("static initializer has no code")?;
    let code = CodeAttribute::parse(&method.attributes[code_index].info)?;
    let instructions = decode(&code.code)?;
    let mut blocks = Vec::with_capacity(instructions.len() + 1);
    blocks.push(Block {
        label: code.code.len() as u32 + 1,
        body: prefix,
        ..Block::default()
    });
    blocks.extend(instructions.iter().map(Block::original));
    method.attributes[code_index].info = lay_out(pool, &code, &blocks, 1, None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::builder::ClassBuilder;
    use crate::classfile::{parse_class_bytes, ACC_FINAL, ACC_INTERFACE, ACC_ABSTRACT};
    use crate::rules::test_support::configuration;

    struct Installed {
        pool: ConstantPool,
        methods: Vec<MemberInfo>,
        changed: bool,
    }

    fn install_into(builder: ClassBuilder, sandbox_name: &str) -> Installed {
        let configuration = configuration();
        let class_file = parse_class_bytes(&builder.build()).expect("parse");
        let class = ClassRepresentation::from_class_file(&class_file).expect("representation");
        let mut pool = class_file.constant_pool.clone();
        let mut methods = class_file.methods.clone();
        let scope = ResetScope {
            configuration: &configuration,
            class: &class,
            sandbox_name,
            strings_are_sandboxed: true,
        };
        let changed = install(&scope, &mut pool, &mut methods).expect("install");
        Installed {
            pool,
            methods,
            changed,
        }
    }

    fn method_code(installed: &Installed, name: &str) -> Vec<Insn> {
        let method = installed
            .methods
            .iter()
            .find(|method| method.name(&installed.pool).ok() == Some(name))
            .expect("method");
        let attribute = method
            .attributes
            .iter()
            .find(|attribute| installed.pool.utf8(attribute.name_index).ok() == Some(attributes::CODE))
            .expect("code");
        let code = CodeAttribute::parse(&attribute.info).expect("parse code");
        decode(&code.code)
            .expect("decode")
            .into_iter()
            .map(|instruction| instruction.insn)
            .collect()
    }

    fn invoked_names(pool: &ConstantPool, insns: &[Insn]) -> Vec<String> {
        insns
            .iter()
            .filter_map(|insn| match insn {
                Insn::Indexed { opcode, index } if *opcode == opcodes::INVOKESTATIC => pool
                    .member_ref(*index)
                    .ok()
                    .map(|member| member.name),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn initializer_moves_behind_a_reset_method() {
        let builder = ClassBuilder::new("com/example/Counter")
            .field(ACC_PRIVATE | ACC_STATIC, "count", "I")
            .field_with_constant(ACC_STATIC, "limit", "I", Constant::Integer(100))
            .string_field(ACC_STATIC, "label", "ticks")
            .method(ACC_STATIC, "<clinit>", "()V", |code| {
                code.bipush(1)
                    .put_static("com/example/Counter", "count", "I")
                    .op_return()
            });

        let installed = install_into(builder, "sandbox/com/example/Counter");

        assert!(installed.changed);
        assert_eq!(
            invoked_names(&installed.pool, &method_code(&installed, "<clinit>")),
            vec!["registerReset", RESET_METHOD]
        );
        let reset = method_code(&installed, RESET_METHOD);
        assert_eq!(
            invoked_names(&installed.pool, &reset),
            vec!["toDJVM", ORIGINAL_INITIALIZER]
        );
        assert!(reset.contains(&Insn::Bipush(100)));
        let original = installed
            .methods
            .iter()
            .find(|method| method.name(&installed.pool).ok() == Some(ORIGINAL_INITIALIZER))
            .expect("renamed initializer");
        assert_eq!(original.access_flags, ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC);
    }

    #[test]
    fn interfaces_get_inline_string_initialisation() {
        let builder = ClassBuilder::new("com/example/Names")
            .access(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
            .string_field(ACC_PUBLIC | ACC_STATIC | ACC_FINAL, "DEFAULT", "anonymous");

        let installed = install_into(builder, "sandbox/com/example/Names");

        assert!(installed.changed);
        let clinit = method_code(&installed, "<clinit>");
        assert_eq!(invoked_names(&installed.pool, &clinit), vec!["toDJVM"]);
        assert_eq!(clinit.last(), Some(&Insn::Simple(opcodes::RETURN)));
        assert!(installed
            .methods
            .iter()
            .all(|method| method.name(&installed.pool).ok() != Some(RESET_METHOD)));
    }

    #[test]
    fn string_prefix_keeps_branches_to_the_original_start() {
        let builder = ClassBuilder::new("com/example/Spin")
            .access(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
            .string_field(ACC_PUBLIC | ACC_STATIC | ACC_FINAL, "NAME", "spin")
            .method(ACC_STATIC, "<clinit>", "()V", |code| {
                code.label(0).op(opcodes::NOP).jump(opcodes::GOTO, 0)
            });

        let installed = install_into(builder, "sandbox/com/example/Spin");
        let clinit = method_code(&installed, "<clinit>");

        // ldc; toDJVM; putstatic occupy offsets 0..8
        assert_eq!(
            clinit.last(),
            Some(&Insn::Jump {
                opcode: opcodes::GOTO,
                target: 8
            })
        );
    }

    #[test]
    fn classes_without_static_state_are_left_alone() {
        let builder = ClassBuilder::new("com/example/Plain").method(ACC_PUBLIC, "run", "()V", |code| {
            code.op_return()
        });

        let installed = install_into(builder, "sandbox/com/example/Plain");

        assert!(!installed.changed);
        assert_eq!(installed.methods.len(), 1);
    }
}
