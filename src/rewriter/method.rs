//! Rewriting of one `Code` attribute: emitters run over every instruction,
//! the blocks are laid out again and every offset-bearing table follows.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};

use crate::analysis::configuration::AnalysisConfiguration;
use crate::classfile::attributes::{
    self, encode_line_numbers, encode_local_variables, parse_line_numbers, parse_local_variables,
    BootstrapMethod, CodeAttribute, ExceptionEntry,
};
use crate::classfile::code::{assemble, decode, Assembled, Block};
use crate::classfile::stack_map::{
    encode_stack_map, parse_stack_map, remap_frames, retype_handler_stack,
};
use crate::classfile::{Attribute, ConstantPool};
use crate::emitters::{Emitter, EmitterContext, Site};
use crate::header::THROWABLE;
use crate::instruction::InstructionView;
use crate::ir::{ClassRepresentation, Member};
use crate::remapper::{remap_local_variable_attribute, ClassResolver};

/// What one method is rewritten against.
pub(super) struct MethodScope<'a> {
    pub(super) configuration: &'a AnalysisConfiguration,
    pub(super) emitters: &'a [Emitter],
    /// Class after definition providers ran.
    pub(super) class: &'a ClassRepresentation,
    pub(super) member: &'a Member,
    /// Pool before remapping; instruction operands are read through it.
    pub(super) original_pool: &'a ConstantPool,
    pub(super) bootstrap_methods: &'a [BootstrapMethod],
}

pub(super) struct RewrittenCode {
    pub(super) info: Vec<u8>,
    /// An emitter changed at least one instruction.
    pub(super) is_modified: bool,
}

pub(super) fn rewrite_code(
    scope: &MethodScope<'_>,
    pool: &mut ConstantPool,
    info: &[u8],
) -> Result<RewrittenCode> {
    let code = CodeAttribute::parse(info).context("parse Code attribute")?;
    let instructions = decode(&code.code)?;
    let handlers = handler_catch_types(&code.exception_table, scope.original_pool)?;

    let mut blocks = Vec::with_capacity(instructions.len());
    let mut is_modified = false;
    let extra_stack;
    {
        let mut context = EmitterContext::new(
            scope.configuration,
            scope.class,
            scope.member,
            pool,
            &handlers,
        );
        for instruction in &instructions {
            let view = InstructionView::resolve(
                &instruction.insn,
                scope.original_pool,
                scope.bootstrap_methods,
            )
            .with_context(|| format!("resolve instruction at {}", instruction.offset))?;
            let site = Site {
                offset: instruction.offset,
                view: &view,
            };
            let original = Block::original(instruction);
            let mut block = original.clone();
            for emitter in scope.emitters {
                emitter.emit(&mut context, &site, &mut block).with_context(|| {
                    format!("{} failed at offset {}", emitter.name(), instruction.offset)
                })?;
            }
            is_modified |= block != original;
            blocks.push(block);
        }
        extra_stack = context.extra_stack;
    }

    let info = lay_out(
        pool,
        &code,
        &blocks,
        extra_stack,
        Some(&scope.configuration.class_resolver),
    )?;
    Ok(RewrittenCode { info, is_modified })
}

/// Assemble `blocks` in place of `code` and move every offset-bearing table
/// to the new layout. Local variable descriptors are remapped when a
/// resolver is given. Catch-any handlers keep the host `Throwable` in their
/// frames, since the pool entry they named was moved into the sandbox.
pub(super) fn lay_out(
    pool: &mut ConstantPool,
    code: &CodeAttribute,
    blocks: &[Block],
    extra_stack: u16,
    resolver: Option<&ClassResolver>,
) -> Result<Vec<u8>> {
    let assembled = assemble(blocks, code.code.len() as u32)?;
    let exception_table = code
        .exception_table
        .iter()
        .map(|entry| {
            Ok(ExceptionEntry {
                start_pc: position(&assembled, entry.start_pc)?,
                end_pc: position(&assembled, entry.end_pc)?,
                handler_pc: position(&assembled, entry.handler_pc)?,
                catch_type: entry.catch_type,
            })
        })
        .collect::<Result<Vec<_>>>()
        .context("remap exception table")?;

    let mut code_attributes = Vec::with_capacity(code.attributes.len());
    for attribute in &code.attributes {
        let name = pool.utf8(attribute.name_index)?.to_string();
        let info = match name.as_str() {
            attributes::LINE_NUMBER_TABLE => {
                let mut lines = parse_line_numbers(&attribute.info)?;
                for line in &mut lines {
                    line.start_pc = position(&assembled, line.start_pc)?;
                }
                encode_line_numbers(&lines)
            }
            attributes::LOCAL_VARIABLE_TABLE | attributes::LOCAL_VARIABLE_TYPE_TABLE => {
                let mut variables = parse_local_variables(&attribute.info)?;
                for variable in &mut variables {
                    let end = variable
                        .start_pc
                        .checked_add(variable.length)
                        .context("local variable range overflows")?;
                    let start_pc = position(&assembled, variable.start_pc)?;
                    variable.length = position(&assembled, end)? - start_pc;
                    variable.start_pc = start_pc;
                }
                let info = encode_local_variables(&variables);
                match resolver {
                    Some(resolver) => remap_local_variable_attribute(
                        pool,
                        resolver,
                        &info,
                        name == attributes::LOCAL_VARIABLE_TYPE_TABLE,
                    )?,
                    None => info,
                }
            }
            attributes::STACK_MAP_TABLE => {
                let mut frames = parse_stack_map(&attribute.info)?;
                let catch_any: HashSet<u32> = code
                    .exception_table
                    .iter()
                    .filter(|entry| entry.catch_type == 0)
                    .map(|entry| entry.handler_pc as u32)
                    .collect();
                if !catch_any.is_empty() {
                    retype_handler_stack(&mut frames, &catch_any, pool.add_class(THROWABLE)?);
                }
                encode_stack_map(&remap_frames(&frames, &assembled)?)?
            }
            attributes::RUNTIME_VISIBLE_TYPE_ANNOTATIONS
            | attributes::RUNTIME_INVISIBLE_TYPE_ANNOTATIONS => continue,
            _ => attribute.info.clone(),
        };
        code_attributes.push(Attribute {
            name_index: attribute.name_index,
            info,
        });
    }

    CodeAttribute {
        max_stack: code.max_stack.saturating_add(extra_stack),
        max_locals: code.max_locals,
        code: assembled.code,
        exception_table,
        attributes: code_attributes,
    }
    .encode()
}

/// Handler offset to the host names of the types caught there.
fn handler_catch_types(
    table: &[ExceptionEntry],
    pool: &ConstantPool,
) -> Result<HashMap<u32, Vec<Option<String>>>> {
    let mut handlers: HashMap<u32, Vec<Option<String>>> = HashMap::new();
    for entry in table {
        let catch_type = match entry.catch_type {
            0 => None,
            index => Some(pool.class_name(index)?.to_string()),
        };
        handlers
            .entry(entry.handler_pc as u32)
            .or_default()
            .push(catch_type);
    }
    Ok(handlers)
}

fn position(assembled: &Assembled, original: u16) -> Result<u16> {
    let position = assembled.label(original as u32)?;
    u16::try_from(position).context("code offset out of range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::builder::ClassBuilder;
    use crate::classfile::code::Insn;
    use crate::classfile::{parse_class_bytes, ACC_PUBLIC};
    use crate::emitters::default_emitters;
    use crate::opcodes;
    use crate::rules::test_support::configuration;

    fn rewrite(builder: ClassBuilder, method: (&str, &str)) -> (CodeAttribute, bool) {
        let configuration = configuration();
        let class_file = parse_class_bytes(&builder.build()).expect("parse");
        let class = ClassRepresentation::from_class_file(&class_file).expect("representation");
        let member = class.member(method.0, method.1).expect("member").clone();
        let info = class_file
            .methods
            .iter()
            .find(|info| info.name(&class_file.constant_pool).ok() == Some(method.0))
            .and_then(|info| class_file.find_attribute(&info.attributes, attributes::CODE))
            .expect("code")
            .info
            .clone();
        let emitters = default_emitters(true);
        let scope = MethodScope {
            configuration: &configuration,
            emitters: &emitters,
            class: &class,
            member: &member,
            original_pool: &class_file.constant_pool,
            bootstrap_methods: &[],
        };
        let mut pool = class_file.constant_pool.clone();
        let rewritten = rewrite_code(&scope, &mut pool, &info).expect("rewrite");
        (
            CodeAttribute::parse(&rewritten.info).expect("parse rewritten"),
            rewritten.is_modified,
        )
    }

    #[test]
    fn branch_targets_land_on_the_injected_prefix() {
        let builder = ClassBuilder::new("com/example/Loop").method(ACC_PUBLIC, "spin", "(I)V", |code| {
            code.label(0)
                .insn(Insn::Iinc { index: 1, delta: -1 })
                .load(opcodes::ILOAD, 1)
                .jump(opcodes::IFEQ, 0)
                .op_return()
        });

        let (code, is_modified) = rewrite(builder, ("spin", "(I)V"));
        let instructions = decode(&code.code).expect("decode");

        assert!(is_modified);
        // iinc; iload; invokestatic recordJump; ifne -> 0; return
        assert_eq!(instructions.len(), 5);
        assert_eq!(instructions[2].insn.opcode(), opcodes::INVOKESTATIC);
        assert_eq!(
            instructions[3].insn,
            Insn::Jump {
                opcode: opcodes::IFEQ,
                target: 0
            }
        );
    }

    #[test]
    fn handlers_and_line_numbers_follow_the_new_layout() {
        let builder = ClassBuilder::new("com/example/Guarded").method(ACC_PUBLIC, "run", "()V", |code| {
            code.label(0)
                .invoke_static("com/example/Guarded", "helper", "()V")
                .label(1)
                .op_return()
                .label(2)
                .op(opcodes::POP)
                .op_return()
                .try_catch(0, 1, 2, None)
                .line(0, 10)
                .line(2, 12)
        });

        let (code, _) = rewrite(builder, ("run", "()V"));
        let instructions = decode(&code.code).expect("decode");
        let handler = code.exception_table[0];

        // recordInvocation; invokestatic helper; return; dup; checkCatch; pop; return
        assert_eq!(handler.start_pc, 0);
        assert_eq!(handler.end_pc, 6);
        assert_eq!(handler.handler_pc, 7);
        assert_eq!(
            instructions
                .iter()
                .find(|instruction| instruction.offset == 7)
                .map(|instruction| instruction.insn.clone()),
            Some(Insn::Simple(opcodes::DUP))
        );
        assert_eq!(code.max_stack, 9);
    }

    #[test]
    fn untouched_code_is_not_marked_modified() {
        let builder = ClassBuilder::new("com/example/Plain").method(ACC_PUBLIC, "id", "(I)I", |code| {
            code.load(opcodes::ILOAD, 1).op(opcodes::IRETURN)
        });

        let (code, is_modified) = rewrite(builder, ("id", "(I)I"));

        assert!(!is_modified);
        assert_eq!(code.max_stack, 8);
    }
}
