//! Runs the configured rules over one class: the class itself, each member,
//! and each instruction and exception handler of every method body.

use anyhow::{Context, Result};

use crate::analysis::configuration::AnalysisConfiguration;
use crate::classfile::attributes::{self, parse_bootstrap_methods, parse_line_numbers, CodeAttribute};
use crate::classfile::code::decode;
use crate::classfile::{ClassFile, MemberInfo};
use crate::instruction::InstructionView;
use crate::ir::{ClassRepresentation, Member};
use crate::messages::{Message, MessageCollection, Severity, SourceLocation};
use crate::rules::{Rule, RuleContext};

const MESSAGE_SOURCE: &str = "validator";

/// Validate `class_file` and return its representation. A member whose
/// code cannot be inspected is reported as an error and the walk goes on.
pub(crate) fn apply_rules(
    configuration: &AnalysisConfiguration,
    rules: &[Rule],
    class_file: &ClassFile,
    messages: &mut MessageCollection,
) -> Result<ClassRepresentation> {
    let class = ClassRepresentation::from_class_file(class_file)?;
    let location = SourceLocation::for_class(&class.name, class.source_file.as_deref());
    for rule in rules {
        let mut context = RuleContext::new(configuration, location.clone(), messages);
        rule.validate(&mut context, Some(&class), None, None)
            .with_context(|| format!("rule {} on {}", rule.metadata().id, class.name))?;
    }

    let bootstrap_methods = match class_file.find_attribute(&class_file.attributes, attributes::BOOTSTRAP_METHODS) {
        Some(attribute) => parse_bootstrap_methods(&attribute.info)?,
        None => Vec::new(),
    };
    let walk = MemberWalk {
        configuration,
        rules,
        class_file,
        class: &class,
        bootstrap_methods: &bootstrap_methods,
    };
    for member in class.members.values() {
        let member_location = location.for_member(&member.member_name, &member.descriptor);
        let info = if member.is_method() {
            find_method(class_file, member)?
        } else {
            None
        };
        if let Err(error) = walk.member(member, info, &member_location, messages) {
            messages.add(Message {
                location: member_location,
                severity: Severity::Error,
                message: format!("{error:#}"),
                source: MESSAGE_SOURCE.to_string(),
            });
        }
    }
    Ok(class)
}

fn find_method<'c>(class_file: &'c ClassFile, member: &Member) -> Result<Option<&'c MemberInfo>> {
    let pool = &class_file.constant_pool;
    for info in &class_file.methods {
        if info.name(pool)? == member.member_name && info.descriptor(pool)? == member.descriptor {
            return Ok(Some(info));
        }
    }
    Ok(None)
}

struct MemberWalk<'a> {
    configuration: &'a AnalysisConfiguration,
    rules: &'a [Rule],
    class_file: &'a ClassFile,
    class: &'a ClassRepresentation,
    bootstrap_methods: &'a [attributes::BootstrapMethod],
}

impl MemberWalk<'_> {
    fn member(
        &self,
        member: &Member,
        info: Option<&MemberInfo>,
        location: &SourceLocation,
        messages: &mut MessageCollection,
    ) -> Result<()> {
        for rule in self.rules {
            let mut context = RuleContext::new(self.configuration, location.clone(), messages);
            rule.validate(&mut context, Some(self.class), Some(member), None)?;
        }
        let Some(code) = info.and_then(|info| self.class_file.find_attribute(&info.attributes, attributes::CODE)) else {
            return Ok(());
        };
        let code = CodeAttribute::parse(&code.info)?;
        let pool = &self.class_file.constant_pool;
        let mut lines = Vec::new();
        for attribute in &code.attributes {
            if pool.utf8(attribute.name_index)? == attributes::LINE_NUMBER_TABLE {
                lines.extend(parse_line_numbers(&attribute.info)?);
            }
        }
        lines.sort_by_key(|line| line.start_pc);
        let line_at = |offset: u32| {
            lines
                .iter()
                .take_while(|line| line.start_pc as u32 <= offset)
                .last()
                .map(|line| line.line)
        };

        for entry in &code.exception_table {
            let catch_type = match entry.catch_type {
                0 => None,
                index => Some(pool.class_name(index)?.to_string()),
            };
            let view = InstructionView::TryCatch { catch_type };
            self.instruction(member, &view, &location.at_line(line_at(entry.handler_pc as u32)), messages)?;
        }
        for instruction in decode(&code.code)? {
            let view = InstructionView::resolve(&instruction.insn, pool, self.bootstrap_methods)
                .with_context(|| format!("resolve instruction at {}", instruction.offset))?;
            self.instruction(member, &view, &location.at_line(line_at(instruction.offset)), messages)?;
        }
        Ok(())
    }

    fn instruction(
        &self,
        member: &Member,
        view: &InstructionView,
        location: &SourceLocation,
        messages: &mut MessageCollection,
    ) -> Result<()> {
        for rule in self.rules {
            let mut context = RuleContext::new(self.configuration, location.clone(), messages);
            rule.validate(&mut context, Some(self.class), Some(member), Some(view))?;
        }
        Ok(())
    }
}
