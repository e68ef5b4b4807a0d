use anyhow::Result;

use crate::analysis::configuration::AnalysisConfiguration;
use crate::instruction::InstructionView;
use crate::ir::{ClassRepresentation, Member};
use crate::messages::{Message, MessageCollection, Severity, SourceLocation};

pub(crate) mod class_rules;
pub(crate) mod instruction_rules;
pub(crate) mod member_rules;

pub use self::class_rules::ClassRule;
pub use self::instruction_rules::InstructionRule;
pub use self::member_rules::MemberRule;

/// Metadata describing a validation rule.
#[derive(Clone, Debug)]
pub struct RuleMetadata {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

/// Closed set of validation rules, grouped by the scope they inspect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rule {
    Class(ClassRule),
    Member(MemberRule),
    Instruction(InstructionRule),
}

/// What a rule sees while it runs: where it is and where to report.
pub struct RuleContext<'a> {
    pub(crate) configuration: &'a AnalysisConfiguration,
    pub(crate) location: SourceLocation,
    pub(crate) messages: &'a mut MessageCollection,
}

impl<'a> RuleContext<'a> {
    pub(crate) fn new(
        configuration: &'a AnalysisConfiguration,
        location: SourceLocation,
        messages: &'a mut MessageCollection,
    ) -> Self {
        Self {
            configuration,
            location,
            messages,
        }
    }

    pub(crate) fn report(&mut self, rule: &RuleMetadata, severity: Severity, text: impl Into<String>) {
        self.messages.add(Message {
            location: self.location.clone(),
            severity,
            message: text.into(),
            source: rule.id.to_string(),
        });
    }
}

impl Rule {
    pub fn metadata(&self) -> RuleMetadata {
        match self {
            Rule::Class(rule) => rule.metadata(),
            Rule::Member(rule) => rule.metadata(),
            Rule::Instruction(rule) => rule.metadata(),
        }
    }

    /// Run the rule. Each kind only fires for its own scope: class rules
    /// for a class alone, member rules for a member without an instruction,
    /// instruction rules when all three are given.
    pub(crate) fn validate(
        &self,
        context: &mut RuleContext<'_>,
        class: Option<&ClassRepresentation>,
        member: Option<&Member>,
        instruction: Option<&InstructionView>,
    ) -> Result<()> {
        match (self, class, member, instruction) {
            (Rule::Class(rule), Some(class), None, None) => rule.validate(context, class),
            (Rule::Member(rule), Some(class), Some(member), None) => {
                rule.validate(context, class, member)
            }
            (Rule::Instruction(rule), Some(class), Some(member), Some(instruction)) => {
                rule.validate(context, class, member, instruction)
            }
            _ => Ok(()),
        }
    }
}

/// Rules applied when a configuration does not name its own.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::Class(ClassRule::DisallowUnsupportedApiVersions),
        Rule::Class(ClassRule::DisallowOverriddenSandboxPackage),
        Rule::Member(MemberRule::DisallowMalformedDescriptors),
        Rule::Member(MemberRule::AlwaysUseNonSynchronizedMethods),
        Rule::Member(MemberRule::AlwaysUseStrictFloatingPointArithmetic),
        Rule::Instruction(InstructionRule::DisallowNonDeterministicMethods),
        Rule::Instruction(InstructionRule::DisallowReflection),
        Rule::Instruction(InstructionRule::DisallowDynamicInvocation),
        Rule::Instruction(InstructionRule::DisallowCatchingBlacklistedExceptions),
        Rule::Instruction(InstructionRule::IgnoreBreakpoints),
        Rule::Instruction(InstructionRule::IgnoreSynchronizedBlocks),
    ]
}
