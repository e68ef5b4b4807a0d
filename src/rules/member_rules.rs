use anyhow::Result;
use jdescriptor::MethodDescriptor;

use crate::classfile::{ACC_STRICT, ACC_SYNCHRONIZED};
use crate::descriptor::split_method_descriptor;
use crate::ir::{ClassRepresentation, Member};
use crate::messages::Severity;
use crate::rules::{RuleContext, RuleMetadata};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberRule {
    DisallowMalformedDescriptors,
    AlwaysUseNonSynchronizedMethods,
    AlwaysUseStrictFloatingPointArithmetic,
}

impl MemberRule {
    pub fn metadata(&self) -> RuleMetadata {
        match self {
            MemberRule::DisallowMalformedDescriptors => RuleMetadata {
                id: "DISALLOW_MALFORMED_DESCRIPTORS",
                name: "Malformed descriptor",
                description: "Field or method descriptors that do not follow the JVM grammar",
            },
            MemberRule::AlwaysUseNonSynchronizedMethods => RuleMetadata {
                id: "ALWAYS_USE_NON_SYNCHRONIZED_METHODS",
                name: "Synchronized method",
                description: "Synchronization is meaningless on the single sandbox thread",
            },
            MemberRule::AlwaysUseStrictFloatingPointArithmetic => RuleMetadata {
                id: "ALWAYS_USE_STRICT_FLOATING_POINT_ARITHMETIC",
                name: "Non-strict floating point",
                description: "Methods that will be forced to use strict floating point",
            },
        }
    }

    pub(crate) fn validate(
        &self,
        context: &mut RuleContext<'_>,
        _class: &ClassRepresentation,
        member: &Member,
    ) -> Result<()> {
        let metadata = self.metadata();
        match self {
            MemberRule::DisallowMalformedDescriptors => {
                if !is_well_formed(member) {
                    context.report(
                        &metadata,
                        Severity::Error,
                        format!("Malformed descriptor {} on {}", member.descriptor, member.member_name),
                    );
                }
            }
            MemberRule::AlwaysUseNonSynchronizedMethods => {
                if member.is_method() && member.access & ACC_SYNCHRONIZED != 0 {
                    context.report(
                        &metadata,
                        Severity::Informational,
                        "Synchronization specifier will be ignored",
                    );
                }
            }
            MemberRule::AlwaysUseStrictFloatingPointArithmetic => {
                if member.is_method() && member.access & ACC_STRICT == 0 {
                    context.report(
                        &metadata,
                        Severity::Trace,
                        "Strict floating-point arithmetic will be applied",
                    );
                }
            }
        }
        Ok(())
    }
}

/// Fields are checked as the return type of a nullary method, so both kinds
/// go through the same grammar; a field can never be `void`.
fn is_well_formed(member: &Member) -> bool {
    if member.is_field() {
        if member.descriptor == "V" {
            return false;
        }
        let as_method = format!("(){}", member.descriptor);
        return as_method.parse::<MethodDescriptor>().is_ok()
            && split_method_descriptor(&as_method).is_ok();
    }
    member.descriptor.parse::<MethodDescriptor>().is_ok()
        && split_method_descriptor(&member.descriptor).is_ok()
}
