use anyhow::Result;

use crate::instruction::InstructionView;
use crate::ir::{ClassRepresentation, Member};
use crate::messages::Severity;
use crate::rules::{RuleContext, RuleMetadata};

const STRING_CONCAT_FACTORY: &str = "java/lang/invoke/StringConcatFactory";

/// Exceptions the sandbox uses to terminate user code.
pub(crate) const BLACKLISTED_EXCEPTIONS: [&str; 2] =
    ["java/lang/ThreadDeath", "java/lang/VirtualMachineError"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionRule {
    DisallowNonDeterministicMethods,
    DisallowReflection,
    DisallowDynamicInvocation,
    DisallowCatchingBlacklistedExceptions,
    IgnoreBreakpoints,
    IgnoreSynchronizedBlocks,
}

impl InstructionRule {
    pub fn metadata(&self) -> RuleMetadata {
        match self {
            InstructionRule::DisallowNonDeterministicMethods => RuleMetadata {
                id: "DISALLOW_NON_DETERMINISTIC_METHODS",
                name: "Non-deterministic API usage",
                description: "Calls to clocks, randomness, threads and the host environment",
            },
            InstructionRule::DisallowReflection => RuleMetadata {
                id: "DISALLOW_REFLECTION",
                name: "Reflection",
                description: "Calls to the reflection API or reflective method lookup",
            },
            InstructionRule::DisallowDynamicInvocation => RuleMetadata {
                id: "DISALLOW_DYNAMIC_INVOCATION",
                name: "Dynamic invocation",
                description: "invokedynamic with a bootstrap other than the lambda metafactory",
            },
            InstructionRule::DisallowCatchingBlacklistedExceptions => RuleMetadata {
                id: "DISALLOW_CATCHING_BLACKLISTED_EXCEPTIONS",
                name: "Catching sandbox termination",
                description: "Exception handlers for ThreadDeath or VirtualMachineError",
            },
            InstructionRule::IgnoreBreakpoints => RuleMetadata {
                id: "IGNORE_BREAKPOINTS",
                name: "Breakpoint",
                description: "Breakpoint instructions are removed",
            },
            InstructionRule::IgnoreSynchronizedBlocks => RuleMetadata {
                id: "IGNORE_SYNCHRONIZED_BLOCKS",
                name: "Synchronized block",
                description: "Monitor instructions are removed",
            },
        }
    }

    pub(crate) fn validate(
        &self,
        context: &mut RuleContext<'_>,
        _class: &ClassRepresentation,
        _member: &Member,
        instruction: &InstructionView,
    ) -> Result<()> {
        let metadata = self.metadata();
        match (self, instruction) {
            (InstructionRule::DisallowNonDeterministicMethods, InstructionView::Invoke { member, .. }) => {
                if let Some(reason) = non_deterministic_reason(&member.owner, &member.name, &member.descriptor) {
                    context.report(
                        &metadata,
                        Severity::Error,
                        format!(
                            "Disallowed reference to API; {}.{}{} ({})",
                            member.owner.replace('/', "."),
                            member.name,
                            member.descriptor,
                            reason
                        ),
                    );
                }
            }
            (InstructionRule::DisallowReflection, InstructionView::Invoke { member, .. }) => {
                if is_reflective_call(&member.owner, &member.name) {
                    context.report(
                        &metadata,
                        Severity::Error,
                        format!(
                            "Disallowed reference to reflection API; {}.{}{}",
                            member.owner.replace('/', "."),
                            member.name,
                            member.descriptor
                        ),
                    );
                }
            }
            (InstructionRule::DisallowDynamicInvocation, InstructionView::InvokeDynamic { bootstrap, .. }) => {
                if bootstrap.member.owner == STRING_CONCAT_FACTORY {
                    // The call site would return a sandboxed String the factory cannot build.
                    context.report(
                        &metadata,
                        Severity::Error,
                        format!(
                            "Disallowed dynamic string concatenation through {}.{}; \
                             compile with -XDstringConcat=inline",
                            STRING_CONCAT_FACTORY.replace('/', "."),
                            bootstrap.member.name
                        ),
                    );
                } else if !is_permitted_bootstrap(&bootstrap.member.owner, &bootstrap.member.name) {
                    context.report(
                        &metadata,
                        Severity::Error,
                        format!(
                            "Disallowed dynamic invocation through {}.{}",
                            bootstrap.member.owner.replace('/', "."),
                            bootstrap.member.name
                        ),
                    );
                }
            }
            (
                InstructionRule::DisallowCatchingBlacklistedExceptions,
                InstructionView::TryCatch {
                    catch_type: Some(catch_type),
                },
            ) => {
                let hierarchy = &context.configuration.hierarchy;
                let mut blacklisted = false;
                for exception in BLACKLISTED_EXCEPTIONS {
                    if hierarchy.is_assignable_from(exception, catch_type)? {
                        blacklisted = true;
                        break;
                    }
                }
                if blacklisted {
                    context.report(
                        &metadata,
                        Severity::Error,
                        format!(
                            "Disallowed catch of {}",
                            catch_type.replace('/', ".")
                        ),
                    );
                }
            }
            (InstructionRule::IgnoreBreakpoints, InstructionView::Breakpoint) => {
                context.report(&metadata, Severity::Informational, "Breakpoint will be removed");
            }
            (InstructionRule::IgnoreSynchronizedBlocks, InstructionView::MonitorEnter) => {
                context.report(
                    &metadata,
                    Severity::Informational,
                    "Synchronized block will be ignored",
                );
            }
            _ => {}
        }
        Ok(())
    }
}

/// Why a call would make execution depend on the host, if it does.
///
/// `wait`, `notify` and `notifyAll` are final on `Object`, so they are
/// matched by signature whatever class the call names.
pub(crate) fn non_deterministic_reason(owner: &str, name: &str, descriptor: &str) -> Option<&'static str> {
    if is_monitor_method(name, descriptor) {
        return Some("uses threads");
    }
    match (owner, name) {
        (
            "java/lang/System",
            "currentTimeMillis" | "nanoTime",
        ) => Some("reads the host clock"),
        ("java/lang/System", "identityHashCode") => Some("depends on object identity"),
        ("java/lang/System", "gc" | "exit") => Some("controls the host runtime"),
        (
            "java/lang/System",
            "getenv" | "getProperty" | "load" | "loadLibrary",
        ) => Some("reads the host environment"),
        ("java/lang/Runtime", _) | ("java/lang/ProcessBuilder", _) => {
            Some("controls the host runtime")
        }
        ("java/lang/Thread", "start" | "sleep" | "yield" | "interrupt" | "join") => {
            Some("uses threads")
        }
        ("java/lang/Math" | "java/lang/StrictMath", "random") => Some("uses randomness"),
        _ => None,
    }
}

fn is_monitor_method(name: &str, descriptor: &str) -> bool {
    matches!(
        (name, descriptor),
        ("wait", "()V" | "(J)V" | "(JI)V") | ("notify" | "notifyAll", "()V")
    )
}

pub(crate) fn is_reflective_call(owner: &str, name: &str) -> bool {
    if owner.starts_with("java/lang/reflect/") {
        return true;
    }
    match owner {
        "java/lang/Class" => {
            matches!(
                name,
                "forName"
                    | "newInstance"
                    | "getMethod"
                    | "getMethods"
                    | "getField"
                    | "getFields"
                    | "getConstructor"
                    | "getConstructors"
            ) || name.starts_with("getDeclared")
        }
        "java/lang/invoke/MethodHandles$Lookup" => name.starts_with("find"),
        _ => false,
    }
}

fn is_permitted_bootstrap(owner: &str, name: &str) -> bool {
    matches!(
        (owner, name),
        ("java/lang/invoke/LambdaMetafactory", "metafactory" | "altMetafactory")
    )
}
