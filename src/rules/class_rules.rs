use anyhow::Result;

use crate::ir::ClassRepresentation;
use crate::messages::Severity;
use crate::remapper::SANDBOX_PREFIX;
use crate::rules::{RuleContext, RuleMetadata};

/// Oldest class-file major version the sandbox accepts (Java 1.1).
const MINIMUM_API_VERSION: u16 = 45;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassRule {
    DisallowUnsupportedApiVersions,
    DisallowOverriddenSandboxPackage,
}

impl ClassRule {
    pub fn metadata(&self) -> RuleMetadata {
        match self {
            ClassRule::DisallowUnsupportedApiVersions => RuleMetadata {
                id: "DISALLOW_UNSUPPORTED_API_VERSIONS",
                name: "Unsupported class file version",
                description: "Class files newer than the configured maximum version",
            },
            ClassRule::DisallowOverriddenSandboxPackage => RuleMetadata {
                id: "DISALLOW_OVERRIDDEN_SANDBOX_PACKAGE",
                name: "Class in the sandbox namespace",
                description: "User classes declared inside the reserved sandbox package",
            },
        }
    }

    pub(crate) fn validate(&self, context: &mut RuleContext<'_>, class: &ClassRepresentation) -> Result<()> {
        let metadata = self.metadata();
        match self {
            ClassRule::DisallowUnsupportedApiVersions => {
                let maximum = context.configuration.maximum_api_version;
                if class.api_version < MINIMUM_API_VERSION || class.api_version > maximum {
                    context.report(
                        &metadata,
                        Severity::Error,
                        format!(
                            "Unsupported class file version {} (supported {} to {})",
                            class.api_version, MINIMUM_API_VERSION, maximum
                        ),
                    );
                }
            }
            ClassRule::DisallowOverriddenSandboxPackage => {
                if class.name.starts_with(SANDBOX_PREFIX) {
                    context.report(
                        &metadata,
                        Severity::Error,
                        "Cannot load class explicitly defined in the 'sandbox' root namespace",
                    );
                }
            }
        }
        Ok(())
    }
}
