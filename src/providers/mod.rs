//! Definition providers: metadata transformations applied to a class and
//! its members before code is rewritten.
//!
//! Providers never edit in place. Each one returns a changed copy, and the
//! rewriter compares the final copy with the original to decide whether a
//! definition was modified.

use crate::analysis::configuration::AnalysisConfiguration;
use crate::classfile::{ACC_ABSTRACT, ACC_FINAL, ACC_NATIVE, ACC_STRICT, ACC_SYNCHRONIZED};
use crate::header::{OBJECT, SANDBOX_OBJECT};
use crate::ir::{ClassRepresentation, Member, MethodBody};

/// Class files in this version range honour `ACC_STRICT`.
const STRICT_FP_VERSIONS: std::ops::RangeInclusive<u16> = 46..=60;

const REFLECTION_PACKAGES: [&str; 3] = [
    "java/lang/reflect/",
    "jdk/internal/reflect/",
    "sun/reflect/",
];

/// What a provider may consult while it runs.
pub(crate) struct DefinitionContext<'a> {
    pub(crate) configuration: &'a AnalysisConfiguration,
    pub(crate) class: &'a ClassRepresentation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassDefinitionProvider {
    AlwaysInheritFromSandboxedObject,
}

impl ClassDefinitionProvider {
    pub fn name(&self) -> &'static str {
        match self {
            ClassDefinitionProvider::AlwaysInheritFromSandboxedObject => {
                "AlwaysInheritFromSandboxedObject"
            }
        }
    }

    pub(crate) fn define(
        &self,
        _configuration: &AnalysisConfiguration,
        class: &ClassRepresentation,
    ) -> ClassRepresentation {
        match self {
            ClassDefinitionProvider::AlwaysInheritFromSandboxedObject => {
                if class.is_interface() || class.super_name.as_deref() != Some(OBJECT) {
                    return class.clone();
                }
                ClassRepresentation {
                    super_name: Some(SANDBOX_OBJECT.to_string()),
                    ..class.clone()
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberDefinitionProvider {
    AlwaysUseNonSynchronizedMethods,
    AlwaysUseStrictFloatingPointArithmetic,
    StaticFieldsAreMutable,
    StubOutNativeMethods,
    StubOutFinalizerMethods,
    StubOutReflectionMethods,
}

impl MemberDefinitionProvider {
    pub fn name(&self) -> &'static str {
        match self {
            MemberDefinitionProvider::AlwaysUseNonSynchronizedMethods => {
                "AlwaysUseNonSynchronizedMethods"
            }
            MemberDefinitionProvider::AlwaysUseStrictFloatingPointArithmetic => {
                "AlwaysUseStrictFloatingPointArithmetic"
            }
            MemberDefinitionProvider::StaticFieldsAreMutable => "StaticFieldsAreMutable",
            MemberDefinitionProvider::StubOutNativeMethods => "StubOutNativeMethods",
            MemberDefinitionProvider::StubOutFinalizerMethods => "StubOutFinalizerMethods",
            MemberDefinitionProvider::StubOutReflectionMethods => "StubOutReflectionMethods",
        }
    }

    pub(crate) fn define(&self, context: &DefinitionContext<'_>, member: &Member) -> Member {
        match self {
            MemberDefinitionProvider::AlwaysUseNonSynchronizedMethods => {
                if member.is_method() && member.access & ACC_SYNCHRONIZED != 0 {
                    member.with_access(member.access & !ACC_SYNCHRONIZED)
                } else {
                    member.clone()
                }
            }
            MemberDefinitionProvider::AlwaysUseStrictFloatingPointArithmetic => {
                if member.is_method()
                    && !member.is_abstract()
                    && STRICT_FP_VERSIONS.contains(&context.class.api_version)
                {
                    member.with_access(member.access | ACC_STRICT)
                } else {
                    member.clone()
                }
            }
            MemberDefinitionProvider::StaticFieldsAreMutable => {
                // Interface fields must stay final; immutable classes are never reset.
                if member.is_field()
                    && member.is_static()
                    && member.is_final()
                    && !context.class.is_interface()
                    && !context.configuration.is_immutable(&context.class.name)
                {
                    member.with_access(member.access & !ACC_FINAL)
                } else {
                    member.clone()
                }
            }
            MemberDefinitionProvider::StubOutNativeMethods => {
                if member.is_method() && member.is_native() {
                    member
                        .with_access(member.access & !ACC_NATIVE)
                        .with_body(MethodBody::Throw("Native method has been deleted".to_string()))
                } else {
                    member.clone()
                }
            }
            MemberDefinitionProvider::StubOutFinalizerMethods => {
                if is_finalizer(member) && !member.is_abstract() {
                    member.with_body(MethodBody::ReturnDefault)
                } else {
                    member.clone()
                }
            }
            MemberDefinitionProvider::StubOutReflectionMethods => {
                let reflective = REFLECTION_PACKAGES
                    .iter()
                    .any(|package| context.class.name.starts_with(package));
                if reflective
                    && member.is_method()
                    && member.access & (ACC_ABSTRACT | ACC_NATIVE) == 0
                {
                    member.with_body(MethodBody::Throw(
                        "Disallowed reference to reflection API".to_string(),
                    ))
                } else {
                    member.clone()
                }
            }
        }
    }
}

fn is_finalizer(member: &Member) -> bool {
    member.member_name == "finalize" && member.descriptor == "()V" && !member.is_static()
}

pub fn default_class_providers() -> Vec<ClassDefinitionProvider> {
    vec![ClassDefinitionProvider::AlwaysInheritFromSandboxedObject]
}

pub fn default_member_providers() -> Vec<MemberDefinitionProvider> {
    vec![
        MemberDefinitionProvider::AlwaysUseNonSynchronizedMethods,
        MemberDefinitionProvider::AlwaysUseStrictFloatingPointArithmetic,
        MemberDefinitionProvider::StaticFieldsAreMutable,
        MemberDefinitionProvider::StubOutNativeMethods,
        MemberDefinitionProvider::StubOutFinalizerMethods,
        MemberDefinitionProvider::StubOutReflectionMethods,
    ]
}

/// Run every provider over a class and its members, in order.
pub(crate) fn apply_providers(
    configuration: &AnalysisConfiguration,
    class_providers: &[ClassDefinitionProvider],
    member_providers: &[MemberDefinitionProvider],
    class: &ClassRepresentation,
) -> ClassRepresentation {
    let mut defined = class_providers
        .iter()
        .fold(class.clone(), |current, provider| provider.define(configuration, &current));
    let snapshot = defined.clone();
    let context = DefinitionContext {
        configuration,
        class: &snapshot,
    };
    for member in defined.members.values_mut() {
        *member = member_providers
            .iter()
            .fold(member.clone(), |current, provider| provider.define(&context, &current));
    }
    defined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::builder::ClassBuilder;
    use crate::classfile::{ACC_INTERFACE, ACC_PUBLIC, ACC_STATIC};
    use crate::rules::test_support::configuration;

    fn defined(builder: ClassBuilder) -> (ClassRepresentation, ClassRepresentation) {
        let configuration = configuration();
        let class_file = builder.build_class_file();
        let class = ClassRepresentation::from_class_file(&class_file).expect("representation");
        let result = apply_providers(
            &configuration,
            &default_class_providers(),
            &default_member_providers(),
            &class,
        );
        (class, result)
    }

    #[test]
    fn classes_inherit_from_the_sandboxed_object() {
        let (original, result) = defined(ClassBuilder::new("com/example/Plain"));
        assert_eq!(original.super_name.as_deref(), Some(OBJECT));
        assert_eq!(result.super_name.as_deref(), Some(SANDBOX_OBJECT));

        let (_, interface) = defined(
            ClassBuilder::new("com/example/Shape").access(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT),
        );
        assert_eq!(interface.super_name.as_deref(), Some(OBJECT));
    }

    #[test]
    fn native_methods_are_stubbed_and_lose_their_flag() {
        let (original, result) = defined(
            ClassBuilder::new("com/example/Native").bodiless_method(ACC_PUBLIC | ACC_NATIVE, "poke", "()I"),
        );

        let stubbed = result.member("poke", "()I").expect("method");
        assert!(!stubbed.is_native());
        assert_eq!(
            stubbed.body,
            vec![MethodBody::Throw("Native method has been deleted".to_string())]
        );
        assert!(original.member("poke", "()I").expect("method").body.is_empty());
    }

    #[test]
    fn static_finals_become_mutable_and_flags_are_normalised() {
        let (_, result) = defined(
            ClassBuilder::new("com/example/Counter")
                .version(52)
                .field(ACC_PUBLIC | ACC_STATIC | ACC_FINAL, "LIMIT", "I")
                .field(ACC_PUBLIC | ACC_FINAL, "value", "I")
                .method(ACC_PUBLIC | ACC_SYNCHRONIZED, "next", "()I", |code| {
                    code.op(crate::opcodes::ICONST_0).op(crate::opcodes::IRETURN)
                })
                .method(ACC_PUBLIC, "finalize", "()V", |code| code.op_return()),
        );

        assert!(!result.member("LIMIT", "I").expect("field").is_final());
        assert!(result.member("value", "I").expect("field").is_final());
        let next = result.member("next", "()I").expect("method");
        assert_eq!(next.access & ACC_SYNCHRONIZED, 0);
        assert_ne!(next.access & ACC_STRICT, 0);
        assert_eq!(
            result.member("finalize", "()V").expect("finalizer").body,
            vec![MethodBody::ReturnDefault]
        );
    }

    #[test]
    fn strict_flag_is_not_added_to_modern_class_files() {
        let (_, result) = defined(
            ClassBuilder::new("com/example/Modern")
                .version(61)
                .method(ACC_PUBLIC, "run", "()V", |code| code.op_return()),
        );

        assert_eq!(result.member("run", "()V").expect("method").access & ACC_STRICT, 0);
    }
}
