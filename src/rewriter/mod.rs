//! Turns a host class file into its sandboxed form.
//!
//! The constant pool is remapped into the sandbox namespace first, so
//! every index already in the class keeps pointing at the right entry.
//! Members are then rebuilt one by one: descriptors and attributes are
//! remapped, replacement bodies from the definition providers are
//! installed, and all other code goes through the emitters. Static
//! initialisation, method handle thunks and interface stitching run last.

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::analysis::configuration::AnalysisConfiguration;
use crate::classfile::attributes::{
    self, encode_bootstrap_methods, encode_enclosing_method, parse_bootstrap_methods,
    parse_enclosing_method, AnnotationLayout, BootstrapMethod,
};
use crate::classfile::code::{default_value, return_opcode, Insn};
use crate::classfile::{
    class_file_to_bytes, parse_class_bytes, Attribute, ClassFile, ConstantPool, MemberInfo,
};
use crate::config::SandboxConfiguration;
use crate::descriptor::{
    argument_slots, number_of_arguments, returns_value_or_reference, split_method_descriptor,
};
use crate::emitters::{Emitter, FAIL};
use crate::ir::{ClassRepresentation, ConstantValue, Member, MethodBody};
use crate::messages::{Message, MessageCollection, Severity, SourceLocation};
use crate::opcodes;
use crate::providers::apply_providers;
use crate::remapper::{
    remap_annotations, remap_class_signature_attribute, remap_constant_pool,
    remap_descriptor_index, remap_signature_attribute,
};

mod method;
pub(crate) mod reset;
mod stitching;
mod thunks;

use self::method::{rewrite_code, MethodScope};
use self::reset::{code_attribute, ResetScope};
use self::stitching::StitchScope;
use self::thunks::ThunkScope;

const MESSAGE_SOURCE: &str = "rewriter";

/// Output of [`ClassRewriter::rewrite`].
#[derive(Clone, Debug)]
pub struct RewrittenClass {
    /// Sandboxed internal name.
    pub name: String,
    pub bytes: Vec<u8>,
    /// Set when providers or emitters changed anything beyond names.
    pub is_modified: bool,
    pub is_annotation: bool,
}

pub struct ClassRewriter<'a> {
    configuration: &'a SandboxConfiguration,
}

/// Everything the per-member steps share.
struct ClassScope<'a> {
    analysis: &'a AnalysisConfiguration,
    emitters: &'a [Emitter],
    defined: &'a ClassRepresentation,
    original_pool: &'a ConstantPool,
    bootstrap_methods: &'a [BootstrapMethod],
    location: SourceLocation,
    strings_are_sandboxed: bool,
}

impl<'a> ClassRewriter<'a> {
    pub fn new(configuration: &'a SandboxConfiguration) -> Self {
        Self { configuration }
    }

    /// Rewrite one class. Failures of individual methods are recorded in
    /// `messages` and reported together once every member was visited.
    pub fn rewrite(&self, bytes: &[u8], messages: &mut MessageCollection) -> Result<RewrittenClass> {
        let class_file = parse_class_bytes(bytes).context("parse class file")?;
        let original = ClassRepresentation::from_class_file(&class_file)?;
        let analysis = self.configuration.analysis.as_ref();
        let resolver = &analysis.class_resolver;
        let defined = apply_providers(
            analysis,
            &self.configuration.class_providers,
            &self.configuration.member_providers,
            &original,
        );
        let mut is_modified = defined != original;
        let sandbox_name = resolver.resolve(&original.name);
        let immutable = analysis.is_immutable(&original.name);
        let emitters: Vec<Emitter> = self
            .configuration
            .emitters
            .iter()
            .copied()
            .filter(|emitter| !(immutable && emitter.is_tracing()))
            .collect();

        let original_pool = &class_file.constant_pool;
        let mut bootstrap_methods = match class_file
            .find_attribute(&class_file.attributes, attributes::BOOTSTRAP_METHODS)
        {
            Some(attribute) => parse_bootstrap_methods(&attribute.info)?,
            None => Vec::new(),
        };
        let mut pool = original_pool.clone();
        remap_constant_pool(&mut pool, resolver).context("remap constant pool")?;

        let scope = ClassScope {
            analysis,
            emitters: &emitters,
            defined: &defined,
            original_pool,
            bootstrap_methods: &bootstrap_methods,
            location: SourceLocation::for_class(&original.name, original.source_file.as_deref()),
            strings_are_sandboxed: resolver.is_mapped("java/lang/String"),
        };

        let super_name = defined.super_name.as_ref().map(|name| resolver.resolve(name));
        let super_class = match &super_name {
            Some(name) => pool.add_class(name)?,
            None => 0,
        };
        let mut interfaces = defined
            .interfaces
            .iter()
            .map(|name| pool.add_class(&resolver.resolve(name)))
            .collect::<Result<Vec<_>>>()?;

        let mut fields = Vec::with_capacity(class_file.fields.len());
        for info in &class_file.fields {
            fields.push(rewrite_field(&scope, &mut pool, info)?);
        }

        let mut methods = Vec::with_capacity(class_file.methods.len());
        let mut failures = 0usize;
        for info in &class_file.methods {
            match rewrite_method(&scope, &mut pool, info) {
                Ok((method, modified)) => {
                    is_modified |= modified;
                    methods.push(method);
                }
                Err(error) => {
                    let name = info.name(original_pool).unwrap_or("?");
                    let descriptor = info.descriptor(original_pool).unwrap_or("?");
                    warn!(class = %original.name, method = name, error = %format!("{error:#}"), "method rewrite failed");
                    messages.add(Message {
                        location: scope.location.for_member(name, descriptor),
                        severity: Severity::Error,
                        message: format!("{error:#}"),
                        source: MESSAGE_SOURCE.to_string(),
                    });
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            anyhow::bail!(
                "{} method(s) of {} could not be rewritten",
                failures,
                original.qualified_name()
            );
        }

        let mut class_attributes = Vec::with_capacity(class_file.attributes.len());
        let mut bootstrap_slot = None;
        for attribute in &class_file.attributes {
            let name = original_pool.utf8(attribute.name_index)?;
            let info = match name {
                attributes::SIGNATURE => remap_class_signature_attribute(
                    &mut pool,
                    resolver,
                    &attribute.info,
                    super_name.as_deref(),
                )?,
                attributes::RUNTIME_VISIBLE_ANNOTATIONS
                | attributes::RUNTIME_INVISIBLE_ANNOTATIONS => remap_annotations(
                    &mut pool,
                    resolver,
                    &attribute.info,
                    AnnotationLayout::Annotations,
                )?,
                attributes::RUNTIME_VISIBLE_TYPE_ANNOTATIONS
                | attributes::RUNTIME_INVISIBLE_TYPE_ANNOTATIONS => continue,
                attributes::ENCLOSING_METHOD => {
                    remap_enclosing_method(original_pool, &mut pool, &scope, &attribute.info)?
                }
                attributes::BOOTSTRAP_METHODS => {
                    bootstrap_slot = Some(class_attributes.len());
                    attribute.info.clone()
                }
                _ => attribute.info.clone(),
            };
            class_attributes.push(Attribute {
                name_index: attribute.name_index,
                info,
            });
        }

        is_modified |= reset::install(
            &ResetScope {
                configuration: analysis,
                class: &defined,
                sandbox_name: &sandbox_name,
                strings_are_sandboxed: scope.strings_are_sandboxed,
            },
            &mut pool,
            &mut methods,
        )?;
        if let Some(slot) = bootstrap_slot {
            let redirected = thunks::generate_thunks(
                &ThunkScope {
                    resolver,
                    sandbox_name: &sandbox_name,
                    is_interface: defined.is_interface(),
                },
                &mut pool,
                &mut bootstrap_methods,
                &mut methods,
            )?;
            if redirected {
                class_attributes[slot].info = encode_bootstrap_methods(&bootstrap_methods)?;
                is_modified = true;
            }
        }
        is_modified |= stitching::stitch(
            &StitchScope {
                resolver,
                class: &defined,
                sandbox_name: &sandbox_name,
            },
            &mut pool,
            &mut interfaces,
            &mut methods,
        )?;

        let rewritten = ClassFile {
            minor_version: class_file.minor_version,
            major_version: class_file.major_version,
            constant_pool: pool,
            access_flags: defined.access,
            this_class: class_file.this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes: class_attributes,
        };
        let bytes = class_file_to_bytes(&rewritten).context("write rewritten class")?;
        debug!(
            class = %original.name,
            sandboxed = %sandbox_name,
            is_modified,
            size = bytes.len(),
            "rewrote class"
        );
        Ok(RewrittenClass {
            name: sandbox_name,
            bytes,
            is_modified,
            is_annotation: original.is_annotation(),
        })
    }
}

fn defined_member<'s>(scope: &'s ClassScope<'_>, name: &str, descriptor: &str) -> Result<&'s Member> {
    scope
        .defined
        .member(name, descriptor)
        .with_context(|| format!("member {}{} vanished during definition", name, descriptor))
}

fn rewrite_field(scope: &ClassScope<'_>, pool: &mut ConstantPool, info: &MemberInfo) -> Result<MemberInfo> {
    let name = info.name(scope.original_pool)?;
    let descriptor = info.descriptor(scope.original_pool)?;
    let member = defined_member(scope, name, descriptor)?;
    let resolver = &scope.analysis.class_resolver;
    let string_value = matches!(member.value, Some(ConstantValue::String(_)));

    let mut field_attributes = Vec::with_capacity(info.attributes.len());
    for attribute in &info.attributes {
        let attribute_name = scope.original_pool.utf8(attribute.name_index)?;
        let rewritten = match attribute_name {
            // Initialised by the static initializer instead.
            attributes::CONSTANT_VALUE if string_value && scope.strings_are_sandboxed => continue,
            attributes::SIGNATURE => remap_signature_attribute(pool, resolver, &attribute.info)?,
            attributes::RUNTIME_VISIBLE_ANNOTATIONS | attributes::RUNTIME_INVISIBLE_ANNOTATIONS => {
                remap_annotations(pool, resolver, &attribute.info, AnnotationLayout::Annotations)?
            }
            attributes::RUNTIME_VISIBLE_TYPE_ANNOTATIONS
            | attributes::RUNTIME_INVISIBLE_TYPE_ANNOTATIONS => continue,
            _ => attribute.info.clone(),
        };
        field_attributes.push(Attribute {
            name_index: attribute.name_index,
            info: rewritten,
        });
    }
    Ok(MemberInfo {
        access_flags: member.access,
        name_index: info.name_index,
        descriptor_index: remap_descriptor_index(pool, resolver, info.descriptor_index)?,
        attributes: field_attributes,
    })
}

fn rewrite_method(
    scope: &ClassScope<'_>,
    pool: &mut ConstantPool,
    info: &MemberInfo,
) -> Result<(MemberInfo, bool)> {
    let name = info.name(scope.original_pool)?;
    let descriptor = info.descriptor(scope.original_pool)?;
    let member = defined_member(scope, name, descriptor)?;
    let resolver = &scope.analysis.class_resolver;
    let mut modified = false;

    let mut method_attributes = Vec::with_capacity(info.attributes.len() + 1);
    if let Some(body) = member.body.last() {
        method_attributes.push(stub_body(pool, member, body)?);
        modified = true;
    }
    for attribute in &info.attributes {
        let attribute_name = scope.original_pool.utf8(attribute.name_index)?;
        let rewritten = match attribute_name {
            attributes::CODE => {
                if !member.body.is_empty() {
                    continue;
                }
                let method_scope = MethodScope {
                    configuration: scope.analysis,
                    emitters: scope.emitters,
                    class: scope.defined,
                    member,
                    original_pool: scope.original_pool,
                    bootstrap_methods: scope.bootstrap_methods,
                };
                let code = rewrite_code(&method_scope, pool, &attribute.info)?;
                modified |= code.is_modified;
                code.info
            }
            attributes::SIGNATURE => remap_signature_attribute(pool, resolver, &attribute.info)?,
            attributes::RUNTIME_VISIBLE_ANNOTATIONS | attributes::RUNTIME_INVISIBLE_ANNOTATIONS => {
                remap_annotations(pool, resolver, &attribute.info, AnnotationLayout::Annotations)?
            }
            attributes::RUNTIME_VISIBLE_PARAMETER_ANNOTATIONS
            | attributes::RUNTIME_INVISIBLE_PARAMETER_ANNOTATIONS => remap_annotations(
                pool,
                resolver,
                &attribute.info,
                AnnotationLayout::ParameterAnnotations,
            )?,
            attributes::ANNOTATION_DEFAULT => {
                remap_annotations(pool, resolver, &attribute.info, AnnotationLayout::Default)?
            }
            attributes::RUNTIME_VISIBLE_TYPE_ANNOTATIONS
            | attributes::RUNTIME_INVISIBLE_TYPE_ANNOTATIONS => continue,
            _ => attribute.info.clone(),
        };
        method_attributes.push(Attribute {
            name_index: attribute.name_index,
            info: rewritten,
        });
    }

    let method = MemberInfo {
        access_flags: member.access,
        name_index: info.name_index,
        descriptor_index: remap_descriptor_index(pool, resolver, info.descriptor_index)?,
        attributes: method_attributes,
    };
    Ok((method, modified))
}

/// Code for a replaced method body.
fn stub_body(pool: &mut ConstantPool, member: &Member, body: &MethodBody) -> Result<Attribute> {
    let max_locals = argument_slots(&member.descriptor, member.is_static())?;
    debug!(
        method = %member.member_name,
        arguments = number_of_arguments(&member.descriptor),
        "replacing method body"
    );
    match body {
        MethodBody::Throw(message) => {
            let insns = vec![
                Insn::Ldc(pool.add_string(message)?),
                Insn::invoke_static(pool.add_method_ref(FAIL.owner, FAIL.name, FAIL.descriptor, false)?),
                Insn::Simple(opcodes::ATHROW),
            ];
            code_attribute(pool, insns, 1, max_locals)
        }
        MethodBody::ReturnDefault => {
            let (_, return_type) = split_method_descriptor(&member.descriptor)?;
            let mut insns = Vec::with_capacity(2);
            if returns_value_or_reference(&member.descriptor) {
                insns.push(default_value(return_type));
            }
            insns.push(Insn::Simple(return_opcode(return_type)));
            code_attribute(pool, insns, 2, max_locals)
        }
    }
}

fn remap_enclosing_method(
    original_pool: &ConstantPool,
    pool: &mut ConstantPool,
    scope: &ClassScope<'_>,
    info: &[u8],
) -> Result<Vec<u8>> {
    let (class_index, method_index) = parse_enclosing_method(info)?;
    if method_index == 0 {
        return Ok(info.to_vec());
    }
    let (name, descriptor) = original_pool.name_and_type(method_index)?;
    let mapped = scope.analysis.class_resolver.resolve_descriptor(descriptor);
    if mapped == descriptor {
        return Ok(info.to_vec());
    }
    Ok(encode_enclosing_method(
        class_index,
        pool.add_name_and_type(name, &mapped)?,
    ))
}
