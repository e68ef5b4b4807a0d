//! Discovery and validation of a class graph.
//!
//! Starting from the requested classes, every class is loaded (and so
//! validated and rewritten) once, then the references of its rewritten form
//! are followed breadth first. Each referenced class must resolve somewhere:
//! a source this loader can load from, the whitelist, or a known header.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::classfile::attributes::{self, parse_index_attribute};
use crate::classfile::{parse_class_bytes, Constant};
use crate::config::SandboxConfiguration;
use crate::descriptor::referenced_classes;
use crate::error::SandboxError;
use crate::loader::{LoadedClass, SandboxClassLoader};
use crate::messages::{Message, MessageCollection, Severity, SourceLocation};
use crate::references::EntityReference;
use crate::remapper::{ClassResolver, SANDBOX_PREFIX};
use crate::source::ClassSource;

pub mod configuration;
pub mod context;
pub(crate) mod validator;
pub mod whitelist;

use self::context::{AnalysisContext, DiscoveredClass};

pub(crate) const REFERENCE_VALIDATION: &str = "REFERENCE_VALIDATION";

/// Discover the graph reachable from `roots`. Problems are recorded in the
/// returned context; only infrastructure failures end the walk early.
pub fn discover(
    configuration: &Arc<SandboxConfiguration>,
    roots: &[ClassSource],
) -> Result<AnalysisContext, SandboxError> {
    let analysis = &configuration.analysis;
    let resolver = &analysis.class_resolver;
    let loader = SandboxClassLoader::new(configuration.clone());
    let mut context = AnalysisContext::new(MessageCollection::new(
        analysis.minimum_severity,
        analysis.prefix_filters.clone(),
    ));
    let mut seen = HashSet::new();
    let mut queue: VecDeque<ClassSource> = roots.iter().cloned().collect();

    while let Some(source) = queue.pop_front() {
        if !seen.insert(resolver.resolve(&source.internal_name())) {
            continue;
        }
        let loaded = match loader.load_class_with(&source, &mut context.messages) {
            Ok(loaded) => loaded,
            Err(SandboxError::ClassNotFound { class_name, origin }) => {
                let location = match &origin {
                    Some(origin) => SourceLocation::for_class(&origin.replace('.', "/"), None),
                    None => SourceLocation::for_class(&class_name.replace('.', "/"), None),
                };
                context.messages.add(Message {
                    location,
                    severity: Severity::Error,
                    message: format!("Class {} could not be found", class_name),
                    source: REFERENCE_VALIDATION.to_string(),
                });
                continue;
            }
            // Already recorded in the context's messages.
            Err(SandboxError::Validation { .. }) => continue,
            Err(error) => return Err(error),
        };
        let LoadedClass::Sandboxed {
            name,
            host_name,
            byte_code,
        } = loaded.as_ref()
        else {
            continue;
        };
        context.add_class(DiscoveredClass {
            host_name: host_name.clone(),
            sandbox_name: name.clone(),
            byte_code: byte_code.clone(),
        });

        let scanned = scan_references(&byte_code.bytes, resolver)
            .with_context(|| format!("scan references of {}", name))
            .map_err(|error| SandboxError::infrastructure(&error))?;
        let location = SourceLocation::for_class(host_name, scanned.source_file.as_deref());
        for reference in scanned.references {
            context.references.add(reference, location.clone());
        }
        for class_name in scanned.classes {
            if class_name == *name {
                continue;
            }
            if !class_name.starts_with(SANDBOX_PREFIX) && resolver.is_whitelisted(&class_name) {
                continue;
            }
            if loader.is_loadable(&class_name)? {
                context.record_origin(&resolver.reverse(&class_name), host_name);
                queue.push_back(ClassSource::from_class_name(&class_name, Some(host_name)));
                continue;
            }
            let known = analysis
                .hierarchy
                .header(&class_name)
                .map_err(|error| SandboxError::infrastructure(&error))?
                .is_some();
            if !known {
                context.messages.add(Message {
                    location: location.clone(),
                    severity: Severity::Error,
                    message: format!(
                        "Class {} could not be resolved",
                        resolver.reverse(&class_name).replace('/', ".")
                    ),
                    source: REFERENCE_VALIDATION.to_string(),
                });
            }
        }
    }
    info!(
        classes = context.classes().len(),
        errors = context.messages.error_count(),
        "discovered class graph"
    );
    Ok(context)
}

/// Discover, and fail when any error was recorded.
pub fn validate(
    configuration: &Arc<SandboxConfiguration>,
    roots: &[ClassSource],
) -> Result<AnalysisContext, SandboxError> {
    let context = discover(configuration, roots)?;
    if !context.messages.is_valid() {
        debug!(errors = context.messages.error_count(), "validation failed");
        return Err(SandboxError::Validation {
            messages: context.messages,
        });
    }
    Ok(context)
}

struct ScannedClass {
    source_file: Option<String>,
    /// Referenced class names as they appear in the rewritten class.
    classes: Vec<String>,
    /// References under their host names.
    references: Vec<EntityReference>,
}

fn scan_references(bytes: &[u8], resolver: &ClassResolver) -> anyhow::Result<ScannedClass> {
    let class_file = parse_class_bytes(bytes)?;
    let pool = &class_file.constant_pool;
    let mut classes: Vec<String> = Vec::new();
    let mut references = Vec::new();
    for (index, constant) in pool.entries() {
        match constant {
            Constant::Class { name_index } => {
                let name = pool.utf8(*name_index)?;
                push_class(&mut classes, name);
                if let Some(element) = element_class(name) {
                    references.push(EntityReference::class(&resolver.reverse(element)));
                }
            }
            Constant::Fieldref { .. } | Constant::Methodref { .. } | Constant::InterfaceMethodref { .. } => {
                let member = pool.member_ref(index)?;
                for class_name in referenced_classes(&member.descriptor) {
                    push_class(&mut classes, &class_name);
                }
                if let Some(owner) = element_class(&member.owner) {
                    references.push(EntityReference::member(
                        &resolver.reverse(owner),
                        &member.name,
                        &resolver.reverse_descriptor(&member.descriptor),
                    ));
                }
            }
            _ => {}
        }
    }
    let source_file = match class_file.find_attribute(&class_file.attributes, attributes::SOURCE_FILE) {
        Some(attribute) => Some(pool.utf8(parse_index_attribute(&attribute.info)?)?.to_string()),
        None => None,
    };
    Ok(ScannedClass {
        source_file,
        classes,
        references,
    })
}

fn push_class(classes: &mut Vec<String>, name: &str) {
    if let Some(element) = element_class(name) {
        if !classes.iter().any(|known| known == element) {
            classes.push(element.to_string());
        }
    }
}

/// Class named by an internal name or array descriptor; `None` for
/// primitive arrays.
fn element_class(name: &str) -> Option<&str> {
    if !name.starts_with('[') {
        return Some(name);
    }
    name.trim_start_matches('[')
        .strip_prefix('L')
        .and_then(|element| element.strip_suffix(';'))
}
