//! Class loading for one runtime context.
//!
//! A class is looked up in this order: whitelisted host classes are shared
//! unmodified, then the byte-code cache of the configuration lineage, then
//! the bootstrap source (sandbox runtime classes as they are, API classes
//! rewritten), then the user sources. Anything else is not found, reported
//! under its original name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, trace, warn};

use crate::analysis::validator::apply_rules;
use crate::cache::{ByteCode, CodeSource};
use crate::classfile::{parse_class_bytes, parse_class_header, ACC_ANNOTATION};
use crate::config::SandboxConfiguration;
use crate::error::SandboxError;
use crate::messages::MessageCollection;
use crate::remapper::SANDBOX_PREFIX;
use crate::rewriter::ClassRewriter;
use crate::source::{ClassBytes, ClassSource};

/// A class as the runtime sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadedClass {
    /// Whitelisted class shared with the host.
    Host { name: String },
    Sandboxed {
        /// Sandboxed internal name.
        name: String,
        /// Name the class had in its source.
        host_name: String,
        byte_code: Arc<ByteCode>,
    },
}

impl LoadedClass {
    pub fn name(&self) -> &str {
        match self {
            LoadedClass::Host { name } | LoadedClass::Sandboxed { name, .. } => name,
        }
    }

    pub fn host_name(&self) -> &str {
        match self {
            LoadedClass::Host { name } => name,
            LoadedClass::Sandboxed { host_name, .. } => host_name,
        }
    }

    pub fn byte_code(&self) -> Option<&Arc<ByteCode>> {
        match self {
            LoadedClass::Host { .. } => None,
            LoadedClass::Sandboxed { byte_code, .. } => Some(byte_code),
        }
    }
}

/// Where a not yet loaded class would come from.
enum Origin {
    Runtime(ClassBytes),
    Bootstrap(ClassBytes),
    User(ClassBytes),
}

#[derive(Debug)]
pub struct SandboxClassLoader {
    configuration: Arc<SandboxConfiguration>,
    loaded: RwLock<HashMap<String, Arc<LoadedClass>>>,
}

impl SandboxClassLoader {
    pub fn new(configuration: Arc<SandboxConfiguration>) -> Self {
        Self {
            configuration,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    pub fn configuration(&self) -> &Arc<SandboxConfiguration> {
        &self.configuration
    }

    /// Number of classes this loader has handed out.
    pub fn loaded_count(&self) -> usize {
        self.loaded
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn load_class(&self, source: &ClassSource) -> Result<Arc<LoadedClass>, SandboxError> {
        let analysis = &self.configuration.analysis;
        let mut messages =
            MessageCollection::new(analysis.minimum_severity, analysis.prefix_filters.clone());
        self.load_class_with(source, &mut messages)
    }

    /// Load a class by host or sandboxed name, adding whatever validation
    /// reports to `messages`.
    pub fn load_class_with(
        &self,
        source: &ClassSource,
        messages: &mut MessageCollection,
    ) -> Result<Arc<LoadedClass>, SandboxError> {
        let internal_name = source.internal_name();
        let resolver = &self.configuration.analysis.class_resolver;
        if !internal_name.starts_with(SANDBOX_PREFIX) && resolver.is_whitelisted(&internal_name) {
            trace!(class = %internal_name, "sharing whitelisted host class");
            return Ok(self.remember(LoadedClass::Host {
                name: internal_name,
            }));
        }
        let sandbox_name = resolver.resolve(&internal_name);
        let host_name = resolver.reverse(&sandbox_name);

        if let Some(loaded) = self.loaded_class(&sandbox_name) {
            return Ok(loaded);
        }
        if let Some(byte_code) = self.configuration.byte_code_cache().get(&sandbox_name) {
            trace!(class = %sandbox_name, "byte-code cache hit");
            return Ok(self.remember(LoadedClass::Sandboxed {
                name: sandbox_name,
                host_name,
                byte_code,
            }));
        }

        let origin = self
            .find(&sandbox_name, &host_name)
            .map_err(|error| SandboxError::infrastructure(&error))?;
        let byte_code = match origin {
            Some(Origin::Runtime(found)) => {
                let header = parse_class_header(&found.bytes)
                    .map_err(|error| SandboxError::infrastructure(&error))?;
                ByteCode {
                    bytes: Arc::from(found.bytes),
                    is_modified: false,
                    is_annotation: header.access_flags & ACC_ANNOTATION != 0,
                    source: CodeSource::Runtime(found.uri),
                }
            }
            Some(Origin::Bootstrap(found)) => {
                let uri = found.uri.clone();
                self.rewrite(source, &host_name, found, CodeSource::Bootstrap(uri), messages)?
            }
            Some(Origin::User(found)) => {
                let uri = found.uri.clone();
                self.rewrite(source, &host_name, found, CodeSource::User(uri), messages)?
            }
            None => {
                debug!(class = %host_name, origin = ?source.origin, "class not found");
                return Err(SandboxError::ClassNotFound {
                    class_name: host_name.replace('/', "."),
                    origin: source.origin.clone(),
                });
            }
        };
        let byte_code = self.configuration.byte_code_cache().insert(&sandbox_name, byte_code);
        Ok(self.remember(LoadedClass::Sandboxed {
            name: sandbox_name,
            host_name,
            byte_code,
        }))
    }

    /// Whether a (sandboxed) class has bytes this loader could produce.
    pub fn is_loadable(&self, class_name: &str) -> Result<bool, SandboxError> {
        let resolver = &self.configuration.analysis.class_resolver;
        if !class_name.starts_with(SANDBOX_PREFIX) && resolver.is_whitelisted(class_name) {
            return Ok(false);
        }
        let sandbox_name = resolver.resolve(class_name);
        if self.configuration.byte_code_cache().get(&sandbox_name).is_some() {
            return Ok(true);
        }
        let host_name = resolver.reverse(&sandbox_name);
        self.find(&sandbox_name, &host_name)
            .map(|origin| origin.is_some())
            .map_err(|error| SandboxError::infrastructure(&error))
    }

    fn find(&self, sandbox_name: &str, host_name: &str) -> anyhow::Result<Option<Origin>> {
        let analysis = &self.configuration.analysis;
        if let Some(bootstrap) = &analysis.bootstrap {
            if let Some(found) = bootstrap.find(sandbox_name)? {
                return Ok(Some(Origin::Runtime(found)));
            }
            if let Some(found) = bootstrap.find(host_name)? {
                return Ok(Some(Origin::Bootstrap(found)));
            }
        }
        Ok(analysis.sources.find(host_name)?.map(Origin::User))
    }

    fn rewrite(
        &self,
        source: &ClassSource,
        host_name: &str,
        found: ClassBytes,
        code_source: CodeSource,
        messages: &mut MessageCollection,
    ) -> Result<ByteCode, SandboxError> {
        let header = parse_class_header(&found.bytes).map_err(|error| SandboxError::infrastructure(&error))?;
        if header.name != host_name {
            warn!(uri = %found.uri, expected = host_name, actual = %header.name, "class name mismatch");
            return Err(SandboxError::ClassNotFound {
                class_name: host_name.replace('/', "."),
                origin: source.origin.clone(),
            });
        }

        let analysis = &self.configuration.analysis;
        let mut local = MessageCollection::new(analysis.minimum_severity, analysis.prefix_filters.clone());
        let outcome = self.validate_and_rewrite(&found.bytes, &mut local);
        messages.extend(&local);
        match outcome {
            Ok(rewritten) if local.is_valid() => {
                debug!(
                    class = %rewritten.name,
                    uri = %found.uri,
                    is_modified = rewritten.is_modified,
                    "loaded sandboxed class"
                );
                Ok(ByteCode {
                    bytes: Arc::from(rewritten.bytes),
                    is_modified: rewritten.is_modified,
                    is_annotation: rewritten.is_annotation,
                    source: code_source,
                })
            }
            Ok(_) => Err(SandboxError::Validation { messages: local }),
            Err(_) if !local.is_valid() => Err(SandboxError::Validation { messages: local }),
            Err(error) => Err(SandboxError::infrastructure(&error)),
        }
    }

    fn validate_and_rewrite(
        &self,
        bytes: &[u8],
        messages: &mut MessageCollection,
    ) -> anyhow::Result<crate::rewriter::RewrittenClass> {
        let class_file = parse_class_bytes(bytes)?;
        apply_rules(&self.configuration.analysis, &self.configuration.rules, &class_file, messages)?;
        if !messages.is_valid() {
            anyhow::bail!("{} failed validation", class_file.name()?);
        }
        ClassRewriter::new(&self.configuration).rewrite(bytes, messages)
    }

    fn loaded_class(&self, sandbox_name: &str) -> Option<Arc<LoadedClass>> {
        self.loaded
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(sandbox_name)
            .cloned()
    }

    fn remember(&self, class: LoadedClass) -> Arc<LoadedClass> {
        let mut loaded = self
            .loaded
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loaded
            .entry(class.name().to_string())
            .or_insert_with(|| Arc::new(class))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::builder::ClassBuilder;
    use crate::classfile::{ACC_PUBLIC, ACC_STATIC};
    use crate::config::ChildOptions;
    use crate::opcodes;
    use crate::source::SourceSet;

    fn configuration(classes: Vec<(&str, Vec<u8>)>) -> Arc<SandboxConfiguration> {
        let sources = SourceSet::in_memory(
            classes
                .into_iter()
                .map(|(name, bytes)| (name.to_string(), bytes)),
        );
        Arc::new(SandboxConfiguration::builder().sources(sources).build())
    }

    fn task() -> Vec<u8> {
        ClassBuilder::new("com/example/Task")
            .method(ACC_PUBLIC, "<init>", "()V", |code| code.call_object_init().op_return())
            .build()
    }

    #[test]
    fn user_classes_are_rewritten_and_cached() {
        let configuration = configuration(vec![("com/example/Task", task())]);
        let loader = SandboxClassLoader::new(configuration.clone());

        let loaded = loader
            .load_class(&ClassSource::from_class_name("com.example.Task", None))
            .expect("load");

        assert_eq!(loaded.name(), "sandbox/com/example/Task");
        assert_eq!(loaded.host_name(), "com/example/Task");
        let byte_code = loaded.byte_code().expect("sandboxed");
        assert!(matches!(byte_code.source, CodeSource::User(_)));
        assert!(configuration.byte_code_cache().contains_local("sandbox/com/example/Task"));

        let again = loader
            .load_class(&ClassSource::from_class_name("sandbox.com.example.Task", None))
            .expect("load by sandboxed name");
        assert!(Arc::ptr_eq(&loaded, &again));
        assert_eq!(loader.loaded_count(), 1);
    }

    #[test]
    fn whitelisted_classes_are_shared() {
        let loader = SandboxClassLoader::new(configuration(Vec::new()));

        let loaded = loader
            .load_class(&ClassSource::from_class_name("java.lang.Object", None))
            .expect("load");

        assert_eq!(*loaded, LoadedClass::Host {
            name: "java/lang/Object".to_string()
        });
    }

    #[test]
    fn missing_classes_keep_their_original_name() {
        let loader = SandboxClassLoader::new(configuration(Vec::new()));

        let error = loader
            .load_class(&ClassSource::from_class_name(
                "sandbox.com.example.Missing",
                Some("com.example.Task"),
            ))
            .expect_err("missing");

        assert_eq!(
            error.to_string(),
            "class com.example.Missing not found (referenced from com.example.Task)"
        );
    }

    #[test]
    fn rule_violations_fail_the_load_with_their_messages() {
        let clock = ClassBuilder::new("com/example/Clock")
            .method(ACC_PUBLIC | ACC_STATIC, "now", "()J", |code| {
                code.invoke_static("java/lang/System", "nanoTime", "()J")
                    .op(opcodes::LRETURN)
            })
            .build();
        let configuration = configuration(vec![("com/example/Clock", clock)]);
        let loader = SandboxClassLoader::new(configuration.clone());
        let mut messages = MessageCollection::default();

        let error = loader
            .load_class_with(&ClassSource::from_class_name("com.example.Clock", None), &mut messages)
            .expect_err("rejected");

        let SandboxError::Validation { messages: failure } = error else {
            panic!("expected a validation failure");
        };
        assert_eq!(failure.error_count(), 1);
        assert_eq!(messages.error_count(), 1);
        assert!(configuration.byte_code_cache().is_empty());
    }

    #[test]
    fn children_reuse_the_parent_rewrite() {
        let parent = configuration(vec![("com/example/Task", task())]);
        let first = SandboxClassLoader::new(parent.clone())
            .load_class(&ClassSource::from_class_name("com.example.Task", None))
            .expect("parent load");
        let child = Arc::new(parent.create_child(ChildOptions::default()).expect("child"));

        let second = SandboxClassLoader::new(child.clone())
            .load_class(&ClassSource::from_class_name("com.example.Task", None))
            .expect("child load");

        assert!(Arc::ptr_eq(
            first.byte_code().expect("parent bytes"),
            second.byte_code().expect("child bytes")
        ));
        assert!(!child.byte_code_cache().contains_local("sandbox/com/example/Task"));
    }

    #[test]
    fn misplaced_class_files_are_not_found() {
        let configuration = configuration(vec![("com/example/Task", ClassBuilder::new("com/example/Other").build())]);
        let loader = SandboxClassLoader::new(configuration);

        let error = loader
            .load_class(&ClassSource::from_class_name("com.example.Task", None))
            .expect_err("mismatch");

        assert!(matches!(error, SandboxError::ClassNotFound { .. }));
    }
}
