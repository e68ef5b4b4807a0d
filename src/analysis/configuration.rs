use std::collections::BTreeSet;
use std::sync::Arc;

use crate::analysis::whitelist::Whitelist;
use crate::header::ClassHierarchy;
use crate::messages::Severity;
use crate::remapper::ClassResolver;
use crate::source::SourceSet;

/// Newest class-file major version accepted by default (Java 17).
pub const DEFAULT_MAXIMUM_API_VERSION: u16 = 61;

/// Settings shared by discovery, validation and rewriting.
#[derive(Debug)]
pub struct AnalysisConfiguration {
    pub whitelist: Arc<Whitelist>,
    pub class_resolver: ClassResolver,
    pub sources: Arc<SourceSet>,
    /// Optional closed replacement API, searched before user sources.
    pub bootstrap: Option<Arc<SourceSet>>,
    pub hierarchy: Arc<ClassHierarchy>,
    /// Classes never reset and never instrumented for tracing.
    pub immutable_classes: BTreeSet<String>,
    pub minimum_severity: Severity,
    pub prefix_filters: Vec<String>,
    pub maximum_api_version: u16,
}

impl AnalysisConfiguration {
    pub fn new(
        whitelist: Arc<Whitelist>,
        sources: Arc<SourceSet>,
        bootstrap: Option<Arc<SourceSet>>,
    ) -> Self {
        let class_resolver = ClassResolver::new(whitelist.clone());
        let mut header_sources = Vec::new();
        if let Some(bootstrap) = &bootstrap {
            header_sources.push(bootstrap.clone());
        }
        header_sources.push(sources.clone());
        let hierarchy = Arc::new(ClassHierarchy::new(header_sources, class_resolver.clone()));
        Self {
            whitelist,
            class_resolver,
            sources,
            bootstrap,
            hierarchy,
            immutable_classes: BTreeSet::new(),
            minimum_severity: Severity::Warning,
            prefix_filters: Vec::new(),
            maximum_api_version: DEFAULT_MAXIMUM_API_VERSION,
        }
    }

    /// Host or sandboxed name listed as immutable.
    pub fn is_immutable(&self, class_name: &str) -> bool {
        self.immutable_classes.contains(class_name)
            || self
                .immutable_classes
                .contains(&self.class_resolver.reverse(class_name))
    }

    /// Copy that keeps the resolver and header memoization but records
    /// messages differently.
    pub fn with_severity(&self, minimum_severity: Severity, prefix_filters: Vec<String>) -> Self {
        Self {
            whitelist: self.whitelist.clone(),
            class_resolver: self.class_resolver.clone(),
            sources: self.sources.clone(),
            bootstrap: self.bootstrap.clone(),
            hierarchy: self.hierarchy.clone(),
            immutable_classes: self.immutable_classes.clone(),
            minimum_severity,
            prefix_filters,
            maximum_api_version: self.maximum_api_version,
        }
    }
}
