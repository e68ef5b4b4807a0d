//! Sandbox configuration: built in code or read from a TOML document.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::analysis::configuration::{AnalysisConfiguration, DEFAULT_MAXIMUM_API_VERSION};
use crate::analysis::whitelist::Whitelist;
use crate::cache::ByteCodeCache;
use crate::costing::ExecutionProfile;
use crate::emitters::{by_priority, default_emitters, Emitter};
use crate::execution::context::ClassResetter;
use crate::messages::Severity;
use crate::providers::{
    default_class_providers, default_member_providers, ClassDefinitionProvider,
    MemberDefinitionProvider,
};
use crate::rules::{default_rules, Rule};
use crate::source::SourceSet;

/// Everything a run needs besides its input. Shared read-only by every run
/// and every child derived from it.
#[derive(Debug)]
pub struct SandboxConfiguration {
    pub rules: Vec<Rule>,
    /// Sorted by priority.
    pub emitters: Vec<Emitter>,
    pub class_providers: Vec<ClassDefinitionProvider>,
    pub member_providers: Vec<MemberDefinitionProvider>,
    pub execution_profile: ExecutionProfile,
    pub analysis: Arc<AnalysisConfiguration>,
    /// Validate the class graph before executing.
    pub validate: bool,
    /// Thread-name prefixes exempt from metering.
    pub filtered_threads: Vec<String>,
    byte_code_cache: Arc<ByteCodeCache>,
    resetter: Arc<ClassResetter>,
}

impl SandboxConfiguration {
    pub fn builder() -> SandboxConfigurationBuilder {
        SandboxConfigurationBuilder::default()
    }

    pub fn byte_code_cache(&self) -> &Arc<ByteCodeCache> {
        &self.byte_code_cache
    }

    pub fn resetter(&self) -> &Arc<ClassResetter> {
        &self.resetter
    }

    /// Whether tracing emitters are installed.
    pub fn is_tracing(&self) -> bool {
        self.emitters.iter().any(Emitter::is_tracing)
    }

    /// Derive a configuration that shares this one's caches. Options that
    /// change how classes are rewritten start a new cache lineage instead
    /// of reading through to ours.
    pub fn create_child(&self, options: ChildOptions) -> Result<SandboxConfiguration> {
        let rewrites_differently = options.changes_rewriting();
        let minimum_severity = options
            .minimum_severity
            .unwrap_or(self.analysis.minimum_severity);
        let prefix_filters = options
            .prefix_filters
            .unwrap_or_else(|| self.analysis.prefix_filters.clone());

        let analysis = if options.whitelist_patterns.is_empty() {
            self.analysis.with_severity(minimum_severity, prefix_filters)
        } else {
            let whitelist = Arc::new(self.analysis.whitelist.plus(&options.whitelist_patterns)?);
            let mut analysis = AnalysisConfiguration::new(
                whitelist,
                self.analysis.sources.clone(),
                self.analysis.bootstrap.clone(),
            );
            analysis.immutable_classes = self.analysis.immutable_classes.clone();
            analysis.maximum_api_version = self.analysis.maximum_api_version;
            analysis.minimum_severity = minimum_severity;
            analysis.prefix_filters = prefix_filters;
            analysis
        };

        // Reset registrations come from the cached classes, so they follow
        // the cache lineage.
        let (byte_code_cache, resetter) = if rewrites_differently {
            (Arc::new(ByteCodeCache::new()), Arc::new(ClassResetter::default()))
        } else {
            (
                Arc::new(ByteCodeCache::with_parent(self.byte_code_cache.clone())),
                self.resetter.clone(),
            )
        };
        debug!(shared_lineage = !rewrites_differently, "created child configuration");

        Ok(SandboxConfiguration {
            rules: options.rules.unwrap_or_else(|| self.rules.clone()),
            emitters: by_priority(&options.emitters.unwrap_or_else(|| self.emitters.clone())),
            class_providers: options
                .class_providers
                .unwrap_or_else(|| self.class_providers.clone()),
            member_providers: options
                .member_providers
                .unwrap_or_else(|| self.member_providers.clone()),
            execution_profile: options.execution_profile.unwrap_or(self.execution_profile),
            analysis: Arc::new(analysis),
            validate: options.validate.unwrap_or(self.validate),
            filtered_threads: self.filtered_threads.clone(),
            byte_code_cache,
            resetter,
        })
    }
}

/// Overrides for [`SandboxConfiguration::create_child`].
#[derive(Clone, Debug, Default)]
pub struct ChildOptions {
    /// Patterns added to the parent whitelist.
    pub whitelist_patterns: Vec<String>,
    pub rules: Option<Vec<Rule>>,
    pub emitters: Option<Vec<Emitter>>,
    pub class_providers: Option<Vec<ClassDefinitionProvider>>,
    pub member_providers: Option<Vec<MemberDefinitionProvider>>,
    pub execution_profile: Option<ExecutionProfile>,
    pub minimum_severity: Option<Severity>,
    pub prefix_filters: Option<Vec<String>>,
    pub validate: Option<bool>,
}

impl ChildOptions {
    fn changes_rewriting(&self) -> bool {
        !self.whitelist_patterns.is_empty()
            || self.rules.is_some()
            || self.emitters.is_some()
            || self.class_providers.is_some()
            || self.member_providers.is_some()
    }
}

pub struct SandboxConfigurationBuilder {
    whitelist: Whitelist,
    sources: SourceSet,
    bootstrap: Option<SourceSet>,
    rules: Vec<Rule>,
    emitters: Option<Vec<Emitter>>,
    class_providers: Vec<ClassDefinitionProvider>,
    member_providers: Vec<MemberDefinitionProvider>,
    execution_profile: ExecutionProfile,
    immutable_classes: BTreeSet<String>,
    tracing: bool,
    validate: bool,
    minimum_severity: Severity,
    prefix_filters: Vec<String>,
    maximum_api_version: u16,
    filtered_threads: Vec<String>,
}

impl Default for SandboxConfigurationBuilder {
    fn default() -> Self {
        Self {
            whitelist: Whitelist::minimal(),
            sources: SourceSet::default(),
            bootstrap: None,
            rules: default_rules(),
            emitters: None,
            class_providers: default_class_providers(),
            member_providers: default_member_providers(),
            execution_profile: ExecutionProfile::DEFAULT,
            immutable_classes: BTreeSet::new(),
            tracing: true,
            validate: true,
            minimum_severity: Severity::Warning,
            prefix_filters: Vec::new(),
            maximum_api_version: DEFAULT_MAXIMUM_API_VERSION,
            filtered_threads: Vec::new(),
        }
    }
}

impl SandboxConfigurationBuilder {
    pub fn whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn whitelist_patterns<I, S>(mut self, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.whitelist = self.whitelist.plus(patterns)?;
        Ok(self)
    }

    pub fn sources(mut self, sources: SourceSet) -> Self {
        self.sources = sources;
        self
    }

    pub fn bootstrap(mut self, bootstrap: SourceSet) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    /// Explicit emitters; overrides the tracing flag.
    pub fn emitters(mut self, emitters: Vec<Emitter>) -> Self {
        self.emitters = Some(emitters);
        self
    }

    pub fn class_providers(mut self, providers: Vec<ClassDefinitionProvider>) -> Self {
        self.class_providers = providers;
        self
    }

    pub fn member_providers(mut self, providers: Vec<MemberDefinitionProvider>) -> Self {
        self.member_providers = providers;
        self
    }

    pub fn execution_profile(mut self, profile: ExecutionProfile) -> Self {
        self.execution_profile = profile;
        self
    }

    pub fn immutable_class(mut self, class_name: &str) -> Self {
        self.immutable_classes.insert(class_name.replace('.', "/"));
        self
    }

    pub fn tracing(mut self, tracing: bool) -> Self {
        self.tracing = tracing;
        self
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn minimum_severity(mut self, severity: Severity) -> Self {
        self.minimum_severity = severity;
        self
    }

    pub fn prefix_filters(mut self, prefixes: Vec<String>) -> Self {
        self.prefix_filters = prefixes;
        self
    }

    pub fn maximum_api_version(mut self, version: u16) -> Self {
        self.maximum_api_version = version;
        self
    }

    pub fn filter_thread(mut self, prefix: &str) -> Self {
        self.filtered_threads.push(prefix.to_string());
        self
    }

    pub fn build(self) -> SandboxConfiguration {
        let mut analysis = AnalysisConfiguration::new(
            Arc::new(self.whitelist),
            Arc::new(self.sources),
            self.bootstrap.map(Arc::new),
        );
        analysis.immutable_classes = self.immutable_classes;
        analysis.minimum_severity = self.minimum_severity;
        analysis.prefix_filters = self.prefix_filters;
        analysis.maximum_api_version = self.maximum_api_version;
        let emitters = self
            .emitters
            .unwrap_or_else(|| default_emitters(self.tracing));

        SandboxConfiguration {
            rules: self.rules,
            emitters: by_priority(&emitters),
            class_providers: self.class_providers,
            member_providers: self.member_providers,
            execution_profile: self.execution_profile,
            analysis: Arc::new(analysis),
            validate: self.validate,
            filtered_threads: self.filtered_threads,
            byte_code_cache: Arc::new(ByteCodeCache::new()),
            resetter: Arc::new(ClassResetter::default()),
        }
    }
}

/// Execution profile in a settings file: a preset name or four thresholds.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProfileSetting {
    Preset(String),
    Custom(ExecutionProfile),
}

impl ProfileSetting {
    fn resolve(&self) -> Result<ExecutionProfile> {
        match self {
            ProfileSetting::Preset(name) => ExecutionProfile::preset(name)
                .with_context(|| format!("unknown execution profile {}", name)),
            ProfileSetting::Custom(profile) => Ok(*profile),
        }
    }
}

/// TOML form of a [`SandboxConfiguration`].
///
/// ```toml
/// profile = "unlimited"
/// whitelist = ["^com/example/shared/.*$"]
/// sources = ["build/classes"]
/// minimum_severity = "INFORMATIONAL"
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxSettings {
    pub profile: Option<ProfileSetting>,
    pub whitelist: Vec<String>,
    pub sources: Vec<PathBuf>,
    pub bootstrap_jar: Option<PathBuf>,
    pub immutable_classes: Vec<String>,
    pub tracing: Option<bool>,
    pub validate: Option<bool>,
    pub minimum_severity: Option<Severity>,
    pub maximum_api_version: Option<u16>,
    pub filtered_threads: Vec<String>,
}

impl SandboxSettings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("parse sandbox settings")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read settings {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Builder preloaded with these settings. Relative source paths are
    /// taken as they are.
    pub fn builder(&self) -> Result<SandboxConfigurationBuilder> {
        let mut builder = SandboxConfiguration::builder()
            .whitelist_patterns(&self.whitelist)?
            .sources(SourceSet::from_paths(&self.sources)?);
        if let Some(profile) = &self.profile {
            builder = builder.execution_profile(profile.resolve()?);
        }
        if let Some(bootstrap_jar) = &self.bootstrap_jar {
            builder = builder.bootstrap(SourceSet::from_paths(std::slice::from_ref(bootstrap_jar))?);
        }
        for class_name in &self.immutable_classes {
            builder = builder.immutable_class(class_name);
        }
        if let Some(tracing) = self.tracing {
            builder = builder.tracing(tracing);
        }
        if let Some(validate) = self.validate {
            builder = builder.validate(validate);
        }
        if let Some(severity) = self.minimum_severity {
            builder = builder.minimum_severity(severity);
        }
        if let Some(version) = self.maximum_api_version {
            builder = builder.maximum_api_version(version);
        }
        for prefix in &self.filtered_threads {
            builder = builder.filter_thread(prefix);
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ByteCode, CodeSource};

    fn byte_code() -> ByteCode {
        ByteCode {
            bytes: Arc::from(vec![0xca, 0xfe].into_boxed_slice()),
            is_modified: false,
            is_annotation: false,
            source: CodeSource::User("memory:/Task.class".to_string()),
        }
    }

    #[test]
    fn settings_accept_presets_and_explicit_thresholds() {
        let preset = SandboxSettings::from_toml_str(
            "profile = \"disable_branching\"\nminimum_severity = \"ERROR\"\ntracing = false\n",
        )
        .expect("settings");
        let configuration = preset.builder().expect("builder").build();

        assert_eq!(configuration.execution_profile, ExecutionProfile::DISABLE_BRANCHING);
        assert_eq!(configuration.analysis.minimum_severity, Severity::Error);
        assert!(!configuration.is_tracing());

        let custom = SandboxSettings::from_toml_str(
            "[profile]\nallocation_cost_threshold = 10\ninvocation_cost_threshold = 20\njump_cost_threshold = 30\nthrow_cost_threshold = 40\n",
        )
        .expect("settings");
        let configuration = custom.builder().expect("builder").build();

        assert_eq!(configuration.execution_profile.jump_cost_threshold, 30);
        assert!(configuration.is_tracing());
    }

    #[test]
    fn unknown_settings_and_presets_are_rejected() {
        assert!(SandboxSettings::from_toml_str("colour = \"blue\"\n").is_err());

        let settings = SandboxSettings::from_toml_str("profile = \"fastest\"\n").expect("settings");
        assert!(settings.builder().is_err());
    }

    #[test]
    fn settings_are_read_from_a_file() {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("djvm.toml");
        fs::write(&path, "whitelist = [\"^com/example/shared/.*$\"]\nimmutable_classes = [\"com.example.Constants\"]\n")
            .expect("write settings");

        let configuration = SandboxSettings::load(&path)
            .expect("load")
            .builder()
            .expect("builder")
            .build();

        assert!(configuration.analysis.whitelist.matches("com/example/shared/Money"));
        assert!(configuration.analysis.is_immutable("com/example/Constants"));
    }

    #[test]
    fn children_read_through_to_the_parent_cache() {
        let parent = SandboxConfiguration::builder().build();
        let cached = parent.byte_code_cache().insert("sandbox/com/example/Task", byte_code());

        let child = parent
            .create_child(ChildOptions {
                minimum_severity: Some(Severity::Trace),
                ..ChildOptions::default()
            })
            .expect("child");
        let sibling = parent.create_child(ChildOptions::default()).expect("sibling");

        let found = child
            .byte_code_cache()
            .get("sandbox/com/example/Task")
            .expect("inherited entry");
        assert!(Arc::ptr_eq(&found, &cached));
        assert!(Arc::ptr_eq(&child.analysis.hierarchy, &parent.analysis.hierarchy));
        assert!(Arc::ptr_eq(child.resetter(), parent.resetter()));

        child.byte_code_cache().insert("sandbox/com/example/Other", byte_code());
        child.byte_code_cache().clear();
        assert!(sibling.byte_code_cache().get("sandbox/com/example/Task").is_some());
        assert!(parent.byte_code_cache().contains_local("sandbox/com/example/Task"));
    }

    #[test]
    fn policy_changes_start_a_new_cache_lineage() {
        let parent = SandboxConfiguration::builder().build();
        parent.byte_code_cache().insert("sandbox/com/example/Task", byte_code());
        parent.resetter().register("sandbox/com/example/Task");

        let child = parent
            .create_child(ChildOptions {
                whitelist_patterns: vec!["^com/example/.*$".to_string()],
                ..ChildOptions::default()
            })
            .expect("child");

        assert!(child.byte_code_cache().get("sandbox/com/example/Task").is_none());
        assert!(child.analysis.whitelist.matches("com/example/Task"));
        assert!(!Arc::ptr_eq(child.resetter(), parent.resetter()));
        assert!(child.resetter().registered().is_empty());
        child.resetter().register("com/example/Task");
        assert_eq!(parent.resetter().registered(), vec!["sandbox/com/example/Task"]);
    }
}
