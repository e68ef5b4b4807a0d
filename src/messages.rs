use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a diagnostic, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Trace,
    Informational,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Trace => "TRACE",
            Severity::Informational => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Where in the analysed code a diagnostic or reference was found.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceLocation {
    pub class_name: String,
    pub source_file: Option<String>,
    pub member_name: Option<String>,
    pub descriptor: Option<String>,
    pub line_number: Option<u16>,
}

impl SourceLocation {
    pub fn for_class(class_name: &str, source_file: Option<&str>) -> Self {
        Self {
            class_name: class_name.to_string(),
            source_file: source_file.map(|value| value.to_string()),
            ..Self::default()
        }
    }

    pub fn for_member(&self, member_name: &str, descriptor: &str) -> Self {
        Self {
            member_name: Some(member_name.to_string()),
            descriptor: Some(descriptor.to_string()),
            line_number: None,
            ..self.clone()
        }
    }

    pub fn at_line(&self, line_number: Option<u16>) -> Self {
        Self {
            line_number,
            ..self.clone()
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class_name.replace('/', "."))?;
        if let Some(member_name) = &self.member_name {
            write!(f, ".{}", member_name)?;
            if let Some(descriptor) = &self.descriptor {
                write!(f, "{}", descriptor)?;
            }
        }
        match (&self.source_file, self.line_number) {
            (Some(file), Some(line)) => write!(f, " ({}:{})", file, line),
            (Some(file), None) => write!(f, " ({})", file),
            (None, Some(line)) => write!(f, " (line {})", line),
            (None, None) => Ok(()),
        }
    }
}

/// One diagnostic.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Message {
    pub location: SourceLocation,
    pub severity: Severity,
    pub message: String,
    /// Identifier of the rule or pass that raised the message.
    pub source: String,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.location, self.message)
    }
}

/// Ordered, de-duplicated diagnostics of one analysis.
#[derive(Clone, Debug)]
pub struct MessageCollection {
    minimum_severity: Severity,
    prefix_filters: Vec<String>,
    messages: BTreeSet<Message>,
}

impl Default for MessageCollection {
    fn default() -> Self {
        Self::new(Severity::Warning, Vec::new())
    }
}

impl MessageCollection {
    /// `prefix_filters` restricts recorded messages to classes whose name
    /// starts with one of the prefixes; an empty list records everything.
    pub fn new(minimum_severity: Severity, prefix_filters: Vec<String>) -> Self {
        Self {
            minimum_severity,
            prefix_filters,
            messages: BTreeSet::new(),
        }
    }

    pub fn add(&mut self, message: Message) {
        if message.severity < self.minimum_severity {
            return;
        }
        if !self.prefix_filters.is_empty()
            && !self
                .prefix_filters
                .iter()
                .any(|prefix| message.location.class_name.starts_with(prefix.as_str()))
        {
            return;
        }
        self.messages.insert(message);
    }

    pub fn extend(&mut self, other: &MessageCollection) {
        for message in &other.messages {
            self.add(message.clone());
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.messages
            .iter()
            .filter(|message| message.severity == severity)
            .count()
    }

    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    pub fn is_valid(&self) -> bool {
        self.error_count() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Messages ordered by location, then severity.
    pub fn sorted(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(|message| message.severity == Severity::Error)
    }

    pub fn for_class<'a>(&'a self, class_name: &'a str) -> impl Iterator<Item = &'a Message> {
        self.messages
            .iter()
            .filter(move |message| message.location.class_name == class_name)
    }

    pub fn minimum_severity(&self) -> Severity {
        self.minimum_severity
    }
}
