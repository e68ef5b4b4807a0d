//! Lightweight class headers for hierarchy queries.
//!
//! Headers are read from the first few hundred bytes of a class file and
//! never trigger rewriting, so assignability and common-superclass questions
//! can be answered while a class is still being transformed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tracing::trace;

use crate::classfile::{parse_class_header, ACC_ABSTRACT, ACC_ANNOTATION, ACC_ENUM, ACC_INTERFACE, ACC_PUBLIC};
use crate::remapper::{ClassResolver, SANDBOX_PREFIX};
use crate::source::SourceSet;

pub(crate) const OBJECT: &str = "java/lang/Object";
pub(crate) const THROWABLE: &str = "java/lang/Throwable";
pub(crate) const SANDBOX_OBJECT: &str = "sandbox/java/lang/Object";

/// Minimal structural facts about one class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassHeader {
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub access: u16,
}

impl ClassHeader {
    pub fn qualified_name(&self) -> String {
        self.name.replace('/', ".")
    }

    pub fn is_interface(&self) -> bool {
        self.access & ACC_INTERFACE != 0
    }

    pub fn is_enum(&self) -> bool {
        self.access & ACC_ENUM != 0
    }

    pub fn is_annotation(&self) -> bool {
        self.access & ACC_ANNOTATION != 0
    }
}

const INTERFACE: u16 = ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT;
const CLASS: u16 = ACC_PUBLIC;

struct Builtin {
    name: &'static str,
    super_name: Option<&'static str>,
    interfaces: &'static [&'static str],
    access: u16,
}

const fn class(name: &'static str, super_name: &'static str, interfaces: &'static [&'static str]) -> Builtin {
    Builtin {
        name,
        super_name: Some(super_name),
        interfaces,
        access: CLASS,
    }
}

const fn interface(name: &'static str, interfaces: &'static [&'static str]) -> Builtin {
    Builtin {
        name,
        super_name: Some(OBJECT),
        interfaces,
        access: INTERFACE,
    }
}

/// JDK and sandbox runtime classes known without reading any class file.
const BUILTINS: &[Builtin] = &[
    Builtin {
        name: OBJECT,
        super_name: None,
        interfaces: &[],
        access: CLASS,
    },
    interface("java/io/Serializable", &[]),
    interface("java/io/Closeable", &["java/lang/AutoCloseable"]),
    interface("java/lang/AutoCloseable", &[]),
    interface("java/lang/Appendable", &[]),
    interface("java/lang/CharSequence", &[]),
    interface("java/lang/Cloneable", &[]),
    interface("java/lang/Comparable", &[]),
    interface("java/lang/Iterable", &[]),
    interface("java/lang/Runnable", &[]),
    interface("java/lang/annotation/Annotation", &[]),
    class(
        "java/lang/String",
        OBJECT,
        &["java/io/Serializable", "java/lang/Comparable", "java/lang/CharSequence"],
    ),
    class("java/lang/AbstractStringBuilder", OBJECT, &["java/lang/Appendable", "java/lang/CharSequence"]),
    class(
        "java/lang/StringBuilder",
        "java/lang/AbstractStringBuilder",
        &["java/io/Serializable", "java/lang/Comparable", "java/lang/CharSequence"],
    ),
    class(
        "java/lang/StringBuffer",
        "java/lang/AbstractStringBuilder",
        &["java/io/Serializable", "java/lang/Comparable", "java/lang/CharSequence"],
    ),
    class("java/lang/Number", OBJECT, &["java/io/Serializable"]),
    class("java/lang/Byte", "java/lang/Number", &["java/lang/Comparable"]),
    class("java/lang/Short", "java/lang/Number", &["java/lang/Comparable"]),
    class("java/lang/Integer", "java/lang/Number", &["java/lang/Comparable"]),
    class("java/lang/Long", "java/lang/Number", &["java/lang/Comparable"]),
    class("java/lang/Float", "java/lang/Number", &["java/lang/Comparable"]),
    class("java/lang/Double", "java/lang/Number", &["java/lang/Comparable"]),
    class("java/lang/Boolean", OBJECT, &["java/io/Serializable", "java/lang/Comparable"]),
    class("java/lang/Character", OBJECT, &["java/io/Serializable", "java/lang/Comparable"]),
    class("java/lang/Math", OBJECT, &[]),
    class("java/lang/StrictMath", OBJECT, &[]),
    class("java/lang/System", OBJECT, &[]),
    class("java/lang/Runtime", OBJECT, &[]),
    class("java/lang/Thread", OBJECT, &["java/lang/Runnable"]),
    class("java/lang/Class", OBJECT, &["java/io/Serializable"]),
    class("java/lang/ClassLoader", OBJECT, &[]),
    class("java/lang/Enum", OBJECT, &["java/lang/Comparable", "java/io/Serializable"]),
    class("java/lang/Record", OBJECT, &[]),
    class("java/lang/Throwable", OBJECT, &["java/io/Serializable"]),
    class("java/lang/Exception", THROWABLE, &[]),
    class("java/lang/Error", THROWABLE, &[]),
    class("java/lang/RuntimeException", "java/lang/Exception", &[]),
    class("java/lang/ThreadDeath", "java/lang/Error", &[]),
    class("java/lang/VirtualMachineError", "java/lang/Error", &[]),
    class("java/lang/StackOverflowError", "java/lang/VirtualMachineError", &[]),
    class("java/lang/OutOfMemoryError", "java/lang/VirtualMachineError", &[]),
    class("java/lang/InternalError", "java/lang/VirtualMachineError", &[]),
    class("java/lang/LinkageError", "java/lang/Error", &[]),
    class("java/lang/AssertionError", "java/lang/Error", &[]),
    class("java/lang/ArithmeticException", "java/lang/RuntimeException", &[]),
    class("java/lang/ArrayStoreException", "java/lang/RuntimeException", &[]),
    class("java/lang/ClassCastException", "java/lang/RuntimeException", &[]),
    class("java/lang/IllegalArgumentException", "java/lang/RuntimeException", &[]),
    class("java/lang/IllegalStateException", "java/lang/RuntimeException", &[]),
    class("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException", &[]),
    class(
        "java/lang/ArrayIndexOutOfBoundsException",
        "java/lang/IndexOutOfBoundsException",
        &[],
    ),
    class(
        "java/lang/StringIndexOutOfBoundsException",
        "java/lang/IndexOutOfBoundsException",
        &[],
    ),
    class("java/lang/NegativeArraySizeException", "java/lang/RuntimeException", &[]),
    class("java/lang/NullPointerException", "java/lang/RuntimeException", &[]),
    class("java/lang/NumberFormatException", "java/lang/IllegalArgumentException", &[]),
    class("java/lang/UnsupportedOperationException", "java/lang/RuntimeException", &[]),
    class("java/lang/CloneNotSupportedException", "java/lang/Exception", &[]),
    class("java/lang/InterruptedException", "java/lang/Exception", &[]),
    class("java/lang/ReflectiveOperationException", "java/lang/Exception", &[]),
    class("java/lang/ClassNotFoundException", "java/lang/ReflectiveOperationException", &[]),
    class("java/io/IOException", "java/lang/Exception", &[]),
    class("java/util/NoSuchElementException", "java/lang/RuntimeException", &[]),
    class("java/util/ConcurrentModificationException", "java/lang/RuntimeException", &[]),
    interface("java/util/function/Function", &[]),
    interface("java/util/function/BiFunction", &[]),
    interface("java/util/function/UnaryOperator", &["java/util/function/Function"]),
    interface("java/util/function/Supplier", &[]),
    interface("java/util/function/Consumer", &[]),
    interface("java/util/function/Predicate", &[]),
    interface("java/util/Iterator", &[]),
    interface("java/util/Comparator", &[]),
    interface("java/util/RandomAccess", &[]),
    interface("java/util/Collection", &["java/lang/Iterable"]),
    interface("java/util/List", &["java/util/Collection"]),
    interface("java/util/Set", &["java/util/Collection"]),
    interface("java/util/Map", &[]),
    interface("java/util/Map$Entry", &[]),
    class("java/util/AbstractCollection", OBJECT, &["java/util/Collection"]),
    class("java/util/AbstractList", "java/util/AbstractCollection", &["java/util/List"]),
    class(
        "java/util/ArrayList",
        "java/util/AbstractList",
        &["java/util/List", "java/util/RandomAccess", "java/lang/Cloneable", "java/io/Serializable"],
    ),
    class("java/util/AbstractSet", "java/util/AbstractCollection", &["java/util/Set"]),
    class(
        "java/util/HashSet",
        "java/util/AbstractSet",
        &["java/util/Set", "java/lang/Cloneable", "java/io/Serializable"],
    ),
    class("java/util/AbstractMap", OBJECT, &["java/util/Map"]),
    class(
        "java/util/HashMap",
        "java/util/AbstractMap",
        &["java/util/Map", "java/lang/Cloneable", "java/io/Serializable"],
    ),
    class("java/util/LinkedHashMap", "java/util/HashMap", &["java/util/Map"]),
    class("java/util/Arrays", OBJECT, &[]),
    class("java/util/Collections", OBJECT, &[]),
    class("java/util/Objects", OBJECT, &[]),
    class("java/util/Optional", OBJECT, &[]),
    class("java/lang/invoke/CallSite", OBJECT, &[]),
    class("java/lang/invoke/LambdaMetafactory", OBJECT, &[]),
    class("java/lang/invoke/MethodHandle", OBJECT, &[]),
    class("java/lang/invoke/MethodHandles", OBJECT, &[]),
    class("java/lang/invoke/MethodHandles$Lookup", OBJECT, &[]),
    class("java/lang/invoke/MethodType", OBJECT, &["java/io/Serializable"]),
    class("java/lang/invoke/StringConcatFactory", OBJECT, &[]),
    class(SANDBOX_OBJECT, OBJECT, &[]),
    class("sandbox/java/lang/DJVM", OBJECT, &[]),
    class("sandbox/RuntimeCostAccounter", OBJECT, &[]),
];

fn builtin(name: &str) -> Option<ClassHeader> {
    BUILTINS.iter().find(|entry| entry.name == name).map(|entry| ClassHeader {
        name: entry.name.to_string(),
        super_name: entry.super_name.map(|value| value.to_string()),
        interfaces: entry.interfaces.iter().map(|value| value.to_string()).collect(),
        access: entry.access,
    })
}

/// Memoizing header lookup over the configured sources.
///
/// Sandboxed names (`sandbox/...`) resolve to the header of the host class
/// with every name remapped, matching what the rewriter will produce.
#[derive(Debug)]
pub struct ClassHierarchy {
    sources: Vec<Arc<SourceSet>>,
    resolver: ClassResolver,
    headers: RwLock<HashMap<String, Option<Arc<ClassHeader>>>>,
}

impl ClassHierarchy {
    pub fn new(sources: Vec<Arc<SourceSet>>, resolver: ClassResolver) -> Self {
        Self {
            sources,
            resolver,
            headers: RwLock::new(HashMap::new()),
        }
    }

    pub fn header(&self, name: &str) -> Result<Option<Arc<ClassHeader>>> {
        {
            let headers = self.headers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(found) = headers.get(name) {
                return Ok(found.clone());
            }
        }
        let header = self.load_header(name)?.map(Arc::new);
        let mut headers = self.headers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(headers.entry(name.to_string()).or_insert(header).clone())
    }

    pub fn require(&self, name: &str) -> Result<Arc<ClassHeader>> {
        self.header(name)?
            .with_context(|| format!("class {} not found", name.replace('/', ".")))
    }

    fn load_header(&self, name: &str) -> Result<Option<ClassHeader>> {
        if let Some(header) = builtin(name) {
            return Ok(Some(header));
        }
        if let Some(host_name) = name.strip_prefix(SANDBOX_PREFIX) {
            let Some(host) = self.header(host_name)? else {
                return Ok(None);
            };
            return Ok(Some(self.sandboxed(&host)));
        }
        for source in &self.sources {
            if let Some(found) = source.find(name)? {
                let raw = parse_class_header(&found.bytes)
                    .with_context(|| format!("read header of {}", found.uri))?;
                if raw.name != name {
                    anyhow::bail!("{} contains class {} instead of {}", found.uri, raw.name, name);
                }
                trace!(class = name, "read class header");
                return Ok(Some(ClassHeader {
                    name: raw.name,
                    super_name: raw.super_name,
                    interfaces: raw.interfaces,
                    access: raw.access_flags,
                }));
            }
        }
        Ok(None)
    }

    fn sandboxed(&self, host: &ClassHeader) -> ClassHeader {
        let super_name = host.super_name.as_ref().map(|value| {
            let mapped = self.resolver.resolve(value);
            if mapped == OBJECT && !host.is_interface() {
                SANDBOX_OBJECT.to_string()
            } else {
                mapped
            }
        });
        ClassHeader {
            name: self.resolver.resolve(&host.name),
            super_name,
            interfaces: host
                .interfaces
                .iter()
                .map(|value| self.resolver.resolve(value))
                .collect(),
            access: host.access,
        }
    }

    /// Every supertype of `name`, breadth first, starting with itself.
    /// Unknown supertypes end their branch.
    pub fn supertypes(&self, name: &str) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        let mut ordered = Vec::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            ordered.push(current.clone());
            let Some(header) = self.header(&current)? else {
                continue;
            };
            if let Some(super_name) = &header.super_name {
                queue.push_back(super_name.clone());
            }
            queue.extend(header.interfaces.iter().cloned());
        }
        Ok(ordered)
    }

    /// Whether a value of class `source` can be assigned to `target`.
    pub fn is_assignable_from(&self, target: &str, source: &str) -> Result<bool> {
        if target == source || target == OBJECT {
            return Ok(true);
        }
        Ok(self.supertypes(source)?.iter().any(|name| name == target))
    }

    /// Closest common superclass, following the usual class-writer rules:
    /// interfaces meet at `java/lang/Object`.
    pub fn common_superclass(&self, first: &str, second: &str) -> Result<String> {
        if self.is_assignable_from(first, second)? {
            return Ok(first.to_string());
        }
        if self.is_assignable_from(second, first)? {
            return Ok(second.to_string());
        }
        let first_header = self.require(first)?;
        let second_header = self.require(second)?;
        if first_header.is_interface() || second_header.is_interface() {
            return Ok(OBJECT.to_string());
        }
        let mut current = first_header;
        loop {
            let Some(super_name) = current.super_name.clone() else {
                return Ok(OBJECT.to_string());
            };
            if self.is_assignable_from(&super_name, second)? {
                return Ok(super_name);
            }
            match self.header(&super_name)? {
                Some(header) => current = header,
                None => return Ok(OBJECT.to_string()),
            }
        }
    }

    pub fn is_throwable(&self, name: &str) -> Result<bool> {
        let throwable = if name.starts_with(SANDBOX_PREFIX) {
            format!("{SANDBOX_PREFIX}{THROWABLE}")
        } else {
            THROWABLE.to_string()
        };
        self.is_assignable_from(&throwable, name)
    }

    pub fn cached_headers(&self) -> usize {
        self.headers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
