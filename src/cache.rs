use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

/// Where a loaded class came from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodeSource {
    /// Sandbox runtime class served as-is by the bootstrap source.
    Runtime(String),
    /// Class rewritten from the bootstrap API source.
    Bootstrap(String),
    /// Class rewritten from a user source.
    User(String),
}

impl CodeSource {
    pub fn uri(&self) -> &str {
        match self {
            CodeSource::Runtime(uri) | CodeSource::Bootstrap(uri) | CodeSource::User(uri) => uri,
        }
    }
}

/// Rewritten class bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteCode {
    pub bytes: Arc<[u8]>,
    /// Set when providers or emitters changed anything beyond names.
    pub is_modified: bool,
    pub is_annotation: bool,
    pub source: CodeSource,
}

/// Byte-code cache for one configuration lineage.
///
/// Lookups walk up to the parent cache; inserts and clears only touch this
/// level, so sibling configurations never see each other's entries.
#[derive(Debug, Default)]
pub struct ByteCodeCache {
    parent: Option<Arc<ByteCodeCache>>,
    entries: RwLock<HashMap<String, Arc<ByteCode>>>,
}

impl ByteCodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: Arc<ByteCodeCache>) -> Self {
        Self {
            parent: Some(parent),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn parent(&self) -> Option<&Arc<ByteCodeCache>> {
        self.parent.as_ref()
    }

    /// Entry for a sandboxed class name, searching ancestors as well.
    pub fn get(&self, class_name: &str) -> Option<Arc<ByteCode>> {
        let found = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(class_name)
            .cloned();
        match found {
            Some(entry) => Some(entry),
            None => self.parent.as_ref().and_then(|parent| parent.get(class_name)),
        }
    }

    /// Store an entry, keeping any entry a concurrent loader stored first.
    pub fn insert(&self, class_name: &str, byte_code: ByteCode) -> Arc<ByteCode> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = entries
            .entry(class_name.to_string())
            .or_insert_with(|| Arc::new(byte_code))
            .clone();
        debug!(class = class_name, size = entry.bytes.len(), "cached byte code");
        entry
    }

    pub fn contains_local(&self, class_name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(class_name)
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_code(bytes: &[u8]) -> ByteCode {
        ByteCode {
            bytes: Arc::from(bytes),
            is_modified: true,
            is_annotation: false,
            source: CodeSource::User("memory:/Task.class".to_string()),
        }
    }

    #[test]
    fn children_see_parent_entries() {
        let parent = Arc::new(ByteCodeCache::new());
        let stored = parent.insert("sandbox/com/example/Task", byte_code(&[1, 2, 3]));
        let child = ByteCodeCache::with_parent(parent.clone());

        let found = child.get("sandbox/com/example/Task").expect("inherited");

        assert!(Arc::ptr_eq(&stored, &found));
        assert!(!child.contains_local("sandbox/com/example/Task"));
    }

    #[test]
    fn clearing_a_child_leaves_parent_and_siblings_alone() {
        let parent = Arc::new(ByteCodeCache::new());
        parent.insert("sandbox/A", byte_code(&[1]));
        let first = ByteCodeCache::with_parent(parent.clone());
        let second = ByteCodeCache::with_parent(parent.clone());
        first.insert("sandbox/B", byte_code(&[2]));
        second.insert("sandbox/C", byte_code(&[3]));

        first.clear();

        assert!(first.get("sandbox/B").is_none());
        assert!(first.get("sandbox/A").is_some());
        assert!(second.get("sandbox/C").is_some());
        assert_eq!(parent.len(), 1);
    }

    #[test]
    fn first_insert_wins() {
        let cache = ByteCodeCache::new();
        let first = cache.insert("sandbox/A", byte_code(&[1]));
        let second = cache.insert("sandbox/A", byte_code(&[2]));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(&*second.bytes, &[1]);
    }
}
