use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::cache::ByteCode;
use crate::messages::MessageCollection;
use crate::references::ReferenceMap;

/// One class found during discovery.
#[derive(Clone, Debug)]
pub struct DiscoveredClass {
    /// Name in the user's sources.
    pub host_name: String,
    pub sandbox_name: String,
    pub byte_code: Arc<ByteCode>,
}

/// What one discovery pass accumulates.
///
/// Classes get a stable slot in discovery order; lookups by name go through
/// an index into that table.
#[derive(Debug)]
pub struct AnalysisContext {
    classes: Vec<DiscoveredClass>,
    slots: HashMap<String, usize>,
    pub references: ReferenceMap,
    pub messages: MessageCollection,
    /// Host class name to the classes that first referred to it.
    origins: BTreeMap<String, BTreeSet<String>>,
}

impl AnalysisContext {
    pub fn new(messages: MessageCollection) -> Self {
        Self {
            classes: Vec::new(),
            slots: HashMap::new(),
            references: ReferenceMap::default(),
            messages,
            origins: BTreeMap::new(),
        }
    }

    /// Slot of the class, adding it when it is new.
    pub fn add_class(&mut self, class: DiscoveredClass) -> usize {
        if let Some(slot) = self.slots.get(&class.host_name) {
            return *slot;
        }
        let slot = self.classes.len();
        self.slots.insert(class.host_name.clone(), slot);
        self.classes.push(class);
        slot
    }

    pub fn class(&self, host_name: &str) -> Option<&DiscoveredClass> {
        self.slots.get(host_name).map(|slot| &self.classes[*slot])
    }

    pub fn classes(&self) -> &[DiscoveredClass] {
        &self.classes
    }

    pub fn record_origin(&mut self, class_name: &str, origin: &str) {
        self.origins
            .entry(class_name.to_string())
            .or_default()
            .insert(origin.to_string());
    }

    /// Classes that referred to `class_name`.
    pub fn origins_of(&self, class_name: &str) -> impl Iterator<Item = &str> {
        self.origins
            .get(class_name)
            .into_iter()
            .flat_map(|origins| origins.iter().map(String::as_str))
    }
}
