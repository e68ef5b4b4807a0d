use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::messages::SourceLocation;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassReference {
    pub class_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberReference {
    pub class_name: String,
    pub member_name: String,
    pub descriptor: String,
}

/// Structural identity of a referenced class or member.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityReference {
    Class(ClassReference),
    Member(MemberReference),
}

impl EntityReference {
    pub fn class(class_name: &str) -> Self {
        EntityReference::Class(ClassReference {
            class_name: class_name.to_string(),
        })
    }

    pub fn member(class_name: &str, member_name: &str, descriptor: &str) -> Self {
        EntityReference::Member(MemberReference {
            class_name: class_name.to_string(),
            member_name: member_name.to_string(),
            descriptor: descriptor.to_string(),
        })
    }

    pub fn class_name(&self) -> &str {
        match self {
            EntityReference::Class(reference) => &reference.class_name,
            EntityReference::Member(reference) => &reference.class_name,
        }
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityReference::Class(reference) => write!(f, "{}", reference.class_name),
            EntityReference::Member(reference) => write!(
                f,
                "{}.{}:{}",
                reference.class_name, reference.member_name, reference.descriptor
            ),
        }
    }
}

/// Bidirectional index of references and the places they occur.
#[derive(Clone, Debug, Default)]
pub struct ReferenceMap {
    locations_by_reference: BTreeMap<EntityReference, BTreeSet<SourceLocation>>,
    references_by_location: BTreeMap<SourceLocation, BTreeSet<EntityReference>>,
}

impl ReferenceMap {
    pub fn add(&mut self, reference: EntityReference, location: SourceLocation) {
        self.references_by_location
            .entry(location.clone())
            .or_default()
            .insert(reference.clone());
        self.locations_by_reference
            .entry(reference)
            .or_default()
            .insert(location);
    }

    pub fn locations_of(&self, reference: &EntityReference) -> impl Iterator<Item = &SourceLocation> {
        self.locations_by_reference
            .get(reference)
            .into_iter()
            .flat_map(|locations| locations.iter())
    }

    pub fn references_from(&self, location: &SourceLocation) -> impl Iterator<Item = &EntityReference> {
        self.references_by_location
            .get(location)
            .into_iter()
            .flat_map(|references| references.iter())
    }

    /// References made from anywhere inside the given class.
    pub fn references_from_class<'a>(
        &'a self,
        class_name: &'a str,
    ) -> impl Iterator<Item = &'a EntityReference> {
        self.references_by_location
            .iter()
            .filter(move |(location, _)| location.class_name == class_name)
            .flat_map(|(_, references)| references.iter())
    }

    pub fn references(&self) -> impl Iterator<Item = &EntityReference> {
        self.locations_by_reference.keys()
    }

    pub fn len(&self) -> usize {
        self.locations_by_reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations_by_reference.is_empty()
    }
}
