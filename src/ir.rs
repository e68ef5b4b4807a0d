use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};

use crate::classfile::attributes::{
    self, annotation_names, parse_exceptions, parse_index_attribute,
};
use crate::classfile::{
    Attribute, ClassFile, Constant, ConstantPool, MemberInfo, ACC_ABSTRACT, ACC_ANNOTATION,
    ACC_ENUM, ACC_FINAL, ACC_INTERFACE, ACC_NATIVE, ACC_STATIC,
};

/// Snapshot of a class taken from its class file.
///
/// Definition providers never edit a representation in place; they return a
/// changed copy, so the original stays available for comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassRepresentation {
    pub api_version: u16,
    pub access: u16,
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub source_file: Option<String>,
    pub signature: Option<String>,
    /// Members keyed by `name:descriptor`.
    pub members: BTreeMap<String, Member>,
    pub annotations: BTreeSet<String>,
}

/// Field or method of a [`ClassRepresentation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub access: u16,
    pub class_name: String,
    pub member_name: String,
    pub descriptor: String,
    pub signature: Option<String>,
    pub annotations: BTreeSet<String>,
    pub exceptions: Vec<String>,
    pub value: Option<ConstantValue>,
    /// Replacement bodies queued by definition providers; the last one wins.
    pub body: Vec<MethodBody>,
}

/// `ConstantValue` of a static field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConstantValue {
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    String(String),
}

/// Replacement for a method body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MethodBody {
    /// Throw a rule violation carrying the message.
    Throw(String),
    /// Return the zero value of the return type.
    ReturnDefault,
}

impl ClassRepresentation {
    pub(crate) fn from_class_file(class_file: &ClassFile) -> Result<Self> {
        let pool = &class_file.constant_pool;
        let name = class_file.name()?.to_string();
        let mut members = BTreeMap::new();
        for field in &class_file.fields {
            let member = read_member(class_file, field, &name).context("read field")?;
            members.insert(member.key(), member);
        }
        for method in &class_file.methods {
            let member = read_member(class_file, method, &name).context("read method")?;
            members.insert(member.key(), member);
        }
        let source_file = match class_file.find_attribute(&class_file.attributes, attributes::SOURCE_FILE) {
            Some(attribute) => Some(pool.utf8(parse_index_attribute(&attribute.info)?)?.to_string()),
            None => None,
        };
        Ok(Self {
            api_version: class_file.major_version,
            access: class_file.access_flags,
            super_name: class_file.super_name()?.map(|value| value.to_string()),
            interfaces: class_file
                .interface_names()?
                .into_iter()
                .map(|value| value.to_string())
                .collect(),
            source_file,
            signature: read_signature(class_file, &class_file.attributes)?,
            members,
            annotations: read_annotations(class_file, &class_file.attributes)?,
            name,
        })
    }

    pub fn is_interface(&self) -> bool {
        self.access & ACC_INTERFACE != 0
    }

    pub fn is_annotation(&self) -> bool {
        self.access & ACC_ANNOTATION != 0
    }

    pub fn is_enum(&self) -> bool {
        self.access & ACC_ENUM != 0
    }

    pub fn member(&self, name: &str, descriptor: &str) -> Option<&Member> {
        self.members.get(&format!("{name}:{descriptor}"))
    }

    /// Fully qualified name with dots.
    pub fn qualified_name(&self) -> String {
        self.name.replace('/', ".")
    }
}

impl Member {
    /// Map key, unique within one class.
    pub fn key(&self) -> String {
        format!("{}:{}", self.member_name, self.descriptor)
    }

    /// Canonical reference, `class.member:descriptor`.
    pub fn reference(&self) -> String {
        format!("{}.{}:{}", self.class_name, self.member_name, self.descriptor)
    }

    pub fn is_method(&self) -> bool {
        self.descriptor.starts_with('(')
    }

    pub fn is_field(&self) -> bool {
        !self.is_method()
    }

    pub fn is_static(&self) -> bool {
        self.access & ACC_STATIC != 0
    }

    pub fn is_final(&self) -> bool {
        self.access & ACC_FINAL != 0
    }

    pub fn is_native(&self) -> bool {
        self.access & ACC_NATIVE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access & ACC_ABSTRACT != 0
    }

    /// Copy with an extra body replacement queued.
    pub(crate) fn with_body(&self, body: MethodBody) -> Self {
        let mut member = self.clone();
        member.body.push(body);
        member
    }

    pub(crate) fn with_access(&self, access: u16) -> Self {
        Self {
            access,
            ..self.clone()
        }
    }
}

fn read_member(class_file: &ClassFile, info: &MemberInfo, class_name: &str) -> Result<Member> {
    let pool = &class_file.constant_pool;
    let member_name = info.name(pool)?.to_string();
    let descriptor = info.descriptor(pool)?.to_string();
    let exceptions = match class_file.find_attribute(&info.attributes, attributes::EXCEPTIONS) {
        Some(attribute) => parse_exceptions(&attribute.info)?
            .into_iter()
            .map(|index| pool.class_name(index).map(|name| name.to_string()))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    let value = match class_file.find_attribute(&info.attributes, attributes::CONSTANT_VALUE) {
        Some(attribute) => Some(read_constant_value(pool, parse_index_attribute(&attribute.info)?)?),
        None => None,
    };
    Ok(Member {
        access: info.access_flags,
        class_name: class_name.to_string(),
        member_name,
        descriptor,
        signature: read_signature(class_file, &info.attributes)?,
        annotations: read_annotations(class_file, &info.attributes)?,
        exceptions,
        value,
        body: Vec::new(),
    })
}

pub(crate) fn read_constant_value(pool: &ConstantPool, index: u16) -> Result<ConstantValue> {
    Ok(match pool.get(index)? {
        Constant::Integer(value) => ConstantValue::Integer(*value),
        Constant::Float(bits) => ConstantValue::Float(*bits),
        Constant::Long(value) => ConstantValue::Long(*value),
        Constant::Double(bits) => ConstantValue::Double(*bits),
        Constant::String { string_index } => ConstantValue::String(pool.utf8(*string_index)?.to_string()),
        other => anyhow::bail!("unsupported constant value {:?}", other),
    })
}

fn read_signature(class_file: &ClassFile, attributes: &[Attribute]) -> Result<Option<String>> {
    match class_file.find_attribute(attributes, attributes::SIGNATURE) {
        Some(attribute) => Ok(Some(
            class_file
                .constant_pool
                .utf8(parse_index_attribute(&attribute.info)?)?
                .to_string(),
        )),
        None => Ok(None),
    }
}

fn read_annotations(class_file: &ClassFile, attributes: &[Attribute]) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for attribute in attributes {
        let name = class_file.attribute_name(attribute)?;
        if name == attributes::RUNTIME_VISIBLE_ANNOTATIONS
            || name == attributes::RUNTIME_INVISIBLE_ANNOTATIONS
        {
            names.extend(annotation_names(&attribute.info, &class_file.constant_pool)?);
        }
    }
    Ok(names)
}
