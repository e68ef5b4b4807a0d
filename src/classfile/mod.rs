//! Class-file codec: parsing, the instruction model, and re-encoding.

pub(crate) mod attributes;
pub(crate) mod code;
pub(crate) mod constant_pool;
pub(crate) mod reader;
pub(crate) mod stack_map;
pub(crate) mod writer;

#[cfg(test)]
pub(crate) mod builder;

use anyhow::Result;

pub(crate) use self::constant_pool::{Constant, ConstantPool, MemberRef};
pub(crate) use self::reader::{parse_class_bytes, parse_class_header};
pub(crate) use self::writer::class_file_to_bytes;

pub(crate) const MAGIC: u32 = 0xCAFE_BABE;

pub(crate) const ACC_PUBLIC: u16 = 0x0001;
pub(crate) const ACC_PRIVATE: u16 = 0x0002;
pub(crate) const ACC_STATIC: u16 = 0x0008;
pub(crate) const ACC_FINAL: u16 = 0x0010;
pub(crate) const ACC_SYNCHRONIZED: u16 = 0x0020;
pub(crate) const ACC_BRIDGE: u16 = 0x0040;
pub(crate) const ACC_NATIVE: u16 = 0x0100;
pub(crate) const ACC_INTERFACE: u16 = 0x0200;
pub(crate) const ACC_ABSTRACT: u16 = 0x0400;
pub(crate) const ACC_STRICT: u16 = 0x0800;
pub(crate) const ACC_SYNTHETIC: u16 = 0x1000;
pub(crate) const ACC_ANNOTATION: u16 = 0x2000;
pub(crate) const ACC_ENUM: u16 = 0x4000;

/// Parsed class file. Attributes stay raw until a pass needs them.
#[derive(Clone, Debug)]
pub(crate) struct ClassFile {
    pub(crate) minor_version: u16,
    pub(crate) major_version: u16,
    pub(crate) constant_pool: ConstantPool,
    pub(crate) access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    pub(crate) interfaces: Vec<u16>,
    pub(crate) fields: Vec<MemberInfo>,
    pub(crate) methods: Vec<MemberInfo>,
    pub(crate) attributes: Vec<Attribute>,
}

/// `field_info` / `method_info`.
#[derive(Clone, Debug)]
pub(crate) struct MemberInfo {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) attributes: Vec<Attribute>,
}

/// Raw attribute with its name index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Attribute {
    pub(crate) name_index: u16,
    pub(crate) info: Vec<u8>,
}

impl ClassFile {
    pub(crate) fn name(&self) -> Result<&str> {
        self.constant_pool.class_name(self.this_class)
    }

    pub(crate) fn super_name(&self) -> Result<Option<&str>> {
        if self.super_class == 0 {
            return Ok(None);
        }
        Ok(Some(self.constant_pool.class_name(self.super_class)?))
    }

    pub(crate) fn interface_names(&self) -> Result<Vec<&str>> {
        self.interfaces
            .iter()
            .map(|index| self.constant_pool.class_name(*index))
            .collect()
    }

    /// First attribute with the given name.
    pub(crate) fn find_attribute<'a>(
        &self,
        attributes: &'a [Attribute],
        name: &str,
    ) -> Option<&'a Attribute> {
        attributes
            .iter()
            .find(|attribute| self.attribute_name(attribute).ok() == Some(name))
    }

    pub(crate) fn attribute_name(&self, attribute: &Attribute) -> Result<&str> {
        self.constant_pool.utf8(attribute.name_index)
    }
}

impl MemberInfo {
    pub(crate) fn name<'a>(&self, pool: &'a ConstantPool) -> Result<&'a str> {
        pool.utf8(self.name_index)
    }

    pub(crate) fn descriptor<'a>(&self, pool: &'a ConstantPool) -> Result<&'a str> {
        pool.utf8(self.descriptor_index)
    }
}
