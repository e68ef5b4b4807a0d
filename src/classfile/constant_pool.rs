use std::collections::HashMap;

use anyhow::{Context, Result};

/// One constant pool slot.
///
/// Floating point values are kept as raw bits so entries stay hashable and
/// round-trip without normalising NaN payloads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Constant {
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Module {
        name_index: u16,
    },
    Package {
        name_index: u16,
    },
    /// Slot 0 and the slot shadowed by a long or double.
    Unusable,
}

impl Constant {
    pub(crate) fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// Resolved field or method reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MemberRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) is_interface: bool,
}

/// Append-only constant pool.
///
/// Existing indices are never reordered; rewriting either appends entries or
/// repoints an entry in place, so raw attributes that embed indices stay valid.
#[derive(Clone, Debug)]
pub(crate) struct ConstantPool {
    entries: Vec<Constant>,
    lookup: HashMap<Constant, u16>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub(crate) fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
            lookup: HashMap::new(),
        }
    }

    pub(crate) fn from_entries(entries: Vec<Constant>) -> Self {
        let mut lookup = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            if *entry != Constant::Unusable {
                lookup.entry(entry.clone()).or_insert(index as u16);
            }
        }
        Self { entries, lookup }
    }

    /// Value written to `constant_pool_count`.
    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (index as u16, entry))
    }

    pub(crate) fn get(&self, index: u16) -> Result<&Constant> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => {
                anyhow::bail!("invalid constant pool index {}", index)
            }
            Some(entry) => Ok(entry),
        }
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Utf8(value) => Ok(value),
            _ => anyhow::bail!("unexpected utf8 entry at {}", index),
        }
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => anyhow::bail!("unexpected class entry at {}", index),
        }
    }

    pub(crate) fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => anyhow::bail!("unexpected name and type entry at {}", index),
        }
    }

    pub(crate) fn member_ref(&self, index: u16) -> Result<MemberRef> {
        let (class_index, name_and_type_index, is_interface) = match self.get(index)? {
            Constant::Fieldref {
                class_index,
                name_and_type_index,
            }
            | Constant::Methodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, false),
            Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, true),
            _ => anyhow::bail!("unexpected member reference at {}", index),
        };
        let owner = self.class_name(class_index).context("resolve owner")?;
        let (name, descriptor) = self
            .name_and_type(name_and_type_index)
            .context("resolve name and type")?;
        Ok(MemberRef {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_interface,
        })
    }

    /// String literal behind a `String` entry, if the index holds one.
    pub(crate) fn string_literal(&self, index: u16) -> Result<Option<&str>> {
        match self.get(index)? {
            Constant::String { string_index } => Ok(Some(self.utf8(*string_index)?)),
            _ => Ok(None),
        }
    }

    /// Add an entry, reusing an identical existing one.
    pub(crate) fn add(&mut self, constant: Constant) -> Result<u16> {
        if let Some(index) = self.lookup.get(&constant) {
            return Ok(*index);
        }
        let slots = if constant.is_wide() { 2 } else { 1 };
        if self.entries.len() + slots > u16::MAX as usize {
            anyhow::bail!("constant pool overflow");
        }
        let index = self.entries.len() as u16;
        let wide = constant.is_wide();
        self.lookup.insert(constant.clone(), index);
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    /// Repoint an existing slot. The slot width must not change.
    pub(crate) fn replace(&mut self, index: u16, constant: Constant) -> Result<()> {
        let slot = self
            .entries
            .get_mut(index as usize)
            .with_context(|| format!("invalid constant pool index {}", index))?;
        if slot.is_wide() != constant.is_wide() {
            anyhow::bail!("cannot change the width of constant pool slot {}", index);
        }
        let previous = std::mem::replace(slot, constant.clone());
        if self.lookup.get(&previous) == Some(&index) {
            self.lookup.remove(&previous);
        }
        self.lookup.entry(constant).or_insert(index);
        Ok(())
    }

    pub(crate) fn add_utf8(&mut self, value: &str) -> Result<u16> {
        self.add(Constant::Utf8(value.to_string()))
    }

    pub(crate) fn add_class(&mut self, name: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        self.add(Constant::Class { name_index })
    }

    pub(crate) fn add_string(&mut self, value: &str) -> Result<u16> {
        let string_index = self.add_utf8(value)?;
        self.add(Constant::String { string_index })
    }

    pub(crate) fn add_integer(&mut self, value: i32) -> Result<u16> {
        self.add(Constant::Integer(value))
    }

    pub(crate) fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.add(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub(crate) fn add_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::Fieldref {
            class_index,
            name_and_type_index,
        })
    }

    pub(crate) fn add_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        if is_interface {
            self.add(Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            })
        } else {
            self.add(Constant::Methodref {
                class_index,
                name_and_type_index,
            })
        }
    }
}

/// Decode the JVM's modified UTF-8. Unpaired surrogates become U+FFFD.
pub(crate) fn decode_modified_utf8(bytes: &[u8]) -> Result<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut index = 0usize;
    while index < bytes.len() {
        let first = bytes[index];
        if first & 0x80 == 0 {
            units.push(first as u16);
            index += 1;
        } else if first & 0xe0 == 0xc0 {
            let second = *bytes.get(index + 1).context("truncated utf8 sequence")?;
            units.push((((first & 0x1f) as u16) << 6) | (second & 0x3f) as u16);
            index += 2;
        } else if first & 0xf0 == 0xe0 {
            let second = *bytes.get(index + 1).context("truncated utf8 sequence")?;
            let third = *bytes.get(index + 2).context("truncated utf8 sequence")?;
            units.push(
                (((first & 0x0f) as u16) << 12)
                    | (((second & 0x3f) as u16) << 6)
                    | (third & 0x3f) as u16,
            );
            index += 3;
        } else {
            anyhow::bail!("invalid modified utf8 lead byte 0x{:02x}", first);
        }
    }
    Ok(char::decode_utf16(units)
        .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

pub(crate) fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => bytes.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                bytes.push(0xc0 | ((unit >> 6) & 0x1f) as u8);
                bytes.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                bytes.push(0xe0 | ((unit >> 12) & 0x0f) as u8);
                bytes.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                bytes.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    bytes
}
