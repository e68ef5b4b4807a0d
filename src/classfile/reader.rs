use anyhow::{Context, Result};

use crate::classfile::constant_pool::{decode_modified_utf8, Constant, ConstantPool};
use crate::classfile::{Attribute, ClassFile, MemberInfo, MAGIC};

/// Parse a complete class file.
pub(crate) fn parse_class_bytes(data: &[u8]) -> Result<ClassFile> {
    let mut offset = 0usize;
    let magic = read_u32(data, &mut offset)?;
    if magic != MAGIC {
        anyhow::bail!("invalid class file magic");
    }
    let minor_version = read_u16(data, &mut offset)?;
    let major_version = read_u16(data, &mut offset)?;
    let constant_pool = parse_constant_pool(data, &mut offset).context("parse constant pool")?;
    let access_flags = read_u16(data, &mut offset)?;
    let this_class = read_u16(data, &mut offset)?;
    let super_class = read_u16(data, &mut offset)?;

    let interface_count = read_u16(data, &mut offset)? as usize;
    let mut interfaces = Vec::with_capacity(interface_count);
    for _ in 0..interface_count {
        interfaces.push(read_u16(data, &mut offset)?);
    }

    let fields = parse_members(data, &mut offset).context("parse fields")?;
    let methods = parse_members(data, &mut offset).context("parse methods")?;
    let attributes = parse_attributes(data, &mut offset).context("parse class attributes")?;
    if offset != data.len() {
        anyhow::bail!("trailing bytes after class file");
    }

    let class_file = ClassFile {
        minor_version,
        major_version,
        constant_pool,
        access_flags,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
    };
    class_file.name().context("resolve class name")?;
    Ok(class_file)
}

/// Leading part of a class file: everything up to the interface list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RawHeader {
    pub(crate) access_flags: u16,
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
}

/// Read the class header only; fields, methods and attributes are never
/// touched.
pub(crate) fn parse_class_header(data: &[u8]) -> Result<RawHeader> {
    let mut offset = 0usize;
    if read_u32(data, &mut offset)? != MAGIC {
        anyhow::bail!("invalid class file magic");
    }
    // Minor and major version.
    read_u16(data, &mut offset)?;
    read_u16(data, &mut offset)?;
    let pool = parse_constant_pool(data, &mut offset).context("parse constant pool")?;
    let access_flags = read_u16(data, &mut offset)?;
    let name = pool.class_name(read_u16(data, &mut offset)?)?.to_string();
    let super_class = read_u16(data, &mut offset)?;
    let super_name = if super_class == 0 {
        None
    } else {
        Some(pool.class_name(super_class)?.to_string())
    };
    let interface_count = read_u16(data, &mut offset)? as usize;
    let mut interfaces = Vec::with_capacity(interface_count);
    for _ in 0..interface_count {
        interfaces.push(pool.class_name(read_u16(data, &mut offset)?)?.to_string());
    }
    Ok(RawHeader {
        access_flags,
        name,
        super_name,
        interfaces,
    })
}

fn parse_constant_pool(data: &[u8], offset: &mut usize) -> Result<ConstantPool> {
    let count = read_u16(data, offset)?;
    let mut entries = Vec::with_capacity(count as usize);
    entries.push(Constant::Unusable);
    let mut index = 1u16;
    while index < count {
        let tag = read_u8(data, offset)?;
        let entry = match tag {
            1 => {
                let len = read_u16(data, offset)? as usize;
                let bytes = read_bytes(data, offset, len)?;
                Constant::Utf8(decode_modified_utf8(bytes).with_context(|| {
                    format!("decode utf8 constant at index {}", index)
                })?)
            }
            3 => Constant::Integer(read_u32(data, offset)? as i32),
            4 => Constant::Float(read_u32(data, offset)?),
            5 => Constant::Long(read_u64(data, offset)? as i64),
            6 => Constant::Double(read_u64(data, offset)?),
            7 => Constant::Class {
                name_index: read_u16(data, offset)?,
            },
            8 => Constant::String {
                string_index: read_u16(data, offset)?,
            },
            9 => Constant::Fieldref {
                class_index: read_u16(data, offset)?,
                name_and_type_index: read_u16(data, offset)?,
            },
            10 => Constant::Methodref {
                class_index: read_u16(data, offset)?,
                name_and_type_index: read_u16(data, offset)?,
            },
            11 => Constant::InterfaceMethodref {
                class_index: read_u16(data, offset)?,
                name_and_type_index: read_u16(data, offset)?,
            },
            12 => Constant::NameAndType {
                name_index: read_u16(data, offset)?,
                descriptor_index: read_u16(data, offset)?,
            },
            15 => Constant::MethodHandle {
                reference_kind: read_u8(data, offset)?,
                reference_index: read_u16(data, offset)?,
            },
            16 => Constant::MethodType {
                descriptor_index: read_u16(data, offset)?,
            },
            17 => Constant::Dynamic {
                bootstrap_method_attr_index: read_u16(data, offset)?,
                name_and_type_index: read_u16(data, offset)?,
            },
            18 => Constant::InvokeDynamic {
                bootstrap_method_attr_index: read_u16(data, offset)?,
                name_and_type_index: read_u16(data, offset)?,
            },
            19 => Constant::Module {
                name_index: read_u16(data, offset)?,
            },
            20 => Constant::Package {
                name_index: read_u16(data, offset)?,
            },
            _ => anyhow::bail!("unsupported constant pool tag: {}", tag),
        };
        let wide = entry.is_wide();
        entries.push(entry);
        if wide {
            entries.push(Constant::Unusable);
            index += 1;
        }
        index += 1;
    }
    Ok(ConstantPool::from_entries(entries))
}

fn parse_members(data: &[u8], offset: &mut usize) -> Result<Vec<MemberInfo>> {
    let count = read_u16(data, offset)? as usize;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        let access_flags = read_u16(data, offset)?;
        let name_index = read_u16(data, offset)?;
        let descriptor_index = read_u16(data, offset)?;
        let attributes = parse_attributes(data, offset)?;
        members.push(MemberInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }
    Ok(members)
}

pub(crate) fn parse_attributes(data: &[u8], offset: &mut usize) -> Result<Vec<Attribute>> {
    let count = read_u16(data, offset)? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = read_u16(data, offset)?;
        let length = read_u32(data, offset)? as usize;
        let info = read_bytes(data, offset, length)?.to_vec();
        attributes.push(Attribute { name_index, info });
    }
    Ok(attributes)
}

pub(crate) fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8> {
    let byte = *data.get(*offset).context("class file out of bounds")?;
    *offset += 1;
    Ok(byte)
}

pub(crate) fn read_u16(data: &[u8], offset: &mut usize) -> Result<u16> {
    let bytes = read_bytes(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes = read_bytes(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_u64(data: &[u8], offset: &mut usize) -> Result<u64> {
    let high = read_u32(data, offset)? as u64;
    let low = read_u32(data, offset)? as u64;
    Ok((high << 32) | low)
}

pub(crate) fn read_bytes<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let start = *offset;
    let end = start.checked_add(len).context("class file out of bounds")?;
    let slice = data.get(start..end).context("class file out of bounds")?;
    *offset = end;
    Ok(slice)
}
