use anyhow::{Context, Result};

use crate::classfile::constant_pool::{encode_modified_utf8, Constant};
use crate::classfile::{Attribute, ClassFile, MemberInfo, MAGIC};

/// Serialize a class file.
pub(crate) fn class_file_to_bytes(class_file: &ClassFile) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(1024);
    push_u32(&mut bytes, MAGIC);
    push_u16(&mut bytes, class_file.minor_version);
    push_u16(&mut bytes, class_file.major_version);

    let count = u16::try_from(class_file.constant_pool.count()).context("constant pool overflow")?;
    push_u16(&mut bytes, count);
    for (index, entry) in class_file.constant_pool.entries() {
        if index == 0 {
            continue;
        }
        push_constant(&mut bytes, entry).with_context(|| format!("write constant {}", index))?;
    }

    push_u16(&mut bytes, class_file.access_flags);
    push_u16(&mut bytes, class_file.this_class);
    push_u16(&mut bytes, class_file.super_class);
    push_u16(
        &mut bytes,
        u16::try_from(class_file.interfaces.len()).context("too many interfaces")?,
    );
    for interface in &class_file.interfaces {
        push_u16(&mut bytes, *interface);
    }
    push_members(&mut bytes, &class_file.fields).context("write fields")?;
    push_members(&mut bytes, &class_file.methods).context("write methods")?;
    push_attributes(&mut bytes, &class_file.attributes).context("write class attributes")?;
    Ok(bytes)
}

fn push_constant(bytes: &mut Vec<u8>, constant: &Constant) -> Result<()> {
    match constant {
        Constant::Utf8(value) => {
            let encoded = encode_modified_utf8(value);
            bytes.push(1);
            push_u16(bytes, u16::try_from(encoded.len()).context("utf8 constant too long")?);
            bytes.extend_from_slice(&encoded);
        }
        Constant::Integer(value) => {
            bytes.push(3);
            push_u32(bytes, *value as u32);
        }
        Constant::Float(bits) => {
            bytes.push(4);
            push_u32(bytes, *bits);
        }
        Constant::Long(value) => {
            bytes.push(5);
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        Constant::Double(bits) => {
            bytes.push(6);
            bytes.extend_from_slice(&bits.to_be_bytes());
        }
        Constant::Class { name_index } => {
            bytes.push(7);
            push_u16(bytes, *name_index);
        }
        Constant::String { string_index } => {
            bytes.push(8);
            push_u16(bytes, *string_index);
        }
        Constant::Fieldref {
            class_index,
            name_and_type_index,
        } => {
            bytes.push(9);
            push_u16(bytes, *class_index);
            push_u16(bytes, *name_and_type_index);
        }
        Constant::Methodref {
            class_index,
            name_and_type_index,
        } => {
            bytes.push(10);
            push_u16(bytes, *class_index);
            push_u16(bytes, *name_and_type_index);
        }
        Constant::InterfaceMethodref {
            class_index,
            name_and_type_index,
        } => {
            bytes.push(11);
            push_u16(bytes, *class_index);
            push_u16(bytes, *name_and_type_index);
        }
        Constant::NameAndType {
            name_index,
            descriptor_index,
        } => {
            bytes.push(12);
            push_u16(bytes, *name_index);
            push_u16(bytes, *descriptor_index);
        }
        Constant::MethodHandle {
            reference_kind,
            reference_index,
        } => {
            bytes.push(15);
            bytes.push(*reference_kind);
            push_u16(bytes, *reference_index);
        }
        Constant::MethodType { descriptor_index } => {
            bytes.push(16);
            push_u16(bytes, *descriptor_index);
        }
        Constant::Dynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        } => {
            bytes.push(17);
            push_u16(bytes, *bootstrap_method_attr_index);
            push_u16(bytes, *name_and_type_index);
        }
        Constant::InvokeDynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        } => {
            bytes.push(18);
            push_u16(bytes, *bootstrap_method_attr_index);
            push_u16(bytes, *name_and_type_index);
        }
        Constant::Module { name_index } => {
            bytes.push(19);
            push_u16(bytes, *name_index);
        }
        Constant::Package { name_index } => {
            bytes.push(20);
            push_u16(bytes, *name_index);
        }
        // The shadow slot of a long/double is implied by the preceding entry.
        Constant::Unusable => {}
    }
    Ok(())
}

fn push_members(bytes: &mut Vec<u8>, members: &[MemberInfo]) -> Result<()> {
    push_u16(bytes, u16::try_from(members.len()).context("too many members")?);
    for member in members {
        push_u16(bytes, member.access_flags);
        push_u16(bytes, member.name_index);
        push_u16(bytes, member.descriptor_index);
        push_attributes(bytes, &member.attributes)?;
    }
    Ok(())
}

pub(crate) fn push_attributes(bytes: &mut Vec<u8>, attributes: &[Attribute]) -> Result<()> {
    push_u16(bytes, u16::try_from(attributes.len()).context("too many attributes")?);
    for attribute in attributes {
        push_u16(bytes, attribute.name_index);
        push_u32(
            bytes,
            u32::try_from(attribute.info.len()).context("attribute too large")?,
        );
        bytes.extend_from_slice(&attribute.info);
    }
    Ok(())
}

pub(crate) fn push_u16(bytes: &mut Vec<u8>, value: u16) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn push_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::builder::ClassBuilder;
    use crate::classfile::parse_class_bytes;

    #[test]
    fn parse_then_write_is_byte_identical() {
        let bytes = ClassBuilder::new("com/example/Constants")
            .field_with_constant(0x0019, "LIMIT", "J", Constant::Long(1 << 40))
            .field_with_constant(0x0019, "RATIO", "D", Constant::Double(1.5f64.to_bits()))
            .method(0x0009, "answer", "()I", |code| code.bipush(42).op(crate::opcodes::IRETURN))
            .build();

        let class_file = parse_class_bytes(&bytes).expect("parse");
        let written = class_file_to_bytes(&class_file).expect("write");

        assert_eq!(written, bytes);
    }

    #[test]
    fn written_class_is_accepted_by_jclassfile() {
        let bytes = ClassBuilder::new("com/example/Checked")
            .method(0x0001, "<init>", "()V", |code| code.call_object_init().op_return())
            .build();
        let class_file = parse_class_bytes(&bytes).expect("parse");
        let written = class_file_to_bytes(&class_file).expect("write");

        let parsed = jclassfile::class_file::parse(&written).expect("jclassfile parse");
        let this_class = parsed.this_class();
        let name = match parsed.constant_pool().get(this_class as usize) {
            Some(jclassfile::constant_pool::ConstantPool::Class { name_index }) => {
                match parsed.constant_pool().get(*name_index as usize) {
                    Some(jclassfile::constant_pool::ConstantPool::Utf8 { value }) => value.clone(),
                    _ => String::new(),
                }
            }
            _ => String::new(),
        };
        assert_eq!(name, "com/example/Checked");
    }
}
