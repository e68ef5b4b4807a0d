use anyhow::{Context, Result};

use crate::classfile::reader::{parse_attributes, read_bytes, read_u16, read_u32, read_u8};
use crate::classfile::writer::{push_attributes, push_u16, push_u32};
use crate::classfile::{Attribute, ConstantPool};

pub(crate) const CODE: &str = "Code";
pub(crate) const CONSTANT_VALUE: &str = "ConstantValue";
pub(crate) const EXCEPTIONS: &str = "Exceptions";
pub(crate) const SIGNATURE: &str = "Signature";
pub(crate) const SOURCE_FILE: &str = "SourceFile";
pub(crate) const LINE_NUMBER_TABLE: &str = "LineNumberTable";
pub(crate) const LOCAL_VARIABLE_TABLE: &str = "LocalVariableTable";
pub(crate) const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";
pub(crate) const STACK_MAP_TABLE: &str = "StackMapTable";
pub(crate) const BOOTSTRAP_METHODS: &str = "BootstrapMethods";
pub(crate) const ENCLOSING_METHOD: &str = "EnclosingMethod";
pub(crate) const RUNTIME_VISIBLE_ANNOTATIONS: &str = "RuntimeVisibleAnnotations";
pub(crate) const RUNTIME_INVISIBLE_ANNOTATIONS: &str = "RuntimeInvisibleAnnotations";
pub(crate) const RUNTIME_VISIBLE_PARAMETER_ANNOTATIONS: &str = "RuntimeVisibleParameterAnnotations";
pub(crate) const RUNTIME_INVISIBLE_PARAMETER_ANNOTATIONS: &str =
    "RuntimeInvisibleParameterAnnotations";
pub(crate) const RUNTIME_VISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeVisibleTypeAnnotations";
pub(crate) const RUNTIME_INVISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeInvisibleTypeAnnotations";
pub(crate) const ANNOTATION_DEFAULT: &str = "AnnotationDefault";

/// Decoded `Code` attribute. Nested attributes stay raw.
#[derive(Clone, Debug)]
pub(crate) struct CodeAttribute {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    pub(crate) attributes: Vec<Attribute>,
}

/// Exception table record; `catch_type` 0 means "any".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ExceptionEntry {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: u16,
}

impl CodeAttribute {
    pub(crate) fn parse(info: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let max_stack = read_u16(info, &mut offset)?;
        let max_locals = read_u16(info, &mut offset)?;
        let code_length = read_u32(info, &mut offset)? as usize;
        let code = read_bytes(info, &mut offset, code_length)?.to_vec();
        let table_length = read_u16(info, &mut offset)? as usize;
        let mut exception_table = Vec::with_capacity(table_length);
        for _ in 0..table_length {
            exception_table.push(ExceptionEntry {
                start_pc: read_u16(info, &mut offset)?,
                end_pc: read_u16(info, &mut offset)?,
                handler_pc: read_u16(info, &mut offset)?,
                catch_type: read_u16(info, &mut offset)?,
            });
        }
        let attributes = parse_attributes(info, &mut offset).context("parse code attributes")?;
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut info = Vec::with_capacity(self.code.len() + 32);
        push_u16(&mut info, self.max_stack);
        push_u16(&mut info, self.max_locals);
        let code_length = u32::try_from(self.code.len()).context("code too large")?;
        if code_length == 0 || code_length > u16::MAX as u32 {
            anyhow::bail!("method code length {} out of range", code_length);
        }
        push_u32(&mut info, code_length);
        info.extend_from_slice(&self.code);
        push_u16(
            &mut info,
            u16::try_from(self.exception_table.len()).context("exception table too large")?,
        );
        for entry in &self.exception_table {
            push_u16(&mut info, entry.start_pc);
            push_u16(&mut info, entry.end_pc);
            push_u16(&mut info, entry.handler_pc);
            push_u16(&mut info, entry.catch_type);
        }
        push_attributes(&mut info, &self.attributes)?;
        Ok(info)
    }
}

/// One `LineNumberTable` record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LineNumber {
    pub(crate) start_pc: u16,
    pub(crate) line: u16,
}

pub(crate) fn parse_line_numbers(info: &[u8]) -> Result<Vec<LineNumber>> {
    let mut offset = 0usize;
    let count = read_u16(info, &mut offset)? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(LineNumber {
            start_pc: read_u16(info, &mut offset)?,
            line: read_u16(info, &mut offset)?,
        });
    }
    Ok(entries)
}

pub(crate) fn encode_line_numbers(entries: &[LineNumber]) -> Vec<u8> {
    let mut info = Vec::with_capacity(2 + entries.len() * 4);
    push_u16(&mut info, entries.len() as u16);
    for entry in entries {
        push_u16(&mut info, entry.start_pc);
        push_u16(&mut info, entry.line);
    }
    info
}

/// One `LocalVariableTable` / `LocalVariableTypeTable` record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LocalVariable {
    pub(crate) start_pc: u16,
    pub(crate) length: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) index: u16,
}

pub(crate) fn parse_local_variables(info: &[u8]) -> Result<Vec<LocalVariable>> {
    let mut offset = 0usize;
    let count = read_u16(info, &mut offset)? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(LocalVariable {
            start_pc: read_u16(info, &mut offset)?,
            length: read_u16(info, &mut offset)?,
            name_index: read_u16(info, &mut offset)?,
            descriptor_index: read_u16(info, &mut offset)?,
            index: read_u16(info, &mut offset)?,
        });
    }
    Ok(entries)
}

pub(crate) fn encode_local_variables(entries: &[LocalVariable]) -> Vec<u8> {
    let mut info = Vec::with_capacity(2 + entries.len() * 10);
    push_u16(&mut info, entries.len() as u16);
    for entry in entries {
        push_u16(&mut info, entry.start_pc);
        push_u16(&mut info, entry.length);
        push_u16(&mut info, entry.name_index);
        push_u16(&mut info, entry.descriptor_index);
        push_u16(&mut info, entry.index);
    }
    info
}

/// Read an attribute whose whole payload is one constant pool index.
pub(crate) fn parse_index_attribute(info: &[u8]) -> Result<u16> {
    let mut offset = 0usize;
    read_u16(info, &mut offset)
}

pub(crate) fn encode_index_attribute(index: u16) -> Vec<u8> {
    index.to_be_bytes().to_vec()
}

/// Class indices listed by an `Exceptions` attribute.
pub(crate) fn parse_exceptions(info: &[u8]) -> Result<Vec<u16>> {
    let mut offset = 0usize;
    let count = read_u16(info, &mut offset)? as usize;
    let mut indices = Vec::with_capacity(count);
    for _ in 0..count {
        indices.push(read_u16(info, &mut offset)?);
    }
    Ok(indices)
}

/// `BootstrapMethods` entry: method handle plus static arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BootstrapMethod {
    pub(crate) method_ref: u16,
    pub(crate) arguments: Vec<u16>,
}

pub(crate) fn parse_bootstrap_methods(info: &[u8]) -> Result<Vec<BootstrapMethod>> {
    let mut offset = 0usize;
    let count = read_u16(info, &mut offset)? as usize;
    let mut methods = Vec::with_capacity(count);
    for _ in 0..count {
        let method_ref = read_u16(info, &mut offset)?;
        let argument_count = read_u16(info, &mut offset)? as usize;
        let mut arguments = Vec::with_capacity(argument_count);
        for _ in 0..argument_count {
            arguments.push(read_u16(info, &mut offset)?);
        }
        methods.push(BootstrapMethod {
            method_ref,
            arguments,
        });
    }
    Ok(methods)
}

pub(crate) fn encode_bootstrap_methods(methods: &[BootstrapMethod]) -> Result<Vec<u8>> {
    let mut info = Vec::new();
    push_u16(
        &mut info,
        u16::try_from(methods.len()).context("too many bootstrap methods")?,
    );
    for method in methods {
        push_u16(&mut info, method.method_ref);
        push_u16(
            &mut info,
            u16::try_from(method.arguments.len()).context("too many bootstrap arguments")?,
        );
        for argument in &method.arguments {
            push_u16(&mut info, *argument);
        }
    }
    Ok(info)
}

/// `EnclosingMethod` payload: class index and optional name-and-type index.
pub(crate) fn parse_enclosing_method(info: &[u8]) -> Result<(u16, u16)> {
    let mut offset = 0usize;
    Ok((read_u16(info, &mut offset)?, read_u16(info, &mut offset)?))
}

pub(crate) fn encode_enclosing_method(class_index: u16, method_index: u16) -> Vec<u8> {
    let mut info = Vec::with_capacity(4);
    push_u16(&mut info, class_index);
    push_u16(&mut info, method_index);
    info
}

/// Names of annotations declared by a `Runtime*Annotations` attribute, as
/// internal class names.
pub(crate) fn annotation_names(info: &[u8], pool: &ConstantPool) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut offset = 0usize;
    let count = read_u16(info, &mut offset)? as usize;
    for _ in 0..count {
        let type_index = read_u16(info, &mut offset)?;
        let descriptor = pool.utf8(type_index).context("resolve annotation type")?;
        if let Some(name) = descriptor
            .strip_prefix('L')
            .and_then(|value| value.strip_suffix(';'))
        {
            names.push(name.to_string());
        }
        skip_annotation_pairs(info, &mut offset)?;
    }
    Ok(names)
}

fn skip_annotation_pairs(info: &[u8], offset: &mut usize) -> Result<()> {
    let pairs = read_u16(info, offset)? as usize;
    for _ in 0..pairs {
        read_u16(info, offset)?;
        walk_element_value(info, offset, &mut |_| {})?;
    }
    Ok(())
}

/// Shape of an annotation-bearing attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AnnotationLayout {
    Annotations,
    ParameterAnnotations,
    Default,
}

/// Rewrite every descriptor-valued index inside an annotation attribute.
///
/// `remap` receives each type-descriptor utf8 index and returns a replacement
/// index when the descriptor changes. Indices are patched in place, so the
/// attribute length never changes.
pub(crate) fn remap_annotation_attribute(
    info: &[u8],
    layout: AnnotationLayout,
    remap: &mut dyn FnMut(u16) -> Option<u16>,
) -> Result<Vec<u8>> {
    let mut patched = info.to_vec();
    let mut patches = Vec::new();
    let mut offset = 0usize;
    let mut record = |index_offset: usize, index: u16, patches: &mut Vec<(usize, u16)>| {
        if let Some(replacement) = remap(index) {
            patches.push((index_offset, replacement));
        }
    };
    match layout {
        AnnotationLayout::Annotations => {
            let count = read_u16(info, &mut offset)? as usize;
            for _ in 0..count {
                walk_annotation(info, &mut offset, &mut |at, index| {
                    record(at, index, &mut patches)
                })?;
            }
        }
        AnnotationLayout::ParameterAnnotations => {
            let parameters = read_u8(info, &mut offset)? as usize;
            for _ in 0..parameters {
                let count = read_u16(info, &mut offset)? as usize;
                for _ in 0..count {
                    walk_annotation(info, &mut offset, &mut |at, index| {
                        record(at, index, &mut patches)
                    })?;
                }
            }
        }
        AnnotationLayout::Default => {
            walk_element_value(info, &mut offset, &mut |at| {
                let index = u16::from_be_bytes([info[at], info[at + 1]]);
                record(at, index, &mut patches);
            })?;
        }
    }
    for (at, index) in patches {
        patched[at..at + 2].copy_from_slice(&index.to_be_bytes());
    }
    Ok(patched)
}

fn walk_annotation(
    info: &[u8],
    offset: &mut usize,
    visit: &mut dyn FnMut(usize, u16),
) -> Result<()> {
    let type_offset = *offset;
    let type_index = read_u16(info, offset)?;
    visit(type_offset, type_index);
    let pairs = read_u16(info, offset)? as usize;
    for _ in 0..pairs {
        read_u16(info, offset)?;
        walk_element_value(info, offset, &mut |at| {
            let index = u16::from_be_bytes([info[at], info[at + 1]]);
            visit(at, index);
        })?;
    }
    Ok(())
}

/// Walk one `element_value`, calling `visit` with the byte offset of every
/// descriptor-valued index (enum type names, class literals, nested
/// annotation types).
fn walk_element_value(
    info: &[u8],
    offset: &mut usize,
    visit: &mut dyn FnMut(usize),
) -> Result<()> {
    let tag = read_u8(info, offset)?;
    match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' => {
            read_u16(info, offset)?;
        }
        b'e' => {
            let at = *offset;
            read_u16(info, offset)?;
            visit(at);
            read_u16(info, offset)?;
        }
        b'c' => {
            let at = *offset;
            read_u16(info, offset)?;
            visit(at);
        }
        b'@' => {
            let at = *offset;
            read_u16(info, offset)?;
            visit(at);
            let pairs = read_u16(info, offset)? as usize;
            for _ in 0..pairs {
                read_u16(info, offset)?;
                walk_element_value(info, offset, visit)?;
            }
        }
        b'[' => {
            let values = read_u16(info, offset)? as usize;
            for _ in 0..values {
                walk_element_value(info, offset, visit)?;
            }
        }
        _ => anyhow::bail!("invalid element value tag {}", tag),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_attribute_round_trips() {
        let code = CodeAttribute {
            max_stack: 2,
            max_locals: 1,
            code: vec![0x2a, 0xb0],
            exception_table: vec![ExceptionEntry {
                start_pc: 0,
                end_pc: 1,
                handler_pc: 1,
                catch_type: 0,
            }],
            attributes: Vec::new(),
        };

        let encoded = code.encode().expect("encode");
        let decoded = CodeAttribute::parse(&encoded).expect("parse");

        assert_eq!(decoded.code, vec![0x2a, 0xb0]);
        assert_eq!(decoded.exception_table, code.exception_table);
        assert_eq!(decoded.max_stack, 2);
    }

    #[test]
    fn empty_code_is_rejected() {
        let code = CodeAttribute {
            max_stack: 0,
            max_locals: 0,
            code: Vec::new(),
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };
        assert!(code.encode().is_err());
    }

    #[test]
    fn annotation_types_are_patched_in_place() {
        let mut pool = ConstantPool::new();
        let original = pool.add_utf8("Lcom/example/Marker;").expect("utf8");
        let replacement = pool.add_utf8("Lsandbox/com/example/Marker;").expect("utf8");
        let mut info = Vec::new();
        push_u16(&mut info, 1);
        push_u16(&mut info, original);
        push_u16(&mut info, 0);

        let patched = remap_annotation_attribute(
            &info,
            AnnotationLayout::Annotations,
            &mut |index| (index == original).then_some(replacement),
        )
        .expect("remap");

        assert_eq!(patched.len(), info.len());
        assert_eq!(
            annotation_names(&patched, &pool).expect("names"),
            vec!["sandbox/com/example/Marker".to_string()]
        );
    }
}
