//! Namespace remapping of class names, descriptors, signatures and the
//! constant pool.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::analysis::whitelist::Whitelist;
use crate::classfile::attributes::{
    encode_index_attribute, encode_local_variables, parse_index_attribute, parse_local_variables,
    remap_annotation_attribute, AnnotationLayout,
};
use crate::classfile::{Constant, ConstantPool};
use crate::header::OBJECT;

/// Root package of every remapped class.
pub const SANDBOX_PREFIX: &str = "sandbox/";

/// Maps host class names into the sandbox namespace.
#[derive(Clone, Debug)]
pub struct ClassResolver {
    whitelist: Arc<Whitelist>,
}

impl ClassResolver {
    pub fn new(whitelist: Arc<Whitelist>) -> Self {
        Self { whitelist }
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn is_whitelisted(&self, class_name: &str) -> bool {
        self.whitelist.matches(class_name)
    }

    /// Whether `class_name` is moved into the sandbox namespace. Array types
    /// follow their element type; primitive arrays never move.
    pub fn is_mapped(&self, class_name: &str) -> bool {
        if class_name.starts_with('[') {
            let element = class_name.trim_start_matches('[');
            return match element.strip_prefix('L').and_then(|name| name.strip_suffix(';')) {
                Some(name) => self.is_mapped(name),
                None => false,
            };
        }
        !class_name.starts_with(SANDBOX_PREFIX) && !self.whitelist.matches(class_name)
    }

    /// Sandboxed name of a class. Array class names are treated as
    /// descriptors.
    pub fn resolve(&self, class_name: &str) -> String {
        if class_name.starts_with('[') {
            return self.resolve_descriptor(class_name);
        }
        if self.is_mapped(class_name) {
            format!("{SANDBOX_PREFIX}{class_name}")
        } else {
            class_name.to_string()
        }
    }

    /// Host name of a possibly sandboxed class.
    pub fn reverse(&self, class_name: &str) -> String {
        if class_name.starts_with('[') {
            return map_descriptor_classes(class_name, |name| self.reverse(name));
        }
        class_name
            .strip_prefix(SANDBOX_PREFIX)
            .unwrap_or(class_name)
            .to_string()
    }

    pub fn resolve_descriptor(&self, descriptor: &str) -> String {
        map_descriptor_classes(descriptor, |name| self.resolve(name))
    }

    pub fn reverse_descriptor(&self, descriptor: &str) -> String {
        map_descriptor_classes(descriptor, |name| self.reverse(name))
    }

    /// Remap a class, method or field generic signature.
    pub fn resolve_signature(&self, signature: &str) -> Result<String> {
        let mut parser = SignatureParser {
            input: signature,
            position: 0,
            output: String::with_capacity(signature.len() + 16),
            resolver: self,
        };
        parser
            .signature()
            .with_context(|| format!("malformed generic signature {}", signature))?;
        Ok(parser.output)
    }
}

fn map_descriptor_classes(descriptor: &str, mut map: impl FnMut(&str) -> String) -> String {
    let mut output = String::with_capacity(descriptor.len() + 16);
    let mut rest = descriptor;
    while let Some(start) = rest.find('L') {
        output.push_str(&rest[..=start]);
        let after = &rest[start + 1..];
        match after.find(';') {
            Some(end) => {
                output.push_str(&map(&after[..end]));
                output.push(';');
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(after);
                return output;
            }
        }
    }
    output.push_str(rest);
    output
}

struct SignatureParser<'a> {
    input: &'a str,
    position: usize,
    output: String,
    resolver: &'a ClassResolver,
}

impl SignatureParser<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.position).copied()
    }

    fn copy(&mut self) -> Result<u8> {
        let byte = self.peek().context("unexpected end of signature")?;
        self.output.push(byte as char);
        self.position += 1;
        Ok(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<()> {
        let byte = self.copy()?;
        if byte != expected {
            anyhow::bail!(
                "expected '{}' at {} but found '{}'",
                expected as char,
                self.position - 1,
                byte as char
            );
        }
        Ok(())
    }

    /// Raw text up to (not including) the first of `stops`.
    fn take_until(&mut self, stops: &[u8]) -> Result<&str> {
        let start = self.position;
        while let Some(byte) = self.peek() {
            if stops.contains(&byte) {
                return Ok(&self.input[start..self.position]);
            }
            self.position += 1;
        }
        anyhow::bail!("unterminated identifier")
    }

    fn signature(&mut self) -> Result<()> {
        if self.peek() == Some(b'<') {
            self.type_parameters()?;
        }
        if self.peek() == Some(b'(') {
            self.copy()?;
            while self.peek() != Some(b')') {
                self.java_type()?;
            }
            self.copy()?;
            if self.peek() == Some(b'V') {
                self.copy()?;
            } else {
                self.java_type()?;
            }
            while self.peek() == Some(b'^') {
                self.copy()?;
                self.reference_type()?;
            }
        } else {
            while self.peek().is_some() {
                self.reference_type()?;
            }
        }
        if self.position != self.input.len() {
            anyhow::bail!("trailing characters");
        }
        Ok(())
    }

    fn type_parameters(&mut self) -> Result<()> {
        self.expect(b'<')?;
        while self.peek() != Some(b'>') {
            let identifier = self.take_until(b":")?.to_string();
            self.output.push_str(&identifier);
            while self.peek() == Some(b':') {
                self.copy()?;
                if matches!(self.peek(), Some(b'L' | b'T' | b'[')) {
                    self.reference_type()?;
                }
            }
        }
        self.expect(b'>')
    }

    fn java_type(&mut self) -> Result<()> {
        match self.peek() {
            Some(b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z') => {
                self.copy()?;
                Ok(())
            }
            _ => self.reference_type(),
        }
    }

    fn reference_type(&mut self) -> Result<()> {
        match self.peek() {
            Some(b'L') => self.class_type(),
            Some(b'T') => {
                let variable = self.take_until(b";")?.to_string();
                self.output.push_str(&variable);
                self.expect(b';')
            }
            Some(b'[') => {
                self.copy()?;
                self.java_type()
            }
            Some(other) => anyhow::bail!("unexpected '{}' at {}", other as char, self.position),
            None => anyhow::bail!("unexpected end of signature"),
        }
    }

    fn class_type(&mut self) -> Result<()> {
        self.expect(b'L')?;
        let name = self.take_until(b"<.;")?.to_string();
        let mapped = self.resolver.resolve(&name);
        self.output.push_str(&mapped);
        loop {
            match self.peek() {
                Some(b'<') => self.type_arguments()?,
                Some(b'.') => {
                    self.copy()?;
                    let inner = self.take_until(b"<.;")?.to_string();
                    self.output.push_str(&inner);
                }
                _ => return self.expect(b';'),
            }
        }
    }

    fn type_arguments(&mut self) -> Result<()> {
        self.expect(b'<')?;
        while self.peek() != Some(b'>') {
            match self.peek() {
                Some(b'*') => {
                    self.copy()?;
                }
                Some(b'+' | b'-') => {
                    self.copy()?;
                    self.reference_type()?;
                }
                _ => self.reference_type()?,
            }
        }
        self.expect(b'>')
    }
}

/// Repoint every class-bearing constant at its sandboxed form.
///
/// Entries are never edited in place: new `Utf8`/`NameAndType` entries are
/// appended and the referring entry is repointed, so instruction operands
/// keep their indices. Member references owned by unmapped classes keep
/// their host descriptors. Returns whether anything changed.
pub(crate) fn remap_constant_pool(pool: &mut ConstantPool, resolver: &ClassResolver) -> Result<bool> {
    let original = pool.clone();
    let mut changed = false;
    for (index, entry) in original.entries() {
        match entry {
            Constant::Class { name_index } => {
                let name = original.utf8(*name_index)?;
                let mapped = resolver.resolve(name);
                if mapped != name {
                    let name_index = pool.add_utf8(&mapped)?;
                    pool.replace(index, Constant::Class { name_index })?;
                    changed = true;
                }
            }
            Constant::Fieldref {
                class_index,
                name_and_type_index,
            }
            | Constant::Methodref {
                class_index,
                name_and_type_index,
            }
            | Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => {
                let owner = original.class_name(*class_index)?;
                if !resolver.is_mapped(owner) {
                    continue;
                }
                let Some(name_and_type_index) =
                    remap_name_and_type(&original, pool, resolver, *name_and_type_index)?
                else {
                    continue;
                };
                let replacement = match entry {
                    Constant::Fieldref { class_index, .. } => Constant::Fieldref {
                        class_index: *class_index,
                        name_and_type_index,
                    },
                    Constant::Methodref { class_index, .. } => Constant::Methodref {
                        class_index: *class_index,
                        name_and_type_index,
                    },
                    _ => Constant::InterfaceMethodref {
                        class_index: *class_index,
                        name_and_type_index,
                    },
                };
                pool.replace(index, replacement)?;
                changed = true;
            }
            Constant::MethodType { descriptor_index } => {
                let descriptor = original.utf8(*descriptor_index)?;
                let mapped = resolver.resolve_descriptor(descriptor);
                if mapped != descriptor {
                    let descriptor_index = pool.add_utf8(&mapped)?;
                    pool.replace(index, Constant::MethodType { descriptor_index })?;
                    changed = true;
                }
            }
            Constant::InvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                if let Some(name_and_type_index) =
                    remap_name_and_type(&original, pool, resolver, *name_and_type_index)?
                {
                    pool.replace(
                        index,
                        Constant::InvokeDynamic {
                            bootstrap_method_attr_index: *bootstrap_method_attr_index,
                            name_and_type_index,
                        },
                    )?;
                    changed = true;
                }
            }
            Constant::Dynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                if let Some(name_and_type_index) =
                    remap_name_and_type(&original, pool, resolver, *name_and_type_index)?
                {
                    pool.replace(
                        index,
                        Constant::Dynamic {
                            bootstrap_method_attr_index: *bootstrap_method_attr_index,
                            name_and_type_index,
                        },
                    )?;
                    changed = true;
                }
            }
            _ => {}
        }
    }
    Ok(changed)
}

fn remap_name_and_type(
    original: &ConstantPool,
    pool: &mut ConstantPool,
    resolver: &ClassResolver,
    index: u16,
) -> Result<Option<u16>> {
    let (name, descriptor) = original.name_and_type(index)?;
    let mapped = resolver.resolve_descriptor(descriptor);
    if mapped == descriptor {
        return Ok(None);
    }
    Ok(Some(pool.add_name_and_type(name, &mapped)?))
}

/// Utf8 index holding the remapped form of a descriptor.
pub(crate) fn remap_descriptor_index(
    pool: &mut ConstantPool,
    resolver: &ClassResolver,
    index: u16,
) -> Result<u16> {
    let descriptor = pool.utf8(index)?.to_string();
    let mapped = resolver.resolve_descriptor(&descriptor);
    if mapped == descriptor {
        Ok(index)
    } else {
        pool.add_utf8(&mapped)
    }
}

pub(crate) fn remap_signature_attribute(
    pool: &mut ConstantPool,
    resolver: &ClassResolver,
    info: &[u8],
) -> Result<Vec<u8>> {
    let index = parse_index_attribute(info)?;
    let signature = pool.utf8(index)?.to_string();
    let mapped = resolver.resolve_signature(&signature)?;
    if mapped == signature {
        return Ok(info.to_vec());
    }
    Ok(encode_index_attribute(pool.add_utf8(&mapped)?))
}

/// Remap a class `Signature` attribute. A `java/lang/Object` superclass in
/// the signature follows `super_name`, the superclass the rewritten class
/// declares.
pub(crate) fn remap_class_signature_attribute(
    pool: &mut ConstantPool,
    resolver: &ClassResolver,
    info: &[u8],
    super_name: Option<&str>,
) -> Result<Vec<u8>> {
    let index = parse_index_attribute(info)?;
    let signature = pool.utf8(index)?.to_string();
    let mut mapped = resolver.resolve_signature(&signature)?;
    if let Some(super_name) = super_name {
        mapped = replace_signature_superclass(&mapped, OBJECT, super_name);
    }
    if mapped == signature {
        return Ok(info.to_vec());
    }
    Ok(encode_index_attribute(pool.add_utf8(&mapped)?))
}

/// Swap the superclass of a class signature from `previous` to
/// `super_name`, skipping any type parameters.
fn replace_signature_superclass(signature: &str, previous: &str, super_name: &str) -> String {
    let mut start = 0usize;
    if signature.starts_with('<') {
        let mut depth = 0usize;
        for (index, byte) in signature.bytes().enumerate() {
            match byte {
                b'<' => depth += 1,
                b'>' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        start = index + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    let expected = format!("L{};", previous);
    match signature[start..].strip_prefix(expected.as_str()) {
        Some(rest) => format!("{}L{};{}", &signature[..start], super_name, rest),
        None => signature.to_string(),
    }
}

/// Remap `LocalVariableTable` descriptors, or `LocalVariableTypeTable`
/// signatures when `signatures` is set.
pub(crate) fn remap_local_variable_attribute(
    pool: &mut ConstantPool,
    resolver: &ClassResolver,
    info: &[u8],
    signatures: bool,
) -> Result<Vec<u8>> {
    let mut entries = parse_local_variables(info)?;
    for entry in &mut entries {
        if signatures {
            let signature = pool.utf8(entry.descriptor_index)?.to_string();
            let mapped = resolver.resolve_signature(&signature)?;
            if mapped != signature {
                entry.descriptor_index = pool.add_utf8(&mapped)?;
            }
        } else {
            entry.descriptor_index = remap_descriptor_index(pool, resolver, entry.descriptor_index)?;
        }
    }
    Ok(encode_local_variables(&entries))
}

pub(crate) fn remap_annotations(
    pool: &mut ConstantPool,
    resolver: &ClassResolver,
    info: &[u8],
    layout: AnnotationLayout,
) -> Result<Vec<u8>> {
    let mut failure = None;
    let patched = remap_annotation_attribute(info, layout, &mut |index| {
        match remap_descriptor_index(pool, resolver, index) {
            Ok(mapped) if mapped != index => Some(mapped),
            Ok(_) => None,
            Err(error) => {
                failure.get_or_insert(error);
                None
            }
        }
    })?;
    match failure {
        Some(error) => Err(error),
        None => Ok(patched),
    }
}
