//! Pure helpers over JVM type and method descriptors.

use anyhow::{Context, Result};

pub(crate) const CONSTRUCTOR_NAME: &str = "<init>";
pub(crate) const CLASS_INITIALIZER_NAME: &str = "<clinit>";

/// Number of arguments in a method descriptor.
///
/// Counts only at the outermost parenthesis level, so a stray nested group is
/// skipped as a whole rather than miscounted.
pub(crate) fn number_of_arguments(descriptor: &str) -> usize {
    let bytes = descriptor.as_bytes();
    let mut count = 0usize;
    let mut level = 0usize;
    let mut index = 0usize;
    while index < bytes.len() {
        match bytes[index] {
            b'(' => level += 1,
            b')' => {
                level = level.saturating_sub(1);
                if level == 0 {
                    break;
                }
            }
            b'L' => {
                if level == 1 {
                    count += 1;
                }
                while index < bytes.len() && bytes[index] != b';' {
                    index += 1;
                }
            }
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => {
                if level == 1 {
                    count += 1;
                }
            }
            _ => {}
        }
        index += 1;
    }
    count
}

pub(crate) fn returns_value_or_reference(descriptor: &str) -> bool {
    !descriptor.ends_with(")V")
}

pub(crate) fn is_constructor(name: &str) -> bool {
    name == CONSTRUCTOR_NAME
}

pub(crate) fn is_class_initializer(name: &str) -> bool {
    name == CLASS_INITIALIZER_NAME
}

/// Internal names of every class mentioned by a field or method descriptor.
pub(crate) fn referenced_classes(descriptor: &str) -> Vec<String> {
    let mut classes = Vec::new();
    let mut rest = descriptor;
    while let Some(start) = rest.find('L') {
        let after = &rest[start + 1..];
        match after.find(';') {
            Some(end) => {
                let name = &after[..end];
                if !name.is_empty() && !classes.iter().any(|known| known == name) {
                    classes.push(name.to_string());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    classes
}

/// Length of the field descriptor at the start of `descriptor`.
pub(crate) fn field_descriptor_length(descriptor: &str) -> Result<usize> {
    let bytes = descriptor.as_bytes();
    let mut index = 0usize;
    while bytes.get(index) == Some(&b'[') {
        index += 1;
    }
    match bytes.get(index) {
        Some(b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z') => Ok(index + 1),
        Some(b'L') => {
            let end = descriptor[index..]
                .find(';')
                .with_context(|| format!("unterminated class type in {}", descriptor))?;
            Ok(index + end + 1)
        }
        _ => anyhow::bail!("malformed field descriptor {}", descriptor),
    }
}

/// Argument descriptors and return descriptor of a method descriptor.
pub(crate) fn split_method_descriptor(descriptor: &str) -> Result<(Vec<&str>, &str)> {
    let body = descriptor
        .strip_prefix('(')
        .with_context(|| format!("method descriptor {} must start with '('", descriptor))?;
    let close = body
        .find(')')
        .with_context(|| format!("method descriptor {} has no ')'", descriptor))?;
    let mut arguments = Vec::new();
    let mut rest = &body[..close];
    while !rest.is_empty() {
        let length = field_descriptor_length(rest)?;
        arguments.push(&rest[..length]);
        rest = &rest[length..];
    }
    let return_type = &body[close + 1..];
    if return_type != "V" {
        field_descriptor_length(return_type)?;
    }
    Ok((arguments, return_type))
}

/// Operand stack slots taken by a field descriptor.
pub(crate) fn slot_size(descriptor: &str) -> u16 {
    match descriptor.as_bytes().first() {
        Some(b'J' | b'D') => 2,
        Some(b'V') => 0,
        _ => 1,
    }
}

/// Local slots needed for a method's arguments, including `this`.
pub(crate) fn argument_slots(descriptor: &str, is_static: bool) -> Result<u16> {
    let (arguments, _) = split_method_descriptor(descriptor)?;
    let receiver = if is_static { 0 } else { 1 };
    Ok(arguments.iter().map(|argument| slot_size(argument)).sum::<u16>() + receiver)
}
