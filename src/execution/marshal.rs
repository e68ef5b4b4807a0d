//! Moving values across the sandbox boundary.
//!
//! In marshalling mode host values are converted into the sandbox's shadow
//! types on the way in and back on the way out. Raw mode converts nothing
//! and only checks that the caller handed over sandbox-native values.

use anyhow::{bail, Result};

use crate::execution::host::{GuestValue, Primitive, PrimitiveArray};
use crate::remapper::SANDBOX_PREFIX;

/// A host-side value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Char(char),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Array(PrimitiveArray),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

/// Host value into the sandbox.
pub fn to_guest(value: Value) -> Result<GuestValue> {
    Ok(match value {
        Value::Null => GuestValue::Null,
        Value::Boolean(value) => GuestValue::Boxed(Primitive::Boolean(value)),
        Value::Byte(value) => GuestValue::Boxed(Primitive::Byte(value)),
        Value::Char(value) => {
            let mut units = [0u16; 2];
            let encoded = value.encode_utf16(&mut units);
            if encoded.len() != 1 {
                bail!("character {:?} does not fit a single UTF-16 unit", value);
            }
            GuestValue::Boxed(Primitive::Char(encoded[0]))
        }
        Value::Short(value) => GuestValue::Boxed(Primitive::Short(value)),
        Value::Int(value) => GuestValue::Boxed(Primitive::Int(value)),
        Value::Long(value) => GuestValue::Boxed(Primitive::Long(value)),
        Value::Float(value) => GuestValue::Boxed(Primitive::Float(value)),
        Value::Double(value) => GuestValue::Boxed(Primitive::Double(value)),
        Value::String(value) => GuestValue::String(value),
        Value::Array(array) => GuestValue::Array(array),
    })
}

/// Sandbox value back to the host. Arbitrary guest objects have no host
/// counterpart.
pub fn from_guest(value: GuestValue) -> Result<Value> {
    Ok(match value {
        GuestValue::Null => Value::Null,
        GuestValue::String(value) => Value::String(value),
        GuestValue::Boxed(primitive) => match primitive {
            Primitive::Boolean(value) => Value::Boolean(value),
            Primitive::Byte(value) => Value::Byte(value),
            Primitive::Char(unit) => match char::from_u32(unit as u32) {
                Some(value) => Value::Char(value),
                None => bail!("unpaired surrogate {:#06x} cannot leave the sandbox", unit),
            },
            Primitive::Short(value) => Value::Short(value),
            Primitive::Int(value) => Value::Int(value),
            Primitive::Long(value) => Value::Long(value),
            Primitive::Float(value) => Value::Float(value),
            Primitive::Double(value) => Value::Double(value),
        },
        GuestValue::Array(array) => Value::Array(array),
        GuestValue::Object { class_name, .. } => bail!(
            "cannot marshal an instance of {} out of the sandbox",
            class_name.replace('/', ".")
        ),
    })
}

/// Raw-mode check that an input already lives in the sandbox namespace.
pub fn require_sandbox_native(value: &GuestValue) -> Result<()> {
    if let GuestValue::Object { class_name, .. } = value {
        let element = class_name.trim_start_matches('[');
        let element = element
            .strip_prefix('L')
            .and_then(|name| name.strip_suffix(';'))
            .unwrap_or(element);
        if !element.starts_with(SANDBOX_PREFIX) {
            bail!(
                "{} is not a sandboxed type; raw execution takes sandbox values only",
                class_name.replace('/', ".")
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_and_primitives_cross_both_ways() {
        let input = to_guest(Value::from("Hello World!")).expect("to guest");
        assert_eq!(input, GuestValue::String("Hello World!".to_string()));
        assert_eq!(from_guest(input).expect("back"), Value::from("Hello World!"));

        let boxed = to_guest(Value::Char('x')).expect("char");
        assert_eq!(boxed.class_name(), Some("sandbox/java/lang/Character"));
        assert_eq!(from_guest(boxed).expect("back"), Value::Char('x'));
    }

    #[test]
    fn characters_outside_the_basic_plane_are_rejected() {
        let error = to_guest(Value::Char('\u{1F600}')).expect_err("needs a surrogate pair");

        assert!(error.to_string().contains("single UTF-16 unit"));
    }

    #[test]
    fn guest_objects_stay_inside() {
        let object = GuestValue::Object {
            class_name: "sandbox/com/example/Result".to_string(),
            identity: 3,
        };

        let error = from_guest(object).expect_err("no host form");

        assert_eq!(
            error.to_string(),
            "cannot marshal an instance of sandbox.com.example.Result out of the sandbox"
        );
    }

    #[test]
    fn raw_mode_rejects_host_objects() {
        let host = GuestValue::Object {
            class_name: "com/example/Input".to_string(),
            identity: 1,
        };
        let sandboxed = GuestValue::Object {
            class_name: "[Lsandbox/com/example/Input;".to_string(),
            identity: 2,
        };

        assert!(require_sandbox_native(&host).is_err());
        assert!(require_sandbox_native(&sandboxed).is_ok());
        assert!(require_sandbox_native(&GuestValue::String("s".to_string())).is_ok());
    }
}
