//! Property tree view on emulated hardware for monitors and debuggers

use std::borrow::Cow;
use std::fmt;

use serde::Serialize;

#[macro_export]
macro_rules! dbgprop_header {
    ($name:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Header)
    };
}

#[macro_export]
macro_rules! dbgprop_bool {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Boolean($val))
    };
}

#[macro_export]
macro_rules! dbgprop_byte {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Byte($val))
    };
}

#[macro_export]
macro_rules! dbgprop_long {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Long($val))
    };
}

#[macro_export]
macro_rules! dbgprop_udec {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new(
            $name,
            DebuggablePropertyValue::UnsignedDecimal(($val) as u64),
        )
    };
}

#[macro_export]
macro_rules! dbgprop_enum {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new(
            $name,
            DebuggablePropertyValue::StaticStr($val.clone().into()),
        )
    };
}

#[macro_export]
macro_rules! dbgprop_string {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::String($val))
    };
}

#[macro_export]
macro_rules! dbgprop_group {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Nested($val))
    };
}

pub type DebuggableProperties = Vec<DebuggableProperty>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebuggableProperty {
    name: Cow<'static, str>,
    value: DebuggablePropertyValue,
}

impl DebuggableProperty {
    pub fn new(name: impl Into<Cow<'static, str>>, value: DebuggablePropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &DebuggablePropertyValue {
        &self.value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value")]
pub enum DebuggablePropertyValue {
    Header,
    Nested(DebuggableProperties),
    Boolean(bool),
    Byte(u8),
    Long(u32),
    UnsignedDecimal(u64),
    StaticStr(&'static str),
    String(String),
}

impl fmt::Display for DebuggablePropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header | Self::Nested(_) => Ok(()),
            Self::Boolean(b) => write!(f, "{}", if *b { "1" } else { "0" }),
            Self::Byte(v) => write!(f, "${:02X}", v),
            Self::Long(v) => write!(f, "${:08X}", v),
            Self::UnsignedDecimal(v) => write!(f, "{}", v),
            Self::StaticStr(s) => write!(f, "{}", s),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

/// Looks up a property by its '/' separated path through nested groups,
/// e.g. "Signals/REQ"
pub fn lookup<'a>(
    props: &'a [DebuggableProperty],
    path: &str,
) -> Option<&'a DebuggablePropertyValue> {
    let (name, rest) = match path.split_once('/') {
        Some((name, rest)) => (name, Some(rest)),
        None => (path, None),
    };
    let prop = props.iter().find(|p| p.name() == name)?;
    match (rest, prop.value()) {
        (None, value) => Some(value),
        (Some(rest), DebuggablePropertyValue::Nested(children)) => lookup(children, rest),
        (Some(_), _) => None,
    }
}

/// Plain text rendering for log output, one property per line, groups indented
pub fn render(props: &[DebuggableProperty]) -> String {
    fn walk(out: &mut String, props: &[DebuggableProperty], depth: usize) {
        for p in props {
            let indent = "  ".repeat(depth);
            match p.value() {
                DebuggablePropertyValue::Header => {
                    out.push_str(&format!("{}[{}]\n", indent, p.name()));
                }
                DebuggablePropertyValue::Nested(children) => {
                    out.push_str(&format!("{}{}:\n", indent, p.name()));
                    walk(out, children, depth + 1);
                }
                value => out.push_str(&format!("{}{}: {}\n", indent, p.name(), value)),
            }
        }
    }

    let mut out = String::new();
    walk(&mut out, props, 0);
    out
}

pub trait Debuggable {
    fn get_debug_properties(&self) -> DebuggableProperties;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DebuggableProperties {
        vec![
            dbgprop_header!("Bus"),
            dbgprop_long!("Address", 0x1234),
            dbgprop_group!(
                "Signals",
                vec![dbgprop_bool!("REQ", true), dbgprop_byte!("Data bus", 0xA5)]
            ),
        ]
    }

    #[test]
    fn lookup_paths() {
        let props = sample();
        assert_eq!(
            lookup(&props, "Signals/REQ"),
            Some(&DebuggablePropertyValue::Boolean(true))
        );
        assert_eq!(
            lookup(&props, "Address"),
            Some(&DebuggablePropertyValue::Long(0x1234))
        );
        assert!(matches!(
            lookup(&props, "Signals"),
            Some(DebuggablePropertyValue::Nested(_))
        ));
        assert_eq!(lookup(&props, "Signals/ACK"), None);
        assert_eq!(lookup(&props, "Address/low"), None);
        assert_eq!(lookup(&props, ""), None);
    }

    #[test]
    fn render_text() {
        assert_eq!(
            render(&sample()),
            "[Bus]\nAddress: $00001234\nSignals:\n  REQ: 1\n  Data bus: $A5\n"
        );
    }

    #[test]
    fn serialize() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json[0]["value"]["kind"], "Header");
        assert_eq!(json[1]["value"]["value"], 0x1234);
        assert_eq!(json[2]["value"]["value"][1]["name"], "Data bus");
    }
}
