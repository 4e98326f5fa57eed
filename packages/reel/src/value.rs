use std::borrow::Cow;
use std::time::Duration;

use serde::Serialize;

/// Opaque payload carried by [`Cell`](crate::Cell)s and [`Stream`](crate::Stream)s.
///
/// Routines exchange plain values at their suspension points: the value a cell
/// resolves with is the value the waiting routine is resumed with.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// No value. A routine returning `Unit` adds no trailing payload to its stream
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Time actually spent waiting, delivered when a sleep wakes up
    Elapsed(Duration),
    List(Vec<Value>),
}

impl Value {
    pub fn is_unit(&self) -> bool {
        matches!(self, Self::Unit)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(x) => Some(x),
            Self::Str(x) => Some(x.as_bytes()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(x) => Some(x),
            _ => None,
        }
    }

    /// Get the value as seconds, for `Elapsed`, `Float` and `Int`
    pub fn as_secs_f64(&self) -> Option<f64> {
        match self {
            Self::Elapsed(d) => Some(d.as_secs_f64()),
            Self::Float(x) => Some(*x),
            Self::Int(x) => Some(*x as f64),
            _ => None,
        }
    }

    /// Render the value for the wire.
    ///
    /// Strings and bytes are written as-is, everything else as its
    /// display form. `Unit` renders as nothing.
    pub fn to_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Self::Unit => Cow::Borrowed(&[]),
            Self::Bytes(x) => Cow::Borrowed(x),
            Self::Str(x) => Cow::Borrowed(x.as_bytes()),
            other => Cow::Owned(other.to_string().into_bytes()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unit => Ok(()),
            Self::Bool(x) => write!(f, "{x}"),
            Self::Int(x) => write!(f, "{x}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(x) => f.write_str(x),
            Self::Bytes(x) => f.write_str(&String::from_utf8_lossy(x)),
            Self::Elapsed(x) => write!(f, "{:.2}", x.as_secs_f64()),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

macro_rules! impl_from {
    ($($t:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => { $(
        impl From<$t> for Value {
            fn from(value: $t) -> Self {
                Self::$variant(value $(as $cast)?)
            }
        }
    )* }
}
impl_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int as i64,
    u32 => Int as i64,
    usize => Int as i64,
    f64 => Float,
    String => Str,
    Vec<u8> => Bytes,
    Duration => Elapsed,
    Vec<Value> => List,
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Unit
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}
