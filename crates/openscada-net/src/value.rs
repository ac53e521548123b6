// ── Wire values ──
//
// The tagged value tree carried in GMPP message bodies. Scalars map onto
// the fabric's Variant; lists and maps only exist on the wire.

use std::collections::BTreeMap;

/// Tag codes of the GMPP value encoding.
pub mod tag {
    pub const STRING: u32 = 0x0000_0001;
    pub const LONG: u32 = 0x0000_0002;
    pub const DOUBLE: u32 = 0x0000_0003;
    pub const VOID: u32 = 0x0000_0004;
    pub const INTEGER: u32 = 0x0000_0005;
    pub const LIST: u32 = 0x0000_0006;
    pub const MAP: u32 = 0x0000_0007;
    pub const BOOLEAN: u32 = 0x0000_0008;
}

/// A string-keyed map of values. Also the shape of every message body.
pub type ValueMap = BTreeMap<String, Value>;

/// A tagged GMPP value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Long(i64),
    Double(f64),
    Void,
    Integer(i32),
    List(Vec<Value>),
    Map(ValueMap),
    Boolean(bool),
}

impl Value {
    /// The tag code this value is encoded with.
    pub fn tag(&self) -> u32 {
        match self {
            Self::String(_) => tag::STRING,
            Self::Long(_) => tag::LONG,
            Self::Double(_) => tag::DOUBLE,
            Self::Void => tag::VOID,
            Self::Integer(_) => tag::INTEGER,
            Self::List(_) => tag::LIST,
            Self::Map(_) => tag::MAP,
            Self::Boolean(_) => tag::BOOLEAN,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view accepting both `Integer` and `Long`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            Self::Integer(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<ValueMap> for Value {
    fn from(m: ValueMap) -> Self {
        Self::Map(m)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Self::List(l)
    }
}
