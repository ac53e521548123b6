// ── Variant ──
//
// The tagged scalar exchanged across the fabric. Every typed accessor
// returns a Result: `NullValue` for Null, `NotConvertable` whenever the
// conversion would lose information or the text does not parse.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// 2^53: the largest magnitude up to which every integer is exact in f64.
const F64_EXACT_INT: i64 = 1 << 53;

/// Tag of a [`Variant`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VariantType {
    Null,
    Bool,
    Int32,
    Int64,
    Float64,
    String,
}

/// A tagged scalar value.
///
/// Equality is total: values of different tags are never equal, and two
/// NaN floats compare equal so that change suppression stays stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
}

impl Variant {
    pub fn variant_type(&self) -> VariantType {
        match self {
            Self::Null => VariantType::Null,
            Self::Bool(_) => VariantType::Bool,
            Self::Int32(_) => VariantType::Int32,
            Self::Int64(_) => VariantType::Int64,
            Self::Float64(_) => VariantType::Float64,
            Self::String(_) => VariantType::String,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int32(_) | Self::Int64(_) | Self::Float64(_))
    }

    // ── Typed accessors ──────────────────────────────────────────────

    /// Numbers are `true` when non-zero; strings accept `true`/`false`
    /// or anything numeric.
    pub fn as_bool(&self) -> Result<bool, CoreError> {
        match self {
            Self::Null => Err(CoreError::NullValue),
            Self::Bool(b) => Ok(*b),
            Self::Int32(v) => Ok(*v != 0),
            Self::Int64(v) => Ok(*v != 0),
            Self::Float64(v) => Ok(*v != 0.0),
            Self::String(s) => match s.as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => s
                    .parse::<f64>()
                    .map(|v| v != 0.0)
                    .map_err(|_| self.not_convertable(VariantType::Bool)),
            },
        }
    }

    pub fn as_i32(&self) -> Result<i32, CoreError> {
        let wide = self.as_i64_for(VariantType::Int32)?;
        i32::try_from(wide).map_err(|_| self.not_convertable(VariantType::Int32))
    }

    pub fn as_i64(&self) -> Result<i64, CoreError> {
        self.as_i64_for(VariantType::Int64)
    }

    pub fn as_f64(&self) -> Result<f64, CoreError> {
        match self {
            Self::Null => Err(CoreError::NullValue),
            Self::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Self::Int32(v) => Ok(f64::from(*v)),
            Self::Int64(v) => {
                exact_f64(*v).ok_or_else(|| self.not_convertable(VariantType::Float64))
            }
            Self::Float64(v) => Ok(*v),
            Self::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| self.not_convertable(VariantType::Float64)),
        }
    }

    /// Text form of any non-null value.
    pub fn as_string(&self) -> Result<String, CoreError> {
        match self {
            Self::Null => Err(CoreError::NullValue),
            Self::String(s) => Ok(s.clone()),
            other => Ok(other.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert into another tag, losslessly.
    pub fn convert(&self, target: VariantType) -> Result<Variant, CoreError> {
        Ok(match target {
            VariantType::Null => Variant::Null,
            VariantType::Bool => Variant::Bool(self.as_bool()?),
            VariantType::Int32 => Variant::Int32(self.as_i32()?),
            VariantType::Int64 => Variant::Int64(self.as_i64()?),
            VariantType::Float64 => Variant::Float64(self.as_f64()?),
            VariantType::String => Variant::String(self.as_string()?),
        })
    }

    /// Parse text produced by `Display` back into a value of tag `ty`.
    pub fn parse(ty: VariantType, text: &str) -> Result<Variant, CoreError> {
        match ty {
            VariantType::Null => Ok(Variant::Null),
            VariantType::String => Ok(Variant::String(text.to_owned())),
            other => Variant::String(text.to_owned()).convert(other),
        }
    }

    fn as_i64_for(&self, target: VariantType) -> Result<i64, CoreError> {
        match self {
            Self::Null => Err(CoreError::NullValue),
            Self::Bool(b) => Ok(i64::from(*b)),
            Self::Int32(v) => Ok(i64::from(*v)),
            Self::Int64(v) => Ok(*v),
            Self::Float64(v) => exact_i64(*v).ok_or_else(|| self.not_convertable(target)),
            Self::String(s) => {
                let s = s.trim();
                if let Ok(v) = s.parse::<i64>() {
                    return Ok(v);
                }
                s.parse::<f64>()
                    .ok()
                    .and_then(exact_i64)
                    .ok_or_else(|| self.not_convertable(target))
            }
        }
    }

    fn not_convertable(&self, target: VariantType) -> CoreError {
        CoreError::NotConvertable {
            value: self.to_string(),
            target: target.to_string(),
        }
    }
}

/// `v` as i64 if it is finite, integral and in range.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn exact_i64(v: f64) -> Option<i64> {
    // 2^63 as f64 is exact; the valid range is [-2^63, 2^63).
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if v.is_finite() && v.fract() == 0.0 && v >= -LIMIT && v < LIMIT {
        Some(v as i64)
    } else {
        None
    }
}

/// `v` as f64 if the conversion is exact.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn exact_f64(v: i64) -> Option<f64> {
    if (-F64_EXACT_INT..=F64_EXACT_INT).contains(&v) {
        Some(v as f64)
    } else {
        None
    }
}

// ── Equality ─────────────────────────────────────────────────────────

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::String(a), Self::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Variant {}

// ── Display ──────────────────────────────────────────────────────────

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

// ── Conversions ──────────────────────────────────────────────────────

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl<T: Into<Variant>> From<Option<T>> for Variant {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn null_access_is_null_value() {
        assert_eq!(Variant::Null.as_i32(), Err(CoreError::NullValue));
        assert_eq!(Variant::Null.as_f64(), Err(CoreError::NullValue));
        assert_eq!(Variant::Null.as_bool(), Err(CoreError::NullValue));
        assert_eq!(Variant::Null.as_string(), Err(CoreError::NullValue));
    }

    #[test]
    fn widening_conversions_succeed() {
        assert_eq!(Variant::Int32(7).as_i64().unwrap(), 7);
        assert!((Variant::Int32(7).as_f64().unwrap() - 7.0).abs() < f64::EPSILON);
        assert!((Variant::Int64(1 << 40).as_f64().unwrap() - 1_099_511_627_776.0).abs() < f64::EPSILON);
        assert_eq!(Variant::Float64(12.0).as_i32().unwrap(), 12);
        assert!(Variant::Int32(-3).as_bool().unwrap());
    }

    #[test]
    fn lossy_narrowing_is_not_convertable() {
        assert!(matches!(
            Variant::Int64(i64::from(i32::MAX) + 1).as_i32(),
            Err(CoreError::NotConvertable { .. })
        ));
        assert!(matches!(
            Variant::Float64(1.5).as_i64(),
            Err(CoreError::NotConvertable { .. })
        ));
        assert!(matches!(
            Variant::Float64(1e300).as_i64(),
            Err(CoreError::NotConvertable { .. })
        ));
        assert!(matches!(
            Variant::Float64(f64::NAN).as_i32(),
            Err(CoreError::NotConvertable { .. })
        ));
        assert!(matches!(
            Variant::Int64(F64_EXACT_INT + 1).as_f64(),
            Err(CoreError::NotConvertable { .. })
        ));
    }

    #[test]
    fn strings_parse_or_fail() {
        assert_eq!(Variant::from("42").as_i32().unwrap(), 42);
        assert!((Variant::from(" 2.5 ").as_f64().unwrap() - 2.5).abs() < f64::EPSILON);
        assert_eq!(Variant::from("8.0").as_i64().unwrap(), 8);
        assert!(Variant::from("true").as_bool().unwrap());
        assert!(matches!(
            Variant::from("pump").as_i32(),
            Err(CoreError::NotConvertable { ref target, .. }) if target == "int32"
        ));
    }

    #[test]
    fn equality_requires_matching_tags() {
        assert_ne!(Variant::Int32(1), Variant::Int64(1));
        assert_ne!(Variant::Float64(1.0), Variant::Int32(1));
        assert_ne!(Variant::from("A"), Variant::from("a"));
        assert_eq!(Variant::Float64(f64::NAN), Variant::Float64(f64::NAN));
        assert_eq!(Variant::Null, Variant::default());
    }

    #[test]
    fn numeric_text_round_trips() {
        let values = [
            Variant::Int32(i32::MIN),
            Variant::Int64(i64::MAX),
            Variant::Float64(0.1),
            Variant::Float64(-1.25e-7),
            Variant::Float64(123_456_789.0),
        ];
        for v in values {
            let parsed = Variant::parse(v.variant_type(), &v.to_string()).unwrap();
            assert_eq!(parsed, v, "round trip of {v}");
        }
    }

    #[test]
    fn serde_is_adjacently_tagged() {
        let json = serde_json::to_string(&Variant::Int32(5)).unwrap();
        assert_eq!(json, r#"{"type":"int32","value":5}"#);
        let back: Variant = serde_json::from_str(r#"{"type":"string","value":"V"}"#).unwrap();
        assert_eq!(back, Variant::from("V"));
        let null: Variant = serde_json::from_str(r#"{"type":"null"}"#).unwrap();
        assert!(null.is_null());
    }

    #[test]
    fn option_maps_none_to_null() {
        assert_eq!(Variant::from(None::<i32>), Variant::Null);
        assert_eq!(Variant::from(Some(2.0)), Variant::Float64(2.0));
    }
}
