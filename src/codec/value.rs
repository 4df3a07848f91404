//! # Value and Metadata Bundle
//!
//! The typed payload model from spec.md §3: a value is a primitive or a
//! fixed-length array of one of byte/short/int/float/double/string, and it
//! can be wrapped in one of six metadata variants. Scalars are represented
//! as single-element vectors rather than as a separate case, which keeps
//! serialization uniform (the wire format itself never distinguishes
//! "scalar" from "array of one" — only the element count differs).

use std::fmt;

/// The six value kinds CA's DBR type system supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Byte,
    Short,
    Int,
    Float,
    Double,
    String,
}

impl ValueKind {
    /// Size in bytes of a single wire element of this kind (strings are
    /// fixed at `MAX_STRING_SIZE` on the wire).
    pub fn element_size(self) -> usize {
        match self {
            ValueKind::Byte => 1,
            ValueKind::Short => 2,
            ValueKind::Int => 4,
            ValueKind::Float => 4,
            ValueKind::Double => 8,
            ValueKind::String => MAX_STRING_SIZE,
        }
    }
}

/// Maximum length (including NUL) of a standard CA string field.
pub const MAX_STRING_SIZE: usize = 40;
/// Maximum number of enum state labels in a `GraphicEnum` bundle.
pub const MAX_ENUM_STATES: usize = 16;

/// A single scalar, used for metadata fields (display limits etc.) whose
/// element type matches the value's own scalar type.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Byte(u8),
    Short(i16),
    Int(i32),
    Float(f32),
    Double(f64),
    String(String),
}

impl ScalarValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ScalarValue::Byte(_) => ValueKind::Byte,
            ScalarValue::Short(_) => ValueKind::Short,
            ScalarValue::Int(_) => ValueKind::Int,
            ScalarValue::Float(_) => ValueKind::Float,
            ScalarValue::Double(_) => ValueKind::Double,
            ScalarValue::String(_) => ValueKind::String,
        }
    }

    /// The additive identity for this kind, used as the "zero value" spec.md
    /// §3 requires for reads of server-id/native-type outside CONNECTED, and
    /// as a default for unset metadata limit fields.
    pub fn zero(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Byte => ScalarValue::Byte(0),
            ValueKind::Short => ScalarValue::Short(0),
            ValueKind::Int => ScalarValue::Int(0),
            ValueKind::Float => ScalarValue::Float(0.0),
            ValueKind::Double => ScalarValue::Double(0.0),
            ValueKind::String => ScalarValue::String(String::new()),
        }
    }
}

/// The array-valued payload. One variant per `ValueKind`; a scalar is a
/// length-1 array.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(Vec<u8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<String>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Byte(_) => ValueKind::Byte,
            Value::Short(_) => ValueKind::Short,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::String(_) => ValueKind::String,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            Value::Byte(v) => v.len(),
            Value::Short(v) => v.len(),
            Value::Int(v) => v.len(),
            Value::Float(v) => v.len(),
            Value::Double(v) => v.len(),
            Value::String(v) => v.len(),
        }
    }

    /// The zero-value of the given kind with `count` elements, used when a
    /// Channel's fields are read outside CONNECTED (spec.md §3 invariant)
    /// and as the connection-loss sentinel (spec.md §4.6).
    pub fn zero(kind: ValueKind, count: usize) -> Self {
        match kind {
            ValueKind::Byte => Value::Byte(vec![0; count]),
            ValueKind::Short => Value::Short(vec![0; count]),
            ValueKind::Int => Value::Int(vec![0; count]),
            ValueKind::Float => Value::Float(vec![0.0; count]),
            ValueKind::Double => Value::Double(vec![0.0; count]),
            ValueKind::String => Value::String(vec![String::new(); count]),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{v:?}"),
            Value::Short(v) => write!(f, "{v:?}"),
            Value::Int(v) => write!(f, "{v:?}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Double(v) => write!(f, "{v:?}"),
            Value::String(v) => write!(f, "{v:?}"),
        }
    }
}

/// Alarm severity, per CA's `epicsAlarmSeverity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmSeverity(pub u16);

impl AlarmSeverity {
    pub const NO_ALARM: AlarmSeverity = AlarmSeverity(0);
    pub const MINOR: AlarmSeverity = AlarmSeverity(1);
    pub const MAJOR: AlarmSeverity = AlarmSeverity(2);
    pub const INVALID: AlarmSeverity = AlarmSeverity(3);
}

/// Alarm status/condition, per CA's `epicsAlarmCondition`. Only the
/// variants referenced by this crate's tests and defaults are named;
/// unnamed codes pass through as the raw `u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmStatus(pub u16);

impl AlarmStatus {
    pub const NO_ALARM: AlarmStatus = AlarmStatus(0);
    pub const READ: AlarmStatus = AlarmStatus(1);
    pub const WRITE: AlarmStatus = AlarmStatus(2);
    pub const COMM: AlarmStatus = AlarmStatus(9);
    pub const TIMEOUT: AlarmStatus = AlarmStatus(10);
    pub const UDF: AlarmStatus = AlarmStatus(17);
}

/// Which metadata variant a get/monitor request asks for, and which one a
/// response carries. Corresponds to spec.md §3's "Metadata variants".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Plain,
    Alarm,
    Timestamped,
    Graphic,
    Control,
    GraphicEnum,
}

/// The full per-element limits shared by `Graphic` and `Control`.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayLimits {
    pub upper_display: ScalarValue,
    pub lower_display: ScalarValue,
    pub upper_warning: ScalarValue,
    pub lower_warning: ScalarValue,
    pub upper_alarm: ScalarValue,
    pub lower_alarm: ScalarValue,
}

impl DisplayLimits {
    pub fn zero(kind: ValueKind) -> Self {
        Self {
            upper_display: ScalarValue::zero(kind),
            lower_display: ScalarValue::zero(kind),
            upper_warning: ScalarValue::zero(kind),
            lower_warning: ScalarValue::zero(kind),
            upper_alarm: ScalarValue::zero(kind),
            lower_alarm: ScalarValue::zero(kind),
        }
    }
}

/// A metadata bundle, tagged by `MetaKind`. Represented as a single
/// variant-per-kind enum rather than a generic `Metadata<T>` so the
/// get-by-meta operation can take the desired kind as a runtime value (the
/// polymorphic-metadata design note in spec.md §9), not a type parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Metadata {
    Plain,
    Alarm {
        status: AlarmStatus,
        severity: AlarmSeverity,
    },
    Timestamped {
        status: AlarmStatus,
        severity: AlarmSeverity,
        secs: u32,
        nanos: u32,
    },
    Graphic {
        status: AlarmStatus,
        severity: AlarmSeverity,
        units: String,
        precision: Option<i16>,
        limits: DisplayLimits,
    },
    Control {
        status: AlarmStatus,
        severity: AlarmSeverity,
        units: String,
        precision: Option<i16>,
        limits: DisplayLimits,
        upper_control: ScalarValue,
        lower_control: ScalarValue,
    },
    GraphicEnum {
        status: AlarmStatus,
        severity: AlarmSeverity,
        labels: Vec<String>,
    },
}

impl Metadata {
    pub fn kind(&self) -> MetaKind {
        match self {
            Metadata::Plain => MetaKind::Plain,
            Metadata::Alarm { .. } => MetaKind::Alarm,
            Metadata::Timestamped { .. } => MetaKind::Timestamped,
            Metadata::Graphic { .. } => MetaKind::Graphic,
            Metadata::Control { .. } => MetaKind::Control,
            Metadata::GraphicEnum { .. } => MetaKind::GraphicEnum,
        }
    }

    pub fn status_severity(&self) -> Option<(AlarmStatus, AlarmSeverity)> {
        match self {
            Metadata::Plain => None,
            Metadata::Alarm { status, severity }
            | Metadata::Timestamped {
                status, severity, ..
            }
            | Metadata::Graphic {
                status, severity, ..
            }
            | Metadata::Control {
                status, severity, ..
            }
            | Metadata::GraphicEnum {
                status, severity, ..
            } => Some((*status, *severity)),
        }
    }
}

/// A value together with its requested/received metadata, as delivered by
/// get/monitor responses.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub meta: Metadata,
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_value_has_requested_count() {
        let v = Value::zero(ValueKind::Double, 3);
        assert_eq!(v.count(), 3);
        assert_eq!(v, Value::Double(vec![0.0, 0.0, 0.0]));
    }

    #[test]
    fn udf_invalid_constants_match_ca() {
        assert_eq!(AlarmStatus::UDF.0, 17);
        assert_eq!(AlarmSeverity::INVALID.0, 3);
    }
}
