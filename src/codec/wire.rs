//! # Payload Serialization
//!
//! Encodes/decodes the frame body (metadata prefix + value array) for a
//! given (value kind, metadata kind, count), per spec.md §4.1. Frame
//! headers are handled in the parent module; this module only ever sees
//! the bytes between the header and the next frame's header.

use anyhow::{anyhow, bail, Context as _, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use super::value::{
    AlarmSeverity, AlarmStatus, Bundle, DisplayLimits, MetaKind, Metadata, ScalarValue, Value,
    ValueKind, MAX_ENUM_STATES, MAX_STRING_SIZE,
};
use super::padded_len;

const UNITS_SIZE: usize = 8;

/// Serialize a bundle's metadata prefix + value array, padded to an 8-byte
/// multiple as spec.md §4.1 requires. The caller is responsible for
/// emitting the frame header (which needs the unpadded size for the
/// extended-header threshold check, but the padded size for `payloadSize`
/// when `payloadSize` is a true wire field — see `transport`).
pub fn encode_payload(bundle: &Bundle) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_metadata(&mut out, &bundle.meta)?;
    encode_value_array(&mut out, &bundle.value)?;
    let pad = padded_len(out.len()) - out.len();
    out.extend(std::iter::repeat(0u8).take(pad));
    Ok(out)
}

fn encode_metadata(out: &mut Vec<u8>, meta: &Metadata) -> Result<()> {
    match meta {
        Metadata::Plain => {}
        Metadata::Alarm { status, severity } => {
            out.write_u16::<BigEndian>(status.0)?;
            out.write_u16::<BigEndian>(severity.0)?;
        }
        Metadata::Timestamped {
            status,
            severity,
            secs,
            nanos,
        } => {
            out.write_u16::<BigEndian>(status.0)?;
            out.write_u16::<BigEndian>(severity.0)?;
            out.write_u32::<BigEndian>(*secs)?;
            out.write_u32::<BigEndian>(*nanos)?;
        }
        Metadata::Graphic {
            status,
            severity,
            units,
            precision,
            limits,
        } => {
            out.write_u16::<BigEndian>(status.0)?;
            out.write_u16::<BigEndian>(severity.0)?;
            if let Some(p) = precision {
                out.write_i16::<BigEndian>(*p)?;
            }
            write_fixed_str(out, units, UNITS_SIZE);
            encode_limits(out, limits)?;
        }
        Metadata::Control {
            status,
            severity,
            units,
            precision,
            limits,
            upper_control,
            lower_control,
        } => {
            out.write_u16::<BigEndian>(status.0)?;
            out.write_u16::<BigEndian>(severity.0)?;
            if let Some(p) = precision {
                out.write_i16::<BigEndian>(*p)?;
            }
            write_fixed_str(out, units, UNITS_SIZE);
            encode_limits(out, limits)?;
            encode_scalar(out, upper_control)?;
            encode_scalar(out, lower_control)?;
        }
        Metadata::GraphicEnum {
            status,
            severity,
            labels,
        } => {
            out.write_u16::<BigEndian>(status.0)?;
            out.write_u16::<BigEndian>(severity.0)?;
            out.write_u16::<BigEndian>(labels.len() as u16)?;
            for i in 0..MAX_ENUM_STATES {
                let label = labels.get(i).map(String::as_str).unwrap_or("");
                write_fixed_str(out, label, MAX_STRING_SIZE);
            }
        }
    }
    Ok(())
}

fn encode_limits(out: &mut Vec<u8>, limits: &DisplayLimits) -> Result<()> {
    encode_scalar(out, &limits.upper_display)?;
    encode_scalar(out, &limits.lower_display)?;
    encode_scalar(out, &limits.upper_warning)?;
    encode_scalar(out, &limits.lower_warning)?;
    encode_scalar(out, &limits.upper_alarm)?;
    encode_scalar(out, &limits.lower_alarm)?;
    Ok(())
}

fn encode_scalar(out: &mut Vec<u8>, v: &ScalarValue) -> Result<()> {
    match v {
        ScalarValue::Byte(b) => out.push(*b),
        ScalarValue::Short(s) => out.write_i16::<BigEndian>(*s)?,
        ScalarValue::Int(i) => out.write_i32::<BigEndian>(*i)?,
        ScalarValue::Float(f) => out.write_f32::<BigEndian>(*f)?,
        ScalarValue::Double(d) => out.write_f64::<BigEndian>(*d)?,
        ScalarValue::String(s) => write_fixed_str(out, s, MAX_STRING_SIZE),
    }
    Ok(())
}

fn write_fixed_str(out: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let take = bytes.len().min(width - 1);
    out.extend_from_slice(&bytes[..take]);
    out.extend(std::iter::repeat(0u8).take(width - take));
}

fn encode_value_array(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Byte(v) => out.extend_from_slice(v),
        Value::Short(v) => {
            for e in v {
                out.write_i16::<BigEndian>(*e)?;
            }
        }
        Value::Int(v) => {
            for e in v {
                out.write_i32::<BigEndian>(*e)?;
            }
        }
        Value::Float(v) => {
            for e in v {
                out.write_f32::<BigEndian>(*e)?;
            }
        }
        Value::Double(v) => {
            for e in v {
                out.write_f64::<BigEndian>(*e)?;
            }
        }
        Value::String(v) => {
            for e in v {
                write_fixed_str(out, e, MAX_STRING_SIZE);
            }
        }
    }
    Ok(())
}

/// Decode a frame body into a `Bundle`. `bytes` may include trailing
/// padding; only the portion implied by `value_kind`/`meta_kind`/`count` is
/// consumed.
pub fn decode_payload(
    value_kind: ValueKind,
    meta_kind: MetaKind,
    count: usize,
    bytes: &[u8],
) -> Result<Bundle> {
    let mut cur = Cursor::new(bytes);
    let meta = decode_metadata(&mut cur, meta_kind, value_kind)
        .context("decoding metadata prefix")?;
    let value = decode_value_array(&mut cur, value_kind, count)
        .context("decoding value array")?;
    Ok(Bundle { meta, value })
}

fn decode_metadata(cur: &mut Cursor<&[u8]>, meta_kind: MetaKind, value_kind: ValueKind) -> Result<Metadata> {
    Ok(match meta_kind {
        MetaKind::Plain => Metadata::Plain,
        MetaKind::Alarm => Metadata::Alarm {
            status: AlarmStatus(cur.read_u16::<BigEndian>()?),
            severity: AlarmSeverity(cur.read_u16::<BigEndian>()?),
        },
        MetaKind::Timestamped => Metadata::Timestamped {
            status: AlarmStatus(cur.read_u16::<BigEndian>()?),
            severity: AlarmSeverity(cur.read_u16::<BigEndian>()?),
            secs: cur.read_u32::<BigEndian>()?,
            nanos: cur.read_u32::<BigEndian>()?,
        },
        MetaKind::Graphic => {
            let status = AlarmStatus(cur.read_u16::<BigEndian>()?);
            let severity = AlarmSeverity(cur.read_u16::<BigEndian>()?);
            let precision = read_precision(cur, value_kind)?;
            let units = read_fixed_str(cur, UNITS_SIZE)?;
            let limits = decode_limits(cur, value_kind)?;
            Metadata::Graphic {
                status,
                severity,
                units,
                precision,
                limits,
            }
        }
        MetaKind::Control => {
            let status = AlarmStatus(cur.read_u16::<BigEndian>()?);
            let severity = AlarmSeverity(cur.read_u16::<BigEndian>()?);
            let precision = read_precision(cur, value_kind)?;
            let units = read_fixed_str(cur, UNITS_SIZE)?;
            let limits = decode_limits(cur, value_kind)?;
            let upper_control = decode_scalar(cur, value_kind)?;
            let lower_control = decode_scalar(cur, value_kind)?;
            Metadata::Control {
                status,
                severity,
                units,
                precision,
                limits,
                upper_control,
                lower_control,
            }
        }
        MetaKind::GraphicEnum => {
            let status = AlarmStatus(cur.read_u16::<BigEndian>()?);
            let severity = AlarmSeverity(cur.read_u16::<BigEndian>()?);
            let no_str = cur.read_u16::<BigEndian>()? as usize;
            if no_str > MAX_ENUM_STATES {
                bail!("GraphicEnum label count {no_str} exceeds {MAX_ENUM_STATES}");
            }
            let mut labels = Vec::with_capacity(no_str);
            for i in 0..MAX_ENUM_STATES {
                let label = read_fixed_str(cur, MAX_STRING_SIZE)?;
                if i < no_str {
                    labels.push(label);
                }
            }
            Metadata::GraphicEnum {
                status,
                severity,
                labels,
            }
        }
    })
}

fn read_precision(cur: &mut Cursor<&[u8]>, kind: ValueKind) -> Result<Option<i16>> {
    Ok(match kind {
        ValueKind::Float | ValueKind::Double => Some(cur.read_i16::<BigEndian>()?),
        _ => None,
    })
}

fn decode_limits(cur: &mut Cursor<&[u8]>, kind: ValueKind) -> Result<DisplayLimits> {
    Ok(DisplayLimits {
        upper_display: decode_scalar(cur, kind)?,
        lower_display: decode_scalar(cur, kind)?,
        upper_warning: decode_scalar(cur, kind)?,
        lower_warning: decode_scalar(cur, kind)?,
        upper_alarm: decode_scalar(cur, kind)?,
        lower_alarm: decode_scalar(cur, kind)?,
    })
}

fn decode_scalar(cur: &mut Cursor<&[u8]>, kind: ValueKind) -> Result<ScalarValue> {
    Ok(match kind {
        ValueKind::Byte => ScalarValue::Byte(cur.read_u8()?),
        ValueKind::Short => ScalarValue::Short(cur.read_i16::<BigEndian>()?),
        ValueKind::Int => ScalarValue::Int(cur.read_i32::<BigEndian>()?),
        ValueKind::Float => ScalarValue::Float(cur.read_f32::<BigEndian>()?),
        ValueKind::Double => ScalarValue::Double(cur.read_f64::<BigEndian>()?),
        ValueKind::String => ScalarValue::String(read_fixed_str(cur, MAX_STRING_SIZE)?),
    })
}

fn read_fixed_str(cur: &mut Cursor<&[u8]>, width: usize) -> Result<String> {
    let mut buf = vec![0u8; width];
    cur.read_exact(&mut buf)?;
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    // Truncate beyond the field boundary rather than erroring, per spec.md
    // §4.1 ("Strings beyond boundary: truncate").
    let text = &buf[..nul.min(width.saturating_sub(1))];
    Ok(String::from_utf8_lossy(text).into_owned())
}

fn decode_value_array(cur: &mut Cursor<&[u8]>, kind: ValueKind, count: usize) -> Result<Value> {
    Ok(match kind {
        ValueKind::Byte => {
            let mut v = vec![0u8; count];
            cur.read_exact(&mut v)?;
            Value::Byte(v)
        }
        ValueKind::Short => {
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                v.push(cur.read_i16::<BigEndian>()?);
            }
            Value::Short(v)
        }
        ValueKind::Int => {
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                v.push(cur.read_i32::<BigEndian>()?);
            }
            Value::Int(v)
        }
        ValueKind::Float => {
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                v.push(cur.read_f32::<BigEndian>()?);
            }
            Value::Float(v)
        }
        ValueKind::Double => {
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                v.push(cur.read_f64::<BigEndian>()?);
            }
            Value::Double(v)
        }
        ValueKind::String => {
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                v.push(read_fixed_str(cur, MAX_STRING_SIZE)?);
            }
            Value::String(v)
        }
    })
}

/// Validate that an advertised payload size is consistent with the
/// element size/count/metadata prefix it claims to carry, per spec.md
/// §4.1's deserialization validation requirement.
pub fn expected_payload_len(value_kind: ValueKind, meta_kind: MetaKind, count: usize) -> usize {
    let meta_len = match meta_kind {
        MetaKind::Plain => 0,
        MetaKind::Alarm => 4,
        MetaKind::Timestamped => 12,
        MetaKind::Graphic => {
            4 + precision_len(value_kind) + UNITS_SIZE + 6 * value_kind.element_size()
        }
        MetaKind::Control => {
            4 + precision_len(value_kind)
                + UNITS_SIZE
                + 6 * value_kind.element_size()
                + 2 * value_kind.element_size()
        }
        MetaKind::GraphicEnum => 6 + MAX_ENUM_STATES * MAX_STRING_SIZE,
    };
    padded_len(meta_len + count * value_kind.element_size())
}

fn precision_len(kind: ValueKind) -> usize {
    match kind {
        ValueKind::Float | ValueKind::Double => 2,
        _ => 0,
    }
}

/// Validate a just-received frame body against the advertised size before
/// attempting to decode it, returning a descriptive error rather than
/// panicking on a truncated/malformed payload (spec.md §7 "Protocol
/// error").
pub fn validate_payload_size(
    value_kind: ValueKind,
    meta_kind: MetaKind,
    count: usize,
    advertised: usize,
) -> Result<()> {
    let expected = expected_payload_len(value_kind, meta_kind, count);
    if expected != advertised {
        return Err(anyhow!(
            "payload size mismatch: advertised {advertised}, expected {expected} for {count} x {value_kind:?}/{meta_kind:?}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_double_round_trips() {
        let bundle = Bundle {
            meta: Metadata::Plain,
            value: Value::Double(vec![1.5, 2.5, 3.5]),
        };
        let bytes = encode_payload(&bundle).unwrap();
        let decoded = decode_payload(ValueKind::Double, MetaKind::Plain, 3, &bytes).unwrap();
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn timestamped_int_round_trips() {
        let bundle = Bundle {
            meta: Metadata::Timestamped {
                status: AlarmStatus::NO_ALARM,
                severity: AlarmSeverity::NO_ALARM,
                secs: 123,
                nanos: 456,
            },
            value: Value::Int(vec![42]),
        };
        let bytes = encode_payload(&bundle).unwrap();
        let decoded = decode_payload(ValueKind::Int, MetaKind::Timestamped, 1, &bytes).unwrap();
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn graphic_enum_round_trips_with_labels() {
        let labels: Vec<String> = (0..8).map(|i| format!("state{i}")).collect();
        let bundle = Bundle {
            meta: Metadata::GraphicEnum {
                status: AlarmStatus::UDF,
                severity: AlarmSeverity::INVALID,
                labels: labels.clone(),
            },
            value: Value::Short(vec![2]),
        };
        let bytes = encode_payload(&bundle).unwrap();
        let decoded =
            decode_payload(ValueKind::Short, MetaKind::GraphicEnum, 1, &bytes).unwrap();
        assert_eq!(decoded, bundle);
        if let Metadata::GraphicEnum { labels: got, .. } = decoded.meta {
            assert_eq!(got, labels);
        } else {
            panic!("wrong variant");
        }
    }

    #[test]
    fn string_longer_than_field_is_truncated_not_errored() {
        let long = "x".repeat(100);
        let bundle = Bundle {
            meta: Metadata::Plain,
            value: Value::String(vec![long.clone()]),
        };
        let bytes = encode_payload(&bundle).unwrap();
        let decoded = decode_payload(ValueKind::String, MetaKind::Plain, 1, &bytes).unwrap();
        if let Value::String(v) = decoded.value {
            assert_eq!(v[0].len(), MAX_STRING_SIZE - 1);
        } else {
            panic!("wrong variant");
        }
    }

    #[test]
    fn payload_size_validation_rejects_mismatch() {
        assert!(validate_payload_size(ValueKind::Double, MetaKind::Plain, 2, 8).is_err());
        assert!(validate_payload_size(ValueKind::Double, MetaKind::Plain, 1, 8).is_ok());
    }

    #[test]
    fn graphic_float_round_trips_with_precision() {
        let bundle = Bundle {
            meta: Metadata::Graphic {
                status: AlarmStatus::NO_ALARM,
                severity: AlarmSeverity::NO_ALARM,
                units: "mA".to_string(),
                precision: Some(3),
                limits: DisplayLimits {
                    upper_display: ScalarValue::Float(10.0),
                    lower_display: ScalarValue::Float(-10.0),
                    upper_warning: ScalarValue::Float(8.0),
                    lower_warning: ScalarValue::Float(-8.0),
                    upper_alarm: ScalarValue::Float(9.0),
                    lower_alarm: ScalarValue::Float(-9.0),
                },
            },
            value: Value::Float(vec![1.0, 2.0]),
        };
        let bytes = encode_payload(&bundle).unwrap();
        let decoded = decode_payload(ValueKind::Float, MetaKind::Graphic, 2, &bytes).unwrap();
        assert_eq!(decoded, bundle);
    }
}
