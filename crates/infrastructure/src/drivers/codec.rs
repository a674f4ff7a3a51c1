//! Register-level encoding and decoding of data-point values.
//!
//! Floats are IEEE 754 single-precision big-endian across two consecutive
//! registers; multi-register integers and timestamps are big-endian word
//! order as well.

use serde_json::{Value, json};

use domain::point::{DataPoint, ValueKind};
use domain::{GatewayError, Result};

fn invalid_width(point: &DataPoint, got: usize) -> GatewayError {
    GatewayError::Device(format!(
        "data point {} ({:?}) cannot be decoded from {got} register(s)",
        point.id, point.kind
    ))
}

fn apply_decimals(point: &DataPoint, value: f64) -> f64 {
    match point.decimals {
        Some(decimals) if decimals > 0 => {
            let factor = 10f64.powi(decimals as i32);
            (value * factor).round() / factor
        }
        _ => value,
    }
}

/// Decode register words into a JSON value per the point's declared kind.
pub fn decode_value(point: &DataPoint, words: &[u16]) -> Result<Value> {
    match point.kind {
        ValueKind::Integer => {
            let raw = match words {
                [single] => *single as u64,
                [high, low] => ((*high as u64) << 16) | *low as u64,
                _ => return Err(invalid_width(point, words.len())),
            };
            match point.decimals {
                Some(decimals) if decimals > 0 => {
                    let divisor = 10f64.powi(decimals as i32);
                    Ok(json!(raw as f64 / divisor))
                }
                _ => Ok(json!(raw)),
            }
        }
        ValueKind::Float => {
            let &[high, low] = words else {
                return Err(invalid_width(point, words.len()));
            };
            let bits = ((high as u32) << 16) | low as u32;
            let value = f32::from_bits(bits) as f64;
            Ok(json!(apply_decimals(point, value)))
        }
        ValueKind::Boolean => {
            let &[word] = words else {
                return Err(invalid_width(point, words.len()));
            };
            Ok(Value::Bool(word != 0))
        }
        ValueKind::Enum => {
            let &[word] = words else {
                return Err(invalid_width(point, words.len()));
            };
            if let Some(labels) = &point.enum_values {
                if let Some(label) = labels.get(&word) {
                    return Ok(Value::String(label.clone()));
                }
            }
            Ok(json!(word))
        }
        ValueKind::String => {
            let mut bytes = Vec::with_capacity(words.len() * 2);
            for word in words {
                bytes.push((word >> 8) as u8);
                bytes.push((word & 0xff) as u8);
            }
            let text = String::from_utf8_lossy(&bytes);
            Ok(Value::String(text.trim_end_matches(['\0', ' ']).to_string()))
        }
        ValueKind::Timestamp => {
            let &[high, low] = words else {
                return Err(invalid_width(point, words.len()));
            };
            let seconds = ((high as u64) << 16) | low as u64;
            // milliseconds since epoch, matching the MQTT payload convention
            Ok(json!(seconds * 1000))
        }
    }
}

fn cannot_encode(point: &DataPoint, value: &Value) -> GatewayError {
    GatewayError::Device(format!(
        "cannot encode {value} for data point {} ({:?})",
        point.id, point.kind
    ))
}

/// Encode a JSON value into `count` register words for a write.
pub fn encode_value(point: &DataPoint, value: &Value, count: u16) -> Result<Vec<u16>> {
    match point.kind {
        ValueKind::Integer => {
            let raw = match point.decimals {
                Some(decimals) if decimals > 0 => {
                    let number = value.as_f64().ok_or_else(|| cannot_encode(point, value))?;
                    (number * 10f64.powi(decimals as i32)).round() as u64
                }
                _ => value.as_u64().ok_or_else(|| cannot_encode(point, value))?,
            };
            match count {
                1 if raw <= u16::MAX as u64 => Ok(vec![raw as u16]),
                2 if raw <= u32::MAX as u64 => {
                    Ok(vec![(raw >> 16) as u16, (raw & 0xffff) as u16])
                }
                _ => Err(cannot_encode(point, value)),
            }
        }
        ValueKind::Float => {
            if count != 2 {
                return Err(cannot_encode(point, value));
            }
            let number = value.as_f64().ok_or_else(|| cannot_encode(point, value))?;
            let bits = (number as f32).to_bits();
            Ok(vec![(bits >> 16) as u16, (bits & 0xffff) as u16])
        }
        ValueKind::Boolean => {
            let flag = value.as_bool().ok_or_else(|| cannot_encode(point, value))?;
            Ok(vec![u16::from(flag)])
        }
        ValueKind::Enum => {
            if let Some(label) = value.as_str() {
                let labels = point
                    .enum_values
                    .as_ref()
                    .ok_or_else(|| cannot_encode(point, value))?;
                let word = labels
                    .iter()
                    .find(|(_, candidate)| candidate.as_str() == label)
                    .map(|(word, _)| *word)
                    .ok_or_else(|| cannot_encode(point, value))?;
                Ok(vec![word])
            } else {
                let raw = value.as_u64().ok_or_else(|| cannot_encode(point, value))?;
                if raw > u16::MAX as u64 {
                    return Err(cannot_encode(point, value));
                }
                Ok(vec![raw as u16])
            }
        }
        ValueKind::String => {
            let text = value.as_str().ok_or_else(|| cannot_encode(point, value))?;
            let mut bytes = text.as_bytes().to_vec();
            if bytes.len() > count as usize * 2 {
                return Err(cannot_encode(point, value));
            }
            bytes.resize(count as usize * 2, 0);
            Ok(bytes
                .chunks(2)
                .map(|pair| ((pair[0] as u16) << 8) | pair[1] as u16)
                .collect())
        }
        ValueKind::Timestamp => {
            if count != 2 {
                return Err(cannot_encode(point, value));
            }
            let millis = value.as_u64().ok_or_else(|| cannot_encode(point, value))?;
            let seconds = millis / 1000;
            if seconds > u32::MAX as u64 {
                return Err(cannot_encode(point, value));
            }
            Ok(vec![(seconds >> 16) as u16, (seconds & 0xffff) as u16])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::point::Access;
    use std::collections::BTreeMap;

    fn point(kind: ValueKind) -> DataPoint {
        DataPoint::readable("p", kind).with_access(Access::ReadWrite)
    }

    #[test]
    fn test_decode_single_register_integer() {
        assert_eq!(decode_value(&point(ValueKind::Integer), &[1234]).unwrap(), json!(1234));
    }

    #[test]
    fn test_decode_double_register_integer_big_endian() {
        assert_eq!(
            decode_value(&point(ValueKind::Integer), &[0x0001, 0x0000]).unwrap(),
            json!(65536)
        );
    }

    #[test]
    fn test_decode_integer_with_decimals() {
        let mut p = point(ValueKind::Integer);
        p.decimals = Some(1);
        assert_eq!(decode_value(&p, &[235]).unwrap(), json!(23.5));
    }

    #[test]
    fn test_decode_float_ieee754_big_endian() {
        // 230.5f32 = 0x43668000
        let value = decode_value(&point(ValueKind::Float), &[0x4366, 0x8000]).unwrap();
        assert_eq!(value.as_f64().unwrap(), 230.5);
    }

    #[test]
    fn test_float_round_trip() {
        let p = point(ValueKind::Float);
        let words = encode_value(&p, &json!(12.25), 2).unwrap();
        assert_eq!(decode_value(&p, &words).unwrap().as_f64().unwrap(), 12.25);
    }

    #[test]
    fn test_decode_boolean() {
        assert_eq!(decode_value(&point(ValueKind::Boolean), &[0]).unwrap(), json!(false));
        assert_eq!(decode_value(&point(ValueKind::Boolean), &[7]).unwrap(), json!(true));
    }

    #[test]
    fn test_decode_enum_label() {
        let mut p = point(ValueKind::Enum);
        let mut labels = BTreeMap::new();
        labels.insert(0u16, "off".to_string());
        labels.insert(1u16, "on".to_string());
        p.enum_values = Some(labels);
        assert_eq!(decode_value(&p, &[1]).unwrap(), json!("on"));
        // unmapped raw values fall back to the number
        assert_eq!(decode_value(&p, &[9]).unwrap(), json!(9));
    }

    #[test]
    fn test_encode_enum_by_label() {
        let mut p = point(ValueKind::Enum);
        let mut labels = BTreeMap::new();
        labels.insert(2u16, "auto".to_string());
        p.enum_values = Some(labels);
        assert_eq!(encode_value(&p, &json!("auto"), 1).unwrap(), vec![2]);
        assert!(encode_value(&p, &json!("unknown"), 1).is_err());
    }

    #[test]
    fn test_decode_string_trims_padding() {
        // "AB-9" followed by NUL padding
        let value = decode_value(&point(ValueKind::String), &[0x4142, 0x2d39, 0x0000]).unwrap();
        assert_eq!(value, json!("AB-9"));
    }

    #[test]
    fn test_decode_timestamp_to_millis() {
        let value = decode_value(&point(ValueKind::Timestamp), &[0x0001, 0x0000]).unwrap();
        assert_eq!(value, json!(65536u64 * 1000));
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        assert!(decode_value(&point(ValueKind::Float), &[1]).is_err());
        assert!(decode_value(&point(ValueKind::Integer), &[1, 2, 3]).is_err());
        assert!(decode_value(&point(ValueKind::Boolean), &[]).is_err());
    }

    #[test]
    fn test_encode_integer_range_checks() {
        let p = point(ValueKind::Integer);
        assert_eq!(encode_value(&p, &json!(70000), 2).unwrap(), vec![1, 4464]);
        assert!(encode_value(&p, &json!(70000), 1).is_err());
        assert!(encode_value(&p, &json!(-1), 1).is_err());
    }
}
