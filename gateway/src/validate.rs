use crate::model::{DataRequest, RegisterRequest, TelemetrySample};
use serde_json::{Map, Value};
use thiserror::Error;

const MISSING_DEVICE_ID: &str = "device_id must be a non-empty string";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("plaintext is not a JSON object or array")]
    NotJson,

    #[error("{0}")]
    Schema(&'static str),
}

/// Parses a decrypted `/register` body. Only `device_id` is required.
pub fn parse_register(plaintext: &[u8]) -> Result<RegisterRequest, PayloadError> {
    let payload = parse_object(plaintext)?;
    let device_id = required_str(&payload, "device_id", MISSING_DEVICE_ID)?;

    Ok(RegisterRequest { device_id })
}

/// Parses a decrypted `/data` body and coerces its records into samples.
pub fn parse_data(plaintext: &[u8]) -> Result<DataRequest, PayloadError> {
    let payload = parse_object(plaintext)?;
    let device_id = required_str(&payload, "device_id", MISSING_DEVICE_ID)?;
    let nonce = required_str(&payload, "nonce", "nonce must be a non-empty string")?;
    let records = payload
        .get("records")
        .and_then(Value::as_array)
        .ok_or(PayloadError::Schema("records must be an array"))?;

    let mut samples = Vec::with_capacity(records.len());
    let mut skipped = 0;

    for record in records {
        match to_sample(&device_id, record) {
            Some(sample) => samples.push(sample),
            None => skipped += 1,
        }
    }

    Ok(DataRequest {
        device_id,
        nonce,
        samples,
        skipped,
    })
}

/// An array decodes but has no named fields, so it fails as a missing
/// `device_id` rather than as bad JSON.
fn parse_object(plaintext: &[u8]) -> Result<Map<String, Value>, PayloadError> {
    match serde_json::from_slice::<Value>(plaintext) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Array(_)) => Err(PayloadError::Schema(MISSING_DEVICE_ID)),
        _ => Err(PayloadError::NotJson),
    }
}

fn required_str(
    payload: &Map<String, Value>,
    field: &str,
    missing: &'static str,
) -> Result<String, PayloadError> {
    match payload.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(PayloadError::Schema(missing)),
    }
}

/// Builds a sample from one record, or `None` if the record is skipped.
fn to_sample(device_id: &str, record: &Value) -> Option<TelemetrySample> {
    let fields = record.as_object()?;
    let field = |name: &str| fields.get(name).map(coerce_int).unwrap_or(0);

    let ts = field("ts");
    if ts <= 0 {
        return None;
    }

    Some(TelemetrySample {
        device_id: device_id.to_string(),
        ts,
        current_ma: field("current_mA"),
        power_dw: field("power_dW"),
        temp_cc: field("temp_cC"),
    })
}

/// Loose integer coercion for device-reported fields.
pub fn coerce_int(value: &Value) -> i64 {
    match value {
        Value::Null => 0,
        Value::Bool(b) => i64::from(*b),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|_| i64::MAX))
            // `as` truncates toward zero and saturates
            .unwrap_or_else(|| n.as_f64().map(|f| f as i64).unwrap_or(0)),
        Value::String(s) => leading_int(s),
        Value::Array(items) => i64::from(!items.is_empty()),
        Value::Object(map) => i64::from(!map.is_empty()),
    }
}

/// Reads the longest numeric prefix of `s`. A fraction or exponent makes it
/// a float, which is then truncated like any other float.
fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let skip_digits = |from: usize| {
        from + bytes[from..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let sign = usize::from(matches!(bytes.first(), Some(b'-' | b'+')));
    let int_end = skip_digits(sign);
    let mut has_digits = int_end > sign;
    let mut end = int_end;

    if bytes.get(end) == Some(&b'.') {
        let frac_end = skip_digits(end + 1);
        has_digits |= frac_end > end + 1;
        end = frac_end;
    }
    if !has_digits {
        return 0;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'-' | b'+')) {
            exp += 1;
        }
        let exp_end = skip_digits(exp);
        if exp_end > exp {
            end = exp_end;
        }
    }

    if end > int_end {
        return s[..end].parse::<f64>().map(|f| f as i64).unwrap_or(0);
    }

    let negative = bytes[0] == b'-';
    let mut value: i64 = 0;
    for b in &bytes[sign..int_end] {
        let digit = i64::from(b - b'0');
        value = value.saturating_mul(10);
        value = if negative {
            value.saturating_sub(digit)
        } else {
            value.saturating_add(digit)
        };
    }
    value
}
