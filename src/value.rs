use serde::Serialize;

/// A decoded value: every series is pinned to one of the two arms by its
/// first write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Double(f64),
    Text(String),
}

impl Value {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Double(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Text(_) => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// An incoming measurement handed to the appender. Numeric observations
/// carry the number of fractional digits seen in the source literal, which
/// only influences the display-hint format chosen when the series is first
/// defined.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Numeric { value: f64, decimals: u32 },
    Text(String),
}

impl Observation {
    pub fn numeric(value: f64) -> Self {
        Observation::Numeric { value, decimals: 0 }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Observation::Text(value.into())
    }
}

/// Strict decimal-literal float parsing: an optional sign, digits with an
/// optional fraction, and an optional exponent. Rejects the looser forms
/// `f64::from_str` accepts (inf, nan, missing digits).
pub fn parse_strict_float(text: &str) -> Option<f64> {
    let text = text.trim();
    let unsigned = text.strip_prefix(['-', '+']).unwrap_or(text);
    let (mantissa, exponent) = match unsigned.split_once(['e', 'E']) {
        Some((mantissa, exponent)) => (mantissa, Some(exponent)),
        None => (unsigned, None),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (mantissa, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let mantissa_ok = match frac_part {
        Some(frac) => digits(int_part) && (frac.is_empty() || digits(frac)) || int_part.is_empty() && digits(frac),
        None => digits(int_part),
    };
    if !mantissa_ok {
        return None;
    }
    if let Some(exponent) = exponent {
        let exponent = exponent.strip_prefix(['-', '+']).unwrap_or(exponent);
        if !digits(exponent) {
            return None;
        }
    }
    text.parse().ok()
}

/// Fractional digits of a numeric literal's mantissa: `"1.50"` has two,
/// `"3e2"` has none.
pub fn decimal_places_from_literal(text: &str) -> u32 {
    let value = text.trim();
    let mantissa = match value.split_once(['e', 'E']) {
        Some((mantissa, _)) => mantissa,
        None => value,
    };
    match mantissa.split_once('.') {
        Some((_, frac)) => frac.len() as u32,
        None => 0,
    }
}

/// Classify free-form text into an observation: strict numeric literals
/// become numeric values carrying their decimal-places hint, everything else
/// stays text.
pub fn observation_from_text(text: &str) -> Observation {
    match parse_strict_float(text) {
        Some(value) => Observation::Numeric {
            value,
            decimals: decimal_places_from_literal(text),
        },
        None => Observation::Text(text.to_string()),
    }
}

/// One event of a single series.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp_ms: u64,
    pub value: Value,
}

impl Event {
    pub fn new(timestamp_ms: u64, value: Value) -> Self {
        Event {
            timestamp_ms,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_floats_accept_decimal_literals_only() {
        assert_eq!(parse_strict_float("1.5"), Some(1.5));
        assert_eq!(parse_strict_float(" -3 "), Some(-3.0));
        assert_eq!(parse_strict_float("+.5"), Some(0.5));
        assert_eq!(parse_strict_float("2."), Some(2.0));
        assert_eq!(parse_strict_float("1e3"), Some(1000.0));
        assert_eq!(parse_strict_float("2.5E-2"), Some(0.025));
        assert_eq!(parse_strict_float("inf"), None);
        assert_eq!(parse_strict_float("nan"), None);
        assert_eq!(parse_strict_float(""), None);
        assert_eq!(parse_strict_float("."), None);
        assert_eq!(parse_strict_float("1e"), None);
        assert_eq!(parse_strict_float("0x10"), None);
        assert_eq!(parse_strict_float("on"), None);
    }

    #[test]
    fn decimal_places_count_the_mantissa_fraction() {
        assert_eq!(decimal_places_from_literal("95.000"), 3);
        assert_eq!(decimal_places_from_literal("0"), 0);
        assert_eq!(decimal_places_from_literal("1.5e3"), 1);
        assert_eq!(decimal_places_from_literal("3e2"), 0);
    }

    #[test]
    fn text_classification_keeps_non_numerics_as_text() {
        assert_eq!(
            observation_from_text("236.4"),
            Observation::Numeric {
                value: 236.4,
                decimals: 1
            }
        );
        assert_eq!(
            observation_from_text("HM600_BalkonUnten"),
            Observation::Text("HM600_BalkonUnten".into())
        );
    }
}
