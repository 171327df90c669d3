// Retry-hint parsing and geometric backoff.
use serde_json::Value;
use std::time::Duration;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Server-suggested delay before retrying an aborted transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryHint {
    #[default]
    None,
    Seconds(u32),
    SecondsAndNanos(u32, u32),
}

impl RetryHint {
    /// Parse a hint out of error metadata.
    ///
    /// Accepts `{"retryDelay": {"seconds": N, "nanos": M}}` (numbers or numeric
    /// strings, either field optional) and `{"retryDelay": "12.5s"}`. Anything
    /// negative or malformed yields `RetryHint::None`.
    ///
    /// ```
    /// use courier_txn::RetryHint;
    /// use serde_json::json;
    /// use std::time::Duration;
    ///
    /// let hint = RetryHint::from_metadata(&json!({"retryDelay": {"seconds": 123, "nanos": 456000000}}));
    /// assert_eq!(hint, RetryHint::SecondsAndNanos(123, 456_000_000));
    /// assert_eq!(hint.delay(), Some(Duration::from_millis(123_456)));
    /// ```
    pub fn from_metadata(metadata: &Value) -> Self {
        let Some(delay) = metadata
            .get("retryDelay")
            .or_else(|| metadata.get("retry_delay"))
        else {
            return Self::None;
        };
        match delay {
            Value::Object(fields) => {
                let seconds = match fields.get("seconds") {
                    None => Some(0),
                    Some(value) => component(value),
                };
                let nanos = match fields.get("nanos") {
                    None => Some(0),
                    Some(value) => component(value),
                };
                if fields.get("seconds").is_none() && fields.get("nanos").is_none() {
                    return Self::None;
                }
                match (seconds, nanos) {
                    (Some(seconds), Some(nanos)) => Self::from_parts(seconds, nanos),
                    _ => Self::None,
                }
            }
            Value::String(text) => parse_duration_string(text).unwrap_or(Self::None),
            _ => Self::None,
        }
    }

    fn from_parts(seconds: u64, nanos: u64) -> Self {
        let (Ok(seconds), Ok(nanos)) = (u32::try_from(seconds), u32::try_from(nanos)) else {
            return Self::None;
        };
        if nanos >= NANOS_PER_SEC {
            return Self::None;
        }
        if nanos == 0 {
            Self::Seconds(seconds)
        } else {
            Self::SecondsAndNanos(seconds, nanos)
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        match *self {
            Self::None => None,
            Self::Seconds(seconds) => Some(Duration::from_secs(u64::from(seconds))),
            Self::SecondsAndNanos(seconds, nanos) => {
                Some(Duration::new(u64::from(seconds), nanos))
            }
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

fn component(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

// Protobuf JSON duration: "<seconds>[.<fraction>]s".
fn parse_duration_string(text: &str) -> Option<RetryHint> {
    let body = text.trim().strip_suffix('s')?;
    let (whole, fraction) = match body.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (body, ""),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seconds = whole.parse::<u64>().ok()?;
    let nanos = if fraction.is_empty() {
        0
    } else {
        format!("{fraction:0<9}").parse::<u64>().ok()?
    };
    Some(RetryHint::from_parts(seconds, nanos))
}

/// Delay after the `retry`-th consecutive abort (0-based) with no hint:
/// `base * multiplier^retry`, rounded to the nearest nanosecond.
///
/// ```
/// use courier_txn::backoff_delay;
/// use std::time::Duration;
///
/// let base = Duration::from_millis(1300);
/// assert_eq!(backoff_delay(base, 1.3, 0), Duration::from_millis(1300));
/// assert_eq!(backoff_delay(base, 1.3, 1), Duration::from_millis(1690));
/// ```
pub fn backoff_delay(base: Duration, multiplier: f64, retry: u32) -> Duration {
    let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
    let nanos = (base.as_secs_f64() * multiplier.powi(exponent) * 1e9).round();
    if nanos.is_finite() && nanos >= 0.0 && nanos < u64::MAX as f64 {
        Duration::from_nanos(nanos as u64)
    } else {
        Duration::MAX
    }
}
