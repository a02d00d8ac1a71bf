use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

use base64::prelude::*;
use bigdecimal::BigDecimal;
use prost_types::value::Kind;
use time::{Date, OffsetDateTime};
use tonic::Status;

use crate::apiv1::types::transaction_options::read_only::TimestampBound as InternalTimestampBound;
use crate::apiv1::types::transaction_options::ReadOnly;
use crate::apiv1::types::{Field, TypeCode};
use crate::interval::Interval;
use crate::row::{as_ref, kind_to_error, Error, TryFromValue};
use crate::statement::{float_to_kind, ToKind};

const MAX_NUMERIC_INTEGER_DIGITS: usize = 29;
const MAX_NUMERIC_FRACTION_DIGITS: usize = 9;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValueError {
    #[error("invalid numeric: {0}")]
    InvalidNumeric(String),
    #[error("numeric out of range (max 29 integer and 9 fractional digits): {0}")]
    NumericOutOfRange(String),
    #[error("invalid base64: {0}")]
    InvalidBase64(String),
    #[error(transparent)]
    Interval(#[from] crate::interval::Error),
}

impl From<ValueError> for Status {
    fn from(e: ValueError) -> Self {
        match e {
            ValueError::NumericOutOfRange(_) => Status::out_of_range(e.to_string()),
            ValueError::Interval(crate::interval::Error::OutOfRange(_)) => Status::out_of_range(e.to_string()),
            _ => Status::invalid_argument(e.to_string()),
        }
    }
}

/// https://cloud.google.com/spanner/docs/storing-numeric-data#precision_of_numeric_types
/// -99999999999999999999999999999.999999999～99999999999999999999999999999.999999999
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SpannerNumeric(String);

impl Default for SpannerNumeric {
    fn default() -> Self {
        Self("0".to_string())
    }
}

impl SpannerNumeric {
    /// Validates the decimal and keeps it in canonical plain notation.
    pub fn new(value: impl AsRef<str>) -> Result<Self, ValueError> {
        let value = value.as_ref();
        let decimal = BigDecimal::from_str(value).map_err(|_| ValueError::InvalidNumeric(value.to_string()))?;
        Self::from_decimal(&decimal, value)
    }

    fn from_decimal(decimal: &BigDecimal, original: &str) -> Result<Self, ValueError> {
        let (digits, scale) = decimal.normalized().as_bigint_and_exponent();
        let digits = digits.to_string();
        let (negative, digits) = match digits.strip_prefix('-') {
            Some(d) => (true, d.to_string()),
            None => (false, digits),
        };
        let (integer, fraction) = if scale > 0 {
            let scale = scale as usize;
            if digits.len() > scale {
                let split = digits.len() - scale;
                (digits[..split].to_string(), digits[split..].to_string())
            } else {
                ("0".to_string(), format!("{}{}", "0".repeat(scale - digits.len()), digits))
            }
        } else {
            (format!("{}{}", digits, "0".repeat(scale.unsigned_abs() as usize)), String::new())
        };
        if integer.len() > MAX_NUMERIC_INTEGER_DIGITS || fraction.len() > MAX_NUMERIC_FRACTION_DIGITS {
            return Err(ValueError::NumericOutOfRange(original.to_string()));
        }
        let sign = if negative { "-" } else { "" };
        if fraction.is_empty() {
            Ok(Self(format!("{sign}{integer}")))
        } else {
            Ok(Self(format!("{sign}{integer}.{fraction}")))
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn to_decimal(&self) -> BigDecimal {
        BigDecimal::from_str(&self.0).unwrap_or_default()
    }
}

impl TryFrom<BigDecimal> for SpannerNumeric {
    type Error = ValueError;

    fn try_from(value: BigDecimal) -> Result<Self, Self::Error> {
        Self::from_decimal(&value, &value.to_string())
    }
}

/// BYTES supplied already base64 encoded.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Base64Bytes(String);

impl Base64Bytes {
    pub fn new(encoded: impl Into<String>) -> Result<Self, ValueError> {
        let encoded = encoded.into();
        if BASE64_STANDARD.decode(&encoded).is_err() {
            return Err(ValueError::InvalidBase64(encoded));
        }
        Ok(Self(encoded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// JSON column value. Object keys are written in sorted order without whitespace.
/// A SQL NULL JSON is `Option::<Json>::None`; `Json(serde_json::Value::Null)` is the JSON literal `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct Json(pub serde_json::Value);

/// PROTO column holding a message of type `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtoMessage<T>(pub T);

/// ENUM column holding the numeric value of a protobuf enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoEnum(pub i32);

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Timestamp {
    /// Represents seconds of UTC time since Unix epoch
    /// 1970-01-01T00:00:00Z. Must be from 0001-01-01T00:00:00Z to
    /// 9999-12-31T23:59:59Z inclusive.
    pub seconds: i64,
    /// Non-negative fractions of a second at nanosecond resolution. Must be from 0 to 999,999,999
    /// inclusive.
    pub nanos: i32,
}

impl From<Timestamp> for prost_types::Timestamp {
    fn from(t: Timestamp) -> Self {
        prost_types::Timestamp {
            seconds: t.seconds,
            nanos: t.nanos,
        }
    }
}

impl From<prost_types::Timestamp> for Timestamp {
    fn from(t: prost_types::Timestamp) -> Self {
        Timestamp {
            seconds: t.seconds,
            nanos: t.nanos,
        }
    }
}

impl From<OffsetDateTime> for Timestamp {
    fn from(t: OffsetDateTime) -> Self {
        Timestamp {
            seconds: t.unix_timestamp(),
            nanos: t.nanosecond() as i32,
        }
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Debug)]
pub struct CommitTimestamp {
    pub(crate) timestamp: OffsetDateTime,
}

impl CommitTimestamp {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for CommitTimestamp {
    fn default() -> Self {
        CommitTimestamp {
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }
}

impl Deref for CommitTimestamp {
    type Target = OffsetDateTime;

    fn deref(&self) -> &Self::Target {
        &self.timestamp
    }
}

impl From<CommitTimestamp> for OffsetDateTime {
    fn from(s: CommitTimestamp) -> Self {
        s.timestamp
    }
}

pub(crate) fn to_proto_duration(d: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TimestampBound {
    inner: InternalTimestampBound,
}

impl TimestampBound {
    pub fn strong_read() -> Self {
        TimestampBound {
            inner: InternalTimestampBound::Strong(true),
        }
    }
    pub fn exact_staleness(d: Duration) -> Self {
        TimestampBound {
            inner: InternalTimestampBound::ExactStaleness(to_proto_duration(d)),
        }
    }
    pub fn max_staleness(d: Duration) -> Self {
        TimestampBound {
            inner: InternalTimestampBound::MaxStaleness(to_proto_duration(d)),
        }
    }
    pub fn min_read_timestamp(t: Timestamp) -> Self {
        TimestampBound {
            inner: InternalTimestampBound::MinReadTimestamp(t.into()),
        }
    }
    pub fn read_timestamp(t: Timestamp) -> Self {
        TimestampBound {
            inner: InternalTimestampBound::ReadTimestamp(t.into()),
        }
    }

    /// Bounded staleness can only be used in single-use transactions.
    pub(crate) fn is_bounded_staleness(&self) -> bool {
        matches!(
            self.inner,
            InternalTimestampBound::MaxStaleness(_) | InternalTimestampBound::MinReadTimestamp(_)
        )
    }
}

impl From<TimestampBound> for ReadOnly {
    fn from(tb: TimestampBound) -> Self {
        ReadOnly {
            return_read_timestamp: true,
            timestamp_bound: Some(tb.inner),
        }
    }
}

/// A column value decoded according to its column type.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Numeric(SpannerNumeric),
    String(String),
    Bytes(Vec<u8>),
    Date(Date),
    Timestamp(OffsetDateTime),
    Json(serde_json::Value),
    Interval(Interval),
    Proto(Vec<u8>),
    Enum(i64),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Encodes the value in the wire representation of its type.
    pub fn encode(&self) -> prost_types::Value {
        prost_types::Value {
            kind: Some(self.to_wire_kind()),
        }
    }

    fn to_wire_kind(&self) -> Kind {
        match self {
            Value::Null => Kind::NullValue(prost_types::NullValue::NullValue.into()),
            Value::Bool(v) => v.to_kind(),
            Value::Int64(v) => v.to_kind(),
            Value::Float32(v) => float_to_kind(*v as f64),
            Value::Float64(v) => float_to_kind(*v),
            Value::Numeric(v) => v.to_kind(),
            Value::String(v) => v.to_kind(),
            Value::Bytes(v) => v.to_kind(),
            Value::Date(v) => v.to_kind(),
            Value::Timestamp(v) => v.to_kind(),
            Value::Json(v) => Json(v.clone()).to_kind(),
            Value::Interval(v) => v.to_kind(),
            Value::Proto(v) => v.to_kind(),
            Value::Enum(v) => v.to_kind(),
            Value::Array(values) => Kind::ListValue(prost_types::ListValue {
                values: values.iter().map(Value::encode).collect(),
            }),
            Value::Struct(fields) => Kind::ListValue(prost_types::ListValue {
                values: fields.iter().map(|(_, v)| v.encode()).collect(),
            }),
        }
    }

    /// Decodes a wire value using the column type carried by `field`.
    pub fn decode(item: &prost_types::Value, field: &Field) -> Result<Value, Error> {
        if let Kind::NullValue(_) = as_ref(item, field)? {
            return Ok(Value::Null);
        }
        let value = match field.r#type.code {
            TypeCode::Bool => Value::Bool(<bool as TryFromValue>::try_from(item, field)?),
            TypeCode::Int64 => Value::Int64(<i64 as TryFromValue>::try_from(item, field)?),
            TypeCode::Float32 => Value::Float32(<f32 as TryFromValue>::try_from(item, field)?),
            TypeCode::Float64 => Value::Float64(<f64 as TryFromValue>::try_from(item, field)?),
            TypeCode::Numeric => Value::Numeric(<SpannerNumeric as TryFromValue>::try_from(item, field)?),
            TypeCode::String => Value::String(<String as TryFromValue>::try_from(item, field)?),
            TypeCode::Bytes => Value::Bytes(<Vec<u8> as TryFromValue>::try_from(item, field)?),
            TypeCode::Date => Value::Date(<Date as TryFromValue>::try_from(item, field)?),
            TypeCode::Timestamp => Value::Timestamp(<OffsetDateTime as TryFromValue>::try_from(item, field)?),
            TypeCode::Json => Value::Json(<Json as TryFromValue>::try_from(item, field)?.0),
            TypeCode::Interval => Value::Interval(<Interval as TryFromValue>::try_from(item, field)?),
            TypeCode::Proto => Value::Proto(<Vec<u8> as TryFromValue>::try_from(item, field)?),
            TypeCode::Enum => Value::Enum(<i64 as TryFromValue>::try_from(item, field)?),
            TypeCode::Array => {
                let element = field
                    .r#type
                    .array_element_type
                    .as_deref()
                    .ok_or_else(|| Error::StructParseError(field.name.to_string(), "array element type is missing"))?;
                let element_field = Field::new(field.name.clone(), element.clone());
                match as_ref(item, field)? {
                    Kind::ListValue(list) => Value::Array(
                        list.values
                            .iter()
                            .map(|v| Value::decode(v, &element_field))
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    v => return kind_to_error(v, field),
                }
            }
            TypeCode::Struct => {
                let struct_type = field
                    .r#type
                    .struct_type
                    .as_ref()
                    .ok_or_else(|| Error::StructParseError(field.name.to_string(), "struct type is missing"))?;
                match as_ref(item, field)? {
                    Kind::ListValue(list) => {
                        if list.values.len() != struct_type.fields.len() {
                            return Err(Error::StructParseError(field.name.to_string(), "field count mismatch"));
                        }
                        Value::Struct(
                            struct_type
                                .fields
                                .iter()
                                .zip(list.values.iter())
                                .map(|(f, v)| Ok((f.name.clone(), Value::decode(v, f)?)))
                                .collect::<Result<Vec<_>, Error>>()?,
                        )
                    }
                    v => return kind_to_error(v, field),
                }
            }
            TypeCode::Unspecified => return Err(Error::UnsupportedType(field.name.to_string())),
        };
        Ok(value)
    }
}

impl TryFromValue for Value {
    fn try_from(item: &prost_types::Value, field: &Field) -> Result<Self, Error> {
        Value::decode(item, field)
    }
}
