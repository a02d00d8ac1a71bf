use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::prelude::*;
use prost_types::value::Kind;
use prost_types::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::apiv1::types::{Field, StructType};
use crate::interval::Interval;
use crate::value::{CommitTimestamp, Json, ProtoEnum, ProtoMessage, SpannerNumeric};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("kind mismatch: field={0}, kind={1}")]
    KindMismatch(String, String),
    #[error("no kind: field={0}")]
    NoKind(String),
    #[error("failed to parse field={field} as {type_name}: {source}")]
    Parse {
        field: String,
        type_name: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("invalid struct: field={0}, {1}")]
    StructParseError(String, &'static str),
    #[error("unsupported column type: field={0}")]
    UnsupportedType(String),
    #[error("no column found: name={0}")]
    NoColumnFound(String),
    #[error("invalid column index: index={0}, length={1}")]
    InvalidColumnIndex(usize, usize),
}

/// One row of a result set. The column metadata is shared by every row of the set.
#[derive(Clone, Debug)]
pub struct Row {
    index: Arc<HashMap<String, usize>>,
    fields: Arc<Vec<Field>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(index: Arc<HashMap<String, usize>>, fields: Arc<Vec<Field>>, values: Vec<Value>) -> Row {
        Row { index, fields, values }
    }

    /// Decodes the column at `column_index`.
    pub fn column<T: TryFromValue>(&self, column_index: usize) -> Result<T, Error> {
        decode_at(&self.values, &self.fields, column_index)
    }

    /// Decodes the column named `column_name`. With duplicated names the last one wins.
    pub fn column_by_name<T: TryFromValue>(&self, column_name: &str) -> Result<T, Error> {
        self.column(position(&self.index, column_name)?)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Raw wire values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

// TryFrom is not used because of the blanket impl conflict
// https://github.com/rust-lang/rust/issues/50133
pub trait TryFromValue: Sized {
    fn try_from(value: &Value, field: &Field) -> Result<Self, Error>;
}

/// Decodes a STRUCT value, usually an element of `ARRAY(SELECT AS STRUCT ...)`.
pub trait TryFromStruct: Sized {
    fn try_from_struct(s: Struct<'_>) -> Result<Self, Error>;
}

enum Members<'a> {
    /// The wire form of a struct: values in field order.
    Positional(&'a [Value]),
    Named(&'a BTreeMap<String, Value>),
}

pub struct Struct<'a> {
    index: HashMap<&'a str, usize>,
    metadata: &'a StructType,
    members: Members<'a>,
}

impl<'a> Struct<'a> {
    pub fn new(metadata: &'a StructType, item: &'a Value, field: &'a Field) -> Result<Struct<'a>, Error> {
        let members = match kind_of(item, field)? {
            Kind::ListValue(list) => Members::Positional(&list.values),
            Kind::StructValue(s) => Members::Named(&s.fields),
            other => return kind_to_error(other, field),
        };
        let index = metadata
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.as_str(), i))
            .collect();
        Ok(Struct {
            index,
            metadata,
            members,
        })
    }

    pub fn column<T: TryFromValue>(&self, column_index: usize) -> Result<T, Error> {
        let fields = &self.metadata.fields;
        match self.members {
            Members::Positional(values) => decode_at(values, fields, column_index),
            Members::Named(values) => {
                let field = fields
                    .get(column_index)
                    .ok_or(Error::InvalidColumnIndex(column_index, fields.len()))?;
                let value = values
                    .get(&field.name)
                    .ok_or_else(|| Error::NoColumnFound(field.name.to_string()))?;
                T::try_from(value, field)
            }
        }
    }

    pub fn column_by_name<T: TryFromValue>(&self, column_name: &str) -> Result<T, Error> {
        let column_index = self
            .index
            .get(column_name)
            .copied()
            .ok_or_else(|| Error::NoColumnFound(column_name.to_string()))?;
        self.column(column_index)
    }
}

/// The string payload of a value. Most scalar types travel as strings.
fn string_of<'a>(item: &'a Value, field: &Field) -> Result<&'a str, Error> {
    match kind_of(item, field)? {
        Kind::StringValue(s) => Ok(s),
        other => kind_to_error(other, field),
    }
}

fn parse_error(field: &Field, type_name: &'static str, source: impl Into<BoxError>) -> Error {
    Error::Parse {
        field: field.name.to_string(),
        type_name,
        source: source.into(),
    }
}

impl TryFromValue for i64 {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        string_of(item, field)?
            .parse()
            .map_err(|e| parse_error(field, "INT64", e))
    }
}

impl TryFromValue for f64 {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        match kind_of(item, field)? {
            Kind::NumberValue(n) => Ok(*n),
            // non-finite numbers are sent as strings
            Kind::StringValue(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(parse_error(field, "FLOAT64", format!("unexpected string {other}"))),
            },
            other => kind_to_error(other, field),
        }
    }
}

impl TryFromValue for f32 {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        <f64 as TryFromValue>::try_from(item, field).map(|v| v as f32)
    }
}

impl TryFromValue for bool {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        match kind_of(item, field)? {
            Kind::BoolValue(b) => Ok(*b),
            other => kind_to_error(other, field),
        }
    }
}

impl TryFromValue for OffsetDateTime {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        OffsetDateTime::parse(string_of(item, field)?, &Rfc3339).map_err(|e| parse_error(field, "TIMESTAMP", e))
    }
}

impl TryFromValue for CommitTimestamp {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        <OffsetDateTime as TryFromValue>::try_from(item, field).map(|timestamp| CommitTimestamp { timestamp })
    }
}

impl TryFromValue for Date {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        Date::parse(string_of(item, field)?, format_description!("[year]-[month]-[day]"))
            .map_err(|e| parse_error(field, "DATE", e))
    }
}

impl TryFromValue for Vec<u8> {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        BASE64_STANDARD
            .decode(string_of(item, field)?)
            .map_err(|e| parse_error(field, "BYTES", e))
    }
}

impl TryFromValue for SpannerNumeric {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        SpannerNumeric::new(string_of(item, field)?).map_err(|e| parse_error(field, "NUMERIC", e))
    }
}

impl TryFromValue for String {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        string_of(item, field).map(str::to_string)
    }
}

impl TryFromValue for Json {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        serde_json::from_str(string_of(item, field)?)
            .map(Json)
            .map_err(|e| parse_error(field, "JSON", e))
    }
}

impl TryFromValue for Interval {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        string_of(item, field)?
            .parse()
            .map_err(|e| parse_error(field, "INTERVAL", e))
    }
}

impl<T> TryFromValue for ProtoMessage<T>
where
    T: prost::Message + Default,
{
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        let bytes = <Vec<u8> as TryFromValue>::try_from(item, field)?;
        T::decode(bytes.as_slice())
            .map(ProtoMessage)
            .map_err(|e| parse_error(field, "PROTO", e))
    }
}

impl TryFromValue for ProtoEnum {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        string_of(item, field)?
            .parse()
            .map(ProtoEnum)
            .map_err(|e| parse_error(field, "ENUM", e))
    }
}

impl<T: TryFromStruct> TryFromValue for T {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        let struct_type = field
            .r#type
            .struct_type
            .as_ref()
            .ok_or_else(|| Error::StructParseError(field.name.to_string(), "struct type is missing"))?;
        T::try_from_struct(Struct::new(struct_type, item, field)?)
    }
}

impl<T: TryFromValue> TryFromValue for Option<T> {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        match kind_of(item, field)? {
            Kind::NullValue(_) => Ok(None),
            _ => T::try_from(item, field).map(Some),
        }
    }
}

impl<T: TryFromValue> TryFromValue for Vec<T> {
    fn try_from(item: &Value, field: &Field) -> Result<Self, Error> {
        let list = match kind_of(item, field)? {
            Kind::ListValue(list) => list,
            other => return kind_to_error(other, field),
        };
        // elements are decoded against the element type under the column name
        let element_type = match field.r#type.array_element_type.as_deref() {
            Some(t) => t.clone(),
            None => field.r#type.clone(),
        };
        let element = Field::new(field.name.clone(), element_type);
        list.values.iter().map(|v| T::try_from(v, &element)).collect()
    }
}

fn position(index: &HashMap<String, usize>, column_name: &str) -> Result<usize, Error> {
    index
        .get(column_name)
        .copied()
        .ok_or_else(|| Error::NoColumnFound(column_name.to_string()))
}

fn decode_at<T: TryFromValue>(values: &[Value], fields: &[Field], column_index: usize) -> Result<T, Error> {
    match (values.get(column_index), fields.get(column_index)) {
        (Some(value), Some(field)) => T::try_from(value, field),
        _ => Err(Error::InvalidColumnIndex(column_index, values.len())),
    }
}

/// The kind of a value. A value without kind is malformed.
pub fn as_ref<'a>(item: &'a Value, field: &Field) -> Result<&'a Kind, Error> {
    kind_of(item, field)
}

fn kind_of<'a>(item: &'a Value, field: &Field) -> Result<&'a Kind, Error> {
    item.kind.as_ref().ok_or_else(|| Error::NoKind(field.name.to_string()))
}

pub fn kind_to_error<T>(v: &Kind, field: &Field) -> Result<T, Error> {
    let actual = match v {
        Kind::NullValue(_) => "NullValue",
        Kind::NumberValue(_) => "NumberValue",
        Kind::StringValue(_) => "StringValue",
        Kind::BoolValue(_) => "BoolValue",
        Kind::StructValue(_) => "StructValue",
        Kind::ListValue(_) => "ListValue",
    };
    Err(Error::KindMismatch(field.name.to_string(), actual.to_string()))
}
