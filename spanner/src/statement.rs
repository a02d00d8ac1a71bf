use std::collections::{BTreeMap, HashMap};

use base64::prelude::*;
use prost_types::value::Kind;
use prost_types::value::Kind::StringValue;
use prost_types::{ListValue, Struct, Value};
use time::{Date, OffsetDateTime, UtcOffset};

use crate::apiv1::types::{Field, StructType, Type, TypeCode};
use crate::interval::Interval;
use crate::value::{Base64Bytes, CommitTimestamp, Json, ProtoEnum, ProtoMessage, SpannerNumeric, Value as SpannerValue};

/// A Statement is a SQL query with named parameters.
///
/// A parameter placeholder consists of '@' followed by the parameter name.
/// The parameter name is an identifier which must conform to the naming
/// requirements in <https://cloud.google.com/spanner/docs/lexical#identifiers>.
/// Parameters may appear anywhere that a literal value is expected. The same
/// parameter name may be used more than once.  It is an error to execute a
/// statement with unbound parameters. On the other hand, it is allowable to
/// bind parameter names that are not used.
#[derive(Clone, Debug)]
pub struct Statement {
    pub(crate) sql: String,
    pub(crate) params: BTreeMap<String, Value>,
    pub(crate) param_types: HashMap<String, Type>,
}

impl Statement {
    /// new returns a Statement with the given SQL and an empty Params map.
    pub fn new<T: Into<String>>(sql: T) -> Self {
        Statement {
            sql: sql.into(),
            params: Default::default(),
            param_types: Default::default(),
        }
    }

    /// add_params add the bind parameter.
    /// Implement the ToKind trait to use non-predefined types.
    pub fn add_param<T>(&mut self, name: &str, value: &T)
    where
        T: ToKind,
    {
        self.param_types.insert(name.to_string(), T::get_type());
        self.params.insert(
            name.to_string(),
            Value {
                kind: Some(value.to_kind()),
            },
        );
    }

    /// Binds a dynamically typed value. The type is needed because a NULL or an empty array
    /// does not carry one.
    pub fn add_value(&mut self, name: &str, value: &SpannerValue, r#type: Type) {
        self.param_types.insert(name.to_string(), r#type);
        self.params.insert(name.to_string(), value.encode());
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub(crate) fn params_struct(&self) -> Option<Struct> {
        if self.params.is_empty() {
            None
        } else {
            Some(Struct {
                fields: self.params.clone(),
            })
        }
    }
}

pub fn single_type(code: TypeCode) -> Type {
    Type::new(code)
}

pub trait ToKind {
    fn to_kind(&self) -> Kind;
    fn get_type() -> Type
    where
        Self: Sized;
}

pub type Kinds = Vec<(&'static str, Kind)>;
pub type Types = Vec<(&'static str, Type)>;

pub trait ToStruct {
    fn to_kinds(&self) -> Kinds;
    fn get_types() -> Types
    where
        Self: Sized;
}

impl<T> ToStruct for &T
where
    T: ToStruct,
{
    fn to_kinds(&self) -> Kinds {
        (*self).to_kinds()
    }

    fn get_types() -> Types
    where
        Self: Sized,
    {
        T::get_types()
    }
}

/// Finite floats are sent as numbers, the rest as the strings the server understands.
pub(crate) fn float_to_kind(v: f64) -> Kind {
    if v.is_nan() {
        StringValue("NaN".to_string())
    } else if v == f64::INFINITY {
        StringValue("Infinity".to_string())
    } else if v == f64::NEG_INFINITY {
        StringValue("-Infinity".to_string())
    } else {
        Kind::NumberValue(v)
    }
}

pub(crate) fn format_date(d: &Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

/// RFC 3339 in UTC. The fraction is only written when it is not zero, without trailing zeros.
pub(crate) fn format_timestamp(t: &OffsetDateTime) -> String {
    let t = t.to_offset(UtcOffset::UTC);
    let mut s = format!(
        "{}T{:02}:{:02}:{:02}",
        format_date(&t.date()),
        t.hour(),
        t.minute(),
        t.second()
    );
    let nanos = t.nanosecond();
    if nanos != 0 {
        let fraction = format!("{nanos:09}");
        s.push('.');
        s.push_str(fraction.trim_end_matches('0'));
    }
    s.push('Z');
    s
}

impl ToKind for String {
    fn to_kind(&self) -> Kind {
        StringValue(self.clone())
    }
    fn get_type() -> Type {
        single_type(TypeCode::String)
    }
}

impl ToKind for &str {
    fn to_kind(&self) -> Kind {
        StringValue(self.to_string())
    }
    fn get_type() -> Type {
        single_type(TypeCode::String)
    }
}

impl ToKind for i64 {
    fn to_kind(&self) -> Kind {
        self.to_string().to_kind()
    }
    fn get_type() -> Type {
        single_type(TypeCode::Int64)
    }
}

impl ToKind for f64 {
    fn to_kind(&self) -> Kind {
        float_to_kind(*self)
    }
    fn get_type() -> Type {
        single_type(TypeCode::Float64)
    }
}

impl ToKind for f32 {
    fn to_kind(&self) -> Kind {
        float_to_kind(*self as f64)
    }
    fn get_type() -> Type {
        single_type(TypeCode::Float32)
    }
}

impl ToKind for bool {
    fn to_kind(&self) -> Kind {
        Kind::BoolValue(*self)
    }
    fn get_type() -> Type {
        single_type(TypeCode::Bool)
    }
}

impl ToKind for Date {
    fn to_kind(&self) -> Kind {
        format_date(self).to_kind()
    }
    fn get_type() -> Type {
        single_type(TypeCode::Date)
    }
}

impl ToKind for OffsetDateTime {
    fn to_kind(&self) -> Kind {
        format_timestamp(self).to_kind()
    }
    fn get_type() -> Type {
        single_type(TypeCode::Timestamp)
    }
}

impl ToKind for CommitTimestamp {
    fn to_kind(&self) -> Kind {
        "spanner.commit_timestamp()".to_kind()
    }
    fn get_type() -> Type {
        single_type(TypeCode::Timestamp)
    }
}

impl ToKind for &[u8] {
    fn to_kind(&self) -> Kind {
        BASE64_STANDARD.encode(self).to_kind()
    }
    fn get_type() -> Type {
        single_type(TypeCode::Bytes)
    }
}

impl ToKind for Vec<u8> {
    fn to_kind(&self) -> Kind {
        BASE64_STANDARD.encode(self).to_kind()
    }
    fn get_type() -> Type {
        single_type(TypeCode::Bytes)
    }
}

impl ToKind for Base64Bytes {
    fn to_kind(&self) -> Kind {
        self.as_str().to_kind()
    }
    fn get_type() -> Type {
        single_type(TypeCode::Bytes)
    }
}

impl ToKind for SpannerNumeric {
    fn to_kind(&self) -> Kind {
        self.as_str().to_kind()
    }
    fn get_type() -> Type {
        single_type(TypeCode::Numeric)
    }
}

impl ToKind for Json {
    fn to_kind(&self) -> Kind {
        // serde_json::Map keeps keys sorted and to_string writes no whitespace
        self.0.to_string().to_kind()
    }
    fn get_type() -> Type {
        single_type(TypeCode::Json)
    }
}

impl ToKind for Interval {
    fn to_kind(&self) -> Kind {
        self.to_string().to_kind()
    }
    fn get_type() -> Type {
        single_type(TypeCode::Interval)
    }
}

impl<T> ToKind for ProtoMessage<T>
where
    T: prost::Message + prost::Name,
{
    fn to_kind(&self) -> Kind {
        self.0.encode_to_vec().to_kind()
    }
    fn get_type() -> Type {
        Type {
            code: TypeCode::Proto,
            proto_type_fqn: T::full_name(),
            ..Default::default()
        }
    }
}

impl ToKind for ProtoEnum {
    fn to_kind(&self) -> Kind {
        (self.0 as i64).to_kind()
    }
    fn get_type() -> Type {
        single_type(TypeCode::Enum)
    }
}

/// Structs are sent as lists in field order.
impl<T> ToKind for T
where
    T: ToStruct,
{
    fn to_kind(&self) -> Kind {
        Kind::ListValue(ListValue {
            values: self
                .to_kinds()
                .into_iter()
                .map(|(_, kind)| Value { kind: Some(kind) })
                .collect(),
        })
    }
    fn get_type() -> Type {
        Type {
            code: TypeCode::Struct,
            struct_type: Some(StructType {
                fields: T::get_types()
                    .into_iter()
                    .map(|(name, r#type)| Field::new(name, r#type))
                    .collect(),
            }),
            ..Default::default()
        }
    }
}

impl<T> ToKind for Option<T>
where
    T: ToKind,
{
    fn to_kind(&self) -> Kind {
        match self {
            Some(vv) => vv.to_kind(),
            None => Kind::NullValue(prost_types::NullValue::NullValue.into()),
        }
    }
    fn get_type() -> Type {
        T::get_type()
    }
}

impl<T> ToKind for Vec<T>
where
    T: ToKind,
{
    fn to_kind(&self) -> Kind {
        Kind::ListValue(ListValue {
            values: self.iter().map(|x| Value { kind: Some(x.to_kind()) }).collect(),
        })
    }
    fn get_type() -> Type {
        Type::array(T::get_type())
    }
}
