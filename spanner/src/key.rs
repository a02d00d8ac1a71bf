use prost_types::{ListValue, Value};

use crate::apiv1::types::key_range::{EndKeyType, StartKeyType};
use crate::apiv1::types::KeyRange as InternalKeyRange;
use crate::apiv1::types::KeySet as InternalKeySet;
use crate::statement::ToKind;

/// A Key can be either a Cloud Spanner row's primary key or a secondary index
/// key. The values of a Key must be in the same order as the key columns.
#[derive(Clone, Debug)]
pub struct Key {
    pub(crate) values: ListValue,
}

/// A KeySet defines a collection of Cloud Spanner keys and/or key ranges. All
/// the keys are expected to be in the same table or index. The keys need not be
/// sorted in any particular way.
#[derive(Clone, Debug)]
pub struct KeySet {
    pub(crate) inner: InternalKeySet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeKind {
    /// ClosedOpen is closed on the left and open on the right: the Start
    /// key is included, the End key is excluded.
    ClosedOpen,
    /// ClosedClosed is closed on the left and the right: both keys are included.
    ClosedClosed,
    /// OpenClosed is open on the left and closed on the right: the Start
    /// key is excluded, the End key is included.
    OpenClosed,
    /// OpenOpen is open on the left and the right: neither key is included.
    OpenOpen,
}

#[derive(Clone, Debug)]
pub struct KeyRange {
    start: Key,
    end: Key,
    pub kind: RangeKind,
}

pub fn all_keys() -> KeySet {
    KeySet {
        inner: InternalKeySet {
            keys: vec![],
            ranges: vec![],
            all: true,
        },
    }
}

impl KeyRange {
    pub fn new(start: Key, end: Key, kind: RangeKind) -> KeyRange {
        KeyRange { start, end, kind }
    }
}

impl From<KeyRange> for InternalKeyRange {
    fn from(key_range: KeyRange) -> Self {
        let (start, end) = match key_range.kind {
            RangeKind::ClosedClosed => (
                StartKeyType::StartClosed(key_range.start.values),
                EndKeyType::EndClosed(key_range.end.values),
            ),
            RangeKind::ClosedOpen => (
                StartKeyType::StartClosed(key_range.start.values),
                EndKeyType::EndOpen(key_range.end.values),
            ),
            RangeKind::OpenClosed => (
                StartKeyType::StartOpen(key_range.start.values),
                EndKeyType::EndClosed(key_range.end.values),
            ),
            RangeKind::OpenOpen => (
                StartKeyType::StartOpen(key_range.start.values),
                EndKeyType::EndOpen(key_range.end.values),
            ),
        };
        InternalKeyRange {
            start_key_type: Some(start),
            end_key_type: Some(end),
        }
    }
}

impl From<KeyRange> for KeySet {
    fn from(key_range: KeyRange) -> Self {
        KeySet {
            inner: InternalKeySet {
                keys: vec![],
                ranges: vec![key_range.into()],
                all: false,
            },
        }
    }
}

impl Key {
    /// one creates new Key
    pub fn new(value: &dyn ToKind) -> Key {
        Key::composite(&[value])
    }

    /// composite creates a key of multiple columns.
    pub fn composite(values: &[&dyn ToKind]) -> Key {
        Key {
            values: ListValue {
                values: values.iter().map(|x| Value { kind: Some(x.to_kind()) }).collect(),
            },
        }
    }
}

impl From<Key> for KeySet {
    fn from(key: Key) -> Self {
        KeySet {
            inner: InternalKeySet {
                keys: vec![key.values],
                ranges: vec![],
                all: false,
            },
        }
    }
}

impl From<Vec<Key>> for KeySet {
    fn from(keys: Vec<Key>) -> Self {
        let keys = keys.into_iter().map(|key| key.values).collect();
        KeySet {
            inner: InternalKeySet {
                keys,
                ranges: vec![],
                all: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use prost_types::value::Kind;

    use crate::apiv1::types::key_range::{EndKeyType, StartKeyType};
    use crate::apiv1::types::KeyRange as InternalKeyRange;
    use crate::key::{all_keys, Key, KeyRange, KeySet, RangeKind};

    #[test]
    fn test_key_new() {
        let mut key = Key::new(&true);
        match key.values.values.pop().unwrap().kind.unwrap() {
            Kind::BoolValue(s) => assert!(s),
            _ => panic!("invalid kind"),
        }
    }

    #[test]
    fn test_key_composite() {
        let key = Key::composite(&[&1_i64, &"a"]);
        assert_eq!(key.values.values.len(), 2);
        assert_eq!(key.values.values[0].kind, Some(Kind::StringValue("1".to_string())));
    }

    #[test]
    fn test_key_range() {
        let range = KeyRange::new(Key::new(&1_i64), Key::new(&100_i64), RangeKind::ClosedOpen);
        let raw_range: InternalKeyRange = range.into();
        match raw_range.start_key_type.unwrap() {
            StartKeyType::StartClosed(mut v) => match v.values.pop().unwrap().kind.unwrap() {
                Kind::StringValue(v) => assert_eq!(v, "1"),
                _ => panic!("invalid start kind"),
            },
            _ => panic!("invalid start key type"),
        }
        match raw_range.end_key_type.unwrap() {
            EndKeyType::EndOpen(mut v) => match v.values.pop().unwrap().kind.unwrap() {
                Kind::StringValue(v) => assert_eq!(v, "100"),
                _ => panic!("invalid end kind"),
            },
            _ => panic!("invalid end key type"),
        }
    }

    #[test]
    fn test_key_set() {
        let set: KeySet = vec![Key::new(&1_i64), Key::new(&2_i64)].into();
        assert_eq!(set.inner.keys.len(), 2);
        assert!(!set.inner.all);
        assert!(all_keys().inner.all);
    }
}
