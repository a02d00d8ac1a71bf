use prost_types::value::Kind;
use prost_types::{ListValue, Value};

use crate::apiv1::types::batch_write_request::MutationGroup as InternalMutationGroup;
use crate::apiv1::types::mutation::{Delete, Operation, Write};
use crate::apiv1::types::Mutation;
use crate::key::KeySet;
use crate::statement::{ToKind, ToStruct};

/// One row written to `table`.
fn row<C: ToString>(table: &str, cells: impl IntoIterator<Item = (C, Kind)>) -> Write {
    let (columns, values): (Vec<String>, Vec<Value>) = cells
        .into_iter()
        .map(|(column, kind)| (column.to_string(), Value { kind: Some(kind) }))
        .unzip();
    Write {
        table: table.to_string(),
        columns,
        values: vec![ListValue { values }],
    }
}

fn from_columns(table: &str, columns: &[&str], values: &[&dyn ToKind]) -> Write {
    row(table, columns.iter().zip(values.iter().map(|v| v.to_kind())))
}

fn from_pairs(table: &str, pairs: &[(&str, &dyn ToKind)]) -> Write {
    row(table, pairs.iter().map(|(column, value)| (column, value.to_kind())))
}

fn from_struct(table: &str, to_struct: impl ToStruct) -> Write {
    row(table, to_struct.to_kinds())
}

fn mutation(operation: fn(Write) -> Operation, write: Write) -> Mutation {
    Mutation {
        operation: Some(operation(write)),
    }
}

/// insert writes a new row. The write fails with ALREADY_EXISTS when the row is present.
pub fn insert(table: &str, columns: &[&str], values: &[&dyn ToKind]) -> Mutation {
    mutation(Operation::Insert, from_columns(table, columns, values))
}

/// insert_map is [`insert`] taking `(column, value)` pairs.
pub fn insert_map(table: &str, columns_and_values: &[(&str, &dyn ToKind)]) -> Mutation {
    mutation(Operation::Insert, from_pairs(table, columns_and_values))
}

/// insert_struct is [`insert`] taking the columns of a [`ToStruct`].
pub fn insert_struct(table: &str, to_struct: impl ToStruct) -> Mutation {
    mutation(Operation::Insert, from_struct(table, to_struct))
}

/// update changes the given columns of an existing row. The write fails with NOT_FOUND
/// when the row is missing.
pub fn update(table: &str, columns: &[&str], values: &[&dyn ToKind]) -> Mutation {
    mutation(Operation::Update, from_columns(table, columns, values))
}

pub fn update_map(table: &str, columns_and_values: &[(&str, &dyn ToKind)]) -> Mutation {
    mutation(Operation::Update, from_pairs(table, columns_and_values))
}

pub fn update_struct(table: &str, to_struct: impl ToStruct) -> Mutation {
    mutation(Operation::Update, from_struct(table, to_struct))
}

/// replace deletes the existing row, if any, and writes the new one. Columns that are not
/// written become NULL.
pub fn replace(table: &str, columns: &[&str], values: &[&dyn ToKind]) -> Mutation {
    mutation(Operation::Replace, from_columns(table, columns, values))
}

pub fn replace_map(table: &str, columns_and_values: &[(&str, &dyn ToKind)]) -> Mutation {
    mutation(Operation::Replace, from_pairs(table, columns_and_values))
}

pub fn replace_struct(table: &str, to_struct: impl ToStruct) -> Mutation {
    mutation(Operation::Replace, from_struct(table, to_struct))
}

/// insert_or_update writes the row, keeping the columns of an existing row that are not
/// written.
pub fn insert_or_update(table: &str, columns: &[&str], values: &[&dyn ToKind]) -> Mutation {
    mutation(Operation::InsertOrUpdate, from_columns(table, columns, values))
}

pub fn insert_or_update_map(table: &str, columns_and_values: &[(&str, &dyn ToKind)]) -> Mutation {
    mutation(Operation::InsertOrUpdate, from_pairs(table, columns_and_values))
}

pub fn insert_or_update_struct(table: &str, to_struct: impl ToStruct) -> Mutation {
    mutation(Operation::InsertOrUpdate, from_struct(table, to_struct))
}

/// delete removes every row of the key set. Missing keys are not an error.
pub fn delete(table: &str, key_set: impl Into<KeySet>) -> Mutation {
    Mutation {
        operation: Some(Operation::Delete(Delete {
            table: table.to_string(),
            key_set: Some(key_set.into().inner),
        })),
    }
}

/// A set of mutations applied atomically by `batch_write`. Different groups are committed
/// independently of each other.
#[derive(Clone, Debug, Default)]
pub struct MutationGroup {
    pub mutations: Vec<Mutation>,
}

impl MutationGroup {
    pub fn new(mutations: Vec<Mutation>) -> Self {
        Self { mutations }
    }
}

impl From<MutationGroup> for InternalMutationGroup {
    fn from(group: MutationGroup) -> Self {
        InternalMutationGroup {
            mutations: group.mutations,
        }
    }
}

/// Picks the mutation a multiplexed session needs to begin a mutation-only read-write
/// transaction: any non-insert mutation, otherwise the insert carrying the most rows.
pub(crate) fn select_mutation_key(ms: &[Mutation]) -> Option<Mutation> {
    let non_insert = ms
        .iter()
        .find(|m| !matches!(m.operation, Some(Operation::Insert(_)) | None));
    if let Some(m) = non_insert {
        return Some(m.clone());
    }
    ms.iter()
        .filter_map(|m| match &m.operation {
            Some(Operation::Insert(w)) => Some((w.values.len(), m)),
            _ => None,
        })
        .max_by_key(|(rows, _)| *rows)
        .map(|(_, m)| m.clone())
}
