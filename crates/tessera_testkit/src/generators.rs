//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use proptest::prelude::*;
use serde_json::{Map, Number, Value};
use tessera_core::JsonObject;

/// Strategy for generating document keys such as `users/42`.
pub fn document_key_strategy() -> impl Strategy<Value = String> {
    (collection_name_strategy(), 0u32..10_000)
        .prop_map(|(collection, n)| format!("{}/{n}", collection.to_lowercase()))
}

/// Strategy for generating entity names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-zA-Z]{0,15}").expect("Invalid regex")
}

/// Strategy for generating field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-zA-Z0-9]{0,11}").expect("Invalid regex")
}

/// Strategy for generating JSON scalars.
///
/// Floats are kept finite so every value survives a JSON round trip.
pub fn json_scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        (-1.0e9f64..1.0e9).prop_map(|f| Number::from_f64(f).map_or(Value::Null, Value::Number)),
        "[a-z ]{0,24}".prop_map(Value::String),
    ]
}

/// Strategy for generating nested JSON values up to a few levels deep.
pub fn json_value_strategy() -> impl Strategy<Value = Value> {
    json_scalar_strategy().prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map(field_name_strategy(), inner, 0..6)
                .prop_map(|map| Value::Object(map.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

/// Strategy for generating document bodies.
pub fn document_strategy() -> impl Strategy<Value = JsonObject> {
    prop::collection::btree_map(field_name_strategy(), json_value_strategy(), 0..8)
        .prop_map(|map| map.into_iter().collect())
}

/// Strategy for generating a batch of distinct keys with their bodies.
pub fn documents_strategy(max: usize) -> impl Strategy<Value = Vec<(String, JsonObject)>> {
    prop::collection::btree_map(document_key_strategy(), document_strategy(), 1..max.max(2))
        .prop_map(|map| map.into_iter().collect())
}

/// Operations for model-based testing.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Put a document.
    Put {
        /// Document key.
        key: String,
        /// Document body.
        data: JsonObject,
    },
    /// Delete a document.
    Delete {
        /// Document key.
        key: String,
    },
    /// Checkpoint the storage.
    Checkpoint,
}

/// Strategy for generating a sequence of operations over a small key space.
pub fn operation_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<Operation>> {
    let key = (0u8..8).prop_map(|n| format!("docs/{n}"));
    let operation = prop_oneof![
        6 => (key.clone(), document_strategy())
            .prop_map(|(key, data)| Operation::Put { key, data }),
        3 => key.prop_map(|key| Operation::Delete { key }),
        1 => Just(Operation::Checkpoint),
    ];
    prop::collection::vec(operation, 1..max_len.max(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn document_keys_have_a_collection_prefix(key in document_key_strategy()) {
            let (collection, id) = key.split_once('/').unwrap();
            prop_assert!(!collection.is_empty());
            prop_assert!(id.parse::<u32>().is_ok());
        }

        #[test]
        fn documents_survive_json(doc in document_strategy()) {
            let text = serde_json::to_string(&doc).unwrap();
            let back: JsonObject = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(back.len(), doc.len());
        }

        #[test]
        fn operation_sequences_are_not_empty(ops in operation_sequence_strategy(20)) {
            prop_assert!(!ops.is_empty());
            prop_assert!(ops.len() < 20);
        }
    }
}
