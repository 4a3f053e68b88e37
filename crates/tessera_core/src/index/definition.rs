//! Declarative index definitions and their compiled form.

use crate::error::{CoreError, CoreResult};
use crate::index::fulltext::IndexEntry;
use crate::storage::MappedResult;
use crate::types::{JsonDocument, JsonObject};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Field holding the source document key of a map entry.
pub const DOCUMENT_ID_FIELD: &str = "__document_id";

/// Field holding the reduce key of a reduced entry.
pub const REDUCE_KEY_FIELD: &str = "__reduce_key";

const RESERVED_FIELDS: [&str; 2] = [DOCUMENT_ID_FIELD, REDUCE_KEY_FIELD];

/// Conversion applied to a mapped value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldConversion {
    /// Numbers and numeric strings become numbers; anything else fails.
    Number,
    /// Strings are lowercased.
    Lowercase,
    /// Length of a string, array or object.
    Length,
}

/// One mapped field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Field name in the index.
    pub name: String,
    /// Dotted path into the document; `@metadata.X` reads metadata.
    pub path: String,
    /// Optional conversion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert: Option<FieldConversion>,
}

/// The map step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDefinition {
    /// Entity names the index applies to; empty means every document.
    #[serde(default)]
    pub from: Vec<String>,
    /// Mapped fields, in order.
    pub fields: Vec<FieldMapping>,
}

/// Aggregate operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateOp {
    /// Number of mapped results, or of results with a non-null field.
    Count,
    /// Sum of a numeric field.
    Sum,
    /// Minimum of a numeric field.
    Min,
    /// Maximum of a numeric field.
    Max,
}

/// One aggregate of the reduce step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDefinition {
    /// Output field name.
    pub name: String,
    /// Operator.
    pub op: AggregateOp,
    /// Mapped field the operator reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl AggregateDefinition {
    /// `Count` of mapped results.
    pub fn count(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: AggregateOp::Count,
            field: None,
        }
    }

    /// An operator over a mapped field.
    pub fn over(name: impl Into<String>, op: AggregateOp, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op,
            field: Some(field.into()),
        }
    }
}

/// The reduce step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceDefinition {
    /// Mapped fields forming the reduce key.
    pub group_by: Vec<String>,
    /// Aggregates computed per group.
    pub aggregates: Vec<AggregateDefinition>,
}

/// Whether a field's values are returned by projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldStorage {
    /// Stored in the index.
    Yes,
    /// Not stored.
    No,
}

/// How a field's values are turned into terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldIndexing {
    /// Tokenized and lowercased.
    Analyzed,
    /// The exact value is one term.
    NotAnalyzed,
    /// Not searchable.
    No,
}

/// Declarative, persistable index definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// The map step.
    pub map: MapDefinition,
    /// The optional reduce step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<ReduceDefinition>,
    /// Storage per field.
    #[serde(default)]
    pub stores: BTreeMap<String, FieldStorage>,
    /// Indexing per field; fields without an entry are matched as one
    /// lowercased term.
    #[serde(default)]
    pub indexes: BTreeMap<String, FieldIndexing>,
}

impl IndexDefinition {
    /// An empty definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the index to documents of an entity.
    #[must_use]
    pub fn from_entity(mut self, entity: impl Into<String>) -> Self {
        self.map.from.push(entity.into());
        self
    }

    /// Maps a document path into a field.
    #[must_use]
    pub fn map_field(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.map.fields.push(FieldMapping {
            name: name.into(),
            path: path.into(),
            convert: None,
        });
        self
    }

    /// Maps a document path into a field through a conversion.
    #[must_use]
    pub fn map_field_with(
        mut self,
        name: impl Into<String>,
        path: impl Into<String>,
        convert: FieldConversion,
    ) -> Self {
        self.map.fields.push(FieldMapping {
            name: name.into(),
            path: path.into(),
            convert: Some(convert),
        });
        self
    }

    /// Adds a reduce step.
    #[must_use]
    pub fn reduce_by<G, A>(mut self, group_by: G, aggregates: A) -> Self
    where
        G: IntoIterator,
        G::Item: Into<String>,
        A: IntoIterator<Item = AggregateDefinition>,
    {
        self.reduce = Some(ReduceDefinition {
            group_by: group_by.into_iter().map(Into::into).collect(),
            aggregates: aggregates.into_iter().collect(),
        });
        self
    }

    /// Sets the storage of a field.
    #[must_use]
    pub fn store(mut self, field: impl Into<String>, storage: FieldStorage) -> Self {
        self.stores.insert(field.into(), storage);
        self
    }

    /// Sets the indexing of a field.
    #[must_use]
    pub fn indexing(mut self, field: impl Into<String>, indexing: FieldIndexing) -> Self {
        self.indexes.insert(field.into(), indexing);
        self
    }

    /// Whether the definition has a reduce step.
    #[must_use]
    pub fn is_map_reduce(&self) -> bool {
        self.reduce.is_some()
    }

    /// SHA-256 of the canonical JSON form.
    #[must_use]
    pub fn hash(&self) -> [u8; 32] {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        Sha256::digest(&bytes).into()
    }

    /// Fields a query can address, in definition order.
    #[must_use]
    pub fn output_fields(&self) -> Vec<String> {
        match &self.reduce {
            Some(reduce) => reduce
                .group_by
                .iter()
                .cloned()
                .chain(reduce.aggregates.iter().map(|a| a.name.clone()))
                .collect(),
            None => self.map.fields.iter().map(|f| f.name.clone()).collect(),
        }
    }

    /// Validates the definition.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidIndexDefinition`] for an empty name, an
    /// empty or duplicate field, a malformed path, a reduce over an unknown
    /// field, or a reserved field name.
    pub fn compile(&self, name: &str) -> CoreResult<CompiledIndex> {
        let invalid = |message: String| CoreError::invalid_index_definition(name, message);

        if name.trim().is_empty() {
            return Err(invalid("index name is empty".into()));
        }
        if self.map.fields.is_empty() {
            return Err(invalid("the map step has no fields".into()));
        }

        let mut fields = Vec::with_capacity(self.map.fields.len());
        let mut seen = HashSet::new();
        for mapping in &self.map.fields {
            check_field_name(&mapping.name, &mut seen).map_err(invalid)?;
            let path = FieldPath::parse(&mapping.path)
                .map_err(|e| invalid(format!("field {}: {e}", mapping.name)))?;
            fields.push(CompiledField {
                name: mapping.name.clone(),
                path,
                convert: mapping.convert,
            });
        }

        let reduce = match &self.reduce {
            Some(reduce) => Some(Self::compile_reduce(reduce, &seen).map_err(invalid)?),
            None => None,
        };

        let outputs: HashSet<String> = self.output_fields().into_iter().collect();
        for field in self.stores.keys().chain(self.indexes.keys()) {
            if !outputs.contains(field) {
                return Err(invalid(format!("options reference unknown field {field}")));
            }
        }

        Ok(CompiledIndex {
            name: name.to_string(),
            definition: self.clone(),
            from: self.map.from.iter().map(|e| e.to_lowercase()).collect(),
            fields,
            reduce,
            hash: self.hash(),
        })
    }

    fn compile_reduce(
        reduce: &ReduceDefinition,
        mapped: &HashSet<String>,
    ) -> Result<ReduceDefinition, String> {
        if reduce.group_by.is_empty() {
            return Err("the reduce step has no group_by fields".into());
        }
        let mut outputs = HashSet::new();
        for group in &reduce.group_by {
            if !mapped.contains(group) {
                return Err(format!("reduce groups by unknown field {group}"));
            }
            if !outputs.insert(group.clone()) {
                return Err(format!("duplicate field {group}"));
            }
        }
        for aggregate in &reduce.aggregates {
            check_field_name(&aggregate.name, &mut outputs)?;
            match (&aggregate.field, aggregate.op) {
                (Some(field), _) if !mapped.contains(field) => {
                    return Err(format!(
                        "aggregate {} reads unknown field {field}",
                        aggregate.name
                    ));
                }
                (None, AggregateOp::Sum | AggregateOp::Min | AggregateOp::Max) => {
                    return Err(format!("aggregate {} needs a field", aggregate.name));
                }
                _ => {}
            }
        }
        Ok(reduce.clone())
    }
}

fn check_field_name(name: &str, seen: &mut HashSet<String>) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("field name is empty".into());
    }
    if RESERVED_FIELDS.contains(&name) {
        return Err(format!("field name {name} is reserved"));
    }
    if !seen.insert(name.to_string()) {
        return Err(format!("duplicate field {name}"));
    }
    Ok(())
}

/// A parsed dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    metadata: bool,
    segments: Vec<String>,
}

impl FieldPath {
    /// Parses `a.b.c` or `@metadata.a.b`.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed part.
    pub fn parse(path: &str) -> Result<Self, String> {
        let (metadata, rest) = match path.strip_prefix("@metadata") {
            Some(rest) => (
                true,
                rest.strip_prefix('.')
                    .ok_or_else(|| format!("malformed metadata path '{path}'"))?,
            ),
            None => (false, path),
        };
        if rest.is_empty() {
            return Err("path is empty".into());
        }

        let mut segments = Vec::new();
        for segment in rest.split('.') {
            if segment.is_empty() {
                return Err(format!("empty segment in path '{path}'"));
            }
            if segment.starts_with('@') || segment.chars().any(char::is_whitespace) {
                return Err(format!("malformed segment '{segment}' in path '{path}'"));
            }
            segments.push(segment.to_string());
        }
        Ok(Self { metadata, segments })
    }

    /// Values at the path. Arrays along the way fan out.
    #[must_use]
    pub fn resolve<'a>(&self, data: &'a JsonObject, metadata: &'a JsonObject) -> Vec<&'a Value> {
        let root = if self.metadata { metadata } else { data };
        let Some((first, rest)) = self.segments.split_first() else {
            return Vec::new();
        };
        let mut current: Vec<&Value> = root.get(first).into_iter().collect();
        for segment in rest {
            current = current
                .into_iter()
                .flat_map(|value| match value {
                    Value::Object(map) => map.get(segment).into_iter().collect::<Vec<_>>(),
                    Value::Array(items) => items
                        .iter()
                        .filter_map(|item| item.as_object()?.get(segment))
                        .collect(),
                    _ => Vec::new(),
                })
                .collect();
        }
        current
    }
}

impl FieldConversion {
    fn apply(self, value: &Value) -> Result<Value, String> {
        match self {
            Self::Number => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) => parse_number(s.trim())
                    .ok_or_else(|| format!("cannot convert '{s}' to a number")),
                other => Err(format!("cannot convert {other} to a number")),
            },
            Self::Lowercase => Ok(match value {
                Value::String(s) => Value::String(s.to_lowercase()),
                other => other.clone(),
            }),
            Self::Length => match value {
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Array(items) => Ok(Value::from(items.len())),
                Value::Object(map) => Ok(Value::from(map.len())),
                other => Err(format!("{other} has no length")),
            },
        }
    }
}

fn parse_number(text: &str) -> Option<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

#[derive(Debug, Clone)]
struct CompiledField {
    name: String,
    path: FieldPath,
    convert: Option<FieldConversion>,
}

impl CompiledField {
    fn values(&self, doc: &JsonDocument) -> Result<Vec<Value>, String> {
        let raw = self.path.resolve(&doc.data, &doc.metadata);
        match self.convert {
            Some(FieldConversion::Length) => raw
                .into_iter()
                .map(|v| FieldConversion::Length.apply(v))
                .collect(),
            convert => raw
                .into_iter()
                .flat_map(|v| match v {
                    Value::Array(items) => items.iter().collect::<Vec<_>>(),
                    other => vec![other],
                })
                .map(|v| match convert {
                    Some(c) => c.apply(v),
                    None => Ok(v.clone()),
                })
                .collect(),
        }
    }
}

/// Mapped field values of one document.
pub type MappedFields = BTreeMap<String, Vec<Value>>;

/// A validated definition ready to map and reduce documents.
#[derive(Debug, Clone)]
pub struct CompiledIndex {
    name: String,
    definition: IndexDefinition,
    from: Vec<String>,
    fields: Vec<CompiledField>,
    reduce: Option<ReduceDefinition>,
    hash: [u8; 32],
}

impl CompiledIndex {
    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The source definition.
    #[must_use]
    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// Hash of the definition.
    #[must_use]
    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Whether the index has a reduce step.
    #[must_use]
    pub fn is_map_reduce(&self) -> bool {
        self.reduce.is_some()
    }

    /// Whether documents of `entity` feed this index.
    #[must_use]
    pub fn applies_to(&self, entity: Option<&str>) -> bool {
        if self.from.is_empty() {
            return true;
        }
        entity.is_some_and(|e| self.from.contains(&e.to_lowercase()))
    }

    /// Whether a delete of a document with this entity name must be
    /// forwarded to the index.
    #[must_use]
    pub fn covers_entity(&self, entity: Option<&str>) -> bool {
        match entity {
            Some(_) => self.applies_to(entity),
            None => true,
        }
    }

    /// Indexing mode of a field; `None` is the lowercased single term.
    #[must_use]
    pub fn field_indexing(&self, field: &str) -> Option<FieldIndexing> {
        self.definition.indexes.get(field).copied()
    }

    /// Whether a field's values are returned by projections.
    #[must_use]
    pub fn is_stored(&self, field: &str) -> bool {
        matches!(self.definition.stores.get(field), Some(FieldStorage::Yes))
    }

    fn map_fields(&self, doc: &JsonDocument) -> CoreResult<MappedFields> {
        let mut mapped = MappedFields::new();
        for field in &self.fields {
            let values = field.values(doc).map_err(|e| {
                CoreError::invalid_operation(format!(
                    "index {} failed to map field {} of {}: {e}",
                    self.name, field.name, doc.key
                ))
            })?;
            if !values.is_empty() {
                mapped.insert(field.name.clone(), values);
            }
        }
        Ok(mapped)
    }

    /// Maps a document into its index entry.
    ///
    /// # Errors
    ///
    /// Returns an error if a conversion fails.
    pub fn map_entry(&self, doc: &JsonDocument) -> CoreResult<IndexEntry> {
        let mut fields = self.map_fields(doc)?;
        fields.insert(DOCUMENT_ID_FIELD.into(), vec![Value::String(doc.key.clone())]);
        Ok(IndexEntry {
            key: doc.key.to_lowercase(),
            document_key: Some(doc.key.clone()),
            fields,
        })
    }

    /// Maps a document into `(reduce key, mapped value)` pairs. A group
    /// field with several values yields one pair per combination.
    ///
    /// # Errors
    ///
    /// Returns an error if a conversion fails or the index has no reduce
    /// step.
    pub fn map_results(&self, doc: &JsonDocument) -> CoreResult<Vec<(String, JsonObject)>> {
        let reduce = self.reduce.as_ref().ok_or_else(|| {
            CoreError::invalid_operation(format!("index {} has no reduce step", self.name))
        })?;
        let mapped = self.map_fields(doc)?;

        let mut combinations: Vec<Vec<Value>> = vec![Vec::new()];
        for group in &reduce.group_by {
            let values = mapped
                .get(group)
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| vec![Value::Null]);
            combinations = combinations
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |v| {
                        let mut next = prefix.clone();
                        next.push(v.clone());
                        next
                    })
                })
                .collect();
        }

        Ok(combinations
            .into_iter()
            .map(|groups| {
                let mut value = JsonObject::new();
                for (name, values) in &mapped {
                    value.insert(name.clone(), collapse(values));
                }
                for (name, group_value) in reduce.group_by.iter().zip(&groups) {
                    value.insert(name.clone(), group_value.clone());
                }
                (reduce_key(&groups), value)
            })
            .collect())
    }

    /// Reduces every mapped result of one key into its entry. Returns
    /// `None` when no result is left.
    ///
    /// # Errors
    ///
    /// Returns an error if an aggregate meets a non-numeric value.
    pub fn reduce(&self, key: &str, results: &[MappedResult]) -> CoreResult<Option<IndexEntry>> {
        let reduce = self.reduce.as_ref().ok_or_else(|| {
            CoreError::invalid_operation(format!("index {} has no reduce step", self.name))
        })?;
        let Some(first) = results.first() else {
            return Ok(None);
        };

        let mut fields = MappedFields::new();
        for group in &reduce.group_by {
            let value = first.value.get(group).cloned().unwrap_or(Value::Null);
            fields.insert(group.clone(), vec![value]);
        }
        for aggregate in &reduce.aggregates {
            let value = aggregate_values(aggregate, results).map_err(|e| {
                CoreError::invalid_operation(format!(
                    "index {} failed to reduce {key}: {e}",
                    self.name
                ))
            })?;
            fields.insert(aggregate.name.clone(), vec![value]);
        }
        fields.insert(REDUCE_KEY_FIELD.into(), vec![Value::String(key.to_string())]);

        Ok(Some(IndexEntry {
            key: key.to_string(),
            document_key: None,
            fields,
        }))
    }
}

fn collapse(values: &[Value]) -> Value {
    match values {
        [single] => single.clone(),
        many => Value::Array(many.to_vec()),
    }
}

/// Reduce key of a group: the group values as a JSON array.
#[must_use]
pub fn reduce_key(groups: &[Value]) -> String {
    Value::Array(groups.to_vec()).to_string()
}

fn aggregate_values(aggregate: &AggregateDefinition, results: &[MappedResult]) -> Result<Value, String> {
    let inputs: Vec<&Value> = match &aggregate.field {
        Some(field) => results
            .iter()
            .filter_map(|r| r.value.get(field))
            .filter(|v| !v.is_null())
            .collect(),
        None => Vec::new(),
    };

    if aggregate.op == AggregateOp::Count {
        let count = if aggregate.field.is_some() {
            inputs.len()
        } else {
            results.len()
        };
        return Ok(Value::from(count));
    }

    let mut integers = Vec::with_capacity(inputs.len());
    let mut floats = Vec::with_capacity(inputs.len());
    for value in &inputs {
        let number = value
            .as_f64()
            .ok_or_else(|| format!("{} cannot aggregate {value}", aggregate.name))?;
        floats.push(number);
        if let Some(i) = value.as_i64() {
            integers.push(i);
        }
    }
    let all_integers = integers.len() == floats.len();

    Ok(match aggregate.op {
        AggregateOp::Sum if all_integers => integers
            .iter()
            .try_fold(0i64, |acc, v| acc.checked_add(*v))
            .map_or_else(|| float(floats.iter().sum()), Value::from),
        AggregateOp::Sum => float(floats.iter().sum()),
        AggregateOp::Min if all_integers => integers.iter().min().map_or(Value::Null, |v| Value::from(*v)),
        AggregateOp::Max if all_integers => integers.iter().max().map_or(Value::Null, |v| Value::from(*v)),
        AggregateOp::Min => floats.iter().copied().reduce(f64::min).map_or(Value::Null, float),
        AggregateOp::Max => floats.iter().copied().reduce(f64::max).map_or(Value::Null, float),
        AggregateOp::Count => Value::from(results.len()),
    })
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}
