//! Structured document patches.
//!
//! A patch is a list of [`PatchRequest`]s applied in order to the body of
//! one document. A request may carry `prev_val`; the request then fails
//! with a concurrency error unless the property currently holds that value
//! (a missing property matches `null`).

use crate::error::{CoreError, CoreResult};
use crate::types::JsonObject;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// What a patch request does to its property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchCommandType {
    /// Replace the property.
    Set,
    /// Remove the property.
    Unset,
    /// Append to an array property, creating it if missing.
    Add,
    /// Insert into an array property at `position`.
    Insert,
    /// Remove from an array property, by `position` or by value.
    Remove,
    /// Apply `nested` requests to an object property, or to the object
    /// elements of an array property.
    Modify,
    /// Add a number to a numeric property, setting it if missing.
    Inc,
    /// Copy the property to the name held in `value`.
    Copy,
    /// Move the property to the name held in `value`.
    Rename,
}

/// One patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRequest {
    /// Operation.
    #[serde(rename = "Type")]
    pub kind: PatchCommandType,
    /// Target property.
    pub name: String,
    /// Operand.
    #[serde(default)]
    pub value: Value,
    /// Value the property must hold before the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_val: Option<Value>,
    /// Requests applied by `Modify`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<PatchRequest>,
    /// Array position for `Insert`, `Remove` and `Modify`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// `Modify` every object element of an array.
    #[serde(default)]
    pub all_positions: bool,
}

impl PatchRequest {
    fn new(kind: PatchCommandType, name: impl Into<String>, value: Value) -> Self {
        Self {
            kind,
            name: name.into(),
            value,
            prev_val: None,
            nested: Vec::new(),
            position: None,
            all_positions: false,
        }
    }

    /// `Set` request.
    #[must_use]
    pub fn set(name: impl Into<String>, value: Value) -> Self {
        Self::new(PatchCommandType::Set, name, value)
    }

    /// `Unset` request.
    #[must_use]
    pub fn unset(name: impl Into<String>) -> Self {
        Self::new(PatchCommandType::Unset, name, Value::Null)
    }

    /// `Add` request.
    #[must_use]
    pub fn add(name: impl Into<String>, value: Value) -> Self {
        Self::new(PatchCommandType::Add, name, value)
    }

    /// `Insert` request.
    #[must_use]
    pub fn insert(name: impl Into<String>, position: usize, value: Value) -> Self {
        Self::new(PatchCommandType::Insert, name, value).at(position)
    }

    /// `Remove` of the element at `position`.
    #[must_use]
    pub fn remove_at(name: impl Into<String>, position: usize) -> Self {
        Self::new(PatchCommandType::Remove, name, Value::Null).at(position)
    }

    /// `Remove` of every element equal to `value`.
    #[must_use]
    pub fn remove_value(name: impl Into<String>, value: Value) -> Self {
        Self::new(PatchCommandType::Remove, name, value)
    }

    /// `Modify` request.
    #[must_use]
    pub fn modify(name: impl Into<String>, nested: Vec<PatchRequest>) -> Self {
        Self {
            nested,
            ..Self::new(PatchCommandType::Modify, name, Value::Null)
        }
    }

    /// `Inc` request.
    #[must_use]
    pub fn inc(name: impl Into<String>, by: impl Into<Number>) -> Self {
        Self::new(PatchCommandType::Inc, name, Value::Number(by.into()))
    }

    /// `Copy` request.
    #[must_use]
    pub fn copy(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(PatchCommandType::Copy, name, Value::String(to.into()))
    }

    /// `Rename` request.
    #[must_use]
    pub fn rename(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(PatchCommandType::Rename, name, Value::String(to.into()))
    }

    /// Requires the property to hold `value` first.
    #[must_use]
    pub fn prev_val(mut self, value: Value) -> Self {
        self.prev_val = Some(value);
        self
    }

    /// Targets an array position.
    #[must_use]
    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    /// Makes `Modify` apply to every object element.
    #[must_use]
    pub fn all_positions(mut self) -> Self {
        self.all_positions = true;
        self
    }
}

/// Applies patch requests to a document body.
#[derive(Debug)]
pub struct JsonPatcher<'a> {
    document: &'a mut JsonObject,
}

impl<'a> JsonPatcher<'a> {
    /// Wraps a document body.
    pub fn new(document: &'a mut JsonObject) -> Self {
        Self { document }
    }

    /// Applies every request in order. On error the body may be partially
    /// patched; callers discard it.
    ///
    /// # Errors
    ///
    /// Returns `Concurrency` on a `prev_val` mismatch and `InvalidPatch` when
    /// a request does not fit the document.
    pub fn apply(&mut self, requests: &[PatchRequest]) -> CoreResult<()> {
        apply_all(self.document, requests)
    }
}

fn apply_all(document: &mut JsonObject, requests: &[PatchRequest]) -> CoreResult<()> {
    requests.iter().try_for_each(|r| apply_one(document, r))
}

fn apply_one(document: &mut JsonObject, request: &PatchRequest) -> CoreResult<()> {
    if request.name.is_empty() {
        return Err(CoreError::invalid_patch("patch request without a property name"));
    }
    if let Some(expected) = &request.prev_val {
        ensure_previous_value(document, &request.name, expected)?;
    }

    let name = request.name.as_str();
    match request.kind {
        PatchCommandType::Set => {
            document.insert(name.to_string(), request.value.clone());
        }
        PatchCommandType::Unset => {
            document.remove(name);
        }
        PatchCommandType::Add => {
            array_mut(document, name, true)?.push(request.value.clone());
        }
        PatchCommandType::Insert => {
            let position = required_position(request)?;
            let array = array_mut(document, name, false)?;
            if position > array.len() {
                return Err(out_of_range(name, position, array.len()));
            }
            array.insert(position, request.value.clone());
        }
        PatchCommandType::Remove => {
            let array = array_mut(document, name, false)?;
            match request.position {
                Some(position) if position < array.len() => {
                    array.remove(position);
                }
                Some(position) => return Err(out_of_range(name, position, array.len())),
                None => array.retain(|v| !values_equal(v, &request.value)),
            }
        }
        PatchCommandType::Modify => modify(document, request)?,
        PatchCommandType::Inc => increment(document, name, &request.value)?,
        PatchCommandType::Copy => {
            let target = target_name(request)?;
            if let Some(value) = document.get(name).cloned() {
                document.insert(target.to_string(), value);
            }
        }
        PatchCommandType::Rename => {
            let target = target_name(request)?;
            if let Some(value) = document.remove(name) {
                document.insert(target.to_string(), value);
            }
        }
    }
    Ok(())
}

fn ensure_previous_value(document: &JsonObject, name: &str, expected: &Value) -> CoreResult<()> {
    let current = document.get(name).unwrap_or(&Value::Null);
    if values_equal(current, expected) {
        Ok(())
    } else {
        Err(CoreError::concurrency(format!(
            "Could not patch property '{name}': expected {expected} but found {current}"
        )))
    }
}

/// JSON equality with numbers compared by value, so `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

fn array_mut<'d>(
    document: &'d mut JsonObject,
    name: &str,
    create: bool,
) -> CoreResult<&'d mut Vec<Value>> {
    if create && !document.contains_key(name) {
        document.insert(name.to_string(), Value::Array(Vec::new()));
    }
    match document.get_mut(name) {
        Some(Value::Array(array)) => Ok(array),
        Some(other) => Err(CoreError::invalid_patch(format!(
            "property '{name}' is not an array: {other}"
        ))),
        None => Err(CoreError::invalid_patch(format!(
            "cannot find array property '{name}'"
        ))),
    }
}

fn required_position(request: &PatchRequest) -> CoreResult<usize> {
    request.position.ok_or_else(|| {
        CoreError::invalid_patch(format!(
            "{:?} on '{}' requires a position",
            request.kind, request.name
        ))
    })
}

fn out_of_range(name: &str, position: usize, len: usize) -> CoreError {
    CoreError::invalid_patch(format!(
        "position {position} is out of range for '{name}' of length {len}"
    ))
}

fn target_name(request: &PatchRequest) -> CoreResult<&str> {
    match &request.value {
        Value::String(target) if !target.is_empty() => Ok(target),
        _ => Err(CoreError::invalid_patch(format!(
            "{:?} of '{}' needs the target property name as its value",
            request.kind, request.name
        ))),
    }
}

fn modify(document: &mut JsonObject, request: &PatchRequest) -> CoreResult<()> {
    let name = request.name.as_str();
    match document.get_mut(name) {
        Some(Value::Object(inner)) => apply_all(inner, &request.nested),
        Some(Value::Array(array)) => {
            if request.all_positions {
                for element in array.iter_mut() {
                    if let Value::Object(inner) = element {
                        apply_all(inner, &request.nested)?;
                    }
                }
                return Ok(());
            }
            let position = required_position(request)?;
            let len = array.len();
            match array.get_mut(position) {
                Some(Value::Object(inner)) => apply_all(inner, &request.nested),
                Some(other) => Err(CoreError::invalid_patch(format!(
                    "element {position} of '{name}' is not an object: {other}"
                ))),
                None => Err(out_of_range(name, position, len)),
            }
        }
        Some(other) => Err(CoreError::invalid_patch(format!(
            "cannot modify '{name}', it is not an object or array: {other}"
        ))),
        None => Err(CoreError::invalid_patch(format!(
            "cannot modify missing property '{name}'"
        ))),
    }
}

fn increment(document: &mut JsonObject, name: &str, by: &Value) -> CoreResult<()> {
    let Value::Number(delta) = by else {
        return Err(CoreError::invalid_patch(format!(
            "cannot increment '{name}' by non-number {by}"
        )));
    };
    let next = match document.get(name) {
        None | Some(Value::Null) => Value::Number(delta.clone()),
        Some(Value::Number(current)) => match (current.as_i64(), delta.as_i64()) {
            (Some(a), Some(b)) => a.checked_add(b).map_or_else(
                || float(a as f64 + b as f64),
                Value::from,
            ),
            _ => float(current.as_f64().unwrap_or(0.0) + delta.as_f64().unwrap_or(0.0)),
        },
        Some(other) => {
            return Err(CoreError::invalid_patch(format!(
                "cannot increment '{name}', it is not a number: {other}"
            )))
        }
    };
    document.insert(name.to_string(), next);
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn float(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn patched(value: Value, requests: &[PatchRequest]) -> CoreResult<Value> {
        let mut document = doc(value);
        JsonPatcher::new(&mut document).apply(requests)?;
        Ok(Value::Object(document))
    }

    #[test]
    fn set_unset_and_rename() {
        let result = patched(
            json!({"Name": "Ayende", "Age": 30}),
            &[
                PatchRequest::set("Name", json!("Oren")),
                PatchRequest::unset("Age"),
                PatchRequest::rename("Name", "FullName"),
            ],
        )
        .unwrap();
        assert_eq!(result, json!({"FullName": "Oren"}));
    }

    #[test]
    fn copy_keeps_the_source() {
        let result = patched(json!({"A": [1, 2]}), &[PatchRequest::copy("A", "B")]).unwrap();
        assert_eq!(result, json!({"A": [1, 2], "B": [1, 2]}));
    }

    #[test]
    fn array_operations() {
        let result = patched(
            json!({"Tags": ["a", "b", "a"]}),
            &[
                PatchRequest::add("Tags", json!("c")),
                PatchRequest::insert("Tags", 0, json!("z")),
                PatchRequest::remove_value("Tags", json!("a")),
                PatchRequest::remove_at("Tags", 1),
                PatchRequest::add("New", json!(1)),
            ],
        )
        .unwrap();
        assert_eq!(result, json!({"Tags": ["z", "c"], "New": [1]}));
    }

    #[test]
    fn insert_past_the_end_is_rejected() {
        let err = patched(json!({"Tags": []}), &[PatchRequest::insert("Tags", 2, json!(1))])
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidPatch { .. }));
    }

    #[test]
    fn inc_adds_or_sets() {
        let result = patched(
            json!({"Count": 1, "Ratio": 0.5}),
            &[
                PatchRequest::inc("Count", 2),
                PatchRequest::inc("Missing", 5),
                PatchRequest::inc("Ratio", 1),
            ],
        )
        .unwrap();
        assert_eq!(result, json!({"Count": 3, "Missing": 5, "Ratio": 1.5}));

        let err = patched(json!({"Name": "x"}), &[PatchRequest::inc("Name", 1)]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPatch { .. }));
    }

    #[test]
    fn modify_nested_objects_and_array_elements() {
        let result = patched(
            json!({
                "Address": {"City": "Hadera"},
                "Lines": [{"Qty": 1}, {"Qty": 2}, "note"]
            }),
            &[
                PatchRequest::modify("Address", vec![PatchRequest::set("City", json!("Haifa"))]),
                PatchRequest::modify("Lines", vec![PatchRequest::inc("Qty", 10)]).all_positions(),
                PatchRequest::modify("Lines", vec![PatchRequest::unset("Qty")]).at(0),
            ],
        )
        .unwrap();
        assert_eq!(
            result,
            json!({
                "Address": {"City": "Haifa"},
                "Lines": [{}, {"Qty": 12}, "note"]
            })
        );
    }

    #[test]
    fn prev_val_guards_the_request() {
        let ok = patched(
            json!({"Count": 1}),
            &[PatchRequest::set("Count", json!(2)).prev_val(json!(1.0))],
        )
        .unwrap();
        assert_eq!(ok, json!({"Count": 2}));

        let err = patched(
            json!({"Count": 1}),
            &[PatchRequest::set("Count", json!(2)).prev_val(json!(5))],
        )
        .unwrap_err();
        assert!(err.is_concurrency());

        let missing = patched(
            json!({}),
            &[PatchRequest::set("Count", json!(1)).prev_val(Value::Null)],
        )
        .unwrap();
        assert_eq!(missing, json!({"Count": 1}));
    }

    #[test]
    fn requests_round_trip_through_json() {
        let request = PatchRequest::modify("Lines", vec![PatchRequest::inc("Qty", 1)]).at(3);
        let text = serde_json::to_string(&request).unwrap();
        assert!(text.contains("\"Type\":\"Modify\""));
        let back: PatchRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, request);
    }
}
