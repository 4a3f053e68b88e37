//! Evaluation of parsed queries against an index's contents.

use crate::index::FullTextIndex;
use crate::index::IndexEntry;
use crate::query::ast::{BoolQuery, Query};
use crate::query::SortedField;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Entry keys matching a query.
#[must_use]
pub fn execute(contents: &FullTextIndex, query: &Query) -> BTreeSet<String> {
    match query {
        Query::MatchAll => contents.all(),
        Query::Term(q) => contents.term(&q.field, &q.value),
        Query::Phrase(q) => contents.term(&q.field, &q.phrase),
        Query::Prefix(q) => contents.prefix(&q.field, &q.prefix),
        Query::Range(q) => contents.range(&q.field, q.lower.clone(), q.upper.clone()),
        Query::Bool(q) => execute_bool(contents, q),
    }
}

fn execute_bool(contents: &FullTextIndex, query: &BoolQuery) -> BTreeSet<String> {
    let mut result = if !query.must.is_empty() {
        let mut clauses = query.must.iter();
        let mut acc = clauses
            .next()
            .map(|q| execute(contents, q))
            .unwrap_or_default();
        for clause in clauses {
            if acc.is_empty() {
                break;
            }
            let keys = execute(contents, clause);
            acc.retain(|k| keys.contains(k));
        }
        acc
    } else if !query.should.is_empty() {
        query
            .should
            .iter()
            .flat_map(|q| execute(contents, q))
            .collect()
    } else {
        contents.all()
    };

    for clause in &query.must_not {
        if result.is_empty() {
            break;
        }
        let excluded = execute(contents, clause);
        result.retain(|k| !excluded.contains(k));
    }
    result
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or(0.0)
            .total_cmp(&y.as_f64().unwrap_or(0.0)),
        (Some(Value::String(x)), Some(Value::String(y))) => {
            x.to_lowercase().cmp(&y.to_lowercase())
        }
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// Orders entries by the sort fields, then by key.
pub fn sort(entries: &mut [&IndexEntry], sorted_fields: &[SortedField]) {
    entries.sort_by(|a, b| {
        for sort in sorted_fields {
            let ordering = compare_values(a.first(&sort.field), b.first(&sort.field));
            let ordering = if sort.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.key.cmp(&b.key)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::definition::DOCUMENT_ID_FIELD;
    use crate::query::parser::QueryParser;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn contents() -> FullTextIndex {
        let mut index = FullTextIndex::new(BTreeMap::new());
        for (key, name, age) in [("a", "Ann", 30), ("b", "Bob", 25), ("c", "Cid", 41), ("d", "Ann", 19)] {
            let mut fields = BTreeMap::new();
            fields.insert("Name".to_string(), vec![json!(name)]);
            fields.insert("Age".to_string(), vec![json!(age)]);
            fields.insert(DOCUMENT_ID_FIELD.to_string(), vec![json!(key)]);
            index.index(IndexEntry {
                key: key.into(),
                document_key: Some(key.into()),
                fields,
            });
        }
        index
    }

    fn run(query: &str) -> Vec<String> {
        let query = QueryParser::new(None).parse(query).unwrap();
        execute(&contents(), &query).into_iter().collect()
    }

    #[test]
    fn boolean_evaluation() {
        assert_eq!(run("Name:ann"), vec!["a", "d"]);
        assert_eq!(run("Name:ann AND Age:[Ix20 TO NULL]"), vec!["a"]);
        assert_eq!(run("Name:bob OR Name:cid"), vec!["b", "c"]);
        assert_eq!(run("-Name:ann"), vec!["b", "c"]);
        assert_eq!(run("Name:ann -Age:30"), vec!["d"]);
        assert_eq!(run("*:*").len(), 4);
        assert_eq!(run("Name:a*"), vec!["a", "d"]);
    }

    #[test]
    fn sorting() {
        let contents = contents();
        let mut entries: Vec<&IndexEntry> = ["a", "b", "c", "d"]
            .iter()
            .filter_map(|k| contents.entry(k))
            .collect();

        sort(&mut entries, &[SortedField::parse("-Age")]);
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b", "d"]);

        sort(&mut entries, &[SortedField::parse("Name"), SortedField::parse("Age")]);
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["d", "a", "b", "c"]);
    }
}
