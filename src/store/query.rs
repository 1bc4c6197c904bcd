//! Query description and the matching / ordering rules shared by backends.

use serde_json::Value;
use std::cmp::Ordering;

use super::Document;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    /// Array field contains the value
    ArrayContains(String, Value),
    /// Field is strictly greater than the value
    Gt(String, Value),
    /// String field starts with the prefix
    StartsWith(String, String),
    /// At least one of the inner filters matches
    AnyOf(Vec<Filter>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Which store sequence breaks ties between equal sort keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TieBreak {
    /// Creation order; stable under later updates
    Created,
    /// Order of the last write to each document
    Updated,
    /// A sequence the writer stamped into this field (see `Patch::stamp_seq`),
    /// falling back to creation order where the field is absent
    Field(String),
}

impl TieBreak {
    fn key(&self, doc: &Document) -> u64 {
        match self {
            TieBreak::Created => doc.created_seq,
            TieBreak::Updated => doc.updated_seq,
            TieBreak::Field(name) => doc.field(name).and_then(Value::as_u64).unwrap_or(doc.created_seq),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
    pub tie_break: TieBreak,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: &str) -> Self {
        Query {
            collection: collection.to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction, tie_break: TieBreak) -> Self {
        self.order = Some(OrderBy {
            field: field.to_string(),
            direction,
            tie_break,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document in `self.collection` passes every filter.
    pub fn matches(&self, doc: &Document) -> bool {
        doc.path.collection() == self.collection && self.filters.iter().all(|f| filter_matches(f, doc))
    }

    /// Sort and truncate a matched result set in place.
    pub fn arrange(&self, docs: &mut Vec<Document>) {
        match &self.order {
            Some(order) => docs.sort_by(|a, b| {
                let primary = match (a.field(&order.field), b.field(&order.field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                let tie = order.tie_break.key(a).cmp(&order.tie_break.key(b));
                let combined = primary.then(tie);
                match order.direction {
                    Direction::Asc => combined,
                    Direction::Desc => combined.reverse(),
                }
            }),
            None => docs.sort_by_key(|d| d.created_seq),
        }
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
    }
}

fn filter_matches(filter: &Filter, doc: &Document) -> bool {
    match filter {
        Filter::Eq(field, value) => doc.field(field) == Some(value),
        Filter::ArrayContains(field, value) => doc
            .field(field)
            .and_then(Value::as_array)
            .map_or(false, |items| items.contains(value)),
        Filter::Gt(field, value) => doc
            .field(field)
            .and_then(|v| compare_values(v, value))
            .map_or(false, |ord| ord == Ordering::Greater),
        Filter::StartsWith(field, prefix) => doc
            .field(field)
            .and_then(Value::as_str)
            .map_or(false, |s| s.starts_with(prefix.as_str())),
        Filter::AnyOf(inner) => inner.iter().any(|f| filter_matches(f, doc)),
    }
}

/// Ordering between two JSON scalars of the same kind.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocPath, Fields};
    use serde_json::json;

    fn doc(id: &str, seq: u64, data: Value) -> Document {
        let data: Fields = match data {
            Value::Object(map) => map,
            _ => Fields::new(),
        };
        Document {
            path: DocPath::new("chats", id),
            created_seq: seq,
            updated_seq: seq,
            data,
        }
    }

    #[test]
    fn test_order_ties_use_sequence() {
        let query = Query::collection("chats").order_by("t", Direction::Asc, TieBreak::Created);
        let mut docs = vec![
            doc("b", 3, json!({ "t": 10 })),
            doc("a", 2, json!({ "t": 10 })),
            doc("c", 1, json!({ "t": 5 })),
        ];
        query.arrange(&mut docs);
        let ids: Vec<&str> = docs.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_descending_order_reverses_ties_too() {
        let query = Query::collection("chats").order_by("t", Direction::Desc, TieBreak::Updated);
        let mut docs = vec![doc("a", 1, json!({ "t": 10 })), doc("b", 2, json!({ "t": 10 }))];
        query.arrange(&mut docs);
        assert_eq!(docs[0].id(), "b");
    }

    #[test]
    fn test_field_tie_break_ignores_unrelated_writes() {
        let query = Query::collection("chats").order_by(
            "t",
            Direction::Desc,
            TieBreak::Field("summarySeq".into()),
        );
        // "a" was written last, but "b" carries the later stamp
        let mut docs = vec![
            doc("a", 9, json!({ "t": 10, "summarySeq": 4 })),
            doc("b", 2, json!({ "t": 10, "summarySeq": 6 })),
            doc("c", 5, json!({ "t": 10 })),
        ];
        query.arrange(&mut docs);
        let ids: Vec<&str> = docs.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_filters() {
        let d = doc("a", 1, json!({ "participants": ["x", "y"], "email": "amy@example.com", "t": 7 }));
        assert!(Query::collection("chats")
            .filter(Filter::ArrayContains("participants".into(), json!("x")))
            .matches(&d));
        assert!(!Query::collection("chats")
            .filter(Filter::ArrayContains("participants".into(), json!("z")))
            .matches(&d));
        assert!(Query::collection("chats")
            .filter(Filter::StartsWith("email".into(), "amy".into()))
            .matches(&d));
        assert!(!Query::collection("chats").filter(Filter::Gt("t".into(), json!(7))).matches(&d));
        assert!(Query::collection("chats")
            .filter(Filter::AnyOf(vec![
                Filter::Eq("t".into(), json!(1)),
                Filter::Eq("t".into(), json!(7)),
            ]))
            .matches(&d));
        assert!(!Query::collection("users").matches(&d));
    }
}
