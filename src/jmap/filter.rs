//! `Email/query` filter trees
//!
//! A filter is either a condition or an operator combining nested filters,
//! encoded the way RFC 8620 §5.5 puts them on the wire: operators carry an
//! `operator` member, conditions never do.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filter element: `Condition | Operator(AND|OR|NOT, [Filter…])`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmailFilter {
    Operator(FilterOperator),
    Condition(EmailFilterCondition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operator {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterOperator {
    pub operator: Operator,
    pub conditions: Vec<EmailFilter>,
}

/// `Email/query` filter condition (RFC 8621 §4.4.1)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EmailFilterCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_mailbox: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub in_mailbox_other_than: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_in_thread_have_keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub some_in_thread_have_keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub none_in_thread_have_keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_attachment: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bcc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub header: Vec<String>,
}

impl EmailFilterCondition {
    /// Whether the condition contains a full-text criterion that
    /// `SearchSnippet/get` can highlight
    pub fn wants_snippets(&self) -> bool {
        self.text.is_some() || self.subject.is_some() || self.body.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl EmailFilter {
    pub fn and(conditions: Vec<EmailFilter>) -> Self {
        Self::Operator(FilterOperator {
            operator: Operator::And,
            conditions,
        })
    }

    pub fn or(conditions: Vec<EmailFilter>) -> Self {
        Self::Operator(FilterOperator {
            operator: Operator::Or,
            conditions,
        })
    }

    pub fn not(conditions: Vec<EmailFilter>) -> Self {
        Self::Operator(FilterOperator {
            operator: Operator::Not,
            conditions,
        })
    }
}

impl From<EmailFilterCondition> for EmailFilter {
    fn from(condition: EmailFilterCondition) -> Self {
        Self::Condition(condition)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_operator_trees_in_wire_format() {
        let filter = EmailFilter::and(vec![
            EmailFilterCondition {
                in_mailbox: Some("m1".to_owned()),
                ..Default::default()
            }
            .into(),
            EmailFilter::or(vec![
                EmailFilterCondition {
                    from: Some("a@example.com".to_owned()),
                    ..Default::default()
                }
                .into(),
            ]),
        ]);
        assert_eq!(
            serde_json::to_value(&filter).expect("serialize"),
            json!({
                "operator": "AND",
                "conditions": [
                    { "inMailbox": "m1" },
                    { "operator": "OR", "conditions": [ { "from": "a@example.com" } ] }
                ]
            })
        );
    }

    #[test]
    fn rejects_objects_matching_neither_variant() {
        let err = serde_json::from_value::<EmailFilter>(json!({ "operator": "XOR", "conditions": [] }));
        assert!(err.is_err());
        let err = serde_json::from_value::<EmailFilter>(json!({ "unknownProperty": 1 }));
        assert!(err.is_err());
        let ok = serde_json::from_value::<EmailFilter>(json!({ "hasKeyword": "$seen" }))
            .expect("condition");
        assert!(matches!(ok, EmailFilter::Condition(c) if c.has_keyword.as_deref() == Some("$seen")));
    }
}
