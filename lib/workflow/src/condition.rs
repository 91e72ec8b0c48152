//! Condition evaluation for branching nodes.
//!
//! Conditional split nodes carry groups of `{field, operator, value}`
//! conditions. Conditions are combined with and/or inside a group, and
//! groups are combined with a group-level operator. Evaluation is pure:
//! it reads the contact and the enrollment's execution data and never
//! touches storage.
//!
//! This module also owns the `{{path}}` resolution used by message
//! templates and workflow boundary mappings, so every feature that reads
//! a field resolves it the same way.

use crate::contact::Contact;
use crate::execution::ExecutionData;
use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// How conditions within a group, or groups within a split, are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// Comparison operators available to conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
}

impl ConditionOperator {
    /// Applies the operator to a resolved field value.
    ///
    /// Missing fields behave as empty values. Numeric comparisons coerce
    /// both sides to numbers and evaluate to false when either side does
    /// not coerce.
    #[must_use]
    pub fn apply(self, actual: Option<&JsonValue>, expected: &JsonValue) -> bool {
        match self {
            Self::Equals => loose_eq(actual, expected),
            Self::NotEquals => !loose_eq(actual, expected),
            Self::Contains => contains_value(actual, expected),
            Self::NotContains => !contains_value(actual, expected),
            Self::GreaterThan => match (actual.and_then(value_to_f64), value_to_f64(expected)) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            Self::LessThan => match (actual.and_then(value_to_f64), value_to_f64(expected)) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            Self::IsEmpty => is_empty_value(actual),
            Self::IsNotEmpty => !is_empty_value(actual),
        }
    }
}

/// A single field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Field path, resolved against contact and execution data.
    pub field: String,
    /// Comparison to apply.
    pub operator: ConditionOperator,
    /// Right-hand side of the comparison. Ignored by the emptiness operators.
    #[serde(default)]
    pub value: JsonValue,
}

impl Condition {
    /// Evaluates this condition against a contact and execution data.
    #[must_use]
    pub fn evaluate(&self, contact: &Contact, data: &ExecutionData) -> bool {
        let actual = resolve_path(&self.field, contact, data);
        self.operator.apply(actual.as_ref(), &self.value)
    }
}

/// A group of conditions combined with a single logical operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    /// How conditions within this group combine. Defaults to `and`.
    #[serde(default)]
    pub operator: LogicalOperator,
    /// The conditions in this group.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    /// Evaluates the group. An empty group evaluates to true.
    #[must_use]
    pub fn evaluate(&self, contact: &Contact, data: &ExecutionData) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        match self.operator {
            LogicalOperator::And => self.conditions.iter().all(|c| c.evaluate(contact, data)),
            LogicalOperator::Or => self.conditions.iter().any(|c| c.evaluate(contact, data)),
        }
    }
}

/// Configuration for a conditional split node.
///
/// Accepts two wire shapes: the grouped form with `condition_groups`, and
/// a legacy single-condition form with bare `field`/`operator`/`value`
/// keys, which is normalized into one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ConditionalSplitRepr")]
pub struct ConditionalSplitData {
    /// Groups of conditions.
    pub condition_groups: Vec<ConditionGroup>,
    /// How groups combine in two-way mode. Defaults to `or`.
    pub group_operator: LogicalOperator,
    /// When true, each group routes to its own branch handle.
    pub multi_branch: bool,
}

impl Default for ConditionalSplitData {
    fn default() -> Self {
        Self {
            condition_groups: Vec::new(),
            group_operator: LogicalOperator::Or,
            multi_branch: false,
        }
    }
}

/// The result of evaluating a conditional split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOutcome {
    /// Whether any group matched.
    pub matched: bool,
    /// The branch handle to follow: `true`/`false` in two-way mode,
    /// `group_<index>`/`else` in multi-branch mode.
    pub branch: String,
}

impl ConditionalSplitData {
    /// Evaluates the split and picks a branch handle.
    ///
    /// A split with no condition groups routes to the `true` branch.
    /// In multi-branch mode the first matching group wins.
    #[must_use]
    pub fn evaluate(&self, contact: &Contact, data: &ExecutionData) -> SplitOutcome {
        if self.multi_branch {
            for (index, group) in self.condition_groups.iter().enumerate() {
                if group.evaluate(contact, data) {
                    return SplitOutcome {
                        matched: true,
                        branch: format!("group_{index}"),
                    };
                }
            }
            return SplitOutcome {
                matched: false,
                branch: "else".to_string(),
            };
        }

        let matched = if self.condition_groups.is_empty() {
            true
        } else {
            match self.group_operator {
                LogicalOperator::And => self
                    .condition_groups
                    .iter()
                    .all(|g| g.evaluate(contact, data)),
                LogicalOperator::Or => self
                    .condition_groups
                    .iter()
                    .any(|g| g.evaluate(contact, data)),
            }
        };
        SplitOutcome {
            matched,
            branch: if matched { "true" } else { "false" }.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConditionalSplitRepr {
    Legacy {
        field: String,
        operator: ConditionOperator,
        #[serde(default)]
        value: JsonValue,
    },
    Grouped {
        #[serde(default, alias = "conditionGroups")]
        condition_groups: Vec<ConditionGroup>,
        #[serde(default = "default_group_operator", alias = "groupOperator")]
        group_operator: LogicalOperator,
        #[serde(default, alias = "multiBranch")]
        multi_branch: bool,
    },
}

fn default_group_operator() -> LogicalOperator {
    LogicalOperator::Or
}

impl From<ConditionalSplitRepr> for ConditionalSplitData {
    fn from(repr: ConditionalSplitRepr) -> Self {
        match repr {
            ConditionalSplitRepr::Legacy {
                field,
                operator,
                value,
            } => Self {
                condition_groups: vec![ConditionGroup {
                    operator: LogicalOperator::And,
                    conditions: vec![Condition {
                        field,
                        operator,
                        value,
                    }],
                }],
                group_operator: LogicalOperator::Or,
                multi_branch: false,
            },
            ConditionalSplitRepr::Grouped {
                condition_groups,
                group_operator,
                multi_branch,
            } => Self {
                condition_groups,
                group_operator,
                multi_branch,
            },
        }
    }
}

/// Resolves a dotted field path against a contact and execution data.
///
/// Resolution order:
/// - `contact.<field>` and bare names resolve contact core fields
///   (`first_name`, `last_name`, `email`, `phone`, `status`,
///   `do_not_contact`, `tags`), then custom fields
/// - `custom.<path>` resolves contact custom fields
/// - `execution.<path>` resolves the enrollment's execution data
/// - `<node_id>.<path>` resolves outputs recorded by a sub-workflow call node
///
/// Returns `None` when the path does not resolve.
#[must_use]
pub fn resolve_path(path: &str, contact: &Contact, data: &ExecutionData) -> Option<JsonValue> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    if let Some(rest) = path.strip_prefix("contact.") {
        return contact
            .core_field(rest)
            .or_else(|| lookup_custom(contact, rest));
    }
    if let Some(rest) = path.strip_prefix("custom.") {
        return lookup_custom(contact, rest);
    }
    if let Some(rest) = path.strip_prefix("execution.") {
        return data.lookup(rest);
    }

    if let Some(value) = contact.core_field(path) {
        return Some(value);
    }
    if let Some((head, rest)) = path.split_once('.') {
        if let Some(call) = data.sub_workflows.get(&NodeId::from(head)) {
            let outputs = call.outputs.as_ref()?;
            let (first, remainder) = match rest.split_once('.') {
                Some((f, r)) => (f, Some(r)),
                None => (rest, None),
            };
            let root = outputs.get(first)?;
            return match remainder {
                Some(r) => walk_value(root, r).cloned(),
                None => Some(root.clone()),
            };
        }
    }
    lookup_custom(contact, path)
}

/// Evaluates a mapping value: a whole-string `{{path}}` expression resolves
/// to the referenced value preserving its type, a string with embedded
/// placeholders renders as text, and anything else passes through as a
/// literal.
#[must_use]
pub fn evaluate_value_expression(
    expr: &JsonValue,
    contact: &Contact,
    data: &ExecutionData,
) -> JsonValue {
    let JsonValue::String(text) = expr else {
        return expr.clone();
    };
    let trimmed = text.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !inner.contains("{{") {
            return resolve_path(inner, contact, data).unwrap_or(JsonValue::Null);
        }
    }
    if text.contains("{{") {
        JsonValue::String(render_template(text, contact, data))
    } else {
        expr.clone()
    }
}

/// Renders `{{path}}` placeholders in a text template.
///
/// Unresolved placeholders render as empty strings.
#[must_use]
pub fn render_template(text: &str, contact: &Contact, data: &ExecutionData) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = &after[..end];
                if let Some(value) = resolve_path(path, contact, data) {
                    out.push_str(&value_to_text(&value));
                }
                rest = &after[end + 2..];
            }
            None => {
                // unterminated placeholder, emit verbatim
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup_custom(contact: &Contact, path: &str) -> Option<JsonValue> {
    let (first, rest) = match path.split_once('.') {
        Some((f, r)) => (f, Some(r)),
        None => (path, None),
    };
    let root = contact.custom_fields.get(first)?;
    match rest {
        Some(r) => walk_value(root, r).cloned(),
        None => Some(root.clone()),
    }
}

/// Walks a dotted path through nested JSON objects.
pub(crate) fn walk_value<'a>(root: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(root, |value, segment| value.get(segment))
}

/// Formats a value the way it appears in rendered text and string
/// comparisons.
#[must_use]
pub fn value_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_to_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(actual: Option<&JsonValue>, expected: &JsonValue) -> bool {
    // Compare numerically when both sides coerce, otherwise as text.
    if let (Some(a), Some(b)) = (actual.and_then(value_to_f64), value_to_f64(expected)) {
        return a == b;
    }
    let actual_text = actual.map(value_to_text).unwrap_or_default();
    actual_text == value_to_text(expected)
}

fn contains_value(actual: Option<&JsonValue>, expected: &JsonValue) -> bool {
    match actual {
        Some(JsonValue::Array(items)) => {
            let needle = value_to_text(expected);
            items.iter().any(|item| value_to_text(item) == needle)
        }
        Some(JsonValue::String(haystack)) => haystack.contains(&value_to_text(expected)),
        _ => false,
    }
}

fn is_empty_value(actual: Option<&JsonValue>) -> bool {
    match actual {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.is_empty(),
        Some(JsonValue::Array(items)) => items.is_empty(),
        Some(JsonValue::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}
