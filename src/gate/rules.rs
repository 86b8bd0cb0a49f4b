//! Declarative rule vocabulary for JSON artifacts.

use serde_json::Value;

use super::{Decision, GateInput, Validator};

/// One declarative check over a JSON document.
///
/// Field paths are dotted (`stats.total`). Rules other than the
/// `Required*` family ignore absent fields: an optional field that is
/// missing never blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// Field must be present and not null.
    Required(String),
    /// Field, when present, must be an integer ≥ 0.
    NonNegativeInt(String),
    /// Field, when present, must be one of `allowed`.
    OneOf { field: String, allowed: Vec<String> },
    /// Numeric `lhs` must not exceed numeric `rhs` when both are present.
    NotGreater { lhs: String, rhs: String },
    /// Field, when present, must be a non-empty array.
    NonEmptyArray(String),
    /// Every element of `array` must carry each of `fields`.
    EachRequired { array: String, fields: Vec<String> },
    /// Every element's `field`, when present, must be one of `allowed`.
    EachOneOf {
        array: String,
        field: String,
        allowed: Vec<String>,
    },
    /// When `field == equals`, `require` must be present.
    RequiredWhen {
        field: String,
        equals: String,
        require: String,
    },
}

struct Violation {
    reason: String,
    missing: Option<String>,
}

impl Violation {
    fn missing(item: String) -> Self {
        Self {
            reason: format!("missing required field {}", item),
            missing: Some(item),
        }
    }

    fn invalid(reason: String) -> Self {
        Self {
            reason,
            missing: None,
        }
    }
}

/// Look up a dotted path.
pub(crate) fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |value, key| value.get(key))
        .filter(|value| !value.is_null())
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Stable label for an array element in messages: its `id` if it has one.
fn element_label(array: &str, index: usize, element: &Value) -> String {
    element
        .get("id")
        .or_else(|| element.get("finding_id"))
        .and_then(as_text)
        .map(|id| format!("{}[{}]", array, id))
        .unwrap_or_else(|| format!("{}[{}]", array, index))
}

impl Rule {
    fn check(&self, doc: &Value, out: &mut Vec<Violation>) {
        match self {
            Rule::Required(field) => {
                if lookup(doc, field).is_none() {
                    out.push(Violation::missing(field.clone()));
                }
            }
            Rule::NonNegativeInt(field) => {
                if let Some(value) = lookup(doc, field) {
                    if value.as_u64().is_none() {
                        out.push(Violation::invalid(format!(
                            "{} must be a non-negative integer, got {}",
                            field, value
                        )));
                    }
                }
            }
            Rule::OneOf { field, allowed } => {
                if let Some(value) = lookup(doc, field) {
                    let ok = as_text(value).is_some_and(|v| allowed.contains(&v));
                    if !ok {
                        out.push(Violation::invalid(format!(
                            "{} must be one of [{}], got {}",
                            field,
                            allowed.join(", "),
                            value
                        )));
                    }
                }
            }
            Rule::NotGreater { lhs, rhs } => {
                let l = lookup(doc, lhs).and_then(Value::as_f64);
                let r = lookup(doc, rhs).and_then(Value::as_f64);
                if let (Some(l), Some(r)) = (l, r) {
                    if l > r {
                        out.push(Violation::invalid(format!(
                            "{} ({}) must not exceed {} ({})",
                            lhs, l, rhs, r
                        )));
                    }
                }
            }
            Rule::NonEmptyArray(field) => match lookup(doc, field) {
                Some(Value::Array(items)) if items.is_empty() => {
                    out.push(Violation::invalid(format!("{} must not be empty", field)));
                }
                Some(Value::Array(_)) | None => {}
                Some(other) => {
                    out.push(Violation::invalid(format!(
                        "{} must be an array, got {}",
                        field, other
                    )));
                }
            },
            Rule::EachRequired { array, fields } => {
                for (i, element) in elements(doc, array) {
                    for field in fields {
                        if lookup(element, field).is_none() {
                            let label = element_label(array, i, element);
                            out.push(Violation::missing(format!("{}.{}", label, field)));
                        }
                    }
                }
            }
            Rule::EachOneOf {
                array,
                field,
                allowed,
            } => {
                for (i, element) in elements(doc, array) {
                    if let Some(value) = lookup(element, field) {
                        if !as_text(value).is_some_and(|v| allowed.contains(&v)) {
                            out.push(Violation::invalid(format!(
                                "{}.{} must be one of [{}], got {}",
                                element_label(array, i, element),
                                field,
                                allowed.join(", "),
                                value
                            )));
                        }
                    }
                }
            }
            Rule::RequiredWhen {
                field,
                equals,
                require,
            } => {
                let triggered = lookup(doc, field)
                    .and_then(as_text)
                    .is_some_and(|v| &v == equals);
                if triggered && lookup(doc, require).is_none() {
                    out.push(Violation {
                        reason: format!("{} is required when {} is {}", require, field, equals),
                        missing: Some(require.clone()),
                    });
                }
            }
        }
    }
}

fn elements<'a>(doc: &'a Value, array: &str) -> impl Iterator<Item = (usize, &'a Value)> {
    lookup(doc, array)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
}

/// A named list of rules applied to one JSON document.
#[derive(Debug, Clone)]
pub struct RuleSet {
    name: String,
    rules: Vec<Rule>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl RuleSet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
        }
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn require(mut self, fields: &[&str]) -> Self {
        self.rules
            .extend(fields.iter().map(|f| Rule::Required(f.to_string())));
        self
    }

    pub fn non_negative(mut self, fields: &[&str]) -> Self {
        self.rules
            .extend(fields.iter().map(|f| Rule::NonNegativeInt(f.to_string())));
        self
    }

    pub fn one_of(self, field: &str, allowed: &[&str]) -> Self {
        self.rule(Rule::OneOf {
            field: field.to_string(),
            allowed: owned(allowed),
        })
    }

    pub fn not_greater(self, lhs: &str, rhs: &str) -> Self {
        self.rule(Rule::NotGreater {
            lhs: lhs.to_string(),
            rhs: rhs.to_string(),
        })
    }

    pub fn non_empty(self, field: &str) -> Self {
        self.rule(Rule::NonEmptyArray(field.to_string()))
    }

    pub fn each_require(self, array: &str, fields: &[&str]) -> Self {
        self.rule(Rule::EachRequired {
            array: array.to_string(),
            fields: owned(fields),
        })
    }

    pub fn each_one_of(self, array: &str, field: &str, allowed: &[&str]) -> Self {
        self.rule(Rule::EachOneOf {
            array: array.to_string(),
            field: field.to_string(),
            allowed: owned(allowed),
        })
    }

    pub fn require_when(self, field: &str, equals: &str, require: &str) -> Self {
        self.rule(Rule::RequiredWhen {
            field: field.to_string(),
            equals: equals.to_string(),
            require: require.to_string(),
        })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Apply every rule to `doc`.
    pub fn check(&self, doc: &Value) -> Decision {
        if !doc.is_object() {
            return Decision::block(
                format!("{}: document must be a JSON object", self.name),
                Vec::new(),
            );
        }
        let mut violations = Vec::new();
        for rule in &self.rules {
            rule.check(doc, &mut violations);
        }
        if violations.is_empty() {
            return Decision::Pass;
        }
        let reason = violations
            .iter()
            .map(|v| v.reason.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let missing = violations.into_iter().filter_map(|v| v.missing).collect();
        Decision::block(format!("{}: {}", self.name, reason), missing)
    }
}

impl Validator for RuleSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, input: &GateInput<'_>) -> Decision {
        match input.artifact.json() {
            Some(doc) => self.check(doc),
            None => Decision::block(
                format!("{}: {} is not a JSON document", self.name, input.artifact.reference()),
                Vec::new(),
            ),
        }
    }
}
