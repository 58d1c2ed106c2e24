use thiserror::Error;
use tracing::warn;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::changer::Changer;
use crate::datatype::Value;
use crate::error::Result;

/// Anything rules can read current attribute values from.
pub trait Values {
    fn value_of(&self, key: &str) -> Result<Value>;
}

impl Values for Changer {
    fn value_of(&self, key: &str) -> Result<Value> {
        self.get(key)
    }
}

impl Values for BTreeMap<String, Value> {
    fn value_of(&self, key: &str) -> Result<Value> {
        Ok(self.get(key).cloned().unwrap_or(Value::Nil))
    }
}

// ------------- Violations -------------
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub attrs: Vec<String>,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.attrs.join(", "), self.message)
    }
}

/// Handed to a check while it runs. Reports go to the rule's attributes
/// unless others are named.
pub struct Scope<'r> {
    attrs: &'r [String],
    reported: Vec<Violation>,
}

impl Scope<'_> {
    pub fn attrs(&self) -> &[String] {
        self.attrs
    }
    pub fn invalid<M: Into<String>>(&mut self, message: M) {
        self.reported.push(Violation {
            attrs: self.attrs.to_vec(),
            message: message.into(),
        });
    }
    pub fn invalid_on<M: Into<String>>(&mut self, attrs: &[&str], message: M) {
        self.reported.push(Violation {
            attrs: attrs.iter().map(|a| a.to_string()).collect(),
            message: message.into(),
        });
    }
}

// ------------- Rules -------------
pub type Check = Arc<dyn Fn(&mut Scope, &[Value]) + Send + Sync>;

#[derive(Clone)]
pub struct Rule {
    attrs: Vec<String>,
    check: Check,
}

impl Rule {
    pub fn new(attrs: &[&str], check: Check) -> Self {
        Self {
            attrs: attrs.iter().map(|a| a.to_string()).collect(),
            check,
        }
    }
    pub fn attrs(&self) -> &[String] {
        &self.attrs
    }
    /// Runs the check with the current values of exactly the declared
    /// attributes, in declaration order.
    pub fn run<V: Values + ?Sized>(&self, values: &V) -> Result<Vec<Violation>> {
        let mut current = Vec::with_capacity(self.attrs.len());
        for attr in &self.attrs {
            current.push(values.value_of(attr)?);
        }
        let mut scope = Scope {
            attrs: &self.attrs,
            reported: Vec::new(),
        };
        (self.check)(&mut scope, &current);
        Ok(scope.reported)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Rule").field("attrs", &self.attrs).finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Validator {
    rules: Vec<Rule>,
}

impl Validator {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }
    pub fn validate<F>(&mut self, attrs: &[&str], check: F) -> &mut Self
    where
        F: Fn(&mut Scope, &[Value]) + Send + Sync + 'static,
    {
        self.rules.push(Rule::new(attrs, Arc::new(check)));
        self
    }
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
    pub fn len(&self) -> usize {
        self.rules.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
    /// Every rule runs; nothing short-circuits. Violations come back in
    /// rule declaration order.
    pub fn run_all<V: Values + ?Sized>(&self, values: &V) -> Result<Vec<Violation>> {
        let mut violations = Vec::new();
        for rule in &self.rules {
            violations.extend(rule.run(values)?);
        }
        Ok(violations)
    }
    pub fn require_valid(&self, changes: &Changer) -> Result<()> {
        let errors = self.run_all(changes)?;
        if errors.is_empty() {
            return Ok(());
        }
        warn!(
            model = changes.model().name(),
            errors = errors.len(),
            "Changes failed validation"
        );
        Err(ValidationError::new(changes.clone(), errors).into())
    }
}

// ------------- Errors -------------
#[derive(Error, Debug)]
#[error("Validation failed: {}", .errors.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("; "))]
pub struct ValidationError {
    changes: Box<Changer>,
    errors: Vec<Violation>,
}

impl ValidationError {
    pub fn new(changes: Changer, errors: Vec<Violation>) -> Self {
        Self {
            changes: Box::new(changes),
            errors,
        }
    }
    pub fn changes(&self) -> &Changer {
        &self.changes
    }
    pub fn errors(&self) -> &[Violation] {
        &self.errors
    }
    pub fn errors_on(&self, key: &str) -> Vec<String> {
        self.errors
            .iter()
            .filter(|v| v.attrs.iter().any(|a| a == key))
            .map(|v| v.message.clone())
            .collect()
    }
    pub fn has_errors_on(&self, key: &str) -> bool {
        self.errors
            .iter()
            .any(|v| v.attrs.iter().any(|a| a == key))
    }
}

/// A constraint the store enforced at commit time.
#[derive(Error, Debug)]
#[error("Transaction failed validation on :{attribute}: {message}")]
pub struct TransactionValidationError {
    changes: Box<Changer>,
    attribute: String,
    message: String,
}

impl TransactionValidationError {
    pub fn new(changes: Changer, attribute: &str, message: &str) -> Self {
        Self {
            changes: Box::new(changes),
            attribute: attribute.to_string(),
            message: message.to_string(),
        }
    }
    pub fn changes(&self) -> &Changer {
        &self.changes
    }
    /// The store key that was violated.
    pub fn attribute(&self) -> &str {
        &self.attribute
    }
    pub fn message(&self) -> &str {
        &self.message
    }
    /// The violation, attributed to the local key when the model knows it.
    pub fn errors(&self) -> Vec<Violation> {
        let key = self
            .changes
            .model()
            .key_for(&self.attribute)
            .unwrap_or(self.attribute.as_str())
            .to_string();
        vec![Violation {
            attrs: vec![key],
            message: self.message.clone(),
        }]
    }
    pub fn errors_on(&self, key: &str) -> Vec<String> {
        if self.has_errors_on(key) {
            vec![self.message.clone()]
        } else {
            Vec::new()
        }
    }
    pub fn has_errors_on(&self, key: &str) -> bool {
        self.changes
            .model()
            .attribute(key)
            .is_ok_and(|a| a.external_key() == self.attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn all_rules_run_in_order() {
        let mut validator = Validator::new();
        validator
            .validate(&["foo"], |scope, values| {
                if values[0].as_str().is_some_and(|s| s.contains("invalid")) {
                    scope.invalid("must not contain the string 'invalid'");
                }
            })
            .validate(&["foo", "bar"], |scope, values| {
                if values[1].is_nil() {
                    scope.invalid_on(&["bar"], "is required");
                }
            });
        let errors = validator
            .run_all(&values(&[("foo", Value::from("invalid-foo"))]))
            .unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].attrs, vec!["foo"]);
        assert_eq!(errors[0].message, "must not contain the string 'invalid'");
        assert_eq!(errors[1].attrs, vec!["bar"]);
    }

    #[test]
    fn default_attribution_is_the_rule_attributes() {
        let mut validator = Validator::new();
        validator.validate(&["start", "end"], |scope, values| {
            if values[0] > values[1] {
                scope.invalid("start must not be after end");
            }
        });
        let errors = validator
            .run_all(&values(&[("start", Value::from(5)), ("end", Value::from(1))]))
            .unwrap();
        assert_eq!(errors[0].attrs, vec!["start", "end"]);
        let fine = validator
            .run_all(&values(&[("start", Value::from(1)), ("end", Value::from(5))]))
            .unwrap();
        assert!(fine.is_empty());
    }
}
