use tracing::{info, warn};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::adapter::{EntityRef, Rejection, TxOp};
use crate::attribute::Attribute;
use crate::datatype::{Codec, EntityId, TempId, Value, ValueType, Wire};
use crate::error::{FacetError, Result};
use crate::model::{Catalog, Db, Instance, Model};
use crate::validator::TransactionValidationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subject {
    Existing(EntityId),
    New(TempId),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Subject::Existing(id) => write!(f, "{}", id),
            Subject::New(t) => write!(f, "{}", t),
        }
    }
}

#[derive(Clone)]
enum Baseline {
    Instance(Instance),
    Defaults,
}

/// The staged new value of one attribute.
#[derive(Clone, Debug)]
pub enum Edit {
    Value(Value),
    /// A nested entity, created or edited in the same transaction.
    Sub(Box<Changer>),
    Many(Vec<Edit>),
}

impl Edit {
    /// The value as the changeset sees it; nested entities show as their id.
    pub fn current(&self) -> Value {
        match self {
            Edit::Value(v) => v.clone(),
            Edit::Sub(sub) => sub.id(),
            Edit::Many(edits) => Value::Set(edits.iter().map(Edit::current).collect()),
        }
    }
    fn validate(&self) -> Result<()> {
        match self {
            Edit::Value(_) => Ok(()),
            Edit::Sub(sub) => sub.validate(),
            Edit::Many(edits) => edits.iter().try_for_each(Edit::validate),
        }
    }
}

impl From<Value> for Edit {
    fn from(v: Value) -> Self {
        Edit::Value(v)
    }
}
impl From<Changer> for Edit {
    fn from(sub: Changer) -> Self {
        Edit::Sub(Box::new(sub))
    }
}
impl From<Instance> for Edit {
    fn from(instance: Instance) -> Self {
        Edit::Value(Value::Ref(instance))
    }
}
impl From<&Instance> for Edit {
    fn from(instance: &Instance) -> Self {
        Edit::Value(Value::Ref(instance.clone()))
    }
}

#[derive(Clone, Debug)]
pub struct Change {
    old: Value,
    new: Edit,
}

impl Change {
    pub fn old(&self) -> &Value {
        &self.old
    }
    pub fn new_value(&self) -> &Edit {
        &self.new
    }
    pub fn pair(&self) -> (Value, Value) {
        (self.old.clone(), self.new.current())
    }
}

// ------------- Changer -------------
/// Pending edits to one entity. Nothing reaches the store before
/// [`Changer::commit`], and the instance a changer was opened from is never
/// affected.
#[derive(Clone)]
pub struct Changer {
    model: Arc<Model>,
    catalog: Arc<Catalog>,
    subject: Subject,
    baseline: Baseline,
    changes: BTreeMap<String, Change>,
}

impl Changer {
    /// Changes for a new entity, starting from the model's defaults.
    pub fn create(catalog: &Arc<Catalog>, model: Arc<Model>) -> Result<Self> {
        let tempid = catalog.connection().tempid(model.partition())?;
        Ok(Self {
            model,
            catalog: Arc::clone(catalog),
            subject: Subject::New(tempid),
            baseline: Baseline::Defaults,
            changes: BTreeMap::new(),
        })
    }
    /// Changes to an existing entity, reading through to `instance`.
    pub fn edit(instance: &Instance) -> Self {
        Self {
            model: Arc::clone(instance.model()),
            catalog: Arc::clone(instance.db().catalog()),
            subject: Subject::Existing(instance.id()),
            baseline: Baseline::Instance(instance.clone()),
            changes: BTreeMap::new(),
        }
    }
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }
    pub fn subject(&self) -> Subject {
        self.subject
    }
    pub fn is_new(&self) -> bool {
        matches!(self.subject, Subject::New(_))
    }
    pub fn baseline(&self) -> Option<&Instance> {
        match &self.baseline {
            Baseline::Instance(instance) => Some(instance),
            Baseline::Defaults => None,
        }
    }
    pub fn id(&self) -> Value {
        match self.subject {
            Subject::Existing(id) => Value::Id(id),
            Subject::New(t) => Value::Temp(t),
        }
    }
    fn wire_id(&self) -> Wire {
        match self.subject {
            Subject::Existing(id) => Wire::Ref(id),
            Subject::New(t) => Wire::Temp(t),
        }
    }
    fn entity_ref(&self) -> EntityRef {
        match self.subject {
            Subject::Existing(id) => EntityRef::Id(id),
            Subject::New(t) => EntityRef::Temp(t),
        }
    }
    fn codec(&self, value_type: &ValueType) -> Result<Arc<dyn Codec>> {
        self.catalog.config().codecs().codec_for(value_type)
    }
    fn baseline_value(&self, attribute: &Attribute) -> Result<Value> {
        match &self.baseline {
            Baseline::Instance(instance) => instance.get(attribute.key()),
            Baseline::Defaults => Ok(attribute.default().clone()),
        }
    }

    /// The staged value, or the baseline one for unedited attributes.
    pub fn get(&self, key: &str) -> Result<Value> {
        let attribute = self.model.attribute(key)?;
        match self.changes.get(key) {
            Some(change) => Ok(change.new.current()),
            None => self.baseline_value(attribute),
        }
    }
    /// `(old, new)` for an edited attribute.
    pub fn change_in(&self, key: &str) -> Option<(Value, Value)> {
        self.changes.get(key).map(Change::pair)
    }
    pub fn changes(&self) -> impl Iterator<Item = (&str, &Change)> {
        self.changes.iter().map(|(k, c)| (k.as_str(), c))
    }
    pub fn is_changed(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Sets an attribute through the model's setter for it, which may be an
    /// override layered on the generated one.
    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) -> Result<()> {
        let entry = self.model.entry(key)?;
        let setter = Arc::clone(entry.setter());
        match entry.override_setter().cloned() {
            Some(override_setter) => override_setter(self, value.into(), &setter),
            None => setter(self, value.into()),
        }
    }
    /// The generated setter: type checks and stages the value.
    pub fn stage(&mut self, key: &str, value: Value) -> Result<()> {
        let attribute = Arc::clone(self.model.attribute(key)?);
        self.codec(attribute.value_type())?.dump(&value)?;
        self.record(&attribute, Edit::Value(value))
    }
    /// Stages a nested entity as the value of a reference attribute.
    pub fn set_sub(&mut self, key: &str, sub: Changer) -> Result<()> {
        let attribute = Arc::clone(self.model.attribute(key)?);
        check_sub(attribute.value_type(), &sub)?;
        self.record(&attribute, Edit::Sub(Box::new(sub)))
    }
    /// Stages the whole collection of a set attribute. Items may be values or
    /// nested entities.
    pub fn set_many<I, E>(&mut self, key: &str, items: I) -> Result<()>
    where
        I: IntoIterator<Item = E>,
        E: Into<Edit>,
    {
        let attribute = Arc::clone(self.model.attribute(key)?);
        let element = match attribute.value_type() {
            ValueType::Set(element) => element.as_ref().clone(),
            other => {
                return Err(FacetError::TypeMismatch {
                    expected: other.to_string(),
                    found: String::from("collection"),
                });
            }
        };
        let codec = self.codec(&element)?;
        let mut edits = Vec::new();
        for item in items {
            let edit = item.into();
            match &edit {
                Edit::Value(v) => {
                    codec.dump(v)?;
                }
                Edit::Sub(sub) => check_sub(&element, sub)?,
                Edit::Many(_) => {
                    return Err(FacetError::TypeMismatch {
                        expected: element.to_string(),
                        found: String::from("nested collection"),
                    });
                }
            }
            edits.push(edit);
        }
        self.record(&attribute, Edit::Many(edits))
    }
    /// Opens changes on the entity a reference points at (a new one when
    /// unset) and stages them as part of this changeset.
    pub fn change_ref<F>(&mut self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Changer) -> Result<()>,
    {
        let attribute = Arc::clone(self.model.attribute(key)?);
        let target = match (attribute.is_many(), attribute.value_type().ref_model()) {
            (false, Some(target)) => target.to_string(),
            _ => {
                return Err(FacetError::TypeMismatch {
                    expected: String::from("reference to a model"),
                    found: attribute.value_type().to_string(),
                });
            }
        };
        let mut sub = match self.changes.get(key).map(|c| &c.new) {
            Some(Edit::Sub(sub)) => (**sub).clone(),
            _ => match self.get(key)? {
                Value::Ref(instance) => Changer::edit(&instance),
                Value::Nil => Changer::create(&self.catalog, Arc::clone(self.catalog.model(&target)?))?,
                other => {
                    return Err(FacetError::TypeMismatch {
                        expected: attribute.value_type().to_string(),
                        found: format!("{} {}", other.kind(), other),
                    });
                }
            },
        };
        f(&mut sub)?;
        self.set_sub(key, sub)
    }
    fn record(&mut self, attribute: &Attribute, edit: Edit) -> Result<()> {
        let old = match self.changes.remove(attribute.key()) {
            Some(change) => change.old,
            None => self.baseline_value(attribute)?,
        };
        self.changes
            .insert(attribute.key().to_string(), Change { old, new: edit });
        Ok(())
    }

    /// Applies `f` without committing, e.g. to prepare a nested entity.
    pub fn change<F>(mut self, f: F) -> Result<Changer>
    where
        F: FnOnce(&mut Changer) -> Result<()>,
    {
        f(&mut self)?;
        Ok(self)
    }

    /// Runs the model's rules here and in every nested changeset.
    pub fn validate(&self) -> Result<()> {
        self.model.validator().require_valid(self)?;
        for change in self.changes.values() {
            change.new.validate()?;
        }
        Ok(())
    }

    /// The transaction these changes amount to, nested entities included.
    pub fn payload(&self) -> Result<Vec<TxOp>> {
        let mut ops = Vec::new();
        self.collect_ops(&mut ops)?;
        Ok(ops)
    }

    fn collect_ops(&self, ops: &mut Vec<TxOp>) -> Result<()> {
        let me = self.entity_ref();
        if self.is_new() {
            ops.push(TxOp::Assert {
                e: me,
                a: self.model.type_attribute().external_key().to_string(),
                v: Wire::Keyword(self.model.type_keyword()),
            });
            for attribute in self.model.attributes() {
                if attribute.is_reverse() || self.changes.contains_key(attribute.key()) {
                    continue;
                }
                let codec = self.codec(attribute.value_type().element())?;
                for wire in value_wires(attribute.default(), codec.as_ref())? {
                    ops.push(TxOp::Assert {
                        e: me,
                        a: attribute.external_key().to_string(),
                        v: wire,
                    });
                }
            }
        }
        for (key, change) in &self.changes {
            let attribute = self.model.attribute(key)?;
            let codec = self.codec(attribute.value_type().element())?;
            let new = edit_wires(&change.new, codec.as_ref(), ops)?;
            // defaults of a new entity were never written
            let old = if self.is_new() {
                Vec::new()
            } else {
                value_wires(&change.old, codec.as_ref())?
            };
            let added = new.iter().filter(|w| !old.contains(w));
            let removed = old.iter().filter(|w| !new.contains(w));
            match attribute.forward_key() {
                // the other side holds the fact
                Some(forward) => {
                    for w in added {
                        ops.push(TxOp::Assert { e: entity_of(w)?, a: forward.clone(), v: self.wire_id() });
                    }
                    for w in removed {
                        ops.push(TxOp::Retract { e: entity_of(w)?, a: forward.clone(), v: self.wire_id() });
                    }
                }
                None if attribute.is_many() => {
                    let a = attribute.external_key();
                    for w in added {
                        ops.push(TxOp::Assert { e: me, a: a.to_string(), v: w.clone() });
                    }
                    for w in removed {
                        ops.push(TxOp::Retract { e: me, a: a.to_string(), v: w.clone() });
                    }
                }
                None => {
                    let a = attribute.external_key().to_string();
                    match new.first() {
                        Some(w) => ops.push(TxOp::Assert { e: me, a, v: w.clone() }),
                        None => {
                            for w in &old {
                                ops.push(TxOp::Retract { e: me, a: a.clone(), v: w.clone() });
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Validates and submits; returns the entity as of the new snapshot.
    pub fn commit(self) -> Result<Instance> {
        self.validate()?;
        let ops = self.payload()?;
        info!(
            model = self.model.name(),
            subject = %self.subject,
            ops = ops.len(),
            "Submitting changes"
        );
        match self.catalog.connection().transact(ops) {
            Ok(report) => {
                let id = match self.subject {
                    Subject::Existing(id) => id,
                    Subject::New(t) => report.resolve(t).ok_or_else(|| {
                        FacetError::TransactionRejected(format!("{} was not resolved", t))
                    })?,
                };
                let db = Db::new(report.db_after, Arc::clone(&self.catalog));
                Ok(Instance::new(Arc::clone(&self.model), id, db))
            }
            Err(Rejection::Unique { attribute, value }) => {
                warn!(model = self.model.name(), %attribute, %value, "Uniqueness violated");
                let message = format!("value {} is already taken", value);
                Err(TransactionValidationError::new(self, &attribute, &message).into())
            }
            Err(Rejection::Other(message)) => Err(FacetError::TransactionRejected(message)),
        }
    }
}

impl fmt::Debug for Changer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Changer")
            .field("model", &self.model.name())
            .field("subject", &self.subject)
            .field("changes", &self.changes)
            .finish()
    }
}

fn check_sub(value_type: &ValueType, sub: &Changer) -> Result<()> {
    match value_type {
        ValueType::Ref(model) if model.as_deref().is_none_or(|m| m == sub.model().name()) => Ok(()),
        other => Err(FacetError::TypeMismatch {
            expected: other.to_string(),
            found: format!("changes to {}", sub.model().name()),
        }),
    }
}

fn value_wires(value: &Value, codec: &dyn Codec) -> Result<Vec<Wire>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Set(items) => items
            .iter()
            .filter(|v| !v.is_nil())
            .map(|v| codec.dump(v))
            .collect(),
        other => Ok(vec![codec.dump(other)?]),
    }
}

fn edit_wires(edit: &Edit, codec: &dyn Codec, ops: &mut Vec<TxOp>) -> Result<Vec<Wire>> {
    match edit {
        Edit::Value(v) => value_wires(v, codec),
        Edit::Sub(sub) => {
            sub.collect_ops(ops)?;
            Ok(vec![sub.wire_id()])
        }
        Edit::Many(edits) => {
            let mut wires = Vec::new();
            for edit in edits {
                for wire in edit_wires(edit, codec, ops)? {
                    if !wires.contains(&wire) {
                        wires.push(wire);
                    }
                }
            }
            Ok(wires)
        }
    }
}

fn entity_of(wire: &Wire) -> Result<EntityRef> {
    match wire {
        Wire::Ref(id) => Ok(EntityRef::Id(*id)),
        Wire::Temp(t) => Ok(EntityRef::Temp(*t)),
        other => Err(FacetError::TypeMismatch {
            expected: String::from("entity"),
            found: other.to_string(),
        }),
    }
}
