use bimap::BiMap;
use lazy_static::lazy_static;
use regex::Regex;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::adapter::{AttributeSchema, Cardinality};
use crate::changer::Changer;
use crate::construct::{OtherHasher, reverse_of};
use crate::datatype::{Value, ValueType};
use crate::error::{FacetError, Result};
use crate::finder::Finder;
use crate::model::Instance;

lazy_static! {
    // namespace/name, where a leading underscore in the name marks a reverse key
    static ref EXTERNAL_KEY: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]*/_?[A-Za-z0-9][A-Za-z0-9_\-?*!]*$").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Unique {
    #[default]
    None,
    Value,
    Identity,
}

/// Optional parts of an attribute definition.
#[derive(Clone, Debug, Default)]
pub struct AttributeOptions {
    /// Store key; derived from the namespace, model and key when absent.
    pub external_key: Option<String>,
    pub unique: Unique,
    pub default: Option<Value>,
    pub doc: Option<String>,
}

impl AttributeOptions {
    pub fn external_key(mut self, key: &str) -> Self {
        self.external_key = Some(key.trim_start_matches(':').to_string());
        self
    }
    pub fn unique(mut self, unique: Unique) -> Self {
        self.unique = unique;
        self
    }
    pub fn default_value<V: Into<Value>>(mut self, value: V) -> Self {
        self.default = Some(value.into());
        self
    }
    pub fn doc(mut self, doc: &str) -> Self {
        self.doc = Some(doc.to_string());
        self
    }
}

// ------------- Attribute -------------
#[derive(Debug, PartialEq, Eq)]
pub struct Attribute {
    model: String,
    key: String,
    external_key: String,
    value_type: ValueType,
    unique: Unique,
    default: Value,
    doc: Option<String>,
    system: bool,
}

impl Attribute {
    pub fn new(
        namespace: &str,
        model: &str,
        key: &str,
        value_type: ValueType,
        options: AttributeOptions,
    ) -> Result<Self> {
        let external_key = options.external_key.unwrap_or_else(|| {
            format!("{}.{}/{}", namespace, model, key.replace('_', "-"))
        });
        if !EXTERNAL_KEY.is_match(&external_key) {
            return Err(FacetError::Parse {
                message: format!("Invalid external key :{} for {}.{}", external_key, model, key),
            });
        }
        let default = options.default.unwrap_or_else(|| {
            if value_type.is_many() {
                Value::Set(Default::default())
            } else {
                Value::Nil
            }
        });
        Ok(Self {
            model: model.to_string(),
            key: key.to_string(),
            external_key,
            value_type,
            unique: options.unique,
            default,
            doc: options.doc,
            system: false,
        })
    }
    /// The marker attribute every model asserts on the entities it creates.
    pub(crate) fn type_marker(namespace: &str, model: &str) -> Self {
        Self {
            model: model.to_string(),
            key: String::from("_type"),
            external_key: format!("{}/type", namespace),
            value_type: ValueType::keyword(),
            unique: Unique::None,
            default: Value::Nil,
            doc: None,
            system: true,
        }
    }
    pub fn model(&self) -> &str {
        &self.model
    }
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn external_key(&self) -> &str {
        &self.external_key
    }
    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }
    pub fn unique(&self) -> Unique {
        self.unique
    }
    pub fn default(&self) -> &Value {
        &self.default
    }
    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }
    pub fn is_system(&self) -> bool {
        self.system
    }
    pub fn is_many(&self) -> bool {
        self.value_type.is_many()
    }
    /// Reverse attributes read a forward reference from the other side.
    pub fn is_reverse(&self) -> bool {
        reverse_of(&self.external_key).is_some()
    }
    pub fn forward_key(&self) -> Option<String> {
        reverse_of(&self.external_key)
    }
    /// What the store needs to know about this attribute. Reverse attributes
    /// have no schema of their own.
    pub fn schema(&self) -> Option<AttributeSchema> {
        if self.is_reverse() {
            return None;
        }
        Some(AttributeSchema {
            ident: self.external_key.clone(),
            cardinality: if self.is_many() {
                Cardinality::Many
            } else {
                Cardinality::One
            },
            unique: self.unique != Unique::None,
            is_ref: self.value_type.is_ref(),
            doc: self.doc.clone(),
        })
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{} (:{} {})", self.model, self.key, self.external_key, self.value_type)
    }
}

// ------------- Accessors -------------
pub type FinderFn = Arc<dyn Fn(&Finder, Value) -> Result<Vec<Instance>> + Send + Sync>;
pub type SetterFn = Arc<dyn Fn(&mut Changer, Value) -> Result<()> + Send + Sync>;
/// Receives the base setter so it can layer behavior on top of it.
pub type OverrideFn = Arc<dyn Fn(&mut Changer, Value, &SetterFn) -> Result<()> + Send + Sync>;

/// One registered attribute along with the accessors generated for it.
#[derive(Clone)]
pub struct AttributeEntry {
    attribute: Arc<Attribute>,
    by: FinderFn,
    setter: SetterFn,
    override_setter: Option<OverrideFn>,
}

impl AttributeEntry {
    fn generate(attribute: Arc<Attribute>) -> Self {
        let key = attribute.key().to_string();
        let by: FinderFn = Arc::new(move |finder: &Finder, value: Value| {
            finder.filter([(key.as_str(), value)])
        });
        let key = attribute.key().to_string();
        let setter: SetterFn =
            Arc::new(move |changer: &mut Changer, value: Value| changer.stage(&key, value));
        Self {
            attribute,
            by,
            setter,
            override_setter: None,
        }
    }
    pub fn attribute(&self) -> &Arc<Attribute> {
        &self.attribute
    }
    pub fn by(&self) -> &FinderFn {
        &self.by
    }
    pub fn setter(&self) -> &SetterFn {
        &self.setter
    }
    pub fn override_setter(&self) -> Option<&OverrideFn> {
        self.override_setter.as_ref()
    }
}

impl fmt::Debug for AttributeEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AttributeEntry")
            .field("attribute", &self.attribute)
            .field("overridden", &self.override_setter.is_some())
            .finish()
    }
}

// ------------- Registry -------------
/// Attributes of one model, in definition order.
#[derive(Debug)]
pub struct AttributeRegistry {
    model: String,
    entries: Vec<AttributeEntry>,
    index: HashMap<String, usize, OtherHasher>,
    // key <-> external key
    keys: BiMap<String, String>,
}

impl AttributeRegistry {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            entries: Vec::new(),
            index: HashMap::default(),
            keys: BiMap::new(),
        }
    }
    pub fn define(&mut self, attribute: Attribute) -> Result<Arc<Attribute>> {
        if self.keys.contains_left(attribute.key()) || self.keys.contains_right(attribute.external_key()) {
            return Err(FacetError::DuplicateAttribute {
                model: self.model.clone(),
                key: attribute.key().to_string(),
            });
        }
        self.keys.insert(
            attribute.key().to_string(),
            attribute.external_key().to_string(),
        );
        let attribute = Arc::new(attribute);
        self.index
            .insert(attribute.key().to_string(), self.entries.len());
        self.entries
            .push(AttributeEntry::generate(Arc::clone(&attribute)));
        Ok(attribute)
    }
    pub fn entry(&self, key: &str) -> Result<&AttributeEntry> {
        self.index
            .get(key)
            .map(|i| &self.entries[*i])
            .ok_or_else(|| FacetError::UndefinedAttribute {
                model: self.model.clone(),
                key: key.to_string(),
            })
    }
    pub fn get(&self, key: &str) -> Result<&Arc<Attribute>> {
        self.entry(key).map(|e| e.attribute())
    }
    pub fn override_setter(&mut self, key: &str, setter: OverrideFn) -> Result<()> {
        let index = *self
            .index
            .get(key)
            .ok_or_else(|| FacetError::UndefinedAttribute {
                model: self.model.clone(),
                key: key.to_string(),
            })?;
        self.entries[index].override_setter = Some(setter);
        Ok(())
    }
    /// Local key for a store key.
    pub fn key_for(&self, external_key: &str) -> Option<&str> {
        self.keys
            .get_by_right(external_key.trim_start_matches(':'))
            .map(|k| k.as_str())
    }
    pub fn external_key_for(&self, key: &str) -> Option<&str> {
        self.keys.get_by_left(key).map(|k| k.as_str())
    }
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Attribute>> {
        self.entries.iter().map(|e| e.attribute())
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
