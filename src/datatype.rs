// used for instants in values and transaction times
use chrono::{DateTime, SecondsFormat, Utc};
// wire values are serialized when the transaction log is persisted
use serde::{Deserialize, Serialize};

// used to print out readable forms of a value
use std::fmt;
use std::hash::{Hash, Hasher};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::construct::OtherHasher;
use crate::error::{FacetError, Result};
use crate::model::{Db, Instance};

// ------------- Identities -------------
pub type EntityId = u64;

/// Placeholder for an entity that does not exist yet. Resolved to an
/// [`EntityId`] by a successful transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TempId(pub i64);

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#tmp[{}]", self.0)
    }
}

// ------------- Wire values -------------
// What actually crosses the adapter boundary. Keywords are kept without the
// leading colon.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Wire {
    Nil,
    Boolean(bool),
    Long(i64),
    String(String),
    Keyword(String),
    Instant(DateTime<Utc>),
    Ref(EntityId),
    Temp(TempId),
    Set(Vec<Wire>),
}

impl Wire {
    pub fn is_nil(&self) -> bool {
        matches!(self, Wire::Nil)
    }
    pub fn kind(&self) -> &'static str {
        match self {
            Wire::Nil => "nil",
            Wire::Boolean(_) => "boolean",
            Wire::Long(_) => "long",
            Wire::String(_) => "string",
            Wire::Keyword(_) => "keyword",
            Wire::Instant(_) => "instant",
            Wire::Ref(_) => "ref",
            Wire::Temp(_) => "tempid",
            Wire::Set(_) => "set",
        }
    }
}

impl fmt::Display for Wire {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Wire::Nil => write!(f, "nil"),
            Wire::Boolean(b) => write!(f, "{}", b),
            Wire::Long(l) => write!(f, "{}", l),
            Wire::String(s) => write!(f, "{:?}", s),
            Wire::Keyword(k) => write!(f, ":{}", k),
            Wire::Instant(i) => write!(f, "#inst {:?}", i.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Wire::Ref(id) => write!(f, "{}", id),
            Wire::Temp(t) => write!(f, "{}", t),
            Wire::Set(items) => {
                let items: Vec<String> = items.iter().map(|w| w.to_string()).collect();
                write!(f, "#{{{}}}", items.join(" "))
            }
        }
    }
}

// ------------- Values -------------
/// The in-memory form of an attribute value.
///
/// `Id`, `Temp` and `Ref` all denote entities and compare by id, so a loaded
/// [`Instance`] equals the raw id it was loaded from.
#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Boolean(bool),
    Long(i64),
    String(String),
    Keyword(String),
    Instant(DateTime<Utc>),
    Id(EntityId),
    Temp(TempId),
    Ref(Instance),
    Set(BTreeSet<Value>),
}

impl Value {
    pub fn keyword(k: &str) -> Value {
        Value::Keyword(k.trim_start_matches(':').to_string())
    }
    pub fn set<I, V>(items: I) -> Value
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::Set(items.into_iter().map(Into::into).collect())
    }
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            Value::Ref(instance) => Some(instance),
            _ => None,
        }
    }
    pub fn into_instance(self) -> Option<Instance> {
        match self {
            Value::Ref(instance) => Some(instance),
            _ => None,
        }
    }
    pub fn as_set(&self) -> Option<&BTreeSet<Value>> {
        match self {
            Value::Set(items) => Some(items),
            _ => None,
        }
    }
    /// Id of the referenced entity, if this value is a committed reference.
    pub fn ref_id(&self) -> Option<EntityId> {
        match self {
            Value::Id(id) => Some(*id),
            Value::Ref(instance) => Some(instance.id()),
            _ => None,
        }
    }
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Long(_) => "long",
            Value::String(_) => "string",
            Value::Keyword(_) => "keyword",
            Value::Instant(_) => "instant",
            Value::Id(_) => "id",
            Value::Temp(_) => "tempid",
            Value::Ref(_) => "ref",
            Value::Set(_) => "set",
        }
    }
    fn rank(&self) -> u8 {
        match self {
            Value::Nil => 0,
            Value::Boolean(_) => 1,
            Value::Long(_) => 2,
            Value::String(_) => 3,
            Value::Keyword(_) => 4,
            Value::Instant(_) => 5,
            Value::Id(_) | Value::Temp(_) | Value::Ref(_) => 6,
            Value::Set(_) => 7,
        }
    }
    // temporary ids sort before committed ones
    fn entity_key(&self) -> Option<(u8, i128)> {
        match self {
            Value::Temp(t) => Some((0, t.0 as i128)),
            Value::Id(id) => Some((1, *id as i128)),
            Value::Ref(instance) => Some((1, instance.id() as i128)),
            _ => None,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Nil, Value::Nil) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Keyword(a), Value::Keyword(b)) => a.cmp(b),
            (Value::Instant(a), Value::Instant(b)) => a.cmp(b),
            (Value::Set(a), Value::Set(b)) => a.cmp(b),
            _ => match (self.entity_key(), other.entity_key()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }
}
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Value {}
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Nil => (),
            Value::Boolean(b) => b.hash(state),
            Value::Long(l) => l.hash(state),
            Value::String(s) | Value::Keyword(s) => s.hash(state),
            Value::Instant(i) => i.hash(state),
            Value::Set(items) => items.hash(state),
            Value::Id(_) | Value::Temp(_) | Value::Ref(_) => self.entity_key().hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Long(l) => write!(f, "{}", l),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Keyword(k) => write!(f, ":{}", k),
            Value::Instant(i) => write!(f, "{}", i.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::Id(id) => write!(f, "#<{}>", id),
            Value::Temp(t) => write!(f, "#<{}>", t),
            // referenced instances are not expanded, which bounds the output
            Value::Ref(instance) => write!(f, "#<{}>", instance.id()),
            Value::Set(items) => {
                let items: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "#{{{}}}", items.join(", "))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
impl From<i64> for Value {
    fn from(l: i64) -> Self {
        Value::Long(l)
    }
}
impl From<i32> for Value {
    fn from(l: i32) -> Self {
        Value::Long(l as i64)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
impl From<DateTime<Utc>> for Value {
    fn from(i: DateTime<Utc>) -> Self {
        Value::Instant(i)
    }
}
impl From<Instance> for Value {
    fn from(instance: Instance) -> Self {
        Value::Ref(instance)
    }
}
impl From<&Instance> for Value {
    fn from(instance: &Instance) -> Self {
        Value::Ref(instance.clone())
    }
}
impl From<TempId> for Value {
    fn from(t: TempId) -> Self {
        Value::Temp(t)
    }
}
impl<V: Into<Value>> From<Option<V>> for Value {
    fn from(v: Option<V>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nil)
    }
}

// ------------- Value types -------------
/// Semantic type of an attribute. Scalars are looked up by tag in the
/// [`CodecRegistry`]; the composite types are built from their parts.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Scalar(String),
    /// Reference to another entity, optionally of a named model.
    Ref(Option<String>),
    Set(Box<ValueType>),
    Enum(Vec<String>),
}

impl ValueType {
    pub fn scalar(tag: &str) -> Self {
        ValueType::Scalar(tag.to_string())
    }
    pub fn string() -> Self {
        Self::scalar(StringCodec::DATA_TYPE)
    }
    pub fn long() -> Self {
        Self::scalar(LongCodec::DATA_TYPE)
    }
    pub fn boolean() -> Self {
        Self::scalar(BooleanCodec::DATA_TYPE)
    }
    pub fn keyword() -> Self {
        Self::scalar(KeywordCodec::DATA_TYPE)
    }
    pub fn instant() -> Self {
        Self::scalar(InstantCodec::DATA_TYPE)
    }
    pub fn reference(model: &str) -> Self {
        ValueType::Ref(Some(model.to_string()))
    }
    pub fn any_ref() -> Self {
        ValueType::Ref(None)
    }
    pub fn set_of(element: ValueType) -> Self {
        ValueType::Set(Box::new(element))
    }
    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ValueType::Enum(
            values
                .into_iter()
                .map(|v| v.as_ref().trim_start_matches(':').to_string())
                .collect(),
        )
    }
    pub fn is_many(&self) -> bool {
        matches!(self, ValueType::Set(_))
    }
    pub fn is_ref(&self) -> bool {
        matches!(self.element(), ValueType::Ref(_))
    }
    /// The type of a single fact: the element type for sets, else itself.
    pub fn element(&self) -> &ValueType {
        match self {
            ValueType::Set(inner) => inner,
            other => other,
        }
    }
    pub fn ref_model(&self) -> Option<&str> {
        match self.element() {
            ValueType::Ref(model) => model.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValueType::Scalar(tag) => write!(f, "{}", tag),
            ValueType::Ref(Some(model)) => write!(f, "ref<{}>", model),
            ValueType::Ref(None) => write!(f, "ref"),
            ValueType::Set(inner) => write!(f, "set<{}>", inner),
            ValueType::Enum(values) => write!(f, "enum{{{}}}", values.join(", ")),
        }
    }
}

// ------------- Codecs --------------
/// A pair of conversions between in-memory values and wire values.
///
/// `dump` must refuse anything that is not an instance of the codec's type;
/// nothing is coerced silently. `Nil` is accepted by every codec and stands
/// for an absent value.
pub trait Codec: Send + Sync {
    fn data_type(&self) -> String;
    fn dump(&self, value: &Value) -> Result<Wire>;
    fn load(&self, wire: &Wire, db: &Db) -> Result<Value>;
}

fn mismatch(expected: &str, found: &Value) -> FacetError {
    FacetError::TypeMismatch {
        expected: expected.to_string(),
        found: format!("{} {}", found.kind(), found),
    }
}

fn wire_mismatch(expected: &str, found: &Wire) -> FacetError {
    FacetError::TypeMismatch {
        expected: expected.to_string(),
        found: format!("wire {} {}", found.kind(), found),
    }
}

macro_rules! scalar_codec {
    ($codec:ident, $tag:expr, $value:ident, $wire:ident) => {
        #[derive(Debug, Default)]
        pub struct $codec;
        impl $codec {
            pub const DATA_TYPE: &'static str = $tag;
        }
        impl Codec for $codec {
            fn data_type(&self) -> String {
                String::from(Self::DATA_TYPE)
            }
            fn dump(&self, value: &Value) -> Result<Wire> {
                match value {
                    Value::Nil => Ok(Wire::Nil),
                    Value::$value(v) => Ok(Wire::$wire(v.clone())),
                    other => Err(mismatch(Self::DATA_TYPE, other)),
                }
            }
            fn load(&self, wire: &Wire, _db: &Db) -> Result<Value> {
                match wire {
                    Wire::Nil => Ok(Value::Nil),
                    Wire::$wire(v) => Ok(Value::$value(v.clone())),
                    other => Err(wire_mismatch(Self::DATA_TYPE, other)),
                }
            }
        }
    };
}

scalar_codec!(StringCodec, "string", String, String);
scalar_codec!(LongCodec, "long", Long, Long);
scalar_codec!(BooleanCodec, "boolean", Boolean, Boolean);
scalar_codec!(KeywordCodec, "keyword", Keyword, Keyword);
scalar_codec!(InstantCodec, "instant", Instant, Instant);

/// Keywords restricted to a fixed set of values.
#[derive(Debug)]
pub struct EnumCodec {
    values: Vec<String>,
}
impl EnumCodec {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }
    fn admits(&self, k: &str) -> bool {
        self.values.iter().any(|v| v == k)
    }
}
impl Codec for EnumCodec {
    fn data_type(&self) -> String {
        ValueType::Enum(self.values.clone()).to_string()
    }
    fn dump(&self, value: &Value) -> Result<Wire> {
        match value {
            Value::Nil => Ok(Wire::Nil),
            Value::Keyword(k) if self.admits(k) => Ok(Wire::Keyword(k.clone())),
            other => Err(mismatch(&self.data_type(), other)),
        }
    }
    fn load(&self, wire: &Wire, _db: &Db) -> Result<Value> {
        match wire {
            Wire::Nil => Ok(Value::Nil),
            Wire::Keyword(k) if self.admits(k) => Ok(Value::Keyword(k.clone())),
            other => Err(wire_mismatch(&self.data_type(), other)),
        }
    }
}

/// References dump to ids; loading binds an [`Instance`] of the referenced
/// model to the snapshot it was read through.
#[derive(Debug)]
pub struct RefCodec {
    model: Option<String>,
}
impl RefCodec {
    pub fn new(model: Option<String>) -> Self {
        Self { model }
    }
}
impl Codec for RefCodec {
    fn data_type(&self) -> String {
        ValueType::Ref(self.model.clone()).to_string()
    }
    fn dump(&self, value: &Value) -> Result<Wire> {
        match value {
            Value::Nil => Ok(Wire::Nil),
            Value::Id(id) => Ok(Wire::Ref(*id)),
            Value::Temp(t) => Ok(Wire::Temp(*t)),
            Value::Ref(instance) => match &self.model {
                Some(model) if instance.model().name() != model => {
                    Err(mismatch(&self.data_type(), value))
                }
                _ => Ok(Wire::Ref(instance.id())),
            },
            other => Err(mismatch(&self.data_type(), other)),
        }
    }
    fn load(&self, wire: &Wire, db: &Db) -> Result<Value> {
        match (wire, &self.model) {
            (Wire::Nil, _) => Ok(Value::Nil),
            (Wire::Ref(id), Some(model)) => {
                let model = Arc::clone(db.catalog().model(model)?);
                Ok(Value::Ref(Instance::new(model, *id, db.clone())))
            }
            (Wire::Ref(id), None) => Ok(Value::Id(*id)),
            (other, _) => Err(wire_mismatch(&self.data_type(), other)),
        }
    }
}

/// Unordered, duplicate free collections, delegating each element.
pub struct SetCodec {
    element: Arc<dyn Codec>,
}
impl SetCodec {
    pub fn new(element: Arc<dyn Codec>) -> Self {
        Self { element }
    }
}
impl Codec for SetCodec {
    fn data_type(&self) -> String {
        format!("set<{}>", self.element.data_type())
    }
    fn dump(&self, value: &Value) -> Result<Wire> {
        match value {
            Value::Nil => Ok(Wire::Nil),
            Value::Set(items) => {
                let mut wires = Vec::with_capacity(items.len());
                for item in items {
                    if item.is_nil() {
                        return Err(mismatch(&self.data_type(), item));
                    }
                    wires.push(self.element.dump(item)?);
                }
                wires.sort();
                wires.dedup();
                Ok(Wire::Set(wires))
            }
            other => Err(mismatch(&self.data_type(), other)),
        }
    }
    fn load(&self, wire: &Wire, db: &Db) -> Result<Value> {
        match wire {
            Wire::Nil => Ok(Value::Nil),
            Wire::Set(wires) => {
                let mut items = BTreeSet::new();
                for w in wires {
                    items.insert(self.element.load(w, db)?);
                }
                Ok(Value::Set(items))
            }
            other => Err(wire_mismatch(&self.data_type(), other)),
        }
    }
}

// ------------- Registry -------------
/// Maps scalar type tags to codecs and composes the others on demand.
pub struct CodecRegistry {
    scalars: HashMap<String, Arc<dyn Codec>, OtherHasher>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            scalars: HashMap::default(),
        };
        registry.register(StringCodec::DATA_TYPE, Arc::new(StringCodec));
        registry.register(LongCodec::DATA_TYPE, Arc::new(LongCodec));
        registry.register(BooleanCodec::DATA_TYPE, Arc::new(BooleanCodec));
        registry.register(KeywordCodec::DATA_TYPE, Arc::new(KeywordCodec));
        registry.register(InstantCodec::DATA_TYPE, Arc::new(InstantCodec));
        registry
    }
    /// Registers (or replaces) the codec for a scalar tag.
    pub fn register(&mut self, tag: &str, codec: Arc<dyn Codec>) {
        self.scalars.insert(tag.to_string(), codec);
    }
    pub fn contains(&self, tag: &str) -> bool {
        self.scalars.contains_key(tag)
    }
    pub fn codec_for(&self, value_type: &ValueType) -> Result<Arc<dyn Codec>> {
        match value_type {
            ValueType::Scalar(tag) => self
                .scalars
                .get(tag)
                .cloned()
                .ok_or_else(|| FacetError::UnknownType(tag.clone())),
            ValueType::Ref(model) => Ok(Arc::new(RefCodec::new(model.clone()))),
            ValueType::Set(element) => Ok(Arc::new(SetCodec::new(self.codec_for(element)?))),
            ValueType::Enum(values) => Ok(Arc::new(EnumCodec::new(values.clone()))),
        }
    }
    /// Verifies that every scalar tag inside `value_type` is registered.
    pub fn check(&self, value_type: &ValueType) -> Result<()> {
        self.codec_for(value_type).map(|_| ())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}
