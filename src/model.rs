//! Models, the catalog that binds them to a store, snapshots and instances.
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::adapter::{AttributeSchema, Connection, Snapshot, TxOp, TxReport};
use crate::attribute::{
    Attribute, AttributeEntry, AttributeOptions, AttributeRegistry, FinderFn, OverrideFn, SetterFn,
};
use crate::changer::Changer;
use crate::construct::OtherHasher;
use crate::datatype::{Codec, EntityId, Value, ValueType, Wire};
use crate::error::{FacetError, Result};
use crate::finder::Finder;
use crate::query::{Query, Target};
use crate::settings::Config;
use crate::validator::{Scope, Validator};

// ------------- Model -------------
/// A named entity type: its attributes, accessors, finders and rules.
pub struct Model {
    name: String,
    namespace: String,
    partition: String,
    registry: AttributeRegistry,
    type_attribute: Arc<Attribute>,
    validator: Validator,
    finders: HashMap<String, FinderFn, OtherHasher>,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
    pub fn partition(&self) -> &str {
        &self.partition
    }
    pub fn attribute(&self, key: &str) -> Result<&Arc<Attribute>> {
        self.registry.get(key)
    }
    pub fn entry(&self, key: &str) -> Result<&AttributeEntry> {
        self.registry.entry(key)
    }
    /// User defined attributes in definition order.
    pub fn attributes(&self) -> impl Iterator<Item = &Arc<Attribute>> {
        self.registry.iter().filter(|a| !a.is_system())
    }
    pub fn key_for(&self, external_key: &str) -> Option<&str> {
        self.registry.key_for(external_key)
    }
    pub fn type_attribute(&self) -> &Arc<Attribute> {
        &self.type_attribute
    }
    /// `<namespace>.type/<model>`
    pub fn type_keyword(&self) -> String {
        format!("{}.type/{}", self.namespace, self.name)
    }
    pub fn type_marker(&self) -> Value {
        Value::keyword(&self.type_keyword())
    }
    pub fn validator(&self) -> &Validator {
        &self.validator
    }
    pub fn custom_finder(&self, name: &str) -> Option<&FinderFn> {
        self.finders.get(name)
    }
    /// Store definitions for this model, the type marker included.
    pub fn schema(&self) -> Vec<AttributeSchema> {
        self.registry.iter().filter_map(|a| a.schema()).collect()
    }
    /// Values a fresh entity starts out with.
    pub fn defaults(&self) -> BTreeMap<String, Value> {
        self.attributes()
            .map(|a| (a.key().to_string(), a.default().clone()))
            .collect()
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("attributes", &self.registry)
            .field("rules", &self.validator.len())
            .finish()
    }
}

/// Collects the definition of a [`Model`]. Definitions are checked as they
/// are added, so a bad key or type fails where it is written.
pub struct ModelBuilder {
    config: Arc<Config>,
    name: String,
    registry: AttributeRegistry,
    type_attribute: Arc<Attribute>,
    validator: Validator,
    finders: HashMap<String, FinderFn, OtherHasher>,
}

impl ModelBuilder {
    pub fn new(config: &Arc<Config>, name: &str) -> Result<Self> {
        let mut registry = AttributeRegistry::new(name);
        let type_attribute = registry.define(Attribute::type_marker(config.namespace(), name))?;
        Ok(Self {
            config: Arc::clone(config),
            name: name.to_string(),
            registry,
            type_attribute,
            validator: Validator::new(),
            finders: HashMap::default(),
        })
    }
    pub fn attribute(self, key: &str, value_type: ValueType) -> Result<Self> {
        self.attribute_with(key, value_type, AttributeOptions::default())
    }
    pub fn attribute_with(
        mut self,
        key: &str,
        value_type: ValueType,
        options: AttributeOptions,
    ) -> Result<Self> {
        let codec = self.config.codecs().codec_for(&value_type)?;
        let attribute = Attribute::new(self.config.namespace(), &self.name, key, value_type, options)?;
        codec.dump(attribute.default())?;
        self.registry.define(attribute)?;
        Ok(self)
    }
    /// Replaces the setter of `key`. The override receives the generated
    /// setter and decides whether to call it.
    pub fn override_setter<F>(mut self, key: &str, setter: F) -> Result<Self>
    where
        F: Fn(&mut Changer, Value, &SetterFn) -> Result<()> + Send + Sync + 'static,
    {
        let setter: OverrideFn = Arc::new(setter);
        self.registry.override_setter(key, setter)?;
        Ok(self)
    }
    /// Registers a named lookup, run through [`Finder::custom`].
    pub fn finder<F>(mut self, name: &str, finder: F) -> Self
    where
        F: Fn(&Finder, Value) -> Result<Vec<Instance>> + Send + Sync + 'static,
    {
        self.finders.insert(name.to_string(), Arc::new(finder));
        self
    }
    pub fn validate<F>(mut self, attrs: &[&str], check: F) -> Self
    where
        F: Fn(&mut Scope, &[Value]) + Send + Sync + 'static,
    {
        self.validator.validate(attrs, check);
        self
    }
    pub fn build(self) -> Result<Model> {
        for rule in self.validator.rules() {
            for attr in rule.attrs() {
                self.registry.get(attr)?;
            }
        }
        debug!(model = %self.name, attributes = self.registry.len(), "Defined model");
        Ok(Model {
            namespace: self.config.namespace().to_string(),
            partition: self.config.partition().to_string(),
            name: self.name,
            registry: self.registry,
            type_attribute: self.type_attribute,
            validator: self.validator,
            finders: self.finders,
        })
    }
}

// ------------- Catalog -------------
/// Every model of an application, bound to one connection.
pub struct Catalog {
    config: Arc<Config>,
    connection: Arc<dyn Connection>,
    models: HashMap<String, Arc<Model>, OtherHasher>,
}

pub struct CatalogBuilder {
    config: Arc<Config>,
    connection: Arc<dyn Connection>,
    models: Vec<Model>,
}

impl CatalogBuilder {
    pub fn model(mut self, model: Model) -> Self {
        self.models.push(model);
        self
    }
    /// Checks that references point at known models and that models sharing
    /// a store key agree on its definition.
    pub fn build(self) -> Result<Arc<Catalog>> {
        let mut models: HashMap<String, Arc<Model>, OtherHasher> = HashMap::default();
        for model in self.models {
            if models.contains_key(model.name()) {
                return Err(FacetError::Config(format!("Model {} is defined twice", model.name())));
            }
            models.insert(model.name().to_string(), Arc::new(model));
        }
        let mut idents: HashMap<String, AttributeSchema, OtherHasher> = HashMap::default();
        for model in models.values() {
            for attribute in model.registry.iter() {
                if let Some(target) = attribute.value_type().ref_model() {
                    if !models.contains_key(target) {
                        return Err(FacetError::UndefinedModel(target.to_string()));
                    }
                }
                if let Some(schema) = attribute.schema() {
                    match idents.get(&schema.ident) {
                        Some(existing) if *existing != schema => {
                            return Err(FacetError::DuplicateAttribute {
                                model: model.name().to_string(),
                                key: attribute.key().to_string(),
                            });
                        }
                        Some(_) => (),
                        None => {
                            idents.insert(schema.ident.clone(), schema);
                        }
                    }
                }
            }
        }
        info!(models = models.len(), attributes = idents.len(), "Catalog ready");
        Ok(Arc::new(Catalog {
            config: self.config,
            connection: self.connection,
            models,
        }))
    }
}

impl Catalog {
    pub fn builder(config: Arc<Config>, connection: Arc<dyn Connection>) -> CatalogBuilder {
        CatalogBuilder {
            config,
            connection,
            models: Vec::new(),
        }
    }
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }
    pub fn model(&self, name: &str) -> Result<&Arc<Model>> {
        self.models
            .get(name)
            .ok_or_else(|| FacetError::UndefinedModel(name.to_string()))
    }
    pub fn models(&self) -> impl Iterator<Item = &Arc<Model>> {
        self.models.values()
    }
    /// Store definitions of all models, each store key once.
    pub fn schema(&self) -> Vec<AttributeSchema> {
        let mut schema: BTreeMap<String, AttributeSchema> = BTreeMap::new();
        for model in self.models.values() {
            for attribute in model.schema() {
                schema.entry(attribute.ident.clone()).or_insert(attribute);
            }
        }
        schema.into_values().collect()
    }
    pub fn install(&self) -> Result<()> {
        let schema = self.schema();
        debug!(attributes = schema.len(), "Installing schema");
        self.connection.install(&schema)
    }
    /// The latest snapshot.
    pub fn db(self: &Arc<Self>) -> Result<Db> {
        Ok(Db::new(self.connection.db()?, Arc::clone(self)))
    }
    pub fn db_as_of(self: &Arc<Self>, t: u64) -> Result<Db> {
        Ok(Db::new(self.connection.as_of(t)?, Arc::clone(self)))
    }
    /// Empty changes for a new entity of `model`.
    pub fn changer(self: &Arc<Self>, model: &str) -> Result<Changer> {
        Changer::create(self, Arc::clone(self.model(model)?))
    }
    /// A new entity's changes, prepared by `f` but not committed.
    pub fn build<F>(self: &Arc<Self>, model: &str, f: F) -> Result<Changer>
    where
        F: FnOnce(&mut Changer) -> Result<()>,
    {
        self.changer(model)?.change(f)
    }
    /// Builds and commits a new entity.
    pub fn create<F>(self: &Arc<Self>, model: &str, f: F) -> Result<Instance>
    where
        F: FnOnce(&mut Changer) -> Result<()>,
    {
        self.build(model, f)?.commit()
    }
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut names: Vec<&String> = self.models.keys().collect();
        names.sort();
        f.debug_struct("Catalog")
            .field("config", &self.config)
            .field("models", &names)
            .finish()
    }
}

// ------------- Db -------------
/// A snapshot seen through the catalog, so results load as typed values.
#[derive(Clone)]
pub struct Db {
    snapshot: Snapshot,
    catalog: Arc<Catalog>,
}

impl Db {
    pub fn new(snapshot: Snapshot, catalog: Arc<Catalog>) -> Self {
        Self { snapshot, catalog }
    }
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }
    pub fn basis_t(&self) -> u64 {
        self.snapshot.basis_t()
    }
    pub fn query(&self) -> Query {
        Query::new(self.clone())
    }
    pub fn find<I, T>(&self, targets: I) -> Query
    where
        I: IntoIterator<Item = T>,
        T: Into<Target>,
    {
        self.query().find(targets)
    }
    pub fn finder(&self, model: &str) -> Result<Finder> {
        Ok(Finder::new(self.clone(), Arc::clone(self.catalog.model(model)?)))
    }
    pub fn entity(&self, model: &str, id: EntityId) -> Result<Instance> {
        self.finder(model)?.entity(id)
    }
    pub fn codec_for(&self, value_type: &ValueType) -> Result<Arc<dyn Codec>> {
        self.catalog.config().codecs().codec_for(value_type)
    }
}

impl PartialEq for Db {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot == other.snapshot
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Db(t={})", self.basis_t())
    }
}

// ------------- Instance -------------
/// One entity of a model, read through the snapshot it was loaded from.
#[derive(Clone)]
pub struct Instance {
    model: Arc<Model>,
    id: EntityId,
    db: Db,
}

impl Instance {
    pub fn new(model: Arc<Model>, id: EntityId, db: Db) -> Self {
        Self { model, id, db }
    }
    pub fn id(&self) -> EntityId {
        self.id
    }
    pub fn db(&self) -> &Db {
        &self.db
    }
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }
    pub fn get(&self, key: &str) -> Result<Value> {
        let attribute = self.model.attribute(key)?;
        let mut wires = self
            .db
            .snapshot()
            .values(self.id, attribute.external_key())?;
        let codec = self.db.codec_for(attribute.value_type())?;
        if attribute.is_many() {
            return codec.load(&Wire::Set(wires), &self.db);
        }
        match wires.len() {
            0 => Ok(Value::Nil),
            _ => codec.load(&wires.swap_remove(0), &self.db),
        }
    }
    /// Current values of the user defined attributes, in definition order.
    pub fn attributes(&self) -> Result<Vec<(String, Value)>> {
        let mut values = Vec::new();
        for attribute in self.model.attributes() {
            values.push((attribute.key().to_string(), self.get(attribute.key())?));
        }
        Ok(values)
    }
    pub fn to_map(&self) -> Result<BTreeMap<String, Value>> {
        let mut map: BTreeMap<String, Value> = self.attributes()?.into_iter().collect();
        map.insert(String::from("id"), Value::Id(self.id));
        Ok(map)
    }
    /// The same entity as of another snapshot.
    pub fn at(&self, db: &Db) -> Result<Instance> {
        Finder::new(db.clone(), Arc::clone(&self.model)).entity(self.id)
    }
    pub fn finder(&self) -> Finder {
        Finder::new(self.db.clone(), Arc::clone(&self.model))
    }
    pub fn changer(&self) -> Changer {
        Changer::edit(self)
    }
    /// Applies `f` to fresh changes and commits them. `self` keeps reading
    /// its own snapshot.
    pub fn change<F>(&self, f: F) -> Result<Instance>
    where
        F: FnOnce(&mut Changer) -> Result<()>,
    {
        let mut changer = self.changer();
        f(&mut changer)?;
        changer.commit()
    }
    /// Retracts the entity and every reference to it.
    pub fn retract(&self) -> Result<TxReport> {
        info!(model = self.model.name(), id = self.id, "Retracting entity");
        self.db
            .catalog()
            .connection()
            .transact(vec![TxOp::RetractEntity(self.id)])
            .map_err(|rejection| FacetError::TransactionRejected(rejection.to_string()))
    }
    /// Time of the latest transaction that touched the entity.
    pub fn updated_at(&self) -> Result<DateTime<Utc>> {
        self.db.snapshot().updated_at(self.id)
    }
}

// same entity, whichever model reads it; agrees with `Value::Ref`
impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Instance {}

impl Hash for Instance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.attributes() {
            Ok(values) => {
                let cells: Vec<String> = values
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect();
                write!(f, "#<{} {} {{{}}}>", self.model.name(), self.id, cells.join(", "))
            }
            Err(_) => write!(f, "#<{} {}>", self.model.name(), self.id),
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Instance")
            .field("model", &self.model.name())
            .field("id", &self.id)
            .field("basis_t", &self.db.basis_t())
            .finish()
    }
}
