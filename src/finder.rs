use std::sync::Arc;

use crate::datatype::{EntityId, Value, Wire};
use crate::error::{FacetError, Result};
use crate::model::{Db, Instance, Model};
use crate::query::{Query, Term, var};

/// Typed lookups of one model's entities at one snapshot.
#[derive(Clone)]
pub struct Finder {
    db: Db,
    model: Arc<Model>,
}

impl Finder {
    pub fn new(db: Db, model: Arc<Model>) -> Self {
        Self { db, model }
    }
    pub fn db(&self) -> &Db {
        &self.db
    }
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }
    /// `?e` restricted to entities carrying this model's type marker.
    pub fn query(&self) -> Query {
        self.db
            .query()
            .find(["e"])
            .clause(var("e"), self.model.type_attribute(), self.model.type_marker())
    }
    /// Entities matching every `(key, value)` constraint. A `Nil` value
    /// matches entities without any value for the key; a set matches
    /// entities holding all of its elements.
    pub fn filter<'k, I, V>(&self, constraints: I) -> Result<Vec<Instance>>
    where
        I: IntoIterator<Item = (&'k str, V)>,
        V: Into<Value>,
    {
        let mut query = self.query();
        for (key, value) in constraints {
            let attribute = self.model.attribute(key)?;
            match value.into() {
                Value::Nil => {
                    query = query.not_join(["e"], |q| q.clause(var("e"), attribute, Term::Blank));
                }
                Value::Set(items) if attribute.is_many() => {
                    for item in items {
                        query = query.clause(var("e"), attribute, item);
                    }
                }
                value => {
                    query = query.clause(var("e"), attribute, value);
                }
            }
        }
        query.instances()
    }
    /// The generated `by_<key>` lookup.
    pub fn by<V: Into<Value>>(&self, key: &str, value: V) -> Result<Vec<Instance>> {
        let entry = self.model.entry(key)?;
        (entry.by())(self, value.into())
    }
    /// Runs a finder registered on the model under `name`.
    pub fn custom<V: Into<Value>>(&self, name: &str, argument: V) -> Result<Vec<Instance>> {
        let finder = self
            .model
            .custom_finder(name)
            .ok_or_else(|| FacetError::UndefinedFinder {
                model: self.model.name().to_string(),
                name: name.to_string(),
            })?;
        finder(self, argument.into())
    }
    pub fn all(&self) -> Result<Vec<Instance>> {
        self.query().instances()
    }
    /// The entity with this id, if it is a live entity of this model.
    pub fn entity(&self, id: EntityId) -> Result<Instance> {
        let raw = self.db.snapshot().entity(id)?;
        let marker = Wire::Keyword(self.model.type_keyword());
        let typed = raw
            .facts
            .get(self.model.type_attribute().external_key())
            .is_some_and(|values| values.contains(&marker));
        if !typed {
            return Err(FacetError::NotFound(id));
        }
        Ok(Instance::new(Arc::clone(&self.model), id, self.db.clone()))
    }
}
