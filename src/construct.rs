use std::sync::{Arc, Mutex, MutexGuard};

// other keepers use HashSet or HashMap
use core::hash::BuildHasherDefault;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use seahash::SeaHasher;

// used for the attribute to entity index
use roaring::RoaringTreemap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// our own stuff that we need
use crate::adapter::{
    AttributeSchema, Cardinality, Connection, Database, EntityRef, RawEntity, Rejection, Snapshot,
    TxOp, TxReport,
};
use crate::datatype::{EntityId, TempId, Wire};
use crate::engine;
use crate::error::{FacetError, Result};
use crate::persist::Persistor;
use crate::query::QueryAst;

// ------------- Entity -------------
pub type ThingHasher = BuildHasherDefault<SeaHasher>;
pub type OtherHasher = BuildHasherDefault<SeaHasher>;

pub const GENESIS: EntityId = 0;

#[derive(Debug)]
pub struct ThingGenerator {
    lower_bound: EntityId,
    retained: HashSet<EntityId, ThingHasher>,
    released: Vec<EntityId>,
}

impl ThingGenerator {
    pub fn new() -> Self {
        Self {
            lower_bound: GENESIS,
            retained: HashSet::<EntityId, ThingHasher>::default(),
            released: Vec::new(),
        }
    }
    // Entities may be explicitly referenced, but only implicitly created.
    // Retaining is necessary when replaying a persisted log.
    pub fn retain(&mut self, e: EntityId) {
        self.retained.insert(e);
        if e > self.lower_bound {
            self.lower_bound = e;
        }
    }
    pub fn check(&self, e: EntityId) -> Option<EntityId> {
        self.retained.get(&e).cloned()
    }
    // only ids handed out by a rejected transaction are released
    pub fn release(&mut self, e: EntityId) {
        if self.retained.remove(&e) {
            self.released.push(e);
        }
    }
    pub fn generate(&mut self) -> EntityId {
        self.released.pop().unwrap_or_else(|| {
            self.lower_bound += 1;
            self.retained.insert(self.lower_bound);
            self.lower_bound
        })
    }
    pub fn len(&self) -> usize {
        self.retained.len()
    }
}

impl Default for ThingGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a reverse key such as `ns.sample/_parent` into its forward key.
pub fn reverse_of(key: &str) -> Option<String> {
    let (namespace, name) = key.trim_start_matches(':').rsplit_once('/')?;
    name.strip_prefix('_')
        .map(|forward| format!("{}/{}", namespace, forward))
}

// ------------- Datom -------------
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datom {
    pub e: EntityId,
    pub a: String,
    pub v: Wire,
    pub tx: u64,
    pub added: bool,
}

// ------------- Snapshot -------------
type Facts = BTreeMap<String, BTreeSet<Wire>>;
pub type Schema = HashMap<String, AttributeSchema, OtherHasher>;

/// One immutable state of the store.
#[derive(Clone, Debug)]
pub struct MemoryDb {
    basis_t: u64,
    schema: Arc<Schema>,
    eav: BTreeMap<EntityId, Facts>,
    aev: HashMap<String, RoaringTreemap, OtherHasher>,
    touched: HashMap<EntityId, DateTime<Utc>, ThingHasher>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self {
            basis_t: 0,
            schema: Arc::new(Schema::default()),
            eav: BTreeMap::new(),
            aev: HashMap::default(),
            touched: HashMap::default(),
        }
    }
    pub fn schema(&self) -> &Schema {
        &self.schema
    }
    /// Entities holding at least one value for `key`, in id order.
    pub fn entities_with(&self, key: &str) -> Vec<EntityId> {
        self.aev
            .get(key)
            .map(|set| set.iter().collect())
            .unwrap_or_default()
    }
    pub fn facts(&self, e: EntityId, key: &str) -> Option<&BTreeSet<Wire>> {
        self.eav.get(&e).and_then(|facts| facts.get(key))
    }
    pub fn contains(&self, e: EntityId) -> bool {
        self.eav.contains_key(&e)
    }
    fn add(&mut self, e: EntityId, key: &str, v: Wire) -> bool {
        let added = self
            .eav
            .entry(e)
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(v);
        self.aev.entry(key.to_string()).or_default().insert(e);
        added
    }
    fn remove(&mut self, e: EntityId, key: &str, v: &Wire) -> bool {
        let mut removed = false;
        if let Some(facts) = self.eav.get_mut(&e) {
            if let Some(values) = facts.get_mut(key) {
                removed = values.remove(v);
                if values.is_empty() {
                    facts.remove(key);
                    if let Some(set) = self.aev.get_mut(key) {
                        set.remove(e);
                    }
                }
            }
            if facts.is_empty() {
                self.eav.remove(&e);
            }
        }
        removed
    }
    // Applies an already resolved datom, as when replaying the log.
    fn apply(&mut self, datom: &Datom, instant: DateTime<Utc>) {
        if datom.added {
            self.add(datom.e, &datom.a, datom.v.clone());
        } else {
            self.remove(datom.e, &datom.a, &datom.v);
        }
        self.touched.insert(datom.e, instant);
    }
    /// The entity (other than `e`) already holding `v` for `key`, if any.
    fn holder(&self, key: &str, v: &Wire, e: EntityId) -> Option<EntityId> {
        self.entities_with(key)
            .into_iter()
            .find(|other| *other != e && self.facts(*other, key).is_some_and(|vs| vs.contains(v)))
    }
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for MemoryDb {
    fn basis_t(&self) -> u64 {
        self.basis_t
    }
    fn q(&self, query: &QueryAst, inputs: &[Wire]) -> Result<Vec<Vec<Wire>>> {
        engine::evaluate(self, query, inputs)
    }
    fn entity(&self, id: EntityId) -> Result<RawEntity> {
        let facts = self.eav.get(&id).ok_or(FacetError::NotFound(id))?;
        Ok(RawEntity {
            id,
            facts: facts
                .iter()
                .map(|(k, vs)| (k.clone(), vs.iter().cloned().collect()))
                .collect(),
        })
    }
    fn values(&self, id: EntityId, key: &str) -> Result<Vec<Wire>> {
        match reverse_of(key) {
            Some(forward) => Ok(self
                .entities_with(&forward)
                .into_iter()
                .filter(|e| {
                    self.facts(*e, &forward)
                        .is_some_and(|vs| vs.contains(&Wire::Ref(id)))
                })
                .map(Wire::Ref)
                .collect()),
            None => Ok(self
                .facts(id, key)
                .map(|vs| vs.iter().cloned().collect())
                .unwrap_or_default()),
        }
    }
    fn updated_at(&self, id: EntityId) -> Result<DateTime<Utc>> {
        if !self.contains(id) {
            return Err(FacetError::NotFound(id));
        }
        self.touched
            .get(&id)
            .copied()
            .ok_or(FacetError::NotFound(id))
    }
}

// ------------- Connection -------------
#[derive(Debug)]
struct StoreState {
    generator: ThingGenerator,
    temp_counter: i64,
    schema: Arc<Schema>,
    current: Arc<MemoryDb>,
    // history[t] is the snapshot right after transaction t
    history: Vec<Arc<MemoryDb>>,
    persistor: Option<Persistor>,
}

/// The reference implementation of [`Connection`]. Writers are serialized
/// by a mutex; readers work on `Arc`-shared immutable snapshots.
///
/// Every transaction copies the whole current snapshot before applying its
/// ops, and every snapshot is kept for `as_of`. Writes therefore cost time
/// proportional to the size of the store, and memory is never reclaimed.
#[derive(Debug)]
pub struct MemoryConnection {
    uri: String,
    state: Mutex<StoreState>,
}

impl MemoryConnection {
    pub fn in_memory(uri: &str) -> Self {
        let genesis = Arc::new(MemoryDb::new());
        Self {
            uri: uri.to_string(),
            state: Mutex::new(StoreState {
                generator: ThingGenerator::new(),
                temp_counter: 0,
                schema: Arc::new(Schema::default()),
                current: Arc::clone(&genesis),
                history: vec![genesis],
                persistor: None,
            }),
        }
    }
    /// Opens (or creates) a SQLite backed store and replays its log.
    pub fn open(uri: &str, path: &str) -> Result<Self> {
        let mut persistor = Persistor::open(path)?;
        let mut schema = Schema::default();
        for attribute in persistor.restore_schema()? {
            schema.insert(attribute.ident.clone(), attribute);
        }
        let schema = Arc::new(schema);
        let mut generator = ThingGenerator::new();
        let mut db = MemoryDb::new();
        db.schema = Arc::clone(&schema);
        let mut history = vec![Arc::new(db.clone())];
        let transactions = persistor.restore_transactions()?;
        debug!(path, transactions = transactions.len(), "Restoring store");
        for (tx, instant, datoms) in transactions {
            for datom in &datoms {
                generator.retain(datom.e);
                if let Wire::Ref(id) = datom.v {
                    generator.retain(id);
                }
                db.apply(datom, instant);
            }
            db.basis_t = tx;
            history.push(Arc::new(db.clone()));
        }
        Ok(Self {
            uri: uri.to_string(),
            state: Mutex::new(StoreState {
                generator,
                temp_counter: 0,
                schema,
                current: Arc::new(db),
                history,
                persistor: Some(persistor),
            }),
        })
    }
    pub fn uri(&self) -> &str {
        &self.uri
    }
    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|e| FacetError::Lock(e.to_string()))
    }
    /// Head of the ledger hash chain, `None` for volatile stores or an empty log.
    pub fn current_superhash(&self) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(state
            .persistor
            .as_ref()
            .and_then(|p| p.current_superhash())
            .map(|h| h.to_hex().to_string()))
    }
}

// Resolves entity references, allocating ids for new temporary ids.
struct Resolver<'a> {
    generator: &'a mut ThingGenerator,
    tempids: HashMap<TempId, EntityId>,
    generated: Vec<EntityId>,
}

impl Resolver<'_> {
    fn entity(&mut self, e: EntityRef) -> std::result::Result<EntityId, Rejection> {
        match e {
            EntityRef::Id(id) => self
                .generator
                .check(id)
                .ok_or_else(|| Rejection::Other(format!("Unknown entity id {}", id))),
            EntityRef::Temp(t) => {
                if let Some(id) = self.tempids.get(&t) {
                    return Ok(*id);
                }
                let id = self.generator.generate();
                self.generated.push(id);
                self.tempids.insert(t, id);
                Ok(id)
            }
        }
    }
    fn value(&mut self, v: Wire) -> std::result::Result<Wire, Rejection> {
        match v {
            Wire::Temp(t) => Ok(Wire::Ref(self.entity(EntityRef::Temp(t))?)),
            Wire::Ref(id) => Ok(Wire::Ref(self.entity(EntityRef::Id(id))?)),
            other => Ok(other),
        }
    }
    fn rollback(self) {
        for id in self.generated {
            self.generator.release(id);
        }
    }
}

fn flatten(v: Wire) -> Vec<Wire> {
    match v {
        Wire::Set(items) => items,
        other => vec![other],
    }
}

impl MemoryConnection {
    fn apply_ops(
        db: &mut MemoryDb,
        resolver: &mut Resolver,
        ops: Vec<TxOp>,
        tx: u64,
    ) -> std::result::Result<Vec<Datom>, Rejection> {
        let mut datoms = Vec::new();
        let mut asserted = Vec::new();
        for op in ops {
            match op {
                TxOp::Assert { e, a, v } => {
                    let schema = db
                        .schema
                        .get(&a)
                        .cloned()
                        .ok_or_else(|| Rejection::Other(format!("Unknown attribute :{}", a)))?;
                    let e = resolver.entity(e)?;
                    for v in flatten(v) {
                        if v.is_nil() {
                            return Err(Rejection::Other(format!("Nil value for :{}", a)));
                        }
                        let v = resolver.value(v)?;
                        if schema.cardinality == Cardinality::One {
                            let existing: Vec<Wire> = db
                                .facts(e, &a)
                                .map(|vs| vs.iter().filter(|old| **old != v).cloned().collect())
                                .unwrap_or_default();
                            for old in existing {
                                db.remove(e, &a, &old);
                                datoms.push(Datom { e, a: a.clone(), v: old, tx, added: false });
                            }
                        }
                        if db.add(e, &a, v.clone()) {
                            datoms.push(Datom { e, a: a.clone(), v: v.clone(), tx, added: true });
                        }
                        if schema.unique {
                            asserted.push((e, a.clone(), v));
                        }
                    }
                }
                TxOp::Retract { e, a, v } => {
                    let e = resolver.entity(e)?;
                    for v in flatten(v) {
                        let v = resolver.value(v)?;
                        if db.remove(e, &a, &v) {
                            datoms.push(Datom { e, a: a.clone(), v, tx, added: false });
                        }
                    }
                }
                TxOp::RetractEntity(id) => {
                    let id = resolver.entity(EntityRef::Id(id))?;
                    let own: Vec<(String, Wire)> = db
                        .eav
                        .get(&id)
                        .map(|facts| {
                            facts
                                .iter()
                                .flat_map(|(a, vs)| vs.iter().map(move |v| (a.clone(), v.clone())))
                                .collect()
                        })
                        .unwrap_or_default();
                    let refs: Vec<String> = db
                        .schema
                        .values()
                        .filter(|s| s.is_ref)
                        .map(|s| s.ident.clone())
                        .collect();
                    let mut incoming = Vec::new();
                    for a in refs {
                        for e in db.entities_with(&a) {
                            if db.facts(e, &a).is_some_and(|vs| vs.contains(&Wire::Ref(id))) {
                                incoming.push((e, a.clone()));
                            }
                        }
                    }
                    for (a, v) in own {
                        db.remove(id, &a, &v);
                        datoms.push(Datom { e: id, a, v, tx, added: false });
                    }
                    for (e, a) in incoming {
                        db.remove(e, &a, &Wire::Ref(id));
                        datoms.push(Datom { e, a, v: Wire::Ref(id), tx, added: false });
                    }
                }
            }
        }
        for (e, a, v) in asserted {
            // the value may have been retracted again later in the same transaction
            if db.facts(e, &a).is_some_and(|vs| vs.contains(&v)) && db.holder(&a, &v, e).is_some() {
                return Err(Rejection::Unique {
                    attribute: a,
                    value: v.to_string(),
                });
            }
        }
        Ok(datoms)
    }
}

impl Connection for MemoryConnection {
    fn db(&self) -> Result<Snapshot> {
        let state = self.lock()?;
        Ok(Snapshot::new(Arc::clone(&state.current) as Arc<dyn Database>))
    }
    fn as_of(&self, t: u64) -> Result<Snapshot> {
        let state = self.lock()?;
        // a basis beyond the head is the head
        let index = (t as usize).min(state.history.len() - 1);
        Ok(Snapshot::new(
            Arc::clone(&state.history[index]) as Arc<dyn Database>
        ))
    }
    fn transact(&self, ops: Vec<TxOp>) -> std::result::Result<TxReport, Rejection> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| Rejection::Other(e.to_string()))?;
        let state = &mut *guard;
        let before = Arc::clone(&state.current);
        let mut next = (*before).clone();
        let tx = before.basis_t + 1;
        let instant = Utc::now();
        let op_count = ops.len();

        let mut resolver = Resolver {
            generator: &mut state.generator,
            tempids: HashMap::new(),
            generated: Vec::new(),
        };
        let datoms = match MemoryConnection::apply_ops(&mut next, &mut resolver, ops, tx) {
            Ok(datoms) => datoms,
            Err(rejection) => {
                warn!(uri = %self.uri, %rejection, "Transaction rejected");
                resolver.rollback();
                return Err(rejection);
            }
        };
        if let Some(persistor) = state.persistor.as_mut() {
            if let Err(e) = persistor.persist_transaction(tx, instant, &datoms) {
                warn!(uri = %self.uri, error = %e, "Could not persist transaction");
                resolver.rollback();
                return Err(Rejection::Other(e.to_string()));
            }
        }
        let tempids = resolver.tempids;
        for datom in &datoms {
            next.touched.insert(datom.e, instant);
        }
        next.basis_t = tx;
        let after = Arc::new(next);
        state.current = Arc::clone(&after);
        state.history.push(Arc::clone(&after));
        info!(uri = %self.uri, tx, ops = op_count, datoms = datoms.len(), "Transaction committed");
        Ok(TxReport {
            db_before: Snapshot::new(before as Arc<dyn Database>),
            db_after: Snapshot::new(after as Arc<dyn Database>),
            tempids,
            tx,
            instant,
        })
    }
    fn tempid(&self, partition: &str) -> Result<TempId> {
        let mut state = self.lock()?;
        state.temp_counter -= 1;
        debug!(partition, tempid = state.temp_counter, "Allocated temporary id");
        Ok(TempId(state.temp_counter))
    }
    fn install(&self, schema: &[AttributeSchema]) -> Result<()> {
        let mut state = self.lock()?;
        let mut installed = (*state.schema).clone();
        let mut fresh = Vec::new();
        for attribute in schema {
            match installed.get(&attribute.ident) {
                Some(existing) if existing == attribute => (),
                Some(_) => {
                    return Err(FacetError::TransactionRejected(format!(
                        "Attribute :{} is already installed with a different definition",
                        attribute.ident
                    )));
                }
                None => {
                    installed.insert(attribute.ident.clone(), attribute.clone());
                    fresh.push(attribute.clone());
                }
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }
        if let Some(persistor) = state.persistor.as_mut() {
            persistor.persist_schema(&fresh)?;
        }
        let installed = Arc::new(installed);
        let mut current = (*state.current).clone();
        current.schema = Arc::clone(&installed);
        state.current = Arc::new(current);
        let head = state.history.len() - 1;
        state.history[head] = Arc::clone(&state.current);
        state.schema = installed;
        debug!(uri = %self.uri, attributes = fresh.len(), "Installed schema");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(ident: &str, cardinality: Cardinality, unique: bool, is_ref: bool) -> AttributeSchema {
        AttributeSchema {
            ident: ident.to_string(),
            cardinality,
            unique,
            is_ref,
            doc: None,
        }
    }

    fn setup() -> MemoryConnection {
        let conn = MemoryConnection::in_memory("mem://construct");
        conn.install(&[
            schema("t/name", Cardinality::One, true, false),
            schema("t/tag", Cardinality::Many, false, false),
            schema("t/parent", Cardinality::One, false, true),
        ])
        .unwrap();
        conn
    }

    #[test]
    fn generator_reuses_released_ids() {
        let mut generator = ThingGenerator::new();
        let a = generator.generate();
        let b = generator.generate();
        assert_eq!((a, b), (1, 2));
        generator.release(b);
        assert_eq!(generator.generate(), 2);
        generator.retain(10);
        assert_eq!(generator.generate(), 11);
        assert_eq!(generator.check(5), None);
    }

    #[test]
    fn reverse_keys_map_to_forward_keys() {
        assert_eq!(reverse_of("ns.sample/_parent").as_deref(), Some("ns.sample/parent"));
        assert_eq!(reverse_of(":ns/_x").as_deref(), Some("ns/x"));
        assert_eq!(reverse_of("ns.sample/parent"), None);
    }

    #[test]
    fn cardinality_one_replaces_and_many_accumulates() {
        let conn = setup();
        let t = conn.tempid("user").unwrap();
        let report = conn
            .transact(vec![
                TxOp::Assert { e: EntityRef::Temp(t), a: "t/name".into(), v: Wire::String("a".into()) },
                TxOp::Assert { e: EntityRef::Temp(t), a: "t/tag".into(), v: Wire::String("x".into()) },
            ])
            .unwrap();
        let id = report.resolve(t).unwrap();
        conn.transact(vec![
            TxOp::Assert { e: EntityRef::Id(id), a: "t/name".into(), v: Wire::String("b".into()) },
            TxOp::Assert { e: EntityRef::Id(id), a: "t/tag".into(), v: Wire::String("y".into()) },
        ])
        .unwrap();
        let db = conn.db().unwrap();
        assert_eq!(db.values(id, "t/name").unwrap(), vec![Wire::String("b".into())]);
        assert_eq!(db.values(id, "t/tag").unwrap().len(), 2);
        // the earlier snapshot is untouched
        assert_eq!(
            report.db_after.values(id, "t/name").unwrap(),
            vec![Wire::String("a".into())]
        );
    }

    #[test]
    fn unique_conflicts_reject_the_whole_transaction() {
        let conn = setup();
        let t = conn.tempid("user").unwrap();
        conn.transact(vec![TxOp::Assert {
            e: EntityRef::Temp(t),
            a: "t/name".into(),
            v: Wire::String("a".into()),
        }])
        .unwrap();
        let basis = conn.db().unwrap().basis_t();
        let t = conn.tempid("user").unwrap();
        let rejection = conn
            .transact(vec![TxOp::Assert {
                e: EntityRef::Temp(t),
                a: "t/name".into(),
                v: Wire::String("a".into()),
            }])
            .unwrap_err();
        assert!(matches!(rejection, Rejection::Unique { ref attribute, .. } if attribute == "t/name"));
        assert_eq!(conn.db().unwrap().basis_t(), basis);
    }

    #[test]
    fn retract_entity_removes_incoming_references() {
        let conn = setup();
        let (p, c) = (conn.tempid("user").unwrap(), conn.tempid("user").unwrap());
        let report = conn
            .transact(vec![
                TxOp::Assert { e: EntityRef::Temp(p), a: "t/name".into(), v: Wire::String("p".into()) },
                TxOp::Assert { e: EntityRef::Temp(c), a: "t/parent".into(), v: Wire::Temp(p) },
            ])
            .unwrap();
        let (p, c) = (report.resolve(p).unwrap(), report.resolve(c).unwrap());
        assert_eq!(conn.db().unwrap().values(p, "t/_parent").unwrap(), vec![Wire::Ref(c)]);
        conn.transact(vec![TxOp::RetractEntity(p)]).unwrap();
        let db = conn.db().unwrap();
        assert!(matches!(db.entity(p), Err(FacetError::NotFound(_))));
        assert!(matches!(db.entity(c), Err(FacetError::NotFound(_))));
        // time travel still sees both
        assert!(conn.as_of(report.tx).unwrap().entity(c).is_ok());
    }

    #[test]
    fn unknown_attributes_are_rejected() {
        let conn = setup();
        let t = conn.tempid("user").unwrap();
        let rejection = conn
            .transact(vec![TxOp::Assert { e: EntityRef::Temp(t), a: "t/nope".into(), v: Wire::Long(1) }])
            .unwrap_err();
        assert!(matches!(rejection, Rejection::Other(_)));
    }
}
