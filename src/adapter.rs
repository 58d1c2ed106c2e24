//! The narrow contract between the modeling layer and a datastore.
//!
//! Everything above this module talks to a store through [`Connection`] (the
//! single writer entry point) and [`Database`] (an immutable snapshot). The
//! crate ships one implementation, [`crate::construct::MemoryConnection`],
//! optionally made durable through [`crate::persist::Persistor`].
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::construct::MemoryConnection;
use crate::datatype::{EntityId, TempId, Wire};
use crate::error::{FacetError, Result};
use crate::query::QueryAst;
use crate::settings::Settings;

// ------------- Schema -------------
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    pub ident: String,
    pub cardinality: Cardinality,
    pub unique: bool,
    pub is_ref: bool,
    pub doc: Option<String>,
}

// ------------- Transactions -------------
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    Id(EntityId),
    Temp(TempId),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntityRef::Id(id) => write!(f, "{}", id),
            EntityRef::Temp(t) => write!(f, "{}", t),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOp {
    Assert { e: EntityRef, a: String, v: Wire },
    Retract { e: EntityRef, a: String, v: Wire },
    RetractEntity(EntityId),
}

impl fmt::Display for TxOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxOp::Assert { e, a, v } => write!(f, "[:db/add {} :{} {}]", e, a, v),
            TxOp::Retract { e, a, v } => write!(f, "[:db/retract {} :{} {}]", e, a, v),
            TxOp::RetractEntity(id) => write!(f, "[:db/retractEntity {}]", id),
        }
    }
}

/// Outcome of a successful transaction.
#[derive(Clone)]
pub struct TxReport {
    pub db_before: Snapshot,
    pub db_after: Snapshot,
    pub tempids: HashMap<TempId, EntityId>,
    pub tx: u64,
    pub instant: DateTime<Utc>,
}

impl TxReport {
    pub fn resolve(&self, temp: TempId) -> Option<EntityId> {
        self.tempids.get(&temp).copied()
    }
}

impl fmt::Debug for TxReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TxReport")
            .field("basis_before", &self.db_before.basis_t())
            .field("basis_after", &self.db_after.basis_t())
            .field("tempids", &self.tempids)
            .field("tx", &self.tx)
            .field("instant", &self.instant)
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("Unique conflict: {attribute}, value: {value} already held")]
    Unique { attribute: String, value: String },
    #[error("{0}")]
    Other(String),
}

// ------------- Snapshots -------------
/// All facts of one entity, keyed by external attribute key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawEntity {
    pub id: EntityId,
    pub facts: BTreeMap<String, Vec<Wire>>,
}

impl RawEntity {
    pub fn first(&self, key: &str) -> Option<&Wire> {
        self.facts.get(key).and_then(|values| values.first())
    }
}

/// An immutable point-in-time view of the store.
pub trait Database: Send + Sync {
    fn basis_t(&self) -> u64;
    /// Runs a compiled query with positional input values.
    fn q(&self, query: &QueryAst, inputs: &[Wire]) -> Result<Vec<Vec<Wire>>>;
    /// Fails with `NotFound` when the entity has no facts.
    fn entity(&self, id: EntityId) -> Result<RawEntity>;
    /// Values of one attribute; a key whose name starts with `_` is read in
    /// reverse and yields the entities pointing at `id`.
    fn values(&self, id: EntityId, key: &str) -> Result<Vec<Wire>>;
    fn updated_at(&self, id: EntityId) -> Result<DateTime<Utc>>;
}

/// Shared handle to a snapshot. Two handles are equal when they observe the
/// same basis.
#[derive(Clone)]
pub struct Snapshot(Arc<dyn Database>);

impl Snapshot {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Snapshot(db)
    }
}

impl Deref for Snapshot {
    type Target = dyn Database;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.0.basis_t() == other.0.basis_t()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Snapshot(t={})", self.0.basis_t())
    }
}

// ------------- Connection -------------
pub trait Connection: Send + Sync {
    fn db(&self) -> Result<Snapshot>;
    /// The snapshot as it was right after transaction `t`.
    fn as_of(&self, t: u64) -> Result<Snapshot>;
    fn transact(&self, ops: Vec<TxOp>) -> std::result::Result<TxReport, Rejection>;
    fn tempid(&self, partition: &str) -> Result<TempId>;
    /// Installs attribute definitions. Installing the same definition twice
    /// is a no-op.
    fn install(&self, schema: &[AttributeSchema]) -> Result<()>;
}

/// Opens the reference store named by `settings.uri`.
///
/// * `mem://<name>` keeps everything in memory.
/// * `file://<path>` replays and appends to a SQLite transaction log.
pub fn connect(settings: &Settings) -> Result<Arc<dyn Connection>> {
    let uri = settings.uri.as_str();
    if let Some(_name) = uri.strip_prefix("mem://") {
        Ok(Arc::new(MemoryConnection::in_memory(uri)))
    } else if let Some(path) = uri.strip_prefix("file://") {
        Ok(Arc::new(MemoryConnection::open(uri, path)?))
    } else {
        Err(FacetError::Config(format!("Unsupported store uri: {}", uri)))
    }
}
