// used for persistence
use rusqlite::{Connection, OptionalExtension, params};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::adapter::{AttributeSchema, Cardinality};
use crate::construct::Datom;
use crate::datatype::{EntityId, Wire};
use crate::error::{FacetError, Result};

/// Transaction log of the reference store, kept in SQLite. Every
/// transaction is chained to the previous one through a blake3 hash, so the
/// head hash identifies the whole history.
pub struct Persistor {
    db: Connection,
    head: Option<blake3::Hash>,
}

impl Persistor {
    pub fn open(path: &str) -> Result<Self> {
        let db = Connection::open(path)?;
        Self::with_connection(db)
    }
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }
    fn with_connection(db: Connection) -> Result<Self> {
        db.execute_batch(
            "
            create table if not exists Attribute (
                Ident text not null,
                Cardinality text not null,
                IsUnique integer not null,
                IsRef integer not null,
                Doc text null,
                constraint referenceable_Ident primary key (
                    Ident
                )
            );
            create table if not exists Tx (
                Tx integer not null,
                Instant text not null,
                Hash text not null,
                constraint referenceable_Tx primary key (
                    Tx
                )
            );
            create table if not exists Datom (
                Tx integer not null,
                Position integer not null,
                E integer not null,
                A text not null,
                V text not null,
                Added integer not null,
                constraint Datom_in_Tx foreign key (
                    Tx
                ) references Tx(Tx),
                constraint referenceable_Datom primary key (
                    Tx,
                    Position
                )
            );
            ",
        )?;
        let head = db
            .query_row(
                "select Hash from Tx order by Tx desc limit 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|hex| blake3::Hash::from_hex(hex.as_bytes()))
            .transpose()
            .map_err(|e| FacetError::Persistence(e.to_string()))?;
        Ok(Self { db, head })
    }

    pub fn persist_schema(&mut self, schema: &[AttributeSchema]) -> Result<()> {
        let tx = self.db.transaction()?;
        {
            let mut add_attribute = tx.prepare_cached(
                "
                insert or replace into Attribute (
                    Ident,
                    Cardinality,
                    IsUnique,
                    IsRef,
                    Doc
                ) values (?, ?, ?, ?, ?)
                ",
            )?;
            for attribute in schema {
                let cardinality = match attribute.cardinality {
                    Cardinality::One => "one",
                    Cardinality::Many => "many",
                };
                add_attribute.execute(params![
                    &attribute.ident,
                    cardinality,
                    attribute.unique,
                    attribute.is_ref,
                    &attribute.doc
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Appends one transaction. Either all of its datoms are written or none.
    pub fn persist_transaction(
        &mut self,
        t: u64,
        instant: DateTime<Utc>,
        datoms: &[Datom],
    ) -> Result<()> {
        let payload = serde_json::to_vec(datoms)?;
        let mut hasher = blake3::Hasher::new();
        if let Some(previous) = &self.head {
            hasher.update(previous.as_bytes());
        }
        hasher.update(&t.to_be_bytes());
        hasher.update(&payload);
        let hash = hasher.finalize();

        let tx = self.db.transaction()?;
        tx.execute(
            "insert into Tx (Tx, Instant, Hash) values (?, ?, ?)",
            params![t as i64, instant, hash.to_hex().as_str()],
        )?;
        {
            let mut add_datom = tx.prepare_cached(
                "
                insert into Datom (
                    Tx,
                    Position,
                    E,
                    A,
                    V,
                    Added
                ) values (?, ?, ?, ?, ?, ?)
                ",
            )?;
            for (position, datom) in datoms.iter().enumerate() {
                add_datom.execute(params![
                    t as i64,
                    position as i64,
                    datom.e as i64,
                    &datom.a,
                    serde_json::to_string(&datom.v)?,
                    datom.added
                ])?;
            }
        }
        tx.commit()?;
        debug!(t, datoms = datoms.len(), hash = %hash.to_hex(), "Persisted transaction");
        self.head = Some(hash);
        Ok(())
    }

    pub fn restore_schema(&mut self) -> Result<Vec<AttributeSchema>> {
        let mut statement = self
            .db
            .prepare("select Ident, Cardinality, IsUnique, IsRef, Doc from Attribute")?;
        let rows = statement.query_map([], |row| {
            let cardinality: String = row.get(1)?;
            Ok(AttributeSchema {
                ident: row.get(0)?,
                cardinality: if cardinality == "many" {
                    Cardinality::Many
                } else {
                    Cardinality::One
                },
                unique: row.get(2)?,
                is_ref: row.get(3)?,
                doc: row.get(4)?,
            })
        })?;
        let mut schema = Vec::new();
        for attribute in rows {
            schema.push(attribute?);
        }
        Ok(schema)
    }

    /// Every transaction in commit order, with its datoms in assertion order.
    pub fn restore_transactions(&mut self) -> Result<Vec<(u64, DateTime<Utc>, Vec<Datom>)>> {
        let mut transactions: Vec<(u64, DateTime<Utc>, Vec<Datom>)> = Vec::new();
        let mut all_transactions = self
            .db
            .prepare("select Tx, Instant from Tx order by Tx")?;
        let mut rows = all_transactions.query([])?;
        while let Some(row) = rows.next()? {
            let t: i64 = row.get(0)?;
            transactions.push((t as u64, row.get(1)?, Vec::new()));
        }
        let mut all_datoms = self
            .db
            .prepare("select Tx, E, A, V, Added from Datom order by Tx, Position")?;
        let mut rows = all_datoms.query([])?;
        let mut current = 0;
        while let Some(row) = rows.next()? {
            let t = row.get::<_, i64>(0)? as u64;
            let v: String = row.get(3)?;
            let datom = Datom {
                e: row.get::<_, i64>(1)? as EntityId,
                a: row.get(2)?,
                v: serde_json::from_str::<Wire>(&v)?,
                tx: t,
                added: row.get(4)?,
            };
            while current < transactions.len() && transactions[current].0 != t {
                current += 1;
            }
            match transactions.get_mut(current) {
                Some((_, _, datoms)) => datoms.push(datom),
                None => {
                    return Err(FacetError::Persistence(format!(
                        "Datom refers to the unknown transaction {}",
                        t
                    )));
                }
            }
        }
        Ok(transactions)
    }

    pub fn current_superhash(&self) -> Option<blake3::Hash> {
        self.head
    }
}

impl std::fmt::Debug for Persistor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Persistor")
            .field("head", &self.head.map(|h| h.to_hex().to_string()))
            .finish()
    }
}
