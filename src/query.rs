//! Immutable, chainable queries.
//!
//! Every builder method takes `&self` and returns a new [`Query`], so a query
//! can be kept around, extended in several directions and executed any number
//! of times. Execution compiles the builder into a [`QueryAst`], dumps bound
//! inputs through their codecs, hands both to the snapshot and loads every
//! projected cell back through the codec of its variable.
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::attribute::Attribute;
use crate::datatype::{Codec, Value, ValueType, Wire};
use crate::error::{FacetError, Result};
use crate::model::{Db, Instance};

lazy_static! {
    static ref RAW_VARIABLE: Regex = Regex::new(r"\?([A-Za-z_][A-Za-z0-9_\-.*!]*)").unwrap();
}

// ------------- Terms -------------
/// A query variable. The leading `?` is optional when naming one.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Var(String);

impl Var {
    pub fn new(name: &str) -> Self {
        Var(name.trim_start_matches('?').to_string())
    }
    pub fn name(&self) -> &str {
        &self.0
    }
}

pub fn var(name: &str) -> Var {
    Var::new(name)
}

impl From<&str> for Var {
    fn from(name: &str) -> Self {
        Var::new(name)
    }
}
impl From<&Var> for Var {
    fn from(v: &Var) -> Self {
        v.clone()
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

/// Entity or value position of a pattern.
#[derive(Clone, Debug, PartialEq)]
pub enum Term {
    Var(Var),
    Value(Value),
    Blank,
}

impl From<Var> for Term {
    fn from(v: Var) -> Self {
        Term::Var(v)
    }
}
impl From<&Var> for Term {
    fn from(v: &Var) -> Self {
        Term::Var(v.clone())
    }
}
impl From<Value> for Term {
    fn from(v: Value) -> Self {
        Term::Value(v)
    }
}
impl From<&str> for Term {
    fn from(s: &str) -> Self {
        Term::Value(Value::from(s))
    }
}
impl From<String> for Term {
    fn from(s: String) -> Self {
        Term::Value(Value::from(s))
    }
}
impl From<i64> for Term {
    fn from(l: i64) -> Self {
        Term::Value(Value::from(l))
    }
}
impl From<bool> for Term {
    fn from(b: bool) -> Self {
        Term::Value(Value::from(b))
    }
}
impl From<Instance> for Term {
    fn from(i: Instance) -> Self {
        Term::Value(Value::from(i))
    }
}
impl From<&Instance> for Term {
    fn from(i: &Instance) -> Self {
        Term::Value(Value::from(i))
    }
}

/// A projected variable, optionally with an explicit type.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    var: Var,
    value_type: Option<ValueType>,
}

impl Target {
    pub fn var(&self) -> &Var {
        &self.var
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target { var: Var::new(name), value_type: None }
    }
}
impl From<Var> for Target {
    fn from(var: Var) -> Self {
        Target { var, value_type: None }
    }
}
impl From<(&str, ValueType)> for Target {
    fn from((name, value_type): (&str, ValueType)) -> Self {
        Target { var: Var::new(name), value_type: Some(value_type) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Or,
    Not,
}

#[derive(Clone, Debug)]
pub enum WhereClause {
    Pattern {
        entity: Term,
        attribute: Arc<Attribute>,
        value: Term,
    },
    /// Passed to the store verbatim.
    Raw(String),
    Join {
        kind: JoinKind,
        vars: Vec<Var>,
        branches: Vec<Vec<WhereClause>>,
    },
}

// ------------- Compiled form -------------
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    Var(String),
    Const(Wire),
    Blank,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    pub entity: Slot,
    pub attribute: String,
    pub value: Slot,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Clause {
    Pattern(Pattern),
    Raw(String),
    OrJoin {
        vars: Vec<String>,
        branches: Vec<Vec<Clause>>,
    },
    NotJoin {
        vars: Vec<String>,
        clauses: Vec<Clause>,
    },
}

/// What a snapshot executes: variables are stored without the `?`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryAst {
    pub find: Vec<String>,
    pub inputs: Vec<String>,
    pub clauses: Vec<Clause>,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Slot::Var(v) => write!(f, "?{}", v),
            Slot::Const(w) => write!(f, "{}", w),
            Slot::Blank => write!(f, "_"),
        }
    }
}

fn vars_edn(vars: &[String]) -> String {
    vars.iter()
        .map(|v| format!("?{}", v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn clauses_edn(clauses: &[Clause]) -> String {
    clauses
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Clause::Pattern(p) => write!(f, "[{} :{} {}]", p.entity, p.attribute, p.value),
            Clause::Raw(text) => write!(f, "{}", text),
            Clause::OrJoin { vars, branches } => {
                write!(f, "(or-join [{}]", vars_edn(vars))?;
                for branch in branches {
                    write!(f, " (and {})", clauses_edn(branch))?;
                }
                write!(f, ")")
            }
            Clause::NotJoin { vars, clauses } => {
                write!(f, "(not-join [{}] {})", vars_edn(vars), clauses_edn(clauses))
            }
        }
    }
}

impl fmt::Display for QueryAst {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[:find {} :in $", vars_edn(&self.find))?;
        if !self.inputs.is_empty() {
            write!(f, " {}", vars_edn(&self.inputs))?;
        }
        write!(f, " :where {}]", clauses_edn(&self.clauses))
    }
}

// ------------- Rows -------------
#[derive(Clone, Debug, PartialEq)]
pub enum Row {
    Value(Value),
    Map(BTreeMap<String, Value>),
}

impl Row {
    /// The single projected value, or the named one.
    pub fn get(&self, var: &str) -> Option<&Value> {
        match self {
            Row::Value(v) => Some(v),
            Row::Map(m) => m.get(var.trim_start_matches('?')),
        }
    }
    pub fn value(&self) -> Option<&Value> {
        match self {
            Row::Value(v) => Some(v),
            Row::Map(_) => None,
        }
    }
    pub fn into_value(self) -> Option<Value> {
        match self {
            Row::Value(v) => Some(v),
            Row::Map(_) => None,
        }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Row::Value(v) => write!(f, "{}", v),
            Row::Map(m) => {
                let cells: Vec<String> = m.iter().map(|(k, v)| format!("?{} {}", k, v)).collect();
                write!(f, "{{{}}}", cells.join(", "))
            }
        }
    }
}

/// Results of one execution, loaded lazily row by row.
pub struct Rows {
    db: Db,
    vars: Vec<String>,
    codecs: Vec<Arc<dyn Codec>>,
    raw: std::vec::IntoIter<Vec<Wire>>,
}

impl Iterator for Rows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.raw.next()?;
        let mut cells = Vec::with_capacity(raw.len());
        for (wire, codec) in raw.iter().zip(&self.codecs) {
            match codec.load(wire, &self.db) {
                Ok(value) => cells.push(value),
                Err(e) => return Some(Err(e)),
            }
        }
        if self.vars.len() == 1 {
            return cells.pop().map(|v| Ok(Row::Value(v)));
        }
        Some(Ok(Row::Map(self.vars.iter().cloned().zip(cells).collect())))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.raw.size_hint()
    }
}

// ------------- Query -------------
#[derive(Clone)]
pub struct Query {
    db: Db,
    find: Vec<Target>,
    inputs: Vec<(Var, Option<ValueType>)>,
    clauses: Vec<WhereClause>,
    bound: BTreeMap<Var, Value>,
}

impl Query {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            find: Vec::new(),
            inputs: Vec::new(),
            clauses: Vec::new(),
            bound: BTreeMap::new(),
        }
    }
    pub fn db(&self) -> &Db {
        &self.db
    }
    pub fn clauses(&self) -> &[WhereClause] {
        &self.clauses
    }
    /// Replaces the projection.
    pub fn find<I, T>(&self, targets: I) -> Query
    where
        I: IntoIterator<Item = T>,
        T: Into<Target>,
    {
        let mut next = self.clone();
        next.find = targets.into_iter().map(Into::into).collect();
        next
    }
    /// Appends an `[entity attribute value]` pattern.
    pub fn clause<E, V>(&self, entity: E, attribute: &Arc<Attribute>, value: V) -> Query
    where
        E: Into<Term>,
        V: Into<Term>,
    {
        let mut next = self.clone();
        next.clauses.push(WhereClause::Pattern {
            entity: entity.into(),
            attribute: Arc::clone(attribute),
            value: value.into(),
        });
        next
    }
    /// Appends clause text that is handed to the store as is.
    pub fn raw_clause(&self, text: &str) -> Query {
        let mut next = self.clone();
        next.clauses.push(WhereClause::Raw(text.to_string()));
        next
    }
    /// Declares untyped input variables.
    pub fn inputs<I, V>(&self, vars: I) -> Query
    where
        I: IntoIterator<Item = V>,
        V: Into<Var>,
    {
        let mut next = self.clone();
        for var in vars {
            let var = var.into();
            if !next.inputs.iter().any(|(v, _)| *v == var) {
                next.inputs.push((var, None));
            }
        }
        next
    }
    /// Declares an input variable with an explicit type.
    pub fn typed_input<V: Into<Var>>(&self, var: V, value_type: ValueType) -> Query {
        let mut next = self.clone();
        let var = var.into();
        match next.inputs.iter_mut().find(|(v, _)| *v == var) {
            Some(input) => input.1 = Some(value_type),
            None => next.inputs.push((var, Some(value_type))),
        }
        next
    }
    /// Supplies values for declared inputs.
    pub fn with<I, K, V>(&self, values: I) -> Query
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Var>,
        V: Into<Value>,
    {
        let mut next = self.clone();
        for (k, v) in values {
            next.bound.insert(k.into(), v.into());
        }
        next
    }
    pub fn bind<K: Into<Var>, V: Into<Value>>(&self, var: K, value: V) -> Query {
        self.with([(var, value)])
    }
    /// Adds a join scoped to `vars`. The builder receives an empty query on
    /// the same snapshot; the clauses of the branches it returns make up the
    /// join.
    pub fn join<I, V, F>(&self, kind: JoinKind, vars: I, build: F) -> Query
    where
        I: IntoIterator<Item = V>,
        V: Into<Var>,
        F: FnOnce(&Query) -> Vec<Query>,
    {
        let scratch = Query::new(self.db.clone());
        let branches = build(&scratch)
            .into_iter()
            .map(|q| q.clauses)
            .collect();
        let mut next = self.clone();
        next.clauses.push(WhereClause::Join {
            kind,
            vars: vars.into_iter().map(Into::into).collect(),
            branches,
        });
        next
    }
    /// Matches when any branch matches.
    pub fn or_join<I, V, F>(&self, vars: I, build: F) -> Query
    where
        I: IntoIterator<Item = V>,
        V: Into<Var>,
        F: FnOnce(&Query) -> Vec<Query>,
    {
        self.join(JoinKind::Or, vars, build)
    }
    /// Matches when the branch has no match.
    pub fn not_join<I, V, F>(&self, vars: I, build: F) -> Query
    where
        I: IntoIterator<Item = V>,
        V: Into<Var>,
        F: FnOnce(&Query) -> Query,
    {
        self.join(JoinKind::Not, vars, |q| vec![build(q)])
    }

    /// Declared inputs that have no value yet.
    pub fn free_vars(&self) -> Vec<Var> {
        self.inputs
            .iter()
            .filter(|(v, _)| !self.bound.contains_key(v))
            .map(|(v, _)| v.clone())
            .collect()
    }

    /// Resolves the type a variable's values are loaded and dumped with.
    pub fn type_for<V: Into<Var>>(&self, var: V) -> Result<ValueType> {
        let var = var.into();
        if let Some(t) = self.find.iter().find(|t| t.var == var).and_then(|t| t.value_type.clone()) {
            return Ok(t);
        }
        if let Some(t) = self
            .inputs
            .iter()
            .find(|(v, _)| *v == var)
            .and_then(|(_, t)| t.clone())
        {
            return Ok(t);
        }
        let mut in_value = Vec::new();
        let mut in_entity = Vec::new();
        collect_types(&self.clauses, &var, &mut in_value, &mut in_entity);
        for candidates in [in_value, in_entity] {
            if let Some(first) = candidates.first() {
                if let Some(other) = candidates.iter().find(|t| *t != first) {
                    return Err(FacetError::ConflictingType {
                        var: var.name().to_string(),
                        first: first.to_string(),
                        second: other.to_string(),
                    });
                }
                return Ok(first.clone());
            }
        }
        Err(FacetError::UnresolvedType(var.name().to_string()))
    }

    /// Compiles the clauses, failing on projected variables that nothing
    /// defines.
    pub fn to_ast(&self) -> Result<QueryAst> {
        let mut defined = BTreeSet::new();
        collect_vars(&self.clauses, &mut defined);
        for (v, _) in &self.inputs {
            defined.insert(v.name().to_string());
        }
        for target in &self.find {
            if !defined.contains(target.var.name()) {
                return Err(FacetError::UndefinedVariable(target.var.name().to_string()));
            }
        }
        Ok(QueryAst {
            find: self.find.iter().map(|t| t.var.name().to_string()).collect(),
            inputs: self.inputs.iter().map(|(v, _)| v.name().to_string()).collect(),
            clauses: self.compile(&self.clauses)?,
        })
    }

    fn compile(&self, clauses: &[WhereClause]) -> Result<Vec<Clause>> {
        let mut compiled = Vec::with_capacity(clauses.len());
        for clause in clauses {
            compiled.push(match clause {
                WhereClause::Pattern { entity, attribute, value } => Clause::Pattern(Pattern {
                    entity: self.entity_slot(entity)?,
                    attribute: attribute.external_key().to_string(),
                    value: self.value_slot(value, attribute)?,
                }),
                WhereClause::Raw(text) => Clause::Raw(text.clone()),
                WhereClause::Join { kind, vars, branches } => {
                    let vars = vars.iter().map(|v| v.name().to_string()).collect();
                    match kind {
                        JoinKind::Or => {
                            let mut compiled_branches = Vec::with_capacity(branches.len());
                            for branch in branches {
                                compiled_branches.push(self.compile(branch)?);
                            }
                            Clause::OrJoin { vars, branches: compiled_branches }
                        }
                        JoinKind::Not => {
                            let mut negated = Vec::new();
                            for branch in branches {
                                negated.extend(self.compile(branch)?);
                            }
                            Clause::NotJoin { vars, clauses: negated }
                        }
                    }
                }
            });
        }
        Ok(compiled)
    }

    fn entity_slot(&self, term: &Term) -> Result<Slot> {
        match term {
            Term::Var(v) => Ok(Slot::Var(v.name().to_string())),
            Term::Blank => Ok(Slot::Blank),
            Term::Value(value) => match value {
                Value::Long(l) => Ok(Slot::Const(Wire::Long(*l))),
                other => other
                    .ref_id()
                    .map(|id| Slot::Const(Wire::Ref(id)))
                    .ok_or_else(|| FacetError::TypeMismatch {
                        expected: String::from("entity"),
                        found: format!("{} {}", other.kind(), other),
                    }),
            },
        }
    }

    fn value_slot(&self, term: &Term, attribute: &Attribute) -> Result<Slot> {
        match term {
            Term::Var(v) => Ok(Slot::Var(v.name().to_string())),
            Term::Blank => Ok(Slot::Blank),
            Term::Value(value) => {
                let codec = self.db.codec_for(attribute.value_type().element())?;
                Ok(Slot::Const(codec.dump(value)?))
            }
        }
    }

    /// Wire values for the inputs, in declaration order.
    pub fn input_values(&self) -> Result<Vec<Wire>> {
        let free = self.free_vars();
        if !free.is_empty() {
            return Err(FacetError::UnboundVariable(
                free.iter().map(|v| v.name().to_string()).collect(),
            ));
        }
        let mut wires = Vec::with_capacity(self.inputs.len());
        for (var, _) in &self.inputs {
            let value_type = self.type_for(var)?;
            let value = self.bound.get(var).unwrap_or(&Value::Nil);
            wires.push(self.db.codec_for(&value_type)?.dump(value)?);
        }
        Ok(wires)
    }

    /// Executes the query. Every call runs it again against the bound
    /// snapshot.
    pub fn rows(&self) -> Result<Rows> {
        let inputs = self.input_values()?;
        let ast = self.to_ast()?;
        let mut codecs = Vec::with_capacity(self.find.len());
        for target in &self.find {
            codecs.push(self.db.codec_for(&self.type_for(&target.var)?)?);
        }
        debug!(query = %ast, basis_t = self.db.basis_t(), "Executing query");
        let raw = self.db.snapshot().q(&ast, &inputs)?;
        Ok(Rows {
            db: self.db.clone(),
            vars: ast.find,
            codecs,
            raw: raw.into_iter(),
        })
    }
    pub fn to_vec(&self) -> Result<Vec<Row>> {
        self.rows()?.collect()
    }
    pub fn first(&self) -> Result<Option<Row>> {
        self.rows()?.next().transpose()
    }
    /// Rows of a single projected entity variable as instances.
    pub fn instances(&self) -> Result<Vec<Instance>> {
        let mut instances = Vec::new();
        for row in self.rows()? {
            match row? {
                Row::Value(Value::Ref(instance)) => instances.push(instance),
                other => {
                    return Err(FacetError::TypeMismatch {
                        expected: String::from("instance"),
                        found: other.to_string(),
                    });
                }
            }
        }
        Ok(instances)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Query")
            .field("find", &self.find)
            .field("inputs", &self.inputs)
            .field("clauses", &self.clauses)
            .field("bound", &self.bound)
            .field("basis_t", &self.db.basis_t())
            .finish()
    }
}

fn collect_types(
    clauses: &[WhereClause],
    var: &Var,
    in_value: &mut Vec<ValueType>,
    in_entity: &mut Vec<ValueType>,
) {
    for clause in clauses {
        match clause {
            WhereClause::Pattern { entity, attribute, value } => {
                if matches!(value, Term::Var(v) if v == var) {
                    in_value.push(attribute.value_type().element().clone());
                }
                if matches!(entity, Term::Var(v) if v == var) {
                    in_entity.push(ValueType::reference(attribute.model()));
                }
            }
            WhereClause::Raw(_) => (),
            WhereClause::Join { branches, .. } => {
                for branch in branches {
                    collect_types(branch, var, in_value, in_entity);
                }
            }
        }
    }
}

fn collect_vars(clauses: &[WhereClause], defined: &mut BTreeSet<String>) {
    for clause in clauses {
        match clause {
            WhereClause::Pattern { entity, value, .. } => {
                for term in [entity, value] {
                    if let Term::Var(v) = term {
                        defined.insert(v.name().to_string());
                    }
                }
            }
            WhereClause::Raw(text) => {
                for capture in RAW_VARIABLE.captures_iter(text) {
                    defined.insert(capture[1].to_string());
                }
            }
            // only the join vars reach the outer query
            WhereClause::Join { vars, .. } => {
                defined.extend(vars.iter().map(|v| v.name().to_string()));
            }
        }
    }
}
