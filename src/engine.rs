// Evaluation of compiled queries against a `MemoryDb`. Clauses are applied in
// the order given; there is no planner.
use std::collections::{BTreeMap, HashSet};

use crate::construct::{MemoryDb, OtherHasher, reverse_of};
use crate::datalog::parse_clauses;
use crate::datatype::{EntityId, Wire};
use crate::error::{FacetError, Result};
use crate::query::{Clause, Pattern, QueryAst, Slot};

type Binding = BTreeMap<String, Wire>;

pub fn evaluate(db: &MemoryDb, query: &QueryAst, inputs: &[Wire]) -> Result<Vec<Vec<Wire>>> {
    if inputs.len() != query.inputs.len() {
        let missing = query.inputs.iter().skip(inputs.len()).cloned().collect();
        return Err(FacetError::UnboundVariable(missing));
    }
    let mut seed = Binding::new();
    for (var, value) in query.inputs.iter().zip(inputs) {
        seed.insert(var.clone(), value.clone());
    }
    let bindings = apply_all(db, vec![seed], &query.clauses)?;

    let mut seen = HashSet::<Vec<Wire>, OtherHasher>::default();
    let mut rows = Vec::new();
    for binding in bindings {
        let mut row = Vec::with_capacity(query.find.len());
        for var in &query.find {
            let value = binding
                .get(var)
                .ok_or_else(|| FacetError::UndefinedVariable(var.clone()))?;
            row.push(value.clone());
        }
        if seen.insert(row.clone()) {
            rows.push(row);
        }
    }
    Ok(rows)
}

fn apply_all(db: &MemoryDb, mut bindings: Vec<Binding>, clauses: &[Clause]) -> Result<Vec<Binding>> {
    for clause in clauses {
        if bindings.is_empty() {
            break;
        }
        bindings = apply(db, bindings, clause)?;
    }
    Ok(bindings)
}

fn apply(db: &MemoryDb, bindings: Vec<Binding>, clause: &Clause) -> Result<Vec<Binding>> {
    match clause {
        Clause::Pattern(pattern) => Ok(bindings
            .iter()
            .flat_map(|b| match_pattern(db, b, pattern))
            .collect()),
        Clause::Raw(text) => {
            let patterns: Vec<Clause> = parse_clauses(text)?
                .into_iter()
                .map(Clause::Pattern)
                .collect();
            apply_all(db, bindings, &patterns)
        }
        Clause::OrJoin { vars, branches } => {
            let mut joined = Vec::new();
            for binding in bindings {
                let seed = project(&binding, vars);
                let mut seen = HashSet::<Binding, OtherHasher>::default();
                for branch in branches {
                    for result in apply_all(db, vec![seed.clone()], branch)? {
                        let result = project(&result, vars);
                        if seen.insert(result.clone()) {
                            if let Some(merged) = merge(&binding, &result) {
                                joined.push(merged);
                            }
                        }
                    }
                }
            }
            Ok(joined)
        }
        Clause::NotJoin { vars, clauses } => {
            let mut kept = Vec::new();
            for binding in bindings {
                let seed = project(&binding, vars);
                if apply_all(db, vec![seed], clauses)?.is_empty() {
                    kept.push(binding);
                }
            }
            Ok(kept)
        }
    }
}

fn project(binding: &Binding, vars: &[String]) -> Binding {
    vars.iter()
        .filter_map(|v| binding.get(v).map(|w| (v.clone(), w.clone())))
        .collect()
}

fn merge(outer: &Binding, inner: &Binding) -> Option<Binding> {
    let mut merged = outer.clone();
    for (var, value) in inner {
        if !bind(&mut merged, var, value.clone()) {
            return None;
        }
    }
    Some(merged)
}

// Longs and refs denote the same entity when the numbers agree.
fn same(a: &Wire, b: &Wire) -> bool {
    match (a, b) {
        (Wire::Ref(x), Wire::Long(y)) | (Wire::Long(y), Wire::Ref(x)) => *y >= 0 && *x == *y as u64,
        _ => a == b,
    }
}

fn entity_id(w: &Wire) -> Option<EntityId> {
    match w {
        Wire::Ref(id) => Some(*id),
        Wire::Long(l) if *l >= 0 => Some(*l as EntityId),
        _ => None,
    }
}

fn bind(binding: &mut Binding, var: &str, value: Wire) -> bool {
    match binding.get(var) {
        Some(existing) => same(existing, &value),
        None => {
            binding.insert(var.to_string(), value);
            true
        }
    }
}

fn resolve<'b>(binding: &'b Binding, slot: &'b Slot) -> Option<&'b Wire> {
    match slot {
        Slot::Var(var) => binding.get(var),
        Slot::Const(w) => Some(w),
        Slot::Blank => None,
    }
}

fn extend(slot: &Slot, value: Wire, out: &mut Binding) -> bool {
    match slot {
        Slot::Var(var) => bind(out, var, value),
        _ => true,
    }
}

// All (entity, value) facts for `key` matching the optional constraints.
fn candidates(db: &MemoryDb, e: Option<&Wire>, key: &str, v: Option<&Wire>) -> Vec<(EntityId, Wire)> {
    let entities = match e {
        Some(w) => match entity_id(w) {
            Some(id) => vec![id],
            None => return Vec::new(),
        },
        None => db.entities_with(key),
    };
    let mut found = Vec::new();
    for id in entities {
        if let Some(values) = db.facts(id, key) {
            for value in values {
                if v.is_none_or(|v| same(v, value)) {
                    found.push((id, value.clone()));
                }
            }
        }
    }
    found
}

fn match_pattern(db: &MemoryDb, binding: &Binding, pattern: &Pattern) -> Vec<Binding> {
    let e = resolve(binding, &pattern.entity);
    let v = resolve(binding, &pattern.value);
    let mut matches = Vec::new();
    match reverse_of(&pattern.attribute) {
        // [e :ns/_attr v] holds when [v :ns/attr e] does
        Some(forward) => {
            for (holder, target) in candidates(db, v, &forward, e) {
                let mut out = binding.clone();
                if extend(&pattern.entity, target, &mut out)
                    && extend(&pattern.value, Wire::Ref(holder), &mut out)
                {
                    matches.push(out);
                }
            }
        }
        None => {
            for (id, value) in candidates(db, e, &pattern.attribute, v) {
                let mut out = binding.clone();
                if extend(&pattern.entity, Wire::Ref(id), &mut out)
                    && extend(&pattern.value, value, &mut out)
                {
                    matches.push(out);
                }
            }
        }
    }
    matches
}
