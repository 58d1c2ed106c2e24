// parsing of raw where-clauses handed to the reference store
use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::datatype::Wire;
use crate::error::{FacetError, Result};
use crate::query::{Pattern, Slot};

#[derive(Parser)]
#[grammar = "datalog.pest"]
pub struct DatalogParser;

/// Parses one or more `[entity attribute value]` patterns.
pub fn parse_clauses(text: &str) -> Result<Vec<Pattern>> {
    let mut parsed = DatalogParser::parse(Rule::clauses, text)?;
    let mut patterns = Vec::new();
    if let Some(clauses) = parsed.next() {
        for clause in clauses.into_inner() {
            if clause.as_rule() != Rule::clause {
                continue;
            }
            for pattern in clause.into_inner() {
                patterns.push(parse_pattern(pattern)?);
            }
        }
    }
    Ok(patterns)
}

fn parse_pattern(pair: Pair<Rule>) -> Result<Pattern> {
    let mut entity = Slot::Blank;
    let mut attribute = String::new();
    let mut value = Slot::Blank;
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::entity => entity = parse_slot(part)?,
            Rule::attribute => {
                attribute = part.as_str().trim_start_matches(':').to_string();
            }
            Rule::value => value = parse_slot(part)?,
            _ => (),
        }
    }
    Ok(Pattern {
        entity,
        attribute,
        value,
    })
}

fn parse_slot(pair: Pair<Rule>) -> Result<Slot> {
    let text = pair.as_str();
    let inner = pair.into_inner().next().ok_or_else(|| FacetError::Parse {
        message: format!("Empty term: {}", text),
    })?;
    let slot = match inner.as_rule() {
        Rule::variable => Slot::Var(inner.as_str().trim_start_matches('?').to_string()),
        Rule::blank => Slot::Blank,
        Rule::integer => Slot::Const(Wire::Long(inner.as_str().parse().map_err(|_| {
            FacetError::Parse {
                message: format!("Integer out of range: {}", inner.as_str()),
            }
        })?)),
        Rule::boolean => Slot::Const(Wire::Boolean(inner.as_str() == "true")),
        Rule::keyword => Slot::Const(Wire::Keyword(inner.as_str()[1..].to_string())),
        Rule::string => {
            let raw = inner.into_inner().next().map(|i| i.as_str()).unwrap_or("");
            Slot::Const(Wire::String(unescape(raw)))
        }
        other => {
            return Err(FacetError::Parse {
                message: format!("Unexpected {:?} in {}", other, text),
            });
        }
    };
    Ok(slot)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
                None => (),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracketed_and_bare_patterns() {
        let patterns = parse_clauses(r#"[?e :ns.sample/foo "a \"b\""] ?e ns.sample/_parent _"#).unwrap();
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].entity, Slot::Var("e".into()));
        assert_eq!(patterns[0].attribute, "ns.sample/foo");
        assert_eq!(patterns[0].value, Slot::Const(Wire::String("a \"b\"".into())));
        assert_eq!(patterns[1].attribute, "ns.sample/_parent");
        assert_eq!(patterns[1].value, Slot::Blank);
    }

    #[test]
    fn literal_values() {
        let patterns =
            parse_clauses("[42 :n/count -3] [_ :n/flag true] [?x :n/kind :n.kind/big]").unwrap();
        assert_eq!(patterns[0].entity, Slot::Const(Wire::Long(42)));
        assert_eq!(patterns[0].value, Slot::Const(Wire::Long(-3)));
        assert_eq!(patterns[1].entity, Slot::Blank);
        assert_eq!(patterns[1].value, Slot::Const(Wire::Boolean(true)));
        assert_eq!(patterns[2].value, Slot::Const(Wire::Keyword("n.kind/big".into())));
    }

    #[test]
    fn malformed_clauses_fail() {
        assert!(matches!(
            parse_clauses("[?e :n/x"),
            Err(FacetError::Parse { .. })
        ));
        assert!(parse_clauses("").is_err());
    }
}
