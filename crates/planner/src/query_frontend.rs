//! Line-oriented textual query frontend.
//!
//! ```text
//! from x in DataNodeMetrics
//! join cl in FIRST(ClientProtocols) on cl -> x
//! where "{}"!="localhost" x.host
//! let kb {}/1024 x.bytes
//! groupby cl.procName
//! select cl.procName SUM(kb) COUNT
//! ```
//!
//! Keywords are case-insensitive, blank lines are skipped, and commas
//! between names are ignored. Expression templates are single tokens.

use std::collections::HashMap;
use std::sync::Arc;

use ptq_common::{PtqError, Result};
use tracing::debug;

use crate::advice_spec::{AggKind, FilterKind};
use crate::query::{parse_aggregate, valid_var_name, PtQuery};
use crate::tracepoint::Tracepoint;
use crate::vars::VarArena;

/// Registered tracepoints, named queries, and the arena their variables live in.
#[derive(Debug, Default)]
pub struct QueryCatalog {
    tracepoints: HashMap<String, Arc<Tracepoint>>,
    queries: HashMap<String, PtQuery>,
    vars: VarArena,
}

impl QueryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tracepoint(&mut self, tracepoint: Tracepoint) -> Arc<Tracepoint> {
        let tracepoint = Arc::new(tracepoint);
        self.tracepoints
            .insert(tracepoint.name.clone(), Arc::clone(&tracepoint));
        tracepoint
    }

    pub fn tracepoint(&self, name: &str) -> Option<&Arc<Tracepoint>> {
        self.tracepoints.get(name)
    }

    /// Make `query` joinable by `name` from later queries.
    pub fn register_query(&mut self, name: &str, query: PtQuery) -> Result<()> {
        if !valid_var_name(name) {
            return Err(PtqError::Planning(format!("invalid query name '{name}'")));
        }
        if self.tracepoints.contains_key(name) {
            return Err(PtqError::Planning(format!(
                "query name '{name}' conflicts with a tracepoint"
            )));
        }
        self.queries.insert(name.to_string(), query);
        Ok(())
    }

    pub fn query(&self, name: &str) -> Option<&PtQuery> {
        self.queries.get(name)
    }

    pub fn vars(&self) -> &VarArena {
        &self.vars
    }

    pub fn vars_mut(&mut self) -> &mut VarArena {
        &mut self.vars
    }

    /// Parse `text` and register the result under `name`.
    pub fn parse_named(&mut self, name: &str, text: &str) -> Result<PtQuery> {
        let query = self.parse(text)?;
        self.register_query(name, query.clone())?;
        debug!(query = name, "registered query");
        Ok(query)
    }

    pub fn parse(&mut self, text: &str) -> Result<PtQuery> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let first = lines
            .next()
            .ok_or_else(|| PtqError::Parse("empty query".to_string()))?;
        let mut query = self.parse_from(&tokenize(first))?;

        while let Some(line) = lines.next() {
            let tokens = tokenize(line);
            match tokens[0].to_ascii_lowercase().as_str() {
                "from" => {
                    return Err(PtqError::Parse(
                        "a query has exactly one from line".to_string(),
                    ))
                }
                "join" => query = self.parse_join(&query, &tokens)?,
                "where" => query = self.parse_where(&query, &tokens)?,
                "let" => query = self.parse_let(&query, &tokens)?,
                "select" => {
                    let names = names(&tokens[1..]);
                    if names.is_empty() {
                        return Err(PtqError::Parse("select lists no variables".to_string()));
                    }
                    let query = query.select(&mut self.vars, &names)?;
                    return finish(lines, query);
                }
                "groupby" => {
                    let select = lines.next().ok_or_else(|| {
                        PtqError::Parse("groupby must be followed by a select".to_string())
                    })?;
                    let query = self.parse_group_by(&query, &tokens, &tokenize(select))?;
                    return finish(lines, query);
                }
                other => return Err(PtqError::Parse(format!("unknown keyword '{other}'"))),
            }
        }
        Ok(query)
    }

    fn lookup_tracepoint(&self, name: &str) -> Result<Arc<Tracepoint>> {
        self.tracepoints
            .get(name)
            .cloned()
            .ok_or_else(|| PtqError::Planning(format!("unknown tracepoint '{name}'")))
    }

    fn parse_from(&mut self, tokens: &[&str]) -> Result<PtQuery> {
        if !tokens[0].eq_ignore_ascii_case("from") {
            return Err(PtqError::Parse(format!(
                "query must start with from, found '{}'",
                tokens[0]
            )));
        }
        match tokens {
            [_, tracepoint] => Ok(PtQuery::from(self.lookup_tracepoint(tracepoint)?)),
            [_, alias, kw, tracepoint] if kw.eq_ignore_ascii_case("in") => {
                PtQuery::from_named(alias, self.lookup_tracepoint(tracepoint)?)
            }
            _ => Err(PtqError::Parse(
                "expected 'from <tracepoint>' or 'from <alias> in <tracepoint>'".to_string(),
            )),
        }
    }

    fn parse_join(&mut self, query: &PtQuery, tokens: &[&str]) -> Result<PtQuery> {
        let [_, x, kw_in, source, kw_on, x2, arrow, target] = tokens else {
            return Err(PtqError::Parse(
                "expected 'join <alias> in <source> on <alias> -> <alias>'".to_string(),
            ));
        };
        if !kw_in.eq_ignore_ascii_case("in") || !kw_on.eq_ignore_ascii_case("on") || *arrow != "->"
        {
            return Err(PtqError::Parse(format!("malformed join '{}'", tokens.join(" "))));
        }
        if x != x2 {
            return Err(PtqError::Parse(format!(
                "join declares '{x}' but orders '{x2}'"
            )));
        }
        let Some(alias) = query.source().alias() else {
            return Err(PtqError::Parse(
                "joins require 'from <alias> in <tracepoint>'".to_string(),
            ));
        };
        let (filter, source) = parse_filtered(source)?;

        let upstream = match self.tracepoints.get(source) {
            Some(tp) => PtQuery::from(Arc::clone(tp)),
            None => self
                .queries
                .get(source)
                .cloned()
                .ok_or_else(|| {
                    PtqError::Planning(format!("unknown tracepoint or query '{source}'"))
                })?,
        };

        if *target == alias {
            query.happened_before_join(&mut self.vars, x, &upstream, filter)
        } else if query.happened_before().contains_key(*target) {
            query.happened_before_join_via(&mut self.vars, target, x, &upstream, filter)
        } else {
            Err(PtqError::Parse(format!(
                "join target '{target}' is neither '{alias}' nor a joined alias"
            )))
        }
    }

    fn parse_where(&mut self, query: &PtQuery, tokens: &[&str]) -> Result<PtQuery> {
        let Some(expr) = tokens.get(1) else {
            return Err(PtqError::Parse("where needs an expression".to_string()));
        };
        query.where_clause(&mut self.vars, expr, &names(&tokens[2..]))
    }

    fn parse_let(&mut self, query: &PtQuery, tokens: &[&str]) -> Result<PtQuery> {
        let (Some(name), Some(expr)) = (tokens.get(1), tokens.get(2)) else {
            return Err(PtqError::Parse(
                "expected 'let <name> <expression> <args...>'".to_string(),
            ));
        };
        query.let_var(&mut self.vars, name, expr, &names(&tokens[3..]))
    }

    fn parse_group_by(
        &mut self,
        query: &PtQuery,
        group_tokens: &[&str],
        select_tokens: &[&str],
    ) -> Result<PtQuery> {
        if !select_tokens[0].eq_ignore_ascii_case("select") {
            return Err(PtqError::Parse(format!(
                "groupby must be followed by a select, found '{}'",
                select_tokens[0]
            )));
        }
        let keys = names(&group_tokens[1..]);
        let selected = names(&select_tokens[1..]);
        if selected.len() < keys.len() || selected[..keys.len()] != keys[..] {
            return Err(PtqError::Parse(format!(
                "select must begin with the groupby variables [{}]",
                keys.join(", ")
            )));
        }
        let aggregations = &selected[keys.len()..];
        if aggregations.is_empty() {
            return Err(PtqError::Parse(
                "a groupby select needs at least one aggregation".to_string(),
            ));
        }

        let mut query = query.group_by(&mut self.vars, &keys)?;
        for name in aggregations {
            query = match parse_aggregate(name) {
                Some((AggKind::Count, None)) => query.count(&mut self.vars)?,
                Some((kind, Some(operand))) => query.aggregate(&mut self.vars, operand, kind)?,
                _ => {
                    return Err(PtqError::Parse(format!(
                        "'{name}' is neither COUNT nor AGG(variable)"
                    )))
                }
            };
        }
        Ok(query)
    }
}

fn finish<'a>(mut rest: impl Iterator<Item = &'a str>, query: PtQuery) -> Result<PtQuery> {
    match rest.next() {
        Some(line) => Err(PtqError::Parse(format!(
            "unexpected line after select: '{line}'"
        ))),
        None => Ok(query),
    }
}

fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Variable names from tokens, splitting and dropping commas.
fn names<'a>(tokens: &[&'a str]) -> Vec<&'a str> {
    tokens
        .iter()
        .flat_map(|t| t.split(','))
        .filter(|t| !t.is_empty())
        .collect()
}

/// `FIRST(X)`, `MOSTRECENT(X)`, `MOST_RECENT(X)`, or plain `X`.
fn parse_filtered(token: &str) -> Result<(Option<FilterKind>, &str)> {
    match token.split_once('(') {
        Some((kind, rest)) => {
            let inner = rest
                .strip_suffix(')')
                .filter(|inner| !inner.is_empty())
                .ok_or_else(|| PtqError::Parse(format!("malformed filter '{token}'")))?;
            Ok((Some(kind.parse()?), inner))
        }
        None => Ok((None, token)),
    }
}

#[cfg(test)]
mod tests {
    use super::{names, parse_filtered};
    use crate::advice_spec::FilterKind;

    #[test]
    fn names_ignore_commas() {
        assert_eq!(names(&["a,", "b", ",c,d"]), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn filtered_sources() {
        assert_eq!(
            parse_filtered("MOST_RECENT(Q1)").unwrap(),
            (Some(FilterKind::MostRecent), "Q1")
        );
        assert_eq!(parse_filtered("Q1").unwrap(), (None, "Q1"));
        assert!(parse_filtered("FIRST(").is_err());
        assert!(parse_filtered("LATEST(Q1)").is_err());
    }
}
