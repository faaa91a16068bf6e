use crate::advice_spec::{AdviceSpec, BagSpec, OutputSpec, QueryAdvice};
use crate::query::{PtQuery, QuerySource, Stage};
use crate::vars::{VarArena, VarDef, VarId};

/// Render a query tree as human-readable multiline text.
pub fn explain_query(query: &PtQuery, vars: &VarArena) -> String {
    let mut s = String::new();
    fmt_query(query, vars, 0, &mut s);
    s
}

fn fmt_query(q: &PtQuery, vars: &VarArena, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    let source = match q.source() {
        QuerySource::Named { alias, tracepoint } => format!("{alias} in {}", tracepoint.name()),
        QuerySource::Unnamed { tracepoint } => tracepoint.name().to_string(),
    };
    out.push_str(&format!("{pad}{} from {source}\n", q.stage().name()));
    if !q.observed().is_empty() {
        let observed: Vec<&str> = q.observed().keys().map(String::as_str).collect();
        out.push_str(&format!("{pad}  observe {}\n", observed.join(", ")));
    }
    for (name, id) in q.constructed() {
        if let VarDef::Let { expr, args, .. } = vars.get(*id) {
            out.push_str(&format!("{pad}  let {name} = {expr} {}\n", fmt_vars(vars, args)));
        }
    }
    for cond in q.conditions() {
        out.push_str(&format!(
            "{pad}  where {} {}\n",
            cond.expr,
            fmt_vars(vars, &cond.args)
        ));
    }
    match q.stage() {
        Stage::Partial => {}
        Stage::Select { selected } => {
            out.push_str(&format!("{pad}  select {}\n", fmt_vars(vars, selected)));
        }
        Stage::GroupBy {
            group_by,
            aggregates,
        } => {
            out.push_str(&format!("{pad}  groupby {}\n", fmt_vars(vars, group_by)));
            for a in aggregates {
                let input = a.input.map(|i| vars.label(i)).unwrap_or_default();
                out.push_str(&format!("{pad}    {}({input})\n", a.kind));
            }
        }
        Stage::Filter { kind } => out.push_str(&format!("{pad}  filter {kind}\n")),
    }
    let outputs: Vec<VarId> = q.outputs().iter().copied().collect();
    out.push_str(&format!("{pad}  outputs {}\n", fmt_vars(vars, &outputs)));
    for (alias, upstream) in q.happened_before() {
        out.push_str(&format!("{pad}  join {alias}:\n"));
        fmt_query(upstream, vars, indent + 2, out);
    }
}

fn fmt_vars(vars: &VarArena, ids: &[VarId]) -> String {
    let labels: Vec<String> = ids.iter().map(|id| vars.label(*id)).collect();
    format!("[{}]", labels.join(", "))
}

/// Render compiled advice, one block per weave.
pub fn explain_advice(advice: &QueryAdvice) -> String {
    let mut s = format!("Query {}\n", advice.query_id);
    for weave in &advice.weaves {
        s.push_str(&format!(
            "  Advice {} at {} exports=[{}]\n",
            weave.advice_id,
            weave.tracepoint,
            weave.exports.join(", ")
        ));
        fmt_advice(&weave.advice, 2, &mut s);
    }
    s
}

fn fmt_advice(spec: &AdviceSpec, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    if !spec.observe.is_empty() {
        out.push_str(&format!("{pad}OBSERVE {}\n", spec.observe.join(", ")));
    }
    for u in &spec.unpack {
        out.push_str(&format!("{pad}UNPACK {} {}\n", u.bag_id, fmt_bag(&u.bag)));
    }
    for l in &spec.lets {
        out.push_str(&format!(
            "{pad}LET {} = {} [{}]\n",
            l.name,
            l.expr,
            l.args.join(", ")
        ));
    }
    for w in &spec.wheres {
        out.push_str(&format!("{pad}WHERE {} [{}]\n", w.expr, w.args.join(", ")));
    }
    match &spec.output {
        OutputSpec::Pack { bag_id, bag } => {
            out.push_str(&format!("{pad}PACK {bag_id} {}\n", fmt_bag(bag)));
        }
        OutputSpec::Emit { output_id, bag } => {
            out.push_str(&format!("{pad}EMIT {output_id} {}\n", fmt_bag(bag)));
        }
    }
}

fn fmt_bag(bag: &BagSpec) -> String {
    match bag {
        BagSpec::Tuple(t) => format!("tuple[{}]", t.vars.join(", ")),
        BagSpec::Filter(f) => format!("{}[{}]", f.kind, f.vars.join(", ")),
        BagSpec::GroupBy(g) => {
            let aggs: Vec<String> = g
                .aggregates
                .iter()
                .map(|a| format!("{}({})", a.how, a.name))
                .collect();
            format!(
                "groupby[{}] aggregate[{}]",
                g.group_by.join(", "),
                aggs.join(", ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ptq_common::QueryId;

    use super::{explain_advice, explain_query};
    use crate::compiler::compile_query;
    use crate::query::PtQuery;
    use crate::tracepoint::Tracepoint;
    use crate::vars::VarArena;

    #[test]
    fn explains_query_and_advice() {
        let mut vars = VarArena::new();
        let q = PtQuery::from_named("x", Arc::new(Tracepoint::new("t0", ["host", "delta"])))
            .unwrap()
            .where_clause(&mut vars, "{}>0", &["x.delta"])
            .unwrap()
            .group_by(&mut vars, &["x.host"])
            .unwrap()
            .count(&mut vars)
            .unwrap();
        let text = explain_query(&q, &vars);
        assert!(text.starts_with("GroupBy from x in t0\n"));
        assert!(text.contains("  where {}>0 [delta]\n"));
        assert!(text.contains("  groupby [host]\n"));
        assert!(text.contains("    COUNT()\n"));

        let advice = compile_query(QueryId(4), &q, &vars).unwrap();
        let text = explain_advice(&advice);
        assert!(text.starts_with("Query 4\n  Advice 4.0 at t0 exports=[delta, host]\n"));
        assert!(text.contains("    WHERE {}>0 [0.delta]\n"));
        assert!(text.contains("    EMIT 4 groupby[1.host] aggregate[COUNT(2.COUNT)]\n"));
    }
}
