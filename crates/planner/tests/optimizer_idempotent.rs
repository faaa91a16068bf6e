use ptq_common::QueryId;
use ptq_planner::{
    compile_query, explain_query, Optimizer, OptimizerConfig, QueryCatalog, Stage, Tracepoint,
};

fn catalog() -> QueryCatalog {
    let mut catalog = QueryCatalog::new();
    catalog.register_tracepoint(Tracepoint::new("ClientRequest", ["proc_name", "host"]));
    catalog.register_tracepoint(Tracepoint::new("DataNodeRead", ["host", "delta"]));
    catalog.register_tracepoint(Tracepoint::new("NameNodeOp", ["op", "duration"]));
    catalog
}

const QUERIES: [&str; 4] = [
    "from x in ClientRequest\n\
     join dn in DataNodeRead on dn -> x\n\
     where \"{}\"!=\"localhost\" dn.host\n\
     let kb {}/1024 dn.delta\n\
     select x.proc_name kb",
    "from x in ClientRequest\n\
     join dn in DataNodeRead on dn -> x\n\
     join nn in NameNodeOp on nn -> x\n\
     groupby x.proc_name\n\
     select x.proc_name SUM(dn.delta) MAX(nn.duration) COUNT",
    "from x in ClientRequest\n\
     join dn in DataNodeRead on dn -> x\n\
     join nn in FIRST(NameNodeOp) on nn -> dn\n\
     where {}>{} dn.delta nn.duration\n\
     groupby dn.host\n\
     select dn.host MIN(nn.duration)",
    "from x in ClientRequest\n\
     join dn in DataNodeRead on dn -> x\n\
     where {}>0 dn.delta\n\
     groupby dn.host\n\
     select dn.host COUNT",
];

#[test]
fn optimizing_twice_compiles_to_the_same_advice() {
    for text in QUERIES {
        let mut catalog = catalog();
        let q = catalog.parse(text).unwrap();
        let optimizer = Optimizer::new(OptimizerConfig::default());

        let once = optimizer.optimize(&q, catalog.vars_mut());
        let twice = optimizer.optimize(&once, catalog.vars_mut());

        let a = compile_query(QueryId(1), &once, catalog.vars()).unwrap();
        let b = compile_query(QueryId(1), &twice, catalog.vars()).unwrap();
        assert_eq!(
            a,
            b,
            "not idempotent:\n{}",
            explain_query(&once, catalog.vars())
        );
    }
}

#[test]
fn optimized_queries_still_compile() {
    for text in QUERIES {
        let mut catalog = catalog();
        let q = catalog.parse(text).unwrap();
        let before = compile_query(QueryId(2), &q, catalog.vars()).unwrap();
        let opt = Optimizer::default().optimize(&q, catalog.vars_mut());
        let after = compile_query(QueryId(2), &opt, catalog.vars()).unwrap();
        assert_eq!(before.weaves.len(), after.weaves.len());
    }
}

#[test]
fn where_on_upstream_fields_moves_to_the_upstream_advice() {
    let mut catalog = catalog();
    let q = catalog.parse(QUERIES[0]).unwrap();
    let opt = Optimizer::default().optimize(&q, catalog.vars_mut());
    assert!(opt.conditions().is_empty());
    assert!(opt.constructed().is_empty());

    let advice = compile_query(QueryId(3), &opt, catalog.vars()).unwrap();
    let upstream = advice
        .weaves
        .iter()
        .find(|w| w.tracepoint == "DataNodeRead")
        .unwrap();
    assert_eq!(upstream.advice.wheres.len(), 1);
    assert_eq!(upstream.advice.lets.len(), 1);
    // Only the derived value crosses the happened-before edge.
    assert_eq!(upstream.advice.output.bag().arity(), 1);
}

#[test]
fn nested_filter_upstream_is_left_alone() {
    let mut catalog = catalog();
    let q = catalog.parse(QUERIES[2]).unwrap();
    let opt = Optimizer::default().optimize(&q, catalog.vars_mut());
    let dn = &opt.happened_before()["dn"];
    let nn = &dn.happened_before()["nn"];
    assert!(matches!(nn.stage(), Stage::Filter { .. }));
    assert_eq!(dn.conditions().len(), 1);
}
