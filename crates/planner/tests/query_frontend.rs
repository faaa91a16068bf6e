use ptq_common::PtqError;
use ptq_planner::{
    AggKind, BagSpec, CompilerContext, FilterKind, OutputSpec, QueryCatalog, Stage, Tracepoint,
};

fn catalog() -> QueryCatalog {
    let mut catalog = QueryCatalog::new();
    catalog.register_tracepoint(Tracepoint::new("t0", ["a", "b", "host"]));
    catalog.register_tracepoint(Tracepoint::new("t1", ["a", "c"]));
    catalog.register_tracepoint(Tracepoint::new("t2", ["d"]));
    catalog
}

fn is_parse_error(err: &PtqError) -> bool {
    matches!(err, PtqError::Parse(_))
}

#[test]
fn parses_select_with_join_where_and_let() {
    let mut catalog = catalog();
    let q = catalog
        .parse(
            "from x in t0\n\
             join y in t1 on y -> x\n\
             where {}<{} y.a x.a\n\
             let ac {}*{} y.a, y.c\n\
             select x.host, ac",
        )
        .unwrap();
    assert!(matches!(q.stage(), Stage::Select { selected } if selected.len() == 2));
    assert_eq!(q.conditions().len(), 1);
    assert!(q.constructed().contains_key("ac"));
    assert!(q.happened_before().contains_key("y"));
}

#[test]
fn parses_groupby_with_aggregates() {
    let mut catalog = catalog();
    let q = catalog
        .parse("FROM x IN t0\nGROUPBY x.host\nSELECT x.host SUM(x.a) max(x.b) COUNT")
        .unwrap();
    let Stage::GroupBy {
        group_by,
        aggregates,
    } = q.stage()
    else {
        panic!("expected groupby");
    };
    assert_eq!(group_by.len(), 1);
    let kinds: Vec<AggKind> = aggregates.iter().map(|a| a.kind).collect();
    assert_eq!(kinds, vec![AggKind::Sum, AggKind::Max, AggKind::Count]);
}

#[test]
fn joins_named_queries_with_filters() {
    let mut catalog = catalog();
    catalog
        .parse_named("Q1", "from y in t1\nwhere {}>0 y.a")
        .unwrap();
    let q = catalog
        .parse("from x in t0\njoin q in MOST_RECENT(Q1) on q -> x\nselect x.a q.y.c")
        .unwrap();
    assert_eq!(
        q.happened_before()["q"].stage(),
        &Stage::Filter {
            kind: FilterKind::MostRecent
        }
    );
    let advice = CompilerContext::new().compile(&q, catalog.vars()).unwrap();
    let root = advice.emitter().unwrap();
    assert!(matches!(root.advice.unpack[0].bag, BagSpec::Filter(_)));
    assert!(matches!(root.advice.output, OutputSpec::Emit { .. }));
}

#[test]
fn nested_join_registers_short_var() {
    let mut catalog = catalog();
    let q = catalog
        .parse(
            "from x in t0\n\
             join y in t1 on y -> x\n\
             join z in FIRST(t2) on z -> y\n\
             select x.a z.d",
        )
        .unwrap();
    assert_eq!(q.short_vars()["z"], "y.z");
    let y = &q.happened_before()["y"];
    assert!(y.happened_before().contains_key("z"));
    let advice = CompilerContext::new().compile(&q, catalog.vars()).unwrap();
    assert_eq!(advice.weaves.len(), 3);
}

#[test]
fn rejects_malformed_queries() {
    let mut catalog = catalog();
    let cases = [
        "",
        "select x.a",
        "from",
        "from x on t0",
        "from x in t0\njoin y in t1 on y x",
        "from x in t0\njoin y in t1 on z -> x",
        "from x in t0\njoin y in t1 on y -> w",
        "from t0\njoin y in t1 on y -> x",
        "from x in t0\nfrom y in t1",
        "from x in t0\nfilter x.a",
        "from x in t0\ngroupby x.a",
        "from x in t0\ngroupby x.a\nselect x.b COUNT",
        "from x in t0\ngroupby x.a\nselect x.a",
        "from x in t0\ngroupby x.a\nselect x.a AVG(x.b)",
        "from x in t0\nselect x.a\nwhere {} x.a",
        "from x in t0\njoin y in LATEST(t1) on y -> x",
        "from x in t0\nlet only_name",
    ];
    for text in cases {
        let err = catalog.parse(text).expect_err(text);
        assert!(is_parse_error(&err), "{text:?} gave {err}");
    }
}

#[test]
fn unknown_names_are_planning_errors() {
    let mut catalog = catalog();
    for text in [
        "from x in nowhere",
        "from x in t0\njoin y in nowhere on y -> x",
        "from x in t0\nselect x.missing",
        "from x in t0\nwhere {}>1 y.a",
        "from x in t0\njoin x in t1 on x -> x",
        "from x in t0\nlet x 1",
    ] {
        let err = catalog.parse(text).expect_err(text);
        assert!(matches!(err, PtqError::Planning(_)), "{text:?} gave {err}");
    }
}
