use std::collections::HashMap;

use proptest::prelude::*;
use ptq_client::{Baggage, Engine, Value};
use ptq_common::EngineConfig;
use ptq_planner::Tracepoint;

fn engine() -> Engine {
    let engine = Engine::new(EngineConfig::default());
    engine.register_tracepoint(Tracepoint::new("Request", ["user"]));
    engine.register_tracepoint(Tracepoint::new("Read", ["bytes"]));
    let q = engine
        .parse_query(
            "per_user",
            "from r in Read\n\
             join q in Request on q -> r\n\
             groupby q.user\n\
             select q.user SUM(r.bytes) COUNT",
        )
        .unwrap();
    engine.install(&q).unwrap();
    engine
}

fn sorted_groups(engine: &Engine) -> Vec<String> {
    let mut out: Vec<String> = engine
        .collect_results()
        .into_iter()
        .flat_map(|r| r.groups)
        .map(|g| format!("{g:?}"))
        .collect();
    out.sort();
    out
}

/// Fork one branch per user, issue a request in each, and merge the
/// branches back in `order` before a final read.
fn run(users: &[u8], order: &[usize]) -> Vec<String> {
    let engine = engine();
    let mut root = Baggage::new();
    let branches: Vec<Baggage> = users
        .iter()
        .map(|u| {
            let mut b = root.split();
            let user = HashMap::from([("user".to_string(), Value::Str(format!("u{}", u % 4)))]);
            engine.invoke("Request", &mut b, &user);
            b
        })
        .collect();
    for &i in order {
        root.join(branches[i].clone());
    }
    let read = HashMap::from([("bytes".to_string(), Value::Int(10))]);
    engine.invoke("Read", &mut root, &read);
    sorted_groups(&engine)
}

proptest! {
    #[test]
    fn join_order_does_not_change_results(users in prop::collection::vec(any::<u8>(), 1..6)) {
        let forward: Vec<usize> = (0..users.len()).collect();
        let backward: Vec<usize> = forward.iter().rev().copied().collect();
        prop_assert_eq!(run(&users, &forward), run(&users, &backward));
    }
}
