use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ptq_common::{EngineConfig, MetricsRegistry, PtqError, QueryId, Result};
use ptq_execution::{Advice, Baggage, QueryResults, Value};
use ptq_planner::{explain_query, PtQuery, QueryAdvice, Tracepoint, WeaveSpec};
use tracing::{debug, info};

use crate::session::{Session, SharedSession, WovenAdvice};

/// Facade over the query catalog, compiler, and installed advice.
///
/// Cloning shares one session. Installation takes write locks; invoking a
/// tracepoint only reads the installed set, so threads may invoke
/// concurrently, each with its own baggage.
#[derive(Clone)]
pub struct Engine {
    session: SharedSession,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            session: Arc::new(Session::new(config)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.session.config
    }

    pub fn register_tracepoint(&self, tracepoint: Tracepoint) -> Arc<Tracepoint> {
        self.session
            .catalog
            .write()
            .expect("catalog lock poisoned")
            .register_tracepoint(tracepoint)
    }

    pub fn tracepoint(&self, name: &str) -> Option<Arc<Tracepoint>> {
        self.session
            .catalog
            .read()
            .expect("catalog lock poisoned")
            .tracepoint(name)
            .cloned()
    }

    /// Parse a textual query and register it under `name` so later queries
    /// can join it.
    pub fn parse_query(&self, name: &str, text: &str) -> Result<PtQuery> {
        self.session
            .catalog
            .write()
            .expect("catalog lock poisoned")
            .parse_named(name, text)
    }

    /// Run the builder closure against the catalog's variable arena.
    pub fn build_query<F>(&self, build: F) -> Result<PtQuery>
    where
        F: FnOnce(&mut ptq_planner::VarArena) -> Result<PtQuery>,
    {
        let mut catalog = self.session.catalog.write().expect("catalog lock poisoned");
        build(catalog.vars_mut())
    }

    /// The optimized form of `query`; unchanged when optimization is off.
    pub fn optimize(&self, query: &PtQuery) -> PtQuery {
        if !self.session.config.optimize_queries {
            return query.clone();
        }
        let mut catalog = self.session.catalog.write().expect("catalog lock poisoned");
        self.session.optimizer.optimize(query, catalog.vars_mut())
    }

    pub fn explain(&self, query: &PtQuery) -> String {
        let catalog = self.session.catalog.read().expect("catalog lock poisoned");
        explain_query(query, catalog.vars())
    }

    /// Optimize (if configured) and compile without installing.
    pub fn compile(&self, query: &PtQuery) -> Result<QueryAdvice> {
        let optimized = self.optimize(query);
        let catalog = self.session.catalog.read().expect("catalog lock poisoned");
        self.session
            .compiler
            .lock()
            .expect("compiler lock poisoned")
            .compile(&optimized, catalog.vars())
    }

    /// Compile `query` and weave its advice into the installed set.
    ///
    /// Nothing is installed if any advice fails to instantiate.
    pub fn install(&self, query: &PtQuery) -> Result<QueryId> {
        let compiled = self.compile(query)?;
        let query_id = compiled.query_id;
        let query_label = query_id.to_string();

        let mut woven = Vec::with_capacity(compiled.weaves.len());
        for weave in &compiled.weaves {
            let advice = match Advice::new(
                &weave.advice,
                &self.session.emits,
                self.session.config.baggage_enabled,
            ) {
                Ok(advice) => advice,
                Err(e) => {
                    self.session.emits.destroy(query_id);
                    return Err(e);
                }
            };
            woven.push((
                weave.tracepoint.clone(),
                Arc::new(WovenAdvice {
                    query_id,
                    advice_id: weave.advice_id,
                    exports: weave.exports.clone(),
                    advice,
                    query_label: query_label.clone(),
                    advice_label: weave.advice_id.to_string(),
                }),
            ));
        }

        let mut installed = self.session.installed.write().expect("installed lock poisoned");
        for (tracepoint, advice) in woven {
            debug!(
                query_id = %query_id,
                advice_id = %advice.advice_id,
                tracepoint = %tracepoint,
                "woven advice"
            );
            installed
                .by_tracepoint
                .entry(tracepoint)
                .or_default()
                .push(advice);
        }
        info!(
            query_id = %query_id,
            weaves = compiled.weaves.len(),
            "query installed"
        );
        installed.queries.insert(query_id, compiled);
        self.session
            .metrics
            .set_installed_queries(installed.queries.len() as u64);
        Ok(query_id)
    }

    /// Install a query previously registered with [`Engine::parse_query`].
    pub fn install_named(&self, name: &str) -> Result<QueryId> {
        let query = self
            .session
            .catalog
            .read()
            .expect("catalog lock poisoned")
            .query(name)
            .cloned()
            .ok_or_else(|| PtqError::Planning(format!("unknown query '{name}'")))?;
        self.install(&query)
    }

    /// Remove a query's advice and its emit sink. Pending results are lost.
    pub fn uninstall(&self, query_id: QueryId) -> bool {
        let mut installed = self.session.installed.write().expect("installed lock poisoned");
        if !installed.remove(query_id) {
            return false;
        }
        self.session.emits.destroy(query_id);
        self.session
            .metrics
            .set_installed_queries(installed.queries.len() as u64);
        info!(query_id = %query_id, "query uninstalled");
        true
    }

    /// Run every advice woven at `tracepoint`, in installation order.
    ///
    /// Each advice observes its exported fields from `fields`; missing
    /// default exports are filled in from the process, anything else is
    /// null. Returns the number of advice invoked.
    pub fn invoke(
        &self,
        tracepoint: &str,
        baggage: &mut Baggage,
        fields: &HashMap<String, Value>,
    ) -> usize {
        let woven: Vec<Arc<WovenAdvice>> = self
            .session
            .installed
            .read()
            .expect("installed lock poisoned")
            .by_tracepoint
            .get(tracepoint)
            .cloned()
            .unwrap_or_default();

        for w in &woven {
            let observed: Vec<Value> = w
                .exports
                .iter()
                .map(|field| {
                    fields
                        .get(field)
                        .cloned()
                        .or_else(|| default_export(field))
                        .unwrap_or(Value::Null)
                })
                .collect();
            let started = Instant::now();
            let stats = w.advice.advise(baggage, &observed);
            self.session.metrics.record_advice(
                &w.query_label,
                &w.advice_label,
                tracepoint,
                stats.rows_in as u64,
                stats.rows_dropped as u64,
                stats.rows_out as u64,
                started.elapsed().as_secs_f64(),
            );
        }
        woven.len()
    }

    /// Drain every emit sink.
    pub fn collect_results(&self) -> Vec<QueryResults> {
        let results = self.session.emits.collect(now_ms());
        for r in &results {
            self.session
                .metrics
                .inc_results_reported(&r.output_id.to_string());
        }
        results
    }

    pub fn query_advice(&self, query_id: QueryId) -> Option<QueryAdvice> {
        self.session
            .installed
            .read()
            .expect("installed lock poisoned")
            .queries
            .get(&query_id)
            .cloned()
    }

    /// Weave specs of every installed query, ordered by query id.
    pub fn weave_specs(&self) -> Vec<WeaveSpec> {
        self.session
            .installed
            .read()
            .expect("installed lock poisoned")
            .queries
            .values()
            .flat_map(|q| q.weaves.iter().cloned())
            .collect()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.session.metrics
    }

    pub fn prometheus_metrics(&self) -> String {
        self.session.metrics.render_prometheus()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Process-level values for the fields every tracepoint exports by default.
fn default_export(field: &str) -> Option<Value> {
    match field {
        "host" => Some(Value::Str(
            std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        )),
        "timestamp" => Some(Value::Int(now_ms() as i64)),
        "proc_id" => Some(Value::Int(i64::from(std::process::id()))),
        "proc_name" => std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .map(Value::Str),
        "thread_id" => Some(Value::Str(format!("{:?}", std::thread::current().id()))),
        _ => None,
    }
}
