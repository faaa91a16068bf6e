use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use ptq_common::{BagId, EngineConfig, MetricsRegistry, QueryId};
use ptq_execution::{Advice, EmitRegistry};
use ptq_planner::{CompilerContext, Optimizer, OptimizerConfig, QueryAdvice, QueryCatalog};

pub type SharedSession = Arc<Session>;

/// One installed advice and the tracepoint fields it observes.
#[derive(Debug)]
pub(crate) struct WovenAdvice {
    pub query_id: QueryId,
    pub advice_id: BagId,
    pub exports: Vec<String>,
    pub advice: Advice,
    pub query_label: String,
    pub advice_label: String,
}

/// Installed queries, and their advice grouped by tracepoint in install order.
#[derive(Debug, Default)]
pub(crate) struct Installed {
    pub queries: BTreeMap<QueryId, QueryAdvice>,
    pub by_tracepoint: HashMap<String, Vec<Arc<WovenAdvice>>>,
}

impl Installed {
    pub fn remove(&mut self, query_id: QueryId) -> bool {
        if self.queries.remove(&query_id).is_none() {
            return false;
        }
        self.by_tracepoint.retain(|_, woven| {
            woven.retain(|w| w.query_id != query_id);
            !woven.is_empty()
        });
        true
    }
}

pub struct Session {
    pub config: EngineConfig,
    pub catalog: RwLock<QueryCatalog>,
    pub compiler: Mutex<CompilerContext>,
    pub optimizer: Optimizer,
    pub installed: RwLock<Installed>,
    pub emits: EmitRegistry,
    pub metrics: MetricsRegistry,
}

impl Session {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            catalog: RwLock::new(QueryCatalog::new()),
            compiler: Mutex::new(CompilerContext::new()),
            optimizer: Optimizer::new(OptimizerConfig::default()),
            installed: RwLock::new(Installed::default()),
            emits: EmitRegistry::new(config.emit_if_no_results, config.report_interval_ms),
            metrics: MetricsRegistry::new(),
            config,
        }
    }
}
