use crate::models::{OptimizationResult, Timeframe};
use crate::param_utils::parameter_signature;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Optimization results shared across worker threads, keyed by strategy,
/// symbol, timeframe and parameter set.
#[derive(Clone, Default)]
pub struct ResultCache {
    local_cache: Arc<DashMap<String, OptimizationResult>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_cache_key(
        template_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        parameters: &HashMap<String, f64>,
    ) -> String {
        format!(
            "{}:{}:{}:{}",
            template_id,
            symbol,
            timeframe.as_str(),
            parameter_signature(parameters)
        )
    }

    pub fn check_cache(
        &self,
        template_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        parameters: &HashMap<String, f64>,
    ) -> Option<OptimizationResult> {
        let cache_key = Self::get_cache_key(template_id, symbol, timeframe, parameters);
        self.local_cache.get(&cache_key).map(|entry| entry.clone())
    }

    pub fn store_cache(
        &self,
        template_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        result: &OptimizationResult,
    ) {
        let cache_key = Self::get_cache_key(template_id, symbol, timeframe, &result.parameters);
        self.local_cache.insert(cache_key, result.clone());
    }

    pub fn len(&self) -> usize {
        self.local_cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local_cache.is_empty()
    }
}
