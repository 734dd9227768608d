use std::collections::BTreeMap;
use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;
use tracing::warn;

use super::gpu_model;
use super::pod_ref;
use crate::domain::index::ClusterSnapshot;

#[derive(Debug, derive_more::Display)]
pub enum PluginError {
    #[display("plugin {plugin} failed: {message}")]
    Failed {
        plugin: &'static str,
        message: String,
    },
    #[display("plugin {name} is registered twice")]
    Duplicate { name: &'static str },
}

impl core::error::Error for PluginError {}

/// Result of one filter evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Accept,
    Reject(String),
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;
}

pub trait FilterPlugin: Plugin {
    fn filter(
        &self,
        pod: &Pod,
        node_name: &str,
        snapshot: &ClusterSnapshot,
    ) -> Result<FilterVerdict, Report<PluginError>>;
}

pub trait ScorePlugin: Plugin {
    fn score(
        &self,
        pod: &Pod,
        node_name: &str,
        snapshot: &ClusterSnapshot,
    ) -> Result<i64, Report<PluginError>>;
}

/// The capabilities one named plugin provides. A missing capability
/// accepts every node and scores zero.
#[derive(Clone)]
pub struct RegisteredPlugin {
    pub name: &'static str,
    pub filter: Option<Arc<dyn FilterPlugin>>,
    pub score: Option<Arc<dyn ScorePlugin>>,
}

impl RegisteredPlugin {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            filter: None,
            score: None,
        }
    }

    pub fn with_filter(mut self, plugin: Arc<dyn FilterPlugin>) -> Self {
        self.filter = Some(plugin);
        self
    }

    pub fn with_score(mut self, plugin: Arc<dyn ScorePlugin>) -> Self {
        self.score = Some(plugin);
        self
    }
}

pub type PluginFactory = fn() -> RegisteredPlugin;

/// Named plugin constructors, resolved once at startup.
#[derive(Default)]
pub struct Registry {
    factories: BTreeMap<&'static str, PluginFactory>,
}

impl Registry {
    /// Registry holding every plugin shipped with the scheduler.
    pub fn in_tree() -> Self {
        let mut registry = Self::default();
        registry.factories.insert(gpu_model::NAME, gpu_model::new);
        registry
    }

    pub fn register(
        &mut self,
        name: &'static str,
        factory: PluginFactory,
    ) -> Result<(), Report<PluginError>> {
        if self.factories.contains_key(name) {
            return Err(Report::new(PluginError::Duplicate { name }));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}

/// Every registered plugin, grouped by capability.
pub struct Framework {
    filters: Vec<Arc<dyn FilterPlugin>>,
    scorers: Vec<Arc<dyn ScorePlugin>>,
}

impl Framework {
    pub fn new(registry: &Registry) -> Self {
        let mut filters = Vec::new();
        let mut scorers = Vec::new();
        for factory in registry.factories.values() {
            let plugin = factory();
            debug!(
                plugin = plugin.name,
                filter = plugin.filter.is_some(),
                score = plugin.score.is_some(),
                "plugin enabled"
            );
            filters.extend(plugin.filter);
            scorers.extend(plugin.score);
        }
        Self { filters, scorers }
    }

    /// Accepts only if every filter plugin accepts. The first rejection
    /// ends the evaluation; a failing plugin counts as a rejection.
    pub fn run_filter_plugins(
        &self,
        pod: &Pod,
        node_name: &str,
        snapshot: &ClusterSnapshot,
    ) -> FilterVerdict {
        for plugin in &self.filters {
            let reason = match plugin.filter(pod, node_name, snapshot) {
                Ok(FilterVerdict::Accept) => continue,
                Ok(FilterVerdict::Reject(reason)) => reason,
                Err(e) => format!("{e}"),
            };
            debug!(
                plugin = plugin.name(),
                pod = %pod_ref(pod),
                node_name,
                reason = %reason,
                "node rejected"
            );
            return FilterVerdict::Reject(reason);
        }
        FilterVerdict::Accept
    }

    /// Sum of all score plugins; a failing plugin contributes zero.
    pub fn run_score_plugins(&self, pod: &Pod, node_name: &str, snapshot: &ClusterSnapshot) -> i64 {
        self.scorers
            .iter()
            .map(|plugin| {
                plugin.score(pod, node_name, snapshot).unwrap_or_else(|e| {
                    warn!(plugin = plugin.name(), node_name, "score failed: {e:?}");
                    0
                })
            })
            .sum()
    }
}
