//! Filter compiler: merges selected filters into the published block-set.

use crate::blockset::{BlockSet, BlockSetHandle};
use crate::filter::{parse_hosts, Filter, FilterId, FilterSource};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Compilation errors.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to fetch hosts for filter {filter}: {source}")]
    Fetch {
        filter: FilterId,
        #[source]
        source: anyhow::Error,
    },
}

/// Collaborator that retrieves raw host-list content for a source.
///
/// How the bytes are obtained (HTTP, disk, package manager) is outside this
/// crate. The compiler retries a failed fetch at most once inline and
/// otherwise defers to its own refresh cycle.
pub trait HostFetcher: Send + Sync {
    fn fetch(&self, source: &FilterSource) -> anyhow::Result<String>;
}

/// Compiler tuning knobs.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// How long a compiled block-set stays fresh without a trigger.
    pub cache_ttl: Duration,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Produces and caches the block-set described by the selected filters.
pub struct FilterCompiler {
    filters: Vec<Filter>,
    fetcher: Arc<dyn HostFetcher>,
    handle: Arc<BlockSetHandle>,
    config: CompilerConfig,
    built_at: Option<Instant>,
    /// Sticky retry flag: set when a refresh fails or the selection changes,
    /// cleared only by a successful compile.
    changed: bool,
}

impl FilterCompiler {
    pub fn new(fetcher: Arc<dyn HostFetcher>, config: CompilerConfig) -> Self {
        Self {
            filters: Vec::new(),
            fetcher,
            handle: Arc::new(BlockSetHandle::new()),
            config,
            built_at: None,
            changed: false,
        }
    }

    /// Handle consumers read snapshots through.
    pub fn handle(&self) -> Arc<BlockSetHandle> {
        self.handle.clone()
    }

    /// Current published snapshot.
    pub fn block_set(&self) -> Arc<BlockSet> {
        self.handle.snapshot()
    }

    /// Replace the filter selection. Marks the cache stale.
    pub fn set_filters(&mut self, filters: Vec<Filter>) {
        self.filters = filters;
        self.changed = true;
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    fn should_refresh(&self, force_recheck: bool) -> bool {
        if force_recheck || self.changed {
            return true;
        }
        match self.built_at {
            None => true,
            Some(at) => at.elapsed() >= self.config.cache_ttl || self.block_set().is_empty(),
        }
    }

    /// Re-evaluate and, if warranted, rebuild the block-set.
    ///
    /// On any fetch failure the previously published snapshot stays in place
    /// and the sticky retry flag is set, so the next trigger tries again.
    pub fn refresh(&mut self, force_recheck: bool) -> Result<(), CompileError> {
        if !self.should_refresh(force_recheck) {
            debug!("block-set still fresh, skipping refresh");
            return Ok(());
        }

        // Reclaim host lists of deselected filters.
        for filter in self.filters.iter_mut().filter(|f| !f.active) {
            if !filter.hosts.is_empty() {
                debug!(filter = %filter.id, "dropping cached hosts of inactive filter");
                filter.hosts = Vec::new();
            }
        }

        // Resolve newly active filters whose host list is empty.
        for filter in self.filters.iter_mut().filter(|f| f.active && f.hosts.is_empty()) {
            match &filter.source {
                FilterSource::Single { host } => {
                    filter.hosts = vec![host.to_lowercase()];
                }
                FilterSource::App { .. } => {
                    // App filters carry no host entries.
                }
                source @ (FilterSource::Link { .. } | FilterSource::File { .. }) => {
                    let text = match fetch_with_retry(self.fetcher.as_ref(), source) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(filter = %filter.id, error = %e, "host fetch failed, keeping previous block-set");
                            self.changed = true;
                            return Err(CompileError::Fetch {
                                filter: filter.id.clone(),
                                source: e,
                            });
                        }
                    };
                    filter.hosts = parse_hosts(&text);
                    debug!(filter = %filter.id, hosts = filter.hosts.len(), "resolved host list");
                }
            }
        }

        let deny = self
            .filters
            .iter()
            .filter(|f| f.active && !f.whitelist)
            .flat_map(|f| f.hosts.iter().map(String::as_str));
        let allow = self
            .filters
            .iter()
            .filter(|f| f.active && f.whitelist)
            .flat_map(|f| f.hosts.iter().map(String::as_str));

        let set = BlockSet::combine(deny, allow);
        info!(hosts = set.len(), "block-set compiled");

        self.handle.publish(Arc::new(set));
        self.built_at = Some(Instant::now());
        self.changed = false;
        Ok(())
    }
}

fn fetch_with_retry(fetcher: &dyn HostFetcher, source: &FilterSource) -> anyhow::Result<String> {
    match fetcher.fetch(source) {
        Ok(text) => Ok(text),
        Err(first) => {
            debug!(%source, error = %first, "fetch failed, retrying once");
            fetcher.fetch(source)
        }
    }
}
