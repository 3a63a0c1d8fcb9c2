//! Facade over the harvesting and search components.
//!
//! [`HarvestService`] is what an outer surface (the CLI here, an HTTP layer
//! elsewhere) talks to. Each operation is a thin pass-through; the service
//! only adds source validation and keeps the scheduler in step with source
//! administration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tracing::{info, instrument};

use crate::cache::{KvCache, MemoryCache};
use crate::config::AppConfig;
use crate::db::Database;
use crate::enrich::CrossrefEnricher;
use crate::harvest::{HarvestController, HarvestError, HarvestOutcome};
use crate::oai::OaiClient;
use crate::scheduler::{Scheduler, SchedulerError, parse_schedule};
use crate::search::connectors::{CrossrefConnector, LocalConnector, OpenAlexConnector};
use crate::search::{
    DatabaseConnector, SearchAggregator, SearchCache, SearchError, SearchQuery, SearchResponse,
};
use crate::store::{
    HarvestSource, HarvestStore, NewHarvestSource, ProviderSummary, RunLogPage, SourceStatePatch,
    SourceStatus, Store, StoreError,
};

/// Largest page of run logs returned at once.
pub const MAX_LOG_PAGE_SIZE: u32 = 100;

/// Errors surfaced by the facade.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The source definition is unusable.
    #[error("invalid harvest source: {0}")]
    InvalidSource(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Harvest(#[from] HarvestError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Search(#[from] SearchError),
}

/// Result type for facade operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Entry point for harvest administration, manual harvests, and search.
#[derive(Debug)]
pub struct HarvestService {
    store: Arc<Store>,
    controller: Arc<HarvestController>,
    scheduler: Arc<Scheduler>,
    aggregator: SearchAggregator,
}

impl HarvestService {
    /// Wires the service from already-built components.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        controller: Arc<HarvestController>,
        aggregator: SearchAggregator,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&controller),
            Arc::clone(&store) as Arc<dyn HarvestStore>,
        ));
        Self {
            store,
            controller,
            scheduler,
            aggregator,
        }
    }

    /// Builds every component from configuration: database, OAI-PMH
    /// client, optional enrichment, connectors, and the search cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or an HTTP client
    /// cannot be constructed.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let db = Database::new_with_options(&config.database_path, config.database_options())
            .await
            .with_context(|| {
                format!("Failed to open database '{}'", config.database_path.display())
            })?;
        Self::from_database(config, db)
    }

    /// Like [`Self::from_config`] over an already-open database.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be constructed.
    pub fn from_database(config: &AppConfig, db: Database) -> anyhow::Result<Self> {
        let store = Arc::new(Store::new(db));
        let dyn_store: Arc<dyn HarvestStore> = Arc::clone(&store) as Arc<dyn HarvestStore>;

        let kv = Arc::new(MemoryCache::new());
        let _sweeper = kv.spawn_sweeper(Duration::from_secs(config.search.cache_sweep_interval_secs));
        let kv: Arc<dyn KvCache> = kv;

        let protocol = Arc::new(OaiClient::new(config.harvest_timeouts())?);
        let mut controller =
            HarvestController::new(Arc::clone(&dyn_store), protocol, config.harvest_settings());
        if let Some(enricher_config) = config.enricher_config() {
            let enricher = CrossrefEnricher::new(enricher_config, Arc::clone(&kv))?;
            controller = controller.with_enricher(Arc::new(enricher));
        }

        let connectors: Vec<Arc<dyn DatabaseConnector>> = vec![
            Arc::new(LocalConnector::new(dyn_store, config.connector("local"))),
            Arc::new(CrossrefConnector::new(config.connector("crossref"))?),
            Arc::new(OpenAlexConnector::new(config.connector("openalex"))?),
        ];
        let cache = SearchCache::new(kv)
            .with_ttl(Duration::from_secs(config.search.cache_ttl_secs))
            .with_serve_stale(config.search.serve_stale);
        let aggregator =
            SearchAggregator::new(connectors, config.aggregator_settings()).with_cache(cache);

        Ok(Self::new(store, Arc::new(controller), aggregator))
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The run controller, for shutdown signalling.
    #[must_use]
    pub fn controller(&self) -> &Arc<HarvestController> {
        &self.controller
    }

    /// The per-source scheduler. Sources registered through the service are
    /// scheduled at once; [`Scheduler::start`] picks up the stored ones.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Runs one harvest of `source_id` now.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Harvest`] if the run cannot start or be recorded.
    pub async fn trigger_harvest(&self, source_id: i64) -> Result<HarvestOutcome> {
        Ok(self.controller.run(source_id).await?)
    }

    /// Run logs for a source, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the query fails.
    pub async fn harvest_logs(&self, source_id: i64, page: u32, limit: u32) -> Result<RunLogPage> {
        Ok(self
            .store
            .list_run_logs(source_id, page.max(1), limit.clamp(1, MAX_LOG_PAGE_SIZE))
            .await?)
    }

    /// Federated search.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Search`] for an invalid query or when no
    /// database is available.
    pub async fn search(
        &self,
        user_id: Option<&str>,
        query: &SearchQuery,
        database_filter: Option<&[String]>,
    ) -> Result<SearchResponse> {
        Ok(self.aggregator.search(user_id, query, database_filter).await?)
    }

    /// Distinct providers with active record counts.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the query fails.
    pub async fn providers(&self, institution_id: Option<&str>) -> Result<Vec<ProviderSummary>> {
        Ok(self.store.list_providers(institution_id).await?)
    }

    /// Registers a source and schedules it.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidSource`] for an empty name, an endpoint
    /// that is not an http(s) URL, an empty metadata prefix, or a malformed
    /// schedule.
    #[instrument(skip(self, source), fields(name = %source.name))]
    pub async fn create_source(&self, source: &NewHarvestSource) -> Result<HarvestSource> {
        validate_source(source)?;
        let id = self.store.create_source(source).await?;
        let created = self
            .store
            .get_source(id)
            .await?
            .ok_or(StoreError::SourceNotFound(id))?;
        self.scheduler.schedule_source(&created)?;
        info!(source_id = id, "harvest source registered");
        Ok(created)
    }

    /// Every registered source.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the query fails.
    pub async fn list_sources(&self) -> Result<Vec<HarvestSource>> {
        Ok(self.store.list_sources().await?)
    }

    /// Cancels the schedule and deletes the source. Harvested records stay.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the source does not exist.
    #[instrument(skip(self))]
    pub async fn remove_source(&self, source_id: i64) -> Result<()> {
        self.scheduler.unschedule_source(source_id);
        self.store.delete_source(source_id).await?;
        info!(source_id, "harvest source removed");
        Ok(())
    }

    /// Stops scheduled harvests of a source.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::AlreadyRunning`] while a run is in flight and
    /// [`ServiceError::Store`] if the source does not exist.
    #[instrument(skip(self))]
    pub async fn pause_source(&self, source_id: i64) -> Result<()> {
        if self.controller.is_running(source_id) {
            return Err(HarvestError::AlreadyRunning { source_id }.into());
        }
        self.store
            .update_source_state(source_id, &SourceStatePatch::status(SourceStatus::Paused))
            .await?;
        self.scheduler.unschedule_source(source_id);
        info!(source_id, "harvest source paused");
        Ok(())
    }

    /// Re-activates a paused source and schedules it again.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the source does not exist and
    /// [`ServiceError::Scheduler`] if its schedule no longer parses.
    #[instrument(skip(self))]
    pub async fn resume_source(&self, source_id: i64) -> Result<HarvestSource> {
        self.store
            .update_source_state(source_id, &SourceStatePatch::status(SourceStatus::Active))
            .await?;
        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or(StoreError::SourceNotFound(source_id))?;
        self.scheduler.schedule_source(&source)?;
        info!(source_id, "harvest source resumed");
        Ok(source)
    }
}

fn validate_source(source: &NewHarvestSource) -> Result<()> {
    if source.name.trim().is_empty() {
        return Err(ServiceError::InvalidSource("name must not be empty".to_string()));
    }
    match url::Url::parse(&source.endpoint_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        _ => {
            return Err(ServiceError::InvalidSource(format!(
                "endpoint '{}' is not an http(s) URL",
                source.endpoint_url
            )));
        }
    }
    if source.metadata_prefix.trim().is_empty() {
        return Err(ServiceError::InvalidSource(
            "metadata prefix must not be empty".to_string(),
        ));
    }
    parse_schedule(&source.schedule).map_err(|e| {
        ServiceError::InvalidSource(format!("schedule '{}' is invalid: {e}", source.schedule))
    })?;
    Ok(())
}
