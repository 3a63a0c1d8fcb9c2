//! Per-source harvest run driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::{StreamExt, stream};
use tracing::{debug, error, info, instrument, warn};

use crate::enrich::Enricher;
use crate::merge::{UpsertAction, merge_fields};
use crate::oai::{ListPage, ListRequest, OaiProtocol, ProtocolError, RawRecord};
use crate::record::NormalizedRecord;
use crate::schema::{self, SchemaId};
use crate::store::{
    HarvestSource, HarvestStore, RunCounts, RunLogPatch, RunStatus, SourceStatePatch, SourceStatus,
    StoreError,
};

use super::retry::{RetryDecision, classify_error};
use super::{HarvestError, HarvestOutcome, HarvestSettings};

/// Error message written to a run log ended by process shutdown.
pub const SHUTDOWN_REASON: &str = "interrupted by shutdown";

/// How a run left its page loop.
enum RunEnd {
    /// No further pages, or the endpoint reported `noRecordsMatch`.
    Exhausted,
    /// Shutdown was requested between pages.
    Interrupted,
    Failed {
        message: String,
        clear_token: bool,
    },
}

/// Per-record result of parse, filter, and enrich.
enum Prepared {
    Ready(Box<NormalizedRecord>),
    Skipped,
    Failed,
}

#[derive(Debug)]
struct RunState {
    run_id: i64,
    counts: RunCounts,
    pages: u32,
}

/// Removes the source from the running set when the run ends.
struct RunGuard<'a> {
    running: &'a DashMap<i64, DateTime<Utc>>,
    source_id: i64,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.source_id);
    }
}

/// Orchestrates harvest runs over an abstract store and protocol client.
pub struct HarvestController {
    store: Arc<dyn HarvestStore>,
    protocol: Arc<dyn OaiProtocol>,
    enricher: Option<Arc<dyn Enricher>>,
    settings: HarvestSettings,
    running: DashMap<i64, DateTime<Utc>>,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for HarvestController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestController")
            .field("settings", &self.settings)
            .field("enrichment", &self.enricher.is_some())
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl HarvestController {
    /// Creates a controller without enrichment.
    #[must_use]
    pub fn new(
        store: Arc<dyn HarvestStore>,
        protocol: Arc<dyn OaiProtocol>,
        settings: HarvestSettings,
    ) -> Self {
        Self {
            store,
            protocol,
            enricher: None,
            settings,
            running: DashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enables DOI enrichment for parsed records.
    #[must_use]
    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Shares an externally owned shutdown flag (e.g. set by a Ctrl-C handler).
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Returns the shutdown flag checked between pages.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Asks in-flight runs to stop after their current page.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Returns true while a run for `source_id` is in flight.
    #[must_use]
    pub fn is_running(&self, source_id: i64) -> bool {
        self.running.contains_key(&source_id)
    }

    /// Number of runs currently in flight across all sources.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.running.len()
    }

    fn claim(&self, source_id: i64) -> Option<RunGuard<'_>> {
        match self.running.entry(source_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Some(RunGuard {
                    running: &self.running,
                    source_id,
                })
            }
        }
    }

    /// Runs one harvest of `source_id` to completion.
    ///
    /// Resumes from the stored continuation token when one exists, otherwise
    /// requests records changed since the last successful harvest.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] when the run cannot start (already running,
    /// unknown or paused source) or the store fails to record it. A run that
    /// starts and then fails is reported as an `Ok` outcome with
    /// [`RunStatus::Failed`].
    #[instrument(skip(self), fields(run_id = tracing::field::Empty))]
    pub async fn run(&self, source_id: i64) -> Result<HarvestOutcome, HarvestError> {
        let Some(_guard) = self.claim(source_id) else {
            warn!("harvest already in progress");
            return Err(HarvestError::AlreadyRunning { source_id });
        };

        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or(HarvestError::SourceNotFound { source_id })?;
        if source.status == SourceStatus::Paused {
            return Err(HarvestError::SourcePaused { source_id });
        }

        let run_id = self.store.create_run_log(source.id, Utc::now()).await?;
        tracing::Span::current().record("run_id", run_id);
        self.store
            .update_source_state(source.id, &SourceStatePatch::status(SourceStatus::Harvesting))
            .await?;
        info!(
            endpoint = %source.endpoint_url,
            metadata_prefix = %source.metadata_prefix,
            resuming = source.resumption_token.is_some(),
            "harvest started"
        );

        let mut run = RunState {
            run_id,
            counts: RunCounts::default(),
            pages: 0,
        };
        let end = self.drive(&source, &mut run).await;
        self.finalize(&source, run, end).await
    }

    async fn drive(&self, source: &HarvestSource, run: &mut RunState) -> RunEnd {
        let schema_id = SchemaId::from_prefix(&source.metadata_prefix);
        let mut request = initial_request(source);

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return RunEnd::Interrupted;
            }

            let page = match self.fetch_page(source, &request).await {
                Ok(page) => page,
                Err(ProtocolError::NoRecordsMatch) => {
                    debug!("endpoint reports no records match");
                    return RunEnd::Exhausted;
                }
                Err(error @ ProtocolError::BadResumptionToken(_)) => {
                    return RunEnd::Failed {
                        message: error.to_string(),
                        clear_token: true,
                    };
                }
                Err(error) => {
                    return RunEnd::Failed {
                        message: error.to_string(),
                        clear_token: false,
                    };
                }
            };
            run.pages += 1;

            if let Err(error) = self.process_page(source, schema_id, &page, &mut run.counts).await {
                return RunEnd::Failed {
                    message: error.to_string(),
                    clear_token: false,
                };
            }

            let next = page.resumption_token;
            if let Err(error) = self.persist_progress(source.id, run, next.clone()).await {
                return RunEnd::Failed {
                    message: error.to_string(),
                    clear_token: false,
                };
            }
            debug!(
                page = run.pages,
                processed = run.counts.processed,
                complete_list_size = page.complete_list_size,
                "page committed"
            );

            match next {
                Some(token) => request = request.continue_with(token),
                None => return RunEnd::Exhausted,
            }
        }
    }

    /// Fetches one page, re-issuing the identical request on retryable failures.
    async fn fetch_page(
        &self,
        source: &HarvestSource,
        request: &ListRequest,
    ) -> Result<ListPage, ProtocolError> {
        let mut attempt = 1;
        loop {
            match self.protocol.list_page(&source.endpoint_url, request).await {
                Ok(page) => return Ok(page),
                Err(error) => match self.settings.retry.should_retry(classify_error(&error), attempt) {
                    RetryDecision::Retry { delay, attempt: next } => {
                        warn!(
                            error = %error,
                            attempt,
                            delay_ms = delay.as_millis(),
                            "page fetch failed; retrying same page"
                        );
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(reason = %reason, "not retrying page");
                        return Err(error);
                    }
                },
            }
        }
    }

    async fn process_page(
        &self,
        source: &HarvestSource,
        schema_id: SchemaId,
        page: &ListPage,
        counts: &mut RunCounts,
    ) -> Result<(), StoreError> {
        let (deleted, live): (Vec<&RawRecord>, Vec<&RawRecord>) =
            page.records.iter().partition(|r| r.header.is_deleted());

        if !deleted.is_empty() {
            let ids: Vec<String> = deleted.iter().map(|r| r.header.identifier.clone()).collect();
            let marked = self.store.mark_records_deleted(source.id, &ids).await?;
            debug!(reported = ids.len(), marked, "deleted records marked inactive");
        }

        // Futures are built before streaming so the run future stays `Send`.
        let pending: Vec<_> = live
            .iter()
            .map(|raw| self.prepare(source, schema_id, raw))
            .collect();
        let prepared: Vec<Prepared> = stream::iter(pending)
            .buffered(self.settings.worker_count.max(1))
            .collect()
            .await;

        counts.processed += i64::try_from(live.len()).unwrap_or(i64::MAX);
        let mut ready = Vec::with_capacity(prepared.len());
        for item in prepared {
            match item {
                Prepared::Ready(record) => ready.push(*record),
                Prepared::Skipped => {}
                Prepared::Failed => counts.failed += 1,
            }
        }

        for batch in ready.chunks(self.settings.batch_size.max(1)) {
            for action in self.store.batch_upsert_records(batch).await? {
                match action {
                    UpsertAction::Added => counts.added += 1,
                    UpsertAction::Updated => counts.updated += 1,
                }
            }
        }
        Ok(())
    }

    async fn prepare(&self, source: &HarvestSource, schema_id: SchemaId, raw: &RawRecord) -> Prepared {
        let mut record = match schema::parse(raw, schema_id) {
            Ok(record) => record,
            Err(error) => {
                warn!(record_id = %raw.header.identifier, error = %error, "record failed to parse");
                return Prepared::Failed;
            }
        };

        if !source.admits_provider(&record.provider) {
            debug!(record_id = %record.record_id, provider = %record.provider, "provider not in allow-list");
            return Prepared::Skipped;
        }
        record.source_id = Some(source.id);

        if let Some(enricher) = &self.enricher
            && let Some(doi) = record.fields.doi.clone()
            && let Some(enriched) = enricher.enrich(&doi).await
        {
            merge_fields(&mut record.fields, enriched);
        }

        Prepared::Ready(Box::new(record))
    }

    async fn persist_progress(
        &self,
        source_id: i64,
        run: &RunState,
        token: Option<String>,
    ) -> Result<(), StoreError> {
        self.store
            .update_source_state(source_id, &SourceStatePatch::token(token))
            .await?;
        self.store
            .update_run_log(run.run_id, &RunLogPatch::progress(run.counts))
            .await
    }

    async fn finalize(
        &self,
        source: &HarvestSource,
        run: RunState,
        end: RunEnd,
    ) -> Result<HarvestOutcome, HarvestError> {
        let (status, error_message, source_patch) = match end {
            RunEnd::Exhausted => (
                RunStatus::Completed,
                None,
                SourceStatePatch {
                    status: Some(SourceStatus::Active),
                    resumption_token: Some(None),
                    last_harvested_at: Some(Utc::now()),
                },
            ),
            RunEnd::Interrupted => (
                RunStatus::Failed,
                Some(SHUTDOWN_REASON.to_string()),
                SourceStatePatch::status(SourceStatus::Active),
            ),
            RunEnd::Failed {
                message,
                clear_token,
            } => (
                RunStatus::Failed,
                Some(message),
                SourceStatePatch {
                    status: Some(SourceStatus::Error),
                    resumption_token: clear_token.then_some(None),
                    last_harvested_at: None,
                },
            ),
        };

        let log_patch = match &error_message {
            None => RunLogPatch::completed(run.counts),
            Some(message) => RunLogPatch::failed(run.counts, message.clone()),
        };
        self.store.update_run_log(run.run_id, &log_patch).await?;
        self.store.update_source_state(source.id, &source_patch).await?;

        let counts = run.counts;
        match &error_message {
            None => info!(
                pages = run.pages,
                processed = counts.processed,
                added = counts.added,
                updated = counts.updated,
                failed = counts.failed,
                "harvest completed"
            ),
            Some(message) => error!(
                pages = run.pages,
                processed = counts.processed,
                error = %message,
                "harvest failed"
            ),
        }

        Ok(HarvestOutcome {
            source_id: source.id,
            run_id: run.run_id,
            status,
            counts,
            pages: run.pages,
            error_message,
        })
    }
}

/// First request of a run: the stored token, else an incremental `from`.
fn initial_request(source: &HarvestSource) -> ListRequest {
    let mut request = ListRequest::new(source.metadata_prefix.clone());
    request.set = source.set_spec.clone();
    request.from = source
        .last_harvested_at
        .map(|at| at.format("%Y-%m-%d").to_string());

    match &source.resumption_token {
        Some(token) => request.continue_with(token.clone()),
        None => request,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::db::Database;
    use crate::harvest::RetryPolicy;
    use crate::oai::RecordHeader;
    use crate::record::RecordFields;
    use crate::store::{NewHarvestSource, Store};

    /// Serves scripted pages and records every request it receives.
    #[derive(Default)]
    struct ScriptedProtocol {
        pages: Mutex<VecDeque<Result<ListPage, ProtocolError>>>,
        requests: Mutex<Vec<ListRequest>>,
        trip_after_first: Option<Arc<AtomicBool>>,
    }

    impl ScriptedProtocol {
        fn new(pages: Vec<Result<ListPage, ProtocolError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                ..Self::default()
            }
        }

        fn requests(&self) -> Vec<ListRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OaiProtocol for ScriptedProtocol {
        async fn list_page(
            &self,
            _endpoint: &str,
            request: &ListRequest,
        ) -> Result<ListPage, ProtocolError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(flag) = &self.trip_after_first {
                flag.store(true, Ordering::SeqCst);
            }
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ProtocolError::NoRecordsMatch))
        }
    }

    struct FixedEnricher;

    #[async_trait]
    impl Enricher for FixedEnricher {
        async fn enrich(&self, _doi: &str) -> Option<RecordFields> {
            Some(RecordFields {
                abstract_text: Some("Enriched abstract".to_string()),
                ..RecordFields::default()
            })
        }
    }

    fn dc_record(id: &str, host: &str) -> RawRecord {
        RawRecord {
            header: RecordHeader {
                identifier: id.to_string(),
                ..RecordHeader::default()
            },
            metadata: Some(json!({
                "dc:title": format!("Title {id}"),
                "dc:identifier": format!("https://www.{host}/stable/{id}")
            })),
        }
    }

    fn page(records: Vec<RawRecord>, token: Option<&str>) -> Result<ListPage, ProtocolError> {
        Ok(ListPage {
            records,
            resumption_token: token.map(ToString::to_string),
            complete_list_size: None,
        })
    }

    fn fast_settings() -> HarvestSettings {
        HarvestSettings {
            retry: RetryPolicy::new(3, Duration::ZERO, Duration::ZERO, 2.0).without_jitter(),
            ..HarvestSettings::default()
        }
    }

    async fn setup(allow: &[&str]) -> (Arc<Store>, i64) {
        let store = Arc::new(Store::new(Database::new_in_memory().await.unwrap()));
        let id = store
            .create_source(&NewHarvestSource {
                name: "Repo".to_string(),
                endpoint_url: "https://example.org/oai".to_string(),
                metadata_prefix: "oai_dc".to_string(),
                provider_allow_list: allow.iter().map(ToString::to_string).collect(),
                schedule: "0 3 * * *".to_string(),
                ..NewHarvestSource::default()
            })
            .await
            .unwrap();
        (store, id)
    }

    fn controller(store: &Arc<Store>, protocol: &Arc<ScriptedProtocol>) -> HarvestController {
        HarvestController::new(
            Arc::clone(store) as Arc<dyn HarvestStore>,
            Arc::clone(protocol) as Arc<dyn OaiProtocol>,
            fast_settings(),
        )
    }

    #[tokio::test]
    async fn test_run_pages_until_token_absent() {
        let (store, id) = setup(&[]).await;
        let protocol = Arc::new(ScriptedProtocol::new(vec![
            page(vec![dc_record("1", "jstor.org"), dc_record("2", "jstor.org")], Some("t1")),
            page(vec![dc_record("3", "jstor.org")], None),
        ]));

        let outcome = controller(&store, &protocol).run(id).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.counts.processed, 3);
        assert_eq!(outcome.counts.added, 3);
        let requests = protocol.requests();
        assert_eq!(requests[0].resumption_token, None);
        assert_eq!(requests[1].resumption_token.as_deref(), Some("t1"));

        let source = store.get_source(id).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Active);
        assert!(source.resumption_token.is_none());
        assert!(source.last_harvested_at.is_some());

        let log = store.get_run_log(outcome.run_id).await.unwrap().unwrap();
        assert_eq!(log.status, RunStatus::Completed);
        assert_eq!(log.counts, outcome.counts);
        assert!(log.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_allow_list_skips_without_counting_failure() {
        let (store, id) = setup(&["jstor"]).await;
        let protocol = Arc::new(ScriptedProtocol::new(vec![page(
            vec![dc_record("1", "jstor.org"), dc_record("2", "proquest.com")],
            None,
        )]));

        let outcome = controller(&store, &protocol).run(id).await.unwrap();

        assert_eq!(outcome.counts.processed, 2);
        assert_eq!(outcome.counts.added, 1);
        assert_eq!(outcome.counts.failed, 0);
        assert_eq!(store.count_records(true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_is_counted_and_run_continues() {
        let (store, id) = setup(&[]).await;
        let broken = RawRecord {
            header: RecordHeader {
                identifier: "broken".to_string(),
                ..RecordHeader::default()
            },
            metadata: None,
        };
        let protocol = Arc::new(ScriptedProtocol::new(vec![page(
            vec![broken, dc_record("ok", "jstor.org")],
            None,
        )]));

        let outcome = controller(&store, &protocol).run(id).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.counts.failed, 1);
        assert_eq!(outcome.counts.added, 1);
    }

    #[tokio::test]
    async fn test_no_records_match_completes() {
        let (store, id) = setup(&[]).await;
        let protocol = Arc::new(ScriptedProtocol::new(vec![Err(ProtocolError::NoRecordsMatch)]));

        let outcome = controller(&store, &protocol).run(id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.pages, 0);
        let source = store.get_source(id).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Active);
    }

    #[tokio::test]
    async fn test_transport_failure_marks_source_error_and_keeps_token() {
        let (store, id) = setup(&[]).await;
        let refused = || {
            Err(ProtocolError::Transport {
                endpoint: "https://example.org/oai".to_string(),
                message: "connection refused".to_string(),
                timeout: false,
            })
        };
        let protocol = Arc::new(ScriptedProtocol::new(vec![
            page(vec![dc_record("1", "jstor.org")], Some("t1")),
            refused(),
            refused(),
            refused(),
        ]));

        let outcome = controller(&store, &protocol).run(id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error_message.unwrap().contains("connection refused"));
        assert_eq!(protocol.requests().len(), 4);

        let source = store.get_source(id).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Error);
        assert_eq!(source.resumption_token.as_deref(), Some("t1"));
        assert!(source.last_harvested_at.is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_retries_the_same_page() {
        let (store, id) = setup(&[]).await;
        let protocol = Arc::new(ScriptedProtocol::new(vec![
            page(vec![dc_record("1", "jstor.org")], Some("t1")),
            Err(ProtocolError::Status {
                endpoint: "https://example.org/oai".to_string(),
                status: 503,
            }),
            page(vec![dc_record("2", "jstor.org")], None),
        ]));

        let outcome = controller(&store, &protocol).run(id).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.counts.added, 2);
        let requests = protocol.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1], requests[2]);
    }

    #[tokio::test]
    async fn test_bad_resumption_token_clears_token() {
        let (store, id) = setup(&[]).await;
        store
            .update_source_state(id, &SourceStatePatch::token(Some("stale".to_string())))
            .await
            .unwrap();
        let protocol = Arc::new(ScriptedProtocol::new(vec![Err(
            ProtocolError::BadResumptionToken("expired".to_string()),
        )]));

        let outcome = controller(&store, &protocol).run(id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(protocol.requests()[0].resumption_token.as_deref(), Some("stale"));
        let source = store.get_source(id).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Error);
        assert!(source.resumption_token.is_none());
    }

    #[tokio::test]
    async fn test_second_run_is_incremental_from_last_harvest() {
        let (store, id) = setup(&[]).await;
        let protocol = Arc::new(ScriptedProtocol::new(vec![
            page(vec![dc_record("1", "jstor.org")], None),
            Err(ProtocolError::NoRecordsMatch),
        ]));
        let controller = controller(&store, &protocol);

        controller.run(id).await.unwrap();
        controller.run(id).await.unwrap();

        let requests = protocol.requests();
        assert_eq!(requests[0].from, None);
        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(requests[1].from.as_deref(), Some(today.as_str()));
    }

    #[tokio::test]
    async fn test_shutdown_finishes_page_and_keeps_token() {
        let (store, id) = setup(&[]).await;
        let flag = Arc::new(AtomicBool::new(false));
        let protocol = Arc::new(ScriptedProtocol {
            trip_after_first: Some(Arc::clone(&flag)),
            ..ScriptedProtocol::new(vec![
                page(vec![dc_record("1", "jstor.org")], Some("t1")),
                page(vec![dc_record("2", "jstor.org")], None),
            ])
        });
        let controller = controller(&store, &protocol).with_shutdown_flag(flag);

        let outcome = controller.run(id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error_message.as_deref(), Some(SHUTDOWN_REASON));
        assert_eq!(outcome.counts.added, 1);
        assert_eq!(protocol.requests().len(), 1);
        let source = store.get_source(id).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Active);
        assert_eq!(source.resumption_token.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_deleted_header_marks_record_inactive() {
        let (store, id) = setup(&[]).await;
        let mut tombstone = dc_record("1", "jstor.org");
        tombstone.header.status = Some("deleted".to_string());
        tombstone.metadata = None;
        let protocol = Arc::new(ScriptedProtocol::new(vec![
            page(vec![dc_record("1", "jstor.org")], None),
            page(vec![tombstone], None),
        ]));
        let controller = controller(&store, &protocol);

        controller.run(id).await.unwrap();
        let second = controller.run(id).await.unwrap();

        assert_eq!(second.counts.processed, 0);
        assert_eq!(second.counts.failed, 0);
        assert_eq!(store.count_records(false).await.unwrap(), 1);
        assert_eq!(store.count_records(true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enrichment_merges_into_parsed_record() {
        let (store, id) = setup(&[]).await;
        let mut raw = dc_record("1", "jstor.org");
        raw.metadata = Some(json!({
            "dc:title": "Title",
            "dc:identifier": ["https://www.jstor.org/stable/1", "doi:10.1234/abc"]
        }));
        let protocol = Arc::new(ScriptedProtocol::new(vec![page(vec![raw], None)]));
        let controller = controller(&store, &protocol).with_enricher(Arc::new(FixedEnricher));

        controller.run(id).await.unwrap();

        let stored = store
            .find_record(&crate::merge::IdentityKey::Doi {
                provider: "jstor".to_string(),
                doi: "10.1234/abc".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record.fields.title.as_deref(), Some("Title"));
        assert_eq!(
            stored.record.fields.abstract_text.as_deref(),
            Some("Enriched abstract")
        );
        assert_eq!(stored.record.source_id, Some(id));
    }

    #[tokio::test]
    async fn test_concurrent_run_for_same_source_is_rejected() {
        let (store, id) = setup(&[]).await;
        let protocol = Arc::new(ScriptedProtocol::new(Vec::new()));
        let controller = controller(&store, &protocol);

        let _held = controller.claim(id).unwrap();
        assert!(controller.is_running(id));
        let err = controller.run(id).await.unwrap_err();
        assert!(matches!(err, HarvestError::AlreadyRunning { source_id } if source_id == id));
        assert!(protocol.requests().is_empty());
    }

    #[tokio::test]
    async fn test_guard_released_after_run() {
        let (store, id) = setup(&[]).await;
        let protocol = Arc::new(ScriptedProtocol::new(Vec::new()));
        let controller = controller(&store, &protocol);

        controller.run(id).await.unwrap();
        assert!(!controller.is_running(id));
    }

    #[tokio::test]
    async fn test_paused_and_unknown_sources_are_rejected() {
        let (store, id) = setup(&[]).await;
        store
            .update_source_state(id, &SourceStatePatch::status(SourceStatus::Paused))
            .await
            .unwrap();
        let protocol = Arc::new(ScriptedProtocol::new(Vec::new()));
        let controller = controller(&store, &protocol);

        assert!(matches!(
            controller.run(id).await.unwrap_err(),
            HarvestError::SourcePaused { .. }
        ));
        assert!(matches!(
            controller.run(9999).await.unwrap_err(),
            HarvestError::SourceNotFound { source_id: 9999 }
        ));
        assert!(!controller.is_running(id));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_run_future_is_send() {
        let (store, id) = setup(&[]).await;
        let protocol = Arc::new(ScriptedProtocol::new(vec![page(
            vec![dc_record("1", "jstor.org")],
            None,
        )]));
        let controller = Arc::new(controller(&store, &protocol));

        let fut = controller.run(id);
        assert_send(&fut);
        drop(fut);

        // Spawned like the scheduler does it.
        let spawned = Arc::clone(&controller);
        let outcome = tokio::spawn(async move { spawned.run(id).await })
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.counts.added, 1);
    }

    /// Delegates to a real store but fails the `fail_on`-th batch upsert.
    struct FailingBatchStore {
        inner: Arc<Store>,
        calls: std::sync::atomic::AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl HarvestStore for FailingBatchStore {
        async fn get_source(&self, id: i64) -> crate::store::Result<Option<HarvestSource>> {
            self.inner.get_source(id).await
        }

        async fn list_active_sources(&self) -> crate::store::Result<Vec<HarvestSource>> {
            self.inner.list_active_sources().await
        }

        async fn batch_upsert_records(
            &self,
            records: &[NormalizedRecord],
        ) -> crate::store::Result<Vec<UpsertAction>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on {
                return Err(StoreError::Database {
                    kind: crate::store::StoreDbErrorKind::ConstraintViolation,
                    message: "constraint failed".to_string(),
                });
            }
            self.inner.batch_upsert_records(records).await
        }

        async fn mark_records_deleted(
            &self,
            source_id: i64,
            record_ids: &[String],
        ) -> crate::store::Result<u64> {
            self.inner.mark_records_deleted(source_id, record_ids).await
        }

        async fn create_run_log(
            &self,
            source_id: i64,
            started_at: DateTime<Utc>,
        ) -> crate::store::Result<i64> {
            self.inner.create_run_log(source_id, started_at).await
        }

        async fn update_run_log(&self, id: i64, patch: &RunLogPatch) -> crate::store::Result<()> {
            self.inner.update_run_log(id, patch).await
        }

        async fn update_source_state(
            &self,
            id: i64,
            patch: &SourceStatePatch,
        ) -> crate::store::Result<()> {
            self.inner.update_source_state(id, patch).await
        }

        async fn search_records(
            &self,
            query: &crate::search::SearchQuery,
            limit: u32,
        ) -> crate::store::Result<Vec<crate::store::StoredRecord>> {
            self.inner.search_records(query, limit).await
        }
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_token_and_earlier_batches() {
        let (store, id) = setup(&[]).await;
        store
            .update_source_state(id, &SourceStatePatch::token(Some("t0".to_string())))
            .await
            .unwrap();
        let protocol = Arc::new(ScriptedProtocol::new(vec![page(
            vec![dc_record("1", "jstor.org"), dc_record("2", "jstor.org")],
            Some("t1"),
        )]));
        let failing = Arc::new(FailingBatchStore {
            inner: Arc::clone(&store),
            calls: std::sync::atomic::AtomicUsize::new(0),
            fail_on: 2,
        });
        let controller = HarvestController::new(
            failing as Arc<dyn HarvestStore>,
            Arc::clone(&protocol) as Arc<dyn OaiProtocol>,
            HarvestSettings {
                batch_size: 1,
                ..fast_settings()
            },
        );

        let outcome = controller.run(id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.counts.added, 1);
        assert_eq!(
            protocol.requests()[0].resumption_token.as_deref(),
            Some("t0")
        );
        assert_eq!(store.count_records(false).await.unwrap(), 1);
        let source = store.get_source(id).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Error);
        assert_eq!(source.resumption_token.as_deref(), Some("t0"));
        let log = store.get_run_log(outcome.run_id).await.unwrap().unwrap();
        assert_eq!(log.status, RunStatus::Failed);
        assert!(log.error_message.is_some());
    }
}
