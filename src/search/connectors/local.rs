use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;

use crate::search::{
    ConnectorConfig, ConnectorError, ConnectorErrorKind, DatabaseConnector, SearchQuery,
    SearchResult,
};
use crate::store::{HarvestStore, StoreError, StoredRecord};

const ID: &str = "local";

/// Searches records harvested into the local store.
pub struct LocalConnector {
    store: Arc<dyn HarvestStore>,
    config: ConnectorConfig,
}

impl std::fmt::Debug for LocalConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LocalConnector {
    /// Creates the connector over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn HarvestStore>, config: ConnectorConfig) -> Self {
        Self { store, config }
    }
}

fn to_result(stored: StoredRecord) -> SearchResult {
    let record = stored.record;
    let id = format!("{}:{}", record.provider, record.record_id);
    let mut result = SearchResult::from_fields(ID, id, record.fields);
    result
        .metadata
        .insert("provider".to_string(), Value::String(record.provider));
    if let Some(source_id) = record.source_id {
        result
            .metadata
            .insert("source_id".to_string(), Value::from(source_id));
    }
    result
}

fn map_store_error(error: &StoreError) -> ConnectorError {
    let kind = if error.is_busy_or_locked() {
        ConnectorErrorKind::Timeout
    } else {
        ConnectorErrorKind::Unknown
    };
    ConnectorError::new(ID, kind, error.to_string())
}

#[async_trait]
impl DatabaseConnector for LocalConnector {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Harvested records"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    async fn validate_access(&self, user_id: Option<&str>) -> bool {
        self.config.allows(user_id)
    }

    async fn authenticate(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    #[instrument(skip(self, query), fields(database = ID, term = %query.term))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ConnectorError> {
        let window = query.page.saturating_mul(query.limit);
        let rows = self
            .store
            .search_records(query, window)
            .await
            .map_err(|e| map_store_error(&e))?;
        Ok(rows.into_iter().map(to_result).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::record::{Author, NormalizedRecord};
    use crate::search::SearchFilters;
    use crate::store::Store;

    async fn seeded() -> LocalConnector {
        let store = Store::new(Database::new_in_memory().await.unwrap());
        let mut first = NormalizedRecord::new("jstor", "oai:j:1");
        first.fields.title = Some("Maritime trade routes".to_string());
        first.fields.publication_date = Some("2018-04".to_string());
        first.fields.authors = vec![Author::named("Doe, Jane")];
        first.fields.journal = Some("Sea History".to_string());
        let mut second = NormalizedRecord::new("proquest", "oai:p:2");
        second.fields.title = Some("Inland trade".to_string());
        second.fields.publication_date = Some("2021".to_string());
        second.fields.open_access = Some(true);
        store.batch_upsert_records(&[first, second]).await.unwrap();
        LocalConnector::new(Arc::new(store), ConnectorConfig::default())
    }

    #[tokio::test]
    async fn test_search_maps_stored_records() {
        let connector = seeded().await;
        let results = connector.search(&SearchQuery::new("trade")).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "proquest:oai:p:2");
        assert_eq!(results[0].database, "local");
        assert_eq!(results[0].metadata["provider"], "proquest");
        assert_eq!(results[0].metadata["open_access"], true);
        assert_eq!(results[1].authors, vec!["Doe, Jane"]);
    }

    #[tokio::test]
    async fn test_search_applies_filters_in_store() {
        let connector = seeded().await;
        let mut query = SearchQuery::new("trade");
        query.filters = SearchFilters {
            journals: vec!["sea history".to_string()],
            ..SearchFilters::default()
        };
        let results = connector.search(&query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Maritime trade routes");
    }

    #[tokio::test]
    async fn test_window_limits_rows() {
        let connector = seeded().await;
        let query = SearchQuery::new("trade").with_limit(1);
        assert_eq!(connector.search(&query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_access_follows_allow_list() {
        let store = Store::new(Database::new_in_memory().await.unwrap());
        let connector = LocalConnector::new(
            Arc::new(store),
            ConnectorConfig {
                allowed_users: Some(vec!["staff".to_string()]),
                ..ConnectorConfig::default()
            },
        );
        assert!(connector.validate_access(Some("staff")).await);
        assert!(!connector.validate_access(Some("guest")).await);
    }
}
