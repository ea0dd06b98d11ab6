//! Snapshot refresh pipeline.
//!
//! One cycle fetches the repository index, fans out one language fetch per
//! repository, and publishes the assembled [`Snapshot`] with a single store
//! write.  The first failing fetch cancels its siblings and aborts the cycle,
//! leaving the previously published snapshot untouched.

pub mod scheduler;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::forge::{FetchError, ForgeBackend, LanguageBreakdown, RepositorySummary};
use crate::metrics::{MetricsRegistry, RefreshOutcome};
use crate::model::{publish_snapshot, Language, Repository, SharedStore, Snapshot};

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Repositories in the published snapshot.
    pub repositories: usize,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("failed to fetch repository index: {0}")]
    Index(#[source] FetchError),

    #[error("failed to fetch languages of {repository}: {source}")]
    Languages {
        repository: String,
        #[source]
        source: FetchError,
    },

    #[error("language fetch task failed: {0}")]
    Task(#[source] JoinError),

    #[error("failed to publish snapshot: {0:#}")]
    Publish(anyhow::Error),
}

impl RefreshError {
    /// Pipeline step that failed, used as a structured log field.
    pub fn step(&self) -> &'static str {
        match self {
            RefreshError::Index(_) => "index",
            RefreshError::Languages { .. } | RefreshError::Task(_) => "languages",
            RefreshError::Publish(_) => "publish",
        }
    }
}

// ---------------------------------------------------------------------------
// Refresher
// ---------------------------------------------------------------------------

pub struct Refresher {
    forge: Arc<dyn ForgeBackend>,
    store: SharedStore,
    metrics: MetricsRegistry,
}

impl Refresher {
    pub fn new(forge: Arc<dyn ForgeBackend>, store: SharedStore, metrics: MetricsRegistry) -> Self {
        Self {
            forge,
            store,
            metrics,
        }
    }

    /// Run one refresh cycle and publish its snapshot on success.
    ///
    /// Errors are logged and recorded here; callers only need the result to
    /// decide what to do next.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<RefreshSummary, RefreshError> {
        info!("fetching repositories");
        let started = Instant::now();

        let result = self.refresh().await;
        let elapsed = started.elapsed();
        let metrics = &self.metrics.metrics;
        metrics
            .refresh_duration_seconds
            .observe(elapsed.as_secs_f64());

        match result {
            Ok(repositories) => {
                metrics.record_refresh(RefreshOutcome::Success);
                metrics
                    .snapshot_repositories
                    .set(i64::try_from(repositories).unwrap_or(i64::MAX));
                info!(
                    repositories,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "snapshot refreshed"
                );
                Ok(RefreshSummary {
                    repositories,
                    elapsed,
                })
            }
            Err(e) => {
                metrics.record_refresh(RefreshOutcome::Failure);
                error!(
                    step = e.step(),
                    error = %e,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "refresh cycle aborted; previous snapshot kept"
                );
                Err(e)
            }
        }
    }

    async fn refresh(&self) -> Result<usize, RefreshError> {
        let index = self
            .forge
            .list_repositories()
            .await
            .map_err(RefreshError::Index)?;
        debug!(repositories = index.len(), "repository index fetched");

        let breakdowns = self.fetch_languages(&index).await?;

        let repositories: Vec<Repository> = index
            .into_iter()
            .zip(breakdowns)
            .map(|(summary, breakdown)| to_repository(summary, breakdown))
            .collect();
        let count = repositories.len();

        let snapshot = Snapshot {
            repositories,
            refreshed_at: Utc::now(),
        };
        publish_snapshot(self.store.as_ref(), snapshot)
            .await
            .map_err(RefreshError::Publish)?;

        Ok(count)
    }

    /// Fetch every language breakdown concurrently, returned in index order.
    ///
    /// The connection cap lives in the forge backend, so every fetch is
    /// spawned up front.
    async fn fetch_languages(
        &self,
        index: &[RepositorySummary],
    ) -> Result<Vec<LanguageBreakdown>, RefreshError> {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for (position, repository) in index.iter().cloned().enumerate() {
            let forge = Arc::clone(&self.forge);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = tokio::select! {
                    () = cancel.cancelled() => return None,
                    result = forge.repository_languages(&repository) => result,
                };
                Some((position, repository.full_name, result))
            });
        }

        let mut fetched = Vec::with_capacity(index.len());
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    cancel.cancel();
                    tasks.abort_all();
                    return Err(RefreshError::Task(e));
                }
            };
            // Only reachable after cancellation, which always returns first.
            let Some((position, repository, result)) = outcome else {
                continue;
            };
            match result {
                Ok(breakdown) => fetched.push((position, breakdown)),
                Err(source) => {
                    cancel.cancel();
                    tasks.abort_all();
                    return Err(RefreshError::Languages { repository, source });
                }
            }
        }

        fetched.sort_unstable_by_key(|(position, _)| *position);
        Ok(fetched.into_iter().map(|(_, breakdown)| breakdown).collect())
    }
}

/// Convert an upstream record, lowercasing language names.  Names that only
/// differ in case are merged by summing their sizes.
fn to_repository(summary: RepositorySummary, breakdown: LanguageBreakdown) -> Repository {
    let mut languages: BTreeMap<String, Language> = BTreeMap::new();
    for (name, bytes) in breakdown {
        let language = languages
            .entry(name.to_lowercase())
            .or_insert(Language { bytes: 0 });
        language.bytes = language.bytes.saturating_add(bytes);
    }

    Repository {
        full_name: summary.full_name,
        owner: summary.owner.login,
        repository: summary.name,
        languages,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::UpstreamConfig;
    use crate::forge::github::GitHubBackend;
    use crate::forge::OwnerSummary;
    use crate::model::{load_snapshot, CacheValue};
    use crate::store::{Expiry, MemoryStore, Store};

    fn memory_store() -> SharedStore {
        Arc::new(MemoryStore::<CacheValue>::new(Duration::from_secs(30)))
    }

    fn github(server: &MockServer, metrics: &MetricsRegistry) -> Arc<dyn ForgeBackend> {
        let upstream = UpstreamConfig {
            api_url: server.uri(),
            ..UpstreamConfig::default()
        };
        Arc::new(GitHubBackend::new(
            &upstream,
            Some("token".into()),
            reqwest::Client::new(),
            metrics.clone(),
        ))
    }

    async fn mount_index(server: &MockServer) {
        let body = serde_json::json!([
            {
                "name": "foo",
                "full_name": "gopher/foo",
                "owner": {"login": "gopher"},
                "url": format!("{}/repos/gopher/foo", server.uri())
            },
            {
                "name": "bar",
                "full_name": "gopher/bar",
                "owner": {"login": "gopher"},
                "url": format!("{}/repos/gopher/bar", server.uri())
            }
        ]);
        Mock::given(method("GET"))
            .and(path("/repositories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_languages(server: &MockServer, repo: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(format!("/repos/gopher/{repo}/languages")))
            .respond_with(response)
            .mount(server)
            .await;
    }

    fn repo(name: &str, langs: &[(&str, u64)]) -> Repository {
        Repository {
            full_name: format!("gopher/{name}"),
            owner: "gopher".into(),
            repository: name.into(),
            languages: langs
                .iter()
                .map(|(lang, bytes)| (lang.to_string(), Language { bytes: *bytes }))
                .collect(),
        }
    }

    #[tokio::test]
    async fn publishes_snapshot_in_index_order() {
        let server = MockServer::start().await;
        mount_index(&server).await;
        mount_languages(
            &server,
            "foo",
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"golang": 1234})),
        )
        .await;
        mount_languages(
            &server,
            "bar",
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"c++": 5678})),
        )
        .await;

        let metrics = MetricsRegistry::new();
        let store = memory_store();
        let refresher = Refresher::new(github(&server, &metrics), store.clone(), metrics.clone());

        let summary = refresher.run_once().await.unwrap();
        assert_eq!(summary.repositories, 2);

        let snapshot = load_snapshot(store.as_ref()).await.unwrap().unwrap();
        assert_eq!(
            snapshot.repositories,
            vec![repo("foo", &[("golang", 1234)]), repo("bar", &[("c++", 5678)])]
        );

        let text = metrics.encode().unwrap();
        assert!(text.contains("langstats_refresh_cycles_total{outcome=\"Success\"} 1"));
        assert!(text.contains("langstats_snapshot_repositories 2"));
    }

    #[tokio::test]
    async fn language_names_are_lowercased() {
        let server = MockServer::start().await;
        mount_index(&server).await;
        mount_languages(
            &server,
            "foo",
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"Go": 100, "GO": 20, "Shell": 3})),
        )
        .await;
        mount_languages(
            &server,
            "bar",
            ResponseTemplate::new(200).set_body_json(serde_json::json!({})),
        )
        .await;

        let metrics = MetricsRegistry::new();
        let store = memory_store();
        Refresher::new(github(&server, &metrics), store.clone(), metrics)
            .run_once()
            .await
            .unwrap();

        let snapshot = load_snapshot(store.as_ref()).await.unwrap().unwrap();
        assert_eq!(snapshot.repositories[0], repo("foo", &[("go", 120), ("shell", 3)]));
        assert!(snapshot.repositories[1].languages.is_empty());
    }

    #[tokio::test]
    async fn failed_language_fetch_keeps_previous_snapshot() {
        let server = MockServer::start().await;
        mount_index(&server).await;
        mount_languages(
            &server,
            "foo",
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"golang": 1})),
        )
        .await;
        mount_languages(&server, "bar", ResponseTemplate::new(500)).await;

        let store = memory_store();
        let previous = Snapshot {
            repositories: vec![repo("old", &[("ruby", 9)])],
            refreshed_at: Utc::now(),
        };
        publish_snapshot(store.as_ref(), previous.clone()).await.unwrap();

        let metrics = MetricsRegistry::new();
        let err = Refresher::new(github(&server, &metrics), store.clone(), metrics.clone())
            .run_once()
            .await
            .unwrap_err();

        assert_eq!(err.step(), "languages");
        assert!(matches!(
            &err,
            RefreshError::Languages { repository, source: FetchError::Status { .. } }
                if repository == "gopher/bar"
        ));
        let snapshot = load_snapshot(store.as_ref()).await.unwrap().unwrap();
        assert_eq!(*snapshot, previous);
        assert!(metrics
            .encode()
            .unwrap()
            .contains("langstats_refresh_cycles_total{outcome=\"Failure\"} 1"));
    }

    #[tokio::test]
    async fn index_failure_leaves_store_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repositories"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let metrics = MetricsRegistry::new();
        let store = memory_store();
        let err = Refresher::new(github(&server, &metrics), store.clone(), metrics)
            .run_once()
            .await
            .unwrap_err();

        assert_eq!(err.step(), "index");
        assert!(load_snapshot(store.as_ref()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_languages_abort_the_cycle() {
        let server = MockServer::start().await;
        mount_index(&server).await;
        mount_languages(
            &server,
            "foo",
            ResponseTemplate::new(200).set_body_string("[\"not\", \"a map\"]"),
        )
        .await;
        mount_languages(
            &server,
            "bar",
            ResponseTemplate::new(200).set_body_json(serde_json::json!({})),
        )
        .await;

        let metrics = MetricsRegistry::new();
        let store = memory_store();
        let err = Refresher::new(github(&server, &metrics), store.clone(), metrics)
            .run_once()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RefreshError::Languages { source: FetchError::Decode { .. }, .. }
        ));
        assert!(load_snapshot(store.as_ref()).await.unwrap().is_none());
    }

    // -- cancellation --

    /// One repository fails immediately; every other fetch never completes.
    struct StuckForge {
        in_flight: Arc<AtomicUsize>,
    }

    struct InFlight(Arc<AtomicUsize>);

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn summary(name: &str) -> RepositorySummary {
        RepositorySummary {
            name: name.into(),
            full_name: format!("gopher/{name}"),
            owner: OwnerSummary {
                login: "gopher".into(),
            },
            url: format!("http://forge.invalid/repos/gopher/{name}"),
        }
    }

    #[async_trait::async_trait]
    impl ForgeBackend for StuckForge {
        async fn list_repositories(&self) -> Result<Vec<RepositorySummary>, FetchError> {
            Ok(vec![summary("a"), summary("b"), summary("broken"), summary("c")])
        }

        async fn repository_languages(
            &self,
            repository: &RepositorySummary,
        ) -> Result<LanguageBreakdown, FetchError> {
            if repository.name == "broken" {
                return Err(FetchError::Status {
                    url: repository.url.clone(),
                    status: reqwest::StatusCode::NOT_FOUND,
                });
            }
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let _guard = InFlight(Arc::clone(&self.in_flight));
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn first_failure_cancels_pending_siblings() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let forge = Arc::new(StuckForge {
            in_flight: Arc::clone(&in_flight),
        });
        let store = memory_store();
        let refresher = Refresher::new(forge, store.clone(), MetricsRegistry::new());

        let err = tokio::time::timeout(Duration::from_secs(5), refresher.run_once())
            .await
            .expect("run_once should return promptly")
            .unwrap_err();

        assert!(matches!(&err, RefreshError::Languages { repository, .. } if repository == "gopher/broken"));
        assert!(load_snapshot(store.as_ref()).await.unwrap().is_none());

        for _ in 0..50 {
            if in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    // -- publish failure --

    struct ReadOnlyStore;

    #[async_trait::async_trait]
    impl Store<CacheValue> for ReadOnlyStore {
        async fn read(&self, _key: &str) -> Result<Option<CacheValue>> {
            Ok(None)
        }

        async fn write(&self, key: &str, _value: CacheValue, _expiry: Expiry) -> Result<()> {
            anyhow::bail!("store is read-only, refusing {key}")
        }
    }

    struct EmptyForge;

    #[async_trait::async_trait]
    impl ForgeBackend for EmptyForge {
        async fn list_repositories(&self) -> Result<Vec<RepositorySummary>, FetchError> {
            Ok(Vec::new())
        }

        async fn repository_languages(
            &self,
            _repository: &RepositorySummary,
        ) -> Result<LanguageBreakdown, FetchError> {
            Ok(LanguageBreakdown::new())
        }
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let refresher = Refresher::new(
            Arc::new(EmptyForge),
            Arc::new(ReadOnlyStore),
            MetricsRegistry::new(),
        );
        let err = refresher.run_once().await.unwrap_err();
        assert_eq!(err.step(), "publish");
        assert!(err.to_string().contains("refusing repositories"));
    }

    #[test]
    fn to_repository_maps_fields() {
        let mut breakdown = LanguageBreakdown::new();
        breakdown.insert("Rust".into(), u64::MAX);
        breakdown.insert("RUST".into(), 5);

        let repository = to_repository(summary("x"), breakdown);
        assert_eq!(repository.full_name, "gopher/x");
        assert_eq!(repository.owner, "gopher");
        assert_eq!(repository.repository, "x");
        assert_eq!(repository.languages["rust"].bytes, u64::MAX);
    }
}
