//! End-to-end scenarios over an in-memory store and a scripted fetcher
//! (spec §8 "Concrete end-to-end scenarios").

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sitesync_core::config::{DomainFilter, OutputsConfig};
use sitesync_core::dispatcher::{Dispatcher, WorkItem};
use sitesync_core::fetcher::test_support::ScriptedFetcher;
use sitesync_core::fetcher::FetchResult;
use sitesync_core::filter::UrlFilter;
use sitesync_core::plugin::PluginRegistry;
use sitesync_core::retry::RetryPolicy;
use sitesync_core::store::Store;
use sitesync_core::types::{RunStatus, TaskType};
use sitesync_core::worker::{MetricsRegistry, Worker};
use sitesync_core::{FetchFailure, Orchestrator};

fn outputs() -> OutputsConfig {
    OutputsConfig {
        base_path: PathBuf::from("/tmp/sitesync-test"),
        raw_subdir: "raw".to_string(),
        normalized_subdir: "normalized".to_string(),
        metadata_subdir: "metadata".to_string(),
        media_subdir: "media".to_string(),
    }
}

fn retry_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_min_seconds: 0.0,
        backoff_max_seconds: 0.0,
        backoff_multiplier: 1.0,
        jitter_seconds: 0.0,
    }
}

/// Spawns one dispatcher and `worker_count` workers against `filter`, all
/// sharing one scripted fetcher, and waits for the pool to drain.
async fn run_pool(
    store: Arc<Store>,
    filter: Arc<UrlFilter>,
    run_id: i64,
    worker_count: u32,
    fetcher: Arc<ScriptedFetcher>,
    max_retries: u32,
) {
    let cancel = tokio_util::sync::CancellationToken::new();
    let dispatcher = Dispatcher::new(
        store.clone(),
        filter.clone(),
        run_id,
        worker_count,
        2,
        30.0,
        max_retries,
        0.0,
        Duration::from_millis(5),
    );
    let (sender, receiver) = tokio::sync::mpsc::channel::<WorkItem>(dispatcher.channel_capacity());
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

    let dispatcher_handle = tokio::spawn(dispatcher.run(sender, cancel.clone()));

    let mut worker_handles = Vec::new();
    for i in 0..worker_count {
        let worker = Worker {
            name: format!("worker-{i}"),
            run_id,
            store: store.clone(),
            filter: filter.clone(),
            page_fetcher: fetcher.clone(),
            media_fetcher: fetcher.clone(),
            plugins: Arc::new(PluginRegistry::new()),
            retry_policy: retry_policy(max_retries),
            outputs: Arc::new(outputs()),
            fetch_timeout: None,
            metrics: Arc::new(MetricsRegistry::new()),
            backoff_seconds: 0.0,
            max_retries,
        };
        worker_handles.push(tokio::spawn(worker.run(receiver.clone(), cancel.clone())));
    }

    dispatcher_handle.await.unwrap().unwrap();
    for handle in worker_handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn scenario_1_seed_and_drain() {
    let store = Arc::new(Store::connect(":memory:").await.unwrap());
    let filter = Arc::new(UrlFilter::new(HashMap::new()));
    let orchestrator = Orchestrator::new(store.clone());
    let crawler = sitesync_core::config::CrawlerConfig {
        parallel_agents: 2,
        max_retries: 3,
        ..Default::default()
    };
    let source = sitesync_core::config::SourceSettings {
        name: "acme".to_string(),
        start_urls: vec![
            "https://example.com/a".to_string(),
            "https://example.com/b".to_string(),
        ],
        allowed_domains: HashMap::new(),
        depth: 1,
        plugins: Vec::new(),
        parallel_agents: None,
        pages_per_agent: None,
        jitter_seconds: None,
        max_pages: None,
        fetcher: "playwright".to_string(),
        fetcher_options: serde_json::Value::Null,
    };
    let summary = orchestrator
        .resume_or_start(&crawler, &source, None, None, None)
        .await
        .unwrap();

    let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(success_result("aaa"))]));
    run_pool(store.clone(), filter, summary.run.id, 2, fetcher, 3).await;
    orchestrator.finish_run(summary.run.id, true).await.unwrap();

    let counts = store.get_task_status_counts(summary.run.id).await.unwrap();
    assert_eq!(counts.finished, 2);
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.error, 0);

    let assets = store.list_assets(summary.run.id).await.unwrap();
    assert_eq!(assets.len(), 2);
    for asset in &assets {
        let versions = store.list_asset_versions(asset.id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, 1);
    }

    let run = store.get_run(summary.run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn scenario_2_transient_then_success() {
    let store = Arc::new(Store::connect(":memory:").await.unwrap());
    let filter = Arc::new(UrlFilter::new(HashMap::new()));
    let run = store.start_run("acme", None).await.unwrap();
    store
        .enqueue_seed_tasks(run.id, &[("https://example.com/a".to_string(), 1)], TaskType::Page)
        .await
        .unwrap();

    let fetcher = Arc::new(ScriptedFetcher::new(vec![
        Err(FetchFailure::Transient("timeout".to_string())),
        Ok(success_result("bbb")),
    ]));
    run_pool(store.clone(), filter, run.id, 1, fetcher.clone(), 3).await;

    assert_eq!(fetcher.call_count(), 2);
    let counts = store.get_task_status_counts(run.id).await.unwrap();
    assert_eq!(counts.finished, 1);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn scenario_3_retry_exhaustion() {
    let store = Arc::new(Store::connect(":memory:").await.unwrap());
    let filter = Arc::new(UrlFilter::new(HashMap::new()));
    let run = store.start_run("acme", None).await.unwrap();
    store
        .enqueue_seed_tasks(run.id, &[("https://example.com/a".to_string(), 1)], TaskType::Page)
        .await
        .unwrap();

    let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(FetchFailure::Transient(
        "always fails".to_string(),
    ))]));
    run_pool(store.clone(), filter, run.id, 1, fetcher.clone(), 2).await;

    assert_eq!(fetcher.call_count(), 2);
    let counts = store.get_task_status_counts(run.id).await.unwrap();
    assert_eq!(counts.error, 1);
    assert_eq!(counts.pending, 0);
}

#[test]
fn scenario_4_path_filter() {
    let mut domains = HashMap::new();
    domains.insert(
        "example.com".to_string(),
        DomainFilter {
            allow_paths: vec!["/docs/**".to_string()],
            deny_paths: vec!["/docs/private/**".to_string()],
        },
    );
    let filter = UrlFilter::new(domains);
    assert!(filter.path_allowed("example.com", "/docs/intro"));
    assert!(!filter.path_allowed("example.com", "/docs/private/secret"));
    assert!(!filter.path_allowed("example.com", "/other"));
    assert!(!filter.path_allowed("example.com", "/docs"));
}

#[tokio::test]
async fn scenario_5_auth_redirect_adaptation() {
    let store = Arc::new(Store::connect(":memory:").await.unwrap());
    let filter = Arc::new(UrlFilter::new(HashMap::new()));
    let run = store.start_run("acme", None).await.unwrap();
    store
        .enqueue_seed_tasks(
            run.id,
            &[("https://app.example.com/settings/roles".to_string(), 1)],
            TaskType::Page,
        )
        .await
        .unwrap();

    let mut result = success_result("ccc");
    result.metadata_json = Some(
        r#"{"url": "https://app.example.com/auth/login?continue=%2Fsettings%2Froles"}"#.to_string(),
    );
    let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(result)]));
    run_pool(store.clone(), filter.clone(), run.id, 1, fetcher, 3).await;

    let denies = filter.runtime_denies_snapshot();
    let host_denies = denies.get("app.example.com").cloned().unwrap_or_default();
    assert!(host_denies.contains(&"/auth/**".to_string()));
    assert!(host_denies.contains(&"/settings/roles/**".to_string()));
    assert!(!filter.path_allowed("app.example.com", "/settings/roles/edit"));

    let counts = store.get_task_status_counts(run.id).await.unwrap();
    assert_eq!(counts.finished, 1);
}

#[tokio::test]
async fn scenario_6_media_bypass() {
    let store = Arc::new(Store::connect(":memory:").await.unwrap());
    let mut domains = HashMap::new();
    domains.insert(
        "example.com".to_string(),
        DomainFilter {
            allow_paths: vec!["/docs/**".to_string()],
            deny_paths: vec![],
        },
    );
    let filter = Arc::new(UrlFilter::new(domains));
    let run = store.start_run("acme", None).await.unwrap();
    store
        .enqueue_seed_tasks(
            run.id,
            &[("https://cdn.example.net/image.png".to_string(), 0)],
            TaskType::Media,
        )
        .await
        .unwrap();

    let mut result = success_result("ddd");
    result.asset_type = "media".to_string();
    let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(result)]));
    run_pool(store.clone(), filter, run.id, 1, fetcher.clone(), 3).await;

    assert_eq!(fetcher.call_count(), 1);
    let counts = store.get_task_status_counts(run.id).await.unwrap();
    assert_eq!(counts.finished, 1);
    assert_eq!(counts.error, 0);
}

fn success_result(checksum: &str) -> FetchResult {
    FetchResult {
        assets_created: 1,
        raw_payload_path: None,
        normalized_payload_path: None,
        checksum: Some(checksum.to_string()),
        asset_type: "page".to_string(),
        metadata_json: None,
    }
}
