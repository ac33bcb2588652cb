use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::NaiveDate;
use httpmock::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use workpulse_lib::db::repositories::category_repository::CategoryRepository;
use workpulse_lib::db::repositories::task_log_repository::{NewTaskLog, TaskLogRepository};
use workpulse_lib::db::repositories::SqliteStore;
use workpulse_lib::db::DbPool;
use workpulse_lib::models::classification::{TaskLog, UNCATEGORIZED};
use workpulse_lib::models::credential::{CredentialStatus, NewCredential, ProviderKind};
use workpulse_lib::models::settings::DispatchSettings;
use workpulse_lib::services::classification_dispatcher::ClassificationDispatcher;
use workpulse_lib::services::key_router::KeyRouter;
use workpulse_lib::services::providers::{build_http_client, ProviderFactory};
use workpulse_lib::utils::crypto::CryptoVault;

struct Harness {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    router: Arc<KeyRouter>,
    dispatcher: ClassificationDispatcher,
}

fn harness(categories: &[&str], batch_size: usize) -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = DbPool::new(dir.path().join("dispatch.sqlite")).expect("db pool");
    let store = Arc::new(SqliteStore::new(pool));
    store
        .pool()
        .with_connection(|conn| {
            for (order, name) in categories.iter().enumerate() {
                CategoryRepository::insert(conn, name, 1.0, order as i32)?;
            }
            Ok(())
        })
        .expect("seed categories");

    let vault = Arc::new(CryptoVault::with_master_secret(&[3u8; 32]).expect("vault"));
    let router = Arc::new(KeyRouter::load(store.clone(), vault).expect("router"));
    let settings = DispatchSettings {
        batch_size,
        concurrency: 2,
        max_attempts: 3,
        http_timeout: StdDuration::from_secs(2),
    };
    let factory = ProviderFactory::with_client(build_http_client(settings.http_timeout).unwrap());
    let dispatcher = ClassificationDispatcher::new(
        Arc::clone(&router),
        factory,
        store.clone(),
        store.clone(),
        settings,
    );

    Harness {
        _dir: dir,
        store,
        router,
        dispatcher,
    }
}

impl Harness {
    fn add_openai(&self, label: &str, priority: i32, base_url: String) -> i64 {
        self.router
            .register_credential(NewCredential {
                provider: ProviderKind::OpenAiCompatible,
                label: label.into(),
                secret: Some(format!("sk-{label}")),
                priority,
                daily_quota: None,
                model: Some("gpt-4o-mini".into()),
                endpoint: Some(base_url),
                api_version: None,
            })
            .expect("register credential")
            .id
    }

    fn add_logs(&self, descriptions: &[&str]) -> Vec<i64> {
        self.store
            .pool()
            .with_connection(|conn| {
                descriptions
                    .iter()
                    .map(|description| {
                        TaskLogRepository::insert(
                            conn,
                            &NewTaskLog {
                                employee_id: 42,
                                work_date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
                                description: description.to_string(),
                                hours: 2.0,
                            },
                        )
                    })
                    .collect()
            })
            .expect("insert logs")
    }

    fn log(&self, id: i64) -> TaskLog {
        self.store
            .pool()
            .with_connection(|conn| TaskLogRepository::find(conn, id))
            .expect("query log")
            .expect("log exists")
    }
}

fn completion(content: serde_json::Value) -> serde_json::Value {
    json!({
        "choices": [{"message": {"content": content.to_string()}}],
        "usage": {"prompt_tokens": 50, "completion_tokens": 10, "total_tokens": 60}
    })
}

#[tokio::test]
async fn classification_is_written_back_to_the_log() {
    let server = MockServer::start_async().await;
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .json_body(completion(json!([{"category": "Engineering", "confidence": 0.98}])));
        })
        .await;

    let h = harness(&["Engineering", "Sales"], 20);
    let credential_id = h.add_openai("primary", 1, server.base_url());
    let ids = h.add_logs(&["Fixed login bug in auth service"]);

    let report = h.dispatcher.classify_pending(10).await.expect("classify");

    assert_eq!(report.batches, 1);
    assert_eq!(report.classified, 1);
    assert_eq!(report.fallback, 0);
    assert!(report.fatal_errors.is_empty());
    assert_eq!(report.results[0].credential_id, Some(credential_id));

    let log = h.log(ids[0]);
    assert_eq!(log.category.as_deref(), Some("Engineering"));
    assert_eq!(log.confidence, Some(0.98));
    assert!(log.classified_at.is_some());

    assert_eq!(h.router.get(credential_id).unwrap().daily_usage, 1);
    assert!(h.dispatcher.classify_pending(10).await.unwrap().results.is_empty());
}

#[tokio::test]
async fn provider_failure_fails_over_and_degrades_the_first_credential() {
    let failing = MockServer::start_async().await;
    let failing_mock = failing
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(500).body("internal error");
        })
        .await;
    let healthy = MockServer::start_async().await;
    let _ok = healthy
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(completion(json!([
                {"category": "sales", "confidence": 0.8},
                {"category": "Engineering", "confidence": 0.9}
            ])));
        })
        .await;

    let h = harness(&["Engineering", "Sales"], 20);
    let first = h.add_openai("first", 1, failing.base_url());
    let second = h.add_openai("second", 2, healthy.base_url());
    let ids = h.add_logs(&["Client renewal call", "Refactored scheduler"]);

    let report = h.dispatcher.classify_pending(10).await.expect("classify");

    failing_mock.assert_hits_async(1).await;
    assert_eq!(report.classified, 2);
    assert!(report
        .results
        .iter()
        .all(|entry| entry.credential_id == Some(second)));
    assert_eq!(h.log(ids[0]).category.as_deref(), Some("Sales"));
    assert_eq!(h.log(ids[1]).category.as_deref(), Some("Engineering"));

    let degraded = h.router.get(first).unwrap();
    assert_eq!(degraded.status, CredentialStatus::Degraded);
    assert!(degraded.last_error.is_some());
    assert_eq!(h.router.get(second).unwrap().status, CredentialStatus::Active);
}

#[tokio::test]
async fn unparseable_output_counts_as_failure() {
    let chatty = MockServer::start_async().await;
    let _chatty = chatty
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({
                "choices": [{"message": {"content": "I am not able to categorize these."}}]
            }));
        })
        .await;
    let healthy = MockServer::start_async().await;
    let _ok = healthy
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .json_body(completion(json!([{"category": "Engineering", "confidence": 0.7}])));
        })
        .await;

    let h = harness(&["Engineering"], 20);
    let chatty_id = h.add_openai("chatty", 1, chatty.base_url());
    let healthy_id = h.add_openai("healthy", 2, healthy.base_url());
    h.add_logs(&["Wrote migration script"]);

    let report = h.dispatcher.classify_pending(10).await.unwrap();

    assert_eq!(report.results[0].credential_id, Some(healthy_id));
    assert_eq!(
        h.router.get(chatty_id).unwrap().status,
        CredentialStatus::Degraded
    );
}

#[tokio::test]
async fn every_provider_failing_writes_sentinels() {
    let server = MockServer::start_async().await;
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(429);
        })
        .await;

    let h = harness(&["Engineering", "Sales"], 20);
    let a = h.add_openai("a", 1, server.base_url());
    let b = h.add_openai("b", 2, server.base_url());
    let ids = h.add_logs(&["Sprint planning", "Lead qualification", "Pager duty"]);

    let report = h.dispatcher.classify_pending(10).await.expect("classify");

    assert_eq!(report.classified, 0);
    assert_eq!(report.fallback, 3);
    assert!(report.fatal_errors.is_empty());
    for id in ids {
        let log = h.log(id);
        assert_eq!(log.category.as_deref(), Some(UNCATEGORIZED));
        assert_eq!(log.confidence, Some(0.0));
    }
    for id in [a, b] {
        assert_eq!(h.router.get(id).unwrap().status, CredentialStatus::Degraded);
    }
}

#[tokio::test]
async fn short_replies_are_padded_to_batch_length() {
    let server = MockServer::start_async().await;
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(completion(json!([
                {"category": "Engineering", "confidence": 0.9},
                {"category": "Marketing", "confidence": 0.9}
            ])));
        })
        .await;

    let h = harness(&["Engineering", "Sales"], 3);
    h.add_openai("primary", 1, server.base_url());
    let ids = h.add_logs(&["one", "two", "three", "four", "five"]);

    let report = h.dispatcher.classify_pending(10).await.expect("classify");

    assert_eq!(report.batches, 2);
    assert_eq!(report.results.len(), ids.len());
    let ordered: Vec<i64> = report.results.iter().map(|entry| entry.log_id).collect();
    assert_eq!(ordered, ids);

    // Each batch: Engineering, unknown "Marketing", then padding.
    let first = report.result_for(ids[0]).unwrap();
    assert_eq!(first.category, "Engineering");
    let unknown = report.result_for(ids[1]).unwrap();
    assert!(unknown.is_sentinel());
    assert_eq!(unknown.confidence, 0.0);
    assert!(report.result_for(ids[2]).unwrap().is_sentinel());
    assert_eq!(report.result_for(ids[3]).unwrap().category, "Engineering");
    assert_eq!(report.classified, 2);
    assert_eq!(report.fallback, 3);
}

#[tokio::test]
async fn missing_categories_skip_the_provider() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(completion(json!([])));
        })
        .await;

    let h = harness(&[], 20);
    h.add_openai("primary", 1, server.base_url());
    let ids = h.add_logs(&["anything"]);

    let report = h.dispatcher.classify_pending(10).await.expect("classify");

    mock.assert_hits_async(0).await;
    assert_eq!(report.fallback, 1);
    assert_eq!(h.log(ids[0]).category.as_deref(), Some(UNCATEGORIZED));
}

#[tokio::test]
async fn misconfigured_credential_is_reported_as_fatal() {
    let h = harness(&["Engineering"], 20);
    h.router
        .register_credential(NewCredential {
            provider: ProviderKind::AzureOpenAi,
            label: "azure-no-deployment".into(),
            secret: Some("azure-key".into()),
            priority: 1,
            daily_quota: None,
            model: None,
            endpoint: Some("https://acme.openai.azure.com".into()),
            api_version: None,
        })
        .unwrap();
    let ids = h.add_logs(&["Code review"]);

    let report = h.dispatcher.classify_pending(10).await.expect("classify");

    assert_eq!(report.fatal_errors.len(), 1);
    assert!(report.fatal_errors[0].contains("deployment"));
    assert_eq!(report.fallback, 1);
    assert_eq!(h.log(ids[0]).category.as_deref(), Some(UNCATEGORIZED));
}

#[tokio::test]
async fn no_credentials_still_completes() {
    let h = harness(&["Engineering"], 20);
    let ids = h.add_logs(&["Deploy hotfix"]);

    let report = h.dispatcher.classify_pending(10).await.expect("classify");

    assert_eq!(report.fallback, 1);
    assert!(report.fatal_errors.is_empty());
    assert_eq!(h.log(ids[0]).confidence, Some(0.0));
}

#[tokio::test]
async fn fallbacks_are_retried_once_a_provider_answers() {
    let h = harness(&["Engineering"], 20);
    let ids = h.add_logs(&["Deploy hotfix"]);

    let outage = h.dispatcher.classify_pending(10).await.expect("classify");
    assert_eq!(outage.fallback, 1);
    assert_eq!(h.log(ids[0]).category.as_deref(), Some(UNCATEGORIZED));

    let server = MockServer::start_async().await;
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .json_body(completion(json!([{"category": "Engineering", "confidence": 0.85}])));
        })
        .await;
    h.add_openai("recovered", 1, server.base_url());

    let retry = h.dispatcher.classify_pending(10).await.expect("classify");

    assert_eq!(retry.classified, 1);
    assert_eq!(h.log(ids[0]).category.as_deref(), Some("Engineering"));
    assert!(h.dispatcher.classify_pending(10).await.unwrap().results.is_empty());
}
