use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, ProviderErrorCode};
use crate::models::classification::{
    ClassificationBatch, ClassificationReport, ClassificationResult, ClassifiedLog, PendingLog,
    ProviderReply, UNCATEGORIZED,
};
use crate::models::evaluation::{LlmCategoryScore, ScoreEvaluationRequest};
use crate::models::settings::DispatchSettings;
use crate::services::key_router::KeyRouter;
use crate::services::providers::{ClassificationProvider, ProviderFactory};
use crate::services::sources::{CategorySource, TaskLogStore};

struct BatchOutcome {
    index: usize,
    results: Vec<ClassifiedLog>,
    fatal_error: Option<String>,
}

/// Routes classification and scoring calls across the configured credentials,
/// failing over on provider errors and writing results back to the task logs.
#[derive(Clone)]
pub struct ClassificationDispatcher {
    router: Arc<KeyRouter>,
    factory: ProviderFactory,
    categories: Arc<dyn CategorySource>,
    task_logs: Arc<dyn TaskLogStore>,
    settings: DispatchSettings,
}

impl ClassificationDispatcher {
    pub fn new(
        router: Arc<KeyRouter>,
        factory: ProviderFactory,
        categories: Arc<dyn CategorySource>,
        task_logs: Arc<dyn TaskLogStore>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            router,
            factory,
            categories,
            task_logs,
            settings,
        }
    }

    pub fn router(&self) -> &Arc<KeyRouter> {
        &self.router
    }

    pub async fn classify_pending(&self, limit: usize) -> AppResult<ClassificationReport> {
        let task_logs = Arc::clone(&self.task_logs);
        let logs = run_blocking(move || task_logs.pending_logs(limit)).await?;
        Ok(self.classify_logs(logs).await)
    }

    /// Classifies and writes back every log. Always completes: logs nobody could
    /// classify are written as `Uncategorized` with confidence 0.
    pub async fn classify_logs(&self, logs: Vec<PendingLog>) -> ClassificationReport {
        if logs.is_empty() {
            return ClassificationReport::default();
        }

        let batch_size = self.settings.batch_size.max(1);
        let batches: Vec<Vec<PendingLog>> = logs
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        info!(
            target: "app::dispatch",
            logs = logs.len(),
            batches = batches.len(),
            concurrency = self.settings.concurrency,
            "classification pass started"
        );

        let mut outcomes: Vec<BatchOutcome> = stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| self.run_batch(index, batch))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;
        outcomes.sort_by_key(|outcome| outcome.index);

        let mut report = ClassificationReport {
            batches: outcomes.len(),
            ..ClassificationReport::default()
        };
        for outcome in outcomes {
            if let Some(error) = outcome.fatal_error {
                report.fatal_errors.push(error);
            }
            for entry in outcome.results {
                if entry.result.is_sentinel() {
                    report.fallback += 1;
                } else {
                    report.classified += 1;
                }
                report.results.push(entry);
            }
        }

        info!(
            target: "app::dispatch",
            batches = report.batches,
            classified = report.classified,
            fallback = report.fallback,
            fatal = report.fatal_errors.len(),
            "classification pass finished"
        );
        report
    }

    /// Model-adjusted category scores. Empty when no provider could answer.
    pub async fn score_breakdown(
        &self,
        request: &ScoreEvaluationRequest,
    ) -> HashMap<i64, LlmCategoryScore> {
        if request.breakdown.is_empty() {
            return HashMap::new();
        }

        let outcome = self
            .failover(
                "score_evaluation",
                |provider| {
                    let request = request.clone();
                    async move { provider.score_evaluation(&request).await }
                },
                |_| true,
            )
            .await;

        match outcome {
            Ok((reply, credential_id)) => {
                debug!(
                    target: "app::dispatch",
                    employee_id = request.employee_id,
                    credential_id,
                    scored = reply.value.len(),
                    "breakdown scored"
                );
                reply.value
            }
            Err(err) => {
                warn!(
                    target: "app::dispatch",
                    employee_id = request.employee_id,
                    error = %err,
                    "no provider scored the breakdown"
                );
                HashMap::new()
            }
        }
    }

    async fn run_batch(&self, index: usize, logs: Vec<PendingLog>) -> BatchOutcome {
        let mut fatal_error = None;

        let source = Arc::clone(&self.categories);
        let categories = match run_blocking(move || source.list_category_names()).await {
            Ok(categories) => categories,
            Err(err) => {
                fatal_error = Some(format!("batch {index}: categories unavailable: {err}"));
                Vec::new()
            }
        };

        let (results, credential_id) = if categories.is_empty() {
            debug!(target: "app::dispatch", batch = index, "no categories defined; writing sentinels");
            (sentinels(logs.len()), None)
        } else {
            let batch = ClassificationBatch::new(
                logs.iter().map(|log| log.description.clone()).collect(),
                categories.clone(),
            );
            let expected = batch.len();
            let outcome = self
                .failover(
                    "classify",
                    |provider| {
                        let batch = batch.clone();
                        async move { provider.classify(&batch).await }
                    },
                    move |reply| expected == 0 || reply.parsed > 0,
                )
                .await;

            match outcome {
                Ok((reply, credential_id)) => (
                    canonicalize(reply.value, &categories, expected),
                    Some(credential_id),
                ),
                Err(err) => {
                    if err.is_credential() {
                        fatal_error = Some(format!("batch {index}: {err}"));
                    }
                    warn!(
                        target: "app::dispatch",
                        batch = index,
                        error = %err,
                        "batch falls back to sentinels"
                    );
                    (sentinels(expected), None)
                }
            }
        };

        let results: Vec<ClassifiedLog> = logs
            .iter()
            .zip(results)
            .map(|(log, result)| ClassifiedLog {
                log_id: log.id,
                result,
                credential_id,
            })
            .collect();

        let task_logs = Arc::clone(&self.task_logs);
        let written = results.clone();
        if let Err(err) = run_blocking(move || task_logs.write_classifications(&written)).await {
            warn!(
                target: "app::dispatch",
                batch = index,
                logs = results.len(),
                error = %err,
                "failed to write classifications back"
            );
        }

        BatchOutcome {
            index,
            results,
            fatal_error,
        }
    }

    /// Tries credentials in router order, skipping ones already tried, until a
    /// reply is accepted. Provider errors and rejected replies degrade the
    /// credential; credential errors end the loop immediately.
    async fn failover<T, F, Fut, A>(
        &self,
        operation: &'static str,
        call: F,
        accept: A,
    ) -> AppResult<(ProviderReply<T>, i64)>
    where
        F: Fn(Box<dyn ClassificationProvider>) -> Fut,
        Fut: Future<Output = AppResult<ProviderReply<T>>>,
        A: Fn(&ProviderReply<T>) -> bool,
    {
        let mut tried = HashSet::new();
        let mut last_error: Option<AppError> = None;

        for attempt in 1..=self.settings.max_attempts.max(1) {
            let credential = match self.router.select(None, &tried) {
                Ok(credential) => credential,
                Err(err) => {
                    last_error = Some(err);
                    break;
                }
            };
            tried.insert(credential.id);

            let secret = self.router.decrypt_secret(&credential)?;
            let provider = self.factory.connect(&credential, secret)?;

            match call(provider).await {
                Ok(reply) => {
                    if reply.usage.is_some() {
                        self.router.record_usage(credential.id, 1);
                    }
                    if accept(&reply) {
                        debug!(
                            target: "app::dispatch",
                            operation,
                            attempt,
                            credential_id = credential.id,
                            correlation_id = %reply.correlation_id,
                            latency_ms = reply.latency_ms as u64,
                            "provider answered"
                        );
                        return Ok((reply, credential.id));
                    }
                    self.router
                        .mark_degraded(credential.id, "provider returned unparseable output");
                    last_error = Some(AppError::provider_with_details(
                        ProviderErrorCode::InvalidResponse,
                        format!("{} returned unparseable output", credential.provider),
                        None,
                        Some(reply.correlation_id.as_str()),
                        None,
                    ));
                }
                Err(err) if err.is_failover() => {
                    self.router.mark_degraded(credential.id, &err.to_string());
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::no_available_credential("any provider")))
    }
}

/// Runs synchronous storage work on the blocking pool.
async fn run_blocking<T, F>(work: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| AppError::other(format!("storage task failed: {err}")))?
}

fn sentinels(count: usize) -> Vec<ClassificationResult> {
    (0..count).map(|_| ClassificationResult::sentinel()).collect()
}

/// Maps provider categories onto the live names, case-insensitively. Unknown
/// names become sentinels; the provider payload is kept.
fn canonicalize(
    results: Vec<ClassificationResult>,
    categories: &[String],
    expected: usize,
) -> Vec<ClassificationResult> {
    let known: HashMap<String, &String> = categories
        .iter()
        .map(|name| (name.trim().to_lowercase(), name))
        .collect();

    let mut canonical: Vec<ClassificationResult> = results
        .into_iter()
        .take(expected)
        .map(|result| match known.get(&result.category.trim().to_lowercase()) {
            Some(name) => ClassificationResult::new((*name).clone(), result.confidence, result.raw),
            None => ClassificationResult {
                category: UNCATEGORIZED.to_string(),
                confidence: 0.0,
                raw: result.raw,
            },
        })
        .collect();
    canonical.resize_with(expected, ClassificationResult::sentinel);
    canonical
}
