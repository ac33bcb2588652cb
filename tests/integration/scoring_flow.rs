use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{NaiveDate, Utc};
use httpmock::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use workpulse_lib::db::repositories::category_repository::CategoryRepository;
use workpulse_lib::db::repositories::task_log_repository::{NewTaskLog, TaskLogRepository};
use workpulse_lib::error::{AppError, AppResult};
use workpulse_lib::models::audit::{AuditAction, AuditEvent};
use workpulse_lib::models::classification::ClassificationResult;
use workpulse_lib::models::credential::{NewCredential, ProviderKind};
use workpulse_lib::models::evaluation::{EvaluationStatus, MonthlyEvaluation};
use workpulse_lib::models::settings::ScoringWeights;
use workpulse_lib::services::sources::{AuditSink, EvaluationStore};
use workpulse_lib::utils::crypto::CryptoVault;
use workpulse_lib::AppState;

#[derive(Default)]
struct RecordingSink {
    actions: Mutex<Vec<AuditAction>>,
    fail: bool,
}

impl AuditSink for RecordingSink {
    fn record(&self, event: &AuditEvent) -> AppResult<()> {
        self.actions
            .lock()
            .expect("sink lock")
            .push(event.action);
        if self.fail {
            return Err(AppError::other("audit sink offline"));
        }
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    state: AppState,
    sink: Arc<RecordingSink>,
}

fn harness(fail_audit: bool) -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");
    let sink = Arc::new(RecordingSink {
        fail: fail_audit,
        ..RecordingSink::default()
    });
    let vault = CryptoVault::with_master_secret(&[9u8; 32]).expect("vault");
    let state = AppState::with_vault(dir.path().join("scoring.sqlite"), vault, sink.clone())
        .expect("app state");
    Harness {
        _dir: dir,
        state,
        sink,
    }
}

impl Harness {
    /// Engineering: 28 of 40 planned hours logged in March 2025, so a rule score of 70.
    fn seed_engineering_month(&self, employee_id: i64) -> i64 {
        self.state
            .db_pool()
            .with_connection(|conn| {
                let category = CategoryRepository::insert(conn, "Engineering", 1.0, 0)?;
                CategoryRepository::set_plan(conn, employee_id, category, 2025, 3, 40.0)?;
                for (day, hours) in [(3, 16.0), (17, 12.0)] {
                    let id = TaskLogRepository::insert(
                        conn,
                        &NewTaskLog {
                            employee_id,
                            work_date: NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
                            description: "Payments API work".into(),
                            hours,
                        },
                    )?;
                    TaskLogRepository::write_classification(
                        conn,
                        id,
                        &ClassificationResult::new("Engineering", 0.95, json!(null)),
                    )?;
                }
                Ok(category)
            })
            .expect("seed month")
    }

    fn add_openai(&self, base_url: String) {
        self.state
            .router()
            .register_credential(NewCredential {
                provider: ProviderKind::OpenAiCompatible,
                label: "scorer".into(),
                secret: Some("sk-scorer".into()),
                priority: 1,
                daily_quota: None,
                model: None,
                endpoint: Some(base_url),
                api_version: None,
            })
            .expect("register credential");
    }

    fn seed_scored(&self, employee_id: i64, month: u32, score: f64) {
        let weights = ScoringWeights::default();
        let mut evaluation = MonthlyEvaluation::new(employee_id, 2025, month, false).unwrap();
        evaluation.set_hr_score(score, None, Utc::now(), &weights).unwrap();
        evaluation
            .set_supervisor_score(score, None, Utc::now(), &weights)
            .unwrap();
        self.state.store().upsert_evaluation(&evaluation).unwrap();
    }

    fn actions(&self) -> Vec<AuditAction> {
        self.sink.actions.lock().expect("sink lock").clone()
    }
}

#[tokio::test]
async fn three_lanes_combine_and_await_the_supervisor() {
    let server = MockServer::start_async().await;
    let h = harness(false);
    let category = h.seed_engineering_month(7);
    let content = format!(r#"{{"{category}": {{"score": 75, "confidence": 0.9}}}}"#);
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_contains("Engineering");
            then.status(200)
                .json_body(json!({"choices": [{"message": {"content": content}}]}));
        })
        .await;
    h.add_openai(server.base_url());

    let built = h
        .state
        .scoring()
        .build_evaluation(7, 2025, 3, false)
        .await
        .expect("build evaluation");
    assert_eq!(built.rule_based_score, Some(70.0));
    assert_eq!(built.llm_based_score, Some(75.0));
    assert_eq!(built.breakdown.len(), 1);
    assert_eq!(built.breakdown[0].llm_confidence, Some(0.9));

    let scored = h
        .state
        .scoring()
        .set_hr_score(7, 2025, 3, 80.0, Some("Delivered the payments API".into()), Some(1))
        .expect("hr score");
    let final_score = scored.final_score.expect("final score");
    assert!((final_score - 75.71).abs() < 1e-9);

    let status = h.state.scoring().score_status(7, 2025, 3).unwrap();
    assert!(!status.ready_to_finalize);
    assert_eq!(status.missing, vec!["supervisor_score"]);

    // Rebuilding keeps the human lane.
    let rebuilt = h
        .state
        .scoring()
        .build_evaluation(7, 2025, 3, false)
        .await
        .unwrap();
    assert_eq!(rebuilt.hr_score, Some(80.0));
    assert_eq!(rebuilt.id, built.id);

    assert_eq!(
        h.actions(),
        vec![
            AuditAction::EvaluationBuilt,
            AuditAction::HrScoreSet,
            AuditAction::EvaluationBuilt
        ]
    );
}

#[tokio::test]
async fn lane_written_during_a_rebuild_survives_it() {
    let server = MockServer::start_async().await;
    let h = harness(false);
    let category = h.seed_engineering_month(7);
    let content = format!(r#"{{"{category}": {{"score": 75, "confidence": 0.9}}}}"#);
    let _slow = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .delay(StdDuration::from_millis(800))
                .json_body(json!({"choices": [{"message": {"content": content}}]}));
        })
        .await;
    h.add_openai(server.base_url());
    h.state
        .store()
        .upsert_evaluation(&MonthlyEvaluation::new(7, 2025, 3, false).unwrap())
        .unwrap();

    let scoring = h.state.scoring();
    let (rebuilt, hr) = tokio::join!(scoring.build_evaluation(7, 2025, 3, false), async {
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        scoring.set_hr_score(7, 2025, 3, 80.0, None, Some(1))
    });

    assert_eq!(hr.expect("hr score").hr_score, Some(80.0));
    let rebuilt = rebuilt.expect("rebuild");
    assert_eq!(rebuilt.hr_score, Some(80.0));
    assert_eq!(rebuilt.llm_based_score, Some(75.0));

    let stored = scoring.get_evaluation(7, 2025, 3).unwrap().unwrap();
    assert_eq!(stored.hr_score, Some(80.0));
    assert_eq!(stored.rule_based_score, Some(70.0));
    assert!((stored.final_score.unwrap() - 75.71).abs() < 1e-9);
}

#[tokio::test]
async fn unreachable_providers_leave_the_llm_lane_empty() {
    let h = harness(false);
    h.seed_engineering_month(7);

    let built = h
        .state
        .scoring()
        .build_evaluation(7, 2025, 3, false)
        .await
        .unwrap();

    assert_eq!(built.rule_based_score, Some(70.0));
    assert_eq!(built.llm_based_score, None);
    assert_eq!(built.final_score, Some(70.0));
}

#[tokio::test]
async fn manager_rollup_uses_subordinate_final_scores_and_trend() {
    let h = harness(false);
    for (employee_id, score) in [(10, 90.0), (11, 70.0), (12, 50.0)] {
        h.seed_scored(employee_id, 3, score);
    }

    let weights = ScoringWeights::default();
    let mut february = MonthlyEvaluation::new(1, 2025, 2, true).unwrap();
    february.set_team_member_scores(&[60.0]).unwrap();
    february.recalculate_final_score(&weights);
    h.state.store().upsert_evaluation(&february).unwrap();

    h.state
        .scoring()
        .build_evaluation(1, 2025, 3, true)
        .await
        .unwrap();
    let manager = h
        .state
        .scoring()
        .refresh_team_scores(1, 2025, 3, &[10, 11, 12, 13], None)
        .expect("team refresh");

    assert_eq!(manager.team_member_count, Some(3));
    assert_eq!(manager.team_member_min_score, Some(50.0));
    assert_eq!(manager.team_member_max_score, Some(90.0));
    assert_eq!(manager.team_member_avg_score, Some(70.0));
    assert_eq!(manager.manager_supervision_effectiveness, Some(60.0));
    // (70 * 0.5 + 60 * 0.2) / 0.7
    assert_eq!(manager.manager_kpi_score, Some(67.14));
    assert!(manager.final_score.is_some());
    assert!(h.actions().contains(&AuditAction::TeamScoresRefreshed));
}

#[tokio::test]
async fn team_refresh_rejects_non_managers() {
    let h = harness(false);
    h.state
        .scoring()
        .build_evaluation(20, 2025, 3, false)
        .await
        .unwrap();
    let result = h.state.scoring().refresh_team_scores(20, 2025, 3, &[21], None);
    assert!(matches!(result, Err(AppError::Validation { .. })));
}

#[tokio::test]
async fn lifecycle_runs_from_draft_to_published() {
    let h = harness(false);
    let scoring = h.state.scoring();
    scoring.build_evaluation(7, 2025, 3, false).await.unwrap();

    assert!(matches!(
        scoring.publish(7, 2025, 3, Some(99)),
        Err(AppError::InvalidTransition { .. })
    ));

    scoring.submit_for_review(7, 2025, 3, Some(1)).unwrap();
    assert!(matches!(
        scoring.approve(7, 2025, 3, Some(2)),
        Err(AppError::Validation { .. })
    ));

    scoring.set_hr_score(7, 2025, 3, 82.0, None, Some(3)).unwrap();
    scoring
        .set_supervisor_score(7, 2025, 3, 88.0, Some("Strong quarter".into()), Some(4))
        .unwrap();
    let approved = scoring.approve(7, 2025, 3, Some(2)).unwrap();
    assert_eq!(approved.status, EvaluationStatus::Approved);
    assert!(approved.finalized_at.is_some());

    let published = scoring.publish(7, 2025, 3, Some(2)).unwrap();
    assert_eq!(published.status, EvaluationStatus::Published);
    assert!(published.published_at.is_some());

    assert!(matches!(
        scoring.set_hr_score(7, 2025, 3, 10.0, None, Some(3)),
        Err(AppError::Conflict { .. })
    ));
    let stored = scoring.get_evaluation(7, 2025, 3).unwrap().unwrap();
    assert_eq!(stored.hr_score, Some(82.0));
    assert_eq!(stored.supervisor_remarks.as_deref(), Some("Strong quarter"));
}

#[test]
fn scoring_a_missing_evaluation_is_not_found() {
    let h = harness(false);
    assert!(matches!(
        h.state.scoring().set_hr_score(5, 2025, 3, 70.0, None, None),
        Err(AppError::NotFound)
    ));
}

#[tokio::test]
async fn failing_audit_sink_does_not_fail_scoring() {
    let h = harness(true);
    let built = h
        .state
        .scoring()
        .build_evaluation(7, 2025, 3, false)
        .await
        .expect("build despite audit failure");
    let scored = h
        .state
        .scoring()
        .set_hr_score(7, 2025, 3, 90.0, None, Some(1))
        .expect("hr despite audit failure");

    assert_eq!(built.employee_id, 7);
    assert_eq!(scored.hr_score, Some(90.0));
    assert_eq!(h.actions().len(), 2);
}
