use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::Json;
use futures::stream::{self, BoxStream, StreamExt};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;

use crate::api::AppState;
use crate::scans::coordinator::StartOptions;
use crate::scans::error::ScanError;
use crate::scans::{is_valid_subject_id, SubjectContext};

type ApiError = (StatusCode, Json<Value>);

fn scan_error(e: ScanError) -> ApiError {
    let status = match &e {
        ScanError::InvalidSubject(_) => StatusCode::BAD_REQUEST,
        ScanError::AlreadyRunning(_) => StatusCode::CONFLICT,
        ScanError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
}

pub(crate) async fn list_scans(State(state): State<AppState>) -> Json<Value> {
    let runs = state.store.list_runs().await;

    let summaries: Vec<Value> = runs
        .iter()
        .map(|r| {
            let run_state = r.state();
            json!({
                "subject": r.subject,
                "phase": r.phase,
                "status": r.status,
                "running": state.coordinator.is_running(&r.subject),
                "completed_tasks": run_state.completed_tasks.len(),
                "failed_tasks": run_state.failed_tasks.len(),
                "last_error": r.last_error,
                "started_at": r.started_at,
                "updated_at": r.updated_at,
                "completed_at": r.completed_at,
            })
        })
        .collect();

    Json(json!({
        "scans": summaries,
        "active": state.coordinator.active_runs(),
    }))
}

pub(crate) async fn get_scan(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !is_valid_subject_id(&subject) {
        return Err(scan_error(ScanError::InvalidSubject(subject)));
    }
    let record = state.store.get_record(&subject).await.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "scan not found" })),
        )
    })?;

    let roster: Vec<&str> = state.coordinator.roster().names().collect();
    let policy = state.coordinator.policy();
    Ok(Json(json!({
        "subject": record.subject,
        "running": state.coordinator.is_running(&subject),
        "state": record.state(),
        "tasks": record.tasks,
        "started_at": record.started_at,
        "updated_at": record.updated_at,
        "completed_at": record.completed_at,
        "roster": roster,
        "required_tasks": policy.required(roster.len()),
    })))
}

#[derive(Deserialize)]
pub(crate) struct StartScanRequest {
    url: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    force_reset: bool,
}

pub(crate) async fn start_scan(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    Json(body): Json<StartScanRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let url = body.url.trim();
    if url.is_empty() {
        return Err(bad_request("url is required"));
    }
    if let Err(e) = reqwest::Url::parse(url) {
        return Err(bad_request(format!("invalid url: {e}")));
    }

    let context = SubjectContext {
        url: url.to_string(),
        label: body.label.filter(|l| !l.trim().is_empty()),
    };
    let options = StartOptions {
        force_reset: body.force_reset,
    };
    let handle = state
        .coordinator
        .start(&subject, context, options)
        .map_err(scan_error)?;

    tracing::info!(subject = %subject, run_id = %handle.run_id, force_reset = options.force_reset, "Scan requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": handle.run_id, "subject": handle.subject })),
    ))
}

pub(crate) async fn reset_checkpoints(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .coordinator
        .reset(&subject)
        .await
        .map_err(scan_error)?;
    tracing::info!(subject = %subject, "Checkpoints reset");
    Ok(Json(json!({ "status": "reset", "subject": subject })))
}

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

/// Live progress of the subject's current run. With no run in flight the
/// stream sends one `idle` event carrying the stored state and closes.
pub(crate) async fn stream_scan(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Sse<KeepAliveStream<EventStream>> {
    // Subscribe before the check so a run that is live here is seen whole.
    let live = state.coordinator.channel().subscribe(&subject);

    let stream: EventStream = if state.coordinator.is_running(&subject) {
        live.into_stream()
            .map(|event| {
                let sse_event_name = event.kind.as_sse_event();
                let data = serde_json::to_string(&event).unwrap_or_default();
                Ok(Event::default().event(sse_event_name).data(data))
            })
            .boxed()
    } else {
        let record = state.store.get_record(&subject).await;
        let data = json!({
            "subject": subject,
            "running": false,
            "state": record.map(|r| r.state()),
        });
        let idle = Event::default().event("idle").data(data.to_string());
        stream::once(async move { Ok(idle) }).boxed()
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::testing::{CountingIndexer, CrawlBehavior, FakeCrawler};
    use crate::experts::testing::{Behavior, FakeExpert};
    use crate::experts::Roster;
    use crate::scans::checkpoints::CheckpointStore;
    use crate::scans::coordinator::{RunCoordinator, ScanSettings};
    use crate::scans::file_checkpoints::FileCheckpointStore;
    use crate::scans::progress::ProgressChannel;
    use crate::scans::Phase;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    async fn app_state(behavior: Behavior) -> (TempDir, AppState) {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path().to_path_buf()));
        store.load_all().await.unwrap();
        let coordinator = Arc::new(RunCoordinator::new(
            Roster::new(vec![Arc::new(FakeExpert::new(
                "tech",
                Phase::ParallelAnalysis,
                behavior,
            ))])
            .unwrap(),
            Arc::new(FakeCrawler::new(CrawlBehavior::Pages(1))),
            Arc::new(CountingIndexer::default()),
            store.clone(),
            ProgressChannel::new(64),
            &ScanSettings::default(),
        ));
        (dir, AppState { store, coordinator })
    }

    fn request(url: &str) -> Json<StartScanRequest> {
        Json(StartScanRequest {
            url: url.to_string(),
            label: None,
            force_reset: false,
        })
    }

    #[tokio::test]
    async fn test_start_returns_accepted_then_conflict() {
        let (_dir, state) = app_state(Behavior::Sleep(Duration::from_millis(200))).await;

        let (status, Json(body)) = start_scan(
            State(state.clone()),
            Path("acme".into()),
            request("https://acme.test"),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["run_id"].as_str().is_some());

        let (status, _) = start_scan(
            State(state.clone()),
            Path("acme".into()),
            request("https://acme.test"),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = reset_checkpoints(State(state), Path("acme".into()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_start_rejects_empty_and_invalid_url() {
        let (_dir, state) = app_state(Behavior::Succeed).await;

        let (status, _) = start_scan(State(state.clone()), Path("acme".into()), request("  "))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = start_scan(State(state), Path("acme".into()), request("not a url"))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_subject() {
        let (_dir, state) = app_state(Behavior::Succeed).await;
        let (status, _) = start_scan(
            State(state),
            Path("a..b/c".into()),
            request("https://acme.test"),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_unknown_scan_is_not_found() {
        let (_dir, state) = app_state(Behavior::Succeed).await;
        let (status, _) = get_scan(State(state), Path("nobody".into()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_and_list_after_run() {
        let (_dir, state) = app_state(Behavior::Succeed).await;
        state
            .coordinator
            .run("acme", SubjectContext::new("https://acme.test"), StartOptions::default())
            .await
            .unwrap();

        let Json(body) = get_scan(State(state.clone()), Path("acme".into()))
            .await
            .unwrap();
        assert_eq!(body["running"], false);
        assert_eq!(body["state"]["status"], "completed");
        assert_eq!(body["state"]["completed_tasks"][0], "tech");
        assert_eq!(body["required_tasks"], 1);

        let Json(list) = list_scans(State(state)).await;
        assert_eq!(list["scans"][0]["subject"], "acme");
        assert_eq!(list["scans"][0]["completed_tasks"], 1);
    }

    async fn sse_body(state: AppState, subject: &str) -> String {
        use axum::response::IntoResponse;
        let response = stream_scan(State(state), Path(subject.into()))
            .await
            .into_response();
        let bytes = tokio::time::timeout(
            Duration::from_secs(2),
            axum::body::to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("stream should close")
        .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_live_without_run_sends_idle_and_closes() {
        let (_dir, state) = app_state(Behavior::Succeed).await;
        state
            .coordinator
            .run("acme", SubjectContext::new("https://acme.test"), StartOptions::default())
            .await
            .unwrap();

        let body = sse_body(state.clone(), "acme").await;
        assert!(body.contains("event: idle"));
        assert!(body.contains("\"completed_tasks\":[\"tech\"]"));

        let body = sse_body(state, "nobody").await;
        assert!(body.contains("event: idle"));
        assert!(body.contains("\"state\":null"));
    }

    #[tokio::test]
    async fn test_live_during_run_streams_until_completed() {
        let (_dir, state) = app_state(Behavior::Sleep(Duration::from_millis(50))).await;
        let handle = state
            .coordinator
            .start("acme", SubjectContext::new("https://acme.test"), StartOptions::default())
            .unwrap();

        let body = sse_body(state, "acme").await;
        handle.wait().await;
        assert!(body.contains("event: progress"));
        assert!(body.trim_end().contains("event: completed"));
        assert!(!body.contains("event: idle"));
    }

    #[tokio::test]
    async fn test_reset_clears_record_state() {
        let (_dir, state) = app_state(Behavior::Succeed).await;
        state
            .coordinator
            .run("acme", SubjectContext::new("https://acme.test"), StartOptions::default())
            .await
            .unwrap();

        reset_checkpoints(State(state.clone()), Path("acme".into()))
            .await
            .unwrap();
        assert!(state.store.get_state("acme").await.completed_tasks.is_empty());
    }
}
