mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;

use vnc_agent::agent::{AgentError, MouseButton, RunPhase};
use vnc_agent::coords::PixelPoint;
use vnc_agent::credentials::{CredentialStore, Credentials, EnvironmentStore, NetrcStore};
use vnc_agent::safety::{Decision, RiskLevel};
use vnc_agent::store::{FileSessionStore, MemorySessionStore, SessionStore};
use vnc_agent::{AgentService, ExecuteRequest, ResumeRequest};

struct Harness {
    service: AgentService,
    connector: FakeConnector,
    store: Arc<MemorySessionStore>,
}

fn harness(planner: ScriptedPlanner) -> Harness {
    let connector = FakeConnector::new(FakeDisplay::new(1000, 1000));
    let store = Arc::new(MemorySessionStore::new());
    let credentials = Arc::new(EnvironmentStore::new(
        Some("desk.local::5901".into()),
        Some("s3cret".into()),
    ));
    let service = AgentService::new(
        Arc::new(connector.clone()),
        credentials,
        Arc::new(planner),
        store.clone(),
    )
    .with_config(test_config());
    Harness {
        service,
        connector,
        store,
    }
}

fn gated_click() -> ScriptedPlanner {
    ScriptedPlanner::new(vec![gated(
        vec![click(500, 500)],
        RiskLevel::RequireConfirmation,
        "Sends an email",
    )])
}

#[tokio::test]
async fn completed_run_reports_steps_and_leaves_nothing_parked() {
    let h = harness(ScriptedPlanner::new(vec![proposal(vec![click(1, 1), click(2, 2)])]));

    let summary = h
        .service
        .execute(ExecuteRequest::new("desk", "click twice"))
        .await
        .unwrap();

    assert!(summary.success);
    assert_eq!(summary.status, RunPhase::Completed);
    assert_eq!(summary.steps_taken, 2);
    assert_eq!(summary.error, None);
    assert_eq!(
        h.connector.connections(),
        vec![("desk.local::5901".to_string(), Some("s3cret".to_string()))]
    );
    assert_eq!(h.connector.display.closed(), 1);
    assert!(h.store.list().await.unwrap().is_empty());
    assert!(h.service.active().await.is_empty());
}

#[tokio::test]
async fn gated_run_parks_then_resumes_on_approval() {
    let h = harness(gated_click());

    let parked = h
        .service
        .execute(ExecuteRequest::new("desk", "send the draft"))
        .await
        .unwrap();
    assert!(!parked.success);
    assert_eq!(parked.status, RunPhase::AwaitingApproval);
    assert_eq!(parked.approval_reason.as_deref(), Some("Sends an email"));
    assert_eq!(parked.steps_taken, 0);
    assert!(h.connector.display.calls().is_empty());

    let stored = h.store.load(&parked.run_id).await.unwrap().unwrap();
    assert!(stored.is_suspended());
    assert_eq!(stored.pending_actions.len(), 1);
    assert_eq!(h.service.pending().await.unwrap().len(), 1);

    let done = h
        .service
        .resume(ResumeRequest {
            run_id: parked.run_id.clone(),
            decision: Decision::Approve,
        })
        .await
        .unwrap();

    assert!(done.success);
    assert_eq!(done.steps_taken, 1);
    assert_eq!(
        h.connector.display.calls(),
        vec![Call::Click(PixelPoint { x: 500, y: 500 }, MouseButton::Left)]
    );
    // reconnected through the credential store for the resume
    assert_eq!(h.connector.connections().len(), 2);
    assert!(h.store.load(&parked.run_id).await.unwrap().is_none());
}

#[tokio::test]
async fn denial_on_resume_executes_nothing() {
    let h = harness(gated_click());
    let parked = h
        .service
        .execute(ExecuteRequest::new("desk", "send the draft"))
        .await
        .unwrap();

    let done = h
        .service
        .resume(ResumeRequest {
            run_id: parked.run_id.clone(),
            decision: Decision::Deny,
        })
        .await
        .unwrap();

    assert_eq!(done.status, RunPhase::Denied);
    assert_eq!(done.error.as_deref(), Some("denied: Sends an email"));
    assert!(h.connector.display.calls().is_empty());
    assert_eq!(h.connector.connections().len(), 1, "denial needs no connection");
    assert!(h.store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn second_resume_is_invalid_state() {
    let h = harness(gated_click());
    let parked = h
        .service
        .execute(ExecuteRequest::new("desk", "t"))
        .await
        .unwrap();
    let req = ResumeRequest {
        run_id: parked.run_id.clone(),
        decision: Decision::Approve,
    };
    h.service.resume(req.clone()).await.unwrap();

    let err = h.service.resume(req).await.unwrap_err();
    assert!(matches!(err, AgentError::InvalidState(_)), "{err}");

    let err = h
        .service
        .resume(ResumeRequest {
            run_id: "no_such_run".into(),
            decision: Decision::Deny,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::InvalidState(_)));
}

#[tokio::test]
async fn hitl_disabled_auto_approves() {
    let h = harness(gated_click());
    let mut req = ExecuteRequest::new("desk", "send the draft");
    req.hitl_enabled = false;

    let summary = h.service.execute(req).await.unwrap();

    assert_eq!(summary.status, RunPhase::Completed);
    assert_eq!(h.connector.display.calls().len(), 1);
}

#[tokio::test]
async fn cancelling_a_parked_run_denies_it() {
    let h = harness(gated_click());
    let parked = h
        .service
        .execute(ExecuteRequest::new("desk", "t"))
        .await
        .unwrap();

    let summary = h.service.cancel(&parked.run_id).await.unwrap().unwrap();

    assert_eq!(summary.status, RunPhase::Denied);
    assert_eq!(summary.error.as_deref(), Some("cancelled while awaiting approval"));
    assert!(h.store.list().await.unwrap().is_empty());
    assert!(matches!(
        h.service.cancel(&parked.run_id).await,
        Err(AgentError::InvalidState(_))
    ));
}

#[tokio::test]
async fn request_limits_override_service_defaults() {
    let h = harness(ScriptedPlanner::new(vec![proposal(vec![
        click(1, 1),
        click(2, 2),
        click(3, 3),
    ])]));
    let mut req = ExecuteRequest::new("desk", "t");
    req.step_limit = Some(1);

    let summary = h.service.execute(req).await.unwrap();

    assert_eq!(summary.status, RunPhase::BudgetExceeded);
    assert_eq!(summary.steps_taken, 1);
    assert_eq!(h.connector.display.calls().len(), 1);
}

#[tokio::test]
async fn unknown_handle_fails_before_connecting() {
    let connector = FakeConnector::new(FakeDisplay::new(10, 10));
    let dir = tempfile::TempDir::new().unwrap();
    let service = AgentService::new(
        Arc::new(connector.clone()),
        Arc::new(NetrcStore::new(dir.path().join("creds"))),
        Arc::new(ScriptedPlanner::new(vec![])),
        Arc::new(MemorySessionStore::new()),
    );

    let err = service
        .execute(ExecuteRequest::new("ghost", "t"))
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::CredentialNotFound(ref h) if h == "ghost"));
    assert!(connector.connections().is_empty());
}

#[tokio::test]
async fn unreachable_display_is_a_connection_error() {
    let connector = FakeConnector::new(FakeDisplay::new(10, 10)).refusing();
    let service = AgentService::new(
        Arc::new(connector),
        Arc::new(EnvironmentStore::new(Some("nowhere:0".into()), None)),
        Arc::new(ScriptedPlanner::new(vec![])),
        Arc::new(MemorySessionStore::new()),
    );

    let err = service
        .execute(ExecuteRequest::new("any", "t"))
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Connection(_)), "{err}");
}

#[tokio::test]
async fn parked_run_survives_a_new_service_instance() {
    let dir = tempfile::TempDir::new().unwrap();
    let creds_path = dir.path().join("creds");
    let netrc = NetrcStore::new(&creds_path);
    netrc
        .set(
            "desk",
            &Credentials {
                address: "desk.local::5901".into(),
                password: None,
            },
        )
        .await
        .unwrap();

    let connector = FakeConnector::new(FakeDisplay::new(1000, 1000));
    let build = |planner: ScriptedPlanner| {
        AgentService::new(
            Arc::new(connector.clone()),
            Arc::new(NetrcStore::new(&creds_path)),
            Arc::new(planner),
            Arc::new(FileSessionStore::new(dir.path().join("sessions"))),
        )
        .with_config(test_config())
    };

    let parked = build(gated_click())
        .execute(ExecuteRequest::new("desk", "send"))
        .await
        .unwrap();
    assert_eq!(parked.status, RunPhase::AwaitingApproval);

    // a fresh process: new service, new planner, same files on disk
    let done = build(ScriptedPlanner::new(vec![]))
        .resume(ResumeRequest {
            run_id: parked.run_id,
            decision: Decision::Approve,
        })
        .await
        .unwrap();

    assert_eq!(done.status, RunPhase::Completed);
    assert_eq!(done.steps_taken, 1);
    assert_eq!(connector.display.calls().len(), 1);
}
