//! HTTP launcher tests against a mock launch service.

use hydromaas_id::{JobId, ResourceId};
use hydromaas_scheduler::{
    jobs::{Job, JobKind},
    launcher::{HttpLauncher, Launcher},
    resources::{AllocationParadigm, ResourceAllocation},
};
use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn job() -> Job {
    let mut job = Job::new(
        JobId::new(),
        JobKind::Basic,
        2,
        1_000,
        AllocationParadigm::SingleNode,
    );
    job.set_allocations(Some(vec![ResourceAllocation::new(
        ResourceId::parse("node-1").unwrap(),
        "node-1.local",
        2,
        1_000,
        chrono::Utc::now(),
    )]));
    job.set_worker_handles(vec![json!({"worker": "w-0"})]);
    job
}

#[tokio::test]
async fn test_start_job_posts_job_and_reads_outcome() {
    let server = MockServer::start().await;
    let job = job();

    Mock::given(method("POST"))
        .and(path("/v1/launches"))
        .and(body_partial_json(json!({"job_id": job.job_id().to_string()})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "handles": [{"worker": "w-0"}, {"worker": "w-1"}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let launcher = HttpLauncher::new(format!("{}/", server.uri())).unwrap();
    let outcome = launcher.start_job(&job).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.handles.len(), 2);
}

#[tokio::test]
async fn test_start_job_reports_refusal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/launches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": false})))
        .mount(&server)
        .await;

    let launcher = HttpLauncher::new(server.uri()).unwrap();
    let outcome = launcher.start_job(&job()).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.handles.is_empty());
}

#[tokio::test]
async fn test_start_job_error_status_is_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/launches"))
        .respond_with(ResponseTemplate::new(503).set_body_string("no capacity"))
        .mount(&server)
        .await;

    let launcher = HttpLauncher::new(server.uri()).unwrap();
    let err = launcher.start_job(&job()).await.unwrap_err();
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn test_stop_job_sends_worker_handles() {
    let server = MockServer::start().await;
    let job = job();

    Mock::given(method("POST"))
        .and(path(format!("/v1/launches/{}/stop", job.job_id())))
        .and(body_partial_json(json!({"worker_handles": [{"worker": "w-0"}]})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let launcher = HttpLauncher::new(server.uri()).unwrap();
    launcher.stop_job(&job).await.unwrap();
}

#[tokio::test]
async fn test_stop_job_error_status_is_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let launcher = HttpLauncher::new(server.uri()).unwrap();
    assert!(launcher.stop_job(&job()).await.is_err());
}
