//! Tests to verify job admission and the service lifecycle in both modes.

use std::{sync::Arc, time::Duration};

use hyper::StatusCode;
use pretty_assertions::assert_eq;
use test_log::test;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServiceConfig,
    err::AdmissionErr,
    job::JobValidator,
    lifecycle::{LifecycleState, Service},
    source::{self, http, JobSource},
};

use super::util::{job_json, MockBehavior, MockRuntime, TestServer};

fn validator() -> Arc<JobValidator> {
    Arc::new(JobValidator::new().unwrap())
}

#[test(tokio::test)]
async fn test_admission_overload() {
    let (admission, mut queue) = source::bounded(2, validator());
    let job = job_json("caller", "null");

    admission.submit(job.as_bytes()).unwrap();
    admission.submit(job.as_bytes()).unwrap();
    assert!(matches!(
        admission.submit(job.as_bytes()),
        Err(AdmissionErr::Overloaded)
    ));

    // Taking a job out frees a slot.
    assert!(queue.next_job().await.is_some());
    admission.submit(job.as_bytes()).unwrap();
}

#[test(tokio::test)]
async fn test_admission_validation() {
    let (admission, _queue) = source::bounded(2, validator());
    for body in [
        "not json",
        r#"{"returnUrl": "caller", "dockerImage": "grader"}"#,
        r#"{"returnUrl": "caller", "dockerImage": "grader", "files": {"a.c": "x"}}"#,
        r#"{"returnUrl": "caller", "dockerImage": "grader", "files": {"main.c": ""}}"#,
        r#"{"returnUrl": "caller", "dockerImage": "grader", "files": {"main.c": "x"}, "maxRunTime": 2.5}"#,
        r#"{"returnUrl": "caller", "dockerImage": "grader", "files": {"main.c": "x"}, "extra": 1}"#,
    ] {
        assert!(
            matches!(admission.submit(body.as_bytes()), Err(AdmissionErr::Validation(_))),
            "{} should be rejected",
            body
        );
    }
}

#[test(tokio::test)]
async fn test_admission_after_close() {
    let (admission, mut queue) = source::bounded(2, validator());
    let job = job_json("caller", "1");
    admission.submit(job.as_bytes()).unwrap();

    queue.closer().cancel();
    assert!(queue.next_job().await.is_some());
    assert!(queue.next_job().await.is_none());
    assert!(matches!(
        admission.submit(job.as_bytes()),
        Err(AdmissionErr::Closed)
    ));
}

#[test(tokio::test)]
async fn test_http_status_codes() {
    let (admission, _queue) = source::bounded(1, validator());
    let shutdown = CancellationToken::new();
    let server = http::bind(([127, 0, 0, 1], 0).into(), admission, shutdown.clone()).unwrap();
    let addr = server.local_addr;
    let serving = tokio::spawn(server.serve);

    let client = reqwest::Client::new();
    let url = format!("http://{}/test", addr);
    let job = job_json("caller", "null");

    let res = client.post(&url).body(job.clone()).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let res = client.post(&url).body(job.clone()).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    let res = client.post(&url).body("{}").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let res = client.get(&url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = client
        .post(format!("http://{}/other", addr))
        .body(job)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    shutdown.cancel();
    serving.await.unwrap().unwrap();
}

#[test(tokio::test)]
async fn test_push_service_lifecycle() {
    let mut caller = TestServer::capture();
    let volumes = tempfile::tempdir().unwrap();
    let cfg = ServiceConfig {
        server_host: "127.0.0.1".into(),
        server_port: Some(0),
        volume_root: Some(volumes.path().to_owned()),
        shutdown_grace_secs: 2,
        ..Default::default()
    };
    let runtime = Arc::new(
        MockRuntime::new(MockBehavior::Succeed("ok".into())).writes("students.json", "{}"),
    );
    let shutdown = CancellationToken::new();
    let service = Service::new(&cfg, runtime.clone(), shutdown.clone())
        .unwrap()
        .start()
        .unwrap();
    assert_eq!(service.state(), LifecycleState::Running);
    let addr = service.local_addr.unwrap();

    let res = reqwest::Client::new()
        .post(format!("http://{}/test", addr))
        .body(job_json(&caller.addr.to_string(), r#"{"id": 1}"#))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let envelope = caller.next().await.json();
    assert_eq!(envelope["metaData"]["id"], 1);
    assert_eq!(envelope["result"], "ok");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), service.wait())
        .await
        .unwrap()
        .unwrap();

    assert!(reqwest::Client::new()
        .post(format!("http://{}/test", addr))
        .body(job_json(&caller.addr.to_string(), "null"))
        .send()
        .await
        .is_err());
    assert_eq!(runtime.runs().len(), 1);
}

#[test(tokio::test)]
async fn test_poll_service_idles_out() {
    let mut caller = TestServer::capture();
    let job = job_json(&caller.addr.to_string(), r#""polled""#);
    let mut queue = TestServer::start(
        StatusCode::NOT_FOUND,
        vec![
            (StatusCode::NOT_FOUND, String::new()),
            (StatusCode::INTERNAL_SERVER_ERROR, "try later".into()),
            (StatusCode::OK, r#"{"not": "a job"}"#.into()),
            (StatusCode::OK, job),
        ],
    );

    let volumes = tempfile::tempdir().unwrap();
    let cfg = ServiceConfig {
        mq_read_service_addr: Some(format!("{}/read", queue.addr)),
        poll_interval_ms: 20,
        max_idle_time: 1,
        volume_root: Some(volumes.path().to_owned()),
        ..Default::default()
    };
    let runtime = Arc::new(MockRuntime::new(MockBehavior::Succeed(String::new())));
    let service = Service::new(&cfg, runtime.clone(), CancellationToken::new())
        .unwrap()
        .start()
        .unwrap();
    assert!(service.local_addr.is_none());

    let envelope = caller.next().await.json();
    assert_eq!(envelope["metaData"], "polled");

    tokio::time::timeout(Duration::from_secs(5), service.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(runtime.runs().len(), 1);

    let first = queue.next().await;
    assert_eq!(first.method, hyper::Method::GET);
    assert_eq!(first.path, "/read");
}

#[test(tokio::test)]
async fn test_poll_service_stops_on_shutdown() {
    let queue = TestServer::start(StatusCode::NOT_FOUND, vec![]);
    let volumes = tempfile::tempdir().unwrap();
    let cfg = ServiceConfig {
        mq_read_service_addr: Some(queue.addr.to_string()),
        poll_interval_ms: 50,
        volume_root: Some(volumes.path().to_owned()),
        ..Default::default()
    };
    let shutdown = CancellationToken::new();
    let service = Service::new(
        &cfg,
        Arc::new(MockRuntime::new(MockBehavior::Hang)),
        shutdown.clone(),
    )
    .unwrap()
    .start()
    .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.state(), LifecycleState::Running);
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), service.wait())
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn test_service_requires_job_source() {
    let err = Service::new(
        &ServiceConfig::default(),
        Arc::new(MockRuntime::new(MockBehavior::Hang)),
        CancellationToken::new(),
    )
    .err()
    .unwrap();
    assert!(err.to_string().contains("No job source configured"));
}
