mod common;

use anyhow::Result;
use common::{security, start_executor, start_executor_with, SECRET};
use dts_config::DispatchConfig;
use dts_mesh::{ClientError, HttpPeerClient, PeerClient, RunRequest};
use dts_types::protocol::{CONTENT_TYPE_SEALED, METRICS_PATH, RUN_PATH, SIGNATURE_HEADER};
use dts_types::{ProjectIdentity, Task};
use serde_json::{json, Map};

fn client() -> HttpPeerClient {
    HttpPeerClient::new(&DispatchConfig::default()).expect("http client")
}

fn task(func: &str, args: Vec<serde_json::Value>) -> Task {
    Task::new(func, args, Map::new(), "sender")
}

fn status_of(err: ClientError) -> u16 {
    match err {
        ClientError::Status { code, .. } => code,
        other => panic!("expected an HTTP status, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sealed_task_executes_and_pins_sender() -> Result<()> {
    let executor = start_executor("exec-host", Some(security("executor", SECRET)), 0.1).await;
    let sender = security("sender", SECRET);
    let peer = executor.peer("executor");

    let sealed = sender.seal_task(&task("counted", vec![json!(7)]))?;
    let response = client().submit(&peer, &RunRequest::Sealed(sealed)).await?;

    assert_eq!(response.host, "exec-host");
    assert_eq!(response.result, json!({"runs": 1, "echo": [7]}));
    assert!(response.elapsed >= 0.0);
    assert_eq!(executor.runs(), 1);

    let known = executor.security.as_ref().unwrap().known_peers();
    assert_eq!(known, vec!["sender".to_string()]);

    executor.api.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_mismatched_signature_header_is_rejected_before_execution() -> Result<()> {
    let executor = start_executor("exec-host", Some(security("executor", SECRET)), 0.1).await;
    let sender = security("sender", SECRET);
    let peer = executor.peer("executor");

    let genuine = sender.seal_task(&task("counted", vec![json!(1)]))?;
    let other = sender.seal_task(&task("counted", vec![json!(2)]))?;
    let spliced = dts_identity::SealedTask {
        body: genuine.body,
        signature_hex: other.signature_hex,
    };

    let err = client().submit(&peer, &RunRequest::Sealed(spliced)).await.unwrap_err();
    assert_eq!(status_of(err), 403);
    assert_eq!(executor.runs(), 0);

    executor.api.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_impersonation_after_pinning_is_rejected() -> Result<()> {
    let executor = start_executor("exec-host", Some(security("executor", SECRET)), 0.1).await;
    let peer = executor.peer("executor");
    let client = client();

    let alice = security("alice", SECRET);
    client
        .submit(&peer, &RunRequest::Sealed(alice.seal_task(&task("counted", vec![]))?))
        .await?;

    // Same node id and shared secret, different signing key.
    let impostor = security("alice", SECRET);
    let err = client
        .submit(&peer, &RunRequest::Sealed(impostor.seal_task(&task("counted", vec![]))?))
        .await
        .unwrap_err();
    assert_eq!(status_of(err), 403);
    assert_eq!(executor.runs(), 1);

    executor.api.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_wrong_secret_and_garbage_are_bad_requests() -> Result<()> {
    let executor = start_executor("exec-host", Some(security("executor", SECRET)), 0.1).await;
    let peer = executor.peer("executor");

    let outsider = security("outsider", "some-other-secret");
    let err = client()
        .submit(&peer, &RunRequest::Sealed(outsider.seal_task(&task("counted", vec![]))?))
        .await
        .unwrap_err();
    assert_eq!(status_of(err), 400);

    let response = reqwest::Client::new()
        .post(executor.url(RUN_PATH))
        .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_SEALED)
        .header(SIGNATURE_HEADER, "00")
        .body(vec![1u8, 2, 3])
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await?;
    assert!(body["error"].is_string());

    assert_eq!(executor.runs(), 0);
    executor.api.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_function_and_task_failure() -> Result<()> {
    let executor = start_executor("exec-host", Some(security("executor", SECRET)), 0.1).await;
    let sender = security("sender", SECRET);
    let peer = executor.peer("executor");
    let client = client();

    let err = client
        .submit(&peer, &RunRequest::Sealed(sender.seal_task(&task("format_disk", vec![]))?))
        .await
        .unwrap_err();
    assert_eq!(status_of(err), 404);

    let err = client
        .submit(
            &peer,
            &RunRequest::Sealed(sender.seal_task(&task("prime_calculation", vec![json!("many")]))?),
        )
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(status_of(err), 500);

    executor.api.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_plaintext_modes() -> Result<()> {
    let client = client();

    let open = start_executor("dev-host", None, 0.1).await;
    let response = client
        .submit(&open.peer("dev"), &RunRequest::Plain(task("prime_calculation", vec![json!(20)])))
        .await?;
    assert_eq!(response.result["count"], json!(8));
    assert_eq!(response.host, "dev-host");
    open.api.shutdown().await;

    let strict = start_executor("strict-host", Some(security("executor", SECRET)), 0.1).await;
    let err = client
        .submit(&strict.peer("strict"), &RunRequest::Plain(task("counted", vec![])))
        .await
        .unwrap_err();
    assert_eq!(status_of(err), 403);
    assert_eq!(strict.runs(), 0);
    strict.api.shutdown().await;

    let lenient = start_executor_with(
        "lenient-host",
        Some(security("executor", SECRET)),
        0.1,
        ProjectIdentity::default(),
        true,
    )
    .await;
    client
        .submit(&lenient.peer("lenient"), &RunRequest::Plain(task("counted", vec![])))
        .await?;
    assert_eq!(lenient.runs(), 1);
    lenient.api.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_probe_endpoints() -> Result<()> {
    let executor = start_executor("exec-host", None, 0.25).await;
    let peer = executor.peer("executor");
    let client = client();

    client.health(&peer).await?;

    let usage = client.cpu_usage(&peer).await?;
    assert!((usage - 25.0).abs() < 1e-9);

    let identity = client.project_info(&peer).await?;
    assert!(ProjectIdentity::default().is_compatible(&identity));
    assert!(identity.features.contains(&"counted".to_string()));
    assert!(identity.features.contains(&"matrix_multiply".to_string()));

    client
        .submit(&peer, &RunRequest::Plain(task("counted", vec![])))
        .await?;
    let metrics = reqwest::get(executor.url(METRICS_PATH)).await?.text().await?;
    assert!(metrics.contains("dts_remote_executions_served_total"));

    let missing = reqwest::get(executor.url("/admin")).await?;
    assert_eq!(missing.status().as_u16(), 404);

    executor.api.shutdown().await;
    Ok(())
}
