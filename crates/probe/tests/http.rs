mod common;

use std::time::Duration;

use common::{MockServer, probe_single};
use probe::{MemoryReporter, ProbeContext, Status, new_prober};

#[tokio::test]
async fn test_http_status_codes() -> anyhow::Result<()> {
    logger::init_for_tests();
    let server = MockServer::start().await?;

    let ok = probe_single(&server.url("/ok")).await?;
    assert_eq!(ok.status, Status::Healthy);
    assert_eq!(ok.message, "200 OK");
    assert_eq!(ok.extra["status_code"], serde_json::json!(200));
    assert_eq!(ok.extra["length"], serde_json::json!(5));

    let fail = probe_single(&server.url("/fail")).await?;
    assert_eq!(fail.status, Status::Failure);
    assert_eq!(fail.message, "500 Internal Server Error");

    let missing = probe_single(&server.url("/nothing-here")).await?;
    assert_eq!(missing.status, Status::Failure);

    Ok(())
}

#[tokio::test]
async fn test_http_redirects() -> anyhow::Result<()> {
    logger::init_for_tests();
    let server = MockServer::start().await?;

    let followed = probe_single(&server.url("/redirect")).await?;
    assert_eq!(followed.status, Status::Healthy);
    assert_eq!(followed.target.as_str(), server.url("/redirect"));

    let looped = probe_single(&server.url("/loop")).await?;
    assert_eq!(looped.status, Status::Failure);
    assert_eq!(looped.message, "redirect loop detected");

    Ok(())
}

#[tokio::test]
async fn test_http_method_variants() -> anyhow::Result<()> {
    logger::init_for_tests();
    let server = MockServer::start().await?;

    let head = probe_single(&format!("http-head://{}/ok", server.addr)).await?;
    assert_eq!(head.status, Status::Healthy);
    assert_eq!(head.target.scheme(), "http-head");

    assert!(new_prober(&format!("http-delete://{}/ok", server.addr)).await.is_err());
    assert!(new_prober(&format!("http+get://{}/ok", server.addr)).await.is_err());

    Ok(())
}

#[tokio::test]
async fn test_http_outer_deadline() -> anyhow::Result<()> {
    logger::init_for_tests();
    let server = MockServer::start().await?;
    let prober = new_prober(&server.url("/slow")).await?;

    let reporter = MemoryReporter::new();
    prober.probe(&ProbeContext::with_timeout(Duration::from_millis(200)), &reporter).await;

    let records = reporter.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Status::Failure);
    assert_eq!(records[0].message, "probe timed out");

    Ok(())
}

#[tokio::test]
async fn test_http_cancelled() -> anyhow::Result<()> {
    logger::init_for_tests();
    let server = MockServer::start().await?;
    let prober = new_prober(&server.url("/slow")).await?;

    let ctx = ProbeContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let reporter = MemoryReporter::new();
    prober.probe(&ctx, &reporter).await;

    let records = reporter.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Status::Aborted);
    assert_eq!(records[0].message, "probe aborted");

    Ok(())
}
