#![cfg(unix)]

mod common;

use std::fs;

use common::{plugin_dir, probe_once, probe_single};
use probe::{MemoryReporter, ProbeContext, Record, Status, new_prober};
use url::Url;

#[tokio::test]
async fn test_plugin_most_specific_wins() -> anyhow::Result<()> {
    logger::init_for_tests();
    plugin_dir();

    let generic = probe_single("fixture:one").await?;
    assert_eq!(generic.status, Status::Healthy);
    assert_eq!(generic.target.as_str(), "fixture:one");
    assert_eq!(generic.message, "generic");
    assert_eq!(generic.latency_ms(), 1.5);

    let special = probe_single("fixture-special:two").await?;
    assert_eq!(special.status, Status::Degrade);
    assert_eq!(special.message, "special");

    let fallback = probe_single("fixture-other:three").await?;
    assert_eq!(fallback.message, "generic");

    Ok(())
}

#[tokio::test]
async fn test_plugin_not_found() -> anyhow::Result<()> {
    logger::init_for_tests();
    plugin_dir();

    let record = probe_single("nosuchplugin-x:target").await?;
    assert_eq!(record.status, Status::Unknown);
    assert_eq!(record.message, "plugin not found: nosuchplugin-x-probe, nosuchplugin-probe");

    Ok(())
}

#[tokio::test]
async fn test_plugin_invalid_output() -> anyhow::Result<()> {
    logger::init_for_tests();
    plugin_dir();

    let records = probe_once("garbled:target").await?;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, Status::Healthy);
    assert_eq!(records[1].status, Status::Unknown);
    assert_eq!(records[1].message, "the plugin reported invalid records");
    assert_eq!(records[1].extra["raw_message"], serde_json::json!("this is not a record"));

    Ok(())
}

#[tokio::test]
async fn test_plugin_only_invalid_output() -> anyhow::Result<()> {
    logger::init_for_tests();
    plugin_dir();

    let record = probe_single("junk:target").await?;
    assert_eq!(record.status, Status::Unknown);
    assert_eq!(record.target.as_str(), "junk:target");
    assert_eq!(record.message, "the plugin reported invalid records");
    assert_eq!(record.extra["raw_message"], serde_json::json!("no records here"));

    Ok(())
}

#[tokio::test]
async fn test_plugin_latency_out_of_range() -> anyhow::Result<()> {
    logger::init_for_tests();
    plugin_dir();

    let record = probe_single("overflow:target").await?;
    assert_eq!(record.status, Status::Unknown);
    assert_eq!(record.message, "the plugin reported invalid records");
    let raw = record.extra["raw_message"].as_str().unwrap_or_default();
    assert!(raw.contains("1e30"), "{raw}");

    Ok(())
}

#[tokio::test]
async fn test_plugin_exit_status_without_output() -> anyhow::Result<()> {
    logger::init_for_tests();
    plugin_dir();

    let crashed = probe_single("crash:target").await?;
    assert_eq!(crashed.status, Status::Failure);
    assert_eq!(crashed.target.as_str(), "crash:target");
    assert_eq!(crashed.message, "something broke: exit status 3");

    let quiet = probe_single("quiet:target").await?;
    assert_eq!(quiet.status, Status::Healthy);
    assert_eq!(quiet.message, "");

    Ok(())
}

#[tokio::test]
async fn test_plugin_deactivates_vanished_targets() -> anyhow::Result<()> {
    logger::init_for_tests();
    let dir = plugin_dir();
    let listing = dir.join("listing.txt");

    let line = |target: &str| Record::new(Url::parse(target).unwrap(), Status::Healthy).to_string();
    fs::write(&listing, format!("{}\n{}\n", line("listing:a"), line("listing:b")))?;

    let prober = new_prober("listing:all").await?;
    let reporter = MemoryReporter::new();
    let ctx = ProbeContext::new();

    prober.probe(&ctx, &reporter).await;
    assert_eq!(reporter.records().len(), 2);
    assert!(reporter.deactivations().is_empty());

    fs::write(&listing, format!("{}\n", line("listing:a")))?;
    prober.probe(&ctx, &reporter).await;

    let deactivations = reporter.deactivations();
    assert_eq!(deactivations.len(), 1);
    assert_eq!(deactivations[0].0.as_str(), "listing:all");
    assert_eq!(deactivations[0].1, vec![Url::parse("listing:b")?]);

    Ok(())
}
