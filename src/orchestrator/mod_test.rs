use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use super::*;
use crate::config::Config;
use crate::database::Database;
use crate::error::AppError;
use crate::fixtures::FakeRunner;
use crate::models::OperationKind;

fn request(kind: OperationKind, node_id: NodeId) -> RunnerRequest {
    RunnerRequest {
        kind,
        target: RunnerTarget {
            node_id,
            host: format!("10.0.0.{}", node_id),
            port: 7000,
            group_name: "group".into(),
            dc: "dc".into(),
        },
        vars: BTreeMap::new(),
        roles: vec![],
    }
}

async fn setup(deadline: Duration) -> Result<(Orchestrator, Arc<FakeRunner>, Database, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let runner = Arc::new(FakeRunner::default());
    let orchestrator = Orchestrator::new(&db, runner.clone(), deadline).await?;
    Ok((orchestrator, runner, db, tmpdir))
}

#[tokio::test]
async fn operation_moves_from_pending_to_running_to_succeeded() -> Result<()> {
    let (orchestrator, runner, _db, _tmpdir) = setup(Duration::from_secs(60)).await?;

    let op = orchestrator.submit(vec![request(OperationKind::Provision, 3)]).await?;
    assert_eq!(op.state, OperationState::Pending, "expected new operation to be pending");

    let op = orchestrator.poll(op.id).await?;
    assert_eq!(op.state, OperationState::Running, "expected first poll to observe a running job");
    assert!(op.started_at.is_some(), "expected started_at to be set");

    runner.finish_all(JobState::Succeeded);
    let op = orchestrator.poll(op.id).await?;
    assert_eq!(op.state, OperationState::Succeeded, "expected operation to succeed");
    assert!(op.result.as_deref().unwrap_or_default().contains(LOG_DONE), "expected runner output in result, got {:?}", op.result);

    let next = orchestrator.submit(vec![request(OperationKind::Restart, 3)]).await;
    assert!(next.is_ok(), "expected node 3 to accept a new operation, got {:?}", next.err());
    Ok(())
}

#[tokio::test]
async fn submit_rejects_busy_node() -> Result<()> {
    let (orchestrator, _runner, _db, _tmpdir) = setup(Duration::from_secs(60)).await?;
    let first = orchestrator.submit(vec![request(OperationKind::Provision, 3)]).await?;

    let err = orchestrator
        .submit(vec![request(OperationKind::Restart, 4), request(OperationKind::Restart, 3)])
        .await
        .err()
        .context("expected second submission to fail")?;

    match err.downcast_ref::<AppError>() {
        Some(AppError::NodeBusy { node_id, operation_id }) => {
            assert_eq!(*node_id, 3, "expected node 3 to be reported busy");
            assert_eq!(*operation_id, first.id, "expected the holding operation to be reported");
        }
        other => panic!("expected NodeBusy, got {:?}", other),
    }
    let unrelated = orchestrator.submit(vec![request(OperationKind::Restart, 4)]).await;
    assert!(unrelated.is_ok(), "expected node 4 not to stay reserved, got {:?}", unrelated.err());
    Ok(())
}

#[tokio::test]
async fn submission_error_creates_no_operation() -> Result<()> {
    let (orchestrator, runner, _db, _tmpdir) = setup(Duration::from_secs(60)).await?;
    runner.set_unavailable(true);

    let err = orchestrator
        .submit(vec![request(OperationKind::Provision, 3)])
        .await
        .err()
        .context("expected submission to fail")?;

    assert!(
        matches!(err.downcast_ref::<AppError>(), Some(AppError::SubmissionError(_))),
        "expected SubmissionError, got {:?}",
        err
    );
    assert!(orchestrator.list().await?.is_empty(), "expected no operation to be recorded");
    runner.set_unavailable(false);
    let retry = orchestrator.submit(vec![request(OperationKind::Provision, 3)]).await;
    assert!(retry.is_ok(), "expected reservation to be released, got {:?}", retry.err());
    Ok(())
}

#[tokio::test]
async fn poll_of_terminal_operation_is_idempotent() -> Result<()> {
    let (orchestrator, runner, _db, _tmpdir) = setup(Duration::from_secs(60)).await?;
    let op = orchestrator.submit(vec![request(OperationKind::Deprovision, 5), request(OperationKind::Deprovision, 6)]).await?;
    runner.finish_node(5, JobState::Succeeded);
    runner.finish_node(6, JobState::Failed);

    let first = orchestrator.poll(op.id).await?;
    let second = orchestrator.poll(op.id).await?;

    assert_eq!(first.state, OperationState::Failed, "expected one failed job to fail the operation");
    assert!(first.error.as_deref().unwrap_or_default().contains("node 6"), "expected failing node in error, got {:?}", first.error);
    assert_eq!(first, second, "expected repeated polls to return the same terminal record");
    Ok(())
}

#[tokio::test]
async fn cancel_fails_operation_and_signals_runner() -> Result<()> {
    let (orchestrator, runner, _db, _tmpdir) = setup(Duration::from_secs(60)).await?;
    let op = orchestrator.submit(vec![request(OperationKind::RoleChange, 7)]).await?;
    orchestrator.poll(op.id).await?;

    let cancelled = orchestrator.cancel(op.id).await?;

    assert_eq!(cancelled.state, OperationState::Failed, "expected cancelled operation to be failed");
    assert!(cancelled.cancelled, "expected cancelled flag to be set");
    assert_eq!(cancelled.error.as_deref(), Some(ERR_CANCELLED), "expected the cancellation error");
    assert_eq!(runner.cancelled(), vec![op.jobs[0].job_id.clone()], "expected the runner job to be signalled");
    let again = orchestrator.cancel(op.id).await.err().context("expected second cancel to fail")?;
    assert!(
        matches!(again.downcast_ref::<AppError>(), Some(AppError::InvalidInput(_))),
        "expected InvalidInput for terminal cancel, got {:?}",
        again
    );
    Ok(())
}

#[tokio::test]
async fn poll_past_deadline_times_out() -> Result<()> {
    let (orchestrator, runner, _db, _tmpdir) = setup(Duration::from_millis(0)).await?;
    let op = orchestrator.submit(vec![request(OperationKind::Provision, 8)]).await?;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let op = orchestrator.poll(op.id).await?;

    assert_eq!(op.state, OperationState::TimedOut, "expected operation to time out");
    assert!(op.state.is_failure(), "expected timed out to count as failure");
    assert_eq!(runner.cancelled().len(), 1, "expected the timed out job to be cancelled");
    assert!(orchestrator.active_operations().await.is_empty(), "expected no active operations");
    Ok(())
}

#[tokio::test]
async fn poll_past_deadline_keeps_success_reported_by_runner() -> Result<()> {
    let (orchestrator, runner, _db, _tmpdir) = setup(Duration::from_millis(0)).await?;
    let op = orchestrator.submit(vec![request(OperationKind::Provision, 8)]).await?;
    runner.finish_all(JobState::Succeeded);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let op = orchestrator.poll(op.id).await?;

    assert_eq!(op.state, OperationState::Succeeded, "expected the runner's report to win over the deadline");
    assert!(op.error.is_none(), "expected no error, got {:?}", op.error);
    assert!(runner.cancelled().is_empty(), "expected no job to be cancelled, got {:?}", runner.cancelled());
    Ok(())
}

#[tokio::test]
async fn terminal_operations_are_archived_out_of_memory() -> Result<()> {
    let (orchestrator, runner, _db, _tmpdir) = setup(Duration::from_secs(60)).await?;
    let op = orchestrator.submit(vec![request(OperationKind::Provision, 3)]).await?;
    assert_eq!(orchestrator.inner.state.lock().await.active.len(), 1, "expected the new operation to be held in memory");

    runner.finish_all(JobState::Succeeded);
    let finished = orchestrator.poll(op.id).await?;

    assert!(orchestrator.inner.state.lock().await.active.is_empty(), "expected the finished operation to leave memory");
    assert_eq!(orchestrator.get(op.id).await?, finished, "expected get to read the archived record");
    assert_eq!(orchestrator.poll(op.id).await?, finished, "expected poll to read the archived record");
    let listed = orchestrator.list().await?;
    assert_eq!(listed.len(), 1, "expected the archived operation to be listed");
    assert_eq!(listed[0].state, OperationState::Succeeded, "expected listed operation to be succeeded");
    let err = orchestrator.cancel(op.id).await.err().context("expected cancel of archived operation to fail")?;
    assert!(
        matches!(err.downcast_ref::<AppError>(), Some(AppError::InvalidInput(_))),
        "expected InvalidInput for archived cancel, got {:?}",
        err
    );
    let missing = orchestrator.get(Uuid::new_v4()).await.err().context("expected unknown id to fail")?;
    assert!(
        matches!(missing.downcast_ref::<AppError>(), Some(AppError::ResourceNotFound(_))),
        "expected ResourceNotFound for unknown id, got {:?}",
        missing
    );
    Ok(())
}

#[tokio::test]
async fn active_for_reports_the_holding_operation() -> Result<()> {
    let (orchestrator, runner, _db, _tmpdir) = setup(Duration::from_secs(60)).await?;
    let op = orchestrator.submit(vec![request(OperationKind::Restart, 4)]).await?;

    assert_eq!(orchestrator.active_for(4).await, Some(op.id), "expected node 4 to be held by the restart");
    assert_eq!(orchestrator.active_for(5).await, None, "expected node 5 to be free");

    runner.finish_all(JobState::Succeeded);
    orchestrator.poll(op.id).await?;
    assert_eq!(orchestrator.active_for(4).await, None, "expected node 4 to be released");
    Ok(())
}

#[tokio::test]
async fn recovery_fails_operations_in_flight() -> Result<()> {
    let (orchestrator, _runner, db, _tmpdir) = setup(Duration::from_secs(60)).await?;
    let op = orchestrator.submit(vec![request(OperationKind::Provision, 9)]).await?;

    let recovered = Orchestrator::new(&db, Arc::new(FakeRunner::default()), Duration::from_secs(60)).await?;
    let op = recovered.get(op.id).await?;

    assert_eq!(op.state, OperationState::Failed, "expected in flight operation to be failed");
    assert_eq!(op.error.as_deref(), Some(ERR_RESTARTED), "expected the restart error");
    assert!(recovered.active_operations().await.is_empty(), "expected no active operations after recovery");
    Ok(())
}

#[test]
fn ansible_runner_renders_inventory_and_playbook() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let runner = AnsibleRunner::new(&config);
    let mut req = request(OperationKind::Provision, 3);
    req.vars.insert("data_dir".into(), "/data".into());
    req.roles.push("kv_node".into());

    let inventory = runner.render_inventory(&req.target);
    let playbook = AnsibleRunner::render_playbook(&req)?;

    assert!(
        inventory.contains("10.0.0.3 group_name=group node_id=3 dc=dc ansible_ssh_port=22"),
        "unexpected inventory {}",
        inventory
    );
    let plays: serde_yaml::Value = serde_yaml::from_str(&playbook)?;
    assert_eq!(plays[0]["hosts"].as_str(), Some("all"), "expected play to target all hosts, got {}", playbook);
    assert_eq!(plays[0]["vars"]["data_dir"].as_str(), Some("/data"), "expected vars in play, got {}", playbook);
    assert_eq!(plays[0]["roles"][0].as_str(), Some("kv_node"), "expected roles in play, got {}", playbook);
    Ok(())
}

#[tokio::test]
async fn child_output_is_drained_from_both_pipes_at_once() -> Result<()> {
    // Far more stderr than a pipe buffer holds, written before stdout closes.
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg("yes e | head -c 262144 >&2; echo out")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let output = super::runner::read_output(child.stdout.take(), child.stderr.take());

    let (status, log) = tokio::time::timeout(Duration::from_secs(10), async { tokio::join!(child.wait(), output) })
        .await
        .context("expected the child to exit without blocking on a full pipe")?;

    assert!(status?.success(), "expected the child to exit cleanly");
    assert!(log.starts_with("out\n"), "expected stdout first in the log");
    assert_eq!(log.len(), 4 + 262144, "expected all of stdout and stderr in the log");
    Ok(())
}
