//! Automation runner abstractions.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::Config;
use crate::models::{JobState, NodeId, OperationKind};

/// The final line of the log of a successful job.
pub const LOG_DONE: &str = "Done.";
/// The final line of the log of a failed job.
pub const LOG_FAILED: &str = "Failed!";

/// The host an operation runs against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunnerTarget {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub group_name: String,
    pub dc: String,
}

/// A request to run one kind of operation against one host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerRequest {
    pub kind: OperationKind,
    pub target: RunnerTarget,
    pub vars: BTreeMap<String, String>,
    pub roles: Vec<String>,
}

/// The status of a runner job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerStatus {
    pub state: JobState,
    pub detail: String,
}

/// An opaque executor of node-lifecycle operations.
///
/// Every call is a single round trip, nothing waits for a job to finish.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Start a job, returning its id.
    async fn run(&self, request: &RunnerRequest) -> Result<String>;
    /// Fetch the status of a job.
    async fn status(&self, job_id: &str) -> Result<RunnerStatus>;
    /// Signal a job to stop.
    async fn cancel(&self, job_id: &str) -> Result<()>;
}

struct JobEntry {
    status: RunnerStatus,
    cancel: Option<oneshot::Sender<()>>,
}

/// A runner which executes `ansible-playbook` locally, one child process per job.
///
/// Each job gets its own directory holding a generated inventory & playbook. Job output is kept
/// in memory and becomes the job's status detail once the process exits.
pub struct AnsibleRunner {
    bin: String,
    work_dir: PathBuf,
    ssh_port: u16,
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
}

#[derive(Serialize)]
struct Play<'a> {
    hosts: &'a str,
    vars: &'a BTreeMap<String, String>,
    roles: &'a [String],
}

impl AnsibleRunner {
    pub fn new(config: &Config) -> Self {
        Self {
            bin: config.ansible_playbook_bin.clone(),
            work_dir: PathBuf::from(&config.ansible_work_dir),
            ssh_port: config.ansible_ssh_port,
            jobs: Default::default(),
        }
    }

    /// Render the INI inventory of a request.
    pub fn render_inventory(&self, target: &RunnerTarget) -> String {
        format!(
            "[nodes]\n{} group_name={} node_id={} dc={} ansible_ssh_port={}\n",
            target.host, target.group_name, target.node_id, target.dc, self.ssh_port
        )
    }

    /// Render the YAML playbook of a request.
    pub fn render_playbook(request: &RunnerRequest) -> Result<String> {
        let plays = [Play { hosts: "all", vars: &request.vars, roles: &request.roles }];
        serde_yaml::to_string(&plays).context("error rendering ansible playbook")
    }

    fn set_status(jobs: &Mutex<HashMap<String, JobEntry>>, job_id: &str, status: RunnerStatus) {
        if let Ok(mut jobs) = jobs.lock() {
            if let Some(entry) = jobs.get_mut(job_id) {
                entry.status = status;
                entry.cancel = None;
            }
        }
    }
}

#[async_trait]
impl Runner for AnsibleRunner {
    #[tracing::instrument(level = "debug", skip(self, request), fields(kind = %request.kind, node = request.target.node_id))]
    async fn run(&self, request: &RunnerRequest) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let dir = self.work_dir.join(&job_id);
        tokio::fs::create_dir_all(&dir).await.context("error creating ansible job dir")?;
        let (inventory, playbook) = (dir.join("inventory.ini"), dir.join("playbook.yml"));
        tokio::fs::write(&inventory, self.render_inventory(&request.target))
            .await
            .context("error writing ansible inventory")?;
        tokio::fs::write(&playbook, Self::render_playbook(request)?)
            .await
            .context("error writing ansible playbook")?;

        let mut extra_vars = request.vars.clone();
        extra_vars.insert("node_port".into(), request.target.port.to_string());
        let mut child = Command::new(&self.bin)
            .arg(&playbook)
            .arg("-i")
            .arg(&inventory)
            .arg("--tags")
            .arg(request.kind.ansible_tag())
            .arg("--extra-vars")
            .arg(serde_json::to_string(&extra_vars)?)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("error spawning {}", self.bin))?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.jobs
            .lock()
            .map_err(|_| anyhow!("ansible job table poisoned"))?
            .insert(job_id.clone(), JobEntry {
                status: RunnerStatus { state: JobState::Running, detail: String::new() },
                cancel: Some(cancel_tx),
            });

        let (jobs, id) = (self.jobs.clone(), job_id.clone());
        let output = read_output(child.stdout.take(), child.stderr.take());
        tokio::spawn(async move {
            let (exit, mut log) = tokio::select! {
                (res, log) = async { tokio::join!(child.wait(), output) } => (res.map(|status| status.success()).unwrap_or(false), log),
                _ = &mut cancel_rx => {
                    let _ = child.start_kill();
                    (false, String::from("cancelled"))
                }
            };
            let state = if exit { JobState::Succeeded } else { JobState::Failed };
            log.push('\n');
            log.push_str(if exit { LOG_DONE } else { LOG_FAILED });
            tracing::debug!(job = %id, ?state, "ansible job finished");
            Self::set_status(&jobs, &id, RunnerStatus { state, detail: log });
        });
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<RunnerStatus> {
        let jobs = self.jobs.lock().map_err(|_| anyhow!("ansible job table poisoned"))?;
        match jobs.get(job_id) {
            Some(entry) => Ok(entry.status.clone()),
            None => bail!("unknown ansible job {}", job_id),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        let cancel = {
            let mut jobs = self.jobs.lock().map_err(|_| anyhow!("ansible job table poisoned"))?;
            jobs.get_mut(job_id).and_then(|entry| entry.cancel.take())
        };
        if let Some(tx) = cancel {
            let _ = tx.send(());
        }
        Ok(())
    }
}

/// Drain both pipes of a child at once, so neither can fill up while the other is read.
///
/// The log is stdout followed by stderr.
pub(super) async fn read_output(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> String {
    let read_out = async move {
        let mut buf = String::new();
        if let Some(mut out) = stdout {
            let _ = out.read_to_string(&mut buf).await;
        }
        buf
    };
    let read_err = async move {
        let mut buf = String::new();
        if let Some(mut err) = stderr {
            let _ = err.read_to_string(&mut buf).await;
        }
        buf
    };
    let (mut log, err) = tokio::join!(read_out, read_err);
    log.push_str(&err);
    log
}
