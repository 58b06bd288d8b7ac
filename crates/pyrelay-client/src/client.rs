use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use pyrelay_core::config::ClientConfig;
use pyrelay_core::wire::{
    AnalyzeAccepted, AnalyzeRequest, ConnectRequest, ConnectResponse, DisconnectRequest,
    DisconnectResponse, ErrorBody, ExecuteAccepted, ExecuteRequest, HealthResponse,
};
use pyrelay_core::{Job, JobId, JobOutput, Trigger};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::poll::{poll_until_terminal, PollOutcome, PollPolicy};

/// Longest output excerpt printed for an execution.
const PREVIEW_CHARS: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot reach relay: {0}")]
    Transport(String),
    #[error("relay returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected response from relay: {0}")]
    Malformed(String),
}

impl From<ureq::Error> for ClientError {
    fn from(err: ureq::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

/// HTTP plumbing shared by the client and its poll threads.
#[derive(Clone)]
struct Relay {
    agent: ureq::Agent,
    base_url: String,
}

impl Relay {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// GET `path`; `Ok(None)` on 404.
    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ClientError> {
        let mut resp = self.agent.get(&self.url(path)).call()?;
        let status = resp.status().as_u16();
        let text = resp.body_mut().read_to_string()?;
        if status == 404 {
            return Ok(None);
        }
        decode(status, &text).map(Some)
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        let payload =
            serde_json::to_string(body).map_err(|e| ClientError::Malformed(e.to_string()))?;
        let mut resp = self
            .agent
            .post(&self.url(path))
            .header("Content-Type", "application/json")
            .send(payload)?;
        let status = resp.status().as_u16();
        let text = resp.body_mut().read_to_string()?;
        decode(status, &text)
    }

    fn job(&self, path: &str) -> Result<Option<Job>, ClientError> {
        self.get(path)
    }
}

fn decode<T: DeserializeOwned>(status: u16, text: &str) -> Result<T, ClientError> {
    if !(200..300).contains(&status) {
        let message = serde_json::from_str::<ErrorBody>(text)
            .map(|b| b.error)
            .unwrap_or_else(|_| excerpt(text, 200));
        return Err(ClientError::Status { status, message });
    }
    serde_json::from_str(text).map_err(|e| {
        ClientError::Malformed(format!("{e}: {}", excerpt(text, 200)))
    })
}

fn excerpt(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Submits files to the relay and reports results on stdout.
///
/// Every operation prints one line describing what happened; failures are
/// reported and turned into `None`/`false`, never propagated.
pub struct DispatchClient {
    relay: Relay,
    user_id: String,
    policy: PollPolicy,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchClient {
    pub fn new(config: &ClientConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.request_timeout_secs.max(1))))
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self {
            relay: Relay {
                agent,
                base_url: config.server_url.trim_end_matches('/').to_string(),
            },
            user_id: config.user_id.clone(),
            policy: PollPolicy::from_config(config),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.relay.base_url
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    // ── Server ──

    pub fn check_health(&self) -> Result<HealthResponse, ClientError> {
        match self.relay.get::<HealthResponse>("/api/health") {
            Ok(Some(health)) => {
                println!("relay reachable: {}", self.server_url());
                println!(
                    "  status: {}  monitors: {}  analyses: {}  queued: {}  running: {}",
                    health.status,
                    health.vscode_monitors,
                    health.auto_analyses,
                    health.queued_jobs,
                    health.running_jobs
                );
                Ok(health)
            }
            Ok(None) => {
                let err = ClientError::Status {
                    status: 404,
                    message: "no health endpoint".into(),
                };
                println!("relay check failed: {err}");
                Err(err)
            }
            Err(e) => {
                println!("relay check failed ({}): {e}", self.server_url());
                Err(e)
            }
        }
    }

    pub fn connect(&self, project_path: Option<&Path>, auto_upload: bool) -> bool {
        let req = ConnectRequest {
            user_id: self.user_id.clone(),
            project_path: project_path.map(|p| p.display().to_string()),
            auto_upload,
        };
        match self.relay.post::<_, ConnectResponse>("/api/vscode/connect", &req) {
            Ok(resp) => {
                println!("connected as {}: {}", self.user_id, resp.message);
                true
            }
            Err(e) => {
                println!("connect failed: {e}");
                false
            }
        }
    }

    pub fn disconnect(&self) -> bool {
        let req = DisconnectRequest {
            user_id: self.user_id.clone(),
            project_path: None,
        };
        match self
            .relay
            .post::<_, DisconnectResponse>("/api/vscode/disconnect", &req)
        {
            Ok(resp) => {
                println!("disconnected ({} monitor(s) stopped)", resp.stopped);
                true
            }
            Err(e) => {
                println!("disconnect failed: {e}");
                false
            }
        }
    }

    // ── Submission ──

    /// Queue an analysis and follow it on a background thread.
    pub fn submit_analysis(&self, content: &str, filename: &str, trigger: Trigger) -> Option<JobId> {
        println!("uploading {filename} for analysis ({trigger})");
        let req = AnalyzeRequest {
            code: content.to_string(),
            user_id: self.user_id.clone(),
            filename: Some(filename.to_string()),
            trigger,
        };
        let accepted: AnalyzeAccepted = match self.relay.post("/api/vscode/auto_analyze", &req) {
            Ok(a) => a,
            Err(e) => {
                println!("  upload failed: {e}");
                return None;
            }
        };
        println!("  queued as {}", accepted.analysis_id);

        let relay = self.relay.clone();
        let policy = self.policy;
        let id = accepted.analysis_id.clone();
        let filename = filename.to_string();
        self.spawn_background(move || {
            let outcome = poll_job(&relay, policy, &analysis_path(&id));
            report_analysis(&id, &filename, &outcome);
        });
        Some(accepted.analysis_id)
    }

    /// Analyze, then execute and wait for the result; returns the execution
    /// job id. Nothing runs if the analysis could not be queued.
    pub fn submit_execute(&self, content: &str, filename: &str) -> Option<JobId> {
        let Some(analysis_id) = self.submit_analysis(content, filename, Trigger::Run) else {
            println!("  not executing {filename}: analysis submission failed");
            return None;
        };
        println!("executing {filename}");
        let req = ExecuteRequest {
            code: content.to_string(),
            user_id: self.user_id.clone(),
            filename: Some(filename.to_string()),
            analysis_id: Some(analysis_id),
        };
        let accepted: ExecuteAccepted = match self.relay.post("/api/code/execute", &req) {
            Ok(a) => a,
            Err(e) => {
                println!("  execute failed: {e}");
                return None;
            }
        };
        println!("  queued as {}", accepted.execution_id);
        if let Some(summary) = accepted.static_analysis.violation_summary() {
            println!("  {summary}");
        }
        let outcome = self.poll_result(&accepted.execution_id);
        report_execution(&accepted.execution_id, filename, &outcome);
        Some(accepted.execution_id)
    }

    /// Read `path` and queue it for analysis.
    pub fn upload_file(&self, path: &Path, trigger: Trigger) -> Option<JobId> {
        let (content, filename) = read_source(path)?;
        self.submit_analysis(&content, &filename, trigger)
    }

    /// Read `path`, analyze and execute it.
    pub fn run_file(&self, path: &Path) -> Option<JobId> {
        let (content, filename) = read_source(path)?;
        self.submit_execute(&content, &filename)
    }

    // ── Polling ──

    pub fn poll_status(&self, id: &str) -> PollOutcome {
        poll_job(&self.relay, self.policy, &analysis_path(id))
    }

    pub fn poll_result(&self, id: &str) -> PollOutcome {
        poll_job(&self.relay, self.policy, &format!("/api/code/result/{id}"))
    }

    /// Run `task` on its own thread, joined by [`DispatchClient::wait_background`].
    pub fn spawn_background<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::spawn(task);
        let mut handles = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Join every outstanding background thread.
    pub fn wait_background(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if handle.join().is_err() {
                    tracing::warn!("background poll thread panicked");
                }
            }
        }
    }
}

fn analysis_path(id: &str) -> String {
    format!("/api/vscode/auto_status/{id}")
}

fn poll_job(relay: &Relay, policy: PollPolicy, path: &str) -> PollOutcome {
    poll_until_terminal(policy, || relay.job(path))
}

fn read_source(path: &Path) -> Option<(String, String)> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            println!("cannot read {}: {e}", path.display());
            return None;
        }
    };
    if path.extension().and_then(|e| e.to_str()) != Some("py") {
        println!("warning: {} is not a .py file; analysis may be poor", path.display());
    }
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Some((String::from_utf8_lossy(&bytes).into_owned(), filename))
}

fn report_analysis(id: &str, filename: &str, outcome: &PollOutcome) {
    match outcome {
        PollOutcome::Completed(job) => {
            println!("\nanalysis complete: {filename}");
            if let Some(text) = job.result.as_ref().and_then(JobOutput::as_analysis) {
                println!("{text}");
            }
        }
        PollOutcome::Failed(job) => println!(
            "\nanalysis failed [{filename}]: {}",
            job.error.as_deref().unwrap_or("unknown error")
        ),
        PollOutcome::TimedOut => println!("\nanalysis timed out: {filename} ({id})"),
        PollOutcome::NotFound => println!("\nanalysis {id} not found or expired"),
    }
}

fn report_execution(id: &str, filename: &str, outcome: &PollOutcome) {
    let execution = outcome
        .job()
        .and_then(|job| job.result.as_ref())
        .and_then(JobOutput::as_execution);
    match outcome {
        PollOutcome::Completed(_) => {
            println!("\nexecution succeeded: {filename}");
            if let Some(r) = execution.filter(|r| !r.stdout.is_empty()) {
                println!("  output:\n{}", excerpt(&r.stdout, PREVIEW_CHARS));
            }
        }
        PollOutcome::Failed(job) => {
            println!("\nexecution failed: {filename}");
            if let Some(error) = &job.error {
                println!("  error: {error}");
            }
            if let Some(r) = execution.filter(|r| !r.stderr.is_empty()) {
                println!("  stderr:\n{}", excerpt(&r.stderr, PREVIEW_CHARS));
            }
        }
        PollOutcome::TimedOut => println!("\ntimed out waiting for execution: {filename} ({id})"),
        PollOutcome::NotFound => println!("\nexecution {id} not found or expired"),
    }
}
