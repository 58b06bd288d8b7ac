use std::path::PathBuf;
use std::sync::Arc;

use pyrelay_core::config::RelayConfig;
use pyrelay_core::hash::job_id;
use pyrelay_core::machine::JobUpdate;
use pyrelay_core::wire::{
    AnalyzeAccepted, AnalyzeRequest, ChatRequest, CompareRequest, CompareResponse,
    ConnectRequest, ConnectResponse, DisconnectRequest, DisconnectResponse, ExecuteAccepted,
    ExecuteRequest, HealthResponse,
};
use pyrelay_core::{
    now_rfc3339, ChatMessage, ExecutionResult, Job, JobId, JobKind, JobOutput, JobStatus, Role,
    Trigger,
};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::chat;
use crate::error::ServeError;
use crate::exec::ScriptRunner;
use crate::history::ConversationStore;
use crate::jobs::JobStore;
use crate::llm::{ByteStream, ChatReply, LlmBackend, LlmError, OllamaBackend};
use crate::monitors::{self, DetectedFile, MonitorInfo, MonitorRegistry};
use crate::pool::WorkerPool;
use crate::prompt::Prompt;
use crate::safety;

/// Everything needed to queue one analysis.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub code: String,
    pub user_id: String,
    pub filename: Option<String>,
    pub trigger: Trigger,
    pub parent_id: Option<JobId>,
    /// Runtime-analysis context, rendered into the prompt.
    pub context: Option<Value>,
}

/// Counts removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub jobs: usize,
    pub turns: usize,
    pub monitors: usize,
}

/// Answer to a chat request.
pub enum ChatResponse {
    Json(Value),
    Stream(ByteStream),
}

/// The relay: job store, chat history, client monitors, worker pool and
/// the collaborators they use. Tests build isolated instances.
pub struct RelayService {
    config: RelayConfig,
    jobs: JobStore,
    conversations: ConversationStore,
    monitors: MonitorRegistry,
    pool: WorkerPool,
    llm: Arc<dyn LlmBackend>,
    runner: ScriptRunner,
}

impl RelayService {
    pub fn new(config: RelayConfig, llm: Arc<dyn LlmBackend>) -> anyhow::Result<Arc<Self>> {
        let runner = ScriptRunner::new(config.exec.clone())?;
        Ok(Arc::new(Self {
            jobs: JobStore::new(),
            conversations: ConversationStore::new(config.history_max_turns),
            monitors: MonitorRegistry::new(),
            pool: WorkerPool::new(config.max_workers),
            llm,
            runner,
            config,
        }))
    }

    /// Service backed by the Ollama daemon named in `config.llm`.
    pub fn from_config(config: RelayConfig) -> anyhow::Result<Arc<Self>> {
        let llm = Arc::new(OllamaBackend::new(&config.llm)?);
        Self::new(config, llm)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn monitors(&self) -> &MonitorRegistry {
        &self.monitors
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn health(&self) -> HealthResponse {
        let counts = self.jobs.counts();
        HealthResponse {
            status: "healthy".into(),
            timestamp: now_rfc3339(),
            queued_jobs: counts.queued,
            running_jobs: counts.running,
            vscode_monitors: self.monitors.len(),
            auto_analyses: counts.analyses,
            conversations: self.conversations.len(),
            workers_in_flight: self.pool.in_flight(),
        }
    }

    // ── Jobs ──

    pub fn job(&self, id: &str) -> Result<Job, ServeError> {
        self.jobs
            .get(id)
            .ok_or_else(|| ServeError::NotFound(format!("job not found: {id}")))
    }

    pub fn submit_analysis(
        self: &Arc<Self>,
        req: AnalyzeRequest,
    ) -> Result<AnalyzeAccepted, ServeError> {
        require("code", &req.code)?;
        require("user_id", &req.user_id)?;
        self.monitors.touch(&req.user_id, OffsetDateTime::now_utc());
        let id = self.enqueue_analysis(AnalysisRequest {
            code: req.code,
            user_id: req.user_id,
            filename: req.filename,
            trigger: req.trigger,
            parent_id: None,
            context: None,
        });
        Ok(AnalyzeAccepted {
            status_url: format!("/api/vscode/auto_status/{id}"),
            message: "analysis queued".into(),
            analysis_id: id,
        })
    }

    /// Insert a queued analyze job and hand it to the pool.
    pub fn enqueue_analysis(self: &Arc<Self>, req: AnalysisRequest) -> JobId {
        let now = OffsetDateTime::now_utc();
        // Runtime analyses of one script differ only by their context.
        let minted = match &req.context {
            Some(context) => job_id(JobKind::Analyze, &format!("{}\n{context}", req.code), now),
            None => job_id(JobKind::Analyze, &req.code, now),
        };
        let mut job = Job::new(minted, JobKind::Analyze, &req.user_id, &req.code, now);
        job.filename = req.filename.clone();
        job.trigger = req.trigger;
        job.parent_id = req.parent_id.clone();
        let id = self.jobs.insert(job);

        let prompt = Prompt::for_trigger(req.trigger, &req.code, req.filename.as_deref(), req.context);
        tracing::info!(job_id = %id, user_id = %req.user_id, trigger = %req.trigger, "analysis queued");
        let service = Arc::clone(self);
        let worker_id = id.clone();
        self.pool
            .spawn_job(async move { service.run_analysis(worker_id, prompt).await });
        id
    }

    async fn run_analysis(self: Arc<Self>, id: JobId, prompt: Prompt) {
        if !self.start(&id) {
            return;
        }
        let generated = tokio::time::timeout(self.config.llm.timeout(), self.llm.generate(&prompt.render()))
            .await
            .unwrap_or(Err(LlmError::TimedOut));
        match generated {
            Ok(analysis) => {
                tracing::info!(job_id = %id, prompt = prompt.name(), "analysis completed");
                self.finish(
                    &id,
                    JobStatus::Completed,
                    JobUpdate::with_result(JobOutput::Analysis { analysis }),
                );
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "analysis failed");
                self.finish(&id, JobStatus::Failed, JobUpdate::with_error(e.to_string()));
            }
        }
    }

    /// Screen `code`, record the job, and run it unless screening failed.
    /// A rejected job is `failed` before this returns.
    pub fn submit_execute(
        self: &Arc<Self>,
        req: ExecuteRequest,
    ) -> Result<ExecuteAccepted, ServeError> {
        require("code", &req.code)?;
        require("user_id", &req.user_id)?;
        self.monitors.touch(&req.user_id, OffsetDateTime::now_utc());
        let report = safety::screen(&req.code);

        let now = OffsetDateTime::now_utc();
        let mut job = Job::new(
            job_id(JobKind::Execute, &req.code, now),
            JobKind::Execute,
            &req.user_id,
            &req.code,
            now,
        );
        job.filename = req.filename;
        job.trigger = Trigger::Run;
        job.parent_id = req.analysis_id;
        job.static_analysis = Some(report.clone());
        let id = self.jobs.insert(job);

        if let Some(summary) = report.violation_summary() {
            tracing::warn!(job_id = %id, user_id = %req.user_id, "{summary}");
            self.jobs
                .transition(&id, JobStatus::Queued, JobStatus::Failed, Some(JobUpdate::with_error(summary)))?;
        } else {
            tracing::info!(job_id = %id, user_id = %req.user_id, lines = report.line_count, "execution queued");
            let service = Arc::clone(self);
            let worker_id = id.clone();
            let code = req.code;
            self.pool
                .spawn_job(async move { service.run_execution(worker_id, code).await });
        }

        Ok(ExecuteAccepted {
            status_url: format!("/api/code/result/{id}"),
            execution_id: id,
            static_analysis: report,
        })
    }

    async fn run_execution(self: Arc<Self>, id: JobId, code: String) {
        if !self.start(&id) {
            return;
        }
        let Some(job) = self.jobs.get(&id) else {
            return;
        };

        let service = Arc::clone(&self);
        let exec_id = id.clone();
        let on_notable = move |line: &str, recent: Vec<String>| {
            let context = json!({
                "line": line,
                "recent_output": recent,
                "execution_id": exec_id,
            });
            let runtime_id = service.enqueue_analysis(AnalysisRequest {
                code: job.code.clone(),
                user_id: job.user_id.clone(),
                filename: job.filename.clone(),
                trigger: Trigger::Runtime,
                parent_id: Some(exec_id.clone()),
                context: Some(context),
            });
            tracing::debug!(job_id = %exec_id, runtime_job = %runtime_id, "notable output line");
        };

        match self.runner.run(&code, self.pool.cancel_token(), on_notable).await {
            Ok(result) if result.success => {
                tracing::info!(job_id = %id, duration_ms = result.duration_ms, "execution completed");
                self.finish(
                    &id,
                    JobStatus::Completed,
                    JobUpdate::with_result(JobOutput::Execution(result)),
                );
            }
            Ok(result) => {
                let error = failure_message(&result, self.runner.timeout().as_secs());
                tracing::info!(job_id = %id, "{error}");
                self.finish(
                    &id,
                    JobStatus::Failed,
                    JobUpdate {
                        result: Some(JobOutput::Execution(result)),
                        error: Some(error),
                    },
                );
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "execution failed");
                self.finish(&id, JobStatus::Failed, JobUpdate::with_error(format!("{e:#}")));
            }
        }
    }

    /// queued → running. False when the job vanished or already moved on.
    fn start(&self, id: &str) -> bool {
        match self.jobs.transition(id, JobStatus::Queued, JobStatus::Running, None) {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(job_id = %id, "job no longer queued; skipping");
                false
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "cannot start job");
                false
            }
        }
    }

    fn finish(&self, id: &str, to: JobStatus, update: JobUpdate) {
        match self.jobs.transition(id, JobStatus::Running, to, Some(update)) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(job_id = %id, "job swept or replaced before finishing"),
            Err(e) => tracing::warn!(job_id = %id, error = %e, "cannot finish job"),
        }
    }

    // ── Compare ──

    pub async fn compare(&self, req: CompareRequest) -> Result<CompareResponse, ServeError> {
        require("code_a", &req.code_a)?;
        require("code_b", &req.code_b)?;
        let prompt = Prompt::Comparison {
            code_a: req.code_a,
            code_b: req.code_b,
        };
        let comparison = tokio::time::timeout(self.config.llm.timeout(), self.llm.generate(&prompt.render()))
            .await
            .unwrap_or(Err(LlmError::TimedOut))?;
        Ok(CompareResponse { comparison })
    }

    // ── Monitors ──

    pub fn connect(self: &Arc<Self>, req: ConnectRequest) -> Result<ConnectResponse, ServeError> {
        require("user_id", &req.user_id)?;
        let project_path = req
            .project_path
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let watch_root = project_path
            .as_ref()
            .filter(|p| req.auto_upload && p.is_dir())
            .cloned();

        let cancel = self.pool.cancel_token().child_token();
        let info = MonitorInfo {
            user_id: req.user_id.clone(),
            project_path: project_path.clone(),
            auto_upload: req.auto_upload,
            watching: watch_root.is_some(),
        };
        self.monitors
            .register(info, cancel.clone(), OffsetDateTime::now_utc());

        let message = match &watch_root {
            Some(root) => {
                let service = Arc::clone(self);
                let user_id = req.user_id.clone();
                let submit = move |file: DetectedFile| {
                    service.enqueue_analysis(AnalysisRequest {
                        code: file.code,
                        user_id: user_id.clone(),
                        filename: Some(file.filename),
                        trigger: file.trigger,
                        parent_id: None,
                        context: None,
                    });
                };
                let watch = monitors::watch_project(
                    root.clone(),
                    self.config.watch.clone(),
                    cancel.clone(),
                    submit,
                );
                self.pool.spawn_background(async move {
                    watch.await;
                    // Marks the registration as ended for the sweeper.
                    cancel.cancel();
                });
                format!("connected; watching {}", root.display())
            }
            None if req.auto_upload && project_path.is_some() => {
                "connected; project path is not a directory, auto upload disabled".to_string()
            }
            None => "connected".to_string(),
        };
        tracing::info!(user_id = %req.user_id, "{message}");
        Ok(ConnectResponse {
            status: "connected".into(),
            message,
        })
    }

    pub fn disconnect(&self, req: DisconnectRequest) -> Result<DisconnectResponse, ServeError> {
        require("user_id", &req.user_id)?;
        let path = req
            .project_path
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let stopped = self.monitors.remove(&req.user_id, path.as_deref());
        tracing::info!(user_id = %req.user_id, stopped, "client disconnected");
        Ok(DisconnectResponse {
            status: "disconnected".into(),
            stopped,
        })
    }

    // ── Chat ──

    pub async fn chat(self: &Arc<Self>, req: ChatRequest) -> Result<ChatResponse, ServeError> {
        require("user_id", &req.user_id)?;
        if req.messages.is_empty() {
            return Err(ServeError::Validation("messages must not be empty".into()));
        }
        let new_turns = req.messages;
        let mut outgoing = new_turns.clone();
        chat::apply_format_instruction(&mut outgoing);
        let mut forwarded = self.conversations.history(&req.user_id);
        forwarded.extend(outgoing);

        match self
            .llm
            .chat(&forwarded, req.stream, req.model.as_deref())
            .await?
        {
            ChatReply::Complete(value) => {
                let reply = chat::reply_text(&value).unwrap_or_default().to_string();
                self.record_chat(&req.user_id, new_turns, reply);
                Ok(ChatResponse::Json(value))
            }
            ChatReply::Stream(upstream) => {
                let service = Arc::clone(self);
                let user_id = req.user_id;
                let tee = chat::tee_stream(upstream, move |reply| {
                    service.record_chat(&user_id, new_turns, reply);
                });
                Ok(ChatResponse::Stream(Box::pin(tee)))
            }
        }
    }

    fn record_chat(&self, user_id: &str, mut turns: Vec<ChatMessage>, reply: String) {
        if !reply.is_empty() {
            turns.push(ChatMessage::new(Role::Assistant, reply));
        }
        self.conversations
            .append(user_id, &turns, OffsetDateTime::now_utc());
    }

    // ── Housekeeping ──

    pub fn sweep(&self, now: OffsetDateTime) -> SweepStats {
        SweepStats {
            jobs: self.jobs.sweep(now, self.config.job_retention()),
            turns: self.conversations.sweep(now, self.config.history_ttl()),
            monitors: self.monitors.sweep(now, self.config.monitor_idle()),
        }
    }

    /// Run [`RelayService::sweep`] every `sweep_interval` until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let cancel = self.pool.cancel_token();
        self.pool.spawn_background(async move {
            let mut ticker = tokio::time::interval(service.config.sweep_interval());
            // The first tick fires immediately; nothing to sweep yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = service.sweep(OffsetDateTime::now_utc());
                        if stats != SweepStats::default() {
                            tracing::info!(
                                jobs = stats.jobs,
                                turns = stats.turns,
                                monitors = stats.monitors,
                                "sweep removed expired records"
                            );
                        }
                    }
                }
            }
        });
    }

    /// Stop watchers and the sweeper, kill running scripts, and wait for
    /// workers to exit.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

fn require(field: &str, value: &str) -> Result<(), ServeError> {
    if value.trim().is_empty() {
        return Err(ServeError::Validation(format!("{field} is required")));
    }
    Ok(())
}

fn failure_message(result: &ExecutionResult, timeout_secs: u64) -> String {
    if result.timed_out {
        format!("execution timed out after {timeout_secs}s")
    } else {
        match result.exit_code {
            Some(code) => format!("process exited with code {code}"),
            None => "process terminated by signal".to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exec::tests::python_available;
    use crate::llm::MockBackend;
    use pyrelay_core::config::{ExecConfig, WatchConfig};
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tokio_stream::StreamExt;

    pub(crate) fn test_config(scratch: &Path) -> RelayConfig {
        RelayConfig {
            exec: ExecConfig {
                scratch_dir: Some(scratch.to_path_buf()),
                timeout_secs: 10,
                ..ExecConfig::default()
            },
            watch: WatchConfig {
                interval_ms: 20,
                ..WatchConfig::default()
            },
            ..RelayConfig::default()
        }
    }

    pub(crate) async fn wait_terminal(service: &RelayService, id: &str) -> Job {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let job = service.job(id).unwrap();
            if job.status.is_terminal() || Instant::now() > deadline {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn analyze(code: &str, trigger: Trigger) -> AnalyzeRequest {
        AnalyzeRequest {
            code: code.into(),
            user_id: "t1".into(),
            filename: Some("main.py".into()),
            trigger,
        }
    }

    fn execute(code: &str) -> ExecuteRequest {
        ExecuteRequest {
            code: code.into(),
            user_id: "t1".into(),
            filename: Some("main.py".into()),
            analysis_id: None,
        }
    }

    #[tokio::test]
    async fn analysis_completes_with_llm_text() {
        let tmp = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockBackend::new());
        llm.push_reply(Ok("explained".into()));
        let service = RelayService::new(test_config(tmp.path()), llm.clone()).unwrap();

        let accepted = service.submit_analysis(analyze("x = 1", Trigger::Save)).unwrap();
        assert!(accepted.analysis_id.starts_with("ana_"));
        assert_eq!(
            accepted.status_url,
            format!("/api/vscode/auto_status/{}", accepted.analysis_id)
        );

        let job = wait_terminal(&service, &accepted.analysis_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap().as_analysis(), Some("explained"));
        assert!(job.started_at.is_some() && job.finished_at.is_some());
        assert!(llm.prompts()[0].contains("x = 1"));
    }

    #[tokio::test]
    async fn analysis_failure_is_captured() {
        let tmp = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockBackend::new());
        llm.push_reply(Err(LlmError::Status {
            status: 500,
            body: "model not loaded".into(),
        }));
        let service = RelayService::new(test_config(tmp.path()), llm).unwrap();
        let id = service
            .submit_analysis(analyze("x = 1", Trigger::Manual))
            .unwrap()
            .analysis_id;
        let job = wait_terminal(&service, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("model not loaded"));
    }

    #[tokio::test]
    async fn slow_llm_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.llm.timeout_secs = 1;
        let llm = Arc::new(MockBackend::new().with_delay(Duration::from_secs(5)));
        let service = RelayService::new(config, llm).unwrap();
        let id = service
            .submit_analysis(analyze("x = 1", Trigger::Manual))
            .unwrap()
            .analysis_id;
        let job = wait_terminal(&service, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_fields_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let service = RelayService::new(test_config(tmp.path()), Arc::new(MockBackend::new())).unwrap();
        let err = service.submit_analysis(analyze("", Trigger::Manual)).unwrap_err();
        assert!(matches!(err, ServeError::Validation(_)));
        let mut req = execute("print(1)");
        req.user_id.clear();
        assert!(matches!(
            service.submit_execute(req).unwrap_err(),
            ServeError::Validation(_)
        ));
        assert!(service.jobs().is_empty());
    }

    #[tokio::test]
    async fn unsafe_code_fails_without_running() {
        let tmp = tempfile::tempdir().unwrap();
        let service = RelayService::new(test_config(tmp.path()), Arc::new(MockBackend::new())).unwrap();
        let accepted = service
            .submit_execute(execute("import os\nos.system('echo hi')\n"))
            .unwrap();
        assert!(!accepted.static_analysis.safe);

        // Already terminal when submit returns.
        let job = service.job(&accepted.execution_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("`os`"));
        assert!(job.result.is_none());
        assert!(job.started_at.is_none());
        assert_eq!(service.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn execute_prints_and_spawns_runtime_analysis() {
        if !python_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockBackend::new());
        let service = RelayService::new(test_config(tmp.path()), llm.clone()).unwrap();
        let accepted = service
            .submit_execute(execute("print(1+1)\nprint('done')\n"))
            .unwrap();
        assert!(accepted.static_analysis.safe);

        let job = wait_terminal(&service, &accepted.execution_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result.unwrap();
        let exec = result.as_execution().unwrap();
        assert!(exec.success);
        assert_eq!(exec.stdout, "2\ndone");
        assert_eq!(exec.exit_code, Some(0));

        // The `done` line queued a runtime analysis tied to the execution.
        let deadline = Instant::now() + Duration::from_secs(5);
        while llm.prompts().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("\"line\": \"done\""));
        assert!(prompt.contains(&accepted.execution_id));
    }

    #[tokio::test]
    async fn failing_script_keeps_output() {
        if !python_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let service = RelayService::new(test_config(tmp.path()), Arc::new(MockBackend::new())).unwrap();
        let id = service
            .submit_execute(execute("print('before')\nraise ValueError('bad')\n"))
            .unwrap()
            .execution_id;
        let job = wait_terminal(&service, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("process exited with code 1"));
        let result = job.result.unwrap();
        let exec = result.as_execution().unwrap();
        assert_eq!(exec.stdout, "before");
        assert!(exec.stderr.contains("ValueError"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_timeout_marks_job_timed_out() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.exec.interpreter = "sh".into();
        config.exec.args.clear();
        config.exec.timeout_secs = 1;
        let service = RelayService::new(config, Arc::new(MockBackend::new())).unwrap();
        let id = service
            .submit_execute(execute("exec sleep 30\n"))
            .unwrap()
            .execution_id;
        let job = wait_terminal(&service, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result.unwrap().as_execution().unwrap().timed_out);
        assert!(job.error.unwrap().contains("timed out"));
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn compare_uses_comparison_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockBackend::new());
        llm.push_reply(Ok("B is faster".into()));
        let service = RelayService::new(test_config(tmp.path()), llm.clone()).unwrap();
        let resp = service
            .compare(CompareRequest {
                code_a: "a = [x for x in range(3)]".into(),
                code_b: "b = list(range(3))".into(),
            })
            .await
            .unwrap();
        assert_eq!(resp.comparison, "B is faster");
        assert!(llm.prompts()[0].contains("Snippet B"));
    }

    #[tokio::test]
    async fn chat_records_user_turn_and_reply() {
        let tmp = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockBackend::new());
        llm.push_reply(Ok("first answer".into()));
        llm.push_reply(Ok("second answer".into()));
        let service = RelayService::new(test_config(tmp.path()), llm.clone()).unwrap();

        let req = |text: &str| ChatRequest {
            user_id: "t1".into(),
            messages: vec![ChatMessage::new(Role::User, text)],
            stream: false,
            model: None,
        };
        let ChatResponse::Json(value) = service.chat(req("hello")).await.unwrap() else {
            panic!("expected JSON reply");
        };
        assert_eq!(value["message"]["content"], "first answer");
        service.chat(req("again")).await.unwrap();

        let history = service.conversations().history("t1");
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hello", "first answer", "again", "second answer"]);

        // Second call forwarded the history plus the instructed new message.
        let forwarded = &llm.chats()[1];
        assert_eq!(forwarded.len(), 3);
        assert_eq!(forwarded[0].content, "hello");
        assert!(forwarded[2].content.ends_with(chat::FORMAT_INSTRUCTION));
    }

    #[tokio::test]
    async fn streamed_chat_records_after_stream_ends() {
        let tmp = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockBackend::new());
        llm.push_reply(Ok("streamed reply".into()));
        let service = RelayService::new(test_config(tmp.path()), llm).unwrap();
        let resp = service
            .chat(ChatRequest {
                user_id: "t1".into(),
                messages: vec![ChatMessage::new(Role::User, "hi")],
                stream: true,
                model: None,
            })
            .await
            .unwrap();
        let ChatResponse::Stream(mut stream) = resp else {
            panic!("expected stream");
        };
        assert!(service.conversations().history("t1").is_empty());
        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
        }
        let history = service.conversations().history("t1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "streamed reply");
    }

    #[tokio::test]
    async fn chat_errors_are_typed() {
        let tmp = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockBackend::new());
        llm.push_reply(Err(LlmError::Unreachable("refused".into())));
        let service = RelayService::new(test_config(tmp.path()), llm).unwrap();
        let err = service
            .chat(ChatRequest {
                user_id: "t1".into(),
                messages: vec![ChatMessage::new(Role::User, "hi")],
                stream: false,
                model: None,
            })
            .await
            .err()
            .unwrap();
        assert_eq!(err.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
        assert!(service.conversations().is_empty());
    }

    #[tokio::test]
    async fn connect_with_auto_upload_watches_project() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockBackend::new());
        let service = RelayService::new(test_config(tmp.path()), llm).unwrap();

        let resp = service
            .connect(ConnectRequest {
                user_id: "t1".into(),
                project_path: Some(project.path().display().to_string()),
                auto_upload: true,
            })
            .unwrap();
        assert!(resp.message.contains("watching"));
        assert_eq!(service.health().vscode_monitors, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(project.path().join("new.tmp"), "print('x')\n").unwrap();
        std::fs::rename(project.path().join("new.tmp"), project.path().join("new.py")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while service.health().auto_analyses == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(service.health().auto_analyses, 1);

        let resp = service
            .disconnect(DisconnectRequest {
                user_id: "t1".into(),
                project_path: None,
            })
            .unwrap();
        assert_eq!(resp.stopped, 1);
        assert_eq!(service.health().vscode_monitors, 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_expires_jobs_and_turns() {
        let tmp = tempfile::tempdir().unwrap();
        let service = RelayService::new(test_config(tmp.path()), Arc::new(MockBackend::new())).unwrap();
        let id = service
            .submit_analysis(analyze("x = 1", Trigger::Manual))
            .unwrap()
            .analysis_id;
        wait_terminal(&service, &id).await;
        service.conversations().append(
            "t1",
            &[ChatMessage::new(Role::User, "hi")],
            OffsetDateTime::now_utc(),
        );

        let later = OffsetDateTime::now_utc() + Duration::from_secs(25 * 3600);
        let stats = service.sweep(later);
        assert_eq!(
            stats,
            SweepStats {
                jobs: 1,
                turns: 1,
                monitors: 0
            }
        );
        assert!(matches!(service.job(&id), Err(ServeError::NotFound(_))));
        assert!(service.conversations().is_empty());
    }

    #[tokio::test]
    async fn back_to_back_runtime_analyses_keep_separate_records() {
        let tmp = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockBackend::new());
        let service = RelayService::new(test_config(tmp.path()), llm).unwrap();
        let runtime = |line: &str| AnalysisRequest {
            code: "print('Error a')\nprint('Error b')\n".into(),
            user_id: "t1".into(),
            filename: Some("main.py".into()),
            trigger: Trigger::Runtime,
            parent_id: Some("exec_1_00000000".into()),
            context: Some(json!({ "line": line })),
        };

        let ids = [
            service.enqueue_analysis(runtime("Error a")),
            service.enqueue_analysis(runtime("Error b")),
            service.enqueue_analysis(runtime("Error b")),
        ];
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], ids[2]);
        for id in &ids {
            let job = wait_terminal(&service, id).await;
            assert_eq!(&job.id, id);
            assert_eq!(job.status, JobStatus::Completed);
        }
        assert_eq!(service.jobs().counts().analyses, 3);
    }

    #[tokio::test]
    async fn undecodable_output_still_completes_with_output() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.exec.interpreter = "sh".into();
        let service = RelayService::new(config, Arc::new(MockBackend::new())).unwrap();
        let accepted = service
            .submit_execute(execute("printf 'first\\n\\377\\nlast\\n'\n"))
            .unwrap();
        assert!(accepted.static_analysis.safe);

        let job = wait_terminal(&service, &accepted.execution_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result.as_ref().and_then(JobOutput::as_execution).unwrap();
        assert_eq!(result.stdout, "first\n\u{FFFD}\nlast");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn sweep_prunes_clients_that_never_disconnect() {
        let tmp = tempfile::tempdir().unwrap();
        let service = RelayService::new(test_config(tmp.path()), Arc::new(MockBackend::new())).unwrap();
        let project = tmp.path().join("project");
        std::fs::create_dir(&project).unwrap();
        for user in ["crashed", "busy"] {
            service
                .connect(ConnectRequest {
                    user_id: user.into(),
                    project_path: Some(project.display().to_string()),
                    auto_upload: false,
                })
                .unwrap();
        }
        assert_eq!(service.monitors().len(), 2);

        let later = OffsetDateTime::now_utc() + service.config().monitor_idle();
        service.monitors().touch("busy", later);
        let stats = service.sweep(later + Duration::from_secs(1));
        assert_eq!(stats.monitors, 1);
        let left = service.monitors().list();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].user_id, "busy");
    }

    #[tokio::test]
    async fn ended_watch_is_pruned_on_sweep() {
        let tmp = tempfile::tempdir().unwrap();
        let service = RelayService::new(test_config(tmp.path()), Arc::new(MockBackend::new())).unwrap();
        let project = tmp.path().join("project");
        std::fs::create_dir(&project).unwrap();
        let resp = service
            .connect(ConnectRequest {
                user_id: "t1".into(),
                project_path: Some(project.display().to_string()),
                auto_upload: true,
            })
            .unwrap();
        assert!(resp.message.contains("watching"));

        std::fs::remove_dir_all(&project).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if service.sweep(OffsetDateTime::now_utc()).monitors == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "watch registration never pruned");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(service.monitors().is_empty());
    }
}
