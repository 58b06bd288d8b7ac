use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Job ID format: `ana_<unix-millis>_<hash8>` or `exec_<unix-millis>_<hash8>`
pub type JobId = String;

// ── Job kinds and status ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Analyze,
    Execute,
}

impl JobKind {
    /// Prefix used when minting job IDs.
    pub fn id_prefix(self) -> &'static str {
        match self {
            JobKind::Analyze => "ana",
            JobKind::Execute => "exec",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Why a piece of code was submitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Manual,
    Upload,
    Save,
    Created,
    Modified,
    Run,
    /// Raised by the relay itself while a script is executing.
    Runtime,
    #[serde(other)]
    Other,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Upload => "upload",
            Trigger::Save => "save",
            Trigger::Created => "created",
            Trigger::Modified => "modified",
            Trigger::Run => "run",
            Trigger::Runtime => "runtime",
            Trigger::Other => "other",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Results ──

/// Outcome of running a script in a subprocess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Result payload stored on a finished job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JobOutput {
    Analysis { analysis: String },
    Execution(ExecutionResult),
}

impl JobOutput {
    pub fn as_analysis(&self) -> Option<&str> {
        match self {
            JobOutput::Analysis { analysis } => Some(analysis),
            JobOutput::Execution(_) => None,
        }
    }

    pub fn as_execution(&self) -> Option<&ExecutionResult> {
        match self {
            JobOutput::Execution(r) => Some(r),
            JobOutput::Analysis { .. } => None,
        }
    }
}

// ── Static screening report ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationRule {
    DeniedImport,
    DeniedCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    pub rule: ViolationRule,
    /// Module or function name that tripped the rule.
    pub name: String,
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StaticReport {
    pub safe: bool,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub imports: Vec<String>,
    pub line_count: usize,
}

impl StaticReport {
    /// One-line summary naming every violated rule.
    pub fn violation_summary(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let parts: Vec<&str> = self.violations.iter().map(|v| v.message.as_str()).collect();
        Some(format!("safety check failed: {}", parts.join("; ")))
    }
}

// ── Job record ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub user_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub trigger: Trigger,
    pub code: String,
    /// Analysis preceding an execution, or the execution that spawned a runtime analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_analysis: Option<StaticReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl Job {
    pub fn new(id: JobId, kind: JobKind, user_id: &str, code: &str, now: OffsetDateTime) -> Self {
        Self {
            id,
            kind,
            user_id: user_id.to_string(),
            status: JobStatus::Queued,
            filename: None,
            trigger: Trigger::default(),
            code: code.to_string(),
            parent_id: None,
            static_analysis: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

// ── Chat ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A single stored conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ConversationTurn {
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

/// Current UTC time formatted as RFC 3339.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_trigger_maps_to_other() {
        let t: Trigger = serde_json::from_str("\"on_focus\"").unwrap();
        assert_eq!(t, Trigger::Other);
        let t: Trigger = serde_json::from_str("\"modified\"").unwrap();
        assert_eq!(t, Trigger::Modified);
    }

    #[test]
    fn job_output_untagged_shapes() {
        let exec: JobOutput = serde_json::from_value(serde_json::json!({
            "success": true,
            "stdout": "2",
            "stderr": "",
            "exit_code": 0,
            "duration_ms": 12
        }))
        .unwrap();
        assert_eq!(exec.as_execution().unwrap().stdout, "2");

        let ana: JobOutput =
            serde_json::from_value(serde_json::json!({ "analysis": "looks fine" })).unwrap();
        assert_eq!(ana.as_analysis(), Some("looks fine"));
    }

    #[test]
    fn job_serializes_status_snake_case() {
        let job = Job::new(
            "ana_1_deadbeef".into(),
            JobKind::Analyze,
            "u1",
            "print(1)",
            OffsetDateTime::UNIX_EPOCH,
        );
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["status"], "queued");
        assert_eq!(v["kind"], "analyze");
        assert_eq!(v["created_at"], "1970-01-01T00:00:00Z");
        assert!(v.get("result").is_none());
    }

    #[test]
    fn violation_summary_names_rules() {
        let report = StaticReport {
            safe: false,
            violations: vec![Violation {
                rule: ViolationRule::DeniedImport,
                name: "os".into(),
                line: 1,
                message: "import of denylisted module `os` (line 1)".into(),
            }],
            imports: vec!["os".into()],
            line_count: 2,
        };
        let summary = report.violation_summary().unwrap();
        assert!(summary.contains("`os`"));
        assert!(StaticReport::default().violation_summary().is_none());
    }
}
