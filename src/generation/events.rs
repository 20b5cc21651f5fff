//! Events streamed while a task runs.

use serde::Serialize;
use serde_json::{json, Value};

/// Pipeline phase a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Cover,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    GeneratingCover,
    Generating,
    BatchStart,
}

/// Task summary sent once at the end of a run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FinishSummary {
    pub success: bool,
    pub task_id: String,
    /// Generated filenames in completion order.
    pub images: Vec<String>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub failed_indices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Progress {
        status: ProgressStatus,
        index: Option<u32>,
        message: Option<String>,
        current: usize,
        total: usize,
        phase: Phase,
    },
    Complete {
        index: u32,
        image_url: String,
        phase: Option<Phase>,
    },
    Error {
        index: u32,
        message: String,
        phase: Option<Phase>,
    },
    Finish(FinishSummary),
    RetryStart {
        total: usize,
        message: String,
    },
    RetryFinish {
        success: bool,
        total: usize,
        completed: usize,
        failed: usize,
    },
}

impl GenerationEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Finish(_) => "finish",
            Self::RetryStart { .. } => "retry_start",
            Self::RetryFinish { .. } => "retry_finish",
        }
    }

    /// SSE payload.
    pub fn data(&self) -> Value {
        match self {
            Self::Progress {
                status,
                index,
                message,
                current,
                total,
                phase,
            } => {
                let mut data = json!({
                    "status": status,
                    "current": current,
                    "total": total,
                    "phase": phase,
                });
                if let Some(index) = index {
                    data["index"] = json!(index);
                }
                if let Some(message) = message {
                    data["message"] = json!(message);
                }
                data
            }
            Self::Complete {
                index,
                image_url,
                phase,
            } => {
                let mut data = json!({
                    "index": index,
                    "status": "done",
                    "image_url": image_url,
                });
                if let Some(phase) = phase {
                    data["phase"] = json!(phase);
                }
                data
            }
            Self::Error {
                index,
                message,
                phase,
            } => {
                let mut data = json!({
                    "index": index,
                    "status": "error",
                    "message": message,
                    "retryable": true,
                });
                if let Some(phase) = phase {
                    data["phase"] = json!(phase);
                }
                data
            }
            Self::Finish(summary) => json!(summary),
            Self::RetryStart { total, message } => json!({
                "total": total,
                "message": message,
            }),
            Self::RetryFinish {
                success,
                total,
                completed,
                failed,
            } => json!({
                "success": success,
                "total": total,
                "completed": completed,
                "failed": failed,
            }),
        }
    }

    /// Page index for page-scoped events.
    pub fn index(&self) -> Option<u32> {
        match self {
            Self::Progress { index, .. } => *index,
            Self::Complete { index, .. } | Self::Error { index, .. } => Some(*index),
            _ => None,
        }
    }
}
