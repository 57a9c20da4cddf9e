//! State-transition notifications.

use chrono::{DateTime, Utc};
use forgegen_core::{JobId, OwnerId};
use serde::{Deserialize, Serialize};

use crate::kind::JobType;
use crate::record::JobRecord;
use crate::status::JobStatus;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEventType {
    Deploying,
    Completed,
    Success,
    Failed,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::Deploying => "deploying",
            JobEventType::Completed => "completed",
            JobEventType::Success => "success",
            JobEventType::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobEventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event delivered to the owner's subscribers.
///
/// Always built from a record that has already been persisted, so a
/// subscriber polling the record right away sees the same state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub job_type: JobType,
    pub event_type: JobEventType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deployed_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    /// Event for the record's current status, if that status is announced.
    ///
    /// `queued` and `generating` produce no event.
    pub fn for_record(record: &JobRecord) -> Option<Self> {
        let event_type = match record.status {
            JobStatus::Queued | JobStatus::Generating => return None,
            JobStatus::Deploying => JobEventType::Deploying,
            JobStatus::Completed => JobEventType::Completed,
            JobStatus::Success => JobEventType::Success,
            JobStatus::Failed => JobEventType::Failed,
        };

        Some(Self {
            job_id: record.id,
            owner_id: record.owner_id,
            job_type: record.job_type(),
            event_type,
            download_url: record.code_generation().and_then(|d| d.download_url.clone()),
            deployed_url: record.deployment().and_then(|d| d.deployed_url.clone()),
            error: record.error.clone(),
            occurred_at: record.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CodeGenerationData, JobData};
    use crate::record::JobRecordPatch;
    use forgegen_core::ProjectId;

    #[test]
    fn completed_event_carries_download_reference() {
        let data = JobData::CodeGeneration(CodeGenerationData {
            owner_id: OwnerId::new(),
            project_id: ProjectId::new(),
            prompt_type: "feature".to_string(),
            prompt: "add a login form".to_string(),
        });
        let mut record = JobRecord::queued(JobId::new(), &data, Utc::now());
        assert!(JobEvent::for_record(&record).is_none());

        record.apply(JobRecordPatch::status(JobStatus::Generating), Utc::now()).unwrap();
        assert!(JobEvent::for_record(&record).is_none());

        record
            .apply(
                JobRecordPatch::status(JobStatus::Completed).with_artifact("k", "https://blobs.example/k"),
                Utc::now(),
            )
            .unwrap();
        let event = JobEvent::for_record(&record).unwrap();
        assert_eq!(event.event_type, JobEventType::Completed);
        assert_eq!(event.download_url.as_deref(), Some("https://blobs.example/k"));
        assert_eq!(event.owner_id, record.owner_id);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], serde_json::json!("completed"));
        assert!(json.get("error").is_none());
    }
}
