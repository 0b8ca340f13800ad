//! JSON shapes exchanged with the request layer.
//!
//! Field names are camelCase. `schema/ingest-run.schema.json` describes the
//! same shapes for clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::IngestRun;

/// Body of a request to start an ingest run.
///
/// `datasetId` and `note` default to empty. A missing `months` becomes an
/// empty list and is rejected by the tracker's validation. Unknown fields are
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateIngestRequest {
    pub user: String,
    #[serde(default)]
    pub months: Vec<String>,
    #[serde(default)]
    pub dataset_id: String,
    #[serde(default)]
    pub note: String,
}

/// Outbound representation of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRunView {
    pub id: Uuid,
    pub status: String,
    pub requested_user: String,
    pub months: Vec<String>,
    pub dataset_id: String,
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&IngestRun> for IngestRunView {
    fn from(run: &IngestRun) -> Self {
        Self {
            id: run.id,
            status: run.status.as_str().to_string(),
            requested_user: run.requested_user.clone(),
            months: run.months.clone(),
            dataset_id: run.dataset_id.clone(),
            note: run.note.clone(),
            report_uri: run.report_uri.clone(),
            error: run.error.clone(),
            created_at: run.created_at,
            updated_at: run.updated_at,
            finished_at: run.finished_at,
        }
    }
}

impl From<IngestRun> for IngestRunView {
    fn from(run: IngestRun) -> Self {
        Self::from(&run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunStatus;

    #[test]
    fn test_request_defaults_deserialize() {
        let json = r#"{"user":"alireza","months":["2024-01","2024-02"]}"#;
        let req: CreateIngestRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.user, "alireza");
        assert_eq!(req.months, vec!["2024-01", "2024-02"]);
        assert!(req.dataset_id.is_empty());
        assert!(req.note.is_empty());
    }

    #[test]
    fn test_request_camel_case_fields() {
        let json = r#"{"user":"u","months":["2024-01"],"datasetId":"ds-9","note":"n"}"#;
        let req: CreateIngestRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.dataset_id, "ds-9");
        assert_eq!(req.note, "n");
    }

    #[test]
    fn test_request_missing_months_is_empty() {
        let req: CreateIngestRequest = serde_json::from_str(r#"{"user":"u"}"#).unwrap();
        assert!(req.months.is_empty());
    }

    #[test]
    fn test_request_rejects_unknown_fields() {
        let json = r#"{"user":"u","months":["2024-01"],"dataset":"ds-9"}"#;
        let err = serde_json::from_str::<CreateIngestRequest>(json).unwrap_err();
        assert!(err.to_string().contains("unknown field `dataset`"));
    }

    #[test]
    fn test_view_shape() {
        let run = IngestRun::new(
            Uuid::new_v4(),
            "judit",
            vec!["2024-09".to_string()],
            "ds-1",
            "",
            Utc::now(),
        );
        let value = serde_json::to_value(IngestRunView::from(&run)).unwrap();
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["requestedUser"], "judit");
        assert_eq!(value["datasetId"], "ds-1");
        assert_eq!(value["months"][0], "2024-09");
        assert!(value.get("createdAt").is_some());
        assert!(value.get("reportUri").is_none());
        assert!(value.get("finishedAt").is_none());

        let done = run
            .advance(RunStatus::Running, Utc::now(), None, None)
            .advance(RunStatus::Succeeded, Utc::now(), Some("s3://r".to_string()), None);
        let value = serde_json::to_value(IngestRunView::from(done)).unwrap();
        assert_eq!(value["status"], "SUCCEEDED");
        assert_eq!(value["reportUri"], "s3://r");
        assert!(value.get("finishedAt").is_some());
    }
}
