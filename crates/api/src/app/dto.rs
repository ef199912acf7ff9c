use serde::Deserialize;

use procura_infra::{BatchImportRequest, WriteMode};
use procura_purchasing::{ImportRow, MatchKey, PurchaseStatus, StatusChange, UserRef};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStatusRequest {
    pub status: PurchaseStatus,
    pub comment: Option<String>,
    pub procurement_responsible: Option<UserRef>,
}

impl From<ChangeStatusRequest> for StatusChange {
    fn from(body: ChangeStatusRequest) -> Self {
        StatusChange {
            status: body.status,
            comment: body.comment,
            procurement_responsible: body.procurement_responsible,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetDeletedRequest {
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchImportBody {
    #[serde(default)]
    pub items: Vec<ImportRow>,
    #[serde(default)]
    pub mode: WriteMode,
    pub match_by: Option<MatchKey>,
    pub write_status_history_on_insert: Option<bool>,
    /// Recorded as the creator of inserted records.
    pub created_by: Option<UserRef>,
}

impl BatchImportBody {
    pub fn into_parts(self) -> (BatchImportRequest, Option<UserRef>) {
        let request = BatchImportRequest {
            items: self.items,
            mode: self.mode,
            match_by: self.match_by,
            write_status_history_on_insert: self.write_status_history_on_insert,
        };
        (request, self.created_by)
    }
}
