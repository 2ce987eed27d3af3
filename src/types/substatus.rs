use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Append-only progress annotation on a PTX (§3, §6
/// `UpdateSubStatus(id, subStatus, action, info, err, metadata)`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStatus {
    AssignNonce,
    Signed,
    Submitted,
    Tracking,
    GasBumped,
    Confirmed,
    Failed,
    Stalled,
    Suspended,
    Resumed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubStatusEntry {
    pub at: DateTime<Utc>,
    pub sub_status: SubStatus,
    pub action: String,
    pub info: Option<String>,
    pub error: Option<String>,
}

/// An append-only log of `SubStatusEntry`, coalescing duplicate entries
/// within the same stage per §4.3 ("duplicates within the same stage are
/// coalesced").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubStatusHistory(Vec<SubStatusEntry>);

impl SubStatusHistory {
    #[must_use]
    pub fn entries(&self) -> &[SubStatusEntry] {
        &self.0
    }

    pub fn append(
        &mut self,
        at: DateTime<Utc>,
        sub_status: SubStatus,
        action: impl Into<String>,
        info: Option<String>,
        error: Option<String>,
    ) {
        if let Some(last) = self.0.last() {
            if last.sub_status == sub_status && last.error.is_none() && error.is_none() {
                return;
            }
        }
        self.0.push(SubStatusEntry {
            at,
            sub_status,
            action: action.into(),
            info,
            error,
        });
    }
}
