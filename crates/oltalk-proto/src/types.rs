//! Metadata JSON bodies carried inside frames.
//!
//! Request types use `#[serde(default)]` so a missing field deserializes to
//! its empty value and fails per-field validation on the server with a
//! precise error code, rather than failing the whole JSON parse.

use serde::{Deserialize, Serialize};

// ── Auth ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterRequest {
    pub user_id: String,
    pub nickname: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub user_id: String,
    pub password: String,
}

/// One entry of the online roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: String,
    pub nickname: String,
}

// ── Groups ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupCreateRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupIdRequest {
    pub group_id: String,
}

/// Administrative action on a group. `name` is used by `rename`,
/// `target_user_id` by `kick`/`promote`/`demote`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupAdminRequest {
    pub action: String,
    pub group_id: String,
    pub name: String,
    pub target_user_id: String,
}

// ── Messages ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSendRequest {
    pub conversation_type: String,
    pub conversation_id: String,
    pub content: String,
}

/// A stored message as delivered to recipients and returned from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: i64,
    pub conversation_type: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_nickname: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryFetchRequest {
    pub conversation_type: String,
    pub conversation_id: String,
    pub before_message_id: Option<i64>,
    pub limit: Option<u32>,
}

// ── Files ───────────────────────────────────────────────────────────────

/// Offer of a new upload, or a resume when `file_id` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOfferRequest {
    pub conversation_type: String,
    pub conversation_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub sha256: String,
    pub file_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileChunkRequest {
    pub file_id: String,
    pub offset: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileDoneRequest {
    pub file_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileDownloadRequest {
    pub file_id: String,
    pub offset: i64,
}

/// Canonical description of a finalized file, fanned out as `FileDone` and
/// echoed in download chunk metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNotice {
    pub file_id: String,
    pub conversation_type: String,
    pub conversation_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub sha256: String,
    pub uploader_id: String,
    pub uploader_nickname: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default_to_empty() {
        let req: RegisterRequest = serde_json::from_str(r#"{"user_id":"alice"}"#).unwrap();
        assert_eq!(req.user_id, "alice");
        assert_eq!(req.nickname, "");
        assert_eq!(req.password, "");
    }

    #[test]
    fn offer_resume_field_defaults_empty() {
        let req: FileOfferRequest = serde_json::from_str(
            r#"{"conversation_type":"private","conversation_id":"bob",
                "file_name":"a.txt","file_size":10,"sha256":"00"}"#,
        )
        .unwrap();
        assert_eq!(req.file_id, "");
        assert_eq!(req.file_size, 10);
    }

    #[test]
    fn stored_message_roundtrips() {
        let msg = StoredMessage {
            message_id: 5,
            conversation_type: "private".into(),
            conversation_id: "bob".into(),
            sender_id: "alice".into(),
            sender_nickname: "Alice".into(),
            content: "hi".into(),
            created_at: 1_700_000_000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: StoredMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
