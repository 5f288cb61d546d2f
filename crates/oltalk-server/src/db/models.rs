use oltalk_proto::types::FileNotice;

/// A row of the `users` table.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub user_id: String,
    pub nickname: String,
    pub password_hash: String,
    pub created_at: i64,
}

/// A row of the `files` table, including the server-side storage path that
/// never crosses the wire.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: String,
    pub uploader_id: String,
    pub uploader_nickname: String,
    pub conversation_type: String,
    pub conversation_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub sha256: String,
    pub storage_path: String,
    pub created_at: i64,
}

impl FileRecord {
    pub fn notice(&self) -> FileNotice {
        FileNotice {
            file_id: self.file_id.clone(),
            conversation_type: self.conversation_type.clone(),
            conversation_id: self.conversation_id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            sha256: self.sha256.clone(),
            uploader_id: self.uploader_id.clone(),
            uploader_nickname: self.uploader_nickname.clone(),
            created_at: self.created_at,
        }
    }
}

/// Join of `files` and `file_uploads` for a file still in the uploading
/// phase. Its existence is the authoritative "not downloadable yet" signal.
#[derive(Debug, Clone)]
pub struct UploadState {
    pub record: FileRecord,
    pub temp_path: String,
    pub uploaded_size: i64,
}
