use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::OptionalExtension;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use oltalk_proto::types::FileNotice;

use crate::db::models::{FileRecord, UploadState};
use crate::db::{now_secs, Database};

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file not found")]
    NotFound,
    #[error("{0}")]
    PermissionDenied(&'static str),
    #[error("offset mismatch")]
    OffsetMismatch { expected: i64 },
    #[error("chunk exceeds file size")]
    Overrun,
    #[error("file not fully uploaded")]
    NotComplete,
    #[error("sha256 mismatch")]
    HashMismatch,
    #[error("file is still uploading")]
    StillUploading,
    #[error("offset out of range")]
    OffsetOutOfRange,
    #[error("file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// An accepted offer: conversation addressing plus the resolved target set.
#[derive(Debug, Clone)]
pub struct FileOffer {
    pub conversation_type: String,
    pub conversation_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub sha256: String,
    pub uploader_id: String,
    pub uploader_nickname: String,
    pub recipients: Vec<String>,
}

/// Where an upload stands: `uploaded_size` is the next expected offset.
#[derive(Debug, Clone)]
pub struct UploadInfo {
    pub file_id: String,
    pub file_size: i64,
    pub uploaded_size: i64,
    pub temp_path: PathBuf,
    pub storage_path: PathBuf,
}

impl From<&UploadState> for UploadInfo {
    fn from(state: &UploadState) -> Self {
        UploadInfo {
            file_id: state.record.file_id.clone(),
            file_size: state.record.file_size,
            uploaded_size: state.uploaded_size,
            temp_path: PathBuf::from(&state.temp_path),
            storage_path: PathBuf::from(&state.record.storage_path),
        }
    }
}

/// Map a file-name component to a token safe for the storage path: every
/// byte outside [A-Za-z0-9._-] becomes '_', an empty result becomes "file".
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
                b as char
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "file".to_string()
    } else {
        sanitized
    }
}

/// Two-phase upload lifecycle and permissioned chunk reads.
///
/// A `file_uploads` row is the authoritative "uploading" signal: while it
/// exists the temp file is the only artifact and downloads are refused;
/// finalization renames temp to storage and deletes the row in one step.
pub struct FileService {
    db: Arc<Database>,
    files_dir: PathBuf,
    temp_dir: PathBuf,
    chunk_size: usize,
}

impl FileService {
    pub fn new(db: Arc<Database>, data_dir: &Path, chunk_size: usize) -> Self {
        Self {
            db,
            files_dir: data_dir.join("files"),
            temp_dir: data_dir.join("tmp"),
            chunk_size,
        }
    }

    pub fn ensure_storage(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.files_dir)?;
        std::fs::create_dir_all(&self.temp_dir)
    }

    /// The server's declared preferred maximum chunk, echoed in `FileAccept`.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Accept an offer: write the file row, the upload row and the
    /// de-duplicated target set in one transaction.
    pub fn create_upload(&self, offer: FileOffer) -> Result<UploadInfo, FileError> {
        if offer.file_size <= 0 {
            return Err(FileError::Store(anyhow::anyhow!(
                "file_size must be positive"
            )));
        }
        if offer.recipients.is_empty() {
            return Err(FileError::Store(anyhow::anyhow!("recipients empty")));
        }

        let file_id = Uuid::new_v4().simple().to_string();
        let safe_name = sanitize_file_name(&offer.file_name);
        let storage_path = self.files_dir.join(format!("{file_id}_{safe_name}"));
        let temp_path = self.temp_dir.join(format!("{file_id}.part"));
        let created_at = now_secs();
        let file_size = offer.file_size;

        let fid = file_id.clone();
        let storage = storage_path.to_string_lossy().into_owned();
        let temp = temp_path.to_string_lossy().into_owned();
        self.db.with_tx(move |tx| {
            tx.execute(
                "INSERT INTO files (file_id, uploader_id, uploader_nickname,
                                    conversation_type, conversation_id, file_name,
                                    file_size, sha256, storage_path, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    fid,
                    offer.uploader_id,
                    offer.uploader_nickname,
                    offer.conversation_type,
                    offer.conversation_id,
                    offer.file_name,
                    offer.file_size,
                    offer.sha256,
                    storage,
                    created_at,
                ],
            )?;
            tx.execute(
                "INSERT INTO file_uploads (file_id, uploader_id, temp_path,
                                           uploaded_size, status, updated_at)
                 VALUES (?1, ?2, ?3, 0, 'uploading', ?4)",
                rusqlite::params![fid, offer.uploader_id, temp, created_at],
            )?;

            let mut stmt = tx.prepare(
                "INSERT INTO file_targets (file_id, user_id, delivered_at)
                 VALUES (?1, ?2, NULL)",
            )?;
            let mut seen = HashSet::new();
            for user_id in &offer.recipients {
                if seen.insert(user_id.as_str()) {
                    stmt.execute(rusqlite::params![fid, user_id])?;
                }
            }
            Ok(())
        })?;

        Ok(UploadInfo {
            file_id,
            file_size,
            uploaded_size: 0,
            temp_path,
            storage_path,
        })
    }

    /// Pick an interrupted upload back up. The temp file's on-disk size is
    /// authoritative when it disagrees with the row.
    pub async fn resume_upload(
        &self,
        file_id: &str,
        uploader_id: &str,
    ) -> Result<UploadInfo, FileError> {
        let state = self.upload_state(file_id)?;
        if state.record.uploader_id != uploader_id {
            return Err(FileError::PermissionDenied("uploader mismatch"));
        }

        let disk_size = match fs::metadata(&state.temp_path).await {
            Ok(meta) => meta.len() as i64,
            Err(_) => 0,
        };
        let mut info = UploadInfo::from(&state);
        if disk_size != state.uploaded_size {
            self.update_uploaded_size(file_id, disk_size)?;
            info.uploaded_size = disk_size;
        }
        Ok(info)
    }

    /// Append one chunk at exactly the next expected offset.
    pub async fn append_chunk(
        &self,
        file_id: &str,
        uploader_id: &str,
        offset: i64,
        data: &[u8],
    ) -> Result<UploadInfo, FileError> {
        let state = self.upload_state(file_id)?;
        if state.record.uploader_id != uploader_id {
            return Err(FileError::PermissionDenied("uploader mismatch"));
        }
        if offset != state.uploaded_size {
            return Err(FileError::OffsetMismatch {
                expected: state.uploaded_size,
            });
        }
        if offset + data.len() as i64 > state.record.file_size {
            return Err(FileError::Overrun);
        }

        let mut file = if offset == 0 {
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&state.temp_path)
                .await?
        } else {
            fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&state.temp_path)
                .await?
        };
        file.seek(SeekFrom::Start(offset as u64)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let next_offset = offset + data.len() as i64;
        self.update_uploaded_size(file_id, next_offset)?;

        let mut info = UploadInfo::from(&state);
        info.uploaded_size = next_offset;
        Ok(info)
    }

    /// Promote a fully uploaded temp file: verify size and hash, rename to
    /// the storage path, drop the upload row, and return the canonical
    /// notice read back from the file row.
    pub async fn finalize_upload(
        &self,
        file_id: &str,
        uploader_id: &str,
    ) -> Result<FileNotice, FileError> {
        let state = self.upload_state(file_id)?;
        if state.record.uploader_id != uploader_id {
            return Err(FileError::PermissionDenied("uploader mismatch"));
        }
        if state.uploaded_size != state.record.file_size {
            return Err(FileError::NotComplete);
        }

        let computed = sha256_hex_file(Path::new(&state.temp_path)).await?;
        if computed != state.record.sha256 {
            return Err(FileError::HashMismatch);
        }

        fs::rename(&state.temp_path, &state.record.storage_path).await?;

        let fid = file_id.to_string();
        self.db.with_tx(move |tx| {
            tx.execute("DELETE FROM file_uploads WHERE file_id = ?1", [&fid])?;
            Ok(())
        })?;

        Ok(self.file_record(file_id)?.notice())
    }

    /// Read up to `chunk_size` bytes of a finalized file at `offset`, gated
    /// on target-set membership.
    pub async fn read_chunk(
        &self,
        file_id: &str,
        user_id: &str,
        offset: i64,
    ) -> Result<(Vec<u8>, FileNotice), FileError> {
        if !self.has_target(file_id, user_id)? {
            return Err(FileError::PermissionDenied("no permission to download"));
        }
        if self.is_uploading(file_id)? {
            return Err(FileError::StillUploading);
        }
        let record = self.file_record(file_id)?;
        if offset < 0 || offset >= record.file_size {
            return Err(FileError::OffsetOutOfRange);
        }

        let mut file = fs::File::open(&record.storage_path).await?;
        file.seek(SeekFrom::Start(offset as u64)).await?;

        let to_read = (record.file_size - offset).min(self.chunk_size as i64) as usize;
        let mut buf = vec![0u8; to_read];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        Ok((buf, record.notice()))
    }

    /// Finalized files whose target row for `user_id` is still undelivered,
    /// oldest first.
    pub fn fetch_undelivered(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<FileNotice>, FileError> {
        let user = user_id.to_string();
        let notices = self.db.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT f.file_id, f.uploader_id, f.uploader_nickname,
                        f.conversation_type, f.conversation_id, f.file_name,
                        f.file_size, f.sha256, f.storage_path, f.created_at
                 FROM file_targets t
                 JOIN files f ON t.file_id = f.file_id
                 LEFT JOIN file_uploads u ON f.file_id = u.file_id
                 WHERE t.user_id = ?1 AND t.delivered_at IS NULL AND u.file_id IS NULL
                 ORDER BY f.created_at ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![user, limit], file_record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(notices.iter().map(FileRecord::notice).collect())
    }

    pub fn mark_delivered(&self, user_id: &str, file_ids: &[String]) -> Result<(), FileError> {
        if file_ids.is_empty() {
            return Ok(());
        }
        let user = user_id.to_string();
        let ids: Vec<String> = file_ids.to_vec();
        self.db.with_tx(move |tx| {
            let mut stmt = tx.prepare(
                "UPDATE file_targets SET delivered_at = ?1
                 WHERE user_id = ?2 AND file_id = ?3",
            )?;
            let delivered_at = now_secs();
            for file_id in &ids {
                stmt.execute(rusqlite::params![delivered_at, user, file_id])?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Everyone in the file's target set, for completion fanout.
    pub fn list_targets(&self, file_id: &str) -> Result<Vec<String>, FileError> {
        let fid = file_id.to_string();
        let targets = self.db.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT user_id FROM file_targets WHERE file_id = ?1")?;
            let rows = stmt
                .query_map([&fid], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(targets)
    }

    fn upload_state(&self, file_id: &str) -> Result<UploadState, FileError> {
        let fid = file_id.to_string();
        let state = self.db.with_conn(move |conn| {
            let state = conn
                .query_row(
                    "SELECT f.file_id, f.uploader_id, f.uploader_nickname,
                            f.conversation_type, f.conversation_id, f.file_name,
                            f.file_size, f.sha256, f.storage_path, f.created_at,
                            u.temp_path, u.uploaded_size
                     FROM files f
                     JOIN file_uploads u ON f.file_id = u.file_id
                     WHERE f.file_id = ?1",
                    [&fid],
                    |row| {
                        Ok(UploadState {
                            record: file_record_from_row(row)?,
                            temp_path: row.get(10)?,
                            uploaded_size: row.get(11)?,
                        })
                    },
                )
                .optional()?;
            Ok(state)
        })?;
        state.ok_or(FileError::NotFound)
    }

    fn file_record(&self, file_id: &str) -> Result<FileRecord, FileError> {
        let fid = file_id.to_string();
        let record = self.db.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT file_id, uploader_id, uploader_nickname,
                            conversation_type, conversation_id, file_name,
                            file_size, sha256, storage_path, created_at
                     FROM files WHERE file_id = ?1",
                    [&fid],
                    file_record_from_row,
                )
                .optional()?;
            Ok(record)
        })?;
        record.ok_or(FileError::NotFound)
    }

    fn has_target(&self, file_id: &str, user_id: &str) -> Result<bool, FileError> {
        let fid = file_id.to_string();
        let user = user_id.to_string();
        let found = self.db.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM file_targets WHERE file_id = ?1 AND user_id = ?2",
                    rusqlite::params![fid, user],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })?;
        Ok(found)
    }

    fn is_uploading(&self, file_id: &str) -> Result<bool, FileError> {
        let fid = file_id.to_string();
        let found = self.db.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM file_uploads WHERE file_id = ?1",
                    [&fid],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })?;
        Ok(found)
    }

    fn update_uploaded_size(&self, file_id: &str, uploaded_size: i64) -> Result<(), FileError> {
        let fid = file_id.to_string();
        self.db.with_conn(move |conn| {
            conn.execute(
                "UPDATE file_uploads SET uploaded_size = ?1, updated_at = ?2
                 WHERE file_id = ?3",
                rusqlite::params![uploaded_size, now_secs(), fid],
            )?;
            Ok(())
        })?;
        Ok(())
    }
}

fn file_record_from_row(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        file_id: row.get(0)?,
        uploader_id: row.get(1)?,
        uploader_nickname: row.get(2)?,
        conversation_type: row.get(3)?,
        conversation_id: row.get(4)?,
        file_name: row.get(5)?,
        file_size: row.get(6)?,
        sha256: row.get(7)?,
        storage_path: row.get(8)?,
        created_at: row.get(9)?,
    })
}

/// Streamed SHA-256 of a file, lowercase hex.
async fn sha256_hex_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 4 * 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
