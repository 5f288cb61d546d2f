//! Per-packet routing: authentication gates, field validation, service
//! calls, the uniform response envelope, and fanout to recipients.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use oltalk_proto::types::{
    FileChunkRequest, FileDoneRequest, FileDownloadRequest, FileOfferRequest, GroupAdminRequest,
    GroupCreateRequest, GroupIdRequest, HistoryFetchRequest, LoginRequest, MessageSendRequest,
    RegisterRequest,
};
use oltalk_proto::wire::{self, Packet, PacketType};

use crate::config::ServerConfig;
use crate::connection::ConnectionHandle;
use crate::db::Database;
use crate::services::auth::{AuthError, AuthService};
use crate::services::file::{FileError, FileOffer, FileService};
use crate::services::group::{GroupError, GroupService};
use crate::services::message::{MessageInput, MessageService};
use crate::session::{ConnId, SessionRegistry};

const MAX_FIELD_LEN: usize = 64;
const MAX_CONTENT_LEN: usize = 4096;
const MAX_FILE_NAME_LEN: usize = 255;
const SHA256_HEX_LEN: usize = 64;

pub struct Dispatcher {
    registry: SessionRegistry,
    auth: AuthService,
    groups: GroupService,
    messages: MessageService,
    files: FileService,
    history_page_size: u32,
}

impl Dispatcher {
    pub fn new(db: Arc<Database>, config: &ServerConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            auth: AuthService::new(db.clone()),
            groups: GroupService::new(db.clone()),
            messages: MessageService::new(db.clone()),
            files: FileService::new(db, &config.data_dir, config.file_chunk_size),
            history_page_size: config.history_page_size.max(1),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Create the file/temp storage directories under the data dir.
    pub fn ensure_storage(&self) -> std::io::Result<()> {
        self.files.ensure_storage()
    }

    pub async fn dispatch(&self, conn: &ConnectionHandle, packet: Packet) {
        match PacketType::from_u16(packet.packet_type) {
            Some(PacketType::AuthRegister) => self.handle_register(conn, &packet).await,
            Some(PacketType::AuthLogin) => self.handle_login(conn, &packet).await,
            Some(PacketType::GroupCreate) => self.handle_group_create(conn, &packet).await,
            Some(PacketType::GroupJoin) => self.handle_group_join(conn, &packet).await,
            Some(PacketType::GroupLeave) => self.handle_group_leave(conn, &packet).await,
            Some(PacketType::GroupAdmin) => self.handle_group_admin(conn, &packet).await,
            Some(PacketType::MessageSend) => self.handle_message_send(conn, &packet).await,
            Some(PacketType::HistoryFetch) => self.handle_history_fetch(conn, &packet).await,
            Some(PacketType::FileOffer) => self.handle_file_offer(conn, &packet).await,
            Some(PacketType::FileUploadChunk) => self.handle_file_chunk(conn, &packet).await,
            Some(PacketType::FileUploadDone) => self.handle_file_done(conn, &packet).await,
            Some(PacketType::FileDownloadRequest) => self.handle_file_download(conn, &packet).await,
            _ => warn!("unhandled packet type {}", packet.packet_type),
        }
    }

    /// Session teardown on socket close: both registry maps are cleaned and,
    /// when the user was logged in, the new roster goes out to everyone.
    pub fn handle_disconnect(&self, conn_id: ConnId) {
        if self.registry.remove_connection(conn_id) {
            self.broadcast_user_list(None);
        }
    }

    // ── Auth ────────────────────────────────────────────────────────────

    async fn handle_register(&self, conn: &ConnectionHandle, packet: &Packet) {
        let req: RegisterRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_auth_error(conn, packet, "INVALID_JSON", &e).await,
        };
        if let Err(e) = validate_field(&req.user_id, "user_id", MAX_FIELD_LEN) {
            return self.send_auth_error(conn, packet, "INVALID_USER_ID", &e).await;
        }
        if let Err(e) = validate_field(&req.nickname, "nickname", MAX_FIELD_LEN) {
            return self.send_auth_error(conn, packet, "INVALID_NICKNAME", &e).await;
        }
        if let Err(e) = validate_field(&req.password, "password", MAX_FIELD_LEN) {
            return self.send_auth_error(conn, packet, "INVALID_PASSWORD", &e).await;
        }

        match self.auth.register(&req.user_id, &req.nickname, &req.password).await {
            Ok(()) => {
                info!("registered user {}", req.user_id);
                let meta = json!({
                    "status": "ok",
                    "registered": true,
                    "logged_in": false,
                })
                .to_string();
                conn.send(&Packet::new(PacketType::AuthOk, packet.request_id, meta))
                    .await;
            }
            Err(AuthError::UserExists) => {
                self.send_auth_error(conn, packet, "USER_ALREADY_EXISTS", "user already exists")
                    .await;
            }
            Err(e) => {
                self.send_auth_error(conn, packet, "STORE_FAILED", &e.to_string())
                    .await;
            }
        }
    }

    async fn handle_login(&self, conn: &ConnectionHandle, packet: &Packet) {
        let req: LoginRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_auth_error(conn, packet, "INVALID_JSON", &e).await,
        };
        if let Err(e) = validate_field(&req.user_id, "user_id", MAX_FIELD_LEN) {
            return self.send_auth_error(conn, packet, "INVALID_USER_ID", &e).await;
        }
        if let Err(e) = validate_field(&req.password, "password", MAX_FIELD_LEN) {
            return self.send_auth_error(conn, packet, "INVALID_PASSWORD", &e).await;
        }

        let user = match self.auth.login(&req.user_id, &req.password).await {
            Ok(user) => user,
            Err(e @ (AuthError::NotFound | AuthError::BadPassword)) => {
                return self
                    .send_auth_error(conn, packet, "LOGIN_FAILED", &e.to_string())
                    .await;
            }
            Err(e) => {
                return self
                    .send_auth_error(conn, packet, "STORE_FAILED", &e.to_string())
                    .await;
            }
        };

        if let Err(e) = self.registry.login(conn.conn_id, &user.user_id, &user.nickname) {
            return self
                .send_auth_error(conn, packet, "LOGIN_FAILED", &e.to_string())
                .await;
        }

        info!("login ok: {}", user.user_id);
        let meta = json!({
            "user_id": user.user_id,
            "nickname": user.nickname,
            "registered": false,
            "logged_in": true,
            "online_users": self.registry.online_users(),
        })
        .to_string();
        conn.send(&Packet::new(PacketType::AuthOk, packet.request_id, meta))
            .await;

        self.broadcast_user_list(Some(conn.conn_id));
        self.deliver_offline_messages(&user.user_id, conn).await;
        self.deliver_offline_files(&user.user_id, conn).await;
    }

    async fn send_auth_error(
        &self,
        conn: &ConnectionHandle,
        packet: &Packet,
        code: &str,
        message: &str,
    ) {
        let meta = json!({ "code": code, "message": message }).to_string();
        conn.send(&Packet::new(PacketType::AuthError, packet.request_id, meta))
            .await;
    }

    // ── Groups ──────────────────────────────────────────────────────────

    async fn handle_group_create(&self, conn: &ConnectionHandle, packet: &Packet) {
        let Some((user_id, _)) = self.require_login(conn, packet).await else {
            return;
        };
        let req: GroupCreateRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_error(conn, packet, "INVALID_JSON", &e, None).await,
        };
        if let Err(e) = validate_field(&req.name, "name", MAX_FIELD_LEN) {
            return self.send_error(conn, packet, "INVALID_NAME", &e, None).await;
        }
        match self.groups.create_group(&user_id, &req.name) {
            Ok(group_id) => {
                let extra = json!({ "group_id": group_id, "name": req.name });
                self.send_ok(conn, packet, extra).await;
            }
            Err(e) => self.send_group_error(conn, packet, e).await,
        }
    }

    async fn handle_group_join(&self, conn: &ConnectionHandle, packet: &Packet) {
        let Some((user_id, _)) = self.require_login(conn, packet).await else {
            return;
        };
        let req: GroupIdRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_error(conn, packet, "INVALID_JSON", &e, None).await,
        };
        if let Err(e) = validate_field(&req.group_id, "group_id", MAX_FIELD_LEN) {
            return self.send_error(conn, packet, "INVALID_GROUP_ID", &e, None).await;
        }
        match self.groups.join_group(&user_id, &req.group_id) {
            Ok(()) => self.send_ok(conn, packet, json!({})).await,
            Err(e) => self.send_group_error(conn, packet, e).await,
        }
    }

    async fn handle_group_leave(&self, conn: &ConnectionHandle, packet: &Packet) {
        let Some((user_id, _)) = self.require_login(conn, packet).await else {
            return;
        };
        let req: GroupIdRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_error(conn, packet, "INVALID_JSON", &e, None).await,
        };
        if let Err(e) = validate_field(&req.group_id, "group_id", MAX_FIELD_LEN) {
            return self.send_error(conn, packet, "INVALID_GROUP_ID", &e, None).await;
        }
        match self.groups.leave_group(&user_id, &req.group_id) {
            Ok(()) => self.send_ok(conn, packet, json!({})).await,
            Err(e) => self.send_group_error(conn, packet, e).await,
        }
    }

    async fn handle_group_admin(&self, conn: &ConnectionHandle, packet: &Packet) {
        let Some((user_id, _)) = self.require_login(conn, packet).await else {
            return;
        };
        let req: GroupAdminRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_error(conn, packet, "INVALID_JSON", &e, None).await,
        };
        if validate_field(&req.action, "action", MAX_FIELD_LEN).is_err()
            || validate_field(&req.group_id, "group_id", MAX_FIELD_LEN).is_err()
        {
            return self
                .send_error(conn, packet, "INVALID_REQUEST", "action and group_id are required", None)
                .await;
        }

        let result = match req.action.as_str() {
            "rename" => {
                if let Err(e) = validate_field(&req.name, "name", MAX_FIELD_LEN) {
                    return self.send_error(conn, packet, "INVALID_NAME", &e, None).await;
                }
                self.groups.rename_group(&user_id, &req.group_id, &req.name)
            }
            "kick" => {
                if let Err(e) = validate_field(&req.target_user_id, "target_user_id", MAX_FIELD_LEN)
                {
                    return self.send_error(conn, packet, "INVALID_TARGET", &e, None).await;
                }
                self.groups.kick_user(&user_id, &req.group_id, &req.target_user_id)
            }
            "dissolve" => self.groups.dissolve_group(&user_id, &req.group_id),
            "promote" | "demote" => {
                if let Err(e) = validate_field(&req.target_user_id, "target_user_id", MAX_FIELD_LEN)
                {
                    return self.send_error(conn, packet, "INVALID_TARGET", &e, None).await;
                }
                self.groups.set_admin(
                    &user_id,
                    &req.group_id,
                    &req.target_user_id,
                    req.action == "promote",
                )
            }
            _ => {
                return self
                    .send_error(conn, packet, "UNKNOWN_ACTION", "unsupported action", None)
                    .await;
            }
        };

        match result {
            Ok(()) => self.send_ok(conn, packet, json!({})).await,
            Err(e) => self.send_group_error(conn, packet, e).await,
        }
    }

    async fn send_group_error(&self, conn: &ConnectionHandle, packet: &Packet, err: GroupError) {
        let code = match &err {
            GroupError::NotFound => "GROUP_NOT_FOUND",
            GroupError::NotInGroup => "NOT_IN_GROUP",
            GroupError::AlreadyInGroup => "INVALID_REQUEST",
            GroupError::PermissionDenied(_) => "PERMISSION_DENIED",
            GroupError::Store(_) => "STORE_FAILED",
        };
        self.send_error(conn, packet, code, &err.to_string(), None).await;
    }

    // ── Messages ────────────────────────────────────────────────────────

    async fn handle_message_send(&self, conn: &ConnectionHandle, packet: &Packet) {
        let Some((user_id, nickname)) = self.require_login(conn, packet).await else {
            return;
        };
        let req: MessageSendRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_error(conn, packet, "INVALID_JSON", &e, None).await,
        };
        if let Err(e) = validate_field(&req.conversation_type, "conversation_type", MAX_FIELD_LEN)
            .and_then(|_| validate_field(&req.conversation_id, "conversation_id", MAX_FIELD_LEN))
            .and_then(|_| validate_field(&req.content, "content", MAX_CONTENT_LEN))
        {
            return self.send_error(conn, packet, "INVALID_REQUEST", &e, None).await;
        }

        let recipients = match self.resolve_recipients(
            &user_id,
            &req.conversation_type,
            &req.conversation_id,
            false,
        ) {
            Ok(recipients) => recipients,
            Err((code, message)) => {
                return self.send_error(conn, packet, code, &message, None).await;
            }
        };

        let input = MessageInput {
            conversation_type: req.conversation_type,
            conversation_id: req.conversation_id,
            sender_id: user_id,
            sender_nickname: nickname,
            content: req.content,
        };
        let stored = match self.messages.store_message(&input, &recipients) {
            Ok(stored) => stored,
            Err(e) => {
                return self
                    .send_error(conn, packet, "STORE_FAILED", &e.to_string(), None)
                    .await;
            }
        };

        let ack = json!({
            "message_id": stored.message_id,
            "created_at": stored.created_at,
        });
        self.send_ok(conn, packet, ack).await;

        // Online recipients get the frame now and their spool row closed;
        // offline rows stay NULL for the next login's drain.
        let deliver_meta = serde_json::to_string(&stored).unwrap();
        for recipient in &recipients {
            let Some(sender) = self.registry.sender_for_user(recipient) else {
                continue;
            };
            let frame = wire::encode(&Packet::new(PacketType::MessageDeliver, 0, deliver_meta.clone()));
            if self.enqueue(&sender, frame) {
                if let Err(e) = self.messages.mark_delivered(recipient, &[stored.message_id]) {
                    warn!("mark delivered failed for {}: {}", recipient, e);
                }
            }
        }
    }

    async fn handle_history_fetch(&self, conn: &ConnectionHandle, packet: &Packet) {
        let Some((user_id, _)) = self.require_login(conn, packet).await else {
            return;
        };
        let req: HistoryFetchRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_error(conn, packet, "INVALID_JSON", &e, None).await,
        };
        if let Err(e) = validate_field(&req.conversation_type, "conversation_type", MAX_FIELD_LEN)
            .and_then(|_| validate_field(&req.conversation_id, "conversation_id", MAX_FIELD_LEN))
        {
            return self.send_error(conn, packet, "INVALID_REQUEST", &e, None).await;
        }
        match req.conversation_type.as_str() {
            "group" => {
                if let Err(e) = self.groups.user_role(&user_id, &req.conversation_id) {
                    return self.send_group_error(conn, packet, e).await;
                }
            }
            "private" => {}
            _ => {
                return self
                    .send_error(conn, packet, "INVALID_CONVERSATION_TYPE", "use private or group", None)
                    .await;
            }
        }

        let limit = req
            .limit
            .unwrap_or(self.history_page_size)
            .clamp(1, self.history_page_size);
        match self.messages.fetch_history(
            &req.conversation_type,
            &req.conversation_id,
            &user_id,
            req.before_message_id,
            limit,
        ) {
            Ok(page) => {
                let mut extra = Map::new();
                extra.insert("status".into(), "ok".into());
                extra.insert(
                    "messages".into(),
                    serde_json::to_value(&page.messages).unwrap(),
                );
                if let Some(cursor) = page.next_before_message_id {
                    extra.insert("next_before_message_id".into(), cursor.into());
                }
                let meta = Value::Object(extra).to_string();
                conn.send(&Packet::new(
                    PacketType::HistoryResponse,
                    packet.request_id,
                    meta,
                ))
                .await;
            }
            Err(e) => {
                let meta = error_envelope("STORE_FAILED", &e.to_string(), None);
                conn.send(&Packet::new(
                    PacketType::HistoryResponse,
                    packet.request_id,
                    meta,
                ))
                .await;
            }
        }
    }

    // ── Files ───────────────────────────────────────────────────────────

    async fn handle_file_offer(&self, conn: &ConnectionHandle, packet: &Packet) {
        let Some((user_id, nickname)) = self.require_login(conn, packet).await else {
            return;
        };
        let req: FileOfferRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_error(conn, packet, "INVALID_JSON", &e, None).await,
        };
        if let Err(e) = validate_field(&req.conversation_type, "conversation_type", MAX_FIELD_LEN)
            .and_then(|_| validate_field(&req.conversation_id, "conversation_id", MAX_FIELD_LEN))
            .and_then(|_| validate_field(&req.file_name, "file_name", MAX_FILE_NAME_LEN))
        {
            return self.send_error(conn, packet, "INVALID_REQUEST", &e, None).await;
        }
        if req.sha256.len() != SHA256_HEX_LEN {
            return self
                .send_error(conn, packet, "INVALID_SHA256", "sha256 length invalid", None)
                .await;
        }
        if req.file_size <= 0 {
            return self
                .send_error(conn, packet, "INVALID_SIZE", "file_size must be positive", None)
                .await;
        }

        // Uploads address the whole conversation, uploader included, so the
        // completion notice also closes the uploader's own spool row.
        let recipients = match self.resolve_recipients(
            &user_id,
            &req.conversation_type,
            &req.conversation_id,
            true,
        ) {
            Ok(recipients) => recipients,
            Err((code, message)) => {
                return self.send_error(conn, packet, code, &message, None).await;
            }
        };

        let info = if !req.file_id.is_empty() {
            if let Err(e) = validate_field(&req.file_id, "file_id", MAX_FIELD_LEN) {
                return self.send_error(conn, packet, "INVALID_FILE_ID", &e, None).await;
            }
            match self.files.resume_upload(&req.file_id, &user_id).await {
                Ok(info) => info,
                Err(e) => {
                    return self
                        .send_error(conn, packet, "RESUME_FAILED", &e.to_string(), None)
                        .await;
                }
            }
        } else {
            let offer = FileOffer {
                conversation_type: req.conversation_type,
                conversation_id: req.conversation_id,
                file_name: req.file_name,
                file_size: req.file_size,
                sha256: req.sha256,
                uploader_id: user_id,
                uploader_nickname: nickname,
                recipients,
            };
            match self.files.create_upload(offer) {
                Ok(info) => info,
                Err(e) => {
                    return self
                        .send_error(conn, packet, "OFFER_FAILED", &e.to_string(), None)
                        .await;
                }
            }
        };

        let meta = json!({
            "status": "ok",
            "file_id": info.file_id,
            "next_offset": info.uploaded_size,
            "chunk_size": self.files.chunk_size(),
        })
        .to_string();
        conn.send(&Packet::new(PacketType::FileAccept, packet.request_id, meta))
            .await;
    }

    async fn handle_file_chunk(&self, conn: &ConnectionHandle, packet: &Packet) {
        let Some((user_id, _)) = self.require_login(conn, packet).await else {
            return;
        };
        let req: FileChunkRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_error(conn, packet, "INVALID_JSON", &e, None).await,
        };
        if let Err(e) = validate_field(&req.file_id, "file_id", MAX_FIELD_LEN) {
            return self.send_error(conn, packet, "INVALID_FILE_ID", &e, None).await;
        }
        if packet.binary.is_empty() {
            return self
                .send_error(conn, packet, "EMPTY_CHUNK", "chunk is empty", None)
                .await;
        }
        if packet.binary.len() > self.files.chunk_size() {
            return self
                .send_error(conn, packet, "CHUNK_TOO_LARGE", "chunk too large", None)
                .await;
        }

        match self
            .files
            .append_chunk(&req.file_id, &user_id, req.offset, &packet.binary)
            .await
        {
            Ok(info) => {
                self.send_ok(conn, packet, json!({ "next_offset": info.uploaded_size }))
                    .await;
            }
            Err(FileError::OffsetMismatch { expected }) => {
                let extra = json!({ "expected_offset": expected });
                self.send_error(conn, packet, "UPLOAD_FAILED", "offset mismatch", Some(extra))
                    .await;
            }
            Err(e) => {
                self.send_error(conn, packet, "UPLOAD_FAILED", &e.to_string(), None)
                    .await;
            }
        }
    }

    async fn handle_file_done(&self, conn: &ConnectionHandle, packet: &Packet) {
        let Some((user_id, _)) = self.require_login(conn, packet).await else {
            return;
        };
        let req: FileDoneRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_error(conn, packet, "INVALID_JSON", &e, None).await,
        };
        if let Err(e) = validate_field(&req.file_id, "file_id", MAX_FIELD_LEN) {
            return self.send_error(conn, packet, "INVALID_FILE_ID", &e, None).await;
        }

        let notice = match self.files.finalize_upload(&req.file_id, &user_id).await {
            Ok(notice) => notice,
            Err(e) => {
                return self
                    .send_error(conn, packet, "FINALIZE_FAILED", &e.to_string(), None)
                    .await;
            }
        };
        info!("file {} finalized by {}", notice.file_id, user_id);

        // Ack to the uploader carries the canonical notice.
        let mut ack = match serde_json::to_value(&notice).unwrap() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ack.insert("status".into(), "ok".into());
        conn.send(&Packet::new(
            PacketType::FileDone,
            packet.request_id,
            Value::Object(ack).to_string(),
        ))
        .await;

        let notice_meta = serde_json::to_string(&notice).unwrap();
        let targets = match self.files.list_targets(&req.file_id) {
            Ok(targets) => targets,
            Err(e) => {
                warn!("list targets failed for {}: {}", req.file_id, e);
                return;
            }
        };
        let mut delivered = Vec::new();
        for target in targets {
            if target == user_id {
                // The uploader needs no notice beyond the ack.
                delivered.push(target);
                continue;
            }
            let Some(sender) = self.registry.sender_for_user(&target) else {
                continue;
            };
            let frame = wire::encode(&Packet::new(PacketType::FileDone, 0, notice_meta.clone()));
            if self.enqueue(&sender, frame) {
                delivered.push(target);
            }
        }
        for target in &delivered {
            if let Err(e) = self.files.mark_delivered(target, std::slice::from_ref(&req.file_id)) {
                warn!("mark file delivered failed for {}: {}", target, e);
            }
        }
    }

    async fn handle_file_download(&self, conn: &ConnectionHandle, packet: &Packet) {
        let Some((user_id, _)) = self.require_login(conn, packet).await else {
            return;
        };
        let req: FileDownloadRequest = match parse_meta(&packet.meta) {
            Ok(req) => req,
            Err(e) => return self.send_error(conn, packet, "INVALID_JSON", &e, None).await,
        };
        if let Err(e) = validate_field(&req.file_id, "file_id", MAX_FIELD_LEN) {
            return self.send_error(conn, packet, "INVALID_FILE_ID", &e, None).await;
        }

        match self.files.read_chunk(&req.file_id, &user_id, req.offset).await {
            Ok((data, notice)) => {
                let done = req.offset + data.len() as i64 >= notice.file_size;
                let meta = json!({
                    "file_id": notice.file_id,
                    "offset": req.offset,
                    "file_size": notice.file_size,
                    "file_name": notice.file_name,
                    "sha256": notice.sha256,
                    "done": done,
                })
                .to_string();
                conn.send(&Packet::with_binary(
                    PacketType::FileDownloadChunk,
                    packet.request_id,
                    meta,
                    data,
                ))
                .await;
            }
            Err(e) => {
                self.send_error(conn, packet, "DOWNLOAD_FAILED", &e.to_string(), None)
                    .await;
            }
        }
    }

    // ── Shared plumbing ─────────────────────────────────────────────────

    /// Resolve the target set of a conversation. Private targets must exist;
    /// group targets are the membership (sender excluded for messages,
    /// included for file notices).
    fn resolve_recipients(
        &self,
        sender_id: &str,
        conversation_type: &str,
        conversation_id: &str,
        include_sender: bool,
    ) -> Result<Vec<String>, (&'static str, String)> {
        match conversation_type {
            "private" => match self.auth.user_exists(conversation_id) {
                Ok(true) => Ok(vec![conversation_id.to_string()]),
                Ok(false) => Err(("TARGET_NOT_FOUND", "target user not found".to_string())),
                Err(e) => Err(("STORE_FAILED", e.to_string())),
            },
            "group" => {
                if let Err(e) = self.groups.user_role(sender_id, conversation_id) {
                    let code = match e {
                        GroupError::NotInGroup => "NOT_IN_GROUP",
                        _ => "STORE_FAILED",
                    };
                    return Err((code, e.to_string()));
                }
                let mut members = self
                    .groups
                    .members(conversation_id)
                    .map_err(|e| ("STORE_FAILED", e.to_string()))?;
                if !include_sender {
                    members.retain(|member| member != sender_id);
                }
                if members.is_empty() {
                    return Err(("NO_RECIPIENTS", "no recipients available".to_string()));
                }
                Ok(members)
            }
            _ => Err((
                "INVALID_CONVERSATION_TYPE",
                "use private or group".to_string(),
            )),
        }
    }

    async fn deliver_offline_messages(&self, user_id: &str, conn: &ConnectionHandle) {
        loop {
            let batch = match self.messages.fetch_undelivered(user_id, self.history_page_size) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("fetch offline messages failed: {}", e);
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }
            let mut delivered = Vec::with_capacity(batch.len());
            for message in &batch {
                let meta = serde_json::to_string(message).unwrap();
                conn.send(&Packet::new(PacketType::MessageDeliver, 0, meta)).await;
                delivered.push(message.message_id);
            }
            if let Err(e) = self.messages.mark_delivered(user_id, &delivered) {
                warn!("mark offline delivered failed: {}", e);
                return;
            }
        }
    }

    async fn deliver_offline_files(&self, user_id: &str, conn: &ConnectionHandle) {
        loop {
            let batch = match self.files.fetch_undelivered(user_id, self.history_page_size) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("fetch offline files failed: {}", e);
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }
            let mut delivered = Vec::with_capacity(batch.len());
            for notice in &batch {
                let meta = serde_json::to_string(notice).unwrap();
                conn.send(&Packet::new(PacketType::FileDone, 0, meta)).await;
                delivered.push(notice.file_id.clone());
            }
            if let Err(e) = self.files.mark_delivered(user_id, &delivered) {
                warn!("mark offline files delivered failed: {}", e);
                return;
            }
        }
    }

    fn broadcast_user_list(&self, except: Option<ConnId>) {
        let meta = json!({ "users": self.registry.online_users() }).to_string();
        let frame = wire::encode(&Packet::new(PacketType::UserListUpdate, 0, meta));
        for sender in self.registry.logged_in_senders(except) {
            self.enqueue(&sender, frame.clone());
        }
    }

    /// Best-effort fanout enqueue. A full queue drops the frame for that
    /// recipient only; the spool row keeps the message recoverable.
    fn enqueue(&self, sender: &mpsc::Sender<Bytes>, frame: Bytes) -> bool {
        match sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("recipient write queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn require_login(
        &self,
        conn: &ConnectionHandle,
        packet: &Packet,
    ) -> Option<(String, String)> {
        match self.registry.current_user(conn.conn_id) {
            Some(user) => Some(user),
            None => {
                self.send_error(conn, packet, "NOT_LOGGED_IN", "login required", None)
                    .await;
                None
            }
        }
    }

    async fn send_ok(&self, conn: &ConnectionHandle, packet: &Packet, extra: Value) {
        let mut meta = Map::new();
        meta.insert("status".into(), "ok".into());
        if let Value::Object(fields) = extra {
            meta.extend(fields);
        }
        conn.send(&Packet::new_raw(
            packet.packet_type,
            packet.request_id,
            Value::Object(meta).to_string(),
        ))
        .await;
    }

    async fn send_error(
        &self,
        conn: &ConnectionHandle,
        packet: &Packet,
        code: &str,
        message: &str,
        extra: Option<Value>,
    ) {
        conn.send(&Packet::new_raw(
            packet.packet_type,
            packet.request_id,
            error_envelope(code, message, extra),
        ))
        .await;
    }
}

fn error_envelope(code: &str, message: &str, extra: Option<Value>) -> String {
    let mut meta = Map::new();
    meta.insert("status".into(), "error".into());
    meta.insert("code".into(), code.into());
    meta.insert("message".into(), message.into());
    if let Some(Value::Object(fields)) = extra {
        meta.extend(fields);
    }
    Value::Object(meta).to_string()
}

fn parse_meta<T: DeserializeOwned>(meta: &str) -> Result<T, String> {
    serde_json::from_str(meta).map_err(|e| format!("invalid json: {e}"))
}

fn validate_field(value: &str, field: &str, max_len: usize) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{field} is required"));
    }
    if value.len() > max_len {
        return Err(format!("{field} too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_validation() {
        assert!(validate_field("alice", "user_id", MAX_FIELD_LEN).is_ok());
        assert_eq!(
            validate_field("", "user_id", MAX_FIELD_LEN).unwrap_err(),
            "user_id is required"
        );
        assert_eq!(
            validate_field(&"x".repeat(65), "user_id", MAX_FIELD_LEN).unwrap_err(),
            "user_id too long"
        );
    }

    #[test]
    fn error_envelope_carries_extras() {
        let meta = error_envelope("UPLOAD_FAILED", "offset mismatch", Some(json!({"expected_offset": 128})));
        let value: Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], "UPLOAD_FAILED");
        assert_eq!(value["expected_offset"], 128);
    }
}
