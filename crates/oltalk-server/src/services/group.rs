use std::sync::Arc;

use rusqlite::OptionalExtension;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{now_secs, Database};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("group not found")]
    NotFound,
    #[error("user not in group")]
    NotInGroup,
    #[error("user already in group")]
    AlreadyInGroup,
    #[error("{0}")]
    PermissionDenied(&'static str),
    #[error("{0}")]
    Store(String),
}

impl From<anyhow::Error> for GroupError {
    fn from(e: anyhow::Error) -> Self {
        GroupError::Store(e.to_string())
    }
}

/// Membership role. Exactly one member per group holds `Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "member" => Some(Role::Member),
            _ => None,
        }
    }
}

/// Group CRUD, membership and the role-gated administrative actions.
pub struct GroupService {
    db: Arc<Database>,
}

impl GroupService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a group with the actor as sole owner. Group row and owner
    /// membership commit together.
    pub fn create_group(&self, owner_id: &str, name: &str) -> Result<String, GroupError> {
        let group_id = Uuid::new_v4().simple().to_string();
        let now = now_secs();
        let gid = group_id.clone();
        let owner = owner_id.to_string();
        let name = name.to_string();
        self.db.with_tx(move |tx| {
            tx.execute(
                "INSERT INTO groups (group_id, name, owner_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![gid, name, owner, now],
            )?;
            tx.execute(
                "INSERT INTO group_members (group_id, user_id, role, joined_at)
                 VALUES (?1, ?2, 'owner', ?3)",
                rusqlite::params![gid, owner, now],
            )?;
            Ok(())
        })?;
        Ok(group_id)
    }

    pub fn join_group(&self, user_id: &str, group_id: &str) -> Result<(), GroupError> {
        if !self.group_exists(group_id)? {
            return Err(GroupError::NotFound);
        }
        match self.user_role(user_id, group_id) {
            Ok(_) => return Err(GroupError::AlreadyInGroup),
            Err(GroupError::NotInGroup) => {}
            Err(e) => return Err(e),
        }
        let user = user_id.to_string();
        let gid = group_id.to_string();
        self.db.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO group_members (group_id, user_id, role, joined_at)
                 VALUES (?1, ?2, 'member', ?3)",
                rusqlite::params![gid, user, now_secs()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn leave_group(&self, user_id: &str, group_id: &str) -> Result<(), GroupError> {
        let role = self.user_role(user_id, group_id)?;
        if role == Role::Owner {
            return Err(GroupError::PermissionDenied("owner cannot leave group"));
        }
        self.delete_member(group_id, user_id)
    }

    pub fn rename_group(
        &self,
        actor_id: &str,
        group_id: &str,
        new_name: &str,
    ) -> Result<(), GroupError> {
        self.require_owner_or_admin(actor_id, group_id)?;
        let gid = group_id.to_string();
        let name = new_name.to_string();
        self.db.with_conn(move |conn| {
            conn.execute(
                "UPDATE groups SET name = ?1 WHERE group_id = ?2",
                rusqlite::params![name, gid],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn kick_user(
        &self,
        actor_id: &str,
        group_id: &str,
        target_user_id: &str,
    ) -> Result<(), GroupError> {
        let actor_role = self.require_owner_or_admin(actor_id, group_id)?;
        let target_role = self.user_role(target_user_id, group_id)?;
        if target_role == Role::Owner {
            return Err(GroupError::PermissionDenied("cannot kick owner"));
        }
        if actor_role != Role::Owner && target_role == Role::Admin {
            return Err(GroupError::PermissionDenied("admin cannot kick another admin"));
        }
        self.delete_member(group_id, target_user_id)
    }

    /// Dissolve the group: message targets, group messages, members and the
    /// group row go in one transaction.
    pub fn dissolve_group(&self, actor_id: &str, group_id: &str) -> Result<(), GroupError> {
        let role = self.user_role(actor_id, group_id)?;
        if role != Role::Owner {
            return Err(GroupError::PermissionDenied("only owner can dissolve group"));
        }
        let gid = group_id.to_string();
        self.db.with_tx(move |tx| {
            tx.execute(
                "DELETE FROM message_targets WHERE message_id IN
                 (SELECT message_id FROM messages
                  WHERE conversation_type = 'group' AND conversation_id = ?1)",
                [&gid],
            )?;
            tx.execute(
                "DELETE FROM messages
                 WHERE conversation_type = 'group' AND conversation_id = ?1",
                [&gid],
            )?;
            tx.execute("DELETE FROM group_members WHERE group_id = ?1", [&gid])?;
            tx.execute("DELETE FROM groups WHERE group_id = ?1", [&gid])?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn set_admin(
        &self,
        actor_id: &str,
        group_id: &str,
        target_user_id: &str,
        make_admin: bool,
    ) -> Result<(), GroupError> {
        let role = self.user_role(actor_id, group_id)?;
        if role != Role::Owner {
            return Err(GroupError::PermissionDenied("only owner can change admin role"));
        }
        let target_role = self.user_role(target_user_id, group_id)?;
        if target_role == Role::Owner {
            return Err(GroupError::PermissionDenied("cannot change owner role"));
        }
        let new_role = if make_admin { Role::Admin } else { Role::Member };
        let gid = group_id.to_string();
        let target = target_user_id.to_string();
        self.db.with_conn(move |conn| {
            conn.execute(
                "UPDATE group_members SET role = ?1 WHERE group_id = ?2 AND user_id = ?3",
                rusqlite::params![new_role.as_str(), gid, target],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// All member user ids of a group, used for fanout target resolution.
    pub fn members(&self, group_id: &str) -> Result<Vec<String>, GroupError> {
        let gid = group_id.to_string();
        let members = self.db.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;
            let rows = stmt
                .query_map([&gid], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(members)
    }

    pub fn user_role(&self, user_id: &str, group_id: &str) -> Result<Role, GroupError> {
        let user = user_id.to_string();
        let gid = group_id.to_string();
        let role: Option<String> = self.db.with_conn(move |conn| {
            let role = conn
                .query_row(
                    "SELECT role FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                    rusqlite::params![gid, user],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(role)
        })?;
        let role = role.ok_or(GroupError::NotInGroup)?;
        Role::parse(&role).ok_or_else(|| GroupError::Store(format!("unknown role: {role}")))
    }

    fn require_owner_or_admin(&self, actor_id: &str, group_id: &str) -> Result<Role, GroupError> {
        let role = self.user_role(actor_id, group_id)?;
        if role == Role::Member {
            return Err(GroupError::PermissionDenied("permission denied"));
        }
        Ok(role)
    }

    fn group_exists(&self, group_id: &str) -> Result<bool, GroupError> {
        let gid = group_id.to_string();
        let exists = self.db.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM groups WHERE group_id = ?1",
                    [&gid],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })?;
        Ok(exists)
    }

    fn delete_member(&self, group_id: &str, user_id: &str) -> Result<(), GroupError> {
        let gid = group_id.to_string();
        let user = user_id.to_string();
        self.db.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                rusqlite::params![gid, user],
            )?;
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::message::{MessageInput, MessageService};

    fn service() -> (tempfile::TempDir, Arc<Database>, GroupService) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("test.db")).unwrap());
        let groups = GroupService::new(db.clone());
        (dir, db, groups)
    }

    #[test]
    fn create_makes_actor_owner_and_member() {
        let (_dir, _db, groups) = service();
        let gid = groups.create_group("alice", "rustaceans").unwrap();
        assert_eq!(gid.len(), 32);
        assert_eq!(groups.user_role("alice", &gid).unwrap(), Role::Owner);
        assert_eq!(groups.members(&gid).unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn join_and_double_join() {
        let (_dir, _db, groups) = service();
        let gid = groups.create_group("alice", "g").unwrap();

        groups.join_group("bob", &gid).unwrap();
        assert_eq!(groups.user_role("bob", &gid).unwrap(), Role::Member);
        assert_eq!(groups.join_group("bob", &gid), Err(GroupError::AlreadyInGroup));
        assert_eq!(groups.join_group("bob", "nope"), Err(GroupError::NotFound));
    }

    #[test]
    fn owner_cannot_leave_members_can() {
        let (_dir, _db, groups) = service();
        let gid = groups.create_group("alice", "g").unwrap();
        groups.join_group("bob", &gid).unwrap();

        assert_eq!(
            groups.leave_group("alice", &gid),
            Err(GroupError::PermissionDenied("owner cannot leave group"))
        );
        groups.leave_group("bob", &gid).unwrap();
        assert_eq!(groups.user_role("bob", &gid), Err(GroupError::NotInGroup));
    }

    #[test]
    fn kick_permission_matrix() {
        let (_dir, _db, groups) = service();
        let gid = groups.create_group("alice", "g").unwrap();
        for user in ["bob", "carol", "dave"] {
            groups.join_group(user, &gid).unwrap();
        }
        groups.set_admin("alice", &gid, "bob", true).unwrap();
        groups.set_admin("alice", &gid, "carol", true).unwrap();

        // A plain member cannot kick at all.
        assert_eq!(
            groups.kick_user("dave", &gid, "bob"),
            Err(GroupError::PermissionDenied("permission denied"))
        );
        // Nobody kicks the owner.
        assert_eq!(
            groups.kick_user("bob", &gid, "alice"),
            Err(GroupError::PermissionDenied("cannot kick owner"))
        );
        // Admin vs admin is refused, admin vs member works.
        assert_eq!(
            groups.kick_user("bob", &gid, "carol"),
            Err(GroupError::PermissionDenied("admin cannot kick another admin"))
        );
        groups.kick_user("bob", &gid, "dave").unwrap();
        // Owner may kick an admin.
        groups.kick_user("alice", &gid, "carol").unwrap();
        assert_eq!(groups.members(&gid).unwrap().len(), 2);
    }

    #[test]
    fn set_admin_is_owner_only_and_owner_is_immutable() {
        let (_dir, _db, groups) = service();
        let gid = groups.create_group("alice", "g").unwrap();
        groups.join_group("bob", &gid).unwrap();
        groups.join_group("carol", &gid).unwrap();
        groups.set_admin("alice", &gid, "bob", true).unwrap();

        assert_eq!(
            groups.set_admin("bob", &gid, "carol", true),
            Err(GroupError::PermissionDenied("only owner can change admin role"))
        );
        assert_eq!(
            groups.set_admin("alice", &gid, "alice", false),
            Err(GroupError::PermissionDenied("cannot change owner role"))
        );
        groups.set_admin("alice", &gid, "bob", false).unwrap();
        assert_eq!(groups.user_role("bob", &gid).unwrap(), Role::Member);
    }

    #[test]
    fn dissolve_cascades_messages_and_targets() {
        let (_dir, db, groups) = service();
        let messages = MessageService::new(db.clone());

        let gid = groups.create_group("alice", "g").unwrap();
        groups.join_group("bob", &gid).unwrap();
        groups.join_group("carol", &gid).unwrap();

        for text in ["one", "two", "three"] {
            let input = MessageInput {
                conversation_type: "group".into(),
                conversation_id: gid.clone(),
                sender_id: "alice".into(),
                sender_nickname: "Alice".into(),
                content: text.into(),
            };
            messages
                .store_message(&input, &["bob".into(), "carol".into()])
                .unwrap();
        }

        assert_eq!(
            groups.dissolve_group("bob", &gid),
            Err(GroupError::PermissionDenied("only owner can dissolve group"))
        );
        groups.dissolve_group("alice", &gid).unwrap();

        let (group_rows, member_rows, message_rows, target_rows) = db
            .with_conn(|conn| {
                let g: i64 = conn.query_row("SELECT COUNT(*) FROM groups", [], |r| r.get(0))?;
                let m: i64 =
                    conn.query_row("SELECT COUNT(*) FROM group_members", [], |r| r.get(0))?;
                let msg: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
                let t: i64 =
                    conn.query_row("SELECT COUNT(*) FROM message_targets", [], |r| r.get(0))?;
                Ok((g, m, msg, t))
            })
            .unwrap();
        assert_eq!((group_rows, member_rows, message_rows, target_rows), (0, 0, 0, 0));
    }
}
