use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FsError;
use crate::node::{normalize_path, FsNode};
use crate::users::{Role, UserRecord, UserSummary};

/// Directory holding every user's home.
pub const USERS_DIR: &str = "users";

/// A logged-in user. The session only remembers the user's index; the record
/// itself is looked up again on every call.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub user_index: u32,
    pub login_time: u64,
    pub last_activity: u64,
    pub operations: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user: UserSummary,
    pub login_time: u64,
    pub last_activity: u64,
    pub operations_count: u64,
}

impl SessionInfo {
    pub fn new(session: &Session, user: &UserRecord) -> Self {
        Self {
            session_id: session.id.clone(),
            user: user.summary(),
            login_time: session.login_time,
            last_activity: session.last_activity,
            operations_count: session.operations,
        }
    }
}

/// Live sessions by id. The lock is only held for the duration of a single
/// lookup or update.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new session for `user_index` and returns a copy of it.
    pub fn open(&self, user_index: u32, now: u64) -> Session {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_index,
            login_time: now,
            last_activity: now,
            operations: 0,
        };
        self.lock().insert(session.id.clone(), session.clone());
        session
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.lock().remove(id)
    }

    pub fn user_of(&self, id: &str) -> Option<u32> {
        self.lock().get(id).map(|session| session.user_index)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    /// Counts one more completed operation.
    pub fn record_activity(&self, id: &str, now: u64) {
        if let Some(session) = self.lock().get_mut(id) {
            session.operations += 1;
            session.last_activity = now;
        }
    }

    /// Drops every session of a user, returning how many there were.
    pub fn purge_user(&self, user_index: u32) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, session| session.user_index != user_index);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// The user on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub index: u32,
    pub username: String,
    pub role: Role,
}

impl Actor {
    pub fn from_record(user: &UserRecord) -> Self {
        Self {
            index: user.index,
            username: user.username.clone(),
            role: user.role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn home(&self) -> String {
        format!("/{}/{}", USERS_DIR, self.username)
    }

    /// Rewrites a caller supplied path into the absolute path it addresses.
    /// Normal users are confined below their home unless the path already
    /// points into the users directory.
    pub fn jail(&self, path: &str) -> Result<String, FsError> {
        let path = normalize_path(path)?;
        if self.is_admin() || path.starts_with(&format!("/{}/", USERS_DIR)) {
            return Ok(path);
        }
        if path == "/" {
            Ok(self.home())
        } else {
            Ok(format!("{}{}", self.home(), path))
        }
    }

    pub fn authorize(&self, node: &FsNode) -> Result<(), FsError> {
        if self.is_admin() || node.owner == self.username {
            Ok(())
        } else {
            Err(FsError::PermissionDenied)
        }
    }

    pub fn require_admin(&self) -> Result<(), FsError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(FsError::PermissionDenied)
        }
    }
}
