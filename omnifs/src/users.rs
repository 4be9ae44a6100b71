use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::avl::AvlTree;
use crate::error::FsError;

/// Size of one on-disk user record.
pub const USER_RECORD_SIZE: usize = 128;

/// Longest username a record can hold. One byte is kept for the terminator.
pub const MAX_USERNAME_LEN: usize = 31;
pub const MAX_PASSWORD_LEN: usize = 32;

const INDEX_RANGE: std::ops::RangeInclusive<u32> = 100_000..=999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Normal,
}

impl Role {
    fn to_raw(self) -> u32 {
        match self {
            Role::Admin => 0,
            Role::Normal => 1,
        }
    }

    fn from_raw(raw: u32) -> Option<Role> {
        match raw {
            0 => Some(Role::Admin),
            1 => Some(Role::Normal),
            _ => None,
        }
    }
}

/// SHA-256 digest of a username and password pair.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Credential([u8; 32]);

impl Credential {
    pub fn derive(username: &str, password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update(b":");
        hasher.update(password.as_bytes());
        Credential(hasher.finalize().into())
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        *self == Credential::derive(username, password)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(..)")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub index: u32,
    pub username: String,
    pub credential: Credential,
    pub role: Role,
    pub active: bool,
    pub created_time: u64,
    pub last_login: u64,
}

impl UserRecord {
    pub fn new(index: u32, username: &str, password: &str, role: Role, now: u64) -> Self {
        Self {
            index,
            username: username.to_string(),
            credential: Credential::derive(username, password),
            role,
            active: true,
            created_time: now,
            last_login: 0,
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            index: self.index,
            username: self.username.clone(),
            role: self.role,
            active: self.active,
            created_time: self.created_time,
            last_login: self.last_login,
        }
    }

    pub(crate) fn to_raw(&self) -> RawUser {
        let mut username = [0; 32];
        let name = self.username.as_bytes();
        let len = name.len().min(MAX_USERNAME_LEN);
        username[..len].copy_from_slice(&name[..len]);
        RawUser {
            index: self.index,
            role: self.role.to_raw(),
            active: self.active as u32,
            reserved0: 0,
            created_time: self.created_time,
            last_login: self.last_login,
            username,
            credential: self.credential.0,
            reserved1: [0; 32],
        }
    }

    pub(crate) fn from_raw(raw: &RawUser) -> Result<Self, FsError> {
        let end = raw.username.iter().position(|&b| b == 0).unwrap_or(32);
        let username = std::str::from_utf8(&raw.username[..end])
            .map_err(|_| FsError::corrupt("user record holds a non UTF-8 name"))?;
        let role =
            Role::from_raw(raw.role).ok_or_else(|| FsError::corrupt("user record role invalid"))?;
        Ok(Self {
            index: raw.index,
            username: username.to_string(),
            credential: Credential(raw.credential),
            role,
            active: raw.active != 0,
            created_time: raw.created_time,
            last_login: raw.last_login,
        })
    }
}

/// This structure __must be exactly 128 bytes.__
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone)]
pub(crate) struct RawUser {
    index: u32,
    role: u32,
    active: u32,
    reserved0: u32,
    created_time: u64,
    last_login: u64,
    username: [u8; 32],
    credential: [u8; 32],
    reserved1: [u8; 32],
}

impl RawUser {
    pub(crate) fn encode(&self) -> &[u8] {
        self.as_bytes()
    }

    pub(crate) fn decode(buf: &[u8]) -> Option<Self> {
        RawUser::read_from(buf.get(..USER_RECORD_SIZE)?)
    }
}

/// The client-visible view of a user. Credentials never leave the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub index: u32,
    pub username: String,
    pub role: Role,
    pub active: bool,
    pub created_time: u64,
    pub last_login: u64,
}

/// Accepts 1 to 31 bytes without separators or control characters. The name
/// must also work as a home directory name, so `.` and `..` are refused.
pub fn validate_username(username: &str) -> Result<(), FsError> {
    if username.is_empty() || username.len() > MAX_USERNAME_LEN {
        return Err(FsError::invalid_op("username must be 1 to 31 bytes"));
    }
    if username == "." || username == ".." {
        return Err(FsError::invalid_op("username cannot be . or .."));
    }
    if username.contains('/') || username.chars().any(char::is_control) {
        return Err(FsError::invalid_op("username contains forbidden characters"));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), FsError> {
    if password.is_empty() || password.len() > MAX_PASSWORD_LEN {
        return Err(FsError::invalid_op("password must be 1 to 32 bytes"));
    }
    Ok(())
}

/// Every user ever created, keyed by index. Deleted users stay in the tree as
/// inactive records.
#[derive(Default)]
pub struct UserRegistry {
    tree: AvlTree<u32, UserRecord>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self {
            tree: AvlTree::new(),
        }
    }

    /// Draws a random index not used by any record, active or not.
    pub fn generate_index<R: Rng>(&self, rng: &mut R) -> u32 {
        loop {
            let candidate = rng.gen_range(INDEX_RANGE);
            if !self.tree.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Fails if the index is taken or the username belongs to an active user.
    pub fn add(&mut self, user: UserRecord) -> Result<u32, FsError> {
        if user.active && self.find_by_username(&user.username).is_some() {
            return Err(FsError::invalid_op(format!(
                "username {} already exists",
                user.username
            )));
        }
        let index = user.index;
        if !self.tree.insert(index, user) {
            return Err(FsError::invalid_op(format!("user index {} in use", index)));
        }
        Ok(index)
    }

    pub fn find_by_index(&self, index: u32) -> Option<&UserRecord> {
        self.tree.get(&index)
    }

    pub fn find_by_index_mut(&mut self, index: u32) -> Option<&mut UserRecord> {
        self.tree.get_mut(&index)
    }

    /// Linear scan over the active records.
    pub fn find_by_username(&self, username: &str) -> Option<&UserRecord> {
        self.tree
            .iter()
            .map(|(_, user)| user)
            .find(|user| user.active && user.username == username)
    }

    pub fn deactivate(&mut self, index: u32) -> bool {
        match self.tree.get_mut(&index) {
            Some(user) if user.active => {
                user.active = false;
                true
            }
            _ => false,
        }
    }

    pub fn all_active(&self) -> Vec<&UserRecord> {
        self.records().filter(|user| user.active).collect()
    }

    /// Every record in index order, inactive ones included.
    pub fn records(&self) -> impl Iterator<Item = &UserRecord> + '_ {
        self.tree.iter().map(|(_, user)| user)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.records().filter(|user| user.active).count()
    }

    pub fn is_balanced(&self) -> bool {
        self.tree.is_balanced()
    }
}
