use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::alloc::{BlockStore, FileId};
use crate::config::Config;
use crate::error::FsError;
use crate::io::{BlockStorage, ContainerFile, ContainerFileBuilder};
use crate::node::{EntryType, FileEntry, Namespace, NodeId, ROOT};
use crate::sb::ContainerHeader;
use crate::session::{Actor, SessionInfo, SessionTable, USERS_DIR};
use crate::users::{
    validate_password, validate_username, RawUser, Role, UserRecord, UserRegistry, UserSummary,
    USER_RECORD_SIZE,
};

/// Owner of the root and of the users directory.
pub const SYSTEM_OWNER: &str = "system";

/// Largest permission value `set_permissions` accepts.
pub const MAX_PERMISSIONS: u32 = 0o7777;

pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Absolute path after jailing.
    pub path: String,
    pub entry: FileEntry,
    pub blocks_used: u32,
    /// Bytes reserved on disk, a whole number of blocks.
    pub actual_size: u64,
    pub start_block: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsStats {
    pub total_size: u64,
    pub used_space: u64,
    pub free_space: u64,
    pub total_files: u32,
    pub total_directories: u32,
    pub total_users: u32,
    pub active_sessions: u32,
    pub fragmentation: f64,
}

/// Everything guarded by the engine lock.
struct Core<T: BlockStorage> {
    dev: T,
    header: ContainerHeader,
    blocks: BlockStore,
    namespace: Namespace,
    users: UserRegistry,
}

impl<T: BlockStorage> Core<T> {
    fn new(dev: T, header: ContainerHeader, now: u64) -> Result<Self, FsError> {
        let mut namespace = Namespace::new(SYSTEM_OWNER, now);
        namespace.create(ROOT, USERS_DIR, EntryType::Directory, SYSTEM_OWNER, now)?;
        Ok(Self {
            blocks: BlockStore::new(header.total_blocks()),
            dev,
            header,
            namespace,
            users: UserRegistry::new(),
        })
    }

    fn block_size(&self) -> usize {
        self.header.block_size as usize
    }

    fn users_dir(&self) -> Result<NodeId, FsError> {
        self.namespace
            .find(ROOT, USERS_DIR)
            .ok_or_else(|| FsError::corrupt("users directory missing"))
    }

    /// Returns the home directory of `username`, creating it if needed.
    fn ensure_home(&mut self, username: &str, now: u64) -> Result<NodeId, FsError> {
        let users = self.users_dir()?;
        match self.namespace.find(users, username) {
            Some(home) => match self.namespace.get(home) {
                Some(node) if node.is_dir() => Ok(home),
                _ => Err(FsError::FileExists),
            },
            None => self
                .namespace
                .create(users, username, EntryType::Directory, username, now),
        }
    }

    fn bootstrap_admin(&mut self, now: u64) -> Result<u32, FsError> {
        let index = self.users.generate_index(&mut rand::thread_rng());
        let admin = UserRecord::new(
            index,
            &self.header.admin_username,
            &self.header.admin_password,
            Role::Admin,
            now,
        );
        self.users.add(admin)?;
        let username = self.header.admin_username.clone();
        self.ensure_home(&username, now)?;
        info!("bootstrapped admin {} with index {}", username, index);
        Ok(index)
    }

    /// Rewrites the whole user table: a big endian count followed by records.
    fn persist_users(&mut self) -> Result<(), FsError> {
        let count = self.users.len();
        if count > self.header.max_users as usize {
            return Err(FsError::NoSpace);
        }
        let mut table = Vec::with_capacity(4 + count * USER_RECORD_SIZE);
        table.extend_from_slice(&(count as u32).to_be_bytes());
        for user in self.users.records() {
            table.extend_from_slice(user.to_raw().encode());
        }
        self.dev
            .write_region(self.header.user_table_offset as u64, &table)?;
        debug!("wrote {} user records", count);
        Ok(())
    }

    fn load_users(&mut self) -> Result<(), FsError> {
        let offset = self.header.user_table_offset as u64;
        let mut count_buf = [0; 4];
        self.dev.read_region(offset, &mut count_buf)?;
        let count = u32::from_be_bytes(count_buf);
        if count > self.header.max_users {
            return Err(FsError::corrupt("user table count exceeds max_users"));
        }
        let mut records = vec![0; count as usize * USER_RECORD_SIZE];
        self.dev.read_region(offset + 4, &mut records)?;
        for chunk in records.chunks(USER_RECORD_SIZE) {
            let raw = RawUser::decode(chunk).ok_or_else(|| FsError::corrupt("short user record"))?;
            let user = UserRecord::from_raw(&raw)?;
            self.users
                .add(user)
                .map_err(|_| FsError::corrupt("user table holds conflicting records"))?;
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), FsError> {
        let encoded = self.header.serialize();
        self.dev.write_region(0, &encoded)?;
        Ok(())
    }

    /// Writes `data` along the file's block chain. Every block but the last is
    /// filled completely.
    fn write_payload(&mut self, file_id: FileId, data: &[u8]) -> Result<(), FsError> {
        let blocks = self
            .blocks
            .blocks_of(file_id)
            .ok_or(FsError::NotFound)?
            .to_vec();
        let block_size = self.block_size();
        if blocks.len() * block_size < data.len() {
            return Err(FsError::NoSpace);
        }
        for (chunk, &block) in data.chunks(block_size).zip(blocks.iter()) {
            self.dev.write_block(block as usize, chunk)?;
            if let Some(mut meta) = self.blocks.read_metadata(block) {
                meta.payload_len = chunk.len() as u32;
                self.blocks.write_metadata(block, meta);
            }
        }
        Ok(())
    }

    fn read_payload(&mut self, file_id: FileId) -> Result<Vec<u8>, FsError> {
        let blocks = self
            .blocks
            .blocks_of(file_id)
            .ok_or(FsError::NotFound)?
            .to_vec();
        let mut out = Vec::with_capacity(self.blocks.file_size(file_id) as usize);
        let mut buf = vec![0; self.block_size()];
        for block in blocks {
            let len = self
                .blocks
                .read_metadata(block)
                .map_or(0, |meta| meta.payload_len as usize);
            self.dev.read_block(block as usize, &mut buf[..len])?;
            out.extend_from_slice(&buf[..len]);
        }
        Ok(out)
    }

    /// Overwrites bytes inside the stored payload without changing its length.
    fn patch_payload(&mut self, file_id: FileId, offset: u64, data: &[u8]) -> Result<(), FsError> {
        let blocks = self
            .blocks
            .blocks_of(file_id)
            .ok_or(FsError::NotFound)?
            .to_vec();
        let block_size = self.block_size() as u64;
        let mut buf = vec![0; self.block_size()];
        let mut pos = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let block = *blocks
                .get((pos / block_size) as usize)
                .ok_or_else(|| FsError::corrupt("block chain shorter than file"))?;
            let within = (pos % block_size) as usize;
            let len = self
                .blocks
                .read_metadata(block)
                .map_or(0, |meta| meta.payload_len as usize);
            if within >= len {
                return Err(FsError::corrupt("block payload shorter than file"));
            }
            let take = remaining.len().min(len - within);
            self.dev.read_block(block as usize, &mut buf[..len])?;
            buf[within..within + take].copy_from_slice(&remaining[..take]);
            self.dev.write_block(block as usize, &buf[..len])?;
            remaining = &remaining[take..];
            pos += take as u64;
        }
        Ok(())
    }

    /// Resolves a jailed path and checks the actor may touch the node.
    fn authorized_node(&self, actor: &Actor, path: &str) -> Result<(String, NodeId), FsError> {
        let path = actor.jail(path)?;
        let id = self.namespace.resolve(&path)?;
        let node = self.namespace.get(id).ok_or(FsError::NotFound)?;
        actor.authorize(node)?;
        Ok((path, id))
    }

    /// Resolves the directory that will receive a new node and checks the
    /// actor may write to it.
    fn authorized_parent(
        &self,
        actor: &Actor,
        path: &str,
    ) -> Result<(String, NodeId, String), FsError> {
        let path = actor.jail(path)?;
        let (parent, name) = self.namespace.resolve_parent(&path)?;
        let node = self.namespace.get(parent).ok_or(FsError::NotFound)?;
        actor.authorize(node)?;
        if self.namespace.find(parent, &name).is_some() {
            return Err(FsError::FileExists);
        }
        Ok((path, parent, name))
    }

    fn file_node(&self, actor: &Actor, path: &str) -> Result<(String, NodeId), FsError> {
        let (path, id) = self.authorized_node(actor, path)?;
        match self.namespace.get(id) {
            Some(node) if !node.is_dir() => Ok((path, id)),
            _ => Err(FsError::invalid_op(format!("{} is not a file", path))),
        }
    }

    fn dir_node(&self, actor: &Actor, path: &str) -> Result<(String, NodeId), FsError> {
        let (path, id) = self.authorized_node(actor, path)?;
        match self.namespace.get(id) {
            Some(node) if node.is_dir() => Ok((path, id)),
            _ => Err(FsError::invalid_op(format!("{} is not a directory", path))),
        }
    }

    /// Refuses to unlink or move the root, the users directory and the home
    /// of any active user. A normal user's `/` is their home.
    fn check_movable(&self, id: NodeId, path: &str) -> Result<(), FsError> {
        let users = self.users_dir()?;
        let is_home = self.namespace.get(id).map_or(false, |node| {
            node.parent() == Some(users) && self.users.find_by_username(&node.name).is_some()
        });
        if id == ROOT || id == users || is_home {
            return Err(FsError::invalid_op(format!(
                "{} cannot be removed or moved",
                path
            )));
        }
        Ok(())
    }

    fn probe(&self, actor: &Actor, path: &str, entry_type: EntryType) -> Result<bool, FsError> {
        let path = actor.jail(path)?;
        match self.namespace.resolve(&path) {
            Ok(id) => Ok(self
                .namespace
                .get(id)
                .map_or(false, |node| node.entry_type == entry_type)),
            Err(FsError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A virtual filesystem inside a single container file.
///
/// The block store, namespace and user registry sit behind one engine lock.
/// Sessions live in their own table, which is never locked while the engine
/// lock is being acquired.
pub struct OmniFs<T: BlockStorage = ContainerFile> {
    core: Mutex<Core<T>>,
    sessions: SessionTable,
}

impl OmniFs<ContainerFile> {
    /// Creates or truncates the container at `path` and formats it.
    pub fn format<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self, FsError> {
        config.validate()?;
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let header = ContainerHeader::from_config(config, now())?;
        let dev = ContainerFileBuilder::from(fd)
            .with_data_offset(header.data_offset())
            .with_block_size(header.block_size as usize)
            .with_block_count(header.total_blocks() as usize)
            .build()?;
        info!("formatting container {}", path.as_ref().display());
        Self::create(dev, config)
    }

    /// Opens an existing container without touching its contents.
    pub fn mount<P: AsRef<Path>>(path: P) -> Result<Self, FsError> {
        let mut fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let mut buf = vec![0; ContainerHeader::ENCODED_LEN];
        fd.seek(SeekFrom::Start(0))?;
        fd.read_exact(&mut buf)?;
        let header = ContainerHeader::parse(&buf)?;

        let expected = header.data_offset()
            + header.total_blocks() as u64 * header.block_size as u64;
        if fd.metadata()?.len() < expected {
            return Err(FsError::corrupt("container file shorter than its header claims"));
        }
        let dev = ContainerFileBuilder::from(fd)
            .with_data_offset(header.data_offset())
            .with_block_size(header.block_size as usize)
            .with_block_count(header.total_blocks() as usize)
            // Don't reset initialized disk.
            .clear_medium(false)
            .build()?;
        info!("opening container {}", path.as_ref().display());
        Self::open(dev)
    }

    /// Opens the container if it exists and formats a new one otherwise.
    pub fn init<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self, FsError> {
        if path.as_ref().exists() {
            Self::mount(path)
        } else {
            Self::format(path, config)
        }
    }

    /// Consumes the instance and hands back the container file.
    pub fn into_file(self) -> File {
        let core = self
            .core
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        core.dev.into_file()
    }
}

impl<T: BlockStorage> OmniFs<T> {
    /// Initializes the filesystem onto owned block storage.
    ///
    /// # Layout
    /// ==========================================================
    /// | Header | User Table | reserved gap | Data Region ...   |
    /// ==========================================================
    pub fn create(dev: T, config: &Config) -> Result<Self, FsError> {
        let now = now();
        let header = ContainerHeader::from_config(config, now)?;
        if dev.block_size() != header.block_size as usize
            || dev.block_count() < header.total_blocks() as usize
        {
            return Err(FsError::InvalidConfig(
                "device geometry does not match configuration".to_string(),
            ));
        }
        let mut core = Core::new(dev, header, now)?;
        core.write_header()?;
        core.bootstrap_admin(now)?;
        core.persist_users()?;
        core.dev.sync_disk()?;
        info!(
            "formatted container: {} blocks of {} bytes, {} user slots",
            core.header.total_blocks(),
            core.header.block_size,
            core.header.max_users
        );
        Ok(Self::from_core(core))
    }

    /// Reads an initialized container. The device's metadata area must hold
    /// at least the header.
    pub fn open(mut dev: T) -> Result<Self, FsError> {
        let mut buf = vec![0; ContainerHeader::ENCODED_LEN];
        dev.read_region(0, &mut buf)?;
        let header = ContainerHeader::parse(&buf)?;
        if dev.block_size() != header.block_size as usize {
            return Err(FsError::corrupt("device block size differs from header"));
        }

        let now = now();
        let mut core = Core::new(dev, header, now)?;
        core.load_users()?;
        let active: Vec<String> = core
            .users
            .all_active()
            .into_iter()
            .map(|user| user.username.clone())
            .collect();
        for username in active.iter() {
            core.ensure_home(username, now)?;
        }
        if active.is_empty() {
            warn!("no active user found, restoring the bootstrap admin");
            core.bootstrap_admin(now)?;
            core.persist_users()?;
        }
        info!(
            "opened container with {} users ({} active)",
            core.users.len(),
            core.users.active_count()
        );
        Ok(Self::from_core(core))
    }

    fn from_core(core: Core<T>) -> Self {
        Self {
            core: Mutex::new(core),
            sessions: SessionTable::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core<T>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn header(&self) -> ContainerHeader {
        self.lock().header.clone()
    }

    /// Index of the active admin named in the header.
    pub fn admin_index(&self) -> Option<u32> {
        let core = self.lock();
        core.users
            .find_by_username(&core.header.admin_username)
            .filter(|user| user.role == Role::Admin)
            .map(|user| user.index)
    }

    pub fn sync(&self) -> Result<(), FsError> {
        self.lock().dev.sync_disk()?;
        Ok(())
    }

    /// Resolves the session, runs `op` under the engine lock and counts the
    /// operation if it succeeds.
    fn with_actor<R, F>(&self, session: &str, op: F) -> Result<R, FsError>
    where
        F: FnOnce(&mut Core<T>, &Actor, u64) -> Result<R, FsError>,
    {
        let index = self
            .sessions
            .user_of(session)
            .ok_or(FsError::InvalidSession)?;
        let now = now();
        let result = {
            let mut core = self.lock();
            let actor = core
                .users
                .find_by_index(index)
                .filter(|user| user.active)
                .map(Actor::from_record)
                .ok_or(FsError::InvalidSession)?;
            op(&mut *core, &actor, now)?
        };
        self.sessions.record_activity(session, now);
        Ok(result)
    }

    pub fn login(&self, user_index: u32, password: &str) -> Result<SessionInfo, FsError> {
        let now = now();
        let user = {
            let mut core = self.lock();
            let require_auth = core.header.require_auth;
            let user = match core.users.find_by_index_mut(user_index) {
                Some(user) if user.active => user,
                _ => {
                    warn!("login failed: user index {} not found", user_index);
                    return Err(FsError::NotFound);
                }
            };
            if !require_auth {
                warn!("authentication disabled, accepting {}", user.username);
            } else if !user.credential.verify(&user.username, password) {
                warn!("login failed: bad password for index {}", user_index);
                return Err(FsError::PermissionDenied);
            }
            user.last_login = now;
            let user = user.clone();
            core.persist_users()?;
            user
        };
        let session = self.sessions.open(user_index, now);
        info!("login: {} (index {})", user.username, user_index);
        Ok(SessionInfo::new(&session, &user))
    }

    pub fn logout(&self, session: &str) -> Result<(), FsError> {
        match self.sessions.remove(session) {
            Some(session) => {
                info!("logout: user index {}", session.user_index);
                Ok(())
            }
            None => Err(FsError::InvalidSession),
        }
    }

    pub fn session_info(&self, session: &str) -> Result<SessionInfo, FsError> {
        let user = self.with_actor(session, |core, actor, _| {
            core.users
                .find_by_index(actor.index)
                .cloned()
                .ok_or(FsError::InvalidSession)
        })?;
        let session = self.sessions.get(session).ok_or(FsError::InvalidSession)?;
        Ok(SessionInfo::new(&session, &user))
    }

    pub fn user_create(
        &self,
        session: &str,
        username: &str,
        password: &str,
        role: Role,
    ) -> Result<u32, FsError> {
        self.with_actor(session, |core, actor, now| {
            actor.require_admin()?;
            validate_username(username)?;
            validate_password(password)?;
            if core.users.len() >= core.header.max_users as usize {
                return Err(FsError::NoSpace);
            }
            let index = core.users.generate_index(&mut rand::thread_rng());
            core.users
                .add(UserRecord::new(index, username, password, role, now))?;
            if let Err(e) = core.ensure_home(username, now) {
                warn!("home directory for {} failed ({}), rolling back", username, e);
                core.users.deactivate(index);
                core.persist_users()?;
                return Err(FsError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("cannot create home directory for {}", username),
                )));
            }
            core.persist_users()?;
            info!("user created: {} (index {})", username, index);
            Ok(index)
        })
    }

    pub fn user_delete(&self, session: &str, user_index: u32) -> Result<(), FsError> {
        self.with_actor(session, |core, actor, _| {
            actor.require_admin()?;
            if actor.index == user_index {
                return Err(FsError::invalid_op("cannot delete the calling user"));
            }
            let username = match core.users.find_by_index(user_index) {
                Some(user) if user.active => user.username.clone(),
                _ => return Err(FsError::NotFound),
            };
            core.users.deactivate(user_index);
            core.persist_users()?;
            info!("user deleted: {} (index {})", username, user_index);
            Ok(())
        })?;
        let purged = self.sessions.purge_user(user_index);
        debug!("dropped {} sessions of user {}", purged, user_index);
        Ok(())
    }

    pub fn user_list(&self, session: &str) -> Result<Vec<UserSummary>, FsError> {
        self.with_actor(session, |core, actor, _| {
            actor.require_admin()?;
            Ok(core
                .users
                .all_active()
                .into_iter()
                .map(UserRecord::summary)
                .collect())
        })
    }

    pub fn file_create(&self, session: &str, path: &str, data: &[u8]) -> Result<(), FsError> {
        self.with_actor(session, |core, actor, now| {
            let (path, parent, name) = core.authorized_parent(actor, path)?;

            let block_size = core.block_size();
            let needed = (data.len() + block_size - 1) / block_size;
            let file_id = if needed == 0 {
                None
            } else {
                let file_id = core.blocks.allocate(needed as u32, now)?;
                if let Err(e) = core.write_payload(file_id, data) {
                    core.blocks.free(file_id);
                    return Err(e);
                }
                Some(file_id)
            };

            let id = match core
                .namespace
                .create(parent, &name, EntryType::File, &actor.username, now)
            {
                Ok(id) => id,
                Err(e) => {
                    if let Some(file_id) = file_id {
                        core.blocks.free(file_id);
                    }
                    return Err(e);
                }
            };
            if let Some(node) = core.namespace.get_mut(id) {
                node.size = data.len() as u64;
                node.file_id = file_id;
                node.block_count = needed as u32;
            }
            info!("file created: {} ({} bytes)", path, data.len());
            Ok(())
        })
    }

    pub fn file_read(&self, session: &str, path: &str) -> Result<Vec<u8>, FsError> {
        self.with_actor(session, |core, actor, _| {
            let (path, id) = core.file_node(actor, path)?;
            let file_id = core.namespace.get(id).and_then(|node| node.file_id);
            let data = match file_id {
                Some(file_id) => core.read_payload(file_id)?,
                None => Vec::new(),
            };
            debug!("file read: {} ({} bytes)", path, data.len());
            Ok(data)
        })
    }

    /// Overwrites `data.len()` bytes starting at `offset`. The range must lie
    /// inside the current file.
    pub fn file_edit(
        &self,
        session: &str,
        path: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<(), FsError> {
        self.with_actor(session, |core, actor, now| {
            let (path, id) = core.file_node(actor, path)?;
            let (size, file_id) = match core.namespace.get(id) {
                Some(node) => (node.size, node.file_id),
                None => return Err(FsError::NotFound),
            };
            let end = offset
                .checked_add(data.len() as u64)
                .ok_or_else(|| FsError::invalid_op("edit range overflows"))?;
            if end > size {
                return Err(FsError::invalid_op(format!(
                    "edit range {}..{} exceeds file size {}",
                    offset, end, size
                )));
            }
            if let Some(file_id) = file_id {
                core.patch_payload(file_id, offset, data)?;
            }
            if let Some(node) = core.namespace.get_mut(id) {
                node.modified_time = now;
            }
            info!("file edited: {} (offset {}, {} bytes)", path, offset, data.len());
            Ok(())
        })
    }

    pub fn file_delete(&self, session: &str, path: &str) -> Result<(), FsError> {
        self.with_actor(session, |core, actor, _| {
            let (path, id) = core.file_node(actor, path)?;
            let parent = core
                .namespace
                .get(id)
                .and_then(|node| node.parent())
                .ok_or(FsError::NotFound)?;
            let name = core
                .namespace
                .get(id)
                .map(|node| node.name.clone())
                .unwrap_or_default();
            let node = core.namespace.remove(parent, &name)?;
            if let Some(file_id) = node.file_id {
                core.blocks.free(file_id);
            }
            info!("file deleted: {}", path);
            Ok(())
        })
    }

    /// Shrinks a file to `size` bytes and releases the blocks it no longer
    /// needs.
    pub fn file_truncate(&self, session: &str, path: &str, size: u64) -> Result<(), FsError> {
        self.with_actor(session, |core, actor, now| {
            let (path, id) = core.file_node(actor, path)?;
            let (current, file_id) = match core.namespace.get(id) {
                Some(node) => (node.size, node.file_id),
                None => return Err(FsError::NotFound),
            };
            if size > current {
                return Err(FsError::invalid_op(format!(
                    "cannot grow {} from {} to {} bytes",
                    path, current, size
                )));
            }

            let block_size = core.block_size() as u64;
            let keep = ((size + block_size - 1) / block_size) as usize;
            let mut file_id = file_id;
            if let Some(fid) = file_id {
                core.blocks.shrink(fid, keep);
                if keep == 0 {
                    file_id = None;
                } else if let Some(&last) = core.blocks.blocks_of(fid).and_then(|b| b.last()) {
                    if let Some(mut meta) = core.blocks.read_metadata(last) {
                        meta.payload_len = (size - (keep as u64 - 1) * block_size) as u32;
                        meta.next_block = None;
                        core.blocks.write_metadata(last, meta);
                    }
                }
            }
            if let Some(node) = core.namespace.get_mut(id) {
                node.size = size;
                node.file_id = file_id;
                node.block_count = keep as u32;
                node.modified_time = now;
            }
            info!("file truncated: {} ({} -> {} bytes)", path, current, size);
            Ok(())
        })
    }

    pub fn file_exists(&self, session: &str, path: &str) -> Result<bool, FsError> {
        self.with_actor(session, |core, actor, _| {
            core.probe(actor, path, EntryType::File)
        })
    }

    /// Moves a file or directory to a new path.
    pub fn file_rename(
        &self,
        session: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<(), FsError> {
        self.with_actor(session, |core, actor, now| {
            let (old_path, id) = core.authorized_node(actor, old_path)?;
            core.check_movable(id, &old_path)?;
            let (new_path, parent, name) = core.authorized_parent(actor, new_path)?;
            core.namespace.move_node(id, parent, &name)?;
            if let Some(node) = core.namespace.get_mut(id) {
                node.modified_time = now;
            }
            info!("renamed: {} -> {}", old_path, new_path);
            Ok(())
        })
    }

    pub fn dir_create(&self, session: &str, path: &str) -> Result<(), FsError> {
        self.with_actor(session, |core, actor, now| {
            let (path, parent, name) = core.authorized_parent(actor, path)?;
            core.namespace
                .create(parent, &name, EntryType::Directory, &actor.username, now)?;
            info!("directory created: {}", path);
            Ok(())
        })
    }

    pub fn dir_list(&self, session: &str, path: &str) -> Result<Vec<FileEntry>, FsError> {
        self.with_actor(session, |core, actor, _| {
            let (path, id) = core.dir_node(actor, path)?;
            let entries: Vec<FileEntry> = core
                .namespace
                .children(id)?
                .into_iter()
                .filter_map(|child| core.namespace.get(child))
                .map(|node| node.entry())
                .collect();
            debug!("directory listed: {} ({} entries)", path, entries.len());
            Ok(entries)
        })
    }

    pub fn dir_delete(&self, session: &str, path: &str) -> Result<(), FsError> {
        self.with_actor(session, |core, actor, _| {
            let (path, id) = core.dir_node(actor, path)?;
            core.check_movable(id, &path)?;
            let (parent, name) = match core.namespace.get(id) {
                Some(node) => match node.parent() {
                    Some(parent) => (parent, node.name.clone()),
                    None => return Err(FsError::invalid_op("the root cannot be deleted")),
                },
                None => return Err(FsError::NotFound),
            };
            core.namespace.remove(parent, &name)?;
            info!("directory deleted: {}", path);
            Ok(())
        })
    }

    pub fn dir_exists(&self, session: &str, path: &str) -> Result<bool, FsError> {
        self.with_actor(session, |core, actor, _| {
            core.probe(actor, path, EntryType::Directory)
        })
    }

    pub fn get_metadata(&self, session: &str, path: &str) -> Result<FileMetadata, FsError> {
        self.with_actor(session, |core, actor, _| {
            let (path, id) = core.authorized_node(actor, path)?;
            let node = core.namespace.get(id).ok_or(FsError::NotFound)?;
            let start_block = node
                .file_id
                .and_then(|fid| core.blocks.blocks_of(fid))
                .and_then(|blocks| blocks.first().copied());
            Ok(FileMetadata {
                path,
                entry: node.entry(),
                blocks_used: node.block_count,
                actual_size: node.block_count as u64 * core.header.block_size as u64,
                start_block,
            })
        })
    }

    pub fn set_permissions(
        &self,
        session: &str,
        path: &str,
        permissions: u32,
    ) -> Result<(), FsError> {
        self.with_actor(session, |core, actor, now| {
            if permissions > MAX_PERMISSIONS {
                return Err(FsError::invalid_op(format!(
                    "permissions 0o{:o} out of range",
                    permissions
                )));
            }
            let (path, id) = core.authorized_node(actor, path)?;
            if let Some(node) = core.namespace.get_mut(id) {
                node.permissions = permissions;
                node.modified_time = now;
            }
            info!("permissions set: {} (0o{:o})", path, permissions);
            Ok(())
        })
    }

    pub fn get_stats(&self, session: &str) -> Result<FsStats, FsError> {
        let mut stats = self.with_actor(session, |core, _, _| {
            let mut files = 0;
            let mut dirs = 0;
            let mut used = 0;
            for node in core.namespace.nodes() {
                if node.is_dir() {
                    dirs += 1;
                } else {
                    files += 1;
                    used += node.size;
                }
            }
            Ok(FsStats {
                total_size: core.header.total_size,
                used_space: used,
                free_space: core.blocks.free_blocks() as u64 * core.header.block_size as u64,
                total_files: files,
                total_directories: dirs,
                total_users: core.users.active_count() as u32,
                active_sessions: 0,
                fragmentation: core.blocks.fragmentation(),
            })
        })?;
        stats.active_sessions = self.sessions.len() as u32;
        Ok(stats)
    }

    /// Checks the structural invariants of the in-memory state: balanced user
    /// tree and matching child indices in every directory.
    pub fn check_invariants(&self) -> bool {
        let core = self.lock();
        core.users.is_balanced() && core.namespace.check_indices()
    }

    /// Free data blocks left in the container.
    pub fn free_blocks(&self) -> u32 {
        self.lock().blocks.free_blocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
            .with_total_size(256 * 1024)
            .with_block_size(512)
            .with_max_users(4)
    }

    fn admin_session(fs: &OmniFs) -> String {
        let index = fs.admin_index().unwrap();
        fs.login(index, "password123").unwrap().session_id
    }

    #[test]
    fn formatted_container_has_users_dir_and_admin_home() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let fs = OmniFs::format(disk.path(), &config()).unwrap();
        let admin = admin_session(&fs);

        assert!(fs.dir_exists(&admin, "/users").unwrap());
        assert!(fs.dir_exists(&admin, "/users/admin").unwrap());
        assert!(!fs.file_exists(&admin, "/users").unwrap());
        assert!(fs.check_invariants());
    }

    #[test]
    fn fragmented_files_read_back_in_order() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let fs = OmniFs::format(disk.path(), &config()).unwrap();
        let admin = admin_session(&fs);

        fs.file_create(&admin, "/a", &[1; 512]).unwrap();
        fs.file_create(&admin, "/b", &[2; 512]).unwrap();
        fs.file_create(&admin, "/c", &[3; 512]).unwrap();
        // Punch holes so the next file spans non-adjacent blocks.
        fs.file_delete(&admin, "/a").unwrap();
        fs.file_delete(&admin, "/c").unwrap();

        let data: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
        fs.file_create(&admin, "/big", &data).unwrap();
        assert_eq!(fs.file_read(&admin, "/big").unwrap(), data);

        let meta = fs.get_metadata(&admin, "/big").unwrap();
        assert_eq!(meta.blocks_used, 3);
        assert_eq!(meta.actual_size, 3 * 512);
        assert_eq!(meta.start_block, Some(0));
    }

    #[test]
    fn edits_across_block_boundaries() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let fs = OmniFs::format(disk.path(), &config()).unwrap();
        let admin = admin_session(&fs);

        fs.file_create(&admin, "/f", &[b'a'; 1024]).unwrap();
        fs.file_edit(&admin, "/f", b"XYZW", 510).unwrap();

        let data = fs.file_read(&admin, "/f").unwrap();
        assert_eq!(&data[508..516], b"aaXYZWaa");
        assert_eq!(data.len(), 1024);
        assert!(matches!(
            fs.file_edit(&admin, "/f", b"xx", 1023),
            Err(FsError::InvalidOperation(_))
        ));
    }

    #[test]
    fn truncate_releases_trailing_blocks() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let fs = OmniFs::format(disk.path(), &config()).unwrap();
        let admin = admin_session(&fs);
        let before = fs.free_blocks();

        fs.file_create(&admin, "/f", &[7; 1500]).unwrap();
        assert_eq!(fs.free_blocks(), before - 3);

        fs.file_truncate(&admin, "/f", 600).unwrap();
        assert_eq!(fs.free_blocks(), before - 2);
        assert_eq!(fs.file_read(&admin, "/f").unwrap(), vec![7; 600]);

        fs.file_truncate(&admin, "/f", 0).unwrap();
        assert_eq!(fs.free_blocks(), before);
        assert!(fs.file_read(&admin, "/f").unwrap().is_empty());
        assert!(fs.file_truncate(&admin, "/f", 1).is_err());
    }

    #[test]
    fn operations_count_toward_session_activity() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let fs = OmniFs::format(disk.path(), &config()).unwrap();
        let admin = admin_session(&fs);

        fs.dir_create(&admin, "/d").unwrap();
        assert!(fs.dir_create(&admin, "/d").is_err());
        let info = fs.session_info(&admin).unwrap();
        // The failed call is not counted, session_info itself is.
        assert_eq!(info.operations_count, 2);
        assert_eq!(info.user.username, "admin");
    }

    #[test]
    fn permissions_are_range_checked() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let fs = OmniFs::format(disk.path(), &config()).unwrap();
        let admin = admin_session(&fs);

        fs.file_create(&admin, "/f", b"x").unwrap();
        fs.set_permissions(&admin, "/f", 0o600).unwrap();
        assert_eq!(fs.get_metadata(&admin, "/f").unwrap().entry.permissions, 0o600);
        assert!(matches!(
            fs.set_permissions(&admin, "/f", 0o10000),
            Err(FsError::InvalidOperation(_))
        ));
    }
}
