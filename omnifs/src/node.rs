use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::alloc::FileId;
use crate::avl::AvlTree;
use crate::error::FsError;

/// Longest path accepted from a caller, in bytes.
pub const MAX_PATH_LEN: usize = 256;

/// Permission bits given to every new node.
pub const DEFAULT_PERMISSIONS: u32 = 0o755;

/// Handle of a node inside a [`Namespace`]. Handles are only meaningful for
/// the namespace that issued them and are reused after removal.
pub type NodeId = usize;

/// The root directory always occupies the first slot.
pub const ROOT: NodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
}

#[derive(Debug)]
pub struct FsNode {
    pub name: String,
    /// Key of this node in its parent's id index.
    pub child_id: u64,
    pub entry_type: EntryType,
    pub owner: String,
    pub permissions: u32,
    /// Stored byte length. Always 0 for directories.
    pub size: u64,
    pub created_time: u64,
    pub modified_time: u64,
    pub inode: u32,
    /// Block list holding the payload. Empty files own no blocks.
    pub file_id: Option<FileId>,
    pub block_count: u32,
    parent: Option<NodeId>,
    children: Option<ChildIndex>,
}

impl FsNode {
    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Directory
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn child_count(&self) -> usize {
        self.children.as_ref().map_or(0, ChildIndex::len)
    }

    pub fn entry(&self) -> FileEntry {
        FileEntry {
            name: self.name.clone(),
            entry_type: self.entry_type,
            size: self.size,
            owner: self.owner.clone(),
            permissions: self.permissions,
            created_time: self.created_time,
            modified_time: self.modified_time,
            inode: self.inode,
        }
    }
}

/// A directory listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub size: u64,
    pub owner: String,
    pub permissions: u32,
    pub created_time: u64,
    pub modified_time: u64,
    pub inode: u32,
}

/// The two indices of a directory over its children. Both must hold the same
/// members, so every mutation goes through `insert` and `remove`.
#[derive(Debug, Default)]
struct ChildIndex {
    by_id: AvlTree<u64, NodeId>,
    by_name: AvlTree<String, u64>,
    next_low: u32,
}

impl ChildIndex {
    /// A random high half keeps ids unpredictable, the per-directory counter
    /// in the low half keeps them unique.
    fn next_id(&mut self) -> u64 {
        self.next_low = self.next_low.wrapping_add(1);
        let high: u32 = rand::thread_rng().gen();
        ((high as u64) << 32) | self.next_low as u64
    }

    fn insert(&mut self, name: &str, node: NodeId) -> Option<u64> {
        if self.by_name.contains_key(name) {
            return None;
        }
        let mut id = self.next_id();
        while self.by_id.contains_key(&id) {
            id = self.next_id();
        }
        self.by_id.insert(id, node);
        self.by_name.insert(name.to_string(), id);
        Some(id)
    }

    fn remove(&mut self, name: &str) -> Option<NodeId> {
        let id = self.by_name.remove(name)?;
        self.by_id.remove(&id)
    }

    fn get(&self, name: &str) -> Option<NodeId> {
        let id = self.by_name.get(name)?;
        self.by_id.get(id).copied()
    }

    fn len(&self) -> usize {
        self.by_name.len()
    }

    fn by_name(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.by_name
            .iter()
            .filter_map(move |(_, id)| self.by_id.get(id).copied())
    }

    fn is_consistent(&self) -> bool {
        self.by_id.len() == self.by_name.len()
            && self.by_name.iter().all(|(_, id)| self.by_id.contains_key(id))
            && self.by_id.is_balanced()
            && self.by_name.is_balanced()
    }
}

/// Checks a caller supplied absolute path and returns it in canonical form
/// with repeated separators collapsed.
pub fn normalize_path(path: &str) -> Result<String, FsError> {
    Ok(join_segments(&split_path(path)?))
}

/// Splits an absolute path into its segments. The root is the empty list.
pub fn split_path(path: &str) -> Result<Vec<&str>, FsError> {
    if path.is_empty() {
        return Err(FsError::invalid_path("empty path"));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(FsError::invalid_path(format!(
            "path longer than {} bytes",
            MAX_PATH_LEN
        )));
    }
    if !path.starts_with('/') {
        return Err(FsError::invalid_path(format!("{} is not absolute", path)));
    }
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in segments.iter() {
        validate_name(segment)?;
    }
    Ok(segments)
}

fn join_segments(segments: &[&str]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

fn validate_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::invalid_path(format!("bad segment {:?}", name)));
    }
    if name.contains('/') || name.chars().any(char::is_control) {
        return Err(FsError::invalid_path(format!(
            "segment {:?} contains forbidden characters",
            name
        )));
    }
    Ok(())
}

/// The directory tree. Nodes live in an arena; a directory owns its children
/// through its indices and every node points back at its parent by handle.
#[derive(Debug)]
pub struct Namespace {
    nodes: Vec<Option<FsNode>>,
    free_slots: Vec<NodeId>,
    next_inode: u32,
}

impl Namespace {
    pub fn new(root_owner: &str, now: u64) -> Self {
        let root = FsNode {
            name: String::new(),
            child_id: 0,
            entry_type: EntryType::Directory,
            owner: root_owner.to_string(),
            permissions: DEFAULT_PERMISSIONS,
            size: 0,
            created_time: now,
            modified_time: now,
            inode: 0,
            file_id: None,
            block_count: 0,
            parent: None,
            children: Some(ChildIndex::default()),
        };
        Self {
            nodes: vec![Some(root)],
            free_slots: Vec::new(),
            next_inode: 1,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&FsNode> {
        self.nodes.get(id)?.as_ref()
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut FsNode> {
        self.nodes.get_mut(id)?.as_mut()
    }

    fn node(&self, id: NodeId) -> Result<&FsNode, FsError> {
        self.get(id).ok_or(FsError::NotFound)
    }

    /// Links a new child under `parent`.
    pub fn create(
        &mut self,
        parent: NodeId,
        name: &str,
        entry_type: EntryType,
        owner: &str,
        now: u64,
    ) -> Result<NodeId, FsError> {
        validate_name(name)?;
        let parent_node = self.node(parent)?;
        match parent_node.children {
            None => {
                return Err(FsError::invalid_path(format!(
                    "{} is not a directory",
                    parent_node.name
                )))
            }
            Some(ref index) if index.get(name).is_some() => return Err(FsError::FileExists),
            Some(_) => (),
        }

        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.nodes.push(None);
                self.nodes.len() - 1
            }
        };
        let child_id = match self.index_mut(parent).and_then(|index| index.insert(name, slot)) {
            Some(id) => id,
            None => {
                self.free_slots.push(slot);
                return Err(FsError::FileExists);
            }
        };
        let inode = self.next_inode;
        self.next_inode = self.next_inode.wrapping_add(1);
        self.nodes[slot] = Some(FsNode {
            name: name.to_string(),
            child_id,
            entry_type,
            owner: owner.to_string(),
            permissions: DEFAULT_PERMISSIONS,
            size: 0,
            created_time: now,
            modified_time: now,
            inode,
            file_id: None,
            block_count: 0,
            parent: Some(parent),
            children: match entry_type {
                EntryType::Directory => Some(ChildIndex::default()),
                EntryType::File => None,
            },
        });
        Ok(slot)
    }

    fn index_mut(&mut self, dir: NodeId) -> Option<&mut ChildIndex> {
        self.get_mut(dir)?.children.as_mut()
    }

    pub fn find(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.get(parent)?.children.as_ref()?.get(name)
    }

    /// Unlinks a child and hands it back to the caller. Directories must be
    /// empty.
    pub fn remove(&mut self, parent: NodeId, name: &str) -> Result<FsNode, FsError> {
        let id = self.find(parent, name).ok_or(FsError::NotFound)?;
        if self.node(id)?.child_count() > 0 {
            return Err(FsError::DirectoryNotEmpty);
        }
        self.index_mut(parent)
            .and_then(|index| index.remove(name))
            .ok_or(FsError::NotFound)?;
        self.free_slots.push(id);
        self.nodes[id].take().ok_or(FsError::NotFound)
    }

    /// Walks an absolute path from the root.
    pub fn resolve(&self, path: &str) -> Result<NodeId, FsError> {
        let mut cur = ROOT;
        for segment in split_path(path)? {
            cur = self.find(cur, segment).ok_or(FsError::NotFound)?;
        }
        Ok(cur)
    }

    /// Resolves the directory that holds the last segment of `path` and
    /// returns it along with that segment.
    pub fn resolve_parent(&self, path: &str) -> Result<(NodeId, String), FsError> {
        let segments = split_path(path)?;
        let (name, dirs) = segments
            .split_last()
            .ok_or_else(|| FsError::invalid_path("the root has no parent"))?;
        let mut cur = ROOT;
        for segment in dirs {
            cur = self.find(cur, segment).ok_or(FsError::NotFound)?;
        }
        if !self.node(cur)?.is_dir() {
            return Err(FsError::invalid_path(format!(
                "{} is not a directory",
                self.full_path(cur)
            )));
        }
        Ok((cur, name.to_string()))
    }

    pub fn full_path(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut cur = self.get(id);
        while let Some(node) = cur {
            if node.parent.is_none() {
                break;
            }
            names.push(node.name.as_str());
            cur = node.parent.and_then(|p| self.get(p));
        }
        names.reverse();
        join_segments(&names)
    }

    fn is_ancestor(&self, ancestor: NodeId, mut id: NodeId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.get(id).and_then(FsNode::parent) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }

    /// Relinks a node under `new_parent` as `new_name`, updating the indices of
    /// both directories.
    pub fn move_node(
        &mut self,
        id: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<(), FsError> {
        validate_name(new_name)?;
        let old_parent = self
            .node(id)?
            .parent
            .ok_or_else(|| FsError::invalid_op("the root cannot be moved"))?;
        if !self.node(new_parent)?.is_dir() {
            return Err(FsError::invalid_path("target parent is not a directory"));
        }
        if self.find(new_parent, new_name).is_some() {
            return Err(FsError::FileExists);
        }
        if self.is_ancestor(id, new_parent) {
            return Err(FsError::invalid_op("cannot move a directory into itself"));
        }

        let old_name = self.node(id)?.name.clone();
        self.index_mut(old_parent)
            .and_then(|index| index.remove(&old_name))
            .ok_or(FsError::NotFound)?;
        let child_id = match self
            .index_mut(new_parent)
            .and_then(|index| index.insert(new_name, id))
        {
            Some(child_id) => child_id,
            None => {
                // Put the node back where it came from.
                if let Some(index) = self.index_mut(old_parent) {
                    if let Some(child_id) = index.insert(&old_name, id) {
                        if let Some(node) = self.get_mut(id) {
                            node.child_id = child_id;
                        }
                    }
                }
                return Err(FsError::FileExists);
            }
        };
        if let Some(node) = self.get_mut(id) {
            node.name = new_name.to_string();
            node.child_id = child_id;
            node.parent = Some(new_parent);
        }
        Ok(())
    }

    /// Children of a directory in name order.
    pub fn children(&self, dir: NodeId) -> Result<Vec<NodeId>, FsError> {
        match self.node(dir)?.children {
            Some(ref index) => Ok(index.by_name().collect()),
            None => Err(FsError::invalid_op("not a directory")),
        }
    }

    /// Live nodes other than the root.
    pub fn nodes(&self) -> impl Iterator<Item = &FsNode> + '_ {
        self.nodes.iter().skip(1).filter_map(Option::as_ref)
    }

    /// Checks that every directory's two indices agree and are balanced.
    pub fn check_indices(&self) -> bool {
        self.nodes
            .iter()
            .filter_map(Option::as_ref)
            .filter_map(|node| node.children.as_ref())
            .all(ChildIndex::is_consistent)
    }
}
