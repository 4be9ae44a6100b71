//! A virtual filesystem persisted inside a single container file.
//!
//! The container holds a header, a user table and a region of fixed-size
//! blocks. Files are stored in possibly fragmented block chains, directories
//! form a per-user jailed tree, and a small worker pool serves requests from
//! remote clients.

mod alloc;
mod avl;
pub mod config;
pub mod error;
mod fs;
pub mod io;
pub mod net;
mod node;
pub mod protocol;
pub mod queue;
mod sb;
pub mod server;
mod session;
mod users;

pub use crate::alloc::{BlockMeta, BlockStore, FileId};
pub use crate::avl::AvlTree;
pub use crate::config::Config;
pub use crate::error::{ErrorKind, FsError};
pub use crate::fs::{FileMetadata, FsStats, OmniFs, MAX_PERMISSIONS, SYSTEM_OWNER};
pub use crate::node::{normalize_path, EntryType, FileEntry, MAX_PATH_LEN};
pub use crate::sb::ContainerHeader;
pub use crate::server::{handle_request, Server, ServerHandle};
pub use crate::session::{SessionInfo, USERS_DIR};
pub use crate::users::{Role, UserSummary};
