//! Request and response shapes exchanged with clients.
//!
//! A request names an operation and carries its parameters as a JSON object.
//! For compatibility with older clients the session id is also accepted
//! inside the parameters.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, FsError};
use crate::users::Role;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub operation: String,
    /// Empty for `login`.
    #[serde(default)]
    pub session_id: String,
    /// Opaque token echoed back in the response.
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Success {
        operation: String,
        request_id: String,
        data: Value,
    },
    Error {
        operation: String,
        request_id: String,
        error_code: i32,
        error_message: String,
    },
}

impl Response {
    pub fn success(request: &Request, data: Value) -> Self {
        Response::Success {
            operation: request.operation.clone(),
            request_id: request.request_id.clone(),
            data,
        }
    }

    pub fn error(request: &Request, err: &FsError) -> Self {
        Response::failure(
            &request.operation,
            &request.request_id,
            err.kind(),
            &err.to_string(),
        )
    }

    pub fn failure(operation: &str, request_id: &str, kind: ErrorKind, message: &str) -> Self {
        Response::Error {
            operation: operation.to_string(),
            request_id: request_id.to_string(),
            error_code: kind.code(),
            error_message: message.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }

    /// The payload of a successful response.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Response::Success { data, .. } => Some(data),
            Response::Error { .. } => None,
        }
    }

    /// The wire code: 0 for success.
    pub fn code(&self) -> i32 {
        match self {
            Response::Success { .. } => ErrorKind::Success.code(),
            Response::Error { error_code, .. } => *error_code,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Response::Success { request_id, .. } | Response::Error { request_id, .. } => request_id,
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Login { user_index: u32, password: String },
    Logout,
    UserCreate {
        username: String,
        password: String,
        role: Role,
    },
    UserDelete { user_index: u32 },
    UserList,
    FileCreate { path: String, data: String },
    FileRead { path: String },
    FileEdit {
        path: String,
        data: String,
        offset: u64,
    },
    FileDelete { path: String },
    FileTruncate { path: String, size: u64 },
    FileExists { path: String },
    FileRename { old_path: String, new_path: String },
    DirCreate { path: String },
    DirList { path: String },
    DirDelete { path: String },
    DirExists { path: String },
    GetMetadata { path: String },
    SetPermissions { path: String, permissions: u32 },
    GetStats,
    SessionInfo,
}

impl Operation {
    pub fn requires_session(&self) -> bool {
        !matches!(self, Operation::Login { .. })
    }

    /// Bytes of file content carried by the request.
    pub fn payload_len(&self) -> usize {
        match self {
            Operation::FileCreate { data, .. } | Operation::FileEdit { data, .. } => data.len(),
            _ => 0,
        }
    }
}

#[derive(Deserialize)]
struct LoginParams {
    user_index: u32,
    password: String,
}

#[derive(Deserialize)]
struct UserCreateParams {
    username: String,
    password: String,
    #[serde(default = "default_role")]
    role: Role,
}

fn default_role() -> Role {
    Role::Normal
}

#[derive(Deserialize)]
struct UserIndexParams {
    user_index: u32,
}

#[derive(Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Deserialize)]
struct FileCreateParams {
    path: String,
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
struct FileEditParams {
    path: String,
    data: String,
    #[serde(alias = "index")]
    offset: u64,
}

#[derive(Deserialize)]
struct TruncateParams {
    path: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct RenameParams {
    old_path: String,
    new_path: String,
}

#[derive(Deserialize)]
struct PermissionParams {
    path: String,
    permissions: u32,
}

#[derive(Deserialize)]
struct SessionParams {
    #[serde(default)]
    session_id: String,
}

impl Request {
    pub fn new(operation: &str, session_id: &str, parameters: Value) -> Self {
        Self {
            operation: operation.to_string(),
            session_id: session_id.to_string(),
            request_id: String::new(),
            parameters,
        }
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = request_id.to_string();
        self
    }

    /// The session this request acts under.
    pub fn session(&self) -> String {
        if !self.session_id.is_empty() {
            return self.session_id.clone();
        }
        serde_json::from_value::<SessionParams>(self.parameters.clone())
            .map(|p| p.session_id)
            .unwrap_or_default()
    }

    fn params<P: DeserializeOwned>(&self) -> Result<P, FsError> {
        serde_json::from_value(self.parameters.clone()).map_err(|e| {
            FsError::invalid_op(format!("bad parameters for {}: {}", self.operation, e))
        })
    }

    fn path(&self) -> Result<String, FsError> {
        Ok(self.params::<PathParams>()?.path)
    }

    pub fn operation(&self) -> Result<Operation, FsError> {
        let op = match self.operation.as_str() {
            "login" => {
                let p: LoginParams = self.params()?;
                Operation::Login {
                    user_index: p.user_index,
                    password: p.password,
                }
            }
            "logout" => Operation::Logout,
            "user_create" => {
                let p: UserCreateParams = self.params()?;
                Operation::UserCreate {
                    username: p.username,
                    password: p.password,
                    role: p.role,
                }
            }
            "user_delete" => Operation::UserDelete {
                user_index: self.params::<UserIndexParams>()?.user_index,
            },
            "user_list" => Operation::UserList,
            "file_create" => {
                let p: FileCreateParams = self.params()?;
                Operation::FileCreate {
                    path: p.path,
                    data: p.data,
                }
            }
            "file_read" => Operation::FileRead { path: self.path()? },
            "file_edit" => {
                let p: FileEditParams = self.params()?;
                Operation::FileEdit {
                    path: p.path,
                    data: p.data,
                    offset: p.offset,
                }
            }
            "file_delete" => Operation::FileDelete { path: self.path()? },
            "file_truncate" => {
                let p: TruncateParams = self.params()?;
                Operation::FileTruncate {
                    path: p.path,
                    size: p.size,
                }
            }
            "file_exists" => Operation::FileExists { path: self.path()? },
            "file_rename" => {
                let p: RenameParams = self.params()?;
                Operation::FileRename {
                    old_path: p.old_path,
                    new_path: p.new_path,
                }
            }
            "dir_create" => Operation::DirCreate { path: self.path()? },
            "dir_list" => Operation::DirList { path: self.path()? },
            "dir_delete" => Operation::DirDelete { path: self.path()? },
            "dir_exists" => Operation::DirExists { path: self.path()? },
            "get_metadata" => Operation::GetMetadata { path: self.path()? },
            "set_permissions" => {
                let p: PermissionParams = self.params()?;
                Operation::SetPermissions {
                    path: p.path,
                    permissions: p.permissions,
                }
            }
            "get_stats" => Operation::GetStats,
            "session_info" => Operation::SessionInfo,
            other => return Err(FsError::NotImplemented(other.to_string())),
        };
        Ok(op)
    }
}
