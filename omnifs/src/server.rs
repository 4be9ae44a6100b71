use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use serde_json::{json, Value};

use crate::error::{ErrorKind, FsError};
use crate::fs::OmniFs;
use crate::io::{BlockStorage, ContainerFile};
use crate::protocol::{Operation, Request, Response};
use crate::queue::{BoundedQueue, Closed};

/// Delivers the response of one request. Called exactly once, from whichever
/// thread served the request.
pub type Responder = Box<dyn FnOnce(Response) + Send>;

/// One queued request together with the way back to its client.
pub struct Unit {
    pub request: Request,
    pub respond: Responder,
}

/// Submits requests to a running [`Server`]. Cheap to clone.
#[derive(Clone)]
pub struct ServerHandle {
    queue: Arc<BoundedQueue<Unit>>,
}

impl ServerHandle {
    /// Queues a request, blocking while the queue is full. Once the server
    /// shuts down the responder is answered with an error instead.
    pub fn submit(&self, request: Request, respond: Responder) -> Result<(), FsError> {
        match self.queue.enqueue(Unit { request, respond }) {
            Ok(()) => Ok(()),
            Err(Closed(unit)) => {
                let err = FsError::invalid_op("server is shutting down");
                (unit.respond)(Response::error(&unit.request, &err));
                Err(err)
            }
        }
    }

    /// Submits a request and waits for its response.
    pub fn call(&self, request: Request) -> Result<Response, FsError> {
        let (tx, rx) = mpsc::channel();
        self.submit(
            request,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        )?;
        rx.recv()
            .map_err(|_| FsError::invalid_op("request dropped without a response"))
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// A fixed pool of workers serving one bounded queue.
pub struct Server<T: BlockStorage + Send + 'static = ContainerFile> {
    fs: Arc<OmniFs<T>>,
    queue: Arc<BoundedQueue<Unit>>,
    workers: Vec<JoinHandle<()>>,
    max_payload: usize,
}

impl<T: BlockStorage + Send + 'static> Server<T> {
    /// Spawns `workers` threads. With zero workers, queued requests are only
    /// served by [`Server::serve_one`] and on shutdown.
    pub fn start(
        fs: Arc<OmniFs<T>>,
        workers: usize,
        capacity: usize,
        max_payload: usize,
    ) -> std::io::Result<Self> {
        let queue = Arc::new(BoundedQueue::new(capacity));
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let fs = Arc::clone(&fs);
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("omnifs-worker-{}", id))
                .spawn(move || worker_loop(id, &fs, &queue, max_payload))?;
            handles.push(handle);
        }
        info!(
            "server started: {} workers, queue capacity {}",
            workers,
            queue.capacity()
        );
        Ok(Self {
            fs,
            queue,
            workers: handles,
            max_payload,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn fs(&self) -> &Arc<OmniFs<T>> {
        &self.fs
    }

    /// Serves one queued request on the calling thread, if there is one.
    pub fn serve_one(&self) -> bool {
        match self.queue.try_dequeue() {
            Some(unit) => {
                serve(&self.fs, unit, self.max_payload);
                true
            }
            None => false,
        }
    }

    /// Stops accepting requests, lets the workers finish what is queued and
    /// waits for them to exit.
    pub fn shutdown(self) {
        self.queue.close();
        for worker in self.workers {
            if worker.join().is_err() {
                error!("a worker thread panicked");
            }
        }
        while let Some(unit) = self.queue.try_dequeue() {
            serve(&self.fs, unit, self.max_payload);
        }
        info!("server stopped");
    }
}

fn worker_loop<T: BlockStorage>(
    id: usize,
    fs: &OmniFs<T>,
    queue: &BoundedQueue<Unit>,
    max_payload: usize,
) {
    debug!("worker {} running", id);
    while let Some(unit) = queue.dequeue() {
        serve(fs, unit, max_payload);
    }
    debug!("worker {} exiting", id);
}

fn serve<T: BlockStorage>(fs: &OmniFs<T>, unit: Unit, max_payload: usize) {
    let response = handle_request(fs, &unit.request, max_payload);
    (unit.respond)(response);
}

/// Decodes a request, runs it against the filesystem and builds the reply.
/// Errors never escape; they become error responses.
pub fn handle_request<T: BlockStorage>(
    fs: &OmniFs<T>,
    request: &Request,
    max_payload: usize,
) -> Response {
    let op = match request.operation() {
        Ok(op) => op,
        Err(e) => {
            warn!("rejected {} request: {}", request.operation, e);
            return Response::error(request, &e);
        }
    };
    if op.payload_len() > max_payload {
        return Response::failure(
            &request.operation,
            &request.request_id,
            ErrorKind::NoSpace,
            "data too large",
        );
    }
    let session = request.session();
    if op.requires_session() && session.is_empty() {
        return Response::error(request, &FsError::InvalidSession);
    }
    debug!("dispatching {} (request {})", request.operation, request.request_id);
    match dispatch(fs, &session, op) {
        Ok(data) => Response::success(request, data),
        Err(e) => {
            debug!("{} failed: {}", request.operation, e);
            Response::error(request, &e)
        }
    }
}

fn to_value<S: serde::Serialize>(value: S) -> Result<Value, FsError> {
    serde_json::to_value(value).map_err(|e| FsError::invalid_op(e.to_string()))
}

fn dispatch<T: BlockStorage>(
    fs: &OmniFs<T>,
    session: &str,
    op: Operation,
) -> Result<Value, FsError> {
    let data = match op {
        Operation::Login {
            user_index,
            password,
        } => {
            let info = fs.login(user_index, &password)?;
            json!({
                "session_id": info.session_id,
                "user_index": info.user.index,
                "username": info.user.username,
                "role": info.user.role,
            })
        }
        Operation::Logout => {
            fs.logout(session)?;
            json!({"message": "Logged out successfully"})
        }
        Operation::UserCreate {
            username,
            password,
            role,
        } => {
            let index = fs.user_create(session, &username, &password, role)?;
            json!({"user_index": index, "username": username})
        }
        Operation::UserDelete { user_index } => {
            fs.user_delete(session, user_index)?;
            json!({ "user_index": user_index })
        }
        Operation::UserList => {
            let users = fs.user_list(session)?;
            json!({"count": users.len(), "users": users})
        }
        Operation::FileCreate { path, data } => {
            fs.file_create(session, &path, data.as_bytes())?;
            json!({"path": path, "size": data.len()})
        }
        Operation::FileRead { path } => {
            let bytes = fs.file_read(session, &path)?;
            json!({
                "path": path,
                "size": bytes.len(),
                "data": String::from_utf8_lossy(&bytes),
            })
        }
        Operation::FileEdit { path, data, offset } => {
            fs.file_edit(session, &path, data.as_bytes(), offset)?;
            json!({"path": path, "offset": offset, "size": data.len()})
        }
        Operation::FileDelete { path } => {
            fs.file_delete(session, &path)?;
            json!({ "path": path })
        }
        Operation::FileTruncate { path, size } => {
            fs.file_truncate(session, &path, size)?;
            json!({"path": path, "size": size})
        }
        Operation::FileExists { path } => {
            let exists = fs.file_exists(session, &path)?;
            json!({"path": path, "exists": exists})
        }
        Operation::FileRename { old_path, new_path } => {
            fs.file_rename(session, &old_path, &new_path)?;
            json!({"old_path": old_path, "new_path": new_path})
        }
        Operation::DirCreate { path } => {
            fs.dir_create(session, &path)?;
            json!({ "path": path })
        }
        Operation::DirList { path } => {
            let entries = fs.dir_list(session, &path)?;
            json!({"path": path, "count": entries.len(), "entries": entries})
        }
        Operation::DirDelete { path } => {
            fs.dir_delete(session, &path)?;
            json!({ "path": path })
        }
        Operation::DirExists { path } => {
            let exists = fs.dir_exists(session, &path)?;
            json!({"path": path, "exists": exists})
        }
        Operation::GetMetadata { path } => to_value(fs.get_metadata(session, &path)?)?,
        Operation::SetPermissions { path, permissions } => {
            fs.set_permissions(session, &path, permissions)?;
            json!({"path": path, "permissions": permissions})
        }
        Operation::GetStats => to_value(fs.get_stats(session)?)?,
        Operation::SessionInfo => to_value(fs.session_info(session)?)?,
    };
    Ok(data)
}
