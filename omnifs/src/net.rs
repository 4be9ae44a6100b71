use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ErrorKind;
use crate::protocol::{Request, Response};
use crate::server::ServerHandle;

/// Accepts connections and feeds their requests to a server. Every connection
/// carries exactly one newline terminated JSON request and gets one response,
/// read on a thread of its own.
pub struct TcpFrontend {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl TcpFrontend {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        server: ServerHandle,
        settings: &ServerConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let timeout = Duration::from_secs(settings.read_timeout_secs.max(1));
        let max_bytes = settings.max_request_bytes;

        let acceptor = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("omnifs-acceptor".to_string())
                .spawn(move || accept_loop(listener, server, &stop, timeout, max_bytes))?
        };
        info!("listening on {}", addr);
        Ok(Self {
            addr,
            stop,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting connections and waits for the acceptor to exit.
    pub fn shutdown(mut self) {
        self.stop_acceptor();
    }

    fn stop_acceptor(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            self.stop.store(true, Ordering::SeqCst);
            // Unblock the pending accept.
            let _ = TcpStream::connect(self.addr);
            if acceptor.join().is_err() {
                error!("acceptor thread panicked");
            }
            info!("stopped listening on {}", self.addr);
        }
    }
}

impl Drop for TcpFrontend {
    fn drop(&mut self) {
        self.stop_acceptor();
    }
}

fn accept_loop(
    listener: TcpListener,
    server: ServerHandle,
    stop: &AtomicBool,
    timeout: Duration,
    max_bytes: usize,
) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!("accept failed: {}", e);
                continue;
            }
        };
        // A silent client must not stall the acceptor.
        let server = server.clone();
        let spawned = thread::Builder::new()
            .name("omnifs-conn".to_string())
            .spawn(move || {
                if let Err(e) = handle_connection(stream, &server, timeout, max_bytes) {
                    warn!("connection failed: {}", e);
                }
            });
        if let Err(e) = spawned {
            error!("cannot spawn connection thread: {}", e);
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    server: &ServerHandle,
    timeout: Duration,
    max_bytes: usize,
) -> std::io::Result<()> {
    let peer = stream.peer_addr()?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut line = Vec::new();
    let limit = (max_bytes as u64).saturating_add(1);
    let mut reader = BufReader::new(stream.try_clone()?).take(limit);
    reader.read_until(b'\n', &mut line)?;
    if line.len() > max_bytes {
        return reply(
            stream,
            &Response::failure("unknown", "", ErrorKind::InvalidOperation, "request too large"),
        );
    }

    let request: Request = match serde_json::from_slice(&line) {
        Ok(request) => request,
        Err(e) => {
            warn!("malformed request from {}: {}", peer, e);
            return reply(
                stream,
                &Response::failure("unknown", "", ErrorKind::InvalidOperation, &e.to_string()),
            );
        }
    };
    debug!("{} from {}", request.operation, peer);

    // A refused submission has already been answered through the responder.
    let _ = server.submit(
        request,
        Box::new(move |response| {
            if let Err(e) = reply(stream, &response) {
                error!("failed to answer {}: {}", peer, e);
            }
        }),
    );
    Ok(())
}

fn reply(mut stream: TcpStream, response: &Response) -> std::io::Result<()> {
    let mut encoded = serde_json::to_vec(response)?;
    encoded.push(b'\n');
    stream.write_all(&encoded)?;
    stream.flush()?;
    stream.shutdown(Shutdown::Write)
}
