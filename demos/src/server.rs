use std::env;
use std::io::BufRead;
use std::process;
use std::sync::Arc;

use log::{error, info};
use omnifs::net::TcpFrontend;
use omnifs::{Config, OmniFs, Server};

/// Usage: omnifs-server [config.json] [container path]
///
/// Serves until stdin is closed or reads `quit`.
pub fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Vec<String> = env::args().collect();

    let config = match args.get(1) {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    let container = args.get(2).map_or("omnifs.img", String::as_str);

    let fs = match OmniFs::init(container, &config) {
        Ok(fs) => fs,
        Err(e) => {
            error!("cannot open {}: {}", container, e);
            process::exit(1);
        }
    };
    if let Some(index) = fs.admin_index() {
        info!("admin {} has user index {}", config.security.admin_username, index);
    }

    let settings = &config.server;
    let server = Server::start(
        Arc::new(fs),
        settings.workers,
        settings.queue_capacity,
        settings.max_payload_bytes,
    )
    .unwrap_or_else(|e| {
        error!("cannot start workers: {}", e);
        process::exit(1);
    });
    let frontend = TcpFrontend::bind(("0.0.0.0", settings.port), server.handle(), settings)
        .unwrap_or_else(|e| {
            error!("cannot listen on port {}: {}", settings.port, e);
            process::exit(1);
        });
    info!("serving on {}", frontend.local_addr());

    for line in std::io::stdin().lock().lines() {
        match line {
            Ok(line) if line.trim() == "quit" => break,
            Ok(_) => (),
            Err(_) => break,
        }
    }

    frontend.shutdown();
    let fs = Arc::clone(server.fs());
    server.shutdown();
    if let Err(e) = fs.sync() {
        error!("final sync failed: {}", e);
    }
}
