use std::env;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::process;

use serde_json::{json, Value};

/// Usage: omnifs-client <host:port> <operation> [session id] [parameters as JSON]
///
/// Sends one request and prints the response.
pub fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "usage: {} <host:port> <operation> [session id] [parameters]",
            args[0]
        );
        process::exit(2);
    }

    let parameters: Value = match args.get(4) {
        Some(text) => serde_json::from_str(text).unwrap_or_else(|e| {
            eprintln!("parameters are not valid JSON: {}", e);
            process::exit(2);
        }),
        None => json!({}),
    };
    let request = json!({
        "operation": args[2],
        "session_id": args.get(3).cloned().unwrap_or_default(),
        "request_id": process::id().to_string(),
        "parameters": parameters,
    });

    match send(&args[1], &request) {
        Ok(response) => {
            let pretty = serde_json::to_string_pretty(&response).unwrap_or_default();
            println!("{}", pretty);
            if response["status"] != "success" {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("request failed: {}", e);
            process::exit(1);
        }
    }
}

fn send(addr: &str, request: &Value) -> std::io::Result<Value> {
    let mut stream = TcpStream::connect(addr)?;
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stream.write_all(&line)?;

    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply)?;
    log::debug!("received {} bytes", reply.len());
    Ok(serde_json::from_str(&reply)?)
}
