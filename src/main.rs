#![allow(unsafe_op_in_unsafe_fn)]

use mimalloc::MiMalloc;
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod library;
use library::server::{self, Server};
use std::{env::args, process::exit, str::FromStr};
use tracing::{Level, error};
use tracing_subscriber::fmt;

const DEFAULT_PORT: u16 = 5000;

fn bootstrap_logs(level: Level) {
    fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false)
        .compact()
        .with_ansi(true)
        .init();
}

fn flag(name: &str) -> bool {
    args().any(|arg| arg == name)
}

/// `--name value`, parsed. Missing or garbage falls back to `default`.
fn flag_value<T: FromStr>(name: &str, default: T) -> T {
    let args: Vec<String> = args().collect();
    args.iter()
        .position(|arg| arg == name)
        .and_then(|at| args.get(at + 1))
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn main() {
    let level = if flag("--trace") {
        Level::TRACE
    } else if flag("--debug") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    bootstrap_logs(level);

    let port: u16 = flag_value("--port", DEFAULT_PORT);
    let server: Server = Server::new(format!("0.0.0.0:{port}"))
        .set_workers(flag_value("--workers", num_cpus::get()))
        .set_uring_size(4096)
        .set_realtime(flag("--realtime"))
        .build();

    if let Err(err) = server::run(server) {
        error!("Server failed to start: {}", err);
        exit(1);
    }
}
