use crate::library::{
    network::socket_helpers::prepare_incoming_socket,
    pipeline::serve_connection,
    responses::{http_date, render_header},
    rio::{MAX_SOCKETS_PER_REACTOR, connection::Connection, error::IoFault, reactor::Reactor},
    server_internals::ServerInternal,
};
use core_affinity::CoreId;
use std::{
    io,
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread,
    time::Duration,
};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, error, info, warn};

const DEFAULT_URING_SIZE: u32 = 4096;

#[derive(Clone)]
pub struct Server {
    addr: String,
    workers: usize,
    uring_size: u32,
    max_sockets_per_reactor: usize,
    realtime: bool,
    pin_cores: bool,
}
impl ServerInternal for Server {}

/// A running server. Dropping it stops the worker pool; reactors and the
/// accept thread live until the process exits.
pub struct ServerHandle {
    local_addr: SocketAddr,
    reactors: Vec<Arc<Reactor>>,
    _runtime: Runtime,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn reactors(&self) -> &[Arc<Reactor>] {
        &self.reactors
    }

    pub fn connection_count(&self) -> usize {
        self.reactors.iter().map(|reactor| reactor.connection_count()).sum()
    }
}

// Public server endpoints
impl Server {
    pub fn new(addr: impl Into<String>) -> Server {
        Server {
            addr: addr.into(),
            workers: num_cpus::get().max(1),
            uring_size: DEFAULT_URING_SIZE,
            max_sockets_per_reactor: MAX_SOCKETS_PER_REACTOR,
            realtime: false,
            pin_cores: true,
        }
    }
    #[inline(always)]
    pub fn get_addr(&self) -> &str {
        &self.addr
    }
    #[inline(always)]
    pub fn get_workers(&self) -> usize {
        self.workers
    }
    #[inline(always)]
    pub fn set_workers(&mut self, workers: usize) -> &mut Self {
        self.workers = workers.max(1);
        self
    }
    #[inline(always)]
    pub fn get_uring_size(&self) -> u32 {
        self.uring_size
    }
    #[inline(always)]
    pub fn set_uring_size(&mut self, uring_size: u32) -> &mut Self {
        self.uring_size = uring_size;
        self
    }
    #[inline(always)]
    pub fn get_max_sockets_per_reactor(&self) -> usize {
        self.max_sockets_per_reactor
    }
    #[inline(always)]
    pub fn set_max_sockets_per_reactor(&mut self, max_sockets: usize) -> &mut Self {
        self.max_sockets_per_reactor = max_sockets.max(1);
        self
    }
    #[inline(always)]
    pub fn get_realtime(&self) -> bool {
        self.realtime
    }
    #[inline(always)]
    pub fn set_realtime(&mut self, enabled: bool) -> &mut Self {
        self.realtime = enabled;
        self
    }
    #[inline(always)]
    pub fn get_pin_cores(&self) -> bool {
        self.pin_cores
    }
    #[inline(always)]
    pub fn set_pin_cores(&mut self, enabled: bool) -> &mut Self {
        self.pin_cores = enabled;
        self
    }
    #[inline(always)]
    pub fn build(&mut self) -> Self {
        self.clone()
    }

    /// Boots reactors, the worker pool, the date timer and the accept thread.
    pub fn start(&self) -> Result<ServerHandle, IoFault> {
        let core_ids: Vec<CoreId> = if self.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut reactors: Vec<Arc<Reactor>> = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            info!("Reactor {} starting", id);
            let ring = self.build_ring(self.uring_size)?;
            let reactor = Reactor::new(id, ring, self.max_sockets_per_reactor)?;
            reactor.spawn(self.realtime, core_ids.get(id).copied())?;
            reactors.push(reactor);
        }

        // Consumers run here; reactors only ever wake them.
        let runtime: Runtime = Builder::new_multi_thread()
            .enable_time()
            .thread_name("Tachyon-pool")
            .build()?;
        runtime.spawn(refresh_dates(reactors.clone()));

        let listener: TcpListener = self.build_listener(&self.addr)?;
        let local_addr = listener.local_addr()?;
        let handle = runtime.handle().clone();
        let accept_reactors = reactors.clone();
        thread::Builder::new()
            .name("Tachyon-accept".to_string())
            .spawn(move || accept_loop(listener, accept_reactors, handle))?;
        info!("Listening on {} with {} reactors", local_addr, self.workers);

        Ok(ServerHandle {
            local_addr,
            reactors,
            _runtime: runtime,
        })
    }
}

fn accept_loop(listener: TcpListener, reactors: Vec<Arc<Reactor>>, runtime: Handle) {
    let mut next_id: u32 = 0;
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("Accept failed: {}", err);
                // Out of descriptors: give closing connections a moment.
                if matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                    thread::sleep(Duration::from_millis(10));
                }
                continue;
            }
        };
        let id = next_id;
        next_id = next_id.wrapping_add(1);
        // Same id, same reactor, for the connection's whole life.
        let reactor = &reactors[id as usize % reactors.len()];
        if let Err(err) = prepare_incoming_socket(&stream) {
            debug!("Connection {} from {} dropped: {}", id, peer, err);
            continue;
        }
        match Connection::accept(stream, id, Arc::clone(reactor)) {
            Ok(connection) => {
                runtime.spawn(serve_connection(connection));
            }
            Err(IoFault::PoolExhausted { capacity }) => warn!(
                "Connection {} from {} refused: reactor {} has all {} segments out",
                id,
                peer,
                reactor.id(),
                capacity
            ),
            Err(fault) => error!("Connection {} from {} failed: {}", id, peer, fault),
        }
    }
}

/// Renders the 200 header once a second and hands it to every reactor.
async fn refresh_dates(reactors: Vec<Arc<Reactor>>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let block = render_header(&http_date());
        for reactor in &reactors {
            reactor.headers().publish(block.clone());
            debug!(
                "Reactor {}: CONNS: {} FREE SEGMENTS: {}",
                reactor.id(),
                reactor.connection_count(),
                reactor.pool().available()
            );
        }
    }
}

pub fn run(server: Server) -> io::Result<()> {
    let _handle: ServerHandle = server.start().map_err(|fault| match fault {
        IoFault::Os(err) => err,
        other => io::Error::other(other),
    })?;
    // Main thread parks itself like a good coordinator
    loop {
        thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{
        responses::{BAD_REQUEST, BODY},
        uring::Ring,
    };
    use std::{
        io::{Read, Write},
        net::TcpStream,
        time::Instant,
    };

    const PIPELINED_PAIR: &[u8] = b"GET /plaintext HTTP/1.1\r\nHost: localhost\r\n\r\n\
GET /plaintext HTTP/1.1\r\nHost: localhost\r\n\r\n";

    fn io_uring_ready() -> bool {
        Ring::new(8)
            .map(|ring| ring.supports_socket_io())
            .unwrap_or(false)
    }

    fn start() -> Option<ServerHandle> {
        if !io_uring_ready() {
            return None;
        }
        let server = Server::new("127.0.0.1:0")
            .set_workers(2)
            .set_uring_size(256)
            .set_max_sockets_per_reactor(4)
            .set_pin_cores(false)
            .build();
        Some(server.start().unwrap())
    }

    fn connect(handle: &ServerHandle) -> TcpStream {
        let client = TcpStream::connect(handle.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
    }

    #[test]
    fn builder_keeps_settings() {
        let server = Server::new("0.0.0.0:5000")
            .set_workers(0)
            .set_uring_size(1024)
            .set_max_sockets_per_reactor(64)
            .set_realtime(true)
            .set_pin_cores(false)
            .build();
        assert_eq!(server.get_addr(), "0.0.0.0:5000");
        assert_eq!(server.get_workers(), 1);
        assert_eq!(server.get_uring_size(), 1024);
        assert_eq!(server.get_max_sockets_per_reactor(), 64);
        assert!(server.get_realtime());
        assert!(!server.get_pin_cores());
    }

    #[test]
    fn bad_listen_address_is_an_error() {
        let server = Server::new("not an address").set_workers(1).build();
        assert!(server.build_listener(server.get_addr()).is_err());
    }

    #[test]
    fn two_pipelined_gets_get_two_responses() {
        let Some(handle) = start() else { return };
        let mut client = connect(&handle);
        client.write_all(PIPELINED_PAIR).unwrap();

        let single = render_header(&http_date()).len() + BODY.len();
        let mut reply = vec![0u8; single * 2];
        client.read_exact(&mut reply).unwrap();
        let text = String::from_utf8(reply).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert_eq!(text.matches("Hello, World!").count(), 2);
        assert!(text.ends_with("Hello, World!"));

        // Keep-alive: the same connection answers again.
        client.write_all(&PIPELINED_PAIR[..PIPELINED_PAIR.len() / 2]).unwrap();
        let mut again = vec![0u8; single];
        client.read_exact(&mut again).unwrap();
        assert!(again.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn garbage_gets_400_then_close() {
        let Some(handle) = start() else { return };
        let mut client = connect(&handle);
        client.write_all(b"hello there\n").unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, BAD_REQUEST);
    }

    #[test]
    fn closed_clients_leave_their_reactor() {
        let Some(handle) = start() else { return };
        for _ in 0..3 {
            let mut client = connect(&handle);
            client.write_all(&PIPELINED_PAIR[..PIPELINED_PAIR.len() / 2]).unwrap();
            let mut reply = [0u8; 16];
            client.read_exact(&mut reply).unwrap();
        }
        // Everything but the two cached responses per reactor comes home.
        let capacity: usize = handle
            .reactors()
            .iter()
            .map(|reactor| reactor.pool().capacity() - 2)
            .sum();
        let free = || -> usize {
            handle
                .reactors()
                .iter()
                .map(|reactor| reactor.pool().available())
                .sum()
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while (handle.connection_count() != 0 || free() != capacity) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.connection_count(), 0);
        assert_eq!(free(), capacity);
    }
}
