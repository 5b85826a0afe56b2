use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{DbError, DbResult};
use crate::replication::{build_sync_stream, ReplicationCluster, SyncRequest, MAX_STREAM_SIZE};

/// Master-side sync listener.
///
/// One blocking accept thread, one blocking thread per slave connection. A
/// slave keeps its connection open and sends one sync request per round;
/// each request is answered with one bounded stream built from the binlog.
pub struct SyncServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl SyncServer {
    pub fn start<A: ToSocketAddrs>(
        cluster: Arc<ReplicationCluster>,
        addr: A,
    ) -> DbResult<SyncServer> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));

        let accept_stop = stop.clone();
        let accept_thread = std::thread::Builder::new()
            .name("sync-server".to_string())
            .spawn(move || {
                for conn in listener.incoming() {
                    if accept_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match conn {
                        Ok(stream) => {
                            let cluster = cluster.clone();
                            let peer = stream
                                .peer_addr()
                                .map(|a| a.to_string())
                                .unwrap_or_else(|_| "unknown".to_string());
                            let spawned = std::thread::Builder::new()
                                .name("sync-conn".to_string())
                                .spawn(move || serve_connection(stream, &peer, cluster));
                            if let Err(e) = spawned {
                                error!("failed to spawn sync connection thread: {}", e);
                            }
                        }
                        Err(e) => {
                            error!("sync accept failed: {}", e);
                        }
                    }
                }
            })?;

        info!("Sync listener on {}", local_addr);
        Ok(SyncServer {
            local_addr,
            stop,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block on the accept loop (the server's main-thread mode).
    pub fn join(mut self) {
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }

    /// Stop accepting and wait for the accept thread. Connections already
    /// being served drain on their own when the slave disconnects.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // poke the blocking accept so it observes the flag
        let _ = TcpStream::connect(self.local_addr);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve_connection(stream: TcpStream, peer: &str, cluster: Arc<ReplicationCluster>) {
    debug!("slave connected from {}", peer);

    let read_half = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot clone sync stream for {}: {}", peer, e);
            return;
        }
    };
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;

    loop {
        let request = match SyncRequest::read_from(&mut reader) {
            Ok(r) => r,
            Err(DbError::IoError(_)) => {
                debug!("slave {} disconnected", peer);
                return;
            }
            Err(e) => {
                warn!("bad sync request from {}: {}", peer, e);
                return;
            }
        };

        let response = build_sync_stream(&cluster, &request, MAX_STREAM_SIZE);
        if let Err(e) = writer.write_all(&response) {
            debug!("write to slave {} failed: {}", peer, e);
            return;
        }
    }
}
