// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! Worker threads: each one owns its own `SO_REUSEPORT` listener, its own
//! single-threaded Tokio runtime, and its own `Engine`. The kernel load-balances
//! accepted connections across the duplicate listeners, so workers need no
//! coordination with each other at all.
use std::net::SocketAddr;
use std::thread::JoinHandle;

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::config::ProxyConfig;
use crate::engine::{Engine, TcpConnector};

fn bind_reuseport(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Spawns `config.num_workers` OS threads, each running its own current-thread
/// runtime and `Engine`. Returns their join handles so the caller can wait for
/// a clean shutdown.
pub fn spawn_workers(config: ProxyConfig, shutdown: watch::Receiver<bool>) -> std::io::Result<Vec<JoinHandle<()>>> {
    let listen_addr = config.listen_addr.clone().unwrap_or_else(|| "0.0.0.0".to_string());
    let addr: SocketAddr = format!("{}:{}", listen_addr, config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid listen address: {}", e)))?;

    let mut handles = Vec::with_capacity(config.num_workers);
    for worker_id in 0..config.num_workers {
        let config = config.clone();
        let shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(format!("respshard-worker-{}", worker_id))
            .spawn(move || run_worker(worker_id, addr, config, shutdown))?;
        handles.push(handle);
    }
    Ok(handles)
}

fn run_worker(worker_id: usize, addr: SocketAddr, config: ProxyConfig, shutdown: watch::Receiver<bool>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(worker_id, error = %e, "failed to start worker runtime");
            return;
        },
    };

    runtime.block_on(async move {
        let std_listener = match bind_reuseport(addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "failed to bind listener");
                return;
            },
        };
        let listener = match TcpListener::from_std(std_listener) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "failed to adopt listener into the runtime");
                return;
            },
        };

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        tokio::task::spawn(accept_loop(worker_id, listener, incoming_tx, shutdown.clone()));

        let engine = Engine::new(&config, TcpConnector, incoming_rx, shutdown);
        tracing::info!(worker_id, %addr, "worker ready");
        engine.await;
        tracing::info!(worker_id, "worker shut down");
    });
}

async fn accept_loop(
    worker_id: usize,
    listener: TcpListener,
    incoming_tx: mpsc::UnboundedSender<tokio::net::TcpStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let _ = socket.set_nodelay(true);
                        tracing::debug!(worker_id, %peer, "accepted client connection");
                        if incoming_tx.send(socket).is_err() {
                            break;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(worker_id, error = %e, "accept failed");
                    },
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
