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
//! The single-threaded event loop that drives one worker's clients and
//! backend connections to completion. `Engine` owns every piece of mutable
//! state a worker touches (no locks anywhere) and implements `Future`
//! directly: a current-thread runtime just polls it, the way it polls any
//! other task. The only suspension points are socket readability/writability
//! and a once-a-second shutdown check.
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch};

use crate::backend::{Backend, BackendConnection, BackendId, BackendTable};
use crate::client::{Client, ClientId, ClientTable};
use crate::config::ProxyConfig;
use crate::dispatch::{self, CommandTableEntry, ForwardAllPolicy, PartitionPolicy};
use crate::errors::ProxyError;
use crate::link::{self, CollectionPolicy, LinkId, ResponseLinks};
use crate::protocol::{Command, RefCommand, Response};
use crate::ring::{BackendSpec, Ring};

const READ_CHUNK: usize = 8192;

/// Abstracts opening a fresh connection to a backend, so `Engine` doesn't
/// need to know whether `S` is a real `TcpStream` or a test double.
pub trait BackendConnector<S>: Send + 'static {
    fn connect(&self, spec: &BackendSpec) -> Pin<Box<dyn Future<Output = std::io::Result<S>> + Send>>;
}

/// Opens real TCP connections to backends; used by worker threads in
/// production.
pub struct TcpConnector;

impl BackendConnector<tokio::net::TcpStream> for TcpConnector {
    fn connect(&self, spec: &BackendSpec) -> Pin<Box<dyn Future<Output = std::io::Result<tokio::net::TcpStream>> + Send>> {
        let host = spec.host.clone();
        let port = spec.port;
        Box::pin(async move { tokio::net::TcpStream::connect((host.as_str(), port)).await })
    }
}

#[derive(Debug, Default)]
struct EngineStats {
    clients_connected: u64,
}

/// Owns every client, every backend connection, and every in-flight response
/// link for one worker. Implements `Future<Output = ()>`, resolving once a
/// shutdown has been requested and every client has disconnected.
pub struct Engine<S, C> {
    ring: Ring,
    clients: ClientTable<S>,
    backends: BackendTable<S>,
    links: ResponseLinks,
    disabled_commands: std::collections::HashSet<String>,

    connector: C,
    connecting: FnvHashMap<BackendId, Pin<Box<dyn Future<Output = std::io::Result<S>> + Send>>>,
    // Sub-commands queued for a backend that isn't connected yet, in send
    // order; drained into the real connection once it opens.
    pending_sends: FnvHashMap<BackendId, std::collections::VecDeque<(LinkId, BytesMut)>>,
    pending_tail: FnvHashMap<BackendId, LinkId>,

    incoming: mpsc::UnboundedReceiver<S>,
    shutdown: watch::Receiver<bool>,
    shutdown_timer: tokio::time::Interval,

    next_client_seq: u64,
    stats: EngineStats,
}

impl<S, C> Engine<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: BackendConnector<S>,
{
    pub fn new(
        config: &ProxyConfig,
        connector: C,
        incoming: mpsc::UnboundedReceiver<S>,
        shutdown: watch::Receiver<bool>,
    ) -> Engine<S, C> {
        let specs = config.backend_specs();
        let ring = Ring::new(specs.clone(), config.hash_tags());
        let backends = BackendTable::new(specs);
        Engine {
            ring,
            clients: ClientTable::new(),
            backends,
            links: ResponseLinks::new(),
            disabled_commands: config.disable_commands_uppercase(),
            connector,
            connecting: FnvHashMap::default(),
            pending_sends: FnvHashMap::default(),
            pending_tail: FnvHashMap::default(),
            incoming,
            shutdown,
            shutdown_timer: tokio::time::interval(std::time::Duration::from_secs(1)),
            next_client_seq: 0,
            stats: EngineStats::default(),
        }
    }

    fn add_client(&mut self, socket: S) -> ClientId {
        self.next_client_seq += 1;
        let debug_name = format!("client#{}", self.next_client_seq);
        let id = self.clients.insert(Client::new(socket, debug_name));
        self.stats.clients_connected += 1;
        id
    }

    fn tick(&mut self, cx: &mut Context<'_>) -> bool {
        while let Poll::Ready(item) = Pin::new(&mut self.incoming).poll_recv(cx) {
            match item {
                Some(socket) => {
                    self.add_client(socket);
                },
                None => break,
            }
        }

        self.poll_backend_connects(cx);

        let client_ids: Vec<ClientId> = self.clients.iter().map(|(id, _)| id).collect();
        for id in client_ids {
            self.poll_client(cx, id);
        }

        let backend_ids: Vec<BackendId> = (0..self.backends.len()).collect();
        for id in backend_ids {
            self.poll_backend(cx, id);
        }

        // Keeps the task woken at least once a second so a shutdown request can
        // be observed even while every socket is quiet.
        let _ = self.shutdown_timer.poll_tick(cx);

        *self.shutdown.borrow() && self.clients.is_empty()
    }

    // -- client side -----------------------------------------------------

    fn poll_client(&mut self, cx: &mut Context<'_>, id: ClientId) {
        self.read_from_client(cx, id);
        self.process_client_commands(id);
        self.flush_client_writes(cx, id);
        self.maybe_disconnect_client(id);
    }

    fn read_from_client(&mut self, cx: &mut Context<'_>, id: ClientId) {
        let Some(client) = self.clients.get_mut(id) else { return };
        if client.should_disconnect() {
            return;
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let mut read_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut client.socket).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        client.mark_should_disconnect();
                        break;
                    }
                    client.read_buf.extend_from_slice(read_buf.filled());
                    if n < chunk.len() {
                        break;
                    }
                },
                Poll::Ready(Err(_)) => {
                    client.mark_should_disconnect();
                    break;
                },
                Poll::Pending => break,
            }
        }
    }

    fn process_client_commands(&mut self, id: ClientId) {
        loop {
            let command = {
                let Some(client) = self.clients.get_mut(id) else { return };
                if client.should_disconnect() {
                    return;
                }
                match client.parser.parse(&mut client.read_buf) {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => return,
                    Err(_) => {
                        client.mark_should_disconnect();
                        return;
                    },
                }
            };
            if let Some(client) = self.clients.get_mut(id) {
                client.note_command_received();
            } else {
                return;
            }
            self.dispatch_command(id, command);
            if !self.clients.contains(id) {
                return;
            }
        }
    }

    fn flush_client_writes(&mut self, cx: &mut Context<'_>, id: ClientId) {
        let Some(client) = self.clients.get_mut(id) else { return };
        while !client.write_buf.is_empty() {
            match Pin::new(&mut client.socket).poll_write(cx, &client.write_buf) {
                Poll::Ready(Ok(0)) => {
                    client.mark_should_disconnect();
                    return;
                },
                Poll::Ready(Ok(n)) => {
                    use bytes::Buf;
                    client.write_buf.advance(n);
                },
                Poll::Ready(Err(_)) => {
                    client.mark_should_disconnect();
                    return;
                },
                Poll::Pending => return,
            }
        }
        let _ = Pin::new(&mut client.socket).poll_flush(cx);
    }

    fn maybe_disconnect_client(&mut self, id: ClientId) {
        let should = match self.clients.get(id) {
            Some(c) => c.should_disconnect() && c.write_buf.is_empty(),
            None => false,
        };
        if should {
            self.disconnect_client(id);
        }
    }

    /// A client hung up (or was told to) with links still outstanding:
    /// detach `client` from each one so later backend replies are still
    /// consumed and discarded, but drop any that are already ready.
    fn disconnect_client(&mut self, id: ClientId) {
        if !self.clients.contains(id) {
            return;
        }
        let client = self.clients.remove(id);
        let mut cursor = client.head_link();
        while let Some(link) = cursor {
            if !self.links.contains(link) {
                break;
            }
            let next = self.links.client_next(link);
            self.links.get_mut(link).set_client(None);
            if self.links.is_ready(link) {
                self.links.discard(link);
            }
            cursor = next;
        }
    }

    /// Walks a client's response chain from the head, sending every
    /// already-ready link's combined response in order, stopping at the
    /// first link still waiting on a backend.
    fn flush_client(&mut self, client_id: ClientId) {
        loop {
            let head = match self.clients.get(client_id) {
                Some(c) => c.head_link(),
                None => return,
            };
            let Some(link) = head else { return };
            if !self.links.contains(link) || !self.links.is_ready(link) {
                return;
            }
            let next = self.links.client_next(link);
            let response = self.links.take_ready_response(link);
            let Some(client) = self.clients.get_mut(client_id) else { return };
            client.pop_ready_link(next);
            client.note_response_sent();
            response.encode(&mut client.write_buf);
        }
    }

    fn respond_immediately(&mut self, client_id: ClientId, response: Response) {
        if !self.clients.contains(client_id) {
            return;
        }
        let link = self.links.create_error(client_id, response);
        self.link_into_client_chain(client_id, link);
        self.flush_client(client_id);
    }

    fn link_into_client_chain(&mut self, client_id: ClientId, link: LinkId) {
        if let Some(client) = self.clients.get_mut(client_id) {
            let prev_tail = client.push_link(link);
            self.links.append_to_client_chain(link, prev_tail);
        }
    }

    fn new_link(&mut self, client_id: ClientId, policy: CollectionPolicy) -> LinkId {
        let link = self.links.create(policy, client_id);
        self.link_into_client_chain(client_id, link);
        link
    }

    // -- backend connection management ------------------------------------

    fn ensure_connecting(&mut self, backend_id: BackendId) {
        let backend = self.backends.get_mut(backend_id);
        if backend.is_connected() || backend.is_connecting() {
            return;
        }
        backend.mark_connecting();
        let spec = backend.spec().clone();
        let fut = self.connector.connect(&spec);
        self.connecting.insert(backend_id, fut);
    }

    fn poll_backend_connects(&mut self, cx: &mut Context<'_>) {
        let ids: Vec<BackendId> = self.connecting.keys().copied().collect();
        for id in ids {
            let Some(mut fut) = self.connecting.remove(&id) else { continue };
            match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(socket)) => {
                    let mut conn = BackendConnection::new(socket);
                    if let Some(queued) = self.pending_sends.remove(&id) {
                        for (link, bytes) in queued {
                            conn.push_link(link);
                            conn.write_buf.extend_from_slice(&bytes);
                            conn.note_command_sent();
                        }
                    }
                    self.pending_tail.remove(&id);
                    self.backends.get_mut(id).attach(conn);
                },
                Poll::Ready(Err(_)) => {
                    self.backends.get_mut(id).take_connection();
                    if let Some(queued) = self.pending_sends.remove(&id) {
                        for (link, _) in queued {
                            self.finish_failed_backend_link(link, id);
                        }
                    }
                    self.pending_tail.remove(&id);
                },
                Poll::Pending => {
                    self.connecting.insert(id, fut);
                },
            }
        }
    }

    fn finish_failed_backend_link(&mut self, link: LinkId, backend_id: BackendId) {
        self.links.fail_backend(link, backend_id);
        if self.links.is_ready(link) {
            match self.links.get(link).client() {
                Some(cid) => self.flush_client(cid),
                None => self.links.discard(link),
            }
        }
    }

    /// Queues (or, if the connection is live, sends immediately) one
    /// already-encoded sub-command on `backend_id`'s behalf of `link`.
    fn send_subcommand(&mut self, link: LinkId, backend_id: BackendId, encoded: BytesMut) {
        let backend_tail = match self.backends.get(backend_id).connection() {
            Some(conn) => conn.tail_link(),
            None => self.pending_tail.get(&backend_id).copied(),
        };
        self.links.link_to_backend(link, backend_id, backend_tail);

        if let Some(conn) = self.backends.get_mut(backend_id).connection_mut() {
            conn.push_link(link);
            conn.write_buf.extend_from_slice(&encoded);
            conn.note_command_sent();
        } else {
            self.pending_sends.entry(backend_id).or_default().push_back((link, encoded));
            self.pending_tail.insert(backend_id, link);
            self.ensure_connecting(backend_id);
        }
    }

    fn send_full_command(&mut self, link: LinkId, backend_id: BackendId, command: &Command) {
        let mut encoded = BytesMut::new();
        command.encode(&mut encoded);
        self.send_subcommand(link, backend_id, encoded);
    }

    // -- backend socket I/O ------------------------------------------------

    fn poll_backend(&mut self, cx: &mut Context<'_>, id: BackendId) {
        self.flush_backend_writes(cx, id);
        self.read_from_backend(cx, id);
    }

    fn flush_backend_writes(&mut self, cx: &mut Context<'_>, id: BackendId) {
        let mut disconnected = false;
        if let Some(conn) = self.backends.get_mut(id).connection_mut() {
            use bytes::Buf;
            while !conn.write_buf.is_empty() {
                match Pin::new(&mut conn.socket).poll_write(cx, &conn.write_buf) {
                    Poll::Ready(Ok(0)) => {
                        disconnected = true;
                        break;
                    },
                    Poll::Ready(Ok(n)) => conn.write_buf.advance(n),
                    Poll::Ready(Err(_)) => {
                        disconnected = true;
                        break;
                    },
                    Poll::Pending => break,
                }
            }
            if !disconnected {
                let _ = Pin::new(&mut conn.socket).poll_flush(cx);
            }
        }
        if disconnected {
            self.disconnect_backend(id);
        }
    }

    fn read_from_backend(&mut self, cx: &mut Context<'_>, id: BackendId) {
        if !self.backends.get(id).is_connected() {
            return;
        }
        let mut disconnected = false;
        {
            let conn = self.backends.get_mut(id).connection_mut().unwrap();
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                let mut read_buf = ReadBuf::new(&mut chunk);
                match Pin::new(&mut conn.socket).poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            disconnected = true;
                            break;
                        }
                        conn.read_buf.extend_from_slice(read_buf.filled());
                        if n < chunk.len() {
                            break;
                        }
                    },
                    Poll::Ready(Err(_)) => {
                        disconnected = true;
                        break;
                    },
                    Poll::Pending => break,
                }
            }
        }
        if disconnected {
            self.disconnect_backend(id);
            return;
        }
        self.process_backend_responses(id);
    }

    /// Consumes as many complete responses as are currently buffered for
    /// `backend_id`, fast-path forwarding bytes straight to the client when
    /// possible and otherwise materializing and recording a `Response`.
    fn process_backend_responses(&mut self, backend_id: BackendId) {
        loop {
            let backend_name = self.backends.get(backend_id).spec().name.clone();
            let head = match self.backends.get(backend_id).connection() {
                Some(conn) => conn.head_link(),
                None => return,
            };
            let Some(link) = head else { return };
            if !self.links.contains(link) {
                // Shouldn't happen: a link only leaves the arena once it's no
                // longer the head of any backend chain. Defensive no-op.
                return;
            }

            let conn = self.backends.get_mut(backend_id).connection_mut().unwrap();
            let forwarding = match conn.forward_mode() {
                Some(mode) => mode,
                None => {
                    let eligible = self.links.get(link).is_forward_policy()
                        && self
                            .links
                            .get(link)
                            .client()
                            .map(|cid| self.clients.get(cid).map(|c| c.head_link()) == Some(Some(link)))
                            .unwrap_or(false);
                    let conn = self.backends.get_mut(backend_id).connection_mut().unwrap();
                    conn.set_forward_mode(Some(eligible));
                    eligible
                },
            };

            if forwarding {
                let client_id = self.links.get(link).client();
                let conn = self.backends.get_mut(backend_id).connection_mut().unwrap();
                let done = {
                    let mut client_ref = client_id.and_then(|cid| self.clients.get_mut(cid));
                    let dest = client_ref.as_mut().map(|c| &mut c.write_buf);
                    match conn.forwarder.forward(&mut conn.read_buf, dest) {
                        Ok(done) => done,
                        Err(_) => {
                            drop(client_ref);
                            self.disconnect_backend(backend_id);
                            return;
                        },
                    }
                };
                if !done {
                    return;
                }
                let conn = self.backends.get_mut(backend_id).connection_mut().unwrap();
                conn.set_forward_mode(None);
                let next = self.links.clear_backend(link, backend_id);
                let conn = self.backends.get_mut(backend_id).connection_mut().unwrap();
                conn.pop_ready_link(next);
                conn.note_response_received();

                if self.links.is_ready(link) {
                    if let Some(cid) = client_id {
                        if let Some(client) = self.clients.get_mut(cid) {
                            let cnext = self.links.client_next(link);
                            client.pop_ready_link(cnext);
                            client.note_response_sent();
                        }
                        self.links.discard(link);
                        self.flush_client(cid);
                    } else {
                        self.links.discard(link);
                    }
                }
            } else {
                let conn = self.backends.get_mut(backend_id).connection_mut().unwrap();
                let parsed = conn.parser.parse(&mut conn.read_buf);
                match parsed {
                    Ok(None) => return,
                    Ok(Some(response)) => {
                        conn.set_forward_mode(None);
                        let next = self.links.record_backend_response(link, backend_id, &backend_name, response);
                        let conn = self.backends.get_mut(backend_id).connection_mut().unwrap();
                        conn.pop_ready_link(next);
                        conn.note_response_received();

                        if self.links.is_ready(link) {
                            match self.links.get(link).client() {
                                Some(cid) => self.flush_client(cid),
                                None => self.links.discard(link),
                            }
                        }
                    },
                    Err(_) => {
                        self.disconnect_backend(backend_id);
                        return;
                    },
                }
            }
        }
    }

    /// The connection was lost (or never usable): poison every link still
    /// waiting on it with a `CHANNELERROR` and drop it.
    fn disconnect_backend(&mut self, backend_id: BackendId) {
        let Some(conn) = self.backends.get_mut(backend_id).take_connection() else { return };
        let mut cursor = conn.head_link();
        while let Some(link) = cursor {
            let next = self.links.fail_backend(link, backend_id);
            if self.links.is_ready(link) {
                match self.links.get(link).client() {
                    Some(cid) => self.flush_client(cid),
                    None => self.links.discard(link),
                }
            }
            cursor = next;
        }
        if let Some(queued) = self.pending_sends.remove(&backend_id) {
            for (link, _) in queued {
                self.finish_failed_backend_link(link, backend_id);
            }
        }
        self.pending_tail.remove(&backend_id);
    }

    // -- command dispatch ---------------------------------------------------

    fn dispatch_command(&mut self, client_id: ClientId, command: Command) {
        let name = command.name_upper();
        if name.is_empty() {
            self.respond_immediately(client_id, wire_error(ProxyError::client("unknown command ''")));
            return;
        }
        if self.disabled_commands.contains(&name) {
            self.respond_immediately(
                client_id,
                wire_error(ProxyError::proxy(format!("command '{}' is disabled", name))),
            );
            return;
        }

        let Some(entry) = dispatch::lookup(&name) else {
            self.respond_immediately(client_id, wire_error(ProxyError::proxy(format!("unknown command '{}'", name))));
            return;
        };

        match entry {
            CommandTableEntry::Unimplemented => {
                self.respond_immediately(client_id, wire_error(ProxyError::proxy("command not supported")));
            },
            CommandTableEntry::KeyAtIndex(idx) => self.handle_key_at_index(client_id, command, idx),
            CommandTableEntry::KeysShareBackend { start } => self.handle_keys_share_backend(client_id, command, start),
            CommandTableEntry::PartitionKeys { start, args_per_key, interleaved, policy } => {
                self.handle_partition_keys(client_id, command, start, args_per_key, interleaved, policy)
            },
            CommandTableEntry::ForwardAll(policy) => self.handle_forward_all(client_id, command, policy),
            CommandTableEntry::RandomBackend => self.handle_random_backend(client_id, command),
            CommandTableEntry::MSetNx => self.handle_msetnx(client_id, command),
            CommandTableEntry::Scan => self.handle_scan(client_id, command),
            CommandTableEntry::Migrate => self.handle_migrate(client_id, command),
            CommandTableEntry::Script => self.handle_script(client_id, command),
            CommandTableEntry::Ping => self.respond_immediately(client_id, Response::status("PONG")),
            CommandTableEntry::Echo => self.handle_echo(client_id, command),
            CommandTableEntry::Quit => {
                self.respond_immediately(client_id, Response::ok());
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.mark_should_disconnect();
                }
            },
            CommandTableEntry::Backend => self.handle_backend_admin(client_id, command),
            CommandTableEntry::BackendNum => self.handle_backendnum_admin(client_id, command),
            CommandTableEntry::Backends => self.handle_backends_admin(client_id),
            CommandTableEntry::Forward => self.handle_forward_admin(client_id, command),
            CommandTableEntry::Info => self.handle_info_admin(client_id, command),
            CommandTableEntry::Role => self.handle_role_admin(client_id),
            CommandTableEntry::PrintState => self.handle_printstate_admin(client_id),
            CommandTableEntry::Client => self.handle_client_admin(client_id, command),
        }
    }

    fn handle_key_at_index(&mut self, client_id: ClientId, command: Command, idx: usize) {
        let Some(key) = command.arg(idx) else {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        };
        let backend_id = self.ring.backend_index_for_key(key);
        let link = self.new_link(client_id, CollectionPolicy::Forward);
        self.send_full_command(link, backend_id, &command);
    }

    fn handle_keys_share_backend(&mut self, client_id: ClientId, command: Command, start: usize) {
        if command.len() <= start {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        }
        match self.single_shared_backend(&command, start, command.len(), 1) {
            Ok(backend_id) => {
                let link = self.new_link(client_id, CollectionPolicy::Forward);
                self.send_full_command(link, backend_id, &command);
            },
            Err(()) => {
                self.respond_immediately(client_id, wire_error(ProxyError::proxy("keys are on different backends")));
            },
        }
    }

    /// Checks that every key at `start, start+stride, ...` (up to `end`)
    /// hashes to the same backend, returning it.
    fn single_shared_backend(&self, command: &Command, start: usize, end: usize, stride: usize) -> Result<BackendId, ()> {
        let mut backend_id = None;
        let mut i = start;
        while i < end {
            let key = &command.args()[i];
            let b = self.ring.backend_index_for_key(key);
            match backend_id {
                None => backend_id = Some(b),
                Some(prev) if prev != b => return Err(()),
                _ => {},
            }
            i += stride;
        }
        backend_id.ok_or(())
    }

    fn handle_partition_keys(
        &mut self,
        client_id: ClientId,
        command: Command,
        start: usize,
        args_per_key: usize,
        interleaved: bool,
        policy: PartitionPolicy,
    ) {
        debug_assert!(args_per_key == 1 || interleaved, "non-interleaved multi-arg-per-key partitioning isn't implemented");

        if command.len() <= start || (command.len() - start) % args_per_key != 0 {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        }
        let num_keys = (command.len() - start) / args_per_key;
        if num_keys == 0 {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        }

        let mut per_backend: FnvHashMap<BackendId, Vec<usize>> = FnvHashMap::default();
        let mut key_backend_order = Vec::with_capacity(num_keys);
        for k in 0..num_keys {
            let key_index = start + k * args_per_key;
            let key = &command.args()[key_index];
            let backend_id = self.ring.backend_index_for_key(key);
            key_backend_order.push(backend_id);
            per_backend.entry(backend_id).or_default().push(key_index);
        }

        let collection_policy = match policy {
            PartitionPolicy::SumInteger => CollectionPolicy::SumInteger,
            PartitionPolicy::MultiByKey => CollectionPolicy::CollectMultiByKey,
            PartitionPolicy::Status => CollectionPolicy::CollectStatus,
        };
        let link = self.new_link(client_id, collection_policy);

        if matches!(policy, PartitionPolicy::MultiByKey) {
            for &backend_id in &key_backend_order {
                self.links.push_recombination_key(link, backend_id);
            }
        }

        let name = command.args()[0].clone();
        for (backend_id, key_indices) in per_backend {
            let mut argv: Vec<&Bytes> = vec![&name];
            for &key_index in &key_indices {
                for j in 0..args_per_key {
                    argv.push(&command.args()[key_index + j]);
                }
            }
            let sub = RefCommand::new(argv);
            let mut encoded = BytesMut::new();
            sub.encode(&mut encoded);
            self.send_subcommand(link, backend_id, encoded);
        }
    }

    fn handle_forward_all(&mut self, client_id: ClientId, command: Command, policy: ForwardAllPolicy) {
        if self.backends.is_empty() {
            self.respond_immediately(client_id, wire_error(ProxyError::channel("no backends configured")));
            return;
        }
        let collection_policy = match policy {
            ForwardAllPolicy::CollectResponses => CollectionPolicy::CollectResponses,
            ForwardAllPolicy::CollectStatus => CollectionPolicy::CollectStatus,
            ForwardAllPolicy::SumInteger => CollectionPolicy::SumInteger,
            ForwardAllPolicy::CombineMulti => CollectionPolicy::CombineMulti,
        };
        let link = self.new_link(client_id, collection_policy);
        let backend_ids: Vec<BackendId> = (0..self.backends.len()).collect();
        for backend_id in backend_ids {
            self.send_full_command(link, backend_id, &command);
        }
    }

    fn handle_random_backend(&mut self, client_id: ClientId, command: Command) {
        if self.backends.is_empty() {
            self.respond_immediately(client_id, wire_error(ProxyError::channel("no backends configured")));
            return;
        }
        let backend_id = rand::thread_rng().gen_range(0..self.backends.len());
        let link = self.new_link(client_id, CollectionPolicy::Forward);
        self.send_full_command(link, backend_id, &command);
    }

    /// Like a partitioned `MSET`, but all keys must share one backend: an
    /// `MSETNX` spanning shards can't be made atomic, so it's rejected
    /// outright rather than silently only half-enforced.
    fn handle_msetnx(&mut self, client_id: ClientId, command: Command) {
        if command.len() < 3 || (command.len() - 1) % 2 != 0 {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        }
        match self.single_shared_backend(&command, 1, command.len(), 2) {
            Ok(backend_id) => {
                let link = self.new_link(client_id, CollectionPolicy::Forward);
                self.send_full_command(link, backend_id, &command);
            },
            Err(()) => {
                self.respond_immediately(client_id, wire_error(ProxyError::proxy("keys are on different backends")));
            },
        }
    }

    fn handle_echo(&mut self, client_id: ClientId, command: Command) {
        match command.arg(1) {
            Some(arg) => self.respond_immediately(client_id, Response::bulk(arg.clone())),
            None => self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments"))),
        }
    }

    /// `SCAN`: the cursor's high bits name which backend it continues from;
    /// rewrite the low bits down to that backend's own cursor, forward, then
    /// re-tag the reply on the way back via `CollectionPolicy::ModifyScan`.
    fn handle_scan(&mut self, client_id: ClientId, command: Command) {
        let Some(cursor_bytes) = command.arg(1) else {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        };
        let num_backends = self.backends.len();
        if num_backends == 0 {
            self.respond_immediately(client_id, wire_error(ProxyError::channel("no backends configured")));
            return;
        }
        let cursor_value: u64 = match std::str::from_utf8(cursor_bytes).ok().and_then(|s| s.parse().ok()) {
            Some(v) => v,
            None => {
                self.respond_immediately(client_id, wire_error(ProxyError::client("invalid cursor")));
                return;
            },
        };

        let index_bits = link::scan_index_bits(num_backends);
        let remaining_bits = 64 - index_bits;
        let backend_index = if num_backends <= 1 { 0 } else { (cursor_value >> remaining_bits) as usize };
        if backend_index >= num_backends {
            self.respond_immediately(client_id, wire_error(ProxyError::client("invalid cursor")));
            return;
        }
        let low_cursor = if num_backends <= 1 { cursor_value } else { cursor_value & link::low_bits_mask(remaining_bits) };

        let mut rewritten: Vec<Bytes> = command.args().to_vec();
        rewritten[1] = Bytes::from(low_cursor.to_string());
        let sub = Command::new(rewritten);

        let link_id = self.new_link(client_id, CollectionPolicy::ModifyScan { backend_index, num_backends });
        self.send_full_command(link_id, backend_index, &sub);
    }

    /// `MIGRATE host port key destination-db timeout [...]`: the old
    /// single-key form (`key` at index 3 non-empty) is a verbatim single-backend
    /// passthrough, same as any other `KeyAtIndex` command. Only the new
    /// `MIGRATE host port "" destination-db timeout ... KEYS k1 k2 ...` form
    /// (`key` empty) partitions by key and recombines via `ModifyMigrate`.
    fn handle_migrate(&mut self, client_id: ClientId, command: Command) {
        if command.len() < 6 {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        }

        if !command.args()[3].is_empty() {
            let backend_id = self.ring.backend_index_for_key(&command.args()[3]);
            let link = self.new_link(client_id, CollectionPolicy::Forward);
            self.send_full_command(link, backend_id, &command);
            return;
        }

        let keys_pos = command.args().iter().position(|a| a.eq_ignore_ascii_case(b"KEYS"));
        let Some(pos) = keys_pos else {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        };
        let mut per_backend: FnvHashMap<BackendId, Vec<Bytes>> = FnvHashMap::default();
        for key in &command.args()[pos + 1..] {
            let b = self.ring.backend_index_for_key(key);
            per_backend.entry(b).or_default().push(key.clone());
        }
        if per_backend.is_empty() {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        }

        let link = self.new_link(client_id, CollectionPolicy::ModifyMigrate);
        for (backend_id, keys) in per_backend {
            let mut argv: Vec<Bytes> = vec![
                command.args()[0].clone(),
                command.args()[1].clone(),
                command.args()[2].clone(),
                Bytes::from_static(b""),
                command.args()[4].clone(),
                command.args()[5].clone(),
            ];
            argv.extend(command.args()[6..pos].iter().cloned());
            argv.push(Bytes::from_static(b"KEYS"));
            argv.extend(keys);
            let sub = Command::new(argv);
            self.send_full_command(link, backend_id, &sub);
        }
    }

    fn handle_script(&mut self, client_id: ClientId, command: Command) {
        let Some(sub) = command.arg(1) else {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        };
        if self.backends.is_empty() {
            self.respond_immediately(client_id, wire_error(ProxyError::channel("no backends configured")));
            return;
        }
        let sub_upper = String::from_utf8_lossy(sub).to_ascii_uppercase();
        let policy = match sub_upper.as_str() {
            "EXISTS" => CollectionPolicy::ModifyScriptExists,
            "LOAD" | "FLUSH" => CollectionPolicy::CollectStatus,
            _ => {
                self.respond_immediately(client_id, wire_error(ProxyError::proxy("unknown SCRIPT subcommand")));
                return;
            },
        };
        let link = self.new_link(client_id, policy);
        let backend_ids: Vec<BackendId> = (0..self.backends.len()).collect();
        for backend_id in backend_ids {
            self.send_full_command(link, backend_id, &command);
        }
    }

    fn handle_backend_admin(&mut self, client_id: ClientId, command: Command) {
        if command.len() < 2 {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        }
        let names: Vec<Response> = command.args()[1..]
            .iter()
            .map(|key| Response::bulk(self.backends.get(self.ring.backend_index_for_key(key)).spec().name.clone()))
            .collect();
        let response = if names.len() == 1 { names.into_iter().next().unwrap() } else { Response::Multi(Some(names)) };
        self.respond_immediately(client_id, response);
    }

    fn handle_backendnum_admin(&mut self, client_id: ClientId, command: Command) {
        if command.len() < 2 {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        }
        let nums: Vec<Response> = command.args()[1..]
            .iter()
            .map(|key| Response::Integer(self.ring.backend_index_for_key(key) as i64))
            .collect();
        let response = if nums.len() == 1 { nums.into_iter().next().unwrap() } else { Response::Multi(Some(nums)) };
        self.respond_immediately(client_id, response);
    }

    fn handle_backends_admin(&mut self, client_id: ClientId) {
        let items: Vec<Response> = self
            .ring
            .backends()
            .iter()
            .map(|spec| Response::bulk(format!("{}:{}@{}", spec.host, spec.port, spec.name)))
            .collect();
        self.respond_immediately(client_id, Response::Multi(Some(items)));
    }

    fn resolve_backend_target(&self, target: &Bytes) -> Option<BackendId> {
        let text = std::str::from_utf8(target).ok()?;
        if let Ok(idx) = text.parse::<usize>() {
            return if idx < self.ring.backends().len() { Some(idx) } else { None };
        }
        self.ring.backend_index_by_name(text)
    }

    fn handle_forward_admin(&mut self, client_id: ClientId, command: Command) {
        if command.len() < 3 {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        }
        let target = command.args()[1].clone();
        let sub_argv: Vec<&Bytes> = command.args()[2..].iter().collect();
        let sub = RefCommand::new(sub_argv);
        let mut encoded = BytesMut::new();
        sub.encode(&mut encoded);

        if target.is_empty() {
            if self.backends.is_empty() {
                self.respond_immediately(client_id, wire_error(ProxyError::channel("no backends configured")));
                return;
            }
            let link = self.new_link(client_id, CollectionPolicy::CollectResponses);
            let backend_ids: Vec<BackendId> = (0..self.backends.len()).collect();
            for backend_id in backend_ids {
                self.send_subcommand(link, backend_id, encoded.clone());
            }
            return;
        }

        match self.resolve_backend_target(&target) {
            Some(backend_id) => {
                let link = self.new_link(client_id, CollectionPolicy::Forward);
                self.send_subcommand(link, backend_id, encoded);
            },
            None => self.respond_immediately(client_id, wire_error(ProxyError::proxy("unknown backend target"))),
        }
    }

    fn handle_info_admin(&mut self, client_id: ClientId, command: Command) {
        if command.len() == 1 {
            let text = format!(
                "# Proxy\r\nbackends:{}\r\nclients_connected:{}\r\n",
                self.backends.len(),
                self.clients.len()
            );
            self.respond_immediately(client_id, Response::bulk(text));
            return;
        }

        let idx = if command.args()[1].eq_ignore_ascii_case(b"BACKEND") { 2 } else { 1 };
        let Some(target) = command.arg(idx).cloned() else {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        };
        let Some(backend_id) = self.resolve_backend_target(&target) else {
            self.respond_immediately(client_id, wire_error(ProxyError::proxy("unknown backend target")));
            return;
        };
        let mut argv: Vec<Bytes> = vec![Bytes::from_static(b"INFO")];
        argv.extend(command.args()[idx + 1..].iter().cloned());
        let sub = Command::new(argv);
        let link = self.new_link(client_id, CollectionPolicy::Forward);
        self.send_full_command(link, backend_id, &sub);
    }

    fn handle_role_admin(&mut self, client_id: ClientId) {
        let names: Vec<Response> = self.ring.backends().iter().map(|s| Response::bulk(s.name.clone())).collect();
        let response = Response::Multi(Some(vec![Response::bulk("proxy"), Response::Multi(Some(names))]));
        self.respond_immediately(client_id, response);
    }

    fn handle_printstate_admin(&mut self, client_id: ClientId) {
        tracing::info!(clients = self.clients.len(), backends = self.backends.len(), "internal state dump requested");
        for (id, backend) in self.backends.iter() {
            tracing::info!(backend = id, name = %backend.spec().name, connected = backend.is_connected(), "backend state");
        }
        self.respond_immediately(client_id, Response::ok());
    }

    fn handle_client_admin(&mut self, client_id: ClientId, command: Command) {
        let Some(sub) = command.arg(1) else {
            self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
            return;
        };
        let sub_upper = String::from_utf8_lossy(sub).to_ascii_uppercase();
        match sub_upper.as_str() {
            "LIST" => {
                let mut lines = String::new();
                for (id, client) in self.clients.iter() {
                    lines.push_str(&format!("id={} name={} addr={}\n", id, client.name().unwrap_or(""), client.debug_name()));
                }
                self.respond_immediately(client_id, Response::bulk(lines));
            },
            "GETNAME" => {
                let name = self.clients.get(client_id).and_then(|c| c.name()).unwrap_or("").to_string();
                self.respond_immediately(client_id, Response::bulk(name));
            },
            "SETNAME" => {
                let Some(name) = command.arg(2) else {
                    self.respond_immediately(client_id, wire_error(ProxyError::client("wrong number of arguments")));
                    return;
                };
                let name_str = String::from_utf8_lossy(name).to_string();
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.set_name(name_str);
                }
                self.respond_immediately(client_id, Response::ok());
            },
            _ => self.respond_immediately(client_id, wire_error(ProxyError::proxy("unknown CLIENT subcommand"))),
        }
    }
}

fn wire_error(err: ProxyError) -> Response { Response::error_str(err.wire_message()) }

impl<S, C> Future for Engine<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: BackendConnector<S>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // `Engine` holds no self-referential data (every field is plain owned
        // state), so it's `Unpin` and needs no structural pin projection.
        let this = self.get_mut();
        if this.tick(cx) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct NeverConnector;

    impl BackendConnector<DuplexStream> for NeverConnector {
        fn connect(&self, _spec: &BackendSpec) -> Pin<Box<dyn Future<Output = std::io::Result<DuplexStream>> + Send>> {
            Box::pin(futures::future::pending())
        }
    }

    struct ReconnectingConnector {
        next: std::sync::Mutex<Vec<DuplexStream>>,
    }

    impl BackendConnector<DuplexStream> for ReconnectingConnector {
        fn connect(&self, _spec: &BackendSpec) -> Pin<Box<dyn Future<Output = std::io::Result<DuplexStream>> + Send>> {
            let socket = self.next.lock().unwrap().pop();
            Box::pin(async move {
                match socket {
                    Some(s) => Ok(s),
                    None => futures::future::pending().await,
                }
            })
        }
    }

    fn new_test_engine<C: BackendConnector<DuplexStream>>(
        num_backends: usize,
        connector: C,
    ) -> (Engine<DuplexStream, C>, Vec<DuplexStream>, mpsc::UnboundedSender<DuplexStream>, watch::Sender<bool>) {
        let specs: Vec<BackendSpec> =
            (0..num_backends).map(|i| BackendSpec::new(format!("10.0.0.{}", i), 6379, format!("b{}", i))).collect();
        let ring = Ring::new(specs.clone(), crate::ring::HashTagConfig::default());
        let mut backends = BackendTable::new(specs);
        let mut test_sides = Vec::new();
        for i in 0..num_backends {
            let (engine_side, test_side) = duplex(16 * 1024);
            backends.get_mut(i).attach(BackendConnection::new(engine_side));
            test_sides.push(test_side);
        }

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = Engine {
            ring,
            clients: ClientTable::new(),
            backends,
            links: ResponseLinks::new(),
            disabled_commands: Default::default(),
            connector,
            connecting: Default::default(),
            pending_sends: Default::default(),
            pending_tail: Default::default(),
            incoming: incoming_rx,
            shutdown: shutdown_rx,
            shutdown_timer: tokio::time::interval(std::time::Duration::from_secs(1)),
            next_client_seq: 0,
            stats: Default::default(),
        };
        (engine, test_sides, incoming_tx, shutdown_tx)
    }

    async fn pump<S, C>(engine: &mut Engine<S, C>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
        C: BackendConnector<S>,
    {
        for _ in 0..8 {
            futures::future::poll_fn(|cx| {
                engine.tick(cx);
                Poll::Ready(())
            })
            .await;
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn ping_is_answered_without_touching_a_backend() {
        let (mut engine, _backends, incoming_tx, _shutdown_tx) = new_test_engine(1, NeverConnector);
        let (client_engine_side, mut client_test_side) = duplex(4096);
        incoming_tx.send(client_engine_side).unwrap();

        pump(&mut engine).await;
        client_test_side.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        pump(&mut engine).await;

        let mut buf = [0u8; 64];
        let n = client_test_side.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+PONG\r\n");
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_one_backend() {
        let (mut engine, mut backends, incoming_tx, _shutdown_tx) = new_test_engine(1, NeverConnector);
        let (client_engine_side, mut client_test_side) = duplex(4096);
        incoming_tx.send(client_engine_side).unwrap();
        pump(&mut engine).await;

        client_test_side.write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nx\r\n$2\r\n23\r\n").await.unwrap();
        pump(&mut engine).await;

        let mut backend_buf = vec![0u8; 256];
        let n = backends[0].read(&mut backend_buf).await.unwrap();
        assert_eq!(&backend_buf[..n], b"*3\r\n$3\r\nSET\r\n$1\r\nx\r\n$2\r\n23\r\n");
        backends[0].write_all(b"+OK\r\n").await.unwrap();
        pump(&mut engine).await;

        let mut client_buf = [0u8; 64];
        let n = client_test_side.read(&mut client_buf).await.unwrap();
        assert_eq!(&client_buf[..n], b"+OK\r\n");
    }

    #[tokio::test]
    async fn mget_fans_out_and_recombines_in_key_order() {
        let (mut engine, mut backends, incoming_tx, _shutdown_tx) = new_test_engine(2, NeverConnector);
        let (client_engine_side, mut client_test_side) = duplex(4096);
        incoming_tx.send(client_engine_side).unwrap();
        pump(&mut engine).await;

        // find which literal keys land on which backend so the test doesn't
        // assume a specific ring outcome
        let ring = Ring::new(
            (0..2).map(|i| BackendSpec::new(format!("10.0.0.{}", i), 6379, format!("b{}", i))).collect(),
            crate::ring::HashTagConfig::default(),
        );
        let keys = ["x", "y", "z"];
        let backend_of: Vec<usize> = keys.iter().map(|k| ring.backend_index_for_key(k.as_bytes())).collect();

        client_test_side.write_all(b"MGET x y z\r\n").await.unwrap();
        pump(&mut engine).await;

        // each backend replies with as many bulks as keys it was sent, in order
        for (backend_id, backend) in backends.iter_mut().enumerate() {
            let count = backend_of.iter().filter(|&&b| b == backend_id).count();
            if count == 0 {
                continue;
            }
            let mut reply = format!("*{}\r\n", count);
            for _ in 0..count {
                reply.push_str("$1\r\nv\r\n");
            }
            backend.write_all(reply.as_bytes()).await.unwrap();
        }
        pump(&mut engine).await;

        let mut client_buf = [0u8; 256];
        let n = client_test_side.read(&mut client_buf).await.unwrap();
        let expected = b"*3\r\n$1\r\nv\r\n$1\r\nv\r\n$1\r\nv\r\n";
        assert_eq!(&client_buf[..n], &expected[..]);
    }

    #[tokio::test]
    async fn rename_on_two_keys_mapping_to_different_backends_is_rejected() {
        let (mut engine, _backends, incoming_tx, _shutdown_tx) = new_test_engine(8, NeverConnector);
        let (client_engine_side, mut client_test_side) = duplex(4096);
        incoming_tx.send(client_engine_side).unwrap();
        pump(&mut engine).await;

        // with 8 backends, "a" and "zzzzzzzzzz" are overwhelmingly likely to
        // land on different shards; assert the proxy-level guard either way
        // by checking the ring directly and adapting the expectation
        let ring = Ring::new(
            (0..8).map(|i| BackendSpec::new(format!("10.0.0.{}", i), 6379, format!("b{}", i))).collect(),
            crate::ring::HashTagConfig::default(),
        );
        let (ka, kb) = ("a", "zzzzzzzzzz");
        let same_backend = ring.backend_index_for_key(ka.as_bytes()) == ring.backend_index_for_key(kb.as_bytes());

        client_test_side.write_all(format!("RENAME {} {}\r\n", ka, kb).as_bytes()).await.unwrap();
        pump(&mut engine).await;

        if !same_backend {
            let mut client_buf = [0u8; 256];
            let n = client_test_side.read(&mut client_buf).await.unwrap();
            assert!(client_buf[..n].starts_with(b"-PROXYERROR"));
        }
    }

    #[tokio::test]
    async fn backend_disconnect_mid_command_surfaces_a_channel_error_and_reconnects_next_time() {
        let (engine_side_a, test_side_a) = duplex(4096);
        let (engine_side_b, _test_side_b) = duplex(4096);
        let connector = ReconnectingConnector { next: std::sync::Mutex::new(vec![engine_side_b]) };

        let specs = vec![BackendSpec::new("10.0.0.1", 6379, "b0")];
        let ring = Ring::new(specs.clone(), crate::ring::HashTagConfig::default());
        let mut backends: BackendTable<DuplexStream> = BackendTable::new(specs);
        backends.get_mut(0).attach(BackendConnection::new(engine_side_a));
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut engine = Engine {
            ring,
            clients: ClientTable::new(),
            backends,
            links: ResponseLinks::new(),
            disabled_commands: Default::default(),
            connector,
            connecting: Default::default(),
            pending_sends: Default::default(),
            pending_tail: Default::default(),
            incoming: incoming_rx,
            shutdown: shutdown_rx,
            shutdown_timer: tokio::time::interval(std::time::Duration::from_secs(1)),
            next_client_seq: 0,
            stats: Default::default(),
        };

        let (client_engine_side, mut client_test_side) = duplex(4096);
        incoming_tx.send(client_engine_side).unwrap();
        pump(&mut engine).await;

        client_test_side.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\ny\r\n").await.unwrap();
        pump(&mut engine).await;

        drop(test_side_a); // backend connection dies before replying

        pump(&mut engine).await;

        let mut client_buf = [0u8; 256];
        let n = client_test_side.read(&mut client_buf).await.unwrap();
        assert!(client_buf[..n].starts_with(b"-CHANNELERROR"));

        // a subsequent command re-opens the backend via the connector
        client_test_side.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\ny\r\n").await.unwrap();
        pump(&mut engine).await;
        assert!(engine.backends.get(0).is_connected());
    }
}
