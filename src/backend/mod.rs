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
use bytes::BytesMut;
use fnv::FnvHashMap;

use crate::link::LinkId;
use crate::protocol::{ResponseForwarder, ResponseParser};
use crate::ring::BackendSpec;

pub type BackendId = usize;

/// One live TCP connection to a backend server: its socket, incremental
/// response-parse state, and the FIFO chain of response links awaiting a
/// reply on it.
pub struct BackendConnection<S> {
    pub socket: S,
    pub read_buf: BytesMut,
    pub write_buf: BytesMut,
    pub parser: ResponseParser,
    pub forwarder: ResponseForwarder,

    // `None` between responses; pinned to `Some(true/false)` for the
    // duration of one in-flight response so a fast-path decision made at its
    // first byte (head-of-both-chains at that instant) can't flip underneath
    // a partially-read response.
    forward_mode: Option<bool>,

    head_link: Option<LinkId>,
    tail_link: Option<LinkId>,

    num_commands_sent: u64,
    num_responses_received: u64,
}

impl<S> BackendConnection<S> {
    pub fn new(socket: S) -> BackendConnection<S> {
        BackendConnection {
            socket,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            parser: ResponseParser::new(),
            forwarder: ResponseForwarder::default(),
            forward_mode: None,
            head_link: None,
            tail_link: None,
            num_commands_sent: 0,
            num_responses_received: 0,
        }
    }

    pub fn forward_mode(&self) -> Option<bool> { self.forward_mode }

    pub fn set_forward_mode(&mut self, mode: Option<bool>) { self.forward_mode = mode; }

    pub fn head_link(&self) -> Option<LinkId> { self.head_link }

    pub fn tail_link(&self) -> Option<LinkId> { self.tail_link }

    pub fn num_commands_sent(&self) -> u64 { self.num_commands_sent }

    pub fn num_responses_received(&self) -> u64 { self.num_responses_received }

    pub fn note_command_sent(&mut self) { self.num_commands_sent += 1; }

    pub fn note_response_received(&mut self) { self.num_responses_received += 1; }

    /// Appends `link` to this connection's chain and returns the previous
    /// tail, so callers can wire up the link's own chain pointer.
    pub fn push_link(&mut self, link: LinkId) -> Option<LinkId> {
        let prev_tail = self.tail_link;
        if self.head_link.is_none() {
            self.head_link = Some(link);
        }
        self.tail_link = Some(link);
        prev_tail
    }

    pub fn pop_ready_link(&mut self, next: Option<LinkId>) -> Option<LinkId> {
        let popped = self.head_link;
        self.head_link = next;
        if self.head_link.is_none() {
            self.tail_link = None;
        }
        popped
    }
}

/// A backend server and, when one exists, its single live connection.
/// Connections are opened lazily and there is never more than one per
/// backend; `connecting` covers the gap between deciding to open one and it
/// becoming usable.
pub struct Backend<S> {
    spec: BackendSpec,
    connection: Option<BackendConnection<S>>,
    connecting: bool,
}

impl<S> Backend<S> {
    pub fn new(spec: BackendSpec) -> Backend<S> { Backend { spec, connection: None, connecting: false } }

    pub fn spec(&self) -> &BackendSpec { &self.spec }

    pub fn is_connected(&self) -> bool { self.connection.is_some() }

    pub fn is_connecting(&self) -> bool { self.connecting }

    pub fn mark_connecting(&mut self) { self.connecting = true; }

    pub fn attach(&mut self, connection: BackendConnection<S>) {
        self.connection = Some(connection);
        self.connecting = false;
    }

    /// Drops the connection (e.g. after an I/O error), returning it so the
    /// caller can drain its chain of pending links.
    pub fn take_connection(&mut self) -> Option<BackendConnection<S>> {
        self.connecting = false;
        self.connection.take()
    }

    pub fn connection(&self) -> Option<&BackendConnection<S>> { self.connection.as_ref() }

    pub fn connection_mut(&mut self) -> Option<&mut BackendConnection<S>> { self.connection.as_mut() }
}

/// Owns every backend server known to the ring, indexed the same way the
/// ring indexes them so a key's `backend_index_for_key` is directly usable
/// here.
pub struct BackendTable<S> {
    backends: Vec<Backend<S>>,
    name_to_index: FnvHashMap<String, BackendId>,
}

impl<S> BackendTable<S> {
    pub fn new(specs: Vec<BackendSpec>) -> BackendTable<S> {
        let mut name_to_index = FnvHashMap::default();
        let backends = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                name_to_index.insert(spec.name.clone(), index);
                Backend::new(spec)
            })
            .collect();
        BackendTable { backends, name_to_index }
    }

    pub fn len(&self) -> usize { self.backends.len() }

    pub fn is_empty(&self) -> bool { self.backends.is_empty() }

    pub fn index_by_name(&self, name: &str) -> Option<BackendId> { self.name_to_index.get(name).copied() }

    pub fn get(&self, index: BackendId) -> &Backend<S> { &self.backends[index] }

    pub fn get_mut(&mut self, index: BackendId) -> &mut Backend<S> { &mut self.backends[index] }

    pub fn iter(&self) -> impl Iterator<Item = (BackendId, &Backend<S>)> { self.backends.iter().enumerate() }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (BackendId, &mut Backend<S>)> {
        self.backends.iter_mut().enumerate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_chain_push_and_pop_preserves_fifo_order() {
        let mut conn = BackendConnection::new(());
        let prev_a = conn.push_link(5);
        assert_eq!(prev_a, None);
        let prev_b = conn.push_link(6);
        assert_eq!(prev_b, Some(5));
        assert_eq!(conn.head_link(), Some(5));

        let popped = conn.pop_ready_link(Some(6));
        assert_eq!(popped, Some(5));
        assert_eq!(conn.head_link(), Some(6));

        let popped = conn.pop_ready_link(None);
        assert_eq!(popped, Some(6));
        assert_eq!(conn.head_link(), None);
        assert_eq!(conn.tail_link(), None);
    }

    #[test]
    fn table_looks_up_backends_by_name_and_index() {
        let table: BackendTable<()> = BackendTable::new(vec![
            BackendSpec::new("10.0.0.1", 6379, "a"),
            BackendSpec::new("10.0.0.2", 6379, "b"),
        ]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.index_by_name("b"), Some(1));
        assert_eq!(table.get(1).spec().name, "b");
    }

    #[test]
    fn backend_tracks_connection_lifecycle() {
        let mut backend: Backend<()> = Backend::new(BackendSpec::new("10.0.0.1", 6379, "a"));
        assert!(!backend.is_connected());
        backend.mark_connecting();
        assert!(backend.is_connecting());
        backend.attach(BackendConnection::new(()));
        assert!(backend.is_connected());
        assert!(!backend.is_connecting());
        let taken = backend.take_connection();
        assert!(taken.is_some());
        assert!(!backend.is_connected());
    }
}
