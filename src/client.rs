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
use slab::Slab;

use crate::link::LinkId;
use crate::protocol::CommandParser;

pub type ClientId = usize;

/// A single connected client: its socket, its incremental parse state, and
/// the FIFO chain of response links awaiting reply.
pub struct Client<S> {
    pub socket: S,
    pub read_buf: BytesMut,
    pub write_buf: BytesMut,
    pub parser: CommandParser,

    name: Option<String>,
    debug_name: String,
    should_disconnect: bool,

    num_commands_received: u64,
    num_responses_sent: u64,

    head_link: Option<LinkId>,
    tail_link: Option<LinkId>,
}

impl<S> Client<S> {
    pub fn new(socket: S, debug_name: String) -> Client<S> {
        Client {
            socket,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            parser: CommandParser::new(),
            name: None,
            debug_name,
            should_disconnect: false,
            num_commands_received: 0,
            num_responses_sent: 0,
            head_link: None,
            tail_link: None,
        }
    }

    pub fn debug_name(&self) -> &str { &self.debug_name }

    pub fn name(&self) -> Option<&str> { self.name.as_deref() }

    pub fn set_name(&mut self, name: String) { self.name = Some(name); }

    pub fn should_disconnect(&self) -> bool { self.should_disconnect }

    pub fn mark_should_disconnect(&mut self) { self.should_disconnect = true; }

    pub fn num_commands_received(&self) -> u64 { self.num_commands_received }

    pub fn num_responses_sent(&self) -> u64 { self.num_responses_sent }

    pub fn note_command_received(&mut self) { self.num_commands_received += 1; }

    pub fn note_response_sent(&mut self) { self.num_responses_sent += 1; }

    pub fn head_link(&self) -> Option<LinkId> { self.head_link }

    pub fn tail_link(&self) -> Option<LinkId> { self.tail_link }

    /// Appends `link` to this client's response chain and returns the
    /// previous tail, so callers can wire up the link's own chain pointer.
    pub fn push_link(&mut self, link: LinkId) -> Option<LinkId> {
        let prev_tail = self.tail_link;
        if self.head_link.is_none() {
            self.head_link = Some(link);
        }
        self.tail_link = Some(link);
        prev_tail
    }

    /// Advances the chain head past a just-sent link, returning the link that
    /// was popped.
    pub fn pop_ready_link(&mut self, next: Option<LinkId>) -> Option<LinkId> {
        let popped = self.head_link;
        self.head_link = next;
        if self.head_link.is_none() {
            self.tail_link = None;
        }
        popped
    }
}

/// Owns every connected client in a slab arena, addressed by `ClientId`.
pub struct ClientTable<S> {
    clients: Slab<Client<S>>,
}

impl<S> Default for ClientTable<S> {
    fn default() -> Self { ClientTable::new() }
}

impl<S> ClientTable<S> {
    pub fn new() -> ClientTable<S> { ClientTable { clients: Slab::new() } }

    pub fn insert(&mut self, client: Client<S>) -> ClientId { self.clients.insert(client) }

    pub fn remove(&mut self, id: ClientId) -> Client<S> { self.clients.remove(id) }

    pub fn contains(&self, id: ClientId) -> bool { self.clients.contains(id) }

    pub fn get(&self, id: ClientId) -> Option<&Client<S>> { self.clients.get(id) }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client<S>> { self.clients.get_mut(id) }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &Client<S>)> { self.clients.iter() }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ClientId, &mut Client<S>)> { self.clients.iter_mut() }

    pub fn len(&self) -> usize { self.clients.len() }

    pub fn is_empty(&self) -> bool { self.clients.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_push_and_pop_preserves_fifo_order() {
        let mut client = Client::new((), "test@0".to_string());
        let prev_a = client.push_link(10);
        assert_eq!(prev_a, None);
        let prev_b = client.push_link(11);
        assert_eq!(prev_b, Some(10));
        assert_eq!(client.head_link(), Some(10));
        assert_eq!(client.tail_link(), Some(11));

        let popped = client.pop_ready_link(Some(11));
        assert_eq!(popped, Some(10));
        assert_eq!(client.head_link(), Some(11));
        assert_eq!(client.tail_link(), Some(11));

        let popped = client.pop_ready_link(None);
        assert_eq!(popped, Some(11));
        assert_eq!(client.head_link(), None);
        assert_eq!(client.tail_link(), None);
    }

    #[test]
    fn table_insert_remove_round_trips() {
        let mut table: ClientTable<()> = ClientTable::new();
        let id = table.insert(Client::new((), "test@1".to_string()));
        assert!(table.contains(id));
        assert_eq!(table.get(id).unwrap().debug_name(), "test@1");
        table.remove(id);
        assert!(!table.contains(id));
    }
}
