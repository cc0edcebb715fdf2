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
//! Response linking: the object graph that lets one client command fan out to
//! several backend sub-commands and fan the replies back in as a single,
//! correctly-ordered client response.
//!
//! A `ResponseLink` sits at the join of two independent FIFO chains: the
//! client's (the order replies must reach the client in) and one chain per
//! backend connection it sent a sub-command to (the order that connection's
//! replies will arrive in). It becomes ready exactly when every backend chain
//! it belongs to has delivered a response; a client only ever sends the
//! response at the head of its own chain, and only once that head is ready.
use std::collections::HashMap;

use bytes::Bytes;
use fnv::FnvHashMap;
use slab::Slab;

use crate::protocol::Response;

pub type LinkId = usize;
pub type ClientId = usize;
pub type BackendId = usize;

/// How a link's backend responses combine into the single response sent to
/// the client.
#[derive(Debug, Clone)]
pub enum CollectionPolicy {
    /// Pass the one backend response straight through.
    Forward,
    /// Every backend must reply with a status; the client gets a single `OK`
    /// (or the first error encountered, verbatim).
    CollectStatus,
    /// Sum every backend's integer reply.
    SumInteger,
    /// Concatenate every backend's multi-bulk fields into one multi-bulk, in
    /// the order the responses arrived.
    CombineMulti,
    /// Wrap every backend's whole response as one field of a multi-bulk, in
    /// the order the responses arrived.
    CollectResponses,
    /// Recombine a partitioned multi-key command: each backend returned a
    /// multi-bulk covering the keys routed to it, and the fields must be
    /// reassembled in original key order.
    CollectMultiByKey,
    /// Every backend must return the same response; otherwise it's an error.
    CollectIdentical,
    /// A `SCAN` continuation: rewrites the cursor to also encode which
    /// backend it refers to, advancing to the next backend once the current
    /// one reports it has no more keys.
    ModifyScan { backend_index: usize, num_backends: usize },
    /// `SCRIPT EXISTS`: bitwise-AND the per-script existence flags across
    /// every backend's reply.
    ModifyScriptExists,
    /// `MIGRATE`: collapse per-backend `OK`/`NOKEY`/error replies into one
    /// status, unless any backend errored.
    ModifyMigrate,
}

#[derive(Debug)]
enum Accumulator {
    None,
    Forward(Option<Response>),
    IntegerSum(i64),
    Vec(Vec<Response>),
    ByBackend { responses: FnvHashMap<BackendId, Response>, recombination_queue: Vec<BackendId> },
}

impl Accumulator {
    fn for_policy(policy: &CollectionPolicy) -> Accumulator {
        match policy {
            CollectionPolicy::Forward | CollectionPolicy::ModifyScan { .. } => Accumulator::Forward(None),
            CollectionPolicy::CollectStatus => Accumulator::None,
            CollectionPolicy::SumInteger => Accumulator::IntegerSum(0),
            CollectionPolicy::CombineMulti
            | CollectionPolicy::CollectResponses
            | CollectionPolicy::CollectIdentical
            | CollectionPolicy::ModifyScriptExists
            | CollectionPolicy::ModifyMigrate => Accumulator::Vec(Vec::new()),
            CollectionPolicy::CollectMultiByKey => {
                Accumulator::ByBackend { responses: FnvHashMap::default(), recombination_queue: Vec::new() }
            },
        }
    }
}

#[derive(Debug)]
pub struct ResponseLink {
    policy: CollectionPolicy,
    accumulator: Accumulator,
    sticky_error: Option<Response>,
    client: Option<ClientId>,
    next_in_client_chain: Option<LinkId>,
    // present for exactly as long as this link is awaiting a response on that
    // backend connection; the value is the next link queued behind it on the
    // same connection, if any.
    pending_backends: FnvHashMap<BackendId, Option<LinkId>>,
}

impl ResponseLink {
    pub fn client(&self) -> Option<ClientId> { self.client }

    pub fn set_client(&mut self, client: Option<ClientId>) { self.client = client; }

    pub fn pending_backend_count(&self) -> usize { self.pending_backends.len() }

    pub fn is_forward_policy(&self) -> bool { matches!(self.policy, CollectionPolicy::Forward) }
}

fn wrong_type_error() -> Response { Response::error_str("PROXYERROR a backend sent a response of the wrong type") }

fn bad_upstream_error() -> Response { Response::error_str("PROXYERROR a backend did not reply") }

/// Owns every live `ResponseLink` in a slab arena, addressed by `LinkId`.
pub struct ResponseLinks {
    arena: Slab<ResponseLink>,
}

impl Default for ResponseLinks {
    fn default() -> Self { ResponseLinks::new() }
}

impl ResponseLinks {
    pub fn new() -> ResponseLinks { ResponseLinks { arena: Slab::new() } }

    pub fn create(&mut self, policy: CollectionPolicy, client: ClientId) -> LinkId {
        let accumulator = Accumulator::for_policy(&policy);
        self.arena.insert(ResponseLink {
            policy,
            accumulator,
            sticky_error: None,
            client: Some(client),
            next_in_client_chain: None,
            pending_backends: FnvHashMap::default(),
        })
    }

    /// A link that's ready the instant it's created, carrying a synthesized
    /// error instead of anything collected from a backend.
    pub fn create_error(&mut self, client: ClientId, error: Response) -> LinkId {
        let link = self.create(CollectionPolicy::Forward, client);
        self.arena[link].sticky_error = Some(error);
        link
    }

    pub fn get(&self, link: LinkId) -> &ResponseLink { &self.arena[link] }

    pub fn get_mut(&mut self, link: LinkId) -> &mut ResponseLink { &mut self.arena[link] }

    pub fn contains(&self, link: LinkId) -> bool { self.arena.contains(link) }

    pub fn is_ready(&self, link: LinkId) -> bool { self.arena[link].pending_backends.is_empty() }

    pub fn client_next(&self, link: LinkId) -> Option<LinkId> { self.arena[link].next_in_client_chain }

    /// Records that `link` is one more sub-command deep on `backend`'s reply
    /// chain, appending it after whatever was previously that chain's tail.
    pub fn link_to_backend(&mut self, link: LinkId, backend: BackendId, backend_tail: Option<LinkId>) {
        self.arena[link].pending_backends.insert(backend, None);
        if let Some(prev_tail) = backend_tail {
            self.arena[prev_tail].pending_backends.insert(backend, Some(link));
        }
    }

    /// Appends `link` to a client's response chain, after whatever was
    /// previously that client's tail.
    pub fn append_to_client_chain(&mut self, link: LinkId, client_tail: Option<LinkId>) {
        if let Some(prev_tail) = client_tail {
            self.arena[prev_tail].next_in_client_chain = Some(link);
        }
    }

    /// Only meaningful for `CollectMultiByKey`: records that the key at the
    /// next recombination position was routed to `backend`.
    pub fn push_recombination_key(&mut self, link: LinkId, backend: BackendId) {
        if let Accumulator::ByBackend { recombination_queue, .. } = &mut self.arena[link].accumulator {
            recombination_queue.push(backend);
        }
    }

    /// Feeds one backend's response into `link`, and returns the link next
    /// queued behind it on that same backend connection (the caller should
    /// make that the new chain head).
    pub fn record_backend_response(
        &mut self,
        link: LinkId,
        backend: BackendId,
        backend_name: &str,
        response: Response,
    ) -> Option<LinkId> {
        let entry = &mut self.arena[link];
        let next = entry.pending_backends.remove(&backend).flatten();

        if entry.sticky_error.is_none() {
            apply_response(entry, backend, backend_name, response);
        }

        next
    }

    /// Forcibly fails `link`'s wait on `backend` (the connection was lost
    /// before it replied), returning the next link queued behind it so the
    /// caller can keep draining that connection's chain. Unlike
    /// `record_backend_response`, this always sets the sticky error.
    pub fn fail_backend(&mut self, link: LinkId, backend: BackendId) -> Option<LinkId> {
        let entry = &mut self.arena[link];
        let next = entry.pending_backends.remove(&backend).flatten();
        if entry.sticky_error.is_none() {
            entry.sticky_error = Some(Response::error_str("CHANNELERROR backend connection was lost"));
        }
        next
    }

    /// Clears `link`'s wait on `backend` without touching its accumulator,
    /// for the forwarding fast path where the response bytes were streamed
    /// straight to the client and never materialized into a `Response` at
    /// all. Returns the next link queued behind it on that connection.
    pub fn clear_backend(&mut self, link: LinkId, backend: BackendId) -> Option<LinkId> {
        self.arena[link].pending_backends.remove(&backend).flatten()
    }

    /// Drops a ready link from the arena without building a response,
    /// because the caller already delivered (or discarded) its bytes some
    /// other way, e.g. the forwarding fast path.
    pub fn discard(&mut self, link: LinkId) { self.arena.remove(link); }

    /// Removes a ready link from the arena and builds its final client-facing
    /// response. Panics if the link isn't ready; callers must check
    /// `is_ready` first.
    pub fn take_ready_response(&mut self, link: LinkId) -> Response {
        let entry = self.arena.remove(link);
        assert!(entry.pending_backends.is_empty(), "link removed before it was ready");

        if let Some(err) = entry.sticky_error {
            return err;
        }

        match entry.policy {
            CollectionPolicy::Forward => match entry.accumulator {
                Accumulator::Forward(Some(r)) => r,
                _ => bad_upstream_error(),
            },
            CollectionPolicy::ModifyScan { backend_index, num_backends } => match entry.accumulator {
                Accumulator::Forward(Some(r)) => finalize_scan(backend_index, num_backends, r),
                _ => bad_upstream_error(),
            },
            CollectionPolicy::CollectStatus => Response::ok(),
            CollectionPolicy::SumInteger => match entry.accumulator {
                Accumulator::IntegerSum(n) => Response::Integer(n),
                _ => unreachable!("SumInteger link without an integer accumulator"),
            },
            CollectionPolicy::CombineMulti => match entry.accumulator {
                Accumulator::Vec(responses) => finalize_combine_multi(responses),
                _ => unreachable!(),
            },
            CollectionPolicy::CollectResponses => match entry.accumulator {
                Accumulator::Vec(responses) => Response::Multi(Some(responses)),
                _ => unreachable!(),
            },
            CollectionPolicy::CollectIdentical => match entry.accumulator {
                Accumulator::Vec(responses) => finalize_collect_identical(responses),
                _ => unreachable!(),
            },
            CollectionPolicy::ModifyScriptExists => match entry.accumulator {
                Accumulator::Vec(responses) => finalize_script_exists(responses),
                _ => unreachable!(),
            },
            CollectionPolicy::ModifyMigrate => match entry.accumulator {
                Accumulator::Vec(responses) => finalize_migrate(responses),
                _ => unreachable!(),
            },
            CollectionPolicy::CollectMultiByKey => match entry.accumulator {
                Accumulator::ByBackend { responses, recombination_queue } => {
                    finalize_collect_multi_by_key(responses, recombination_queue)
                },
                _ => unreachable!(),
            },
        }
    }
}

fn apply_response(entry: &mut ResponseLink, backend: BackendId, backend_name: &str, response: Response) {
    match &entry.policy {
        CollectionPolicy::Forward | CollectionPolicy::ModifyScan { .. } => {
            if let Accumulator::Forward(slot) = &mut entry.accumulator {
                *slot = Some(response);
            }
        },
        CollectionPolicy::CollectStatus => match response {
            Response::Status(_) => {},
            Response::Error(e) => {
                entry.sticky_error = Some(Response::error_str(format!(
                    "CHANNELERROR one or more backends returned error responses: ({}) {}",
                    backend_name,
                    String::from_utf8_lossy(&e)
                )));
            },
            _ => entry.sticky_error = Some(wrong_type_error()),
        },
        CollectionPolicy::SumInteger => match response {
            Response::Integer(i) => {
                if let Accumulator::IntegerSum(sum) = &mut entry.accumulator {
                    *sum += i;
                }
            },
            _ => entry.sticky_error = Some(wrong_type_error()),
        },
        CollectionPolicy::CombineMulti
        | CollectionPolicy::CollectResponses
        | CollectionPolicy::CollectIdentical
        | CollectionPolicy::ModifyScriptExists
        | CollectionPolicy::ModifyMigrate => {
            if let Accumulator::Vec(v) = &mut entry.accumulator {
                v.push(response);
            }
        },
        CollectionPolicy::CollectMultiByKey => match response {
            Response::Multi(Some(_)) => {
                if let Accumulator::ByBackend { responses, .. } = &mut entry.accumulator {
                    responses.insert(backend, response);
                }
            },
            _ => entry.sticky_error = Some(wrong_type_error()),
        },
    }
}

fn finalize_combine_multi(responses: Vec<Response>) -> Response {
    let mut fields = Vec::new();
    for r in responses {
        match r {
            Response::Multi(Some(f)) => fields.extend(f),
            Response::Multi(None) => {},
            _ => return wrong_type_error(),
        }
    }
    Response::Multi(Some(fields))
}

fn finalize_collect_identical(responses: Vec<Response>) -> Response {
    if responses.is_empty() {
        return bad_upstream_error();
    }
    if responses[1..].iter().any(|r| r != &responses[0]) {
        return Response::error_str("PROXYERROR backends returned different responses");
    }
    responses.into_iter().next().unwrap()
}

fn finalize_script_exists(responses: Vec<Response>) -> Response {
    let mut combined: Option<Vec<i64>> = None;
    for r in responses {
        let Response::Multi(Some(fields)) = r else { return wrong_type_error() };
        let mut flags = Vec::with_capacity(fields.len());
        for f in fields {
            match f {
                Response::Integer(i) => flags.push(i),
                _ => return wrong_type_error(),
            }
        }
        match &mut combined {
            None => combined = Some(flags),
            Some(existing) => {
                if existing.len() != flags.len() {
                    return Response::error_str("PROXYERROR backends returned different key counts");
                }
                for (a, b) in existing.iter_mut().zip(flags) {
                    *a &= b;
                }
            },
        }
    }
    match combined {
        Some(flags) => Response::Multi(Some(flags.into_iter().map(Response::Integer).collect())),
        None => Response::error_str("PROXYERROR no backends replied"),
    }
}

fn finalize_migrate(responses: Vec<Response>) -> Response {
    let mut num_ok = 0usize;
    let mut saw_error = false;
    for r in &responses {
        match r {
            Response::Status(s) if s.as_ref() != b"NOKEY" => num_ok += 1,
            Response::Error(_) => saw_error = true,
            _ => {},
        }
    }

    if saw_error {
        return Response::Multi(Some(responses));
    }
    if num_ok > 0 {
        Response::ok()
    } else {
        Response::status("NOKEY")
    }
}

fn finalize_collect_multi_by_key(
    responses: FnvHashMap<BackendId, Response>,
    recombination_queue: Vec<BackendId>,
) -> Response {
    let mut offsets: HashMap<BackendId, usize> = HashMap::new();
    let mut fields = Vec::with_capacity(recombination_queue.len());

    for backend in &recombination_queue {
        let offset = offsets.entry(*backend).or_insert(0);
        let response = match responses.get(backend) {
            Some(r) => r,
            None => return Response::error_str("PROXYERROR a backend did not reply"),
        };
        let Response::Multi(Some(backend_fields)) = response else {
            return Response::error_str("PROXYERROR a backend returned a non-multi response");
        };
        match backend_fields.get(*offset) {
            Some(field) => fields.push(field.clone()),
            None => {
                return Response::error_str("PROXYERROR a backend sent an incorrect key count or did not reply");
            },
        }
        *offset += 1;
    }

    // every backend's whole reply must have been consumed, not just a prefix
    for (backend, response) in &responses {
        let Response::Multi(Some(backend_fields)) = response else {
            return Response::error_str("PROXYERROR a backend returned a non-multi response");
        };
        let used = offsets.get(backend).copied().unwrap_or(0);
        if used != backend_fields.len() {
            return Response::error_str("PROXYERROR did not use all of at least one backend response");
        }
    }

    Response::Multi(Some(fields))
}

/// `ceil(log2(num_backends))`: how many high bits of a 64-bit `SCAN` cursor
/// are reserved to record which backend it refers to.
pub fn scan_index_bits(num_backends: usize) -> u32 {
    if num_backends <= 1 {
        0
    } else {
        64 - ((num_backends - 1) as u64).leading_zeros()
    }
}

pub fn low_bits_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn finalize_scan(backend_index: usize, num_backends: usize, response: Response) -> Response {
    let Response::Multi(Some(mut fields)) = response else { return wrong_type_error() };
    if fields.len() != 2 {
        return wrong_type_error();
    }
    if num_backends <= 1 {
        return Response::Multi(Some(fields));
    }

    let Response::Bulk(Some(cursor_bytes)) = &fields[0] else { return wrong_type_error() };
    let index_bits = scan_index_bits(num_backends);
    let remaining_bits = 64 - index_bits;

    if cursor_bytes.as_ref() == b"0" {
        let next_backend_index = backend_index + 1;
        if next_backend_index < num_backends {
            let cursor_value = (next_backend_index as u64) << remaining_bits;
            fields[0] = Response::bulk(Bytes::from(cursor_value.to_string()));
        }
        // otherwise every backend has been fully scanned; leave the cursor at 0
    } else {
        let cursor_value: u64 = match std::str::from_utf8(cursor_bytes).ok().and_then(|s| s.parse().ok()) {
            Some(v) => v,
            None => return Response::error_str("PROXYERROR the backend returned a non-integer cursor"),
        };
        if cursor_value & !low_bits_mask(remaining_bits) != 0 {
            return Response::error_str("PROXYERROR the backend's keyspace is too large");
        }
        let tagged = cursor_value | ((backend_index as u64) << remaining_bits);
        fields[0] = Response::bulk(Bytes::from(tagged.to_string()));
    }

    Response::Multi(Some(fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_link_becomes_ready_after_its_one_backend_replies() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::Forward, 0);
        links.link_to_backend(link, 0, None);
        assert!(!links.is_ready(link));

        let next = links.record_backend_response(link, 0, "a", Response::status("PONG"));
        assert_eq!(next, None);
        assert!(links.is_ready(link));
        assert_eq!(links.take_ready_response(link), Response::status("PONG"));
    }

    #[test]
    fn sum_integer_adds_across_backends() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::SumInteger, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);

        links.record_backend_response(link, 0, "a", Response::Integer(3));
        assert!(!links.is_ready(link));
        links.record_backend_response(link, 1, "b", Response::Integer(4));
        assert!(links.is_ready(link));
        assert_eq!(links.take_ready_response(link), Response::Integer(7));
    }

    #[test]
    fn collect_status_reports_ok_when_every_backend_is_ok() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::CollectStatus, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);
        links.record_backend_response(link, 0, "a", Response::ok());
        links.record_backend_response(link, 1, "b", Response::ok());
        assert_eq!(links.take_ready_response(link), Response::ok());
    }

    #[test]
    fn collect_status_sticks_with_the_first_error() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::CollectStatus, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);
        links.record_backend_response(link, 0, "a", Response::error_str("ERR boom"));
        // a second backend's response still has to drain off its chain even
        // though the link's outcome is already decided
        links.record_backend_response(link, 1, "b", Response::ok());
        let r = links.take_ready_response(link);
        match r {
            Response::Error(e) => assert!(e.starts_with(b"CHANNELERROR")),
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[test]
    fn combine_multi_concatenates_fields_in_arrival_order() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::CombineMulti, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);
        links.record_backend_response(link, 0, "a", Response::Multi(Some(vec![Response::bulk("x")])));
        links.record_backend_response(link, 1, "b", Response::Multi(Some(vec![Response::bulk("y"), Response::bulk("z")])));
        assert_eq!(
            links.take_ready_response(link),
            Response::Multi(Some(vec![Response::bulk("x"), Response::bulk("y"), Response::bulk("z")]))
        );
    }

    #[test]
    fn collect_responses_wraps_each_backend_whole() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::CollectResponses, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);
        links.record_backend_response(link, 0, "a", Response::ok());
        links.record_backend_response(link, 1, "b", Response::Integer(5));
        assert_eq!(links.take_ready_response(link), Response::Multi(Some(vec![Response::ok(), Response::Integer(5)])));
    }

    #[test]
    fn collect_identical_passes_through_a_unanimous_response() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::CollectIdentical, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);
        links.record_backend_response(link, 0, "a", Response::ok());
        links.record_backend_response(link, 1, "b", Response::ok());
        assert_eq!(links.take_ready_response(link), Response::ok());
    }

    #[test]
    fn collect_identical_errors_on_disagreement() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::CollectIdentical, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);
        links.record_backend_response(link, 0, "a", Response::ok());
        links.record_backend_response(link, 1, "b", Response::status("NOTOK"));
        assert!(matches!(links.take_ready_response(link), Response::Error(_)));
    }

    #[test]
    fn collect_multi_by_key_recombines_in_original_key_order() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::CollectMultiByKey, 0);
        // three keys: k0 -> backend 0, k1 -> backend 1, k2 -> backend 0
        links.push_recombination_key(link, 0);
        links.push_recombination_key(link, 1);
        links.push_recombination_key(link, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);

        links.record_backend_response(
            link,
            0,
            "a",
            Response::Multi(Some(vec![Response::bulk("v0"), Response::bulk("v2")])),
        );
        links.record_backend_response(link, 1, "b", Response::Multi(Some(vec![Response::bulk("v1")])));

        assert_eq!(
            links.take_ready_response(link),
            Response::Multi(Some(vec![Response::bulk("v0"), Response::bulk("v1"), Response::bulk("v2")]))
        );
    }

    #[test]
    fn collect_multi_by_key_rejects_a_short_backend_reply() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::CollectMultiByKey, 0);
        links.push_recombination_key(link, 0);
        links.push_recombination_key(link, 0);
        links.link_to_backend(link, 0, None);
        links.record_backend_response(link, 0, "a", Response::Multi(Some(vec![Response::bulk("only-one")])));
        assert!(matches!(links.take_ready_response(link), Response::Error(_)));
    }

    #[test]
    fn script_exists_bitwise_ands_flags() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::ModifyScriptExists, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);
        links.record_backend_response(link, 0, "a", Response::Multi(Some(vec![Response::Integer(1), Response::Integer(0)])));
        links.record_backend_response(link, 1, "b", Response::Multi(Some(vec![Response::Integer(1), Response::Integer(1)])));
        assert_eq!(
            links.take_ready_response(link),
            Response::Multi(Some(vec![Response::Integer(1), Response::Integer(0)]))
        );
    }

    #[test]
    fn migrate_reports_nokey_only_when_nothing_moved() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::ModifyMigrate, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);
        links.record_backend_response(link, 0, "a", Response::status("NOKEY"));
        links.record_backend_response(link, 1, "b", Response::status("NOKEY"));
        assert_eq!(links.take_ready_response(link), Response::status("NOKEY"));
    }

    #[test]
    fn migrate_surfaces_per_backend_errors_as_a_multi() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::ModifyMigrate, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);
        links.record_backend_response(link, 0, "a", Response::ok());
        links.record_backend_response(link, 1, "b", Response::error_str("ERR nope"));
        assert!(matches!(links.take_ready_response(link), Response::Multi(Some(_))));
    }

    #[test]
    fn scan_index_bits_matches_ceil_log2() {
        assert_eq!(scan_index_bits(1), 0);
        assert_eq!(scan_index_bits(2), 1);
        assert_eq!(scan_index_bits(3), 2);
        assert_eq!(scan_index_bits(4), 2);
        assert_eq!(scan_index_bits(5), 3);
        assert_eq!(scan_index_bits(1000), 10);
    }

    #[test]
    fn scan_cursor_tags_the_backend_that_produced_it() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::ModifyScan { backend_index: 1, num_backends: 4 }, 0);
        links.link_to_backend(link, 0, None);
        let reply = Response::Multi(Some(vec![Response::bulk("12345"), Response::empty_multi()]));
        links.record_backend_response(link, 0, "a", reply);
        let r = links.take_ready_response(link);
        let Response::Multi(Some(fields)) = r else { panic!("expected a multi response") };
        let Response::Bulk(Some(cursor)) = &fields[0] else { panic!("expected a bulk cursor") };
        let cursor_value: u64 = std::str::from_utf8(cursor).unwrap().parse().unwrap();
        assert_eq!(cursor_value >> (64 - scan_index_bits(4)), 1);
        assert_eq!(cursor_value & low_bits_mask(64 - scan_index_bits(4)), 12345);
    }

    #[test]
    fn scan_cursor_advances_to_the_next_backend_once_exhausted() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::ModifyScan { backend_index: 0, num_backends: 2 }, 0);
        links.link_to_backend(link, 0, None);
        let reply = Response::Multi(Some(vec![Response::bulk("0"), Response::empty_multi()]));
        links.record_backend_response(link, 0, "a", reply);
        let r = links.take_ready_response(link);
        let Response::Multi(Some(fields)) = r else { panic!("expected a multi response") };
        let Response::Bulk(Some(cursor)) = &fields[0] else { panic!("expected a bulk cursor") };
        let cursor_value: u64 = std::str::from_utf8(cursor).unwrap().parse().unwrap();
        assert_eq!(cursor_value >> (64 - scan_index_bits(2)), 1);
    }

    #[test]
    fn scan_cursor_reaches_zero_once_the_last_backend_is_exhausted() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::ModifyScan { backend_index: 1, num_backends: 2 }, 0);
        links.link_to_backend(link, 0, None);
        let reply = Response::Multi(Some(vec![Response::bulk("0"), Response::empty_multi()]));
        links.record_backend_response(link, 0, "a", reply);
        let r = links.take_ready_response(link);
        assert_eq!(r, Response::Multi(Some(vec![Response::bulk("0"), Response::empty_multi()])));
    }

    #[test]
    fn fail_backend_poisons_the_link_but_keeps_draining_other_backends() {
        let mut links = ResponseLinks::new();
        let link = links.create(CollectionPolicy::CollectResponses, 0);
        links.link_to_backend(link, 0, None);
        links.link_to_backend(link, 1, None);
        links.fail_backend(link, 0);
        assert!(!links.is_ready(link));
        links.record_backend_response(link, 1, "b", Response::ok());
        assert!(links.is_ready(link));
        assert!(matches!(links.take_ready_response(link), Response::Error(_)));
    }

    #[test]
    fn client_chain_order_is_fifo() {
        let mut links = ResponseLinks::new();
        let a = links.create(CollectionPolicy::Forward, 0);
        links.append_to_client_chain(a, None);
        let b = links.create(CollectionPolicy::Forward, 0);
        links.append_to_client_chain(b, Some(a));
        assert_eq!(links.client_next(a), Some(b));
        assert_eq!(links.client_next(b), None);
    }
}
