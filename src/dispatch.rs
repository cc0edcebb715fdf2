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
//! The command dispatch table: a static map from uppercased command name to
//! how that command is handled. Every entry is plain data describing one of
//! the five key-extraction strategies (or one of the handful of commands
//! whose argv shape needs bespoke parsing); `engine.rs` reads these entries
//! to decide how to route a parsed command, the same way the upstream
//! project's name → member-function-pointer table decided which method to
//! call. A `phf::Map` keeps the lookup itself branch-free and allocation-free.
use phf::phf_map;

/// Which partition-by-key collection policy a `PartitionKeys` entry uses.
/// A thin, `Copy` mirror of the corresponding `link::CollectionPolicy`
/// variants, which carry per-instance data `CommandTableEntry` has no room
/// (or need) to hold statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPolicy {
    SumInteger,
    MultiByKey,
    Status,
}

/// Which broadcast-to-all-backends collection policy a `ForwardAll` entry
/// uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardAllPolicy {
    CollectResponses,
    CollectStatus,
    SumInteger,
    CombineMulti,
}

/// One row of the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTableEntry {
    /// Route to the backend for the key at a fixed argv index.
    KeyAtIndex(usize),
    /// Every key from `start` to the end of argv must hash to the same
    /// backend; route to that one.
    KeysShareBackend { start: usize },
    /// Partition argv into per-backend sub-commands.
    PartitionKeys { start: usize, args_per_key: usize, interleaved: bool, policy: PartitionPolicy },
    /// Broadcast unchanged to every backend.
    ForwardAll(ForwardAllPolicy),
    /// Route to one backend chosen uniformly at random.
    RandomBackend,
    /// `MSETNX`: like a partitioned `MSET`, but all keys must share a single
    /// backend (cross-shard `MSETNX` can't be made atomic, so it's rejected
    /// rather than silently only partially enforced).
    MSetNx,
    /// `SCAN`: cursor encodes which backend to continue from.
    Scan,
    /// `MIGRATE`: old single-key form or new multi-key `KEYS` form.
    Migrate,
    /// `SCRIPT EXISTS|FLUSH|LOAD`.
    Script,
    Ping,
    Echo,
    Quit,
    Backend,
    BackendNum,
    Backends,
    Forward,
    Info,
    Role,
    PrintState,
    Client,
    /// Explicitly refused; matches `spec.md`'s unimplemented-command list.
    Unimplemented,
}

pub static COMMANDS: phf::Map<&'static str, CommandTableEntry> = phf_map! {
    // single key at a fixed index
    "GET" => CommandTableEntry::KeyAtIndex(1),
    "SET" => CommandTableEntry::KeyAtIndex(1),
    "SETEX" => CommandTableEntry::KeyAtIndex(1),
    "APPEND" => CommandTableEntry::KeyAtIndex(1),
    "INCR" => CommandTableEntry::KeyAtIndex(1),
    "INCRBY" => CommandTableEntry::KeyAtIndex(1),
    "DECR" => CommandTableEntry::KeyAtIndex(1),
    "DECRBY" => CommandTableEntry::KeyAtIndex(1),
    "GETSET" => CommandTableEntry::KeyAtIndex(1),
    "GETRANGE" => CommandTableEntry::KeyAtIndex(1),
    "TTL" => CommandTableEntry::KeyAtIndex(1),
    "TYPE" => CommandTableEntry::KeyAtIndex(1),
    "PERSIST" => CommandTableEntry::KeyAtIndex(1),
    "EXPIRE" => CommandTableEntry::KeyAtIndex(1),
    "HGET" => CommandTableEntry::KeyAtIndex(1),
    "HSET" => CommandTableEntry::KeyAtIndex(1),
    "HGETALL" => CommandTableEntry::KeyAtIndex(1),
    "HDEL" => CommandTableEntry::KeyAtIndex(1),
    "HMGET" => CommandTableEntry::KeyAtIndex(1),
    "HMSET" => CommandTableEntry::KeyAtIndex(1),
    "LPUSH" => CommandTableEntry::KeyAtIndex(1),
    "RPUSH" => CommandTableEntry::KeyAtIndex(1),
    "LPOP" => CommandTableEntry::KeyAtIndex(1),
    "RPOP" => CommandTableEntry::KeyAtIndex(1),
    "LRANGE" => CommandTableEntry::KeyAtIndex(1),
    "LLEN" => CommandTableEntry::KeyAtIndex(1),
    "SADD" => CommandTableEntry::KeyAtIndex(1),
    "SMEMBERS" => CommandTableEntry::KeyAtIndex(1),
    "SORT" => CommandTableEntry::KeyAtIndex(1),
    "ZADD" => CommandTableEntry::KeyAtIndex(1),
    "ZSCORE" => CommandTableEntry::KeyAtIndex(1),
    "ZRANGE" => CommandTableEntry::KeyAtIndex(1),

    // all keys in the argv must share a backend
    "RENAME" => CommandTableEntry::KeysShareBackend { start: 1 },
    "RENAMENX" => CommandTableEntry::KeysShareBackend { start: 1 },
    "SUNIONSTORE" => CommandTableEntry::KeysShareBackend { start: 1 },

    // partition by key
    "DEL" => CommandTableEntry::PartitionKeys { start: 1, args_per_key: 1, interleaved: false, policy: PartitionPolicy::SumInteger },
    "EXISTS" => CommandTableEntry::PartitionKeys { start: 1, args_per_key: 1, interleaved: false, policy: PartitionPolicy::SumInteger },
    "UNLINK" => CommandTableEntry::PartitionKeys { start: 1, args_per_key: 1, interleaved: false, policy: PartitionPolicy::SumInteger },
    "TOUCH" => CommandTableEntry::PartitionKeys { start: 1, args_per_key: 1, interleaved: false, policy: PartitionPolicy::SumInteger },
    "MGET" => CommandTableEntry::PartitionKeys { start: 1, args_per_key: 1, interleaved: false, policy: PartitionPolicy::MultiByKey },
    "MSET" => CommandTableEntry::PartitionKeys { start: 1, args_per_key: 2, interleaved: true, policy: PartitionPolicy::Status },

    // broadcast to all backends
    "LASTSAVE" => CommandTableEntry::ForwardAll(ForwardAllPolicy::CollectResponses),
    "CONFIG" => CommandTableEntry::ForwardAll(ForwardAllPolicy::CollectResponses),
    "FLUSHALL" => CommandTableEntry::ForwardAll(ForwardAllPolicy::CollectStatus),
    "FLUSHDB" => CommandTableEntry::ForwardAll(ForwardAllPolicy::CollectStatus),
    "BGSAVE" => CommandTableEntry::ForwardAll(ForwardAllPolicy::CollectStatus),
    "BGREWRITEAOF" => CommandTableEntry::ForwardAll(ForwardAllPolicy::CollectStatus),
    "DBSIZE" => CommandTableEntry::ForwardAll(ForwardAllPolicy::SumInteger),
    "KEYS" => CommandTableEntry::ForwardAll(ForwardAllPolicy::CombineMulti),

    // random backend
    "COMMAND" => CommandTableEntry::RandomBackend,
    "LOLWUT" => CommandTableEntry::RandomBackend,

    // bespoke argv handling
    "MSETNX" => CommandTableEntry::MSetNx,
    "SCAN" => CommandTableEntry::Scan,
    "MIGRATE" => CommandTableEntry::Migrate,
    "SCRIPT" => CommandTableEntry::Script,

    // proxy-synthesized administrative commands
    "PING" => CommandTableEntry::Ping,
    "ECHO" => CommandTableEntry::Echo,
    "QUIT" => CommandTableEntry::Quit,
    "BACKEND" => CommandTableEntry::Backend,
    "BACKENDNUM" => CommandTableEntry::BackendNum,
    "BACKENDS" => CommandTableEntry::Backends,
    "FORWARD" => CommandTableEntry::Forward,
    "INFO" => CommandTableEntry::Info,
    "ROLE" => CommandTableEntry::Role,
    "PRINTSTATE" => CommandTableEntry::PrintState,
    "CLIENT" => CommandTableEntry::Client,

    // explicitly unimplemented
    "AUTH" => CommandTableEntry::Unimplemented,
    "BLPOP" => CommandTableEntry::Unimplemented,
    "BRPOP" => CommandTableEntry::Unimplemented,
    "BRPOPLPUSH" => CommandTableEntry::Unimplemented,
    "BZPOPMAX" => CommandTableEntry::Unimplemented,
    "BZPOPMIN" => CommandTableEntry::Unimplemented,
    "CLUSTER" => CommandTableEntry::Unimplemented,
    "DISCARD" => CommandTableEntry::Unimplemented,
    "EXEC" => CommandTableEntry::Unimplemented,
    "MONITOR" => CommandTableEntry::Unimplemented,
    "MOVE" => CommandTableEntry::Unimplemented,
    "MULTI" => CommandTableEntry::Unimplemented,
    "PSUBSCRIBE" => CommandTableEntry::Unimplemented,
    "PUBLISH" => CommandTableEntry::Unimplemented,
    "PUBSUB" => CommandTableEntry::Unimplemented,
    "PUNSUBSCRIBE" => CommandTableEntry::Unimplemented,
    "READONLY" => CommandTableEntry::Unimplemented,
    "READWRITE" => CommandTableEntry::Unimplemented,
    "SELECT" => CommandTableEntry::Unimplemented,
    "SLAVEOF" => CommandTableEntry::Unimplemented,
    "SUBSCRIBE" => CommandTableEntry::Unimplemented,
    "SWAPDB" => CommandTableEntry::Unimplemented,
    "SYNC" => CommandTableEntry::Unimplemented,
    "UNSUBSCRIBE" => CommandTableEntry::Unimplemented,
    "UNWATCH" => CommandTableEntry::Unimplemented,
    "WAIT" => CommandTableEntry::Unimplemented,
    "WATCH" => CommandTableEntry::Unimplemented,
};

/// Looks up how `name` (already uppercased) should be dispatched. `None`
/// means the command is entirely unknown to the proxy.
pub fn lookup(name: &str) -> Option<CommandTableEntry> { COMMANDS.get(name).copied() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_extraction_strategy_has_at_least_one_command() {
        assert_eq!(lookup("GET"), Some(CommandTableEntry::KeyAtIndex(1)));
        assert_eq!(lookup("RENAME"), Some(CommandTableEntry::KeysShareBackend { start: 1 }));
        assert_eq!(
            lookup("MGET"),
            Some(CommandTableEntry::PartitionKeys {
                start: 1,
                args_per_key: 1,
                interleaved: false,
                policy: PartitionPolicy::MultiByKey
            })
        );
        assert_eq!(lookup("KEYS"), Some(CommandTableEntry::ForwardAll(ForwardAllPolicy::CombineMulti)));
        assert_eq!(lookup("COMMAND"), Some(CommandTableEntry::RandomBackend));
    }

    #[test]
    fn unknown_command_is_not_in_the_table() {
        assert_eq!(lookup("NOTACOMMAND"), None);
    }

    #[test]
    fn unimplemented_commands_are_all_present() {
        for name in ["AUTH", "MULTI", "WATCH", "SUBSCRIBE", "WAIT"] {
            assert_eq!(lookup(name), Some(CommandTableEntry::Unimplemented));
        }
    }

    #[test]
    fn lookup_is_case_sensitive_on_the_uppercased_name() {
        // callers are responsible for uppercasing before calling lookup;
        // this documents that the table itself doesn't do it.
        assert_eq!(lookup("get"), None);
    }
}
