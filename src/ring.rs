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
use fnv::FnvHashMap;
use md5::{Digest, Md5};

const POINTS_PER_SERVER: usize = 160;

/// One backend server: its network address and the logical name used to derive
/// its ring points and to answer `BACKENDS`/`BACKEND`-family admin commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub host: String,
    pub port: u16,
    pub name: String,
}

impl BackendSpec {
    pub fn new(host: impl Into<String>, port: u16, name: impl Into<String>) -> BackendSpec {
        BackendSpec { host: host.into(), port, name: name.into() }
    }
}

/// Optional hash-tag delimiters used to pick a substring of a key to hash,
/// instead of the whole key, so related keys can be co-located.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashTagConfig {
    pub begin: Option<u8>,
    pub end: Option<u8>,
}

impl HashTagConfig {
    pub fn new(begin: Option<u8>, end: Option<u8>) -> HashTagConfig { HashTagConfig { begin, end } }

    /// Extracts the substring of `key` that should actually be hashed, per the
    /// asymmetric rules described in the design notes: when only one delimiter is
    /// configured, the missing partner is treated as the opposite end of the key.
    /// This asymmetry is intentional and preserved rather than "fixed."
    pub fn extract<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        match (self.begin, self.end) {
            (Some(b), Some(e)) => {
                let start = match key.iter().position(|&c| c == b) {
                    Some(p) => p + 1,
                    None => return key,
                };
                let end = match key[start..].iter().rposition(|&c| c == e) {
                    Some(p) => start + p,
                    None => return key,
                };
                if start >= end {
                    return key;
                }
                &key[start..end]
            },
            (Some(b), None) => match key.iter().position(|&c| c == b) {
                Some(p) => &key[p + 1..],
                None => key,
            },
            (None, Some(e)) => match key.iter().rposition(|&c| c == e) {
                Some(p) => &key[..p],
                None => key,
            },
            (None, None) => key,
        }
    }
}

/// FNV-1a, truncated to 32 bits, used to fingerprint keys for ring lookups.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A sorted (hash, backend-index) ring built with the ketama placement scheme:
/// each backend gets `points_per_host` points, four per MD5 digest of
/// `"{name}-{j}"`, rounded down to a multiple of four so every digest is fully
/// used. Immutable after construction; lookups binary-search for the first point
/// at or after a key's fingerprint, wrapping around.
pub struct Ring {
    backends: Vec<BackendSpec>,
    points: Vec<(u32, usize)>,
    name_to_index: FnvHashMap<String, usize>,
    hash_tags: HashTagConfig,
}

impl Ring {
    pub fn new(backends: Vec<BackendSpec>, hash_tags: HashTagConfig) -> Ring {
        let n = backends.len();
        let mut points = Vec::new();
        let mut name_to_index = FnvHashMap::default();

        for (index, backend) in backends.iter().enumerate() {
            name_to_index.insert(backend.name.clone(), index);

            if n == 0 {
                continue;
            }
            // ketama-style placement: each backend's share of the ring is proportional
            // to its weight over the total weight. With no weighting, every backend's
            // share is 1/n, so this always works out to POINTS_PER_SERVER regardless of
            // n -- written out in full to match the reference placement formula exactly.
            let share = 1.0 / n as f64;
            // the f64 product lands infinitesimally under a multiple of 4 for some n
            // (7, 14, 28, ...); nudge it up before flooring so those counts don't lose points.
            let points_per_host = (share * (POINTS_PER_SERVER as f64 / 4.0) * n as f64 + 0.0000000001).floor() as usize * 4;
            for j in 0..(points_per_host / 4) {
                let input = format!("{}-{}", backend.name, j);
                let digest = Md5::digest(input.as_bytes());
                for chunk in digest.chunks_exact(4) {
                    let hash = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push((hash, index));
                }
            }
        }

        points.sort_by_key(|&(hash, _)| hash);

        Ring { backends, points, name_to_index, hash_tags }
    }

    pub fn backends(&self) -> &[BackendSpec] { &self.backends }

    pub fn backend_index_by_name(&self, name: &str) -> Option<usize> { self.name_to_index.get(name).copied() }

    pub fn hash_tags(&self) -> HashTagConfig { self.hash_tags }

    /// Maps a key to a backend index via the ring. Panics only if constructed with
    /// zero backends, which `ProxyConfig` validation rejects before this is ever
    /// called.
    pub fn backend_index_for_key(&self, key: &[u8]) -> usize {
        let tagged = self.hash_tags.extract(key);
        let fingerprint = fnv1a_32(tagged);
        self.backend_index_for_fingerprint(fingerprint)
    }

    fn backend_index_for_fingerprint(&self, fingerprint: u32) -> usize {
        let idx = match self.points.binary_search_by_key(&fingerprint, |&(hash, _)| hash) {
            Ok(i) => i,
            Err(i) => i,
        };
        let idx = if idx >= self.points.len() { 0 } else { idx };
        self.points[idx].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_backends() -> Vec<BackendSpec> {
        vec![
            BackendSpec::new("10.0.0.1", 6379, "a"),
            BackendSpec::new("10.0.0.2", 6379, "b"),
            BackendSpec::new("10.0.0.3", 6379, "c"),
        ]
    }

    #[test]
    fn construction_is_deterministic() {
        let r1 = Ring::new(three_backends(), HashTagConfig::default());
        let r2 = Ring::new(three_backends(), HashTagConfig::default());
        assert_eq!(r1.points, r2.points);

        for key in ["a", "b", "foo", "user:42", ""] {
            assert_eq!(r1.backend_index_for_key(key.as_bytes()), r2.backend_index_for_key(key.as_bytes()));
        }
    }

    #[test]
    fn hash_tags_co_locate_keys() {
        let cfg = HashTagConfig::new(Some(b'{'), Some(b'}'));
        let ring = Ring::new(three_backends(), cfg);

        let a = ring.backend_index_for_key(b"prefix{tag}suffix");
        let b = ring.backend_index_for_key(b"other{tag}other2");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_tag_missing_partner_falls_back_per_asymmetric_rule() {
        let cfg = HashTagConfig::new(Some(b'{'), None);
        assert_eq!(cfg.extract(b"user{42"), b"42");
        assert_eq!(cfg.extract(b"user42"), b"user42");

        let cfg = HashTagConfig::new(None, Some(b'}'));
        assert_eq!(cfg.extract(b"42}suffix"), b"42");
        assert_eq!(cfg.extract(b"nobrace"), b"nobrace");
    }

    #[test]
    fn empty_or_malformed_tag_range_hashes_whole_key() {
        let cfg = HashTagConfig::new(Some(b'{'), Some(b'}'));
        assert_eq!(cfg.extract(b"user{}"), b"user{}");
        assert_eq!(cfg.extract(b"user}{"), b"user}{");
    }

    #[test]
    fn lookup_wraps_past_the_last_point() {
        let ring = Ring::new(three_backends(), HashTagConfig::default());
        // The point with the maximum hash value should be reachable, and a
        // fingerprint greater than every point should wrap to the first one.
        let max_hash = ring.points.last().unwrap().0;
        assert_eq!(ring.backend_index_for_fingerprint(max_hash), ring.points.last().unwrap().1);
        if max_hash < u32::MAX {
            assert_eq!(ring.backend_index_for_fingerprint(u32::MAX), ring.points[0].1);
        }
    }
}
