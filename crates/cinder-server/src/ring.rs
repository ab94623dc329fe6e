//! Consistent-hash ring for routing clients.
//!
//! Each endpoint contributes a fixed number of virtual points; their 32-bit
//! tokens are CRC-32 hashes of the endpoint address and replica index. The
//! ring is an immutable sorted vector after construction, so lookups are a
//! hash plus a binary search, and growing the pool by one endpoint only
//! remaps the keys whose token arcs the new points claim.

use crc32fast::Hasher;

/// Virtual points per endpoint. High enough that token arcs stay small and
/// key movement on membership changes approaches the ideal `1/(n+1)`.
const MAX_RING_REPLICATION: usize = 40;

/// One routable server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Network address of the endpoint, e.g. `"127.0.0.1:6379"`.
    pub addr: String,
}

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Endpoint {
        Endpoint { addr: addr.into() }
    }
}

#[derive(Debug, Clone, Copy)]
struct RingEntry {
    token: u32,
    endpoint: usize,
}

/// An immutable consistent-hash ring over a set of endpoints.
#[derive(Debug, Clone)]
pub struct HashRing {
    endpoints: Vec<Endpoint>,
    entries: Vec<RingEntry>,
}

fn hash_token(data: &[u8], replica: usize) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.update(&(replica as u32).to_be_bytes());
    hasher.finalize()
}

impl HashRing {
    /// Builds a ring from the given endpoints.
    pub fn new(endpoints: Vec<Endpoint>) -> HashRing {
        let mut entries = Vec::with_capacity(endpoints.len() * MAX_RING_REPLICATION);
        for (index, endpoint) in endpoints.iter().enumerate() {
            for replica in 0..MAX_RING_REPLICATION {
                entries.push(RingEntry {
                    token: hash_token(endpoint.addr.as_bytes(), replica),
                    endpoint: index,
                });
            }
        }
        entries.sort_by_key(|entry| entry.token);
        HashRing { endpoints, entries }
    }

    /// Number of endpoints on the ring.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Looks up the endpoint owning `key`.
    ///
    /// Deterministic: the same key always maps to the same endpoint on the
    /// same ring. Returns `None` only for an empty ring.
    pub fn lookup(&self, key: impl AsRef<[u8]>) -> Option<&Endpoint> {
        if self.entries.is_empty() {
            return None;
        }
        let mut hasher = Hasher::new();
        hasher.update(key.as_ref());
        let hash = hasher.finalize();

        // first token >= hash, wrapping to the front of the ring
        let position = self.entries.partition_point(|entry| entry.token < hash);
        let entry = if position == self.entries.len() {
            self.entries[0]
        } else {
            self.entries[position]
        };
        Some(&self.endpoints[entry.endpoint])
    }
}
