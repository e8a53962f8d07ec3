//! Connection map: address → connection lookup with flood detection, backed by an
//! open-addressed hash table probed with a linear-congruential sequence.
//!
//! A single table-wide reader-writer lock stands in for a refcounted-entry scheme, and iteration
//! snapshots one slot at a time rather than holding the lock across the whole walk, so a live
//! insert is never blocked for longer than a single slot read.

use crate::addr::NetAddr;
use crate::connection::Connection;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

pub const HASH_TABLE_SIZE: usize = 32768;
pub const HASH_TABLE_MASK: u32 = (HASH_TABLE_SIZE - 1) as u32;
pub const MAX_POPULATION: usize = HASH_TABLE_SIZE / 2;
pub const CONNECTION_FLOOD_THRESHOLD: usize = 10;

// (multiplier - 1) divisible by all prime factors of the table size; table size is a power of
// two so this is also a multiple of 4. From Press, Teukolsky, Vetterling & Flannery's
// "Numerical Recipes" LCG constants, as carried in `SphynxTransport.hpp`.
const COLLISION_MULTIPLIER: u32 = 71 * 5861 * 4 + 1;
const COLLISION_INCREMENTER: u32 = 1013904223;

#[derive(Clone)]
struct Slot {
    addr: NetAddr,
    conn: Option<Arc<Connection>>,
    /// Set when a later insertion's probe chain passed through this slot; never cleared on
    /// removal, since doing it lazily avoids rewriting the whole chain on every disconnect.
    collision: bool,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            addr: NetAddr::INVALID,
            conn: None,
            collision: false,
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    population: usize,
}

impl Inner {
    fn initial_index(addr: &NetAddr) -> u32 {
        let mut bytes = [0u8; 19];
        addr.hash_bytes(&mut bytes);
        let hash = blake3::hash(&bytes);
        u32::from_le_bytes(hash.as_bytes()[..4].try_into().expect("4 bytes")) & HASH_TABLE_MASK
    }

    #[inline]
    fn next_index(k: u32) -> u32 {
        k.wrapping_mul(COLLISION_MULTIPLIER)
            .wrapping_add(COLLISION_INCREMENTER)
            & HASH_TABLE_MASK
    }

    fn remove(&mut self, addr: &NetAddr) -> bool {
        let mut k = Self::initial_index(addr);
        loop {
            let slot = &mut self.slots[k as usize];
            if slot.conn.is_some() && slot.addr == *addr {
                slot.conn = None;
                self.population -= 1;
                return true;
            }
            if slot.conn.is_none() && !slot.collision {
                return false;
            }
            k = Self::next_index(k);
        }
    }
}

/// Outcome of a combined lookup-and-flood-check.
#[derive(Clone)]
pub enum Lookup {
    Found(Arc<Connection>),
    NotFound,
    Flooded,
}

pub struct ConnectionMap {
    inner: RwLock<Inner>,
    /// Removals requested while an iterator is outstanding; applied when the last iterator
    /// drops, mirroring the Collexion pattern's "mark during iteration, sweep after" semantics.
    pending_removals: Mutex<Vec<NetAddr>>,
    active_iterators: std::sync::atomic::AtomicUsize,
}

impl ConnectionMap {
    pub fn new() -> ConnectionMap {
        ConnectionMap {
            inner: RwLock::new(Inner {
                slots: vec![Slot::empty(); HASH_TABLE_SIZE],
                population: 0,
            }),
            pending_removals: Mutex::new(Vec::new()),
            active_iterators: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().population
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address lookup combined with flood detection: a probe chain deeper than
    /// `CONNECTION_FLOOD_THRESHOLD` without reaching a matching connection or an empty slot
    /// means too many distinct addresses are colliding on this bucket.
    pub fn lookup_check_flood(&self, addr: &NetAddr) -> Lookup {
        let inner = self.inner.read();
        let mut k = Inner::initial_index(addr);
        let mut depth = 0usize;
        loop {
            let slot = &inner.slots[k as usize];
            if let Some(conn) = &slot.conn {
                if slot.addr == *addr {
                    return Lookup::Found(conn.clone());
                }
            } else if !slot.collision {
                return Lookup::NotFound;
            }
            depth += 1;
            if depth > CONNECTION_FLOOD_THRESHOLD {
                return Lookup::Flooded;
            }
            k = Inner::next_index(k);
        }
    }

    /// Insert a new connection. Returns `false` if the map is at `MAX_POPULATION` or the probe
    /// chain wraps the whole table (the latter should never happen below `MAX_POPULATION`).
    pub fn insert(&self, addr: NetAddr, conn: Arc<Connection>) -> bool {
        let mut inner = self.inner.write();
        if inner.population >= MAX_POPULATION {
            return false;
        }
        let mut k = Inner::initial_index(&addr);
        for _ in 0..HASH_TABLE_SIZE {
            if inner.slots[k as usize].conn.is_none() {
                inner.slots[k as usize] = Slot {
                    addr,
                    conn: Some(conn),
                    collision: false,
                };
                inner.population += 1;
                return true;
            }
            inner.slots[k as usize].collision = true;
            k = Inner::next_index(k);
        }
        false
    }

    pub fn remove(&self, addr: &NetAddr) {
        if self.active_iterators.load(std::sync::atomic::Ordering::Acquire) > 0 {
            self.pending_removals.lock().push(*addr);
            return;
        }
        self.inner.write().remove(addr);
    }

    /// Walk every live connection. Each step takes the read lock only long enough to clone one
    /// slot's `Arc`, so a concurrent insert is never blocked for more than a single slot.
    /// Removals requested during the walk are deferred until the iterator is dropped.
    pub fn iter(&self) -> ConnectionIter<'_> {
        self.active_iterators
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        ConnectionIter { map: self, index: 0 }
    }
}

impl Default for ConnectionMap {
    fn default() -> ConnectionMap {
        ConnectionMap::new()
    }
}

pub struct ConnectionIter<'a> {
    map: &'a ConnectionMap,
    index: usize,
}

impl<'a> Iterator for ConnectionIter<'a> {
    type Item = Arc<Connection>;

    fn next(&mut self) -> Option<Arc<Connection>> {
        let inner = self.map.inner.read();
        while self.index < inner.slots.len() {
            let slot = &inner.slots[self.index];
            self.index += 1;
            if let Some(conn) = &slot.conn {
                return Some(conn.clone());
            }
        }
        None
    }
}

impl<'a> Drop for ConnectionIter<'a> {
    fn drop(&mut self) {
        if self.map.active_iterators.fetch_sub(1, std::sync::atomic::Ordering::AcqRel) == 1 {
            let mut pending = self.map.pending_removals.lock();
            if !pending.is_empty() {
                let mut inner = self.map.inner.write();
                for addr in pending.drain(..) {
                    inner.remove(&addr);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::dummy_connection;
    use std::net::SocketAddr;

    fn addr(s: &str) -> NetAddr {
        NetAddr::from_socket_addr(s.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn insert_and_lookup() {
        let map = ConnectionMap::new();
        let a = addr("1.2.3.4:1000");
        map.insert(a, dummy_connection(a, 0));
        match map.lookup_check_flood(&a) {
            Lookup::Found(_) => {}
            _ => panic!("expected Found"),
        }
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn missing_address_not_found() {
        let map = ConnectionMap::new();
        let a = addr("1.2.3.4:1000");
        map.insert(a, dummy_connection(a, 0));
        let b = addr("5.6.7.8:1000");
        assert!(matches!(map.lookup_check_flood(&b), Lookup::NotFound));
    }

    #[test]
    fn remove_then_lookup_misses() {
        let map = ConnectionMap::new();
        let a = addr("1.2.3.4:1000");
        map.insert(a, dummy_connection(a, 0));
        map.remove(&a);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn iteration_defers_removal() {
        let map = ConnectionMap::new();
        let a = addr("1.2.3.4:1000");
        map.insert(a, dummy_connection(a, 0));
        let mut iter = map.iter();
        map.remove(&a);
        // still present while the iterator is alive: the removal was queued.
        assert_eq!(map.len(), 1);
        assert!(iter.next().is_some());
        drop(iter);
        assert_eq!(map.len(), 0);
    }
}
