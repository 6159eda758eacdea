//! Lease records and the pluggable lease store.
//!
//! The store keeps two invariants: each address belongs to at most one
//! lease, and each (DUID, IAID, subnet-id) binding holds at most one
//! lease. The default backend is an in-memory map; persistent backends
//! implement the same trait and may block, which callers treat as
//! synchronous.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::duid::Duid;
use crate::error::{Error, Result};

/// A server-side IA_NA binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease6 {
    pub addr: Ipv6Addr,
    pub duid: Duid,
    pub iaid: u32,
    pub subnet_id: u32,
    pub t1: u32,
    pub t2: u32,
    pub preferred: u32,
    pub valid: u32,
    /// Client-last-transaction-time.
    pub cltt: DateTime<Utc>,
}

impl Lease6 {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: Ipv6Addr,
        duid: Duid,
        iaid: u32,
        subnet_id: u32,
        t1: u32,
        t2: u32,
        preferred: u32,
        valid: u32,
    ) -> Self {
        Self {
            addr,
            duid,
            iaid,
            subnet_id,
            t1,
            t2,
            preferred,
            valid,
            cltt: Utc::now(),
        }
    }
}

/// Abstract lease persistence. Operations are synchronous and
/// total-ordered per key.
pub trait LeaseStore: Send + Sync {
    /// Inserts a new lease; fails with [`Error::DuplicateLease`] when the
    /// address or the (DUID, IAID, subnet-id) binding is already leased.
    fn add(&self, lease: Lease6) -> Result<()>;

    fn get_by_address(&self, addr: Ipv6Addr) -> Option<Lease6>;

    fn get_by_client(&self, duid: &Duid, iaid: u32, subnet_id: u32) -> Option<Lease6>;

    /// Replaces an existing lease; fails with [`Error::LeaseNotFound`]
    /// when the address is not leased.
    fn update(&self, lease: Lease6) -> Result<()>;

    /// Removes the lease for `addr`; returns whether one was removed.
    fn delete(&self, addr: Ipv6Addr) -> bool;
}

type ClientKey = (Vec<u8>, u32, u32);

fn client_key(duid: &Duid, iaid: u32, subnet_id: u32) -> ClientKey {
    (duid.as_slice().to_vec(), iaid, subnet_id)
}

/// In-memory lease store: address-keyed map plus a binding index, guarded
/// by one lock so concurrent callers see linearizable semantics.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    by_addr: HashMap<Ipv6Addr, Lease6>,
    by_client: HashMap<ClientKey, Ipv6Addr>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease_count(&self) -> usize {
        self.state
            .read()
            .expect("lease store lock poisoned")
            .by_addr
            .len()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn add(&self, lease: Lease6) -> Result<()> {
        let mut state = self.state.write().expect("lease store lock poisoned");

        if state.by_addr.contains_key(&lease.addr) {
            return Err(Error::DuplicateLease(lease.addr));
        }
        let key = client_key(&lease.duid, lease.iaid, lease.subnet_id);
        if state.by_client.contains_key(&key) {
            return Err(Error::DuplicateLease(lease.addr));
        }

        state.by_client.insert(key, lease.addr);
        state.by_addr.insert(lease.addr, lease);
        Ok(())
    }

    fn get_by_address(&self, addr: Ipv6Addr) -> Option<Lease6> {
        self.state
            .read()
            .expect("lease store lock poisoned")
            .by_addr
            .get(&addr)
            .cloned()
    }

    fn get_by_client(&self, duid: &Duid, iaid: u32, subnet_id: u32) -> Option<Lease6> {
        let state = self.state.read().expect("lease store lock poisoned");
        state
            .by_client
            .get(&client_key(duid, iaid, subnet_id))
            .and_then(|addr| state.by_addr.get(addr))
            .cloned()
    }

    fn update(&self, lease: Lease6) -> Result<()> {
        let mut state = self.state.write().expect("lease store lock poisoned");

        let Some(existing) = state.by_addr.get(&lease.addr) else {
            return Err(Error::LeaseNotFound(lease.addr));
        };

        let old_key = client_key(&existing.duid, existing.iaid, existing.subnet_id);
        let new_key = client_key(&lease.duid, lease.iaid, lease.subnet_id);
        if old_key != new_key {
            state.by_client.remove(&old_key);
            state.by_client.insert(new_key, lease.addr);
        }

        state.by_addr.insert(lease.addr, lease);
        Ok(())
    }

    fn delete(&self, addr: Ipv6Addr) -> bool {
        let mut state = self.state.write().expect("lease store lock poisoned");
        match state.by_addr.remove(&addr) {
            Some(lease) => {
                state
                    .by_client
                    .remove(&client_key(&lease.duid, lease.iaid, lease.subnet_id));
                true
            }
            None => false,
        }
    }
}
