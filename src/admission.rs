//! Per-client admission control.
//!
//! A client address may have exactly one request in flight. The controller is
//! a gate, not a queue: a request that finds its address busy is turned away
//! immediately and the client is expected to retry later.
//!
//! Counters are created lazily and never removed, so an address that has been
//! seen once keeps an entry (possibly at zero) for the life of the server.
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::trace;

/// Requests allowed in flight per client address.
const MAX_IN_FLIGHT: usize = 1;

#[derive(Debug, Default)]
pub struct AdmissionController {
    in_flight: Mutex<HashMap<IpAddr, usize>>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a slot for `addr`. Leaves the counter untouched and returns
    /// `false` when the address is already at its limit.
    pub fn try_acquire(&self, addr: IpAddr) -> bool {
        let mut in_flight = self.lock();
        let count = in_flight.entry(addr).or_insert(0);

        if *count >= MAX_IN_FLIGHT {
            trace!("{addr} rejected with {count} in flight");
            return false;
        }
        *count += 1;
        true
    }

    /// Returns a slot claimed by [`AdmissionController::try_acquire`].
    pub fn release(&self, addr: IpAddr) {
        let mut in_flight = self.lock();
        let count = in_flight.entry(addr).or_insert(0);
        *count = count.saturating_sub(1);
    }

    pub fn in_flight(&self, addr: IpAddr) -> usize {
        self.lock().get(&addr).copied().unwrap_or(0)
    }

    /// Claims a slot that is released when the returned guard is dropped.
    pub fn admit(self: &Arc<Self>, addr: IpAddr) -> Option<AdmissionSlot> {
        self.try_acquire(addr).then(|| AdmissionSlot {
            controller: Arc::clone(self),
            addr,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, usize>> {
        // Counter updates cannot panic half way, so a poisoned map is still
        // consistent.
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An acquired admission slot.
#[derive(Debug)]
pub struct AdmissionSlot {
    controller: Arc<AdmissionController>,
    addr: IpAddr,
}

impl AdmissionSlot {
    pub fn addr(&self) -> IpAddr {
        self.addr
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.controller.release(self.addr);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, Ipv6Addr},
        thread,
    };

    use super::*;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
    const OTHER: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

    #[test]
    fn admission_one_per_address() {
        let admission = AdmissionController::new();

        assert!(admission.try_acquire(CLIENT));
        assert!(!admission.try_acquire(CLIENT));
        assert_eq!(admission.in_flight(CLIENT), 1);

        assert!(admission.try_acquire(OTHER));
    }

    #[test]
    fn admission_release_reopens() {
        let admission = AdmissionController::new();

        assert!(admission.try_acquire(CLIENT));
        admission.release(CLIENT);
        assert_eq!(admission.in_flight(CLIENT), 0);
        assert!(admission.try_acquire(CLIENT));
    }

    #[test]
    fn admission_release_floors_at_zero() {
        let admission = AdmissionController::new();

        admission.release(CLIENT);
        admission.release(CLIENT);
        assert_eq!(admission.in_flight(CLIENT), 0);
        assert!(admission.try_acquire(CLIENT));
    }

    #[test]
    fn admission_slot_releases_on_drop() {
        let admission = Arc::new(AdmissionController::new());

        let slot = admission.admit(CLIENT).unwrap();
        assert_eq!(slot.addr(), CLIENT);
        assert!(admission.admit(CLIENT).is_none());

        drop(slot);
        assert!(admission.admit(CLIENT).is_some());
    }

    #[test]
    fn admission_concurrent_claims() {
        let admission = Arc::new(AdmissionController::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let admission = Arc::clone(&admission);
                thread::spawn(move || admission.try_acquire(CLIENT))
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 1);
        assert_eq!(admission.in_flight(CLIENT), 1);
    }
}
