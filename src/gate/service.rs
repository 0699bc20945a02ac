// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The cluster-wide service registry (§3 "Service record", §4.12, §4.16).
//!
//! A `DashMap` keyed by the small integer identity, touched from whichever
//! task currently owns the mutation (here the gate-master's per-peer read
//! loops) rather than a single scheduler thread, since this crate spreads
//! work across `tokio` workers instead of pinning everything to one.

use dashmap::DashMap;

/// One service's record as held by the gate master (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub id: u16,
    pub service_type: u16,
    pub gate_id: u16,
    pub online: bool,
}

/// Why a [`Registry::register_or_update`] call was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The service ID is already owned by a *different* gate (§4.12
    /// "service ID ownership rule: first-come-first-served").
    #[error("service {service} already owned by gate {owner}, rejecting claim by gate {claimant}")]
    OwnedByAnotherGate { service: u16, owner: u16, claimant: u16 },
}

/// The cluster-wide service registry (§3 invariant 5: a service ID maps
/// to at most one record at any time).
#[derive(Default)]
pub struct Registry {
    services: DashMap<u16, ServiceRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates ownership, then inserts or updates the record, per §4.12
    /// `gate_register_req`/`service_update_req` handling. Flips `online`
    /// for an already-known service of the claiming gate; never removes
    /// a record here (Open Question 1: removal only happens on explicit
    /// gate disconnect, see [`Self::mark_gate_offline_and_evict`]).
    pub fn register_or_update(
        &self,
        gate_id: u16,
        id: u16,
        service_type: u16,
        online: bool,
    ) -> Result<(), RegistryError> {
        if let Some(existing) = self.services.get(&id) {
            if existing.gate_id != gate_id {
                return Err(RegistryError::OwnedByAnotherGate {
                    service: id,
                    owner: existing.gate_id,
                    claimant: gate_id,
                });
            }
        }
        self.services.insert(
            id,
            ServiceRecord { id, service_type, gate_id, online },
        );
        Ok(())
    }

    pub fn get(&self, id: u16) -> Option<ServiceRecord> {
        self.services.get(&id).map(|e| e.clone())
    }

    /// All services currently owned by `gate_id`.
    pub fn services_of_gate(&self, gate_id: u16) -> Vec<ServiceRecord> {
        self.services
            .iter()
            .filter(|e| e.gate_id == gate_id)
            .map(|e| e.clone())
            .collect()
    }

    /// All services of a given type, online or not.
    pub fn services_of_type(&self, service_type: u16) -> Vec<ServiceRecord> {
        self.services
            .iter()
            .filter(|e| e.service_type == service_type)
            .map(|e| e.clone())
            .collect()
    }

    /// Online services of a given type — the pool [`rand_subscribe`]
    /// picks from (see `gate::connector`).
    pub fn online_services_of_type(&self, service_type: u16) -> Vec<ServiceRecord> {
        self.services
            .iter()
            .filter(|e| e.service_type == service_type && e.online)
            .map(|e| e.clone())
            .collect()
    }

    /// On gate disconnect: every service owned by that gate is removed
    /// outright (Open Question 1), not merely flipped offline. Returns the
    /// removed records so the caller can broadcast the change.
    pub fn mark_gate_offline_and_evict(&self, gate_id: u16) -> Vec<ServiceRecord> {
        let ids: Vec<u16> = self
            .services
            .iter()
            .filter(|e| e.gate_id == gate_id)
            .map(|e| e.id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, record)) = self.services.remove(&id) {
                removed.push(record);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_fetch() {
        let reg = Registry::new();
        reg.register_or_update(1, 10, 7, true).expect("register");
        let rec = reg.get(10).expect("present");
        assert_eq!(rec.gate_id, 1);
        assert!(rec.online);
    }

    #[test]
    fn claiming_a_service_owned_by_another_gate_is_rejected() {
        let reg = Registry::new();
        reg.register_or_update(1, 10, 7, true).expect("first claim");
        let err = reg.register_or_update(2, 10, 7, true).expect_err("rejected");
        assert!(matches!(err, RegistryError::OwnedByAnotherGate { .. }));
    }

    #[test]
    fn offline_transition_keeps_the_record() {
        let reg = Registry::new();
        reg.register_or_update(1, 10, 7, true).expect("register");
        reg.register_or_update(1, 10, 7, false).expect("flip offline");
        assert_eq!(reg.len(), 1);
        assert!(!reg.get(10).expect("present").online);
    }

    #[test]
    fn gate_disconnect_evicts_all_its_services() {
        let reg = Registry::new();
        reg.register_or_update(1, 10, 7, true).expect("a");
        reg.register_or_update(1, 11, 7, true).expect("b");
        reg.register_or_update(2, 20, 7, true).expect("c");

        let removed = reg.mark_gate_offline_and_evict(1);
        assert_eq!(removed.len(), 2);
        assert!(reg.get(10).is_none());
        assert!(reg.get(11).is_none());
        assert!(reg.get(20).is_some());
    }

    #[test]
    fn online_services_of_type_excludes_offline() {
        let reg = Registry::new();
        reg.register_or_update(1, 10, 7, true).expect("a");
        reg.register_or_update(1, 11, 7, false).expect("b");
        let online = reg.online_services_of_type(7);
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, 10);
    }
}
