//! Capability Registry (C1).
//!
//! Tracks what a session is allowed to do: which tools, skills, and
//! provider bindings exist and whether each is currently healthy. The
//! registry is two-layered — a process-wide static layer (capabilities
//! available to every session) overlaid by a per-agent layer (extra
//! capabilities granted to one session, e.g. a user-specific skill) —
//! and caches status so `resolve` doesn't re-probe on every call.

use crate::types::{Capability, CapabilityStatus};
use dashmap::DashMap;
use std::sync::Arc;

/// Shared, concurrent capability registry. Cloning an `Arc<CapabilityRegistry>`
/// and handing it to every session is the expected usage, mirroring the
/// router's and session registry's sharing pattern (§9).
pub struct CapabilityRegistry {
    static_layer: DashMap<String, Capability>,
    per_agent: DashMap<String, DashMap<String, Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            static_layer: DashMap::new(),
            per_agent: DashMap::new(),
        }
    }

    /// Register a capability in the static, process-wide layer.
    pub fn register(&self, capability: Capability) {
        self.static_layer.insert(capability.name.clone(), capability);
    }

    /// Register a capability scoped to one agent/session, overlaying (and
    /// shadowing, if same name) the static layer for lookups scoped to
    /// that agent.
    pub fn register_for_agent(&self, agent_id: &str, capability: Capability) {
        self.per_agent
            .entry(agent_id.to_string())
            .or_default()
            .insert(capability.name.clone(), capability);
    }

    /// All capabilities visible to `agent_id`: the static layer overlaid
    /// by that agent's own capabilities (same-named per-agent entries win).
    pub fn all_for(&self, agent_id: &str) -> Vec<Capability> {
        let mut merged: std::collections::HashMap<String, Capability> = self
            .static_layer
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        if let Some(overlay) = self.per_agent.get(agent_id) {
            for entry in overlay.iter() {
                merged.insert(entry.key().clone(), entry.value().clone());
            }
        }

        merged.into_values().collect()
    }

    /// Resolve one named capability for an agent, checking the per-agent
    /// overlay first. Returns `None` if neither layer has it.
    pub fn resolve(&self, agent_id: &str, name: &str) -> Option<Capability> {
        if let Some(overlay) = self.per_agent.get(agent_id) {
            if let Some(capability) = overlay.get(name) {
                return Some(capability.clone());
            }
        }
        self.static_layer.get(name).map(|c| c.clone())
    }

    /// Update a capability's cached status (e.g. after a health probe
    /// performed by the router or a skill discovery pass). No-op if the
    /// name isn't registered in either layer for this agent.
    pub fn refresh_status(&self, agent_id: &str, name: &str, status: CapabilityStatus) {
        if let Some(overlay) = self.per_agent.get(agent_id) {
            if let Some(mut capability) = overlay.get_mut(name) {
                capability.status = status;
                capability.last_checked = chrono::Utc::now();
                return;
            }
        }
        if let Some(mut capability) = self.static_layer.get_mut(name) {
            capability.status = status;
            capability.last_checked = chrono::Utc::now();
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience alias for the shared handle every session/executor holds.
pub type SharedCapabilityRegistry = Arc<CapabilityRegistry>;
