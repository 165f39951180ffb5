//! Runtime-checkable invariants of the AVZ tables
//!
//! Used by property tests and by debug assertions at quiescent points.
//!
//! # Invariants
//!
//! 1. **Channel symmetry**: an Interdomain channel's peer points back at it
//! 2. **Reserved channel**: channel 0 of every domain stays Reserved
//! 3. **Virq bindings**: the virq map and the Virq channel states agree
//! 4. **Grant accounting**: free count plus non-free entries equals capacity,
//!    and the free list holds exactly `free_count` entries
//! 5. **Grant mapping state**: an entry is Mapped iff it has live mappings

use crate::domain::DomainRegistry;
use crate::types::{ChannelId, ChannelState, RESERVED_CHANNEL};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all invariants over every registered domain.
///
/// Returns a list of violations (empty if all invariants hold). Tables are
/// sampled one at a time, so the result is only meaningful while no
/// operation is in flight.
pub fn check_all_invariants(registry: &DomainRegistry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_channel_symmetry(registry));
    violations.extend(check_reserved_channel(registry));
    violations.extend(check_virq_bindings(registry));
    violations.extend(check_grant_accounting(registry));

    violations
}

/// Invariant 1: every Interdomain channel's peer points back at it
fn check_channel_symmetry(registry: &DomainRegistry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for id in registry.domain_ids() {
        let Ok(domain) = registry.domain(id) else {
            continue;
        };
        for (i, state) in domain.evtchn().snapshot().iter().enumerate() {
            let ChannelState::Interdomain {
                remote_domain,
                remote_channel,
            } = *state
            else {
                continue;
            };
            let back = registry
                .domain(remote_domain)
                .ok()
                .and_then(|r| r.evtchn().state(remote_channel).ok());
            let expected = ChannelState::Interdomain {
                remote_domain: id,
                remote_channel: ChannelId(i as u32),
            };
            if back != Some(expected) {
                violations.push(InvariantViolation {
                    invariant: "channel_symmetry",
                    description: format!(
                        "domain {} channel {} -> ({}, {}) but peer is {:?}",
                        id, i, remote_domain, remote_channel, back
                    ),
                });
            }
        }
    }

    violations
}

/// Invariant 2: channel 0 is never allocated
fn check_reserved_channel(registry: &DomainRegistry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for id in registry.domain_ids() {
        let Ok(domain) = registry.domain(id) else {
            continue;
        };
        let state = domain.evtchn().state(RESERVED_CHANNEL).ok();
        if state != Some(ChannelState::Reserved) {
            violations.push(InvariantViolation {
                invariant: "reserved_channel",
                description: format!("domain {} channel 0 is {:?}", id, state),
            });
        }
    }

    violations
}

/// Invariant 3: virq map and channel states agree in both directions
fn check_virq_bindings(registry: &DomainRegistry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for id in registry.domain_ids() {
        let Ok(domain) = registry.domain(id) else {
            continue;
        };
        let states = domain.evtchn().snapshot();
        let bindings = domain.evtchn().virq_bindings();

        for (virq, channel) in bindings.iter().enumerate() {
            let Some(channel) = channel else { continue };
            match states.get(channel.0 as usize) {
                Some(ChannelState::Virq { virq: v }) if v.0 as usize == virq => {}
                other => violations.push(InvariantViolation {
                    invariant: "virq_bindings",
                    description: format!(
                        "domain {} virq {} -> channel {} which is {:?}",
                        id, virq, channel, other
                    ),
                }),
            }
        }
        for (i, state) in states.iter().enumerate() {
            if let ChannelState::Virq { virq } = state {
                if bindings.get(virq.0 as usize).copied().flatten() != Some(ChannelId(i as u32)) {
                    violations.push(InvariantViolation {
                        invariant: "virq_bindings",
                        description: format!(
                            "domain {} channel {} bound to virq {} missing from the virq map",
                            id, i, virq
                        ),
                    });
                }
            }
        }
    }

    violations
}

/// Invariants 4 and 5: grant free list accounting and mapping state
fn check_grant_accounting(registry: &DomainRegistry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for id in registry.domain_ids() {
        let Ok(domain) = registry.domain(id) else {
            continue;
        };
        let audit = domain.gnttab().audit();

        if audit.free_count + audit.non_free != audit.capacity {
            violations.push(InvariantViolation {
                invariant: "grant_accounting",
                description: format!(
                    "domain {}: free {} + in use {} != capacity {}",
                    id, audit.free_count, audit.non_free, audit.capacity
                ),
            });
        }
        if audit.free_list_len != Some(audit.free_count) {
            violations.push(InvariantViolation {
                invariant: "grant_accounting",
                description: format!(
                    "domain {}: free list walk {:?} != free count {}",
                    id, audit.free_list_len, audit.free_count
                ),
            });
        }
        if audit.poisoned {
            violations.push(InvariantViolation {
                invariant: "grant_accounting",
                description: format!("domain {}: grant table poisoned", id),
            });
        }
        for index in audit.inconsistent_entries {
            violations.push(InvariantViolation {
                invariant: "grant_mapping_state",
                description: format!(
                    "domain {}: entry {} state disagrees with its mapping counters",
                    id, index
                ),
            });
        }
    }

    violations
}
