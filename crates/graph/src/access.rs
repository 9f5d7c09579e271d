// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Access hooks: ordered chains consulted for every outgoing event and every
//! incoming request.
//!
//! Hooks run in registration order; each may overwrite the decision, so the
//! last hook's word stands. `Skip` suppresses an event silently; `Deny`
//! surfaces as a `NO_PERMISSION` error on the client's core resource.

use crate::events::EventKind;
use patchbay_core::{ObjectId, TypeId};

/// Outcome of a hook chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Drop the event without telling anyone.
    Skip,
    /// Refuse and report `NO_PERMISSION`.
    Deny,
}

/// Classification of incoming requests, for permission matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    ClientUpdate,
    Sync,
    GetRegistry,
    Bind,
    CreateNode,
    CreateClientNode,
    NodeRemove,
    ClientNodeUpdate,
    Destroy,
}

/// What the hooks may inspect about a global involved in a decision.
#[derive(Debug, Clone, Copy)]
pub struct GlobalInfo {
    pub id: ObjectId,
    pub type_id: TypeId,
    pub owner_uid: Option<u32>,
}

/// Context for a `check_send` decision.
#[derive(Debug, Clone, Copy)]
pub struct SendCheck<'a> {
    pub client: ObjectId,
    pub client_uid: Option<u32>,
    pub resource_type: TypeId,
    pub registry_type: TypeId,
    pub event: EventKind,
    /// The global the event advertises, when it advertises one.
    pub subject: Option<&'a GlobalInfo>,
}

/// Context for a `check_dispatch` decision.
#[derive(Debug, Clone, Copy)]
pub struct DispatchCheck<'a> {
    pub client: ObjectId,
    pub client_uid: Option<u32>,
    pub resource_type: TypeId,
    pub registry_type: TypeId,
    pub request: RequestKind,
    /// The global the request targets, when it targets one.
    pub target: Option<&'a GlobalInfo>,
}

/// One policy in a chain.
pub trait AccessPolicy: Send {
    fn check_send(&mut self, check: &SendCheck<'_>) -> Decision {
        let _ = check;
        Decision::Allow
    }

    fn check_dispatch(&mut self, check: &DispatchCheck<'_>) -> Decision {
        let _ = check;
        Decision::Allow
    }
}

/// The two ordered hook chains.
#[derive(Default)]
pub struct AccessChains {
    hooks: Vec<Box<dyn AccessPolicy>>,
}

impl AccessChains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, policy: Box<dyn AccessPolicy>) {
        self.hooks.push(policy);
    }

    pub fn check_send(&mut self, check: &SendCheck<'_>) -> Decision {
        let mut decision = Decision::Allow;
        for hook in &mut self.hooks {
            decision = hook.check_send(check);
        }
        decision
    }

    pub fn check_dispatch(&mut self, check: &DispatchCheck<'_>) -> Decision {
        let mut decision = Decision::Allow;
        for hook in &mut self.hooks {
            decision = hook.check_dispatch(check);
        }
        decision
    }
}

/// The canonical registry policy: a client may see and bind a global iff the
/// global has no owner or the owner shares the client's uid. Everything else
/// on the registry is refused; other resource types pass.
#[derive(Debug, Default)]
pub struct OwnerUidPolicy;

fn owner_test(client_uid: Option<u32>, subject: Option<&GlobalInfo>) -> bool {
    match subject {
        None => false,
        Some(global) => match global.owner_uid {
            None => true,
            Some(owner_uid) => client_uid == Some(owner_uid),
        },
    }
}

impl AccessPolicy for OwnerUidPolicy {
    fn check_send(&mut self, check: &SendCheck<'_>) -> Decision {
        if check.resource_type != check.registry_type {
            return Decision::Allow;
        }
        match check.event {
            EventKind::NotifyGlobal | EventKind::NotifyGlobalRemove => {
                if owner_test(check.client_uid, check.subject) {
                    Decision::Allow
                } else {
                    Decision::Skip
                }
            },
            _ => Decision::Deny,
        }
    }

    fn check_dispatch(&mut self, check: &DispatchCheck<'_>) -> Decision {
        if check.resource_type != check.registry_type {
            return Decision::Allow;
        }
        if check.request == RequestKind::Bind {
            if owner_test(check.client_uid, check.target) {
                Decision::Allow
            } else {
                Decision::Deny
            }
        } else {
            Decision::Deny
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: TypeId = TypeId(1);
    const NODE: TypeId = TypeId(2);

    fn global(owner_uid: Option<u32>) -> GlobalInfo {
        GlobalInfo { id: ObjectId(7), type_id: NODE, owner_uid }
    }

    fn chain() -> AccessChains {
        let mut chains = AccessChains::new();
        chains.add(Box::new(OwnerUidPolicy));
        chains
    }

    fn send_check<'a>(subject: Option<&'a GlobalInfo>, event: EventKind) -> SendCheck<'a> {
        SendCheck {
            client: ObjectId(3),
            client_uid: Some(1000),
            resource_type: REGISTRY,
            registry_type: REGISTRY,
            event,
            subject,
        }
    }

    fn bind_check<'a>(target: Option<&'a GlobalInfo>) -> DispatchCheck<'a> {
        DispatchCheck {
            client: ObjectId(3),
            client_uid: Some(1000),
            resource_type: REGISTRY,
            registry_type: REGISTRY,
            request: RequestKind::Bind,
            target,
        }
    }

    #[test]
    fn bind_allowed_for_unowned_or_same_uid() {
        let mut chains = chain();
        let unowned = global(None);
        let same = global(Some(1000));
        let other = global(Some(1001));
        assert_eq!(chains.check_dispatch(&bind_check(Some(&unowned))), Decision::Allow);
        assert_eq!(chains.check_dispatch(&bind_check(Some(&same))), Decision::Allow);
        assert_eq!(chains.check_dispatch(&bind_check(Some(&other))), Decision::Deny);
    }

    #[test]
    fn non_bind_registry_requests_are_denied() {
        let mut chains = chain();
        let target = global(None);
        let mut check = bind_check(Some(&target));
        check.request = RequestKind::Sync;
        assert_eq!(chains.check_dispatch(&check), Decision::Deny);
    }

    #[test]
    fn notify_global_skips_foreign_owners() {
        let mut chains = chain();
        let other = global(Some(1001));
        let same = global(Some(1000));
        assert_eq!(
            chains.check_send(&send_check(Some(&other), EventKind::NotifyGlobal)),
            Decision::Skip
        );
        assert_eq!(
            chains.check_send(&send_check(Some(&same), EventKind::NotifyGlobalRemove)),
            Decision::Allow
        );
    }

    #[test]
    fn other_registry_events_are_denied() {
        let mut chains = chain();
        assert_eq!(chains.check_send(&send_check(None, EventKind::Info)), Decision::Deny);
    }

    #[test]
    fn non_registry_resources_pass() {
        let mut chains = chain();
        let mut check = send_check(None, EventKind::Info);
        check.resource_type = NODE;
        assert_eq!(chains.check_send(&check), Decision::Allow);

        let mut dispatch = bind_check(None);
        dispatch.resource_type = NODE;
        dispatch.request = RequestKind::NodeRemove;
        assert_eq!(chains.check_dispatch(&dispatch), Decision::Allow);
    }

    #[test]
    fn later_hooks_override_earlier_ones() {
        struct DenyAll;
        impl AccessPolicy for DenyAll {
            fn check_send(&mut self, _: &SendCheck<'_>) -> Decision {
                Decision::Deny
            }
        }
        let mut chains = AccessChains::new();
        chains.add(Box::new(OwnerUidPolicy));
        chains.add(Box::new(DenyAll));
        let unowned = global(None);
        assert_eq!(
            chains.check_send(&send_check(Some(&unowned), EventKind::NotifyGlobal)),
            Decision::Deny
        );
    }
}
