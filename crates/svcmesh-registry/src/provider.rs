//! Service-provider subscription
//!
//! Load-balancing client layers implement [`ServiceProvider`] and register
//! with the registry to keep their own view of the cluster. Hooks run inside
//! the membership engine's event path: they must return quickly and must not
//! call back into the registry.

use crate::meta::MergedMeta;
use parking_lot::RwLock;
use std::collections::HashMap;
use svcmesh_core::NodeId;
use svcmesh_gossip::{EventDelegate, Member};
use tracing::debug;

/// A consumer of membership changes, e.g. a client-side load balancer.
pub trait ServiceProvider: Send + Sync {
    /// A node is available for traffic.
    fn add_node(&self, node: &Member);

    /// A node left or died and must stop receiving traffic.
    fn remove_node(&self, node: &Member);

    /// A node's advertised weight changed.
    fn update_weight(&self, node: &Member);
}

/// Fans membership events out to every registered provider.
#[derive(Default)]
pub(crate) struct ProviderFanout {
    providers: RwLock<Vec<Box<dyn ServiceProvider>>>,
    known_services: RwLock<HashMap<NodeId, String>>,
}

impl ProviderFanout {
    /// Seed a provider with the current members, then subscribe it.
    ///
    /// The caller holds the membership read lock, so no event can interleave
    /// between seeding and subscription.
    pub(crate) fn register(&self, provider: Box<dyn ServiceProvider>, members: &[Member]) {
        let mut known = self.known_services.write();
        for member in members {
            known
                .entry(member.name.clone())
                .or_insert_with(|| service_of(member));
            provider.add_node(member);
        }
        drop(known);
        self.providers.write().push(provider);
    }
}

fn service_of(member: &Member) -> String {
    MergedMeta::from_member(member)
        .map(|merged| merged.meta.service)
        .unwrap_or_default()
}

impl EventDelegate for ProviderFanout {
    fn notify_join(&self, member: &Member) {
        self.known_services
            .write()
            .insert(member.name.clone(), service_of(member));
        for provider in self.providers.read().iter() {
            provider.add_node(member);
        }
    }

    fn notify_leave(&self, member: &Member) {
        self.known_services.write().remove(&member.name);
        for provider in self.providers.read().iter() {
            provider.remove_node(member);
        }
    }

    fn notify_update(&self, member: &Member) {
        let service = service_of(member);
        let service_changed = {
            let mut known = self.known_services.write();
            match known.insert(member.name.clone(), service.clone()) {
                Some(previous) => previous != service,
                None => true,
            }
        };
        if service_changed {
            debug!(name = %member.name, %service, "member now provides a different service");
            for provider in self.providers.read().iter() {
                provider.add_node(member);
            }
        } else {
            for provider in self.providers.read().iter() {
                provider.update_weight(member);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{MergedMeta, NodeMeta};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(String, String)>>,
    }

    struct RecordingProvider(Arc<Recording>);

    impl ServiceProvider for RecordingProvider {
        fn add_node(&self, node: &Member) {
            self.0
                .calls
                .lock()
                .push(("add".to_string(), node.name.to_string()));
        }

        fn remove_node(&self, node: &Member) {
            self.0
                .calls
                .lock()
                .push(("remove".to_string(), node.name.to_string()));
        }

        fn update_weight(&self, node: &Member) {
            self.0
                .calls
                .lock()
                .push(("weight".to_string(), node.name.to_string()));
        }
    }

    fn member_for(name: &str, service: &str, weight: i32) -> Member {
        let meta = NodeMeta {
            service: service.to_string(),
            route_root_path: String::new(),
            port: 6060,
            register_at: Utc::now(),
            rust_ver: String::new(),
            svcmesh_ver: String::new(),
            build_user: String::new(),
            build_time: String::new(),
            weight,
        };
        let bytes = MergedMeta::new(meta, None).encode_checked().unwrap();
        Member::new(
            svcmesh_core::NodeId::new(name),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            7946,
            bytes,
        )
    }

    #[test]
    fn test_register_seeds_then_subscribes() {
        let fanout = ProviderFanout::default();
        let recording = Arc::new(Recording::default());
        let members = vec![member_for("a", "orders", 10), member_for("b", "orders", 10)];
        fanout.register(Box::new(RecordingProvider(recording.clone())), &members);

        assert_eq!(
            *recording.calls.lock(),
            vec![
                ("add".to_string(), "a".to_string()),
                ("add".to_string(), "b".to_string()),
            ]
        );

        fanout.notify_leave(&member_for("a", "orders", 10));
        assert_eq!(
            recording.calls.lock().last().unwrap(),
            &("remove".to_string(), "a".to_string())
        );
    }

    #[test]
    fn test_update_maps_to_weight_or_add() {
        let fanout = ProviderFanout::default();
        let recording = Arc::new(Recording::default());
        fanout.register(
            Box::new(RecordingProvider(recording.clone())),
            &[member_for("a", "orders", 10)],
        );

        // Same service, new weight.
        fanout.notify_update(&member_for("a", "orders", 20));
        assert_eq!(
            recording.calls.lock().last().unwrap(),
            &("weight".to_string(), "a".to_string())
        );

        // The member now advertises a different service.
        fanout.notify_update(&member_for("a", "billing", 20));
        assert_eq!(
            recording.calls.lock().last().unwrap(),
            &("add".to_string(), "a".to_string())
        );
    }
}
