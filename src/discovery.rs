// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! A read-only view of the registry for discovery clients.
//!
//! Discovery clients think in apps and instances, not locators and routes. The bridge
//! groups registered routes by app, and resolves each instance's address through the
//! broker it is attached to.
use crate::{
    cluster::{BrokerInfo, Membership, NodeId},
    locator::gsv,
    registry::ServiceRegistry,
};
use log::debug;
use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    sync::Arc,
};

/// The app name brokers list themselves under.
pub const BROKER_APP: &str = "switchyard-broker";

/// One reachable instance of an app.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Unique id of the instance.
    pub instance_id: String,
    /// The app name.
    pub service_id: String,
    /// Where to reach it.
    pub host: IpAddr,
    /// The port to reach it on.
    pub port: u16,
    /// Whether the port expects tls.
    pub secure: bool,
    /// Advertised tags, plus a few well-known keys (`node_id`, `services`).
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    fn broker(b: &BrokerInfo) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("node_id".to_owned(), b.node_id().to_string());
        if b.aux_port() != 0 {
            metadata.insert("web_port".to_owned(), b.aux_port().to_string());
        }

        Self {
            instance_id: b.node_id().to_string(),
            service_id: BROKER_APP.to_owned(),
            host: b.ip(),
            port: b.rpc_port(),
            secure: b.is_secure(),
            metadata,
        }
    }
}

/// Answers discovery queries from the registry and cluster membership.
pub struct DiscoveryBridge {
    registry: Arc<ServiceRegistry>,
    membership: Arc<dyn Membership>,
}

impl DiscoveryBridge {
    /// Create a bridge.
    pub fn new(registry: Arc<ServiceRegistry>, membership: Arc<dyn Membership>) -> Self {
        Self {
            registry,
            membership,
        }
    }

    /// Returns the instances of `app_name`, sorted by instance id.
    ///
    /// Instances are reached through the broker they are attached to; instances attached
    /// to a broker that isn't a cluster member are omitted. [BROKER_APP] lists the
    /// brokers themselves.
    pub fn get_instances(&self, app_name: &str) -> Vec<ServiceInstance> {
        let brokers = self.membership.all();
        if app_name == BROKER_APP {
            return brokers.iter().map(ServiceInstance::broker).collect();
        }

        let by_node: HashMap<&NodeId, &BrokerInfo> =
            brokers.iter().map(|b| (b.node_id(), b)).collect();

        let mut instances: BTreeMap<String, ServiceInstance> = BTreeMap::new();
        for (locator, route) in self.registry.routes_for_app(app_name) {
            let broker = match by_node.get(route.node_id()) {
                Some(b) => b,
                None => {
                    debug!("{} is attached to unknown broker {}", route.id(), route.node_id());
                    continue;
                }
            };

            let inst = (instances.entry(route.id().to_string())).or_insert_with(|| {
                let mut metadata = route.tags().clone();
                metadata.insert("node_id".to_owned(), route.node_id().to_string());

                ServiceInstance {
                    instance_id: route.id().to_string(),
                    service_id: route.name().to_owned(),
                    host: broker.ip(),
                    port: broker.rpc_port(),
                    secure: broker.is_secure(),
                    metadata,
                }
            });

            let l = gsv(locator.group(), locator.service(), locator.version());
            let services = inst.metadata.entry("services".to_owned()).or_default();
            if !services.is_empty() {
                services.push(',');
            }
            services.push_str(&l);
        }

        instances.into_iter().map(|(_, i)| i).collect()
    }

    /// Returns the names of every app with a registered route, plus [BROKER_APP].
    pub fn get_all_services(&self) -> Vec<String> {
        let mut names = self.registry.app_names();
        names.push(BROKER_APP.to_owned());
        names.sort();
        names.dedup();
        names
    }
}
