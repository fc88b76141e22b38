//! Service bindings backing virtual-IP load balancing.
//!
//! For each service id the registry keeps one load balancer per network:
//! the virtual IP plus the endpoints currently backing it.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use log::debug;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::types::PortConfig;

/// One endpoint's membership in a service on a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBinding {
    pub service_name: String,
    pub service_id: String,
    pub network_id: String,
    pub endpoint_id: String,
    pub virtual_ip: Option<IpAddr>,
    pub ingress_ports: Vec<PortConfig>,
    pub endpoint_ip: IpAddr,
}

#[derive(Debug)]
struct LoadBalancer {
    virtual_ip: Option<IpAddr>,
    /// Address the service name resolves to on this network.
    record_ip: IpAddr,
    backends: BTreeMap<String, IpAddr>,
}

#[derive(Debug)]
struct Service {
    name: String,
    ingress_ports: Vec<PortConfig>,
    load_balancers: HashMap<String, LoadBalancer>,
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the binding's endpoint as a backend.
    ///
    /// When this is the service's first backend on the binding's network,
    /// returns the address the service name should resolve to there.
    pub fn add(&self, binding: &ServiceBinding) -> Result<Option<IpAddr>> {
        let mut services = self.services.lock();
        let service = services
            .entry(binding.service_id.clone())
            .or_insert_with(|| Service {
                name: binding.service_name.clone(),
                ingress_ports: Vec::new(),
                load_balancers: HashMap::new(),
            });

        if service.name != binding.service_name {
            return Err(Error::ServiceConflict {
                service_id: binding.service_id.clone(),
                existing: service.name.clone(),
                requested: binding.service_name.clone(),
            });
        }
        if !binding.ingress_ports.is_empty() {
            service.ingress_ports = binding.ingress_ports.clone();
        }

        let mut created = None;
        let lb = service
            .load_balancers
            .entry(binding.network_id.clone())
            .or_insert_with(|| {
                let record_ip = binding.virtual_ip.unwrap_or(binding.endpoint_ip);
                created = Some(record_ip);
                LoadBalancer {
                    virtual_ip: binding.virtual_ip,
                    record_ip,
                    backends: BTreeMap::new(),
                }
            });
        lb.backends
            .insert(binding.endpoint_id.clone(), binding.endpoint_ip);

        debug!(
            "Bound endpoint {} ({}) to service {} on network {}",
            binding.endpoint_id, binding.endpoint_ip, binding.service_name, binding.network_id
        );
        Ok(created)
    }

    /// Remove the binding's endpoint from its service.
    ///
    /// When the last backend on the network goes away, returns the address
    /// the service name resolved to there. Unknown services and endpoints
    /// are ignored.
    pub fn remove(&self, binding: &ServiceBinding) -> Option<IpAddr> {
        let mut services = self.services.lock();
        let service = services.get_mut(&binding.service_id)?;
        let lb = service.load_balancers.get_mut(&binding.network_id)?;
        lb.backends.remove(&binding.endpoint_id)?;

        debug!(
            "Unbound endpoint {} from service {} on network {}",
            binding.endpoint_id, binding.service_name, binding.network_id
        );
        if !lb.backends.is_empty() {
            return None;
        }
        let record_ip = lb.record_ip;
        service.load_balancers.remove(&binding.network_id);
        if service.load_balancers.is_empty() {
            services.remove(&binding.service_id);
        }
        Some(record_ip)
    }

    /// Backend addresses of a service on a network.
    pub fn backends(&self, service_id: &str, network_id: &str) -> Vec<IpAddr> {
        self.services
            .lock()
            .get(service_id)
            .and_then(|s| s.load_balancers.get(network_id))
            .map(|lb| lb.backends.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn virtual_ip(&self, service_id: &str, network_id: &str) -> Option<IpAddr> {
        self.services
            .lock()
            .get(service_id)
            .and_then(|s| s.load_balancers.get(network_id))
            .and_then(|lb| lb.virtual_ip)
    }

    pub fn ingress_ports(&self, service_id: &str) -> Vec<PortConfig> {
        self.services
            .lock()
            .get(service_id)
            .map(|s| s.ingress_ports.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(endpoint_id: &str, ip: &str) -> ServiceBinding {
        ServiceBinding {
            service_name: "web".into(),
            service_id: "svc1".into(),
            network_id: "net1".into(),
            endpoint_id: endpoint_id.into(),
            virtual_ip: Some("10.255.0.2".parse().unwrap()),
            ingress_ports: Vec::new(),
            endpoint_ip: ip.parse().unwrap(),
        }
    }

    #[test]
    fn test_add_and_remove_backends() {
        let reg = ServiceRegistry::new();
        let ep1 = binding("ep1", "10.0.0.5");
        let ep2 = binding("ep2", "10.0.0.6");

        assert_eq!(reg.add(&ep1).unwrap(), ep1.virtual_ip);
        assert_eq!(reg.add(&ep1).unwrap(), None);
        assert_eq!(reg.add(&ep2).unwrap(), None);
        assert_eq!(reg.backends("svc1", "net1").len(), 2);
        assert_eq!(reg.virtual_ip("svc1", "net1"), ep1.virtual_ip);

        assert_eq!(reg.remove(&ep1), None);
        assert_eq!(reg.remove(&ep2), ep1.virtual_ip);
        assert!(reg.backends("svc1", "net1").is_empty());
        assert_eq!(reg.remove(&ep2), None);
    }

    #[test]
    fn test_name_record_without_virtual_ip() {
        let reg = ServiceRegistry::new();
        let mut ep1 = binding("ep1", "10.0.0.5");
        ep1.virtual_ip = None;
        let mut ep2 = binding("ep2", "10.0.0.6");
        ep2.virtual_ip = None;

        let record_ip = reg.add(&ep1).unwrap();
        assert_eq!(record_ip, Some(ep1.endpoint_ip));
        reg.add(&ep2).unwrap();
        reg.remove(&ep1);
        assert_eq!(reg.remove(&ep2), record_ip);
    }

    #[test]
    fn test_conflicting_service_name() {
        let reg = ServiceRegistry::new();
        reg.add(&binding("ep1", "10.0.0.5")).unwrap();

        let mut other = binding("ep2", "10.0.0.6");
        other.service_name = "api".into();
        assert!(matches!(reg.add(&other), Err(Error::ServiceConflict { .. })));
        assert_eq!(reg.backends("svc1", "net1").len(), 1);
    }
}
