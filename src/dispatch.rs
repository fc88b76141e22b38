//! Turns table store notifications into local side effects.
//!
//! One dispatch loop runs per watch and feeds events to its handler one
//! at a time. The loop ends when the watch is cancelled and its channel
//! closes. Handler failures are logged and the event is dropped; the loop
//! keeps going.

use std::net::IpAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, error};
use prost::Message;
use tokio::sync::mpsc;

use crate::controller::Controller;
use crate::driver::EventKind;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::service::ServiceBinding;
use crate::types::{EndpointRecord, TableEntry, TableEvent};

#[async_trait]
pub(crate) trait TableEventHandler: Send + Sync + 'static {
    async fn handle(&self, event: TableEvent);
}

pub(crate) async fn handle_table_events<H>(mut rx: mpsc::UnboundedReceiver<TableEvent>, handler: H)
where
    H: TableEventHandler,
{
    while let Some(event) = rx.recv().await {
        handler.handle(event).await;
    }
    debug!("Watch channel closed, dispatch loop exiting");
}

/// Forwards driver table changes to the network's driver.
pub(crate) struct DriverTableHandler {
    network: Arc<Network>,
}

impl DriverTableHandler {
    pub(crate) fn new(network: Arc<Network>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl TableEventHandler for DriverTableHandler {
    async fn handle(&self, event: TableEvent) {
        let driver = match self.network.driver() {
            Ok(d) => d,
            Err(e) => {
                error!(
                    "Could not resolve driver {} while handling driver table event: {}",
                    self.network.network_type(),
                    e
                );
                return;
            }
        };

        let (kind, entry) = match &event {
            TableEvent::Create(e) => (EventKind::Create, e),
            TableEvent::Delete(e) => (EventKind::Delete, e),
            // Drivers have always been told about updates as deletes.
            TableEvent::Update(e) => (EventKind::Delete, e),
        };
        driver.event_notify(kind, self.network.id(), &entry.table, &entry.key, &entry.value);
    }
}

/// Applies remote endpoint records to service bindings and name records.
pub(crate) struct EndpointTableHandler {
    controller: Weak<Controller>,
}

impl EndpointTableHandler {
    pub(crate) fn new(controller: Weak<Controller>) -> Self {
        Self { controller }
    }
}

/// Decode an endpoint record and the endpoint address it carries.
fn parse_record(entry: &TableEntry) -> Result<(EndpointRecord, IpAddr)> {
    let record = EndpointRecord::decode(entry.value.as_slice())?;
    match record.endpoint_ip.parse::<IpAddr>() {
        Ok(ip) if !record.name.is_empty() => Ok((record, ip)),
        _ => Err(Error::InvalidEndpointRecord(entry.key.clone())),
    }
}

#[async_trait]
impl TableEventHandler for EndpointTableHandler {
    async fn handle(&self, event: TableEvent) {
        let Some(c) = self.controller.upgrade() else {
            return;
        };

        let (entry, is_add) = match event {
            TableEvent::Create(e) => (e, true),
            TableEvent::Delete(e) => (e, false),
            TableEvent::Update(e) => {
                error!(
                    "Unexpected update on endpoint table for endpoint {} on network {}",
                    e.key, e.network_id
                );
                return;
            }
        };

        let network = match c.network_by_id(&entry.network_id) {
            Ok(n) => n,
            Err(e) => {
                error!(
                    "Could not find network {} while handling endpoint table event: {}",
                    entry.network_id, e
                );
                return;
            }
        };

        let (record, ip) = match parse_record(&entry) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(
                    "Dropping endpoint table event for {} on network {}: {}",
                    entry.key, entry.network_id, e
                );
                return;
            }
        };

        let binding = (!record.service_id.is_empty()).then(|| ServiceBinding {
            service_name: record.service_name.clone(),
            service_id: record.service_id.clone(),
            network_id: entry.network_id.clone(),
            endpoint_id: entry.key.clone(),
            virtual_ip: record.virtual_ip.parse().ok(),
            ingress_ports: record.ingress_ports.clone(),
            endpoint_ip: ip,
        });

        if is_add {
            if let Some(binding) = &binding {
                if let Err(e) = c.add_service_binding(binding).await {
                    error!("Failed adding service binding for {}: {}", entry.key, e);
                    return;
                }
            }
            network.add_svc_records(&record.name, ip).await;
        } else {
            if let Some(binding) = &binding {
                if let Err(e) = c.rm_service_binding(binding).await {
                    error!("Failed removing service binding for {}: {}", entry.key, e);
                    return;
                }
            }
            network.delete_svc_records(&record.name, ip).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ClusterOptions;
    use crate::driver::{DiscoveryEvent, Driver};
    use crate::network::Scope;
    use parking_lot::Mutex;

    type Notification = (EventKind, String, String, String, Vec<u8>);

    #[derive(Default)]
    struct RecordingDriver {
        events: Mutex<Vec<Notification>>,
    }

    impl Driver for RecordingDriver {
        fn network_type(&self) -> &str {
            "overlay"
        }

        fn discover_new(&self, _event: &DiscoveryEvent) -> Result<()> {
            Ok(())
        }

        fn event_notify(&self, kind: EventKind, network_id: &str, table: &str, key: &str, value: &[u8]) {
            self.events.lock().push((
                kind,
                network_id.to_string(),
                table.to_string(),
                key.to_string(),
                value.to_vec(),
            ));
        }
    }

    fn entry(network_id: &str, key: &str, value: Vec<u8>) -> TableEntry {
        TableEntry {
            table: "overlay_peer_table".into(),
            network_id: network_id.into(),
            key: key.into(),
            value,
        }
    }

    fn record(name: &str, service_id: &str, ip: &str) -> Vec<u8> {
        EndpointRecord {
            name: name.into(),
            service_name: if service_id.is_empty() { String::new() } else { "websvc".into() },
            service_id: service_id.into(),
            virtual_ip: String::new(),
            ingress_ports: Vec::new(),
            endpoint_ip: ip.into(),
        }
        .encode_to_vec()
    }

    #[tokio::test]
    async fn test_driver_handler_maps_event_kinds() {
        let network = Arc::new(Network::new("net1", "backend", "overlay", Scope::Global));
        let driver = Arc::new(RecordingDriver::default());
        network.set_driver(driver.clone());
        let handler = DriverTableHandler::new(Arc::clone(&network));

        handler.handle(TableEvent::Create(entry("net1", "k1", vec![1]))).await;
        handler.handle(TableEvent::Update(entry("net1", "k1", vec![2]))).await;
        handler.handle(TableEvent::Delete(entry("net1", "k1", vec![2]))).await;

        let events = driver.events.lock();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.0).collect();
        assert_eq!(kinds, vec![EventKind::Create, EventKind::Delete, EventKind::Delete]);
        assert_eq!(events[1].4, vec![2]);
        assert_eq!(events[0].2, "overlay_peer_table");
    }

    #[tokio::test]
    async fn test_driver_handler_drops_events_without_driver() {
        let network = Arc::new(Network::new("net1", "backend", "overlay", Scope::Global));
        let handler = DriverTableHandler::new(Arc::clone(&network));
        handler.handle(TableEvent::Create(entry("net1", "k1", vec![]))).await;

        let driver = Arc::new(RecordingDriver::default());
        network.set_driver(driver.clone());
        handler.handle(TableEvent::Create(entry("net1", "k2", vec![]))).await;
        assert_eq!(driver.events.lock().len(), 1);
    }

    #[test]
    fn test_parse_record_validation() {
        let ok = entry("net1", "ep1", record("web", "", "10.0.0.5"));
        let (rec, ip) = parse_record(&ok).unwrap();
        assert_eq!(rec.name, "web");
        assert_eq!(ip, "10.0.0.5".parse::<IpAddr>().unwrap());

        let no_name = entry("net1", "ep1", record("", "", "10.0.0.5"));
        assert!(matches!(parse_record(&no_name), Err(Error::InvalidEndpointRecord(_))));

        let bad_ip = entry("net1", "ep1", record("web", "", "not-an-ip"));
        assert!(matches!(parse_record(&bad_ip), Err(Error::InvalidEndpointRecord(_))));

        let garbage = entry("net1", "ep1", vec![0x0a, 0xff]);
        assert!(matches!(parse_record(&garbage), Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_endpoint_handler_updates_records_and_bindings() {
        let c = Controller::new(ClusterOptions::default());
        let network = c.add_network(Network::new("net1", "backend", "overlay", Scope::Global));
        let handler = EndpointTableHandler::new(Arc::downgrade(&c));
        let ip: IpAddr = "10.0.0.5".parse().unwrap();

        let add = entry("net1", "ep1", record("web", "svc1", "10.0.0.5"));
        handler.handle(TableEvent::Create(add.clone())).await;
        assert_eq!(network.lookup("web").await, vec![ip]);
        assert_eq!(c.services().backends("svc1", "net1"), vec![ip]);
        assert_eq!(network.lookup("websvc").await, vec![ip]);

        // Updates are never applied in place.
        let update = entry("net1", "ep1", record("web2", "svc1", "10.0.0.6"));
        handler.handle(TableEvent::Update(update)).await;
        assert!(network.lookup("web2").await.is_empty());

        handler.handle(TableEvent::Delete(add)).await;
        assert!(network.lookup("web").await.is_empty());
        assert!(network.lookup("websvc").await.is_empty());
        assert!(c.services().backends("svc1", "net1").is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_handler_drops_invalid_events() {
        let c = Controller::new(ClusterOptions::default());
        let network = c.add_network(Network::new("net1", "backend", "overlay", Scope::Global));
        let handler = EndpointTableHandler::new(Arc::downgrade(&c));

        handler
            .handle(TableEvent::Create(entry("net1", "ep1", record("", "svc1", "10.0.0.5"))))
            .await;
        handler
            .handle(TableEvent::Create(entry("unknown", "ep2", record("web", "", "10.0.0.5"))))
            .await;
        handler
            .handle(TableEvent::Create(entry("net1", "ep3", vec![0x0a, 0xff])))
            .await;

        assert!(network.lookup("web").await.is_empty());
        assert!(c.services().backends("svc1", "net1").is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_handler_binding_failure_skips_record() {
        let c = Controller::new(ClusterOptions::default());
        let network = c.add_network(Network::new("net1", "backend", "overlay", Scope::Global));
        c.add_service_binding(&ServiceBinding {
            service_name: "other".into(),
            service_id: "svc1".into(),
            network_id: "net1".into(),
            endpoint_id: "ep0".into(),
            virtual_ip: None,
            ingress_ports: Vec::new(),
            endpoint_ip: "10.0.0.9".parse().unwrap(),
        })
        .await
        .unwrap();

        let handler = EndpointTableHandler::new(Arc::downgrade(&c));
        handler
            .handle(TableEvent::Create(entry("net1", "ep1", record("web", "svc1", "10.0.0.5"))))
            .await;
        assert!(network.lookup("web").await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_loop_survives_bad_events() {
        let c = Controller::new(ClusterOptions::default());
        let network = c.add_network(Network::new("net1", "backend", "overlay", Scope::Global));
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(handle_table_events(
            rx,
            EndpointTableHandler::new(Arc::downgrade(&c)),
        ));

        tx.send(TableEvent::Create(entry("net1", "ep1", vec![0xff, 0xff, 0xff]))).unwrap();
        tx.send(TableEvent::Create(entry("net1", "ep2", record("db", "", "10.0.0.7")))).unwrap();
        drop(tx);

        task.await.unwrap();
        assert_eq!(network.lookup("db").await, vec!["10.0.0.7".parse::<IpAddr>().unwrap()]);
    }
}
