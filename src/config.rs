use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::controller::{ClusterOptions, DEFAULT_GOSSIP_PORT};
use crate::network::{Network, Scope};

/// A network registered with the controller at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_network_type")]
    pub network_type: String,
    #[serde(default = "default_scope")]
    pub scope: Scope,
    #[serde(default)]
    pub ingress: bool,
}

fn default_network_type() -> String {
    "overlay".into()
}

fn default_scope() -> Scope {
    Scope::Global
}

impl NetworkConfig {
    pub fn to_network(&self) -> Network {
        Network::new(&self.id, &self.name, &self.network_type, self.scope).with_ingress(self.ingress)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub cluster_enabled: bool,
    /// Literal IP address or interface name for the gossip listener.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    pub gossip_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    pub join_peers: Vec<String>,
    pub cluster_secret: String,
    pub dns_bind: SocketAddr,
    pub networks: Vec<NetworkConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_enabled: false,
            bind: None,
            gossip_port: DEFAULT_GOSSIP_PORT,
            node_name: None,
            join_peers: Vec::new(),
            cluster_secret: "default_insecure_secret".into(),
            dns_bind: SocketAddr::from(([0, 0, 0, 0], 53)),
            networks: Vec::new(),
        }
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("netagent.toml"))
            .merge(Json::file("netagent.json"))
            .merge(Env::prefixed("NETAGENT_"))
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("NETAGENT_CLUSTER_SECRET_FILE") {
            config.cluster_secret = std::fs::read_to_string(secret_file)?.trim().to_string();
        }

        if config.cluster_enabled && config.bind.is_none() {
            anyhow::bail!("`bind` must be set when clustering is enabled");
        }

        Ok(config)
    }

    pub fn cluster_options(&self) -> ClusterOptions {
        ClusterOptions {
            enabled: self.cluster_enabled,
            gossip_port: self.gossip_port,
            node_name: self.node_name.clone(),
            cluster_secret: self.cluster_secret.clone(),
        }
    }
}
