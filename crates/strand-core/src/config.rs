//! Node configuration loaded from environment variables.
//!
//! Every setting has a default so a node starts with zero configuration for
//! local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use strand_net::parse_peer_book;
use strand_shared::constants::{
    CAFE_FLUSH_INTERVAL, CAFE_SESSION_TTL, DEFAULT_DHT_PORT, DEFAULT_SERVICE_PORT, REPUBLISH_INTERVAL,
    RETRIEVE_INTERVAL,
};
use strand_shared::PeerId;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the identity, the database and the block store.
    /// Env: `STRAND_REPO_PATH`
    /// Default: `./strand-repo`
    pub repo_path: PathBuf,

    /// TCP address the peer service listens on.
    /// Env: `STRAND_LISTEN_ADDR`
    /// Default: `0.0.0.0:4101`
    pub listen_addr: SocketAddr,

    /// Address other peers should dial us on, advertised through the DHT
    /// and in pointers.
    /// Env: `STRAND_PUBLIC_ADDR`
    /// Default: none (the listen address, when it is not a wildcard).
    pub public_addr: Option<String>,

    /// UDP port for the QUIC Kademlia swarm.
    /// Env: `STRAND_DHT_PORT`
    /// Default: `4001`
    pub dht_port: u16,

    /// File with one bootstrap multiaddr per line.
    /// Env: `STRAND_BOOTSTRAP_PEERS`
    pub bootstrap_peers_path: Option<PathBuf>,

    /// Static address book, `peer_hex@host:port` separated by commas.
    /// Env: `STRAND_PEERS`
    pub peers: Vec<(PeerId, String)>,

    /// Cafes to register with at startup (hex peer ids, comma separated).
    /// Env: `STRAND_CAFES`
    pub cafes: Vec<PeerId>,

    /// Serve the cafe protocol for other peers.
    /// Env: `STRAND_CAFE_HOST` (true/false)
    /// Default: `false`
    pub cafe_host: bool,

    /// Lifetime of sessions issued when hosting a cafe.
    pub cafe_session_ttl: Duration,

    /// Display name attached (encrypted) to the blocks we author.
    /// Env: `STRAND_USERNAME`
    pub username: Option<String>,

    /// Env: `STRAND_CAFE_FLUSH_SECS`
    /// Default: 600
    pub cafe_flush_interval: Duration,

    /// Env: `STRAND_RETRIEVE_SECS`
    /// Default: 300
    pub retrieve_interval: Duration,

    /// Env: `STRAND_REPUBLISH_SECS`
    /// Default: 43200
    pub republish_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("./strand-repo"),
            listen_addr: ([0, 0, 0, 0], DEFAULT_SERVICE_PORT).into(),
            public_addr: None,
            dht_port: DEFAULT_DHT_PORT,
            bootstrap_peers_path: None,
            peers: Vec::new(),
            cafes: Vec::new(),
            cafe_host: false,
            cafe_session_ttl: CAFE_SESSION_TTL,
            username: None,
            cafe_flush_interval: CAFE_FLUSH_INTERVAL,
            retrieve_interval: RETRIEVE_INTERVAL,
            republish_interval: REPUBLISH_INTERVAL,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = var("STRAND_REPO_PATH") {
            config.repo_path = PathBuf::from(path);
        }

        if let Some(addr) = var("STRAND_LISTEN_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid STRAND_LISTEN_ADDR, using default"),
            }
        }

        if let Some(addr) = var("STRAND_PUBLIC_ADDR") {
            if !addr.trim().is_empty() {
                config.public_addr = Some(addr.trim().to_string());
            }
        }

        if let Some(val) = var("STRAND_DHT_PORT") {
            match val.parse::<u16>() {
                Ok(port) => config.dht_port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid STRAND_DHT_PORT, using default"),
            }
        }

        if let Some(path) = var("STRAND_BOOTSTRAP_PEERS") {
            config.bootstrap_peers_path = Some(PathBuf::from(path));
        }

        if let Some(raw) = var("STRAND_PEERS") {
            config.peers = parse_peer_book(&raw);
        }

        if let Some(raw) = var("STRAND_CAFES") {
            for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                match PeerId::from_hex(entry) {
                    Ok(peer) => config.cafes.push(peer),
                    Err(e) => tracing::warn!(value = %entry, error = %e, "Ignoring invalid cafe id"),
                }
            }
        }

        if let Some(val) = var("STRAND_CAFE_HOST") {
            config.cafe_host = val == "true" || val == "1";
        }

        if let Some(name) = var("STRAND_USERNAME") {
            if !name.is_empty() {
                config.username = Some(name);
            }
        }

        read_secs(&var, "STRAND_CAFE_FLUSH_SECS", &mut config.cafe_flush_interval);
        read_secs(&var, "STRAND_RETRIEVE_SECS", &mut config.retrieve_interval);
        read_secs(&var, "STRAND_REPUBLISH_SECS", &mut config.republish_interval);

        config
    }

    /// The address to advertise, if we have a dialable one.
    pub fn advertised_addr(&self) -> Option<String> {
        if let Some(addr) = &self.public_addr {
            return Some(addr.clone());
        }
        if self.listen_addr.ip().is_unspecified() {
            return None;
        }
        Some(self.listen_addr.to_string())
    }
}

fn read_secs(var: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) {
    let Some(val) = var(key) else { return };
    match val.parse::<u64>() {
        Ok(secs) if secs > 0 => *target = Duration::from_secs(secs),
        _ => tracing::warn!(key, value = %val, "Invalid interval, using default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_addr, ([0, 0, 0, 0], 4101).into());
        assert_eq!(config.dht_port, 4001);
        assert!(!config.cafe_host);
        assert_eq!(config.advertised_addr(), None);
    }

    #[test]
    fn test_from_vars() {
        let cafe = PeerId([3; 32]);
        let peer = PeerId([4; 32]);
        let book = format!("{}@10.0.0.2:4101", peer.to_hex());
        let config = NodeConfig::from_vars(vars(&[
            ("STRAND_LISTEN_ADDR", "127.0.0.1:5000"),
            ("STRAND_CAFES", &format!("{}, nothex", cafe.to_hex())),
            ("STRAND_PEERS", &book),
            ("STRAND_CAFE_HOST", "true"),
            ("STRAND_RETRIEVE_SECS", "30"),
            ("STRAND_REPUBLISH_SECS", "zero"),
        ]));

        assert_eq!(config.listen_addr, ([127, 0, 0, 1], 5000).into());
        assert_eq!(config.cafes, vec![cafe]);
        assert_eq!(config.peers, vec![(peer, "10.0.0.2:4101".to_string())]);
        assert!(config.cafe_host);
        assert_eq!(config.retrieve_interval, Duration::from_secs(30));
        assert_eq!(config.republish_interval, REPUBLISH_INTERVAL);
        assert_eq!(config.advertised_addr().as_deref(), Some("127.0.0.1:5000"));
    }

    #[test]
    fn test_invalid_port_keeps_default() {
        let config = NodeConfig::from_vars(vars(&[("STRAND_DHT_PORT", "99999")]));
        assert_eq!(config.dht_port, DEFAULT_DHT_PORT);
    }
}
