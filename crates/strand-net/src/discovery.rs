//! Bootstrap multiaddrs for the DHT and the static service address book.

use std::fs;
use std::path::Path;

use libp2p::Multiaddr;
use tracing::{debug, info, warn};

use strand_shared::PeerId;

/// Load DHT bootstrap multiaddrs, one per line. Blank lines and `#` comments
/// are skipped; malformed lines are logged and skipped.
///
/// ```text
/// # strand bootstrap nodes
/// /ip4/198.51.100.10/udp/4001/quic-v1/p2p/12D3KooW...
/// ```
pub fn load_bootstrap_peers(path: &Path) -> Vec<Multiaddr> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read bootstrap peers file");
            return Vec::new();
        }
    };

    let addrs: Vec<Multiaddr> = config_lines(&content)
        .filter_map(|line| match line.parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(line = %line, error = %e, "Skipping invalid multiaddr");
                None
            }
        })
        .collect();

    info!(count = addrs.len(), path = %path.display(), "Loaded bootstrap peers");
    addrs
}

/// Parse `pubkey@host:port` service address entries, separated by commas or
/// newlines. The pubkey is the peer's hex-encoded public key.
pub fn parse_peer_book(raw: &str) -> Vec<(PeerId, String)> {
    raw.split(',')
        .flat_map(config_lines)
        .filter_map(|entry| {
            let Some((key, addr)) = entry.split_once('@') else {
                warn!(entry = %entry, "Peer entry is missing '@'");
                return None;
            };
            match key.trim().parse::<PeerId>() {
                Ok(peer) if !addr.trim().is_empty() => {
                    debug!(peer = %peer.short(), addr = %addr.trim(), "Static peer address");
                    Some((peer, addr.trim().to_string()))
                }
                Ok(_) => {
                    warn!(entry = %entry, "Peer entry has an empty address");
                    None
                }
                Err(e) => {
                    warn!(entry = %entry, error = %e, "Peer entry has an invalid key");
                    None
                }
            }
        })
        .collect()
}

fn config_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_bootstrap_peers_skips_junk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "/ip4/127.0.0.1/udp/4001/quic-v1").unwrap();
        writeln!(file, "not a multiaddr").unwrap();

        let addrs = load_bootstrap_peers(file.path());
        assert_eq!(addrs.len(), 1);
    }

    #[test]
    fn test_missing_bootstrap_file_is_empty() {
        assert!(load_bootstrap_peers(Path::new("/nonexistent/strand-bootstrap")).is_empty());
    }

    #[test]
    fn test_parse_peer_book() {
        let a = PeerId([1; 32]);
        let b = PeerId([2; 32]);
        let raw = format!("{}@127.0.0.1:4101, bogus, {}@10.0.0.2:4101", a.to_hex(), b.to_hex());

        let book = parse_peer_book(&raw);
        assert_eq!(
            book,
            vec![
                (a, "127.0.0.1:4101".to_string()),
                (b, "10.0.0.2:4101".to_string()),
            ]
        );
    }
}
