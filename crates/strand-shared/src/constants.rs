use std::time::Duration;

/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/strand/1.0.0";

/// Application name
pub const APP_NAME: &str = "strand";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Ed25519 / X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum size of one framed envelope on a stream (4 MiB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Default QUIC listen port of the DHT swarm
pub const DEFAULT_DHT_PORT: u16 = 4001;

/// Default TCP port of the service protocol
pub const DEFAULT_SERVICE_PORT: u16 = 4101;

// ---------------------------------------------------------------------------
// Service layer
// ---------------------------------------------------------------------------

/// Exchanges on one stream before it is recycled.
pub const STREAM_REUSE_TRIES: u32 = 3;

/// How long a request waits for its matching response.
pub const READ_MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for dialing and writing one message.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Storage / DHT
// ---------------------------------------------------------------------------

/// Timeout for a single content read.
pub const CONTENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for DHT publications and lookups.
pub const DHT_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of leading bits of a peer hash kept in its pointer key.
pub const POINTER_PREFIX_BITS: u32 = 14;

/// Outbound pointers older than this are dropped instead of republished.
pub const POINTER_EXPIRY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

/// Cafe request queue flush interval.
pub const CAFE_FLUSH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Cafe request queue page size.
pub const CAFE_QUEUE_PAGE_SIZE: u32 = 16;

/// Message retriever interval.
pub const RETRIEVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Concurrent pointer downloads during a retrieval pass.
pub const RETRIEVE_IN_FLIGHT: usize = 5;

/// Pointer republisher interval.
pub const REPUBLISH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Lifetime of a cafe session issued by a host.
pub const CAFE_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SEAL_KEY: &str = "strand-seal-key-v1";
pub const KDF_CONTEXT_POINTER_KEY: &str = "strand-pointer-key-v1";

/// Prefix of external invite links
pub const INVITE_LINK_PREFIX: &str = "strand://invite/";
