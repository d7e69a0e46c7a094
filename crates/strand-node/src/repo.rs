//! On-disk layout of a node repository.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tracing::info;

use strand_shared::identity::KeypairExport;
use strand_shared::Keypair;

const IDENTITY_FILE: &str = "identity.json";
const DATABASE_FILE: &str = "strand.db";
const BLOCKS_DIR: &str = "blocks";

pub struct Repo {
    root: PathBuf,
}

impl Repo {
    /// Open the repository at `root`, creating the directory if missing.
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root).with_context(|| format!("creating repo {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join(DATABASE_FILE)
    }

    pub fn blocks_path(&self) -> PathBuf {
        self.root.join(BLOCKS_DIR)
    }

    /// Load the node identity, generating and saving one on first start.
    pub fn load_or_create_identity(&self) -> anyhow::Result<Keypair> {
        let path = self.root.join(IDENTITY_FILE);
        if path.exists() {
            let raw = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let export: KeypairExport = serde_json::from_slice(&raw).context("parsing identity file")?;
            let keypair = Keypair::from_export(&export);
            if keypair.public_key_bytes() != export.public_key {
                bail!("identity file {} is corrupt: public key mismatch", path.display());
            }
            return Ok(keypair);
        }

        let keypair = Keypair::generate();
        let raw = serde_json::to_vec_pretty(&keypair.to_export())?;
        std::fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!(peer = %keypair.peer_id(), "Generated node identity");
        Ok(keypair)
    }
}
