//! # Operator Signer
//!
//! Loads the operator keypair from a Solana CLI keypair file
//! (a JSON array of 64 bytes).

use std::fs;
use std::sync::Arc;

use solana_sdk::signature::{Keypair, Signer};
use thiserror::Error;
use tracing::info;

/// Errors that can occur when loading the operator keypair.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("Invalid keypair path: {0}")]
    Path(String),

    #[error("Failed to read keypair file: {0}")]
    Read(String),

    #[error("Failed to parse keypair: {0}")]
    Parse(String),
}

/// Load the operator keypair from `path`.
///
/// `~` and environment variables in the path are expanded.
///
/// ## Returns
///
/// * `Ok(Arc<Keypair>)` - Keypair loaded
/// * `Err(SignerError)` - Path, file or format problem
pub fn load_keypair(path: &str) -> Result<Arc<Keypair>, SignerError> {
    let expanded = shellexpand::full(path).map_err(|e| SignerError::Path(e.to_string()))?;

    let contents =
        fs::read_to_string(expanded.as_ref()).map_err(|e| SignerError::Read(e.to_string()))?;

    let bytes: Vec<u8> =
        serde_json::from_str(&contents).map_err(|e| SignerError::Parse(e.to_string()))?;

    let keypair = Keypair::from_bytes(&bytes).map_err(|e| SignerError::Parse(e.to_string()))?;

    info!("🔑 Operator keypair loaded: {}", keypair.pubkey());
    Ok(Arc::new(keypair))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_loads_cli_keypair_file() {
        let keypair = Keypair::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&keypair.to_bytes().to_vec()).unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let loaded = load_keypair(file.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded.pubkey(), keypair.pubkey());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let result = load_keypair("/nonexistent/operator.json");
        assert!(matches!(result, Err(SignerError::Read(_))));
    }

    #[test]
    fn test_garbage_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a keypair").unwrap();

        let result = load_keypair(file.path().to_str().unwrap());
        assert!(matches!(result, Err(SignerError::Parse(_))));
    }
}
