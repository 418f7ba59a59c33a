//! Versioned blob codec for component state.
//!
//! Every persisted component writes a `{version, state}` JSON envelope
//! through the injected `BlobStore`. Decoding a blob with a different
//! version (or a corrupt one) yields `None`: the component logs once and
//! reinitializes to defaults. Failed writes leave the component dirty so
//! the write is retried at the next cadence point.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::BlobStore;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("blob is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown blob version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    state: T,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Encode a state blob. Serialization of plain-data state cannot fail in
/// practice; on the off chance it does, an empty blob is written and a
/// warning logged.
pub fn encode<T: Serialize>(version: u32, state: &T) -> Vec<u8> {
    match serde_json::to_vec(&Envelope { version, state }) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(%err, "failed to encode state blob");
            Vec::new()
        }
    }
}

fn decode<T: DeserializeOwned>(expected: u32, bytes: &[u8]) -> Result<T, PersistError> {
    let probe: VersionProbe = serde_json::from_slice(bytes)?;
    if probe.version != expected {
        return Err(PersistError::VersionMismatch {
            found: probe.version,
            expected,
        });
    }
    let envelope: Envelope<T> = serde_json::from_slice(bytes)?;
    Ok(envelope.state)
}

/// Load a component's state blob, or `None` if absent, corrupt, or from an
/// unknown version. Corruption is logged once here; callers reinitialize.
pub fn load<T: DeserializeOwned>(store: &dyn BlobStore, key: &str, version: u32) -> Option<T> {
    let bytes = store.get(key)?;
    match decode(version, &bytes) {
        Ok(state) => Some(state),
        Err(err) => {
            tracing::warn!(key, %err, "discarding persisted state, reinitializing");
            None
        }
    }
}

/// Write a component's state blob. Returns whether the write landed; a
/// `false` means the caller should stay dirty and retry next cadence.
pub fn save<T: Serialize>(store: &dyn BlobStore, key: &str, version: u32, state: &T) -> bool {
    match store.put(key, encode(version, state)) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(key, %err, "state write failed, will retry next cadence");
            false
        }
    }
}
