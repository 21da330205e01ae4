//! Checksummed record encoding.
//!
//! The checksum is the hex SHA-256 of the record serialized (compact) with
//! an empty `checksum` field. Maps are `BTreeMap`s, so the serialization is
//! deterministic and can be recomputed on load.

use sha2::{Digest, Sha256};

use super::types::SessionRecord;
use crate::error::{Result, VigilError};

fn digest(record: &SessionRecord) -> Result<String> {
    let mut unsigned = record.clone();
    unsigned.checksum.clear();
    let body = serde_json::to_vec(&unsigned)?;
    let hash = Sha256::digest(&body);
    Ok(hash.iter().map(|b| format!("{b:02x}")).collect())
}

/// Serialize `record` (pretty JSON) with its checksum embedded.
///
/// # Errors
///
/// Returns [`VigilError::Json`] if serialization fails.
pub fn encode(record: &SessionRecord) -> Result<String> {
    let mut signed = record.clone();
    signed.checksum = digest(record)?;
    Ok(serde_json::to_string_pretty(&signed)?)
}

/// Parse a record and verify its checksum.
///
/// # Errors
///
/// Returns [`VigilError::Session`] when the text is not a record, the
/// checksum is missing, or it does not match the content.
pub fn decode(text: &str) -> Result<SessionRecord> {
    let record: SessionRecord = serde_json::from_str(text)
        .map_err(|e| VigilError::Session(format!("unparseable session record: {e}")))?;
    if record.checksum.is_empty() {
        return Err(VigilError::Session(format!(
            "session record {} has no checksum",
            record.session_id
        )));
    }
    let expected = digest(&record)?;
    if expected != record.checksum {
        return Err(VigilError::Session(format!(
            "checksum mismatch for session {} (revision {})",
            record.session_id, record.revision
        )));
    }
    Ok(record)
}
