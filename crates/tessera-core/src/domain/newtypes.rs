//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for identifiers and key
//! material. Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// FileId
// ============================================================================

/// Identity of a tracked file, stable across every replica and forever
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    /// Create a new random FileId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a FileId from an existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid FileId: {e}")))
    }
}

impl From<Uuid> for FileId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ============================================================================
// String-based identifiers
// ============================================================================

/// Returns true if `c` may appear in a device, provider or blob identifier
fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn validate_id(kind: &str, value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::InvalidId(format!("{kind} cannot be empty")));
    }
    if value.starts_with('.') {
        return Err(DomainError::InvalidId(format!(
            "{kind} cannot start with '.': {value}"
        )));
    }
    if !value.chars().all(is_id_char) {
        return Err(DomainError::InvalidId(format!(
            "{kind} contains invalid characters: {value}"
        )));
    }
    Ok(())
}

/// Identifier of a device participating in the sync mesh
///
/// Devices are the "actors" of every [`VectorClock`](super::VectorClock).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId
    ///
    /// # Errors
    /// Returns error if the id is empty or contains characters outside
    /// `[A-Za-z0-9._-]`
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        validate_id("DeviceId", &id)?;
        Ok(Self(id))
    }

    /// Generate a random device id (`dev-<uuid>`)
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("dev-{}", Uuid::new_v4().simple()))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// Identifier of a configured storage provider (e.g. `nas`, `bucket`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderId(String);

impl ProviderId {
    /// Create a new ProviderId
    ///
    /// # Errors
    /// Returns error if the id is empty or contains invalid characters
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        validate_id("ProviderId", &id)?;
        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProviderId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProviderId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ProviderId> for String {
    fn from(id: ProviderId) -> Self {
        id.0
    }
}

/// Backend-assigned (or well-known) name of a remote object
///
/// Blob ids are opaque to the engine. Adapters map them to file names,
/// object keys or drive item ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId(String);

impl BlobId {
    /// Well-known blob holding the encrypted [`ProviderConfig`](crate::domain::ProviderConfig)
    pub const CONFIG: &'static str = "tessera.config";

    /// Well-known blob holding the plain-JSON lease record
    pub const LEASE: &'static str = "tessera.lease";

    /// Create a new BlobId
    ///
    /// # Errors
    /// Returns error if the id is empty or contains invalid characters
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        validate_id("BlobId", &id)?;
        Ok(Self(id))
    }

    /// Generate a fresh random blob name
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// The well-known config blob
    #[must_use]
    pub fn config() -> Self {
        Self(Self::CONFIG.to_string())
    }

    /// The well-known lease blob
    #[must_use]
    pub fn lease() -> Self {
        Self(Self::LEASE.to_string())
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BlobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BlobId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<BlobId> for String {
    fn from(id: BlobId) -> Self {
        id.0
    }
}

// ============================================================================
// Key material
// ============================================================================

/// Length in bytes of every symmetric key handled by the engine
pub const KEY_LEN: usize = 32;

fn decode_key(kind: &str, encoded: &str) -> Result<[u8; KEY_LEN], DomainError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| DomainError::InvalidKey(format!("{kind} is not valid Base64: {e}")))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        DomainError::InvalidKey(format!(
            "{kind} must be {KEY_LEN} bytes, got {} bytes",
            bytes.len()
        ))
    })
}

/// Per-file symmetric content key
///
/// Serialized as Base64. The `Debug` output is redacted so keys never end
/// up in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentKey([u8; KEY_LEN]);

impl ContentKey {
    /// Wrap raw key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("ContentKey(<redacted>)")
    }
}

impl TryFrom<String> for ContentKey {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        decode_key("ContentKey", &s).map(Self)
    }
}

impl From<ContentKey> for String {
    fn from(key: ContentKey) -> Self {
        BASE64.encode(key.0)
    }
}

/// Secret shared by every device of the mesh
///
/// Holding it is what allows a device to join: the provider config and the
/// remote index pages are encrypted with it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    /// Parse a Base64 encoded 32-byte secret
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidKey`] if the input is not Base64 or has
    /// the wrong length
    pub fn from_base64(encoded: &str) -> Result<Self, DomainError> {
        decode_key("SharedSecret", encoded).map(Self)
    }

    /// Wrap raw secret bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Key used for remote metadata (config object and index pages)
    #[must_use]
    pub fn metadata_key(&self) -> ContentKey {
        ContentKey(self.0)
    }

    /// Base64 form, as written in the configuration file
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

impl TryFrom<String> for SharedSecret {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_base64(&s)
    }
}

impl From<SharedSecret> for String {
    fn from(secret: SharedSecret) -> Self {
        secret.to_base64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_roundtrip() {
        let id = FileId::new();
        let parsed: FileId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<FileId>().is_err());
    }

    #[test]
    fn test_device_id_validation() {
        assert!(DeviceId::new("laptop-01").is_ok());
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new("has space").is_err());
        assert!(DeviceId::new("../escape").is_err());
        assert!(DeviceId::generate().as_str().starts_with("dev-"));
    }

    #[test]
    fn test_blob_id_rejects_path_separators() {
        assert!(BlobId::new("a/b").is_err());
        assert!(BlobId::new(".hidden").is_err());
        assert_eq!(BlobId::config().as_str(), BlobId::CONFIG);
        assert_eq!(BlobId::lease().as_str(), BlobId::LEASE);
        assert_ne!(BlobId::generate(), BlobId::generate());
    }

    #[test]
    fn test_content_key_serde_is_base64() {
        let key = ContentKey::from_bytes([7u8; KEY_LEN]);
        let json = serde_json::to_string(&key).unwrap();
        let back: ContentKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
        assert_eq!(format!("{key:?}"), "ContentKey(<redacted>)");
    }

    #[test]
    fn test_shared_secret_length_checked() {
        let short = BASE64.encode([1u8; 16]);
        assert!(matches!(
            SharedSecret::from_base64(&short),
            Err(DomainError::InvalidKey(_))
        ));

        let ok = BASE64.encode([1u8; KEY_LEN]);
        let secret = SharedSecret::from_base64(&ok).unwrap();
        assert_eq!(secret.to_base64(), ok);
        assert_eq!(secret.metadata_key().as_bytes(), &[1u8; KEY_LEN]);
    }
}
