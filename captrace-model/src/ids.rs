use uuid::Uuid;

use crate::error::ModelError;

/// Strongly typed id for investors (one per configured root).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct InvestorId(pub Uuid);

impl Default for InvestorId {
    fn default() -> Self {
        Self::new()
    }
}

impl InvestorId {
    pub fn new() -> Self {
        InvestorId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl AsRef<Uuid> for InvestorId {
    fn as_ref(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for InvestorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed id for funds, scoped under an investor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct FundId(pub Uuid);

impl Default for FundId {
    fn default() -> Self {
        Self::new()
    }
}

impl FundId {
    pub fn new() -> Self {
        FundId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl AsRef<Uuid> for FundId {
    fn as_ref(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for FundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed id for reporting periods (month-end boundaries).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PeriodId(pub Uuid);

impl Default for PeriodId {
    fn default() -> Self {
        Self::new()
    }
}

impl PeriodId {
    pub fn new() -> Self {
        PeriodId(Uuid::now_v7())
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for PeriodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable document id: the first 16 hex characters of the file's SHA-256
/// content hash. Deterministic, so reprocessing the same bytes always maps
/// to the same document row.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct DocId(String);

/// Hex prefix length taken from the content hash.
pub const DOC_ID_LEN: usize = 16;

impl DocId {
    /// Derive the document id from a full SHA-256 hex digest.
    pub fn from_content_hash(hash: &str) -> Result<Self, ModelError> {
        if hash.len() < DOC_ID_LEN {
            return Err(ModelError::InvalidId(format!(
                "content hash too short for doc id: {hash:?}"
            )));
        }
        let prefix = &hash[..DOC_ID_LEN];
        if !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ModelError::InvalidId(format!(
                "content hash is not hex: {hash:?}"
            )));
        }
        Ok(DocId(prefix.to_ascii_lowercase()))
    }

    /// Wrap an already-validated id (e.g. read back from the database).
    pub fn from_trusted(raw: impl Into<String>) -> Self {
        DocId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_takes_sixteen_hex_chars() {
        let hash = "a3f1b2c4d5e6f708090a0b0c0d0e0f10ffffffffffffffffffffffffffffffff";
        let id = DocId::from_content_hash(hash).unwrap();
        assert_eq!(id.as_str(), "a3f1b2c4d5e6f708");
    }

    #[test]
    fn doc_id_is_deterministic() {
        let hash = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
        assert_eq!(
            DocId::from_content_hash(hash).unwrap(),
            DocId::from_content_hash(hash).unwrap()
        );
    }

    #[test]
    fn doc_id_rejects_short_or_non_hex_input() {
        assert!(DocId::from_content_hash("abc").is_err());
        assert!(DocId::from_content_hash("zzzzzzzzzzzzzzzzzz").is_err());
    }
}
