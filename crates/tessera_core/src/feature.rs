//! Feature sets and compatibility fingerprints.
//!
//! A [`FeatureSet`] names the capability tokens a server offers, the role it
//! plays, and the protocol version it speaks. Its [`Fingerprint`] is a BLAKE3
//! digest over the sorted tokens, the role, and the version; servers with
//! equal fingerprints land in the same registry group.

use crate::error::{CoreError, CoreResult};
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Role a server plays in the mesh. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// Coordinates other servers
    Master,
    /// Executes tasks
    Worker,
    /// Coordinates and executes
    Hybrid,
    /// Sits at the network edge
    Edge,
}

impl ServerRole {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
            Self::Hybrid => "hybrid",
            Self::Edge => "edge",
        }
    }
}

impl Default for ServerRole {
    fn default() -> Self {
        Self::Hybrid
    }
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "worker" => Ok(Self::Worker),
            "hybrid" => Ok(Self::Hybrid),
            "edge" => Ok(Self::Edge),
            _ => Err(CoreError::InvalidRole {
                value: s.to_string(),
            }),
        }
    }
}

/// Deterministic grouping key for a feature set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(Hash);

impl Fingerprint {
    /// Compute the fingerprint of `(sorted features, role, version)`
    #[must_use]
    pub fn compute(features: &BTreeSet<String>, role: ServerRole, version: &str) -> Self {
        // Length-prefixed framing keeps ("ab","c") and ("a","bc") apart.
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(features.len() as u64).to_le_bytes());
        for feature in features {
            frame(&mut hasher, feature.as_bytes());
        }
        frame(&mut hasher, role.as_str().as_bytes());
        frame(&mut hasher, version.as_bytes());
        Self(Hash::finish(&hasher))
    }

    /// Underlying hash
    #[must_use]
    pub const fn as_hash(&self) -> &Hash {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fp_{}", self.0.short_hex(8))
    }
}

fn frame(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Wire shape of a feature set; the fingerprint is recomputed on decode
#[derive(Deserialize)]
struct RawFeatureSet {
    features: BTreeSet<String>,
    role: ServerRole,
    version: String,
    // Read so positional formats stay aligned, then discarded.
    #[serde(default = "unset_fingerprint")]
    #[allow(dead_code)]
    fingerprint: Fingerprint,
}

fn unset_fingerprint() -> Fingerprint {
    Fingerprint(Hash::from_bytes([0u8; 32]))
}

impl From<RawFeatureSet> for FeatureSet {
    fn from(raw: RawFeatureSet) -> Self {
        Self::new(raw.role, raw.version, raw.features)
    }
}

/// Capabilities advertised by one server
///
/// Fields are private so the fingerprint can never drift from the
/// features, role, and version it was computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawFeatureSet")]
pub struct FeatureSet {
    features: BTreeSet<String>,
    role: ServerRole,
    version: String,
    fingerprint: Fingerprint,
}

impl FeatureSet {
    /// Create a feature set
    #[must_use]
    pub fn new<I, S>(role: ServerRole, version: impl Into<String>, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let features: BTreeSet<String> = features.into_iter().map(Into::into).collect();
        let version = version.into();
        let fingerprint = Fingerprint::compute(&features, role, &version);
        Self {
            features,
            role,
            version,
            fingerprint,
        }
    }

    fn rehash(&mut self) {
        self.fingerprint = Fingerprint::compute(&self.features, self.role, &self.version);
    }

    /// Capability tokens, sorted
    #[must_use]
    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    /// Server role
    #[must_use]
    pub fn role(&self) -> ServerRole {
        self.role
    }

    /// Protocol version
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Compatibility fingerprint
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Add a capability token. Returns true if it was new.
    pub fn insert(&mut self, feature: impl Into<String>) -> bool {
        let inserted = self.features.insert(feature.into());
        if inserted {
            self.rehash();
        }
        inserted
    }

    /// Remove a capability token. Returns true if it was present.
    pub fn remove(&mut self, feature: &str) -> bool {
        let removed = self.features.remove(feature);
        if removed {
            self.rehash();
        }
        removed
    }

    /// Change the role
    pub fn set_role(&mut self, role: ServerRole) {
        self.role = role;
        self.rehash();
    }

    /// Change the version
    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = version.into();
        self.rehash();
    }

    /// Check whether another feature set speaks the same protocol version
    #[must_use]
    pub fn is_compatible_with(&self, other: &FeatureSet) -> bool {
        self.version == other.version
    }

    /// Check whether every required token is offered
    #[must_use]
    pub fn can_handle(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.features)
    }

    /// Check whether a single token is offered
    #[must_use]
    pub fn has(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Required tokens this set does not offer
    #[must_use]
    pub fn missing<'a>(&'a self, required: &'a BTreeSet<String>) -> Vec<&'a str> {
        required
            .difference(&self.features)
            .map(String::as_str)
            .collect()
    }

    /// Validate tokens and version
    ///
    /// # Errors
    ///
    /// Returns error if the version is empty or a token is empty or
    /// contains whitespace
    pub fn validate(&self) -> CoreResult<()> {
        if self.version.trim().is_empty() {
            return Err(CoreError::Validation {
                field: "version".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        for feature in &self.features {
            if feature.is_empty() || feature.chars().any(char::is_whitespace) {
                return Err(CoreError::InvalidFeature {
                    reason: format!("bad token {feature:?}"),
                });
            }
        }
        Ok(())
    }

    /// Number of tokens
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Check if no tokens are offered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self::new(ServerRole::default(), "1.0.0", Vec::<String>::new())
    }
}
