use serde::{Deserialize, Serialize};

/// What to do when the direct path wants to substitute the device-sent
/// wrapper for one of the sender's own devices but neither a phone-number
/// nor a privacy-id form of "self" is available.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub enum SelfSubstitutionPolicy {
    Skip,
    Fail,
}

impl Default for SelfSubstitutionPolicy {
    fn default() -> Self {
        SelfSubstitutionPolicy::Skip
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub device_cache_ttl_secs: u64,
    pub session_cache_ttl_secs: u64,
    pub use_device_cache: bool,
    pub use_cached_group_metadata: bool,
    pub self_substitution: SelfSubstitutionPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            device_cache_ttl_secs: 300,
            session_cache_ttl_secs: 300,
            use_device_cache: true,
            use_cached_group_metadata: true,
            self_substitution: SelfSubstitutionPolicy::default(),
        }
    }
}
