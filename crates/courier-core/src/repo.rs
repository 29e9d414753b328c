use crate::error::RelayError;
use async_trait::async_trait;
use courier_wire::{Jid, Node};
use serde::{Deserialize, Serialize};

/// Ciphertext class reported by the pairwise encryptor. `PreKey` means a
/// fresh session was set up for this encryption; upstream attaches the
/// signed device-identity block when that happens anywhere in a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncType {
    PreKey,
    Msg,
    SenderKey,
}

impl EncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncType::PreKey => "pkmsg",
            EncType::Msg => "msg",
            EncType::SenderKey => "skmsg",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EncryptedPayload {
    pub enc_type: EncType,
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct GroupCipher {
    pub ciphertext: Vec<u8>,
    pub distribution_message: Vec<u8>,
}

/// The pairwise/group cryptographic primitives plus the PN<->LID identity
/// mapping store. Session state lives behind this boundary; the relay only
/// orchestrates when it must exist.
#[async_trait]
pub trait CryptoRepository: Send + Sync {
    async fn encrypt_message(
        &self,
        jid: &Jid,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, RelayError>;

    async fn encrypt_group_message(
        &self,
        group: &Jid,
        sender: &Jid,
        plaintext: &[u8],
    ) -> Result<GroupCipher, RelayError>;

    async fn validate_session(&self, jid: &Jid) -> Result<bool, RelayError>;

    /// Injects session material returned by a key-bundle fetch.
    async fn inject_sessions(&self, bundle: &Node) -> Result<(), RelayError>;

    /// Persists privacy-id mappings discovered during directory sync.
    /// Pairs are (lid, pn).
    async fn store_lid_mappings(&self, pairs: &[(Jid, Jid)]) -> Result<(), RelayError>;

    /// Looks up privacy-id forms for phone-number jids. Returns (pn, lid)
    /// for each input that has a known mapping; unmapped inputs are absent.
    async fn lids_for_pns(&self, pns: &[Jid]) -> Result<Vec<(Jid, Jid)>, RelayError>;

    /// Stable per-device address used to key session state and locks.
    fn signal_address(&self, jid: &Jid) -> String {
        format!("{}.{}", jid.user, jid.device_index())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SyncFacets {
    pub device_list: bool,
    pub lid_mapping: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDevice {
    pub device: u16,
    pub hosted: bool,
}

#[derive(Clone, Debug)]
pub struct SyncEntry {
    pub id: Jid,
    pub devices: Vec<SyncDevice>,
    pub lid: Option<Jid>,
}

#[derive(Clone, Debug, Default)]
pub struct SyncResult {
    pub entries: Vec<SyncEntry>,
}

/// Batched directory query: one round trip resolves device rosters and
/// privacy-id mappings for every queried identity.
#[async_trait]
pub trait DirectorySync: Send + Sync {
    async fn query_devices(&self, jids: &[Jid], facets: SyncFacets) -> Result<SyncResult, RelayError>;
}

/// Request/response stanza plumbing. Binary framing is the transport's
/// concern; the relay hands over assembled trees.
#[async_trait]
pub trait StanzaTransport: Send + Sync {
    async fn send_node(&self, node: Node) -> Result<(), RelayError>;
    async fn query(&self, node: Node) -> Result<Node, RelayError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressingMode {
    Pn,
    Lid,
}

impl AddressingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressingMode::Pn => "pn",
            AddressingMode::Lid => "lid",
        }
    }
}

#[derive(Clone, Debug)]
pub struct GroupMetadata {
    pub participants: Vec<Jid>,
    pub ephemeral_duration: Option<u64>,
    pub addressing_mode: Option<AddressingMode>,
}

#[async_trait]
pub trait GroupMetadataProvider: Send + Sync {
    async fn metadata(&self, group: &Jid) -> Result<GroupMetadata, RelayError>;

    /// Cache-aware variant; `None` means no cached copy, fall back to
    /// `metadata`.
    async fn cached_metadata(&self, _group: &Jid) -> Option<GroupMetadata> {
        None
    }
}
