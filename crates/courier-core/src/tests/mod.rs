pub mod receipt_tests;

use crate::clock::Clock;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::repo::{
    CryptoRepository, DirectorySync, EncType, EncryptedPayload, GroupCipher, GroupMetadata,
    GroupMetadataProvider, StanzaTransport, SyncDevice, SyncEntry, SyncFacets, SyncResult,
};
use crate::store::MemoryKeyStore;
use crate::{AuthCreds, MessageRelay};
use async_trait::async_trait;
use courier_wire::{Jid, Node, Server};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

pub fn pn(user: &str) -> Jid {
    Jid::new(user, Server::Pn)
}

pub fn lid(user: &str) -> Jid {
    Jid::new(user, Server::Lid)
}

pub fn group(id: &str) -> Jid {
    Jid::new(id, Server::Group)
}

pub const ME_USER: &str = "1555000999";
pub const ME_LID_USER: &str = "9000000999";

pub fn creds() -> AuthCreds {
    AuthCreds {
        me: pn(ME_USER).with_device(2),
        lid: Some(lid(ME_LID_USER).with_device(2)),
        signed_device_identity: vec![9, 9, 9],
    }
}

#[derive(Clone)]
pub struct MockClock {
    now: Arc<std::sync::Mutex<u64>>,
}

impl MockClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(std::sync::Mutex::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        let mut guard = self.now.lock().expect("clock");
        *guard += ms;
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        *self.now.lock().expect("clock")
    }
}

/// Involutive toy cipher: xor with a fixed pad so tests can decrypt by
/// re-encrypting.
const PAIR_PAD: u8 = 0xAA;
const GROUP_PAD: u8 = 0x55;

/// A session record can exist (a bundle was injected) while the ratchet is
/// not yet settled: the first encryption on such a session is still a
/// pre-key message. Only an encryption settles it.
pub struct MockCrypto {
    sessions: Mutex<HashSet<String>>,
    established: Mutex<HashSet<String>>,
    mappings: Mutex<HashMap<String, Jid>>,
    pub validate_calls: Mutex<usize>,
    pub encrypted: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockCrypto {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashSet::new()),
            established: Mutex::new(HashSet::new()),
            mappings: Mutex::new(HashMap::new()),
            validate_calls: Mutex::new(0),
            encrypted: Mutex::new(Vec::new()),
        }
    }

    pub async fn add_session(&self, jid: &Jid) {
        let address = self.signal_address(jid);
        self.sessions.lock().await.insert(address.clone());
        self.established.lock().await.insert(address);
    }

    pub async fn add_mapping(&self, pn_user: &str, lid_jid: Jid) {
        self.mappings
            .lock()
            .await
            .insert(pn_user.to_string(), lid_jid);
    }

    pub fn decrypt_pairwise(ciphertext: &[u8]) -> Vec<u8> {
        ciphertext.iter().map(|b| b ^ PAIR_PAD).collect()
    }

    pub fn decrypt_group(ciphertext: &[u8]) -> Vec<u8> {
        ciphertext.iter().map(|b| b ^ GROUP_PAD).collect()
    }

    pub async fn plaintext_for(&self, jid: &Jid) -> Option<Vec<u8>> {
        let address = self.signal_address(jid);
        self.encrypted
            .lock()
            .await
            .iter()
            .rev()
            .find(|(a, _)| *a == address)
            .map(|(_, p)| p.clone())
    }
}

#[async_trait]
impl CryptoRepository for MockCrypto {
    async fn encrypt_message(
        &self,
        jid: &Jid,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, RelayError> {
        let address = self.signal_address(jid);
        self.sessions.lock().await.insert(address.clone());
        let fresh = {
            let mut established = self.established.lock().await;
            let fresh = !established.contains(&address);
            established.insert(address.clone());
            fresh
        };
        self.encrypted
            .lock()
            .await
            .push((address, plaintext.to_vec()));
        Ok(EncryptedPayload {
            enc_type: if fresh { EncType::PreKey } else { EncType::Msg },
            ciphertext: plaintext.iter().map(|b| b ^ PAIR_PAD).collect(),
        })
    }

    async fn encrypt_group_message(
        &self,
        group: &Jid,
        _sender: &Jid,
        plaintext: &[u8],
    ) -> Result<GroupCipher, RelayError> {
        Ok(GroupCipher {
            ciphertext: plaintext.iter().map(|b| b ^ GROUP_PAD).collect(),
            distribution_message: format!("dist:{}", group.encode()).into_bytes(),
        })
    }

    async fn validate_session(&self, jid: &Jid) -> Result<bool, RelayError> {
        *self.validate_calls.lock().await += 1;
        let address = self.signal_address(jid);
        Ok(self.sessions.lock().await.contains(&address))
    }

    async fn inject_sessions(&self, bundle: &Node) -> Result<(), RelayError> {
        let list = bundle
            .child("list")
            .ok_or_else(|| RelayError::Transport("bad bundle".to_string()))?;
        let mut sessions = self.sessions.lock().await;
        for user in list.children("user") {
            if let Some(raw) = user.attr("jid") {
                let jid = Jid::parse(raw).map_err(|_| RelayError::Crypto)?;
                sessions.insert(self.signal_address(&jid));
            }
        }
        Ok(())
    }

    async fn store_lid_mappings(&self, pairs: &[(Jid, Jid)]) -> Result<(), RelayError> {
        let mut mappings = self.mappings.lock().await;
        for (lid_jid, pn_jid) in pairs {
            mappings.insert(pn_jid.user.clone(), lid_jid.clone());
        }
        Ok(())
    }

    async fn lids_for_pns(&self, pns: &[Jid]) -> Result<Vec<(Jid, Jid)>, RelayError> {
        let mappings = self.mappings.lock().await;
        Ok(pns
            .iter()
            .filter_map(|pn| mappings.get(&pn.user).map(|l| (pn.clone(), l.clone())))
            .collect())
    }
}

pub struct MockDirectorySync {
    pub calls: Mutex<usize>,
    roster: Mutex<HashMap<String, Vec<SyncDevice>>>,
    lids: Mutex<HashMap<String, Jid>>,
}

impl MockDirectorySync {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(0),
            roster: Mutex::new(HashMap::new()),
            lids: Mutex::new(HashMap::new()),
        }
    }

    pub async fn set_devices(&self, user: &str, devices: &[u16]) {
        let devices = devices
            .iter()
            .map(|d| SyncDevice {
                device: *d,
                hosted: false,
            })
            .collect();
        self.roster.lock().await.insert(user.to_string(), devices);
    }

    pub async fn set_hosted_device(&self, user: &str, device: u16) {
        self.roster
            .lock()
            .await
            .insert(user.to_string(), vec![SyncDevice { device, hosted: true }]);
    }

    pub async fn set_lid(&self, user: &str, lid_jid: Jid) {
        self.lids.lock().await.insert(user.to_string(), lid_jid);
    }

    pub async fn call_count(&self) -> usize {
        *self.calls.lock().await
    }
}

#[async_trait]
impl DirectorySync for MockDirectorySync {
    async fn query_devices(
        &self,
        jids: &[Jid],
        _facets: SyncFacets,
    ) -> Result<SyncResult, RelayError> {
        *self.calls.lock().await += 1;
        let roster = self.roster.lock().await;
        let lids = self.lids.lock().await;
        let entries = jids
            .iter()
            .map(|jid| SyncEntry {
                id: jid.clone(),
                devices: roster.get(&jid.user).cloned().unwrap_or_default(),
                lid: lids.get(&jid.user).cloned(),
            })
            .collect();
        Ok(SyncResult { entries })
    }
}

pub struct MockTransport {
    pub sent: Mutex<Vec<Node>>,
    pub queries: Mutex<Vec<Node>>,
    media_fetches: Mutex<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            media_fetches: Mutex::new(0),
        }
    }

    pub async fn last_sent(&self) -> Option<Node> {
        self.sent.lock().await.last().cloned()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub async fn key_fetch_count(&self) -> usize {
        self.queries
            .lock()
            .await
            .iter()
            .filter(|q| q.attr("xmlns") == Some("encrypt"))
            .count()
    }

    pub async fn media_fetch_count(&self) -> usize {
        *self.media_fetches.lock().await
    }

    pub async fn last_key_fetch(&self) -> Option<Node> {
        self.queries
            .lock()
            .await
            .iter()
            .filter(|q| q.attr("xmlns") == Some("encrypt"))
            .last()
            .cloned()
    }

    pub async fn last_query(&self) -> Option<Node> {
        self.queries.lock().await.last().cloned()
    }
}

#[async_trait]
impl StanzaTransport for MockTransport {
    async fn send_node(&self, node: Node) -> Result<(), RelayError> {
        self.sent.lock().await.push(node);
        Ok(())
    }

    async fn query(&self, node: Node) -> Result<Node, RelayError> {
        self.queries.lock().await.push(node.clone());
        match node.attr("xmlns") {
            Some("encrypt") => {
                let mut list = Node::new("list");
                if let Some(key) = node.child("key") {
                    for user in key.children("user") {
                        if let Some(jid) = user.attr("jid") {
                            list.push(Node::new("user").with_attr("jid", jid));
                        }
                    }
                }
                let mut response = Node::new("iq").with_attr("type", "result");
                response.push(list);
                Ok(response)
            }
            Some("w:m") => {
                let fetch = {
                    let mut guard = self.media_fetches.lock().await;
                    *guard += 1;
                    *guard
                };
                let mut conn = Node::new("media_conn")
                    .with_attr("auth", format!("tok-{fetch}"))
                    .with_attr("ttl", "300");
                conn.push(
                    Node::new("host")
                        .with_attr("hostname", "media.example")
                        .with_attr("maxContentLengthBytes", "1000000"),
                );
                let mut response = Node::new("iq").with_attr("type", "result");
                response.push(conn);
                Ok(response)
            }
            _ => Ok(Node::new("ack").with_attr("type", "result")),
        }
    }
}

pub struct MockGroups {
    meta: Mutex<HashMap<String, GroupMetadata>>,
    cached: Mutex<HashMap<String, GroupMetadata>>,
    pub calls: Mutex<usize>,
}

impl MockGroups {
    pub fn new() -> Self {
        Self {
            meta: Mutex::new(HashMap::new()),
            cached: Mutex::new(HashMap::new()),
            calls: Mutex::new(0),
        }
    }

    pub async fn set_metadata(&self, group: &Jid, metadata: GroupMetadata) {
        self.meta.lock().await.insert(group.encode(), metadata);
    }

    pub async fn set_cached(&self, group: &Jid, metadata: GroupMetadata) {
        self.cached.lock().await.insert(group.encode(), metadata);
    }

    pub async fn call_count(&self) -> usize {
        *self.calls.lock().await
    }
}

#[async_trait]
impl GroupMetadataProvider for MockGroups {
    async fn metadata(&self, group: &Jid) -> Result<GroupMetadata, RelayError> {
        *self.calls.lock().await += 1;
        self.meta
            .lock()
            .await
            .get(&group.encode())
            .cloned()
            .ok_or(RelayError::NotFound)
    }

    async fn cached_metadata(&self, group: &Jid) -> Option<GroupMetadata> {
        self.cached.lock().await.get(&group.encode()).cloned()
    }
}

pub struct Harness {
    pub relay: Arc<MessageRelay>,
    pub crypto: Arc<MockCrypto>,
    pub sync: Arc<MockDirectorySync>,
    pub transport: Arc<MockTransport>,
    pub keys: Arc<MemoryKeyStore>,
    pub groups: Arc<MockGroups>,
    pub clock: Arc<MockClock>,
}

pub fn build() -> Harness {
    build_with(RelayConfig::default(), creds())
}

pub fn build_with(config: RelayConfig, creds: AuthCreds) -> Harness {
    let crypto = Arc::new(MockCrypto::new());
    let sync = Arc::new(MockDirectorySync::new());
    let transport = Arc::new(MockTransport::new());
    let keys = Arc::new(MemoryKeyStore::new());
    let groups = Arc::new(MockGroups::new());
    let clock = Arc::new(MockClock::new(1_700_000_000_000));
    let relay = MessageRelay::new(
        config,
        creds,
        crypto.clone(),
        keys.clone(),
        sync.clone(),
        transport.clone(),
        groups.clone(),
        clock.clone(),
        None,
    );
    Harness {
        relay: Arc::new(relay),
        crypto,
        sync,
        transport,
        keys,
        groups,
        clock,
    }
}

pub fn text(body: &str) -> crate::message::MessageContent {
    crate::message::MessageContent::Text {
        body: body.to_string(),
    }
}

pub fn participant_jids(stanza: &Node) -> Vec<String> {
    stanza
        .child("participants")
        .map(|list| {
            list.children("to")
                .iter()
                .filter_map(|to| to.attr("jid"))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn participant_enc<'a>(stanza: &'a Node, jid: &str) -> Option<&'a Node> {
    stanza
        .child("participants")?
        .children("to")
        .into_iter()
        .find(|to| to.attr("jid") == Some(jid))?
        .child("enc")
}
