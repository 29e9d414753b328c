pub mod cache;
pub mod call;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod media;
pub mod message;
pub mod participant;
pub mod receipts;
pub mod repo;
pub mod resolver;
pub mod session;
pub mod store;

#[cfg(test)]
mod tests;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cache::TtlCache;
use clock::Clock;
use config::RelayConfig;
use courier_wire::{Jid, Node, Server};
use error::RelayError;
use event::{EventBus, EventReceiver};
use media::MediaGateway;
use message::{
    button_args, button_type, media_type, message_type, normalized, wants_interactive_companion,
    MessageContent,
};
use participant::{KeyedMutex, MessagePatcher, PatchedBatch, RecipientEncryptor};
use rand::RngCore;
use repo::{AddressingMode, CryptoRepository, DirectorySync, GroupMetadataProvider, StanzaTransport};
use resolver::{DeviceEntry, DeviceResolver, RosterDevice};
use session::SessionAssurance;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use store::KeyStore;
use tracing::{debug, trace};

const SENDER_KEY_MEMORY: &str = "sender-key-memory";

/// The authenticated local account: primary phone-number identity, optional
/// privacy-id identity, and the signed device-identity block attached to
/// stanzas when a fresh session was used.
#[derive(Clone, Debug)]
pub struct AuthCreds {
    pub me: Jid,
    pub lid: Option<Jid>,
    pub signed_device_identity: Vec<u8>,
}

/// Resend context for a message a specific device failed to decrypt. When
/// present, fan-out and own-device substitution are bypassed and exactly
/// one pairwise node is produced.
#[derive(Clone, Debug)]
pub struct RetryContext {
    pub jid: Jid,
    pub count: u32,
}

#[derive(Clone, Debug, Default)]
pub struct RelayOptions {
    pub message_id: Option<String>,
    pub retry: Option<RetryContext>,
    pub additional_attributes: HashMap<String, String>,
    pub additional_nodes: Vec<Node>,
    pub use_device_cache: Option<bool>,
    pub use_cached_group_metadata: Option<bool>,
    /// Explicit recipient list for status broadcasts, which have no
    /// participant roster to resolve.
    pub status_recipients: Vec<Jid>,
}

/// Top-level entry point of the relay subsystem. Owns the process-wide
/// caches and drives resolution, session assurance, encryption and stanza
/// assembly.
pub struct MessageRelay {
    pub(crate) config: RelayConfig,
    pub(crate) creds: AuthCreds,
    pub(crate) crypto: Arc<dyn CryptoRepository>,
    pub(crate) keys: Arc<dyn KeyStore>,
    pub(crate) transport: Arc<dyn StanzaTransport>,
    pub(crate) groups: Arc<dyn GroupMetadataProvider>,
    pub(crate) resolver: DeviceResolver,
    pub(crate) sessions: SessionAssurance,
    pub(crate) encryptor: RecipientEncryptor,
    pub(crate) media: MediaGateway,
    pub(crate) events: EventBus,
    pub(crate) clock: Arc<dyn Clock>,
}

impl MessageRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RelayConfig,
        creds: AuthCreds,
        crypto: Arc<dyn CryptoRepository>,
        keys: Arc<dyn KeyStore>,
        sync: Arc<dyn DirectorySync>,
        transport: Arc<dyn StanzaTransport>,
        groups: Arc<dyn GroupMetadataProvider>,
        clock: Arc<dyn Clock>,
        patcher: Option<Arc<MessagePatcher>>,
    ) -> Self {
        let device_cache: TtlCache<String, Vec<RosterDevice>> =
            TtlCache::new(config.device_cache_ttl_secs, clock.clone());
        let session_cache: TtlCache<String, bool> =
            TtlCache::new(config.session_cache_ttl_secs, clock.clone());
        let resolver = DeviceResolver::new(
            sync,
            crypto.clone(),
            keys.clone(),
            device_cache,
            creds.me.clone(),
            creds.lid.clone(),
        );
        let sessions = SessionAssurance::new(crypto.clone(), transport.clone(), session_cache);
        let encryptor = RecipientEncryptor::new(
            crypto.clone(),
            Arc::new(KeyedMutex::new()),
            creds.me.clone(),
            creds.lid.clone(),
            config.self_substitution.clone(),
            patcher,
        );
        let media = MediaGateway::new(transport.clone(), clock.clone());
        Self {
            config,
            creds,
            crypto,
            keys,
            transport,
            groups,
            resolver,
            sessions,
            encryptor,
            media,
            events: EventBus::new(256),
            clock,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Publisher handle for the inbound layer (media updates and the like
    /// are forwarded here, not produced by the relay itself).
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn resolver(&self) -> &DeviceResolver {
        &self.resolver
    }

    pub fn sessions(&self) -> &SessionAssurance {
        &self.sessions
    }

    pub async fn relay_message(
        &self,
        jid: &Jid,
        message: MessageContent,
        options: RelayOptions,
    ) -> Result<String, RelayError> {
        if self.creds.me.user.is_empty() {
            return Err(RelayError::Precondition(
                "missing authenticated identity".to_string(),
            ));
        }
        // fatal construction errors surface before anything is encrypted or sent
        let button_companion = match button_type(&message) {
            Some(kind) => Some((kind, button_args(&message)?)),
            None => None,
        };

        let me = self.creds.me.clone();
        let me_lid = self.creds.lid.clone();
        let is_retry = options.retry.is_some();
        let is_group = jid.is_group();
        let is_status = jid.is_status_broadcast();
        let is_lid_dest = jid.server == Server::Lid;
        let is_newsletter = jid.is_newsletter();
        let destination = jid.normalized();
        let msg_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| self.generate_message_id());
        let use_cache = options
            .use_device_cache
            .unwrap_or(self.config.use_device_cache);
        let use_cached_meta = options
            .use_cached_group_metadata
            .unwrap_or(self.config.use_cached_group_metadata)
            && !is_status;

        let mut attrs = options.additional_attributes.clone();
        let mut extra_attrs: HashMap<String, String> = HashMap::new();
        let mut content_nodes: Vec<Node> = Vec::new();
        let mut participants: Vec<Node> = Vec::new();
        let mut include_device_identity = is_retry;

        if is_retry && !is_group && !is_status {
            attrs.insert("device_fanout".to_string(), "false".to_string());
        }

        // the whole call is one critical section against the durable store;
        // concurrent relays cannot interleave with this call's read-modify-write
        let txn = self.keys.transaction_lock();
        let _txn_guard = txn.lock().await;

        if let Some(kind) = media_type(&message) {
            extra_attrs.insert("mediatype".to_string(), kind.as_str().to_string());
        }
        if matches!(normalized(&message), MessageContent::PinInChat { .. }) {
            extra_attrs.insert("decrypt-fail".to_string(), "hide".to_string());
        }

        if is_newsletter {
            let patched = self.patch_uniform(&message, "channel")?;
            let bytes = patched.to_bytes()?;
            let mut stanza = Node::new("message")
                .with_attr("id", msg_id.clone())
                .with_attr("to", destination.encode())
                .with_attr("type", message_type(&message).as_str());
            for (key, value) in attrs {
                stanza.attrs.insert(key, value);
            }
            stanza.push(Node::new("plaintext").with_bytes(bytes));
            debug!(%msg_id, to = %destination, "sending channel message");
            self.transport.send_node(stanza).await?;
            return Ok(msg_id);
        }

        if is_group || is_status {
            let metadata = if is_status {
                None
            } else {
                let cached = if use_cached_meta {
                    self.groups.cached_metadata(jid).await
                } else {
                    None
                };
                match cached {
                    Some(meta) => {
                        trace!(to = %destination, participants = meta.participants.len(), "using cached group metadata");
                        Some(meta)
                    }
                    None => Some(self.groups.metadata(jid).await?),
                }
            };

            let memory_key = destination.encode();
            let mut notified: HashMap<String, bool> = if is_retry {
                HashMap::new()
            } else {
                let stored = self
                    .keys
                    .get(SENDER_KEY_MEMORY, std::slice::from_ref(&memory_key))
                    .await?;
                stored
                    .get(&memory_key)
                    .and_then(|bytes| serde_json::from_slice(bytes).ok())
                    .unwrap_or_default()
            };

            let devices: Vec<DeviceEntry> = if let Some(retry) = &options.retry {
                vec![DeviceEntry::from_jid(&retry.jid)]
            } else {
                let roster: Vec<Jid> = if is_status {
                    options.status_recipients.clone()
                } else {
                    let meta = metadata.as_ref().ok_or(RelayError::NotFound)?;
                    let mode = meta.addressing_mode.unwrap_or(AddressingMode::Lid);
                    attrs
                        .entry("addressing_mode".to_string())
                        .or_insert_with(|| mode.as_str().to_string());
                    meta.participants.clone()
                };
                self.resolver.resolve(&roster, use_cache, false).await?
            };

            if let Some(meta) = metadata.as_ref() {
                if let Some(expiration) = meta.ephemeral_duration {
                    if expiration > 0 {
                        attrs.insert("expiration".to_string(), expiration.to_string());
                    }
                }
            }

            let patched = self.patch_uniform(&message, "group")?;
            let bytes = patched.to_bytes()?;
            let lid_mode = attrs.get("addressing_mode").map(String::as_str) == Some("lid");
            let sender_identity = match (&me_lid, lid_mode) {
                (Some(lid), true) => lid.clone(),
                _ => me.clone(),
            };
            let group_cipher = self
                .crypto
                .encrypt_group_message(&destination, &sender_identity, &bytes)
                .await?;

            let mut dist_targets: Vec<Jid> = Vec::new();
            for device in devices.iter() {
                let address = device.jid.encode();
                let already = notified.get(&address).copied().unwrap_or(false);
                if !already || is_retry {
                    dist_targets.push(device.jid.clone());
                    notified.insert(address, true);
                }
            }
            if !dist_targets.is_empty() {
                debug!(count = dist_targets.len(), "sending fan-out key distribution");
                let dist_message = MessageContent::SenderKeyDistribution {
                    group: destination.encode(),
                    payload: group_cipher.distribution_message.clone(),
                };
                include_device_identity |= self.sessions.assert_sessions(&dist_targets).await?;
                let result = self
                    .encryptor
                    .encrypt_for(&dist_targets, &dist_message, &extra_attrs, None)
                    .await?;
                include_device_identity |= result.used_new_session;
                participants.extend(result.nodes);
            }

            if let Some(retry) = &options.retry {
                let payload = self.crypto.encrypt_message(&retry.jid, &bytes).await?;
                content_nodes.push(
                    Node::new("enc")
                        .with_attr("v", "2")
                        .with_attr("type", payload.enc_type.as_str())
                        .with_attr("count", retry.count.to_string())
                        .with_bytes(payload.ciphertext),
                );
            } else {
                let mut enc = Node::new("enc")
                    .with_attr("v", "2")
                    .with_attr("type", "skmsg")
                    .with_bytes(group_cipher.ciphertext);
                for (key, value) in extra_attrs.iter() {
                    enc.attrs.insert(key.clone(), value.clone());
                }
                content_nodes.push(enc);
                // devices were marked notified only after their distribution
                // node was placed above
                let memory_bytes =
                    serde_json::to_vec(&notified).map_err(|_| RelayError::Storage)?;
                let mut update = HashMap::new();
                update.insert(memory_key, memory_bytes);
                self.keys.set(SENDER_KEY_MEMORY, update).await?;
            }
        } else if let Some(retry) = &options.retry {
            let patched = self.patch_uniform(&message, "retry")?;
            let bytes = patched.to_bytes()?;
            let payload = self.crypto.encrypt_message(&retry.jid, &bytes).await?;
            content_nodes.push(
                Node::new("enc")
                    .with_attr("v", "2")
                    .with_attr("type", payload.enc_type.as_str())
                    .with_attr("count", retry.count.to_string())
                    .with_bytes(payload.ciphertext),
            );
        } else {
            let own = match (&me_lid, is_lid_dest) {
                (Some(lid), true) => lid.clone(),
                _ => me.clone(),
            };
            let is_peer = attrs.get("category").map(String::as_str) == Some("peer");
            let devices: Vec<DeviceEntry> = if is_peer {
                vec![DeviceEntry::from_jid(&destination)]
            } else {
                let enumeration = [own.normalized(), destination.clone()];
                let resolved = self.resolver.resolve(&enumeration, use_cache, false).await?;
                debug!(count = resolved.len(), "device enumeration complete");
                resolved
            };

            let device_sent = MessageContent::device_sent(&destination, message.clone());
            let mut me_recipients: Vec<Jid> = Vec::new();
            let mut other_recipients: Vec<Jid> = Vec::new();
            let mut all_recipients: Vec<Jid> = Vec::new();
            for device in devices {
                let device_jid = device.jid;
                let exact_sender = device_jid.same_device(&me)
                    || me_lid.as_ref().map_or(false, |lid| device_jid.same_device(lid));
                if exact_sender {
                    debug!(jid = %device_jid, "skipping exact sender device");
                    continue;
                }
                let is_me = device_jid.user == me.user
                    || me_lid.as_ref().map_or(false, |lid| device_jid.user == lid.user);
                if is_me {
                    me_recipients.push(device_jid.clone());
                } else {
                    other_recipients.push(device_jid.clone());
                }
                all_recipients.push(device_jid);
            }

            include_device_identity |= self.sessions.assert_sessions(&all_recipients).await?;
            let me_nodes = self
                .encryptor
                .encrypt_for(&me_recipients, &device_sent, &extra_attrs, None)
                .await?;
            let other_nodes = self
                .encryptor
                .encrypt_for(&other_recipients, &message, &extra_attrs, Some(&device_sent))
                .await?;
            include_device_identity |= me_nodes.used_new_session || other_nodes.used_new_session;
            participants.extend(me_nodes.nodes);
            participants.extend(other_nodes.nodes);
            if !all_recipients.is_empty() {
                attrs.insert("phash".to_string(), participant_hash(&all_recipients));
            }
        }

        let is_peer = attrs.get("category").map(String::as_str) == Some("peer");
        if !participants.is_empty() {
            if is_peer {
                // a peer message carries its single ciphertext unwrapped
                if let Some(first) = participants.into_iter().next() {
                    if let Some(enc) = first.child("enc") {
                        content_nodes.push(enc.clone());
                    }
                }
            } else {
                let mut list = Node::new("participants");
                for participant in participants {
                    list.push(participant);
                }
                content_nodes.push(list);
            }
        }

        let mut stanza = Node::new("message")
            .with_attr("id", msg_id.clone())
            .with_attr("to", destination.encode())
            .with_attr("type", message_type(&message).as_str());
        for (key, value) in attrs.iter() {
            stanza.attrs.insert(key.clone(), value.clone());
        }
        // a retry re-addresses the stanza at the failed device
        if let Some(retry) = &options.retry {
            if is_group {
                stanza
                    .attrs
                    .insert("participant".to_string(), retry.jid.encode());
            } else if retry.jid.user == me.user
                || me_lid.as_ref().map_or(false, |lid| retry.jid.user == lid.user)
            {
                stanza.attrs.insert("to".to_string(), retry.jid.encode());
                stanza
                    .attrs
                    .insert("recipient".to_string(), destination.encode());
            } else {
                stanza.attrs.insert("to".to_string(), retry.jid.encode());
            }
        }
        for node in content_nodes {
            stanza.push(node);
        }
        if include_device_identity {
            debug!(to = %destination, "adding device identity");
            stanza.push(
                Node::new("device-identity").with_bytes(self.creds.signed_device_identity.clone()),
            );
        }
        if !options.additional_nodes.is_empty() {
            for node in options.additional_nodes {
                stanza.push(node);
            }
        } else if (destination.is_group() || destination.server == Server::Lid)
            && wants_interactive_companion(&message)
        {
            stanza.push(interactive_companion());
        }
        if let Some((kind, args)) = button_companion {
            let mut button = Node::new(kind.as_str());
            button.attrs = args;
            let mut biz = Node::new("biz");
            biz.push(button);
            stanza.push(biz);
            debug!(to = %destination, "adding business node");
        }

        debug!(%msg_id, "sending message stanza");
        self.transport.send_node(stanza).await?;
        Ok(msg_id)
    }

    /// Self-addressed relay used for peer data operations (history sync
    /// requests and the like). No device fan-out happens for these.
    pub async fn send_peer_data_operation(&self, payload: Vec<u8>) -> Result<String, RelayError> {
        if self.creds.me.user.is_empty() {
            return Err(RelayError::Precondition("not authenticated".to_string()));
        }
        let message = MessageContent::PeerDataOperation { payload };
        let mut options = RelayOptions::default();
        options
            .additional_attributes
            .insert("category".to_string(), "peer".to_string());
        options
            .additional_attributes
            .insert("push_priority".to_string(), "high_force".to_string());
        self.relay_message(&self.creds.me.normalized(), message, options)
            .await
    }

    fn patch_uniform(
        &self,
        message: &MessageContent,
        target: &str,
    ) -> Result<MessageContent, RelayError> {
        match self.encryptor.patch(message, &[]) {
            PatchedBatch::Uniform(patched) => Ok(patched),
            PatchedBatch::PerRecipient(_) => Err(RelayError::Precondition(format!(
                "per-device patching is not supported for {target} targets"
            ))),
        }
    }

    pub(crate) fn generate_message_id(&self) -> String {
        let mut entropy = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut entropy);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.clock.now_ms().to_be_bytes());
        hasher.update(self.creds.me.user.as_bytes());
        hasher.update(&entropy);
        let digest = hasher.finalize();
        format!("3EB0{}", hex::encode_upper(&digest.as_bytes()[..9]))
    }
}

/// Hash of the final recipient address list, attached for integrity/audit.
pub fn participant_hash(jids: &[Jid]) -> String {
    let sorted: BTreeSet<String> = jids.iter().map(Jid::encode).collect();
    let mut hasher = blake3::Hasher::new();
    for jid in sorted.iter() {
        hasher.update(jid.as_bytes());
        hasher.update(&[0]);
    }
    let digest = hasher.finalize();
    format!("2:{}", STANDARD.encode(&digest.as_bytes()[..6]))
}

fn interactive_companion() -> Node {
    let mut native_flow = Node::new("native_flow");
    native_flow.attrs.insert("name".to_string(), "quick_reply".to_string());
    let mut interactive = Node::new("interactive")
        .with_attr("type", "native_flow")
        .with_attr("v", "1");
    interactive.push(native_flow);
    let mut biz = Node::new("biz");
    biz.push(interactive);
    biz
}
