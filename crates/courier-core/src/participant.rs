use crate::config::SelfSubstitutionPolicy;
use crate::error::RelayError;
use crate::message::MessageContent;
use crate::repo::{CryptoRepository, EncType};
use courier_wire::{Jid, Node};
use futures_util::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Result of the pre-send content transform: either one payload shared by
/// every device or a per-device variant list.
pub enum PatchedBatch {
    Uniform(MessageContent),
    PerRecipient(Vec<(Jid, MessageContent)>),
}

pub type MessagePatcher = dyn Fn(&MessageContent, &[Jid]) -> PatchedBatch + Send + Sync;

/// Registry of per-address locks. Encryption against one device address is
/// strictly serialized; interleaved ratchet-advancing encrypts corrupt
/// session state. Idle locks are reclaimed on the next acquire.
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ParticipantNodes {
    pub nodes: Vec<Node>,
    pub used_new_session: bool,
}

/// Produces one addressed ciphertext node per target device for a single
/// logical message.
pub struct RecipientEncryptor {
    crypto: Arc<dyn CryptoRepository>,
    locks: Arc<KeyedMutex>,
    me: Jid,
    me_lid: Option<Jid>,
    self_substitution: SelfSubstitutionPolicy,
    patcher: Option<Arc<MessagePatcher>>,
}

impl RecipientEncryptor {
    pub fn new(
        crypto: Arc<dyn CryptoRepository>,
        locks: Arc<KeyedMutex>,
        me: Jid,
        me_lid: Option<Jid>,
        self_substitution: SelfSubstitutionPolicy,
        patcher: Option<Arc<MessagePatcher>>,
    ) -> Self {
        Self {
            crypto,
            locks,
            me,
            me_lid,
            self_substitution,
            patcher,
        }
    }

    pub fn patch(&self, message: &MessageContent, jids: &[Jid]) -> PatchedBatch {
        match &self.patcher {
            Some(patcher) => patcher(message, jids),
            None => PatchedBatch::Uniform(message.clone()),
        }
    }

    pub async fn encrypt_for(
        &self,
        jids: &[Jid],
        message: &MessageContent,
        extra_attrs: &HashMap<String, String>,
        own_substitute: Option<&MessageContent>,
    ) -> Result<ParticipantNodes, RelayError> {
        if jids.is_empty() {
            return Ok(ParticipantNodes {
                nodes: Vec::new(),
                used_new_session: false,
            });
        }
        let batch = match self.patch(message, jids) {
            PatchedBatch::Uniform(patched) => jids
                .iter()
                .map(|jid| (jid.clone(), patched.clone()))
                .collect::<Vec<_>>(),
            PatchedBatch::PerRecipient(variants) => variants,
        };

        let substitute_allowed = if own_substitute.is_some()
            && self.me.user.is_empty()
            && self.me_lid.is_none()
        {
            if self.self_substitution == SelfSubstitutionPolicy::Fail {
                return Err(RelayError::Precondition(
                    "no self identity for device-sent substitution".to_string(),
                ));
            }
            false
        } else {
            true
        };

        let mut tasks = Vec::new();
        for (jid, patched) in batch {
            if jid.user.is_empty() {
                // malformed resolver output must not abort the batch
                continue;
            }
            let mut to_encrypt = patched;
            if let Some(substitute) = own_substitute {
                if substitute_allowed && self.is_own_user(&jid) && !self.is_exact_sender_device(&jid) {
                    debug!(jid = %jid, "using device-sent wrapper for own device");
                    to_encrypt = substitute.clone();
                }
            }
            let bytes = to_encrypt.to_bytes()?;
            let crypto = self.crypto.clone();
            let locks = self.locks.clone();
            let attrs = extra_attrs.clone();
            tasks.push(async move {
                let address = crypto.signal_address(&jid);
                let _guard = locks.acquire(&address).await;
                let payload = crypto.encrypt_message(&jid, &bytes).await?;
                let mut enc = Node::new("enc")
                    .with_attr("v", "2")
                    .with_attr("type", payload.enc_type.as_str())
                    .with_bytes(payload.ciphertext);
                for (key, value) in attrs {
                    enc.attrs.insert(key, value);
                }
                let mut to = Node::new("to").with_attr("jid", jid.encode());
                to.push(enc);
                Ok::<(Node, bool), RelayError>((to, payload.enc_type == EncType::PreKey))
            });
        }

        let results = try_join_all(tasks).await?;
        let mut nodes = Vec::new();
        let mut used_new_session = false;
        for (node, fresh) in results {
            used_new_session |= fresh;
            nodes.push(node);
        }
        Ok(ParticipantNodes {
            nodes,
            used_new_session,
        })
    }

    fn is_own_user(&self, jid: &Jid) -> bool {
        if jid.user == self.me.user {
            return true;
        }
        match &self.me_lid {
            Some(lid) => jid.user == lid.user,
            None => false,
        }
    }

    fn is_exact_sender_device(&self, jid: &Jid) -> bool {
        if jid.same_device(&self.me) {
            return true;
        }
        match &self.me_lid {
            Some(lid) => jid.same_device(lid),
            None => false,
        }
    }
}
