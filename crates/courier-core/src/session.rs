use crate::cache::TtlCache;
use crate::error::RelayError;
use crate::repo::{CryptoRepository, StanzaTransport};
use courier_wire::{Jid, Node, Server};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Guarantees a pairwise session exists for each target device before
/// encryption is attempted. Devices without a confirmed session are batched
/// into exactly one key-bundle fetch per call.
pub struct SessionAssurance {
    crypto: Arc<dyn CryptoRepository>,
    transport: Arc<dyn StanzaTransport>,
    cache: TtlCache<String, bool>,
}

impl SessionAssurance {
    pub fn new(
        crypto: Arc<dyn CryptoRepository>,
        transport: Arc<dyn StanzaTransport>,
        cache: TtlCache<String, bool>,
    ) -> Self {
        Self {
            crypto,
            transport,
            cache,
        }
    }

    /// Returns whether any network fetch occurred; upstream attaches the
    /// signed device-identity block when a new session was just set up.
    pub async fn assert_sessions(&self, jids: &[Jid]) -> Result<bool, RelayError> {
        let mut seen = HashSet::new();
        let mut requiring_fetch: Vec<Jid> = Vec::new();
        for jid in jids {
            let address = self.crypto.signal_address(jid);
            if !seen.insert(address.clone()) {
                continue;
            }
            match self.cache.get(&address).await {
                // only a confirmed-existing session short-circuits
                Some(true) => continue,
                Some(false) => requiring_fetch.push(jid.clone()),
                None => {
                    let exists = self.crypto.validate_session(jid).await?;
                    self.cache.set(address, exists).await;
                    if !exists {
                        requiring_fetch.push(jid.clone());
                    }
                }
            }
        }
        if requiring_fetch.is_empty() {
            return Ok(false);
        }

        // the fetch goes out in privacy-id form wherever a mapping exists
        let pn_jids: Vec<Jid> = requiring_fetch
            .iter()
            .filter(|j| j.is_pn())
            .cloned()
            .collect();
        let mapped: HashMap<String, Jid> = self
            .crypto
            .lids_for_pns(&pn_jids)
            .await?
            .into_iter()
            .map(|(pn, lid)| (pn.user, lid))
            .collect();
        let wire_jids: Vec<Jid> = requiring_fetch
            .iter()
            .map(|jid| {
                if jid.is_pn() {
                    match mapped.get(&jid.user) {
                        Some(lid) => lid.normalized().with_device(jid.device_index()),
                        None => jid.clone(),
                    }
                } else {
                    jid.clone()
                }
            })
            .collect();
        debug!(count = wire_jids.len(), "fetching key bundles");

        let mut key = Node::new("key");
        for jid in wire_jids.iter() {
            key.push(Node::new("user").with_attr("jid", jid.encode()));
        }
        let mut iq = Node::new("iq")
            .with_attr("xmlns", "encrypt")
            .with_attr("type", "get")
            .with_attr("to", Server::Pn.as_str());
        iq.push(key);

        let bundle = self.transport.query(iq).await?;
        self.crypto.inject_sessions(&bundle).await?;
        for jid in wire_jids.iter() {
            self.cache.set(self.crypto.signal_address(jid), true).await;
        }
        Ok(true)
    }
}
