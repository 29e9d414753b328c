use crate::error::RelayError;
use crate::message::MessageContent;
use crate::MessageRelay;
use courier_wire::{Jid, Node, Server};
use rand::RngCore;
use std::collections::HashMap;
use tracing::debug;

const CALL_CAPABILITIES: [u8; 6] = [1, 4, 255, 131, 207, 4];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallOffer {
    pub id: String,
    pub to: Jid,
}

impl MessageRelay {
    /// Builds and sends a call offer: resolves the callee's devices,
    /// asserts sessions, and encrypts the call key once per device.
    pub async fn offer_call(&self, to: &Jid, video: bool) -> Result<CallOffer, RelayError> {
        let mut call_id_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut call_id_bytes);
        let call_id = hex::encode_upper(call_id_bytes);

        let mut offer_content = Vec::new();
        offer_content.push(
            Node::new("audio")
                .with_attr("enc", "opus")
                .with_attr("rate", "16000"),
        );
        offer_content.push(
            Node::new("audio")
                .with_attr("enc", "opus")
                .with_attr("rate", "8000"),
        );
        if video {
            offer_content.push(
                Node::new("video")
                    .with_attr("enc", "vp8")
                    .with_attr("dec", "vp8")
                    .with_attr("orientation", "0")
                    .with_attr("screen_width", "1920")
                    .with_attr("screen_height", "1080")
                    .with_attr("device_orientation", "0"),
            );
        }
        offer_content.push(Node::new("net").with_attr("medium", "3"));
        offer_content.push(
            Node::new("capability")
                .with_attr("ver", "1")
                .with_bytes(CALL_CAPABILITIES.to_vec()),
        );
        offer_content.push(Node::new("encopt").with_attr("keygen", "2"));

        let mut call_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut call_key);

        let resolved = self.resolver.resolve(&[to.clone()], true, false).await?;
        let devices: Vec<Jid> = resolved
            .iter()
            .map(|d| Jid::new(d.user.clone(), Server::Pn).with_device(d.device))
            .collect();
        let fetched = self.sessions.assert_sessions(&devices).await?;

        let mut extra_attrs = HashMap::new();
        extra_attrs.insert("count".to_string(), "0".to_string());
        let destinations = self
            .encryptor
            .encrypt_for(
                &devices,
                &MessageContent::CallKey { key: call_key },
                &extra_attrs,
                None,
            )
            .await?;

        let mut destination = Node::new("destination");
        for node in destinations.nodes {
            destination.push(node);
        }
        offer_content.push(destination);
        if fetched || destinations.used_new_session {
            offer_content.push(
                Node::new("device-identity")
                    .with_bytes(self.creds.signed_device_identity.clone()),
            );
        }

        let mut offer = Node::new("offer")
            .with_attr("call-id", call_id.clone())
            .with_attr("call-creator", self.creds.me.encode());
        for node in offer_content {
            offer.push(node);
        }
        let mut stanza = Node::new("call")
            .with_attr("id", self.generate_message_id())
            .with_attr("to", to.encode());
        stanza.push(offer);

        debug!(%call_id, to = %to, "sending call offer");
        self.transport.query(stanza).await?;
        Ok(CallOffer {
            id: call_id,
            to: to.clone(),
        })
    }
}
