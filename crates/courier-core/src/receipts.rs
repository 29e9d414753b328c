use crate::clock::unix_seconds;
use crate::error::RelayError;
use crate::MessageRelay;
use courier_wire::{Jid, Node};
use std::collections::HashMap;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptKind {
    Read,
    ReadSelf,
    Sender,
    Played,
    Retry,
}

impl ReceiptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptKind::Read => "read",
            ReceiptKind::ReadSelf => "read-self",
            ReceiptKind::Sender => "sender",
            ReceiptKind::Played => "played",
            ReceiptKind::Retry => "retry",
        }
    }
}

/// Reference to a delivered message, used to aggregate receipts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageKey {
    pub remote_jid: Jid,
    pub participant: Option<Jid>,
    pub id: String,
    pub from_me: bool,
}

impl MessageRelay {
    pub async fn send_receipt(
        &self,
        jid: &Jid,
        participant: Option<&Jid>,
        message_ids: &[String],
        kind: Option<ReceiptKind>,
    ) -> Result<(), RelayError> {
        let first = message_ids
            .first()
            .ok_or_else(|| RelayError::Precondition("missing ids in receipt".to_string()))?;
        let mut node = Node::new("receipt").with_attr("id", first.clone());
        let is_read = matches!(kind, Some(ReceiptKind::Read) | Some(ReceiptKind::ReadSelf));
        if is_read {
            node.attrs
                .insert("t".to_string(), unix_seconds(self.clock.as_ref()).to_string());
        }
        match (kind, participant) {
            (Some(ReceiptKind::Sender), Some(participant)) if jid.is_pn() || jid.is_lid() => {
                node.attrs.insert("recipient".to_string(), jid.encode());
                node.attrs.insert("to".to_string(), participant.encode());
            }
            (_, participant) => {
                node.attrs.insert("to".to_string(), jid.encode());
                if let Some(participant) = participant {
                    node.attrs
                        .insert("participant".to_string(), participant.encode());
                }
            }
        }
        if let Some(kind) = kind {
            node.attrs.insert("type".to_string(), kind.as_str().to_string());
        }
        if message_ids.len() > 1 {
            let mut list = Node::new("list");
            for id in &message_ids[1..] {
                list.push(Node::new("item").with_attr("id", id.clone()));
            }
            node.push(list);
        }
        debug!(count = message_ids.len(), to = %jid, "sending receipt for messages");
        self.transport.send_node(node).await
    }

    /// Aggregates keys not sent by us into one receipt per (chat,
    /// participant) pair.
    pub async fn send_receipts(
        &self,
        keys: &[MessageKey],
        kind: Option<ReceiptKind>,
    ) -> Result<(), RelayError> {
        let mut grouped: HashMap<(String, Option<String>), (Jid, Option<Jid>, Vec<String>)> =
            HashMap::new();
        for key in keys {
            if key.from_me {
                continue;
            }
            let entry = grouped
                .entry((
                    key.remote_jid.encode(),
                    key.participant.as_ref().map(Jid::encode),
                ))
                .or_insert_with(|| (key.remote_jid.clone(), key.participant.clone(), Vec::new()));
            entry.2.push(key.id.clone());
        }
        for (_, (jid, participant, ids)) in grouped {
            self.send_receipt(&jid, participant.as_ref(), &ids, kind).await?;
        }
        Ok(())
    }
}
