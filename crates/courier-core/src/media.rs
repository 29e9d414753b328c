use crate::clock::Clock;
use crate::error::RelayError;
use crate::event::{MediaRetryResult, RelayEvent};
use crate::repo::StanzaTransport;
use crate::MessageRelay;
use courier_wire::{Jid, Node, Server};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaHost {
    pub hostname: String,
    pub max_content_length_bytes: u64,
}

/// Upload-endpoint credential lease, refreshed lazily once stale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConn {
    pub hosts: Vec<MediaHost>,
    pub auth: String,
    pub ttl_secs: u64,
    pub fetched_at_ms: u64,
}

impl MediaConn {
    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.fetched_at_ms) > self.ttl_secs.saturating_mul(1000)
    }
}

pub struct MediaGateway {
    transport: Arc<dyn StanzaTransport>,
    clock: Arc<dyn Clock>,
    // the slot lock is held across the fetch so concurrent refreshes share
    // one in-flight request
    conn: Mutex<Option<MediaConn>>,
}

impl MediaGateway {
    pub fn new(transport: Arc<dyn StanzaTransport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            conn: Mutex::new(None),
        }
    }

    pub async fn refresh(&self, force: bool) -> Result<MediaConn, RelayError> {
        let mut slot = self.conn.lock().await;
        let now = self.clock.now_ms();
        if let Some(conn) = slot.as_ref() {
            if !force && !conn.is_stale(now) {
                return Ok(conn.clone());
            }
        }
        let mut iq = Node::new("iq")
            .with_attr("type", "set")
            .with_attr("xmlns", "w:m")
            .with_attr("to", Server::Pn.as_str());
        iq.push(Node::new("media_conn"));
        let response = self.transport.query(iq).await?;
        let conn_node = response
            .child("media_conn")
            .ok_or_else(|| RelayError::Transport("missing media_conn".to_string()))?;
        let auth = conn_node
            .attr("auth")
            .ok_or_else(|| RelayError::Transport("missing media auth".to_string()))?
            .to_string();
        let ttl_secs = conn_node
            .attr("ttl")
            .and_then(|ttl| ttl.parse::<u64>().ok())
            .ok_or_else(|| RelayError::Transport("missing media ttl".to_string()))?;
        let hosts = conn_node
            .children("host")
            .into_iter()
            .filter_map(|host| {
                Some(MediaHost {
                    hostname: host.attr("hostname")?.to_string(),
                    max_content_length_bytes: host
                        .attr("maxContentLengthBytes")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                })
            })
            .collect();
        let conn = MediaConn {
            hosts,
            auth,
            ttl_secs,
            fetched_at_ms: now,
        };
        debug!("fetched media conn");
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

/// Deterministic retry-request token derived from the media key and the
/// message id; the receiving device recomputes it to authenticate the
/// retry.
pub fn media_retry_token(media_key: &[u8], message_id: &str) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"courier:media-retry:v1");
    hasher.update(media_key);
    hasher.update(message_id.as_bytes());
    hasher.finalize().as_bytes().to_vec()
}

impl MessageRelay {
    pub async fn refresh_media_conn(&self, force: bool) -> Result<MediaConn, RelayError> {
        self.media.refresh(force).await
    }

    /// Requests a re-upload of expired media and waits for the correlated
    /// media-update event. A terminal non-success result code from the
    /// remote device surfaces as `RelayError::MediaUpload`.
    pub async fn update_media_message(
        &self,
        message_id: &str,
        chat: &Jid,
        media_key: &[u8],
    ) -> Result<Option<String>, RelayError> {
        let mut updates = self.events.subscribe();
        let token = media_retry_token(media_key, message_id);
        let mut node = Node::new("receipt")
            .with_attr("id", message_id)
            .with_attr("to", chat.encode())
            .with_attr("type", "server-error");
        node.push(Node::new("encrypt").with_bytes(token));
        self.transport.send_node(node).await?;

        use tokio::sync::broadcast::error::RecvError;
        loop {
            let event = match updates.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    return Err(RelayError::Transport("media update stream closed".to_string()))
                }
            };
            let RelayEvent::MediaUpdate { message_id: id, result } = event;
            if id != message_id {
                continue;
            }
            return match result {
                MediaRetryResult::Success { direct_path } => {
                    debug!(%message_id, "media update successful");
                    Ok(direct_path)
                }
                MediaRetryResult::Failure { code } => Err(RelayError::MediaUpload { code }),
            };
        }
    }
}
