use super::{build, group, pn};
use crate::error::RelayError;
use crate::receipts::{MessageKey, ReceiptKind};

#[tokio::test]
async fn receipt_without_ids_is_rejected() {
    let h = build();
    let err = h
        .relay
        .send_receipt(&pn("1555000111"), None, &[], Some(ReceiptKind::Read))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Precondition(_)));
    assert_eq!(h.transport.sent_count().await, 0);
}

#[tokio::test]
async fn read_receipt_carries_a_timestamp() {
    let h = build();
    h.relay
        .send_receipt(
            &pn("1555000111"),
            None,
            &["MSG1".to_string()],
            Some(ReceiptKind::Read),
        )
        .await
        .unwrap();

    let node = h.transport.last_sent().await.unwrap();
    assert_eq!(node.tag, "receipt");
    assert_eq!(node.attr("id"), Some("MSG1"));
    assert_eq!(node.attr("to"), Some("1555000111@s.whatsapp.net"));
    assert_eq!(node.attr("type"), Some("read"));
    assert_eq!(node.attr("t"), Some("1700000000"));
    assert!(node.child("list").is_none());
}

#[tokio::test]
async fn delivery_receipt_has_no_timestamp_or_type() {
    let h = build();
    h.relay
        .send_receipt(&pn("1555000111"), None, &["MSG1".to_string()], None)
        .await
        .unwrap();

    let node = h.transport.last_sent().await.unwrap();
    assert!(node.attr("t").is_none());
    assert!(node.attr("type").is_none());
}

#[tokio::test]
async fn extra_ids_ride_in_the_list_child() {
    let h = build();
    let ids = vec!["A".to_string(), "B".to_string(), "C".to_string()];
    h.relay
        .send_receipt(&pn("1555000111"), None, &ids, Some(ReceiptKind::Read))
        .await
        .unwrap();

    let node = h.transport.last_sent().await.unwrap();
    assert_eq!(node.attr("id"), Some("A"));
    let items = node.child("list").unwrap().children("item");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].attr("id"), Some("B"));
    assert_eq!(items[1].attr("id"), Some("C"));
}

#[tokio::test]
async fn group_receipt_names_the_participant() {
    let h = build();
    let sender = pn("1555000200");
    h.relay
        .send_receipt(
            &group("120000000000"),
            Some(&sender),
            &["MSG1".to_string()],
            Some(ReceiptKind::Retry),
        )
        .await
        .unwrap();

    let node = h.transport.last_sent().await.unwrap();
    assert_eq!(node.attr("to"), Some("120000000000@g.us"));
    assert_eq!(node.attr("participant"), Some("1555000200@s.whatsapp.net"));
    assert_eq!(node.attr("type"), Some("retry"));
}

#[tokio::test]
async fn sender_receipt_flips_recipient_and_to() {
    let h = build();
    let chat = pn("1555000111");
    let participant = pn("1555000200").with_device(1);
    h.relay
        .send_receipt(
            &chat,
            Some(&participant),
            &["MSG1".to_string()],
            Some(ReceiptKind::Sender),
        )
        .await
        .unwrap();

    let node = h.transport.last_sent().await.unwrap();
    assert_eq!(node.attr("recipient"), Some("1555000111@s.whatsapp.net"));
    assert_eq!(node.attr("to"), Some("1555000200:1@s.whatsapp.net"));
    assert!(node.attr("participant").is_none());
}

#[tokio::test]
async fn receipts_aggregate_per_chat_and_skip_own_messages() {
    let h = build();
    let chat = pn("1555000111");
    let keys = vec![
        MessageKey {
            remote_jid: chat.clone(),
            participant: None,
            id: "A".to_string(),
            from_me: false,
        },
        MessageKey {
            remote_jid: chat.clone(),
            participant: None,
            id: "B".to_string(),
            from_me: false,
        },
        MessageKey {
            remote_jid: chat.clone(),
            participant: None,
            id: "MINE".to_string(),
            from_me: true,
        },
    ];

    h.relay
        .send_receipts(&keys, Some(ReceiptKind::Read))
        .await
        .unwrap();

    assert_eq!(h.transport.sent_count().await, 1);
    let node = h.transport.last_sent().await.unwrap();
    let mut ids = vec![node.attr("id").unwrap().to_string()];
    if let Some(list) = node.child("list") {
        ids.extend(
            list.children("item")
                .iter()
                .filter_map(|i| i.attr("id"))
                .map(str::to_string),
        );
    }
    ids.sort();
    assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
}
