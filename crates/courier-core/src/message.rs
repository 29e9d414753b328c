use crate::error::RelayError;
use courier_wire::Jid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ListType {
    SingleSelect,
    ProductList,
}

impl ListType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListType::SingleSelect => "single_select",
            ListType::ProductList => "product_list",
        }
    }
}

/// Closed union over outbound message content. Classification below is a
/// total function over this set; adding a variant forces every match to be
/// revisited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MessageContent {
    Text {
        body: String,
    },
    Image {
        media_key: Vec<u8>,
        direct_path: Option<String>,
    },
    Video {
        media_key: Vec<u8>,
        direct_path: Option<String>,
        gif_playback: bool,
    },
    Audio {
        media_key: Vec<u8>,
        voice_note: bool,
    },
    Document {
        media_key: Vec<u8>,
        direct_path: Option<String>,
    },
    Sticker {
        media_key: Vec<u8>,
    },
    Contact {
        vcard: String,
    },
    ContactsArray {
        vcards: Vec<String>,
    },
    LiveLocation {
        latitude: f64,
        longitude: f64,
    },
    List {
        title: String,
        list_type: Option<ListType>,
    },
    ListResponse {
        title: String,
    },
    Buttons {
        body: String,
    },
    ButtonsResponse {
        selected_id: String,
    },
    Template {
        body: String,
    },
    Interactive {
        body: String,
    },
    InteractiveResponse {
        body: String,
    },
    Order {
        order_id: String,
    },
    Product {
        product_id: String,
    },
    GroupInvite {
        code: String,
    },
    Poll {
        name: String,
        options: Vec<String>,
    },
    Event {
        name: String,
    },
    PinInChat {
        message_id: String,
    },
    ViewOnce(Box<MessageContent>),
    Ephemeral(Box<MessageContent>),
    /// Wrapper sent to the sender's own other devices so they observe what
    /// was sent elsewhere.
    DeviceSent {
        destination: String,
        message: Box<MessageContent>,
    },
    /// Carries the group fan-out key to a device that does not have it.
    SenderKeyDistribution {
        group: String,
        payload: Vec<u8>,
    },
    CallKey {
        key: Vec<u8>,
    },
    PeerDataOperation {
        payload: Vec<u8>,
    },
}

impl MessageContent {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayError> {
        serde_json::to_vec(self).map_err(|_| RelayError::Crypto)
    }

    pub fn device_sent(destination: &Jid, message: MessageContent) -> MessageContent {
        MessageContent::DeviceSent {
            destination: destination.encode(),
            message: Box::new(message),
        }
    }
}

/// Unwraps view-once / ephemeral / device-sent layers down to the inner
/// content.
pub fn normalized(content: &MessageContent) -> &MessageContent {
    match content {
        MessageContent::ViewOnce(inner) | MessageContent::Ephemeral(inner) => normalized(inner),
        MessageContent::DeviceSent { message, .. } => normalized(message),
        other => other,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentClass {
    Poll,
    Event,
    Media,
    Text,
}

impl ContentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentClass::Poll => "poll",
            ContentClass::Event => "event",
            ContentClass::Media => "media",
            ContentClass::Text => "text",
        }
    }
}

pub fn message_type(content: &MessageContent) -> ContentClass {
    match normalized(content) {
        MessageContent::Poll { .. } => ContentClass::Poll,
        MessageContent::Event { .. } => ContentClass::Event,
        other => {
            if media_type(other).is_some() {
                ContentClass::Media
            } else {
                ContentClass::Text
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Gif,
    Video,
    VoiceNote,
    Audio,
    Vcard,
    Document,
    ContactArray,
    LiveLocation,
    Sticker,
    List,
    ListResponse,
    ButtonsResponse,
    Order,
    Product,
    NativeFlowResponse,
    Url,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Gif => "gif",
            MediaKind::Video => "video",
            MediaKind::VoiceNote => "ptt",
            MediaKind::Audio => "audio",
            MediaKind::Vcard => "vcard",
            MediaKind::Document => "document",
            MediaKind::ContactArray => "contact_array",
            MediaKind::LiveLocation => "livelocation",
            MediaKind::Sticker => "sticker",
            MediaKind::List => "list",
            MediaKind::ListResponse => "list_response",
            MediaKind::ButtonsResponse => "buttons_response",
            MediaKind::Order => "order",
            MediaKind::Product => "product",
            MediaKind::NativeFlowResponse => "native_flow_response",
            MediaKind::Url => "url",
        }
    }
}

pub fn media_type(content: &MessageContent) -> Option<MediaKind> {
    match normalized(content) {
        MessageContent::Image { .. } => Some(MediaKind::Image),
        MessageContent::Video { gif_playback, .. } => Some(if *gif_playback {
            MediaKind::Gif
        } else {
            MediaKind::Video
        }),
        MessageContent::Audio { voice_note, .. } => Some(if *voice_note {
            MediaKind::VoiceNote
        } else {
            MediaKind::Audio
        }),
        MessageContent::Contact { .. } => Some(MediaKind::Vcard),
        MessageContent::Document { .. } => Some(MediaKind::Document),
        MessageContent::ContactsArray { .. } => Some(MediaKind::ContactArray),
        MessageContent::LiveLocation { .. } => Some(MediaKind::LiveLocation),
        MessageContent::Sticker { .. } => Some(MediaKind::Sticker),
        MessageContent::List { .. } => Some(MediaKind::List),
        MessageContent::ListResponse { .. } => Some(MediaKind::ListResponse),
        MessageContent::ButtonsResponse { .. } => Some(MediaKind::ButtonsResponse),
        MessageContent::Order { .. } => Some(MediaKind::Order),
        MessageContent::Product { .. } => Some(MediaKind::Product),
        MessageContent::InteractiveResponse { .. } => Some(MediaKind::NativeFlowResponse),
        MessageContent::GroupInvite { .. } => Some(MediaKind::Url),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonKind {
    Buttons,
    ButtonsResponse,
    InteractiveResponse,
    List,
    ListResponse,
}

impl ButtonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ButtonKind::Buttons => "buttons",
            ButtonKind::ButtonsResponse => "buttons_response",
            ButtonKind::InteractiveResponse => "interactive_response",
            ButtonKind::List => "list",
            ButtonKind::ListResponse => "list_response",
        }
    }
}

pub fn button_type(content: &MessageContent) -> Option<ButtonKind> {
    match normalized(content) {
        MessageContent::Buttons { .. } => Some(ButtonKind::Buttons),
        MessageContent::ButtonsResponse { .. } => Some(ButtonKind::ButtonsResponse),
        MessageContent::InteractiveResponse { .. } => Some(ButtonKind::InteractiveResponse),
        MessageContent::List { .. } => Some(ButtonKind::List),
        MessageContent::ListResponse { .. } => Some(ButtonKind::ListResponse),
        _ => None,
    }
}

/// Attributes for the button companion node. A list message without a list
/// type is a fatal construction error, never retried.
pub fn button_args(content: &MessageContent) -> Result<HashMap<String, String>, RelayError> {
    match normalized(content) {
        MessageContent::List { list_type, .. } => {
            let list_type = list_type
                .as_ref()
                .ok_or_else(|| RelayError::Precondition("expected list type inside message".to_string()))?;
            let mut attrs = HashMap::new();
            attrs.insert("v".to_string(), "2".to_string());
            attrs.insert("type".to_string(), list_type.as_str().to_string());
            Ok(attrs)
        }
        _ => Ok(HashMap::new()),
    }
}

/// Rich-content kinds that get the interactive-compatibility companion
/// node when sent to a group or privacy-id destination.
pub fn wants_interactive_companion(content: &MessageContent) -> bool {
    matches!(
        content,
        MessageContent::ViewOnce(_)
            | MessageContent::Ephemeral(_)
            | MessageContent::Template { .. }
            | MessageContent::Interactive { .. }
            | MessageContent::Buttons { .. }
    )
}
