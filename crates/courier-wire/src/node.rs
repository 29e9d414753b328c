use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One element of the outbound stanza tree. Wire-level binary encoding of
/// this tree lives in the transport, not here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub tag: String,
    pub attrs: HashMap<String, String>,
    pub content: NodeContent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeContent {
    None,
    Nodes(Vec<Node>),
    Bytes(Vec<u8>),
}

impl Default for NodeContent {
    fn default() -> Self {
        NodeContent::None
    }
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: HashMap::new(),
            content: NodeContent::None,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.content = NodeContent::Bytes(bytes);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn push(&mut self, child: Node) {
        match &mut self.content {
            NodeContent::Nodes(children) => children.push(child),
            _ => self.content = NodeContent::Nodes(vec![child]),
        }
    }

    pub fn child(&self, tag: &str) -> Option<&Node> {
        match &self.content {
            NodeContent::Nodes(children) => children.iter().find(|c| c.tag == tag),
            _ => None,
        }
    }

    pub fn children(&self, tag: &str) -> Vec<&Node> {
        match &self.content {
            NodeContent::Nodes(children) => children.iter().filter(|c| c.tag == tag).collect(),
            _ => Vec::new(),
        }
    }

    pub fn all_children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Nodes(children) => children.as_slice(),
            _ => &[],
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes.as_slice()),
            _ => None,
        }
    }
}
