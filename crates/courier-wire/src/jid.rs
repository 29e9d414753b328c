use crate::error::WireError;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub const STATUS_BROADCAST: &str = "status@broadcast";

/// Addressing namespace of a jid. The server portion of a raw address is
/// parsed once at the boundary; everything downstream switches on this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Server {
    /// Phone-number namespace.
    Pn,
    /// Privacy-id namespace.
    Lid,
    Group,
    Broadcast,
    Newsletter,
    HostedPn,
    HostedLid,
}

impl Server {
    pub fn as_str(&self) -> &'static str {
        match self {
            Server::Pn => "s.whatsapp.net",
            Server::Lid => "lid",
            Server::Group => "g.us",
            Server::Broadcast => "broadcast",
            Server::Newsletter => "newsletter",
            Server::HostedPn => "hosted",
            Server::HostedLid => "hosted.lid",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, WireError> {
        match raw {
            "s.whatsapp.net" => Ok(Server::Pn),
            "lid" => Ok(Server::Lid),
            "g.us" => Ok(Server::Group),
            "broadcast" => Ok(Server::Broadcast),
            "newsletter" => Ok(Server::Newsletter),
            "hosted" => Ok(Server::HostedPn),
            "hosted.lid" => Ok(Server::HostedLid),
            other => Err(WireError::UnknownServer(other.to_string())),
        }
    }
}

/// A structured address: `user[:device]@server`. A raw string decodes to
/// exactly one `Jid`; device is carried only when explicitly present.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Jid {
    pub user: String,
    pub server: Server,
    pub device: Option<u16>,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: Server) -> Self {
        Self {
            user: user.into(),
            server,
            device: None,
        }
    }

    pub fn with_device(mut self, device: u16) -> Self {
        self.device = Some(device);
        self
    }

    pub fn parse(raw: &str) -> Result<Self, WireError> {
        let (left, server_raw) = raw
            .split_once('@')
            .ok_or_else(|| WireError::InvalidJid(raw.to_string()))?;
        let server = Server::parse(server_raw)?;
        let (user, device) = match left.split_once(':') {
            Some((user, device_raw)) => {
                let device = device_raw
                    .parse::<u16>()
                    .map_err(|_| WireError::InvalidJid(raw.to_string()))?;
                (user, Some(device))
            }
            None => (left, None),
        };
        if user.is_empty() {
            return Err(WireError::InvalidJid(raw.to_string()));
        }
        Ok(Self {
            user: user.to_string(),
            server,
            device,
        })
    }

    pub fn encode(&self) -> String {
        match self.device {
            Some(device) if device > 0 => format!("{}:{}@{}", self.user, device, self.server.as_str()),
            _ => format!("{}@{}", self.user, self.server.as_str()),
        }
    }

    /// Drops the device suffix; device 0 is implicit on a normalized jid.
    pub fn normalized(&self) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server,
            device: None,
        }
    }

    pub fn device_index(&self) -> u16 {
        self.device.unwrap_or(0)
    }

    pub fn is_group(&self) -> bool {
        self.server == Server::Group
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == Server::Broadcast
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.server == Server::Broadcast && self.user == "status"
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == Server::Newsletter
    }

    pub fn is_lid(&self) -> bool {
        matches!(self.server, Server::Lid | Server::HostedLid)
    }

    pub fn is_pn(&self) -> bool {
        matches!(self.server, Server::Pn | Server::HostedPn)
    }

    pub fn is_hosted(&self) -> bool {
        matches!(self.server, Server::HostedPn | Server::HostedLid)
    }

    /// Same user under the same namespace, ignoring the device suffix.
    pub fn same_user(&self, other: &Jid) -> bool {
        self.user == other.user && self.server == other.server
    }

    /// Same endpoint including the device suffix (0 and absent are equal).
    pub fn same_device(&self, other: &Jid) -> bool {
        self.same_user(other) && self.device_index() == other.device_index()
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}
