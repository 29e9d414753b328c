use crate::cache::TtlCache;
use crate::error::RelayError;
use crate::repo::{CryptoRepository, DirectorySync, SyncFacets};
use crate::store::KeyStore;
use courier_wire::{Jid, Server};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One concrete encryption endpoint produced by resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceEntry {
    pub user: String,
    pub device: u16,
    pub jid: Jid,
}

impl DeviceEntry {
    pub fn from_jid(jid: &Jid) -> Self {
        Self {
            user: jid.user.clone(),
            device: jid.device_index(),
            jid: jid.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RosterDevice {
    pub user: String,
    pub device: u16,
    pub hosted: bool,
}

/// Turns addressee identities into concrete device endpoints, batching all
/// cache misses into a single directory-sync round trip.
pub struct DeviceResolver {
    sync: Arc<dyn DirectorySync>,
    crypto: Arc<dyn CryptoRepository>,
    keys: Arc<dyn KeyStore>,
    cache: TtlCache<String, Vec<RosterDevice>>,
    me: Jid,
    me_lid: Option<Jid>,
}

impl DeviceResolver {
    pub fn new(
        sync: Arc<dyn DirectorySync>,
        crypto: Arc<dyn CryptoRepository>,
        keys: Arc<dyn KeyStore>,
        cache: TtlCache<String, Vec<RosterDevice>>,
        me: Jid,
        me_lid: Option<Jid>,
    ) -> Self {
        Self {
            sync,
            crypto,
            keys,
            cache,
            me,
            me_lid,
        }
    }

    pub async fn resolve(
        &self,
        jids: &[Jid],
        use_cache: bool,
        ignore_zero_device_users: bool,
    ) -> Result<Vec<DeviceEntry>, RelayError> {
        let mut out = Vec::new();
        if !use_cache {
            debug!("not using cache for devices");
        }
        let mut pending: Vec<Jid> = Vec::new();
        for jid in jids {
            if jid.device.is_some() {
                // explicit device index bypasses resolution entirely
                out.push(DeviceEntry::from_jid(jid));
            } else {
                pending.push(jid.normalized());
            }
        }
        let mut to_fetch: Vec<Jid> = Vec::new();
        if use_cache && !pending.is_empty() {
            let users: Vec<String> = pending.iter().map(|j| j.user.clone()).collect();
            let cached = self.cache.get_many(&users).await;
            for jid in pending {
                match cached.get(&jid.user) {
                    Some(roster) => {
                        trace!(user = %jid.user, "using cached devices");
                        out.extend(encode_roster(&jid, roster));
                    }
                    None => to_fetch.push(jid),
                }
            }
        } else {
            to_fetch = pending;
        }
        if to_fetch.is_empty() {
            return Ok(out);
        }

        let requested_lid_users: HashSet<String> = to_fetch
            .iter()
            .filter(|j| j.is_lid())
            .map(|j| j.user.clone())
            .collect();
        let facets = SyncFacets {
            device_list: true,
            lid_mapping: true,
        };
        let result = self.sync.query_devices(&to_fetch, facets).await?;

        let mappings: Vec<(Jid, Jid)> = result
            .entries
            .iter()
            .filter_map(|e| e.lid.clone().map(|lid| (lid, e.id.normalized())))
            .collect();
        if !mappings.is_empty() {
            trace!(count = mappings.len(), "storing lid mappings from device sync");
            self.crypto.store_lid_mappings(&mappings).await?;
        }

        let mut roster_map: HashMap<String, Vec<RosterDevice>> = HashMap::new();
        for entry in result.entries.iter() {
            let user = entry.id.user.clone();
            let mut devices: Vec<RosterDevice> = entry
                .devices
                .iter()
                .map(|d| RosterDevice {
                    user: user.clone(),
                    device: d.device,
                    hosted: d.hosted,
                })
                .collect();
            devices.retain(|d| !self.is_own_sending_device(&d.user, d.device));
            if devices.is_empty() {
                if ignore_zero_device_users {
                    debug!(user = %user, "dropping user with no devices");
                    continue;
                }
                devices.push(RosterDevice {
                    user: user.clone(),
                    device: 0,
                    hosted: false,
                });
            }
            roster_map.insert(user, devices);
        }

        for jid in to_fetch.iter() {
            if let Some(roster) = roster_map.get(&jid.user) {
                let lid_requested = requested_lid_users.contains(&jid.user);
                for device in roster {
                    out.push(final_entry(device, lid_requested));
                }
            }
        }

        self.cache
            .set_many(roster_map.iter().map(|(k, v)| (k.clone(), v.clone())))
            .await;

        let mut updates = HashMap::new();
        for (user, devices) in roster_map.iter() {
            let list: Vec<u16> = devices.iter().map(|d| d.device).collect();
            if let Ok(bytes) = serde_json::to_vec(&list) {
                updates.insert(user.clone(), bytes);
            }
        }
        if !updates.is_empty() {
            if let Err(err) = self.keys.set("device-list", updates).await {
                warn!(error = %err, "failed to store resolved device lists");
            }
        }
        Ok(out)
    }

    fn is_own_sending_device(&self, user: &str, device: u16) -> bool {
        if user == self.me.user && device == self.me.device_index() {
            return true;
        }
        match &self.me_lid {
            Some(lid) => user == lid.user && device == lid.device_index(),
            None => false,
        }
    }
}

fn final_entry(device: &RosterDevice, lid_requested: bool) -> DeviceEntry {
    let server = match (lid_requested, device.hosted) {
        (true, true) => Server::HostedLid,
        (true, false) => Server::Lid,
        (false, true) => Server::HostedPn,
        (false, false) => Server::Pn,
    };
    let jid = Jid::new(device.user.clone(), server).with_device(device.device);
    DeviceEntry {
        user: device.user.clone(),
        device: device.device,
        jid,
    }
}

fn encode_roster(requesting: &Jid, roster: &[RosterDevice]) -> Vec<DeviceEntry> {
    let lid_requested = requesting.is_lid();
    roster
        .iter()
        .map(|device| final_entry(device, lid_requested))
        .collect()
}
