use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::GeoIpLocation;

/// What the tunnel does once it has finished disconnecting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum ActionAfterDisconnect {
    Nothing,
    Block,
    Reconnect,
}

/// Snapshot of the daemon's tunnel state machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelState {
    #[default]
    Disconnected,
    Connecting {
        location: Option<GeoIpLocation>,
    },
    Connected {
        location: Option<GeoIpLocation>,
    },
    Disconnecting {
        action_after_disconnect: ActionAfterDisconnect,
    },
    Error,
}

impl TunnelState {
    /// States in which the device's public location is stable enough to look up
    pub fn is_at_rest(&self) -> bool {
        matches!(self, TunnelState::Disconnected | TunnelState::Connected { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            TunnelState::Disconnected => "disconnected",
            TunnelState::Connecting { .. } => "connecting",
            TunnelState::Connected { .. } => "connected",
            TunnelState::Disconnecting { .. } => "disconnecting",
            TunnelState::Error => "error",
        }
    }
}

/// An entry from the relay list the user can select as exit location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayItem {
    Country {
        name: String,
    },
    City {
        country: String,
        name: String,
    },
    Relay {
        country: String,
        city: String,
        hostname: String,
    },
}

impl RelayItem {
    /// Location implied by selecting this item, before any lookup
    pub fn location(&self) -> GeoIpLocation {
        match self {
            RelayItem::Country { name } => GeoIpLocation::named(Some(name), None, None),
            RelayItem::City { country, name } => {
                GeoIpLocation::named(Some(country), Some(name), None)
            }
            RelayItem::Relay {
                country,
                city,
                hostname,
            } => GeoIpLocation::named(Some(country), Some(city), Some(hostname)),
        }
    }
}

/// The currently selected relay item, shared with the relay list owner.
/// Clones share the same selection.
#[derive(Debug, Clone, Default)]
pub struct RelaySelection {
    inner: Arc<RwLock<Option<RelayItem>>>,
}

impl RelaySelection {
    pub fn select(&self, item: Option<RelayItem>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = item;
    }

    pub fn selected(&self) -> Option<RelayItem> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
