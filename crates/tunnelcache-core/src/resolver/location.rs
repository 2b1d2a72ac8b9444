//! Location resolution driven by the tunnel state.
//!
//! | state                      | shown right away            | looked up |
//! |----------------------------|-----------------------------|-----------|
//! | Disconnected               | last real location          | yes       |
//! | Connecting / Connected     | location reported in state  | Connected |
//! | Disconnecting (nothing)    | last real location          | no        |
//! | Disconnecting (block)      | nothing                     | no        |
//! | Disconnecting (reconnect)  | selected relay's location   | no        |
//! | Error                      | nothing                     | no        |
//!
//! Only lookups made while disconnected count as the device's real location.

use std::sync::Arc;

use crate::backoff::BackoffSchedule;
use crate::cache::RetryingFetchCache;
use crate::daemon::DaemonRpc;
use crate::models::{ActionAfterDisconnect, GeoIpLocation, RelaySelection, TunnelState};

use super::state_gated::{StateGatedResolver, StatePolicy};

pub type LocationResolver = StateGatedResolver<TunnelState, GeoIpLocation>;

pub struct LocationPolicy {
    selection: RelaySelection,
}

impl LocationPolicy {
    pub fn new(selection: RelaySelection) -> Self {
        Self { selection }
    }
}

impl StatePolicy<TunnelState, GeoIpLocation> for LocationPolicy {
    fn wants_fetch(&self, state: &TunnelState) -> bool {
        state.is_at_rest()
    }

    fn derive(
        &self,
        state: &TunnelState,
        last_known_good: Option<&GeoIpLocation>,
    ) -> Option<GeoIpLocation> {
        match state {
            TunnelState::Disconnected => last_known_good.cloned(),
            TunnelState::Connecting { location } | TunnelState::Connected { location } => {
                location.clone()
            }
            TunnelState::Disconnecting {
                action_after_disconnect,
            } => match action_after_disconnect {
                ActionAfterDisconnect::Nothing => last_known_good.cloned(),
                ActionAfterDisconnect::Block => None,
                ActionAfterDisconnect::Reconnect => {
                    self.selection.selected().map(|item| item.location())
                }
            },
            TunnelState::Error => None,
        }
    }

    fn remembers(&self, state: &TunnelState) -> bool {
        matches!(state, TunnelState::Disconnected)
    }
}

/// Build a location resolver backed by the daemon's location lookup.
///
/// Must be called from within a Tokio runtime.
pub fn location_resolver(
    daemon: Arc<dyn DaemonRpc>,
    selection: RelaySelection,
    schedule: BackoffSchedule,
    initial: TunnelState,
    connected: bool,
) -> LocationResolver {
    let builder = RetryingFetchCache::builder("location", move |_origin: TunnelState| {
        daemon.current_location()
    })
    .schedule(schedule);

    StateGatedResolver::new(builder, LocationPolicy::new(selection), initial, connected)
}
