//! Data models for values the daemon resolves and the states that drive them.
//!
//! - `GeoIpLocation`: where the device appears to be on the internet
//! - `TunnelState`, `ActionAfterDisconnect`: tunnel state machine snapshots
//! - `RelayItem`, `RelaySelection`: the user's chosen exit location
//! - `AccountToken`, `AccountData`: account identity and expiry

pub mod account;
pub mod location;
pub mod tunnel;

pub use account::{AccountData, AccountToken};
pub use location::GeoIpLocation;
pub use tunnel::{ActionAfterDisconnect, RelayItem, RelaySelection, TunnelState};
