//! Simulated daemon and the scripted session the harness plays against it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tracing::{debug, info};

use tunnelcache_core::models::{
    AccountData, AccountToken, ActionAfterDisconnect, GeoIpLocation, RelayItem, RelaySelection,
    TunnelState,
};
use tunnelcache_core::{
    AccountDataCache, DaemonRpc, FetchError, FetchHandlers, LocationResolver, RetryAction,
};

// ============================================================================
// Constants
// ============================================================================

/// Maximum consecutive failures tolerated for one account fetch before giving up
const MAX_ACCOUNT_FAILURES: u32 = 5;

/// Pause between scripted tunnel transitions
const STEP_PAUSE: Duration = Duration::from_secs(2);

// ============================================================================
// Simulated daemon
// ============================================================================

/// Daemon stand-in: every call takes `latency` and fails with probability
/// `failure_rate`. The reported location depends on whether the tunnel is up.
pub struct SimulatedDaemon {
    failure_rate: f64,
    latency: Duration,
    tunnel_up: AtomicBool,
}

impl SimulatedDaemon {
    /// A non-finite `failure_rate` is treated as a reliable daemon
    pub fn new(failure_rate: f64, latency: Duration) -> Arc<Self> {
        let failure_rate = if failure_rate.is_finite() {
            failure_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Arc::new(Self {
            failure_rate,
            latency,
            tunnel_up: AtomicBool::new(false),
        })
    }

    pub fn set_tunnel_up(&self, up: bool) {
        self.tunnel_up.store(up, Ordering::SeqCst);
    }

    fn roll_failure(&self) -> bool {
        rand::thread_rng().gen_bool(self.failure_rate)
    }

    fn home_location() -> GeoIpLocation {
        GeoIpLocation {
            ipv4: Some([203, 0, 113, 7].into()),
            ..GeoIpLocation::named(Some("Sweden"), Some("Malmö"), None)
        }
    }

    fn exit_location() -> GeoIpLocation {
        GeoIpLocation {
            ipv4: Some([198, 51, 100, 23].into()),
            ..GeoIpLocation::named(Some("Germany"), Some("Berlin"), Some("de-ber-004"))
        }
    }
}

impl DaemonRpc for SimulatedDaemon {
    fn current_location(&self) -> BoxFuture<'static, Result<GeoIpLocation, FetchError>> {
        let fail = self.roll_failure();
        let latency = self.latency;
        let location = if self.tunnel_up.load(Ordering::SeqCst) {
            Self::exit_location()
        } else {
            Self::home_location()
        };

        async move {
            tokio::time::sleep(latency).await;
            if fail {
                debug!("Simulated location lookup failed");
                Err(FetchError::rpc("simulated lookup timeout"))
            } else {
                Ok(location)
            }
        }
        .boxed()
    }

    fn account_data(
        &self,
        token: AccountToken,
    ) -> BoxFuture<'static, Result<AccountData, FetchError>> {
        let fail = self.roll_failure();
        let latency = self.latency;

        async move {
            tokio::time::sleep(latency).await;
            if fail {
                debug!(?token, "Simulated account lookup failed");
                return Err(FetchError::DaemonUnavailable);
            }
            // Deterministic per token so a switch is visible in the output
            let days: i64 = token
                .as_str()
                .bytes()
                .map(|b| i64::from(b % 10))
                .sum();
            Ok(AccountData::new(Utc::now() + ChronoDuration::days(days)))
        }
        .boxed()
    }
}

// ============================================================================
// Scripted session
// ============================================================================

/// Retry until `MAX_ACCOUNT_FAILURES` consecutive failures, then stop
fn bounded_retries(label: &'static str) -> impl FnMut(&FetchError) -> RetryAction + Send {
    let mut failures = 0;
    move |error| {
        failures += 1;
        if failures >= MAX_ACCOUNT_FAILURES {
            info!(label, failures, error = %error, "Too many failures, stopping");
            RetryAction::Stop
        } else {
            RetryAction::Retry
        }
    }
}

fn account_handlers(label: &'static str) -> FetchHandlers<AccountData> {
    FetchHandlers::new(
        move |data: Option<AccountData>| match data {
            Some(data) => info!(label, expiry = %data.expiry, "Account fetch finished"),
            None => info!(label, "Account fetch gave up"),
        },
        bounded_retries(label),
    )
}

fn relay() -> RelayItem {
    RelayItem::Relay {
        country: "Germany".to_string(),
        city: "Berlin".to_string(),
        hostname: "de-ber-004".to_string(),
    }
}

/// Play a login, a connect/reconnect/disconnect cycle and an account switch
pub async fn run_script(
    daemon: Arc<SimulatedDaemon>,
    location: &LocationResolver,
    account: &AccountDataCache,
    selection: &RelaySelection,
) {
    account.fetch(AccountToken::new("1234567890"), account_handlers("login"));
    selection.select(Some(relay()));
    tokio::time::sleep(STEP_PAUSE).await;

    let steps = [
        TunnelState::Connecting {
            location: Some(relay().location()),
        },
        TunnelState::Connected {
            location: Some(relay().location()),
        },
        TunnelState::Disconnecting {
            action_after_disconnect: ActionAfterDisconnect::Reconnect,
        },
        TunnelState::Connected {
            location: Some(relay().location()),
        },
        TunnelState::Disconnecting {
            action_after_disconnect: ActionAfterDisconnect::Nothing,
        },
        TunnelState::Disconnected,
    ];

    for state in steps {
        daemon.set_tunnel_up(matches!(state, TunnelState::Connected { .. }));
        info!(state = state.name(), "Tunnel state changed");
        location.set_state(state);
        tokio::time::sleep(STEP_PAUSE).await;
    }

    info!("Connectivity lost");
    location.set_connectivity(false);
    tokio::time::sleep(STEP_PAUSE).await;
    info!("Connectivity restored");
    location.set_connectivity(true);
    tokio::time::sleep(STEP_PAUSE).await;
    info!("Manual location refresh");
    location.refresh();
    tokio::time::sleep(STEP_PAUSE).await;

    account.fetch(AccountToken::new("5555666677"), account_handlers("switch"));
    tokio::time::sleep(STEP_PAUSE).await;
    account.invalidate();
    tokio::time::sleep(Duration::from_millis(100)).await;
}
