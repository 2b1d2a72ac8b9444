use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Account number used to identify the subject of account data lookups
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(transparent)]
pub struct AccountToken(String);

impl AccountToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Keep full account numbers out of logs
impl std::fmt::Debug for AccountToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let visible: String = self.0.chars().take(4).collect();
        write!(f, "AccountToken({}****)", visible)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AccountData {
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub expiry: DateTime<Utc>,
}

impl AccountData {
    pub fn new(expiry: DateTime<Utc>) -> Self {
        Self { expiry }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    pub fn remaining(&self) -> Duration {
        self.remaining_at(Utc::now())
    }

    /// Time left on the account, zero once expired
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expiry - now).max(Duration::zero())
    }

    pub fn formatted_remaining_time(&self) -> String {
        self.formatted_remaining_time_at(Utc::now())
    }

    /// "N days left", "N hours left", or "less than an hour left"
    pub fn formatted_remaining_time_at(&self, now: DateTime<Utc>) -> String {
        if self.is_expired_at(now) {
            return "out of time".to_string();
        }

        let remaining = self.remaining_at(now);
        let days = remaining.num_days();
        let hours = remaining.num_hours();
        if days >= 2 {
            format!("{} days left", days)
        } else if days == 1 {
            "1 day left".to_string()
        } else if hours >= 2 {
            format!("{} hours left", hours)
        } else if hours == 1 {
            "1 hour left".to_string()
        } else {
            "less than an hour left".to_string()
        }
    }
}
