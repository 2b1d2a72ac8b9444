use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct GeoIpLocation {
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub ipv4: Option<Ipv4Addr>,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub ipv6: Option<Ipv6Addr>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub hostname: Option<String>,
}

impl GeoIpLocation {
    /// A location known only by name, without any addresses
    pub fn named(country: Option<&str>, city: Option<&str>, hostname: Option<&str>) -> Self {
        Self {
            ipv4: None,
            ipv6: None,
            country: country.map(str::to_string),
            city: city.map(str::to_string),
            hostname: hostname.map(str::to_string),
        }
    }

    /// Whether this location came from an address lookup rather than a name
    pub fn has_address(&self) -> bool {
        self.ipv4.is_some() || self.ipv6.is_some()
    }

    /// Human-readable "City, Country (hostname)" description
    pub fn describe(&self) -> String {
        let place = match (&self.city, &self.country) {
            (Some(city), Some(country)) => format!("{}, {}", city, country),
            (None, Some(country)) => country.clone(),
            (Some(city), None) => city.clone(),
            (None, None) => "Unknown location".to_string(),
        };

        match &self.hostname {
            Some(hostname) => format!("{} ({})", place, hostname),
            None => place,
        }
    }
}
