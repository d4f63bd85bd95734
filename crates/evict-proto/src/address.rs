//! Endpoint configuration strings of the form `[user[:password]@]host:port`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// A parsed endpoint address.
///
/// Parsing runs right to left: the last `:` separates the port, the last `@`
/// before it separates credentials, and the first `:` inside the credentials
/// separates user from password. The host may carry a `/vhost` suffix, which
/// only the broker transport interprets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddress {
    /// Optional user name.
    pub user: Option<String>,
    /// Optional password; only present together with a user.
    pub password: Option<String>,
    /// Host name or IP literal, possibly followed by `/vhost`.
    pub host: String,
    /// Port number, never zero.
    pub port: u16,
}

impl EndpointAddress {
    /// Creates an address without credentials.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            user: None,
            password: None,
            host: host.into(),
            port,
        }
    }

    /// Adds credentials.
    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.user = Some(user.into());
        self.password = password;
        self
    }

    /// Host without any `/vhost` suffix.
    #[must_use]
    pub fn host_name(&self) -> &str {
        self.host
            .split_once('/')
            .map_or(self.host.as_str(), |(host, _)| host)
    }

    /// The `/vhost` suffix of the host, if any, without the leading slash.
    #[must_use]
    pub fn virtual_host(&self) -> Option<&str> {
        self.host
            .split_once('/')
            .map(|(_, vhost)| vhost)
            .filter(|vhost| !vhost.is_empty())
    }

    /// `host:port` suitable for socket resolution.
    #[must_use]
    pub fn socket_target(&self) -> String {
        format!("{}:{}", self.host_name(), self.port)
    }
}

impl FromStr for EndpointAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        let (rest, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        let port = match port.parse::<u16>() {
            Ok(0) | Err(_) => return Err(AddressError::InvalidPort(port.to_string())),
            Ok(p) => p,
        };

        let (credentials, host) = match rest.rsplit_once('@') {
            Some((credentials, host)) => (Some(credentials), host),
            None => (None, rest),
        };
        if host.is_empty() || host.starts_with('/') {
            return Err(AddressError::MissingHost(s.to_string()));
        }

        let (user, password) = match credentials {
            None => (None, None),
            Some(credentials) => match credentials.split_once(':') {
                Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
                None => (Some(credentials.to_string()), None),
            },
        };

        Ok(Self {
            user,
            password,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            f.write_str(user)?;
            if self.password.is_some() {
                f.write_str(":***")?;
            }
            f.write_str("@")?;
        }
        write!(f, "{}:{}", self.host, self.port)
    }
}
