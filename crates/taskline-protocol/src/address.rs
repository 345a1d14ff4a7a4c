//! Broker and result store connection URLs.
//!
//! `memory://[/vhost]` selects the in-process implementation;
//! `taskline://[user[:pass]@]host[:port][/vhost]` the broker service.

use crate::{ProtocolError, Result};
use std::fmt;
use url::Url;

pub const DEFAULT_PORT: u16 = 7379;
pub const DEFAULT_VHOST: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Memory,
    Taskline,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub vhost: String,
}

impl ConnectionUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| ProtocolError::InvalidUrl(format!("{}: {}", input, e)))?;

        let scheme = match url.scheme() {
            "memory" => Scheme::Memory,
            "taskline" | "tcp" => Scheme::Taskline,
            other => {
                return Err(ProtocolError::InvalidUrl(format!(
                    "unsupported scheme {} in {}",
                    other, input
                )))
            }
        };

        let host = url.host_str().unwrap_or_default().to_string();
        if scheme == Scheme::Taskline && host.is_empty() {
            return Err(ProtocolError::InvalidUrl(format!("missing host in {}", input)));
        }

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let password = url.password().map(str::to_string);

        let vhost = match url.path().trim_start_matches('/') {
            "" => DEFAULT_VHOST.to_string(),
            path => path.to_string(),
        };

        Ok(ConnectionUrl {
            scheme,
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            username,
            password,
            vhost,
        })
    }

    pub fn is_memory(&self) -> bool {
        self.scheme == Scheme::Memory
    }

    /// `host:port` for dialing
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Prefix a queue name or store key with the virtual host
    pub fn namespaced(&self, name: &str) -> String {
        namespaced(&self.vhost, name)
    }
}

pub fn namespaced(vhost: &str, name: &str) -> String {
    if vhost == DEFAULT_VHOST {
        name.to_string()
    } else {
        format!("{}/{}", vhost, name)
    }
}

// Never print the password, these end up in logs.
impl fmt::Display for ConnectionUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Memory => write!(f, "memory://")?,
            Scheme::Taskline => {
                write!(f, "taskline://")?;
                if let Some(user) = &self.username {
                    write!(f, "{}", user)?;
                    if self.password.is_some() {
                        write!(f, ":***")?;
                    }
                    write!(f, "@")?;
                }
                write!(f, "{}:{}", self.host, self.port)?;
            }
        }
        if self.vhost != DEFAULT_VHOST {
            write!(f, "/{}", self.vhost)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionUrl({})", self)
    }
}
