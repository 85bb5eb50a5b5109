use crate::policy::{Policy, RejectDomains, RejectTemplate};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dmarcator.conf";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// authserv-id of the local DMARC verifier; the host name when empty.
    #[serde(rename = "AuthservID")]
    pub authserv_id: String,
    #[serde(rename = "ListenURI")]
    pub listen_uri: String,
    #[serde(rename = "RejectDomains")]
    pub reject_domains: Vec<String>,
    #[serde(rename = "RejectFmt")]
    pub reject_fmt: String,
    /// Applied before binding, sets the permissions of a unix socket.
    #[serde(rename = "UMask")]
    pub umask: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            authserv_id: String::new(),
            listen_uri: "unix:///run/dmarcator/dmarcator.sock".to_string(),
            reject_domains: Vec::new(),
            reject_fmt: "5.7.1 rejected because of DMARC failure for %s overriding policy"
                .to_string(),
            umask: 0o002,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Unix(PathBuf),
    Tcp(String),
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to open conf file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse conf file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Fills in values that depend on the host.
    pub fn resolve(mut self) -> Result<Self> {
        if self.authserv_id.trim().is_empty() {
            let hostname = hostname::get().context("Failed to read hostname")?;
            self.authserv_id = hostname.to_string_lossy().into_owned();
        }
        if self.authserv_id.trim().is_empty() {
            anyhow::bail!("AuthservID is empty and the host name is unknown");
        }
        Ok(self)
    }

    pub fn listen_address(&self) -> Result<ListenAddress> {
        let (network, address) = self
            .listen_uri
            .split_once("://")
            .with_context(|| format!("Invalid listen URI: {:?}", self.listen_uri))?;
        if address.is_empty() {
            anyhow::bail!("Invalid listen URI: {:?}", self.listen_uri);
        }
        match network {
            "unix" => Ok(ListenAddress::Unix(PathBuf::from(address))),
            "tcp" | "tcp4" | "tcp6" => {
                // "host:" asks for any free port.
                let address = if address.ends_with(':') {
                    format!("{address}0")
                } else {
                    address.to_string()
                };
                Ok(ListenAddress::Tcp(address))
            }
            other => anyhow::bail!("Unsupported network {:?} in listen URI", other),
        }
    }

    pub fn policy(&self) -> Result<Policy> {
        let template = RejectTemplate::parse(&self.reject_fmt).context("Invalid RejectFmt")?;
        Ok(Policy::new(
            self.authserv_id.clone(),
            RejectDomains::new(&self.reject_domains),
            template,
        ))
    }
}
