//! Model registry: model name -> inference backend address

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Network address of one model's inference backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BackendAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {:?}", s))?;
        if host.is_empty() {
            return Err(format!("empty host in {:?}", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in {:?}", s))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Known inference backends, resolved at startup
///
/// Unknown model names are a fatal `Config` failure for the requesting
/// session, never a retry.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    backends: BTreeMap<String, BackendAddr>,
}

impl ModelRegistry {
    pub fn new(backends: BTreeMap<String, BackendAddr>) -> Self {
        Self { backends }
    }

    pub fn lookup(&self, model_name: &str) -> Option<&BackendAddr> {
        self.backends.get(model_name)
    }

    pub fn contains(&self, model_name: &str) -> bool {
        self.backends.contains_key(model_name)
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}
