// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! Startup configuration: loaded once from a TOML or JSON file, validated,
//! and handed to every worker thread as an immutable, `Clone`-able value.
use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::errors::CreationError;
use crate::ring::{BackendSpec, HashTagConfig};

fn default_port() -> u16 { 6379 }

fn default_num_workers() -> usize { 1 }

/// One backend server as written in the configuration file: `host:port@name`,
/// with `port` defaulting to 6379 and `name` defaulting to `host:port`.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct BackendEntry {
    pub host: String,
    pub port: u16,
    pub name: String,
}

impl TryFrom<String> for BackendEntry {
    type Error = CreationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let (address, name) = match raw.split_once('@') {
            Some((address, name)) => (address.to_string(), name.to_string()),
            None => (raw.clone(), raw.clone()),
        };

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| CreationError::InvalidParameter(format!("backend port is not a number: {}", raw)))?;
                (host.to_string(), port)
            },
            None => (address.clone(), default_port()),
        };

        if host.is_empty() {
            return Err(CreationError::InvalidParameter(format!("backend entry has no host: {}", raw)));
        }

        Ok(BackendEntry { host, port, name })
    }
}

impl From<BackendEntry> for BackendSpec {
    fn from(entry: BackendEntry) -> BackendSpec { BackendSpec::new(entry.host, entry.port, entry.name) }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    pub backends: Vec<BackendEntry>,
    pub hash_begin_delimiter: Option<char>,
    pub hash_end_delimiter: Option<char>,
    #[serde(default)]
    pub disable_commands: HashSet<String>,
}

impl ProxyConfig {
    /// Loads and validates configuration from a TOML or JSON file, chosen by
    /// its extension.
    pub fn load(path: impl AsRef<Path>) -> Result<ProxyConfig, CreationError> {
        let path = path.as_ref();
        let source = config::File::from(path);
        let settings = config::Config::builder()
            .add_source(source)
            .build()
            .map_err(|e| CreationError::InvalidConfiguration(e.to_string()))?;
        let config: ProxyConfig =
            settings.try_deserialize().map_err(|e| CreationError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CreationError> {
        if self.backends.is_empty() {
            return Err(CreationError::InvalidConfiguration("at least one backend is required".to_string()));
        }
        if self.num_workers == 0 {
            return Err(CreationError::InvalidConfiguration("num_workers must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn backend_specs(&self) -> Vec<BackendSpec> { self.backends.iter().cloned().map(BackendSpec::from).collect() }

    pub fn hash_tags(&self) -> HashTagConfig {
        HashTagConfig::new(self.hash_begin_delimiter.map(|c| c as u8), self.hash_end_delimiter.map(|c| c as u8))
    }

    pub fn disable_commands_uppercase(&self) -> HashSet<String> {
        self.disable_commands.iter().map(|s| s.to_ascii_uppercase()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_entry_parses_host_port_and_name() {
        let entry = BackendEntry::try_from("10.0.0.1:6380@shard-a".to_string()).unwrap();
        assert_eq!(entry.host, "10.0.0.1");
        assert_eq!(entry.port, 6380);
        assert_eq!(entry.name, "shard-a");
    }

    #[test]
    fn backend_entry_defaults_port_and_name() {
        let entry = BackendEntry::try_from("10.0.0.1".to_string()).unwrap();
        assert_eq!(entry.port, 6379);
        assert_eq!(entry.name, "10.0.0.1");
    }

    #[test]
    fn backend_entry_rejects_an_unparseable_port() {
        assert!(BackendEntry::try_from("10.0.0.1:notaport".to_string()).is_err());
    }

    #[test]
    fn validate_rejects_an_empty_backend_list() {
        let config = ProxyConfig {
            listen_addr: None,
            port: 6379,
            num_workers: 1,
            backends: Vec::new(),
            hash_begin_delimiter: None,
            hash_end_delimiter: None,
            disable_commands: HashSet::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let config = ProxyConfig {
            listen_addr: None,
            port: 6379,
            num_workers: 0,
            backends: vec![BackendEntry::try_from("10.0.0.1".to_string()).unwrap()],
            hash_begin_delimiter: None,
            hash_end_delimiter: None,
            disable_commands: HashSet::new(),
        };
        assert!(config.validate().is_err());
    }
}
