//! Configuration model
//!
//! The configuration is handed to the path manager as a full snapshot; the
//! manager resolves the effective per-path configuration through template
//! matching (exact name, then `~`-prefixed regular expressions, then the
//! `all_others` catch-all).
//!
//! File parsing and the CLI live outside the core; this module only defines
//! the recognized options, their defaults and their validation.

pub mod credential;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub use credential::Credential;

use crate::error::{Error, Result};

/// Catch-all path template names, lowest matching priority
const CATCH_ALL_TEMPLATES: [&str; 2] = ["all_others", "all"];

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Tracing filter directive for this level
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Where log lines are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDestination {
    Stdout,
    File,
}

/// An IPv4/IPv6 network in CIDR notation; a bare address is a /32 or /128
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    /// Whether `ip` belongs to this network
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_str, prefix_str) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };

        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| Error::Conf(format!("invalid IP address: {addr_str}")))?;

        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_str {
            Some(p) => {
                let p: u8 = p
                    .parse()
                    .map_err(|_| Error::Conf(format!("invalid network prefix: {s}")))?;
                if p > max_prefix {
                    return Err(Error::Conf(format!("invalid network prefix: {s}")));
                }
                p
            }
            None => max_prefix,
        };

        Ok(Self { addr, prefix })
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl Serialize for IpNetwork {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IpNetwork {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde representation of durations as fractional seconds
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("invalid duration"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Per-path configuration, resolved through template matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PathConf {
    /// `publisher` (default) or the URL of an upstream to pull from
    pub source: String,

    /// Run the static source only while readers or describes are outstanding
    pub source_on_demand: bool,

    /// Deadline for requests parked while the on-demand source starts
    #[serde(with = "duration_secs")]
    pub source_on_demand_start_timeout: Duration,

    /// Idle time after the last reader leaves before the source is stopped
    #[serde(with = "duration_secs")]
    pub source_on_demand_close_after: Duration,

    /// Expected TLS fingerprint of the upstream, when pulling over TLS
    pub source_fingerprint: String,

    /// Publisher credentials and allowed networks
    pub publish_user: Credential,
    pub publish_pass: Credential,
    pub publish_ips: Vec<IpNetwork>,

    /// Reader credentials and allowed networks
    pub read_user: Credential,
    pub read_pass: Credential,
    pub read_ips: Vec<IpNetwork>,

    /// Allow a new publisher to replace the current one
    pub override_publisher: bool,

    /// Enable on-disk segment recording
    pub record: bool,

    /// Segment path template; supports `%path` and strftime-style fields
    pub record_path: String,

    /// Container format label of recorded segments
    pub record_format: String,

    /// Interval at which buffered parts are flushed to the segment
    #[serde(with = "duration_secs")]
    pub record_part_duration: Duration,

    /// Maximum duration of one segment before rotation
    #[serde(with = "duration_secs")]
    pub record_segment_duration: Duration,

    /// Command started when the path is initialized
    pub run_on_init: String,
    pub run_on_init_restart: bool,

    /// Command started when the path is requested and stopped when idle
    pub run_on_demand: String,
    pub run_on_demand_restart: bool,

    /// Command started when the path becomes ready
    pub run_on_ready: String,

    /// Command started when a reader attaches
    pub run_on_read: String,

    /// Command started when the path stops being ready
    pub run_on_not_ready: String,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            source: "publisher".into(),
            source_on_demand: false,
            source_on_demand_start_timeout: Duration::from_secs(10),
            source_on_demand_close_after: Duration::from_secs(10),
            source_fingerprint: String::new(),
            publish_user: Credential::default(),
            publish_pass: Credential::default(),
            publish_ips: Vec::new(),
            read_user: Credential::default(),
            read_pass: Credential::default(),
            read_ips: Vec::new(),
            override_publisher: false,
            record: false,
            record_path: "./recordings/%path/%Y-%m-%d_%H-%M-%S".into(),
            record_format: "fmp4".into(),
            record_part_duration: Duration::from_secs(1),
            record_segment_duration: Duration::from_secs(3600),
            run_on_init: String::new(),
            run_on_init_restart: false,
            run_on_demand: String::new(),
            run_on_demand_restart: false,
            run_on_ready: String::new(),
            run_on_read: String::new(),
            run_on_not_ready: String::new(),
        }
    }
}

impl PathConf {
    /// Whether the path pulls from an upstream instead of waiting for a
    /// publisher
    pub fn has_static_source(&self) -> bool {
        !self.source.is_empty() && self.source != "publisher"
    }

    /// Whether activation is deferred until a reader or describe arrives
    pub fn is_on_demand(&self) -> bool {
        (self.has_static_source() && self.source_on_demand) || !self.run_on_demand.is_empty()
    }

    /// Validate this configuration; fatal at startup on failure
    pub fn validate(&self, name: &str) -> Result<()> {
        self.publish_user.validate()?;
        self.publish_pass.validate()?;
        self.read_user.validate()?;
        self.read_pass.validate()?;

        if self.source_on_demand && !self.has_static_source() {
            return Err(Error::Conf(format!(
                "path '{name}': sourceOnDemand requires a non-publisher source"
            )));
        }

        if !self.run_on_demand.is_empty() && self.has_static_source() {
            return Err(Error::Conf(format!(
                "path '{name}': runOnDemand cannot be used with a static source"
            )));
        }

        if self.record {
            if self.record_path.is_empty() {
                return Err(Error::Conf(format!(
                    "path '{name}': record enabled but recordPath is empty"
                )));
            }
            if self.record_segment_duration.is_zero() || self.record_part_duration.is_zero() {
                return Err(Error::Conf(format!(
                    "path '{name}': record durations must be positive"
                )));
            }
        }

        if self.source_on_demand_start_timeout.is_zero() {
            return Err(Error::Conf(format!(
                "path '{name}': sourceOnDemandStartTimeout must be positive"
            )));
        }

        Ok(())
    }
}

/// Whether a configuration key is a template (regex or catch-all) rather
/// than a concrete path name
pub fn is_path_template(name: &str) -> bool {
    name.starts_with('~') || CATCH_ALL_TEMPLATES.contains(&name)
}

/// Whether `name` is acceptable as a concrete path name
pub fn is_valid_path_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-/.".contains(c))
}

/// Process-wide configuration snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Conf {
    /// Log verbosity
    pub log_level: LogLevel,

    /// Enabled log sinks
    pub log_destinations: Vec<LogDestination>,

    /// Log file path, used when the `file` destination is enabled
    pub log_file: PathBuf,

    /// Per-reader buffer depth, rounded up to a power of two
    pub write_queue_size: usize,

    /// Path templates: concrete names, `~`-prefixed regexes, `all_others`
    pub paths: HashMap<String, PathConf>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_destinations: vec![LogDestination::Stdout],
            log_file: "mediarelay.log".into(),
            write_queue_size: 512,
            paths: HashMap::new(),
        }
    }
}

impl Conf {
    /// Validate the whole configuration; fatal at startup on failure
    pub fn validate(&self) -> Result<()> {
        if self.write_queue_size == 0 {
            return Err(Error::Conf("writeQueueSize must be positive".into()));
        }

        for (name, path_conf) in &self.paths {
            if let Some(pattern) = name.strip_prefix('~') {
                Regex::new(pattern).map_err(|e| {
                    Error::Conf(format!("invalid path template '{name}': {e}"))
                })?;
            } else if !CATCH_ALL_TEMPLATES.contains(&name.as_str())
                && !is_valid_path_name(name)
            {
                return Err(Error::Conf(format!("invalid path name '{name}'")));
            }

            path_conf.validate(name)?;
        }

        Ok(())
    }

    /// Resolve the effective configuration for a concrete path name.
    ///
    /// Precedence: exact name; then the matching regex template with the
    /// longest pattern (lexicographic tie-break); then `all_others`/`all`.
    pub fn find_path_conf(&self, name: &str) -> Option<PathConf> {
        if !is_valid_path_name(name) {
            return None;
        }

        if let Some(conf) = self.paths.get(name) {
            return Some(conf.clone());
        }

        let mut best: Option<&str> = None;
        for key in self.paths.keys() {
            let Some(pattern) = key.strip_prefix('~') else {
                continue;
            };
            let Ok(re) = Regex::new(pattern) else {
                continue;
            };
            if !re.is_match(name) {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => {
                    key.len() > current.len() || (key.len() == current.len() && key.as_str() < current)
                }
            };
            if better {
                best = Some(key.as_str());
            }
        }
        if let Some(key) = best {
            return self.paths.get(key).cloned();
        }

        for catch_all in CATCH_ALL_TEMPLATES {
            if let Some(conf) = self.paths.get(catch_all) {
                return Some(conf.clone());
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_network_parse_and_contains() {
        let net: IpNetwork = "192.168.0.0/16".parse().unwrap();
        assert!(net.contains("192.168.4.7".parse().unwrap()));
        assert!(!net.contains("10.0.0.1".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));

        let host: IpNetwork = "10.1.2.3".parse().unwrap();
        assert!(host.contains("10.1.2.3".parse().unwrap()));
        assert!(!host.contains("10.1.2.4".parse().unwrap()));

        let v6: IpNetwork = "fd00::/8".parse().unwrap();
        assert!(v6.contains("fd00::1234".parse().unwrap()));
        assert!(!v6.contains("fe80::1".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<IpNetwork>().is_err());
        assert!("not-an-ip".parse::<IpNetwork>().is_err());
    }

    #[test]
    fn test_template_detection() {
        assert!(is_path_template("~^cam[0-9]+$"));
        assert!(is_path_template("all_others"));
        assert!(is_path_template("all"));
        assert!(!is_path_template("live"));
        assert!(!is_path_template("allotments"));
    }

    #[test]
    fn test_path_name_validation() {
        assert!(is_valid_path_name("live"));
        assert!(is_valid_path_name("cam/front-door.2024"));
        assert!(!is_valid_path_name(""));
        assert!(!is_valid_path_name("/leading"));
        assert!(!is_valid_path_name("trailing/"));
        assert!(!is_valid_path_name("spa ce"));
    }

    #[test]
    fn test_find_path_conf_precedence() {
        let mut conf = Conf::default();

        let mut exact = PathConf::default();
        exact.record = true;
        conf.paths.insert("live".into(), exact);

        let mut short_re = PathConf::default();
        short_re.override_publisher = true;
        conf.paths.insert("~^cam".into(), short_re);

        let mut long_re = PathConf::default();
        long_re.source_on_demand = true;
        long_re.source = "rtsp://upstream/cam".into();
        conf.paths.insert("~^cam[0-9]+$".into(), long_re);

        conf.paths.insert("all_others".into(), PathConf::default());

        // Exact match wins.
        assert!(conf.find_path_conf("live").unwrap().record);

        // Longest matching regex wins.
        let got = conf.find_path_conf("cam12").unwrap();
        assert!(got.source_on_demand);

        // Shorter regex still matches where the long one does not.
        let got = conf.find_path_conf("camera").unwrap();
        assert!(got.override_publisher);

        // Catch-all for everything else.
        let got = conf.find_path_conf("other").unwrap();
        assert_eq!(got, PathConf::default());

        // Invalid names never match.
        assert!(conf.find_path_conf("/bad").is_none());
    }

    #[test]
    fn test_find_path_conf_no_match() {
        let mut conf = Conf::default();
        conf.paths.insert("live".into(), PathConf::default());
        assert!(conf.find_path_conf("other").is_none());
    }

    #[test]
    fn test_conf_validation() {
        let mut conf = Conf::default();
        assert!(conf.validate().is_ok());

        conf.write_queue_size = 0;
        assert!(conf.validate().is_err());
        conf.write_queue_size = 512;

        conf.paths.insert("~[".into(), PathConf::default());
        assert!(conf.validate().is_err());
        conf.paths.clear();

        let mut bad = PathConf::default();
        bad.source_on_demand = true;
        conf.paths.insert("cam".into(), bad);
        assert!(conf.validate().is_err());
        conf.paths.clear();

        let mut bad = PathConf::default();
        bad.source = "rtsp://upstream/1".into();
        bad.run_on_demand = "ffmpeg ...".into();
        conf.paths.insert("cam".into(), bad);
        assert!(conf.validate().is_err());
        conf.paths.clear();

        let mut ok = PathConf::default();
        ok.source = "rtsp://upstream/1".into();
        ok.source_on_demand = true;
        conf.paths.insert("cam".into(), ok);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn test_path_conf_flags() {
        let mut conf = PathConf::default();
        assert!(!conf.has_static_source());
        assert!(!conf.is_on_demand());

        conf.source = "rtsp://upstream/stream".into();
        assert!(conf.has_static_source());
        assert!(!conf.is_on_demand());

        conf.source_on_demand = true;
        assert!(conf.is_on_demand());

        let mut conf = PathConf::default();
        conf.run_on_demand = "ffmpeg -i input -f rtsp ...".into();
        assert!(conf.is_on_demand());
    }

    #[test]
    fn test_conf_reload_equality() {
        let conf_a = Conf::default();
        let conf_b = Conf::default();
        assert_eq!(conf_a, conf_b);

        let mut conf_c = Conf::default();
        conf_c.write_queue_size = 1024;
        assert_ne!(conf_a, conf_c);
    }
}
