use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Static, load-once configuration for the speaker and its peer table.
///
/// Unlike the daemon this core is extracted from, there is no live
/// configuration channel here: the whole tree is read from a YAML file at
/// startup and a restart is required to change it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerConfig {
    pub asn: u32,
    pub router_id: Ipv4Addr,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl SpeakerConfig {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub peer_addr: IpAddr,
    pub peer_as: u32,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub damping: DampingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    pub idle_hold_time: Option<u16>,
    pub delay_open_time: Option<u16>,
    pub hold_time: Option<u16>,
    pub connect_retry_time: Option<u16>,
    pub min_adv_interval: Option<u16>,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            idle_hold_time: None,
            delay_open_time: None,
            hold_time: None,
            connect_retry_time: None,
            min_adv_interval: None,
        }
    }
}

impl TimerConfig {
    pub const DEFAULT_IDLE_HOLD_TIME: u64 = 5;
    pub const DEFAULT_HOLD_TIME: u64 = 90;
    pub const DEFAULT_CONNECT_RETRY_TIME: u64 = 120;
    pub const DEFAULT_MIN_ADV_INTERVAL: u64 = 30;

    pub fn idle_hold_time(&self) -> u64 {
        self.idle_hold_time.map(u64::from).unwrap_or(Self::DEFAULT_IDLE_HOLD_TIME)
    }

    pub fn delay_open_time(&self) -> Option<u64> {
        self.delay_open_time.map(u64::from)
    }

    pub fn hold_time(&self) -> u64 {
        self.hold_time.map(u64::from).unwrap_or(Self::DEFAULT_HOLD_TIME)
    }

    pub fn connect_retry_time(&self) -> u64 {
        self.connect_retry_time.map(u64::from).unwrap_or(Self::DEFAULT_CONNECT_RETRY_TIME)
    }

    pub fn min_adv_interval(&self) -> u64 {
        self.min_adv_interval.map(u64::from).unwrap_or(Self::DEFAULT_MIN_ADV_INTERVAL)
    }
}

/// A single entry in an MD5 key chain: the key is valid while `now` falls in
/// `[start_time, end_time)`, widened by `max_time_drift` on both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Md5Key {
    pub key_id: u8,
    pub password: String,
    pub start_time: i64,
    pub end_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum AuthConfig {
    #[default]
    Null,
    Md5 {
        key_chain: Vec<Md5Key>,
        #[serde(default = "default_drift")]
        max_time_drift: i64,
    },
}

fn default_drift() -> i64 {
    5
}

impl AuthConfig {
    /// The key whose window covers `now`, accounting for drift. `now` is a
    /// unix timestamp so this never touches a clock directly.
    pub fn active_key(&self, now: i64) -> Option<&Md5Key> {
        match self {
            AuthConfig::Null => None,
            AuthConfig::Md5 { key_chain, max_time_drift } => key_chain.iter().find(|k| {
                now >= k.start_time - max_time_drift && now < k.end_time + max_time_drift
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DampingConfig {
    pub threshold: u32,
    pub window: Duration,
    pub idle_holdtime: Duration,
}

impl Default for DampingConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: Duration::from_secs(30),
            idle_holdtime: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml() {
        let text = "asn: 65001\nrouter_id: 1.1.1.1\npeers:\n  - peer_addr: 2.2.2.2\n    peer_as: 65002\n";
        let cfg = SpeakerConfig::from_yaml(text).unwrap();
        assert_eq!(cfg.asn, 65001);
        assert_eq!(cfg.peers.len(), 1);
        assert_eq!(cfg.peers[0].peer_as, 65002);
    }

    #[test]
    fn md5_key_window_respects_drift() {
        let auth = AuthConfig::Md5 {
            key_chain: vec![Md5Key { key_id: 1, password: "x".into(), start_time: 100, end_time: 200 }],
            max_time_drift: 5,
        };
        assert!(auth.active_key(96).is_some());
        assert!(auth.active_key(204).is_some());
        assert!(auth.active_key(90).is_none());
        assert!(auth.active_key(210).is_none());
    }
}
