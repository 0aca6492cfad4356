//! Remote collection-control document.
//!
//! Wire shape:
//!
//! ```json
//! {"v": "12", "configs": {"disableSDK": false, "disableDebugMode": false,
//!   "event_blacklist": ["Foo"], "effect_mode": 1, "nv": "13", "autoTrackMode": -1}}
//! ```
//!
//! A document without `configs` is the permissive default (keeping `v`).

use crate::error::{AgentError, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const AUTO_TRACK_MODE_UNSET: i32 = -1;

/// Remote switches; replaced wholesale on every apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub version: Option<String>,
    pub new_version: Option<String>,
    pub disable_sdk: bool,
    pub disable_debug_mode: bool,
    pub event_blacklist: HashSet<String>,
    pub effect_immediately: bool,
    pub auto_track_mode: i32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            version: None,
            new_version: None,
            disable_sdk: false,
            disable_debug_mode: false,
            event_blacklist: HashSet::new(),
            effect_immediately: false,
            auto_track_mode: AUTO_TRACK_MODE_UNSET,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    configs: Option<WireConfigs>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireConfigs {
    #[serde(rename = "disableSDK", default)]
    disable_sdk: bool,
    #[serde(rename = "disableDebugMode", default)]
    disable_debug_mode: bool,
    #[serde(default)]
    event_blacklist: Vec<String>,
    #[serde(default)]
    effect_mode: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nv: Option<String>,
    #[serde(rename = "autoTrackMode", default = "unset_auto_track_mode")]
    auto_track_mode: i32,
}

fn unset_auto_track_mode() -> i32 {
    AUTO_TRACK_MODE_UNSET
}

impl RemoteConfig {
    /// Strict parse.
    pub fn parse(document: &str) -> Result<Self> {
        let wire: WireDocument = serde_json::from_str(document)
            .map_err(|e| AgentError::MalformedConfig(e.to_string()))?;

        let mut config = RemoteConfig {
            version: wire.v,
            ..Default::default()
        };
        if let Some(configs) = wire.configs {
            config.disable_sdk = configs.disable_sdk;
            config.disable_debug_mode = configs.disable_debug_mode;
            config.event_blacklist = configs.event_blacklist.into_iter().collect();
            config.effect_immediately = configs.effect_mode == 1;
            config.new_version = configs.nv;
            config.auto_track_mode = configs.auto_track_mode;
        }
        Ok(config)
    }

    /// Parse, falling back to the permissive default on malformed input.
    pub fn parse_or_default(document: &str) -> Self {
        Self::parse(document).unwrap_or_else(|e| {
            warn!("Malformed remote config, using permissive default: {}", e);
            Self::default()
        })
    }

    pub fn ignores(&self, event_name: &str) -> bool {
        self.event_blacklist.contains(event_name)
    }

    /// Serialize back to the wire shape.
    pub fn to_document(&self) -> String {
        let mut blacklist: Vec<String> = self.event_blacklist.iter().cloned().collect();
        blacklist.sort();
        let wire = WireDocument {
            v: self.version.clone(),
            configs: Some(WireConfigs {
                disable_sdk: self.disable_sdk,
                disable_debug_mode: self.disable_debug_mode,
                event_blacklist: blacklist,
                effect_mode: i32::from(self.effect_immediately),
                nv: self.new_version.clone(),
                auto_track_mode: self.auto_track_mode,
            }),
        };
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_document() {
        let config = RemoteConfig::parse(
            r#"{"v":"12","configs":{"disableSDK":true,"disableDebugMode":true,
                "event_blacklist":["Foo","Bar"],"effect_mode":1,"nv":"13","autoTrackMode":3}}"#,
        )
        .unwrap();

        assert_eq!(config.version.as_deref(), Some("12"));
        assert_eq!(config.new_version.as_deref(), Some("13"));
        assert!(config.disable_sdk);
        assert!(config.disable_debug_mode);
        assert!(config.effect_immediately);
        assert!(config.ignores("Foo"));
        assert!(!config.ignores("foo"));
        assert_eq!(config.auto_track_mode, 3);
    }

    #[test]
    fn test_missing_configs_is_permissive_but_keeps_version() {
        let config = RemoteConfig::parse(r#"{"v":"7"}"#).unwrap();
        assert_eq!(config.version.as_deref(), Some("7"));
        assert!(!config.disable_sdk);
        assert!(config.event_blacklist.is_empty());
        assert_eq!(config.auto_track_mode, AUTO_TRACK_MODE_UNSET);
    }

    #[test]
    fn test_effect_mode_other_than_one_is_deferred() {
        let config = RemoteConfig::parse(r#"{"configs":{"effect_mode":2}}"#).unwrap();
        assert!(!config.effect_immediately);
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(
            RemoteConfig::parse("{not json"),
            Err(AgentError::MalformedConfig(_))
        ));
        assert_eq!(
            RemoteConfig::parse_or_default(r#"{"configs":{"disableSDK":"yes"}}"#),
            RemoteConfig::default()
        );
    }

    #[test]
    fn test_document_reparses() {
        let parsed = RemoteConfig::parse(
            r#"{"v":"1","configs":{"disableSDK":true,"event_blacklist":["A"],"effect_mode":1}}"#,
        )
        .unwrap();
        assert_eq!(RemoteConfig::parse(&parsed.to_document()).unwrap(), parsed);
    }
}
