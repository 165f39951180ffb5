//! Sizing of the per-domain tables.

use serde::{Deserialize, Serialize};

use crate::error::AvzError;

/// Table sizes and dispatch limits, shared by every domain of a registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvzConfig {
    /// Agency, Agency-RT and the Mobile Entity slots
    pub max_domains: u16,
    /// Channel slots per domain, including the reserved channel 0
    pub nr_evtchn: u32,
    /// Virtual IRQ sources per domain
    pub nr_virqs: u32,
    /// Grant entries per domain, including the reserved ones
    pub nr_grant_entries: u32,
    /// Entries kept off the free list
    pub nr_reserved_grants: u32,
    /// Rescans `dispatch_pending` may do before returning
    pub dispatch_passes: u32,
}

impl Default for AvzConfig {
    fn default() -> Self {
        Self {
            max_domains: 7,
            nr_evtchn: 1024,
            nr_virqs: 2,
            nr_grant_entries: 512,
            nr_reserved_grants: 8,
            dispatch_passes: 4,
        }
    }
}

impl AvzConfig {
    /// Parse a JSON document; missing fields take their default.
    pub fn from_json(json: &str) -> Result<Self, AvzError> {
        let config: AvzConfig =
            serde_json::from_str(json).map_err(|e| AvzError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AvzError> {
        if self.max_domains == 0 {
            return Err(AvzError::InvalidConfig("max_domains must be > 0".into()));
        }
        if self.nr_evtchn < 2 || self.nr_evtchn % 64 != 0 {
            return Err(AvzError::InvalidConfig(
                "nr_evtchn must be a non-zero multiple of 64".into(),
            ));
        }
        if self.nr_reserved_grants >= self.nr_grant_entries {
            return Err(AvzError::InvalidConfig(
                "nr_reserved_grants must leave at least one usable entry".into(),
            ));
        }
        if self.nr_grant_entries == u32::MAX {
            return Err(AvzError::InvalidConfig("nr_grant_entries too large".into()));
        }
        if self.dispatch_passes == 0 {
            return Err(AvzError::InvalidConfig("dispatch_passes must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AvzConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.nr_evtchn, 1024);
        assert_eq!(config.nr_reserved_grants, 8);
    }

    #[test]
    fn test_from_json_partial() {
        let config = AvzConfig::from_json(r#"{ "nr_grant_entries": 64 }"#).unwrap();
        assert_eq!(config.nr_grant_entries, 64);
        assert_eq!(config.nr_evtchn, 1024);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(matches!(
            AvzConfig::from_json(r#"{ "nr_evtchn": 100 }"#),
            Err(AvzError::InvalidConfig(_))
        ));
        assert!(matches!(
            AvzConfig::from_json(r#"{ "nr_grant_entries": 8 }"#),
            Err(AvzError::InvalidConfig(_))
        ));
        assert!(matches!(
            AvzConfig::from_json("not json"),
            Err(AvzError::InvalidConfig(_))
        ));
    }
}
