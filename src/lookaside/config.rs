//! Parsing and validation of the lookaside balancer configuration.
//!
//! The configuration names its child and fallback policies as ordered
//! preference lists of single-key objects; for each list the first entry
//! naming a registered policy wins.

use std::collections::HashMap;

use serde::Deserialize;

use crate::balancer::registry::GLOBAL_POLICY_REGISTRY;
use crate::balancer::ParsedJsonConfig;
use crate::error::Error;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawConfig {
    balancer_name: Option<String>,
    child_policy: Option<Vec<HashMap<String, serde_json::Value>>>,
    fallback_policy: Option<Vec<HashMap<String, serde_json::Value>>>,
}

/// A policy name selected from a preference list, with its opaque
/// configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySelection {
    pub name: String,
    pub config: serde_json::Value,
}

/// A validated configuration snapshot.
///
/// All fields are optional at parse time; an empty blob parses to an empty
/// configuration and it is the balancer's job to reject it at apply time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookasideConfig {
    /// The control-plane endpoint. Defaults to the channel target when
    /// absent.
    pub balancer_name: Option<String>,
    /// The policy driving endpoints received from the control plane.
    pub child_policy: Option<PolicySelection>,
    /// The policy driving resolver addresses when the control plane is
    /// silent.
    pub fallback_policy: Option<PolicySelection>,
}

pub(crate) fn parse(config: &ParsedJsonConfig) -> Result<LookasideConfig, Error> {
    let raw: RawConfig = config
        .convert_to()
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;
    Ok(LookasideConfig {
        balancer_name: raw.balancer_name,
        child_policy: select(raw.child_policy, "childPolicy")?,
        fallback_policy: select(raw.fallback_policy, "fallbackPolicy")?,
    })
}

// Picks the first entry naming a registered policy. A present but
// unsatisfiable list is a hard error; an absent or empty list is not.
fn select(
    list: Option<Vec<HashMap<String, serde_json::Value>>>,
    field: &'static str,
) -> Result<Option<PolicySelection>, Error> {
    let Some(entries) = list else {
        return Ok(None);
    };
    if entries.is_empty() {
        return Ok(None);
    }
    for entry in &entries {
        for (name, config) in entry {
            if GLOBAL_POLICY_REGISTRY.contains(name) {
                return Ok(Some(PolicySelection {
                    name: name.clone(),
                    config: config.clone(),
                }));
            }
        }
    }
    Err(Error::ConfigUnsatisfiable(field))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::balancer::{pick_first, round_robin};
    use serde_json::json;

    fn parse_value(value: serde_json::Value) -> Result<LookasideConfig, Error> {
        parse(&ParsedJsonConfig::from_value(value))
    }

    #[test]
    fn empty_blob_parses_to_empty_config() {
        let config = parse_value(json!({})).unwrap();
        assert_eq!(config, LookasideConfig::default());
    }

    #[test]
    fn first_registered_name_wins() {
        pick_first::reg();
        round_robin::reg();
        let config = parse_value(json!({
            "balancerName": "cp.example.com:443",
            "childPolicy": [
                {"no_such_policy": {}},
                {"round_robin": {}},
                {"pick_first": {}},
            ],
            "fallbackPolicy": [
                {"no_such_policy": {}},
                {"pick_first": {"shuffleAddressList": true}},
                {"round_robin": {}},
            ],
        }))
        .unwrap();

        assert_eq!(config.balancer_name.as_deref(), Some("cp.example.com:443"));
        assert_eq!(config.child_policy.as_ref().unwrap().name, "round_robin");
        let fallback = config.fallback_policy.unwrap();
        assert_eq!(fallback.name, "pick_first");
        assert_eq!(fallback.config, json!({"shuffleAddressList": true}));
    }

    #[test]
    fn unsatisfiable_list_is_rejected() {
        pick_first::reg();
        let err = parse_value(json!({
            "childPolicy": [{"no_such_policy": {}}],
            "fallbackPolicy": [{"pick_first": {}}],
        }))
        .unwrap_err();
        assert!(matches!(err, Error::ConfigUnsatisfiable("childPolicy")));
    }

    #[test]
    fn reparsing_selects_the_same_pair() {
        pick_first::reg();
        round_robin::reg();
        let blob = json!({
            "childPolicy": [{"round_robin": {}}, {"pick_first": {}}],
            "fallbackPolicy": [{"pick_first": {}}],
        });
        let first = parse_value(blob.clone()).unwrap();
        let second = parse_value(blob).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn single_policy_without_balancer_name() {
        pick_first::reg();
        let config = parse_value(json!({
            "childPolicy": [{"pick_first": {}}],
        }))
        .unwrap();
        assert!(config.balancer_name.is_none());
        assert_eq!(config.child_policy.unwrap().name, "pick_first");
        assert!(config.fallback_policy.is_none());
    }
}
