use crate::core::{Document, Result, RunnerError};
use crate::service::ServerInfo;
use semver::Version;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerlessRequirement {
    Require,
    Forbid,
    Allow,
}

/// One `runOnRequirements` entry; every stated condition must hold.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunOnRequirement {
    pub min_server_version: Option<String>,
    pub max_server_version: Option<String>,
    pub topologies: Option<Vec<String>>,
    pub serverless: Option<ServerlessRequirement>,
    pub auth: Option<bool>,
    pub csfle: Option<bool>,
    /// Server parameters are not modelled; naming any makes the entry unmet.
    pub server_parameters: Option<Document>,
}

/// Parse a server version such as `4.2` or `7.0.1` into semver.
pub fn parse_server_version(text: &str) -> Result<Version> {
    let mut parts = text
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| RunnerError::format(format!("Invalid server version '{}'", text)))
        })
        .collect::<Result<Vec<u64>>>()?;
    if parts.is_empty() || parts.len() > 3 {
        return Err(RunnerError::format(format!("Invalid server version '{}'", text)));
    }
    parts.resize(3, 0);
    Ok(Version::new(parts[0], parts[1], parts[2]))
}

impl RunOnRequirement {
    /// `None` when met, otherwise the reason it is not.
    pub fn unmet_reason(&self, info: &ServerInfo) -> Result<Option<String>> {
        if let Some(min) = &self.min_server_version {
            if info.version < parse_server_version(min)? {
                return Ok(Some(format!("server version {} is below {}", info.version, min)));
            }
        }
        if let Some(max) = &self.max_server_version {
            // A bare major.minor maximum covers every patch release.
            let mut limit = parse_server_version(max)?;
            if max.split('.').count() < 3 {
                limit.patch = u64::MAX;
            }
            if info.version > limit {
                return Ok(Some(format!("server version {} is above {}", info.version, max)));
            }
        }
        if let Some(topologies) = &self.topologies {
            let actual = info.topology.as_str();
            let matched = topologies.iter().any(|t| {
                t == actual || (t == "sharded" && actual == "sharded-replicaset")
            });
            if !matched {
                return Ok(Some(format!("topology {} not in {:?}", actual, topologies)));
            }
        }
        match self.serverless {
            Some(ServerlessRequirement::Require) if !info.serverless => {
                return Ok(Some("requires a serverless deployment".to_string()));
            }
            Some(ServerlessRequirement::Forbid) if info.serverless => {
                return Ok(Some("forbids a serverless deployment".to_string()));
            }
            _ => {}
        }
        if let Some(auth) = self.auth {
            if auth != info.auth {
                return Ok(Some(format!("requires auth={}", auth)));
            }
        }
        if let Some(csfle) = self.csfle {
            if csfle != info.csfle {
                return Ok(Some(format!("requires csfle={}", csfle)));
            }
        }
        if let Some(parameters) = &self.server_parameters {
            if !parameters.is_empty() {
                return Ok(Some("server parameters cannot be checked".to_string()));
            }
        }
        Ok(None)
    }
}

/// A requirement list is met when any entry is; an empty list always is.
pub fn unmet_reason(
    requirements: &[RunOnRequirement],
    info: &ServerInfo,
) -> Result<Option<String>> {
    if requirements.is_empty() {
        return Ok(None);
    }
    let mut reasons = Vec::with_capacity(requirements.len());
    for requirement in requirements {
        match requirement.unmet_reason(info)? {
            None => return Ok(None),
            Some(reason) => reasons.push(reason),
        }
    }
    Ok(Some(reasons.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Topology;
    use serde_json::json;

    fn requirement(value: serde_json::Value) -> RunOnRequirement {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_versions_pad_to_semver() {
        assert_eq!(parse_server_version("4.2").unwrap(), Version::new(4, 2, 0));
        assert_eq!(parse_server_version("7.0.1").unwrap(), Version::new(7, 0, 1));
        assert!(parse_server_version("seven").is_err());
    }

    #[test]
    fn test_version_bounds() {
        let info = ServerInfo::default().version(Version::new(7, 0, 3));
        assert!(requirement(json!({"minServerVersion": "4.0"})).unmet_reason(&info).unwrap().is_none());
        assert!(requirement(json!({"minServerVersion": "8.0"})).unmet_reason(&info).unwrap().is_some());
        assert!(requirement(json!({"maxServerVersion": "7.0"})).unmet_reason(&info).unwrap().is_none());
        assert!(requirement(json!({"maxServerVersion": "6.0.99"})).unmet_reason(&info).unwrap().is_some());
    }

    #[test]
    fn test_any_entry_suffices() {
        let info = ServerInfo::default().topology(Topology::Single);
        let list = vec![
            requirement(json!({"topologies": ["replicaset"]})),
            requirement(json!({"topologies": ["single"], "serverless": "forbid"})),
        ];
        assert!(unmet_reason(&list, &info).unwrap().is_none());
        assert!(unmet_reason(&list[..1], &info).unwrap().is_some());
        assert!(unmet_reason(&[], &info).unwrap().is_none());
    }
}
