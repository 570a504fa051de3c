use semver::Version;
use std::time::Duration;

/// Commands never captured, whatever a client observes.
pub const DEFAULT_IGNORED_COMMANDS: &[&str] = &[
    "authenticate",
    "buildInfo",
    "configureFailPoint",
    "getLastError",
    "getnonce",
    "hello",
    "isMaster",
    "killAllSessions",
    "saslContinue",
    "saslStart",
];

/// Scenario runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Oldest schema version accepted
    pub min_schema_version: Version,

    /// Newest schema version accepted
    pub max_schema_version: Version,

    /// How long `waitForEvent` and blocking change-stream iteration may wait
    pub wait_timeout: Duration,

    /// Poll interval while waiting for events
    pub poll_interval: Duration,

    /// Command names excluded from every event capturer
    pub ignored_commands: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            min_schema_version: Version::new(1, 0, 0),
            max_schema_version: Version::new(1, 27, 0),
            wait_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            ignored_commands: DEFAULT_IGNORED_COMMANDS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the accepted schema-version range (inclusive)
    pub fn schema_versions(mut self, min: Version, max: Version) -> Self {
        self.min_schema_version = min;
        self.max_schema_version = max;
        self
    }

    /// Set the wait timeout
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set the poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Exclude one more command from capture
    pub fn ignore_command(mut self, command_name: &str) -> Self {
        self.ignored_commands.push(command_name.to_string());
        self
    }

    /// True if `version` lies within the supported range.
    pub fn supports_schema(&self, version: &Version) -> bool {
        *version >= self.min_schema_version && *version <= self.max_schema_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schema_range() {
        let config = RunnerConfig::default();
        assert!(config.supports_schema(&Version::new(1, 0, 0)));
        assert!(config.supports_schema(&Version::new(1, 27, 0)));
        assert!(!config.supports_schema(&Version::new(2, 0, 0)));
        assert!(config.ignored_commands.iter().any(|c| c == "configureFailPoint"));
    }

    #[test]
    fn test_builder_setters() {
        let config = RunnerConfig::new()
            .wait_timeout(Duration::from_secs(1))
            .ignore_command("ping");
        assert_eq!(config.wait_timeout, Duration::from_secs(1));
        assert!(config.ignored_commands.iter().any(|c| c == "ping"));
    }
}
