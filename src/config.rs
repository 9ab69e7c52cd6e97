use crate::{Result, SniffError};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_LOCAL_TCPDUMP_PATH: &str = "/tcpdump-static";
pub const DEFAULT_REMOTE_TCPDUMP_PATH: &str = "/tmp/static-tcpdump";
pub const DEFAULT_INTERFACE: &str = "any";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_VIEWER: &[&str] = &["wireshark", "-k", "-i", "-"];

/// Per-invocation settings for a capture session.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    pub local_binary_path: PathBuf,
    pub remote_binary_path: String,
    pub filter: String,
    pub interface: String,
    /// Bounds channel establishment only; live streams are never timed out.
    pub connect_timeout: Duration,
    pub viewer: Vec<String>,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            local_binary_path: PathBuf::from(DEFAULT_LOCAL_TCPDUMP_PATH),
            remote_binary_path: DEFAULT_REMOTE_TCPDUMP_PATH.to_string(),
            filter: String::new(),
            interface: DEFAULT_INTERFACE.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            viewer: DEFAULT_VIEWER.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SniffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.local_binary_path.as_os_str().is_empty() {
            return Err(SniffError::Config(
                "local tcpdump path must not be empty".to_string(),
            ));
        }

        let remote = Path::new(&self.remote_binary_path);
        if !remote.is_absolute() || remote.file_name().is_none() {
            return Err(SniffError::Config(format!(
                "remote tcpdump path must be an absolute file path, got '{}'",
                self.remote_binary_path
            )));
        }

        if self.interface.trim().is_empty() {
            return Err(SniffError::Config(
                "capture interface must not be empty".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(SniffError::Config(
                "connect timeout must be greater than zero".to_string(),
            ));
        }

        if self.viewer.is_empty() {
            return Err(SniffError::Config(
                "viewer command must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Argv for the remote capture: unbuffered pcap on stdout, filter last.
    pub fn capture_argv(&self) -> Vec<String> {
        let mut argv = vec![
            self.remote_binary_path.clone(),
            "-i".to_string(),
            self.interface.clone(),
            "-U".to_string(),
            "-w".to_string(),
            "-".to_string(),
        ];

        let filter = self.filter.trim();
        if !filter.is_empty() {
            argv.push(filter.to_string());
        }

        argv
    }

    pub fn probe_argv(&self) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("ls -alt {}", shell_quote(&self.remote_binary_path)),
        ]
    }
}

/// Single-quotes `word` for `sh -c`, escaping embedded single quotes.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SniffConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.viewer, vec!["wireshark", "-k", "-i", "-"]);
    }

    #[test]
    fn test_capture_argv_without_filter() {
        let config = SniffConfig::default();
        assert_eq!(
            config.capture_argv(),
            vec!["/tmp/static-tcpdump", "-i", "any", "-U", "-w", "-"]
        );
    }

    #[test]
    fn test_capture_argv_appends_filter_as_single_argument() {
        let config = SniffConfig {
            filter: " port 80 and host 10.0.0.5 ".to_string(),
            ..Default::default()
        };

        let argv = config.capture_argv();
        assert_eq!(argv.last().unwrap(), "port 80 and host 10.0.0.5");
        assert_eq!(argv.len(), 7);
    }

    #[test]
    fn test_relative_remote_path_rejected() {
        let config = SniffConfig {
            remote_binary_path: "tmp/tcpdump".to_string(),
            ..Default::default()
        };

        assert!(matches!(config.validate(), Err(SniffError::Config(_))));
    }

    #[test]
    fn test_probe_quotes_remote_path() {
        let config = SniffConfig {
            remote_binary_path: "/opt/it's here/tcpdump; rm -rf /".to_string(),
            ..Default::default()
        };

        assert_eq!(
            config.probe_argv(),
            vec![
                "/bin/sh",
                "-c",
                r"ls -alt '/opt/it'\''s here/tcpdump; rm -rf /'"
            ]
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = SniffConfig {
            connect_timeout: Duration::ZERO,
            ..Default::default()
        };

        assert!(matches!(config.validate(), Err(SniffError::Config(_))));
    }
}
