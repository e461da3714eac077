//! Daemon configuration.
//!
//! The config file lists on-demand services, one per line: the service name
//! followed by the program and its arguments. Tokens are separated by
//! whitespace; double quotes group a token that contains whitespace.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use a314_wire::DAEMON_PORT;

/// Default location of the on-demand service table.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/opt/a314/a314d.conf";

/// How long a shutting-down daemon keeps servicing interrupts while
/// channels drain their outbound queues.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One on-demand service entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnDemandService {
    pub service_name: String,
    /// Program to execute.
    pub program: String,
    /// Full argument vector; `argv[0]` is the program token itself.
    pub argv: Vec<String>,
}

/// Runtime configuration for [`Daemon`](crate::Daemon).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Address the client listener binds to.
    pub listen_addr: SocketAddr,
    /// On-demand service table from the config file.
    pub on_demand: Vec<OnDemandService>,
    /// Shutdown drain budget.
    pub drain_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DAEMON_PORT)),
            on_demand: Vec::new(),
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

/// Split one config line into tokens.
///
/// Whitespace separates tokens unless inside double quotes; a quote always
/// terminates the current token, and a quoted token may be empty. An
/// unterminated quote runs to the end of the line.
fn split_line(line: &str) -> Vec<String> {
    let bytes = line.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut in_quotes = false;

    for (i, &b) in bytes.iter().enumerate() {
        if b == b'"' {
            if in_quotes {
                parts.push(line[start..i].to_string());
            }
            in_quotes = !in_quotes;
            start = i + 1;
        } else if b.is_ascii_whitespace() && !in_quotes {
            if start < i {
                parts.push(line[start..i].to_string());
            }
            start = i + 1;
        }
    }
    if start < bytes.len() {
        parts.push(line[start..].to_string());
    }
    parts
}

/// Parse config text into on-demand entries.
pub fn parse_config(text: &str) -> Vec<OnDemandService> {
    let mut entries = Vec::new();

    for line in text.lines() {
        let parts = split_line(line);
        if parts.len() >= 2 {
            entries.push(OnDemandService {
                service_name: parts[0].clone(),
                program: parts[1].clone(),
                argv: parts[1..].to_vec(),
            });
        } else if !parts.is_empty() {
            tracing::warn!(line, "config line does not name a service and a program");
        }
    }

    entries
}

/// Load the config file. A missing or unreadable file yields an empty
/// service table.
pub fn load_config_file(path: &Path) -> Vec<OnDemandService> {
    let entries = match std::fs::read(path) {
        Ok(bytes) => parse_config(&String::from_utf8_lossy(&bytes)),
        Err(error) => {
            tracing::debug!(path = %path.display(), %error, "config file not loaded");
            Vec::new()
        }
    };

    if entries.is_empty() {
        tracing::warn!(path = %path.display(), "no on-demand services configured");
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(split_line("picmd /opt/a314/picmd.py"), vec![
            "picmd",
            "/opt/a314/picmd.py"
        ]);
        assert_eq!(split_line("  a \t b  "), vec!["a", "b"]);
        assert!(split_line("").is_empty());
        assert!(split_line("   \t ").is_empty());
    }

    #[test]
    fn quotes_group_whitespace() {
        assert_eq!(split_line(r#"svc "/usr/local/my prog" --flag"#), vec![
            "svc",
            "/usr/local/my prog",
            "--flag"
        ]);
        assert_eq!(split_line(r#"svc """#), vec!["svc", ""]);
    }

    #[test]
    fn unterminated_quote_runs_to_line_end() {
        assert_eq!(split_line(r#"svc "prog with space"#), vec![
            "svc",
            "prog with space"
        ]);
    }

    #[test]
    fn entries_carry_program_as_argv0() {
        let entries = parse_config("picmd /opt/a314/picmd.py --verbose\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].service_name, "picmd");
        assert_eq!(entries[0].program, "/opt/a314/picmd.py");
        assert_eq!(entries[0].argv, vec!["/opt/a314/picmd.py", "--verbose"]);
    }

    #[test]
    fn single_token_lines_are_dropped() {
        let entries = parse_config("lonely\n\nsvc prog\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].service_name, "svc");
    }

    #[test]
    fn missing_file_is_tolerated() {
        let entries = load_config_file(Path::new("/nonexistent/a314d.conf"));
        assert!(entries.is_empty());
    }

    #[test]
    fn default_config_listens_on_the_wired_port() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.listen_addr.port(), DAEMON_PORT);
        assert_eq!(cfg.drain_timeout, Duration::from_secs(10));
    }
}
