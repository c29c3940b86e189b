//! Typed server settings and their `postgresql.conf` rendering.

/// Server configuration parameters managed by the harness.
///
/// Every field is optional; [`merge`](Self::merge) lets a later value win for
/// the keys it sets while leaving the others alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSettings {
    /// TCP port the server listens on.
    pub port: Option<u16>,
    /// Maximum number of concurrent connections.
    pub max_connections: Option<u32>,
    /// Shared buffer size, in the server's native units.
    pub shared_buffers: Option<String>,
    /// Addresses the server binds.
    pub listen_addresses: Option<String>,
    /// Where server log output goes.
    pub log_destination: Option<String>,
    /// Minimum severity written to the server log.
    pub log_min_messages: Option<String>,
    /// Directories for the server's Unix-domain sockets.
    pub unix_socket_directories: Option<String>,
}

impl ServerSettings {
    /// The fixed settings every test cluster runs with, minus the port.
    #[must_use]
    pub fn test_defaults() -> Self {
        Self {
            port: None,
            max_connections: Some(16),
            shared_buffers: Some("64".to_owned()),
            listen_addresses: Some("localhost".to_owned()),
            log_destination: Some("stderr".to_owned()),
            log_min_messages: Some("FATAL".to_owned()),
            unix_socket_directories: None,
        }
    }

    /// [`test_defaults`](Self::test_defaults) with `port` filled in.
    #[must_use]
    pub fn for_test_cluster(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::test_defaults()
        }
    }

    /// Overwrites every key that `overrides` sets.
    pub fn merge(&mut self, overrides: &Self) {
        fn take<T: Clone>(slot: &mut Option<T>, value: Option<&T>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }
        take(&mut self.port, overrides.port.as_ref());
        take(&mut self.max_connections, overrides.max_connections.as_ref());
        take(&mut self.shared_buffers, overrides.shared_buffers.as_ref());
        take(&mut self.listen_addresses, overrides.listen_addresses.as_ref());
        take(&mut self.log_destination, overrides.log_destination.as_ref());
        take(&mut self.log_min_messages, overrides.log_min_messages.as_ref());
        take(
            &mut self.unix_socket_directories,
            overrides.unix_socket_directories.as_ref(),
        );
    }

    /// The keys that are set, as `(name, value)` pairs in a stable order.
    #[must_use]
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::with_capacity(7);
        if let Some(port) = self.port {
            out.push(("port", port.to_string()));
        }
        if let Some(max) = self.max_connections {
            out.push(("max_connections", max.to_string()));
        }
        let strings = [
            ("shared_buffers", &self.shared_buffers),
            ("listen_addresses", &self.listen_addresses),
            ("log_destination", &self.log_destination),
            ("log_min_messages", &self.log_min_messages),
            ("unix_socket_directories", &self.unix_socket_directories),
        ];
        for (key, value) in strings {
            if let Some(v) = value {
                out.push((key, v.clone()));
            }
        }
        out
    }
}

const MANAGED_MARKER: &str = "# settings managed by pg-test-cluster";

/// Rewrites a `postgresql.conf` body so `entries` take effect.
///
/// Active assignments of the same keys are removed and the new values are
/// appended under a marker comment. Comments and unrelated keys are kept.
#[must_use]
pub fn merge_conf(existing: &str, entries: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(existing.len() + 256);
    for line in existing.lines() {
        let assigned = assigned_key(line);
        let replaced = assigned.is_some_and(|key| entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(key)));
        if replaced || line == MANAGED_MARKER {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !entries.is_empty() {
        out.push_str(MANAGED_MARKER);
        out.push('\n');
        for (key, value) in entries {
            out.push_str(key);
            out.push_str(" = '");
            out.push_str(&value.replace('\'', "''"));
            out.push_str("'\n");
        }
    }
    out
}

/// Returns the key of an active `key = value` line.
fn assigned_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let end = trimmed.find(|c: char| c == '=' || c.is_whitespace())?;
    let key = trimmed.get(..end)?;
    (!key.is_empty()).then_some(key)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn probed_port_wins_over_caller_port() {
        let mut settings = ServerSettings {
            port: Some(5432),
            ..ServerSettings::default()
        };
        settings.merge(&ServerSettings::for_test_cluster(40123));
        let entries = settings.entries();
        assert_eq!(
            entries,
            vec![
                ("port", "40123".to_owned()),
                ("max_connections", "16".to_owned()),
                ("shared_buffers", "64".to_owned()),
                ("listen_addresses", "localhost".to_owned()),
                ("log_destination", "stderr".to_owned()),
                ("log_min_messages", "FATAL".to_owned()),
            ]
        );
    }

    #[rstest]
    fn unset_overrides_leave_values_alone() {
        let mut settings = ServerSettings::for_test_cluster(6000);
        settings.merge(&ServerSettings {
            log_min_messages: Some("WARNING".to_owned()),
            ..ServerSettings::default()
        });
        assert_eq!(settings.port, Some(6000));
        assert_eq!(settings.log_min_messages.as_deref(), Some("WARNING"));
        assert_eq!(settings.max_connections, Some(16));
    }

    #[rstest]
    fn merge_conf_replaces_active_assignments_only() {
        let conf = "#port = 5432\nport = 5432\nmax_connections=100\nshared_buffers = 128MB\n";
        let merged = merge_conf(conf, &[("port", "7000".to_owned()), ("max_connections", "16".to_owned())]);
        assert_eq!(
            merged,
            "#port = 5432\nshared_buffers = 128MB\n# settings managed by pg-test-cluster\nport = '7000'\nmax_connections = '16'\n"
        );
    }

    #[rstest]
    fn merge_conf_is_stable_across_repeated_merges() {
        let entries = ServerSettings::for_test_cluster(7001).entries();
        let once = merge_conf("", &entries);
        let twice = merge_conf(&once, &entries);
        assert_eq!(once, twice);
    }

    #[rstest]
    #[case("port = 1", Some("port"))]
    #[case("  listen_addresses='*'", Some("listen_addresses"))]
    #[case("# port = 1", None)]
    #[case("", None)]
    fn assigned_key_cases(#[case] line: &str, #[case] expected: Option<&str>) {
        assert_eq!(assigned_key(line), expected);
    }

    #[rstest]
    fn quotes_are_escaped() {
        let merged = merge_conf("", &[("log_destination", "it's".to_owned())]);
        assert!(merged.ends_with("log_destination = 'it''s'\n"));
    }
}
