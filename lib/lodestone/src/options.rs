use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 2424;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Lowest server protocol revision accepted by default.
pub const DEFAULT_MIN_PROTOCOL: u16 = 28;

/// Storage model of a database target.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    Graph,
    Document,
}

impl DbKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DbKind::Graph => "graph",
            DbKind::Document => "document",
        }
    }
}

/// What the session authenticates against: the server itself (administrative
/// operations) or one database on it (record and command operations).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum Target {
    Server,
    Database { name: String, kind: DbKind },
}

impl Target {
    #[inline]
    pub fn is_database(&self) -> bool {
        matches!(self, Target::Database { .. })
    }

    pub fn scope_name(&self) -> &'static str {
        match self {
            Target::Server => "server",
            Target::Database { .. } => "database",
        }
    }
}

/// Transport tuning knobs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    pub nodelay: bool,
    /// Lower bound for the kernel send/receive buffer sizes; the session
    /// raises both to the max of the kernel values and this.
    pub buffer_size: usize,
}

impl Default for SocketOptions {
    fn default() -> SocketOptions {
        SocketOptions {
            nodelay: true,
            buffer_size: 65536,
        }
    }
}

/// Caller-supplied session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub timeout_ms: u64,
    /// Read from process configuration at connect time; kept as a field so
    /// the minimum is an explicit constructor input rather than a global.
    pub min_protocol: u16,
    /// Reconnect immediately after an unexpected disconnect.
    pub reconnect: bool,
    // Tables last so the TOML serializer emits plain values first.
    pub connection: Target,
    pub socket: SocketOptions,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            user: "admin".to_string(),
            password: "admin".to_string(),
            connection: Target::Server,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            min_protocol: DEFAULT_MIN_PROTOCOL,
            reconnect: false,
            socket: SocketOptions::default(),
        }
    }
}

impl Options {
    /// Loads the configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Options {
        serdeconv::from_toml_file(path).expect("Error loading connection configuration file")
    }

    /// Default per-call deadline.
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();

        assert_eq!(options.port, 2424);
        assert_eq!(options.timeout_ms, 5000);
        assert_eq!(options.min_protocol, 28);
        assert_eq!(options.connection, Target::Server);
        assert!(!options.reconnect);
        assert!(options.socket.nodelay);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut options = Options::default();
        options.connection = Target::Database {
            name: "tracker".to_string(),
            kind: DbKind::Graph,
        };

        let text = serdeconv::to_toml_string(&options).unwrap();
        let restored: Options = serdeconv::from_toml_str(&text).unwrap();

        assert_eq!(restored, options);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let restored: Options = serdeconv::from_toml_str(
            r#"
host = "db.internal"
port = 2425

[connection]
scope = "database"
name = "tracker"
kind = "document"
"#,
        )
        .unwrap();

        assert_eq!(restored.host, "db.internal");
        assert_eq!(restored.port, 2425);
        assert_eq!(restored.timeout_ms, 5000);
        assert!(restored.connection.is_database());
    }
}
