use anyhow::{Context, Result};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{debug, warn};

/// Default location of the system service-name registry.
pub const DEFAULT_SERVICES_PATH: &str = "/etc/services";

/// Read-only port → service name table.
///
/// Built once at startup and shared behind an `Arc`; lookups never fail and
/// fall back to the decimal port number.
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    names: HashMap<u16, String>,
}

impl ServiceTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse `/etc/services` formatted content.
    ///
    /// Each line is `name port/protocol [aliases...]`, with everything after
    /// `#` ignored. Malformed lines are skipped. When a port appears with
    /// several protocols the first `tcp` entry wins.
    pub fn parse_str(s: &str) -> Self {
        let mut names: HashMap<u16, (String, bool)> = HashMap::new();

        for raw_line in s.lines() {
            let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
            let mut fields = line.split_whitespace();
            let (Some(name), Some(port_proto)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Some((port, proto)) = port_proto.split_once('/') else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };
            let is_tcp = proto.eq_ignore_ascii_case("tcp");

            match names.get(&port) {
                Some((_, true)) => {}
                Some((_, false)) if !is_tcp => {}
                _ => {
                    names.insert(port, (name.to_string(), is_tcp));
                }
            }
        }

        Self {
            names: names.into_iter().map(|(p, (n, _))| (p, n)).collect(),
        }
    }

    /// Load a services file. Errors if the file cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read services file: {}", path.as_ref().display()))?;
        Ok(Self::parse_str(&content))
    }

    /// Load a services file, or an empty table if it is unavailable.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        match Self::load(&path) {
            Ok(table) => {
                debug!(path = %path.as_ref().display(), entries = table.len(), "loaded service names");
                table
            }
            Err(e) => {
                warn!("service names unavailable, using port numbers: {e:#}");
                Self::empty()
            }
        }
    }

    pub fn resolve(&self, port: u16) -> Cow<'_, str> {
        match self.names.get(&port) {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(port.to_string()),
        }
    }

    /// Service name and port number of a socket address.
    pub fn resolve_addr(&self, addr: &SocketAddr) -> (Cow<'_, str>, u16) {
        (self.resolve(addr.port()), addr.port())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        # Network services, Internet style
        tcpmux          1/tcp                           # TCP port service multiplexer
        http            80/tcp          www www-http    # World Wide Web HTTP
        http            80/udp          www www-http
        pop3            110/tcp         pop-3
        imap            143/tcp         imap2
        syslog          514/udp
        shell           514/tcp         cmd
        bogus           notaport/tcp
        lonely
    "#;

    #[test]
    fn resolves_known_ports() {
        let t = ServiceTable::parse_str(SAMPLE);
        assert_eq!(t.resolve(80), "http");
        assert_eq!(t.resolve(110), "pop3");
        assert_eq!(t.resolve(143), "imap");
    }

    #[test]
    fn unknown_port_falls_back_to_number() {
        let t = ServiceTable::parse_str(SAMPLE);
        assert_eq!(t.resolve(49150), "49150");
    }

    #[test]
    fn tcp_entry_wins_over_udp() {
        let t = ServiceTable::parse_str(SAMPLE);
        assert_eq!(t.resolve(514), "shell");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let t = ServiceTable::parse_str(SAMPLE);
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn missing_file_degrades_to_numbers() {
        let t = ServiceTable::load_or_empty("/definitely/not/here/services");
        assert!(t.is_empty());
        assert_eq!(t.resolve(80), "80");
        assert!(ServiceTable::load("/definitely/not/here/services").is_err());
    }

    #[test]
    fn resolve_addr_returns_name_and_port() {
        let t = ServiceTable::parse_str(SAMPLE);
        let addr: SocketAddr = "127.0.0.1:110".parse().unwrap();
        let (name, port) = t.resolve_addr(&addr);
        assert_eq!(name, "pop3");
        assert_eq!(port, 110);
    }
}
