//! Minimal `~/.ssh/config` reader
//!
//! Only the keys tbot needs are understood. As with OpenSSH, the first
//! value obtained for a key wins.

use std::path::{Path, PathBuf};
use tbot_core::Result;
use tracing::debug;

/// Settings for one destination host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshHostConfig {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_files: Vec<PathBuf>,
    pub strict_host_key_checking: Option<bool>,
}

#[derive(Debug, Clone)]
struct HostBlock {
    patterns: Vec<String>,
    options: Vec<(String, String)>,
}

/// Parsed ssh configuration
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

impl SshConfig {
    pub fn parse(text: &str) -> Self {
        // options before the first Host line apply to every host
        let mut blocks = vec![HostBlock {
            patterns: vec!["*".to_string()],
            options: Vec::new(),
        }];
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(|c: char| c.is_whitespace() || c == '=') {
                Some((k, v)) => (k, v.trim_start_matches(|c: char| c.is_whitespace() || c == '=')),
                None => continue,
            };
            let key = key.to_lowercase();
            let value = value.trim().trim_matches('"').to_string();
            if key == "host" {
                blocks.push(HostBlock {
                    patterns: value.split_whitespace().map(str::to_string).collect(),
                    options: Vec::new(),
                });
            } else if let Some(block) = blocks.last_mut() {
                block.options.push((key, value));
            }
        }
        Self { blocks }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// `~/.ssh/config`, or an empty configuration if there is none
    pub fn load_default() -> Self {
        let Some(path) = dirs::home_dir().map(|h| h.join(".ssh").join("config")) else {
            return Self::default();
        };
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                debug!("no usable ssh config at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn lookup(&self, host: &str) -> SshHostConfig {
        let mut out = SshHostConfig::default();
        for block in self.blocks.iter().filter(|b| block_matches(&b.patterns, host)) {
            for (key, value) in &block.options {
                match key.as_str() {
                    "hostname" if out.hostname.is_none() => {
                        out.hostname = Some(value.replace("%h", host))
                    }
                    "user" if out.user.is_none() => out.user = Some(value.clone()),
                    "port" if out.port.is_none() => out.port = value.parse().ok(),
                    "identityfile" => out.identity_files.push(expand_home(value)),
                    "stricthostkeychecking" if out.strict_host_key_checking.is_none() => {
                        out.strict_host_key_checking =
                            Some(!matches!(value.to_lowercase().as_str(), "no" | "off"))
                    }
                    _ => {}
                }
            }
        }
        out
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

fn block_matches(patterns: &[String], host: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if wildcard_match(negated.as_bytes(), host.as_bytes()) {
                return false;
            }
        } else if wildcard_match(pattern.as_bytes(), host.as_bytes()) {
            matched = true;
        }
    }
    matched
}

/// `*` and `?` matching as used in `Host` lines
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|i| wildcard_match(rest, &text[i..])),
        Some((b'?', rest)) => !text.is_empty() && wildcard_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && wildcard_match(rest, &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
# lab gateway
User fallback

Host lab lab-*
    HostName lab.example.com
    Port 2222
    IdentityFile /keys/lab

Host *.board !bad.board
    User root
    StrictHostKeyChecking no

Host *
    User nobody
    Port 22
"#;

    #[test]
    fn test_first_value_wins() {
        let config = SshConfig::parse(CONFIG);
        let lab = config.lookup("lab");
        assert_eq!(lab.hostname.as_deref(), Some("lab.example.com"));
        assert_eq!(lab.port, Some(2222));
        // the global option came first
        assert_eq!(lab.user.as_deref(), Some("fallback"));
        assert_eq!(lab.identity_files, vec![PathBuf::from("/keys/lab")]);
    }

    #[test]
    fn test_wildcards_and_negation() {
        let config = SshConfig::parse(CONFIG);
        let board = config.lookup("rpi.board");
        assert_eq!(board.strict_host_key_checking, Some(false));
        assert_eq!(board.hostname, None);

        let bad = config.lookup("bad.board");
        assert_eq!(bad.strict_host_key_checking, None);
        assert_eq!(bad.port, Some(22));

        assert!(config.lookup("lab-3").hostname.is_some());
        assert!(config.lookup("lab3").hostname.is_none());
    }

    #[test]
    fn test_equals_syntax() {
        let config = SshConfig::parse("Host x\n  Port=2200\n  HostName = 10.0.0.2\n");
        let x = config.lookup("x");
        assert_eq!(x.port, Some(2200));
        assert_eq!(x.hostname.as_deref(), Some("10.0.0.2"));
    }
}
