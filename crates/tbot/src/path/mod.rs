//! Paths on a Linux host
//!
//! A [`Path`] is a POSIX path string bound to the [`LinuxHost`] it lives
//! on. Passing it to a command on a different host fails with
//! [`TbotError::WrongHost`]. Filesystem queries run as shell commands on
//! the owning host.

pub mod copy;
pub mod workdir;

pub use copy::{CopyOptions, copy, copy_with};
pub use workdir::Workdir;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::ops::Div;
use tbot_core::{Result, TbotError};

use crate::machine::{Machine, MachineHandle};
use crate::shell::{Arg, LinuxHost, Special, quote, quote_glob};

const BASE64_LINE: usize = 76;

/// Result of `stat` on the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
}

impl Stat {
    const S_IFMT: u32 = 0o170000;

    pub fn is_dir(&self) -> bool {
        self.mode & Self::S_IFMT == 0o040000
    }

    pub fn is_file(&self) -> bool {
        self.mode & Self::S_IFMT == 0o100000
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & Self::S_IFMT == 0o120000
    }

    pub fn is_fifo(&self) -> bool {
        self.mode & Self::S_IFMT == 0o010000
    }

    pub fn is_char_device(&self) -> bool {
        self.mode & Self::S_IFMT == 0o020000
    }

    pub fn is_block_device(&self) -> bool {
        self.mode & Self::S_IFMT == 0o060000
    }

    pub fn is_socket(&self) -> bool {
        self.mode & Self::S_IFMT == 0o140000
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    fn parse(text: &str) -> Option<Self> {
        let mut fields = text.split_whitespace();
        Some(Self {
            mode: u32::from_str_radix(fields.next()?, 16).ok()?,
            size: fields.next()?.parse().ok()?,
            uid: fields.next()?.parse().ok()?,
            gid: fields.next()?.parse().ok()?,
            mtime: fields.next()?.parse().ok()?,
        })
    }
}

/// Collapse `.`, repeated and trailing slashes; `..` is kept
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    match (absolute, parts.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", parts.join("/")),
        (false, true) => ".".to_string(),
        (false, false) => parts.join("/"),
    }
}

/// A path on a specific host
#[derive(Clone)]
pub struct Path {
    host: LinuxHost,
    path: String,
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.name(), self.path)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.path == other.path
    }
}

impl Path {
    pub fn new(host: LinuxHost, path: impl Into<String>) -> Self {
        Self {
            host,
            path: normalize(&path.into()),
        }
    }

    pub fn host(&self) -> &LinuxHost {
        &self.host
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// The path string, if this path belongs to `machine`
    pub(crate) fn checked_str(&self, machine: &Machine) -> Result<&str> {
        if self.host.machine() == machine {
            Ok(&self.path)
        } else {
            Err(TbotError::WrongHost {
                path: self.path.clone(),
                expected: machine.name().to_string(),
                actual: self.host.name().to_string(),
            })
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.path.starts_with('/')
    }

    /// Append `segment`; an absolute segment replaces the path
    pub fn join(&self, segment: &str) -> Path {
        let joined = if segment.starts_with('/') {
            segment.to_string()
        } else {
            format!("{}/{}", self.path, segment)
        };
        Path::new(self.host.clone(), joined)
    }

    /// Final component
    pub fn name(&self) -> &str {
        match self.path.rsplit_once('/') {
            Some((_, name)) => name,
            None if self.path == "." => "",
            None => &self.path,
        }
    }

    pub fn stem(&self) -> &str {
        let name = self.name();
        match name.rfind('.') {
            Some(0) | None => name,
            Some(dot) => &name[..dot],
        }
    }

    /// Extension including the dot, or empty
    pub fn suffix(&self) -> &str {
        let name = self.name();
        match name.rfind('.') {
            Some(0) | None => "",
            Some(dot) => &name[dot..],
        }
    }

    pub fn with_name(&self, name: &str) -> Path {
        self.parent().join(name)
    }

    pub fn with_suffix(&self, suffix: &str) -> Path {
        self.with_name(&format!("{}{}", self.stem(), suffix))
    }

    pub fn parent(&self) -> Path {
        let parent = match self.path.rsplit_once('/') {
            Some(("", _)) => "/",
            Some((parent, _)) => parent,
            None => ".",
        };
        Path::new(self.host.clone(), parent)
    }

    /// All ancestors, nearest first
    pub fn parents(&self) -> Vec<Path> {
        let mut out = Vec::new();
        let mut current = self.clone();
        loop {
            let parent = current.parent();
            if parent.path == current.path {
                break;
            }
            out.push(parent.clone());
            current = parent;
        }
        out
    }

    fn test_flag(&self, flag: &str) -> Result<bool> {
        self.host.test(&crate::args!["test", flag, self])
    }

    pub fn exists(&self) -> Result<bool> {
        self.test_flag("-e")
    }

    pub fn is_dir(&self) -> Result<bool> {
        self.test_flag("-d")
    }

    pub fn is_file(&self) -> Result<bool> {
        self.test_flag("-f")
    }

    pub fn is_symlink(&self) -> Result<bool> {
        self.test_flag("-h")
    }

    pub fn is_fifo(&self) -> Result<bool> {
        self.test_flag("-p")
    }

    pub fn is_block_device(&self) -> Result<bool> {
        self.test_flag("-b")
    }

    pub fn is_char_device(&self) -> Result<bool> {
        self.test_flag("-c")
    }

    pub fn is_socket(&self) -> Result<bool> {
        self.test_flag("-S")
    }

    pub fn stat(&self) -> Result<Stat> {
        let out = self
            .host
            .exec0(&crate::args!["stat", "-L", "-c", "%f %s %u %g %Y", self])?;
        Stat::parse(&out).ok_or_else(|| {
            TbotError::internal(format!("unexpected stat output for {}: {:?}", self.path, out))
        })
    }

    /// The link target as stored, relative targets are not resolved
    pub fn readlink(&self) -> Result<Path> {
        let out = self.host.exec0(&crate::args!["readlink", self])?;
        Ok(Path::new(self.host.clone(), out.trim_end_matches('\n')))
    }

    pub fn mkdir(&self, parents: bool, exist_ok: bool) -> Result<()> {
        if self.is_dir()? {
            if exist_ok {
                return Ok(());
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", self.path),
            )
            .into());
        }
        let mut args = crate::args!["mkdir"];
        if parents {
            args.push("-p".into());
        }
        args.push(self.into());
        self.host.exec0(&args)?;
        Ok(())
    }

    pub fn rmdir(&self) -> Result<()> {
        self.host.exec0(&crate::args!["rmdir", self])?;
        Ok(())
    }

    pub fn unlink(&self, missing_ok: bool) -> Result<()> {
        let flag = if missing_ok { "-f" } else { "--" };
        self.host.exec0(&crate::args!["rm", flag, self])?;
        Ok(())
    }

    /// Turn this path into a symlink pointing at `target`
    pub fn symlink_to(&self, target: &str) -> Result<()> {
        self.host.exec0(&crate::args!["ln", "-s", target, self])?;
        Ok(())
    }

    pub fn touch(&self) -> Result<()> {
        self.host.exec0(&crate::args!["touch", self])?;
        Ok(())
    }

    pub fn read_text(&self) -> Result<String> {
        self.host.exec0(&crate::args!["cat", self])
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let out = self.host.exec0(&crate::args!["base64", self])?;
        let encoded: String = out.chars().filter(|c| !c.is_whitespace()).collect();
        STANDARD
            .decode(encoded)
            .map_err(|e| TbotError::internal(format!("base64 from {}: {}", self.host.name(), e)))
    }

    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let encoded = STANDARD.encode(data);
        let mut proxy = self
            .host
            .run(&crate::args!["base64", "-d", Special::RedirStdout(self.clone())])?;
        for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
            proxy.send(chunk)?;
            proxy.send("\n")?;
        }
        proxy.sendeof()?;
        proxy.terminate0()?;
        Ok(())
    }

    pub fn write_text(&self, text: &str) -> Result<()> {
        self.write_bytes(text.as_bytes())
    }

    /// Entries matching a shell glob below this directory
    pub fn glob(&self, pattern: &str) -> Result<Vec<Path>> {
        let script = format!(
            "for f in {}/{}; do if [ -e \"$f\" ] || [ -h \"$f\" ]; then printf '%s\\n' \"$f\"; fi; done",
            quote(&self.path),
            quote_glob(pattern)
        );
        let out = self.host.exec0(&[Arg::Special(Special::Raw(script))])?;
        Ok(self.lines_to_paths(&out))
    }

    /// Entries matching `pattern` anywhere below this directory
    pub fn rglob(&self, pattern: &str) -> Result<Vec<Path>> {
        let out = self
            .host
            .exec0(&crate::args!["find", self, "-name", pattern])?;
        Ok(self.lines_to_paths(&out))
    }

    fn lines_to_paths(&self, out: &str) -> Vec<Path> {
        out.lines()
            .filter(|l| !l.is_empty())
            .map(|l| Path::new(self.host.clone(), l))
            .collect()
    }
}

impl Div<&str> for &Path {
    type Output = Path;

    fn div(self, rhs: &str) -> Path {
        self.join(rhs)
    }
}

impl Div<&str> for Path {
    type Output = Path;

    fn div(self, rhs: &str) -> Path {
        self.join(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::NullConnector;
    use crate::machine::MachineBuilder;
    use crate::shell::Bash;

    fn host(name: &str) -> LinuxHost {
        LinuxHost::new(MachineBuilder::new(name).connector(NullConnector), Bash)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a//b/./c/"), "/a/b/c");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("a/../b"), "a/../b");
        assert_eq!(normalize(""), ".");
    }

    #[test]
    fn test_purepath_operations() {
        let h = host("h");
        let p = h.path("/srv/images/rootfs.tar.gz");
        assert_eq!(p.name(), "rootfs.tar.gz");
        assert_eq!(p.suffix(), ".gz");
        assert_eq!(p.stem(), "rootfs.tar");
        assert_eq!(p.parent().as_str(), "/srv/images");
        assert_eq!(p.with_suffix(".img").as_str(), "/srv/images/rootfs.tar.img");
        let parents: Vec<String> = p.parents().iter().map(|p| p.to_string()).collect();
        assert_eq!(parents, ["/srv/images", "/srv", "/"]);
        assert_eq!((&h.fsroot() / "etc" / "hosts").as_str(), "/etc/hosts");
        assert_eq!(p.join("/abs").as_str(), "/abs");
        assert_eq!(h.path(".bashrc").suffix(), "");
    }

    #[test]
    fn test_escape_rejects_foreign_paths() {
        let a = host("a");
        let b = host("b");
        let p = a.path("/tmp/x");
        assert_eq!(a.escape(&crate::args!["cat", &p]).unwrap(), "cat /tmp/x");
        let err = b.escape(&crate::args!["cat", &p]).unwrap_err();
        assert!(matches!(err, TbotError::WrongHost { .. }));
        let err = b
            .escape(&[Special::RedirStdout(p.clone()).into()])
            .unwrap_err();
        assert!(matches!(err, TbotError::WrongHost { .. }));
    }

    #[test]
    fn test_equality_uses_host_identity() {
        let a = host("same");
        let b = host("same");
        assert_eq!(a.path("/x"), a.path("/x/"));
        assert_ne!(a.path("/x"), b.path("/x"));
    }

    #[test]
    fn test_stat_parse() {
        let s = Stat::parse("41ed 4096 0 0 1700000000\n").unwrap();
        assert!(s.is_dir());
        assert_eq!(s.permissions(), 0o755);
        let f = Stat::parse("81a4 12 1000 1000 1700000000").unwrap();
        assert!(f.is_file());
        assert_eq!(f.size, 12);
        assert!(Stat::parse("garbage").is_none());
    }
}
