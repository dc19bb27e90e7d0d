//! Mount specifications and the mount engine.
//!
//! A [`MountSpec`] round-trips through the textual form
//! `source:target[:options]` so it can ride in argv across the
//! re-exec boundary. Canonicalization of the paths happens only in
//! [`MountSpec::normalize`], just before use: the same spec string must
//! mean the same thing whether it is parsed outside or inside the new
//! mount namespace.

use crate::config::types::{Config, LauncherError, Result};
use nix::mount::{mount, MsFlags};
use std::fmt;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

/// Flags applied when a spec carries no options: the moral equivalent of
/// `mount --rbind --make-private`.
pub const DEFAULT_MOUNT_FLAGS: MsFlags = MsFlags::MS_BIND
    .union(MsFlags::MS_REC)
    .union(MsFlags::MS_PRIVATE);

/// Option tokens accepted in the third field of a mount spec, in the
/// order they are emitted during serialization.
pub const KNOWN_OPTIONS: &[(&str, MsFlags)] = &[
    ("dirsync", MsFlags::MS_DIRSYNC),
    ("mandlock", MsFlags::MS_MANDLOCK),
    ("noatime", MsFlags::MS_NOATIME),
    ("nodev", MsFlags::MS_NODEV),
    ("nodiratime", MsFlags::MS_NODIRATIME),
    ("noexec", MsFlags::MS_NOEXEC),
    ("nosuid", MsFlags::MS_NOSUID),
    ("ro", MsFlags::MS_RDONLY),
    ("recursive", MsFlags::MS_REC),
    ("relatime", MsFlags::MS_RELATIME),
    ("silent", MsFlags::MS_SILENT),
    ("strictatime", MsFlags::MS_STRICTATIME),
    ("sync", MsFlags::MS_SYNCHRONOUS),
    ("remount", MsFlags::MS_REMOUNT),
    ("bind", MsFlags::MS_BIND),
    ("shared", MsFlags::MS_SHARED),
    ("private", MsFlags::MS_PRIVATE),
    ("slave", MsFlags::MS_SLAVE),
    ("unbindable", MsFlags::MS_UNBINDABLE),
    ("move", MsFlags::MS_MOVE),
];

/// Attributes that apply per mount point rather than per filesystem;
/// the set a bind-remount is allowed to change.
const BIND_ATTR_FLAGS: MsFlags = MsFlags::MS_RDONLY
    .union(MsFlags::MS_NOSUID)
    .union(MsFlags::MS_NODEV)
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_NOATIME)
    .union(MsFlags::MS_NODIRATIME)
    .union(MsFlags::MS_RELATIME)
    .union(MsFlags::MS_STRICTATIME);

fn lookup_option(token: &str) -> Option<MsFlags> {
    KNOWN_OPTIONS
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, flags)| *flags)
}

/// One desired mount operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountSpec {
    /// Filesystem source; empty for mounts that have none (e.g. tmpfs).
    pub source: String,
    /// Mount point in the child's view of the filesystem.
    pub target: String,
    pub flags: MsFlags,
    /// Filesystem type; empty for bind mounts.
    pub fstype: String,
    /// Option string handed through to the filesystem layer verbatim.
    pub data: String,
}

impl MountSpec {
    /// Parses `source:target[:options]`.
    ///
    /// Either path may be empty; fewer than two fields is an error. When
    /// the options field is present it replaces the default flags
    /// entirely, so a read-only recursive bind must spell out
    /// `recursive,bind,ro`.
    pub fn parse(spec: &str) -> Result<Self> {
        let fields: Vec<&str> = spec.splitn(3, ':').collect();
        if fields.len() < 2 {
            return Err(LauncherError::Parse(format!(
                "invalid mount {spec:?}: format is '/source/path:/dest/path[:options]'"
            )));
        }
        let (flags, fstype, data) = match fields.get(2) {
            Some(options) => parse_options(options)?,
            None => (DEFAULT_MOUNT_FLAGS, String::new(), String::new()),
        };
        Ok(MountSpec {
            source: fields[0].to_string(),
            target: fields[1].to_string(),
            flags,
            fstype,
            data,
        })
    }

    /// The mount /proc receives when the launcher mounts it itself.
    /// These are the flags a stock distribution uses for procfs.
    pub fn auto_proc() -> Self {
        MountSpec {
            source: String::new(),
            target: "/proc".to_string(),
            flags: MsFlags::MS_RELATIME
                | MsFlags::MS_NODEV
                | MsFlags::MS_NOEXEC
                | MsFlags::MS_NOSUID,
            fstype: "proc".to_string(),
            data: String::new(),
        }
    }

    /// Resolves both paths against the current filesystem view.
    ///
    /// The target may not exist yet (it gets created before mounting),
    /// so resolution failures there are tolerated. A non-empty source
    /// that does not resolve is an error: mounting it would fail later
    /// with a far less useful message.
    pub fn normalize(&self) -> Result<Self> {
        let target = realpath(&self.target).unwrap_or_else(|_| self.target.clone());
        let source = if self.source.is_empty() {
            String::new()
        } else {
            realpath(&self.source).map_err(|e| {
                LauncherError::Mount(format!(
                    "could not resolve mount source {:?}: {e}",
                    self.source
                ))
            })?
        };
        Ok(MountSpec {
            source,
            target,
            ..self.clone()
        })
    }

    /// Creates the mount target, matching the shape of the source: the
    /// kernel refuses to mount a file onto a directory or vice versa.
    pub fn make_target(&self, perms: u32) -> Result<()> {
        let source_meta = if self.source.is_empty() {
            None
        } else {
            fs::metadata(&self.source).ok()
        };
        let target = Path::new(&self.target);
        match source_meta {
            // A plain file (or device node) binds onto a plain file.
            Some(meta) if !meta.is_dir() => {
                let parent = target.parent().unwrap_or_else(|| Path::new("/"));
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(perms)
                    .create(parent)
                    .map_err(|e| {
                        LauncherError::Mount(format!(
                            "could not create directory {} for file mount: {e}",
                            parent.display()
                        ))
                    })?;
                fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .mode(perms & 0o666)
                    .open(target)
                    .map(|_| ())
                    .map_err(|e| {
                        LauncherError::Mount(format!(
                            "could not create target file {}: {e}",
                            self.target
                        ))
                    })
            }
            // Directories, missing sources and sourceless filesystems
            // all get a directory.
            _ => fs::DirBuilder::new()
                .recursive(true)
                .mode(perms)
                .create(target)
                .map_err(|e| {
                    LauncherError::Mount(format!(
                        "could not create target directory {}: {e}",
                        self.target
                    ))
                }),
        }
    }

    /// Issues the mount(2) call.
    ///
    /// An empty source is substituted with the filesystem type (or the
    /// literal "none"): the kernel does not care, but /proc/mounts and
    /// df output stay informative.
    pub fn apply(&self) -> Result<()> {
        let source = if self.source.is_empty() {
            if self.fstype.is_empty() {
                "none"
            } else {
                self.fstype.as_str()
            }
        } else {
            self.source.as_str()
        };
        let fstype = (!self.fstype.is_empty()).then_some(self.fstype.as_str());
        let data = (!self.data.is_empty()).then_some(self.data.as_str());
        mount(Some(source), self.target.as_str(), fstype, self.flags, data)
            .map_err(|e| LauncherError::Mount(format!("could not mount {self}: {e}")))?;

        // A bind transplants the mount, but the kernel ignores per-mount
        // attributes (ro, nosuid, ...) on that call; they only stick
        // through a follow-up bind-remount.
        let attrs = self.flags & BIND_ATTR_FLAGS;
        if self.flags.contains(MsFlags::MS_BIND)
            && !self.flags.contains(MsFlags::MS_REMOUNT)
            && !attrs.is_empty()
        {
            mount(
                None::<&str>,
                self.target.as_str(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | attrs,
                None::<&str>,
            )
            .map_err(|e| {
                LauncherError::Mount(format!("could not apply mount attributes to {self}: {e}"))
            })?;
        }
        Ok(())
    }

    fn options_string(&self) -> String {
        let mut options = Vec::new();
        if self.flags != DEFAULT_MOUNT_FLAGS {
            for (name, bits) in KNOWN_OPTIONS {
                if self.flags.intersects(*bits) {
                    options.push((*name).to_string());
                }
            }
        }
        if !self.fstype.is_empty() {
            options.push(format!("type={}", self.fstype));
        }
        if !self.data.is_empty() {
            options.push(format!("data={}", self.data));
        }
        options.join(",")
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let options = self.options_string();
        if options.is_empty() {
            write!(f, "{}:{}", self.source, self.target)
        } else {
            write!(f, "{}:{}:{options}", self.source, self.target)
        }
    }
}

fn parse_options(options: &str) -> Result<(MsFlags, String, String)> {
    let tokens: Vec<&str> = options.split(',').collect();
    let mut flags = MsFlags::empty();
    let mut fstype = String::new();
    let mut data = String::new();
    let mut unknown = Vec::new();
    for (ix, raw) in tokens.iter().enumerate() {
        let token = raw.trim();
        if let Some(t) = token.strip_prefix("type=") {
            fstype = t.to_string();
            continue;
        }
        // data= swallows the rest of the option string, commas included,
        // so filesystem options never need escaping.
        if let Some(d) = token.strip_prefix("data=") {
            data = std::iter::once(d)
                .chain(tokens[ix + 1..].iter().copied())
                .collect::<Vec<_>>()
                .join(",");
            break;
        }
        match lookup_option(token) {
            Some(bits) => flags |= bits,
            None => unknown.push(format!("filesystem option #{ix} is unknown: {token:?}")),
        }
    }
    if !unknown.is_empty() {
        return Err(LauncherError::Parse(unknown.join("; ")));
    }
    Ok((flags, fstype, data))
}

/// Absolute path with every symlink resolved.
pub fn realpath(path: &str) -> std::io::Result<String> {
    Ok(fs::canonicalize(path)?.to_string_lossy().into_owned())
}

/// Applies the configured mounts in order, then the automatic /proc
/// mount.
///
/// /proc goes last on purpose: a user is free to bind things under its
/// eventual parent first, and the fresh procfs must reflect the new pid
/// namespace or the uid/gid maps of the inner user namespace cannot be
/// written.
pub fn apply_all(cfg: &Config) -> Result<()> {
    for requested in &cfg.mounts {
        let mount = match requested.normalize() {
            Ok(mount) => mount,
            Err(err) => {
                cfg.tolerate(LauncherError::Mount(format!(
                    "skipping mount {requested}: {err}"
                )))?;
                continue;
            }
        };
        if !cfg.proc && (mount.target == "/proc" || mount.target == "/proc/") {
            cfg.tolerate(LauncherError::Mount(format!(
                "skipping mount {requested}: /proc is mounted automatically (unless --proc is used)"
            )))?;
            continue;
        }
        let made = mount.make_target(cfg.perms);
        match mount.apply() {
            Ok(()) => log::debug!("mounted {mount}"),
            Err(mount_err) => {
                if let Err(make_err) = made {
                    cfg.tolerate(make_err)?;
                }
                cfg.tolerate(mount_err)?;
            }
        }
    }
    if !cfg.proc {
        match MountSpec::auto_proc().apply() {
            Ok(()) => log::debug!("mounted fresh /proc"),
            Err(err) => cfg.tolerate(err)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn parse_defaults_to_recursive_private_bind() {
        let spec = MountSpec::parse("/tmp/src:/tmp/dst").unwrap();
        assert_eq!(spec.source, "/tmp/src");
        assert_eq!(spec.target, "/tmp/dst");
        assert_eq!(spec.flags, DEFAULT_MOUNT_FLAGS);
        assert!(spec.fstype.is_empty());
        assert!(spec.data.is_empty());
    }

    #[test]
    fn parse_options_replace_defaults() {
        let spec = MountSpec::parse("/a:/b:ro").unwrap();
        assert_eq!(spec.flags, MsFlags::MS_RDONLY);

        let spec = MountSpec::parse("/a:/b:recursive,bind,ro").unwrap();
        assert_eq!(
            spec.flags,
            MsFlags::MS_REC | MsFlags::MS_BIND | MsFlags::MS_RDONLY
        );
    }

    #[test]
    fn parse_type_and_data() {
        let spec = MountSpec::parse(":/tmp/t:type=tmpfs,data=size=1m").unwrap();
        assert!(spec.source.is_empty());
        assert_eq!(spec.fstype, "tmpfs");
        assert_eq!(spec.data, "size=1m");
        assert_eq!(spec.flags, MsFlags::empty());
    }

    #[test]
    fn data_swallows_everything_after_it() {
        let spec = MountSpec::parse("/a:/b:ro,data=size=1m,mode=0700,uid=5").unwrap();
        assert_eq!(spec.data, "size=1m,mode=0700,uid=5");
        assert_eq!(spec.flags, MsFlags::MS_RDONLY);

        // even tokens that would otherwise parse as flags
        let spec = MountSpec::parse("/a:/b:data=x,ro,type=ext4").unwrap();
        assert_eq!(spec.data, "x,ro,type=ext4");
        assert!(spec.fstype.is_empty());
    }

    #[test]
    fn unknown_tokens_are_collected() {
        let err = MountSpec::parse("/a:/b:ro,bogus,alsobad").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bogus"), "{message}");
        assert!(message.contains("alsobad"), "{message}");
    }

    #[test]
    fn too_few_fields_is_an_error() {
        assert!(MountSpec::parse("/just-a-path").is_err());
        assert!(MountSpec::parse("").is_err());
    }

    #[test]
    fn serialization_elides_default_flags() {
        let spec = MountSpec::parse("/tmp/src:/tmp/dst").unwrap();
        assert_eq!(spec.to_string(), "/tmp/src:/tmp/dst");
    }

    #[test]
    fn serialization_keeps_type_and_data_last() {
        let spec = MountSpec::parse(":/tmp/t:type=tmpfs,data=size=1m").unwrap();
        assert_eq!(spec.to_string(), ":/tmp/t:type=tmpfs,data=size=1m");
    }

    #[test]
    fn round_trip_preserves_meaning() {
        for text in [
            "/tmp/src:/tmp/dst",
            "/a:/b:ro",
            "/a:/b:recursive,bind,ro",
            ":/tmp/t:type=tmpfs,data=size=1m,mode=0700",
            "/a:/b:noexec,nosuid,nodev",
        ] {
            let spec = MountSpec::parse(text).unwrap();
            let reparsed = MountSpec::parse(&spec.to_string()).unwrap();
            assert_eq!(spec, reparsed, "via {:?}", spec.to_string());
        }
    }

    #[test]
    fn normalize_requires_the_source_to_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let spec = MountSpec::parse(&format!("{}:/tmp/dst", missing.display())).unwrap();
        assert!(spec.normalize().is_err());
    }

    #[test]
    fn normalize_resolves_symlinked_source_and_tolerates_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        symlink(&real, &link).unwrap();

        let missing_target = dir.path().join("not-there-yet");
        let spec = MountSpec::parse(&format!(
            "{}:{}",
            link.display(),
            missing_target.display()
        ))
        .unwrap();
        let normalized = spec.normalize().unwrap();
        assert_eq!(normalized.source, realpath(real.to_str().unwrap()).unwrap());
        assert_eq!(normalized.target, missing_target.display().to_string());
    }

    #[test]
    fn make_target_creates_directory_for_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir(&source).unwrap();
        let target = dir.path().join("a/b/dst");
        let spec = MountSpec::parse(&format!("{}:{}", source.display(), target.display())).unwrap();
        spec.make_target(0o755).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn make_target_creates_empty_file_for_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("marker");
        fs::write(&source, "HI\n").unwrap();
        let target = dir.path().join("sub/marker");
        let spec = MountSpec::parse(&format!("{}:{}", source.display(), target.display())).unwrap();
        spec.make_target(0o755).unwrap();
        assert!(target.is_file());
        assert_eq!(fs::metadata(&target).unwrap().len(), 0);
    }

    #[test]
    fn make_target_accepts_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let spec = MountSpec::parse(&format!(":{}", dir.path().display())).unwrap();
        spec.make_target(0o755).unwrap();
    }

    #[test]
    fn auto_proc_spec_shape() {
        let spec = MountSpec::auto_proc();
        assert_eq!(spec.target, "/proc");
        assert_eq!(spec.fstype, "proc");
        assert!(spec.source.is_empty());
        assert!(spec.flags.contains(MsFlags::MS_NODEV | MsFlags::MS_NOSUID));
    }
}
