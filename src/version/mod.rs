use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::VersionError;

pub const MAJOR_FIELD: &str = "FIRMWARE_VERSION_MAJOR";
pub const MINOR_FIELD: &str = "FIRMWARE_VERSION_MINOR";
pub const DEFAULT_VERSION_FILES: [&str; 2] = ["src/main.cpp", "src/master.cpp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BumpKind {
    Major,
    #[default]
    Minor,
}

impl std::fmt::Display for BumpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BumpKind::Major => write!(f, "major"),
            BumpKind::Minor => write!(f, "minor"),
        }
    }
}

impl std::str::FromStr for BumpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "major" => Ok(BumpKind::Major),
            "minor" => Ok(BumpKind::Minor),
            _ => Err(format!("Bump type must be \"major\" or \"minor\", got {:?}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
}

impl FirmwareVersion {
    /// The next version, or `None` if the bumped field would overflow.
    pub fn bumped(self, kind: BumpKind) -> Option<Self> {
        match kind {
            BumpKind::Major => Some(Self {
                major: self.major.checked_add(1)?,
                minor: 0,
            }),
            BumpKind::Minor => Some(Self {
                major: self.major,
                minor: self.minor.checked_add(1)?,
            }),
        }
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Outcome of a successful bump
#[derive(Debug, Clone)]
pub struct BumpReport {
    pub kind: BumpKind,
    pub from: FirmwareVersion,
    pub to: FirmwareVersion,
    pub files: Vec<PathBuf>,
}

/// Locate the digits of the first `#define <name> <digits>` in `content`.
fn find_field(content: &str, name: &str) -> Option<Range<usize>> {
    let needle = format!("#define {} ", name);
    let mut from = 0;

    while let Some(offset) = content[from..].find(&needle) {
        let start = from + offset + needle.len();
        let digits = content[start..]
            .bytes()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits > 0 {
            return Some(start..start + digits);
        }
        from = start;
    }
    None
}

fn field_value(
    content: &str,
    name: &str,
    path: &Path,
) -> Result<(Range<usize>, u32), VersionError> {
    let range = find_field(content, name)
        .ok_or_else(|| VersionError::FieldMissing(path.to_path_buf()))?;
    let value = content[range.clone()]
        .parse()
        .map_err(|_| VersionError::InvalidNumber {
            path: path.to_path_buf(),
            value: content[range.clone()].to_string(),
        })?;
    Ok((range, value))
}

/// Read the firmware version defined in one source file's contents.
pub fn read_version(content: &str, path: &Path) -> Result<FirmwareVersion, VersionError> {
    let (_, major) = field_value(content, MAJOR_FIELD, path)?;
    let (_, minor) = field_value(content, MINOR_FIELD, path)?;
    Ok(FirmwareVersion { major, minor })
}

/// Rewrite both version fields, leaving every other byte untouched.
pub fn rewrite_version(
    content: &str,
    version: FirmwareVersion,
    path: &Path,
) -> Result<String, VersionError> {
    let (major, _) = field_value(content, MAJOR_FIELD, path)?;
    let (minor, _) = field_value(content, MINOR_FIELD, path)?;

    let mut edits = [(major, version.major), (minor, version.minor)];
    // Apply from the back so earlier ranges stay valid
    edits.sort_by(|a, b| b.0.start.cmp(&a.0.start));

    let mut updated = content.to_string();
    for (range, value) in edits {
        updated.replace_range(range, &value.to_string());
    }
    Ok(updated)
}

/// Write `content` to a temp file next to `path`, keeping `path`'s permissions.
fn stage_write(path: &Path, content: &str) -> std::io::Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(content.as_bytes())?;
    if let Ok(metadata) = std::fs::metadata(path) {
        staged.as_file().set_permissions(metadata.permissions())?;
    }
    staged.as_file().sync_all()?;
    Ok(staged)
}

/// Replace every file or none of them.
///
/// All new contents are staged as temp siblings first; only once every one
/// is written are they renamed over the originals. A staging failure drops
/// the temp files and leaves the originals untouched.
fn write_lock_step(writes: &[(PathBuf, String)]) -> Result<(), VersionError> {
    let mut staged = Vec::with_capacity(writes.len());
    for (path, content) in writes {
        let file = stage_write(path, content).map_err(|source| VersionError::Io {
            path: path.clone(),
            source,
        })?;
        staged.push((path, file));
    }

    for (path, file) in staged {
        file.persist(path).map_err(|e| VersionError::Io {
            path: path.clone(),
            source: e.error,
        })?;
    }
    Ok(())
}

/// Bump the version in every file in lock-step.
///
/// The current version comes from the first file. All files are read and
/// checked for both fields before any of them is written.
pub fn bump_files(files: &[PathBuf], kind: BumpKind) -> Result<BumpReport, VersionError> {
    let first = files.first().ok_or(VersionError::NoFiles)?;

    let mut contents = Vec::with_capacity(files.len());
    for path in files {
        let content = std::fs::read_to_string(path).map_err(|source| VersionError::Io {
            path: path.clone(),
            source,
        })?;
        let found = read_version(&content, path)?;
        debug!(path = %path.display(), version = %found, "Found version fields");
        contents.push(content);
    }

    let from = read_version(&contents[0], first)?;
    let to = from.bumped(kind).ok_or_else(|| VersionError::Overflow {
        path: first.clone(),
        field: match kind {
            BumpKind::Major => MAJOR_FIELD,
            BumpKind::Minor => MINOR_FIELD,
        },
    })?;

    let rewritten = files
        .iter()
        .zip(&contents)
        .map(|(path, content)| Ok((path.clone(), rewrite_version(content, to, path)?)))
        .collect::<Result<Vec<_>, VersionError>>()?;

    write_lock_step(&rewritten)?;
    for path in files {
        info!(path = %path.display(), "Updated version to {}", to);
    }

    Ok(BumpReport {
        kind,
        from,
        to,
        files: files.to_vec(),
    })
}
