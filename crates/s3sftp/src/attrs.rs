//! Synthesized file attributes and `ls -l` style long names.

use chrono::{DateTime, Datelike, Utc};

/// Directory type bit.
pub const S_IFDIR: u32 = 0o040000;
/// Regular file type bit.
pub const S_IFREG: u32 = 0o100000;
/// Read, write and execute for owner, group and other.
pub const S_IRWXUGO: u32 = 0o777;

/// Kind of entry a storage object represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Plain object
    File,
    /// Directory marker or implicit root
    Directory,
}

/// Attributes reported for a file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttrs {
    /// Size in bytes (1 for directories)
    pub size: u64,
    /// Owner id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Type and permission bits
    pub permissions: u32,
    /// Access time, Unix seconds
    pub atime: u32,
    /// Modification time, Unix seconds
    pub mtime: u32,
}

impl FileAttrs {
    /// Attributes for a regular file of `size` bytes.
    pub fn file(size: u64, modified: DateTime<Utc>) -> Self {
        Self::new(EntryKind::File, size, modified)
    }

    /// Attributes for a directory.
    pub fn directory(modified: DateTime<Utc>) -> Self {
        Self::new(EntryKind::Directory, 1, modified)
    }

    fn new(kind: EntryKind, size: u64, modified: DateTime<Utc>) -> Self {
        let type_bit = match kind {
            EntryKind::File => S_IFREG,
            EntryKind::Directory => S_IFDIR,
        };
        let seconds = unix_seconds(modified);
        Self {
            size,
            uid: 0,
            gid: 0,
            permissions: type_bit | S_IRWXUGO,
            atime: seconds,
            mtime: seconds,
        }
    }

    /// Whether the directory type bit is set.
    pub fn is_dir(&self) -> bool {
        self.permissions & S_IFDIR == S_IFDIR
    }
}

fn unix_seconds(time: DateTime<Utc>) -> u32 {
    u32::try_from(time.timestamp().max(0)).unwrap_or(u32::MAX)
}

/// One record of a name response: READDIR entries and REALPATH results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    /// Short name (READDIR) or canonical path (REALPATH)
    pub filename: String,
    /// `ls -l` style line
    pub longname: String,
    /// Synthesized attributes
    pub attrs: FileAttrs,
}

/// Render an `ls -l` style line.
///
/// Owner and group are both the authenticated user. The time column shows
/// `HH:MM` for timestamps in the current year and the year otherwise.
pub fn longname(
    kind: EntryKind,
    size: u64,
    modified: DateTime<Utc>,
    owner: &str,
    name: &str,
    now: DateTime<Utc>,
) -> String {
    let type_char = match kind {
        EntryKind::File => '-',
        EntryKind::Directory => 'd',
    };
    let time_or_year = if modified.year() == now.year() {
        modified.format("%H:%M").to_string()
    } else {
        modified.format("%Y").to_string()
    };
    format!(
        "{type_char}rw-rw-rw- 1 {owner} {owner} {size} {} {time_or_year} {name}",
        modified.format("%b %-d"),
    )
}
