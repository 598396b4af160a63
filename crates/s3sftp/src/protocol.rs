//! Codec-neutral view of the SFTP operations the session engine serves.
//!
//! A protocol codec decodes packets into [`Request`]s, hands them to
//! [`SessionEngine::dispatch`](crate::SessionEngine::dispatch), and encodes the
//! returned [`Response`], which always echoes the request id.

use crate::attrs::{FileAttrs, NameEntry};

/// SFTP v3 `pflags` bits for OPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Open for reading
    pub const READ: Self = Self(0x0000_0001);
    /// Open for writing
    pub const WRITE: Self = Self(0x0000_0002);
    /// Append to the end of the file
    pub const APPEND: Self = Self(0x0000_0004);
    /// Create if missing
    pub const CREATE: Self = Self(0x0000_0008);
    /// Truncate an existing file
    pub const TRUNCATE: Self = Self(0x0000_0010);
    /// Fail if the file exists
    pub const EXCLUDE: Self = Self(0x0000_0020);

    /// Flags from their wire representation.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Wire representation.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// SFTP v3 status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// End of file or directory listing
    Eof = 1,
    /// No object at the path
    NoSuchFile = 2,
    /// Permission denied
    PermissionDenied = 3,
    /// Generic failure
    Failure = 4,
    /// Malformed request
    BadMessage = 5,
    /// No connection
    NoConnection = 6,
    /// Connection lost
    ConnectionLost = 7,
    /// Operation not supported
    OpUnsupported = 8,
}

/// Opaque 32-bit handle, encoded on the wire as 4 big-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u32);

impl HandleId {
    /// Wire encoding.
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Decode a wire handle; anything but exactly 4 bytes is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = bytes.try_into().ok()?;
        Some(Self(u32::from_be_bytes(bytes)))
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// SSH_FXP_OPEN
    Open {
        /// Request id
        id: u32,
        /// Client path
        path: String,
        /// Open mode
        flags: OpenFlags,
    },
    /// SSH_FXP_READ
    Read {
        /// Request id
        id: u32,
        /// Wire handle
        handle: Vec<u8>,
        /// Byte offset
        offset: u64,
        /// Maximum bytes to return
        len: u32,
    },
    /// SSH_FXP_WRITE
    Write {
        /// Request id
        id: u32,
        /// Wire handle
        handle: Vec<u8>,
        /// Byte offset (not used to seek)
        offset: u64,
        /// Payload
        data: Vec<u8>,
    },
    /// SSH_FXP_OPENDIR
    OpenDir {
        /// Request id
        id: u32,
        /// Client path
        path: String,
    },
    /// SSH_FXP_READDIR
    ReadDir {
        /// Request id
        id: u32,
        /// Wire handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_REALPATH
    RealPath {
        /// Request id
        id: u32,
        /// Client path
        path: String,
    },
    /// SSH_FXP_CLOSE
    Close {
        /// Request id
        id: u32,
        /// Wire handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_RMDIR
    RmDir {
        /// Request id
        id: u32,
        /// Client path
        path: String,
    },
    /// SSH_FXP_MKDIR
    MkDir {
        /// Request id
        id: u32,
        /// Client path
        path: String,
    },
    /// SSH_FXP_STAT
    Stat {
        /// Request id
        id: u32,
        /// Client path
        path: String,
    },
    /// SSH_FXP_LSTAT
    LStat {
        /// Request id
        id: u32,
        /// Client path
        path: String,
    },
}

impl Request {
    /// The request id every response must echo.
    pub fn id(&self) -> u32 {
        match self {
            Request::Open { id, .. }
            | Request::Read { id, .. }
            | Request::Write { id, .. }
            | Request::OpenDir { id, .. }
            | Request::ReadDir { id, .. }
            | Request::RealPath { id, .. }
            | Request::Close { id, .. }
            | Request::RmDir { id, .. }
            | Request::MkDir { id, .. }
            | Request::Stat { id, .. }
            | Request::LStat { id, .. } => *id,
        }
    }

    /// Packet name used in log records.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Open { .. } => "OPEN",
            Request::Read { .. } => "READ",
            Request::Write { .. } => "WRITE",
            Request::OpenDir { .. } => "OPENDIR",
            Request::ReadDir { .. } => "READDIR",
            Request::RealPath { .. } => "REALPATH",
            Request::Close { .. } => "CLOSE",
            Request::RmDir { .. } => "RMDIR",
            Request::MkDir { .. } => "MKDIR",
            Request::Stat { .. } => "STAT",
            Request::LStat { .. } => "LSTAT",
        }
    }
}

/// A response ready for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// SSH_FXP_HANDLE
    Handle {
        /// Echoed request id
        id: u32,
        /// 4-byte wire handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_NAME
    Name {
        /// Echoed request id
        id: u32,
        /// Name records
        entries: Vec<NameEntry>,
    },
    /// SSH_FXP_ATTRS
    Attrs {
        /// Echoed request id
        id: u32,
        /// Attributes
        attrs: FileAttrs,
    },
    /// SSH_FXP_DATA
    Data {
        /// Echoed request id
        id: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// SSH_FXP_STATUS
    Status {
        /// Echoed request id
        id: u32,
        /// Status code
        code: StatusCode,
        /// Human readable message, possibly empty
        message: String,
    },
}

impl Response {
    /// Shorthand for a status response.
    pub fn status(id: u32, code: StatusCode, message: impl Into<String>) -> Self {
        Response::Status {
            id,
            code,
            message: message.into(),
        }
    }

    /// The echoed request id.
    pub fn id(&self) -> u32 {
        match self {
            Response::Handle { id, .. }
            | Response::Name { id, .. }
            | Response::Attrs { id, .. }
            | Response::Data { id, .. }
            | Response::Status { id, .. } => *id,
        }
    }
}
