//! SFTP codec binding.
//!
//! Translates russh-sftp requests into [`Request`]s for the session engine
//! and its [`Response`]s back into protocol packets. Handles travel as hex
//! strings since the codec models them as text.

use std::collections::HashMap;

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};

use s3sftp::{FileAttrs, NameEntry, Request, Response, SessionEngine};

/// russh-sftp handler serving one subsystem channel.
#[derive(Debug)]
pub struct SftpSession {
    engine: SessionEngine,
}

impl SftpSession {
    /// Wrap an engine bound to an authenticated identity.
    pub fn new(engine: SessionEngine) -> Self {
        Self { engine }
    }
}

fn encode_handle(handle: &[u8]) -> String {
    handle.iter().map(|b| format!("{b:02x}")).collect()
}

/// Malformed handles decode to nothing, which the engine rejects.
fn decode_handle(handle: &str) -> Vec<u8> {
    if handle.len() % 2 != 0 || !handle.is_ascii() {
        return Vec::new();
    }
    (0..handle.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&handle[i..i + 2], 16))
        .collect::<Result<_, _>>()
        .unwrap_or_default()
}

fn status_code(code: s3sftp::StatusCode) -> StatusCode {
    match code {
        s3sftp::StatusCode::Ok => StatusCode::Ok,
        s3sftp::StatusCode::Eof => StatusCode::Eof,
        s3sftp::StatusCode::NoSuchFile => StatusCode::NoSuchFile,
        s3sftp::StatusCode::PermissionDenied => StatusCode::PermissionDenied,
        s3sftp::StatusCode::Failure => StatusCode::Failure,
        s3sftp::StatusCode::BadMessage => StatusCode::BadMessage,
        s3sftp::StatusCode::NoConnection => StatusCode::NoConnection,
        s3sftp::StatusCode::ConnectionLost => StatusCode::ConnectionLost,
        s3sftp::StatusCode::OpUnsupported => StatusCode::OpUnsupported,
    }
}

fn attributes(attrs: &FileAttrs) -> FileAttributes {
    FileAttributes {
        size: Some(attrs.size),
        uid: Some(attrs.uid),
        gid: Some(attrs.gid),
        permissions: Some(attrs.permissions),
        atime: Some(attrs.atime),
        mtime: Some(attrs.mtime),
        ..Default::default()
    }
}

fn file(entry: NameEntry) -> File {
    File {
        attrs: attributes(&entry.attrs),
        filename: entry.filename,
        longname: entry.longname,
    }
}

/// Status code of a response that did not carry the expected payload.
fn unexpected(response: Response) -> StatusCode {
    match response {
        Response::Status { code, .. } => status_code(code),
        other => {
            tracing::error!(response = ?other, "unexpected response from session engine");
            StatusCode::Failure
        }
    }
}

/// Status responses keep their message, e.g. "Directory not empty".
fn into_status(response: Response) -> Result<Status, StatusCode> {
    match response {
        Response::Status { id, code, message } => Ok(Status {
            id,
            status_code: status_code(code),
            error_message: message,
            language_tag: "en-US".to_string(),
        }),
        other => Err(unexpected(other)),
    }
}

fn into_handle(response: Response) -> Result<Handle, StatusCode> {
    match response {
        Response::Handle { id, handle } => Ok(Handle {
            id,
            handle: encode_handle(&handle),
        }),
        other => Err(unexpected(other)),
    }
}

fn into_name(response: Response) -> Result<Name, StatusCode> {
    match response {
        Response::Name { id, entries } => Ok(Name {
            id,
            files: entries.into_iter().map(file).collect(),
        }),
        other => Err(unexpected(other)),
    }
}

fn into_attrs(response: Response) -> Result<Attrs, StatusCode> {
    match response {
        Response::Attrs { id, attrs } => Ok(Attrs {
            id,
            attrs: attributes(&attrs),
        }),
        other => Err(unexpected(other)),
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        tracing::debug!(
            username = %self.engine.identity().username(),
            version,
            extensions = ?extensions,
            "SFTP init"
        );
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let request = Request::Open {
            id,
            path: filename,
            flags: s3sftp::OpenFlags::from_bits(pflags.bits()),
        };
        into_handle(self.engine.dispatch(request).await)
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        let request = Request::Close {
            id,
            handle: decode_handle(&handle),
        };
        into_status(self.engine.dispatch(request).await)
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let request = Request::Read {
            id,
            handle: decode_handle(&handle),
            offset,
            len,
        };
        match self.engine.dispatch(request).await {
            Response::Data { id, data } => Ok(Data { id, data }),
            other => Err(unexpected(other)),
        }
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let request = Request::Write {
            id,
            handle: decode_handle(&handle),
            offset,
            data,
        };
        into_status(self.engine.dispatch(request).await)
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        into_attrs(self.engine.dispatch(Request::LStat { id, path }).await)
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        into_handle(self.engine.dispatch(Request::OpenDir { id, path }).await)
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let request = Request::ReadDir {
            id,
            handle: decode_handle(&handle),
        };
        into_name(self.engine.dispatch(request).await)
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        into_status(self.engine.dispatch(Request::MkDir { id, path }).await)
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        into_status(self.engine.dispatch(Request::RmDir { id, path }).await)
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        into_name(self.engine.dispatch(Request::RealPath { id, path }).await)
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        into_attrs(self.engine.dispatch(Request::Stat { id, path }).await)
    }
}
