//! DOS file handles backed by a host directory
//!
//! Handles 0-4 are the standard devices (stdin, stdout, stderr, aux and
//! printer). Files get handles from 5 up. Every drive letter maps to the
//! same host directory, and path components are matched without regard to
//! case so `C:\DATA\LEVEL1.MAP` finds `data/level1.map`.

use super::DosError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use xtemu_core::logging::{log, LogCategory, LogLevel};

pub const STDIN: u16 = 0;
pub const STDOUT: u16 = 1;
pub const STDERR: u16 = 2;
/// Handles below this number are the standard devices
pub const FIRST_FILE_HANDLE: u16 = 5;
/// Size of the handle table, like `FILES=20`
pub const MAX_HANDLES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    /// Decode the access bits of an open mode byte (AL of AH=3Dh).
    pub fn from_code(code: u8) -> Result<Self, DosError> {
        match code & 0x07 {
            0 => Ok(AccessMode::Read),
            1 => Ok(AccessMode::Write),
            2 => Ok(AccessMode::ReadWrite),
            _ => Err(DosError::InvalidFunction),
        }
    }

    fn readable(self) -> bool {
        self != AccessMode::Write
    }

    fn writable(self) -> bool {
        self != AccessMode::Read
    }
}

struct OpenFile {
    file: File,
    path: PathBuf,
    mode: AccessMode,
}

fn host_error(err: io::Error) -> DosError {
    match err.kind() {
        io::ErrorKind::NotFound => DosError::FileNotFound,
        _ => DosError::AccessDenied,
    }
}

pub struct FileTable {
    root: PathBuf,
    handles: Vec<Option<OpenFile>>,
}

impl FileTable {
    pub fn new(root: PathBuf) -> Self {
        let mut handles = Vec::with_capacity(MAX_HANDLES);
        handles.resize_with(MAX_HANDLES, || None);
        Self { root, handles }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_device(handle: u16) -> bool {
        handle < FIRST_FILE_HANDLE
    }

    /// Host path for a DOS path. Only the last component may be missing.
    pub fn resolve(&self, dos_path: &str) -> Result<PathBuf, DosError> {
        let path = match dos_path.as_bytes() {
            [letter, b':', ..] if letter.is_ascii_alphabetic() => &dos_path[2..],
            _ => dos_path,
        };

        let components: Vec<&str> = path
            .split(['\\', '/'])
            .filter(|c| !c.is_empty() && *c != ".")
            .collect();
        if components.is_empty() {
            return Err(DosError::PathNotFound);
        }

        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for (i, component) in components.iter().enumerate() {
            if *component == ".." {
                if depth > 0 {
                    resolved.pop();
                    depth -= 1;
                }
                continue;
            }
            let last = i + 1 == components.len();
            match find_entry(&resolved, component) {
                Some(name) => resolved.push(name),
                None if last => resolved.push(component),
                None => return Err(DosError::PathNotFound),
            }
            depth += 1;
        }
        Ok(resolved)
    }

    fn insert(&mut self, file: OpenFile) -> Result<u16, DosError> {
        let slot = self
            .handles
            .iter()
            .skip(FIRST_FILE_HANDLE as usize)
            .position(Option::is_none)
            .ok_or(DosError::TooManyOpenFiles)?;
        let handle = slot + FIRST_FILE_HANDLE as usize;
        log(LogCategory::Dos, LogLevel::Debug, || {
            format!("handle {} -> {}", handle, file.path.display())
        });
        self.handles[handle] = Some(file);
        Ok(handle as u16)
    }

    fn get(&mut self, handle: u16) -> Result<&mut OpenFile, DosError> {
        self.handles
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .ok_or(DosError::InvalidHandle)
    }

    /// Create or truncate a file, opened for reading and writing.
    pub fn create(&mut self, dos_path: &str) -> Result<u16, DosError> {
        let path = self.resolve(dos_path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(host_error)?;
        self.insert(OpenFile {
            file,
            path,
            mode: AccessMode::ReadWrite,
        })
    }

    pub fn open(&mut self, dos_path: &str, mode: AccessMode) -> Result<u16, DosError> {
        let path = self.resolve(dos_path)?;
        if path.is_dir() {
            return Err(DosError::AccessDenied);
        }
        let file = OpenOptions::new()
            .read(mode.readable())
            .write(mode.writable())
            .open(&path)
            .map_err(host_error)?;
        self.insert(OpenFile { file, path, mode })
    }

    pub fn close(&mut self, handle: u16) -> Result<(), DosError> {
        if Self::is_device(handle) {
            return Ok(());
        }
        match self.handles.get_mut(handle as usize).and_then(Option::take) {
            Some(_) => Ok(()),
            None => Err(DosError::InvalidHandle),
        }
    }

    pub fn close_all(&mut self) {
        for slot in self.handles.iter_mut() {
            *slot = None;
        }
    }

    /// Read up to `len` bytes. Device handles are always at end of file.
    pub fn read(&mut self, handle: u16, len: usize) -> Result<Vec<u8>, DosError> {
        if Self::is_device(handle) {
            return Ok(Vec::new());
        }
        let open = self.get(handle)?;
        if !open.mode.readable() {
            return Err(DosError::AccessDenied);
        }
        let mut buf = Vec::with_capacity(len);
        std::io::Read::by_ref(&mut open.file)
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(host_error)?;
        Ok(buf)
    }

    /// Write `data`, returning the number of bytes written. Output to a
    /// device handle is discarded.
    pub fn write(&mut self, handle: u16, data: &[u8]) -> Result<usize, DosError> {
        if Self::is_device(handle) {
            return Ok(data.len());
        }
        let open = self.get(handle)?;
        if !open.mode.writable() {
            return Err(DosError::AccessDenied);
        }
        open.file.write_all(data).map_err(host_error)?;
        Ok(data.len())
    }

    /// Cut the file off at the current position.
    pub fn truncate(&mut self, handle: u16) -> Result<(), DosError> {
        if Self::is_device(handle) {
            return Ok(());
        }
        let open = self.get(handle)?;
        if !open.mode.writable() {
            return Err(DosError::AccessDenied);
        }
        let pos = open.file.stream_position().map_err(host_error)?;
        open.file.set_len(pos).map_err(host_error)
    }

    /// Move the file pointer (AH=42h). `origin` is 0 for the start, 1 for
    /// the current position and 2 for the end. Returns the new position.
    pub fn seek(&mut self, handle: u16, origin: u8, offset: i32) -> Result<u32, DosError> {
        if Self::is_device(handle) {
            return Ok(0);
        }
        let open = self.get(handle)?;
        let from = match origin {
            0 => SeekFrom::Start(offset as u32 as u64),
            1 => SeekFrom::Current(offset as i64),
            2 => SeekFrom::End(offset as i64),
            _ => return Err(DosError::InvalidFunction),
        };
        let pos = open.file.seek(from).map_err(|_| DosError::SeekError)?;
        Ok(pos as u32)
    }

    pub fn open_count(&self) -> usize {
        self.handles.iter().filter(|h| h.is_some()).count()
    }
}

/// Name of the entry in `dir` matching `name` without regard to case.
fn find_entry(dir: &Path, name: &str) -> Option<String> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .find(|entry| entry.eq_ignore_ascii_case(name))
}
