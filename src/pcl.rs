//! PCL file-server protocol: a host directory tree exposed as a disk-like
//! device through a two-phase (parameter/execute) command dispatch.

use crate::clock::now_sdx;
use crate::devtable::ParBlock;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod err {
    pub const OK: u8 = 1;
    pub const LAST_PACKET: u8 = 3;
    pub const BAD_HANDLE: u8 = 134;
    pub const EOF: u8 = 136;
    pub const BAD_FUNCTION: u8 = 144;
    pub const UNSUPPORTED_MODE: u8 = 146;
    pub const INVALID_PATH: u8 = 150;
    pub const FILE_EXISTS: u8 = 151;
    pub const INVALID_NAME: u8 = 156;
    pub const TOO_MANY_HANDLES: u8 = 161;
    pub const SEEK_RANGE: u8 = 166;
    pub const DIR_NOT_EMPTY: u8 = 167;
    pub const NOT_FOUND: u8 = 170;
    pub const PROTOCOL_VIOLATION: u8 = 176;
}

#[derive(Debug, Error)]
pub enum PclError {
    #[error("path escapes mount root")]
    InvalidPath,
    #[error("invalid 8+3 name")]
    InvalidName,
    #[error("no free handle")]
    NoFreeHandle,
    #[error("bad handle {0}")]
    BadHandle(u8),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PclError {
    pub fn code(&self) -> u8 {
        match self {
            PclError::InvalidPath => err::INVALID_PATH,
            PclError::InvalidName => err::INVALID_NAME,
            PclError::NoFreeHandle => err::TOO_MANY_HANDLES,
            PclError::BadHandle(_) => err::BAD_HANDLE,
            PclError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => err::NOT_FOUND,
                std::io::ErrorKind::AlreadyExists => err::FILE_EXISTS,
                std::io::ErrorKind::PermissionDenied => err::FILE_EXISTS,
                _ => 255,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, PclError>;

/// Function codes understood by `do_pclink`-equivalent dispatch.
pub mod fno {
    pub const FREAD: u8 = 0x00;
    pub const FWRITE: u8 = 0x01;
    pub const FSEEK: u8 = 0x02;
    pub const FTELL: u8 = 0x03;
    pub const FLEN: u8 = 0x04;
    pub const FNEXT: u8 = 0x06;
    pub const FCLOSE: u8 = 0x07;
    pub const INIT: u8 = 0x08;
    pub const FOPEN: u8 = 0x09;
    pub const FFIRST: u8 = 0x0a;
    pub const RENAME: u8 = 0x0b;
    pub const REMOVE: u8 = 0x0c;
    pub const CHMOD: u8 = 0x0d;
    pub const MKDIR: u8 = 0x0e;
    pub const RMDIR: u8 = 0x0f;
    pub const CHDIR: u8 = 0x10;
    pub const GETCWD: u8 = 0x11;
    pub const DFREE: u8 = 0x13;
    pub const CHVOL: u8 = 0x14;
}

/// Functions where re-running a byte-identical repeated P-block is
/// harmless, so the dispatcher just lets it execute again rather than
/// caching and replaying a prior result. See DESIGN.md for why this set
/// differs from `old_ccom`'s retry-exclusion set in the reference C.
pub const IDEMPOTENT_RETRY: &[u8] =
    &[fno::FREAD, fno::FWRITE, fno::FSEEK, fno::FTELL, fno::FLEN, fno::MKDIR, fno::GETCWD];

pub fn is_idempotent_retry(f: u8) -> bool {
    IDEMPOTENT_RETRY.contains(&f)
}

const VOLUME_LABEL_FILE: &str = ".PCLINK.VOLUME.LABEL";

/// Converts a 6-byte day/month/year/hour/minute/second SDX timestamp to
/// a local `SystemTime`, or `None` for a date chrono can't represent.
fn sdx_to_system_time(ts: &[u8; 6]) -> Option<std::time::SystemTime> {
    use chrono::{Local, TimeZone, Utc};
    let year = 2000 + ts[2] as i32;
    let local = Local.with_ymd_and_hms(year, ts[1] as u32, ts[0] as u32, ts[3] as u32, ts[4] as u32, ts[5] as u32).single()?;
    let utc: chrono::DateTime<Utc> = local.into();
    Some(std::time::SystemTime::from(utc))
}

/// Gates one name byte against the 8+3 charset, honoring the mount's
/// upper/lowercase requirement the way `dos_2_allowed` gates on
/// `isupper`/`islower` rather than folding case first.
fn is_allowed(c: u8, uppercase: bool) -> bool {
    if c == b'?' || c.is_ascii_digit() || c == b'_' || c == b'@' {
        return true;
    }
    if uppercase {
        c.is_ascii_uppercase()
    } else {
        c.is_ascii_lowercase()
    }
}

/// Normalizes a host filename into an 11-byte space-padded 8+3 key
/// (`"FOO     TXT"`), or `None` if it doesn't fit the charset/length
/// constraints. `uppercase` selects which case letters must already be
/// in; the stored key itself is always canonicalized to uppercase.
pub fn normalize_name(name: &str, uppercase: bool) -> Option<[u8; 11]> {
    if name.matches('.').count() > 1 {
        return None;
    }
    // Host filenames arrive dotted ("foo.txt"); an 11-byte `ParBlock` name
    // field arrives as the raw base+ext concatenation with no separator.
    // Both conventions land here, so fall back to a fixed 8/3 split when
    // there's no dot to locate the boundary.
    let (base, ext) = if let Some(idx) = name.find('.') {
        (&name[..idx], &name[idx + 1..])
    } else if name.len() <= 11 {
        let split = name.len().min(8);
        (&name[..split], &name[split..])
    } else {
        return None;
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return None;
    }
    if !base.bytes().all(|b| is_allowed(b, uppercase)) || !ext.bytes().all(|b| is_allowed(b, uppercase)) {
        return None;
    }
    let mut key = [b' '; 11];
    for (i, b) in base.bytes().enumerate() {
        key[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().enumerate() {
        key[8 + i] = b.to_ascii_uppercase();
    }
    Some(key)
}

/// Renders an 11-byte key back to a host-visible filename in the
/// configured case.
pub fn key_to_filename(key: &[u8; 11], uppercase: bool) -> String {
    let base: String = key[0..8].iter().map(|&b| b as char).collect::<String>().trim_end().to_string();
    let ext: String = key[8..11].iter().map(|&b| b as char).collect::<String>().trim_end().to_string();
    let mut s = if ext.is_empty() { base } else { format!("{base}.{ext}") };
    if !uppercase {
        s = s.to_lowercase();
    }
    s
}

/// Wildcard-aware match: `?` in `pattern` matches any byte.
pub fn pattern_matches(pattern: &[u8; 11], key: &[u8; 11]) -> bool {
    pattern.iter().zip(key.iter()).all(|(&p, &k)| p == b'?' || p == k)
}

/// One 23-byte virtual directory entry.
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub status: u8,
    pub map: u16,
    pub len: u32,
    pub name: [u8; 11],
    pub timestamp: [u8; 6],
}

impl DirEntry {
    pub const STATUS_PROTECTED: u8 = 0x01;
    pub const STATUS_IN_USE: u8 = 0x08;
    pub const STATUS_SUBDIR: u8 = 0x20;
    pub const STATUS_ROOT: u8 = 0x28;

    pub fn to_bytes(&self) -> [u8; 23] {
        let mut out = [0u8; 23];
        out[0] = self.status;
        out[1] = (self.map & 0xff) as u8;
        out[2] = (self.map >> 8) as u8;
        let len = self.len.min(0x00ff_ffff);
        out[3] = (len & 0xff) as u8;
        out[4] = ((len >> 8) & 0xff) as u8;
        out[5] = ((len >> 16) & 0xff) as u8;
        out[6..17].copy_from_slice(&self.name);
        out[17..23].copy_from_slice(&self.timestamp);
        out
    }
}

/// 5-bit parent-depth ordinal derived from the cwd's separator count;
/// wraps past 31 nesting levels (a documented limitation, not a defect).
pub fn depth_ordinal(cwd: &str) -> u8 {
    (cwd.matches('/').count() as u8) % 32
}

fn file_timestamp(meta: &fs::Metadata) -> [u8; 6] {
    use chrono::{DateTime, Datelike, Local, Timelike};
    let mtime: DateTime<Local> = meta.modified().map(DateTime::<Local>::from).unwrap_or_else(|_| Local::now());
    [
        mtime.day() as u8,
        mtime.month() as u8,
        (mtime.year() % 100) as u8,
        mtime.hour() as u8,
        mtime.minute() as u8,
        mtime.second() as u8,
    ]
}

/// Builds the directory snapshot for FFIRST/FNEXT: a header entry
/// describing the directory itself, followed by one entry per accepted
/// child.
pub fn cache_dir(path: &Path, cwd: &str, uppercase: bool) -> Result<Vec<DirEntry>> {
    let depth = depth_ordinal(cwd);
    let header_name = {
        let mut key = [b' '; 11];
        let label = b"MAIN";
        key[..label.len()].copy_from_slice(label);
        key
    };
    let mut entries = vec![DirEntry {
        status: DirEntry::STATUS_ROOT,
        map: (depth as u16) << 11,
        len: 23,
        name: header_name,
        timestamp: now_sdx(),
    }];

    let mut children: Vec<_> = fs::read_dir(path)?.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.file_name());

    for (ordinal, entry) in children.into_iter().enumerate() {
        let file_name = entry.file_name();
        let name_str = match file_name.to_str() {
            Some(s) => s,
            None => continue,
        };
        if name_str.starts_with('.') {
            continue;
        }
        let key = match normalize_name(name_str, uppercase) {
            Some(k) => k,
            None => continue,
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let is_dir = meta.is_dir();
        let map = (depth as u16) << 11 | ((ordinal as u16 + 1) & 0x07ff);
        entries.push(DirEntry {
            status: if is_dir { DirEntry::STATUS_SUBDIR | DirEntry::STATUS_IN_USE } else { DirEntry::STATUS_IN_USE },
            map,
            len: if is_dir { 23 } else { meta.len() as u32 },
            name: key,
            timestamp: file_timestamp(&meta),
        });
    }
    Ok(entries)
}

/// What one of the 16 handles currently holds.
pub enum OpenEntity {
    File(fs::File),
    Directory { snapshot: Vec<DirEntry>, cursor: usize, pattern: [u8; 11] },
}

pub struct IoDescriptor {
    pub entity: OpenEntity,
    pub pos: u64,
    pub eof: bool,
    pub local_path: PathBuf,
    pub pending_mtime: Option<[u8; 6]>,
}

/// Root + current working directory for one PCL-bound unit.
pub struct Mount {
    pub root: PathBuf,
    pub cwd: String,
    pub uppercase: bool,
}

impl Mount {
    pub fn new(root: PathBuf, uppercase: bool) -> Self {
        Self { root, cwd: String::new(), uppercase }
    }

    /// `create_user_path`: resolves a request path (possibly containing
    /// `>`/`\` separators and `<` for "parent") against root+cwd, rejecting
    /// any attempt to climb above the mount root.
    pub fn resolve(&self, request: &str) -> Result<(PathBuf, String)> {
        // Each `<` is a positional "go up one level", not only a whole
        // path segment on its own — `path2unix` emits ".." for every `<`
        // byte it sees, wherever it falls, before the separator split.
        let mut normalized = String::with_capacity(request.len());
        for c in request.chars() {
            match c {
                '>' | '\\' => normalized.push('/'),
                '<' => normalized.push_str("/.."),
                other => normalized.push(other),
            }
        }
        let mut stack: Vec<String> = self.cwd.split('/').filter(|s| !s.is_empty()).map(String::from).collect();
        for comp in normalized.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    if stack.pop().is_none() {
                        return Err(PclError::InvalidPath);
                    }
                }
                other => stack.push(other.to_string()),
            }
        }
        let rel = stack.join("/");
        let mut full = self.root.clone();
        if !rel.is_empty() {
            full.push(&rel);
        }
        Ok((full, rel))
    }

    pub fn chdir(&mut self, request: &str) -> Result<()> {
        let (path, rel) = self.resolve(request)?;
        if !path.is_dir() {
            return Err(PclError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory")));
        }
        self.cwd = rel;
        Ok(())
    }

    pub fn getcwd_display(&self) -> String {
        let mut s = String::from(">");
        s.push_str(&self.cwd.split('/').collect::<Vec<_>>().join(">"));
        s.to_uppercase()
    }
}

/// The 16-handle table, shared across all PCL-bound units (matching the
/// flat `iodesc[0..15]` addressing of the original protocol).
pub struct PclServer {
    pub handles: Vec<Option<IoDescriptor>>,
}

impl PclServer {
    pub fn new() -> Self {
        let mut handles = Vec::with_capacity(16);
        handles.resize_with(16, || None);
        Self { handles }
    }

    fn alloc(&mut self) -> Result<u8> {
        for (i, slot) in self.handles.iter().enumerate() {
            if slot.is_none() {
                return Ok(i as u8);
            }
        }
        Err(PclError::NoFreeHandle)
    }

    fn get(&mut self, handle: u8) -> Result<&mut IoDescriptor> {
        self.handles
            .get_mut(handle as usize)
            .and_then(|s| s.as_mut())
            .ok_or(PclError::BadHandle(handle))
    }

    pub fn close_all(&mut self) {
        for slot in self.handles.iter_mut() {
            Self::apply_pending_mtime(slot);
            *slot = None;
        }
    }

    fn apply_pending_mtime(slot: &mut Option<IoDescriptor>) {
        if let Some(desc) = slot {
            if let Some(ts) = desc.pending_mtime {
                if ts != [0u8; 6] {
                    if let Some(time) = sdx_to_system_time(&ts) {
                        if let OpenEntity::File(file) = &desc.entity {
                            let _ = file.set_modified(time);
                        } else if let Ok(f) = fs::OpenOptions::new().write(true).open(&desc.local_path) {
                            let _ = f.set_modified(time);
                        }
                    }
                }
            }
        }
    }

    pub fn init(&mut self) {
        self.close_all();
    }

    pub fn open_file(&mut self, mount: &Mount, par: &ParBlock) -> std::result::Result<(u8, DirEntry), u8> {
        let req = cstr(&par.path);
        let (path, _rel) = mount.resolve(&req).map_err(|e| e.code())?;
        let name = cstr(&par.name);
        let key = normalize_name(&name, mount.uppercase).ok_or(err::INVALID_NAME)?;

        let fmode = par.fmode;
        let meta_existing = path.metadata().ok();
        let open_mode_create = fmode == 0x08 || fmode == 0x09 || fmode == 0x0c;
        if meta_existing.is_none() && !open_mode_create {
            return Err(err::NOT_FOUND);
        }
        if let Some(meta) = &meta_existing {
            let readonly = meta.permissions().readonly();
            if readonly && (fmode == 0x08 || fmode == 0x09 || fmode == 0x0c) {
                return Err(err::FILE_EXISTS);
            }
        }

        let handle = self.alloc().map_err(|e| e.code())?;
        let mut options = fs::OpenOptions::new();
        match fmode {
            0x04 => {
                options.read(true);
            }
            0x08 => {
                options.read(true).write(true).create(true).truncate(true);
            }
            0x09 => {
                options.read(true).write(true).create(true);
            }
            0x0c => {
                options.read(true).write(true).create(true);
            }
            _ => return Err(err::UNSUPPORTED_MODE),
        }
        let mut file = options.open(&path).map_err(|e| PclError::Io(e).code())?;
        if fmode == 0x09 {
            let _ = file.seek(SeekFrom::End(0));
        }
        let meta = file.metadata().map_err(|e| PclError::Io(e).code())?;
        let entry = DirEntry {
            status: DirEntry::STATUS_IN_USE,
            map: 0,
            len: meta.len() as u32,
            name: key,
            timestamp: file_timestamp(&meta),
        };
        self.handles[handle as usize] =
            Some(IoDescriptor { entity: OpenEntity::File(file), pos: 0, eof: false, local_path: path, pending_mtime: None });
        Ok((handle, entry))
    }

    pub fn open_dir(&mut self, mount: &Mount, par: &ParBlock) -> std::result::Result<u8, u8> {
        let req = cstr(&par.path);
        let (path, rel) = mount.resolve(&req).map_err(|e| e.code())?;
        let snapshot = cache_dir(&path, &rel, mount.uppercase).map_err(|e| e.code())?;
        let pattern = normalize_name(&cstr(&par.name), mount.uppercase).unwrap_or([b'?'; 11]);
        let handle = self.alloc().map_err(|e| e.code())?;
        self.handles[handle as usize] = Some(IoDescriptor {
            entity: OpenEntity::Directory { snapshot, cursor: 0, pattern },
            pos: 0,
            eof: false,
            local_path: path,
            pending_mtime: None,
        });
        Ok(handle)
    }

    pub fn close(&mut self, handle: u8, mtime: Option<[u8; 6]>) -> std::result::Result<(), u8> {
        let desc = self.get(handle).map_err(|e| e.code())?;
        desc.pending_mtime = mtime;
        let mut slot = self.handles[handle as usize].take();
        Self::apply_pending_mtime(&mut slot);
        Ok(())
    }

    pub fn read(&mut self, handle: u8, len: usize) -> std::result::Result<(Vec<u8>, u8), u8> {
        let desc = self.get(handle).map_err(|e| e.code())?;
        match &mut desc.entity {
            OpenEntity::File(file) => {
                file.seek(SeekFrom::Start(desc.pos)).map_err(|e| PclError::Io(e).code())?;
                let mut buf = vec![0u8; len];
                let n = file.read(&mut buf).map_err(|e| PclError::Io(e).code())?;
                if n == 0 && len > 0 {
                    return Err(err::EOF);
                }
                buf.truncate(n);
                desc.pos += n as u64;
                let code = if n < len { err::LAST_PACKET } else { err::OK };
                Ok((buf, code))
            }
            OpenEntity::Directory { .. } => Ok((Vec::new(), err::OK)),
        }
    }

    pub fn write(&mut self, handle: u8, data: &[u8]) -> std::result::Result<(), u8> {
        let desc = self.get(handle).map_err(|e| e.code())?;
        if let OpenEntity::File(file) = &mut desc.entity {
            file.seek(SeekFrom::Start(desc.pos)).map_err(|e| PclError::Io(e).code())?;
            file.write_all(data).map_err(|e| PclError::Io(e).code())?;
            desc.pos += data.len() as u64;
        }
        Ok(())
    }

    pub fn seek(&mut self, handle: u8, pos: u64) -> std::result::Result<(), u8> {
        let desc = self.get(handle).map_err(|e| e.code())?;
        desc.pos = pos;
        Ok(())
    }

    pub fn tell(&mut self, handle: u8) -> std::result::Result<u64, u8> {
        Ok(self.get(handle).map_err(|e| e.code())?.pos)
    }

    pub fn len(&mut self, handle: u8) -> std::result::Result<u64, u8> {
        let desc = self.get(handle).map_err(|e| e.code())?;
        match &desc.entity {
            OpenEntity::File(file) => Ok(file.metadata().map_err(|e| PclError::Io(e).code())?.len()),
            OpenEntity::Directory { snapshot, .. } => Ok(snapshot.len() as u64 * 23),
        }
    }

    pub fn next(&mut self, handle: u8) -> std::result::Result<(Vec<u8>, u8), u8> {
        let desc = self.get(handle).map_err(|e| e.code())?;
        match &mut desc.entity {
            OpenEntity::Directory { snapshot, cursor, pattern } => {
                while *cursor < snapshot.len() {
                    let e = snapshot[*cursor];
                    *cursor += 1;
                    if pattern_matches(pattern, &e.name) {
                        return Ok((e.to_bytes().to_vec(), err::OK));
                    }
                }
                Err(err::NOT_FOUND)
            }
            OpenEntity::File(_) => Err(err::BAD_FUNCTION),
        }
    }

    /// Pattern-rename: every host entry whose 8+3 key matches `par.name`
    /// is renamed by overlaying `par.names` over it position-by-position,
    /// `?` bytes keeping the original character.
    pub fn rename(&mut self, mount: &Mount, par: &ParBlock) -> std::result::Result<Option<Vec<u8>>, u8> {
        let req = cstr(&par.path);
        let (dir, _rel) = mount.resolve(&req).map_err(|e| e.code())?;
        let src_pattern = normalize_name(&cstr(&par.name), mount.uppercase).ok_or(err::INVALID_NAME)?;
        let dst_pattern = normalize_name(&cstr(&par.names), mount.uppercase).ok_or(err::INVALID_NAME)?;
        let mut matched = false;
        for entry in fs::read_dir(&dir).map_err(|e| PclError::Io(e).code())?.filter_map(|e| e.ok()) {
            let name_str = match entry.file_name().to_str().map(str::to_string) {
                Some(s) if !s.starts_with('.') => s,
                _ => continue,
            };
            let key = match normalize_name(&name_str, mount.uppercase) {
                Some(k) => k,
                None => continue,
            };
            if !pattern_matches(&src_pattern, &key) {
                continue;
            }
            let mut new_key = key;
            for i in 0..11 {
                if dst_pattern[i] != b'?' {
                    new_key[i] = dst_pattern[i];
                }
            }
            let new_name = key_to_filename(&new_key, mount.uppercase);
            if fs::rename(entry.path(), dir.join(new_name)).is_ok() {
                matched = true;
            }
        }
        if matched {
            Ok(None)
        } else {
            Err(err::NOT_FOUND)
        }
    }

    /// Unlinks every matching host entry that isn't a directory.
    pub fn remove(&mut self, mount: &Mount, par: &ParBlock) -> std::result::Result<Option<Vec<u8>>, u8> {
        let req = cstr(&par.path);
        let (dir, _rel) = mount.resolve(&req).map_err(|e| e.code())?;
        let pattern = normalize_name(&cstr(&par.name), mount.uppercase).ok_or(err::INVALID_NAME)?;
        let mut matched = false;
        for entry in fs::read_dir(&dir).map_err(|e| PclError::Io(e).code())?.filter_map(|e| e.ok()) {
            let name_str = match entry.file_name().to_str().map(str::to_string) {
                Some(s) if !s.starts_with('.') => s,
                _ => continue,
            };
            let key = match normalize_name(&name_str, mount.uppercase) {
                Some(k) => k,
                None => continue,
            };
            if !pattern_matches(&pattern, &key) {
                continue;
            }
            let is_dir = entry.metadata().map(|m| m.is_dir()).unwrap_or(false);
            if is_dir {
                continue;
            }
            if fs::remove_file(entry.path()).is_ok() {
                matched = true;
            }
        }
        if matched {
            Ok(None)
        } else {
            Err(err::NOT_FOUND)
        }
    }

    /// Flips the host write-permission bit per `fatr2`'s protect flag.
    /// Toggling the subdirectory bit through CHMOD is illegal.
    pub fn chmod(&mut self, mount: &Mount, par: &ParBlock) -> std::result::Result<Option<Vec<u8>>, u8> {
        if par.fatr2 & DirEntry::STATUS_SUBDIR != 0 {
            return Err(err::UNSUPPORTED_MODE);
        }
        let req = cstr(&par.path);
        let (dir, _rel) = mount.resolve(&req).map_err(|e| e.code())?;
        let pattern = normalize_name(&cstr(&par.name), mount.uppercase).ok_or(err::INVALID_NAME)?;
        let protect = par.fatr2 & DirEntry::STATUS_PROTECTED != 0;
        let mut matched = false;
        for entry in fs::read_dir(&dir).map_err(|e| PclError::Io(e).code())?.filter_map(|e| e.ok()) {
            let name_str = match entry.file_name().to_str().map(str::to_string) {
                Some(s) if !s.starts_with('.') => s,
                _ => continue,
            };
            let key = match normalize_name(&name_str, mount.uppercase) {
                Some(k) => k,
                None => continue,
            };
            if !pattern_matches(&pattern, &key) {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                let mut perm = meta.permissions();
                perm.set_readonly(protect);
                if fs::set_permissions(entry.path(), perm).is_ok() {
                    matched = true;
                }
            }
        }
        if matched {
            Ok(None)
        } else {
            Err(err::NOT_FOUND)
        }
    }

    /// Creates a directory and, when a nonzero timestamp was supplied,
    /// stamps it the same way FCLOSE restores a file's mtime.
    pub fn mkdir(&mut self, mount: &Mount, par: &ParBlock) -> std::result::Result<Option<Vec<u8>>, u8> {
        let req = cstr(&par.path);
        let (dir, _rel) = mount.resolve(&req).map_err(|e| e.code())?;
        let key = normalize_name(&cstr(&par.name), mount.uppercase).ok_or(err::INVALID_NAME)?;
        let target = dir.join(key_to_filename(&key, mount.uppercase));
        if target.exists() {
            return Err(err::FILE_EXISTS);
        }
        fs::create_dir(&target).map_err(|e| PclError::Io(e).code())?;
        if par.f != [0u8; 6] {
            if let Some(time) = sdx_to_system_time(&par.f) {
                if let Ok(f) = fs::File::open(&target) {
                    let _ = f.set_modified(time);
                }
            }
        }
        Ok(None)
    }

    /// Removes an empty directory, surfacing err 167 when it isn't.
    pub fn rmdir(&mut self, mount: &Mount, par: &ParBlock) -> std::result::Result<Option<Vec<u8>>, u8> {
        let req = cstr(&par.path);
        let (dir, _rel) = mount.resolve(&req).map_err(|e| e.code())?;
        let key = normalize_name(&cstr(&par.name), mount.uppercase).ok_or(err::INVALID_NAME)?;
        let target = dir.join(key_to_filename(&key, mount.uppercase));
        match fs::remove_dir(&target) {
            Ok(()) => Ok(None),
            Err(e) => {
                if e.raw_os_error() == Some(39) {
                    // ENOTEMPTY on Linux
                    Err(err::DIR_NOT_EMPTY)
                } else {
                    Err(PclError::Io(e).code())
                }
            }
        }
    }

    /// Emits a fixed-size disk-info block carrying the mount's volume
    /// label (read back from the hidden label file, or a default).
    pub fn dfree(&mut self, mount: &Mount, unit: usize) -> std::result::Result<Option<Vec<u8>>, u8> {
        let mut block = vec![0u8; 65];
        let label = Self::read_volume_label(mount, unit);
        block[57..65].copy_from_slice(&label);
        Ok(Some(block))
    }

    fn read_volume_label(mount: &Mount, unit: usize) -> [u8; 8] {
        if let Ok(data) = fs::read(mount.root.join(VOLUME_LABEL_FILE)) {
            if data.len() >= 8 {
                let mut label = [b' '; 8];
                label.copy_from_slice(&data[..8]);
                return label;
            }
        }
        let mut label = *b"PCLink  ";
        label[7] = b'0' + (unit as u8 % 10);
        label
    }

    /// Writes the requested 8-byte label to the hidden per-mount file,
    /// treating NUL/EOL bytes as space padding.
    pub fn chvol(&mut self, mount: &Mount, par: &ParBlock) -> std::result::Result<Option<Vec<u8>>, u8> {
        let mut label = [b' '; 8];
        for (i, slot) in label.iter_mut().enumerate() {
            let b = par.name.get(i).copied().unwrap_or(b' ');
            *slot = if b == 0 || b == 0x9b { b' ' } else { b };
        }
        fs::write(mount.root.join(VOLUME_LABEL_FILE), label).map_err(|e| PclError::Io(e).code())?;
        Ok(None)
    }
}

impl Default for PclServer {
    fn default() -> Self {
        Self::new()
    }
}

fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn normalize_rejects_long_names() {
        assert!(normalize_name("averylongname.txt", false).is_none());
        assert!(normalize_name("ok.abcd", false).is_none());
        assert!(normalize_name("ok.txt", false).is_some());
    }

    #[test]
    fn pattern_matches_with_wildcards() {
        let pattern = normalize_name("????????txt", false).unwrap();
        let key = normalize_name("a.txt", false).unwrap();
        assert!(pattern_matches(&pattern, &key));
        let other = normalize_name("a.dat", false).unwrap();
        assert!(!pattern_matches(&pattern, &other));
    }

    #[test]
    fn name_charset_honors_case_mode() {
        assert!(normalize_name("Abc.txt", true).is_none());
        assert!(normalize_name("ABC.TXT", true).is_some());
        assert!(normalize_name("Abc.txt", false).is_none());
        assert!(normalize_name("abc.txt", false).is_some());
    }

    #[test]
    fn resolve_rejects_escape_above_root() {
        let tmp = TempDir::new().unwrap();
        let mount = Mount::new(tmp.path().to_path_buf(), false);
        assert!(mount.resolve("<<<<<<").is_err());
    }

    #[test]
    fn resolve_joins_cwd_and_request() {
        let tmp = TempDir::new().unwrap();
        let mut mount = Mount::new(tmp.path().to_path_buf(), false);
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        mount.chdir("sub").unwrap();
        let (path, rel) = mount.resolve("..").unwrap();
        assert_eq!(path, tmp.path());
        assert_eq!(rel, "");
    }

    #[test]
    fn fopen_read_then_close_frees_handle() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("foo.txt"), b"hi").unwrap();
        let mount = Mount::new(tmp.path().to_path_buf(), false);
        let mut srv = PclServer::new();
        let mut par = ParBlock::default();
        par.fmode = 0x04;
        par.name[..7].copy_from_slice(b"foo.txt");
        let (handle, entry) = srv.open_file(&mount, &par).unwrap();
        assert_eq!(entry.len, 2);
        let (data, code) = srv.read(handle, 2).unwrap();
        assert_eq!(data, b"hi");
        assert!(code == err::OK || code == err::LAST_PACKET);
        srv.close(handle, None).unwrap();
        assert!(srv.handles[handle as usize].is_none());
    }

    #[test]
    fn rename_pattern_style_matches_extension_only() {
        let pattern = normalize_name("????????txt", false).unwrap();
        assert!(pattern_matches(&pattern, &normalize_name("a.txt", false).unwrap()));
        assert!(pattern_matches(&pattern, &normalize_name("b.txt", false).unwrap()));
        assert!(!pattern_matches(&pattern, &normalize_name("c.dat", false).unwrap()));
    }

    #[test]
    fn rename_renames_matching_pattern_and_skips_others() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"1").unwrap();
        std::fs::write(tmp.path().join("b.txt"), b"2").unwrap();
        std::fs::write(tmp.path().join("c.dat"), b"3").unwrap();
        let mount = Mount::new(tmp.path().to_path_buf(), false);
        let mut srv = PclServer::new();
        let mut par = ParBlock::default();
        par.name[..11].copy_from_slice(b"????????txt");
        par.names[..11].copy_from_slice(b"????????bak");
        srv.rename(&mount, &par).unwrap();
        assert!(tmp.path().join("a.bak").exists());
        assert!(tmp.path().join("b.bak").exists());
        assert!(tmp.path().join("c.dat").exists());
        assert!(!tmp.path().join("a.txt").exists());

        let mut par2 = ParBlock::default();
        par2.name[..11].copy_from_slice(b"????????txt");
        par2.names[..11].copy_from_slice(b"????????old");
        assert_eq!(srv.rename(&mount, &par2), Err(err::NOT_FOUND));
    }

    #[test]
    fn mkdir_then_rmdir_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mount = Mount::new(tmp.path().to_path_buf(), false);
        let mut srv = PclServer::new();
        let mut par = ParBlock::default();
        par.name[..3].copy_from_slice(b"sub");
        srv.mkdir(&mount, &par).unwrap();
        assert!(tmp.path().join("sub").is_dir());
        srv.rmdir(&mount, &par).unwrap();
        assert!(!tmp.path().join("sub").exists());
    }

    #[test]
    fn rmdir_reports_not_empty() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub").join("x.txt"), b"x").unwrap();
        let mount = Mount::new(tmp.path().to_path_buf(), false);
        let mut srv = PclServer::new();
        let mut par = ParBlock::default();
        par.name[..3].copy_from_slice(b"sub");
        assert_eq!(srv.rmdir(&mount, &par), Err(err::DIR_NOT_EMPTY));
    }

    #[test]
    fn chvol_then_dfree_reports_label() {
        let tmp = TempDir::new().unwrap();
        let mount = Mount::new(tmp.path().to_path_buf(), false);
        let mut srv = PclServer::new();
        let mut par = ParBlock::default();
        par.name[..8].copy_from_slice(b"MYDISK\0\0");
        srv.chvol(&mount, &par).unwrap();
        let payload = srv.dfree(&mount, 1).unwrap().unwrap();
        assert_eq!(payload.len(), 65);
        assert_eq!(&payload[57..65], b"MYDISK  ");
    }
}
