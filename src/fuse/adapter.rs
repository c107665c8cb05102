// FUSE adapter - serves any MountSource read-only through fuser
//
// FUSE callbacks are synchronous while mount sources are async. The adapter
// owns a dedicated tokio runtime and blocks on it from the FUSE threads, so
// it never calls block_on from inside the caller's runtime.

use fuser::{
    FileType as FuseFileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, Request,
};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime};
use tokio::runtime::Runtime;

use crate::fs::path::{MAX_FILENAME_LENGTH, join_path};
use crate::source::{FileHandle, FileInfo, FileKind, MountSource};

/// Attribute and entry cache lifetime handed to the kernel. The tree never
/// changes while mounted.
const TTL: Duration = Duration::from_secs(60);

const BLOCK_SIZE: u32 = 4096;

/// Inode <-> path bidirectional mapping. Inode 1 is the root.
struct InodeMap {
    inode_to_path: HashMap<u64, String>,
    path_to_inode: HashMap<String, u64>,
    next_inode: u64,
}

impl InodeMap {
    fn new() -> Self {
        let mut map = Self {
            inode_to_path: HashMap::new(),
            path_to_inode: HashMap::new(),
            next_inode: fuser::FUSE_ROOT_ID + 1,
        };
        map.inode_to_path.insert(fuser::FUSE_ROOT_ID, "/".to_string());
        map.path_to_inode.insert("/".to_string(), fuser::FUSE_ROOT_ID);
        map
    }

    fn get_or_create(&mut self, path: &str) -> u64 {
        if let Some(&inode) = self.path_to_inode.get(path) {
            return inode;
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.inode_to_path.insert(inode, path.to_string());
        self.path_to_inode.insert(path.to_string(), inode);
        inode
    }

    fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(|s| s.as_str())
    }

    fn len(&self) -> usize {
        self.inode_to_path.len()
    }
}

/// Open file handles keyed by the `fh` returned to the kernel.
struct HandleTable {
    handles: HashMap<u64, Arc<Mutex<FileHandle>>>,
    next_fh: u64,
}

impl HandleTable {
    fn new() -> Self {
        Self { handles: HashMap::new(), next_fh: 1 }
    }

    fn insert(&mut self, handle: FileHandle) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, Arc::new(Mutex::new(handle)));
        fh
    }

    fn get(&self, fh: u64) -> Option<Arc<Mutex<FileHandle>>> {
        self.handles.get(&fh).cloned()
    }

    fn remove(&mut self, fh: u64) -> bool {
        self.handles.remove(&fh).is_some()
    }
}

/// Read-only `fuser::Filesystem` over a mount source.
pub struct FuseAdapter {
    source: Arc<dyn MountSource>,
    // Taken on drop and shut down in the background, so dropping the
    // adapter is safe from any context.
    runtime: Option<Runtime>,
    inodes: RwLock<InodeMap>,
    handles: Mutex<HandleTable>,
    uid: u32,
    gid: u32,
}

impl FuseAdapter {
    pub fn new(source: Arc<dyn MountSource>) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .thread_name("arcmount-fuse")
            .enable_all()
            .build()?;

        Ok(Self {
            source,
            runtime: Some(runtime),
            inodes: RwLock::new(InodeMap::new()),
            handles: Mutex::new(HandleTable::new()),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        })
    }

    fn block_on<F: Future>(&self, future: F) -> Result<F::Output, libc::c_int> {
        match &self.runtime {
            Some(runtime) => Ok(runtime.block_on(future)),
            None => Err(libc::EIO),
        }
    }

    fn inodes(&self) -> std::sync::RwLockReadGuard<'_, InodeMap> {
        self.inodes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn inodes_mut(&self) -> std::sync::RwLockWriteGuard<'_, InodeMap> {
        self.inodes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handles(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_path(&self, inode: u64) -> Result<String, libc::c_int> {
        self.inodes().get_path(inode).map(str::to_string).ok_or(libc::ENOENT)
    }

    fn resolve(&self, path: &str) -> Result<FileInfo, libc::c_int> {
        match self.block_on(self.source.lookup(path))? {
            Ok(Some(info)) => Ok(info),
            Ok(None) => Err(libc::ENOENT),
            Err(e) => {
                tracing::debug!(path, error = %e, "Lookup failed");
                Err(e.to_errno())
            }
        }
    }

    fn resolve_inode(&self, inode: u64) -> Result<FileInfo, libc::c_int> {
        self.resolve(&self.get_path(inode)?)
    }

    fn to_fuse_attr(&self, inode: u64, info: &FileInfo) -> fuser::FileAttr {
        let mtime = SystemTime::from(info.mtime);
        fuser::FileAttr {
            ino: inode,
            size: info.size,
            blocks: info.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: fuse_kind(info.kind()),
            perm: info.permissions() as u16,
            nlink: if info.is_dir() { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<fuser::FileAttr, libc::c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        let path = join_path(&self.get_path(parent)?, name);
        let info = self.resolve(&path)?;
        let inode = self.inodes_mut().get_or_create(&path);
        Ok(self.to_fuse_attr(inode, &info))
    }

    fn do_getattr(&self, inode: u64) -> Result<fuser::FileAttr, libc::c_int> {
        let info = self.resolve_inode(inode)?;
        Ok(self.to_fuse_attr(inode, &info))
    }

    fn do_readlink(&self, inode: u64) -> Result<Vec<u8>, libc::c_int> {
        let info = self.resolve_inode(inode)?;
        match (info.is_symlink(), info.linkname) {
            (true, Some(target)) => Ok(target.into_bytes()),
            _ => Err(libc::EINVAL),
        }
    }

    fn do_open(&self, inode: u64, flags: i32) -> Result<u64, libc::c_int> {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(libc::EROFS);
        }
        let info = self.resolve_inode(inode)?;
        let handle = self.block_on(self.source.open(&info))?.map_err(|e| {
            tracing::warn!(path = %info.path, error = %e, "Open failed");
            e.to_errno()
        })?;
        let fh = self.handles().insert(handle);
        tracing::debug!(path = %info.path, fh, "Opened file");
        Ok(fh)
    }

    fn do_read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, libc::c_int> {
        let offset = u64::try_from(offset).map_err(|_| libc::EINVAL)?;
        let handle = self.handles().get(fh).ok_or(libc::EBADF)?;
        let mut handle = handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        handle.read_range(size as usize, offset).map_err(|e| {
            tracing::warn!(path = %handle.info().path, offset, error = %e, "Read failed");
            e.to_errno()
        })
    }

    fn do_release(&self, fh: u64) -> Result<(), libc::c_int> {
        if self.handles().remove(fh) { Ok(()) } else { Err(libc::EBADF) }
    }

    /// Directory entries including `.` and `..`, in listing order.
    fn do_readdir(&self, inode: u64) -> Result<Vec<(u64, FuseFileType, String)>, libc::c_int> {
        let path = self.get_path(inode)?;
        let children = self.block_on(self.source.list_modes(&path))?.map_err(|e| e.to_errno())?;

        let mut inodes = self.inodes_mut();
        let parent = match crate::fs::path::split_path(&path) {
            Some((parent, _)) => inodes.get_or_create(parent),
            None => inode,
        };
        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push((inode, FuseFileType::Directory, ".".to_string()));
        entries.push((parent, FuseFileType::Directory, "..".to_string()));
        for (name, mode) in children {
            let child = inodes.get_or_create(&join_path(&path, &name));
            entries.push((child, fuse_kind(FileKind::from_mode(mode)), name));
        }
        Ok(entries)
    }
}

impl Drop for FuseAdapter {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn fuse_kind(kind: FileKind) -> FuseFileType {
    match kind {
        FileKind::RegularFile => FuseFileType::RegularFile,
        FileKind::Directory => FuseFileType::Directory,
        FileKind::Symlink => FuseFileType::Symlink,
        FileKind::Fifo => FuseFileType::NamedPipe,
        FileKind::CharDevice => FuseFileType::CharDevice,
        FileKind::BlockDevice => FuseFileType::BlockDevice,
        FileKind::Socket => FuseFileType::Socket,
    }
}

impl Filesystem for FuseAdapter {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        tracing::info!("FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        let open = self.handles().handles.len();
        if let Ok(Err(e)) = self.block_on(self.source.close()) {
            tracing::warn!(error = %e, "Failed to close mount source");
        }
        tracing::info!(open_handles = open, "FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.do_readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.do_open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.do_read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.do_release(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.do_readdir(ino) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (inode, kind, name)) in entries.iter().enumerate().skip(skip) {
            if reply.add(*inode, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let files = self.inodes().len() as u64;
        reply.statfs(0, 0, 0, files, 0, BLOCK_SIZE, MAX_FILENAME_LENGTH as u32, BLOCK_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SingleFileSource;

    fn adapter() -> FuseAdapter {
        let source = SingleFileSource::new("/dir/hello.txt", b"hello fuse".to_vec());
        FuseAdapter::new(Arc::new(source)).unwrap()
    }

    #[test]
    fn test_inode_map_new() {
        let map = InodeMap::new();
        assert_eq!(map.get_path(fuser::FUSE_ROOT_ID), Some("/"));
        assert_eq!(map.next_inode, 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_inode_map_get_or_create() {
        let mut map = InodeMap::new();
        let ino1 = map.get_or_create("/test");
        let ino2 = map.get_or_create("/test");
        assert_eq!(ino1, ino2);
        assert_eq!(map.get_path(ino1), Some("/test"));
        assert_eq!(map.get_or_create("/"), fuser::FUSE_ROOT_ID);
    }

    #[test]
    fn test_lookup_and_getattr() {
        let adapter = adapter();
        let dir = adapter.do_lookup(fuser::FUSE_ROOT_ID, OsStr::new("dir")).unwrap();
        assert_eq!(dir.kind, FuseFileType::Directory);
        assert_eq!(dir.nlink, 2);

        let file = adapter.do_lookup(dir.ino, OsStr::new("hello.txt")).unwrap();
        assert_eq!(file.kind, FuseFileType::RegularFile);
        assert_eq!(file.size, 10);
        assert_eq!(adapter.do_getattr(file.ino).unwrap().size, 10);

        assert_eq!(adapter.do_lookup(dir.ino, OsStr::new("missing")).unwrap_err(), libc::ENOENT);
        assert_eq!(adapter.do_getattr(999).unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn test_open_read_release() {
        let adapter = adapter();
        let dir = adapter.do_lookup(fuser::FUSE_ROOT_ID, OsStr::new("dir")).unwrap();
        let file = adapter.do_lookup(dir.ino, OsStr::new("hello.txt")).unwrap();

        assert_eq!(adapter.do_open(file.ino, libc::O_RDWR), Err(libc::EROFS));

        let fh = adapter.do_open(file.ino, libc::O_RDONLY).unwrap();
        assert_eq!(adapter.do_read(fh, 6, 100).unwrap(), b"fuse");
        assert_eq!(adapter.do_read(fh, 0, 5).unwrap(), b"hello");
        assert!(adapter.do_read(fh, 10, 5).unwrap().is_empty());

        adapter.do_release(fh).unwrap();
        assert_eq!(adapter.do_read(fh, 0, 5), Err(libc::EBADF));
        assert_eq!(adapter.do_release(fh), Err(libc::EBADF));
    }

    #[test]
    fn test_open_directory_fails() {
        let adapter = adapter();
        let dir = adapter.do_lookup(fuser::FUSE_ROOT_ID, OsStr::new("dir")).unwrap();
        assert_eq!(adapter.do_open(dir.ino, libc::O_RDONLY), Err(libc::EISDIR));
    }

    #[test]
    fn test_readdir_includes_dot_entries() {
        let adapter = adapter();
        let root = adapter.do_readdir(fuser::FUSE_ROOT_ID).unwrap();
        let names: Vec<&str> = root.iter().map(|(_, _, name)| name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "dir"]);
        assert_eq!(root[1].0, fuser::FUSE_ROOT_ID);

        let dir_ino = root[2].0;
        let dir = adapter.do_readdir(dir_ino).unwrap();
        assert_eq!(dir[1].0, fuser::FUSE_ROOT_ID);
        assert_eq!(dir[2].1, FuseFileType::RegularFile);
        assert_eq!(dir[2].2, "hello.txt");
    }

    #[test]
    fn test_readlink_requires_symlink() {
        let adapter = adapter();
        let dir = adapter.do_lookup(fuser::FUSE_ROOT_ID, OsStr::new("dir")).unwrap();
        assert_eq!(adapter.do_readlink(dir.ino), Err(libc::EINVAL));
    }
}
