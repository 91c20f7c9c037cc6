//! FUSE filesystem over the metadata cache and the chunk manager
//!
//! Directory operations go through [`MetadataCache`]; file contents are
//! served by [`ChunkManager::read`]. Writes to file contents are refused.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyXattr, Request,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use common::chunk::ChunkManager;
use common::metadata::MetadataCache;
use common::object::Object;

use super::errno;
use super::inode_table::InodeTable;

/// Existing destinations are never replaced, so this flag needs no handling.
const RENAME_NOREPLACE: u32 = 1;

/// Filesystem handed to the FUSE session
pub struct DriveFs {
    /// Tokio runtime handle for async operations
    rt: Handle,
    cache: Arc<MetadataCache>,
    chunks: Arc<ChunkManager>,
    inodes: Mutex<InodeTable>,
    uid: u32,
    gid: u32,
    next_fh: AtomicU64,
}

impl DriveFs {
    /// Default TTL for FUSE attributes
    const ATTR_TTL: Duration = Duration::from_secs(1);

    /// Block size for FUSE
    const BLOCK_SIZE: u32 = 512;

    pub fn new(
        rt: Handle,
        cache: Arc<MetadataCache>,
        chunks: Arc<ChunkManager>,
        root: &Object,
        uid: u32,
        gid: u32,
    ) -> Self {
        Self {
            rt,
            cache,
            chunks,
            inodes: Mutex::new(InodeTable::new(&root.object_id)),
            uid,
            gid,
            next_fh: AtomicU64::new(1),
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    fn make_attr(&self, inode: u64, object: &Object) -> FileAttr {
        let (kind, perm) = if object.is_dir {
            (FileType::Directory, 0o755)
        } else {
            (FileType::RegularFile, 0o644)
        };
        let mtime = SystemTime::from(object.last_modified);

        FileAttr {
            ino: inode,
            size: object.size,
            blocks: object.size.div_ceil(Self::BLOCK_SIZE as u64),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink: if object.is_dir { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: Self::BLOCK_SIZE,
            flags: 0,
        }
    }

    fn object_id(&self, inode: u64) -> Option<String> {
        self.inodes.lock().object_id(inode).map(str::to_string)
    }

    fn inode(&self, object_id: &str) -> u64 {
        self.inodes.lock().get_or_create(object_id)
    }

    fn object(&self, inode: u64) -> Result<Object, libc::c_int> {
        let object_id = self.object_id(inode).ok_or(libc::ENOENT)?;
        self.rt
            .block_on(self.cache.get(&object_id))
            .map_err(|e| errno(&e))
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<(String, Object), libc::c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        let parent_id = self.object_id(parent).ok_or(libc::ENOENT)?;
        let object = self
            .rt
            .block_on(self.cache.lookup(&parent_id, name))
            .map_err(|e| errno(&e))?;
        Ok((parent_id, object))
    }

    fn remove_child(&self, parent: u64, name: &OsStr, dir: bool) -> Result<(), libc::c_int> {
        let (parent_id, object) = self.child(parent, name)?;
        match (dir, object.is_dir) {
            (true, false) => return Err(libc::ENOTDIR),
            (false, true) => return Err(libc::EISDIR),
            _ => {}
        }
        if dir {
            let children = self
                .rt
                .block_on(self.cache.list(&object.object_id))
                .map_err(|e| errno(&e))?;
            if !children.is_empty() {
                return Err(libc::ENOTEMPTY);
            }
        }

        self.rt
            .block_on(self.cache.remove(&object.object_id, &parent_id))
            .map_err(|e| {
                tracing::error!(object_id = %object.object_id, error = %e, "remove failed");
                errno(&e)
            })?;
        // objects with other parents stay reachable under the same inode
        if object.parents.len() <= 1 {
            self.inodes.lock().remove(&object.object_id);
        }
        Ok(())
    }
}

impl Filesystem for DriveFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        tracing::info!("FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.child(parent, name) {
            Ok((_, object)) => {
                let inode = self.inode(&object.object_id);
                reply.entry(&Self::ATTR_TTL, &self.make_attr(inode, &object), 0);
            }
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.object(ino) {
            Ok(object) => reply.attr(&Self::ATTR_TTL, &self.make_attr(ino, &object)),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let object = match self.object(ino) {
            Ok(object) if object.is_dir => object,
            Ok(_) => {
                reply.error(libc::ENOTDIR);
                return;
            }
            Err(code) => {
                reply.error(code);
                return;
            }
        };

        let children = match self.rt.block_on(self.cache.list(&object.object_id)) {
            Ok(children) => children,
            Err(e) => {
                tracing::error!(object_id = %object.object_id, error = %e, "readdir failed");
                reply.error(errno(&e));
                return;
            }
        };

        let parent_ino = if ino == InodeTable::ROOT_INODE {
            ino
        } else {
            object
                .parents
                .first()
                .map(|parent| self.inode(parent))
                .unwrap_or(InodeTable::ROOT_INODE)
        };

        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((parent_ino, FileType::Directory, "..".to_string()));
        for child in children {
            let kind = if child.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((self.inode(&child.object_id), kind, child.name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let write_flags = libc::O_WRONLY | libc::O_RDWR | libc::O_APPEND | libc::O_TRUNC;
        if flags & write_flags != 0 {
            reply.error(libc::EROFS);
            return;
        }
        match self.object(ino) {
            Ok(_) => reply.opened(self.next_handle(), 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let object = match self.object(ino) {
            Ok(object) if object.is_dir => {
                reply.error(libc::EISDIR);
                return;
            }
            Ok(object) => Arc::new(object),
            Err(code) => {
                reply.error(code);
                return;
            }
        };

        match self
            .rt
            .block_on(self.chunks.read(&object, offset as u64, size as u64))
        {
            Ok(data) => reply.data(&data),
            Err(e) => {
                tracing::error!(
                    object_id = %object.object_id,
                    offset,
                    size,
                    error = %e,
                    "read failed"
                );
                reply.error(errno(&e));
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(libc::EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_id) = self.object_id(parent) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.rt.block_on(self.cache.lookup(&parent_id, name)) {
            Ok(_) => {
                reply.error(libc::EEXIST);
                return;
            }
            Err(e) if !e.is_not_found() => {
                reply.error(errno(&e));
                return;
            }
            Err(_) => {}
        }

        match self.rt.block_on(self.cache.mkdir(&parent_id, name)) {
            Ok(object) => {
                let inode = self.inode(&object.object_id);
                reply.entry(&Self::ATTR_TTL, &self.make_attr(inode, &object), 0);
            }
            Err(e) => {
                tracing::error!(parent_id, name, error = %e, "mkdir failed");
                reply.error(errno(&e));
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_child(parent, name, false) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_child(parent, name, true) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // RENAME_EXCHANGE and RENAME_WHITEOUT have no remote counterpart
        if flags & !RENAME_NOREPLACE != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let (old_parent, object) = match self.child(parent, name) {
            Ok(found) => found,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let Some(new_name) = newname.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(new_parent) = self.object_id(newparent) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.rt.block_on(self.cache.lookup(&new_parent, new_name)) {
            Ok(existing) if existing.object_id == object.object_id => {
                reply.ok();
                return;
            }
            Ok(_) => {
                reply.error(libc::EEXIST);
                return;
            }
            Err(e) if !e.is_not_found() => {
                reply.error(errno(&e));
                return;
            }
            Err(_) => {}
        }

        match self.rt.block_on(self.cache.rename(
            &object.object_id,
            &old_parent,
            &new_parent,
            new_name,
        )) {
            Ok(_) => reply.ok(),
            Err(e) => {
                tracing::error!(object_id = %object.object_id, error = %e, "rename failed");
                reply.error(errno(&e));
            }
        }
    }

    // Extended attributes are not stored remotely
    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENOTSUP);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }
}
