//! Inode to object id mapping
//!
//! FUSE identifies files by inode (u64) while the metadata cache keys them
//! by remote object id. Inodes are handed out on first sight and stay
//! stable for the life of the mount, across renames.

use std::collections::HashMap;

/// Bidirectional mapping between inodes and remote object ids
#[derive(Debug)]
pub struct InodeTable {
    id_to_inode: HashMap<String, u64>,
    inode_to_id: HashMap<u64, String>,
    next_inode: u64,
}

impl InodeTable {
    pub const ROOT_INODE: u64 = fuser::FUSE_ROOT_ID;

    /// Create a table whose root inode maps to `root_id`
    pub fn new(root_id: &str) -> Self {
        let mut table = Self {
            id_to_inode: HashMap::new(),
            inode_to_id: HashMap::new(),
            next_inode: Self::ROOT_INODE + 1,
        };
        table.id_to_inode.insert(root_id.to_string(), Self::ROOT_INODE);
        table
            .inode_to_id
            .insert(Self::ROOT_INODE, root_id.to_string());
        table
    }

    /// Get the inode of an object, assigning one if it has none
    pub fn get_or_create(&mut self, object_id: &str) -> u64 {
        if let Some(&ino) = self.id_to_inode.get(object_id) {
            return ino;
        }

        let ino = self.next_inode;
        self.next_inode += 1;
        self.id_to_inode.insert(object_id.to_string(), ino);
        self.inode_to_id.insert(ino, object_id.to_string());
        ino
    }

    pub fn object_id(&self, inode: u64) -> Option<&str> {
        self.inode_to_id.get(&inode).map(String::as_str)
    }

    /// Forget an object (after it was deleted). The root is never forgotten.
    pub fn remove(&mut self, object_id: &str) {
        if let Some(ino) = self.id_to_inode.get(object_id).copied() {
            if ino == Self::ROOT_INODE {
                return;
            }
            self.id_to_inode.remove(object_id);
            self.inode_to_id.remove(&ino);
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_id.is_empty()
    }
}
