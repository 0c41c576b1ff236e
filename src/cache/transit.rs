use std::collections::HashSet;

use crate::{BlockKey, ObjectId};

/// Blocks and objects currently being uploaded or downloaded.
///
/// Membership is a mutual-exclusion marker: a block key in the set may not be
/// read, written or transferred by anyone else, and an object in the set may
/// not be downloaded or deleted until its transfer finishes.
#[derive(Debug, Default)]
pub struct InTransit {
    blocks: HashSet<BlockKey>,
    objects: HashSet<ObjectId>,
}

impl InTransit {
    /// Returns false if the block was already in transit.
    pub fn insert_block(&mut self, key: BlockKey) -> bool {
        self.blocks.insert(key)
    }

    pub fn remove_block(&mut self, key: &BlockKey) -> bool {
        self.blocks.remove(key)
    }

    pub fn contains_block(&self, key: &BlockKey) -> bool {
        self.blocks.contains(key)
    }

    /// Returns false if the object was already in transit.
    pub fn insert_object(&mut self, obj_id: ObjectId) -> bool {
        self.objects.insert(obj_id)
    }

    pub fn remove_object(&mut self, obj_id: &ObjectId) -> bool {
        self.objects.remove(obj_id)
    }

    pub fn contains_object(&self, obj_id: &ObjectId) -> bool {
        self.objects.contains(obj_id)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.objects.is_empty()
    }
}
