use super::BufferId;

/// Access a shader declares for a bound resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryAccess {
    Read,
    Write,
}

impl MemoryAccess {
    pub fn is_write(self) -> bool {
        matches!(self, MemoryAccess::Write)
    }

    /// Whether moving from `prev` to `self` needs a barrier (RAW, WAR or WAW).
    pub fn needs_barrier_after(self, prev: MemoryAccess) -> bool {
        prev.is_write() || self.is_write()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferId,
    pub src_access: MemoryAccess,
    pub dst_access: MemoryAccess,
}

/// Memory dependencies that must be satisfied before a command runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineBarrier {
    buffers: Vec<BufferBarrier>,
}

impl PipelineBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[BufferBarrier] {
        &self.buffers
    }

    /// Record the transition of `buffer` from its previous access, if it has one
    /// and the pair is a hazard. Returns whether a barrier was added.
    pub fn add_transition(
        &mut self,
        buffer: BufferId,
        prev: Option<MemoryAccess>,
        next: MemoryAccess,
    ) -> bool {
        match prev {
            Some(prev) if next.needs_barrier_after(prev) => {
                self.buffers.push(BufferBarrier {
                    buffer,
                    src_access: prev,
                    dst_access: next,
                });
                true
            }
            _ => false,
        }
    }
}
