//! Shared, reference-counted snapshots of list data
//!
//! Every session that asks for the server list, and every registered game
//! server waiting for the global ban list, is handed a [`BufferId`] into a
//! [`BroadcastArena`] instead of its own copy of the bytes. The arena keeps
//! one reference count per snapshot and drops a snapshot as soon as nobody
//! holds it, except for the newest one, which stays alive so the next
//! subscriber finds it even before anyone has taken a reference.
//!
//! The arena has a single regenerator: `refresh`/`publish` are only called
//! from the master's own tick.

/// Which list a subscription points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Servers,
    GlobalBans,
}

/// A session's counted reference to one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub kind: ListKind,
    pub id: BufferId,
}

/// Handle to one snapshot inside an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

#[derive(Debug)]
struct BroadcastBuffer {
    id: BufferId,
    data: Vec<u8>,
    refs: u32,
}

impl BroadcastBuffer {
    fn ends_with(&self, data: &[u8]) -> bool {
        self.data.ends_with(data)
    }
}

#[derive(Debug)]
pub struct BroadcastArena {
    buffers: Vec<BroadcastBuffer>,
    next_id: u64,
    stale: bool,
}

impl Default for BroadcastArena {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastArena {
    /// New arenas hold nothing and have nothing to rebuild until the first
    /// `mark_stale`.
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            next_id: 1,
            stale: false,
        }
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn latest(&self) -> Option<BufferId> {
        self.buffers.last().map(|buffer| buffer.id)
    }

    pub fn get(&self, id: BufferId) -> Option<&[u8]> {
        self.find(id).map(|index| self.buffers[index].data.as_slice())
    }

    pub fn refs(&self, id: BufferId) -> Option<u32> {
        self.find(id).map(|index| self.buffers[index].refs)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Takes a reference on `id`. Returns `None` if the snapshot is gone.
    pub fn subscribe(&mut self, id: BufferId) -> Option<BufferId> {
        let index = self.find(id)?;
        self.buffers[index].refs += 1;
        Some(id)
    }

    /// Drops a reference. Unreferenced snapshots other than the tail are
    /// removed immediately; the count never goes below zero.
    pub fn release(&mut self, id: BufferId) {
        let Some(index) = self.find(id) else {
            return;
        };
        let buffer = &mut self.buffers[index];
        buffer.refs = buffer.refs.saturating_sub(1);
        if buffer.refs == 0 && index + 1 != self.buffers.len() {
            self.buffers.remove(index);
        }
    }

    /// Removes every unreferenced snapshot except the tail.
    pub fn collect_garbage(&mut self) {
        let tail = self.latest();
        self.buffers
            .retain(|buffer| buffer.refs > 0 || Some(buffer.id) == tail);
    }

    /// Rebuilds the snapshot if the arena is stale, returning the newest one.
    ///
    /// `build` only runs when regeneration is actually needed.
    pub fn refresh<F>(&mut self, build: F) -> Option<BufferId>
    where
        F: FnOnce() -> Vec<u8>,
    {
        if self.stale {
            self.publish(build());
        }
        self.latest()
    }

    /// Appends a new snapshot and clears the stale flag. The previous tail
    /// loses its protection and goes if nobody references it.
    pub fn publish(&mut self, data: Vec<u8>) -> BufferId {
        self.drop_unreferenced_tail();
        self.collect_garbage();
        self.push(data)
    }

    /// Publishes a snapshot whose later versions supersede earlier ones.
    ///
    /// Identical content to the current tail is discarded and `None` is
    /// returned. Otherwise every still-referenced older snapshot gets the new
    /// content appended, unless it already ends with it, so a subscriber that
    /// is mid-way through an old copy also receives the update.
    pub fn publish_cumulative(&mut self, data: Vec<u8>) -> Option<BufferId> {
        if self.buffers.last().is_some_and(|tail| tail.data == data) {
            self.stale = false;
            return None;
        }

        self.drop_unreferenced_tail();
        self.collect_garbage();
        for buffer in self.buffers.iter_mut() {
            if buffer.refs > 0 && !buffer.ends_with(&data) {
                buffer.data.extend_from_slice(&data);
            }
        }
        Some(self.push(data))
    }

    fn drop_unreferenced_tail(&mut self) {
        while self.buffers.last().is_some_and(|buffer| buffer.refs == 0) {
            self.buffers.pop();
        }
    }

    fn push(&mut self, data: Vec<u8>) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.buffers.push(BroadcastBuffer { id, data, refs: 0 });
        self.stale = false;
        id
    }

    fn find(&self, id: BufferId) -> Option<usize> {
        self.buffers
            .binary_search_by_key(&id, |buffer| buffer.id)
            .ok()
    }
}

/// The two lists the master shares between sessions.
#[derive(Debug, Default)]
pub struct Broadcasts {
    pub servers: BroadcastArena,
    pub gbans: BroadcastArena,
}

impl Broadcasts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arena(&self, kind: ListKind) -> &BroadcastArena {
        match kind {
            ListKind::Servers => &self.servers,
            ListKind::GlobalBans => &self.gbans,
        }
    }

    pub fn arena_mut(&mut self, kind: ListKind) -> &mut BroadcastArena {
        match kind {
            ListKind::Servers => &mut self.servers,
            ListKind::GlobalBans => &mut self.gbans,
        }
    }

    /// Takes a reference on the newest snapshot of `kind`, if there is one.
    pub fn subscribe_latest(&mut self, kind: ListKind) -> Option<Subscription> {
        let arena = self.arena_mut(kind);
        let id = arena.latest()?;
        arena.subscribe(id).map(|id| Subscription { kind, id })
    }

    pub fn get(&self, subscription: Subscription) -> Option<&[u8]> {
        self.arena(subscription.kind).get(subscription.id)
    }

    pub fn release(&mut self, subscription: Subscription) {
        self.arena_mut(subscription.kind).release(subscription.id);
    }
}
