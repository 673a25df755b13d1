//! Reference-counting handle registry
//!
//! Maps opaque integer handles to typed objects with a reference count and
//! 8 user bits. Slots live in lazily allocated fixed-size blocks; freed
//! slots are chained on a LIFO pool and recycled before the address space
//! grows.
//!
//! Restrictions:
//! - The registry can never shrink, only grow.
//! - Only one thread at a time may add or remove handles. In the engine,
//!   the registry belongs to the API side; realtime code only ever sees
//!   payload data passed to it inside command messages.

use crate::error::{VoxError, VoxResult};

/// Opaque object handle
pub type Handle = i32;

/// Maximum number of slot blocks
pub const MAX_BLOCKS: usize = 4096;

/// log2 of the block size
pub const BLOCK_SIZE_POW2: u32 = 8;

/// Handles per block
pub const BLOCK_SIZE: usize = 1 << BLOCK_SIZE_POW2;

const BLOCK_MASK: i32 = (BLOCK_SIZE as i32) - 1;

/// Object type tags
///
/// Tag 0 is reserved for free slots and is never a valid object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    /// Bank of waves, programs etc
    Bank = 1,
    /// Sampled mipmapped wave for wavetable oscillators
    Wave = 2,
    /// Compiled program
    Program = 3,
    /// Unit class (descriptor, not instance)
    UnitClass = 4,
    /// Constant real value
    Constant = 5,
    /// String
    String = 6,
    /// Audio stream
    Stream = 7,
    /// Sink tap client
    SinkClient = 8,
    /// Former realtime handle that has been detached
    Detached = 9,
    /// Virtual (not yet instantiated) voice
    NewVoice = 10,
    /// Playing voice instance
    Voice = 11,
}

/// Destructor verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destroy {
    /// Object destroyed; return the slot to the free pool
    Ok,
    /// Keep the handle allocated (refcount stays at zero)
    Refuse,
}

/// Implemented by registry payloads
pub trait Managed {
    /// Type tag for this object
    fn type_tag(&self) -> TypeTag;

    /// Called when the reference count reaches zero.
    ///
    /// Returning [`Destroy::Refuse`] keeps the slot allocated; the owner
    /// must release again once whatever blocked destruction has cleared.
    fn destroy(&mut self, handle: Handle) -> Destroy;
}

/// Slot metadata as reported by [`HandleRegistry::locate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    /// Type tag, or `None` for slots in the free pool
    pub tag: Option<TypeTag>,
    pub refcount: u16,
    pub userbits: u8,
}

enum Slot<T> {
    /// Link to the previously freed slot (LIFO pool), -1 terminates
    Free { prev: Handle },
    Live {
        data: T,
        tag: TypeTag,
        refcount: u16,
        userbits: u8,
    },
}

/// Handle registry with lazily allocated slot blocks
pub struct HandleRegistry<T> {
    blocks: Vec<Option<Box<[Slot<T>]>>>,
    /// Head of the free-slot LIFO, -1 when empty
    pool: Handle,
    /// Next never-used handle
    next: Handle,
}

impl<T: Managed> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            pool: -1,
            next: 0,
        }
    }

    fn slot(&self, h: Handle) -> Option<&Slot<T>> {
        if h < 0 {
            return None;
        }
        let bi = (h >> BLOCK_SIZE_POW2) as usize;
        let si = (h & BLOCK_MASK) as usize;
        self.blocks.get(bi)?.as_ref().map(|b| &b[si])
    }

    fn slot_mut(&mut self, h: Handle) -> Option<&mut Slot<T>> {
        if h < 0 {
            return None;
        }
        let bi = (h >> BLOCK_SIZE_POW2) as usize;
        let si = (h & BLOCK_MASK) as usize;
        self.blocks.get_mut(bi)?.as_mut().map(|b| &mut b[si])
    }

    /// Create a new handle with refcount 1 and no user bits
    pub fn add(&mut self, data: T) -> VoxResult<Handle> {
        self.add_with(data, 0, 1)
    }

    /// Create a new handle with explicit user bits and initial refcount
    pub fn add_with(&mut self, data: T, userbits: u8, refcount: u16) -> VoxResult<Handle> {
        let tag = data.type_tag();
        let h = if self.pool >= 0 {
            // Recycle from the free pool
            let h = self.pool;
            let prev = match self.slot(h) {
                Some(Slot::Free { prev }) => *prev,
                _ => return Err(VoxError::Internal),
            };
            self.pool = prev;
            h
        } else {
            // Grab a new one off the end, growing the block table as needed
            let bi = (self.next >> BLOCK_SIZE_POW2) as usize;
            if bi >= MAX_BLOCKS {
                return Err(VoxError::OutOfHandles);
            }
            while self.blocks.len() <= bi {
                self.blocks.push(None);
            }
            if self.blocks[bi].is_none() {
                let mut block = Vec::with_capacity(BLOCK_SIZE);
                for _ in 0..BLOCK_SIZE {
                    block.push(Slot::Free { prev: -1 });
                }
                self.blocks[bi] = Some(block.into_boxed_slice());
            }
            let h = self.next;
            self.next += 1;
            h
        };
        *self.slot_mut(h).ok_or(VoxError::Internal)? = Slot::Live {
            data,
            tag,
            refcount,
            userbits,
        };
        Ok(h)
    }

    /// Increase the refcount and return the payload, provided the tag matches.
    ///
    /// Returns `None` if the handle is invalid, free, or of the wrong type.
    pub fn grab(&mut self, h: Handle, tag: TypeTag) -> Option<&mut T> {
        match self.slot_mut(h)? {
            Slot::Live {
                data,
                tag: t,
                refcount,
                ..
            } if *t == tag => {
                *refcount += 1;
                Some(data)
            }
            _ => None,
        }
    }

    /// Payload access without touching the refcount. Live slots only.
    pub fn get(&self, h: Handle) -> Option<&T> {
        match self.slot(h)? {
            Slot::Live { data, .. } => Some(data),
            Slot::Free { .. } => None,
        }
    }

    /// Mutable payload access without touching the refcount. Live slots only.
    pub fn get_mut(&mut self, h: Handle) -> Option<&mut T> {
        match self.slot_mut(h)? {
            Slot::Live { data, .. } => Some(data),
            Slot::Free { .. } => None,
        }
    }

    /// Type tag of a live handle
    pub fn tag_of(&self, h: Handle) -> Option<TypeTag> {
        match self.slot(h)? {
            Slot::Live { tag, .. } => Some(*tag),
            Slot::Free { .. } => None,
        }
    }

    /// Increase the reference count
    pub fn retain(&mut self, h: Handle) -> VoxResult<()> {
        match self.slot_mut(h) {
            None => Err(VoxError::InvalidHandle),
            Some(Slot::Free { .. }) => Err(VoxError::FreeHandle),
            Some(Slot::Live { refcount, .. }) => {
                *refcount += 1;
                Ok(())
            }
        }
    }

    /// Release the handle.
    ///
    /// Decrements the refcount; at zero, the payload destructor runs and,
    /// unless it refuses, the slot moves to the free pool. Returns the
    /// remaining refcount.
    pub fn release(&mut self, h: Handle) -> VoxResult<u16> {
        match self.slot_mut(h) {
            None => return Err(VoxError::InvalidHandle),
            Some(Slot::Free { .. }) => return Err(VoxError::FreeHandle),
            Some(Slot::Live { refcount, data, .. }) => {
                if *refcount > 0 {
                    *refcount -= 1;
                    if *refcount > 0 {
                        return Ok(*refcount);
                    }
                }
                if data.destroy(h) == Destroy::Refuse {
                    *refcount = 0;
                    return Err(VoxError::Refuse);
                }
            }
        }
        self.free_slot(h);
        Ok(0)
    }

    /// Replace the payload of a live handle, retagging it from the new data.
    ///
    /// The refcount and user bits are preserved. Used to flip realtime
    /// handles to the detached type once the engine side is gone.
    pub fn replace(&mut self, h: Handle, new_data: T) -> VoxResult<()> {
        let new_tag = new_data.type_tag();
        match self.slot_mut(h) {
            None => Err(VoxError::InvalidHandle),
            Some(Slot::Free { .. }) => Err(VoxError::FreeHandle),
            Some(Slot::Live { data, tag, .. }) => {
                *data = new_data;
                *tag = new_tag;
                Ok(())
            }
        }
    }

    /// Look up slot metadata without touching the refcount.
    ///
    /// Unlike [`grab`](Self::grab), this reports slots in the free pool
    /// too, and exists for diagnostics and tests.
    pub fn locate(&self, h: Handle) -> Option<SlotInfo> {
        match self.slot(h)? {
            Slot::Free { .. } => Some(SlotInfo {
                tag: None,
                refcount: 0,
                userbits: 0,
            }),
            Slot::Live {
                tag,
                refcount,
                userbits,
                ..
            } => Some(SlotInfo {
                tag: Some(*tag),
                refcount: *refcount,
                userbits: *userbits,
            }),
        }
    }

    /// Number of handles ever allocated (high-water mark)
    pub fn capacity_used(&self) -> usize {
        self.next as usize
    }

    fn free_slot(&mut self, h: Handle) {
        let prev = self.pool;
        if let Some(slot) = self.slot_mut(h) {
            *slot = Slot::Free { prev };
            self.pool = h;
        }
    }
}

impl<T: Managed> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Obj {
        tag: TypeTag,
        refuse: bool,
        destroyed: std::rc::Rc<std::cell::Cell<u32>>,
    }

    impl Managed for Obj {
        fn type_tag(&self) -> TypeTag {
            self.tag
        }
        fn destroy(&mut self, _h: Handle) -> Destroy {
            self.destroyed.set(self.destroyed.get() + 1);
            if self.refuse { Destroy::Refuse } else { Destroy::Ok }
        }
    }

    fn obj(tag: TypeTag) -> (Obj, std::rc::Rc<std::cell::Cell<u32>>) {
        let destroyed = std::rc::Rc::new(std::cell::Cell::new(0));
        (
            Obj {
                tag,
                refuse: false,
                destroyed: destroyed.clone(),
            },
            destroyed,
        )
    }

    #[test]
    fn test_add_grab_release() {
        let mut reg = HandleRegistry::new();
        let (o, destroyed) = obj(TypeTag::Wave);
        let h = reg.add(o).unwrap();

        assert!(reg.grab(h, TypeTag::Wave).is_some());
        assert_eq!(reg.locate(h).unwrap().refcount, 2);
        assert!(reg.grab(h, TypeTag::Program).is_none());

        assert_eq!(reg.release(h).unwrap(), 1);
        assert_eq!(reg.release(h).unwrap(), 0);
        assert_eq!(destroyed.get(), 1);

        // Slot is now reported free, and grab fails until reuse
        assert_eq!(reg.locate(h).unwrap().tag, None);
        assert!(reg.grab(h, TypeTag::Wave).is_none());
    }

    #[test]
    fn test_free_pool_reuse() {
        let mut reg = HandleRegistry::new();
        let (a, _) = obj(TypeTag::Wave);
        let (b, _) = obj(TypeTag::Wave);
        let ha = reg.add(a).unwrap();
        let _hb = reg.add(b).unwrap();

        reg.release(ha).unwrap();

        // The freed slot is recycled before the address space grows
        let (c, _) = obj(TypeTag::Program);
        let hc = reg.add(c).unwrap();
        assert_eq!(hc, ha);
        assert_eq!(reg.tag_of(hc), Some(TypeTag::Program));
    }

    #[test]
    fn test_release_invalid_and_free() {
        let mut reg: HandleRegistry<Obj> = HandleRegistry::new();
        assert_eq!(reg.release(1234), Err(VoxError::InvalidHandle));
        assert_eq!(reg.release(-1), Err(VoxError::InvalidHandle));

        let (o, _) = obj(TypeTag::Wave);
        let h = reg.add(o).unwrap();
        reg.release(h).unwrap();
        assert_eq!(reg.release(h), Err(VoxError::FreeHandle));
    }

    #[test]
    fn test_destructor_refuse() {
        let mut reg = HandleRegistry::new();
        let destroyed = std::rc::Rc::new(std::cell::Cell::new(0));
        let h = reg
            .add(Obj {
                tag: TypeTag::Stream,
                refuse: true,
                destroyed: destroyed.clone(),
            })
            .unwrap();

        // Refused destruction keeps the handle allocated at refcount 0
        assert_eq!(reg.release(h), Err(VoxError::Refuse));
        let info = reg.locate(h).unwrap();
        assert_eq!(info.tag, Some(TypeTag::Stream));
        assert_eq!(info.refcount, 0);

        // Clear the refusal and release again: straight to the destructor
        reg.get_mut(h).unwrap().refuse = false;
        assert_eq!(reg.release(h).unwrap(), 0);
        assert_eq!(destroyed.get(), 2);
        assert_eq!(reg.locate(h).unwrap().tag, None);
    }

    #[test]
    fn test_retain() {
        let mut reg = HandleRegistry::new();
        let (o, destroyed) = obj(TypeTag::Bank);
        let h = reg.add(o).unwrap();
        reg.retain(h).unwrap();
        assert_eq!(reg.release(h).unwrap(), 1);
        assert_eq!(destroyed.get(), 0);
        assert_eq!(reg.release(h).unwrap(), 0);
        assert_eq!(destroyed.get(), 1);
    }

    #[test]
    fn test_block_growth() {
        let mut reg = HandleRegistry::new();
        // Cross a block boundary
        for i in 0..(BLOCK_SIZE + 10) {
            let (o, _) = obj(TypeTag::Constant);
            let h = reg.add(o).unwrap();
            assert_eq!(h, i as Handle);
        }
        assert_eq!(reg.capacity_used(), BLOCK_SIZE + 10);
    }

    #[test]
    fn test_replace_retags() {
        let mut reg = HandleRegistry::new();
        let (o, _) = obj(TypeTag::Voice);
        let h = reg.add(o).unwrap();
        reg.retain(h).unwrap();

        let (d, _) = obj(TypeTag::Detached);
        reg.replace(h, d).unwrap();
        assert_eq!(reg.tag_of(h), Some(TypeTag::Detached));
        assert_eq!(reg.locate(h).unwrap().refcount, 2);
    }
}
