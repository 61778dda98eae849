//! Memory objects and the per-state address space.
//!
//! Object states hold one expression per byte. Forked states share object states through their
//! reference counts; the first write in a state materializes a private copy
//! ([`AddressSpace::get_writeable`]).

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use symbex_core::{
    ByteMask,
    expr::{Array, Expr, WIDTH_8, Width},
};

use crate::errors::MemoryError;

// MEMORY OBJECTS
// ================================================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MO{}", self.0)
    }
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one allocation. Shared by every state that can reach it; the mutable contents live
/// in the per-state [`ObjectState`].
#[derive(Debug)]
pub struct MemoryObject {
    id: ObjectId,
    pub address: u64,
    pub size: u32,
    pub is_local: bool,
    pub is_fixed: bool,
    is_global: AtomicBool,
}

impl MemoryObject {
    pub fn new(address: u64, size: u32, is_local: bool, is_fixed: bool) -> Arc<Self> {
        Arc::new(MemoryObject {
            id: ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            address,
            size,
            is_local,
            is_fixed,
            is_global: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn is_global(&self) -> bool {
        self.is_global.load(Ordering::Relaxed)
    }

    pub fn mark_global(&self) {
        self.is_global.store(true, Ordering::Relaxed);
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < u64::from(self.size)
    }

    pub fn offset_of(&self, address: u64) -> u32 {
        debug_assert!(self.contains(address));
        (address - self.address) as u32
    }
}

impl PartialEq for MemoryObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MemoryObject {}

// OBJECT STATE
// ================================================================================================

/// The contents of one memory object along one path: an expression per byte plus the
/// writability/accessibility flags the access-control intrinsics flip.
#[derive(Clone, Debug)]
pub struct ObjectState {
    bytes: Vec<Expr>,
    pub read_only: bool,
    accessible: bool,
    inaccessible_message: String,
}

impl ObjectState {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        ObjectState {
            bytes: bytes.iter().map(|b| Expr::constant(u64::from(*b), WIDTH_8)).collect(),
            read_only: false,
            accessible: true,
            inaccessible_message: String::new(),
        }
    }

    pub fn zeroed(size: u32) -> Self {
        Self::from_bytes(&vec![0; size as usize])
    }

    /// An object whose every byte reads from `array`.
    pub fn symbolic(array: &Array) -> Self {
        ObjectState {
            bytes: (0..array.size()).map(|i| Expr::read8(array, i)).collect(),
            read_only: false,
            accessible: true,
            inaccessible_message: String::new(),
        }
    }

    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_accessible(&self) -> bool {
        self.accessible
    }

    pub fn inaccessible_message(&self) -> &str {
        &self.inaccessible_message
    }

    pub fn forbid_access(&mut self, message: impl Into<String>) {
        self.accessible = false;
        self.inaccessible_message = message.into();
    }

    /// Re-forbids access with the message recorded by the previous [`Self::forbid_access`].
    /// The loop-analysis forgetting protocol flips accessibility around a havoc and must restore
    /// the original reason.
    pub fn forbid_access_with_last_message(&mut self) {
        self.accessible = false;
    }

    /// Flips the object accessible again. The last inaccessibility message is retained for
    /// [`Self::forbid_access_with_last_message`].
    pub fn allow_access(&mut self) {
        self.accessible = true;
    }

    /// Drops the recorded inaccessibility reason. The `allow_access` intrinsic clears it; the
    /// loop-analysis forgetting protocol does not.
    pub fn clear_inaccessible_message(&mut self) {
        self.inaccessible_message.clear();
    }

    pub fn read8(&self, offset: u32, circumvent_inaccessibility: bool) -> Result<Expr, MemoryError> {
        if !self.accessible && !circumvent_inaccessibility {
            return Err(MemoryError::Inaccessible {
                message: self.inaccessible_message.clone(),
            });
        }
        match self.bytes.get(offset as usize) {
            Some(byte) => Ok(byte.clone()),
            None => Err(MemoryError::OutOfBounds { offset, width: WIDTH_8, size: self.size() }),
        }
    }

    /// Reads `width` bits starting at byte `offset`, least-significant byte first.
    pub fn read(
        &self,
        offset: u32,
        width: Width,
        circumvent_inaccessibility: bool,
    ) -> Result<Expr, MemoryError> {
        debug_assert!(width > 0 && width % 8 == 0, "read width must be a whole number of bytes");
        let num_bytes = width / 8;
        if offset + num_bytes > self.size() {
            return Err(MemoryError::OutOfBounds { offset, width, size: self.size() });
        }
        let mut value = self.read8(offset, circumvent_inaccessibility)?;
        for i in 1..num_bytes {
            let byte = self.read8(offset + i, circumvent_inaccessibility)?;
            value = Expr::concat(byte, value);
        }
        Ok(value)
    }

    pub fn write8(&mut self, offset: u32, value: Expr) {
        debug_assert_eq!(value.width(), WIDTH_8);
        debug_assert!((offset as usize) < self.bytes.len());
        self.bytes[offset as usize] = value;
    }

    /// Writes `value` starting at byte `offset`, least-significant byte first.
    pub fn write(&mut self, offset: u32, value: &Expr) {
        debug_assert!(value.width() % 8 == 0);
        let num_bytes = value.width() / 8;
        debug_assert!(offset + num_bytes <= self.size());
        for i in 0..num_bytes {
            self.write8(offset + i, Expr::extract(value.clone(), i * 8, WIDTH_8));
        }
    }

    /// Replaces the whole contents with reads from `array`.
    pub fn make_symbolic(&mut self, array: &Array) {
        debug_assert_eq!(array.size(), self.size());
        for (i, byte) in self.bytes.iter_mut().enumerate() {
            *byte = Expr::read8(array, i as u32);
        }
    }

    /// Replaces every masked byte with a read from `array`, leaving the rest untouched.
    pub fn forget_these(&mut self, mask: &ByteMask, array: &Array) {
        debug_assert_eq!(mask.len(), self.size());
        debug_assert_eq!(array.size(), self.size());
        for i in mask.iter_ones() {
            self.bytes[i as usize] = Expr::read8(array, i);
        }
    }
}

// ADDRESS SPACE
// ================================================================================================

#[derive(Clone, Debug)]
pub struct Binding {
    pub object: Arc<MemoryObject>,
    state: Arc<ObjectState>,
}

/// The per-state map from memory-object identity to object state.
///
/// Object states are shared between forked states until written; iteration is in object-id
/// (allocation) order, which is stable across forks and what the merge and fixpoint code key on.
#[derive(Clone, Debug, Default)]
pub struct AddressSpace {
    objects: BTreeMap<ObjectId, Binding>,
    addr_index: BTreeMap<u64, ObjectId>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_object(&mut self, object: Arc<MemoryObject>, state: ObjectState) {
        debug_assert_eq!(object.size, state.size());
        self.addr_index.insert(object.address, object.id());
        self.objects.insert(object.id(), Binding { object, state: Arc::new(state) });
    }

    pub fn unbind_object(&mut self, id: ObjectId) {
        if let Some(binding) = self.objects.remove(&id) {
            self.addr_index.remove(&binding.object.address);
        }
    }

    /// Resolves a concrete address to the unique object containing it.
    pub fn resolve_one(&self, address: u64) -> Option<(&Arc<MemoryObject>, &Arc<ObjectState>)> {
        let (_, id) = self.addr_index.range(..=address).next_back()?;
        let binding = &self.objects[id];
        binding.object.contains(address).then_some((&binding.object, &binding.state))
    }

    pub fn find_object(&self, id: ObjectId) -> Option<&Arc<ObjectState>> {
        self.objects.get(&id).map(|b| &b.state)
    }

    pub fn object(&self, id: ObjectId) -> Option<&Arc<MemoryObject>> {
        self.objects.get(&id).map(|b| &b.object)
    }

    /// A writable view of an object state, materializing a private copy if the state is shared
    /// with a sibling path.
    pub fn get_writeable(&mut self, id: ObjectId) -> Option<&mut ObjectState> {
        self.objects.get_mut(&id).map(|b| Arc::make_mut(&mut b.state))
    }

    /// Flips an object accessible on a writable copy.
    pub fn allow_access(&mut self, id: ObjectId) -> Option<&mut ObjectState> {
        let state = self.get_writeable(id)?;
        state.allow_access();
        Some(state)
    }

    /// Iterates `(object, state)` pairs in stable key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<MemoryObject>, &Arc<ObjectState>)> {
        self.objects.values().map(|b| (&b.object, &b.state))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether both spaces bind exactly the same objects (ignoring contents).
    pub fn same_key_set(&self, other: &AddressSpace) -> bool {
        self.objects.len() == other.objects.len()
            && self.objects.keys().zip(other.objects.keys()).all(|(a, b)| a == b)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn read_concatenates_little_endian() {
        let os = ObjectState::from_bytes(&[0x78, 0x56, 0x34, 0x12]);
        let value = os.read(0, 32, false).unwrap();
        assert_eq!(value.as_constant(), Some(0x1234_5678));
    }

    #[test]
    fn write_then_read_roundtrips() {
        let mut os = ObjectState::zeroed(8);
        os.write(2, &Expr::constant(0xbeef, 16));
        assert_eq!(os.read(2, 16, false).unwrap().as_constant(), Some(0xbeef));
        assert_eq!(os.read(0, 16, false).unwrap().as_constant(), Some(0));
    }

    #[test]
    fn inaccessible_reads_fail_unless_circumvented() {
        let mut os = ObjectState::from_bytes(&[1, 2]);
        os.forbid_access("device register");
        assert!(matches!(os.read8(0, false), Err(MemoryError::Inaccessible { .. })));
        assert_eq!(os.read8(0, true).unwrap().as_constant(), Some(1));
        os.allow_access();
        assert_eq!(os.read8(1, false).unwrap().as_constant(), Some(2));
        os.forbid_access_with_last_message();
        match os.read8(0, false) {
            Err(MemoryError::Inaccessible { message }) => assert_eq!(message, "device register"),
            other => panic!("expected inaccessible error, got {other:?}"),
        }
    }

    #[test]
    fn copy_on_write_splits_shared_state() {
        let mo = MemoryObject::new(0x1000, 4, false, false);
        let mut a = AddressSpace::new();
        a.bind_object(mo.clone(), ObjectState::from_bytes(&[1, 2, 3, 4]));
        let mut b = a.clone();

        let shared_before = Arc::ptr_eq(a.find_object(mo.id()).unwrap(), b.find_object(mo.id()).unwrap());
        assert!(shared_before);

        b.get_writeable(mo.id()).unwrap().write8(0, Expr::constant(9, WIDTH_8));

        assert_eq!(a.find_object(mo.id()).unwrap().read8(0, false).unwrap().as_constant(), Some(1));
        assert_eq!(b.find_object(mo.id()).unwrap().read8(0, false).unwrap().as_constant(), Some(9));
    }

    #[test]
    fn resolve_one_checks_bounds() {
        let mo = MemoryObject::new(0x1000, 4, false, false);
        let mut space = AddressSpace::new();
        space.bind_object(mo.clone(), ObjectState::zeroed(4));
        assert!(space.resolve_one(0x1003).is_some());
        assert!(space.resolve_one(0x1004).is_none());
        assert!(space.resolve_one(0xfff).is_none());
    }

    #[test]
    fn forget_these_replaces_only_masked_bytes() {
        let mut os = ObjectState::from_bytes(&[1, 2, 3, 4]);
        let mut mask = ByteMask::new(4);
        mask.set(1);
        mask.set(3);
        let array = Array::new("h", 4);
        os.forget_these(&mask, &array);
        assert_eq!(os.read8(0, false).unwrap().as_constant(), Some(1));
        assert!(os.read8(1, false).unwrap().as_constant().is_none());
        assert_eq!(os.read8(2, false).unwrap().as_constant(), Some(3));
        assert!(os.read8(3, false).unwrap().as_constant().is_none());
    }
}
