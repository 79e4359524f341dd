use std::marker::PhantomData;

use crate::error::{ExecutionError, ExecutionResult};

pub trait IdValueType: Sized {
    fn first() -> Self;
    fn next(v: Self) -> ExecutionResult<Self>;
}

macro_rules! impl_integer_id_value_type {
    ($type:ty) => {
        impl IdValueType for $type {
            fn first() -> Self {
                1
            }

            fn next(v: Self) -> ExecutionResult<Self> {
                v.checked_add(1)
                    .ok_or(ExecutionError::InternalError("ID overflow".to_string()))
            }
        }
    };
}

impl_integer_id_value_type!(u32);
impl_integer_id_value_type!(u64);

pub trait IdType: Sized {
    type Value: IdValueType + From<Self> + Into<Self>;
}

macro_rules! define_id_type {
    ($name:ident, $value_type:ty) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name($value_type);

        impl IdType for $name {
            type Value = $value_type;
        }

        impl From<$value_type> for $name {
            fn from(id: $value_type) -> Self {
                Self(id)
            }
        }

        impl From<$name> for $value_type {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id_type!(WorkerId, u64);
define_id_type!(RequestKey, u64);
define_id_type!(RequestId, u32);

#[derive(Debug)]
pub struct IdGenerator<T: IdType> {
    next_value: T::Value,
    phantom: PhantomData<T>,
}

impl<T: IdType> Default for IdGenerator<T>
where
    T::Value: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: IdType> IdGenerator<T>
where
    T::Value: Copy,
{
    pub fn new() -> Self {
        Self {
            next_value: T::Value::first(),
            phantom: PhantomData,
        }
    }

    pub fn next(&mut self) -> ExecutionResult<T> {
        let value = self.next_value;
        self.next_value = T::Value::next(value)?;
        Ok(value.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Active,
    /// A free slot pointing to the next free slot index, forming a stack.
    Free { next: Option<u32> },
}

/// An allocator for the request identifiers used on the wire.
///
/// Identifiers are positive and unique among the active ones.
/// Released identifiers are kept in a free list threaded through the same
/// slot table that records whether an identifier is active, so the memory
/// is proportional to the maximum number of identifiers active at once.
/// Both [`IdAllocator::acquire`] and [`IdAllocator::release`] run in O(1).
#[derive(Debug, Default)]
pub struct IdAllocator {
    /// The slot at index `i` belongs to the identifier `i + 1`.
    slots: Vec<Slot>,
    free: Option<u32>,
    active: usize,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self) -> ExecutionResult<RequestId> {
        let index = match self.free {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let Slot::Free { next } = *slot else {
                    return Err(ExecutionError::internal(
                        "corrupted request ID free list",
                    ));
                };
                self.free = next;
                *slot = Slot::Active;
                index
            }
            None => {
                let index = u32::try_from(self.slots.len())
                    .ok()
                    .filter(|x| *x < u32::MAX)
                    .ok_or_else(|| ExecutionError::internal("request ID overflow"))?;
                self.slots.push(Slot::Active);
                index
            }
        };
        self.active += 1;
        Ok(RequestId::from(index + 1))
    }

    /// Releases an active identifier.
    /// Releasing an identifier that is not active is a bug in the caller.
    /// It panics in debug builds and is ignored otherwise.
    pub fn release(&mut self, id: RequestId) {
        let active = self.is_active(id);
        debug_assert!(active, "released inactive request ID {id}");
        if !active {
            return;
        }
        let index = u32::from(id) - 1;
        self.slots[index as usize] = Slot::Free { next: self.free };
        self.free = Some(index);
        self.active -= 1;
    }

    pub fn is_active(&self, id: RequestId) -> bool {
        let value = u32::from(id);
        value > 0 && matches!(self.slots.get(value as usize - 1), Some(Slot::Active))
    }

    /// The number of active identifiers.
    pub fn active(&self) -> usize {
        self.active
    }

    /// The number of identifier slots ever allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
