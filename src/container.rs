/*
 * Named values in the segment that are guarded by a named mutex of their
 * own: a plain scalar (used for the key counters) and a versioned string
 * (used for the schema version).
 */
use crate::constants::MUTEX_SUFFIX;
use crate::error::Result;
use crate::fixed::FixedString;
use crate::segment::{Segment, Shared, SharedObject};
use crate::signal::{NamedMutex, NamedSignal};
use log::debug;
use std::cell::UnsafeCell;
use std::sync::Arc;

macro_rules! plain_shared_object {
    ($($t:ty),*) => {
        $(
            unsafe impl SharedObject for $t {
                fn type_tag() -> String {
                    return stringify!($t).to_string();
                }
            }
        )*
    };
}

plain_shared_object!(u32, u64, i32, i64);

/// Plain data behind a lock. Only hand out references while holding the
/// mutex that guards it.
#[repr(transparent)]
pub struct Slot<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for Slot<T> {}
unsafe impl<T: SharedObject + Copy> SharedObject for Slot<T> {
    fn type_tag() -> String {
        return format!("slot<{}>", T::type_tag());
    }
}

impl<T> Slot<T> {
    pub fn get(&self) -> *mut T {
        return self.0.get();
    }
}

pub fn mutex_name(name: &str) -> String {
    return format!("{}{}", name, MUTEX_SUFFIX);
}

pub struct SharedScalar<T: SharedObject + Copy> {
    name: String,
    value: Shared<Slot<T>>,
    mutex: NamedMutex,
}

impl<T: SharedObject + Copy> SharedScalar<T> {
    pub fn get_or_create(segment: &Arc<Segment>, name: &str) -> Result<SharedScalar<T>> {
        return Ok(SharedScalar {
            name: name.to_string(),
            value: segment.find_or_construct::<Slot<T>>(name)?,
            mutex: NamedMutex::get_or_create(segment, &mutex_name(name))?,
        });
    }

    pub fn name(&self) -> &str {
        return &self.name;
    }

    pub fn get(&self) -> T {
        let _guard = self.mutex.lock();
        // SAFETY: we hold the value's mutex.
        return unsafe { *self.value.get() };
    }

    pub fn set(&self, value: T) {
        let _guard = self.mutex.lock();
        // SAFETY: we hold the value's mutex.
        unsafe {
            *self.value.get() = value;
        }
    }

    /// Read-modify-write under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _guard = self.mutex.lock();
        // SAFETY: we hold the value's mutex, the reference does not outlive it.
        return f(unsafe { &mut *self.value.get() });
    }
}

pub const SHARED_STRING_SIZE: usize = 256;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VersionedString {
    // number of writes, 0 means never written
    version: u64,
    text: FixedString<SHARED_STRING_SIZE>,
}

unsafe impl SharedObject for VersionedString {
    fn type_tag() -> String {
        return format!("versioned_string<{}>", SHARED_STRING_SIZE);
    }
}

pub struct SharedString {
    name: String,
    value: Shared<Slot<VersionedString>>,
    mutex: NamedMutex,
}

impl SharedString {
    /// The first process to get here stores `initial`, later ones keep
    /// whatever is stored already.
    pub fn get_or_create(segment: &Arc<Segment>, name: &str, initial: &str) -> Result<SharedString> {
        let string = SharedString {
            name: name.to_string(),
            value: segment.find_or_construct::<Slot<VersionedString>>(name)?,
            mutex: NamedMutex::get_or_create(segment, &mutex_name(name))?,
        };
        {
            let _guard = string.mutex.lock();
            // SAFETY: we hold the string's mutex.
            let value = unsafe { &mut *string.value.get() };
            if value.version == 0 {
                value.text.set(initial);
                value.version = 1;
                debug!("{} initialized to {:?}", name, initial);
            }
        }
        return Ok(string);
    }

    pub fn name(&self) -> &str {
        return &self.name;
    }

    pub fn get(&self) -> String {
        let _guard = self.mutex.lock();
        // SAFETY: we hold the string's mutex.
        return unsafe { (*self.value.get()).text.as_str().to_string() };
    }

    pub fn set(&self, text: &str) {
        let _guard = self.mutex.lock();
        // SAFETY: we hold the string's mutex.
        let value = unsafe { &mut *self.value.get() };
        value.text.set(text);
        value.version += 1;
        debug!("{} set to {:?} (version {})", self.name, text, value.version);
    }

    /// Number of writes so far, the initial value counts as the first.
    pub fn version(&self) -> u64 {
        let _guard = self.mutex.lock();
        // SAFETY: we hold the string's mutex.
        return unsafe { (*self.value.get()).version };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::unique_name;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn scalar_is_shared_between_mappings() {
        init();
        let name = unique_name("shm_broker_test");
        let a = Segment::open_or_create(&name, 100_000).unwrap();
        let b = Segment::open_or_create(&name, 100_000).unwrap();

        let x = SharedScalar::<u64>::get_or_create(&a, "x").unwrap();
        let y = SharedScalar::<u64>::get_or_create(&b, "x").unwrap();
        assert_eq!(x.get(), 0);
        x.set(5);
        assert_eq!(y.get(), 5);
        let old = y.update(|v| {
            let old = *v;
            *v += 10;
            old
        });
        assert_eq!(old, 5);
        assert_eq!(x.get(), 15);
        Segment::reset(&name).unwrap();
    }

    #[test]
    fn string_versions() {
        init();
        let name = unique_name("shm_broker_test");
        let segment = Segment::open_or_create(&name, 100_000).unwrap();

        let s = SharedString::get_or_create(&segment, "version", "1.0.0.0").unwrap();
        assert_eq!(s.get(), "1.0.0.0");
        assert_eq!(s.version(), 1);
        s.set("2.0");
        s.set("2.1");
        assert_eq!(s.get(), "2.1");
        assert_eq!(s.version(), 3);

        // another handle with another default still sees the stored text
        let t = SharedString::get_or_create(&segment, "version", "other").unwrap();
        assert_eq!(t.get(), "2.1");
        Segment::reset(&name).unwrap();
    }

    #[test]
    fn first_creator_stores_the_initial_text() {
        init();
        let name = unique_name("shm_broker_test");
        let a = Segment::open_or_create(&name, 100_000).unwrap();
        let b = Segment::open_or_create(&name, 100_000).unwrap();

        let mine = SharedString::get_or_create(&a, "version", "1.0.0.0").unwrap();
        let theirs = SharedString::get_or_create(&b, "version", "9.9.9.9").unwrap();
        assert_eq!(theirs.get(), "1.0.0.0");
        assert_eq!(mine.version(), 1);
        assert_eq!(theirs.version(), 1);
        Segment::reset(&name).unwrap();
    }
}
