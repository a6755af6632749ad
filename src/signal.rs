/*
 * Mutexes and counting semaphores that live in the segment, so any process
 * that maps it can resolve them by name and use them.
 *
 * The mutex word holds the pid of its owner (0 when free). A waiter parks on
 * the futex for at most MUTEX_OWNER_CHECK_MILLIS, and if the owner has died
 * in the meantime the lock is taken over instead of staying stuck forever.
 * Several threads of one process are still excluded from each other, the
 * word never means "already mine".
 */
use crate::constants::MUTEX_OWNER_CHECK_MILLIS;
use crate::error::Result;
use crate::futex::{futex_wait, futex_wake};
use crate::segment::{Segment, Shared, SharedObject};
use log::{trace, warn};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks that the pid exists.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    return std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH);
}

#[repr(C)]
pub struct RawMutex {
    owner: AtomicU32,
}

unsafe impl SharedObject for RawMutex {
    fn type_tag() -> String {
        return "raw_mutex".to_string();
    }
}

pub struct RawMutexGuard<'a> {
    mutex: &'a RawMutex,
}

impl Drop for RawMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<'a> RawMutexGuard<'a> {
    /// Releases now instead of at the end of the scope.
    pub fn unlock(self) {}
}

impl RawMutex {
    pub fn owner(&self) -> u32 {
        return self.owner.load(Ordering::Acquire);
    }

    pub fn is_locked(&self) -> bool {
        return self.owner() != 0;
    }

    /// Takes the lock if it is free or its owner has died.
    pub fn try_lock(&self) -> Option<RawMutexGuard<'_>> {
        let me = std::process::id();
        let current = match self
            .owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => return Some(RawMutexGuard { mutex: self }),
            Err(current) => current,
        };
        if self.take_over_dead(current, me) {
            return Some(RawMutexGuard { mutex: self });
        }
        return None;
    }

    // Replaces `current` as owner if that process no longer exists.
    fn take_over_dead(&self, current: u32, me: u32) -> bool {
        if current == 0 || process_alive(current) {
            return false;
        }
        if self
            .owner
            .compare_exchange(current, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        warn!(
            "took over a mutex held by process {} which no longer exists",
            current
        );
        return true;
    }

    pub fn lock(&self) -> RawMutexGuard<'_> {
        let me = std::process::id();
        let slice = Duration::from_millis(MUTEX_OWNER_CHECK_MILLIS);
        loop {
            let current =
                match self
                    .owner
                    .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
                {
                    Ok(_) => return RawMutexGuard { mutex: self },
                    Err(current) => current,
                };

            if futex_wait(&self.owner, current, Some(slice)) {
                continue;
            }

            // timed out, make sure the owner is still around
            if self.take_over_dead(current, me) {
                return RawMutexGuard { mutex: self };
            }
        }
    }

    fn unlock(&self) {
        self.owner.store(0, Ordering::Release);
        futex_wake(&self.owner, 1);
    }
}

#[repr(C)]
pub struct RawSemaphore {
    count: AtomicU32,
}

unsafe impl SharedObject for RawSemaphore {
    fn type_tag() -> String {
        return "raw_semaphore".to_string();
    }
}

impl RawSemaphore {
    pub fn value(&self) -> u32 {
        return self.count.load(Ordering::Acquire);
    }

    pub fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);
        futex_wake(&self.count, 1);
    }

    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        return false;
    }

    pub fn wait(&self) {
        while !self.try_wait() {
            futex_wait(&self.count, 0, None);
        }
    }

    /// Returns false if `timeout` elapsed without a post.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            futex_wait(&self.count, 0, Some(deadline - now));
        }
    }
}

/// Something that any process attached to the segment can look up by name.
pub trait NamedSignal: Sized {
    fn get_or_create(segment: &Arc<Segment>, name: &str) -> Result<Self>;
    fn name(&self) -> &str;
}

pub type MutexGuard<'a> = RawMutexGuard<'a>;

#[derive(Clone)]
pub struct NamedMutex {
    name: String,
    raw: Shared<RawMutex>,
}

impl NamedSignal for NamedMutex {
    fn get_or_create(segment: &Arc<Segment>, name: &str) -> Result<NamedMutex> {
        return Ok(NamedMutex {
            name: name.to_string(),
            raw: segment.find_or_construct::<RawMutex>(name)?,
        });
    }

    fn name(&self) -> &str {
        return &self.name;
    }
}

impl NamedMutex {
    pub fn lock(&self) -> MutexGuard<'_> {
        trace!("locking {}", self.name);
        return self.raw.lock();
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        return self.raw.try_lock();
    }

    pub fn is_locked(&self) -> bool {
        return self.raw.is_locked();
    }

    #[cfg(test)]
    pub(crate) fn set_owner(&self, pid: u32) {
        self.raw.owner.store(pid, Ordering::SeqCst);
    }
}

/// Pid of a child that has already exited and been reaped.
#[cfg(test)]
pub(crate) fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    return pid;
}

#[derive(Clone)]
pub struct NamedSemaphore {
    name: String,
    raw: Shared<RawSemaphore>,
}

impl NamedSignal for NamedSemaphore {
    fn get_or_create(segment: &Arc<Segment>, name: &str) -> Result<NamedSemaphore> {
        return Ok(NamedSemaphore {
            name: name.to_string(),
            raw: segment.find_or_construct::<RawSemaphore>(name)?,
        });
    }

    fn name(&self) -> &str {
        return &self.name;
    }
}

impl NamedSemaphore {
    pub fn post(&self) {
        trace!("posting {}", self.name);
        self.raw.post();
    }

    pub fn wait(&self) {
        self.raw.wait();
    }

    pub fn try_wait(&self) -> bool {
        return self.raw.try_wait();
    }

    pub fn timed_wait(&self, timeout: Duration) -> bool {
        return self.raw.timed_wait(timeout);
    }

    pub fn value(&self) -> u32 {
        return self.raw.value();
    }
}
