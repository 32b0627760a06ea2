//! Counting-semaphore pair for parent/child rendezvous.
//!
//! A pair exposes two endpoints; each endpoint's `post` wakes the peer's
//! `wait`. Backing comes in two flavours: private (heap, usable between
//! threads of one address space, which includes `CLONE_VM` children) and
//! shared (anonymous shared mapping, survives fork and exec boundaries).
//! The shared flavour keeps its reference count inside the mapped region
//! so the last holder in any process unmaps it.

use std::cell::UnsafeCell;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::errors::ResourceError;

#[repr(C)]
struct Block {
    refs: AtomicU32,
    sems: [UnsafeCell<libc::sem_t>; 2],
}

// The sem_t cells are only touched through sem_* which synchronize
// internally.
unsafe impl Sync for Block {}
unsafe impl Send for Block {}

impl Block {
    /// Initialise the two semaphores in place. `pshared` selects
    /// process-shared semantics.
    unsafe fn init(ptr: *mut Block, pshared: bool, initial_refs: u32) -> Result<(), Errno> {
        let b = unsafe { &mut *ptr };
        b.refs = AtomicU32::new(initial_refs);
        let flag = i32::from(pshared);
        for sem in &b.sems {
            if unsafe { libc::sem_init(sem.get(), flag, 0) } != 0 {
                return Err(Errno::last());
            }
        }
        Ok(())
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        for sem in &self.sems {
            unsafe {
                libc::sem_destroy(sem.get());
            }
        }
    }
}

enum Backing {
    Private(Arc<Block>),
    Shared(NonNull<Block>),
}

unsafe impl Send for Backing {}

/// Which storage a pair lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemBacking {
    /// Normal allocation; endpoints must stay within one address space.
    Private,
    /// Anonymous shared mapping; endpoints may cross fork/exec.
    Shared,
}

/// One endpoint of a semaphore pair.
pub struct Semapair {
    backing: Backing,
    side: usize,
}

unsafe impl Send for Semapair {}

impl Semapair {
    /// Allocate a pair and return its two endpoints.
    pub fn pair(backing: SemBacking) -> Result<(Semapair, Semapair), ResourceError> {
        match backing {
            SemBacking::Private => {
                // refs is unused for Arc backing; Arc counts holders.
                let block = Arc::new(Block {
                    refs: AtomicU32::new(0),
                    sems: unsafe { std::mem::zeroed() },
                });
                for sem in &block.sems {
                    if unsafe { libc::sem_init(sem.get(), 0, 0) } != 0 {
                        return Err(ResourceError::SemAlloc(Errno::last()));
                    }
                }
                Ok((
                    Semapair {
                        backing: Backing::Private(block.clone()),
                        side: 0,
                    },
                    Semapair {
                        backing: Backing::Private(block),
                        side: 1,
                    },
                ))
            }
            SemBacking::Shared => {
                let len = NonZeroUsize::new(std::mem::size_of::<Block>())
                    .expect("Block is not zero-sized");
                let mem = unsafe {
                    mmap_anonymous(
                        None,
                        len,
                        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                        MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
                    )
                }
                .map_err(ResourceError::SemAlloc)?;
                let block = mem.cast::<Block>();
                unsafe { Block::init(block.as_ptr(), true, 2) }
                    .map_err(ResourceError::SemAlloc)?;
                Ok((
                    Semapair {
                        backing: Backing::Shared(block),
                        side: 0,
                    },
                    Semapair {
                        backing: Backing::Shared(block),
                        side: 1,
                    },
                ))
            }
        }
    }

    fn block(&self) -> &Block {
        match &self.backing {
            Backing::Private(arc) => arc,
            Backing::Shared(ptr) => unsafe { ptr.as_ref() },
        }
    }

    fn sem(&self, n: usize) -> *mut libc::sem_t {
        self.block().sems[n % 2].get()
    }

    /// Block until the peer posts.
    pub fn wait(&self) {
        loop {
            let r = unsafe { libc::sem_wait(self.sem(self.side)) };
            if r == 0 || Errno::last() != Errno::EINTR {
                return;
            }
        }
    }

    /// Wake the peer.
    pub fn post(&self) {
        unsafe {
            libc::sem_post(self.sem(self.side + 1));
        }
    }

    /// Post the peer, then wait for it: the handshake primitive.
    pub fn rendezvous(&self) {
        self.post();
        self.wait();
    }
}

impl Clone for Semapair {
    fn clone(&self) -> Self {
        let backing = match &self.backing {
            Backing::Private(arc) => Backing::Private(arc.clone()),
            Backing::Shared(ptr) => {
                unsafe { ptr.as_ref() }.refs.fetch_add(1, Ordering::Relaxed);
                Backing::Shared(*ptr)
            }
        };
        Semapair {
            backing,
            side: self.side,
        }
    }
}

impl Drop for Semapair {
    fn drop(&mut self) {
        if let Backing::Shared(ptr) = &self.backing {
            let prev = unsafe { ptr.as_ref() }.refs.fetch_sub(1, Ordering::AcqRel);
            if prev == 1 {
                unsafe {
                    std::ptr::drop_in_place(ptr.as_ptr());
                    let _ = munmap(ptr.cast(), std::mem::size_of::<Block>());
                }
            }
        }
    }
}

impl std::fmt::Debug for Semapair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Private(_) => "private",
            Backing::Shared(_) => "shared",
        };
        f.debug_struct("Semapair")
            .field("backing", &kind)
            .field("side", &self.side)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_pair_rendezvous_across_threads() {
        let (a, b) = Semapair::pair(SemBacking::Private).unwrap();
        let t = std::thread::spawn(move || {
            b.rendezvous();
        });
        a.wait();
        a.post();
        t.join().unwrap();
    }

    #[test]
    fn clone_and_drop_do_not_tear_down_early() {
        let (a, b) = Semapair::pair(SemBacking::Shared).unwrap();
        let extra = a.clone();
        drop(a);
        // The pair is still usable through the clone.
        let t = std::thread::spawn(move || {
            b.rendezvous();
        });
        extra.wait();
        extra.post();
        t.join().unwrap();
    }

    #[test]
    fn shared_pair_crosses_fork() {
        use nix::sys::wait::waitpid;
        use nix::unistd::{fork, ForkResult};

        let (a, b) = Semapair::pair(SemBacking::Shared).unwrap();
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                b.rendezvous();
                unsafe { libc::_exit(0) };
            }
            ForkResult::Parent { child } => {
                a.wait();
                a.post();
                waitpid(child, None).unwrap();
            }
        }
    }
}
