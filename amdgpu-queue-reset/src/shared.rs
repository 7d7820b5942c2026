// Cross-process round state and barrier
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    cell::UnsafeCell,
    ffi::CString,
    fmt,
    mem::size_of,
    ops::Deref,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering},
};

use bitflags::bitflags;
use log::{debug, trace};
use thiserror::Error as ThisError;
use vmm_sys_util::errno::Error as Errno;

use crate::{
    catalog::{ErrorKind, ExpectedResult, Job},
    device::IpType,
};

/// Roles that cross the round barrier.
pub const NUM_PARTICIPANTS: u32 = 4;
/// Descriptor the background process finds the shared region on.
pub const SHARED_CHILD_DESCRIPTOR: RawFd = 3;
pub const SHARED_MEMORY_NAME: &str = "/queue_reset_shm";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, ThisError)]
pub enum Error {
    #[error("Invalid shared memory name")]
    InvalidName,
    #[error("Failed to open shared memory: {0}")]
    Open(Errno),
    #[error("Failed to size shared memory: {0}")]
    Truncate(Errno),
    #[error("Shared memory is {0} bytes, expected at least {1}")]
    TooSmall(u64, usize),
    #[error("Failed to map shared memory: {0}")]
    Map(Errno),
    #[error("Failed to initialize semaphore: {0}")]
    SemInit(Errno),
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TestFlags: u32 {
        const ERROR_CODE_SET = 1 << 0;
        const SETUP_FAILED = 1 << 1;
    }
}

bitflags! {
    /// What the monitor saw during a round.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ResetBits: u32 {
        const QUEUE_RESET = 1 << 0;
        const GPU_RESET_BEGIN = 1 << 1;
        const GPU_RESET_END_SUCCESS = 1 << 2;
        const GPU_RESET_END_FAILURE = 1 << 3;
        /// The reset state of the round context could not be read.
        const QUERY_FAILED = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Scheduler,
    Monitor,
    Test,
    Background,
}

/// How far a role got in crossing the barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Phase {
    Outside = 0,
    /// Counted by `enter`, waiting for the others.
    Arrived = 1,
    Inside = 2,
    /// Counted out by `exit`, waiting for the others.
    Leaving = 3,
    /// Crossed the sentinel round.
    Done = 4,
}

impl Phase {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Arrived,
            2 => Self::Inside,
            3 => Self::Leaving,
            4 => Self::Done,
            _ => Self::Outside,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scheduler => "scheduler",
            Self::Monitor => "monitor",
            Self::Test => "test",
            Self::Background => "background",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TestState {
    pub completed: bool,
    pub error_code: i32,
    pub flags: TestFlags,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResetState {
    pub completed: bool,
    pub flags: ResetBits,
}

/// Job assignment of one round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoundPlan {
    pub round: u32,
    /// `false` ends the run.
    pub job_exists: bool,
    pub skipped: bool,
    pub bad_job: Option<Job>,
    pub good_job: Option<Job>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackgroundStats {
    pub good_jobs_ok: u64,
    pub good_jobs_failed: u64,
    /// First unexpected status, zero when none.
    pub error: i32,
}

#[repr(C)]
#[derive(Default)]
struct JobSlot {
    present: AtomicBool,
    error: AtomicU32,
    ip: AtomicU32,
    ring_id: AtomicU32,
    expected: AtomicU32,
}

impl JobSlot {
    fn store(&self, job: Option<Job>) {
        self.present.store(job.is_some(), Ordering::Relaxed);
        if let Some(job) = job {
            self.error.store(job.error as u32, Ordering::Relaxed);
            self.ip.store(job.ip as u32, Ordering::Relaxed);
            self.ring_id.store(job.ring_id, Ordering::Relaxed);
            self.expected
                .store(job.expected.map_or(0, |e| e as u32), Ordering::Relaxed);
        }
    }

    fn load(&self) -> Option<Job> {
        if !self.present.load(Ordering::Relaxed) {
            return None;
        }
        Some(Job {
            error: ErrorKind::from_raw(self.error.load(Ordering::Relaxed))?,
            ip: IpType::from_raw(self.ip.load(Ordering::Relaxed))?,
            ring_id: self.ring_id.load(Ordering::Relaxed),
            expected: ExpectedResult::from_raw(self.expected.load(Ordering::Relaxed)),
        })
    }
}

/// Layout of the shared mapping. Every role maps the same bytes, so the
/// layout only ever changes together with the binary.
#[repr(C)]
pub struct SharedRegion {
    mutex: UnsafeCell<libc::sem_t>,
    state_mutex: UnsafeCell<libc::sem_t>,
    enter_barrier: UnsafeCell<libc::sem_t>,
    exit_barrier: UnsafeCell<libc::sem_t>,
    count: AtomicU32,
    phases: [AtomicU32; NUM_PARTICIPANTS as usize],

    round: AtomicU32,
    job_exists: AtomicBool,
    round_skipped: AtomicBool,
    bad_job: JobSlot,
    good_job: JobSlot,

    test_completed: AtomicBool,
    test_error_code: AtomicI32,
    test_flags: AtomicU32,
    reset_completed: AtomicBool,
    reset_flags: AtomicU32,

    good_jobs_ok: AtomicU64,
    good_jobs_failed: AtomicU64,
    background_error: AtomicI32,
}

// SAFETY: the semaphores are process shared and made for concurrent use,
// everything else is atomic.
unsafe impl Sync for SharedRegion {}

fn sem_wait(sem: &UnsafeCell<libc::sem_t>) {
    loop {
        // SAFETY: the semaphore was initialized by the owner of the region
        // and is destroyed only after every role is done with it.
        if unsafe { libc::sem_wait(sem.get()) } == 0 {
            return;
        }
        if Errno::last().errno() != libc::EINTR {
            return;
        }
    }
}

fn sem_post(sem: &UnsafeCell<libc::sem_t>) {
    // SAFETY: see `sem_wait`.
    unsafe { libc::sem_post(sem.get()) };
}

/// Holds `state_mutex` for its lifetime.
struct StateGuard<'a>(&'a UnsafeCell<libc::sem_t>);

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        sem_post(self.0);
    }
}

impl SharedRegion {
    fn lock_state(&self) -> StateGuard<'_> {
        sem_wait(&self.state_mutex);
        StateGuard(&self.state_mutex)
    }

    /// Roles waiting between barrier enter and exit.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn phase(&self, role: Role) -> Phase {
        Phase::from_raw(self.phases[role as usize].load(Ordering::SeqCst))
    }

    fn set_phase(&self, role: Role, phase: Phase) {
        self.phases[role as usize].store(phase as u32, Ordering::SeqCst);
    }

    /// Assigns the next round and clears every result of the last one.
    pub fn publish_round(&self, plan: &RoundPlan) {
        let _guard = self.lock_state();
        self.round.store(plan.round, Ordering::Relaxed);
        self.job_exists.store(plan.job_exists, Ordering::Relaxed);
        self.round_skipped.store(plan.skipped, Ordering::Relaxed);
        self.bad_job.store(plan.bad_job);
        self.good_job.store(plan.good_job);

        self.test_completed.store(false, Ordering::Relaxed);
        self.test_error_code.store(0, Ordering::Relaxed);
        self.test_flags.store(0, Ordering::Relaxed);
        self.reset_completed.store(false, Ordering::Relaxed);
        self.reset_flags.store(0, Ordering::Relaxed);
        self.good_jobs_ok.store(0, Ordering::Relaxed);
        self.good_jobs_failed.store(0, Ordering::Relaxed);
        self.background_error.store(0, Ordering::Relaxed);
    }

    pub fn round_plan(&self) -> RoundPlan {
        let _guard = self.lock_state();
        RoundPlan {
            round: self.round.load(Ordering::Relaxed),
            job_exists: self.job_exists.load(Ordering::Relaxed),
            skipped: self.round_skipped.load(Ordering::Relaxed),
            bad_job: self.bad_job.load(),
            good_job: self.good_job.load(),
        }
    }

    pub fn set_test_state(&self, state: TestState) {
        let _guard = self.lock_state();
        self.test_completed.store(state.completed, Ordering::Relaxed);
        self.test_error_code.store(state.error_code, Ordering::Relaxed);
        self.test_flags.store(state.flags.bits(), Ordering::Relaxed);
    }

    pub fn test_state(&self) -> TestState {
        let _guard = self.lock_state();
        TestState {
            completed: self.test_completed.load(Ordering::Relaxed),
            error_code: self.test_error_code.load(Ordering::Relaxed),
            flags: TestFlags::from_bits_truncate(self.test_flags.load(Ordering::Relaxed)),
        }
    }

    pub fn set_reset_state(&self, state: ResetState) {
        let _guard = self.lock_state();
        self.reset_completed.store(state.completed, Ordering::Relaxed);
        self.reset_flags.store(state.flags.bits(), Ordering::Relaxed);
    }

    pub fn reset_state(&self) -> ResetState {
        let _guard = self.lock_state();
        ResetState {
            completed: self.reset_completed.load(Ordering::Relaxed),
            flags: ResetBits::from_bits_truncate(self.reset_flags.load(Ordering::Relaxed)),
        }
    }

    /// Both the faulting job and the monitor are done with the round.
    pub fn round_complete(&self) -> bool {
        let _guard = self.lock_state();
        self.test_completed.load(Ordering::Relaxed) && self.reset_completed.load(Ordering::Relaxed)
    }

    pub fn record_good_job(&self, ok: bool) {
        let _guard = self.lock_state();
        if ok {
            self.good_jobs_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.good_jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Keeps the first unexpected background status of the round.
    pub fn set_background_error(&self, code: i32) {
        let _guard = self.lock_state();
        if self.background_error.load(Ordering::Relaxed) == 0 {
            self.background_error.store(code, Ordering::Relaxed);
        }
    }

    pub fn background_stats(&self) -> BackgroundStats {
        let _guard = self.lock_state();
        BackgroundStats {
            good_jobs_ok: self.good_jobs_ok.load(Ordering::Relaxed),
            good_jobs_failed: self.good_jobs_failed.load(Ordering::Relaxed),
            error: self.background_error.load(Ordering::Relaxed),
        }
    }
}

/// Counting barrier over the shared region.
///
/// All `participants` call [`enter`](Self::enter) and later
/// [`exit`](Self::exit) once per round. Nobody leaves `enter` before all
/// have arrived and nobody leaves `exit` before all have arrived there, so
/// no role starts round N+1 while another still works on round N.
pub struct RoundBarrier<'a> {
    region: &'a SharedRegion,
    participants: u32,
}

impl<'a> RoundBarrier<'a> {
    pub fn new(region: &'a SharedRegion, participants: u32) -> Self {
        Self {
            region,
            participants,
        }
    }

    pub fn participants(&self) -> u32 {
        self.participants
    }

    pub fn enter(&self, role: Role) {
        trace!("{role} entering barrier");
        sem_wait(&self.region.mutex);
        let arrived = self.region.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.region.set_phase(role, Phase::Arrived);
        sem_post(&self.region.mutex);

        if arrived == self.participants {
            debug!("{role} releases barrier enter");
            for _ in 0..self.participants {
                sem_post(&self.region.enter_barrier);
            }
        }
        self.wait_enter(role);
    }

    fn wait_enter(&self, role: Role) {
        sem_wait(&self.region.enter_barrier);
        self.region.set_phase(role, Phase::Inside);
    }

    pub fn exit(&self, role: Role) {
        trace!("{role} leaving barrier");
        sem_wait(&self.region.mutex);
        let remaining = self.region.count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.region.set_phase(role, Phase::Leaving);
        sem_post(&self.region.mutex);

        if remaining == 0 {
            debug!("{role} releases barrier exit");
            for _ in 0..self.participants {
                sem_post(&self.region.exit_barrier);
            }
        }
        self.wait_exit(role);
    }

    fn wait_exit(&self, role: Role) {
        sem_wait(&self.region.exit_barrier);
        self.region.set_phase(role, Phase::Outside);
    }

    /// Completes the barrier step `role` stopped in and returns where that
    /// leaves it. Used to take over from a role that died.
    pub fn resume(&self, role: Role) -> Phase {
        match self.region.phase(role) {
            Phase::Arrived => {
                self.wait_enter(role);
                Phase::Inside
            }
            Phase::Leaving => {
                self.wait_exit(role);
                Phase::Outside
            }
            phase => phase,
        }
    }

    /// Records that `role` left the sentinel round.
    pub fn finish(&self, role: Role) {
        self.region.set_phase(role, Phase::Done);
    }
}

/// A mapping of [`SharedRegion`].
///
/// The owner initializes the semaphores and tears them down on drop,
/// before the mapping goes away.
pub struct SharedMemory {
    region: NonNull<SharedRegion>,
    fd: Option<OwnedFd>,
    name: Option<CString>,
    owner: bool,
}

// SAFETY: the region is only accessed through `&SharedRegion`, which is
// Sync.
unsafe impl Send for SharedMemory {}
// SAFETY: see above.
unsafe impl Sync for SharedMemory {}

fn map_region(fd: Option<RawFd>) -> Result<NonNull<SharedRegion>> {
    let flags = match fd {
        Some(_) => libc::MAP_SHARED,
        None => libc::MAP_SHARED | libc::MAP_ANONYMOUS,
    };
    // SAFETY: a fresh shared mapping of the region's size; the file, when
    // there is one, is at least that large.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size_of::<SharedRegion>(),
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd.unwrap_or(-1),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(Error::Map(Errno::last()));
    }
    NonNull::new(addr.cast::<SharedRegion>()).ok_or(Error::Map(Errno::new(libc::EFAULT)))
}

impl SharedMemory {
    /// Creates the named region the background process inherits.
    pub fn create(name: &str) -> Result<Self> {
        let cname = CString::new(name).map_err(|_| Error::InvalidName)?;
        // A previous run that crashed may have left the name behind.
        // SAFETY: `cname` is a valid C string.
        unsafe { libc::shm_unlink(cname.as_ptr()) };

        // SAFETY: `cname` is a valid C string.
        let raw = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if raw < 0 {
            return Err(Error::Open(Errno::last()));
        }
        // SAFETY: `raw` is a freshly opened descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mapped = {
            // SAFETY: `fd` is a valid shared memory object.
            let ret = unsafe {
                libc::ftruncate(fd.as_raw_fd(), size_of::<SharedRegion>() as libc::off_t)
            };
            if ret < 0 {
                Err(Error::Truncate(Errno::last()))
            } else {
                map_region(Some(fd.as_raw_fd()))
            }
        };
        let region = match mapped {
            Ok(region) => region,
            Err(e) => {
                // SAFETY: `cname` is a valid C string.
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                return Err(e);
            }
        };

        let mut memory = Self {
            region,
            fd: Some(fd),
            name: Some(cname),
            owner: false,
        };
        memory.init()?;
        debug!("Created shared memory {name}");
        Ok(memory)
    }

    /// Creates an unnamed region for roles running as threads.
    pub fn anonymous() -> Result<Self> {
        let mut memory = Self {
            region: map_region(None)?,
            fd: None,
            name: None,
            owner: false,
        };
        memory.init()?;
        Ok(memory)
    }

    /// Maps a region created by another process, handed over as `fd`.
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor this call may take ownership of.
    pub unsafe fn open_fd(fd: RawFd) -> Result<Self> {
        let fd = OwnedFd::from_raw_fd(fd);
        let mut stat = std::mem::MaybeUninit::<libc::stat>::zeroed();
        if libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) < 0 {
            return Err(Error::Open(Errno::last()));
        }
        let size = stat.assume_init().st_size as u64;
        if size < size_of::<SharedRegion>() as u64 {
            return Err(Error::TooSmall(size, size_of::<SharedRegion>()));
        }
        Ok(Self {
            region: map_region(Some(fd.as_raw_fd()))?,
            fd: Some(fd),
            name: None,
            owner: false,
        })
    }

    fn init(&mut self) -> Result<()> {
        let region = self.region();
        for (sem, value) in [
            (&region.mutex, 1),
            (&region.state_mutex, 1),
            (&region.enter_barrier, 0),
            (&region.exit_barrier, 0),
        ] {
            // SAFETY: the semaphore lives in a zero filled shared mapping
            // and is initialized exactly once, here.
            if unsafe { libc::sem_init(sem.get(), 1, value) } < 0 {
                return Err(Error::SemInit(Errno::last()));
            }
        }
        self.owner = true;
        Ok(())
    }

    pub fn region(&self) -> &SharedRegion {
        // SAFETY: the mapping is valid until drop.
        unsafe { self.region.as_ref() }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

impl Deref for SharedMemory {
    type Target = SharedRegion;

    fn deref(&self) -> &SharedRegion {
        self.region()
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if self.owner {
            let region = self.region();
            for sem in [
                &region.mutex,
                &region.state_mutex,
                &region.enter_barrier,
                &region.exit_barrier,
            ] {
                // SAFETY: initialized by `init`, no role waits on it anymore.
                unsafe { libc::sem_destroy(sem.get()) };
            }
        }
        // SAFETY: unmaps the region mapped in the constructor.
        unsafe {
            libc::munmap(
                self.region.as_ptr().cast::<libc::c_void>(),
                size_of::<SharedRegion>(),
            )
        };
        if let Some(name) = &self.name {
            // SAFETY: `name` is a valid C string.
            unsafe { libc::shm_unlink(name.as_ptr()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, thread};

    use rusty_fork::rusty_fork_test;

    use super::*;

    fn job(ring_id: u32) -> Job {
        Job {
            error: ErrorKind::InvalidProgramAddr,
            ip: IpType::Compute,
            ring_id,
            expected: Some(ExpectedResult::QueueReset),
        }
    }

    #[test]
    fn test_publish_clears_round_state() {
        let shm = SharedMemory::anonymous().unwrap();
        shm.set_test_state(TestState {
            completed: true,
            error_code: -libc::ENODATA,
            flags: TestFlags::ERROR_CODE_SET,
        });
        shm.set_reset_state(ResetState {
            completed: true,
            flags: ResetBits::QUEUE_RESET,
        });
        shm.record_good_job(true);
        shm.set_background_error(-libc::EIO);
        shm.set_background_error(-libc::EINVAL);
        assert!(shm.round_complete());
        assert_eq!(shm.background_stats().error, -libc::EIO);

        let plan = RoundPlan {
            round: 3,
            job_exists: true,
            skipped: false,
            bad_job: Some(job(1)),
            good_job: Some(Job {
                error: ErrorKind::CmdStreamExecSuccess,
                expected: None,
                ..job(0)
            }),
        };
        shm.publish_round(&plan);
        assert_eq!(shm.round_plan(), plan);
        assert_eq!(shm.test_state(), TestState::default());
        assert_eq!(shm.reset_state(), ResetState::default());
        assert_eq!(shm.background_stats(), BackgroundStats::default());
        assert!(!shm.round_complete());
    }

    #[test]
    fn test_barrier_rounds() {
        const ROUNDS: u32 = 50;
        let shm = SharedMemory::anonymous().unwrap();
        let barrier = RoundBarrier::new(shm.region(), NUM_PARTICIPANTS);
        let seen = AtomicUsize::new(0);

        thread::scope(|s| {
            for role in [Role::Monitor, Role::Test, Role::Background] {
                let (shm, barrier, seen) = (&shm, &barrier, &seen);
                s.spawn(move || loop {
                    barrier.enter(role);
                    let plan = shm.round_plan();
                    barrier.exit(role);
                    if !plan.job_exists {
                        break;
                    }
                    // Every role sees the round the scheduler published
                    // before it entered.
                    assert_eq!(plan.bad_job.map(|j| j.ring_id), Some(plan.round));
                    seen.fetch_add(1, Ordering::SeqCst);
                });
            }

            for round in 0..=ROUNDS {
                shm.publish_round(&RoundPlan {
                    round,
                    job_exists: round < ROUNDS,
                    bad_job: Some(job(round)),
                    ..Default::default()
                });
                barrier.enter(Role::Scheduler);
                assert_eq!(shm.round_plan().round, round);
                barrier.exit(Role::Scheduler);
            }
        });

        assert_eq!(seen.load(Ordering::SeqCst), 3 * ROUNDS as usize);
        assert_eq!(shm.count(), 0);
    }

    #[test]
    fn test_resume_takes_over_a_crossing() {
        let shm = SharedMemory::anonymous().unwrap();
        let barrier = RoundBarrier::new(shm.region(), 2);
        assert_eq!(barrier.resume(Role::Test), Phase::Outside);

        thread::scope(|s| {
            // The test role arrives and is never heard from again.
            s.spawn(|| {
                sem_wait(&shm.mutex);
                shm.count.fetch_add(1, Ordering::SeqCst);
                shm.set_phase(Role::Test, Phase::Arrived);
                sem_post(&shm.mutex);
            })
            .join()
            .unwrap();

            let scheduler = s.spawn(|| {
                barrier.enter(Role::Scheduler);
                barrier.exit(Role::Scheduler);
            });
            assert_eq!(barrier.resume(Role::Test), Phase::Inside);
            barrier.exit(Role::Test);
            scheduler.join().unwrap();
        });

        assert_eq!(shm.count(), 0);
        assert_eq!(shm.phase(Role::Scheduler), Phase::Outside);
        barrier.finish(Role::Test);
        assert_eq!(barrier.resume(Role::Test), Phase::Done);
    }

    rusty_fork_test! {
        #[test]
        fn test_named_region_shared_through_fd() {
            let name = format!("/queue_reset_test_{}", std::process::id());
            let owner = SharedMemory::create(&name).unwrap();
            // SAFETY: dup returns a new descriptor handed to `open_fd`.
            let fd = unsafe { libc::dup(owner.raw_fd().unwrap()) };
            assert!(fd >= 0);
            // SAFETY: `fd` is a fresh duplicate we own.
            let child = unsafe { SharedMemory::open_fd(fd) }.unwrap();

            child.set_test_state(TestState {
                completed: true,
                error_code: -libc::ETIME,
                flags: TestFlags::ERROR_CODE_SET,
            });
            assert_eq!(owner.test_state().error_code, -libc::ETIME);
            drop(child);
            drop(owner);

            let cname = CString::new(name).unwrap();
            // SAFETY: `cname` is a valid C string.
            let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
            assert!(fd < 0, "owner drop unlinks the name");
        }

        #[test]
        fn test_open_fd_rejects_small_object() {
            let file = tempfile::tempfile().unwrap();
            // SAFETY: dup returns a new descriptor handed to `open_fd`.
            let fd = unsafe { libc::dup(file.as_raw_fd()) };
            assert!(matches!(
                // SAFETY: `fd` is a fresh duplicate we own.
                unsafe { SharedMemory::open_fd(fd) },
                Err(Error::TooSmall(0, _))
            ));
        }
    }
}
