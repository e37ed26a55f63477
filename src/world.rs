//! Ranks as processes sharing one POSIX shared memory segment.
//!
//! Rank 0 creates the segment, then re-executes the current binary once per additional rank
//! with the same command line. Children find the segment through an environment variable and
//! claim the first free rank. Every ordered pair of ranks owns one message slot; a send blocks
//! until the receiver acknowledges, so each slot holds at most one message at a time.
//!
//! Every blocking wait also watches a world-wide abort code, which is how a rank that cannot
//! continue releases its peers instead of leaving them spinning in a collective.

use std::env;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use log::{debug, error};
use serde::{de::DeserializeOwned, Serialize};
use shared_memory::{Shmem, ShmemConf};

use crate::comm::{Communicator, Context};
use crate::{Result, RuntimeError};

/// Upper bound on the number of ranks one segment is laid out for.
pub const MAX_RANKS: usize = 32;

const MAX_MSG_SIZE: usize = 4096; // payloads are scalars and unit markers
const HEADER_SIZE: usize = std::mem::size_of::<MessageHeader>();
const SLOT_SIZE: usize = HEADER_SIZE + MAX_MSG_SIZE;
const STATE_SIZE: usize = std::mem::size_of::<SharedState>();

const SPAWNED_ENV: &str = "RANK_SUM_SPAWNED";
const SHM_ENV: &str = "RANK_SUM_SHM";

const BROADCAST_TAG: i32 = 0;
const BARRIER_ARRIVE_TAG: i32 = -1;
const BARRIER_COMPLETE_TAG: i32 = -2;
const REDUCE_TAG: i32 = -3;

#[repr(C)]
struct MessageHeader {
    valid: AtomicBool,
    received: AtomicBool,
    tag: AtomicI32,
    source: AtomicUsize,
    len: AtomicUsize,
}

impl MessageHeader {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            received: AtomicBool::new(false),
            tag: AtomicI32::new(0),
            source: AtomicUsize::new(usize::MAX),
            len: AtomicUsize::new(0),
        }
    }
}

#[repr(C)]
struct SharedState {
    size: AtomicUsize,
    process_ids: [AtomicUsize; MAX_RANKS], // 0 while the rank is unclaimed
    init_flags: [AtomicBool; MAX_RANKS],
    done_flags: [AtomicBool; MAX_RANKS],
    abort_code: AtomicI32, // 0 while running
}

/// The group of processes taking part in the computation.
///
/// # Examples
///
/// ```rust,no_run
/// use rank_sum::{Communicator, World};
///
/// let world = World::init(4).unwrap();
/// let ctx = world.context();
///
/// let total = world.all_reduce_sum(ctx.rank() as u64).unwrap();
/// assert_eq!(total, 6);
///
/// world.finalize().unwrap();
/// ```
pub struct World {
    rank: usize,
    size: usize,
    shmem: Shmem,
    children: Vec<Child>,
}

impl World {
    /// Initialize the runtime with `size` ranks.
    ///
    /// Called in the launching process, this creates the shared segment, spawns `size - 1`
    /// copies of the current executable and returns rank 0 once all of them have claimed a rank.
    /// Called in a spawned copy, it attaches to the segment instead. Both sides block until
    /// every rank is up.
    pub fn init(size: usize) -> Result<Self> {
        if size == 0 || size > MAX_RANKS {
            return Err(RuntimeError::InitError(format!(
                "Size must be between 1 and {MAX_RANKS}, got {size}"
            )));
        }

        if env::var_os(SPAWNED_ENV).is_some() {
            return Self::init_spawned(size);
        }

        debug!("Initializing world with {} ranks", size);

        let link = env::temp_dir().join(format!("rank_sum_{}", std::process::id()));
        let total_size = STATE_SIZE + size * size * SLOT_SIZE;
        debug!("Creating shared memory of size {} at {:?}", total_size, link);

        let shmem = ShmemConf::new()
            .size(total_size)
            .flink(&link)
            .create()
            .map_err(|e| RuntimeError::SharedMemoryError(e.to_string()))?;

        let mut world = World {
            rank: 0,
            size,
            shmem,
            children: Vec::with_capacity(size - 1),
        };

        unsafe {
            let base = world.shmem.as_ptr();
            std::ptr::write(base as *mut SharedState, std::mem::zeroed());
            for i in 0..size * size {
                let header = base.add(STATE_SIZE + i * SLOT_SIZE) as *mut MessageHeader;
                std::ptr::write(header, MessageHeader::new());
            }
        }

        let state = world.state();
        state.size.store(size, Ordering::SeqCst);
        state.process_ids[0].store(std::process::id() as usize, Ordering::SeqCst);
        state.init_flags[0].store(true, Ordering::SeqCst);

        world.spawn_children(&link)?;
        debug!("Parent process initialized as rank 0");

        world.wait_for_all(|state, rank| state.init_flags[rank].load(Ordering::SeqCst))?;
        Ok(world)
    }

    fn spawn_children(&mut self, link: &Path) -> Result<()> {
        let exe = match env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                self.abort(1);
                return Err(RuntimeError::ProcessError(e.to_string()));
            }
        };

        for _ in 1..self.size {
            let spawned = Command::new(&exe)
                .args(env::args_os().skip(1))
                .env(SPAWNED_ENV, "1")
                .env(SHM_ENV, link)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn();

            match spawned {
                Ok(child) => self.children.push(child),
                Err(e) => {
                    // Already running children are waiting for peers that will never come.
                    self.abort(1);
                    return Err(RuntimeError::ProcessError(e.to_string()));
                }
            }
        }
        Ok(())
    }

    fn init_spawned(size: usize) -> Result<Self> {
        debug!("Spawned process initializing");

        let link = env::var_os(SHM_ENV)
            .ok_or_else(|| RuntimeError::InitError(format!("{SHM_ENV} is not set")))?;

        let shmem = ShmemConf::new()
            .flink(&link)
            .open()
            .map_err(|e| RuntimeError::SharedMemoryError(e.to_string()))?;

        let mut world = World {
            rank: usize::MAX,
            size,
            shmem,
            children: Vec::new(),
        };

        let state = world.state();
        let launched = state.size.load(Ordering::SeqCst);
        if launched != size {
            world.signal_abort(1);
            return Err(RuntimeError::InitError(format!(
                "Launched with {launched} ranks but this process expects {size}"
            )));
        }

        let pid = std::process::id() as usize;
        let claimed = (1..size).find(|&rank| {
            state.process_ids[rank]
                .compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        });
        let Some(rank) = claimed else {
            world.signal_abort(1);
            return Err(RuntimeError::InitError(format!(
                "No available ranks for process {pid}"
            )));
        };

        debug!("Process {} initialized as rank {}", pid, rank);
        state.init_flags[rank].store(true, Ordering::SeqCst);
        world.rank = rank;

        world.wait_for_all(|state, rank| state.init_flags[rank].load(Ordering::SeqCst))?;
        Ok(world)
    }

    /// The rank (0 to `size() - 1`) of this process.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The number of processes in the world.
    pub fn size(&self) -> usize {
        self.size
    }

    fn state(&self) -> &SharedState {
        unsafe { &*(self.shmem.as_ptr() as *const SharedState) }
    }

    fn slot(&self, src: usize, dst: usize) -> (&MessageHeader, *mut u8) {
        let offset = STATE_SIZE + (src * self.size + dst) * SLOT_SIZE;
        unsafe {
            let ptr = self.shmem.as_ptr().add(offset);
            (&*(ptr as *const MessageHeader), ptr.add(HEADER_SIZE))
        }
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.size {
            return Err(RuntimeError::InvalidRank(rank));
        }
        Ok(())
    }

    fn check_abort(&self) -> Result<()> {
        match self.state().abort_code.load(Ordering::SeqCst) {
            0 => Ok(()),
            code => Err(RuntimeError::Aborted(code)),
        }
    }

    /// Publish `code` as the world's abort code unless one is already set; returns the code in
    /// effect. Zero is not a valid abort code and is raised to 1.
    fn signal_abort(&self, code: i32) -> i32 {
        let code = if code == 0 { 1 } else { code };
        match self.state().abort_code.compare_exchange(
            0,
            code,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => code,
            Err(first) => first,
        }
    }

    /// Spin until `ready` holds, bailing out if the world is aborted meanwhile.
    fn spin_until(&self, mut ready: impl FnMut() -> bool) -> Result<()> {
        while !ready() {
            self.check_abort()?;
            std::thread::yield_now();
        }
        Ok(())
    }

    fn wait_for_all(&self, flag: impl Fn(&SharedState, usize) -> bool) -> Result<()> {
        let state = self.state();
        self.spin_until(|| (0..self.size).all(|rank| flag(state, rank)))
    }

    /// Send `data` to `dest`, blocking until it has been received.
    pub fn send<T: Serialize>(&self, data: &T, dest: usize, tag: i32) -> Result<()> {
        self.check_rank(dest)?;
        debug!("Rank {} sending to rank {} with tag {}", self.rank, dest, tag);

        let payload =
            bincode::serialize(data).map_err(|e| RuntimeError::SerializationError(e.to_string()))?;
        if payload.len() > MAX_MSG_SIZE {
            return Err(RuntimeError::CommunicationError(format!(
                "Message of {} bytes exceeds the {} byte slot",
                payload.len(),
                MAX_MSG_SIZE
            )));
        }

        let (header, body) = self.slot(self.rank, dest);
        self.spin_until(|| !header.valid.load(Ordering::SeqCst))?;

        header.tag.store(tag, Ordering::SeqCst);
        header.source.store(self.rank, Ordering::SeqCst);
        header.len.store(payload.len(), Ordering::SeqCst);
        header.received.store(false, Ordering::SeqCst);
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), body, payload.len());
        }
        header.valid.store(true, Ordering::SeqCst);

        self.spin_until(|| header.received.load(Ordering::SeqCst))?;
        debug!("Rank {} completed send to rank {}", self.rank, dest);
        Ok(())
    }

    /// Receive the next message from `source` carrying `tag`.
    pub fn recv<T: DeserializeOwned>(&self, source: usize, tag: i32) -> Result<T> {
        self.check_rank(source)?;
        debug!("Rank {} receiving from rank {} with tag {}", self.rank, source, tag);

        let (header, body) = self.slot(source, self.rank);
        self.spin_until(|| {
            header.valid.load(Ordering::SeqCst)
                && header.source.load(Ordering::SeqCst) == source
                && header.tag.load(Ordering::SeqCst) == tag
        })?;

        let decoded = unsafe {
            let bytes = std::slice::from_raw_parts(body, header.len.load(Ordering::SeqCst));
            bincode::deserialize(bytes)
        };

        // Acknowledge even a payload that fails to decode so the sender is not left waiting.
        header.received.store(true, Ordering::SeqCst);
        header.valid.store(false, Ordering::SeqCst);

        debug!("Rank {} completed receive from rank {}", self.rank, source);
        decoded.map_err(|e| RuntimeError::SerializationError(e.to_string()))
    }

    /// Broadcast `data` from `root` to every rank. Non-root ranks' `data` is ignored.
    pub fn broadcast<T: Serialize + DeserializeOwned + Clone>(&self, data: &T, root: usize) -> Result<T> {
        self.check_rank(root)?;

        if self.rank == root {
            for rank in (0..self.size).filter(|&rank| rank != root) {
                self.send(data, rank, BROADCAST_TAG)?;
            }
            Ok(data.clone())
        } else {
            self.recv(root, BROADCAST_TAG)
        }
    }

    /// Tear the world down.
    ///
    /// Acts as a final barrier: rank 0 returns once every rank has reached `finalize`, then
    /// waits for the spawned processes to exit as the world is dropped.
    pub fn finalize(self) -> Result<()> {
        let state = self.state();
        state.done_flags[self.rank].store(true, Ordering::SeqCst);

        if self.rank == 0 {
            debug!("Parent process waiting for children to finish");
            self.wait_for_all(|state, rank| state.done_flags[rank].load(Ordering::SeqCst))?;
        }

        debug!("Process {} finished", self.rank);
        Ok(())
    }
}

impl Communicator for World {
    fn context(&self) -> Context {
        Context::new(self.rank, self.size)
    }

    fn barrier(&self) -> Result<()> {
        debug!("Rank {} entering barrier", self.rank);

        // Everyone reports to root, then root releases everyone.
        if self.rank == 0 {
            for rank in 1..self.size {
                self.recv::<()>(rank, BARRIER_ARRIVE_TAG)?;
            }
            for rank in 1..self.size {
                self.send(&(), rank, BARRIER_COMPLETE_TAG)?;
            }
        } else {
            self.send(&(), 0, BARRIER_ARRIVE_TAG)?;
            self.recv::<()>(0, BARRIER_COMPLETE_TAG)?;
        }

        debug!("Rank {} exiting barrier", self.rank);
        Ok(())
    }

    fn all_reduce_sum(&self, local: u64) -> Result<u64> {
        debug!("Rank {} contributing {} to all-reduce", self.rank, local);

        let total = if self.rank == 0 {
            let mut total = local;
            for rank in 1..self.size {
                total = total.wrapping_add(self.recv::<u64>(rank, REDUCE_TAG)?);
            }
            total
        } else {
            self.send(&local, 0, REDUCE_TAG)?;
            0
        };

        self.broadcast(&total, 0)
    }

    fn abort(&self, code: i32) -> RuntimeError {
        let code = self.signal_abort(code);
        error!("Rank {} aborting world with code {}", self.rank, code);
        RuntimeError::Aborted(code)
    }
}

impl Drop for World {
    fn drop(&mut self) {
        for child in &mut self.children {
            match child.wait() {
                Ok(status) => debug!("Child {} exited with {}", child.id(), status),
                Err(e) => error!("Could not wait for child {}: {}", child.id(), e),
            }
        }
    }
}
