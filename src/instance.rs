//! Per-volume instance lifecycle and the provider record.
//!
//! One [`Instance`] exists per mounted volume. The host framework drives it
//! through the four provider entry points: init, fini, the expiration
//! routine, and transact (defined in [`crate::engine`]).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, instrument};

use crate::cache::Cache;
use crate::context::Context;
use crate::file::FileTable;
use crate::fsext::{FUSE_FSCTL_TRANSACT, HostBridge, Transact, VolumeParams};
use crate::ioq::Ioq;
use crate::status::Status;
use crate::sync::InitEvent;

/// `version_major` value marking a failed handshake: the instance terminally
/// denies all further requests.
pub(crate) const VERSION_DENIED: u32 = u32::MAX;

/// Per-volume state. See the module docs.
pub struct Instance {
    volume_params: VolumeParams,
    host: Arc<dyn HostBridge>,
    op_guard: RwLock<()>,
    init_event: InitEvent,
    version_major: AtomicU32,
    version_minor: AtomicU32,
    // Teardown order is load-bearing and encoded in declaration order: the
    // IOQ holds contexts that pin file objects and cache items, so it must
    // go first; files may pin cache items, so the table goes before the
    // cache.
    ioq: Ioq,
    file_table: FileTable,
    cache: Cache,
}

impl Instance {
    /// Bring up an instance: normalize the volume parameters, construct the
    /// queues and caches, and post the internal `INIT` context so the first
    /// transact call emits the handshake.
    ///
    /// # Errors
    ///
    /// Construction failures propagate; nothing partially constructed
    /// survives.
    #[instrument(name = "Instance::init", skip(host, volume_params))]
    pub fn init(
        host: Arc<dyn HostBridge>,
        volume_params: &mut VolumeParams,
    ) -> Result<Instance, Status> {
        volume_params.normalize();

        let instance = Instance {
            volume_params: volume_params.clone(),
            host,
            op_guard: RwLock::new(()),
            init_event: InitEvent::new(),
            version_major: AtomicU32::new(0),
            version_minor: AtomicU32::new(0),
            ioq: Ioq::new(),
            file_table: FileTable::new(),
            cache: Cache::new(!volume_params.case_sensitive_search),
        };

        let unique = instance.ioq.allocate_unique();
        instance.ioq.post_pending(Context::new_init(unique));
        debug!(unique, "posted handshake context");

        Ok(instance)
    }

    /// Tear the instance down. Draining the IOQ first runs the release logic
    /// of every queued context (dropping pinned cache items and forget
    /// queues); the remaining fields then drop in declaration order.
    #[instrument(name = "Instance::fini", skip(self))]
    pub fn fini(self) {
        let drained = self.ioq.drain();
        debug!(contexts = drained.len(), "drained ioq at teardown");
        drop(drained);
    }

    /// Age the cache. Expired entries move to a forget queue, and a
    /// non-empty queue posts a self-generated forget context.
    #[instrument(name = "Instance::expiration", skip(self))]
    pub fn expiration_routine(&self, now: Instant) {
        #[expect(
            clippy::expect_used,
            reason = "RwLock poisoning is unrecoverable; panicking is the correct behavior"
        )]
        let _guard = self.op_guard.write().expect("poisoned");
        let forgets = self.cache.expiration_sweep(now);
        if !forgets.is_empty() {
            debug!(count = forgets.len(), "posting forget context");
            let unique = self.ioq.allocate_unique();
            self.ioq.post_pending(Context::new_forget(unique, forgets));
        }
    }

    /// The negotiated protocol versions. Major is zero before the handshake
    /// completes.
    #[must_use]
    pub fn version(&self) -> (u32, u32) {
        (
            self.version_major.load(Ordering::Acquire),
            self.version_minor.load(Ordering::Acquire),
        )
    }

    pub(crate) fn version_major(&self) -> u32 {
        self.version_major.load(Ordering::Acquire)
    }

    pub(crate) fn version_minor(&self) -> u32 {
        self.version_minor.load(Ordering::Acquire)
    }

    /// Record a successful handshake and release waiters. The major store
    /// is the release side of the acquire load a request half-step performs
    /// before deciding to wait.
    pub(crate) fn complete_init(&self, major: u32, minor: u32) {
        self.version_minor.store(minor, Ordering::Relaxed);
        self.version_major.store(major, Ordering::Release);
        self.init_event.set();
    }

    /// Record a failed handshake: all further request half-steps fail with
    /// access denied.
    pub(crate) fn poison_init(&self) {
        self.version_major.store(VERSION_DENIED, Ordering::Release);
        self.init_event.set();
    }

    /// The volume's metadata cache.
    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The volume's file-object table.
    #[must_use]
    pub fn file_table(&self) -> &FileTable {
        &self.file_table
    }

    /// The volume's I/O queue.
    #[must_use]
    pub fn ioq(&self) -> &Ioq {
        &self.ioq
    }

    /// The normalized volume parameters.
    #[must_use]
    pub fn volume_params(&self) -> &VolumeParams {
        &self.volume_params
    }

    pub(crate) fn host(&self) -> &dyn HostBridge {
        self.host.as_ref()
    }

    pub(crate) fn init_event(&self) -> &InitEvent {
        &self.init_event
    }

    pub(crate) fn op_guard(&self) -> &RwLock<()> {
        &self.op_guard
    }
}

/// The provider record the host framework consumes. Process-wide,
/// initialized once, read-only thereafter.
pub struct FsextProvider {
    /// Size/version stamp of this record.
    pub version: u32,
    /// Control code of the transact channel.
    pub device_transact_code: u32,
    /// Bytes of device extension the host must reserve.
    pub device_extension_size: usize,
    /// Bring up a volume instance.
    pub device_init: fn(Arc<dyn HostBridge>, &mut VolumeParams) -> Result<Instance, Status>,
    /// Tear a volume instance down.
    pub device_fini: fn(Instance),
    /// Periodic cache aging hook.
    pub device_expiration_routine: fn(&Instance, Instant),
    /// The transact entry point.
    pub device_transact: fn(&Instance, Transact<'_>) -> Result<usize, Status>,
}

/// The one provider record this crate exports.
pub static FSEXT_PROVIDER: FsextProvider = FsextProvider {
    version: std::mem::size_of::<FsextProvider>() as u32,
    device_transact_code: FUSE_FSCTL_TRANSACT,
    device_extension_size: std::mem::size_of::<Instance>(),
    device_init: Instance::init,
    device_fini: Instance::fini,
    device_expiration_routine: Instance::expiration_routine,
    device_transact: Instance::transact,
};
