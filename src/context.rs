//! The per-operation context: a resumable state machine.
//!
//! A context drives one in-kernel operation through one or more wire
//! exchanges. Each per-opcode machine has explicit resume labels: the engine
//! resumes it once with an output buffer (it fills a request and suspends)
//! and once with the matching response (it either completes or advances to
//! its next exchange). There is no scheduler: the transact loop drives
//! every step, and a context is only ever resumed by one thread at a time.
//!
//! Contexts come in two flavors: host-admitted (they carry an
//! `InternalRequest` and end by assembling an `InternalResponse`) and
//! self-generated (`INIT` and the forget family, which absorb all failures
//! locally).

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{CacheItem, ForgetQueue};
use crate::fsext::{
    AccessMask, InternalRequest, InternalResponse, RequestOp, attr_to_file_info,
};
use crate::file::FileObject;
use crate::instance::Instance;
use crate::proto::{
    self, AttrOut, BATCH_FORGET_MINOR_VERSION, CREATE_IN_SIZE, EntryOut, FuseAttr, InitOut, Opcode,
    OpenOut, Origin, REQ_HEADER_SIZE, REQ_SIZEMIN, RSP_HEADER_SIZE, ResponseHeader, codec,
};
use crate::status::{Status, status_from_errno};

/// Outcome of one resume step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The context needs another scheduling cycle: it either just emitted a
    /// request and awaits its response, or wants a fresh output buffer.
    Continue,
    /// The context finished its work for this cycle.
    Done,
}

#[derive(Debug)]
enum InitState {
    Send,
    Await,
}

#[derive(Debug)]
enum SingleShotState {
    Send,
    Await,
}

#[derive(Debug, Clone, Copy)]
enum OpenState {
    Probe,
    AwaitLookup,
    SendOpen,
    AwaitOpen,
}

#[derive(Debug, Clone, Copy)]
enum CreateState {
    SendCreate,
    AwaitCreate,
    SendMknod,
    AwaitMknod,
    SendOpen,
    AwaitOpen,
}

#[derive(Debug)]
struct OpenMachine {
    state: OpenState,
    ino: u64,
    attr: FuseAttr,
    is_dir: bool,
    // Pinning the cache item keeps it alive across suspensions even if the
    // expiration sweep detaches it meanwhile.
    pinned: Option<Arc<CacheItem>>,
}

#[derive(Debug)]
struct CreateMachine {
    state: CreateState,
    ino: u64,
    attr: FuseAttr,
    pinned: Option<Arc<CacheItem>>,
}

#[derive(Debug)]
enum OpMachine {
    Init(InitState),
    Forget { queue: ForgetQueue },
    Lookup(SingleShotState),
    GetAttr(SingleShotState),
    Open(OpenMachine),
    Create(CreateMachine),
}

/// The per-operation state machine. See the module docs.
#[derive(Debug)]
pub struct Context {
    unique: u64,
    op: OpMachine,
    internal_request: Option<InternalRequest>,
    internal_response: InternalResponse,
}

impl Context {
    /// A self-generated handshake context.
    #[must_use]
    pub fn new_init(unique: u64) -> Box<Context> {
        Box::new(Context {
            unique,
            op: OpMachine::Init(InitState::Send),
            internal_request: None,
            internal_response: InternalResponse {
                kind: None,
                hint: u64::from(Opcode::Init as u32),
                status: Status::Success,
                file_info: None,
                file_id: None,
            },
        })
    }

    /// A self-generated forget context draining `queue`.
    #[must_use]
    pub fn new_forget(unique: u64, queue: ForgetQueue) -> Box<Context> {
        Box::new(Context {
            unique,
            op: OpMachine::Forget { queue },
            internal_request: None,
            internal_response: InternalResponse {
                kind: None,
                hint: u64::from(Opcode::Forget as u32),
                status: Status::Success,
                file_info: None,
                file_id: None,
            },
        })
    }

    /// Bind a context to a host-admitted request.
    ///
    /// # Errors
    ///
    /// Requests that can never be encoded (a name that does not fit a
    /// minimum-size request) fail here, handing the request back so the
    /// engine can synthesize the early-failure response.
    pub fn from_request(
        unique: u64,
        request: InternalRequest,
    ) -> Result<Box<Context>, (Status, InternalRequest)> {
        let overhead = match &request.op {
            RequestOp::Lookup { name, .. } | RequestOp::Open { name, .. } => {
                Some((REQ_HEADER_SIZE, name.len()))
            }
            RequestOp::Create { name, .. } => Some((REQ_HEADER_SIZE + CREATE_IN_SIZE, name.len())),
            RequestOp::GetAttr { .. } => None,
        };
        if let Some((fixed, name_len)) = overhead
            && fixed + name_len + 1 > REQ_SIZEMIN
        {
            return Err((Status::ObjectNameInvalid, request));
        }

        let op = match &request.op {
            RequestOp::Lookup { .. } => OpMachine::Lookup(SingleShotState::Send),
            RequestOp::GetAttr { .. } => OpMachine::GetAttr(SingleShotState::Send),
            RequestOp::Open { .. } => OpMachine::Open(OpenMachine {
                state: OpenState::Probe,
                ino: 0,
                attr: FuseAttr::default(),
                is_dir: false,
                pinned: None,
            }),
            RequestOp::Create { .. } => OpMachine::Create(CreateMachine {
                state: CreateState::SendCreate,
                ino: 0,
                attr: FuseAttr::default(),
                pinned: None,
            }),
        };
        let internal_response = InternalResponse {
            kind: Some(request.op.kind()),
            hint: request.hint,
            status: Status::Success,
            file_info: None,
            file_id: None,
        };
        Ok(Box::new(Context {
            unique,
            op,
            internal_request: Some(request),
            internal_response,
        }))
    }

    /// The context's correlation ID.
    #[must_use]
    pub fn unique(&self) -> u64 {
        self.unique
    }

    /// Whether this context was admitted from the host framework.
    #[must_use]
    pub fn has_internal_request(&self) -> bool {
        self.internal_request.is_some()
    }

    /// Whether this is a forget context with inodes left to drain.
    #[must_use]
    pub fn forget_backlog(&self) -> bool {
        matches!(&self.op, OpMachine::Forget { queue } if !queue.is_empty())
    }

    /// Move the assembled internal response out for forwarding.
    #[must_use]
    pub fn take_internal_response(&mut self) -> InternalResponse {
        let hint = self.internal_response.hint;
        let kind = self.internal_response.kind;
        std::mem::replace(
            &mut self.internal_response,
            InternalResponse {
                kind,
                hint,
                status: Status::Success,
                file_info: None,
                file_id: None,
            },
        )
    }

    /// Resume the state machine with at most one of: a response to consume,
    /// an output buffer to fill.
    pub fn process(
        &mut self,
        instance: &Instance,
        response: Option<&[u8]>,
        request: Option<&mut [u8]>,
    ) -> Flow {
        let Context {
            unique,
            op,
            internal_request,
            internal_response,
        } = self;
        let unique = *unique;
        let request_fields = internal_request.as_ref();
        match op {
            OpMachine::Init(state) => drive_init(state, unique, instance, response, request),
            OpMachine::Forget { queue } => drive_forget(queue, unique, instance, request),
            OpMachine::Lookup(state) => drive_lookup(
                state,
                unique,
                instance,
                request_fields,
                internal_response,
                response,
                request,
            ),
            OpMachine::GetAttr(state) => drive_getattr(
                state,
                unique,
                instance,
                request_fields,
                internal_response,
                response,
                request,
            ),
            OpMachine::Open(machine) => drive_open(
                machine,
                unique,
                instance,
                request_fields,
                internal_response,
                response,
                request,
            ),
            OpMachine::Create(machine) => drive_create(
                machine,
                unique,
                instance,
                request_fields,
                internal_response,
                response,
                request,
            ),
        }
    }
}

fn response_header(response: &[u8]) -> ResponseHeader {
    // The engine validated the length before resuming us.
    ResponseHeader::parse(response).unwrap_or(ResponseHeader {
        len: RSP_HEADER_SIZE as u32,
        error: -libc::EIO,
        unique: 0,
    })
}

fn payload(response: &[u8]) -> &[u8] {
    &response[RSP_HEADER_SIZE.min(response.len())..]
}

fn origin_of(request: Option<&InternalRequest>) -> Origin {
    request.map_or_else(Origin::default, |r| r.origin)
}

/// Open flags for the rights the host granted: read-only unless write data
/// was granted, read-write when both were.
fn open_flags_for(access: AccessMask) -> u32 {
    match (
        access.contains(AccessMask::READ_DATA),
        access.contains(AccessMask::WRITE_DATA),
    ) {
        (_, false) => libc::O_RDONLY as u32,
        (false, true) => libc::O_WRONLY as u32,
        (true, true) => libc::O_RDWR as u32,
    }
}

fn drive_init(
    state: &mut InitState,
    unique: u64,
    instance: &Instance,
    response: Option<&[u8]>,
    request: Option<&mut [u8]>,
) -> Flow {
    match state {
        InitState::Send => {
            let Some(buf) = request else {
                return Flow::Done;
            };
            codec::fill_init(buf, unique);
            *state = InitState::Await;
            Flow::Continue
        }
        InitState::Await => {
            let Some(rsp) = response else {
                return Flow::Done;
            };
            let header = response_header(rsp);
            if header.error != 0 {
                warn!(error = header.error, "daemon failed the handshake");
                instance.poison_init();
                return Flow::Done;
            }
            match InitOut::parse(payload(rsp)) {
                Some(init) if init.major == proto::KERNEL_VERSION => {
                    debug!(major = init.major, minor = init.minor, "handshake complete");
                    instance.complete_init(init.major, init.minor.min(proto::KERNEL_MINOR_VERSION));
                }
                Some(init) => {
                    warn!(
                        daemon_major = init.major,
                        ours = proto::KERNEL_VERSION,
                        "protocol version mismatch"
                    );
                    instance.poison_init();
                }
                None => {
                    warn!("short handshake response");
                    instance.poison_init();
                }
            }
            Flow::Done
        }
    }
}

fn drive_forget(
    queue: &mut ForgetQueue,
    unique: u64,
    instance: &Instance,
    request: Option<&mut [u8]>,
) -> Flow {
    // Forgets get no reply: fill one message and finish the cycle. The
    // engine re-posts us while the queue still has entries.
    let Some(buf) = request else {
        return Flow::Done;
    };
    if instance.version_minor() >= BATCH_FORGET_MINOR_VERSION {
        let (_, count) = codec::fill_batch_forget(buf, unique, || queue.next_ino());
        debug!(count, remaining = queue.len(), "batch forget");
    } else if let Some(ino) = queue.next_ino() {
        codec::fill_forget(buf, unique, ino);
        debug!(ino, remaining = queue.len(), "forget");
    }
    Flow::Done
}

fn drive_lookup(
    state: &mut SingleShotState,
    unique: u64,
    instance: &Instance,
    request: Option<&InternalRequest>,
    internal_response: &mut InternalResponse,
    response: Option<&[u8]>,
    out: Option<&mut [u8]>,
) -> Flow {
    let Some(RequestOp::Lookup { parent, name }) = request.map(|r| &r.op) else {
        internal_response.status = Status::InvalidParameter;
        return Flow::Done;
    };
    match state {
        SingleShotState::Send => {
            let Some(buf) = out else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            codec::fill_lookup(buf, unique, *parent, name, origin_of(request));
            *state = SingleShotState::Await;
            Flow::Continue
        }
        SingleShotState::Await => {
            let Some(rsp) = response else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            let header = response_header(rsp);
            if header.error != 0 {
                internal_response.status = status_from_errno(header.error);
                return Flow::Done;
            }
            match EntryOut::parse(payload(rsp)) {
                // A zero nodeid is a negative entry: the daemon answered,
                // but the name does not exist.
                Some(entry) if entry.nodeid == 0 => {
                    internal_response.status = Status::ObjectNameNotFound;
                }
                Some(entry) => {
                    instance.cache().insert(*parent, name, &entry);
                    internal_response.status = Status::Success;
                    internal_response.file_info =
                        Some(attr_to_file_info(&entry.attr, instance.volume_params()));
                }
                None => internal_response.status = Status::IoDeviceError,
            }
            Flow::Done
        }
    }
}

fn drive_getattr(
    state: &mut SingleShotState,
    unique: u64,
    instance: &Instance,
    request: Option<&InternalRequest>,
    internal_response: &mut InternalResponse,
    response: Option<&[u8]>,
    out: Option<&mut [u8]>,
) -> Flow {
    let Some(RequestOp::GetAttr { ino }) = request.map(|r| &r.op) else {
        internal_response.status = Status::InvalidParameter;
        return Flow::Done;
    };
    match state {
        SingleShotState::Send => {
            let Some(buf) = out else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            codec::fill_getattr(buf, unique, *ino, origin_of(request));
            *state = SingleShotState::Await;
            Flow::Continue
        }
        SingleShotState::Await => {
            let Some(rsp) = response else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            let header = response_header(rsp);
            if header.error != 0 {
                internal_response.status = status_from_errno(header.error);
                return Flow::Done;
            }
            match AttrOut::parse(payload(rsp)) {
                Some(attr_out) => {
                    internal_response.status = Status::Success;
                    internal_response.file_info =
                        Some(attr_to_file_info(&attr_out.attr, instance.volume_params()));
                }
                None => internal_response.status = Status::IoDeviceError,
            }
            Flow::Done
        }
    }
}

fn is_dir_mode(mode: u32) -> bool {
    mode & (libc::S_IFMT as u32) == libc::S_IFDIR as u32
}

#[allow(clippy::too_many_arguments)]
fn drive_open(
    machine: &mut OpenMachine,
    unique: u64,
    instance: &Instance,
    request: Option<&InternalRequest>,
    internal_response: &mut InternalResponse,
    response: Option<&[u8]>,
    out: Option<&mut [u8]>,
) -> Flow {
    let Some(RequestOp::Open {
        parent,
        name,
        granted_access,
    }) = request.map(|r| &r.op)
    else {
        internal_response.status = Status::InvalidParameter;
        return Flow::Done;
    };
    let origin = origin_of(request);
    match machine.state {
        OpenState::Probe => {
            let Some(buf) = out else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            // A fresh cache hit resolves the name without a round trip.
            if let Some(item) = instance.cache().lookup(*parent, name) {
                machine.ino = item.ino();
                machine.attr = *item.attr();
                machine.is_dir = is_dir_mode(item.attr().mode);
                machine.pinned = Some(item);
                emit_open(buf, unique, machine, *granted_access, origin);
                machine.state = OpenState::AwaitOpen;
            } else {
                codec::fill_lookup(buf, unique, *parent, name, origin);
                machine.state = OpenState::AwaitLookup;
            }
            Flow::Continue
        }
        OpenState::AwaitLookup => {
            let Some(rsp) = response else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            let header = response_header(rsp);
            if header.error != 0 {
                internal_response.status = status_from_errno(header.error);
                return Flow::Done;
            }
            match EntryOut::parse(payload(rsp)) {
                Some(entry) if entry.nodeid == 0 => {
                    internal_response.status = Status::ObjectNameNotFound;
                    Flow::Done
                }
                Some(entry) => {
                    machine.pinned = Some(instance.cache().insert(*parent, name, &entry));
                    machine.ino = entry.nodeid;
                    machine.attr = entry.attr;
                    machine.is_dir = is_dir_mode(entry.attr.mode);
                    machine.state = OpenState::SendOpen;
                    Flow::Continue
                }
                None => {
                    internal_response.status = Status::IoDeviceError;
                    Flow::Done
                }
            }
        }
        OpenState::SendOpen => {
            let Some(buf) = out else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            emit_open(buf, unique, machine, *granted_access, origin);
            machine.state = OpenState::AwaitOpen;
            Flow::Continue
        }
        OpenState::AwaitOpen => {
            let Some(rsp) = response else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            let header = response_header(rsp);
            if header.error != 0 {
                internal_response.status = status_from_errno(header.error);
                return Flow::Done;
            }
            match OpenOut::parse(payload(rsp)) {
                Some(open) => {
                    let file_id = instance.file_table().open(FileObject {
                        ino: machine.ino,
                        fh: open.fh,
                        is_dir: machine.is_dir,
                        granted_access: *granted_access,
                    });
                    internal_response.status = Status::Success;
                    internal_response.file_id = Some(file_id);
                    internal_response.file_info =
                        Some(attr_to_file_info(&machine.attr, instance.volume_params()));
                }
                None => internal_response.status = Status::IoDeviceError,
            }
            Flow::Done
        }
    }
}

fn emit_open(
    buf: &mut [u8],
    unique: u64,
    machine: &OpenMachine,
    granted_access: AccessMask,
    origin: Origin,
) {
    if machine.is_dir {
        codec::fill_opendir(buf, unique, machine.ino, origin);
    } else {
        codec::fill_open(buf, unique, machine.ino, open_flags_for(granted_access), origin);
    }
}

#[allow(clippy::too_many_arguments)]
fn drive_create(
    machine: &mut CreateMachine,
    unique: u64,
    instance: &Instance,
    request: Option<&InternalRequest>,
    internal_response: &mut InternalResponse,
    response: Option<&[u8]>,
    out: Option<&mut [u8]>,
) -> Flow {
    let Some(RequestOp::Create {
        parent,
        name,
        mode,
        umask,
        granted_access,
    }) = request.map(|r| &r.op)
    else {
        internal_response.status = Status::InvalidParameter;
        return Flow::Done;
    };
    let origin = origin_of(request);
    let open_flags = open_flags_for(*granted_access);
    match machine.state {
        CreateState::SendCreate => {
            let Some(buf) = out else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            codec::fill_create(
                buf,
                unique,
                *parent,
                name,
                open_flags | libc::O_CREAT as u32,
                *mode,
                *umask,
                origin,
            );
            machine.state = CreateState::AwaitCreate;
            Flow::Continue
        }
        CreateState::AwaitCreate => {
            let Some(rsp) = response else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            let header = response_header(rsp);
            if header.error.unsigned_abs() as i32 == libc::ENOSYS {
                // Daemon predates CREATE: fall back to MKNOD + OPEN.
                debug!("daemon lacks create, falling back to mknod");
                machine.state = CreateState::SendMknod;
                return Flow::Continue;
            }
            if header.error != 0 {
                internal_response.status = status_from_errno(header.error);
                return Flow::Done;
            }
            let body = payload(rsp);
            let entry = EntryOut::parse(body);
            let open = body
                .get(proto::ENTRY_OUT_SIZE..)
                .and_then(OpenOut::parse);
            match (entry, open) {
                (Some(entry), Some(open)) if entry.nodeid != 0 => {
                    machine.pinned = Some(instance.cache().insert(*parent, name, &entry));
                    machine.ino = entry.nodeid;
                    machine.attr = entry.attr;
                    finish_open(
                        instance,
                        internal_response,
                        machine.ino,
                        &machine.attr,
                        open.fh,
                        *granted_access,
                    );
                }
                _ => internal_response.status = Status::IoDeviceError,
            }
            Flow::Done
        }
        CreateState::SendMknod => {
            let Some(buf) = out else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            codec::fill_mknod(buf, unique, *parent, name, *mode, *umask, origin);
            machine.state = CreateState::AwaitMknod;
            Flow::Continue
        }
        CreateState::AwaitMknod => {
            let Some(rsp) = response else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            let header = response_header(rsp);
            if header.error != 0 {
                internal_response.status = status_from_errno(header.error);
                return Flow::Done;
            }
            match EntryOut::parse(payload(rsp)) {
                Some(entry) if entry.nodeid != 0 => {
                    machine.pinned = Some(instance.cache().insert(*parent, name, &entry));
                    machine.ino = entry.nodeid;
                    machine.attr = entry.attr;
                    machine.state = CreateState::SendOpen;
                    Flow::Continue
                }
                _ => {
                    internal_response.status = Status::IoDeviceError;
                    Flow::Done
                }
            }
        }
        CreateState::SendOpen => {
            let Some(buf) = out else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            codec::fill_open(buf, unique, machine.ino, open_flags, origin);
            machine.state = CreateState::AwaitOpen;
            Flow::Continue
        }
        CreateState::AwaitOpen => {
            let Some(rsp) = response else {
                internal_response.status = Status::IoDeviceError;
                return Flow::Done;
            };
            let header = response_header(rsp);
            if header.error != 0 {
                internal_response.status = status_from_errno(header.error);
                return Flow::Done;
            }
            match OpenOut::parse(payload(rsp)) {
                Some(open) => finish_open(
                    instance,
                    internal_response,
                    machine.ino,
                    &machine.attr,
                    open.fh,
                    *granted_access,
                ),
                None => internal_response.status = Status::IoDeviceError,
            }
            Flow::Done
        }
    }
}

fn finish_open(
    instance: &Instance,
    internal_response: &mut InternalResponse,
    ino: u64,
    attr: &FuseAttr,
    fh: u64,
    granted_access: AccessMask,
) {
    let file_id = instance.file_table().open(FileObject {
        ino,
        fh,
        is_dir: is_dir_mode(attr.mode),
        granted_access,
    });
    internal_response.status = Status::Success;
    internal_response.file_id = Some(file_id);
    internal_response.file_info = Some(attr_to_file_info(attr, instance.volume_params()));
}
