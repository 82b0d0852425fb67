//! The transact loop: the single engine entry point.
//!
//! One daemon invocation carries at most one FUSE response in and takes at
//! most one FUSE request out, so a call performs up to two independent
//! half-steps in fixed order: consume the response (completing or advancing
//! the context it correlates with), then produce a request (resuming an
//! already-pending context, or admitting a fresh internal request from the
//! host framework).

use tracing::{instrument, trace};

use crate::context::{Context, Flow};
use crate::fsext::{
    FILE_SYSTEM_CONTROL, FUSE_FSCTL_TRANSACT, InternalResponse, Transact, USER_FS_REQUEST,
};
use crate::instance::{Instance, VERSION_DENIED};
use crate::proto::{REQ_HEADER_SIZE, REQ_SIZEMIN, RSP_HEADER_SIZE, ResponseHeader};
use crate::status::Status;

impl Instance {
    /// Run one transact exchange. Returns the length of the emitted request,
    /// or zero when none was produced.
    ///
    /// # Errors
    ///
    /// [`Status::InvalidParameter`] for a response with a bad length;
    /// [`Status::BufferTooSmall`] for an output buffer under the protocol
    /// minimum; [`Status::Cancelled`] when the pre-handshake wait is
    /// cancelled; [`Status::AccessDenied`] after a failed handshake;
    /// transport errors from the host bridge verbatim. Validation errors
    /// return before the queues are touched.
    #[instrument(
        name = "Instance::transact",
        skip(self, transact),
        fields(input_len = transact.input.len(), output_len = transact.output.len())
    )]
    #[expect(
        clippy::expect_used,
        reason = "RwLock poisoning is unrecoverable; panicking is the correct behavior"
    )]
    pub fn transact(&self, transact: Transact<'_>) -> Result<usize, Status> {
        debug_assert_eq!(transact.major_function, FILE_SYSTEM_CONTROL);
        debug_assert_eq!(transact.minor_function, USER_FS_REQUEST);
        debug_assert_eq!(transact.fs_control_code, FUSE_FSCTL_TRANSACT);
        debug_assert_eq!(transact.fs_control_code & 3, 0, "transact is buffered I/O");

        // Validate both buffers up front; nothing below this point fails on
        // parameters.
        let response = if transact.input.is_empty() {
            None
        } else {
            let header = ResponseHeader::parse(transact.input).ok_or(Status::InvalidParameter)?;
            let len = header.len as usize;
            if len < RSP_HEADER_SIZE || len > transact.input.len() {
                return Err(Status::InvalidParameter);
            }
            Some((header, &transact.input[..len]))
        };
        let want_request = !transact.output.is_empty();
        if want_request && transact.output.len() < REQ_SIZEMIN {
            return Err(Status::BufferTooSmall);
        }

        // Response half-step.
        if let Some((header, response)) = response {
            if let Some(mut context) = self.ioq().end_processing(header.unique) {
                let flow = {
                    let _guard = self.op_guard().read().expect("poisoned");
                    context.process(self, Some(response), None)
                };
                match flow {
                    // The context produced no request yet but needs another
                    // scheduling cycle.
                    Flow::Continue => self.ioq().post_pending(context),
                    Flow::Done if !context.has_internal_request() => drop(context),
                    Flow::Done => {
                        let internal_response = context.take_internal_response();
                        debug_assert!(internal_response.kind.is_some());
                        drop(context);
                        self.host().forward_response(internal_response)?;
                    }
                }
            } else {
                // Spurious or late; the daemon is allowed to be sloppy here.
                trace!(unique = header.unique, "response matches no in-flight context");
            }
        }

        // Request half-step.
        let mut information = 0usize;
        if want_request {
            transact.output[..REQ_HEADER_SIZE].fill(0);

            let context = match self.ioq().next_pending() {
                Some(context) => Some(context),
                None => self.admit_request(&transact)?,
            };

            if let Some(mut context) = context {
                let flow = {
                    let _guard = self.op_guard().read().expect("poisoned");
                    context.process(self, None, Some(&mut *transact.output))
                };
                match flow {
                    Flow::Continue => self.ioq().start_processing(context),
                    Flow::Done if !context.has_internal_request() => {
                        // Self-generated forgets drain in batches; everything
                        // else self-generated is finished.
                        if context.forget_backlog() {
                            self.ioq().post_pending(context);
                        }
                    }
                    Flow::Done => {
                        let internal_response = context.take_internal_response();
                        drop(context);
                        self.host().forward_response(internal_response)?;
                    }
                }
                information = request_len(transact.output);
            }
        }

        Ok(information)
    }

    /// Pull the next internal request from the host and bind a context to
    /// it. Blocks (cancellably) when the handshake has not completed yet.
    fn admit_request(&self, transact: &Transact<'_>) -> Result<Option<Box<Context>>, Status> {
        let mut major = self.version_major();
        if major == 0 {
            self.init_event().wait(&transact.cancel, None)?;
            major = self.version_major();
        }
        if major == VERSION_DENIED {
            return Err(Status::AccessDenied);
        }

        let Some(request) = self.host().next_request()? else {
            return Ok(None);
        };
        let unique = self.ioq().allocate_unique();
        match Context::from_request(unique, request) {
            Ok(context) => Ok(Some(context)),
            // The request can never be encoded: short-circuit to an
            // early-failure response and produce no wire request.
            Err((status, request)) => {
                let internal_response = InternalResponse::from_status(&request, status);
                drop(request);
                self.host().forward_response(internal_response)?;
                Ok(None)
            }
        }
    }
}

fn request_len(output: &[u8]) -> usize {
    output
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map_or(0, |b| u32::from_le_bytes(b) as usize)
}
