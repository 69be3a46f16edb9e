//! The partitioned stream coordinator.
//!
//! A [`Coordinator`] drives one job: it binds a transport through a
//! [`Session`], prepares the computation payload once, sends to every used
//! partition and reacts to the transport's callbacks. Whatever happens, the
//! job produces exactly one completion, delivered through the work queue.
//!
//! Per-partition state lives in a [`StateTable`] of one-shot flags. The only
//! lock on the hot path is the per-partition cancel lock, held while a
//! transport cancel is issued or an inbound cancel is recorded.

mod builder;
mod completion;
#[cfg(test)]
mod tests;

pub use builder::*;
pub use completion::{CompletionSignal, FinishNotifier};

use crate::{
    BindRequest, Codec, Demux, DiagnosticsContext, DiagnosticsSink, Error, ErrorCode,
    InboundMessage, InitHandshake, InputChannel, OutboundMessage, OutputChannel, PartId,
    PartitionSet, Payload, RandSource, RemoteErrorCode, Result, RunParams, Session, StateTable,
    StreamHandle, StreamHandler, SubgraphDef, WorkQueue,
};
use completion::{InflightOps, NotifyFinishJob};
use core::time::Duration;
use parking_lot::{Mutex, RwLock};
use portable_atomic::{AtomicBool, Ordering};
use prost::Message as _;
use std::{
    sync::{Arc, OnceLock, Weak},
    time::Instant,
};

#[derive(Debug)]
struct Settings {
    local_biz: String,
    local_part: PartId,
    codec: Codec,
    timeout: Option<Duration>,
    async_io: bool,
    params: RunParams,
    baggage: Vec<(String, String)>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_biz: String::new(),
            local_part: 0,
            codec: Codec::Zstd,
            timeout: None,
            async_io: false,
            params: RunParams::default(),
            baggage: Vec::new(),
        }
    }
}

/// Everything fixed by a successful bind.
#[derive(Debug)]
struct Binding {
    remote_biz: String,
    trace_id: Option<String>,
    partitions: PartitionSet,
    states: StateTable,
}

pub struct Coordinator {
    this: Weak<Self>,
    settings: Settings,
    deadline: Option<Instant>,
    graph_id: u32,
    descriptor: Mutex<SubgraphDef>,
    queue: Arc<dyn WorkQueue>,
    session: Option<Arc<dyn Session>>,
    inputs: Vec<Arc<dyn InputChannel>>,
    outputs: Vec<Arc<dyn OutputChannel>>,
    demux: Option<Arc<dyn Demux>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    notifier: Option<Arc<dyn FinishNotifier>>,
    rand: Arc<dyn RandSource>,
    binding: OnceLock<Binding>,
    stream: RwLock<Option<StreamHandle>>,
    payload: OnceLock<Payload>,
    // Completion latch: set once, by whoever raises the completion.
    result: OnceLock<ErrorCode>,
    ops: InflightOps,
    terminated: AtomicBool,
}

impl Coordinator {
    pub fn builder(descriptor: SubgraphDef, queue: Arc<dyn WorkQueue>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(descriptor, queue)
    }

    /// Binds a transport through the session.
    ///
    /// # Errors
    ///
    /// Setup failures ([`Error::NoSession`], [`Error::Bind`],
    /// [`Error::InvalidPartition`]) are returned and also raised as the job's
    /// completion. [`Error::AlreadyBound`] is only returned.
    pub fn pre_init(&self) -> Result<()> {
        if self.binding.get().is_some() {
            return Err(Error::AlreadyBound);
        }

        let request = self.bind_request();
        let Some(session) = &self.session else {
            return Err(self.fail_setup(Error::NoSession {
                biz: request.biz_name,
            }));
        };

        let handler: Weak<dyn StreamHandler> = self.this.clone();
        let transport = session
            .bind(&request, handler)
            .map_err(|e| self.fail_setup(e.into()))?;
        // From here on the transport is only released through the queue.
        let stream = StreamHandle::new(transport, Arc::clone(&self.queue));

        let partitions = PartitionSet::new(stream.part_count(), &request.part_ids)
            .map_err(|e| self.fail_setup(e))?;
        let binding = Binding {
            states: StateTable::new(partitions.full_part_count()),
            partitions,
            trace_id: session.trace_id(),
            remote_biz: request.biz_name,
        };

        tracing::info!(
            biz = %binding.remote_biz,
            trace_id = binding.trace_id.as_deref().unwrap_or("-"),
            "Stream bound ({})",
            binding.partitions
        );
        self.binding
            .set(binding)
            .map_err(|_binding| Error::AlreadyBound)?;
        *self.stream.write() = Some(stream);
        Ok(())
    }

    fn bind_request(&self) -> BindRequest {
        let descriptor = self.descriptor.lock();
        let location = descriptor.location.clone().unwrap_or_default();
        BindRequest {
            biz_name: location.biz_name,
            part_ids: descriptor.part_ids().to_vec(),
            tags: location.tags,
            enable_probe: location.enable_probe,
            timeout: self.remaining(),
            async_io: self.settings.async_io,
        }
    }

    /// Writes the final partition count into the descriptor, serializes it
    /// and compresses it. Runs once; later calls are no-ops.
    ///
    /// # Errors
    ///
    /// [`Error::NotBound`] before [`pre_init`](Self::pre_init).
    /// [`Error::EmptyPayload`] is also raised as the job's completion.
    pub fn post_init(&self) -> Result<()> {
        let binding = self.binding.get().ok_or(Error::NotBound)?;
        if self.payload.get().is_some() {
            return Ok(());
        }

        let part_count = binding.partitions.full_part_count();
        let raw = {
            let mut descriptor = self.descriptor.lock();
            let part_info = descriptor.part_info_mut();
            if let Some(preset) = part_info.part_count.filter(|&preset| preset != part_count) {
                tracing::warn!(preset, part_count, "Overriding preset part count");
            }
            part_info.part_count = Some(part_count);
            descriptor.encode_to_vec()
        };

        let payload = Payload::prepare(raw, self.settings.codec).map_err(|e| self.fail_setup(e))?;
        tracing::debug!(
            codec = %payload.codec(),
            "Prepared {}B payload for {part_count} partitions",
            payload.len()
        );
        // A concurrent `post_init` produced the same bytes.
        let _ = self.payload.set(payload);
        Ok(())
    }

    /// [`pre_init`](Self::pre_init) followed by
    /// [`post_init`](Self::post_init).
    pub fn init(&self) -> Result<()> {
        self.pre_init()?;
        self.post_init()
    }

    /// Sends to every used partition in iteration order, which initializes
    /// partitions that have not been contacted yet.
    pub fn run(&self) {
        if self.finished() || self.is_terminated() {
            tracing::debug!("Job already finished, not running");
            return;
        }
        let Some(binding) = self.binding.get() else {
            tracing::warn!("Run before the stream was bound");
            return;
        };
        for part_id in &binding.partitions {
            // A fatal send error stops the loop.
            if self.finished() {
                break;
            }
            if let Err(e) = self.do_send(part_id, OutboundMessage::empty()) {
                tracing::debug!(part_id, "Send during run failed: {e}");
            }
        }
    }

    /// Sends `message` to one partition.
    ///
    /// The first send to a partition carries the init handshake. Once every
    /// input channel reports eof for the partition, the send also closes the
    /// partition's outbound side.
    ///
    /// # Errors
    ///
    /// - [`Error::NotBound`] / [`Error::NotPrepared`] before init.
    /// - [`Error::UnknownPartition`] if `part_id` is not used by this job.
    /// - [`Error::SendAfterEof`] or [`Error::State`] on a send after outbound
    ///   eof; the job completes with [`ErrorCode::StreamSend`].
    /// - [`Error::Transport`] if the transport refused the message; the
    ///   partition is finished and the job carries on.
    ///
    /// A data send after outbound eof fails even when the partition or the job
    /// has since finished. Otherwise sends to a finished partition are dropped.
    ///
    /// Sends to one partition must not race each other: the first send carries
    /// the handshake, and a concurrent send may reach the transport ahead of
    /// it. The dispatch loop and the input channels feeding a partition send
    /// from one task.
    pub fn do_send(&self, part_id: PartId, mut message: OutboundMessage) -> Result<()> {
        let binding = self.binding.get().ok_or(Error::NotBound)?;
        let payload = self.payload.get().ok_or(Error::NotPrepared)?;
        if !binding.partitions.is_used(part_id) {
            return Err(Error::UnknownPartition { part_id });
        }
        let states = &binding.states;
        if states.inited(part_id) && !message.has_data() {
            return Ok(());
        }
        if states.outbound_closed(part_id) {
            return Err(self.fail_send(Error::SendAfterEof { part_id }));
        }
        if self.finished()
            || self.is_terminated()
            || states.abandoned(part_id)
            || states.forced_eof(part_id)
        {
            tracing::trace!(part_id, "Dropping send on finished partition or job");
            return Ok(());
        }

        if states.set_inited(part_id) {
            message.init = Some(self.handshake(binding, payload, part_id));
        } else if !message.has_data() {
            return Ok(());
        }

        let Some(stream) = self.stream() else {
            tracing::trace!(part_id, "No stream, dropping send");
            return Ok(());
        };

        let eof = self.inputs.iter().all(|input| input.eof(part_id));
        if eof {
            states
                .set_outbound_closed(part_id)
                .map_err(|e| self.fail_send(e.into()))?;
        }

        message.msg_id = self.rand.rand();
        let msg_id = message.msg_id;
        tracing::trace!(part_id, msg_id, eof, "Sending {}B", message.byte_len());
        if !stream.send(part_id, eof, message) {
            tracing::warn!(part_id, msg_id, "Transport refused message");
            self.on_send_failure(part_id);
            return Err(Error::Transport { part_id });
        }
        Ok(())
    }

    fn handshake(&self, binding: &Binding, payload: &Payload, part_id: PartId) -> InitHandshake {
        InitHandshake {
            payload: payload.bytes().clone(),
            codec: payload.codec(),
            part_id,
            part_count: binding.partitions.full_part_count(),
            graph_id: self.graph_id,
            remaining_ms: self
                .remaining()
                .map(|left| u64::try_from(left.as_millis()).unwrap_or(u64::MAX)),
            params: self.settings.params.clone(),
            diagnostics: DiagnosticsContext {
                trace_id: binding.trace_id.clone(),
                baggage: self.settings.baggage.clone(),
            },
        }
    }

    /// A partition-local send failure. The partition is finished; the job's
    /// completion code is unaffected.
    pub fn on_send_failure(&self, part_id: PartId) -> bool {
        if self.checked(part_id).is_none() {
            return false;
        }
        tracing::warn!(part_id, "Send failure, finishing partition");
        self.finish_part(part_id);
        true
    }

    /// Handles a regular inbound message.
    pub fn receive(&self, message: InboundMessage) -> bool {
        let part_id = message.part_id;
        let Some(binding) = self.checked(part_id) else {
            return false;
        };
        tracing::trace!(part_id, msg_id = message.msg_id, eof = message.eof, "Received");

        if message.eof {
            binding.states.set_inbound_closed(part_id);
            self.collect_diagnostics(binding, part_id);
        }
        if let Err(e) = self.demux(&message) {
            tracing::error!(part_id, "Demux failed: {e}");
            self.notify_finish_async(ErrorCode::StreamReceive);
            return false;
        }
        self.receive_call_back(binding, part_id, false);
        true
    }

    /// Handles a cancel raised by the remote side or the transport. Repeated
    /// cancels for the same partition are ignored.
    pub fn receive_cancel(&self, message: InboundMessage, code: RemoteErrorCode) -> bool {
        let part_id = message.part_id;
        let Some(binding) = self.checked(part_id) else {
            return false;
        };

        let already_cancelled = {
            let _guard = binding.states.lock(part_id);
            let cancelled = binding.states.cancelled(part_id);
            binding.states.receive_cancel(part_id);
            cancelled
        };
        if already_cancelled {
            tracing::debug!(part_id, %code, "Duplicate cancel ignored");
            return true;
        }

        tracing::warn!(part_id, %code, "Partition cancelled");
        self.collect_diagnostics(binding, part_id);
        if message.payload.is_some() {
            if let Err(e) = self.demux(&message) {
                tracing::error!(part_id, "Demux of cancel payload failed: {e}");
                self.notify_finish_async(ErrorCode::StreamRpc);
                return false;
            }
        }
        self.receive_call_back(binding, part_id, false);
        true
    }

    fn demux(&self, message: &InboundMessage) -> core::result::Result<(), crate::DemuxError> {
        match &self.demux {
            Some(demux) => demux.demux(message),
            None => Ok(()),
        }
    }

    /// Propagates early termination downstream, then raises the completion
    /// once every used partition is closed.
    fn receive_call_back(&self, binding: &Binding, part_id: PartId, force_stop: bool) {
        let states = &binding.states;
        if !states.inbound_closed(part_id)
            && (force_stop || states.cancelled(part_id))
            && states.set_forced_eof(part_id)
        {
            tracing::debug!(part_id, force_stop, "Forcing eof downstream");
            for output in &self.outputs {
                output.set_eof(part_id);
            }
        }
        self.check_complete(binding);
    }

    fn check_complete(&self, binding: &Binding) {
        let states = &binding.states;
        if binding.partitions.iter().all(|part_id| states.closed(part_id)) {
            self.notify_finish_async(ErrorCode::None);
        }
    }

    /// Brings one partition to its terminal state.
    ///
    /// A partition that was never initialized only gets a best-effort
    /// transport cancel and is marked abandoned. Otherwise the cancel is
    /// issued under the partition's lock, diagnostics are collected and
    /// downstream is told the partition is done.
    pub fn finish_part(&self, part_id: PartId) {
        let Some(binding) = self.checked(part_id) else {
            return;
        };
        let stream = self.stream();

        if !binding.states.inited(part_id) {
            if let Some(stream) = &stream {
                stream.send_cancel(part_id);
            }
            if binding.states.set_abandoned(part_id) {
                tracing::debug!(part_id, "Abandoned uninitialized partition");
            }
            self.check_complete(binding);
            return;
        }

        {
            let _guard = binding.states.lock(part_id);
            if let Some(stream) = &stream {
                stream.send_cancel(part_id);
            }
        }
        self.collect_diagnostics(binding, part_id);
        self.receive_call_back(binding, part_id, true);
    }

    /// Finishes every used partition.
    pub fn try_cancel(&self) {
        let Some(binding) = self.binding.get() else {
            return;
        };
        tracing::debug!("Cancelling {} partitions", binding.partitions.len());
        for part_id in &binding.partitions {
            self.finish_part(part_id);
        }
    }

    /// Cancels the job and releases the coordinator's hold on the stream.
    /// Later sends are dropped.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.try_cancel();
        let released = self.stream.write().take();
        tracing::debug!(
            holders = released.as_ref().map_or(0, StreamHandle::holders),
            "Coordinator terminated"
        );
    }

    fn collect_diagnostics(&self, binding: &Binding, part_id: PartId) {
        if !binding.states.inited(part_id) || !binding.states.set_collected(part_id) {
            return;
        }
        let (Some(sink), Some(stream)) = (&self.diagnostics, self.stream()) else {
            return;
        };
        let local = format!("{}({})", self.settings.local_biz, self.settings.local_part);
        sink.append_rpc_info((local, binding.remote_biz.clone()), stream.rpc_info(part_id));
    }

    /// Latches `code` and queues the completion job. Only the first call per
    /// job has any effect.
    fn notify_finish_async(&self, code: ErrorCode) {
        if self.result.set(code).is_err() {
            tracing::trace!(%code, "Completion already raised");
            return;
        }
        let Some(this) = self.this.upgrade() else {
            tracing::error!(%code, "Coordinator dropped before completion");
            return;
        };
        tracing::debug!(%code, "Job finished, queueing completion");
        self.queue.push(Box::new(NotifyFinishJob::new(this, code)));
    }

    /// Runs on the work queue.
    fn notify_finish(&self, code: ErrorCode) {
        if !code.is_ok() {
            self.try_cancel();
        }
        tracing::info!(%code, "Job complete");
        if let Some(notifier) = &self.notifier {
            notifier.finish(code);
        }
    }

    fn fail_setup(&self, error: Error) -> Error {
        tracing::error!("Setup failed: {error}");
        self.notify_finish_async(ErrorCode::Setup);
        error
    }

    fn fail_send(&self, error: Error) -> Error {
        tracing::error!("Protocol violation: {error}");
        if let Some(code) = error.code() {
            self.notify_finish_async(code);
        }
        error
    }

    /// The binding, if `part_id` is used by it.
    fn checked(&self, part_id: PartId) -> Option<&Binding> {
        let binding = self.binding.get()?;
        if binding.partitions.is_used(part_id) {
            Some(binding)
        } else {
            tracing::warn!(part_id, "Callback for unused partition rejected");
            None
        }
    }

    fn stream(&self) -> Option<StreamHandle> {
        self.stream.read().clone()
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Whether the completion has been raised.
    pub fn finished(&self) -> bool {
        self.result.get().is_some()
    }

    /// The completion code, once raised.
    pub fn result(&self) -> Option<ErrorCode> {
        self.result.get().copied()
    }

    /// Completion jobs queued or running for this coordinator.
    pub fn pending_async_ops(&self) -> usize {
        self.ops.count()
    }

    pub fn partitions(&self) -> Option<&PartitionSet> {
        self.binding.get().map(|binding| &binding.partitions)
    }

    pub fn states(&self) -> Option<&StateTable> {
        self.binding.get().map(|binding| &binding.states)
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.get()
    }
}

impl StreamHandler for Coordinator {
    fn receive(&self, message: InboundMessage) -> bool {
        Coordinator::receive(self, message)
    }

    fn receive_cancel(&self, message: InboundMessage, code: RemoteErrorCode) -> bool {
        Coordinator::receive_cancel(self, message, code)
    }

    fn on_send_failure(&self, part_id: PartId) -> bool {
        Coordinator::on_send_failure(self, part_id)
    }
}

impl core::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Coordinator")
            .field("graph_id", &self.graph_id)
            .field("binding", &self.binding.get())
            .field("result", &self.result())
            .field("pending_async_ops", &self.pending_async_ops())
            .finish_non_exhaustive()
    }
}
