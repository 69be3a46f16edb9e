//! In-memory doubles for every collaborator of the coordinator.
//!
//! Nothing here touches the network or spawns threads. Jobs pushed to a
//! [`ManualQueue`] sit there until the test runs them, which makes the
//! "never inline on a callback thread" rule directly observable.

use crate::{
    BindError, BindRequest, Demux, DemuxError, ErrorCode, FinishNotifier,
    InboundMessage, Job, OutboundMessage, OutputChannel, PartId, RandSource, RpcInfo, Session,
    StreamHandler, Transport, WorkQueue,
};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::{
    collections::{BTreeSet, VecDeque},
    sync::{Arc, Weak},
};

/// A [`WorkQueue`] that only runs jobs when told to.
#[derive(Default)]
pub struct ManualQueue {
    jobs: Mutex<VecDeque<Box<dyn Job>>>,
    closed: AtomicBool,
}

impl ManualQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// From now on, pushed jobs are destroyed inline.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Processes queued jobs in push order, including any pushed while
    /// running, until the queue is empty. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // Released before the job runs; jobs may push more jobs.
            let next = self.jobs.lock().pop_front();
            let Some(mut job) = next else {
                return ran;
            };
            job.process();
            ran += 1;
        }
    }
}

impl WorkQueue for ManualQueue {
    fn push(&self, job: Box<dyn Job>) {
        if self.closed.load(Ordering::Acquire) {
            job.destroy();
        } else {
            self.jobs.lock().push_back(job);
        }
    }
}

/// One message accepted by a [`FakeTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentFrame {
    pub part_id: PartId,
    pub eof: bool,
    pub message: OutboundMessage,
}

/// Everything a [`FakeTransport`] observed, shared with the test.
#[derive(Debug, Default)]
pub struct FakeState {
    part_count: u32,
    sent: Mutex<Vec<SentFrame>>,
    cancels: Mutex<Vec<PartId>>,
    failing: Mutex<BTreeSet<PartId>>,
    rpc_info_reads: AtomicUsize,
    dropped: AtomicBool,
}

impl FakeState {
    pub fn part_count(&self) -> u32 {
        self.part_count
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, part_id: PartId) -> Vec<SentFrame> {
        self.sent
            .lock()
            .iter()
            .filter(|frame| frame.part_id == part_id)
            .cloned()
            .collect()
    }

    /// Partition ids passed to `send_cancel`, in call order.
    pub fn cancels(&self) -> Vec<PartId> {
        self.cancels.lock().clone()
    }

    /// Makes every later send to `part_id` fail.
    pub fn fail_sends(&self, part_id: PartId) {
        self.failing.lock().insert(part_id);
    }

    pub fn rpc_info_reads(&self) -> usize {
        self.rpc_info_reads.load(Ordering::Relaxed)
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

/// A [`Transport`] that records instead of sending.
#[derive(Debug)]
pub struct FakeTransport {
    state: Arc<FakeState>,
}

impl FakeTransport {
    pub fn new(part_count: u32) -> (Self, Arc<FakeState>) {
        let state = Arc::new(FakeState {
            part_count,
            ..FakeState::default()
        });
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl Transport for FakeTransport {
    fn part_count(&self) -> u32 {
        self.state.part_count
    }

    fn send(&self, part_id: PartId, eof: bool, message: OutboundMessage) -> bool {
        if self.state.failing.lock().contains(&part_id) {
            return false;
        }
        self.state.sent.lock().push(SentFrame {
            part_id,
            eof,
            message,
        });
        true
    }

    fn send_cancel(&self, part_id: PartId) {
        self.state.cancels.lock().push(part_id);
    }

    fn rpc_info(&self, part_id: PartId) -> RpcInfo {
        self.state.rpc_info_reads.fetch_add(1, Ordering::Relaxed);
        let sent = self.state.sent.lock();
        let frames = sent.iter().filter(|frame| frame.part_id == part_id);
        RpcInfo {
            part_id,
            frames_sent: frames.clone().count() as u64,
            bytes_sent: frames.map(|frame| frame.message.byte_len() as u64).sum(),
            cancelled: self.state.cancels.lock().contains(&part_id),
            ..RpcInfo::default()
        }
    }
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.state.dropped.store(true, Ordering::Release);
    }
}

/// A [`Session`] that binds [`FakeTransport`]s.
#[derive(Default)]
pub struct FakeSession {
    part_count: u32,
    trace_id: Option<String>,
    reject: Option<BindError>,
    requests: Mutex<Vec<BindRequest>>,
    transport: Mutex<Option<Arc<FakeState>>>,
    handler: Mutex<Option<Weak<dyn StreamHandler>>>,
}

impl FakeSession {
    /// A session whose targets declare `part_count` partitions.
    pub fn new(part_count: u32) -> Self {
        Self {
            part_count,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Every bind fails with `error`.
    #[must_use]
    pub fn rejecting(mut self, error: BindError) -> Self {
        self.reject = Some(error);
        self
    }

    pub fn requests(&self) -> Vec<BindRequest> {
        self.requests.lock().clone()
    }

    /// State of the most recently bound transport.
    pub fn transport(&self) -> Option<Arc<FakeState>> {
        self.transport.lock().clone()
    }

    /// The callback target of the most recent bind, if still alive.
    pub fn handler(&self) -> Option<Arc<dyn StreamHandler>> {
        self.handler.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl Session for FakeSession {
    fn trace_id(&self) -> Option<String> {
        self.trace_id.clone()
    }

    fn bind(
        &self,
        request: &BindRequest,
        handler: Weak<dyn StreamHandler>,
    ) -> Result<Box<dyn Transport>, BindError> {
        self.requests.lock().push(request.clone());
        if let Some(error) = &self.reject {
            return Err(error.clone());
        }
        let (transport, state) = FakeTransport::new(self.part_count);
        *self.transport.lock() = Some(state);
        *self.handler.lock() = Some(handler);
        Ok(Box::new(transport))
    }
}

/// Records every completion, including the thread it was delivered on.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    codes: Mutex<Vec<(ErrorCode, std::thread::ThreadId)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn codes(&self) -> Vec<ErrorCode> {
        self.codes.lock().iter().map(|&(code, _)| code).collect()
    }

    pub fn threads(&self) -> Vec<std::thread::ThreadId> {
        self.codes.lock().iter().map(|&(_, thread)| thread).collect()
    }

    pub fn count(&self) -> usize {
        self.codes.lock().len()
    }
}

impl FinishNotifier for RecordingNotifier {
    fn finish(&self, code: ErrorCode) {
        self.codes.lock().push((code, std::thread::current().id()));
    }
}

/// A [`Demux`] that records messages and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingDemux {
    messages: Mutex<Vec<InboundMessage>>,
    failing: AtomicBool,
}

impl RecordingDemux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        self.messages.lock().clone()
    }
}

impl Demux for RecordingDemux {
    fn demux(&self, message: &InboundMessage) -> Result<(), DemuxError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(DemuxError {
                part_id: message.part_id,
                reason: "injected failure".to_string(),
            });
        }
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

/// An [`OutputChannel`] that records forced eofs.
#[derive(Debug, Default)]
pub struct RecordingOutput {
    eofs: Mutex<Vec<PartId>>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eofs(&self) -> Vec<PartId> {
        self.eofs.lock().clone()
    }

    pub fn eof_count(&self, part_id: PartId) -> usize {
        self.eofs.lock().iter().filter(|&&id| id == part_id).count()
    }
}

impl OutputChannel for RecordingOutput {
    fn set_eof(&self, part_id: PartId) {
        self.eofs.lock().push(part_id);
    }
}

/// A [`RandSource`] that counts up from a seed.
#[derive(Debug)]
pub struct FixedRandom {
    next: AtomicU64,
}

impl FixedRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }
}

impl RandSource for FixedRandom {
    fn rand(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

