use super::{Coordinator, FinishNotifier, InflightOps, Settings};
use crate::{
    Codec, Demux, DiagnosticsSink, InputChannel, OutputChannel, PartId, RandSource, RunParams,
    Session, SubgraphDef, ThreadRandom, WorkQueue,
};
use core::time::Duration;
use parking_lot::{Mutex, RwLock};
use portable_atomic::AtomicBool;
use std::{
    sync::{Arc, OnceLock},
    time::Instant,
};

/// Collects the per-job settings and collaborators of a [`Coordinator`].
///
/// Only the descriptor and the work queue are required. A coordinator built
/// without a session fails `pre_init` with a setup error.
#[must_use]
pub struct CoordinatorBuilder {
    descriptor: SubgraphDef,
    queue: Arc<dyn WorkQueue>,
    session: Option<Arc<dyn Session>>,
    settings: Settings,
    inputs: Vec<Arc<dyn InputChannel>>,
    outputs: Vec<Arc<dyn OutputChannel>>,
    demux: Option<Arc<dyn Demux>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    notifier: Option<Arc<dyn FinishNotifier>>,
    rand: Arc<dyn RandSource>,
}

impl CoordinatorBuilder {
    pub fn new(descriptor: SubgraphDef, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            descriptor,
            queue,
            session: None,
            settings: Settings::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            demux: None,
            diagnostics: None,
            notifier: None,
            rand: Arc::new(ThreadRandom),
        }
    }

    pub fn session(mut self, session: Arc<dyn Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Identity of the caller, used in diagnostics as `"<biz>(<part>)"`.
    pub fn local(mut self, biz_name: impl Into<String>, part_id: PartId) -> Self {
        self.settings.local_biz = biz_name.into();
        self.settings.local_part = part_id;
        self
    }

    /// Defaults to [`Codec::Zstd`].
    pub fn codec(mut self, codec: Codec) -> Self {
        self.settings.codec = codec;
        self
    }

    /// Time budget for the whole job, measured from [`build`](Self::build).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = Some(timeout);
        self
    }

    pub fn async_io(mut self, async_io: bool) -> Self {
        self.settings.async_io = async_io;
        self
    }

    pub fn params(mut self, params: RunParams) -> Self {
        self.settings.params = params;
        self
    }

    /// Adds a key/value pair forwarded in every init handshake.
    pub fn baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.baggage.push((key.into(), value.into()));
        self
    }

    pub fn input(mut self, input: Arc<dyn InputChannel>) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, output: Arc<dyn OutputChannel>) -> Self {
        self.outputs.push(output);
        self
    }

    /// Without a demultiplexer, received payloads are dropped.
    pub fn demux(mut self, demux: Arc<dyn Demux>) -> Self {
        self.demux = Some(demux);
        self
    }

    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn FinishNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Source of message correlation ids. Defaults to [`ThreadRandom`].
    pub fn rand(mut self, rand: Arc<dyn RandSource>) -> Self {
        self.rand = rand;
        self
    }

    pub fn build(self) -> Arc<Coordinator> {
        let deadline = self.settings.timeout.map(|timeout| Instant::now() + timeout);
        Arc::new_cyclic(|this| Coordinator {
            this: this.clone(),
            settings: self.settings,
            deadline,
            graph_id: self.descriptor.graph_id,
            descriptor: Mutex::new(self.descriptor),
            queue: self.queue,
            session: self.session,
            inputs: self.inputs,
            outputs: self.outputs,
            demux: self.demux,
            diagnostics: self.diagnostics,
            notifier: self.notifier,
            rand: self.rand,
            binding: OnceLock::new(),
            stream: RwLock::new(None),
            payload: OnceLock::new(),
            result: OnceLock::new(),
            ops: InflightOps::default(),
            terminated: AtomicBool::new(false),
        })
    }
}
