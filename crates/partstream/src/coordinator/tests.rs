use super::*;
use crate::{
    BindError, Codec, DeferredQueue, InputPort, MatchTag, RpcInfoCollector, TagMatchType,
    testing::{
        FakeSession, FakeState, FixedRandom, ManualQueue, RecordingDemux, RecordingNotifier,
        RecordingOutput,
    },
};
use bytes::Bytes;
use prost::Message as _;
use std::{sync::Barrier, thread::scope};

const BIZ: &str = "summary";

fn descriptor() -> SubgraphDef {
    SubgraphDef::new(7, BIZ, "graph-body")
}

struct Harness {
    coordinator: Arc<Coordinator>,
    queue: Arc<ManualQueue>,
    session: Arc<FakeSession>,
    notifier: Arc<RecordingNotifier>,
    demux: Arc<RecordingDemux>,
    output: Arc<RecordingOutput>,
    collector: Arc<RpcInfoCollector>,
}

impl Harness {
    fn new(part_count: u32) -> Self {
        Self::with(FakeSession::new(part_count), descriptor(), |builder| builder)
    }

    fn with(
        session: FakeSession,
        descriptor: SubgraphDef,
        configure: impl FnOnce(CoordinatorBuilder) -> CoordinatorBuilder,
    ) -> Self {
        let queue = Arc::new(ManualQueue::new());
        let session = Arc::new(session);
        let notifier = Arc::new(RecordingNotifier::new());
        let demux = Arc::new(RecordingDemux::new());
        let output = Arc::new(RecordingOutput::new());
        let collector = Arc::new(RpcInfoCollector::new());
        let builder = Coordinator::builder(descriptor, queue.clone())
            .session(session.clone())
            .local("search", 4)
            .notifier(notifier.clone())
            .demux(demux.clone())
            .output(output.clone())
            .diagnostics(collector.clone())
            .rand(Arc::new(FixedRandom::new(100)));
        Self {
            coordinator: configure(builder).build(),
            queue,
            session,
            notifier,
            demux,
            output,
            collector,
        }
    }

    fn started(part_count: u32) -> Self {
        let harness = Self::new(part_count);
        harness.coordinator.init().unwrap();
        harness.coordinator.run();
        harness
    }

    fn transport(&self) -> Arc<FakeState> {
        self.session.transport().unwrap()
    }

    fn eof(&self, part_id: PartId) -> bool {
        self.coordinator.receive(InboundMessage::eof(part_id))
    }
}

fn data(chunk: &'static str) -> OutboundMessage {
    OutboundMessage::with_data([Bytes::from_static(chunk.as_bytes())])
}

#[test]
fn all_partitions_close_naturally() {
    let h = Harness::started(3);
    let transport = h.transport();

    for part_id in 0..3 {
        let frames = transport.sent_to(part_id);
        assert_eq!(frames.len(), 1);
        let init = frames[0].message.init.as_ref().unwrap();
        assert_eq!(init.part_id, part_id);
        assert_eq!(init.part_count, 3);
        assert_eq!(init.graph_id, 7);
        // No input channels: the first send closes the outbound side.
        assert!(frames[0].eof);
    }

    for part_id in 0..3 {
        assert!(h.eof(part_id));
    }
    assert!(h.coordinator.finished());
    assert_eq!(h.notifier.count(), 0);
    assert_eq!(h.queue.len(), 1);

    assert_eq!(h.queue.run_pending(), 1);
    assert_eq!(h.notifier.codes(), vec![ErrorCode::None]);
    assert_eq!(h.collector.len(), 3);
    assert!(h.output.eofs().is_empty());
    assert!(transport.cancels().is_empty());
}

#[test]
fn send_failure_before_init_is_partition_local() {
    let h = Harness::new(3);
    h.coordinator.init().unwrap();
    let transport = h.transport();

    assert!(h.coordinator.on_send_failure(1));
    assert_eq!(transport.cancels(), vec![1]);
    assert_eq!(transport.rpc_info_reads(), 0);
    assert!(h.coordinator.states().unwrap().abandoned(1));

    h.coordinator.run();
    assert!(transport.sent_to(1).is_empty());
    assert_eq!(transport.sent().len(), 2);

    assert!(h.eof(0));
    assert!(!h.coordinator.finished());
    assert!(h.eof(2));

    h.queue.run_pending();
    assert_eq!(h.notifier.codes(), vec![ErrorCode::None]);
    assert_eq!(h.collector.len(), 2);
    assert!(h.output.eofs().is_empty());
}

#[test]
fn send_after_outbound_eof_fails_the_job() {
    let h = Harness::started(3);
    let transport = h.transport();

    let err = h.coordinator.do_send(0, data("late")).unwrap_err();
    assert!(matches!(err, Error::SendAfterEof { part_id: 0 }));
    assert_eq!(h.coordinator.result(), Some(ErrorCode::StreamSend));

    // Nothing else goes out once the job has failed, and the code stays.
    let err = h.coordinator.do_send(1, data("more")).unwrap_err();
    assert!(matches!(err, Error::SendAfterEof { part_id: 1 }));
    assert_eq!(h.coordinator.result(), Some(ErrorCode::StreamSend));
    h.coordinator.run();
    assert_eq!(transport.sent().len(), 3);

    assert_eq!(h.queue.run_pending(), 1);
    assert_eq!(h.notifier.codes(), vec![ErrorCode::StreamSend]);
    // The error completion cancels every partition before notifying.
    assert_eq!(transport.cancels(), vec![0, 1, 2]);
    assert_eq!(h.output.eofs(), vec![0, 1, 2]);
}

#[test]
fn send_after_eof_on_cancelled_partition_fails_the_job() {
    let h = Harness::started(3);
    let transport = h.transport();
    assert!(
        h.coordinator
            .receive_cancel(InboundMessage::eof(0), RemoteErrorCode::Cancelled)
    );
    assert!(h.coordinator.states().unwrap().forced_eof(0));

    let err = h.coordinator.do_send(0, data("late")).unwrap_err();
    assert!(matches!(err, Error::SendAfterEof { part_id: 0 }));
    assert_eq!(h.coordinator.result(), Some(ErrorCode::StreamSend));
    assert_eq!(transport.sent().len(), 3);

    assert_eq!(h.queue.run_pending(), 1);
    assert_eq!(h.notifier.codes(), vec![ErrorCode::StreamSend]);
}

#[test]
fn send_after_completion_keeps_the_first_code() {
    let h = Harness::started(1);
    assert!(h.eof(0));
    assert_eq!(h.coordinator.result(), Some(ErrorCode::None));

    let err = h.coordinator.do_send(0, data("late")).unwrap_err();
    assert!(matches!(err, Error::SendAfterEof { part_id: 0 }));
    assert_eq!(h.coordinator.result(), Some(ErrorCode::None));

    assert_eq!(h.queue.run_pending(), 1);
    assert_eq!(h.notifier.codes(), vec![ErrorCode::None]);
}

#[test]
fn repeated_run_after_outbound_eof_sends_nothing() {
    let h = Harness::started(2);
    h.coordinator.run();
    assert!(h.coordinator.do_send(0, OutboundMessage::empty()).is_ok());
    assert_eq!(h.transport().sent().len(), 2);
    assert_eq!(h.coordinator.result(), None);
}

#[test]
fn duplicate_cancel_is_ignored() {
    let h = Harness::started(3);
    let transport = h.transport();

    assert!(
        h.coordinator
            .receive_cancel(InboundMessage::eof(2), RemoteErrorCode::Cancelled)
    );
    assert!(
        h.coordinator
            .receive_cancel(InboundMessage::eof(2), RemoteErrorCode::Cancelled)
    );

    assert_eq!(h.collector.len(), 1);
    assert_eq!(transport.rpc_info_reads(), 1);
    assert_eq!(h.output.eof_count(2), 1);
    assert!(h.coordinator.states().unwrap().cancelled(2));

    assert!(h.eof(0));
    assert!(h.eof(1));
    h.queue.run_pending();
    assert_eq!(h.notifier.codes(), vec![ErrorCode::None]);
}

#[test]
fn cancel_after_natural_eof_does_not_force() {
    let h = Harness::started(2);
    assert!(h.eof(0));
    assert!(
        h.coordinator
            .receive_cancel(InboundMessage::eof(0), RemoteErrorCode::Timeout)
    );
    assert_eq!(h.output.eof_count(0), 0);
    assert_eq!(h.collector.len(), 1);
}

#[test]
fn transport_refusal_finishes_only_that_partition() {
    let input = Arc::new(InputPort::new());
    let h = Harness::with(FakeSession::new(3), descriptor(), |builder| {
        builder.input(input.clone())
    });
    h.coordinator.init().unwrap();
    let transport = h.transport();
    transport.fail_sends(1);

    h.coordinator.run();
    assert_eq!(transport.sent().len(), 2);
    assert_eq!(transport.cancels(), vec![1]);
    assert_eq!(h.output.eofs(), vec![1]);
    assert!(!h.coordinator.finished());

    // Later sends to the finished, still open partition are dropped.
    assert!(h.coordinator.do_send(1, data("x")).is_ok());
    assert_eq!(transport.sent().len(), 2);
    assert!(!h.coordinator.finished());

    assert!(h.eof(0));
    assert!(h.eof(2));
    h.queue.run_pending();
    assert_eq!(h.notifier.codes(), vec![ErrorCode::None]);
}

#[test]
fn outbound_close_waits_for_inputs() {
    let input = Arc::new(InputPort::new());
    let h = Harness::with(FakeSession::new(2), descriptor(), |builder| {
        builder.input(input.clone())
    });
    h.coordinator.init().unwrap();
    h.coordinator.run();
    let transport = h.transport();
    assert!(transport.sent().iter().all(|frame| !frame.eof));

    input.close(0);
    h.coordinator.do_send(0, data("last")).unwrap();
    h.coordinator.do_send(1, data("more")).unwrap();

    let states = h.coordinator.states().unwrap();
    assert!(states.outbound_closed(0));
    assert!(!states.outbound_closed(1));
    assert!(transport.sent_to(0)[1].eof);
    assert!(!transport.sent_to(1)[1].eof);
}

#[test]
fn handshake_only_on_first_send() {
    let input = Arc::new(InputPort::new());
    let h = Harness::with(FakeSession::new(2), descriptor(), |builder| {
        builder.input(input.clone())
    });
    h.coordinator.init().unwrap();
    h.coordinator.run();
    h.coordinator.run();
    h.coordinator.do_send(1, OutboundMessage::empty()).unwrap();
    h.coordinator.do_send(1, data("payload")).unwrap();

    let transport = h.transport();
    let frames = transport.sent();
    assert_eq!(frames.len(), 3);
    assert!(frames[0].message.init.is_some());
    assert!(frames[1].message.init.is_some());
    assert!(frames[2].message.init.is_none());
    assert_eq!(frames[2].message.data, vec![Bytes::from_static(b"payload")]);

    let ids: Vec<u64> = frames.iter().map(|frame| frame.message.msg_id).collect();
    assert_eq!(ids, vec![100, 101, 102]);
}

#[test]
fn first_data_send_carries_the_handshake() {
    let input = Arc::new(InputPort::new());
    let h = Harness::with(FakeSession::new(2), descriptor(), |builder| {
        builder.input(input.clone())
    });
    h.coordinator.init().unwrap();
    h.coordinator.do_send(1, data("early")).unwrap();
    h.coordinator.do_send(1, data("next")).unwrap();

    let frames = h.transport().sent_to(1);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].message.init.as_ref().unwrap().part_id, 1);
    assert_eq!(frames[0].message.data, vec![Bytes::from_static(b"early")]);
    assert!(frames[1].message.init.is_none());
    assert!(h.coordinator.states().unwrap().inited(1));
}

#[test]
fn no_session_is_a_setup_failure() {
    let queue = Arc::new(ManualQueue::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let coordinator = Coordinator::builder(descriptor(), queue.clone())
        .notifier(notifier.clone())
        .build();

    let err = coordinator.init().unwrap_err();
    assert!(matches!(err, Error::NoSession { ref biz } if biz == BIZ));
    assert!(coordinator.states().is_none());
    assert_eq!(coordinator.result(), Some(ErrorCode::Setup));

    queue.run_pending();
    assert_eq!(notifier.codes(), vec![ErrorCode::Setup]);
}

#[test]
fn rejected_bind_is_a_setup_failure() {
    let session = FakeSession::new(3).rejecting(BindError::Degraded { biz: BIZ.into() });
    let h = Harness::with(session, descriptor(), |builder| builder);

    let err = h.coordinator.init().unwrap_err();
    assert!(matches!(err, Error::Bind(BindError::Degraded { .. })));
    assert!(h.coordinator.partitions().is_none());
    assert!(h.session.transport().is_none());

    h.coordinator.run();
    h.queue.run_pending();
    assert_eq!(h.notifier.codes(), vec![ErrorCode::Setup]);
}

#[test]
fn invalid_subset_is_a_setup_failure() {
    let h = Harness::with(
        FakeSession::new(3),
        descriptor().with_part_ids([0, 5]),
        |builder| builder,
    );

    let err = h.coordinator.init().unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidPartition {
            part_id: 5,
            part_count: 3
        }
    ));
    assert!(h.coordinator.states().is_none());

    // The refused transport is still torn down on the queue.
    let transport = h.transport();
    assert!(!transport.is_dropped());
    assert_eq!(h.queue.run_pending(), 2);
    assert!(transport.is_dropped());
    assert_eq!(h.notifier.codes(), vec![ErrorCode::Setup]);
}

#[test]
fn second_pre_init_is_rejected() {
    let h = Harness::new(1);
    h.coordinator.init().unwrap();
    assert!(matches!(h.coordinator.pre_init(), Err(Error::AlreadyBound)));
    assert!(!h.coordinator.finished());
}

#[test]
fn send_before_init_fails() {
    let h = Harness::new(1);
    assert!(matches!(
        h.coordinator.do_send(0, data("x")),
        Err(Error::NotBound)
    ));
    h.coordinator.pre_init().unwrap();
    assert!(matches!(
        h.coordinator.do_send(0, data("x")),
        Err(Error::NotPrepared)
    ));
    assert!(matches!(h.coordinator.post_init(), Ok(())));
    assert!(matches!(
        h.coordinator.do_send(3, data("x")),
        Err(Error::UnknownPartition { part_id: 3 })
    ));
}

#[test]
fn bind_request_and_handshake_carry_context() {
    let session = FakeSession::new(4).with_trace_id("trace-1");
    let descriptor = descriptor()
        .with_part_ids([1, 3])
        .with_tag(MatchTag::new("zone-a", TagMatchType::Prefer))
        .with_probe(true);
    let h = Harness::with(session, descriptor, |builder| {
        builder
            .timeout(Duration::from_secs(30))
            .async_io(true)
            .params(RunParams {
                session_id: 9,
                trace_level: "debug".into(),
                collect_metrics: true,
            })
            .baggage("tenant", "acme")
    });
    h.coordinator.init().unwrap();
    h.coordinator.run();

    let requests = h.session.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.biz_name, BIZ);
    assert_eq!(request.part_ids, vec![1, 3]);
    assert_eq!(request.tags[0].key, "zone-a");
    assert!(request.enable_probe);
    assert!(request.async_io);
    assert!(request.timeout.unwrap() <= Duration::from_secs(30));

    let frames = h.transport().sent();
    assert_eq!(
        frames.iter().map(|frame| frame.part_id).collect::<Vec<_>>(),
        vec![1, 3]
    );
    let init = frames[0].message.init.as_ref().unwrap();
    assert_eq!(init.part_count, 4);
    assert_eq!(init.params.session_id, 9);
    assert_eq!(init.diagnostics.trace_id.as_deref(), Some("trace-1"));
    assert_eq!(
        init.diagnostics.baggage,
        vec![("tenant".to_string(), "acme".to_string())]
    );
    assert!(init.remaining_ms.unwrap() <= 30_000);
}

#[test]
fn payload_is_compressed_descriptor() {
    let h = Harness::new(3);
    h.coordinator.init().unwrap();

    let payload = h.coordinator.payload().unwrap();
    assert_eq!(payload.codec(), Codec::Zstd);
    let decoded = SubgraphDef::decode(payload.decode().unwrap().as_slice()).unwrap();
    assert_eq!(decoded.part_count(), Some(3));
    assert_eq!(decoded.body, Bytes::from_static(b"graph-body"));
}

#[test]
fn uncompressed_payload_is_the_serialized_descriptor() {
    let h = Harness::with(FakeSession::new(2), descriptor(), |builder| {
        builder.codec(Codec::None)
    });
    h.coordinator.init().unwrap();

    let payload = h.coordinator.payload().unwrap();
    assert_eq!(payload.codec(), Codec::None);
    let mut expected = descriptor();
    expected.part_info_mut().part_count = Some(2);
    assert_eq!(payload.bytes().as_ref(), expected.encode_to_vec().as_slice());
}

#[test]
fn callbacks_for_unused_partitions_are_rejected() {
    let h = Harness::with(
        FakeSession::new(3),
        descriptor().with_part_ids([0, 2]),
        |builder| builder,
    );
    h.coordinator.init().unwrap();
    h.coordinator.run();

    assert!(!h.eof(1));
    assert!(!h.eof(9));
    assert!(!h.coordinator.on_send_failure(1));
    assert!(
        !h.coordinator
            .receive_cancel(InboundMessage::eof(1), RemoteErrorCode::Unknown)
    );
    assert!(h.demux.messages().is_empty());

    assert!(h.eof(0));
    assert!(h.eof(2));
    h.queue.run_pending();
    assert_eq!(h.notifier.codes(), vec![ErrorCode::None]);
}

#[test]
fn demux_failure_fails_the_job() {
    let h = Harness::started(2);
    h.demux.fail(true);

    assert!(!h.coordinator.receive(InboundMessage::new(0, "rows")));
    assert_eq!(h.coordinator.result(), Some(ErrorCode::StreamReceive));

    h.queue.run_pending();
    assert_eq!(h.notifier.codes(), vec![ErrorCode::StreamReceive]);
}

#[test]
fn cancel_payload_demux_failure_is_an_rpc_error() {
    let h = Harness::started(2);
    h.demux.fail(true);

    let message = InboundMessage::new(1, "partial");
    assert!(
        !h.coordinator
            .receive_cancel(message, RemoteErrorCode::Internal)
    );

    h.queue.run_pending();
    assert_eq!(h.notifier.codes(), vec![ErrorCode::StreamRpc]);
}

#[test]
fn received_payloads_reach_the_demux() {
    let h = Harness::started(2);
    assert!(h.coordinator.receive(InboundMessage::new(1, "a")));
    assert!(h.coordinator.receive(InboundMessage::new(1, "b").with_eof()));

    let messages = h.demux.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].eof);
    assert!(h.coordinator.states().unwrap().inbound_closed(1));
}

#[test]
fn diagnostics_name_both_sides() {
    let h = Harness::started(1);
    assert!(h.eof(0));
    let lines = h.collector.format();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("search(4) -> summary: part 0 sent 1/"));
}

#[test]
fn completion_keeps_coordinator_alive() {
    let h = Harness::started(1);
    let transport = h.transport();
    let Harness {
        coordinator, queue, ..
    } = h;

    assert!(coordinator.receive(InboundMessage::eof(0)));
    assert_eq!(coordinator.pending_async_ops(), 1);
    let weak = Arc::downgrade(&coordinator);
    drop(coordinator);
    assert!(weak.upgrade().is_some());
    assert!(!transport.is_dropped());

    // The completion job, then the stream teardown it releases.
    assert_eq!(queue.run_pending(), 2);
    assert!(weak.upgrade().is_none());
    assert!(transport.is_dropped());
}

#[test]
fn pending_ops_drain_after_completion() {
    let h = Harness::started(2);
    assert!(h.eof(0));
    assert!(h.eof(1));
    assert_eq!(h.coordinator.pending_async_ops(), 1);
    h.queue.run_pending();
    assert_eq!(h.coordinator.pending_async_ops(), 0);
}

#[test]
fn terminate_cancels_and_releases_stream() {
    let h = Harness::started(3);
    let transport = h.transport();

    h.coordinator.terminate();
    h.coordinator.terminate();
    assert_eq!(transport.cancels(), vec![0, 1, 2]);
    assert_eq!(h.output.eofs(), vec![0, 1, 2]);
    assert_eq!(h.coordinator.result(), Some(ErrorCode::None));

    let err = h.coordinator.do_send(0, data("x")).unwrap_err();
    assert!(matches!(err, Error::SendAfterEof { part_id: 0 }));
    assert_eq!(h.coordinator.result(), Some(ErrorCode::None));
    assert_eq!(transport.sent().len(), 3);

    assert_eq!(h.queue.run_pending(), 2);
    assert!(transport.is_dropped());
    assert_eq!(h.notifier.codes(), vec![ErrorCode::None]);
}

#[test]
fn closed_queue_delivers_inline() {
    let h = Harness::started(1);
    h.queue.close();
    assert!(h.eof(0));
    assert_eq!(h.notifier.codes(), vec![ErrorCode::None]);
    assert_eq!(h.coordinator.pending_async_ops(), 0);
}

#[test]
fn concurrent_eofs_complete_once() {
    const PARTS: u32 = 16;
    let h = Harness::started(PARTS);
    let barrier = Barrier::new(PARTS as usize);

    scope(|s| {
        for part_id in 0..PARTS {
            let coordinator = Arc::clone(&h.coordinator);
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                assert!(coordinator.receive(InboundMessage::new(part_id, "rows").with_eof()));
            });
        }
    });

    assert_eq!(h.queue.len(), 1);
    h.queue.run_pending();
    assert_eq!(h.notifier.codes(), vec![ErrorCode::None]);
    assert_eq!(h.collector.len(), PARTS as usize);
    assert_eq!(h.demux.messages().len(), PARTS as usize);
}

#[test]
fn concurrent_duplicate_cancels_force_once() {
    const THREADS: usize = 8;
    let h = Harness::started(3);
    let barrier = Barrier::new(THREADS);

    scope(|s| {
        for _ in 0..THREADS {
            let coordinator = Arc::clone(&h.coordinator);
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                coordinator.receive_cancel(InboundMessage::eof(2), RemoteErrorCode::Cancelled);
            });
        }
    });

    assert_eq!(h.output.eof_count(2), 1);
    assert_eq!(h.collector.len(), 1);
    assert_eq!(h.transport().rpc_info_reads(), 1);
}

#[test]
fn concurrent_cancel_and_finish_complete_once() {
    let h = Harness::started(4);

    scope(|s| {
        for part_id in 0..4 {
            let coordinator = Arc::clone(&h.coordinator);
            s.spawn(move || coordinator.finish_part(part_id));
            let coordinator = Arc::clone(&h.coordinator);
            s.spawn(move || {
                coordinator.receive_cancel(InboundMessage::eof(part_id), RemoteErrorCode::Cancelled)
            });
        }
    });

    assert_eq!(h.queue.run_pending(), 1);
    assert_eq!(h.notifier.codes(), vec![ErrorCode::None]);
    for part_id in 0..4 {
        assert_eq!(h.output.eof_count(part_id), 1);
    }
    assert_eq!(h.collector.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completes_on_deferred_queue() {
    let queue = Arc::new(DeferredQueue::spawn(
        &tokio::runtime::Handle::current(),
        Duration::from_secs(3),
    ));
    let signal = Arc::new(CompletionSignal::new());
    let session = Arc::new(FakeSession::new(4));
    let coordinator = Coordinator::builder(descriptor(), queue.clone())
        .session(session.clone())
        .notifier(signal.clone())
        .build();
    coordinator.init().unwrap();
    coordinator.run();

    let callback_thread = std::thread::spawn({
        let coordinator = Arc::clone(&coordinator);
        move || {
            for part_id in 0..4 {
                coordinator.receive(InboundMessage::eof(part_id));
            }
        }
    });
    assert_eq!(signal.wait().await, ErrorCode::None);
    callback_thread.join().unwrap();

    let transport = session.transport().unwrap();
    drop(coordinator);
    assert!(queue.shutdown().await);
    assert!(transport.is_dropped());
    assert_eq!(queue.processed() + queue.destroyed(), 2);
}
