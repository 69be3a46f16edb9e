use bytes::Bytes;
use core::{pin::Pin, time::Duration};
use partstream::{
    BindError, CompletionSignal, Coordinator, DeferredQueue, Error, ErrorCode, InputPort,
    OutboundMessage, OutputPort, RpcInfoCollector, SubgraphDef,
};
use partstream_tonic_core::{
    GrpcSession, Target,
    proto::{
        StreamFrame,
        partition_stream_server::{PartitionStream, PartitionStreamServer},
    },
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, runtime::Handle, sync::mpsc};
use tokio_stream::{
    Stream,
    wrappers::{ReceiverStream, TcpListenerStream},
};
use tonic::{Request, Response, Status, Streaming, codec::CompressionEncoding, transport::Server};

const PARTS: u32 = 3;

/// Echoes every frame back on the same stream, without the handshake.
#[derive(Clone, Copy)]
struct EchoHost {
    reject: bool,
}

#[tonic::async_trait]
impl PartitionStream for EchoHost {
    type ExchangeStream = Pin<Box<dyn Stream<Item = Result<StreamFrame, Status>> + Send>>;

    async fn exchange(
        &self,
        request: Request<Streaming<StreamFrame>>,
    ) -> Result<Response<Self::ExchangeStream>, Status> {
        if self.reject {
            return Err(Status::failed_precondition("partition draining"));
        }
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Ok(Some(frame)) = inbound.message().await {
                let eof = frame.eof;
                let echo = StreamFrame {
                    init: None,
                    ..frame
                };
                if tx.send(Ok(echo)).await.is_err() || eof {
                    break;
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

async fn spawn_host(host: EchoHost) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = PartitionStreamServer::new(host)
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip);
    tokio::spawn(
        Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    addr
}

fn session(addr: SocketAddr) -> GrpcSession {
    let target = Target::connect_lazy(PARTS, format!("http://{addr}")).unwrap();
    GrpcSession::new(Handle::current())
        .with_target("summary", target)
        .with_trace_id("trace-7")
        .with_compression(CompressionEncoding::Gzip)
}

fn queue() -> Arc<DeferredQueue> {
    Arc::new(DeferredQueue::spawn(&Handle::current(), Duration::from_secs(3)))
}

async fn wait(signal: &CompletionSignal) -> ErrorCode {
    tokio::time::timeout(Duration::from_secs(10), signal.wait())
        .await
        .expect("job did not complete")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_job_completes_cleanly() {
    let addr = spawn_host(EchoHost { reject: false }).await;
    let queue = queue();
    let signal = Arc::new(CompletionSignal::new());
    let input = Arc::new(InputPort::new());
    let (output, mut payloads) = OutputPort::new();
    let output = Arc::new(output);
    let collector = Arc::new(RpcInfoCollector::new());

    let coordinator = Coordinator::builder(SubgraphDef::new(7, "summary", "graph-body"), queue.clone())
        .session(Arc::new(session(addr)))
        .local("search", 1)
        .timeout(Duration::from_secs(30))
        .input(input.clone())
        .output(output.clone())
        .demux(output.clone())
        .diagnostics(collector.clone())
        .notifier(signal.clone())
        .build();

    coordinator.init().unwrap();
    coordinator.run();
    input.close_all();
    for part_id in 0..PARTS {
        let chunk = Bytes::from(format!("chunk-{part_id}"));
        coordinator
            .do_send(part_id, OutboundMessage::with_data([chunk]))
            .unwrap();
    }

    assert_eq!(wait(&signal).await, ErrorCode::None);

    let mut received = Vec::new();
    while let Ok(item) = payloads.try_recv() {
        received.push(item);
    }
    received.sort();
    let expected: Vec<_> = (0..PARTS)
        .map(|part_id| (part_id, Bytes::from(format!("chunk-{part_id}"))))
        .collect();
    assert_eq!(received, expected);
    for part_id in 0..PARTS {
        assert!(output.eof(part_id));
        assert!(!output.forced(part_id));
    }

    let infos = collector.snapshot();
    assert_eq!(infos.len(), PARTS as usize);
    for ((local, remote), info) in &infos {
        assert_eq!(local, "search(1)");
        assert_eq!(remote, "summary");
        assert_eq!(info.frames_sent, 2);
        assert_eq!(info.frames_received, 2);
        assert!(!info.cancelled);
    }

    drop(coordinator);
    assert!(queue.shutdown().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_streams_force_eof_downstream() {
    let addr = spawn_host(EchoHost { reject: true }).await;
    let queue = queue();
    let signal = Arc::new(CompletionSignal::new());
    let (output, _payloads) = OutputPort::new();
    let output = Arc::new(output);

    let coordinator = Coordinator::builder(SubgraphDef::new(7, "summary", "graph-body"), queue.clone())
        .session(Arc::new(session(addr)))
        .output(output.clone())
        .demux(output.clone())
        .notifier(signal.clone())
        .build();

    coordinator.init().unwrap();
    coordinator.run();

    // Partition-local failures never fail the job.
    assert_eq!(wait(&signal).await, ErrorCode::None);
    for part_id in 0..PARTS {
        assert!(output.forced(part_id));
    }

    drop(coordinator);
    assert!(queue.shutdown().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_target_fails_setup() {
    let addr = spawn_host(EchoHost { reject: false }).await;
    let queue = queue();
    let signal = Arc::new(CompletionSignal::new());

    let coordinator = Coordinator::builder(SubgraphDef::new(7, "ranking", "graph-body"), queue.clone())
        .session(Arc::new(session(addr)))
        .notifier(signal.clone())
        .build();

    assert!(matches!(
        coordinator.init(),
        Err(Error::Bind(BindError::NotFound { .. }))
    ));
    assert_eq!(wait(&signal).await, ErrorCode::Setup);

    drop(coordinator);
    assert!(queue.shutdown().await);
}

#[tokio::test]
async fn empty_target_is_degraded() {
    let session = GrpcSession::new(Handle::current()).with_target("summary", Target::new(4));
    let coordinator = Coordinator::builder(
        SubgraphDef::new(7, "summary", "graph-body"),
        Arc::new(partstream::testing::ManualQueue::new()),
    )
    .session(Arc::new(session))
    .build();

    assert!(matches!(
        coordinator.pre_init(),
        Err(Error::Bind(BindError::Degraded { .. }))
    ));
}
