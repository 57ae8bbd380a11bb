use std::{
    fs::File,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::{
    admission::{AdmissionController, AdmissionSlot},
    config::ServerConfig,
    operation::{DispatchError, Dispatcher},
    processor::{FfmpegProcessor, Processor},
    protocol::{ErrorCode, ErrorRecord, ProtocolError, ProtocolTransport, response},
    staging::{StagedFiles, StagingArea, StagingError},
};

use super::ConnectionThreads;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("server IO error: {0}")]
    Io(#[from] io::Error),
}

/// Reasons a connection ends without a processed artifact.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{0} already has a request in flight")]
    TooManyRequests(IpAddr),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("failed to open output: {0}")]
    Artifact(io::Error),
}

impl HandlerError {
    /// Error body reported to the client.
    pub fn record(&self) -> ErrorRecord {
        match self {
            HandlerError::Protocol(
                e @ (ProtocolError::MalformedHeader { .. }
                | ProtocolError::MalformedMetadata(_)
                | ProtocolError::FieldOverflow { .. }),
            ) => ErrorRecord::new(ErrorCode::BadRequest, "Malformed request", e.to_string()),
            HandlerError::TooManyRequests(_) => ErrorRecord::new(
                ErrorCode::TooManyRequests,
                "Too many requests",
                "Please wait for your current process to complete",
            ),
            HandlerError::Dispatch(e) => e.record(),
            HandlerError::Artifact(e) => ErrorRecord::new(
                ErrorCode::Internal,
                "Error sending processed file",
                e.to_string(),
            ),
            HandlerError::Protocol(e) => {
                ErrorRecord::new(ErrorCode::Internal, "Internal server error", e.to_string())
            }
            HandlerError::Staging(e) => {
                ErrorRecord::new(ErrorCode::Internal, "Internal server error", e.to_string())
            }
        }
    }
}

/// Lifecycle of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    HeaderRead,
    BodyRead,
    AdmissionChecked,
    Dispatched,
    ResponseSent,
    Errored,
    Closed,
}

/// State shared by every connection handler.
struct Shared {
    admission: Arc<AdmissionController>,
    dispatcher: Dispatcher,
    staging: StagingArea,
    idle_timeout: Option<Duration>,
}

pub struct MediaServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    threads: ConnectionThreads,
    shutdown: Arc<AtomicBool>,
}

impl MediaServer {
    /// Binds the listening socket and prepares the staging directory.
    pub fn bind(config: &ServerConfig, processor: Arc<dyn Processor>) -> Result<Self, ServerError> {
        let staging = StagingArea::new(&config.staging_dir)?;
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(address.as_str())
            .map_err(|source| ServerError::Bind { address, source })?;

        let shared = Shared {
            admission: Arc::new(AdmissionController::new()),
            dispatcher: Dispatcher::new(processor),
            staging,
            idle_timeout: (!config.idle_timeout.is_zero()).then_some(config.idle_timeout),
        };

        Ok(Self {
            listener,
            shared: Arc::new(shared),
            threads: ConnectionThreads::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Binds a server backed by [`FfmpegProcessor`].
    pub fn with_ffmpeg(config: &ServerConfig) -> Result<Self, ServerError> {
        let processor = FfmpegProcessor::new(&config.ffmpeg, &config.staging_dir);
        Self::bind(config, Arc::new(processor))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn admission(&self) -> Arc<AdmissionController> {
        Arc::clone(&self.shared.admission)
    }

    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            address: wake_address(self.local_addr()?),
        })
    }

    /// Accepts connections until shut down, each on a thread of its own.
    /// Returns once every in-flight connection has finished.
    pub fn listen(self) -> Result<(), ServerError> {
        info!(
            "listening at {}, staging files in {:?}",
            self.local_addr()?,
            self.shared.staging.dir()
        );

        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match stream {
                Ok(stream) => {
                    let peer = match stream.peer_addr() {
                        Ok(peer) => peer,
                        Err(e) => {
                            warn!("dropping connection without peer address: {e}");
                            continue;
                        }
                    };
                    info!("new connection from {peer}");

                    let shared = Arc::clone(&self.shared);
                    let spawned = self.threads.spawn(format!("conn-{peer}"), move || {
                        handle_connection(stream, peer, &shared)
                    });
                    if let Err(e) = spawned {
                        warn!("dropping connection from {peer}: {e}");
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!(
            "no longer accepting connections; {} still in flight",
            self.threads.active()
        );
        self.threads.wait_idle();
        Ok(())
    }
}

/// Stops a running [`MediaServer`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    address: SocketAddr,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);

        // The accept loop only notices the flag once it has a connection.
        if let Err(e) = TcpStream::connect(self.address) {
            debug!("shutdown wake-up connection failed: {e}");
        }
    }
}

fn wake_address(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => (Ipv4Addr::LOCALHOST, local.port()).into(),
        IpAddr::V6(ip) if ip.is_unspecified() => (Ipv6Addr::LOCALHOST, local.port()).into(),
        _ => local,
    }
}

fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: &Shared) {
    let mut conn = Connection::new(stream, peer);
    let mut held = Held::default();

    let result = conn
        .configure(shared.idle_timeout)
        .map_err(|e| HandlerError::Protocol(e.into()))
        .and_then(|()| conn.serve(shared, &mut held));

    if let Err(e) = result {
        conn.fail(e);
    }
    held.release();
    conn.close();
}

/// Everything a request acquires on its way through the handler.
#[derive(Debug, Default)]
struct Held {
    slot: Option<AdmissionSlot>,
    staged: Option<StagedFiles>,
}

impl Held {
    /// Removes staged files and gives back the admission slot. Runs once per
    /// connection whichever way the exchange ended.
    fn release(&mut self) {
        if let Some(mut staged) = self.staged.take() {
            staged.cleanup();
        }
        if let Some(slot) = self.slot.take() {
            trace!("releasing admission slot for {}", slot.addr());
        }
    }
}

/// One request/response exchange on an accepted socket.
struct Connection {
    transport: ProtocolTransport<TcpStream>,
    peer: SocketAddr,
    state: ConnectionState,
    responding: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            transport: ProtocolTransport::new(stream),
            peer,
            state: ConnectionState::Accepted,
            responding: false,
        }
    }

    fn configure(&self, idle_timeout: Option<Duration>) -> io::Result<()> {
        let stream = self.transport.get_ref();
        stream.set_read_timeout(idle_timeout)?;
        stream.set_write_timeout(idle_timeout)
    }

    fn advance(&mut self, next: ConnectionState) {
        trace!("{}: {:?} -> {next:?}", self.peer, self.state);
        self.state = next;
    }

    fn serve(&mut self, shared: &Shared, held: &mut Held) -> Result<(), HandlerError> {
        let envelope = self.transport.read_envelope()?;
        self.advance(ConnectionState::HeaderRead);

        let (mut input, staged) = shared.staging.stage_input(&envelope.media_type)?;
        let staged = held.staged.insert(staged);
        self.transport.copy_exact(envelope.payload_size, &mut input)?;
        drop(input);
        self.advance(ConnectionState::BodyRead);

        let ip = self.peer.ip();
        let slot = shared
            .admission
            .admit(ip)
            .ok_or(HandlerError::TooManyRequests(ip))?;
        held.slot = Some(slot);
        self.advance(ConnectionState::AdmissionChecked);

        let artifact = shared.dispatcher.dispatch(&envelope.metadata, staged)?;
        self.advance(ConnectionState::Dispatched);

        let mut output = File::open(&artifact.path).map_err(HandlerError::Artifact)?;
        self.responding = true;
        self.transport.write_streamed(
            &response::success_metadata(),
            &artifact.media_type,
            artifact.size,
            &mut output,
        )?;
        self.advance(ConnectionState::ResponseSent);

        info!(
            "sent {} byte {} artifact to {}",
            artifact.size, artifact.media_type, self.peer
        );
        Ok(())
    }

    /// Reports `err` to the client if nothing has been written yet. Failing
    /// to deliver it is not an error; the connection is closing either way.
    fn fail(&mut self, err: HandlerError) {
        let from = self.state;
        self.advance(ConnectionState::Errored);

        match &err {
            HandlerError::Protocol(ProtocolError::ConnectionClosed)
                if from == ConnectionState::Accepted =>
            {
                debug!("{} closed without sending a request", self.peer)
            }
            HandlerError::TooManyRequests(_) | HandlerError::Dispatch(_) => {
                info!("rejected request from {}: {err}", self.peer)
            }
            _ => warn!("connection {} failed in {from:?}: {err}", self.peer),
        }

        if self.responding {
            return;
        }
        if let Err(e) = self.transport.write_message(&err.record().into_message()) {
            debug!("could not deliver error to {}: {e}", self.peer);
        }
    }

    fn close(mut self) {
        if let Err(e) = self.transport.get_ref().shutdown(Shutdown::Both) {
            trace!("{}: shutdown: {e}", self.peer);
        }
        self.advance(ConnectionState::Closed);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        fs,
        io::{Read, Write},
        path::{Path, PathBuf},
        sync::{Mutex, atomic::AtomicUsize, mpsc},
        thread::{self, JoinHandle},
    };

    use serde_json::{Value, json};
    use tempdir::TempDir;

    use crate::{
        operation::Operation,
        processor::ProcessorError,
        protocol::{Message, Metadata, Response, header::Header},
    };

    use super::*;

    struct FnProcessor<F>(F);

    impl<F> Processor for FnProcessor<F>
    where
        F: Fn(&Path, &Operation) -> Result<PathBuf, ProcessorError> + Send + Sync,
    {
        fn process(&self, input: &Path, operation: &Operation) -> Result<PathBuf, ProcessorError> {
            (self.0)(input, operation)
        }
    }

    /// Processor backed by a closure.
    pub(crate) fn processor<F>(f: F) -> Arc<dyn Processor>
    where
        F: Fn(&Path, &Operation) -> Result<PathBuf, ProcessorError> + Send + Sync + 'static,
    {
        Arc::new(FnProcessor(f))
    }

    /// Writes `bytes` as the output of any operation.
    pub(crate) fn writes(bytes: &'static [u8]) -> Arc<dyn Processor> {
        processor(move |input, operation| {
            let out = input.with_extension(format!("out.{}", operation.kind().output_kind()));
            fs::write(&out, bytes)?;
            Ok(out)
        })
    }

    pub(crate) struct TestServer {
        pub(crate) address: SocketAddr,
        pub(crate) admission: Arc<AdmissionController>,
        pub(crate) staging: TempDir,
        handle: ShutdownHandle,
        thread: Option<JoinHandle<()>>,
    }

    impl TestServer {
        pub(crate) fn start(processor: Arc<dyn Processor>) -> Self {
            Self::start_with_timeout(processor, Duration::from_secs(5))
        }

        pub(crate) fn start_with_timeout(
            processor: Arc<dyn Processor>,
            idle_timeout: Duration,
        ) -> Self {
            let staging = TempDir::new("server").unwrap();
            let config = ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                idle_timeout,
                staging_dir: staging.path().to_path_buf(),
                ..ServerConfig::default()
            };

            let server = MediaServer::bind(&config, processor).unwrap();
            let address = server.local_addr().unwrap();
            let admission = server.admission();
            let handle = server.shutdown_handle().unwrap();
            let thread = thread::spawn(move || server.listen().unwrap());

            Self {
                address,
                admission,
                staging,
                handle,
                thread: Some(thread),
            }
        }

        pub(crate) fn staged_files(&self) -> usize {
            fs::read_dir(self.staging.path()).unwrap().count()
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.handle.shutdown();
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
        }
    }

    fn metadata(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn connect(address: SocketAddr) -> ProtocolTransport<TcpStream> {
        let stream = TcpStream::connect(address).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        ProtocolTransport::new(stream)
    }

    /// Reads the response and waits for the server to close, which happens
    /// only after its cleanup has run.
    fn finish(mut transport: ProtocolTransport<TcpStream>) -> Message {
        let response = transport.read_message().unwrap();
        let mut rest = Vec::new();
        transport.into_inner().read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        response
    }

    fn exchange(address: SocketAddr, request: &Message) -> Message {
        let mut transport = connect(address);
        transport.write_message(request).unwrap();
        finish(transport)
    }

    fn error_code(message: &Message) -> u16 {
        match Response::try_from(message).unwrap() {
            Response::Err(record) => record.error_code,
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn server_extract_audio() {
        let server = TestServer::start(writes(b"ID3 mp3 frames"));
        let request = Message::new(
            metadata(json!({"process_type": "extract_audio"})),
            "mp4",
            b"fake mp4 bytes".to_vec(),
        );

        let response = exchange(server.address, &request);

        assert_eq!(Value::Object(response.metadata), json!({"status": "success"}));
        assert_eq!(response.media_type, "mp3");
        assert_eq!(response.payload, b"ID3 mp3 frames");
        assert_eq!(server.staged_files(), 0);
        assert_eq!(server.admission.in_flight(server.address.ip()), 0);
    }

    #[test]
    fn server_processor_sees_payload_and_parameters() {
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let server = TestServer::start(processor(move |input, operation| {
            *record.lock().unwrap() = Some((fs::read(input)?, operation.clone()));
            let out = input.with_extension("out.mp4");
            fs::write(&out, b"resized")?;
            Ok(out)
        }));
        let request = Message::new(
            metadata(json!({"process_type": "resize_resolution", "width": 640})),
            "mov",
            vec![9; 200_000],
        );

        let response = exchange(server.address, &request);

        assert_eq!(response.payload, b"resized");
        let (payload, operation) = seen.lock().unwrap().take().unwrap();
        assert_eq!(payload, vec![9; 200_000]);
        assert_eq!(
            operation,
            Operation::ResizeResolution {
                width: 640,
                height: 1080
            }
        );
    }

    #[test]
    fn server_unknown_operation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let server = TestServer::start(processor(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ProcessorError::Io(io::Error::other("unreachable")))
        }));
        let request = Message::new(
            metadata(json!({"process_type": "upscale_4k"})),
            "mp4",
            b"bytes".to_vec(),
        );

        let response = exchange(server.address, &request);

        assert_eq!(error_code(&response), 400);
        assert!(response.payload.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(server.staged_files(), 0);
    }

    #[test]
    fn server_missing_operation() {
        let server = TestServer::start(writes(b"unused"));
        let request = Message::new(Metadata::new(), "mp4", b"bytes".to_vec());

        let response = exchange(server.address, &request);
        assert_eq!(error_code(&response), 400);
    }

    #[test]
    fn server_processing_failure() {
        let server = TestServer::start(processor(|_, _| {
            Err(ProcessorError::Io(io::Error::other("codec not found")))
        }));
        let request = Message::new(
            metadata(json!({"process_type": "compress"})),
            "mp4",
            b"bytes".to_vec(),
        );

        let response = exchange(server.address, &request);

        match Response::try_from(&response).unwrap() {
            Response::Err(record) => {
                assert_eq!(record.error_code, 500);
                assert_eq!(record.description, "Processing failed");
                assert!(record.solution.contains("codec not found"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.staged_files(), 0);
        assert_eq!(server.admission.in_flight(server.address.ip()), 0);
    }

    #[test]
    fn server_processor_panic_still_cleans_up() {
        let server = TestServer::start(processor(|_, _| panic!("segfault in disguise")));
        let request = Message::new(
            metadata(json!({"process_type": "compress"})),
            "mp4",
            b"bytes".to_vec(),
        );

        let response = exchange(server.address, &request);

        assert_eq!(error_code(&response), 500);
        assert_eq!(server.staged_files(), 0);
        assert_eq!(server.admission.in_flight(server.address.ip()), 0);
    }

    #[test]
    fn server_rejects_second_request_from_same_address() {
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let gate_rx = Mutex::new(gate_rx);
        let server = TestServer::start(processor(move |input, _| {
            started_tx.lock().unwrap().send(()).unwrap();
            gate_rx.lock().unwrap().recv().unwrap();
            let out = input.with_extension("out.mp3");
            fs::write(&out, b"audio")?;
            Ok(out)
        }));
        let request = Message::new(
            metadata(json!({"process_type": "extract_audio"})),
            "mp4",
            b"video".to_vec(),
        );

        let mut first = connect(server.address);
        first.write_message(&request).unwrap();
        started_rx.recv().unwrap();
        assert_eq!(server.admission.in_flight(server.address.ip()), 1);

        let second = exchange(server.address, &request);
        assert_eq!(error_code(&second), 429);
        assert!(second.payload.is_empty());

        gate_tx.send(()).unwrap();
        let first = finish(first);
        assert_eq!(first.payload, b"audio");

        gate_tx.send(()).unwrap();
        let third = exchange(server.address, &request);
        assert_eq!(third.payload, b"audio");
        assert_eq!(server.staged_files(), 0);
    }

    #[test]
    fn server_idle_connections_do_not_delay_admission() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let gate_rx = Mutex::new(gate_rx);
        let server = TestServer::start(processor(move |input, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            started_tx.lock().unwrap().send(()).unwrap();
            gate_rx.lock().unwrap().recv().unwrap();
            let out = input.with_extension("out.mp3");
            fs::write(&out, b"audio")?;
            Ok(out)
        }));
        let request = Message::new(
            metadata(json!({"process_type": "extract_audio"})),
            "mp4",
            b"video".to_vec(),
        );

        // More silent peers than there are cores; none of them may hold up
        // the requests behind them.
        let idle: Vec<TcpStream> = (0..32)
            .map(|_| TcpStream::connect(server.address).unwrap())
            .collect();

        let mut first = connect(server.address);
        first.write_message(&request).unwrap();
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("first request never reached the processor");

        let second = exchange(server.address, &request);
        assert_eq!(error_code(&second), 429);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gate_tx.send(()).unwrap();
        assert_eq!(finish(first).payload, b"audio");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(idle);
    }

    #[test]
    fn server_truncated_header() {
        let server = TestServer::start(writes(b"unused"));
        let mut stream = TcpStream::connect(server.address).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        stream.write_all(&[0, 10, 3, 0, 0]).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        let response = finish(ProtocolTransport::new(stream));
        assert_eq!(error_code(&response), 400);
        assert_eq!(server.admission.in_flight(server.address.ip()), 0);
    }

    #[test]
    fn server_malformed_metadata() {
        let server = TestServer::start(writes(b"unused"));
        let mut transport = connect(server.address);
        let header = Header::new(4, 3, 0).unwrap();

        transport.write_all(&header.to_bytes()).unwrap();
        transport.write_all(b"{{{{mp4").unwrap();

        let response = finish(transport);
        assert_eq!(error_code(&response), 400);
        assert_eq!(server.staged_files(), 0);
    }

    #[test]
    fn server_idle_peer_times_out() {
        let server = TestServer::start_with_timeout(writes(b"unused"), Duration::from_millis(200));
        let mut transport = connect(server.address);
        let header = Header::new(20, 3, 100).unwrap();

        transport.write_all(&header.to_bytes()).unwrap();

        let response = finish(transport);
        assert_eq!(error_code(&response), 500);
        assert_eq!(server.staged_files(), 0);
    }

    #[test]
    fn server_peer_closes_mid_payload() {
        let server = TestServer::start(writes(b"unused"));
        let request = Message::new(
            metadata(json!({"process_type": "compress"})),
            "mp4",
            vec![1; 1000],
        );
        let (header, body, payload) = request.encode().unwrap();

        let mut stream = TcpStream::connect(server.address).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream.write_all(&header).unwrap();
        stream.write_all(&body).unwrap();
        stream.write_all(&payload[..10]).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        let response = finish(ProtocolTransport::new(stream));
        assert_eq!(error_code(&response), 500);
        assert_eq!(server.staged_files(), 0);
        assert_eq!(server.admission.in_flight(server.address.ip()), 0);
    }

    #[test]
    fn wake_address_for_unspecified_bind() {
        let local: SocketAddr = "0.0.0.0:8000".parse().unwrap();
        assert_eq!(wake_address(local), "127.0.0.1:8000".parse().unwrap());

        let local: SocketAddr = "10.1.2.3:8000".parse().unwrap();
        assert_eq!(wake_address(local), local);
    }
}
