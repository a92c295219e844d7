//! Stream stage: moves bytes from a socket or file into the stream buffer.
//!
//! The stage thread owns the descriptor. The controller drives it through
//! [`StreamControl`], which updates the shared [`StreamStatus`] synchronously and
//! sends a [`StreamCommand`] so the thread picks up the change within one poll.
//!
//! Every connect or open starts a new session. The thread drops its descriptor as
//! soon as it sees the shared session move on, so bytes from an abandoned source are
//! never written after a disconnect or flush.

pub mod http;
pub mod icy;

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use netplayer_types::{DisconnectReason, PlayerEvent, StreamState};

use crate::shared::Shared;
use icy::IcyFilter;

const SCRATCH_BYTES: usize = 64 * 1024;

/// Stream state colocated with the stream buffer.
#[derive(Debug, Default)]
pub struct StreamStatus {
    pub state: StreamState,
    pub disconnect: DisconnectReason,
    /// Body bytes written to the buffer for the current session.
    pub bytes: u64,
    pub threshold: u64,
    pub threshold_reached: bool,
    /// Hold in `Wait` after the header until the controller continues.
    pub cont_wait: bool,
    /// Raw response header of the current session.
    pub header: Vec<u8>,
    pub icy: IcyFilter,
    /// Most recent inline metadata block.
    pub metadata: Option<String>,
    pub(crate) session: u64,
}

impl StreamStatus {
    fn begin(&mut self, state: StreamState, threshold: u64, cont_wait: bool) -> u64 {
        self.session += 1;
        self.state = state;
        self.disconnect = DisconnectReason::Ok;
        self.bytes = 0;
        self.threshold = threshold;
        self.threshold_reached = false;
        self.cont_wait = cont_wait;
        self.header.clear();
        self.icy = IcyFilter::default();
        self.metadata = None;
        self.session
    }
}

/// Outgoing HTTP request for [`StreamControl::connect`].
#[derive(Clone, Debug)]
pub struct StreamRequest {
    /// `host:port` to connect to.
    pub addr: String,
    /// Request bytes sent verbatim.
    pub header: Vec<u8>,
    /// Body bytes to buffer before reporting [`PlayerEvent::BufferThreshold`].
    pub threshold: u64,
    /// Stop in `Wait` after the response header.
    pub cont_wait: bool,
    /// Applies to connect and to the header exchange.
    pub timeout: Duration,
}

impl StreamRequest {
    pub fn new(addr: impl Into<String>, header: impl Into<Vec<u8>>) -> Self {
        Self {
            addr: addr.into(),
            header: header.into(),
            threshold: 0,
            cont_wait: false,
            timeout: Duration::from_secs(10),
        }
    }

    /// Plain `GET` for an `http://` URL, asking for inline ICY metadata.
    pub fn http_get(url: &str) -> Result<Self> {
        let (addr, header) = http::get_request(url, true)?;
        Ok(Self::new(addr, header))
    }

    pub fn threshold(mut self, bytes: u64) -> Self {
        self.threshold = bytes;
        self
    }

    pub fn wait_for_continue(mut self, wait: bool) -> Self {
        self.cont_wait = wait;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub(crate) enum StreamCommand {
    Connect { session: u64, request: StreamRequest },
    OpenFile { session: u64, path: PathBuf },
    /// Shared state changed; re-evaluate.
    Nudge,
    Close,
}

/// Controller side of the stream stage.
#[derive(Clone)]
pub(crate) struct StreamControl {
    shared: Arc<Shared>,
    commands: Sender<StreamCommand>,
}

impl StreamControl {
    pub(crate) fn new(shared: Arc<Shared>, commands: Sender<StreamCommand>) -> Self {
        Self { shared, commands }
    }

    pub(crate) fn connect(&self, request: StreamRequest) {
        let session = {
            let mut g = self.shared.stream.lock();
            g.state
                .begin(StreamState::SendHeaders, request.threshold, request.cont_wait)
        };
        tracing::info!(addr = %request.addr, threshold = request.threshold, "stream connect");
        self.send(StreamCommand::Connect { session, request });
    }

    pub(crate) fn open_file(&self, path: PathBuf, threshold: u64) {
        let session = {
            let mut g = self.shared.stream.lock();
            g.state.begin(StreamState::StreamingFile, threshold, false)
        };
        tracing::info!(path = %path.display(), "stream file");
        self.send(StreamCommand::OpenFile { session, path });
    }

    /// Leave `Wait` and start buffering the body, optionally stripping ICY metadata.
    pub(crate) fn resume(&self, meta_interval: usize) -> bool {
        let resumed = {
            let mut g = self.shared.stream.lock();
            if g.state.state == StreamState::Wait {
                g.state.state = StreamState::Buffering;
                if meta_interval > 0 {
                    g.state.icy = IcyFilter::new(meta_interval);
                }
                true
            } else {
                false
            }
        };
        if resumed {
            self.send(StreamCommand::Nudge);
        }
        resumed
    }

    /// Close the descriptor on request of the controller.
    pub(crate) fn disconnect(&self) -> bool {
        let was_active = {
            let mut g = self.shared.stream.lock();
            let active = !g.state.state.is_ended();
            g.state.session += 1;
            g.state.state = StreamState::Stopped;
            if active {
                g.state.disconnect = DisconnectReason::Local;
            }
            active
        };
        self.send(StreamCommand::Close);
        self.shared.stream.notify();
        self.shared.wake.notify();
        if was_active {
            tracing::info!("stream disconnected locally");
            self.shared.emit(PlayerEvent::StreamDisconnected {
                reason: DisconnectReason::Local,
            });
        }
        was_active
    }

    fn send(&self, command: StreamCommand) {
        if self.commands.send(command).is_err() {
            tracing::warn!("stream stage is not running");
        }
    }
}

/// Spawn the stream stage thread.
pub(crate) fn spawn(shared: Arc<Shared>, commands: Receiver<StreamCommand>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("netplayer-stream".into())
        .spawn(move || StreamWorker::new(shared, commands).run())
        .context("spawn stream thread")
}

enum Source {
    Tcp(TcpStream),
    File(File),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Tcp(s) => s.read(buf),
            Source::File(f) => f.read(buf),
        }
    }
}

struct StreamWorker {
    shared: Arc<Shared>,
    commands: Receiver<StreamCommand>,
    source: Option<Source>,
    session: u64,
    request: Vec<u8>,
    sent: usize,
    deadline: Option<Instant>,
    scratch: Vec<u8>,
    body: Vec<u8>,
}

impl StreamWorker {
    fn new(shared: Arc<Shared>, commands: Receiver<StreamCommand>) -> Self {
        Self {
            shared,
            commands,
            source: None,
            session: 0,
            request: Vec::new(),
            sent: 0,
            deadline: None,
            scratch: vec![0; SCRATCH_BYTES],
            body: Vec::with_capacity(SCRATCH_BYTES),
        }
    }

    fn run(mut self) {
        tracing::debug!("stream stage started");
        let poll = self.shared.config.stream_poll;
        while self.shared.is_running() {
            let state = self.current_state();
            let idle = match state {
                Some(StreamState::Wait) => true,
                Some(_) => self.source.is_none(),
                None => true,
            };

            if idle {
                match self.commands.recv_timeout(poll) {
                    Ok(cmd) => self.handle(cmd),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            while let Ok(cmd) = self.commands.try_recv() {
                self.handle(cmd);
            }
            if self.source.is_none() {
                continue;
            }

            match self.current_state() {
                Some(StreamState::SendHeaders) => self.send_headers(),
                Some(StreamState::RecvHeaders) => self.recv_headers(),
                Some(StreamState::Buffering)
                | Some(StreamState::StreamingHttp)
                | Some(StreamState::StreamingFile) => self.read_body(),
                Some(StreamState::Wait) => {}
                Some(StreamState::Stopped) | Some(StreamState::Disconnect) | None => {
                    self.source = None;
                }
            }
        }
        self.source = None;
        tracing::debug!("stream stage stopped");
    }

    /// State of our session, or `None` once the controller moved on.
    fn current_state(&mut self) -> Option<StreamState> {
        let g = self.shared.stream.lock();
        if g.state.session != self.session {
            drop(g);
            self.source = None;
            return None;
        }
        Some(g.state.state)
    }

    fn handle(&mut self, cmd: StreamCommand) {
        match cmd {
            StreamCommand::Connect { session, request } => {
                self.source = None;
                self.session = session;
                self.request = request.header;
                self.sent = 0;
                self.deadline = Some(Instant::now() + request.timeout);
                match connect(&request.addr, request.timeout, self.shared.config.stream_poll) {
                    Ok(sock) => {
                        if self.current_state().is_some() {
                            tracing::info!(addr = %request.addr, "stream connected");
                            self.source = Some(Source::Tcp(sock));
                            self.shared.emit(PlayerEvent::StreamConnected);
                        }
                    }
                    Err(e) => {
                        let reason = if e.kind() == io::ErrorKind::TimedOut {
                            DisconnectReason::Timeout
                        } else {
                            DisconnectReason::Unreachable
                        };
                        tracing::warn!(addr = %request.addr, error = %e, "stream connect failed");
                        self.disconnect(reason);
                    }
                }
            }
            StreamCommand::OpenFile { session, path } => {
                self.source = None;
                self.session = session;
                self.deadline = None;
                match File::open(&path) {
                    Ok(f) => {
                        self.source = Some(Source::File(f));
                        self.shared.emit(PlayerEvent::StreamConnected);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "open stream file failed");
                        self.disconnect(DisconnectReason::Unreachable);
                    }
                }
            }
            StreamCommand::Nudge => {}
            StreamCommand::Close => {
                if self.current_state().is_none() {
                    self.source = None;
                }
            }
        }
    }

    fn send_headers(&mut self) {
        if self.sent >= self.request.len() {
            let mut g = self.shared.stream.lock();
            if g.state.session == self.session {
                g.state.state = StreamState::RecvHeaders;
            }
            return;
        }
        let Some(Source::Tcp(sock)) = self.source.as_mut() else {
            return;
        };
        match sock.write(&self.request[self.sent..]) {
            Ok(0) => self.disconnect(DisconnectReason::Remote),
            Ok(n) => self.sent += n,
            Err(e) if is_retry(&e) => self.check_deadline(),
            Err(e) => {
                tracing::warn!(error = %e, "stream request write failed");
                self.disconnect(DisconnectReason::Remote);
            }
        }
    }

    fn recv_headers(&mut self) {
        let Some(source) = self.source.as_mut() else {
            return;
        };
        let mut byte = [0u8; 1];
        match source.read(&mut byte) {
            Ok(0) => {
                tracing::warn!("stream closed during response header");
                self.disconnect(DisconnectReason::Remote);
            }
            Ok(_) => self.push_header_byte(byte[0]),
            Err(e) if is_retry(&e) => self.check_deadline(),
            Err(e) => {
                tracing::warn!(error = %e, "stream header read failed");
                self.disconnect(DisconnectReason::Remote);
            }
        }
    }

    fn push_header_byte(&mut self, byte: u8) {
        let mut g = self.shared.stream.lock();
        if g.state.session != self.session {
            return;
        }
        g.state.header.push(byte);
        if g.state.header.len() > http::MAX_HEADER_BYTES {
            drop(g);
            tracing::warn!("stream response header too long");
            self.disconnect(DisconnectReason::Remote);
            return;
        }
        if !http::header_complete(&g.state.header) {
            return;
        }

        let text = String::from_utf8_lossy(&g.state.header).into_owned();
        if let Some(interval) = http::meta_interval(&text) {
            g.state.icy = IcyFilter::new(interval);
        }
        g.state.state = if g.state.cont_wait {
            StreamState::Wait
        } else {
            StreamState::Buffering
        };
        drop(g);
        self.deadline = None;

        let status = http::status_code(&text);
        tracing::info!(status = ?status, bytes = text.len(), "stream header received");
        self.shared.emit(PlayerEvent::StreamHeaders { headers: text });
        if matches!(status, Some(code) if code >= 400) {
            self.disconnect(DisconnectReason::Remote);
        }
    }

    fn read_body(&mut self) {
        let space = {
            let g = self.shared.stream.lock();
            if g.state.session != self.session {
                return;
            }
            let space = g.buf.writable_len();
            if space == 0 {
                // Full: wait for the decoder to consume.
                let _g = self
                    .shared
                    .stream
                    .wait_timeout(g, self.shared.config.stream_poll);
                return;
            }
            space
        };

        let Some(source) = self.source.as_mut() else {
            return;
        };
        let want = space.min(self.scratch.len());
        match source.read(&mut self.scratch[..want]) {
            Ok(0) => {
                tracing::info!("end of stream");
                self.disconnect(DisconnectReason::Ok);
            }
            Ok(n) => self.commit(n),
            Err(e) if is_retry(&e) => {}
            Err(e) => {
                tracing::warn!(error = %e, "stream read failed");
                self.disconnect(DisconnectReason::Remote);
            }
        }
    }

    fn commit(&mut self, n: usize) {
        let mut metadata = Vec::new();
        let crossed = {
            let mut g = self.shared.stream.lock();
            if g.state.session != self.session {
                drop(g);
                self.source = None;
                return;
            }
            let crate::buffer::Locked { buf, state } = &mut *g;
            let written = if state.icy.is_active() {
                self.body.clear();
                state.icy.feed(&self.scratch[..n], &mut self.body, &mut metadata);
                buf.write_from(&self.body)
            } else {
                buf.write_from(&self.scratch[..n])
            };
            state.bytes += written as u64;
            if let Some(last) = metadata.last() {
                state.metadata = Some(last.clone());
            }
            if !state.threshold_reached && state.bytes > state.threshold {
                state.threshold_reached = true;
                if state.state == StreamState::Buffering {
                    state.state = StreamState::StreamingHttp;
                }
                true
            } else {
                false
            }
        };

        self.shared.stream.notify();
        self.shared.wake.notify();
        if crossed {
            tracing::debug!("stream buffer threshold reached");
            self.shared.emit(PlayerEvent::BufferThreshold);
        }
        for text in metadata {
            tracing::info!(metadata = %text, "stream metadata");
            self.shared.emit(PlayerEvent::Metadata { text });
        }
    }

    fn check_deadline(&mut self) {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::warn!("stream header exchange timed out");
            self.disconnect(DisconnectReason::Timeout);
        }
    }

    fn disconnect(&mut self, reason: DisconnectReason) {
        self.source = None;
        self.deadline = None;
        {
            let mut g = self.shared.stream.lock();
            if g.state.session != self.session || g.state.state.is_ended() {
                return;
            }
            g.state.state = StreamState::Disconnect;
            g.state.disconnect = reason;
        }
        self.shared.stream.notify();
        self.shared.wake.notify();
        self.shared.emit(PlayerEvent::StreamDisconnected { reason });
    }
}

fn connect(addr: &str, timeout: Duration, poll: Duration) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let mut last = io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}"));
    for sa in addrs {
        match TcpStream::connect_timeout(&sa, timeout) {
            Ok(sock) => {
                sock.set_nodelay(true)?;
                sock.set_read_timeout(Some(poll))?;
                sock.set_write_timeout(Some(poll))?;
                return Ok(sock);
            }
            Err(e) => last = e,
        }
    }
    Err(last)
}

fn is_retry(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::config::PlayerConfig;

    struct Harness {
        shared: Arc<Shared>,
        control: StreamControl,
        events: Receiver<PlayerEvent>,
        handle: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn new(config: PlayerConfig) -> Self {
            let (event_tx, events) = unbounded();
            let shared = Arc::new(Shared::new(config, event_tx).unwrap());
            let (cmd_tx, cmd_rx) = unbounded();
            let handle = spawn(shared.clone(), cmd_rx).unwrap();
            Self {
                control: StreamControl::new(shared.clone(), cmd_tx),
                shared,
                events,
                handle: Some(handle),
            }
        }

        fn next_event(&self) -> PlayerEvent {
            self.events
                .recv_timeout(Duration::from_secs(5))
                .expect("event")
        }

        fn buffered(&self) -> Vec<u8> {
            let g = self.shared.stream.lock();
            let mut out = vec![0; g.buf.used()];
            g.buf.peek_into(&mut out);
            out
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shared.stop();
            if let Some(h) = self.handle.take() {
                let _ = h.join();
            }
        }
    }

    fn serve_once(response: Vec<u8>) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                if sock.read(&mut byte).unwrap() == 0 {
                    break;
                }
                request.push(byte[0]);
            }
            sock.write_all(&response).unwrap();
            String::from_utf8(request).unwrap()
        });
        (addr, handle)
    }

    #[test]
    fn http_stream_buffers_body_and_reports_edges() {
        let body: Vec<u8> = (0..2000u32).map(|v| v as u8).collect();
        let mut response = b"HTTP/1.0 200 OK\r\nContent-Type: audio/L16\r\n\r\n".to_vec();
        response.extend_from_slice(&body);
        let (addr, server) = serve_once(response);

        let h = Harness::new(PlayerConfig::default());
        h.control.connect(
            StreamRequest::new(addr, b"GET /x HTTP/1.0\r\n\r\n".to_vec()).threshold(1000),
        );

        assert_eq!(h.next_event(), PlayerEvent::StreamConnected);
        match h.next_event() {
            PlayerEvent::StreamHeaders { headers } => assert!(headers.contains("audio/L16")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.next_event(), PlayerEvent::BufferThreshold);
        assert_eq!(
            h.next_event(),
            PlayerEvent::StreamDisconnected {
                reason: DisconnectReason::Ok
            }
        );

        assert_eq!(server.join().unwrap(), "GET /x HTTP/1.0\r\n\r\n");
        assert_eq!(h.buffered(), body);
        let g = h.shared.stream.lock();
        assert_eq!(g.state.state, StreamState::Disconnect);
        assert_eq!(g.state.bytes, 2000);
    }

    #[test]
    fn wait_holds_body_until_resume_and_strips_metadata() {
        let mut response = b"ICY 200 OK\r\nicy-metaint: 4\r\n\r\n".to_vec();
        response.extend_from_slice(b"abcd");
        response.push(1);
        let mut meta = b"StreamTitle='t';".to_vec();
        meta.resize(16, 0);
        response.extend_from_slice(&meta);
        response.extend_from_slice(b"ef");
        let (addr, _server) = serve_once(response);

        let h = Harness::new(PlayerConfig::default());
        h.control.connect(
            StreamRequest::new(addr, b"GET / HTTP/1.0\r\n\r\n".to_vec()).wait_for_continue(true),
        );
        assert_eq!(h.next_event(), PlayerEvent::StreamConnected);
        assert!(matches!(h.next_event(), PlayerEvent::StreamHeaders { .. }));

        thread::sleep(Duration::from_millis(200));
        assert_eq!(h.shared.stream.lock().state.state, StreamState::Wait);
        assert!(h.buffered().is_empty());

        assert!(h.control.resume(0));
        assert_eq!(h.next_event(), PlayerEvent::BufferThreshold);
        assert_eq!(
            h.next_event(),
            PlayerEvent::Metadata {
                text: "StreamTitle='t';".into()
            }
        );
        assert!(matches!(h.next_event(), PlayerEvent::StreamDisconnected { .. }));
        assert_eq!(h.buffered(), b"abcdef");
    }

    #[test]
    fn refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let h = Harness::new(PlayerConfig::default());
        h.control.connect(StreamRequest::new(addr, b"GET / HTTP/1.0\r\n\r\n".to_vec()));
        assert_eq!(
            h.next_event(),
            PlayerEvent::StreamDisconnected {
                reason: DisconnectReason::Unreachable
            }
        );
        assert_eq!(h.shared.stream.lock().state.state, StreamState::Disconnect);
    }

    #[test]
    fn silent_server_times_out_header_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _keep = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(sock);
        });

        let h = Harness::new(PlayerConfig::default());
        h.control.connect(
            StreamRequest::new(addr, b"GET / HTTP/1.0\r\n\r\n".to_vec())
                .timeout(Duration::from_millis(300)),
        );
        assert_eq!(h.next_event(), PlayerEvent::StreamConnected);
        assert_eq!(
            h.next_event(),
            PlayerEvent::StreamDisconnected {
                reason: DisconnectReason::Timeout
            }
        );
    }

    #[test]
    fn local_file_streams_to_end() {
        let path = std::env::temp_dir().join(format!("netplayer-stream-{}.bin", std::process::id()));
        std::fs::write(&path, vec![7u8; 5000]).unwrap();

        let h = Harness::new(PlayerConfig::default());
        h.control.open_file(path.clone(), 100);
        assert_eq!(h.next_event(), PlayerEvent::StreamConnected);
        assert_eq!(h.next_event(), PlayerEvent::BufferThreshold);
        assert_eq!(
            h.next_event(),
            PlayerEvent::StreamDisconnected {
                reason: DisconnectReason::Ok
            }
        );
        assert_eq!(h.buffered().len(), 5000);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_is_unreachable() {
        let h = Harness::new(PlayerConfig::default());
        h.control.open_file(PathBuf::from("/nonexistent/netplayer/track.flac"), 0);
        assert_eq!(
            h.next_event(),
            PlayerEvent::StreamDisconnected {
                reason: DisconnectReason::Unreachable
            }
        );
    }

    #[test]
    fn local_disconnect_discards_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _keep = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(sock);
        });

        let h = Harness::new(PlayerConfig::default());
        assert!(!h.control.disconnect());
        h.control.connect(StreamRequest::new(addr, b"GET / HTTP/1.0\r\n\r\n".to_vec()));
        assert_eq!(h.next_event(), PlayerEvent::StreamConnected);
        let session = h.shared.stream.lock().state.session;

        assert!(h.control.disconnect());
        assert_eq!(
            h.next_event(),
            PlayerEvent::StreamDisconnected {
                reason: DisconnectReason::Local
            }
        );
        let g = h.shared.stream.lock();
        assert_eq!(g.state.state, StreamState::Stopped);
        assert_eq!(g.state.disconnect, DisconnectReason::Local);
        assert!(g.state.session > session);
    }
}
