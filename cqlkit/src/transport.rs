//! This module contains a declaration of `CqlTransport` trait which should be implemented
//! for particular transport in order to be able using it as a connection of the driver.
//!
//! [`TransportTcp`] is the default transport: a single TCP connection multiplexing many
//! concurrent requests by stream id.
use futures::FutureExt;
use fxhash::FxHashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::*;

#[cfg(test)]
use mockall::*;

use crate::cluster::KeyspaceHolder;
use crate::envelope_parser::parse_envelope;
use crate::future::BoxFuture;
use crate::Error;
use crate::Result;
use cqlkit_protocol::codec::MessageCodec;
use cqlkit_protocol::frame::events::ServerEvent;
use cqlkit_protocol::frame::message_request::RequestBody;
use cqlkit_protocol::frame::message_response::ResponseBody;
use cqlkit_protocol::frame::{Envelope, StreamId, Version, EVENT_STREAM_ID};

/// Default number of concurrent requests a single connection can carry.
pub const DEFAULT_MAX_REQUESTS_PER_CONNECTION: usize = 1024;

/// General transport trait: a single connection to a node.
pub trait CqlTransport: Send + Sync {
    /// Sends a request and waits for its response. Server errors are returned as
    /// `Error::Server`.
    fn write_request<'a>(&'a self, request: &'a RequestBody) -> BoxFuture<'a, Result<ResponseBody>>;

    /// Checks if the connection is broken (e.g. after read or write errors)
    fn is_broken(&self) -> bool;

    /// Returns associated node address
    fn address(&self) -> SocketAddr;

    /// Number of requests awaiting a response.
    fn in_flight(&self) -> usize;

    /// Protocol version used by this connection.
    fn version(&self) -> Version;

    /// Closes the connection. Pending requests fail with a connection error.
    fn close(&self);
}

#[cfg(test)]
mock! {
    pub CqlTransport {
    }

    impl CqlTransport for CqlTransport {
        fn write_request(&self, request: &RequestBody) -> BoxFuture<'static, Result<ResponseBody>>;

        fn is_broken(&self) -> bool;

        fn address(&self) -> SocketAddr;

        fn in_flight(&self) -> usize;

        fn version(&self) -> Version;

        fn close(&self);
    }
}

/// Options shared by all connections created by a connection manager.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub codec: Arc<dyn MessageCodec>,
    pub buffer_size: usize,
    pub tcp_nodelay: bool,
    pub max_requests_per_connection: usize,
}

/// Default Tcp transport.
pub struct TransportTcp {
    inner: AsyncTransport,
}

impl TransportTcp {
    pub async fn new(
        addr: SocketAddr,
        version: Version,
        keyspace_holder: Arc<KeyspaceHolder>,
        event_handler: Option<mpsc::Sender<ServerEvent>>,
        error_handler: Option<mpsc::Sender<Error>>,
        options: &TransportOptions,
    ) -> io::Result<TransportTcp> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(options.tcp_nodelay)?;

        Ok(TransportTcp {
            inner: AsyncTransport::new(
                addr,
                version,
                socket,
                event_handler,
                error_handler,
                keyspace_holder,
                options,
            ),
        })
    }
}

impl CqlTransport for TransportTcp {
    #[inline]
    fn write_request<'a>(&'a self, request: &'a RequestBody) -> BoxFuture<'a, Result<ResponseBody>> {
        self.inner.write_request(request).boxed()
    }

    #[inline]
    fn is_broken(&self) -> bool {
        self.inner.is_broken()
    }

    #[inline]
    fn address(&self) -> SocketAddr {
        self.inner.addr
    }

    #[inline]
    fn in_flight(&self) -> usize {
        self.inner.stream_ids.in_flight()
    }

    #[inline]
    fn version(&self) -> Version {
        self.inner.version
    }

    #[inline]
    fn close(&self) {
        self.inner.close();
    }
}

/// Bounded set of stream ids. Ids return to the pool only when their response arrives (or the
/// connection dies), so a late response can never be matched with a newer request. Ids of
/// abandoned requests are orphaned: still reserved, but no longer counted as in flight.
struct StreamIdPool {
    capacity: usize,
    free: Mutex<Vec<StreamId>>,
    orphaned: AtomicUsize,
}

impl StreamIdPool {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, StreamId::MAX as usize);
        StreamIdPool {
            capacity,
            free: Mutex::new((0..capacity as StreamId).rev().collect()),
            orphaned: AtomicUsize::new(0),
        }
    }

    fn free_ids(&self) -> MutexGuard<'_, Vec<StreamId>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn acquire(&self) -> Option<StreamId> {
        self.free_ids().pop()
    }

    #[inline]
    fn release(&self, stream_id: StreamId) {
        self.free_ids().push(stream_id);
    }

    #[inline]
    fn in_flight(&self) -> usize {
        let reserved = self.capacity - self.free_ids().len();
        reserved.saturating_sub(self.orphaned.load(Ordering::Relaxed))
    }

    /// More than half of the ids wait for responses nobody needs.
    #[inline]
    fn has_too_many_orphans(&self) -> bool {
        self.orphaned.load(Ordering::Relaxed) > self.capacity / 2
    }
}

/// Orphans the stream id of a request whose future is dropped before the response arrives,
/// e.g. on timeout or when another speculative execution wins.
struct OrphanGuard<'a> {
    transport: Option<&'a AsyncTransport>,
    stream_id: StreamId,
}

impl OrphanGuard<'_> {
    #[inline]
    fn disarm(mut self) {
        self.transport = None;
    }
}

impl Drop for OrphanGuard<'_> {
    fn drop(&mut self) {
        if let Some(transport) = self.transport {
            transport.orphan(self.stream_id);
        }
    }
}

struct AsyncTransport {
    addr: SocketAddr,
    version: Version,
    codec: Arc<dyn MessageCodec>,
    write_sender: mpsc::Sender<Vec<u8>>,
    is_broken: Arc<AtomicBool>,
    stream_ids: Arc<StreamIdPool>,
    response_handler_map: Arc<ResponseHandlerMap>,
    keyspace_holder: Arc<KeyspaceHolder>,
    too_many_orphans: Arc<Notify>,
    processing_handle: JoinHandle<()>,
}

impl Drop for AsyncTransport {
    fn drop(&mut self) {
        self.processing_handle.abort();
    }
}

impl AsyncTransport {
    fn new<T: AsyncRead + AsyncWrite + Send + 'static>(
        addr: SocketAddr,
        version: Version,
        stream: T,
        event_handler: Option<mpsc::Sender<ServerEvent>>,
        error_handler: Option<mpsc::Sender<Error>>,
        keyspace_holder: Arc<KeyspaceHolder>,
        options: &TransportOptions,
    ) -> Self {
        let (read_half, write_half) = split(stream);
        let (write_sender, write_receiver) = mpsc::channel(options.buffer_size.max(1));
        let is_broken = Arc::new(AtomicBool::new(false));
        let stream_ids = Arc::new(StreamIdPool::new(options.max_requests_per_connection));
        let response_handler_map = Arc::new(ResponseHandlerMap::new(addr, stream_ids.clone()));
        let too_many_orphans = Arc::new(Notify::new());

        let processing_handle = tokio::spawn(Self::start_processing(
            addr,
            write_receiver,
            event_handler,
            error_handler,
            read_half,
            write_half,
            is_broken.clone(),
            response_handler_map.clone(),
            options.codec.clone(),
            too_many_orphans.clone(),
        ));

        AsyncTransport {
            addr,
            version,
            codec: options.codec.clone(),
            write_sender,
            is_broken,
            stream_ids,
            response_handler_map,
            keyspace_holder,
            too_many_orphans,
            processing_handle,
        }
    }

    #[inline]
    fn is_broken(&self) -> bool {
        self.is_broken.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.is_broken.store(true, Ordering::Relaxed);
        self.processing_handle.abort();
        self.response_handler_map.signal_error(&Error::ConnectionClosed(self.addr));
    }

    /// Stops counting an abandoned request. A connection collecting too many orphans is shut
    /// down, so its owner can replace it.
    fn orphan(&self, stream_id: StreamId) {
        if !self.response_handler_map.orphan(stream_id) {
            return;
        }

        trace!(stream_id, addr = %self.addr, "Orphaned stream id.");

        if self.stream_ids.has_too_many_orphans()
            && !self.is_broken.swap(true, Ordering::Relaxed)
        {
            warn!(addr = %self.addr, "Too many orphaned stream ids, closing connection.");
            self.too_many_orphans.notify_one();
        }
    }

    async fn write_request(&self, request: &RequestBody) -> Result<ResponseBody> {
        if self.is_broken() {
            return Err(Error::ConnectionClosed(self.addr));
        }

        let version = self.version;
        let body = self.codec.encode_request(request, version)?;

        let permit = self
            .write_sender
            .reserve()
            .await
            .map_err(|_| Error::ConnectionClosed(self.addr))?;

        // no suspension point from here until the handler is registered
        let stream_id = self.stream_ids.acquire().ok_or(Error::Busy(self.addr))?;

        let mut envelope = Envelope::new_request(version, request.opcode(), body);
        envelope.stream_id = stream_id;

        let data = match envelope.encode() {
            Ok(data) => data,
            Err(error) => {
                self.stream_ids.release(stream_id);
                return Err(error);
            }
        };

        let (sender, receiver) = oneshot::channel();
        self.response_handler_map.add_handler(stream_id, sender);
        permit.send(data);

        let orphan_guard = OrphanGuard {
            transport: Some(self),
            stream_id,
        };

        let envelope = receiver.await;
        orphan_guard.disarm();

        let envelope = envelope.map_err(|_| Error::ConnectionClosed(self.addr))??;

        let response =
            self.codec
                .decode_response(envelope.opcode, &envelope.body, envelope.version)?;

        match response {
            ResponseBody::Error(body) => Err(Error::Server {
                body,
                addr: self.addr,
            }),
            response => {
                if let Some(set_keyspace) = response.as_set_keyspace() {
                    self.keyspace_holder
                        .update_current_keyspace(set_keyspace.body.clone());
                }

                Ok(response)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_processing<T: AsyncRead + AsyncWrite>(
        addr: SocketAddr,
        write_receiver: mpsc::Receiver<Vec<u8>>,
        event_handler: Option<mpsc::Sender<ServerEvent>>,
        error_handler: Option<mpsc::Sender<Error>>,
        read_half: ReadHalf<T>,
        write_half: WriteHalf<T>,
        is_broken: Arc<AtomicBool>,
        response_handler_map: Arc<ResponseHandlerMap>,
        codec: Arc<dyn MessageCodec>,
        too_many_orphans: Arc<Notify>,
    ) {
        let writer = Self::start_writing(write_receiver, BufWriter::new(write_half));
        let reader = Self::start_reading(read_half, event_handler, codec, &response_handler_map);
        let orphans = async {
            too_many_orphans.notified().await;
            Err::<(), _>(Error::General("Too many orphaned stream ids".into()))
        };

        let error = match tokio::try_join!(writer, reader, orphans) {
            Ok(_) => Error::ConnectionClosed(addr),
            Err(error) => error,
        };

        error!(%error, %addr, "Transport error!");

        is_broken.store(true, Ordering::Relaxed);
        response_handler_map.signal_error(&Error::ConnectionClosed(addr));

        if let Some(error_handler) = error_handler {
            let _ = error_handler.send(error).await;
        }
    }

    async fn start_reading<T: AsyncRead>(
        mut read_half: ReadHalf<T>,
        event_handler: Option<mpsc::Sender<ServerEvent>>,
        codec: Arc<dyn MessageCodec>,
        response_handler_map: &ResponseHandlerMap,
    ) -> Result<()> {
        loop {
            let envelope = parse_envelope(&mut read_half).await?;
            if envelope.stream_id >= 0 {
                // normal response to query
                response_handler_map.send_response(envelope.stream_id, Ok(envelope));
            } else if envelope.stream_id == EVENT_STREAM_ID {
                // server event
                let Some(event_handler) = &event_handler else {
                    continue;
                };

                match codec
                    .decode_response(envelope.opcode, &envelope.body, envelope.version)
                    .map(ResponseBody::into_server_event)
                {
                    Ok(Some(event)) => {
                        let _ = event_handler.send(event).await;
                    }
                    Ok(None) => warn!("Non-event message received on event stream."),
                    Err(error) => warn!(%error, "Cannot decode server event."),
                }
            }
        }
    }

    async fn start_writing(
        mut write_receiver: mpsc::Receiver<Vec<u8>>,
        mut write_half: impl AsyncWrite + Unpin,
    ) -> Result<()> {
        while let Some(mut data) = write_receiver.recv().await {
            loop {
                write_half.write_all(&data).await?;

                data = match write_receiver.try_recv() {
                    Ok(data) => data,
                    Err(_) => break,
                }
            }

            write_half.flush().await?;
        }

        Ok(())
    }
}

type ResponseHandler = oneshot::Sender<Result<Envelope>>;

enum StreamHandler {
    Waiting(ResponseHandler),
    Orphaned,
}

struct ResponseHandlerMap {
    addr: SocketAddr,
    stream_ids: Arc<StreamIdPool>,
    stream_handlers: Mutex<FxHashMap<StreamId, StreamHandler>>,
}

impl ResponseHandlerMap {
    fn new(addr: SocketAddr, stream_ids: Arc<StreamIdPool>) -> Self {
        ResponseHandlerMap {
            addr,
            stream_ids,
            stream_handlers: Default::default(),
        }
    }

    fn handlers(&self) -> MutexGuard<'_, FxHashMap<StreamId, StreamHandler>> {
        self.stream_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn add_handler(&self, stream_id: StreamId, handler: ResponseHandler) {
        self.handlers().insert(stream_id, StreamHandler::Waiting(handler));
    }

    /// Drops the handler of a pending request, keeping its stream id reserved until the
    /// response arrives. Returns false if the request is not pending anymore.
    fn orphan(&self, stream_id: StreamId) -> bool {
        let mut handlers = self.handlers();
        match handlers.get_mut(&stream_id) {
            Some(handler) if matches!(handler, StreamHandler::Waiting(_)) => {
                *handler = StreamHandler::Orphaned;
                self.stream_ids.orphaned.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    fn send_response(&self, stream_id: StreamId, response: Result<Envelope>) {
        let handler = self.handlers().remove(&stream_id);
        match handler {
            Some(handler) => self.release(stream_id, handler, response),
            None => warn!(stream_id, addr = %self.addr, "Unmatched stream id."),
        }
    }

    fn signal_error(&self, error: &Error) {
        let handlers: Vec<_> = self.handlers().drain().collect();
        for (stream_id, handler) in handlers {
            self.release(stream_id, handler, Err(error.clone()));
        }
    }

    fn release(&self, stream_id: StreamId, handler: StreamHandler, response: Result<Envelope>) {
        self.stream_ids.release(stream_id);

        match handler {
            StreamHandler::Waiting(handler) => {
                // the requester might be gone in the meantime
                let _ = handler.send(response);
            }
            StreamHandler::Orphaned => {
                self.stream_ids.orphaned.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    use super::*;
    use cqlkit_protocol::codec::JsonCodec;
    use cqlkit_protocol::frame::events::{StatusChange, StatusChangeType};
    use cqlkit_protocol::frame::message_error::{AdditionalErrorInfo, ErrorBody};
    use cqlkit_protocol::frame::message_response::BodyResEvent;
    use cqlkit_protocol::frame::message_result::BodyResResultRows;
    use cqlkit_protocol::frame::{Opcode, HEADER_LEN};
    use cqlkit_protocol::query::QueryParams;
    use cqlkit_protocol::types::Value;

    fn addr() -> SocketAddr {
        "127.0.0.1:9042".parse().unwrap()
    }

    fn options(max_requests_per_connection: usize) -> TransportOptions {
        TransportOptions {
            codec: Arc::new(JsonCodec),
            buffer_size: 16,
            tcp_nodelay: true,
            max_requests_per_connection,
        }
    }

    fn transport(
        max_requests_per_connection: usize,
        event_handler: Option<mpsc::Sender<ServerEvent>>,
    ) -> (AsyncTransport, DuplexStream, Arc<KeyspaceHolder>) {
        let (client, server) = duplex(64 * 1024);
        let keyspace_holder = Arc::new(KeyspaceHolder::default());
        let transport = AsyncTransport::new(
            addr(),
            Version::V4,
            client,
            event_handler,
            None,
            keyspace_holder.clone(),
            &options(max_requests_per_connection),
        );

        (transport, server, keyspace_holder)
    }

    async fn read_query(server: &mut DuplexStream) -> (StreamId, String) {
        let envelope = parse_envelope(server).await.unwrap();
        let request = JsonCodec
            .decode_request(envelope.opcode, &envelope.body, envelope.version)
            .unwrap();

        match request {
            RequestBody::Query(query) => (envelope.stream_id, query.query),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    async fn respond(server: &mut DuplexStream, stream_id: StreamId, response: ResponseBody) {
        let body = JsonCodec.encode_response(&response, Version::V4).unwrap();
        let envelope = Envelope::new_response(Version::V4, response.opcode(), stream_id, body);
        server.write_all(&envelope.encode().unwrap()).await.unwrap();
    }

    fn rows_with(text: &str) -> ResponseBody {
        ResponseBody::rows(BodyResResultRows::new(
            vec!["value".into()],
            vec![vec![Value::Text(text.into())]],
        ))
    }

    fn query(text: &str) -> RequestBody {
        RequestBody::new_query(text, QueryParams::default())
    }

    #[tokio::test]
    async fn should_correlate_out_of_order_responses() {
        let (transport, mut server, _) = transport(8, None);

        let first_request = query("first");
        let second_request = query("second");
        let first = transport.write_request(&first_request);
        let second = transport.write_request(&second_request);

        let server_task = async {
            let (first_id, first_text) = read_query(&mut server).await;
            let (second_id, second_text) = read_query(&mut server).await;

            // answer in reverse order
            respond(&mut server, second_id, rows_with(&second_text)).await;
            respond(&mut server, first_id, rows_with(&first_text)).await;
            server
        };

        let (first, second, _server) = tokio::join!(first, second, server_task);

        let first = first.unwrap().into_rows().unwrap();
        let second = second.unwrap().into_rows().unwrap();
        assert_eq!(first[0].get_r_by_name::<String>("value").unwrap(), "first");
        assert_eq!(second[0].get_r_by_name::<String>("value").unwrap(), "second");
        assert_eq!(transport.stream_ids.in_flight(), 0);
    }

    #[tokio::test]
    async fn should_fail_with_busy_when_stream_ids_are_exhausted() {
        let (transport, mut server, _) = transport(1, None);

        let first_request = query("first");
        let mut first = std::pin::pin!(transport.write_request(&first_request));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut first)
                .await
                .is_err()
        );

        // first request still pending and holding the only stream id
        assert_eq!(transport.stream_ids.in_flight(), 1);
        let second = transport.write_request(&query("second")).await;
        assert!(matches!(second, Err(Error::Busy(_))));

        let (stream_id, _) = read_query(&mut server).await;
        respond(&mut server, stream_id, ResponseBody::void()).await;
        assert!(first.await.is_ok());
    }

    #[tokio::test]
    async fn should_map_server_errors() {
        let (transport, mut server, _) = transport(8, None);

        let request = query("overloaded");
        let response = transport.write_request(&request);
        let server_task = async {
            let (stream_id, _) = read_query(&mut server).await;
            respond(
                &mut server,
                stream_id,
                ResponseBody::Error(ErrorBody::new("busy", AdditionalErrorInfo::Overloaded)),
            )
            .await;
        };

        let (response, _) = tokio::join!(response, server_task);
        match response {
            Err(Error::Server { body, addr: error_addr }) => {
                assert_eq!(body.additional_info, AdditionalErrorInfo::Overloaded);
                assert_eq!(error_addr, addr());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn should_fail_pending_requests_when_connection_drops() {
        let (transport, mut server, _) = transport(8, None);

        let request = query("pending");
        let response = transport.write_request(&request);
        let server_task = async {
            let mut header = [0; HEADER_LEN];
            tokio::io::AsyncReadExt::read_exact(&mut server, &mut header)
                .await
                .unwrap();
            drop(server);
        };

        let (response, _) = tokio::join!(response, server_task);
        assert!(matches!(response, Err(Error::ConnectionClosed(_))));

        // reader notices the closed stream asynchronously
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(transport.is_broken());
        assert!(matches!(
            transport.write_request(&query("after")).await,
            Err(Error::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn should_forward_events() {
        let (event_sender, mut event_receiver) = mpsc::channel(4);
        let (_transport, mut server, _) = transport(8, Some(event_sender));

        let event = ServerEvent::StatusChange(StatusChange {
            change_type: StatusChangeType::Down,
            addr: addr(),
        });
        respond(
            &mut server,
            EVENT_STREAM_ID,
            ResponseBody::Event(BodyResEvent {
                event: event.clone(),
            }),
        )
        .await;

        assert_eq!(event_receiver.recv().await, Some(event));
    }

    #[tokio::test]
    async fn should_track_keyspace_changes() {
        use cqlkit_protocol::frame::message_result::{BodyResResultSetKeyspace, ResResultBody};

        let (transport, mut server, keyspace_holder) = transport(8, None);

        let request = query("USE ks");
        let response = transport.write_request(&request);
        let server_task = async {
            let (stream_id, _) = read_query(&mut server).await;
            respond(
                &mut server,
                stream_id,
                ResponseBody::Result(ResResultBody::SetKeyspace(BodyResResultSetKeyspace {
                    body: "ks".into(),
                })),
            )
            .await;
        };

        let (response, _) = tokio::join!(response, server_task);
        assert!(response.is_ok());
        assert_eq!(
            keyspace_holder.current_keyspace().as_deref().map(String::as_str),
            Some("ks")
        );
        assert_eq!(Opcode::Result, response.unwrap().opcode());
    }

    #[tokio::test]
    async fn should_not_count_abandoned_request_as_in_flight() {
        let (transport, mut server, _) = transport(8, None);

        let request = query("abandoned");
        assert!(
            tokio::time::timeout(Duration::from_millis(20), transport.write_request(&request))
                .await
                .is_err()
        );
        assert_eq!(transport.stream_ids.in_flight(), 0);

        // the id stays reserved, so the late response cannot reach another request
        let (stream_id, _) = read_query(&mut server).await;
        assert_eq!(transport.stream_ids.free_ids().len(), 7);

        respond(&mut server, stream_id, ResponseBody::void()).await;

        let next_request = query("next");
        let next = transport.write_request(&next_request);
        let server_task = async {
            let (next_id, _) = read_query(&mut server).await;
            respond(&mut server, next_id, ResponseBody::void()).await;
        };

        let (next, _) = tokio::join!(next, server_task);
        assert!(next.is_ok());
        assert!(!transport.is_broken());
        assert_eq!(transport.stream_ids.free_ids().len(), 8);
        assert_eq!(transport.stream_ids.orphaned.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn should_close_connection_with_too_many_orphans() {
        let (client, _server) = duplex(64 * 1024);
        let (error_sender, mut error_receiver) = mpsc::channel(1);
        let transport = AsyncTransport::new(
            addr(),
            Version::V4,
            client,
            None,
            Some(error_sender),
            Arc::new(KeyspaceHolder::default()),
            &options(2),
        );

        let first = query("first");
        let second = query("second");
        for request in [&first, &second] {
            assert!(
                tokio::time::timeout(Duration::from_millis(20), transport.write_request(request))
                    .await
                    .is_err()
            );
        }

        assert!(transport.is_broken());
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(1), error_receiver.recv()).await,
            Ok(Some(Error::General(_)))
        ));

        // pending ids are released along with the connection
        assert_eq!(transport.stream_ids.free_ids().len(), 2);
        assert!(matches!(
            transport.write_request(&query("after")).await,
            Err(Error::ConnectionClosed(_))
        ));
    }
}
