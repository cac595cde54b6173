//! The serving front of the DNS server.
//!
//! Over a kernel-bound tunnel the resolver owns a real UDP listener bound on
//! the overlay address. Over a userspace-bound tunnel no socket exists; the
//! tunnel delivers query packets straight into the in-memory service.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::Record;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use hickory_server::ServerFuture;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::{lookup_handler, QueryMux};

/// Builds a response to `query` carrying `answers`.
pub(crate) fn response_from(query: &Message, code: ResponseCode, answers: Vec<Record>) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(code);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response.add_answers(answers);
    response
}

/// Resolves `query` against the registered zones.
pub(crate) async fn serve_message(mux: &QueryMux, query: &Message) -> Message {
    let Some(question) = query.queries().first() else {
        return response_from(query, ResponseCode::FormErr, Vec::new());
    };
    match lookup_handler(mux, &question.name().to_utf8()) {
        Some(handler) => handler.handle(query).await,
        None => response_from(query, ResponseCode::Refused, Vec::new()),
    }
}

/// The serving front: a UDP listener or an in-memory service.
pub(crate) enum DnsService {
    Listener(ListenerService),
    Memory(MemoryService),
}

impl DnsService {
    pub(crate) fn mux(&self) -> &QueryMux {
        match self {
            DnsService::Listener(s) => &s.mux,
            DnsService::Memory(s) => &s.mux,
        }
    }

    /// The address host DNS config points clients at.
    pub(crate) fn runtime_addr(&self) -> SocketAddr {
        match self {
            DnsService::Listener(s) => s.runtime_addr(),
            DnsService::Memory(s) => s.addr,
        }
    }

    /// Starts serving. Idempotent; the in-memory service is always ready.
    pub(crate) async fn listen(&self) -> Result<()> {
        match self {
            DnsService::Listener(s) => s.listen().await,
            DnsService::Memory(_) => Ok(()),
        }
    }

    pub(crate) async fn stop_listening(&self) {
        if let DnsService::Listener(s) = self {
            s.stop_listening().await;
        }
    }
}

/// UDP listener front, served by hickory.
pub(crate) struct ListenerService {
    mux: QueryMux,
    addr: SocketAddr,
    bound: Mutex<Option<SocketAddr>>,
    server: tokio::sync::Mutex<Option<ServerFuture<MuxRequestHandler>>>,
}

impl ListenerService {
    pub(crate) fn new(mux: QueryMux, addr: SocketAddr) -> Self {
        ListenerService {
            mux,
            addr,
            bound: Mutex::new(None),
            server: tokio::sync::Mutex::new(None),
        }
    }

    fn runtime_addr(&self) -> SocketAddr {
        self.bound.lock().unwrap().unwrap_or(self.addr)
    }

    async fn listen(&self) -> Result<()> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind(self.addr)
            .await
            .with_context(|| format!("binding DNS listener on {}", self.addr))?;
        let local = socket.local_addr()?;
        *self.bound.lock().unwrap() = Some(local);

        let mut fut = ServerFuture::new(MuxRequestHandler {
            mux: self.mux.clone(),
        });
        fut.register_socket(socket);
        *server = Some(fut);
        debug!(%local, "DNS listener up");
        Ok(())
    }

    async fn stop_listening(&self) {
        let mut server = self.server.lock().await;
        if let Some(mut fut) = server.take() {
            if let Err(err) = fut.shutdown_gracefully().await {
                warn!("DNS listener shutdown: {err}");
            }
            debug!("DNS listener stopped");
        }
    }
}

/// In-memory front for userspace-bound tunnels: no socket, queries arrive as
/// packets through [`InMemoryDnsHandle`].
pub(crate) struct MemoryService {
    mux: QueryMux,
    /// The fake resolver address advertised to the host.
    addr: SocketAddr,
}

impl MemoryService {
    pub(crate) fn new(mux: QueryMux, addr: SocketAddr) -> Self {
        MemoryService { mux, addr }
    }

    pub(crate) fn handle(&self) -> InMemoryDnsHandle {
        InMemoryDnsHandle {
            mux: self.mux.clone(),
        }
    }
}

/// Resolves DNS query packets without a socket.
///
/// A userspace tunnel hands packets destined to the resolver address here
/// and writes the response bytes back into the tunnel.
#[derive(Clone)]
pub struct InMemoryDnsHandle {
    mux: QueryMux,
}

impl std::fmt::Debug for InMemoryDnsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDnsHandle").finish_non_exhaustive()
    }
}

impl InMemoryDnsHandle {
    /// Resolves one query message.
    pub async fn query(&self, query: &Message) -> Message {
        serve_message(&self.mux, query).await
    }

    /// Resolves one raw query packet.
    pub async fn query_bytes(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let query = Message::from_vec(packet).context("decoding query packet")?;
        let response = self.query(&query).await;
        response.to_vec().context("encoding response packet")
    }
}

/// Dispatches hickory requests into the zone multiplexer.
#[derive(Clone)]
pub(crate) struct MuxRequestHandler {
    mux: QueryMux,
}

#[async_trait]
impl RequestHandler for MuxRequestHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let query = request_to_message(request);
        let response = serve_message(&self.mux, &query).await;

        let mut header = Header::response_from_request(request.header());
        header.set_response_code(response.response_code());
        header.set_recursion_available(true);

        let answers: Vec<Record> = response.answers().to_vec();
        let empty: Vec<Record> = Vec::new();
        let builder = MessageResponseBuilder::from_message_request(request);
        let message = builder.build(
            header,
            answers.iter(),
            empty.iter(),
            empty.iter(),
            empty.iter(),
        );

        match response_handle.send_response(message).await {
            Ok(info) => info,
            Err(err) => {
                warn!("failed sending DNS response: {err}");
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

fn request_to_message(request: &Request) -> Message {
    let mut msg = Message::new();
    msg.set_id(request.header().id());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(request.header().op_code());
    msg.set_recursion_desired(request.header().recursion_desired());
    msg.add_query(request.query().original().clone());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{LocalResolver, ZoneHandler};
    use crate::netmap::{RecordClass, RecordType as WireType, SimpleRecord};
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};

    fn mux_with_zone(zone: &str, records: Vec<SimpleRecord>) -> QueryMux {
        let mux: QueryMux = Default::default();
        let resolver = Arc::new(LocalResolver::default());
        resolver.replace_records(records);
        mux.write()
            .unwrap()
            .insert(zone.to_string(), ZoneHandler::Local(resolver));
        mux
    }

    fn a_record(name: &str, addr: &str) -> SimpleRecord {
        SimpleRecord {
            name: name.to_string(),
            record_type: WireType::A,
            class: RecordClass::IN,
            ttl: 300,
            rdata: addr.to_string(),
        }
    }

    fn query(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(77);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_utf8(name).unwrap(), RecordType::A));
        msg
    }

    #[tokio::test]
    async fn test_memory_service_resolves() {
        let mux = mux_with_zone(
            "corp.example.",
            vec![a_record("db.corp.example.", "100.64.0.30")],
        );
        let service = MemoryService::new(mux, "100.64.0.254:53".parse().unwrap());
        let handle = service.handle();

        let response = handle.query(&query("db.corp.example.")).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);

        let response = handle.query(&query("nothere.test.")).await;
        assert_eq!(response.response_code(), ResponseCode::Refused);
    }

    #[tokio::test]
    async fn test_memory_service_packet_roundtrip() {
        let mux = mux_with_zone(
            "corp.example.",
            vec![a_record("db.corp.example.", "100.64.0.30")],
        );
        let service = MemoryService::new(mux, "100.64.0.254:53".parse().unwrap());
        let handle = service.handle();

        let packet = query("db.corp.example.").to_vec().unwrap();
        let response = handle.query_bytes(&packet).await.unwrap();
        let parsed = Message::from_vec(&response).unwrap();
        assert_eq!(parsed.id(), 77);
        assert_eq!(parsed.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_listener_serves_over_udp() {
        let mux = mux_with_zone(
            "corp.example.",
            vec![a_record("db.corp.example.", "100.64.0.30")],
        );
        let service = ListenerService::new(mux, "127.0.0.1:0".parse().unwrap());
        service.listen().await.unwrap();
        let addr = service.runtime_addr();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = query("db.corp.example.").to_vec().unwrap();
        client.send_to(&packet, addr).await.unwrap();

        let mut buf = vec![0u8; 1500];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        let response = Message::from_vec(&buf[..len]).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);

        service.stop_listening().await;
    }
}
