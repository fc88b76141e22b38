//! DNS server for cluster name records.
//!
//! Listens on UDP and TCP and answers queries as follows:
//!
//! * **Single-label names**: endpoint and service names. Answered from the
//!   name records the agent maintains on every network, as an A or AAAA
//!   record depending on the address family.
//! * **FQDNs**: forwarded to the system resolvers through
//!   `hickory-resolver`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, ResponseCode};
use hickory_server::proto::rr::rdata::{A, AAAA};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use hickory_server::server::{
    Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture,
};
use log::{error, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Duration;

use crate::controller::Controller;

/// Timeout for idle TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// TTL of records answered from local name records.
const LOCAL_TTL: u32 = 5;
/// TTL of forwarded answers.
const FORWARD_TTL: u32 = 60;

/// Start the DNS server.
pub async fn run_dns_server(
    bind_addr: SocketAddr,
    controller: Arc<Controller>,
) -> anyhow::Result<()> {
    info!("DNS server starting on {}", bind_addr);

    let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
    let handler = ClusterDns { controller, resolver };
    let mut server = ServerFuture::new(handler);

    let udp = UdpSocket::bind(bind_addr).await?;
    server.register_socket(udp);

    let tcp = TcpListener::bind(bind_addr).await?;
    server.register_listener(tcp, TCP_TIMEOUT);

    server.block_until_done().await?;
    Ok(())
}

struct ClusterDns {
    controller: Arc<Controller>,
    resolver: TokioAsyncResolver,
}

/// Convert an address into a record when it matches the query type.
fn answer(name: &Name, ip: IpAddr, qtype: RecordType, ttl: u32) -> Option<Record> {
    match (ip, qtype) {
        (IpAddr::V4(v4), RecordType::A | RecordType::ANY) => {
            Some(Record::from_rdata(name.clone(), ttl, RData::A(A(v4))))
        }
        (IpAddr::V6(v6), RecordType::AAAA | RecordType::ANY) => {
            Some(Record::from_rdata(name.clone(), ttl, RData::AAAA(AAAA(v6))))
        }
        _ => None,
    }
}

async fn respond<R>(
    request: &Request,
    mut response_handle: R,
    header: Header,
    records: &[Record],
) -> ResponseInfo
where
    R: ResponseHandler,
{
    let builder = MessageResponseBuilder::from_message_request(request);
    let response = builder.build(
        header,
        records.iter(),
        std::iter::empty(),
        std::iter::empty(),
        std::iter::empty(),
    );
    match response_handle.send_response(response).await {
        Ok(info) => info,
        Err(e) => {
            error!("Failed to send DNS response: {}", e);
            let mut header = header;
            header.set_response_code(ResponseCode::ServFail);
            header.into()
        }
    }
}

#[async_trait]
impl RequestHandler for ClusterDns {
    async fn handle_request<R>(&self, request: &Request, response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let query = request.query();
        let name: Name = query.name().clone().into();
        let qname = query.name().to_string().trim_end_matches('.').to_string();
        let qtype = query.query_type();

        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);

        if !qname.contains('.') {
            let records: Vec<Record> = match self.controller.resolve_name(&qname).await {
                Some(ip) => answer(&name, ip, qtype, LOCAL_TTL).into_iter().collect(),
                None => {
                    header.set_response_code(ResponseCode::NXDomain);
                    Vec::new()
                }
            };
            return respond(request, response_handle, header, &records).await;
        }

        let records: Vec<Record> = match self.resolver.lookup_ip(qname.as_str()).await {
            Ok(lookup) => lookup
                .iter()
                .filter_map(|ip| answer(&name, ip, qtype, FORWARD_TTL))
                .collect(),
            Err(e) => {
                warn!("Resolver lookup failed for {}: {}", qname, e);
                header.set_response_code(ResponseCode::ServFail);
                Vec::new()
            }
        };
        respond(request, response_handle, header, &records).await
    }
}
