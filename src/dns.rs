//! Cluster DNS for the local machine.
//!
//! The router pod's `/etc/resolv.conf` supplies the cluster nameserver and
//! search domains. A small UDP forwarder expands short names through the
//! search list the way a pod's resolver would, and the host resolver is
//! pointed at the forwarder for the cluster domains.

use crate::cluster::ClusterApi;
use crate::error::{VpnError, VpnResult};
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::Name;
use hickory_proto::serialize::binary::BinEncodable;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const DNS_PORT: u16 = 53;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DNS_PACKET: usize = 4096;

/// Nameserver, search list and `ndots` from a resolv.conf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvConf {
    pub nameservers: Vec<IpAddr>,
    pub search: Vec<String>,
    pub ndots: usize,
}

impl Default for ResolvConf {
    fn default() -> Self {
        Self {
            nameservers: Vec::new(),
            search: Vec::new(),
            ndots: 1,
        }
    }
}

impl ResolvConf {
    pub fn parse(text: &str) -> Self {
        let mut conf = Self::default();
        for line in text.lines() {
            let line = line.split(['#', ';']).next().unwrap_or("").trim();
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    if let Some(ip) = fields.next().and_then(|s| s.parse().ok()) {
                        conf.nameservers.push(ip);
                    }
                }
                Some("search") | Some("domain") => {
                    conf.search = fields
                        .map(|s| s.trim_end_matches('.').to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
                Some("options") => {
                    for opt in fields {
                        if let Some(n) = opt.strip_prefix("ndots:").and_then(|n| n.parse().ok()) {
                            conf.ndots = n;
                        }
                    }
                }
                _ => {}
            }
        }
        conf
    }

    /// First nameserver on port 53.
    pub fn upstream(&self) -> Option<SocketAddr> {
        self.nameservers
            .first()
            .map(|ip| SocketAddr::new(*ip, DNS_PORT))
    }
}

/// Read resolv.conf from inside `pod`.
pub async fn resolv_conf_from_pod(cluster: &dyn ClusterApi, pod: &str) -> VpnResult<ResolvConf> {
    let command = vec!["cat".to_string(), "/etc/resolv.conf".to_string()];
    let text = cluster.exec(pod, &command).await?;
    let conf = ResolvConf::parse(&text);
    if conf.nameservers.is_empty() {
        return Err(VpnError::config(format!(
            "no nameserver in resolv.conf of pod {}",
            pod
        )));
    }
    Ok(conf)
}

/// Names to try for `name`, in order. Names with fewer than `ndots` dots
/// try the search list first.
pub fn candidate_names(name: &Name, conf: &ResolvConf) -> Vec<Name> {
    let expanded = conf.search.iter().filter_map(|domain| {
        let domain = Name::from_ascii(domain).ok()?;
        let mut base = name.clone();
        base.set_fqdn(false);
        let mut full = base.append_domain(&domain).ok()?;
        full.set_fqdn(true);
        Some(full)
    });

    let mut names = Vec::with_capacity(conf.search.len() + 1);
    // dots = labels - 1
    if (name.num_labels() as usize) <= conf.ndots {
        names.extend(expanded);
        names.push(name.clone());
    } else {
        names.push(name.clone());
        names.extend(expanded);
    }
    names
}

fn proto_error(e: impl std::fmt::Display) -> VpnError {
    VpnError::Protocol(format!("dns: {}", e))
}

// ============================================================================
// Forwarder
// ============================================================================

/// UDP forwarder applying the search list before asking the cluster DNS.
pub struct DnsForwarder {
    socket: Arc<UdpSocket>,
    upstream: SocketAddr,
    conf: Arc<ResolvConf>,
}

impl DnsForwarder {
    pub async fn bind(listen: SocketAddr, upstream: SocketAddr, conf: ResolvConf) -> VpnResult<Self> {
        let socket = UdpSocket::bind(listen).await?;
        log::info!(
            "[dns] forwarding {} -> {}",
            socket.local_addr()?,
            upstream
        );
        Ok(Self {
            socket: Arc::new(socket),
            upstream,
            conf: Arc::new(conf),
        })
    }

    pub fn local_addr(&self) -> VpnResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Answer queries until `token` is cancelled.
    pub async fn serve(&self, token: CancellationToken) -> VpnResult<()> {
        let mut buf = vec![0u8; MAX_DNS_PACKET];
        loop {
            let (n, client) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                r = self.socket.recv_from(&mut buf) => r?,
            };
            let packet = buf[..n].to_vec();
            let socket = self.socket.clone();
            let upstream = self.upstream;
            let conf = self.conf.clone();
            tokio::spawn(async move {
                match resolve(&packet, upstream, &conf).await {
                    Ok(reply) => {
                        if let Err(e) = socket.send_to(&reply, client).await {
                            log::debug!("[dns] reply to {}: {}", client, e);
                        }
                    }
                    Err(e) => log::debug!("[dns] query from {}: {}", client, e),
                }
            });
        }
    }
}

/// Resolve one query packet, trying each candidate name until one has answers.
async fn resolve(packet: &[u8], upstream: SocketAddr, conf: &ResolvConf) -> VpnResult<Vec<u8>> {
    let request = Message::from_vec(packet).map_err(proto_error)?;
    let original = match request.queries().first() {
        Some(q) => q.clone(),
        None => return exchange(packet, upstream).await,
    };

    let mut last = None;
    for name in candidate_names(original.name(), conf) {
        let mut query = original.clone();
        query.set_name(name.clone());
        let mut attempt = request.clone();
        attempt.take_queries();
        attempt.add_query(query);

        let reply = exchange(&attempt.to_vec().map_err(proto_error)?, upstream).await?;
        let mut response = Message::from_vec(&reply).map_err(proto_error)?;
        let answered =
            response.response_code() == ResponseCode::NoError && !response.answers().is_empty();
        restore_question(&mut response, &name, &original);
        last = Some(response);
        if answered {
            log::trace!("[dns] {} answered as {}", original.name(), name);
            break;
        }
    }

    match last {
        Some(response) => response.to_vec().map_err(proto_error),
        None => exchange(packet, upstream).await,
    }
}

/// Put the client's question back and rename answers for the expanded name.
fn restore_question(response: &mut Message, asked: &Name, original: &Query) {
    response.take_queries();
    response.add_query(original.clone());
    let answers = response
        .take_answers()
        .into_iter()
        .map(|mut record| {
            if record.name() == asked {
                record.set_name(original.name().clone());
            }
            record
        })
        .collect::<Vec<_>>();
    response.insert_answers(answers);
}

async fn exchange(packet: &[u8], upstream: SocketAddr) -> VpnResult<Vec<u8>> {
    let bind: SocketAddr = if upstream.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(upstream).await?;
    socket.send(packet).await?;
    let mut buf = vec![0u8; MAX_DNS_PACKET];
    let n = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| VpnError::Timeout(format!("dns upstream {}", upstream)))??;
    buf.truncate(n);
    Ok(buf)
}

// ============================================================================
// Host resolver
// ============================================================================

/// Host resolver changes, undone by [`HostDns::teardown`].
#[derive(Debug, Default)]
pub struct HostDns {
    link: Option<String>,
    files: Vec<PathBuf>,
}

async fn run(program: &str, args: &[String]) -> VpnResult<()> {
    let output = Command::new(program).args(args).output().await.map_err(|e| {
        VpnError::config_with_source(format!("Failed to execute {}", program), e)
    })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(VpnError::config(format!(
            "{} {}: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn resolver_file(server: SocketAddr, domain: &str) -> String {
    format!(
        "domain {}\nnameserver {}\nport {}\nsearch_order 1\n",
        domain,
        server.ip(),
        server.port()
    )
}

impl HostDns {
    /// Send lookups for the search domains on `tun_name` to `server`.
    pub async fn configure(tun_name: &str, server: SocketAddr, conf: &ResolvConf) -> VpnResult<Self> {
        let mut host = Self::default();
        if cfg!(target_os = "linux") {
            let dns = if server.port() == DNS_PORT {
                server.ip().to_string()
            } else {
                server.to_string()
            };
            run("resolvectl", &["dns".into(), tun_name.into(), dns]).await?;
            host.link = Some(tun_name.to_string());
            let mut args = vec!["domain".to_string(), tun_name.to_string()];
            args.extend(conf.search.iter().map(|d| format!("~{}", d)));
            run("resolvectl", &args).await?;
        } else if cfg!(target_os = "macos") {
            tokio::fs::create_dir_all("/etc/resolver").await?;
            for domain in &conf.search {
                let path = PathBuf::from("/etc/resolver").join(domain);
                tokio::fs::write(&path, resolver_file(server, domain)).await?;
                host.files.push(path);
            }
        } else {
            return Err(VpnError::Unsupported("host DNS configuration".into()));
        }
        log::info!("[dns] host resolver uses {} for {:?}", server, conf.search);
        Ok(host)
    }

    /// Revert the host resolver. Failures are logged.
    pub async fn teardown(self) {
        if let Some(link) = self.link {
            if let Err(e) = run("resolvectl", &["revert".into(), link]).await {
                log::warn!("[dns] revert: {}", e);
            }
        }
        for path in self.files {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                log::warn!("[dns] remove {}: {}", path.display(), e);
            }
        }
    }
}

/// Running forwarder plus host configuration.
pub struct DnsSession {
    token: CancellationToken,
    host: HostDns,
}

impl DnsSession {
    pub async fn stop(self) {
        self.token.cancel();
        self.host.teardown().await;
    }
}

/// Start the forwarder on `listen` and point the host resolver at it.
pub async fn setup(
    cluster: &dyn ClusterApi,
    pod: &str,
    tun_name: &str,
    listen: SocketAddr,
    token: CancellationToken,
) -> VpnResult<DnsSession> {
    let conf = resolv_conf_from_pod(cluster, pod).await?;
    let upstream = conf
        .upstream()
        .ok_or_else(|| VpnError::config("no cluster nameserver"))?;
    let forwarder = DnsForwarder::bind(listen, upstream, conf.clone()).await?;
    let server = forwarder.local_addr()?;

    let token = token.child_token();
    let serve_token = token.clone();
    tokio::spawn(async move {
        if let Err(e) = forwarder.serve(serve_token).await {
            log::warn!("[dns] forwarder stopped: {}", e);
        }
    });

    match HostDns::configure(tun_name, server, &conf).await {
        Ok(host) => Ok(DnsSession { token, host }),
        Err(e) => {
            token.cancel();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::MessageType;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record, RecordType};
    use std::net::Ipv4Addr;

    const POD_RESOLV: &str = "\
search default.svc.cluster.local svc.cluster.local cluster.local
nameserver 10.96.0.10
options ndots:5
";

    #[test]
    fn test_parse_resolv_conf() {
        let conf = ResolvConf::parse(POD_RESOLV);
        assert_eq!(conf.nameservers, vec!["10.96.0.10".parse::<IpAddr>().unwrap()]);
        assert_eq!(conf.search.len(), 3);
        assert_eq!(conf.search[0], "default.svc.cluster.local");
        assert_eq!(conf.ndots, 5);
        assert_eq!(conf.upstream(), Some("10.96.0.10:53".parse().unwrap()));

        let bare = ResolvConf::parse("# comment only\n");
        assert_eq!(bare.ndots, 1);
        assert!(bare.upstream().is_none());
    }

    #[test]
    fn test_candidate_names_follow_ndots() {
        let conf = ResolvConf::parse(POD_RESOLV);
        let short = Name::from_ascii("details.").unwrap();
        let names = candidate_names(&short, &conf);
        assert_eq!(names.len(), 4);
        assert_eq!(names[0].to_ascii(), "details.default.svc.cluster.local.");
        assert_eq!(names[3], short);

        let conf = ResolvConf {
            ndots: 2,
            ..ResolvConf::parse(POD_RESOLV)
        };
        let long = Name::from_ascii("www.example.com.").unwrap();
        assert_eq!(candidate_names(&long, &conf)[0], long);
        let svc = Name::from_ascii("details.default.").unwrap();
        assert_eq!(
            candidate_names(&svc, &conf)[0].to_ascii(),
            "details.default.default.svc.cluster.local."
        );
    }

    #[test]
    fn test_candidate_names_ndots_boundary() {
        let conf = ResolvConf {
            ndots: 5,
            ..ResolvConf::parse(POD_RESOLV)
        };
        let four_dots = Name::from_ascii("a.b.c.d.e.").unwrap();
        let names = candidate_names(&four_dots, &conf);
        assert_eq!(names[0].to_ascii(), "a.b.c.d.e.default.svc.cluster.local.");
        assert_eq!(names.last(), Some(&four_dots));

        let five_dots = Name::from_ascii("a.b.c.d.e.f.").unwrap();
        assert_eq!(candidate_names(&five_dots, &conf)[0], five_dots);
    }

    async fn fake_cluster_dns() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DNS_PACKET];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                let request = Message::from_vec(&buf[..n]).unwrap();
                let query = request.queries()[0].clone();
                let mut response = Message::new();
                response.set_id(request.id());
                response.set_message_type(MessageType::Response);
                response.add_query(query.clone());
                if query.name().to_ascii() == "details.default.svc.cluster.local." {
                    response.add_answer(Record::from_rdata(
                        query.name().clone(),
                        30,
                        RData::A(A(Ipv4Addr::new(10, 96, 3, 7))),
                    ));
                } else {
                    response.set_response_code(ResponseCode::NXDomain);
                }
                socket
                    .send_to(&response.to_vec().unwrap(), from)
                    .await
                    .unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_forwarder_expands_short_names() {
        let upstream = fake_cluster_dns().await;
        let forwarder = DnsForwarder::bind(
            "127.0.0.1:0".parse().unwrap(),
            upstream,
            ResolvConf::parse(POD_RESOLV),
        )
        .await
        .unwrap();
        let server = forwarder.local_addr().unwrap();
        let token = CancellationToken::new();
        let serve_token = token.clone();
        tokio::spawn(async move { forwarder.serve(serve_token).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut request = Message::new();
        request.set_id(42);
        request.add_query(Query::query(
            Name::from_ascii("details.").unwrap(),
            RecordType::A,
        ));
        client
            .send_to(&request.to_vec().unwrap(), server)
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_DNS_PACKET];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::from_vec(&buf[..n]).unwrap();
        assert_eq!(response.id(), 42);
        assert_eq!(response.queries()[0].name().to_ascii(), "details.");
        assert_eq!(response.answers().len(), 1);
        assert_eq!(response.answers()[0].name().to_ascii(), "details.");

        // unknown names fall through every candidate and keep NXDOMAIN
        let mut request = Message::new();
        request.set_id(43);
        request.add_query(Query::query(
            Name::from_ascii("missing.").unwrap(),
            RecordType::A,
        ));
        client
            .send_to(&request.to_vec().unwrap(), server)
            .await
            .unwrap();
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::from_vec(&buf[..n]).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(response.queries()[0].name().to_ascii(), "missing.");

        token.cancel();
    }

    #[tokio::test]
    async fn test_resolv_conf_from_pod() {
        use crate::cluster::memory::InMemoryCluster;
        use crate::cluster::PodRecord;

        let cluster = InMemoryCluster::default();
        cluster.insert_pod(PodRecord {
            name: "router".into(),
            phase: "Running".into(),
            ..Default::default()
        });
        assert!(resolv_conf_from_pod(&cluster, "router").await.is_err());

        cluster.set_exec_output("router", POD_RESOLV);
        let conf = resolv_conf_from_pod(&cluster, "router").await.unwrap();
        assert_eq!(conf.ndots, 5);
    }

    #[test]
    fn test_resolver_file() {
        let text = resolver_file("223.254.254.2:53".parse().unwrap(), "cluster.local");
        assert!(text.contains("nameserver 223.254.254.2\n"));
        assert!(text.contains("port 53\n"));
    }
}
