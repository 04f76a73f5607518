//! STUN client for NAT-type discovery and public address resolution.
//!
//! Implements the classical RFC 3489-style binding-request / change-request
//! dialogue used to classify how a NAT rewrites and gates outbound UDP
//! flows, plus the XOR-MAPPED-ADDRESS extension. The client never raises:
//! every failure degrades to [`NatType::Error`] and an empty `ext_ip`.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use rand::RngCore;
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: [u8; 2] = [0x01, 0x01];

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_SOURCE_ADDRESS: u16 = 0x0004;
const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const CHANGE_IP_AND_PORT: u32 = 0x0000_0006;
const CHANGE_PORT_ONLY: u32 = 0x0000_0002;

/// NAT type classifications produced by the classical STUN dialogue.
///
/// `Error` is the default/unknown state, returned whenever the dialogue
/// can't be completed at all (as opposed to completing and concluding
/// `Blocked`, which means the dialogue ran but every attempt timed out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatType {
    #[default]
    Error,
    Blocked,
    OpenInternet,
    SymmetricUdpFirewall,
    FullConeNat,
    RestrictedNat,
    RestrictedPortNat,
    SymmetricNat,
    ChangedAddrError,
}

impl NatType {
    /// Human-readable label, also used verbatim in the argv placeholder
    /// substitution performed by the supervisor.
    pub fn label(&self) -> &'static str {
        match self {
            NatType::Error => "",
            NatType::Blocked => "Blocked",
            NatType::OpenInternet => "Open Internet",
            NatType::SymmetricUdpFirewall => "Symmetric UDP Firewall",
            NatType::FullConeNat => "Full Cone NAT",
            NatType::RestrictedNat => "Restricted NAT",
            NatType::RestrictedPortNat => "Restricted Port NAT",
            NatType::SymmetricNat => "Symmetric NAT",
            NatType::ChangedAddrError => "Error when testing on Changed-IP and Port",
        }
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// An address as reported by a STUN server attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAddress {
    pub ip: String,
    pub port: u16,
}

/// Parsed response to one STUN request.
///
/// `ok = false` means the exchange failed outright (timeout, malformed
/// reply) and every field below is absent. `ok = true` does not imply all
/// three are present - only the attributes the server actually sent.
/// Fields are `Option`, never an "empty address" sentinel, so "attribute
/// absent" and "attribute present but unparseable" stay distinguishable
/// (the latter fails the whole attempt before a `StunResponse` is built).
#[derive(Debug, Clone, Default)]
pub struct StunResponse {
    pub ok: bool,
    pub ext: Option<StunAddress>,
    pub src: Option<StunAddress>,
    pub changed: Option<StunAddress>,
}

/// Outcome of a single [`StunClient::probe`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunInfo {
    pub nat_type: NatType,
    pub src_ip: String,
    pub ext_ip: String,
    pub stun_host: String,
    pub stun_ip: String,
    pub stun_port: u16,
}

/// STUN client holding the server coordinates and retry policy.
///
/// Stateless with respect to user data; the one piece of state it does
/// keep, `stun_ip`, is the sticky resolved server address described in
/// [`StunClient::probe`] - kept stable across probes so consecutive NAT
/// bindings stay comparable.
pub struct StunClient {
    host: String,
    port: u16,
    timeout: Duration,
    retries: u32,
    retries_delay: Duration,
    stun_ip: String,
}

impl StunClient {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
        retries: u32,
        retries_delay: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            retries,
            retries_delay,
            stun_ip: String::new(),
        }
    }

    /// Discovers the NAT type and external address seen for `src_ip:src_port`.
    ///
    /// Never raises: any internal failure is logged and folded into a
    /// `StunInfo` with `nat_type = NatType::Error` and an empty `ext_ip`.
    /// `stun_host`/`stun_port` always echo the configured values.
    pub async fn probe(&mut self, src_ip: &str, src_port: u16) -> StunInfo {
        let (nat_type, ext_ip) = match self.try_probe(src_ip, src_port).await {
            Ok(v) => v,
            Err(err) => {
                tracing::error!("can't get STUN info: {err:#}");
                (NatType::Error, String::new())
            }
        };
        StunInfo {
            nat_type,
            src_ip: src_ip.to_string(),
            ext_ip,
            stun_host: self.host.clone(),
            stun_ip: self.stun_ip.clone(),
            stun_port: self.port,
        }
    }

    async fn try_probe(&mut self, src_ip: &str, src_port: u16) -> anyhow::Result<(NatType, String)> {
        let src_addr = resolve_retried(src_ip, src_port, self.retries, self.retries_delay)
            .await?
            .into_iter()
            .next()
            .context("no local address resolved")?;
        let src_is_v4 = src_addr.is_ipv4();

        let stun_candidates = resolve_retried(&self.host, self.port, self.retries, self.retries_delay).await?;
        let stun_ips: Vec<IpAddr> = stun_candidates
            .into_iter()
            .map(|a| a.ip())
            .filter(|ip| ip.is_ipv4() == src_is_v4)
            .collect();
        if stun_ips.is_empty() {
            anyhow::bail!("can't resolve a {}-family address for STUN server", if src_is_v4 { "IPv4" } else { "IPv6" });
        }
        if self.stun_ip.is_empty() || !stun_ips.iter().any(|ip| ip.to_string() == self.stun_ip) {
            self.stun_ip = stun_ips[0].to_string();
        }

        let domain = if src_is_v4 { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, None).context("create UDP socket")?;
        socket.set_reuse_address(true).context("SO_REUSEADDR")?;
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&SockAddr::from(src_addr)).context("bind")?;
        let sock = UdpSocket::from_std(socket.into()).context("adopt socket into tokio")?;

        self.classify(&sock, src_ip).await
    }

    /// Runs the RFC 3489-style classification dialogue over an already-bound
    /// socket. Steps are strictly sequential: each one's branch depends on
    /// the result of the last, so they are never raced or reordered.
    async fn classify(&self, sock: &UdpSocket, src_ip: &str) -> anyhow::Result<(NatType, String)> {
        let stun_addr = SocketAddr::new(self.stun_ip.parse().context("parse sticky stun_ip")?, self.port);

        let first = self.make_request(sock, stun_addr, &[]).await;
        if !first.ok {
            return Ok((NatType::Blocked, ext_ip_of(&first)));
        }

        let resp = self
            .make_request(sock, stun_addr, &change_request_payload(CHANGE_IP_AND_PORT))
            .await;

        if first.ext.as_ref().map(|e| e.ip.as_str()) == Some(src_ip) {
            if resp.ok {
                return Ok((NatType::OpenInternet, ext_ip_of(&resp)));
            }
            return Ok((NatType::SymmetricUdpFirewall, ext_ip_of(&resp)));
        }

        if resp.ok {
            return Ok((NatType::FullConeNat, ext_ip_of(&resp)));
        }

        let changed = first
            .changed
            .clone()
            .context("changed address missing from first response")?;
        let changed_addr = SocketAddr::new(changed.ip.parse().context("parse changed.ip")?, changed.port);
        let resp = self.make_request(sock, changed_addr, &[]).await;
        if !resp.ok {
            return Ok((NatType::ChangedAddrError, ext_ip_of(&resp)));
        }

        if resp.ext == first.ext {
            let port_addr = SocketAddr::new(changed.ip.parse().context("parse changed.ip")?, self.port);
            let resp = self
                .make_request(sock, port_addr, &change_request_payload(CHANGE_PORT_ONLY))
                .await;
            if resp.ok {
                return Ok((NatType::RestrictedNat, ext_ip_of(&resp)));
            }
            return Ok((NatType::RestrictedPortNat, ext_ip_of(&resp)));
        }

        Ok((NatType::SymmetricNat, ext_ip_of(&resp)))
    }

    /// Sends one logical STUN request, retrying up to `retries` times with
    /// `retries_delay` between attempts. Every attempt reuses the same
    /// transaction id so a late reply to an earlier attempt is still
    /// accepted.
    async fn make_request(&self, sock: &UdpSocket, addr: SocketAddr, payload: &[u8]) -> StunResponse {
        let mut trans_id = [0u8; 12];
        rand::rng().fill_bytes(&mut trans_id);

        let mut msg = Vec::with_capacity(20 + payload.len());
        msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
        msg.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE);
        msg.extend_from_slice(&trans_id);
        msg.extend_from_slice(payload);

        let mut expected_tail = [0u8; 16];
        expected_tail[..4].copy_from_slice(&MAGIC_COOKIE);
        expected_tail[4..].copy_from_slice(&trans_id);

        let mut last_err = None;
        for attempt in 1..=self.retries.max(1) {
            match self.try_once(sock, addr, &msg, &expected_tail, &trans_id).await {
                Ok(resp) => return resp,
                Err(err) => {
                    tracing::debug!(%addr, attempt, retries = self.retries, "STUN request failed: {err:#}");
                    last_err = Some(err);
                    if attempt < self.retries {
                        tokio::time::sleep(self.retries_delay).await;
                    }
                }
            }
        }
        tracing::error!(
            %addr,
            retries = self.retries,
            "STUN request exhausted retries; last error: {:#}",
            last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made"))
        );
        StunResponse::default()
    }

    async fn try_once(
        &self,
        sock: &UdpSocket,
        addr: SocketAddr,
        msg: &[u8],
        expected_tail: &[u8; 16],
        trans_id: &[u8; 12],
    ) -> anyhow::Result<StunResponse> {
        sock.send_to(msg, addr).await.context("sendto")?;
        let mut buf = [0u8; 2048];
        let (n, _peer) = timeout(self.timeout, sock.recv_from(&mut buf))
            .await
            .context("recv timed out")?
            .context("recv")?;
        let data = &buf[..n];
        if data.len() < 20 {
            anyhow::bail!("response is too short ({} bytes)", data.len());
        }
        if data[0..2] != BINDING_SUCCESS {
            anyhow::bail!("invalid response type {:#06x}", u16::from_be_bytes([data[0], data[1]]));
        }
        if data[4..20] != *expected_tail {
            anyhow::bail!("transaction id mismatch");
        }
        parse_attributes(&data[20..], trans_id)
    }
}

fn ext_ip_of(resp: &StunResponse) -> String {
    resp.ext.as_ref().map(|a| a.ip.clone()).unwrap_or_default()
}

fn change_request_payload(flags: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..2].copy_from_slice(&ATTR_CHANGE_REQUEST.to_be_bytes());
    buf[2..4].copy_from_slice(&4u16.to_be_bytes());
    buf[4..8].copy_from_slice(&flags.to_be_bytes());
    buf
}

async fn resolve_retried(
    host: &str,
    port: u16,
    retries: u32,
    retries_delay: Duration,
) -> anyhow::Result<Vec<SocketAddr>> {
    let mut last_err = None;
    for attempt in 1..=retries.max(1) {
        match tokio::net::lookup_host((host, port)).await {
            Ok(iter) => return Ok(iter.collect()),
            Err(err) => {
                last_err = Some(err);
                if attempt < retries {
                    tokio::time::sleep(retries_delay).await;
                }
            }
        }
    }
    Err(last_err.unwrap()).with_context(|| format!("resolving {host}:{port}"))
}

/// Walks a STUN message body as a sequence of `(type, length, value)` TLVs.
/// Unknown attribute types are skipped; the recognised ones overwrite their
/// field each time they're seen, so the last one parsed wins when a server
/// sends both MAPPED-ADDRESS and XOR-MAPPED-ADDRESS.
fn parse_attributes(body: &[u8], trans_id: &[u8; 12]) -> anyhow::Result<StunResponse> {
    let mut resp = StunResponse {
        ok: true,
        ..Default::default()
    };
    let mut offset = 0usize;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > body.len() {
            anyhow::bail!("attribute {attr_type:#06x} truncated");
        }
        let value = &body[offset..offset + attr_len];
        match attr_type {
            ATTR_MAPPED_ADDRESS => resp.ext = Some(decode_address(value, None)?),
            ATTR_XOR_MAPPED_ADDRESS => resp.ext = Some(decode_address(value, Some(trans_id))?),
            ATTR_SOURCE_ADDRESS => resp.src = Some(decode_address(value, None)?),
            ATTR_CHANGED_ADDRESS => resp.changed = Some(decode_address(value, None)?),
            _ => {}
        }
        offset += attr_len;
    }
    Ok(resp)
}

/// Decodes a STUN address attribute body: `reserved(1) family(1) port(2) addr(4|16)`.
/// When `trans_id` is `Some`, the port and address bytes are XOR'd with the
/// magic cookie concatenated with the transaction id (XOR-MAPPED-ADDRESS);
/// otherwise the bytes are used as-is.
fn decode_address(data: &[u8], trans_id: Option<&[u8; 12]>) -> anyhow::Result<StunAddress> {
    if data.len() < 4 {
        anyhow::bail!("address attribute too short");
    }
    let family = data[1];
    let port = u16::from_be_bytes(xor_mask(&data[2..4], trans_id).try_into().unwrap());
    let ip = match family {
        0x01 => {
            if data.len() < 8 {
                anyhow::bail!("IPv4 address attribute too short");
            }
            let bytes = xor_mask(&data[4..8], trans_id);
            IpAddr::from(<[u8; 4]>::try_from(bytes.as_slice()).unwrap())
        }
        0x02 => {
            if data.len() < 20 {
                anyhow::bail!("IPv6 address attribute too short");
            }
            let bytes = xor_mask(&data[4..20], trans_id);
            IpAddr::from(<[u8; 16]>::try_from(bytes.as_slice()).unwrap())
        }
        other => anyhow::bail!("unsupported address family {other:#04x}"),
    };
    Ok(StunAddress { ip: ip.to_string(), port })
}

fn xor_mask(data: &[u8], trans_id: Option<&[u8; 12]>) -> Vec<u8> {
    match trans_id {
        None => data.to_vec(),
        Some(tid) => {
            let mut mask = Vec::with_capacity(16);
            mask.extend_from_slice(&MAGIC_COOKIE);
            mask.extend_from_slice(tid);
            data.iter().zip(mask.iter().cycle()).map(|(a, b)| a ^ b).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket as TokioUdpSocket;

    #[test]
    fn nat_type_labels() {
        assert_eq!(NatType::OpenInternet.label(), "Open Internet");
        assert_eq!(NatType::Error.label(), "");
        assert_eq!(NatType::default(), NatType::Error);
    }

    #[test]
    fn xor_mapped_address_round_trips_ipv4() {
        let trans_id = [7u8; 12];
        let ip = IpAddr::from([203, 0, 113, 9]);
        let port: u16 = 54321;

        let masked_port = xor_mask(&port.to_be_bytes(), Some(&trans_id));
        let ip_bytes = match ip {
            IpAddr::V4(v4) => v4.octets(),
            _ => unreachable!(),
        };
        let masked_ip = xor_mask(&ip_bytes, Some(&trans_id));

        let mut attr = vec![0u8, 0x01];
        attr.extend_from_slice(&masked_port);
        attr.extend_from_slice(&masked_ip);

        let decoded = decode_address(&attr, Some(&trans_id)).unwrap();
        assert_eq!(decoded.ip, ip.to_string());
        assert_eq!(decoded.port, port);
    }

    #[test]
    fn xor_mapped_address_round_trips_ipv6() {
        let trans_id = [0xAAu8; 12];
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let port: u16 = 1234;

        let masked_port = xor_mask(&port.to_be_bytes(), Some(&trans_id));
        let ip_bytes = match ip {
            IpAddr::V6(v6) => v6.octets(),
            _ => unreachable!(),
        };
        let masked_ip = xor_mask(&ip_bytes, Some(&trans_id));

        let mut attr = vec![0u8, 0x02];
        attr.extend_from_slice(&masked_port);
        attr.extend_from_slice(&masked_ip);

        let decoded = decode_address(&attr, Some(&trans_id)).unwrap();
        assert_eq!(decoded.ip, ip.to_string());
        assert_eq!(decoded.port, port);
    }

    #[test]
    fn mapped_address_is_not_xored() {
        let ip = IpAddr::from([192, 168, 1, 1]);
        let mut attr = vec![0u8, 0x01, 0x1F, 0x90];
        attr.extend_from_slice(&[192, 168, 1, 1]);
        let decoded = decode_address(&attr, None).unwrap();
        assert_eq!(decoded.ip, ip.to_string());
        assert_eq!(decoded.port, 0x1F90);
    }

    #[test]
    fn later_attribute_wins_when_both_mapped_kinds_present() {
        let plain_ip = IpAddr::from([10, 0, 0, 1]);
        let mut plain = vec![0u8, 0x01, 0x00, 0x50];
        plain.extend_from_slice(&[10, 0, 0, 1]);

        let trans_id = [3u8; 12];
        let xor_ip = IpAddr::from([10, 0, 0, 2]);
        let masked_port = xor_mask(&0x0051u16.to_be_bytes(), Some(&trans_id));
        let masked_ip = xor_mask(&[10, 0, 0, 2], Some(&trans_id));
        let mut xored = vec![0u8, 0x01];
        xored.extend_from_slice(&masked_port);
        xored.extend_from_slice(&masked_ip);

        let mut body = Vec::new();
        body.extend_from_slice(&ATTR_MAPPED_ADDRESS.to_be_bytes());
        body.extend_from_slice(&(plain.len() as u16).to_be_bytes());
        body.extend_from_slice(&plain);
        body.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        body.extend_from_slice(&(xored.len() as u16).to_be_bytes());
        body.extend_from_slice(&xored);

        let resp = parse_attributes(&body, &trans_id).unwrap();
        assert_eq!(resp.ext.unwrap().ip, xor_ip.to_string());
        let _ = plain_ip;
    }

    fn build_response(trans_tail: &[u8; 16], attrs: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_SUCCESS);
        msg.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        msg.extend_from_slice(trans_tail);
        msg.extend_from_slice(attrs);
        msg
    }

    fn address_attr(code: u16, ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut value = vec![0u8, 0x01];
        value.extend_from_slice(&port.to_be_bytes());
        value.extend_from_slice(&ip);
        let mut attr = Vec::new();
        attr.extend_from_slice(&code.to_be_bytes());
        attr.extend_from_slice(&(value.len() as u16).to_be_bytes());
        attr.extend_from_slice(&value);
        attr
    }

    /// Replies to one request at a time according to a fixed script, echoing
    /// back the transaction id it was sent so client-side validation passes.
    async fn run_fake_server(sock: TokioUdpSocket, script: Vec<Option<(u16, [u8; 4], u16, Option<([u8; 4], u16)>)>>) {
        let mut buf = [0u8; 2048];
        for step in script {
            let (n, peer) = match sock.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let tail: [u8; 16] = buf[4..20].try_into().unwrap();
            let _req = &buf[..n];
            match step {
                None => continue, // simulate a dropped datagram: don't reply
                Some((ext_port, ext_ip, mapped_code, changed)) => {
                    let mut attrs = address_attr(mapped_code, ext_ip, ext_port);
                    if let Some((cip, cport)) = changed {
                        attrs.extend_from_slice(&address_attr(ATTR_CHANGED_ADDRESS, cip, cport));
                    }
                    let resp = build_response(&tail, &attrs);
                    let _ = sock.send_to(&resp, peer).await;
                }
            }
        }
    }

    async fn fake_server(script: Vec<Option<(u16, [u8; 4], u16, Option<([u8; 4], u16)>)>>) -> SocketAddr {
        let sock = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(run_fake_server(sock, script));
        addr
    }

    fn fast_client(host: String, port: u16) -> StunClient {
        StunClient::new(host, port, Duration::from_millis(200), 2, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn blocked_when_server_never_replies() {
        let addr = fake_server(vec![None, None]).await;
        let mut client = fast_client(addr.ip().to_string(), addr.port());
        let info = client.probe("127.0.0.1", 0).await;
        assert_eq!(info.nat_type, NatType::Blocked);
        assert_eq!(info.ext_ip, "");
        assert_eq!(info.stun_host, addr.ip().to_string());
        assert_eq!(info.stun_port, addr.port());
    }

    #[tokio::test]
    async fn open_internet_when_ext_matches_src_and_change_request_succeeds() {
        let loopback = [127, 0, 0, 1];
        let script = vec![
            Some((4000, loopback, ATTR_MAPPED_ADDRESS, None)),
            Some((4000, loopback, ATTR_MAPPED_ADDRESS, None)),
        ];
        let addr = fake_server(script).await;
        let mut client = fast_client(addr.ip().to_string(), addr.port());
        let info = client.probe("127.0.0.1", 0).await;
        assert_eq!(info.nat_type, NatType::OpenInternet);
        assert_eq!(info.ext_ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn symmetric_udp_firewall_when_change_request_fails() {
        let loopback = [127, 0, 0, 1];
        let script = vec![Some((4000, loopback, ATTR_MAPPED_ADDRESS, None)), None];
        let addr = fake_server(script).await;
        let mut client = fast_client(addr.ip().to_string(), addr.port());
        let info = client.probe("127.0.0.1", 0).await;
        assert_eq!(info.nat_type, NatType::SymmetricUdpFirewall);
    }

    #[tokio::test]
    async fn full_cone_nat_when_ext_differs_and_change_request_succeeds() {
        let ext = [203, 0, 113, 5];
        let script = vec![
            Some((4000, ext, ATTR_MAPPED_ADDRESS, None)),
            Some((4000, ext, ATTR_MAPPED_ADDRESS, None)),
        ];
        let addr = fake_server(script).await;
        let mut client = fast_client(addr.ip().to_string(), addr.port());
        let info = client.probe("127.0.0.1", 0).await;
        assert_eq!(info.nat_type, NatType::FullConeNat);
        assert_eq!(info.ext_ip, "203.0.113.5");
    }

    #[tokio::test]
    async fn restricted_nat_when_changed_addr_confirms_mapping_and_change_port_succeeds() {
        let ext = [203, 0, 113, 5];
        let changed_ip = [127, 0, 0, 1]; // the "changed" server also answers on loopback here

        // Bind the changed-address server first so its port is known up front: it answers
        // the next two requests (plain probe, then change-port probe) with the same ext.
        let changed_sock = TokioUdpSocket::bind((std::net::Ipv4Addr::from(changed_ip), 0)).await.unwrap();
        let changed_port = changed_sock.local_addr().unwrap().port();
        tokio::spawn(run_fake_server(
            changed_sock,
            vec![
                Some((4000, ext, ATTR_MAPPED_ADDRESS, None)),
                Some((4000, ext, ATTR_MAPPED_ADDRESS, None)),
            ],
        ));

        // Primary server: NATed (ext != src), change-request fails, and points at the
        // changed server above.
        let script = vec![
            Some((4000, ext, ATTR_MAPPED_ADDRESS, Some((changed_ip, changed_port)))),
            None,
        ];
        let addr = fake_server(script).await;

        let mut client = fast_client(addr.ip().to_string(), addr.port());
        let info = client.probe("127.0.0.1", 0).await;
        assert_eq!(info.nat_type, NatType::RestrictedNat);
        assert_eq!(info.ext_ip, "203.0.113.5");
    }

    #[tokio::test]
    async fn probe_never_panics_on_unresolvable_host() {
        let mut client = fast_client("this-host-does-not-resolve.invalid".to_string(), 3478);
        let info = client.probe("127.0.0.1", 0).await;
        assert_eq!(info.nat_type, NatType::Error);
        assert_eq!(info.ext_ip, "");
        assert_eq!(info.stun_host, "this-host-does-not-resolve.invalid");
        assert_eq!(info.stun_port, 3478);
    }

    #[tokio::test]
    async fn sticky_stun_ip_is_reused_across_probes() {
        let loopback = [127, 0, 0, 1];
        let script = vec![
            Some((4000, loopback, ATTR_MAPPED_ADDRESS, None)),
            Some((4000, loopback, ATTR_MAPPED_ADDRESS, None)),
            Some((4000, loopback, ATTR_MAPPED_ADDRESS, None)),
            Some((4000, loopback, ATTR_MAPPED_ADDRESS, None)),
        ];
        let addr = fake_server(script).await;
        let mut client = fast_client("localhost".to_string(), addr.port());
        let first = client.probe("127.0.0.1", 0).await;
        let second = client.probe("127.0.0.1", 0).await;
        assert_eq!(first.stun_ip, second.stun_ip);
    }
}
