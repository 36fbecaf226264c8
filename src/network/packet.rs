//! Packet crafting and parsing for SYN probes

use crate::ScanError;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{MutableTcpPacket, TcpFlags, TcpOption, TcpPacket};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const TCP_OPTIONS_LEN: usize = 4;

/// TCP packet builder for crafting SYN probes
///
/// IPv4 probes are built as complete IP + TCP frames for a header-included
/// raw socket. IPv6 probes are built as a bare TCP segment; the kernel
/// prepends the IPv6 header.
pub struct TcpPacketBuilder {
    source_ip: IpAddr,
    dest_ip: IpAddr,
    source_port: u16,
    dest_port: u16,
    flags: u8,
    seq_num: u32,
    ack_num: u32,
    window_size: u16,
    ip_id: u16,
    ttl: u8,
    mss: Option<u16>,
}

impl TcpPacketBuilder {
    pub fn new(source_ip: IpAddr, dest_ip: IpAddr, source_port: u16, dest_port: u16) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            source_ip,
            dest_ip,
            source_port,
            dest_port,
            flags: 0,
            seq_num: rng.gen(),
            ack_num: 0,
            window_size: 64240,
            ip_id: rng.gen(),
            ttl: 64,
            mss: Some(1460),
        }
    }

    pub fn syn(mut self) -> Self {
        self.flags |= TcpFlags::SYN as u8;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn seq_num(mut self, seq_num: u32) -> Self {
        self.seq_num = seq_num;
        self
    }

    pub fn ack_num(mut self, ack_num: u32) -> Self {
        self.ack_num = ack_num;
        self
    }

    pub fn window_size(mut self, window_size: u16) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Advertise an MSS option (None sends a bare 20-byte header)
    pub fn mss(mut self, mss: Option<u16>) -> Self {
        self.mss = mss;
        self
    }

    /// Length of the TCP header including options
    fn tcp_len(&self) -> usize {
        TCP_HEADER_LEN + if self.mss.is_some() { TCP_OPTIONS_LEN } else { 0 }
    }

    /// Build the probe for the address family of the destination
    pub fn build(self) -> crate::Result<Vec<u8>> {
        match (self.source_ip, self.dest_ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => self.build_ipv4(src, dst),
            (IpAddr::V6(src), IpAddr::V6(dst)) => self.build_ipv6(src, dst),
            (src, dst) => Err(ScanError::InvalidTarget(format!(
                "Source {} and destination {} belong to different families",
                src, dst
            ))),
        }
    }

    /// Build the complete IP + TCP packet
    fn build_ipv4(&self, src: Ipv4Addr, dst: Ipv4Addr) -> crate::Result<Vec<u8>> {
        let total_len = IPV4_HEADER_LEN + self.tcp_len();
        let mut packet_buf = vec![0u8; total_len];

        {
            let mut ip_packet = MutableIpv4Packet::new(&mut packet_buf[..IPV4_HEADER_LEN])
                .ok_or_else(|| ScanError::NetworkError("IPv4 buffer too small".to_string()))?;
            ip_packet.set_version(4);
            ip_packet.set_header_length(5); // 5 * 4 = 20 bytes
            ip_packet.set_dscp(0);
            ip_packet.set_ecn(0);
            ip_packet.set_total_length(total_len as u16);
            ip_packet.set_identification(self.ip_id);
            ip_packet.set_flags(2); // Don't fragment
            ip_packet.set_fragment_offset(0);
            ip_packet.set_ttl(self.ttl);
            ip_packet.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ip_packet.set_source(src);
            ip_packet.set_destination(dst);

            let checksum = pnet::packet::ipv4::checksum(&ip_packet.to_immutable());
            ip_packet.set_checksum(checksum);
        }

        {
            let mut tcp_packet = self.write_tcp_header(&mut packet_buf[IPV4_HEADER_LEN..])?;
            let checksum =
                pnet::packet::tcp::ipv4_checksum(&tcp_packet.to_immutable(), &src, &dst);
            tcp_packet.set_checksum(checksum);
        }

        Ok(packet_buf)
    }

    /// Build the TCP segment of an IPv6 probe
    fn build_ipv6(&self, src: Ipv6Addr, dst: Ipv6Addr) -> crate::Result<Vec<u8>> {
        let mut segment = vec![0u8; self.tcp_len()];
        {
            let mut tcp_packet = self.write_tcp_header(&mut segment)?;
            let checksum =
                pnet::packet::tcp::ipv6_checksum(&tcp_packet.to_immutable(), &src, &dst);
            tcp_packet.set_checksum(checksum);
        }
        Ok(segment)
    }

    fn write_tcp_header<'a>(&self, buf: &'a mut [u8]) -> crate::Result<MutableTcpPacket<'a>> {
        let mut tcp_packet = MutableTcpPacket::new(buf)
            .ok_or_else(|| ScanError::NetworkError("TCP buffer too small".to_string()))?;
        tcp_packet.set_source(self.source_port);
        tcp_packet.set_destination(self.dest_port);
        tcp_packet.set_sequence(self.seq_num);
        tcp_packet.set_acknowledgement(self.ack_num);
        tcp_packet.set_data_offset((self.tcp_len() / 4) as u8);
        tcp_packet.set_flags(self.flags as u16);
        tcp_packet.set_window(self.window_size);
        tcp_packet.set_urgent_ptr(0);

        if let Some(mss) = self.mss {
            tcp_packet.set_options(&[TcpOption::mss(mss)]);
        }

        Ok(tcp_packet)
    }
}

/// Packet parser for analyzing received packets
pub struct PacketParser;

impl PacketParser {
    /// Parse an IPv4 datagram carrying TCP (raw IPv4 sockets deliver the IP header)
    pub fn parse_ipv4_tcp(packet: &[u8]) -> Option<TcpResponse> {
        if packet.len() < IPV4_HEADER_LEN + TCP_HEADER_LEN {
            return None;
        }

        let ip_packet = Ipv4Packet::new(packet)?;
        if ip_packet.get_version() != 4
            || ip_packet.get_next_level_protocol() != IpNextHeaderProtocols::Tcp
        {
            return None;
        }

        let ip_header_len = (ip_packet.get_header_length() as usize) * 4;
        if ip_header_len < IPV4_HEADER_LEN || packet.len() < ip_header_len + TCP_HEADER_LEN {
            return None;
        }

        let tcp_packet = TcpPacket::new(&packet[ip_header_len..])?;
        Some(TcpResponse::from_segment(
            IpAddr::V4(ip_packet.get_source()),
            &tcp_packet,
        ))
    }

    /// Parse a TCP segment received on a raw IPv6 socket (header already stripped)
    pub fn parse_ipv6_tcp(segment: &[u8], source: Ipv6Addr) -> Option<TcpResponse> {
        if segment.len() < TCP_HEADER_LEN {
            return None;
        }

        let tcp_packet = TcpPacket::new(segment)?;
        Some(TcpResponse::from_segment(IpAddr::V6(source), &tcp_packet))
    }
}

/// TCP response structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpResponse {
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
    pub flags: u8,
    pub seq_num: u32,
    pub ack_num: u32,
}

impl TcpResponse {
    fn from_segment(source_ip: IpAddr, tcp_packet: &TcpPacket<'_>) -> Self {
        Self {
            source_ip,
            source_port: tcp_packet.get_source(),
            dest_port: tcp_packet.get_destination(),
            flags: tcp_packet.get_flags() as u8,
            seq_num: tcp_packet.get_sequence(),
            ack_num: tcp_packet.get_acknowledgement(),
        }
    }

    pub fn is_syn_ack(&self) -> bool {
        (self.flags & (TcpFlags::SYN as u8 | TcpFlags::ACK as u8))
            == (TcpFlags::SYN as u8 | TcpFlags::ACK as u8)
    }

    pub fn is_rst(&self) -> bool {
        (self.flags & TcpFlags::RST as u8) != 0
    }

    pub fn is_ack(&self) -> bool {
        (self.flags & TcpFlags::ACK as u8) != 0
    }
}
