//! Parse annotations and checksum offload.
//!
//! The hardware parser writes an annotation block at the start of every
//! receive buffer: a classification word, the L2/L3 and L3/L4 boundaries and
//! a flow hash. On transmit the driver writes result-request fields into the
//! same region to ask the hardware for checksum offload.

use std::ptr::NonNull;
use std::slice;

use etherparse::checksum::Sum16BitWords;
use etherparse::{
    Ethernet2Header, Ethernet2HeaderSlice, EtherType, IpNumber, Ipv4HeaderSlice,
    Ipv6ExtensionsSlice, Ipv6HeaderSlice, SingleVlanHeader, SingleVlanHeaderSlice,
};
use log::debug;

use crate::frame::{FdCmd, FrameDesc};
use crate::mbuf::{OffloadFlags, PacketBuf};

/// Bytes reserved for the annotation block at the start of every buffer.
pub const ANNOT_SIZE: usize = 64;

/// Minimum data offset required before hardware checksum offload can be
/// requested: the annotation block must fit in front of the payload.
pub const TX_ANNOT_MIN: u16 = ANNOT_SIZE as u16;

const _: () = assert!(size_of::<Annotation>() <= ANNOT_SIZE);

/// The annotation block layout. Hardware fills the RX fields; the driver
/// fills the TX request fields. The hash travels in wire (big-endian) order.
#[repr(C)]
pub struct Annotation {
    pub class_word: u64,
    pub hash: u64,
    pub l3_off: u8,
    pub l4_off: u8,
    pub l3_req: u16,
    pub l4_req: u8,
}

/// # Safety
/// `buf_base` must point at the start of a pool buffer (8-byte aligned) with
/// at least [`ANNOT_SIZE`] valid bytes, with no aliasing reference live.
#[inline]
pub(crate) unsafe fn annot_mut<'a>(buf_base: *mut u8) -> &'a mut Annotation {
    // SAFETY: per contract.
    unsafe { &mut *(buf_base as *mut Annotation) }
}

/// # Safety
/// As for [`annot_mut`].
pub(crate) unsafe fn zero_annotation(buf_base: *mut u8) {
    // SAFETY: per contract.
    unsafe { buf_base.write_bytes(0, ANNOT_SIZE) };
}

// Classification word bits.
const CW_ETHER: u64 = 1 << 0;
const CW_IPV4: u64 = 1 << 4;
const CW_IPV6: u64 = 1 << 5;
const CW_EXT: u64 = 1 << 6;
const CW_TCP: u64 = 1 << 8;
const CW_UDP: u64 = 1 << 9;
const CW_SCTP: u64 = 1 << 10;
/// VLAN presence, outside the classification match.
pub const CW_VLAN: u64 = 1 << 16;

const CLASS_MASK: u64 = 0xffff;

pub const CLASS_NONE: u64 = 0;
pub const CLASS_ETHER: u64 = CW_ETHER;
pub const CLASS_IPV4: u64 = CW_ETHER | CW_IPV4;
pub const CLASS_IPV6: u64 = CW_ETHER | CW_IPV6;
pub const CLASS_IPV4_EXT: u64 = CLASS_IPV4 | CW_EXT;
pub const CLASS_IPV6_EXT: u64 = CLASS_IPV6 | CW_EXT;
pub const CLASS_IPV4_TCP: u64 = CLASS_IPV4 | CW_TCP;
pub const CLASS_IPV6_TCP: u64 = CLASS_IPV6 | CW_TCP;
pub const CLASS_IPV4_UDP: u64 = CLASS_IPV4 | CW_UDP;
pub const CLASS_IPV6_UDP: u64 = CLASS_IPV6 | CW_UDP;
pub const CLASS_IPV4_SCTP: u64 = CLASS_IPV4 | CW_SCTP;
pub const CLASS_IPV6_SCTP: u64 = CLASS_IPV6 | CW_SCTP;

// TX result-request codes.
pub const L3_REQ_IPV4: u16 = 0x8000;
pub const L3_REQ_IPV6: u16 = 0x4000;
pub const L4_REQ_TCP: u8 = 0x10;
pub const L4_REQ_UDP: u8 = 0x40;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum L2Kind {
    #[default]
    Unknown,
    Ether,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum L3Kind {
    #[default]
    Unknown,
    Ipv4,
    Ipv4Ext,
    Ipv6,
    Ipv6Ext,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum L4Kind {
    #[default]
    Unknown,
    Tcp,
    Udp,
    Sctp,
}

/// Coarse protocol classification of one packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(C)]
pub struct PacketType {
    pub l2: L2Kind,
    pub l3: L3Kind,
    pub l4: L4Kind,
}

impl PacketType {
    #[inline]
    pub fn is_ipv4(self) -> bool {
        matches!(self.l3, L3Kind::Ipv4 | L3Kind::Ipv4Ext)
    }

    #[inline]
    pub fn is_ipv6(self) -> bool {
        matches!(self.l3, L3Kind::Ipv6 | L3Kind::Ipv6Ext)
    }
}

const fn pt(l2: L2Kind, l3: L3Kind, l4: L4Kind) -> PacketType {
    PacketType { l2, l3, l4 }
}

/// Decodes the hardware classification word. Exactly the twelve defined
/// combinations map to a type; anything else is for the slow path.
pub fn classify(word: u64) -> Option<PacketType> {
    use {L2Kind::*, L3Kind::*, L4Kind::*};
    let t = match word & CLASS_MASK {
        CLASS_NONE => PacketType::default(),
        CLASS_ETHER => pt(Ether, L3Kind::Unknown, L4Kind::Unknown),
        CLASS_IPV4 => pt(Ether, Ipv4, L4Kind::Unknown),
        CLASS_IPV6 => pt(Ether, Ipv6, L4Kind::Unknown),
        CLASS_IPV4_EXT => pt(Ether, Ipv4Ext, L4Kind::Unknown),
        CLASS_IPV6_EXT => pt(Ether, Ipv6Ext, L4Kind::Unknown),
        CLASS_IPV4_TCP => pt(Ether, Ipv4, Tcp),
        CLASS_IPV6_TCP => pt(Ether, Ipv6, Tcp),
        CLASS_IPV4_UDP => pt(Ether, Ipv4, Udp),
        CLASS_IPV6_UDP => pt(Ether, Ipv6, Udp),
        CLASS_IPV4_SCTP => pt(Ether, Ipv4, Sctp),
        CLASS_IPV6_SCTP => pt(Ether, Ipv6, Sctp),
        _ => return None,
    };
    Some(t)
}

/// Inverse of [`classify`] for the combinations the parser can emit. Used by
/// the software hardware model when it fills annotations.
pub fn class_word_for(t: PacketType) -> u64 {
    let mut word = 0;
    if t.l2 == L2Kind::Ether {
        word |= CW_ETHER;
    }
    word |= match t.l3 {
        L3Kind::Unknown => 0,
        L3Kind::Ipv4 => CW_IPV4,
        L3Kind::Ipv4Ext => CW_IPV4 | CW_EXT,
        L3Kind::Ipv6 => CW_IPV6,
        L3Kind::Ipv6Ext => CW_IPV6 | CW_EXT,
    };
    word |= match t.l4 {
        L4Kind::Unknown => 0,
        L4Kind::Tcp => CW_TCP,
        L4Kind::Udp => CW_UDP,
        L4Kind::Sctp => CW_SCTP,
    };
    word
}

const IPPROTO_SCTP: IpNumber = IpNumber(132);

fn l4_kind(p: IpNumber) -> L4Kind {
    if p == IpNumber::TCP {
        L4Kind::Tcp
    } else if p == IpNumber::UDP {
        L4Kind::Udp
    } else if p == IPPROTO_SCTP {
        L4Kind::Sctp
    } else {
        L4Kind::Unknown
    }
}

fn is_vlan(e: EtherType) -> bool {
    e == EtherType::VLAN_TAGGED_FRAME
        || e == EtherType::PROVIDER_BRIDGING
        || e == EtherType::VLAN_DOUBLE_TAGGED_FRAME
}

/// Full software header walk for frames the hardware parser did not
/// recognize. Returns the classification plus the L2 and L3 header lengths.
pub fn slow_classify(frame: &[u8]) -> (PacketType, u8, u16) {
    let mut t = PacketType::default();
    let Ok(eth) = Ethernet2HeaderSlice::from_slice(frame) else {
        return (t, 0, 0);
    };
    t.l2 = L2Kind::Ether;
    let mut l2_len = Ethernet2Header::LEN;
    let mut ether_type = eth.ether_type();
    while is_vlan(ether_type) {
        let Ok(tag) = SingleVlanHeaderSlice::from_slice(&frame[l2_len..]) else {
            return (t, l2_len as u8, 0);
        };
        ether_type = tag.ether_type();
        l2_len += SingleVlanHeader::LEN;
    }
    if ether_type == EtherType::IPV4 {
        let Ok(ip) = Ipv4HeaderSlice::from_slice(&frame[l2_len..]) else {
            return (t, l2_len as u8, 0);
        };
        t.l3 = if ip.ihl() > 5 {
            L3Kind::Ipv4Ext
        } else {
            L3Kind::Ipv4
        };
        t.l4 = l4_kind(ip.protocol());
        (t, l2_len as u8, ip.slice().len() as u16)
    } else if ether_type == EtherType::IPV6 {
        let Ok(ip) = Ipv6HeaderSlice::from_slice(&frame[l2_len..]) else {
            return (t, l2_len as u8, 0);
        };
        t.l3 = L3Kind::Ipv6;
        let after = &frame[l2_len + ip.slice().len()..];
        match Ipv6ExtensionsSlice::from_slice(ip.next_header(), after) {
            Ok((_, next, rest)) => {
                let ext_len = after.len() - rest.len();
                if ext_len > 0 {
                    t.l3 = L3Kind::Ipv6Ext;
                }
                t.l4 = l4_kind(next);
                (t, l2_len as u8, (ip.slice().len() + ext_len) as u16)
            }
            Err(_) => (t, l2_len as u8, ip.slice().len() as u16),
        }
    } else {
        (t, l2_len as u8, 0)
    }
}

/// Applies the annotation of a freshly received packet to its buffer header:
/// classification (fast word decode, or the software walk for unrecognized
/// codes), derived offload lengths, RSS hash and VLAN presence.
///
/// # Safety
/// `pkt` must be a valid first segment with its payload readable and no
/// other live reference.
pub(crate) unsafe fn packet_info(pkt: NonNull<PacketBuf>) {
    let p = pkt.as_ptr();
    // SAFETY: annotation block sits at the start of the payload buffer,
    // disjoint from the metadata header.
    let (word, hash, l3_off, l4_off) = unsafe {
        let annot = annot_mut((*p).data_base());
        (annot.class_word, annot.hash, annot.l3_off, annot.l4_off)
    };
    // SAFETY: exclusive access per contract.
    unsafe {
        match classify(word) {
            Some(t) => {
                (*p).ptype = t;
                (*p).l2_len = l3_off;
                (*p).l3_len = l4_off.saturating_sub(l3_off) as u16;
            }
            None => {
                debug!("slow parsing, class word {word:#x}");
                let (t, l2, l3) = slow_classify((*p).payload());
                (*p).ptype = t;
                (*p).l2_len = l2;
                (*p).l3_len = l3;
            }
        }
        (*p).rss_hash = u64::from_be(hash) as u32;
        (*p).flags |= OffloadFlags::RX_RSS_HASH;
        if word & CW_VLAN != 0 {
            (*p).flags |= OffloadFlags::RX_VLAN;
        }
    }
}

/// Feeds chain bytes into a ones-complement sum, carrying a dangling byte
/// across segment boundaries so odd-length segments keep word alignment.
fn add_chain_bytes(
    mut sum: Sum16BitWords,
    pending: &mut Option<u8>,
    mut bytes: &[u8],
) -> Sum16BitWords {
    if let Some(hi) = pending.take() {
        if let Some((&lo, rest)) = bytes.split_first() {
            sum = sum.add_2bytes([hi, lo]);
            bytes = rest;
        } else {
            *pending = Some(hi);
            return sum;
        }
    }
    if bytes.len() % 2 == 1 {
        *pending = Some(bytes[bytes.len() - 1]);
        bytes = &bytes[..bytes.len() - 1];
    }
    sum.add_slice(bytes)
}

/// Recomputes checksums in software, per the packet's classification: the
/// IPv4 header checksum whenever L3 is IPv4/IPv4-ext, and the TCP or UDP
/// checksum over the matching IPv4 or IPv6 pseudo-header. Headers must live
/// in the first segment; the L4 payload may span the chain.
///
/// # Safety
/// `first` must head a valid chain with no other live references.
pub(crate) unsafe fn software_checksum(first: NonNull<PacketBuf>) {
    let p = first.as_ptr();
    // SAFETY: data_off/data_len are in bounds of the backing buffer.
    let head = unsafe {
        slice::from_raw_parts_mut(
            (*p).data_base().add((*p).data_off as usize),
            (*p).data_len as usize,
        )
    };
    // SAFETY: plain field reads, disjoint from `head`.
    let (t, l2, l3_len, pkt_len, next) = unsafe {
        (
            (*p).ptype,
            (*p).l2_len as usize,
            (*p).l3_len as usize,
            (*p).pkt_len as usize,
            (*p).next,
        )
    };
    if head.len() < l2 + l3_len {
        debug!("checksum skipped: headers not in first segment");
        return;
    }

    if t.is_ipv4() && l3_len >= 20 {
        head[l2 + 10] = 0;
        head[l2 + 11] = 0;
        let c = Sum16BitWords::new()
            .add_slice(&head[l2..l2 + l3_len])
            .ones_complement();
        head[l2 + 10..l2 + 12].copy_from_slice(&c.to_be_bytes());
    }

    let (proto, cks_field) = match t.l4 {
        L4Kind::Tcp => (6u8, 16usize),
        L4Kind::Udp => (17u8, 6usize),
        _ => return,
    };
    let l4_off = l2 + l3_len;
    if pkt_len < l4_off || head.len() < l4_off + cks_field + 2 {
        debug!("checksum skipped: L4 header not in first segment");
        return;
    }
    if (t.is_ipv4() && l3_len < 20) || (t.is_ipv6() && l3_len < 40) {
        debug!("checksum skipped: implausible L3 header length {l3_len}");
        return;
    }
    let l4_len = pkt_len - l4_off;
    head[l4_off + cks_field] = 0;
    head[l4_off + cks_field + 1] = 0;

    let mut sum = Sum16BitWords::new();
    if t.is_ipv4() {
        sum = sum
            .add_slice(&head[l2 + 12..l2 + 20])
            .add_2bytes([0, proto])
            .add_2bytes((l4_len as u16).to_be_bytes());
    } else if t.is_ipv6() {
        sum = sum
            .add_slice(&head[l2 + 8..l2 + 40])
            .add_4bytes((l4_len as u32).to_be_bytes())
            .add_4bytes([0, 0, 0, proto]);
    } else {
        return;
    }

    let mut pending = None;
    sum = add_chain_bytes(sum, &mut pending, &head[l4_off..]);
    let mut cur = next;
    while let Some(seg) = cur {
        // SAFETY: chain segments are valid and disjoint from `head`.
        unsafe {
            sum = add_chain_bytes(sum, &mut pending, (*seg.as_ptr()).payload());
            cur = (*seg.as_ptr()).next;
        }
    }
    if let Some(hi) = pending {
        sum = sum.add_2bytes([hi, 0]);
    }
    let mut c = sum.ones_complement();
    if t.l4 == L4Kind::Udp && c == 0 {
        c = 0xffff;
    }
    head[l4_off + cks_field..l4_off + cks_field + 2].copy_from_slice(&c.to_be_bytes());
}

/// Fills the annotation with result-request fields and flags the descriptor
/// so hardware computes the checksums. Callers must have verified the
/// header-room precondition ([`TX_ANNOT_MIN`]) first.
pub(crate) fn request_hw_checksum(pkt: &PacketBuf, fd: &mut FrameDesc, annot: &mut Annotation) {
    annot.l3_req = if pkt.ptype.is_ipv4() {
        L3_REQ_IPV4
    } else if pkt.ptype.is_ipv6() {
        L3_REQ_IPV6
    } else {
        0
    };
    annot.l4_req = match pkt.ptype.l4 {
        L4Kind::Tcp => L4_REQ_TCP,
        L4Kind::Udp => L4_REQ_UDP,
        _ => 0,
    };
    annot.l3_off = pkt.l2_len;
    annot.l4_off = (pkt.l2_len as u16).saturating_add(pkt.l3_len).min(u8::MAX as u16) as u8;
    fd.cmd |= FdCmd::PARSE_RESULTS | FdCmd::DO_CHECKSUM;
}

#[inline]
pub(crate) fn tx_headroom_ok(data_off: u16) -> bool {
    data_off >= TX_ANNOT_MIN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolId, acquire_buf};
    use crate::sim::{SimNic, SimPoolSpec};

    fn nic() -> SimNic {
        SimNic::new(
            &[SimPoolSpec {
                id: PoolId(1),
                buf_size: 2048,
                count: 4,
            }],
            1,
            8,
        )
    }

    #[test]
    fn software_checksum_reproduces_known_ipv4_tcp_value() {
        let nic = nic();
        let info = *nic.pool_info(PoolId(1));
        let pkt = acquire_buf(&nic, &info).unwrap();

        // ihl=5, total_len=40, ttl=64, proto=TCP, 192.168.0.1 -> 192.168.0.2,
        // SYN with window 0x7210. One's-complement sums give 0xf97b for the
        // IP header and 0xba73 for TCP.
        let mut frame = Vec::new();
        frame.extend_from_slice(&[2, 0, 0, 0, 0, 2, 2, 0, 0, 0, 0, 1, 0x08, 0x00]);
        frame.extend_from_slice(&[
            0x45, 0x00, 0x00, 0x28, 0x00, 0x01, 0x00, 0x00, 0x40, 0x06, 0x00, 0x00, 0xc0,
            0xa8, 0x00, 0x01, 0xc0, 0xa8, 0x00, 0x02,
        ]);
        frame.extend_from_slice(&[
            0x00, 0x50, 0x01, 0xbb, 0, 0, 0, 0, 0, 0, 0, 0, 0x50, 0x02, 0x72, 0x10, 0x00,
            0x00, 0x00, 0x00,
        ]);
        // Garbage where the checksums belong.
        frame[24] = 0xaa;
        frame[25] = 0xbb;
        frame[50] = 0xcc;
        frame[51] = 0xdd;

        unsafe {
            let p = pkt.as_ptr();
            (*p).append(&frame).unwrap();
            (*p).ptype = pt(L2Kind::Ether, L3Kind::Ipv4, L4Kind::Tcp);
            (*p).l2_len = 14;
            (*p).l3_len = 20;
            software_checksum(pkt);
            let out = (*p).payload();
            assert_eq!(&out[24..26], &[0xf9, 0x7b]);
            assert_eq!(&out[50..52], &[0xba, 0x73]);
        }
    }

    #[test]
    fn software_checksum_spans_segment_chain() {
        let nic = nic();
        let info = *nic.pool_info(PoolId(1));

        let builder = etherparse::PacketBuilder::ethernet2(
            [2, 0, 0, 0, 0, 1],
            [2, 0, 0, 0, 0, 2],
        )
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 32)
        .udp(1000, 2000);
        let mut good = Vec::new();
        builder.write(&mut good, &[0x61; 31]).unwrap();
        let mut mangled = good.clone();
        mangled[24] = 0xff; // IP checksum
        mangled[25] = 0xfe;
        mangled[40] = 0x12; // UDP checksum
        mangled[41] = 0x34;

        // Split at an odd boundary inside the L4 payload so the summation
        // has to carry a dangling byte across the segment edge.
        let cut = 47;
        let a = acquire_buf(&nic, &info).unwrap();
        let b = acquire_buf(&nic, &info).unwrap();
        unsafe {
            (*a.as_ptr()).append(&mangled[..cut]).unwrap();
            (*b.as_ptr()).append(&mangled[cut..]).unwrap();
            (*a.as_ptr()).next = Some(b);
            (*a.as_ptr()).nb_segs = 2;
            (*a.as_ptr()).pkt_len = mangled.len() as u32;
            (*a.as_ptr()).ptype = pt(L2Kind::Ether, L3Kind::Ipv4, L4Kind::Udp);
            (*a.as_ptr()).l2_len = 14;
            (*a.as_ptr()).l3_len = 20;
            software_checksum(a);

            let mut out = (*a.as_ptr()).payload().to_vec();
            out.extend_from_slice((*b.as_ptr()).payload());
            assert_eq!(out, good);
        }
    }

    #[test]
    fn classification_completeness() {
        use {L2Kind::*, L3Kind::*, L4Kind::*};
        let cases = [
            (CLASS_NONE, pt(L2Kind::Unknown, L3Kind::Unknown, L4Kind::Unknown)),
            (CLASS_ETHER, pt(Ether, L3Kind::Unknown, L4Kind::Unknown)),
            (CLASS_IPV4, pt(Ether, Ipv4, L4Kind::Unknown)),
            (CLASS_IPV6, pt(Ether, Ipv6, L4Kind::Unknown)),
            (CLASS_IPV4_EXT, pt(Ether, Ipv4Ext, L4Kind::Unknown)),
            (CLASS_IPV6_EXT, pt(Ether, Ipv6Ext, L4Kind::Unknown)),
            (CLASS_IPV4_TCP, pt(Ether, Ipv4, Tcp)),
            (CLASS_IPV6_TCP, pt(Ether, Ipv6, Tcp)),
            (CLASS_IPV4_UDP, pt(Ether, Ipv4, Udp)),
            (CLASS_IPV6_UDP, pt(Ether, Ipv6, Udp)),
            (CLASS_IPV4_SCTP, pt(Ether, Ipv4, Sctp)),
            (CLASS_IPV6_SCTP, pt(Ether, Ipv6, Sctp)),
        ];
        for (word, expected) in cases {
            assert_eq!(classify(word), Some(expected), "word {word:#x}");
            // The VLAN bit must not disturb the decode.
            assert_eq!(classify(word | CW_VLAN), Some(expected));
            assert_eq!(class_word_for(expected), word);
        }
        // Anything outside the defined set routes to the slow path.
        for word in [
            CW_ETHER | CW_IPV4 | CW_IPV6,
            CW_TCP,
            CW_ETHER | CW_TCP | CW_UDP | CW_IPV4,
            0xdead,
        ] {
            assert_eq!(classify(word), None, "word {word:#x}");
        }
    }

    #[test]
    fn slow_walk_ipv4_tcp() {
        let builder = etherparse::PacketBuilder::ethernet2(
            [2, 0, 0, 0, 0, 1],
            [2, 0, 0, 0, 0, 2],
        )
        .ipv4([192, 168, 0, 1], [192, 168, 0, 2], 64)
        .tcp(80, 443, 0, 29200);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[1, 2, 3, 4]).unwrap();

        let (t, l2, l3) = slow_classify(&frame);
        assert_eq!(t, pt(L2Kind::Ether, L3Kind::Ipv4, L4Kind::Tcp));
        assert_eq!(l2, 14);
        assert_eq!(l3, 20);
    }

    #[test]
    fn slow_walk_vlan_udp() {
        let builder = etherparse::PacketBuilder::ethernet2(
            [2, 0, 0, 0, 0, 1],
            [2, 0, 0, 0, 0, 2],
        )
        .single_vlan(etherparse::VlanId::try_from(7).unwrap())
        .ipv6([1; 16], [2; 16], 64)
        .udp(5353, 5353);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[0xab; 16]).unwrap();

        let (t, l2, l3) = slow_classify(&frame);
        assert_eq!(t, pt(L2Kind::Ether, L3Kind::Ipv6, L4Kind::Udp));
        assert_eq!(l2, 18);
        assert_eq!(l3, 40);
    }

    #[test]
    fn slow_walk_non_ip() {
        let mut frame = vec![0u8; 60];
        frame[12] = 0x08;
        frame[13] = 0x06; // ARP
        let (t, l2, l3) = slow_classify(&frame);
        assert_eq!(t, pt(L2Kind::Ether, L3Kind::Unknown, L4Kind::Unknown));
        assert_eq!(l2, 14);
        assert_eq!(l3, 0);
    }
}
