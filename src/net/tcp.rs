//! TCP state machine (spec 4.9), grounded on
//! `original_source/kernel/tcp.c`/`.h`.
//!
//! Like `net::udp`, the original's `void *private` becomes a side table
//! (`Vec<Pcb>`) keyed by [`SocketId`] rather than an embedded enum in
//! [`crate::net::socket::Socket`].

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::{
    TCP_DEFAULT_RTO_MS, TCP_DUP_ACK_THRESHOLD, TCP_FIN_TIMEOUT_MS, TCP_MAX_RTO_MS, TCP_MIN_RTO_MS,
    TCP_MSS, TCP_RWND_INITIAL,
};
use crate::error::{KernelError, KResult};
use crate::net::addr::Ipv4Addr;
use crate::net::ip::{self, IPPROTO_TCP};
use crate::net::skb::Skb;
use crate::net::socket::{self, SockType, Socket, SocketAddr, SocketId};
use crate::serial_println;
use crate::timer::{self, TimerId};

const HEADER_LEN: usize = 20;

const FLAG_FIN: u16 = 1 << 0;
const FLAG_SYN: u16 = 1 << 1;
const FLAG_RST: u16 = 1 << 2;
const FLAG_PSH: u16 = 1 << 3;
const FLAG_ACK: u16 = 1 << 4;

/// TCP connection state, per spec section 4.9's state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

struct OutboxEntry {
    seq: u32,
    len: u32,
    flags: u16,
    data: Vec<u8>,
    transmissions: u32,
    sent_at_ms: u64,
    timer: Option<TimerId>,
}

struct OutOfOrderSegment {
    seq: u32,
    data: Vec<u8>,
    fin: bool,
}

struct Pcb {
    id: SocketId,
    state: TcpState,

    // Listening sockets only.
    backlog: Vec<SocketId>,

    inbox_ready: VecDeque<u8>,
    out_of_order: Vec<OutOfOrderSegment>,

    outbox: VecDeque<OutboxEntry>,

    rwnd_size: i32,
    last_advertised_rwnd: i32,

    ack_num: u32,
    seq_num: u32,

    last_ack_seen: Option<u32>,
    duplicate_ack_counter: u32,
    reset_flag: bool,

    estimated_rtt_ms: Option<u64>,
    variance_rtt_ms: u64,
}

impl Pcb {
    fn new(id: SocketId) -> Self {
        Self {
            id,
            state: TcpState::Closed,
            backlog: Vec::new(),
            inbox_ready: VecDeque::new(),
            out_of_order: Vec::new(),
            outbox: VecDeque::new(),
            rwnd_size: TCP_RWND_INITIAL,
            last_advertised_rwnd: TCP_RWND_INITIAL,
            ack_num: 0,
            seq_num: 0,
            last_ack_seen: None,
            duplicate_ack_counter: 0,
            reset_flag: false,
            estimated_rtt_ms: None,
            variance_rtt_ms: 0,
        }
    }

    fn rto_ms(&self) -> u64 {
        match self.estimated_rtt_ms {
            None => TCP_DEFAULT_RTO_MS,
            Some(est) => (est + 4 * self.variance_rtt_ms).clamp(TCP_MIN_RTO_MS, TCP_MAX_RTO_MS),
        }
    }

    fn on_rtt_sample(&mut self, sample_ms: u64) {
        match self.estimated_rtt_ms {
            None => {
                self.estimated_rtt_ms = Some(sample_ms);
                self.variance_rtt_ms = sample_ms / 2;
            }
            Some(est) => {
                let new_est = (7 * est + sample_ms) / 8;
                let diff = sample_ms.abs_diff(est);
                self.variance_rtt_ms = (3 * self.variance_rtt_ms + diff) / 4;
                self.estimated_rtt_ms = Some(new_est);
            }
        }
    }
}

lazy_static! {
    static ref TABLE: Mutex<Vec<Pcb>> = Mutex::new(Vec::new());
}

/// `(int32_t)(a - b)`: modular sequence-number comparison. Positive
/// means `a` is ahead of `b`.
fn seq_cmp(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Whether the advertised window grew from below one MSS to at or above
/// one MSS, the trigger point for an unsolicited window-update ACK.
fn window_crossed_mss_upward(before: i32, after: i32) -> bool {
    before < TCP_MSS as i32 && after >= TCP_MSS as i32
}

/// Creates the PCB for a freshly allocated TCP socket. Mirrors `tcp_ctor`.
pub fn socket(sock: &Socket) {
    TABLE.lock().push(Pcb::new(sock.id()));
}

fn with_pcb<R>(id: SocketId, f: impl FnOnce(&mut Pcb) -> R) -> Option<R> {
    TABLE.lock().iter_mut().find(|p| p.id == id).map(f)
}

/// Initiates an active open: sends SYN and arms the retransmit timer.
pub fn connect(sock: &Socket, ip: Ipv4Addr, port: u16) -> KResult<()> {
    if !sock.is_bound() {
        sock.bind(Ipv4Addr::ANY, 0)?;
    }
    sock.set_remote(SocketAddr { ip, port });

    let iss = (socket::prng_next() & 0xffff_ffff) as u32;
    with_pcb(sock.id(), |pcb| {
        pcb.state = TcpState::SynSent;
        pcb.seq_num = iss;
    });

    send_segment(sock, FLAG_SYN, &[])
}

/// Starts a passive open: marks the socket as listening.
pub fn listen(sock: &Socket) -> KResult<()> {
    sock.set_listening(true);
    with_pcb(sock.id(), |pcb| pcb.state = TcpState::Listen);
    Ok(())
}

/// Pops one fully-established connection off the listening socket's
/// backlog.
pub fn accept(sock: &Socket) -> KResult<Socket> {
    let child_id = with_pcb(sock.id(), |pcb| {
        if pcb.backlog.is_empty() {
            None
        } else {
            Some(pcb.backlog.remove(0))
        }
    })
    .flatten()
    .ok_or(KernelError::WouldBlock)?;

    socket::find_by_id(child_id).ok_or(KernelError::NotFound)
}

/// Reads up to `buf.len()` bytes of in-order received data.
///
/// If draining the inbox opens the advertised window back up across one
/// MSS (spec 4.9: a receiver that let its window shrink below a full
/// segment must tell the sender as soon as it has room for one again,
/// rather than waiting for the next outbound data or inbound segment to
/// carry the update), sends an explicit window-update ACK.
pub fn recvfrom(sock: &Socket) -> KResult<Vec<u8>> {
    let (data, window_opened) = with_pcb(sock.id(), |pcb| {
        if pcb.inbox_ready.is_empty() {
            if pcb.state == TcpState::Closed && pcb.reset_flag {
                return Err(KernelError::ConnectionReset);
            }
            return Err(KernelError::WouldBlock);
        }
        let data: Vec<u8> = pcb.inbox_ready.drain(..).collect();
        let before = pcb.last_advertised_rwnd;
        pcb.rwnd_size += data.len() as i32;
        let window_opened = window_crossed_mss_upward(before, pcb.rwnd_size);
        Ok((data, window_opened))
    })
    .ok_or(KernelError::InvalidArgument)??;

    if window_opened {
        send_segment(sock, FLAG_ACK, &[])?;
    }
    Ok(data)
}

/// Splits `buf` into `<= MSS`-byte segments, sends each immediately, and
/// inserts it into the outbox with its own retransmit timer.
pub fn sendto(sock: &Socket, buf: &[u8]) -> KResult<usize> {
    let state = with_pcb(sock.id(), |pcb| pcb.state).ok_or(KernelError::InvalidArgument)?;
    if state != TcpState::Established && state != TcpState::CloseWait {
        return Err(KernelError::InvalidArgument);
    }

    for chunk in buf.chunks(TCP_MSS) {
        send_segment(sock, FLAG_ACK | FLAG_PSH, chunk)?;
    }
    Ok(buf.len())
}

/// Sends a FIN and transitions out of `ESTABLISHED`/`CLOSE_WAIT`.
pub fn close(sock: &Socket) -> KResult<()> {
    let state = with_pcb(sock.id(), |pcb| pcb.state).ok_or(KernelError::InvalidArgument)?;
    match state {
        TcpState::Established => {
            send_segment(sock, FLAG_FIN | FLAG_ACK, &[])?;
            with_pcb(sock.id(), |pcb| pcb.state = TcpState::FinWait1);
        }
        TcpState::CloseWait => {
            send_segment(sock, FLAG_FIN | FLAG_ACK, &[])?;
            with_pcb(sock.id(), |pcb| pcb.state = TcpState::LastAck);
        }
        TcpState::Listen | TcpState::SynSent => {
            with_pcb(sock.id(), |pcb| pcb.state = TcpState::Closed);
            TABLE.lock().retain(|p| p.id != sock.id());
            sock.release();
        }
        _ => {}
    }
    Ok(())
}

fn send_segment(sock: &Socket, flags: u16, payload: &[u8]) -> KResult<()> {
    let local = sock.local();
    let remote = sock.remote();

    let seq = with_pcb(sock.id(), |pcb| {
        let seq = pcb.seq_num;
        let seg_len = payload.len() as u32 + u32::from(flags & (FLAG_SYN | FLAG_FIN) != 0);
        pcb.seq_num = pcb.seq_num.wrapping_add(seg_len);
        seq
    })
    .ok_or(KernelError::InvalidArgument)?;

    let ack = with_pcb(sock.id(), |pcb| pcb.ack_num).unwrap_or(0);
    let window = with_pcb(sock.id(), |pcb| pcb.rwnd_size.max(0) as u16).unwrap_or(0);

    let skb = Skb::alloc(HEADER_LEN + payload.len());
    skb.reserve(HEADER_LEN)?;
    skb.put(payload.len())?;
    if !payload.is_empty() {
        skb.write_at(0, payload)?;
    }
    skb.push(HEADER_LEN)?;
    skb.set_transport_header();

    let ack_flag = if flags & FLAG_SYN != 0 && flags & FLAG_ACK == 0 {
        // plain SYN (active open) carries no ack yet, matches original's
        // "every sent packet except in SYN_SENT carries the cumulative ACK"
        flags
    } else {
        flags | FLAG_ACK
    };

    skb.with_data_mut(|data| {
        data[0..2].copy_from_slice(&local.port.to_be_bytes());
        data[2..4].copy_from_slice(&remote.port.to_be_bytes());
        data[4..8].copy_from_slice(&seq.to_be_bytes());
        data[8..12].copy_from_slice(&ack.to_be_bytes());
        data[12] = 5 << 4; // data offset = 5 words, no options
        data[13] = (ack_flag & 0xff) as u8;
        data[14..16].copy_from_slice(&window.to_be_bytes());
        data[16..18].copy_from_slice(&0u16.to_be_bytes());
        data[18..20].copy_from_slice(&0u16.to_be_bytes());
    });

    let checksum = ip::pseudo_checksum(&skb, local.ip, remote.ip, IPPROTO_TCP);
    skb.with_data_mut(|data| data[16..18].copy_from_slice(&checksum.to_be_bytes()));
    skb.clear_transport_header();

    let rto = with_pcb(sock.id(), Pcb::rto_ms).unwrap_or(TCP_DEFAULT_RTO_MS);
    let seg_len = payload.len() as u32 + u32::from(ack_flag & (FLAG_SYN | FLAG_FIN) != 0);
    let sock_for_timer = sock.clone();
    let timer_id = timer::schedule(rto, move || retransmit(&sock_for_timer, seq));

    with_pcb(sock.id(), |pcb| {
        pcb.last_advertised_rwnd = pcb.rwnd_size;
        pcb.outbox.push_back(OutboxEntry {
            seq,
            len: seg_len,
            flags: ack_flag,
            data: payload.to_vec(),
            transmissions: 1,
            sent_at_ms: timer::now_ms(),
            timer: Some(timer_id),
        });
    });

    ip::send(&skb, remote.ip, IPPROTO_TCP)
}

fn retransmit(sock: &Socket, seq: u32) {
    let local = sock.local();
    let remote = sock.remote();

    let entry_data = with_pcb(sock.id(), |pcb| {
        pcb.outbox.iter_mut().find(|e| e.seq == seq).map(|e| {
            e.transmissions += 1;
            e.sent_at_ms = timer::now_ms();
            (e.flags, e.data.clone(), e.transmissions)
        })
    })
    .flatten();

    let Some((flags, data, transmissions)) = entry_data else {
        return;
    };

    let skb = Skb::alloc(HEADER_LEN + data.len());
    if skb.reserve(HEADER_LEN).is_err() {
        return;
    }
    let _ = skb.put(data.len());
    if !data.is_empty() {
        let _ = skb.write_at(0, &data);
    }
    let _ = skb.push(HEADER_LEN);
    skb.set_transport_header();

    let ack = with_pcb(sock.id(), |pcb| pcb.ack_num).unwrap_or(0);
    skb.with_data_mut(|d| {
        d[0..2].copy_from_slice(&local.port.to_be_bytes());
        d[2..4].copy_from_slice(&remote.port.to_be_bytes());
        d[4..8].copy_from_slice(&seq.to_be_bytes());
        d[8..12].copy_from_slice(&ack.to_be_bytes());
        d[12] = 5 << 4;
        d[13] = (flags & 0xff) as u8;
        d[14..16].copy_from_slice(&0u16.to_be_bytes());
        d[16..18].copy_from_slice(&0u16.to_be_bytes());
        d[18..20].copy_from_slice(&0u16.to_be_bytes());
    });
    let checksum = ip::pseudo_checksum(&skb, local.ip, remote.ip, IPPROTO_TCP);
    skb.with_data_mut(|d| d[16..18].copy_from_slice(&checksum.to_be_bytes()));
    skb.clear_transport_header();
    let _ = ip::send(&skb, remote.ip, IPPROTO_TCP);

    // Karn's backoff: each retransmission doubles this packet's own timeout.
    let base_rto = with_pcb(sock.id(), Pcb::rto_ms).unwrap_or(TCP_DEFAULT_RTO_MS);
    let backoff = base_rto.saturating_mul(1u64 << transmissions.min(6)).clamp(TCP_MIN_RTO_MS, TCP_MAX_RTO_MS);
    let sock_for_timer = sock.clone();
    let new_timer = timer::schedule(backoff, move || retransmit(&sock_for_timer, seq));
    with_pcb(sock.id(), |pcb| {
        if let Some(e) = pcb.outbox.iter_mut().find(|e| e.seq == seq) {
            e.timer = Some(new_timer);
        }
    });
}

/// Advances the outbox past every entry fully covered by `ack_num = N`,
/// updating the RTT estimator for untransmitted-more-than-once entries
/// (Karn's algorithm) and the duplicate-ACK counter.
fn process_ack(sock: &Socket, ack_num: u32, window: u16) {
    let fired = with_pcb(sock.id(), |pcb| {
        let before_len = pcb.outbox.len();
        let mut rtt_sample = None;
        while let Some(front) = pcb.outbox.front() {
            if seq_cmp(front.seq.wrapping_add(front.len), ack_num) > 0 {
                break;
            }
            let entry = pcb.outbox.pop_front().expect("front just matched");
            if let Some(id) = entry.timer {
                timer::cancel(id);
            }
            if entry.transmissions == 1 {
                rtt_sample = Some(timer::now_ms().saturating_sub(entry.sent_at_ms));
            }
        }
        let advanced = pcb.outbox.len() != before_len;

        if let Some(sample) = rtt_sample {
            pcb.on_rtt_sample(sample);
        }

        if advanced {
            pcb.duplicate_ack_counter = 0;
        } else if pcb.last_ack_seen == Some(ack_num) {
            pcb.duplicate_ack_counter += 1;
        } else {
            pcb.duplicate_ack_counter = 1;
        }
        pcb.last_ack_seen = Some(ack_num);
        pcb.rwnd_size = i32::from(window);

        let should_fast_retransmit = !advanced && pcb.duplicate_ack_counter >= TCP_DUP_ACK_THRESHOLD;
        (should_fast_retransmit, pcb.outbox.front().map(|e| e.seq))
    });

    if let Some((true, Some(earliest_seq))) = fired {
        retransmit(sock, earliest_seq);
    }
}

/// Handles an incoming TCP segment.
pub fn handle_rx(src_ip: Ipv4Addr, skb: &Skb) -> KResult<()> {
    if !skb.may_pull(HEADER_LEN) {
        serial_println!("TCP segment too small");
        return Err(KernelError::InvalidArgument);
    }

    let (src_port, dest_port, seq, ack, flags, window, payload_offset) = skb.with_data(|data| {
        let data_offset = usize::from(data[12] >> 4) * 4;
        (
            u16::from_be_bytes([data[0], data[1]]),
            u16::from_be_bytes([data[2], data[3]]),
            u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            u16::from(data[13]),
            u16::from_be_bytes([data[14], data[15]]),
            data_offset,
        )
    });

    skb.set_transport_header();
    skb.pull(payload_offset.max(HEADER_LEN))?;

    let remote = SocketAddr { ip: src_ip, port: src_port };

    let Some(sock) = find_socket_for_segment(dest_port, remote) else {
        serial_println!("No TCP socket for segment, dropping");
        return Err(KernelError::NotFound);
    };

    let payload = skb.with_data(alloc::borrow::ToOwned::to_owned);
    process_segment(&sock, src_ip, src_port, seq, ack, flags, window, payload)
}

/// Demultiplexes an incoming segment by the 4-tuple `(dest_port, remote)`:
/// an established or handshaking connection wins over a listening socket
/// on the same port (a TCP listener's children share its local port,
/// distinguished only by remote address, so `net::socket`'s address-only
/// lookup can't tell them apart).
fn find_socket_for_segment(dest_port: u16, remote: SocketAddr) -> Option<Socket> {
    let ids: Vec<SocketId> = TABLE.lock().iter().map(|p| p.id).collect();
    let mut listener = None;
    for id in ids {
        let Some(sock) = socket::find_by_id(id) else { continue };
        if sock.local().port != dest_port {
            continue;
        }
        if sock.is_listening() {
            listener.get_or_insert(sock);
            continue;
        }
        if sock.remote() == remote {
            return Some(sock);
        }
    }
    listener
}

#[expect(clippy::too_many_arguments, reason = "mirrors one incoming wire segment's fields")]
fn process_segment(
    sock: &Socket,
    src_ip: Ipv4Addr,
    src_port: u16,
    seq: u32,
    ack: u32,
    flags: u16,
    window: u16,
    payload: Vec<u8>,
) -> KResult<()> {
    let state = with_pcb(sock.id(), |pcb| pcb.state).ok_or(KernelError::InvalidArgument)?;

    if flags & FLAG_RST != 0 {
        with_pcb(sock.id(), |pcb| {
            pcb.reset_flag = true;
            pcb.state = TcpState::Closed;
        });
        return Ok(());
    }

    match state {
        TcpState::Listen => {
            if flags & FLAG_SYN != 0 {
                let child = Socket::alloc(SockType::Tcp);
                child.adopt_local(sock.local());
                child.set_remote(SocketAddr { ip: src_ip, port: src_port });
                socket(&child);
                let iss = (socket::prng_next() & 0xffff_ffff) as u32;
                with_pcb(child.id(), |pcb| {
                    pcb.state = TcpState::SynReceived;
                    pcb.seq_num = iss;
                    pcb.ack_num = seq.wrapping_add(1);
                });
                with_pcb(sock.id(), |pcb| pcb.backlog.push(child.id()));
                send_segment(&child, FLAG_SYN | FLAG_ACK, &[])?;
            }
        }
        TcpState::SynSent => {
            if flags & FLAG_SYN != 0 && flags & FLAG_ACK != 0 {
                with_pcb(sock.id(), |pcb| {
                    pcb.ack_num = seq.wrapping_add(1);
                    pcb.state = TcpState::Established;
                });
                process_ack(sock, ack, window);
                send_segment(sock, FLAG_ACK, &[])?;
            } else if flags & FLAG_SYN != 0 {
                with_pcb(sock.id(), |pcb| {
                    pcb.ack_num = seq.wrapping_add(1);
                    pcb.state = TcpState::SynReceived;
                });
                send_segment(sock, FLAG_SYN | FLAG_ACK, &[])?;
            }
        }
        TcpState::SynReceived => {
            if flags & FLAG_ACK != 0 {
                with_pcb(sock.id(), |pcb| pcb.state = TcpState::Established);
                process_ack(sock, ack, window);
            }
        }
        TcpState::Established | TcpState::CloseWait => {
            if flags & FLAG_ACK != 0 {
                process_ack(sock, ack, window);
            }
            let fin = flags & FLAG_FIN != 0;
            if !payload.is_empty() || fin {
                deliver_inbox(sock, seq, &payload, fin)?;
            }
        }
        TcpState::FinWait1 => {
            if flags & FLAG_ACK != 0 {
                process_ack(sock, ack, window);
            }
            let fin_acked = with_pcb(sock.id(), |pcb| pcb.outbox.is_empty()).unwrap_or(false);
            if flags & FLAG_FIN != 0 {
                with_pcb(sock.id(), |pcb| pcb.state = TcpState::Closing);
                send_segment(sock, FLAG_ACK, &[])?;
            } else if fin_acked {
                with_pcb(sock.id(), |pcb| pcb.state = TcpState::FinWait2);
                arm_fin_timeout(sock);
            }
        }
        TcpState::FinWait2 => {
            if flags & FLAG_FIN != 0 {
                with_pcb(sock.id(), |pcb| pcb.state = TcpState::TimeWait);
                send_segment(sock, FLAG_ACK, &[])?;
                arm_fin_timeout(sock);
            }
        }
        TcpState::Closing => {
            if flags & FLAG_ACK != 0 {
                let fin_acked = with_pcb(sock.id(), |pcb| {
                    process_ack_inline(pcb, ack, window);
                    pcb.outbox.is_empty()
                })
                .unwrap_or(false);
                if fin_acked {
                    with_pcb(sock.id(), |pcb| pcb.state = TcpState::TimeWait);
                    arm_fin_timeout(sock);
                }
            }
        }
        TcpState::LastAck => {
            if flags & FLAG_ACK != 0 {
                let fin_acked = with_pcb(sock.id(), |pcb| {
                    process_ack_inline(pcb, ack, window);
                    pcb.outbox.is_empty()
                })
                .unwrap_or(false);
                if fin_acked {
                    finalize_close(sock);
                }
            }
        }
        TcpState::TimeWait | TcpState::Closed => {}
    }
    Ok(())
}

/// Same bookkeeping as [`process_ack`] but callable while a `pcb` lock is
/// already held (used from the `Closing`/`LAST_ACK` transitions, which
/// need to check `outbox.is_empty()` immediately after).
fn process_ack_inline(pcb: &mut Pcb, ack_num: u32, window: u16) {
    while let Some(front) = pcb.outbox.front() {
        if seq_cmp(front.seq.wrapping_add(front.len), ack_num) > 0 {
            break;
        }
        let entry = pcb.outbox.pop_front().expect("front just matched");
        if let Some(id) = entry.timer {
            timer::cancel(id);
        }
    }
    pcb.rwnd_size = i32::from(window);
}

fn deliver_inbox(sock: &Socket, seq: u32, payload: &[u8], fin: bool) -> KResult<()> {
    with_pcb(sock.id(), |pcb| {
        if seq_cmp(seq.wrapping_add(payload.len() as u32), pcb.ack_num) <= 0 {
            // Fully old/duplicate segment; nothing new, but still re-ACK
            // so the sender's duplicate-ACK counter can trip fast retransmit.
            return;
        }

        if seq == pcb.ack_num {
            let skip = 0usize;
            pcb.inbox_ready.extend(&payload[skip..]);
            pcb.rwnd_size -= (payload.len() - skip) as i32;
            pcb.ack_num = pcb.ack_num.wrapping_add(payload.len() as u32);

            if fin {
                pcb.ack_num = pcb.ack_num.wrapping_add(1);
                pcb.state = match pcb.state {
                    TcpState::Established => TcpState::CloseWait,
                    TcpState::CloseWait => TcpState::CloseWait,
                    other => other,
                };
            }

            // Merge any now-contiguous out-of-order segments.
            loop {
                let next = pcb
                    .out_of_order
                    .iter()
                    .position(|s| seq_cmp(s.seq, pcb.ack_num) <= 0);
                let Some(idx) = next else { break };
                let seg = pcb.out_of_order.remove(idx);
                let end = seg.seq.wrapping_add(seg.data.len() as u32);
                if seq_cmp(end, pcb.ack_num) > 0 {
                    let skip = (pcb.ack_num.wrapping_sub(seg.seq)) as usize;
                    pcb.inbox_ready.extend(&seg.data[skip.min(seg.data.len())..]);
                    pcb.ack_num = end;
                }
                if seg.fin {
                    pcb.ack_num = pcb.ack_num.wrapping_add(1);
                }
            }
        } else if seq_cmp(seq, pcb.ack_num) > 0 {
            pcb.out_of_order.push(OutOfOrderSegment {
                seq,
                data: payload.to_vec(),
                fin,
            });
        }

        pcb.last_advertised_rwnd = pcb.rwnd_size;
    });

    send_segment(sock, FLAG_ACK, &[])?;
    Ok(())
}

fn arm_fin_timeout(sock: &Socket) {
    let sock_for_timer = sock.clone();
    timer::schedule(TCP_FIN_TIMEOUT_MS, move || finalize_close(&sock_for_timer));
}

fn finalize_close(sock: &Socket) {
    with_pcb(sock.id(), |pcb| pcb.state = TcpState::Closed);
    TABLE.lock().retain(|p| p.id != sock.id());
    sock.release();
}

/// Current connection state, for tests and diagnostics.
#[must_use]
pub fn state_of(sock: &Socket) -> Option<TcpState> {
    with_pcb(sock.id(), |pcb| pcb.state)
}

#[cfg(test)]
pub fn reset_for_test() {
    TABLE.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn window_update_fires_only_when_crossing_one_mss_upward() {
        assert!(window_crossed_mss_upward(TCP_MSS as i32 - 1, TCP_MSS as i32));
        assert!(!window_crossed_mss_upward(TCP_MSS as i32, TCP_MSS as i32 + 100), "already above one MSS");
        assert!(!window_crossed_mss_upward(0, TCP_MSS as i32 - 1), "still below one MSS");
    }

    #[test_case]
    fn seq_cmp_handles_wraparound() {
        assert!(seq_cmp(5, 3) > 0);
        assert!(seq_cmp(3, 5) < 0);
        assert!(seq_cmp(0, u32::MAX) > 0);
    }

    #[test_case]
    fn rtt_estimator_first_sample_sets_variance_to_half() {
        let mut pcb = Pcb::new(SocketId::for_test(1));
        pcb.on_rtt_sample(100);
        assert_eq!(pcb.estimated_rtt_ms, Some(100));
        assert_eq!(pcb.variance_rtt_ms, 50);
    }

    #[test_case]
    fn rtt_estimator_applies_jacobson_formula_on_second_sample() {
        let mut pcb = Pcb::new(SocketId::for_test(1));
        pcb.on_rtt_sample(100);
        pcb.on_rtt_sample(200);
        assert_eq!(pcb.estimated_rtt_ms, Some((7 * 100 + 200) / 8));
    }

    #[test_case]
    fn rto_defaults_before_any_sample() {
        let pcb = Pcb::new(SocketId::for_test(1));
        assert_eq!(pcb.rto_ms(), TCP_DEFAULT_RTO_MS);
    }

    #[test_case]
    fn rto_is_clamped_to_bounds() {
        let mut pcb = Pcb::new(SocketId::for_test(1));
        pcb.estimated_rtt_ms = Some(1);
        pcb.variance_rtt_ms = 0;
        assert_eq!(pcb.rto_ms(), TCP_MIN_RTO_MS);

        pcb.estimated_rtt_ms = Some(TCP_MAX_RTO_MS * 10);
        assert_eq!(pcb.rto_ms(), TCP_MAX_RTO_MS);
    }
}
