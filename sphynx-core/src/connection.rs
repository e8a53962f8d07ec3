//! Per-connection state and the reliable/unreliable send-receive engine: four independent
//! streams, fragmentation and reassembly, and ACK/retransmission bookkeeping.
//!
//! Per-peer state sits behind a couple of narrow mutexes (`parking_lot` rather than
//! `std::sync`) instead of one big lock: `send_lock` covers outgoing queues and the in-flight
//! datagram being built, `recv_lock` covers reassembly state, and neither is ever held across a
//! syscall or an application callback.

use crate::addr::NetAddr;
use crate::crypto::aead::Aead;
use crate::flow_control::FlowControl;
use crate::wire::{AckBody, AckId, AckRange, BlockHeader, FragHeader, StreamAck, SuperOpcode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

/// Tick period driving retransmission, flow-control epochs and liveness checks.
pub const TICK_RATE_MS: u32 = 20;

pub const NUM_STREAMS: usize = 4;
pub const MIN_RTT: u32 = 50;
pub const DEFAULT_RTT: u32 = 1500;
pub const TIMEOUT_DISCONNECT: u32 = 15_000;
pub const SILENCE_LIMIT: u32 = 9_357;
pub const FRAG_THRESHOLD: usize = 32;
pub const MAX_MESSAGE_DATALEN: usize = 65_534;
const BLOCK_HEADER_MAX: usize = 2;
const ACK_ID_MAX: usize = 3;

pub const DISCO_TIMEOUT: u8 = 0xff;
pub const DISCO_TAMPERING: u8 = 0xfe;
pub const DISCO_BROKEN_PIPE: u8 = 0xfd;
pub const DISCO_USER_EXIT: u8 = 0xfc;
/// Not one of the four reserved reasons above: used by the server's shutdown sequence to tell
/// still-open connections why they are being closed.
pub const DISCO_SHUTDOWN: u8 = 0xfb;

pub const IOP_C2S_MTU_PROBE: u8 = 187;
pub const IOP_S2C_MTU_SET: u8 = 244;
pub const IOP_C2S_TIME_PING: u8 = 17;
pub const IOP_S2C_TIME_PONG: u8 = 138;
pub const IOP_DISCO: u8 = 84;

/// A fully reassembled/delivered message handed to the application.
#[derive(Debug, Clone)]
pub struct InMessage {
    pub stream: u8,
    pub payload: Vec<u8>,
}

/// Internal (SOP=INTERNAL) message handed to the connection's owner for handling, after the
/// built-ins (MTU probe/set, time ping/pong, disco) have had a chance to consume it.
#[derive(Debug, Clone)]
pub struct InternalMessage {
    pub opcode: u8,
    pub body: Vec<u8>,
}

/// Everything `on_datagram` produced from one inbound, already-decrypted datagram.
#[derive(Debug, Default)]
pub struct IngressResult {
    pub messages: Vec<InMessage>,
    pub internal: Vec<InternalMessage>,
    pub disconnect_reason: Option<u8>,
}

struct RecvEntry {
    id: u32,
    sop: SuperOpcode,
    payload: Vec<u8>,
}

struct RecvStream {
    next_expected_id: u32,
    got_reliable: bool,
    queue: VecDeque<RecvEntry>,
    frag_buffer: Vec<u8>,
    frag_total: usize,
    last_seen_id: u32,
}

impl Default for RecvStream {
    fn default() -> RecvStream {
        RecvStream {
            next_expected_id: 0,
            got_reliable: false,
            queue: VecDeque::new(),
            frag_buffer: Vec::new(),
            frag_total: 0,
            last_seen_id: 0,
        }
    }
}

struct SendEntry {
    id: u32,
    sop: SuperOpcode,
    /// Full on-wire data (including the fragment-header prefix, if any).
    payload: Vec<u8>,
    first_send_time: u32,
    /// 0 means "not yet sent" — the packer should (re)transmit it with a full-width ACK-ID.
    last_send_time: u32,
}

struct SendStream {
    next_send_id: u32,
    remote_expected: u32,
    queue: VecDeque<SendEntry>,
    sent: VecDeque<SendEntry>,
}

impl Default for SendStream {
    fn default() -> SendStream {
        SendStream {
            next_send_id: 0,
            remote_expected: 0,
            queue: VecDeque::new(),
            sent: VecDeque::new(),
        }
    }
}

struct SendState {
    streams: [SendStream; NUM_STREAMS],
    buffer: Vec<u8>,
    buffer_stream: Option<u8>,
    buffer_ack_id: Option<u32>,
    aead: Aead,
    last_any_send_time: u32,
}

struct RecvState {
    streams: [RecvStream; NUM_STREAMS],
    aead: Aead,
}

fn streams_default() -> [RecvStream; NUM_STREAMS] {
    [
        RecvStream::default(),
        RecvStream::default(),
        RecvStream::default(),
        RecvStream::default(),
    ]
}

fn send_streams_default() -> [SendStream; NUM_STREAMS] {
    [
        SendStream::default(),
        SendStream::default(),
        SendStream::default(),
        SendStream::default(),
    ]
}

const STATE_OPEN: u8 = 0;
const STATE_DISCONNECTING: u8 = 1;

/// Cached first `CHALLENGE` plus its `ANSWER`, so a lost `ANSWER` can be resent byte-for-byte if
/// the same `CHALLENGE` arrives again.
struct HandshakeCache {
    challenge: [u8; 64],
    answer: Vec<u8>,
}

/// The per-peer state. Server-owned on the server side; the whole
/// connection object on the client side.
pub struct Connection {
    pub remote_addr: NetAddr,
    pub worker_id: usize,
    last_recv_time: AtomicU32,
    max_payload_bytes: AtomicU32,
    rtt: AtomicU32,
    /// `STATE_OPEN` or `STATE_DISCONNECTING` (`Closed`
    /// has no bit of its own — it's the fact of having been removed from the connection map).
    state: AtomicU8,
    clock_offset_ms: AtomicI32,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    pub flow_control: Mutex<FlowControl>,
    handshake_cache: Mutex<Option<HandshakeCache>>,
}

impl Connection {
    pub fn new(
        remote_addr: NetAddr,
        worker_id: usize,
        send_key: [u8; 32],
        recv_key: [u8; 32],
        initial_max_payload_bytes: u32,
        now: u32,
    ) -> Connection {
        Connection {
            remote_addr,
            worker_id,
            last_recv_time: AtomicU32::new(now),
            max_payload_bytes: AtomicU32::new(initial_max_payload_bytes),
            rtt: AtomicU32::new(DEFAULT_RTT),
            state: AtomicU8::new(STATE_OPEN),
            clock_offset_ms: AtomicI32::new(0),
            send: Mutex::new(SendState {
                streams: send_streams_default(),
                buffer: Vec::new(),
                buffer_stream: None,
                buffer_ack_id: None,
                aead: Aead::new(send_key),
                last_any_send_time: now,
            }),
            recv: Mutex::new(RecvState {
                streams: streams_default(),
                aead: Aead::new(recv_key),
            }),
            flow_control: Mutex::new(FlowControl::new(now)),
            handshake_cache: Mutex::new(None),
        }
    }

    /// Record the `CHALLENGE`/`ANSWER` pair the handshake admitted this connection with, so a
    /// retransmitted identical `CHALLENGE` (arriving because the original `ANSWER` was lost) can
    /// be answered again without re-running the key exchange.
    pub fn cache_handshake_answer(&self, challenge: [u8; 64], answer: Vec<u8>) {
        *self.handshake_cache.lock() = Some(HandshakeCache { challenge, answer });
    }

    /// If `raw` is a byte-for-byte repeat of the `CHALLENGE` this connection was admitted with,
    /// return the cached `ANSWER` bytes to resend verbatim. Called by the dispatcher when an
    /// already-connected address's datagram fails to authenticate as a normal sealed datagram —
    /// it may be a pre-connection retransmit that arrived after the peer was already admitted.
    pub fn maybe_retransmit_answer(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let cache = self.handshake_cache.lock();
        let entry = cache.as_ref()?;
        if raw.len() == 1 + 4 + 4 + 64 && raw[9..73] == entry.challenge {
            Some(entry.answer.clone())
        } else {
            None
        }
    }

    #[inline]
    pub fn estimated_clock_offset_ms(&self) -> i32 {
        self.clock_offset_ms.load(Ordering::Relaxed)
    }

    /// Begin the client-initiated MTU probe: fired once the connection enters the open state.
    /// Only the client side calls this; the server only ever answers a probe it receives.
    pub fn start_mtu_probe(&self, now: u32) {
        let padding = vec![0u8; crate::transport::MTU_MEDIUM as usize];
        let mut body = Vec::with_capacity(1 + padding.len());
        body.push(IOP_C2S_MTU_PROBE);
        body.extend_from_slice(&padding);
        self.write_reliable(0, SuperOpcode::Internal, &body);
        let _ = now;
    }

    /// Send a time-sync ping carrying the local clock; the reply lets the peer estimate clock offset.
    pub fn send_time_ping(&self, now: u32) {
        let mut body = Vec::with_capacity(5);
        body.push(IOP_C2S_TIME_PING);
        body.extend_from_slice(&now.to_le_bytes());
        self.write_reliable(0, SuperOpcode::Internal, &body);
    }


    #[inline]
    pub fn last_recv_time(&self) -> u32 {
        self.last_recv_time.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rtt(&self) -> u32 {
        self.rtt.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn max_payload_bytes(&self) -> u32 {
        self.max_payload_bytes.load(Ordering::Relaxed)
    }

    pub fn set_max_payload_bytes(&self, bytes: u32) {
        self.max_payload_bytes.store(bytes, Ordering::Relaxed);
    }

    /// `true` once the connection has left the `Open` state (the `Disconnecting`
    /// terminal-bound states); callers should stop routing application traffic to it and, once
    /// its send queues drain, remove it from the connection map.
    pub fn is_disconnected(&self) -> bool {
        self.state.load(Ordering::Relaxed) != STATE_OPEN
    }

    // ---- egress -----------------------------------------------------------------------------

    /// Enqueue a reliable message on stream `s`, splitting into fragments when it would not fit
    /// a single datagram. `sop` is `Data` for whole messages,
    /// `Internal` for internally generated reliable control messages.
    pub fn write_reliable(&self, stream: u8, sop: SuperOpcode, payload: &[u8]) {
        debug_assert!((stream as usize) < NUM_STREAMS);
        if self.is_disconnected() {
            return; // Disconnecting: outbound traffic is limited to the single DISCO
        }
        let mut send = self.send.lock();
        let max_payload = self.max_payload_bytes() as usize;
        let whole_msg_cap = max_payload.saturating_sub(BLOCK_HEADER_MAX + ACK_ID_MAX);

        if payload.len() <= whole_msg_cap {
            let id = Self::next_id(&mut send.streams[stream as usize]);
            send.streams[stream as usize].queue.push_back(SendEntry {
                id,
                sop,
                payload: payload.to_vec(),
                first_send_time: 0,
                last_send_time: 0,
            });
            return;
        }

        // A fragment that ends up smaller than FRAG_THRESHOLD is not specially resized here: the
        // packer (`flush_write`) already coalesces multiple queued blocks into one datagram, so
        // a short tail fragment rides alongside whatever is queued next rather than going out
        // alone.
        let frag_cap = max_payload.saturating_sub(BLOCK_HEADER_MAX + ACK_ID_MAX).max(FragHeader::SIZE + 1);
        let total = payload.len();
        let mut offset = 0usize;
        let mut first = true;
        while offset < total {
            let remaining = total - offset;
            let budget = if first { frag_cap - FragHeader::SIZE } else { frag_cap };
            let take = remaining.min(budget).max(1);
            let mut chunk = Vec::with_capacity(take + FragHeader::SIZE);
            if first {
                FragHeader { total_bytes: total as u16 }.encode(&mut chunk);
            }
            chunk.extend_from_slice(&payload[offset..offset + take]);
            let id = Self::next_id(&mut send.streams[stream as usize]);
            send.streams[stream as usize].queue.push_back(SendEntry {
                id,
                sop: SuperOpcode::Frag,
                payload: chunk,
                first_send_time: 0,
                last_send_time: 0,
            });
            offset += take;
            first = false;
        }
    }

    fn next_id(stream: &mut SendStream) -> u32 {
        let id = stream.next_send_id;
        stream.next_send_id = (stream.next_send_id + 1) & crate::wire::ack_id::MAX_ID;
        id
    }

    /// Enqueue an unreliable message directly into the outgoing datagram buffer.
    pub fn write_unreliable(&self, payload: &[u8]) {
        if self.is_disconnected() {
            return;
        }
        let mut send = self.send.lock();
        Self::append_unreliable_block(&mut send, SuperOpcode::Data, payload);
    }

    /// Send an unauthenticated, unencrypted datagram directly — no queueing, no ACK tracking.
    /// Used pre-handshake, before any `auth_enc` context exists
    /// yet. Returns the raw bytes for the caller to hand to the socket.
    pub fn encode_unreliable_oob(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let header = BlockHeader {
            data_bytes: payload.len() as u16,
            has_ack_id: false,
            reliable: false,
            sop: SuperOpcode::Data,
        };
        header.encode(&mut out);
        out.extend_from_slice(payload);
        out
    }

    fn append_unreliable_block(send: &mut SendState, sop: SuperOpcode, payload: &[u8]) {
        let header = BlockHeader {
            data_bytes: payload.len() as u16,
            has_ack_id: false,
            reliable: false,
            sop,
        };
        header.encode(&mut send.buffer);
        send.buffer.extend_from_slice(payload);
    }

    /// Serialize every pending message into outbound ciphertext datagrams. Reliable messages move
    /// from `queue` to `sent` as they're
    /// packed; the caller is responsible for handing `out` to the socket.
    pub fn flush_write(&self, now: u32, out: &mut Vec<Vec<u8>>) {
        let mut send = self.send.lock();
        self.pack_pending_reliable(&mut send, now, out);
        if !send.buffer.is_empty() {
            self.seal_and_emit(&mut send, now, out);
        }
    }

    fn pack_pending_reliable(&self, send: &mut SendState, now: u32, out: &mut Vec<Vec<u8>>) {
        let max_payload = self.max_payload_bytes() as usize;
        for s in 0..NUM_STREAMS {
            let stream_tag = s as u8;
            while let Some(entry) = send.streams[s].queue.pop_front() {
                // Flow-control gate: may not start a new datagram once the epoch
                // budget is spent. A buffer already in progress (started before the gate closed,
                // or holding unreliable blocks queued outside the packer) is still allowed to
                // finish and seal normally.
                if send.buffer.is_empty() && !self.flow_control.lock().can_send() {
                    send.streams[s].queue.push_front(entry);
                    return;
                }

                let force_full = entry.last_send_time != 0; // a retransmission candidate
                let needs_ack_id = force_full
                    || send.buffer_stream != Some(stream_tag)
                    || send.buffer_ack_id != Some(entry.id.wrapping_sub(1));

                let mut ack_bytes = Vec::new();
                if needs_ack_id {
                    AckId { stream: stream_tag, id: entry.id }.encode(force_full, &mut ack_bytes);
                }
                let header_len = if entry.payload.len() >> 3 != 0 { 2 } else { 1 };
                let needed = header_len + ack_bytes.len() + entry.payload.len();

                if !send.buffer.is_empty() && send.buffer.len() + needed > max_payload {
                    self.seal_and_emit(send, now, out);
                }

                let header = BlockHeader {
                    data_bytes: entry.payload.len() as u16,
                    has_ack_id: needs_ack_id,
                    reliable: true,
                    sop: entry.sop,
                };
                header.encode(&mut send.buffer);
                send.buffer.extend_from_slice(&ack_bytes);
                send.buffer.extend_from_slice(&entry.payload);
                send.buffer_stream = Some(stream_tag);
                send.buffer_ack_id = Some(entry.id);

                let mut sent_entry = entry;
                sent_entry.first_send_time = if sent_entry.first_send_time == 0 {
                    now
                } else {
                    sent_entry.first_send_time
                };
                sent_entry.last_send_time = now;
                send.streams[s].sent.push_back(sent_entry);
            }
        }
    }

    fn seal_and_emit(&self, send: &mut SendState, now: u32, out: &mut Vec<Vec<u8>>) {
        let mut datagram = Vec::with_capacity(send.buffer.len() + crate::crypto::aead::OVERHEAD_BYTES);
        send.aead.seal(&send.buffer, &[], &mut datagram);
        self.flow_control.lock().on_packet_send(datagram.len() as u32);
        out.push(datagram);
        send.buffer.clear();
        send.buffer_stream = None;
        send.buffer_ack_id = None;
        send.last_any_send_time = now;
    }

    /// Build and append a pending ACK body for every stream with `got_reliable` set, then clear
    /// the flags. One ACK datagram is emitted per tick, covering every stream with pending acks.
    fn append_pending_acks(&self, send: &mut SendState, recv: &mut RecvState) {
        let mut body = AckBody::default();
        for s in 0..NUM_STREAMS {
            if !recv.streams[s].got_reliable {
                continue;
            }
            recv.streams[s].got_reliable = false;
            let ranges = Self::collect_ack_ranges(&recv.streams[s]);
            body.streams.push(StreamAck {
                stream: s as u8,
                rollup: recv.streams[s].next_expected_id,
                ranges,
            });
        }
        if body.streams.is_empty() {
            return;
        }
        let mut bytes = Vec::new();
        body.encode(&mut bytes);
        Self::append_unreliable_block(send, SuperOpcode::Ack, &bytes);
    }

    fn collect_ack_ranges(stream: &RecvStream) -> Vec<AckRange> {
        let mut ranges = Vec::new();
        let mut iter = stream.queue.iter().peekable();
        while let Some(entry) = iter.next() {
            let mut end = entry.id;
            while let Some(next) = iter.peek() {
                if next.id == end + 1 {
                    end = next.id;
                    iter.next();
                } else {
                    break;
                }
            }
            ranges.push(AckRange {
                start: entry.id,
                end: if end != entry.id { Some(end) } else { None },
            });
        }
        ranges
    }

    // ---- ingress ------------------------------------------------------------------------------

    /// Decrypt and process one inbound datagram. Returns `None` on
    /// authentication failure — the whole datagram is dropped.
    pub fn on_datagram(&self, sealed: &[u8], now: u32) -> Option<IngressResult> {
        if self.is_disconnected() {
            return Some(IngressResult::default()); // Disconnecting: ingress is ignored
        }
        let mut recv = self.recv.lock();
        let plain = recv.aead.open(sealed, &[])?;
        self.last_recv_time.store(now, Ordering::Relaxed);

        let mut result = IngressResult::default();
        let mut buf = &plain[..];
        // Single running (stream, id) context: an I=0 block always means "one higher than the
        // last explicit ACK-ID in this datagram, on that same stream, mirroring the
        // packer's single `buffer_stream`/`buffer_ack_id` pair rather than a per-stream table.
        let mut last_ack_id: Option<AckId> = None;

        while !buf.is_empty() {
            let header = match BlockHeader::decode(&mut buf) {
                Ok(h) => h,
                Err(_) => return Some(result), // truncated trailing block: ignore, keep what decoded so far
            };

            match header.sop {
                SuperOpcode::Ack => {
                    let data = match crate::wire::read_exact(&mut buf, header.data_bytes as usize) {
                        Ok(d) => d,
                        Err(_) => return Some(result),
                    };
                    if let Ok(body) = AckBody::decode(data) {
                        let mut send = self.send.lock();
                        for group in &body.streams {
                            self.process_ack(&mut send, group, now);
                        }
                    }
                }
                _ => {
                    let ack_id = if header.has_ack_id {
                        match AckId::decode(&mut buf) {
                            Ok(id) => id,
                            Err(_) => return Some(result),
                        }
                    } else {
                        match last_ack_id {
                            Some(prev) => AckId { stream: prev.stream, id: prev.id + 1 },
                            None => return Some(result), // I=0 with no prior context: tampering
                        }
                    };
                    last_ack_id = Some(ack_id);

                    let data = match crate::wire::read_exact(&mut buf, header.data_bytes as usize) {
                        Ok(d) => d,
                        Err(_) => return Some(result),
                    };

                    if !header.reliable && header.sop != SuperOpcode::Frag {
                        self.deliver(header.sop, ack_id.stream, data, now, &mut result);
                        continue;
                    }

                    let stream_idx = ack_id.stream as usize;
                    if stream_idx >= NUM_STREAMS {
                        return Some(result);
                    }
                    recv.streams[stream_idx].got_reliable = true;

                    if let Err(()) = self.accept_reliable(&mut recv.streams[stream_idx], stream_idx, header.sop, ack_id.id, data, now, &mut result) {
                        result.disconnect_reason = Some(DISCO_TAMPERING);
                        return Some(result);
                    }
                }
            }
        }
        Some(result)
    }

    /// Place (or immediately deliver) a reliable/fragment message. Returns `Err`
    /// on a malformed fragment sequence (treated as tampering — a fragment overrunning its
    /// declared total length never happens on the wire short of an adversarial peer).
    ///
    /// Stream 0 is reliable but unordered: a message is delivered the instant it arrives, subject
    /// only to a duplicate check, never held back waiting for an earlier gap to fill. Streams 1-3
    /// are reliable and ordered: out-of-order arrivals are held in `stream.queue` until the
    /// contiguous prefix reaches them.
    fn accept_reliable(
        &self,
        stream: &mut RecvStream,
        stream_idx: usize,
        sop: SuperOpcode,
        id: u32,
        data: &[u8],
        now: u32,
        out: &mut IngressResult,
    ) -> Result<(), ()> {
        if id < stream.next_expected_id || stream.queue.iter().any(|e| e.id == id) {
            return Ok(()); // duplicate: silently dropped
        }

        if stream_idx == 0 {
            self.reassemble_and_deliver(stream, sop, data, now, out)?;
            if id == stream.next_expected_id {
                stream.next_expected_id += 1;
                while stream.queue.front().map_or(false, |e| e.id == stream.next_expected_id) {
                    stream.queue.pop_front();
                    stream.next_expected_id += 1;
                }
            } else {
                // Record the gap for duplicate suppression and ACK rollup only — the payload was
                // already delivered above, so there's nothing left to hold onto.
                let pos = stream.queue.iter().position(|e| e.id > id).unwrap_or(stream.queue.len());
                stream.queue.insert(pos, RecvEntry { id, sop, payload: Vec::new() });
            }
            return Ok(());
        }

        if id != stream.next_expected_id {
            let pos = stream.queue.iter().position(|e| e.id > id).unwrap_or(stream.queue.len());
            stream.queue.insert(
                pos,
                RecvEntry {
                    id,
                    sop,
                    payload: data.to_vec(),
                },
            );
            return Ok(());
        }

        self.reassemble_and_deliver(stream, sop, data, now, out)?;
        stream.next_expected_id += 1;

        while let Some(front) = stream.queue.front() {
            if front.id != stream.next_expected_id {
                break;
            }
            let entry = stream.queue.pop_front().unwrap();
            self.reassemble_and_deliver(stream, entry.sop, &entry.payload, now, out)?;
            stream.next_expected_id += 1;
        }
        Ok(())
    }

    fn reassemble_and_deliver(
        &self,
        stream: &mut RecvStream,
        sop: SuperOpcode,
        data: &[u8],
        now: u32,
        out: &mut IngressResult,
    ) -> Result<(), ()> {
        match sop {
            SuperOpcode::Frag => {
                if stream.frag_buffer.is_empty() {
                    let mut slice = data;
                    let hdr = FragHeader::decode(&mut slice).map_err(|_| ())?;
                    stream.frag_total = hdr.total_bytes as usize;
                    stream.frag_buffer = Vec::with_capacity(stream.frag_total);
                    stream.frag_buffer.extend_from_slice(slice);
                } else {
                    stream.frag_buffer.extend_from_slice(data);
                }
                if stream.frag_buffer.len() > stream.frag_total {
                    return Err(()); // declared total exceeded: tampering
                }
                if stream.frag_buffer.len() == stream.frag_total {
                    let complete = std::mem::take(&mut stream.frag_buffer);
                    stream.frag_total = 0;
                    out.messages.push(InMessage {
                        stream: 0,
                        payload: complete,
                    });
                }
                Ok(())
            }
            SuperOpcode::Internal => {
                self.handle_internal(data, now, out);
                Ok(())
            }
            _ => {
                out.messages.push(InMessage {
                    stream: 0,
                    payload: data.to_vec(),
                });
                Ok(())
            }
        }
    }

    fn deliver(&self, sop: SuperOpcode, stream: u8, data: &[u8], now: u32, out: &mut IngressResult) {
        match sop {
            SuperOpcode::Internal => self.handle_internal(data, now, out),
            _ => out.messages.push(InMessage {
                stream,
                payload: data.to_vec(),
            }),
        }
    }

    fn handle_internal(&self, data: &[u8], now: u32, out: &mut IngressResult) {
        if data.is_empty() {
            return;
        }
        let opcode = data[0];
        let body = &data[1..];
        match opcode {
            IOP_DISCO => {
                let reason = body.first().copied().unwrap_or(0);
                out.disconnect_reason = Some(reason);
            }
            // Client's probe arrived intact at this size (it was delivered reliably): tell it so.
            IOP_C2S_MTU_PROBE => {
                let probe_total_len = (1 + body.len()).min(u16::MAX as usize) as u16;
                let bytes = probe_total_len.to_le_bytes();
                self.write_reliable(0, SuperOpcode::Internal, &[IOP_S2C_MTU_SET, bytes[0], bytes[1]]);
            }
            IOP_S2C_MTU_SET => {
                if body.len() >= 2 {
                    let mtu = u16::from_le_bytes([body[0], body[1]]);
                    self.set_max_payload_bytes(mtu as u32);
                }
            }
            IOP_C2S_TIME_PING => {
                if body.len() >= 4 {
                    let mut reply = Vec::with_capacity(9);
                    reply.push(IOP_S2C_TIME_PONG);
                    reply.extend_from_slice(&body[..4]);
                    reply.extend_from_slice(&now.to_le_bytes());
                    self.write_reliable(0, SuperOpcode::Internal, &reply);
                }
            }
            IOP_S2C_TIME_PONG => {
                if body.len() >= 8 {
                    let client_ts = u32::from_le_bytes(body[0..4].try_into().expect("4 bytes"));
                    let server_ts = u32::from_le_bytes(body[4..8].try_into().expect("4 bytes"));
                    let round_trip = now.wrapping_sub(client_ts);
                    let offset = server_ts as i64 - (client_ts as i64 + (round_trip / 2) as i64);
                    self.clock_offset_ms.store(offset as i32, Ordering::Relaxed);
                }
            }
            _ => out.internal.push(InternalMessage {
                opcode,
                body: body.to_vec(),
            }),
        }
    }

    // ---- ACK processing ------------------------------------------------------------------------

    fn process_ack(&self, send: &mut SendState, group: &StreamAck, now: u32) {
        let s = group.stream as usize;
        if s >= NUM_STREAMS {
            return;
        }
        let stream = &mut send.streams[s];
        stream.remote_expected = stream.remote_expected.max(group.rollup);

        let mut acked_any = false;
        let mut rtt_sample: Option<u32> = None;

        stream.sent.retain(|entry| {
            let acked = entry.id < group.rollup
                || group
                    .ranges
                    .iter()
                    .any(|r| entry.id >= r.start && entry.id <= r.end.unwrap_or(r.start));
            if acked {
                acked_any = true;
                let sample = now.wrapping_sub(entry.first_send_time);
                rtt_sample = Some(rtt_sample.map_or(sample, |r| r.min(sample)));
            }
            !acked
        });

        if let Some(sample) = rtt_sample {
            self.apply_rtt_sample(sample);
        }

        // An ID strictly between ROLLUP and the first RANGE, or between two RANGEs, is a hole the
        // peer has jumped over — implicitly NACKed: force an immediate retransmit on the next
        // tick by resetting last_send_time to 0. An ID past the last RANGE's end (or past ROLLUP
        // when there are no ranges) simply hasn't reached the peer yet and is never NACKed.
        let highest_acked = group.ranges.iter().map(|r| r.end.unwrap_or(r.start)).max();
        let mut nack_count = 0u32;
        if let Some(bound) = highest_acked {
            for entry in stream.sent.iter_mut() {
                let nacked = entry.id >= group.rollup
                    && entry.id < bound
                    && !group
                        .ranges
                        .iter()
                        .any(|r| entry.id >= r.start && entry.id <= r.end.unwrap_or(r.start));
                if nacked {
                    entry.last_send_time = 0;
                    nack_count += 1;
                }
            }
        }

        if acked_any || nack_count > 0 {
            let sample = rtt_sample.unwrap_or_else(|| self.rtt());
            self.flow_control.lock().on_ack(now, sample, nack_count);
        }
    }

    fn apply_rtt_sample(&self, sample: u32) {
        let prev = self.rtt.load(Ordering::Relaxed);
        let smoothed = ((prev as u64 * 7 + sample as u64) / 8) as u32;
        self.rtt.store(smoothed.max(MIN_RTT), Ordering::Relaxed);
    }

    // ---- tick ------------------------------------------------------------------------------------

    /// Drive retransmission, ACK scheduling and keep-alive for one 20ms tick. Returns the
    /// disconnect reason if the connection just timed out.
    pub fn tick(&self, now: u32, out: &mut Vec<Vec<u8>>) -> Option<u8> {
        if self.is_disconnected() {
            // Disconnecting: only the queued DISCO goes out, no retransmission or keepalive.
            self.flush_write(now, out);
            return None;
        }

        if now.wrapping_sub(self.last_recv_time()) >= TIMEOUT_DISCONNECT {
            self.state.store(STATE_DISCONNECTING, Ordering::Relaxed);
            return Some(DISCO_TIMEOUT);
        }

        let rtt = self.rtt();
        let retransmit_after = (rtt * 2).max(250);
        let mut timeout_loss_count = 0u32;
        {
            let mut send = self.send.lock();
            for s in 0..NUM_STREAMS {
                let due: Vec<usize> = send.streams[s]
                    .sent
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| now.wrapping_sub(e.last_send_time) >= retransmit_after)
                    .map(|(i, _)| i)
                    .collect();
                // Move due entries back to the front of the queue for the packer to re-emit,
                // in ascending ID order, preserving everything else in `sent`.
                for &i in due.iter().rev() {
                    let mut entry = send.streams[s].sent.remove(i).unwrap();
                    entry.last_send_time = 0;
                    send.streams[s].queue.push_front(entry);
                    timeout_loss_count += 1;
                }
            }

            let mut recv = self.recv.lock();
            self.append_pending_acks(&mut send, &mut recv);

            if now.wrapping_sub(send.last_any_send_time) >= SILENCE_LIMIT {
                self.write_keepalive(&mut send);
            }
        }

        self.flow_control.lock().on_tick(now, timeout_loss_count);
        self.flush_write(now, out);
        None
    }

    fn write_keepalive(&self, send: &mut SendState) {
        let id = Self::next_id(&mut send.streams[0]);
        send.streams[0].queue.push_back(SendEntry {
            id,
            sop: SuperOpcode::Data,
            payload: Vec::new(),
            first_send_time: 0,
            last_send_time: 0,
        });
    }

    /// Send a single internal `DISCO(reason)` datagram and mark the connection disconnected.
    /// Flushes the write before returning, so the `DISCO` datagram is never left unsent.
    pub fn disconnect(&self, reason: u8, now: u32, out: &mut Vec<Vec<u8>>) {
        {
            let mut send = self.send.lock();
            Self::append_unreliable_block(&mut send, SuperOpcode::Internal, &[IOP_DISCO, reason]);
        }
        self.state.store(STATE_DISCONNECTING, Ordering::Relaxed);
        self.flush_write(now, out);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::NetAddr;
    use std::net::SocketAddr;

    fn pair() -> (Connection, Connection) {
        let addr = NetAddr::from_socket_addr("127.0.0.1:1".parse::<SocketAddr>().unwrap());
        let key_a = [1u8; 32];
        let key_b = [2u8; 32];
        let client = Connection::new(addr, 0, key_a, key_b, 1400, 0);
        let server = Connection::new(addr, 0, key_b, key_a, 1400, 0);
        (client, server)
    }

    #[test]
    fn unreliable_roundtrip() {
        let (client, server) = pair();
        client.write_unreliable(b"hello");
        let mut out = Vec::new();
        client.flush_write(0, &mut out);
        assert_eq!(out.len(), 1);
        let result = server.on_datagram(&out[0], 0).unwrap();
        assert_eq!(result.messages[0].payload, b"hello");
    }

    #[test]
    fn reliable_in_order_delivery() {
        let (client, server) = pair();
        for i in 0..5u8 {
            client.write_reliable(1, SuperOpcode::Data, &[i]);
        }
        let mut out = Vec::new();
        client.flush_write(0, &mut out);
        let mut received = Vec::new();
        for datagram in &out {
            let result = server.on_datagram(datagram, 0).unwrap();
            for m in result.messages {
                received.push(m.payload[0]);
            }
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn fragment_reassembly() {
        let (client, server) = pair();
        let msg: Vec<u8> = (0u8..=255).cycle().take(4000).collect();
        client.set_max_payload_bytes(500);
        client.write_reliable(1, SuperOpcode::Data, &msg);
        let mut out = Vec::new();
        client.flush_write(0, &mut out);
        let mut assembled = None;
        for datagram in &out {
            let result = server.on_datagram(datagram, 0).unwrap();
            for m in result.messages {
                assembled = Some(m.payload);
            }
        }
        assert_eq!(assembled.unwrap(), msg);
    }

    #[test]
    fn mtu_probe_is_answered_with_mtu_set() {
        let (client, server) = pair();
        client.start_mtu_probe(0);
        let mut out = Vec::new();
        client.flush_write(0, &mut out);
        let mut server_out = Vec::new();
        for datagram in &out {
            let result = server.on_datagram(datagram, 0).unwrap();
            assert!(result.messages.is_empty());
            assert!(result.internal.is_empty()); // handled internally, not surfaced
        }
        server.flush_write(0, &mut server_out);
        assert!(!server_out.is_empty());
        for datagram in &server_out {
            client.on_datagram(datagram, 0).unwrap();
        }
        assert_eq!(client.max_payload_bytes(), 1 + crate::transport::MTU_MEDIUM as u32);
    }

    #[test]
    fn time_ping_pong_updates_clock_offset() {
        let (client, server) = pair();
        client.send_time_ping(1000);
        let mut out = Vec::new();
        client.flush_write(1000, &mut out);
        let mut server_out = Vec::new();
        for datagram in &out {
            server.on_datagram(datagram, 1005).unwrap();
        }
        server.flush_write(1005, &mut server_out);
        for datagram in &server_out {
            client.on_datagram(datagram, 1010).unwrap();
        }
        // server clock is 5ms ahead of the client's send time, round trip 10ms.
        assert_eq!(client.estimated_clock_offset_ms(), 0);
    }

    #[test]
    fn flow_control_gate_defers_datagrams_once_budget_is_spent() {
        let (client, _server) = pair();
        {
            let fc = client.flow_control.lock();
            fc.on_packet_send(fc.max_epoch_bytes());
            assert!(!fc.can_send());
        }
        client.write_reliable(0, SuperOpcode::Data, b"blocked");
        let mut out = Vec::new();
        client.flush_write(0, &mut out);
        assert!(out.is_empty());

        // A fresh epoch (new tick, budget reset) lets the same queued entry go out.
        client.flow_control.lock().on_tick(crate::flow_control::EPOCH_INTERVAL, 0);
        client.flush_write(crate::flow_control::EPOCH_INTERVAL, &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn disconnected_connection_drops_ingress_and_stops_sending() {
        let (client, server) = pair();
        let mut out = Vec::new();
        client.disconnect(DISCO_USER_EXIT, 0, &mut out);
        assert!(!out.is_empty());
        assert!(client.is_disconnected());

        client.write_unreliable(b"should not be queued");
        let mut after = Vec::new();
        client.flush_write(1, &mut after);
        assert!(after.is_empty());

        let result = server.on_datagram(&out[0], 0).unwrap();
        assert_eq!(result.disconnect_reason, Some(DISCO_USER_EXIT));

        let mut server_out = Vec::new();
        server.state.store(STATE_DISCONNECTING, Ordering::Relaxed);
        let ingress = server.on_datagram(&out[0], 0).unwrap();
        assert!(ingress.messages.is_empty() && ingress.internal.is_empty());
        server.tick(1, &mut server_out);
        assert!(server_out.is_empty());
    }

    #[test]
    fn partial_ack_does_not_nack_the_unbounded_tail() {
        let (client, _server) = pair();
        for id in 5..10u32 {
            client.send.lock().streams[1].sent.push_back(SendEntry {
                id,
                sop: SuperOpcode::Data,
                payload: vec![0],
                first_send_time: 0,
                last_send_time: 10,
            });
        }
        let group = StreamAck { stream: 1, rollup: 8, ranges: vec![] };
        {
            let mut send = client.send.lock();
            client.process_ack(&mut send, &group, 20);
        }
        let send = client.send.lock();
        let remaining: Vec<(u32, u32)> = send.streams[1].sent.iter().map(|e| (e.id, e.last_send_time)).collect();
        // 5, 6, 7 are covered by rollup=8 and dropped from `sent`. 8, 9 are past the peer's last
        // reported point (no RANGE covers them, and rollup doesn't either) and must not be
        // force-retransmitted: the peer simply hasn't gotten that far yet.
        assert_eq!(remaining, vec![(8, 10), (9, 10)]);
    }

    #[test]
    fn ack_gap_between_rollup_and_a_range_is_nacked() {
        let (client, _server) = pair();
        for id in 0..5u32 {
            client.send.lock().streams[1].sent.push_back(SendEntry {
                id,
                sop: SuperOpcode::Data,
                payload: vec![0],
                first_send_time: 0,
                last_send_time: 10,
            });
        }
        // Peer has rollup=1 (acked 0) plus a RANGE covering 3..=4: ids 1 and 2 are real holes
        // bounded on both sides by acknowledged data, unlike an unbounded tail.
        let group = StreamAck {
            stream: 1,
            rollup: 1,
            ranges: vec![AckRange { start: 3, end: Some(4) }],
        };
        {
            let mut send = client.send.lock();
            client.process_ack(&mut send, &group, 20);
        }
        let send = client.send.lock();
        let remaining: Vec<(u32, u32)> = send.streams[1].sent.iter().map(|e| (e.id, e.last_send_time)).collect();
        assert_eq!(remaining, vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn stream_zero_delivers_out_of_order_messages_immediately() {
        let (client, server) = pair();
        client.write_reliable(0, SuperOpcode::Data, b"first");
        client.write_reliable(0, SuperOpcode::Data, b"second");
        let mut out = Vec::new();
        client.flush_write(0, &mut out);
        assert_eq!(out.len(), 2);

        // Deliver the second datagram first, as UDP reordering would.
        let result = server.on_datagram(&out[1], 0).unwrap();
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].payload, b"second");

        let result = server.on_datagram(&out[0], 0).unwrap();
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].payload, b"first");
    }
}
