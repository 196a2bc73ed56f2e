//! The BCP connection: packet queue, routing table, four named timers and
//! the single `busy` flag that serialises them, plus the send/forward/ACK
//! handling that ties them together.

use log::{debug, info, trace, warn};

use crate::address::NodeAddr;
use crate::config::Config;
use crate::error::Error;
use crate::extender::Extender;
use crate::header::{ChannelAttributes, DataHeader, PacketType};
use crate::link::{Frame, Link};
use crate::queue::{Queue, QueueItem};
use crate::routing::RoutingTable;
use crate::weight::Weight;

/// Application-facing notifications. Default methods are no-ops so a
/// connection can be opened without an application layer attached yet.
pub trait Callbacks {
    /// A data item addressed to this (sink) node arrived.
    fn recv(&mut self, _origin: NodeAddr, _payload: &[u8]) {}

    /// The head-of-queue item this node sent was ACKed.
    fn sent(&mut self, _payload: &[u8]) {}

    /// A locally-originated send was rejected (oversized payload, or the
    /// queue was full).
    fn dropped(&mut self) {}
}

/// Per-connection state machine states, named for logging only — behaviour
/// is driven entirely by the `busy` flag and the four timer deadlines.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    Idle,
    BusyBroadcast,
    BusyUnicast,
}

/// An opened BCP connection: the packet queue, routing table, four named
/// timers expressed as `Option<u32>` deadlines, and the `busy` flag that is
/// the sole mutual-exclusion primitive in this cooperative scheduling
/// model.
pub struct Connection<L: Link, W: Weight> {
    config: Config,
    self_addr: NodeAddr,
    is_sink: bool,
    is_open: bool,

    link: L,
    channel: u8,
    routing: RoutingTable,
    queue: Queue,
    weight: W,
    extender: Extender,

    state: State,
    busy: bool,
    tx_attempts: u32,
    ack_counter: u32,
    energy_budget: i64,

    beacon_deadline: Option<u32>,
    send_deadline: Option<u32>,
    check_deadline: Option<u32>,
}

impl<L: Link, W: Weight> Connection<L, W> {
    pub fn new(config: Config, self_addr: NodeAddr, link: L, weight: W) -> Self {
        let routing = RoutingTable::new(config.max_routing_table_size, crate::routing::RoutingMode::Basic);
        let queue = Queue::new(config.max_packet_queue_size);
        Self {
            config,
            self_addr,
            is_sink: false,
            is_open: false,

            link,
            channel: 0,
            routing,
            queue,
            weight,
            extender: Extender::none(),

            state: State::Idle,
            busy: false,
            tx_attempts: 0,
            ack_counter: 0,
            energy_budget: 0,

            beacon_deadline: None,
            send_deadline: None,
            check_deadline: None,
        }
    }

    pub fn with_extender(mut self, extender: Extender) -> Self {
        self.extender = extender;
        self
    }

    pub fn set_sink(&mut self, is_sink: bool, now_ms: u32) {
        self.is_sink = is_sink;
        if is_sink {
            info!("node {:?} set as sink", self.self_addr);
            self.arm_beacon_if_expired(now_ms);
        }
    }

    pub fn is_sink(&self) -> bool {
        self.is_sink
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn tx_attempts(&self) -> u32 {
        self.tx_attempts
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn routing_mut(&mut self) -> &mut RoutingTable {
        &mut self.routing
    }

    pub fn weight_mut(&mut self) -> &mut W {
        &mut self.weight
    }

    pub fn queue_mut(&mut self) -> &mut Queue {
        &mut self.queue
    }

    /// Direct access to the underlying link, for test harnesses and
    /// simulations that need to shuttle frames between nodes by hand.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn self_addr(&self) -> NodeAddr {
        self.self_addr
    }

    /// `routing.find_routing` against this connection's own weight
    /// estimator. A plain method (rather than exposing `routing()` and
    /// `weight_mut()` to be called together) since those are sibling
    /// fields and borrowing both externally at once would conflict.
    pub fn find_best_neighbor(&mut self, own_queue_len: u16) -> Option<NodeAddr> {
        self.routing.find_routing(own_queue_len, &mut self.weight)
    }

    /// Drain and reset the ACK counter the LPM layer consumes each slot.
    pub fn take_ack_count(&mut self) -> u32 {
        let n = self.ack_counter;
        self.ack_counter = 0;
        n
    }

    /// Set this slot's per-attempt energy budget, as derived by the node
    /// glue from the LPM (`energy_budget / send_cost`, mirroring
    /// `get_sending_budget` in `fusion_weight_estimator.c`). Connections
    /// with no energy-aware glue (e.g. `Extender::None`) never read it.
    pub fn set_energy_budget(&mut self, energy_budget: i64) {
        self.energy_budget = energy_budget;
    }

    fn set_busy(&mut self, busy: bool, source: &str) {
        self.busy = busy;
        self.state = if !busy {
            State::Idle
        } else if self.state == State::Idle {
            State::BusyBroadcast
        } else {
            self.state
        };
        trace!("busy -> {} ({})", busy, source);
    }

    fn arm_beacon_if_expired(&mut self, now_ms: u32) {
        if self.beacon_deadline.is_none() {
            self.beacon_deadline = Some(now_ms + self.config.beacon_time_ms);
        }
    }

    fn arm_send(&mut self, now_ms: u32) {
        let time = self.config.retx_time_ms * (self.tx_attempts + 1);
        self.send_deadline = Some(now_ms + time);
    }

    /// Open the connection: initialise sub-tables, open the link, send one
    /// beacon immediately, arm `send` (non-sinks) and `check`.
    pub fn open(&mut self, channel: u8, now_ms: u32) -> Result<(), Error<L::Error>> {
        self.channel = channel;
        self.link.open(
            channel,
            ChannelAttributes::DATA
                | ChannelAttributes::BEACON
                | ChannelAttributes::BEACON_REQUEST
                | ChannelAttributes::ACK,
        )?;
        self.is_open = true;

        self.send_beacon(now_ms)?;

        if !self.is_sink && self.send_deadline.is_none() {
            self.send_deadline = Some(now_ms + self.config.send_time_delay_ms);
        }
        if self.check_deadline.is_none() {
            self.check_deadline = Some(now_ms + 1_000);
        }

        info!("connection opened on channel {}", channel);
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), Error<L::Error>> {
        self.link.close()?;
        self.routing.clear();
        self.queue.clear();
        self.beacon_deadline = None;
        self.send_deadline = None;
        self.check_deadline = None;
        self.is_open = false;
        info!("connection closed");
        Ok(())
    }

    /// Local application send. Rejects oversized payloads; otherwise pushes
    /// a new queue item with `origin = self`.
    pub fn send<R: rand_core::RngCore>(
        &mut self,
        payload: &[u8],
        now_ms: u32,
        cb: &mut dyn Callbacks,
        rng: &mut R,
    ) -> Result<(), Error<L::Error>> {
        if payload.len() > self.config.max_user_packet_size {
            warn!("send rejected: {} bytes exceeds payload cap", payload.len());
            cb.dropped();
            return Err(Error::OversizedPayload);
        }

        let mut header = DataHeader {
            origin: self.self_addr,
            packet_length: 0,
            bcp_backpressure: 0,
            delay: 0,
            last_process_time: now_ms,
            fusion: None,
        };
        header.packet_length = header.wire_len() as u16 + payload.len() as u16;

        let item = QueueItem {
            header,
            payload: heapless::Vec::from_slice(payload).map_err(|_| Error::OversizedPayload)?,
        };

        match self.queue.push(item) {
            Ok(()) => {
                self.extender
                    .on_user_send_request(&mut self.queue.top_mut().unwrap().header, rng);
                debug!("queued local send, {} bytes", payload.len());
                Ok(())
            }
            Err(_) => {
                warn!("send rejected: queue full");
                cb.dropped();
                Err(Error::QueueFull)
            }
        }
    }

    fn send_beacon(&mut self, now_ms: u32) -> Result<(), Error<L::Error>> {
        if self.busy {
            return Ok(());
        }
        self.set_busy(true, "send_beacon");

        let header = crate::header::BeaconHeader {
            queuelog: self.queue.len() as u16,
        };
        let mut buf = [0u8; crate::header::BeaconHeader::LEN];
        header.encode(&mut buf);
        self.link
            .broadcast(self.self_addr, NodeAddr::BROADCAST, PacketType::Beacon, &buf)?;

        self.set_busy(false, "send_beacon#complete");
        self.beacon_deadline = Some(now_ms + self.config.beacon_time_ms);
        Ok(())
    }

    /// Poll the four timers and the link's inbox. Call once per tick.
    pub fn poll(
        &mut self,
        now_ms: u32,
        cb: &mut dyn Callbacks,
    ) -> Result<(), Error<L::Error>> {
        if !self.is_open {
            return Ok(());
        }

        if let Some(deadline) = self.beacon_deadline {
            if now_ms >= deadline {
                self.beacon_deadline = None;
                self.send_beacon(now_ms)?;
            }
        }

        if let Some(deadline) = self.check_deadline {
            if now_ms >= deadline {
                if self.is_sink {
                    self.arm_beacon_if_expired(now_ms);
                }
                self.check_deadline = Some(now_ms + self.config.check_slots * self.config.slot_duration_ms);
            }
        }

        if !self.is_sink {
            if let Some(deadline) = self.send_deadline {
                if now_ms >= deadline {
                    self.send_deadline = None;
                    // Busy/no-next-hop/extender-abort are routine, already
                    // handled by rearming the send timer inside
                    // `on_send_timer`; only a genuine link error propagates.
                    match self.on_send_timer(now_ms) {
                        Ok(()) | Err(Error::Busy) | Err(Error::NoNextHop) | Err(Error::AbortBySend) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        while let Some(frame) = self.link.poll_receive(self.self_addr)? {
            self.on_receive(frame, now_ms, cb)?;
        }

        Ok(())
    }

    fn on_send_timer(&mut self, now_ms: u32) -> Result<(), Error<L::Error>> {
        if self.busy {
            trace!("send timer fired while busy, rescheduling");
            self.arm_send(now_ms);
            return Err(Error::Busy);
        }

        self.set_busy(true, "send_packet");

        let own_len = self.queue.len() as u16;
        let next_hop = self.routing.find_routing(own_len, &mut self.weight);

        let (item_present, neighbor) = (self.queue.top().is_some(), next_hop);
        if !item_present || neighbor.is_none() {
            if neighbor.is_none() {
                trace!("no next hop available");
            } else {
                trace!("queue empty, starting beaconing");
            }
            self.set_busy(false, "send_packet#defer");
            self.arm_beacon_if_expired(now_ms);
            self.arm_send(now_ms);
            return Err(Error::NoNextHop);
        }
        let neighbor = neighbor.unwrap();

        self.beacon_deadline = None;

        {
            let header = &mut self.queue.top_mut().unwrap().header;
            self.extender.prepare_sending_data(header);
        }

        let own_queue_len = self.queue.len() as u16;
        let delay_add = now_ms.saturating_sub(self.queue.top().unwrap().header.last_process_time);
        {
            let item = self.queue.top_mut().unwrap();
            item.header.bcp_backpressure = own_queue_len;
            item.header.delay += delay_add;
            item.header.last_process_time = now_ms;
        }

        let send_cost = self.config.send_cost.max(1) as i64;
        let mut sending_budget = (self.energy_budget / send_cost).max(0) as u32;
        let aborted = {
            let header = &mut self.queue.top_mut().unwrap().header;
            !self.extender.before_sending_data(header, &mut sending_budget)
        };
        if aborted {
            debug!("send aborted by extender");
            self.set_busy(false, "send_packet#abort");
            self.arm_beacon_if_expired(now_ms);
            self.arm_send(now_ms);
            return Err(Error::AbortBySend);
        }

        let item = self.queue.top().unwrap().clone();
        let mut buf = [0u8; 256];
        let mut n = item.header.encode(&mut buf);
        buf[n..n + item.payload.len()].copy_from_slice(&item.payload);
        n += item.payload.len();

        self.link
            .broadcast(self.self_addr, neighbor, PacketType::Data, &buf[..n])?;

        // `Link::broadcast` is synchronous in this codebase (no deferred
        // "sent" callback), so busy clears immediately, exactly as
        // `send_beacon` does.
        self.set_busy(false, "send_packet#complete");

        self.tx_attempts += 1;
        if let Some(entry) = self.routing.find(neighbor) {
            let bumped = (entry.backpressure + 5).min(self.config.max_packet_queue_size as u16);
            let _ = self
                .routing
                .update_queuelog(neighbor, bumped, false, self.config.max_packet_queue_size as u16);
        }

        debug!("sent data to {:?}, attempt {}", neighbor, self.tx_attempts);

        {
            let header = &self.queue.top().unwrap().header;
            self.extender.after_sending_data(header);
        }

        self.arm_send(now_ms);
        Ok(())
    }

    fn on_receive(
        &mut self,
        frame: Frame,
        now_ms: u32,
        cb: &mut dyn Callbacks,
    ) -> Result<(), Error<L::Error>> {
        match frame.packet_type {
            PacketType::Ack => self.on_ack(frame, cb),
            PacketType::Beacon | PacketType::BeaconRequest => self.on_beacon(frame),
            PacketType::Data => self.on_data(frame, now_ms, cb),
            PacketType::HopCounter => Ok(()),
        }
    }

    fn on_beacon(&mut self, frame: Frame) -> Result<(), Error<L::Error>> {
        let header = match crate::header::BeaconHeader::decode(&frame.payload) {
            Ok((h, _)) => h,
            Err(_) => {
                warn!("malformed beacon from {:?}", frame.sender);
                return Ok(());
            }
        };
        let cap = self.config.max_packet_queue_size as u16;
        let _ = self.routing.update_queuelog(frame.sender, header.queuelog, false, cap);
        Ok(())
    }

    fn on_ack(&mut self, frame: Frame, cb: &mut dyn Callbacks) -> Result<(), Error<L::Error>> {
        self.set_busy(true, "recv_from_unicast");

        if let Some(top) = self.queue.top().cloned() {
            self.tx_attempts = 0;
            self.ack_counter += 1;
            cb.sent(&top.payload);

            if let Some(entry) = self.routing.find(frame.sender) {
                if entry.backpressure > 5 {
                    let credited = entry.backpressure - 5;
                    let cap = self.config.max_packet_queue_size as u16;
                    let _ = self.routing.update_queuelog(frame.sender, credited, false, cap);
                }
            }

            self.queue.pop();
            debug!("ack from {:?} retired head of queue", frame.sender);
        } else {
            warn!("ack received but queue is empty");
        }

        self.set_busy(false, "recv_from_unicast");
        Ok(())
    }

    fn on_data(
        &mut self,
        frame: Frame,
        now_ms: u32,
        cb: &mut dyn Callbacks,
    ) -> Result<(), Error<L::Error>> {
        self.set_busy(true, "recv_from_broadcast");

        let has_fusion = matches!(self.extender, Extender::Fusion(_));
        let (mut header, used) = match DataHeader::decode(&frame.payload, has_fusion) {
            Ok(v) => v,
            Err(_) => {
                warn!("malformed data frame from {:?}", frame.sender);
                self.set_busy(false, "recv_from_broadcast#malformed");
                return Ok(());
            }
        };
        let payload = &frame.payload[used..];
        let cap = self.config.max_packet_queue_size as u16;

        if frame.receiver.is_broadcast() {
            let _ = self.routing.update_queuelog(frame.sender, header.bcp_backpressure, false, cap);
            self.set_busy(false, "recv_from_broadcast#beacon");
            return Ok(());
        }

        if frame.receiver == self.self_addr {
            self.extender.on_receiving_data(&mut header);

            if self.is_sink {
                info!("sink received data from origin {:?}", header.origin);
                self.send_ack(frame.sender)?;
                cb.recv(header.origin, payload);
                let _ = self.routing.update_queuelog(frame.sender, header.bcp_backpressure, false, cap);
            } else {
                let item = QueueItem {
                    header: DataHeader {
                        last_process_time: now_ms,
                        ..header
                    },
                    payload: heapless::Vec::from_slice(payload).map_err(|_| Error::QueueFull)?,
                };
                match self.queue.push(item) {
                    Ok(()) => {
                        self.send_ack(frame.sender)?;
                        let _ = self.routing.update_queuelog(frame.sender, header.bcp_backpressure, true, cap);
                    }
                    Err(_) => {
                        warn!("forward queue full, dropping ack to {:?}", frame.sender);
                    }
                }
            }
        } else {
            let _ = self.routing.update_queuelog(frame.sender, header.bcp_backpressure, false, cap);
        }

        self.set_busy(false, "recv_from_broadcast");
        Ok(())
    }

    fn send_ack(&mut self, to: NodeAddr) -> Result<(), Error<L::Error>> {
        self.link.unicast(self.self_addr, to, PacketType::Ack, &[])?;
        Ok(())
    }

    /// Per-slot forwardable decay / DAG parent reselection, named by the
    /// node glue's slot ticker.
    pub fn tick_forwardable(&mut self) {
        self.routing.tick_forwardable(self.config.num_parents);
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use crate::link::mock::MockLink;
    use crate::weight::BasicWeight;
    use rand::rngs::mock::StepRng;

    struct RecordingCallbacks {
        received: std::vec::Vec<(NodeAddr, std::vec::Vec<u8>)>,
        sent_count: u32,
        dropped_count: u32,
    }

    impl RecordingCallbacks {
        fn new() -> Self {
            Self {
                received: std::vec::Vec::new(),
                sent_count: 0,
                dropped_count: 0,
            }
        }
    }

    impl Callbacks for RecordingCallbacks {
        fn recv(&mut self, origin: NodeAddr, payload: &[u8]) {
            self.received.push((origin, heapless_to_vec(payload)));
        }
        fn sent(&mut self, _payload: &[u8]) {
            self.sent_count += 1;
        }
        fn dropped(&mut self) {
            self.dropped_count += 1;
        }
    }

    fn heapless_to_vec(s: &[u8]) -> std::vec::Vec<u8> {
        s.to_vec()
    }

    fn conn(addr: u16) -> Connection<MockLink, BasicWeight> {
        Connection::new(Config::default(), NodeAddr(addr), MockLink::new(), BasicWeight)
    }

    #[test]
    fn oversized_send_is_dropped_without_touching_queue() {
        let mut c = conn(1);
        let mut cb = RecordingCallbacks::new();
        let mut rng = StepRng::new(0, 1);
        let big = [0u8; 64];
        let result = c.send(&big, 0, &mut cb, &mut rng);
        assert!(result.is_err());
        assert_eq!(cb.dropped_count, 1);
        assert_eq!(c.queue_len(), 0);
    }

    #[test]
    fn local_send_enqueues_with_self_origin() {
        let mut c = conn(1);
        let mut cb = RecordingCallbacks::new();
        let mut rng = StepRng::new(0, 1);
        c.send(&[0xCA, 0xFE], 0, &mut cb, &mut rng).unwrap();
        assert_eq!(c.queue_len(), 1);
    }

    #[test]
    fn ack_retires_head_of_queue_and_credits_neighbor() {
        let mut c = conn(1);
        let mut cb = RecordingCallbacks::new();
        let mut rng = StepRng::new(0, 1);
        c.send(&[1, 2], 0, &mut cb, &mut rng).unwrap();
        let cap = c.config.max_packet_queue_size as u16;
        c.routing.update_queuelog(NodeAddr(2), 8, false, cap).unwrap();
        c.tx_attempts = 3;

        let ack = Frame {
            packet_type: PacketType::Ack,
            sender: NodeAddr(2),
            receiver: NodeAddr(1),
            payload: heapless::Vec::new(),
        };
        c.on_ack(ack, &mut cb).unwrap();

        assert_eq!(c.queue_len(), 0);
        assert_eq!(c.tx_attempts(), 0);
        assert_eq!(cb.sent_count, 1);
        assert_eq!(c.routing.find(NodeAddr(2)).unwrap().backpressure, 3);
    }

    #[test]
    fn beacon_updates_neighbor_backpressure() {
        let mut c = conn(1);
        let header = crate::header::BeaconHeader { queuelog: 4 };
        let mut buf = [0u8; crate::header::BeaconHeader::LEN];
        header.encode(&mut buf);
        let frame = Frame {
            packet_type: PacketType::Beacon,
            sender: NodeAddr(9),
            receiver: NodeAddr::BROADCAST,
            payload: heapless::Vec::from_slice(&buf).unwrap(),
        };
        c.on_beacon(frame).unwrap();
        assert_eq!(c.routing.find(NodeAddr(9)).unwrap().backpressure, 4);
    }

    #[test]
    fn non_sink_forwards_data_addressed_to_self_and_blocks_sender() {
        let mut c = conn(2);
        let mut cb = RecordingCallbacks::new();

        let mut h = DataHeader {
            origin: NodeAddr(5),
            packet_length: 0,
            bcp_backpressure: 2,
            delay: 0,
            last_process_time: 0,
            fusion: None,
        };
        h.packet_length = h.wire_len() as u16 + 2;
        let mut buf = [0u8; 64];
        let n = h.encode(&mut buf);
        buf[n] = 0xAA;
        buf[n + 1] = 0xBB;

        let frame = Frame {
            packet_type: PacketType::Data,
            sender: NodeAddr(5),
            receiver: NodeAddr(2),
            payload: heapless::Vec::from_slice(&buf[..n + 2]).unwrap(),
        };
        c.on_data(frame, 100, &mut cb).unwrap();

        assert_eq!(c.queue_len(), 1);
        assert_eq!(c.routing.find(NodeAddr(5)).unwrap().forwardable, 11);
    }

    #[test]
    fn sink_delivers_via_recv_callback() {
        let mut c = conn(99);
        c.set_sink(true, 0);
        let mut cb = RecordingCallbacks::new();

        let mut h = DataHeader {
            origin: NodeAddr(5),
            packet_length: 0,
            bcp_backpressure: 0,
            delay: 0,
            last_process_time: 0,
            fusion: None,
        };
        h.packet_length = h.wire_len() as u16 + 2;
        let mut buf = [0u8; 64];
        let n = h.encode(&mut buf);
        buf[n] = 1;
        buf[n + 1] = 2;

        let frame = Frame {
            packet_type: PacketType::Data,
            sender: NodeAddr(7),
            receiver: NodeAddr(99),
            payload: heapless::Vec::from_slice(&buf[..n + 2]).unwrap(),
        };
        c.on_data(frame, 0, &mut cb).unwrap();

        assert_eq!(cb.received.len(), 1);
        assert_eq!(cb.received[0].0, NodeAddr(5));
        assert_eq!(&cb.received[0].1[..], &[1, 2]);
    }
}
