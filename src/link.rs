//! The link-layer contract: attributed broadcast + unicast channels with
//! addressed delivery. A real implementation would sit atop an 802.15.4 or
//! LoRa radio; this crate only specifies the contract and a mock used in
//! tests and `demos/bcp-sim.rs`.

use heapless::{consts::U256, Vec};

use crate::address::NodeAddr;
use crate::header::{ChannelAttributes, PacketType};

/// A frame as handed to or received from the link layer. Owned (rather
/// than borrowing the link's internal buffer) so the mock link below can
/// be a plain FIFO without self-referential lifetimes.
#[derive(Clone, Debug)]
pub struct Frame {
    pub packet_type: PacketType,
    pub sender: NodeAddr,
    /// Explicit receiver: `NodeAddr::BROADCAST`, `self`, or a third party
    /// overheard on the shared medium.
    pub receiver: NodeAddr,
    pub payload: Vec<u8, U256>,
}

/// Outcome of a send attempt.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendStatus {
    Ok,
    ChannelBusy,
}

/// Broadcast + unicast channel pair with attribute tagging, as named by
/// the connection's `Open`/`Close` operations.
pub trait Link {
    type Error;

    /// Open broadcast on `channel` and unicast on an adjacent channel,
    /// advertising `attrs` (the packet-type values this connection will
    /// send/accept).
    fn open(&mut self, channel: u8, attrs: ChannelAttributes) -> Result<(), Self::Error>;

    fn close(&mut self) -> Result<(), Self::Error>;

    /// Broadcast `payload` tagged `packet_type`, from `sender`, carrying an
    /// explicit receiver tag (`NodeAddr::BROADCAST` for beacons/beacon
    /// requests, a specific neighbour for data frames addressed over the
    /// shared medium). The physical transmission is always broadcast; the
    /// receiver tag is what lets a receiver tell "addressed to me",
    /// "addressed to someone else" (overheard), and "broadcast" apart.
    fn broadcast(
        &mut self,
        sender: NodeAddr,
        receiver: NodeAddr,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<SendStatus, Self::Error>;

    /// Send `payload` unicast to `receiver`, tagged `packet_type`.
    fn unicast(
        &mut self,
        sender: NodeAddr,
        receiver: NodeAddr,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<SendStatus, Self::Error>;

    /// Non-blocking poll for a received frame addressed to `self_addr`,
    /// broadcast, or overheard.
    fn poll_receive(&mut self, self_addr: NodeAddr) -> Result<Option<Frame>, Self::Error>;

    /// True while a transmission is outstanding (mirrors the connection's
    /// own `busy` flag at the radio level).
    fn channel_busy(&self) -> bool;
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use super::*;
    use heapless::{consts::U16, Vec as HVec};

    /// A point-to-point mock: every frame sent is queued for delivery and
    /// drained by `poll_receive`. Tests wire two or more of these together
    /// by draining one side's `sent` log and `inject`ing into the peer.
    pub struct MockLink {
        inbox: HVec<Frame, U16>,
        pub sent: HVec<Frame, U16>,
        busy: bool,
    }

    impl Default for MockLink {
        fn default() -> Self {
            Self {
                inbox: HVec::new(),
                sent: HVec::new(),
                busy: false,
            }
        }
    }

    impl MockLink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Deliver a frame to this link's inbox, as if received over the
        /// air. Used by test harnesses to connect two mock links.
        pub fn inject(&mut self, f: Frame) -> Result<(), Frame> {
            self.inbox.push(f)
        }

        fn record(
            &mut self,
            packet_type: PacketType,
            sender: NodeAddr,
            receiver: NodeAddr,
            payload: &[u8],
        ) -> Result<SendStatus, ()> {
            let frame = Frame {
                packet_type,
                sender,
                receiver,
                payload: Vec::from_slice(payload).map_err(|_| ())?,
            };
            self.sent.push(frame).map_err(|_| ())?;
            Ok(SendStatus::Ok)
        }
    }

    impl Link for MockLink {
        type Error = ();

        fn open(&mut self, _channel: u8, _attrs: ChannelAttributes) -> Result<(), Self::Error> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), Self::Error> {
            self.inbox.clear();
            Ok(())
        }

        fn broadcast(
            &mut self,
            sender: NodeAddr,
            receiver: NodeAddr,
            packet_type: PacketType,
            payload: &[u8],
        ) -> Result<SendStatus, Self::Error> {
            self.record(packet_type, sender, receiver, payload)
        }

        fn unicast(
            &mut self,
            sender: NodeAddr,
            receiver: NodeAddr,
            packet_type: PacketType,
            payload: &[u8],
        ) -> Result<SendStatus, Self::Error> {
            self.record(packet_type, sender, receiver, payload)
        }

        fn poll_receive(&mut self, _self_addr: NodeAddr) -> Result<Option<Frame>, Self::Error> {
            if self.inbox.is_empty() {
                return Ok(None);
            }
            let front = self.inbox[0].clone();
            for i in 1..self.inbox.len() {
                self.inbox[i - 1] = self.inbox[i].clone();
            }
            self.inbox.pop();
            Ok(Some(front))
        }

        fn channel_busy(&self) -> bool {
            self.busy
        }
    }

    #[cfg(test)]
    mod test {
        extern crate std;

        use super::*;
        use crate::address::NodeAddr;
        use crate::header::PacketType;

        #[test]
        fn broadcast_then_inject_round_trip() {
            let mut a = MockLink::new();
            let mut b = MockLink::new();

            a.broadcast(NodeAddr(1), NodeAddr::BROADCAST, PacketType::Beacon, &[1, 2, 3])
                .unwrap();
            let sent = a.sent.pop().unwrap();
            b.inject(sent).unwrap();

            let recv = b.poll_receive(NodeAddr(2)).unwrap().unwrap();
            assert_eq!(recv.sender, NodeAddr(1));
            assert_eq!(recv.receiver, NodeAddr::BROADCAST);
            assert_eq!(&recv.payload[..], &[1, 2, 3]);
        }
    }
}
