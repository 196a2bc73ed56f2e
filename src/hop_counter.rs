//! Bootstrap hop-count flood: sinks advertise `hop_count = 1`; non-sinks
//! learn a shortest-path candidate and advertise `shortest + 1` after a
//! random delay, then tear down the bootstrap channel.

use rand_core::RngCore;

/// Tracks the bootstrap phase for one connection.
pub struct HopCounter {
    is_sink: bool,
    initialized: bool,
    advertise_deadline: Option<u32>,
    close_deadline: Option<u32>,
    closed: bool,
}

impl HopCounter {
    /// Open the bootstrap channel. Sinks schedule their own advertisement
    /// `prepare_delay_ms` after open; non-sinks wait for a peer.
    pub fn open(is_sink: bool, now_ms: u32, prepare_delay_ms: u32) -> Self {
        Self {
            is_sink,
            initialized: false,
            advertise_deadline: if is_sink {
                Some(now_ms + prepare_delay_ms)
            } else {
                None
            },
            close_deadline: None,
            closed: false,
        }
    }

    /// On receipt of a peer's advertisement (after the caller has already
    /// applied it to the routing table), arm this node's own advertisement
    /// at a random delay if none is pending yet.
    pub fn on_received<R: RngCore>(&mut self, now_ms: u32, max_seconds: u32, rng: &mut R) {
        if self.initialized || self.advertise_deadline.is_some() {
            return;
        }
        let bound = max_seconds.max(1);
        let delay_s = rng.next_u32() % bound;
        self.advertise_deadline = Some(now_ms + delay_s * 1_000);
    }

    /// Poll for expiry. Returns the hop count to advertise when it's time
    /// to broadcast, arming the close timer in the same step.
    pub fn tick(&mut self, now_ms: u32, max_seconds: u32, shortest_hop: Option<u16>) -> Option<u16> {
        if self.closed {
            return None;
        }

        if let Some(deadline) = self.advertise_deadline {
            if now_ms >= deadline {
                self.advertise_deadline = None;
                self.initialized = true;
                self.close_deadline = Some(now_ms + max_seconds * 1_000);

                let hop_count = if self.is_sink {
                    1
                } else {
                    shortest_hop.map(|h| h + 1).unwrap_or(1)
                };
                return Some(hop_count);
            }
        }

        if let Some(close_at) = self.close_deadline {
            if now_ms >= close_at {
                self.closed = true;
            }
        }

        None
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;

    #[test]
    fn sink_advertises_hop_one_after_prepare_delay() {
        let mut hc = HopCounter::open(true, 0, 1_000);
        assert_eq!(hc.tick(500, 10, None), None);
        assert_eq!(hc.tick(1_000, 10, None), Some(1));
    }

    #[test]
    fn non_sink_waits_then_advertises_shortest_plus_one() {
        let mut rng = rand::rngs::mock::StepRng::new(3, 1);
        let mut hc = HopCounter::open(false, 0, 1_000);
        assert_eq!(hc.tick(2_000, 10, Some(2)), None);

        hc.on_received(2_000, 10, &mut rng);
        let deadline = hc.advertise_deadline.unwrap();
        assert_eq!(hc.tick(deadline, 10, Some(2)), Some(3));
    }

    #[test]
    fn closes_after_max_seconds_following_advertisement() {
        let mut hc = HopCounter::open(true, 0, 1_000);
        hc.tick(1_000, 10, None);
        assert!(!hc.is_closed());
        hc.tick(11_000, 10, None);
        assert!(hc.is_closed());
    }
}
