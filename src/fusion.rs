//! Correlation-ID aware in-network aggregation.
//!
//! Each data item carries a `cid` assigned once per node; `perform_fusion`
//! walks the queue collecting same-`cid` items and replaces groups of two
//! or more with a single synthetic item.

use rand_core::RngCore;

use crate::address::NodeAddr;
use crate::header::{DataHeader, FusionFields};
use crate::queue::{Queue, QueueItem};

/// Per-connection fusion state: the node's correlation ID (drawn once)
/// and the energy budgets debited by the extender hooks.
pub struct FusionState {
    cid: Option<u16>,
    n_cid: u16,
}

impl FusionState {
    pub fn new(n_cid: u16) -> Self {
        Self { cid: None, n_cid }
    }

    /// This node's correlation ID, drawn once from `rng` on first use.
    pub fn cid<R: RngCore>(&mut self, rng: &mut R) -> u16 {
        if let Some(c) = self.cid {
            return c;
        }
        let c = (rng.next_u32() % self.n_cid as u32) as u16 + 1;
        self.cid = Some(c);
        c
    }
}

fn is_fusion_packet(item: &QueueItem) -> bool {
    item.header.origin == NodeAddr::FUSION_ORIGIN
}

/// Stamp `cid`/`fused` on a newly-originated item and size its header for
/// the extended (fusion) wire layout. Mirrors `onUserRequest` in the
/// original.
pub fn on_user_send_request(header: &mut DataHeader, cid: u16) {
    header.fusion = Some(FusionFields { fused: false, cid });
    header.packet_length = header.wire_len() as u16;
}

/// Gate a send attempt on the remaining per-slot sending budget; debits
/// one unit on success. Returns `false` to signal "abort this send".
pub fn before_sending_data(header: &mut DataHeader, sending_budget: &mut u32) -> bool {
    if *sending_budget == 0 {
        return false;
    }
    header.packet_length = header.wire_len() as u16;
    *sending_budget -= 1;
    true
}

/// Restores fusion eligibility on an incoming (possibly fusion) item so a
/// downstream node may re-fuse it.
pub fn on_receiving_data(header: &mut DataHeader) {
    if header.origin == NodeAddr::FUSION_ORIGIN {
        if let Some(f) = &mut header.fusion {
            f.fused = false;
        }
    }
}

/// Walk the queue per correlation-ID bucket, collecting unfused,
/// non-self-originated items, and replace groups of two or more with one
/// synthetic fused item. `fusion_budget` is shared across all `cid`
/// buckets in this call and is never driven negative.
pub fn perform_fusion(
    queue: &mut Queue,
    self_addr: NodeAddr,
    n_cid: u16,
    fusion_budget: &mut u32,
    now_ms: u32,
) {
    for cid in 1..=n_cid {
        let mut collected: heapless::Vec<usize, heapless::consts::U32> = heapless::Vec::new();
        let mut total_delay: u64 = 0;
        let mut running_total: u32 = 0;

        for idx in queue.indices_top_down() {
            if *fusion_budget == 0 {
                break;
            }
            let item = match queue.get(idx) {
                Some(i) => i,
                None => continue,
            };

            match item.header.fusion {
                Some(f) if f.cid == cid && !f.fused => {}
                _ => continue,
            }

            if item.header.origin == self_addr {
                continue;
            }

            if is_fusion_packet(item) {
                running_total += u32::from_le_bytes([
                    *item.payload.get(0).unwrap_or(&0),
                    *item.payload.get(1).unwrap_or(&0),
                    0,
                    0,
                ]);
            }

            if collected.push(idx).is_err() {
                break;
            }
            total_delay += item.header.delay as u64;

            let counter = collected.len();
            if counter == 2 {
                *fusion_budget = fusion_budget.saturating_sub(2);
            } else if counter > 2 {
                *fusion_budget = fusion_budget.saturating_sub(1);
            }
        }

        if collected.len() < 2 {
            continue;
        }

        // Remove highest indices first so earlier indices stay valid.
        let mut sorted = collected.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        for idx in sorted.iter() {
            queue.remove(*idx);
        }

        let count = collected.len() as u32;
        let avg_delay = (total_delay / count as u64) as u32;
        let total = running_total + count;

        let mut payload: heapless::Vec<u8, heapless::consts::U256> = heapless::Vec::new();
        let bytes = (total as u16).to_le_bytes();
        let _ = payload.push(bytes[0]);
        let _ = payload.push(bytes[1]);

        let fused_item = QueueItem {
            header: DataHeader {
                origin: NodeAddr::FUSION_ORIGIN,
                packet_length: 0,
                bcp_backpressure: 0,
                delay: avg_delay,
                last_process_time: now_ms,
                fusion: Some(FusionFields { fused: true, cid }),
            },
            payload,
        };
        let _ = queue.push(fused_item);
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;

    fn item(origin: NodeAddr, cid: u16, delay: u32) -> QueueItem {
        QueueItem {
            header: DataHeader {
                origin,
                packet_length: 19,
                bcp_backpressure: 0,
                delay,
                last_process_time: 0,
                fusion: Some(FusionFields { fused: false, cid }),
            },
            payload: heapless::Vec::new(),
        }
    }

    #[test]
    fn fuses_three_matching_items_into_one() {
        let mut q = Queue::new(10);
        q.push(item(NodeAddr(1), 1, 10)).unwrap();
        q.push(item(NodeAddr(2), 1, 20)).unwrap();
        q.push(item(NodeAddr(3), 1, 30)).unwrap();

        let mut budget = 100u32;
        perform_fusion(&mut q, NodeAddr(99), 2, &mut budget, 1_000);

        assert_eq!(q.len(), 1);
        let fused = q.top().unwrap();
        assert_eq!(fused.header.origin, NodeAddr::FUSION_ORIGIN);
        assert!(fused.header.fusion.unwrap().fused);
        let count = u16::from_le_bytes([fused.payload[0], fused.payload[1]]);
        assert_eq!(count, 3);
        assert_eq!(fused.header.delay, 20);
    }

    #[test]
    fn single_item_does_not_fuse() {
        let mut q = Queue::new(10);
        q.push(item(NodeAddr(1), 1, 10)).unwrap();
        let mut budget = 100u32;
        perform_fusion(&mut q, NodeAddr(99), 2, &mut budget, 1_000);
        assert_eq!(q.len(), 1);
        assert_eq!(q.top().unwrap().header.origin, NodeAddr(1));
    }

    #[test]
    fn self_originated_items_are_excluded() {
        let mut q = Queue::new(10);
        q.push(item(NodeAddr(99), 1, 10)).unwrap();
        q.push(item(NodeAddr(1), 1, 20)).unwrap();
        let mut budget = 100u32;
        perform_fusion(&mut q, NodeAddr(99), 2, &mut budget, 1_000);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn cid_assigned_once() {
        use rand::rngs::mock::StepRng;
        let mut rng = StepRng::new(5, 1);
        let mut state = FusionState::new(4);
        let c1 = state.cid(&mut rng);
        let c2 = state.cid(&mut rng);
        assert_eq!(c1, c2);
        assert!(c1 >= 1 && c1 <= 4);
    }
}
