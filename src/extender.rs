//! Capability interface spliced into the connection's send/receive path.
//! Replaces the original's function-table-of-callbacks with an enum: at
//! most one extender per connection, dispatch by variant.

use rand_core::RngCore;

use crate::fusion::{self, FusionState};
use crate::header::DataHeader;

/// The five hook points named by the connection's send/receive handlers.
pub enum Extender {
    /// No extender attached; every hook is a no-op / passthrough.
    None,
    /// The fusion extension (§4.6).
    Fusion(FusionState),
}

impl Extender {
    pub fn none() -> Self {
        Extender::None
    }

    pub fn fusion(n_cid: u16) -> Self {
        Extender::Fusion(FusionState::new(n_cid))
    }

    /// Called just after `send()` pushes a locally-originated item.
    pub fn on_user_send_request<R: RngCore>(&mut self, header: &mut DataHeader, rng: &mut R) {
        if let Extender::Fusion(state) = self {
            let cid = state.cid(rng);
            fusion::on_user_send_request(header, cid);
        }
    }

    /// Called before header staging in the send timer. No-op for every
    /// extender currently implemented; kept as a named hook so future
    /// extenders (or the fusion extension, should it need pre-staging
    /// mutation) have somewhere to attach.
    pub fn prepare_sending_data(&mut self, _header: &mut DataHeader) {}

    /// Called after header staging, before broadcast. Returning `false`
    /// aborts this send attempt.
    pub fn before_sending_data(&mut self, header: &mut DataHeader, sending_budget: &mut u32) -> bool {
        match self {
            Extender::None => true,
            Extender::Fusion(_) => fusion::before_sending_data(header, sending_budget),
        }
    }

    /// Called after broadcast is handed off. Bookkeeping only.
    pub fn after_sending_data(&mut self, _header: &DataHeader) {}

    /// Called on accepted forward or sink delivery, before enqueue/callback.
    pub fn on_receiving_data(&mut self, header: &mut DataHeader) {
        if let Extender::Fusion(_) = self {
            fusion::on_receiving_data(header);
        }
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use crate::address::NodeAddr;
    use rand::rngs::mock::StepRng;

    fn header() -> DataHeader {
        DataHeader {
            origin: NodeAddr(1),
            packet_length: 14,
            bcp_backpressure: 0,
            delay: 0,
            last_process_time: 0,
            fusion: None,
        }
    }

    #[test]
    fn none_extender_never_aborts() {
        let mut ext = Extender::none();
        let mut h = header();
        let mut budget = 0u32;
        assert!(ext.before_sending_data(&mut h, &mut budget));
    }

    #[test]
    fn fusion_extender_stamps_cid_and_gates_on_budget() {
        let mut rng = StepRng::new(1, 1);
        let mut ext = Extender::fusion(4);
        let mut h = header();

        ext.on_user_send_request(&mut h, &mut rng);
        assert!(h.fusion.is_some());

        let mut budget = 0u32;
        assert!(!ext.before_sending_data(&mut h, &mut budget));

        let mut budget = 1u32;
        assert!(ext.before_sending_data(&mut h, &mut budget));
        assert_eq!(budget, 0);
    }
}
