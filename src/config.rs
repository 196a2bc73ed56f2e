//! Compile-time-flavoured parameters, exposed as a runtime `Config` so a
//! single build can be retargeted without recompiling.

/// Numeric parameters governing queue/table capacity, timer cadence, and
/// the energy model. Defaults match the reference test-bench values.
#[derive(Clone, PartialEq, Debug)]
pub struct Config {
    /// Packet queue capacity.
    pub max_packet_queue_size: usize,

    /// Routing table capacity.
    pub max_routing_table_size: usize,

    /// Payload cap for locally-originated sends. A test-bench value in the
    /// original source (`2`); raised here to a runtime parameter rather
    /// than a compile-time constant.
    pub max_user_packet_size: usize,

    /// Slot period in milliseconds: forwardable decay, LPM input, sensing.
    pub slot_duration_ms: u32,

    /// Beacon re-arm period in milliseconds.
    pub beacon_time_ms: u32,

    /// Send timer period in milliseconds (non-sinks).
    pub send_time_delay_ms: u32,

    /// Base retransmission spacing in milliseconds; scaled by attempt count.
    pub retx_time_ms: u32,

    /// Check-timer watchdog period, expressed in slots.
    pub check_slots: u32,

    /// Number of slots a neighbour stays blocked after forwarding data
    /// through it (loop avoidance).
    pub forward_block_slots: u16,

    /// Number of correlation-ID buckets for the fusion extension.
    pub n_cid: u16,

    /// Number of DAG parents selected per forwardable tick (DAG mode only).
    pub num_parents: usize,

    /// Energy cost of a single forward attempt (weight-estimator divisor).
    pub send_cost: u32,

    /// Energy cost of fusing one item (weight-estimator divisor).
    pub fuse_cost: u32,

    /// Energy cost of one sensing sample.
    pub sensing_cost: u32,

    /// Lyapunov tuning constant used by the sensing controller.
    pub lyapunov_v: u32,

    /// Hard cap on samples per slot regardless of budget.
    pub sensing_r_max: u32,

    /// Battery capacity, in the LPM's abstract energy units.
    pub battery_max: i64,

    /// Minimum per-slot energy draw the LPM will ever report as budget.
    pub e_min: i64,

    /// Maximum per-slot energy draw the LPM will ever report as budget.
    pub e_max: i64,

    /// Constant leakage subtracted from every slot's energy accounting.
    pub leakage: i64,

    /// Recharging efficiency (0,1].
    pub recharge_eta: f32,

    /// Consecutive contradictory samples required to flip day/night state.
    pub day_night_hysteresis: u32,

    /// Link-loss EWMA decay, percent weight on the previous estimate.
    /// Reserved for a richer link-quality-aware weight estimator; unused by
    /// `Basic`/`EnergyAware`.
    pub link_loss_alpha: u32,

    /// V value weighting link losses in a Lyapunov-based estimator.
    /// Reserved, unused by `Basic`/`EnergyAware`.
    pub link_loss_v: u32,

    /// Link-rate EWMA decay, percent weight on the previous estimate.
    /// Reserved, unused by `Basic`/`EnergyAware`.
    pub link_est_alpha: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_queue_size: 70,
            max_routing_table_size: 40,
            max_user_packet_size: 2,

            slot_duration_ms: 1_000,
            beacon_time_ms: 100,
            send_time_delay_ms: 100,
            retx_time_ms: 140,
            check_slots: 10,
            forward_block_slots: 10,

            n_cid: 4,
            num_parents: 2,

            send_cost: 1,
            fuse_cost: 1,
            sensing_cost: 1,
            lyapunov_v: 10,
            sensing_r_max: 10,

            battery_max: 10_000,
            e_min: 10,
            e_max: 5_000,
            leakage: 1,
            recharge_eta: 0.74,

            day_night_hysteresis: 20,

            link_loss_alpha: 90,
            link_loss_v: 2,
            link_est_alpha: 9,
        }
    }
}
