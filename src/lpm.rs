//! Local power manager: a day/night hysteresis classifier over a solar
//! input trace, an ENO (energy-neutral-operation) target recomputed at
//! each night transition, and the per-slot energy budget derived from it.

use crate::config::Config;

/// Tracks the daily solar model and derives a per-slot energy budget.
pub struct Lpm {
    battery_max: i64,
    battery_level: i64,
    leakage: i64,
    e_min: i64,
    e_max: i64,
    recharge_eta: f32,

    initialized: bool,
    night_started: bool,
    prev_is_day: bool,
    changing_counter: u32,
    hysteresis: u32,

    day_first_slot: u32,
    night_first_slot: u32,
    previous_day_first_slot: Option<u32>,
    day_duration: u32,
    slot_counter: u32,
    previous_slot_is_day: Option<bool>,

    eno: i64,
    phi: i64,

    energy_consumption: i64,
    pre_solar: i64,
}

impl Lpm {
    pub fn new(config: &Config) -> Self {
        Self {
            battery_max: config.battery_max,
            battery_level: config.battery_max,
            leakage: config.leakage,
            e_min: config.e_min,
            e_max: config.e_max,
            recharge_eta: config.recharge_eta,

            initialized: false,
            night_started: true,
            prev_is_day: false,
            changing_counter: 0,
            hysteresis: config.day_night_hysteresis,

            day_first_slot: 1,
            night_first_slot: 0,
            previous_day_first_slot: None,
            day_duration: 0,
            slot_counter: 1,
            previous_slot_is_day: None,

            eno: 0,
            phi: 0,

            energy_consumption: 0,
            pre_solar: 0,
        }
    }

    pub fn battery_level(&self) -> i64 {
        self.battery_level
    }

    pub fn energy_budget(&self) -> i64 {
        self.energy_consumption
    }

    fn is_day_time(&mut self, solar_energy: u32) -> bool {
        let raw = solar_energy > 1;
        if raw != self.prev_is_day {
            self.changing_counter += 1;
            if self.changing_counter < self.hysteresis {
                return self.prev_is_day;
            }
        }
        self.prev_is_day = raw;
        self.changing_counter = 0;
        raw
    }

    fn new_cycle(&mut self) {
        self.slot_counter += 1;
        if self.slot_counter > self.day_duration && self.day_duration != 0 {
            self.day_duration = self.slot_counter;
        }
    }

    fn slot_update(&mut self, solar_energy: u32) {
        let current_is_day = self.is_day_time(solar_energy);

        if Some(current_is_day) != self.previous_slot_is_day {
            if current_is_day {
                if self.night_started {
                    if self.initialized {
                        self.previous_day_first_slot = Some(self.slot_counter);
                    }
                    self.day_first_slot = 1;
                    self.slot_counter = 1;
                    self.night_started = false;
                }
            } else if !self.night_started && solar_energy == 0 {
                self.initialized = true;
                self.night_started = true;
                self.night_first_slot = self.slot_counter;

                let previous_day_first_slot = self.previous_day_first_slot.unwrap_or(287);
                self.previous_day_first_slot = Some(previous_day_first_slot);

                self.day_duration = previous_day_first_slot.saturating_sub(self.day_first_slot);
                self.eno = (self.e_min + self.leakage)
                    * (self.day_first_slot + self.day_duration - self.night_first_slot) as i64;
            }
        }

        self.previous_slot_is_day = Some(current_is_day);
    }

    fn calc_phi(&mut self, solar_energy: u32) {
        self.slot_update(solar_energy);

        if !self.initialized {
            self.eno = 0;
            self.phi = 0;
            return;
        }

        let p: i64 = if self.is_day_time(solar_energy) {
            let span = (self.night_first_slot as i64 - self.day_first_slot as i64).max(1);
            (self.slot_counter as i64 - self.day_first_slot as i64) * 100 / span
        } else {
            let span = (self.day_first_slot as i64 + self.day_duration as i64
                - self.night_first_slot as i64)
                .max(1);
            (self.day_first_slot as i64 + self.day_duration as i64 - self.slot_counter as i64) * 100
                / span
        };
        let p = if p <= 0 { 1 } else { p };

        self.phi = p * self.eno * 300 / 100;
    }

    fn clamp_consumption(&self, energy: i64) -> i64 {
        energy.max(self.e_min).min(self.e_max)
    }

    fn clamp_battery(&mut self) {
        self.battery_level = self.battery_level.max(0).min(self.battery_max);
    }

    /// Feed one slot's solar input; recomputes the energy budget returned
    /// by `energy_budget()`.
    pub fn set_input(&mut self, solar_energy: u32) {
        self.new_cycle();
        self.calc_phi(solar_energy);

        if !self.initialized {
            self.energy_consumption = 0;
            return;
        }

        let mut consumption =
            solar_energy as i64 + self.battery_level - self.phi - self.leakage;
        consumption = self.clamp_consumption(consumption);

        self.pre_solar = solar_energy as i64;

        if (solar_energy as i64) > consumption {
            let recharge_term =
                ((self.battery_level - self.phi) as f32 / self.recharge_eta) as i64;
            consumption = solar_energy as i64 + recharge_term - self.leakage;
            consumption = self.clamp_consumption(consumption);
        }

        self.energy_consumption = consumption;
    }

    /// Return the unused portion of the previous slot's budget, adjusting
    /// the battery level for the next slot.
    pub fn set_unused_energy(&mut self, unused: i64) {
        if !self.initialized {
            return;
        }

        if self.energy_consumption - unused > 0 {
            self.energy_consumption -= unused;
        }

        let delta_battery = if self.pre_solar > self.energy_consumption {
            ((self.pre_solar - self.energy_consumption) as f32 * self.recharge_eta) as i64
                - self.leakage
        } else {
            self.pre_solar - self.energy_consumption - self.leakage
        };

        self.battery_level += delta_battery;
        self.clamp_battery();
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;

    fn config() -> Config {
        let mut c = Config::default();
        c.day_night_hysteresis = 2;
        c
    }

    #[test]
    fn first_day_reports_zero_budget() {
        let mut lpm = Lpm::new(&config());
        lpm.set_input(100);
        assert_eq!(lpm.energy_budget(), 0);
    }

    #[test]
    fn initializes_after_a_full_day_night_cycle() {
        let mut lpm = Lpm::new(&config());
        for _ in 0..5 {
            lpm.set_input(100);
        }
        for _ in 0..5 {
            lpm.set_input(0);
        }
        assert!(lpm.energy_budget() >= 0);
    }

    #[test]
    fn battery_level_stays_within_bounds() {
        let mut lpm = Lpm::new(&config());
        for _ in 0..20 {
            lpm.set_input(50);
            lpm.set_unused_energy(0);
        }
        assert!(lpm.battery_level() >= 0);
        assert!(lpm.battery_level() <= Config::default().battery_max);
    }
}
