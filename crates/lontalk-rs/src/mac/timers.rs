// crates/lontalk-rs/src/mac/timers.rs
//! Channel-access timer math (spec §4.2 "Timers"), all in 25 MHz / 40 ns
//! ticks scaled by the `nts` spec-time-unit multiplier derived from the
//! input clock.

/// Decodes the `rxPad`/`txPad` encoding from §4.2: `v * 41` for `v < 128`,
/// else `(v - 128) * 145`.
pub fn decode_pad(v: u8) -> u32 {
    if v < 128 {
        v as u32 * 41
    } else {
        (v as u32 - 128) * 145
    }
}

/// Bundles the configuration inputs that feed the timer formulas, mirroring
/// the node's `configReserved[]` bytes and the channel's priority slot count.
#[derive(Debug, Clone, Copy)]
pub struct MacTimerConfig {
    /// `configReserved[1]`: cycle timer scale.
    pub comm_scale: u8,
    /// `configReserved[2]`: beta2 scale.
    pub beta2_scale: u8,
    /// Node's 1-based priority slot number (0 = no priority slot owned).
    pub node_priority: u8,
    /// Total number of priority slots on the channel.
    pub channel_priorities: u8,
    /// Raw encoded rx-pad byte.
    pub rx_pad_raw: u8,
    /// Raw encoded tx-pad byte.
    pub tx_pad_raw: u8,
    /// `nts`: spec-time-unit multiplier derived from the input clock.
    pub nts: u32,
}

impl MacTimerConfig {
    pub fn beta2(&self) -> u64 {
        (self.beta2_scale as u64 * 20 + 40) * self.nts as u64
    }

    pub fn beta1_post_rx(&self) -> u64 {
        (285 + self.beta2_scale as u64 + decode_pad(self.rx_pad_raw) as u64 + 317) * self.nts as u64
    }

    pub fn beta1_post_tx(&self) -> u64 {
        (307 + self.beta2_scale as u64 + decode_pad(self.tx_pad_raw) as u64 + 317) * self.nts as u64
    }

    pub fn w_base(&self) -> u64 {
        16 * self.beta2()
    }

    pub fn cycle_ticks(&self) -> u64 {
        self.comm_scale as u64 * 1794 * self.nts as u64
    }

    pub fn priority_channel_ticks(&self, post_tx_extra: bool) -> u64 {
        let slots = self.channel_priorities as u64 + if post_tx_extra { 16 } else { 0 };
        slots * self.beta2()
    }

    pub fn priority_node_ticks(&self) -> u64 {
        if self.node_priority == 0 {
            0
        } else {
            (self.node_priority as u64 - 1) * self.beta2()
        }
    }
}
