//! Indicator LED controller (spec.md §4.9 — component K), grounded in
//! `CO_LEDs.c/h` (CiA 303-3).
//!
//! Pure function of time and the node's error/lifecycle flags: every 50 ms
//! it advances the flicker/blink/flash timers and recomputes which bits of
//! `red`/`green` are lit, matching the physical LED semantics CiA 303-3
//! defines for the CANopen run/error LED pair.

/// Bits combinable on [`Led::red`]/[`Led::green`] (`CO_LED_BITFIELD_t`).
pub mod bit {
    pub const FLICKER: u8 = 0x01;
    pub const BLINK: u8 = 0x02;
    pub const FLASH_1: u8 = 0x04;
    pub const FLASH_2: u8 = 0x08;
    pub const FLASH_3: u8 = 0x10;
    pub const FLASH_4: u8 = 0x20;
    pub const CANOPEN: u8 = 0x80;
}

use crate::types::NmtState;

/// Inputs sampled once per `process` call (`CO_LEDs_process` parameters).
#[derive(Debug, Clone, Copy, Default)]
pub struct LedInputs {
    pub nmt_state: Option<NmtState>,
    pub lss_config: bool,
    pub firmware_download: bool,
    pub err_can_busoff: bool,
    pub err_can_warn: bool,
    pub err_rpdo: bool,
    pub err_sync: bool,
    pub err_hbcons: bool,
    pub err_other: bool,
}

/// LED state, advanced on a 50 ms tick (`CO_LEDs_t`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Led {
    tmr_50ms_us: u32,
    tmr_200ms: u8,
    tmr_flash_1: u8,
    tmr_flash_2: u8,
    tmr_flash_3: u8,
    tmr_flash_4: u8,
    red: u8,
    green: u8,
}

impl Led {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn red(&self) -> u8 {
        self.red
    }

    pub fn green(&self) -> u8 {
        self.green
    }

    /// Advances the indicator state by `dt_us` and recomputes `red`/`green`.
    /// Returns a `timer_next_us` hint: the host may sleep up to this long
    /// before the next LED edge occurs.
    pub fn process(&mut self, dt_us: u32, inputs: LedInputs) -> u32 {
        let mut rd = 0u8;
        let mut gr = 0u8;
        let mut ticked = false;

        self.tmr_50ms_us += dt_us;
        while self.tmr_50ms_us >= 50_000 {
            let flicker_to_red = self.red & bit::FLICKER == 0;
            ticked = true;
            self.tmr_50ms_us -= 50_000;

            self.tmr_200ms += 1;
            if self.tmr_200ms > 3 {
                self.tmr_200ms = 0;
                rd = 0;
                gr = 0;

                if self.red & bit::BLINK == 0 {
                    rd |= bit::BLINK;
                } else {
                    gr |= bit::BLINK;
                }

                self.tmr_flash_1 += 1;
                match self.tmr_flash_1 {
                    1 => rd |= bit::FLASH_1,
                    2 => gr |= bit::FLASH_1,
                    6 => self.tmr_flash_1 = 0,
                    _ => {}
                }

                self.tmr_flash_2 += 1;
                match self.tmr_flash_2 {
                    1 | 3 => rd |= bit::FLASH_2,
                    2 | 4 => gr |= bit::FLASH_2,
                    8 => self.tmr_flash_2 = 0,
                    _ => {}
                }

                self.tmr_flash_3 += 1;
                match self.tmr_flash_3 {
                    1 | 3 | 5 => rd |= bit::FLASH_3,
                    2 | 4 | 6 => gr |= bit::FLASH_3,
                    10 => self.tmr_flash_3 = 0,
                    _ => {}
                }

                self.tmr_flash_4 += 1;
                match self.tmr_flash_4 {
                    1 | 3 | 5 | 7 => rd |= bit::FLASH_4,
                    2 | 4 | 6 | 8 => gr |= bit::FLASH_4,
                    12 => self.tmr_flash_4 = 0,
                    _ => {}
                }
            } else {
                rd = self.red & !(bit::FLICKER | bit::CANOPEN);
                gr = self.green & !(bit::FLICKER | bit::CANOPEN);
            }

            if flicker_to_red {
                rd |= bit::FLICKER;
            } else {
                gr |= bit::FLICKER;
            }
        }

        if ticked {
            let rd_co = if inputs.err_can_busoff {
                1
            } else if inputs.nmt_state == Some(NmtState::Initializing) {
                rd & bit::FLICKER
            } else if inputs.err_rpdo {
                rd & bit::FLASH_4
            } else if inputs.err_sync {
                rd & bit::FLASH_3
            } else if inputs.err_hbcons {
                rd & bit::FLASH_2
            } else if inputs.err_can_warn {
                rd & bit::FLASH_1
            } else if inputs.err_other {
                rd & bit::BLINK
            } else {
                0
            };

            let gr_co = if inputs.lss_config {
                gr & bit::FLICKER
            } else if inputs.firmware_download {
                gr & bit::FLASH_3
            } else if inputs.nmt_state == Some(NmtState::Stopped) {
                gr & bit::FLASH_1
            } else if inputs.nmt_state == Some(NmtState::PreOperational) {
                gr & bit::BLINK
            } else if inputs.nmt_state == Some(NmtState::Operational) {
                1
            } else {
                0
            };

            if rd_co != 0 {
                rd |= bit::CANOPEN;
            }
            if gr_co != 0 {
                gr |= bit::CANOPEN;
            }
            self.red = rd;
            self.green = gr;
        }

        50_000 - self.tmr_50ms_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_off_lights_solid_red() {
        let mut led = Led::new();
        led.process(
            50_000,
            LedInputs { err_can_busoff: true, ..Default::default() },
        );
        assert_ne!(led.red() & bit::CANOPEN, 0);
    }

    #[test]
    fn operational_lights_solid_green() {
        let mut led = Led::new();
        led.process(
            50_000,
            LedInputs { nmt_state: Some(NmtState::Operational), ..Default::default() },
        );
        assert_ne!(led.green() & bit::CANOPEN, 0);
    }

    #[test]
    fn no_tick_below_50ms_leaves_state_unchanged() {
        let mut led = Led::new();
        let before = (led.red(), led.green());
        led.process(10_000, LedInputs::default());
        assert_eq!((led.red(), led.green()), before);
    }

    #[test]
    fn timer_hint_never_exceeds_one_tick() {
        let mut led = Led::new();
        let hint = led.process(1_000, LedInputs::default());
        assert!(hint <= 50_000);
    }
}
