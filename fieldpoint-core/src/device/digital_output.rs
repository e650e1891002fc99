//! Digital output with PWM support.
//!
//! Two PWM generations exist. Hard PWM runs off a 48 MHz timer divided by
//! `(cycle + 1) * (prescale + 1)`; the duty register counts timer ticks, so a
//! duty percentage scales with the cycle value. Soft PWM picks from a small
//! preset table (1 kHz / 100 Hz) or pins the preset to "custom" and writes an
//! explicit millisecond prescaler; its duty register takes the percentage
//! directly.
//!
//! The PWM clock is shared per board, so a frequency change propagates to the
//! sibling outputs of the same bank: their shadows adopt the new clock and
//! any nonzero duty is rewritten against the new cycle value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use fieldpoint_common::{Error, Result};

use crate::util::{lock, read_lock, write_lock};

use super::decode::round_to;
use super::{
    AliasSlot, Device, DeviceKind, ModbusChannel, PendingTimer, SetRequest, kind_mismatch,
    with_alias,
};

/// Hard-PWM base clock.
const PWM_BASE_CLOCK: f64 = 48_000_000.0;
/// Round cycle divisors tried in order for hard-PWM frequency solving.
const PWM_CYCLE_DIVISORS: [u32; 4] = [50_000, 10_000, 5_000, 1_000];
/// Soft-PWM preset table: preset register value to frequency.
const SOFT_PRESETS: [(u16, f64); 2] = [(0, 1000.0), (1, 100.0)];
/// Soft-PWM preset selecting the custom prescaler.
const SOFT_PRESET_CUSTOM: u16 = 2;

/// PWM register wiring of one output.
#[derive(Debug, Clone, Copy)]
pub enum PwmWiring {
    /// 48 MHz timer PWM: duty in timer ticks, shared cycle and prescale.
    Hard {
        duty_reg: u16,
        cycle_reg: u16,
        prescale_reg: u16,
    },
    /// Firmware PWM: duty 0-100, shared preset and custom prescaler.
    Soft {
        duty_reg: u16,
        preset_reg: u16,
        prescaler_reg: u16,
    },
}

impl PwmWiring {
    fn duty_reg(&self) -> u16 {
        match self {
            PwmWiring::Hard { duty_reg, .. } | PwmWiring::Soft { duty_reg, .. } => *duty_reg,
        }
    }
}

#[derive(Default)]
struct Shadow {
    value: Option<u8>,
    mode: Option<String>,
    pwm_freq: Option<f64>,
    pwm_duty: Option<f64>,
    pwm_duty_val: Option<u16>,
    // Hard-PWM clock (+1 applied).
    cycle_val: Option<u32>,
    prescale_val: Option<u32>,
    // Soft-PWM preset and custom prescaler, as read.
    preset_val: Option<u16>,
    prescaler_val: Option<u16>,
}

pub struct DigitalOutput {
    circuit: String,
    channel: ModbusChannel,
    coil: u16,
    val_reg: u16,
    bitmask: u16,
    modes: Vec<String>,
    pwm: PwmWiring,
    timer: PendingTimer,
    /// Suppresses PWM re-derivation while a frequency write is in flight.
    block_pwm: AtomicBool,
    siblings: RwLock<Vec<Weak<DigitalOutput>>>,
    alias: AliasSlot,
    state: Mutex<Shadow>,
}

impl DigitalOutput {
    pub fn new(
        circuit: impl Into<String>,
        channel: ModbusChannel,
        coil: u16,
        val_reg: u16,
        bitmask: u16,
        modes: Vec<String>,
        pwm: PwmWiring,
    ) -> Self {
        Self {
            circuit: circuit.into(),
            channel,
            coil,
            val_reg,
            bitmask,
            modes,
            pwm,
            timer: PendingTimer::new(),
            block_pwm: AtomicBool::new(false),
            siblings: RwLock::new(Vec::new()),
            alias: AliasSlot::new(),
            state: Mutex::new(Shadow::default()),
        }
    }

    /// Wire up the outputs sharing this output's PWM clock. Called once by
    /// the board parser after the whole bank exists.
    pub fn set_siblings(&self, siblings: Vec<Weak<DigitalOutput>>) {
        *write_lock(&self.siblings) = siblings;
    }

    fn siblings(&self) -> Vec<Arc<DigitalOutput>> {
        read_lock(&self.siblings)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn duty(&self) -> Option<f64> {
        lock(&self.state).pwm_duty
    }

    fn adopt_hard_clock(&self, freq: f64, cycle: u32, prescale: u32) {
        let mut state = lock(&self.state);
        state.pwm_freq = Some(freq);
        state.cycle_val = Some(cycle);
        state.prescale_val = Some(prescale);
    }

    fn adopt_soft_clock(&self, freq: Option<f64>) {
        lock(&self.state).pwm_freq = freq;
    }

    async fn apply_frequency(&self, freq: f64) -> Result<()> {
        match self.pwm {
            PwmWiring::Soft {
                preset_reg,
                prescaler_reg,
                ..
            } => {
                let preset = SOFT_PRESETS
                    .iter()
                    .find(|(_, f)| *f == freq)
                    .map(|(preset, _)| *preset);
                match preset {
                    Some(preset) => {
                        self.channel.write_register(preset_reg, preset).await?;
                        lock(&self.state).pwm_freq = Some(freq);
                    }
                    None => {
                        let prescaler = (1000.0 / freq).round() - 1.0;
                        if !(0.0..=u16::MAX as f64).contains(&prescaler) {
                            return Err(Error::Validation(format!(
                                "'{}': PWM frequency {} out of range",
                                self.circuit, freq
                            )));
                        }
                        let prescaler = prescaler as u16;
                        self.channel
                            .write_register(preset_reg, SOFT_PRESET_CUSTOM)
                            .await?;
                        self.channel.write_register(prescaler_reg, prescaler).await?;
                        lock(&self.state).pwm_freq =
                            Some(round_to(1000.0 / (1.0 + prescaler as f64), 1));
                    }
                }

                let adopted = lock(&self.state).pwm_freq;
                for sibling in self.siblings() {
                    sibling.adopt_soft_clock(adopted);
                }
            }
            PwmWiring::Hard {
                cycle_reg,
                prescale_reg,
                ..
            } => {
                let (prescale, cycle) = solve_hard_pwm(freq);
                if prescale == 0 || prescale > u16::MAX as u32 + 1 {
                    return Err(Error::Validation(format!(
                        "'{}': PWM frequency {} out of range",
                        self.circuit, freq
                    )));
                }

                // Sibling duties are captured before the clock moves.
                let siblings: Vec<(Arc<DigitalOutput>, Option<f64>)> = self
                    .siblings()
                    .into_iter()
                    .map(|s| {
                        let duty = s.duty();
                        (s, duty)
                    })
                    .collect();

                self.channel
                    .write_register(cycle_reg, (cycle - 1) as u16)
                    .await?;
                self.channel
                    .write_register(prescale_reg, (prescale - 1) as u16)
                    .await?;
                self.adopt_hard_clock(freq, cycle, prescale);

                for (sibling, duty) in siblings {
                    sibling.adopt_hard_clock(freq, cycle, prescale);
                    if let Some(duty) = duty.filter(|d| *d > 0.0) {
                        let duty_val = (cycle as f64 * duty / 100.0).round() as u16;
                        sibling
                            .channel
                            .write_register(sibling.pwm.duty_reg(), duty_val)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Solve the hard-PWM divider pair `(prescale, cycle)` for a frequency.
///
/// Round cycle values that divide the delay evenly are preferred, largest
/// first, so common frequencies land on exact, human-recognizable dividers;
/// anything else balances the pair around the square root of the delay.
fn solve_hard_pwm(freq: f64) -> (u32, u32) {
    let delay = PWM_BASE_CLOCK / freq;
    for divisor in PWM_CYCLE_DIVISORS {
        if (delay.trunc() as u64) % (divisor as u64) == 0 && delay / divisor as f64 < 65535.0 {
            return ((delay / divisor as f64).round() as u32, divisor);
        }
    }
    let balanced = delay.sqrt().round() as u32;
    (balanced, balanced)
}

#[async_trait]
impl Device for DigitalOutput {
    fn kind(&self) -> DeviceKind {
        DeviceKind::DigitalOutput
    }

    fn circuit(&self) -> &str {
        &self.circuit
    }

    fn alias(&self) -> Option<String> {
        self.alias.get()
    }

    fn set_alias(&self, alias: Option<String>) {
        self.alias.set(alias);
    }

    fn full(&self) -> Value {
        let state = lock(&self.state);
        let snapshot = json!({
            "dev": "do",
            "circuit": self.circuit,
            "value": state.value,
            "pending": self.timer.is_armed(),
            "mode": state.mode,
            "modes": self.modes,
            "pwm_freq": state.pwm_freq,
            "pwm_duty": state.pwm_duty,
        });
        drop(state);
        with_alias(snapshot, &self.alias)
    }

    fn simple(&self) -> Value {
        json!({
            "dev": "do",
            "circuit": self.circuit,
            "value": lock(&self.state).value,
        })
    }

    fn check_new_data(&self) -> Result<bool> {
        let mut is_change = false;

        if !self.block_pwm.load(Ordering::Acquire) {
            match self.pwm {
                PwmWiring::Hard {
                    duty_reg,
                    cycle_reg,
                    prescale_reg,
                } => {
                    let cycle = self.channel.register(cycle_reg)? as u32 + 1;
                    let prescale = self.channel.register(prescale_reg)? as u32 + 1;
                    let duty_val = self.channel.register(duty_reg)?;

                    let mut state = lock(&self.state);
                    if state.cycle_val != Some(cycle) || state.prescale_val != Some(prescale) {
                        is_change = true;
                        state.cycle_val = Some(cycle);
                        state.prescale_val = Some(prescale);
                        state.pwm_freq = Some(PWM_BASE_CLOCK / (cycle * prescale) as f64);
                    }
                    if is_change || state.pwm_duty_val != Some(duty_val) {
                        is_change = true;
                        state.pwm_duty_val = Some(duty_val);
                        if duty_val == 0 {
                            state.pwm_duty = Some(0.0);
                            state.mode = Some("Simple".to_string());
                        } else {
                            state.pwm_duty =
                                Some(round_to(duty_val as f64 / cycle as f64 * 100.0, 1));
                            state.mode = Some("PWM".to_string());
                        }
                    }
                }
                PwmWiring::Soft {
                    duty_reg,
                    preset_reg,
                    prescaler_reg,
                } => {
                    let preset = self.channel.register(preset_reg)?;
                    let prescaler = self.channel.register(prescaler_reg)?;
                    let duty_val = self.channel.register(duty_reg)?;

                    let mut state = lock(&self.state);
                    if state.preset_val != Some(preset) || state.prescaler_val != Some(prescaler)
                    {
                        is_change = true;
                        state.preset_val = Some(preset);
                        state.prescaler_val = Some(prescaler);
                        state.pwm_freq = SOFT_PRESETS
                            .iter()
                            .find(|(p, _)| *p == preset)
                            .map(|(_, f)| *f)
                            .or(Some(round_to(1000.0 / (1.0 + prescaler as f64), 1)));
                    }
                    if is_change || state.pwm_duty_val != Some(duty_val) {
                        is_change = true;
                        state.pwm_duty_val = Some(duty_val);
                        if duty_val == 0 {
                            state.pwm_duty = Some(0.0);
                            state.mode = Some("Simple".to_string());
                        } else {
                            state.pwm_duty = Some(duty_val as f64);
                            state.mode = Some("PWM".to_string());
                        }
                    }
                }
            }
        }

        let value = u8::from(self.channel.register(self.val_reg)? & self.bitmask != 0);
        let mut state = lock(&self.state);
        let value_changed = state.value != Some(value);
        state.value = Some(value);
        Ok(is_change || value_changed)
    }

    async fn set(&self, request: SetRequest) -> Result<Value> {
        let update = match request {
            SetRequest::DigitalOutput(update) => update,
            other => return Err(kind_mismatch(self, &other)),
        };

        // Any overwrite disarms a pending delayed-off.
        self.timer.cancel();

        if let Some(duty) = update.pwm_duty {
            if !(0.0..=100.0).contains(&duty) {
                return Err(Error::Validation(format!(
                    "'{}': pwm_duty {} out of range 0-100",
                    self.circuit, duty
                )));
            }
        }
        if let Some(timeout) = update.timeout {
            if timeout < 0.0 {
                return Err(Error::Validation(format!(
                    "'{}': negative timeout",
                    self.circuit
                )));
            }
        }

        if let Some(freq) = update.pwm_freq {
            if freq > 0.0 {
                self.block_pwm.store(true, Ordering::Release);
                let result = self.apply_frequency(freq).await;
                self.block_pwm.store(false, Ordering::Release);
                result?;
            }
        }

        if let Some(value) = update.value {
            if let Some(duty) = update.pwm_duty {
                let agrees =
                    (duty == 100.0 && value) || (duty == 0.0 && !value);
                if !agrees {
                    return Err(Error::Validation(format!(
                        "'{}': cannot set both value and pwm_duty at once",
                        self.circuit
                    )));
                }
            }

            lock(&self.state).mode = Some("Simple".to_string());
            self.channel.write_coil(self.coil, value).await?;

            // A running PWM is switched off by a plain binary write.
            let pwm_running = lock(&self.state).pwm_duty.is_some_and(|d| d != 0.0);
            if pwm_running {
                lock(&self.state).pwm_duty = Some(0.0);
                self.channel.write_register(self.pwm.duty_reg(), 0).await?;
            }

            if let Some(timeout) = update.timeout {
                let channel = self.channel.clone();
                let coil = self.coil;
                let circuit = self.circuit.clone();
                self.timer.arm(async move {
                    tokio::time::sleep(Duration::from_secs_f64(timeout)).await;
                    if let Err(e) = channel.write_coil(coil, !value).await {
                        warn!(circuit = %circuit, error = %e, "Delayed output write failed");
                    }
                });
            }
        } else if let Some(duty) = update.pwm_duty {
            let duty_val = match self.pwm {
                PwmWiring::Soft { .. } => duty.round() as u16,
                PwmWiring::Hard { .. } => {
                    let cycle = lock(&self.state).cycle_val.ok_or_else(|| {
                        Error::Validation(format!(
                            "'{}': PWM cycle value not known yet",
                            self.circuit
                        ))
                    })?;
                    (cycle as f64 * duty / 100.0).round() as u16
                }
            };

            if lock(&self.state).value != Some(0) {
                self.channel.write_coil(self.coil, false).await?;
            }
            self.channel
                .write_register(self.pwm.duty_reg(), duty_val)
                .await?;
            lock(&self.state).mode = Some("PWM".to_string());
        }

        Ok(self.full())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RegisterCache;
    use crate::device::DigitalOutputUpdate;
    use crate::hwdef::{RegisterBlockDef, RegisterKind};
    use crate::testing::{BusWrite, MockBus};

    #[test]
    fn test_solve_hard_pwm_round_divisors() {
        // 480 Hz: delay 100000, evenly divided by 50000.
        assert_eq!(solve_hard_pwm(480.0), (2, 50_000));
        // 48 Hz: delay 1000000.
        assert_eq!(solve_hard_pwm(48.0), (20, 50_000));
        // 4800 Hz: delay 10000; 50000 does not divide it, 10000 does.
        assert_eq!(solve_hard_pwm(4800.0), (1, 10_000));
        // 9600 Hz: delay 5000.
        assert_eq!(solve_hard_pwm(9600.0), (1, 5_000));
        // 48 kHz: delay 1000.
        assert_eq!(solve_hard_pwm(48_000.0), (1, 1_000));
    }

    #[test]
    fn test_solve_hard_pwm_sqrt_fallback() {
        // 7 Hz: delay 6857142.86, no round divisor fits.
        let (prescale, cycle) = solve_hard_pwm(7.0);
        assert_eq!(prescale, cycle);
        assert_eq!(prescale, (6_857_142.857f64).sqrt().round() as u32);
    }

    fn hard_wiring() -> PwmWiring {
        PwmWiring::Hard {
            duty_reg: 2,
            cycle_reg: 3,
            prescale_reg: 4,
        }
    }

    fn soft_wiring() -> PwmWiring {
        PwmWiring::Soft {
            duty_reg: 2,
            preset_reg: 3,
            prescaler_reg: 4,
        }
    }

    fn setup(pwm: PwmWiring) -> (std::sync::Arc<MockBus>, std::sync::Arc<RegisterCache>, Arc<DigitalOutput>) {
        let bus = std::sync::Arc::new(MockBus::new());
        let cache = std::sync::Arc::new(
            RegisterCache::new(&[RegisterBlockDef {
                start_reg: 0,
                count: 8,
                frequency: 1,
                kind: RegisterKind::Holding,
            }])
            .unwrap(),
        );
        let channel = ModbusChannel::new(bus.clone(), 1, cache.clone());
        let out = Arc::new(DigitalOutput::new(
            "plc01_01",
            channel,
            0,
            0,
            0x1,
            vec!["Simple".to_string(), "PWM".to_string()],
            pwm,
        ));
        (bus, cache, out)
    }

    #[tokio::test]
    async fn test_hard_duty_scales_with_cycle() {
        let (bus, cache, out) = setup(hard_wiring());

        // Cached cycle value of 999 (register stores cycle - 1).
        bus.set_register(RegisterKind::Holding, 3, 998);
        bus.set_register(RegisterKind::Holding, 4, 0);
        cache.scan(bus.as_ref(), 1).await.unwrap();
        out.check_new_data().unwrap();

        out.set(SetRequest::DigitalOutput(DigitalOutputUpdate {
            pwm_duty: Some(50.0),
            ..Default::default()
        }))
        .await
        .unwrap();
        // round(999 * 0.5) = 500
        assert_eq!(bus.written_register(2), Some(500));
    }

    #[tokio::test]
    async fn test_soft_duty_written_directly() {
        let (bus, cache, out) = setup(soft_wiring());

        bus.set_register(RegisterKind::Holding, 0, 0);
        cache.scan(bus.as_ref(), 1).await.unwrap();
        out.check_new_data().unwrap();

        out.set(SetRequest::DigitalOutput(DigitalOutputUpdate {
            pwm_duty: Some(33.4),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.written_register(2), Some(33));
    }

    #[tokio::test]
    async fn test_value_duty_conflict() {
        let (_bus, _cache, out) = setup(soft_wiring());

        let result = out
            .set(SetRequest::DigitalOutput(DigitalOutputUpdate {
                value: Some(true),
                pwm_duty: Some(40.0),
                ..Default::default()
            }))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        // The edge cases agree and pass.
        out.set(SetRequest::DigitalOutput(DigitalOutputUpdate {
            value: Some(true),
            pwm_duty: Some(100.0),
            ..Default::default()
        }))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_duty_out_of_range() {
        let (_bus, _cache, out) = setup(soft_wiring());

        let result = out
            .set(SetRequest::DigitalOutput(DigitalOutputUpdate {
                pwm_duty: Some(120.0),
                ..Default::default()
            }))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_hard_frequency_propagates_to_siblings() {
        let (bus, cache, out) = setup(hard_wiring());

        let sibling = Arc::new(DigitalOutput::new(
            "plc01_02",
            ModbusChannel::new(bus.clone(), 1, cache.clone()),
            1,
            0,
            0x2,
            vec!["Simple".to_string(), "PWM".to_string()],
            PwmWiring::Hard {
                duty_reg: 5,
                cycle_reg: 3,
                prescale_reg: 4,
            },
        ));
        out.set_siblings(vec![Arc::downgrade(&sibling)]);
        sibling.set_siblings(vec![Arc::downgrade(&out)]);

        // Sibling currently runs at 50% duty of a 1000-tick cycle.
        bus.set_register(RegisterKind::Holding, 3, 999);
        bus.set_register(RegisterKind::Holding, 4, 0);
        bus.set_register(RegisterKind::Holding, 5, 500);
        cache.scan(bus.as_ref(), 1).await.unwrap();
        out.check_new_data().unwrap();
        sibling.check_new_data().unwrap();

        // 480 Hz lands on cycle 50000, prescale 2.
        out.set(SetRequest::DigitalOutput(DigitalOutputUpdate {
            pwm_freq: Some(480.0),
            ..Default::default()
        }))
        .await
        .unwrap();

        assert_eq!(bus.written_register(3), Some(49_999));
        assert_eq!(bus.written_register(4), Some(1));
        // Sibling duty of 50% was rewritten against the new cycle.
        assert_eq!(bus.written_register(5), Some(25_000));
        assert_eq!(lock(&sibling.state).cycle_val, Some(50_000));
    }

    #[tokio::test]
    async fn test_soft_preset_and_custom_frequency() {
        let (bus, _cache, out) = setup(soft_wiring());

        // Exact preset: only the preset register is written.
        out.set(SetRequest::DigitalOutput(DigitalOutputUpdate {
            pwm_freq: Some(100.0),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.written_register(3), Some(1));
        assert_eq!(bus.written_register(4), None);

        // Custom: preset pinned to 2, prescaler = round(1000/freq) - 1.
        out.set(SetRequest::DigitalOutput(DigitalOutputUpdate {
            pwm_freq: Some(40.0),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.written_register(3), Some(2));
        assert_eq!(bus.written_register(4), Some(24));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_off_fires_and_cancels() {
        let (bus, _cache, out) = setup(soft_wiring());

        out.set(SetRequest::DigitalOutput(DigitalOutputUpdate {
            value: Some(true),
            timeout: Some(5.0),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.written_coil(0), Some(true));
        assert_eq!(out.full()["pending"], true);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(bus.written_coil(0), Some(false));
        assert_eq!(out.full()["pending"], false);

        // A new set cancels the pending timer before it fires.
        out.set(SetRequest::DigitalOutput(DigitalOutputUpdate {
            value: Some(true),
            timeout: Some(5.0),
            ..Default::default()
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        out.set(SetRequest::DigitalOutput(DigitalOutputUpdate {
            value: Some(true),
            ..Default::default()
        }))
        .await
        .unwrap();
        bus.clear_writes();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            bus.writes()
                .iter()
                .filter(|w| matches!(w, BusWrite::Coil { value: false, .. }))
                .count(),
            0
        );
    }

    #[tokio::test]
    async fn test_binary_write_turns_pwm_off() {
        let (bus, cache, out) = setup(soft_wiring());

        // PWM running at 60%.
        bus.set_register(RegisterKind::Holding, 2, 60);
        bus.set_register(RegisterKind::Holding, 3, 0);
        cache.scan(bus.as_ref(), 1).await.unwrap();
        out.check_new_data().unwrap();
        assert_eq!(out.full()["pwm_duty"], 60.0);

        bus.clear_writes();
        out.set(SetRequest::DigitalOutput(DigitalOutputUpdate {
            value: Some(true),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(bus.written_coil(0), Some(true));
        assert_eq!(bus.written_register(2), Some(0));
    }
}
