//! Scripted in-memory bus for tests.
//!
//! [`MockBus`] implements [`BusTransport`] against a plain register map with
//! optional failure injection and a write log, so scan, backoff and device
//! behavior can be exercised without hardware.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use fieldpoint_common::{Error, Result};

use crate::bus::BusTransport;
use crate::hwdef::RegisterKind;
use crate::notify::{ChangeBatch, ChangeNotifier};
use crate::util::lock;

/// One recorded write operation.
#[derive(Debug, Clone, PartialEq)]
pub enum BusWrite {
    Coil { unit: u8, addr: u16, value: bool },
    Register { unit: u8, addr: u16, value: u16 },
    Registers { unit: u8, addr: u16, values: Vec<u16> },
}

#[derive(Default)]
struct MockBusState {
    registers: HashMap<(RegisterKind, u16), u16>,
    coils: HashMap<u16, bool>,
    /// Reads failing with a bus error, counted down per read operation.
    fail_reads: u32,
    /// Reads answered one register short, counted down per read operation.
    short_reads: u32,
    reads: Vec<(RegisterKind, u16, u16)>,
    writes: Vec<BusWrite>,
}

/// In-memory [`BusTransport`] with failure injection.
#[derive(Default)]
pub struct MockBus {
    state: Mutex<MockBusState>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one register value.
    pub fn set_register(&self, kind: RegisterKind, addr: u16, value: u16) {
        lock(&self.state).registers.insert((kind, addr), value);
    }

    /// Set a run of register values starting at `start`.
    pub fn set_registers(&self, kind: RegisterKind, start: u16, values: &[u16]) {
        let mut state = lock(&self.state);
        for (i, value) in values.iter().enumerate() {
            state.registers.insert((kind, start + i as u16), *value);
        }
    }

    /// Current value of a register (after any writes).
    pub fn register(&self, kind: RegisterKind, addr: u16) -> Option<u16> {
        lock(&self.state).registers.get(&(kind, addr)).copied()
    }

    /// Current value of a coil (after any writes).
    pub fn coil(&self, addr: u16) -> Option<bool> {
        lock(&self.state).coils.get(&addr).copied()
    }

    /// Fail the next `n` read operations with a bus error.
    pub fn fail_next_reads(&self, n: u32) {
        lock(&self.state).fail_reads = n;
    }

    /// Answer the next `n` read operations one register short.
    pub fn short_next_reads(&self, n: u32) {
        lock(&self.state).short_reads = n;
    }

    /// Number of bulk reads issued for the given kind and start address.
    pub fn read_count(&self, kind: RegisterKind, start: u16) -> usize {
        lock(&self.state)
            .reads
            .iter()
            .filter(|(k, s, _)| *k == kind && *s == start)
            .count()
    }

    /// All recorded writes, in order.
    pub fn writes(&self) -> Vec<BusWrite> {
        lock(&self.state).writes.clone()
    }

    /// Last value written to a holding register, if any.
    pub fn written_register(&self, addr: u16) -> Option<u16> {
        lock(&self.state)
            .writes
            .iter()
            .rev()
            .find_map(|w| match w {
                BusWrite::Register { addr: a, value, .. } if *a == addr => Some(*value),
                BusWrite::Registers { addr: a, values, .. }
                    if *a <= addr && addr < *a + values.len() as u16 =>
                {
                    Some(values[(addr - a) as usize])
                }
                _ => None,
            })
    }

    /// Last value written to a coil, if any.
    pub fn written_coil(&self, addr: u16) -> Option<bool> {
        lock(&self.state).writes.iter().rev().find_map(|w| match w {
            BusWrite::Coil { addr: a, value, .. } if *a == addr => Some(*value),
            _ => None,
        })
    }

    /// Drop the recorded write log.
    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }
}

/// Notifier that records every delivered change batch.
#[derive(Default)]
pub struct CollectingNotifier {
    batches: Mutex<Vec<ChangeBatch>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<ChangeBatch> {
        lock(&self.batches).clone()
    }

    pub fn batch_count(&self) -> usize {
        lock(&self.batches).len()
    }
}

impl ChangeNotifier for CollectingNotifier {
    fn devices_changed(&self, batch: ChangeBatch) {
        lock(&self.batches).push(batch);
    }
}

#[async_trait]
impl BusTransport for MockBus {
    async fn read_registers(
        &self,
        _unit: u8,
        kind: RegisterKind,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let mut state = lock(&self.state);
        state.reads.push((kind, addr, count));

        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(Error::Bus("mock: injected read failure".to_string()));
        }

        let effective = if state.short_reads > 0 {
            state.short_reads -= 1;
            count.saturating_sub(1)
        } else {
            count
        };

        Ok((0..effective)
            .map(|i| {
                state
                    .registers
                    .get(&(kind, addr + i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn write_coil(&self, unit: u8, addr: u16, value: bool) -> Result<()> {
        let mut state = lock(&self.state);
        state.coils.insert(addr, value);
        state.writes.push(BusWrite::Coil { unit, addr, value });
        Ok(())
    }

    async fn write_register(&self, unit: u8, addr: u16, value: u16) -> Result<()> {
        let mut state = lock(&self.state);
        state.registers.insert((RegisterKind::Holding, addr), value);
        state.writes.push(BusWrite::Register { unit, addr, value });
        Ok(())
    }

    async fn write_registers(&self, unit: u8, addr: u16, values: &[u16]) -> Result<()> {
        let mut state = lock(&self.state);
        for (i, value) in values.iter().enumerate() {
            state
                .registers
                .insert((RegisterKind::Holding, addr + i as u16), *value);
        }
        state.writes.push(BusWrite::Registers {
            unit,
            addr,
            values: values.to_vec(),
        });
        Ok(())
    }
}
