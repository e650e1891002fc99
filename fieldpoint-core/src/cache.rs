//! Per-slave register cache and scan scheduler.
//!
//! The cache owns one [`RegisterBlock`] per declared block of a slave's
//! hardware definition and keeps each block's last successfully read values.
//! Blocks carry a poll divisor (`frequency`): a block is read once every
//! `frequency` scan cycles, so rarely-changing configuration registers do not
//! eat bus bandwidth on every pass.
//!
//! Readers take a block's value vector under a short read lock that is never
//! held across an await, and scans replace the vector wholesale, so a reader
//! always observes a block either entirely old or entirely new.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::debug;

use fieldpoint_common::{Error, Result};

use crate::bus::BusTransport;
use crate::hwdef::{RegisterBlockDef, RegisterKind};
use crate::util::{read_lock, write_lock};

/// One cached register block.
struct RegisterBlock {
    start: u16,
    count: u16,
    kind: RegisterKind,
    /// Poll divisor from the hardware definition.
    frequency: u32,
    /// Cycle counter. 0 forces a read (first scan); reset to 1 after every
    /// read attempt, success or failure, so errors never accelerate retries.
    counter: AtomicU32,
    /// Last read values; `None` per slot until the first successful scan.
    values: RwLock<Vec<Option<u16>>>,
}

impl RegisterBlock {
    fn contains(&self, kind: RegisterKind, index: u16) -> bool {
        self.kind == kind && index >= self.start && index < self.start + self.count
    }
}

/// Authoritative register snapshot for one slave.
pub struct RegisterCache {
    blocks: Vec<RegisterBlock>,
    /// Held for the whole initial forced scan so first readers never race it.
    initial_scan: Mutex<()>,
    last_comm: RwLock<Option<Instant>>,
}

impl RegisterCache {
    /// Build a cache from the definition's register blocks.
    ///
    /// Overlapping blocks of the same kind are a configuration error: a
    /// register index must resolve to exactly one block.
    pub fn new(blocks: &[RegisterBlockDef]) -> Result<Self> {
        for (i, a) in blocks.iter().enumerate() {
            for b in blocks.iter().skip(i + 1) {
                if a.kind == b.kind
                    && a.start_reg < b.start_reg + b.count
                    && b.start_reg < a.start_reg + a.count
                {
                    return Err(Error::Config(format!(
                        "Overlapping {} register blocks at {} and {}",
                        a.kind.as_str(),
                        a.start_reg,
                        b.start_reg
                    )));
                }
            }
        }

        Ok(Self {
            blocks: blocks
                .iter()
                .map(|def| RegisterBlock {
                    start: def.start_reg,
                    count: def.count,
                    kind: def.kind,
                    frequency: def.frequency.max(1),
                    counter: AtomicU32::new(0),
                    values: RwLock::new(vec![None; def.count as usize]),
                })
                .collect(),
            initial_scan: Mutex::new(()),
            last_comm: RwLock::new(None),
        })
    }

    /// Run the initial forced scan of every block, ignoring poll divisors.
    ///
    /// Held under a guard so concurrent first reads wait for it; steady-state
    /// scans run unguarded and accept eventual consistency.
    pub async fn scan_initial(&self, bus: &dyn BusTransport, unit: u8) -> Result<bool> {
        let _guard = self.initial_scan.lock().await;
        self.scan_blocks(bus, unit, true).await
    }

    /// Run one scan cycle: read every block whose cycle counter is due.
    ///
    /// Returns whether at least one block was refreshed. The first bus error
    /// is returned after the remaining due blocks were still attempted;
    /// divisor bookkeeping advances either way.
    pub async fn scan(&self, bus: &dyn BusTransport, unit: u8) -> Result<bool> {
        self.scan_blocks(bus, unit, false).await
    }

    async fn scan_blocks(&self, bus: &dyn BusTransport, unit: u8, force: bool) -> Result<bool> {
        let mut scanned = false;
        let mut first_error = None;

        for block in &self.blocks {
            let counter = block.counter.load(Ordering::Relaxed);
            if !(force || counter == 0 || counter >= block.frequency) {
                block.counter.store(counter + 1, Ordering::Relaxed);
                continue;
            }

            match bus
                .read_registers(unit, block.kind, block.start, block.count)
                .await
            {
                Ok(values) if values.len() == block.count as usize => {
                    *write_lock(&block.values) = values.into_iter().map(Some).collect();
                    *write_lock(&self.last_comm) = Some(Instant::now());
                    scanned = true;
                }
                Ok(values) => {
                    // Prior values stay untouched on a length mismatch.
                    debug!(
                        start = block.start,
                        expected = block.count,
                        got = values.len(),
                        "Short response for register block"
                    );
                    first_error.get_or_insert(Error::Bus(format!(
                        "Short response for block {}: {} of {} registers",
                        block.start,
                        values.len(),
                        block.count
                    )));
                }
                Err(e) => {
                    debug!(start = block.start, error = %e, "Register block read failed");
                    first_error.get_or_insert(e);
                }
            }
            block.counter.store(1, Ordering::Relaxed);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(scanned),
        }
    }

    /// Cached read of `count` registers starting at `index`.
    ///
    /// Fails with [`Error::Config`] when the range lies outside every block
    /// of the kind and with [`Error::MissingRegister`] when a slot was never
    /// successfully scanned.
    pub fn get(&self, count: u16, index: u16, kind: RegisterKind) -> Result<Vec<u16>> {
        let block = self.find_block(index, kind)?;
        let offset = (index - block.start) as usize;
        let end = offset + count as usize;

        let values = read_lock(&block.values);
        if end > values.len() {
            return Err(Error::Config(format!(
                "Register range {}+{} crosses the block at {}",
                index, count, block.start
            )));
        }
        values[offset..end]
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.ok_or(Error::MissingRegister {
                    index: index + i as u16,
                })
            })
            .collect()
    }

    /// Cached read of a single register.
    pub fn get_one(&self, index: u16, kind: RegisterKind) -> Result<u16> {
        Ok(self.get(1, index, kind)?[0])
    }

    /// Cached read of a register pair (32-bit values).
    pub fn get_pair(&self, index: u16, kind: RegisterKind) -> Result<[u16; 2]> {
        let values = self.get(2, index, kind)?;
        Ok([values[0], values[1]])
    }

    /// Live read of exactly the requested range, updating every overlapping
    /// cache slot. Used for read-modify-write on shared mode registers and
    /// for read-after-write confirmation.
    pub async fn read_through(
        &self,
        bus: &dyn BusTransport,
        unit: u8,
        count: u16,
        index: u16,
        kind: RegisterKind,
    ) -> Result<Vec<u16>> {
        // Out-of-cache ranges are a configuration error, exactly like get().
        self.find_block(index, kind)?;

        let values = bus.read_registers(unit, kind, index, count).await?;
        for (i, value) in values.iter().enumerate() {
            let addr = index + i as u16;
            if let Some(block) = self.blocks.iter().find(|b| b.contains(kind, addr)) {
                write_lock(&block.values)[(addr - block.start) as usize] = Some(*value);
            }
        }
        Ok(values)
    }

    /// Seconds since the last successful block read, if any.
    pub fn last_comm_secs(&self) -> Option<f64> {
        (*read_lock(&self.last_comm)).map(|t| t.elapsed().as_secs_f64())
    }

    fn find_block(&self, index: u16, kind: RegisterKind) -> Result<&RegisterBlock> {
        self.blocks
            .iter()
            .find(|b| b.contains(kind, index))
            .ok_or_else(|| {
                Error::Config(format!("Unknown {} register {}", kind.as_str(), index))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBus;

    fn block(start: u16, count: u16, frequency: u32) -> RegisterBlockDef {
        RegisterBlockDef {
            start_reg: start,
            count,
            frequency,
            kind: RegisterKind::Holding,
        }
    }

    #[tokio::test]
    async fn test_wholesale_replacement() {
        let bus = MockBus::new();
        bus.set_registers(RegisterKind::Holding, 0, &[1, 2, 3, 4]);

        let cache = RegisterCache::new(&[block(0, 4, 1)]).unwrap();
        assert!(cache.scan(&bus, 1).await.unwrap());
        assert_eq!(cache.get(4, 0, RegisterKind::Holding).unwrap(), [1, 2, 3, 4]);

        bus.set_registers(RegisterKind::Holding, 0, &[9, 8, 7, 6]);
        assert!(cache.scan(&bus, 1).await.unwrap());
        assert_eq!(cache.get(4, 0, RegisterKind::Holding).unwrap(), [9, 8, 7, 6]);
    }

    #[tokio::test]
    async fn test_short_response_leaves_prior_values() {
        let bus = MockBus::new();
        bus.set_registers(RegisterKind::Holding, 0, &[5, 6]);

        let cache = RegisterCache::new(&[block(0, 2, 1)]).unwrap();
        cache.scan(&bus, 1).await.unwrap();

        bus.set_registers(RegisterKind::Holding, 0, &[7, 8]);
        bus.short_next_reads(1);
        assert!(cache.scan(&bus, 1).await.is_err());
        assert_eq!(cache.get(2, 0, RegisterKind::Holding).unwrap(), [5, 6]);
    }

    #[tokio::test]
    async fn test_counter_resets_after_every_attempt() {
        let bus = MockBus::new();
        bus.set_registers(RegisterKind::Holding, 0, &[0, 0]);

        let cache = RegisterCache::new(&[block(0, 2, 3)]).unwrap();

        // Counter 0 forces the first read; afterwards the block is due every
        // third cycle.
        cache.scan(&bus, 1).await.unwrap();
        assert_eq!(bus.read_count(RegisterKind::Holding, 0), 1);
        cache.scan(&bus, 1).await.unwrap();
        cache.scan(&bus, 1).await.unwrap();
        assert_eq!(bus.read_count(RegisterKind::Holding, 0), 1);
        cache.scan(&bus, 1).await.unwrap();
        assert_eq!(bus.read_count(RegisterKind::Holding, 0), 2);

        // A failed attempt resets the counter to 1 just like a success:
        // the next read happens exactly three cycles later, not sooner.
        bus.fail_next_reads(1);
        cache.scan(&bus, 1).await.unwrap();
        cache.scan(&bus, 1).await.unwrap();
        assert!(cache.scan(&bus, 1).await.is_err());
        assert_eq!(bus.read_count(RegisterKind::Holding, 0), 3);
        cache.scan(&bus, 1).await.unwrap();
        cache.scan(&bus, 1).await.unwrap();
        assert_eq!(bus.read_count(RegisterKind::Holding, 0), 3);
        cache.scan(&bus, 1).await.unwrap();
        assert_eq!(bus.read_count(RegisterKind::Holding, 0), 4);
    }

    #[tokio::test]
    async fn test_missing_register_and_unknown_register() {
        let cache = RegisterCache::new(&[block(0, 4, 1)]).unwrap();

        match cache.get(1, 2, RegisterKind::Holding) {
            Err(Error::MissingRegister { index }) => assert_eq!(index, 2),
            other => panic!("expected MissingRegister, got {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            cache.get(1, 100, RegisterKind::Holding),
            Err(Error::Config(_))
        ));
        // Input registers are a separate address space.
        assert!(matches!(
            cache.get(1, 2, RegisterKind::Input),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_read_through_updates_cache() {
        let bus = MockBus::new();
        bus.set_registers(RegisterKind::Holding, 0, &[1, 2, 3, 4]);

        let cache = RegisterCache::new(&[block(0, 4, 1)]).unwrap();
        cache.scan(&bus, 1).await.unwrap();

        bus.set_register(RegisterKind::Holding, 1, 42);
        let values = cache
            .read_through(&bus, 1, 2, 1, RegisterKind::Holding)
            .await
            .unwrap();
        assert_eq!(values, [42, 3]);
        assert_eq!(cache.get(1, 1, RegisterKind::Holding).unwrap(), [42]);
    }

    #[test]
    fn test_overlapping_blocks_rejected() {
        assert!(RegisterCache::new(&[block(0, 4, 1), block(2, 4, 1)]).is_err());

        // Same range on different kinds is fine.
        let input = RegisterBlockDef {
            start_reg: 0,
            count: 4,
            frequency: 1,
            kind: RegisterKind::Input,
        };
        assert!(RegisterCache::new(&[block(0, 4, 1), input]).is_ok());
    }
}
