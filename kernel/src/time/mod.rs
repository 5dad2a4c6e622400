//! System time
//!
//! Monotonic time comes from the cycle counter: each CPU records a counter
//! zero point at bring-up and divides elapsed cycles by its calibrated
//! cycles-per-microsecond. Wall-clock time is anchored once at boot from
//! the CMOS collaborator; after that `unix_time` is pure arithmetic. The
//! per-CPU software timers live in [`timer`]; [`do_clocktick`] is the entry
//! the platform timer interrupt calls on every tick.

pub mod timer;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::smp::CpuData;

/// Microseconds per second.
pub const US_PER_SEC: u64 = 1_000_000;

/// Length of one platform timer tick in microseconds (PIT at 1 kHz).
pub const TICK_US: u64 = 1_000;

/// Microseconds since the Unix epoch at the moment the kernel booted.
static BOOT_TIME: AtomicU64 = AtomicU64::new(0);

/// Days before the first of each month (1-indexed; entry 0 unused).
static DAYS_BEFORE_MONTH: [u64; 13] = [
    0,
    0,
    31,
    31 + 28,
    31 + 28 + 31,
    31 + 28 + 31 + 30,
    31 + 28 + 31 + 30 + 31,
    31 + 28 + 31 + 30 + 31 + 30,
    31 + 28 + 31 + 30 + 31 + 30 + 31,
    31 + 28 + 31 + 30 + 31 + 30 + 31 + 31,
    31 + 28 + 31 + 30 + 31 + 30 + 31 + 31 + 30,
    31 + 28 + 31 + 30 + 31 + 30 + 31 + 31 + 30 + 31,
    31 + 28 + 31 + 30 + 31 + 30 + 31 + 31 + 30 + 31 + 30,
];

fn is_leap_year(year: u64) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

fn days_in_year(year: u64) -> u64 {
    if is_leap_year(year) {
        366
    } else {
        365
    }
}

/// Microseconds since boot, read from this CPU's cycle counter.
///
/// Panics if the CPU has not been calibrated; the clock is meaningless
/// before bring-up.
pub fn system_time(cpu: &CpuData) -> u64 {
    let cycles_per_us = cpu.cycles_per_us.load(Ordering::Acquire);
    assert!(cycles_per_us != 0, "cpu {} clock not calibrated", cpu.id);
    let offset = cpu.system_time_offset.load(Ordering::Acquire);
    (crate::arch::rdtsc().wrapping_sub(offset)) / cycles_per_us
}

/// Convert a CMOS broken-down UTC time to microseconds since the epoch.
pub fn time_to_unix(year: u64, mon: u64, day: u64, hour: u64, min: u64, sec: u64) -> u64 {
    assert!((1..=12).contains(&mon));
    let mut seconds = sec;
    seconds += min * 60;
    seconds += hour * 60 * 60;
    seconds += (day - 1) * 24 * 60 * 60;
    seconds += DAYS_BEFORE_MONTH[mon as usize] * 24 * 60 * 60;

    // Past February in a leap year there is one more day to account for.
    if mon > 2 && is_leap_year(year) {
        seconds += 24 * 60 * 60;
    }

    for y in 1970..year {
        seconds += days_in_year(y) * 24 * 60 * 60;
    }

    seconds * US_PER_SEC
}

/// Fix the boot-time anchor: `cmos_unix_us` minus how long we have already
/// been running. Called once at init on the boot CPU.
pub fn init_clock(cpu: &CpuData, cmos_unix_us: u64) {
    let boot = cmos_unix_us - system_time(cpu);
    BOOT_TIME.store(boot, Ordering::Release);
    log::debug!("boot time: {} microseconds since the epoch", boot);
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn unix_time(cpu: &CpuData) -> u64 {
    BOOT_TIME.load(Ordering::Acquire) + system_time(cpu)
}

/// Platform timer tick entry, called on every CPU at tick granularity.
///
/// Walks the CPU's expired timers under its timer lock and reports whether
/// the interrupt-return path must reschedule; the need-resched flag is also
/// latched on the CPU record so the decision survives until that path runs.
pub fn do_clocktick(cpu: &CpuData) -> bool {
    let now = system_time(cpu);
    let preempt = cpu.timers.lock().expire(now);
    if preempt {
        cpu.need_resched.store(true, Ordering::Release);
    }
    preempt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::CpuTable;

    #[test]
    fn test_time_to_unix_epoch() {
        assert_eq!(time_to_unix(1970, 1, 1, 0, 0, 0), 0);
    }

    #[test]
    fn test_time_to_unix_known_dates() {
        // 2000-01-01T00:00:00Z
        assert_eq!(time_to_unix(2000, 1, 1, 0, 0, 0), 946_684_800 * US_PER_SEC);
        // 2004-02-29T00:00:00Z, a leap day
        assert_eq!(time_to_unix(2004, 2, 29, 0, 0, 0), 1_078_012_800 * US_PER_SEC);
        // 2004-03-01T00:00:00Z crosses the leap-day adjustment
        assert_eq!(time_to_unix(2004, 3, 1, 0, 0, 0), 1_078_099_200 * US_PER_SEC);
        // 1999-12-31T23:59:59Z
        assert_eq!(
            time_to_unix(1999, 12, 31, 23, 59, 59),
            946_684_799 * US_PER_SEC
        );
    }

    #[test]
    fn test_system_time_advances() {
        let table = CpuTable::new(1);
        table.bring_up(0, 1).unwrap();
        let cpu = table.get(0).unwrap();
        let a = system_time(cpu);
        let b = system_time(cpu);
        assert!(b >= a);
    }

    #[test]
    #[should_panic(expected = "not calibrated")]
    fn test_system_time_requires_calibration() {
        let table = CpuTable::new(1);
        let _ = system_time(table.get(0).unwrap());
    }

    #[test]
    fn test_boot_time_anchor() {
        let table = CpuTable::new(1);
        // A huge calibration keeps system_time near zero for the test.
        table.bring_up(0, u64::MAX / 2).unwrap();
        let cpu = table.get(0).unwrap();

        let cmos = time_to_unix(2026, 8, 1, 12, 0, 0);
        init_clock(cpu, cmos);
        let now = unix_time(cpu);
        assert!(now >= cmos);
        assert!(now - cmos < US_PER_SEC);
    }
}
