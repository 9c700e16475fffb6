//! Busy waiting provided by the environment

/// Source of short, bounded busy waits.
///
/// All timeouts in this crate are expressed as an iteration count times a
/// fixed delay, so an implementation only has to guarantee that a call
/// waits *at least* the requested time.
pub trait Delay: Send + Sync {
    /// Waits for at least `us` microseconds
    fn delay_us(&self, us: u32);
}

/// The number of iterations of `step_us` needed to cover `total_us`.
///
/// Always at least 1, so that a zero timeout still checks once.
pub(crate) fn iterations(total_us: u128, step_us: u32) -> u32 {
    let step = u128::from(step_us.max(1));
    let count = total_us.div_ceil(step).max(1);
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod test {
    use super::iterations;

    #[test]
    fn iteration_count() {
        assert_eq!(iterations(5_000_000, 10), 500_000);
        assert_eq!(iterations(15, 10), 2);
        assert_eq!(iterations(0, 10), 1);
        assert_eq!(iterations(100, 0), 100);
    }
}
