//! Counter plumbing for the `stats` feature.
//!
//! `stat!(counter)` bumps a field of the global stats block by one;
//! `stat!(counter, n)` adds `n`. The counters are observational (per tier:
//! entry points, message pipeline, slab engine, backend), so relaxed
//! ordering is enough. With the `stats` feature disabled neither arm
//! leaves a trace — the value expression is not even evaluated.

#[macro_export]
macro_rules! stat {
    ($counter:ident) => {
        #[cfg(feature = "stats")]
        {
            $crate::stats::STATS
                .$counter
                .fetch_add(1, ::core::sync::atomic::Ordering::Relaxed);
        }
    };
    ($counter:ident, $val:expr) => {
        #[cfg(feature = "stats")]
        {
            $crate::stats::STATS
                .$counter
                .fetch_add($val as u64, ::core::sync::atomic::Ordering::Relaxed);
        }
    };
}
