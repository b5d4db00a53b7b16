//! Case counts for the crate's property tests.
//!
//! Frame arithmetic and ring-buffer properties are cheap to check natively
//! but slow under Miri, so every `proptest!` block in this crate takes its
//! case count from here:
//!
//! ```ignore
//! proptest! {
//!     #![proptest_config(ProptestConfig {
//!         cases: miri_case_count(),
//!         ..ProptestConfig::default()
//!     })]
//!     #[test]
//!     fn conversion_is_monotonic(a in 0i32..100_000) { /* ... */ }
//! }
//! ```

/// 256 cases natively, 5 under Miri.
#[must_use]
pub const fn miri_case_count() -> u32 {
    if cfg!(miri) {
        5
    } else {
        256
    }
}
