//! Property tests for the format invariants.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use crate::hash::{bucket, round_u32};
use crate::layout::{place, record_size, NUM_BUCKETS, PAGE_SIZE, RECORD_UNIT};
use crate::mapped::MappedFile;

proptest! {
    #[test]
    fn round_up_is_minimal_multiple(x in 0u32..1 << 20, shift in 0u32..12) {
        let unit = 1u32 << shift;
        let r = round_u32(x, unit);
        prop_assert_eq!(r % unit, 0);
        prop_assert!(r >= x);
        prop_assert!(r - x < unit);
    }

    #[test]
    fn buckets_stay_in_range(name in proptest::collection::vec(any::<u8>(), 0..300)) {
        prop_assert!(bucket(&name) < NUM_BUCKETS);
    }

    #[test]
    fn placement_is_aligned_and_page_local(
        hdr_len in (1u32..18).prop_map(|i| i * 32),
        limit in 0u32..1 << 20,
        name_len in 1u32..=256,
    ) {
        let (start, end) = place(hdr_len, limit, name_len);

        // Records are 32-byte aligned and exactly record_size long.
        prop_assert_eq!(start % RECORD_UNIT, 0);
        prop_assert_eq!(end - start, record_size(name_len));

        // No record straddles a page: first and last byte share a page.
        prop_assert_eq!(start / PAGE_SIZE, (end - 1) / PAGE_SIZE);

        // Placement never goes backwards from the limit.
        prop_assert!(start >= limit);

        // The first record of a file lands after the bucket table.
        if limit == 0 {
            prop_assert!(start >= hdr_len + 4 + 4 * NUM_BUCKETS);
        }
    }
}

proptest! {
    // File-backed cases are slower; keep the case count moderate.
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn increments_round_trip_through_file(
        entries in proptest::collection::btree_map("[a-z/][a-z0-9/:-]{0,40}", 1u64..1000, 1..40)
    ) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("prop.v1.count");
        let entries: BTreeMap<String, u64> = entries;

        let mut m = MappedFile::open(&path, "Program: prop\n\n", None).unwrap();
        for (name, n) in &entries {
            let (m2, off) = MappedFile::new_counter(&m, name).unwrap();
            m2.value_at(off).fetch_add(*n, Ordering::Relaxed);
            m = m2;
        }
        drop(m);

        // Close, reopen, and look every name up again.
        let m = MappedFile::open(&path, "Program: prop\n\n", None).unwrap();
        for (name, n) in &entries {
            let (m2, off) = MappedFile::new_counter(&m, name).unwrap();
            prop_assert_eq!(m2.value_at(off).load(Ordering::Relaxed), *n);
        }

        // And the parser agrees.
        let parsed = crate::parse::parse_file(&path).unwrap();
        prop_assert_eq!(parsed.counts, entries);
    }
}
