//! Statistical check that validation time does not depend on where a
//! presented secret first differs from the stored one.
//!
//! The absolute numbers are noisy on shared CI hardware, so the
//! assertion is deliberately loose: it catches a first-byte early exit
//! (which skews means by orders of magnitude on longer secrets), not
//! sub-nanosecond effects.

use std::time::Instant;

use connectplugin_core::{TokenKind, TokenStore, Validation};

const TRIALS: usize = 10_000;

fn mean_validation_nanos(store: &TokenStore, owner: &str, presented: &str) -> f64 {
    // Warm up the cache before timing.
    for _ in 0..100 {
        store.validate(owner, presented);
    }
    let start = Instant::now();
    for _ in 0..TRIALS {
        let outcome = store.validate(owner, presented);
        assert_eq!(outcome, Validation::Unknown);
    }
    start.elapsed().as_nanos() as f64 / TRIALS as f64
}

#[test]
fn first_differing_byte_position_does_not_change_runtime() {
    let store = TokenStore::new();
    let token = store
        .issue("kv-00112233", TokenKind::Runtime, chrono::Duration::hours(1))
        .unwrap();
    let secret = token.secret.as_bytes();

    // Differ at the first byte vs. the last byte, same length.
    let mut early = secret.to_vec();
    early[0] ^= 0x01;
    let mut late = secret.to_vec();
    *late.last_mut().unwrap() ^= 0x01;
    let early = String::from_utf8(early).unwrap();
    let late = String::from_utf8(late).unwrap();

    let mean_early = mean_validation_nanos(&store, "kv-00112233", &early);
    let mean_late = mean_validation_nanos(&store, "kv-00112233", &late);

    let ratio = mean_early.max(mean_late) / mean_early.min(mean_late).max(1.0);
    assert!(
        ratio < 3.0,
        "validation time depends on differing-byte position: early={mean_early:.1}ns late={mean_late:.1}ns"
    );
}

#[test]
fn equal_and_unequal_secrets_take_comparable_time() {
    let store = TokenStore::new();
    let token = store
        .issue("kv-00112233", TokenKind::Runtime, chrono::Duration::hours(1))
        .unwrap();

    let mut wrong = token.secret.as_bytes().to_vec();
    wrong[21] ^= 0x01;
    let wrong = String::from_utf8(wrong).unwrap();

    for _ in 0..100 {
        store.validate("kv-00112233", &token.secret);
    }
    let start = Instant::now();
    for _ in 0..TRIALS {
        assert_eq!(
            store.validate("kv-00112233", &token.secret),
            Validation::Valid
        );
    }
    let mean_match = start.elapsed().as_nanos() as f64 / TRIALS as f64;

    let mean_mismatch = mean_validation_nanos(&store, "kv-00112233", &wrong);

    let ratio = mean_match.max(mean_mismatch) / mean_match.min(mean_mismatch).max(1.0);
    assert!(
        ratio < 3.0,
        "match vs mismatch timing diverges: match={mean_match:.1}ns mismatch={mean_mismatch:.1}ns"
    );
}
