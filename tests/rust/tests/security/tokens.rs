//! Bearer secret lifecycle properties.

use connectplugin_core::{TokenKind, TokenStore, Validation};
use pretty_assertions::assert_eq;

#[test]
fn back_to_back_tokens_differ() {
    let store = TokenStore::new();
    let mut secrets = std::collections::HashSet::new();
    for i in 0..64 {
        let token = store
            .issue(&format!("owner-{i}"), TokenKind::Runtime, chrono::Duration::hours(1))
            .unwrap();
        assert!(secrets.insert(token.secret.to_string()), "secret repeated");
    }
}

#[test]
fn no_token_is_zero_valued() {
    let store = TokenStore::new();
    for i in 0..32 {
        let token = store
            .issue(&format!("owner-{i}"), TokenKind::Runtime, chrono::Duration::hours(1))
            .unwrap();
        let zeros = "A".repeat(43) + "=";
        assert_ne!(*token.secret, zeros);
        assert!(token.secret.bytes().any(|b| b != b'A'));
    }
}

#[test]
fn secrets_of_one_kind_share_length() {
    let store = TokenStore::new();
    let lengths: std::collections::HashSet<usize> = (0..16)
        .map(|i| {
            store
                .issue(&format!("o-{i}"), TokenKind::Runtime, chrono::Duration::hours(1))
                .unwrap()
                .secret
                .len()
        })
        .collect();
    assert_eq!(lengths.len(), 1);
    assert!(lengths.contains(&44));
}

#[test]
fn accepted_then_rejected_after_expiry() {
    let store = TokenStore::new();
    let token = store
        .issue("kv-00112233", TokenKind::Runtime, chrono::Duration::milliseconds(50))
        .unwrap();
    assert_eq!(store.validate("kv-00112233", &token.secret), Validation::Valid);

    std::thread::sleep(std::time::Duration::from_millis(80));

    // First post-expiry access removes the record.
    assert_eq!(
        store.validate("kv-00112233", &token.secret),
        Validation::Expired
    );
    assert!(store.is_empty());

    // Every later access is indistinguishable from an unknown owner.
    assert_eq!(
        store.validate("kv-00112233", &token.secret),
        Validation::Unknown
    );
}

#[test]
fn validation_outcomes_do_not_leak_which_failure() {
    let store = TokenStore::new();
    let token = store
        .issue("kv-00112233", TokenKind::Runtime, chrono::Duration::hours(1))
        .unwrap();

    // Wrong secret of the right length and a kind mismatch both collapse
    // to the same signal.
    let mut wrong = token.secret.as_bytes().to_vec();
    wrong[10] ^= 0xff;
    let wrong = String::from_utf8(wrong).unwrap();
    let a = store.validate("kv-00112233", &wrong);
    let b = store.validate_kind("kv-00112233", &token.secret, Some(TokenKind::CapabilityGrant));
    let c = store.validate("missing-owner", &token.secret);
    assert_eq!(a, Validation::Unknown);
    assert_eq!(b, Validation::Unknown);
    assert_eq!(c, Validation::Unknown);
}
