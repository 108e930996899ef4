//! Identifier generation for devices, pairing secrets, sessions and messages.
//!
//! Everything here draws from the OS CSPRNG. Nothing is checked for
//! uniqueness; ids are scoped to a session, not global.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

use crate::time::now_millis;

/// Number of words in a pairing passphrase.
pub const PASSPHRASE_WORDS: usize = 6;

/// Separator placed between passphrase words.
pub const PASSPHRASE_SEPARATOR: &str = "-";

/// Word list for pairing passphrases. 64 entries, so each word is 6 bits.
pub const WORD_LIST: [&str; 64] = [
    "apple", "banana", "cherry", "dragon", "eagle", "falcon", "grape", "honey", "island", "jungle",
    "koala", "lemon", "mango", "nectar", "orange", "pearl", "quartz", "river", "sunset", "tiger",
    "umbrella", "violet", "walnut", "xenon", "yellow", "zebra", "anchor", "bridge", "castle",
    "dolphin", "ember", "frost", "garden", "harbor", "igloo", "jasper", "kite", "lotus", "meadow",
    "north", "ocean", "piano", "quest", "rainbow", "silver", "thunder", "unity", "valley",
    "wonder", "crystal", "blaze", "cloud", "dawn", "echo", "flame", "glow", "haven", "ivory",
    "jade", "karma", "lunar", "mystic", "nova", "oasis",
];

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

/// 16 random bytes, hex-encoded (32 chars).
pub fn new_device_id() -> String {
    random_hex(16)
}

/// 32 random bytes, hex-encoded (64 chars).
///
/// Handed only to the desktop that owns a session; presenting it back is
/// what lets a reconnecting desktop reclaim its id.
pub fn new_device_secret() -> String {
    random_hex(32)
}

/// 8 random bytes, hex-encoded (16 chars). Correlation/logging only.
pub fn new_message_id() -> String {
    random_hex(8)
}

/// Six words sampled with replacement from [`WORD_LIST`], joined by `-`.
///
/// 36 bits of entropy: fine for a short pairing window, too weak for a
/// long-lived bearer credential.
pub fn new_pairing_passphrase() -> String {
    let mut rng = OsRng;
    (0..PASSPHRASE_WORDS)
        .map(|_| WORD_LIST[rng.gen_range(0..WORD_LIST.len())])
        .collect::<Vec<_>>()
        .join(PASSPHRASE_SEPARATOR)
}

/// Zero-padded 6-digit display code. Not used for validation anywhere.
pub fn new_pairing_code() -> String {
    format!("{:06}", OsRng.gen_range(0..1_000_000u32))
}

/// Mint a session token for a newly paired subscriber.
///
/// The current time is mixed in, so the token cannot be re-derived later.
/// Callers must store it; it is an opaque bearer value.
pub fn new_session_token(controller_id: &str, subscriber_id: &str, passphrase: &str) -> String {
    session_token_at(controller_id, subscriber_id, passphrase, now_millis())
}

fn session_token_at(
    controller_id: &str,
    subscriber_id: &str,
    passphrase: &str,
    millis: i64,
) -> String {
    let data = format!("{controller_id}:{subscriber_id}:{passphrase}:{millis}");
    hex_encode(&Sha256::digest(data.as_bytes()))
}

/// Shape check only: 64 lowercase hex chars.
pub fn is_valid_session_token(token: &str) -> bool {
    token.len() == 64
        && token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_lower_hex(s: &str) -> bool {
        s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    #[test]
    fn device_id_is_32_hex_chars() {
        let id = new_device_id();
        assert_eq!(id.len(), 32);
        assert!(is_lower_hex(&id));
    }

    #[test]
    fn device_ids_differ() {
        assert_ne!(new_device_id(), new_device_id());
    }

    #[test]
    fn device_secret_is_64_hex_chars_and_unique() {
        let secret = new_device_secret();
        assert_eq!(secret.len(), 64);
        assert!(is_lower_hex(&secret));
        assert_ne!(secret, new_device_secret());
    }

    #[test]
    fn message_id_is_16_hex_chars() {
        let id = new_message_id();
        assert_eq!(id.len(), 16);
        assert!(is_lower_hex(&id));
    }

    #[test]
    fn passphrase_has_six_known_words() {
        let phrase = new_pairing_passphrase();
        let words: Vec<&str> = phrase.split(PASSPHRASE_SEPARATOR).collect();
        assert_eq!(words.len(), PASSPHRASE_WORDS);
        for word in words {
            assert!(WORD_LIST.contains(&word), "unexpected word {word}");
        }
    }

    #[test]
    fn word_list_has_no_duplicates() {
        let mut sorted = WORD_LIST.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), WORD_LIST.len());
    }

    #[test]
    fn word_list_has_no_separator() {
        assert!(WORD_LIST.iter().all(|w| !w.contains(PASSPHRASE_SEPARATOR)));
    }

    #[test]
    fn pairing_code_is_six_digits() {
        for _ in 0..100 {
            let code = new_pairing_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn session_token_matches_sha256_of_inputs() {
        let token = session_token_at("desk", "phone", "apple-banana", 42);
        let expected = hex_encode(&Sha256::digest(b"desk:phone:apple-banana:42"));
        assert_eq!(token, expected);
        assert!(is_valid_session_token(&token));
    }

    #[test]
    fn session_token_depends_on_time() {
        let a = session_token_at("desk", "phone", "apple", 1);
        let b = session_token_at("desk", "phone", "apple", 2);
        assert_ne!(a, b);
    }

    #[test]
    fn new_session_token_is_valid_shape() {
        let token = new_session_token(&new_device_id(), &new_device_id(), "apple");
        assert!(is_valid_session_token(&token));
    }

    #[test]
    fn token_shape_check_rejects_bad_input() {
        assert!(!is_valid_session_token(""));
        assert!(!is_valid_session_token(&"a".repeat(63)));
        assert!(!is_valid_session_token(&"A".repeat(64)));
        assert!(!is_valid_session_token(&"g".repeat(64)));
        assert!(is_valid_session_token(&"0f".repeat(32)));
    }
}
