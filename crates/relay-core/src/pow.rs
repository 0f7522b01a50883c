//! Proof-of-work admission puzzle.
//!
//! The server hands a client a 32-byte random nonce and a difficulty; the
//! client must find a 64-bit solution such that
//! `SHA-256(nonce || solution_be)` starts with `difficulty` zero bits.
//! Bits are counted from the most significant bit of byte 0.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Size of a challenge nonce in bytes.
pub const NONCE_SIZE: usize = 32;

/// Generate a fresh challenge nonce from the OS CSPRNG.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Check a solution against a nonce and difficulty.
pub fn verify(nonce: &[u8; NONCE_SIZE], solution: u64, difficulty: u8) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(solution.to_be_bytes());
    let digest = hasher.finalize();
    leading_zero_bits(&digest) >= u32::from(difficulty)
}

/// Brute-force a valid solution.
///
/// Walks solutions upward from zero, so the result is the smallest valid
/// one. Used by tests and by clients; the server only verifies.
pub fn solve(nonce: &[u8; NONCE_SIZE], difficulty: u8) -> u64 {
    let mut solution = 0u64;
    loop {
        if verify(nonce, solution, difficulty) {
            return solution;
        }
        solution = solution.wrapping_add(1);
    }
}

fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in digest {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_nonce_zero_solution_known_digest() {
        // SHA-256 of 64 zero bytes begins 0xf5, so solution 0 clears
        // difficulty 0 but not difficulty 8.
        let nonce = [0u8; NONCE_SIZE];
        assert!(verify(&nonce, 0, 0));
        assert!(!verify(&nonce, 0, 8));
    }

    #[test]
    fn solve_finds_verifiable_solution() {
        let nonce = [0u8; NONCE_SIZE];
        let solution = solve(&nonce, 8);
        assert!(verify(&nonce, solution, 8));
        // The digest's first byte must be zero at difficulty 8.
        let mut hasher = Sha256::new();
        hasher.update(nonce);
        hasher.update(solution.to_be_bytes());
        assert_eq!(hasher.finalize()[0], 0);
    }

    #[test]
    fn solve_returns_smallest_solution() {
        let nonce = generate_nonce();
        let solution = solve(&nonce, 4);
        for earlier in 0..solution {
            assert!(!verify(&nonce, earlier, 4));
        }
    }

    #[test]
    fn higher_difficulty_implies_lower() {
        let nonce = generate_nonce();
        let solution = solve(&nonce, 10);
        for d in 0..=10 {
            assert!(verify(&nonce, solution, d));
        }
    }

    #[test]
    fn leading_zero_bit_count() {
        assert_eq!(leading_zero_bits(&[0xff]), 0);
        assert_eq!(leading_zero_bits(&[0x7f]), 1);
        assert_eq!(leading_zero_bits(&[0x01]), 7);
        assert_eq!(leading_zero_bits(&[0x00, 0x80]), 8);
        assert_eq!(leading_zero_bits(&[0x00, 0x00, 0x40]), 17);
        assert_eq!(leading_zero_bits(&[0x00, 0x00]), 16);
    }

    #[test]
    fn nonces_are_distinct() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
