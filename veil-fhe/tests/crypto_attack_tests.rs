//! Cryptographic layer attack tests.
//!
//! Attempts ciphertext manipulation, splicing, replay across key epochs,
//! malformed encodings and wrong-key decryption against the dot-product
//! circuit. Every attack must be refused with a typed error, never turned
//! into a plausible score.

use rand::rngs::StdRng;
use rand::SeedableRng;
use veil_fhe::ckks::ciphertext::{decrypt_score, encrypt, MAX_CIPHERTEXT_BYTES};
use veil_fhe::ckks::keys::keygen;
use veil_fhe::ckks::params::{N, Q};
use veil_fhe::ckks::poly::NttPoly;
use veil_fhe::{Ciphertext, CircuitShape, CompiledCircuit, FheError, ScoreCiphertext};

fn test_rng() -> StdRng {
    StdRng::seed_from_u64(42)
}

fn shape() -> CircuitShape {
    CircuitShape::new(4, 4)
}

// ═══════════════════════════════════════════════════════════════════════
// 1. CIPHERTEXT MANIPULATION
// ═══════════════════════════════════════════════════════════════════════

/// Attack: flip one evaluation point of a chunk ciphertext.
#[test]
fn attack_bit_flip_is_rejected_before_evaluation() {
    let mut rng = test_rng();
    let (keys, _) = keygen(&mut rng).unwrap();
    let circuit = CompiledCircuit::compile(shape()).unwrap();
    let q = encrypt(&[1, 2, 3, 4], shape(), &keys, &mut rng);
    let mut c = encrypt(&[4, 3, 2, 1], shape(), &keys, &mut rng);
    c.slots[0].0.values[0] ^= 0x7FFF;

    let err = circuit.evaluate(&keys, &q, &c).unwrap_err();
    assert!(matches!(err, FheError::Evaluation(_)), "got {:?}", err);
}

/// Attack: zero out a slot and recompute nothing.
#[test]
fn attack_zeroed_slot_is_rejected() {
    let mut rng = test_rng();
    let (keys, _) = keygen(&mut rng).unwrap();
    let circuit = CompiledCircuit::compile(shape()).unwrap();
    let q = encrypt(&[1, 2, 3, 4], shape(), &keys, &mut rng);
    let mut c = encrypt(&[4, 3, 2, 1], shape(), &keys, &mut rng);
    c.slots[2] = (NttPoly::zero(), NttPoly::zero());
    assert!(circuit.evaluate(&keys, &q, &c).is_err());
}

/// Attack: splice a slot from another ciphertext of the same epoch.
#[test]
fn attack_slot_splicing_is_rejected() {
    let mut rng = test_rng();
    let (keys, _) = keygen(&mut rng).unwrap();
    let circuit = CompiledCircuit::compile(shape()).unwrap();
    let a = encrypt(&[1, 1, 1, 1], shape(), &keys, &mut rng);
    let b = encrypt(&[7, 7, 7, 7], shape(), &keys, &mut rng);
    let mut spliced = a.clone();
    spliced.slots[1] = b.slots[1].clone();
    assert!(matches!(
        circuit.evaluate(&keys, &a, &spliced),
        Err(FheError::Evaluation(_))
    ));
}

/// Attack: non-canonical residues (≥ q) smuggled into a slot with a fresh tag
/// would still be caught by the well-formedness check.
#[test]
fn attack_non_canonical_values_fail_integrity() {
    let mut rng = test_rng();
    let (keys, _) = keygen(&mut rng).unwrap();
    let mut c = encrypt(&[1, 1, 1, 1], shape(), &keys, &mut rng);
    c.slots[0].1.values[5] = Q + 3;
    assert!(!c.verify_integrity());
}

/// Attack: relabel the shape to make the circuit read past the slots.
#[test]
fn attack_shape_relabel_is_rejected() {
    let mut rng = test_rng();
    let (keys, _) = keygen(&mut rng).unwrap();
    let circuit = CompiledCircuit::compile(CircuitShape::new(8, 4)).unwrap();
    let mut c = encrypt(&[1, 1, 1, 1], shape(), &keys, &mut rng);
    c.shape = CircuitShape::new(8, 4);
    let q = c.clone();
    assert!(matches!(
        circuit.evaluate(&keys, &q, &c),
        Err(FheError::Evaluation(_))
    ));
}

// ═══════════════════════════════════════════════════════════════════════
// 2. CROSS-EPOCH REPLAY
// ═══════════════════════════════════════════════════════════════════════

/// Attack: relabel a ciphertext from an old epoch with the current key id.
/// The tag covers the key id, so relabelling breaks integrity.
#[test]
fn attack_key_id_relabel_is_rejected() {
    let mut rng = test_rng();
    let (current, _) = keygen(&mut rng).unwrap();
    let (old, _) = keygen(&mut rng).unwrap();
    let circuit = CompiledCircuit::compile(shape()).unwrap();
    let q = encrypt(&[1, 1, 1, 1], shape(), &current, &mut rng);
    let mut stale = encrypt(&[1, 1, 1, 1], shape(), &old, &mut rng);
    stale.key_id = current.key_id;
    assert!(matches!(
        circuit.evaluate(&current, &q, &stale),
        Err(FheError::Evaluation(_))
    ));
}

/// Attack: decrypt a genuine score with a different secret key.
#[test]
fn attack_wrong_secret_yields_no_score() {
    let mut rng = test_rng();
    let (keys, _) = keygen(&mut rng).unwrap();
    let (_, attacker) = keygen(&mut rng).unwrap();
    let circuit = CompiledCircuit::compile(shape()).unwrap();
    let a = encrypt(&[3, 3, 3, 3], shape(), &keys, &mut rng);
    let score = circuit.evaluate(&keys, &a, &a).unwrap();
    assert!(matches!(
        decrypt_score(&score, &attacker, circuit.max_abs_score),
        Err(FheError::Decryption(_))
    ));
}

// ═══════════════════════════════════════════════════════════════════════
// 3. MALFORMED ENCODINGS
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn attack_truncated_blob_is_rejected() {
    let mut rng = test_rng();
    let (keys, _) = keygen(&mut rng).unwrap();
    let bytes = encrypt(&[1, 2, 3, 4], shape(), &keys, &mut rng)
        .to_bytes()
        .unwrap();
    let cut = &bytes[..bytes.len() / 2];
    assert!(matches!(Ciphertext::from_bytes(cut), Err(FheError::Decryption(_))));
}

#[test]
fn attack_oversized_length_prefix_is_rejected() {
    // A slot vector claiming 2^40 entries must hit the size limit, not allocate.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&4u64.to_le_bytes()); // shape.dim
    bytes.push(4); // shape.bits
    bytes.extend_from_slice(&(1u64 << 40).to_le_bytes()); // slots.len()
    bytes.extend_from_slice(&[0u8; 64]);
    assert!(Ciphertext::from_bytes(&bytes).is_err());
    assert!(MAX_CIPHERTEXT_BYTES > 2 * 8 * N as u64);
}

#[test]
fn attack_trailing_bytes_are_rejected() {
    let mut rng = test_rng();
    let (keys, _) = keygen(&mut rng).unwrap();
    let circuit = CompiledCircuit::compile(shape()).unwrap();
    let a = encrypt(&[1, 2, 3, 4], shape(), &keys, &mut rng);
    let mut bytes = circuit.evaluate(&keys, &a, &a).unwrap().to_bytes().unwrap();
    bytes.push(0);
    assert!(ScoreCiphertext::from_bytes(&bytes).is_err());
}
