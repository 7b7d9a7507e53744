//! Number Theoretic Transform over Z_q[X]/(X^N + 1).
//!
//! Ciphertexts and keys live in the "evaluation" domain: forward NTT maps
//! coefficients to point values, where ring multiplication is element-wise.
//! For the negacyclic ring we use the twisted NTT with a primitive 2N-th
//! root of unity ψ.
//!
//! Only the coefficient domain is touched at the edges: encoding the
//! message, digit decomposition during relinearization, and reading the
//! constant term at decryption.

use std::sync::OnceLock;

use super::params::{N, Q};

// ═══════════════════════════════════════════════════════════════════════
// Root of unity for Q
// ═══════════════════════════════════════════════════════════════════════

/// Primitive 2N-th root of unity modulo [`Q`]: ψ = 7^((q-1)/(2N)).
/// Satisfies ψ^N ≡ -1 (mod q) and ψ^(2N) ≡ 1 (mod q).
pub const PSI: i64 = 3710688476054411196;

// ═══════════════════════════════════════════════════════════════════════
// Modular arithmetic helpers
// ═══════════════════════════════════════════════════════════════════════

/// Modular multiplication with an i128 intermediate. Inputs in [0, modulus).
#[inline]
pub fn mod_mul(a: i64, b: i64, modulus: i64) -> i64 {
    (a as i128 * b as i128 % modulus as i128) as i64
}

/// Modular exponentiation: base^exp mod modulus.
pub fn mod_pow(base: i64, mut exp: u64, modulus: i64) -> i64 {
    let mut result = 1i64 % modulus;
    let mut b = base.rem_euclid(modulus);
    while exp > 0 {
        if exp & 1 == 1 {
            result = mod_mul(result, b, modulus);
        }
        exp >>= 1;
        b = mod_mul(b, b, modulus);
    }
    result
}

/// Modular inverse via Fermat's little theorem: a^(-1) = a^(p-2) mod p.
/// Only valid when p is prime and a ≢ 0 (mod p).
pub fn mod_inv(a: i64, p: i64) -> i64 {
    mod_pow(a, (p - 2) as u64, p)
}

/// Search for a primitive 2N-th root of unity modulo q.
///
/// Returns `None` when q is not ≡ 1 (mod 2N) or no small generator works.
#[cfg(test)]
pub fn find_primitive_root(q: i64) -> Option<i64> {
    let two_n = (2 * N) as i64;
    if (q - 1) % two_n != 0 {
        return None;
    }
    let exp = ((q - 1) / two_n) as u64;
    (2..1000).map(|g| mod_pow(g, exp, q)).find(|&psi| mod_pow(psi, N as u64, q) == q - 1)
}

/// Deterministic Miller-Rabin for 64-bit inputs.
#[cfg(test)]
pub fn is_prime(n: i64) -> bool {
    if n < 2 {
        return false;
    }
    const WITNESSES: [i64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
    for &p in &WITNESSES {
        if n % p == 0 {
            return n == p;
        }
    }
    let mut d = n - 1;
    let mut r = 0;
    while d % 2 == 0 {
        d /= 2;
        r += 1;
    }
    'witness: for &a in &WITNESSES {
        let mut x = mod_pow(a, d as u64, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..r {
            x = mod_mul(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

// ═══════════════════════════════════════════════════════════════════════
// NTT: Forward and Inverse
// ═══════════════════════════════════════════════════════════════════════

/// Precomputed NTT tables for one prime.
#[derive(Clone, Debug)]
pub struct NttContext {
    /// The NTT-friendly prime.
    pub q: i64,
    /// Primitive 2N-th root of unity (ψ).
    pub psi: i64,
    /// Inverse of N mod q (for inverse NTT scaling).
    pub n_inv: i64,
    /// Powers of ψ for the twist.
    psi_powers: Vec<i64>,
    /// Powers of ψ^(-1), pre-multiplied by N^(-1), for the inverse twist.
    psi_inv_powers_scaled: Vec<i64>,
    /// Per-stage roots ω_len = ψ^(2N/len), indexed by log2(len).
    stage_roots: Vec<i64>,
    stage_roots_inv: Vec<i64>,
}

impl NttContext {
    /// Build the tables for prime `q` with primitive 2N-th root `psi`.
    pub fn new(q: i64, psi: i64) -> Self {
        let psi_inv = mod_inv(psi, q);
        let n_inv = mod_inv(N as i64, q);

        let psi_powers = precompute_powers(psi, q);
        let psi_inv_powers_scaled = precompute_powers(psi_inv, q)
            .into_iter()
            .map(|p| mod_mul(p, n_inv, q))
            .collect();

        let log_n = N.trailing_zeros() as usize;
        let mut stage_roots = vec![1i64; log_n + 1];
        let mut stage_roots_inv = vec![1i64; log_n + 1];
        for s in 1..=log_n {
            let len = 1usize << s;
            stage_roots[s] = mod_pow(psi, (2 * N / len) as u64, q);
            stage_roots_inv[s] = mod_pow(psi_inv, (2 * N / len) as u64, q);
        }

        Self {
            q,
            psi,
            n_inv,
            psi_powers,
            psi_inv_powers_scaled,
            stage_roots,
            stage_roots_inv,
        }
    }

    /// Forward NTT: coefficient → evaluation domain.
    ///
    /// Input: N coefficients in any i64 range (reduced here).
    /// Output: N evaluation points in [0, q).
    pub fn forward(&self, a: &[i64]) -> Vec<i64> {
        debug_assert_eq!(a.len(), N);
        let q = self.q;
        let mut data: Vec<i64> = a
            .iter()
            .zip(&self.psi_powers)
            .map(|(&c, &pw)| mod_mul(c.rem_euclid(q), pw, q))
            .collect();
        self.butterflies(&mut data, &self.stage_roots);
        data
    }

    /// Inverse NTT: evaluation → coefficient domain, output in [0, q).
    pub fn inverse(&self, a: &[i64]) -> Vec<i64> {
        debug_assert_eq!(a.len(), N);
        let q = self.q;
        let mut data = a.to_vec();
        self.butterflies(&mut data, &self.stage_roots_inv);
        for (v, &pw) in data.iter_mut().zip(&self.psi_inv_powers_scaled) {
            *v = mod_mul(*v, pw, q);
        }
        data
    }

    /// Iterative radix-2 Cooley-Tukey over bit-reversed input.
    fn butterflies(&self, data: &mut [i64], roots: &[i64]) {
        let q = self.q;
        bit_reverse_permutation(data);

        let mut stage = 1;
        let mut len = 2;
        while len <= N {
            let half = len / 2;
            let w = roots[stage];
            let mut j = 0;
            while j < N {
                let mut wk = 1i64;
                for k in 0..half {
                    let u = data[j + k];
                    let v = mod_mul(data[j + k + half], wk, q);
                    let sum = u + v;
                    data[j + k] = if sum >= q { sum - q } else { sum };
                    let diff = u - v;
                    data[j + k + half] = if diff < 0 { diff + q } else { diff };
                    wk = mod_mul(wk, w, q);
                }
                j += len;
            }
            len <<= 1;
            stage += 1;
        }
    }

    /// Reduce a value in [0, q) to the centered range (-q/2, q/2].
    pub fn center(&self, v: i64) -> i64 {
        if v > self.q / 2 {
            v - self.q
        } else {
            v
        }
    }
}

/// Shared tables for [`Q`], built on first use.
pub fn ntt_context() -> &'static NttContext {
    static CTX: OnceLock<NttContext> = OnceLock::new();
    CTX.get_or_init(|| NttContext::new(Q, PSI))
}

// ═══════════════════════════════════════════════════════════════════════
// Internal helpers
// ═══════════════════════════════════════════════════════════════════════

fn precompute_powers(root: i64, q: i64) -> Vec<i64> {
    let mut powers = vec![1i64; N];
    for i in 1..N {
        powers[i] = mod_mul(powers[i - 1], root, q);
    }
    powers
}

fn bit_reverse_permutation(data: &mut [i64]) {
    let n = data.len();
    let log_n = n.trailing_zeros();
    for i in 0..n {
        let j = (i as u32).reverse_bits() >> (32 - log_n);
        let j = j as usize;
        if i < j {
            data.swap(i, j);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════
