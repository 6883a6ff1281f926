//! Shamir secret sharing over GF(256)
//!
//! Each secret byte gets its own random polynomial of degree `t - 1` whose
//! constant term is the byte. Share `x` (1..=255) holds the evaluations at
//! `x`; any `t` distinct shares recover the constant terms through Lagrange
//! interpolation at zero. Fewer than `t` shares are consistent with every
//! possible secret.
//!
//! Field arithmetic uses the AES reduction polynomial and avoids lookup
//! tables so that timing does not depend on share values.

use rand::RngCore;
use zeroize::Zeroize;

/// Field arithmetic in GF(2^8) modulo x^8 + x^4 + x^3 + x + 1.
mod field {
    #[inline]
    pub fn add(a: u8, b: u8) -> u8 {
        a ^ b
    }

    pub fn mul(mut a: u8, mut b: u8) -> u8 {
        let mut product = 0u8;
        for _ in 0..8 {
            // mask is 0xFF when the low bit of b is set, 0x00 otherwise
            let mask = 0u8.wrapping_sub(b & 1);
            product ^= a & mask;
            let carry = 0u8.wrapping_sub(a >> 7);
            a = (a << 1) ^ (0x1b & carry);
            b >>= 1;
        }
        product
    }

    /// Multiplicative inverse via a^254. `inv(0)` is 0 and never used.
    pub fn inv(a: u8) -> u8 {
        let mut result = 1u8;
        let mut base = a;
        let mut exp = 254u8;
        while exp > 0 {
            if exp & 1 == 1 {
                result = mul(result, base);
            }
            base = mul(base, base);
            exp >>= 1;
        }
        result
    }

    pub fn div(a: u8, b: u8) -> u8 {
        mul(a, inv(b))
    }

    /// Horner evaluation of `coefficients` (constant term first) at `x`.
    pub fn eval(coefficients: &[u8], x: u8) -> u8 {
        coefficients
            .iter()
            .rev()
            .fold(0u8, |acc, &c| add(mul(acc, x), c))
    }
}

/// Split `secret` into `total` shares indexed 1..=total, any `threshold` of
/// which reconstruct it. Callers validate `1 <= threshold <= total <= 255`.
pub fn split(secret: &[u8], threshold: u8, total: u8) -> Vec<(u8, Vec<u8>)> {
    let mut rng = rand::rng();
    let mut shares: Vec<(u8, Vec<u8>)> = (1..=total)
        .map(|x| (x, Vec::with_capacity(secret.len())))
        .collect();

    let mut coefficients = vec![0u8; threshold as usize];
    for &byte in secret {
        coefficients[0] = byte;
        rng.fill_bytes(&mut coefficients[1..]);
        for (x, share) in shares.iter_mut() {
            share.push(field::eval(&coefficients, *x));
        }
    }
    coefficients.zeroize();

    shares
}

/// Interpolate the secret from `(x, share)` pairs. The caller guarantees
/// distinct non-zero `x` values and equal share lengths.
pub fn combine(shares: &[(u8, &[u8])]) -> Vec<u8> {
    let len = shares.first().map(|(_, s)| s.len()).unwrap_or(0);

    // Lagrange basis at zero: l_i(0) = prod_{j != i} x_j / (x_j - x_i)
    let basis: Vec<u8> = shares
        .iter()
        .enumerate()
        .map(|(i, (xi, _))| {
            shares
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .fold(1u8, |acc, (_, (xj, _))| {
                    field::mul(acc, field::div(*xj, field::add(*xj, *xi)))
                })
        })
        .collect();

    (0..len)
        .map(|pos| {
            shares
                .iter()
                .zip(&basis)
                .fold(0u8, |acc, ((_, share), l)| {
                    field::add(acc, field::mul(share[pos], *l))
                })
        })
        .collect()
}
