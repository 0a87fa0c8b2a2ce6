//! NIST SP 800-38G FF1 over any [`BlockCipher`].
//!
//! Only meant to drive the ciphers of this workspace end to end with the
//! published NIST samples: numeral strings are limited to radix 36 and to
//! lengths for which `radix^ceil(n/2)` fits in 120 bits, so the arithmetic
//! stays within `u128`.

use crate::{AES_BLOCK_SIZE, BlockCipher, CResult, CipherResultHelper, cipher_bail, cipher_ensure};

/// Numerals of radix up to 36
pub const ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

const ROUNDS: u8 = 10;
const MAX_MODULUS: u128 = 1 << 120;

pub struct Ff1<'a> {
    cipher: &'a dyn BlockCipher,
    radix: u32,
}

impl<'a> Ff1<'a> {
    pub fn new(cipher: &'a dyn BlockCipher, radix: u32) -> CResult<Self> {
        cipher_ensure!(
            (2..=36).contains(&radix),
            "FF1: unsupported radix {}",
            radix
        );
        cipher_ensure!(
            cipher.block_size() == AES_BLOCK_SIZE,
            "FF1: a {} bytes block cipher is required",
            AES_BLOCK_SIZE
        );
        Ok(Self { cipher, radix })
    }

    pub fn encrypt(&self, numerals: &str, tweak: &[u8]) -> CResult<String> {
        self.transform(numerals, tweak, true)
    }

    pub fn decrypt(&self, numerals: &str, tweak: &[u8]) -> CResult<String> {
        self.transform(numerals, tweak, false)
    }

    fn to_digits(&self, numerals: &str) -> CResult<Vec<u32>> {
        numerals
            .chars()
            .map(|c| match c.to_digit(36) {
                Some(d) if d < self.radix && !c.is_ascii_uppercase() => Ok(d),
                _ => cipher_bail!("FF1: '{}' is not a numeral of radix {}", c, self.radix),
            })
            .collect()
    }

    fn to_numerals(digits: &[u32]) -> String {
        digits
            .iter()
            .filter_map(|d| ALPHABET.chars().nth(usize::try_from(*d).ok()?))
            .collect()
    }

    fn num(&self, digits: &[u32]) -> u128 {
        digits
            .iter()
            .fold(0, |acc, d| acc * u128::from(self.radix) + u128::from(*d))
    }

    fn str_m(&self, mut x: u128, m: usize) -> CResult<Vec<u32>> {
        let radix = u128::from(self.radix);
        let mut digits = vec![0; m];
        for digit in digits.iter_mut().rev() {
            *digit = u32::try_from(x % radix)?;
            x /= radix;
        }
        Ok(digits)
    }

    fn pow(&self, exp: usize) -> CResult<u128> {
        let modulus = u128::from(self.radix)
            .checked_pow(u32::try_from(exp)?)
            .filter(|m| *m < MAX_MODULUS);
        match modulus {
            Some(m) => Ok(m),
            None => cipher_bail!("FF1: numeral string too long for radix {}", self.radix),
        }
    }

    /// CBC-MAC with a zero IV; `data` is a whole number of blocks.
    fn prf(&self, data: &[u8]) -> CResult<[u8; AES_BLOCK_SIZE]> {
        let mut y = [0_u8; AES_BLOCK_SIZE];
        for chunk in data.chunks(AES_BLOCK_SIZE) {
            for (acc, x) in y.iter_mut().zip(chunk) {
                *acc ^= x;
            }
            self.cipher.encrypt_in_place(&mut y)?;
        }
        Ok(y)
    }

    fn transform(&self, numerals: &str, tweak: &[u8], encrypt: bool) -> CResult<String> {
        let digits = self.to_digits(numerals)?;
        let n = digits.len();
        cipher_ensure!(n >= 2, "FF1: at least 2 numerals are required");
        let u = n / 2;
        let v = n - u;
        let modulus_u = self.pow(u)?;
        let modulus_v = self.pow(v)?;

        // byte length of NUM(B) and of the pseudo random output
        let bits = 128 - usize::try_from((modulus_v - 1).leading_zeros())?;
        let b = bits.div_ceil(8);
        let d = 4 * b.div_ceil(4) + 4;

        let mut p = vec![1, 2, 1];
        p.extend_from_slice(&self.radix.to_be_bytes()[1..]);
        p.push(ROUNDS);
        p.push(u8::try_from(u % 256)?);
        p.extend_from_slice(
            &u32::try_from(n)
                .context("FF1: numeral string too long")?
                .to_be_bytes(),
        );
        p.extend_from_slice(
            &u32::try_from(tweak.len())
                .context("FF1: tweak too long")?
                .to_be_bytes(),
        );

        let padding = (AES_BLOCK_SIZE - (tweak.len() + b + 1) % AES_BLOCK_SIZE) % AES_BLOCK_SIZE;
        let (mut a, mut bb) = (digits[..u].to_vec(), digits[u..].to_vec());

        for round in 0..ROUNDS {
            let i = if encrypt { round } else { ROUNDS - 1 - round };
            let source = if encrypt { &bb } else { &a };

            let mut q = tweak.to_vec();
            q.resize(tweak.len() + padding, 0);
            q.push(i);
            q.extend_from_slice(&self.num(source).to_be_bytes()[AES_BLOCK_SIZE - b..]);

            let mut message = p.clone();
            message.extend_from_slice(&q);
            let r = self.prf(&message)?;

            let mut s = r.to_vec();
            let mut j: u128 = 1;
            while s.len() < d {
                let mut block = r;
                for (x, k) in block.iter_mut().zip(j.to_be_bytes()) {
                    *x ^= k;
                }
                self.cipher.encrypt_in_place(&mut block)?;
                s.extend_from_slice(&block);
                j += 1;
            }

            let (m, modulus) = if i % 2 == 0 {
                (u, modulus_u)
            } else {
                (v, modulus_v)
            };
            let y = s[..d]
                .iter()
                .fold(0_u128, |acc, byte| (acc * 256 + u128::from(*byte)) % modulus);

            if encrypt {
                let c = (self.num(&a) + y) % modulus;
                a = std::mem::replace(&mut bb, self.str_m(c, m)?);
            } else {
                let c = (self.num(&bb) + modulus - y) % modulus;
                bb = std::mem::replace(&mut a, self.str_m(c, m)?);
            }
        }

        a.extend_from_slice(&bb);
        Ok(Self::to_numerals(&a))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::Ff1;
    use crate::{CipherError, ScheduleStrategy, SoftwareAesCipher};

    const KEY_128: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const KEY_192: &str = "2b7e151628aed2a6abf7158809cf4f3cef4359d8d580aa4f";
    const KEY_256: &str = "2b7e151628aed2a6abf7158809cf4f3cef4359d8d580aa4f7f036d6f04fc6a94";

    /// NIST SP 800-38G samples: (key, radix, tweak, plaintext, ciphertext)
    const SAMPLES: [(&str, u32, &str, &str, &str); 9] = [
        (KEY_128, 10, "", "0123456789", "2433477484"),
        (
            KEY_128,
            10,
            "39383736353433323130",
            "0123456789",
            "6124200773",
        ),
        (
            KEY_128,
            36,
            "3737373770717273373737",
            "0123456789abcdefghi",
            "a9tv40mll9kdu509eum",
        ),
        (KEY_192, 10, "", "0123456789", "2830668132"),
        (
            KEY_192,
            10,
            "39383736353433323130",
            "0123456789",
            "2496655549",
        ),
        (
            KEY_192,
            36,
            "3737373770717273373737",
            "0123456789abcdefghi",
            "xbj3kv35jrawxv32ysr",
        ),
        (KEY_256, 10, "", "0123456789", "6657667009"),
        (
            KEY_256,
            10,
            "39383736353433323130",
            "0123456789",
            "1001623463",
        ),
        (
            KEY_256,
            36,
            "3737373770717273373737",
            "0123456789abcdefghi",
            "xs8a0azh2avyalyzuwd",
        ),
    ];

    fn strategies() -> Vec<ScheduleStrategy> {
        let mut strategies = vec![ScheduleStrategy::generic()];
        strategies.extend(ScheduleStrategy::accelerated());
        strategies
    }

    #[test]
    fn nist_samples() {
        for strategy in strategies() {
            for (key, radix, tweak, plaintext, ciphertext) in SAMPLES {
                let mut cipher =
                    SoftwareAesCipher::with_strategy(&hex::decode(key).unwrap(), strategy)
                        .unwrap();
                let tweak = hex::decode(tweak).unwrap();
                let ff1 = Ff1::new(&cipher, radix).unwrap();
                assert_eq!(ff1.encrypt(plaintext, &tweak).unwrap(), ciphertext);
                assert_eq!(ff1.decrypt(ciphertext, &tweak).unwrap(), plaintext);
                cipher.destroy().unwrap();
            }
        }
    }

    #[test]
    fn invalid_inputs() {
        let cipher = SoftwareAesCipher::new(&hex::decode(KEY_128).unwrap()).unwrap();
        assert!(Ff1::new(&cipher, 1).is_err());
        assert!(Ff1::new(&cipher, 37).is_err());

        let ff1 = Ff1::new(&cipher, 10).unwrap();
        assert!(matches!(
            ff1.encrypt("01234a", &[]).unwrap_err(),
            CipherError::Default(_)
        ));
        assert!(ff1.encrypt("7", &[]).is_err());
        // 10^37 does not fit the arithmetic
        assert!(ff1.encrypt(&"1".repeat(74), &[]).is_err());
    }

    #[test]
    fn destroyed_cipher_is_reported() {
        let mut cipher = SoftwareAesCipher::new(&hex::decode(KEY_128).unwrap()).unwrap();
        cipher.destroy().unwrap();
        let ff1 = Ff1::new(&cipher, 10).unwrap();
        assert!(matches!(
            ff1.encrypt("0123456789", &[]).unwrap_err(),
            CipherError::UseAfterDestroy
        ));
    }
}
