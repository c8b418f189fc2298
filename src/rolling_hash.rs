/// Weak rolling hash over a fixed window, used to find candidate block matches.
///
/// Two sums modulo 65521 packed into 32 bits; sliding by one byte is O(1).
const MOD: u32 = 65521;

#[derive(Debug, Clone, Copy)]
pub struct RollingHash {
    a: u32,
    b: u32,
    window: u32,
}

impl RollingHash {
    /// Hash of `window`; its length becomes the rolling window size.
    pub fn over(window: &[u8]) -> Self {
        // u64 accumulators defer the modular reduction to the end.
        let (a, b) = window.iter().fold((1u64, 0u64), |(a, b), &byte| {
            let a = a + byte as u64;
            (a, b + a)
        });
        Self {
            a: (a % MOD as u64) as u32,
            b: (b % MOD as u64) as u32,
            window: window.len() as u32,
        }
    }

    /// Drop `outgoing` from the front of the window and append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = outgoing as u32;
        let inc = incoming as u32;
        self.a = (self.a + MOD - out + inc) % MOD;
        let weighted_out = (out * (self.window % MOD)) % MOD;
        self.b = (self.b + MOD - 1 + self.a + MOD - weighted_out) % MOD;
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_window_same_digest() {
        assert_eq!(
            RollingHash::over(b"block of bytes").digest(),
            RollingHash::over(b"block of bytes").digest()
        );
        assert_ne!(
            RollingHash::over(b"Hello").digest(),
            RollingHash::over(b"World").digest()
        );
    }

    #[test]
    fn rolling_matches_fresh_hash_across_whole_buffer() {
        let data: Vec<u8> = (0..2000u32).map(|i| (i * 7 + 13) as u8).collect();
        let w = 64;
        let mut rolling = RollingHash::over(&data[..w]);
        for start in 1..=data.len() - w {
            rolling.roll(data[start - 1], data[start + w - 1]);
            assert_eq!(
                rolling.digest(),
                RollingHash::over(&data[start..start + w]).digest(),
                "mismatch at offset {start}"
            );
        }
    }

    #[test]
    fn rolling_handles_high_bytes() {
        let data = [0xFFu8; 300];
        let mut rolling = RollingHash::over(&data[..200]);
        rolling.roll(0xFF, 0xFF);
        assert_eq!(rolling.digest(), RollingHash::over(&data[1..201]).digest());
    }
}
