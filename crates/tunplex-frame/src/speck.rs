//! Speck128 block ciphers for the `cipher` traits.
//!
//! Counter mode comes from the `ctr` crate, the same way AES is paired with
//! `ofb`, so only the block function lives here.

use cipher::consts::{U16, U32};
use cipher::{impl_simple_block_encdec, Block, BlockCipher, Key, KeyInit, KeySizeUser};

const SPECK128_128_ROUNDS: usize = 32;
const SPECK128_256_ROUNDS: usize = 34;

/// Speck128/128 in big-endian counter mode.
pub(crate) type Speck128Ctr = ctr::Ctr128BE<Speck128_128>;

/// Speck128/256 in big-endian counter mode.
pub(crate) type Speck256Ctr = ctr::Ctr128BE<Speck128_256>;

#[derive(Clone)]
struct RoundKeys(Vec<u64>);

impl RoundKeys {
    fn schedule(k0: u64, l_init: &[u64], rounds: usize) -> Self {
        let mut l = l_init.to_vec();
        let mut keys = Vec::with_capacity(rounds);
        keys.push(k0);
        for i in 0..rounds - 1 {
            let next_l = keys[i].wrapping_add(l[i].rotate_right(8)) ^ (i as u64);
            l.push(next_l);
            keys.push(keys[i].rotate_left(3) ^ next_l);
        }
        Self(keys)
    }

    fn encrypt_words(&self, x: &mut u64, y: &mut u64) {
        for &rk in &self.0 {
            *x = x.rotate_right(8).wrapping_add(*y) ^ rk;
            *y = y.rotate_left(3) ^ *x;
        }
    }

    fn decrypt_words(&self, x: &mut u64, y: &mut u64) {
        for &rk in self.0.iter().rev() {
            *y = (*y ^ *x).rotate_right(3);
            *x = (*x ^ rk).wrapping_sub(*y).rotate_left(8);
        }
    }

    fn encrypt_block(&self, input: &Block<Speck128_128>, output: &mut Block<Speck128_128>) {
        let (mut x, mut y) = split(input);
        self.encrypt_words(&mut x, &mut y);
        join(x, y, output);
    }

    fn decrypt_block(&self, input: &Block<Speck128_128>, output: &mut Block<Speck128_128>) {
        let (mut x, mut y) = split(input);
        self.decrypt_words(&mut x, &mut y);
        join(x, y, output);
    }
}

/// Block bytes are `y || x`, each word little-endian.
fn split(block: &[u8]) -> (u64, u64) {
    (word(&block[8..16]), word(&block[0..8]))
}

fn join(x: u64, y: u64, out: &mut [u8]) {
    out[0..8].copy_from_slice(&y.to_le_bytes());
    out[8..16].copy_from_slice(&x.to_le_bytes());
}

fn word(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// Speck128/128: 16-byte key, 32 rounds.
#[derive(Clone)]
pub(crate) struct Speck128_128 {
    keys: RoundKeys,
}

impl KeySizeUser for Speck128_128 {
    type KeySize = U16;
}

impl KeyInit for Speck128_128 {
    fn new(key: &Key<Self>) -> Self {
        let l = [word(&key[8..16])];
        Self {
            keys: RoundKeys::schedule(word(&key[0..8]), &l, SPECK128_128_ROUNDS),
        }
    }
}

impl BlockCipher for Speck128_128 {}

impl_simple_block_encdec!(
    Speck128_128, U16, speck, block,
    encrypt: {
        let input = *block.get_in();
        speck.keys.encrypt_block(&input, block.get_out());
    }
    decrypt: {
        let input = *block.get_in();
        speck.keys.decrypt_block(&input, block.get_out());
    }
);

/// Speck128/256: 32-byte key, 34 rounds.
#[derive(Clone)]
pub(crate) struct Speck128_256 {
    keys: RoundKeys,
}

impl KeySizeUser for Speck128_256 {
    type KeySize = U32;
}

impl KeyInit for Speck128_256 {
    fn new(key: &Key<Self>) -> Self {
        let l = [word(&key[8..16]), word(&key[16..24]), word(&key[24..32])];
        Self {
            keys: RoundKeys::schedule(word(&key[0..8]), &l, SPECK128_256_ROUNDS),
        }
    }
}

impl BlockCipher for Speck128_256 {}

impl_simple_block_encdec!(
    Speck128_256, U16, speck, block,
    encrypt: {
        let input = *block.get_in();
        speck.keys.encrypt_block(&input, block.get_out());
    }
    decrypt: {
        let input = *block.get_in();
        speck.keys.decrypt_block(&input, block.get_out());
    }
);
