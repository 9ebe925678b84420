//! DNA nucleotide encoding
//!
//! Bases are stored with 2 bits each:
//! - A -> 00
//! - C -> 01
//! - G -> 10
//! - T -> 11
//!
//! so that complementing a base is `3 - code` and packed sequences compare
//! lexicographically as plain bytes. Packed sequences are MSB first: base `i`
//! sits in byte `i / 4` at shift `6 - 2 * (i % 4)`.
//!
//! A k-mer in memory is a `u128` holding its first base in the most
//! significant used bit pair, which limits k to 64.

/// Code assigned to `N` and IUPAC ambiguity symbols; breaks k-mers
pub const AMBIGUOUS: u8 = 4;

/// Code assigned to bytes outside the nucleotide alphabet
pub const ILLEGAL: u8 = 5;

/// Byte to base-code table
pub static BASE_CODE: [u8; 256] = build_code_table();

const fn build_code_table() -> [u8; 256] {
    let mut table = [ILLEGAL; 256];
    let ambiguous = b"NRYKMSWBDHVnrykmswbdhv";
    let mut i = 0;
    while i < ambiguous.len() {
        table[ambiguous[i] as usize] = AMBIGUOUS;
        i += 1;
    }
    table[b'A' as usize] = 0;
    table[b'a' as usize] = 0;
    table[b'C' as usize] = 1;
    table[b'c' as usize] = 1;
    table[b'G' as usize] = 2;
    table[b'g' as usize] = 2;
    table[b'T' as usize] = 3;
    table[b't' as usize] = 3;
    table
}

/// Encode a single nucleotide; `None` for anything but A/C/G/T
#[inline]
pub fn encode_base(base: u8) -> Option<u8> {
    let code = BASE_CODE[base as usize];
    (code < 4).then_some(code)
}

/// Decode a 2-bit value to an uppercase nucleotide
#[inline]
pub const fn decode_base(bits: u8) -> u8 {
    match bits & 0b11 {
        0b00 => b'A',
        0b01 => b'C',
        0b10 => b'G',
        _ => b'T',
    }
}

/// Number of bytes holding `num_bases` packed bases
#[inline]
pub const fn packed_len(num_bases: usize) -> usize {
    (num_bases * 2).div_ceil(8)
}

/// Pack base codes (each < 4) into `out`, which must be zeroed and at least
/// `packed_len(codes.len())` bytes long
pub fn pack_codes(codes: &[u8], out: &mut [u8]) {
    for (i, &code) in codes.iter().enumerate() {
        out[i >> 2] |= code << (6 - 2 * (i & 3));
    }
}

/// Read the base code at index `i` of a packed sequence
#[inline]
pub fn packed_code(packed: &[u8], i: usize) -> u8 {
    (packed[i >> 2] >> (6 - 2 * (i & 3))) & 0b11
}

/// Mask keeping the low `2k` bits of a k-mer
#[inline]
pub const fn kmer_mask(k: usize) -> u128 {
    if k >= 64 {
        u128::MAX
    } else {
        (1u128 << (2 * k)) - 1
    }
}

/// Reverse complement of a k-mer
pub fn reverse_complement(kmer: u128, k: usize) -> u128 {
    let mut fwd = kmer;
    let mut rc = 0u128;
    for _ in 0..k {
        rc = (rc << 2) | (3 - (fwd & 0b11));
        fwd >>= 2;
    }
    rc
}

/// Smaller of a k-mer and its reverse complement
#[inline]
pub fn canonical(kmer: u128, k: usize) -> u128 {
    kmer.min(reverse_complement(kmer, k))
}

/// Write a k-mer into `out` (`packed_len(k)` bytes) in packed, MSB-first form
pub fn write_kmer(kmer: u128, k: usize, out: &mut [u8]) {
    let aligned = kmer << (128 - 2 * k);
    out.copy_from_slice(&aligned.to_be_bytes()[..out.len()]);
}

/// Inverse of [`write_kmer`]
pub fn read_kmer(bytes: &[u8], k: usize) -> u128 {
    let mut buf = [0u8; 16];
    buf[..bytes.len()].copy_from_slice(bytes);
    u128::from_be_bytes(buf) >> (128 - 2 * k)
}

/// Encode an ACGT string as a k-mer; `None` if any symbol is not a base
pub fn kmer_from_str(s: &str) -> Option<u128> {
    s.bytes()
        .try_fold(0u128, |acc, b| encode_base(b).map(|c| (acc << 2) | c as u128))
}

/// Decode a k-mer back to its uppercase string
pub fn kmer_to_string(kmer: u128, k: usize) -> String {
    (0..k)
        .map(|i| decode_base((kmer >> (2 * (k - 1 - i))) as u8) as char)
        .collect()
}

/// Collapse every run of equal bases to a single base (case-insensitive)
pub fn homopolymer_compress(seq: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(seq.len());
    for &b in seq {
        let b = b.to_ascii_uppercase();
        if out.last() != Some(&b) {
            out.push(b);
        }
    }
    out
}

/// Store the low `out.len()` bytes of `value`, little endian
#[inline]
pub fn write_uint_le(value: u64, out: &mut [u8]) {
    out.copy_from_slice(&value.to_le_bytes()[..out.len()]);
}

/// Inverse of [`write_uint_le`] for up to 8 bytes
#[inline]
pub fn read_uint_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_base() {
        assert_eq!(encode_base(b'A'), Some(0));
        assert_eq!(encode_base(b'c'), Some(1));
        assert_eq!(encode_base(b'G'), Some(2));
        assert_eq!(encode_base(b't'), Some(3));
        assert_eq!(encode_base(b'N'), None);
        assert_eq!(BASE_CODE[b'N' as usize], AMBIGUOUS);
        assert_eq!(BASE_CODE[b'y' as usize], AMBIGUOUS);
        assert_eq!(BASE_CODE[b'E' as usize], ILLEGAL);
        assert_eq!(BASE_CODE[b'*' as usize], ILLEGAL);
    }

    #[test]
    fn test_pack_codes() {
        let codes = [0u8, 1, 2, 3, 3];
        let mut out = vec![0u8; packed_len(codes.len())];
        pack_codes(&codes, &mut out);
        assert_eq!(out, vec![0b00_01_10_11, 0b11_00_00_00]);
        for (i, &c) in codes.iter().enumerate() {
            assert_eq!(packed_code(&out, i), c);
        }
    }

    #[test]
    fn test_reverse_complement() {
        let kmer = kmer_from_str("AACGT").unwrap();
        assert_eq!(kmer_to_string(reverse_complement(kmer, 5), 5), "ACGTT");

        let palindrome = kmer_from_str("ACGT").unwrap();
        assert_eq!(reverse_complement(palindrome, 4), palindrome);
        assert_eq!(canonical(kmer_from_str("TTT").unwrap(), 3), kmer_from_str("AAA").unwrap());
    }

    #[test]
    fn test_write_read_kmer_full_width() {
        let s = "ACGT".repeat(16);
        let kmer = kmer_from_str(&s).unwrap();
        let mut buf = vec![0u8; packed_len(64)];
        write_kmer(kmer, 64, &mut buf);
        assert_eq!(read_kmer(&buf, 64), kmer);
        assert_eq!(kmer_to_string(kmer, 64), s);
    }

    #[test]
    fn test_written_kmers_sort_like_values() {
        let k = 7;
        let a = kmer_from_str("ACGTACG").unwrap();
        let b = kmer_from_str("ACGTTCG").unwrap();
        let mut ba = vec![0u8; packed_len(k)];
        let mut bb = vec![0u8; packed_len(k)];
        write_kmer(a, k, &mut ba);
        write_kmer(b, k, &mut bb);
        assert!(a < b);
        assert!(ba < bb);
    }

    #[test]
    fn test_homopolymer_compress() {
        assert_eq!(homopolymer_compress(b"AAACCGTTTA"), b"ACGTA");
        assert_eq!(homopolymer_compress(b"aAcC"), b"AC");
        assert!(homopolymer_compress(b"").is_empty());
    }

    #[test]
    fn test_uint_le() {
        let mut buf = [0u8; 3];
        write_uint_le(0x01_02_03, &mut buf);
        assert_eq!(buf, [3, 2, 1]);
        assert_eq!(read_uint_le(&buf), 0x01_02_03);
    }
}
