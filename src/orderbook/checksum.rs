//! Canonical checksum payloads over the top of the book

use serde::{Deserialize, Serialize};

use super::Level;

/// Layout of the string the venue hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumLayout {
    /// `bid_px:bid_amt:ask_px:ask_amt:...` level by level, signed CRC32
    #[default]
    Interleaved,
    /// Top asks then top bids, digits only, concatenated, unsigned CRC32
    AsksThenBids,
}

impl ChecksumLayout {
    /// Build the payload string for the top `depth` levels of each side
    pub fn payload(&self, bids: &[Level], asks: &[Level], depth: usize) -> String {
        match self {
            ChecksumLayout::Interleaved => {
                let mut parts = Vec::with_capacity(depth * 4);
                for i in 0..depth {
                    if let Some(bid) = bids.get(i) {
                        parts.push(bid.price.to_string());
                        parts.push(bid.amount.to_string());
                    }
                    if let Some(ask) = asks.get(i) {
                        parts.push(ask.price.to_string());
                        parts.push(ask.amount.to_string());
                    }
                }
                parts.join(":")
            }
            ChecksumLayout::AsksThenBids => {
                let mut payload = String::new();
                for level in asks.iter().take(depth).chain(bids.iter().take(depth)) {
                    payload.push_str(&digits_only(&level.price.to_string()));
                    payload.push_str(&digits_only(&level.amount.to_string()));
                }
                payload
            }
        }
    }

    /// Compute the checksum the venue would report for these levels
    pub fn compute(&self, bids: &[Level], asks: &[Level], depth: usize) -> i64 {
        let payload = self.payload(bids, asks, depth);
        match self {
            ChecksumLayout::Interleaved => crc32_signed(&payload),
            ChecksumLayout::AsksThenBids => crc32_unsigned(&payload),
        }
    }
}

/// CRC32 of the payload read as a signed 32-bit integer
pub fn crc32_signed(payload: &str) -> i64 {
    crc32fast::hash(payload.as_bytes()) as i32 as i64
}

/// CRC32 of the payload as an unsigned integer
pub fn crc32_unsigned(payload: &str) -> i64 {
    crc32fast::hash(payload.as_bytes()) as i64
}

fn digits_only(number: &str) -> String {
    let digits: String = number.chars().filter(|c| *c != '.').collect();
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn levels(pairs: &[(rust_decimal::Decimal, rust_decimal::Decimal)]) -> Vec<Level> {
        pairs.iter().map(|(p, a)| Level::new(*p, *a)).collect()
    }

    #[test]
    fn test_interleaved_payload_skips_exhausted_side() {
        let bids = levels(&[(dec!(3366.1), dec!(7)), (dec!(3366), dec!(6))]);
        let asks = levels(&[(dec!(3366.8), dec!(9))]);
        let payload = ChecksumLayout::Interleaved.payload(&bids, &asks, 25);
        assert_eq!(payload, "3366.1:7:3366.8:9:3366:6");
    }

    #[test]
    fn test_interleaved_respects_depth() {
        let bids = levels(&[(dec!(10), dec!(1)), (dec!(9), dec!(1))]);
        let asks = levels(&[(dec!(11), dec!(1)), (dec!(12), dec!(1))]);
        let payload = ChecksumLayout::Interleaved.payload(&bids, &asks, 1);
        assert_eq!(payload, "10:1:11:1");
    }

    #[test]
    fn test_asks_then_bids_strips_points_and_leading_zeros() {
        let bids = levels(&[(dec!(0.5666), dec!(4831.75496356))]);
        let asks = levels(&[(dec!(0.5668), dec!(4410.79769741))]);
        let payload = ChecksumLayout::AsksThenBids.payload(&bids, &asks, 10);
        assert_eq!(payload, "56684410797697415666483175496356");
    }

    #[test]
    fn test_signed_and_unsigned_crc_agree_on_bits() {
        let payload = "3366.1:7:3366.8:9";
        let signed = crc32_signed(payload);
        let unsigned = crc32_unsigned(payload);
        assert_eq!(signed as i32 as u32, unsigned as u32);
        assert!(unsigned >= 0);
    }
}
