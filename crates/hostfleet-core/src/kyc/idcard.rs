// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;

use super::{KycProvider, KycVerdict, VerifyInput};

/// Key of the built-in provider.
pub const IDCARD_CN: &str = "idcard_cn";

const WEIGHTS: [u32; 17] = [7, 9, 10, 5, 8, 4, 2, 1, 6, 3, 7, 9, 10, 5, 8, 4, 2];
const CHECK_CHARS: &[u8; 11] = b"10X98765432";

/// Structural check of an 18-character resident ID number: digits, a
/// valid birth date at positions 7..15 and the weighted mod-11 check
/// character. Only an uppercase `X` is accepted as check character.
pub fn validate_id_number(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.len() != 18 {
        return false;
    }
    if !bytes[..17].iter().all(u8::is_ascii_digit) {
        return false;
    }
    let last = bytes[17];
    if !(last.is_ascii_digit() || last == b'X') {
        return false;
    }
    if NaiveDate::parse_from_str(&id[6..14], "%Y%m%d").is_err() {
        return false;
    }
    let sum: u32 = bytes[..17]
        .iter()
        .zip(WEIGHTS)
        .map(|(b, w)| u32::from(b - b'0') * w)
        .sum();
    CHECK_CHARS[(sum % 11) as usize] == last
}

/// Offline provider that only validates the ID number.
pub struct IdCardCnProvider;

#[async_trait]
impl KycProvider for IdCardCnProvider {
    fn key(&self) -> &str {
        IDCARD_CN
    }

    fn name(&self) -> &str {
        "ID card format check"
    }

    async fn verify(&self, input: &VerifyInput) -> Result<KycVerdict> {
        if input.real_name.trim().is_empty() {
            return Ok(KycVerdict::failed("name is required"));
        }
        if validate_id_number(input.id_number.trim()) {
            Ok(KycVerdict::verified())
        } else {
            Ok(KycVerdict::failed("invalid id number"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id_number() {
        assert!(validate_id_number("11010519491231002X"));
        assert!(validate_id_number("440524188001010014"));
        // Lowercase check character.
        assert!(!validate_id_number("11010519491231002x"));
        // Wrong check digit.
        assert!(!validate_id_number("110105194912310021"));
        // Impossible birth date.
        assert!(!validate_id_number("110105194913310021"));
        assert!(!validate_id_number("1101051949123100"));
        assert!(!validate_id_number("11010519491231002X1"));
    }

    /// The valid check character of a 17-digit prefix, found by trial.
    fn check_char(prefix: &str) -> char {
        let valid: Vec<char> = "0123456789X"
            .chars()
            .filter(|c| validate_id_number(&format!("{prefix}{c}")))
            .collect();
        assert_eq!(valid.len(), 1, "{prefix}");
        valid[0]
    }

    #[test]
    fn test_one_in_eleven_residues_checks_with_x() {
        // First sequence number for each residue of the weighted sum.
        let mut by_residue = std::collections::BTreeMap::new();
        for seq in 0..1000 {
            let prefix = format!("11010519491231{seq:03}");
            let sum: u32 = prefix
                .bytes()
                .zip(WEIGHTS)
                .map(|(b, w)| u32::from(b - b'0') * w)
                .sum();
            by_residue.entry(sum % 11).or_insert(prefix);
        }
        assert_eq!(by_residue.len(), 11);
        let x_count = by_residue
            .values()
            .filter(|prefix| check_char(prefix) == 'X')
            .count();
        assert_eq!(x_count, 1);
    }

    #[tokio::test]
    async fn test_provider_verdicts() {
        let p = IdCardCnProvider;
        let ok = p
            .verify(&VerifyInput {
                real_name: "Zhang San".into(),
                id_number: "11010519491231002X".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(ok.ok);
        let bad = p
            .verify(&VerifyInput {
                real_name: "Zhang San".into(),
                id_number: "123".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!bad.ok);
        assert_eq!(bad.reason, "invalid id number");
    }
}
