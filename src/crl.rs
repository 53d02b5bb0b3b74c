//! The signed portion of an X.509 v2 CRL.

use std::cmp::Ordering;

use der::Encode;
use time::OffsetDateTime;
use x509_cert::Version;
use x509_cert::crl::{RevokedCert, TbsCertList};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;

use crate::cert::extensions::{ReasonCode, ToAndFromX509Extension};
use crate::cert::params::{ExtensionParam, RevokedEntry};
use crate::error::{HsmCertError, Result};
use crate::serial::{compare_serials, from_x509_time, to_x509_time};
use crate::signer::SignatureAlgorithm;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TbsCrl {
    pub signature_algorithm: SignatureAlgorithm,
    pub issuer: Name,
    pub this_update: OffsetDateTime,
    pub next_update: OffsetDateTime,
    /// Sorted by serial, ascending, without duplicates.
    pub entries: Vec<RevokedEntry>,
    pub extensions: Vec<ExtensionParam>,
}

impl TbsCrl {
    /// Validates the update window and orders the entries.
    pub fn new(
        signature_algorithm: SignatureAlgorithm,
        issuer: Name,
        this_update: OffsetDateTime,
        next_update: OffsetDateTime,
        entries: &[RevokedEntry],
        extensions: Vec<ExtensionParam>,
    ) -> Result<Self> {
        check_update_window(this_update, next_update)?;
        Ok(Self {
            signature_algorithm,
            issuer,
            this_update,
            next_update,
            entries: sorted_entries(entries)?,
            extensions,
        })
    }

    pub fn to_inner(&self) -> Result<TbsCertList> {
        let revoked = self
            .entries
            .iter()
            .map(|entry| {
                let extensions = entry
                    .reason
                    .map(|reason| ExtensionParam::from_extension(&ReasonCode(reason), false)?.to_x509())
                    .transpose()?;
                Ok(RevokedCert {
                    serial_number: SerialNumber::new(&entry.serial)?,
                    revocation_date: to_x509_time(entry.revoked_at)?,
                    crl_entry_extensions: extensions.map(|ext| vec![ext]),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let extensions = self
            .extensions
            .iter()
            .map(ExtensionParam::to_x509)
            .collect::<Result<Vec<_>>>()?;

        Ok(TbsCertList {
            version: Version::V2,
            signature: self.signature_algorithm.algorithm_identifier()?,
            issuer: self.issuer.clone(),
            this_update: to_x509_time(self.this_update)?,
            next_update: Some(to_x509_time(self.next_update)?),
            revoked_certificates: (!revoked.is_empty()).then_some(revoked),
            crl_extensions: (!extensions.is_empty()).then_some(extensions),
        })
    }

    pub fn from_inner(inner: &TbsCertList) -> Result<Self> {
        let next_update = inner
            .next_update
            .as_ref()
            .ok_or_else(|| HsmCertError::DecodingError("CRL has no nextUpdate".to_string()))?;

        let entries = inner
            .revoked_certificates
            .iter()
            .flatten()
            .map(|revoked| {
                let reason = revoked
                    .crl_entry_extensions
                    .iter()
                    .flatten()
                    .find(|ext| ext.extn_id == ReasonCode::OID)
                    .map(|ext| ReasonCode::from_x509_extension_value(ext.extn_value.as_bytes()))
                    .transpose()?
                    .map(|code| code.0);
                Ok(RevokedEntry {
                    serial: revoked.serial_number.as_bytes().to_vec(),
                    revoked_at: from_x509_time(&revoked.revocation_date)?,
                    reason,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            signature_algorithm: SignatureAlgorithm::from_algorithm_identifier(&inner.signature)?,
            issuer: inner.issuer.clone(),
            this_update: from_x509_time(&inner.this_update)?,
            next_update: from_x509_time(next_update)?,
            entries,
            extensions: inner
                .crl_extensions
                .iter()
                .flatten()
                .map(ExtensionParam::from_x509)
                .collect(),
        })
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.to_inner()?.to_der()?)
    }
}

pub fn check_update_window(this_update: OffsetDateTime, next_update: OffsetDateTime) -> Result<()> {
    if this_update >= next_update {
        return Err(HsmCertError::InvalidInput(format!(
            "thisUpdate {this_update} must be before nextUpdate {next_update}"
        )));
    }
    Ok(())
}

/// Sorts entries by serial, ascending. Duplicate or empty serials are rejected.
pub fn sorted_entries(entries: &[RevokedEntry]) -> Result<Vec<RevokedEntry>> {
    if let Some(empty) = entries.iter().find(|e| e.serial.is_empty()) {
        return Err(HsmCertError::InvalidInput(format!(
            "CRL entry revoked at {} has no serial",
            empty.revoked_at
        )));
    }

    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| compare_serials(&a.serial, &b.serial));

    if let Some(pair) = sorted
        .windows(2)
        .find(|pair| compare_serials(&pair[0].serial, &pair[1].serial) == Ordering::Equal)
    {
        return Err(HsmCertError::InvalidInput(format!(
            "serial {} is revoked twice",
            hex::encode(&pair[1].serial)
        )));
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::params::DistinguishedName;
    use crate::signer::DigestAlgorithm;
    use der::Decode;
    use time::Duration;
    use x509_cert::ext::pkix::CrlReason;

    fn issuer() -> Name {
        DistinguishedName::builder()
            .common_name("root")
            .build()
            .as_x509_name()
            .unwrap()
    }

    #[test]
    fn test_entries_are_sorted() {
        let now = crate::serial::now();
        let entries = [
            RevokedEntry::new(vec![5], now),
            RevokedEntry::new(vec![2], now),
            RevokedEntry::new(vec![9], now),
        ];
        let serials: Vec<_> = sorted_entries(&entries)
            .unwrap()
            .into_iter()
            .map(|e| e.serial)
            .collect();
        assert_eq!(serials, vec![vec![2], vec![5], vec![9]]);
    }

    #[test]
    fn test_sorting_is_numeric() {
        let now = crate::serial::now();
        let entries = [
            RevokedEntry::new(vec![1, 0], now),
            RevokedEntry::new(vec![0xff], now),
        ];
        let sorted = sorted_entries(&entries).unwrap();
        assert_eq!(sorted[0].serial, vec![0xff]);
    }

    #[test]
    fn test_duplicate_serials_are_rejected() {
        let now = crate::serial::now();
        let entries = [
            RevokedEntry::new(vec![7], now),
            RevokedEntry::new(vec![0, 7], now),
        ];
        assert!(matches!(
            sorted_entries(&entries),
            Err(HsmCertError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_update_window() {
        let now = crate::serial::now();
        assert!(check_update_window(now, now + Duration::days(1)).is_ok());
        assert!(check_update_window(now, now).is_err());
        assert!(check_update_window(now, now - Duration::days(1)).is_err());
    }

    #[test]
    fn test_tbs_crl_round_trip() {
        let now = crate::serial::now();
        let tbs = TbsCrl::new(
            SignatureAlgorithm::Ecdsa(DigestAlgorithm::Sha256),
            issuer(),
            now,
            now + Duration::days(7),
            &[
                RevokedEntry::new(vec![9], now).with_reason(CrlReason::KeyCompromise),
                RevokedEntry::new(vec![3], now),
            ],
            vec![],
        )
        .unwrap();

        let der = tbs.to_der().unwrap();
        let decoded = TbsCrl::from_inner(&TbsCertList::from_der(&der).unwrap()).unwrap();
        assert_eq!(decoded, tbs);
        assert_eq!(decoded.entries[1].reason, Some(CrlReason::KeyCompromise));
    }
}
