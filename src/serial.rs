//! Serial numbers and certificate times.
//!
//! Serials are 160 random bits from the operating system's CSPRNG with the
//! top bit cleared, so they are positive and fit the 20 octets RFC 5280
//! allows. Nothing is persisted: uniqueness rests on the collision
//! probability of 159 random bits.

use std::cmp::Ordering;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use der::asn1::{GeneralizedTime, UtcTime};
use log::trace;
use rand::TryRngCore;
use rand::rngs::OsRng;
use time::OffsetDateTime;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Time;

use crate::error::{HsmCertError, Result};

/// Number of random octets in a serial.
pub const SERIAL_LEN: usize = 20;

/// Allocates certificate and CRL serial numbers.
pub struct SerialAllocator<R = OsRng> {
    rng: Mutex<R>,
}

impl SerialAllocator {
    pub fn new() -> Self {
        Self::with_rng(OsRng)
    }
}

impl Default for SerialAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: TryRngCore> SerialAllocator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// A fresh positive, non-zero serial of at most 20 octets.
    pub fn next_serial(&self) -> Result<SerialNumber> {
        let mut bytes = [0u8; SERIAL_LEN];
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            rng.try_fill_bytes(&mut bytes)
                .map_err(|e| HsmCertError::SerialGenerationError(e.to_string()))?;
            bytes[0] &= 0x7f;
            if bytes.iter().any(|b| *b != 0) {
                break;
            }
        }
        drop(rng);

        trace!("Allocated serial {}", hex::encode(bytes));
        SerialNumber::new(&bytes).map_err(|e| HsmCertError::SerialGenerationError(e.to_string()))
    }
}

/// Orders two big-endian unsigned integers, ignoring leading zero octets.
pub fn compare_serials(a: &[u8], b: &[u8]) -> Ordering {
    let strip = |v: &[u8]| -> usize { v.iter().take_while(|b| **b == 0).count() };
    let a = &a[strip(a)..];
    let b = &b[strip(b)..];
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Current UTC time truncated to whole seconds.
pub fn now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

/// Encodes as `UTCTime` through 2049 and `GeneralizedTime` from 2050 (RFC 5280 §4.1.2.5).
pub fn to_x509_time(at: OffsetDateTime) -> Result<Time> {
    let secs = u64::try_from(at.unix_timestamp()).map_err(|_| {
        HsmCertError::InvalidInput(format!("time {at} is before the Unix epoch"))
    })?;
    let since_epoch = Duration::from_secs(secs);
    let encoded = if at.year() < 2050 {
        UtcTime::from_unix_duration(since_epoch).map(Time::UtcTime)
    } else {
        GeneralizedTime::from_unix_duration(since_epoch).map(Time::GeneralTime)
    };
    encoded.map_err(|e| HsmCertError::EncodingError(format!("time {at}: {e}")))
}

pub fn from_x509_time(time: &Time) -> Result<OffsetDateTime> {
    let since_epoch = match time {
        Time::UtcTime(t) => t.to_unix_duration(),
        Time::GeneralTime(t) => t.to_unix_duration(),
    };
    OffsetDateTime::from_unix_timestamp(since_epoch.as_secs() as i64)
        .map_err(|e| HsmCertError::DecodingError(e.to_string()))
}
