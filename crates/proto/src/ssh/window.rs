//! Channel flow-control accounting (RFC 4254 Section 5.2).
//!
//! Every channel keeps two ledgers: one tracking the credit the peer has
//! granted us (consumed by sends, replenished by WINDOW_ADJUST) and one
//! tracking the credit we granted the peer (consumed by received data,
//! replenished when we send WINDOW_ADJUST).

use skiff_platform::{SkiffError, SkiffResult};

/// Window credit for one direction of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowLedger {
    space: u32,
    maximum: u32,
    minimum: u32,
    max_packet_size: u32,
}

impl WindowLedger {
    /// Creates a ledger holding `maximum` bytes of credit.
    ///
    /// `minimum` is the low watermark used by [`is_low_watermark`](Self::is_low_watermark).
    pub fn new(maximum: u32, minimum: u32, max_packet_size: u32) -> Self {
        Self {
            space: maximum,
            maximum,
            minimum,
            max_packet_size,
        }
    }

    /// Remaining credit.
    pub fn space(&self) -> u32 {
        self.space
    }

    /// Window size restored by a full replenish.
    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    /// Low watermark.
    pub fn minimum(&self) -> u32 {
        self.minimum
    }

    /// Largest single data payload for this direction.
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    /// Takes `n` bytes of credit.
    ///
    /// Fails without changing the ledger when `n` exceeds the remaining space.
    pub fn consume(&mut self, n: u32) -> SkiffResult<()> {
        if n > self.space {
            return Err(SkiffError::Channel(format!(
                "window exceeded: {} bytes with {} available",
                n, self.space
            )));
        }
        self.space -= n;
        Ok(())
    }

    /// Adds `n` bytes of credit.
    ///
    /// A window may not grow past 2^32 - 1 bytes.
    pub fn adjust(&mut self, n: u32) -> SkiffResult<()> {
        self.space = self.space.checked_add(n).ok_or_else(|| {
            SkiffError::Channel(format!(
                "window adjust of {} overflows space {}",
                n, self.space
            ))
        })?;
        Ok(())
    }

    /// True when remaining credit has dropped below the low watermark.
    pub fn is_low_watermark(&self) -> bool {
        self.space < self.minimum
    }

    /// Credit needed to restore the window to its maximum.
    pub fn replenish_amount(&self) -> u32 {
        self.maximum.saturating_sub(self.space)
    }

    /// Size of the next chunk to send out of `remaining` bytes.
    ///
    /// Zero when no credit is available.
    pub fn next_chunk(&self, remaining: usize) -> usize {
        let limit = self.space.min(self.max_packet_size) as usize;
        limit.min(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_then_adjust_restores_space() {
        let mut ledger = WindowLedger::new(4096, 1024, 2048);
        ledger.consume(3000).unwrap();
        assert_eq!(ledger.space(), 1096);
        ledger.adjust(3000).unwrap();
        assert_eq!(ledger.space(), 4096);
    }

    #[test]
    fn test_consume_more_than_space_fails() {
        let mut ledger = WindowLedger::new(100, 0, 100);
        assert!(matches!(ledger.consume(101), Err(SkiffError::Channel(_))));
        assert_eq!(ledger.space(), 100);
        ledger.consume(100).unwrap();
        assert!(ledger.consume(1).is_err());
    }

    #[test]
    fn test_adjust_overflow_fails() {
        let mut ledger = WindowLedger::new(u32::MAX - 10, 0, 32768);
        assert!(ledger.adjust(10).is_ok());
        assert!(ledger.adjust(1).is_err());
        assert_eq!(ledger.space(), u32::MAX);
    }

    #[test]
    fn test_low_watermark_and_replenish() {
        let mut ledger = WindowLedger::new(8192, 4096, 32768);
        ledger.consume(4096).unwrap();
        assert!(!ledger.is_low_watermark());
        ledger.consume(1).unwrap();
        assert!(ledger.is_low_watermark());
        assert_eq!(ledger.replenish_amount(), 4097);
    }

    #[test]
    fn test_next_chunk_honours_packet_and_space() {
        let mut ledger = WindowLedger::new(4096, 0, 2048);
        assert_eq!(ledger.next_chunk(5000), 2048);
        ledger.consume(2048).unwrap();
        ledger.consume(2048).unwrap();
        assert_eq!(ledger.next_chunk(904), 0);
        ledger.adjust(4096).unwrap();
        assert_eq!(ledger.next_chunk(904), 904);
    }
}
