//! Framed block transfer.
//!
//! Reliable one-directional delivery of an in-memory payload over the raw
//! byte link: XMODEM-CRC family frames with ACK/NAK flow control and an
//! adaptive block size (128-byte SOH frames, 1024-byte STX frames).
//!
//! A returned payload never contains the trailing padding needed to fill the
//! last block; callers carry an explicit byte count out-of-band and use
//! [`restore_padding`] to disambiguate real trailing `0x1A` bytes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, SyncError};
use crate::event::{EventBus, SyncEvent};
use crate::link::ByteLink;

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
pub const CRC_REQUEST: u8 = 0x43; // ASCII 'C'
pub const PADDING: u8 = 0x1A;

pub const SMALL_BLOCK: usize = 128;
pub const LARGE_BLOCK: usize = 1024;

const MAX_RETRIES: u32 = 10;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
const HANDSHAKE_POLL: Duration = Duration::from_millis(100);

/// CRC-16-CCITT, polynomial 0x1021, initial value 0, no final XOR.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Re-append padding stripped by the receiver when the out-of-band byte
/// count says the payload really ended in `0x1A` bytes.
pub fn restore_padding(mut data: Vec<u8>, expected_len: usize) -> Vec<u8> {
    if data.len() > expected_len {
        data.truncate(expected_len);
    }
    while data.len() < expected_len {
        data.push(PADDING);
    }
    data
}

/// One framed transfer in one direction over a shared link.
pub struct BlockTransfer {
    link: ByteLink,
    events: Arc<EventBus>,
}

impl BlockTransfer {
    pub fn new(link: ByteLink, events: Arc<EventBus>) -> Self {
        Self { link, events }
    }

    /// Send `payload`, waiting for the receiver to initiate CRC mode.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.wait_for_receiver().await?;
        self.drain_stale_handshake();

        let total_blocks = count_blocks(payload.len());
        let mut offset = 0usize;
        let mut block_no: u8 = 1;
        let mut sent = 0usize;

        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let block_size = if remaining >= LARGE_BLOCK {
                LARGE_BLOCK
            } else {
                SMALL_BLOCK
            };
            let take = remaining.min(block_size);
            let mut block = vec![PADDING; block_size];
            block[..take].copy_from_slice(&payload[offset..offset + take]);

            self.send_block(&block, block_no).await?;

            sent += 1;
            self.events.post(SyncEvent::TransferProgress {
                block: sent,
                total_blocks: Some(total_blocks),
            });
            offset += take;
            block_no = block_no.wrapping_add(1);
        }

        self.send_eot().await
    }

    /// Receive one payload. Trailing padding is stripped.
    pub async fn receive(&self) -> Result<Vec<u8>> {
        self.link.clear_input();
        self.initiate_receive().await?;

        let started = Instant::now();
        let mut out: Vec<u8> = Vec::new();
        let mut expected: u64 = 1;
        let mut retries: u32 = 0;

        loop {
            let header = match self.link.read_byte(RESPONSE_TIMEOUT).await {
                Ok(b) => b,
                Err(SyncError::Timeout(_)) => {
                    retries += 1;
                    self.check_retries(retries, started, "no frame header").await?;
                    self.link.write_byte(NAK).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let block_size = match header {
                EOT => {
                    self.link.write_byte(ACK).await?;
                    break;
                }
                CAN => return Err(SyncError::Cancelled),
                SOH => SMALL_BLOCK,
                STX => LARGE_BLOCK,
                other => {
                    tracing::debug!(byte = other, "unexpected byte in place of frame header");
                    retries += 1;
                    self.check_retries(retries, started, "unexpected header byte").await?;
                    // Let whatever garbled frame follows drain out before NAKing.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    self.link.clear_input();
                    self.link.write_byte(NAK).await?;
                    continue;
                }
            };

            let frame = match self.read_frame(block_size).await {
                Ok(frame) => frame,
                Err(SyncError::Timeout(_)) => {
                    retries += 1;
                    self.check_retries(retries, started, "truncated frame").await?;
                    self.link.write_byte(NAK).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (block_no, complement, data, wire_crc) = frame;
            if block_no as u16 + complement as u16 != 255 {
                retries += 1;
                self.check_retries(retries, started, "bad block-number complement").await?;
                self.link.write_byte(NAK).await?;
                continue;
            }
            if crc16(&data) != wire_crc {
                retries += 1;
                self.check_retries(retries, started, "CRC mismatch").await?;
                self.link.write_byte(NAK).await?;
                continue;
            }

            if block_no == (expected & 0xFF) as u8 {
                out.extend_from_slice(&data);
                self.link.write_byte(ACK).await?;
                retries = 0;
                expected += 1;
                self.events.post(SyncEvent::TransferProgress {
                    block: (expected - 1) as usize,
                    total_blocks: None,
                });
            } else if block_no == ((expected - 1) & 0xFF) as u8 {
                // Duplicate of the previous block: acknowledge, do not append.
                self.link.write_byte(ACK).await?;
            } else {
                self.link.write_byte(NAK).await?;
            }
        }

        while out.last() == Some(&PADDING) {
            out.pop();
        }
        Ok(out)
    }

    async fn read_frame(&self, block_size: usize) -> Result<(u8, u8, Vec<u8>, u16)> {
        let meta = self.link.read_exact(2, RESPONSE_TIMEOUT).await?;
        let data = self.link.read_exact(block_size, RESPONSE_TIMEOUT).await?;
        let crc = self.link.read_exact(2, RESPONSE_TIMEOUT).await?;
        Ok((
            meta[0],
            meta[1],
            data,
            u16::from_be_bytes([crc[0], crc[1]]),
        ))
    }

    async fn check_retries(&self, retries: u32, started: Instant, reason: &str) -> Result<()> {
        if retries <= MAX_RETRIES {
            return Ok(());
        }
        let diag = format!(
            "{reason} ({retries} errors in {:?}, {} bytes pending, port open: {})",
            started.elapsed(),
            self.link.available(),
            self.link.is_open(),
        );
        self.events.error(format!("Transfer aborted: {diag}"));
        // Best effort: tell the sender to stop.
        let _ = self.link.write(&[CAN, CAN]).await;
        Err(SyncError::Transfer(diag))
    }

    /// Sender half of the handshake: wait for the receiver's `C`.
    async fn wait_for_receiver(&self) -> Result<()> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SyncError::Handshake(format!(
                    "receiver did not request CRC mode within {HANDSHAKE_TIMEOUT:?}"
                )));
            }
            match self
                .link
                .read_byte(remaining.min(Duration::from_secs(1)))
                .await
            {
                Ok(CRC_REQUEST) => return Ok(()),
                // NAK asks for checksum mode; only CRC mode is spoken here.
                Ok(_) | Err(SyncError::Timeout(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// The receiver may have queued several `C`s before we were ready.
    fn drain_stale_handshake(&self) {
        let stale = self.link.available();
        if stale > 0 {
            tracing::debug!(stale, "draining queued handshake bytes");
            self.link.clear_input();
        }
    }

    async fn send_block(&self, block: &[u8], block_no: u8) -> Result<()> {
        let mut frame = Vec::with_capacity(block.len() + 5);
        frame.push(if block.len() == LARGE_BLOCK { STX } else { SOH });
        frame.push(block_no);
        frame.push(255 - block_no);
        frame.extend_from_slice(block);
        frame.extend_from_slice(&crc16(block).to_be_bytes());

        let started = Instant::now();
        for _ in 0..MAX_RETRIES {
            self.link.write(&frame).await?;
            match self.link.read_byte(RESPONSE_TIMEOUT).await {
                Ok(ACK) => return Ok(()),
                Ok(CAN) => return Err(SyncError::Cancelled),
                // NAK, a stale handshake byte, or silence: retransmit.
                Ok(_) | Err(SyncError::Timeout(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        let diag = format!(
            "block {block_no} not acknowledged after {MAX_RETRIES} retries in {:?} ({} bytes pending, port open: {})",
            started.elapsed(),
            self.link.available(),
            self.link.is_open(),
        );
        self.events.error(format!("Transfer aborted: {diag}"));
        self.link.write(&[CAN, CAN]).await?;
        Err(SyncError::Transfer(diag))
    }

    async fn send_eot(&self) -> Result<()> {
        for _ in 0..MAX_RETRIES {
            self.link.write_byte(EOT).await?;
            match self.link.read_byte(RESPONSE_TIMEOUT).await {
                Ok(ACK) => return Ok(()),
                Ok(_) | Err(SyncError::Timeout(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SyncError::Transfer(format!(
            "end of transmission not acknowledged after {MAX_RETRIES} retries"
        )))
    }

    /// Receiver half of the handshake: request CRC mode until traffic appears.
    async fn initiate_receive(&self) -> Result<()> {
        for _ in 0..MAX_RETRIES {
            self.link.write_byte(CRC_REQUEST).await?;
            let mut waited = Duration::ZERO;
            while waited < Duration::from_secs(1) {
                if self.link.available() > 0 {
                    return Ok(());
                }
                tokio::time::sleep(HANDSHAKE_POLL).await;
                waited += HANDSHAKE_POLL;
            }
        }
        Err(SyncError::Handshake(format!(
            "sender did not respond to {MAX_RETRIES} CRC-mode requests"
        )))
    }
}

fn count_blocks(mut len: usize) -> usize {
    let mut blocks = 0;
    while len > 0 {
        let block = if len >= LARGE_BLOCK {
            LARGE_BLOCK
        } else {
            SMALL_BLOCK
        };
        len -= len.min(block);
        blocks += 1;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer_pair() -> (BlockTransfer, BlockTransfer, ByteLink, ByteLink) {
        let (a, b) = ByteLink::pair();
        let bus = EventBus::new();
        (
            BlockTransfer::new(a.clone(), bus.clone()),
            BlockTransfer::new(b.clone(), bus),
            a,
            b,
        )
    }

    #[test]
    fn crc16_reference_vector() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(crc16(b""), 0x0000);
    }

    #[test]
    fn count_blocks_mixes_sizes() {
        assert_eq!(count_blocks(0), 0);
        assert_eq!(count_blocks(1), 1);
        assert_eq!(count_blocks(SMALL_BLOCK), 1);
        assert_eq!(count_blocks(LARGE_BLOCK), 1);
        assert_eq!(count_blocks(LARGE_BLOCK + 1), 2);
        assert_eq!(count_blocks(3 * LARGE_BLOCK + 10), 4);
    }

    #[test]
    fn restore_padding_round_trips() {
        let data = vec![1, 2, PADDING, PADDING];
        let stripped = vec![1, 2];
        assert_eq!(restore_padding(stripped, 4), data);
        assert_eq!(restore_padding(vec![1, 2, 3], 3), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn payload_round_trip() {
        let (tx, rx, _a, _b) = transfer_pair();
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let recv = tokio::spawn(async move { rx.receive().await });
        tx.send(&payload).await.unwrap();
        assert_eq!(recv.await.unwrap().unwrap(), expected);
    }

    #[tokio::test]
    async fn small_payload_round_trip() {
        let (tx, rx, _a, _b) = transfer_pair();
        let recv = tokio::spawn(async move { rx.receive().await });
        tx.send(b"hello\n").await.unwrap();
        assert_eq!(recv.await.unwrap().unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn empty_payload_round_trip() {
        let (tx, rx, _a, _b) = transfer_pair();
        let recv = tokio::spawn(async move { rx.receive().await });
        tx.send(&[]).await.unwrap();
        assert_eq!(recv.await.unwrap().unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn payload_ending_in_padding_byte_restores_by_length() {
        let (tx, rx, _a, _b) = transfer_pair();
        let payload = vec![7u8, 8, PADDING, PADDING];
        let expected_len = payload.len();
        let expected = payload.clone();

        let recv = tokio::spawn(async move { rx.receive().await });
        tx.send(&payload).await.unwrap();
        let stripped = recv.await.unwrap().unwrap();
        assert!(stripped.len() < expected_len);
        assert_eq!(restore_padding(stripped, expected_len), expected);
    }

    #[tokio::test]
    async fn sender_survives_multiple_handshake_bytes() {
        let (tx, _rx, _a, remote) = transfer_pair();
        // A slow receiver that queued three C bytes before the sender woke.
        remote.write(&[CRC_REQUEST, CRC_REQUEST, CRC_REQUEST]).await.unwrap();

        let driver = tokio::spawn(async move {
            // Manually play the receiver side for block 1 and EOT.
            let header = remote.read_byte(Duration::from_secs(5)).await.unwrap();
            assert_eq!(header, SOH);
            let meta = remote.read_exact(2, Duration::from_secs(5)).await.unwrap();
            assert_eq!(meta[0], 1);
            assert_eq!(meta[1], 254);
            let data = remote
                .read_exact(SMALL_BLOCK, Duration::from_secs(5))
                .await
                .unwrap();
            let crc = remote.read_exact(2, Duration::from_secs(5)).await.unwrap();
            assert_eq!(crc16(&data), u16::from_be_bytes([crc[0], crc[1]]));
            remote.write_byte(ACK).await.unwrap();
            let eot = remote.read_byte(Duration::from_secs(5)).await.unwrap();
            assert_eq!(eot, EOT);
            remote.write_byte(ACK).await.unwrap();
        });

        tx.send(b"payload after noisy handshake").await.unwrap();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn receiver_naks_out_of_sequence_blocks() {
        let (_tx, rx, remote, _b) = transfer_pair();

        let driver = tokio::spawn(async move {
            // Wait for the receiver's C.
            let c = remote.read_byte(Duration::from_secs(5)).await.unwrap();
            assert_eq!(c, CRC_REQUEST);

            let frame = |block_no: u8, body: &[u8]| {
                let mut block = vec![PADDING; SMALL_BLOCK];
                block[..body.len()].copy_from_slice(body);
                let mut f = vec![SOH, block_no, 255 - block_no];
                f.extend_from_slice(&block);
                f.extend_from_slice(&crc16(&block).to_be_bytes());
                f
            };

            // Block 1 accepted.
            remote.write(&frame(1, b"first")).await.unwrap();
            assert_eq!(remote.read_byte(Duration::from_secs(5)).await.unwrap(), ACK);

            // Block 3 is out of sequence: NAK, nothing appended.
            remote.write(&frame(3, b"skip")).await.unwrap();
            assert_eq!(remote.read_byte(Duration::from_secs(5)).await.unwrap(), NAK);

            // Block 1 again is a duplicate: ACK, nothing appended.
            remote.write(&frame(1, b"first")).await.unwrap();
            assert_eq!(remote.read_byte(Duration::from_secs(5)).await.unwrap(), ACK);

            // Block 2 accepted, then EOT.
            remote.write(&frame(2, b"second")).await.unwrap();
            assert_eq!(remote.read_byte(Duration::from_secs(5)).await.unwrap(), ACK);
            remote.write_byte(EOT).await.unwrap();
            assert_eq!(remote.read_byte(Duration::from_secs(5)).await.unwrap(), ACK);
        });

        let mut expected = Vec::new();
        expected.extend_from_slice(b"first");
        expected.extend_from_slice(&[PADDING; SMALL_BLOCK - 5]);
        expected.extend_from_slice(b"second");

        let got = rx.receive().await.unwrap();
        driver.await.unwrap();
        // Trailing padding of the final block is stripped; the interior
        // padding of block 1 survives.
        assert_eq!(got.len(), SMALL_BLOCK + 6);
        assert_eq!(&got[..SMALL_BLOCK], &expected[..SMALL_BLOCK]);
        assert_eq!(&got[SMALL_BLOCK..], b"second");
    }

    #[tokio::test]
    async fn corrupt_crc_is_retried() {
        let (_tx, rx, remote, _b) = transfer_pair();

        let driver = tokio::spawn(async move {
            let c = remote.read_byte(Duration::from_secs(5)).await.unwrap();
            assert_eq!(c, CRC_REQUEST);

            let mut block = vec![PADDING; SMALL_BLOCK];
            block[..4].copy_from_slice(b"data");
            let good_crc = crc16(&block);

            // First attempt with a corrupted CRC.
            let mut bad = vec![SOH, 1, 254];
            bad.extend_from_slice(&block);
            bad.extend_from_slice(&(good_crc ^ 0xFFFF).to_be_bytes());
            remote.write(&bad).await.unwrap();
            assert_eq!(remote.read_byte(Duration::from_secs(5)).await.unwrap(), NAK);

            // Retransmission with the correct CRC.
            let mut good = vec![SOH, 1, 254];
            good.extend_from_slice(&block);
            good.extend_from_slice(&good_crc.to_be_bytes());
            remote.write(&good).await.unwrap();
            assert_eq!(remote.read_byte(Duration::from_secs(5)).await.unwrap(), ACK);

            remote.write_byte(EOT).await.unwrap();
            assert_eq!(remote.read_byte(Duration::from_secs(5)).await.unwrap(), ACK);
        });

        let got = rx.receive().await.unwrap();
        driver.await.unwrap();
        assert_eq!(&got[..4], b"data");
    }

    #[tokio::test]
    async fn receiver_aborts_on_cancel() {
        let (_tx, rx, remote, _b) = transfer_pair();
        let driver = tokio::spawn(async move {
            let c = remote.read_byte(Duration::from_secs(5)).await.unwrap();
            assert_eq!(c, CRC_REQUEST);
            remote.write_byte(CAN).await.unwrap();
        });
        let err = rx.receive().await.unwrap_err();
        driver.await.unwrap();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
