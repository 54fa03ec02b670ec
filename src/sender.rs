// Copyright (C) 2026 The xsend Authors
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Sender side of the stop-and-wait block transfer.
//!
//! Each block is framed, written, and held until the receiver answers with
//! ACK. Anything else (NAK, noise, silence) counts against the block's retry
//! budget; once the budget is spent the session is abandoned and reported as
//! a partial transfer instead of an error.

use std::marker::PhantomData;
use std::time::{Duration, Instant};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, info, warn};
use crate::framer::{self, Block, FramerError};
use crate::protocol::*;
use crate::serial::SerialPort;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Framing error: {0}")]
    Frame(#[from] FramerError),
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Consecutive negative responses tolerated on one block
    pub retry_limit: u32,
    /// How long to wait for the control byte after each frame
    pub response_timeout: Duration,
    /// Quiet period before collecting the receiver's trailing output
    pub final_wait: Duration,
    /// Pause after every ACK so a slow receiver is not overrun
    pub ack_pacing: Duration,
    pub backoff_base: Duration,
    pub backoff_divisor: f64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            retry_limit: 10,
            response_timeout: Duration::from_millis(2700),
            final_wait: Duration::from_secs(3),
            ack_pacing: Duration::from_millis(30),
            backoff_base: Duration::from_millis(100),
            backoff_divisor: 70.0,
        }
    }
}

/// Delay before resending after a negative response:
/// `base + (retries / divisor) * jitter`, with `jitter` in `[0, 1)`.
pub fn backoff_delay(config: &SenderConfig, retries: u32, jitter: f64) -> Duration {
    let spread = retries as f64 / config.backoff_divisor * jitter;
    config.backoff_base + Duration::try_from_secs_f64(spread).unwrap_or(Duration::ZERO)
}

// ============================================================================
// Timing
// ============================================================================

/// Sleeps on behalf of the state machine
pub trait Pacer: Send {
    fn pause(&mut self, duration: Duration);
}

pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// ============================================================================
// Responses, Events & Outcome
// ============================================================================

/// Classification of the single byte read after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Ack,
    Nak,
    Timeout,
    Other(u8),
}

impl Response {
    pub fn classify(byte: Option<u8>) -> Self {
        match byte {
            Some(ACK) => Response::Ack,
            Some(NAK) => Response::Nak,
            Some(b) => Response::Other(b),
            None => Response::Timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    FrameSent { block: usize, number: u8, attempt: u32 },
    Acknowledged { acked: usize, total: usize },
    Retrying { block: usize, total: usize, retries: u32, response: Response, delay: Duration },
    Aborted { acked: usize, total: usize },
    Completed { total: usize },
}

/// Receives progress events; presentation is up to the implementor
pub trait TransferObserver: Send {
    fn on_event(&mut self, event: &TransferEvent);
}

pub struct NoopObserver;

impl TransferObserver for NoopObserver {
    fn on_event(&mut self, _event: &TransferEvent) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    /// Retry budget exhausted; `acked_blocks` blocks made it across
    Aborted { acked_blocks: usize },
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub outcome: TransferOutcome,
    pub acked_blocks: usize,
    pub total_blocks: usize,
    pub frames_sent: usize,
    pub negative_signals: usize,
    pub elapsed: Duration,
    /// Whatever the receiver sent after the last frame, uninterpreted
    pub trailing: Vec<u8>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == TransferOutcome::Completed
    }
}

// ============================================================================
// States
// ============================================================================

pub struct AwaitingResponse;
pub struct Retrying;
pub struct Advancing;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    blocks: Vec<Block>,
    config: SenderConfig,
    rng: Box<dyn RngCore + Send>,
    pacer: Box<dyn Pacer>,
    observer: Box<dyn TransferObserver>,
    cursor: usize,
    retries: u32,
    last_response: Response,
    frames_sent: usize,
    negative_signals: usize,
    started: Instant,
}

// ============================================================================
// Trait
// ============================================================================

pub enum Step {
    Next(Box<dyn SenderState>),
    Finished(TransferReport),
}

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Step, SenderError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            serial: self.serial,
            blocks: self.blocks,
            config: self.config,
            rng: self.rng,
            pacer: self.pacer,
            observer: self.observer,
            cursor: self.cursor,
            retries: self.retries,
            last_response: self.last_response,
            frames_sent: self.frames_sent,
            negative_signals: self.negative_signals,
            started: self.started,
        })
    }

    fn io_error(&self, e: std::io::Error) -> SenderError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        SenderError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    /// Final quiet period, then collect the trailing bytes and build the report.
    fn finish(mut self, outcome: TransferOutcome) -> Result<TransferReport, SenderError> {
        let total = self.blocks.len();
        match outcome {
            TransferOutcome::Completed => {
                info!(total, "All blocks acknowledged");
                self.observer.on_event(&TransferEvent::Completed { total });
            }
            TransferOutcome::Aborted { acked_blocks } => {
                warn!(acked = acked_blocks, total, last = ?self.last_response, "Retry limit exceeded, abandoning transfer");
                self.observer.on_event(&TransferEvent::Aborted { acked: acked_blocks, total });
            }
        }

        self.pacer.pause(self.config.final_wait);
        let trailing = self.serial.read_available().map_err(|e| self.io_error(e))?;
        if !trailing.is_empty() {
            debug!("Trailing response: {:02X?}", trailing);
        }

        Ok(TransferReport {
            outcome,
            acked_blocks: self.cursor,
            total_blocks: total,
            frames_sent: self.frames_sent,
            negative_signals: self.negative_signals,
            elapsed: self.started.elapsed(),
            trailing,
        })
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<AwaitingResponse> {
    fn step(self: Box<Self>) -> Result<Step, SenderError> {
        let mut fsm = *self;
        if fsm.cursor >= fsm.blocks.len() {
            return Ok(Step::Finished(fsm.finish(TransferOutcome::Completed)?));
        }

        // Rebuilt on every attempt; nothing about a frame outlives its write.
        let number = framer::block_number(fsm.cursor);
        let frame = framer::build_frame(number, &fsm.blocks[fsm.cursor])?;

        // Stale bytes would be mistaken for the answer to this frame.
        fsm.serial.clear_input().map_err(|e| fsm.io_error(e))?;
        fsm.serial.write_all(&frame).map_err(|e| fsm.io_error(e))?;
        fsm.frames_sent += 1;

        let attempt = fsm.retries + 1;
        debug!(block = fsm.cursor, number, attempt, "Sent frame");
        fsm.observer.on_event(&TransferEvent::FrameSent { block: fsm.cursor, number, attempt });

        let mut buf = [0u8; 1];
        let received = match fsm.serial.read_timeout(&mut buf, fsm.config.response_timeout) {
            Ok(0) => None,
            Ok(_) => Some(buf[0]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => None,
            Err(e) => return Err(fsm.io_error(e)),
        };

        let response = Response::classify(received);
        fsm.last_response = response;

        if response == Response::Ack {
            debug!(block = fsm.cursor, "Received: ACK");
            let next = fsm.transition::<Advancing>();
            return Ok(Step::Next(next as Box<dyn SenderState>));
        }

        fsm.retries += 1;
        fsm.negative_signals += 1;
        match response {
            Response::Timeout => debug!(block = fsm.cursor, retries = fsm.retries, "No response"),
            _ => warn!(block = fsm.cursor, retries = fsm.retries, ?response, "Negative response"),
        }

        if fsm.retries > fsm.config.retry_limit {
            let acked_blocks = fsm.cursor;
            return Ok(Step::Finished(fsm.finish(TransferOutcome::Aborted { acked_blocks })?));
        }

        let next = fsm.transition::<Retrying>();
        Ok(Step::Next(next as Box<dyn SenderState>))
    }
}

impl SenderState for SenderFsm<Retrying> {
    fn step(self: Box<Self>) -> Result<Step, SenderError> {
        let mut fsm = *self;
        let jitter = fsm.rng.gen_range(0.0..1.0);
        let delay = backoff_delay(&fsm.config, fsm.retries, jitter);

        fsm.observer.on_event(&TransferEvent::Retrying {
            block: fsm.cursor,
            total: fsm.blocks.len(),
            retries: fsm.retries,
            response: fsm.last_response,
            delay,
        });
        fsm.pacer.pause(delay);

        let next = fsm.transition::<AwaitingResponse>();
        Ok(Step::Next(next as Box<dyn SenderState>))
    }
}

impl SenderState for SenderFsm<Advancing> {
    fn step(self: Box<Self>) -> Result<Step, SenderError> {
        let mut fsm = *self;
        fsm.cursor += 1;
        fsm.retries = 0;

        let total = fsm.blocks.len();
        fsm.observer.on_event(&TransferEvent::Acknowledged { acked: fsm.cursor, total });
        fsm.pacer.pause(fsm.config.ack_pacing);

        if fsm.cursor == total {
            return Ok(Step::Finished(fsm.finish(TransferOutcome::Completed)?));
        }

        let next = fsm.transition::<AwaitingResponse>();
        Ok(Step::Next(next as Box<dyn SenderState>))
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl SenderFsm<AwaitingResponse> {
    pub fn new(serial: Box<dyn SerialPort>, blocks: Vec<Block>, config: SenderConfig) -> Self {
        SenderFsm {
            state: PhantomData::<AwaitingResponse>,
            serial,
            blocks,
            config,
            rng: Box::new(StdRng::from_entropy()),
            pacer: Box::new(ThreadPacer),
            observer: Box::new(NoopObserver),
            cursor: 0,
            retries: 0,
            last_response: Response::Timeout,
            frames_sent: 0,
            negative_signals: 0,
            started: Instant::now(),
        }
    }

    pub fn with_observer(mut self, observer: impl TransferObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn start(mut self) -> Box<dyn SenderState> {
        info!(blocks = self.blocks.len(), "Starting transfer");
        self.started = Instant::now();
        Box::new(self)
    }
}

/// Drives the machine until it reports a final outcome.
pub fn run(mut state: Box<dyn SenderState>) -> Result<TransferReport, SenderError> {
    loop {
        match state.step()? {
            Step::Next(next) => state = next,
            Step::Finished(report) => return Ok(report),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use rand::rngs::mock::StepRng;
    use crate::serial::{DisconnectedPort, MockOp, MockSerialPort};

    #[derive(Clone, Default)]
    struct RecordingPacer(Arc<Mutex<Vec<Duration>>>);

    impl Pacer for RecordingPacer {
        fn pause(&mut self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    #[derive(Clone, Default)]
    struct RecordingObserver(Arc<Mutex<Vec<TransferEvent>>>);

    impl TransferObserver for RecordingObserver {
        fn on_event(&mut self, event: &TransferEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn test_blocks(count: usize) -> Vec<Block> {
        let content: Vec<u8> = (0..count * BLOCK_SIZE - 20).map(|i| (i % 256) as u8).collect();
        let blocks = framer::chunk(&content);
        assert_eq!(blocks.len(), count);
        blocks
    }

    /// Expected write log for frames sent in the given cursor order
    fn frames(blocks: &[Block], order: &[usize]) -> Vec<u8> {
        let mut out = Vec::new();
        for &i in order {
            out.extend(framer::build_frame(framer::block_number(i), &blocks[i]).unwrap());
        }
        out
    }

    /// Engine with zero jitter and a pacer that records instead of sleeping
    fn sender_with(
        serial: Box<dyn SerialPort>,
        blocks: Vec<Block>,
        config: SenderConfig,
        pacer: RecordingPacer,
    ) -> SenderFsm<AwaitingResponse> {
        let mut fsm = SenderFsm::new(serial, blocks, config);
        fsm.rng = Box::new(StepRng::new(0, 0));
        fsm.pacer = Box::new(pacer);
        fsm
    }

    fn sender(mock: MockSerialPort, blocks: Vec<Block>, pacer: RecordingPacer) -> SenderFsm<AwaitingResponse> {
        sender_with(Box::new(mock), blocks, SenderConfig::default(), pacer)
    }

    #[test]
    fn test_response_classify() {
        assert_eq!(Response::classify(Some(ACK)), Response::Ack);
        assert_eq!(Response::classify(Some(NAK)), Response::Nak);
        assert_eq!(Response::classify(Some(b'C')), Response::Other(b'C'));
        assert_eq!(Response::classify(None), Response::Timeout);
    }

    #[test]
    fn test_backoff_delay() {
        let config = SenderConfig::default();
        assert_eq!(backoff_delay(&config, 1, 0.0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 35, 0.5), Duration::from_millis(350));
        assert_eq!(backoff_delay(&config, 0, 0.99), Duration::from_millis(100));
        assert!(backoff_delay(&config, 10, 0.999) < Duration::from_millis(243));
    }

    #[test]
    fn test_sender_all_acks() {
        let blocks = test_blocks(3);
        let mock = MockSerialPort::new(vec![Some(ACK); 3], frames(&blocks, &[0, 1, 2]));
        let ops = mock.op_log();

        let report = run(sender(mock, blocks, RecordingPacer::default()).start()).unwrap();

        assert_eq!(report.outcome, TransferOutcome::Completed);
        assert!(report.is_complete());
        assert_eq!(report.acked_blocks, 3);
        assert_eq!(report.total_blocks, 3);
        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.negative_signals, 0);
        assert!(report.trailing.is_empty());
        let clears = ops.lock().unwrap().iter().filter(|op| **op == MockOp::Clear).count();
        assert_eq!(clears, 3);
    }

    #[test]
    fn test_sender_clears_before_write_and_honors_timeout() {
        let blocks = test_blocks(2);
        let mock = MockSerialPort::new(vec![Some(ACK), None, Some(NAK), Some(ACK)], frames(&blocks, &[0, 1, 1, 1]))
            .with_trailing(b"ok");
        let ops = mock.op_log();

        let config = SenderConfig {
            response_timeout: Duration::from_millis(450),
            ..SenderConfig::default()
        };
        let fsm = sender_with(Box::new(mock), blocks, config, RecordingPacer::default());
        let report = run(fsm.start()).unwrap();
        assert!(report.is_complete());

        let attempt = [
            MockOp::Clear,
            MockOp::Write(FRAME_SIZE),
            MockOp::Read(Duration::from_millis(450)),
        ];
        let mut expected = Vec::new();
        for _ in 0..4 {
            expected.extend_from_slice(&attempt);
        }
        expected.push(MockOp::Drain);
        assert_eq!(*ops.lock().unwrap(), expected);
    }

    #[test]
    fn test_sender_always_nak_aborts() {
        let blocks = test_blocks(2);
        let mock = MockSerialPort::new(vec![Some(NAK); 11], frames(&blocks, &[0; 11]));

        let report = run(sender(mock, blocks, RecordingPacer::default()).start()).unwrap();

        assert_eq!(report.outcome, TransferOutcome::Aborted { acked_blocks: 0 });
        assert!(!report.is_complete());
        assert_eq!(report.acked_blocks, 0);
        assert_eq!(report.frames_sent, 11);
        assert_eq!(report.negative_signals, 11);
    }

    #[test]
    fn test_sender_nak_then_ack_every_block() {
        let blocks = test_blocks(4);
        let mut responses = Vec::new();
        for _ in 0..4 {
            responses.push(Some(NAK));
            responses.push(Some(ACK));
        }
        let mock = MockSerialPort::new(responses, frames(&blocks, &[0, 0, 1, 1, 2, 2, 3, 3]));

        let report = run(sender(mock, blocks, RecordingPacer::default()).start()).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.acked_blocks, 4);
        assert_eq!(report.frames_sent, 8);
        assert_eq!(report.negative_signals, 4);
    }

    #[test]
    fn test_sender_line_hits() {
        // Block 2 gets corrupted once, then the ACK for block 3 is garbled.
        let blocks = test_blocks(3);
        let responses = vec![Some(ACK), Some(NAK), Some(ACK), Some(0x86), Some(ACK)];
        let mock = MockSerialPort::new(responses, frames(&blocks, &[0, 1, 1, 2, 2]));

        let report = run(sender(mock, blocks, RecordingPacer::default()).start()).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.acked_blocks, 3);
        assert_eq!(report.frames_sent, 5);
        assert_eq!(report.negative_signals, 2);
    }

    #[test]
    fn test_sender_timeout_retries() {
        let blocks = test_blocks(1);
        let mock = MockSerialPort::new(vec![None, None, Some(ACK)], frames(&blocks, &[0, 0, 0]));

        let report = run(sender(mock, blocks, RecordingPacer::default()).start()).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.negative_signals, 2);
    }

    #[test]
    fn test_sender_retry_counter_resets_on_ack() {
        // Ten misses per block stays within the limit as long as the ACK follows.
        let blocks = test_blocks(2);
        let mut responses = Vec::new();
        let mut order = Vec::new();
        for block in 0..2 {
            responses.extend(std::iter::repeat(Some(NAK)).take(10));
            responses.push(Some(ACK));
            order.extend(std::iter::repeat(block).take(11));
        }
        let mock = MockSerialPort::new(responses, frames(&blocks, &order));

        let report = run(sender(mock, blocks, RecordingPacer::default()).start()).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.frames_sent, 22);
        assert_eq!(report.negative_signals, 20);
    }

    #[test]
    fn test_sender_partial_transfer() {
        let blocks = test_blocks(3);
        let mut responses = vec![Some(ACK)];
        responses.extend(std::iter::repeat(None).take(11));
        let mut order = vec![0];
        order.extend(std::iter::repeat(1).take(11));
        let mock = MockSerialPort::new(responses, frames(&blocks, &order));

        let report = run(sender(mock, blocks, RecordingPacer::default()).start()).unwrap();

        assert_eq!(report.outcome, TransferOutcome::Aborted { acked_blocks: 1 });
        assert_eq!(report.acked_blocks, 1);
        assert_eq!(report.total_blocks, 3);
    }

    #[test]
    fn test_sender_block_numbers_wrap() {
        let content = vec![0xA5u8; 300 * BLOCK_SIZE];
        let blocks = framer::chunk(&content);

        let mut expected_writes = Vec::new();
        for number in (1..=255u8).chain(1..=45u8) {
            expected_writes.extend(framer::build_frame(number, &[0xA5; BLOCK_SIZE]).unwrap());
        }
        let mock = MockSerialPort::new(vec![Some(ACK); 300], expected_writes);

        let report = run(sender(mock, blocks, RecordingPacer::default()).start()).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.acked_blocks, 300);
        assert_eq!(report.frames_sent, 300);
    }

    #[test]
    fn test_sender_pacing() {
        let blocks = test_blocks(1);
        let mock = MockSerialPort::new(vec![Some(NAK), Some(NAK), Some(ACK)], frames(&blocks, &[0, 0, 0]));
        let pacer = RecordingPacer::default();

        run(sender(mock, blocks, pacer.clone()).start()).unwrap();

        assert_eq!(
            *pacer.0.lock().unwrap(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(30),
                Duration::from_secs(3),
            ]
        );
    }

    #[test]
    fn test_sender_trailing_response() {
        let blocks = test_blocks(1);
        let mock = MockSerialPort::new(vec![Some(ACK)], frames(&blocks, &[0]))
            .with_trailing(b"XIC:<HK>");

        let report = run(sender(mock, blocks, RecordingPacer::default()).start()).unwrap();

        assert_eq!(report.trailing, b"XIC:<HK>");
    }

    #[test]
    fn test_sender_events() {
        let blocks = test_blocks(2);
        let mock = MockSerialPort::new(vec![Some(ACK), Some(NAK), Some(ACK)], frames(&blocks, &[0, 1, 1]));
        let observer = RecordingObserver::default();

        let fsm = sender(mock, blocks, RecordingPacer::default()).with_observer(observer.clone());
        run(fsm.start()).unwrap();

        assert_eq!(
            *observer.0.lock().unwrap(),
            vec![
                TransferEvent::FrameSent { block: 0, number: 1, attempt: 1 },
                TransferEvent::Acknowledged { acked: 1, total: 2 },
                TransferEvent::FrameSent { block: 1, number: 2, attempt: 1 },
                TransferEvent::Retrying {
                    block: 1,
                    total: 2,
                    retries: 1,
                    response: Response::Nak,
                    delay: Duration::from_millis(100),
                },
                TransferEvent::FrameSent { block: 1, number: 2, attempt: 2 },
                TransferEvent::Acknowledged { acked: 2, total: 2 },
                TransferEvent::Completed { total: 2 },
            ]
        );
    }

    #[test]
    fn test_sender_transport_failure_is_fatal() {
        let fsm = sender_with(
            Box::new(DisconnectedPort),
            test_blocks(1),
            SenderConfig::default(),
            RecordingPacer::default(),
        );

        match run(fsm.start()) {
            Err(SenderError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe);
                assert!(e.to_string().contains("AwaitingResponse"));
            }
            other => panic!("Expected I/O error, got {:?}", other.map(|r| r.outcome)),
        }
    }

    #[test]
    fn test_sender_no_blocks() {
        let mock = MockSerialPort::new(Vec::new(), Vec::new());

        let report = run(sender(mock, Vec::new(), RecordingPacer::default()).start()).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.frames_sent, 0);
    }
}
