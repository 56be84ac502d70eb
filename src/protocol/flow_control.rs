//! Tor SENDME Flow Control
//!
//! Implements Tor's flow control mechanism to prevent buffer overflow.
//!
//! ## How It Works:
//!
//! 1. **Windows:** Each stream and circuit has send/receive windows
//! 2. **Decrement:** Window decrements on each DATA cell sent/received
//! 3. **SENDME:** When the reader has consumed one increment, send SENDME
//! 4. **Increment:** Receiving SENDME increments the opposite send window
//!
//! ## Window Values (from Tor spec):
//!
//! - **Initial window:** 1000 cells (circuit), 500 cells (stream)
//! - **Increment:** 100 cells per SENDME (circuit), 50 cells (stream)
//!
//! Writers block on the send window until SENDME credit arrives, or until
//! the circuit or stream goes away.

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{Result, TorError};

/// Initial circuit window size (Tor spec: 1000 cells)
pub const CIRCUIT_WINDOW: u16 = 1000;
/// Circuit window increment per SENDME (Tor spec: 100 cells)
pub const CIRCUIT_INCREMENT: u16 = 100;
/// Initial stream window size (Tor spec: 500 cells)
pub const STREAM_WINDOW: u16 = 500;
/// Stream window increment per SENDME (Tor spec: 50 cells)
pub const STREAM_INCREMENT: u16 = 50;

/// Credit for outgoing DATA cells
///
/// One permit per cell. SENDME adds `increment` permits; closing the
/// window wakes every waiter with an error.
#[derive(Debug)]
pub struct SendWindow {
    credit: Semaphore,
    initial: u16,
    increment: u16,
}

impl SendWindow {
    pub fn new(initial: u16, increment: u16) -> Self {
        Self {
            credit: Semaphore::new(initial as usize),
            initial,
            increment,
        }
    }

    pub fn circuit() -> Self {
        Self::new(CIRCUIT_WINDOW, CIRCUIT_INCREMENT)
    }

    pub fn stream() -> Self {
        Self::new(STREAM_WINDOW, STREAM_INCREMENT)
    }

    /// Take credit for one cell, waiting for SENDME if exhausted
    pub async fn acquire(&self) -> Result<()> {
        self.reserve().await?.forget();
        Ok(())
    }

    /// Take credit for one cell from this window and from `outer`
    ///
    /// Credit already taken from this window goes back if the call is
    /// abandoned while waiting on `outer`.
    pub async fn acquire_with(&self, outer: &SendWindow) -> Result<()> {
        let inner = self.reserve().await?;
        let outer = outer.reserve().await?;
        inner.forget();
        outer.forget();
        Ok(())
    }

    /// Credit that returns to the window unless forgotten
    async fn reserve(&self) -> Result<SemaphorePermit<'_>> {
        self.credit
            .acquire()
            .await
            .map_err(|_| TorError::Stream("send window closed".into()))
    }

    /// Take credit without waiting
    pub fn try_acquire(&self) -> bool {
        match self.credit.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Handle a SENDME
    ///
    /// A SENDME that would push the window past its initial size is a
    /// protocol violation.
    pub fn replenish(&self) -> Result<()> {
        if self.available() + self.increment as usize > self.initial as usize {
            return Err(TorError::ProtocolError(format!(
                "unexpected SENDME (window {} of {})",
                self.available(),
                self.initial
            )));
        }
        self.credit.add_permits(self.increment as usize);
        log::trace!("send window: {} (+{})", self.available(), self.increment);
        Ok(())
    }

    pub fn available(&self) -> usize {
        self.credit.available_permits()
    }

    /// Fail current and future waiters
    pub fn close(&self) {
        self.credit.close();
    }

    pub fn is_closed(&self) -> bool {
        self.credit.is_closed()
    }
}

/// Receive side accounting
///
/// The peer may send `window` more DATA cells. Every `increment` cells the
/// reader consumes earn it another `increment`, announced with a SENDME,
/// so cells nobody reads keep the window shut.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    window: u16,
    consumed: u16,
    increment: u16,
}

impl RecvWindow {
    pub fn new(initial: u16, increment: u16) -> Self {
        Self {
            window: initial,
            consumed: 0,
            increment,
        }
    }

    pub fn circuit() -> Self {
        Self::new(CIRCUIT_WINDOW, CIRCUIT_INCREMENT)
    }

    pub fn stream() -> Self {
        Self::new(STREAM_WINDOW, STREAM_INCREMENT)
    }

    /// Count one arriving DATA cell
    ///
    /// A peer sending past the window violates the protocol.
    pub fn on_receive(&mut self) -> Result<()> {
        self.window = self
            .window
            .checked_sub(1)
            .ok_or_else(|| TorError::ProtocolError("DATA cell beyond the receive window".into()))?;
        Ok(())
    }

    /// Count one DATA cell handed to the reader
    ///
    /// Returns `true` if we should send a SENDME back
    pub fn on_consume(&mut self) -> bool {
        self.consumed += 1;
        if self.consumed < self.increment {
            return false;
        }
        self.consumed = 0;
        self.window = self.window.saturating_add(self.increment);
        true
    }

    /// Cells the peer may still send
    pub fn available(&self) -> u16 {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_window_exhaustion() {
        let window = SendWindow::new(3, 2);
        for _ in 0..3 {
            window.acquire().await.unwrap();
        }
        assert!(!window.try_acquire());
        assert_eq!(window.available(), 0);

        window.replenish().unwrap();
        assert_eq!(window.available(), 2);
        assert!(window.try_acquire());
    }

    #[tokio::test]
    async fn test_writer_waits_for_sendme() {
        let window = Arc::new(SendWindow::new(1, 1));
        window.acquire().await.unwrap();

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        window.replenish().unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let window = Arc::new(SendWindow::new(0, 1));
        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        window.close();
        assert!(waiter.await.unwrap().is_err());
        assert!(window.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_keeps_stream_credit() {
        let stream = SendWindow::new(1, 1);
        let circuit = SendWindow::new(0, 1);
        let waited = tokio::time::timeout(Duration::from_secs(1), stream.acquire_with(&circuit)).await;
        assert!(waited.is_err());
        assert_eq!(stream.available(), 1);

        circuit.credit.add_permits(1);
        stream.acquire_with(&circuit).await.unwrap();
        assert_eq!(stream.available(), 0);
        assert_eq!(circuit.available(), 0);
    }

    #[test]
    fn test_unexpected_sendme_rejected() {
        let window = SendWindow::stream();
        assert!(window.replenish().is_err());
        assert_eq!(window.available(), STREAM_WINDOW as usize);
    }

    #[test]
    fn test_circuit_recv_window() {
        let mut window = RecvWindow::circuit();
        for _ in 0..CIRCUIT_WINDOW {
            window.on_receive().unwrap();
        }
        for i in 1..=200 {
            let should_sendme = window.on_consume();
            assert_eq!(should_sendme, i % 100 == 0, "cell {}", i);
        }
        assert_eq!(window.available(), 200);
    }

    #[test]
    fn test_unread_cells_keep_stream_window_shut() {
        let mut window = RecvWindow::stream();
        for _ in 0..STREAM_WINDOW {
            window.on_receive().unwrap();
        }
        assert_eq!(window.available(), 0);
        assert!(window.on_receive().is_err());

        let sendmes = (0..STREAM_INCREMENT).filter(|_| window.on_consume()).count();
        assert_eq!(sendmes, 1);
        assert_eq!(window.available(), STREAM_INCREMENT);
        window.on_receive().unwrap();
    }
}
