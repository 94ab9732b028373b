//! Bounded FIFO port channels
//!
//! Every port is a `tokio::sync::mpsc` channel carrying serialized
//! [`Message`]s. Writers never block on a full port; they back off for a
//! fixed interval and try again.

use ramlet_core::{Message, RamletError, RamletResult};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

struct PortSlot {
    tx: mpsc::Sender<String>,
    rx: Option<mpsc::Receiver<String>>,
}

impl PortSlot {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx: Some(rx) }
    }
}

/// All ports of one runtime
pub struct PortRegistry {
    capacity: usize,
    backoff: Duration,
    slots: Mutex<HashMap<u16, PortSlot>>,
}

impl PortRegistry {
    pub fn new(capacity: usize, backoff: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            backoff,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<u16, PortSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sender(&self, port: u16) -> mpsc::Sender<String> {
        let capacity = self.capacity;
        self.slots()
            .entry(port)
            .or_insert_with(|| PortSlot::new(capacity))
            .tx
            .clone()
    }

    /// Take the reading end of a port.
    ///
    /// Messages written before the port was opened are kept. A port whose
    /// previous reader went away is recreated empty.
    pub fn open(&self, port: u16) -> RamletResult<PortReader> {
        let capacity = self.capacity;
        let mut slots = self.slots();
        let slot = slots
            .entry(port)
            .or_insert_with(|| PortSlot::new(capacity));
        if slot.rx.is_none() {
            if !slot.tx.is_closed() {
                return Err(RamletError::Internal(format!(
                    "port {} already has a reader",
                    port
                )));
            }
            *slot = PortSlot::new(capacity);
        }
        let rx = slot
            .rx
            .take()
            .ok_or_else(|| RamletError::Internal(format!("port {} unavailable", port)))?;
        Ok(PortReader { port, rx })
    }

    /// Single write attempt
    pub fn try_write(&self, port: u16, message: &Message) -> RamletResult<()> {
        match self.sender(port).try_send(message.encode()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RamletError::DeliveryBlocked(port)),
            Err(TrySendError::Closed(_)) => Err(RamletError::ChannelClosed(port)),
        }
    }

    /// Write, retrying after the fixed back-off while the port is full
    pub async fn write(&self, port: u16, message: &Message) -> RamletResult<()> {
        let mut raw = message.encode();
        loop {
            match self.sender(port).try_send(raw) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    debug!(port = port, "Port full, retrying");
                    raw = back;
                    tokio::time::sleep(self.backoff).await;
                }
                Err(TrySendError::Closed(_)) => return Err(RamletError::ChannelClosed(port)),
            }
        }
    }

    /// Messages waiting on a port that has no reader yet, or its reader's backlog
    pub fn pending(&self, port: u16) -> usize {
        self.slots()
            .get(&port)
            .map(|slot| slot.tx.max_capacity() - slot.tx.capacity())
            .unwrap_or(0)
    }
}

/// Reading end of one port
pub struct PortReader {
    port: u16,
    rx: mpsc::Receiver<String>,
}

impl PortReader {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next message if one is waiting; malformed entries are skipped
    pub fn try_read(&mut self) -> Option<Message> {
        while let Ok(raw) = self.rx.try_recv() {
            if let Some(message) = self.decode(&raw) {
                return Some(message);
            }
        }
        None
    }

    /// Wait for the next message
    pub async fn read(&mut self) -> Option<Message> {
        while let Some(raw) = self.rx.recv().await {
            if let Some(message) = self.decode(&raw) {
                return Some(message);
            }
        }
        None
    }

    /// Refuse further writes; messages already buffered can still be read
    pub fn close(&mut self) {
        self.rx.close();
    }

    fn decode(&self, raw: &str) -> Option<Message> {
        match Message::decode(raw) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(port = self.port, error = %e, "Dropping malformed message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramlet_core::{LogLine, Request, TaskId};

    fn log(text: &str) -> Message {
        Message::Log(LogLine {
            source: None,
            label: "test".into(),
            text: text.into(),
        })
    }

    #[test]
    fn test_fifo_and_buffer_before_open() {
        let ports = PortRegistry::new(4, Duration::from_millis(10));
        ports.try_write(20, &log("first")).unwrap();
        ports.try_write(20, &log("second")).unwrap();
        assert_eq!(ports.pending(20), 2);

        let mut reader = ports.open(20).unwrap();
        assert_eq!(reader.try_read(), Some(log("first")));
        assert_eq!(reader.try_read(), Some(log("second")));
        assert_eq!(reader.try_read(), None);
    }

    #[test]
    fn test_full_port_blocks_delivery() {
        let ports = PortRegistry::new(1, Duration::from_millis(10));
        ports.try_write(19, &log("a")).unwrap();
        let err = ports.try_write(19, &log("b")).unwrap_err();
        assert!(matches!(err, RamletError::DeliveryBlocked(19)));
    }

    #[test]
    fn test_second_reader_rejected_until_closed() {
        let ports = PortRegistry::new(4, Duration::from_millis(10));
        let reader = ports.open(19).unwrap();
        assert!(ports.open(19).is_err());

        drop(reader);
        let err = ports.try_write(19, &log("late")).unwrap_err();
        assert!(matches!(err, RamletError::ChannelClosed(19)));
        assert!(ports.open(19).is_ok());
    }

    #[test]
    fn test_close_keeps_buffered_messages() {
        let ports = PortRegistry::new(4, Duration::from_millis(10));
        let mut reader = ports.open(19).unwrap();
        ports.try_write(19, &log("buffered")).unwrap();

        reader.close();
        let err = ports.try_write(19, &log("refused")).unwrap_err();
        assert!(matches!(err, RamletError::ChannelClosed(19)));
        assert_eq!(reader.try_read(), Some(log("buffered")));
        assert_eq!(reader.try_read(), None);

        let mut reopened = ports.open(19).unwrap();
        ports.try_write(19, &log("fresh")).unwrap();
        assert_eq!(reopened.try_read(), Some(log("fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_retries_until_space() {
        let ports = std::sync::Arc::new(PortRegistry::new(1, Duration::from_millis(200)));
        let mut reader = ports.open(20).unwrap();
        ports.try_write(20, &log("filler")).unwrap();

        let mut reply = Request::action("Weaken", "weaken");
        reply.id = Some(TaskId(7));
        let writer = {
            let ports = ports.clone();
            let reply = Message::Reply(reply.clone());
            tokio::spawn(async move { ports.write(20, &reply).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!writer.is_finished());
        assert_eq!(reader.try_read(), Some(log("filler")));

        writer.await.unwrap().unwrap();
        assert_eq!(reader.read().await, Some(Message::Reply(reply)));
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let ports = PortRegistry::new(4, Duration::from_millis(10));
        ports.sender(20).try_send("not json".to_string()).unwrap();
        ports.try_write(20, &log("ok")).unwrap();
        let mut reader = ports.open(20).unwrap();
        assert_eq!(reader.try_read(), Some(log("ok")));
    }
}
