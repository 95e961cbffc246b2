use crate::broker::ConnectionId;
use bytes::Bytes;
use log::trace;
use mqtt_router::types::{ClientId, DeliveryState, Direction, MessageRef, QoS};
use std::collections::{hash_map::Entry, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    #[error("unknown message {0:?}")]
    UnknownMessage(MessageRef),
    #[error("client {client_id} has no delivery with message id {message_id}")]
    UnknownDelivery { client_id: ClientId, message_id: u16 },
    #[error("client {client_id} already has a delivery with message id {message_id}")]
    DuplicateDelivery { client_id: ClientId, message_id: u16 },
    #[error("delivery {message_id} of client {client_id} is in state {state:?}")]
    UnexpectedState { client_id: ClientId, message_id: u16, state: DeliveryState },
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// A stored record of one message on its way to or from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub message_id: u16,
    pub direction: Direction,
    pub state: DeliveryState,
    pub qos: QoS,
    pub message: MessageRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

/// Persistence collaborator of the broker: clients, message payloads,
/// delivery records, message id counters and retained messages.
pub trait Store {
    /// Register a client, or point an existing record at a new connection.
    /// A new record starts with its message id counter at 0.
    fn client_insert(&mut self, client_id: &str, socket: ConnectionId) -> Result<(), StoreError>;

    /// Forget a client together with all of its delivery records.
    fn client_delete(&mut self, client_id: &str) -> Result<(), StoreError>;

    /// The connection a client is currently reachable on.
    fn find_socket(&self, client_id: &str) -> Option<ConnectionId>;

    /// Mark a client as offline without dropping its session state.
    fn invalidate_socket(&mut self, client_id: &str) -> Result<(), StoreError>;

    fn store_message(
        &mut self,
        topic: &str,
        qos: QoS,
        payload: Bytes,
    ) -> Result<MessageRef, StoreError>;

    fn message(&self, message: MessageRef) -> Option<&StoredMessage>;

    /// Drop a stored message if no delivery record refers to it anymore.
    fn release_message(&mut self, message: MessageRef);

    fn mark_delivery(&mut self, client_id: &str, record: DeliveryRecord) -> Result<(), StoreError>;

    /// Move a delivery from state `from` to state `to`. A delivery in any
    /// other state is left alone.
    fn update_delivery(
        &mut self,
        client_id: &str,
        message_id: u16,
        direction: Direction,
        from: DeliveryState,
        to: DeliveryState,
    ) -> Result<(), StoreError>;

    /// Forget a delivery, but only when it is in the `expected` state.
    fn delete_delivery(
        &mut self,
        client_id: &str,
        message_id: u16,
        expected: DeliveryState,
    ) -> Result<DeliveryRecord, StoreError>;

    /// Deliveries still waiting on the client, oldest first.
    fn deliveries(&self, client_id: &str) -> Vec<DeliveryRecord>;

    fn delete_deliveries(&mut self, client_id: &str) -> Result<(), StoreError>;

    /// Read, advance and persist the client's message id counter.
    /// See [`next_message_id`].
    fn alloc_message_id(&mut self, client_id: &str) -> Result<u16, StoreError>;

    fn retain_upsert(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), StoreError>;

    /// The retained message stored under exactly `topic`. The broker only
    /// writes retained messages, sending them to new subscribers is left to
    /// the caller.
    fn retain_lookup(&self, topic: &str) -> Option<(QoS, Bytes)>;
}

/// The message id following `last`. Ids run from 1 to 65535 and wrap back
/// to 1, 0 is never handed out because it means "no id".
pub fn next_message_id(last: u16) -> u16 {
    let last = if last == u16::MAX { 0 } else { last };
    last + 1
}

#[derive(Debug, Default)]
struct ClientRecord {
    socket: Option<ConnectionId>,
    last_message_id: u16,
    deliveries: Vec<DeliveryRecord>,
}

#[derive(Debug)]
struct MessageEntry {
    message: StoredMessage,
    references: usize,
}

/// A `Store` which keeps everything in memory for the lifetime of the broker.
#[derive(Debug, Default)]
pub struct MemoryStore {
    clients: HashMap<ClientId, ClientRecord>,
    messages: HashMap<MessageRef, MessageEntry>,
    retained: HashMap<String, (QoS, Bytes)>,
    message_counter: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_mut(&mut self, client_id: &str) -> Result<&mut ClientRecord, StoreError> {
        self.clients.get_mut(client_id).ok_or_else(|| StoreError::UnknownClient(client_id.into()))
    }

    fn drop_reference(&mut self, message: MessageRef) {
        if let Entry::Occupied(mut entry) = self.messages.entry(message) {
            let message_entry = entry.get_mut();
            message_entry.references = message_entry.references.saturating_sub(1);

            if message_entry.references == 0 {
                trace!("Dropping stored message {:?}", message);
                entry.remove();
            }
        }
    }
}

impl Store for MemoryStore {
    fn client_insert(&mut self, client_id: &str, socket: ConnectionId) -> Result<(), StoreError> {
        self.clients.entry(client_id.to_string()).or_default().socket = Some(socket);
        Ok(())
    }

    fn client_delete(&mut self, client_id: &str) -> Result<(), StoreError> {
        self.delete_deliveries(client_id)?;
        self.clients.remove(client_id);
        Ok(())
    }

    fn find_socket(&self, client_id: &str) -> Option<ConnectionId> {
        self.clients.get(client_id).and_then(|client| client.socket)
    }

    fn invalidate_socket(&mut self, client_id: &str) -> Result<(), StoreError> {
        self.client_mut(client_id)?.socket = None;
        Ok(())
    }

    fn store_message(
        &mut self,
        topic: &str,
        qos: QoS,
        payload: Bytes,
    ) -> Result<MessageRef, StoreError> {
        self.message_counter += 1;
        let message_ref = MessageRef(self.message_counter);
        let message = StoredMessage { topic: topic.to_string(), qos, payload };

        self.messages.insert(message_ref, MessageEntry { message, references: 0 });

        Ok(message_ref)
    }

    fn message(&self, message: MessageRef) -> Option<&StoredMessage> {
        self.messages.get(&message).map(|entry| &entry.message)
    }

    fn release_message(&mut self, message: MessageRef) {
        if self.messages.get(&message).map(|entry| entry.references == 0).unwrap_or(false) {
            self.messages.remove(&message);
        }
    }

    fn mark_delivery(&mut self, client_id: &str, record: DeliveryRecord) -> Result<(), StoreError> {
        if !self.messages.contains_key(&record.message) {
            return Err(StoreError::UnknownMessage(record.message));
        }

        let client = self.client_mut(client_id)?;

        // QoS 0 deliveries are never acknowledged, nothing to keep.
        if record.message_id == 0 {
            return Ok(());
        }

        if client.deliveries.iter().any(|d| d.message_id == record.message_id) {
            return Err(StoreError::DuplicateDelivery {
                client_id: client_id.into(),
                message_id: record.message_id,
            });
        }

        let message = record.message;
        client.deliveries.push(record);

        if let Some(entry) = self.messages.get_mut(&message) {
            entry.references += 1;
        }

        Ok(())
    }

    fn update_delivery(
        &mut self,
        client_id: &str,
        message_id: u16,
        direction: Direction,
        from: DeliveryState,
        to: DeliveryState,
    ) -> Result<(), StoreError> {
        let client = self.client_mut(client_id)?;

        match client
            .deliveries
            .iter_mut()
            .find(|d| d.message_id == message_id && d.direction == direction)
        {
            Some(delivery) if delivery.state == from => {
                delivery.state = to;
                Ok(())
            },
            Some(delivery) => Err(StoreError::UnexpectedState {
                client_id: client_id.into(),
                message_id,
                state: delivery.state,
            }),
            None => Err(StoreError::UnknownDelivery { client_id: client_id.into(), message_id }),
        }
    }

    fn delete_delivery(
        &mut self,
        client_id: &str,
        message_id: u16,
        expected: DeliveryState,
    ) -> Result<DeliveryRecord, StoreError> {
        let client = self.client_mut(client_id)?;

        let pos = client
            .deliveries
            .iter()
            .position(|d| d.message_id == message_id)
            .ok_or_else(|| StoreError::UnknownDelivery { client_id: client_id.into(), message_id })?;

        let state = client.deliveries[pos].state;
        if state != expected {
            return Err(StoreError::UnexpectedState { client_id: client_id.into(), message_id, state });
        }

        let record = client.deliveries.remove(pos);
        self.drop_reference(record.message);

        Ok(record)
    }

    fn deliveries(&self, client_id: &str) -> Vec<DeliveryRecord> {
        self.clients.get(client_id).map(|client| client.deliveries.clone()).unwrap_or_default()
    }

    fn delete_deliveries(&mut self, client_id: &str) -> Result<(), StoreError> {
        let records = match self.clients.get_mut(client_id) {
            Some(client) => std::mem::take(&mut client.deliveries),
            None => return Ok(()),
        };

        for record in records {
            self.drop_reference(record.message);
        }

        Ok(())
    }

    fn alloc_message_id(&mut self, client_id: &str) -> Result<u16, StoreError> {
        let client = self.client_mut(client_id)?;

        // TODO - Skip ids which are still inflight after the counter wraps.
        let message_id = next_message_id(client.last_message_id);
        client.last_message_id = message_id;

        Ok(message_id)
    }

    fn retain_upsert(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), StoreError> {
        self.retained.insert(topic.to_string(), (qos, payload));
        Ok(())
    }

    fn retain_lookup(&self, topic: &str) -> Option<(QoS, Bytes)> {
        self.retained.get(topic).cloned()
    }
}
