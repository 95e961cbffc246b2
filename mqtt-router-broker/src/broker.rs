use crate::{
    fanout::{fan_out, Publication, Subscriber},
    store::{MemoryStore, Store},
    tree::SubscriptionTree,
};
use bytes::Bytes;
use log::{debug, info, trace, warn};
use mqtt_router::{
    topic::{Namespace, TopicTokens},
    types::{ClientId, DeliveryState, Direction, QoS, RouterError},
};
use nanoid::nanoid;
use std::collections::{hash_map::Entry, HashMap};
use tokio::sync::{
    mpsc::{self, Receiver, Sender},
    oneshot,
};

/// Unique identifier for a connection
pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// An empty client ID gets a generated one.
    pub client_id: ClientId,
    pub clean_session: bool,
    pub bridge: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    /// Required for QoS 1 and 2.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPublish {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub message_id: Option<u16>,
    pub is_duplicate: bool,
    pub payload: Bytes,
}

/// Messages the broker sends to a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    ConnectAck { client_id: ClientId, session_present: bool },
    SubscribeAck(Vec<Result<QoS, RouterError>>),
    UnsubscribeAck(Vec<Result<(), RouterError>>),
    Publish(OutgoingPublish),
    PublishAck(u16),
    PublishReceived(u16),
    PublishRelease(u16),
    PublishComplete(u16),
    /// The session was taken over by a new connection.
    Disconnect,
}

#[derive(Debug)]
pub enum BrokerMessage {
    Connect(ConnectionId, ConnectRequest, Sender<ClientMessage>),
    Disconnect(ConnectionId, ClientId),
    Subscribe(ClientId, Vec<(String, QoS)>),
    Unsubscribe(ClientId, Vec<String>),
    Publish(ClientId, PublishRequest),
    PublishAck(ClientId, u16),
    PublishReceived(ClientId, u16),
    PublishRelease(ClientId, u16),
    PublishComplete(ClientId, u16),
    DumpTree(Namespace, oneshot::Sender<String>),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Capacity of the channel feeding `BrokerMessage`s to the broker task.
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { channel_capacity: 100 }
    }
}

#[derive(Debug)]
struct Session {
    connection_id: ConnectionId,
    client_sender: Option<Sender<ClientMessage>>,
    clean_session: bool,
    bridge: bool,

    // Used to unsubscribe from topics when the session ends
    subscriptions: Vec<String>,

    // Inbound QoS 2 packet IDs we sent PUBREC for and haven't seen PUBREL for.
    incoming_publish_receives: Vec<u16>,
}

impl Session {
    fn new(
        connection_id: ConnectionId,
        request: &ConnectRequest,
        client_sender: Sender<ClientMessage>,
    ) -> Self {
        Self {
            connection_id,
            client_sender: Some(client_sender),
            clean_session: request.clean_session,
            bridge: request.bridge,
            subscriptions: Vec::new(),
            incoming_publish_receives: Vec::new(),
        }
    }

    /// Turn self, an existing Session, into a session for a client which
    /// just reconnected. Subscriptions and the bridge flag carry over.
    fn into_resumed_session(
        self,
        connection_id: ConnectionId,
        client_sender: Sender<ClientMessage>,
    ) -> Self {
        Self { connection_id, client_sender: Some(client_sender), ..self }
    }

    fn subscriber(&self, client_id: &str) -> Subscriber {
        Subscriber { client_id: client_id.to_string(), bridge: self.bridge }
    }

    /// Attempt to send a `ClientMessage` to the client via the channel handle.
    /// If the channel is closed, the handle is removed from the session.
    async fn send(&mut self, message: ClientMessage) {
        if let Some(ref client_sender) = self.client_sender {
            if client_sender.send(message).await.is_err() {
                warn!("Failed to send message to client. Dropping sender");
                self.client_sender.take();
            }
        }
    }
}

pub struct Broker<S = MemoryStore> {
    sessions: HashMap<ClientId, Session>,
    sender: Sender<BrokerMessage>,
    receiver: Receiver<BrokerMessage>,
    subscriptions: SubscriptionTree<Subscriber>,
    store: S,
}

impl Default for Broker {
    fn default() -> Self {
        Broker::new()
    }
}

impl Broker {
    /// Construct a new Broker backed by a `MemoryStore`.
    pub fn new() -> Broker {
        Broker::with_store(MemoryStore::new(), BrokerConfig::default())
    }
}

impl<S: Store> Broker<S> {
    /// Construct a new Broker with a custom store.
    pub fn with_store(store: S, config: BrokerConfig) -> Broker<S> {
        let (sender, receiver) = mpsc::channel(config.channel_capacity);

        Broker {
            sessions: HashMap::new(),
            sender,
            receiver,
            subscriptions: SubscriptionTree::new(),
            store,
        }
    }

    pub fn sender(&self) -> Sender<BrokerMessage> {
        self.sender.clone()
    }

    async fn handle_connect(
        &mut self,
        connection_id: ConnectionId,
        request: ConnectRequest,
        client_sender: Sender<ClientMessage>,
    ) {
        let client_id =
            if request.client_id.is_empty() { nanoid!() } else { request.client_id.clone() };

        if let Some(old_connection_id) = self.store.find_socket(&client_id) {
            if old_connection_id != connection_id {
                info!(
                    "Client {} already connected on connection {}, closing old connection",
                    client_id, old_connection_id
                );
            }
        }

        let mut session_present = false;

        let mut session = match self.sessions.remove(&client_id) {
            Some(mut existing_session) => {
                if let Some(old_sender) = existing_session.client_sender.take() {
                    if let Err(e) = old_sender.try_send(ClientMessage::Disconnect) {
                        warn!("Failed to send disconnect to taken-over session - {:?}", e);
                    }
                }

                if request.clean_session || existing_session.clean_session {
                    self.end_session(&client_id, existing_session);
                    Session::new(connection_id, &request, client_sender)
                } else {
                    session_present = true;
                    existing_session.into_resumed_session(connection_id, client_sender)
                }
            },
            None => Session::new(connection_id, &request, client_sender),
        };

        if let Err(err) = self.store.client_insert(&client_id, connection_id) {
            warn!("Failed to store client {}: {}", client_id, err);
        }

        info!(
            "Client ID {} connected on connection {} (clean session: {}, bridge: {})",
            client_id, connection_id, session.clean_session, session.bridge
        );

        session
            .send(ClientMessage::ConnectAck { client_id: client_id.clone(), session_present })
            .await;

        if session_present {
            for message in self.pending_messages(&client_id) {
                session.send(message).await;
            }
        }

        self.sessions.insert(client_id, session);
    }

    /// Deliveries the client never acknowledged, to be sent again after it
    /// reconnects.
    fn pending_messages(&self, client_id: &str) -> Vec<ClientMessage> {
        self.store
            .deliveries(client_id)
            .into_iter()
            .filter(|record| record.direction == Direction::Outbound)
            .filter_map(|record| match record.state {
                DeliveryState::PublishAwaitingAck | DeliveryState::PublishAwaitingReceipt => {
                    let message = self.store.message(record.message)?;

                    Some(ClientMessage::Publish(OutgoingPublish {
                        topic: message.topic.clone(),
                        qos: record.qos,
                        retain: false,
                        message_id: Some(record.message_id),
                        is_duplicate: true,
                        payload: message.payload.clone(),
                    }))
                },
                DeliveryState::ReleaseAwaitingComplete => {
                    Some(ClientMessage::PublishRelease(record.message_id))
                },
                DeliveryState::Publish => None,
            })
            .collect()
    }

    /// Remove every subscription the session held and forget the client.
    fn end_session(&mut self, client_id: &str, session: Session) {
        let subscriber = session.subscriber(client_id);

        for topic in &session.subscriptions {
            if let Err(err) = self.subscriptions.unsubscribe(topic, &subscriber) {
                warn!("Failed to remove subscription \"{}\" of {}: {}", topic, client_id, err);
            }
        }

        if let Err(err) = self.store.client_delete(client_id) {
            warn!("Failed to delete client {}: {}", client_id, err);
        }

        debug!("Ended session of client ID {}", client_id);
    }

    fn handle_disconnect(&mut self, connection_id: ConnectionId, client_id: ClientId) {
        if let Entry::Occupied(mut entry) = self.sessions.entry(client_id.clone()) {
            if entry.get().connection_id != connection_id {
                debug!(
                    "Ignoring disconnect of connection {}, client ID {} has moved on",
                    connection_id, client_id
                );
                return;
            }

            info!("Client ID {} disconnected", client_id);

            if entry.get().clean_session {
                let session = entry.remove();
                self.end_session(&client_id, session);
            } else {
                entry.get_mut().client_sender.take();

                if let Err(err) = self.store.invalidate_socket(&client_id) {
                    warn!("Failed to mark client {} offline: {}", client_id, err);
                }
            }
        }
    }

    async fn handle_subscribe(&mut self, client_id: ClientId, topics: Vec<(String, QoS)>) {
        let session = match self.sessions.get_mut(&client_id) {
            Some(session) => session,
            None => {
                warn!("Ignoring subscribe from unknown client ID {}", client_id);
                return;
            },
        };

        let mut granted = Vec::with_capacity(topics.len());

        for (topic, qos) in topics {
            let subscriber = session.subscriber(&client_id);

            match self.subscriptions.subscribe(&topic, subscriber, qos) {
                Ok(previous_qos) => {
                    debug!("Client ID {} subscribed to \"{}\" ({:?})", client_id, topic, qos);

                    if previous_qos.is_none() {
                        session.subscriptions.push(topic);
                    }

                    granted.push(Ok(qos));
                },
                Err(err) => {
                    warn!("Client ID {} failed to subscribe to \"{}\": {}", client_id, topic, err);
                    granted.push(Err(err));
                },
            }
        }

        session.send(ClientMessage::SubscribeAck(granted)).await;
    }

    async fn handle_unsubscribe(&mut self, client_id: ClientId, topics: Vec<String>) {
        let session = match self.sessions.get_mut(&client_id) {
            Some(session) => session,
            None => {
                warn!("Ignoring unsubscribe from unknown client ID {}", client_id);
                return;
            },
        };

        let subscriber = session.subscriber(&client_id);
        let mut results = Vec::with_capacity(topics.len());

        for topic in topics {
            match self.subscriptions.unsubscribe(&topic, &subscriber) {
                Ok(_) => {
                    debug!("Client ID {} unsubscribed from \"{}\"", client_id, topic);
                    session.subscriptions.retain(|t| *t != topic);
                    results.push(Ok(()));
                },
                Err(err) => results.push(Err(err)),
            }
        }

        session.send(ClientMessage::UnsubscribeAck(results)).await;
    }

    async fn handle_publish(&mut self, client_id: ClientId, publish: PublishRequest) {
        let session = match self.sessions.get_mut(&client_id) {
            Some(session) => session,
            None => {
                warn!("Discarding publish from unknown client ID {}", client_id);
                return;
            },
        };

        // An invalid topic is neither acknowledged nor stored.
        if let Err(err) = TopicTokens::tokenize(&publish.topic) {
            warn!("Discarding publish from client ID {}: {}", client_id, err);
            return;
        }

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {},
            (QoS::AtLeastOnce, Some(packet_id)) => {
                session.send(ClientMessage::PublishAck(packet_id)).await;
            },
            // For QoS2, ensure this packet isn't delivered twice. If we already sent
            // a PUBREC for this ID, send it again but don't forward the message.
            (QoS::ExactlyOnce, Some(packet_id)) => {
                let is_dup = session.incoming_publish_receives.contains(&packet_id);

                if !is_dup {
                    session.incoming_publish_receives.push(packet_id);
                }

                session.send(ClientMessage::PublishReceived(packet_id)).await;

                if is_dup {
                    return;
                }
            },
            (qos, None) => {
                warn!("Publish packet with {:?} without packet id from client ID {}", qos, client_id);
                return;
            },
        }

        self.publish_message(&client_id, publish).await;
    }

    async fn publish_message(&mut self, source_id: &str, publish: PublishRequest) {
        if publish.retain {
            if let Err(err) =
                self.store.retain_upsert(&publish.topic, publish.qos, publish.payload.clone())
            {
                warn!("Failed to retain message on \"{}\": {}", publish.topic, err);
            }
        }

        let message =
            match self.store.store_message(&publish.topic, publish.qos, publish.payload.clone()) {
                Ok(message) => message,
                Err(err) => {
                    warn!("Failed to store message on \"{}\": {}", publish.topic, err);
                    return;
                },
            };

        let publication = Publication {
            source_id,
            topic: &publish.topic,
            qos: publish.qos,
            retain: publish.retain,
            message,
        };

        let report = match fan_out(&self.subscriptions, &mut self.store, &publication) {
            Ok(report) => report,
            Err(err) => {
                warn!("Failed to route message on \"{}\": {}", publish.topic, err);
                self.store.release_message(message);
                return;
            },
        };

        for delivery in &report.deliveries {
            if let Some(session) = self.sessions.get_mut(&delivery.client_id) {
                let outgoing_packet = OutgoingPublish {
                    topic: publish.topic.clone(),
                    qos: delivery.qos,
                    // Live deliveries never carry the retain flag.
                    retain: false,
                    message_id: Some(delivery.message_id).filter(|id| *id != 0),
                    is_duplicate: false,
                    payload: publish.payload.clone(),
                };

                session.send(ClientMessage::Publish(outgoing_packet)).await;
            }
        }

        if let Err(err) = report.into_result() {
            warn!("Message on \"{}\" from {} not fully routed: {}", publish.topic, source_id, err);
        }

        self.store.release_message(message);
    }

    fn handle_publish_ack(&mut self, client_id: ClientId, packet_id: u16) {
        match self.store.delete_delivery(&client_id, packet_id, DeliveryState::PublishAwaitingAck)
        {
            Ok(_) => trace!("Client ID {} acknowledged message {}", client_id, packet_id),
            Err(err) => warn!("Unexpected PUBACK from client ID {}: {}", client_id, err),
        }
    }

    async fn handle_publish_received(&mut self, client_id: ClientId, packet_id: u16) {
        if let Err(err) = self.store.update_delivery(
            &client_id,
            packet_id,
            Direction::Outbound,
            DeliveryState::PublishAwaitingReceipt,
            DeliveryState::ReleaseAwaitingComplete,
        ) {
            warn!("Unexpected PUBREC from client ID {}: {}", client_id, err);
            return;
        }

        if let Some(session) = self.sessions.get_mut(&client_id) {
            session.send(ClientMessage::PublishRelease(packet_id)).await;
        }
    }

    async fn handle_publish_release(&mut self, client_id: ClientId, packet_id: u16) {
        if let Some(session) = self.sessions.get_mut(&client_id) {
            if let Some(pos) =
                session.incoming_publish_receives.iter().position(|x| *x == packet_id)
            {
                session.incoming_publish_receives.remove(pos);
                session.send(ClientMessage::PublishComplete(packet_id)).await;
            }
        }
    }

    fn handle_publish_complete(&mut self, client_id: ClientId, packet_id: u16) {
        match self.store.delete_delivery(
            &client_id,
            packet_id,
            DeliveryState::ReleaseAwaitingComplete,
        ) {
            Ok(_) => trace!("Client ID {} completed message {}", client_id, packet_id),
            Err(err) => warn!("Unexpected PUBCOMP from client ID {}: {}", client_id, err),
        }
    }

    pub async fn run(mut self) {
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                BrokerMessage::Connect(connection_id, request, client_msg_sender) => {
                    self.handle_connect(connection_id, request, client_msg_sender).await;
                },
                BrokerMessage::Disconnect(connection_id, client_id) => {
                    self.handle_disconnect(connection_id, client_id);
                },
                BrokerMessage::Subscribe(client_id, topics) => {
                    self.handle_subscribe(client_id, topics).await;
                },
                BrokerMessage::Unsubscribe(client_id, topics) => {
                    self.handle_unsubscribe(client_id, topics).await;
                },
                BrokerMessage::Publish(client_id, publish) => {
                    self.handle_publish(client_id, publish).await;
                },
                BrokerMessage::PublishAck(client_id, packet_id) => {
                    self.handle_publish_ack(client_id, packet_id);
                },
                BrokerMessage::PublishReceived(client_id, packet_id) => {
                    self.handle_publish_received(client_id, packet_id).await;
                },
                BrokerMessage::PublishRelease(client_id, packet_id) => {
                    self.handle_publish_release(client_id, packet_id).await;
                },
                BrokerMessage::PublishComplete(client_id, packet_id) => {
                    self.handle_publish_complete(client_id, packet_id);
                },
                BrokerMessage::DumpTree(namespace, reply) => {
                    drop(reply.send(self.subscriptions.dump(namespace).to_string()));
                },
            }
        }
    }
}
