use core::task::Waker;

use embassy_sync::{
    blocking_mutex::raw::RawMutex,
    channel::{Channel, TrySendError},
    waitqueue::MultiWakerRegistration,
};
use embedded_time::{Clock, Instant, duration};
use heapless::Vec;

use crate::{
    incoming::{Incoming, ReceiptState, Track},
    keep_alive::KeepAlive,
    outgoing::{ExchangeState, Outgoing, Pending, PendingExchange, PendingPublish},
    packet::{
        MAX_FILTERS, Packet, PacketId, QoS,
        connect::{ConnAck, Connect, ConnectOutcome, Options},
        publish::{Flags, Message, Publish},
        subscribe::{SubAckReturnCode, Subscribe, Subscription},
        unsubscribe::Unsubscribe,
    },
    packet_id_pool::PacketIdPool,
    transport::{Link, Transport},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum State {
    Idle,
    AwaitingConnack,
    Established,
    Closed,
}

/// Successful completion of an outbound exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ack {
    /// PUBACK or PUBCOMP arrived. QoS 0 completes as soon as it is sent.
    Published,
    /// One return code per requested filter, in request order.
    Subscribed(Vec<SubAckReturnCode, MAX_FILTERS>),
    Unsubscribed,
}

/// Handed to the application through the client's event queue.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event<const TOPIC: usize, const PAYLOAD: usize> {
    Connected { session_present: bool },
    Message(Message<TOPIC, PAYLOAD>),
}

/// Non-blocking handoff of events to the application.
pub(crate) trait Deliver<const TOPIC: usize, const PAYLOAD: usize> {
    fn try_deliver(&self, event: Event<TOPIC, PAYLOAD>) -> Result<(), Event<TOPIC, PAYLOAD>>;
}

impl<M: RawMutex, const TOPIC: usize, const PAYLOAD: usize, const Q: usize> Deliver<TOPIC, PAYLOAD>
    for Channel<M, Event<TOPIC, PAYLOAD>, Q>
{
    fn try_deliver(&self, event: Event<TOPIC, PAYLOAD>) -> Result<(), Event<TOPIC, PAYLOAD>> {
        self.try_send(event).map_err(|TrySendError::Full(event)| event)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Request {
    Subscribe,
    Unsubscribe,
}

type Completion = (PacketId, Result<Ack, crate::Error>);

pub(crate) struct Session<
    C: Clock,
    const N_OUT: usize,
    const N_IN: usize,
    const TOPIC: usize,
    const PAYLOAD: usize,
> {
    state: State,
    pool: PacketIdPool<N_OUT>,
    outgoing: Outgoing<C, N_OUT, TOPIC, PAYLOAD>,
    incoming: Incoming<N_IN, TOPIC, PAYLOAD>,
    requests: Vec<(PacketId, Request), N_OUT>,
    completions: Vec<Completion, N_OUT>,
    waiters: MultiWakerRegistration<N_OUT>,
    keep_alive: Option<KeepAlive<C>>,
    connect_sent_at: Option<Instant<C>>,
    retry_interval: duration::Generic<C::T>,
    connect_timeout: duration::Generic<C::T>,
}

impl<C: Clock, const N_OUT: usize, const N_IN: usize, const TOPIC: usize, const PAYLOAD: usize>
    Session<C, N_OUT, N_IN, TOPIC, PAYLOAD>
{
    pub(crate) fn new(
        retry_interval: duration::Generic<C::T>,
        connect_timeout: duration::Generic<C::T>,
    ) -> Self {
        Self {
            state: State::Idle,
            pool: PacketIdPool::new(),
            outgoing: Outgoing::new(),
            incoming: Incoming::new(),
            requests: Vec::new(),
            completions: Vec::new(),
            waiters: MultiWakerRegistration::new(),
            keep_alive: None,
            connect_sent_at: None,
            retry_interval,
            connect_timeout,
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    /// Back to Idle after a close, for a connection over a new transport.
    pub(crate) fn reset(&mut self) -> Result<(), crate::Error> {
        if self.state != State::Closed {
            return Err(crate::Error::AlreadyConnected);
        }

        self.state = State::Idle;
        Ok(())
    }

    pub(crate) fn connect<T: Transport>(
        &mut self,
        link: &mut Link<'_, T>,
        options: &Options<'_>,
        now: Instant<C>,
    ) -> Result<(), crate::Error> {
        if self.state != State::Idle {
            return Err(crate::Error::AlreadyConnected);
        }

        link.send(&Packet::Connect(Connect::from(options)))?;

        debug!(
            "CONNECT sent for {}, keep-alive {}s",
            options.client_id, options.keep_alive
        );

        self.keep_alive = Some(KeepAlive::new(now, options.keep_alive));
        self.connect_sent_at = Some(now);
        self.state = State::AwaitingConnack;

        Ok(())
    }

    /// Returns the packet id to wait on, `None` for QoS 0.
    pub(crate) fn publish<T: Transport>(
        &mut self,
        link: &mut Link<'_, T>,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        now: Instant<C>,
    ) -> Result<Option<PacketId>, crate::Error> {
        self.ensure_established()?;

        let mut publish = Publish {
            flags: Flags {
                dup: false,
                qos,
                retain,
            },
            topic,
            packet_id: None,
            payload,
        };

        if qos == QoS::AtMostOnce {
            self.transmit(link, &Packet::Publish(publish), now)?;
            return Ok(None);
        }

        let packet_id = self.pool.allocate()?;
        publish.packet_id = Some(packet_id);

        let tracked = PendingPublish::try_new(packet_id, topic, payload, retain, now)
            .and_then(|pending| {
                let entry = match qos {
                    QoS::AtLeastOnce => Pending::AtLeastOnce(pending),
                    _ => Pending::ExactlyOnce(PendingExchange {
                        publish: pending,
                        state: ExchangeState::AwaitingPubrec,
                    }),
                };

                self.outgoing.track(entry)
            });

        if let Err(err) = tracked {
            self.pool.release(&packet_id);
            return Err(err);
        }

        if let Err(err) = self.transmit(link, &Packet::Publish(publish), now) {
            self.outgoing.remove(&packet_id);
            self.pool.release(&packet_id);
            return Err(err);
        }

        Ok(Some(packet_id))
    }

    pub(crate) fn subscribe<T: Transport>(
        &mut self,
        link: &mut Link<'_, T>,
        filters: &[(&str, QoS)],
        now: Instant<C>,
    ) -> Result<PacketId, crate::Error> {
        self.ensure_established()?;

        if filters.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        let mut topics = Vec::new();

        for &(topic_filter, qos) in filters {
            topics
                .push(Subscription { topic_filter, qos })
                .map_err(|_| crate::Error::VectorIsFull)?;
        }

        let packet_id = self.pool.allocate()?;
        let packet = Packet::Subscribe(Subscribe { packet_id, topics });

        self.request(link, packet_id, Request::Subscribe, &packet, now)?;

        Ok(packet_id)
    }

    pub(crate) fn unsubscribe<T: Transport>(
        &mut self,
        link: &mut Link<'_, T>,
        filters: &[&str],
        now: Instant<C>,
    ) -> Result<PacketId, crate::Error> {
        self.ensure_established()?;

        let packet_id = self.pool.allocate()?;

        let packet = match Unsubscribe::new(packet_id, filters) {
            Ok(unsubscribe) => Packet::Unsubscribe(unsubscribe),
            Err(err) => {
                self.pool.release(&packet_id);
                return Err(err);
            }
        };

        self.request(link, packet_id, Request::Unsubscribe, &packet, now)?;

        Ok(packet_id)
    }

    pub(crate) fn disconnect<T: Transport>(
        &mut self,
        link: &mut Link<'_, T>,
        now: Instant<C>,
    ) -> Result<(), crate::Error> {
        self.ensure_established()?;

        let sent = self.transmit(link, &Packet::Disconnect, now);
        self.close(link);

        sent
    }

    /// Closes the link and fails every pending exchange. Idempotent.
    pub(crate) fn close<T: Transport>(&mut self, link: &mut Link<'_, T>) {
        link.close();

        if self.state == State::Closed {
            return;
        }

        info!("connection closed in state {:?}", self.state);

        self.state = State::Closed;
        self.keep_alive = None;
        self.connect_sent_at = None;
        self.fail_pending();
    }

    /// Runs one inbound packet through the state machine. A returned outcome
    /// resolves the connection attempt.
    pub(crate) fn handle<T: Transport, D: Deliver<TOPIC, PAYLOAD>>(
        &mut self,
        packet: &Packet<'_>,
        link: &mut Link<'_, T>,
        events: &D,
        now: Instant<C>,
    ) -> Result<Option<ConnectOutcome>, crate::Error> {
        if let Some(keep_alive) = self.keep_alive.as_mut() {
            keep_alive.on_receive();
        }

        match self.state {
            State::Idle => {
                error!("{:?} received before CONNECT", packet.packet_type());
                Err(crate::Error::ProtocolViolation)
            }
            State::AwaitingConnack => match packet {
                Packet::ConnAck(ack) => Ok(Some(self.on_connack(ack, link, events))),
                other => {
                    error!("expected CONNACK, got {:?}", other.packet_type());
                    Err(crate::Error::ProtocolViolation)
                }
            },
            State::Established => self.dispatch(packet, link, events, now).map(|_| None),
            State::Closed => {
                debug!("dropping {:?} after close", packet.packet_type());
                Ok(None)
            }
        }
    }

    fn dispatch<T: Transport, D: Deliver<TOPIC, PAYLOAD>>(
        &mut self,
        packet: &Packet<'_>,
        link: &mut Link<'_, T>,
        events: &D,
        now: Instant<C>,
    ) -> Result<(), crate::Error> {
        match packet {
            Packet::ConnAck(_) => {
                warn!("ignoring CONNACK on an established connection");
                Ok(())
            }
            Packet::Publish(publish) => self.on_publish(publish, link, events, now),
            Packet::PubAck(packet_id) => {
                if self.outgoing.on_puback(packet_id) {
                    self.finish(packet_id, Ok(Ack::Published));
                } else {
                    trace!("PUBACK for unknown id {}", packet_id.get());
                }
                Ok(())
            }
            Packet::PubRec(packet_id) => {
                if self.outgoing.on_pubrec(packet_id, now) {
                    self.transmit(link, &Packet::PubRel(*packet_id), now)
                } else {
                    trace!("PUBREC for unknown id {}", packet_id.get());
                    Ok(())
                }
            }
            Packet::PubRel(packet_id) => self.on_pubrel(packet_id, link, events, now),
            Packet::PubComp(packet_id) => {
                if self.outgoing.on_pubcomp(packet_id) {
                    self.finish(packet_id, Ok(Ack::Published));
                } else {
                    trace!("PUBCOMP for unknown id {}", packet_id.get());
                }
                Ok(())
            }
            Packet::SubAck(ack) => {
                if self.take_request(&ack.packet_id, Request::Subscribe) {
                    self.finish(&ack.packet_id, Ok(Ack::Subscribed(ack.return_codes.clone())));
                } else {
                    trace!("SUBACK for unknown id {}", ack.packet_id.get());
                }
                Ok(())
            }
            Packet::UnsubAck(packet_id) => {
                if self.take_request(packet_id, Request::Unsubscribe) {
                    self.finish(packet_id, Ok(Ack::Unsubscribed));
                } else {
                    trace!("UNSUBACK for unknown id {}", packet_id.get());
                }
                Ok(())
            }
            Packet::PingResp => {
                trace!("PINGRESP");
                Ok(())
            }
            Packet::Disconnect => {
                warn!("ignoring DISCONNECT from server");
                Ok(())
            }
            Packet::Connect(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::PingReq => {
                warn!("ignoring server-bound {:?}", packet.packet_type());
                Ok(())
            }
        }
    }

    fn on_connack<T: Transport, D: Deliver<TOPIC, PAYLOAD>>(
        &mut self,
        ack: &ConnAck,
        link: &mut Link<'_, T>,
        events: &D,
    ) -> ConnectOutcome {
        let outcome = ConnectOutcome::from(ack);
        self.connect_sent_at = None;

        match outcome {
            ConnectOutcome::Accepted { session_present } => {
                info!("connected, session present: {}", session_present);

                self.state = State::Established;

                if !session_present {
                    self.fail_pending();
                }

                if events
                    .try_deliver(Event::Connected { session_present })
                    .is_err()
                {
                    warn!("event queue full, Connected not delivered");
                }
            }
            ConnectOutcome::Refused(code) => {
                warn!("connection refused: {:?}", code);
                self.close(link);
            }
            ConnectOutcome::Failed(_) => {}
        }

        outcome
    }

    fn on_publish<T: Transport, D: Deliver<TOPIC, PAYLOAD>>(
        &mut self,
        publish: &Publish<'_>,
        link: &mut Link<'_, T>,
        events: &D,
        now: Instant<C>,
    ) -> Result<(), crate::Error> {
        let message = match Message::try_from(publish) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!("message on {} not delivered: {:?}", publish.topic, err);
                None
            }
        };

        match (publish.flags.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) | (QoS::AtLeastOnce, None) => {
                if let Some(message) = message
                    && events.try_deliver(Event::Message(message)).is_err()
                {
                    warn!("event queue full, unacknowledged message dropped");
                }
                Ok(())
            }
            (QoS::AtLeastOnce, Some(packet_id)) => {
                if let Some(message) = message
                    && events.try_deliver(Event::Message(message)).is_err()
                {
                    warn!("event queue full, withholding PUBACK {}", packet_id.get());
                    return Ok(());
                }

                self.transmit(link, &Packet::PubAck(packet_id), now)
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                match self.incoming.track(packet_id, message)? {
                    Track::New => {}
                    Track::Duplicate => debug!("duplicate QoS 2 PUBLISH {}", packet_id.get()),
                }

                self.transmit(link, &Packet::PubRec(packet_id), now)
            }
            (QoS::ExactlyOnce, None) => Err(crate::Error::MalformedPacket),
        }
    }

    fn on_pubrel<T: Transport, D: Deliver<TOPIC, PAYLOAD>>(
        &mut self,
        packet_id: &PacketId,
        link: &mut Link<'_, T>,
        events: &D,
        now: Instant<C>,
    ) -> Result<(), crate::Error> {
        if self.incoming.state(packet_id) == Some(ReceiptState::Received) {
            if let Some(message) = self.incoming.message(packet_id).cloned()
                && events.try_deliver(Event::Message(message)).is_err()
            {
                warn!("event queue full, withholding PUBCOMP {}", packet_id.get());
                return Ok(());
            }

            self.incoming.mark_released(packet_id);
        }

        self.transmit(link, &Packet::PubComp(*packet_id), now)
    }

    /// Connect timeout, retransmission and keep-alive.
    pub(crate) fn poll_timers<T: Transport>(
        &mut self,
        link: &mut Link<'_, T>,
        now: Instant<C>,
    ) -> Result<(), crate::Error> {
        match self.state {
            State::AwaitingConnack => {
                let expired = self
                    .connect_sent_at
                    .and_then(|sent_at| now.checked_duration_since(&sent_at))
                    .is_some_and(|elapsed| elapsed >= self.connect_timeout);

                if expired {
                    warn!("no CONNACK within the connect timeout");
                    return Err(crate::Error::TimedOut);
                }

                Ok(())
            }
            State::Established => {
                if self
                    .keep_alive
                    .as_ref()
                    .is_some_and(|keep_alive| keep_alive.timed_out(now))
                {
                    warn!("no PINGRESP within the keep-alive interval");
                    return Err(crate::Error::TimedOut);
                }

                let resent = self
                    .outgoing
                    .retransmit_expired(now, self.retry_interval, |packet| link.send(packet))?;

                if resent > 0 {
                    debug!("retransmitted {} packets", resent);
                    self.touch(now);
                }

                if self
                    .keep_alive
                    .as_mut()
                    .is_some_and(|keep_alive| keep_alive.should_ping(now))
                {
                    self.transmit(link, &Packet::PingReq, now)?;
                }

                Ok(())
            }
            State::Idle | State::Closed => Ok(()),
        }
    }

    /// The packet id stays reserved until its result is taken here.
    pub(crate) fn take_completion(&mut self, packet_id: &PacketId) -> Option<Result<Ack, crate::Error>> {
        let index = self
            .completions
            .iter()
            .position(|(id, _)| id == packet_id)?;

        self.pool.release(packet_id);
        Some(self.completions.remove(index).1)
    }

    pub(crate) fn register_waiter(&mut self, waker: &Waker) {
        self.waiters.register(waker);
    }

    fn ensure_established(&self) -> Result<(), crate::Error> {
        match self.state {
            State::Established => Ok(()),
            _ => Err(crate::Error::NotConnected),
        }
    }

    fn request<T: Transport>(
        &mut self,
        link: &mut Link<'_, T>,
        packet_id: PacketId,
        kind: Request,
        packet: &Packet<'_>,
        now: Instant<C>,
    ) -> Result<(), crate::Error> {
        if self.requests.push((packet_id, kind)).is_err() {
            self.pool.release(&packet_id);
            return Err(crate::Error::NoPacketIdAvailable);
        }

        if let Err(err) = self.transmit(link, packet, now) {
            self.take_request(&packet_id, kind);
            self.pool.release(&packet_id);
            return Err(err);
        }

        Ok(())
    }

    fn take_request(&mut self, packet_id: &PacketId, kind: Request) -> bool {
        match self
            .requests
            .iter()
            .position(|(id, k)| id == packet_id && *k == kind)
        {
            Some(index) => {
                self.requests.remove(index);
                true
            }
            None => false,
        }
    }

    fn transmit<T: Transport>(
        &mut self,
        link: &mut Link<'_, T>,
        packet: &Packet<'_>,
        now: Instant<C>,
    ) -> Result<(), crate::Error> {
        link.send(packet)?;
        self.touch(now);

        Ok(())
    }

    fn touch(&mut self, now: Instant<C>) {
        if let Some(keep_alive) = self.keep_alive.as_mut() {
            keep_alive.on_send(now);
        }
    }

    fn finish(&mut self, packet_id: &PacketId, result: Result<Ack, crate::Error>) {
        complete(&mut self.completions, *packet_id, result);
        self.waiters.wake();
    }

    fn fail_pending(&mut self) {
        if !self.outgoing.is_empty() || !self.requests.is_empty() {
            debug!(
                "failing {} publishes and {} requests",
                self.outgoing.len(),
                self.requests.len()
            );
        }

        let completions = &mut self.completions;

        self.outgoing.drain(|packet_id| {
            complete(completions, packet_id, Err(crate::Error::ConnectionClosed))
        });

        for (packet_id, _) in self.requests.iter() {
            complete(
                &mut self.completions,
                *packet_id,
                Err(crate::Error::ConnectionClosed),
            );
        }

        self.requests.clear();
        self.incoming.clear();
        self.waiters.wake();
    }
}

/// Ids with a result stay in the pool until claimed, so there is always a
/// free slot.
fn complete<const N: usize>(
    completions: &mut Vec<Completion, N>,
    packet_id: PacketId,
    result: Result<Ack, crate::Error>,
) {
    if completions.push((packet_id, result)).is_err() {
        error!("no room for the result of {}", packet_id.get());
    }
}
