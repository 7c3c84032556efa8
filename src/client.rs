use core::{cell::RefCell, future::poll_fn, task::Poll};

use embassy_sync::{
    blocking_mutex::{Mutex, raw::RawMutex},
    channel::Channel,
};
use embedded_time::{Clock, Instant, duration, rate::Fraction};

use crate::{
    oneshot::OneShot,
    packet::{Packet, PacketId, QoS, connect::ConnectOutcome, connect::Options, publish::Message},
    session::{Ack, Event, Session, State},
    transport::{Link, Transport},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Unacknowledged PUBLISH and PUBREL older than this are sent again.
    pub retry_interval_ms: u32,
    /// Time allowed between CONNECT and CONNACK.
    pub connect_timeout_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_interval_ms: 10_000,
            connect_timeout_ms: 30_000,
        }
    }
}

fn millis<C: Clock>(value: u32) -> duration::Generic<C::T> {
    duration::Generic::new(C::T::from(value), Fraction::new(1, 1000))
}

/// Completion token of a publish, subscribe or unsubscribe. Its packet id
/// is not reissued until the result has been taken with [`Client::wait`] or
/// [`Client::try_result`].
#[must_use]
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Delivery {
    packet_id: Option<PacketId>,
}

impl Delivery {
    /// `None` for QoS 0, which completes when sent.
    pub fn packet_id(&self) -> Option<PacketId> {
        self.packet_id
    }
}

/// Application callbacks, driven by [`Client::run_handler`].
pub trait Handler<const TOPIC: usize, const PAYLOAD: usize> {
    fn on_connected(&mut self, session_present: bool) {
        let _ = session_present;
    }

    fn on_message(&mut self, message: &Message<TOPIC, PAYLOAD>);
}

struct Shared<
    'b,
    C: Clock,
    T: Transport,
    const N_OUT: usize,
    const N_IN: usize,
    const TOPIC: usize,
    const PAYLOAD: usize,
> {
    session: Session<C, N_OUT, N_IN, TOPIC, PAYLOAD>,
    link: Link<'b, T>,
}

/// MQTT 3.1.1 client engine. Inbound frames are pushed in with
/// [`Client::on_packet`], outbound frames leave through the [`Transport`].
///
/// - `N_OUT`: outbound exchanges in flight (QoS 1/2 publishes, subscribes,
///   unsubscribes)
/// - `N_IN`: inbound QoS 2 messages awaiting PUBREL
/// - `Q`: application event queue
/// - `TOPIC`, `PAYLOAD`: capacities of stored topics and payloads
pub struct Client<
    'b,
    M: RawMutex,
    C: Clock,
    T: Transport,
    const N_OUT: usize,
    const N_IN: usize,
    const Q: usize,
    const TOPIC: usize,
    const PAYLOAD: usize,
> {
    clock: C,
    shared: Mutex<M, RefCell<Shared<'b, C, T, N_OUT, N_IN, TOPIC, PAYLOAD>>>,
    outcome: OneShot<M, ConnectOutcome>,
    events: Channel<M, Event<TOPIC, PAYLOAD>, Q>,
}

impl<
    'b,
    M: RawMutex,
    C: Clock,
    T: Transport,
    const N_OUT: usize,
    const N_IN: usize,
    const Q: usize,
    const TOPIC: usize,
    const PAYLOAD: usize,
> Client<'b, M, C, T, N_OUT, N_IN, Q, TOPIC, PAYLOAD>
{
    /// `tx` holds one encoded outbound frame at a time.
    pub fn new(clock: C, transport: T, tx: &'b mut [u8], config: Config) -> Self {
        let session = Session::new(
            millis::<C>(config.retry_interval_ms),
            millis::<C>(config.connect_timeout_ms),
        );

        Self {
            clock,
            shared: Mutex::new(RefCell::new(Shared {
                session,
                link: Link::new(transport, tx),
            })),
            outcome: OneShot::new(),
            events: Channel::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.with_shared(|shared| shared.session.state() == State::Established)
    }

    pub fn is_closed(&self) -> bool {
        self.with_shared(|shared| shared.session.state() == State::Closed)
    }

    /// Sends CONNECT and waits for the outcome.
    pub async fn connect(&self, options: &Options<'_>) -> Result<ConnectOutcome, crate::Error> {
        self.begin_connect(options)?;
        Ok(self.outcome().await)
    }

    pub fn begin_connect(&self, options: &Options<'_>) -> Result<(), crate::Error> {
        self.operate(|shared, now| shared.session.connect(&mut shared.link, options, now))
    }

    pub async fn outcome(&self) -> ConnectOutcome {
        self.outcome.wait().await
    }

    pub fn try_outcome(&self) -> Option<ConnectOutcome> {
        self.outcome.get()
    }

    /// Starts over on a new transport after the previous connection closed.
    pub fn reopen(&self, transport: T) -> Result<(), crate::Error> {
        self.with_shared(|shared| {
            shared.session.reset()?;
            shared.link.replace(transport);
            Ok(())
        })?;

        self.outcome.reset();
        Ok(())
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Ack, crate::Error> {
        let delivery = self.begin_publish(topic, payload, qos, retain)?;
        self.wait(delivery).await
    }

    pub fn begin_publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Delivery, crate::Error> {
        let packet_id = self.operate(|shared, now| {
            shared
                .session
                .publish(&mut shared.link, topic, payload, qos, retain, now)
        })?;

        Ok(Delivery { packet_id })
    }

    pub async fn subscribe(&self, filters: &[(&str, QoS)]) -> Result<Ack, crate::Error> {
        let delivery = self.begin_subscribe(filters)?;
        self.wait(delivery).await
    }

    pub fn begin_subscribe(&self, filters: &[(&str, QoS)]) -> Result<Delivery, crate::Error> {
        let packet_id = self.operate(|shared, now| {
            shared.session.subscribe(&mut shared.link, filters, now)
        })?;

        Ok(Delivery {
            packet_id: Some(packet_id),
        })
    }

    pub async fn unsubscribe(&self, filters: &[&str]) -> Result<Ack, crate::Error> {
        let delivery = self.begin_unsubscribe(filters)?;
        self.wait(delivery).await
    }

    pub fn begin_unsubscribe(&self, filters: &[&str]) -> Result<Delivery, crate::Error> {
        let packet_id = self.operate(|shared, now| {
            shared.session.unsubscribe(&mut shared.link, filters, now)
        })?;

        Ok(Delivery {
            packet_id: Some(packet_id),
        })
    }

    /// Sends DISCONNECT and closes the transport.
    pub fn disconnect(&self) -> Result<(), crate::Error> {
        self.operate(|shared, now| shared.session.disconnect(&mut shared.link, now))
    }

    pub async fn wait(&self, delivery: Delivery) -> Result<Ack, crate::Error> {
        let Some(packet_id) = delivery.packet_id else {
            return Ok(Ack::Published);
        };

        poll_fn(|cx| {
            self.with_shared(|shared| match shared.session.take_completion(&packet_id) {
                Some(result) => Poll::Ready(result),
                None => {
                    shared.session.register_waiter(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }

    /// Takes the result if the exchange has finished, otherwise hands the
    /// token back.
    pub fn try_result(&self, delivery: Delivery) -> Result<Result<Ack, crate::Error>, Delivery> {
        let Some(packet_id) = delivery.packet_id else {
            return Ok(Ok(Ack::Published));
        };

        self.with_shared(|shared| shared.session.take_completion(&packet_id))
            .ok_or(delivery)
    }

    /// Feeds one complete inbound frame. Decode failures and protocol
    /// violations close the connection before the error is returned.
    pub fn on_packet(&self, bytes: &[u8]) -> Result<(), crate::Error> {
        let now = self.now()?;

        self.with_shared(|shared| {
            let result = Packet::decode(bytes).and_then(|packet| {
                trace!("received {:?}", packet.packet_type());

                shared
                    .session
                    .handle(&packet, &mut shared.link, &self.events, now)
            });

            match result {
                Ok(Some(outcome)) => {
                    self.outcome.resolve(outcome);
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(err) => {
                    if err.is_fatal() {
                        self.fail(shared, err);
                    } else {
                        warn!("inbound packet rejected: {:?}", err);
                    }
                    Err(err)
                }
            }
        })
    }

    /// The transport reported the connection gone.
    pub fn on_closed(&self) {
        self.with_shared(|shared| shared.session.close(&mut shared.link));
        self.outcome
            .resolve(ConnectOutcome::Failed(crate::Error::ConnectionClosed));
    }

    /// Retransmits unacknowledged packets and runs keep-alive. Call it
    /// periodically, more often than the retry interval.
    pub fn poll_timers(&self) -> Result<(), crate::Error> {
        let now = self.now()?;

        self.with_shared(|shared| {
            let result = shared.session.poll_timers(&mut shared.link, now);

            if let Err(err) = result
                && err.is_fatal()
            {
                self.fail(shared, err);
            }

            result
        })
    }

    pub async fn next_event(&self) -> Event<TOPIC, PAYLOAD> {
        self.events.receive().await
    }

    pub fn try_next_event(&self) -> Option<Event<TOPIC, PAYLOAD>> {
        self.events.try_receive().ok()
    }

    /// Hands every event to `handler`, never returns.
    pub async fn run_handler<H: Handler<TOPIC, PAYLOAD>>(&self, handler: &mut H) {
        loop {
            match self.next_event().await {
                Event::Connected { session_present } => handler.on_connected(session_present),
                Event::Message(message) => handler.on_message(&message),
            }
        }
    }

    /// Drives [`Client::poll_timers`] every `period` until the connection
    /// closes.
    #[cfg(feature = "embassy")]
    pub async fn run_timers(&self, period: embassy_time::Duration) -> Result<(), crate::Error> {
        loop {
            embassy_time::Timer::after(period).await;

            self.poll_timers()?;

            if self.is_closed() {
                return Ok(());
            }
        }
    }

    fn now(&self) -> Result<Instant<C>, crate::Error> {
        self.clock.try_now().map_err(|_| crate::Error::TimeError)
    }

    fn with_shared<R>(
        &self,
        f: impl FnOnce(&mut Shared<'b, C, T, N_OUT, N_IN, TOPIC, PAYLOAD>) -> R,
    ) -> R {
        self.shared.lock(|shared| f(&mut shared.borrow_mut()))
    }

    /// Runs an application request. Transport failures close the connection.
    fn operate<R>(
        &self,
        f: impl FnOnce(
            &mut Shared<'b, C, T, N_OUT, N_IN, TOPIC, PAYLOAD>,
            Instant<C>,
        ) -> Result<R, crate::Error>,
    ) -> Result<R, crate::Error> {
        let now = self.now()?;

        self.with_shared(|shared| {
            let result = f(shared, now);

            if let Err(crate::Error::TransportError) = result {
                self.fail(shared, crate::Error::TransportError);
            }

            result
        })
    }

    fn fail(&self, shared: &mut Shared<'b, C, T, N_OUT, N_IN, TOPIC, PAYLOAD>, err: crate::Error) {
        error!("closing connection: {:?}", err);

        shared.session.close(&mut shared.link);
        self.outcome.resolve(ConnectOutcome::Failed(err));
    }
}
