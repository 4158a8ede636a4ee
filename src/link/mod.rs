//! # Framed link
//!
//! The [`Link`] is the transport adapter between a raw byte stream to the
//! expander and the subsystems that speak over it. It does two things:
//!
//! - [`Link::send`] wraps a payload into a frame for one channel and
//!   writes it to the port.
//! - [`Link::drain`] reads whatever bytes the port has available,
//!   decodes complete frames and hands each payload to the handlers
//!   registered for its channel.
//!
//! There is no background thread. Nothing is received unless somebody
//! calls [`Link::drain`].
//!
//! Several handlers can share a channel (both I2C buses use the I2C
//! channel, for example). Each handler decides whether a payload is its
//! own by returning [`Delivery::Accepted`] or [`Delivery::Declined`]. A
//! frame nobody accepts is an error.

pub mod frame;

use std::{
    collections::{BTreeMap, VecDeque},
    error::Error,
    fmt::{self, Debug},
    io::{ErrorKind, Read, Write},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, trace};

use frame::{encode_frame, Frame, FrameDecoder, PayloadTooLarge, MASTER_ID_BIT};

/// Logical channels of the expander. The channel id is the TYPE byte
/// of each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
#[repr(u8)]
pub enum ChannelId {
    Ctrl = 0x00,
    Uart = 0x01,
    I2c = 0x02,
    Spi = 0x03,
    Can = 0x04,
    Gpio = 0x05,
    Pwm = 0x06,
    Adc = 0x07,
}

impl From<ChannelId> for u8 {
    fn from(channel: ChannelId) -> Self {
        channel as Self
    }
}

/// A frame carried a TYPE byte that is not a known channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnknownChannel(pub u8);

impl TryFrom<u8> for ChannelId {
    type Error = UnknownChannel;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Ctrl),
            0x01 => Ok(Self::Uart),
            0x02 => Ok(Self::I2c),
            0x03 => Ok(Self::Spi),
            0x04 => Ok(Self::Can),
            0x05 => Ok(Self::Gpio),
            0x06 => Ok(Self::Pwm),
            0x07 => Ok(Self::Adc),
            _ => Err(UnknownChannel(value)),
        }
    }
}

/// A byte stream to the expander.
///
/// Reads must not block: when nothing is pending they return `Ok(0)` or
/// fail with [`ErrorKind::WouldBlock`].
pub trait Port: Read + Write + Send + Debug {}

impl<T: Read + Write + Send + Debug> Port for T {}

/// What a channel handler did with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The payload was consumed.
    Accepted,
    /// The payload belongs to somebody else on this channel.
    Declined,
    /// The handler's owner is gone. The handler is removed.
    Detached,
}

/// The boxed error a channel handler may fail with.
pub type HandlerError = Box<dyn Error + Send + Sync>;

type Handler = Arc<dyn Fn(&[u8]) -> Result<Delivery, HandlerError> + Send + Sync>;

/// Errors of the framed link.
#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    /// Reading from or writing to the port failed.
    #[error("Link I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A payload did not fit into a frame.
    #[error(transparent)]
    PayloadTooLarge(#[from] PayloadTooLarge),

    /// A frame arrived that no registered handler accepted.
    #[error("No handler accepted frame on channel {channel:#04x}")]
    Unclaimed {
        /// The TYPE byte of the frame.
        channel: u8,
    },

    /// A channel handler rejected a payload.
    #[error("Handler for channel {channel:?} failed: {source}")]
    Handler {
        /// The channel of the frame.
        channel: ChannelId,
        /// What the handler reported.
        #[source]
        source: HandlerError,
    },
}

impl LinkError {
    /// Return the handler error inside, if it is of type `E`.
    #[must_use]
    pub fn handler_error<E: Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Handler { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct LinkIo {
    port: Box<dyn Port>,
    decoder: FrameDecoder,
    /// Decoded frames that were not dispatched yet.
    inbox: VecDeque<Frame>,
    /// Low seven bits of the next outgoing frame id.
    next_frame_id: u8,
}

struct LinkInner {
    io: Mutex<LinkIo>,
    handlers: Mutex<BTreeMap<ChannelId, Vec<Handler>>>,
}

/// Shared handle to one framed connection.
///
/// Cloning the handle is cheap; all clones talk to the same port.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels: Vec<ChannelId> = lock(&self.inner.handlers).keys().copied().collect();

        f.debug_struct("Link")
            .field("io", &self.inner.io)
            .field("channels", &channels)
            .finish()
    }
}

/// Lock a mutex, ignoring poisoning.
///
/// All state behind these mutexes is left consistent between
/// statements, so a panic elsewhere does not invalidate it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Link {
    /// Create a link on top of a port.
    pub fn new(port: impl Port + 'static) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                io: Mutex::new(LinkIo {
                    port: Box::new(port),
                    decoder: FrameDecoder::new(),
                    inbox: VecDeque::new(),
                    next_frame_id: 0,
                }),
                handlers: Mutex::default(),
            }),
        }
    }

    /// Register a handler for inbound payloads on `channel`.
    ///
    /// Handlers of one channel are asked in registration order until one
    /// of them accepts the payload.
    pub fn register<F>(&self, channel: ChannelId, handler: F)
    where
        F: Fn(&[u8]) -> Result<Delivery, HandlerError> + Send + Sync + 'static,
    {
        lock(&self.inner.handlers)
            .entry(channel)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Frame `payload` for `channel` and write it to the port.
    pub fn send(&self, channel: ChannelId, payload: &[u8]) -> Result<(), LinkError> {
        let mut io = lock(&self.inner.io);

        let frame_id = MASTER_ID_BIT | io.next_frame_id;
        io.next_frame_id = (io.next_frame_id + 1) & !MASTER_ID_BIT;

        let frame = encode_frame(frame_id, channel.into(), payload)?;
        trace!(
            "tx frame {frame_id:#04x} on {channel:?}: {} payload bytes",
            payload.len()
        );

        write_all_nonblocking(&mut io.port, &frame)?;
        io.port.flush()?;

        Ok(())
    }

    /// Receive everything the port has available and dispatch all
    /// complete frames to their handlers.
    ///
    /// Returns the number of dispatched frames. If a handler fails, the
    /// error is returned immediately and frames received after the
    /// failing one stay queued for the next call.
    pub fn drain(&self) -> Result<usize, LinkError> {
        self.receive()?;

        let mut dispatched = 0;
        loop {
            // The io lock must not be held while handlers run, they may
            // send on this link.
            let next = lock(&self.inner.io).inbox.pop_front();
            let Some(frame) = next else {
                return Ok(dispatched);
            };

            self.dispatch(&frame)?;
            dispatched += 1;
        }
    }

    fn receive(&self) -> Result<(), LinkError> {
        let mut io = lock(&self.inner.io);
        let mut buf = [0u8; 512];

        loop {
            match io.port.read(&mut buf) {
                Ok(0) => break,
                Ok(len) => {
                    trace!("rx {len} bytes");
                    let frames = io.decoder.feed(&buf[..len]);
                    io.inbox.extend(frames);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn dispatch(&self, frame: &Frame) -> Result<(), LinkError> {
        let channel = ChannelId::try_from(frame.frame_type).map_err(|UnknownChannel(raw)| {
            LinkError::Unclaimed { channel: raw }
        })?;

        let handlers: Vec<Handler> = lock(&self.inner.handlers)
            .get(&channel)
            .cloned()
            .unwrap_or_default();

        let mut detached = Vec::new();
        let mut accepted = false;

        for handler in &handlers {
            match handler(&frame.payload) {
                Ok(Delivery::Accepted) => {
                    accepted = true;
                    break;
                }
                Ok(Delivery::Declined) => {}
                Ok(Delivery::Detached) => detached.push(handler.clone()),
                Err(source) => {
                    self.prune(channel, &detached);
                    return Err(LinkError::Handler { channel, source });
                }
            }
        }

        self.prune(channel, &detached);

        if accepted {
            Ok(())
        } else {
            Err(LinkError::Unclaimed {
                channel: frame.frame_type,
            })
        }
    }

    fn prune(&self, channel: ChannelId, detached: &[Handler]) {
        if detached.is_empty() {
            return;
        }

        debug!("removing {} detached handler(s) from {channel:?}", detached.len());

        if let Some(list) = lock(&self.inner.handlers).get_mut(&channel) {
            list.retain(|h| !detached.iter().any(|d| Arc::ptr_eq(h, d)));
        }
    }
}

/// Write a whole buffer to a port that may report `WouldBlock` when its
/// output buffer is full.
fn write_all_nonblocking(port: &mut Box<dyn Port>, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match port.write(data) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(written) => data = &data[written..],
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                std::thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testutils::LoopbackPort;

    #[test]
    fn channel_ids_convert_to_and_from_bytes() {
        for raw in 0u8..8 {
            let channel = ChannelId::try_from(raw).unwrap();
            assert_eq!(u8::from(channel), raw);
        }

        assert_eq!(ChannelId::try_from(8u8), Err(UnknownChannel(8)));
    }

    #[test]
    fn sent_frames_carry_master_ids_and_channel() {
        let port = LoopbackPort::default();
        let link = Link::new(port.clone());

        link.send(ChannelId::I2c, b"abc").unwrap();
        link.send(ChannelId::Gpio, b"").unwrap();

        let frames = FrameDecoder::new().feed(&port.take_written());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, 0x80);
        assert_eq!(frames[0].frame_type, 0x02);
        assert_eq!(frames[0].payload, b"abc");
        assert_eq!(frames[1].id, 0x81);
        assert_eq!(frames[1].frame_type, 0x05);
    }

    #[test]
    fn drain_dispatches_to_the_accepting_handler() {
        let port = LoopbackPort::default();
        let link = Link::new(port.clone());

        let declined = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = declined.clone();
        link.register(ChannelId::I2c, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Delivery::Declined)
        });

        let counter = accepted.clone();
        link.register(ChannelId::I2c, move |payload| {
            assert_eq!(payload, b"xy");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Delivery::Accepted)
        });

        port.push_readable(&encode_frame(0x01, 0x02, b"xy").unwrap());
        port.push_readable(&encode_frame(0x02, 0x02, b"xy").unwrap());

        assert_eq!(link.drain().unwrap(), 2);
        assert_eq!(declined.load(Ordering::SeqCst), 2);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        // Nothing left.
        assert_eq!(link.drain().unwrap(), 0);
    }

    #[test]
    fn unclaimed_frames_are_errors() {
        let port = LoopbackPort::default();
        let link = Link::new(port.clone());

        port.push_readable(&encode_frame(0x01, 0x00, b"ctrl").unwrap());
        assert!(matches!(
            link.drain(),
            Err(LinkError::Unclaimed { channel: 0x00 })
        ));

        port.push_readable(&encode_frame(0x02, 0x42, b"??").unwrap());
        assert!(matches!(
            link.drain(),
            Err(LinkError::Unclaimed { channel: 0x42 })
        ));
    }

    #[test]
    fn detached_handlers_are_removed() {
        let port = LoopbackPort::default();
        let link = Link::new(port.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        link.register(ChannelId::Uart, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Delivery::Detached)
        });
        link.register(ChannelId::Uart, |_| Ok(Delivery::Accepted));

        port.push_readable(&encode_frame(0x01, 0x01, b"a").unwrap());
        port.push_readable(&encode_frame(0x02, 0x01, b"b").unwrap());
        link.drain().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[derive(thiserror::Error, Debug)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn handler_errors_keep_later_frames_queued() {
        let port = LoopbackPort::default();
        let link = Link::new(port.clone());

        link.register(ChannelId::I2c, |payload| {
            if payload == b"bad" {
                Err(Boom.into())
            } else {
                Ok(Delivery::Accepted)
            }
        });

        port.push_readable(&encode_frame(0x01, 0x02, b"bad").unwrap());
        port.push_readable(&encode_frame(0x02, 0x02, b"good").unwrap());

        let err = link.drain().unwrap_err();
        assert!(err.handler_error::<Boom>().is_some());

        assert_eq!(link.drain().unwrap(), 1);
    }
}
