//! Bounded frame queues, their endpoints and the registry that wires modules together.
//!
//! Producers and consumers only see the [`FrameSender`] / [`FrameReceiver`] traits. The
//! concrete queue is a bounded `crossbeam-channel`, which gives timed sends that hand
//! the value back on timeout, so a producer can retry the same frame without copying it.

use crossbeam_channel::{RecvTimeoutError, SendTimeoutError};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::QueueConfig;
use crate::pipeline::{FormatVisitor, PipelineSpec};
use crate::types::{FormatDescriptor, FrameAdapter};
use crate::{ReadoutError, Result};

/// Why a timed send or receive did not complete.
///
/// On send the undelivered value is handed back in either variant.
#[derive(PartialEq, Eq)]
pub enum ChannelError<T = ()> {
    /// The queue stayed full (send) or empty (receive) for the whole timeout. Recoverable.
    Timeout(T),
    /// The other side is gone. Not recoverable.
    Disconnected(T),
}

impl<T> ChannelError<T> {
    pub fn into_inner(self) -> T {
        match self {
            ChannelError::Timeout(value) | ChannelError::Disconnected(value) => value,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout(_))
    }
}

impl<T> fmt::Debug for ChannelError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Timeout(_) => f.write_str("Timeout(..)"),
            ChannelError::Disconnected(_) => f.write_str("Disconnected(..)"),
        }
    }
}

/// Producer side of a bounded queue.
pub trait FrameSender<T>: Send {
    /// Queue uid, for logs.
    fn name(&self) -> &str;

    fn send_timeout(&mut self, item: T, timeout: Duration) -> Result<(), ChannelError<T>>;
}

/// Consumer side of a bounded queue.
pub trait FrameReceiver<T>: Send {
    fn name(&self) -> &str;

    fn recv_timeout(&mut self, timeout: Duration) -> Result<T, ChannelError>;
}

/// Sending half of a named bounded queue.
pub struct QueueSender<T> {
    name: Arc<str>,
    inner: crossbeam_channel::Sender<T>,
}

/// Receiving half of a named bounded queue.
pub struct QueueReceiver<T> {
    name: Arc<str>,
    inner: crossbeam_channel::Receiver<T>,
}

// Manual impls: cloning a queue end never requires `T: Clone`.
impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self { name: Arc::clone(&self.name), inner: self.inner.clone() }
    }
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self { name: Arc::clone(&self.name), inner: self.inner.clone() }
    }
}

impl<T> fmt::Debug for QueueSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSender").field("name", &self.name).field("len", &self.inner.len()).finish()
    }
}

impl<T> fmt::Debug for QueueReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueReceiver").field("name", &self.name).field("len", &self.inner.len()).finish()
    }
}

/// Creates a bounded queue holding at most `capacity` items.
pub fn bounded<T>(name: &str, capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let name: Arc<str> = Arc::from(name);
    (QueueSender { name: Arc::clone(&name), inner: tx }, QueueReceiver { name, inner: rx })
}

impl<T> QueueSender<T> {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity()
    }
}

impl<T> QueueReceiver<T> {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Underlying channel, for `select!` in consumer loops.
    pub(crate) fn as_crossbeam(&self) -> &crossbeam_channel::Receiver<T> {
        &self.inner
    }
}

impl<T: Send> FrameSender<T> for QueueSender<T> {
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn send_timeout(&mut self, item: T, timeout: Duration) -> Result<(), ChannelError<T>> {
        self.inner.send_timeout(item, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(item) => ChannelError::Timeout(item),
            SendTimeoutError::Disconnected(item) => ChannelError::Disconnected(item),
        })
    }
}

impl<T: Send> FrameReceiver<T> for QueueReceiver<T> {
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn recv_timeout(&mut self, timeout: Duration) -> Result<T, ChannelError> {
        self.inner.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ChannelError::Timeout(()),
            RecvTimeoutError::Disconnected => ChannelError::Disconnected(()),
        })
    }
}

/// A queue endpoint as declared in configuration: its uid and data-type metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub uid: String,
    pub data_types: Vec<String>,
}

impl Endpoint {
    /// The single data type this endpoint carries.
    ///
    /// Zero or several declared data types is a configuration error.
    pub fn data_type(&self) -> Result<&str> {
        match self.data_types.as_slice() {
            [single] => Ok(single),
            [] => Err(ReadoutError::configuration(format!("queue '{}' declares no data type", self.uid))),
            many => Err(ReadoutError::configuration(format!(
                "queue '{}' declares {} data types ({}); exactly one is required",
                self.uid,
                many.len(),
                many.join(", ")
            ))),
        }
    }

    /// Resolves the single data type to a [`FormatDescriptor`].
    pub fn resolve_format(&self) -> Result<FormatDescriptor> {
        self.data_type()?.parse()
    }
}

struct QueueEntry {
    data_types: Vec<String>,
    /// `(QueueSender<F>, QueueReceiver<F>)` for the declared frame type, if any.
    ends: Option<Box<dyn Any + Send>>,
}

/// Named queues shared by the modules of one readout application.
///
/// Queues are declared once with their frame type; modules then look them up by uid
/// while they are being created. Lookups with the wrong frame type are configuration
/// errors.
#[derive(Default)]
pub struct QueueRegistry {
    queues: HashMap<String, QueueEntry>,
}

impl fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.queues.iter().map(|(uid, q)| (uid, &q.data_types))).finish()
    }
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares every queue in `queues`, dispatching on its data type.
    pub fn from_config(queues: &[QueueConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for queue in queues {
            let format: FormatDescriptor = queue.data_type.parse()?;
            format.dispatch(Declare { registry: &mut registry, uid: &queue.uid, capacity: queue.capacity })?;
        }
        Ok(registry)
    }

    /// Declares a bounded queue of `F` frames. A uid can be declared only once.
    pub fn declare<F: FrameAdapter>(&mut self, uid: &str, capacity: usize) -> Result<()> {
        self.ensure_undeclared(uid)?;
        let ends = bounded::<F>(uid, capacity);
        debug!(queue = uid, data_type = %F::FORMAT, capacity, "Queue declared");
        self.queues.insert(
            uid.to_string(),
            QueueEntry { data_types: vec![F::FORMAT.as_str().to_string()], ends: Some(Box::new(ends)) },
        );
        Ok(())
    }

    /// Declares an endpoint with arbitrary data-type metadata and no backing queue.
    ///
    /// Useful to describe endpoints owned by another process.
    pub fn declare_endpoint(&mut self, uid: &str, data_types: Vec<String>) -> Result<()> {
        self.ensure_undeclared(uid)?;
        self.queues.insert(uid.to_string(), QueueEntry { data_types, ends: None });
        Ok(())
    }

    fn ensure_undeclared(&self, uid: &str) -> Result<()> {
        match self.queues.get(uid) {
            Some(existing) => Err(ReadoutError::configuration(format!(
                "queue '{uid}' is already declared with data types {:?}",
                existing.data_types
            ))),
            None => Ok(()),
        }
    }

    pub fn endpoint(&self, uid: &str) -> Result<Endpoint> {
        let entry = self.entry(uid)?;
        Ok(Endpoint { uid: uid.to_string(), data_types: entry.data_types.clone() })
    }

    pub fn sender<F: FrameAdapter>(&self, uid: &str) -> Result<QueueSender<F>> {
        self.ends::<F>(uid).map(|(tx, _)| tx.clone())
    }

    pub fn receiver<F: FrameAdapter>(&self, uid: &str) -> Result<QueueReceiver<F>> {
        self.ends::<F>(uid).map(|(_, rx)| rx.clone())
    }

    fn entry(&self, uid: &str) -> Result<&QueueEntry> {
        self.queues.get(uid).ok_or_else(|| ReadoutError::configuration(format!("queue '{uid}' is not declared")))
    }

    fn ends<F: FrameAdapter>(&self, uid: &str) -> Result<&(QueueSender<F>, QueueReceiver<F>)> {
        let entry = self.entry(uid)?;
        entry
            .ends
            .as_ref()
            .and_then(|ends| ends.downcast_ref::<(QueueSender<F>, QueueReceiver<F>)>())
            .ok_or_else(|| {
                ReadoutError::configuration(format!(
                    "queue '{uid}' carries {:?}, not {}",
                    entry.data_types,
                    F::FORMAT
                ))
            })
    }
}

struct Declare<'a> {
    registry: &'a mut QueueRegistry,
    uid: &'a str,
    capacity: usize,
}

impl FormatVisitor for Declare<'_> {
    type Output = Result<()>;

    fn visit<F: PipelineSpec>(self) -> Self::Output {
        self.registry.declare::<F>(self.uid, self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CrtFrame, TdeFrame, WibEthFrame};
    use std::time::Instant;

    #[test]
    fn full_queue_times_out_and_hands_the_value_back() {
        let (mut tx, _rx) = bounded::<u32>("q", 1);
        tx.send_timeout(1, Duration::from_millis(1)).unwrap();
        let start = Instant::now();
        match tx.send_timeout(2, Duration::from_millis(20)) {
            Err(ChannelError::Timeout(value)) => assert_eq!(value, 2),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn dropped_receiver_disconnects_sender() {
        let (mut tx, rx) = bounded::<u32>("q", 1);
        drop(rx);
        let err = tx.send_timeout(7, Duration::from_millis(1)).unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(err.into_inner(), 7);
    }

    #[test]
    fn empty_queue_receive_times_out() {
        let (_tx, mut rx) = bounded::<u32>("q", 4);
        assert_eq!(rx.recv_timeout(Duration::from_millis(5)), Err(ChannelError::Timeout(())));
    }

    #[test]
    fn endpoint_requires_exactly_one_data_type() {
        let one = Endpoint { uid: "a".into(), data_types: vec!["CRTFrame".into()] };
        assert_eq!(one.resolve_format().unwrap(), FormatDescriptor::Crt);

        let none = Endpoint { uid: "b".into(), data_types: vec![] };
        assert!(matches!(none.data_type(), Err(ReadoutError::Configuration { .. })));

        let two = Endpoint { uid: "c".into(), data_types: vec!["CRTFrame".into(), "TDEFrame".into()] };
        let err = two.resolve_format().unwrap_err();
        assert!(matches!(err, ReadoutError::Configuration { .. }));
        assert!(err.to_string().contains("2 data types"));

        let unknown = Endpoint { uid: "d".into(), data_types: vec!["UnknownFrame".into()] };
        assert!(matches!(unknown.resolve_format(), Err(ReadoutError::UnsupportedFormat { .. })));
    }

    #[test]
    fn registry_hands_out_connected_typed_ends() {
        let mut registry = QueueRegistry::new();
        registry.declare::<CrtFrame>("crt_link0", 8).unwrap();
        let mut tx = registry.sender::<CrtFrame>("crt_link0").unwrap();
        let mut rx = registry.receiver::<CrtFrame>("crt_link0").unwrap();

        let mut raw = vec![0u8; CrtFrame::SIZE];
        raw[8] = 9;
        tx.send_timeout(CrtFrame::from_bytes(&raw).unwrap(), Duration::from_millis(10)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)).unwrap().timestamp(), 9);
        assert_eq!(registry.endpoint("crt_link0").unwrap().data_types, vec!["CRTFrame".to_string()]);
    }

    #[test]
    fn registry_rejects_wrong_type_and_unknown_uid() {
        let mut registry = QueueRegistry::new();
        registry.declare::<CrtFrame>("crt_link0", 8).unwrap();
        registry.declare_endpoint("remote", vec!["WIBEthFrame".into()]).unwrap();
        assert!(matches!(registry.sender::<WibEthFrame>("crt_link0"), Err(ReadoutError::Configuration { .. })));
        assert!(matches!(registry.receiver::<WibEthFrame>("remote"), Err(ReadoutError::Configuration { .. })));
        assert!(matches!(registry.endpoint("missing"), Err(ReadoutError::Configuration { .. })));
    }

    #[test]
    fn registry_from_config_dispatches_on_data_type() {
        let queues = vec![
            QueueConfig { uid: "wib".into(), data_type: "WIBEthFrame".into(), capacity: 4 },
            QueueConfig { uid: "crt".into(), data_type: "CRTFrame".into(), capacity: 4 },
        ];
        let registry = QueueRegistry::from_config(&queues).unwrap();
        assert!(registry.sender::<WibEthFrame>("wib").is_ok());
        assert!(registry.receiver::<CrtFrame>("crt").is_ok());

        let bad = vec![QueueConfig { uid: "x".into(), data_type: "WIBEth".into(), capacity: 4 }];
        assert!(matches!(QueueRegistry::from_config(&bad), Err(ReadoutError::UnsupportedFormat { .. })));
    }

    #[test]
    fn redeclaring_a_uid_keeps_the_first_declaration() {
        let mut registry = QueueRegistry::new();
        registry.declare::<CrtFrame>("q", 8).unwrap();
        let err = registry.declare::<TdeFrame>("q", 8).unwrap_err();
        assert!(matches!(err, ReadoutError::Configuration { .. }));
        assert!(err.to_string().contains("already declared"));
        assert!(matches!(registry.declare_endpoint("q", vec!["TDEFrame".into()]), Err(ReadoutError::Configuration { .. })));
        assert_eq!(registry.endpoint("q").unwrap().resolve_format().unwrap(), FormatDescriptor::Crt);
        assert!(registry.sender::<CrtFrame>("q").is_ok());
    }

    #[test]
    fn registry_from_config_rejects_two_formats_on_one_uid() {
        let queues = vec![
            QueueConfig { uid: "q".into(), data_type: "CRTFrame".into(), capacity: 4 },
            QueueConfig { uid: "q".into(), data_type: "TDEFrame".into(), capacity: 4 },
        ];
        assert!(matches!(QueueRegistry::from_config(&queues), Err(ReadoutError::Configuration { .. })));
    }
}
