use amq_protocol_types::DeliveryTag;
use futures_util::StreamExt;
use hutch::amqp::{
    BasicProperties, ChannelFactory, ConsumerChannel, Delivery, DeliveryStream, Envelope,
};
use hutch::consumers::{ErrorHandler, Handler, HandlerError, Message};
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// An ordered record of everything observable during a test: log lines, handler invocations,
/// error handler invocations, acks.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries starting with `prefix`, in order.
    pub fn starting_with(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    /// Capture the log lines emitted by the current thread until the guard is dropped.
    ///
    /// Lines are recorded as `LEVEL queue message`, followed by ` | error` when an error is
    /// attached. Lines without a `queue` field are recorded as `LEVEL - message`.
    pub fn capture_logs(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::registry().with(JournalLayer(self.clone()));
        tracing::subscriber::set_default(subscriber)
    }
}

struct JournalLayer(Journal);

#[derive(Default)]
struct Fields {
    message: String,
    queue: Option<String>,
    error: Option<String>,
}

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "queue" => self.queue = Some(value.to_owned()),
            "error" => self.error = Some(value.to_owned()),
            "message" => self.message = value.to_owned(),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{value:?}");
            }
            "queue" => self.queue = Some(format!("{value:?}")),
            "error" => self.error = Some(format!("{value:?}")),
            _ => {}
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for JournalLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        event.record(&mut fields);
        let mut line = format!(
            "{} {} {}",
            event.metadata().level(),
            fields.queue.as_deref().unwrap_or("-"),
            fields.message
        );
        if let Some(error) = fields.error {
            let _ = write!(line, " | {error}");
        }
        self.0.record(line);
    }
}

type Sender = mpsc::UnboundedSender<Result<Delivery, anyhow::Error>>;

/// An in-memory stand-in for a broker channel.
pub struct MockChannel {
    queues: HashSet<String>,
    journal: Journal,
    open: AtomicBool,
    fail_qos: AtomicBool,
    fail_consume: AtomicBool,
    fail_acks: AtomicBool,
    closed: AtomicBool,
    next_delivery_tag: AtomicU64,
    prefetch: Mutex<Option<u16>>,
    /// Consumer tag -> queue, for consumers that have not been cancelled.
    consumers: Mutex<HashMap<String, String>>,
    cancelled: Mutex<Vec<String>>,
    /// Queues passed to `queue_declare_passive`, in call order.
    declared: Mutex<Vec<String>>,
    acks: Mutex<Vec<DeliveryTag>>,
    /// Queue -> feed of its registered consumer.
    feeds: Mutex<HashMap<String, Sender>>,
}

impl MockChannel {
    pub fn new(queues: &[&str], journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            queues: queues.iter().map(|q| (*q).to_owned()).collect(),
            journal,
            open: AtomicBool::new(true),
            fail_qos: AtomicBool::new(false),
            fail_consume: AtomicBool::new(false),
            fail_acks: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_delivery_tag: AtomicU64::new(1),
            prefetch: Mutex::new(None),
            consumers: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(Vec::new()),
            declared: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            feeds: Mutex::new(HashMap::new()),
        })
    }

    /// Push a message to the consumer of `queue`. Returns its delivery tag.
    pub fn deliver(&self, queue: &str, body: &[u8]) -> DeliveryTag {
        self.deliver_with(queue, BasicProperties::default(), body)
    }

    pub fn deliver_with(
        &self,
        queue: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> DeliveryTag {
        let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            envelope: Envelope {
                delivery_tag,
                exchange: "".into(),
                routing_key: queue.into(),
                redelivered: false,
            },
            properties,
            body: body.to_vec(),
        };
        self.feed(queue).send(Ok(delivery)).unwrap();
        delivery_tag
    }

    /// Make the delivery stream of `queue` fail.
    pub fn break_stream(&self, queue: &str, error: &str) {
        self.feed(queue).send(Err(anyhow::anyhow!(error.to_owned()))).unwrap();
    }

    /// The broker stops pushing to `queue`: its delivery stream ends once drained.
    pub fn end_stream(&self, queue: &str) {
        self.feeds.lock().unwrap().remove(queue);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn fail_qos(&self) {
        self.fail_qos.store(true, Ordering::SeqCst);
    }

    pub fn fail_consume(&self) {
        self.fail_consume.store(true, Ordering::SeqCst);
    }

    pub fn fail_acks(&self) {
        self.fail_acks.store(true, Ordering::SeqCst);
    }

    pub fn prefetch(&self) -> Option<u16> {
        *self.prefetch.lock().unwrap()
    }

    pub fn active_consumers(&self) -> Vec<String> {
        self.consumers.lock().unwrap().values().cloned().collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn declared(&self) -> Vec<String> {
        self.declared.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<DeliveryTag> {
        self.acks.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn feed(&self, queue: &str) -> Sender {
        self.feeds
            .lock()
            .unwrap()
            .get(queue)
            .cloned()
            .unwrap_or_else(|| panic!("no consumer registered on `{queue}`"))
    }
}

#[async_trait::async_trait]
impl ConsumerChannel for MockChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        if self.fail_qos.load(Ordering::SeqCst) {
            anyhow::bail!("qos refused");
        }
        *self.prefetch.lock().unwrap() = Some(prefetch_count);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error> {
        if self.fail_consume.load(Ordering::SeqCst) {
            anyhow::bail!("ACCESS_REFUSED - consume on queue '{}'", queue);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().insert(queue.to_owned(), sender);
        self.consumers
            .lock()
            .unwrap()
            .insert(consumer_tag.to_owned(), queue.to_owned());
        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        });
        Ok(stream.boxed())
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<(), anyhow::Error> {
        self.declared.lock().unwrap().push(queue.to_owned());
        if self.queues.contains(queue) {
            Ok(())
        } else {
            anyhow::bail!("NOT_FOUND - no queue '{}'", queue)
        }
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error> {
        if self.fail_acks.load(Ordering::SeqCst) {
            anyhow::bail!("channel error on ack");
        }
        self.acks.lock().unwrap().push(delivery_tag);
        self.journal.record(format!("ack {delivery_tag}"));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        if let Some(queue) = self.consumers.lock().unwrap().remove(consumer_tag) {
            self.feeds.lock().unwrap().remove(&queue);
        }
        self.cancelled.lock().unwrap().push(consumer_tag.to_owned());
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out pre-built channels, in order.
#[derive(Clone)]
pub struct MockChannelFactory {
    channels: Arc<Mutex<Vec<Arc<MockChannel>>>>,
}

impl MockChannelFactory {
    pub fn new(channels: Vec<Arc<MockChannel>>) -> Self {
        Self {
            channels: Arc::new(Mutex::new(channels.into_iter().rev().collect())),
        }
    }
}

#[async_trait::async_trait]
impl ChannelFactory for MockChannelFactory {
    async fn create_channel(&self) -> Result<Arc<dyn ConsumerChannel>, anyhow::Error> {
        match self.channels.lock().unwrap().pop() {
            Some(channel) => Ok(channel),
            None => anyhow::bail!("connection refused"),
        }
    }
}

/// A handler whose behaviour is a plain function of the message body.
pub struct TestHandler {
    pub queue: &'static str,
    pub name: &'static str,
    pub prefetch: u16,
    pub log_time: bool,
    pub journal: Journal,
    pub outcome: fn(&str) -> Result<(), anyhow::Error>,
}

impl TestHandler {
    pub fn new(queue: &'static str, name: &'static str, journal: &Journal) -> Self {
        Self {
            queue,
            name,
            prefetch: hutch::consumers::DEFAULT_PREFETCH_COUNT,
            log_time: false,
            journal: journal.clone(),
            outcome: |_| Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Handler for TestHandler {
    fn queue(&self) -> &str {
        self.queue
    }

    fn prefetch(&self) -> u16 {
        self.prefetch
    }

    fn is_log_time(&self) -> bool {
        self.log_time
    }

    fn name(&self) -> &str {
        self.name
    }

    async fn on_message(&self, message: &Message) -> Result<(), anyhow::Error> {
        let body = message.body_as_str()?;
        self.journal.record(format!("{} got {}", self.name, body));
        (self.outcome)(body)
    }
}

/// An error handler that records its invocations, then succeeds or fails with `failure`.
pub struct RecordingErrorHandler {
    pub name: &'static str,
    pub journal: Journal,
    pub failure: Option<&'static str>,
}

#[async_trait::async_trait]
impl ErrorHandler for RecordingErrorHandler {
    async fn handle(
        &self,
        handler: &dyn Handler,
        message: &Message,
        error: &HandlerError,
    ) -> Result<(), anyhow::Error> {
        self.journal.record(format!(
            "{} saw {} on {} ({})",
            self.name,
            handler.name(),
            message.properties().consumer_queue,
            error
        ));
        match self.failure {
            Some(failure) => anyhow::bail!(failure),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        self.name
    }
}
