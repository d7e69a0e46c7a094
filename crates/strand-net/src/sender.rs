//! Per-peer message sender.
//!
//! One outbound stream per peer, opened lazily. Requests are matched to
//! responses by `request_id` through a reader task that owns the read half
//! of the stream. A stream is recycled after [`STREAM_REUSE_TRIES`]
//! exchanges and reopened on the next send.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use strand_shared::constants::{READ_MESSAGE_TIMEOUT, SEND_TIMEOUT, STREAM_REUSE_TRIES};
use strand_shared::protocol::{Envelope, Message};
use strand_shared::{Keypair, PeerId};

use crate::error::NetError;
use crate::transport::{read_envelope, write_envelope, Dialer, FramedStream};

type PendingRequests = Arc<StdMutex<HashMap<u32, (u64, oneshot::Sender<Envelope>)>>>;

struct SenderState {
    sink: Option<SplitSink<FramedStream, Bytes>>,
    reader: Option<JoinHandle<()>>,
    /// Incremented for every stream opened; tags pending requests so a dying
    /// reader only fails the requests written on its own stream.
    generation: u64,
    exchanges: u32,
}

pub(crate) struct MessageSender {
    peer: PeerId,
    identity: Arc<Keypair>,
    dialer: Arc<dyn Dialer>,
    state: Mutex<SenderState>,
    requests: PendingRequests,
    read_timeout: Duration,
}

impl MessageSender {
    pub(crate) fn new(peer: PeerId, identity: Arc<Keypair>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            peer,
            identity,
            dialer,
            state: Mutex::new(SenderState {
                sink: None,
                reader: None,
                generation: 0,
                exchanges: 0,
            }),
            requests: Arc::new(StdMutex::new(HashMap::new())),
            read_timeout: READ_MESSAGE_TIMEOUT,
        }
    }

    pub(crate) fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Fire-and-forget. A failed write is retried once on a fresh stream.
    pub(crate) async fn send_message(&self, envelope: &Envelope) -> Result<(), NetError> {
        let mut state = self.state.lock().await;
        self.write_with_retry(&mut state, envelope, None).await?;
        self.finish_exchange(&mut state).await;
        Ok(())
    }

    /// Send `message` as a request and wait for the matching response.
    ///
    /// The sender stays locked for the whole exchange, so at most one request
    /// per peer is outstanding.
    pub(crate) async fn send_request(&self, mut message: Message) -> Result<Envelope, NetError> {
        let mut state = self.state.lock().await;

        let request_id = self.next_request_id();
        message.request_id = request_id;
        message.is_response = false;
        let envelope = Envelope::seal(&self.identity, message)?;

        let Some(rx) = self.write_with_retry(&mut state, &envelope, Some(request_id)).await? else {
            return Err(NetError::StreamClosed);
        };

        match tokio::time::timeout(self.read_timeout, rx).await {
            Ok(Ok(response)) => {
                self.finish_exchange(&mut state).await;
                Ok(response)
            }
            Ok(Err(_)) => {
                self.forget_request(request_id);
                self.reset(&mut state);
                Err(NetError::StreamClosed)
            }
            Err(_) => {
                self.forget_request(request_id);
                self.reset(&mut state);
                Err(NetError::ReadTimeout)
            }
        }
    }

    /// Write `envelope`, reopening the stream and retrying once on failure.
    /// A request is registered afresh against whichever stream carries it and
    /// the receiver for its response is returned.
    async fn write_with_retry(
        &self,
        state: &mut SenderState,
        envelope: &Envelope,
        request_id: Option<u32>,
    ) -> Result<Option<oneshot::Receiver<Envelope>>, NetError> {
        let mut retried = false;
        loop {
            self.prep(state).await?;

            let rx = request_id.map(|id| {
                let (tx, rx) = oneshot::channel();
                self.register_request(id, state.generation, tx);
                rx
            });

            let result = match state.sink.as_mut() {
                Some(sink) => {
                    match tokio::time::timeout(SEND_TIMEOUT, write_envelope(sink, envelope)).await {
                        Ok(result) => result,
                        Err(_) => Err(NetError::Io(std::io::ErrorKind::TimedOut.into())),
                    }
                }
                None => Err(NetError::StreamClosed),
            };

            match result {
                Ok(()) => return Ok(rx),
                Err(e) => {
                    if let Some(id) = request_id {
                        self.forget_request(id);
                    }
                    self.reset(state);
                    if retried {
                        warn!(peer = %self.peer.short(), error = %e, "Send failed after retry");
                        return Err(e);
                    }
                    debug!(peer = %self.peer.short(), error = %e, "Send failed, reopening stream");
                    retried = true;
                }
            }
        }
    }

    /// Open a stream if none is live.
    async fn prep(&self, state: &mut SenderState) -> Result<(), NetError> {
        if state.sink.is_some() {
            return Ok(());
        }

        let stream = tokio::time::timeout(SEND_TIMEOUT, self.dialer.dial(&self.peer))
            .await
            .map_err(|_| NetError::DialTimeout)??;
        let (sink, stream) = stream.split();

        state.generation += 1;
        state.exchanges = 0;
        state.sink = Some(sink);
        state.reader = Some(tokio::spawn(read_responses(
            self.peer,
            state.generation,
            stream,
            self.requests.clone(),
        )));
        Ok(())
    }

    async fn finish_exchange(&self, state: &mut SenderState) {
        state.exchanges += 1;
        if state.exchanges >= STREAM_REUSE_TRIES {
            debug!(peer = %self.peer.short(), "Recycling stream");
            if let Some(mut sink) = state.sink.take() {
                if let Err(e) = sink.close().await {
                    debug!(peer = %self.peer.short(), error = %e, "Failed to close recycled stream");
                }
            }
            self.reset(state);
        }
    }

    fn reset(&self, state: &mut SenderState) {
        state.sink = None;
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
    }

    fn next_request_id(&self) -> u32 {
        let requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let id: u32 = rand::random();
            if id != 0 && !requests.contains_key(&id) {
                return id;
            }
        }
    }

    fn register_request(&self, id: u32, generation: u64, tx: oneshot::Sender<Envelope>) {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.insert(id, (generation, tx));
    }

    fn forget_request(&self, id: u32) {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.remove(&id);
    }
}

/// Route responses on one stream to their waiting requests until the stream
/// ends, then fail whatever is still pending on it.
async fn read_responses(
    peer: PeerId,
    generation: u64,
    mut stream: SplitStream<FramedStream>,
    requests: PendingRequests,
) {
    loop {
        let envelope = match read_envelope(&mut stream).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "Outbound stream read failed");
                break;
            }
        };

        if envelope.verify().is_err() || envelope.sender() != peer {
            warn!(peer = %peer.short(), "Dropping stream after unverifiable response");
            break;
        }
        if !envelope.message.is_response {
            debug!(peer = %peer.short(), msg_type = ?envelope.message.msg_type, "Ignoring non-response on outbound stream");
            continue;
        }

        let waiter = {
            let mut pending = requests.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&envelope.message.request_id)
        };
        match waiter {
            Some((_, tx)) => {
                let _ = tx.send(envelope);
            }
            None => {
                debug!(peer = %peer.short(), request_id = envelope.message.request_id, "Response for unknown request");
            }
        }
    }

    let mut pending = requests.lock().unwrap_or_else(|e| e.into_inner());
    pending.retain(|_, (g, _)| *g != generation);
}
