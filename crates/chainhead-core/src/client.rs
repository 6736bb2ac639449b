//! Chain transport contract and the new-heads subscription handle.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ChainHeadError;
use crate::head::Head;

/// Source of heads for one chain.
#[async_trait]
pub trait HeadClient<H: Head>: Send + Sync + 'static {
    /// The chain this client was configured for.
    fn configured_chain_id(&self) -> H::ChainId;

    /// Fetch the head at `number`, or the latest head when `None`.
    ///
    /// `Ok(None)` means the node does not know that block (yet).
    async fn head_by_number(&self, number: Option<u64>) -> Result<Option<H>, ChainHeadError>;

    /// Open a new-heads subscription.
    async fn subscribe_new_heads(&self) -> Result<HeadSubscription<H>, ChainHeadError>;
}

/// What a subscription yields next.
#[derive(Debug)]
pub enum SubscriptionEvent<H> {
    /// A new head arrived.
    Head(H),
    /// The transport reported a failure; the subscription is dead.
    Error(ChainHeadError),
    /// The producer went away without reporting an error.
    Closed,
}

type UnsubscribeFn = Box<dyn FnOnce() + Send>;

/// Receiving half of a new-heads subscription.
///
/// Dropping the handle unsubscribes.
pub struct HeadSubscription<H> {
    heads: mpsc::Receiver<H>,
    errors: mpsc::Receiver<ChainHeadError>,
    on_unsubscribe: Option<UnsubscribeFn>,
}

impl<H: Send + 'static> HeadSubscription<H> {
    /// Build a subscription and the producer half that feeds it.
    ///
    /// `capacity` bounds the number of heads buffered between the transport and
    /// the listener.
    pub fn channel(capacity: usize) -> (Self, SubscriptionSender<H>) {
        let (heads_tx, heads_rx) = mpsc::channel(capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let subscription = Self {
            heads: heads_rx,
            errors: errors_rx,
            on_unsubscribe: None,
        };
        let sender = SubscriptionSender {
            heads: heads_tx,
            errors: errors_tx,
        };
        (subscription, sender)
    }

    /// Run `f` once when the subscription is unsubscribed or dropped.
    pub fn on_unsubscribe(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_unsubscribe = Some(Box::new(f));
        self
    }

    /// Wait for the next head or for the subscription to end.
    ///
    /// Buffered heads are handed out before a pending error. A closed error
    /// channel ends the subscription just like an explicit error.
    pub async fn next(&mut self) -> SubscriptionEvent<H> {
        tokio::select! {
            biased;
            head = self.heads.recv() => match head {
                Some(head) => SubscriptionEvent::Head(head),
                None => match self.errors.try_recv() {
                    Ok(err) => SubscriptionEvent::Error(err),
                    Err(_) => SubscriptionEvent::Closed,
                },
            },
            err = self.errors.recv() => match err {
                Some(err) => SubscriptionEvent::Error(err),
                None => SubscriptionEvent::Closed,
            },
        }
    }

    /// Stop receiving and release the transport-side registration.
    pub fn unsubscribe(&mut self) {
        self.heads.close();
        self.errors.close();
        if let Some(f) = self.on_unsubscribe.take() {
            f();
        }
    }
}

impl<H> Drop for HeadSubscription<H> {
    fn drop(&mut self) {
        if let Some(f) = self.on_unsubscribe.take() {
            f();
        }
    }
}

/// Producing half of a [`HeadSubscription`], held by the transport.
#[derive(Clone)]
pub struct SubscriptionSender<H> {
    heads: mpsc::Sender<H>,
    errors: mpsc::Sender<ChainHeadError>,
}

impl<H> SubscriptionSender<H> {
    /// Forward a head. Returns `false` once the subscriber is gone.
    pub async fn send_head(&self, head: H) -> bool {
        self.heads.send(head).await.is_ok()
    }

    /// Forward a head without waiting; the head is dropped if the buffer is
    /// full. Returns `false` once the subscriber is gone.
    pub fn try_send_head(&self, head: H) -> bool {
        match self.heads.try_send(head) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("subscription buffer full, dropping head");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Report a transport failure. Only the first error is kept.
    pub fn fail(&self, err: ChainHeadError) {
        let _ = self.errors.try_send(err);
    }

    /// `true` once the subscriber unsubscribed or was dropped.
    pub fn is_closed(&self) -> bool {
        self.heads.is_closed()
    }
}
