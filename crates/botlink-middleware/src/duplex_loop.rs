//! [`DuplexStreamLoop`] – a [`StreamLoop`][crate::StreamLoop] plus an
//! ordered writer onto the same call.
//!
//! Outbound messages go through a bounded channel of depth one, so `send`
//! resolves only when the transport has room for the message.  Writes are
//! accepted only while the run is `Active`; once `end` begins, every later
//! `send` fails instead of racing the close.

use std::sync::Arc;

use async_trait::async_trait;
use botlink_types::{LinkError, StreamState};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::trace;

use crate::stream_loop::{LoopCore, LoopExit, LoopOptions, MessageHandler, StreamLifecycle};
use crate::transport::{DuplexCall, OutboundStream};

struct Writer<O> {
    generation: u64,
    tx: mpsc::Sender<O>,
}

/// Bidirectional loop: inbound messages go to the handler, outbound
/// messages are written with [`send`][Self::send].
pub struct DuplexStreamLoop<O, I> {
    core: Arc<LoopCore>,
    call: Arc<dyn DuplexCall<O, I>>,
    handler: MessageHandler<I>,
    writer: Arc<Mutex<Option<Writer<O>>>>,
}

impl<O, I> Clone for DuplexStreamLoop<O, I> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            call: Arc::clone(&self.call),
            handler: Arc::clone(&self.handler),
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<O, I> DuplexStreamLoop<O, I>
where
    O: Send + 'static,
    I: Send + 'static,
{
    pub fn new<F>(name: impl Into<String>, call: Arc<dyn DuplexCall<O, I>>, handler: F) -> Self
    where
        F: Fn(I) + Send + Sync + 'static,
    {
        Self::with_options(name, call, handler, LoopOptions::default())
    }

    pub fn with_options<F>(
        name: impl Into<String>,
        call: Arc<dyn DuplexCall<O, I>>,
        handler: F,
        options: LoopOptions,
    ) -> Self
    where
        F: Fn(I) + Send + Sync + 'static,
    {
        let core = Arc::new(LoopCore::new(name.into(), options));
        let writer: Arc<Mutex<Option<Writer<O>>>> = Arc::new(Mutex::new(None));

        // The writer never outlives its run.
        let run_writer = Arc::clone(&writer);
        core.on_ended(Arc::new(move |_: &LoopExit| {
            run_writer.lock().take();
        }));

        Self {
            core,
            call,
            handler: Arc::new(handler),
            writer,
        }
    }

    /// Open the call on a fresh background task.
    ///
    /// # Errors
    ///
    /// [`LinkError::AlreadyActive`] if a run is already in progress.
    pub async fn start(&self) -> Result<(), LinkError> {
        let ticket = self.core.begin_run()?;
        let (tx, rx) = mpsc::channel::<O>(1);
        *self.writer.lock() = Some(Writer {
            generation: ticket.generation(),
            tx,
        });

        let outbound: OutboundStream<O> = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .boxed();

        let (started_tx, started_rx) = oneshot::channel();
        let core = Arc::clone(&self.core);
        let call = Arc::clone(&self.call);
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            let open = async move { call.open(outbound).await };
            core.drive(ticket, started_tx, open, handler).await;
        });
        let _ = started_rx.await;
        Ok(())
    }

    /// Write one message, starting the loop first when it is not running.
    ///
    /// Messages from one caller reach the transport in call order.
    ///
    /// # Errors
    ///
    /// The captured fault when the loop could not be opened, otherwise
    /// [`LinkError::StreamClosed`] once the run is ending or has ended.
    pub async fn send(&self, message: O) -> Result<(), LinkError> {
        if self.core.state().can_start() {
            match self.start().await {
                Ok(()) | Err(LinkError::AlreadyActive(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.core.wait_while_starting().await;

        let (generation, tx) = match self.writer.lock().as_ref() {
            Some(w) => (w.generation, w.tx.clone()),
            None => return Err(self.core.closed_error()),
        };

        let mut state = self.core.state_watch();
        let permit = tokio::select! {
            biased;
            _ = state.wait_for(|s| !s.is_active()) => return Err(self.core.closed_error()),
            permit = tx.reserve() => permit.map_err(|_| self.core.closed_error())?,
        };

        self.core
            .with_active(generation, move || permit.send(message))
            .ok_or_else(|| self.core.closed_error())?;
        trace!(stream = %self.core.name(), "outbound message queued");
        Ok(())
    }

    /// Close the outbound side, cancel the run and wait for it to unwind.
    pub async fn end(&self) {
        self.writer.lock().take();
        self.core.end().await;
    }

    pub fn is_active(&self) -> bool {
        self.core.state().is_active()
    }

    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    pub fn last_fault(&self) -> Option<LinkError> {
        self.core.last_fault()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn on_ended<F>(&self, hook: F)
    where
        F: Fn(&LoopExit) + Send + Sync + 'static,
    {
        self.core.on_ended(Arc::new(hook));
    }

    pub fn state_watch(&self) -> watch::Receiver<StreamState> {
        self.core.state_watch()
    }
}

#[async_trait]
impl<O, I> StreamLifecycle for DuplexStreamLoop<O, I>
where
    O: Send + 'static,
    I: Send + 'static,
{
    fn name(&self) -> &str {
        self.core.name()
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

    async fn end(&self) {
        DuplexStreamLoop::end(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackDuplex;
    use std::time::Duration;

    fn echo() -> Arc<LoopbackDuplex<u32, u32>> {
        Arc::new(LoopbackDuplex::with_responder(|m: &u32| vec![*m * 10]))
    }

    #[tokio::test]
    async fn send_starts_the_loop_implicitly() {
        let remote = echo();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let call: Arc<dyn DuplexCall<u32, u32>> = remote.clone();
        let duplex = DuplexStreamLoop::new("playback", call, move |m| {
            let _ = tx.send(m);
        });

        assert_eq!(duplex.state(), StreamState::Idle);
        duplex.send(4).await.unwrap();
        assert!(duplex.is_active());

        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(reply, Some(40));
        duplex.end().await;
    }

    #[tokio::test]
    async fn outbound_messages_keep_call_order() {
        let remote = Arc::new(LoopbackDuplex::<u32, u32>::new());
        let call: Arc<dyn DuplexCall<u32, u32>> = remote.clone();
        let duplex = DuplexStreamLoop::new("control", call, |_| {});

        for i in 0..10 {
            duplex.send(i).await.unwrap();
        }
        remote.wait_for_sent(10).await;
        assert_eq!(remote.sent(), (0..10).collect::<Vec<_>>());
        duplex.end().await;
    }

    #[tokio::test]
    async fn send_after_end_opens_a_new_run() {
        let remote = echo();
        let call: Arc<dyn DuplexCall<u32, u32>> = remote.clone();
        let duplex = DuplexStreamLoop::new("control", call, |_| {});

        duplex.start().await.unwrap();
        duplex.send(1).await.unwrap();
        duplex.end().await;
        assert_eq!(duplex.state(), StreamState::Idle);

        // A fresh send opens a new run rather than writing to the old one.
        duplex.send(2).await.unwrap();
        assert_eq!(remote.open_count(), 2);
        duplex.end().await;
    }

    #[tokio::test]
    async fn send_reports_open_failure() {
        let remote = Arc::new(LoopbackDuplex::<u32, u32>::new());
        remote.fail_next_open(LinkError::transport("control", "unauthenticated"));
        let call: Arc<dyn DuplexCall<u32, u32>> = remote.clone();
        let duplex = DuplexStreamLoop::new("control", call, |_| {});

        let err = duplex.send(1).await.unwrap_err();
        assert!(matches!(err, LinkError::Transport { .. }));
        assert_eq!(duplex.state(), StreamState::Faulted);
        assert!(remote.sent().is_empty());
    }

    #[tokio::test]
    async fn ended_hook_sees_remote_close() {
        let remote = echo();
        let call: Arc<dyn DuplexCall<u32, u32>> = remote.clone();
        let duplex = DuplexStreamLoop::new("control", call, |_| {});
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        duplex.on_ended(move |exit| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(exit.clone());
            }
        });

        duplex.start().await.unwrap();
        remote.close();
        let exit = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.stream, "control");
        assert!(exit.fault.is_none());

        let mut state = duplex.state_watch();
        let _ = state.wait_for(|s| *s == StreamState::Idle).await;
        assert!(matches!(
            duplex.send(9).await,
            Ok(()) | Err(LinkError::StreamClosed(_))
        ));
    }

    #[tokio::test]
    async fn erased_lifecycle_ends_the_run() {
        let remote = echo();
        let call: Arc<dyn DuplexCall<u32, u32>> = remote.clone();
        let duplex = DuplexStreamLoop::new("control", call, |_| {});
        duplex.start().await.unwrap();

        let erased: Arc<dyn StreamLifecycle> = Arc::new(duplex.clone());
        assert!(erased.is_active());
        erased.end().await;
        assert!(!duplex.is_active());
    }

    struct PanicsOnOpen;

    #[async_trait]
    impl DuplexCall<u32, u32> for PanicsOnOpen {
        async fn open(
            &self,
            _outbound: OutboundStream<u32>,
        ) -> Result<crate::transport::InboundStream<u32>, LinkError> {
            panic!("transport bug")
        }
    }

    #[tokio::test]
    async fn panicking_open_fails_the_send_and_frees_the_loop() {
        let call: Arc<dyn DuplexCall<u32, u32>> = Arc::new(PanicsOnOpen);
        let duplex = DuplexStreamLoop::new("control", call, |_| {});

        let err = tokio::time::timeout(Duration::from_secs(1), duplex.send(1))
            .await
            .expect("send must settle after a panicking open")
            .unwrap_err();
        assert!(matches!(err, LinkError::Transport { .. }));
        assert_eq!(duplex.state(), StreamState::Faulted);
        assert!(duplex.start().await.is_ok());
    }
}
