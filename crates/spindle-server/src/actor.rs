//! A minimal actor runtime.
//!
//! Each actor owns its state exclusively and processes one message at a time,
//! so no locks are needed around the state. Timers and background futures
//! communicate back to the actor by sending messages to its own mailbox.

use std::future::Future;
use std::time::Duration;

use fastrace::collector::SpanContext;
use fastrace::Span;
use log::{error, warn};
use spindle_telemetry::common::SpanAssociation;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("the {0} actor has stopped")]
    Stopped(&'static str),
}

pub type ActorResult<T> = Result<T, ActorError>;

pub trait Actor: Sized + Send + 'static {
    type Message: SpanAssociation + Send + 'static;
    type Options: Send + 'static;

    /// A short name for the actor used in log messages.
    fn name() -> &'static str;
    fn new(options: Self::Options) -> Self;
    fn start(&mut self, _ctx: &mut ActorContext<Self>) {}
    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction;
    fn stop(self, _ctx: &mut ActorContext<Self>) {}
}

#[derive(Debug)]
pub enum ActorAction {
    Continue,
    /// Continue processing messages after logging a warning.
    Warn(String),
    /// Stop the actor after logging an error.
    Fail(String),
    Stop,
}

impl ActorAction {
    pub fn warn(message: impl ToString) -> Self {
        ActorAction::Warn(message.to_string())
    }

    pub fn fail(message: impl ToString) -> Self {
        ActorAction::Fail(message.to_string())
    }
}

pub struct ActorHandle<T>
where
    T: Actor,
{
    sender: mpsc::UnboundedSender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T> Clone for ActorHandle<T>
where
    T: Actor,
{
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    /// Appends a message to the end of the actor mailbox.
    pub fn send(&self, message: T::Message) -> ActorResult<()> {
        self.sender
            .send(message)
            .map_err(|_| ActorError::Stopped(T::name()))
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn wait_for_stop(mut self) {
        // We ignore the receiver error since the sender must have been dropped in this case,
        // which means the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

/// The context passed to the actor for every message.
///
/// Background futures spawned via the context are aborted when the actor stops.
pub struct ActorContext<T: Actor> {
    handle: ActorHandle<T>,
    tasks: JoinSet<()>,
}

impl<T: Actor> ActorContext<T> {
    fn new(handle: ActorHandle<T>) -> Self {
        Self {
            handle,
            tasks: JoinSet::new(),
        }
    }

    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    /// Sends a message to the actor itself.
    /// The message is processed after all the messages already in the mailbox,
    /// which makes this the way to defer work to the next turn of the actor.
    pub fn send(&mut self, message: T::Message) {
        if let Err(e) = self.handle.send(message) {
            warn!("failed to send message to self: {e}");
        }
    }

    /// Sends a message to the actor itself after a delay.
    pub fn send_with_delay(&mut self, message: T::Message, delay: Duration) {
        let handle = self.handle.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = handle.send(message);
        });
    }

    pub fn spawn(&mut self, task: impl Future<Output = ()> + Send + 'static) {
        self.reap();
        self.tasks.spawn(task);
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("{} actor task panicked: {e}", T::name());
                }
            }
        }
    }
}

async fn run<T: Actor>(
    mut actor: T,
    mut ctx: ActorContext<T>,
    mut receiver: mpsc::UnboundedReceiver<T::Message>,
) {
    actor.start(&mut ctx);
    while let Some(message) = receiver.recv().await {
        let span = Span::root(message.name(), SpanContext::random())
            .with_properties(|| message.properties());
        let _guard = span.set_local_parent();
        match actor.receive(&mut ctx, message) {
            ActorAction::Continue => {}
            ActorAction::Warn(message) => {
                warn!("{} actor: {message}", T::name());
            }
            ActorAction::Fail(message) => {
                error!("{} actor failed: {message}", T::name());
                break;
            }
            ActorAction::Stop => break,
        }
    }
    receiver.close();
    actor.stop(&mut ctx);
    ctx.tasks.shutdown().await;
}

fn spawn_actor<T: Actor>(options: T::Options) -> (ActorHandle<T>, impl Future<Output = ()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (stopped_tx, stopped_rx) = watch::channel::<bool>(false);
    let handle = ActorHandle {
        sender: tx,
        stopped: stopped_rx,
    };
    let actor = T::new(options);
    let ctx = ActorContext::new(handle.clone());
    let task = async move {
        run(actor, ctx, rx).await;
        let _ = stopped_tx.send(true);
    };
    (handle, task)
}

impl<T: Actor> ActorHandle<T> {
    /// Spawns the actor on the current Tokio runtime.
    pub fn new(options: T::Options) -> Self {
        let (handle, task) = spawn_actor(options);
        tokio::spawn(task);
        handle
    }
}

/// A group of actors that can be joined together.
pub struct ActorSystem {
    tasks: JoinSet<()>,
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorSystem {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
        }
    }

    pub fn spawn<T: Actor>(&mut self, options: T::Options) -> ActorHandle<T> {
        let (handle, task) = spawn_actor(options);
        self.tasks.spawn(task);
        handle
    }

    /// Waits for all actors in the system to stop.
    pub async fn join(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("actor task failed: {e}");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::borrow::Cow;

    use tokio::sync::oneshot;

    use super::*;

    struct TestActor {
        count: usize,
    }

    enum TestMessage {
        Echo {
            value: String,
            reply: oneshot::Sender<String>,
        },
        Count {
            reply: oneshot::Sender<usize>,
        },
        Increment,
        IncrementLater {
            delay: Duration,
        },
        Fail,
        Stop,
    }

    impl SpanAssociation for TestMessage {
        fn name(&self) -> Cow<'static, str> {
            "TestMessage".into()
        }

        fn properties(&self) -> impl IntoIterator<Item = (Cow<'static, str>, Cow<'static, str>)> {
            vec![]
        }
    }

    impl Actor for TestActor {
        type Message = TestMessage;
        type Options = ();

        fn name() -> &'static str {
            "test"
        }

        fn new(_options: Self::Options) -> Self {
            Self { count: 0 }
        }

        fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction {
            match message {
                TestMessage::Echo { value, reply } => {
                    let _ = reply.send(value.to_uppercase());
                    ActorAction::Continue
                }
                TestMessage::Count { reply } => {
                    let _ = reply.send(self.count);
                    ActorAction::Continue
                }
                TestMessage::Increment => {
                    self.count += 1;
                    ActorAction::Continue
                }
                TestMessage::IncrementLater { delay } => {
                    ctx.send_with_delay(TestMessage::Increment, delay);
                    ActorAction::Continue
                }
                TestMessage::Fail => ActorAction::fail("requested failure"),
                TestMessage::Stop => ActorAction::Stop,
            }
        }
    }

    async fn count(handle: &ActorHandle<TestActor>) -> usize {
        let (tx, rx) = oneshot::channel();
        handle.send(TestMessage::Count { reply: tx }).unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_actor_handle_send() {
        let handle = ActorHandle::<TestActor>::new(());
        assert!(!handle.is_stopped());
        let (tx, rx) = oneshot::channel();
        let result = handle.send(TestMessage::Echo {
            value: "hello".to_string(),
            reply: tx,
        });
        assert!(result.is_ok());
        assert_eq!(rx.await, Ok("HELLO".to_string()));
    }

    #[tokio::test]
    async fn test_actor_handle_wait_for_stop() {
        let handle = ActorHandle::<TestActor>::new(());
        assert!(handle.send(TestMessage::Stop).is_ok());

        handle.clone().wait_for_stop().await;
        // Multiple handles should be able to wait for the actor to stop.
        handle.clone().wait_for_stop().await;
        assert!(matches!(
            handle.send(TestMessage::Increment),
            Err(ActorError::Stopped("test"))
        ));
    }

    #[tokio::test]
    async fn test_actor_stops_on_failure() {
        let handle = ActorHandle::<TestActor>::new(());
        handle.send(TestMessage::Fail).unwrap();
        handle.clone().wait_for_stop().await;
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_actor_processes_messages_in_order() {
        let handle = ActorHandle::<TestActor>::new(());
        for _ in 0..3 {
            handle.send(TestMessage::Increment).unwrap();
        }
        assert_eq!(count(&handle).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_send_with_delay() {
        let handle = ActorHandle::<TestActor>::new(());
        handle
            .send(TestMessage::IncrementLater {
                delay: Duration::from_secs(10),
            })
            .unwrap();
        assert_eq!(count(&handle).await, 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(count(&handle).await, 0);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count(&handle).await, 1);
    }

    #[tokio::test]
    async fn test_actor_system_join() {
        let mut system = ActorSystem::new();
        let first = system.spawn::<TestActor>(());
        let second = system.spawn::<TestActor>(());
        first.send(TestMessage::Stop).unwrap();
        second.send(TestMessage::Stop).unwrap();
        system.join().await;
        assert!(first.is_stopped());
        assert!(second.is_stopped());
    }
}
