//! A single-owner actor that runs dynamically typed requests against its context.
//!
//! The context (node state plus the rule compiler) is owned by one task. Callers submit closures
//! that borrow it mutably for the duration of a future; requests are processed one at a time in
//! the order they were received, so two compilations can never interleave.

use std::{any::Any, future::Future, marker::PhantomData, pin::Pin};

use tokio::sync::{mpsc, oneshot};

/// A syntax-sugar alias for a trait object which is `Any + Send + 'static`.
type AnySendStatic = dyn Any + Send + 'static;

/// Alias for a [`Future`] trait object that can be [`Send`], borrowing from the context for `'a`.
pub type DynFuture<'a, T = Box<AnySendStatic>> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed function that, given a mutable reference to `Ctx`, produces a future.
type DynTask<Ctx> = Box<dyn for<'a> FnOnce(&'a mut Ctx) -> DynFuture<'a> + Send + 'static>;

/// A type-erased request together with the channel for its result.
struct Request<Ctx> {
    task: DynTask<Ctx>,
    tx: oneshot::Sender<Box<AnySendStatic>>,
}

/// Errors returned to a caller of [`Mailbox::call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    #[error("actor is no longer running")]
    Closed,
    #[error("actor dropped the request")]
    Dropped,
    #[error("actor returned an unexpected response type")]
    Mismatch,
}

/// The sending half of an actor's inbox. Cheap to clone.
pub struct Mailbox<Ctx> {
    tx: mpsc::Sender<Request<Ctx>>,
}

impl<Ctx> Clone for Mailbox<Ctx> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<Ctx> std::fmt::Debug for Mailbox<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("capacity", &self.tx.capacity()).finish()
    }
}

/// A response that has been submitted but not yet received.
pub struct Pending<T: 'static> {
    rx: oneshot::Receiver<Box<AnySendStatic>>,
    _marker: PhantomData<T>,
}

impl<T: 'static> Pending<T> {
    /// Waits for the actor to run the request and downcasts its result.
    pub async fn receive(self) -> Result<T, MailboxError> {
        let value = self.rx.await.map_err(|_| MailboxError::Dropped)?;
        value.downcast::<T>().map(|value| *value).map_err(|_| MailboxError::Mismatch)
    }
}

impl<Ctx> Mailbox<Ctx> {
    /// Enqueues `f` to be run with exclusive access to the actor's context.
    pub async fn submit<T, F>(&self, f: F) -> Result<Pending<T>, MailboxError>
    where
        T: Any + Send + 'static,
        F: for<'a> FnOnce(&'a mut Ctx) -> DynFuture<'a, T> + Send + 'static,
    {
        let task: DynTask<Ctx> = Box::new(move |ctx: &mut Ctx| {
            let fut = f(ctx);
            Box::pin(async move { Box::new(fut.await) as Box<AnySendStatic> })
        });

        let (tx, rx) = oneshot::channel();
        self.tx.send(Request { task, tx }).await.map_err(|_| MailboxError::Closed)?;

        Ok(Pending { rx, _marker: PhantomData })
    }

    /// Submits `f` and waits for its result.
    pub async fn call<T, F>(&self, f: F) -> Result<T, MailboxError>
    where
        T: Any + Send + 'static,
        F: for<'a> FnOnce(&'a mut Ctx) -> DynFuture<'a, T> + Send + 'static,
    {
        self.submit(f).await?.receive().await
    }
}

/// The receiving half of an actor's inbox.
pub struct Inbox<Ctx> {
    rx: mpsc::Receiver<Request<Ctx>>,
}

impl<Ctx> std::fmt::Debug for Inbox<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox").field("queued", &self.rx.len()).finish()
    }
}

impl<Ctx> Inbox<Ctx> {
    /// Runs every request against `ctx`, in order, until all mailboxes are dropped.
    pub async fn serve(mut self, mut ctx: Ctx) -> Ctx {
        while let Some(Request { task, tx }) = self.rx.recv().await {
            let value = task(&mut ctx).await;
            // The caller may have given up waiting.
            let _ = tx.send(value);
        }

        ctx
    }
}

/// Creates a bounded actor inbox.
pub fn channel<Ctx>(buffer: usize) -> (Mailbox<Ctx>, Inbox<Ctx>) {
    let (tx, rx) = mpsc::channel(buffer);
    (Mailbox { tx }, Inbox { rx })
}
