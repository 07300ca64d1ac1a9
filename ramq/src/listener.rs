use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CmsError;
use crate::message::Message;

/// Asynchronous delivery callback of a consumer. Returning an error, or panicking,
/// counts as a failed delivery and triggers local redelivery for AUTO and
/// INDIVIDUAL sessions.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: &Message) -> anyhow::Result<()>;
}

/// Connection level failure callback. Runs on the connection's own executor, never
/// on the transport's receive task.
pub trait ExceptionListener: Send + Sync {
    fn on_exception(&self, error: &CmsError);
}

struct FnMessageListener<F>(F);

#[async_trait]
impl<F> MessageListener for FnMessageListener<F>
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    #[inline]
    async fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        (self.0)(message)
    }
}

struct FnExceptionListener<F>(F);

impl<F> ExceptionListener for FnExceptionListener<F>
where
    F: Fn(&CmsError) + Send + Sync,
{
    #[inline]
    fn on_exception(&self, error: &CmsError) {
        (self.0)(error)
    }
}

#[inline]
pub fn message_listener_fn<F>(f: F) -> Arc<dyn MessageListener>
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnMessageListener(f))
}

#[inline]
pub fn exception_listener_fn<F>(f: F) -> Arc<dyn ExceptionListener>
where
    F: Fn(&CmsError) + Send + Sync + 'static,
{
    Arc::new(FnExceptionListener(f))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("listener panicked, {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("listener panicked, {}", s)
    } else {
        "listener panicked".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn closures_as_listeners() {
        let seen = Arc::new(AtomicUsize::new(0));
        let l = {
            let seen = seen.clone();
            message_listener_fn(move |m| {
                seen.fetch_add(m.body.len(), Ordering::SeqCst);
                Ok(())
            })
        };
        l.on_message(&Message::text("abc")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        let failing = message_listener_fn(|_| Err(anyhow::anyhow!("nope")));
        assert!(failing.on_message(&Message::text("x")).await.is_err());

        let errors = Arc::new(AtomicUsize::new(0));
        let e = {
            let errors = errors.clone();
            exception_listener_fn(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
        };
        e.on_exception(&CmsError::Closed);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_payloads() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "listener panicked, boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(p.as_ref()), "listener panicked, bang");
        let p: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(p.as_ref()), "listener panicked");
    }
}
