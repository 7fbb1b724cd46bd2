use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;

/// Spawn a background loop whose panics are logged instead of silently
/// swallowed by the runtime. Cleanup owned by the future (drop guards, queue
/// receivers) still runs while unwinding.
pub(crate) fn spawn_supervised<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            tracing::error!(task = name, panic = %panic_message(&panic), "Background task panicked");
        }
    })
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SetOnDrop(std::sync::Arc<std::sync::atomic::AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_cleanup_runs() {
        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let guard = SetOnDrop(dropped.clone());

        let handle = spawn_supervised("test", async move {
            let _guard = guard;
            panic!("boom");
        });

        // The task itself completes normally.
        handle.await.unwrap();
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
