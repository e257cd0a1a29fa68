//! Drive the async database clients from the blocking worker threads.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};

use crate::Error;

////////////////////////////////////////// BlockingClient //////////////////////////////////////////

/// A private tokio runtime plus the per-call timeout.
#[derive(Debug)]
pub struct BlockingClient {
    runtime: Option<Runtime>,
    timeout: Duration,
}

impl BlockingClient {
    /// Start a runtime whose threads are named after `name`.
    pub fn new(name: &str, timeout: Duration) -> Result<Self, Error> {
        let runtime = Builder::new_multi_thread()
            .thread_name(format!("pgmongo-bench-{name}"))
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            timeout,
        })
    }

    /// Run `f` to completion without a deadline.  Used during construction, where the client
    /// library applies its own connect timeouts.
    ///
    /// Callable from plain threads and from inside either flavor of tokio runtime.
    pub fn setup<F, T>(&self, f: F) -> T
    where
        F: Future<Output = T> + Send,
        T: Send,
    {
        let Some(runtime) = self.runtime.as_ref() else {
            unreachable!("the runtime is only taken on drop");
        };
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Err(_) => runtime.block_on(f),
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| runtime.block_on(f)),
            // A current-thread runtime cannot block in place; park it on a helper thread.
            Ok(_) => std::thread::scope(|scope| {
                match scope.spawn(|| runtime.block_on(f)).join() {
                    Ok(t) => t,
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }),
        }
    }

    /// Run `f` to completion or fail with [Error::Timeout].
    pub fn call<F, T, E>(&self, f: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Send,
        Error: From<E>,
    {
        let timeout = self.timeout;
        match self.setup(async move { tokio::time::timeout(timeout, f).await }) {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout),
        }
    }
}

impl Drop for BlockingClient {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which tokio forbids inside another runtime.
        if let Some(runtime) = self.runtime.take() {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            }
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_passes_results_through() {
        let client = BlockingClient::new("test", Duration::from_secs(1)).unwrap();
        let ok: Result<u64, Error> = client.call(async { Ok::<u64, Error>(42) });
        assert_eq!(42, ok.unwrap());
        let err: Result<u64, Error> = client.call(async { Err::<u64, Error>(Error::EmptyBackend) });
        assert!(matches!(err, Err(Error::EmptyBackend)));
    }

    #[test]
    fn call_times_out() {
        let client = BlockingClient::new("test", Duration::from_millis(10)).unwrap();
        let result = client.call(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), Error>(())
        });
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn usable_inside_current_thread_runtime() {
        let outer = Builder::new_current_thread().enable_all().build().unwrap();
        outer.block_on(async {
            let client = BlockingClient::new("test", Duration::from_secs(1)).unwrap();
            assert_eq!(7, client.setup(async { 7 }));
            let ok: Result<u64, Error> = client.call(async { Ok::<u64, Error>(42) });
            assert_eq!(42, ok.unwrap());
            drop(client);
        });
    }

    #[test]
    fn usable_inside_multi_thread_runtime() {
        let outer = Builder::new_multi_thread().enable_all().build().unwrap();
        outer.block_on(async {
            let client = BlockingClient::new("test", Duration::from_secs(1)).unwrap();
            assert_eq!(7, client.setup(async { 7 }));
            drop(client);
        });
    }
}
