//! Two-phase open/close lifecycle for services that publish an instance
//! through a [`PermitManager`].
//!
//! `open()` activates the instance, `close()` stops new callers and drains
//! the ones in flight. Request handlers go through `with_shared()` or
//! `with_exclusive()`, which hold a permit for exactly the duration of the
//! request.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{PermitError, Result};
use crate::key::StateKey;
use crate::permit::PermitManager;

pub struct Component<T> {
    manager: Arc<PermitManager>,
    key: StateKey<T>,
    open: AtomicBool,
}

impl<T> Component<T>
where
    T: Any + Send + Sync,
{
    pub fn new(manager: Arc<PermitManager>, key: StateKey<T>) -> Self {
        Self {
            manager,
            key,
            open: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &StateKey<T> {
        &self.key
    }

    pub fn manager(&self) -> &Arc<PermitManager> {
        &self.manager
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Activate `instance` and start accepting requests.
    pub fn open(&self, instance: impl Into<Arc<T>>) -> Result<u64> {
        let generation = self.manager.activate(&self.key, instance)?;
        self.open.store(true, Ordering::Release);
        tracing::info!(component = %self.key, generation, "Component opened");
        Ok(generation)
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        self.manager.deactivate(&self.key).await?;
        tracing::info!(component = %self.key, "Component closed");
        Ok(())
    }

    /// Like [`close`](Self::close), but gives up after `timeout`. The
    /// component stays closed either way; it can be reopened with a fresh
    /// instance once the caller decides what to do about the stuck requests.
    pub async fn close_timeout(&self, timeout: Duration) -> Result<()> {
        self.open.store(false, Ordering::Release);
        self.manager.deactivate_timeout(&self.key, timeout).await?;
        tracing::info!(component = %self.key, "Component closed");
        Ok(())
    }

    pub fn assert_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(PermitError::invalid_state(
                self.key.name(),
                "component is not open",
            ))
        }
    }

    pub async fn with_shared<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = R>,
    {
        self.assert_open()?;
        self.manager.with_permit(&self.key, false, f).await
    }

    pub async fn with_exclusive<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = R>,
    {
        self.assert_open()?;
        self.manager.with_permit(&self.key, true, f).await
    }
}

impl<T> Drop for Component<T> {
    fn drop(&mut self) {
        if self.open.load(Ordering::Acquire) {
            tracing::warn!(component = %self.key, "Component dropped while open");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct ContainerRegistry {
        created: Mutex<Vec<String>>,
    }

    impl ContainerRegistry {
        fn create(&self, name: &str) {
            self.created
                .lock()
                .unwrap()
                .push(name.to_string());
        }

        fn count(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    fn component() -> Component<ContainerRegistry> {
        Component::new(
            Arc::new(PermitManager::new()),
            StateKey::new("containers").unwrap(),
        )
    }

    #[tokio::test]
    async fn requests_require_open_component() {
        let component = component();
        assert!(!component.is_open());

        let err = component.with_shared(|_| async {}).await.unwrap_err();
        assert_eq!(
            err,
            PermitError::InvalidState {
                key: "containers".to_string(),
                reason: "component is not open".to_string(),
            }
        );

        component.open(ContainerRegistry::default()).unwrap();
        component.assert_open().unwrap();
        component
            .with_exclusive(|registry| async move { registry.create("child1") })
            .await
            .unwrap();
        let count = component
            .with_shared(|registry| async move { registry.count() })
            .await
            .unwrap();
        assert_eq!(count, 1);

        component.close().await.unwrap();
        assert!(component.assert_open().is_err());
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_request() {
        let component = Arc::new(component());
        component.open(ContainerRegistry::default()).unwrap();

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();
        let request = tokio::spawn({
            let component = Arc::clone(&component);
            async move {
                component
                    .with_exclusive(|registry| async move {
                        let _ = entered_tx.send(());
                        let _ = finish_rx.await;
                        registry.create("child1");
                    })
                    .await
            }
        });
        entered_rx.await.unwrap();

        let err = component
            .close_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!component.is_open());

        finish_tx.send(()).unwrap();
        request.await.unwrap().unwrap();
        component.close().await.unwrap();
        assert!(!component.manager().is_active(component.key()));
    }

    #[tokio::test]
    async fn reopen_after_close() {
        let component = component();
        assert_eq!(component.open(ContainerRegistry::default()).unwrap(), 1);
        assert!(component.open(ContainerRegistry::default()).is_err());

        component.close().await.unwrap();
        assert_eq!(component.open(ContainerRegistry::default()).unwrap(), 2);
        let count = component
            .with_shared(|registry| async move { registry.count() })
            .await
            .unwrap();
        assert_eq!(count, 0);
        component.close().await.unwrap();
    }
}
