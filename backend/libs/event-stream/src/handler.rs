//! Startup-time handler registration.
//!
//! Application wiring registers one closure per (event type, owner). Each binding is typed:
//! the payload is deserialized into the handler's parameter type before the call, so a
//! binding whose type cannot hold the event fails that dispatch instead of silently
//! receiving the wrong shape.

use crate::error::{StreamError, StreamResult};
use crate::event::IntegrationEvent;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

type Invoker = Arc<dyn Fn(&IntegrationEvent) -> HandlerFuture + Send + Sync>;

/// What a handler receives: the envelope with its payload already deserialized.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedEvent<P> {
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
    pub payload: P,
}

impl<P: DeserializeOwned> TypedEvent<P> {
    fn from_event(event: &IntegrationEvent) -> anyhow::Result<Self> {
        let payload = P::deserialize(&event.payload).map_err(|e| {
            anyhow::anyhow!(
                "payload of {} event {} does not fit {}: {}",
                event.event_type,
                event.event_id,
                std::any::type_name::<P>(),
                e
            )
        })?;
        Ok(Self {
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            occurred_at: event.occurred_at,
            metadata: event.metadata.clone(),
            payload,
        })
    }
}

#[derive(Clone)]
pub struct HandlerBinding {
    event_type: String,
    owner: String,
    payload_type: &'static str,
    is_async: bool,
    invoke: Invoker,
}

impl HandlerBinding {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn payload_type(&self) -> &'static str {
        self.payload_type
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub async fn invoke(&self, event: &IntegrationEvent) -> anyhow::Result<()> {
        (self.invoke)(event).await
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("event_type", &self.event_type)
            .field("owner", &self.owner)
            .field("payload_type", &self.payload_type)
            .field("is_async", &self.is_async)
            .finish()
    }
}

/// Event type -> bindings, in registration order.
#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    bindings: HashMap<String, Vec<HandlerBinding>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `event_type`. It runs inline in the consume loop.
    pub fn register<P, F, Fut>(
        &mut self,
        event_type: &str,
        owner: &str,
        handler: F,
    ) -> StreamResult<&mut Self>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(TypedEvent<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let invoke: Invoker = Arc::new(move |event: &IntegrationEvent| {
            match TypedEvent::<P>::from_event(event) {
                Ok(typed) => handler(typed).boxed(),
                Err(e) => futures::future::ready(Err(e)).boxed(),
            }
        });
        self.insert(event_type, owner, std::any::type_name::<P>(), false, invoke)
    }

    /// Bind `handler` to `event_type`, running each call on its own task.
    ///
    /// The loop still waits for the result; a panic inside the handler becomes a handler
    /// error instead of unwinding through the consumer.
    pub fn register_async<P, F, Fut>(
        &mut self,
        event_type: &str,
        owner: &str,
        handler: F,
    ) -> StreamResult<&mut Self>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(TypedEvent<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let invoke: Invoker = Arc::new(move |event: &IntegrationEvent| {
            match TypedEvent::<P>::from_event(event) {
                Ok(typed) => {
                    let task = tokio::spawn(handler(typed));
                    async move {
                        match task.await {
                            Ok(result) => result,
                            Err(join_error) => {
                                Err(anyhow::anyhow!("handler task failed: {}", join_error))
                            }
                        }
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(e)).boxed(),
            }
        });
        self.insert(event_type, owner, std::any::type_name::<P>(), true, invoke)
    }

    fn insert(
        &mut self,
        event_type: &str,
        owner: &str,
        payload_type: &'static str,
        is_async: bool,
        invoke: Invoker,
    ) -> StreamResult<&mut Self> {
        if event_type.trim().is_empty() {
            return Err(StreamError::InvalidHandler(format!(
                "{} registered a handler without an event type",
                owner
            )));
        }
        if owner.trim().is_empty() {
            return Err(StreamError::InvalidHandler(format!(
                "handler for {} has no owner",
                event_type
            )));
        }

        let bindings = self.bindings.entry(event_type.to_string()).or_default();
        if bindings.iter().any(|b| b.owner == owner) {
            return Err(StreamError::InvalidHandler(format!(
                "{} already handles {}",
                owner, event_type
            )));
        }
        bindings.push(HandlerBinding {
            event_type: event_type.to_string(),
            owner: owner.to_string(),
            payload_type,
            is_async,
            invoke,
        });
        Ok(self)
    }

    pub fn bindings_for(&self, event_type: &str) -> &[HandlerBinding] {
        self.bindings
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn event_type_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn handler_count(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }

    pub(crate) fn into_bindings(self) -> HashMap<String, Vec<HandlerBinding>> {
        self.bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize)]
    struct LikeCreated {
        post_id: u64,
    }

    #[tokio::test]
    async fn test_typed_dispatch() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        let mut registry = HandlerRegistry::new();
        registry
            .register("LikeCreated", "like-projector", move |event: TypedEvent<LikeCreated>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(event.payload.post_id as usize, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        let binding = &registry.bindings_for("LikeCreated")[0];
        assert!(binding.payload_type().ends_with("LikeCreated"));
        assert!(!binding.is_async());

        let event = IntegrationEvent::with_id("e1", "LikeCreated", json!({"post_id": 7}));
        binding.invoke(&event).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_payload_mismatch_is_handler_error() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("LikeCreated", "like-projector", |_: TypedEvent<LikeCreated>| async {
                Ok(())
            })
            .unwrap();

        let event = IntegrationEvent::with_id("e1", "LikeCreated", json!({"post": "x"}));
        let err = registry.bindings_for("LikeCreated")[0]
            .invoke(&event)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }

    #[tokio::test]
    async fn test_async_binding_panic_becomes_error() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_async("Boom", "exploder", |_: TypedEvent<serde_json::Value>| async {
                if true {
                    panic!("handler blew up");
                }
                Ok(())
            })
            .unwrap();

        let binding = &registry.bindings_for("Boom")[0];
        assert!(binding.is_async());
        let event = IntegrationEvent::with_id("e1", "Boom", json!({}));
        assert!(binding.invoke(&event).await.is_err());
    }

    #[test]
    fn test_registration_validation() {
        let mut registry = HandlerRegistry::new();
        let noop = |_: TypedEvent<serde_json::Value>| async { Ok::<(), anyhow::Error>(()) };

        registry.register("A", "owner-1", noop).unwrap();
        registry.register("A", "owner-2", noop).unwrap();
        registry.register("B", "owner-1", noop).unwrap();

        assert!(matches!(
            registry.register("A", "owner-1", noop),
            Err(StreamError::InvalidHandler(_))
        ));
        assert!(registry.register("", "owner-1", noop).is_err());
        assert!(registry.register("C", " ", noop).is_err());

        assert_eq!(registry.event_type_count(), 2);
        assert_eq!(registry.handler_count(), 3);
        assert!(registry.bindings_for("missing").is_empty());
    }
}
