//! The command handler map — the API dispatcher is an external
//! collaborator per the transport's own scope; this crate supplies it as a
//! plain `command -> async fn(Envelope) -> Result<Value, HandlerError>` map,
//! plus the two built-ins needed to exercise a bridge without a real
//! upstream API.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use atlas_core::value::Value;
use atlas_core::Envelope;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("unknown command: {0}")]
    NotFound(String),
    #[error("{0}")]
    Failed(String),
}

pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<Result<Value, HandlerError>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerMap {
    handlers: HashMap<String, Handler>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: impl Into<String>, handler: Handler) {
        self.handlers.insert(command.into(), handler);
    }

    pub fn with_builtins() -> Self {
        let mut map = Self::new();
        map.register("test_echo", Arc::new(|env| Box::pin(test_echo(env))));
        map.register("health_check", Arc::new(|env| Box::pin(health_check(env))));
        map
    }

    pub async fn dispatch(&self, command: &str, env: Envelope) -> Result<Value, HandlerError> {
        match self.handlers.get(command) {
            Some(handler) => handler(env).await,
            None => Err(HandlerError::NotFound(command.to_string())),
        }
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }
}

async fn test_echo(env: Envelope) -> Result<Value, HandlerError> {
    Ok(Value::map([
        ("echo".to_string(), env.data),
        ("id".to_string(), Value::String(env.id)),
    ]))
}

async fn health_check(_env: Envelope) -> Result<Value, HandlerError> {
    Ok(Value::map([("status".to_string(), Value::String("ok".to_string()))]))
}
