//! Handler trait and the per-call context handlers receive.

use crate::error::{ChatError, HandlerResult};
use crate::session::{CommandOptions, UserSession};
use crate::state::ChatMessage;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Everything a handler needs to run one command.
pub struct Context<'a> {
    pub session: &'a UserSession,
    pub options: &'a CommandOptions,
}

/// A command handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Number of positional arguments.
    fn arity(&self) -> usize;

    /// Trailing arguments that may be omitted.
    fn optional_args(&self) -> usize {
        0
    }

    /// Whether the command must arrive on a bound socket.
    fn requires_socket(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult;
}

/// Positional JSON arguments with typed accessors.
///
/// Accessors fail with `BadArgument(name)` on a missing or mistyped value.
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: Vec<Value>,
}

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index).filter(|v| !v.is_null())
    }

    pub fn string(&self, index: usize, name: &str) -> Result<String, ChatError> {
        self.get(index)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChatError::BadArgument(name.to_string()))
    }

    pub fn opt_string(&self, index: usize, name: &str) -> Result<Option<String>, ChatError> {
        match self.get(index) {
            None => Ok(None),
            Some(_) => self.string(index, name).map(Some),
        }
    }

    pub fn bool(&self, index: usize, name: &str) -> Result<bool, ChatError> {
        self.get(index)
            .and_then(Value::as_bool)
            .ok_or_else(|| ChatError::BadArgument(name.to_string()))
    }

    pub fn u64(&self, index: usize, name: &str) -> Result<u64, ChatError> {
        self.get(index)
            .and_then(Value::as_u64)
            .ok_or_else(|| ChatError::BadArgument(name.to_string()))
    }

    pub fn strings(&self, index: usize, name: &str) -> Result<Vec<String>, ChatError> {
        let bad = || ChatError::BadArgument(name.to_string());
        self.get(index)
            .and_then(Value::as_array)
            .ok_or_else(bad)?
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(bad))
            .collect()
    }

    pub fn message(&self, index: usize, name: &str) -> Result<ChatMessage, ChatError> {
        let value = self
            .get(index)
            .cloned()
            .ok_or_else(|| ChatError::BadArgument(name.to_string()))?;
        serde_json::from_value(value).map_err(|_| ChatError::BadArgument(name.to_string()))
    }

    /// Raw value; `null` when absent.
    pub fn value(&self, index: usize) -> Value {
        self.values.get(index).cloned().unwrap_or(Value::Null)
    }
}

/// Resolve with no values.
pub fn done() -> HandlerResult {
    Ok(Vec::new())
}

/// Resolve with a single value.
pub fn reply<T: Serialize>(value: T) -> HandlerResult {
    Ok(vec![serde_json::to_value(value)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_accessors() {
        let args = Args::new(vec![
            json!("lobby"),
            json!(["bob", "carol"]),
            json!(true),
            json!(7),
            json!({ "textMessage": "hi" }),
            Value::Null,
        ]);
        assert_eq!(args.string(0, "roomName"), Ok("lobby".into()));
        assert_eq!(args.strings(1, "values"), Ok(vec!["bob".into(), "carol".into()]));
        assert_eq!(args.bool(2, "mode"), Ok(true));
        assert_eq!(args.u64(3, "id"), Ok(7));
        assert_eq!(args.message(4, "msg").unwrap().text_message, "hi");
        assert_eq!(args.opt_string(5, "reason"), Ok(None));
        assert_eq!(args.opt_string(9, "reason"), Ok(None));
    }

    #[test]
    fn mistyped_arguments() {
        let args = Args::new(vec![json!(1), json!(["bob", 2]), json!({ "text": "x" })]);
        assert_eq!(args.string(0, "roomName"), Err(ChatError::BadArgument("roomName".into())));
        assert_eq!(args.strings(1, "values"), Err(ChatError::BadArgument("values".into())));
        assert_eq!(args.message(2, "msg"), Err(ChatError::BadArgument("msg".into())));
        assert_eq!(args.bool(5, "mode"), Err(ChatError::BadArgument("mode".into())));
    }
}
