use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hostlink_dispatch::{CommandHandler, HandlerError, HandlerModule, handler_fn};
use serde_json::{Value, json};
use tracing::info;

const MAX_SLEEP_MS: u64 = 5_000;

/// Small handler set used to exercise the pipeline end to end.
#[derive(Debug, Default)]
pub struct DemoModule {
    builds: u64,
}

impl DemoModule {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HandlerModule for DemoModule {
    fn name(&self) -> &str {
        "demo"
    }

    fn reload(&mut self) -> Result<Arc<dyn CommandHandler>, HandlerError> {
        self.builds = self.builds.saturating_add(1);
        let build = self.builds;
        info!(build, "demo handler built");
        Ok(handler_fn(move |action, params| match action {
            "ping" => Ok(json!("pong")),
            "echo" => Ok(json!({ "build": build, "params": params })),
            "sleep" => {
                let millis = params
                    .get("ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(100)
                    .min(MAX_SLEEP_MS);
                thread::sleep(Duration::from_millis(millis));
                Ok(json!({ "slept_ms": millis }))
            }
            "fail" => Err(HandlerError::failed(
                params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("requested failure"),
            )),
            other => Err(HandlerError::UnknownAction(other.to_string())),
        }))
    }
}

#[cfg(test)]
mod tests {
    use hostlink_dispatch::{CommandHandler, CommandParams, HandlerError, HandlerModule};
    use serde_json::json;

    use super::DemoModule;

    fn params(value: serde_json::Value) -> CommandParams {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn demo_actions_answer_as_documented() {
        let handler = DemoModule::new().reload().expect("demo handler");
        assert_eq!(
            handler.handle("ping", &CommandParams::new()),
            Ok(json!("pong"))
        );
        assert_eq!(
            handler.handle("echo", &params(json!({ "x": 1 }))),
            Ok(json!({ "build": 1, "params": { "x": 1 } }))
        );
        assert_eq!(
            handler.handle("sleep", &params(json!({ "ms": 1 }))),
            Ok(json!({ "slept_ms": 1 }))
        );
        assert_eq!(
            handler.handle("fail", &params(json!({ "message": "nope" }))),
            Err(HandlerError::Failed("nope".to_string()))
        );
        assert!(matches!(
            handler.handle("warp", &CommandParams::new()),
            Err(HandlerError::UnknownAction(_))
        ));
    }

    #[test]
    fn each_reload_produces_a_new_build() {
        let mut module = DemoModule::new();
        let _ = module.reload().expect("first build");
        let second = module.reload().expect("second build");
        assert_eq!(
            second.handle("echo", &CommandParams::new()),
            Ok(json!({ "build": 2, "params": {} }))
        );
    }
}
