//! Remote program invocation helper
//!
//! A remote program receives exactly one argument, the serialized
//! [`Request`]. On completion it sends the same request back, augmented with
//! its results, on every port the request lists.

use ramlet_core::{LogLine, Message, Pid, RamletResult, Request, Status};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::traits::{ProcessContext, Runtime};

/// Request-side view of a running remote program
pub struct RpcContext {
    pub request: Request,
    pub pid: Pid,
    pub node: String,
    pub threads: u32,
    runtime: Arc<dyn Runtime>,
}

impl RpcContext {
    /// Parse the process argument into a request
    pub fn parse(ctx: &ProcessContext) -> RamletResult<Self> {
        let request: Request = serde_json::from_str(&ctx.arg)?;
        Ok(Self {
            request,
            pid: ctx.pid,
            node: ctx.node.clone(),
            threads: ctx.threads,
            runtime: ctx.runtime.clone(),
        })
    }

    /// Parse, logging and giving up on a malformed argument
    pub fn parse_or_warn(ctx: &ProcessContext) -> Option<Self> {
        match Self::parse(ctx) {
            Ok(rpc) => Some(rpc),
            Err(e) => {
                warn!(pid = %ctx.pid, node = %ctx.node, error = %e, "Malformed process argument");
                None
            }
        }
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn target(&self) -> &str {
        self.request.target.as_deref().unwrap_or_default()
    }

    /// Wait the request's completion-alignment delay
    pub async fn delay(&self) {
        if self.request.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.request.delay_ms)).await;
        }
    }

    pub fn set_result(&mut self, key: &str, value: impl Serialize) {
        self.request.set_result(key, value);
    }

    /// Send display-only text to the reply ports
    pub async fn log(&self, text: impl Into<String>) {
        let message = Message::Log(LogLine {
            source: self.request.id,
            label: self.request.label.clone(),
            text: text.into(),
        });
        self.send(&message).await;
    }

    /// Send the completion reply
    pub async fn exit(mut self) {
        self.request.status = Some(Status::Completed);
        self.request.pid = Some(self.pid);
        let message = Message::Reply(self.request.clone());
        self.send(&message).await;
    }

    /// Send the completion reply carrying an error description
    pub async fn exit_with_error(mut self, error: impl std::fmt::Display) {
        self.request.set_result("error", error.to_string());
        self.exit().await;
    }

    async fn send(&self, message: &Message) {
        for port in self.request.reply_ports() {
            if let Err(e) = self.runtime.ports().write(port, message).await {
                debug!(port = port, error = %e, "Reply not delivered");
            }
        }
    }
}
