//! Host capability bridge
//!
//! The ops defined here (plus the HTML query ops in [`super::dom`]) are the
//! only channel through which guest code reaches host resources. Host-side
//! failures while servicing an op become guest-catchable exceptions or
//! promise rejections, never host panics.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{anyhow, Context};
use deno_core::{op2, Extension, Op, OpState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::dom;
use crate::core::config::RuntimeConfig;

/// Identifies the owning plugin inside `OpState`, for log attribution.
pub(crate) struct PluginTag {
    pub id: String,
}

/// Structured result of a guest-initiated HTTP request.
///
/// Ordinary HTTP failures (4xx/5xx) still produce this shape with `ok: false`;
/// only network-level failures reject the guest promise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub text: String,
}

/// Build the per-runtime HTTP client honoring the configured timeouts.
pub(crate) fn http_client(config: &RuntimeConfig) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.request_timeout())
        .connect_timeout(config.connect_timeout())
        .build()
        .context("failed to build HTTP client")
}

#[op2(async)]
#[serde]
pub async fn op_fetch(
    state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[serde] options: Option<Value>,
) -> Result<FetchResponse, anyhow::Error> {
    let (client, plugin_id) = {
        let state = state.borrow();
        (
            state.borrow::<reqwest::Client>().clone(),
            state.borrow::<PluginTag>().id.clone(),
        )
    };

    let parsed = url::Url::parse(&url).map_err(|e| anyhow!("invalid url {url:?}: {e}"))?;
    debug!(plugin = %plugin_id, url = %parsed, "guest fetch");

    let options = options.unwrap_or(Value::Null);
    let method = options
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET");
    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| anyhow!("invalid request method {method:?}"))?;

    let mut builder = client.request(method, parsed);
    if let Some(headers) = options.get("headers").and_then(Value::as_object) {
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                builder = builder.header(name, value);
            }
        }
    }
    if let Some(body) = options.get("body").and_then(Value::as_str) {
        builder = builder.body(body.to_string());
    }

    let response = builder
        .send()
        .await
        .map_err(|e| anyhow!("request to {url} failed: {e}"))?;

    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let text = response
        .text()
        .await
        .map_err(|e| anyhow!("failed to read response body from {url}: {e}"))?;

    debug!(plugin = %plugin_id, status = status.as_u16(), bytes = text.len(), "guest fetch done");

    Ok(FetchResponse {
        ok: status.is_success() || status.is_redirection(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
        headers,
        text,
    })
}

#[op2(fast)]
pub fn op_console(state: &mut OpState, #[string] level: String, #[string] message: String) {
    let plugin_id = &state.borrow::<PluginTag>().id;
    match level.as_str() {
        "error" => error!(plugin = %plugin_id, "[plugin error] {}", message),
        "warn" => warn!(plugin = %plugin_id, "[plugin] {}", message),
        "debug" => debug!(plugin = %plugin_id, "[plugin] {}", message),
        _ => info!(plugin = %plugin_id, "[plugin] {}", message),
    }
}

/// The complete op allow-list exposed to guest code. Everything else the host
/// can do stays unreachable from the sandbox.
pub(crate) fn extension() -> Extension {
    Extension {
        name: "source_runtime",
        ops: Cow::Borrowed(&[
            op_fetch::DECL,
            op_console::DECL,
            dom::op_html_parse::DECL,
            dom::op_html_select::DECL,
            dom::op_html_text::DECL,
            dom::op_html_inner_html::DECL,
            dom::op_html_outer_html::DECL,
            dom::op_html_attr::DECL,
            dom::op_html_length::DECL,
            dom::op_html_eq::DECL,
            dom::op_html_traverse::DECL,
        ]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_response_serializes_camel_case() {
        let response = FetchResponse {
            ok: false,
            status: 404,
            status_text: "Not Found".to_string(),
            headers: HashMap::new(),
            text: String::new(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["statusText"], "Not Found");
        assert_eq!(json["ok"], false);
    }

    #[test]
    fn http_client_builds_from_default_config() {
        assert!(http_client(&RuntimeConfig::default()).is_ok());
    }
}
