//! Value bridge between host and guest type systems
//!
//! Host values are `serde_json::Value`; guest values are V8 handles. The
//! bridge goes through the engine's JSON machinery in both directions, which
//! gives defined failure semantics: anything that is not plain data (a
//! function, a symbol, a cycle) fails conversion instead of leaking an opaque
//! handle across the boundary.

use anyhow::{anyhow, Context};
use deno_core::v8;
use serde_json::Value;

/// Convert a host value into a guest value in the given scope.
pub(crate) fn to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &Value,
) -> anyhow::Result<v8::Local<'s, v8::Value>> {
    let json = serde_json::to_string(value).context("failed to serialize host value")?;
    let json_v8 =
        v8::String::new(scope, &json).ok_or_else(|| anyhow!("host value too large for engine"))?;
    v8::json::parse(scope, json_v8).ok_or_else(|| anyhow!("engine rejected marshaled host value"))
}

/// Convert a guest value into a host value.
///
/// `undefined` and `null` both map to `Value::Null`; values with no JSON
/// representation are an error.
pub(crate) fn from_v8(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
) -> anyhow::Result<Value> {
    if value.is_null_or_undefined() {
        return Ok(Value::Null);
    }
    let json = v8::json::stringify(scope, value)
        .ok_or_else(|| anyhow!("guest value is not representable as plain data"))?;
    let text = json.to_rust_string_lossy(scope);
    if text == "undefined" {
        // Functions and symbols stringify to nothing; refuse to smuggle them.
        return Err(anyhow!("guest value is not representable as plain data"));
    }
    serde_json::from_str(&text).context("failed to parse marshaled guest value")
}

/// Read a global variable from the guest context.
pub(crate) fn get_global<'s>(
    scope: &mut v8::HandleScope<'s>,
    name: &str,
) -> Option<v8::Local<'s, v8::Value>> {
    let context = scope.get_current_context();
    let global = context.global(scope);
    let key = v8::String::new(scope, name)?;
    global.get(scope, key.into())
}

/// Read one member of a guest object.
pub(crate) fn get_member<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<v8::Object>,
    key: &str,
) -> Option<v8::Local<'s, v8::Value>> {
    let key = v8::String::new(scope, key)?;
    object.get(scope, key.into())
}

/// Read one member of a guest object as a string, treating null/undefined as
/// absent.
pub(crate) fn member_string(
    scope: &mut v8::HandleScope,
    object: v8::Local<v8::Object>,
    key: &str,
) -> Option<String> {
    let value = get_member(scope, object, key)?;
    if value.is_null_or_undefined() {
        return None;
    }
    Some(value.to_string(scope)?.to_rust_string_lossy(scope))
}

/// Split an engine error into its guest-facing message and stack trace.
pub(crate) fn js_error_parts(err: &anyhow::Error) -> (String, Option<String>) {
    if let Some(js_err) = err.downcast_ref::<deno_core::error::JsError>() {
        (js_err.exception_message.clone(), js_err.stack.clone())
    } else {
        (err.to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deno_core::JsRuntime;
    use serde_json::json;

    fn test_runtime() -> JsRuntime {
        JsRuntime::new(Default::default())
    }

    #[test]
    fn round_trips_plain_data() {
        let mut runtime = test_runtime();
        let scope = &mut runtime.handle_scope();

        let input = json!({
            "name": "novel",
            "page": 3,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "nested": { "ok": true, "missing": null }
        });
        let guest = to_v8(scope, &input).unwrap();
        let output = from_v8(scope, guest).unwrap();
        assert_eq!(input, output);
    }

    #[test]
    fn undefined_becomes_null() {
        let mut runtime = test_runtime();
        let scope = &mut runtime.handle_scope();
        let undefined: v8::Local<v8::Value> = v8::undefined(scope).into();
        assert_eq!(from_v8(scope, undefined).unwrap(), Value::Null);
    }

    #[test]
    fn functions_do_not_cross_the_bridge() {
        let mut runtime = test_runtime();
        let result = runtime
            .execute_script("<test>", "(function() { return 1; })".to_string().into())
            .unwrap();
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, result);
        assert!(from_v8(scope, local).is_err());
    }

    #[test]
    fn reads_globals_and_members() {
        let mut runtime = test_runtime();
        runtime
            .execute_script(
                "<test>",
                "globalThis.slot = { state: 'resolved', missing: null };"
                    .to_string()
                    .into(),
            )
            .unwrap();
        let scope = &mut runtime.handle_scope();
        let slot = get_global(scope, "slot").unwrap();
        let slot = v8::Local::<v8::Object>::try_from(slot).unwrap();
        assert_eq!(
            member_string(scope, slot, "state").as_deref(),
            Some("resolved")
        );
        assert_eq!(member_string(scope, slot, "missing"), None);
        assert_eq!(member_string(scope, slot, "absent"), None);
    }
}
