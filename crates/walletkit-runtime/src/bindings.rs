use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Number, Value};
use thiserror::Error;

const HOST_METHOD_FALLBACK: &str = "Host method threw an exception";

/// Declared type of a native method parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Void,
    String,
    Boolean,
    Int,
    Long,
    Double,
}

/// A JS argument converted to its declared native kind.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Void,
    /// `None` when JS passed `null` or `undefined`.
    String(Option<String>),
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
}

impl HostValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(Some(s)) => Some(s),
            _ => None,
        }
    }

    fn kind(&self) -> ValueKind {
        match self {
            HostValue::Void => ValueKind::Void,
            HostValue::String(_) => ValueKind::String,
            HostValue::Boolean(_) => ValueKind::Boolean,
            HostValue::Int(_) => ValueKind::Int,
            HostValue::Long(_) => ValueKind::Long,
            HostValue::Double(_) => ValueKind::Double,
        }
    }

    fn into_json(self) -> Value {
        match self {
            HostValue::Void | HostValue::String(None) => Value::Null,
            HostValue::String(Some(s)) => Value::String(s),
            HostValue::Boolean(b) => Value::Bool(b),
            HostValue::Int(i) => Value::from(i),
            HostValue::Long(l) => Value::from(l),
            HostValue::Double(d) => Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("Object or method name cannot be empty")]
    EmptyName,

    #[error("Unsupported parameter type for method {0}")]
    UnsupportedParameter(String),

    #[error("Unable to convert argument for method {0}")]
    ArgumentConversion(String),

    #[error("Unable to convert return value for method {0}")]
    ReturnConversion(String),

    #[error("Host binding not found")]
    NotFound,

    #[error("{0}")]
    HostMethod(String),
}

/// Native implementation behind a binding. An `Err` message is surfaced to
/// JS as the thrown error.
pub type HostFn = Arc<dyn Fn(&[HostValue]) -> Result<HostValue, String> + Send + Sync>;

struct MethodBinding {
    object: String,
    method: String,
    params: Vec<ValueKind>,
    returns: ValueKind,
    callback: HostFn,
}

impl MethodBinding {
    fn qualified_name(&self) -> String {
        format!("{}.{}", self.object, self.method)
    }
}

#[derive(Default)]
struct Registry {
    next_id: u32,
    bindings: HashMap<u32, Arc<MethodBinding>>,
    by_name: HashMap<(String, String), u32>,
}

/// Native methods exposed to the JS runtime as `object.method(...)`.
///
/// Each registration gets an integer id (from 1, never reused) which the
/// host's JS shim uses to route calls back here. Registering the same
/// `object.method` again replaces the previous binding.
pub struct HostBindings {
    registry: Mutex<Registry>,
}

impl HostBindings {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 1,
                ..Registry::default()
            }),
        }
    }

    pub fn register<F>(
        &self,
        object: &str,
        method: &str,
        params: &[ValueKind],
        returns: ValueKind,
        callback: F,
    ) -> Result<u32, BindingError>
    where
        F: Fn(&[HostValue]) -> Result<HostValue, String> + Send + Sync + 'static,
    {
        if object.is_empty() || method.is_empty() {
            return Err(BindingError::EmptyName);
        }
        if params.contains(&ValueKind::Void) {
            return Err(BindingError::UnsupportedParameter(format!("{object}.{method}")));
        }

        let binding = Arc::new(MethodBinding {
            object: object.to_string(),
            method: method.to_string(),
            params: params.to_vec(),
            returns,
            callback: Arc::new(callback),
        });

        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.bindings.insert(id, binding);
        if let Some(previous) = registry
            .by_name
            .insert((object.to_string(), method.to_string()), id)
        {
            registry.bindings.remove(&previous);
            tracing::debug!(object, method, previous, id, "Replaced host binding");
        } else {
            tracing::debug!(object, method, id, "Registered host binding");
        }
        Ok(id)
    }

    /// Id currently bound to `object.method`.
    pub fn resolve(&self, object: &str, method: &str) -> Option<u32> {
        self.lock()
            .by_name
            .get(&(object.to_string(), method.to_string()))
            .copied()
    }

    pub fn unregister(&self, id: u32) -> bool {
        let mut registry = self.lock();
        let Some(binding) = registry.bindings.remove(&id) else {
            return false;
        };
        registry
            .by_name
            .remove(&(binding.object.clone(), binding.method.clone()));
        true
    }

    pub fn len(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke binding `id` with JS arguments.
    ///
    /// Missing trailing arguments are treated as `undefined`; extra ones are
    /// ignored. The native callback runs outside the registry lock, so it
    /// may register or invoke other bindings.
    pub fn invoke(&self, id: u32, args: &[Value]) -> Result<Value, BindingError> {
        let binding = self
            .lock()
            .bindings
            .get(&id)
            .cloned()
            .ok_or(BindingError::NotFound)?;

        let mut converted = Vec::with_capacity(binding.params.len());
        for (index, kind) in binding.params.iter().enumerate() {
            let value = from_js(*kind, args.get(index))
                .ok_or_else(|| BindingError::ArgumentConversion(binding.qualified_name()))?;
            converted.push(value);
        }

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| (binding.callback)(converted.as_slice())));
        let result = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(message)) => {
                let message = if message.is_empty() {
                    HOST_METHOD_FALLBACK.to_string()
                } else {
                    message
                };
                tracing::warn!(binding = %binding.qualified_name(), %message, "Host method failed");
                return Err(BindingError::HostMethod(message));
            }
            Err(_) => {
                tracing::error!(binding = %binding.qualified_name(), "Host method panicked");
                return Err(BindingError::HostMethod(HOST_METHOD_FALLBACK.to_string()));
            }
        };

        match binding.returns {
            ValueKind::Void => Ok(Value::Null),
            expected if result.kind() == expected => Ok(result.into_json()),
            _ => Err(BindingError::ReturnConversion(binding.qualified_name())),
        }
    }

    pub fn invoke_by_name(
        &self,
        object: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Value, BindingError> {
        let id = self.resolve(object, method).ok_or(BindingError::NotFound)?;
        self.invoke(id, args)
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HostBindings {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert one JS argument (`None` = `undefined`) to `kind`.
fn from_js(kind: ValueKind, value: Option<&Value>) -> Option<HostValue> {
    match kind {
        ValueKind::Void => None,
        ValueKind::String => Some(HostValue::String(match value {
            None | Some(Value::Null) => None,
            Some(v) => Some(js_to_string(v)),
        })),
        ValueKind::Boolean => Some(HostValue::Boolean(value.is_some_and(js_truthy))),
        ValueKind::Int => js_to_number(value?).map(|n| HostValue::Int(to_int32(n))),
        ValueKind::Long => js_to_number(value?).map(|n| HostValue::Long(n.trunc() as i64)),
        ValueKind::Double => js_to_number(value?).map(HostValue::Double),
    }
}

fn js_to_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => js_to_string(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

fn js_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Numbers, booleans, null and numeric strings; anything else does not
/// convert.
fn js_to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse::<f64>().ok().filter(|f| !f.is_nan())
            }
        }
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// ECMAScript ToInt32: truncate, then wrap modulo 2^32.
fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let wrapped = n.trunc().rem_euclid(4_294_967_296.0);
    wrapped as u32 as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(bindings: &HostBindings, kind: ValueKind) -> u32 {
        bindings
            .register("Test", "echo", &[kind], kind, |args: &[HostValue]| Ok(args[0].clone()))
            .unwrap()
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let bindings = HostBindings::new();
        let a = bindings
            .register("A", "x", &[], ValueKind::Void, |_: &[HostValue]| Ok(HostValue::Void))
            .unwrap();
        let b = bindings
            .register("A", "y", &[], ValueKind::Void, |_: &[HostValue]| Ok(HostValue::Void))
            .unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(bindings.resolve("A", "y"), Some(2));
    }

    #[test]
    fn rejects_empty_names_and_void_params() {
        let bindings = HostBindings::new();
        let noop = |_: &[HostValue]| -> Result<HostValue, String> { Ok(HostValue::Void) };
        assert_eq!(
            bindings.register("", "m", &[], ValueKind::Void, noop),
            Err(BindingError::EmptyName)
        );
        let err = bindings
            .register("Obj", "m", &[ValueKind::Void], ValueKind::Void, noop)
            .unwrap_err();
        assert_eq!(err.to_string(), "Unsupported parameter type for method Obj.m");
        assert!(bindings.is_empty());
    }

    #[test]
    fn re_registration_replaces_binding() {
        let bindings = HostBindings::new();
        let first = bindings
            .register("A", "m", &[], ValueKind::Int, |_: &[HostValue]| Ok(HostValue::Int(1)))
            .unwrap();
        let second = bindings
            .register("A", "m", &[], ValueKind::Int, |_: &[HostValue]| Ok(HostValue::Int(2)))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings.invoke(first, &[]), Err(BindingError::NotFound));
        assert_eq!(bindings.invoke_by_name("A", "m", &[]).unwrap(), json!(2));
    }

    #[test]
    fn unknown_binding_is_reported() {
        let bindings = HostBindings::new();
        assert_eq!(
            bindings.invoke(42, &[]).unwrap_err().to_string(),
            "Host binding not found"
        );
        assert!(!bindings.unregister(42));
    }

    #[test]
    fn string_arguments_allow_null_and_missing() {
        let bindings = HostBindings::new();
        let id = echo(&bindings, ValueKind::String);
        assert_eq!(bindings.invoke(id, &[json!("hi")]).unwrap(), json!("hi"));
        assert_eq!(bindings.invoke(id, &[Value::Null]).unwrap(), Value::Null);
        assert_eq!(bindings.invoke(id, &[]).unwrap(), Value::Null);
        assert_eq!(bindings.invoke(id, &[json!(3)]).unwrap(), json!("3"));
        assert_eq!(bindings.invoke(id, &[json!(1.5)]).unwrap(), json!("1.5"));
    }

    #[test]
    fn booleans_follow_truthiness() {
        let bindings = HostBindings::new();
        let id = echo(&bindings, ValueKind::Boolean);
        for (arg, expected) in [
            (json!(""), false),
            (json!("x"), true),
            (json!(0), false),
            (json!(2), true),
            (json!({}), true),
            (Value::Null, false),
        ] {
            assert_eq!(bindings.invoke(id, &[arg]).unwrap(), json!(expected));
        }
        assert_eq!(bindings.invoke(id, &[]).unwrap(), json!(false));
    }

    #[test]
    fn ints_wrap_like_js() {
        let bindings = HostBindings::new();
        let id = echo(&bindings, ValueKind::Int);
        assert_eq!(bindings.invoke(id, &[json!(7.9)]).unwrap(), json!(7));
        assert_eq!(bindings.invoke(id, &[json!(-7.9)]).unwrap(), json!(-7));
        assert_eq!(bindings.invoke(id, &[json!(2147483648u64)]).unwrap(), json!(-2147483648));
        assert_eq!(bindings.invoke(id, &[json!(4294967297u64)]).unwrap(), json!(1));
        assert_eq!(bindings.invoke(id, &[json!(" 12 ")]).unwrap(), json!(12));
    }

    #[test]
    fn numeric_conversion_failures_name_the_method() {
        let bindings = HostBindings::new();
        let long = bindings
            .register("Wallet", "setFee", &[ValueKind::Long], ValueKind::Void, |_: &[HostValue]| {
                Ok(HostValue::Void)
            })
            .unwrap();
        let err = bindings.invoke(long, &[json!("abc")]).unwrap_err();
        assert_eq!(err.to_string(), "Unable to convert argument for method Wallet.setFee");
        assert!(bindings.invoke(long, &[json!({"a": 1})]).is_err());
        assert!(bindings.invoke(long, &[]).is_err());
        assert_eq!(bindings.invoke(long, &[json!("9000000000")]).unwrap(), Value::Null);
    }

    #[test]
    fn doubles_accept_numeric_strings() {
        let bindings = HostBindings::new();
        let id = echo(&bindings, ValueKind::Double);
        assert_eq!(bindings.invoke(id, &[json!("2.5")]).unwrap(), json!(2.5));
        assert_eq!(bindings.invoke(id, &[json!(true)]).unwrap(), json!(1.0));
    }

    #[test]
    fn host_failures_surface_their_message() {
        let bindings = HostBindings::new();
        let failing = bindings
            .register("A", "fail", &[], ValueKind::Void, |_: &[HostValue]| {
                Err("keystore locked".to_string())
            })
            .unwrap();
        let silent = bindings
            .register("A", "silent", &[], ValueKind::Void, |_: &[HostValue]| Err(String::new()))
            .unwrap();
        let panicking = bindings
            .register("A", "panic", &[], ValueKind::Void, |_: &[HostValue]| panic!("boom"))
            .unwrap();

        assert_eq!(
            bindings.invoke(failing, &[]),
            Err(BindingError::HostMethod("keystore locked".into()))
        );
        assert_eq!(
            bindings.invoke(silent, &[]).unwrap_err().to_string(),
            "Host method threw an exception"
        );
        assert_eq!(
            bindings.invoke(panicking, &[]).unwrap_err().to_string(),
            "Host method threw an exception"
        );
    }

    #[test]
    fn void_return_yields_null_and_mismatched_return_fails() {
        let bindings = HostBindings::new();
        let void = bindings
            .register("A", "v", &[], ValueKind::Void, |_: &[HostValue]| Ok(HostValue::Int(5)))
            .unwrap();
        let wrong = bindings
            .register("A", "w", &[], ValueKind::String, |_: &[HostValue]| Ok(HostValue::Int(5)))
            .unwrap();
        assert_eq!(bindings.invoke(void, &[]).unwrap(), Value::Null);
        assert_eq!(
            bindings.invoke(wrong, &[]),
            Err(BindingError::ReturnConversion("A.w".into()))
        );
    }
}
