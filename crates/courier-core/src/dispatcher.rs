//! Inbound dispatcher.
//!
//! Turns a [`CallEnvelope`] into a [`ResultEnvelope`] by invoking a method on a
//! local object. Methods are registered explicitly in a [`MethodTable`], keyed
//! by name and ordered parameter type names:
//!
//! ```
//! use courier_core::{MethodTable, ServiceError};
//!
//! struct Echo;
//!
//! let table = MethodTable::builder(Echo)
//!     .method1("echo", |_: &Echo, text: String| Ok::<_, ServiceError>(text))
//!     .build();
//! assert_eq!(table.signatures(), vec!["echo(string)".to_string()]);
//! ```
//!
//! Nothing raised by a target method escapes [`Dispatcher::process`]: errors
//! and panics both become fault results.

use crate::codec::{decode_value, encode_value, RemoteType};
use crate::config::{BridgeConfig, FaultClass};
use crate::correlation::lock;
use crate::envelope::{Argument, CallEnvelope, ResultEnvelope};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// An error raised by a target method, reported to the caller as a fault.
///
/// Any `std::error::Error` converts into it with `?`, taking the error type's
/// short name as fault class name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub class_name: String,
    pub message: String,
    pub trace: String,
}

impl ServiceError {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
            trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class_name, self.message)
    }
}

impl<E: std::error::Error + 'static> From<E> for ServiceError {
    fn from(err: E) -> Self {
        let mut trace = String::new();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push_str("caused by: ");
            trace.push_str(&cause.to_string());
            trace.push('\n');
            source = cause.source();
        }
        Self {
            class_name: short_type_name::<E>(),
            message: err.to_string(),
            trace,
        }
    }
}

/// Result type of a registered method.
pub type MethodResult<R> = std::result::Result<R, ServiceError>;

enum Outcome {
    Value { payload: Value, type_name: String },
    Void,
}

enum Failure {
    Argument(String),
    Service(ServiceError),
    Internal(String),
}

type Handler = Box<dyn Fn(&[Argument]) -> std::result::Result<Outcome, Failure> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    name: String,
    params: Vec<String>,
}

impl std::fmt::Display for MethodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.params.join(", "))
    }
}

/// The callable methods of one local object.
pub struct MethodTable {
    service: String,
    methods: HashMap<MethodKey, Handler>,
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("service", &self.service)
            .field("methods", &self.signatures())
            .finish()
    }
}

impl MethodTable {
    /// Start a table for `target`.
    pub fn builder<T: Send + Sync + 'static>(target: T) -> MethodTableBuilder<T> {
        MethodTableBuilder {
            service: short_type_name::<T>(),
            target: Arc::new(target),
            methods: HashMap::new(),
        }
    }

    /// Name of the target type, used in fault details.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Registered signatures, sorted, as `name(type, ...)`.
    pub fn signatures(&self) -> Vec<String> {
        let mut signatures: Vec<String> = self.methods.keys().map(|k| k.to_string()).collect();
        signatures.sort();
        signatures
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Builder registering typed closures as remote methods.
pub struct MethodTableBuilder<T> {
    service: String,
    target: Arc<T>,
    methods: HashMap<MethodKey, Handler>,
}

impl<T: Send + Sync + 'static> MethodTableBuilder<T> {
    /// Override the service name used in fault details.
    pub fn named(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    fn insert(&mut self, name: &str, params: Vec<String>, handler: Handler) {
        let key = MethodKey {
            name: name.to_string(),
            params,
        };
        if self.methods.contains_key(&key) {
            warn!("Method {} registered twice on {}, keeping the last", key, self.service);
        }
        self.methods.insert(key, handler);
    }

    pub fn method0<R, F>(mut self, name: &str, f: F) -> Self
    where
        R: RemoteType,
        F: Fn(&T) -> MethodResult<R> + Send + Sync + 'static,
    {
        let target = self.target.clone();
        self.insert(
            name,
            vec![],
            Box::new(move |_args| finish(f(&target))),
        );
        self
    }

    pub fn method1<A, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: RemoteType,
        R: RemoteType,
        F: Fn(&T, A) -> MethodResult<R> + Send + Sync + 'static,
    {
        let target = self.target.clone();
        self.insert(
            name,
            vec![A::type_name()],
            Box::new(move |args| {
                let a = argument::<A>(args, 0)?;
                finish(f(&target, a))
            }),
        );
        self
    }

    pub fn method2<A, B, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: RemoteType,
        B: RemoteType,
        R: RemoteType,
        F: Fn(&T, A, B) -> MethodResult<R> + Send + Sync + 'static,
    {
        let target = self.target.clone();
        self.insert(
            name,
            vec![A::type_name(), B::type_name()],
            Box::new(move |args| {
                let a = argument::<A>(args, 0)?;
                let b = argument::<B>(args, 1)?;
                finish(f(&target, a, b))
            }),
        );
        self
    }

    pub fn method3<A, B, C, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: RemoteType,
        B: RemoteType,
        C: RemoteType,
        R: RemoteType,
        F: Fn(&T, A, B, C) -> MethodResult<R> + Send + Sync + 'static,
    {
        let target = self.target.clone();
        self.insert(
            name,
            vec![A::type_name(), B::type_name(), C::type_name()],
            Box::new(move |args| {
                let a = argument::<A>(args, 0)?;
                let b = argument::<B>(args, 1)?;
                let c = argument::<C>(args, 2)?;
                finish(f(&target, a, b, c))
            }),
        );
        self
    }

    pub fn build(self) -> MethodTable {
        MethodTable {
            service: self.service,
            methods: self.methods,
        }
    }

    /// Shorthand for `Dispatcher::new(self.build())`.
    pub fn into_dispatcher(self) -> Dispatcher {
        Dispatcher::new(self.build())
    }
}

fn argument<A: RemoteType>(args: &[Argument], index: usize) -> std::result::Result<A, Failure> {
    let arg = args
        .get(index)
        .ok_or_else(|| Failure::Argument(format!("missing argument {}", index)))?;
    decode_value(arg.value.clone(), &arg.type_name)
        .map_err(|e| Failure::Argument(format!("argument {}: {}", index, e)))
}

fn finish<R: RemoteType>(result: MethodResult<R>) -> std::result::Result<Outcome, Failure> {
    let value = result.map_err(Failure::Service)?;
    if R::VOID {
        return Ok(Outcome::Void);
    }
    let payload = encode_value(&value).map_err(|e| Failure::Internal(e.to_string()))?;
    Ok(Outcome::Value {
        payload,
        type_name: R::type_name(),
    })
}

/// One processed call, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub call: CallEnvelope,
    pub result: ResultEnvelope,
    pub at: DateTime<Utc>,
}

struct History {
    capacity: usize,
    entries: Mutex<VecDeque<Invocation>>,
}

/// Executes inbound calls against a [`MethodTable`].
///
/// Cheap to clone; clones share the table and history.
#[derive(Clone)]
pub struct Dispatcher {
    table: Arc<MethodTable>,
    history: Option<Arc<History>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("table", &self.table)
            .field("history", &self.history.as_ref().map(|h| h.capacity))
            .finish()
    }
}

impl Dispatcher {
    pub fn new(table: MethodTable) -> Self {
        Self {
            table: Arc::new(table),
            history: None,
        }
    }

    /// Keep the last `capacity` invocations. Zero disables the history.
    pub fn with_history(mut self, capacity: usize) -> Self {
        self.history = (capacity > 0).then(|| {
            Arc::new(History {
                capacity,
                entries: Mutex::new(VecDeque::with_capacity(capacity)),
            })
        });
        self
    }

    /// Keep the last [`BridgeConfig::DEFAULT_HISTORY_CAPACITY`] invocations.
    pub fn with_default_history(self) -> Self {
        self.with_history(BridgeConfig::DEFAULT_HISTORY_CAPACITY)
    }

    pub fn table(&self) -> &MethodTable {
        &self.table
    }

    /// Recorded invocations, oldest first.
    pub fn history(&self) -> Vec<Invocation> {
        match &self.history {
            Some(history) => lock(&history.entries).iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Process one call and build its result. Never panics on behalf of the
    /// target method.
    pub fn process(&self, call: &CallEnvelope) -> ResultEnvelope {
        let key = MethodKey {
            name: call.method_name.clone(),
            params: call.args.iter().map(|arg| arg.type_name.clone()).collect(),
        };
        debug!("Dispatching {} on {} (call {})", key, self.table.service, call.call_id);

        let result = match self.table.methods.get(&key) {
            Some(handler) => self.run(handler, &key, call),
            None => {
                warn!("No method {} on {}", key, self.table.service);
                ResultEnvelope::fault(
                    &call.call_id,
                    FaultClass::NO_SUCH_METHOD,
                    format!("no method {} on {}", key, self.table.service),
                )
            }
        };

        self.record(call, &result);
        result
    }

    /// Run [`Dispatcher::process`] on the blocking pool.
    pub async fn dispatch(&self, call: CallEnvelope) -> ResultEnvelope {
        let dispatcher = self.clone();
        let call_id = call.call_id.clone();
        match tokio::task::spawn_blocking(move || dispatcher.process(&call)).await {
            Ok(result) => result,
            Err(e) => {
                error!("Dispatch task for call {} failed: {}", call_id, e);
                ResultEnvelope::fault(call_id, FaultClass::INTERNAL, e.to_string())
            }
        }
    }

    fn run(&self, handler: &Handler, key: &MethodKey, call: &CallEnvelope) -> ResultEnvelope {
        let call_id = call.call_id.as_str();
        match catch_unwind(AssertUnwindSafe(|| handler(&call.args))) {
            Ok(Ok(Outcome::Value { payload, type_name })) => {
                ResultEnvelope::value(call_id, payload, type_name)
            }
            Ok(Ok(Outcome::Void)) => ResultEnvelope::void(call_id),
            Ok(Err(Failure::Service(err))) => {
                debug!("{} on {} failed: {}", key, self.table.service, err);
                let mut detail = format!("{}\n  at {}.{}\n", err.message, self.table.service, key);
                detail.push_str(&err.trace);
                ResultEnvelope::fault(call_id, err.class_name, detail)
            }
            Ok(Err(Failure::Argument(message))) => {
                warn!("Rejected arguments for {}: {}", key, message);
                ResultEnvelope::fault(call_id, FaultClass::ILLEGAL_ARGUMENT, message)
            }
            Ok(Err(Failure::Internal(message))) => {
                error!("Internal failure in {}: {}", key, message);
                ResultEnvelope::fault(call_id, FaultClass::INTERNAL, message)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("{} on {} panicked: {}", key, self.table.service, message);
                ResultEnvelope::fault(
                    call_id,
                    FaultClass::PANIC,
                    format!("{}\n  at {}.{}", message, self.table.service, key),
                )
            }
        }
    }

    fn record(&self, call: &CallEnvelope, result: &ResultEnvelope) {
        let Some(history) = &self.history else {
            return;
        };
        let mut entries = lock(&history.entries);
        if entries.len() >= history.capacity {
            entries.pop_front();
        }
        entries.push_back(Invocation {
            call: call.clone(),
            result: result.clone(),
            at: Utc::now(),
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// `my_crate::math::DivideByZero<T>` -> `DivideByZero`.
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ResultKind;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("cannot divide {0} by zero")]
    struct DivideByZero(i64);

    #[derive(Debug, thiserror::Error)]
    #[error("calculation failed")]
    struct CalculationFailed(#[source] DivideByZero);

    struct Calculator;

    impl Calculator {
        fn divide(&self, a: i64, b: i64) -> Result<i64, DivideByZero> {
            if b == 0 {
                return Err(DivideByZero(a));
            }
            Ok(a / b)
        }
    }

    fn calculator() -> Dispatcher {
        MethodTable::builder(Calculator)
            .method2("divide", |c: &Calculator, a: i64, b: i64| Ok(c.divide(a, b)?))
            .method2("chained", |c: &Calculator, a: i64, b: i64| {
                c.divide(a, b).map_err(|e| ServiceError::from(CalculationFailed(e)))
            })
            .method2("add", |_: &Calculator, a: i64, b: i64| Ok(a + b))
            .method2("add", |_: &Calculator, a: String, b: String| Ok(a + &b))
            .method0("reset", |_: &Calculator| Ok(()))
            .method1("explode", |_: &Calculator, _: i64| -> MethodResult<i64> {
                panic!("boom")
            })
            .into_dispatcher()
    }

    fn call(method: &str, args: Vec<Argument>) -> CallEnvelope {
        CallEnvelope::new("(objectClass=Calculator)", method, args)
    }

    fn ints(values: &[i64]) -> Vec<Argument> {
        values.iter().map(|v| Argument::of(v).unwrap()).collect()
    }

    #[test]
    fn test_value_result_carries_type_name() {
        let call = call("divide", ints(&[8, 2]));
        let result = calculator().process(&call);

        assert_eq!(result.call_id, call.call_id);
        assert_eq!(result.kind, ResultKind::Value);
        assert_eq!(result.payload, json!(4));
        assert_eq!(result.payload_type_name, "i64");
    }

    #[test]
    fn test_void_method_yields_void_result() {
        let result = calculator().process(&call("reset", vec![]));
        assert_eq!(result.kind, ResultKind::Void);
        assert_eq!(result.payload, Value::Null);
    }

    #[test]
    fn test_method_error_becomes_fault_with_error_type_name() {
        let dispatcher = calculator();
        let result = dispatcher.process(&call("divide", ints(&[4, 0])));

        assert!(result.is_fault());
        assert_eq!(result.fault_class_name, "DivideByZero");
        assert!(result.fault_detail.starts_with("cannot divide 4 by zero"));
        assert!(result.fault_detail.contains("Calculator.divide(i64, i64)"));

        // Still usable afterwards.
        let result = dispatcher.process(&call("divide", ints(&[9, 3])));
        assert_eq!(result.payload, json!(3));
    }

    #[test]
    fn test_fault_detail_includes_source_chain() {
        let result = calculator().process(&call("chained", ints(&[1, 0])));
        assert_eq!(result.fault_class_name, "CalculationFailed");
        assert!(result.fault_detail.contains("caused by: cannot divide 1 by zero"));
    }

    #[test]
    fn test_overloads_resolve_by_parameter_types() {
        let dispatcher = calculator();

        let result = dispatcher.process(&call("add", ints(&[2, 3])));
        assert_eq!(result.payload, json!(5));

        let strings = vec![
            Argument::of(&"ab".to_string()).unwrap(),
            Argument::of(&"cd".to_string()).unwrap(),
        ];
        let result = dispatcher.process(&call("add", strings));
        assert_eq!(result.payload, json!("abcd"));
        assert_eq!(result.payload_type_name, "string");
    }

    #[test]
    fn test_unknown_method_or_signature_is_no_such_method() {
        let dispatcher = calculator();

        let result = dispatcher.process(&call("multiply", ints(&[2, 3])));
        assert_eq!(result.fault_class_name, FaultClass::NO_SUCH_METHOD);

        let result = dispatcher.process(&call("divide", ints(&[2])));
        assert_eq!(result.fault_class_name, FaultClass::NO_SUCH_METHOD);
        assert!(result.fault_detail.contains("divide(i64)"));
    }

    #[test]
    fn test_undecodable_argument_is_illegal_argument() {
        let args = vec![Argument::new(json!("four"), "i64"), Argument::new(json!(2), "i64")];
        let result = calculator().process(&call("divide", args));
        assert_eq!(result.fault_class_name, FaultClass::ILLEGAL_ARGUMENT);
    }

    #[test]
    fn test_panic_is_captured_as_fault() {
        let dispatcher = calculator();
        let result = dispatcher.process(&call("explode", ints(&[1])));

        assert!(result.is_fault());
        assert_eq!(result.fault_class_name, FaultClass::PANIC);
        assert!(result.fault_detail.starts_with("boom"));

        let result = dispatcher.process(&call("add", ints(&[1, 1])));
        assert_eq!(result.payload, json!(2));
    }

    #[tokio::test]
    async fn test_dispatch_runs_on_blocking_pool() {
        let result = calculator().dispatch(call("divide", ints(&[10, 5]))).await;
        assert_eq!(result.payload, json!(2));
    }

    #[test]
    fn test_history_is_bounded() {
        let dispatcher = calculator().with_history(2);
        for i in 1..=3 {
            dispatcher.process(&call("add", ints(&[i, 0])));
        }

        let history = dispatcher.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].result.payload, json!(2));
        assert_eq!(history[1].result.payload, json!(3));
        assert!(history[0].at <= history[1].at);

        assert!(calculator().history().is_empty());
    }

    #[test]
    fn test_default_history_keeps_configured_capacity() {
        let dispatcher = calculator().with_default_history();
        for i in 0..BridgeConfig::DEFAULT_HISTORY_CAPACITY as i64 + 5 {
            dispatcher.process(&call("add", ints(&[i, 0])));
        }
        assert_eq!(dispatcher.history().len(), BridgeConfig::DEFAULT_HISTORY_CAPACITY);
    }

    #[test]
    fn test_signatures_and_service_name() {
        let dispatcher = calculator();
        assert_eq!(dispatcher.table().service(), "Calculator");
        assert!(dispatcher
            .table()
            .signatures()
            .contains(&"add(string, string)".to_string()));
        assert_eq!(dispatcher.table().len(), 6);
    }

    #[test]
    fn test_service_error_from_std_error_uses_short_type_name() {
        let err = ServiceError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(err.class_name, "Error");
        assert_eq!(err.message, "disk");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }
}
