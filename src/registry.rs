//! Component registry.
//!
//! Maps Rust types to stable string ids, and ids to lazily created instances with an
//! explicit method dispatch table. Every worker builds its own registry; nothing here
//! is shared between execution units.
//!
//! # Example
//!
//! ```
//! use taskpool::registry::{Component, ComponentRegistry};
//!
//! #[derive(Default)]
//! struct Calc;
//!
//! let mut registry = ComponentRegistry::new();
//! registry.register(
//!     Component::new("calc", Calc::default)
//!         .method("plus", |_: &Calc, (a, b): (i64, i64)| Ok(a + b)),
//! );
//! assert_eq!(registry.id_of::<Calc>(), Some("calc"));
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::worker::SerializedError;

/// Future returned by an invoked method.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, SerializedError>> + Send>>;

type Invoker<C> = Arc<dyn Fn(Arc<C>, Vec<Value>) -> MethodFuture + Send + Sync>;

/// Registration of one component type: its id, how to build it, and its methods.
pub struct Component<C> {
    id: String,
    factory: Box<dyn Fn() -> C + Send + Sync>,
    methods: HashMap<String, Invoker<C>>,
}

impl<C: Send + Sync + 'static> Component<C> {
    /// Start a registration. The factory runs at most once per registry, on first use.
    pub fn new(id: impl Into<String>, factory: impl Fn() -> C + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            factory: Box::new(factory),
            methods: HashMap::new(),
        }
    }

    /// Add a method that completes immediately.
    ///
    /// Arguments are decoded from the positional argument list as `A`, usually a
    /// tuple: `(a, b): (i64, i64)`. Use `()` for methods without arguments.
    pub fn method<A, R, F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&C, A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = format!("{}.{}", self.id, name);
        let invoker: Invoker<C> =
            Arc::new(move |instance: Arc<C>, args: Vec<Value>| -> MethodFuture {
                let outcome = decode_args::<A>(&label, args)
                    .and_then(|args| {
                        f(instance.as_ref(), args).map_err(|e| SerializedError::from_anyhow(&e))
                    })
                    .and_then(encode_result);
                Box::pin(std::future::ready(outcome))
            });
        self.methods.insert(name, invoker);
        self
    }

    /// Add a method that returns a future.
    pub fn async_method<A, R, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<C>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let name = name.into();
        let label = format!("{}.{}", self.id, name);
        let invoker: Invoker<C> =
            Arc::new(move |instance: Arc<C>, args: Vec<Value>| -> MethodFuture {
                match decode_args::<A>(&label, args) {
                    Ok(args) => {
                        let pending = f(instance, args);
                        Box::pin(async move {
                            pending
                                .await
                                .map_err(|e| SerializedError::from_anyhow(&e))
                                .and_then(encode_result)
                        })
                    }
                    Err(e) => Box::pin(std::future::ready(Err(e))),
                }
            });
        self.methods.insert(name, invoker);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Type-erased view of a registered component.
trait Registration: Send + Sync {
    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<MethodFuture, SerializedError>;
    fn method_names(&self) -> Vec<&str>;
}

struct Registered<C> {
    component: Component<C>,
    instance: OnceLock<Arc<C>>,
}

impl<C: Send + Sync + 'static> Registration for Registered<C> {
    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<MethodFuture, SerializedError> {
        let invoker = self.component.methods.get(method).ok_or_else(|| {
            SerializedError::new(format!(
                "Component '{}' has no method '{}'",
                self.component.id, method
            ))
        })?;
        let instance = self
            .instance
            .get_or_init(|| Arc::new((self.component.factory)()))
            .clone();
        Ok(invoker(instance, args))
    }

    fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.component.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Resolves component types and ids to callable instances.
#[derive(Default)]
pub struct ComponentRegistry {
    ids: HashMap<TypeId, String>,
    components: HashMap<String, Box<dyn Registration>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component. A later registration under the same id replaces the
    /// earlier one.
    pub fn register<C: Send + Sync + 'static>(&mut self, component: Component<C>) -> &mut Self {
        let id = component.id.clone();
        if self.components.contains_key(&id) {
            tracing::warn!(component = %id, "Replacing existing component registration");
        }
        self.ids.insert(TypeId::of::<C>(), id.clone());
        self.components.insert(
            id,
            Box::new(Registered {
                component,
                instance: OnceLock::new(),
            }),
        );
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<C: Send + Sync + 'static>(mut self, component: Component<C>) -> Self {
        self.register(component);
        self
    }

    /// Stable id of a registered type, or `None` if `C` was never registered.
    pub fn id_of<C: 'static>(&self) -> Option<&str> {
        self.ids.get(&TypeId::of::<C>()).map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.components.contains_key(id)
    }

    pub fn resolve(&self, id: &str) -> Option<ResolvedComponent<'_>> {
        self.components
            .get_key_value(id)
            .map(|(id, registration)| ResolvedComponent {
                id,
                registration: registration.as_ref(),
            })
    }

    /// Resolve `id` and invoke `method` on it.
    ///
    /// Unknown components, unknown methods and undecodable arguments are reported the
    /// same way a failing method is.
    pub fn invoke(
        &self,
        id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<MethodFuture, SerializedError> {
        let component = self.resolve(id).ok_or_else(|| {
            SerializedError::new(format!("No component registered as '{}'", id))
        })?;
        component.invoke(method, args)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&str> = self.ids().collect();
        ids.sort_unstable();
        f.debug_struct("ComponentRegistry")
            .field("components", &ids)
            .finish()
    }
}

/// A component found in a registry.
pub struct ResolvedComponent<'a> {
    id: &'a str,
    registration: &'a dyn Registration,
}

impl ResolvedComponent<'_> {
    pub fn id(&self) -> &str {
        self.id
    }

    /// Method names in its dispatch table, sorted.
    pub fn methods(&self) -> Vec<&str> {
        self.registration.method_names()
    }

    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<MethodFuture, SerializedError> {
        self.registration.invoke(method, args)
    }
}

/// Encode call arguments as a positional list.
///
/// Tuples and sequences become the list itself, `()` becomes an empty list, and any
/// other value is passed as the single argument. To pass one sequence as a single
/// argument, wrap it in a one-tuple: `(vec,)`.
pub fn encode_args<A: Serialize>(args: A) -> Result<Vec<Value>, serde_json::Error> {
    Ok(match serde_json::to_value(args)? {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    })
}

fn decode_args<A: DeserializeOwned>(label: &str, args: Vec<Value>) -> Result<A, SerializedError> {
    let decoded = if args.is_empty() {
        serde_json::from_value(Value::Null)
            .or_else(|_| serde_json::from_value(Value::Array(Vec::new())))
    } else {
        serde_json::from_value(Value::Array(args))
    };
    decoded.map_err(|e| SerializedError::new(format!("Invalid arguments for {}: {}", label, e)))
}

fn encode_result<R: Serialize>(value: R) -> Result<Value, SerializedError> {
    serde_json::to_value(value)
        .map_err(|e| SerializedError::new(format!("Failed to serialize result: {}", e)))
}

/// Type name without its module path, e.g. `PlainObject` for `app::model::PlainObject`.
pub(crate) fn short_type_name<C: ?Sized>() -> String {
    let full = std::any::type_name::<C>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
