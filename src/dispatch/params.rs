//! Typed parameter lists.
//!
//! On the wire a request body is a serialized array of parameter values.
//! Tuples of up to eight elements convert to and from that array, which lets
//! actions be registered with statically typed signatures instead of being
//! looked up and invoked reflectively.

use crate::error::SerializerError;
use crate::protocols::fast::serializer::to_value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::type_name;

/// Parameters an action accepts, decoded from wire values.
pub trait Params: Sized + Send + 'static {
    /// Number of wire values expected.
    const ARITY: usize;

    /// Declared parameter type names, for diagnostics.
    fn type_names() -> Vec<&'static str>;

    /// Decode positional wire values. The error describes the mismatch.
    fn from_values(values: Vec<Value>) -> Result<Self, String>;
}

/// Parameters a caller sends, encoded to wire values.
pub trait IntoParams {
    fn into_values(self) -> Result<Vec<Value>, SerializerError>;
}

macro_rules! impl_params {
    ($len:expr; $($name:ident),*) => {
        impl<$($name),*> Params for ($($name,)*)
        where
            $($name: DeserializeOwned + Send + 'static,)*
        {
            const ARITY: usize = $len;

            fn type_names() -> Vec<&'static str> {
                vec![$(type_name::<$name>()),*]
            }

            #[allow(unused_mut, unused_variables)]
            fn from_values(values: Vec<Value>) -> Result<Self, String> {
                if values.len() != $len {
                    return Err(format!(
                        "expected {} parameters, got {}",
                        $len,
                        values.len()
                    ));
                }
                let mut values = values.into_iter();
                Ok(($(
                    {
                        let value = values.next().unwrap_or(Value::Null);
                        serde_json::from_value::<$name>(value).map_err(|e| {
                            format!("parameter of type {}: {}", type_name::<$name>(), e)
                        })?
                    },
                )*))
            }
        }

        impl<$($name),*> IntoParams for ($($name,)*)
        where
            $($name: Serialize,)*
        {
            #[allow(non_snake_case)]
            fn into_values(self) -> Result<Vec<Value>, SerializerError> {
                let ($($name,)*) = self;
                Ok(vec![$(to_value(&$name)?),*])
            }
        }
    };
}

impl_params!(0;);
impl_params!(1; A);
impl_params!(2; A, B);
impl_params!(3; A, B, C);
impl_params!(4; A, B, C, D);
impl_params!(5; A, B, C, D, E);
impl_params!(6; A, B, C, D, E, F);
impl_params!(7; A, B, C, D, E, F, G);
impl_params!(8; A, B, C, D, E, F, G, H);

/// Split a decoded request body into positional values.
///
/// An array is taken as the parameter list, `null` as no parameters, and
/// any other value as a single parameter.
pub fn positional(body: Value) -> Vec<Value> {
    match body {
        Value::Array(values) => values,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}
