use std::future::Future;
use std::pin::Pin;

use crate::error::StorageError;

/// Asynchronous key-value capability provided by the host app.
///
/// Backends range from plain memory to encrypted platform stores; the bridge
/// only relies on these four operations. Uses `Pin<Box<dyn Future>>` for
/// dyn-compatibility.
pub trait KeyValueStorage: Send + Sync {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, StorageError>> + Send + 'a>>;

    fn save<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>>;

    fn remove<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>>;

    fn clear<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>>;

    /// Backend name for logging and configuration.
    fn backend_name(&self) -> &str;
}
