use futures::Future;

use crate::Error;

/// データライタの操作が返す`Future`。
pub type BoxFuture<T> = Box<dyn Future<Item = T, Error = Error> + Send + 'static>;
