/// Boxed future returned by trait methods which need to stay object-safe, such as transports
/// and connection managers.
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;
