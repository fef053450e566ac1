//! Pre-request and post-response interception points.
//!
//! The async session accepts both synchronous closures and closures
//! returning a boxed future; the two are kept as a tagged variant and
//! dispatched where the request pipeline runs them. Hook errors abort the
//! request as-is.

use futures_util::future::BoxFuture;

use crate::client::response::Response;
use crate::errors::Result;
use crate::http::request::RequestParts;

type PreSyncFn = dyn Fn(RequestParts) -> Result<RequestParts> + Send + Sync;
type PreAsyncFn = dyn Fn(RequestParts) -> BoxFuture<'static, Result<RequestParts>> + Send + Sync;
type PostSyncFn = dyn Fn(Response) -> Result<Response> + Send + Sync;
type PostAsyncFn = dyn Fn(Response) -> BoxFuture<'static, Result<Response>> + Send + Sync;

/// A pre-request hook: may rewrite `(method, url, headers)` after session
/// composition, before the wire write.
pub(crate) enum PreRequestHook {
    Sync(Box<PreSyncFn>),
    Async(Box<PreAsyncFn>),
}

impl PreRequestHook {
    pub(crate) async fn call(&self, parts: RequestParts) -> Result<RequestParts> {
        match self {
            PreRequestHook::Sync(hook) => hook(parts),
            PreRequestHook::Async(hook) => hook(parts).await,
        }
    }
}

/// A post-response hook: may substitute the response after framing,
/// before it is returned to the caller.
pub(crate) enum PostResponseHook {
    Sync(Box<PostSyncFn>),
    Async(Box<PostAsyncFn>),
}

impl PostResponseHook {
    pub(crate) async fn call(&self, response: Response) -> Result<Response> {
        match self {
            PostResponseHook::Sync(hook) => hook(response),
            PostResponseHook::Async(hook) => hook(response).await,
        }
    }
}
