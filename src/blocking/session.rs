//! Stateful blocking HTTP session - the thread-per-call twin of
//! [`Session`](crate::Session).
//!
//! Same composition, redirect and pooling semantics as the async session;
//! the I/O primitives block with per-call socket timeouts instead of
//! suspending. Hooks are synchronous closures only - there is no runtime
//! to drive an async hook here, so the registration signatures admit
//! nothing else.

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::sync::Arc;
use tracing::debug;

use crate::auth::Auth;
use crate::blocking::body::{Body, BodyInner};
use crate::blocking::pool::{Checkout, Pool};
use crate::blocking::response::{BodyReader, Response};
use crate::client::cookies::CookieJar;
use crate::errors::{Error, ErrorKind, Result};
use crate::http::codec::{encode_chunk, encode_final, BodyFraming};
use crate::http::headers::HeaderMap;
use crate::http::request::{write_head, RequestParts};
use crate::http::types::Method;
use crate::http::url::Url;
use crate::limits::{PoolLimits, ProtocolLimits};
use crate::redirect::{is_redirect, rewrite_method, RedirectState};
use crate::timing::{Deadline, Timeout};

type PreHook = dyn Fn(RequestParts) -> Result<RequestParts> + Send + Sync;
type PostHook = dyn Fn(Response) -> Result<Response> + Send + Sync;

struct SessionState {
    headers: HeaderMap,
    cookies: CookieJar,
    auth: Option<Auth>,
}

#[derive(Default)]
struct HookLists {
    pre: Vec<Arc<PreHook>>,
    post: Vec<Arc<PostHook>>,
}

/// Builder for the blocking [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    base_url: Option<Url>,
    timeout: Option<Timeout>,
    pool_limits: Option<PoolLimits>,
    protocol_limits: Option<ProtocolLimits>,
}

impl SessionBuilder {
    /// Base URL that relative request URLs resolve against.
    pub fn base_url(mut self, url: Url) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Default time budget for every request.
    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Connection pool sizing and idle expiry.
    pub fn pool_limits(mut self, limits: PoolLimits) -> Self {
        self.pool_limits = Some(limits);
        self
    }

    /// Wire parser limits.
    pub fn protocol_limits(mut self, limits: ProtocolLimits) -> Self {
        self.protocol_limits = Some(limits);
        self
    }

    /// Builds the session.
    pub fn build(self) -> Session {
        Session {
            pool: Pool::new(self.pool_limits.unwrap_or_default()),
            base_url: self.base_url,
            timeout: self.timeout.unwrap_or_default(),
            protocol_limits: self.protocol_limits.unwrap_or_default(),
            state: Mutex::new(SessionState {
                headers: HeaderMap::new(),
                cookies: CookieJar::new(),
                auth: None,
            }),
            hooks: Mutex::new(HookLists::default()),
        }
    }
}

/// Blocking HTTP session.
///
/// # Examples
///
/// ```no_run
/// use maker_client::blocking::Session;
///
/// # fn run() -> maker_client::Result<()> {
/// let session = Session::new();
/// let mut response = session.get("http://example.com/").send()?;
/// println!("{} {}", response.status(), response.text()?);
/// session.close();
/// # Ok(())
/// # }
/// ```
pub struct Session {
    pool: Pool,
    base_url: Option<Url>,
    timeout: Timeout,
    protocol_limits: ProtocolLimits,
    state: Mutex<SessionState>,
    hooks: Mutex<HookLists>,
}

impl Default for Session {
    fn default() -> Self {
        Session::builder().build()
    }
}

impl Session {
    /// A session with default limits and timeouts.
    pub fn new() -> Self {
        Session::default()
    }

    /// Starts configuring a session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Begins a request with an explicit method.
    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder {
            session: self,
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: Body::empty(),
            timeout: None,
            allow_redirects: true,
            max_redirects: 30,
            decompress: true,
            auth: None,
            error: None,
        }
    }

    /// Begins a GET request.
    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Get, url)
    }

    /// Begins a POST request.
    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Post, url)
    }

    /// Begins a PUT request.
    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Put, url)
    }

    /// Begins a PATCH request.
    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Patch, url)
    }

    /// Begins a DELETE request.
    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Delete, url)
    }

    /// Begins a HEAD request.
    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Head, url)
    }

    /// Begins an OPTIONS request.
    pub fn options(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Options, url)
    }

    /// Mutable view of the persistent headers sent with every request.
    pub fn headers(&self) -> MappedMutexGuard<'_, HeaderMap> {
        MutexGuard::map(self.state.lock(), |s| &mut s.headers)
    }

    /// Mutable view of the cookie jar.
    pub fn cookies(&self) -> MappedMutexGuard<'_, CookieJar> {
        MutexGuard::map(self.state.lock(), |s| &mut s.cookies)
    }

    /// Attaches Basic credentials to every subsequent request.
    pub fn set_basic_auth(&self, user: impl Into<String>, password: impl Into<String>) {
        self.state.lock().auth = Some(Auth::Basic {
            user: user.into(),
            password: password.into(),
        });
    }

    /// Attaches a Bearer token to every subsequent request.
    pub fn set_bearer_token(&self, token: impl Into<String>) {
        self.state.lock().auth = Some(Auth::Bearer(token.into()));
    }

    /// Removes session-level credentials.
    pub fn clear_auth(&self) {
        self.state.lock().auth = None;
    }

    /// Appends a pre-request hook.
    pub fn add_pre_request_hook(
        &self,
        hook: impl Fn(RequestParts) -> Result<RequestParts> + Send + Sync + 'static,
    ) {
        self.hooks.lock().pre.push(Arc::new(hook));
    }

    /// Appends a post-response hook.
    pub fn add_post_response_hook(
        &self,
        hook: impl Fn(Response) -> Result<Response> + Send + Sync + 'static,
    ) {
        self.hooks.lock().post.push(Arc::new(hook));
    }

    /// Closes every idle connection. Idempotent; the session stays usable.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Closes idle connections past their idle budget.
    pub fn prune(&self) {
        self.pool.prune();
    }

    /// Begins a WebSocket connection to a `ws://` or `wss://` URL.
    pub fn websocket(&self, url: impl Into<String>) -> crate::blocking::ws::WebSocketBuilder<'_> {
        crate::blocking::ws::WebSocketBuilder::new(self, url.into())
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    pub(crate) fn protocol_limits(&self) -> &ProtocolLimits {
        &self.protocol_limits
    }

    pub(crate) fn default_timeout(&self) -> Timeout {
        self.timeout
    }

    pub(crate) fn resolve_request_url(&self, raw: &str) -> Result<Url> {
        match &self.base_url {
            Some(base) => base.resolve(raw),
            None => Url::parse(raw),
        }
    }
}

/// One blocking request in preparation.
pub struct RequestBuilder<'a> {
    session: &'a Session,
    method: Method,
    url: String,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body: Body,
    timeout: Option<Timeout>,
    allow_redirects: bool,
    max_redirects: usize,
    decompress: bool,
    auth: Option<Auth>,
    error: Option<Error>,
}

impl<'a> RequestBuilder<'a> {
    /// Adds one header (appending, so repeated names accumulate).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.headers.add(name, value) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Appends url-encoded query pairs to the request URL.
    pub fn query(mut self, pairs: &[(&str, &str)]) -> Self {
        self.query.extend(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned())),
        );
        self
    }

    /// Sets the request body.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Overrides the session's time budget for this request.
    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables or disables automatic redirect following (default: on).
    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.allow_redirects = allow;
        self
    }

    /// Redirect-chain bound (default: 30).
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Disables transparent gzip/deflate decoding for this request.
    pub fn no_decompress(mut self) -> Self {
        self.decompress = false;
        self
    }

    /// Basic credentials for this request only, shadowing session auth.
    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Auth::Basic {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    /// Bearer token for this request only, shadowing session auth.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(Auth::Bearer(token.into()));
        self
    }

    /// Sends the request; blocks until the response head is parsed.
    pub fn send(mut self) -> Result<Response> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }

        let session = self.session;

        let mut url = session.resolve_request_url(&self.url)?;
        if url.scheme().is_websocket() {
            return Err(Error::new(ErrorKind::InvalidRequest)
                .with_detail("ws/wss URLs go through Session::websocket")
                .with_url(url.to_string()));
        }
        let query: Vec<(&str, &str)> = self
            .query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        url.append_query_pairs(&query);

        let deadline = Deadline::start(self.timeout.unwrap_or(session.timeout));

        let (session_headers, cookie_header, session_auth) = {
            let state = session.state.lock();
            (
                state.headers.clone(),
                state.cookies.cookie_header(&url.origin()),
                state.auth.clone(),
            )
        };
        let mut headers = self.headers;
        headers.merge_absent(&session_headers);
        if let Some(cookie) = cookie_header {
            if !headers.contains("cookie") {
                headers.set("Cookie", cookie)?;
            }
        }
        if let Some(auth) = self.auth.take().or(session_auth) {
            if !headers.contains("authorization") {
                headers.set("Authorization", auth.header_value())?;
            }
        }

        let mut parts = RequestParts {
            method: self.method,
            url,
            headers,
        };

        let pre_hooks: Vec<_> = session.hooks.lock().pre.clone();
        for hook in &pre_hooks {
            parts = hook(parts)?;
            if parts.url.scheme().is_websocket() {
                return Err(Error::new(ErrorKind::InvalidRequest)
                    .with_detail("pre-request hook produced a websocket URL"));
            }
        }

        let mut body = self.body;
        let mut chain = RedirectState::new(&parts.url);
        let mut history: Vec<Response> = Vec::new();
        let limits = session.protocol_limits.clone();

        let mut response = loop {
            deadline
                .check_total()
                .map_err(|e| e.with_url(parts.url.to_string()))?;

            let origin = parts.url.origin();
            let mut checkout = session
                .pool
                .acquire(&origin, &deadline)
                .map_err(|e| e.with_url(parts.url.to_string()))?;

            let body_was_streamed =
                matches!(body.inner, BodyInner::Reader(_) | BodyInner::Iter(_));
            write_request(&mut checkout, &parts, &mut body, self.decompress, &deadline)
                .map_err(|e| e.with_url(parts.url.to_string()))?;

            let head = checkout
                .conn()
                .read_head(&limits, &deadline)
                .map_err(|e| e.with_url(parts.url.to_string()))?;

            {
                let mut state = session.state.lock();
                state
                    .cookies
                    .apply_set_cookie(&origin, head.headers.get_all("set-cookie").into_iter());
            }

            let framing = BodyFraming::resolve(parts.method, &head)
                .map_err(|e| e.with_url(parts.url.to_string()))?;

            let location = head.headers.get("location").map(str::to_owned);
            let follow = self.allow_redirects && is_redirect(head.status) && location.is_some();

            if !follow {
                let reader = BodyReader::new(
                    checkout,
                    &head,
                    framing,
                    self.decompress,
                    &limits,
                    deadline,
                );
                let mut response =
                    Response::streaming(head, parts.url.clone(), reader, limits.max_body_size);
                response.set_history(std::mem::take(&mut history));
                break response;
            }

            let mut reader = BodyReader::new(
                checkout,
                &head,
                framing,
                self.decompress,
                &limits,
                deadline,
            );
            let hop_body = reader
                .read_to_end(limits.max_body_size)
                .map_err(|e| e.with_url(parts.url.to_string()))?;

            let status = head.status;
            let next_url = parts
                .url
                .resolve(location.as_deref().unwrap_or_default())
                .map_err(|e| e.with_url(parts.url.to_string()))?;

            chain.check_next(&next_url, self.max_redirects)?;
            chain.record(&parts.url, status);

            history.push(Response::buffered(
                head,
                parts.url.clone(),
                hop_body,
                limits.max_body_size,
            ));

            let (next_method, drop_body) = rewrite_method(status, parts.method);
            if drop_body {
                body = Body::empty();
                parts.headers.remove("content-length");
                parts.headers.remove("transfer-encoding");
                parts.headers.remove("content-type");
            } else if body_was_streamed {
                return Err(Error::new(ErrorKind::InvalidRequest)
                    .with_detail("streamed body cannot be replayed across a redirect")
                    .with_url(next_url.to_string()));
            } else if let Some(replay) = body.replay() {
                body = replay;
            }

            if next_url.origin() != origin {
                parts.headers.remove("authorization");
            }
            parts.headers.remove("cookie");
            {
                let cookie = session
                    .state
                    .lock()
                    .cookies
                    .cookie_header(&next_url.origin());
                if let Some(cookie) = cookie {
                    parts.headers.set("Cookie", cookie)?;
                }
            }

            debug!(
                from = %parts.url,
                to = %next_url,
                status,
                method = %next_method,
                "following redirect"
            );

            parts.url = next_url;
            parts.method = next_method;
        };

        let post_hooks: Vec<_> = session.hooks.lock().post.clone();
        for hook in &post_hooks {
            response = hook(response)?;
        }

        Ok(response)
    }
}

fn write_request(
    checkout: &mut Checkout,
    parts: &RequestParts,
    body: &mut Body,
    decompress: bool,
    deadline: &Deadline,
) -> Result<()> {
    let mut wire = Vec::with_capacity(256);
    write_head(parts, body.shape(), decompress, &mut wire)?;

    match &mut body.inner {
        BodyInner::Empty => checkout.conn().write_all(&wire, deadline),
        BodyInner::Bytes(bytes) => {
            wire.extend_from_slice(bytes);
            checkout.conn().write_all(&wire, deadline)
        }
        BodyInner::Reader(_) | BodyInner::Iter(_) => {
            checkout.conn().write_all(&wire, deadline)?;

            while let Some(data) = body.next_stream_chunk().map_err(Error::io)? {
                if data.is_empty() {
                    continue;
                }
                let mut chunk = Vec::with_capacity(data.len() + 16);
                encode_chunk(&data, &mut chunk);
                checkout.conn().write_all(&chunk, deadline)?;
            }

            let mut terminator = Vec::new();
            encode_final(&mut terminator);
            checkout.conn().write_all(&terminator, deadline)
        }
    }
}

#[cfg(test)]
mod blocking_session_tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, format!("http://127.0.0.1:{port}"))
    }

    fn read_request(sock: &mut TcpStream) -> String {
        let mut buf: Vec<u8> = Vec::new();
        let mut tmp = [0u8; 4096];

        loop {
            if let Some(pos) = memchr::memmem::find(&buf, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos + 4]).to_lowercase();
                let have = buf.len() - (pos + 4);

                let done = if let Some(cl_pos) = head.find("content-length:") {
                    let cl: usize = head[cl_pos + 15..]
                        .lines()
                        .next()
                        .unwrap()
                        .trim()
                        .parse()
                        .unwrap();
                    have >= cl
                } else if head.contains("transfer-encoding: chunked") {
                    buf.ends_with(b"0\r\n\r\n")
                } else {
                    true
                };

                if done {
                    return String::from_utf8_lossy(&buf).into_owned();
                }
            }

            let n = sock.read(&mut tmp).unwrap();
            assert!(n > 0, "client closed mid-request");
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    #[test]
    fn simple_get() {
        let (listener, base) = bind();
        let origin = Url::parse(&base).unwrap().origin();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let req = read_request(&mut sock);
            assert!(req.starts_with("GET / HTTP/1.1\r\n"), "{req}");
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .unwrap();
            sock
        });

        let session = Session::new();
        let mut resp = session.get(format!("{base}/")).send().unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body().unwrap(), b"hello");
        assert_eq!(session.pool().idle_count(&origin), 1);

        drop(server.join().unwrap());
    }

    #[test]
    fn redirect_and_reuse() {
        let (listener, base) = bind();
        let accepts = Arc::new(AtomicUsize::new(0));

        let counter = accepts.clone();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            counter.fetch_add(1, Ordering::SeqCst);

            let first = read_request(&mut sock);
            assert!(first.starts_with("POST /a "), "{first}");
            sock.write_all(
                b"HTTP/1.1 301 Moved Permanently\r\nLocation: /b\r\nContent-Length: 0\r\n\r\n",
            )
            .unwrap();

            let second = read_request(&mut sock);
            assert!(second.starts_with("GET /b "), "{second}");
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone")
                .unwrap();
            sock
        });

        let session = Session::new();
        let mut resp = session
            .post(format!("{base}/a"))
            .body("x=1")
            .send()
            .unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body().unwrap(), b"done");
        assert_eq!(resp.history().len(), 1);
        assert_eq!(accepts.load(Ordering::SeqCst), 1);

        drop(server.join().unwrap());
    }

    #[test]
    fn chunked_reader_upload() {
        let (listener, base) = bind();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let req = read_request(&mut sock);
            assert!(req.contains("Transfer-Encoding: chunked\r\n"), "{req}");
            assert!(req.contains("streamed payload"), "{req}");
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
            sock
        });

        let session = Session::new();
        let resp = session
            .post(format!("{base}/upload"))
            .body(Body::from_reader(std::io::Cursor::new(
                b"streamed payload".to_vec(),
            )))
            .send()
            .unwrap();

        assert_eq!(resp.status(), 200);
        drop(server.join().unwrap());
    }

    #[test]
    fn iter_lines_splits() {
        let (listener, base) = bind();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let _ = read_request(&mut sock);
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 15\r\n\r\none\r\ntwo\nfinale",
            )
            .unwrap();
            sock
        });

        let session = Session::new();
        let resp = session.get(format!("{base}/")).send().unwrap();
        let lines: Vec<Vec<u8>> = resp.iter_lines().map(|l| l.unwrap()).collect();

        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec(), b"finale".to_vec()]);
        drop(server.join().unwrap());
    }

    #[test]
    fn json_body() {
        let (listener, base) = bind();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let _ = read_request(&mut sock);
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 23\r\n\r\n{\"name\":\"pin\",\"size\":3}",
            )
            .unwrap();
            sock
        });

        #[derive(serde::Deserialize)]
        struct Payload {
            name: String,
            size: u32,
        }

        let session = Session::new();
        let mut resp = session.get(format!("{base}/")).send().unwrap();
        let payload: Payload = resp.json().unwrap();

        assert_eq!(payload.name, "pin");
        assert_eq!(payload.size, 3);
        drop(server.join().unwrap());
    }

    #[test]
    fn hooks_and_cookies() {
        let (listener, base) = bind();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();

            let first = read_request(&mut sock);
            assert!(first.contains("X-Hooked: yes\r\n"), "{first}");
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nSet-Cookie: sid=42\r\nContent-Length: 0\r\n\r\n",
            )
            .unwrap();

            let second = read_request(&mut sock);
            assert!(second.contains("Cookie: sid=42\r\n"), "{second}");
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
            sock
        });

        let session = Session::new();
        session.add_pre_request_hook(|mut parts| {
            parts.headers.set("X-Hooked", "yes")?;
            Ok(parts)
        });

        session.get(format!("{base}/")).send().unwrap();
        session.get(format!("{base}/")).send().unwrap();

        drop(server.join().unwrap());
    }
}
