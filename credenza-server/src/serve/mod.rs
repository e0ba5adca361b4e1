//! The request pipeline.
//!
//! A request moves through path resolution, the virtual-resource check,
//! metadata lookup, the freshness check, cache lookup, range computation,
//! transform/stream, and cache population, with error exits at every
//! stage. Two sources of truth feed the protocol: live watcher metadata
//! for freshness and ranges, and the entry cache for whole-object replay.
//! Range requests always bypass the whole-object cache.

pub mod conditional;
pub mod path;
pub mod range;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use credenza_core::cache::AddOutcome;
use credenza_core::{CacheEntry, FileMeta, PopulationHandle, VirtualResource};

use crate::config::Config;
use crate::state::AppState;
use path::PathRejection;
use range::RangeOutcome;

/// Read granularity for streamed files.
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// In-flight chunks between the file reader and a slow client.
const STREAM_BUFFER_CHUNKS: usize = 8;

/// Fallback handler covering every path under the configured prefix.
pub async fn handle(State(state): State<AppState>, req: Request) -> Response {
    let head = if req.method() == Method::HEAD {
        true
    } else if req.method() == Method::GET {
        false
    } else {
        return delegate();
    };

    let raw_path = req.uri().path().to_owned();
    let req_headers = req.headers().clone();

    match serve(&state, &raw_path, head, &req_headers).await {
        Ok(response) => response,
        Err(err) => {
            error!(path = %raw_path, %err, "request failed");
            respond(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

async fn serve(
    state: &AppState,
    raw_path: &str,
    head: bool,
    req_headers: &HeaderMap,
) -> credenza_core::Result<Response> {
    // PARSE: prefix strip, percent-decode, containment.
    let request_path = match &state.config.prefix {
        Some(prefix) => match raw_path.strip_prefix(prefix.as_str()) {
            Some("") => "/",
            Some(rest) if rest.starts_with('/') => rest,
            _ => return Ok(delegate()),
        },
        None => raw_path,
    };

    let decoded = match path::decode(request_path) {
        Ok(decoded) => decoded,
        Err(PathRejection::BadRequest) => {
            return Ok(respond(StatusCode::BAD_REQUEST, "Bad Request"));
        }
        Err(PathRejection::Forbidden) => {
            return Ok(respond(StatusCode::FORBIDDEN, "Forbidden"));
        }
    };

    // VIRTUAL_CHECK: registered producers own their request path.
    if let Some(producer) = state.virtuals.get(&decoded) {
        return serve_virtual(state, &decoded, producer, head, req_headers).await;
    }

    let mut fs_path = match path::resolve(&state.config.root, &decoded) {
        Ok(resolved) => resolved,
        Err(_) => return Ok(respond(StatusCode::FORBIDDEN, "Forbidden")),
    };

    // Default document for directory requests.
    if decoded.ends_with('/') && state.config.index {
        fs_path.push("index.html");
    }

    if !state.config.hidden && is_hidden(&fs_path) {
        return Ok(delegate());
    }

    // METADATA: non-existence delegates onward.
    let Some(meta) = state.watcher.metadata(&fs_path).await? else {
        return Ok(delegate());
    };

    if meta.is_dir {
        if state.config.redirect && !decoded.ends_with('/') {
            return Ok(redirect_to_slash(raw_path));
        }
        return Ok(delegate());
    }

    // FRESHNESS against live metadata.
    if conditional::is_conditional(req_headers)
        && conditional::is_fresh(req_headers, Some(meta.etag.as_str()), Some(meta.mtime))
    {
        return Ok((StatusCode::NOT_MODIFIED, base_headers(&meta, &state.config)).into_response());
    }

    // RANGE_COMPUTE: a present Range header bypasses the cache entirely.
    if let Some(range_header) = req_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
    {
        match range::parse_range(range_header, meta.size) {
            RangeOutcome::Unsatisfiable => {
                let mut headers = base_headers(&meta, &state.config);
                headers.insert(
                    header::CONTENT_RANGE,
                    format!("bytes */{}", meta.size).parse().unwrap(),
                );
                return Ok((StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response());
            }
            RangeOutcome::Satisfiable { start, end } => {
                return serve_range(state, &meta, &fs_path, start, end, head).await;
            }
            RangeOutcome::Invalid => {
                // Treated as if no range was requested.
            }
        }
    }

    serve_whole(state, &meta, &fs_path, head, req_headers).await
}

/// Whole-object path: cache replay on a hit, otherwise transform or
/// stream, mirroring bytes into the cache when eligible.
async fn serve_whole(
    state: &AppState,
    meta: &FileMeta,
    fs_path: &Path,
    head: bool,
    req_headers: &HeaderMap,
) -> credenza_core::Result<Response> {
    let accept_encoding = req_headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok());

    // Transform eligibility is part of the cache key: an encoded variant
    // must never be replayed to a client that did not ask for it.
    let transforming = state
        .transforms
        .wants(fs_path, &meta.content_type, accept_encoding);
    let key = cache_key(fs_path, transforming);

    let mut headers = base_headers(meta, &state.config);
    headers.insert(
        header::CONTENT_TYPE,
        meta.content_type.parse().unwrap(),
    );

    if head {
        // HEAD replays cached identity headers when available but never
        // populates or transforms.
        if let Some(entry) = state
            .cache
            .as_ref()
            .and_then(|cache| cache.get(&cache_key(fs_path, false)))
            .and_then(|fut| fut.ready())
        {
            return Ok(replay_entry(&entry, true, req_headers));
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));
        return Ok((StatusCode::OK, headers, Body::empty()).into_response());
    }

    // Size gating happens before `add`: oversized objects bypass the
    // cache and stream directly.
    let cacheable = meta.size < state.config.cache.max_size;

    if let Some(cache) = &state.cache {
        if cacheable {
            match cache.try_add(&key) {
                AddOutcome::Existing(fut) => match fut.entry().await {
                    Ok(entry) => return Ok(replay_entry(&entry, false, req_headers)),
                    Err(err) => {
                        // The winning population failed; serve directly
                        // without retrying the cache on this request.
                        warn!(%key, %err, "shared population failed, serving directly");
                        return produce_and_stream(
                            state,
                            meta,
                            fs_path,
                            headers,
                            None,
                            transforming,
                            accept_encoding,
                        )
                        .await;
                    }
                },
                AddOutcome::Begun(handle) => {
                    return produce_and_stream(
                        state,
                        meta,
                        fs_path,
                        headers,
                        Some(handle),
                        transforming,
                        accept_encoding,
                    )
                    .await;
                }
            }
        } else if let Some(entry) = cache.get(&key).and_then(|fut| fut.ready()) {
            return Ok(replay_entry(&entry, false, req_headers));
        }
    }

    produce_and_stream(
        state,
        meta,
        fs_path,
        headers,
        None,
        transforming,
        accept_encoding,
    )
    .await
}

/// TRANSFORM/STREAM and CACHE_POPULATE: runs the transform pipeline when
/// a stage applies (buffered), otherwise streams the raw file, in both
/// cases mirroring outgoing bytes into the supplied population handle.
async fn produce_and_stream(
    state: &AppState,
    meta: &FileMeta,
    fs_path: &Path,
    mut headers: HeaderMap,
    population: Option<PopulationHandle>,
    transforming: bool,
    accept_encoding: Option<&str>,
) -> credenza_core::Result<Response> {
    if transforming {
        let raw = match tokio::fs::read(fs_path).await {
            Ok(raw) => Bytes::from(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(delegate());
            }
            Err(err) => return Err(err.into()),
        };

        let transformed = state
            .transforms
            .run(fs_path, &meta.content_type, accept_encoding, raw.clone())
            .await;

        let body = match transformed {
            Ok(Some(output)) => {
                if let Some(content_type) = &output.content_type {
                    headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
                }
                if let Some(encoding) = &output.content_encoding {
                    headers.insert(header::CONTENT_ENCODING, encoding.parse().unwrap());
                }
                if !output.dependencies.is_empty() {
                    register_dependencies(state, fs_path, &output.dependencies, &mut headers)
                        .await?;
                }
                output.bytes
            }
            Ok(None) => raw,
            Err(err) => {
                warn!(path = %fs_path.display(), %err, "transform failed, serving verbatim");
                raw
            }
        };

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

        if let Some(mut handle) = population {
            if (body.len() as u64) < state.config.cache.max_size {
                handle.push(body.clone());
                handle.complete(snapshot(&headers));
            } else {
                handle.fail("resolved payload exceeds the cache size limit");
            }
        }

        return Ok((StatusCode::OK, headers, Body::from(body)).into_response());
    }

    // Raw streaming path.
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));
    let file = match File::open(fs_path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(delegate());
        }
        Err(err) => return Err(err.into()),
    };

    let body = mirror_stream(file, population, snapshot(&headers));
    Ok((StatusCode::OK, headers, body).into_response())
}

/// Registers transform-declared sources with the watcher and refreshes
/// the outgoing etag, which now covers them.
async fn register_dependencies(
    state: &AppState,
    fs_path: &Path,
    dependencies: &[PathBuf],
    headers: &mut HeaderMap,
) -> credenza_core::Result<()> {
    let mut known = Vec::with_capacity(dependencies.len());
    for dep in dependencies {
        if state.watcher.metadata(dep).await?.is_some() {
            known.push(dep.clone());
        } else {
            warn!(path = %dep.display(), "declared dependency has no metadata, skipping");
        }
    }
    state.watcher.set_dependencies(fs_path, &known).await?;
    if let Some(fresh) = state.watcher.metadata(fs_path).await? {
        headers.insert(header::ETAG, fresh.etag.parse().unwrap());
    }
    Ok(())
}

/// 206 path: seek, bounded read, no transform, no caching.
async fn serve_range(
    state: &AppState,
    meta: &FileMeta,
    fs_path: &Path,
    start: u64,
    end: u64,
    head: bool,
) -> credenza_core::Result<Response> {
    let len = end - start + 1;

    let mut headers = base_headers(meta, &state.config);
    headers.insert(header::CONTENT_TYPE, meta.content_type.parse().unwrap());
    headers.insert(
        header::CONTENT_RANGE,
        format!("bytes {start}-{end}/{}", meta.size).parse().unwrap(),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));

    if head {
        return Ok((StatusCode::PARTIAL_CONTENT, headers, Body::empty()).into_response());
    }

    let mut file = match File::open(fs_path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(delegate());
        }
        Err(err) => return Err(err.into()),
    };
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let reader = file.take(len);

    let body = Body::from_stream(ReaderStream::with_capacity(reader, STREAM_CHUNK_SIZE));
    Ok((StatusCode::PARTIAL_CONTENT, headers, body).into_response())
}

/// Serves a registered virtual resource, caching its payload like a file.
async fn serve_virtual(
    state: &AppState,
    request_path: &str,
    producer: Arc<dyn VirtualResource>,
    head: bool,
    req_headers: &HeaderMap,
) -> credenza_core::Result<Response> {
    if let Some(cache) = &state.cache {
        match cache.try_add(request_path) {
            AddOutcome::Existing(fut) => {
                if let Ok(entry) = fut.entry().await {
                    return Ok(replay_entry(&entry, head, req_headers));
                }
                // Producer failed for the population winner; try again
                // uncached.
                return produce_virtual(state, request_path, producer, head, req_headers, None)
                    .await;
            }
            AddOutcome::Begun(handle) => {
                return produce_virtual(
                    state,
                    request_path,
                    producer,
                    head,
                    req_headers,
                    Some(handle),
                )
                .await;
            }
        }
    }
    produce_virtual(state, request_path, producer, head, req_headers, None).await
}

async fn produce_virtual(
    state: &AppState,
    request_path: &str,
    producer: Arc<dyn VirtualResource>,
    head: bool,
    req_headers: &HeaderMap,
    population: Option<PopulationHandle>,
) -> credenza_core::Result<Response> {
    let (payload, declared) = match producer.produce(&state.config.root).await {
        Ok(produced) => produced,
        Err(err) => {
            error!(path = %request_path, %err, "virtual producer failed");
            if let Some(handle) = population {
                handle.fail(err.to_string());
            }
            return Ok(respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
            ));
        }
    };

    // Register the declared sources so a change to any of them retags and
    // invalidates this path. Sources are observed lazily, on first use.
    let virt_path = PathBuf::from(request_path);
    let mut known = Vec::with_capacity(declared.len());
    for dep in &declared {
        if state.watcher.metadata(dep).await?.is_some() {
            known.push(dep.clone());
        } else {
            warn!(path = %dep.display(), "virtual dependency has no metadata, skipping");
        }
    }
    state.watcher.set_virtual(&virt_path, &known).await?;
    state
        .watcher
        .set_content_type(&virt_path, producer.content_type())
        .await;
    let meta = state.watcher.metadata(&virt_path).await?.ok_or_else(|| {
        credenza_core::AssetError::Internal(format!("lost virtual metadata for {request_path}"))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(header::DATE, http_date_now());
    headers.insert(
        header::CACHE_CONTROL,
        format!("public, max-age={}", state.config.max_age_secs())
            .parse()
            .unwrap(),
    );
    headers.insert(header::ETAG, meta.etag.parse().unwrap());
    headers.insert(
        header::CONTENT_TYPE,
        producer.content_type().parse().unwrap(),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(payload.len()));

    if let Some(mut handle) = population {
        if (payload.len() as u64) < state.config.cache.max_size {
            handle.push(payload.clone());
            handle.complete(snapshot(&headers));
        } else {
            handle.fail("virtual payload exceeds the cache size limit");
        }
    }

    if conditional::is_conditional(req_headers)
        && conditional::is_fresh(req_headers, Some(meta.etag.as_str()), None)
    {
        strip_content_headers(&mut headers);
        return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
    }

    if head {
        return Ok((StatusCode::OK, headers, Body::empty()).into_response());
    }
    Ok((StatusCode::OK, headers, Body::from(payload)).into_response())
}

/// Replays a completed entry: stored headers with a fresh `Date` and the
/// entry's age, the conditional check against the stored validators, and
/// the chunk sequence in write order.
fn replay_entry(entry: &CacheEntry, head: bool, req_headers: &HeaderMap) -> Response {
    let mut headers = restore(&entry.headers);
    headers.insert(header::DATE, http_date_now());
    let age = entry
        .created_at
        .elapsed()
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    headers.insert(header::AGE, HeaderValue::from(age));

    let last_modified = entry
        .header("last-modified")
        .and_then(|v| httpdate::parse_http_date(v).ok());
    if conditional::is_conditional(req_headers)
        && conditional::is_fresh(req_headers, entry.header("etag"), last_modified)
    {
        strip_content_headers(&mut headers);
        return (StatusCode::NOT_MODIFIED, headers).into_response();
    }

    if head {
        return (StatusCode::OK, headers, Body::empty()).into_response();
    }

    let chunks = entry.chunks.clone();
    let body = Body::from_stream(tokio_stream::iter(
        chunks.into_iter().map(Ok::<Bytes, std::io::Error>),
    ));
    (StatusCode::OK, headers, body).into_response()
}

/// Streams a file to the client while mirroring chunks into an optional
/// population. A client disconnect aborts the read only when nothing is
/// being populated; an in-progress population always runs to completion
/// for the benefit of other readers of the same key.
fn mirror_stream(
    file: File,
    mut population: Option<PopulationHandle>,
    stored_headers: Vec<(String, String)>,
) -> Body {
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(STREAM_BUFFER_CHUNKS);

    tokio::spawn(async move {
        let mut chunks = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE);
        let mut client_connected = true;

        while let Some(next) = chunks.next().await {
            match next {
                Ok(chunk) => {
                    if let Some(handle) = population.as_mut() {
                        handle.push(chunk.clone());
                    }
                    if client_connected && tx.send(Ok(chunk)).await.is_err() {
                        client_connected = false;
                        if population.is_none() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    if let Some(handle) = population.take() {
                        handle.fail(format!("read failed: {err}"));
                    }
                    if client_connected {
                        let _ = tx.send(Err(err)).await;
                    }
                    return;
                }
            }
        }

        if let Some(handle) = population.take() {
            handle.complete(stored_headers);
        }
    });

    Body::from_stream(ReceiverStream::new(rx))
}

/// Headers common to every non-error response for a resource. Content
/// headers are added separately so 304 responses stay clean.
fn base_headers(meta: &FileMeta, config: &Config) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::DATE, http_date_now());
    headers.insert(
        header::CACHE_CONTROL,
        format!("public, max-age={}", config.max_age_secs())
            .parse()
            .unwrap(),
    );
    if meta.mtime > UNIX_EPOCH {
        headers.insert(
            header::LAST_MODIFIED,
            httpdate::fmt_http_date(meta.mtime).parse().unwrap(),
        );
    }
    if !meta.etag.is_empty() {
        headers.insert(header::ETAG, meta.etag.parse().unwrap());
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers
}

fn http_date_now() -> HeaderValue {
    httpdate::fmt_http_date(SystemTime::now()).parse().unwrap()
}

fn strip_content_headers(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("content-"))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

/// Cache key for a filesystem path. The encoded variant lives under its
/// own key so identity and transformed bodies never cross.
pub fn cache_key(fs_path: &Path, transformed: bool) -> String {
    if transformed {
        format!("{}#enc", fs_path.display())
    } else {
        fs_path.to_string_lossy().into_owned()
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn redirect_to_slash(raw_path: &str) -> Response {
    let location = format!("{raw_path}/");
    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, location.parse().unwrap());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=UTF-8"),
    );
    (
        StatusCode::MOVED_PERMANENTLY,
        headers,
        format!("Redirecting to {location}"),
    )
        .into_response()
}

fn respond(status: StatusCode, body: &'static str) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=UTF-8"),
    );
    (status, headers, body).into_response()
}

/// 404 fallthrough: the pipeline has nothing for this request and the
/// next handler (here, the terminal not-found response) takes over.
fn delegate() -> Response {
    respond(StatusCode::NOT_FOUND, "Not Found")
}

fn snapshot(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn restore(stored: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in stored {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}
