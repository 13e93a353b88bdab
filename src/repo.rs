//! A small storage-backed chart repository handler.
//!
//! This is what the Lambda binary publishes when it boots. It only knows
//! enough of the ChartMuseum HTTP surface to be useful behind API Gateway:
//!
//! - `GET /health`
//! - `GET|HEAD /index.yaml`, generated from the stored `*.tgz` objects
//! - `GET|HEAD /charts/{file}`
//! - `POST /api/charts`, with the raw chart tarball as the body
//! - `DELETE /api/charts/{name}/{version}`
//!
//! all mounted under the configured context path. Index entries come from
//! each archive's own `Chart.yaml`, never from its object name. Provenance
//! files, bearer auth and multitenancy are not supported.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use lambda_http::{
    http::{
        header::{
            HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_TYPE,
            WWW_AUTHENTICATE,
        },
        Method, Request, Response, StatusCode,
    },
    Body, Error,
};
use lambda_runtime::tracing;
use semver::Version;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    future::Future,
    io::Read,
    sync::Arc,
    time::{Duration, Instant},
};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use crate::{
    config::ServerOptions,
    handler::{BoxFuture, RequestHandler},
    storage::Storage,
};

#[derive(Clone)]
pub struct ChartRepo {
    inner: Arc<Inner>,
}

struct Inner {
    storage: Box<dyn Storage>,
    options: ServerOptions,
    index_cache: RwLock<IndexCache>,
}

#[derive(Default)]
struct IndexCache {
    /// Bumped by every write. An index built from a listing taken before the
    /// bump is served but not kept.
    generation: u64,
    built: Option<(Instant, String)>,
}

impl RequestHandler for ChartRepo {
    fn serve(&self, req: Request<Body>) -> BoxFuture<'static, Result<Response<Body>, Error>> {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.route(req).await) })
    }
}

impl ChartRepo {
    pub fn new<S: Storage>(storage: S, options: ServerOptions) -> Result<Self> {
        if options.bearer_auth {
            bail!("bearer token authentication is not supported by this handler");
        }

        if options.username.is_some() != options.password.is_some() {
            bail!("basic auth needs both a username and a password");
        }

        if options.tls_cert.is_some() || options.tls_key.is_some() {
            tracing::warn!("TLS settings are ignored: TLS is terminated by API Gateway");
        }

        Ok(ChartRepo {
            inner: Arc::new(Inner {
                storage: Box::new(storage),
                options,
                index_cache: RwLock::new(IndexCache::default()),
            }),
        })
    }
}

fn is_read(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

impl Inner {
    async fn route(&self, req: Request<Body>) -> Response<Body> {
        let mut resp = self.route_inner(&req).await;

        if let Some(origin) = &self.options.cors_allow_origin {
            if let Ok(value) = origin.parse() {
                resp.headers_mut().insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
            }
        }

        resp
    }

    async fn route_inner(&self, req: &Request<Body>) -> Response<Body> {
        let ctx = self.options.context_path.as_str();

        let Some(path) = req.uri().path().strip_prefix(ctx) else {
            return json_error(StatusCode::NOT_FOUND, "not found");
        };

        let path = if path.is_empty() { "/" } else { path };
        let method = req.method();

        if path == "/health" && method == Method::GET {
            return json_response(StatusCode::OK, json!({ "healthy": true }));
        }

        if !self.authorized(req) {
            let mut resp = json_error(StatusCode::UNAUTHORIZED, "unauthorized");
            resp.headers_mut().insert(
                WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"ChartMuseum\""),
            );
            return resp;
        }

        if path == "/index.yaml" && is_read(method) {
            return match bounded(self.options.read_timeout, self.index()).await {
                Ok(text) => content(method, "application/x-yaml", text.into_bytes()),
                Err(e) => self.failure(e),
            };
        }

        if let Some(file) = path.strip_prefix("/charts/") {
            if !is_read(method) {
                return json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            }
            return self.download(method, file).await;
        }

        if self.options.enable_api {
            if path == "/api/charts" && method == Method::POST {
                return self.upload(req).await;
            }

            if let Some(rest) = path.strip_prefix("/api/charts/") {
                if method == Method::DELETE {
                    return self.delete(rest).await;
                }
            }
        }

        json_error(StatusCode::NOT_FOUND, "not found")
    }

    fn authorized(&self, req: &Request<Body>) -> bool {
        let (Some(user), Some(pass)) = (&self.options.username, &self.options.password) else {
            return true;
        };

        if self.options.anonymous_get && is_read(req.method()) {
            return true;
        }

        let Some(creds) = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|v| STANDARD.decode(v.trim()).ok())
        else {
            return false;
        };

        credentials_match(&creds, user, pass)
    }

    async fn download(&self, method: &Method, file: &str) -> Response<Body> {
        if file.is_empty() || file.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return json_error(StatusCode::BAD_REQUEST, "invalid chart file name");
        }

        match bounded(self.options.read_timeout, self.storage.get(file)).await {
            Ok(Some(data)) => {
                let ctype = if file.ends_with(".tgz") {
                    "application/x-tar"
                } else {
                    "application/octet-stream"
                };
                content(method, ctype, data)
            }
            Ok(None) => json_error(StatusCode::NOT_FOUND, "not found"),
            Err(e) => self.failure(e),
        }
    }

    async fn upload(&self, req: &Request<Body>) -> Response<Body> {
        let is_multipart = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("multipart/form-data"));

        if is_multipart {
            return json_error(
                StatusCode::BAD_REQUEST,
                format!(
                    "multipart uploads are not supported; send the `{}` file as the raw request body",
                    self.options.chart_post_form_field_name
                ),
            );
        }

        let data: &[u8] = req.body().as_ref();

        if data.len() > self.options.max_upload_size {
            return json_error(StatusCode::PAYLOAD_TOO_LARGE, "upload too large");
        }

        let meta = match ChartMeta::from_tarball(data) {
            Ok(m) => m,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("{e:#}")),
        };

        let key = meta.filename();
        let force = self.options.allow_force_overwrite && has_force_param(req);

        let result = bounded(self.options.write_timeout, async {
            if !(self.options.allow_overwrite || force) && self.storage.exists(&key).await? {
                return Ok::<_, anyhow::Error>(false);
            }

            self.storage.put(&key, data.to_vec()).await?;
            Ok::<_, anyhow::Error>(true)
        })
        .await;

        match result {
            Ok(true) => {
                tracing::info!("saved chart {key}");
                self.invalidate_index().await;
                json_response(StatusCode::CREATED, json!({ "saved": true }))
            }
            Ok(false) => json_error(StatusCode::CONFLICT, "file already exists"),
            Err(e) => self.failure(e),
        }
    }

    async fn delete(&self, rest: &str) -> Response<Body> {
        if self.options.disable_delete {
            return json_error(StatusCode::METHOD_NOT_ALLOWED, "deletion is disabled");
        }

        let Some((name, version)) = rest.split_once('/') else {
            return json_error(StatusCode::NOT_FOUND, "not found");
        };

        if name.is_empty() || version.is_empty() || version.contains('/') || name == ".." {
            return json_error(StatusCode::BAD_REQUEST, "invalid chart name or version");
        }

        let key = format!("{name}-{version}.tgz");

        match bounded(self.options.write_timeout, self.storage.delete(&key)).await {
            Ok(true) => {
                tracing::info!("deleted chart {key}");
                self.invalidate_index().await;
                json_response(StatusCode::OK, json!({ "deleted": true }))
            }
            Ok(false) => json_error(StatusCode::NOT_FOUND, "not found"),
            Err(e) => self.failure(e),
        }
    }

    async fn index(&self) -> Result<String> {
        let generation = {
            let cache = self.index_cache.read().await;

            if let (Some(interval), Some((built, text))) =
                (self.options.cache_interval, cache.built.as_ref())
            {
                if built.elapsed() < interval {
                    return Ok(text.clone());
                }
            }

            cache.generation
        };

        let charts = self.load_charts().await?;
        let text = render_index(&charts, &self.options)?;

        if self.options.cache_interval.is_some() {
            let mut cache = self.index_cache.write().await;

            if cache.generation == generation {
                cache.built = Some((Instant::now(), text.clone()));
            }
        }

        Ok(text)
    }

    async fn invalidate_index(&self) {
        let mut cache = self.index_cache.write().await;
        cache.generation += 1;
        cache.built = None;
    }

    /// Read the metadata of every chart archive within the configured depth.
    /// Objects that aren't chart archives are logged and left out.
    async fn load_charts(&self) -> Result<Vec<StoredChart>> {
        let mut charts = Vec::new();

        for key in self.storage.list().await? {
            if !key.ends_with(".tgz") || key.matches('/').count() > self.options.depth {
                continue;
            }

            // Gone since the listing.
            let Some(data) = self.storage.get(&key).await? else {
                continue;
            };

            match ChartMeta::from_tarball(&data) {
                Ok(meta) => charts.push(StoredChart { meta, key }),
                Err(e) => tracing::warn!("leaving {key} out of the index: {e:#}"),
            }
        }

        Ok(charts)
    }

    fn failure(&self, e: anyhow::Error) -> Response<Body> {
        if e.is::<tokio::time::error::Elapsed>() {
            tracing::warn!("storage operation timed out");
            return json_error(StatusCode::GATEWAY_TIMEOUT, "storage operation timed out");
        }

        tracing::error!("storage operation failed: {e:#}");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage operation failed")
    }
}

/// `given` is the decoded `user:pass` from a Basic authorization header.
fn credentials_match(given: &[u8], user: &str, pass: &str) -> bool {
    let expected = format!("{user}:{pass}");
    given.ct_eq(expected.as_bytes()).into()
}

async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await?,
        None => fut.await,
    }
}

fn has_force_param(req: &Request<Body>) -> bool {
    req.uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).any(|(k, _)| k == "force"))
        .unwrap_or(false)
}

fn content(method: &Method, ctype: &'static str, data: Vec<u8>) -> Response<Body> {
    let body = if method == Method::HEAD {
        Body::Empty
    } else {
        Body::Binary(data)
    };

    let mut resp = Response::new(body);
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(ctype));
    resp
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    let mut resp = Response::new(Body::Text(value.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn json_error(status: StatusCode, message: impl std::fmt::Display) -> Response<Body> {
    json_response(status, json!({ "error": message.to_string() }))
}

/// The `Chart.yaml` fields that make it into the index. Everything else in
/// the file is ignored.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_version: Option<String>,
    name: String,
    version: String,
    #[serde(
        default,
        deserialize_with = "loose_string",
        skip_serializing_if = "Option::is_none"
    )]
    app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    chart_type: Option<String>,
}

/// YAML reads an unquoted `appVersion: 2` as a number.
fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_yaml::Value;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(serde::de::Error::custom("expected a string")),
    }
}

impl ChartMeta {
    /// Pull the metadata out of the top-level `Chart.yaml` of a gzipped chart
    /// tarball.
    fn from_tarball(data: &[u8]) -> Result<Self> {
        let mut archive = tar::Archive::new(GzDecoder::new(data));

        for entry in archive
            .entries()
            .map_err(|e| anyhow!("not a chart archive: {e}"))?
        {
            let mut entry = entry.map_err(|e| anyhow!("not a chart archive: {e}"))?;
            let path = entry.path()?.into_owned();

            // `mychart/Chart.yaml`, not a subchart's.
            if path.components().count() != 2 || !path.ends_with("Chart.yaml") {
                continue;
            }

            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            return Self::from_chart_yaml(&text);
        }

        bail!("chart archive has no Chart.yaml")
    }

    fn from_chart_yaml(text: &str) -> Result<Self> {
        let meta: ChartMeta = serde_yaml::from_str(text).context("invalid Chart.yaml")?;

        if meta.name.is_empty() || meta.version.is_empty() {
            bail!("Chart.yaml needs a non-empty name and version");
        }

        if meta.name.contains('/') || meta.version.contains('/') {
            bail!("chart name and version may not contain `/`");
        }

        Ok(meta)
    }

    fn filename(&self) -> String {
        format!("{}-{}.tgz", self.name, self.version)
    }
}

struct StoredChart {
    meta: ChartMeta,
    key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile<'a> {
    api_version: &'static str,
    entries: BTreeMap<&'a str, Vec<IndexEntry<'a>>>,
}

#[derive(Serialize)]
struct IndexEntry<'a> {
    #[serde(flatten)]
    meta: &'a ChartMeta,
    urls: Vec<String>,
}

/// Chart versions are SemVer 2, optionally `v`-prefixed. Anything else sorts
/// below every real version, and as plain text among its peers.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| Version::parse(v.strip_prefix('v').unwrap_or(v));

    match (parse(a), parse(b)) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn render_index(charts: &[StoredChart], options: &ServerOptions) -> Result<String> {
    let mut by_name: BTreeMap<&str, Vec<&StoredChart>> = BTreeMap::new();

    for chart in charts {
        by_name.entry(chart.meta.name.as_str()).or_default().push(chart);
    }

    let mut entries = BTreeMap::new();

    for (name, mut versions) in by_name {
        versions.sort_by(|a, b| compare_versions(&b.meta.version, &a.meta.version));

        if options.index_limit > 0 {
            versions.truncate(options.index_limit);
        }

        let versions: Vec<IndexEntry> = versions
            .into_iter()
            .map(|chart| IndexEntry {
                meta: &chart.meta,
                urls: vec![match &options.chart_url {
                    Some(base) => format!("{}/charts/{}", base.trim_end_matches('/'), chart.key),
                    None => format!("charts/{}", chart.key),
                }],
            })
            .collect();

        entries.insert(name, versions);
    }

    let index = IndexFile {
        api_version: "v1",
        entries,
    };

    Ok(serde_yaml::to_string(&index)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use flate2::{write::GzEncoder, Compression};
    use std::sync::atomic::{self, AtomicBool};
    use tokio::sync::Notify;

    fn tarball_with(dir: &str, chart_yaml: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

        let mut header = tar::Header::new_gnu();
        header.set_size(chart_yaml.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{dir}/Chart.yaml"), chart_yaml.as_bytes())
            .unwrap();

        builder.into_inner().unwrap().finish().unwrap()
    }

    fn tarball(name: &str, version: &str) -> Vec<u8> {
        tarball_with(
            name,
            &format!("apiVersion: v2\nname: {name}\n# a comment\nversion: \"{version}\"\ndependencies:\n  - name: sub\n    version: 9.9.9\n"),
        )
    }

    fn repo_with(options: ServerOptions) -> (ChartRepo, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::default());
        let repo = ChartRepo::new(storage.clone(), options).unwrap();
        (repo, storage)
    }

    async fn call(repo: &ChartRepo, method: &str, uri: &str, body: Body) -> Response<Body> {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .unwrap();
        repo.serve(req).await.unwrap()
    }

    fn text(resp: &Response<Body>) -> String {
        String::from_utf8_lossy(resp.body().as_ref()).into_owned()
    }

    async fn index_of(repo: &ChartRepo) -> serde_yaml::Value {
        let resp = call(repo, "GET", "/index.yaml", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::OK);
        serde_yaml::from_str(&text(&resp)).unwrap()
    }

    fn versions_of(index: &serde_yaml::Value, name: &str) -> Vec<String> {
        index["entries"][name]
            .as_sequence()
            .map(|seq| {
                seq.iter()
                    .filter_map(|e| e["version"].as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn chart_yaml_top_level_only() {
        let meta = ChartMeta::from_tarball(&tarball("mychart", "1.0.0")).unwrap();
        assert_eq!(meta.name, "mychart");
        assert_eq!(meta.version, "1.0.0");
        assert_eq!(meta.api_version.as_deref(), Some("v2"));
        assert_eq!(meta.filename(), "mychart-1.0.0.tgz");
    }

    #[test]
    fn chart_yaml_is_real_yaml() {
        let meta = ChartMeta::from_chart_yaml("{name: mychart, version: 1.0.0}\n").unwrap();
        assert_eq!((meta.name.as_str(), meta.version.as_str()), ("mychart", "1.0.0"));

        let meta = ChartMeta::from_chart_yaml(
            "name:\n  split-lines\nversion: '2.1.0'\nappVersion: 3\ndescription: |\n  first line\n  second line\n",
        )
        .unwrap();
        assert_eq!(meta.name, "split-lines");
        assert_eq!(meta.version, "2.1.0");
        assert_eq!(meta.app_version.as_deref(), Some("3"));
        assert_eq!(meta.description.as_deref(), Some("first line\nsecond line\n"));
    }

    #[test]
    fn garbage_is_not_a_chart() {
        assert!(ChartMeta::from_tarball(b"definitely not gzip").is_err());
        assert!(ChartMeta::from_chart_yaml("name: x\n").is_err());
        assert!(ChartMeta::from_chart_yaml("name: ''\nversion: 1.0.0\n").is_err());
        assert!(ChartMeta::from_chart_yaml("name: a/b\nversion: 1.0.0\n").is_err());
    }

    #[test]
    fn versions_sort_by_semver_precedence() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0-rc.1", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0-rc.10", "1.0.0-rc.9"), Ordering::Greater);
        assert_eq!(compare_versions("v2.0.0", "1.5.0"), Ordering::Greater);
        assert_eq!(compare_versions("latest", "0.0.1"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0", "2.0.0"), Ordering::Equal);
    }

    #[tokio::test]
    async fn index_limit_keeps_the_release_over_its_prerelease() {
        let (repo, storage) = repo_with(ServerOptions {
            index_limit: 1,
            ..Default::default()
        });
        storage.insert("a-1.0.0.tgz", &tarball("a", "1.0.0"));
        storage.insert("a-1.0.0-rc.1.tgz", &tarball("a", "1.0.0-rc.1"));

        assert_eq!(versions_of(&index_of(&repo).await, "a"), ["1.0.0"]);
    }

    #[tokio::test]
    async fn index_names_come_from_chart_yaml() {
        let (repo, storage) = repo_with(ServerOptions::default());

        let resp = call(
            &repo,
            "POST",
            "/api/charts",
            Body::Binary(tarball("k8s-1-dashboard", "2.0.0")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        // Whatever the object happens to be called.
        storage.insert("renamed.tgz", &tarball("other", "0.3.0"));

        let index = index_of(&repo).await;
        assert_eq!(versions_of(&index, "k8s-1-dashboard"), ["2.0.0"]);
        assert_eq!(versions_of(&index, "other"), ["0.3.0"]);
        assert_eq!(
            index["entries"]["other"][0]["urls"][0].as_str(),
            Some("charts/renamed.tgz")
        );
        assert!(index["entries"]["k8s"].is_null());
    }

    #[tokio::test]
    async fn index_rendering() {
        let keys = [
            ("a-1.9.0.tgz", tarball("a", "1.9.0")),
            ("a-1.10.0.tgz", tarball("a", "1.10.0")),
            ("nested/b-0.1.0.tgz", tarball("b", "0.1.0")),
            ("notes.txt", b"not a chart".to_vec()),
            ("broken.tgz", b"not a chart either".to_vec()),
        ];

        let (repo, storage) = repo_with(ServerOptions {
            index_limit: 1,
            ..Default::default()
        });
        for (key, data) in &keys {
            storage.insert(key, data);
        }

        let index = index_of(&repo).await;
        assert_eq!(index["apiVersion"].as_str(), Some("v1"));
        assert_eq!(versions_of(&index, "a"), ["1.10.0"]);
        assert_eq!(index["entries"]["a"][0]["apiVersion"].as_str(), Some("v2"));
        assert!(index["entries"]["b"].is_null());

        let (repo, storage) = repo_with(ServerOptions {
            depth: 1,
            chart_url: Some("https://charts.example.com/".to_owned()),
            ..Default::default()
        });
        for (key, data) in &keys {
            storage.insert(key, data);
        }

        let index = index_of(&repo).await;
        assert_eq!(versions_of(&index, "a"), ["1.10.0", "1.9.0"]);
        assert_eq!(
            index["entries"]["b"][0]["urls"][0].as_str(),
            Some("https://charts.example.com/charts/nested/b-0.1.0.tgz")
        );

        let index: serde_yaml::Value =
            serde_yaml::from_str(&render_index(&[], &ServerOptions::default()).unwrap()).unwrap();
        assert_eq!(index["entries"].as_mapping().map(|m| m.len()), Some(0));
    }

    #[test]
    fn rendered_values_stay_strings() {
        let charts = [StoredChart {
            meta: ChartMeta {
                api_version: None,
                name: "true".to_owned(),
                version: "1.10".to_owned(),
                app_version: Some("null".to_owned()),
                description: None,
                chart_type: None,
            },
            key: "true-1.10.tgz".to_owned(),
        }];

        let text = render_index(&charts, &ServerOptions::default()).unwrap();
        let index: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(versions_of(&index, "true"), ["1.10"]);
        assert_eq!(index["entries"]["true"][0]["name"].as_str(), Some("true"));
        assert_eq!(index["entries"]["true"][0]["appVersion"].as_str(), Some("null"));
    }

    #[tokio::test]
    async fn upload_download_delete() {
        let (repo, storage) = repo_with(ServerOptions::default());
        let tgz = tarball("mychart", "1.0.0");

        let resp = call(&repo, "POST", "/api/charts", Body::Binary(tgz.clone())).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(storage.contains("mychart-1.0.0.tgz"));

        let resp = call(&repo, "POST", "/api/charts", Body::Binary(tgz.clone())).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = call(&repo, "POST", "/api/charts?force", Body::Binary(tgz.clone())).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = call(&repo, "GET", "/charts/mychart-1.0.0.tgz", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/x-tar");
        assert_eq!(resp.body().as_ref(), tgz.as_slice());

        let resp = call(&repo, "GET", "/index.yaml", Body::Empty).await;
        assert!(text(&resp).contains("charts/mychart-1.0.0.tgz"));

        let resp = call(&repo, "DELETE", "/api/charts/mychart/1.0.0", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!storage.contains("mychart-1.0.0.tgz"));

        let resp = call(&repo, "GET", "/charts/mychart-1.0.0.tgz", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn flow_style_chart_yaml_uploads() {
        let (repo, storage) = repo_with(ServerOptions::default());
        let tgz = tarball_with("mychart", "{apiVersion: v2, name: mychart, version: 1.2.3}\n");

        let resp = call(&repo, "POST", "/api/charts", Body::Binary(tgz)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(storage.contains("mychart-1.2.3.tgz"));
    }

    #[tokio::test]
    async fn upload_limits() {
        let (repo, _) = repo_with(ServerOptions {
            max_upload_size: 16,
            ..Default::default()
        });

        let resp = call(&repo, "POST", "/api/charts", Body::Binary(tarball("big", "1.0.0"))).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let resp = call(&repo, "POST", "/api/charts", Body::Binary(b"tiny".to_vec())).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn api_and_delete_switches() {
        let (repo, storage) = repo_with(ServerOptions {
            disable_delete: true,
            ..Default::default()
        });
        storage.insert("a-1.0.0.tgz", b"x");

        let resp = call(&repo, "DELETE", "/api/charts/a/1.0.0", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(storage.contains("a-1.0.0.tgz"));

        let (repo, _) = repo_with(ServerOptions {
            enable_api: false,
            ..Default::default()
        });
        let resp = call(&repo, "POST", "/api/charts", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    fn with_basic_auth(method: &str, uri: &str, creds: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, format!("Basic {}", STANDARD.encode(creds)))
            .body(Body::Empty)
            .unwrap()
    }

    #[tokio::test]
    async fn basic_auth_and_context_path() {
        let (repo, storage) = repo_with(ServerOptions {
            username: Some("admin".to_owned()),
            password: Some("secret".to_owned()),
            anonymous_get: true,
            context_path: "/helm".to_owned(),
            cors_allow_origin: Some("*".to_owned()),
            ..Default::default()
        });
        storage.insert("a-1.0.0.tgz", b"x");

        let resp = call(&repo, "GET", "/charts/a-1.0.0.tgz", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = call(&repo, "GET", "/helm/charts/a-1.0.0.tgz", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let resp = call(&repo, "DELETE", "/helm/api/charts/a/1.0.0", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key(WWW_AUTHENTICATE));

        for wrong in ["admin:secreT", "admin:secret2", "admin:", "admin"] {
            let req = with_basic_auth("DELETE", "/helm/api/charts/a/1.0.0", wrong);
            let resp = repo.serve(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{wrong}");
        }

        let req = with_basic_auth("DELETE", "/helm/api/charts/a/1.0.0", "admin:secret");
        let resp = repo.serve(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn credentials_compare_whole_values() {
        assert!(credentials_match(b"admin:secret", "admin", "secret"));
        assert!(credentials_match(b"ad:min:pw", "ad", "min:pw"));
        assert!(!credentials_match(b"admin:secreT", "admin", "secret"));
        assert!(!credentials_match(b"admin:secre", "admin", "secret"));
        assert!(!credentials_match(b"admin:secrets", "admin", "secret"));
        assert!(!credentials_match(b"", "admin", "secret"));
    }

    #[tokio::test]
    async fn anonymous_reads_include_head() {
        let (repo, storage) = repo_with(ServerOptions {
            username: Some("admin".to_owned()),
            password: Some("secret".to_owned()),
            anonymous_get: true,
            ..Default::default()
        });
        storage.insert("a-1.0.0.tgz", &tarball("a", "1.0.0"));

        let resp = call(&repo, "HEAD", "/index.yaml", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.body().as_ref().is_empty());

        let resp = call(&repo, "HEAD", "/charts/a-1.0.0.tgz", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = call(&repo, "POST", "/api/charts", Body::Binary(tarball("b", "1.0.0"))).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn head_has_no_body() {
        let (repo, storage) = repo_with(ServerOptions::default());
        storage.insert("a-1.0.0.tgz", b"abc");

        let resp = call(&repo, "HEAD", "/charts/a-1.0.0.tgz", Body::Empty).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.body().as_ref().is_empty());
    }

    #[tokio::test]
    async fn index_cache_is_invalidated_by_writes() {
        let (repo, storage) = repo_with(ServerOptions {
            cache_interval: Some(Duration::from_secs(3600)),
            ..Default::default()
        });

        let index = index_of(&repo).await;
        assert_eq!(index["entries"].as_mapping().map(|m| m.len()), Some(0));

        // Out-of-band writes are not visible until the cache expires...
        storage.insert("a-1.0.0.tgz", &tarball("a", "1.0.0"));
        let resp = call(&repo, "GET", "/index.yaml", Body::Empty).await;
        assert!(!text(&resp).contains("a-1.0.0.tgz"));

        // ...but our own writes are.
        let tgz = tarball("b", "2.0.0");
        call(&repo, "POST", "/api/charts", Body::Binary(tgz)).await;
        let resp = call(&repo, "GET", "/index.yaml", Body::Empty).await;
        assert!(text(&resp).contains("a-1.0.0.tgz"));
        assert!(text(&resp).contains("b-2.0.0.tgz"));
    }

    /// Holds the first listing open until told to continue.
    #[derive(Default)]
    struct PausedListing {
        inner: MemoryStorage,
        released: AtomicBool,
        listed: Notify,
        release: Notify,
    }

    impl Storage for PausedListing {
        fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
            self.inner.get(key)
        }

        fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
            self.inner.exists(key)
        }

        fn put<'a>(&'a self, key: &'a str, data: Vec<u8>) -> BoxFuture<'a, Result<()>> {
            self.inner.put(key, data)
        }

        fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
            self.inner.delete(key)
        }

        fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
            Box::pin(async move {
                let keys = self.inner.list().await?;

                if !self.released.swap(true, atomic::Ordering::SeqCst) {
                    self.listed.notify_one();
                    self.release.notified().await;
                }

                Ok(keys)
            })
        }
    }

    #[tokio::test]
    async fn write_during_index_build_is_not_cached_over() {
        let storage = Arc::new(PausedListing::default());
        let repo = ChartRepo::new(
            storage.clone(),
            ServerOptions {
                cache_interval: Some(Duration::from_secs(3600)),
                ..Default::default()
            },
        )
        .unwrap();

        let building = tokio::spawn({
            let repo = repo.clone();
            async move { text(&call(&repo, "GET", "/index.yaml", Body::Empty).await) }
        });

        // The listing above is taken; now write before it finishes.
        storage.listed.notified().await;
        let resp = call(&repo, "POST", "/api/charts", Body::Binary(tarball("late", "1.0.0"))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        storage.release.notify_one();

        let stale = building.await.unwrap();
        assert!(!stale.contains("late-1.0.0.tgz"));

        let index = index_of(&repo).await;
        assert_eq!(versions_of(&index, "late"), ["1.0.0"]);
    }

    #[test]
    fn bearer_auth_is_refused() {
        let result = ChartRepo::new(
            MemoryStorage::default(),
            ServerOptions {
                bearer_auth: true,
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }
}
